//! The postulate ledger: the "currently visiting" set for structural
//! recursion over mode graphs.
//!
//! A traversal of a possibly cyclic mode first asks whether its operand pair
//! is already postulated. If so it short-circuits; otherwise it records the
//! pair, recurses, and releases back to its mark on every return path. The
//! [`PostulateScope`] guard makes the release part of `Drop`, so early
//! returns and `?` cannot leak entries.
//!
//! Released entries go to a free list and are reused before any fresh entry
//! is charged to the arena's transient front.

use std::mem::size_of;
use std::ops::{Deref, DerefMut};

use crate::arena::Arena;
use crate::error::Abend;
use crate::registry::MoidId;

#[derive(Debug, Clone, Copy)]
struct Postulate {
    a: MoidId,
    b: Option<MoidId>,
    next: Option<usize>,
}

/// Position of the active list top at some moment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Checkpoint(Option<usize>);

#[derive(Debug, Default)]
pub struct PostulateLedger {
    slots: Vec<Postulate>,
    top: Option<usize>,
    free: Option<usize>,
}

impl PostulateLedger {
    pub fn new() -> Self {
        PostulateLedger::default()
    }

    /// Forgets both the active list and the free list.
    pub fn reset(&mut self) {
        self.slots.clear();
        self.top = None;
        self.free = None;
    }

    pub fn mark(&self) -> Checkpoint {
        Checkpoint(self.top)
    }

    /// Prepends `(a, b)` to the active list.
    pub fn record(&mut self, arena: &Arena, a: MoidId, b: Option<MoidId>) -> Result<(), Abend> {
        let entry = Postulate { a, b, next: self.top };
        let index = match self.free {
            Some(index) => {
                self.free = self.slots[index].next;
                self.slots[index] = entry;
                index
            }
            None => {
                arena.allocate_temp(size_of::<Postulate>())?;
                self.slots.push(entry);
                self.slots.len() - 1
            }
        };
        self.top = Some(index);
        Ok(())
    }

    fn active(&self) -> impl Iterator<Item = &Postulate> {
        let mut cursor = self.top;
        std::iter::from_fn(move || {
            let index = cursor?;
            let entry = &self.slots[index];
            cursor = entry.next;
            Some(entry)
        })
    }

    pub fn find_pair(&self, a: MoidId, b: Option<MoidId>) -> bool {
        self.active().any(|p| p.a == a && p.b == b)
    }

    pub fn find(&self, a: MoidId) -> bool {
        self.active().any(|p| p.a == a)
    }

    /// Moves every entry recorded since `mark` onto the free list.
    pub fn release(&mut self, mark: Checkpoint) {
        while self.top != mark.0 {
            let Some(index) = self.top else {
                break;
            };
            self.top = self.slots[index].next;
            self.slots[index].next = self.free;
            self.free = Some(index);
        }
    }

    pub fn active_len(&self) -> usize {
        self.active().count()
    }

    /// Entries ever charged to the arena.
    pub fn allocated(&self) -> usize {
        self.slots.len()
    }

    /// Opens a scope that releases to the current mark when dropped.
    pub fn scope(&mut self) -> PostulateScope<'_> {
        let mark = self.mark();
        PostulateScope { ledger: self, mark }
    }
}

pub struct PostulateScope<'l> {
    ledger: &'l mut PostulateLedger,
    mark: Checkpoint,
}

impl Deref for PostulateScope<'_> {
    type Target = PostulateLedger;

    fn deref(&self) -> &PostulateLedger {
        self.ledger
    }
}

impl DerefMut for PostulateScope<'_> {
    fn deref_mut(&mut self) -> &mut PostulateLedger {
        self.ledger
    }
}

impl Drop for PostulateScope<'_> {
    fn drop(&mut self) {
        self.ledger.release(self.mark);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::MemoryBudgets;

    fn moid(n: u32) -> MoidId {
        MoidId::from_index(n as usize)
    }

    #[test]
    fn recorded_pair_is_found_until_released() {
        let arena = Arena::init(&MemoryBudgets::default()).unwrap();
        let mut ledger = PostulateLedger::new();
        let mark = ledger.mark();
        ledger.record(&arena, moid(1), Some(moid(2))).unwrap();
        assert!(ledger.find_pair(moid(1), Some(moid(2))));
        assert!(!ledger.find_pair(moid(2), Some(moid(1))));
        assert!(ledger.find(moid(1)));
        ledger.release(mark);
        assert_eq!(ledger.active_len(), 0);
        assert!(!ledger.find(moid(1)));
    }

    #[test]
    fn release_returns_to_checkpoint_length() {
        let arena = Arena::init(&MemoryBudgets::default()).unwrap();
        let mut ledger = PostulateLedger::new();
        ledger.record(&arena, moid(1), None).unwrap();
        ledger.record(&arena, moid(2), None).unwrap();
        let mark = ledger.mark();
        let before = ledger.active_len();
        for n in 3..8 {
            ledger.record(&arena, moid(n), Some(moid(n + 1))).unwrap();
        }
        ledger.release(mark);
        assert_eq!(ledger.active_len(), before);
        assert!(ledger.find(moid(2)));
    }

    #[test]
    fn recycling_does_not_grow_transient_use() {
        let arena = Arena::init(&MemoryBudgets::default()).unwrap();
        let mut ledger = PostulateLedger::new();
        let mark = ledger.mark();
        ledger.record(&arena, moid(0), None).unwrap();
        ledger.release(mark);
        let charged = arena.temp_in_use();
        for n in 0..10_000 {
            let mark = ledger.mark();
            ledger.record(&arena, moid(n), Some(moid(n + 1))).unwrap();
            ledger.release(mark);
        }
        assert_eq!(ledger.allocated(), 1);
        assert_eq!(arena.temp_in_use(), charged);
    }

    fn visit(ledger: &mut PostulateLedger, arena: &Arena, depth: u32) -> Result<(), Abend> {
        let mut scope = ledger.scope();
        scope.record(arena, moid(depth), None)?;
        if depth == 3 {
            return Err(Abend::new("stop"));
        }
        visit(&mut scope, arena, depth + 1)
    }

    #[test]
    fn scope_releases_on_error_return() {
        let arena = Arena::init(&MemoryBudgets::default()).unwrap();
        let mut ledger = PostulateLedger::new();
        assert!(visit(&mut ledger, &arena, 0).is_err());
        assert_eq!(ledger.active_len(), 0);
        assert_eq!(ledger.allocated(), 4);
    }

    #[test]
    fn reset_forgets_everything() {
        let arena = Arena::init(&MemoryBudgets::default()).unwrap();
        let mut ledger = PostulateLedger::new();
        ledger.record(&arena, moid(1), None).unwrap();
        ledger.reset();
        assert_eq!(ledger.active_len(), 0);
        assert_eq!(ledger.allocated(), 0);
    }
}
