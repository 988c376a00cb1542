//! Two-front bump allocator.
//!
//! One reservation is laid out as four adjoining regions:
//!
//! ```text
//!   0        heap          handles        frame stack     expression stack   total
//!   |--------------------|--------------|---------------|------------------|
//!    fixed ->                                                    <- temp
//! ```
//!
//! Long-lived compiler records are charged at the fixed pointer, which grows
//! upward inside the heap region. Transient records (postulates) are charged
//! at the temp pointer, which grows downward from the end of the reservation.
//! Both fronts share one guard: the gap between them may never shrink to the
//! reserve margin. Nothing is released individually; [`Arena::discard`]
//! drops the whole reservation.
//!
//! The arena hands out offsets. Typed records live in index-addressed stores
//! (see `registry`), and every push into such a store is charged here first,
//! so capacity and exhaustion behave exactly as for raw memory.

use std::cell::Cell;

use tracing::debug;

use crate::error::Abend;
use crate::options::MemoryBudgets;

pub const ALIGNMENT: usize = 8;

/// Rounds `n` up to the alignment granularity, or `None` past `usize::MAX`.
pub const fn align(n: usize) -> Option<usize> {
    match n.checked_add(ALIGNMENT - 1) {
        Some(m) => Some(m & !(ALIGNMENT - 1)),
        None => None,
    }
}

fn aligned(n: usize) -> Result<usize, Abend> {
    align(n).ok_or_else(Abend::out_of_core)
}

/// Half-open byte range `[start, end)` inside the reservation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Region {
    pub start: usize,
    pub end: usize,
}

impl Region {
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

#[derive(Debug)]
pub struct Arena {
    heap: Region,
    handles: Region,
    frame: Region,
    stack: Region,
    total: usize,
    reserve: usize,
    fixed: Cell<usize>,
    temp: Cell<usize>,
    active: Cell<bool>,
    /// Cleared once the evaluator starts; later long-lived charges are a bug.
    fluid: Cell<bool>,
}

impl Arena {
    /// Lays out a fresh reservation from the configured budgets. Budgets
    /// whose sum does not fit the address space are out of core.
    pub fn init(budgets: &MemoryBudgets) -> Result<Self, Abend> {
        let heap_size = aligned(budgets.heap)?;
        let handle_size = aligned(budgets.handles)?;
        let frame_size = aligned(budgets.frame)?;
        let stack_size = aligned(budgets.stack)?;
        let total = [handle_size, frame_size, stack_size]
            .into_iter()
            .try_fold(heap_size, usize::checked_add)
            .ok_or_else(Abend::out_of_core)?;
        let heap = Region {
            start: 0,
            end: heap_size,
        };
        let handles = Region {
            start: heap.end,
            end: heap.end + handle_size,
        };
        let frame = Region {
            start: handles.end,
            end: handles.end + frame_size,
        };
        let stack = Region {
            start: frame.end,
            end: frame.end + stack_size,
        };
        debug!(total, heap = heap_size, handles = handle_size, "arena initialised");
        Ok(Arena {
            heap,
            handles,
            frame,
            stack,
            total,
            reserve: budgets.overhead,
            fixed: Cell::new(ALIGNMENT),
            temp: Cell::new(total),
            active: Cell::new(true),
            fluid: Cell::new(true),
        })
    }

    /// Charges `n` bytes to the long-lived front and returns the prior
    /// offset.
    pub fn allocate_fixed(&self, n: usize) -> Result<usize, Abend> {
        self.check_active()?;
        if !self.fluid.get() {
            return Err(Abend::new("internal consistency check failure")
                .with_info("allocation after the heap was sealed"));
        }
        let prior = self.fixed.get();
        let next = prior
            .checked_add(aligned(n)?)
            .ok_or_else(Abend::out_of_core)?;
        if next >= self.heap.end.saturating_sub(self.reserve) || !self.gap_ok(next, self.temp.get())
        {
            return Err(Abend::out_of_core());
        }
        self.fixed.set(next);
        Ok(prior)
    }

    /// Charges `n` bytes to the transient front and returns the new offset.
    pub fn allocate_temp(&self, n: usize) -> Result<usize, Abend> {
        self.check_active()?;
        let next = self
            .temp
            .get()
            .checked_sub(aligned(n)?)
            .ok_or_else(Abend::out_of_core)?;
        if !self.gap_ok(self.fixed.get(), next) {
            return Err(Abend::out_of_core());
        }
        self.temp.set(next);
        Ok(next)
    }

    fn gap_ok(&self, fixed: usize, temp: usize) -> bool {
        temp > fixed && temp - fixed > self.reserve
    }

    fn check_active(&self) -> Result<(), Abend> {
        if !self.active.get() {
            return Err(Abend::new("internal consistency check failure")
                .with_info("allocation from a discarded arena"));
        }
        Ok(())
    }

    /// Freezes the long-lived front before the evaluator takes over. The
    /// transient front stays usable.
    pub fn seal(&self) {
        self.fluid.set(false);
    }

    pub fn is_sealed(&self) -> bool {
        !self.fluid.get()
    }

    /// Releases the reservation. Only restart and session teardown call this.
    pub fn discard(&self) {
        debug!(
            fixed = self.fixed.get(),
            temp = self.temp.get(),
            "arena discarded"
        );
        self.fixed.set(0);
        self.temp.set(0);
        self.active.set(false);
    }

    pub fn is_active(&self) -> bool {
        self.active.get()
    }

    pub fn fixed_pointer(&self) -> usize {
        self.fixed.get()
    }

    pub fn temp_pointer(&self) -> usize {
        self.temp.get()
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn reserve(&self) -> usize {
        self.reserve
    }

    pub fn heap_region(&self) -> Region {
        self.heap
    }

    pub fn handle_region(&self) -> Region {
        self.handles
    }

    pub fn frame_region(&self) -> Region {
        self.frame
    }

    pub fn stack_region(&self) -> Region {
        self.stack
    }

    /// Bytes charged to the long-lived front so far.
    pub fn fixed_in_use(&self) -> usize {
        self.fixed.get().saturating_sub(ALIGNMENT)
    }

    /// Bytes charged to the transient front so far.
    pub fn temp_in_use(&self) -> usize {
        if self.active.get() {
            self.total - self.temp.get()
        } else {
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::{KILOBYTE, MIN_MEM_SIZE};

    fn small_budgets() -> MemoryBudgets {
        MemoryBudgets {
            heap: 512 * KILOBYTE,
            handles: 64 * KILOBYTE,
            frame: 64 * KILOBYTE,
            stack: 64 * KILOBYTE,
            overhead: MIN_MEM_SIZE,
        }
    }

    #[test]
    fn aligns_to_granularity() {
        assert_eq!(align(0), Some(0));
        assert_eq!(align(1), Some(8));
        assert_eq!(align(8), Some(8));
        assert_eq!(align(13), Some(16));
        assert_eq!(align(usize::MAX - 3), None);
    }

    #[test]
    fn regions_adjoin() {
        let arena = Arena::init(&small_budgets()).unwrap();
        assert_eq!(arena.heap_region().end, arena.handle_region().start);
        assert_eq!(arena.handle_region().end, arena.frame_region().start);
        assert_eq!(arena.frame_region().end, arena.stack_region().start);
        assert_eq!(arena.stack_region().end, arena.total());
        assert_eq!(arena.fixed_pointer(), ALIGNMENT);
        assert_eq!(arena.temp_pointer(), arena.total());
    }

    #[test]
    fn fixed_returns_prior_and_temp_returns_new() {
        let arena = Arena::init(&small_budgets()).unwrap();
        assert_eq!(arena.allocate_fixed(3).unwrap(), ALIGNMENT);
        assert_eq!(arena.allocate_fixed(8).unwrap(), 2 * ALIGNMENT);
        let total = arena.total();
        assert_eq!(arena.allocate_temp(5).unwrap(), total - 8);
        assert_eq!(arena.allocate_temp(16).unwrap(), total - 24);
    }

    #[test]
    fn fixed_front_fails_at_heap_reserve_without_committing() {
        let budgets = small_budgets();
        let arena = Arena::init(&budgets).unwrap();
        let capacity = budgets.heap - budgets.overhead - ALIGNMENT;
        // Everything strictly below the limit succeeds.
        for _ in 0..(capacity / 1024 - 1) {
            arena.allocate_fixed(1024).unwrap();
        }
        let before = arena.fixed_pointer();
        assert!(arena.allocate_fixed(2048).is_err());
        assert_eq!(arena.fixed_pointer(), before);
    }

    #[test]
    fn fronts_may_not_meet_inside_the_reserve() {
        let budgets = small_budgets();
        let arena = Arena::init(&budgets).unwrap();
        let room = arena.total() - ALIGNMENT - budgets.overhead;
        arena.allocate_temp(room - 64).unwrap();
        let before = arena.temp_pointer();
        let error = arena.allocate_temp(64).unwrap_err();
        assert_eq!(error.reason, "out of core");
        assert_eq!(arena.temp_pointer(), before);
        assert!(arena.allocate_fixed(128).is_err());
    }

    #[test]
    fn discard_zeroes_and_deactivates() {
        let arena = Arena::init(&small_budgets()).unwrap();
        arena.allocate_fixed(64).unwrap();
        arena.discard();
        assert!(!arena.is_active());
        assert_eq!(arena.fixed_pointer(), 0);
        assert_eq!(arena.temp_pointer(), 0);
        assert!(arena.allocate_fixed(8).is_err());
    }

    #[test]
    fn sealed_arena_refuses_long_lived_charges() {
        let arena = Arena::init(&small_budgets()).unwrap();
        arena.seal();
        assert!(arena.is_sealed());
        let error = arena.allocate_fixed(8).unwrap_err();
        assert_eq!(error.reason, "internal consistency check failure");
        assert_eq!(arena.fixed_pointer(), ALIGNMENT);
        arena.allocate_temp(8).unwrap();
    }

    #[test]
    fn overflowing_budgets_are_out_of_core() {
        let huge = MemoryBudgets {
            heap: usize::MAX / 2 + 8,
            handles: usize::MAX / 2 + 8,
            ..small_budgets()
        };
        assert_eq!(Arena::init(&huge).unwrap_err().reason, "out of core");
        let unalignable = MemoryBudgets {
            stack: usize::MAX,
            ..small_budgets()
        };
        assert_eq!(Arena::init(&unalignable).unwrap_err().reason, "out of core");
    }

    #[test]
    fn oversized_charge_is_out_of_core() {
        let arena = Arena::init(&small_budgets()).unwrap();
        assert_eq!(arena.allocate_fixed(usize::MAX).unwrap_err().reason, "out of core");
        assert_eq!(arena.allocate_temp(usize::MAX - 4).unwrap_err().reason, "out of core");
        assert_eq!(arena.fixed_pointer(), ALIGNMENT);
        assert_eq!(arena.temp_pointer(), arena.total());
    }
}
