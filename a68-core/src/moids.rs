//! Structural algorithms over mode graphs: equivalence, size,
//! stringification and well-formedness.
//!
//! Mode graphs are cyclic whenever a program declares a recursive mode, so
//! every traversal here follows the postulate protocol: check the pair,
//! record it inside a [`PostulateScope`](crate::postulate::PostulateScope),
//! recurse, and let the scope release on return.

use crate::arena::Arena;
use crate::error::Abend;
use crate::postulate::PostulateLedger;
use crate::registry::{MoidId, MoidKind, PackEntry, Registry, ScopeId};

/// Width budget for modes quoted in diagnostics.
pub const MOID_ERROR_WIDTH: usize = 80;

/// Size of a name (REF), a procedure value or a row descriptor.
pub const REF_SIZE: usize = 16;
/// Size of the mode selector in front of a united value.
pub const UNION_OFFSET: usize = 8;

pub fn standard_size(symbol: &str) -> usize {
    match symbol {
        "INT" | "REAL" => 8,
        "BOOL" | "CHAR" => 4,
        "STRING" => REF_SIZE,
        _ => 0,
    }
}

/// Borrowed view over the mode store plus the ledger it needs.
pub struct Modes<'s> {
    pub registry: &'s Registry,
    pub ledger: &'s mut PostulateLedger,
    pub arena: &'s Arena,
}

impl<'s> Modes<'s> {
    pub fn new(registry: &'s Registry, ledger: &'s mut PostulateLedger, arena: &'s Arena) -> Self {
        Modes {
            registry,
            ledger,
            arena,
        }
    }

    /// Whether `a` and `b` are structurally the same mode.
    pub fn equivalent(&mut self, a: MoidId, b: MoidId) -> Result<bool, Abend> {
        modes_equivalent(self.registry, self.ledger, self.arena, a, b)
    }

    pub fn size(&mut self, moid: MoidId) -> Result<usize, Abend> {
        moid_size(self.registry, self.ledger, self.arena, moid)
    }

    /// Pretty-prints a mode, abbreviating with `..` once `width` runs out.
    /// With `idf`, modes declared by a visible mode declaration are shown
    /// by their indicant.
    pub fn to_string(
        &mut self,
        moid: MoidId,
        width: usize,
        idf: Option<ScopeId>,
    ) -> Result<String, Abend> {
        let mut text = String::new();
        let mut budget = width as isize;
        let mut printer = Printer {
            registry: self.registry,
            arena: self.arena,
            idf,
            text: &mut text,
            width: &mut budget,
        };
        printer.print(self.ledger, moid)?;
        Ok(text)
    }

    /// Whether VOID occurs inside a composite mode.
    pub fn has_void(&mut self, moid: MoidId) -> Result<bool, Abend> {
        contains(self.registry, self.ledger, self.arena, moid, &|m| {
            m.kind == MoidKind::Standard && m.symbol == "VOID"
        })
    }

    pub fn has_ref(&mut self, moid: MoidId) -> Result<bool, Abend> {
        contains(self.registry, self.ledger, self.arena, moid, &|m| {
            m.kind == MoidKind::Ref
        })
    }

    pub fn has_rows(&mut self, moid: MoidId) -> Result<bool, Abend> {
        contains(self.registry, self.ledger, self.arena, moid, &|m| {
            matches!(m.kind, MoidKind::Row | MoidKind::Flex)
        })
    }

    /// Checks the mode declared for `indicant`: every path from the
    /// indicant back to itself must pass a REF or PROC and also a STRUCT
    /// or PROC.
    pub fn well_formed(&mut self, indicant: MoidId) -> Result<bool, Abend> {
        let Some(declared) = self.registry[indicant].equivalent else {
            return Ok(true);
        };
        yin_yang(
            self.registry,
            self.ledger,
            self.arena,
            indicant,
            declared,
            false,
            false,
        )
    }
}

fn sub_equivalent(
    registry: &Registry,
    ledger: &mut PostulateLedger,
    arena: &Arena,
    a: Option<MoidId>,
    b: Option<MoidId>,
) -> Result<bool, Abend> {
    match (a, b) {
        (Some(a), Some(b)) => modes_equivalent(registry, ledger, arena, a, b),
        (None, None) => Ok(true),
        _ => Ok(false),
    }
}

fn packs_equivalent(
    registry: &Registry,
    ledger: &mut PostulateLedger,
    arena: &Arena,
    s: &[PackEntry],
    t: &[PackEntry],
) -> Result<bool, Abend> {
    if s.len() != t.len() {
        return Ok(false);
    }
    for (x, y) in s.iter().zip(t) {
        if x.text != y.text || !modes_equivalent(registry, ledger, arena, x.moid, y.moid)? {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Every member of `s` has an equivalent member in `t`.
fn united_contained(
    registry: &Registry,
    ledger: &mut PostulateLedger,
    arena: &Arena,
    s: &[PackEntry],
    t: &[PackEntry],
) -> Result<bool, Abend> {
    for x in s {
        let mut found = false;
        for y in t {
            if modes_equivalent(registry, ledger, arena, x.moid, y.moid)? {
                found = true;
                break;
            }
        }
        if !found {
            return Ok(false);
        }
    }
    Ok(true)
}

pub fn modes_equivalent(
    registry: &Registry,
    ledger: &mut PostulateLedger,
    arena: &Arena,
    a: MoidId,
    b: MoidId,
) -> Result<bool, Abend> {
    if a == b {
        return Ok(true);
    }
    let (ma, mb) = (&registry[a], &registry[b]);
    if ma.equivalent == Some(b) || mb.equivalent == Some(a) {
        return Ok(true);
    }
    if ledger.find_pair(a, Some(b)) || ledger.find_pair(b, Some(a)) {
        return Ok(true);
    }
    // An indicant stands for its declared mode.
    if ma.kind == MoidKind::Indicant || mb.kind == MoidKind::Indicant {
        let x = if ma.kind == MoidKind::Indicant { ma.equivalent } else { Some(a) };
        let y = if mb.kind == MoidKind::Indicant { mb.equivalent } else { Some(b) };
        let mut scope = ledger.scope();
        scope.record(arena, a, Some(b))?;
        return match (x, y) {
            (Some(x), Some(y)) => modes_equivalent(registry, &mut scope, arena, x, y),
            _ => Ok(false),
        };
    }
    if ma.kind != mb.kind {
        return Ok(false);
    }
    let mut scope = ledger.scope();
    scope.record(arena, a, Some(b))?;
    match ma.kind {
        MoidKind::Ref | MoidKind::Flex => sub_equivalent(registry, &mut scope, arena, ma.sub, mb.sub),
        MoidKind::Row => Ok(ma.dim == mb.dim
            && sub_equivalent(registry, &mut scope, arena, ma.sub, mb.sub)?),
        MoidKind::Struct => packs_equivalent(registry, &mut scope, arena, &ma.pack, &mb.pack),
        MoidKind::Union => Ok(united_contained(registry, &mut scope, arena, &ma.pack, &mb.pack)?
            && united_contained(registry, &mut scope, arena, &mb.pack, &ma.pack)?),
        MoidKind::Proc => Ok(ma.dim == mb.dim
            && sub_equivalent(registry, &mut scope, arena, ma.sub, mb.sub)?
            && packs_equivalent(registry, &mut scope, arena, &ma.pack, &mb.pack)?),
        // Standard and special modes are unique.
        _ => Ok(false),
    }
}

pub fn moid_size(
    registry: &Registry,
    ledger: &mut PostulateLedger,
    arena: &Arena,
    moid: MoidId,
) -> Result<usize, Abend> {
    let m = &registry[moid];
    match m.kind {
        MoidKind::Standard => Ok(standard_size(&m.symbol)),
        MoidKind::Ref | MoidKind::Proc | MoidKind::Row | MoidKind::Hip => Ok(REF_SIZE),
        MoidKind::CString => Ok(REF_SIZE),
        MoidKind::Flex | MoidKind::Indicant | MoidKind::Struct | MoidKind::Union => {
            // A mode that contains itself without a REF or PROC in between
            // has no finite size; stop at the cycle.
            if ledger.find(moid) {
                return Ok(0);
            }
            let mut scope = ledger.scope();
            scope.record(arena, moid, None)?;
            match m.kind {
                MoidKind::Flex => match m.sub {
                    Some(sub) => moid_size(registry, &mut scope, arena, sub),
                    None => Ok(0),
                },
                MoidKind::Indicant => match m.equivalent {
                    Some(eq) => moid_size(registry, &mut scope, arena, eq),
                    None => Ok(0),
                },
                MoidKind::Struct => {
                    let mut size = 0;
                    for entry in &m.pack {
                        size += moid_size(registry, &mut scope, arena, entry.moid)?;
                    }
                    Ok(size)
                }
                _ => {
                    let mut size = 0;
                    for entry in &m.pack {
                        size = size.max(moid_size(registry, &mut scope, arena, entry.moid)?);
                    }
                    Ok(UNION_OFFSET + size)
                }
            }
        }
        _ => Ok(0),
    }
}

fn contains(
    registry: &Registry,
    ledger: &mut PostulateLedger,
    arena: &Arena,
    moid: MoidId,
    predicate: &dyn Fn(&crate::registry::Moid) -> bool,
) -> Result<bool, Abend> {
    let m = &registry[moid];
    if ledger.find(moid) {
        return Ok(false);
    }
    let mut scope = ledger.scope();
    scope.record(arena, moid, None)?;
    let links = m
        .sub
        .into_iter()
        .chain(m.pack.iter().map(|p| p.moid))
        .chain(if m.kind == MoidKind::Indicant { m.equivalent } else { None });
    for link in links {
        if predicate(&registry[link]) || contains(registry, &mut scope, arena, link, predicate)? {
            return Ok(true);
        }
    }
    Ok(false)
}

fn yin_yang(
    registry: &Registry,
    ledger: &mut PostulateLedger,
    arena: &Arena,
    start: MoidId,
    moid: MoidId,
    yin: bool,
    yang: bool,
) -> Result<bool, Abend> {
    let m = &registry[moid];
    match m.kind {
        MoidKind::Indicant => {
            if moid == start {
                return Ok(yin && yang);
            }
            // Cycles not through `start` are judged at their own indicant.
            if ledger.find(moid) {
                return Ok(true);
            }
            let mut scope = ledger.scope();
            scope.record(arena, moid, None)?;
            match m.equivalent {
                Some(eq) => yin_yang(registry, &mut scope, arena, start, eq, yin, yang),
                None => Ok(true),
            }
        }
        MoidKind::Ref => match m.sub {
            Some(sub) => yin_yang(registry, ledger, arena, start, sub, true, yang),
            None => Ok(true),
        },
        MoidKind::Proc => {
            for link in m.sub.into_iter().chain(m.pack.iter().map(|p| p.moid)) {
                if !yin_yang(registry, ledger, arena, start, link, true, true)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        MoidKind::Struct => {
            for entry in &m.pack {
                if !yin_yang(registry, ledger, arena, start, entry.moid, yin, true)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        MoidKind::Union => {
            for entry in &m.pack {
                if !yin_yang(registry, ledger, arena, start, entry.moid, yin, yang)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        MoidKind::Flex | MoidKind::Row => match m.sub {
            Some(sub) => yin_yang(registry, ledger, arena, start, sub, yin, yang),
            None => Ok(true),
        },
        _ => Ok(true),
    }
}

struct Printer<'p> {
    registry: &'p Registry,
    arena: &'p Arena,
    idf: Option<ScopeId>,
    text: &'p mut String,
    width: &'p mut isize,
}

impl Printer<'_> {
    fn add(&mut self, s: &str) {
        self.text.push_str(s);
        *self.width -= s.len() as isize;
    }

    fn fits(&self, s: &str) -> bool {
        *self.width >= s.len() as isize
    }

    fn pack(&mut self, ledger: &mut PostulateLedger, pack: &[PackEntry], names: bool) -> Result<(), Abend> {
        for (i, entry) in pack.iter().enumerate() {
            self.print(ledger, entry.moid)?;
            if names {
                if let Some(text) = &entry.text {
                    self.add(" ");
                    self.add(text);
                }
            }
            if i + 1 < pack.len() {
                self.add(", ");
            }
        }
        Ok(())
    }

    fn commas(&mut self, open: &str, count: usize, close: &str) {
        self.add(open);
        for _ in 0..count {
            self.add(",");
        }
        self.add(close);
    }

    fn print(&mut self, ledger: &mut PostulateLedger, moid: MoidId) -> Result<(), Abend> {
        let registry = self.registry;
        let m = &registry[moid];
        // Reference to self through a composite already being printed.
        if ledger.find(moid) {
            self.add("SELF");
            return Ok(());
        }
        if let Some(scope) = self.idf {
            if !m.standard {
                if let Some(tag) = registry.find_indicant_for_moid(scope, moid) {
                    self.add(&registry[tag].symbol);
                    return Ok(());
                }
            }
        }
        match m.kind {
            MoidKind::Hip => self.add("HIP"),
            MoidKind::Error => self.add("ERROR"),
            MoidKind::Undefined => self.add("unresolved"),
            MoidKind::CString => self.add("C-STRING"),
            MoidKind::Collitem => self.add("COLLITEM"),
            MoidKind::Vacuum => self.add("\"VACUUM\""),
            MoidKind::Standard => self.add(&m.symbol),
            MoidKind::Indicant => match m.equivalent {
                Some(eq) if self.idf.is_none() => {
                    let mut scope = ledger.scope();
                    scope.record(self.arena, moid, None)?;
                    self.print(&mut scope, eq)?;
                }
                _ => self.add(&m.symbol),
            },
            MoidKind::Ref => self.unary(ledger, moid, "REF ", m.sub)?,
            MoidKind::Flex => self.unary(ledger, moid, "FLEX ", m.sub)?,
            MoidKind::Proc if m.pack.is_empty() => self.unary(ledger, moid, "PROC ", m.sub)?,
            MoidKind::Row => {
                let needed = "[] ..".len() + m.dim.saturating_sub(1);
                if *self.width >= needed as isize {
                    self.commas("[", m.dim.saturating_sub(1), "] ");
                    let mut scope = ledger.scope();
                    scope.record(self.arena, moid, None)?;
                    self.sub(&mut scope, m.sub)?;
                } else {
                    self.commas("[", m.dim.saturating_sub(1), "] ..");
                }
            }
            MoidKind::Struct | MoidKind::Union | MoidKind::Proc => {
                let word = match m.kind {
                    MoidKind::Struct => "STRUCT (",
                    MoidKind::Union => "UNION (",
                    _ => "PROC (",
                };
                let close = if m.kind == MoidKind::Proc { ") " } else { ")" };
                let needed = word.len() + close.len() + m.dim.saturating_sub(1) * ".., ".len() + 2;
                if *self.width >= needed as isize {
                    let mut scope = ledger.scope();
                    scope.record(self.arena, moid, None)?;
                    self.add(word);
                    self.pack(&mut scope, &m.pack, m.kind == MoidKind::Struct)?;
                    self.add(close);
                    if m.kind == MoidKind::Proc {
                        self.sub(&mut scope, m.sub)?;
                    }
                } else {
                    self.commas(word, m.dim, close.trim_end());
                    if m.kind == MoidKind::Proc {
                        self.add(" ..");
                    }
                }
            }
        }
        Ok(())
    }

    fn unary(
        &mut self,
        ledger: &mut PostulateLedger,
        moid: MoidId,
        word: &str,
        sub: Option<MoidId>,
    ) -> Result<(), Abend> {
        if self.fits(&format!("{word}..")) {
            self.add(word);
            let mut scope = ledger.scope();
            scope.record(self.arena, moid, None)?;
            self.sub(&mut scope, sub)
        } else {
            self.add(&format!("{word}.."));
            Ok(())
        }
    }

    fn sub(&mut self, ledger: &mut PostulateLedger, sub: Option<MoidId>) -> Result<(), Abend> {
        match sub {
            Some(sub) => self.print(ledger, sub),
            None => {
                self.add("NULL");
                Ok(())
            }
        }
    }
}
