//! Node, tag, mode and scope records.
//!
//! Records live in typed stores addressed by small copyable handles; a
//! handle stays valid for the whole session because nothing is ever removed
//! from a store. Every constructor charges one record to the arena's
//! long-lived front before pushing, and spells out every field.

use std::mem::size_of;
use std::ops::{Index, IndexMut};

use crate::arena::Arena;
use crate::diagnostic::Diagnostic;
use crate::error::Abend;

macro_rules! define_handle {
    ($($name:ident),* $(,)?) => {
        $(
            #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
            pub struct $name(u32);

            impl $name {
                pub fn from_index(index: usize) -> Self {
                    $name(index as u32)
                }

                pub fn index(self) -> usize {
                    self.0 as usize
                }
            }
        )*
    };
}

define_handle!(NodeId, MoidId, TagId, ScopeId, LineId);

/// Token and phrase classes of tree nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Attribute {
    // Tokens.
    BoldTag,
    Identifier,
    IntDenotation,
    StringDenotation,
    ModeSymbol,
    BeginSymbol,
    EndSymbol,
    RefSymbol,
    FlexSymbol,
    ProcSymbol,
    StructSymbol,
    UnionSymbol,
    NilSymbol,
    OpenSymbol,
    CloseSymbol,
    SubSymbol,
    BusSymbol,
    CommaSymbol,
    SemicolonSymbol,
    EqualsSymbol,
    ColonSymbol,
    PointSymbol,
    // Phrases.
    ParticularProgram,
    Enclosed,
    ClosedClause,
    Collateral,
    FormalPack,
    Bounds,
    Unit,
    ModeDeclaration,
    IdentityDeclaration,
    DefiningIndicant,
    DefiningIdentifier,
    Call,
    Primary,
    Widening,
    Rowing,
}

impl Attribute {
    /// Grammar name used by `@` and `A` in diagnostic templates.
    pub fn non_terminal(self) -> Option<&'static str> {
        Some(match self {
            Attribute::ParticularProgram => "particular-program",
            Attribute::Enclosed | Attribute::ClosedClause => "closed-clause",
            Attribute::Collateral => "collateral-clause",
            Attribute::FormalPack => "pack",
            Attribute::Bounds => "bounds",
            Attribute::Unit | Attribute::Primary => "unit",
            Attribute::ModeDeclaration => "mode-declaration",
            Attribute::IdentityDeclaration => "identity-declaration",
            Attribute::DefiningIndicant => "defining-indicant",
            Attribute::DefiningIdentifier => "defining-identifier",
            Attribute::Call => "call",
            Attribute::Widening => "widening",
            Attribute::Rowing => "rowing",
            Attribute::BoldTag => "indicant",
            Attribute::Identifier => "identifier",
            Attribute::IntDenotation => "integral-denotation",
            Attribute::StringDenotation => "string-denotation",
            _ => return None,
        })
    }

    /// Spelling used by `B` in diagnostic templates.
    pub fn keyword(self) -> Option<&'static str> {
        Some(match self {
            Attribute::ModeSymbol => "MODE",
            Attribute::BeginSymbol => "BEGIN",
            Attribute::EndSymbol => "END",
            Attribute::RefSymbol => "REF",
            Attribute::FlexSymbol => "FLEX",
            Attribute::ProcSymbol => "PROC",
            Attribute::StructSymbol => "STRUCT",
            Attribute::UnionSymbol => "UNION",
            Attribute::NilSymbol => "NIL",
            Attribute::OpenSymbol => "(",
            Attribute::CloseSymbol => ")",
            Attribute::SubSymbol => "[",
            Attribute::BusSymbol => "]",
            Attribute::CommaSymbol => ",",
            Attribute::SemicolonSymbol => ";",
            Attribute::EqualsSymbol => "=",
            Attribute::ColonSymbol => ":",
            Attribute::PointSymbol => ".",
            _ => return None,
        })
    }

    pub fn from_keyword(text: &str) -> Option<Attribute> {
        Some(match text {
            "MODE" => Attribute::ModeSymbol,
            "BEGIN" => Attribute::BeginSymbol,
            "END" => Attribute::EndSymbol,
            "REF" => Attribute::RefSymbol,
            "FLEX" => Attribute::FlexSymbol,
            "PROC" => Attribute::ProcSymbol,
            "STRUCT" => Attribute::StructSymbol,
            "UNION" => Attribute::UnionSymbol,
            "NIL" => Attribute::NilSymbol,
            _ => return None,
        })
    }

    pub fn is_opener(self) -> bool {
        matches!(
            self,
            Attribute::OpenSymbol | Attribute::SubSymbol | Attribute::BeginSymbol
        )
    }

    pub fn is_closer(self) -> bool {
        matches!(
            self,
            Attribute::CloseSymbol | Attribute::BusSymbol | Attribute::EndSymbol
        )
    }

    /// The closer matching an opener.
    pub fn closer(self) -> Option<Attribute> {
        match self {
            Attribute::OpenSymbol => Some(Attribute::CloseSymbol),
            Attribute::SubSymbol => Some(Attribute::BusSymbol),
            Attribute::BeginSymbol => Some(Attribute::EndSymbol),
            _ => None,
        }
    }
}

/// Node status bits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Status(u32);

impl Status {
    /// A native unit was emitted for the node.
    pub const COMPILED: Status = Status(1);
    /// Came from a prelude file rather than the program.
    pub const PRELUDE: Status = Status(1 << 1);
    /// Produced by refinement substitution.
    pub const REFINED: Status = Status(1 << 2);

    pub fn contains(self, other: Status) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Status) {
        self.0 |= other.0;
    }
}

#[derive(Debug, Clone)]
pub struct Node {
    pub attribute: Attribute,
    pub symbol: String,
    pub line: LineId,
    /// Character offset of the symbol within its line.
    pub column: usize,
    pub scope: Option<ScopeId>,
    pub moid: Option<MoidId>,
    pub tag: Option<TagId>,
    pub parent: Option<NodeId>,
    pub previous: Option<NodeId>,
    pub next: Option<NodeId>,
    pub sub: Option<NodeId>,
    /// Enclosing phrase, named in "detected in" clauses.
    pub nest: Option<NodeId>,
    pub status: Status,
    pub number: usize,
    pub compile_name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoidKind {
    Standard,
    Indicant,
    Ref,
    Flex,
    Row,
    Struct,
    Union,
    Proc,
    Hip,
    Undefined,
    Error,
    Vacuum,
    CString,
    Collitem,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackEntry {
    pub moid: MoidId,
    /// Field name; `None` for union members and parameters.
    pub text: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Moid {
    pub kind: MoidKind,
    /// Spelling for standard modes and indicants.
    pub symbol: String,
    /// Row dimension, pack length for STRUCT/UNION/PROC.
    pub dim: usize,
    pub sub: Option<MoidId>,
    pub pack: Vec<PackEntry>,
    pub equivalent: Option<MoidId>,
    pub slice: Option<MoidId>,
    pub trim: Option<MoidId>,
    pub deflexed: Option<MoidId>,
    pub name: Option<MoidId>,
    pub rowed: Option<MoidId>,
    pub multiple: Option<MoidId>,
    pub size: usize,
    pub used: bool,
    pub portable: bool,
    pub has_rows: bool,
    pub well_formed: bool,
    /// Declared in the standard environment.
    pub standard: bool,
    pub node: Option<NodeId>,
    pub number: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagKind {
    Identifier,
    Indicant,
    Operator,
    Label,
    Anonymous,
}

#[derive(Debug, Clone)]
pub struct Tag {
    pub kind: TagKind,
    pub symbol: String,
    pub moid: Option<MoidId>,
    pub node: Option<NodeId>,
    pub scope: ScopeId,
    pub used: bool,
    pub portable: bool,
    pub number: usize,
    /// Source unit of an identity declaration.
    pub value: Option<NodeId>,
}

#[derive(Debug, Clone)]
pub struct Scope {
    /// Session-wide creation counter.
    pub level: u32,
    /// Lexical depth.
    pub nest: u32,
    pub parent: Option<ScopeId>,
    /// Next scope searched for non-local tags.
    pub outer: Option<ScopeId>,
    pub identifiers: Vec<TagId>,
    pub indicants: Vec<TagId>,
    pub operators: Vec<TagId>,
    pub labels: Vec<TagId>,
    pub anonymous: Vec<TagId>,
}

#[derive(Debug, Clone)]
pub struct SourceLine {
    pub text: String,
    pub filename: String,
    /// 1-based; 0 marks prelude and standard-environment lines.
    pub number: u32,
    pub diagnostics: Vec<Diagnostic>,
    pub list: bool,
}

#[derive(Debug, Default)]
pub struct Registry {
    nodes: Vec<Node>,
    moids: Vec<Moid>,
    tags: Vec<Tag>,
    scopes: Vec<Scope>,
    lines: Vec<SourceLine>,
    scope_count: u32,
}

impl Registry {
    pub fn new() -> Self {
        Registry::default()
    }

    pub fn new_node(
        &mut self,
        arena: &Arena,
        attribute: Attribute,
        symbol: impl Into<String>,
        line: LineId,
        column: usize,
    ) -> Result<NodeId, Abend> {
        arena.allocate_fixed(size_of::<Node>())?;
        let id = NodeId::from_index(self.nodes.len());
        self.nodes.push(Node {
            attribute,
            symbol: symbol.into(),
            line,
            column,
            scope: None,
            moid: None,
            tag: None,
            parent: None,
            previous: None,
            next: None,
            sub: None,
            nest: None,
            status: Status::default(),
            number: id.index(),
            compile_name: None,
        });
        Ok(id)
    }

    pub fn new_moid(
        &mut self,
        arena: &Arena,
        kind: MoidKind,
        symbol: impl Into<String>,
    ) -> Result<MoidId, Abend> {
        arena.allocate_fixed(size_of::<Moid>())?;
        let id = MoidId::from_index(self.moids.len());
        self.moids.push(Moid {
            kind,
            symbol: symbol.into(),
            dim: 0,
            sub: None,
            pack: Vec::new(),
            equivalent: None,
            slice: None,
            trim: None,
            deflexed: None,
            name: None,
            rowed: None,
            multiple: None,
            size: 0,
            used: false,
            portable: true,
            has_rows: false,
            well_formed: true,
            standard: false,
            node: None,
            number: id.index(),
        });
        Ok(id)
    }

    /// Appends one pack entry to a composite mode.
    pub fn new_pack(
        &mut self,
        arena: &Arena,
        owner: MoidId,
        moid: MoidId,
        text: Option<String>,
    ) -> Result<(), Abend> {
        arena.allocate_fixed(size_of::<PackEntry>())?;
        let owner = &mut self[owner];
        owner.pack.push(PackEntry { moid, text });
        owner.dim = owner.pack.len();
        Ok(())
    }

    pub fn new_tag(
        &mut self,
        arena: &Arena,
        kind: TagKind,
        symbol: impl Into<String>,
        scope: ScopeId,
    ) -> Result<TagId, Abend> {
        arena.allocate_fixed(size_of::<Tag>())?;
        let id = TagId::from_index(self.tags.len());
        self.tags.push(Tag {
            kind,
            symbol: symbol.into(),
            moid: None,
            node: None,
            scope,
            used: false,
            portable: true,
            number: id.index(),
            value: None,
        });
        let scope = &mut self[scope];
        match kind {
            TagKind::Identifier => scope.identifiers.push(id),
            TagKind::Indicant => scope.indicants.push(id),
            TagKind::Operator => scope.operators.push(id),
            TagKind::Label => scope.labels.push(id),
            TagKind::Anonymous => scope.anonymous.push(id),
        }
        Ok(id)
    }

    /// Opens a scope nested in `parent`; lookups continue in the parent.
    pub fn new_scope(&mut self, arena: &Arena, parent: Option<ScopeId>) -> Result<ScopeId, Abend> {
        arena.allocate_fixed(size_of::<Scope>())?;
        let id = ScopeId::from_index(self.scopes.len());
        let nest = parent.map(|p| self[p].nest + 1).unwrap_or(0);
        self.scopes.push(Scope {
            level: self.scope_count,
            nest,
            parent,
            outer: parent,
            identifiers: Vec::new(),
            indicants: Vec::new(),
            operators: Vec::new(),
            labels: Vec::new(),
            anonymous: Vec::new(),
        });
        self.scope_count += 1;
        Ok(id)
    }

    pub fn new_source_line(
        &mut self,
        arena: &Arena,
        text: impl Into<String>,
        filename: impl Into<String>,
        number: u32,
    ) -> Result<LineId, Abend> {
        arena.allocate_fixed(size_of::<SourceLine>())?;
        let id = LineId::from_index(self.lines.len());
        self.lines.push(SourceLine {
            text: text.into(),
            filename: filename.into(),
            number,
            diagnostics: Vec::new(),
            list: true,
        });
        Ok(id)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn moids(&self) -> impl Iterator<Item = (MoidId, &Moid)> {
        self.moids
            .iter()
            .enumerate()
            .map(|(i, m)| (MoidId::from_index(i), m))
    }

    pub fn moid_count(&self) -> usize {
        self.moids.len()
    }

    pub fn tags(&self) -> impl Iterator<Item = (TagId, &Tag)> {
        self.tags
            .iter()
            .enumerate()
            .map(|(i, t)| (TagId::from_index(i), t))
    }

    pub fn scope_count(&self) -> u32 {
        self.scope_count
    }

    pub fn lines(&self) -> impl Iterator<Item = (LineId, &SourceLine)> {
        self.lines
            .iter()
            .enumerate()
            .map(|(i, l)| (LineId::from_index(i), l))
    }

    pub fn line_count(&self) -> usize {
        self.lines.len()
    }

    // -----------------------------------------------------------------
    // Tree navigation
    // -----------------------------------------------------------------

    pub fn children(&self, parent: NodeId) -> Children<'_> {
        Children {
            registry: self,
            cursor: self[parent].sub,
        }
    }

    /// Siblings starting at `first`, inclusive.
    pub fn siblings(&self, first: Option<NodeId>) -> Children<'_> {
        Children {
            registry: self,
            cursor: first,
        }
    }

    /// Replaces the children of `parent` with `children`, in order, linking
    /// each sibling list in one pass.
    pub fn set_children(&mut self, parent: NodeId, children: &[NodeId]) {
        self[parent].sub = children.first().copied();
        let mut previous = None;
        for &child in children {
            let node = &mut self[child];
            node.parent = Some(parent);
            node.previous = previous;
            node.next = None;
            if let Some(previous) = previous {
                self[previous].next = Some(child);
            }
            previous = Some(child);
        }
    }

    /// Preorder walk of the subtree list starting at `first`.
    pub fn preorder(&self, first: Option<NodeId>) -> Vec<NodeId> {
        let mut order = Vec::new();
        let mut stack: Vec<NodeId> = Vec::new();
        if let Some(first) = first {
            stack.push(first);
        }
        while let Some(id) = stack.pop() {
            order.push(id);
            if let Some(next) = self[id].next {
                stack.push(next);
            }
            if let Some(sub) = self[id].sub {
                stack.push(sub);
            }
        }
        order
    }

    /// Numbers the tree densely in preorder and returns the node count.
    pub fn renumber(&mut self, root: NodeId) -> usize {
        let order = self.preorder(Some(root));
        for (number, id) in order.iter().enumerate() {
            self[*id].number = number;
        }
        order.len()
    }

    /// Walks scope links outward, nearest first.
    pub fn scope_chain(&self, scope: ScopeId) -> impl Iterator<Item = ScopeId> + '_ {
        std::iter::successors(Some(scope), move |s| self[*s].outer)
    }

    /// Finds a tag by spelling, searching outward from `scope`.
    pub fn find_tag(&self, scope: ScopeId, kind: TagKind, symbol: &str) -> Option<TagId> {
        self.scope_chain(scope)
            .find_map(|s| self.find_tag_local(s, kind, symbol))
    }

    pub fn find_tag_local(&self, scope: ScopeId, kind: TagKind, symbol: &str) -> Option<TagId> {
        let chain = match kind {
            TagKind::Identifier => &self[scope].identifiers,
            TagKind::Indicant => &self[scope].indicants,
            TagKind::Operator => &self[scope].operators,
            TagKind::Label => &self[scope].labels,
            TagKind::Anonymous => &self[scope].anonymous,
        };
        chain.iter().copied().find(|t| self[*t].symbol == symbol)
    }

    /// Finds an indicant declared with mode `moid`, searching outward.
    pub fn find_indicant_for_moid(&self, scope: ScopeId, moid: MoidId) -> Option<TagId> {
        self.scope_chain(scope).find_map(|s| {
            self[s]
                .indicants
                .iter()
                .copied()
                .find(|t| self[*t].moid == Some(moid))
        })
    }
}

pub struct Children<'r> {
    registry: &'r Registry,
    cursor: Option<NodeId>,
}

impl Iterator for Children<'_> {
    type Item = NodeId;

    fn next(&mut self) -> Option<NodeId> {
        let id = self.cursor?;
        self.cursor = self.registry[id].next;
        Some(id)
    }
}

macro_rules! impl_store_index {
    ($handle:ident, $record:ident, $field:ident) => {
        impl Index<$handle> for Registry {
            type Output = $record;

            fn index(&self, id: $handle) -> &$record {
                &self.$field[id.index()]
            }
        }

        impl IndexMut<$handle> for Registry {
            fn index_mut(&mut self, id: $handle) -> &mut $record {
                &mut self.$field[id.index()]
            }
        }
    };
}

impl_store_index!(NodeId, Node, nodes);
impl_store_index!(MoidId, Moid, moids);
impl_store_index!(TagId, Tag, tags);
impl_store_index!(ScopeId, Scope, scopes);
impl_store_index!(LineId, SourceLine, lines);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::{KILOBYTE, MemoryBudgets};

    fn arena() -> Arena {
        Arena::init(&MemoryBudgets::default()).unwrap()
    }

    #[test]
    fn constructors_charge_the_fixed_front() {
        let arena = arena();
        let mut registry = Registry::new();
        let before = arena.fixed_in_use();
        let line = registry
            .new_source_line(&arena, "print (1)", "prog.a68", 1)
            .unwrap();
        registry
            .new_node(&arena, Attribute::Identifier, "print", line, 0)
            .unwrap();
        assert!(arena.fixed_in_use() > before);
    }

    #[test]
    fn new_records_have_explicit_defaults() {
        let arena = arena();
        let mut registry = Registry::new();
        let line = registry.new_source_line(&arena, "", "prog.a68", 1).unwrap();
        let node = registry
            .new_node(&arena, Attribute::Unit, "", line, 0)
            .unwrap();
        let n = &registry[node];
        assert!(n.parent.is_none() && n.sub.is_none() && n.moid.is_none());
        assert_eq!(n.status, Status::default());
        let moid = registry.new_moid(&arena, MoidKind::Ref, "").unwrap();
        let m = &registry[moid];
        assert!(m.sub.is_none() && m.equivalent.is_none() && m.pack.is_empty());
        assert!(m.portable && m.well_formed && !m.used);
    }

    #[test]
    fn scope_levels_are_monotonic_and_linked() {
        let arena = arena();
        let mut registry = Registry::new();
        let outer = registry.new_scope(&arena, None).unwrap();
        let inner = registry.new_scope(&arena, Some(outer)).unwrap();
        let sibling = registry.new_scope(&arena, Some(outer)).unwrap();
        assert_eq!(registry[outer].level, 0);
        assert_eq!(registry[inner].level, 1);
        assert_eq!(registry[sibling].level, 2);
        assert_eq!(registry[sibling].nest, 1);
        assert_eq!(registry[inner].parent, Some(outer));
        assert_eq!(registry.scope_count(), 3);
    }

    #[test]
    fn tags_are_found_outward() {
        let arena = arena();
        let mut registry = Registry::new();
        let outer = registry.new_scope(&arena, None).unwrap();
        let inner = registry.new_scope(&arena, Some(outer)).unwrap();
        let tag = registry
            .new_tag(&arena, TagKind::Identifier, "x", outer)
            .unwrap();
        assert_eq!(registry.find_tag(inner, TagKind::Identifier, "x"), Some(tag));
        assert_eq!(registry.find_tag(inner, TagKind::Indicant, "x"), None);
        assert_eq!(registry.find_tag_local(inner, TagKind::Identifier, "x"), None);
    }

    #[test]
    fn renumbering_is_dense_preorder() {
        let arena = arena();
        let mut registry = Registry::new();
        let line = registry.new_source_line(&arena, "", "prog.a68", 1).unwrap();
        let root = registry
            .new_node(&arena, Attribute::ParticularProgram, "", line, 0)
            .unwrap();
        let a = registry.new_node(&arena, Attribute::Unit, "a", line, 0).unwrap();
        let b = registry.new_node(&arena, Attribute::Unit, "b", line, 0).unwrap();
        let a1 = registry
            .new_node(&arena, Attribute::Identifier, "a1", line, 0)
            .unwrap();
        registry.set_children(root, &[a, b]);
        registry.set_children(a, &[a1]);
        assert_eq!(registry.renumber(root), 4);
        let numbers: Vec<usize> = [root, a, a1, b].iter().map(|n| registry[*n].number).collect();
        assert_eq!(numbers, vec![0, 1, 2, 3]);
    }

    #[test]
    fn set_children_replaces_the_sibling_list() {
        let arena = arena();
        let mut registry = Registry::new();
        let line = registry.new_source_line(&arena, "", "prog.a68", 1).unwrap();
        let mut node = |symbol: &str| {
            registry
                .new_node(&arena, Attribute::Unit, symbol, line, 0)
                .unwrap()
        };
        let (root, a, b, c) = (node("root"), node("a"), node("b"), node("c"));
        registry.set_children(root, &[a, b]);
        registry.set_children(root, &[c, a]);
        assert_eq!(registry.children(root).collect::<Vec<_>>(), vec![c, a]);
        assert_eq!(registry[c].previous, None);
        assert_eq!(registry[a].previous, Some(c));
        assert_eq!(registry[a].next, None);
        assert_eq!(registry[a].parent, Some(root));
        registry.set_children(root, &[]);
        assert_eq!(registry.children(root).count(), 0);
    }

    #[test]
    fn exhaustion_is_fatal() {
        let budgets = MemoryBudgets {
            heap: 256 * KILOBYTE,
            ..MemoryBudgets::default()
        };
        let arena = Arena::init(&budgets).unwrap();
        let mut registry = Registry::new();
        let failed = (0..100_000).any(|_| registry.new_moid(&arena, MoidKind::Ref, "").is_err());
        assert!(failed);
    }
}
