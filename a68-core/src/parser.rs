//! Parser passes.
//!
//! Pass one checks bracket nesting and folds every bracketed group into an
//! `Enclosed` node. Pass two splits serial clauses at semicolons into units
//! and classifies each unit by its shape. The structural check then opens
//! scopes, reports units that fit no shape, and enters mode indicants.

use tracing::debug;

use crate::diagnostic::{Arg, Severity};
use crate::error::Abend;
use crate::registry::{Attribute, NodeId, ScopeId, TagKind};
use crate::session::Session;

// ---------------------------------------------------------------------
// Pass one
// ---------------------------------------------------------------------

/// Checks that brackets match, reporting only the first mismatch.
fn check_brackets(session: &mut Session, tokens: &[NodeId]) -> Result<bool, Abend> {
    let mut stack: Vec<NodeId> = Vec::new();
    for &t in tokens {
        let attribute = session.registry[t].attribute;
        if attribute.is_opener() {
            stack.push(t);
        } else if attribute.is_closer() {
            match stack.pop() {
                None => {
                    session.diagnostic_node(Severity::SyntaxError, t, "unmatched S", &[])?;
                    return Ok(false);
                }
                Some(opener) if session.registry[opener].attribute.closer() != Some(attribute) => {
                    let symbol = session.registry[opener].symbol.clone();
                    session.diagnostic_node(
                        Severity::SyntaxError,
                        t,
                        "S does not match Z",
                        &[Arg::Text(symbol)],
                    )?;
                    return Ok(false);
                }
                Some(_) => {}
            }
        }
    }
    if let Some(&opener) = stack.last() {
        session.diagnostic_node(Severity::SyntaxError, opener, "S is not closed", &[])?;
        return Ok(false);
    }
    Ok(true)
}

/// Builds the program tree from the token chain.
pub fn parse_pass_one(session: &mut Session) -> Result<(), Abend> {
    let tokens: Vec<NodeId> = session.registry.siblings(session.top_token).collect();
    let Some(&first) = tokens.first() else {
        return Ok(());
    };
    if !check_brackets(session, &tokens)? {
        return Ok(());
    }
    for &t in &tokens {
        session.registry[t].next = None;
        session.registry[t].previous = None;
    }

    let (line, column) = (session.registry[first].line, session.registry[first].column);
    let symbol = session.registry[first].symbol.clone();
    let arena = &session.arena;
    let root = session
        .registry
        .new_node(arena, Attribute::ParticularProgram, symbol, line, column)?;
    // Open groups with the children collected so far; the root stays at
    // the bottom.
    let mut parents: Vec<(NodeId, Vec<NodeId>)> = vec![(root, Vec::new())];
    for &t in &tokens {
        let attribute = session.registry[t].attribute;
        if attribute.is_opener() {
            let (symbol, line, column) = {
                let n = &session.registry[t];
                (n.symbol.clone(), n.line, n.column)
            };
            let arena = &session.arena;
            let group = session
                .registry
                .new_node(arena, Attribute::Enclosed, symbol, line, column)?;
            if let Some((_, children)) = parents.last_mut() {
                children.push(group);
            }
            parents.push((group, vec![t]));
        } else {
            if let Some((_, children)) = parents.last_mut() {
                children.push(t);
            }
            if attribute.is_closer() && parents.len() > 1 {
                if let Some((group, children)) = parents.pop() {
                    session.registry.set_children(group, &children);
                }
            }
        }
    }
    while let Some((parent, children)) = parents.pop() {
        session.registry.set_children(parent, &children);
    }
    session.top_token = None;
    session.top_node = Some(root);
    let count = session.registry.renumber(root);
    debug!(nodes = count, "bracket structure built");
    Ok(())
}

// ---------------------------------------------------------------------
// Pass two
// ---------------------------------------------------------------------

fn attribute(session: &Session, node: NodeId) -> Attribute {
    session.registry[node].attribute
}

/// The opener of an `Enclosed`-like group.
fn opener(session: &Session, group: NodeId) -> Option<Attribute> {
    session.registry[group].sub.map(|o| attribute(session, o))
}

fn is_group(session: &Session, node: NodeId, open: Attribute) -> bool {
    matches!(
        attribute(session, node),
        Attribute::Enclosed
            | Attribute::ClosedClause
            | Attribute::Collateral
            | Attribute::FormalPack
            | Attribute::Bounds
    ) && opener(session, node) == Some(open)
}

fn is_declarer_token(session: &Session, node: NodeId) -> bool {
    match attribute(session, node) {
        Attribute::BoldTag
        | Attribute::RefSymbol
        | Attribute::FlexSymbol
        | Attribute::ProcSymbol
        | Attribute::StructSymbol
        | Attribute::UnionSymbol => true,
        Attribute::Enclosed => {
            is_group(session, node, Attribute::OpenSymbol)
                || is_group(session, node, Attribute::SubSymbol)
        }
        _ => false,
    }
}

fn is_primary_token(session: &Session, node: NodeId) -> bool {
    matches!(
        attribute(session, node),
        Attribute::IntDenotation
            | Attribute::StringDenotation
            | Attribute::Identifier
            | Attribute::NilSymbol
    )
}

/// Children of a group without its opener and closer.
pub fn inner(session: &Session, group: NodeId) -> Vec<NodeId> {
    let children: Vec<NodeId> = session.registry.children(group).collect();
    match children.len() {
        0 | 1 => Vec::new(),
        n => children[1..n - 1].to_vec(),
    }
}

fn has_top_level(session: &Session, items: &[NodeId], what: Attribute) -> bool {
    items.iter().any(|&n| attribute(session, n) == what)
}


/// Splits the contents of `parent` at semicolons and turns every run into
/// a unit.
fn serial(session: &mut Session, parent: NodeId) -> Result<(), Abend> {
    let children: Vec<NodeId> = session.registry.children(parent).collect();
    let bracketed = attribute(session, parent) != Attribute::ParticularProgram;
    let (open, body, close) = if bracketed && children.len() >= 2 {
        (
            Some(children[0]),
            &children[1..children.len() - 1],
            Some(children[children.len() - 1]),
        )
    } else {
        (None, &children[..], None)
    };

    let mut rebuilt: Vec<NodeId> = open.into_iter().collect();
    let mut run: Vec<NodeId> = Vec::new();
    let mut previous: Option<NodeId> = None;
    for item in body.iter().copied().map(Some).chain(std::iter::once(None)) {
        if let Some(node) = item {
            if attribute(session, node) != Attribute::SemicolonSymbol {
                run.push(node);
                continue;
            }
        }
        let following = item.or(close);
        if run.is_empty() {
            match (previous, following) {
                (Some(semicolon), _) => session.diagnostic_node(
                    Severity::SyntaxError,
                    semicolon,
                    "unit expected after S",
                    &[],
                )?,
                (None, Some(next)) => session.diagnostic_node(
                    Severity::SyntaxError,
                    next,
                    "unit expected before S",
                    &[],
                )?,
                (None, None) => {}
            }
        } else {
            let unit = make_unit(session, &run)?;
            rebuilt.push(unit);
            run.clear();
        }
        if let Some(semicolon) = item {
            rebuilt.push(semicolon);
            previous = Some(semicolon);
        }
    }
    rebuilt.extend(close);
    session.registry.set_children(parent, &rebuilt);
    Ok(())
}

fn make_unit(session: &mut Session, run: &[NodeId]) -> Result<NodeId, Abend> {
    let (symbol, line, column) = {
        let n = &session.registry[run[0]];
        (n.symbol.clone(), n.line, n.column)
    };
    let kind = classify(session, run);
    let arena = &session.arena;
    let unit = session.registry.new_node(arena, kind, symbol, line, column)?;
    match identity_position(session, run).filter(|_| kind == Attribute::IdentityDeclaration) {
        // The source becomes a unit of its own.
        Some(k) => {
            for &node in &run[..k] {
                if attribute(session, node) == Attribute::Enclosed {
                    mark_declarer(session, node);
                }
            }
            session.registry[run[k]].attribute = Attribute::DefiningIdentifier;
            let source = make_unit(session, &run[k + 2..])?;
            let mut children = run[..k + 2].to_vec();
            children.push(source);
            session.registry.set_children(unit, &children);
        }
        None => {
            session.registry.set_children(unit, run);
            shape(session, kind, run)?;
        }
    }
    Ok(unit)
}

/// Position of the defining identifier of an identity declaration.
fn identity_position(session: &Session, run: &[NodeId]) -> Option<usize> {
    let k = run
        .iter()
        .position(|&n| !is_declarer_token(session, n))?;
    let defines = k > 0
        && attribute(session, run[k]) == Attribute::Identifier
        && run
            .get(k + 1)
            .is_some_and(|&n| attribute(session, n) == Attribute::EqualsSymbol)
        && k + 2 < run.len();
    defines.then_some(k)
}

fn classify(session: &Session, run: &[NodeId]) -> Attribute {
    let first = run[0];
    if attribute(session, first) == Attribute::ModeSymbol {
        let well_shaped = run.len() >= 4
            && attribute(session, run[1]) == Attribute::BoldTag
            && attribute(session, run[2]) == Attribute::EqualsSymbol;
        return if well_shaped {
            Attribute::ModeDeclaration
        } else {
            Attribute::Unit
        };
    }
    if identity_position(session, run).is_some() {
        return Attribute::IdentityDeclaration;
    }
    match run {
        [callee, args]
            if attribute(session, *callee) == Attribute::Identifier
                && is_group(session, *args, Attribute::OpenSymbol) =>
        {
            Attribute::Call
        }
        [single] if is_primary_token(session, *single) => Attribute::Primary,
        [single]
            if is_group(session, *single, Attribute::OpenSymbol)
                || is_group(session, *single, Attribute::BeginSymbol) =>
        {
            Attribute::Primary
        }
        _ => Attribute::Unit,
    }
}

/// Gives the groups inside a classified unit their roles.
fn shape(session: &mut Session, kind: Attribute, run: &[NodeId]) -> Result<(), Abend> {
    match kind {
        Attribute::ModeDeclaration => {
            for (k, &node) in run.iter().enumerate() {
                let defines = attribute(session, node) == Attribute::BoldTag
                    && (k == 1
                        || (k > 1
                            && attribute(session, run[k - 1]) == Attribute::CommaSymbol
                            && run
                                .get(k + 1)
                                .is_some_and(|&n| attribute(session, n) == Attribute::EqualsSymbol)));
                if defines {
                    session.registry[node].attribute = Attribute::DefiningIndicant;
                } else if attribute(session, node) == Attribute::Enclosed {
                    mark_declarer(session, node);
                }
            }
        }
        Attribute::Call => mark_collateral(session, run[1])?,
        Attribute::Primary => {
            if attribute(session, run[0]) == Attribute::Enclosed {
                shape_enclosed(session, run[0])?;
            }
        }
        _ => {}
    }
    Ok(())
}

/// Groups inside declarers are packs and bounds, never clauses.
fn mark_declarer(session: &mut Session, group: NodeId) {
    let role = if opener(session, group) == Some(Attribute::SubSymbol) {
        Attribute::Bounds
    } else {
        Attribute::FormalPack
    };
    session.registry[group].attribute = role;
    for node in inner(session, group) {
        if attribute(session, node) == Attribute::Enclosed {
            mark_declarer(session, node);
        }
    }
}

fn shape_enclosed(session: &mut Session, group: NodeId) -> Result<(), Abend> {
    let items = inner(session, group);
    let closed = opener(session, group) == Some(Attribute::BeginSymbol)
        || has_top_level(session, &items, Attribute::SemicolonSymbol)
        || !has_top_level(session, &items, Attribute::CommaSymbol);
    if closed {
        session.registry[group].attribute = Attribute::ClosedClause;
        serial(session, group)
    } else {
        mark_collateral(session, group)
    }
}

fn mark_collateral(session: &mut Session, group: NodeId) -> Result<(), Abend> {
    session.registry[group].attribute = Attribute::Collateral;
    for node in inner(session, group) {
        if attribute(session, node) == Attribute::Enclosed {
            shape_enclosed(session, node)?;
        }
    }
    Ok(())
}

/// Splits the program into units and classifies them.
pub fn parse_pass_two(session: &mut Session) -> Result<(), Abend> {
    let Some(root) = session.top_node else {
        return Ok(());
    };
    serial(session, root)?;
    for node in session.registry.preorder(session.registry[root].sub) {
        let parent = session.registry[node].parent;
        session.registry[node].nest = parent;
    }
    let count = session.registry.renumber(root);
    debug!(nodes = count, "units classified");
    Ok(())
}

// ---------------------------------------------------------------------
// Structural checks
// ---------------------------------------------------------------------

/// Opens a scope per closed clause, reports unclassified units and enters
/// mode indicants.
pub fn check_structure(session: &mut Session) -> Result<(), Abend> {
    let Some(root) = session.top_node else {
        return Ok(());
    };
    let arena = &session.arena;
    let scope = session.registry.new_scope(arena, session.standenv)?;
    visit(session, root, scope)
}

fn visit(session: &mut Session, node: NodeId, scope: ScopeId) -> Result<(), Abend> {
    session.registry[node].scope = Some(scope);
    match attribute(session, node) {
        Attribute::Unit => {
            session.diagnostic_node(
                Severity::SyntaxError,
                node,
                "S does not start a valid unit",
                &[],
            )?;
        }
        Attribute::DefiningIndicant => {
            let symbol = session.registry[node].symbol.clone();
            if session
                .registry
                .find_tag_local(scope, TagKind::Indicant, &symbol)
                .is_some()
            {
                session.diagnostic_node(
                    Severity::Error,
                    node,
                    "S is declared more than once in this range",
                    &[],
                )?;
            } else {
                let arena = &session.arena;
                let tag = session
                    .registry
                    .new_tag(arena, TagKind::Indicant, symbol, scope)?;
                session.registry[tag].node = Some(node);
                session.registry[node].tag = Some(tag);
            }
        }
        _ => {}
    }
    let children: Vec<NodeId> = session.registry.children(node).collect();
    for child in children {
        let inner = if attribute(session, child) == Attribute::ClosedClause {
            let arena = &session.arena;
            session.registry.new_scope(arena, Some(scope))?
        } else {
            scope
        };
        visit(session, child, inner)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::*;
    use crate::lexer::tokenise;
    use crate::options::{MEGABYTE, Options};
    use crate::session::tests::{SharedBuffer, session_with_source};
    use crate::stdenv::{build_standard_environment, make_special_modes};

    fn parse(text: &str) -> (Session, SharedBuffer, tempfile::TempDir) {
        let (mut session, buffer, dir) = session_with_source(text);
        tokenise(&mut session).unwrap();
        make_special_modes(&mut session).unwrap();
        parse_pass_one(&mut session).unwrap();
        build_standard_environment(&mut session).unwrap();
        if session.error_count() == 0 {
            parse_pass_two(&mut session).unwrap();
            check_structure(&mut session).unwrap();
        }
        (session, buffer, dir)
    }

    fn units(session: &Session) -> Vec<Attribute> {
        let root = session.top_node.unwrap();
        session
            .registry
            .children(root)
            .map(|n| session.registry[n].attribute)
            .filter(|a| *a != Attribute::SemicolonSymbol)
            .collect()
    }

    #[test]
    fn long_flat_program_builds_quickly() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prog.a68");
        std::fs::write(&path, "print (1);\n".repeat(10_000) + "print (1)").unwrap();
        let mut options = Options::for_source(path);
        options.budgets.heap = 256 * MEGABYTE;
        let mut session = Session::new(options, Box::new(SharedBuffer::default())).unwrap();
        let started = Instant::now();
        tokenise(&mut session).unwrap();
        make_special_modes(&mut session).unwrap();
        parse_pass_one(&mut session).unwrap();
        build_standard_environment(&mut session).unwrap();
        parse_pass_two(&mut session).unwrap();
        let elapsed = started.elapsed();
        assert_eq!(session.error_count(), 0);
        assert_eq!(units(&session).len(), 10_001);
        assert!(elapsed < Duration::from_secs(5), "took {elapsed:?}");
    }

    #[test]
    fn classifies_top_level_units() {
        let (session, _, _dir) = parse(
            "MODE POINT = STRUCT (INT x, INT y);\nINT n = 5;\nprint ((n, \"x\"));\nn",
        );
        assert_eq!(session.error_count(), 0);
        assert_eq!(
            units(&session),
            vec![
                Attribute::ModeDeclaration,
                Attribute::IdentityDeclaration,
                Attribute::Call,
                Attribute::Primary
            ]
        );
    }

    #[test]
    fn mismatched_brackets_give_one_error() {
        let (session, _, _dir) = parse("print ((1]) ; print (2");
        assert_eq!(session.error_count(), 1);
        assert!(session.top_node.is_none());
        let text = &session.recorded().next().unwrap().text;
        assert!(text.contains("\"]\" does not match \"(\""), "{text}");
    }

    #[test]
    fn unclosed_bracket_is_reported() {
        let (session, _, _dir) = parse("BEGIN print (1)");
        assert_eq!(session.error_count(), 1);
        let text = &session.recorded().next().unwrap().text;
        assert!(text.contains("\"BEGIN\" is not closed"), "{text}");
    }

    #[test]
    fn declarer_groups_are_packs_and_bounds() {
        let (session, _, _dir) = parse("MODE M = STRUCT ([] INT a, PROC (INT) VOID p)");
        let attributes: Vec<Attribute> = session
            .registry
            .preorder(session.top_node)
            .into_iter()
            .map(|n| session.registry[n].attribute)
            .collect();
        assert!(attributes.contains(&Attribute::Bounds));
        assert_eq!(
            attributes
                .iter()
                .filter(|a| **a == Attribute::FormalPack)
                .count(),
            2
        );
        assert!(attributes.contains(&Attribute::DefiningIndicant));
        assert!(!attributes.contains(&Attribute::ClosedClause));
    }

    #[test]
    fn closed_clauses_open_scopes() {
        let (session, _, _dir) = parse("BEGIN INT x = 1; print (x) END");
        assert_eq!(session.error_count(), 0);
        let root = session.top_node.unwrap();
        let unit = session.registry[root].sub.unwrap();
        let clause = session.registry[unit].sub.unwrap();
        assert_eq!(session.registry[clause].attribute, Attribute::ClosedClause);
        let outer = session.registry[root].scope.unwrap();
        let inner = session.registry[clause].scope.unwrap();
        assert_eq!(session.registry[inner].parent, Some(outer));
        assert_eq!(session.registry[outer].parent, session.standenv);
    }

    #[test]
    fn empty_and_unshaped_units_are_syntax_errors() {
        let (session, _, _dir) = parse("print (1);; x y");
        assert_eq!(session.error_count(), 2);
        let texts: Vec<&str> = session.recorded().map(|d| d.text.as_str()).collect();
        assert!(texts[0].contains("unit expected after \";\""), "{texts:?}");
        assert!(texts[1].contains("\"x\" does not start a valid unit"), "{texts:?}");
    }

    #[test]
    fn indicants_declared_twice_are_errors() {
        let (session, _, _dir) = parse("MODE A = INT, A = REAL");
        assert_eq!(session.error_count(), 1);
    }

    #[test]
    fn nest_names_the_enclosing_phrase() {
        let (session, _, _dir) = parse("INT n = 5");
        let root = session.top_node.unwrap();
        let unit = session.registry[root].sub.unwrap();
        let token = session.registry[unit].sub.unwrap();
        assert_eq!(session.registry[token].nest, Some(unit));
    }
}
