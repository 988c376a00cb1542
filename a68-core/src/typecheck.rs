//! Semantic phases after the mode table: symbol tables, binding, mode
//! checking, coercion insertion, application, scope and portability checks,
//! and the final renumbering.

use tracing::debug;

use crate::diagnostic::{Arg, Severity};
use crate::error::Abend;
use crate::parser::inner;
use crate::registry::{Attribute, MoidId, MoidKind, NodeId, TagKind};
use crate::session::Session;

fn attribute(session: &Session, node: NodeId) -> Attribute {
    session.registry[node].attribute
}

fn unscoped() -> Abend {
    Abend::new("internal consistency check failure").with_info("node without scope")
}

fn units_of(session: &Session, kind: Attribute) -> Vec<NodeId> {
    session
        .registry
        .preorder(session.top_node)
        .into_iter()
        .filter(|&n| attribute(session, n) == kind)
        .collect()
}

/// The defining identifier and source unit of an identity declaration.
pub fn identity_parts(session: &Session, unit: NodeId) -> Option<(NodeId, NodeId)> {
    let children: Vec<NodeId> = session.registry.children(unit).collect();
    let k = children
        .iter()
        .position(|&n| attribute(session, n) == Attribute::DefiningIdentifier)?;
    Some((children[k], *children.last()?))
}

/// The items of a call's argument group, with nested displays flattened.
pub fn arguments(session: &Session, group: NodeId) -> Vec<NodeId> {
    let mut items = Vec::new();
    for node in inner(session, group) {
        match attribute(session, node) {
            Attribute::CommaSymbol => {}
            Attribute::Collateral => items.extend(arguments(session, node)),
            _ => items.push(node),
        }
    }
    items
}

// ---------------------------------------------------------------------
// Symbol tables and binding
// ---------------------------------------------------------------------

pub fn build_symbol_tables(session: &mut Session) -> Result<(), Abend> {
    for unit in units_of(session, Attribute::IdentityDeclaration) {
        let Some((defining, source)) = identity_parts(session, unit) else {
            continue;
        };
        let scope = session.registry[unit].scope.ok_or_else(unscoped)?;
        let symbol = session.registry[defining].symbol.clone();
        if session
            .registry
            .find_tag_local(scope, TagKind::Identifier, &symbol)
            .is_some()
        {
            session.diagnostic_node(
                Severity::Error,
                defining,
                "S is declared more than once in this range",
                &[],
            )?;
            continue;
        }
        let moid = session.registry[unit].moid;
        let arena = &session.arena;
        let tag = session
            .registry
            .new_tag(arena, TagKind::Identifier, symbol, scope)?;
        let t = &mut session.registry[tag];
        t.moid = moid;
        t.node = Some(defining);
        t.value = Some(source);
        session.registry[defining].tag = Some(tag);
    }
    Ok(())
}

/// Binds every applied identifier to its declaration.
pub fn post_parse_fixups(session: &mut Session) -> Result<(), Abend> {
    let applied: Vec<NodeId> = session
        .registry
        .preorder(session.top_node)
        .into_iter()
        .filter(|&n| attribute(session, n) == Attribute::Identifier)
        .filter(|&n| {
            // Field names inside declarers are not applications.
            session.registry[n]
                .parent
                .is_none_or(|p| !matches!(attribute(session, p), Attribute::FormalPack))
        })
        .collect();
    let mut bound = 0;
    for node in applied {
        let scope = session.registry[node].scope.ok_or_else(unscoped)?;
        let symbol = &session.registry[node].symbol;
        if let Some(tag) = session
            .registry
            .find_tag(scope, TagKind::Identifier, symbol)
        {
            session.registry[node].tag = Some(tag);
            session.registry[tag].used = true;
            bound += 1;
        }
    }
    debug!(bound, "identifiers bound");
    Ok(())
}

// ---------------------------------------------------------------------
// Mode checking
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Coercion {
    None,
    Widening,
    Rowing,
    Incompatible,
}

/// How a value of mode `from` reaches mode `to`.
pub fn coercion(session: &mut Session, from: MoidId, to: MoidId) -> Result<Coercion, Abend> {
    let specials = session.specials()?;
    let standards = session.standards()?;
    if from == to || from == specials.error || to == specials.error {
        return Ok(Coercion::None);
    }
    if session.modes().equivalent(from, to)? {
        return Ok(Coercion::None);
    }
    let target = session.registry[to].kind;
    if from == specials.hip && matches!(target, MoidKind::Ref | MoidKind::Proc) {
        return Ok(Coercion::None);
    }
    if from == standards.int && to == standards.real {
        return Ok(Coercion::Widening);
    }
    if from == standards.char_ && to == standards.string {
        return Ok(Coercion::Rowing);
    }
    if target == MoidKind::Union {
        let members: Vec<MoidId> = session.registry[to].pack.iter().map(|p| p.moid).collect();
        for member in members {
            if session.modes().equivalent(from, member)? {
                return Ok(Coercion::None);
            }
        }
    }
    Ok(Coercion::Incompatible)
}

pub fn check_types(session: &mut Session) -> Result<(), Abend> {
    let Some(root) = session.top_node else {
        return Ok(());
    };
    let mode = serial_mode(session, root)?;
    session.registry[root].moid = Some(mode);
    Ok(())
}

/// Checks the units of a serial clause; its mode is that of the last unit.
fn serial_mode(session: &mut Session, clause: NodeId) -> Result<MoidId, Abend> {
    let void = session.standards()?.void;
    let mut mode = void;
    let units: Vec<NodeId> = session.registry.children(clause).collect();
    for unit in units {
        match attribute(session, unit) {
            Attribute::SemicolonSymbol
            | Attribute::OpenSymbol
            | Attribute::CloseSymbol
            | Attribute::BeginSymbol
            | Attribute::EndSymbol => {}
            _ => mode = operand_mode(session, unit)?,
        }
    }
    Ok(mode)
}

fn operand_mode(session: &mut Session, node: NodeId) -> Result<MoidId, Abend> {
    let specials = session.specials()?;
    let standards = session.standards()?;
    let mode = match attribute(session, node) {
        Attribute::IntDenotation => standards.int,
        Attribute::StringDenotation => {
            if session.registry[node].symbol.chars().count() == 1 {
                standards.char_
            } else {
                standards.string
            }
        }
        Attribute::NilSymbol => specials.hip,
        Attribute::Identifier => match session.registry[node].tag {
            Some(tag) => session.registry[tag].moid.unwrap_or(specials.error),
            None => {
                session.diagnostic_node(
                    Severity::Error,
                    node,
                    "tag S has not been declared properly",
                    &[],
                )?;
                specials.error
            }
        },
        Attribute::Primary => match session.registry[node].sub {
            Some(sub) => operand_mode(session, sub)?,
            None => specials.error,
        },
        Attribute::ClosedClause => serial_mode(session, node)?,
        Attribute::Collateral => {
            for item in arguments(session, node) {
                operand_mode(session, item)?;
            }
            specials.vacuum
        }
        Attribute::Call => call_mode(session, node)?,
        Attribute::IdentityDeclaration => {
            identity(session, node)?;
            return Ok(standards.void);
        }
        Attribute::ModeDeclaration => return Ok(standards.void),
        Attribute::Widening | Attribute::Rowing => {
            return Ok(session.registry[node].moid.unwrap_or(specials.error));
        }
        _ => specials.error,
    };
    session.registry[node].moid = Some(mode);
    Ok(mode)
}

fn identity(session: &mut Session, unit: NodeId) -> Result<(), Abend> {
    let Some((_, source)) = identity_parts(session, unit) else {
        return Ok(());
    };
    let from = operand_mode(session, source)?;
    let Some(to) = session.registry[unit].moid else {
        return Ok(());
    };
    if coercion(session, from, to)? == Coercion::Incompatible {
        session.diagnostic_node(
            Severity::Error,
            source,
            "M cannot be coerced to M",
            &[Arg::Moid(from), Arg::Moid(to)],
        )?;
    }
    Ok(())
}

fn call_mode(session: &mut Session, call: NodeId) -> Result<MoidId, Abend> {
    let specials = session.specials()?;
    let children: Vec<NodeId> = session.registry.children(call).collect();
    let [callee, group] = children[..] else {
        return Ok(specials.error);
    };
    let proc = operand_mode(session, callee)?;
    if proc == specials.error {
        return Ok(proc);
    }
    if session.registry[proc].kind != MoidKind::Proc {
        session.diagnostic_node(
            Severity::Error,
            callee,
            "M value S cannot be called",
            &[Arg::Moid(proc)],
        )?;
        return Ok(specials.error);
    }
    let result = session.registry[proc].sub.unwrap_or(specials.error);
    let parameters: Vec<MoidId> = session.registry[proc].pack.iter().map(|p| p.moid).collect();
    let items = arguments(session, group);

    // A single row parameter takes every argument as one display.
    if let [row] = parameters[..] {
        if session.registry[row].kind == MoidKind::Row {
            let element = session.registry[row].sub.unwrap_or(specials.error);
            for item in items {
                argument(session, item, element)?;
            }
            return Ok(result);
        }
    }
    if items.len() != parameters.len() {
        session.diagnostic_node(
            Severity::Error,
            group,
            "M expects D arguments",
            &[Arg::Moid(proc), Arg::Int(parameters.len() as i64)],
        )?;
        return Ok(result);
    }
    for (item, parameter) in items.into_iter().zip(parameters) {
        argument(session, item, parameter)?;
    }
    Ok(result)
}

fn argument(session: &mut Session, item: NodeId, parameter: MoidId) -> Result<(), Abend> {
    let from = operand_mode(session, item)?;
    if from == session.specials()?.vacuum {
        return Ok(());
    }
    if coercion(session, from, parameter)? == Coercion::Incompatible {
        session.diagnostic_node(
            Severity::Error,
            item,
            "M cannot be coerced to M",
            &[Arg::Moid(from), Arg::Moid(parameter)],
        )?;
    }
    Ok(())
}

/// Wraps identity sources that need widening or rowing.
pub fn insert_coercions(session: &mut Session) -> Result<(), Abend> {
    let Some(root) = session.top_node else {
        return Ok(());
    };
    let mut inserted = 0;
    for unit in units_of(session, Attribute::IdentityDeclaration) {
        let Some((_, source)) = identity_parts(session, unit) else {
            continue;
        };
        let (Some(from), Some(to)) = (session.registry[source].moid, session.registry[unit].moid)
        else {
            continue;
        };
        let kind = match coercion(session, from, to)? {
            Coercion::Widening => Attribute::Widening,
            Coercion::Rowing => Attribute::Rowing,
            _ => continue,
        };
        let (symbol, line, column, scope) = {
            let n = &session.registry[source];
            (n.symbol.clone(), n.line, n.column, n.scope)
        };
        let arena = &session.arena;
        let wrapper = session.registry.new_node(arena, kind, symbol, line, column)?;
        let children: Vec<NodeId> = session
            .registry
            .children(unit)
            .map(|c| if c == source { wrapper } else { c })
            .collect();
        session.registry.set_children(unit, &children);
        session.registry.set_children(wrapper, &[source]);
        let w = &mut session.registry[wrapper];
        w.moid = Some(to);
        w.scope = scope;
        w.nest = Some(unit);
        session.registry[source].nest = Some(wrapper);
        inserted += 1;
    }
    session.registry.renumber(root);
    debug!(inserted, "coercions inserted");
    Ok(())
}

// ---------------------------------------------------------------------
// Checks
// ---------------------------------------------------------------------

/// Warns about declared tags the program never applies.
pub fn check_applications(session: &mut Session) -> Result<(), Abend> {
    let unused: Vec<NodeId> = session
        .registry
        .tags()
        .filter(|(_, t)| matches!(t.kind, TagKind::Identifier | TagKind::Indicant) && !t.used)
        .filter_map(|(_, t)| t.node)
        .filter(|&n| session.registry[session.registry[n].line].number != 0)
        .collect();
    for node in unused {
        session.diagnostic_node(Severity::Warning, node, "tag S is not used", &[])?;
    }
    Ok(())
}

/// A closed clause must not yield a name declared inside it.
pub fn check_scope(session: &mut Session) -> Result<(), Abend> {
    for unit in units_of(session, Attribute::IdentityDeclaration) {
        let Some((_, source)) = identity_parts(session, unit) else {
            continue;
        };
        let clause = match attribute(session, source) {
            Attribute::Primary => session.registry[source].sub,
            _ => None,
        };
        let Some(clause) = clause.filter(|&c| attribute(session, c) == Attribute::ClosedClause)
        else {
            continue;
        };
        let Some(last) = session
            .registry
            .children(clause)
            .filter(|&n| attribute(session, n) == Attribute::Primary)
            .last()
        else {
            continue;
        };
        let Some(yielded) = session.registry[last].sub else {
            continue;
        };
        let Some(tag) = session.registry[yielded].tag else {
            continue;
        };
        let local = session.registry[tag].scope == session.registry[clause].scope.ok_or_else(unscoped)?;
        let Some(moid) = session.registry[tag].moid.filter(|_| local) else {
            continue;
        };
        if session.registry[moid].kind == MoidKind::Ref || session.modes().has_ref(moid)? {
            session.diagnostic_node(
                Severity::Error,
                yielded,
                "S is exported out of its scope",
                &[],
            )?;
        }
    }
    Ok(())
}

/// Flags constructs that other implementations may not accept.
pub fn check_portability(session: &mut Session) -> Result<(), Abend> {
    if !session.options.portcheck {
        return Ok(());
    }
    let pragmats: Vec<_> = session
        .pragmats
        .iter()
        .filter(|p| session.registry[p.line].number != 0)
        .map(|p| (p.line, p.column))
        .collect();
    for (line, column) in pragmats {
        session.forced_warning_line(line, Some(column), "pragmat is not portable", &[])?;
    }
    let refinements: Vec<NodeId> = session.refinements.iter().map(|r| r.node).collect();
    for node in refinements {
        session.forced_warning(node, "refinement S is not portable", &[])?;
    }
    Ok(())
}

/// Numbers the final tree and fills the node register.
pub fn finalise_tree(session: &mut Session) -> Result<(), Abend> {
    let Some(root) = session.top_node else {
        return Ok(());
    };
    session.registry.renumber(root);
    let order = session.registry.preorder(Some(root));
    session.node_register = order;
    for (k, &node) in session.node_register.iter().enumerate() {
        if session.registry[node].number != k {
            return Err(Abend::new("internal consistency check failure").with_info("node register"));
        }
    }
    Ok(())
}
