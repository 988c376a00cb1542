//! Mode table.
//!
//! Declarers are parsed into modes, indicants are checked for
//! well-formedness and resolved to the modes they stand for, and
//! structurally equivalent modes are folded onto one representative.

use std::collections::HashMap;

use tracing::debug;

use crate::diagnostic::Severity;
use crate::error::Abend;
use crate::parser::inner;
use crate::registry::{Attribute, MoidId, MoidKind, NodeId, ScopeId, TagKind};
use crate::session::Session;

/// A cursor over the items of one declarer context.
struct Cursor<'a> {
    items: &'a [NodeId],
    pos: usize,
    /// Node blamed when the items run out.
    anchor: NodeId,
    scope: ScopeId,
}

impl Cursor<'_> {
    fn peek(&self) -> Option<NodeId> {
        self.items.get(self.pos).copied()
    }

    fn here(&self) -> NodeId {
        self.peek().unwrap_or(self.anchor)
    }
}

fn attribute(session: &Session, node: NodeId) -> Attribute {
    session.registry[node].attribute
}

fn fail(session: &mut Session, node: NodeId, template: &str) -> Result<MoidId, Abend> {
    session.diagnostic_node(Severity::SyntaxError, node, template, &[])?;
    Ok(session.specials()?.error)
}

fn new_mode(
    session: &mut Session,
    kind: MoidKind,
    sub: Option<MoidId>,
    node: NodeId,
) -> Result<MoidId, Abend> {
    let arena = &session.arena;
    let moid = session.registry.new_moid(arena, kind, "")?;
    session.registry[moid].sub = sub;
    session.registry[moid].node = Some(node);
    Ok(moid)
}

/// Parses one declarer at the cursor.
fn declarer(session: &mut Session, cursor: &mut Cursor<'_>, allow_void: bool) -> Result<MoidId, Abend> {
    let Some(node) = cursor.peek() else {
        return fail(session, cursor.anchor, "declarer expected after S");
    };
    cursor.pos += 1;
    match attribute(session, node) {
        Attribute::BoldTag => {
            let symbol = session.registry[node].symbol.clone();
            let Some(tag) = session
                .registry
                .find_tag(cursor.scope, TagKind::Indicant, &symbol)
            else {
                session.diagnostic_node(
                    Severity::Error,
                    node,
                    "tag S has not been declared properly",
                    &[],
                )?;
                return Ok(session.specials()?.error);
            };
            session.registry[tag].used = true;
            let moid = session.registry[tag]
                .moid
                .ok_or_else(|| Abend::new("internal consistency check failure").with_info(symbol))?;
            if moid == session.standards()?.void && !allow_void {
                return fail(session, node, "S cannot be used here");
            }
            session.registry[node].moid = Some(moid);
            Ok(moid)
        }
        Attribute::RefSymbol => {
            let sub = declarer(session, cursor, false)?;
            new_mode(session, MoidKind::Ref, Some(sub), node)
        }
        Attribute::FlexSymbol => {
            let row = cursor.peek();
            let sub = declarer(session, cursor, false)?;
            if session.registry[sub].kind != MoidKind::Row {
                return fail(session, row.unwrap_or(node), "S does not start a row declarer");
            }
            new_mode(session, MoidKind::Flex, Some(sub), node)
        }
        Attribute::ProcSymbol => {
            let mut parameters = Vec::new();
            if let Some(pack) = cursor.peek() {
                if attribute(session, pack) == Attribute::FormalPack {
                    cursor.pos += 1;
                    parameters = declarer_list(session, pack, cursor.scope, false)?;
                }
            }
            let result = declarer(session, cursor, true)?;
            let moid = new_mode(session, MoidKind::Proc, Some(result), node)?;
            for parameter in parameters {
                let arena = &session.arena;
                session.registry.new_pack(arena, moid, parameter, None)?;
            }
            Ok(moid)
        }
        Attribute::UnionSymbol => {
            let Some(pack) = cursor.peek().filter(|&p| attribute(session, p) == Attribute::FormalPack)
            else {
                return fail(session, cursor.here(), "S does not start a pack");
            };
            cursor.pos += 1;
            let members = declarer_list(session, pack, cursor.scope, true)?;
            let moid = new_mode(session, MoidKind::Union, None, node)?;
            for member in members {
                let arena = &session.arena;
                session.registry.new_pack(arena, moid, member, None)?;
            }
            Ok(moid)
        }
        Attribute::StructSymbol => {
            let Some(pack) = cursor.peek().filter(|&p| attribute(session, p) == Attribute::FormalPack)
            else {
                return fail(session, cursor.here(), "S does not start a pack");
            };
            cursor.pos += 1;
            struct_pack(session, node, pack, cursor.scope)
        }
        Attribute::Bounds => {
            let items = inner(session, node);
            if let Some(&bad) = items
                .iter()
                .find(|&&n| attribute(session, n) != Attribute::CommaSymbol)
            {
                return fail(session, bad, "S cannot appear in formal bounds");
            }
            let sub = declarer(session, cursor, false)?;
            let moid = new_mode(session, MoidKind::Row, Some(sub), node)?;
            session.registry[moid].dim = items.len() + 1;
            Ok(moid)
        }
        _ => fail(session, node, "S does not start a declarer"),
    }
}

/// `declarer {, declarer}` inside a pack.
fn declarer_list(
    session: &mut Session,
    pack: NodeId,
    scope: ScopeId,
    allow_void: bool,
) -> Result<Vec<MoidId>, Abend> {
    let items = inner(session, pack);
    let mut cursor = Cursor {
        items: &items,
        pos: 0,
        anchor: pack,
        scope,
    };
    let mut list = Vec::new();
    loop {
        list.push(declarer(session, &mut cursor, allow_void)?);
        match cursor.peek() {
            None => return Ok(list),
            Some(n) if attribute(session, n) == Attribute::CommaSymbol => cursor.pos += 1,
            Some(n) => {
                fail(session, n, "S is not expected here")?;
                return Ok(list);
            }
        }
    }
}

/// `declarer field {, field} {, declarer field ...}`
fn struct_pack(
    session: &mut Session,
    node: NodeId,
    pack: NodeId,
    scope: ScopeId,
) -> Result<MoidId, Abend> {
    let items = inner(session, pack);
    let mut cursor = Cursor {
        items: &items,
        pos: 0,
        anchor: pack,
        scope,
    };
    let moid = new_mode(session, MoidKind::Struct, None, node)?;
    'fields: loop {
        let field = declarer(session, &mut cursor, false)?;
        loop {
            match cursor.peek() {
                Some(name) if attribute(session, name) == Attribute::Identifier => {
                    let text = session.registry[name].symbol.clone();
                    let arena = &session.arena;
                    session.registry.new_pack(arena, moid, field, Some(text))?;
                    cursor.pos += 1;
                }
                _ => {
                    let here = cursor.here();
                    fail(session, here, "field name expected at S")?;
                    return Ok(session.specials()?.error);
                }
            }
            match cursor.peek() {
                None => break 'fields,
                Some(comma) if attribute(session, comma) == Attribute::CommaSymbol => {
                    cursor.pos += 1;
                    let next_is_name = cursor
                        .peek()
                        .is_some_and(|n| attribute(session, n) == Attribute::Identifier);
                    if !next_is_name {
                        continue 'fields;
                    }
                }
                Some(other) => {
                    fail(session, other, "S is not expected here")?;
                    break 'fields;
                }
            }
        }
    }
    Ok(moid)
}

fn declarations(session: &Session, kind: Attribute) -> Vec<NodeId> {
    session
        .registry
        .preorder(session.top_node)
        .into_iter()
        .filter(|&n| attribute(session, n) == kind)
        .collect()
}

/// Follows indicants to the mode they stand for.
fn resolve(session: &Session, mut moid: MoidId, error: MoidId) -> MoidId {
    for _ in 0..=session.registry.moid_count() {
        let m = &session.registry[moid];
        if m.kind != MoidKind::Indicant {
            return moid;
        }
        match m.equivalent {
            Some(next) if m.well_formed => moid = next,
            _ => return error,
        }
    }
    error
}

/// Rewrites every mode link through `map`.
fn relink_modes(session: &mut Session, map: &dyn Fn(&Session, MoidId) -> MoidId) {
    for k in 0..session.registry.moid_count() {
        let id = MoidId::from_index(k);
        if session.registry[id].kind == MoidKind::Indicant {
            continue;
        }
        if let Some(sub) = session.registry[id].sub {
            let target = map(session, sub);
            session.registry[id].sub = Some(target);
        }
        for p in 0..session.registry[id].pack.len() {
            let target = map(session, session.registry[id].pack[p].moid);
            session.registry[id].pack[p].moid = target;
        }
    }
    for k in 0..session.registry.node_count() {
        let id = NodeId::from_index(k);
        if let Some(moid) = session.registry[id].moid {
            let target = map(session, moid);
            session.registry[id].moid = Some(target);
        }
    }
    let tags: Vec<_> = session.registry.tags().map(|(id, _)| id).collect();
    for tag in tags {
        if let Some(moid) = session.registry[tag].moid {
            let target = map(session, moid);
            session.registry[tag].moid = Some(target);
        }
    }
}

pub fn build_type_table(session: &mut Session) -> Result<(), Abend> {
    if session.top_node.is_none() {
        return Ok(());
    }
    let mode_declarations = declarations(session, Attribute::ModeDeclaration);

    // Indicant modes first so declarers may refer forward.
    let mut indicants = Vec::new();
    for &unit in &mode_declarations {
        let defining: Vec<NodeId> = session
            .registry
            .children(unit)
            .filter(|&n| attribute(session, n) == Attribute::DefiningIndicant)
            .collect();
        for node in defining {
            let symbol = session.registry[node].symbol.clone();
            let arena = &session.arena;
            let moid = session
                .registry
                .new_moid(arena, MoidKind::Indicant, symbol)?;
            session.registry[moid].node = Some(node);
            session.registry[node].moid = Some(moid);
            if let Some(tag) = session.registry[node].tag {
                session.registry[tag].moid = Some(moid);
            }
            indicants.push((node, moid));
        }
    }

    for &unit in &mode_declarations {
        let items: Vec<NodeId> = session.registry.children(unit).collect();
        let scope = session.registry[unit]
            .scope
            .ok_or_else(|| Abend::new("internal consistency check failure").with_info("unscoped unit"))?;
        let mut k = 1;
        while let Some(&defining) = items.get(k) {
            let Some(indicant) = session.registry[defining].moid else {
                break;
            };
            let mut cursor = Cursor {
                items: &items,
                pos: k + 2,
                anchor: items[k + 1],
                scope,
            };
            let declared = declarer(session, &mut cursor, false)?;
            session.registry[indicant].equivalent = Some(declared);
            match cursor.peek() {
                None => break,
                Some(comma)
                    if attribute(session, comma) == Attribute::CommaSymbol
                        && cursor.items.get(cursor.pos + 1).is_some_and(|&n| {
                            attribute(session, n) == Attribute::DefiningIndicant
                        }) =>
                {
                    k = cursor.pos + 1;
                }
                Some(other) => {
                    fail(session, other, "S is not expected here")?;
                    break;
                }
            }
        }
    }

    for unit in declarations(session, Attribute::IdentityDeclaration) {
        let items: Vec<NodeId> = session.registry.children(unit).collect();
        let Some(k) = items
            .iter()
            .position(|&n| attribute(session, n) == Attribute::DefiningIdentifier)
        else {
            continue;
        };
        let scope = session.registry[unit]
            .scope
            .ok_or_else(|| Abend::new("internal consistency check failure").with_info("unscoped unit"))?;
        let mut cursor = Cursor {
            items: &items[..k],
            pos: 0,
            anchor: unit,
            scope,
        };
        let declared = declarer(session, &mut cursor, false)?;
        if let Some(extra) = cursor.peek() {
            fail(session, extra, "S is not expected here")?;
        }
        session.registry[unit].moid = Some(declared);
        session.registry[items[k]].moid = Some(declared);
    }

    for &(node, indicant) in &indicants {
        if !session.modes().well_formed(indicant)? {
            session.registry[indicant].well_formed = false;
            session.diagnostic_node(
                Severity::Error,
                node,
                "S does not specify a well formed mode",
                &[],
            )?;
        }
    }

    let error = session.specials()?.error;
    relink_modes(session, &|s, m| resolve(s, m, error));
    for &(node, indicant) in &indicants {
        let target = resolve(session, indicant, error);
        session.registry[node].moid = Some(target);
        if let Some(tag) = session.registry[node].tag {
            session.registry[tag].moid = Some(target);
        }
    }

    let canon = fold_equivalent_modes(session)?;
    if !canon.is_empty() {
        relink_modes(session, &|_, m| canon.get(&m).copied().unwrap_or(m));
    }
    cross_link(session);
    measure(session)?;
    debug!(
        moids = session.registry.moid_count(),
        folded = canon.len(),
        "mode table built"
    );
    Ok(())
}

/// Maps every composite mode to the first equivalent one.
fn fold_equivalent_modes(session: &mut Session) -> Result<HashMap<MoidId, MoidId>, Abend> {
    let composites: Vec<MoidId> = session
        .registry
        .moids()
        .filter(|(_, m)| {
            matches!(
                m.kind,
                MoidKind::Ref
                    | MoidKind::Flex
                    | MoidKind::Row
                    | MoidKind::Struct
                    | MoidKind::Union
                    | MoidKind::Proc
            )
        })
        .map(|(id, _)| id)
        .collect();
    let mut canonical: Vec<MoidId> = Vec::new();
    let mut canon = HashMap::new();
    for moid in composites {
        let kind = session.registry[moid].kind;
        let mut found = None;
        for &c in &canonical {
            if session.registry[c].kind == kind && session.modes().equivalent(c, moid)? {
                found = Some(c);
                break;
            }
        }
        match found {
            Some(c) => {
                session.registry[moid].equivalent = Some(c);
                canon.insert(moid, c);
            }
            None => canonical.push(moid),
        }
    }
    Ok(canon)
}

fn is_canonical(session: &Session, moid: MoidId) -> bool {
    let m = &session.registry[moid];
    m.kind != MoidKind::Indicant && m.equivalent.is_none()
}

fn cross_link(session: &mut Session) {
    let ids: Vec<MoidId> = session
        .registry
        .moids()
        .map(|(id, _)| id)
        .filter(|&id| is_canonical(session, id))
        .collect();
    for &id in &ids {
        let (kind, sub) = (session.registry[id].kind, session.registry[id].sub);
        match (kind, sub) {
            (MoidKind::Row, Some(sub)) => {
                session.registry[id].slice = Some(sub);
                if session.registry[sub].rowed.is_none() {
                    session.registry[sub].rowed = Some(id);
                }
            }
            (MoidKind::Flex, Some(sub)) => {
                session.registry[id].deflexed = Some(sub);
                session.registry[id].trim = Some(sub);
            }
            _ => {}
        }
    }
    // A name of a row also names its elements: REF [] INT -> REF INT.
    for &id in &ids {
        if session.registry[id].kind != MoidKind::Ref {
            continue;
        }
        let slice = session.registry[id]
            .sub
            .and_then(|row| session.registry[row].slice);
        let Some(slice) = slice else {
            continue;
        };
        let name = ids.iter().copied().find(|&r| {
            session.registry[r].kind == MoidKind::Ref && session.registry[r].sub == Some(slice)
        });
        session.registry[id].name = name;
    }
}

fn measure(session: &mut Session) -> Result<(), Abend> {
    let ids: Vec<MoidId> = session.registry.moids().map(|(id, _)| id).collect();
    for id in ids {
        if !is_canonical(session, id) {
            continue;
        }
        let size = session.modes().size(id)?;
        let has_rows = session.modes().has_rows(id)?;
        let m = &mut session.registry[id];
        m.size = size;
        m.has_rows = has_rows || matches!(m.kind, MoidKind::Row | MoidKind::Flex);
    }
    for k in 0..session.registry.node_count() {
        if let Some(moid) = session.registry[NodeId::from_index(k)].moid {
            session.registry[moid].used = true;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::tokenise;
    use crate::parser::{check_structure, parse_pass_one, parse_pass_two};
    use crate::session::tests::session_with_source;
    use crate::stdenv::{build_standard_environment, make_special_modes};

    fn build(text: &str) -> (Session, tempfile::TempDir) {
        let (mut session, _, dir) = session_with_source(text);
        tokenise(&mut session).unwrap();
        make_special_modes(&mut session).unwrap();
        parse_pass_one(&mut session).unwrap();
        build_standard_environment(&mut session).unwrap();
        parse_pass_two(&mut session).unwrap();
        check_structure(&mut session).unwrap();
        build_type_table(&mut session).unwrap();
        (session, dir)
    }

    fn indicant(session: &Session, name: &str) -> MoidId {
        let (_, tag) = session
            .registry
            .tags()
            .find(|(_, t)| t.kind == TagKind::Indicant && t.symbol == name)
            .unwrap();
        tag.moid.unwrap()
    }

    #[test]
    fn recursive_mode_resolves_to_a_cycle() {
        let (mut session, _dir) = build("MODE LIST = STRUCT (INT head, REF LIST tail)");
        let list = indicant(&session, "LIST");
        assert_eq!(session.registry[list].kind, MoidKind::Struct);
        let text = session.mode_string(list, None).unwrap();
        assert_eq!(text, "STRUCT (INT head, REF SELF tail)");
    }

    #[test]
    fn ill_formed_modes_are_errors() {
        let (session, _dir) = build("MODE BAD = STRUCT (INT x, BAD y)");
        assert_eq!(session.error_count(), 1);
        let (session, _dir) = build("MODE A = B, B = A");
        assert_eq!(session.error_count(), 2);
    }

    #[test]
    fn equivalent_modes_fold_together() {
        let (session, _dir) =
            build("MODE P = STRUCT (INT x, REF P next); MODE Q = STRUCT (INT x, REF Q next)");
        assert_eq!(session.error_count(), 0);
        assert_eq!(indicant(&session, "P"), indicant(&session, "Q"));
    }

    #[test]
    fn identity_declarers_get_modes() {
        let (mut session, _dir) = build("REF [] INT r = NIL; PROC (INT, REAL) VOID p = NIL");
        assert_eq!(session.error_count(), 0);
        let units: Vec<NodeId> = declarations(&session, Attribute::IdentityDeclaration);
        let first = session.registry[units[0]].moid.unwrap();
        assert_eq!(session.mode_string(first, None).unwrap(), "REF [] INT");
        let second = session.registry[units[1]].moid.unwrap();
        assert_eq!(session.mode_string(second, None).unwrap(), "PROC (INT, REAL) VOID");
        let row = session.registry[first].sub.unwrap();
        assert_eq!(session.registry[row].slice, session.standards.map(|s| s.int));
    }

    #[test]
    fn undeclared_indicant_and_void_misuse() {
        let (session, _dir) = build("NOPE n = 1; VOID v = 2");
        assert_eq!(session.error_count(), 2);
    }

    #[test]
    fn struct_fields_share_a_declarer() {
        let (mut session, _dir) = build("MODE V = STRUCT (REAL x, y, INT n)");
        let v = indicant(&session, "V");
        assert_eq!(session.registry[v].dim, 3);
        assert_eq!(session.registry[v].size, 24);
        assert_eq!(
            session.mode_string(v, None).unwrap(),
            "STRUCT (REAL x, REAL y, INT n)"
        );
    }
}
