//! Special modes and the standard environment.

use tracing::debug;

use crate::error::Abend;
use crate::moids::standard_size;
use crate::registry::{MoidId, MoidKind, ScopeId, TagKind};
use crate::session::{Session, SpecialModes, StandardModes};

/// Standard identifiers known to the evaluator.
pub const PRINT: &str = "print";
pub const NEWLINE: &str = "newline";
pub const MAX_INT: &str = "maxint";
pub const PI: &str = "pi";

/// Creates the modes every later phase may refer to before any
/// declaration is seen.
pub fn make_special_modes(session: &mut Session) -> Result<(), Abend> {
    let arena = &session.arena;
    let registry = &mut session.registry;
    let mut special = |kind, symbol: &str| registry.new_moid(arena, kind, symbol);
    let specials = SpecialModes {
        hip: special(MoidKind::Hip, "HIP")?,
        undefined: special(MoidKind::Undefined, "UNDEFINED")?,
        error: special(MoidKind::Error, "ERROR")?,
        vacuum: special(MoidKind::Vacuum, "VACUUM")?,
        c_string: special(MoidKind::CString, "C-STRING")?,
        collitem: special(MoidKind::Collitem, "COLLITEM")?,
    };
    for id in [
        specials.hip,
        specials.undefined,
        specials.error,
        specials.vacuum,
        specials.c_string,
        specials.collitem,
    ] {
        session.registry[id].standard = true;
    }
    session.specials = Some(specials);
    Ok(())
}

fn standard_mode(session: &mut Session, scope: ScopeId, symbol: &str) -> Result<MoidId, Abend> {
    let arena = &session.arena;
    let moid = session.registry.new_moid(arena, MoidKind::Standard, symbol)?;
    let m = &mut session.registry[moid];
    m.standard = true;
    m.size = standard_size(symbol);
    let tag = session.registry.new_tag(arena, TagKind::Indicant, symbol, scope)?;
    session.registry[tag].moid = Some(moid);
    Ok(moid)
}

fn composite(
    session: &mut Session,
    kind: MoidKind,
    sub: Option<MoidId>,
    pack: &[MoidId],
) -> Result<MoidId, Abend> {
    let arena = &session.arena;
    let moid = session.registry.new_moid(arena, kind, "")?;
    for &member in pack {
        session.registry.new_pack(arena, moid, member, None)?;
    }
    let m = &mut session.registry[moid];
    m.sub = sub;
    m.standard = true;
    Ok(moid)
}

fn standard_identifier(
    session: &mut Session,
    scope: ScopeId,
    symbol: &str,
    moid: MoidId,
) -> Result<(), Abend> {
    let arena = &session.arena;
    let tag = session
        .registry
        .new_tag(arena, TagKind::Identifier, symbol, scope)?;
    let t = &mut session.registry[tag];
    t.moid = Some(moid);
    t.used = true;
    Ok(())
}

/// Opens the outermost scope and declares the standard modes and
/// identifiers in it.
pub fn build_standard_environment(session: &mut Session) -> Result<(), Abend> {
    let arena = &session.arena;
    let scope = session.registry.new_scope(arena, None)?;
    session.standenv = Some(scope);

    let int = standard_mode(session, scope, "INT")?;
    let real = standard_mode(session, scope, "REAL")?;
    let bool_ = standard_mode(session, scope, "BOOL")?;
    let char_ = standard_mode(session, scope, "CHAR")?;
    let void = standard_mode(session, scope, "VOID")?;
    let string = standard_mode(session, scope, "STRING")?;
    let proc_void = composite(session, MoidKind::Proc, Some(void), &[])?;
    let simplout = composite(
        session,
        MoidKind::Union,
        None,
        &[int, real, bool_, char_, string, proc_void],
    )?;
    let row = composite(session, MoidKind::Row, Some(simplout), &[])?;
    session.registry[row].dim = 1;
    session.registry[simplout].rowed = Some(row);
    session.registry[row].slice = Some(simplout);
    let print = composite(session, MoidKind::Proc, Some(void), &[row])?;

    standard_identifier(session, scope, PRINT, print)?;
    standard_identifier(session, scope, NEWLINE, proc_void)?;
    standard_identifier(session, scope, MAX_INT, int)?;
    standard_identifier(session, scope, PI, real)?;

    session.standards = Some(StandardModes {
        int,
        real,
        bool_,
        char_,
        void,
        string,
        simplout,
        proc_void,
        print,
    });
    debug!(moids = session.registry.moid_count(), "standard environment built");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::Options;
    use crate::session::tests::SharedBuffer;

    fn session() -> Session {
        let mut session = Session::new(Options::for_source("prog"), Box::new(SharedBuffer::default())).unwrap();
        make_special_modes(&mut session).unwrap();
        build_standard_environment(&mut session).unwrap();
        session
    }

    #[test]
    fn standard_modes_are_visible_as_indicants() {
        let session = session();
        let scope = session.standenv.unwrap();
        let tag = session
            .registry
            .find_tag(scope, TagKind::Indicant, "STRING")
            .unwrap();
        let standards = session.standards.unwrap();
        assert_eq!(session.registry[tag].moid, Some(standards.string));
        assert_eq!(session.registry[standards.int].size, 8);
    }

    #[test]
    fn print_takes_a_row_of_simplout() {
        let mut session = session();
        let standards = session.standards.unwrap();
        let text = session.mode_string(standards.print, None).unwrap();
        assert_eq!(
            text,
            "PROC ([] UNION (INT, REAL, BOOL, CHAR, STRING, PROC VOID)) VOID"
        );
    }

    #[test]
    fn special_modes_precede_the_environment() {
        let session = session();
        let specials = session.specials.unwrap();
        assert!(specials.hip < session.standards.unwrap().int);
        assert_eq!(session.registry[specials.error].kind, MoidKind::Error);
    }
}
