//! C translation of compilable units.
//!
//! A unit is compilable when it is a `print` call whose arguments are all
//! constant: denotations, `newline`, or identifiers bound by an identity
//! declaration to a denotation. Each such unit becomes a C function that
//! writes through the host table it is handed; the evaluator calls it in
//! place of walking the unit.

use std::io::Write;

use tracing::debug;

use crate::error::Abend;
use crate::registry::{Attribute, NodeId, Status};
use crate::session::Session;
use crate::stdenv::{NEWLINE, PRINT};
use crate::typecheck::arguments;

/// Prefix of every generated unit function.
pub const UNIT_PREFIX: &str = "_a68_unit_";

/// Layout shared with the host table on the evaluator side.
const PRELUDE: &str = "\
#include <stddef.h>

typedef struct a68_host {
  void *context;
  void (*put_int) (void *, long long);
  void (*put_str) (void *, const char *, size_t);
  void (*put_newline) (void *);
} a68_host;
";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Constant {
    Int(i64),
    Text(String),
    Newline,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledUnit {
    pub node: NodeId,
    pub name: String,
}

fn attribute(session: &Session, node: NodeId) -> Attribute {
    session.registry[node].attribute
}

/// The constant a print argument denotes, if it has one.
pub fn constant(session: &Session, node: NodeId) -> Option<Constant> {
    let n = &session.registry[node];
    match n.attribute {
        Attribute::IntDenotation => n.symbol.parse().ok().map(Constant::Int),
        Attribute::StringDenotation => Some(Constant::Text(n.symbol.clone())),
        Attribute::Primary | Attribute::Rowing => constant(session, n.sub?),
        Attribute::Identifier => {
            let tag = &session.registry[n.tag?];
            if tag.node.is_none() {
                return (n.symbol == NEWLINE).then_some(Constant::Newline);
            }
            let value = tag.value?;
            let widened = session.registry[value]
                .parent
                .is_some_and(|p| attribute(session, p) == Attribute::Widening);
            if widened { None } else { constant(session, value) }
        }
        _ => None,
    }
}

/// The constant arguments of a compilable `print` call.
pub fn compilable(session: &Session, unit: NodeId) -> Option<Vec<Constant>> {
    if attribute(session, unit) != Attribute::Call {
        return None;
    }
    let callee = session.registry[unit].sub?;
    let group = session.registry[callee].next?;
    let standard = session.registry[callee]
        .tag
        .is_some_and(|t| session.registry[t].node.is_none());
    if session.registry[callee].symbol != PRINT || !standard {
        return None;
    }
    arguments(session, group)
        .into_iter()
        .map(|item| constant(session, item))
        .collect()
}

/// Writes `text` as a C string literal.
fn c_literal(text: &str) -> String {
    let mut literal = String::with_capacity(text.len() + 2);
    literal.push('"');
    for byte in text.bytes() {
        match byte {
            b'"' => literal.push_str("\\\""),
            b'\\' => literal.push_str("\\\\"),
            b'\n' => literal.push_str("\\n"),
            0x20..=0x7e => literal.push(byte as char),
            _ => literal.push_str(&format!("\\{byte:03o}")),
        }
    }
    literal.push('"');
    literal
}

fn emit_unit(
    out: &mut dyn Write,
    name: &str,
    line: u32,
    constants: &[Constant],
) -> std::io::Result<()> {
    writeln!(out)?;
    writeln!(out, "/* line {line} */")?;
    writeln!(out, "int {name} (const a68_host *h)")?;
    writeln!(out, "{{")?;
    for constant in constants {
        match constant {
            Constant::Int(value) => writeln!(out, "  h->put_int (h->context, {value}LL);")?,
            Constant::Text(text) => writeln!(
                out,
                "  h->put_str (h->context, {}, {});",
                c_literal(text),
                text.len()
            )?,
            Constant::Newline => writeln!(out, "  h->put_newline (h->context);")?,
        }
    }
    writeln!(out, "  return 0;")?;
    writeln!(out, "}}")
}

/// Translates every compilable unit, marks the nodes compiled, and returns
/// the generated entry points.
pub fn emit_c(session: &mut Session, out: &mut dyn Write) -> Result<Vec<CompiledUnit>, Abend> {
    let io = |e: std::io::Error| Abend::new("cannot write object file").with_os_error(&e);
    let source = session.artifacts.source.display().to_string();
    writeln!(out, "/* {source} */").map_err(io)?;
    out.write_all(PRELUDE.as_bytes()).map_err(io)?;

    let mut units = Vec::new();
    let register = session.node_register.clone();
    for node in register {
        let Some(constants) = compilable(session, node) else {
            continue;
        };
        let name = format!("{UNIT_PREFIX}{}", session.registry[node].number);
        let line = session.registry[session.registry[node].line].number;
        emit_unit(out, &name, line, &constants).map_err(io)?;
        let n = &mut session.registry[node];
        n.status.insert(Status::COMPILED);
        n.compile_name = Some(name.clone());
        units.push(CompiledUnit { node, name });
    }
    debug!(units = units.len(), "c translation emitted");
    Ok(units)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::front_end;
    use crate::session::tests::session_with_source;

    fn translate(text: &str) -> (Session, String, Vec<CompiledUnit>, tempfile::TempDir) {
        let (mut session, _, dir) = session_with_source(text);
        front_end(&mut session).unwrap();
        assert_eq!(session.error_count(), 0);
        let mut out = Vec::new();
        let units = emit_c(&mut session, &mut out).unwrap();
        (session, String::from_utf8(out).unwrap(), units, dir)
    }

    #[test]
    fn constant_print_becomes_a_function() {
        let (session, c, units, _dir) = translate("INT n = 42;\nprint ((\"n=\", n, newline))");
        assert_eq!(units.len(), 1);
        let node = units[0].node;
        assert!(session.registry[node].status.contains(Status::COMPILED));
        assert_eq!(session.registry[node].compile_name.as_deref(), Some(units[0].name.as_str()));
        assert!(c.contains(&format!("int {} (const a68_host *h)", units[0].name)));
        assert!(c.contains("h->put_str (h->context, \"n=\", 2);"));
        assert!(c.contains("h->put_int (h->context, 42LL);"));
        assert!(c.contains("h->put_newline (h->context);"));
    }

    #[test]
    fn non_constant_arguments_stay_interpreted() {
        let (_, c, units, _dir) = translate("print (maxint)");
        assert!(units.is_empty());
        assert!(c.contains("typedef struct a68_host"));
    }

    #[test]
    fn widened_identifiers_are_not_constant() {
        let (_, _, units, _dir) = translate("REAL r = 1; print (r)");
        assert!(units.is_empty());
    }

    #[test]
    fn literals_are_escaped() {
        assert_eq!(c_literal("a\"b\\c"), "\"a\\\"b\\\\c\"");
        assert_eq!(c_literal("\u{e9}"), "\"\\303\\251\"");
    }
}
