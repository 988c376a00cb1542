//! Genie: the tree-walking evaluator.
//!
//! Executes the serial clauses of the particular program. Units the native
//! backend compiled are run through their loaded entry points; everything
//! else is walked here.

use std::collections::HashMap;
use std::io::Write;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::diagnostic::{Arg, Severity};
use crate::error::Abend;
use crate::native::LoadedModule;
use crate::registry::{Attribute, NodeId, Status, TagId};
use crate::session::Session;
use crate::stdenv::{MAX_INT, NEWLINE, PI, PRINT};
use crate::typecheck::{arguments, identity_parts};

/// Width of an integer printed by `print`, sign included.
pub const INT_WIDTH: usize = 11;

/// Formats an integer the way `print` does.
pub fn format_int(value: i64) -> String {
    format!("{value:>+width$}", width = INT_WIDTH)
}

/// Formats a real as a signed mantissa and a right aligned signed exponent.
pub fn format_real(value: f64) -> String {
    let text = format!("{value:+.14e}");
    match text.split_once('e') {
        Some((mantissa, exponent)) => {
            let exponent: i32 = exponent.parse().unwrap_or(0);
            format!("{mantissa}e{exponent:>+4}")
        }
        None => text,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StandardProc {
    Print,
    Newline,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Void,
    Int(i64),
    Real(f64),
    Bool(bool),
    Char(char),
    Text(String),
    Proc(StandardProc),
    Nil,
}

/// Why evaluation stopped early.
enum Stop {
    /// A runtime error has been recorded.
    Runtime,
    Abend(Abend),
}

impl From<Abend> for Stop {
    fn from(abend: Abend) -> Self {
        Stop::Abend(abend)
    }
}

pub struct Genie<'s> {
    session: &'s mut Session,
    module: Option<&'s LoadedModule>,
    values: HashMap<TagId, Value>,
    pub(crate) deadline: Option<Instant>,
    out: Vec<u8>,
}

impl<'s> Genie<'s> {
    pub fn new(session: &'s mut Session, module: Option<&'s LoadedModule>) -> Self {
        let deadline = match session.options.time_limit {
            0 => None,
            seconds => Some(Instant::now() + Duration::from_secs(seconds)),
        };
        Genie {
            session,
            module,
            values: HashMap::new(),
            deadline,
            out: Vec::new(),
        }
    }

    /// Runs the program. Runtime errors are recorded in the ledger; only
    /// abends are returned.
    pub fn run(mut self) -> Result<(), Abend> {
        let Some(root) = self.session.top_node else {
            return Ok(());
        };
        self.session.arena.seal();
        info!(compiled = self.module.map_or(0, LoadedModule::len), "genie");
        let started = Instant::now();
        let outcome = self.serial(root);
        self.flush()?;
        debug!(elapsed = ?started.elapsed(), "genie finished");
        match outcome {
            Ok(_) | Err(Stop::Runtime) => Ok(()),
            Err(Stop::Abend(abend)) => Err(abend),
        }
    }

    fn flush(&mut self) -> Result<(), Abend> {
        let terminal = &mut self.session.terminal;
        terminal
            .write_all(&self.out)
            .and_then(|_| terminal.flush())
            .map_err(|e| Abend::new("cannot write to terminal").with_os_error(&e))?;
        self.out.clear();
        Ok(())
    }

    fn runtime_error(&mut self, node: NodeId, template: &str, args: &[Arg]) -> Stop {
        match self
            .session
            .diagnostic_node(Severity::RuntimeError, node, template, args)
        {
            Ok(()) => Stop::Runtime,
            Err(abend) => Stop::Abend(abend),
        }
    }

    fn attribute(&self, node: NodeId) -> Attribute {
        self.session.registry[node].attribute
    }

    fn serial(&mut self, clause: NodeId) -> Result<Value, Stop> {
        let mut value = Value::Void;
        let units: Vec<NodeId> = self.session.registry.children(clause).collect();
        for unit in units {
            match self.attribute(unit) {
                Attribute::SemicolonSymbol
                | Attribute::OpenSymbol
                | Attribute::CloseSymbol
                | Attribute::BeginSymbol
                | Attribute::EndSymbol => {}
                _ => value = self.unit(unit)?,
            }
        }
        Ok(value)
    }

    fn unit(&mut self, node: NodeId) -> Result<Value, Stop> {
        self.session.current_node = Some(node);
        if self.deadline.is_some_and(|d| Instant::now() >= d) {
            return Err(self.runtime_error(node, "time limit exceeded", &[]));
        }
        match self.attribute(node) {
            Attribute::IdentityDeclaration => {
                if let Some((defining, source)) = identity_parts(self.session, node) {
                    let value = self.unit(source)?;
                    if let Some(tag) = self.session.registry[defining].tag {
                        self.values.insert(tag, value);
                    }
                }
                Ok(Value::Void)
            }
            Attribute::ModeDeclaration => Ok(Value::Void),
            Attribute::Call => self.call(node),
            _ => self.operand(node),
        }
    }

    fn operand(&mut self, node: NodeId) -> Result<Value, Stop> {
        let n = &self.session.registry[node];
        match n.attribute {
            Attribute::IntDenotation => match n.symbol.parse() {
                Ok(value) => Ok(Value::Int(value)),
                Err(_) => Err(self.runtime_error(node, "S is out of range", &[])),
            },
            Attribute::StringDenotation => {
                let mut chars = n.symbol.chars();
                Ok(match (chars.next(), chars.next()) {
                    (Some(c), None) => Value::Char(c),
                    _ => Value::Text(n.symbol.clone()),
                })
            }
            Attribute::NilSymbol => Ok(Value::Nil),
            Attribute::Identifier => self.identifier(node),
            Attribute::Primary | Attribute::Unit => match n.sub {
                Some(sub) => self.unit(sub),
                None => Ok(Value::Void),
            },
            Attribute::ClosedClause => self.serial(node),
            Attribute::Collateral => {
                for item in arguments(self.session, node) {
                    self.unit(item)?;
                }
                Ok(Value::Void)
            }
            Attribute::Widening => match n.sub.map(|s| self.unit(s)).transpose()? {
                Some(Value::Int(value)) => Ok(Value::Real(value as f64)),
                Some(value) => Ok(value),
                None => Ok(Value::Void),
            },
            Attribute::Rowing => match n.sub.map(|s| self.unit(s)).transpose()? {
                Some(Value::Char(c)) => Ok(Value::Text(c.to_string())),
                Some(value) => Ok(value),
                None => Ok(Value::Void),
            },
            Attribute::Call => self.call(node),
            _ => Ok(Value::Void),
        }
    }

    fn identifier(&mut self, node: NodeId) -> Result<Value, Stop> {
        let n = &self.session.registry[node];
        let Some(tag) = n.tag else {
            return Err(self.runtime_error(node, "S has no value", &[]));
        };
        if self.session.registry[tag].node.is_none() {
            return Ok(match n.symbol.as_str() {
                PRINT => Value::Proc(StandardProc::Print),
                NEWLINE => Value::Proc(StandardProc::Newline),
                MAX_INT => Value::Int(i64::MAX),
                PI => Value::Real(std::f64::consts::PI),
                _ => Value::Void,
            });
        }
        match self.values.get(&tag) {
            Some(value) => Ok(value.clone()),
            None => Err(self.runtime_error(node, "S has not been initialised", &[])),
        }
    }

    fn call(&mut self, node: NodeId) -> Result<Value, Stop> {
        if self.session.registry[node].status.contains(Status::COMPILED) {
            if let Some(status) = self.module.and_then(|m| m.call(node, &mut self.out)) {
                if status != 0 {
                    return Err(self.runtime_error(
                        node,
                        "compiled unit failed with status D",
                        &[Arg::Int(i64::from(status))],
                    ));
                }
                return Ok(Value::Void);
            }
        }
        let children: Vec<NodeId> = self.session.registry.children(node).collect();
        let [callee, group] = children[..] else {
            return Ok(Value::Void);
        };
        let proc = self.unit(callee)?;
        self.session.current_node = Some(node);
        match proc {
            Value::Proc(StandardProc::Print) => {
                for item in arguments(self.session, group) {
                    let value = self.unit(item)?;
                    self.print(item, value)?;
                }
                Ok(Value::Void)
            }
            Value::Proc(StandardProc::Newline) => {
                self.out.push(b'\n');
                Ok(Value::Void)
            }
            _ => Err(self.runtime_error(callee, "S cannot be called", &[])),
        }
    }

    fn print(&mut self, node: NodeId, value: Value) -> Result<(), Stop> {
        let text = match value {
            Value::Int(v) => format_int(v),
            Value::Real(v) => format_real(v),
            Value::Bool(b) => String::from(if b { "T" } else { "F" }),
            Value::Char(c) => c.to_string(),
            Value::Text(s) => s,
            Value::Proc(StandardProc::Newline) => "\n".to_string(),
            Value::Void | Value::Nil | Value::Proc(StandardProc::Print) => {
                return Err(self.runtime_error(node, "S cannot be printed", &[]));
            }
        };
        self.out.extend_from_slice(text.as_bytes());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::front_end;
    use crate::session::tests::{SharedBuffer, session_with_source};

    fn run(text: &str) -> (Session, SharedBuffer, tempfile::TempDir) {
        let (mut session, buffer, dir) = session_with_source(text);
        front_end(&mut session).unwrap();
        assert_eq!(session.error_count(), 0);
        Genie::new(&mut session, None).run().unwrap();
        (session, buffer, dir)
    }

    #[test]
    fn formats_match_print() {
        assert_eq!(format_int(42), "        +42");
        assert_eq!(format_int(-7), "         -7");
        assert_eq!(format_real(3.5), "+3.50000000000000e  +0");
        assert_eq!(format_real(-0.001), "-1.00000000000000e  -3");
    }

    #[test]
    fn prints_denotations_and_identifiers() {
        let (_, buffer, _dir) = run("INT n = 5;\nSTRING s = \"n=\";\nprint ((s, n, newline))");
        assert_eq!(buffer.contents(), format!("n={}\n", format_int(5)));
    }

    #[test]
    fn widening_yields_a_real() {
        let (_, buffer, _dir) = run("REAL r = 2; print (r)");
        assert_eq!(buffer.contents(), format_real(2.0));
    }

    #[test]
    fn closed_clause_yields_its_last_unit() {
        let (_, buffer, _dir) = run("INT n = (INT m = 3; m); print ((n, newline))");
        assert_eq!(buffer.contents(), format!("{}\n", format_int(3)));
    }

    #[test]
    fn standard_identifiers_have_values() {
        let (_, buffer, _dir) = run("print ((maxint, newline))");
        assert_eq!(buffer.contents(), format!("{}\n", format_int(i64::MAX)));
    }

    #[test]
    fn time_limit_is_a_runtime_error() {
        let (mut session, buffer, _dir) = session_with_source("print (1)");
        front_end(&mut session).unwrap();
        let mut genie = Genie::new(&mut session, None);
        genie.deadline = Some(Instant::now());
        genie.run().unwrap();
        assert!(session.arena.is_sealed());
        assert_eq!(session.error_count(), 1);
        assert!(session
            .recorded()
            .any(|d| d.severity == Severity::RuntimeError && d.text.contains("time limit exceeded")));
        assert_eq!(buffer.contents(), "");
    }
}
