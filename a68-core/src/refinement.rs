//! Refinement preprocessor.
//!
//! A program may end its main part with a `.` and follow it with
//! definitions `name: tokens .`. Every applied `name` in the main part or
//! in another refinement is replaced by the definition's tokens. Each
//! refinement must be applied exactly once.

use std::collections::HashMap;

use tracing::debug;

use crate::diagnostic::Severity;
use crate::error::Abend;
use crate::registry::{Attribute, NodeId, Status};
use crate::session::{Refinement, Session};

/// Position of the first `.` outside any brackets.
fn top_level_point(session: &Session, tokens: &[NodeId]) -> Option<usize> {
    let mut depth = 0usize;
    for (k, &t) in tokens.iter().enumerate() {
        let attribute = session.registry[t].attribute;
        if attribute.is_opener() {
            depth += 1;
        } else if attribute.is_closer() {
            depth = depth.saturating_sub(1);
        } else if attribute == Attribute::PointSymbol && depth == 0 {
            return Some(k);
        }
    }
    None
}

pub fn preprocess_refinements(session: &mut Session) -> Result<(), Abend> {
    let tokens: Vec<NodeId> = session.registry.siblings(session.top_token).collect();
    let Some(point) = top_level_point(session, &tokens) else {
        return Ok(());
    };
    let (main, mut rest) = (&tokens[..point], &tokens[point + 1..]);

    let mut bodies: HashMap<String, Vec<NodeId>> = HashMap::new();
    while !rest.is_empty() {
        let name = rest[0];
        let is_definition = session.registry[name].attribute == Attribute::Identifier
            && rest
                .get(1)
                .is_some_and(|&c| session.registry[c].attribute == Attribute::ColonSymbol);
        if !is_definition {
            session.diagnostic_node(
                Severity::SyntaxError,
                name,
                "S does not start a refinement definition",
                &[],
            )?;
            return Ok(());
        }
        let end = top_level_point(session, &rest[2..]).map_or(rest.len(), |p| p + 2);
        let symbol = session.registry[name].symbol.clone();
        if bodies.contains_key(&symbol) {
            session.diagnostic_node(
                Severity::SyntaxError,
                name,
                "refinement S is already defined",
                &[],
            )?;
        } else {
            bodies.insert(symbol.clone(), rest[2..end].to_vec());
            session.refinements.push(Refinement {
                name: symbol,
                line: session.registry[name].line,
                node: name,
                applications: 0,
                applied_at: None,
            });
        }
        rest = rest.get(end + 1..).unwrap_or(&[]);
    }

    let mut expanded = Vec::with_capacity(tokens.len());
    expand(session, &bodies, main, &mut expanded)?;

    for k in 0..session.refinements.len() {
        if session.refinements[k].applications == 0 {
            let node = session.refinements[k].node;
            session.diagnostic_node(Severity::Warning, node, "refinement S is not applied", &[])?;
        }
    }

    relink(session, &expanded);
    debug!(
        refinements = session.refinements.len(),
        tokens = expanded.len(),
        "refinements substituted"
    );
    Ok(())
}

fn expand(
    session: &mut Session,
    bodies: &HashMap<String, Vec<NodeId>>,
    tokens: &[NodeId],
    out: &mut Vec<NodeId>,
) -> Result<(), Abend> {
    for &t in tokens {
        let node = &session.registry[t];
        let body = (node.attribute == Attribute::Identifier)
            .then(|| bodies.get(&node.symbol))
            .flatten();
        let Some(body) = body else {
            out.push(t);
            continue;
        };
        let symbol = node.symbol.clone();
        let line = node.line;
        let Some(k) = session.refinements.iter().position(|r| r.name == symbol) else {
            out.push(t);
            continue;
        };
        session.refinements[k].applications += 1;
        if session.refinements[k].applications > 1 {
            session.diagnostic_node(
                Severity::SyntaxError,
                t,
                "refinement S is applied more than once",
                &[],
            )?;
            continue;
        }
        session.refinements[k].applied_at = Some(line);
        let start = out.len();
        expand(session, bodies, body, out)?;
        for &n in &out[start..] {
            session.registry[n].status.insert(Status::REFINED);
        }
    }
    Ok(())
}

fn relink(session: &mut Session, tokens: &[NodeId]) {
    for &t in tokens {
        session.registry[t].previous = None;
        session.registry[t].next = None;
    }
    for pair in tokens.windows(2) {
        session.registry[pair[0]].next = Some(pair[1]);
        session.registry[pair[1]].previous = Some(pair[0]);
    }
    session.top_token = tokens.first().copied();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::tokenise;
    use crate::options::Options;
    use crate::session::tests::SharedBuffer;

    fn run(text: &str) -> (Session, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prog.a68");
        std::fs::write(&path, text).unwrap();
        let mut session = Session::new(
            Options::for_source(path),
            Box::new(SharedBuffer::default()),
        )
        .unwrap();
        tokenise(&mut session).unwrap();
        preprocess_refinements(&mut session).unwrap();
        (session, dir)
    }

    fn symbols(session: &Session) -> Vec<String> {
        session
            .registry
            .siblings(session.top_token)
            .map(|n| session.registry[n].symbol.clone())
            .collect()
    }

    #[test]
    fn programs_without_a_point_are_untouched() {
        let (session, _dir) = run("print (1)");
        assert_eq!(symbols(&session), vec!["print", "(", "1", ")"]);
        assert!(session.refinements.is_empty());
    }

    #[test]
    fn applications_are_replaced_by_their_bodies() {
        let (session, _dir) = run("greet.\ngreet: print (hello).\nhello: \"hi\".");
        assert_eq!(symbols(&session), vec!["print", "(", "hi", ")"]);
        assert_eq!(session.refinements.len(), 2);
        assert!(session.refinements.iter().all(|r| r.applications == 1));
        let first = session.top_token.unwrap();
        assert!(session.registry[first].status.contains(Status::REFINED));
        assert_eq!(session.error_count(), 0);
    }

    #[test]
    fn double_application_is_an_error() {
        let (session, _dir) = run("go; go.\ngo: print (1).");
        assert_eq!(session.error_count(), 1);
    }

    #[test]
    fn unapplied_refinement_warns() {
        let (session, _dir) = run("print (1).\nspare: print (2).");
        assert_eq!(session.error_count(), 0);
        assert_eq!(session.warning_count(), 1);
    }

    #[test]
    fn duplicate_definition_is_an_error() {
        let (session, _dir) = run("go.\ngo: print (1).\ngo: print (2).");
        assert_eq!(session.error_count(), 1);
    }
}
