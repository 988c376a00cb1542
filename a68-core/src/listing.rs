//! The listing file: header, then each requested section in a fixed order.

use std::fmt::Write as _;
use std::fs;
use std::io::Write;

use tracing::debug;

use crate::diagnostic::{Render, write_source_line};
use crate::error::Abend;
use crate::registry::{MoidId, NodeId, TagId};
use crate::session::Session;

fn heading(out: &mut String, title: &str) {
    let _ = writeln!(out, "\n++++ {title}\n");
}

fn header(session: &Session, out: &mut String) {
    let arena = &session.arena;
    let _ = writeln!(
        out,
        "{} listing of {:?}",
        session.options.command_name,
        session.artifacts.source.display().to_string()
    );
    let _ = writeln!(out, "memory layout:");
    for (name, region) in [
        ("heap", arena.heap_region()),
        ("handles", arena.handle_region()),
        ("frame", arena.frame_region()),
        ("stack", arena.stack_region()),
    ] {
        let _ = writeln!(
            out,
            "  {name:<8} {:>10} .. {:>10} ({} bytes)",
            region.start,
            region.end,
            region.len()
        );
    }
    let _ = writeln!(
        out,
        "  in use   fixed {} bytes, temporary {} bytes, reserve {} bytes",
        arena.fixed_in_use(),
        arena.temp_in_use(),
        arena.reserve()
    );
}

fn source(session: &Session) -> Result<String, Abend> {
    let mut bytes = Vec::new();
    for (_, line) in session.registry.lines() {
        if line.number == 0 || !line.list {
            continue;
        }
        write_source_line(&mut bytes, line, None, Render::All, session.options.line_width)
            .map_err(|e| Abend::new("cannot write listing").with_os_error(&e))?;
    }
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

fn node_text(session: &mut Session, node: NodeId) -> Result<String, Abend> {
    let n = &session.registry[node];
    let mut text = match n.attribute.non_terminal() {
        Some(name) if n.sub.is_some() => name.to_string(),
        Some(name) => format!("{name} {:?}", n.symbol),
        None => format!("{:?}", n.symbol),
    };
    let line = session.registry[n.line].number;
    if let Some(moid) = n.moid {
        let mode = session.mode_string(moid, None)?;
        let _ = write!(text, " {mode}");
    }
    let _ = write!(text, " (line {line})");
    Ok(text)
}

fn tree(session: &mut Session, node: NodeId, depth: usize, out: &mut String) -> Result<(), Abend> {
    let text = node_text(session, node)?;
    let _ = writeln!(
        out,
        "{:>6} {}{text}",
        session.registry[node].number,
        "  ".repeat(depth)
    );
    let children: Vec<NodeId> = session.registry.children(node).collect();
    for child in children {
        tree(session, child, depth + 1, out)?;
    }
    Ok(())
}

fn moids(session: &mut Session, out: &mut String) -> Result<(), Abend> {
    let ids: Vec<MoidId> = session.registry.moids().map(|(id, _)| id).collect();
    for id in ids {
        let mode = session.mode_string(id, None)?;
        let m = &session.registry[id];
        let mut flags = Vec::new();
        if m.standard {
            flags.push("standard");
        }
        if m.used {
            flags.push("used");
        }
        if m.has_rows {
            flags.push("rows");
        }
        if m.equivalent.is_some() {
            flags.push("equivalent");
        }
        let _ = writeln!(
            out,
            "{:>6} {mode} size {} {}",
            m.number,
            m.size,
            flags.join(" ")
        );
    }
    Ok(())
}

fn standard_environment(session: &mut Session, out: &mut String) -> Result<(), Abend> {
    let Some(scope) = session.standenv else {
        return Ok(());
    };
    let s = &session.registry[scope];
    let tags: Vec<TagId> = s.indicants.iter().chain(&s.identifiers).copied().collect();
    for tag in tags {
        let symbol = session.registry[tag].symbol.clone();
        let mode = match session.registry[tag].moid {
            Some(moid) => session.mode_string(moid, None)?,
            None => String::new(),
        };
        let _ = writeln!(out, "  {symbol:<10} {mode}");
    }
    Ok(())
}

fn refinements(session: &Session, out: &mut String) {
    for refinement in &session.refinements {
        let defined = session.registry[refinement.line].number;
        let applied = refinement
            .applied_at
            .map(|l| format!("applied in line {}", session.registry[l].number))
            .unwrap_or_else(|| "not applied".to_string());
        let _ = writeln!(
            out,
            "  {} defined in line {defined}, {applied}",
            refinement.name
        );
    }
}

fn pragmats(session: &Session, out: &mut String) {
    for pragmat in &session.pragmats {
        let line = session.registry[pragmat.line].number;
        let _ = writeln!(out, "  line {line}: {}", pragmat.text.trim());
    }
}

/// Composes the listing text for the requested sections.
pub fn compose_listing(session: &mut Session) -> Result<String, Abend> {
    let switches = session.options.listing;
    let mut out = String::new();
    header(session, &mut out);
    if switches.source {
        heading(&mut out, "Source listing");
        out.push_str(&source(session)?);
    }
    if switches.tree {
        if let Some(root) = session.top_node {
            heading(&mut out, "Syntax tree");
            tree(session, root, 0, &mut out)?;
        }
    }
    if switches.object {
        if let Ok(object) = fs::read_to_string(&session.artifacts.object) {
            heading(&mut out, "Object listing");
            out.push_str(&object);
        }
    }
    if switches.moids {
        heading(&mut out, "Moid listing");
        moids(session, &mut out)?;
    }
    if switches.standard_environment {
        heading(&mut out, "Standard environment");
        standard_environment(session, &mut out)?;
    }
    if switches.refinements && !session.refinements.is_empty() {
        heading(&mut out, "Refinements");
        refinements(session, &mut out);
    }
    if switches.pragmats && !session.pragmats.is_empty() {
        heading(&mut out, "Pragmats");
        pragmats(session, &mut out);
    }
    Ok(out)
}

/// Writes the listing file when any section is requested.
pub fn emit_listing(session: &mut Session) -> Result<(), Abend> {
    if !session.options.listing.any() {
        return Ok(());
    }
    let text = compose_listing(session)?;
    let path = session.artifacts.listing.clone();
    let file = session.artifacts.open_listing()?;
    file.write_all(text.as_bytes())
        .map_err(|e| Abend::io("cannot write", &path, &e))?;
    debug!(bytes = text.len(), "listing written");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::front_end;
    use crate::session::tests::session_with_source;

    #[test]
    fn only_requested_sections_appear() {
        let (mut session, _, _dir) = session_with_source("INT n = 1;\nprint (n)");
        session.options.listing.source = true;
        session.options.listing.moids = true;
        front_end(&mut session).unwrap();
        let text = compose_listing(&mut session).unwrap();
        assert!(text.starts_with("a68 listing of"));
        assert!(text.contains("++++ Source listing"));
        assert!(text.contains("1     INT n = 1;"));
        assert!(text.contains("++++ Moid listing"));
        assert!(!text.contains("++++ Syntax tree"));
        assert!(!text.contains("++++ Object listing"));
        let source = text.find("Source listing").unwrap();
        let moids = text.find("Moid listing").unwrap();
        assert!(source < moids);
    }

    #[test]
    fn tree_and_environment_sections() {
        let (mut session, _, _dir) = session_with_source("print (1)");
        session.options.listing.tree = true;
        session.options.listing.standard_environment = true;
        front_end(&mut session).unwrap();
        let text = compose_listing(&mut session).unwrap();
        assert!(text.contains("particular-program"));
        assert!(text.contains("call VOID"));
        assert!(text.contains("integral-denotation \"1\""));
        assert!(text.contains("print      PROC ([] UNION"));
    }

    #[test]
    fn refinements_and_pragmats_are_listed() {
        let (mut session, _, _dir) = session_with_source("PR heap=32M PR go.\ngo: print (1).");
        session.options.listing.refinements = true;
        session.options.listing.pragmats = true;
        front_end(&mut session).unwrap();
        let text = compose_listing(&mut session).unwrap();
        assert!(text.contains("go defined in line 2, applied in line 1"));
        assert!(text.contains("line 1: heap=32M"));
    }

    #[test]
    fn no_switches_means_no_file() {
        let (mut session, _, _dir) = session_with_source("print (1)");
        front_end(&mut session).unwrap();
        emit_listing(&mut session).unwrap();
        assert!(!session.artifacts.listing_is_open());
        assert!(!session.artifacts.listing.exists());
    }
}
