//! The session context threaded through every phase.
//!
//! A [`Session`] owns the arena, the record stores, the postulate ledger,
//! the diagnostics counters and the artifact files of one compilation.
//! Nothing in the crate keeps state outside of it.

use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::arena::Arena;
use crate::compiler::Phase;
use crate::diagnostic::{
    self, Admission, Arg, Diagnostic, DiagnosticsLedger, Render, Severity,
};
use crate::error::{Abend, ScanError};
use crate::moids::Modes;
use crate::options::{MemoryBudgets, Options};
use crate::postulate::PostulateLedger;
use crate::registry::{LineId, MoidId, NodeId, Registry, ScopeId};

/// Suffixes of the artifact files.
pub const OBJECT_EXTENSION: &str = "c";
pub const BINARY_EXTENSION: &str = "o";
pub const LIBRARY_EXTENSION: &str = "so";
pub const LISTING_EXTENSION: &str = "l";
pub const SCRIPT_EXTENSION: &str = "sh";
pub const DIAGNOSTICS_EXTENSION: &str = "diag";

/// Extensions tried, in order, when opening the source.
pub const SOURCE_EXTENSIONS: [&str; 3] = ["", "a68", "A68"];

/// Modes that exist in every session before the standard environment.
#[derive(Debug, Clone, Copy)]
pub struct SpecialModes {
    pub hip: MoidId,
    pub undefined: MoidId,
    pub error: MoidId,
    pub vacuum: MoidId,
    pub c_string: MoidId,
    pub collitem: MoidId,
}

#[derive(Debug, Clone, Copy)]
pub struct StandardModes {
    pub int: MoidId,
    pub real: MoidId,
    pub bool_: MoidId,
    pub char_: MoidId,
    pub void: MoidId,
    pub string: MoidId,
    /// `UNION (INT, REAL, BOOL, CHAR, STRING, PROC VOID)`
    pub simplout: MoidId,
    /// `PROC VOID`, the mode of layout procedures such as `newline`.
    pub proc_void: MoidId,
    /// `PROC ([] SIMPLOUT) VOID`
    pub print: MoidId,
}

/// A `PR ... PR` directive as it appeared in the source.
#[derive(Debug, Clone)]
pub struct Pragmat {
    pub line: LineId,
    pub column: usize,
    pub text: String,
}

#[derive(Debug, Clone)]
pub struct Refinement {
    pub name: String,
    pub line: LineId,
    pub node: NodeId,
    pub applications: usize,
    pub applied_at: Option<LineId>,
}

/// Names and open handles of the files a session may produce.
#[derive(Debug)]
pub struct Artifacts {
    pub source: PathBuf,
    pub generic: PathBuf,
    pub object: PathBuf,
    pub binary: PathBuf,
    pub library: PathBuf,
    pub listing: PathBuf,
    pub script: PathBuf,
    pub diagnostics: PathBuf,
    listing_file: Option<BufWriter<File>>,
    object_file: Option<BufWriter<File>>,
    diagnostics_file: Option<File>,
}

pub fn with_extension(generic: &Path, extension: &str) -> PathBuf {
    let mut name = generic.as_os_str().to_owned();
    name.push(".");
    name.push(extension);
    PathBuf::from(name)
}

/// The source name without a silent `.a68` extension.
pub fn generic_name(source: &Path) -> PathBuf {
    match source.extension() {
        Some(ext) if ext == "a68" || ext == "A68" => source.with_extension(""),
        _ => source.to_path_buf(),
    }
}

impl Artifacts {
    /// Derives every artifact name from the source's base name.
    pub fn new(source: &Path) -> Self {
        let generic = generic_name(source);
        Artifacts {
            source: source.to_path_buf(),
            object: with_extension(&generic, OBJECT_EXTENSION),
            binary: with_extension(&generic, BINARY_EXTENSION),
            library: with_extension(&generic, LIBRARY_EXTENSION),
            listing: with_extension(&generic, LISTING_EXTENSION),
            script: with_extension(&generic, SCRIPT_EXTENSION),
            diagnostics: with_extension(&generic, DIAGNOSTICS_EXTENSION),
            generic,
            listing_file: None,
            object_file: None,
            diagnostics_file: None,
        }
    }

    fn create(path: &Path) -> Result<File, Abend> {
        File::create(path).map_err(|e| Abend::io("cannot open file", path, &e))
    }

    pub fn open_listing(&mut self) -> Result<&mut BufWriter<File>, Abend> {
        if self.listing_file.is_none() {
            debug!(path = %self.listing.display(), "opening listing file");
            self.listing_file = Some(BufWriter::new(Self::create(&self.listing)?));
        }
        self.listing_file
            .as_mut()
            .ok_or_else(|| Abend::new("internal consistency check failure"))
    }

    pub fn open_object(&mut self) -> Result<&mut BufWriter<File>, Abend> {
        if self.object_file.is_none() {
            debug!(path = %self.object.display(), "opening object file");
            self.object_file = Some(BufWriter::new(Self::create(&self.object)?));
        }
        self.object_file
            .as_mut()
            .ok_or_else(|| Abend::new("internal consistency check failure"))
    }

    pub fn open_diagnostics(&mut self) -> Result<(), Abend> {
        if self.diagnostics_file.is_none() {
            self.diagnostics_file = Some(Self::create(&self.diagnostics)?);
        }
        Ok(())
    }

    /// Truncates the diagnostics stream when it is open.
    pub fn reopen_diagnostics(&mut self) -> Result<(), Abend> {
        if self.diagnostics_file.take().is_some() {
            self.diagnostics_file = Some(Self::create(&self.diagnostics)?);
        }
        Ok(())
    }

    pub fn diagnostics_stream(&mut self) -> Option<&mut File> {
        self.diagnostics_file.as_mut()
    }

    pub fn listing_is_open(&self) -> bool {
        self.listing_file.is_some()
    }

    pub fn close_object(&mut self) -> Result<(), Abend> {
        if let Some(mut file) = self.object_file.take() {
            file.flush()
                .map_err(|e| Abend::io("cannot close file", &self.object, &e))?;
        }
        Ok(())
    }

    /// Flushes and closes whatever is open. Safe to call more than once.
    pub fn close_all(&mut self) -> Result<(), Abend> {
        self.close_object()?;
        if let Some(mut file) = self.listing_file.take() {
            file.flush()
                .map_err(|e| Abend::io("cannot close file", &self.listing, &e))?;
        }
        if let Some(mut file) = self.diagnostics_file.take() {
            file.flush()
                .map_err(|e| Abend::io("cannot close file", &self.diagnostics, &e))?;
        }
        Ok(())
    }

    /// Removes a file, treating absence as success.
    pub fn remove(path: &Path) -> Result<(), Abend> {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Abend::io("cannot remove", path, &e)),
        }
    }
}

impl Drop for Artifacts {
    fn drop(&mut self) {
        // Errors were already reported by an explicit close on the normal path.
        let _ = self.close_all();
    }
}

pub struct Session {
    pub options: Options,
    /// Starts as the configured budgets; directives may change them.
    pub budgets: MemoryBudgets,
    pub arena: Arena,
    pub registry: Registry,
    pub postulates: PostulateLedger,
    pub diagnostics: DiagnosticsLedger,
    /// Tokenisation attempts; becomes 2 after a restart.
    pub scan: u32,
    pub phase: Phase,
    pub artifacts: Artifacts,
    /// Head of the token chain between tokenising and parsing.
    pub top_token: Option<NodeId>,
    pub top_node: Option<NodeId>,
    pub standenv: Option<ScopeId>,
    pub specials: Option<SpecialModes>,
    pub standards: Option<StandardModes>,
    pub pragmats: Vec<Pragmat>,
    pub refinements: Vec<Refinement>,
    /// Nodes by number; valid from the last renumbering until the next
    /// structural change.
    pub node_register: Vec<NodeId>,
    /// Node the evaluator is executing, marked in runtime diagnostics.
    pub current_node: Option<NodeId>,
    pub terminal: Box<dyn Write>,
}

impl Session {
    pub fn new(options: Options, terminal: Box<dyn Write>) -> Result<Self, Abend> {
        let arena = Arena::init(&options.budgets)?;
        Ok(Session::with_arena(options, arena, terminal))
    }

    /// Builds a session around an arena already laid out from
    /// `options.budgets`.
    pub fn with_arena(options: Options, arena: Arena, terminal: Box<dyn Write>) -> Self {
        let budgets = options.budgets;
        let artifacts = Artifacts::new(&options.source);
        Session {
            diagnostics: DiagnosticsLedger::new(options.no_warnings, options.quiet),
            arena,
            budgets,
            registry: Registry::new(),
            postulates: PostulateLedger::new(),
            scan: 1,
            phase: Phase::Initialise,
            artifacts,
            top_token: None,
            top_node: None,
            standenv: None,
            specials: None,
            standards: None,
            pragmats: Vec::new(),
            refinements: Vec::new(),
            node_register: Vec::new(),
            current_node: None,
            terminal,
            options,
        }
    }

    /// Discards the arena and every session root, then lays the arena out
    /// again from the current budgets. The diagnostics stream, if open,
    /// starts over as well.
    pub fn restart(&mut self) -> Result<(), Abend> {
        self.arena.discard();
        self.arena = Arena::init(&self.budgets)?;
        self.artifacts.reopen_diagnostics()?;
        self.registry = Registry::new();
        self.postulates.reset();
        self.diagnostics = DiagnosticsLedger::new(self.options.no_warnings, self.options.quiet);
        self.top_token = None;
        self.top_node = None;
        self.standenv = None;
        self.specials = None;
        self.standards = None;
        self.pragmats.clear();
        self.refinements.clear();
        self.node_register.clear();
        self.current_node = None;
        self.scan += 1;
        Ok(())
    }

    pub fn error_count(&self) -> usize {
        self.diagnostics.error_count
    }

    pub fn warning_count(&self) -> usize {
        self.diagnostics.warning_count
    }

    pub fn modes(&mut self) -> Modes<'_> {
        Modes::new(&self.registry, &mut self.postulates, &self.arena)
    }

    pub fn specials(&self) -> Result<SpecialModes, Abend> {
        self.specials
            .ok_or_else(|| Abend::new("internal consistency check failure").with_info("special modes"))
    }

    pub fn standards(&self) -> Result<StandardModes, Abend> {
        self.standards.ok_or_else(|| {
            Abend::new("internal consistency check failure").with_info("standard modes")
        })
    }

    pub fn mode_string(&mut self, moid: MoidId, idf: Option<ScopeId>) -> Result<String, Abend> {
        self.modes().to_string(moid, crate::moids::MOID_ERROR_WIDTH, idf)
    }

    // -----------------------------------------------------------------
    // Diagnostics
    // -----------------------------------------------------------------

    pub fn diagnostic_node(
        &mut self,
        severity: Severity,
        node: NodeId,
        template: &str,
        args: &[Arg],
    ) -> Result<(), Abend> {
        self.emit(severity, false, Some(node), None, None, template, args)
    }

    /// A warning that is shown even with warnings switched off.
    pub fn forced_warning(&mut self, node: NodeId, template: &str, args: &[Arg]) -> Result<(), Abend> {
        self.emit(Severity::Warning, true, Some(node), None, None, template, args)
    }

    pub fn diagnostic_line(
        &mut self,
        severity: Severity,
        line: Option<LineId>,
        column: Option<usize>,
        template: &str,
        args: &[Arg],
    ) -> Result<(), Abend> {
        self.emit(severity, false, None, line, column, template, args)
    }

    pub fn forced_warning_line(
        &mut self,
        line: LineId,
        column: Option<usize>,
        template: &str,
        args: &[Arg],
    ) -> Result<(), Abend> {
        self.emit(Severity::Warning, true, None, Some(line), column, template, args)
    }

    /// Records a scan error and returns the value that unwinds the driver.
    pub fn scan_error(
        &mut self,
        line: Option<LineId>,
        column: Option<usize>,
        template: &str,
        args: &[Arg],
    ) -> ScanError {
        let message = diagnostic::compose(
            &self.registry,
            &mut self.postulates,
            &self.arena,
            None,
            template,
            args,
        )
        .unwrap_or_else(|_| template.to_string());
        if let Err(abend) = self.emit(Severity::Suppress, false, None, line, column, template, args) {
            return ScanError {
                message: abend.to_string(),
            };
        }
        ScanError { message }
    }

    #[allow(clippy::too_many_arguments)]
    fn emit(
        &mut self,
        severity: Severity,
        forced: bool,
        node: Option<NodeId>,
        line: Option<LineId>,
        column: Option<usize>,
        template: &str,
        args: &[Arg],
    ) -> Result<(), Abend> {
        let (severity, mut body) = match self.diagnostics.admit(severity, forced) {
            Admission::Drop => return Ok(()),
            Admission::Marker(severity, text) => (severity, text.to_string()),
            Admission::Compose(severity) => (
                severity,
                diagnostic::compose(
                    &self.registry,
                    &mut self.postulates,
                    &self.arena,
                    node,
                    template,
                    args,
                )?,
            ),
        };
        if let (Some(line), Some(column)) = (line, column) {
            if let Some(at) = diagnostic::detected_at(&self.registry[line].text, column) {
                body.push_str(&at);
            }
        }
        self.write_tui(severity, node, line, column, &body)?;

        let anchor = line.or_else(|| node.map(|n| self.registry[n].line));
        // Standard-environment lines carry no diagnostics; use the next
        // program line instead.
        let anchor = anchor.and_then(|start| {
            (start.index()..self.registry.line_count())
                .map(LineId::from_index)
                .find(|l| self.registry[*l].number != 0)
        });
        let Some(anchor) = anchor else {
            let text = diagnostic::unanchored_text(&self.options.command_name, severity, &body);
            return self.write_terminal(&text);
        };

        let line_number = self.registry[anchor].number;
        let number = self.registry[anchor].diagnostics.len() + 1;
        let filename = {
            let name = &self.registry[anchor].filename;
            (Path::new(name) != self.artifacts.source.as_path()).then(|| name.clone())
        };
        let detected = match node {
            Some(node) => diagnostic::detected_in(
                &self.registry,
                &mut self.postulates,
                &self.arena,
                node,
                line_number,
            )?,
            None => None,
        };
        let text = diagnostic::record_text(
            &self.options.command_name,
            filename.as_deref(),
            severity,
            number,
            &body,
            detected.as_deref(),
        );
        let position = match node {
            Some(n) if self.registry[n].line == anchor => Some(self.registry[n].column),
            Some(_) => None,
            None if line == Some(anchor) => column,
            None => None,
        };
        let column = diagnostic::mark_column(&self.registry[anchor].text, position);
        self.registry[anchor].diagnostics.push(Diagnostic {
            severity,
            text,
            column,
            node,
            number,
        });
        Ok(())
    }

    fn write_tui(
        &mut self,
        severity: Severity,
        node: Option<NodeId>,
        line: Option<LineId>,
        column: Option<usize>,
        body: &str,
    ) -> Result<(), Abend> {
        let (number, column) = match (node, line) {
            (Some(n), _) => (
                self.registry[self.registry[n].line].number,
                self.registry[n].column,
            ),
            (None, Some(l)) => (self.registry[l].number, column.unwrap_or(0)),
            (None, None) => (0, 0),
        };
        let path = self.artifacts.diagnostics.clone();
        let Some(stream) = self.artifacts.diagnostics_stream() else {
            return Ok(());
        };
        let record = match severity.label() {
            Some(label) => format!("{number}\n{column}\n{label}: {body}\n"),
            None => format!("{number}\n{column}\n{body}\n"),
        };
        stream
            .write_all(record.as_bytes())
            .and_then(|_| stream.flush())
            .map_err(|e| Abend::io("cannot write", &path, &e))
    }

    pub fn write_terminal(&mut self, text: &str) -> Result<(), Abend> {
        let width = self.options.line_width;
        diagnostic::pretty_diag(&mut *self.terminal, text, width)
            .map_err(|e| Abend::new("cannot write to terminal").with_os_error(&e))
    }

    /// Prints every line carrying diagnostics of class `what`.
    pub fn diagnostics_to_terminal(&mut self, what: Render) -> Result<(), Abend> {
        let width = self.options.line_width;
        let where_line = self.current_node.map(|n| self.registry[n].line);
        for (id, line) in self.registry.lines() {
            if !diagnostic::line_has(line, what) {
                continue;
            }
            let where_column = match (what, where_line, self.current_node) {
                (Render::Runtime, Some(l), Some(n)) if l == id => Some(self.registry[n].column),
                _ => None,
            };
            diagnostic::write_source_line(&mut *self.terminal, line, where_column, what, width)
                .map_err(|e| Abend::new("cannot write to terminal").with_os_error(&e))?;
        }
        self.terminal
            .flush()
            .map_err(|e| Abend::new("cannot write to terminal").with_os_error(&e))
    }

    /// Every diagnostic recorded on program lines, in line order.
    pub fn recorded(&self) -> impl Iterator<Item = &Diagnostic> {
        self.registry
            .lines()
            .flat_map(|(_, line)| line.diagnostics.iter())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::diagnostic::MAX_ERRORS;
    use std::cell::RefCell;
    use std::rc::Rc;

    /// Terminal stand-in whose contents the test can read back.
    #[derive(Clone, Default)]
    pub(crate) struct SharedBuffer(pub Rc<RefCell<Vec<u8>>>);

    impl SharedBuffer {
        pub(crate) fn contents(&self) -> String {
            String::from_utf8_lossy(&self.0.borrow()).into_owned()
        }
    }

    impl Write for SharedBuffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.borrow_mut().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    /// A session over a temporary source file holding `text`.
    pub(crate) fn session_with_source(text: &str) -> (Session, SharedBuffer, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prog.a68");
        fs::write(&path, text).unwrap();
        let buffer = SharedBuffer::default();
        let session = Session::new(Options::for_source(path), Box::new(buffer.clone())).unwrap();
        (session, buffer, dir)
    }

    fn session() -> (Session, SharedBuffer) {
        let buffer = SharedBuffer::default();
        let session = Session::new(Options::for_source("prog.a68"), Box::new(buffer.clone())).unwrap();
        (session, buffer)
    }

    #[test]
    fn artifact_names_follow_the_base_name() {
        let artifacts = Artifacts::new(Path::new("dir/prog.a68"));
        assert_eq!(artifacts.generic, PathBuf::from("dir/prog"));
        assert_eq!(artifacts.object, PathBuf::from("dir/prog.c"));
        assert_eq!(artifacts.library, PathBuf::from("dir/prog.so"));
        assert_eq!(artifacts.listing, PathBuf::from("dir/prog.l"));
        assert_eq!(artifacts.script, PathBuf::from("dir/prog.sh"));
        let bare = Artifacts::new(Path::new("prog"));
        assert_eq!(bare.binary, PathBuf::from("prog.o"));
    }

    #[test]
    fn diagnostics_attach_to_their_line_in_order() {
        let (mut session, _) = session();
        let arena = &session.arena;
        let line = session
            .registry
            .new_source_line(arena, "  INT x = y", "prog.a68", 2)
            .unwrap();
        session
            .diagnostic_line(Severity::SyntaxError, Some(line), Some(8), "first", &[])
            .unwrap();
        session
            .diagnostic_line(Severity::Warning, Some(line), None, "second", &[])
            .unwrap();
        let chain = &session.registry[line].diagnostics;
        assert_eq!(chain.len(), 2);
        assert_eq!(chain[0].number, 1);
        assert_eq!(chain[0].column, 8);
        assert_eq!(chain[0].text, "a68: syntax error: 1: first (detected at character \"=\").");
        assert_eq!(chain[1].column, 2);
        assert_eq!(session.error_count(), 1);
        assert_eq!(session.warning_count(), 1);
    }

    #[test]
    fn prelude_lines_forward_to_the_program() {
        let (mut session, _) = session();
        let arena = &session.arena;
        let prelude = session
            .registry
            .new_source_line(arena, "MODE X = INT;", "prelude/x.a68", 0)
            .unwrap();
        let program = session
            .registry
            .new_source_line(arena, "print (1)", "prog.a68", 1)
            .unwrap();
        session
            .diagnostic_line(Severity::Error, Some(prelude), None, "bad", &[])
            .unwrap();
        assert!(session.registry[prelude].diagnostics.is_empty());
        assert_eq!(session.registry[program].diagnostics.len(), 1);
    }

    #[test]
    fn unanchored_diagnostics_go_to_the_terminal() {
        let (mut session, buffer) = session();
        session
            .diagnostic_line(Severity::Error, None, None, "no line", &[])
            .unwrap();
        assert_eq!(buffer.contents(), "a68: error: no line.\n");
    }

    #[test]
    fn suppression_ceiling_renders_one_marker() {
        let (mut session, buffer) = session();
        let arena = &session.arena;
        let line = session
            .registry
            .new_source_line(arena, "x", "prog.a68", 1)
            .unwrap();
        for _ in 0..MAX_ERRORS + 5 {
            session
                .diagnostic_line(Severity::Error, Some(line), None, "bad", &[])
                .unwrap();
        }
        session.diagnostics_to_terminal(Render::All).unwrap();
        let out = buffer.contents();
        assert_eq!(out.matches("further error diagnostics suppressed").count(), 1);
        assert_eq!(out.matches(": bad.").count(), MAX_ERRORS);
        assert_eq!(session.error_count(), MAX_ERRORS + 5);
    }

    #[test]
    fn restart_resets_roots_and_counts_the_scan() {
        let (mut session, _) = session();
        let arena = &session.arena;
        session
            .registry
            .new_source_line(arena, "x", "prog.a68", 1)
            .unwrap();
        session.budgets.heap *= 2;
        session.restart().unwrap();
        assert_eq!(session.scan, 2);
        assert_eq!(session.registry.line_count(), 0);
        assert!(session.arena.is_active());
        assert_eq!(session.arena.heap_region().len(), session.budgets.heap);
    }
}
