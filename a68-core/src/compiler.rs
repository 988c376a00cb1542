//! Pipeline orchestrator.
//!
//! Drives the phases in order. Each phase body runs only while no error has
//! been recorded; the first tokenisation may restart the session once when
//! a directive changes the memory layout. Artifact files are closed on
//! every exit path by [`run`].

use std::io::{self, Write};

use tracing::{debug, info, warn};

use crate::arena::Arena;
use crate::codegen_c::{CompiledUnit, emit_c};
use crate::diagnostic::Render;
use crate::error::{Abend, Fatal};
use crate::genie::Genie;
use crate::lexer::tokenise;
use crate::listing::emit_listing;
use crate::modetab::build_type_table;
use crate::native::{CcBackend, NativeBackend, check_rerun};
use crate::options::Options;
use crate::parser::{check_structure, parse_pass_one, parse_pass_two};
use crate::refinement::preprocess_refinements;
use crate::script;
use crate::session::{Artifacts, Session};
use crate::stdenv::{build_standard_environment, make_special_modes};
use crate::typecheck::{
    build_symbol_tables, check_applications, check_portability, check_scope, check_types,
    finalise_tree, insert_coercions, post_parse_fixups,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    Initialise,
    Tokenise,
    PreprocessRefinements,
    ParsePassOne,
    StandardEnvironment,
    ParsePassTwo,
    StructuralChecks,
    TypeTable,
    SymbolTables,
    PostParseFixups,
    CheckTypes,
    InsertCoercions,
    CheckApplications,
    CheckScope,
    CheckPortability,
    FinaliseTree,
    NativeCompile,
    LinkAndRun,
    EmitListing,
    Cleanup,
}

impl Phase {
    pub fn name(self) -> &'static str {
        match self {
            Phase::Initialise => "initialise",
            Phase::Tokenise => "tokeniser",
            Phase::PreprocessRefinements => "refinement preprocessor",
            Phase::ParsePassOne => "parser phase 1",
            Phase::StandardEnvironment => "standard environment builder",
            Phase::ParsePassTwo => "parser phase 2",
            Phase::StructuralChecks => "structural checks",
            Phase::TypeTable => "mode table builder",
            Phase::SymbolTables => "symbol table builder",
            Phase::PostParseFixups => "post-parse fixups",
            Phase::CheckTypes => "mode checker",
            Phase::InsertCoercions => "coercion inserter",
            Phase::CheckApplications => "application checker",
            Phase::CheckScope => "scope checker",
            Phase::CheckPortability => "portability checker",
            Phase::FinaliseTree => "tree finaliser",
            Phase::NativeCompile => "native compiler",
            Phase::LinkAndRun => "linker and genie",
            Phase::EmitListing => "listing",
            Phase::Cleanup => "cleanup",
        }
    }
}

/// How the driver ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    Success,
    Errors,
    Abend,
}

impl Exit {
    pub fn code(self) -> u8 {
        match self {
            Exit::Success => 0,
            Exit::Errors => 1,
            Exit::Abend => 2,
        }
    }
}

fn terminal_error(e: io::Error) -> Abend {
    Abend::new("cannot write to terminal").with_os_error(&e)
}

/// Enters `phase` and reports whether its body may run.
fn enter(session: &mut Session, phase: Phase) -> Result<bool, Abend> {
    session.phase = phase;
    let runs = session.error_count() == 0;
    info!(phase = phase.name(), runs, "phase");
    if session.options.verbose && runs {
        let command = &session.options.command_name;
        writeln!(session.terminal, "{command}: {}", phase.name()).map_err(terminal_error)?;
    }
    Ok(runs)
}

type Step = fn(&mut Session) -> Result<(), Abend>;

/// Everything up to and including the finalised tree.
pub fn front_end(session: &mut Session) -> Result<(), Fatal> {
    if enter(session, Phase::Initialise)? && session.options.tui {
        session.artifacts.open_diagnostics()?;
    }
    loop {
        if enter(session, Phase::Tokenise)? {
            tokenise(session)?;
        }
        if session.scan == 1 && session.budgets.regions_differ(&session.options.budgets) {
            debug!(heap = session.budgets.heap, "memory layout changed, restarting");
            session.restart()?;
            continue;
        }
        break;
    }
    if session.error_count() == 0 {
        make_special_modes(session)?;
    }
    let steps: [(Phase, Step); 14] = [
        (Phase::PreprocessRefinements, preprocess_refinements),
        (Phase::ParsePassOne, parse_pass_one),
        (Phase::StandardEnvironment, build_standard_environment),
        (Phase::ParsePassTwo, parse_pass_two),
        (Phase::StructuralChecks, check_structure),
        (Phase::TypeTable, build_type_table),
        (Phase::SymbolTables, build_symbol_tables),
        (Phase::PostParseFixups, post_parse_fixups),
        (Phase::CheckTypes, check_types),
        (Phase::InsertCoercions, insert_coercions),
        (Phase::CheckApplications, check_applications),
        (Phase::CheckScope, check_scope),
        (Phase::CheckPortability, check_portability),
        (Phase::FinaliseTree, finalise_tree),
    ];
    for (phase, step) in steps {
        if enter(session, phase)? {
            step(session)?;
        }
    }
    Ok(())
}

/// Emits and builds the module, or with `rerun` reuses the existing one.
fn native_compile(
    session: &mut Session,
    backend: &mut dyn NativeBackend,
) -> Result<Vec<CompiledUnit>, Fatal> {
    let library = session.artifacts.library.clone();
    if session.options.rerun && library.exists() {
        check_rerun(&session.artifacts.source, &library)?;
        return Ok(emit_c(session, &mut io::sink())?);
    }
    if session.options.rerun {
        warn!(path = %library.display(), "no module to rerun, building");
    }
    let units = backend.emit(session)?;
    backend.build(session)?;
    Artifacts::remove(&session.artifacts.binary)?;
    Ok(units)
}

/// Loads the module, runs the program and unloads the module again.
fn link_and_run(
    session: &mut Session,
    backend: &mut dyn NativeBackend,
    units: Option<&[CompiledUnit]>,
) -> Result<(), Fatal> {
    let module = match units {
        Some(units) => Some(backend.load(session, units)?),
        None => None,
    };
    let ran = Genie::new(session, module.as_ref()).run();
    let unloaded = module.map(|module| backend.unload(module)).transpose();
    ran?;
    unloaded?;
    if session.error_count() > 0 {
        session.diagnostics_to_terminal(Render::Runtime)?;
    }
    Ok(())
}

/// Packages a built program and removes intermediate files.
fn cleanup(session: &Session) -> Result<(), Abend> {
    let options = &session.options;
    let artifacts = &session.artifacts;
    if options.keep {
        return Ok(());
    }
    if options.run_script {
        Artifacts::remove(&artifacts.source)?;
        return Artifacts::remove(&artifacts.library);
    }
    if !options.native() || options.rerun {
        return Ok(());
    }
    if options.compile && session.diagnostics.error_count == 0 {
        script::write_script(&options.command_name, artifacts)?;
    }
    Artifacts::remove(&artifacts.object)?;
    Artifacts::remove(&artifacts.binary)?;
    Artifacts::remove(&artifacts.library)
}

fn pipeline(session: &mut Session) -> Result<(), Fatal> {
    front_end(session)?;
    if session.error_count() + session.warning_count() > 0 {
        session.diagnostics_to_terminal(Render::All)?;
    }

    let mut backend = CcBackend::new();
    let native = session.options.native();
    let mut units = None;
    if enter(session, Phase::NativeCompile)? && native {
        units = Some(native_compile(session, &mut backend)?);
    }
    if enter(session, Phase::LinkAndRun)? && !session.options.compile {
        link_and_run(session, &mut backend, units.as_deref())?;
    }
    if enter(session, Phase::EmitListing)? {
        emit_listing(session)?;
    }
    session.phase = Phase::Cleanup;
    info!(phase = Phase::Cleanup.name(), "phase");
    cleanup(session)?;
    Ok(())
}

fn report_abend(terminal: &mut dyn Write, command: &str, abend: &Abend) -> Exit {
    let _ = writeln!(terminal, "{command}: exiting: {abend}");
    let _ = terminal.flush();
    Exit::Abend
}

/// Runs the whole driver for one source file and reports how it ended.
pub fn run(mut options: Options, mut terminal: Box<dyn Write>) -> Exit {
    let command = options.command_name.clone();
    if options.run_script {
        match script::unpack(&options.source) {
            Ok(source) => {
                options.source = source;
                options.rerun = true;
            }
            Err(abend) => return report_abend(&mut *terminal, &command, &abend),
        }
    }

    let arena = match Arena::init(&options.budgets) {
        Ok(arena) => arena,
        Err(abend) => return report_abend(&mut *terminal, &command, &abend),
    };
    let mut session = Session::with_arena(options, arena, terminal);
    let outcome = pipeline(&mut session);
    let closed = session.artifacts.close_all();
    let outcome = outcome.and_then(|()| closed.map_err(Fatal::from));
    debug!(
        errors = session.error_count(),
        warnings = session.warning_count(),
        scan = session.scan,
        "driver finished"
    );
    match outcome {
        Ok(()) if session.error_count() == 0 => Exit::Success,
        Ok(()) => Exit::Errors,
        Err(Fatal::Scan(_)) => match session.diagnostics_to_terminal(Render::All) {
            Ok(()) => Exit::Errors,
            Err(abend) => report_abend(&mut *session.terminal, &command, &abend),
        },
        Err(Fatal::Abend(abend)) => report_abend(&mut *session.terminal, &command, &abend),
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::Path;
    use std::process::Command;

    use super::*;
    use crate::error::BackendError;
    use crate::native::LoadedModule;
    use crate::session::tests::{SharedBuffer, session_with_source};

    fn drive(dir: &Path, text: &str, configure: impl FnOnce(&mut Options)) -> (Exit, String) {
        let path = dir.join("prog.a68");
        fs::write(&path, text).unwrap();
        let mut options = Options::for_source(&path);
        configure(&mut options);
        let buffer = SharedBuffer::default();
        let exit = run(options, Box::new(buffer.clone()));
        (exit, buffer.contents())
    }

    fn toolchain() -> bool {
        ["cc", "ld"].iter().all(|tool| {
            Command::new(tool)
                .arg("--version")
                .output()
                .is_ok_and(|o| o.status.success())
        })
    }

    #[test]
    fn errors_stop_later_phases() {
        let (mut session, _, _dir) = session_with_source("print (1))");
        front_end(&mut session).unwrap();
        assert_eq!(session.error_count(), 1);
        assert!(session.standenv.is_none());
        assert!(session.node_register.is_empty());
        assert_eq!(session.phase, Phase::FinaliseTree);
    }

    #[test]
    fn layout_directive_restarts_once() {
        let (mut session, _, _dir) = session_with_source("PR heap=32M PR PR heap=32M PR print (1)");
        front_end(&mut session).unwrap();
        assert_eq!(session.scan, 2);
        assert_eq!(session.arena.heap_region().len(), 32 * 1024 * 1024);
        assert_eq!(session.pragmats.len(), 2);
        assert_eq!(session.error_count(), 0);
    }

    #[test]
    fn reserve_directive_does_not_restart() {
        let (mut session, _, _dir) = session_with_source("PR overhead=256k PR print (1)");
        front_end(&mut session).unwrap();
        assert_eq!(session.scan, 1);
    }

    #[test]
    fn valid_program_runs_and_lists_without_object() {
        let dir = tempfile::tempdir().unwrap();
        let (exit, out) = drive(dir.path(), "print ((\"hi\", newline))", |o| {
            o.listing.source = true;
            o.listing.object = true;
        });
        assert_eq!(exit, Exit::Success);
        assert_eq!(out, "hi\n");
        let listing = fs::read_to_string(dir.path().join("prog.l")).unwrap();
        assert!(listing.contains("++++ Source listing"));
        assert!(listing.contains("print ((\"hi\", newline))"));
        assert!(!listing.contains("++++ Object listing"));
        assert!(!dir.path().join("prog.c").exists());
        assert!(!dir.path().join("prog.so").exists());
    }

    #[test]
    fn syntax_error_skips_native_phases() {
        let dir = tempfile::tempdir().unwrap();
        let (exit, out) = drive(dir.path(), "print (1))", |o| o.optimise = true);
        assert_eq!(exit, Exit::Errors);
        assert_eq!(exit.code(), 1);
        assert_eq!(out.matches("syntax error").count(), 1, "{out}");
        assert!(out.starts_with("1     print (1))"), "{out}");
        assert!(!dir.path().join("prog.c").exists());
    }

    #[test]
    fn failing_toolchain_abends_naming_the_command() {
        let dir = tempfile::tempdir().unwrap();
        let (exit, out) = drive(dir.path(), "print (1)", |o| {
            o.optimise = true;
            o.compiler = "false".to_string();
        });
        assert_eq!(exit, Exit::Abend);
        assert_eq!(exit.code(), 2);
        assert!(out.contains("a68: exiting: cannot compile, false -I. -O2"), "{out}");
        assert!(!dir.path().join("prog.so").exists());
    }

    #[test]
    fn missing_source_is_a_scan_error() {
        let dir = tempfile::tempdir().unwrap();
        let options = Options::for_source(dir.path().join("absent.a68"));
        let buffer = SharedBuffer::default();
        let exit = run(options, Box::new(buffer.clone()));
        assert_eq!(exit, Exit::Errors);
        assert!(buffer.contents().contains("cannot find source file"));
    }

    #[test]
    fn warnings_are_printed_before_running() {
        let dir = tempfile::tempdir().unwrap();
        let (exit, out) = drive(dir.path(), "INT spare = 1; print (2)", |_| {});
        assert_eq!(exit, Exit::Success);
        let warning = out.find("tag \"spare\" is not used").unwrap();
        let output = out.find("+2").unwrap();
        assert!(warning < output);
    }

    #[test]
    fn verbose_announces_phases() {
        let dir = tempfile::tempdir().unwrap();
        let (_, out) = drive(dir.path(), "print (1)", |o| o.verbose = true);
        assert!(out.starts_with("a68: initialise\na68: tokeniser\n"), "{out}");
        assert!(out.contains("a68: mode checker\n"));
    }

    #[test]
    fn stale_module_refuses_to_rerun() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("prog.so"), b"").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));
        let (exit, out) = drive(dir.path(), "print (1)", |o| o.rerun = true);
        assert_eq!(exit, Exit::Abend);
        assert!(out.contains("exiting: source file is younger than library"), "{out}");
    }

    #[test]
    fn overflowing_budget_directive_is_rejected() {
        let (mut session, buffer, _dir) =
            session_with_source("PR heap=9000000000G handles=9000000000G PR print (1)");
        front_end(&mut session).unwrap();
        assert_eq!(session.scan, 1);
        assert_eq!(session.error_count(), 2);
        assert_eq!(session.budgets, session.options.budgets);
        session.diagnostics_to_terminal(Render::All).unwrap();
        assert!(buffer.contents().contains("invalid option value \"9000000000G\""));
    }

    #[test]
    fn restart_starts_the_diagnostics_stream_over() {
        let (mut session, _, dir) = session_with_source("PR heap=100k PR print (1)");
        session.options.tui = true;
        front_end(&mut session).unwrap();
        assert_eq!(session.scan, 2);
        session.artifacts.close_all().unwrap();
        let stream = fs::read_to_string(dir.path().join("prog.diag")).unwrap();
        assert_eq!(stream.matches("raised to minimum").count(), 1, "{stream}");
    }

    struct BrokenTerminal;

    impl Write for BrokenTerminal {
        fn write(&mut self, _: &[u8]) -> io::Result<usize> {
            Err(io::Error::other("terminal gone"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Err(io::Error::other("terminal gone"))
        }
    }

    /// Loads nothing and fails to unload.
    struct StuckBackend;

    impl NativeBackend for StuckBackend {
        fn emit(&mut self, _: &mut Session) -> Result<Vec<CompiledUnit>, Abend> {
            Ok(Vec::new())
        }

        fn build(&mut self, _: &Session) -> Result<(), BackendError> {
            Ok(())
        }

        fn load(&mut self, _: &Session, _: &[CompiledUnit]) -> Result<LoadedModule, BackendError> {
            Ok(LoadedModule::of_process())
        }

        fn unload(&mut self, _: LoadedModule) -> Result<(), BackendError> {
            Err(BackendError::Unload {
                message: "busy".to_string(),
            })
        }
    }

    #[test]
    fn run_failure_is_reported_before_unload_failure() {
        let (mut session, _, _dir) = session_with_source("print (1)");
        front_end(&mut session).unwrap();
        session.terminal = Box::new(BrokenTerminal);
        let error = link_and_run(&mut session, &mut StuckBackend, Some(&[])).unwrap_err();
        match error {
            Fatal::Abend(abend) => assert_eq!(abend.reason, "cannot write to terminal"),
            other => panic!("unexpected {other:?}"),
        }
        assert!(session.arena.is_sealed());
    }

    #[test]
    fn unload_failure_is_reported_after_a_clean_run() {
        let (mut session, buffer, _dir) = session_with_source("print (1)");
        front_end(&mut session).unwrap();
        let error = link_and_run(&mut session, &mut StuckBackend, Some(&[])).unwrap_err();
        assert!(matches!(error, Fatal::Abend(_)), "{error:?}");
        assert!(buffer.contents().contains("+1"));
    }

    #[test]
    fn bad_script_abends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prog.sh");
        fs::write(&path, "echo hello\n").unwrap();
        let mut options = Options::for_source(&path);
        options.run_script = true;
        let buffer = SharedBuffer::default();
        assert_eq!(run(options, Box::new(buffer.clone())), Exit::Abend);
        assert_eq!(buffer.contents(), "a68: exiting: not a script file\n");
    }

    #[test]
    fn compiled_units_print_like_the_interpreter() {
        if !toolchain() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let text = "INT n = 7;\nprint ((\"n=\", n, newline));\nprint ((maxint, newline))";
        let (exit, interpreted) = drive(dir.path(), text, |_| {});
        assert_eq!(exit, Exit::Success);
        let (exit, compiled) = drive(dir.path(), text, |o| o.optimise = true);
        assert_eq!(exit, Exit::Success, "{compiled}");
        assert_eq!(compiled, interpreted);
        for extension in ["c", "o", "so"] {
            assert!(!dir.path().join(format!("prog.{extension}")).exists());
        }
    }

    #[test]
    fn packaged_script_reruns() {
        if !toolchain() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let (exit, out) = drive(dir.path(), "print ((\"packed\", newline))", |o| o.compile = true);
        assert_eq!(exit, Exit::Success, "{out}");
        assert_eq!(out, "");
        let script = dir.path().join("prog.sh");
        assert!(script.exists());
        assert!(!dir.path().join("prog.so").exists());

        let mut options = Options::for_source(&script);
        options.run_script = true;
        let buffer = SharedBuffer::default();
        assert_eq!(run(options, Box::new(buffer.clone())), Exit::Success);
        assert_eq!(buffer.contents(), "packed\n");
        assert!(!dir.path().join(".a68.tmp.prog.a68").exists());
        assert!(!dir.path().join(".a68.tmp.prog.so").exists());
    }
}
