//! Native code bridge: emit C, build a shared module with the external
//! toolchain, load it into the running process and hand compiled units to
//! the evaluator.

use std::collections::HashMap;
use std::ffi::{OsStr, c_char, c_int, c_void};
use std::fmt;
use std::fs;
use std::path::Path;
use std::process::Command;

use libloading::os::unix::{Library, RTLD_GLOBAL, RTLD_NOW};
use tracing::{debug, info};

use crate::codegen_c::{CompiledUnit, emit_c};
use crate::error::{Abend, BackendError};
use crate::genie::format_int;
use crate::options::Options;
use crate::registry::NodeId;
use crate::session::Session;

/// Table of host callbacks handed to every compiled unit. The layout
/// matches `a68_host` in the generated C.
#[repr(C)]
pub struct HostTable {
    pub context: *mut c_void,
    pub put_int: extern "C" fn(*mut c_void, i64),
    pub put_str: extern "C" fn(*mut c_void, *const c_char, usize),
    pub put_newline: extern "C" fn(*mut c_void),
}

pub type UnitFn = unsafe extern "C" fn(*const HostTable) -> c_int;

fn buffer<'a>(context: *mut c_void) -> &'a mut Vec<u8> {
    // SAFETY: `context` is always the `Vec<u8>` borrowed by
    // `LoadedModule::call` for the duration of the unit call.
    unsafe { &mut *context.cast::<Vec<u8>>() }
}

extern "C" fn host_put_int(context: *mut c_void, value: i64) {
    buffer(context).extend_from_slice(format_int(value).as_bytes());
}

extern "C" fn host_put_str(context: *mut c_void, text: *const c_char, len: usize) {
    if text.is_null() {
        return;
    }
    // SAFETY: generated code passes a string literal together with its length.
    let bytes = unsafe { std::slice::from_raw_parts(text.cast::<u8>(), len) };
    buffer(context).extend_from_slice(bytes);
}

extern "C" fn host_put_newline(context: *mut c_void) {
    buffer(context).push(b'\n');
}

/// A loaded module and the entry points resolved from it. The entry points
/// are valid for as long as the module is held.
pub struct LoadedModule {
    library: Library,
    units: HashMap<NodeId, UnitFn>,
}

impl LoadedModule {
    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn contains(&self, node: NodeId) -> bool {
        self.units.contains_key(&node)
    }

    /// Runs the compiled implementation of `node`, appending its output.
    /// Returns `None` when the node has no compiled implementation.
    pub fn call(&self, node: NodeId, out: &mut Vec<u8>) -> Option<c_int> {
        let unit = self.units.get(&node)?;
        let table = HostTable {
            context: (out as *mut Vec<u8>).cast(),
            put_int: host_put_int,
            put_str: host_put_str,
            put_newline: host_put_newline,
        };
        // SAFETY: the symbol was resolved from `self.library`, which stays
        // open while `self` exists, and has the generated signature.
        Some(unsafe { unit(&table) })
    }
}

#[cfg(test)]
impl LoadedModule {
    /// The running process itself, with no compiled units.
    pub(crate) fn of_process() -> Self {
        LoadedModule {
            library: Library::this(),
            units: HashMap::new(),
        }
    }
}

impl fmt::Debug for LoadedModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadedModule")
            .field("units", &self.units.len())
            .finish()
    }
}

/// The four steps of native execution.
pub trait NativeBackend {
    /// Writes the C translation and records compiled units on their nodes.
    fn emit(&mut self, session: &mut Session) -> Result<Vec<CompiledUnit>, Abend>;
    /// Compiles and links the translation into a shared module.
    fn build(&mut self, session: &Session) -> Result<(), BackendError>;
    /// Loads the module and resolves every unit.
    fn load(&mut self, session: &Session, units: &[CompiledUnit])
    -> Result<LoadedModule, BackendError>;
    fn unload(&mut self, module: LoadedModule) -> Result<(), BackendError>;
}

/// Backend driving an external C compiler and linker.
#[derive(Debug, Default)]
pub struct CcBackend {
    /// The running process, opened with global visibility before the module.
    this: Option<Library>,
}

impl CcBackend {
    pub fn new() -> Self {
        CcBackend::default()
    }
}

/// Renders a command line the way it is reported in diagnostics.
fn command_line(program: &str, args: &[String]) -> String {
    std::iter::once(program)
        .chain(args.iter().map(String::as_str))
        .collect::<Vec<_>>()
        .join(" ")
}

fn path_arg(path: &Path) -> String {
    path.display().to_string()
}

/// Arguments of the compile step.
pub fn compile_args(options: &Options, object: &Path, binary: &Path) -> Vec<String> {
    let mut args = vec!["-I.".to_string(), format!("-O{}", options.opt_level.min(3))];
    args.extend(options.tuning.iter().cloned());
    args.extend(["-fPIC", "-c", "-o"].map(String::from));
    args.push(path_arg(binary));
    args.push(path_arg(object));
    args
}

/// Arguments of the link step.
pub fn link_args(binary: &Path, library: &Path) -> Vec<String> {
    vec![
        "-shared".to_string(),
        "-o".to_string(),
        path_arg(library),
        path_arg(binary),
    ]
}

fn run(program: &str, args: &[String], failed: fn(String) -> BackendError) -> Result<(), BackendError> {
    let command = command_line(program, args);
    debug!(%command, "running");
    let status = Command::new(program)
        .args(args)
        .status()
        .map_err(|source| BackendError::Spawn {
            command: command.clone(),
            source,
        })?;
    if status.success() {
        Ok(())
    } else {
        Err(failed(command))
    }
}

impl NativeBackend for CcBackend {
    fn emit(&mut self, session: &mut Session) -> Result<Vec<CompiledUnit>, Abend> {
        let mut text = Vec::new();
        let units = emit_c(session, &mut text)?;
        let out = session.artifacts.open_object()?;
        std::io::Write::write_all(out, &text)
            .map_err(|e| Abend::new("cannot write object file").with_os_error(&e))?;
        session.artifacts.close_object()?;
        Ok(units)
    }

    fn build(&mut self, session: &Session) -> Result<(), BackendError> {
        let options = &session.options;
        let artifacts = &session.artifacts;
        info!(compiler = %options.compiler, "compiling");
        run(
            &options.compiler,
            &compile_args(options, &artifacts.object, &artifacts.binary),
            |command| BackendError::Compile { command },
        )?;
        run(
            &options.linker,
            &link_args(&artifacts.binary, &artifacts.library),
            |command| BackendError::Link { command },
        )
    }

    fn load(
        &mut self,
        session: &Session,
        units: &[CompiledUnit],
    ) -> Result<LoadedModule, BackendError> {
        let path = &session.artifacts.library;
        // SAFETY: opening the running executable runs no initialisers.
        let this = unsafe { Library::open(None::<&OsStr>, RTLD_NOW | RTLD_GLOBAL) }.map_err(
            |e| BackendError::Load {
                path: path.clone(),
                message: e.to_string(),
            },
        )?;
        self.this = Some(this);
        // SAFETY: the module was produced from our own translation, whose
        // only initialisers are those of the C runtime.
        let library = unsafe { Library::open(Some(path.as_os_str()), RTLD_NOW | RTLD_GLOBAL) }
            .map_err(|e| BackendError::Load {
                path: path.clone(),
                message: e.to_string(),
            })?;
        let mut resolved = HashMap::with_capacity(units.len());
        for unit in units {
            let mut symbol = unit.name.clone().into_bytes();
            symbol.push(0);
            // SAFETY: every generated unit has the `UnitFn` signature.
            let entry = unsafe { library.get::<UnitFn>(&symbol) }.map_err(|e| {
                BackendError::Resolve {
                    symbol: unit.name.clone(),
                    message: e.to_string(),
                }
            })?;
            resolved.insert(unit.node, *entry);
        }
        debug!(units = resolved.len(), "module loaded");
        Ok(LoadedModule {
            library,
            units: resolved,
        })
    }

    fn unload(&mut self, module: LoadedModule) -> Result<(), BackendError> {
        let unload = |e: libloading::Error| BackendError::Unload {
            message: e.to_string(),
        };
        module.library.close().map_err(unload)?;
        if let Some(this) = self.this.take() {
            this.close().map_err(unload)?;
        }
        debug!("module unloaded");
        Ok(())
    }
}

/// With `rerun`, the module must be at least as recent as the source.
pub fn check_rerun(source: &Path, library: &Path) -> Result<(), Abend> {
    let modified = |path: &Path| {
        fs::metadata(path)
            .and_then(|m| m.modified())
            .map_err(|e| Abend::io("cannot stat", path, &e))
    };
    if modified(source)? > modified(library)? {
        return Err(Abend::new("source file is younger than library")
            .with_info(library.display().to_string()));
    }
    Ok(())
}
