//! Self-extracting scripts.
//!
//! A built program is packaged as one executable file holding the source
//! and the shared module:
//!
//! ```text
//! #! <command> --run-script
//! <generic name>
//! --verify "<version>"
//! source <length>
//! <source bytes>
//! library <length>
//! <module bytes>
//! ```
//!
//! Running the script unpacks both parts next to it under hidden temporary
//! names and reruns the module without rebuilding.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::Abend;
use crate::session::{Artifacts, LIBRARY_EXTENSION, generic_name, with_extension};

/// Version recorded in scripts and checked when they are run.
pub const VERSION: &str = concat!("a68 ", env!("CARGO_PKG_VERSION"));

/// Prefix of the unpacked files.
pub const HIDDEN_TEMP_PREFIX: &str = ".a68.tmp";

pub fn compose(command: &str, generic: &str, source: &[u8], library: &[u8]) -> Vec<u8> {
    let mut script = Vec::with_capacity(source.len() + library.len() + 128);
    script.extend_from_slice(format!("#! {command} --run-script\n").as_bytes());
    script.extend_from_slice(format!("{generic}\n--verify \"{VERSION}\"\n").as_bytes());
    script.extend_from_slice(format!("source {}\n", source.len()).as_bytes());
    script.extend_from_slice(source);
    script.extend_from_slice(format!("\nlibrary {}\n", library.len()).as_bytes());
    script.extend_from_slice(library);
    script
}

#[derive(Debug, PartialEq, Eq)]
pub struct Unpacked {
    pub generic: String,
    pub source: Vec<u8>,
    pub library: Vec<u8>,
}

struct Reader<'b> {
    bytes: &'b [u8],
    pos: usize,
}

impl<'b> Reader<'b> {
    fn line(&mut self) -> Option<&'b str> {
        let rest = self.bytes.get(self.pos..)?;
        let end = rest.iter().position(|&b| b == b'\n')?;
        self.pos += end + 1;
        std::str::from_utf8(&rest[..end]).ok()
    }

    fn take(&mut self, n: usize) -> Option<&'b [u8]> {
        let part = self.bytes.get(self.pos..self.pos.checked_add(n)?)?;
        self.pos += n;
        Some(part)
    }

    fn part(&mut self, name: &str) -> Option<&'b [u8]> {
        let header = self.line()?;
        let length = header.strip_prefix(name)?.trim().parse().ok()?;
        self.take(length)
    }
}

pub fn parse(bytes: &[u8]) -> Result<Unpacked, Abend> {
    let corrupt = || Abend::new("script file is corrupt");
    let mut reader = Reader { bytes, pos: 0 };
    let shebang = reader.line().ok_or_else(corrupt)?;
    if !shebang.starts_with("#!") || !shebang.ends_with("--run-script") {
        return Err(Abend::new("not a script file"));
    }
    let generic = reader.line().ok_or_else(corrupt)?.to_string();
    let verify = reader.line().ok_or_else(corrupt)?;
    let version = verify
        .strip_prefix("--verify ")
        .map(|v| v.trim_matches('"'))
        .ok_or_else(corrupt)?;
    if version != VERSION {
        return Err(Abend::new("script was built by a different version").with_info(version));
    }
    let source = reader.part("source ").ok_or_else(corrupt)?.to_vec();
    reader.line().ok_or_else(corrupt)?;
    let library = reader.part("library ").ok_or_else(corrupt)?.to_vec();
    Ok(Unpacked {
        generic,
        source,
        library,
    })
}

/// Where the parts of a script named `generic` are unpacked.
pub fn unpacked_source(directory: &Path, generic: &str) -> PathBuf {
    directory.join(format!("{HIDDEN_TEMP_PREFIX}.{generic}.a68"))
}

/// Packages the built program into `<name>.sh`.
pub fn write_script(command: &str, artifacts: &Artifacts) -> Result<(), Abend> {
    let read = |path: &Path| fs::read(path).map_err(|e| Abend::io("cannot read", path, &e));
    let source = read(&artifacts.source)?;
    let library = read(&artifacts.library)?;
    let generic = artifacts
        .generic
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let script = compose(command, &generic, &source, &library);
    fs::write(&artifacts.script, script)
        .map_err(|e| Abend::io("cannot compose script file", &artifacts.script, &e))?;
    make_executable(&artifacts.script)?;
    debug!(path = %artifacts.script.display(), "script written");
    Ok(())
}

#[cfg(unix)]
fn make_executable(path: &Path) -> Result<(), Abend> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o755))
        .map_err(|e| Abend::io("cannot compose script file", path, &e))
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> Result<(), Abend> {
    Ok(())
}

/// Unpacks a script next to itself and returns the unpacked source path.
/// The source is written before the module so the module is never older.
pub fn unpack(script: &Path) -> Result<PathBuf, Abend> {
    let bytes = fs::read(script).map_err(|e| Abend::io("cannot read", script, &e))?;
    let unpacked = parse(&bytes)?;
    let directory = script.parent().unwrap_or(Path::new("."));
    let source = unpacked_source(directory, &unpacked.generic);
    let library = with_extension(&generic_name(&source), LIBRARY_EXTENSION);
    fs::write(&source, &unpacked.source).map_err(|e| Abend::io("cannot write", &source, &e))?;
    fs::write(&library, &unpacked.library).map_err(|e| Abend::io("cannot write", &library, &e))?;
    debug!(source = %source.display(), "script unpacked");
    Ok(source)
}
