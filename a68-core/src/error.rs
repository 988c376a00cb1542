use std::fmt;
use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Lower-cased rendering of an OS error, as appended to fatal messages and
/// diagnostics.
pub fn os_error_text(error: &io::Error) -> String {
    let text = error.to_string();
    // Drop the " (os error N)" tail std appends.
    let text = match text.find(" (os error") {
        Some(index) => &text[..index],
        None => text.as_str(),
    };
    text.to_lowercase()
}

/// Internal-consistency or mandatory-operation failure.
///
/// An abend is never retried and never swallowed. The driver formats it as
/// `<cmd>: exiting: <reason>[, <info>][ (<os error>)]` and terminates.
#[derive(Debug, Error)]
pub struct Abend {
    pub reason: String,
    pub info: Option<String>,
    pub os_error: Option<String>,
}

impl Abend {
    pub fn new(reason: impl Into<String>) -> Self {
        Abend {
            reason: reason.into(),
            info: None,
            os_error: None,
        }
    }

    pub fn with_info(mut self, info: impl Into<String>) -> Self {
        self.info = Some(info.into());
        self
    }

    pub fn with_os_error(mut self, error: &io::Error) -> Self {
        self.os_error = Some(os_error_text(error));
        self
    }

    pub fn out_of_core() -> Self {
        Abend::new("out of core")
    }

    pub fn io(reason: impl Into<String>, path: &std::path::Path, error: &io::Error) -> Self {
        Abend::new(reason)
            .with_info(path.display().to_string())
            .with_os_error(error)
    }
}

impl fmt::Display for Abend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.reason)?;
        if let Some(info) = &self.info {
            write!(f, ", {info}")?;
        }
        if let Some(os_error) = &self.os_error {
            write!(f, " ({os_error})")?;
        }
        Ok(())
    }
}

/// Early unrecoverable failure while scanning the source.
///
/// The diagnostic itself has already been recorded in the ledger when this
/// value is raised; the driver only needs to flush and exit.
#[derive(Debug, Error)]
#[error("scan error: {message}")]
pub struct ScanError {
    pub message: String,
}

/// Failure inside the native backend. Subprocess and loader failures are
/// one kind; the orchestrator turns them into an [`Abend`].
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("cannot compile, {command}")]
    Compile { command: String },
    #[error("cannot link, {command}")]
    Link { command: String },
    #[error("cannot start {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },
    #[error("cannot open shared library, {path}: {message}")]
    Load { path: PathBuf, message: String },
    #[error("cannot resolve symbol {symbol}: {message}")]
    Resolve { symbol: String, message: String },
    #[error("cannot close shared library: {message}")]
    Unload { message: String },
}

impl From<BackendError> for Abend {
    fn from(error: BackendError) -> Self {
        match error {
            BackendError::Compile { command } => Abend::new("cannot compile").with_info(command),
            BackendError::Link { command } => Abend::new("cannot link").with_info(command),
            BackendError::Spawn { command, source } => Abend::new("cannot start")
                .with_info(command)
                .with_os_error(&source),
            BackendError::Load { path, message } => Abend::new("cannot open shared library")
                .with_info(format!("{}: {message}", path.display())),
            BackendError::Resolve { symbol, message } => {
                Abend::new("cannot resolve symbol").with_info(format!("{symbol}: {message}"))
            }
            BackendError::Unload { message } => {
                Abend::new("cannot close shared library").with_info(message)
            }
        }
    }
}

/// The single error type that unwinds to the top of the driver.
#[derive(Debug, Error)]
pub enum Fatal {
    #[error(transparent)]
    Abend(#[from] Abend),
    #[error(transparent)]
    Scan(#[from] ScanError),
}

impl From<BackendError> for Fatal {
    fn from(error: BackendError) -> Self {
        Fatal::Abend(error.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abend_formats_info_and_os_error() {
        let error = io::Error::from(io::ErrorKind::NotFound);
        let abend = Abend::new("cannot open file")
            .with_info("prog.a68")
            .with_os_error(&error);
        let text = abend.to_string();
        assert!(text.starts_with("cannot open file, prog.a68 ("), "{text}");
        assert!(text.ends_with(')'));
    }

    #[test]
    fn os_error_text_is_lower_case_without_code() {
        let error = io::Error::from_raw_os_error(2);
        let text = os_error_text(&error);
        assert!(!text.contains("os error"));
        assert_eq!(text, text.to_lowercase());
    }

    #[test]
    fn backend_errors_become_abends_naming_the_command() {
        let abend: Abend = BackendError::Compile {
            command: "false -c -o prog.o prog.c".to_string(),
        }
        .into();
        assert_eq!(abend.reason, "cannot compile");
        assert_eq!(abend.info.as_deref(), Some("false -c -o prog.o prog.c"));
    }
}
