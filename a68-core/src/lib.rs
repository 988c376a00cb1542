//! Core of the a68 compiler-interpreter driver.
//!
//! A source program goes through a fixed sequence of phases:
//!
//!   source .a68
//!     -> lexer        (tokens, directives)
//!     -> refinement   (substituted token chain)
//!     -> parser       (tree, scopes)
//!     -> modetab      (mode graph)
//!     -> typecheck    (tags, modes, coercions)
//!     -> codegen_c + native (optional shared module)
//!     -> genie        (execution)
//!
//! Every long-lived record is charged to one session [`arena::Arena`];
//! diagnostics accumulate per source line and stop later phases once an
//! error is recorded. The CLI should depend on this crate rather than
//! reimplementing the pipeline.

// ---------------------------------------------------------------------
// Error handling, configuration and diagnostics
// ---------------------------------------------------------------------

pub mod error;
pub mod options;
pub mod diagnostic;

// ---------------------------------------------------------------------
// Memory and records
// ---------------------------------------------------------------------

pub mod arena;
pub mod postulate;
pub mod registry;
pub mod moids;
pub mod session;

// ---------------------------------------------------------------------
// Front-end: lexing, refinements and parsing
// ---------------------------------------------------------------------

pub mod lexer;
pub mod refinement;
pub mod parser;

// ---------------------------------------------------------------------
// Semantic layers: standard environment, modes, tags and checks
// ---------------------------------------------------------------------

pub mod stdenv;
pub mod modetab;
pub mod typecheck;

// ---------------------------------------------------------------------
// Back-end: C translation, native bridge, evaluator and orchestration
// ---------------------------------------------------------------------

pub mod codegen_c;
pub mod native;
pub mod genie;
pub mod listing;
pub mod script;
pub mod compiler;

// ---------------------------------------------------------------------
// Public API re-exports
// ---------------------------------------------------------------------

pub use compiler::{Exit, Phase, front_end, run};
pub use error::{Abend, BackendError, Fatal, ScanError};
pub use options::{ListingOptions, MemoryBudgets, Options};
pub use session::Session;
