use std::path::PathBuf;

use thiserror::Error;

/// All failure kinds produced by the crate.
#[derive(Error, Debug)]
pub enum Error {
    /// A file could not be parsed as an ELF object or archive entry.
    #[error("Malformed input: {0}")]
    Malformed(String),
    /// An expected path could not be opened or stat-ed.
    #[error("Missing {0:?}")]
    Missing(PathBuf),
    /// The environment cannot support the data model (no inodes, sysconf failure, ...).
    #[error("Unsupported environment: {0}")]
    Unsupported(String),
    /// A launched process exited with a non-zero status, was signaled, or
    /// produced output we could not parse.
    #[error("Command failed: {0}")]
    Command(String),
    /// A syntactically or semantically invalid configuration line.
    #[error("Configuration error: {0}")]
    Config(String),
    /// A duplicate key where none is expected, or a double inspection.
    #[error("Invariant violation: {0}")]
    Invariant(String),
    /// A worker task signaled that the whole run should fail; the originating
    /// failure has already been reported.
    #[error("Aborted")]
    Aborted,
    /// ELF parsing error.
    #[error("ELF error: {0}")]
    Elf(#[from] elb::Error),
    /// Input/output error.
    #[error("Input/output error: {0}")]
    Io(#[from] std::io::Error),
}
