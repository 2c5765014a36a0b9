//! Unified error types for jailbox

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Main error type for jail operations.
///
/// Display strings carry the error kind so the single failure line on
/// stderr identifies it: `config:`, `policy:`, `dependency:`, `mount:`,
/// `execute:`. Plain filesystem failures name the operation and path.
#[derive(Error, Debug)]
pub enum Error {
    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("{op} {path}: {source}")]
    File {
        op: &'static str,
        path: PathBuf,
        source: io::Error,
    },

    #[error("{op} {path}: {errno}")]
    Sys {
        op: &'static str,
        path: PathBuf,
        errno: nix::errno::Errno,
    },

    // Config errors
    #[error("config: {0}")]
    Config(String),

    #[error("config: property '{0}' is not set")]
    UnknownProperty(String),

    #[error("config: invalid name {0:?}")]
    InvalidName(String),

    #[error("config: invalid regex: {0}")]
    BadRegex(#[from] regex::Error),

    // Policy errors
    #[error("policy: {} outside writepath", .0.display())]
    Policy(PathBuf),

    // Filesystem errors
    #[error("not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("{}: expected {expected}, found {found}", path.display())]
    TypeMismatch {
        path: PathBuf,
        expected: &'static str,
        found: &'static str,
    },

    #[error("{}: {detail}", path.display())]
    Unexpected { path: PathBuf, detail: String },

    // Dependency resolution errors
    #[error("dependency: {0}")]
    Dependency(String),

    // Mount errors
    #[error("mount: {0}")]
    Mount(String),

    // Executor errors
    #[error("execute: {0}")]
    Execute(String),

    /// A step failure wrapped with the verb that raised it.
    #[error("{step}: {source}")]
    Step {
        step: &'static str,
        source: Box<Error>,
    },
}

/// Result type alias for jail operations
pub type Result<T> = std::result::Result<T, Error>;
