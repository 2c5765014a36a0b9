//! Write-path policy and the gate in front of every mutating syscall.

use std::path::Path;

use regex::Regex;

use crate::error::{Error, Result};

/// The `writepath` allowlist: a path may only be mutated if it matches.
#[derive(Debug, Clone)]
pub struct WritePolicy {
    rx: Regex,
}

impl WritePolicy {
    pub fn new(pattern: &str) -> Result<Self> {
        Ok(Self {
            rx: Regex::new(pattern)?,
        })
    }

    pub fn pattern(&self) -> &str {
        self.rx.as_str()
    }

    pub fn allows(&self, path: &Path) -> bool {
        self.rx.is_match(&path.to_string_lossy())
    }

    pub fn check(&self, path: &Path) -> Result<()> {
        if self.allows(path) {
            Ok(())
        } else {
            Err(Error::Policy(path.to_path_buf()))
        }
    }
}

/// Decides, for each would-be mutation, whether it may run and whether its
/// shell equivalent is printed. In test mode the equivalent is printed and
/// the syscall skipped; in verbose mode it is printed and then run. The
/// policy check happens before either.
#[derive(Debug, Clone)]
pub struct Gate {
    pub policy: WritePolicy,
    pub test: bool,
    pub verbose: bool,
}

impl Gate {
    /// Returns true when the caller must skip the actual syscall.
    pub fn mutate(&self, path: &Path, cmd: &str) -> Result<bool> {
        self.policy.check(path)?;
        if self.test {
            println!("{}", cmd);
            return Ok(true);
        }
        if self.verbose {
            println!("# {}", cmd);
        }
        Ok(false)
    }

    /// Echo a read-only child command in verbose mode.
    pub fn command(&self, cmd: &str) {
        if self.verbose {
            println!("# {}", cmd);
        }
    }

    /// Diagnostic chatter, shown in test and verbose modes.
    pub fn trace(&self, msg: &str) {
        if self.test || self.verbose {
            eprintln!("## {}", msg);
        }
    }
}
