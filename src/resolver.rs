//! Locating the dynamic loader and enumerating shared-object
//! dependencies.
//!
//! Both collaborators are (command template, regex) pairs rather than
//! hard-wired tool invocations, so any linker toolchain can be dropped in
//! and tests can stub them with echo.

use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::Command;

use regex::Regex;

use crate::error::{Error, Result};
use crate::policy::Gate;
use crate::props::PropertyBag;

pub const DEFAULT_LDCONFIG_CMD: &str = "/sbin/ldconfig -p";
pub const DEFAULT_LDCONFIG_RX: &str = r"^\s*(ld-linux\S*|ld\.so\S*)\s+\(.*\)\s*=>\s*(\S+)\s*$";
pub const DEFAULT_LDLIST_CMD: &str = "{ldlinux_so} --list {path}";
pub const DEFAULT_LDLIST_RX: &str = r"\s(/\S+)\s+\(0x[0-9a-fA-F]+\)";

/// NSS and resolver shims are dlopened at runtime, so they never show up
/// in a dependency listing.
const DNS_RX: &str = r"^lib(nsl|resolv|nss[_0-9a-z]+)\.";

const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];

pub struct Resolver {
    ldconfig_cmd: String,
    ldconfig_rx: Regex,
    ldlist_cmd: String,
    ldlist_rx: Regex,
    dns_rx: Regex,
    examined: bool,
    loader: Option<PathBuf>,
    dns_libs: Vec<PathBuf>,
    cache: HashMap<PathBuf, Vec<PathBuf>>,
}

impl Resolver {
    pub fn new() -> Result<Self> {
        Ok(Self {
            ldconfig_cmd: DEFAULT_LDCONFIG_CMD.to_string(),
            ldconfig_rx: Regex::new(DEFAULT_LDCONFIG_RX)?,
            ldlist_cmd: DEFAULT_LDLIST_CMD.to_string(),
            ldlist_rx: Regex::new(DEFAULT_LDLIST_RX)?,
            dns_rx: Regex::new(DNS_RX)?,
            examined: false,
            loader: None,
            dns_libs: Vec::new(),
            cache: HashMap::new(),
        })
    }

    pub fn set_ldconfig_cmd(&mut self, cmd: &str) {
        self.ldconfig_cmd = cmd.to_string();
        self.reset();
    }

    pub fn set_ldconfig_rx(&mut self, pattern: &str) -> Result<()> {
        self.ldconfig_rx = Regex::new(pattern)?;
        self.reset();
        Ok(())
    }

    pub fn set_ldlist_cmd(&mut self, cmd: &str) {
        self.ldlist_cmd = cmd.to_string();
        self.cache.clear();
    }

    pub fn set_ldlist_rx(&mut self, pattern: &str) -> Result<()> {
        self.ldlist_rx = Regex::new(pattern)?;
        self.cache.clear();
        Ok(())
    }

    fn reset(&mut self) {
        self.examined = false;
        self.loader = None;
        self.dns_libs.clear();
        self.cache.clear();
    }

    /// True when the file looks like something the dependency command can
    /// resolve.
    pub fn is_elf(path: &Path) -> bool {
        let mut magic = [0u8; 4];
        File::open(path)
            .and_then(|mut f| f.read_exact(&mut magic))
            .map(|_| magic == ELF_MAGIC)
            .unwrap_or(false)
    }

    /// Scan the loader-discovery command output once per run. The first
    /// capture naming an absolute, existing, executable path wins; DNS
    /// shim libraries are collected from the same output.
    fn examine(&mut self, gate: &Gate) -> Result<()> {
        if self.examined {
            return Ok(());
        }
        self.examined = true;
        let argv = split_cmd(&self.ldconfig_cmd)?;
        let out = run(gate, &argv)?;
        for line in out.text.lines() {
            if self.loader.is_none() {
                if let Some(caps) = self.ldconfig_rx.captures(line) {
                    for cap in caps.iter().skip(1).flatten() {
                        let path = Path::new(cap.as_str());
                        if path.is_absolute() && is_executable(path) {
                            let real = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
                            self.loader = Some(real);
                            break;
                        }
                    }
                }
            }
            let name = line.split_whitespace().next().unwrap_or("");
            if self.dns_rx.is_match(name) {
                if let Some(path) = line.split("=>").nth(1).map(str::trim) {
                    let path = Path::new(path);
                    if path.is_absolute() && path.exists() {
                        let real = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
                        if !self.dns_libs.contains(&real) {
                            self.dns_libs.push(real);
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// The dynamic loader, discovered once per run.
    pub fn loader(&mut self, gate: &Gate) -> Result<PathBuf> {
        self.examine(gate)?;
        self.loader.clone().ok_or_else(|| {
            Error::Dependency(format!("no dynamic loader found by {:?}", self.ldconfig_cmd))
        })
    }

    /// Host libraries matched by the DNS shim pattern.
    pub fn dns_libraries(&mut self, gate: &Gate) -> Result<Vec<PathBuf>> {
        self.examine(gate)?;
        Ok(self.dns_libs.clone())
    }

    /// Shared objects `path` needs at load time, the loader included.
    /// A dependency command that exits nonzero means the file is not
    /// something it can resolve, which is an empty set rather than an
    /// error.
    pub fn dependencies(&mut self, gate: &Gate, path: &Path) -> Result<Vec<PathBuf>> {
        if let Some(cached) = self.cache.get(path) {
            return Ok(cached.clone());
        }
        if !path.is_absolute() {
            return Err(Error::Dependency(format!(
                "{}: path not absolute",
                path.display()
            )));
        }
        let loader = self.loader(gate)?;

        let mut bag = PropertyBag::new();
        bag.set("ldlinux_so", loader.to_string_lossy());
        bag.set("path", path.to_string_lossy());
        let cmd = bag.expand(&self.ldlist_cmd)?;
        let argv = split_cmd(&cmd)?;
        let out = run(gate, &argv)?;

        let mut deps: Vec<PathBuf> = Vec::new();
        if out.success {
            for line in out.text.lines() {
                for caps in self.ldlist_rx.captures_iter(line) {
                    for cap in caps.iter().skip(1).flatten() {
                        let dep = Path::new(cap.as_str());
                        if dep.is_absolute()
                            && dep.exists()
                            && !deps.iter().any(|d| d.as_path() == dep)
                        {
                            deps.push(dep.to_path_buf());
                        }
                    }
                }
            }
            if deps.is_empty() {
                gate.trace(&format!("no dependencies matched for {}", path.display()));
            }
            if !deps.contains(&loader) {
                deps.push(loader);
            }
        }
        self.cache.insert(path.to_path_buf(), deps.clone());
        Ok(deps)
    }
}

struct Output {
    text: String,
    success: bool,
}

fn split_cmd(cmd: &str) -> Result<Vec<String>> {
    let argv: Vec<String> = cmd.split_whitespace().map(String::from).collect();
    if argv.is_empty() {
        return Err(Error::Config(format!("empty command: {:?}", cmd)));
    }
    Ok(argv)
}

/// Run a collaborator command, folding stderr into the scanned text.
fn run(gate: &Gate, argv: &[String]) -> Result<Output> {
    gate.command(&argv.join(" "));
    let out = Command::new(&argv[0])
        .args(&argv[1..])
        .output()
        .map_err(|e| Error::Dependency(format!("{}: {}", argv.join(" "), e)))?;
    let mut text = String::from_utf8_lossy(&out.stdout).into_owned();
    text.push_str(&String::from_utf8_lossy(&out.stderr));
    Ok(Output {
        text,
        success: out.status.success(),
    })
}

fn is_executable(path: &Path) -> bool {
    nix::unistd::access(path, nix::unistd::AccessFlags::X_OK).is_ok()
}
