//! Mount controller: stack the jail home over its mount point and apply
//! bind mounts with derived options.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::mount::{mount, umount2, MntFlags, MsFlags};
use nix::unistd::{access, AccessFlags};

use crate::config::abspath;
use crate::error::{Error, Result};
use crate::fsops::{self, Meta};
use crate::sequencer::Jail;

/// One live mount read from the host mount table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub source: String,
    pub target: PathBuf,
    pub options: BTreeSet<String>,
}

/// Parse `/proc/self/mounts` format, keeping entries at or below `below`.
pub fn parse_mount_table(text: &str, below: &Path) -> Vec<MountEntry> {
    let mut entries = Vec::new();
    for line in text.lines() {
        let mut parts = line.split_whitespace();
        let (Some(source), Some(target), Some(_fstype), Some(opts)) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            continue;
        };
        let target = PathBuf::from(unescape_octal(target));
        if target.starts_with(below) {
            entries.push(MountEntry {
                source: unescape_octal(source),
                target,
                options: opts.split(',').map(String::from).collect(),
            });
        }
    }
    entries
}

pub fn read_mount_table(below: &Path) -> Result<Vec<MountEntry>> {
    let text = fs::read_to_string("/proc/self/mounts")
        .or_else(|_| fs::read_to_string("/etc/mtab"))
        .map_err(|e| Error::Mount(format!("cannot read mount table: {}", e)))?;
    Ok(parse_mount_table(&text, below))
}

/// The mount table escapes whitespace in paths as `\040` style octal.
fn unescape_octal(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            let oct = &s[i + 1..i + 4];
            if let Ok(v) = u8::from_str_radix(oct, 8) {
                out.push(v);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Derive the option set for one bind. `auto` picks `exec,ro` for sources
/// inside the jail home, `rw` for sources the host process can write and
/// `ro` otherwise. `noexec` is added unless `exec` was requested and
/// `nosuid` is always present; `suid` never passes through.
pub fn derive_bindopts(srcpath: &Path, requested: &str, jailhome: &Path) -> BTreeSet<String> {
    let requested = requested.trim().to_ascii_lowercase();
    let requested = if requested.is_empty() || requested == "auto" {
        if srcpath.starts_with(jailhome) {
            "exec,ro".to_string()
        } else if access(srcpath, AccessFlags::W_OK).is_ok() {
            "rw".to_string()
        } else {
            "ro".to_string()
        }
    } else {
        requested
    };

    let mut opts: BTreeSet<String> = BTreeSet::new();
    opts.insert("nosuid".to_string());
    for token in requested.split(',').map(str::trim).filter(|t| !t.is_empty()) {
        if token == "suid" {
            continue;
        }
        match token {
            "rw" => {
                opts.remove("ro");
            }
            "ro" => {
                opts.remove("rw");
            }
            t => {
                if let Some(base) = t.strip_prefix("no") {
                    opts.remove(base);
                } else {
                    opts.remove(&format!("no{}", t));
                }
            }
        }
        opts.insert(token.to_string());
    }
    if !opts.contains("exec") {
        opts.insert("noexec".to_string());
    }
    if !opts.contains("rw") {
        opts.insert("ro".to_string());
    }
    opts
}

/// The subset of options that matter for deciding whether a live mount is
/// already what we would create.
fn flags_key(opts: &BTreeSet<String>) -> (bool, bool, bool) {
    (
        opts.contains("ro"),
        opts.contains("nosuid"),
        opts.contains("noexec"),
    )
}

fn to_flags(opts: &BTreeSet<String>) -> MsFlags {
    let mut flags = MsFlags::empty();
    if opts.contains("ro") {
        flags |= MsFlags::MS_RDONLY;
    }
    if opts.contains("nosuid") {
        flags |= MsFlags::MS_NOSUID;
    }
    if opts.contains("noexec") {
        flags |= MsFlags::MS_NOEXEC;
    }
    if opts.contains("nodev") {
        flags |= MsFlags::MS_NODEV;
    }
    if opts.contains("noatime") {
        flags |= MsFlags::MS_NOATIME;
    }
    flags
}

fn optstr(opts: &BTreeSet<String>) -> String {
    opts.iter().cloned().collect::<Vec<_>>().join(",")
}

#[derive(Debug)]
struct PlannedMount {
    srcpath: PathBuf,
    dstpath: PathBuf,
    opts: BTreeSet<String>,
    /// false when the target is already bound and only the options change
    bind: bool,
}

impl Jail {
    /// `--mount`: bind the jail home over the mount point, then apply
    /// every registered bind directive.
    pub(crate) fn step_mount(&mut self) -> Result<()> {
        let gate = self.gate();
        let jailhome = self.cfg.jailhome()?;
        let jailmount = self.cfg.jailmount()?;
        let root = Meta::require(Path::new("/"))?;
        fsops::mkdir_all(&gate, &jailhome, root.perm, Some(root.uid), Some(root.gid))?;
        fsops::mkdir_all(&gate, &jailmount, root.perm, Some(root.uid), Some(root.gid))?;

        let live = read_mount_table(&jailmount)?;
        let binds = self.cfg.binds.clone();
        let mut planned: Vec<PlannedMount> = Vec::new();

        for bind in &binds {
            let srcpath = abspath(Path::new(&self.expand(&bind.srcpath)?));
            let relpath = self.expand(&bind.path)?;
            let rel = relpath.trim_start_matches('/');
            let dstpath = abspath(&jailmount.join(rel));
            let mountpoint = jailhome.join(rel);

            let mut skip: Option<&str> = None;
            if !fs::metadata(&srcpath).map(|m| m.is_dir()).unwrap_or(false) {
                // optional binds vanish silently
                skip = Some("srcpath is not a directory");
            } else if srcpath != jailhome && srcpath.starts_with(&jailhome) {
                skip = Some("inside jailhome");
            } else if srcpath.starts_with(&jailmount) {
                skip = Some("inside jailmount");
            } else if srcpath != jailhome
                && (jailhome.starts_with(&srcpath) || jailmount.starts_with(&srcpath))
            {
                skip = Some("parent of the jail");
            } else if planned.iter().any(|p| p.dstpath == dstpath) {
                skip = Some("already bound earlier on the line");
            }

            if let Some(msg) = skip {
                gate.trace(&format!(
                    "--bind {} {} {}: {}",
                    srcpath.display(),
                    bind.bindopts,
                    relpath,
                    msg
                ));
                continue;
            }

            // mount point inside the jail home, 0750 when missing
            if mountpoint != jailhome && Meta::lstat(&mountpoint)?.is_none() {
                fsops::mkdir_all(&gate, &mountpoint, 0o750, None, None)?;
            }

            let opts = derive_bindopts(&srcpath, &bind.bindopts, &jailhome);
            match live.iter().find(|m| m.target == dstpath) {
                Some(m) if flags_key(&m.options) == flags_key(&opts) => {
                    gate.trace(&format!(
                        "--bind {} {} {}: already mounted from {}",
                        srcpath.display(),
                        optstr(&opts),
                        relpath,
                        m.source
                    ));
                }
                Some(_) => planned.push(PlannedMount {
                    srcpath,
                    dstpath,
                    opts,
                    bind: false,
                }),
                None => planned.push(PlannedMount {
                    srcpath,
                    dstpath,
                    opts,
                    bind: true,
                }),
            }
        }

        // parents before children
        planned.sort_by_key(|p| {
            (
                p.dstpath.components().count(),
                p.dstpath.as_os_str().len(),
            )
        });

        for plan in &planned {
            if plan.bind {
                let cmd = format!(
                    "mount --bind {} {}",
                    plan.srcpath.display(),
                    plan.dstpath.display()
                );
                if !gate.mutate(&plan.dstpath, &cmd)? {
                    mount(
                        Some(&plan.srcpath),
                        &plan.dstpath,
                        None::<&str>,
                        MsFlags::MS_BIND,
                        None::<&str>,
                    )
                    .map_err(|e| {
                        Error::Mount(format!(
                            "bind {} -> {}: {}",
                            plan.srcpath.display(),
                            plan.dstpath.display(),
                            e
                        ))
                    })?;
                }
            }
            let cmd = format!(
                "mount -o remount,bind,{} {}",
                optstr(&plan.opts),
                plan.dstpath.display()
            );
            if !gate.mutate(&plan.dstpath, &cmd)? {
                mount(
                    None::<&str>,
                    &plan.dstpath,
                    None::<&str>,
                    MsFlags::MS_BIND | MsFlags::MS_REMOUNT | to_flags(&plan.opts),
                    None::<&str>,
                )
                .map_err(|e| {
                    Error::Mount(format!("remount {}: {}", plan.dstpath.display(), e))
                })?;
            }
        }
        self.mounted = true;
        Ok(())
    }

    /// `--umount`: take down everything at or below the mount point,
    /// deepest first. "Not mounted" is not a failure.
    pub(crate) fn step_umount(&mut self) -> Result<()> {
        let gate = self.gate();
        let jailmount = self.cfg.jailmount()?;
        let mut entries = read_mount_table(&jailmount)?;
        entries.sort_by_key(|m| {
            std::cmp::Reverse((m.target.components().count(), m.target.as_os_str().len()))
        });
        for entry in &entries {
            let lazy = if self.cfg.lazy { "-l " } else { "" };
            let cmd = format!("umount {}{}", lazy, entry.target.display());
            if gate.mutate(&entry.target, &cmd)? {
                continue;
            }
            let flags = if self.cfg.lazy {
                MntFlags::MNT_DETACH
            } else {
                MntFlags::empty()
            };
            match umount2(&entry.target, flags) {
                Ok(()) | Err(Errno::EINVAL) | Err(Errno::ENOENT) => {}
                Err(e) => {
                    return Err(Error::Mount(format!(
                        "umount {}: {}",
                        entry.target.display(),
                        e
                    )))
                }
            }
        }
        // drop the bare mount point; harmless if something still holds it
        if Meta::lstat(&jailmount)?.is_some()
            && !gate.mutate(&jailmount, &format!("rmdir {}", jailmount.display()))?
        {
            let _ = fs::remove_dir(&jailmount);
        }
        self.mounted = false;
        Ok(())
    }
}
