//! Final handoff: sanitize the environment, drop privileges, chroot and
//! replace the process image. Nothing after a successful `--execute`
//! ever runs.

use std::collections::BTreeMap;
use std::env;
use std::ffi::CString;
use std::path::Path;

use nix::sys::stat::{umask, Mode};
use nix::unistd::{chdir, chroot, execve, setgid, setgroups, setuid, Gid, Uid};

use crate::accounts;
use crate::config::abspath;
use crate::error::{Error, Result};
use crate::sequencer::Jail;

impl Jail {
    /// `--execute`: implies `--passwd` and `--mount`, then hands the
    /// process over. Returns only in test mode or on failure.
    pub(crate) fn step_execute(&mut self, args: &[String]) -> Result<()> {
        self.cfg.passwd = true;
        self.update_passwd()?;
        if !self.mounted {
            self.step_mount()?;
        }

        let jailmount = self.cfg.jailmount()?;
        let jailhome = self.cfg.jailhome()?;

        let (mut uid, mut gid) = (None, None);
        if let Some(spec) = self.cfg.exec_chuid.clone() {
            let spec = self.expand(&spec)?;
            let (user, group) = accounts::split_spec(&spec);
            let (u, g) = accounts::resolve_spec(user, group);
            uid = u;
            gid = g;
        }
        let uid = uid
            .or(self.cfg.uid)
            .unwrap_or_else(|| nix::unistd::geteuid().as_raw());
        let gid = gid
            .or(self.cfg.gid)
            .unwrap_or_else(|| nix::unistd::getegid().as_raw());
        if uid == 0 || gid == 0 {
            return Err(Error::Execute(format!(
                "refusing to run as uid {} gid {}",
                uid, gid
            )));
        }
        self.accounts.note_uid(uid);
        self.accounts.note_gid(gid);
        let account = self
            .accounts
            .user(uid)
            .cloned()
            .ok_or_else(|| Error::Execute(format!("uid {} has no host account", uid)))?;

        let chdir_to = abspath(Path::new(&self.expand(&self.cfg.exec_chdir.clone())?));

        // the program sees exactly JAILBASE, PWD, USER, HOME, PATH, LANG
        // plus whatever NAME=value pairs preceded it
        let mut envmap: BTreeMap<String, String> = BTreeMap::new();
        envmap.insert(
            "JAILBASE".to_string(),
            self.cfg.jailbase.to_string_lossy().into_owned(),
        );
        envmap.insert("PWD".to_string(), chdir_to.to_string_lossy().into_owned());
        envmap.insert("USER".to_string(), account.name.clone());
        envmap.insert(
            "HOME".to_string(),
            account.dir.to_string_lossy().into_owned(),
        );
        let roots = if self.cfg.test {
            vec![jailmount.clone(), jailhome]
        } else {
            vec![jailmount.clone()]
        };
        envmap.insert("PATH".to_string(), jail_search_path(&roots));
        if let Ok(lang) = env::var("LANG") {
            envmap.insert("LANG".to_string(), lang);
        }

        // NAME=value before the program adjusts the environment; a value
        // of `*` copies the invoking value and an empty value removes
        let mut expanded = Vec::with_capacity(args.len());
        for arg in args {
            expanded.push(self.expand(arg)?);
        }
        let (env_args, program_args) = partition_args(&expanded);
        for (name, value) in env_args {
            let value = if value == "*" {
                env::var(&name).unwrap_or_default()
            } else {
                value
            };
            if value.is_empty() {
                envmap.remove(&name);
            } else {
                envmap.insert(name, value);
            }
        }
        if program_args.is_empty() {
            return Err(Error::Execute("no program given".to_string()));
        }

        if self.cfg.test {
            let env: Vec<String> = envmap.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
            println!(
                "chroot {} env -i {} {}",
                jailmount.display(),
                env.join(" "),
                program_args.join(" ")
            );
            return Ok(());
        }

        // the point of no return
        chroot(&jailmount)
            .map_err(|e| Error::Execute(format!("chroot {}: {}", jailmount.display(), e)))?;
        chdir(&chdir_to)
            .map_err(|e| Error::Execute(format!("chdir {}: {}", chdir_to.display(), e)))?;
        umask(Mode::from_bits_truncate(self.cfg.exec_umask));
        setgroups(&[Gid::from_raw(gid)])
            .map_err(|e| Error::Execute(format!("setgroups: {}", e)))?;
        setgid(Gid::from_raw(gid)).map_err(|e| Error::Execute(format!("setgid {}: {}", gid, e)))?;
        setuid(Uid::from_raw(uid)).map_err(|e| Error::Execute(format!("setuid {}: {}", uid, e)))?;

        let program = cstr(&program_args[0])?;
        let argv: Vec<CString> = program_args
            .iter()
            .map(|a| cstr(a))
            .collect::<Result<_>>()?;
        let envp: Vec<CString> = envmap
            .iter()
            .map(|(k, v)| cstr(&format!("{}={}", k, v)))
            .collect::<Result<_>>()?;
        match execve(&program, &argv, &envp) {
            Ok(never) => match never {},
            Err(e) => Err(Error::Execute(format!("exec {}: {}", program_args[0], e))),
        }
    }
}

fn cstr(s: &str) -> Result<CString> {
    CString::new(s).map_err(|_| Error::Execute(format!("argument contains NUL: {:?}", s)))
}

/// Split `NAME=value` environment overrides off the front of the
/// argument list.
fn partition_args(args: &[String]) -> (Vec<(String, String)>, Vec<String>) {
    let mut env = Vec::new();
    let mut rest = Vec::new();
    for arg in args {
        if rest.is_empty() {
            if let Some((name, value)) = arg.split_once('=') {
                if is_env_name(name) {
                    env.push((name.to_string(), value.to_string()));
                    continue;
                }
            }
        }
        rest.push(arg.clone());
    }
    (env, rest)
}

fn is_env_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Keep the host PATH entries that exist inside the jail.
fn jail_search_path(roots: &[std::path::PathBuf]) -> String {
    let host_path = env::var("PATH").unwrap_or_default();
    let kept: Vec<&str> = host_path
        .split(':')
        .filter(|dir| {
            let rel = dir.trim_start_matches('/');
            !dir.is_empty() && roots.iter().any(|root| root.join(rel).is_dir())
        })
        .collect();
    kept.join(":")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_partition_args() {
        let args = strings(&["RUST_LOG=debug", "TERM=*", "./run", "A=1"]);
        let (env, rest) = partition_args(&args);
        assert_eq!(
            env,
            vec![
                ("RUST_LOG".to_string(), "debug".to_string()),
                ("TERM".to_string(), "*".to_string())
            ]
        );
        // an `=` after the program is an argument, not an override
        assert_eq!(rest, strings(&["./run", "A=1"]));
    }

    #[test]
    fn test_partition_args_no_env() {
        let (env, rest) = partition_args(&strings(&["/bin/true"]));
        assert!(env.is_empty());
        assert_eq!(rest, strings(&["/bin/true"]));
    }

    #[test]
    fn test_is_env_name() {
        assert!(is_env_name("PATH"));
        assert!(is_env_name("_X2"));
        assert!(is_env_name("MixedCase"));
        assert!(!is_env_name("2X"));
        assert!(!is_env_name(""));
        assert!(!is_env_name("A-B"));
    }

    #[test]
    fn test_jail_search_path() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("usr/bin")).unwrap();
        let old = env::var("PATH").ok();
        env::set_var("PATH", "/usr/bin:/opt/missing");
        let kept = jail_search_path(&[tmp.path().to_path_buf()]);
        if let Some(old) = old {
            env::set_var("PATH", old);
        }
        assert_eq!(kept, "/usr/bin");
    }
}
