//! Rebuild the jail's `/etc/passwd` and `/etc/group` from the accounts
//! seen during the build, so name lookups inside the jail resolve for
//! exactly the identities that own its files.

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use nix::unistd::{Group, User};

use crate::accounts::parse_num;
use crate::error::{Error, Result};
use crate::fsops::{self, Meta};
use crate::policy::Gate;
use crate::sequencer::Jail;

impl Jail {
    /// Honors `--passwd`. Runs once, at end of run or before `--execute`;
    /// a jail home that was never created is left alone.
    pub(crate) fn update_passwd(&mut self) -> Result<()> {
        if self.passwd_updated {
            return Ok(());
        }
        let jailhome = self.cfg.jailhome()?;
        if Meta::lstat(&jailhome)?.is_none() {
            return Ok(());
        }
        self.passwd_updated = true;

        let gate = self.gate();
        fsops::clone_path(&gate, &mut self.accounts, Path::new("/etc"), &jailhome.join("etc"))?;

        let passwd_path = jailhome.join("etc/passwd");
        let group_path = jailhome.join("etc/group");

        // identities already present in the jail survive the rewrite
        if let Ok(text) = fs::read_to_string(&passwd_path) {
            for line in text.lines() {
                let parts: Vec<&str> = line.split(':').collect();
                if parts.len() == 7 {
                    if let Some(uid) = parse_num(parts[2]) {
                        self.accounts.note_uid(uid as u32);
                    }
                }
            }
        }
        if let Ok(text) = fs::read_to_string(&group_path) {
            for line in text.lines() {
                let parts: Vec<&str> = line.split(':').collect();
                if parts.len() == 4 {
                    if let Some(gid) = parse_num(parts[2]) {
                        self.accounts.note_gid(gid as u32);
                    }
                }
            }
        }

        let mut known_users = BTreeSet::new();
        let mut passwd_text = String::new();
        for user in self.accounts.users() {
            known_users.insert(user.name.clone());
            passwd_text.push_str(&passwd_line(user));
        }
        let mut group_text = String::new();
        for group in self.accounts.groups() {
            group_text.push_str(&group_line(group, &known_users));
        }

        write_jail_file(&gate, &passwd_path, &passwd_text, Path::new("/etc/passwd"))?;
        write_jail_file(&gate, &group_path, &group_text, Path::new("/etc/group"))
    }
}

fn passwd_line(user: &User) -> String {
    format!(
        "{}:{}:{}:{}:{}:{}:{}\n",
        user.name,
        if user.passwd.as_bytes().is_empty() { "" } else { "*" },
        user.uid.as_raw(),
        user.gid.as_raw(),
        user.gecos.to_string_lossy(),
        user.dir.display(),
        user.shell.display()
    )
}

fn group_line(group: &Group, known_users: &BTreeSet<String>) -> String {
    let members: Vec<&str> = group
        .mem
        .iter()
        .filter(|m| known_users.contains(*m))
        .map(|m| m.as_str())
        .collect();
    format!(
        "{}:{}:{}:{}\n",
        group.name,
        if group.passwd.as_bytes().is_empty() { "" } else { "*" },
        group.gid.as_raw(),
        members.join(",")
    )
}

/// Write a generated file into the jail, carrying the host template's
/// permission bits and ownership over.
fn write_jail_file(gate: &Gate, dst: &Path, text: &str, template: &Path) -> Result<()> {
    let cmd = format!("cat > {} <<_EOT_\n{}_EOT_", dst.display(), text);
    if !gate.mutate(dst, &cmd)? {
        fs::write(dst, text).map_err(|e| Error::File {
            op: "write",
            path: dst.to_path_buf(),
            source: e,
        })?;
    }
    let meta = Meta::require(template)?;
    fsops::chmod(gate, dst, meta.perm)?;
    fsops::chown(gate, dst, Some(meta.uid), Some(meta.gid))
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::{getgid, getuid};

    #[test]
    fn test_passwd_line_for_current_user() {
        let user = User::from_uid(getuid()).unwrap().unwrap();
        let line = passwd_line(&user);
        let parts: Vec<&str> = line.trim_end().split(':').collect();
        assert_eq!(parts.len(), 7);
        assert_eq!(parts[0], user.name);
        assert_eq!(parts[2], user.uid.as_raw().to_string());
    }

    #[test]
    fn test_group_line_filters_members() {
        let group = Group::from_gid(getgid()).unwrap().unwrap();
        let line = group_line(&group, &BTreeSet::new());
        let parts: Vec<&str> = line.trim_end().split(':').collect();
        assert_eq!(parts.len(), 4);
        // no known users means no members survive
        assert_eq!(parts[3], "");
    }
}
