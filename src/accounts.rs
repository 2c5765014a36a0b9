//! Host account lookups, and the set of identities seen during a build.
//!
//! Every uid and gid that passes through a clone, mkdir, chown or execute
//! is recorded here; `--passwd` later rewrites the jail's passwd and group
//! files from this set.

use std::collections::BTreeMap;

use nix::unistd::{Gid, Group, Uid, User};

/// Identities observed while building, keyed by numeric id. Ids without a
/// host account are tolerated: files may belong to accounts that only
/// exist inside some other jail.
#[derive(Debug, Default)]
pub struct Accounts {
    users: BTreeMap<u32, User>,
    groups: BTreeMap<u32, Group>,
}

impl Accounts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn note_uid(&mut self, uid: u32) {
        if self.users.contains_key(&uid) {
            return;
        }
        if let Ok(Some(user)) = User::from_uid(Uid::from_raw(uid)) {
            let gid = user.gid.as_raw();
            self.users.insert(uid, user);
            self.note_gid(gid);
        }
    }

    pub fn note_gid(&mut self, gid: u32) {
        if self.groups.contains_key(&gid) {
            return;
        }
        if let Ok(Some(group)) = Group::from_gid(Gid::from_raw(gid)) {
            self.groups.insert(gid, group);
        }
    }

    pub fn user(&self, uid: u32) -> Option<&User> {
        self.users.get(&uid)
    }

    /// Users in uid order.
    pub fn users(&self) -> impl Iterator<Item = &User> {
        self.users.values()
    }

    /// Groups in gid order.
    pub fn groups(&self) -> impl Iterator<Item = &Group> {
        self.groups.values()
    }
}

/// Accept `0x`/`0o` prefixes and a leading `0` as octal, like strtol(3)
/// with base 0.
pub fn parse_num(s: &str) -> Option<u64> {
    let s = s.trim();
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).ok()
    } else if let Some(oct) = s.strip_prefix("0o") {
        u64::from_str_radix(oct, 8).ok()
    } else if s.len() > 1 && s.starts_with('0') {
        u64::from_str_radix(&s[1..], 8).ok()
    } else {
        s.parse().ok()
    }
}

/// Find a host user by name or numeric uid token.
pub fn lookup_user(token: &str) -> Option<User> {
    if let Ok(Some(user)) = User::from_name(token) {
        return Some(user);
    }
    parse_num(token).and_then(|uid| User::from_uid(Uid::from_raw(uid as u32)).ok().flatten())
}

/// Find a host group by name or numeric gid token.
pub fn lookup_group(token: &str) -> Option<Group> {
    if let Ok(Some(group)) = Group::from_name(token) {
        return Some(group);
    }
    parse_num(token).and_then(|gid| Group::from_gid(Gid::from_raw(gid as u32)).ok().flatten())
}

/// Resolve a `user[:group]` pair against the host. A missing group falls
/// back to the user's primary group; tokens that resolve to nothing yield
/// None so the caller can apply its own default.
pub fn resolve_spec(user: Option<&str>, group: Option<&str>) -> (Option<u32>, Option<u32>) {
    let mut uid = None;
    let mut gid = None;
    if let Some(name) = user.filter(|s| !s.is_empty()) {
        if let Some(u) = lookup_user(name) {
            uid = Some(u.uid.as_raw());
            if group.is_none() {
                gid = Some(u.gid.as_raw());
            }
        }
    }
    if let Some(name) = group.filter(|s| !s.is_empty()) {
        if let Some(g) = lookup_group(name) {
            gid = Some(g.gid.as_raw());
        }
    }
    (uid, gid)
}

/// Split a `user[:group]` spec into its parts. Empty parts become None.
pub fn split_spec(spec: &str) -> (Option<&str>, Option<&str>) {
    match spec.split_once(':') {
        Some((u, g)) => (
            Some(u).filter(|s| !s.is_empty()),
            Some(g).filter(|s| !s.is_empty()),
        ),
        None => (Some(spec).filter(|s| !s.is_empty()), None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::{getgid, getuid};

    #[test]
    fn test_parse_num() {
        assert_eq!(parse_num("0755"), Some(0o755));
        assert_eq!(parse_num("0"), Some(0));
        assert_eq!(parse_num("1777"), Some(1777));
        assert_eq!(parse_num("0x1f"), Some(31));
        assert_eq!(parse_num("bogus"), None);
    }

    #[test]
    fn test_split_spec() {
        assert_eq!(split_spec("alice:staff"), (Some("alice"), Some("staff")));
        assert_eq!(split_spec("alice"), (Some("alice"), None));
        assert_eq!(split_spec(":staff"), (None, Some("staff")));
        assert_eq!(split_spec(""), (None, None));
    }

    #[test]
    fn test_note_current_identity() {
        let mut acct = Accounts::new();
        let uid = getuid().as_raw();
        acct.note_uid(uid);
        let user = acct.user(uid).expect("current uid has an account");
        assert_eq!(user.uid.as_raw(), uid);
        // the user's primary group was pulled in as well
        assert!(acct.groups().any(|g| g.gid == user.gid));
    }

    #[test]
    fn test_resolve_spec_numeric() {
        let uid = getuid().as_raw();
        let gid = getgid().as_raw();
        let (u, g) = resolve_spec(Some(&uid.to_string()), Some(&gid.to_string()));
        assert_eq!(u, Some(uid));
        assert_eq!(g, Some(gid));
    }

    #[test]
    fn test_resolve_spec_unknown() {
        let (u, g) = resolve_spec(Some("no-such-user-here"), None);
        assert_eq!(u, None);
        assert_eq!(g, None);
    }
}
