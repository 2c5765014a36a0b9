//! Jail configuration: identity, path layout, run options and bind
//! directives. The property bag handed to each step is rebuilt from here.

use std::env;
use std::path::{Path, PathBuf};

use nix::unistd::{Gid, Group, Uid, User};
use regex::Regex;

use crate::accounts;
use crate::defaults;
use crate::error::{Error, Result};
use crate::policy::WritePolicy;
use crate::props::PropertyBag;

const DEFAULT_JAILBASE: &str = "/var/jails";
const DEFAULT_VALIDNAME: &str = r"^[a-z_][-a-z0-9_.]*\$?$";

/// A registered bind directive, kept unexpanded until `--mount` runs.
#[derive(Debug, Clone)]
pub struct Bind {
    pub srcpath: String,
    pub bindopts: String,
    pub path: String,
}

#[derive(Debug)]
pub struct JailConfig {
    pub user: Option<String>,
    pub group: Option<String>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    /// Root of all jails on this host ($JAILBASE).
    pub jailbase: PathBuf,
    /// Override for the mount point base ($JAILMOUNT); defaults to the
    /// jail user's home directory.
    mountbase: Option<PathBuf>,
    validname: Regex,
    writepath: WritePolicy,
    writepath_explicit: bool,
    pub verbose: bool,
    pub test: bool,
    pub help: bool,
    pub lazy: bool,
    pub dns: bool,
    pub passwd: bool,
    pub defaults: bool,
    pub etc: bool,
    pub exec_umask: u32,
    pub exec_chdir: String,
    pub exec_chuid: Option<String>,
    pub binds: Vec<Bind>,
}

impl JailConfig {
    pub fn new() -> Result<Self> {
        let jailbase = env::var_os("JAILBASE")
            .map(|v| abspath(Path::new(&v)))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_JAILBASE));
        let mountbase = env::var_os("JAILMOUNT").map(|v| abspath(Path::new(&v)));
        Self::with_layout(jailbase, mountbase)
    }

    pub fn with_layout(jailbase: PathBuf, mountbase: Option<PathBuf>) -> Result<Self> {
        let writepath = WritePolicy::new(&format!("^{}(/|$)", regex::escape(
            &jailbase.to_string_lossy(),
        )))?;
        Ok(Self {
            user: None,
            group: None,
            uid: None,
            gid: None,
            jailbase,
            mountbase,
            validname: Regex::new(DEFAULT_VALIDNAME)?,
            writepath,
            writepath_explicit: false,
            verbose: false,
            test: false,
            help: false,
            lazy: false,
            dns: false,
            passwd: false,
            defaults: false,
            etc: false,
            exec_umask: 0o037,
            exec_chdir: "/".to_string(),
            exec_chuid: None,
            binds: vec![Bind {
                srcpath: "{jailhome}".to_string(),
                bindopts: "auto".to_string(),
                path: "/".to_string(),
            }],
        })
    }

    /// Bind the jail identity from a `user[:group]` spec. Names need not
    /// be host accounts; numeric ids are picked up where they are.
    pub fn set_namespec(&mut self, spec: &str) -> Result<()> {
        let (user, group) = accounts::split_spec(spec);
        let user = user.ok_or_else(|| Error::InvalidName(spec.to_string()))?;
        self.check_name(user)?;
        if let Some(g) = group {
            self.check_name(g)?;
        }
        self.user = Some(user.to_string());
        self.group = group.map(String::from);

        if let Ok(Some(u)) = User::from_name(user) {
            self.uid = Some(u.uid.as_raw());
            if self.group.is_none() {
                self.gid = Some(u.gid.as_raw());
            }
        }
        if let Some(g) = &self.group {
            if let Ok(Some(g)) = Group::from_name(g) {
                self.gid = Some(g.gid.as_raw());
            }
        }
        if self.uid == Some(0) || self.gid == Some(0) {
            return Err(Error::Config("jail UID or GID may not be 0".to_string()));
        }
        if self.group.is_none() {
            self.group = match self.gid {
                Some(gid) => Group::from_gid(Gid::from_raw(gid))
                    .ok()
                    .flatten()
                    .map(|g| g.name),
                None => None,
            }
            .or_else(|| Some(user.to_string()));
        }
        self.refresh_writepath();
        Ok(())
    }

    fn check_name(&self, name: &str) -> Result<()> {
        if self.validname.is_match(name) {
            Ok(())
        } else {
            Err(Error::InvalidName(name.to_string()))
        }
    }

    pub fn set_validname(&mut self, pattern: &str) -> Result<()> {
        self.validname = Regex::new(pattern)?;
        Ok(())
    }

    pub fn set_writepath(&mut self, pattern: &str) -> Result<()> {
        self.writepath = WritePolicy::new(pattern)?;
        self.writepath_explicit = true;
        Ok(())
    }

    pub fn writepath(&self) -> &WritePolicy {
        &self.writepath
    }

    /// Unless set explicitly, writepath covers the jail base and, once the
    /// user is known, the mount point.
    fn refresh_writepath(&mut self) {
        if self.writepath_explicit {
            return;
        }
        let base = regex::escape(&self.jailbase.to_string_lossy());
        let pattern = match self.jailmount() {
            Ok(mount) => format!(
                "^({}|{})(/|$)",
                base,
                regex::escape(&mount.to_string_lossy())
            ),
            Err(_) => format!("^{}(/|$)", base),
        };
        if let Ok(policy) = WritePolicy::new(&pattern) {
            self.writepath = policy;
        }
    }

    /// Register a `--bind` directive.
    pub fn bind(&mut self, srcpath: String, bindopts: Option<String>, path: Option<String>) {
        let path = path.unwrap_or_else(|| srcpath.clone());
        self.binds.push(Bind {
            srcpath,
            bindopts: bindopts.unwrap_or_else(|| "auto".to_string()),
            path,
        });
    }

    fn user_name(&self) -> Result<&str> {
        self.user
            .as_deref()
            .ok_or_else(|| Error::Config("jail user not set".to_string()))
    }

    /// `{jailbase}/{user}` - the private filesystem backing store.
    pub fn jailpriv(&self) -> Result<PathBuf> {
        Ok(self.jailbase.join(self.user_name()?))
    }

    /// `{jailpriv}/home` - the populated tree that gets mounted.
    pub fn jailhome(&self) -> Result<PathBuf> {
        Ok(self.jailpriv()?.join("home"))
    }

    /// The live mount point, typically the jail user's home directory.
    pub fn jailmount(&self) -> Result<PathBuf> {
        let user = self.user_name()?;
        if let Some(base) = &self.mountbase {
            return Ok(base.join(user));
        }
        self.userhome()
    }

    pub fn jaildev(&self) -> Result<PathBuf> {
        Ok(self.jailhome()?.join("dev"))
    }

    pub fn jailtmp(&self) -> Result<PathBuf> {
        Ok(self.jailhome()?.join("tmp"))
    }

    /// Host home directory of the jail user.
    pub fn userhome(&self) -> Result<PathBuf> {
        let user = self.user_name()?;
        let uid = self
            .uid
            .ok_or_else(|| Error::Config(format!("{:?} is not a system account", user)))?;
        User::from_uid(Uid::from_raw(uid))
            .ok()
            .flatten()
            .map(|u| u.dir)
            .ok_or_else(|| Error::Config(format!("{:?} is not a system account", user)))
    }

    /// Snapshot the interpolation namespace. Properties whose
    /// prerequisites are unset are simply absent.
    pub fn props(&self) -> PropertyBag {
        let mut bag = PropertyBag::new();
        bag.set("jailbase", self.jailbase.to_string_lossy());
        bag.set("writepath", self.writepath.pattern());
        bag.set("defaults_text", defaults::DEFAULTS_TEXT);
        bag.set("etc_text", defaults::ETC_TEXT);
        if let Some(user) = &self.user {
            bag.set("user", user.as_str());
        }
        if let Some(group) = &self.group {
            bag.set("group", group.as_str());
        }
        if let Some(uid) = self.uid {
            bag.set("uid", uid.to_string());
        }
        if let Some(gid) = self.gid {
            bag.set("gid", gid.to_string());
        }
        for (name, value) in [
            ("jailpriv", self.jailpriv()),
            ("jailhome", self.jailhome()),
            ("jailmount", self.jailmount()),
            ("jaildev", self.jaildev()),
            ("jailtmp", self.jailtmp()),
            ("userhome", self.userhome()),
        ] {
            if let Ok(path) = value {
                bag.set(name, path.to_string_lossy());
            }
        }
        bag
    }
}

/// Lexically absolutize a path: prepend the current directory when
/// relative, then resolve `.` and `..` components without touching the
/// filesystem.
pub fn abspath(path: &Path) -> PathBuf {
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("/"))
            .join(path)
    };
    let mut out = PathBuf::from("/");
    for comp in joined.components() {
        match comp {
            std::path::Component::RootDir | std::path::Component::Prefix(_) => {}
            std::path::Component::CurDir => {}
            std::path::Component::ParentDir => {
                out.pop();
            }
            std::path::Component::Normal(part) => out.push(part),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> JailConfig {
        JailConfig::with_layout(PathBuf::from("/var/jails"), Some(PathBuf::from("/mnt/jails")))
            .unwrap()
    }

    #[test]
    fn test_layout() {
        let mut cfg = cfg();
        cfg.set_namespec("alice").unwrap();
        assert_eq!(cfg.jailpriv().unwrap(), Path::new("/var/jails/alice"));
        assert_eq!(cfg.jailhome().unwrap(), Path::new("/var/jails/alice/home"));
        assert_eq!(cfg.jailmount().unwrap(), Path::new("/mnt/jails/alice"));
        assert_eq!(
            cfg.jaildev().unwrap(),
            Path::new("/var/jails/alice/home/dev")
        );
        assert_eq!(
            cfg.jailtmp().unwrap(),
            Path::new("/var/jails/alice/home/tmp")
        );
    }

    #[test]
    fn test_namespec_group_defaults_to_user() {
        let mut cfg = cfg();
        cfg.set_namespec("alice").unwrap();
        assert_eq!(cfg.user.as_deref(), Some("alice"));
        assert_eq!(cfg.group.as_deref(), Some("alice"));
    }

    #[test]
    fn test_namespec_explicit_group() {
        let mut cfg = cfg();
        cfg.set_namespec("alice:web").unwrap();
        assert_eq!(cfg.group.as_deref(), Some("web"));
    }

    #[test]
    fn test_namespec_rejects_bad_names() {
        let mut cfg = cfg();
        assert!(cfg.set_namespec("Alice").is_err());
        assert!(cfg.set_namespec("al ice").is_err());
        assert!(cfg.set_namespec("alice:We b").is_err());
        assert!(cfg.set_namespec("").is_err());
    }

    #[test]
    fn test_namespec_rejects_root() {
        let mut cfg = cfg();
        assert!(cfg.set_namespec("root").is_err());
    }

    #[test]
    fn test_writepath_follows_identity() {
        let mut cfg = cfg();
        assert!(cfg.writepath().allows(Path::new("/var/jails/x")));
        assert!(!cfg.writepath().allows(Path::new("/mnt/jails/alice")));
        cfg.set_namespec("alice").unwrap();
        assert!(cfg.writepath().allows(Path::new("/mnt/jails/alice/tmp")));
        assert!(!cfg.writepath().allows(Path::new("/etc/hack")));
    }

    #[test]
    fn test_explicit_writepath_sticks() {
        let mut cfg = cfg();
        cfg.set_writepath("^/tmp/").unwrap();
        cfg.set_namespec("alice").unwrap();
        assert_eq!(cfg.writepath().pattern(), "^/tmp/");
    }

    #[test]
    fn test_props_before_and_after_identity() {
        let mut cfg = cfg();
        assert!(cfg.props().get("jailhome").is_err());
        cfg.set_namespec("alice").unwrap();
        let props = cfg.props();
        assert_eq!(props.get("jailhome").unwrap(), "/var/jails/alice/home");
        assert_eq!(
            props.expand("{jailbase}|{user}").unwrap(),
            "/var/jails|alice"
        );
    }

    #[test]
    fn test_abspath() {
        assert_eq!(abspath(Path::new("/a/b/../c/./d")), Path::new("/a/c/d"));
        assert_eq!(abspath(Path::new("/..")), Path::new("/"));
        assert_eq!(abspath(Path::new("//")), Path::new("/"));
        assert!(abspath(Path::new("rel")).is_absolute());
    }
}
