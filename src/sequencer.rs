//! The command sequencer: runs the ordered step list against one jail.
//!
//! Each step is atomic from the sequencer's point of view. A failure
//! aborts the run, unless the previous step was `--try` (log and carry
//! on) or test mode is active (print `# error` and carry on).

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::accounts::{self, Accounts};
use crate::config::{abspath, JailConfig};
use crate::defaults;
use crate::error::{Error, Result};
use crate::fsops::{self, Kind, Meta};
use crate::policy::Gate;
use crate::resolver::Resolver;
use crate::step::Step;

pub struct Jail {
    pub cfg: JailConfig,
    pub resolver: Resolver,
    pub(crate) accounts: Accounts,
    pub(crate) src_done: HashSet<PathBuf>,
    pub(crate) dns_added: bool,
    pub(crate) mounted: bool,
    pub(crate) passwd_updated: bool,
    try_pending: u8,
}

impl Jail {
    pub fn new() -> Result<Self> {
        Self::with_config(JailConfig::new()?)
    }

    pub fn with_config(cfg: JailConfig) -> Result<Self> {
        Ok(Self {
            cfg,
            resolver: Resolver::new()?,
            accounts: Accounts::new(),
            src_done: HashSet::new(),
            dns_added: false,
            mounted: false,
            passwd_updated: false,
            try_pending: 0,
        })
    }

    pub(crate) fn gate(&self) -> Gate {
        Gate {
            policy: self.cfg.writepath().clone(),
            test: self.cfg.test,
            verbose: self.cfg.verbose,
        }
    }

    /// Interpolate `{name}` properties with their values as of right now.
    pub fn expand(&self, template: &str) -> Result<String> {
        self.cfg.props().expand(template)
    }

    pub(crate) fn source_path(&self, template: &str) -> Result<PathBuf> {
        Ok(abspath(Path::new(&self.expand(template)?)))
    }

    /// Destinations are expanded the same way; the write policy is
    /// enforced by the gate when the mutation happens.
    pub(crate) fn dest_path(&self, template: &str) -> Result<PathBuf> {
        self.source_path(template)
    }

    /// Run the queued steps in order.
    pub fn run(&mut self, steps: &[Step]) -> Result<()> {
        for step in steps {
            if self.try_pending > 0 {
                self.try_pending -= 1;
            }
            self.gate().trace(&step.to_string());
            match self.exec_step(step) {
                Ok(()) => {}
                Err(err) => {
                    let err = Error::Step {
                        step: step.name(),
                        source: Box::new(err),
                    };
                    if self.try_pending > 0 {
                        self.gate().trace(&format!("--try {}", err));
                    } else if self.cfg.test {
                        println!("# {}", err);
                    } else {
                        return Err(err);
                    }
                }
            }
        }
        self.finish()
    }

    /// End-of-run work: the deferred passwd update.
    fn finish(&mut self) -> Result<()> {
        if self.cfg.passwd {
            self.update_passwd().map_err(|e| Error::Step {
                step: "--passwd",
                source: Box::new(e),
            })?;
        }
        Ok(())
    }

    fn exec_step(&mut self, step: &Step) -> Result<()> {
        match step {
            Step::Try => {
                // covers exactly the next step: decremented once before
                // that step runs, checked after it fails
                self.try_pending = 2;
                Ok(())
            }
            Step::Print(fmt) => self.step_print(fmt.as_deref()),
            Step::Mount => self.step_mount(),
            Step::Umount => self.step_umount(),
            Step::Clean => self.step_clean(),
            Step::Remove => self.step_remove(),
            Step::Tmp => self.step_tmp(),
            Step::Dev => self.step_dev(),
            Step::Add { paths } => self.step_add(paths),
            Step::AddFrom { srcdir, files } => self.step_add_from(srcdir, files),
            Step::AddRecurse { quick, paths } => self.step_add_recurse(*quick, paths),
            Step::Clone { src, dst } => {
                let src = self.source_path(src)?;
                let dst = self.dest_path(dst)?;
                fsops::clone_path(&self.gate(), &mut self.accounts, &src, &dst)
            }
            Step::CloneRecurse { quick, src, dst } => {
                let src = self.source_path(src)?;
                let dst = self.dest_path(dst)?;
                fsops::clone_recurse(&self.gate(), &mut self.accounts, &src, &dst, *quick)
            }
            Step::CloneFrom { src, dst, files } => {
                let src = self.source_path(src)?;
                let dst = self.dest_path(dst)?;
                let mut names = Vec::with_capacity(files.len());
                for file in files {
                    names.push(self.expand(file)?);
                }
                fsops::clone_from(&self.gate(), &mut self.accounts, &src, &dst, &names)
            }
            Step::Mkdir { dst, mode, owner } => self.step_mkdir(dst, mode.as_deref(), owner.as_deref()),
            Step::Mknod {
                dst,
                devtype,
                major,
                minor,
            } => self.step_mknod(dst, devtype, major, minor.as_deref()),
            Step::LnS { target, link } => {
                let target = self.expand(target)?;
                let link = self.dest_path(link)?;
                fsops::symlink(&self.gate(), &target, &link)
            }
            Step::Chflags { dst, flags } => {
                let dst = self.dest_path(dst)?;
                let flags = parse_num_arg(&self.expand(flags)?)?;
                fsops::chflags(&self.gate(), &dst, flags)
            }
            Step::Chmod { dst, mode } => {
                let dst = self.dest_path(dst)?;
                let mode = parse_num_arg(&self.expand(mode)?)? as u32;
                fsops::chmod(&self.gate(), &dst, mode & 0o7777)
            }
            Step::Chown { dst, user, group } => self.step_chown(dst, user, group.as_deref()),
            Step::Touch { dst, stamp } => {
                let dst = self.dest_path(dst)?;
                fsops::touch(&self.gate(), &dst, stamp.as_deref())
            }
            Step::Rm { dst } => {
                let dst = self.dest_path(dst)?;
                fsops::rm(&self.gate(), &dst)
            }
            Step::Rmdir { dst } => {
                let dst = self.dest_path(dst)?;
                fsops::rmdir(&self.gate(), &dst)
            }
            Step::Execute { args } => self.step_execute(args),
        }
    }

    fn step_print(&self, fmt: Option<&str>) -> Result<()> {
        let props = self.cfg.props();
        match fmt {
            Some(fmt) => println!("{}", props.expand(fmt)?),
            None => {
                for name in props.names() {
                    println!("{} = {:?}", name, props.get(name).unwrap_or_default());
                }
            }
        }
        Ok(())
    }

    fn step_mkdir(&mut self, dst: &str, mode: Option<&str>, owner: Option<&str>) -> Result<()> {
        let dst = self.dest_path(dst)?;
        let mode = match mode {
            Some(m) => parse_num_arg(&self.expand(m)?)? as u32 & 0o7777,
            None => 0o750,
        };
        let (mut uid, mut gid) = (None, None);
        if let Some(spec) = owner {
            let spec = self.expand(spec)?;
            let (user, group) = accounts::split_spec(&spec);
            let (u, g) = accounts::resolve_spec(user, group);
            uid = u;
            gid = g;
        }
        let uid = uid.or(self.cfg.uid);
        let gid = gid.or(self.cfg.gid);
        if let Some(uid) = uid {
            self.accounts.note_uid(uid);
        }
        if let Some(gid) = gid {
            self.accounts.note_gid(gid);
        }
        fsops::mkdir(&self.gate(), &dst, mode, uid, gid)
    }

    fn step_mknod(
        &mut self,
        dst: &str,
        devtype: &str,
        major: &str,
        minor: Option<&str>,
    ) -> Result<()> {
        let dst = self.dest_path(dst)?;
        let kind = match devtype {
            "c" => Kind::CharDev,
            "b" => Kind::BlockDev,
            _ => return Err(Error::Config("devtype must be c or b".to_string())),
        };
        let major = parse_num_arg(&self.expand(major)?)?;
        let dev = match minor {
            // a lone major is a packed device number
            None => major,
            Some(minor) => {
                let minor = parse_num_arg(&self.expand(minor)?)?;
                nix::sys::stat::makedev(major, minor)
            }
        };
        fsops::mknod(&self.gate(), &dst, kind, dev, 0o666)
    }

    fn step_chown(&mut self, dst: &str, user: &str, group: Option<&str>) -> Result<()> {
        let dst = self.dest_path(dst)?;
        let spec = self.expand(user)?;
        let (user, mut group_tok) = accounts::split_spec(&spec);
        let expanded_group;
        if let Some(g) = group {
            expanded_group = self.expand(g)?;
            group_tok = Some(&expanded_group);
        }
        // a missing group is left unchanged, not defaulted
        let (uid, _) = accounts::resolve_spec(user, Some(""));
        let gid = group_tok.and_then(accounts::lookup_group).map(|g| g.gid.as_raw());
        if let Some(uid) = uid {
            self.accounts.note_uid(uid);
        }
        if let Some(gid) = gid {
            self.accounts.note_gid(gid);
        }
        fsops::chown(&self.gate(), &dst, uid, gid)
    }

    /// `--tmp`: the jail /tmp, cloned from the host's.
    fn step_tmp(&mut self) -> Result<()> {
        let jailtmp = self.cfg.jailtmp()?;
        fsops::clone_path(&self.gate(), &mut self.accounts, Path::new("/tmp"), &jailtmp)
    }

    /// `--dev`: the jail /dev with its canonical device nodes.
    fn step_dev(&mut self) -> Result<()> {
        let jaildev = self.cfg.jaildev()?;
        let gate = self.gate();
        fsops::clone_path(&gate, &mut self.accounts, Path::new("/dev"), &jaildev)?;
        for (name, major, minor) in defaults::DEV_NODES {
            let dev = nix::sys::stat::makedev(*major as u64, *minor as u64);
            fsops::mknod(&gate, &jaildev.join(name), Kind::CharDev, dev, 0o666)?;
        }
        Ok(())
    }

    /// `--clean`: empty the private store without removing it.
    fn step_clean(&mut self) -> Result<()> {
        let gate = self.gate();
        let jailpriv = self.cfg.jailpriv()?;
        if Meta::lstat(&jailpriv)?.is_none() {
            return Ok(());
        }
        for name in fsops::dir_entries(&jailpriv)? {
            fsops::remove_tree(&gate, &jailpriv.join(&name))?;
        }
        Ok(())
    }

    /// `--remove`: unmount and delete the private store.
    fn step_remove(&mut self) -> Result<()> {
        self.step_umount()?;
        let gate = self.gate();
        fsops::remove_tree(&gate, &self.cfg.jailpriv()?)
    }
}

fn parse_num_arg(s: &str) -> Result<u64> {
    accounts::parse_num(s).ok_or_else(|| Error::Config(format!("bad number {:?}", s)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::JailConfig;
    use std::fs;

    fn jail(tmp: &Path) -> Jail {
        let cfg = JailConfig::with_layout(tmp.join("base"), Some(tmp.join("mnt"))).unwrap();
        let mut jail = Jail::with_config(cfg).unwrap();
        jail.cfg.set_namespec("alice").unwrap();
        jail
    }

    fn mkdir_step(dst: &str, mode: &str) -> Step {
        Step::Mkdir {
            dst: dst.to_string(),
            mode: Some(mode.to_string()),
            owner: None,
        }
    }

    #[test]
    fn test_run_creates_and_interpolates() {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir(tmp.path().join("base")).unwrap();
        let mut jail = jail(tmp.path());
        let steps = [
            mkdir_step("{jailpriv}", "0750"),
            mkdir_step("{jailhome}", "0755"),
            mkdir_step("{jailhome}/etc", "0755"),
        ];
        jail.run(&steps).unwrap();
        let etc = tmp.path().join("base/alice/home/etc");
        assert_eq!(Meta::require(&etc).unwrap().perm, 0o755);
    }

    #[test]
    fn test_policy_violation_aborts() {
        let tmp = tempfile::tempdir().unwrap();
        let mut jail = jail(tmp.path());
        let err = jail.run(&[mkdir_step("/etc/hack", "0755")]).unwrap_err();
        let text = err.to_string();
        assert!(text.contains("--mkdir"));
        assert!(text.contains("policy: /etc/hack outside writepath"));
        assert!(!Path::new("/etc/hack").exists());
    }

    #[test]
    fn test_try_suppresses_exactly_one_failure() {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir(tmp.path().join("base")).unwrap();
        let mut jail1 = jail(tmp.path());
        let steps = [
            Step::Try,
            mkdir_step("/etc/hack", "0755"),
            mkdir_step("{jailpriv}", "0750"),
        ];
        jail1.run(&steps).unwrap();
        assert!(tmp.path().join("base/alice").is_dir());

        // the shield does not extend to a second failure
        let mut jail = jail(tmp.path());
        let steps = [
            Step::Try,
            mkdir_step("/etc/hack", "0755"),
            mkdir_step("/etc/hack2", "0755"),
        ];
        assert!(jail.run(&steps).is_err());
    }

    #[test]
    fn test_try_covers_interpolation_failures() {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir(tmp.path().join("base")).unwrap();
        let mut jail = jail(tmp.path());
        let steps = [
            Step::Try,
            mkdir_step("{no_such_prop}", "0750"),
            mkdir_step("{jailpriv}", "0750"),
        ];
        jail.run(&steps).unwrap();
        assert!(tmp.path().join("base/alice").is_dir());
    }

    #[test]
    fn test_test_mode_mutates_nothing_and_succeeds() {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir(tmp.path().join("base")).unwrap();
        let mut jail = jail(tmp.path());
        jail.cfg.test = true;
        let steps = [
            mkdir_step("{jailpriv}", "0750"),
            // failures in test mode print and continue
            mkdir_step("/etc/hack", "0755"),
        ];
        jail.run(&steps).unwrap();
        assert!(!tmp.path().join("base/alice").exists());
    }

    #[test]
    fn test_clone_step() {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir(tmp.path().join("base")).unwrap();
        let src = tmp.path().join("base/hosts");
        fs::write(&src, b"127.0.0.1 localhost\n").unwrap();
        let mut jail = jail(tmp.path());
        let steps = [
            mkdir_step("{jailpriv}", "0750"),
            mkdir_step("{jailhome}", "0755"),
            mkdir_step("{jailhome}/etc", "0755"),
            Step::Clone {
                src: src.display().to_string(),
                dst: "{jailhome}/etc/hosts".to_string(),
            },
        ];
        jail.run(&steps).unwrap();
        assert_eq!(
            fs::read(tmp.path().join("base/alice/home/etc/hosts")).unwrap(),
            b"127.0.0.1 localhost\n"
        );
    }

    #[test]
    fn test_mkdir_defaults_to_0750() {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir(tmp.path().join("base")).unwrap();
        let mut jail = jail(tmp.path());
        let steps = [Step::Mkdir {
            dst: "{jailpriv}".to_string(),
            mode: None,
            owner: None,
        }];
        jail.run(&steps).unwrap();
        assert_eq!(
            Meta::require(&tmp.path().join("base/alice")).unwrap().perm,
            0o750
        );
    }

    #[test]
    fn test_clean_scoped_to_jailpriv() {
        let tmp = tempfile::tempdir().unwrap();
        let jailpriv = tmp.path().join("base/alice");
        fs::create_dir_all(jailpriv.join("home/etc")).unwrap();
        fs::write(jailpriv.join("home/etc/passwd"), b"x").unwrap();
        let mut jail = jail(tmp.path());
        jail.run(&[Step::Clean]).unwrap();
        assert!(jailpriv.exists());
        assert!(!jailpriv.join("home").exists());
    }

    #[test]
    fn test_rm_and_touch_steps() {
        let tmp = tempfile::tempdir().unwrap();
        let jailpriv = tmp.path().join("base/alice");
        fs::create_dir_all(&jailpriv).unwrap();
        fs::write(jailpriv.join("f"), b"x").unwrap();
        let mut jail = jail(tmp.path());
        let steps = [
            Step::Touch {
                dst: "{jailpriv}/f".to_string(),
                stamp: Some("202001020304.05".to_string()),
            },
            Step::Rm {
                dst: "{jailpriv}/f".to_string(),
            },
        ];
        jail.run(&steps).unwrap();
        assert!(!jailpriv.join("f").exists());
    }

    #[test]
    fn test_unknown_property_fails_step() {
        let tmp = tempfile::tempdir().unwrap();
        let mut jail = jail(tmp.path());
        let err = jail.run(&[mkdir_step("{bogus}", "0750")]).unwrap_err();
        assert!(err.to_string().contains("'bogus'"));
    }

    #[test]
    fn test_add_places_dependency_closure() {
        // cloning the host / and /tmp ancestry needs root ownership
        if !nix::unistd::geteuid().is_root() {
            eprintln!("skipped: requires root");
            return;
        }
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir(tmp.path().join("base")).unwrap();
        let mut jail = jail(tmp.path());

        use std::os::unix::fs::PermissionsExt;
        let loader = tmp.path().join("ld-stub.so.2");
        fs::write(&loader, b"\x7fELF loader").unwrap();
        fs::set_permissions(&loader, fs::Permissions::from_mode(0o755)).unwrap();
        let lib = tmp.path().join("libstub.so.6");
        fs::write(&lib, b"\x7fELF lib").unwrap();
        let prog = tmp.path().join("prog");
        fs::write(&prog, b"\x7fELF prog").unwrap();
        fs::set_permissions(&prog, fs::Permissions::from_mode(0o755)).unwrap();

        jail.resolver.set_ldconfig_cmd(&format!(
            "/bin/echo ld-linux-x86-64.so.2 (libc6,x86-64) => {}",
            loader.display()
        ));
        jail.resolver.set_ldlist_cmd(&format!(
            "/bin/echo libstub.so.6 => {} (0x00007f0000000000)",
            lib.display()
        ));

        jail.run(&[Step::Add {
            paths: vec![prog.display().to_string()],
        }])
        .unwrap();

        let jailhome = tmp.path().join("base/alice/home");
        let mirror = |p: &Path| jailhome.join(p.strip_prefix("/").unwrap());
        assert_eq!(fs::read(mirror(&prog)).unwrap(), b"\x7fELF prog");
        assert_eq!(fs::read(mirror(&lib)).unwrap(), b"\x7fELF lib");
        // the loader itself is part of every closure
        assert!(mirror(&loader.canonicalize().unwrap()).exists());
    }
}
