//! The add engine: mirror paths into the jail together with their
//! shared-object closures. Composes the clone primitives and the
//! dependency resolver; no new mutation machinery.

use std::path::{Path, PathBuf};

use crate::config::abspath;
use crate::error::Result;
use crate::fsops::{self, Kind, Meta};
use crate::resolver::Resolver;
use crate::sequencer::Jail;

impl Jail {
    pub(crate) fn step_add(&mut self, paths: &[String]) -> Result<()> {
        for path in paths {
            let src = self.source_path(path)?;
            self.add_path(&src, false, false)?;
        }
        Ok(())
    }

    /// Relative names resolve against `srcdir`; only the relative portion
    /// is mirrored into the jail.
    pub(crate) fn step_add_from(&mut self, srcdir: &str, files: &[String]) -> Result<()> {
        let dir = self.source_path(srcdir)?;
        for name in files {
            let name = self.expand(name)?;
            let src = abspath(&dir.join(&name));
            let dst = self.jailhome_dir()?.join(name.trim_start_matches('/'));
            self.add_path_to(&src, Some(&dst), false, false)?;
        }
        Ok(())
    }

    pub(crate) fn step_add_recurse(&mut self, quick: bool, paths: &[String]) -> Result<()> {
        for path in paths {
            let src = self.source_path(path)?;
            self.add_path(&src, true, quick)?;
        }
        Ok(())
    }

    /// Mirror one source path at its own absolute location beneath the
    /// jail home. Each source is visited at most once per run.
    pub(crate) fn add_path(&mut self, src: &Path, recurse: bool, quick: bool) -> Result<()> {
        if !self.src_done.insert(src.to_path_buf()) {
            return Ok(());
        }
        self.add_path_to(src, None, recurse, quick)
    }

    /// The add body. ELF files pull in their dependency closure, symlinks
    /// pull in their targets, and ancestor directories come along as
    /// metadata clones.
    fn add_path_to(
        &mut self,
        src: &Path,
        dst: Option<&Path>,
        recurse: bool,
        quick: bool,
    ) -> Result<()> {
        if dst.is_none() {
            if let Some(parent) = src.parent() {
                if !parent.as_os_str().is_empty() && parent != Path::new("/") {
                    self.add_path(parent, false, false)?;
                }
            }
        }

        let srcmeta = Meta::require(src)?;
        let jailhome = self.jailhome_dir()?;
        let gate = self.gate();
        let dst = match dst {
            Some(dst) => dst.to_path_buf(),
            None => mirror(&jailhome, src),
        };
        let dstmeta = Meta::lstat(&dst)?;
        let same = dstmeta.as_ref().is_some_and(|d| d.same_shape(&srcmeta));

        if srcmeta.kind == Kind::Regular && Resolver::is_elf(src) {
            if self.cfg.dns && !self.dns_added {
                self.dns_added = true;
                let libs = self.resolver.dns_libraries(&gate)?;
                for lib in libs {
                    self.add_path(&lib, false, false)?;
                }
            }
            let deps = self.resolver.dependencies(&gate, src)?;
            for dep in deps {
                self.add_path(&dep, false, false)?;
            }
        }

        match srcmeta.kind {
            Kind::Directory => {
                if !same {
                    fsops::clone_path(&gate, &mut self.accounts, src, &dst)?;
                }
                if recurse && !(quick && same) {
                    for name in fsops::dir_entries(src)? {
                        self.add_path_to(&src.join(&name), Some(&dst.join(&name)), recurse, quick)?;
                    }
                }
            }
            Kind::Symlink => {
                fsops::clone_path(&gate, &mut self.accounts, src, &dst)?;
                // a broken link still mirrors; a live one adds its target
                if let Ok(target) = src.canonicalize() {
                    self.add_path(&target, recurse, quick)?;
                }
            }
            _ => {
                if !same {
                    fsops::clone_path(&gate, &mut self.accounts, src, &dst)?;
                }
            }
        }
        Ok(())
    }

    /// The jail home, created on first use the way the add engine found
    /// the host root.
    fn jailhome_dir(&mut self) -> Result<PathBuf> {
        let jailhome = self.cfg.jailhome()?;
        if Meta::lstat(&jailhome)?.is_none() {
            let gate = self.gate();
            let root = Meta::require(Path::new("/"))?;
            fsops::mkdir_all(&gate, &jailhome, root.perm, Some(root.uid), Some(root.gid))?;
        }
        Ok(jailhome)
    }
}

/// The mirrored location of an absolute host path beneath the jail home.
fn mirror(jailhome: &Path, src: &Path) -> PathBuf {
    match src.strip_prefix("/") {
        Ok(rel) => jailhome.join(rel),
        Err(_) => jailhome.join(src),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mirror() {
        let jailhome = Path::new("/var/jails/c/home");
        assert_eq!(
            mirror(jailhome, Path::new("/bin/true")),
            Path::new("/var/jails/c/home/bin/true")
        );
        assert_eq!(
            mirror(jailhome, Path::new("/")),
            Path::new("/var/jails/c/home")
        );
    }
}
