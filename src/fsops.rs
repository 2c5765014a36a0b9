//! Faithful file cloning and the mutation primitives behind the build
//! steps. Every mutation is routed through the [`Gate`] so the write-path
//! policy applies and test mode prints shell equivalents instead of
//! issuing syscalls.

use std::ffi::CString;
use std::fs;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use chrono::{Local, NaiveDateTime, TimeZone};
use nix::errno::Errno;
use nix::sys::stat::{self, major, minor, Mode, SFlag};
use nix::unistd;

use crate::accounts::Accounts;
use crate::error::{Error, Result};
use crate::policy::Gate;

/// File type drawn from an lstat result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Regular,
    Directory,
    Symlink,
    CharDev,
    BlockDev,
    Fifo,
    Socket,
}

impl Kind {
    fn from_mode(mode: u32) -> Kind {
        match mode & libc::S_IFMT {
            libc::S_IFDIR => Kind::Directory,
            libc::S_IFLNK => Kind::Symlink,
            libc::S_IFCHR => Kind::CharDev,
            libc::S_IFBLK => Kind::BlockDev,
            libc::S_IFIFO => Kind::Fifo,
            libc::S_IFSOCK => Kind::Socket,
            _ => Kind::Regular,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Kind::Regular => "file",
            Kind::Directory => "dir",
            Kind::Symlink => "link",
            Kind::CharDev => "chrdev",
            Kind::BlockDev => "blkdev",
            Kind::Fifo => "fifo",
            Kind::Socket => "sock",
        }
    }
}

/// The attributes read from a clone source and projected onto its
/// destination.
#[derive(Debug, Clone)]
pub struct Meta {
    pub kind: Kind,
    pub perm: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: i64,
    /// (seconds, nanoseconds)
    pub mtime: (i64, i64),
    pub rdev: u64,
}

impl Meta {
    /// lstat without following symlinks; Ok(None) when the path is missing.
    pub fn lstat(path: &Path) -> Result<Option<Meta>> {
        match stat::lstat(path) {
            Ok(st) => Ok(Some(Meta {
                kind: Kind::from_mode(st.st_mode as u32),
                perm: (st.st_mode as u32) & 0o7777,
                uid: st.st_uid,
                gid: st.st_gid,
                size: st.st_size,
                mtime: (st.st_mtime, st.st_mtime_nsec),
                rdev: st.st_rdev,
            })),
            Err(Errno::ENOENT) | Err(Errno::ENOTDIR) => Ok(None),
            Err(e) => Err(sys("lstat", path, e)),
        }
    }

    pub fn require(path: &Path) -> Result<Meta> {
        Self::lstat(path)?.ok_or_else(|| Error::NotFound(path.to_path_buf()))
    }

    /// Matching size and whole-second mtime: good enough to treat a
    /// mirrored node as unchanged.
    pub fn same_shape(&self, other: &Meta) -> bool {
        self.kind == other.kind && self.size == other.size && self.mtime.0 == other.mtime.0
    }
}

fn sys(op: &'static str, path: &Path, errno: Errno) -> Error {
    Error::Sys {
        op,
        path: path.to_path_buf(),
        errno,
    }
}

fn file_err(op: &'static str, path: &Path, source: std::io::Error) -> Error {
    Error::File {
        op,
        path: path.to_path_buf(),
        source,
    }
}

fn cstring(path: &Path) -> Result<CString> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| Error::Config(format!("path contains NUL: {}", path.display())))
}

fn chmod_raw(path: &Path, perm: u32) -> Result<()> {
    let c = cstring(path)?;
    if unsafe { libc::chmod(c.as_ptr(), perm as libc::mode_t) } != 0 {
        return Err(sys("chmod", path, Errno::last()));
    }
    Ok(())
}

/// lchown(2); None leaves the id unchanged.
fn lchown_raw(path: &Path, uid: Option<u32>, gid: Option<u32>) -> Result<()> {
    let c = cstring(path)?;
    let uid = uid.unwrap_or(u32::MAX) as libc::uid_t;
    let gid = gid.unwrap_or(u32::MAX) as libc::gid_t;
    if unsafe { libc::lchown(c.as_ptr(), uid, gid) } != 0 {
        return Err(sys("chown", path, Errno::last()));
    }
    Ok(())
}

/// Set atime and mtime without following symlinks.
fn lutimes_raw(path: &Path, mtime: (i64, i64)) -> Result<()> {
    let c = cstring(path)?;
    let ts = libc::timespec {
        tv_sec: mtime.0,
        tv_nsec: mtime.1,
    };
    let times = [ts, ts];
    if unsafe {
        libc::utimensat(
            libc::AT_FDCWD,
            c.as_ptr(),
            times.as_ptr(),
            libc::AT_SYMLINK_NOFOLLOW,
        )
    } != 0
    {
        return Err(sys("touch", path, Errno::last()));
    }
    Ok(())
}

/// File flags are a BSD feature; elsewhere this quietly succeeds.
#[cfg(any(target_os = "freebsd", target_os = "macos"))]
fn chflags_raw(path: &Path, flags: u64) -> Result<()> {
    let c = cstring(path)?;
    if unsafe { libc::lchflags(c.as_ptr(), flags as libc::c_ulong) } != 0 {
        return Err(sys("chflags", path, Errno::last()));
    }
    Ok(())
}

#[cfg(not(any(target_os = "freebsd", target_os = "macos")))]
fn chflags_raw(_path: &Path, _flags: u64) -> Result<()> {
    Ok(())
}

fn expect_kind(path: &Path, meta: Option<&Meta>, kind: Kind) -> Result<()> {
    match meta {
        Some(m) if m.kind != kind => Err(Error::TypeMismatch {
            path: path.to_path_buf(),
            expected: kind.as_str(),
            found: m.kind.as_str(),
        }),
        _ => Ok(()),
    }
}

/// Create a directory; succeeds if it already exists, re-applying the
/// permission bits and ownership either way.
pub fn mkdir(
    gate: &Gate,
    dst: &Path,
    perm: u32,
    uid: Option<u32>,
    gid: Option<u32>,
) -> Result<()> {
    let existing = Meta::lstat(dst)?;
    expect_kind(dst, existing.as_ref(), Kind::Directory)?;
    if gate.mutate(dst, &format!("mkdir -m {:o} {}", perm, dst.display()))? {
        return Ok(());
    }
    if existing.is_none() {
        unistd::mkdir(dst, Mode::from_bits_truncate(perm)).map_err(|e| sys("mkdir", dst, e))?;
    }
    chmod_raw(dst, perm)?;
    if uid.is_some() || gid.is_some() {
        lchown_raw(dst, uid, gid)?;
    }
    Ok(())
}

/// mkdir every missing ancestor, then the path itself. Existing
/// directories are left untouched.
pub fn mkdir_all(
    gate: &Gate,
    path: &Path,
    perm: u32,
    uid: Option<u32>,
    gid: Option<u32>,
) -> Result<()> {
    match Meta::lstat(path)? {
        Some(m) => return expect_kind(path, Some(&m), Kind::Directory),
        None => {}
    }
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            mkdir_all(gate, parent, perm, uid, gid)?;
        }
    }
    mkdir(gate, path, perm, uid, gid)
}

/// Create a device node. An existing node must have the same type and
/// device number.
pub fn mknod(gate: &Gate, dst: &Path, kind: Kind, dev: u64, perm: u32) -> Result<()> {
    let devtype = match kind {
        Kind::CharDev => 'c',
        Kind::BlockDev => 'b',
        _ => return Err(Error::Config("devtype must be c or b".to_string())),
    };
    let existing = Meta::lstat(dst)?;
    expect_kind(dst, existing.as_ref(), kind)?;
    if let Some(m) = &existing {
        if m.rdev != dev {
            return Err(Error::Unexpected {
                path: dst.to_path_buf(),
                detail: format!(
                    "expected device {} {}.{}, found {}.{}",
                    devtype,
                    major(dev),
                    minor(dev),
                    major(m.rdev),
                    minor(m.rdev)
                ),
            });
        }
    }
    let cmd = format!(
        "mknod -m {:o} {} {} {} {}",
        perm,
        dst.display(),
        devtype,
        major(dev),
        minor(dev)
    );
    if gate.mutate(dst, &cmd)? {
        return Ok(());
    }
    if existing.is_none() {
        let sflag = match kind {
            Kind::CharDev => SFlag::S_IFCHR,
            _ => SFlag::S_IFBLK,
        };
        stat::mknod(dst, sflag, Mode::from_bits_truncate(perm), dev as libc::dev_t)
            .map_err(|e| sys("mknod", dst, e))?;
    }
    chmod_raw(dst, perm)
}

/// Create a symlink. An existing link must already point at `target`.
pub fn symlink(gate: &Gate, target: &str, link: &Path) -> Result<()> {
    let existing = Meta::lstat(link)?;
    expect_kind(link, existing.as_ref(), Kind::Symlink)?;
    if existing.is_some() {
        let found = fs::read_link(link).map_err(|e| file_err("readlink", link, e))?;
        if found != Path::new(target) {
            return Err(Error::Unexpected {
                path: link.to_path_buf(),
                detail: format!(
                    "expected symlink to {:?}, found {:?}",
                    target,
                    found.display()
                ),
            });
        }
    }
    if gate.mutate(link, &format!("ln -s {} {}", target, link.display()))? {
        return Ok(());
    }
    if existing.is_none() {
        std::os::unix::fs::symlink(target, link).map_err(|e| file_err("symlink", link, e))?;
    }
    Ok(())
}

pub fn chmod(gate: &Gate, dst: &Path, perm: u32) -> Result<()> {
    if gate.mutate(dst, &format!("chmod {:o} {}", perm, dst.display()))? {
        return Ok(());
    }
    Meta::require(dst)?;
    chmod_raw(dst, perm)
}

pub fn chown(gate: &Gate, dst: &Path, uid: Option<u32>, gid: Option<u32>) -> Result<()> {
    let cmd = format!(
        "chown {}:{} {}",
        uid.map(|u| u.to_string()).unwrap_or_default(),
        gid.map(|g| g.to_string()).unwrap_or_default(),
        dst.display()
    );
    if gate.mutate(dst, &cmd)? {
        return Ok(());
    }
    Meta::require(dst)?;
    lchown_raw(dst, uid, gid)
}

pub fn chflags(gate: &Gate, dst: &Path, flags: u64) -> Result<()> {
    if gate.mutate(dst, &format!("chflags {:o} {}", flags, dst.display()))? {
        return Ok(());
    }
    Meta::require(dst)?;
    chflags_raw(dst, flags)
}

/// Parse a `%Y%m%d%H%M.%S` stamp in local time into epoch seconds.
pub fn parse_stamp(stamp: &str) -> Result<i64> {
    let dt = NaiveDateTime::parse_from_str(stamp, "%Y%m%d%H%M.%S")
        .map_err(|e| Error::Config(format!("bad timestamp {:?}: {}", stamp, e)))?;
    dt.and_local_timezone(Local)
        .earliest()
        .map(|t| t.timestamp())
        .ok_or_else(|| Error::Config(format!("ambiguous timestamp {:?}", stamp)))
}

fn format_stamp(secs: i64) -> String {
    Local
        .timestamp_opt(secs, 0)
        .earliest()
        .map(|t| t.format("%Y%m%d%H%M.%S").to_string())
        .unwrap_or_else(|| secs.to_string())
}

/// Set the modification time; the target must exist. `stamp` defaults to
/// now.
pub fn touch(gate: &Gate, dst: &Path, stamp: Option<&str>) -> Result<()> {
    let secs = match stamp {
        Some(s) => parse_stamp(s)?,
        None => Local::now().timestamp(),
    };
    let cmd = format!("touch -m -t {} {}", format_stamp(secs), dst.display());
    if gate.mutate(dst, &cmd)? {
        return Ok(());
    }
    Meta::require(dst)?;
    lutimes_raw(dst, (secs, 0))
}

/// Remove a file or symlink; missing targets are fine.
pub fn rm(gate: &Gate, dst: &Path) -> Result<()> {
    if Meta::lstat(dst)?.is_none() {
        return Ok(());
    }
    if gate.mutate(dst, &format!("rm -f {}", dst.display()))? {
        return Ok(());
    }
    unistd::unlink(dst).map_err(|e| sys("rm", dst, e))
}

/// Remove an empty directory; missing targets are fine.
pub fn rmdir(gate: &Gate, dst: &Path) -> Result<()> {
    if Meta::lstat(dst)?.is_none() {
        return Ok(());
    }
    if gate.mutate(dst, &format!("rmdir {}", dst.display()))? {
        return Ok(());
    }
    fs::remove_dir(dst).map_err(|e| file_err("rmdir", dst, e))
}

/// Delete a whole tree. Announced once at the root; the policy is still
/// checked for every node inside.
pub fn remove_tree(gate: &Gate, path: &Path) -> Result<()> {
    if Meta::lstat(path)?.is_none() {
        return Ok(());
    }
    if gate.mutate(path, &format!("rm -rf {}", path.display()))? {
        return Ok(());
    }
    remove_tree_quiet(gate, path)
}

fn remove_tree_quiet(gate: &Gate, path: &Path) -> Result<()> {
    gate.policy.check(path)?;
    let Some(meta) = Meta::lstat(path)? else {
        return Ok(());
    };
    if meta.kind == Kind::Directory {
        for entry in fs::read_dir(path).map_err(|e| file_err("readdir", path, e))? {
            let entry = entry.map_err(|e| file_err("readdir", path, e))?;
            remove_tree_quiet(gate, &entry.path())?;
        }
        fs::remove_dir(path).map_err(|e| file_err("rmdir", path, e))
    } else {
        fs::remove_file(path).map_err(|e| file_err("rm", path, e))
    }
}

/// Clone `src` onto `dst`: same type, content, permission bits,
/// ownership and mtime. Symlinks are copied, not followed. Missing
/// parent directories are cloned from the corresponding source
/// ancestors.
pub fn clone_path(gate: &Gate, acct: &mut Accounts, src: &Path, dst: &Path) -> Result<()> {
    let srcmeta = Meta::require(src)?;
    if src == dst {
        gate.trace(&format!("clone: {} onto itself", src.display()));
        return Ok(());
    }
    clone_parents(gate, acct, src, dst)?;
    if !clone_meta(gate, acct, src, &srcmeta, dst)? {
        gate.trace(&format!(
            "skipped {} {}",
            srcmeta.kind.as_str(),
            src.display()
        ));
    }
    Ok(())
}

/// Walk up the destination ancestry, cloning each missing directory from
/// the matching source ancestor. When the source ancestry runs out the
/// root directory's metadata is used.
fn clone_parents(gate: &Gate, acct: &mut Accounts, src: &Path, dst: &Path) -> Result<()> {
    let Some(dstdir) = dst.parent() else {
        return Ok(());
    };
    if dstdir.as_os_str().is_empty() || Meta::lstat(dstdir)?.is_some() {
        return Ok(());
    }
    let srcdir = src.parent().filter(|p| !p.as_os_str().is_empty());
    let srcdir = srcdir.unwrap_or_else(|| Path::new("/"));
    clone_parents(gate, acct, srcdir, dstdir)?;
    let meta = Meta::require(srcdir)?;
    clone_meta(gate, acct, srcdir, &meta, dstdir)?;
    Ok(())
}

/// The typed clone body. Returns false for kinds that cannot be cloned
/// (fifos, sockets).
fn clone_meta(
    gate: &Gate,
    acct: &mut Accounts,
    src: &Path,
    srcmeta: &Meta,
    dst: &Path,
) -> Result<bool> {
    acct.note_uid(srcmeta.uid);
    acct.note_gid(srcmeta.gid);
    let dstmeta = Meta::lstat(dst)?;
    expect_kind(dst, dstmeta.as_ref(), srcmeta.kind)?;

    match srcmeta.kind {
        Kind::Regular => {
            if gate.mutate(dst, &format!("cp -p {} {}", src.display(), dst.display()))? {
                return Ok(true);
            }
            fs::copy(src, dst).map_err(|e| file_err("cp", dst, e))?;
        }
        Kind::Directory => {
            if gate.mutate(dst, &format!("mkdir -m {:o} {}", srcmeta.perm, dst.display()))? {
                return Ok(true);
            }
            if dstmeta.is_none() {
                unistd::mkdir(dst, Mode::from_bits_truncate(srcmeta.perm))
                    .map_err(|e| sys("mkdir", dst, e))?;
            }
        }
        Kind::Symlink => {
            let target = fs::read_link(src).map_err(|e| file_err("readlink", src, e))?;
            if dstmeta.is_some() {
                let found = fs::read_link(dst).map_err(|e| file_err("readlink", dst, e))?;
                if found != target {
                    return Err(Error::Unexpected {
                        path: dst.to_path_buf(),
                        detail: format!(
                            "expected symlink to {:?}, found {:?}",
                            target.display(),
                            found.display()
                        ),
                    });
                }
            }
            let cmd = format!("ln -s {} {}", target.display(), dst.display());
            if gate.mutate(dst, &cmd)? {
                return Ok(true);
            }
            if dstmeta.is_none() {
                std::os::unix::fs::symlink(&target, dst)
                    .map_err(|e| file_err("symlink", dst, e))?;
            }
            lchown_raw(dst, Some(srcmeta.uid), Some(srcmeta.gid))?;
            lutimes_raw(dst, srcmeta.mtime)?;
            return Ok(true);
        }
        Kind::CharDev | Kind::BlockDev => {
            if let Some(d) = &dstmeta {
                if d.rdev != srcmeta.rdev {
                    return Err(Error::Unexpected {
                        path: dst.to_path_buf(),
                        detail: format!("expected device {}, found {}", srcmeta.rdev, d.rdev),
                    });
                }
            }
            let devtype = if srcmeta.kind == Kind::CharDev { 'c' } else { 'b' };
            let cmd = format!(
                "mknod -m {:o} {} {} {} {}",
                srcmeta.perm,
                dst.display(),
                devtype,
                major(srcmeta.rdev),
                minor(srcmeta.rdev)
            );
            if gate.mutate(dst, &cmd)? {
                return Ok(true);
            }
            if dstmeta.is_none() {
                let sflag = if srcmeta.kind == Kind::CharDev {
                    SFlag::S_IFCHR
                } else {
                    SFlag::S_IFBLK
                };
                stat::mknod(
                    dst,
                    sflag,
                    Mode::from_bits_truncate(srcmeta.perm),
                    srcmeta.rdev as libc::dev_t,
                )
                .map_err(|e| sys("mknod", dst, e))?;
            }
        }
        Kind::Fifo | Kind::Socket => return Ok(false),
    }

    chmod_raw(dst, srcmeta.perm)?;
    lchown_raw(dst, Some(srcmeta.uid), Some(srcmeta.gid))?;
    chflags_src(dst, src)?;
    lutimes_raw(dst, srcmeta.mtime)?;
    Ok(true)
}

#[cfg(any(target_os = "freebsd", target_os = "macos"))]
fn chflags_src(dst: &Path, src: &Path) -> Result<()> {
    let st = stat::lstat(src).map_err(|e| sys("lstat", src, e))?;
    chflags_raw(dst, st.st_flags as u64)
}

#[cfg(not(any(target_os = "freebsd", target_os = "macos")))]
fn chflags_src(_dst: &Path, _src: &Path) -> Result<()> {
    Ok(())
}

/// Clone a tree. With `quick`, a directory whose destination already has
/// matching size and mtime is assumed unchanged and skipped wholesale.
pub fn clone_recurse(
    gate: &Gate,
    acct: &mut Accounts,
    src: &Path,
    dst: &Path,
    quick: bool,
) -> Result<()> {
    let srcmeta = Meta::require(src)?;
    let dstmeta = Meta::lstat(dst)?;
    clone_path(gate, acct, src, dst)?;
    if srcmeta.kind != Kind::Directory {
        return Ok(());
    }
    if quick && dstmeta.as_ref().is_some_and(|d| d.same_shape(&srcmeta)) {
        return Ok(());
    }
    for name in dir_entries(src)? {
        clone_recurse(gate, acct, &src.join(&name), &dst.join(&name), quick)?;
    }
    Ok(())
}

/// Clone named entries from one directory to another.
pub fn clone_from(
    gate: &Gate,
    acct: &mut Accounts,
    src: &Path,
    dst: &Path,
    files: &[String],
) -> Result<()> {
    for name in files {
        clone_path(gate, acct, &src.join(name), &dst.join(name))?;
    }
    Ok(())
}

/// Directory entry names, sorted for deterministic ordering.
pub fn dir_entries(path: &Path) -> Result<Vec<std::ffi::OsString>> {
    let mut names = Vec::new();
    for entry in fs::read_dir(path).map_err(|e| file_err("readdir", path, e))? {
        let entry = entry.map_err(|e| file_err("readdir", path, e))?;
        names.push(entry.file_name());
    }
    names.sort();
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::WritePolicy;
    use std::os::unix::fs::PermissionsExt;

    fn open_gate() -> Gate {
        Gate {
            policy: WritePolicy::new(".*").unwrap(),
            test: false,
            verbose: false,
        }
    }

    fn test_gate() -> Gate {
        Gate {
            policy: WritePolicy::new(".*").unwrap(),
            test: true,
            verbose: false,
        }
    }

    #[test]
    fn test_clone_regular_file() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("src.txt");
        let dst = tmp.path().join("out/dst.txt");
        fs::write(&src, b"payload").unwrap();
        fs::set_permissions(&src, fs::Permissions::from_mode(0o640)).unwrap();
        fs::create_dir(tmp.path().join("out")).unwrap();

        let mut acct = Accounts::new();
        clone_path(&open_gate(), &mut acct, &src, &dst).unwrap();

        let got = Meta::require(&dst).unwrap();
        let want = Meta::require(&src).unwrap();
        assert_eq!(got.kind, Kind::Regular);
        assert_eq!(got.perm, 0o640);
        assert_eq!(got.uid, want.uid);
        assert_eq!(got.gid, want.gid);
        assert_eq!(got.mtime.0, want.mtime.0);
        assert_eq!(fs::read(&dst).unwrap(), b"payload");
    }

    #[test]
    fn test_clone_creates_parents_from_source_ancestors() {
        let tmp = tempfile::tempdir().unwrap();
        let srcdir = tmp.path().join("a/b");
        fs::create_dir_all(&srcdir).unwrap();
        fs::set_permissions(&srcdir, fs::Permissions::from_mode(0o700)).unwrap();
        let src = srcdir.join("f");
        fs::write(&src, b"x").unwrap();

        let dst = tmp.path().join("mirror/a/b/f");
        fs::create_dir(tmp.path().join("mirror")).unwrap();
        let mut acct = Accounts::new();
        clone_path(&open_gate(), &mut acct, &src, &dst).unwrap();

        let parent = Meta::require(&tmp.path().join("mirror/a/b")).unwrap();
        assert_eq!(parent.kind, Kind::Directory);
        assert_eq!(parent.perm, 0o700);
        assert!(dst.exists());
    }

    #[test]
    fn test_clone_symlink_not_followed() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("link");
        std::os::unix::fs::symlink("some/target", &src).unwrap();
        let dst = tmp.path().join("link2");

        let mut acct = Accounts::new();
        clone_path(&open_gate(), &mut acct, &src, &dst).unwrap();
        assert_eq!(fs::read_link(&dst).unwrap(), Path::new("some/target"));

        // idempotent for the same target
        clone_path(&open_gate(), &mut acct, &src, &dst).unwrap();

        // a different existing target is an error
        let other = tmp.path().join("other");
        std::os::unix::fs::symlink("elsewhere", &other).unwrap();
        assert!(clone_path(&open_gate(), &mut acct, &src, &other).is_err());
    }

    #[test]
    fn test_clone_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("src");
        let dst = tmp.path().join("dst");
        fs::write(&src, b"same").unwrap();

        let mut acct = Accounts::new();
        clone_path(&open_gate(), &mut acct, &src, &dst).unwrap();
        let first = Meta::require(&dst).unwrap();
        clone_path(&open_gate(), &mut acct, &src, &dst).unwrap();
        let second = Meta::require(&dst).unwrap();
        assert_eq!(first.perm, second.perm);
        assert_eq!(first.mtime.0, second.mtime.0);
        assert_eq!(fs::read(&dst).unwrap(), b"same");
    }

    #[test]
    fn test_clone_type_mismatch() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("src");
        let dst = tmp.path().join("dst");
        fs::write(&src, b"file").unwrap();
        fs::create_dir(&dst).unwrap();

        let mut acct = Accounts::new();
        let err = clone_path(&open_gate(), &mut acct, &src, &dst).unwrap_err();
        assert!(err.to_string().contains("expected file, found dir"));
    }

    #[test]
    fn test_clone_recurse_mirrors_tree() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("tree");
        fs::create_dir_all(src.join("sub")).unwrap();
        fs::write(src.join("top.txt"), b"1").unwrap();
        fs::write(src.join("sub/leaf.txt"), b"22").unwrap();
        std::os::unix::fs::symlink("top.txt", src.join("alias")).unwrap();

        let dst = tmp.path().join("copy");
        let mut acct = Accounts::new();
        clone_recurse(&open_gate(), &mut acct, &src, &dst, false).unwrap();

        assert_eq!(fs::read(dst.join("top.txt")).unwrap(), b"1");
        assert_eq!(fs::read(dst.join("sub/leaf.txt")).unwrap(), b"22");
        assert_eq!(fs::read_link(dst.join("alias")).unwrap(), Path::new("top.txt"));
    }

    #[test]
    fn test_clone_recurse_quick_skips_unchanged() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("tree");
        fs::create_dir(&src).unwrap();
        fs::write(src.join("f"), b"x").unwrap();
        let dst = tmp.path().join("copy");

        let mut acct = Accounts::new();
        clone_recurse(&open_gate(), &mut acct, &src, &dst, false).unwrap();

        // plant a same-size marker, then line the directory shapes up so a
        // quick pass treats the tree as unchanged
        fs::write(dst.join("f"), b"y").unwrap();
        let srcmeta = Meta::require(&src).unwrap();
        lutimes_raw(&dst, srcmeta.mtime).unwrap();
        assert!(Meta::require(&dst).unwrap().same_shape(&srcmeta));

        clone_recurse(&open_gate(), &mut acct, &src, &dst, true).unwrap();
        assert_eq!(fs::read(dst.join("f")).unwrap(), b"y");

        // without quick the marker is overwritten again
        clone_recurse(&open_gate(), &mut acct, &src, &dst, false).unwrap();
        assert_eq!(fs::read(dst.join("f")).unwrap(), b"x");
    }

    #[test]
    fn test_mkdir_idempotent_reapplies_mode() {
        let tmp = tempfile::tempdir().unwrap();
        let dst = tmp.path().join("d");
        mkdir(&open_gate(), &dst, 0o750, None, None).unwrap();
        fs::set_permissions(&dst, fs::Permissions::from_mode(0o700)).unwrap();
        mkdir(&open_gate(), &dst, 0o755, None, None).unwrap();
        assert_eq!(Meta::require(&dst).unwrap().perm, 0o755);
    }

    #[test]
    fn test_mkdir_all() {
        let tmp = tempfile::tempdir().unwrap();
        let dst = tmp.path().join("a/b/c");
        mkdir_all(&open_gate(), &dst, 0o750, None, None).unwrap();
        assert_eq!(Meta::require(&dst).unwrap().perm, 0o750);
        assert_eq!(Meta::require(&tmp.path().join("a")).unwrap().perm, 0o750);
    }

    #[test]
    fn test_symlink_existing_must_match() {
        let tmp = tempfile::tempdir().unwrap();
        let link = tmp.path().join("l");
        symlink(&open_gate(), "target", &link).unwrap();
        symlink(&open_gate(), "target", &link).unwrap();
        assert!(symlink(&open_gate(), "other", &link).is_err());
    }

    #[test]
    fn test_rm_and_rmdir() {
        let tmp = tempfile::tempdir().unwrap();
        let f = tmp.path().join("f");
        fs::write(&f, b"x").unwrap();
        rm(&open_gate(), &f).unwrap();
        assert!(!f.exists());
        rm(&open_gate(), &f).unwrap(); // missing is fine

        let d = tmp.path().join("d");
        fs::create_dir(&d).unwrap();
        rmdir(&open_gate(), &d).unwrap();
        assert!(!d.exists());
    }

    #[test]
    fn test_remove_tree() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("t");
        fs::create_dir_all(root.join("a/b")).unwrap();
        fs::write(root.join("a/b/f"), b"x").unwrap();
        std::os::unix::fs::symlink("a", root.join("l")).unwrap();
        remove_tree(&open_gate(), &root).unwrap();
        assert!(!root.exists());
    }

    #[test]
    fn test_touch_stamp() {
        let tmp = tempfile::tempdir().unwrap();
        let f = tmp.path().join("f");
        fs::write(&f, b"x").unwrap();
        touch(&open_gate(), &f, Some("202001020304.05")).unwrap();
        let meta = Meta::require(&f).unwrap();
        assert_eq!(meta.mtime.0, parse_stamp("202001020304.05").unwrap());
        assert!(touch(&open_gate(), &f, Some("not-a-stamp")).is_err());
        assert!(touch(&open_gate(), &tmp.path().join("missing"), None).is_err());
    }

    #[test]
    fn test_parse_stamp_roundtrip() {
        let secs = parse_stamp("202608021142.33").unwrap();
        assert_eq!(format_stamp(secs), "202608021142.33");
    }

    #[test]
    fn test_test_mode_mutates_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("src");
        fs::write(&src, b"x").unwrap();
        let dst = tmp.path().join("dst");
        let dir = tmp.path().join("dir");

        let gate = test_gate();
        let mut acct = Accounts::new();
        clone_path(&gate, &mut acct, &src, &dst).unwrap();
        mkdir(&gate, &dir, 0o755, None, None).unwrap();
        symlink(&gate, "t", &tmp.path().join("l")).unwrap();
        assert!(!dst.exists());
        assert!(!dir.exists());
        assert!(!tmp.path().join("l").exists());

        // and removals leave the source alone
        rm(&gate, &src).unwrap();
        assert!(src.exists());
    }
}
