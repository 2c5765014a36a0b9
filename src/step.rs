//! Build steps: one tagged record per command verb.

use std::fmt;

/// A queued command. Payload strings are kept raw: property interpolation
/// happens when the step runs, not when it is parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// `--print [FMT]` - print an interpolated string, or list properties
    Print(Option<String>),
    /// `--try` - ignore failure of the next step
    Try,
    /// `--mount` - mount the jail home and all bind directives
    Mount,
    /// `--umount` - unmount everything at or below the jail mount point
    Umount,
    /// `--clean` - empty the private store
    Clean,
    /// `--remove` - unmount and delete the private store
    Remove,
    /// `--tmp` - create the jail /tmp
    Tmp,
    /// `--dev` - create the jail /dev and its device nodes
    Dev,
    /// `--add PATH...` - mirror paths and their library closures into the jail
    Add { paths: Vec<String> },
    /// `--add-from DIR FILE...` - add files resolved against a directory
    AddFrom { srcdir: String, files: Vec<String> },
    /// `--add-recurse [--quick] PATH...` - add with directory recursion
    AddRecurse { quick: bool, paths: Vec<String> },
    /// `--clone SRC DST` - faithful copy of one node
    Clone { src: String, dst: String },
    /// `--clone-recurse [--quick] SRC DST` - faithful copy of a tree
    CloneRecurse {
        quick: bool,
        src: String,
        dst: String,
    },
    /// `--clone-from SRC DST FILE...` - clone named entries between directories
    CloneFrom {
        src: String,
        dst: String,
        files: Vec<String>,
    },
    /// `--mkdir DST [MODE [OWNER]]`
    Mkdir {
        dst: String,
        mode: Option<String>,
        owner: Option<String>,
    },
    /// `--mknod DST c|b MAJOR [MINOR]`
    Mknod {
        dst: String,
        devtype: String,
        major: String,
        minor: Option<String>,
    },
    /// `--ln-s TARGET LINK`
    LnS { target: String, link: String },
    /// `--chflags DST FLAGS`
    Chflags { dst: String, flags: String },
    /// `--chmod DST MODE`
    Chmod { dst: String, mode: String },
    /// `--chown DST USER [GROUP]`
    Chown {
        dst: String,
        user: String,
        group: Option<String>,
    },
    /// `--touch DST [STAMP]`
    Touch { dst: String, stamp: Option<String> },
    /// `--rm DST`
    Rm { dst: String },
    /// `--rmdir DST`
    Rmdir { dst: String },
    /// `--execute [NAME=VALUE...] PROGRAM [ARGS...]` - the terminal step
    Execute { args: Vec<String> },
}

impl Step {
    /// The command-line verb this step was enqueued by.
    pub fn name(&self) -> &'static str {
        match self {
            Step::Print(_) => "--print",
            Step::Try => "--try",
            Step::Mount => "--mount",
            Step::Umount => "--umount",
            Step::Clean => "--clean",
            Step::Remove => "--remove",
            Step::Tmp => "--tmp",
            Step::Dev => "--dev",
            Step::Add { .. } => "--add",
            Step::AddFrom { .. } => "--add-from",
            Step::AddRecurse { .. } => "--add-recurse",
            Step::Clone { .. } => "--clone",
            Step::CloneRecurse { .. } => "--clone-recurse",
            Step::CloneFrom { .. } => "--clone-from",
            Step::Mkdir { .. } => "--mkdir",
            Step::Mknod { .. } => "--mknod",
            Step::LnS { .. } => "--ln-s",
            Step::Chflags { .. } => "--chflags",
            Step::Chmod { .. } => "--chmod",
            Step::Chown { .. } => "--chown",
            Step::Touch { .. } => "--touch",
            Step::Rm { .. } => "--rm",
            Step::Rmdir { .. } => "--rmdir",
            Step::Execute { .. } => "--execute",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())?;
        let join = |items: &[String]| items.join(" ");
        match self {
            Step::Print(Some(s)) => write!(f, " {}", s),
            Step::Add { paths } | Step::Execute { args: paths } => write!(f, " {}", join(paths)),
            Step::AddFrom { srcdir, files } => write!(f, " {} {}", srcdir, join(files)),
            Step::AddRecurse { quick, paths } => {
                if *quick {
                    write!(f, " --quick")?;
                }
                write!(f, " {}", join(paths))
            }
            Step::Clone { src, dst } => write!(f, " {} {}", src, dst),
            Step::CloneRecurse { quick, src, dst } => {
                if *quick {
                    write!(f, " --quick")?;
                }
                write!(f, " {} {}", src, dst)
            }
            Step::CloneFrom { src, dst, files } => {
                write!(f, " {} {}", src, dst)?;
                if !files.is_empty() {
                    write!(f, " {}", join(files))?;
                }
                Ok(())
            }
            Step::Mkdir { dst, mode, owner } => {
                write!(f, " {}", dst)?;
                if let Some(m) = mode {
                    write!(f, " {}", m)?;
                }
                if let Some(o) = owner {
                    write!(f, " {}", o)?;
                }
                Ok(())
            }
            Step::Mknod {
                dst,
                devtype,
                major,
                minor,
            } => {
                write!(f, " {} {} {}", dst, devtype, major)?;
                if let Some(m) = minor {
                    write!(f, " {}", m)?;
                }
                Ok(())
            }
            Step::LnS { target, link } => write!(f, " {} {}", target, link),
            Step::Chflags { dst, flags } => write!(f, " {} {}", dst, flags),
            Step::Chmod { dst, mode } => write!(f, " {} {}", dst, mode),
            Step::Chown { dst, user, group } => {
                write!(f, " {} {}", dst, user)?;
                if let Some(g) = group {
                    write!(f, " {}", g)?;
                }
                Ok(())
            }
            Step::Touch { dst, stamp } => {
                write!(f, " {}", dst)?;
                if let Some(s) = stamp {
                    write!(f, " {}", s)?;
                }
                Ok(())
            }
            Step::Rm { dst } | Step::Rmdir { dst } => write!(f, " {}", dst),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names() {
        assert_eq!(Step::Mount.name(), "--mount");
        assert_eq!(
            Step::Add {
                paths: vec!["/bin/true".into()]
            }
            .name(),
            "--add"
        );
        assert_eq!(
            Step::LnS {
                target: "a".into(),
                link: "b".into()
            }
            .name(),
            "--ln-s"
        );
    }

    #[test]
    fn test_display() {
        let step = Step::Mkdir {
            dst: "/var/empty".into(),
            mode: Some("0755".into()),
            owner: Some("alice:alice".into()),
        };
        assert_eq!(step.to_string(), "--mkdir /var/empty 0755 alice:alice");

        let step = Step::AddRecurse {
            quick: true,
            paths: vec!["/usr/share".into()],
        };
        assert_eq!(step.to_string(), "--add-recurse --quick /usr/share");
    }
}
