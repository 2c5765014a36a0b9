//! Command-line front-end.
//!
//! The surface is an ordered flag stream: option flags take effect where
//! they appear, command flags are enqueued as steps in the order given.
//! `--defaults` and `--etc` splice their curated token sequences into the
//! stream at the point of use, so the sequencer only ever sees plain
//! steps.

use crate::defaults;
use crate::error::{Error, Result};
use crate::sequencer::Jail;
use crate::step::Step;

pub const USAGE: &str = "\
usage: jail [options] user[:group] [commands...]

Builds a chroot jail for one unprivileged user and optionally executes a
program inside it. Commands run in the order given; the first failure
aborts unless preceded by --try.

options:
  -v --verbose          mirror every action to stdout before running it
  -t --test             print shell equivalents instead of running them
  -h --help             show this text and exit
  -d --defaults         enable the default jail contents (--print {defaults_text})
  --etc                 add a minimal /etc file set (--print {etc_text})
  --passwd              rewrite the jail passwd and group files at end of run
  --dns                 add DNS resolver libraries even if nothing links them
  --lazy                detach-style unmounts for --umount
  --umask MASK          process umask for --execute (default 037)
  --chdir PATH          working directory for --execute (default /)
  --chuid USER[:GROUP]  identity for --execute (default the jail user)
  --validname RX        regex accepted as a user or group name
  --writepath RX        regex a path must match to be writable
  --bind SRC [OPTS [PATH]]
                        bind SRC at {jailmount}/PATH when mounting; OPTS
                        defaults to auto, PATH defaults to SRC
  --ldconfig-cmd CMD    command locating the dynamic loader
  --ldconfig-rx RX      regex picking the loader path out of its output
  --ldlist-cmd CMD      dependency listing command ({ldlinux_so}, {path})
  --ldlist-rx RX        regex picking dependency paths out of its output

commands:
  --print [FMT]         print FMT with {properties} expanded, or list them
  --try                 ignore failure of the next command
  --add PATH...         mirror paths and their library closures into the jail
  --add-from DIR FILE...
  --add-recurse [--quick] PATH...
  --clone SRC DST       copy one node with data and metadata
  --clone-recurse [--quick] SRC DST
  --clone-from SRC DST FILE...
  --mkdir DST [MODE [OWNER]]
  --mknod DST c|b MAJOR [MINOR]
  --ln-s TARGET LINK
  --chmod DST MODE
  --chown DST USER[:GROUP]
  --chflags DST FLAGS
  --touch DST [STAMP]   STAMP uses %Y%m%d%H%M.%S
  --rm DST / --rmdir DST
  --tmp / --dev         create the jail /tmp and /dev
  --mount / --umount    activate or deactivate the jail
  --clean               empty the private store
  --remove              unmount and delete the private store
  -- / --execute [NAME=VALUE...] PROGRAM [ARGS...]
                        replace this process with PROGRAM inside the jail
";

/// Parse an argument list. Options are applied to the jail immediately;
/// the returned steps run afterwards in order.
pub fn parse(jail: &mut Jail, args: &[String]) -> Result<Vec<Step>> {
    let mut tokens = split_shorts(args);
    let mut steps = Vec::new();
    let mut i = 0;
    while i < tokens.len() {
        let token = tokens[i].clone();
        i += 1;
        match token.as_str() {
            "-v" | "--verbose" => jail.cfg.verbose = true,
            "-t" | "--test" => jail.cfg.test = true,
            "-h" | "--help" => jail.cfg.help = true,
            "--passwd" => jail.cfg.passwd = true,
            "--dns" => jail.cfg.dns = true,
            "--lazy" => jail.cfg.lazy = true,
            "-d" | "--defaults" => {
                if !jail.cfg.defaults {
                    jail.cfg.defaults = true;
                    splice(&mut tokens, i, defaults::DEFAULTS_TEXT);
                }
            }
            "--etc" => {
                if !jail.cfg.etc {
                    jail.cfg.etc = true;
                    splice(&mut tokens, i, defaults::ETC_TEXT);
                }
            }
            "--umask" => {
                let value = value(&tokens, &mut i, "--umask")?;
                jail.cfg.exec_umask = crate::accounts::parse_num(&value)
                    .ok_or_else(|| Error::Config(format!("bad umask {:?}", value)))?
                    as u32;
            }
            "--chdir" => jail.cfg.exec_chdir = value(&tokens, &mut i, "--chdir")?,
            "--chuid" => jail.cfg.exec_chuid = Some(value(&tokens, &mut i, "--chuid")?),
            "--validname" => {
                let rx = value(&tokens, &mut i, "--validname")?;
                jail.cfg.set_validname(&rx)?;
            }
            "--writepath" => {
                let rx = value(&tokens, &mut i, "--writepath")?;
                jail.cfg.set_writepath(&rx)?;
            }
            "--ldconfig-cmd" => {
                let cmd = value(&tokens, &mut i, "--ldconfig-cmd")?;
                jail.resolver.set_ldconfig_cmd(&cmd);
            }
            "--ldconfig-rx" => {
                let rx = value(&tokens, &mut i, "--ldconfig-rx")?;
                jail.resolver.set_ldconfig_rx(&rx)?;
            }
            "--ldlist-cmd" => {
                let cmd = value(&tokens, &mut i, "--ldlist-cmd")?;
                jail.resolver.set_ldlist_cmd(&cmd);
            }
            "--ldlist-rx" => {
                let rx = value(&tokens, &mut i, "--ldlist-rx")?;
                jail.resolver.set_ldlist_rx(&rx)?;
            }
            "--bind" => {
                let mut args = take_args(&tokens, &mut i, "--bind", 1, 3)?;
                let srcpath = args.remove(0);
                let bindopts = if args.is_empty() { None } else { Some(args.remove(0)) };
                let path = if args.is_empty() { None } else { Some(args.remove(0)) };
                jail.cfg.bind(srcpath, bindopts, path);
            }

            "--try" => steps.push(Step::Try),
            "--print" => {
                let mut args = take_args(&tokens, &mut i, "--print", 0, 1)?;
                steps.push(Step::Print(args.pop()));
            }
            "--mount" => steps.push(Step::Mount),
            "--umount" => steps.push(Step::Umount),
            "--clean" => steps.push(Step::Clean),
            "--remove" => steps.push(Step::Remove),
            "--tmp" => steps.push(Step::Tmp),
            "--dev" => steps.push(Step::Dev),
            "--add" => {
                let paths = take_args(&tokens, &mut i, "--add", 1, usize::MAX)?;
                steps.push(Step::Add { paths });
            }
            "--add-from" => {
                let mut args = take_args(&tokens, &mut i, "--add-from", 1, usize::MAX)?;
                let srcdir = args.remove(0);
                steps.push(Step::AddFrom {
                    srcdir,
                    files: args,
                });
            }
            "--add-recurse" => {
                let (quick, paths) = take_quick_args(&tokens, &mut i, "--add-recurse", 1)?;
                steps.push(Step::AddRecurse { quick, paths });
            }
            "--clone" => {
                let mut args = take_args(&tokens, &mut i, "--clone", 2, 2)?;
                let dst = args.pop().unwrap_or_default();
                let src = args.pop().unwrap_or_default();
                steps.push(Step::Clone { src, dst });
            }
            "--clone-recurse" => {
                let (quick, mut args) = take_quick_args(&tokens, &mut i, "--clone-recurse", 2)?;
                if args.len() != 2 {
                    return Err(Error::Config(
                        "--clone-recurse takes SRC and DST".to_string(),
                    ));
                }
                let dst = args.pop().unwrap_or_default();
                let src = args.pop().unwrap_or_default();
                steps.push(Step::CloneRecurse { quick, src, dst });
            }
            "--clone-from" => {
                let mut args = take_args(&tokens, &mut i, "--clone-from", 2, usize::MAX)?;
                let src = args.remove(0);
                let dst = args.remove(0);
                steps.push(Step::CloneFrom {
                    src,
                    dst,
                    files: args,
                });
            }
            "--mkdir" => {
                let mut args = take_args(&tokens, &mut i, "--mkdir", 1, 3)?;
                let dst = args.remove(0);
                let mode = if args.is_empty() { None } else { Some(args.remove(0)) };
                let owner = if args.is_empty() { None } else { Some(args.remove(0)) };
                steps.push(Step::Mkdir { dst, mode, owner });
            }
            "--mknod" => {
                let mut args = take_args(&tokens, &mut i, "--mknod", 3, 4)?;
                let dst = args.remove(0);
                let devtype = args.remove(0);
                let major = args.remove(0);
                let minor = args.pop();
                steps.push(Step::Mknod {
                    dst,
                    devtype,
                    major,
                    minor,
                });
            }
            "--ln-s" => {
                let mut args = take_args(&tokens, &mut i, "--ln-s", 2, 2)?;
                let link = args.pop().unwrap_or_default();
                let target = args.pop().unwrap_or_default();
                steps.push(Step::LnS { target, link });
            }
            "--chmod" => {
                let mut args = take_args(&tokens, &mut i, "--chmod", 2, 2)?;
                let mode = args.pop().unwrap_or_default();
                let dst = args.pop().unwrap_or_default();
                steps.push(Step::Chmod { dst, mode });
            }
            "--chflags" => {
                let mut args = take_args(&tokens, &mut i, "--chflags", 2, 2)?;
                let flags = args.pop().unwrap_or_default();
                let dst = args.pop().unwrap_or_default();
                steps.push(Step::Chflags { dst, flags });
            }
            "--chown" => {
                let mut args = take_args(&tokens, &mut i, "--chown", 2, 3)?;
                let dst = args.remove(0);
                let user = args.remove(0);
                steps.push(Step::Chown {
                    dst,
                    user,
                    group: args.pop(),
                });
            }
            "--touch" => {
                let mut args = take_args(&tokens, &mut i, "--touch", 1, 2)?;
                let dst = args.remove(0);
                steps.push(Step::Touch {
                    dst,
                    stamp: args.pop(),
                });
            }
            "--rm" => {
                let mut args = take_args(&tokens, &mut i, "--rm", 1, 1)?;
                steps.push(Step::Rm {
                    dst: args.pop().unwrap_or_default(),
                });
            }
            "--rmdir" => {
                let mut args = take_args(&tokens, &mut i, "--rmdir", 1, 1)?;
                steps.push(Step::Rmdir {
                    dst: args.pop().unwrap_or_default(),
                });
            }
            "--" | "--execute" => {
                // the rest of the line belongs to the program
                let args: Vec<String> = tokens[i..].to_vec();
                i = tokens.len();
                if args.is_empty() {
                    return Err(Error::Config("--execute requires a program".to_string()));
                }
                steps.push(Step::Execute { args });
            }
            flag if flag.starts_with('-') => {
                return Err(Error::Config(format!("unknown option {:?}", flag)));
            }
            namespec => {
                if jail.cfg.user.is_some() {
                    return Err(Error::Config(format!("unexpected argument {:?}", namespec)));
                }
                jail.cfg.set_namespec(namespec)?;
            }
        }
    }
    Ok(steps)
}

/// `-dtv` becomes `-d -t -v`.
fn split_shorts(args: &[String]) -> Vec<String> {
    let mut out = Vec::with_capacity(args.len());
    for arg in args {
        if arg.len() > 2 && arg.starts_with('-') && !arg.starts_with("--") {
            for c in arg.chars().skip(1) {
                out.push(format!("-{}", c));
            }
        } else {
            out.push(arg.clone());
        }
    }
    out
}

fn splice(tokens: &mut Vec<String>, at: usize, text: &str) {
    tokens.splice(at..at, text.split_whitespace().map(String::from));
}

fn value(tokens: &[String], i: &mut usize, flag: &str) -> Result<String> {
    if *i >= tokens.len() {
        return Err(Error::Config(format!("{} requires a value", flag)));
    }
    let value = tokens[*i].clone();
    *i += 1;
    Ok(value)
}

/// Collect a verb's positional arguments: everything up to the next flag
/// token, bounded by the verb's arity.
fn take_args(
    tokens: &[String],
    i: &mut usize,
    flag: &str,
    min: usize,
    max: usize,
) -> Result<Vec<String>> {
    let mut args = Vec::new();
    while *i < tokens.len() && args.len() < max {
        let token = &tokens[*i];
        if token.starts_with('-') && token.len() > 1 {
            break;
        }
        args.push(token.clone());
        *i += 1;
    }
    if args.len() < min {
        return Err(Error::Config(format!(
            "{} takes at least {} argument{}",
            flag,
            min,
            if min == 1 { "" } else { "s" }
        )));
    }
    Ok(args)
}

/// Like take_args, but a `--quick` token anywhere in the run sets the
/// quick flag instead of counting as an argument.
fn take_quick_args(
    tokens: &[String],
    i: &mut usize,
    flag: &str,
    min: usize,
) -> Result<(bool, Vec<String>)> {
    let mut quick = false;
    let mut args = Vec::new();
    while *i < tokens.len() {
        let token = &tokens[*i];
        if token == "--quick" {
            quick = true;
            *i += 1;
            continue;
        }
        if token.starts_with('-') && token.len() > 1 {
            break;
        }
        args.push(token.clone());
        *i += 1;
    }
    if args.len() < min {
        return Err(Error::Config(format!(
            "{} takes at least {} argument{}",
            flag,
            min,
            if min == 1 { "" } else { "s" }
        )));
    }
    Ok((quick, args))
}
