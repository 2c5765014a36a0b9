//! jail - build chroot jails for one unprivileged user
//!
//! A jail is a restricted directory tree holding only the executables,
//! shared libraries, device nodes and configuration one program needs,
//! bind-mounted over the jail user's home and optionally entered by
//! replacing this process.

mod accounts;
mod add;
mod cli;
mod config;
mod defaults;
mod error;
mod exec;
mod fsops;
mod mounts;
mod passwd;
mod policy;
mod props;
mod resolver;
mod sequencer;
mod step;

use error::Result;

fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();
    if let Err(e) = run(&args) {
        eprintln!("jail: {}", e);
        std::process::exit(1);
    }
}

fn run(args: &[String]) -> Result<()> {
    let mut jail = sequencer::Jail::new()?;
    let steps = cli::parse(&mut jail, args)?;
    if jail.cfg.help || (steps.is_empty() && !jail.cfg.passwd) {
        eprint!("{}", cli::USAGE);
        return Ok(());
    }
    jail.run(&steps)
}
