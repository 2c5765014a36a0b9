//! Curated jail contents: device nodes, `/etc` files, the `--defaults`
//! sequence. All of it is data; `--print {defaults_text}` and
//! `--print {etc_text}` show it verbatim.

/// Device nodes created by `--dev`, with their canonical (major, minor).
pub const DEV_NODES: &[(&str, u32, u32)] = &[
    ("null", 1, 3),
    ("zero", 1, 5),
    ("random", 1, 8),
    ("urandom", 1, 9),
    ("tty", 5, 0),
];

/// Steps spliced into the command stream by `--etc`: a minimal set of host
/// configuration files a program inside the jail is likely to expect.
/// Each is under `--try` since not every host ships every file.
pub const ETC_TEXT: &str = concat!(
    "--try --add /etc/hostname",
    " --try --add /etc/hosts",
    " --try --add /etc/resolv.conf",
    " --try --add /etc/services",
    " --try --add /etc/protocols",
    " --try --add /etc/ld.so.cache",
    " --try --add /etc/nsswitch.conf",
    " --try --add /etc/timezone",
    " --try --clone /etc/localtime {jailhome}/etc/localtime",
);

/// Steps spliced into the command stream by `--defaults`.
pub const DEFAULTS_TEXT: &str = concat!(
    "--tmp --dev --etc --passwd",
    " --try --clone-recurse --quick /usr/share/zoneinfo {jailhome}/usr/share/zoneinfo",
    " --try --clone-recurse --quick /usr/lib/locale {jailhome}/usr/lib/locale",
);
