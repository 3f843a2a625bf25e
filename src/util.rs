//! Utility functions shared by the ELF reader, resolver, and config parser

use std::path::Path;

/// Technically Linux requires sysfs to be at `/sys`, calling it a system
/// configuration error otherwise.
///
/// But our upcoming distro is planning to experiment with filesystem layout
/// changes, including of `/sys`, so do this to allow easily changing it.
pub const SYSFS_PATH: &str = "/sys";

/// Kernel Module tree location. Same reasons as [`SYSFS_PATH`].
pub const MODULE_PATH: &str = "/lib/modules";

/// Default top-level depmod configuration file, deprecated in favor of
/// [`DEPMOD_CONF_DIR`].
pub const DEPMOD_CONF: &str = "/etc/depmod.conf";

/// Default depmod configuration directory.
pub const DEPMOD_CONF_DIR: &str = "/etc/depmod.d";

/// Default top-level modprobe configuration file, deprecated in favor of
/// [`MODPROBE_CONF_DIR`].
pub const MODPROBE_CONF: &str = "/etc/modprobe.conf";

/// Default modprobe configuration directory.
pub const MODPROBE_CONF_DIR: &str = "/etc/modprobe.d";

/// Sentinel search-list entry standing in for the implicit built-in bucket.
pub const BUILTIN_KEY: &str = "built-in";

/// Replace `-` with `_`, except inside `[...]` glob character classes.
///
/// Module names canonicalize dashes to underscores; glob keys (used by
/// `alias` directives) must keep metacharacters inside brackets verbatim,
/// since `[a-z]` is a range, not three dash-separated words.
///
/// Idempotent: `underscores(underscores(s)) == underscores(s)`.
pub fn underscores(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut in_class = false;
    for ch in s.chars() {
        match ch {
            '[' => {
                in_class = true;
                out.push(ch);
            }
            ']' => {
                in_class = false;
                out.push(ch);
            }
            '-' if !in_class => out.push('_'),
            _ => out.push(ch),
        }
    }
    out
}

/// Compare two module-ish strings treating `-` and `_` as identical.
///
/// Used for alias/glob subject matching where the *key* may mix dashes and
/// underscores but the caller's concrete name is already canonical.
pub fn underscore_eq(a: &str, b: &str) -> bool {
    let mut a = a.bytes();
    let mut b = b.bytes();
    loop {
        match (a.next(), b.next()) {
            (None, None) => return true,
            (Some(x), Some(y)) => {
                let norm = |c: u8| if c == b'-' { b'_' } else { c };
                if norm(x) != norm(y) {
                    return false;
                }
            }
            _ => return false,
        }
    }
}

/// The final path component, as a lossy string.
///
/// Never fails: invalid UTF-8 is replaced per [`Path::to_string_lossy`].
pub fn basename(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Canonicalize a module filename into a module name.
///
/// Takes the basename, strips the first `.` and everything after it (so
/// `foo.ko`, `foo.ko.gz`, and `foo.ko.xz` all yield `foo`), then replaces
/// `-` with `_`.
///
/// Idempotent when `x` has no path component: `filename2modname(x)` applied
/// twice to its own output is a no-op, since the output never contains `.`
/// or `-`.
pub fn filename2modname(name: &str) -> String {
    let base = name.rsplit('/').next().unwrap_or(name);
    let stem = base.split_once('.').map(|(s, _)| s).unwrap_or(base);
    underscores(stem)
}

/// Join physical lines ending in `\` into logical lines.
///
/// Used by the configuration parser (spec'd grammar: "Physical lines ending
/// with `\` are joined to form one logical line").
pub fn fold_lines(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut cur = String::new();
    for line in text.lines() {
        if let Some(stripped) = line.strip_suffix('\\') {
            cur.push_str(stripped);
        } else {
            cur.push_str(line);
            out.push(std::mem::take(&mut cur));
        }
    }
    if !cur.is_empty() {
        out.push(cur);
    }
    out
}

/// Read the host's native endianness, used to decide whether an ELF file's
/// recorded endianness requires byte-swapping on read.
pub fn host_is_little_endian() -> bool {
    cfg!(target_endian = "little")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn underscores_basic() {
        assert_eq!(underscores("foo-bar"), "foo_bar");
        assert_eq!(underscores("foo-bar-baz"), "foo_bar_baz");
    }

    #[test]
    fn underscores_preserves_class() {
        assert_eq!(underscores("pci:v[0-9]*"), "pci:v[0-9]*");
    }

    #[test]
    fn underscores_idempotent() {
        let s = "a-b-c[0-9-a]";
        assert_eq!(underscores(&underscores(s)), underscores(s));
    }

    #[test]
    fn filename2modname_strips_compression_and_dashes() {
        assert_eq!(filename2modname("foo-bar.ko"), "foo_bar");
        assert_eq!(filename2modname("foo-bar.ko.gz"), "foo_bar");
        assert_eq!(filename2modname("/lib/modules/5.0/foo-bar.ko"), "foo_bar");
    }

    #[test]
    fn filename2modname_idempotent_without_path() {
        let x = "foo-bar.ko";
        let once = filename2modname(x);
        assert_eq!(filename2modname(&once), once);
    }

    #[test]
    fn fold_lines_joins_backslash_continuation() {
        let text = "alias foo \\\nbar\nalias baz qux\n";
        let lines = fold_lines(text);
        assert_eq!(lines, vec!["alias foo bar", "alias baz qux"]);
    }

    #[test]
    fn underscore_eq_treats_dash_and_underscore_same() {
        assert!(underscore_eq("foo-bar", "foo_bar"));
        assert!(!underscore_eq("foo-bar", "foo_baz"));
    }
}
