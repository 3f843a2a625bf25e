//! Directory scan rules for `*.d` configuration directories.
//!
//! Files are read in lexicographic order by basename (not full path), so a
//! later file's directives can override an earlier one's by naming the
//! same key with a higher-sorting filename prefix (e.g. `10-base.conf`
//! before `50-override.conf`).

use std::path::{Path, PathBuf};

use crate::util::basename;

/// Prefixes that disqualify a file from being read at all: dotfiles, `~`
/// backups, and CVS bookkeeping directories' leftovers.
const DENYLIST_PREFIXES: &[&str] = &[".", "~", "CVS"];

/// Suffixes that disqualify a file from being read: editor backups,
/// version-control artifacts, and package-manager leftovers.
const DENYLIST_SUFFIXES: &[&str] = &[
    ".rpmsave",
    ".rpmorig",
    ".rpmnew",
    ".dpkg-old",
    ".dpkg-dist",
    ".dpkg-new",
    ".dpkg-bak",
    ".bak",
    ".orig",
    ".rej",
    ".YaST2save",
    ".-",
    "~",
    ",v",
];

fn is_denylisted(name: &str) -> bool {
    DENYLIST_PREFIXES.iter().any(|s| name.starts_with(s)) || DENYLIST_SUFFIXES.iter().any(|s| name.ends_with(s))
}

/// List the files directly inside `dir` worth parsing as configuration,
/// sorted by basename.
///
/// Dotfiles, `~`/`CVS`-prefixed names, and backup/package-manager suffixes
/// are skipped outright. A name that survives that filter but doesn't end
/// in `.conf` is still returned — legacy configs without the extension are
/// consumed, just with a warning, since depmod and modprobe have always
/// accepted them. Silently returns an empty list if `dir` doesn't exist —
/// configuration directories are optional.
pub fn scan_conf_dir(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(e) => e,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut files = Vec::new();
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = basename(&path);
        if is_denylisted(&name) {
            continue;
        }
        if !name.ends_with(".conf") {
            tracing::warn!(file = %path.display(), "config file name doesn't end in .conf, reading it anyway");
        }
        files.push(path);
    }
    files.sort_by(|a, b| basename(a).cmp(&basename(b)));
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn orders_by_basename_and_filters() {
        let dir = tempfile::tempdir().unwrap();
        for name in [
            "50-z.conf",
            "10-a.conf",
            ".hidden.conf",
            "backup.conf~",
            "old.rpmsave",
            "old.dpkg-bak",
            "CVSignore.conf",
        ] {
            fs::write(dir.path().join(name), "").unwrap();
        }
        let files = scan_conf_dir(dir.path()).unwrap();
        let names: Vec<String> = files.iter().map(|p| basename(p)).collect();
        assert_eq!(names, vec!["10-a.conf".to_owned(), "50-z.conf".to_owned()]);
    }

    #[test]
    fn legacy_non_conf_name_is_still_consumed() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("legacy-aliases"), "").unwrap();
        let files = scan_conf_dir(dir.path()).unwrap();
        let names: Vec<String> = files.iter().map(|p| basename(p)).collect();
        assert_eq!(names, vec!["legacy-aliases".to_owned()]);
    }

    #[test]
    fn missing_directory_is_empty() {
        let files = scan_conf_dir(Path::new("/nonexistent/does/not/exist")).unwrap();
        assert!(files.is_empty());
    }
}
