//! Walks a kernel module tree (`/lib/modules/<release>`), resolving the
//! basename-priority rules depmod uses when the same module name would
//! otherwise be discovered twice (e.g. an `updates/` overlay shadowing the
//! shipped copy, or an explicit `override` directive).

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::util::filename2modname;

/// One `.ko`-ish file found under the module tree, with enough context to
/// resolve priority against a same-named file found elsewhere.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub modname: String,
    pub path: PathBuf,
    /// Lower search-dir index wins; directories are searched in the order
    /// `search_dirs` lists them, `""` (the tree root) implicitly first.
    pub search_priority: usize,
    /// Set when an `override` directive names this exact path explicitly;
    /// overrides always outrank ordinary directory search priority.
    pub is_override: bool,
}

const KNOWN_EXTENSIONS: &[&str] = &[".ko", ".ko.gz", ".ko.xz", ".ko.zst"];

fn has_module_extension(name: &str) -> bool {
    KNOWN_EXTENSIONS.iter().any(|ext| name.ends_with(ext))
}

/// Recursively collect module files under `dir`, at `search_priority`.
pub fn walk_dir(dir: &Path, search_priority: usize) -> Vec<Candidate> {
    let mut out = Vec::new();
    for entry in WalkDir::new(dir).into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy();
        if !has_module_extension(&name) {
            continue;
        }
        out.push(Candidate {
            modname: filename2modname(&name),
            path: entry.path().to_path_buf(),
            search_priority,
            is_override: false,
        });
    }
    out
}

/// Reduce a flat list of candidates (possibly containing duplicate module
/// names from different search directories) to one chosen path per name.
///
/// Resolution order: an `override` always wins; otherwise, lower
/// `search_priority` wins; ties broken by the order `modules.order` lists
/// paths in (earlier wins), then by path string for determinism.
pub fn resolve_priority(mut candidates: Vec<Candidate>, order: &[PathBuf]) -> Vec<Candidate> {
    let order_rank: HashMap<&Path, usize> = order
        .iter()
        .enumerate()
        .map(|(i, p)| (p.as_path(), i))
        .collect();

    candidates.sort_by(|a, b| {
        let rank = |c: &Candidate| {
            (
                !c.is_override,
                c.search_priority,
                order_rank.get(c.path.as_path()).copied().unwrap_or(usize::MAX),
                c.path.clone(),
            )
        };
        rank(a).cmp(&rank(b))
    });

    let mut seen = std::collections::HashSet::new();
    candidates
        .into_iter()
        .filter(|c| seen.insert(c.modname.clone()))
        .collect()
}

/// Parse a `modules.order` file: one module path per line, in the build
/// order the kernel's own `Makefile` produced. Lines are relative to the
/// module tree root.
pub fn parse_modules_order(text: &str, base: &Path) -> Vec<PathBuf> {
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(|l| base.join(l))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cand(name: &str, path: &str, priority: usize, is_override: bool) -> Candidate {
        Candidate {
            modname: name.to_owned(),
            path: PathBuf::from(path),
            search_priority: priority,
            is_override,
        }
    }

    #[test]
    fn lower_search_priority_wins() {
        let candidates = vec![
            cand("foo", "/lib/modules/x/updates/foo.ko", 0, false),
            cand("foo", "/lib/modules/x/kernel/foo.ko", 1, false),
        ];
        let resolved = resolve_priority(candidates, &[]);
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].path, PathBuf::from("/lib/modules/x/updates/foo.ko"));
    }

    #[test]
    fn override_always_wins() {
        let candidates = vec![
            cand("foo", "/lib/modules/x/updates/foo.ko", 0, false),
            cand("foo", "/custom/foo.ko", 5, true),
        ];
        let resolved = resolve_priority(candidates, &[]);
        assert_eq!(resolved[0].path, PathBuf::from("/custom/foo.ko"));
    }

    #[test]
    fn parse_modules_order_joins_base() {
        let order = parse_modules_order("kernel/drivers/net/foo.ko\nkernel/fs/bar.ko\n", Path::new("/lib/modules/x"));
        assert_eq!(order[0], PathBuf::from("/lib/modules/x/kernel/drivers/net/foo.ko"));
    }
}
