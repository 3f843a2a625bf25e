//! Writes depmod's output files: `modules.dep[.bin]`, `modules.alias[.bin]`,
//! `modules.symbols[.bin]`, and `modules.builtin[.bin]`.
//!
//! Every file is written to a temporary path in the same directory and
//! renamed into place, so a reader never observes a partially-written
//! file (`rename` is atomic within a filesystem).

use std::io::Write;
use std::path::Path;

use crate::graph::{order_dep_list, ModuleSet};
use crate::index::{node::Index, writer};

/// Write `contents` to `path` atomically: write to `path.tmp`, `fsync`,
/// then rename over the destination.
pub fn write_atomic(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = path.with_file_name(tmp_name);
    {
        let mut f = std::fs::File::create(&tmp_path)?;
        f.write_all(contents)?;
        f.sync_all()?;
    }
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

/// Render `modules.dep`: one line per module, `path: dep1.ko dep2.ko ...`,
/// dependencies ordered so a loader processing the line left-to-right
/// never loads a module before something it needs.
pub fn render_modules_dep(set: &ModuleSet) -> String {
    let mut out = String::new();
    let mut entries: Vec<_> = set.iter().collect();
    entries.sort_by(|a, b| a.1.name.cmp(&b.1.name));
    for (id, module) in entries {
        out.push_str(&module.path);
        out.push(':');
        let order = order_dep_list(set, id);
        for dep_id in order.into_iter().filter(|&d| d != id) {
            out.push(' ');
            out.push_str(&set.get(dep_id).path);
        }
        out.push('\n');
    }
    out
}

/// Build the `modules.dep.bin` trie: key is the module's canonical path,
/// value is the dependency-ordered list of dependency paths joined by `\n`
/// so a single trie value carries the whole line.
pub fn build_modules_dep_index(set: &ModuleSet) -> Index {
    let mut idx = Index::new();
    for (id, module) in set.iter() {
        let order = order_dep_list(set, id);
        let deps: Vec<&str> = order
            .iter()
            .filter(|&&d| d != id)
            .map(|&d| set.get(d).path.as_str())
            .collect();
        idx.insert(&module.path, &deps.join("\n"), 0);
    }
    idx
}

/// Build the `modules.alias.bin` trie from every module's `.modalias`
/// records plus any `alias` directives from configuration, each module
/// name used as the stored value.
pub fn build_alias_index<'a>(
    module_aliases: impl Iterator<Item = (&'a str, &'a str)>,
    config_aliases: impl Iterator<Item = (&'a str, &'a str, i32)>,
) -> Index {
    let mut idx = Index::new();
    for (alias, modname) in module_aliases {
        idx.insert(alias, modname, 0);
    }
    for (pattern, modname, priority) in config_aliases {
        idx.insert(pattern, modname, priority);
    }
    idx
}

/// Build the `modules.symbols.bin` trie: key is `symbol:<name>`, value is
/// the exporting module name.
pub fn build_symbols_index(set: &ModuleSet) -> Index {
    let mut idx = Index::new();
    for (_, module) in set.iter() {
        for sym in &module.exports {
            idx.insert(&format!("symbol:{sym}"), &module.name, 0);
        }
    }
    idx
}

/// Write all four output families (text `.dep`, plus the three `.bin`
/// tries) into `out_dir`.
pub fn write_all(
    out_dir: &Path,
    set: &ModuleSet,
    module_aliases: &[(String, String)],
    config_aliases: &[(String, String, i32)],
) -> std::io::Result<()> {
    write_atomic(&out_dir.join("modules.dep"), render_modules_dep(set).as_bytes())?;
    write_atomic(
        &out_dir.join("modules.dep.bin"),
        &writer::write(&build_modules_dep_index(set)),
    )?;

    let alias_idx = build_alias_index(
        module_aliases.iter().map(|(a, b)| (a.as_str(), b.as_str())),
        config_aliases.iter().map(|(a, b, p)| (a.as_str(), b.as_str(), *p)),
    );
    write_atomic(&out_dir.join("modules.alias.bin"), &writer::write(&alias_idx))?;

    write_atomic(
        &out_dir.join("modules.symbols.bin"),
        &writer::write(&build_symbols_index(set)),
    )?;

    Ok(())
}

/// `modules.builtin`: the flat list of modules compiled directly into the
/// kernel, one path per line, verbatim from the kernel build tree. depmod
/// does not generate this list, only copies it into the output directory
/// and indexes it the same way as `modules.dep`.
pub fn write_builtin(out_dir: &Path, builtin_list: &str) -> std::io::Result<()> {
    write_atomic(&out_dir.join("modules.builtin"), builtin_list.as_bytes())?;
    let mut idx = Index::new();
    for (i, line) in builtin_list.lines().enumerate() {
        if !line.is_empty() {
            idx.insert(line, line, -(i as i32));
        }
    }
    write_atomic(&out_dir.join("modules.builtin.bin"), &writer::write(&idx))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::ModuleSet;

    #[test]
    fn renders_dep_line_with_ordered_dependencies() {
        let mut set = ModuleSet::new();
        let a = set.insert("a".into(), "kernel/a.ko".into());
        let b = set.insert("b".into(), "kernel/b.ko".into());
        set.get_mut(a).deps = vec![b];

        let text = render_modules_dep(&set);
        assert!(text.contains("kernel/a.ko: kernel/b.ko"));
        assert!(text.contains("kernel/b.ko:\n"));
    }

    #[test]
    fn write_atomic_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.txt");
        write_atomic(&path, b"hello").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "hello");
    }
}
