//! `depmod`: scan a kernel module tree, resolve every module's symbol
//! dependencies against every other module (and the running kernel), and
//! write the dependency/alias/symbol index files modprobe consumes.

pub mod output;
pub mod walk;

use std::path::{Path, PathBuf};

use displaydoc::Display;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::ConfigSet;
use crate::elf::{ElfError, ElfView};
use crate::graph::{prune_cycles, resolve_deps, ExporterMap, ModuleSet};
use crate::util::underscores;

#[derive(Debug, Display, Error)]
#[non_exhaustive]
pub enum DepmodError {
    /// error reading module `{0}`: {1}
    BadModule(String, ElfError),
    /// I/O error at `{0}`: {1}
    Io(String, std::io::Error),
}

/// Top-level depmod run: everything needed to reproduce one invocation.
pub struct DepmodRun {
    pub base_dir: PathBuf,
    pub kernel_release: String,
    pub config: ConfigSet,
    /// Optional `System.map` text; when present, undefined symbols that
    /// resolve against it are attributed to the kernel rather than left
    /// unresolved.
    pub system_map: Option<String>,
}

/// The fully-resolved result of a depmod run, ready to hand to
/// [`output::write_all`].
pub struct Resolved {
    pub modules: ModuleSet,
    pub module_aliases: Vec<(String, String)>,
}

/// Run depmod over `run.base_dir`: discover modules, parse each one's ELF
/// metadata, build the exporter map, resolve dependencies, and check for
/// cycles.
pub fn resolve(run: &DepmodRun) -> Result<Resolved, DepmodError> {
    let search_dirs = search_dir_list(run);
    let mut candidates = Vec::new();
    for (priority, dir) in search_dirs.iter().enumerate() {
        candidates.extend(walk::walk_dir(dir, priority));
    }

    let order_path = run.base_dir.join("modules.order");
    let order = std::fs::read_to_string(&order_path)
        .map(|text| walk::parse_modules_order(&text, &run.base_dir))
        .unwrap_or_default();

    for (module, kernel_version, path) in &run.config.overrides {
        if *kernel_version == run.kernel_release || kernel_version == "*" {
            candidates.push(walk::Candidate {
                modname: underscores(module),
                path: PathBuf::from(path),
                search_priority: 0,
                is_override: true,
            });
        }
    }

    let resolved_candidates = walk::resolve_priority(candidates, &order);
    info!(count = resolved_candidates.len(), "discovered modules");

    let mut set = ModuleSet::new();
    let mut module_aliases = Vec::new();

    for candidate in &resolved_candidates {
        let bytes = std::fs::read(&candidate.path)
            .map_err(|e| DepmodError::Io(candidate.path.display().to_string(), e))?;
        let id = set.insert(candidate.modname.clone(), candidate.path.display().to_string());

        if candidate.path.extension().map(|e| e != "ko").unwrap_or(true) {
            warn!(path = %candidate.path.display(), "compressed module, skipping symbol extraction");
            continue;
        }

        let view = match ElfView::open(&bytes) {
            Ok(v) => v,
            Err(e) => {
                warn!(path = %candidate.path.display(), error = %e, "unreadable module, skipping");
                continue;
            }
        };

        let module = set.get_mut(id);
        module.exports = view.load_symbols();
        module.imports = view
            .load_dep_syms()
            .map_err(|e| DepmodError::BadModule(candidate.modname.clone(), e))?;

        for alias in view.get_aliases() {
            module_aliases.push((alias, candidate.modname.clone()));
        }
        debug!(module = %candidate.modname, exports = module.exports.len(), imports = module.imports.len(), "parsed module");
    }

    let mut exporters = ExporterMap::new();
    for (id, module) in set.iter() {
        for sym in &module.exports {
            exporters.add_export(sym, id);
        }
    }
    if let Some(map_text) = &run.system_map {
        exporters.load_system_map(map_text);
    }

    resolve_deps(&mut set, &exporters);
    // Cycles are a warning, not a hard failure: the offending module is
    // dropped and the rest of the tree is still written out.
    prune_cycles(&mut set);

    Ok(Resolved { modules: set, module_aliases })
}

/// Search directories in priority order: the base tree itself first
/// (priority 0, always implicit), then any `search` directives from
/// configuration, each at increasing (lower-priority) indices.
fn search_dir_list(run: &DepmodRun) -> Vec<PathBuf> {
    let mut dirs = vec![run.base_dir.clone()];
    for extra in &run.config.search_dirs {
        dirs.push(run.base_dir.join(extra));
    }
    dirs
}

/// Write every resolved module's exports and imports plus the output
/// files. Convenience wrapper around [`resolve`] + [`output::write_all`].
pub fn run_depmod(run: &DepmodRun) -> Result<(), DepmodError> {
    let resolved = resolve(run)?;
    let config_aliases: Vec<(String, String, i32)> = run
        .config
        .aliases
        .iter()
        .enumerate()
        .map(|(i, (pattern, target))| (pattern.clone(), target.clone(), i as i32))
        .collect();

    output::write_all(&run.base_dir, &resolved.modules, &resolved.module_aliases, &config_aliases)
        .map_err(|e| DepmodError::Io(run.base_dir.display().to_string(), e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write_minimal_ko(path: &Path) {
        // Minimal valid little-endian 64-bit ELF header with zero sections.
        let mut buf = vec![0u8; 64];
        buf[0..4].copy_from_slice(&[0x7f, b'E', b'L', b'F']);
        buf[4] = 2; // ELFCLASS64
        buf[5] = 1; // ELFDATA2LSB
        fs::write(path, buf).unwrap();
    }

    #[test]
    fn resolve_discovers_modules_under_base_dir() {
        let dir = tempfile::tempdir().unwrap();
        let kdir = dir.path().join("kernel/drivers");
        fs::create_dir_all(&kdir).unwrap();
        write_minimal_ko(&kdir.join("foo.ko"));

        let run = DepmodRun {
            base_dir: dir.path().to_path_buf(),
            kernel_release: "6.1.0".into(),
            config: ConfigSet::default(),
            system_map: None,
        };
        let resolved = resolve(&run).unwrap();
        assert_eq!(resolved.modules.len(), 1);
        assert!(resolved.modules.find("foo").is_some());
    }
}
