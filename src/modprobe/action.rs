//! The modprobe action engine: alias resolution, blacklist and softdep
//! handling, install/remove shell overrides, and recursive insmod/rmmod
//! over a module's dependency chain.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Command;

use displaydoc::Display;
use thiserror::Error;
use tracing::{info, warn};

use super::kernel::{KernelModuleOps, KernelOpError};
use super::sysfs;
use crate::config::ConfigSet;
use crate::index::IndexFile;

#[derive(Debug, Display, Error)]
#[non_exhaustive]
pub enum ActionError {
    /// module `{0}` not found
    NotFound(String),
    /// {0}
    Kernel(#[from] KernelOpError),
    /// install/remove command for `{0}` exited with status {1}
    CommandFailed(String, i32),
    /// I/O error running command for `{0}`: {1}
    Io(String, std::io::Error),
    /// module `{0}` is still in use (refcnt > 0)
    InUse(String),
    /// decompression of `{0}` is not supported
    CompressionUnsupported(String),
    /// softdep recursion for `{0}` exceeded depth {1}, probable loop
    SoftdepTooDeep(String, u32),
}

/// Bound on `pre:`/`post:` softdep recursion, to break a circular softdep
/// configuration (`A pre: B` / `B pre: A`) instead of recursing forever.
const MAX_SOFTDEP_DEPTH: u32 = 50;

pub type Result<T> = std::result::Result<T, ActionError>;

/// Everything the action engine needs to resolve and load a module: the
/// module tree's dependency graph (as depmod left it) and configuration
/// directives layered on top.
pub struct ModprobeContext<'a> {
    pub sysfs_root: &'a Path,
    pub config: &'a ConfigSet,
    /// module name -> absolute `.ko` path
    pub module_paths: HashMap<String, PathBuf>,
    /// module name -> its direct dependencies, dependency-ordered
    pub module_deps: HashMap<String, Vec<String>>,
}

impl<'a> ModprobeContext<'a> {
    /// Build a context from a parsed `modules.dep` text file: each line is
    /// `path: dep1 dep2 ...`, module names derived from each path's
    /// basename.
    pub fn from_modules_dep(modules_dep_text: &str, config: &'a ConfigSet, sysfs_root: &'a Path) -> Self {
        let mut module_paths = HashMap::new();
        let mut module_deps = HashMap::new();

        for line in modules_dep_text.lines() {
            let Some((path_part, deps_part)) = line.split_once(':') else {
                continue;
            };
            let name = crate::util::filename2modname(path_part.trim());
            module_paths.insert(name.clone(), PathBuf::from(path_part.trim()));
            let deps: Vec<String> = deps_part
                .split_whitespace()
                .map(crate::util::filename2modname)
                .collect();
            module_deps.insert(name, deps);
        }

        Self {
            sysfs_root,
            config,
            module_paths,
            module_deps,
        }
    }
}

/// Resolve `name` as an alias if it isn't already a known module, trying
/// an exact index lookup first and falling back to glob matching.
/// Returns `name` unchanged (wrapped) if nothing in the alias index
/// matches — most explicit `modprobe <name>` invocations name a real
/// module directly.
pub fn resolve_alias(alias_index: &IndexFile<'_>, name: &str) -> Vec<String> {
    let exact = alias_index.search(name);
    if !exact.is_empty() {
        return exact;
    }
    let wild = alias_index.search_wild(name);
    if !wild.is_empty() {
        return wild;
    }
    vec![name.to_owned()]
}

fn is_blacklisted(config: &ConfigSet, name: &str) -> bool {
    config.blacklist.iter().any(|b| crate::util::underscore_eq(b, name))
}

fn install_override<'a>(config: &'a ConfigSet, name: &str) -> Option<&'a str> {
    config
        .installs
        .iter()
        .find(|(m, _)| crate::util::underscore_eq(m, name))
        .map(|(_, cmd)| cmd.as_str())
}

fn remove_override<'a>(config: &'a ConfigSet, name: &str) -> Option<&'a str> {
    config
        .removes
        .iter()
        .find(|(m, _)| crate::util::underscore_eq(m, name))
        .map(|(_, cmd)| cmd.as_str())
}

fn softdep_of<'a>(config: &'a ConfigSet, name: &str) -> Option<(&'a [String], &'a [String])> {
    config
        .softdeps
        .iter()
        .find(|(m, _, _)| crate::util::underscore_eq(m, name))
        .map(|(_, pre, post)| (pre.as_slice(), post.as_slice()))
}

/// Run a configured install/remove shell command, with `$CMDLINE_OPTS`
/// and `$MODPROBE_MODULE` set the way the original tool sets them so
/// hand-written override scripts keep working unmodified.
fn run_override_command(command: &str, module: &str, cmdline_opts: &str) -> Result<()> {
    let status = Command::new("/bin/sh")
        .arg("-c")
        .arg(command)
        .env("CMDLINE_OPTS", cmdline_opts)
        .env("MODPROBE_MODULE", module)
        .status()
        .map_err(|e| ActionError::Io(module.to_owned(), e))?;

    if !status.success() {
        return Err(ActionError::CommandFailed(module.to_owned(), status.code().unwrap_or(-1)));
    }
    Ok(())
}

fn is_live(ctx: &ModprobeContext<'_>, name: &str) -> bool {
    sysfs::read_initstate(ctx.sysfs_root, name).as_deref() == Some("live")
}

/// Load `name` and everything it (transitively) depends on, in dependency
/// order, skipping anything already live. `explicit` distinguishes a
/// direct `modprobe <name>` request from a dependency/softdep pull-in:
/// blacklist entries only suppress the latter.
pub fn insmod<K: KernelModuleOps>(
    kernel: &K,
    ctx: &ModprobeContext<'_>,
    name: &str,
    cmdline_opts: &str,
    explicit: bool,
) -> Result<()> {
    insmod_at_depth(kernel, ctx, name, cmdline_opts, explicit, 0)
}

fn insmod_at_depth<K: KernelModuleOps>(
    kernel: &K,
    ctx: &ModprobeContext<'_>,
    name: &str,
    cmdline_opts: &str,
    explicit: bool,
    softdep_depth: u32,
) -> Result<()> {
    let name = crate::util::underscores(name);

    if softdep_depth > MAX_SOFTDEP_DEPTH {
        return Err(ActionError::SoftdepTooDeep(name, MAX_SOFTDEP_DEPTH));
    }

    if !explicit && is_blacklisted(ctx.config, &name) {
        info!(module = %name, "skipping blacklisted module");
        return Ok(());
    }

    if is_live(ctx, &name) {
        return Ok(());
    }

    if let Some((pre, _)) = softdep_of(ctx.config, &name) {
        for dep in pre {
            insmod_at_depth(kernel, ctx, dep, cmdline_opts, false, softdep_depth + 1)?;
        }
    }

    if let Some(deps) = ctx.module_deps.get(&name).cloned() {
        for dep in &deps {
            insmod_at_depth(kernel, ctx, dep, "", false, softdep_depth)?;
        }
    }

    if let Some(cmd) = install_override(ctx.config, &name) {
        run_override_command(cmd, &name, cmdline_opts)?;
    } else {
        let path = ctx
            .module_paths
            .get(&name)
            .ok_or_else(|| ActionError::NotFound(name.clone()))?;
        if path.to_string_lossy().ends_with(".gz")
            || path.to_string_lossy().ends_with(".xz")
            || path.to_string_lossy().ends_with(".zst")
        {
            return Err(ActionError::CompressionUnsupported(path.display().to_string()));
        }
        let bytes = std::fs::read(path).map_err(|e| ActionError::Io(name.clone(), e))?;
        kernel.insmod(&name, &bytes, cmdline_opts)?;
        sysfs::wait_until_live(ctx.sysfs_root, &name);
    }

    if let Some((_, post)) = softdep_of(ctx.config, &name) {
        for dep in post {
            insmod_at_depth(kernel, ctx, dep, cmdline_opts, false, softdep_depth + 1)?;
        }
    }

    Ok(())
}

/// Unload `name`. If `recursive`, also unload any of its dependencies that
/// are no longer in use by any other live module (refcnt reaches zero).
pub fn rmmod<K: KernelModuleOps>(kernel: &K, ctx: &ModprobeContext<'_>, name: &str, recursive: bool) -> Result<()> {
    let name = crate::util::underscores(name);

    if !is_live(ctx, &name) {
        return Ok(());
    }

    if let Some(refcnt) = sysfs::read_refcnt(ctx.sysfs_root, &name) {
        if refcnt > 0 {
            return Err(ActionError::InUse(name));
        }
    }

    if let Some(cmd) = remove_override(ctx.config, &name) {
        run_override_command(cmd, &name, "")?;
    } else {
        kernel.rmmod(&name, false)?;
    }

    if recursive {
        if let Some(deps) = ctx.module_deps.get(&name).cloned() {
            for dep in &deps {
                match rmmod(kernel, ctx, dep, true) {
                    Ok(()) | Err(ActionError::InUse(_)) => {}
                    Err(e) => warn!(module = %dep, error = %e, "failed to unload dependency"),
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modprobe::kernel::fake::FakeKernelOps;
    use std::fs;

    fn ctx_for<'a>(config: &'a ConfigSet, sysfs_root: &'a Path, modules_dep: &str) -> ModprobeContext<'a> {
        ModprobeContext::from_modules_dep(modules_dep, config, sysfs_root)
    }

    #[test]
    fn insmod_loads_dependencies_before_module() {
        let dir = tempfile::tempdir().unwrap();
        let sysfs_root = dir.path().join("sys");
        fs::create_dir_all(&sysfs_root).unwrap();

        let kodir = dir.path().join("ko");
        fs::create_dir_all(&kodir).unwrap();
        fs::write(kodir.join("a.ko"), b"AAAA").unwrap();
        fs::write(kodir.join("b.ko"), b"BBBB").unwrap();

        let modules_dep = format!(
            "{a}: {b}\n{b}:\n",
            a = kodir.join("a.ko").display(),
            b = kodir.join("b.ko").display()
        );
        let config = ConfigSet::default();
        let ctx = ctx_for(&config, &sysfs_root, &modules_dep);

        let kernel = FakeKernelOps::default();
        insmod(&kernel, &ctx, "a", "", true).unwrap();

        let calls = kernel.insmod_calls.borrow();
        assert_eq!(calls.as_slice(), ["b", "a"]);
    }

    #[test]
    fn insmod_skips_blacklisted_when_not_explicit() {
        let dir = tempfile::tempdir().unwrap();
        let sysfs_root = dir.path().join("sys");
        fs::create_dir_all(&sysfs_root).unwrap();

        let mut config = ConfigSet::default();
        config.blacklist.push("nouveau".to_owned());
        let ctx = ctx_for(&config, &sysfs_root, "");

        let kernel = FakeKernelOps::default();
        insmod(&kernel, &ctx, "nouveau", "", false).unwrap();
        assert!(kernel.insmod_calls.borrow().is_empty());
    }

    #[test]
    fn insmod_does_not_skip_blacklisted_when_explicit() {
        let dir = tempfile::tempdir().unwrap();
        let sysfs_root = dir.path().join("sys");
        fs::create_dir_all(&sysfs_root).unwrap();

        let kodir = dir.path().join("ko");
        fs::create_dir_all(&kodir).unwrap();
        fs::write(kodir.join("nouveau.ko"), b"X").unwrap();

        let mut config = ConfigSet::default();
        config.blacklist.push("nouveau".to_owned());
        let modules_dep = format!("{}:\n", kodir.join("nouveau.ko").display());
        let ctx = ctx_for(&config, &sysfs_root, &modules_dep);

        let kernel = FakeKernelOps::default();
        insmod(&kernel, &ctx, "nouveau", "", true).unwrap();
        assert_eq!(kernel.insmod_calls.borrow().as_slice(), ["nouveau"]);
    }

    #[test]
    fn insmod_breaks_circular_softdep_at_max_depth() {
        let dir = tempfile::tempdir().unwrap();
        let sysfs_root = dir.path().join("sys");
        fs::create_dir_all(&sysfs_root).unwrap();

        let mut config = ConfigSet::default();
        config.softdeps.push(("a".to_owned(), vec!["b".to_owned()], vec![]));
        config.softdeps.push(("b".to_owned(), vec!["a".to_owned()], vec![]));
        let ctx = ctx_for(&config, &sysfs_root, "");

        let kernel = FakeKernelOps::default();
        let err = insmod(&kernel, &ctx, "a", "", true).unwrap_err();
        assert!(matches!(err, ActionError::SoftdepTooDeep(_, MAX_SOFTDEP_DEPTH)));
    }

    #[test]
    fn rmmod_refuses_when_in_use() {
        let dir = tempfile::tempdir().unwrap();
        let sysfs_root = dir.path().join("sys");
        let mdir = sysfs_root.join("module/foo");
        fs::create_dir_all(&mdir).unwrap();
        fs::write(mdir.join("initstate"), "live").unwrap();
        fs::write(mdir.join("refcnt"), "3").unwrap();

        let config = ConfigSet::default();
        let ctx = ctx_for(&config, &sysfs_root, "");
        let kernel = FakeKernelOps::default();
        let err = rmmod(&kernel, &ctx, "foo", false).unwrap_err();
        assert!(matches!(err, ActionError::InUse(_)));
    }

    #[test]
    fn resolve_alias_falls_back_to_name() {
        let idx = crate::index::node::Index::new();
        let bytes = crate::index::writer::write(&idx);
        let file = IndexFile::parse(&bytes).unwrap();
        assert_eq!(resolve_alias(&file, "e1000e"), vec!["e1000e".to_owned()]);
    }
}
