//! Polls `/sys/module/<name>/{initstate,refcnt}` while a module finishes
//! its `init()` call, or while waiting for a ref count to drop to zero
//! before unloading.

use std::path::Path;
use std::thread;
use std::time::Duration;

use tracing::debug;

use crate::util::SYSFS_PATH;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

fn module_dir(root: &Path, name: &str) -> std::path::PathBuf {
    root.join("module").join(name)
}

/// Read `/sys/module/<name>/initstate`. Returns `None` if the module isn't
/// present in sysfs at all (already unloaded, or never loaded).
pub fn read_initstate(root: &Path, name: &str) -> Option<String> {
    std::fs::read_to_string(module_dir(root, name).join("initstate"))
        .ok()
        .map(|s| s.trim().to_owned())
}

pub fn read_refcnt(root: &Path, name: &str) -> Option<u32> {
    std::fs::read_to_string(module_dir(root, name).join("refcnt"))
        .ok()
        .and_then(|s| s.trim().parse().ok())
}

/// Busy-wait until `initstate` reports `live`, sleeping [`POLL_INTERVAL`]
/// between reads. Has no timeout: a module's `init()` can legitimately run
/// for as long as it needs, and cancellation isn't supported, so the only
/// way out short of going live is the module disappearing from sysfs
/// entirely.
///
/// A freshly-inserted module briefly reports `coming` while its `init()`
/// runs; callers that need to act on a module only once it's fully live
/// (e.g. before probing its parameters) should wait here first.
pub fn wait_until_live(root: &Path, name: &str) -> bool {
    loop {
        match read_initstate(root, name).as_deref() {
            Some("live") => return true,
            Some(other) => debug!(module = name, state = other, "waiting for module to go live"),
            None => return false,
        }
        thread::sleep(POLL_INTERVAL);
    }
}

/// Path prefix modprobe uses by default; overridable for tests against a
/// fake sysfs tree.
pub fn default_sysfs_root() -> &'static Path {
    Path::new(SYSFS_PATH)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn reads_initstate_and_refcnt() {
        let dir = tempfile::tempdir().unwrap();
        let mdir = dir.path().join("module/foo");
        fs::create_dir_all(&mdir).unwrap();
        fs::write(mdir.join("initstate"), "live\n").unwrap();
        fs::write(mdir.join("refcnt"), "2\n").unwrap();

        assert_eq!(read_initstate(dir.path(), "foo"), Some("live".to_owned()));
        assert_eq!(read_refcnt(dir.path(), "foo"), Some(2));
    }

    #[test]
    fn missing_module_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(read_initstate(dir.path(), "nonexistent"), None);
    }

    #[test]
    fn wait_until_live_returns_immediately_when_already_live() {
        let dir = tempfile::tempdir().unwrap();
        let mdir = dir.path().join("module/foo");
        fs::create_dir_all(&mdir).unwrap();
        fs::write(mdir.join("initstate"), "live").unwrap();
        assert!(wait_until_live(dir.path(), "foo"));
    }
}
