//! Abstracts the two kernel module syscalls behind a trait, so the action
//! engine can be driven by a fake implementation in tests instead of
//! actually loading modules into a running kernel.

use std::ffi::CString;
use std::io;

use displaydoc::Display;
use nix::kmod::{delete_module, init_module, DeleteModuleFlags};
use thiserror::Error;

#[derive(Debug, Display, Error)]
#[non_exhaustive]
pub enum KernelOpError {
    /// kernel rejected loading `{0}`: {1}
    Insmod(String, io::Error),
    /// kernel rejected unloading `{0}`: {1}
    Rmmod(String, io::Error),
}

/// The two syscalls `insmod`/`rmmod` ultimately boil down to.
pub trait KernelModuleOps {
    /// Load `image` (the raw bytes of a `.ko` file) into the kernel,
    /// passing `param_values` (a space-separated `key=value` string, as
    /// the kernel's `init_module(2)` expects).
    fn insmod(&self, name: &str, image: &[u8], param_values: &str) -> Result<(), KernelOpError>;

    /// Unload the module named `name`. `force` maps to `O_TRUNC`.
    fn rmmod(&self, name: &str, force: bool) -> Result<(), KernelOpError>;
}

/// Real kernel operations, via `nix`'s `init_module(2)`/`delete_module(2)`
/// bindings.
#[derive(Debug, Default, Clone, Copy)]
pub struct NixKernelOps;

impl KernelModuleOps for NixKernelOps {
    fn insmod(&self, name: &str, image: &[u8], param_values: &str) -> Result<(), KernelOpError> {
        let params = CString::new(param_values).unwrap_or_default();
        init_module(image, &params)
            .map_err(|e| io::Error::from_raw_os_error(e as i32))
            .map_err(|e| KernelOpError::Insmod(name.to_owned(), e))
    }

    fn rmmod(&self, name: &str, force: bool) -> Result<(), KernelOpError> {
        let mut flags = DeleteModuleFlags::O_NONBLOCK;
        if force {
            flags |= DeleteModuleFlags::O_TRUNC;
        }
        let cname = CString::new(name).expect("module name had null bytes");
        delete_module(&cname, flags)
            .map_err(|e| io::Error::from_raw_os_error(e as i32))
            .map_err(|e| KernelOpError::Rmmod(name.to_owned(), e))
    }
}

/// In-memory fake for unit tests: records every call instead of touching
/// the real kernel, and lets a test preconfigure which names are "already
/// loaded" or should fail.
#[cfg(test)]
pub mod fake {
    use std::cell::RefCell;
    use std::collections::HashSet;
    use std::io;

    use super::*;

    #[derive(Debug, Default)]
    pub struct FakeKernelOps {
        pub loaded: RefCell<HashSet<String>>,
        pub fail_insmod: RefCell<HashSet<String>>,
        pub fail_rmmod: RefCell<HashSet<String>>,
        pub insmod_calls: RefCell<Vec<String>>,
        pub rmmod_calls: RefCell<Vec<String>>,
    }

    impl KernelModuleOps for FakeKernelOps {
        fn insmod(&self, name: &str, _image: &[u8], _param_values: &str) -> Result<(), KernelOpError> {
            self.insmod_calls.borrow_mut().push(name.to_owned());
            if self.fail_insmod.borrow().contains(name) {
                return Err(KernelOpError::Insmod(
                    name.to_owned(),
                    io::Error::from(io::ErrorKind::PermissionDenied),
                ));
            }
            self.loaded.borrow_mut().insert(name.to_owned());
            Ok(())
        }

        fn rmmod(&self, name: &str, _force: bool) -> Result<(), KernelOpError> {
            self.rmmod_calls.borrow_mut().push(name.to_owned());
            if self.fail_rmmod.borrow().contains(name) {
                return Err(KernelOpError::Rmmod(
                    name.to_owned(),
                    io::Error::from(io::ErrorKind::PermissionDenied),
                ));
            }
            self.loaded.borrow_mut().remove(name);
            Ok(())
        }
    }
}
