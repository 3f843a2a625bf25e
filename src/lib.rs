//! Kernel module dependency resolution: `depmod` and `modprobe`, as a
//! library plus two binaries.
//!
//! - [`elf`] reads the metadata (`.modinfo`, `.modalias`, exported and
//!   undefined symbols) out of a `.ko` file's ELF image.
//! - [`graph`] builds the dependency graph between modules and detects
//!   cycles.
//! - [`index`] is the on-disk trie format `modules.dep.bin`,
//!   `modules.alias.bin`, and `modules.symbols.bin` are stored in.
//! - [`config`] parses `depmod.conf`/`depmod.d` and
//!   `modprobe.conf`/`modprobe.d`.
//! - [`depmod`] walks a module tree and writes the output files above.
//! - [`modprobe`] resolves and loads (or unloads) a module and its
//!   dependencies at runtime.
//! - [`module`] and [`module_file`] are the lower-level runtime/on-disk
//!   module types the above are built on.
//!
//! Most of this requires `/sys` and `/proc` to exist and be the kernel's
//! real interfaces; see each module for the specific files it reads.

pub mod config;
pub mod depmod;
pub mod elf;
pub mod graph;
pub mod index;
pub mod module;
pub mod module_file;
pub mod modprobe;
pub mod util;
