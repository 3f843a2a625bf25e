//! Interface to kernel module files on disk: `.modinfo` parsing, parameter
//! descriptions, and loading a module's bytes into the kernel.
//!
//! Decompression of `.ko.gz`/`.ko.xz`/`.ko.zst` modules and signature
//! verification are out of scope here — both require pulling in a
//! decompression/crypto stack this crate otherwise has no use for. A
//! compressed module's extension is still recognized (so callers get a
//! clear [`error::ModInfoError::Compression`] instead of a parse failure),
//! it just isn't decompressed.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tracing::debug;
use walkdir::WalkDir;

use crate::elf::ElfView;
use crate::module::Module;
use crate::util::{filename2modname, underscore_eq, MODULE_PATH};

/// Marker the kernel appends after a module's ELF image when it carries a
/// detached signature. Detected so [`ModInfo`] can report a module as
/// signed without attempting to verify the signature.
const SIGNATURE_MAGIC: &[u8] = b"~Module signature appended~\n";

/// Recognized (but, beyond extension matching, unsupported) compression
/// schemes.
const VALID_COMPRESSION: &[&str] = &["xz", "zst", "gz"];

pub mod error {
    use std::path::PathBuf;

    use displaydoc::Display;
    use thiserror::Error;

    use crate::elf::ElfError;
    use crate::module::FromNameError as ModuleFromNameError;
    use crate::modprobe::KernelOpError;

    #[derive(Debug, Display, Error)]
    #[non_exhaustive]
    pub enum FromPathError {
        /// I/O error reading `{0}`: {1}
        Io(PathBuf, std::io::Error),
        /// {0}
        ModInfo(#[from] ModInfoError),
    }

    #[derive(Debug, Display, Error)]
    #[non_exhaustive]
    pub enum FromNameError {
        /// module `{0}` not found
        NotFound(String),
        /// {0}
        Kernel(#[from] ModuleFromNameError),
        /// {0}
        ModInfo(#[from] ModInfoError),
        /// I/O error: {0}
        Io(#[from] std::io::Error),
    }

    #[derive(Debug, Display, Error)]
    #[non_exhaustive]
    pub enum ModInfoError {
        /// module invalid or corrupt: {0}
        InvalidModule(#[from] ElfError),
        /// module is missing a `.modinfo` section
        MissingInfo,
        /// module is compressed with `{0}`, which this build cannot decompress
        Compression(String),
        /// invalid UTF-8 in modinfo tag `{0}`
        InvalidUtf8(String),
    }

    #[derive(Debug, Display, Error)]
    #[non_exhaustive]
    pub enum LoadError {
        /// I/O error reading module: {0}
        Io(#[from] std::io::Error),
        /// {0}
        Kernel(#[from] KernelOpError),
    }

    pub type Result<T, E = ModInfoError> = std::result::Result<T, E>;
}

use error::{FromNameError, FromPathError, LoadError, ModInfoError, Result};

/// The declared type of a `module_param` (or `module_param_named`),
/// mirroring the kernel's own parameter type tags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParameterType {
    Byte,
    HexInt,
    Short,
    UnsignedShort,
    Int,
    UnsignedInt,
    Long,
    UnsignedLong,
    UnsignedLongLong,
    CharPointer,
    Bool,
    InvBool,
    String,
    Unknown,
    Custom(String),
}

impl From<&str> for ParameterType {
    fn from(s: &str) -> Self {
        match s {
            "byte" => Self::Byte,
            "hexint" => Self::HexInt,
            "short" => Self::Short,
            "ushort" => Self::UnsignedShort,
            "int" => Self::Int,
            "uint" => Self::UnsignedInt,
            "long" => Self::Long,
            "ulong" => Self::UnsignedLong,
            "ullong" => Self::UnsignedLongLong,
            "charp" => Self::CharPointer,
            "bool" => Self::Bool,
            "invbool" => Self::InvBool,
            "string" => Self::String,
            "" => Self::Unknown,
            s => Self::Custom(s.to_owned()),
        }
    }
}

/// One `module_param` entry parsed out of `.modinfo`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleParameter {
    name: String,
    ty: ParameterType,
    description: String,
}

impl ModuleParameter {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ty(&self) -> &ParameterType {
        &self.ty
    }

    pub fn description(&self) -> &str {
        &self.description
    }
}

/// Parsed `.modinfo` tags for one module.
#[derive(Debug, Clone, Default)]
pub struct ModInfo {
    alias: Vec<String>,
    soft_dependencies: Vec<String>,
    license: String,
    authors: Vec<String>,
    description: String,
    version: String,
    firmware: Vec<String>,
    version_magic: String,
    name: String,
    in_tree: bool,
    retpoline: bool,
    staging: bool,
    dependencies: Vec<String>,
    source_checksum: String,
    parameters: Vec<ModuleParameter>,
    signed: bool,
    imports: Vec<String>,
}

impl ModInfo {
    pub fn source_checksum(&self) -> &str {
        &self.source_checksum
    }

    pub fn staging(&self) -> bool {
        self.staging
    }

    pub fn retpoline(&self) -> bool {
        self.retpoline
    }

    pub fn in_tree(&self) -> bool {
        self.in_tree
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version_magic(&self) -> &str {
        &self.version_magic
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn authors(&self) -> &[String] {
        &self.authors
    }

    pub fn license(&self) -> &str {
        &self.license
    }

    pub fn firmware(&self) -> &[String] {
        &self.firmware
    }

    pub fn alias(&self) -> &[String] {
        &self.alias
    }

    pub fn soft_dependencies(&self) -> &[String] {
        &self.soft_dependencies
    }

    pub fn dependencies(&self) -> &[String] {
        &self.dependencies
    }

    pub fn parameters(&self) -> &[ModuleParameter] {
        &self.parameters
    }

    /// Whether a (unverified) signature trailer is present.
    pub fn signed(&self) -> bool {
        self.signed
    }

    pub fn imports(&self) -> &[String] {
        &self.imports
    }

    /// Parse every `tag=value` record from a `.modinfo` section.
    fn from_tags(tags: &[String]) -> Result<Self> {
        let mut info = ModInfo::default();
        // name -> (type, description), joined once both module_param and
        // parm tags for the same name have been seen.
        let mut param_types: HashMap<String, ParameterType> = HashMap::new();
        let mut param_descs: HashMap<String, String> = HashMap::new();
        let mut param_order: Vec<String> = Vec::new();

        for tag in tags {
            let Some((key, value)) = tag.split_once('=') else {
                continue;
            };
            match key {
                "alias" => info.alias.push(value.to_owned()),
                "softdep" => info.soft_dependencies.push(value.to_owned()),
                "license" => info.license = value.to_owned(),
                "author" => info.authors.push(value.to_owned()),
                "description" => info.description = value.to_owned(),
                "version" => info.version = value.to_owned(),
                "firmware" => info.firmware.push(value.to_owned()),
                "vermagic" => info.version_magic = value.to_owned(),
                "name" => info.name = value.to_owned(),
                "intree" => info.in_tree = true,
                "retpoline" => info.retpoline = true,
                "staging" => info.staging = true,
                "depends" => {
                    info.dependencies
                        .extend(value.split(',').filter(|s| !s.is_empty()).map(str::to_owned));
                }
                "srcversion" => info.source_checksum = value.to_owned(),
                "import_ns" => info.imports.push(value.to_owned()),
                "parmtype" => {
                    let (name, ty) = value.split_once(':').unwrap_or((value, ""));
                    if !param_order.contains(&name.to_owned()) {
                        param_order.push(name.to_owned());
                    }
                    param_types.insert(name.to_owned(), ParameterType::from(ty));
                }
                "parm" => {
                    let (name, desc) = value.split_once(':').unwrap_or((value, ""));
                    if !param_order.contains(&name.to_owned()) {
                        param_order.push(name.to_owned());
                    }
                    param_descs.insert(name.to_owned(), desc.to_owned());
                }
                _ => {}
            }
        }

        for name in param_order {
            info.parameters.push(ModuleParameter {
                ty: param_types.get(&name).cloned().unwrap_or(ParameterType::Unknown),
                description: param_descs.get(&name).cloned().unwrap_or_default(),
                name,
            });
        }

        Ok(info)
    }
}

/// A module file on disk: its path plus parsed `.modinfo`.
#[derive(Debug)]
pub struct ModuleFile {
    path: PathBuf,
    info: ModInfo,
}

impl ModuleFile {
    /// Locate and parse the module named `name` for the running kernel.
    pub fn from_name(name: &str) -> Result<Self, FromNameError> {
        let uts = nix::sys::utsname::uname().map_err(|_| FromNameError::NotFound(name.to_owned()))?;
        Self::from_name_with_uname(name, uts.release())
    }

    /// Same as [`Self::from_name`], for an arbitrary kernel release
    /// (useful for depmod-style cross-kernel tooling).
    pub fn from_name_with_uname(name: &str, uname: &str) -> Result<Self, FromNameError> {
        let base = Path::new(MODULE_PATH).join(uname);
        for entry in WalkDir::new(&base).into_iter().filter_map(|e| e.ok()) {
            if !entry.file_type().is_file() {
                continue;
            }
            let fname = entry.file_name().to_string_lossy();
            if underscore_eq(&filename2modname(&fname), name) {
                return Self::from_path(entry.path()).map_err(|e| match e {
                    FromPathError::Io(_, io_err) => FromNameError::Io(io_err),
                    FromPathError::ModInfo(mod_info_err) => FromNameError::ModInfo(mod_info_err),
                });
            }
        }
        Err(FromNameError::NotFound(name.to_owned()))
    }

    /// Parse the module file at `path` directly.
    pub fn from_path(path: &Path) -> Result<Self, FromPathError> {
        let bytes = std::fs::read(path).map_err(|e| FromPathError::Io(path.to_path_buf(), e))?;
        let info = parse_modinfo(path, &bytes)?;
        Ok(Self {
            path: path.to_path_buf(),
            info,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn info(&self) -> &ModInfo {
        &self.info
    }

    /// Load this module into the running kernel with `parameter` as the
    /// (already-formatted) `key=value key=value` parameter string.
    pub fn load(&self, parameter: &str) -> Result<Module, LoadError> {
        let bytes = std::fs::read(&self.path)?;
        let kernel = crate::modprobe::NixKernelOps;
        crate::modprobe::KernelModuleOps::insmod(&kernel, &self.info.name, &bytes, parameter)?;
        debug!(module = %self.info.name, "loaded module");
        Module::from_name(&self.info.name).map_err(|_| {
            // The kernel accepted the module but userspace can't yet see it
            // in sysfs; this is only possible under a very unlucky race
            // with module removal and is not worth a dedicated error
            // variant.
            LoadError::Io(std::io::Error::from(std::io::ErrorKind::NotFound))
        })
    }
}

fn compression_of(path: &Path) -> Option<&'static str> {
    let name = path.to_string_lossy();
    VALID_COMPRESSION
        .iter()
        .find(|ext| name.ends_with(&format!(".{ext}")))
        .copied()
}

fn parse_modinfo(path: &Path, bytes: &[u8]) -> Result<ModInfo> {
    if let Some(scheme) = compression_of(path) {
        return Err(ModInfoError::Compression(scheme.to_owned()));
    }

    let view = ElfView::open(bytes)?;
    let tags = view.get_modinfo();
    if tags.is_empty() {
        return Err(ModInfoError::MissingInfo);
    }

    let mut info = ModInfo::from_tags(&tags)?;
    info.signed = find_signature_trailer(bytes);
    Ok(info)
}

fn find_signature_trailer(bytes: &[u8]) -> bool {
    bytes.len() >= SIGNATURE_MAGIC.len() && bytes.ends_with(SIGNATURE_MAGIC)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parameter_type_parses_known_tags() {
        assert_eq!(ParameterType::from("charp"), ParameterType::CharPointer);
        assert_eq!(ParameterType::from("bogus"), ParameterType::Custom("bogus".to_owned()));
    }

    #[test]
    fn modinfo_groups_parm_and_parmtype_by_name() {
        let tags = vec![
            "parmtype=debug:bool".to_owned(),
            "parm=debug:enable debug output".to_owned(),
            "license=GPL".to_owned(),
        ];
        let info = ModInfo::from_tags(&tags).unwrap();
        assert_eq!(info.license(), "GPL");
        assert_eq!(info.parameters().len(), 1);
        assert_eq!(info.parameters()[0].name(), "debug");
        assert_eq!(*info.parameters()[0].ty(), ParameterType::Bool);
        assert_eq!(info.parameters()[0].description(), "enable debug output");
    }

    #[test]
    fn modinfo_collects_repeated_alias_and_depends() {
        let tags = vec![
            "alias=pci:v00001234*".to_owned(),
            "alias=pci:v00005678*".to_owned(),
            "depends=foo,bar".to_owned(),
        ];
        let info = ModInfo::from_tags(&tags).unwrap();
        assert_eq!(info.alias().len(), 2);
        assert_eq!(info.dependencies(), &["foo".to_owned(), "bar".to_owned()]);
    }

    #[test]
    fn compressed_extension_is_recognized() {
        assert_eq!(compression_of(Path::new("foo.ko.xz")), Some("xz"));
        assert_eq!(compression_of(Path::new("foo.ko")), None);
    }

    #[test]
    fn signature_trailer_detected() {
        let mut bytes = vec![0u8; 8];
        bytes.extend_from_slice(SIGNATURE_MAGIC);
        assert!(find_signature_trailer(&bytes));
        assert!(!find_signature_trailer(&[0u8; 8]));
    }
}
