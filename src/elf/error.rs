//! Errors for the ELF module reader

use displaydoc::Display;
use thiserror::Error;

/// Error type for [`crate::elf`]
#[derive(Debug, Display, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ElfError {
    /// file is too short to contain an ELF header
    Truncated,

    /// missing `\x7fELF` magic
    NotElf,

    /// unknown `EI_CLASS` byte {0}
    UnknownClass(u8),

    /// unknown `EI_DATA` byte {0}
    UnknownEndian(u8),

    /// section header table extends past the end of the file
    SectionHeadersTruncated,

    /// section name string table index {0} is out of range
    BadShstrndx(u16),

    /// section `{0}` extends past the end of the file
    SectionDataTruncated(String),

    /// `__versions` section size is not a multiple of the record size
    BadModversSize,

    /// a non-ASCII or otherwise invalid string was found in `{0}`
    InvalidString(&'static str),
}

pub type Result<T, E = ElfError> = std::result::Result<T, E>;
