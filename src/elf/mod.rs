//! Byte-exact reader for 32/64-bit ELF kernel module objects, either
//! endianness.
//!
//! This is the only place in the crate allowed to interpret the raw bytes of
//! a `.ko` file. Every other component consumes the typed string sets and
//! section views this module produces.
//!
//! A purpose-built reader is used here rather than a general ELF crate: the
//! resolver needs in-place section mutation (`strip_section`) and exact
//! control over endian-conditional reads, neither of which a read-only ELF
//! parsing crate exposes cleanly.

pub mod consts;
pub mod error;

use consts::*;
pub use error::{ElfError, Result};

/// Word size of a parsed module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Class {
    Elf32,
    Elf64,
}

impl Class {
    fn word_size(self) -> usize {
        match self {
            Class::Elf32 => 4,
            Class::Elf64 => 8,
        }
    }

    fn ehdr_size(self) -> usize {
        match self {
            Class::Elf32 => EHDR32_SIZE,
            Class::Elf64 => EHDR64_SIZE,
        }
    }

    fn shdr_size(self) -> usize {
        match self {
            Class::Elf32 => SHDR32_SIZE,
            Class::Elf64 => SHDR64_SIZE,
        }
    }

    fn sym_size(self) -> usize {
        match self {
            Class::Elf32 => SYM32_SIZE,
            Class::Elf64 => SYM64_SIZE,
        }
    }
}

/// Strength of an undefined symbol reference, derived from `ST_BIND`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SymKind {
    Strong,
    Weak,
}

/// One section header, as decoded fields (not a view into the buffer).
#[derive(Debug, Clone, Copy)]
struct Section {
    name_off: u32,
    sh_type: u32,
    /// Byte offset, within the section header, of the `sh_flags` field.
    /// Used by [`strip_section_in_place`] to flip `SHF_ALLOC` without a
    /// second parse.
    flags_field_offset: usize,
    flags: u64,
    offset: u64,
    size: u64,
}

/// A parsed view over one ELF module's bytes.
///
/// Borrows the underlying buffer; does not copy section contents.
#[derive(Debug)]
pub struct ElfView<'a> {
    data: &'a [u8],
    class: Class,
    /// True if the file's recorded endianness differs from the host's.
    swap: bool,
    e_machine: u16,
    sections: Vec<Section>,
    shstrtab_offset: u64,
    shstrtab_size: u64,
}

fn get(data: &[u8], off: usize, len: usize) -> Result<&[u8]> {
    data.get(off..off + len).ok_or(ElfError::Truncated)
}

fn read_u16(data: &[u8], off: usize, swap: bool) -> Result<u16> {
    let b: [u8; 2] = get(data, off, 2)?.try_into().unwrap();
    let v = u16::from_ne_bytes(b);
    Ok(if swap { v.swap_bytes() } else { v })
}

fn read_u32(data: &[u8], off: usize, swap: bool) -> Result<u32> {
    let b: [u8; 4] = get(data, off, 4)?.try_into().unwrap();
    let v = u32::from_ne_bytes(b);
    Ok(if swap { v.swap_bytes() } else { v })
}

fn read_u64(data: &[u8], off: usize, swap: bool) -> Result<u64> {
    let b: [u8; 8] = get(data, off, 8)?.try_into().unwrap();
    let v = u64::from_ne_bytes(b);
    Ok(if swap { v.swap_bytes() } else { v })
}

/// Read a word-sized (4 or 8 byte) unsigned integer, widened to `u64`.
fn read_word(data: &[u8], off: usize, class: Class, swap: bool) -> Result<u64> {
    match class {
        Class::Elf32 => read_u32(data, off, swap).map(u64::from),
        Class::Elf64 => read_u64(data, off, swap),
    }
}

fn cstr_at(data: &[u8], off: usize) -> &str {
    let rest = &data[off.min(data.len())..];
    let end = rest.iter().position(|&b| b == 0).unwrap_or(rest.len());
    std::str::from_utf8(&rest[..end]).unwrap_or("")
}

impl<'a> ElfView<'a> {
    /// Parse the ELF header and section header table of `data`.
    ///
    /// Validates the `\x7fELF` magic and that the section-header table and
    /// string-table section do not extend past the buffer.
    pub fn open(data: &'a [u8]) -> Result<Self> {
        if data.len() < 16 {
            return Err(ElfError::Truncated);
        }
        if data[0..4] != ELF_MAGIC {
            return Err(ElfError::NotElf);
        }

        let class = match data[EI_CLASS] {
            ELFCLASS32 => Class::Elf32,
            ELFCLASS64 => Class::Elf64,
            other => return Err(ElfError::UnknownClass(other)),
        };

        let file_is_little = match data[EI_DATA] {
            ELFDATA2LSB => true,
            ELFDATA2MSB => false,
            other => return Err(ElfError::UnknownEndian(other)),
        };
        let swap = file_is_little != crate::util::host_is_little_endian();

        if data.len() < class.ehdr_size() {
            return Err(ElfError::Truncated);
        }

        let e_machine = read_u16(data, 18, swap)?;

        let (e_shoff, e_shnum, e_shstrndx) = match class {
            Class::Elf32 => (
                read_word(data, 32, class, swap)?,
                read_u16(data, 48, swap)? as u64,
                read_u16(data, 50, swap)? as u64,
            ),
            Class::Elf64 => (
                read_word(data, 40, class, swap)?,
                read_u16(data, 60, swap)? as u64,
                read_u16(data, 62, swap)? as u64,
            ),
        };

        let shdr_size = class.shdr_size() as u64;
        let shtab_end = e_shoff
            .checked_add(e_shnum.checked_mul(shdr_size).ok_or(ElfError::Truncated)?)
            .ok_or(ElfError::Truncated)?;
        if shtab_end > data.len() as u64 {
            return Err(ElfError::SectionHeadersTruncated);
        }

        let mut sections = Vec::with_capacity(e_shnum as usize);
        for i in 0..e_shnum {
            let base = e_shoff as usize + (i as usize) * class.shdr_size();
            let sec = Self::read_shdr(data, base, class, swap)?;
            sections.push(sec);
        }

        let (shstrtab_offset, shstrtab_size) = if sections.is_empty() {
            (0, 0)
        } else {
            if e_shstrndx >= sections.len() as u64 {
                return Err(ElfError::BadShstrndx(e_shstrndx as u16));
            }
            let shstrtab = &sections[e_shstrndx as usize];
            let (offset, size) = (shstrtab.offset, shstrtab.size);
            if offset
                .checked_add(size)
                .map(|end| end > data.len() as u64)
                .unwrap_or(true)
            {
                return Err(ElfError::SectionHeadersTruncated);
            }
            (offset, size)
        };

        Ok(Self {
            data,
            class,
            swap,
            e_machine,
            sections,
            shstrtab_offset,
            shstrtab_size,
        })
    }

    fn read_shdr(data: &[u8], base: usize, class: Class, swap: bool) -> Result<Section> {
        let name_off = read_u32(data, base, swap)?;
        let sh_type = read_u32(data, base + 4, swap)?;
        let (flags_field_offset, flags, offset, size);
        match class {
            Class::Elf32 => {
                flags_field_offset = base + 8;
                flags = read_word(data, base + 8, class, swap)?;
                offset = read_word(data, base + 16, class, swap)?;
                size = read_word(data, base + 20, class, swap)?;
            }
            Class::Elf64 => {
                flags_field_offset = base + 8;
                flags = read_word(data, base + 8, class, swap)?;
                offset = read_word(data, base + 24, class, swap)?;
                size = read_word(data, base + 32, class, swap)?;
            }
        }
        Ok(Section {
            name_off,
            sh_type,
            flags_field_offset,
            flags,
            offset,
            size,
        })
    }

    fn section_name(&self, sec: &Section) -> &'a str {
        cstr_at(self.data, (self.shstrtab_offset + sec.name_off as u64) as usize)
    }

    fn find_section(&self, name: &str) -> Option<&Section> {
        self.sections.iter().find(|s| self.section_name(s) == name)
    }

    /// Linear scan of section headers; first match by name.
    ///
    /// Returns `None` both when the section is absent and when its data
    /// lives in `SHT_NOBITS` (BSS) — e.g. an empty device table on recent
    /// compilers, which has no backing bytes in the file.
    pub fn load_section(&self, name: &str) -> Option<&'a [u8]> {
        let sec = self.find_section(name)?;
        if sec.sh_type == SHT_NOBITS {
            return None;
        }
        let start = sec.offset as usize;
        let end = start.checked_add(sec.size as usize)?;
        self.data.get(start..end)
    }

    /// Iterate the NUL-terminated byte-string records inside section
    /// `section_name`, skipping leading NUL padding, interning each
    /// non-empty record.
    pub fn load_strings(&self, section_name: &str) -> Vec<String> {
        let Some(mut data) = self.load_section(section_name) else {
            return Vec::new();
        };
        while data.first() == Some(&0) {
            data = &data[1..];
        }
        let mut out = Vec::new();
        for chunk in data.split(|&b| b == 0) {
            if !chunk.is_empty() {
                out.push(String::from_utf8_lossy(chunk).into_owned());
            }
        }
        out
    }

    /// Exported symbol names.
    ///
    /// Prefers the new-style `__ksymtab_strings`/`__ksymtab_strings_gpl`
    /// sections; falls back to the legacy `__ksymtab`/`__gpl_ksymtab`
    /// sections, which are arrays of fixed 64-byte records
    /// `{value, name[64-ptrsize]}`.
    pub fn load_symbols(&self) -> Vec<String> {
        let mut new_style = self.load_strings("__ksymtab_strings");
        if !new_style.is_empty() {
            new_style.extend(self.load_strings("__ksymtab_strings_gpl"));
            return new_style;
        }

        let word = self.class.word_size();
        let record = 64usize;
        let mut out = Vec::new();
        for secname in ["__ksymtab", "__gpl_ksymtab"] {
            if let Some(data) = self.load_section(secname) {
                for rec in data.chunks_exact(record) {
                    let name_bytes = &rec[word..];
                    let end = name_bytes.iter().position(|&b| b == 0).unwrap_or(name_bytes.len());
                    if end > 0 {
                        out.push(String::from_utf8_lossy(&name_bytes[..end]).into_owned());
                    }
                }
            }
        }
        out
    }

    /// Undefined (imported) symbols from `.symtab`, with strong/weak kind.
    ///
    /// On SPARC/SPARCV9, `STT_REGISTER` symbols are skipped: they are
    /// asm-global register reservations, not real imports.
    pub fn load_dep_syms(&self) -> Result<Vec<(String, SymKind)>> {
        let Some(strtab) = self.load_section(".strtab") else {
            return Ok(Vec::new());
        };
        let Some(symtab) = self.load_section(".symtab") else {
            return Ok(Vec::new());
        };

        let handle_register_symbols = self.e_machine == EM_SPARC || self.e_machine == EM_SPARCV9;
        let sym_size = self.class.sym_size();

        let mut out = Vec::new();
        for (i, rec) in symtab.chunks_exact(sym_size).enumerate() {
            if i == 0 {
                continue; // index 0 is always the null symbol
            }
            let (st_name, st_info, st_shndx) = self.read_sym_fields(rec)?;
            if st_shndx != SHN_UNDEF {
                continue;
            }
            if handle_register_symbols && st_type(st_info) == STT_REGISTER {
                continue;
            }
            let name = cstr_at(strtab, st_name as usize);
            if name.is_empty() {
                continue;
            }
            let kind = if st_bind(st_info) == STB_WEAK {
                SymKind::Weak
            } else {
                SymKind::Strong
            };
            out.push((name.to_owned(), kind));
        }
        Ok(out)
    }

    fn read_sym_fields(&self, rec: &[u8]) -> Result<(u32, u8, u16)> {
        Ok(match self.class {
            Class::Elf32 => {
                let st_name = read_u32(rec, 0, self.swap)?;
                let st_info = rec[12];
                let st_shndx = read_u16(rec, 14, self.swap)?;
                (st_name, st_info, st_shndx)
            }
            Class::Elf64 => {
                let st_name = read_u32(rec, 0, self.swap)?;
                let st_info = rec[4];
                let st_shndx = read_u16(rec, 6, self.swap)?;
                (st_name, st_info, st_shndx)
            }
        })
    }

    fn read_sym_value_size(&self, rec: &[u8]) -> Result<(u64, u64)> {
        Ok(match self.class {
            Class::Elf32 => {
                let st_value = read_u32(rec, 4, self.swap)? as u64;
                let st_size = read_u32(rec, 8, self.swap)? as u64;
                (st_value, st_size)
            }
            Class::Elf64 => {
                let st_value = read_u64(rec, 8, self.swap)?;
                let st_size = read_u64(rec, 16, self.swap)?;
                (st_value, st_size)
            }
        })
    }

    /// Locate a *defined* symbol by name in `.symtab` and return the raw
    /// bytes of its backing section at `[st_value, st_value + st_size)`.
    ///
    /// `MODULE_DEVICE_TABLE` expands to a symbol like
    /// `__mod_pci_device_table` rather than its own named section, so
    /// finding one means dereferencing through the symbol table and then
    /// the section header table, the same way [`Self::load_dep_syms`]
    /// dereferences undefined symbols — just landing on a defined one
    /// instead. Returns `None` if the symbol, its section, or its section's
    /// bytes can't be found.
    pub fn device_table_symbol(&self, name: &str) -> Option<&'a [u8]> {
        let strtab = self.load_section(".strtab")?;
        let symtab = self.load_section(".symtab")?;
        let sym_size = self.class.sym_size();

        for rec in symtab.chunks_exact(sym_size) {
            let (st_name, _st_info, st_shndx) = self.read_sym_fields(rec).ok()?;
            if st_shndx == SHN_UNDEF || st_shndx as usize >= self.sections.len() {
                continue;
            }
            if cstr_at(strtab, st_name as usize) != name {
                continue;
            }
            let (st_value, st_size) = self.read_sym_value_size(rec).ok()?;
            let section = &self.sections[st_shndx as usize];
            let start = section.offset.checked_add(st_value)?;
            let end = start.checked_add(st_size)?;
            return self.data.get(start as usize..end as usize);
        }
        None
    }

    /// `.modalias` section, as NUL-separated strings.
    pub fn get_aliases(&self) -> Vec<String> {
        self.load_strings(".modalias")
    }

    /// `.modinfo` section, as NUL-separated `tag=value` strings.
    pub fn get_modinfo(&self) -> Vec<String> {
        self.load_strings(".modinfo")
    }

    /// Read `__versions` as an array of `{crc: word, name: char[64-word]}`.
    ///
    /// Returns an error if the section size is not a multiple of the
    /// record size (64 bytes).
    pub fn dump_modvers(&self) -> Result<Vec<(u64, String)>> {
        let Some(data) = self.load_section("__versions") else {
            return Ok(Vec::new());
        };
        if data.len() % 64 != 0 {
            return Err(ElfError::BadModversSize);
        }
        let word = self.class.word_size();
        let mut out = Vec::new();
        for rec in data.chunks_exact(64) {
            let crc = read_word(rec, 0, self.class, self.swap)?;
            let name_bytes = &rec[word..];
            let end = name_bytes.iter().position(|&b| b == 0).unwrap_or(name_bytes.len());
            let name = String::from_utf8_lossy(&name_bytes[..end]).into_owned();
            out.push((crc, skip_dot(&name).to_owned()));
        }
        Ok(out)
    }

    pub fn class(&self) -> Class {
        self.class
    }

    pub fn is_swapped(&self) -> bool {
        self.swap
    }

    pub fn machine(&self) -> u16 {
        self.e_machine
    }
}

/// PPC64 convention: a name beginning with `.` matches without the leading
/// dot.
pub fn skip_dot(name: &str) -> &str {
    name.strip_prefix('.').unwrap_or(name)
}

/// Clear the `SHF_ALLOC` bit of section `name`'s header, in place.
///
/// Used when `--force-modversion`/`--force-vermagic` asks the kernel to
/// ignore a section it would otherwise refuse to load with. Operates with
/// the buffer's own endianness; re-parses headers from `buf` since the
/// caller holds the only mutable borrow.
pub fn strip_section_in_place(buf: &mut [u8], name: &str) -> Result<bool> {
    let (flags_field_offset, class, swap, flags) = {
        let view = ElfView::open(buf)?;
        let Some(sec) = view.find_section(name) else {
            return Ok(false);
        };
        (sec.flags_field_offset, view.class, view.swap, sec.flags)
    };

    let new_flags = flags & !SHF_ALLOC;
    match class {
        Class::Elf32 => {
            let v = new_flags as u32;
            let v = if swap { v.swap_bytes() } else { v };
            buf[flags_field_offset..flags_field_offset + 4].copy_from_slice(&v.to_ne_bytes());
        }
        Class::Elf64 => {
            let v = if swap { new_flags.swap_bytes() } else { new_flags };
            buf[flags_field_offset..flags_field_offset + 8].copy_from_slice(&v.to_ne_bytes());
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build a minimal, valid little-endian 64-bit ELF object with a named
    /// section containing `payload`, for reader tests.
    fn build_elf64(sections: &[(&str, &[u8])]) -> Vec<u8> {
        let mut shstrtab = vec![0u8]; // index 0 is the empty string
        let mut names = Vec::new();
        for (name, _) in sections {
            names.push(shstrtab.len() as u32);
            shstrtab.extend_from_slice(name.as_bytes());
            shstrtab.push(0);
        }
        let shstrtab_name_off = shstrtab.len() as u32;
        shstrtab.extend_from_slice(b".shstrtab\0");

        let mut buf = vec![0u8; EHDR64_SIZE];
        buf[0..4].copy_from_slice(&ELF_MAGIC);
        buf[EI_CLASS] = ELFCLASS64;
        buf[EI_DATA] = ELFDATA2LSB;

        let mut body = Vec::new();
        let mut offsets = Vec::new();
        for (_, data) in sections {
            offsets.push(EHDR64_SIZE + body.len());
            body.extend_from_slice(data);
        }
        let shstrtab_offset = EHDR64_SIZE + body.len();
        body.extend_from_slice(&shstrtab);

        let shoff = EHDR64_SIZE + body.len();
        let shnum = sections.len() + 2; // null section + sections + shstrtab
        let shstrndx = shnum - 1;

        buf.extend_from_slice(&body);

        // null section header
        buf.extend_from_slice(&[0u8; SHDR64_SIZE]);
        for (i, (_, data)) in sections.iter().enumerate() {
            let mut shdr = [0u8; SHDR64_SIZE];
            shdr[0..4].copy_from_slice(&names[i].to_le_bytes());
            shdr[4..8].copy_from_slice(&1u32.to_le_bytes()); // SHT_PROGBITS
            shdr[24..32].copy_from_slice(&(offsets[i] as u64).to_le_bytes());
            shdr[32..40].copy_from_slice(&(data.len() as u64).to_le_bytes());
            buf.extend_from_slice(&shdr);
        }
        let mut shstrtab_shdr = [0u8; SHDR64_SIZE];
        shstrtab_shdr[0..4].copy_from_slice(&shstrtab_name_off.to_le_bytes());
        shstrtab_shdr[4..8].copy_from_slice(&3u32.to_le_bytes()); // SHT_STRTAB
        shstrtab_shdr[24..32].copy_from_slice(&(shstrtab_offset as u64).to_le_bytes());
        shstrtab_shdr[32..40].copy_from_slice(&(shstrtab.len() as u64).to_le_bytes());
        buf.extend_from_slice(&shstrtab_shdr);

        buf[18..20].copy_from_slice(&0u16.to_le_bytes()); // e_machine
        buf[40..48].copy_from_slice(&(shoff as u64).to_le_bytes()); // e_shoff
        buf[60..62].copy_from_slice(&(shnum as u16).to_le_bytes()); // e_shnum
        buf[62..64].copy_from_slice(&(shstrndx as u16).to_le_bytes()); // e_shstrndx

        buf
    }

    #[test]
    fn rejects_bad_magic() {
        let buf = vec![0u8; 64];
        assert_eq!(ElfView::open(&buf).unwrap_err(), ElfError::NotElf);
    }

    #[test]
    fn rejects_truncated() {
        let buf = vec![0x7f, b'E', b'L', b'F'];
        assert_eq!(ElfView::open(&buf).unwrap_err(), ElfError::Truncated);
    }

    #[test]
    fn loads_modinfo_section() {
        let buf = build_elf64(&[(".modinfo", b"license=GPL\0author=me\0")]);
        let view = ElfView::open(&buf).unwrap();
        let info = view.get_modinfo();
        assert_eq!(info, vec!["license=GPL", "author=me"]);
    }

    #[test]
    fn missing_section_is_none() {
        let buf = build_elf64(&[(".modinfo", b"x=y\0")]);
        let view = ElfView::open(&buf).unwrap();
        assert!(view.load_section(".nonexistent").is_none());
    }

    #[test]
    fn strip_section_clears_alloc_flag() {
        let buf = build_elf64(&[(".foo", b"data")]);
        // Manually mark .foo SHF_ALLOC in our helper's raw shdr before strip.
        // The builder above doesn't set flags, so emulate a set-then-clear
        // round trip by setting flags directly then stripping.
        let mut buf = buf;
        {
            let view = ElfView::open(&buf).unwrap();
            let sec = view.find_section(".foo").unwrap();
            let off = sec.flags_field_offset;
            buf[off..off + 8].copy_from_slice(&(SHF_ALLOC).to_le_bytes());
        }
        assert!(strip_section_in_place(&mut buf, ".foo").unwrap());
        let view = ElfView::open(&buf).unwrap();
        let sec = view.find_section(".foo").unwrap();
        assert_eq!(sec.flags & SHF_ALLOC, 0);
    }

    #[test]
    fn device_table_symbol_dereferences_through_symtab() {
        let device_table = b"\x01\x02\x03\x04\x05\x06\x07\x08";
        let strtab = b"\0__mod_pci_device_table\0";
        let name_off = 1u32; // past the leading NUL

        // Two records: the mandatory null symbol, then one defined symbol
        // pointing at `.data`'s first 8 bytes (section index 1).
        let mut symtab = vec![0u8; SYM64_SIZE];
        let mut rec = vec![0u8; SYM64_SIZE];
        rec[0..4].copy_from_slice(&name_off.to_le_bytes()); // st_name
        rec[4] = 0x11; // st_info: STB_GLOBAL/STT_OBJECT, irrelevant here
        rec[6..8].copy_from_slice(&1u16.to_le_bytes()); // st_shndx -> .data
        rec[8..16].copy_from_slice(&0u64.to_le_bytes()); // st_value
        rec[16..24].copy_from_slice(&(device_table.len() as u64).to_le_bytes()); // st_size
        symtab.extend_from_slice(&rec);

        let buf = build_elf64(&[(".data", device_table), (".symtab", &symtab), (".strtab", strtab)]);
        let view = ElfView::open(&buf).unwrap();

        assert_eq!(
            view.device_table_symbol("__mod_pci_device_table"),
            Some(&device_table[..])
        );
        assert_eq!(view.device_table_symbol("__mod_usb_device_table"), None);
    }

    #[test]
    fn skip_dot_strips_leading_dot() {
        assert_eq!(skip_dot(".foo"), "foo");
        assert_eq!(skip_dot("foo"), "foo");
    }
}
