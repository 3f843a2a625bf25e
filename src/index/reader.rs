//! Reads back the binary trie format written by [`super::writer`].
//!
//! `search` does an exact literal descent through the trie. `search_wild`
//! instead does a full [`dump`](IndexFile::dump) and glob-matches the
//! query against every stored key: stored keys may themselves contain
//! shell-style wildcards (alias directives write glob patterns verbatim),
//! so a literal trie descent cannot tell, partway down a wildcard
//! fragment, which branch the match will eventually take.

use displaydoc::Display;
use thiserror::Error;

use super::glob::glob_match;
use super::{INDEX_HEADER_SIZE, INDEX_MAGIC, INDEX_NODE_CHILDS, INDEX_NODE_MASK, INDEX_NODE_VALUES};
use super::{INDEX_VERSION_MAJOR, INDEX_VERSION_MINOR};

#[derive(Debug, Display, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum IndexError {
    /// file is too short to contain an index header
    Truncated,
    /// bad magic number {0:#010x}
    BadMagic(u32),
    /// unsupported index version {0}.{1}
    UnsupportedVersion(u16, u16),
    /// index data ends unexpectedly while reading offset {0}
    CorruptNode(usize),
}

type Result<T> = std::result::Result<T, IndexError>;

/// A parsed, read-only view over an index file's bytes.
pub struct IndexFile<'a> {
    data: &'a [u8],
    root_offset: usize,
}

struct ParsedNode<'a> {
    prefix: &'a str,
    /// `(priority, value)`, already sorted lowest-priority-number (highest
    /// priority) first by the writer.
    values: Vec<(i32, &'a str)>,
    /// `(first_byte, child_offset, flags)`.
    children: Vec<(u8, usize, u32)>,
}

fn read_u32(data: &[u8], off: usize) -> Result<u32> {
    let b: [u8; 4] = data
        .get(off..off + 4)
        .ok_or(IndexError::CorruptNode(off))?
        .try_into()
        .unwrap();
    Ok(u32::from_be_bytes(b))
}

fn read_u16(data: &[u8], off: usize) -> Result<u16> {
    let b: [u8; 2] = data
        .get(off..off + 2)
        .ok_or(IndexError::CorruptNode(off))?
        .try_into()
        .unwrap();
    Ok(u16::from_be_bytes(b))
}

impl<'a> IndexFile<'a> {
    pub fn parse(data: &'a [u8]) -> Result<Self> {
        if data.len() < INDEX_HEADER_SIZE {
            return Err(IndexError::Truncated);
        }
        let magic = read_u32(data, 0)?;
        if magic != INDEX_MAGIC {
            return Err(IndexError::BadMagic(magic));
        }
        let major = read_u16(data, 4)?;
        let minor = read_u16(data, 6)?;
        if major != INDEX_VERSION_MAJOR {
            return Err(IndexError::UnsupportedVersion(major, minor));
        }
        let root_offset = read_u32(data, 8)? as usize;
        Ok(Self { data, root_offset })
    }

    fn body(&self) -> &'a [u8] {
        &self.data[INDEX_HEADER_SIZE..]
    }

    fn parse_node(&self, offset: usize) -> Result<ParsedNode<'a>> {
        let body = self.body();
        let mut pos = offset;

        let plen = *body.get(pos).ok_or(IndexError::CorruptNode(offset))? as usize;
        pos += 1;
        let prefix_bytes = body.get(pos..pos + plen).ok_or(IndexError::CorruptNode(offset))?;
        let prefix = std::str::from_utf8(prefix_bytes).map_err(|_| IndexError::CorruptNode(offset))?;
        pos += plen;

        let nvalues = *body.get(pos).ok_or(IndexError::CorruptNode(offset))? as usize;
        pos += 1;
        let mut values = Vec::with_capacity(nvalues);
        for _ in 0..nvalues {
            let priority = read_u32(body, pos)? as i32;
            pos += 4;
            let vlen = read_u16(body, pos)? as usize;
            pos += 2;
            let vbytes = body.get(pos..pos + vlen).ok_or(IndexError::CorruptNode(offset))?;
            let value = std::str::from_utf8(vbytes).map_err(|_| IndexError::CorruptNode(offset))?;
            pos += vlen;
            values.push((priority, value));
        }

        let nchildren = *body.get(pos).ok_or(IndexError::CorruptNode(offset))? as usize;
        pos += 1;
        let mut children = Vec::with_capacity(nchildren);
        for _ in 0..nchildren {
            let first_byte = *body.get(pos).ok_or(IndexError::CorruptNode(offset))?;
            pos += 1;
            let tagged = read_u32(body, pos)?;
            pos += 4;
            let flags = tagged & !INDEX_NODE_MASK;
            let child_offset = (tagged & INDEX_NODE_MASK) as usize;
            children.push((first_byte, child_offset, flags));
        }

        Ok(ParsedNode { prefix, values, children })
    }

    /// Exact match: descend the trie consuming `key` one fragment at a
    /// time. Returns values in priority order: lowest priority number
    /// (highest priority) first.
    pub fn search(&self, key: &str) -> Vec<String> {
        let mut offset = self.root_offset;
        let mut remaining = key;
        loop {
            let Ok(node) = self.parse_node(offset) else {
                return Vec::new();
            };
            if !remaining.starts_with(node.prefix) {
                return Vec::new();
            }
            remaining = &remaining[node.prefix.len()..];
            if remaining.is_empty() {
                return node.values.iter().map(|(_, v)| (*v).to_owned()).collect();
            }
            let Some(&(_, child_offset, _)) = node
                .children
                .iter()
                .find(|(b, _, _)| *b == remaining.as_bytes()[0])
            else {
                return Vec::new();
            };
            offset = child_offset;
        }
    }

    /// Recursively collect every `(full_key, priority, value)` triple in
    /// the trie, depth-first.
    pub fn dump(&self) -> Vec<(String, i32, String)> {
        let mut out = Vec::new();
        self.dump_from(self.root_offset, String::new(), &mut out);
        out
    }

    fn dump_from(&self, offset: usize, prefix_so_far: String, out: &mut Vec<(String, i32, String)>) {
        let Ok(node) = self.parse_node(offset) else {
            return;
        };
        let full = prefix_so_far + node.prefix;
        for (priority, value) in &node.values {
            out.push((full.clone(), *priority, (*value).to_owned()));
        }
        for (_, child_offset, _) in &node.children {
            self.dump_from(*child_offset, full.clone(), out);
        }
    }

    /// Glob match: `query` is a concrete string (e.g. a MODALIAS value);
    /// every stored key is treated as a glob pattern. Returns matching
    /// values in priority order: lowest priority number (highest priority)
    /// first, ties broken by the order the keys appear in the dump.
    pub fn search_wild(&self, query: &str) -> Vec<String> {
        let mut matches: Vec<(i32, String)> = self
            .dump()
            .into_iter()
            .filter(|(key, _, _)| glob_match(key, query))
            .map(|(_, priority, value)| (priority, value))
            .collect();
        matches.sort_by(|a, b| a.0.cmp(&b.0));
        matches.into_iter().map(|(_, v)| v).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::super::node::Index as BuilderIndex;
    use super::super::writer;
    use super::*;

    #[test]
    fn rejects_bad_magic() {
        let buf = vec![0u8; 16];
        assert_eq!(IndexFile::parse(&buf).unwrap_err(), IndexError::BadMagic(0));
    }

    #[test]
    fn search_wild_matches_glob_keys() {
        let mut idx = BuilderIndex::new();
        idx.insert("pci:v00001234d*", "mod_a", 0);
        idx.insert("pci:v00005678d*", "mod_b", 0);
        let bytes = writer::write(&idx);
        let file = IndexFile::parse(&bytes).unwrap();
        assert_eq!(file.search_wild("pci:v00001234d00000001"), vec!["mod_a".to_owned()]);
        assert!(file.search_wild("pci:v0000ffffd00000001").is_empty());
    }

    #[test]
    fn search_returns_lowest_priority_number_first() {
        let mut idx = BuilderIndex::new();
        idx.insert("ext4", "override.ko", 0);
        idx.insert("ext4", "stock.ko", 10);
        let bytes = writer::write(&idx);
        let file = IndexFile::parse(&bytes).unwrap();
        assert_eq!(file.search("ext4"), vec!["override.ko".to_owned(), "stock.ko".to_owned()]);
    }

    #[test]
    fn dump_lists_every_key() {
        let mut idx = BuilderIndex::new();
        idx.insert("a", "1", 0);
        idx.insert("b", "2", 0);
        let bytes = writer::write(&idx);
        let file = IndexFile::parse(&bytes).unwrap();
        let mut keys: Vec<String> = file.dump().into_iter().map(|(k, _, _)| k).collect();
        keys.sort();
        assert_eq!(keys, vec!["a".to_owned(), "b".to_owned()]);
    }
}
