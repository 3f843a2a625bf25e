//! Serializes a built [`super::Index`] to the on-disk trie format.
//!
//! Nodes are written post-order: every child is fully written (and its
//! file offset known) before its parent, so a parent's child table can
//! store plain offsets rather than forward references.

use super::node::Node;
use super::{Index, INDEX_HEADER_SIZE, INDEX_MAGIC, INDEX_NODE_CHILDS, INDEX_NODE_VALUES};
use super::{INDEX_VERSION_MAJOR, INDEX_VERSION_MINOR};

/// Serialize `index` to its binary form.
pub fn write(index: &Index) -> Vec<u8> {
    let mut body = Vec::new();
    let root_offset = write_node(&index.root, &mut body);

    let mut out = Vec::with_capacity(INDEX_HEADER_SIZE + body.len());
    out.extend_from_slice(&INDEX_MAGIC.to_be_bytes());
    out.extend_from_slice(&INDEX_VERSION_MAJOR.to_be_bytes());
    out.extend_from_slice(&INDEX_VERSION_MINOR.to_be_bytes());
    out.extend_from_slice(&(root_offset as u32).to_be_bytes());
    out.extend_from_slice(&body);
    out
}

/// Write `node` (and, recursively, its children) into `body`, returning
/// `node`'s own byte offset within `body`.
fn write_node(node: &Node, body: &mut Vec<u8>) -> usize {
    let mut children: Vec<&Node> = node.children.iter().collect();
    children.sort_by_key(|c| c.prefix.as_bytes().first().copied().unwrap_or(0));

    // Write children first; remember (first_byte, offset, flags) for our
    // own child table, emitted after our own offset is fixed.
    let mut child_entries = Vec::with_capacity(children.len());
    for child in &children {
        let offset = write_node(child, body);
        let mut flags = 0u32;
        if !child.children.is_empty() {
            flags |= INDEX_NODE_CHILDS;
        }
        if !child.values.is_empty() {
            flags |= INDEX_NODE_VALUES;
        }
        let first_byte = child.prefix.as_bytes().first().copied().unwrap_or(0);
        child_entries.push((first_byte, offset, flags));
    }

    let self_offset = body.len();

    let prefix_bytes = node.prefix.as_bytes();
    assert!(prefix_bytes.len() <= u8::MAX as usize, "index key fragment too long");
    body.push(prefix_bytes.len() as u8);
    body.extend_from_slice(prefix_bytes);

    // Lowest priority number first (highest priority); stable sort keeps
    // insertion order among ties.
    let mut values = node.values.clone();
    values.sort_by(|a, b| a.0.cmp(&b.0));
    assert!(values.len() <= u8::MAX as usize, "too many values for one index key");
    body.push(values.len() as u8);
    for (priority, value) in &values {
        body.extend_from_slice(&priority.to_be_bytes());
        let bytes = value.as_bytes();
        assert!(bytes.len() <= u16::MAX as usize, "index value too long");
        body.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
        body.extend_from_slice(bytes);
    }

    assert!(child_entries.len() <= u8::MAX as usize, "index node has too many children");
    body.push(child_entries.len() as u8);
    for (first_byte, offset, flags) in child_entries {
        body.push(first_byte);
        let tagged = flags | (offset as u32 & super::INDEX_NODE_MASK);
        body.extend_from_slice(&tagged.to_be_bytes());
    }

    self_offset
}

#[cfg(test)]
mod tests {
    use super::super::node::Index as BuilderIndex;
    use super::super::reader::IndexFile;
    use super::*;

    #[test]
    fn roundtrips_through_reader() {
        let mut idx = BuilderIndex::new();
        idx.insert("ext4", "fs/ext4/ext4.ko", 0);
        idx.insert("ext3", "fs/ext3/ext3.ko", 0);
        idx.insert("ext2", "fs/ext2/ext2.ko", 0);

        let bytes = write(&idx);
        let file = IndexFile::parse(&bytes).unwrap();
        assert_eq!(file.search("ext4"), vec!["fs/ext4/ext4.ko".to_owned()]);
        assert_eq!(file.search("ext3"), vec!["fs/ext3/ext3.ko".to_owned()]);
        assert!(file.search("ext5").is_empty());
    }
}
