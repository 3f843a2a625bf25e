//! In-memory radix trie builder, used by depmod to accumulate
//! `(key, value, priority)` triples before serializing them with
//! [`super::writer`].

#[derive(Debug, Default)]
pub(crate) struct Node {
    /// The fragment of the key consumed between this node's parent and
    /// itself. Empty only at the root.
    pub prefix: String,
    pub children: Vec<Node>,
    /// `(priority, value)`, kept in insertion order; the writer/reader
    /// sort by priority ascending (lowest number, i.e. highest priority,
    /// first) at serialize time.
    pub values: Vec<(i32, String)>,
}

impl Node {
    fn common_prefix_len(a: &str, b: &str) -> usize {
        a.bytes()
            .zip(b.bytes())
            .take_while(|(x, y)| x == y)
            .count()
    }

    fn insert(&mut self, key: &str, value: &str, priority: i32) {
        if key.is_empty() {
            self.values.push((priority, value.to_owned()));
            return;
        }

        let first = key.as_bytes()[0];
        if let Some(pos) = self
            .children
            .iter()
            .position(|c| c.prefix.as_bytes().first() == Some(&first))
        {
            let common = Self::common_prefix_len(&self.children[pos].prefix, key);
            if common == self.children[pos].prefix.len() {
                self.children[pos].insert(&key[common..], value, priority);
            } else {
                // Split: carve the shared prefix into a new intermediate
                // node, push the existing child down as its only child.
                let child = &mut self.children[pos];
                let old_suffix = child.prefix[common..].to_owned();
                let mut split = Node {
                    prefix: child.prefix[..common].to_owned(),
                    children: Vec::new(),
                    values: Vec::new(),
                };
                let mut displaced = std::mem::take(child);
                displaced.prefix = old_suffix;
                split.children.push(displaced);
                split.insert(&key[common..], value, priority);
                self.children[pos] = split;
            }
        } else {
            let mut child = Node {
                prefix: key.to_owned(),
                children: Vec::new(),
                values: Vec::new(),
            };
            child.insert("", value, priority);
            self.children.push(child);
        }
    }
}

/// A trie under construction. Keys are inserted with
/// [`Index::insert`]; call [`super::writer::write`] to serialize.
#[derive(Debug, Default)]
pub struct Index {
    pub(crate) root: Node,
}

impl Index {
    pub fn new() -> Self {
        Self::default()
    }

    /// Associate `value` with `key` at `priority`. Lower priority numbers
    /// win at lookup time when a key has more than one value; insertion
    /// order breaks ties among equal priorities.
    pub fn insert(&mut self, key: &str, value: &str, priority: i32) {
        self.root.insert(key, value, priority);
    }

    pub fn is_empty(&self) -> bool {
        self.root.children.is_empty() && self.root.values.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_key_roundtrips_through_children() {
        let mut idx = Index::new();
        idx.insert("foo", "bar", 0);
        assert_eq!(idx.root.children.len(), 1);
        assert_eq!(idx.root.children[0].prefix, "foo");
        assert_eq!(idx.root.children[0].values, vec![(0, "bar".to_owned())]);
    }

    #[test]
    fn shared_prefix_splits_node() {
        let mut idx = Index::new();
        idx.insert("foobar", "a", 0);
        idx.insert("foobaz", "b", 0);
        // Root has one child "fooba", which has two children "r" and "z".
        assert_eq!(idx.root.children.len(), 1);
        let mid = &idx.root.children[0];
        assert_eq!(mid.prefix, "fooba");
        assert_eq!(mid.children.len(), 2);
    }

    #[test]
    fn duplicate_key_accumulates_values() {
        let mut idx = Index::new();
        idx.insert("foo", "a", 0);
        idx.insert("foo", "b", 1);
        assert_eq!(idx.root.children[0].values.len(), 2);
    }
}
