use std::collections::HashSet;

use ethereum_types::H256;
use tracing::debug;

use crate::{
    Trie, error::TrieError, nibbles::Nibbles, node::Node, node_hash::NodeHash, state::TrieState,
};

/// Observer for a depth-first walk over a trie's nodes
pub trait TrieVisitor {
    /// Called for every node resolved during the walk
    fn on_node(&mut self, _hash: &NodeHash, _node: &Node) {}

    /// Called for every stored value along with the full key leading to it
    fn on_value(&mut self, _hash: &NodeHash, _node: &Node, _key: &[u8], _value: &[u8]) {}
}

/// Walks all nodes reachable from `root` depth-first, rebuilding full keys
/// from the traversed nibble segments
fn scan(
    state: &TrieState,
    root: Option<NodeHash>,
    visitor: &mut dyn TrieVisitor,
) -> Result<(), TrieError> {
    let Some(root) = root else {
        return Ok(());
    };
    let mut stack = vec![(Nibbles::default(), root)];
    while let Some((path, node_hash)) = stack.pop() {
        let node = state
            .get_node(node_hash)?
            .ok_or(TrieError::MissingNode(node_hash.finalize()))?;
        visitor.on_node(&node_hash, &node);
        match &node {
            Node::Branch(branch_node) => {
                // Push children in reverse so lower nibbles are visited first
                for (choice, child) in branch_node.choices.iter().enumerate().rev() {
                    if child.is_valid() {
                        let mut child_path = path.clone();
                        child_path.append(choice as u8);
                        stack.push((child_path, *child));
                    }
                }
                if !branch_node.value.is_empty() {
                    visitor.on_value(&node_hash, &node, &path.to_bytes(), &branch_node.value);
                }
            }
            Node::Extension(extension_node) => {
                let mut child_path = path;
                child_path.extend(&extension_node.prefix);
                stack.push((child_path, extension_node.child));
            }
            Node::Leaf(leaf_node) => {
                let mut full_path = path;
                full_path.extend(&leaf_node.partial);
                visitor.on_value(&node_hash, &node, &full_path.to_bytes(), &leaf_node.value);
            }
        }
    }
    Ok(())
}

/// Counts resolved nodes, proving the whole trie is reachable and decodable
#[derive(Default)]
struct NodeCounter {
    nodes: usize,
}

impl TrieVisitor for NodeCounter {
    fn on_node(&mut self, _hash: &NodeHash, _node: &Node) {
        self.nodes += 1;
    }
}

/// Collects the hash of every node stored under its own hash
#[derive(Default)]
struct HashCollector {
    hashes: HashSet<H256>,
}

impl TrieVisitor for HashCollector {
    fn on_node(&mut self, hash: &NodeHash, _node: &Node) {
        if let NodeHash::Hashed(hash) = hash {
            self.hashes.insert(*hash);
        }
    }
}

/// Renders one line per node
#[derive(Default)]
struct TrieDumper {
    lines: Vec<String>,
}

impl TrieVisitor for TrieDumper {
    fn on_node(&mut self, hash: &NodeHash, node: &Node) {
        let line = match node {
            Node::Branch(branch_node) => {
                let children: Vec<_> = branch_node
                    .choices
                    .iter()
                    .enumerate()
                    .filter(|(_, child)| child.is_valid())
                    .map(|(choice, child)| format!("{choice:x}: {}", hex::encode(child)))
                    .collect();
                format!(
                    "branch {} children: [{}] value: {}",
                    hex::encode(hash),
                    children.join(", "),
                    hex::encode(&branch_node.value)
                )
            }
            Node::Extension(extension_node) => format!(
                "extension {} prefix: {} child: {}",
                hex::encode(hash),
                hex::encode(extension_node.prefix.encode_compact()),
                hex::encode(extension_node.child)
            ),
            Node::Leaf(leaf_node) => format!(
                "leaf {} partial: {} value: {}",
                hex::encode(hash),
                hex::encode(leaf_node.partial.encode_compact()),
                hex::encode(&leaf_node.value)
            ),
        };
        self.lines.push(line);
    }
}

impl Trie {
    /// Walks the trie depth-first, invoking the visitor's callbacks for every
    /// resolved node and stored value
    pub fn scan(&self, visitor: &mut dyn TrieVisitor) -> Result<(), TrieError> {
        scan(&self.state, self.root, visitor)
    }

    /// Checks that every node reachable from the current root resolves and
    /// decodes. An empty trie is valid
    pub fn validate(&self) -> bool {
        let mut counter = NodeCounter::default();
        match self.scan(&mut counter) {
            Ok(()) => {
                debug!("Trie scan resolved {} nodes", counter.nodes);
                true
            }
            Err(_) => false,
        }
    }

    /// Collects the hash of every node reachable from the current root.
    /// The walk stops early if a referenced node cannot be resolved
    pub fn collect_node_hashes(&self) -> HashSet<H256> {
        let mut collector = HashCollector::default();
        let _ = self.scan(&mut collector);
        collector.hashes
    }

    /// Collects the hash of every node reachable from the current root,
    /// failing if any referenced node cannot be resolved
    pub(crate) fn reachable_node_hashes(&self) -> Result<HashSet<H256>, TrieError> {
        let mut collector = HashCollector::default();
        self.scan(&mut collector)?;
        Ok(collector.hashes)
    }

    /// Renders every node reachable from the current root as a multi-line
    /// listing, one node per line
    pub fn dump(&self) -> Result<String, TrieError> {
        let mut dumper = TrieDumper::default();
        self.scan(&mut dumper)?;
        Ok(dumper.lines.join("\n"))
    }
}

#[cfg(test)]
mod test {
    use std::collections::{BTreeMap, BTreeSet};
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::InMemoryTrieDB;

    fn new_temp_with_map() -> (Trie, Arc<Mutex<BTreeMap<H256, Vec<u8>>>>) {
        let map = Arc::new(Mutex::new(BTreeMap::new()));
        let trie = Trie::new(Box::new(InMemoryTrieDB::new(map.clone())));
        (trie, map)
    }

    #[test]
    fn validate_empty_trie() {
        let (trie, _map) = new_temp_with_map();
        assert!(trie.validate());
    }

    #[test]
    fn validate_committed_and_uncommitted_tries() {
        let (mut trie, _map) = new_temp_with_map();
        trie.insert(b"doe".to_vec(), vec![0xEE; 32]).unwrap();
        trie.insert(b"dog".to_vec(), vec![0xDD; 32]).unwrap();
        // Uncommitted nodes are served from the cache
        assert!(trie.validate());

        trie.hash().unwrap();
        assert!(trie.validate());
    }

    #[test]
    fn validate_truncated_store() {
        let (mut trie, map) = new_temp_with_map();
        trie.insert(b"doe".to_vec(), vec![0xEE; 32]).unwrap();
        trie.insert(b"dog".to_vec(), vec![0xDD; 32]).unwrap();
        trie.insert(b"horse".to_vec(), vec![0xAA; 32]).unwrap();
        let root = trie.hash().unwrap();

        // Losing any non-root node makes the walk fail
        let victim = {
            let guard = map.lock().unwrap();
            guard.keys().find(|key| **key != root).copied().unwrap()
        };
        map.lock().unwrap().remove(&victim);

        let reopened = Trie::open(Box::new(InMemoryTrieDB::new(map)), root);
        assert!(!reopened.validate());
    }

    #[test]
    fn collect_node_hashes_covers_the_committed_node_set() {
        let (mut trie, map) = new_temp_with_map();
        trie.insert(b"do".to_vec(), vec![0x11; 32]).unwrap();
        trie.insert(b"dog".to_vec(), vec![0x22; 32]).unwrap();
        trie.insert(b"doge".to_vec(), vec![0x33; 32]).unwrap();
        trie.insert(b"horse".to_vec(), vec![0x44; 32]).unwrap();
        trie.hash().unwrap();

        let committed: HashSet<H256> = map.lock().unwrap().keys().copied().collect();
        assert_eq!(trie.collect_node_hashes(), committed);
    }

    #[test]
    fn dump_mentions_every_value() {
        let (mut trie, _map) = new_temp_with_map();
        trie.insert(b"doe".to_vec(), b"reindeer".to_vec()).unwrap();
        trie.insert(b"dog".to_vec(), b"puppy".to_vec()).unwrap();
        trie.insert(b"dogglesworth".to_vec(), b"cat".to_vec())
            .unwrap();

        let dump = trie.dump().unwrap();
        assert!(dump.contains(&hex::encode(b"reindeer")));
        assert!(dump.contains(&hex::encode(b"puppy")));
        assert!(dump.contains(&hex::encode(b"cat")));
        assert!(dump.contains("leaf"));
        assert!(dump.contains("branch"));
    }

    #[test]
    fn scan_rebuilds_full_keys() {
        #[derive(Default)]
        struct KeyValueCollector {
            pairs: BTreeSet<(Vec<u8>, Vec<u8>)>,
        }

        impl TrieVisitor for KeyValueCollector {
            fn on_value(&mut self, _hash: &NodeHash, _node: &Node, key: &[u8], value: &[u8]) {
                self.pairs.insert((key.to_vec(), value.to_vec()));
            }
        }

        let (mut trie, _map) = new_temp_with_map();
        // Covers values stored in leaves and in branch value slots
        let data = [
            (vec![0x10], b"branch_value".to_vec()),
            (vec![0x10, 0x00], b"leaf_below_branch".to_vec()),
            (b"dog".to_vec(), b"puppy".to_vec()),
            (b"doge".to_vec(), b"coin".to_vec()),
        ];
        for (key, value) in &data {
            trie.insert(key.clone(), value.clone()).unwrap();
        }

        let mut collector = KeyValueCollector::default();
        trie.scan(&mut collector).unwrap();
        let expected: BTreeSet<_> = data.into_iter().collect();
        assert_eq!(collector.pairs, expected);
    }
}
