mod db;
mod error;
mod journal;
mod nibbles;
mod node;
mod node_hash;
mod scan;
mod state;

use ethereum_types::H256;
use hexary_rlp::constants::RLP_NULL;
use lazy_static::lazy_static;
use sha3::{Digest, Keccak256};

pub use self::db::{InMemoryTrieDB, TrieDB};
pub use self::error::TrieError;
pub use self::journal::{BlockId, JournalDB};
pub use self::nibbles::Nibbles;
pub use self::node::{BranchNode, ExtensionNode, LeafNode, Node};
pub use self::node_hash::NodeHash;
pub use self::scan::TrieVisitor;
pub use self::state::TrieState;

/// RLP-encoded trie path
pub type PathRLP = Vec<u8>;
/// RLP-encoded trie value
pub type ValueRLP = Vec<u8>;

lazy_static! {
    // Hash value for an empty trie, equal to keccak(RLP_NULL)
    pub static ref EMPTY_TRIE_HASH: H256 = H256::from_slice(
        Keccak256::new()
            .chain_update([RLP_NULL])
            .finalize()
            .as_slice(),
    );
}

/// An Ethereum Compatible Merkle Patricia Trie on top of a pluggable key-value store
pub struct Trie {
    /// Reference to the current root node
    root: Option<NodeHash>,
    /// Root at the time of the last commit, used to roll back uncommitted changes
    prev_root: Option<NodeHash>,
    /// Contains the trie's nodes
    pub(crate) state: TrieState,
}

impl Trie {
    /// Creates a new Trie from a clean DB
    pub fn new(db: Box<dyn TrieDB>) -> Self {
        Self {
            root: None,
            prev_root: None,
            state: TrieState::new(db),
        }
    }

    /// Creates a Trie from an existing root node
    pub fn open(db: Box<dyn TrieDB>, root: H256) -> Self {
        let trie_state = TrieState::new(db);
        let root = (root != *EMPTY_TRIE_HASH).then_some(root.into());
        Self {
            root,
            prev_root: root,
            state: trie_state,
        }
    }

    /// Retrieve an RLP-encoded value from the trie given its RLP-encoded path.
    pub fn get(&self, path: &PathRLP) -> Result<Option<ValueRLP>, TrieError> {
        match self.root {
            Some(root) => {
                let root_node = self
                    .state
                    .get_node(root)?
                    .ok_or(TrieError::MissingNode(root.finalize()))?;
                root_node.get(&self.state, Nibbles::from_bytes(path))
            }
            None => Ok(None),
        }
    }

    /// Insert an RLP-encoded value into the trie.
    pub fn insert(&mut self, path: PathRLP, value: ValueRLP) -> Result<(), TrieError> {
        if path.is_empty() {
            return Err(TrieError::EmptyKey);
        }
        let path = Nibbles::from_bytes(&path);
        match self.root.take() {
            Some(root_hash) => {
                // If the trie is not empty, call the root node's insertion logic
                let root_node = self
                    .state
                    .get_node(root_hash)?
                    .ok_or(TrieError::MissingNode(root_hash.finalize()))?;
                let new_root = root_node
                    .insert(&self.state, path, value)?
                    .insert_self(&self.state)?;
                if root_hash != new_root {
                    self.state.mark_removed(root_hash)?;
                }
                self.root = Some(new_root);
            }
            None => {
                // If the trie is empty, just add a leaf.
                let new_leaf = LeafNode::new(path, value);
                self.root = Some(new_leaf.insert_self(&self.state)?);
            }
        }
        Ok(())
    }

    /// Remove a value from the trie given its RLP-encoded path.
    /// Returns the value if it was successfully removed or None if it wasn't part of the trie
    pub fn remove(&mut self, path: PathRLP) -> Result<Option<ValueRLP>, TrieError> {
        if path.is_empty() {
            return Err(TrieError::EmptyKey);
        }
        let Some(root_hash) = self.root.take() else {
            return Ok(None);
        };
        let root_node = self
            .state
            .get_node(root_hash)?
            .ok_or(TrieError::MissingNode(root_hash.finalize()))?;
        let (root_node, old_value) = root_node.remove(&self.state, Nibbles::from_bytes(&path))?;
        let new_root = root_node
            .map(|root| root.insert_self(&self.state))
            .transpose()?;
        if old_value.is_some() && Some(root_hash) != new_root {
            self.state.mark_removed(root_hash)?;
        }
        self.root = new_root;
        Ok(old_value)
    }

    /// Return the hash of the trie's root node, committing all cached changes first.
    /// Returns keccak(RLP_NULL) if the trie is empty
    pub fn hash(&mut self) -> Result<H256, TrieError> {
        self.commit()?;
        Ok(self.hash_no_commit())
    }

    /// Return the hash of the trie's root node without committing cached changes.
    /// Returns keccak(RLP_NULL) if the trie is empty
    pub fn hash_no_commit(&self) -> H256 {
        self.root
            .as_ref()
            .map(|root| root.finalize())
            .unwrap_or(*EMPTY_TRIE_HASH)
    }

    /// Flush all cached changes (node writes and node removals) to the DB in a single batch
    pub fn commit(&mut self) -> Result<(), TrieError> {
        if self.state.has_pending_removals()? {
            // Identical subtrees share a single node, so a hash dropped in
            // one position may still be referenced from another. Only rows
            // unreachable from the current root are deleted
            self.state.cancel_removals(&self.reachable_node_hashes()?)?;
        }
        self.state.commit()?;
        self.prev_root = self.root;
        Ok(())
    }

    /// Discard all cached changes, restoring the root from the last commit
    pub fn undo(&mut self) -> Result<(), TrieError> {
        self.state.undo()?;
        self.root = self.prev_root;
        Ok(())
    }

    /// Repoint the trie to a previously committed root, discarding cached changes.
    /// A root that was never committed will fail later with `MissingNode` upon resolution
    pub fn set_root(&mut self, root: H256) -> Result<(), TrieError> {
        self.state.undo()?;
        self.root = (root != *EMPTY_TRIE_HASH).then_some(root.into());
        self.prev_root = self.root;
        Ok(())
    }

    /// Obtain a reference to the state's database
    pub fn db(&self) -> &dyn TrieDB {
        self.state.database()
    }

    #[cfg(test)]
    /// Creates a new Trie based on a temporary InMemory DB
    fn new_temp() -> Self {
        use std::collections::BTreeMap;
        use std::sync::Arc;
        use std::sync::Mutex;

        let hmap: BTreeMap<H256, Vec<u8>> = BTreeMap::new();
        let map = Arc::new(Mutex::new(hmap));
        let db = InMemoryTrieDB::new(map);
        Trie::new(Box::new(db))
    }
}
