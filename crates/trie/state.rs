use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use crate::error::TrieError;
use ethereum_types::H256;
use hexary_rlp::{decode::RLPDecode, encode::RLPEncode};
use tracing::debug;

use super::db::TrieDB;
use super::{node::Node, node_hash::NodeHash};

/// Database representing the trie state
/// It contains a table mapping node hashes to rlp encoded nodes
/// Dirty nodes and pending removals are held back until the next commit,
/// which flushes both to the DB as a single batch.
/// Identical subtrees share a single entry, so each entry counts its
/// references and is only dropped once every referencing position let go
pub struct TrieState {
    db: Box<dyn TrieDB>,
    cache: Mutex<NodeCache>,
}

#[derive(Default)]
struct NodeCache {
    nodes: HashMap<H256, CacheEntry>,
    removed: HashSet<H256>,
}

struct CacheEntry {
    node: Node,
    dirty: bool,
    refs: u32,
}

impl TrieState {
    /// Creates a TrieState referring to a db.
    pub fn new(db: Box<dyn TrieDB>) -> TrieState {
        TrieState {
            db,
            cache: Mutex::new(NodeCache::default()),
        }
    }

    /// Returns a reference to the inner database
    pub fn database(&self) -> &dyn TrieDB {
        self.db.as_ref()
    }

    /// Retrieves a node based on its hash
    pub fn get_node(&self, hash: NodeHash) -> Result<Option<Node>, TrieError> {
        // Decode the node if it is inlined
        let hash = match hash {
            NodeHash::Inline(_) => return Ok(Some(Node::decode_raw(hash.as_ref())?)),
            NodeHash::Hashed(hash) => hash,
        };
        let mut cache = self.lock_cache()?;
        if let Some(entry) = cache.nodes.get(&hash) {
            return Ok(Some(entry.node.clone()));
        }
        // Read through to the DB, keeping the node around for later lookups
        self.db
            .get(hash)?
            .map(|rlp| {
                let node = Node::decode(&rlp)?;
                cache.nodes.insert(
                    hash,
                    CacheEntry {
                        node: node.clone(),
                        dirty: false,
                        refs: 1,
                    },
                );
                Ok(node)
            })
            .transpose()
    }

    /// Inserts a node, adding a reference if it is already cached
    pub fn insert_node(&self, node: Node, hash: NodeHash) -> Result<(), TrieError> {
        // Don't insert the node if it is already inlined on the parent
        if let NodeHash::Hashed(hash) = hash {
            let mut cache = self.lock_cache()?;
            match cache.nodes.entry(hash) {
                Entry::Occupied(mut occupied) => {
                    let entry = occupied.get_mut();
                    entry.refs += 1;
                    entry.dirty = true;
                }
                Entry::Vacant(vacant) => {
                    vacant.insert(CacheEntry {
                        node,
                        dirty: true,
                        refs: 1,
                    });
                }
            }
            // A node that is stored again must not be deleted on the next commit
            cache.removed.remove(&hash);
        }
        Ok(())
    }

    /// Drops one reference to a node. Once no references remain the node is
    /// evicted and queued for deletion from the DB on the next commit.
    /// No DB access happens until then
    pub fn mark_removed(&self, hash: NodeHash) -> Result<(), TrieError> {
        if let NodeHash::Hashed(hash) = hash {
            let mut cache = self.lock_cache()?;
            match cache.nodes.entry(hash) {
                Entry::Occupied(mut occupied) => {
                    let entry = occupied.get_mut();
                    entry.refs = entry.refs.saturating_sub(1);
                    if entry.refs == 0 {
                        occupied.remove();
                        cache.removed.insert(hash);
                    }
                }
                Entry::Vacant(_) => {
                    cache.removed.insert(hash);
                }
            }
        }
        Ok(())
    }

    /// True when at least one node removal is pending for the next commit
    pub fn has_pending_removals(&self) -> Result<bool, TrieError> {
        Ok(!self.lock_cache()?.removed.is_empty())
    }

    /// Drops pending removals for every hash in `live`, keeping those rows
    /// out of the next commit's delete batch
    pub fn cancel_removals(&self, live: &HashSet<H256>) -> Result<(), TrieError> {
        let mut cache = self.lock_cache()?;
        cache.removed.retain(|hash| !live.contains(hash));
        Ok(())
    }

    /// Commits cache changes to the DB and clears the cache
    /// Every dirty node and every pending removal goes into one batch
    pub fn commit(&self) -> Result<(), TrieError> {
        let mut cache = self.lock_cache()?;
        let mut batch: Vec<(H256, Option<Vec<u8>>)> = cache
            .nodes
            .iter()
            .filter(|(_, entry)| entry.dirty)
            .map(|(hash, entry)| (*hash, Some(entry.node.encode_to_vec())))
            .collect();
        if batch.is_empty() && cache.removed.is_empty() {
            return Ok(());
        }
        let writes = batch.len();
        batch.extend(cache.removed.iter().map(|hash| (*hash, None)));
        debug!(
            "Committing {} node writes and {} removals",
            writes,
            cache.removed.len()
        );
        self.db.update_batch(batch)?;
        cache.nodes.clear();
        cache.removed.clear();
        Ok(())
    }

    /// Discards all uncommitted changes
    /// Dirty nodes are dropped, clean cached nodes are kept and pending removals are forgotten
    pub fn undo(&self) -> Result<(), TrieError> {
        let mut cache = self.lock_cache()?;
        cache.nodes.retain(|_, entry| !entry.dirty);
        cache.removed.clear();
        Ok(())
    }

    fn lock_cache(&self) -> Result<MutexGuard<'_, NodeCache>, TrieError> {
        self.cache.lock().map_err(|_| TrieError::LockError)
    }
}
