use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::mem;
use std::sync::{Arc, Mutex, MutexGuard};

use ethereum_types::H256;
use tracing::debug;

use crate::db::TrieDB;
use crate::error::TrieError;

/// Identifies the block whose state transition produced a set of node changes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockId {
    pub number: u64,
    pub hash: H256,
}

/// Ownership info for a single node key
#[derive(Debug, Default)]
struct RefEntry {
    /// The key is backed by a plain database row (it existed before journaling
    /// started or the block that wrote it has been pruned)
    db_ref: bool,
    /// Number of sealed or in-progress journals that inserted the key
    journal_refs: u32,
}

impl RefEntry {
    fn total(&self) -> u32 {
        self.journal_refs + u32::from(self.db_ref)
    }
}

/// Node keys touched while executing a single block
#[derive(Debug)]
struct JournalUpdate {
    block: BlockId,
    inserted: HashSet<H256>,
    deleted: HashSet<H256>,
}

#[derive(Default)]
struct JournalState {
    refs: HashMap<H256, RefEntry>,
    updates: Vec<JournalUpdate>,
    current_inserted: HashSet<H256>,
    current_deleted: HashSet<H256>,
}

/// Journaling layer between a trie and its backing store.
///
/// Node writes go through to the inner store right away while removals are
/// only recorded, keeping every block's state root readable until the block
/// is pruned. Pruning a block makes its writes permanent, applies its pending
/// removals and rolls back sealed sibling blocks at the same height.
/// Cloning yields another handle over the same journal.
#[derive(Clone)]
pub struct JournalDB {
    inner: Arc<dyn TrieDB>,
    state: Arc<Mutex<JournalState>>,
}

impl JournalDB {
    pub fn new(inner: Arc<dyn TrieDB>) -> Self {
        Self {
            inner,
            state: Arc::new(Mutex::new(JournalState::default())),
        }
    }

    /// Seals the changes recorded since the last call as `block`'s journal
    pub fn store_block_changes(&self, block: BlockId) -> Result<(), TrieError> {
        let mut state = self.lock_state()?;
        let inserted = mem::take(&mut state.current_inserted);
        let deleted = mem::take(&mut state.current_deleted);
        debug!(
            "Sealing journal for block {} with {} inserts and {} pending deletes",
            block.number,
            inserted.len(),
            deleted.len()
        );
        state.updates.push(JournalUpdate {
            block,
            inserted,
            deleted,
        });
        Ok(())
    }

    /// Makes `block`'s changes permanent.
    ///
    /// The block's journaled inserts become plain database rows, its pending
    /// deletes are applied unless a later journal re-inserted the key, and
    /// every other sealed block at the pruned journal's height is rolled
    /// back. All resulting removals are submitted to the inner store as a
    /// single batch. Pruning an unknown block is a no-op.
    pub fn prune(&self, block: BlockId) -> Result<(), TrieError> {
        let mut state = self.lock_state()?;
        let Some(index) = state
            .updates
            .iter()
            .position(|update| update.block.hash == block.hash)
        else {
            return Ok(());
        };
        let update = state.updates.remove(index);
        // The sealed journal's height is authoritative, not the caller's copy
        let height = update.block.number;
        let mut batch_removals: Vec<(H256, Option<Vec<u8>>)> = Vec::new();

        // The winning block's inserts stop being journaled. Keys it owned
        // alone become untracked database rows, shared keys keep their entry.
        for key in update.inserted {
            let drop_entry = match state.refs.get_mut(&key) {
                Some(entry) => {
                    entry.journal_refs = entry.journal_refs.saturating_sub(1);
                    if entry.total() == 0 {
                        true
                    } else {
                        entry.db_ref = true;
                        false
                    }
                }
                None => false,
            };
            if drop_entry {
                state.refs.remove(&key);
            }
        }

        // Apply the block's deferred deletes unless a later journal still
        // references the key
        for key in update.deleted {
            let journal_refs = state
                .refs
                .get(&key)
                .map(|entry| entry.journal_refs)
                .unwrap_or(0);
            if journal_refs == 0 {
                state.refs.remove(&key);
                batch_removals.push((key, None));
            } else if let Some(entry) = state.refs.get_mut(&key) {
                entry.db_ref = false;
            }
        }

        // Sibling blocks at the same height lost the fork choice, drop their
        // journals and delete the nodes nobody else references
        let (siblings, retained): (Vec<_>, Vec<_>) = mem::take(&mut state.updates)
            .into_iter()
            .partition(|update| update.block.number == height);
        state.updates = retained;
        let sibling_count = siblings.len();
        for sibling in siblings {
            for key in sibling.inserted {
                let delete_key = match state.refs.get_mut(&key) {
                    Some(entry) => {
                        entry.journal_refs = entry.journal_refs.saturating_sub(1);
                        entry.total() == 0
                    }
                    None => false,
                };
                if delete_key {
                    state.refs.remove(&key);
                    batch_removals.push((key, None));
                }
            }
            // A losing fork's pending deletes were never applied, forget them
        }

        debug!(
            "Pruning block {} removed {} nodes and rolled back {} sibling journals",
            height,
            batch_removals.len(),
            sibling_count
        );
        if !batch_removals.is_empty() {
            self.inner.update_batch(batch_removals)?;
        }
        Ok(())
    }

    fn lock_state(&self) -> Result<MutexGuard<'_, JournalState>, TrieError> {
        self.state.lock().map_err(|_| TrieError::LockError)
    }
}

impl TrieDB for JournalDB {
    fn get(&self, key: H256) -> Result<Option<Vec<u8>>, TrieError> {
        self.inner.get(key)
    }

    fn update_batch(&self, key_values: Vec<(H256, Option<Vec<u8>>)>) -> Result<(), TrieError> {
        let mut state = self.lock_state()?;
        let mut writes = Vec::new();
        for (key, value) in key_values {
            match value {
                Some(value) => {
                    // A write supersedes any delete of the key recorded for
                    // the current block
                    state.current_deleted.remove(&key);
                    if state.current_inserted.insert(key) {
                        match state.refs.entry(key) {
                            Entry::Vacant(vacant) => {
                                // Seed database ownership before the
                                // write-through makes the key visible
                                let db_ref = self.inner.get(key)?.is_some();
                                vacant.insert(RefEntry {
                                    db_ref,
                                    journal_refs: 1,
                                });
                            }
                            Entry::Occupied(mut occupied) => {
                                occupied.get_mut().journal_refs += 1;
                            }
                        }
                    }
                    writes.push((key, Some(value)));
                }
                None => {
                    // Deletes only take effect when the recording block is
                    // pruned
                    state.current_deleted.insert(key);
                }
            }
        }
        if !writes.is_empty() {
            self.inner.update_batch(writes)?;
        }
        Ok(())
    }

    fn keys(&self) -> Result<Vec<H256>, TrieError> {
        self.inner.keys()
    }
}

#[cfg(test)]
mod test {
    use std::collections::BTreeMap;

    use super::*;
    use crate::{InMemoryTrieDB, Trie};

    fn journaled_db() -> (JournalDB, Arc<Mutex<BTreeMap<H256, Vec<u8>>>>) {
        let store = InMemoryTrieDB::new_empty();
        let map = store.inner();
        let journal = JournalDB::new(Arc::new(store));
        (journal, map)
    }

    fn block(number: u64, tag: u8) -> BlockId {
        BlockId {
            number,
            hash: H256([tag; 32]),
        }
    }

    #[test]
    fn writes_are_eager_and_deletes_are_deferred() {
        let (journal, map) = journaled_db();
        let key = H256([0x01; 32]);

        journal.put(key, vec![0xAB; 40]).unwrap();
        assert_eq!(journal.get(key).unwrap(), Some(vec![0xAB; 40]));

        // A journaled delete keeps the bytes readable until the block that
        // recorded it is pruned
        journal.delete(key).unwrap();
        assert_eq!(journal.get(key).unwrap(), Some(vec![0xAB; 40]));
        assert_eq!(map.lock().unwrap().len(), 1);

        journal.store_block_changes(block(1, 0xA1)).unwrap();
        journal.prune(block(1, 0xA1)).unwrap();
        assert_eq!(journal.get(key).unwrap(), None);
        assert!(map.lock().unwrap().is_empty());
    }

    #[test]
    fn prune_unknown_block_is_a_noop() {
        let (journal, map) = journaled_db();
        journal.put(H256([0x01; 32]), vec![0xAB; 40]).unwrap();
        journal.store_block_changes(block(1, 0xA1)).unwrap();

        journal.prune(block(9, 0xFF)).unwrap();
        assert_eq!(map.lock().unwrap().len(), 1);
        assert_eq!(
            journal.get(H256([0x01; 32])).unwrap(),
            Some(vec![0xAB; 40])
        );
    }

    #[test]
    fn old_roots_stay_readable_until_their_nodes_are_pruned() {
        let (journal, map) = journaled_db();

        let mut trie = Trie::new(Box::new(journal.clone()));
        trie.insert(b"dog".to_vec(), vec![0xDD; 32]).unwrap();
        trie.insert(b"doge".to_vec(), vec![0xCC; 32]).unwrap();
        let first_root = trie.hash().unwrap();
        journal.store_block_changes(block(1, 0xA1)).unwrap();

        trie.remove(b"doge".to_vec()).unwrap();
        let second_root = trie.hash().unwrap();
        journal.store_block_changes(block(2, 0xB2)).unwrap();

        // The removal is journaled under block 2, so the first snapshot can
        // still be opened
        let snapshot = Trie::open(Box::new(journal.clone()), first_root);
        assert_eq!(
            snapshot.get(&b"doge".to_vec()).unwrap(),
            Some(vec![0xCC; 32])
        );

        journal.prune(block(1, 0xA1)).unwrap();
        let snapshot = Trie::open(Box::new(journal.clone()), first_root);
        assert_eq!(
            snapshot.get(&b"doge".to_vec()).unwrap(),
            Some(vec![0xCC; 32])
        );

        // Pruning block 2 applies the deferred removals, breaking the first
        // snapshot while the second stays intact
        let len_before = map.lock().unwrap().len();
        journal.prune(block(2, 0xB2)).unwrap();
        assert!(map.lock().unwrap().len() < len_before);

        let snapshot = Trie::open(Box::new(journal.clone()), first_root);
        assert!(matches!(
            snapshot.get(&b"doge".to_vec()),
            Err(TrieError::MissingNode(_))
        ));
        let snapshot = Trie::open(Box::new(journal.clone()), second_root);
        assert_eq!(snapshot.get(&b"dog".to_vec()).unwrap(), Some(vec![0xDD; 32]));
        assert!(snapshot.get(&b"doge".to_vec()).unwrap().is_none());
    }

    #[test]
    fn losing_fork_nodes_are_deleted_on_prune() {
        let (journal, map) = journaled_db();

        let mut trie = Trie::new(Box::new(journal.clone()));
        trie.insert(b"base".to_vec(), vec![0xBB; 32]).unwrap();
        let base_root = trie.hash().unwrap();
        journal.store_block_changes(block(1, 0xA1)).unwrap();
        journal.prune(block(1, 0xA1)).unwrap();

        // Two competing blocks at the same height build on the same parent
        trie.insert(b"fork_a".to_vec(), vec![0xAA; 32]).unwrap();
        let fork_a_root = trie.hash().unwrap();
        journal.store_block_changes(block(2, 0xAA)).unwrap();

        trie.set_root(base_root).unwrap();
        trie.insert(b"fork_b".to_vec(), vec![0xCB; 32]).unwrap();
        let fork_b_root = trie.hash().unwrap();
        journal.store_block_changes(block(2, 0xBB)).unwrap();

        let len_with_both_forks = map.lock().unwrap().len();
        journal.prune(block(2, 0xBB)).unwrap();
        assert!(map.lock().unwrap().len() < len_with_both_forks);

        // The loser's nodes are gone, the winner's are permanent
        let snapshot = Trie::open(Box::new(journal.clone()), fork_a_root);
        assert!(snapshot.get(&b"fork_a".to_vec()).is_err());
        let snapshot = Trie::open(Box::new(journal.clone()), fork_b_root);
        assert_eq!(
            snapshot.get(&b"fork_b".to_vec()).unwrap(),
            Some(vec![0xCB; 32])
        );
        assert_eq!(
            snapshot.get(&b"base".to_vec()).unwrap(),
            Some(vec![0xBB; 32])
        );
    }

    #[test]
    fn nodes_shared_between_forks_survive_rollback() {
        let (journal, _map) = journaled_db();

        let mut trie = Trie::new(Box::new(journal.clone()));
        trie.insert(b"base".to_vec(), vec![0xBB; 32]).unwrap();
        let base_root = trie.hash().unwrap();
        journal.store_block_changes(block(1, 0xA1)).unwrap();

        // Both forks apply the same state change, so they journal the same
        // node hashes
        trie.insert(b"shared".to_vec(), vec![0xEE; 32]).unwrap();
        let fork_root = trie.hash().unwrap();
        journal.store_block_changes(block(2, 0xAA)).unwrap();

        trie.set_root(base_root).unwrap();
        trie.insert(b"shared".to_vec(), vec![0xEE; 32]).unwrap();
        assert_eq!(trie.hash().unwrap(), fork_root);
        journal.store_block_changes(block(2, 0xBB)).unwrap();

        // Rolling back the losing fork must not delete nodes the winner owns
        journal.prune(block(2, 0xBB)).unwrap();
        let snapshot = Trie::open(Box::new(journal.clone()), fork_root);
        assert_eq!(
            snapshot.get(&b"shared".to_vec()).unwrap(),
            Some(vec![0xEE; 32])
        );
        assert_eq!(
            snapshot.get(&b"base".to_vec()).unwrap(),
            Some(vec![0xBB; 32])
        );
    }

    #[test]
    fn rollback_keeps_keys_owned_by_the_database() {
        let (journal, map) = journaled_db();
        let key = H256([0x07; 32]);

        // The key exists before any journaling
        map.lock().unwrap().insert(key, vec![0x11; 40]);

        // A block re-writes it and later loses the fork choice
        journal.put(key, vec![0x11; 40]).unwrap();
        journal.store_block_changes(block(1, 0xAA)).unwrap();
        journal.store_block_changes(block(1, 0xBB)).unwrap();
        journal.prune(block(1, 0xBB)).unwrap();

        assert_eq!(journal.get(key).unwrap(), Some(vec![0x11; 40]));
    }

    #[test]
    fn reinsert_in_same_block_supersedes_pending_delete() {
        let (journal, map) = journaled_db();
        let key = H256([0x03; 32]);

        journal.put(key, vec![0xAB; 40]).unwrap();
        journal.delete(key).unwrap();
        journal.put(key, vec![0xAB; 40]).unwrap();
        journal.store_block_changes(block(1, 0xA1)).unwrap();
        journal.prune(block(1, 0xA1)).unwrap();

        assert_eq!(journal.get(key).unwrap(), Some(vec![0xAB; 40]));
        assert_eq!(map.lock().unwrap().len(), 1);
    }

    #[test]
    fn prune_rolls_back_siblings_by_sealed_height() {
        let (journal, _map) = journaled_db();
        let winner_key = H256([0x01; 32]);
        let loser_key = H256([0x02; 32]);
        let later_key = H256([0x03; 32]);

        journal.put(winner_key, vec![0xAA; 40]).unwrap();
        journal.store_block_changes(block(1, 0xA1)).unwrap();
        journal.put(loser_key, vec![0xBB; 40]).unwrap();
        journal.store_block_changes(block(1, 0xC3)).unwrap();
        journal.put(later_key, vec![0xCC; 40]).unwrap();
        journal.store_block_changes(block(2, 0xB2)).unwrap();

        // Sibling rollback follows the height the journal was sealed with,
        // even when the caller passes a number that disagrees with it
        journal
            .prune(BlockId {
                number: 2,
                hash: H256([0xA1; 32]),
            })
            .unwrap();

        assert_eq!(journal.get(winner_key).unwrap(), Some(vec![0xAA; 40]));
        assert_eq!(journal.get(loser_key).unwrap(), None);
        assert_eq!(journal.get(later_key).unwrap(), Some(vec![0xCC; 40]));
    }
}
