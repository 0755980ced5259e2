use std::mem;

use crate::{
    ValueRLP, error::TrieError, nibbles::Nibbles, node_hash::NodeHash, state::TrieState,
};
use hexary_rlp::structs::Encoder;

use super::{ExtensionNode, LeafNode, Node};

/// Branch Node of an Ethereum Compatible Merkle Patricia Trie
/// Contains the node's value and the hashes of its children
#[derive(Debug, Clone, PartialEq)]
pub struct BranchNode {
    pub choices: [NodeHash; 16],
    pub value: ValueRLP,
}

impl BranchNode {
    /// Empty choice array for more readable node initializations
    pub const EMPTY_CHOICES: [NodeHash; 16] = [NodeHash::const_default(); 16];

    /// Creates a new branch node given its children
    pub const fn new(choices: [NodeHash; 16]) -> Self {
        Self {
            choices,
            value: Vec::new(),
        }
    }

    /// Creates a new branch node given its children and value
    pub const fn new_with_value(choices: [NodeHash; 16], value: ValueRLP) -> Self {
        Self { choices, value }
    }

    /// Updates the node's value
    pub fn update(&mut self, new_value: ValueRLP) {
        self.value = new_value;
    }

    /// Retrieves a value from the subtrie originating from this node given its path
    pub fn get(&self, state: &TrieState, mut path: Nibbles) -> Result<Option<ValueRLP>, TrieError> {
        // If path is at the end, return its own value.
        // Otherwise, check the corresponding choice and delegate accordingly if present.
        if let Some(choice) = path.next_choice() {
            // Delegate to children if present
            let child_hash = &self.choices[choice];
            if child_hash.is_valid() {
                let child_node = state
                    .get_node(*child_hash)?
                    .ok_or(TrieError::MissingNode(child_hash.finalize()))?;
                child_node.get(state, path)
            } else {
                Ok(None)
            }
        } else {
            // Return internal value if present.
            Ok((!self.value.is_empty()).then(|| self.value.clone()))
        }
    }

    /// Inserts a value into the subtrie originating from this node and returns the new root of the subtrie
    pub fn insert(
        mut self,
        state: &TrieState,
        mut path: Nibbles,
        value: ValueRLP,
    ) -> Result<Node, TrieError> {
        // If path is at the end, insert or replace its own value.
        // Otherwise, check the corresponding choice and insert or delegate accordingly.
        match path.next_choice() {
            Some(choice) => match &mut self.choices[choice] {
                // Create new child (leaf node)
                choice_hash if !choice_hash.is_valid() => {
                    let new_leaf = LeafNode::new(path, value);
                    *choice_hash = new_leaf.insert_self(state)?;
                }
                // Insert into existing child and then update it
                choice_hash => {
                    let child_node = state
                        .get_node(*choice_hash)?
                        .ok_or(TrieError::MissingNode(choice_hash.finalize()))?;

                    let child_node = child_node.insert(state, path, value)?;
                    let new_child_hash = child_node.insert_self(state)?;
                    if *choice_hash != new_child_hash {
                        state.mark_removed(*choice_hash)?;
                    }
                    *choice_hash = new_child_hash;
                }
            },
            None => {
                // Insert into self
                self.update(value);
            }
        };

        Ok(self.into())
    }

    /// Removes a value from the subtrie originating from this node given its path
    /// Returns the new root of the subtrie (if any) and the removed value if it existed in the subtrie
    pub fn remove(
        mut self,
        state: &TrieState,
        mut path: Nibbles,
    ) -> Result<(Option<Node>, Option<ValueRLP>), TrieError> {
        /* Possible flow paths:
            Step 1: Removal
                Branch { [ ... ], Path, Value } -> Branch { [...], None, None } (remove from self)
                Branch { [ childA, ... ], Path, Value } -> Branch { [childA', ... ], Path, Value } (remove from child)

            Step 2: Restructure
                Branch { [ ], None, None } -> None (no children or value)
                Branch { [ ], Path, Value } -> Leaf { Path, Value } (no children)
                Branch { [ childA ], None, None } -> childA (one child, no value)
                Branch { [ childA, ... ], Path, Value } -> Branch { [ childA, ... ], Path, Value } (just updated)
        */

        // Step 1: Remove value
        let value = match path.next_choice() {
            Some(choice_index) if self.choices[choice_index].is_valid() => {
                let child_hash = self.choices[choice_index];
                let child_node = state
                    .get_node(child_hash)?
                    .ok_or(TrieError::MissingNode(child_hash.finalize()))?;
                // Remove value from child node
                let (child_node, old_value) = child_node.remove(state, path)?;
                if old_value.is_some() {
                    // Update child node
                    match child_node {
                        Some(child_node) => {
                            let new_child_hash = child_node.insert_self(state)?;
                            if child_hash != new_child_hash {
                                state.mark_removed(child_hash)?;
                            }
                            self.choices[choice_index] = new_child_hash;
                        }
                        None => {
                            state.mark_removed(child_hash)?;
                            self.choices[choice_index] = NodeHash::default();
                        }
                    }
                }
                old_value
            }
            Some(_) => None,
            None => (!self.value.is_empty()).then(|| mem::take(&mut self.value)),
        };
        // If no value was removed, return the node as-is
        if value.is_none() {
            return Ok((Some(self.into()), None));
        }

        // Step 2: Restructure self
        let children = self
            .choices
            .iter()
            .enumerate()
            .filter(|(_, child)| child.is_valid())
            .map(|(choice_index, child)| (choice_index, *child))
            .collect::<Vec<_>>();
        let new_node = match (children.len(), !self.value.is_empty()) {
            // If this node still has a value but no children, convert it into a leaf node
            (0, true) => Some(LeafNode::new(Nibbles::from_hex(vec![16]), self.value).into()),
            // If this node doesn't have a value and has no children, return no node
            (0, false) => None,
            // If this node doesn't have a value and has only one child, replace it with its child node
            (1, false) => {
                let (choice_index, child_hash) = children[0];
                let child = state
                    .get_node(child_hash)?
                    .ok_or(TrieError::MissingNode(child_hash.finalize()))?;
                Some(match child {
                    // Replace self with an extension node leading to the child
                    Node::Branch(_) => {
                        ExtensionNode::new(Nibbles::from_hex(vec![choice_index as u8]), child_hash)
                            .into()
                    }
                    // Replace self with the child extension node, updating its prefix
                    Node::Extension(mut extension_node) => {
                        state.mark_removed(child_hash)?;
                        extension_node.prefix.prepend(choice_index as u8);
                        extension_node.into()
                    }
                    // Replace self with the child leaf node, updating its path
                    Node::Leaf(mut leaf_node) => {
                        state.mark_removed(child_hash)?;
                        leaf_node.partial.prepend(choice_index as u8);
                        leaf_node.into()
                    }
                })
            }
            // Return the updated node
            _ => Some(self.into()),
        };

        Ok((new_node, value))
    }

    /// Computes the node's hash
    pub fn compute_hash(&self) -> NodeHash {
        NodeHash::from_encoded_raw(&self.encode_raw())
    }

    /// Encodes the node
    pub fn encode_raw(&self) -> Vec<u8> {
        let mut buf = vec![];
        let mut encoder = Encoder::new(&mut buf);
        for child in self.choices.iter() {
            match child {
                child if !child.is_valid() => encoder = encoder.encode_bytes(&[]),
                NodeHash::Inline(_) => encoder = encoder.encode_raw(child.as_ref()),
                NodeHash::Hashed(hash) => encoder = encoder.encode_bytes(hash.as_bytes()),
            }
        }
        encoder = encoder.encode_bytes(&self.value);
        encoder.finish();
        buf
    }

    /// Inserts the node into the state and returns its hash
    pub fn insert_self(self, state: &TrieState) -> Result<NodeHash, TrieError> {
        let hash = self.compute_hash();
        state.insert_node(self.into(), hash)?;
        Ok(hash)
    }
}
