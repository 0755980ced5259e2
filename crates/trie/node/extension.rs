use crate::ValueRLP;
use crate::error::TrieError;
use crate::nibbles::Nibbles;
use crate::node_hash::NodeHash;
use crate::state::TrieState;
use hexary_rlp::structs::Encoder;

use super::{BranchNode, Node};

/// Extension Node of an Ethereum Compatible Merkle Patricia Trie
/// Contains the node's prefix and a its child node hash, doesn't store any value
#[derive(Debug, Clone, PartialEq)]
pub struct ExtensionNode {
    pub prefix: Nibbles,
    pub child: NodeHash,
}

impl ExtensionNode {
    /// Creates a new extension node given its child hash and prefix
    pub const fn new(prefix: Nibbles, child: NodeHash) -> Self {
        Self { prefix, child }
    }

    /// Retrieves a value from the subtrie originating from this node given its path
    pub fn get(&self, state: &TrieState, mut path: Nibbles) -> Result<Option<ValueRLP>, TrieError> {
        // If the path is prefixed by this node's prefix, delegate to its child.
        // Otherwise, no value is present.
        if path.skip_prefix(&self.prefix) {
            let child_node = state
                .get_node(self.child)?
                .ok_or(TrieError::MissingNode(self.child.finalize()))?;
            child_node.get(state, path)
        } else {
            Ok(None)
        }
    }

    /// Inserts a value into the subtrie originating from this node and returns the new root of the subtrie
    pub fn insert(
        mut self,
        state: &TrieState,
        path: Nibbles,
        value: ValueRLP,
    ) -> Result<Node, TrieError> {
        /* Possible flow paths:
            Extension { prefix, child } -> Extension { prefix, child' } (insert into child)
            Extension { prefix, child } -> Branch { [ ... ], Value } (insert into self)
            Extension { prefix, child } -> Extension { prefix[..x], Branch { [ Extension { prefix[x+1..], child }, ... ], Value } } (insert into self)
        */
        let match_index = path.count_prefix(&self.prefix);
        if match_index == self.prefix.len() {
            // Insert into child node
            let child_node = state
                .get_node(self.child)?
                .ok_or(TrieError::MissingNode(self.child.finalize()))?;

            let new_child_node = child_node.insert(state, path.offset(match_index), value)?;
            let new_child_hash = new_child_node.insert_self(state)?;
            if self.child != new_child_hash {
                state.mark_removed(self.child)?;
            }
            self.child = new_child_hash;
            Ok(self.into())
        } else if match_index == 0 {
            let new_node = if self.prefix.len() == 1 {
                self.child
            } else {
                ExtensionNode::new(self.prefix.offset(1), self.child).insert_self(state)?
            };
            let mut choices = BranchNode::EMPTY_CHOICES;
            choices[self.prefix.at(0)] = new_node;
            // The insert will either fill the branch node's value slot or add a new leaf child
            BranchNode::new(choices).insert(state, path, value)
        } else {
            let new_extension = ExtensionNode::new(self.prefix.offset(match_index), self.child);
            let new_node = new_extension.insert(state, path.offset(match_index), value)?;
            self.prefix = self.prefix.slice(0, match_index);
            self.child = new_node.insert_self(state)?;
            Ok(self.into())
        }
    }

    /// Removes a value from the subtrie originating from this node given its path
    /// Returns the new root of the subtrie (if any) and the removed value if it existed in the subtrie
    pub fn remove(
        mut self,
        state: &TrieState,
        mut path: Nibbles,
    ) -> Result<(Option<Node>, Option<ValueRLP>), TrieError> {
        /* Possible flow paths:
            Extension { prefix, child } -> Extension { prefix, child } (no removal)
            Extension { prefix, child } -> None (full removal)
            Extension { prefix, child } -> Extension { prefix, child' } (child is still a branch node)
            Extension { prefix, child } -> Extension { prefix + child.prefix, child' } (child was an extension node)
            Extension { prefix, child } -> Leaf { prefix + child.partial, child.value } (child was a leaf node)
        */

        // Check if the value is part of the child subtrie according to the prefix
        if !path.skip_prefix(&self.prefix) {
            return Ok((Some(self.into()), None));
        }
        let child_node = state
            .get_node(self.child)?
            .ok_or(TrieError::MissingNode(self.child.finalize()))?;
        // Remove value from child subtrie
        let (child_node, old_value) = child_node.remove(state, path)?;
        // If no value was removed, return the node as-is
        if old_value.is_none() {
            return Ok((Some(self.into()), None));
        }
        // Restructure node based on removal
        let node = match child_node {
            // If there is no subtrie remove the node
            None => {
                state.mark_removed(self.child)?;
                None
            }
            Some(node) => Some(match node {
                // If it is a branch node set it as self's child
                Node::Branch(branch_node) => {
                    let new_child_hash = branch_node.insert_self(state)?;
                    if self.child != new_child_hash {
                        state.mark_removed(self.child)?;
                    }
                    self.child = new_child_hash;
                    self.into()
                }
                // If it is an extension replace self with it, updating its prefix
                Node::Extension(extension_node) => {
                    state.mark_removed(self.child)?;
                    self.prefix.extend(&extension_node.prefix);
                    self.child = extension_node.child;
                    self.into()
                }
                // If it is a leaf node replace self with it, updating its path
                Node::Leaf(mut leaf_node) => {
                    state.mark_removed(self.child)?;
                    leaf_node.partial = self.prefix.concat(&leaf_node.partial);
                    leaf_node.into()
                }
            }),
        };

        Ok((node, old_value))
    }

    /// Computes the node's hash
    pub fn compute_hash(&self) -> NodeHash {
        NodeHash::from_encoded_raw(&self.encode_raw())
    }

    /// Encodes the node
    pub fn encode_raw(&self) -> Vec<u8> {
        let mut buf = vec![];
        let mut encoder = Encoder::new(&mut buf).encode_bytes(&self.prefix.encode_compact());
        match &self.child {
            child if !child.is_valid() => encoder = encoder.encode_bytes(&[]),
            NodeHash::Inline(_) => encoder = encoder.encode_raw(self.child.as_ref()),
            NodeHash::Hashed(hash) => encoder = encoder.encode_bytes(hash.as_bytes()),
        }
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

#[cfg(test)]
mod test {
    use super::*;
    use crate::node::LeafNode;
    use ethereum_types::H256;
    use hex_literal::hex;

    #[test]
    fn new() {
        let node = ExtensionNode::new(Nibbles::default(), NodeHash::default());
        assert_eq!(node.prefix.len(), 0);
        assert_eq!(node.child, NodeHash::default());
    }

    #[test]
    fn encode_raw_hashed_child() {
        let node = ExtensionNode::new(
            Nibbles::from_hex(vec![1, 2]),
            NodeHash::from(H256([0xAB; 32])),
        );

        assert_eq!(
            node.encode_raw(),
            hex!("e4820012a0abababababababababababababababababababababababababababababababab")
        );
    }

    #[test]
    fn encode_raw_inline_child() {
        let child = LeafNode::new(Nibbles::from_bytes(&[0x12, 0x34]), b"coin".to_vec());
        let node = ExtensionNode::new(Nibbles::from_hex(vec![1, 2]), child.compute_hash());

        // The child's full encoding is spliced into the parent's encoding
        assert_eq!(node.encode_raw(), hex!("cd820012c98320123484636f696e"));
    }
}
