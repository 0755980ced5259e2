use crate::{
    ValueRLP, error::TrieError, nibbles::Nibbles, node::BranchNode, node_hash::NodeHash,
    state::TrieState,
};
use hexary_rlp::structs::Encoder;

use super::{ExtensionNode, Node};

/// Leaf Node of an Ethereum Compatible Merkle Patricia Trie
/// Contains the node's hash, value & path
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LeafNode {
    pub partial: Nibbles,
    pub value: ValueRLP,
}

impl LeafNode {
    /// Creates a new leaf node given its value
    pub const fn new(partial: Nibbles, value: ValueRLP) -> Self {
        Self { partial, value }
    }

    /// Returns the stored value if the given path matches the stored path
    pub fn get(&self, path: Nibbles) -> Result<Option<ValueRLP>, TrieError> {
        if self.partial == path {
            Ok(Some(self.value.clone()))
        } else {
            Ok(None)
        }
    }

    /// Stores the received value and returns the new root of the subtrie previously consisting of self
    pub fn insert(
        mut self,
        state: &TrieState,
        path: Nibbles,
        value: ValueRLP,
    ) -> Result<Node, TrieError> {
        /* Possible flow paths:
            Leaf { SelfValue } -> Leaf { Value }
            Leaf { SelfValue } -> Extension { Branch { [Self,...] Value } }
            Leaf { SelfValue } -> Extension { Branch { [ Leaf { Value } , ... ], SelfValue } }
            Leaf { SelfValue } -> Branch { [ Leaf { Value }, Self, ... ] }
        */
        // If the path matches the stored path, update the node's value
        if self.partial == path {
            self.value = value;
            return Ok(self.into());
        }
        let match_index = path.count_prefix(&self.partial);
        let branch_node = if self.partial.at(match_index) == 16 {
            // Create a new leaf node and store the value in it
            // Create a new branch node with the leaf as a child and store self's value
            let new_leaf = LeafNode::new(path.offset(match_index + 1), value);
            let mut choices = BranchNode::EMPTY_CHOICES;
            choices[path.at(match_index)] = new_leaf.insert_self(state)?;
            BranchNode::new_with_value(choices, self.value)
        } else if path.at(match_index) == 16 {
            // Create a new leaf node and store self's value in it
            // Create a new branch node with the leaf as a child and store the value
            let new_leaf = LeafNode::new(self.partial.offset(match_index + 1), self.value);
            let mut choices = BranchNode::EMPTY_CHOICES;
            choices[self.partial.at(match_index)] = new_leaf.insert_self(state)?;
            BranchNode::new_with_value(choices, value)
        } else {
            // Create a new leaf node and store the path and value in it
            // Create a new branch node with both leaves as children
            let new_leaf = LeafNode::new(path.offset(match_index + 1), value);
            let mut choices = BranchNode::EMPTY_CHOICES;
            choices[path.at(match_index)] = new_leaf.insert_self(state)?;
            let self_leaf = LeafNode::new(self.partial.offset(match_index + 1), self.value);
            choices[self.partial.at(match_index)] = self_leaf.insert_self(state)?;
            BranchNode::new(choices)
        };
        // Wrap the branch node in an extension node if both paths share a prefix
        let final_node: Node = if match_index == 0 {
            branch_node.into()
        } else {
            let branch_hash = branch_node.insert_self(state)?;
            ExtensionNode::new(path.slice(0, match_index), branch_hash).into()
        };
        Ok(final_node)
    }

    /// Removes own value if the path matches own path and returns self and the value if it was removed
    pub fn remove(self, path: Nibbles) -> Result<(Option<Node>, Option<ValueRLP>), TrieError> {
        Ok(if self.partial == path {
            (None, Some(self.value))
        } else {
            (Some(self.into()), None)
        })
    }

    /// Computes the node's hash
    pub fn compute_hash(&self) -> NodeHash {
        NodeHash::from_encoded_raw(&self.encode_raw())
    }

    /// Encodes the node
    pub fn encode_raw(&self) -> Vec<u8> {
        let mut buf = vec![];
        Encoder::new(&mut buf)
            .encode_bytes(&self.partial.encode_compact())
            .encode_bytes(&self.value)
            .finish();
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
    use hex_literal::hex;

    #[test]
    fn new() {
        let node = LeafNode::new(Nibbles::default(), Default::default());
        assert_eq!(node.value, ValueRLP::new());
    }

    #[test]
    fn get_some() {
        let node = LeafNode::new(Nibbles::from_bytes(&[0x12]), vec![0x12, 0x34, 0x56, 0x78]);

        assert_eq!(
            node.get(Nibbles::from_bytes(&[0x12])).unwrap(),
            Some(vec![0x12, 0x34, 0x56, 0x78]),
        );
    }

    #[test]
    fn get_none() {
        let node = LeafNode::new(Nibbles::from_bytes(&[0x12]), vec![0x12, 0x34, 0x56, 0x78]);

        assert!(node.get(Nibbles::from_bytes(&[0x34])).unwrap().is_none());
    }

    #[test]
    fn encode_raw_short() {
        let node = LeafNode::new(Nibbles::from_bytes(&[0x12, 0x34]), b"coin".to_vec());

        assert_eq!(node.encode_raw(), hex!("c98320123484636f696e"));
        // Encodings under 32 bytes are stored inline
        assert!(matches!(node.compute_hash(), NodeHash::Inline(_)));
    }

    #[test]
    fn encode_raw_long() {
        let node = LeafNode::new(Nibbles::from_bytes(&[0x12, 0x34]), vec![0x77; 32]);

        assert_eq!(
            node.compute_hash().finalize().0,
            hex!("dffc492674ed345db269bc4ee1cd28b9f266508b6b4559fca0dbc37b483583bb")
        );
    }

    #[test]
    fn remove_self() {
        let node = LeafNode::new(Nibbles::from_bytes(&[0x12, 0x34]), vec![0x12, 0x34, 0x56, 0x78]);
        let (node, value) = node.remove(Nibbles::from_bytes(&[0x12, 0x34])).unwrap();

        assert!(node.is_none());
        assert_eq!(value, Some(vec![0x12, 0x34, 0x56, 0x78]));
    }

    #[test]
    fn remove_none() {
        let node = LeafNode::new(Nibbles::from_bytes(&[0x12, 0x34]), vec![0x12, 0x34, 0x56, 0x78]);

        let (node, value) = node.remove(Nibbles::from_bytes(&[0x12])).unwrap();

        assert!(node.is_some());
        assert_eq!(value, None);
    }
}
