use ethereum_types::H256;
use sha3::{Digest, Keccak256};

/// Struct representing a trie node hash
/// If the encoded node is less than 32 bytes, contains the encoded node itself
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeHash {
    Hashed(H256),
    Inline(([u8; 31], u8)),
}

impl NodeHash {
    /// Returns the `NodeHash` of an encoded node, inlining the encoding if it fits
    pub fn from_encoded_raw(encoded: &[u8]) -> NodeHash {
        if encoded.len() >= 32 {
            let hash = Keccak256::new().chain_update(encoded).finalize();
            NodeHash::Hashed(H256::from_slice(hash.as_slice()))
        } else {
            NodeHash::from_slice(encoded)
        }
    }

    /// Returns the finalized hash
    /// NOTE: This will hash smaller nodes, only use when reporting a root hash
    pub fn finalize(self) -> H256 {
        match self {
            NodeHash::Inline((data, len)) => H256::from_slice(
                Keccak256::new()
                    .chain_update(&data[..len as usize])
                    .finalize()
                    .as_slice(),
            ),
            NodeHash::Hashed(hash) => hash,
        }
    }

    /// Returns true if the hash is valid
    /// The hash will only be considered invalid if it is empty
    /// Aka if it has a default value instead of a proper hash
    pub fn is_valid(&self) -> bool {
        !matches!(self, NodeHash::Inline((_, 0)))
    }

    /// Const version of `Default` trait impl
    pub const fn const_default() -> NodeHash {
        NodeHash::Inline(([0; 31], 0))
    }

    /// Builds a `NodeHash` from a hash or inline slice, must not exceed 32 bytes
    pub(crate) fn from_slice(slice: &[u8]) -> NodeHash {
        match slice.len() {
            32 => NodeHash::Hashed(H256::from_slice(slice)),
            len => {
                let mut buffer = [0; 31];
                buffer[..len].copy_from_slice(slice);
                NodeHash::Inline((buffer, len as u8))
            }
        }
    }
}

impl From<H256> for NodeHash {
    fn from(value: H256) -> Self {
        NodeHash::Hashed(value)
    }
}

impl AsRef<[u8]> for NodeHash {
    fn as_ref(&self) -> &[u8] {
        match self {
            NodeHash::Inline((data, len)) => &data[..*len as usize],
            NodeHash::Hashed(hash) => hash.as_bytes(),
        }
    }
}

impl Default for NodeHash {
    fn default() -> Self {
        Self::const_default()
    }
}
