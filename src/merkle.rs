//! Merkle tree over the 64-bit physical address space
//!
//! The tree is a full binary hash tree of height 61 with 8-byte leaves,
//! stored sparsely: subtrees whose leaves are all zero are represented by
//! precomputed pristine hashes and only dirty paths are materialized in a
//! hash table keyed by `(log2_size, address)`.

use fnv::FnvHashMap;
use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};

/// Keccak-256 digest of a tree node.
pub type Hash = [u8; 32];

/// log2 of the leaf size in bytes (one 64-bit word).
pub const LOG2_WORD_SIZE: u32 = 3;
/// log2 of a page, the update granularity.
pub const LOG2_PAGE_SIZE: u32 = 12;
/// log2 of the whole address space.
pub const LOG2_ROOT_SIZE: u32 = 64;

pub const PAGE_SIZE: usize = 1 << LOG2_PAGE_SIZE;

/// Merkle proof that a target node belongs to the tree under `root_hash`.
///
/// `sibling_hashes[i]` is the sibling of the node on the path at size
/// `log2_size + i`, ordered from the leaf side up to just below the root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proof {
    pub address: u64,
    pub log2_size: u32,
    pub target_hash: Hash,
    pub root_hash: Hash,
    pub sibling_hashes: Vec<Hash>,
}

/// Hashes one 64-bit word as stored in a leaf.
pub fn hash_word(word: u64) -> Hash {
    let mut hasher = Keccak256::new();
    hasher.update(word.to_le_bytes());
    hasher.finalize().into()
}

/// Hashes the concatenation of two child hashes.
pub fn hash_pair(left: &Hash, right: &Hash) -> Hash {
    let mut hasher = Keccak256::new();
    hasher.update(left);
    hasher.update(right);
    hasher.finalize().into()
}

/// Recomputes a root hash by rolling `from` up the tree along `address`,
/// consuming one sibling per level from `log2_size` to just below the root.
pub fn roll_hash_up(address: u64, log2_size: u32, from: Hash, siblings: &[Hash]) -> Hash {
    let mut rolling = from;
    for (i, sibling) in siblings.iter().enumerate() {
        let log2 = log2_size + i as u32;
        if address & (1u64 << log2) != 0 {
            rolling = hash_pair(sibling, &rolling);
        } else {
            rolling = hash_pair(&rolling, sibling);
        }
    }
    rolling
}

/// Sparse pristine-aware Merkle tree.
pub struct MerkleTree {
    /// Materialized nodes, keyed by (log2_size, aligned address).
    nodes: FnvHashMap<(u32, u64), Hash>,
    /// Pristine hash per log2_size (index 0..=64, entries below the word
    /// size unused).
    pristine: [Hash; LOG2_ROOT_SIZE as usize + 1],
    updating: bool,
}

impl MerkleTree {
    pub fn new() -> Self {
        let mut pristine = [[0u8; 32]; LOG2_ROOT_SIZE as usize + 1];
        pristine[LOG2_WORD_SIZE as usize] = hash_word(0);
        for log2 in LOG2_WORD_SIZE + 1..=LOG2_ROOT_SIZE {
            let below = pristine[log2 as usize - 1];
            pristine[log2 as usize] = hash_pair(&below, &below);
        }
        MerkleTree {
            nodes: FnvHashMap::default(),
            pristine,
            updating: false,
        }
    }

    /// Pristine hash of a subtree of the given size.
    pub fn pristine_hash(&self, log2_size: u32) -> Hash {
        self.pristine[log2_size as usize]
    }

    fn node_hash(&self, log2_size: u32, address: u64) -> Hash {
        match self.nodes.get(&(log2_size, address)) {
            Some(hash) => *hash,
            None => self.pristine[log2_size as usize],
        }
    }

    pub fn begin_update(&mut self) {
        debug_assert!(!self.updating);
        self.updating = true;
    }

    pub fn end_update(&mut self) {
        debug_assert!(self.updating);
        self.updating = false;
    }

    /// True when no node for the page is materialized yet, so an all-zero
    /// page update can be skipped.
    pub fn is_page_pristine(&self, page_address: u64) -> bool {
        !self
            .nodes
            .contains_key(&(LOG2_PAGE_SIZE, page_address & !(PAGE_SIZE as u64 - 1)))
    }

    /// Recomputes the subtree for one 4 KiB page and the path from the page
    /// root up to the tree root.
    pub fn update_page(&mut self, page_address: u64, page: &[u8; PAGE_SIZE]) {
        debug_assert_eq!(page_address & (PAGE_SIZE as u64 - 1), 0);
        // Leaf level: one hash per 8-byte word.
        let words = PAGE_SIZE / 8;
        for i in 0..words {
            let word = u64::from_le_bytes(page[i * 8..i * 8 + 8].try_into().unwrap());
            let addr = page_address + (i as u64) * 8;
            self.nodes.insert((LOG2_WORD_SIZE, addr), hash_word(word));
        }
        // Inner page levels up to the page root.
        for log2 in LOG2_WORD_SIZE..LOG2_PAGE_SIZE {
            let span = 1u64 << (log2 + 1);
            let count = (PAGE_SIZE as u64) >> (log2 + 1);
            for i in 0..count {
                let addr = page_address + i * span;
                let left = self.node_hash(log2, addr);
                let right = self.node_hash(log2, addr + (span >> 1));
                self.nodes.insert((log2 + 1, addr), hash_pair(&left, &right));
            }
        }
        // Path from the page root to the tree root.
        self.update_path(LOG2_PAGE_SIZE, page_address);
    }

    /// Recomputes ancestors of the node at `(log2_size, address)`.
    fn update_path(&mut self, log2_size: u32, address: u64) {
        let mut addr = address;
        for log2 in log2_size..LOG2_ROOT_SIZE {
            let sibling = addr ^ (1u64 << log2);
            let (left, right) = if addr & (1u64 << log2) != 0 {
                (self.node_hash(log2, sibling), self.node_hash(log2, addr))
            } else {
                (self.node_hash(log2, addr), self.node_hash(log2, sibling))
            };
            addr &= !(1u64 << log2) & !((1u64 << log2) - 1);
            self.nodes.insert((log2 + 1, addr), hash_pair(&left, &right));
        }
    }

    pub fn root_hash(&self) -> Hash {
        self.node_hash(LOG2_ROOT_SIZE, 0)
    }

    /// Builds a proof for the node of size `2^log2_size` at `address`.
    ///
    /// Returns `None` when `log2_size` is out of `[3, 64]` or `address` is
    /// not aligned to the node size.
    pub fn get_proof(&self, address: u64, log2_size: u32) -> Option<Proof> {
        if !(LOG2_WORD_SIZE..=LOG2_ROOT_SIZE).contains(&log2_size) {
            return None;
        }
        if log2_size < 64 && address & ((1u64 << log2_size) - 1) != 0 {
            return None;
        }
        let mut sibling_hashes = Vec::with_capacity((LOG2_ROOT_SIZE - log2_size) as usize);
        let mut addr = address;
        for log2 in log2_size..LOG2_ROOT_SIZE {
            addr &= !((1u64 << log2) - 1);
            sibling_hashes.push(self.node_hash(log2, addr ^ (1u64 << log2)));
        }
        Some(Proof {
            address,
            log2_size,
            target_hash: self.node_hash(log2_size, address),
            root_hash: self.root_hash(),
            sibling_hashes,
        })
    }

    /// Recomputes the root from the target hash and siblings and compares
    /// it against the proof's `root_hash`.
    pub fn verify_proof(proof: &Proof) -> bool {
        if !(LOG2_WORD_SIZE..=LOG2_ROOT_SIZE).contains(&proof.log2_size) {
            return false;
        }
        if proof.sibling_hashes.len() != (LOG2_ROOT_SIZE - proof.log2_size) as usize {
            return false;
        }
        let rolling = roll_hash_up(
            proof.address,
            proof.log2_size,
            proof.target_hash,
            &proof.sibling_hashes,
        );
        rolling == proof.root_hash
    }
}

impl Default for MerkleTree {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pristine_chain() {
        let tree = MerkleTree::new();
        let word = hash_word(0);
        assert_eq!(tree.pristine_hash(3), word);
        assert_eq!(tree.pristine_hash(4), hash_pair(&word, &word));
        // An empty tree's root is the pristine hash of the whole space.
        assert_eq!(tree.root_hash(), tree.pristine_hash(64));
    }

    #[test]
    fn single_word_update() {
        let mut tree = MerkleTree::new();
        let mut page = [0u8; PAGE_SIZE];
        page[..8].copy_from_slice(&0xDEADBEEF_CAFEBABEu64.to_le_bytes());
        tree.begin_update();
        tree.update_page(0x8000_0000, &page);
        tree.end_update();

        let proof = tree.get_proof(0x8000_0000, 3).unwrap();
        assert_eq!(proof.target_hash, hash_word(0xDEADBEEF_CAFEBABE));
        assert_eq!(proof.root_hash, tree.root_hash());
        assert!(MerkleTree::verify_proof(&proof));
    }

    #[test]
    fn zero_update_keeps_pristine_root() {
        let mut tree = MerkleTree::new();
        let page = [0u8; PAGE_SIZE];
        tree.update_page(0, &page);
        assert_eq!(tree.root_hash(), tree.pristine_hash(64));
    }

    #[test]
    fn proof_rejects_tamper() {
        let mut tree = MerkleTree::new();
        let mut page = [0u8; PAGE_SIZE];
        page[0] = 1;
        tree.update_page(0x1000, &page);

        let mut proof = tree.get_proof(0x1000, 3).unwrap();
        assert!(MerkleTree::verify_proof(&proof));
        proof.target_hash = hash_word(2);
        assert!(!MerkleTree::verify_proof(&proof));
    }

    #[test]
    fn proofs_at_every_size() {
        let mut tree = MerkleTree::new();
        let mut page = [0u8; PAGE_SIZE];
        page[8] = 0xAB;
        tree.update_page(0x2000, &page);
        for log2 in 3..=64u32 {
            let address = if log2 >= 64 { 0 } else { 0x2000 & !((1u64 << log2) - 1) };
            let proof = tree.get_proof(address, log2).unwrap();
            assert!(MerkleTree::verify_proof(&proof), "log2_size {log2}");
        }
    }

    #[test]
    fn misaligned_proof_rejected() {
        let tree = MerkleTree::new();
        assert!(tree.get_proof(4, 3).is_none());
        assert!(tree.get_proof(0, 2).is_none());
        assert!(tree.get_proof(0x1008, 4).is_none());
    }

    #[test]
    fn update_refreshes_path() {
        let mut tree = MerkleTree::new();
        let mut page = [0u8; PAGE_SIZE];
        page[..8].copy_from_slice(&1u64.to_le_bytes());
        tree.update_page(0, &page);
        let root_one = tree.root_hash();

        page[..8].copy_from_slice(&2u64.to_le_bytes());
        tree.update_page(0, &page);
        assert_ne!(tree.root_hash(), root_one);

        page[..8].copy_from_slice(&1u64.to_le_bytes());
        tree.update_page(0, &page);
        assert_eq!(tree.root_hash(), root_one);
    }
}
