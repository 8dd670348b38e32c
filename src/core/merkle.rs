// Row-table Merkle tree used to commit a block's transactions to one root hash.
// Nodes live in a flat arena; rows, parents and siblings are indices into it.
// A row with an odd count promotes its last node unchanged into the next row,
// so that node is listed in both rows but is one arena entry.

use crate::error::MerkleError;
use crate::utils::{sha256_digest, CanonicalEncode};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone)]
struct MerkleNode<T> {
    hash: Vec<u8>,
    value: Option<T>,
    parent: Option<usize>,
    sibling: Option<usize>,
    // true when this node is the left operand of its parent's hash
    left: bool,
}

/// In-memory tree with resolved parent/sibling links
#[derive(Debug, Clone)]
pub struct MerkleTree<T> {
    nodes: Vec<MerkleNode<T>>,
    rows: Vec<Vec<usize>>,
}

/// Serialized node: links are carried as hashes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct MerkleEntry<T> {
    pub hash: Vec<u8>,
    pub parent: Option<Vec<u8>>,
    pub sibling: Option<Vec<u8>>,
    pub value: Option<T>,
}

/// Serialized row table, as stored inside a block
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct MerkleContent<T> {
    pub rows: Vec<Vec<MerkleEntry<T>>>,
}

impl<T> MerkleContent<T> {
    /// Leaf values in commit order
    pub fn leaves(&self) -> impl Iterator<Item = &T> {
        self.rows
            .first()
            .into_iter()
            .flatten()
            .filter_map(|entry| entry.value.as_ref())
    }
}

pub fn hash_pair(left: &[u8], right: &[u8]) -> Vec<u8> {
    let mut combined = Vec::with_capacity(left.len() + right.len());
    combined.extend_from_slice(left);
    combined.extend_from_slice(right);
    sha256_digest(&combined)
}

fn is_promoting(row_len: usize) -> bool {
    row_len > 1 && row_len % 2 == 1
}

impl<T: CanonicalEncode + Clone> MerkleTree<T> {
    pub fn build(items: &[T]) -> Result<MerkleTree<T>, MerkleError> {
        if items.is_empty() {
            return Err(MerkleError::Empty);
        }

        let mut nodes: Vec<MerkleNode<T>> = items
            .iter()
            .map(|item| MerkleNode {
                hash: sha256_digest(&item.canonical_bytes()),
                value: Some(item.clone()),
                parent: None,
                sibling: None,
                left: false,
            })
            .collect();
        let mut rows = vec![(0..nodes.len()).collect::<Vec<usize>>()];

        // A lone leaf is paired with itself so the table always has a root row
        if nodes.len() == 1 {
            let root = MerkleNode {
                hash: hash_pair(&nodes[0].hash, &nodes[0].hash),
                value: None,
                parent: None,
                sibling: None,
                left: false,
            };
            nodes.push(root);
            nodes[0].parent = Some(1);
            nodes[0].sibling = Some(0);
            nodes[0].left = true;
            rows.push(vec![1]);
        }

        while rows.last().map_or(0, |row| row.len()) > 1 {
            let current = rows.last().cloned().unwrap_or_default();
            let mut next = Vec::with_capacity((current.len() + 1) / 2);
            for pair in current.chunks(2) {
                match pair {
                    &[left, right] => {
                        let parent = nodes.len();
                        nodes.push(MerkleNode {
                            hash: hash_pair(&nodes[left].hash, &nodes[right].hash),
                            value: None,
                            parent: None,
                            sibling: None,
                            left: false,
                        });
                        nodes[left].parent = Some(parent);
                        nodes[left].sibling = Some(right);
                        nodes[left].left = true;
                        nodes[right].parent = Some(parent);
                        nodes[right].sibling = Some(left);
                        next.push(parent);
                    }
                    &[promoted] => next.push(promoted),
                    _ => unreachable!("chunks(2) yields one or two items"),
                }
            }
            rows.push(next);
        }

        Ok(MerkleTree { nodes, rows })
    }

    pub fn root_hash(&self) -> &[u8] {
        self.root()
            .map(|idx| self.nodes[idx].hash.as_slice())
            .unwrap_or_default()
    }

    pub fn leaf_count(&self) -> usize {
        self.rows.first().map_or(0, |row| row.len())
    }

    pub fn leaves(&self) -> impl Iterator<Item = &T> {
        self.rows
            .first()
            .into_iter()
            .flatten()
            .filter_map(|&idx| self.nodes[idx].value.as_ref())
    }

    /// Check every leaf against its value and every path up to the root.
    /// A mismatch is a `false`, not an error.
    pub fn validate(&self) -> bool {
        let Some(leaves) = self.rows.first() else {
            return false;
        };
        leaves.iter().all(|&leaf| self.leaf_is_valid(leaf))
    }

    /// Value of the leaf with this hash, if its proof path checks out
    pub fn get(&self, hash: &[u8]) -> Option<&T> {
        let leaf = *self
            .rows
            .first()?
            .iter()
            .find(|&&idx| self.nodes[idx].hash == hash)?;
        if !self.leaf_is_valid(leaf) {
            return None;
        }
        self.nodes[leaf].value.as_ref()
    }

    pub fn serialize(&self) -> MerkleContent<T> {
        let rows = self
            .rows
            .iter()
            .enumerate()
            .map(|(r, row)| {
                row.iter()
                    .map(|&idx| {
                        let node = &self.nodes[idx];
                        MerkleEntry {
                            hash: node.hash.clone(),
                            parent: node.parent.map(|p| self.nodes[p].hash.clone()),
                            sibling: node.sibling.map(|s| self.nodes[s].hash.clone()),
                            // promoted leaves repeat in upper rows without their value
                            value: if r == 0 { node.value.clone() } else { None },
                        }
                    })
                    .collect()
            })
            .collect();
        MerkleContent { rows }
    }

    /// Resolve a serialized table back into linked nodes
    pub fn rebuild(content: &MerkleContent<T>) -> Result<MerkleTree<T>, MerkleError> {
        let rows = &content.rows;
        if rows.len() < 2 {
            return Err(MerkleError::TooFewRows { rows: rows.len() });
        }
        if rows[0].is_empty() {
            return Err(MerkleError::Empty);
        }
        for i in 1..rows.len() {
            let expected = (rows[i - 1].len() + 1) / 2;
            if rows[i].len() != expected {
                return Err(MerkleError::RowSize {
                    row: i,
                    expected,
                    actual: rows[i].len(),
                });
            }
        }
        let last = rows.len() - 1;
        if rows[last].len() != 1 || (last > 1 && rows[last - 1].len() != 2) {
            return Err(MerkleError::RowSize {
                row: last,
                expected: 1,
                actual: rows[last].len(),
            });
        }

        // First pass: one arena node per distinct node, duplicate detection
        let mut nodes: Vec<MerkleNode<T>> = Vec::new();
        let mut links: Vec<(Option<Vec<u8>>, Option<Vec<u8>>)> = Vec::new();
        let mut by_hash: HashMap<Vec<u8>, usize> = HashMap::new();
        let mut table: Vec<Vec<usize>> = Vec::with_capacity(rows.len());

        for (r, row) in rows.iter().enumerate() {
            let mut indices = Vec::with_capacity(row.len());
            for (pos, entry) in row.iter().enumerate() {
                if (r == 0) != entry.value.is_some() {
                    return Err(MerkleError::MisplacedValue { row: r, position: pos });
                }

                let promoted = r > 0 && is_promoting(rows[r - 1].len()) && pos == row.len() - 1;
                if promoted {
                    let from = *table[r - 1].last().ok_or(MerkleError::BrokenPromotion { row: r })?;
                    if nodes[from].hash != entry.hash {
                        return Err(MerkleError::BrokenPromotion { row: r });
                    }
                    links[from] = (entry.parent.clone(), entry.sibling.clone());
                    indices.push(from);
                    continue;
                }

                if by_hash.contains_key(&entry.hash) {
                    return Err(MerkleError::DuplicateHash {
                        row: r,
                        hash: entry.hash.clone(),
                    });
                }
                let idx = nodes.len();
                by_hash.insert(entry.hash.clone(), idx);
                nodes.push(MerkleNode {
                    hash: entry.hash.clone(),
                    value: entry.value.clone(),
                    parent: None,
                    sibling: None,
                    left: false,
                });
                links.push((entry.parent.clone(), entry.sibling.clone()));
                indices.push(idx);
            }
            table.push(indices);
        }

        // Second pass: resolve links row by row; the root keeps none
        for r in 0..last {
            let row = &table[r];
            let next: HashSet<usize> = table[r + 1].iter().copied().collect();
            let mut parents: HashSet<usize> = HashSet::new();
            let mut promoted_out = 0;

            for (pos, &idx) in row.iter().enumerate() {
                if is_promoting(row.len()) && pos == row.len() - 1 {
                    promoted_out = 1;
                    continue;
                }

                let (parent_hash, sibling_hash) = &links[idx];
                let parent = parent_hash
                    .as_ref()
                    .and_then(|hash| by_hash.get(hash))
                    .copied()
                    .filter(|p| next.contains(p))
                    .ok_or_else(|| MerkleError::MissingParent {
                        row: r,
                        hash: nodes[idx].hash.clone(),
                    })?;
                let partner = if row.len() == 1 { idx } else { row[pos ^ 1] };
                let sibling = sibling_hash
                    .as_ref()
                    .and_then(|hash| by_hash.get(hash))
                    .copied()
                    .filter(|&s| s == partner)
                    .ok_or_else(|| MerkleError::MissingSibling {
                        row: r,
                        hash: nodes[idx].hash.clone(),
                    })?;

                nodes[idx].parent = Some(parent);
                nodes[idx].sibling = Some(sibling);
                nodes[idx].left = pos % 2 == 0;
                parents.insert(parent);
            }

            let distinct = parents.len() + promoted_out;
            if distinct < table[r + 1].len() {
                return Err(MerkleError::ParentCount {
                    row: r,
                    distinct,
                    expected: table[r + 1].len(),
                });
            }
        }

        Ok(MerkleTree { nodes, rows: table })
    }

    fn root(&self) -> Option<usize> {
        self.rows.last().and_then(|row| row.first()).copied()
    }

    fn leaf_is_valid(&self, leaf: usize) -> bool {
        let node = &self.nodes[leaf];
        match &node.value {
            Some(value) if sha256_digest(&value.canonical_bytes()) == node.hash => {}
            _ => return false,
        }

        let root = self.root();
        let mut current = leaf;
        // Each step climbs one row; more steps than rows means a broken table
        for _ in 0..self.rows.len() {
            let node = &self.nodes[current];
            let Some(parent) = node.parent else {
                return Some(current) == root;
            };
            let Some(sibling) = node.sibling else {
                return false;
            };
            let sibling_node = &self.nodes[sibling];
            if sibling_node.parent != Some(parent) {
                return false;
            }
            let expected = if node.left {
                hash_pair(&node.hash, &sibling_node.hash)
            } else {
                hash_pair(&sibling_node.hash, &node.hash)
            };
            if self.nodes[parent].hash != expected {
                return false;
            }
            current = parent;
        }
        false
    }
}
