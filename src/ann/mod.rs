//! Approximate nearest-neighbor index
//!
//! A forest of random-projection trees over unit vectors with angular
//! distance, in the annoy style: each split node holds the normal of a
//! hyperplane between two randomly chosen points; queries walk all trees
//! best-first and re-rank the gathered candidates by exact distance.
//!
//! # Staleness contract
//!
//! `add` stages an item; it is invisible to `query` until the next
//! `build()`. At most one record exists per fingerprint: a staged add for
//! a known fingerprint evicts the older record at build time.
//!
//! # Persistence
//!
//! `save` writes a little-endian binary (`ann.index`) plus a
//! human-readable metadata document (`ann.meta`). `load` memory-maps the
//! index file so resident memory follows the pages queries touch, not the
//! total vector count.

use memmap2::Mmap;
use serde::{Deserialize, Serialize};
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::io::{BufWriter, Write};
use std::path::Path;
use thiserror::Error;

/// Index file magic + format version.
const INDEX_MAGIC: &[u8; 8] = b"HSANN01\0";
/// Vectors start here; keeps the block 4-byte aligned with room for the header.
const VECTOR_BLOCK_OFFSET: usize = 64;
/// Items per leaf before a node stops splitting.
const LEAF_SIZE: usize = 16;
/// Hard depth bound; beyond it everything lands in one leaf.
const MAX_DEPTH: usize = 48;

#[derive(Debug, Error)]
pub enum AnnError {
    #[error("index file format error: {0}")]
    Format(String),
    #[error("vector dimension {got} does not match index dimension {expected}")]
    DimensionMismatch { got: usize, expected: usize },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Metadata carried with each embedding record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemMeta {
    pub fingerprint: String,
    /// Event id of the canonical example this vector was encoded from.
    pub command_ref: i64,
    pub insert_ts_ns: i64,
}

/// Sidecar metadata document (`ann.meta`): JSON, human-readable, nothing
/// executable.
#[derive(Debug, Serialize, Deserialize)]
pub struct AnnMetaDoc {
    pub generation: u64,
    pub fingerprints: Vec<String>,
}

enum VectorSlot {
    /// Byte offset into the mapped index file.
    Mapped(usize),
    Owned(Vec<f32>),
}

enum Node {
    Split {
        normal: Vec<f32>,
        left: u32,
        right: u32,
    },
    Leaf(Vec<u32>),
}

struct Tree {
    nodes: Vec<Node>,
    root: u32,
}

/// The index. Query is a read operation; add/build/load are writes. The
/// owner wraps this in an `RwLock`.
pub struct AnnIndex {
    dim: usize,
    tree_count: usize,
    generation: u64,
    items: Vec<(VectorSlot, ItemMeta)>,
    pending: Vec<(Vec<f32>, ItemMeta)>,
    pending_by_fingerprint: HashMap<String, usize>,
    trees: Vec<Tree>,
    mmap: Option<Mmap>,
    built: bool,
    build_seed: u64,
}

impl AnnIndex {
    pub fn new(dim: usize, tree_count: usize) -> Self {
        Self {
            dim,
            tree_count: tree_count.max(1),
            generation: 0,
            items: Vec::new(),
            pending: Vec::new(),
            pending_by_fingerprint: HashMap::new(),
            trees: Vec::new(),
            mmap: None,
            built: false,
            build_seed: 0x5eed_ba5e,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn set_generation(&mut self, generation: u64) {
        self.generation = generation;
    }

    pub fn is_built(&self) -> bool {
        self.built
    }

    /// Number of queryable items.
    pub fn size(&self) -> usize {
        self.items.len()
    }

    /// Number of staged additions awaiting the next build.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Stage a vector for the next build. A stale add for a fingerprint
    /// already staged replaces it in place.
    pub fn add(&mut self, mut vector: Vec<f32>, meta: ItemMeta) -> Result<(), AnnError> {
        if vector.len() != self.dim {
            return Err(AnnError::DimensionMismatch {
                got: vector.len(),
                expected: self.dim,
            });
        }
        normalize(&mut vector);
        if let Some(&slot) = self.pending_by_fingerprint.get(&meta.fingerprint) {
            self.pending[slot] = (vector, meta);
            return Ok(());
        }
        self.pending_by_fingerprint
            .insert(meta.fingerprint.clone(), self.pending.len());
        self.pending.push((vector, meta));
        Ok(())
    }

    /// Merge staged additions (evicting superseded records) and rebuild
    /// the tree forest. Afterwards every staged item is queryable.
    pub fn build(&mut self) {
        if self.pending.is_empty() && self.built {
            // no intervening adds: a rebuild would change nothing
            return;
        }

        // materialize survivors, then append staged items
        let mut merged: Vec<(Vec<f32>, ItemMeta)> = Vec::new();
        let old_items = std::mem::take(&mut self.items);
        for (idx, (_, meta)) in old_items.iter().enumerate() {
            if self.pending_by_fingerprint.contains_key(&meta.fingerprint) {
                continue; // evicted by a newer record
            }
            merged.push((self.vector_owned_from(&old_items, idx), meta.clone()));
        }
        merged.append(&mut self.pending);
        self.pending_by_fingerprint.clear();
        self.mmap = None;

        let vectors: Vec<&[f32]> = merged.iter().map(|(v, _)| v.as_slice()).collect();
        self.trees = build_forest(&vectors, self.dim, self.tree_count, self.build_seed);

        self.items = merged
            .into_iter()
            .map(|(v, meta)| (VectorSlot::Owned(v), meta))
            .collect();
        self.built = true;
    }

    /// K nearest items by angular distance, ascending. Empty until the
    /// first `build()`.
    pub fn query(&self, vector: &[f32], k: usize) -> Vec<(ItemMeta, f32)> {
        if !self.built || self.items.is_empty() || k == 0 || vector.len() != self.dim {
            return Vec::new();
        }
        let mut q = vector.to_vec();
        normalize(&mut q);

        let search_k = (k * self.tree_count * 8).max(128);
        let mut candidates: Vec<u32> = Vec::with_capacity(search_k);
        let mut heap: BinaryHeap<HeapEntry> = BinaryHeap::new();
        for (tree_idx, tree) in self.trees.iter().enumerate() {
            heap.push(HeapEntry {
                priority: f32::INFINITY,
                tree: tree_idx as u32,
                node: tree.root,
            });
        }

        while let Some(entry) = heap.pop() {
            if candidates.len() >= search_k {
                break;
            }
            let tree = &self.trees[entry.tree as usize];
            match &tree.nodes[entry.node as usize] {
                Node::Leaf(ids) => candidates.extend_from_slice(ids),
                Node::Split { normal, left, right } => {
                    let margin = dot(normal, &q);
                    heap.push(HeapEntry {
                        priority: entry.priority.min(margin),
                        tree: entry.tree,
                        node: *right,
                    });
                    heap.push(HeapEntry {
                        priority: entry.priority.min(-margin),
                        tree: entry.tree,
                        node: *left,
                    });
                }
            }
        }

        let unique: HashSet<u32> = candidates.into_iter().collect();
        let mut scored: Vec<(u32, f32)> = unique
            .into_iter()
            .map(|id| (id, self.angular_distance(id as usize, &q)))
            .collect();
        scored.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
        scored
            .into_iter()
            .take(k)
            .map(|(id, distance)| (self.items[id as usize].1.clone(), distance))
            .collect()
    }

    /// Angular distance to item `idx` in cosine form: 1 − cos, in [0, 2].
    /// Monotone in the angle between unit vectors; 0 means identical.
    fn angular_distance(&self, idx: usize, q: &[f32]) -> f32 {
        let cos = self.dot_item(idx, q);
        (1.0f32 - cos).max(0.0)
    }

    fn dot_item(&self, idx: usize, q: &[f32]) -> f32 {
        match &self.items[idx].0 {
            VectorSlot::Owned(v) => dot(v, q),
            VectorSlot::Mapped(offset) => {
                let Some(mmap) = &self.mmap else {
                    return 0.0;
                };
                let bytes = &mmap[*offset..*offset + self.dim * 4];
                bytes
                    .chunks_exact(4)
                    .zip(q.iter())
                    .map(|(b, x)| f32::from_le_bytes([b[0], b[1], b[2], b[3]]) * x)
                    .sum()
            }
        }
    }

    fn vector_owned_from(&self, items: &[(VectorSlot, ItemMeta)], idx: usize) -> Vec<f32> {
        match &items[idx].0 {
            VectorSlot::Owned(v) => v.clone(),
            VectorSlot::Mapped(offset) => {
                let Some(mmap) = &self.mmap else {
                    return vec![0.0; self.dim];
                };
                let bytes = &mmap[*offset..*offset + self.dim * 4];
                bytes
                    .chunks_exact(4)
                    .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                    .collect()
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Persistence
    // ─────────────────────────────────────────────────────────────────────

    /// Write `ann.index` (binary) and `ann.meta` (JSON) atomically.
    pub fn save(&self, index_path: &Path, meta_path: &Path) -> Result<(), AnnError> {
        let tmp_path = index_path.with_extension("index.tmp");
        {
            let file = std::fs::File::create(&tmp_path)?;
            let mut w = BufWriter::new(file);

            w.write_all(INDEX_MAGIC)?;
            w.write_all(&(self.dim as u32).to_le_bytes())?;
            w.write_all(&(self.tree_count as u32).to_le_bytes())?;
            w.write_all(&(self.items.len() as u32).to_le_bytes())?;
            w.write_all(&self.generation.to_le_bytes())?;
            let header_len = 8 + 4 + 4 + 4 + 8;
            w.write_all(&vec![0u8; VECTOR_BLOCK_OFFSET - header_len])?;

            for idx in 0..self.items.len() {
                let v = self.vector_owned_from(&self.items, idx);
                for value in &v {
                    w.write_all(&value.to_le_bytes())?;
                }
            }

            for (_, meta) in &self.items {
                let bytes = meta.fingerprint.as_bytes();
                w.write_all(&(bytes.len() as u16).to_le_bytes())?;
                w.write_all(bytes)?;
                w.write_all(&meta.command_ref.to_le_bytes())?;
                w.write_all(&meta.insert_ts_ns.to_le_bytes())?;
            }

            w.write_all(&(self.trees.len() as u32).to_le_bytes())?;
            for tree in &self.trees {
                w.write_all(&tree.root.to_le_bytes())?;
                w.write_all(&(tree.nodes.len() as u32).to_le_bytes())?;
                for node in &tree.nodes {
                    match node {
                        Node::Split { normal, left, right } => {
                            w.write_all(&[0u8])?;
                            for value in normal {
                                w.write_all(&value.to_le_bytes())?;
                            }
                            w.write_all(&left.to_le_bytes())?;
                            w.write_all(&right.to_le_bytes())?;
                        }
                        Node::Leaf(ids) => {
                            w.write_all(&[1u8])?;
                            w.write_all(&(ids.len() as u32).to_le_bytes())?;
                            for id in ids {
                                w.write_all(&id.to_le_bytes())?;
                            }
                        }
                    }
                }
            }
            w.flush()?;
        }
        std::fs::rename(&tmp_path, index_path)?;
        crate::util::restrict_file_permissions(index_path)?;

        let doc = AnnMetaDoc {
            generation: self.generation,
            fingerprints: self.items.iter().map(|(_, m)| m.fingerprint.clone()).collect(),
        };
        let json = serde_json::to_string_pretty(&doc)
            .map_err(|e| AnnError::Format(e.to_string()))?;
        let meta_tmp = meta_path.with_extension("meta.tmp");
        std::fs::write(&meta_tmp, json)?;
        std::fs::rename(&meta_tmp, meta_path)?;
        crate::util::restrict_file_permissions(meta_path)?;
        Ok(())
    }

    /// Load an index, memory-mapping the vector block. Trees and metadata
    /// are small and parsed eagerly.
    pub fn load(index_path: &Path, expected_dim: usize, tree_count: usize) -> Result<Self, AnnError> {
        let file = std::fs::File::open(index_path)?;
        // read-only map of a file this daemon exclusively owns
        let mmap = unsafe { Mmap::map(&file)? };

        let mut r = ByteReader::new(&mmap);
        let magic = r.take(8)?;
        if magic != INDEX_MAGIC {
            return Err(AnnError::Format("bad magic".to_string()));
        }
        let dim = r.u32()? as usize;
        let stored_trees = r.u32()? as usize;
        let item_count = r.u32()? as usize;
        let generation = r.u64()?;
        if dim != expected_dim {
            return Err(AnnError::DimensionMismatch {
                got: dim,
                expected: expected_dim,
            });
        }

        let vector_bytes = item_count
            .checked_mul(dim * 4)
            .ok_or_else(|| AnnError::Format("item count overflow".to_string()))?;
        if mmap.len() < VECTOR_BLOCK_OFFSET + vector_bytes {
            return Err(AnnError::Format("truncated vector block".to_string()));
        }

        r.seek(VECTOR_BLOCK_OFFSET + vector_bytes);
        let mut items = Vec::with_capacity(item_count);
        for idx in 0..item_count {
            let len = r.u16()? as usize;
            let bytes = r.take(len)?;
            let fingerprint = String::from_utf8(bytes.to_vec())
                .map_err(|_| AnnError::Format("non-UTF-8 fingerprint".to_string()))?;
            let command_ref = r.i64()?;
            let insert_ts_ns = r.i64()?;
            items.push((
                VectorSlot::Mapped(VECTOR_BLOCK_OFFSET + idx * dim * 4),
                ItemMeta {
                    fingerprint,
                    command_ref,
                    insert_ts_ns,
                },
            ));
        }

        let tree_len = r.u32()? as usize;
        if tree_len != stored_trees {
            return Err(AnnError::Format("tree count mismatch".to_string()));
        }
        let mut trees = Vec::with_capacity(tree_len);
        for _ in 0..tree_len {
            let root = r.u32()?;
            let node_count = r.u32()? as usize;
            let mut nodes = Vec::with_capacity(node_count);
            for _ in 0..node_count {
                let tag = r.u8()?;
                match tag {
                    0 => {
                        let mut normal = Vec::with_capacity(dim);
                        for _ in 0..dim {
                            normal.push(r.f32()?);
                        }
                        let left = r.u32()?;
                        let right = r.u32()?;
                        nodes.push(Node::Split { normal, left, right });
                    }
                    1 => {
                        let len = r.u32()? as usize;
                        let mut ids = Vec::with_capacity(len);
                        for _ in 0..len {
                            ids.push(r.u32()?);
                        }
                        nodes.push(Node::Leaf(ids));
                    }
                    other => {
                        return Err(AnnError::Format(format!("unknown node tag {}", other)));
                    }
                }
            }
            trees.push(Tree { nodes, root });
        }

        Ok(Self {
            dim,
            tree_count: tree_count.max(1),
            generation,
            items,
            pending: Vec::new(),
            pending_by_fingerprint: HashMap::new(),
            trees,
            mmap: Some(mmap),
            built: true,
            build_seed: 0x5eed_ba5e,
        })
    }
}

struct HeapEntry {
    priority: f32,
    tree: u32,
    node: u32,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.tree == other.tree && self.node == other.node
    }
}
impl Eq for HeapEntry {}
impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.priority
            .total_cmp(&other.priority)
            .then(self.tree.cmp(&other.tree))
            .then(self.node.cmp(&other.node))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Forest construction
// ─────────────────────────────────────────────────────────────────────────────

fn build_forest(vectors: &[&[f32]], dim: usize, tree_count: usize, seed: u64) -> Vec<Tree> {
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    let ids: Vec<u32> = (0..vectors.len() as u32).collect();
    (0..tree_count)
        .map(|t| {
            let mut rng = StdRng::seed_from_u64(seed ^ (t as u64).wrapping_mul(0x9e37_79b9));
            let mut nodes = Vec::new();
            let root = build_node(vectors, dim, ids.clone(), 0, &mut rng, &mut nodes);
            Tree { nodes, root }
        })
        .collect()
}

fn build_node(
    vectors: &[&[f32]],
    dim: usize,
    ids: Vec<u32>,
    depth: usize,
    rng: &mut rand::rngs::StdRng,
    nodes: &mut Vec<Node>,
) -> u32 {
    use rand::Rng;

    if ids.len() <= LEAF_SIZE || depth >= MAX_DEPTH {
        nodes.push(Node::Leaf(ids));
        return (nodes.len() - 1) as u32;
    }

    // hyperplane between two random distinct points
    let mut normal = vec![0.0f32; dim];
    let mut found = false;
    for _ in 0..3 {
        let a = ids[rng.gen_range(0..ids.len())] as usize;
        let b = ids[rng.gen_range(0..ids.len())] as usize;
        if a == b {
            continue;
        }
        for i in 0..dim {
            normal[i] = vectors[a][i] - vectors[b][i];
        }
        let norm: f32 = normal.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 1e-6 {
            for x in normal.iter_mut() {
                *x /= norm;
            }
            found = true;
            break;
        }
    }
    if !found {
        nodes.push(Node::Leaf(ids));
        return (nodes.len() - 1) as u32;
    }

    let mut left = Vec::new();
    let mut right = Vec::new();
    for &id in &ids {
        let side = dot(vectors[id as usize], &normal);
        if side > 0.0 || (side == 0.0 && rng.gen_bool(0.5)) {
            right.push(id);
        } else {
            left.push(id);
        }
    }
    // a degenerate split makes no progress; balance it randomly
    if left.is_empty() || right.is_empty() {
        left.clear();
        right.clear();
        for &id in &ids {
            if rng.gen_bool(0.5) {
                right.push(id);
            } else {
                left.push(id);
            }
        }
        if left.is_empty() || right.is_empty() {
            nodes.push(Node::Leaf(ids));
            return (nodes.len() - 1) as u32;
        }
    }

    let left_idx = build_node(vectors, dim, left, depth + 1, rng, nodes);
    let right_idx = build_node(vectors, dim, right, depth + 1, rng, nodes);
    nodes.push(Node::Split {
        normal,
        left: left_idx,
        right: right_idx,
    });
    (nodes.len() - 1) as u32
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

fn normalize(vector: &mut [f32]) {
    let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in vector.iter_mut() {
            *x /= norm;
        }
    }
}

/// Little-endian cursor over a byte slice.
struct ByteReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn seek(&mut self, pos: usize) {
        self.pos = pos;
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], AnnError> {
        if self.pos + n > self.bytes.len() {
            return Err(AnnError::Format("unexpected end of file".to_string()));
        }
        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, AnnError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, AnnError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, AnnError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64, AnnError> {
        let b = self.take(8)?;
        Ok(u64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
    }

    fn i64(&mut self) -> Result<i64, AnnError> {
        Ok(self.u64()? as i64)
    }

    fn f32(&mut self) -> Result<f32, AnnError> {
        let b = self.take(4)?;
        Ok(f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(fp: &str, event: i64) -> ItemMeta {
        ItemMeta {
            fingerprint: fp.to_string(),
            command_ref: event,
            insert_ts_ns: event,
        }
    }

    /// Deterministic pseudo-random unit vector per label.
    fn vector(dim: usize, label: u64) -> Vec<f32> {
        let mut state = label.wrapping_mul(0x9e37_79b9_7f4a_7c15) | 1;
        let mut v: Vec<f32> = (0..dim)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                ((state % 2000) as f32 / 1000.0) - 1.0
            })
            .collect();
        normalize(&mut v);
        v
    }

    #[test]
    fn test_add_then_query_after_build() {
        let mut index = AnnIndex::new(16, 4);
        for i in 0..100u64 {
            index
                .add(vector(16, i), meta(&format!("fp{}", i), i as i64))
                .expect("add");
        }
        assert!(!index.is_built());
        assert!(index.query(&vector(16, 1), 5).is_empty());

        index.build();
        assert!(index.is_built());
        assert_eq!(index.size(), 100);

        let results = index.query(&vector(16, 42), 5);
        assert!(!results.is_empty());
        assert_eq!(results[0].0.fingerprint, "fp42");
        assert!(results[0].1 < 1e-3);
        // distances ascend
        for pair in results.windows(2) {
            assert!(pair[0].1 <= pair[1].1);
        }
    }

    #[test]
    fn test_duplicate_fingerprint_evicts_older() {
        let mut index = AnnIndex::new(8, 2);
        index.add(vector(8, 1), meta("same", 1)).expect("add");
        index.build();
        assert_eq!(index.size(), 1);

        index.add(vector(8, 2), meta("same", 2)).expect("add");
        index.build();
        assert_eq!(index.size(), 1);
        let results = index.query(&vector(8, 2), 1);
        assert_eq!(results[0].0.command_ref, 2);
    }

    #[test]
    fn test_additions_invisible_until_build() {
        let mut index = AnnIndex::new(8, 2);
        index.add(vector(8, 1), meta("a", 1)).expect("add");
        index.build();
        index.add(vector(8, 2), meta("b", 2)).expect("add");

        let fps: Vec<String> = index
            .query(&vector(8, 2), 10)
            .into_iter()
            .map(|(m, _)| m.fingerprint)
            .collect();
        assert!(!fps.contains(&"b".to_string()));

        index.build();
        let fps: Vec<String> = index
            .query(&vector(8, 2), 10)
            .into_iter()
            .map(|(m, _)| m.fingerprint)
            .collect();
        assert!(fps.contains(&"b".to_string()));
    }

    #[test]
    fn test_build_without_adds_is_noop() {
        let mut index = AnnIndex::new(8, 2);
        for i in 0..40u64 {
            index
                .add(vector(8, i), meta(&format!("fp{}", i), i as i64))
                .expect("add");
        }
        index.build();
        let before: Vec<String> = index
            .query(&vector(8, 7), 5)
            .into_iter()
            .map(|(m, _)| m.fingerprint)
            .collect();
        index.build();
        let after: Vec<String> = index
            .query(&vector(8, 7), 5)
            .into_iter()
            .map(|(m, _)| m.fingerprint)
            .collect();
        assert_eq!(before, after);
    }

    #[test]
    fn test_dimension_mismatch_rejected() {
        let mut index = AnnIndex::new(8, 2);
        let result = index.add(vec![0.0; 4], meta("bad", 1));
        assert!(matches!(result, Err(AnnError::DimensionMismatch { got: 4, expected: 8 })));
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let index_path = dir.path().join("ann.index");
        let meta_path = dir.path().join("ann.meta");

        let mut index = AnnIndex::new(16, 4);
        for i in 0..60u64 {
            index
                .add(vector(16, i), meta(&format!("fp{}", i), i as i64))
                .expect("add");
        }
        index.build();
        index.set_generation(77);
        index.save(&index_path, &meta_path).expect("save");

        let loaded = AnnIndex::load(&index_path, 16, 4).expect("load");
        assert_eq!(loaded.generation(), 77);
        assert_eq!(loaded.size(), 60);
        assert!(loaded.is_built());

        let original = index.query(&vector(16, 30), 5);
        let reloaded = loaded.query(&vector(16, 30), 5);
        assert_eq!(
            original.iter().map(|(m, _)| &m.fingerprint).collect::<Vec<_>>(),
            reloaded.iter().map(|(m, _)| &m.fingerprint).collect::<Vec<_>>()
        );

        // sidecar metadata is a readable JSON document
        let doc: AnnMetaDoc =
            serde_json::from_str(&std::fs::read_to_string(&meta_path).expect("read meta"))
                .expect("parse meta");
        assert_eq!(doc.generation, 77);
        assert_eq!(doc.fingerprints.len(), 60);
        // distinct fingerprints after build
        let unique: std::collections::HashSet<&String> = doc.fingerprints.iter().collect();
        assert_eq!(unique.len(), doc.fingerprints.len());
    }

    #[test]
    fn test_load_rejects_wrong_dim() {
        let dir = tempfile::tempdir().expect("tempdir");
        let index_path = dir.path().join("ann.index");
        let meta_path = dir.path().join("ann.meta");

        let mut index = AnnIndex::new(16, 2);
        index.add(vector(16, 1), meta("a", 1)).expect("add");
        index.build();
        index.save(&index_path, &meta_path).expect("save");

        assert!(matches!(
            AnnIndex::load(&index_path, 32, 2),
            Err(AnnError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn test_load_rejects_garbage() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("ann.index");
        std::fs::write(&path, b"not an index at all").expect("write");
        assert!(AnnIndex::load(&path, 16, 2).is_err());
    }

    #[test]
    fn test_recall_on_clustered_data() {
        // two tight clusters; querying near one must return its members
        let mut index = AnnIndex::new(16, 8);
        let a = vector(16, 1000);
        let b = vector(16, 2000);
        for i in 0..50u64 {
            let mut va = a.clone();
            va[(i % 16) as usize] += 0.01;
            normalize(&mut va);
            index.add(va, meta(&format!("a{}", i), i as i64)).expect("add");

            let mut vb = b.clone();
            vb[(i % 16) as usize] += 0.01;
            normalize(&mut vb);
            index
                .add(vb, meta(&format!("b{}", i), 100 + i as i64))
                .expect("add");
        }
        index.build();

        let results = index.query(&a, 10);
        assert_eq!(results.len(), 10);
        for (m, _) in &results {
            assert!(m.fingerprint.starts_with('a'), "got {}", m.fingerprint);
        }
    }
}
