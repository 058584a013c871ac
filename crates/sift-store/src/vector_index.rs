//! In-memory HNSW index over the stored chunk vectors.
//!
//! redb stays the source of truth. [`RedbStore`](crate::RedbStore) builds the
//! index from the `embeddings` table on first use and keeps it in step from
//! its write paths: a replaced or deleted entity's graph nodes are tombstoned
//! in the same step that removes its rows. HNSW graphs cannot drop nodes, so
//! once tombstones outnumber live nodes the index asks to be rebuilt.
//!
//! One graph exists per `(model, dimension)` pair, since vectors from
//! different models are not comparable.

use std::collections::{HashMap, HashSet};

use hnsw::{Hnsw, Searcher};
use rand::rngs::StdRng;
use sift_core::{EntityKey, EntityType};
use space::{Metric, Neighbor};

/// Floor for the HNSW `ef` search parameter; scaled up to `2 * k`.
const MIN_EF_SEARCH: usize = 50;

/// Chunks fetched from a graph per requested entity, before grouping.
const OVERSAMPLE: usize = 4;

/// Tombstones tolerated before a rebuild is requested.
const MIN_TOMBSTONES_FOR_REBUILD: usize = 64;

/// Cosine distance in `[0, 2]` scaled onto `u32`.
const DISTANCE_SCALE: f64 = u32::MAX as f64 / 2.0;

type GraphKey = (String, usize);

/// Cosine similarity of two vectors; `0.0` when either has zero norm or the
/// lengths differ.
pub(crate) fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut na = 0.0f32;
    let mut nb = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        na += x * x;
        nb += y * y;
    }
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    dot / (na.sqrt() * nb.sqrt())
}

struct CosineDistance;

impl Metric<Box<[f32]>> for CosineDistance {
    type Unit = u32;

    #[allow(clippy::borrowed_box)]
    fn distance(&self, a: &Box<[f32]>, b: &Box<[f32]>) -> u32 {
        let distance = 1.0 - f64::from(cosine_similarity(a, b));
        (distance.clamp(0.0, 2.0) * DISTANCE_SCALE) as u32
    }
}

fn similarity_of(distance: u32) -> f32 {
    let similarity = 1.0 - f64::from(distance) / DISTANCE_SCALE;
    similarity.clamp(-1.0, 1.0) as f32
}

/// A chunk found by [`VectorIndex::nearest`]: the best chunk of one entity.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct IndexHit {
    pub key: EntityKey,
    pub chunk_index: u32,
    pub similarity: f32,
}

/// Owner of one graph node.
#[derive(Debug, Clone)]
struct Slot {
    key: EntityKey,
    chunk_index: u32,
}

/// HNSW graph for one `(model, dimension)` pair.
struct Graph {
    hnsw: Hnsw<CosineDistance, Box<[f32]>, StdRng, 16, 32>,
    searcher: Searcher<u32>,
    slots: Vec<Slot>,
    tombstones: HashSet<usize>,
}

impl Graph {
    fn new() -> Self {
        Self {
            hnsw: Hnsw::new(CosineDistance),
            searcher: Searcher::default(),
            slots: Vec::new(),
            tombstones: HashSet::new(),
        }
    }

    fn insert(&mut self, slot: Slot, vector: Vec<f32>) -> usize {
        let id = self.slots.len();
        self.slots.push(slot);
        self.hnsw.insert(vector.into_boxed_slice(), &mut self.searcher);
        id
    }

    fn live(&self) -> usize {
        self.slots.len() - self.tombstones.len()
    }

    /// Up to `k` live nodes nearest to `query`, as `(node, similarity)`.
    fn search(&mut self, query: &[f32], k: usize) -> Vec<(usize, f32)> {
        if k == 0 || self.slots.is_empty() {
            return Vec::new();
        }
        let k = k.min(self.slots.len());
        let mut neighbors = vec![
            Neighbor {
                index: !0,
                distance: !0
            };
            k
        ];
        let ef = (k * 2).max(MIN_EF_SEARCH);
        let query: Box<[f32]> = query.into();
        let found = self
            .hnsw
            .nearest(&query, ef, &mut self.searcher, &mut neighbors);
        found
            .iter()
            .filter(|n| n.index != !0 && !self.tombstones.contains(&n.index))
            .map(|n| (n.index, similarity_of(n.distance)))
            .collect()
    }

    /// Best chunk per entity, most similar first, widening the graph search
    /// until `limit` entities pass the filters or the graph is exhausted.
    fn nearest(
        &mut self,
        query: &[f32],
        limit: usize,
        min_similarity: f32,
        entity_type: Option<EntityType>,
    ) -> Vec<IndexHit> {
        let mut k = limit.saturating_mul(OVERSAMPLE).max(limit);
        loop {
            let mut best: HashMap<&EntityKey, IndexHit> = HashMap::new();
            let found = self.search(query, k);
            for (node, similarity) in found {
                let slot = &self.slots[node];
                if similarity < min_similarity
                    || entity_type.is_some_and(|t| t != slot.key.entity_type)
                {
                    continue;
                }
                let better = best
                    .get(&slot.key)
                    .is_none_or(|hit| similarity > hit.similarity);
                if better {
                    best.insert(
                        &slot.key,
                        IndexHit {
                            key: slot.key.clone(),
                            chunk_index: slot.chunk_index,
                            similarity,
                        },
                    );
                }
            }
            if best.len() >= limit || k >= self.slots.len() {
                let mut hits: Vec<IndexHit> = best.into_values().collect();
                hits.sort_by(|a, b| {
                    b.similarity
                        .total_cmp(&a.similarity)
                        .then_with(|| a.key.cmp(&b.key))
                });
                hits.truncate(limit);
                return hits;
            }
            k = k.saturating_mul(2);
        }
    }
}

/// Where an entity's chunks live in the index.
struct Placement {
    graph: GraphKey,
    nodes: Vec<usize>,
}

/// Approximate nearest-neighbour index over every stored chunk.
#[derive(Default)]
pub(crate) struct VectorIndex {
    graphs: HashMap<GraphKey, Graph>,
    entities: HashMap<EntityKey, Placement>,
}

impl VectorIndex {
    /// Put an entity's vectors into the index, retiring any it had before.
    pub fn insert_entity(&mut self, key: &EntityKey, model: &str, vectors: Vec<(u32, Vec<f32>)>) {
        self.remove_entity(key);
        let Some(dimension) = vectors.first().map(|(_, v)| v.len()) else {
            return;
        };
        let graph_key = (model.to_string(), dimension);
        let graph = self
            .graphs
            .entry(graph_key.clone())
            .or_insert_with(Graph::new);
        let nodes = vectors
            .into_iter()
            .map(|(chunk_index, vector)| {
                let slot = Slot {
                    key: key.clone(),
                    chunk_index,
                };
                graph.insert(slot, vector)
            })
            .collect();
        self.entities.insert(
            key.clone(),
            Placement {
                graph: graph_key,
                nodes,
            },
        );
    }

    /// Tombstone an entity's vectors. Returns how many were retired.
    pub fn remove_entity(&mut self, key: &EntityKey) -> usize {
        let Some(placement) = self.entities.remove(key) else {
            return 0;
        };
        let Some(graph) = self.graphs.get_mut(&placement.graph) else {
            return 0;
        };
        let count = placement.nodes.len();
        graph.tombstones.extend(placement.nodes);
        count
    }

    /// Best chunk per entity among vectors produced by `model`.
    pub fn nearest(
        &mut self,
        query: &[f32],
        model: &str,
        limit: usize,
        min_similarity: f32,
        entity_type: Option<EntityType>,
    ) -> Vec<IndexHit> {
        if limit == 0 || query.is_empty() {
            return Vec::new();
        }
        match self.graphs.get_mut(&(model.to_string(), query.len())) {
            Some(graph) => graph.nearest(query, limit, min_similarity, entity_type),
            None => Vec::new(),
        }
    }

    /// Live vectors across every graph.
    pub fn len(&self) -> usize {
        self.graphs.values().map(Graph::live).sum()
    }

    /// Whether some graph carries more dead nodes than live ones.
    pub fn needs_rebuild(&self) -> bool {
        self.graphs.values().any(|g| {
            g.tombstones.len() >= MIN_TOMBSTONES_FOR_REBUILD && g.tombstones.len() > g.live()
        })
    }
}

// ============================================================================
// Tests
// ============================================================================
