//! In-memory dense-vector index: exact inner-product search over
//! L2-normalized 768-d vectors, with tombstone + lazy compaction so that
//! `Add`/`Remove` never pay the cost of rebuilding the whole store.

use std::collections::HashMap;

use parking_lot::RwLock;
use rayon::prelude::*;
use serde::Serialize;

use crate::config::VECTOR_DIM;
use crate::error::{AppError, AppResult};

/// Fraction of tombstoned slots that triggers compaction on the next write.
const COMPACT_THRESHOLD: f64 = 0.5;

#[derive(Debug, Clone, Serialize)]
pub struct IndexStats {
    pub count: usize,
    pub dimension: usize,
    pub approx_bytes: usize,
    pub unique_ids: usize,
}

struct Storage {
    /// Row-major, `len() == slots.len() * VECTOR_DIM`. Tombstoned rows keep
    /// their bytes in place; they are simply excluded from search.
    vectors: Vec<f32>,
    /// `None` at a tombstoned slot.
    slots: Vec<Option<String>>,
    id_to_slot: HashMap<String, usize>,
    live_count: usize,
}

impl Storage {
    fn empty() -> Self {
        Self {
            vectors: Vec::new(),
            slots: Vec::new(),
            id_to_slot: HashMap::new(),
            live_count: 0,
        }
    }

    fn tombstones(&self) -> usize {
        self.slots.len() - self.live_count
    }

    fn row(&self, slot: usize) -> &[f32] {
        &self.vectors[slot * VECTOR_DIM..(slot + 1) * VECTOR_DIM]
    }

    fn compact(&mut self) {
        let mut new_vectors = Vec::with_capacity(self.live_count * VECTOR_DIM);
        let mut new_slots = Vec::with_capacity(self.live_count);
        let mut new_id_to_slot = HashMap::with_capacity(self.live_count);

        for (slot, id) in self.slots.iter().enumerate() {
            if let Some(id) = id {
                let new_slot = new_slots.len();
                new_vectors.extend_from_slice(self.row(slot));
                new_slots.push(Some(id.clone()));
                new_id_to_slot.insert(id.clone(), new_slot);
            }
        }

        self.vectors = new_vectors;
        self.slots = new_slots;
        self.id_to_slot = new_id_to_slot;
    }
}

pub struct VectorIndex {
    storage: RwLock<Storage>,
}

fn normalize(vec: &[f32]) -> AppResult<Vec<f32>> {
    if vec.len() != VECTOR_DIM {
        return Err(AppError::ShapeError(format!(
            "expected {} dimensions, got {}",
            VECTOR_DIM,
            vec.len()
        )));
    }
    if vec.iter().any(|c| !c.is_finite()) {
        return Err(AppError::ShapeError("vector contains non-finite component".into()));
    }

    let norm = vec.iter().map(|c| c * c).sum::<f32>().sqrt();
    if norm == 0.0 {
        return Err(AppError::ShapeError("zero vector cannot be normalized".into()));
    }
    Ok(vec.iter().map(|c| c / norm).collect())
}

impl VectorIndex {
    pub fn new() -> Self {
        Self { storage: RwLock::new(Storage::empty()) }
    }

    /// Insert or atomically replace the vector for `page_id`.
    pub fn add(&self, page_id: &str, vec: &[f32]) -> AppResult<()> {
        let normalized = normalize(vec)?;
        let mut storage = self.storage.write();

        if let Some(&slot) = storage.id_to_slot.get(page_id) {
            let start = slot * VECTOR_DIM;
            storage.vectors[start..start + VECTOR_DIM].copy_from_slice(&normalized);
            return Ok(());
        }

        let slot = storage.slots.len();
        storage.vectors.extend_from_slice(&normalized);
        storage.slots.push(Some(page_id.to_string()));
        storage.id_to_slot.insert(page_id.to_string(), slot);
        storage.live_count += 1;
        Ok(())
    }

    /// Tombstone the slot for `page_id`. Returns `false` if absent. Compacts
    /// when the tombstone fraction crosses [`COMPACT_THRESHOLD`].
    pub fn remove(&self, page_id: &str) -> bool {
        let mut storage = self.storage.write();
        let Some(slot) = storage.id_to_slot.remove(page_id) else {
            return false;
        };
        storage.slots[slot] = None;
        storage.live_count -= 1;

        if !storage.slots.is_empty()
            && storage.tombstones() as f64 / storage.slots.len() as f64 >= COMPACT_THRESHOLD
        {
            storage.compact();
        }
        true
    }

    /// Replace the whole index in one critical section. Readers never
    /// observe a mix of the old and new contents.
    pub fn bulk_load(&self, entries: &[(String, Vec<f32>)]) -> AppResult<()> {
        let mut new_storage = Storage::empty();
        new_storage.vectors.reserve(entries.len() * VECTOR_DIM);
        new_storage.slots.reserve(entries.len());
        new_storage.id_to_slot.reserve(entries.len());

        for (page_id, vec) in entries {
            let normalized = normalize(vec)?;
            let slot = new_storage.slots.len();
            new_storage.vectors.extend_from_slice(&normalized);
            new_storage.slots.push(Some(page_id.clone()));
            new_storage.id_to_slot.insert(page_id.clone(), slot);
        }
        new_storage.live_count = new_storage.slots.len();

        *self.storage.write() = new_storage;
        Ok(())
    }

    /// Exact inner-product top-k. Ties broken by ascending slot order.
    pub fn search(&self, query: &[f32], k: usize) -> AppResult<Vec<(String, f32)>> {
        let normalized = normalize(query)?;
        let storage = self.storage.read();

        if storage.live_count == 0 {
            return Ok(Vec::new());
        }

        let live_slots: Vec<usize> = storage
            .slots
            .iter()
            .enumerate()
            .filter_map(|(slot, id)| id.as_ref().map(|_| slot))
            .collect();

        let mut scored: Vec<(usize, f32)> = live_slots
            .par_iter()
            .map(|&slot| {
                let row = storage.row(slot);
                let score: f32 = row.iter().zip(&normalized).map(|(a, b)| a * b).sum();
                (slot, score)
            })
            .collect();

        scored.sort_by(|a, b| match b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal) {
            std::cmp::Ordering::Equal => a.0.cmp(&b.0),
            other => other,
        });

        let k = k.min(scored.len());
        Ok(scored[..k]
            .iter()
            .map(|(slot, score)| (storage.slots[*slot].clone().unwrap(), *score))
            .collect())
    }

    pub fn clear(&self) {
        *self.storage.write() = Storage::empty();
    }

    pub fn stats(&self) -> IndexStats {
        let storage = self.storage.read();
        IndexStats {
            count: storage.live_count,
            dimension: VECTOR_DIM,
            approx_bytes: storage.live_count * VECTOR_DIM * std::mem::size_of::<f32>(),
            unique_ids: storage.id_to_slot.len(),
        }
    }
}

impl Default for VectorIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(mut v: Vec<f32>, hot: usize) -> Vec<f32> {
        v[hot] = 1.0;
        v
    }

    fn zeros() -> Vec<f32> {
        vec![0.0; VECTOR_DIM]
    }

    #[test]
    fn add_then_search_returns_near_one() {
        let idx = VectorIndex::new();
        let v = unit(zeros(), 0);
        idx.add("p1", &v).unwrap();
        let hits = idx.search(&v, 1).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, "p1");
        assert!(hits[0].1 >= 1.0 - 1e-6);
    }

    #[test]
    fn add_replaces_same_page_id() {
        let idx = VectorIndex::new();
        let v1 = unit(zeros(), 0);
        let v2 = unit(zeros(), 1);
        idx.add("p1", &v1).unwrap();
        idx.add("p1", &v2).unwrap();
        assert_eq!(idx.stats().count, 1);

        let hits = idx.search(&v2, 1).unwrap();
        assert!(hits[0].1 >= 1.0 - 1e-6);

        let hits = idx.search(&v1, 1).unwrap();
        assert!(hits[0].1 < 1.0 - 1e-6);
    }

    #[test]
    fn rejects_wrong_dimension() {
        let idx = VectorIndex::new();
        let bad = vec![1.0; VECTOR_DIM - 1];
        assert!(matches!(idx.add("p1", &bad), Err(AppError::ShapeError(_))));
    }

    #[test]
    fn rejects_non_finite() {
        let idx = VectorIndex::new();
        let mut bad = unit(zeros(), 0);
        bad[5] = f32::NAN;
        assert!(matches!(idx.add("p1", &bad), Err(AppError::ShapeError(_))));
    }

    #[test]
    fn remove_absent_returns_false() {
        let idx = VectorIndex::new();
        assert!(!idx.remove("ghost"));
    }

    #[test]
    fn search_on_empty_index_is_empty_not_error() {
        let idx = VectorIndex::new();
        let hits = idx.search(&unit(zeros(), 0), 4).unwrap();
        assert!(hits.is_empty());
    }

    #[test]
    fn bulk_load_matches_count_and_is_searchable() {
        let idx = VectorIndex::new();
        let entries = vec![
            ("p1".to_string(), unit(zeros(), 0)),
            ("p2".to_string(), unit(zeros(), 1)),
            ("p3".to_string(), unit(zeros(), 2)),
        ];
        idx.bulk_load(&entries).unwrap();
        assert_eq!(idx.stats().count, 3);
        for (id, vec) in &entries {
            let hits = idx.search(vec, 1).unwrap();
            assert_eq!(&hits[0].0, id);
        }
    }

    #[test]
    fn search_returns_k_distinct_ids_in_descending_score() {
        let idx = VectorIndex::new();
        for i in 0..VECTOR_DIM.min(5) {
            idx.add(&format!("p{i}"), &unit(zeros(), i)).unwrap();
        }
        let query = unit(zeros(), 0);
        let hits = idx.search(&query, 3).unwrap();
        assert_eq!(hits.len(), 3);
        let ids: std::collections::HashSet<_> = hits.iter().map(|(id, _)| id.clone()).collect();
        assert_eq!(ids.len(), 3);
        for w in hits.windows(2) {
            assert!(w[0].1 >= w[1].1);
        }
    }

    #[test]
    fn remove_then_readd_keeps_invariants() {
        let idx = VectorIndex::new();
        idx.add("p1", &unit(zeros(), 0)).unwrap();
        idx.add("p2", &unit(zeros(), 1)).unwrap();
        assert!(idx.remove("p1"));
        assert_eq!(idx.stats().count, 1);
        idx.add("p1", &unit(zeros(), 0)).unwrap();
        assert_eq!(idx.stats().count, 2);
        assert_eq!(idx.stats().unique_ids, 2);
    }
}
