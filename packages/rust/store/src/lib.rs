//! In-memory document store with BM25 keyword search.
//!
//! Documents keep their insertion order, which is also the tie-break order for
//! equal scores. The store is populated before any pipeline run and only read
//! during one, so it carries no interior locking.

mod bm25;

pub use bm25::{Bm25Params, tokenize};

use std::collections::{HashMap, HashSet};

use tracing::{debug, instrument};

use webrag_shared::{Document, RagError, Result};

use crate::bm25::{TermStats, score_all};

// ---------------------------------------------------------------------------
// DocumentStore trait
// ---------------------------------------------------------------------------

/// What to do when a written document's id is already stored.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DuplicatePolicy {
    /// Replace the stored document, keeping its original position.
    #[default]
    Overwrite,
    /// Keep the stored document and ignore the new one.
    Skip,
    /// Reject the whole write with [`RagError::Store`].
    Fail,
}

/// A keyed, ordered collection of documents searchable by keyword.
pub trait DocumentStore: Send + Sync {
    fn count_documents(&self) -> usize;

    /// Write `documents`, returning how many were inserted or replaced.
    fn write_documents(&mut self, documents: Vec<Document>, policy: DuplicatePolicy)
    -> Result<usize>;

    /// Up to `top_k` documents ranked by descending relevance, each carrying its score.
    fn search(&self, query: &str, top_k: usize) -> Vec<Document>;

    fn get(&self, id: &str) -> Option<&Document>;

    /// Remove documents by id, returning how many were removed.
    fn delete_documents(&mut self, ids: &[&str]) -> usize;
}

// ---------------------------------------------------------------------------
// InMemoryDocumentStore
// ---------------------------------------------------------------------------

struct Entry {
    doc: Document,
    stats: TermStats,
}

/// [`DocumentStore`] held entirely in memory.
#[derive(Default)]
pub struct InMemoryDocumentStore {
    entries: Vec<Entry>,
    positions: HashMap<String, usize>,
    params: Bm25Params,
}

impl InMemoryDocumentStore {
    pub fn new(params: Bm25Params) -> Self {
        Self {
            params,
            ..Self::default()
        }
    }

    pub fn params(&self) -> Bm25Params {
        self.params
    }

    /// Stored documents in insertion order.
    pub fn documents(&self) -> impl Iterator<Item = &Document> {
        self.entries.iter().map(|e| &e.doc)
    }

    fn reindex(&mut self) {
        self.positions = self
            .entries
            .iter()
            .enumerate()
            .map(|(i, e)| (e.doc.id().to_string(), i))
            .collect();
    }
}

impl DocumentStore for InMemoryDocumentStore {
    fn count_documents(&self) -> usize {
        self.entries.len()
    }

    #[instrument(skip_all, fields(documents = documents.len(), ?policy))]
    fn write_documents(
        &mut self,
        documents: Vec<Document>,
        policy: DuplicatePolicy,
    ) -> Result<usize> {
        if policy == DuplicatePolicy::Fail {
            let mut batch_ids = HashSet::new();
            for doc in &documents {
                if self.positions.contains_key(doc.id()) || !batch_ids.insert(doc.id()) {
                    return Err(RagError::Store(format!(
                        "document with id {} already exists",
                        doc.id()
                    )));
                }
            }
        }

        let mut written = 0;
        for doc in documents {
            let stats = TermStats::of(doc.content());
            match self.positions.get(doc.id()).copied() {
                Some(pos) => {
                    if policy == DuplicatePolicy::Skip {
                        debug!(id = doc.id(), "duplicate document skipped");
                        continue;
                    }
                    self.entries[pos] = Entry { doc, stats };
                }
                None => {
                    self.positions
                        .insert(doc.id().to_string(), self.entries.len());
                    self.entries.push(Entry { doc, stats });
                }
            }
            written += 1;
        }

        debug!(written, total = self.entries.len(), "documents written");
        Ok(written)
    }

    #[instrument(skip(self), fields(stored = self.entries.len()))]
    fn search(&self, query: &str, top_k: usize) -> Vec<Document> {
        if self.entries.is_empty() || top_k == 0 {
            return Vec::new();
        }

        let corpus: Vec<&TermStats> = self.entries.iter().map(|e| &e.stats).collect();
        let scores = score_all(query, &corpus, self.params);

        let mut ranked: Vec<(usize, f64)> = scores.into_iter().enumerate().collect();
        // Stable sort keeps insertion order among equal scores.
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
        ranked.truncate(top_k);

        debug!(
            returned = ranked.len(),
            best = ranked.first().map(|r| r.1),
            "bm25 search completed"
        );

        ranked
            .into_iter()
            .map(|(i, score)| self.entries[i].doc.scored(score))
            .collect()
    }

    fn get(&self, id: &str) -> Option<&Document> {
        self.positions.get(id).map(|&i| &self.entries[i].doc)
    }

    fn delete_documents(&mut self, ids: &[&str]) -> usize {
        let before = self.entries.len();
        self.entries.retain(|e| !ids.contains(&e.doc.id()));
        let removed = before - self.entries.len();
        if removed > 0 {
            self.reindex();
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use webrag_shared::Metadata;

    fn doc(id: &str, content: &str) -> Document {
        Document::with_id(id, content, Metadata::new())
    }

    fn sample_store() -> InMemoryDocumentStore {
        let mut store = InMemoryDocumentStore::default();
        store
            .write_documents(
                vec![
                    doc("rust", "Rust has a borrow checker and zero-cost abstractions."),
                    doc("python", "Python has a garbage collector and dynamic typing."),
                    doc("go", "Go has a garbage collector and green threads."),
                ],
                DuplicatePolicy::Overwrite,
            )
            .unwrap();
        store
    }

    fn ids(docs: &[Document]) -> Vec<&str> {
        docs.iter().map(Document::id).collect()
    }

    #[test]
    fn empty_store_returns_nothing() {
        let store = InMemoryDocumentStore::default();
        assert!(store.search("anything", 5).is_empty());
    }

    #[test]
    fn ranks_by_relevance() {
        let store = sample_store();
        let results = store.search("borrow checker", 2);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].id(), "rust");
        assert!(results[0].score().unwrap() > results[1].score().unwrap());
    }

    #[test]
    fn ties_follow_insertion_order() {
        let store = sample_store();
        let results = store.search("garbage collector", 3);
        assert_eq!(ids(&results), vec!["python", "go", "rust"]);
        assert_eq!(results[2].score(), Some(0.0));

        let unmatched = store.search("haskell", 3);
        assert_eq!(ids(&unmatched), vec!["rust", "python", "go"]);
    }

    #[test]
    fn search_is_deterministic() {
        let store = sample_store();
        let first = store.search("has a collector", 3);
        for _ in 0..10 {
            assert_eq!(store.search("has a collector", 3), first);
        }
    }

    #[test]
    fn top_k_bounds_results() {
        let store = sample_store();
        assert_eq!(store.search("garbage", 1).len(), 1);
        assert!(store.search("garbage", 0).is_empty());
        assert_eq!(store.search("garbage", 10).len(), 3);
    }

    #[test]
    fn overwrite_keeps_original_position() {
        let mut store = sample_store();
        let written = store
            .write_documents(
                vec![doc("rust", "Rust now talks about garbage collector trade-offs.")],
                DuplicatePolicy::Overwrite,
            )
            .unwrap();
        assert_eq!(written, 1);
        assert_eq!(store.count_documents(), 3);
        assert!(store.get("rust").unwrap().content().starts_with("Rust now"));
        let order: Vec<&str> = store.documents().map(Document::id).collect();
        assert_eq!(order, vec!["rust", "python", "go"]);
    }

    #[test]
    fn skip_policy_keeps_existing() {
        let mut store = sample_store();
        let written = store
            .write_documents(
                vec![doc("go", "replacement"), doc("zig", "Zig has comptime.")],
                DuplicatePolicy::Skip,
            )
            .unwrap();
        assert_eq!(written, 1);
        assert_eq!(store.count_documents(), 4);
        assert!(store.get("go").unwrap().content().starts_with("Go has"));
    }

    #[test]
    fn fail_policy_rejects_whole_batch() {
        let mut store = sample_store();
        let err = store
            .write_documents(
                vec![doc("zig", "Zig has comptime."), doc("go", "replacement")],
                DuplicatePolicy::Fail,
            )
            .unwrap_err();
        assert!(matches!(err, RagError::Store(_)));
        assert_eq!(store.count_documents(), 3);
        assert!(store.get("zig").is_none());
    }

    #[test]
    fn delete_reindexes_remaining() {
        let mut store = sample_store();
        assert_eq!(store.delete_documents(&["python", "missing"]), 1);
        assert_eq!(store.count_documents(), 2);
        assert!(store.get("python").is_none());
        assert_eq!(store.get("go").unwrap().id(), "go");
    }

    #[test]
    fn derived_ids_deduplicate_identical_documents() {
        let mut store = InMemoryDocumentStore::new(Bm25Params { k1: 1.2, b: 0.5 });
        let meta: Metadata = [("source".to_string(), serde_json::json!("a"))].into();
        let written = store
            .write_documents(
                vec![
                    Document::new("same", meta.clone()),
                    Document::new("same", meta),
                ],
                DuplicatePolicy::Overwrite,
            )
            .unwrap();
        assert_eq!(written, 2);
        assert_eq!(store.count_documents(), 1);
    }
}
