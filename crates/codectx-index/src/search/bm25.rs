//! BM25 keyword index over stored chunk text.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;

use crate::chunk::{keys, Chunk, Metadata};
use crate::error::Result;

/// Term frequency saturation
const K1: f64 = 1.2;
/// Length normalization
const B: f64 = 0.75;

/// A document in the BM25 index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub text: String,
    #[serde(default)]
    pub metadata: Metadata,
    /// Token count.
    pub length: usize,
    term_freqs: HashMap<String, u32>,
}

impl Document {
    fn new(id: String, text: String, metadata: Metadata) -> Self {
        let tokens = BM25Index::tokenize(&text);
        let mut term_freqs = HashMap::new();
        for token in &tokens {
            *term_freqs.entry(token.clone()).or_insert(0) += 1;
        }
        Self {
            id,
            text,
            metadata,
            length: tokens.len(),
            term_freqs,
        }
    }

    fn project_id(&self) -> Option<&str> {
        self.metadata.get(keys::PROJECT_ID).and_then(|v| v.as_str())
    }
}

/// BM25 search index keyed by chunk id.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BM25Index {
    documents: HashMap<String, Document>,
    /// Number of documents containing each term.
    doc_freq: HashMap<String, usize>,
    total_length: usize,
}

impl BM25Index {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lowercased identifier-like terms of at least two characters.
    pub(crate) fn tokenize(text: &str) -> Vec<String> {
        text.to_lowercase()
            .split(|c: char| !c.is_alphanumeric() && c != '_')
            .filter(|s| s.len() > 1)
            .map(String::from)
            .collect()
    }

    /// Add a document, replacing any existing document with the same id.
    pub fn add_document(&mut self, id: String, text: String, metadata: Metadata) {
        self.remove_document(&id);

        let doc = Document::new(id, text, metadata);
        self.total_length += doc.length;
        for term in doc.term_freqs.keys() {
            *self.doc_freq.entry(term.clone()).or_insert(0) += 1;
        }
        self.documents.insert(doc.id.clone(), doc);
    }

    pub fn add_chunk(&mut self, chunk: &Chunk) {
        self.add_document(
            chunk.id.clone(),
            chunk.content.clone(),
            chunk.metadata.clone(),
        );
    }

    /// Returns whether the document was present.
    pub fn remove_document(&mut self, id: &str) -> bool {
        let Some(doc) = self.documents.remove(id) else {
            return false;
        };
        self.total_length -= doc.length;
        for term in doc.term_freqs.keys() {
            if let Some(count) = self.doc_freq.get_mut(term) {
                *count -= 1;
                if *count == 0 {
                    self.doc_freq.remove(term);
                }
            }
        }
        true
    }

    /// Drop every document of `project_id` whose id is not in `keep`.
    ///
    /// Returns the number of documents removed.
    pub fn retain_project(&mut self, project_id: &str, keep: &HashSet<String>) -> usize {
        let stale: Vec<String> = self
            .documents
            .values()
            .filter(|doc| doc.project_id() == Some(project_id) && !keep.contains(&doc.id))
            .map(|doc| doc.id.clone())
            .collect();
        for id in &stale {
            self.remove_document(id);
        }
        stale.len()
    }

    pub fn get(&self, id: &str) -> Option<&Document> {
        self.documents.get(id)
    }

    fn avg_doc_length(&self) -> f64 {
        if self.documents.is_empty() {
            return 0.0;
        }
        self.total_length as f64 / self.documents.len() as f64
    }

    fn idf(&self, term: &str) -> f64 {
        let Some(&df) = self.doc_freq.get(term) else {
            return 0.0;
        };
        let n = self.documents.len() as f64;
        let df = df as f64;
        ((n - df + 0.5) / (df + 0.5) + 1.0).ln()
    }

    fn score(&self, doc: &Document, terms: &[(String, f64)], avg_len: f64) -> f64 {
        let norm = K1 * (1.0 - B + B * (doc.length as f64 / avg_len));
        terms
            .iter()
            .filter_map(|(term, idf)| {
                let tf = f64::from(*doc.term_freqs.get(term)?);
                Some(idf * tf * (K1 + 1.0) / (tf + norm))
            })
            .sum()
    }

    /// Search the index and return `(id, score)` pairs, best first.
    ///
    /// Equal scores are ordered by id so results are deterministic.
    pub fn search(&self, query: &str, limit: usize) -> Vec<(String, f64)> {
        let mut terms: Vec<String> = Self::tokenize(query);
        terms.sort();
        terms.dedup();
        if terms.is_empty() || self.documents.is_empty() {
            return Vec::new();
        }

        let terms: Vec<(String, f64)> = terms
            .into_iter()
            .map(|term| {
                let idf = self.idf(&term);
                (term, idf)
            })
            .filter(|(_, idf)| *idf > 0.0)
            .collect();
        let avg_len = self.avg_doc_length();

        let mut scores: Vec<(String, f64)> = self
            .documents
            .values()
            .map(|doc| (doc.id.clone(), self.score(doc, &terms, avg_len)))
            .filter(|(_, score)| *score > 0.0)
            .collect();

        scores.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        scores.truncate(limit);
        scores
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    pub fn clear(&mut self) {
        self.documents.clear();
        self.doc_freq.clear();
        self.total_length = 0;
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string(self)?;
        fs::write(path, json)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let json = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&json)?)
    }

    /// Load from `path`, or start empty if the file does not exist.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::new())
        }
    }
}
