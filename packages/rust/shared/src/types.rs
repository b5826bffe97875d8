//! Core domain types passed between pipeline stages.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::RagError;

/// Free-form document metadata. Ordered so hashing and rendering are stable.
pub type Metadata = BTreeMap<String, serde_json::Value>;

// ---------------------------------------------------------------------------
// Document
// ---------------------------------------------------------------------------

/// A unit of text flowing through retrieval and prompting.
///
/// Documents are immutable once built. The id is either supplied explicitly
/// or derived from a SHA-256 over the content and metadata, so two documents
/// with the same content and metadata share an identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    id: String,
    content: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    meta: Metadata,
    /// Relevance score assigned by a retriever, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    score: Option<f64>,
}

impl Document {
    /// Create a document whose id is derived from its content and metadata.
    pub fn new(content: impl Into<String>, meta: Metadata) -> Self {
        let content = content.into();
        let id = derive_id(&content, &meta);
        Self {
            id,
            content,
            meta,
            score: None,
        }
    }

    /// Create a document with no metadata.
    pub fn from_text(content: impl Into<String>) -> Self {
        Self::new(content, Metadata::new())
    }

    /// Create a document with an explicit id.
    pub fn with_id(id: impl Into<String>, content: impl Into<String>, meta: Metadata) -> Self {
        Self {
            id: id.into(),
            content: content.into(),
            meta,
            score: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn meta(&self) -> &Metadata {
        &self.meta
    }

    pub fn score(&self) -> Option<f64> {
        self.score
    }

    /// Whether the document carries no text (e.g. a skipped conversion).
    pub fn is_empty(&self) -> bool {
        self.content.trim().is_empty()
    }

    /// Return a copy of this document carrying a retrieval score.
    pub fn scored(&self, score: f64) -> Self {
        Self {
            score: Some(score),
            ..self.clone()
        }
    }
}

fn derive_id(content: &str, meta: &Metadata) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    // BTreeMap serialization is key-ordered and cannot fail for JSON values.
    if let Ok(meta_json) = serde_json::to_vec(meta) {
        hasher.update(&meta_json);
    }
    format!("{:x}", hasher.finalize())
}

/// Compute the SHA-256 hex digest of raw bytes.
pub fn content_hash(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

// ---------------------------------------------------------------------------
// ByteStream
// ---------------------------------------------------------------------------

/// Raw body of a fetched URL, before conversion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ByteStream {
    /// Final URL the content was fetched from.
    pub url: String,
    /// HTTP status code of the response.
    pub status: u16,
    /// `Content-Type` header, without parameters, lowercased.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    /// `charset` parameter of the `Content-Type` header, if one was sent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub charset: Option<String>,
    /// Response body.
    pub data: Vec<u8>,
    /// When the response was received.
    pub fetched_at: DateTime<Utc>,
    /// SHA-256 of `data`.
    pub content_hash: String,
}

impl ByteStream {
    /// Whether the declared or sniffed content looks like HTML.
    pub fn is_html(&self) -> bool {
        match self.content_type.as_deref() {
            Some(ct) => ct == "text/html" || ct == "application/xhtml+xml",
            None => looks_like_html(&self.data),
        }
    }
}

fn looks_like_html(data: &[u8]) -> bool {
    let head = String::from_utf8_lossy(&data[..data.len().min(512)]);
    let head = head.trim_start().to_lowercase();
    head.starts_with("<!doctype html") || head.contains("<html") || head.contains("<body")
}

// ---------------------------------------------------------------------------
// FetchFailure
// ---------------------------------------------------------------------------

/// A URL that could not be fetched; reported instead of aborting the batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchFailure {
    pub url: String,
    pub message: String,
}

impl From<FetchFailure> for RagError {
    fn from(failure: FetchFailure) -> Self {
        RagError::fetch(failure.url, failure.message)
    }
}

// ---------------------------------------------------------------------------
// GenerationResult
// ---------------------------------------------------------------------------

/// Token accounting reported by the endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

/// Per-reply metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplyMeta {
    pub model: String,
    pub index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
    pub usage: Usage,
}

/// Output of one generator call. The first reply is the canonical answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationResult {
    pub replies: Vec<String>,
    pub meta: Vec<ReplyMeta>,
}

impl GenerationResult {
    /// The canonical answer, if the endpoint produced any reply.
    pub fn answer(&self) -> Option<&str> {
        self.replies.first().map(String::as_str)
    }
}
