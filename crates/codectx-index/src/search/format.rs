//! Canonical search results and the shared filter predicate.
//!
//! Every retriever turns its raw hits into [`SearchResultWithContext`] with
//! [`format_search_result`] and decides query constraints with
//! [`matches_filters`]. Stores that filter natively index the output of
//! [`normalize_metadata`], so both paths see the same field values.

use std::cmp::Ordering;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::chunk::{keys, Metadata};
use crate::error::{IndexError, Result};

/// `fileType` used when neither metadata nor the path provides one.
pub const UNKNOWN_FILE_TYPE: &str = "unknown";

/// Inclusive line span of a result.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineRange {
    pub start: u64,
    pub end: u64,
}

/// The single result shape handed to search consumers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResultWithContext {
    pub id: String,
    pub score: f32,
    pub content: String,
    pub file_path: String,
    pub file_type: String,
    pub language: Option<String>,
    pub line_range: LineRange,
    pub metadata: Metadata,
}

impl SearchResultWithContext {
    pub fn project_id(&self) -> Option<&str> {
        lookup_str(&self.metadata, keys::PROJECT_ID, "project_id")
    }
}

/// Query constraints. A `None` field places no constraint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchQueryOptions {
    pub file_type: Option<String>,
    pub language: Option<String>,
    /// An empty list is the same as no list.
    pub project_ids: Option<Vec<String>>,
    pub min_score: Option<f32>,
}

impl SearchQueryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file_type(mut self, file_type: impl Into<String>) -> Self {
        self.file_type = Some(file_type.into());
        self
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }

    pub fn with_project_ids<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.project_ids = Some(ids.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_min_score(mut self, min_score: f32) -> Self {
        self.min_score = Some(min_score);
        self
    }

    /// Project ids that actually constrain results.
    pub fn project_scope(&self) -> Option<&[String]> {
        self.project_ids.as_deref().filter(|ids| !ids.is_empty())
    }

    pub fn is_unconstrained(&self) -> bool {
        self.file_type.is_none()
            && self.language.is_none()
            && self.project_scope().is_none()
            && self.min_score.is_none()
    }

    /// Reject malformed options before touching any retriever.
    pub fn validate(&self) -> Result<()> {
        if let Some(min) = self.min_score {
            if !min.is_finite() {
                return Err(IndexError::Validation(format!(
                    "minScore must be a finite number, got {min}"
                )));
            }
        }
        if let Some(ids) = &self.project_ids {
            if ids.iter().any(|id| id.is_empty()) {
                return Err(IndexError::Validation(
                    "projectIds must not contain empty ids".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// Metadata fields after applying the formatter's defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NormalizedFields {
    pub file_path: String,
    pub file_type: String,
    pub language: Option<String>,
    pub line_range: LineRange,
    pub project_id: Option<String>,
}

fn lookup<'a>(metadata: &'a Metadata, key: &str, alias: &str) -> Option<&'a Value> {
    metadata.get(key).or_else(|| metadata.get(alias))
}

fn lookup_str<'a>(metadata: &'a Metadata, key: &str, alias: &str) -> Option<&'a str> {
    lookup(metadata, key, alias)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
}

fn lookup_line(metadata: &Metadata, key: &str, alias: &str) -> u64 {
    match lookup(metadata, key, alias) {
        Some(Value::Number(n)) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64))
            .unwrap_or(0),
        Some(Value::String(s)) => s.trim().parse().unwrap_or(0),
        _ => 0,
    }
}

fn file_type_from_path(path: &str) -> Option<String> {
    Path::new(path)
        .extension()
        .and_then(|ext| ext.to_str())
        .filter(|ext| !ext.is_empty())
        .map(str::to_ascii_lowercase)
}

/// Resolve the well-known fields of a metadata map, filling defaults.
///
/// Never fails: anything missing or of the wrong type takes its default.
pub fn normalize_metadata(metadata: Option<&Metadata>) -> NormalizedFields {
    let Some(metadata) = metadata else {
        return NormalizedFields {
            file_type: UNKNOWN_FILE_TYPE.to_string(),
            ..Default::default()
        };
    };

    let file_path = lookup_str(metadata, keys::FILE_PATH, "file_path")
        .unwrap_or_default()
        .to_string();
    let file_type = lookup_str(metadata, keys::FILE_TYPE, "file_type")
        .map(str::to_string)
        .or_else(|| file_type_from_path(&file_path))
        .unwrap_or_else(|| UNKNOWN_FILE_TYPE.to_string());

    NormalizedFields {
        file_type,
        language: lookup_str(metadata, keys::LANGUAGE, "lang").map(str::to_string),
        line_range: LineRange {
            start: lookup_line(metadata, keys::START_LINE, "start_line"),
            end: lookup_line(metadata, keys::END_LINE, "end_line"),
        },
        project_id: lookup_str(metadata, keys::PROJECT_ID, "project_id").map(str::to_string),
        file_path,
    }
}

/// Turn a raw retriever hit into the canonical result record.
pub fn format_search_result(
    id: &str,
    score: f32,
    content: &str,
    metadata: Option<&Metadata>,
) -> SearchResultWithContext {
    let fields = normalize_metadata(metadata);
    SearchResultWithContext {
        id: id.to_string(),
        score,
        content: content.to_string(),
        file_path: fields.file_path,
        file_type: fields.file_type,
        language: fields.language,
        line_range: fields.line_range,
        metadata: metadata.cloned().unwrap_or_default(),
    }
}

/// Decide whether a normalized record satisfies `options`.
///
/// Shared by the post-filter and by stores that evaluate filters natively.
pub fn matches_fields(
    fields: &NormalizedFields,
    score: f32,
    options: &SearchQueryOptions,
) -> bool {
    if let Some(file_type) = &options.file_type {
        if fields.file_type != *file_type {
            return false;
        }
    }
    if let Some(language) = &options.language {
        if fields.language.as_deref() != Some(language.as_str()) {
            return false;
        }
    }
    if let Some(ids) = options.project_scope() {
        match &fields.project_id {
            Some(project) if ids.contains(project) => {}
            _ => return false,
        }
    }
    if let Some(min) = options.min_score {
        // NaN scores never satisfy a threshold.
        if !(score >= min) {
            return false;
        }
    }
    true
}

/// Descending order by score with NaN ranked last.
pub(crate) fn cmp_score_desc(a: f32, b: f32) -> Ordering {
    let key = |s: f32| if s.is_nan() { f32::NEG_INFINITY } else { s };
    key(b).total_cmp(&key(a))
}

/// The filter predicate every retriever honors.
pub fn matches_filters(result: &SearchResultWithContext, options: &SearchQueryOptions) -> bool {
    let fields = NormalizedFields {
        file_path: result.file_path.clone(),
        file_type: result.file_type.clone(),
        language: result.language.clone(),
        line_range: result.line_range,
        project_id: result.project_id().map(str::to_string),
    };
    matches_fields(&fields, result.score, options)
}
