//! Qdrant-backed vector store.
//!
//! Filters are pushed down as Qdrant payload conditions over fields that are
//! normalized at insert time with the result formatter's defaults.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use qdrant_client::qdrant::{
    point_id::PointIdOptions, value::Kind, vectors_config::Config as VectorsConfigKind,
    CollectionInfo, Condition, CountPointsBuilder, CreateCollectionBuilder, DeletePointsBuilder,
    Distance, Filter, PointId, PointStruct, PointsIdsList, SearchPointsBuilder,
    UpsertPointsBuilder, Value as QdrantValue, VectorParamsBuilder,
};
use qdrant_client::Qdrant;
use tracing::{debug, info};
use uuid::Uuid;

use super::{check_dimensions, StoredHit, VectorStore};
use crate::chunk::{EmbeddedChunk, Metadata};
use crate::error::{IndexError, Result};
use crate::search::{normalize_metadata, SearchQueryOptions};

const CHUNK_ID: &str = "chunk_id";
const CONTENT: &str = "content";
const FILE_PATH: &str = "file_path";
const FILE_TYPE: &str = "file_type";
const LANGUAGE: &str = "language";
const START_LINE: &str = "start_line";
const END_LINE: &str = "end_line";
const PROJECT_ID: &str = "project_id";
const METADATA_JSON: &str = "metadata_json";

/// Connection settings for Qdrant.
#[derive(Debug, Clone)]
pub struct QdrantConfig {
    pub url: String,
    pub api_key: Option<String>,
    pub collection_name: String,
    pub dimensions: usize,
}

impl Default for QdrantConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:6334".to_string(),
            api_key: None,
            collection_name: crate::DEFAULT_COLLECTION.to_string(),
            dimensions: crate::DEFAULT_DIMENSIONS,
        }
    }
}

pub struct QdrantStore {
    client: Qdrant,
    collection_name: String,
    dimensions: usize,
}

fn storage_err(context: &str, err: impl std::fmt::Display) -> IndexError {
    IndexError::Storage(format!("{context}: {err}"))
}

/// Qdrant point id for a chunk id. Stable across runs.
fn point_id(chunk_id: &str) -> String {
    Uuid::new_v5(&Uuid::NAMESPACE_OID, chunk_id.as_bytes()).to_string()
}

impl QdrantStore {
    /// Connect and make sure the collection exists.
    pub async fn connect(config: &QdrantConfig) -> Result<Self> {
        let mut builder = Qdrant::from_url(&config.url).skip_compatibility_check();
        if let Some(api_key) = &config.api_key {
            builder = builder.api_key(api_key.clone());
        }
        let client = builder
            .build()
            .map_err(|e| storage_err("Failed to connect to Qdrant", e))?;

        info!(url = %config.url, collection = %config.collection_name, "Connected to Qdrant");

        let store = Self {
            client,
            collection_name: config.collection_name.clone(),
            dimensions: config.dimensions,
        };
        store.ensure_collection().await?;
        Ok(store)
    }

    async fn ensure_collection(&self) -> Result<()> {
        let exists = self
            .client
            .collection_exists(&self.collection_name)
            .await
            .map_err(|e| storage_err("Failed to list collections", e))?;

        if exists {
            let info = self
                .client
                .collection_info(&self.collection_name)
                .await
                .map_err(|e| storage_err("Failed to get collection info", e))?;
            if let Some(info) = info.result {
                check_collection_dimensions(&info, self.dimensions)?;
            }
            debug!(collection = %self.collection_name, "Collection already exists");
            return Ok(());
        }

        info!(
            collection = %self.collection_name,
            dimensions = self.dimensions,
            "Creating collection"
        );
        self.client
            .create_collection(
                CreateCollectionBuilder::new(&self.collection_name).vectors_config(
                    VectorParamsBuilder::new(self.dimensions as u64, Distance::Cosine),
                ),
            )
            .await
            .map_err(|e| storage_err("Failed to create collection", e))?;
        Ok(())
    }

    pub fn collection_name(&self) -> &str {
        &self.collection_name
    }
}

/// Vector size of a collection with a single unnamed vector.
fn collection_vector_size(info: &CollectionInfo) -> Option<u64> {
    let params = info.config.as_ref()?.params.as_ref()?;
    match params.vectors_config.as_ref()?.config.as_ref()? {
        VectorsConfigKind::Params(vector) => Some(vector.size),
        VectorsConfigKind::ParamsMap(_) => None,
    }
}

/// An existing collection must hold vectors of the configured size.
fn check_collection_dimensions(info: &CollectionInfo, expected: usize) -> Result<()> {
    match collection_vector_size(info) {
        Some(size) if size as usize != expected => Err(IndexError::DimensionMismatch {
            expected,
            actual: size as usize,
        }),
        _ => Ok(()),
    }
}

/// Payload written for each chunk.
fn chunk_payload(chunk: &EmbeddedChunk) -> HashMap<String, QdrantValue> {
    let fields = normalize_metadata(Some(&chunk.chunk.metadata));
    let mut map = HashMap::new();

    map.insert(CHUNK_ID.to_string(), QdrantValue::from(chunk.id().to_string()));
    map.insert(CONTENT.to_string(), QdrantValue::from(chunk.chunk.content.clone()));
    map.insert(FILE_PATH.to_string(), QdrantValue::from(fields.file_path));
    map.insert(FILE_TYPE.to_string(), QdrantValue::from(fields.file_type));
    map.insert(
        START_LINE.to_string(),
        QdrantValue::from(fields.line_range.start as i64),
    );
    map.insert(
        END_LINE.to_string(),
        QdrantValue::from(fields.line_range.end as i64),
    );
    if let Some(language) = fields.language {
        map.insert(LANGUAGE.to_string(), QdrantValue::from(language));
    }
    if let Some(project_id) = fields.project_id {
        map.insert(PROJECT_ID.to_string(), QdrantValue::from(project_id));
    }
    let metadata_json =
        serde_json::to_string(&chunk.chunk.metadata).unwrap_or_else(|_| "{}".to_string());
    map.insert(METADATA_JSON.to_string(), QdrantValue::from(metadata_json));

    map
}

/// Qdrant conditions equivalent to the post-filter predicate.
fn build_filter(options: &SearchQueryOptions) -> Option<Filter> {
    let mut conditions: Vec<Condition> = Vec::new();

    if let Some(file_type) = &options.file_type {
        conditions.push(Condition::matches(FILE_TYPE, file_type.clone()));
    }
    if let Some(language) = &options.language {
        conditions.push(Condition::matches(LANGUAGE, language.clone()));
    }
    if let Some(ids) = options.project_scope() {
        conditions.push(Condition::matches(PROJECT_ID, ids.to_vec()));
    }

    if conditions.is_empty() {
        None
    } else {
        Some(Filter::must(conditions))
    }
}

fn extract_string(value: Option<&QdrantValue>) -> String {
    value
        .and_then(|v| match &v.kind {
            Some(Kind::StringValue(s)) => Some(s.clone()),
            _ => None,
        })
        .unwrap_or_default()
}

fn hit_from_payload(
    id: Option<PointId>,
    score: f32,
    payload: &HashMap<String, QdrantValue>,
) -> StoredHit {
    let mut chunk_id = extract_string(payload.get(CHUNK_ID));
    if chunk_id.is_empty() {
        chunk_id = id
            .and_then(|id| id.point_id_options)
            .map(|opt| match opt {
                PointIdOptions::Uuid(u) => u,
                PointIdOptions::Num(n) => n.to_string(),
            })
            .unwrap_or_default();
    }
    let metadata: Metadata =
        serde_json::from_str(&extract_string(payload.get(METADATA_JSON))).unwrap_or_default();

    StoredHit {
        id: chunk_id,
        score,
        content: extract_string(payload.get(CONTENT)),
        metadata,
    }
}

#[async_trait]
impl VectorStore for QdrantStore {
    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn supports_native_filtering(&self) -> bool {
        true
    }

    async fn upsert(&self, chunks: &[EmbeddedChunk]) -> Result<()> {
        check_dimensions(self.dimensions, chunks)?;
        if chunks.is_empty() {
            return Ok(());
        }

        let points: Vec<PointStruct> = chunks
            .iter()
            .map(|chunk| PointStruct::new(point_id(chunk.id()), chunk.vector.clone(), chunk_payload(chunk)))
            .collect();

        debug!(count = points.len(), "Upserting points");
        self.client
            .upsert_points(UpsertPointsBuilder::new(&self.collection_name, points).wait(true))
            .await
            .map_err(|e| storage_err("Failed to upsert points", e))?;
        Ok(())
    }

    async fn query(
        &self,
        vector: &[f32],
        limit: usize,
        filter: Option<&SearchQueryOptions>,
    ) -> Result<Vec<StoredHit>> {
        if vector.len() != self.dimensions {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimensions,
                actual: vector.len(),
            });
        }

        let mut search =
            SearchPointsBuilder::new(&self.collection_name, vector.to_vec(), limit as u64)
                .with_payload(true);
        if let Some(options) = filter {
            if let Some(conditions) = build_filter(options) {
                search = search.filter(conditions);
            }
            if let Some(min) = options.min_score {
                search = search.score_threshold(min);
            }
        }

        let response = self
            .client
            .search_points(search)
            .await
            .map_err(|e| storage_err("Failed to search points", e))?;

        let hits: Vec<StoredHit> = response
            .result
            .into_iter()
            .map(|p| hit_from_payload(p.id, p.score, &p.payload))
            .collect();
        debug!(count = hits.len(), "Qdrant search hits");
        Ok(hits)
    }

    async fn remove(&self, ids: &[String]) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let points: Vec<PointId> = ids.iter().map(|id| PointId::from(point_id(id))).collect();
        self.client
            .delete_points(
                DeletePointsBuilder::new(&self.collection_name)
                    .points(PointsIdsList { ids: points })
                    .wait(true),
            )
            .await
            .map_err(|e| storage_err("Failed to delete points", e))?;
        Ok(ids.len())
    }

    async fn retain_project(&self, project_id: &str, keep: &HashSet<String>) -> Result<usize> {
        let keep_ids: Vec<PointId> = keep.iter().map(|id| PointId::from(point_id(id))).collect();
        let mut filter = Filter::must([Condition::matches(PROJECT_ID, project_id.to_string())]);
        if !keep_ids.is_empty() {
            filter.must_not = vec![Condition::has_id(keep_ids)];
        }

        let stale = self
            .client
            .count(
                CountPointsBuilder::new(&self.collection_name)
                    .filter(filter.clone())
                    .exact(true),
            )
            .await
            .map_err(|e| storage_err("Failed to count stale points", e))?
            .result
            .map(|r| r.count as usize)
            .unwrap_or(0);

        if stale > 0 {
            self.client
                .delete_points(
                    DeletePointsBuilder::new(&self.collection_name)
                        .points(filter)
                        .wait(true),
                )
                .await
                .map_err(|e| storage_err("Failed to delete stale points", e))?;
        }
        Ok(stale)
    }

    async fn clear(&self) -> Result<()> {
        info!(collection = %self.collection_name, "Clearing collection");
        self.client
            .delete_collection(&self.collection_name)
            .await
            .map_err(|e| storage_err("Failed to delete collection", e))?;
        self.ensure_collection().await
    }

    async fn len(&self) -> Result<usize> {
        let info = self
            .client
            .collection_info(&self.collection_name)
            .await
            .map_err(|e| storage_err("Failed to get collection info", e))?;
        Ok(info
            .result
            .and_then(|r| r.points_count)
            .unwrap_or(0) as usize)
    }
}
