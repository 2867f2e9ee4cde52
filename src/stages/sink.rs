//! Sink stages.
//!
//! Both sinks key documents by file id. Storing a file id that already
//! exists fails unless the upload set `overwrite`, in which case the old
//! chunks and vectors are replaced in one step.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use ingest_relay_core::error::StageError;
use ingest_relay_core::models::{StoreAck, StoreMetadata, TextChunk};
use ingest_relay_core::stage::{PipelineStageDescriptor, Sink};
use serde::Serialize;
use serde_json::{json, Value};
use sqlx::SqlitePool;
use uuid::Uuid;

pub fn memory(store: Arc<MemoryStore>) -> PipelineStageDescriptor {
    PipelineStageDescriptor::sink("memory", MemorySink { store })
        .with_description("Keeps documents in process memory")
}

pub fn sqlite(pool: SqlitePool) -> PipelineStageDescriptor {
    PipelineStageDescriptor::sink("sqlite", SqliteSink { pool })
        .with_description("Writes documents, chunks and vectors to SQLite")
        .with_schema(json!({
            "type": "object",
            "properties": {
                "store_text": { "type": "boolean", "default": true }
            }
        }))
}

fn check_lengths(chunks: &[TextChunk], vectors: &[Vec<f32>]) -> Result<(), StageError> {
    if chunks.len() != vectors.len() {
        return Err(StageError::Store(format!(
            "{} chunks but {} vectors",
            chunks.len(),
            vectors.len()
        )));
    }
    Ok(())
}

fn already_exists(file_id: &str) -> StageError {
    StageError::Store(format!(
        "document {} already exists; set overwrite to replace it",
        file_id
    ))
}

// ============ Memory ============

#[derive(Debug, Clone, Serialize)]
pub struct StoredDocument {
    pub document_id: String,
    pub file_id: String,
    pub filename: String,
    pub title: Option<String>,
    pub labels: Vec<String>,
    pub vectorizer: String,
    pub chunks: Vec<TextChunk>,
    #[serde(skip)]
    pub vectors: Vec<Vec<f32>>,
    pub stored_at: DateTime<Utc>,
}

/// Summary row for listings.
#[derive(Debug, Clone, Serialize)]
pub struct DocumentSummary {
    pub document_id: String,
    pub file_id: String,
    pub filename: String,
    pub chunk_count: usize,
    pub vectorizer: String,
    pub stored_at: DateTime<Utc>,
}

#[derive(Default)]
pub struct MemoryStore {
    documents: DashMap<String, StoredDocument>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, file_id: &str) -> Option<StoredDocument> {
        self.documents.get(file_id).map(|d| d.clone())
    }

    pub fn contains(&self, file_id: &str) -> bool {
        self.documents.contains_key(file_id)
    }

    /// All documents, oldest first.
    pub fn list(&self) -> Vec<DocumentSummary> {
        let mut out: Vec<DocumentSummary> = self
            .documents
            .iter()
            .map(|d| DocumentSummary {
                document_id: d.document_id.clone(),
                file_id: d.file_id.clone(),
                filename: d.filename.clone(),
                chunk_count: d.chunks.len(),
                vectorizer: d.vectorizer.clone(),
                stored_at: d.stored_at,
            })
            .collect();
        out.sort_by(|a, b| a.stored_at.cmp(&b.stored_at).then(a.file_id.cmp(&b.file_id)));
        out
    }

    pub fn remove(&self, file_id: &str) -> Option<StoredDocument> {
        self.documents.remove(file_id).map(|(_, d)| d)
    }

    pub fn clear(&self) {
        self.documents.clear();
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }
}

pub struct MemorySink {
    store: Arc<MemoryStore>,
}

#[async_trait]
impl Sink for MemorySink {
    async fn store(
        &self,
        chunks: &[TextChunk],
        vectors: &[Vec<f32>],
        metadata: &StoreMetadata,
        _config: &Value,
    ) -> Result<StoreAck, StageError> {
        check_lengths(chunks, vectors)?;
        let document = StoredDocument {
            document_id: Uuid::new_v4().to_string(),
            file_id: metadata.file_id.clone(),
            filename: metadata.filename.clone(),
            title: metadata.title.clone(),
            labels: metadata.labels.clone(),
            vectorizer: metadata.vectorizer.clone(),
            chunks: chunks.to_vec(),
            vectors: vectors.to_vec(),
            stored_at: Utc::now(),
        };
        let document_id = document.document_id.clone();

        match self.store.documents.entry(metadata.file_id.clone()) {
            Entry::Occupied(mut existing) => {
                if !metadata.overwrite {
                    return Err(already_exists(&metadata.file_id));
                }
                existing.insert(document);
            }
            Entry::Vacant(slot) => {
                slot.insert(document);
            }
        }

        Ok(StoreAck {
            stored_chunks: chunks.len(),
            document_id: Some(document_id),
        })
    }
}

// ============ SQLite ============

pub struct SqliteSink {
    pool: SqlitePool,
}

#[async_trait]
impl Sink for SqliteSink {
    async fn store(
        &self,
        chunks: &[TextChunk],
        vectors: &[Vec<f32>],
        metadata: &StoreMetadata,
        config: &Value,
    ) -> Result<StoreAck, StageError> {
        check_lengths(chunks, vectors)?;
        let store_text = config["store_text"].as_bool().unwrap_or(true);
        write_document(&self.pool, chunks, vectors, metadata, store_text)
            .await
            .map_err(|e| match e {
                WriteError::Exists => already_exists(&metadata.file_id),
                WriteError::Sql(e) => StageError::Store(e.to_string()),
            })
    }
}

enum WriteError {
    Exists,
    Sql(sqlx::Error),
}

impl From<sqlx::Error> for WriteError {
    fn from(e: sqlx::Error) -> Self {
        WriteError::Sql(e)
    }
}

async fn write_document(
    pool: &SqlitePool,
    chunks: &[TextChunk],
    vectors: &[Vec<f32>],
    metadata: &StoreMetadata,
    store_text: bool,
) -> Result<StoreAck, WriteError> {
    let mut tx = pool.begin().await?;

    let existing: Option<String> = sqlx::query_scalar("SELECT id FROM documents WHERE file_id = ?")
        .bind(&metadata.file_id)
        .fetch_optional(&mut *tx)
        .await?;

    if let Some(old_id) = existing {
        if !metadata.overwrite {
            return Err(WriteError::Exists);
        }
        sqlx::query("DELETE FROM chunk_vectors WHERE document_id = ?")
            .bind(&old_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM chunks WHERE document_id = ?")
            .bind(&old_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM documents WHERE id = ?")
            .bind(&old_id)
            .execute(&mut *tx)
            .await?;
    }

    let document_id = Uuid::new_v4().to_string();
    let labels_json = serde_json::to_string(&metadata.labels).unwrap_or_else(|_| "[]".into());
    sqlx::query(
        r#"
        INSERT INTO documents (id, file_id, filename, source, title, labels_json, vectorizer, chunk_count, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&document_id)
    .bind(&metadata.file_id)
    .bind(&metadata.filename)
    .bind(&metadata.source)
    .bind(&metadata.title)
    .bind(&labels_json)
    .bind(&metadata.vectorizer)
    .bind(chunks.len() as i64)
    .bind(Utc::now().timestamp())
    .execute(&mut *tx)
    .await?;

    for (chunk, vector) in chunks.iter().zip(vectors) {
        let chunk_id = Uuid::new_v4().to_string();
        let text = if store_text { chunk.text.as_str() } else { "" };
        sqlx::query(
            "INSERT INTO chunks (id, document_id, chunk_index, text, hash) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&chunk_id)
        .bind(&document_id)
        .bind(chunk.index as i64)
        .bind(text)
        .bind(&chunk.hash)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO chunk_vectors (chunk_id, document_id, dims, embedding) VALUES (?, ?, ?, ?)",
        )
        .bind(&chunk_id)
        .bind(&document_id)
        .bind(vector.len() as i64)
        .bind(vec_to_blob(vector))
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    Ok(StoreAck {
        stored_chunks: chunks.len(),
        document_id: Some(document_id),
    })
}

/// Encode a float vector as a little-endian `f32` BLOB.
///
/// ```rust
/// use ingest_relay::stages::sink::{blob_to_vec, vec_to_blob};
///
/// let v = vec![1.0f32, -2.5, 3.125];
/// let blob = vec_to_blob(&v);
/// assert_eq!(blob.len(), 12);
/// assert_eq!(blob_to_vec(&blob), v);
/// ```
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    vec.iter().flat_map(|v| v.to_le_bytes()).collect()
}

pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{db, migrate};

    fn metadata(file_id: &str, overwrite: bool) -> StoreMetadata {
        StoreMetadata {
            file_id: file_id.to_string(),
            filename: "notes.txt".to_string(),
            source: "test".to_string(),
            labels: vec!["Document".to_string()],
            title: Some("notes".to_string()),
            vectorizer: "hashing".to_string(),
            overwrite,
        }
    }

    fn sample() -> (Vec<TextChunk>, Vec<Vec<f32>>) {
        (
            vec![TextChunk::new(0, "alpha"), TextChunk::new(1, "beta")],
            vec![vec![1.0, 0.0], vec![0.0, 1.0]],
        )
    }

    #[tokio::test]
    async fn test_memory_overwrite_rules() {
        let store = Arc::new(MemoryStore::new());
        let sink = MemorySink { store: store.clone() };
        let (chunks, vectors) = sample();

        let ack = sink
            .store(&chunks, &vectors, &metadata("f1", false), &json!({}))
            .await
            .unwrap();
        assert_eq!(ack.stored_chunks, 2);
        assert_eq!(store.get("f1").unwrap().chunks.len(), 2);

        let err = sink
            .store(&chunks[..1], &vectors[..1], &metadata("f1", false), &json!({}))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("already exists"));

        sink.store(&chunks[..1], &vectors[..1], &metadata("f1", true), &json!({}))
            .await
            .unwrap();
        assert_eq!(store.get("f1").unwrap().chunks.len(), 1);
        assert_eq!(store.list().len(), 1);
    }

    #[tokio::test]
    async fn test_length_mismatch() {
        let sink = MemorySink {
            store: Arc::new(MemoryStore::new()),
        };
        let (chunks, vectors) = sample();
        let err = sink
            .store(&chunks, &vectors[..1], &metadata("f1", false), &json!({}))
            .await
            .unwrap_err();
        assert_eq!(err, StageError::Store("2 chunks but 1 vectors".to_string()));
    }

    #[tokio::test]
    async fn test_sqlite_store_and_replace() {
        let tmp = tempfile::TempDir::new().unwrap();
        let pool = db::connect(&tmp.path().join("sink.db")).await.unwrap();
        migrate::run_migrations(&pool).await.unwrap();
        let sink = SqliteSink { pool: pool.clone() };
        let (chunks, vectors) = sample();
        let cfg = json!({ "store_text": true });

        sink.store(&chunks, &vectors, &metadata("f1", false), &cfg)
            .await
            .unwrap();
        assert!(sink
            .store(&chunks, &vectors, &metadata("f1", false), &cfg)
            .await
            .is_err());
        sink.store(&chunks[..1], &vectors[..1], &metadata("f1", true), &cfg)
            .await
            .unwrap();

        let docs: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM documents")
            .fetch_one(&pool)
            .await
            .unwrap();
        let rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunk_vectors")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!((docs, rows), (1, 1));

        let blob: Vec<u8> = sqlx::query_scalar("SELECT embedding FROM chunk_vectors")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(blob_to_vec(&blob), vec![1.0, 0.0]);
    }
}
