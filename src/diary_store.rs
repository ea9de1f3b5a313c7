//! Diary persistence: a thin, stateless wrapper over a SQLite-backed blob
//! table with optimistic concurrency via a generation column.
//!
//! Mirrors the functional-core/imperative-shell split used for the
//! connection bootstrap: pure helpers validate and shape SQL, async methods
//! perform the actual I/O.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};

use crate::diary::{ChatChannel, PatientDiary};
use crate::domain_types::{CorrelationId, Generation, PatientId};
use crate::error::DiaryStoreError;

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

/// Per-operation I/O timeout for the diary store.
pub const STORE_IO_TIMEOUT: Duration = Duration::from_secs(30);

fn object_key(patient_id: &PatientId) -> String {
    format!("patient_diaries/patient_{}/diary.json", patient_id.as_ref())
}

#[derive(Serialize)]
struct MirrorEntry<'a> {
    sender: &'a str,
    message: &'a str,
    channel: &'a str,
    timestamp: chrono::DateTime<chrono::Utc>,
}

#[derive(Serialize)]
struct MirrorFile<'a> {
    conversation: Vec<MirrorEntry<'a>>,
}

/// Best-effort side-channel write of the two chat-history mirror files
/// (`pre_consultation_chat.json`, `monitoring_chat.json`). Failures here are
/// logged, never fatal: these are not part of the generation-checked diary.
pub async fn write_chat_mirrors(base_dir: &Path, patient_id: &PatientId, diary: &PatientDiary) -> std::io::Result<()> {
    let dir = base_dir.join(patient_id.as_ref());
    tokio::fs::create_dir_all(&dir).await?;

    for (chat_channel, filename) in [
        (ChatChannel::PreConsultation, "pre_consultation_chat.json"),
        (ChatChannel::Monitoring, "monitoring_chat.json"),
    ] {
        let conversation: Vec<MirrorEntry<'_>> = diary
            .conversation_log
            .iter()
            .filter(|entry| entry.chat_channel == chat_channel)
            .map(|entry| MirrorEntry {
                sender: match entry.direction {
                    crate::diary::Direction::Inbound => "patient",
                    crate::diary::Direction::Outbound => "agent",
                },
                message: &entry.message,
                channel: &entry.channel,
                timestamp: entry.timestamp,
            })
            .collect();

        let body = serde_json::to_vec_pretty(&MirrorFile { conversation })?;
        tokio::fs::write(dir.join(filename), body).await?;
    }

    Ok(())
}

/// Behavioral contract for diary persistence, implemented for tests with an
/// in-memory fake and in production with [`SqliteDiaryStore`].
#[async_trait]
pub trait DiaryStore: Send + Sync {
    /// Loads the diary and its current generation. Fails with
    /// [`DiaryStoreError::NotFound`] when no blob exists.
    async fn load(&self, patient_id: &PatientId) -> Result<(PatientDiary, Generation), DiaryStoreError>;

    /// Persists `diary`. When `expected_generation` is `Some`, the write is
    /// conditional on the stored generation still matching; a mismatch fails
    /// with [`DiaryStoreError::Concurrency`]. `None` means unconditional
    /// first-create.
    async fn save(
        &self,
        patient_id: &PatientId,
        diary: &PatientDiary,
        expected_generation: Option<Generation>,
    ) -> Result<Generation, DiaryStoreError>;

    /// Builds a fresh diary and persists it unconditionally.
    async fn create(
        &self,
        patient_id: &PatientId,
        correlation_id: Option<CorrelationId>,
    ) -> Result<(PatientDiary, Generation), DiaryStoreError> {
        let diary = PatientDiary::new(patient_id.clone(), correlation_id);
        let generation = self.save(patient_id, &diary, None).await?;
        Ok((diary, generation))
    }

    /// `true` iff a blob exists for `patient_id`.
    async fn exists(&self, patient_id: &PatientId) -> Result<bool, DiaryStoreError>;

    /// Deletes the blob for `patient_id`. Returns `true` if one was deleted.
    async fn delete(&self, patient_id: &PatientId) -> Result<bool, DiaryStoreError>;

    /// Lists every patient id with a stored diary.
    async fn list_all_patient_ids(&self) -> Result<Vec<PatientId>, DiaryStoreError>;

    /// Lists patient ids whose diary has `monitoring.monitoring_active == true`.
    async fn list_monitoring_patients(&self) -> Result<Vec<PatientId>, DiaryStoreError>;
}

/// SQLite-backed [`DiaryStore`]. Opens (and migrates) the database on
/// [`Self::connect`], tuning PRAGMAs for a single-writer, many-reader
/// workload.
#[derive(Clone)]
pub struct SqliteDiaryStore {
    pool: SqlitePool,
}

impl SqliteDiaryStore {
    /// Opens `path`, creating it and running migrations if needed.
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self, DiaryStoreError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal);

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .acquire_timeout(STORE_IO_TIMEOUT)
            .connect_with(options)
            .await?;

        sqlx::query("PRAGMA cache_size = -20000")
            .execute(&pool)
            .await?;
        sqlx::query("PRAGMA temp_store = MEMORY").execute(&pool).await?;
        sqlx::query("PRAGMA mmap_size = 268435456")
            .execute(&pool)
            .await?;

        MIGRATOR.run(&pool).await.map_err(|e| DiaryStoreError::Backend(sqlx::Error::Migrate(Box::new(e))))?;

        Ok(Self { pool })
    }

    /// Opens an in-memory database for tests. Uses a single pooled
    /// connection since `:memory:` databases are not shared across
    /// connections in SQLite.
    pub async fn connect_in_memory() -> Result<Self, DiaryStoreError> {
        let options = SqliteConnectOptions::new()
            .filename(":memory:")
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .acquire_timeout(STORE_IO_TIMEOUT)
            .connect_with(options)
            .await?;

        MIGRATOR.run(&pool).await.map_err(|e| DiaryStoreError::Backend(sqlx::Error::Migrate(Box::new(e))))?;

        Ok(Self { pool })
    }
}

#[async_trait]
impl DiaryStore for SqliteDiaryStore {
    async fn load(&self, patient_id: &PatientId) -> Result<(PatientDiary, Generation), DiaryStoreError> {
        let row = sqlx::query("SELECT blob, generation FROM diary_blobs WHERE patient_id = ?")
            .bind(patient_id.as_ref())
            .fetch_optional(&self.pool)
            .await?;

        let row = row.ok_or_else(|| DiaryStoreError::NotFound {
            patient_id: patient_id.as_ref().to_string(),
        })?;

        let blob: String = row.try_get("blob")?;
        let generation: i64 = row.try_get("generation")?;

        let diary: PatientDiary =
            serde_json::from_str(&blob).map_err(|source| DiaryStoreError::Corrupt {
                patient_id: patient_id.as_ref().to_string(),
                source,
            })?;

        Ok((diary, Generation::new(generation)))
    }

    async fn save(
        &self,
        patient_id: &PatientId,
        diary: &PatientDiary,
        expected_generation: Option<Generation>,
    ) -> Result<Generation, DiaryStoreError> {
        let blob = serde_json::to_string(diary).map_err(|source| DiaryStoreError::Corrupt {
            patient_id: patient_id.as_ref().to_string(),
            source,
        })?;
        let key = object_key(patient_id);
        let now = chrono::Utc::now().to_rfc3339();

        match expected_generation {
            None => {
                let new_generation = Generation::first();
                sqlx::query(
                    "INSERT INTO diary_blobs (patient_id, object_key, generation, blob, updated_at)
                     VALUES (?, ?, ?, ?, ?)
                     ON CONFLICT(patient_id) DO UPDATE SET
                        object_key = excluded.object_key,
                        generation = excluded.generation,
                        blob = excluded.blob,
                        updated_at = excluded.updated_at",
                )
                .bind(patient_id.as_ref())
                .bind(&key)
                .bind(new_generation.as_i64())
                .bind(&blob)
                .bind(&now)
                .execute(&self.pool)
                .await?;
                Ok(new_generation)
            }
            Some(expected) => {
                let new_generation = expected.next();
                let result = sqlx::query(
                    "UPDATE diary_blobs SET generation = ?, blob = ?, updated_at = ?
                     WHERE patient_id = ? AND generation = ?",
                )
                .bind(new_generation.as_i64())
                .bind(&blob)
                .bind(&now)
                .bind(patient_id.as_ref())
                .bind(expected.as_i64())
                .execute(&self.pool)
                .await?;

                if result.rows_affected() == 0 {
                    return Err(DiaryStoreError::Concurrency {
                        patient_id: patient_id.as_ref().to_string(),
                        expected: Some(expected.as_i64()),
                    });
                }
                Ok(new_generation)
            }
        }
    }

    async fn exists(&self, patient_id: &PatientId) -> Result<bool, DiaryStoreError> {
        let row = sqlx::query("SELECT 1 FROM diary_blobs WHERE patient_id = ?")
            .bind(patient_id.as_ref())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    async fn delete(&self, patient_id: &PatientId) -> Result<bool, DiaryStoreError> {
        let result = sqlx::query("DELETE FROM diary_blobs WHERE patient_id = ?")
            .bind(patient_id.as_ref())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_all_patient_ids(&self) -> Result<Vec<PatientId>, DiaryStoreError> {
        let rows = sqlx::query("SELECT patient_id FROM diary_blobs")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter()
            .map(|row| {
                let raw: String = row.try_get("patient_id")?;
                PatientId::try_new(raw).map_err(|e| DiaryStoreError::Backend(sqlx::Error::Decode(Box::new(e))))
            })
            .collect()
    }

    async fn list_monitoring_patients(&self) -> Result<Vec<PatientId>, DiaryStoreError> {
        let all = self.list_all_patient_ids().await?;
        let mut active = Vec::new();
        for patient_id in all {
            if let Ok((diary, _)) = self.load(&patient_id).await {
                if diary.monitoring.monitoring_active {
                    active.push(patient_id);
                }
            }
        }
        Ok(active)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_then_load_round_trips() {
        let store = SqliteDiaryStore::connect_in_memory().await.unwrap();
        let pid = PatientId::try_new("PT-1").unwrap();
        let (diary, generation) = store.create(&pid, None).await.unwrap();
        assert_eq!(generation.as_i64(), 1);

        let (loaded, loaded_generation) = store.load(&pid).await.unwrap();
        assert_eq!(loaded.header.patient_id, diary.header.patient_id);
        assert_eq!(loaded_generation.as_i64(), 1);
    }

    #[tokio::test]
    async fn save_with_stale_generation_fails_with_concurrency_error() {
        let store = SqliteDiaryStore::connect_in_memory().await.unwrap();
        let pid = PatientId::try_new("PT-1").unwrap();
        let (diary, generation) = store.create(&pid, None).await.unwrap();

        store.save(&pid, &diary, Some(generation)).await.unwrap();

        let err = store.save(&pid, &diary, Some(generation)).await.unwrap_err();
        assert!(matches!(err, DiaryStoreError::Concurrency { .. }));
    }

    #[tokio::test]
    async fn load_missing_patient_is_not_found() {
        let store = SqliteDiaryStore::connect_in_memory().await.unwrap();
        let pid = PatientId::try_new("PT-404").unwrap();
        let err = store.load(&pid).await.unwrap_err();
        assert!(matches!(err, DiaryStoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn list_monitoring_patients_filters_on_active_flag() {
        let store = SqliteDiaryStore::connect_in_memory().await.unwrap();
        let pid_active = PatientId::try_new("PT-1").unwrap();
        let pid_inactive = PatientId::try_new("PT-2").unwrap();

        let (mut diary, generation) = store.create(&pid_active, None).await.unwrap();
        diary.monitoring.monitoring_active = true;
        store.save(&pid_active, &diary, Some(generation)).await.unwrap();

        store.create(&pid_inactive, None).await.unwrap();

        let monitoring = store.list_monitoring_patients().await.unwrap();
        assert_eq!(monitoring, vec![pid_active]);
    }
}
