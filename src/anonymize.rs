use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDate, NaiveDateTime, Utc};
use rand::Rng;
use sha2::{Digest, Sha256};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::info;

use crate::config::AnonymizationSettings;
use crate::error::MappingError;
use crate::metadata::ACQ_DATETIME_FORMAT;
use crate::models::{PatientIdentity, SeriesMetadata};

const MAX_ID_ATTEMPTS: usize = 32;

/// One-way, fixed-length hash of an identifier.
pub fn hash_identifier(original: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(original.as_bytes());
    let result = hasher.finalize();
    hex::encode(result)[..16].to_uppercase()
}

fn random_anon_id(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes.max(1)];
    rand::thread_rng().fill(buf.as_mut_slice());
    hex::encode_upper(buf)
}

fn random_uid(root: &str) -> String {
    format!("{}.{}", root, rand::thread_rng().gen::<u128>())
}

fn random_shift(max_days: i64) -> i64 {
    if max_days <= 0 {
        return 0;
    }
    let mut rng = rand::thread_rng();
    let magnitude = rng.gen_range(1..=max_days);
    if rng.gen_bool(0.5) {
        magnitude
    } else {
        -magnitude
    }
}

/// Deterministic replacement UID: same inputs, same output, original not recoverable.
pub fn derive_uid(root: &str, anon_study_uid: &str, original: &str) -> String {
    let digest = Sha256::digest(format!("{}/{}", anon_study_uid, original).as_bytes());
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest[..16]);
    format!("{}.{}", root, u128::from_be_bytes(bytes))
}

/// Shifts a `YYYY-MM-DD[ HH:MM:SS]` value by whole days, keeping its format.
pub fn shift_date(value: &str, days: i64) -> Option<String> {
    let delta = chrono::Duration::days(days);
    if let Ok(dt) = NaiveDateTime::parse_from_str(value, ACQ_DATETIME_FORMAT) {
        return Some((dt + delta).format(ACQ_DATETIME_FORMAT).to_string());
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .map(|d| (d + delta).format("%Y-%m-%d").to_string())
}

/// Replacement values for one anonymized session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnonymizationPlan {
    pub anon_id: String,
    pub session_id: String,
    pub date_shift_days: i64,
    pub anon_study_uid: String,
    pub uid_root: String,
}

impl AnonymizationPlan {
    /// Rewrites identifying series fields in place. An absent institution stays absent.
    pub fn apply(&self, meta: &mut SeriesMetadata) {
        if let Some(uid) = meta.series_uid.take() {
            meta.series_uid = Some(derive_uid(&self.uid_root, &self.anon_study_uid, &uid));
        }
        meta.study_uid = Some(self.anon_study_uid.clone());
        meta.institution_name = meta.institution_name.as_deref().map(hash_identifier);
        if let Some(dt) = meta.acq_date_time.take() {
            meta.acq_date_time = shift_date(&dt, self.date_shift_days);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubjectRecord {
    pub anon_id: String,
    pub patient_id: String,
    pub patient_name: Option<String>,
    pub patient_birth_date: Option<String>,
    pub patient_sex: Option<String>,
    pub date_shift_days: Option<i64>,
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRecord {
    pub anon_id: String,
    pub session_number: i64,
    pub session_id: String,
    pub source_path: Option<String>,
    pub original_study_uid: Option<String>,
    pub anon_study_uid: Option<String>,
    pub institution_name: Option<String>,
    pub converted_at: String,
}

/// Open mapping transaction for one subject intake. Holds the store's writer lock;
/// dropping it without [`Reservation::commit`] rolls the mapping back.
pub struct Reservation {
    tx: Transaction<'static, Sqlite>,
    _guard: OwnedMutexGuard<()>,
    plan: AnonymizationPlan,
    created: bool,
}

impl Reservation {
    pub fn plan(&self) -> &AnonymizationPlan {
        &self.plan
    }

    /// True when this intake introduced a new subject.
    pub fn is_new_subject(&self) -> bool {
        self.created
    }

    pub async fn commit(self) -> Result<(), MappingError> {
        self.tx.commit().await?;
        Ok(())
    }

    pub async fn rollback(self) -> Result<(), MappingError> {
        self.tx.rollback().await?;
        Ok(())
    }
}

/// Persistent PatientID → anonymous id mapping backed by SQLite.
#[derive(Clone)]
pub struct AnonymizationStore {
    pool: SqlitePool,
    writer: Arc<Mutex<()>>,
    settings: AnonymizationSettings,
    path: PathBuf,
}

impl AnonymizationStore {
    pub async fn open(path: &Path, settings: AnonymizationSettings) -> Result<Self, MappingError> {
        let unavailable = |reason: String| MappingError::Unavailable {
            path: path.to_path_buf(),
            reason,
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| unavailable(e.to_string()))?;
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(30))
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(|e| unavailable(e.to_string()))?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS subjects (
                anon_id TEXT PRIMARY KEY,
                patient_id TEXT NOT NULL UNIQUE,
                patient_name TEXT,
                patient_birth_date TEXT,
                patient_sex TEXT,
                date_shift_days INTEGER,
                created_at TEXT NOT NULL
            )",
        )
        .execute(&pool)
        .await?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS sessions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                anon_id TEXT NOT NULL REFERENCES subjects(anon_id),
                session_number INTEGER NOT NULL,
                session_id TEXT NOT NULL,
                source_path TEXT,
                original_study_uid TEXT,
                anon_study_uid TEXT,
                institution_name TEXT,
                institution_hash TEXT,
                converted_at TEXT NOT NULL,
                UNIQUE (anon_id, session_number)
            )",
        )
        .execute(&pool)
        .await?;

        info!("Opened anonymization mapping store {:?}", path);
        Ok(Self {
            pool,
            writer: Arc::new(Mutex::new(())),
            settings,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Maps `patient_id` to its anonymous id (creating it if needed) and allocates the
    /// next session number, inside a transaction the caller commits or drops.
    pub async fn reserve(
        &self,
        patient_id: &str,
        identity: &PatientIdentity,
        source_path: &str,
    ) -> Result<Reservation, MappingError> {
        let guard = self.writer.clone().lock_owned().await;
        let mut tx = self.pool.begin().await?;

        let existing = sqlx::query("SELECT anon_id, date_shift_days FROM subjects WHERE patient_id = ?")
            .bind(patient_id)
            .fetch_optional(&mut *tx)
            .await?;

        let (anon_id, date_shift_days, created) = match existing {
            Some(row) => {
                let anon_id: String = row.try_get("anon_id")?;
                let shift: Option<i64> = row.try_get("date_shift_days")?;
                (anon_id, shift.unwrap_or(0), false)
            }
            None => {
                let anon_id = self.unique_anon_id(&mut tx).await?;
                let shift = self
                    .settings
                    .date_shift_days
                    .unwrap_or_else(|| random_shift(self.settings.max_random_shift_days));
                sqlx::query(
                    "INSERT INTO subjects (anon_id, patient_id, patient_name, patient_birth_date,
                        patient_sex, date_shift_days, created_at)
                     VALUES (?, ?, ?, ?, ?, ?, ?)",
                )
                .bind(&anon_id)
                .bind(patient_id)
                .bind(&identity.patient_name)
                .bind(&identity.patient_birth_date)
                .bind(&identity.patient_sex)
                .bind(shift)
                .bind(Utc::now().to_rfc3339())
                .execute(&mut *tx)
                .await?;
                (anon_id, shift, true)
            }
        };

        let session_number: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(session_number), 0) + 1 FROM sessions WHERE anon_id = ?",
        )
        .bind(&anon_id)
        .fetch_one(&mut *tx)
        .await?;

        let anon_study_uid = random_uid(&self.settings.uid_root);
        let institution_hash = identity.institution_name.as_deref().map(hash_identifier);
        sqlx::query(
            "INSERT INTO sessions (anon_id, session_number, session_id, source_path,
                original_study_uid, anon_study_uid, institution_name, institution_hash, converted_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&anon_id)
        .bind(session_number)
        .bind(session_number.to_string())
        .bind(source_path)
        .bind(&identity.study_uid)
        .bind(&anon_study_uid)
        .bind(&identity.institution_name)
        .bind(&institution_hash)
        .bind(Utc::now().to_rfc3339())
        .execute(&mut *tx)
        .await?;

        Ok(Reservation {
            tx,
            _guard: guard,
            plan: AnonymizationPlan {
                anon_id,
                session_id: session_number.to_string(),
                date_shift_days,
                anon_study_uid,
                uid_root: self.settings.uid_root.clone(),
            },
            created,
        })
    }

    /// Reserve and commit immediately.
    pub async fn anonymize(
        &self,
        patient_id: &str,
        identity: &PatientIdentity,
        source_path: &str,
    ) -> Result<AnonymizationPlan, MappingError> {
        let reservation = self.reserve(patient_id, identity, source_path).await?;
        let plan = reservation.plan().clone();
        reservation.commit().await?;
        Ok(plan)
    }

    async fn unique_anon_id(
        &self,
        tx: &mut Transaction<'static, Sqlite>,
    ) -> Result<String, MappingError> {
        for _ in 0..MAX_ID_ATTEMPTS {
            let candidate = random_anon_id(self.settings.id_bytes);
            let taken = sqlx::query("SELECT 1 FROM subjects WHERE anon_id = ?")
                .bind(&candidate)
                .fetch_optional(&mut **tx)
                .await?
                .is_some();
            if !taken {
                return Ok(candidate);
            }
        }
        Err(MappingError::IdExhausted(MAX_ID_ATTEMPTS))
    }

    pub async fn subjects(&self) -> Result<Vec<SubjectRecord>, MappingError> {
        let rows = sqlx::query(
            "SELECT anon_id, patient_id, patient_name, patient_birth_date, patient_sex,
                date_shift_days, created_at
             FROM subjects ORDER BY patient_id",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(subject_from_row).collect()
    }

    pub async fn subject_by_patient_id(
        &self,
        patient_id: &str,
    ) -> Result<SubjectRecord, MappingError> {
        let row = sqlx::query(
            "SELECT anon_id, patient_id, patient_name, patient_birth_date, patient_sex,
                date_shift_days, created_at
             FROM subjects WHERE patient_id = ?",
        )
        .bind(patient_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| MappingError::NotFound(format!("PatientID {:?}", patient_id)))?;
        subject_from_row(&row)
    }

    pub async fn subject_by_anon_id(&self, anon_id: &str) -> Result<SubjectRecord, MappingError> {
        let row = sqlx::query(
            "SELECT anon_id, patient_id, patient_name, patient_birth_date, patient_sex,
                date_shift_days, created_at
             FROM subjects WHERE anon_id = ?",
        )
        .bind(anon_id.to_uppercase())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| MappingError::NotFound(format!("anonymous id {:?}", anon_id)))?;
        subject_from_row(&row)
    }

    pub async fn sessions_for(&self, anon_id: &str) -> Result<Vec<SessionRecord>, MappingError> {
        let rows = sqlx::query(
            "SELECT anon_id, session_number, session_id, source_path, original_study_uid,
                anon_study_uid, institution_name, converted_at
             FROM sessions WHERE anon_id = ? ORDER BY session_number",
        )
        .bind(anon_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                Ok(SessionRecord {
                    anon_id: row.try_get("anon_id")?,
                    session_number: row.try_get("session_number")?,
                    session_id: row.try_get("session_id")?,
                    source_path: row.try_get("source_path")?,
                    original_study_uid: row.try_get("original_study_uid")?,
                    anon_study_uid: row.try_get("anon_study_uid")?,
                    institution_name: row.try_get("institution_name")?,
                    converted_at: row.try_get("converted_at")?,
                })
            })
            .collect()
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn subject_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<SubjectRecord, MappingError> {
    Ok(SubjectRecord {
        anon_id: row.try_get("anon_id")?,
        patient_id: row.try_get("patient_id")?,
        patient_name: row.try_get("patient_name")?,
        patient_birth_date: row.try_get("patient_birth_date")?,
        patient_sex: row.try_get("patient_sex")?,
        date_shift_days: row.try_get("date_shift_days")?,
        created_at: row.try_get("created_at")?,
    })
}
