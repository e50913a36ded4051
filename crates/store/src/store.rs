//! SQLite-backed store.
//!
//! A single connection behind a mutex: recorder writes and consolidation
//! reads interleave statement-by-statement, and the group-delete happens in
//! one `DELETE ... WHERE id IN` statement so a group can never be half
//! consumed. Timestamps are stored as unix epoch seconds, day keys as
//! `YYYY-MM-DD` text, embeddings as JSON arrays.

use crate::models::{
    CanonicalIdentity, FaceAnalytics, NewObservation, NotificationRecord, TransientObservation,
    VisitRecord,
};
use chrono::{DateTime, Days, Local, NaiveDate, TimeZone};
use facewatch_core::{Embedding, GalleryEntry};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("embedding serialization: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid stored timestamp: {0}")]
    InvalidTimestamp(i64),
    #[error("invalid stored date: {0}")]
    InvalidDate(String),
    #[error("store mutex poisoned")]
    Poisoned,
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS observations (
    id          INTEGER PRIMARY KEY,
    owner_id    INTEGER NOT NULL,
    alias       TEXT    NOT NULL,
    image       BLOB    NOT NULL,
    embedding   TEXT    NOT NULL,
    captured_at INTEGER NOT NULL,
    consumed    INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_observations_owner_alias
    ON observations (owner_id, alias, captured_at DESC);

CREATE TABLE IF NOT EXISTS identities (
    id            INTEGER PRIMARY KEY,
    owner_id      INTEGER NOT NULL,
    alias         TEXT    NOT NULL,
    image         BLOB    NOT NULL,
    embedding     TEXT    NOT NULL,
    quality_score REAL    NOT NULL DEFAULT 0,
    is_known      INTEGER NOT NULL DEFAULT 0,
    last_seen     INTEGER NOT NULL,
    date_seen     TEXT    NOT NULL,
    UNIQUE (owner_id, alias, date_seen)
);

CREATE TABLE IF NOT EXISTS visits (
    id          INTEGER PRIMARY KEY,
    identity_id INTEGER NOT NULL REFERENCES identities (id) ON DELETE CASCADE,
    image       BLOB    NOT NULL,
    detected_at INTEGER NOT NULL,
    date_seen   TEXT    NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_visits_identity ON visits (identity_id, detected_at);

CREATE TABLE IF NOT EXISTS notifications (
    id          INTEGER PRIMARY KEY,
    owner_id    INTEGER NOT NULL,
    alias       TEXT    NOT NULL,
    camera      TEXT    NOT NULL,
    detected_at INTEGER NOT NULL,
    delivered   INTEGER NOT NULL,
    image       BLOB    NOT NULL
);
";

const DATE_FMT: &str = "%Y-%m-%d";

fn ts_to_datetime(ts: i64) -> Result<DateTime<Local>, StoreError> {
    Local
        .timestamp_opt(ts, 0)
        .single()
        .ok_or(StoreError::InvalidTimestamp(ts))
}

fn parse_date(s: &str) -> Result<NaiveDate, StoreError> {
    NaiveDate::parse_from_str(s, DATE_FMT).map_err(|_| StoreError::InvalidDate(s.to_string()))
}

/// Epoch seconds of local midnight at the start of `date`.
fn local_day_start(date: NaiveDate) -> Result<i64, StoreError> {
    let midnight = date
        .and_hms_opt(0, 0, 0)
        .ok_or_else(|| StoreError::InvalidDate(date.to_string()))?;
    Local
        .from_local_datetime(&midnight)
        .earliest()
        .map(|dt| dt.timestamp())
        .ok_or_else(|| StoreError::InvalidDate(date.to_string()))
}

fn embedding_to_json(embedding: &Embedding) -> Result<String, StoreError> {
    Ok(serde_json::to_string(&embedding.values)?)
}

fn embedding_from_json(json: &str) -> Result<Embedding, StoreError> {
    Ok(Embedding::new(serde_json::from_str(json)?))
}

// Raw row shapes: column reads happen inside rusqlite closures, the
// fallible chrono/serde conversions happen outside where StoreError applies.
struct RawObservation {
    id: i64,
    owner_id: i64,
    alias: String,
    image: Vec<u8>,
    embedding: String,
    captured_at: i64,
    consumed: bool,
}

impl RawObservation {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            owner_id: row.get(1)?,
            alias: row.get(2)?,
            image: row.get(3)?,
            embedding: row.get(4)?,
            captured_at: row.get(5)?,
            consumed: row.get(6)?,
        })
    }

    fn finish(self) -> Result<TransientObservation, StoreError> {
        Ok(TransientObservation {
            id: self.id,
            owner_id: self.owner_id,
            alias: self.alias,
            image: self.image,
            embedding: embedding_from_json(&self.embedding)?,
            captured_at: ts_to_datetime(self.captured_at)?,
            consumed: self.consumed,
        })
    }
}

struct RawIdentity {
    id: i64,
    owner_id: i64,
    alias: String,
    image: Vec<u8>,
    embedding: String,
    quality_score: f64,
    is_known: bool,
    last_seen: i64,
    date_seen: String,
}

impl RawIdentity {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            owner_id: row.get(1)?,
            alias: row.get(2)?,
            image: row.get(3)?,
            embedding: row.get(4)?,
            quality_score: row.get(5)?,
            is_known: row.get(6)?,
            last_seen: row.get(7)?,
            date_seen: row.get(8)?,
        })
    }

    fn finish(self) -> Result<CanonicalIdentity, StoreError> {
        Ok(CanonicalIdentity {
            id: self.id,
            owner_id: self.owner_id,
            alias: self.alias,
            image: self.image,
            embedding: embedding_from_json(&self.embedding)?,
            quality_score: self.quality_score,
            is_known: self.is_known,
            last_seen: ts_to_datetime(self.last_seen)?,
            date_seen: parse_date(&self.date_seen)?,
        })
    }
}

const IDENTITY_COLS: &str =
    "id, owner_id, alias, image, embedding, quality_score, is_known, last_seen, date_seen";

/// Handle to the SQLite database. Cheap to share behind an `Arc`.
pub struct FaceStore {
    conn: Mutex<Connection>,
}

impl FaceStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        tracing::info!(path = %path.display(), "store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory database, used by tests and the synthetic demo.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    // --- observations ---

    pub fn insert_observation(&self, obs: &NewObservation) -> Result<i64, StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO observations (owner_id, alias, image, embedding, captured_at, consumed)
             VALUES (?1, ?2, ?3, ?4, ?5, 0)",
            params![
                obs.owner_id,
                obs.alias,
                obs.image,
                embedding_to_json(&obs.embedding)?,
                obs.captured_at.timestamp(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// All unconsumed observations for an owner, ordered by alias then
    /// most-recent-first, the order consolidation groups on.
    pub fn unconsumed_observations(
        &self,
        owner_id: i64,
    ) -> Result<Vec<TransientObservation>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, owner_id, alias, image, embedding, captured_at, consumed
             FROM observations
             WHERE owner_id = ?1 AND consumed = 0
             ORDER BY alias ASC, captured_at DESC, id DESC",
        )?;
        let raw: Vec<RawObservation> = stmt
            .query_map(params![owner_id], RawObservation::from_row)?
            .collect::<rusqlite::Result<_>>()?;
        raw.into_iter().map(RawObservation::finish).collect()
    }

    /// Delete a consolidated group in a single statement. The sole
    /// consumption point for observations.
    pub fn delete_observations(&self, ids: &[i64]) -> Result<usize, StoreError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let placeholders = vec!["?"; ids.len()].join(", ");
        let sql = format!("DELETE FROM observations WHERE id IN ({placeholders})");
        let conn = self.conn()?;
        Ok(conn.execute(&sql, params_from_iter(ids.iter()))?)
    }

    // --- identities ---

    /// Fetch the identity for (owner, alias, day), creating it from the
    /// given exemplar when absent. Returns the record and whether it was
    /// created by this call.
    #[allow(clippy::too_many_arguments)]
    pub fn get_or_create_identity(
        &self,
        owner_id: i64,
        alias: &str,
        date_seen: NaiveDate,
        image: &[u8],
        embedding: &Embedding,
        quality_score: f64,
        last_seen: DateTime<Local>,
    ) -> Result<(CanonicalIdentity, bool), StoreError> {
        if let Some(existing) = self.identity(owner_id, alias, date_seen)? {
            return Ok((existing, false));
        }

        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO identities
                 (owner_id, alias, image, embedding, quality_score, is_known, last_seen, date_seen)
             VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6, ?7)",
            params![
                owner_id,
                alias,
                image,
                embedding_to_json(embedding)?,
                quality_score,
                last_seen.timestamp(),
                date_seen.format(DATE_FMT).to_string(),
            ],
        )?;
        let id = conn.last_insert_rowid();
        drop(conn);

        Ok((
            CanonicalIdentity {
                id,
                owner_id,
                alias: alias.to_string(),
                image: image.to_vec(),
                embedding: embedding.clone(),
                quality_score,
                is_known: false,
                last_seen,
                date_seen,
            },
            true,
        ))
    }

    pub fn identity(
        &self,
        owner_id: i64,
        alias: &str,
        date_seen: NaiveDate,
    ) -> Result<Option<CanonicalIdentity>, StoreError> {
        let conn = self.conn()?;
        let raw = conn
            .query_row(
                &format!(
                    "SELECT {IDENTITY_COLS} FROM identities
                     WHERE owner_id = ?1 AND alias = ?2 AND date_seen = ?3"
                ),
                params![owner_id, alias, date_seen.format(DATE_FMT).to_string()],
                RawIdentity::from_row,
            )
            .optional()?;
        raw.map(RawIdentity::finish).transpose()
    }

    /// Replace an identity's exemplar in place (same owner/alias/day key).
    pub fn update_identity_exemplar(
        &self,
        id: i64,
        image: &[u8],
        embedding: &Embedding,
        quality_score: f64,
        last_seen: DateTime<Local>,
    ) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE identities
             SET image = ?2, embedding = ?3, quality_score = ?4, last_seen = ?5
             WHERE id = ?1",
            params![
                id,
                image,
                embedding_to_json(embedding)?,
                quality_score,
                last_seen.timestamp(),
            ],
        )?;
        Ok(())
    }

    /// The matcher's gallery: every canonical identity the owner has, named
    /// or still pending, oldest first.
    pub fn gallery(&self, owner_id: i64) -> Result<Vec<GalleryEntry>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, alias, is_known, embedding FROM identities
             WHERE owner_id = ?1 ORDER BY id ASC",
        )?;
        let raw: Vec<(i64, String, bool, String)> = stmt
            .query_map(params![owner_id], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
            })?
            .collect::<rusqlite::Result<_>>()?;

        raw.into_iter()
            .map(|(id, alias, is_known, embedding)| {
                Ok(GalleryEntry {
                    id,
                    alias,
                    is_known,
                    embedding: embedding_from_json(&embedding)?,
                })
            })
            .collect()
    }

    /// Rename every record of `old_alias` to the given name and mark it
    /// known. Returns the number of records renamed.
    pub fn rename_identity(
        &self,
        owner_id: i64,
        old_alias: &str,
        new_name: &str,
    ) -> Result<usize, StoreError> {
        let conn = self.conn()?;
        let renamed = conn.execute(
            "UPDATE identities SET alias = ?3, is_known = 1
             WHERE owner_id = ?1 AND alias = ?2",
            params![owner_id, old_alias, new_name],
        )?;
        if renamed > 0 {
            tracing::info!(owner_id, old_alias, new_name, renamed, "identity renamed");
        }
        Ok(renamed)
    }

    // --- visits ---

    pub fn insert_visit(
        &self,
        identity_id: i64,
        image: &[u8],
        detected_at: DateTime<Local>,
    ) -> Result<i64, StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO visits (identity_id, image, detected_at, date_seen)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                identity_id,
                image,
                detected_at.timestamp(),
                detected_at.date_naive().format(DATE_FMT).to_string(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// An identity's visit history, oldest first.
    pub fn visits(&self, identity_id: i64) -> Result<Vec<VisitRecord>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, identity_id, image, detected_at, date_seen
             FROM visits WHERE identity_id = ?1 ORDER BY detected_at ASC, id ASC",
        )?;
        let raw: Vec<(i64, i64, Vec<u8>, i64, String)> = stmt
            .query_map(params![identity_id], |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                ))
            })?
            .collect::<rusqlite::Result<_>>()?;

        raw.into_iter()
            .map(|(id, identity_id, image, detected_at, date_seen)| {
                Ok(VisitRecord {
                    id,
                    identity_id,
                    image,
                    detected_at: ts_to_datetime(detected_at)?,
                    date_seen: parse_date(&date_seen)?,
                })
            })
            .collect()
    }

    // --- notifications ---

    pub fn insert_notification(&self, record: &NotificationRecord) -> Result<i64, StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO notifications (owner_id, alias, camera, detected_at, delivered, image)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                record.owner_id,
                record.alias,
                record.camera,
                record.detected_at.timestamp(),
                record.delivered,
                record.image,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn notifications(&self, owner_id: i64) -> Result<Vec<NotificationRecord>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, owner_id, alias, camera, detected_at, delivered, image
             FROM notifications WHERE owner_id = ?1 ORDER BY id ASC",
        )?;
        let raw: Vec<(i64, i64, String, String, i64, bool, Vec<u8>)> = stmt
            .query_map(params![owner_id], |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                    row.get(6)?,
                ))
            })?
            .collect::<rusqlite::Result<_>>()?;

        raw.into_iter()
            .map(|(id, owner_id, alias, camera, detected_at, delivered, image)| {
                Ok(NotificationRecord {
                    id,
                    owner_id,
                    alias,
                    camera,
                    detected_at: ts_to_datetime(detected_at)?,
                    delivered,
                    image,
                })
            })
            .collect()
    }

    // --- analytics ---

    /// Windowed visit counts relative to `now`. Nothing is cached; every
    /// call recomputes from the visit log.
    pub fn analytics(&self, owner_id: i64, now: DateTime<Local>) -> Result<FaceAnalytics, StoreError> {
        let today = now.date_naive();
        let end = local_day_start(
            today
                .checked_add_days(Days::new(1))
                .ok_or_else(|| StoreError::InvalidDate(today.to_string()))?,
        )?;
        let window_start = |days_back: u64| -> Result<i64, StoreError> {
            local_day_start(
                today
                    .checked_sub_days(Days::new(days_back))
                    .ok_or_else(|| StoreError::InvalidDate(today.to_string()))?,
            )
        };

        let total = self.count_visits(owner_id, None, None)?;
        let known = self.count_visits(owner_id, Some(true), None)?;
        let unknown = self.count_visits(owner_id, Some(false), None)?;

        Ok(FaceAnalytics {
            date: today,
            total_faces: total,
            known_faces: known,
            unknown_faces: unknown,
            known_faces_today: self.count_visits(owner_id, Some(true), Some((window_start(0)?, end)))?,
            known_faces_week: self.count_visits(owner_id, Some(true), Some((window_start(7)?, end)))?,
            known_faces_month: self.count_visits(owner_id, Some(true), Some((window_start(30)?, end)))?,
            known_faces_year: self.count_visits(owner_id, Some(true), Some((window_start(365)?, end)))?,
        })
    }

    fn count_visits(
        &self,
        owner_id: i64,
        is_known: Option<bool>,
        range: Option<(i64, i64)>,
    ) -> Result<u64, StoreError> {
        let mut sql = String::from(
            "SELECT COUNT(*) FROM visits v
             JOIN identities i ON i.id = v.identity_id
             WHERE i.owner_id = ?1",
        );
        if let Some(known) = is_known {
            sql.push_str(if known {
                " AND i.is_known = 1"
            } else {
                " AND i.is_known = 0"
            });
        }
        if range.is_some() {
            sql.push_str(" AND v.detected_at >= ?2 AND v.detected_at < ?3");
        }

        let conn = self.conn()?;
        let count: i64 = match range {
            Some((start, end)) => {
                conn.query_row(&sql, params![owner_id, start, end], |row| row.get(0))?
            }
            None => conn.query_row(&sql, params![owner_id], |row| row.get(0))?,
        };
        Ok(count as u64)
    }
}
