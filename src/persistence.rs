//! # SQLite Tour Store
//!
//! Persistent tour store backed by SQLite.
//!
//! ## Tables
//!
//! - `tours`: one row per tour with its sample count
//! - `tour_tracks`: raw track as a MessagePack blob, loaded on demand
//! - `tour_geo_parts`: `(tour_id, geo_part)` pairs, indexed on `geo_part`
//!   for candidate lookup
//! - `store_meta`: bucket resolution the geo parts were computed with
//!
//! The connection sits behind a mutex; the engine only touches it from the
//! retrieval thread and from compare workers loading tracks.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use log::{debug, info};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};

use crate::buckets::{track_buckets, GeoBucket};
use crate::error::{GeoCompareError, OptionExt, Result};
use crate::retriever::{CandidateStore, TourFilter};
use crate::track::{RecordedTrack, TrackProvider};
use crate::TourId;

/// Geo parts bound per `IN (...)` query, below SQLite's parameter limit.
const MAX_QUERY_PARAMS: usize = 500;

/// SQLite-backed store implementing both engine store contracts.
pub struct SqliteTourStore {
    db: Mutex<Connection>,
    bucket_resolution: u32,
}

impl SqliteTourStore {
    // ========================================================================
    // Initialization
    // ========================================================================

    /// Open or create a store at `path`.
    ///
    /// An existing database indexed at a different bucket resolution is
    /// rejected, since its geo parts would not match the engine's buckets.
    pub fn new<P: AsRef<Path>>(path: P, bucket_resolution: u32) -> Result<Self> {
        let db = Connection::open(path)?;
        Self::with_connection(db, bucket_resolution)
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory(bucket_resolution: u32) -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?, bucket_resolution)
    }

    fn with_connection(db: Connection, bucket_resolution: u32) -> Result<Self> {
        if bucket_resolution == 0 {
            return Err(GeoCompareError::config("bucket resolution must be positive"));
        }
        Self::init_schema(&db)?;

        let stored: Option<String> = db
            .query_row(
                "SELECT value FROM store_meta WHERE key = 'bucket_resolution'",
                [],
                |row| row.get(0),
            )
            .optional()?;

        match stored {
            Some(value) if value != bucket_resolution.to_string() => {
                return Err(GeoCompareError::config(format!(
                    "store indexed at {} cells/degree, requested {}",
                    value, bucket_resolution
                )));
            }
            Some(_) => {}
            None => {
                db.execute(
                    "INSERT INTO store_meta (key, value) VALUES ('bucket_resolution', ?)",
                    params![bucket_resolution.to_string()],
                )?;
            }
        }

        let store = Self {
            db: Mutex::new(db),
            bucket_resolution,
        };
        info!(
            "[TourStore] Opened store with {} tours at {} cells/degree",
            store.tour_count()?,
            bucket_resolution
        );
        Ok(store)
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS store_meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS tours (
                tour_id INTEGER PRIMARY KEY,
                sample_count INTEGER NOT NULL,
                created_at INTEGER DEFAULT (strftime('%s', 'now'))
            );

            -- Raw tracks (loaded on demand)
            CREATE TABLE IF NOT EXISTS tour_tracks (
                tour_id INTEGER PRIMARY KEY,
                track_data BLOB NOT NULL,
                FOREIGN KEY (tour_id) REFERENCES tours(tour_id) ON DELETE CASCADE
            );

            -- Coarse cells touched by each tour
            CREATE TABLE IF NOT EXISTS tour_geo_parts (
                tour_id INTEGER NOT NULL,
                geo_part INTEGER NOT NULL,
                PRIMARY KEY (tour_id, geo_part),
                FOREIGN KEY (tour_id) REFERENCES tours(tour_id) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_tour_geo_parts_part ON tour_geo_parts(geo_part);

            PRAGMA foreign_keys = ON;
        "#,
        )?;
        Ok(())
    }

    // ========================================================================
    // Tour Management
    // ========================================================================

    /// Add or replace a tour with its geo parts.
    pub fn insert_track(&self, track: &RecordedTrack) -> Result<()> {
        track.validate()?;
        let blob = rmp_serde::to_vec(track).map_err(|e| {
            GeoCompareError::store(format!("failed to encode tour {}: {}", track.tour_id, e))
        })?;
        let buckets = track_buckets(track, self.bucket_resolution);

        let mut db = self.lock()?;
        let tx = db.transaction()?;
        tx.execute("DELETE FROM tours WHERE tour_id = ?", params![track.tour_id])?;
        tx.execute(
            "INSERT INTO tours (tour_id, sample_count) VALUES (?, ?)",
            params![track.tour_id, track.len() as i64],
        )?;
        tx.execute(
            "INSERT INTO tour_tracks (tour_id, track_data) VALUES (?, ?)",
            params![track.tour_id, blob],
        )?;
        {
            let mut stmt =
                tx.prepare("INSERT INTO tour_geo_parts (tour_id, geo_part) VALUES (?, ?)")?;
            for bucket in &buckets {
                stmt.execute(params![track.tour_id, bucket.id()])?;
            }
        }
        tx.commit()?;

        debug!(
            "[TourStore] Stored tour {} ({} samples, {} geo parts)",
            track.tour_id,
            track.len(),
            buckets.len()
        );
        Ok(())
    }

    /// Remove a tour. Returns whether it existed.
    pub fn remove_tour(&self, tour_id: TourId) -> Result<bool> {
        let removed = self
            .lock()?
            .execute("DELETE FROM tours WHERE tour_id = ?", params![tour_id])?;
        Ok(removed > 0)
    }

    /// Delete every tour.
    pub fn clear(&self) -> Result<()> {
        self.lock()?.execute("DELETE FROM tours", [])?;
        info!("[TourStore] Cleared all tours");
        Ok(())
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub fn tour_count(&self) -> Result<usize> {
        let count: i64 = self
            .lock()?
            .query_row("SELECT COUNT(*) FROM tours", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    pub fn contains(&self, tour_id: TourId) -> Result<bool> {
        let found: Option<i64> = self
            .lock()?
            .query_row(
                "SELECT tour_id FROM tours WHERE tour_id = ?",
                params![tour_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn tour_ids(&self) -> Result<Vec<TourId>> {
        let db = self.lock()?;
        let mut stmt = db.prepare("SELECT tour_id FROM tours ORDER BY tour_id")?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<Vec<TourId>, _>>()?;
        Ok(ids)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.db
            .lock()
            .map_err(|_| GeoCompareError::store("database lock poisoned"))
    }
}

impl TrackProvider for SqliteTourStore {
    fn load_track(&self, tour_id: TourId) -> Result<Arc<RecordedTrack>> {
        let blob: Option<Vec<u8>> = self
            .lock()?
            .query_row(
                "SELECT track_data FROM tour_tracks WHERE tour_id = ?",
                params![tour_id],
                |row| row.get(0),
            )
            .optional()?;
        let blob = blob.ok_or_track_not_found(tour_id)?;

        let track: RecordedTrack = rmp_serde::from_slice(&blob)
            .map_err(|e| GeoCompareError::invalid_track(tour_id, format!("corrupt blob: {}", e)))?;
        Ok(Arc::new(track))
    }
}

impl CandidateStore for SqliteTourStore {
    fn query_candidate_tour_ids(
        &self,
        buckets: &BTreeSet<GeoBucket>,
        filter: Option<&TourFilter>,
    ) -> Result<Vec<TourId>> {
        let parts: Vec<i64> = buckets.iter().map(GeoBucket::id).collect();
        let mut hits: BTreeSet<TourId> = BTreeSet::new();

        let db = self.lock()?;
        for chunk in parts.chunks(MAX_QUERY_PARAMS) {
            let placeholders = vec!["?"; chunk.len()].join(",");
            let sql = format!(
                "SELECT DISTINCT tour_id FROM tour_geo_parts WHERE geo_part IN ({})",
                placeholders
            );
            let mut stmt = db.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(chunk.iter()), |row| row.get(0))?;
            for row in rows {
                hits.insert(row?);
            }
        }
        drop(db);

        Ok(hits
            .into_iter()
            .filter(|id| filter.map_or(true, |keep| keep(*id)))
            .collect())
    }

    fn bucket_resolution(&self) -> Option<u32> {
        Some(self.bucket_resolution)
    }
}
