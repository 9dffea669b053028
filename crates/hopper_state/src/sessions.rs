//! Chunked upload sessions: fragment storage, completeness detection, and
//! exactly-once assembly hand-off.
//!
//! The whole ingest path runs in one transaction, so the "all chunks
//! received" check and the assembled-payload hand-off cannot race: of two
//! workers receiving the final two chunks concurrently, exactly one observes
//! completeness and flips the session to 'assembled' under a CAS.
//!
//! Expired sessions become tombstones instead of vanishing. A chunk sent to
//! a tombstoned session fails with `SessionError::Expired` - resuming after
//! TTL would silently lose the purged fragments, so it is rejected loudly.

use crate::error::{Result, SessionError};
use crate::StateStore;
use hopper_protocol::types::{Record, SessionId};
use sqlx::Row;
use tracing::{debug, info, warn};

/// Outcome of one chunk submission.
#[derive(Debug, Clone, PartialEq)]
pub enum ChunkIngest {
    /// More chunks outstanding.
    Partial {
        received_chunks: u32,
        total_chunks: u32,
        /// Lowest chunk number not yet received.
        next_chunk: Option<u32>,
    },
    /// This submission completed the session; the assembled payload is handed
    /// off here exactly once.
    Complete { records: Vec<Record> },
}

/// Counts from one session purge sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionPurge {
    /// Open sessions past TTL converted to tombstones (fragments dropped).
    pub tombstoned: u64,
    /// Tombstones and assembled sessions past retention, fully removed.
    pub deleted: u64,
}

impl StateStore {
    /// Store one chunk and hand back the assembled payload if it was the
    /// final missing piece.
    ///
    /// The first chunk to arrive creates the session and fixes
    /// `total_chunks`. Duplicate chunk numbers overwrite their fragment
    /// idempotently. `ttl_secs` bounds an open session's life;
    /// `tombstone_ttl_secs` bounds how long an expired session keeps
    /// rejecting late chunks before the id may be reused.
    pub async fn ingest_chunk(
        &self,
        session_id: &SessionId,
        chunk_number: u32,
        total_chunks: u32,
        payload: &[Record],
        ttl_secs: i64,
        tombstone_ttl_secs: i64,
    ) -> Result<ChunkIngest> {
        let now = Self::now_millis();
        let mut tx = self.pool.begin().await?;

        let session = sqlx::query(
            "SELECT total_chunks, state, expires_at FROM upload_sessions WHERE session_id = ?",
        )
        .bind(session_id.as_str())
        .fetch_optional(&mut *tx)
        .await?;

        let fixed_total = match session {
            None => {
                // First chunk opens the session and fixes the chunk count.
                if total_chunks == 0 {
                    tx.rollback().await?;
                    return Err(SessionError::ZeroChunks(session_id.to_string()).into());
                }
                if chunk_number == 0 || chunk_number > total_chunks {
                    tx.rollback().await?;
                    return Err(SessionError::ChunkOutOfRange {
                        session_id: session_id.to_string(),
                        chunk_number,
                        total_chunks,
                    }
                    .into());
                }
                sqlx::query(
                    r#"
                    INSERT INTO upload_sessions (session_id, total_chunks, state, created_at, updated_at, expires_at)
                    VALUES (?, ?, 'open', ?, ?, ?)
                    "#,
                )
                .bind(session_id.as_str())
                .bind(total_chunks as i64)
                .bind(now)
                .bind(now)
                .bind(now + ttl_secs.saturating_mul(1000))
                .execute(&mut *tx)
                .await?;

                debug!(session_id = %session_id, total_chunks, "Upload session opened");
                total_chunks
            }
            Some(row) => {
                let state: String = row.get("state");
                let expires_at: i64 = row.get("expires_at");
                let stored_total = row.get::<i64, _>("total_chunks") as u32;

                match state.as_str() {
                    "assembled" => {
                        tx.rollback().await?;
                        return Err(SessionError::AlreadyComplete(session_id.to_string()).into());
                    }
                    "expired" => {
                        tx.rollback().await?;
                        return Err(SessionError::Expired(session_id.to_string()).into());
                    }
                    _ => {}
                }

                if expires_at <= now {
                    // Lazy expiry on touch: drop fragments, leave a tombstone
                    // so this late chunk (and any after it) fails loudly.
                    sqlx::query("DELETE FROM upload_chunks WHERE session_id = ?")
                        .bind(session_id.as_str())
                        .execute(&mut *tx)
                        .await?;
                    sqlx::query(
                        "UPDATE upload_sessions SET state = 'expired', updated_at = ?, expires_at = ? WHERE session_id = ?",
                    )
                    .bind(now)
                    .bind(now + tombstone_ttl_secs.saturating_mul(1000))
                    .bind(session_id.as_str())
                    .execute(&mut *tx)
                    .await?;
                    tx.commit().await?;

                    warn!(session_id = %session_id, "Chunk arrived after session TTL; session tombstoned");
                    return Err(SessionError::Expired(session_id.to_string()).into());
                }

                if total_chunks != stored_total {
                    tx.rollback().await?;
                    return Err(SessionError::TotalChunksMismatch {
                        session_id: session_id.to_string(),
                        expected: stored_total,
                        declared: total_chunks,
                    }
                    .into());
                }
                if chunk_number == 0 || chunk_number > stored_total {
                    tx.rollback().await?;
                    return Err(SessionError::ChunkOutOfRange {
                        session_id: session_id.to_string(),
                        chunk_number,
                        total_chunks: stored_total,
                    }
                    .into());
                }

                stored_total
            }
        };

        // Idempotent overwrite: the (session, chunk) primary key replaces.
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO upload_chunks (session_id, chunk_number, payload, received_at)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(session_id.as_str())
        .bind(chunk_number as i64)
        .bind(serde_json::to_string(payload)?)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        let received: Vec<u32> = sqlx::query(
            "SELECT chunk_number FROM upload_chunks WHERE session_id = ? ORDER BY chunk_number ASC",
        )
        .bind(session_id.as_str())
        .fetch_all(&mut *tx)
        .await?
        .iter()
        .map(|r| r.get::<i64, _>("chunk_number") as u32)
        .collect();

        if received.len() as u32 == fixed_total {
            // Completeness check and hand-off are one atomic step: the CAS on
            // the session state ensures a single winner.
            let claimed = sqlx::query(
                "UPDATE upload_sessions SET state = 'assembled', updated_at = ? WHERE session_id = ? AND state = 'open'",
            )
            .bind(now)
            .bind(session_id.as_str())
            .execute(&mut *tx)
            .await?;

            if claimed.rows_affected() == 0 {
                tx.rollback().await?;
                return Err(SessionError::AlreadyComplete(session_id.to_string()).into());
            }

            let fragments = sqlx::query(
                "SELECT payload FROM upload_chunks WHERE session_id = ? ORDER BY chunk_number ASC",
            )
            .bind(session_id.as_str())
            .fetch_all(&mut *tx)
            .await?;

            let mut records = Vec::new();
            for fragment in &fragments {
                let batch: Vec<Record> = serde_json::from_str(&fragment.get::<String, _>("payload"))?;
                records.extend(batch);
            }

            // Fragments served their purpose; the 'assembled' row remains as
            // the completion marker until its TTL passes.
            sqlx::query("DELETE FROM upload_chunks WHERE session_id = ?")
                .bind(session_id.as_str())
                .execute(&mut *tx)
                .await?;

            tx.commit().await?;

            info!(
                session_id = %session_id,
                chunks = fixed_total,
                records = records.len(),
                "Upload session assembled"
            );
            return Ok(ChunkIngest::Complete { records });
        }

        sqlx::query("UPDATE upload_sessions SET updated_at = ? WHERE session_id = ?")
            .bind(now)
            .bind(session_id.as_str())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        let next_chunk = (1..=fixed_total).find(|n| !received.contains(n));
        debug!(
            session_id = %session_id,
            received = received.len(),
            total = fixed_total,
            "Chunk stored"
        );
        Ok(ChunkIngest::Partial {
            received_chunks: received.len() as u32,
            total_chunks: fixed_total,
            next_chunk,
        })
    }

    /// Sweep sessions past their TTL: open sessions become tombstones (their
    /// fragments are dropped), and tombstones/assembled markers past their
    /// own retention are removed for good.
    pub async fn purge_expired_sessions(&self, tombstone_ttl_secs: i64) -> Result<SessionPurge> {
        let now = Self::now_millis();
        let mut tx = self.pool.begin().await?;

        let deleted = sqlx::query(
            "DELETE FROM upload_sessions WHERE state IN ('expired', 'assembled') AND expires_at <= ?",
        )
        .bind(now)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        sqlx::query(
            "DELETE FROM upload_chunks WHERE session_id IN (SELECT session_id FROM upload_sessions WHERE state = 'open' AND expires_at <= ?)",
        )
        .bind(now)
        .execute(&mut *tx)
        .await?;

        let tombstoned = sqlx::query(
            "UPDATE upload_sessions SET state = 'expired', updated_at = ?, expires_at = ? WHERE state = 'open' AND expires_at <= ?",
        )
        .bind(now)
        .bind(now + tombstone_ttl_secs.saturating_mul(1000))
        .bind(now)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        tx.commit().await?;

        if tombstoned > 0 || deleted > 0 {
            info!(tombstoned, deleted, "Expired upload sessions purged");
        }
        Ok(SessionPurge { tombstoned, deleted })
    }
}
