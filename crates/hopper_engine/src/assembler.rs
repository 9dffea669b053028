//! Chunked-session assembly: maps inbound chunk submissions onto the state
//! store's session ledger and shapes the partial/complete acknowledgements.

use hopper_protocol::api::{ChunkAck, ChunkSubmission};
use hopper_protocol::config::EngineConfig;
use hopper_protocol::types::Record;
use hopper_state::{ChunkIngest, StateStore};
use tracing::debug;

use crate::error::Result;

/// Outcome of feeding one chunk into its session.
pub(crate) enum Assembly {
    /// Session still missing chunks; acknowledge and wait.
    Partial(ChunkAck),
    /// Final chunk arrived; the full payload is ready for a job.
    Assembled { records: Vec<Record> },
}

/// Stateless front door for chunk uploads; all durable bookkeeping lives in
/// the session ledger.
pub(crate) struct ChunkAssembler {
    state: StateStore,
    config: EngineConfig,
}

impl ChunkAssembler {
    pub(crate) fn new(state: StateStore, config: EngineConfig) -> Self {
        Self { state, config }
    }

    pub(crate) async fn receive(&self, submission: &ChunkSubmission) -> Result<Assembly> {
        let ingest = self
            .state
            .ingest_chunk(
                &submission.session_id,
                submission.chunk_number,
                submission.total_chunks,
                &submission.chunk_data,
                self.config.session_ttl_secs,
                self.config.session_tombstone_ttl_secs,
            )
            .await?;

        match ingest {
            ChunkIngest::Partial { received_chunks, total_chunks, next_chunk } => {
                debug!(
                    session_id = %submission.session_id,
                    received_chunks,
                    total_chunks,
                    "Chunk buffered"
                );
                Ok(Assembly::Partial(ChunkAck::Partial {
                    progress_percent: chunk_percent(received_chunks, total_chunks),
                    received_chunks,
                    total_chunks,
                    next_chunk,
                }))
            }
            ChunkIngest::Complete { records } => Ok(Assembly::Assembled { records }),
        }
    }
}

/// Two-decimal chunk progress; sessions always have at least one chunk.
fn chunk_percent(received: u32, total: u32) -> f64 {
    if total == 0 {
        return 0.0;
    }
    let pct = received as f64 / total as f64 * 100.0;
    (pct * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use hopper_protocol::types::SessionId;
    use hopper_test_utils::record;
    use serde_json::json;

    fn submission(
        session_id: &SessionId,
        chunk_number: u32,
        total_chunks: u32,
        names: &[&str],
    ) -> ChunkSubmission {
        ChunkSubmission {
            session_id: session_id.clone(),
            chunk_number,
            total_chunks,
            chunk_data: names.iter().map(|n| record(&[("name", json!(n))])).collect(),
            job_type: hopper_protocol::types::JobType::Create,
            credit_model_config: None,
            aggregate_config: None,
        }
    }

    #[test]
    fn test_chunk_percent_rounds_to_two_decimals() {
        assert_eq!(chunk_percent(1, 3), 33.33);
        assert_eq!(chunk_percent(2, 3), 66.67);
        assert_eq!(chunk_percent(3, 3), 100.0);
        assert_eq!(chunk_percent(0, 0), 0.0);
    }

    #[tokio::test]
    async fn test_partial_then_assembled() {
        let state = StateStore::open_in_memory().await.unwrap();
        let assembler = ChunkAssembler::new(state.clone(), EngineConfig::default());
        let session_id = SessionId::generate();

        let ack = assembler.receive(&submission(&session_id, 2, 2, &["b"])).await.unwrap();
        match ack {
            Assembly::Partial(ChunkAck::Partial {
                progress_percent,
                received_chunks,
                total_chunks,
                next_chunk,
            }) => {
                assert_eq!(progress_percent, 50.0);
                assert_eq!(received_chunks, 1);
                assert_eq!(total_chunks, 2);
                assert_eq!(next_chunk, Some(1));
            }
            _ => panic!("expected a partial acknowledgement"),
        }

        let ack = assembler.receive(&submission(&session_id, 1, 2, &["a"])).await.unwrap();
        match ack {
            Assembly::Assembled { records } => {
                let names: Vec<&str> =
                    records.iter().filter_map(|r| r["name"].as_str()).collect();
                assert_eq!(names, vec!["a", "b"], "payload is in chunk order");
            }
            _ => panic!("expected the assembled payload"),
        }
    }
}
