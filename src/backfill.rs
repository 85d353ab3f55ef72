//! Assigns embeddings to stored messages that lack one.
//!
//! The loop pulls a bounded batch of pending messages, embeds each one on its
//! own, commits the successes, and repeats until a fetch comes back empty.
//! Failed messages are remembered for the rest of the run so they are not
//! fetched again, which guarantees the loop ends.

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::embedder::{EmbeddingGateway, EmbeddingProvider};
use crate::store::{ConversationStore, EmbeddingUpdate, StoreError};
use crate::vector::l2_normalize;

/// Backfill knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackfillOptions {
    /// Messages fetched and committed per round.
    pub batch_size: usize,
    /// Clear every existing embedding first.
    pub force: bool,
}

impl Default for BackfillOptions {
    fn default() -> Self {
        Self {
            batch_size: 50,
            force: false,
        }
    }
}

/// A message that could not be embedded.
#[derive(Debug, Clone, PartialEq)]
pub struct FailedMessage {
    /// Message id.
    pub message_id: Uuid,
    /// What went wrong.
    pub reason: String,
}

/// Outcome of one fetch/embed/commit round.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchOutcome {
    /// 1-based round number.
    pub batch: usize,
    /// Messages fetched this round.
    pub fetched: usize,
    /// Embeddings committed this round.
    pub embedded: usize,
    /// Messages that failed this round.
    pub failed: usize,
}

/// Totals for a run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BackfillReport {
    /// Embeddings cleared because of `force`.
    pub cleared: u64,
    /// Rounds that fetched at least one message.
    pub batches: usize,
    /// Embeddings committed.
    pub embedded: usize,
    /// Messages that failed.
    pub failed: Vec<FailedMessage>,
}

/// Runs the backfill loop. Store errors abort the run; batches committed
/// before the error stay committed.
pub async fn run_backfill<S, P, F>(
    store: &mut S,
    gateway: &EmbeddingGateway<P>,
    options: BackfillOptions,
    mut on_batch: F,
) -> Result<BackfillReport, StoreError>
where
    S: ConversationStore,
    P: EmbeddingProvider,
    F: FnMut(&BatchOutcome),
{
    let batch_size = options.batch_size.max(1);
    let mut report = BackfillReport::default();
    if options.force {
        report.cleared = store.clear_embeddings().await?;
        info!(cleared = report.cleared, "cleared existing embeddings");
    }

    let mut failed_ids: Vec<Uuid> = Vec::new();
    loop {
        let pending = store.pending_embeddings(batch_size, &failed_ids).await?;
        if pending.is_empty() {
            break;
        }
        report.batches += 1;

        let mut updates = Vec::with_capacity(pending.len());
        let mut failed_this_batch = 0usize;
        for message in &pending {
            match gateway.create_embedding(&message.content).await {
                Ok(mut embedding) => {
                    if !l2_normalize(&mut embedding) {
                        warn!(message_id = %message.id, "provider returned a zero vector");
                        failed_ids.push(message.id);
                        report.failed.push(FailedMessage {
                            message_id: message.id,
                            reason: "provider returned a zero vector".to_string(),
                        });
                        failed_this_batch += 1;
                        continue;
                    }
                    debug!(message_id = %message.id, "embedded message");
                    updates.push(EmbeddingUpdate {
                        message_id: message.id,
                        embedding,
                        model: gateway.model().to_string(),
                    });
                }
                Err(err) => {
                    warn!(message_id = %message.id, %err, "failed to embed message");
                    failed_ids.push(message.id);
                    report.failed.push(FailedMessage {
                        message_id: message.id,
                        reason: err.to_string(),
                    });
                    failed_this_batch += 1;
                }
            }
        }

        let embedded = store.update_embeddings(&updates).await?;
        report.embedded += embedded;
        let outcome = BatchOutcome {
            batch: report.batches,
            fetched: pending.len(),
            embedded,
            failed: failed_this_batch,
        };
        info!(
            batch = outcome.batch,
            fetched = outcome.fetched,
            embedded = outcome.embedded,
            failed = outcome.failed,
            "committed embedding batch"
        );
        on_batch(&outcome);
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedder::testing::ScriptedProvider;
    use crate::store::{MemoryStore, NewConversation, NewMessage, EXPORT_SOURCE};
    use crate::vector::l2_norm;
    use pretty_assertions::assert_eq;

    async fn seeded_store(contents: &[&str]) -> (MemoryStore, Uuid) {
        let mut store = MemoryStore::new();
        let messages: Vec<_> = contents
            .iter()
            .enumerate()
            .map(|(position, content)| NewMessage {
                original_id: format!("m{position}"),
                role: "user".to_string(),
                author_name: None,
                model: None,
                content: content.to_string(),
                position: position as i32,
                create_time: position as f64,
            })
            .collect();
        let id = store
            .save_conversation(
                &NewConversation {
                    original_id: "c1".to_string(),
                    title: "seeded".to_string(),
                    create_time: 0.0,
                    update_time: 0.0,
                    source: EXPORT_SOURCE.to_string(),
                },
                &messages,
            )
            .await
            .expect("save");
        (store, id)
    }

    #[tokio::test(flavor = "current_thread")]
    async fn embeds_everything_in_bounded_batches() {
        let (mut store, id) = seeded_store(&["a", "b", "c", "d", "e"]).await;
        let gateway = EmbeddingGateway::new(ScriptedProvider::default().fallback(vec![3.0, 4.0, 9.0]), 2, "");
        let mut rounds = Vec::new();

        let report = run_backfill(
            &mut store,
            &gateway,
            BackfillOptions {
                batch_size: 2,
                force: false,
            },
            |outcome| rounds.push(outcome.fetched),
        )
        .await
        .expect("backfill");

        assert_eq!(rounds, vec![2, 2, 1]);
        assert_eq!(report.embedded, 5);
        assert!(report.failed.is_empty());
        for message in store.embedded_messages(id).await.expect("messages") {
            let embedding = message.embedding.expect("embedding");
            assert_eq!(embedding.len(), 2);
            assert!((l2_norm(&embedding) - 1.0).abs() < 1e-6);
            assert_eq!(message.embedding_model.as_deref(), Some("scripted"));
        }
    }

    #[tokio::test(flavor = "current_thread")]
    async fn failures_are_recorded_and_not_retried() {
        let (mut store, _) = seeded_store(&["good", "bad", "also good"]).await;
        let provider = ScriptedProvider::default()
            .with("good", vec![1.0, 0.0])
            .with("also good", vec![0.0, 1.0]);
        let gateway = EmbeddingGateway::new(provider, 2, "");

        let report = run_backfill(&mut store, &gateway, BackfillOptions::default(), |_| {})
            .await
            .expect("backfill");

        assert_eq!(report.embedded, 2);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.batches, 1);
        assert_eq!(gateway_prompt_count(&gateway), 3);
        assert_eq!(store.embedding_stats().await.expect("stats").pending, 1);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn force_clears_then_reembeds() {
        let (mut store, _) = seeded_store(&["one", "two"]).await;
        let gateway = EmbeddingGateway::new(ScriptedProvider::default().fallback(vec![1.0, 1.0]), 2, "");
        run_backfill(&mut store, &gateway, BackfillOptions::default(), |_| {})
            .await
            .expect("first run");

        let untouched = run_backfill(&mut store, &gateway, BackfillOptions::default(), |_| {})
            .await
            .expect("second run");
        assert_eq!(untouched.batches, 0);

        let forced = run_backfill(
            &mut store,
            &gateway,
            BackfillOptions {
                batch_size: 10,
                force: true,
            },
            |_| {},
        )
        .await
        .expect("forced run");
        assert_eq!(forced.cleared, 2);
        assert_eq!(forced.embedded, 2);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn zero_vectors_count_as_failures() {
        let (mut store, _) = seeded_store(&["nothing"]).await;
        let gateway = EmbeddingGateway::new(ScriptedProvider::default().fallback(vec![0.0, 0.0]), 2, "");
        let report = run_backfill(&mut store, &gateway, BackfillOptions::default(), |_| {})
            .await
            .expect("backfill");
        assert_eq!(report.embedded, 0);
        assert_eq!(report.failed[0].reason, "provider returned a zero vector");
    }

    fn gateway_prompt_count(gateway: &EmbeddingGateway<ScriptedProvider>) -> usize {
        gateway.provider().prompts.borrow().len()
    }
}
