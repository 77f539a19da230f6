use super::dead_letter::{DeadLetter, DeadLetterSink};
use super::error_handler::ExponentialBackoff;
use super::feed::ChangeFeed;
use super::normalizer::Normalizer;
use crate::error::{RelayError, RelayResult};
use crate::types::ChangeEvent;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CaptureStats {
    pub captured: u64,
    pub skipped: u64,
    pub dead_lettered: u64,
    pub reconnects: u64,
    /// Last acknowledged upstream position at exit
    pub resume_token: Option<u64>,
}

/// Pull notifications from `feed` and hand normalized events to the relay.
///
/// Positions are acknowledged only after the event sits in the relay queue,
/// so a crash replays from the last event the relay actually accepted.
/// Returns when the feed closes or `shutdown` flips to true; dropping `tx`
/// on return lets the relay drain and finish.
pub async fn run_capture(
    feed: &mut dyn ChangeFeed,
    normalizer: &Normalizer,
    tx: mpsc::Sender<ChangeEvent>,
    dead_letters: Arc<dyn DeadLetterSink>,
    mut backoff: ExponentialBackoff,
    mut shutdown: watch::Receiver<bool>,
) -> RelayResult<CaptureStats> {
    let mut stats = CaptureStats::default();

    log::info!(
        "🔌 Capture started on {} feed (offsets: {})",
        feed.name(),
        feed.supports_offsets()
    );

    loop {
        if *shutdown.borrow() {
            break;
        }

        let next = tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
            next = feed.next() => next,
        };

        match next {
            Ok(Some(item)) => {
                backoff.reset();
                match normalizer.normalize(&item.body) {
                    Ok(Some(event)) => {
                        if tx.send(event).await.is_err() {
                            return Err(RelayError::TransientIo(
                                "relay queue closed while capturing".to_string(),
                            ));
                        }
                        stats.captured += 1;
                    }
                    Ok(None) => stats.skipped += 1,
                    Err(RelayError::MalformedEvent(reason)) => {
                        log::warn!("⚠️  Malformed notification: {}", reason);
                        stats.dead_lettered += 1;
                        if let Err(e) = dead_letters.record(DeadLetter::new(item.body, reason)).await {
                            log::error!("❌ Failed to record dead letter: {}", e);
                        }
                    }
                    Err(e) => return Err(e),
                }

                if let Some(position) = item.position {
                    feed.ack(position);
                }
            }
            Ok(None) => {
                log::info!("📭 {} feed closed", feed.name());
                break;
            }
            Err(e) if e.is_transient() => {
                log::warn!("⚠️  Feed error: {} (reconnecting)", e);
                backoff.sleep().await?;
                stats.reconnects += 1;
                if let Err(e) = feed.reconnect().await {
                    log::error!("❌ Reconnect failed: {}", e);
                }
            }
            Err(e) => return Err(e),
        }
    }

    if let Err(e) = dead_letters.flush().await {
        log::warn!("⚠️  Dead-letter flush failed: {}", e);
    }

    stats.resume_token = feed.acknowledged();
    log::info!(
        "🔌 Capture stopped: {} captured, {} skipped, {} dead-lettered, {} reconnects (resume token: {:?})",
        stats.captured,
        stats.skipped,
        stats.dead_lettered,
        stats.reconnects,
        stats.resume_token
    );

    Ok(stats)
}
