use super::dispatch::{Delivery, SynthesisOutcome};
use crate::engine::AudioOutput;
use std::collections::BTreeMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// What happened to each segment of a plan.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PlaybackReport {
    pub played: Vec<usize>,
    pub skipped: Vec<usize>,
    pub cancelled: bool,
    /// Set when every output mechanism failed; playback stopped there.
    pub device_error: Option<String>,
    /// Wall time from first dispatch to the end of playback.
    pub tts_ms: u64,
}

impl PlaybackReport {
    pub fn played_any(&self) -> bool {
        !self.played.is_empty()
    }
}

/// Plays deliveries strictly in `sequence_index` order.
///
/// Early arrivals wait in a holding area keyed by index. Failed segments
/// are skipped. Cancellation is checked between segments, never during one.
pub async fn play_in_order(
    plan_len: usize,
    mut deliveries: mpsc::Receiver<Delivery>,
    output: &dyn AudioOutput,
    cancel: &CancellationToken,
) -> PlaybackReport {
    let mut report = PlaybackReport::default();
    let mut holding: BTreeMap<usize, Delivery> = BTreeMap::new();
    let mut next = 0;

    while next < plan_len {
        if cancel.is_cancelled() {
            report.cancelled = true;
            break;
        }

        let Some(delivery) = holding.remove(&next) else {
            let received = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    report.cancelled = true;
                    break;
                }
                received = deliveries.recv() => received,
            };
            match received {
                Some(delivery) => {
                    holding.insert(delivery.result.sequence_index, delivery);
                    continue;
                }
                None => {
                    // Dispatcher stopped early; only cancellation does that.
                    report.cancelled = cancel.is_cancelled();
                    warn!(next, plan_len, "synthesis stream ended before plan completed");
                    break;
                }
            }
        };

        match &delivery.result.outcome {
            SynthesisOutcome::Succeeded(audio) => match output.play(audio).await {
                Ok(()) => {
                    debug!(index = next, "segment played");
                    report.played.push(next);
                }
                Err(e) => {
                    error!(index = next, error = %e, "playback failed on every output");
                    report.device_error = Some(e.to_string());
                    break;
                }
            },
            SynthesisOutcome::Failed(reason) => {
                warn!(index = next, attempts = delivery.result.attempts, %reason, "skipping segment");
                report.skipped.push(next);
            }
        }

        // Frees the look-ahead slot for the next segment.
        drop(delivery);
        next += 1;
    }

    info!(
        played = report.played.len(),
        skipped = report.skipped.len(),
        cancelled = report.cancelled,
        "playback finished"
    );
    report
}
