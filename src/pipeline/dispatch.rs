use crate::backends::SpeechBackend;
use crate::segmenter::{PlaybackPlan, Segment};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SynthesisOutcome {
    Succeeded(Vec<u8>),
    /// Retries exhausted; the segment carries no audio.
    Failed(String),
}

#[derive(Debug)]
pub struct SynthesisResult {
    pub sequence_index: usize,
    pub outcome: SynthesisOutcome,
    pub completion_time: Instant,
    pub attempts: u32,
}

/// A finished segment together with the look-ahead slot it occupies.
/// The slot returns to the window when the delivery is dropped, which the
/// sequencer does only after the segment has been played or skipped.
#[derive(Debug)]
pub struct Delivery {
    pub result: SynthesisResult,
    pub slot: OwnedSemaphorePermit,
}

/// Fans segments out to the speech engine, at most `window` ahead of playback.
pub struct Dispatcher {
    backend: Arc<dyn SpeechBackend>,
    window: usize,
    retries: u32,
    retry_backoff: Duration,
}

impl Dispatcher {
    pub fn new(backend: Arc<dyn SpeechBackend>, window: usize, retries: u32) -> Self {
        Self {
            backend,
            window: window.max(1),
            retries,
            retry_backoff: Duration::from_millis(200),
        }
    }

    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    pub fn window(&self) -> usize {
        self.window
    }

    /// Starts synthesis in ascending index order and returns the stream of
    /// deliveries in completion order.
    ///
    /// Dispatch stops once `cancel` fires or the receiver is dropped.
    pub fn dispatch(
        &self,
        plan: &PlaybackPlan,
        speaker_id: u32,
        cancel: CancellationToken,
    ) -> mpsc::Receiver<Delivery> {
        let (tx, rx) = mpsc::channel::<Delivery>(self.window);
        let window = Arc::new(Semaphore::new(self.window));
        let segments: Vec<Segment> = plan.segments().to_vec();
        let backend = Arc::clone(&self.backend);
        let retries = self.retries;
        let backoff = self.retry_backoff;

        tokio::spawn(async move {
            for segment in segments {
                let slot = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = tx.closed() => break,
                    slot = Arc::clone(&window).acquire_owned() => match slot {
                        Ok(slot) => slot,
                        Err(_) => break,
                    },
                };

                let backend = Arc::clone(&backend);
                let tx = tx.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    let result =
                        synthesize_with_retry(backend.as_ref(), segment, speaker_id, retries, backoff, &cancel)
                            .await;
                    // The sequencer may already be gone (device failure or cancellation).
                    let _ = tx.send(Delivery { result, slot }).await;
                });
            }
            // Remaining senders live in the spawned synthesis tasks.
        });

        rx
    }
}

async fn synthesize_with_retry(
    backend: &dyn SpeechBackend,
    segment: Segment,
    speaker_id: u32,
    retries: u32,
    backoff: Duration,
    cancel: &CancellationToken,
) -> SynthesisResult {
    let index = segment.sequence_index;
    let mut attempts = 0;
    let mut last_error = String::new();

    for attempt in 0..=retries {
        if attempt > 0 {
            if cancel.is_cancelled() {
                break;
            }
            tokio::time::sleep(backoff * attempt).await;
        }
        attempts += 1;
        debug!(index, attempt = attempts, "synthesis started");
        match backend.synthesize(&segment.text, speaker_id).await {
            Ok(audio) => {
                debug!(index, bytes = audio.len(), "synthesis completed");
                return SynthesisResult {
                    sequence_index: index,
                    outcome: SynthesisOutcome::Succeeded(audio),
                    completion_time: Instant::now(),
                    attempts,
                };
            }
            Err(e) => {
                warn!(index, attempt = attempts, error = %e, "synthesis failed");
                last_error = e.to_string();
            }
        }
    }

    SynthesisResult {
        sequence_index: index,
        outcome: SynthesisOutcome::Failed(last_error),
        completion_time: Instant::now(),
        attempts,
    }
}
