//! Streaming playback of a segmented reply.
//!
//! The dispatcher keeps up to `window` segments in flight or buffered ahead
//! of the oldest unplayed one; the sequencer plays them back strictly in
//! order. A window slot is released only when its segment has been played
//! or skipped.

pub mod dispatch;
pub mod sequence;

pub use dispatch::{Delivery, Dispatcher, SynthesisOutcome, SynthesisResult};
pub use sequence::{play_in_order, PlaybackReport};

use crate::backends::SpeechBackend;
use crate::engine::AudioOutput;
use crate::segmenter::PlaybackPlan;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

pub struct Pipeline {
    dispatcher: Dispatcher,
    output: Arc<dyn AudioOutput>,
}

impl Pipeline {
    pub fn new(
        backend: Arc<dyn SpeechBackend>,
        output: Arc<dyn AudioOutput>,
        window: usize,
        retries: u32,
    ) -> Self {
        Self {
            dispatcher: Dispatcher::new(backend, window, retries),
            output,
        }
    }

    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.dispatcher = self.dispatcher.with_retry_backoff(backoff);
        self
    }

    pub fn output(&self) -> &Arc<dyn AudioOutput> {
        &self.output
    }

    /// Effective look-ahead; a configured 0 runs as 1.
    pub fn window(&self) -> usize {
        self.dispatcher.window()
    }

    /// Synthesizes and plays `plan`. Returns once every segment has been
    /// played or skipped, playback failed on every output, or `cancel` fired.
    pub async fn run(
        &self,
        plan: &PlaybackPlan,
        speaker_id: u32,
        cancel: &CancellationToken,
    ) -> PlaybackReport {
        if plan.is_empty() {
            return PlaybackReport::default();
        }
        let started = Instant::now();
        let deliveries = self.dispatcher.dispatch(plan, speaker_id, cancel.clone());
        let mut report = play_in_order(plan.len(), deliveries, self.output.as_ref(), cancel).await;
        report.tts_ms = started.elapsed().as_millis() as u64;
        report
    }
}
