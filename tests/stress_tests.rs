use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use vv_speaker::backends::{Speaker, SpeechBackend};
use vv_speaker::config_loader::Settings;
use vv_speaker::engine::AudioOutput;
use vv_speaker::error::{PlaybackError, SpeakError, SynthesisError};
use vv_speaker::lease::Coordinator;
use vv_speaker::reply::{Mode, ReplyGenerator};
use vv_speaker::{SpeakRequest, SpeakerBox};

/// Tracks how many synthesis calls overlap across all requests.
#[derive(Default)]
struct CountingEngine {
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    calls: AtomicUsize,
}

#[async_trait]
impl SpeechBackend for CountingEngine {
    fn id(&self) -> &'static str {
        "counting"
    }

    async fn synthesize(&self, text: &str, _speaker_id: u32) -> Result<Vec<u8>, SynthesisError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(3)).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(text.as_bytes().to_vec())
    }

    async fn list_speakers(&self) -> Result<Vec<Speaker>, SynthesisError> {
        Ok(Vec::new())
    }
}

/// Plays only while the gate has permits; tracks overlapping device writes.
struct GatedDevice {
    gate: Arc<Semaphore>,
    playing: AtomicUsize,
    peak: AtomicUsize,
    plays: AtomicUsize,
}

#[async_trait]
impl AudioOutput for GatedDevice {
    fn id(&self) -> String {
        "gated-device".to_string()
    }

    async fn play(&self, _wav: &[u8]) -> Result<(), PlaybackError> {
        let _permit = self
            .gate
            .acquire()
            .await
            .map_err(|e| PlaybackError::Device(e.to_string()))?;
        let now = self.playing.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(2)).await;
        self.playing.fetch_sub(1, Ordering::SeqCst);
        self.plays.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct NoReplies;

#[async_trait]
impl ReplyGenerator for NoReplies {
    async fn generate(
        &self,
        _prompt: &str,
        _timeout: Duration,
    ) -> Result<String, vv_speaker::error::ReplyError> {
        Err(vv_speaker::error::ReplyError::Empty)
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn burst_is_admitted_up_to_queue_bound_and_played_one_at_a_time() {
    const BURST: usize = 40;
    const QUEUE_MAX: usize = 5;

    let settings = Settings {
        min_chars: 4,
        max_chars: 8,
        queue_max: QUEUE_MAX,
        lookahead_window: 3,
        ..Settings::default()
    };
    let engine = Arc::new(CountingEngine::default());
    let device = Arc::new(GatedDevice {
        gate: Arc::new(Semaphore::new(0)),
        playing: AtomicUsize::new(0),
        peak: AtomicUsize::new(0),
        plays: AtomicUsize::new(0),
    });
    let speaker_box = Arc::new(SpeakerBox::new(
        settings,
        engine.clone(),
        Arc::new(NoReplies),
        device.clone(),
        Coordinator::new(QUEUE_MAX, None),
    ));

    let mut handles = Vec::new();
    for i in 0..BURST {
        let speaker_box = speaker_box.clone();
        handles.push(tokio::spawn(async move {
            let request = SpeakRequest {
                speaker: Some(vv_speaker::backends::SpeakerRef::Id(1)),
                ..SpeakRequest::new(format!("第{i}番。続きの文。最後の文。"), Mode::Direct)
            };
            speaker_box.process(request, &CancellationToken::new()).await
        }));
    }

    // The holder blocks on the closed gate, so everything beyond the bound is rejected.
    for _ in 0..400 {
        if speaker_box.telemetry().snapshot().rejected == (BURST - QUEUE_MAX - 1) as u64 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(speaker_box.status().pending_requests, QUEUE_MAX + 1);
    device.gate.add_permits(1_000);

    let mut played = 0;
    let mut overloaded = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(result) => {
                assert!(result.played);
                assert!(result.skipped_segments.is_empty());
                played += 1;
            }
            Err(SpeakError::Overloaded) => overloaded += 1,
            Err(other) => panic!("unexpected error: {other}"),
        }
    }

    println!(
        "played {} requests, rejected {}, {} synthesis calls",
        played,
        overloaded,
        engine.calls.load(Ordering::SeqCst)
    );
    assert_eq!(played, QUEUE_MAX + 1);
    assert_eq!(overloaded, BURST - QUEUE_MAX - 1);
    assert_eq!(device.peak.load(Ordering::SeqCst), 1);
    assert!(engine.peak.load(Ordering::SeqCst) <= 3);
    assert_eq!(device.plays.load(Ordering::SeqCst), played * 3);
    assert_eq!(speaker_box.status().pending_requests, 0);
}
