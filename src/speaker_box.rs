use crate::backends::voicevox::VoicevoxBackend;
use crate::backends::{SpeakerRef, SpeakerResolver, SpeechBackend};
use crate::config_loader::Settings;
use crate::engine::{probe_players, AudioOutput, PlayerChain};
use crate::error::SpeakError;
use crate::lease::Coordinator;
use crate::pipeline::{Pipeline, PlaybackReport};
use crate::reply::{CommandReplyGenerator, Mode, ReplyGenerator, ReplySelector, ReplySource};
use crate::segmenter::{segment, PlaybackPlan};
use crate::telemetry::{RequestState, RequestTrace, Stopwatch, Telemetry, TelemetrySnapshot};
use crate::text::{char_len, clean};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

pub const SERVICE_NAME: &str = "vv-speaker";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SpeakRequest {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub mode: Mode,
    #[serde(default)]
    pub dry_run: bool,
    /// Overrides the configured default speaker.
    #[serde(default)]
    pub speaker: Option<SpeakerRef>,
}

impl SpeakRequest {
    pub fn new(text: impl Into<String>, mode: Mode) -> Self {
        Self {
            text: text.into(),
            mode,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Played,
    NotPlayed,
    Cancelled,
    Failed,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LatencyBreakdown {
    pub total_ms: u64,
    pub llm_ms: u64,
    pub tts_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SpeakResult {
    pub request_id: String,
    pub reply_text: String,
    pub played: bool,
    pub latency_ms: LatencyBreakdown,
    pub speaker_id: Option<u32>,
    pub reply_source: ReplySource,
    pub outcome: Outcome,
    pub segments: Vec<String>,
    pub skipped_segments: Vec<usize>,
    pub input_chars: usize,
    pub output_chars: usize,
    pub mode: Mode,
    pub dry_run: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ok,
    Degraded,
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineHealth {
    pub reachable: bool,
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speakers_count: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DefaultSpeaker {
    pub name: String,
    pub id: Option<u32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub voicevox: EngineHealth,
    pub default_speaker: DefaultSpeaker,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl HealthReport {
    pub fn is_ok(&self) -> bool {
        self.status == HealthStatus::Ok
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub service: &'static str,
    pub version: &'static str,
    pub voicevox_url: String,
    pub default_speaker: String,
    pub stream_playback: bool,
    pub lookahead_window: usize,
    pub pending_requests: usize,
    pub audio_output: String,
    pub telemetry: TelemetrySnapshot,
}

pub struct SpeakerBox {
    settings: Settings,
    backend: Arc<dyn SpeechBackend>,
    resolver: SpeakerResolver,
    replies: ReplySelector,
    coordinator: Coordinator,
    pipeline: Pipeline,
    telemetry: Telemetry,
}

impl SpeakerBox {
    pub fn new(
        settings: Settings,
        backend: Arc<dyn SpeechBackend>,
        generator: Arc<dyn ReplyGenerator>,
        output: Arc<dyn AudioOutput>,
        coordinator: Coordinator,
    ) -> Self {
        let resolver = SpeakerResolver::new(Arc::clone(&backend), settings.speaker_name.clone());
        let replies = ReplySelector::new(
            generator,
            settings.llm_timeout(),
            settings.reply_attempts,
            settings.min_chars,
            settings.max_chars,
        );
        let pipeline = Pipeline::new(
            Arc::clone(&backend),
            output,
            settings.lookahead_window,
            settings.synth_retries,
        );
        Self {
            settings,
            backend,
            resolver,
            replies,
            coordinator,
            pipeline,
            telemetry: Telemetry::new(),
        }
    }

    /// Wires up VOICEVOX, the reply command, the probed players and the lock file.
    pub fn from_settings(settings: Settings) -> Self {
        let backend: Arc<dyn SpeechBackend> = Arc::new(VoicevoxBackend::from_settings(&settings));
        let generator: Arc<dyn ReplyGenerator> =
            Arc::new(CommandReplyGenerator::new(&settings.llm_command));
        let output: Arc<dyn AudioOutput> = Arc::new(PlayerChain::new(probe_players(
            &settings.player_command,
            settings.playback_timeout(),
        )));
        let coordinator = Coordinator::from_settings(&settings);
        Self::new(settings, backend, generator, output, coordinator)
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn telemetry(&self) -> &Telemetry {
        &self.telemetry
    }

    /// Runs one request to completion.
    ///
    /// Returns `Err` only for rejections (`EmptyInput`, `Overloaded`),
    /// cancellation before the lease, or an unusable lock file. Everything
    /// after that is reported in the result.
    pub async fn process(
        &self,
        request: SpeakRequest,
        cancel: &CancellationToken,
    ) -> Result<SpeakResult, SpeakError> {
        let request_id = Uuid::new_v4().simple().to_string();
        let mut trace = RequestTrace::new(request_id.clone());
        let total = Stopwatch::start();

        // Same cleanup the reply step applies, so unspeakable input never queues.
        if clean(&request.text).is_empty() {
            return Err(self.reject(&mut trace, SpeakError::EmptyInput));
        }

        let lease = if request.dry_run {
            None
        } else {
            trace.advance(RequestState::Queued);
            match self.coordinator.acquire(cancel).await {
                Ok(lease) => {
                    trace.advance(RequestState::LeaseAcquired);
                    Some(lease)
                }
                Err(SpeakError::Overloaded) => {
                    return Err(self.reject(&mut trace, SpeakError::Overloaded));
                }
                Err(SpeakError::Cancelled) => {
                    trace.advance(RequestState::Cancelled);
                    info!(%request_id, "request cancelled while queued");
                    return Err(SpeakError::Cancelled);
                }
                Err(e) => {
                    trace.advance(RequestState::Failed);
                    return Err(e);
                }
            }
        };

        trace.advance(RequestState::Normalizing);
        let selection = match self.replies.select(request.mode, &request.text).await {
            Ok(selection) => selection,
            Err(e) => return Err(self.reject(&mut trace, e)),
        };

        trace.advance(RequestState::Segmenting);
        let plan = if self.settings.stream_playback {
            segment(&selection.text, self.settings.min_chars, self.settings.max_chars)
        } else {
            PlaybackPlan::single(&selection.text)
        };

        let mut result = SpeakResult {
            request_id: request_id.clone(),
            reply_text: selection.text.clone(),
            played: false,
            latency_ms: LatencyBreakdown {
                total_ms: 0,
                llm_ms: selection.llm_ms,
                tts_ms: 0,
            },
            speaker_id: None,
            reply_source: selection.source,
            outcome: Outcome::NotPlayed,
            segments: plan.texts(),
            skipped_segments: Vec::new(),
            input_chars: char_len(&request.text),
            output_chars: char_len(&selection.text),
            mode: request.mode,
            dry_run: request.dry_run,
            error: None,
        };

        if request.dry_run {
            // Dry runs never reach the engine, so only explicit ids are reported.
            result.speaker_id = match &request.speaker {
                Some(SpeakerRef::Id(id)) => Some(*id),
                Some(SpeakerRef::Name(name)) => match SpeakerRef::parse(name) {
                    SpeakerRef::Id(id) => Some(id),
                    SpeakerRef::Name(_) => None,
                },
                None => None,
            };
            trace.advance(RequestState::Completed);
        } else {
            match self.resolver.resolve(request.speaker.as_ref()).await {
                Ok(speaker_id) => {
                    result.speaker_id = Some(speaker_id);
                    trace.advance(RequestState::Synthesizing);
                    let report = self.pipeline.run(&plan, speaker_id, cancel).await;
                    apply_report(&mut result, &report);
                }
                Err(e) => {
                    warn!(%request_id, error = %e, "speaker resolution failed");
                    result.outcome = Outcome::Failed;
                    result.error = Some(e.to_string());
                }
            }
            trace.advance(match result.outcome {
                Outcome::Cancelled => RequestState::Cancelled,
                Outcome::Failed => RequestState::Failed,
                Outcome::Played | Outcome::NotPlayed => RequestState::Completed,
            });
        }

        drop(lease);
        result.latency_ms.total_ms = total.elapsed_ms();
        self.telemetry.record(&result);
        Ok(result)
    }

    fn reject(&self, trace: &mut RequestTrace, error: SpeakError) -> SpeakError {
        trace.advance(RequestState::Rejected);
        self.telemetry.record_rejection(&error.to_string());
        error
    }

    /// Probes the engine and resolves the default speaker.
    pub async fn health(&self) -> HealthReport {
        let url = self.settings.voicevox_url.clone();
        let name = self.settings.speaker_name.clone();

        let probe = async {
            let speakers = self.backend.list_speakers().await?;
            let id = self.resolver.resolve(None).await?;
            Ok::<_, crate::error::SynthesisError>((speakers.len(), id))
        };

        match probe.await {
            Ok((count, id)) => HealthReport {
                status: HealthStatus::Ok,
                voicevox: EngineHealth {
                    reachable: true,
                    url,
                    speakers_count: Some(count),
                },
                default_speaker: DefaultSpeaker { name, id: Some(id) },
                error: None,
            },
            Err(e) => HealthReport {
                status: HealthStatus::Degraded,
                voicevox: EngineHealth {
                    reachable: false,
                    url,
                    speakers_count: None,
                },
                default_speaker: DefaultSpeaker { name, id: None },
                error: Some(e.to_string()),
            },
        }
    }

    pub fn status(&self) -> StatusReport {
        StatusReport {
            service: SERVICE_NAME,
            version: env!("CARGO_PKG_VERSION"),
            voicevox_url: self.settings.voicevox_url.clone(),
            default_speaker: self.resolver.default_name().to_string(),
            stream_playback: self.settings.stream_playback,
            lookahead_window: self.pipeline.window(),
            pending_requests: self.coordinator.pending(),
            audio_output: self.pipeline.output().id(),
            telemetry: self.telemetry.snapshot(),
        }
    }
}

fn apply_report(result: &mut SpeakResult, report: &PlaybackReport) {
    result.played = report.played_any();
    result.skipped_segments = report.skipped.clone();
    result.latency_ms.tts_ms = report.tts_ms;

    if report.cancelled {
        result.outcome = Outcome::Cancelled;
    } else if let Some(error) = &report.device_error {
        result.played = false;
        result.outcome = Outcome::Failed;
        result.error = Some(error.clone());
    } else if report.played_any() {
        result.outcome = Outcome::Played;
    } else if !report.skipped.is_empty() {
        result.outcome = Outcome::Failed;
        result.error = Some("synthesis failed for every segment".to_string());
    }
}
