use super::{Speaker, SpeechBackend};
use crate::error::SynthesisError;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use std::io::Cursor;
use std::time::Duration;
use tracing::debug;

/// VOICEVOX engine over HTTP: `/audio_query` followed by `/synthesis`.
pub struct VoicevoxBackend {
    base_url: String,
    client: Client,
    query_timeout: Duration,
    synthesis_timeout: Duration,
}

impl VoicevoxBackend {
    pub fn new(base_url: &str, query_timeout: Duration, synthesis_timeout: Duration) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: Client::new(),
            query_timeout,
            synthesis_timeout,
        }
    }

    pub fn from_settings(settings: &crate::config_loader::Settings) -> Self {
        Self::new(
            &settings.voicevox_url,
            Duration::from_secs(settings.audio_query_timeout_sec),
            Duration::from_secs(settings.synthesis_timeout_sec),
        )
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn check(endpoint: &'static str, resp: &reqwest::Response) -> Result<(), SynthesisError> {
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(SynthesisError::Status {
                endpoint,
                status: resp.status().as_u16(),
            })
        }
    }
}

/// The engine answers with a WAV file; anything else is treated as a failed call.
fn validate_wav(bytes: &[u8]) -> Result<(), SynthesisError> {
    let reader = hound::WavReader::new(Cursor::new(bytes))
        .map_err(|e| SynthesisError::InvalidAudio(e.to_string()))?;
    if reader.spec().channels == 0 || reader.spec().sample_rate == 0 {
        return Err(SynthesisError::InvalidAudio("empty format header".to_string()));
    }
    Ok(())
}

#[async_trait]
impl SpeechBackend for VoicevoxBackend {
    fn id(&self) -> &'static str {
        "voicevox"
    }

    async fn synthesize(&self, text: &str, speaker_id: u32) -> Result<Vec<u8>, SynthesisError> {
        let speaker = speaker_id.to_string();

        let resp = self
            .client
            .post(self.url("/audio_query"))
            .query(&[("text", text), ("speaker", speaker.as_str())])
            .timeout(self.query_timeout)
            .send()
            .await?;
        Self::check("/audio_query", &resp)?;
        let query: Value = resp.json().await?;

        let resp = self
            .client
            .post(self.url("/synthesis"))
            .query(&[("speaker", speaker.as_str())])
            .json(&query)
            .timeout(self.synthesis_timeout)
            .send()
            .await?;
        Self::check("/synthesis", &resp)?;
        let wav = resp.bytes().await?.to_vec();

        validate_wav(&wav)?;
        debug!(speaker_id, bytes = wav.len(), "synthesized segment");
        Ok(wav)
    }

    async fn list_speakers(&self) -> Result<Vec<Speaker>, SynthesisError> {
        let resp = self
            .client
            .get(self.url("/speakers"))
            .timeout(self.query_timeout)
            .send()
            .await?;
        Self::check("/speakers", &resp)?;
        Ok(resp.json::<Vec<Speaker>>().await?)
    }
}
