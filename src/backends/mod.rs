pub mod voicevox;

use crate::error::SynthesisError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::debug;

/// One voice style offered by a speaker.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SpeakerStyle {
    pub id: u32,
    pub name: String,
}

/// Represents a character voice exposed by the engine
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Speaker {
    pub name: String,
    #[serde(default)]
    pub styles: Vec<SpeakerStyle>,
}

/// Trait that all speech synthesis backends must implement.
/// Calls must be idempotent for a given `(text, speaker_id)` so they can be retried.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SpeechBackend: Send + Sync {
    /// Returns the unique ID of the backend (e.g., "voicevox")
    fn id(&self) -> &'static str;

    /// Returns WAV bytes for `text` spoken by `speaker_id`
    async fn synthesize(&self, text: &str, speaker_id: u32) -> Result<Vec<u8>, SynthesisError>;

    /// Returns the speakers known to the engine
    async fn list_speakers(&self) -> Result<Vec<Speaker>, SynthesisError>;
}

/// Speaker selector as given by a caller: a style id or a speaker name.
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize)]
#[serde(untagged)]
pub enum SpeakerRef {
    Id(u32),
    Name(String),
}

impl SpeakerRef {
    /// Digit-only names are treated as ids.
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        match raw.parse::<u32>() {
            Ok(id) => SpeakerRef::Id(id),
            Err(_) => SpeakerRef::Name(raw.to_string()),
        }
    }
}

/// Resolves speaker names to style ids, asking the engine once per name.
#[derive(Clone)]
pub struct SpeakerResolver {
    backend: Arc<dyn SpeechBackend>,
    default_name: String,
    cache: Arc<Mutex<HashMap<String, u32>>>,
}

impl SpeakerResolver {
    pub fn new(backend: Arc<dyn SpeechBackend>, default_name: impl Into<String>) -> Self {
        Self {
            backend,
            default_name: default_name.into(),
            cache: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn default_name(&self) -> &str {
        &self.default_name
    }

    /// `None` or a blank name selects the configured default speaker.
    pub async fn resolve(&self, speaker: Option<&SpeakerRef>) -> Result<u32, SynthesisError> {
        let name = match speaker {
            Some(SpeakerRef::Id(id)) => return Ok(*id),
            Some(SpeakerRef::Name(name)) if !name.trim().is_empty() => {
                match SpeakerRef::parse(name) {
                    SpeakerRef::Id(id) => return Ok(id),
                    SpeakerRef::Name(name) => name,
                }
            }
            _ => self.default_name.clone(),
        };

        if let Some(id) = self.cache.lock().ok().and_then(|c| c.get(&name).copied()) {
            return Ok(id);
        }

        let speakers = self.backend.list_speakers().await?;
        let id = speakers
            .iter()
            .find(|s| s.name == name)
            .and_then(|s| s.styles.first())
            .map(|style| style.id)
            .ok_or_else(|| SynthesisError::SpeakerNotFound(name.clone()))?;

        debug!(speaker = %name, id, "resolved speaker");
        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(name, id);
        }
        Ok(id)
    }
}
