use config::{Config, File};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Unprefixed names from older `.env` files. `VVBOX_*` wins when both are set.
pub const LEGACY_ENV_KEYS: [&str; 11] = [
    "VOICEVOX_URL",
    "SPEAKER_NAME",
    "LLM_COMMAND",
    "LLM_TIMEOUT_SEC",
    "MIN_CHARS",
    "MAX_CHARS",
    "QUEUE_MAX",
    "LOCK_PATH",
    "PLAYER_COMMAND",
    "STREAM_PLAYBACK",
    "LOG_LEVEL",
];

fn legacy_env() -> config::Map<String, String> {
    LEGACY_ENV_KEYS
        .iter()
        .filter_map(|key| std::env::var(key).ok().map(|value| (key.to_string(), value)))
        .collect()
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    // Speech engine
    pub voicevox_url: String,
    pub speaker_name: String,
    pub audio_query_timeout_sec: u64,
    pub synthesis_timeout_sec: u64,
    // Reply generation
    pub llm_command: String,
    pub llm_timeout_sec: u64,
    pub reply_attempts: u32,
    // Text shaping
    pub min_chars: usize,
    pub max_chars: usize,
    // Single-flight coordination
    pub queue_max: usize,
    pub lock_path: PathBuf,
    pub lease_stale_sec: u64,
    pub lease_poll_ms: u64,
    // Playback
    pub player_command: String,
    pub playback_timeout_sec: u64,
    pub stream_playback: bool,
    pub lookahead_window: usize,
    pub synth_retries: u32,
    // Logging
    pub log_level: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            voicevox_url: "http://127.0.0.1:50021".to_string(),
            speaker_name: "冥鳴ひまり".to_string(),
            audio_query_timeout_sec: 15,
            synthesis_timeout_sec: 20,
            llm_command: "gemini -p".to_string(),
            llm_timeout_sec: 15,
            reply_attempts: 2,
            min_chars: 80,
            max_chars: 160,
            queue_max: 10,
            lock_path: PathBuf::from("/tmp/vv-speaker.lock"),
            lease_stale_sec: 30,
            lease_poll_ms: 100,
            player_command: String::new(),
            playback_timeout_sec: 120,
            stream_playback: true,
            lookahead_window: 2,
            synth_retries: 2,
            log_level: "info".to_string(),
        }
    }
}

impl Settings {
    pub fn new() -> Result<Self, config::ConfigError> {
        // A .env file only fills variables that are not already set.
        let _ = dotenvy::dotenv();

        let defaults = Settings::default();
        let builder = Config::builder()
            // Engine defaults
            .set_default("voicevox_url", defaults.voicevox_url)?
            .set_default("speaker_name", defaults.speaker_name)?
            .set_default("audio_query_timeout_sec", defaults.audio_query_timeout_sec)?
            .set_default("synthesis_timeout_sec", defaults.synthesis_timeout_sec)?
            // Reply defaults
            .set_default("llm_command", defaults.llm_command)?
            .set_default("llm_timeout_sec", defaults.llm_timeout_sec)?
            .set_default("reply_attempts", defaults.reply_attempts as u64)?
            // Text shaping defaults
            .set_default("min_chars", defaults.min_chars as u64)?
            .set_default("max_chars", defaults.max_chars as u64)?
            // Coordination defaults
            .set_default("queue_max", defaults.queue_max as u64)?
            .set_default("lock_path", defaults.lock_path.to_string_lossy().to_string())?
            .set_default("lease_stale_sec", defaults.lease_stale_sec)?
            .set_default("lease_poll_ms", defaults.lease_poll_ms)?
            // Playback defaults
            .set_default("player_command", defaults.player_command)?
            .set_default("playback_timeout_sec", defaults.playback_timeout_sec)?
            .set_default("stream_playback", defaults.stream_playback)?
            .set_default("lookahead_window", defaults.lookahead_window as u64)?
            .set_default("synth_retries", defaults.synth_retries as u64)?
            .set_default("log_level", defaults.log_level)?
            // Merge with local config file (if exists)
            .add_source(File::with_name("VvSpeaker").required(false))
            .add_source(
                File::with_name(
                    &dirs::config_dir()
                        .unwrap_or_else(|| PathBuf::from("."))
                        .join("vv-speaker/VvSpeaker")
                        .to_string_lossy(),
                )
                .required(false),
            )
            // Legacy unprefixed variables (e.g. MIN_CHARS)
            .add_source(
                config::Environment::default()
                    .source(Some(legacy_env()))
                    .try_parsing(true),
            )
            // Merge with environment variables (e.g. VVBOX_MIN_CHARS)
            .add_source(config::Environment::with_prefix("VVBOX").try_parsing(true));

        let settings: Settings = builder.build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), config::ConfigError> {
        if self.voicevox_url.trim().is_empty() {
            return Err(config::ConfigError::Message(
                "voicevox_url must not be empty".to_string(),
            ));
        }
        if self.min_chars == 0 || self.min_chars > self.max_chars {
            return Err(config::ConfigError::Message(format!(
                "Invalid character bounds: min_chars={} max_chars={}. Need 0 < min <= max",
                self.min_chars, self.max_chars
            )));
        }
        if self.lookahead_window == 0 {
            return Err(config::ConfigError::Message(
                "lookahead_window must be greater than 0".to_string(),
            ));
        }
        if self.reply_attempts == 0 {
            return Err(config::ConfigError::Message(
                "reply_attempts must be greater than 0".to_string(),
            ));
        }
        if self.llm_command.split_whitespace().next().is_none() {
            return Err(config::ConfigError::Message(
                "llm_command must name a program".to_string(),
            ));
        }
        if self.lease_stale_sec == 0 {
            return Err(config::ConfigError::Message(
                "lease_stale_sec must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn llm_timeout(&self) -> Duration {
        Duration::from_secs(self.llm_timeout_sec)
    }

    pub fn playback_timeout(&self) -> Duration {
        Duration::from_secs(self.playback_timeout_sec)
    }

    pub fn lease_stale_after(&self) -> Duration {
        Duration::from_secs(self.lease_stale_sec)
    }

    pub fn lease_poll_interval(&self) -> Duration {
        Duration::from_millis(self.lease_poll_ms.max(1))
    }
}
