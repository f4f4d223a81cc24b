use crate::error::PlaybackError;
use crate::fallback::first_success;
use async_trait::async_trait;
use rodio::{Decoder, OutputStream, Sink};
use std::io::{Cursor, Write};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use wait_timeout::ChildExt;

/// Player commands probed when none is configured, highest priority first.
pub const PLAYER_PRIORITY: [(&str, &[&str]); 3] =
    [("pw-play", &[]), ("paplay", &[]), ("aplay", &["-q"])];

/// Something that can play a complete WAV buffer and block until it is done.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AudioOutput: Send + Sync {
    fn id(&self) -> String;

    async fn play(&self, wav: &[u8]) -> Result<(), PlaybackError>;
}

/// Plays through an external program that takes a WAV file path.
pub struct CommandPlayer {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandPlayer {
    pub fn new(program: impl Into<String>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args,
            timeout,
        }
    }

    /// Splits a command line such as `aplay -q` on whitespace.
    pub fn from_command_line(line: &str, timeout: Duration) -> Option<Self> {
        let mut parts = line.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(Self::new(program, parts.collect(), timeout))
    }

    pub fn program(&self) -> &str {
        &self.program
    }
}

#[async_trait]
impl AudioOutput for CommandPlayer {
    fn id(&self) -> String {
        if self.args.is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, self.args.join(" "))
        }
    }

    async fn play(&self, wav: &[u8]) -> Result<(), PlaybackError> {
        let player = self.id();
        let spawn_err = |source| PlaybackError::Spawn {
            player: player.clone(),
            source,
        };

        // Removed when dropped, so nothing outlives the call.
        let mut file = tempfile::Builder::new()
            .prefix("vv-speaker-")
            .suffix(".wav")
            .tempfile()
            .map_err(spawn_err)?;
        file.write_all(wav).map_err(spawn_err)?;
        file.flush().map_err(spawn_err)?;

        let program = self.program.clone();
        let args = self.args.clone();
        let timeout = self.timeout;
        let path = file.path().to_path_buf();
        let player_name = player.clone();

        let outcome = tokio::task::spawn_blocking(move || -> Result<(), PlaybackError> {
            let mut child = Command::new(&program)
                .args(&args)
                .arg(&path)
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .spawn()
                .map_err(|source| PlaybackError::Spawn {
                    player: player_name.clone(),
                    source,
                })?;

            match child.wait_timeout(timeout) {
                Ok(Some(status)) if status.success() => Ok(()),
                Ok(Some(status)) => Err(PlaybackError::ExitStatus {
                    player: player_name,
                    status: status.to_string(),
                }),
                Ok(None) => {
                    // Timeout occurred, kill the process
                    let _ = child.kill();
                    let _ = child.wait();
                    Err(PlaybackError::Timeout {
                        player: player_name,
                        secs: timeout.as_secs(),
                    })
                }
                Err(source) => Err(PlaybackError::Spawn {
                    player: player_name,
                    source,
                }),
            }
        })
        .await
        .map_err(|e| PlaybackError::Device(format!("player task failed: {}", e)))?;

        drop(file);
        outcome
    }
}

/// Plays on the default output device in-process.
pub struct RodioPlayer;

impl RodioPlayer {
    pub fn new() -> Self {
        Self
    }
}

impl Default for RodioPlayer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AudioOutput for RodioPlayer {
    fn id(&self) -> String {
        "rodio".to_string()
    }

    async fn play(&self, wav: &[u8]) -> Result<(), PlaybackError> {
        let cursor = Cursor::new(wav.to_vec());
        tokio::task::spawn_blocking(move || -> Result<(), PlaybackError> {
            // The output stream must live on the thread that plays.
            let (_stream, stream_handle) =
                OutputStream::try_default().map_err(|e| PlaybackError::Device(e.to_string()))?;
            let sink =
                Sink::try_new(&stream_handle).map_err(|e| PlaybackError::Device(e.to_string()))?;
            let source = Decoder::new(cursor).map_err(|e| PlaybackError::Device(e.to_string()))?;
            use rodio::Source;
            sink.append(source.convert_samples::<f32>());
            sink.sleep_until_end();
            Ok(())
        })
        .await
        .map_err(|e| PlaybackError::Device(format!("rodio task failed: {}", e)))?
    }
}

/// Builds the ordered output candidates.
///
/// A configured command comes first, then every available command from
/// [`PLAYER_PRIORITY`], then the in-process rodio sink.
pub fn probe_players(preference: &str, timeout: Duration) -> Vec<Arc<dyn AudioOutput>> {
    let mut players: Vec<Arc<dyn AudioOutput>> = Vec::new();

    let configured = CommandPlayer::from_command_line(preference, timeout);
    let configured_program = configured.as_ref().map(|p| p.program().to_string());
    if let Some(player) = configured {
        players.push(Arc::new(player));
    }

    for (program, args) in PLAYER_PRIORITY {
        if configured_program.as_deref() == Some(program) {
            continue;
        }
        if which::which(program).is_ok() {
            let args = args.iter().map(|a| a.to_string()).collect();
            players.push(Arc::new(CommandPlayer::new(program, args, timeout)));
        }
    }

    players.push(Arc::new(RodioPlayer::new()));

    let ids: Vec<String> = players.iter().map(|p| p.id()).collect();
    info!(players = ?ids, "audio output candidates");
    players
}

/// Tries each output in order; the last one that worked goes first next time.
pub struct PlayerChain {
    players: Vec<Arc<dyn AudioOutput>>,
    preferred: AtomicUsize,
}

impl PlayerChain {
    pub fn new(players: Vec<Arc<dyn AudioOutput>>) -> Self {
        Self {
            players,
            preferred: AtomicUsize::new(0),
        }
    }

    pub fn preferred_id(&self) -> Option<String> {
        self.players
            .get(self.preferred.load(Ordering::Relaxed))
            .map(|p| p.id())
    }
}

#[async_trait]
impl AudioOutput for PlayerChain {
    fn id(&self) -> String {
        let ids: Vec<String> = self.players.iter().map(|p| p.id()).collect();
        format!("chain[{}]", ids.join(", "))
    }

    async fn play(&self, wav: &[u8]) -> Result<(), PlaybackError> {
        if self.players.is_empty() {
            return Err(PlaybackError::NoPlayer);
        }

        let start = self.preferred.load(Ordering::Relaxed);
        let order: Vec<usize> = (0..self.players.len())
            .map(|i| (start + i) % self.players.len())
            .collect();

        let result = first_success(
            &order,
            |&i| self.players[i].id(),
            |attempt, &i| {
                let player = Arc::clone(&self.players[i]);
                async move {
                    if attempt > 0 {
                        warn!(player = %player.id(), "failing over to next audio player");
                    }
                    player.play(wav).await
                }
            },
        )
        .await;

        match result {
            Ok(success) => {
                let chosen = order[success.index];
                if chosen != start {
                    self.preferred.store(chosen, Ordering::Relaxed);
                }
                debug!(player = %self.players[chosen].id(), "segment played");
                Ok(())
            }
            Err(exhausted) => Err(PlaybackError::Exhausted(exhausted.to_string())),
        }
    }
}
