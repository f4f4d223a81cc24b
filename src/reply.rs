use crate::error::{ReplyError, SpeakError};
use crate::fallback::first_success;
use crate::text::{clean, normalize_direct, shape_reply};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::{debug, warn};

/// Spoken when reply generation fails.
pub const FALLBACK_REPLY: &str = concat!(
    "今は情報が少ないから、私の方で要点を先にまとめるわ。",
    "まず優先順位を一つに絞って、短い手順から試すのが確実よ。"
);

/// Persona and format instructions prepended to every prompt.
pub const SYSTEM_PROMPT: &str = concat!(
    "あなたは冥鳴ひまりとして話す。",
    "落ち着き・知的・少し余裕のある女性の口調で、一人称は私。",
    "返答は80〜160文字、2〜3文、結論→理由→軽い補足の順。",
    "箇条書きとMarkdownを禁止し、返答本文のみを出力。",
    "情報不足でも質問返しせず、仮定して短く答える。"
);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Direct,
    #[default]
    Llm,
    /// Same as `Direct`.
    Auto,
}

impl std::str::FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "direct" => Ok(Mode::Direct),
            "llm" => Ok(Mode::Llm),
            "auto" => Ok(Mode::Auto),
            other => Err(format!("unknown mode: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplySource {
    Direct,
    Llm,
    Fallback,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplySelection {
    pub text: String,
    pub source: ReplySource,
    pub llm_ms: u64,
}

/// External reply generator. The timeout is enforced by the implementation's caller side.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ReplyGenerator: Send + Sync {
    async fn generate(&self, prompt: &str, timeout: Duration) -> Result<String, ReplyError>;
}

/// Runs a CLI (e.g. `gemini -p`) with the prompt as its last argument.
pub struct CommandReplyGenerator {
    program: String,
    args: Vec<String>,
}

impl CommandReplyGenerator {
    pub fn new(command_line: &str) -> Self {
        let mut parts = command_line.split_whitespace().map(str::to_string);
        let program = parts.next().unwrap_or_default();
        Self {
            program,
            args: parts.collect(),
        }
    }
}

#[async_trait]
impl ReplyGenerator for CommandReplyGenerator {
    async fn generate(&self, prompt: &str, timeout: Duration) -> Result<String, ReplyError> {
        let child = Command::new(&self.program)
            .args(&self.args)
            .arg(prompt)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(ReplyError::Spawn)?;

        // Dropping the wait future on timeout kills the child.
        let output = tokio::time::timeout(timeout, child.wait_with_output())
            .await
            .map_err(|_| ReplyError::Timeout(timeout.as_secs()))?
            .map_err(ReplyError::Spawn)?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(ReplyError::ExitStatus {
                status: output.status.to_string(),
                stderr: if stderr.is_empty() {
                    "LLM command failed".to_string()
                } else {
                    stderr
                },
            });
        }

        let out = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if out.is_empty() {
            return Err(ReplyError::Empty);
        }
        Ok(out)
    }
}

pub fn build_prompt(user_text: &str) -> String {
    format!("{}\n\nユーザー入力: {}\n\n返答:", SYSTEM_PROMPT, user_text)
}

pub struct ReplySelector {
    generator: Arc<dyn ReplyGenerator>,
    timeout: Duration,
    attempts: u32,
    min_chars: usize,
    max_chars: usize,
}

impl ReplySelector {
    pub fn new(
        generator: Arc<dyn ReplyGenerator>,
        timeout: Duration,
        attempts: u32,
        min_chars: usize,
        max_chars: usize,
    ) -> Self {
        Self {
            generator,
            timeout,
            attempts: attempts.max(1),
            min_chars,
            max_chars,
        }
    }

    /// Only `EmptyInput` can fail; generator failures turn into the fallback line.
    pub async fn select(&self, mode: Mode, text: &str) -> Result<ReplySelection, SpeakError> {
        match mode {
            Mode::Direct | Mode::Auto => Ok(ReplySelection {
                text: normalize_direct(text)?,
                source: ReplySource::Direct,
                llm_ms: 0,
            }),
            Mode::Llm => {
                let cleaned = clean(text);
                if cleaned.is_empty() {
                    return Err(SpeakError::EmptyInput);
                }
                Ok(self.generate(&cleaned).await)
            }
        }
    }

    async fn generate(&self, user_text: &str) -> ReplySelection {
        let prompt = build_prompt(user_text);
        let attempts: Vec<u32> = (1..=self.attempts).collect();
        let started = Instant::now();

        let result = first_success(
            &attempts,
            |n| format!("attempt {}", n),
            |_, &n| {
                let prompt = prompt.as_str();
                async move {
                    let raw = self.generator.generate(prompt, self.timeout).await?;
                    let shaped = shape_reply(&raw, self.min_chars, self.max_chars)?;
                    debug!(attempt = n, chars = shaped.chars().count(), "reply generated");
                    Ok::<_, ReplyError>(shaped)
                }
            },
        )
        .await;
        let llm_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(success) => ReplySelection {
                text: success.value,
                source: ReplySource::Llm,
                llm_ms,
            },
            Err(exhausted) => {
                warn!(errors = %exhausted, "reply generation failed, using fallback line");
                ReplySelection {
                    text: fallback_line(self.min_chars, self.max_chars),
                    source: ReplySource::Fallback,
                    llm_ms,
                }
            }
        }
    }
}

fn fallback_line(min_chars: usize, max_chars: usize) -> String {
    shape_reply(FALLBACK_REPLY, min_chars, max_chars)
        .ok()
        .or_else(|| normalize_direct(FALLBACK_REPLY).ok())
        .unwrap_or_else(|| FALLBACK_REPLY.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn good_reply() -> String {
        "結論から言うと、今日は早めに休むのが一番よ。".repeat(4)
    }

    fn selector(generator: MockReplyGenerator) -> ReplySelector {
        ReplySelector::new(Arc::new(generator), Duration::from_secs(1), 2, 80, 160)
    }

    #[tokio::test]
    async fn direct_mode_never_calls_generator() {
        let mut generator = MockReplyGenerator::new();
        generator.expect_generate().times(0);

        let selection = selector(generator).select(Mode::Direct, "こんにちは").await.unwrap();
        assert_eq!(selection.text, "こんにちは。");
        assert_eq!(selection.source, ReplySource::Direct);
        assert_eq!(selection.llm_ms, 0);
    }

    #[tokio::test]
    async fn auto_mode_behaves_like_direct() {
        let mut generator = MockReplyGenerator::new();
        generator.expect_generate().times(0);

        let selection = selector(generator).select(Mode::Auto, "テスト").await.unwrap();
        assert_eq!(selection.source, ReplySource::Direct);
    }

    #[tokio::test]
    async fn llm_reply_is_used_when_well_formed() {
        let mut generator = MockReplyGenerator::new();
        generator
            .expect_generate()
            .withf(|prompt, _| prompt.contains("ユーザー入力: 疲れた"))
            .times(1)
            .returning(|_, _| Ok(good_reply()));

        let selection = selector(generator).select(Mode::Llm, "疲れた").await.unwrap();
        assert_eq!(selection.source, ReplySource::Llm);
        assert!(selection.text.starts_with("結論から言うと"));
    }

    #[tokio::test]
    async fn second_attempt_recovers_from_malformed_first_reply() {
        let mut generator = MockReplyGenerator::new();
        let mut seq = mockall::Sequence::new();
        generator
            .expect_generate()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok("短い？".to_string()));
        generator
            .expect_generate()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(good_reply()));

        let selection = selector(generator).select(Mode::Llm, "質問").await.unwrap();
        assert_eq!(selection.source, ReplySource::Llm);
    }

    #[tokio::test]
    async fn timeouts_fall_back_to_fixed_line() {
        let mut generator = MockReplyGenerator::new();
        generator
            .expect_generate()
            .times(2)
            .returning(|_, t| Err(ReplyError::Timeout(t.as_secs())));

        let selection = selector(generator).select(Mode::Llm, "こんにちは").await.unwrap();
        assert_eq!(selection.source, ReplySource::Fallback);
        assert_eq!(selection.text, FALLBACK_REPLY);
    }

    #[tokio::test]
    async fn blank_llm_input_is_rejected() {
        let generator = MockReplyGenerator::new();
        let err = selector(generator).select(Mode::Llm, "  ").await.unwrap_err();
        assert!(matches!(err, SpeakError::EmptyInput));
    }

    #[tokio::test]
    async fn control_only_llm_input_never_reaches_generator() {
        let mut generator = MockReplyGenerator::new();
        generator.expect_generate().times(0);
        let err = selector(generator)
            .select(Mode::Llm, "\u{0007}\u{0008}\r\n")
            .await
            .unwrap_err();
        assert!(matches!(err, SpeakError::EmptyInput));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_generator_enforces_timeout() {
        let generator = CommandReplyGenerator::new("sleep");
        let err = generator
            .generate("5", Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, ReplyError::Timeout(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_generator_reports_failures() {
        let failing = CommandReplyGenerator::new("false");
        assert!(matches!(
            failing.generate("x", Duration::from_secs(5)).await,
            Err(ReplyError::ExitStatus { .. })
        ));

        let echo = CommandReplyGenerator::new("echo");
        assert_eq!(
            echo.generate("返答です。", Duration::from_secs(5)).await.unwrap(),
            "返答です。"
        );

        let missing = CommandReplyGenerator::new("no-such-llm-binary");
        assert!(matches!(
            missing.generate("x", Duration::from_secs(1)).await,
            Err(ReplyError::Spawn(_))
        ));
    }

    #[test]
    fn mode_parses_case_insensitively() {
        assert_eq!("LLM".parse::<Mode>().unwrap(), Mode::Llm);
        assert_eq!("auto".parse::<Mode>().unwrap(), Mode::Auto);
        assert!("chat".parse::<Mode>().is_err());
    }
}
