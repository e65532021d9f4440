use crate::backend::options::SamplingMode;
use crate::backend::{
    normalize_instructions, BackendError, BackendResult, ContentStream, GenerationBackend,
    GenerationOptions, ModelHandle,
};
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Exit codes an external model program uses to report structured failures
const EXIT_ASSETS_UNAVAILABLE: i32 = 10;
const EXIT_CONTEXT_WINDOW: i32 = 11;
const EXIT_GUARDRAIL: i32 = 12;
const EXIT_DECODING: i32 = 13;
const EXIT_UNSUPPORTED_GUIDE: i32 = 14;
const EXIT_UNSUPPORTED_LANGUAGE: i32 = 15;
const EXIT_RATE_LIMITED: i32 = 16;

const READ_CHUNK: usize = 4096;

/// External-program backend
///
/// 요청마다 설정된 프로그램을 실행하여 프롬프트를 stdin으로 전달하고,
/// stdout 출력을 누적 스냅샷으로 스트리밍합니다.
/// 생성 옵션과 시스템 프롬프트는 환경 변수로 전달됩니다:
///
/// - `NATIVEFM_TEMPERATURE`, `NATIVEFM_MAX_TOKENS`, `NATIVEFM_SAMPLING`
/// - `NATIVEFM_TOP_P` / `NATIVEFM_TOP_K`, `NATIVEFM_SEED` (해당되는 경우)
/// - `NATIVEFM_INSTRUCTIONS` (시스템 프롬프트가 있는 경우)
pub struct CommandBackend {
    program: String,
    args: Vec<String>,
    buffer: usize,
}

impl CommandBackend {
    pub fn new(program: impl Into<String>, args: Vec<String>, buffer: usize) -> Self {
        Self {
            program: program.into(),
            args,
            buffer: buffer.max(1),
        }
    }

    /// 프로그램 경로 확인 (PATH 검색 또는 직접 경로)
    fn resolve(&self) -> Option<PathBuf> {
        which::which(&self.program).ok().or_else(|| {
            let path = PathBuf::from(&self.program);
            path.is_file().then_some(path)
        })
    }
}

#[async_trait]
impl GenerationBackend for CommandBackend {
    fn name(&self) -> &str {
        "command"
    }

    async fn check_available(&self) -> bool {
        self.resolve().is_some()
    }

    async fn open(&self, instructions: Option<&str>) -> BackendResult<Arc<dyn ModelHandle>> {
        let program = self.resolve().ok_or_else(|| {
            BackendError::SessionNotAvailable(format!("Backend program not found: {}", self.program))
        })?;

        Ok(Arc::new(CommandHandle {
            program,
            args: self.args.clone(),
            instructions: normalize_instructions(instructions),
            buffer: self.buffer,
        }))
    }
}

struct CommandHandle {
    program: PathBuf,
    args: Vec<String>,
    instructions: Option<String>,
    buffer: usize,
}

impl CommandHandle {
    fn command(&self, options: &GenerationOptions) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .env("NATIVEFM_TEMPERATURE", options.temperature.to_string())
            .env("NATIVEFM_MAX_TOKENS", options.max_response_tokens.to_string())
            .env("NATIVEFM_SAMPLING", options.sampling.as_str())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        match options.sampling {
            SamplingMode::Greedy => {}
            SamplingMode::TopP { threshold, seed } => {
                command.env("NATIVEFM_TOP_P", threshold.to_string());
                if let Some(seed) = seed {
                    command.env("NATIVEFM_SEED", seed.to_string());
                }
            }
            SamplingMode::TopK { count, seed } => {
                command.env("NATIVEFM_TOP_K", count.to_string());
                if let Some(seed) = seed {
                    command.env("NATIVEFM_SEED", seed.to_string());
                }
            }
        }

        if let Some(instructions) = &self.instructions {
            command.env("NATIVEFM_INSTRUCTIONS", instructions);
        }

        command
    }

    /// 프로세스 실행 후 프롬프트를 stdin에 쓰고 닫음
    async fn spawn(&self, prompt: &str, options: &GenerationOptions) -> BackendResult<Child> {
        let mut child = self.command(options).spawn().map_err(|e| {
            BackendError::SessionNotAvailable(format!(
                "Failed to start {}: {}",
                self.program.display(),
                e
            ))
        })?;

        if let Some(mut stdin) = child.stdin.take() {
            match stdin.write_all(prompt.as_bytes()).await {
                Ok(()) => {}
                // 프로그램이 stdin을 읽지 않고 종료한 경우
                Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {
                    debug!("backend program closed stdin before reading the prompt");
                }
                Err(e) => {
                    return Err(BackendError::GenerationFailed(format!(
                        "Failed to write prompt: {}",
                        e
                    )))
                }
            }
        }

        Ok(child)
    }
}

#[async_trait]
impl ModelHandle for CommandHandle {
    async fn respond(&self, prompt: &str, options: &GenerationOptions) -> BackendResult<String> {
        let child = self.spawn(prompt, options).await?;

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| BackendError::GenerationFailed(e.to_string()))?;

        if !output.status.success() {
            return Err(classify_failure(
                output.status,
                &String::from_utf8_lossy(&output.stderr),
            ));
        }

        String::from_utf8(output.stdout)
            .map(|text| text.trim().to_string())
            .map_err(|e| BackendError::DecodingFailure(e.to_string()))
    }

    async fn stream(&self, prompt: &str, options: &GenerationOptions) -> BackendResult<ContentStream> {
        let mut child = self.spawn(prompt, options).await?;
        let (tx, rx) = mpsc::channel(self.buffer);

        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| BackendError::GenerationFailed("stdout not captured".to_string()))?;
        let mut stderr = child.stderr.take();

        tokio::spawn(async move {
            // stderr는 별도로 읽어 파이프가 가득 차지 않도록 함
            let stderr_task = tokio::spawn(async move {
                let mut text = String::new();
                if let Some(stderr) = stderr.as_mut() {
                    let _ = stderr.read_to_string(&mut text).await;
                }
                text
            });

            let mut bytes = Vec::new();
            let mut sent_len = 0;
            let mut chunk = [0u8; READ_CHUNK];

            loop {
                let read = match stdout.read(&mut chunk).await {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(e) => {
                        let _ = tx.send(Err(BackendError::GenerationFailed(e.to_string()))).await;
                        return;
                    }
                };
                bytes.extend_from_slice(&chunk[..read]);

                let text = match decode_prefix(&bytes) {
                    Ok(text) => text,
                    Err(e) => {
                        let _ = tx.send(Err(e)).await;
                        return;
                    }
                };

                if text.len() > sent_len {
                    sent_len = text.len();
                    if tx.send(Ok(text.to_string())).await.is_err() {
                        // 수신자 drop = 취소, child는 kill_on_drop으로 정리됨
                        debug!("stream receiver dropped, stopping backend process");
                        return;
                    }
                }
            }

            let status = match child.wait().await {
                Ok(status) => status,
                Err(e) => {
                    let _ = tx.send(Err(BackendError::GenerationFailed(e.to_string()))).await;
                    return;
                }
            };

            if !status.success() {
                let stderr_text = stderr_task.await.unwrap_or_default();
                warn!(%status, "backend process failed");
                let _ = tx.send(Err(classify_failure(status, &stderr_text))).await;
            }
        });

        Ok(rx)
    }
}

/// Longest valid UTF-8 prefix; an incomplete trailing sequence is held back
fn decode_prefix(bytes: &[u8]) -> BackendResult<&str> {
    match std::str::from_utf8(bytes) {
        Ok(text) => Ok(text),
        Err(e) if e.error_len().is_none() => {
            // 멀티바이트 문자가 청크 경계에서 잘림
            Ok(std::str::from_utf8(&bytes[..e.valid_up_to()]).unwrap_or_default())
        }
        Err(e) => Err(BackendError::DecodingFailure(e.to_string())),
    }
}

/// 프로세스 종료 코드를 백엔드 에러로 변환
fn classify_failure(status: ExitStatus, stderr: &str) -> BackendError {
    let message = stderr.trim().lines().last().unwrap_or("").to_string();
    let message = if message.is_empty() {
        format!("backend process exited with {}", status)
    } else {
        message
    };

    match status.code() {
        Some(EXIT_ASSETS_UNAVAILABLE) => BackendError::AssetsUnavailable(message),
        Some(EXIT_CONTEXT_WINDOW) => BackendError::ExceededContextWindow(message),
        Some(EXIT_GUARDRAIL) => BackendError::GuardrailViolation(message),
        Some(EXIT_DECODING) => BackendError::DecodingFailure(message),
        Some(EXIT_UNSUPPORTED_GUIDE) => BackendError::UnsupportedGuide(message),
        Some(EXIT_UNSUPPORTED_LANGUAGE) => BackendError::UnsupportedLanguageOrLocale(message),
        Some(EXIT_RATE_LIMITED) => BackendError::RateLimited(message),
        _ => BackendError::GenerationFailed(message),
    }
}
