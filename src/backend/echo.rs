use crate::backend::{
    normalize_instructions, BackendError, BackendResult, ContentStream, GenerationBackend,
    GenerationOptions, ModelHandle,
};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Deterministic loopback backend
///
/// 실제 모델 없이 확장 프로그램을 개발/테스트할 수 있도록 마지막 사용자 입력을
/// 그대로 돌려줍니다. 스트리밍 시 단어 단위 누적 스냅샷을 생성합니다.
pub struct EchoBackend {
    available: bool,
    delay: Duration,
    buffer: usize,
}

impl EchoBackend {
    pub fn new(available: bool, delay: Duration, buffer: usize) -> Self {
        Self {
            available,
            delay,
            buffer: buffer.max(1),
        }
    }
}

#[async_trait]
impl GenerationBackend for EchoBackend {
    fn name(&self) -> &str {
        "echo"
    }

    async fn check_available(&self) -> bool {
        self.available
    }

    async fn open(&self, instructions: Option<&str>) -> BackendResult<Arc<dyn ModelHandle>> {
        if !self.available {
            return Err(BackendError::SessionNotAvailable(
                "Can't initialize language model session; it is unavailable".to_string(),
            ));
        }

        Ok(Arc::new(EchoHandle {
            instructions: normalize_instructions(instructions),
            delay: self.delay,
            buffer: self.buffer,
        }))
    }
}

struct EchoHandle {
    instructions: Option<String>,
    delay: Duration,
    buffer: usize,
}

impl EchoHandle {
    /// 응답 전체를 단어 단위 조각으로 분리 (공백 포함)
    fn pieces(&self, prompt: &str, options: &GenerationOptions) -> Vec<String> {
        let mut pieces = Vec::new();
        if let Some(instructions) = &self.instructions {
            pieces.push(format!("[{}] ", instructions));
        }

        let limit = options.max_response_tokens as usize;
        pieces.extend(
            last_user_message(prompt)
                .split_inclusive(char::is_whitespace)
                .take(limit)
                .map(str::to_string),
        );
        pieces
    }
}

#[async_trait]
impl ModelHandle for EchoHandle {
    async fn respond(&self, prompt: &str, options: &GenerationOptions) -> BackendResult<String> {
        Ok(self.pieces(prompt, options).concat().trim_end().to_string())
    }

    async fn stream(&self, prompt: &str, options: &GenerationOptions) -> BackendResult<ContentStream> {
        let pieces = self.pieces(prompt, options);
        let delay = self.delay;
        let (tx, rx) = mpsc::channel(self.buffer);

        tokio::spawn(async move {
            let mut content = String::new();
            for piece in pieces {
                content.push_str(&piece);
                if tx.send(Ok(content.trim_end().to_string())).await.is_err() {
                    // 수신자 drop = 취소
                    return;
                }
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
            }
        });

        Ok(rx)
    }
}

/// Text after the last `User: ` marker, or the whole prompt
fn last_user_message(prompt: &str) -> &str {
    match prompt.rfind("User: ") {
        Some(index) => &prompt[index + "User: ".len()..],
        None => prompt,
    }
}
