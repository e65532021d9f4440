use crate::host::errors::{ErrorKind, MappedError};
use serde::Serialize;
use uuid::Uuid;

const ASSISTANT: &str = "assistant";
const FINISH_STOP: &str = "stop";

/// `<prefix>-` followed by the first 8 characters of a fresh v4 UUID
pub fn short_id(prefix: &str) -> String {
    let uuid = Uuid::new_v4().to_string();
    format!("{}-{}", prefix, &uuid[..8])
}

/// Current time in epoch seconds
pub fn now_epoch() -> i64 {
    chrono::Utc::now().timestamp()
}

#[derive(Debug, Clone, Serialize)]
pub struct AvailabilityPayload {
    pub id: String,
    pub object: &'static str,
    pub created: i64,
    pub available: bool,
    pub reason: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub role: &'static str,
    pub content: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CompletionChoice {
    pub index: u32,
    pub message: ChatMessage,
    pub finish_reason: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct CompletionPayload {
    pub id: String,
    pub object: &'static str,
    pub created: i64,
    pub choices: Vec<CompletionChoice>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Delta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChunkChoice {
    pub index: u32,
    pub delta: Delta,
    /// Serialised as `null` until the terminal chunk
    pub finish_reason: Option<&'static str>,
}

/// One `chat.completion.chunk` frame payload
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChunkPayload {
    pub id: String,
    pub object: &'static str,
    pub created: i64,
    pub choices: Vec<ChunkChoice>,
    #[serde(rename = "sessionId", skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl ChunkPayload {
    pub fn delta(&self) -> &Delta {
        &self.choices[0].delta
    }

    pub fn is_terminal(&self) -> bool {
        self.choices[0].finish_reason.is_some()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub message: String,
    #[serde(rename = "type")]
    pub kind: ErrorKind,
    pub param: Option<String>,
    pub code: ErrorKind,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorPayload {
    pub id: String,
    pub object: &'static str,
    pub created: i64,
    pub error: ErrorBody,
    #[serde(rename = "sessionId", skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl ErrorPayload {
    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }
}

/// 응답 페이로드 생성기 (OpenAI 스타일 wire 형식)
pub struct ResponseEncoder;

impl ResponseEncoder {
    pub fn availability(available: bool) -> AvailabilityPayload {
        AvailabilityPayload {
            id: short_id("availability"),
            object: "availability.check",
            created: now_epoch(),
            available,
            reason: if available {
                "Ready"
            } else {
                "LLM framework not available"
            },
        }
    }

    pub fn completion(content: impl Into<String>) -> CompletionPayload {
        CompletionPayload {
            id: short_id("chatcmpl"),
            object: "chat.completion",
            created: now_epoch(),
            choices: vec![CompletionChoice {
                index: 0,
                message: ChatMessage {
                    role: ASSISTANT,
                    content: content.into(),
                },
                finish_reason: FINISH_STOP,
            }],
        }
    }

    pub fn role_chunk(id: &str, created: i64) -> ChunkPayload {
        Self::chunk(
            id,
            created,
            Delta {
                role: Some(ASSISTANT),
                content: None,
            },
            None,
        )
    }

    pub fn content_chunk(id: &str, created: i64, content: impl Into<String>) -> ChunkPayload {
        Self::chunk(
            id,
            created,
            Delta {
                role: None,
                content: Some(content.into()),
            },
            None,
        )
    }

    pub fn terminal_chunk(id: &str, created: i64) -> ChunkPayload {
        Self::chunk(id, created, Delta::default(), Some(FINISH_STOP))
    }

    fn chunk(
        id: &str,
        created: i64,
        delta: Delta,
        finish_reason: Option<&'static str>,
    ) -> ChunkPayload {
        ChunkPayload {
            id: id.to_string(),
            object: "chat.completion.chunk",
            created,
            choices: vec![ChunkChoice {
                index: 0,
                delta,
                finish_reason,
            }],
            session_id: None,
        }
    }

    /// 프로토콜 에러와 백엔드 에러 모두 같은 형태를 사용
    pub fn error(kind: ErrorKind, message: impl Into<String>) -> ErrorPayload {
        ErrorPayload {
            id: short_id("error"),
            object: "error",
            created: now_epoch(),
            error: ErrorBody {
                message: message.into(),
                kind,
                param: None,
                code: kind,
            },
            session_id: None,
        }
    }

    pub fn mapped_error(error: &MappedError) -> ErrorPayload {
        Self::error(error.kind, error.message.clone())
    }
}
