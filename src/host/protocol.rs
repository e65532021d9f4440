use crate::backend::prompt_template::PromptTemplate;
use crate::backend::GenerationOptions;
use crate::host::encoder::{
    AvailabilityPayload, ChunkPayload, CompletionPayload, ErrorPayload, ResponseEncoder,
};
use crate::host::errors::{ErrorKind, MappedError};
use serde::Serialize;
use serde_json::{Map, Value};

/// 프레임에서 디코딩된 요청
#[derive(Debug, Clone)]
pub struct Request {
    pub request_id: String,
    pub command: Command,
}

/// 단발성 생성 요청 (getCompletion / getCompletionStream / chatCompletion)
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub prompt: String,
    pub system_prompt: Option<String>,
    pub options: GenerationOptions,
}

/// 세션 대화 한 턴
#[derive(Debug, Clone, PartialEq)]
pub struct SessionMessage {
    pub session_id: String,
    pub prompt: String,
    pub options: GenerationOptions,
}

/// 라우팅 가능한 명령어 (닫힌 집합 + Unknown)
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    CheckAvailability,
    GetCompletion(CompletionRequest),
    GetCompletionStream(CompletionRequest),
    ChatCompletion {
        request: CompletionRequest,
        stream: bool,
    },
    StartSession {
        system_prompt: Option<String>,
    },
    SendMessage(SessionMessage),
    EndSession {
        session_id: String,
    },
    /// 취소 대상 스트림의 requestId
    CancelStream {
        target: String,
    },
    Unknown(String),
}

impl Command {
    /// Wire name, for logging
    pub fn name(&self) -> &str {
        match self {
            Command::CheckAvailability => "checkAvailability",
            Command::GetCompletion(_) => "getCompletion",
            Command::GetCompletionStream(_) => "getCompletionStream",
            Command::ChatCompletion { .. } => "chatCompletion",
            Command::StartSession { .. } => "startPlaygroundSession",
            Command::SendMessage(_) => "sendPlaygroundMessage",
            Command::EndSession { .. } => "endPlaygroundSession",
            Command::CancelStream { .. } => "cancelStream",
            Command::Unknown(name) => name,
        }
    }

    /// Commands answered with chunk frames; these can be cancelled
    pub fn is_streaming(&self) -> bool {
        matches!(
            self,
            Command::GetCompletionStream(_)
                | Command::ChatCompletion { stream: true, .. }
                | Command::SendMessage(_)
        )
    }

    /// 백엔드 작업이 필요한 명령은 별도 태스크에서 실행
    pub fn needs_backend(&self) -> bool {
        matches!(
            self,
            Command::CheckAvailability
                | Command::GetCompletion(_)
                | Command::GetCompletionStream(_)
                | Command::ChatCompletion { .. }
                | Command::StartSession { .. }
                | Command::SendMessage(_)
        )
    }
}

/// 디코딩 실패: requestId를 알 수 있으면 함께 돌려줌
#[derive(Debug, Clone, PartialEq)]
pub struct DecodeError {
    pub request_id: Option<String>,
    pub error: MappedError,
}

impl DecodeError {
    fn new(request_id: Option<String>, message: impl Into<String>) -> Self {
        Self {
            request_id,
            error: MappedError::malformed(message),
        }
    }

    pub fn into_response(self) -> Response {
        Response::error(self.request_id, &self.error)
    }
}

impl Request {
    /// Decode one frame body.
    ///
    /// Unknown payload fields are ignored. A missing or non-object `payload`
    /// is read as `{}`.
    pub fn decode(bytes: &[u8]) -> std::result::Result<Self, DecodeError> {
        let value: Value = serde_json::from_slice(bytes)
            .map_err(|e| DecodeError::new(None, format!("Invalid JSON: {}", e)))?;
        let Value::Object(message) = value else {
            return Err(DecodeError::new(None, "Message must be a JSON object"));
        };

        let request_id = message
            .get("requestId")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| DecodeError::new(None, "Missing requestId field"))?;

        let Some(command) = message.get("command").and_then(Value::as_str) else {
            return Err(DecodeError::new(Some(request_id), "Missing command field"));
        };

        let empty = Map::new();
        let payload = message
            .get("payload")
            .and_then(Value::as_object)
            .unwrap_or(&empty);

        let command = Self::parse_command(command, payload, &request_id)
            .map_err(|reason| DecodeError::new(Some(request_id.clone()), reason))?;

        Ok(Self {
            request_id,
            command,
        })
    }

    fn parse_command(
        name: &str,
        payload: &Map<String, Value>,
        request_id: &str,
    ) -> std::result::Result<Command, &'static str> {
        let command = match name {
            "checkAvailability" => Command::CheckAvailability,
            "getCompletion" => Command::GetCompletion(Self::completion(payload)?),
            "getCompletionStream" => Command::GetCompletionStream(Self::completion(payload)?),
            "chatCompletion" => {
                let messages = payload
                    .get("messages")
                    .and_then(Value::as_array)
                    .ok_or("Missing messages array")?;
                let (prompt, system_prompt) = PromptTemplate::from_chat_messages(messages);
                Command::ChatCompletion {
                    request: CompletionRequest {
                        prompt,
                        system_prompt,
                        options: Self::options(payload),
                    },
                    stream: payload
                        .get("stream")
                        .and_then(Value::as_bool)
                        .unwrap_or(false),
                }
            }
            "startPlaygroundSession" => Command::StartSession {
                system_prompt: string_field(payload, "systemPrompt"),
            },
            "sendPlaygroundMessage" => {
                match (
                    string_field(payload, "sessionId"),
                    string_field(payload, "prompt"),
                ) {
                    (Some(session_id), Some(prompt)) => Command::SendMessage(SessionMessage {
                        session_id,
                        prompt,
                        options: Self::options(payload),
                    }),
                    _ => return Err("Missing sessionId or prompt"),
                }
            }
            "endPlaygroundSession" => Command::EndSession {
                session_id: string_field(payload, "sessionId").ok_or("Missing sessionId")?,
            },
            // 대상은 기본적으로 자기 자신의 requestId
            "cancelStream" => Command::CancelStream {
                target: string_field(payload, "requestId")
                    .unwrap_or_else(|| request_id.to_string()),
            },
            other => Command::Unknown(other.to_string()),
        };
        Ok(command)
    }

    fn completion(payload: &Map<String, Value>) -> std::result::Result<CompletionRequest, &'static str> {
        Ok(CompletionRequest {
            prompt: string_field(payload, "prompt").ok_or("Missing prompt")?,
            system_prompt: string_field(payload, "systemPrompt"),
            options: Self::options(payload),
        })
    }

    /// 옵션은 payload 최상위 또는 중첩된 `options` 객체에서 읽음
    fn options(payload: &Map<String, Value>) -> GenerationOptions {
        let source = payload
            .get("options")
            .and_then(Value::as_object)
            .unwrap_or(payload);
        GenerationOptions::from_payload(source)
    }
}

fn string_field(payload: &Map<String, Value>, key: &str) -> Option<String> {
    payload.get(key).and_then(Value::as_str).map(str::to_string)
}

/// 응답 타입 (envelope의 `type` 필드)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ResponseType {
    CompletionResponse,
    AvailabilityResponse,
    PlaygroundSessionStarted,
    SessionEnded,
    StreamChunk,
    StreamEnd,
    Error,
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum Payload {
    Availability(AvailabilityPayload),
    Completion(CompletionPayload),
    Chunk(ChunkPayload),
    Error(ErrorPayload),
    Session {
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    Ack {
        success: bool,
    },
}

/// 호스트가 내보내는 모든 프레임의 envelope
#[derive(Debug, Clone, Serialize)]
pub struct Response {
    #[serde(rename = "requestId", skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(rename = "type")]
    pub kind: ResponseType,
    pub payload: Payload,
}

impl Response {
    fn new(request_id: impl Into<String>, kind: ResponseType, payload: Payload) -> Self {
        Self {
            request_id: Some(request_id.into()),
            kind,
            payload,
        }
    }

    pub fn availability(request_id: &str, available: bool) -> Self {
        Self::new(
            request_id,
            ResponseType::AvailabilityResponse,
            Payload::Availability(ResponseEncoder::availability(available)),
        )
    }

    pub fn completion(request_id: &str, content: impl Into<String>) -> Self {
        Self::new(
            request_id,
            ResponseType::CompletionResponse,
            Payload::Completion(ResponseEncoder::completion(content)),
        )
    }

    /// Terminal chunks travel as `streamEnd`, everything else as `streamChunk`
    pub fn chunk(request_id: &str, chunk: ChunkPayload) -> Self {
        let kind = if chunk.is_terminal() {
            ResponseType::StreamEnd
        } else {
            ResponseType::StreamChunk
        };
        Self::new(request_id, kind, Payload::Chunk(chunk))
    }

    pub fn session_started(request_id: &str, session_id: impl Into<String>) -> Self {
        Self::new(
            request_id,
            ResponseType::PlaygroundSessionStarted,
            Payload::Session {
                session_id: session_id.into(),
            },
        )
    }

    pub fn session_ended(request_id: &str, session_id: impl Into<String>) -> Self {
        Self::new(
            request_id,
            ResponseType::SessionEnded,
            Payload::Session {
                session_id: session_id.into(),
            },
        )
    }

    /// cancelStream 응답: 대상 스트림 존재 여부와 무관하게 `streamEnd` + success
    pub fn cancel_ack(request_id: &str) -> Self {
        Self::new(
            request_id,
            ResponseType::StreamEnd,
            Payload::Ack { success: true },
        )
    }

    pub fn error(request_id: Option<String>, error: &MappedError) -> Self {
        Self::error_payload(request_id, ResponseEncoder::mapped_error(error))
    }

    pub fn error_payload(request_id: Option<String>, payload: ErrorPayload) -> Self {
        Self {
            request_id,
            kind: ResponseType::Error,
            payload: Payload::Error(payload),
        }
    }

    pub fn native_error(request_id: Option<String>, message: impl Into<String>) -> Self {
        Self::error(request_id, &MappedError::new(ErrorKind::NativeError, message))
    }

    /// JSON으로 직렬화
    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}
