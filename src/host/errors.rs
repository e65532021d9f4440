use crate::backend::BackendError;
use serde::Serialize;
use std::fmt;

/// 와이어로 노출되는 닫힌 에러 분류
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ErrorKind {
    #[serde(rename = "sessionNotAvailable")]
    SessionNotAvailable,
    #[serde(rename = "generationFailed")]
    GenerationFailed,
    #[serde(rename = "assetsUnavailable")]
    AssetsUnavailable,
    #[serde(rename = "contextWindowExceeded")]
    ContextWindowExceeded,
    #[serde(rename = "guardrailViolation")]
    GuardrailViolation,
    #[serde(rename = "decodingFailure")]
    DecodingFailure,
    #[serde(rename = "unsupportedGuide")]
    UnsupportedGuide,
    #[serde(rename = "unknownCommand")]
    UnknownCommand,
    #[serde(rename = "malformedMessage")]
    MalformedMessage,
    #[serde(rename = "native_error")]
    NativeError,
}

impl ErrorKind {
    /// Stable wire string, used for both `type` and `code`
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::SessionNotAvailable => "sessionNotAvailable",
            ErrorKind::GenerationFailed => "generationFailed",
            ErrorKind::AssetsUnavailable => "assetsUnavailable",
            ErrorKind::ContextWindowExceeded => "contextWindowExceeded",
            ErrorKind::GuardrailViolation => "guardrailViolation",
            ErrorKind::DecodingFailure => "decodingFailure",
            ErrorKind::UnsupportedGuide => "unsupportedGuide",
            ErrorKind::UnknownCommand => "unknownCommand",
            ErrorKind::MalformedMessage => "malformedMessage",
            ErrorKind::NativeError => "native_error",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failure ready to be rendered onto the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappedError {
    pub kind: ErrorKind,
    pub message: String,
}

impl MappedError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::MalformedMessage, message)
    }
}

/// 백엔드 에러 → 와이어 에러 변환 (유일한 변환 지점)
pub struct ErrorMapper;

impl ErrorMapper {
    pub fn kind_of(error: &BackendError) -> ErrorKind {
        match error {
            BackendError::SessionNotAvailable(_) => ErrorKind::SessionNotAvailable,
            BackendError::AssetsUnavailable(_) => ErrorKind::AssetsUnavailable,
            BackendError::ExceededContextWindow(_) => ErrorKind::ContextWindowExceeded,
            BackendError::GuardrailViolation(_) => ErrorKind::GuardrailViolation,
            BackendError::DecodingFailure(_) => ErrorKind::DecodingFailure,
            BackendError::UnsupportedGuide(_) => ErrorKind::UnsupportedGuide,
            BackendError::GenerationFailed(_)
            | BackendError::UnsupportedLanguageOrLocale(_)
            | BackendError::RateLimited(_) => ErrorKind::GenerationFailed,
        }
    }

    /// 사용자에게 보여줄 메시지
    pub fn user_message(kind: ErrorKind) -> &'static str {
        match kind {
            ErrorKind::SessionNotAvailable => {
                "The on-device language model is not available or is disabled."
            }
            ErrorKind::AssetsUnavailable => {
                "The AI model is currently downloading or unavailable. Please try again later."
            }
            ErrorKind::ContextWindowExceeded => {
                "The conversation is too long. Please start a new chat to continue."
            }
            ErrorKind::GuardrailViolation => {
                "This request contains content that cannot be processed for safety reasons."
            }
            ErrorKind::DecodingFailure => {
                "There was an issue processing the AI response. Please try again."
            }
            ErrorKind::UnsupportedGuide => "The requested output format is not supported.",
            ErrorKind::GenerationFailed => {
                "The AI encountered an error while generating a response. Please try again."
            }
            ErrorKind::UnknownCommand => "Unknown command.",
            ErrorKind::MalformedMessage => "Malformed message.",
            ErrorKind::NativeError => "An unexpected error occurred.",
        }
    }

    pub fn map(error: &BackendError) -> MappedError {
        let kind = Self::kind_of(error);
        MappedError::new(kind, Self::user_message(kind))
    }
}
