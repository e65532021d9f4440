use thiserror::Error;

/// 백엔드 고유의 에러 표현
///
/// 프로토콜 계층은 이 타입을 직접 직렬화하지 않고, `host::errors`에서
/// 한 번만 `ErrorKind`로 변환합니다.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("Language model is not available: {0}")]
    SessionNotAvailable(String),

    #[error("Language model generation failed: {0}")]
    GenerationFailed(String),

    #[error("Model assets are unavailable: {0}")]
    AssetsUnavailable(String),

    #[error("Context window size exceeded: {0}")]
    ExceededContextWindow(String),

    #[error("Content safety violation: {0}")]
    GuardrailViolation(String),

    #[error("Response decoding failed: {0}")]
    DecodingFailure(String),

    #[error("Unsupported generation guide: {0}")]
    UnsupportedGuide(String),

    #[error("Language or locale not supported: {0}")]
    UnsupportedLanguageOrLocale(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),
}
