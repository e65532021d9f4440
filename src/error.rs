use thiserror::Error;

#[derive(Error, Debug)]
pub enum HostError {
    /// 길이 헤더를 읽지 못함 (피어 종료) - 프로세스 종료 사유
    #[error("Failed to read 4-byte length header: {0}")]
    HeaderRead(#[source] std::io::Error),

    #[error("Invalid message length: {0}")]
    InvalidLength(u32),

    #[error("Failed to read complete message (expected {expected} bytes)")]
    TruncatedBody {
        expected: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("Outbound message length out of range: {0} bytes")]
    OutboundLength(usize),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON serialization/deserialization error: {0}")]
    JsonError(#[from] serde_json::Error),
}

impl HostError {
    /// 프로세스를 종료해야 하는 에러인지 여부
    pub fn is_fatal(&self) -> bool {
        matches!(self, HostError::HeaderRead(_))
    }
}

pub type Result<T> = std::result::Result<T, HostError>;
