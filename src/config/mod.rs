use crate::error::{HostError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// nativefm-host 설정
///
/// 설정 파일은 ~/.nativefm/config.toml에 저장됩니다.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// 생성 백엔드 (echo, command)
    #[serde(default = "default_backend")]
    pub backend: String,

    /// command 백엔드가 실행할 프로그램
    #[serde(default)]
    pub command: Option<String>,

    /// command 백엔드 프로그램 인자
    #[serde(default)]
    pub args: Vec<String>,

    /// echo 백엔드 사용 가능 여부 (비가용 상태 테스트용)
    #[serde(default = "default_echo_available")]
    pub echo_available: bool,

    /// echo 백엔드 스냅샷 간 지연 (ms)
    #[serde(default)]
    pub echo_delay_ms: u64,

    /// 백엔드 스트림 채널 버퍼 크기
    #[serde(default = "default_stream_buffer")]
    pub stream_buffer: usize,

    /// stdin 종료 후 진행 중인 요청을 기다리는 시간 (ms)
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,

    /// tracing 필터 (RUST_LOG 미설정 시 사용)
    #[serde(default = "default_log_filter")]
    pub log_filter: String,

    /// 로그 파일 경로 (미지정 시 stderr)
    #[serde(default)]
    pub log_file: Option<PathBuf>,
}

fn default_backend() -> String {
    "echo".to_string()
}

fn default_echo_available() -> bool {
    true
}

fn default_stream_buffer() -> usize {
    32
}

fn default_shutdown_grace_ms() -> u64 {
    2000
}

fn default_log_filter() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            command: None,
            args: Vec::new(),
            echo_available: default_echo_available(),
            echo_delay_ms: 0,
            stream_buffer: default_stream_buffer(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
            log_filter: default_log_filter(),
            log_file: None,
        }
    }
}

impl Config {
    /// 기본 설정 파일 경로 가져오기
    pub fn default_path() -> Result<PathBuf> {
        let home = dirs::home_dir()
            .ok_or_else(|| HostError::ConfigError("Could not find home directory".to_string()))?;
        Ok(home.join(".nativefm").join("config.toml"))
    }

    /// 설정 파일에서 로드 (없으면 기본값 사용)
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = match path {
            Some(path) => path.to_path_buf(),
            None => Self::default_path()?,
        };

        // 설정 파일이 없으면 기본값 반환
        if !config_path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(&config_path)?;
        toml::from_str(&content).map_err(|e| {
            HostError::ConfigError(format!("{}: {}", config_path.display(), e))
        })
    }
}
