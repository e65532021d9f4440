use crate::backend::{GenerationBackend, GenerationOptions};
use crate::config::Config;
use crate::error::Result;
use crate::host::{HostServer, SessionRegistry};
use colored::*;
use std::sync::Arc;
use std::time::Duration;

/// 프로토콜 호스트 실행 (stdin/stdout)
///
/// 브라우저가 stdin을 닫으면 진행 중인 요청을 정리한 뒤 반환합니다.
pub async fn run_host(backend: Arc<dyn GenerationBackend>, config: &Config) -> Result<()> {
    let server = HostServer::new(backend, Duration::from_millis(config.shutdown_grace_ms));
    server.run(tokio::io::stdin(), tokio::io::stdout()).await
}

/// 백엔드 상태 진단 (--check)
///
/// 사용 가능 여부 확인 → 세션 생성 → 짧은 프로브 요청 순으로 점검합니다.
pub async fn check_backend(backend: Arc<dyn GenerationBackend>) -> Result<bool> {
    eprintln!(
        "{} Checking backend '{}'...\n",
        "[>>]".cyan().bold(),
        backend.name()
    );

    if !backend.check_available().await {
        eprintln!("{} Backend is not available.", "[X]".red());
        eprintln!("\n{} Check the `backend` and `command` entries in:", "[TIP]".cyan());
        eprintln!("  {}", "~/.nativefm/config.toml".yellow());
        return Ok(false);
    }
    eprintln!("{} Backend is available.", "[OK]".green().bold());

    let registry = SessionRegistry::new();
    let session_id = match registry.start(backend.as_ref(), None).await {
        Ok(id) => id.to_string(),
        Err(e) => {
            eprintln!("{} Failed to open a session: {}", "[X]".red(), e);
            return Ok(false);
        }
    };
    eprintln!("  [>] Session opened: {}", session_id);
    eprintln!("  [>] Live sessions: {}", registry.count().await);

    let probe = match registry.get(&session_id).await {
        Some(session) => {
            let turn = session.begin_turn().await;
            let options = GenerationOptions {
                max_response_tokens: 16,
                ..GenerationOptions::default()
            };
            session.handle().respond(&turn.context("ping"), &options).await
        }
        None => Ok(String::new()),
    };
    registry.end(&session_id).await;

    match probe {
        Ok(response) => {
            eprintln!(
                "{} Probe response received ({} chars).",
                "[v]".green(),
                response.chars().count()
            );
            Ok(true)
        }
        Err(e) => {
            eprintln!("{} Probe request failed: {}", "[X]".red(), e);
            Ok(false)
        }
    }
}
