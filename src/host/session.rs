use crate::backend::prompt_template::{PromptTemplate, Turn};
use crate::backend::{BackendError, BackendResult, GenerationBackend, ModelHandle};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard, RwLock};
use uuid::Uuid;

/// 멀티턴 대화 세션
///
/// 백엔드 핸들은 세션마다 따로 생성되며 다른 세션과 공유되지 않습니다.
pub struct Session {
    id: Uuid,
    handle: Arc<dyn ModelHandle>,
    /// 턴 전체 동안 잠김 - 같은 세션의 턴은 순서대로 실행
    transcript: Mutex<Vec<Turn>>,
}

impl Session {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn handle(&self) -> &Arc<dyn ModelHandle> {
        &self.handle
    }

    /// Wait for exclusive use of this session for one turn
    pub async fn begin_turn(&self) -> SessionTurn<'_> {
        SessionTurn {
            transcript: self.transcript.lock().await,
        }
    }

    pub async fn transcript_len(&self) -> usize {
        self.transcript.lock().await.len()
    }
}

/// One in-progress turn.
///
/// Dropping it without `commit` leaves the transcript untouched, which is
/// what happens to failed and cancelled turns.
pub struct SessionTurn<'a> {
    transcript: MutexGuard<'a, Vec<Turn>>,
}

impl SessionTurn<'_> {
    /// Full prompt for the backend: prior turns plus the new user message
    pub fn context(&self, prompt: &str) -> String {
        PromptTemplate::conversation_context(&self.transcript, prompt)
    }

    pub fn commit(mut self, prompt: &str, response: &str) {
        self.transcript.push(Turn::user(prompt));
        self.transcript.push(Turn::assistant(response));
    }
}

/// 세션 레지스트리
///
/// 호출자는 id만 보관하고, 세션 자체는 레지스트리가 소유합니다.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<Uuid, Arc<Session>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 새 세션 시작
    ///
    /// 백엔드를 사용할 수 없으면 `SessionNotAvailable`.
    pub async fn start(
        &self,
        backend: &dyn GenerationBackend,
        system_prompt: Option<&str>,
    ) -> BackendResult<Uuid> {
        if !backend.check_available().await {
            return Err(BackendError::SessionNotAvailable(format!(
                "Backend '{}' is not available",
                backend.name()
            )));
        }

        let handle = backend.open(system_prompt).await?;
        let id = Uuid::new_v4();
        let session = Arc::new(Session {
            id,
            handle,
            transcript: Mutex::new(Vec::new()),
        });

        self.sessions.write().await.insert(id, session);
        Ok(id)
    }

    /// 세션 조회 (잘못된 형식의 id도 "없음"으로 취급)
    pub async fn get(&self, session_id: &str) -> Option<Arc<Session>> {
        let id = Uuid::parse_str(session_id).ok()?;
        self.sessions.read().await.get(&id).cloned()
    }

    /// 세션 제거. 이미 없으면 아무 일도 하지 않음 (멱등)
    ///
    /// Returns whether a session was actually removed. A turn already running
    /// on the session keeps its own `Arc` and finishes normally.
    pub async fn end(&self, session_id: &str) -> bool {
        let Ok(id) = Uuid::parse_str(session_id) else {
            return false;
        };
        self.sessions.write().await.remove(&id).is_some()
    }

    /// 현재 세션 수
    pub async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::echo::EchoBackend;
    use crate::backend::GenerationOptions;
    use std::time::Duration;

    fn echo(available: bool) -> EchoBackend {
        EchoBackend::new(available, Duration::ZERO, 8)
    }

    #[tokio::test]
    async fn test_session_lifecycle() {
        let registry = SessionRegistry::new();
        let backend = echo(true);

        let id = registry.start(&backend, None).await.unwrap();
        assert_eq!(registry.count().await, 1);

        let session = registry.get(&id.to_string()).await.unwrap();
        assert_eq!(session.id(), id);

        assert!(registry.end(&id.to_string()).await);
        assert!(registry.get(&id.to_string()).await.is_none());
        assert_eq!(registry.count().await, 0);

        // 두 번째 종료도 에러 아님
        assert!(!registry.end(&id.to_string()).await);
        assert!(!registry.end("not-a-uuid").await);
    }

    #[tokio::test]
    async fn test_unavailable_backend() {
        let registry = SessionRegistry::new();
        let result = registry.start(&echo(false), Some("Be brief.")).await;

        assert!(matches!(result, Err(BackendError::SessionNotAvailable(_))));
        assert_eq!(registry.count().await, 0);
    }

    #[tokio::test]
    async fn test_sessions_get_distinct_ids() {
        let registry = SessionRegistry::new();
        let backend = echo(true);

        let a = registry.start(&backend, None).await.unwrap();
        let b = registry.start(&backend, None).await.unwrap();
        assert_ne!(a, b);
        assert_eq!(registry.count().await, 2);
    }

    #[tokio::test]
    async fn test_turn_commit_builds_context() {
        let registry = SessionRegistry::new();
        let id = registry.start(&echo(true), None).await.unwrap();
        let session = registry.get(&id.to_string()).await.unwrap();

        let turn = session.begin_turn().await;
        let context = turn.context("hi");
        assert_eq!(context, "User: hi");
        let reply = session
            .handle()
            .respond(&context, &GenerationOptions::default())
            .await
            .unwrap();
        turn.commit("hi", &reply);

        let turn = session.begin_turn().await;
        assert_eq!(turn.context("again"), "User: hi\nAssistant: hi\nUser: again");
    }

    #[tokio::test]
    async fn test_dropped_turn_leaves_no_trace() {
        let registry = SessionRegistry::new();
        let id = registry.start(&echo(true), None).await.unwrap();
        let session = registry.get(&id.to_string()).await.unwrap();

        {
            let _turn = session.begin_turn().await;
        }
        assert_eq!(session.transcript_len().await, 0);
    }

    #[tokio::test]
    async fn test_turns_on_one_session_are_serialized() {
        let registry = SessionRegistry::new();
        let id = registry.start(&echo(true), None).await.unwrap();
        let session = registry.get(&id.to_string()).await.unwrap();

        let first = session.begin_turn().await;
        let waiter = {
            let session = Arc::clone(&session);
            tokio::spawn(async move {
                let turn = session.begin_turn().await;
                turn.context("second")
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        first.commit("first", "ok");
        let context = waiter.await.unwrap();
        assert!(context.starts_with("User: first\nAssistant: ok"));
    }
}
