use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio_util::sync::CancellationToken;

/// In-flight streams by `requestId`
///
/// 스트리밍 태스크는 시작 전에 등록하고, 끝나면 (성공/실패/취소/abort 모두)
/// `StreamRegistration`이 drop되면서 자동으로 제거됩니다.
#[derive(Default)]
pub struct ActiveStreams {
    entries: Mutex<HashMap<String, (u64, CancellationToken)>>,
    generation: AtomicU64,
}

impl ActiveStreams {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a stream under `request_id`.
    ///
    /// A caller reusing an id that is still streaming replaces the earlier
    /// entry; the earlier stream can then no longer be cancelled by id.
    pub fn register(self: &Arc<Self>, request_id: &str) -> StreamRegistration {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        self.lock()
            .insert(request_id.to_string(), (generation, token.clone()));

        StreamRegistration {
            streams: Arc::clone(self),
            request_id: request_id.to_string(),
            generation,
            token,
        }
    }

    /// Cancel and forget the stream registered under `request_id`
    pub fn cancel(&self, request_id: &str) -> bool {
        match self.lock().remove(request_id) {
            Some((_, token)) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    fn release(&self, request_id: &str, generation: u64) {
        let mut entries = self.lock();
        // 같은 id로 새로 등록된 스트림은 건드리지 않음
        if entries.get(request_id).map(|(g, _)| *g) == Some(generation) {
            entries.remove(request_id);
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, (u64, CancellationToken)>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Handle held by one streaming task for its whole lifetime
pub struct StreamRegistration {
    streams: Arc<ActiveStreams>,
    request_id: String,
    generation: u64,
    token: CancellationToken,
}

impl StreamRegistration {
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl Drop for StreamRegistration {
    fn drop(&mut self) {
        self.streams.release(&self.request_id, self.generation);
    }
}
