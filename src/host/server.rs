use crate::backend::GenerationBackend;
use crate::error::{HostError, Result};
use crate::host::handlers::{self, HostContext, Outbox};
use crate::host::protocol::{Request, Response};
use crate::host::session::SessionRegistry;
use crate::host::streams::ActiveStreams;
use crate::host::errors::MappedError;
use crate::host::transport::{FrameReader, FrameWriter};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Writer 큐 크기 - 가득 차면 핸들러가 대기 (backpressure)
const OUTBOX_CAPACITY: usize = 256;

/// Native messaging host
///
/// 하나의 reader 루프가 stdin에서 프레임을 읽고, 백엔드 작업이 필요한 요청은
/// 각각 별도 태스크로 실행합니다. 모든 응답은 단일 writer 태스크를 거쳐 stdout으로
/// 나가므로 프레임이 섞이지 않습니다.
pub struct HostServer {
    backend: Arc<dyn GenerationBackend>,
    sessions: Arc<SessionRegistry>,
    streams: Arc<ActiveStreams>,
    shutdown_grace: Duration,
}

impl HostServer {
    pub fn new(backend: Arc<dyn GenerationBackend>, shutdown_grace: Duration) -> Self {
        Self {
            backend,
            sessions: Arc::new(SessionRegistry::new()),
            streams: Arc::new(ActiveStreams::new()),
            shutdown_grace,
        }
    }

    /// Serve until the peer closes its end of `reader`.
    ///
    /// On return, in-flight requests have finished or been aborted and every
    /// queued response has been written.
    pub async fn run<R, W>(&self, reader: R, writer: W) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(OUTBOX_CAPACITY);
        let writer_task = tokio::spawn(write_loop(rx, writer));

        let ctx = HostContext {
            backend: Arc::clone(&self.backend),
            sessions: Arc::clone(&self.sessions),
            streams: Arc::clone(&self.streams),
            outbox: Outbox::new(tx),
        };

        info!(backend = self.backend.name(), "Host ready");

        let mut frames = FrameReader::new(reader);
        let mut tasks = JoinSet::new();

        loop {
            // 끝난 태스크 정리
            while let Some(joined) = tasks.try_join_next() {
                log_join(joined);
            }

            match frames.read_frame().await {
                Ok(bytes) => self.dispatch(&ctx, &bytes, &mut tasks).await,
                Err(e) if e.is_fatal() => {
                    info!("Input closed ({}); shutting down", e);
                    break;
                }
                Err(e) => {
                    warn!("Dropping frame: {}", e);
                    let error = match &e {
                        HostError::InvalidLength(length) => {
                            MappedError::malformed(format!("Invalid message length: {}", length))
                        }
                        other => MappedError::malformed(other.to_string()),
                    };
                    ctx.outbox.send(Response::error(None, &error)).await;
                }
            }
        }

        self.drain(&mut tasks).await;

        // 마지막 sender가 사라지면 writer가 큐를 비우고 종료
        drop(ctx);
        if let Err(e) = writer_task.await {
            error!("Writer task failed: {}", e);
        }

        let live_sessions = self.sessions.count().await;
        info!(live_sessions, "Host stopped");
        Ok(())
    }

    async fn dispatch(&self, ctx: &HostContext, bytes: &[u8], tasks: &mut JoinSet<()>) {
        let request = match Request::decode(bytes) {
            Ok(request) => request,
            Err(e) => {
                warn!(request_id = ?e.request_id, "Malformed message: {}", e.error.message);
                ctx.outbox.send(e.into_response()).await;
                return;
            }
        };

        debug!(
            request_id = %request.request_id,
            command = request.command.name(),
            "Request received"
        );

        if request.command.needs_backend() {
            // 취소 요청이 곧바로 와도 찾을 수 있도록 spawn 전에 등록
            let registration = request
                .command
                .is_streaming()
                .then(|| self.streams.register(&request.request_id));
            tasks.spawn(handlers::handle_spawned(ctx.clone(), request, registration));
        } else {
            handlers::handle_inline(ctx, request).await;
        }
    }

    /// Give in-flight tasks the grace period, then abort the rest
    async fn drain(&self, tasks: &mut JoinSet<()>) {
        if tasks.is_empty() {
            return;
        }

        debug!(
            in_flight = tasks.len(),
            open_streams = self.streams.len(),
            "Waiting for in-flight requests"
        );
        let finished = tokio::time::timeout(self.shutdown_grace, async {
            while let Some(joined) = tasks.join_next().await {
                log_join(joined);
            }
        })
        .await;

        if finished.is_err() {
            warn!(
                in_flight = tasks.len(),
                "Shutdown grace period elapsed; aborting requests"
            );
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
        }
    }
}

fn log_join(joined: std::result::Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        if e.is_panic() {
            error!("Request task panicked: {}", e);
        } else {
            debug!("Request task ended: {}", e);
        }
    }
}

/// The only owner of the output stream
async fn write_loop<W>(mut rx: mpsc::Receiver<Response>, writer: W)
where
    W: AsyncWrite + Unpin,
{
    let mut writer = FrameWriter::new(writer);

    while let Some(response) = rx.recv().await {
        let bytes = match response.to_json() {
            Ok(bytes) => bytes,
            Err(e) => {
                error!("Failed to serialize response: {}", e);
                continue;
            }
        };

        match writer.write_frame(&bytes).await {
            Ok(()) => {
                debug!(request_id = ?response.request_id, kind = ?response.kind, "Response sent");
            }
            Err(HostError::OutboundLength(length)) => {
                warn!(
                    request_id = ?response.request_id,
                    length,
                    "Response exceeds frame limit; sending native_error instead"
                );
                let fallback = Response::native_error(
                    response.request_id.clone(),
                    format!("Response too large to send ({} bytes)", length),
                );
                if let Err(e) = write_response(&mut writer, &fallback).await {
                    error!("Failed to write frame: {}", e);
                    break;
                }
            }
            Err(e) => {
                error!("Failed to write frame: {}", e);
                break;
            }
        }
    }
}

async fn write_response<W>(writer: &mut FrameWriter<W>, response: &Response) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let bytes = response.to_json()?;
    writer.write_frame(&bytes).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::echo::EchoBackend;
    use crate::backend::{
        BackendError, BackendResult, ContentStream, GenerationOptions, ModelHandle,
    };
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use crate::host::transport::encode_frame;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncWriteExt, DuplexStream};

    /// 테스트용 백엔드: 고정된 스냅샷 / 에러 / panic
    struct ScriptedBackend {
        snapshots: Vec<&'static str>,
        failure: Option<BackendError>,
        panic_on_respond: bool,
    }

    struct ScriptedHandle {
        snapshots: Vec<&'static str>,
        failure: Option<BackendError>,
        panic_on_respond: bool,
    }

    #[async_trait]
    impl GenerationBackend for ScriptedBackend {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn check_available(&self) -> bool {
            true
        }

        async fn open(&self, _instructions: Option<&str>) -> BackendResult<Arc<dyn ModelHandle>> {
            Ok(Arc::new(ScriptedHandle {
                snapshots: self.snapshots.clone(),
                failure: self.failure.clone(),
                panic_on_respond: self.panic_on_respond,
            }))
        }
    }

    #[async_trait]
    impl ModelHandle for ScriptedHandle {
        async fn respond(&self, _prompt: &str, _options: &GenerationOptions) -> BackendResult<String> {
            if self.panic_on_respond {
                panic!("scripted panic");
            }
            match &self.failure {
                Some(e) => Err(e.clone()),
                None => Ok(self.snapshots.last().copied().unwrap_or("").to_string()),
            }
        }

        async fn stream(&self, _prompt: &str, _options: &GenerationOptions) -> BackendResult<ContentStream> {
            let (tx, rx) = tokio::sync::mpsc::channel(8);
            let snapshots = self.snapshots.clone();
            let failure = self.failure.clone();
            tokio::spawn(async move {
                for snapshot in snapshots {
                    if tx.send(Ok(snapshot.to_string())).await.is_err() {
                        return;
                    }
                }
                if let Some(e) = failure {
                    let _ = tx.send(Err(e)).await;
                }
            });
            Ok(rx)
        }
    }

    struct Client {
        writer: Option<DuplexStream>,
        reader: FrameReader<DuplexStream>,
        server: tokio::task::JoinHandle<Result<()>>,
    }

    impl Client {
        fn start(backend: Arc<dyn GenerationBackend>) -> Self {
            // stdin / stdout 역할의 파이프 두 개
            let (client_in, server_in) = tokio::io::duplex(1024 * 1024);
            let (server_out, client_out) = tokio::io::duplex(1024 * 1024);

            let server = tokio::spawn(async move {
                let host = HostServer::new(backend, Duration::from_secs(2));
                host.run(server_in, server_out).await
            });

            Self {
                writer: Some(client_in),
                reader: FrameReader::new(client_out),
                server,
            }
        }

        fn echo(delay_ms: u64) -> Self {
            Self::start(Arc::new(EchoBackend::new(
                true,
                Duration::from_millis(delay_ms),
                8,
            )))
        }

        async fn send_raw(&mut self, bytes: &[u8]) {
            let writer = self.writer.as_mut().unwrap();
            writer.write_all(bytes).await.unwrap();
        }

        async fn send(&mut self, message: Value) {
            let frame = encode_frame(message.to_string().as_bytes()).unwrap();
            self.send_raw(&frame).await;
        }

        async fn request(&mut self, request_id: &str, command: &str, payload: Value) {
            self.send(json!({"requestId": request_id, "command": command, "payload": payload}))
                .await;
        }

        async fn recv(&mut self) -> Value {
            let frame = tokio::time::timeout(Duration::from_secs(5), self.reader.read_frame())
                .await
                .expect("timed out waiting for a response")
                .unwrap();
            serde_json::from_slice(&frame).unwrap()
        }

        /// `done`이 참이 되는 응답까지 수집 (그 사이의 다른 응답 포함)
        async fn recv_until(&mut self, done: impl Fn(&Value) -> bool) -> Vec<Value> {
            let mut received = Vec::new();
            loop {
                let value = self.recv().await;
                let finished = done(&value);
                received.push(value);
                if finished {
                    return received;
                }
            }
        }

        async fn close(mut self) -> Result<()> {
            self.writer.take();
            self.server.await.unwrap()
        }
    }

    fn is_final_for(request_id: &str) -> impl Fn(&Value) -> bool + '_ {
        move |value| {
            value["requestId"] == request_id
                && value["type"] != "streamChunk"
        }
    }

    async fn start_session(client: &mut Client, request_id: &str) -> String {
        client.request(request_id, "startPlaygroundSession", json!({})).await;
        let response = client.recv().await;
        assert_eq!(response["type"], "playgroundSessionStarted");
        response["payload"]["sessionId"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn test_unknown_command() {
        let mut client = Client::echo(0);
        client.request("r1", "bogus", json!({})).await;

        let response = client.recv().await;
        assert_eq!(response["requestId"], "r1");
        assert_eq!(response["type"], "error");
        assert_eq!(response["payload"]["error"]["type"], "unknownCommand");
        assert_eq!(response["payload"]["error"]["message"], "Unknown command: bogus");

        client.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_length_is_not_fatal() {
        let mut client = Client::echo(0);
        // 길이 0 헤더 (본문 없음)
        client.send_raw(&0u32.to_le_bytes()).await;

        let response = client.recv().await;
        assert!(response.get("requestId").is_none());
        assert_eq!(response["payload"]["error"]["type"], "malformedMessage");

        client.request("r2", "checkAvailability", json!({})).await;
        let response = client.recv().await;
        assert_eq!(response["requestId"], "r2");
        assert_eq!(response["payload"]["available"], true);

        client.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_json_gets_error_without_request_id() {
        let mut client = Client::echo(0);
        client.send_raw(&encode_frame(b"{oops").unwrap()).await;

        let response = client.recv().await;
        assert!(response.get("requestId").is_none());
        assert_eq!(response["type"], "error");
        assert_eq!(response["payload"]["error"]["code"], "malformedMessage");

        client.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_get_completion() {
        let mut client = Client::echo(0);
        client
            .request("r1", "getCompletion", json!({"prompt": "hello there"}))
            .await;

        let response = client.recv().await;
        assert_eq!(response["requestId"], "r1");
        assert_eq!(response["type"], "completionResponse");
        assert_eq!(
            response["payload"]["choices"][0]["message"]["content"],
            "hello there"
        );

        client.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_stream_chunks_share_id_and_end_with_stop() {
        let mut client = Client::echo(0);
        client
            .request("r1", "getCompletionStream", json!({"prompt": "one two three"}))
            .await;

        let responses = client.recv_until(is_final_for("r1")).await;
        let first = &responses[0];
        assert_eq!(first["type"], "streamChunk");
        assert_eq!(first["payload"]["choices"][0]["delta"], json!({"role": "assistant"}));

        let last = responses.last().unwrap();
        assert_eq!(last["type"], "streamEnd");
        assert_eq!(last["payload"]["choices"][0]["finish_reason"], "stop");

        let id = &first["payload"]["id"];
        assert!(responses.iter().all(|r| &r["payload"]["id"] == id));

        let content: String = responses
            .iter()
            .filter_map(|r| r["payload"]["choices"][0]["delta"]["content"].as_str())
            .collect();
        assert_eq!(content, "one two three");

        client.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_session_lifecycle() {
        let mut client = Client::echo(0);
        let session_id = start_session(&mut client, "r1").await;

        client
            .request("r2", "sendPlaygroundMessage", json!({"sessionId": session_id, "prompt": "hi"}))
            .await;
        let responses = client.recv_until(is_final_for("r2")).await;
        assert_eq!(responses.last().unwrap()["type"], "streamEnd");
        assert!(responses
            .iter()
            .all(|r| r["payload"]["sessionId"] == session_id.as_str()));

        for request_id in ["r3", "r4"] {
            client
                .request(request_id, "endPlaygroundSession", json!({"sessionId": session_id}))
                .await;
            let response = client.recv().await;
            assert_eq!(response["type"], "sessionEnded");
            assert_eq!(response["payload"]["sessionId"], session_id.as_str());
        }

        client
            .request("r5", "sendPlaygroundMessage", json!({"sessionId": session_id, "prompt": "hi"}))
            .await;
        let response = client.recv().await;
        assert_eq!(response["requestId"], "r5");
        assert_eq!(response["payload"]["error"]["type"], "sessionNotAvailable");
        assert_eq!(
            response["payload"]["error"]["message"],
            format!("Session not found: {}", session_id)
        );
        assert_eq!(response["payload"]["sessionId"], session_id.as_str());

        client.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_sessions_are_isolated() {
        let mut client = Client::echo(5);
        let a = start_session(&mut client, "start-a").await;
        let b = start_session(&mut client, "start-b").await;

        client
            .request("a", "sendPlaygroundMessage", json!({"sessionId": a, "prompt": "alpha beta gamma delta"}))
            .await;
        client
            .request("b", "sendPlaygroundMessage", json!({"sessionId": b, "prompt": "one two three four"}))
            .await;

        let mut ended = HashSet::new();
        let mut chunk_ids: Vec<(String, String)> = Vec::new();
        while ended.len() < 2 {
            let response = client.recv().await;
            let request_id = response["requestId"].as_str().unwrap().to_string();
            assert!(request_id == "a" || request_id == "b");

            let expected_session = if request_id == "a" { &a } else { &b };
            assert_eq!(response["payload"]["sessionId"], expected_session.as_str());

            chunk_ids.push((
                request_id.clone(),
                response["payload"]["id"].as_str().unwrap().to_string(),
            ));
            if response["type"] == "streamEnd" {
                ended.insert(request_id);
            }
        }

        // 요청마다 하나의 청크 id
        let ids: HashSet<_> = chunk_ids.iter().collect();
        assert_eq!(ids.len(), 2);

        client.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_same_session_turns_do_not_interleave() {
        let mut client = Client::echo(5);
        let session_id = start_session(&mut client, "start").await;

        client
            .request("t1", "sendPlaygroundMessage", json!({"sessionId": session_id, "prompt": "a b c d"}))
            .await;
        client
            .request("t2", "sendPlaygroundMessage", json!({"sessionId": session_id, "prompt": "e f g h"}))
            .await;

        let mut order = Vec::new();
        let mut ended = 0;
        while ended < 2 {
            let response = client.recv().await;
            order.push(response["requestId"].as_str().unwrap().to_string());
            if response["type"] == "streamEnd" {
                ended += 1;
            }
        }

        // 한 턴의 프레임이 모두 끝난 뒤에 다음 턴이 시작
        let switches = order.windows(2).filter(|pair| pair[0] != pair[1]).count();
        assert_eq!(switches, 1, "{:?}", order);

        client.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel_stream() {
        let mut client = Client::echo(50);
        let prompt = (0..40).map(|i| format!("w{}", i)).collect::<Vec<_>>().join(" ");
        client
            .request("r1", "getCompletionStream", json!({"prompt": prompt}))
            .await;

        let first = client.recv().await;
        assert_eq!(first["type"], "streamChunk");

        client
            .request("c1", "cancelStream", json!({"requestId": "r1"}))
            .await;
        let responses = client.recv_until(|value| value["requestId"] == "c1").await;
        let ack = responses.last().unwrap();
        assert_eq!(ack["type"], "streamEnd");
        assert_eq!(ack["payload"], json!({"success": true}));

        // 취소 후에는 더 이상 청크가 오지 않음
        tokio::time::sleep(Duration::from_millis(200)).await;
        client.request("r2", "checkAvailability", json!({})).await;
        let after = client.recv_until(is_final_for("r2")).await;
        // 취소와 동시에 보내진 청크 하나까지만 허용
        assert!(after.len() <= 2, "{:?}", after);
        assert!(responses
            .iter()
            .chain(after.iter())
            .filter(|r| r["requestId"] == "r1")
            .all(|r| r["type"] == "streamChunk"));

        // 없는 스트림 취소도 같은 응답
        client.request("c2", "cancelStream", json!({"requestId": "r1"})).await;
        let response = client.recv().await;
        assert_eq!(response["requestId"], "c2");
        assert_eq!(response["type"], "streamEnd");
        assert_eq!(response["payload"], json!({"success": true}));

        client.close().await.unwrap();
    }

    /// stream() 호출 횟수를 세는 echo 래퍼
    struct CountingBackend {
        inner: EchoBackend,
        streams_opened: Arc<AtomicUsize>,
    }

    struct CountingHandle {
        inner: Arc<dyn ModelHandle>,
        streams_opened: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl GenerationBackend for CountingBackend {
        fn name(&self) -> &str {
            "counting"
        }

        async fn check_available(&self) -> bool {
            self.inner.check_available().await
        }

        async fn open(&self, instructions: Option<&str>) -> BackendResult<Arc<dyn ModelHandle>> {
            Ok(Arc::new(CountingHandle {
                inner: self.inner.open(instructions).await?,
                streams_opened: Arc::clone(&self.streams_opened),
            }))
        }
    }

    #[async_trait]
    impl ModelHandle for CountingHandle {
        async fn respond(&self, prompt: &str, options: &GenerationOptions) -> BackendResult<String> {
            self.inner.respond(prompt, options).await
        }

        async fn stream(&self, prompt: &str, options: &GenerationOptions) -> BackendResult<ContentStream> {
            self.streams_opened.fetch_add(1, Ordering::SeqCst);
            self.inner.stream(prompt, options).await
        }
    }

    #[tokio::test]
    async fn test_cancelled_queued_turn_never_starts_generation() {
        let streams_opened = Arc::new(AtomicUsize::new(0));
        let mut client = Client::start(Arc::new(CountingBackend {
            inner: EchoBackend::new(true, Duration::from_millis(20), 8),
            streams_opened: Arc::clone(&streams_opened),
        }));
        let session_id = start_session(&mut client, "start").await;

        client
            .request(
                "t1",
                "sendPlaygroundMessage",
                json!({"sessionId": session_id, "prompt": "a b c d e f g h i j"}),
            )
            .await;
        // 첫 청크가 왔으면 t1이 세션 턴을 잡고 있음
        assert_eq!(client.recv().await["requestId"], "t1");

        client
            .request("t2", "sendPlaygroundMessage", json!({"sessionId": session_id, "prompt": "queued"}))
            .await;
        client
            .request("c1", "cancelStream", json!({"requestId": "t2"}))
            .await;

        let mut responses = client.recv_until(|value| value["requestId"] == "c1").await;
        if !responses.iter().any(is_final_for("t1")) {
            responses.extend(client.recv_until(is_final_for("t1")).await);
        }
        assert_eq!(responses.last().unwrap()["type"], "streamEnd");

        // t1이 턴을 놓은 뒤에도 t2는 생성을 시작하지 않음
        tokio::time::sleep(Duration::from_millis(100)).await;
        client.request("r1", "checkAvailability", json!({})).await;
        let after = client.recv_until(is_final_for("r1")).await;

        assert_eq!(streams_opened.load(Ordering::SeqCst), 1);
        assert!(responses
            .iter()
            .chain(after.iter())
            .all(|r| r["requestId"] != "t2"));

        client.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_backend_error_is_mapped() {
        let mut client = Client::start(Arc::new(ScriptedBackend {
            snapshots: vec!["partial"],
            failure: Some(BackendError::GuardrailViolation(
                "blocked by classifier".to_string(),
            )),
            panic_on_respond: false,
        }));

        client.request("r1", "getCompletion", json!({"prompt": "x"})).await;
        let response = client.recv().await;
        assert_eq!(response["type"], "error");
        assert_eq!(response["payload"]["error"]["type"], "guardrailViolation");
        assert!(!response["payload"]["error"]["message"]
            .as_str()
            .unwrap()
            .contains("classifier"));

        // 스트림 중간 실패: 이미 보낸 청크 뒤에 에러, 종료 청크 없음
        client
            .request("r2", "getCompletionStream", json!({"prompt": "x"}))
            .await;
        let responses = client.recv_until(is_final_for("r2")).await;
        assert_eq!(responses.last().unwrap()["type"], "error");
        assert!(responses.iter().all(|r| r["type"] != "streamEnd"));

        client.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_handler_panic_becomes_native_error() {
        let mut client = Client::start(Arc::new(ScriptedBackend {
            snapshots: vec![],
            failure: None,
            panic_on_respond: true,
        }));

        client.request("r1", "getCompletion", json!({"prompt": "x"})).await;
        let response = client.recv().await;
        assert_eq!(response["requestId"], "r1");
        assert_eq!(response["payload"]["error"]["type"], "native_error");

        // 호스트는 계속 동작
        client.request("r2", "checkAvailability", json!({})).await;
        assert_eq!(client.recv().await["requestId"], "r2");

        client.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_in_flight_requests_drain_on_eof() {
        let mut client = Client::echo(10);
        client
            .request("r1", "getCompletionStream", json!({"prompt": "a b c"}))
            .await;
        client.writer.take();

        let responses = client.recv_until(is_final_for("r1")).await;
        assert_eq!(responses.last().unwrap()["type"], "streamEnd");
        client.server.await.unwrap().unwrap();
    }
}
