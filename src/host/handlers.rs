use crate::backend::{BackendError, BackendResult, ContentStream, GenerationBackend};
use crate::host::encoder::ResponseEncoder;
use crate::host::errors::{ErrorKind, ErrorMapper};
use crate::host::protocol::{Command, CompletionRequest, Request, Response, SessionMessage};
use crate::host::session::SessionRegistry;
use crate::host::stream::StreamReconstructor;
use crate::host::streams::{ActiveStreams, StreamRegistration};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Sending half of the single writer's queue.
///
/// Handlers report only through this; none of them touch stdout.
#[derive(Clone)]
pub struct Outbox {
    tx: mpsc::Sender<Response>,
}

impl Outbox {
    pub fn new(tx: mpsc::Sender<Response>) -> Self {
        Self { tx }
    }

    /// Queue a response; false once the writer is gone
    pub async fn send(&self, response: Response) -> bool {
        if self.tx.send(response).await.is_err() {
            debug!("Writer closed; response dropped");
            return false;
        }
        true
    }
}

/// 핸들러가 공유하는 상태
#[derive(Clone)]
pub struct HostContext {
    pub backend: Arc<dyn GenerationBackend>,
    pub sessions: Arc<SessionRegistry>,
    pub streams: Arc<ActiveStreams>,
    pub outbox: Outbox,
}

/// How a stream pump ended
enum StreamOutcome {
    Completed(String),
    Cancelled,
    Failed(BackendError),
}

/// Entry point for requests that run in their own task.
///
/// A panic inside the handler is reported as `native_error` for the same
/// request instead of leaving the caller waiting.
pub async fn handle_spawned(
    ctx: HostContext,
    request: Request,
    registration: Option<StreamRegistration>,
) {
    let request_id = request.request_id.clone();
    let outbox = ctx.outbox.clone();

    let result = AssertUnwindSafe(handle_backend(ctx, request, registration))
        .catch_unwind()
        .await;

    if result.is_err() {
        error!(request_id = %request_id, "Request handler panicked");
        outbox
            .send(Response::native_error(
                Some(request_id),
                "Internal error while handling request",
            ))
            .await;
    }
}

/// Commands that never wait on the backend; run on the read loop
pub async fn handle_inline(ctx: &HostContext, request: Request) {
    let Request {
        request_id,
        command,
    } = request;

    let response = match command {
        Command::EndSession { session_id } => {
            let removed = ctx.sessions.end(&session_id).await;
            let live_sessions = ctx.sessions.count().await;
            info!(session_id = %session_id, removed, live_sessions, "Playground session ended");
            Response::session_ended(&request_id, session_id)
        }
        Command::CancelStream { target } => {
            let cancelled = ctx.streams.cancel(&target);
            info!(request_id = %request_id, target = %target, cancelled, "Cancel stream");
            Response::cancel_ack(&request_id)
        }
        Command::Unknown(name) => {
            warn!(request_id = %request_id, command = %name, "Unknown command");
            Response::error_payload(
                Some(request_id),
                ResponseEncoder::error(
                    ErrorKind::UnknownCommand,
                    format!("Unknown command: {}", name),
                ),
            )
        }
        other => {
            // 라우팅 오류 - 백엔드 명령이 여기로 오면 안 됨
            error!(request_id = %request_id, command = other.name(), "Command routed to wrong handler");
            Response::native_error(Some(request_id), "Internal routing error")
        }
    };

    ctx.outbox.send(response).await;
}

async fn handle_backend(
    ctx: HostContext,
    request: Request,
    registration: Option<StreamRegistration>,
) {
    let Request {
        request_id,
        command,
    } = request;

    match command {
        Command::CheckAvailability => {
            let available = ctx.backend.check_available().await;
            debug!(request_id = %request_id, available, "Availability checked");
            ctx.outbox
                .send(Response::availability(&request_id, available))
                .await;
        }
        Command::GetCompletion(completion)
        | Command::ChatCompletion {
            request: completion,
            stream: false,
        } => complete(&ctx, &request_id, completion).await,
        Command::GetCompletionStream(completion)
        | Command::ChatCompletion {
            request: completion,
            stream: true,
        } => {
            let registration = registration.unwrap_or_else(|| ctx.streams.register(&request_id));
            stream_completion(&ctx, &request_id, completion, registration).await
        }
        Command::StartSession { system_prompt } => {
            start_session(&ctx, &request_id, system_prompt.as_deref()).await
        }
        Command::SendMessage(message) => {
            let registration = registration.unwrap_or_else(|| ctx.streams.register(&request_id));
            send_message(&ctx, &request_id, message, registration).await
        }
        other => {
            handle_inline(
                &ctx,
                Request {
                    request_id,
                    command: other,
                },
            )
            .await
        }
    }
}

async fn complete(ctx: &HostContext, request_id: &str, completion: CompletionRequest) {
    match respond(ctx.backend.as_ref(), &completion).await {
        Ok(content) => {
            debug!(request_id = %request_id, chars = content.chars().count(), "Completion finished");
            ctx.outbox
                .send(Response::completion(request_id, content))
                .await;
        }
        Err(e) => send_backend_error(ctx, request_id, &e, None).await,
    }
}

async fn stream_completion(
    ctx: &HostContext,
    request_id: &str,
    completion: CompletionRequest,
    registration: StreamRegistration,
) {
    let stream = open_stream(ctx.backend.as_ref(), &completion).await;
    let outcome = match stream {
        Ok(stream) => pump(ctx, request_id, stream, registration.token(), None).await,
        Err(e) => StreamOutcome::Failed(e),
    };

    match outcome {
        StreamOutcome::Completed(content) => {
            debug!(request_id = %request_id, chars = content.chars().count(), "Stream finished");
        }
        StreamOutcome::Cancelled => {
            info!(request_id = %request_id, "Stream cancelled");
        }
        StreamOutcome::Failed(e) => send_backend_error(ctx, request_id, &e, None).await,
    }
}

async fn respond(
    backend: &dyn GenerationBackend,
    completion: &CompletionRequest,
) -> BackendResult<String> {
    let handle = backend.open(completion.system_prompt.as_deref()).await?;
    handle.respond(&completion.prompt, &completion.options).await
}

async fn open_stream(
    backend: &dyn GenerationBackend,
    completion: &CompletionRequest,
) -> BackendResult<ContentStream> {
    let handle = backend.open(completion.system_prompt.as_deref()).await?;
    handle.stream(&completion.prompt, &completion.options).await
}

async fn start_session(ctx: &HostContext, request_id: &str, system_prompt: Option<&str>) {
    match ctx.sessions.start(ctx.backend.as_ref(), system_prompt).await {
        Ok(session_id) => {
            let live_sessions = ctx.sessions.count().await;
            info!(session_id = %session_id, live_sessions, "Playground session started");
            ctx.outbox
                .send(Response::session_started(request_id, session_id.to_string()))
                .await;
        }
        Err(e) => send_backend_error(ctx, request_id, &e, None).await,
    }
}

async fn send_message(
    ctx: &HostContext,
    request_id: &str,
    message: SessionMessage,
    registration: StreamRegistration,
) {
    let session_id = message.session_id.as_str();
    let Some(session) = ctx.sessions.get(session_id).await else {
        warn!(request_id = %request_id, session_id = %session_id, "Session not found");
        let payload = ResponseEncoder::error(
            ErrorKind::SessionNotAvailable,
            format!("Session not found: {}", session_id),
        )
        .with_session(session_id);
        ctx.outbox
            .send(Response::error_payload(Some(request_id.to_string()), payload))
            .await;
        return;
    };

    // 같은 세션의 다른 턴이 끝날 때까지 대기 (대기 중 취소되면 생성 시작 안 함)
    let turn = tokio::select! {
        biased;
        _ = registration.token().cancelled() => {
            info!(request_id = %request_id, session_id = %session_id, "Session turn cancelled before start");
            return;
        }
        turn = session.begin_turn() => turn,
    };
    let context = turn.context(&message.prompt);

    let outcome = match session.handle().stream(&context, &message.options).await {
        Ok(stream) => {
            pump(
                ctx,
                request_id,
                stream,
                registration.token(),
                Some(session_id),
            )
            .await
        }
        Err(e) => StreamOutcome::Failed(e),
    };

    match outcome {
        StreamOutcome::Completed(content) => {
            turn.commit(&message.prompt, &content);
            let turns = session.transcript_len().await;
            debug!(request_id = %request_id, session_id = %session.id(), turns, "Session turn committed");
        }
        StreamOutcome::Cancelled => {
            info!(request_id = %request_id, session_id = %session_id, "Session turn cancelled");
        }
        StreamOutcome::Failed(e) => {
            send_backend_error(ctx, request_id, &e, Some(session_id)).await
        }
    }
}

/// Forward a backend stream as chunk responses until it ends or is cancelled.
///
/// Returning drops `stream`, which stops the producer.
async fn pump(
    ctx: &HostContext,
    request_id: &str,
    mut stream: ContentStream,
    token: &CancellationToken,
    session_id: Option<&str>,
) -> StreamOutcome {
    let mut reconstructor = StreamReconstructor::new(session_id.map(str::to_string));
    debug!(request_id = %request_id, stream_id = reconstructor.id(), "Stream opened");

    loop {
        let item = tokio::select! {
            biased;
            _ = token.cancelled() => return StreamOutcome::Cancelled,
            item = stream.recv() => item,
        };

        match item {
            Some(Ok(snapshot)) => {
                for chunk in reconstructor.push(&snapshot) {
                    if token.is_cancelled() {
                        return StreamOutcome::Cancelled;
                    }
                    if !ctx.outbox.send(Response::chunk(request_id, chunk)).await {
                        return StreamOutcome::Cancelled;
                    }
                }
            }
            Some(Err(e)) => return StreamOutcome::Failed(e),
            None => break,
        }
    }

    if token.is_cancelled() {
        return StreamOutcome::Cancelled;
    }
    for chunk in reconstructor.finish() {
        ctx.outbox.send(Response::chunk(request_id, chunk)).await;
    }
    StreamOutcome::Completed(reconstructor.content().to_string())
}

/// 백엔드 에러는 반드시 ErrorMapper를 거쳐서 전송
async fn send_backend_error(
    ctx: &HostContext,
    request_id: &str,
    error: &BackendError,
    session_id: Option<&str>,
) {
    let mapped = ErrorMapper::map(error);
    warn!(request_id = %request_id, kind = %mapped.kind, error = %error, "Backend request failed");

    let mut payload = ResponseEncoder::mapped_error(&mapped);
    if let Some(session_id) = session_id {
        payload = payload.with_session(session_id);
    }
    ctx.outbox
        .send(Response::error_payload(Some(request_id.to_string()), payload))
        .await;
}
