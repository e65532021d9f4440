use crate::host::encoder::{now_epoch, short_id, ChunkPayload, ResponseEncoder};

/// Per-stream delta state; lives for exactly one streaming call
#[derive(Debug, Clone)]
pub struct StreamContext {
    pub id: String,
    pub created: i64,
    previous_content: String,
    is_first_chunk: bool,
}

impl StreamContext {
    pub fn new() -> Self {
        Self {
            id: short_id("chatcmpl"),
            created: now_epoch(),
            previous_content: String::new(),
            is_first_chunk: true,
        }
    }

    /// Text `current` adds on top of the previous snapshot.
    ///
    /// A snapshot that does not extend the previous one is passed through in
    /// full rather than failing the stream.
    pub fn delta(&mut self, current: &str) -> String {
        let delta = match current.strip_prefix(self.previous_content.as_str()) {
            Some(suffix) => suffix.to_string(),
            None => current.to_string(),
        };
        self.previous_content = current.to_string();
        delta
    }

    /// Latest snapshot seen
    pub fn content(&self) -> &str {
        &self.previous_content
    }
}

impl Default for StreamContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Builds the chunk sequence for one stream.
///
/// Backends report the whole response so far on every update; each snapshot
/// is reduced to what it appends. Output order is one role chunk, the content
/// chunks, then one terminal chunk.
#[derive(Debug)]
pub struct StreamReconstructor {
    context: StreamContext,
    session_id: Option<String>,
}

impl StreamReconstructor {
    pub fn new(session_id: Option<String>) -> Self {
        Self {
            context: StreamContext::new(),
            session_id,
        }
    }

    pub fn id(&self) -> &str {
        &self.context.id
    }

    pub fn content(&self) -> &str {
        self.context.content()
    }

    /// Chunks to emit for one snapshot: nothing, a content chunk, or the
    /// role chunk followed by the first content chunk.
    pub fn push(&mut self, cumulative: &str) -> Vec<ChunkPayload> {
        let delta = self.context.delta(cumulative);
        if delta.is_empty() {
            return Vec::new();
        }

        let mut chunks = Vec::with_capacity(2);
        if let Some(role) = self.take_role_chunk() {
            chunks.push(role);
        }
        chunks.push(self.tag(ResponseEncoder::content_chunk(
            &self.context.id,
            self.context.created,
            delta,
        )));
        chunks
    }

    /// Closing chunks. A stream that never produced content still gets its
    /// role chunk here, so every finished stream has exactly one.
    pub fn finish(&mut self) -> Vec<ChunkPayload> {
        let mut chunks = Vec::with_capacity(2);
        if let Some(role) = self.take_role_chunk() {
            chunks.push(role);
        }
        chunks.push(self.tag(ResponseEncoder::terminal_chunk(
            &self.context.id,
            self.context.created,
        )));
        chunks
    }

    fn take_role_chunk(&mut self) -> Option<ChunkPayload> {
        if !self.context.is_first_chunk {
            return None;
        }
        self.context.is_first_chunk = false;
        Some(self.tag(ResponseEncoder::role_chunk(
            &self.context.id,
            self.context.created,
        )))
    }

    fn tag(&self, mut chunk: ChunkPayload) -> ChunkPayload {
        chunk.session_id = self.session_id.clone();
        chunk
    }
}
