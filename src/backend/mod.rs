pub mod command;
pub mod echo;
pub mod error;
pub mod factory;
pub mod options;
pub mod prompt_template;

pub use error::BackendError;
pub use options::GenerationOptions;

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// Incremental output of one generation call.
///
/// Every item is the full content generated so far, not an increment. The
/// producer stops once the receiver is dropped, so dropping the stream is how
/// a caller cancels generation.
pub type ContentStream = mpsc::Receiver<BackendResult<String>>;

/// Language-model backend trait for pluggable inference engines
#[async_trait]
pub trait GenerationBackend: Send + Sync {
    /// Backend name (e.g., "echo", "command")
    fn name(&self) -> &str;

    /// Check whether the model can currently serve requests
    async fn check_available(&self) -> bool;

    /// Create a handle scoped to optional system instructions.
    ///
    /// Fails with `SessionNotAvailable` when the model cannot be initialised.
    async fn open(&self, instructions: Option<&str>) -> BackendResult<Arc<dyn ModelHandle>>;
}

/// A model instance bound to one set of instructions.
///
/// Handles carry no conversation history; callers build the full context.
#[async_trait]
pub trait ModelHandle: Send + Sync {
    /// Generate a complete response
    async fn respond(&self, prompt: &str, options: &GenerationOptions) -> BackendResult<String>;

    /// Start generating and return a stream of cumulative snapshots
    async fn stream(&self, prompt: &str, options: &GenerationOptions) -> BackendResult<ContentStream>;
}

/// Instructions with empty text are treated as absent
pub(crate) fn normalize_instructions(instructions: Option<&str>) -> Option<String> {
    instructions
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .map(str::to_string)
}
