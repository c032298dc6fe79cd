//! Generation engine port
//!
//! A generation engine turns a prompt into a finite, lazily produced
//! sequence of UTF-8 text chunks. The scheduler treats it as opaque: it
//! only consumes chunks in order and hands the engine a cancellation token
//! so upstream work can be released promptly.

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::job_scheduling::JobId;

pub mod http;
pub mod scripted;

pub use http::HttpStreamEngine;
pub use scripted::{ScriptStep, ScriptedEngine};

/// Lazily produced text chunks; ends on completion or after the first error
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<String, GenerationError>> + Send>>;

/// Input handed to the engine for one job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub job_id: JobId,
    pub prompt: String,
    pub trace_id: Option<String>,
}

#[derive(Error, Debug)]
pub enum GenerationError {
    /// Failure reported by the model provider; the message is recorded verbatim
    #[error("{message}")]
    Provider { message: String },

    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Engine responded with HTTP {status}: {body}")]
    InvalidResponse { status: u16, body: String },

    #[error("Engine produced invalid UTF-8: {message}")]
    Encoding { message: String },

    #[error("Engine sent no response headers within {}", human_duration(.after))]
    ResponseTimeout { after: Duration },

    #[error("Engine sent no data for {}", human_duration(.idle))]
    IdleTimeout { idle: Duration },
}

fn human_duration(duration: &Duration) -> String {
    humantime::format_duration(*duration).to_string()
}

impl GenerationError {
    pub fn provider<S: Into<String>>(message: S) -> Self {
        Self::Provider {
            message: message.into(),
        }
    }
}

/// Streaming text producer
#[async_trait]
pub trait GenerationEngine: Send + Sync {
    /// Start generating for `request`
    ///
    /// Errors returned here mean the generation never started. Errors
    /// yielded by the stream mean it failed midway. Implementations should
    /// stop producing once `cancel` fires.
    async fn stream(
        &self,
        request: GenerationRequest,
        cancel: CancellationToken,
    ) -> Result<ChunkStream, GenerationError>;
}
