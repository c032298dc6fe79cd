//! HTTP streaming generation engine
//!
//! POSTs `{ "prompt", "trace_id" }` as JSON and reads the response body as
//! plain UTF-8 text, yielding each decoded network chunk.

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{ChunkStream, GenerationEngine, GenerationError, GenerationRequest};
use crate::config::EngineConfig;

/// Upper bound on error bodies copied into job errors
const MAX_ERROR_BODY_CHARS: usize = 512;

#[derive(Debug, Clone)]
pub struct HttpStreamEngine {
    client: Client,
    endpoint: String,
    api_key: Option<String>,
    request_timeout: Duration,
    idle_timeout: Option<Duration>,
}

#[derive(Serialize)]
struct GenerateBody<'a> {
    prompt: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    trace_id: Option<&'a str>,
}

impl HttpStreamEngine {
    pub fn new(config: &EngineConfig) -> Result<Self, GenerationError> {
        // no client-wide timeout: it would also cover the streamed body
        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .user_agent(concat!("newsletter-queue/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            api_key: config.api_key.clone(),
            request_timeout: config.request_timeout,
            idle_timeout: config.idle_timeout,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl GenerationEngine for HttpStreamEngine {
    async fn stream(
        &self,
        request: GenerationRequest,
        cancel: CancellationToken,
    ) -> Result<ChunkStream, GenerationError> {
        debug!(
            "Requesting generation for job {} from {}",
            request.job_id, self.endpoint
        );

        let mut builder = self.client.post(&self.endpoint).json(&GenerateBody {
            prompt: &request.prompt,
            trace_id: request.trace_id.as_deref(),
        });
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("Generation for job {} cancelled before response", request.job_id);
                return Ok(Box::pin(futures::stream::empty()));
            }
            response = tokio::time::timeout(self.request_timeout, builder.send()) => {
                response.map_err(|_| GenerationError::ResponseTimeout {
                    after: self.request_timeout,
                })??
            }
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let body: String = body.chars().take(MAX_ERROR_BODY_CHARS).collect();
            warn!(
                "Generation endpoint returned {} for job {}",
                status, request.job_id
            );
            return Err(GenerationError::InvalidResponse {
                status: status.as_u16(),
                body,
            });
        }

        let mut bytes = response.bytes_stream();
        let job_id = request.job_id;
        let idle_timeout = self.idle_timeout;
        let stream = async_stream::stream! {
            let mut decoder = Utf8ChunkDecoder::default();
            loop {
                let next = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        debug!("Generation stream for job {} cancelled", job_id);
                        break;
                    }
                    next = next_within(&mut bytes, idle_timeout) => next,
                };
                let Some(next) = next else {
                    if let Some(idle) = idle_timeout {
                        warn!("Generation stream for job {} went quiet", job_id);
                        yield Err(GenerationError::IdleTimeout { idle });
                    }
                    break;
                };

                match next {
                    Some(Ok(chunk)) => match decoder.push(&chunk) {
                        Ok(text) if text.is_empty() => continue,
                        Ok(text) => yield Ok(text),
                        Err(e) => {
                            yield Err(e);
                            break;
                        }
                    },
                    Some(Err(e)) => {
                        yield Err(GenerationError::Transport(e));
                        break;
                    }
                    None => {
                        if let Err(e) = decoder.finish() {
                            yield Err(e);
                        }
                        break;
                    }
                }
            }
        };

        Ok(Box::pin(stream))
    }
}

/// Next item of `stream`; `None` when `limit` elapses first
async fn next_within<S>(stream: &mut S, limit: Option<Duration>) -> Option<Option<S::Item>>
where
    S: futures::Stream + Unpin,
{
    match limit {
        Some(limit) => tokio::time::timeout(limit, stream.next()).await.ok(),
        None => Some(stream.next().await),
    }
}

/// Decodes UTF-8 across arbitrary byte boundaries
///
/// Incomplete trailing sequences are held back until the next push.
#[derive(Debug, Default)]
pub struct Utf8ChunkDecoder {
    pending: Vec<u8>,
}

impl Utf8ChunkDecoder {
    pub fn push(&mut self, bytes: &[u8]) -> Result<String, GenerationError> {
        self.pending.extend_from_slice(bytes);
        match std::str::from_utf8(&self.pending) {
            Ok(text) => {
                let text = text.to_string();
                self.pending.clear();
                Ok(text)
            }
            Err(e) if e.error_len().is_none() => {
                let valid = e.valid_up_to();
                let rest = self.pending.split_off(valid);
                let text = String::from_utf8(std::mem::replace(&mut self.pending, rest))
                    .map_err(|e| GenerationError::Encoding {
                        message: e.to_string(),
                    })?;
                Ok(text)
            }
            Err(e) => Err(GenerationError::Encoding {
                message: e.to_string(),
            }),
        }
    }

    /// Fails if the stream ended inside a multi-byte sequence
    pub fn finish(&mut self) -> Result<(), GenerationError> {
        if self.pending.is_empty() {
            Ok(())
        } else {
            let dangling = self.pending.len();
            self.pending.clear();
            Err(GenerationError::Encoding {
                message: format!("stream ended with {dangling} dangling byte(s)"),
            })
        }
    }
}
