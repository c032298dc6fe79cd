//! Deterministic in-process engine
//!
//! Plays back a fixed script of chunks, delays and failures. Used by the
//! `run --dry-run` mode of the binary and by the scheduler tests.

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::{ChunkStream, GenerationEngine, GenerationError, GenerationRequest};

#[derive(Debug, Clone, PartialEq)]
pub enum ScriptStep {
    /// Emit a text chunk
    Chunk(String),
    /// Pause before the next step; ends early if cancelled
    Delay(Duration),
    /// Echo the prompt back one word at a time
    EchoPrompt,
    /// Yield a provider error and end the stream
    Fail(String),
    /// Park until the cancellation token fires, then end
    WaitForCancel,
}

#[derive(Debug, Default)]
struct Counters {
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

/// Decrements the in-flight count when the stream is dropped
struct InFlight(Arc<Counters>);

impl InFlight {
    fn enter(counters: Arc<Counters>) -> Self {
        let now = counters.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        counters.max_in_flight.fetch_max(now, Ordering::SeqCst);
        Self(counters)
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Default)]
pub struct ScriptedEngine {
    script: Vec<ScriptStep>,
    start_error: Option<String>,
    requests: Mutex<Vec<GenerationRequest>>,
    counters: Arc<Counters>,
}

impl ScriptedEngine {
    pub fn new(script: Vec<ScriptStep>) -> Self {
        Self {
            script,
            ..Self::default()
        }
    }

    /// Engine that streams the given chunks and completes
    pub fn chunks<I, S>(chunks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(chunks.into_iter().map(|c| ScriptStep::Chunk(c.into())).collect())
    }

    /// Echo each prompt back with a pause between words
    pub fn echo(word_delay: Duration) -> Self {
        Self::new(vec![ScriptStep::Delay(word_delay), ScriptStep::EchoPrompt])
    }

    /// Engine whose `stream` call itself fails
    pub fn failing_to_start<S: Into<String>>(message: S) -> Self {
        Self {
            start_error: Some(message.into()),
            ..Self::default()
        }
    }

    /// Requests received so far, in call order
    pub fn requests(&self) -> Vec<GenerationRequest> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Highest number of streams that were alive at the same time
    pub fn max_concurrent_streams(&self) -> usize {
        self.counters.max_in_flight.load(Ordering::SeqCst)
    }
}

fn echo_words(prompt: &str) -> Vec<String> {
    let words: Vec<&str> = prompt.split_whitespace().collect();
    let last = words.len().saturating_sub(1);
    words
        .iter()
        .enumerate()
        .map(|(i, word)| {
            if i == last {
                word.to_string()
            } else {
                format!("{word} ")
            }
        })
        .collect()
}

#[async_trait]
impl GenerationEngine for ScriptedEngine {
    async fn stream(
        &self,
        request: GenerationRequest,
        cancel: CancellationToken,
    ) -> Result<ChunkStream, GenerationError> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request.clone());

        if let Some(message) = &self.start_error {
            return Err(GenerationError::provider(message.clone()));
        }

        let script = self.script.clone();
        let guard = InFlight::enter(self.counters.clone());
        let stream = async_stream::stream! {
            let _guard = guard;
            for step in script {
                match step {
                    ScriptStep::Chunk(text) => yield Ok(text),
                    ScriptStep::Delay(duration) => {
                        tokio::select! {
                            _ = tokio::time::sleep(duration) => {}
                            _ = cancel.cancelled() => break,
                        }
                    }
                    ScriptStep::EchoPrompt => {
                        for word in echo_words(&request.prompt) {
                            yield Ok(word);
                        }
                    }
                    ScriptStep::Fail(message) => {
                        yield Err(GenerationError::provider(message));
                        break;
                    }
                    ScriptStep::WaitForCancel => {
                        cancel.cancelled().await;
                        break;
                    }
                }
            }
        };

        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job_scheduling::JobId;
    use futures::StreamExt;

    fn request(prompt: &str) -> GenerationRequest {
        GenerationRequest {
            job_id: JobId(1),
            prompt: prompt.to_string(),
            trace_id: None,
        }
    }

    #[tokio::test]
    async fn test_plays_back_chunks_and_records_requests() {
        let engine = ScriptedEngine::chunks(["He", "llo"]);
        let stream = engine
            .stream(request("x"), CancellationToken::new())
            .await
            .unwrap();
        let chunks: Vec<String> = stream.map(|c| c.unwrap()).collect().await;

        assert_eq!(chunks, vec!["He", "llo"]);
        assert_eq!(engine.requests().len(), 1);
        assert_eq!(engine.max_concurrent_streams(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_echo_reassembles_prompt() {
        let engine = ScriptedEngine::echo(Duration::from_millis(10));
        let stream = engine
            .stream(request("weekly  rust digest"), CancellationToken::new())
            .await
            .unwrap();
        let text: String = stream.map(|c| c.unwrap()).collect::<Vec<_>>().await.concat();
        assert_eq!(text, "weekly rust digest");
    }

    #[tokio::test]
    async fn test_wait_for_cancel_ends_on_signal() {
        let engine = ScriptedEngine::new(vec![
            ScriptStep::Chunk("partial".into()),
            ScriptStep::WaitForCancel,
            ScriptStep::Chunk("never".into()),
        ]);
        let token = CancellationToken::new();
        let mut stream = engine.stream(request("x"), token.clone()).await.unwrap();

        assert_eq!(stream.next().await.unwrap().unwrap(), "partial");
        token.cancel();
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_start_failure() {
        let engine = ScriptedEngine::failing_to_start("quota exceeded");
        let err = engine
            .stream(request("x"), CancellationToken::new())
            .await
            .err()
            .unwrap();
        assert_eq!(err.to_string(), "quota exceeded");
    }
}
