//! Per-connection translation driver.
//!
//! Takes one inbound frame at a time, runs it through validation, prompt
//! construction and a generation session, and writes the resulting frames
//! to a sink. Request-level failures become a single error frame; only a
//! failing sink is reported back to the caller as a transport fault.

use futures::{Sink, SinkExt};
use std::fmt::Display;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::api::{ServerMessage, TranslateResponse, TranslationRequest};
use crate::error::{Error, Result};
use crate::runtime::{ChunkStream, GenerationSession, ModelHost, StreamEvent};
use crate::server::state::{Metrics, MetricsGuard, ServerState};

#[derive(Clone)]
pub struct TranslationOrchestrator {
    host: Arc<ModelHost>,
    session: GenerationSession,
    metrics: Arc<Metrics>,
}

impl TranslationOrchestrator {
    pub fn new(host: Arc<ModelHost>, session: GenerationSession, metrics: Arc<Metrics>) -> Self {
        Self {
            host,
            session,
            metrics,
        }
    }

    pub fn from_state(state: &ServerState) -> Self {
        Self::new(
            state.model_host.clone(),
            state.session.clone(),
            state.metrics.clone(),
        )
    }

    /// Handle one inbound text frame. Returns once the terminal frame for
    /// the request has been written.
    pub async fn handle_frame<S>(&self, raw: &str, sink: &mut S) -> Result<()>
    where
        S: Sink<ServerMessage> + Unpin,
        S::Error: Display,
    {
        match TranslationRequest::parse(raw) {
            Ok(request) => self.stream_translation(&request, sink).await,
            Err(e) => {
                warn!("Rejected request: {} ({})", e, e.kind());
                MetricsGuard::new(&self.metrics).record_failure();
                send(sink, ServerMessage::error(&e)).await
            }
        }
    }

    /// Forward every chunk of one translation, then `done` or an error.
    pub async fn stream_translation<S>(&self, request: &TranslationRequest, sink: &mut S) -> Result<()>
    where
        S: Sink<ServerMessage> + Unpin,
        S::Error: Display,
    {
        let guard = MetricsGuard::new(&self.metrics);
        let mut stream = match self.start(request).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!("Translation not started: {}", e);
                guard.record_failure();
                return send(sink, ServerMessage::error(&e)).await;
            }
        };

        while let Some(event) = stream.next_event().await {
            match event {
                StreamEvent::Chunk(text) => {
                    send(sink, ServerMessage::chunk(text)).await?;
                    guard.record_chunk();
                    tokio::task::yield_now().await;
                }
                StreamEvent::Done(result) => {
                    guard.record_tokens(result.tokens_generated);
                    debug!(session = %stream.session_id(), "Translation done ({:?})", result.finish_reason);
                    return send(sink, ServerMessage::done()).await;
                }
                StreamEvent::Failed(e) => {
                    guard.record_failure();
                    return send(sink, ServerMessage::error(&e)).await;
                }
            }
        }

        guard.record_failure();
        let e = Error::Generation("stream ended without a terminal event".to_string());
        send(sink, ServerMessage::error(&e)).await
    }

    /// Validate, lease the model and start generating.
    ///
    /// Unsupported requests fail here, before any model is touched.
    pub async fn start(&self, request: &TranslationRequest) -> Result<ChunkStream> {
        request.validate()?;
        let lease = self.host.acquire(Some(&request.model)).await?;
        let prompt = lease.generator().prompt_builder().build(request)?;
        info!(
            "Translating {} chars {} -> {} with {}",
            request.text_content().chars().count(),
            request.source_lang,
            request.target_lang,
            lease.identifier()
        );
        Ok(self.session.start(lease, prompt))
    }

    /// Run a translation to completion and return the full text.
    pub async fn translate(&self, request: &TranslationRequest) -> Result<TranslateResponse> {
        let started = Instant::now();
        let guard = MetricsGuard::new(&self.metrics);
        let outcome = async {
            let stream = self.start(request).await?;
            let model_used = stream.model_id().to_string();
            let (translation, result) = stream.collect_text().await?;
            Ok::<_, Error>((translation, model_used, result))
        }
        .await;

        match outcome {
            Ok((translation, model_used, result)) => {
                guard.record_tokens(result.tokens_generated);
                Ok(TranslateResponse {
                    translation,
                    model_used,
                    time_taken: started.elapsed().as_secs_f64(),
                    generation: Some(result),
                })
            }
            Err(e) => {
                guard.record_failure();
                Err(e)
            }
        }
    }
}

async fn send<S>(sink: &mut S, message: ServerMessage) -> Result<()>
where
    S: Sink<ServerMessage> + Unpin,
    S::Error: Display,
{
    sink.send(message)
        .await
        .map_err(|e| Error::Transport(e.to_string()))
}
