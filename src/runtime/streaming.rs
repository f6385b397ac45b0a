//! Streaming generation sessions
//!
//! A session runs the blocking generator on tokio's blocking pool and hands
//! produced text to an async consumer through a bounded channel. The
//! consumer sees every chunk in production order followed by exactly one
//! terminal event. Dropping the consumer cancels the worker.

use futures::Stream;
use parking_lot::Mutex;
use serde::Serialize;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, error, info, trace};
use uuid::Uuid;

use crate::config::GenerationConfig;
use crate::error::{Error, Result};
use crate::runtime::{
    ContinueGeneration, GenerationContext, GenerationParams, GenerationResult, ModelLease,
};

/// Item delivered to the consumer of a [`ChunkStream`]
#[derive(Debug)]
pub enum StreamEvent {
    /// Newly produced text
    Chunk(String),
    /// Generation ended normally
    Done(GenerationResult),
    /// Generation failed; no further events follow
    Failed(Error),
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StreamEvent::Chunk(_))
    }
}

/// Lifecycle of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Idle,
    Generating,
    Completed,
    Failed,
}

impl SessionState {
    fn can_advance_to(self, next: SessionState) -> bool {
        matches!(
            (self, next),
            (SessionState::Idle, SessionState::Generating)
                | (SessionState::Generating, SessionState::Completed)
                | (SessionState::Generating, SessionState::Failed)
        )
    }
}

/// Shared state cell; rejects transitions that skip `Generating`
#[derive(Debug, Clone)]
struct StateCell(Arc<Mutex<SessionState>>);

impl StateCell {
    fn new() -> Self {
        Self(Arc::new(Mutex::new(SessionState::Idle)))
    }

    fn get(&self) -> SessionState {
        *self.0.lock()
    }

    fn advance(&self, next: SessionState) -> bool {
        let mut state = self.0.lock();
        if state.can_advance_to(next) {
            *state = next;
            true
        } else {
            debug!("Ignoring session transition {:?} -> {:?}", *state, next);
            false
        }
    }
}

/// Hook invoked by the generation worker. Must not block.
pub trait GenerationObserver: Send + Sync {
    fn on_start(&self, _session: Uuid, _model: &str) {}

    fn on_chunk(&self, _session: Uuid, _index: usize, _text: &str) {}

    fn on_finish(&self, _session: Uuid, _outcome: std::result::Result<&GenerationResult, &Error>) {}
}

/// Default observer: per-chunk `trace!` events and a summary line
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl GenerationObserver for TracingObserver {
    fn on_start(&self, session: Uuid, model: &str) {
        debug!(%session, model, "Generation started");
    }

    fn on_chunk(&self, session: Uuid, index: usize, text: &str) {
        trace!(%session, index, chunk = ?text, "Generated chunk");
    }

    fn on_finish(&self, session: Uuid, outcome: std::result::Result<&GenerationResult, &Error>) {
        match outcome {
            Ok(result) => info!(
                %session,
                tokens = result.tokens_generated,
                reason = ?result.finish_reason,
                "Generation finished in {}ms ({:.1} tok/s)",
                result.generation_time_ms,
                result.tokens_per_second
            ),
            Err(e) => error!(%session, "Generation failed: {}", e),
        }
    }
}

/// Starts generations with fixed decoding parameters
#[derive(Clone)]
pub struct GenerationSession {
    params: GenerationParams,
    timeout: Duration,
    channel_capacity: usize,
    observer: Arc<dyn GenerationObserver>,
}

impl GenerationSession {
    pub fn new(config: &GenerationConfig) -> Self {
        Self {
            params: GenerationParams::from(config),
            timeout: Duration::from_secs(config.timeout_secs),
            channel_capacity: config.channel_capacity.max(1),
            observer: Arc::new(TracingObserver),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn GenerationObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn params(&self) -> &GenerationParams {
        &self.params
    }

    /// Start generating `prompt` on the leased model.
    ///
    /// The lease (and with it the admission permit) is held by the worker
    /// and released before the terminal event is delivered.
    pub fn start(&self, lease: ModelLease, prompt: String) -> ChunkStream {
        let session_id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(self.channel_capacity);
        let cancel = CancellationToken::new();
        let state = StateCell::new();

        let context = GenerationContext {
            cancel_token: cancel.clone(),
            timeout: self.timeout,
        };
        let params = self.params.clone();
        let observer = self.observer.clone();
        let worker_tx = tx.clone();

        state.advance(SessionState::Generating);
        let model_id = lease.identifier().to_string();
        observer.on_start(session_id, &model_id);

        let worker_observer = observer.clone();
        let handle = tokio::task::spawn_blocking(move || {
            let mut index = 0;
            let result = lease.generator().generate(&prompt, &params, &context, &mut |text| {
                worker_observer.on_chunk(session_id, index, text);
                index += 1;
                if worker_tx.blocking_send(StreamEvent::Chunk(text.to_string())).is_err() {
                    // Consumer is gone
                    context.cancel_token.cancel();
                    return ContinueGeneration::Stop;
                }
                ContinueGeneration::Continue
            });
            drop(lease);
            result
        });

        tokio::spawn(supervise(handle, tx, state.clone(), observer, session_id));

        ChunkStream {
            session_id,
            model_id,
            receiver: rx,
            _cancel_on_drop: cancel.clone().drop_guard(),
            cancel,
            state,
            terminated: false,
        }
    }
}

/// Waits for the worker and converts its outcome, including a panic, into
/// the terminal event.
async fn supervise(
    handle: JoinHandle<Result<GenerationResult>>,
    tx: mpsc::Sender<StreamEvent>,
    state: StateCell,
    observer: Arc<dyn GenerationObserver>,
    session_id: Uuid,
) {
    let outcome = match handle.await {
        Ok(outcome) => outcome,
        Err(join_error) => {
            error!(%session_id, "Generation worker did not complete: {}", join_error);
            Err(Error::from(join_error))
        }
    };

    let event = match outcome {
        Ok(result) => {
            observer.on_finish(session_id, Ok(&result));
            state.advance(SessionState::Completed);
            StreamEvent::Done(result)
        }
        Err(e) => {
            observer.on_finish(session_id, Err(&e));
            state.advance(SessionState::Failed);
            StreamEvent::Failed(e)
        }
    };

    if tx.send(event).await.is_err() {
        debug!(%session_id, "Consumer dropped before the terminal event");
    }
}

/// Ordered, finite sequence of events produced by one session
pub struct ChunkStream {
    session_id: Uuid,
    model_id: String,
    receiver: mpsc::Receiver<StreamEvent>,
    cancel: CancellationToken,
    _cancel_on_drop: DropGuard,
    state: StateCell,
    terminated: bool,
}

impl ChunkStream {
    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Model the session was started on
    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn state(&self) -> SessionState {
        self.state.get()
    }

    /// Ask the worker to stop after the current step
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Next event; `None` once the terminal event has been returned.
    pub async fn next_event(&mut self) -> Option<StreamEvent> {
        futures::StreamExt::next(self).await
    }

    /// Drain the stream into the full text.
    pub async fn collect_text(mut self) -> Result<(String, GenerationResult)> {
        let mut text = String::new();
        while let Some(event) = self.next_event().await {
            match event {
                StreamEvent::Chunk(chunk) => text.push_str(&chunk),
                StreamEvent::Done(result) => return Ok((text, result)),
                StreamEvent::Failed(e) => return Err(e),
            }
        }
        Err(Error::Generation(
            "stream ended without a terminal event".to_string(),
        ))
    }
}

impl Stream for ChunkStream {
    type Item = StreamEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.terminated {
            return Poll::Ready(None);
        }
        match self.receiver.poll_recv(cx) {
            Poll::Ready(Some(event)) => {
                if event.is_terminal() {
                    self.terminated = true;
                }
                Poll::Ready(Some(event))
            }
            Poll::Ready(None) => {
                self.terminated = true;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackendKind, ModelConfig};
    use crate::runtime::{FinishReason, ModelHost, ScriptedLoader};
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn lease_from(loader: ScriptedLoader) -> (Arc<ModelHost>, ModelLease) {
        let config = ModelConfig {
            backend: BackendKind::Scripted,
            ..Default::default()
        };
        let host = Arc::new(ModelHost::new(Arc::new(loader), config));
        let lease = host.acquire(None).await.unwrap();
        (host, lease)
    }

    fn session() -> GenerationSession {
        GenerationSession::new(&GenerationConfig {
            channel_capacity: 2,
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_chunks_arrive_in_order_then_done() {
        let (_host, lease) = lease_from(ScriptedLoader::with_chunks(["你", "好", "，", "世界"])).await;
        let mut stream = session().start(lease, String::new());
        assert_eq!(stream.state(), SessionState::Generating);

        let mut chunks = Vec::new();
        let mut done = None;
        while let Some(event) = stream.next_event().await {
            match event {
                StreamEvent::Chunk(chunk) => chunks.push(chunk),
                StreamEvent::Done(result) => done = Some(result),
                StreamEvent::Failed(e) => panic!("unexpected failure: {}", e),
            }
        }

        assert_eq!(chunks.concat(), "你好，世界");
        assert_eq!(chunks.len(), 4);
        assert_eq!(done.unwrap().finish_reason, FinishReason::EndOfSequence);
        assert_eq!(stream.state(), SessionState::Completed);
        assert!(stream.next_event().await.is_none());
    }

    #[tokio::test]
    async fn test_worker_error_is_terminal_event() {
        let (_host, lease) = lease_from(ScriptedLoader::with_chunks(["a", "b", "c"]).failing_after(2)).await;
        let mut stream = session().start(lease, String::new());

        let mut events = Vec::new();
        while let Some(event) = stream.next_event().await {
            events.push(event);
        }

        assert_eq!(events.len(), 3);
        assert!(matches!(events[2], StreamEvent::Failed(Error::Generation(_))));
        assert_eq!(stream.state(), SessionState::Failed);
    }

    #[tokio::test]
    async fn test_worker_panic_is_contained() {
        let (host, lease) = lease_from(ScriptedLoader::with_chunks(["a", "b"]).panicking_after(1)).await;
        let stream = session().start(lease, String::new());

        let err = stream.collect_text().await.unwrap_err();
        assert!(matches!(err, Error::Generation(ref msg) if msg == "worker panicked"));

        // the permit was released during unwinding
        assert!(host.acquire(None).await.is_ok());
    }

    #[tokio::test]
    async fn test_cancel_stops_worker_early() {
        let chunks: Vec<String> = (0..500).map(|i| format!("{} ", i)).collect();
        let loader = ScriptedLoader::with_chunks(chunks).with_chunk_delay(Duration::from_millis(2));
        let (_host, lease) = lease_from(loader).await;
        let mut stream = session().start(lease, String::new());

        assert!(matches!(stream.next_event().await, Some(StreamEvent::Chunk(_))));
        stream.cancel();

        let mut received = 1;
        let mut reason = None;
        while let Some(event) = stream.next_event().await {
            match event {
                StreamEvent::Chunk(_) => received += 1,
                StreamEvent::Done(result) => reason = Some(result.finish_reason),
                StreamEvent::Failed(e) => panic!("unexpected failure: {}", e),
            }
        }

        assert_eq!(reason, Some(FinishReason::Cancelled));
        assert!(received < 500);
    }

    #[tokio::test]
    async fn test_dropping_stream_releases_model() {
        let chunks: Vec<String> = (0..500).map(|i| i.to_string()).collect();
        let loader = ScriptedLoader::with_chunks(chunks).with_chunk_delay(Duration::from_millis(2));
        let (host, lease) = lease_from(loader).await;

        let stream = session().start(lease, String::new());
        drop(stream);

        let lease = tokio::time::timeout(Duration::from_secs(5), host.acquire(None))
            .await
            .expect("worker did not stop after the stream was dropped");
        assert!(lease.is_ok());
    }

    struct CountingObserver(AtomicUsize);

    impl GenerationObserver for CountingObserver {
        fn on_chunk(&self, _session: Uuid, _index: usize, _text: &str) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_observer_sees_every_chunk() {
        let observer = Arc::new(CountingObserver(AtomicUsize::new(0)));
        let (_host, lease) = lease_from(ScriptedLoader::with_chunks(["x", "y", "z"])).await;
        let stream = session().with_observer(observer.clone()).start(lease, String::new());

        let (text, result) = stream.collect_text().await.unwrap();
        assert_eq!(text, "xyz");
        assert_eq!(result.tokens_generated, 3);
        assert_eq!(observer.0.load(Ordering::SeqCst), 3);
    }
}
