use crate::context::GenerationRequest;
use crate::error::{ChatError, ChatResult};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// The hosted language model: prompt context in, reply text out.
///
/// Implementations may block; retries, if any, belong to the implementation.
pub trait Generator: Send + Sync + 'static {
    fn generate(&self, request: &GenerationRequest) -> ChatResult<String>;
}

impl<F> Generator for F
where
    F: Fn(&GenerationRequest) -> ChatResult<String> + Send + Sync + 'static,
{
    fn generate(&self, request: &GenerationRequest) -> ChatResult<String> {
        self(request)
    }
}

const DEFAULT_MAX_IN_FLIGHT: usize = 64;

/// Runs a [`Generator`] on a worker thread and bounds the wait.
///
/// A call that overruns the timeout keeps running detached; its result is
/// dropped. Detached workers count against `max_in_flight` until they return.
#[derive(Clone)]
pub struct TimedGenerator {
    inner: Arc<dyn Generator>,
    timeout: Duration,
    max_in_flight: usize,
    in_flight: Arc<AtomicUsize>,
}

/// One reserved worker slot; released when the worker finishes or unwinds.
struct WorkerSlot(Arc<AtomicUsize>);

impl Drop for WorkerSlot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

impl TimedGenerator {
    pub fn new(inner: Arc<dyn Generator>, timeout: Duration) -> Self {
        Self {
            inner,
            timeout,
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Zero lifts the bound.
    pub fn with_max_in_flight(mut self, max_in_flight: usize) -> Self {
        self.max_in_flight = max_in_flight;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Workers currently running, detached ones included.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    fn reserve(&self) -> ChatResult<WorkerSlot> {
        let previous = self.in_flight.fetch_add(1, Ordering::AcqRel);
        let slot = WorkerSlot(Arc::clone(&self.in_flight));
        if self.max_in_flight > 0 && previous >= self.max_in_flight {
            return Err(ChatError::GenerationFailed(format!(
                "{previous} generations already in flight"
            )));
        }
        Ok(slot)
    }

    pub fn generate(&self, request: &GenerationRequest) -> ChatResult<String> {
        let slot = self.reserve().map_err(|err| {
            tracing::warn!(tenant = %request.tenant, error = %err, "generation rejected");
            err
        })?;
        let (tx, rx) = mpsc::sync_channel(1);
        let inner = Arc::clone(&self.inner);
        let owned = request.clone();
        let started = Instant::now();
        thread::Builder::new()
            .name(format!("generate-{}", request.tenant))
            .spawn(move || {
                let _slot = slot;
                let _ = tx.send(inner.generate(&owned));
            })
            .map_err(|err| ChatError::GenerationFailed(format!("spawn failed: {err}")))?;

        match rx.recv_timeout(self.timeout) {
            Ok(Ok(text)) if text.trim().is_empty() => {
                Err(ChatError::GenerationFailed("empty reply".into()))
            }
            Ok(Ok(text)) => {
                tracing::debug!(
                    tenant = %request.tenant,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "generation finished"
                );
                Ok(text.trim().to_string())
            }
            Ok(Err(ChatError::GenerationFailed(reason))) => Err(ChatError::GenerationFailed(reason)),
            Ok(Err(other)) => Err(ChatError::GenerationFailed(other.to_string())),
            Err(RecvTimeoutError::Timeout) => Err(ChatError::GenerationFailed(format!(
                "timed out after {} ms",
                self.timeout.as_millis()
            ))),
            Err(RecvTimeoutError::Disconnected) => {
                Err(ChatError::GenerationFailed("generator aborted".into()))
            }
        }
    }
}
