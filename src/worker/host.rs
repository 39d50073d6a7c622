//! The worker side of the protocol.
//!
//! A [`WorkerHost`] owns at most one engine instance and the table of data
//! handles minted for its search results. It answers one request per line and
//! never stops on a bad request: every failure becomes an error response.

use std::io;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use lru::LruCache;
use serde::Deserialize;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::error::HandlerError;
use super::protocol::{Call, RequestEnvelope, ResponseEnvelope};
use crate::engine::{
    DataProvider, EngineFactory, SearchEngine, SearchEnvironment, SearchOptions, SearchResults,
    DEFAULT_DEBOUNCE,
};

/// Handle table bound used when none is configured.
pub const DEFAULT_HANDLE_CAPACITY: NonZeroUsize = match NonZeroUsize::new(4096) {
    Some(capacity) => capacity,
    None => NonZeroUsize::MIN,
};

/// Handle id for hit `index` of request `request_id`.
pub fn handle_id(request_id: &str, index: usize) -> String {
    format!("data_{request_id}_{index}")
}

/// Data providers retained for the current engine instance, least recently
/// used first out.
///
/// `generation` moves on whenever the engine instance is replaced or dropped,
/// so results from a search that started under an older instance are
/// recognisable.
struct HandleTable {
    providers: LruCache<String, DataProvider>,
    generation: u64,
}

impl HandleTable {
    fn new(capacity: NonZeroUsize) -> Self {
        Self {
            providers: LruCache::new(capacity),
            generation: 0,
        }
    }

    /// Drop every handle and start a new generation.
    fn reset(&mut self) -> u64 {
        self.providers.clear();
        self.generation += 1;
        self.generation
    }

    fn insert(&mut self, handle: String, provider: DataProvider) {
        if let Some((evicted, _)) = self.providers.push(handle, provider) {
            debug!(handle = %evicted, "data handle evicted");
        }
    }

    fn get(&mut self, handle: &str) -> Option<DataProvider> {
        self.providers.get(handle).cloned()
    }

    fn remove(&mut self, handle: &str) {
        self.providers.pop(handle);
    }

    fn len(&self) -> usize {
        self.providers.len()
    }
}

/// Just enough of a request to answer it.
#[derive(Deserialize)]
struct RequestId {
    id: String,
}

/// Serves requests against one engine instance at a time.
pub struct WorkerHost {
    factory: Arc<dyn EngineFactory>,
    engine: Mutex<Option<Arc<dyn SearchEngine>>>,
    handles: Mutex<HandleTable>,
    /// Mirrors `HandleTable::generation` for lock-free reads.
    generation: AtomicU64,
}

impl WorkerHost {
    pub fn new(factory: Arc<dyn EngineFactory>, handle_capacity: NonZeroUsize) -> Self {
        Self {
            factory,
            engine: Mutex::new(None),
            handles: Mutex::new(HandleTable::new(handle_capacity)),
            generation: AtomicU64::new(0),
        }
    }

    /// Whether an engine instance is currently held.
    pub fn has_engine(&self) -> bool {
        lock(&self.engine).is_some()
    }

    /// Number of retained data handles.
    pub fn handle_count(&self) -> usize {
        lock(&self.handles).len()
    }

    /// Answer one serialized request.
    ///
    /// Returns `None` only when the line is not a request at all, since there
    /// is no id to answer to.
    pub async fn handle_line(&self, line: &str) -> Option<String> {
        let response = match serde_json::from_str::<RequestEnvelope>(line) {
            Ok(request) => self.handle(request).await,
            Err(err) => match serde_json::from_str::<RequestId>(line) {
                Ok(RequestId { id }) => {
                    ResponseEnvelope::failure(id, format!("malformed request: {err}"))
                }
                Err(_) => {
                    warn!(error = %err, "dropping unreadable request");
                    return None;
                }
            },
        };

        match serde_json::to_string(&response) {
            Ok(encoded) => Some(encoded),
            Err(err) => {
                warn!(id = %response.id, error = %err, "failed to encode response");
                serde_json::to_string(&ResponseEnvelope::failure(
                    response.id,
                    format!("failed to encode response: {err}"),
                ))
                .ok()
            }
        }
    }

    /// Answer one request.
    pub async fn handle(&self, request: RequestEnvelope) -> ResponseEnvelope {
        let RequestEnvelope { id, method, args } = request;
        let outcome = match Call::from_envelope(&method, args) {
            Ok(call) => self.dispatch(&id, call).await,
            Err(err) => Err(err.into()),
        };

        match outcome {
            Ok(result) => ResponseEnvelope::success(id, result),
            Err(err) => {
                debug!(%id, %method, error = %err, "request failed");
                ResponseEnvelope::failure(id, err.to_string())
            }
        }
    }

    async fn dispatch(&self, id: &str, call: Call) -> Result<Value, HandlerError> {
        // Read before the engine so a swap in between is caught
        let generation = self.generation.load(Ordering::Acquire);
        let engine = if call.needs_engine() {
            Some(self.engine()?)
        } else {
            None
        };

        match (call, engine) {
            (Call::Init(options), _) => {
                let engine = self.factory.create(options).await?;
                // Handles belong to the instance that minted them
                let replaced = self.swap_engine(Some(engine));
                info!(replaced, "search engine initialized");
                Ok(Value::Bool(true))
            }
            (Call::Options(options), Some(engine)) => {
                engine.options(options).await?;
                Ok(Value::Bool(true))
            }
            (Call::EnterPlaygroundMode, Some(engine)) => {
                engine.enter_playground_mode().await?;
                Ok(Value::Bool(true))
            }
            (
                Call::MergeIndex {
                    index_path,
                    options,
                },
                Some(engine),
            ) => {
                engine.merge_index(&index_path, options).await?;
                Ok(Value::Bool(true))
            }
            (Call::Search { term, options }, Some(engine)) => {
                let results = engine.search(&term, &options).await?;
                self.retain_results(id, generation, results, &options)
            }
            (
                Call::DebouncedSearch {
                    term,
                    options,
                    debounce_ms,
                },
                Some(engine),
            ) => {
                let debounce = debounce_ms.map_or(DEFAULT_DEBOUNCE, Duration::from_millis);
                match engine.debounced_search(&term, &options, debounce).await? {
                    Some(results) => self.retain_results(id, generation, results, &options),
                    None => Ok(Value::Null),
                }
            }
            (Call::Preload { term, options }, Some(engine)) => {
                engine.preload(&term, &options).await?;
                Ok(Value::Bool(true))
            }
            (Call::Filters, Some(engine)) => Ok(serde_json::to_value(engine.filters().await?)?),
            (Call::GetData { handle }, _) => {
                let provider = lock(&self.handles)
                    .get(&handle)
                    .ok_or(HandlerError::DataNotFound(handle))?;
                Ok(provider.load().await?)
            }
            (Call::ReleaseData { handle }, _) => {
                lock(&self.handles).remove(&handle);
                Ok(Value::Bool(true))
            }
            (Call::Destroy, _) => {
                self.swap_engine(None);
                info!("search engine destroyed");
                Ok(Value::Bool(true))
            }
            (_, None) => Err(HandlerError::NotInitialized),
        }
    }

    fn engine(&self) -> Result<Arc<dyn SearchEngine>, HandlerError> {
        lock(&self.engine).clone().ok_or(HandlerError::NotInitialized)
    }

    /// Install `next` (or nothing) and drop every handle of the old instance.
    /// Returns whether an instance was replaced.
    fn swap_engine(&self, next: Option<Arc<dyn SearchEngine>>) -> bool {
        let mut handles = lock(&self.handles);
        let generation = handles.reset();
        self.generation.store(generation, Ordering::Release);
        let mut engine = lock(&self.engine);
        std::mem::replace(&mut *engine, next).is_some()
    }

    /// Swap each hit's provider for a handle id and keep the provider, unless
    /// the engine that produced them has since been replaced or destroyed.
    fn retain_results(
        &self,
        request_id: &str,
        generation: u64,
        results: SearchResults<DataProvider>,
        options: &SearchOptions,
    ) -> Result<Value, HandlerError> {
        let mut results = {
            let mut handles = lock(&self.handles);
            let current = handles.generation == generation;
            if !current {
                debug!(id = %request_id, "engine replaced during search, not retaining data");
            }
            results.map_data(|index, provider| {
                let handle = handle_id(request_id, index);
                if current {
                    handles.insert(handle.clone(), provider);
                }
                handle
            })
        };

        if options.verbose {
            results.search_environment = Some(SearchEnvironment::Worker);
        }

        Ok(serde_json::to_value(results)?)
    }

    /// Serve requests from `inbound` until it closes, passing each response
    /// line to `post`.
    ///
    /// Requests are handled concurrently on the current runtime, so responses
    /// may be posted in any order.
    pub async fn serve<F>(self: Arc<Self>, mut inbound: mpsc::UnboundedReceiver<String>, post: F)
    where
        F: Fn(String) + Send + Sync + 'static,
    {
        let post = Arc::new(post);
        while let Some(line) = inbound.recv().await {
            let host = Arc::clone(&self);
            let post = Arc::clone(&post);
            tokio::spawn(async move {
                if let Some(response) = host.handle_line(&line).await {
                    post(response);
                }
            });
        }
        debug!("worker inbound channel closed");
    }

    /// Serve NDJSON requests read from `reader`, writing responses to `writer`.
    ///
    /// This is the loop a worker executable runs over its stdin and stdout.
    /// Returns once `reader` reaches end of input.
    pub async fn serve_io<R, W>(self: Arc<Self>, reader: R, writer: W) -> io::Result<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (line_tx, line_rx) = mpsc::unbounded_channel::<String>();
        let (response_tx, mut response_rx) = mpsc::unbounded_channel::<String>();

        let serving = tokio::spawn(self.serve(line_rx, move |response| {
            let _ = response_tx.send(response);
        }));

        let writing = tokio::spawn(async move {
            let mut writer = writer;
            while let Some(response) = response_rx.recv().await {
                writer.write_all(response.as_bytes()).await?;
                writer.write_all(b"\n").await?;
                writer.flush().await?;
            }
            Ok::<(), io::Error>(())
        });

        let mut lines = BufReader::new(reader).lines();
        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            if line_tx.send(line).is_err() {
                break;
            }
        }
        drop(line_tx);

        serving.await.map_err(io::Error::other)?;
        writing.await.map_err(io::Error::other)?
    }
}

#[cfg(test)]
impl WorkerHost {
    fn with_engine(factory: Arc<dyn EngineFactory>, engine: Arc<dyn SearchEngine>) -> Self {
        let host = Self::new(factory, DEFAULT_HANDLE_CAPACITY);
        *lock(&host.engine) = Some(engine);
        host
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
