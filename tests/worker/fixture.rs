//! Shared engine and worker doubles for dispatcher tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use pagefind_dispatch::worker::protocol::{RequestEnvelope, ResponseEnvelope};
use pagefind_dispatch::worker::{
    ChannelEvent, Dispatcher, DispatcherState, LaunchError, WorkerChannel, WorkerHandle,
    WorkerLauncher,
};
use pagefind_dispatch::{
    DataProvider, EngineError, EngineFactory, EngineResult, FilterCounts, IndexOptions,
    SearchEngine, SearchHit, SearchOptions, SearchResults,
};
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};

/// Search term that makes [`MemoryEngine`] fail.
pub const FAILING_TERM: &str = "explode";

/// Message of the error [`MemoryEngine`] fails with.
pub const FAILURE_MESSAGE: &str = "index chunk missing";

pub fn sample_pages() -> Vec<(&'static str, &'static str)> {
    vec![
        ("/docs/intro/", "Rust makes systems programming approachable"),
        ("/docs/async/", "Async Rust runs futures on an executor"),
        ("/blog/release/", "Release notes for the search index"),
    ]
}

// ============================================================================
// In-memory engine
// ============================================================================

/// Substring search over a fixed set of pages.
pub struct MemoryEngine {
    pages: Vec<(String, String)>,
    generation: AtomicU64,
    playground: AtomicBool,
    merged: Mutex<Vec<String>>,
    options: Mutex<IndexOptions>,
}

impl MemoryEngine {
    pub fn new(options: IndexOptions) -> Self {
        Self {
            pages: sample_pages()
                .into_iter()
                .map(|(url, content)| (url.to_string(), content.to_string()))
                .collect(),
            generation: AtomicU64::new(0),
            playground: AtomicBool::new(false),
            merged: Mutex::new(Vec::new()),
            options: Mutex::new(options),
        }
    }

    pub fn is_playground(&self) -> bool {
        self.playground.load(Ordering::SeqCst)
    }

    pub fn merged_indexes(&self) -> Vec<String> {
        self.merged.lock().unwrap().clone()
    }

    pub fn current_options(&self) -> IndexOptions {
        self.options.lock().unwrap().clone()
    }

    fn run(&self, term: &str) -> EngineResult<SearchResults<DataProvider>> {
        if term == FAILING_TERM {
            return Err(EngineError::new(FAILURE_MESSAGE));
        }

        let needle = term.to_lowercase();
        let hits = self
            .pages
            .iter()
            .filter(|(_, content)| content.to_lowercase().contains(&needle))
            .map(|(url, content)| {
                let page = json!({ "url": url, "content": content });
                SearchHit::new(url.clone(), 1.0, DataProvider::ready(page))
            })
            .collect();

        Ok(SearchResults::new(hits))
    }
}

#[async_trait]
impl SearchEngine for MemoryEngine {
    async fn options(&self, options: IndexOptions) -> EngineResult<()> {
        self.options.lock().unwrap().merge(options);
        Ok(())
    }

    async fn enter_playground_mode(&self) -> EngineResult<()> {
        self.playground.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn merge_index(&self, index_path: &str, _options: IndexOptions) -> EngineResult<()> {
        self.merged.lock().unwrap().push(index_path.to_string());
        Ok(())
    }

    async fn search(
        &self,
        term: &str,
        _options: &SearchOptions,
    ) -> EngineResult<SearchResults<DataProvider>> {
        self.run(term)
    }

    async fn debounced_search(
        &self,
        term: &str,
        _options: &SearchOptions,
        debounce: Duration,
    ) -> EngineResult<Option<SearchResults<DataProvider>>> {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        tokio::time::sleep(debounce).await;
        if self.generation.load(Ordering::SeqCst) != generation {
            return Ok(None);
        }
        self.run(term).map(Some)
    }

    async fn preload(&self, _term: &str, _options: &SearchOptions) -> EngineResult<()> {
        Ok(())
    }

    async fn filters(&self) -> EngineResult<FilterCounts> {
        let mut section = std::collections::BTreeMap::new();
        section.insert("docs".to_string(), 2);
        section.insert("blog".to_string(), 1);

        let mut filters = FilterCounts::new();
        filters.insert("section".to_string(), section);
        Ok(filters)
    }
}

/// Builds [`MemoryEngine`]s and remembers what it was asked for.
#[derive(Default)]
pub struct MemoryFactory {
    created: AtomicUsize,
    fail: bool,
    last_options: Mutex<Option<IndexOptions>>,
}

impl MemoryFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            fail: true,
            ..Self::default()
        })
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn last_options(&self) -> Option<IndexOptions> {
        self.last_options.lock().unwrap().clone()
    }
}

#[async_trait]
impl EngineFactory for MemoryFactory {
    async fn create(&self, options: IndexOptions) -> EngineResult<Arc<dyn SearchEngine>> {
        if self.fail {
            return Err(EngineError::new("index metadata unreachable"));
        }
        self.created.fetch_add(1, Ordering::SeqCst);
        *self.last_options.lock().unwrap() = Some(options.clone());
        Ok(Arc::new(MemoryEngine::new(options)))
    }
}

// ============================================================================
// Scripted worker
// ============================================================================

/// A launcher whose single worker is driven by the test.
pub struct ScriptedLauncher {
    worker: Mutex<Option<oneshot::Sender<ScriptedWorker>>>,
}

impl ScriptedLauncher {
    pub fn new() -> (Arc<Self>, oneshot::Receiver<ScriptedWorker>) {
        let (tx, rx) = oneshot::channel();
        let launcher = Arc::new(Self {
            worker: Mutex::new(Some(tx)),
        });
        (launcher, rx)
    }
}

impl WorkerLauncher for ScriptedLauncher {
    fn launch(&self, location: &str) -> Result<WorkerChannel, LaunchError> {
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let terminated = Arc::new(AtomicBool::new(false));

        let worker = ScriptedWorker {
            location: location.to_string(),
            requests: request_rx,
            events: event_tx,
            terminated: Arc::clone(&terminated),
        };
        if let Some(tx) = self.worker.lock().unwrap().take() {
            let _ = tx.send(worker);
        }

        Ok(WorkerChannel::new(
            request_tx,
            event_rx,
            ScriptedHandle { terminated },
        ))
    }
}

struct ScriptedHandle {
    terminated: Arc<AtomicBool>,
}

impl WorkerHandle for ScriptedHandle {
    fn terminate(&mut self) {
        self.terminated.store(true, Ordering::SeqCst);
    }
}

/// The test's end of a scripted worker channel.
pub struct ScriptedWorker {
    pub location: String,
    requests: mpsc::UnboundedReceiver<String>,
    events: mpsc::UnboundedSender<ChannelEvent>,
    terminated: Arc<AtomicBool>,
}

impl ScriptedWorker {
    pub async fn next_request(&mut self) -> RequestEnvelope {
        let line = self.requests.recv().await.expect("dispatcher hung up");
        serde_json::from_str(&line).expect("request is valid JSON")
    }

    /// Answer the `init` handshake with success.
    pub async fn accept_init(&mut self) -> RequestEnvelope {
        let init = self.next_request().await;
        assert_eq!(init.method, "init");
        self.reply(&init.id, json!(true));
        init
    }

    pub fn reply(&self, id: &str, result: Value) {
        self.send(&ResponseEnvelope::success(id, result));
    }

    pub fn reply_error(&self, id: &str, message: &str) {
        self.send(&ResponseEnvelope::failure(id, message));
    }

    /// Put `line` on the wire as is.
    pub fn reply_raw(&self, line: &str) {
        let _ = self.events.send(ChannelEvent::Message(line.to_string()));
    }

    pub fn fail(&self, reason: &str) {
        let _ = self.events.send(ChannelEvent::Error(reason.to_string()));
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    fn send(&self, response: &ResponseEnvelope) {
        let line = serde_json::to_string(response).unwrap();
        let _ = self.events.send(ChannelEvent::Message(line));
    }
}

/// Search result as the worker would put it on the wire.
pub fn wire_results(handles: &[&str]) -> Value {
    let results: Vec<Value> = handles
        .iter()
        .enumerate()
        .map(|(index, handle)| json!({ "id": format!("hit_{index}"), "score": 1.0, "data": handle }))
        .collect();
    json!({
        "results": results,
        "unfilteredResultCount": handles.len(),
        "filters": {},
        "totalFilters": {},
    })
}

// ============================================================================
// Helpers
// ============================================================================

/// Dispatcher driven by a scripted worker, already past its handshake.
pub async fn ready_scripted(
    factory: Arc<MemoryFactory>,
    config: pagefind_dispatch::DispatcherConfig,
) -> (Dispatcher, ScriptedWorker) {
    let (launcher, worker) = ScriptedLauncher::new();
    let dispatcher = Dispatcher::new(config, factory, launcher);
    let mut worker = worker.await.expect("worker launched");
    worker.accept_init().await;
    assert_eq!(dispatcher.init().await, DispatcherState::ReadyWorker);
    (dispatcher, worker)
}

/// Poll until the dispatcher reaches `state`.
pub async fn wait_for_state(dispatcher: &Dispatcher, state: DispatcherState) {
    for _ in 0..500 {
        if dispatcher.state() == state {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("dispatcher never reached {state:?}, stuck in {:?}", dispatcher.state());
}
