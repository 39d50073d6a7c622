//! Client side: routes every call to the worker or to an in-process engine.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use super::accessor::DataAccessor;
use super::channel::{
    ChannelEvent, ProcessLauncher, ThreadLauncher, WorkerHandle, WorkerLauncher,
};
use super::error::{DispatchError, DispatchResult, LaunchError};
use super::host::DEFAULT_HANDLE_CAPACITY;
use super::protocol::{
    Call, ProtocolError, ResponseEnvelope, NOTIFICATION_PREFIX, REQUEST_PREFIX,
};
use crate::config::DispatcherConfig;
use crate::engine::{
    DataProvider, EngineFactory, FilterCounts, IndexOptions, SearchEngine, SearchEnvironment,
    SearchOptions, SearchResults, DEFAULT_DEBOUNCE,
};

/// Where a dispatcher is in its lifecycle.
///
/// `Initializing` leads to `ReadyWorker` or `ReadyFallback`. `ReadyWorker` may
/// later degrade to `ReadyFallback`; nothing leads back to the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatcherState {
    Uninitialized,
    Initializing,
    ReadyWorker,
    ReadyFallback,
    Destroyed,
}

/// The worker end of a dispatcher.
struct WorkerLink {
    outbound: mpsc::UnboundedSender<String>,
    handle: Mutex<Box<dyn WorkerHandle>>,
}

impl WorkerLink {
    fn post(&self, line: String) -> bool {
        self.outbound.send(line).is_ok()
    }

    fn terminate(&self) {
        lock(&self.handle).terminate();
    }
}

#[derive(Clone)]
enum Route {
    Starting,
    /// Worker started; only `init` may be sent.
    Handshake(Arc<WorkerLink>),
    Worker(Arc<WorkerLink>),
    /// The worker failed and the in-process engine is being built.
    Recovering,
    Fallback(Arc<dyn SearchEngine>),
    /// The in-process engine could not be built either.
    Failed(String),
    Destroyed,
}

impl Route {
    fn is_settled(&self) -> bool {
        matches!(
            self,
            Route::Worker(_) | Route::Fallback(_) | Route::Failed(_) | Route::Destroyed
        )
    }

    fn link(&self) -> Option<&Arc<WorkerLink>> {
        match self {
            Route::Handshake(link) | Route::Worker(link) => Some(link),
            _ => None,
        }
    }
}

enum Target {
    Worker(Arc<WorkerLink>),
    Fallback(Arc<dyn SearchEngine>),
}

type Waiter = oneshot::Sender<DispatchResult<Value>>;

/// Just enough of a response to find its caller.
#[derive(Deserialize)]
struct ResponseId {
    id: String,
}

pub(crate) struct Shared {
    config: DispatcherConfig,
    launcher: Arc<dyn WorkerLauncher>,
    factory: Arc<dyn EngineFactory>,
    /// Options for building an engine, kept current by `options` calls.
    engine_options: Mutex<IndexOptions>,
    next_id: AtomicU64,
    pending: Mutex<HashMap<String, Waiter>>,
    route: watch::Sender<Route>,
    started: AtomicBool,
    unmatched: AtomicU64,
}

/// Removes a pending call when its future finishes or is dropped.
struct PendingGuard<'a> {
    pending: &'a Mutex<HashMap<String, Waiter>>,
    id: &'a str,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        lock(self.pending).remove(self.id);
    }
}

impl Shared {
    fn next_id(&self, prefix: &str) -> String {
        format!("{prefix}{}", self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// The route once initialization (or recovery) has settled.
    async fn settled(&self) -> Route {
        let mut route = self.route.subscribe();
        let settled = match route.wait_for(Route::is_settled).await {
            Ok(settled) => settled.clone(),
            Err(_) => Route::Destroyed,
        };
        settled
    }

    async fn target(&self) -> DispatchResult<Target> {
        match self.settled().await {
            Route::Worker(link) => Ok(Target::Worker(link)),
            Route::Fallback(engine) => Ok(Target::Fallback(engine)),
            Route::Failed(reason) => Err(DispatchError::Unavailable(reason)),
            Route::Destroyed => Err(DispatchError::Destroyed),
            Route::Starting | Route::Handshake(_) | Route::Recovering => {
                Err(DispatchError::NotInitialized)
            }
        }
    }

    /// Send one request and wait for its response.
    async fn request(&self, link: &WorkerLink, call: Call) -> DispatchResult<Value> {
        let id = self.next_id(REQUEST_PREFIX);
        let method = call.method();
        let envelope = call
            .into_envelope(id.as_str())
            .map_err(DispatchError::Serialize)?;
        let line = serde_json::to_string(&envelope)
            .map_err(|err| DispatchError::Serialize(ProtocolError::Encode(err)))?;

        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(id.clone(), tx);
        let _pending = PendingGuard {
            pending: &self.pending,
            id: &id,
        };

        if !link.post(line) {
            return Err(DispatchError::ChannelFailed(
                "worker channel closed".to_string(),
            ));
        }
        debug!(%id, method, "request sent");

        let response = match self.config.call_timeout() {
            Some(limit) => tokio::time::timeout(limit, rx)
                .await
                .map_err(|_| DispatchError::Timeout(limit))?,
            None => rx.await,
        };

        response.map_err(|_| DispatchError::ChannelFailed("response channel closed".to_string()))?
    }

    /// Deliver one response line to whoever is waiting for it.
    fn settle(&self, line: &str) {
        let (id, outcome) = match serde_json::from_str::<ResponseEnvelope>(line) {
            Ok(response) => (
                response.id.clone(),
                response.into_outcome().map_err(DispatchError::Remote),
            ),
            Err(err) => match serde_json::from_str::<ResponseId>(line) {
                Ok(ResponseId { id }) => {
                    warn!(%id, error = %err, "malformed worker response");
                    (id, Err(DispatchError::Deserialize(err)))
                }
                Err(_) => {
                    warn!(error = %err, "failed to parse worker response");
                    return;
                }
            },
        };

        let waiter = lock(&self.pending).remove(&id);
        match waiter {
            Some(waiter) => {
                let _ = waiter.send(outcome);
            }
            None if id.starts_with(NOTIFICATION_PREFIX) => {}
            None => {
                self.unmatched.fetch_add(1, Ordering::Relaxed);
                debug!(%id, "discarding response with no pending request");
            }
        }
    }

    fn reject_pending(&self, error: impl Fn() -> DispatchError) {
        let drained: Vec<Waiter> = lock(&self.pending).drain().map(|(_, w)| w).collect();
        for waiter in drained {
            let _ = waiter.send(Err(error()));
        }
    }

    /// Abandon `failed` and switch to the in-process engine, unless some other
    /// path already has.
    async fn fail_over(&self, failed: &Arc<WorkerLink>, reason: String) {
        let claimed = self.route.send_if_modified(|route| {
            let current = route.link().is_some_and(|link| Arc::ptr_eq(link, failed));
            if current {
                *route = Route::Recovering;
            }
            current
        });
        if !claimed {
            debug!(%reason, "ignoring failure of a retired worker channel");
            return;
        }

        warn!(%reason, "worker channel failed, falling back to in-process execution");
        self.reject_pending(|| DispatchError::ChannelFailed(reason.clone()));
        failed.terminate();
        self.install_fallback().await;
    }

    async fn install_fallback(&self) {
        let options = lock(&self.engine_options).clone();
        let next = match self.factory.create(options).await {
            Ok(engine) => Route::Fallback(engine),
            Err(err) => {
                error!(error = %err, "failed to start in-process search engine");
                Route::Failed(err.to_string())
            }
        };

        let installed = self.route.send_if_modified(|route| {
            let open = matches!(route, Route::Starting | Route::Recovering);
            if open {
                *route = next;
            }
            open
        });
        if installed {
            info!("search engine running in-process");
        }
    }

    async fn initialize(self: Arc<Self>) {
        self.started.store(true, Ordering::Release);

        if self.config.no_worker || !self.launcher.is_supported() {
            debug!(
                no_worker = self.config.no_worker,
                "worker execution unavailable"
            );
            self.install_fallback().await;
            return;
        }

        let launched = self
            .config
            .worker_location()
            .map_err(LaunchError::from)
            .and_then(|location| self.launcher.launch(&location));
        let (outbound, events, handle) = match launched {
            Ok(channel) => channel.into_parts(),
            Err(err) => {
                warn!(error = %err, "failed to start worker, falling back to in-process execution");
                self.install_fallback().await;
                return;
            }
        };

        let link = Arc::new(WorkerLink {
            outbound,
            handle: Mutex::new(handle),
        });
        self.route.send_replace(Route::Handshake(Arc::clone(&link)));
        tokio::spawn(Self::observe(
            Arc::downgrade(&self),
            Arc::downgrade(&link),
            events,
        ));

        let options = lock(&self.engine_options).clone();
        let handshake = self.request(&link, Call::Init(options));
        match tokio::time::timeout(self.config.init_timeout(), handshake).await {
            Ok(Ok(_)) => {
                let promoted = self.route.send_if_modified(|route| {
                    let current = matches!(route, Route::Handshake(l) if Arc::ptr_eq(l, &link));
                    if current {
                        *route = Route::Worker(Arc::clone(&link));
                    }
                    current
                });
                if promoted {
                    info!("worker ready");
                }
            }
            Ok(Err(err)) => {
                self.fail_over(&link, format!("worker initialization failed: {err}"))
                    .await;
            }
            Err(_) => {
                self.fail_over(&link, "Worker initialization timeout".to_string())
                    .await;
            }
        }
    }

    /// Watches one channel's events until it fails or closes.
    async fn observe(
        shared: Weak<Self>,
        link: Weak<WorkerLink>,
        mut events: mpsc::UnboundedReceiver<ChannelEvent>,
    ) {
        let reason = loop {
            let Some(event) = events.recv().await else {
                break "worker channel closed".to_string();
            };
            let Some(current) = shared.upgrade() else {
                return;
            };
            match event {
                ChannelEvent::Message(line) => current.settle(&line),
                ChannelEvent::Error(reason) => break reason,
            }
        };

        if let (Some(shared), Some(link)) = (shared.upgrade(), link.upgrade()) {
            shared.fail_over(&link, reason).await;
        }
    }

    /// Turn string `data` fields into remote accessors. Any other `data` is
    /// taken as an already resolved payload.
    fn attach_accessors(self: &Arc<Self>, results: SearchResults<Value>) -> SearchResults<DataAccessor> {
        let shared = Arc::downgrade(self);
        results.map_data(|_, data| match data {
            Value::String(handle) => DataAccessor::remote(handle, shared.clone()),
            payload => DataAccessor::local(DataProvider::ready(payload)),
        })
    }

    pub(crate) async fn get_data(&self, handle: &str) -> DispatchResult<Value> {
        match self.target().await? {
            Target::Worker(link) => {
                self.request(
                    &link,
                    Call::GetData {
                        handle: handle.to_string(),
                    },
                )
                .await
            }
            Target::Fallback(_) => Err(DispatchError::DataUnavailable(handle.to_string())),
        }
    }

    /// Fire-and-forget `releaseData`. Does nothing outside worker mode.
    pub(crate) fn release_data(&self, handle: &str) {
        let link = match &*self.route.borrow() {
            Route::Worker(link) => Arc::clone(link),
            _ => return,
        };

        let id = self.next_id(NOTIFICATION_PREFIX);
        let call = Call::ReleaseData {
            handle: handle.to_string(),
        };
        let line = call
            .into_envelope(id)
            .ok()
            .and_then(|envelope| serde_json::to_string(&envelope).ok());

        match line {
            Some(line) => {
                if link.post(line) {
                    debug!(handle, "data handle released");
                } else {
                    debug!(handle, "could not send data release");
                }
            }
            None => debug!(handle, "could not encode data release"),
        }
    }
}

/// Dual-mode dispatcher for search engine calls.
///
/// Construction starts initialization in the background and returns right
/// away. Calls made before initialization settles wait for it. Once settled,
/// each call goes either to the worker over its channel or straight to an
/// in-process engine. Any channel failure switches the dispatcher to the
/// in-process engine for the rest of its life.
///
/// Cloning is cheap and every clone drives the same dispatcher.
///
/// # Example
///
/// ```ignore
/// use pagefind_dispatch::{Dispatcher, DispatcherConfig, SearchOptions};
///
/// let dispatcher = Dispatcher::threaded(DispatcherConfig::default(), factory);
/// let results = dispatcher.search("hello", SearchOptions::default()).await?;
/// for hit in &results.results {
///     let fragment = hit.data.load().await?;
/// }
/// dispatcher.destroy().await?;
/// ```
#[derive(Clone)]
pub struct Dispatcher {
    shared: Arc<Shared>,
}

impl Dispatcher {
    /// Create a dispatcher that starts workers with `launcher`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        config: DispatcherConfig,
        factory: Arc<dyn EngineFactory>,
        launcher: Arc<dyn WorkerLauncher>,
    ) -> Self {
        let (route, _) = watch::channel(Route::Starting);
        let engine_options = config.engine_options();
        debug!(base_path = ?engine_options.base_path, "creating dispatcher");

        let shared = Arc::new(Shared {
            config,
            launcher,
            factory,
            engine_options: Mutex::new(engine_options),
            next_id: AtomicU64::new(0),
            pending: Mutex::new(HashMap::new()),
            route,
            started: AtomicBool::new(false),
            unmatched: AtomicU64::new(0),
        });

        tokio::spawn(Arc::clone(&shared).initialize());

        Self { shared }
    }

    /// Create a dispatcher whose worker runs on a dedicated thread, built by
    /// the same factory as the fallback.
    pub fn threaded(config: DispatcherConfig, factory: Arc<dyn EngineFactory>) -> Self {
        let capacity = NonZeroUsize::new(config.handle_capacity).unwrap_or(DEFAULT_HANDLE_CAPACITY);
        let launcher = ThreadLauncher::new(Arc::clone(&factory)).with_handle_capacity(capacity);
        Self::new(config, factory, Arc::new(launcher))
    }

    /// Create a dispatcher whose worker is the executable at the configured
    /// worker location.
    pub fn with_process(config: DispatcherConfig, factory: Arc<dyn EngineFactory>) -> Self {
        Self::new(config, factory, Arc::new(ProcessLauncher::new()))
    }

    pub fn state(&self) -> DispatcherState {
        if !self.shared.started.load(Ordering::Acquire) {
            return DispatcherState::Uninitialized;
        }
        match &*self.shared.route.borrow() {
            Route::Starting | Route::Handshake(_) => DispatcherState::Initializing,
            Route::Worker(_) => DispatcherState::ReadyWorker,
            Route::Recovering | Route::Fallback(_) | Route::Failed(_) => {
                DispatcherState::ReadyFallback
            }
            Route::Destroyed => DispatcherState::Destroyed,
        }
    }

    /// The normalized base path.
    pub fn base_path(&self) -> String {
        self.shared.config.resolved_base_path()
    }

    /// Number of calls waiting for a worker response.
    pub fn pending_calls(&self) -> usize {
        lock(&self.shared.pending).len()
    }

    /// Number of worker responses that matched no pending call.
    pub fn unmatched_responses(&self) -> u64 {
        self.shared.unmatched.load(Ordering::Relaxed)
    }

    /// Wait for initialization to settle.
    pub async fn init(&self) -> DispatcherState {
        self.shared.settled().await;
        self.state()
    }

    /// Update index options. Also applies to an in-process engine built later.
    pub async fn options(&self, options: IndexOptions) -> DispatchResult<()> {
        lock(&self.shared.engine_options).merge(options.clone());
        match self.shared.target().await? {
            Target::Worker(link) => self
                .shared
                .request(&link, Call::Options(options))
                .await
                .map(drop),
            Target::Fallback(engine) => Ok(engine.options(options).await?),
        }
    }

    pub async fn enter_playground_mode(&self) -> DispatchResult<()> {
        match self.shared.target().await? {
            Target::Worker(link) => self
                .shared
                .request(&link, Call::EnterPlaygroundMode)
                .await
                .map(drop),
            Target::Fallback(engine) => Ok(engine.enter_playground_mode().await?),
        }
    }

    pub async fn merge_index(&self, index_path: &str, options: IndexOptions) -> DispatchResult<()> {
        match self.shared.target().await? {
            Target::Worker(link) => self
                .shared
                .request(
                    &link,
                    Call::MergeIndex {
                        index_path: index_path.to_string(),
                        options,
                    },
                )
                .await
                .map(drop),
            Target::Fallback(engine) => Ok(engine.merge_index(index_path, options).await?),
        }
    }

    pub async fn search(
        &self,
        term: &str,
        options: SearchOptions,
    ) -> DispatchResult<SearchResults<DataAccessor>> {
        match self.shared.target().await? {
            Target::Worker(link) => {
                let value = self
                    .shared
                    .request(
                        &link,
                        Call::Search {
                            term: term.to_string(),
                            options,
                        },
                    )
                    .await?;
                let results: SearchResults<Value> = serde_json::from_value(value)?;
                Ok(self.shared.attach_accessors(results))
            }
            Target::Fallback(engine) => {
                let results = engine.search(term, &options).await?;
                Ok(in_process(results, &options))
            }
        }
    }

    /// Search after `debounce` (300ms when `None`). Resolves to `None` when a
    /// newer debounced search superseded this one.
    pub async fn debounced_search(
        &self,
        term: &str,
        options: SearchOptions,
        debounce: Option<Duration>,
    ) -> DispatchResult<Option<SearchResults<DataAccessor>>> {
        match self.shared.target().await? {
            Target::Worker(link) => {
                let debounce_ms =
                    debounce.map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX));
                let value = self
                    .shared
                    .request(
                        &link,
                        Call::DebouncedSearch {
                            term: term.to_string(),
                            options,
                            debounce_ms,
                        },
                    )
                    .await?;
                let results: Option<SearchResults<Value>> = serde_json::from_value(value)?;
                Ok(results.map(|results| self.shared.attach_accessors(results)))
            }
            Target::Fallback(engine) => {
                let debounce = debounce.unwrap_or(DEFAULT_DEBOUNCE);
                let results = engine.debounced_search(term, &options, debounce).await?;
                Ok(results.map(|results| in_process(results, &options)))
            }
        }
    }

    pub async fn preload(&self, term: &str, options: SearchOptions) -> DispatchResult<()> {
        match self.shared.target().await? {
            Target::Worker(link) => self
                .shared
                .request(
                    &link,
                    Call::Preload {
                        term: term.to_string(),
                        options,
                    },
                )
                .await
                .map(drop),
            Target::Fallback(engine) => Ok(engine.preload(term, &options).await?),
        }
    }

    pub async fn filters(&self) -> DispatchResult<FilterCounts> {
        match self.shared.target().await? {
            Target::Worker(link) => {
                let value = self.shared.request(&link, Call::Filters).await?;
                Ok(serde_json::from_value(value)?)
            }
            Target::Fallback(engine) => Ok(engine.filters().await?),
        }
    }

    /// Load the payload behind a worker data handle.
    pub async fn get_data(&self, handle: &str) -> DispatchResult<Value> {
        self.shared.get_data(handle).await
    }

    /// Let the worker drop a data handle. Fire-and-forget.
    pub fn release_data(&self, handle: &str) {
        self.shared.release_data(handle);
    }

    /// Tear down the worker or the in-process engine.
    ///
    /// Every later call fails with [`DispatchError::Destroyed`]. Calls still
    /// waiting on the worker are rejected the same way.
    pub async fn destroy(&self) -> DispatchResult<()> {
        if let Route::Worker(link) = self.shared.settled().await {
            let goodbye = self.shared.request(&link, Call::Destroy);
            match tokio::time::timeout(self.shared.config.init_timeout(), goodbye).await {
                Ok(Ok(_)) => debug!("worker acknowledged destroy"),
                Ok(Err(err)) => debug!(error = %err, "worker destroy failed"),
                Err(_) => debug!("worker did not acknowledge destroy"),
            }
        }

        let previous = self.shared.route.send_replace(Route::Destroyed);
        if let Some(link) = previous.link() {
            link.terminate();
        }
        self.shared.reject_pending(|| DispatchError::Destroyed);

        if !matches!(previous, Route::Destroyed) {
            info!("dispatcher destroyed");
        }
        Ok(())
    }
}

fn in_process(
    results: SearchResults<DataProvider>,
    options: &SearchOptions,
) -> SearchResults<DataAccessor> {
    let mut results = results.map_data(|_, provider| DataAccessor::local(provider));
    if options.verbose {
        results.search_environment = Some(SearchEnvironment::MainThread);
    }
    results
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
