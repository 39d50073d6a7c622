//! The search engine capability.
//!
//! The dispatcher never looks inside the engine. It only needs something that
//! answers the operations below and a factory that builds one from
//! [`IndexOptions`]. The same engine type runs on both sides of the channel:
//! inside the worker for normal operation, and in-process once the dispatcher
//! has fallen back.
//!
//! Search hits carry their payload lazily. The engine attaches a
//! [`DataProvider`] to each hit, and nothing is loaded until a caller asks.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Debounce interval applied when a caller does not pick one.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(300);

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Failure reported by the engine.
///
/// Only the message crosses the channel, so this is all the dispatcher keeps.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct EngineError {
    message: String,
}

impl EngineError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Filter name -> value -> hit count.
pub type FilterCounts = BTreeMap<String, BTreeMap<String, u64>>;

// ============================================================================
// Options
// ============================================================================

/// Index-level options, accepted at construction and by `options`/`mergeIndex`.
///
/// Keys the dispatcher does not know about are carried through untouched in
/// `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct IndexOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub excerpt_length: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub highlight_param: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index_weight: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub merge_filter: Option<Map<String, Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ranking: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl IndexOptions {
    /// Overlay `other` on top of `self`: fields set in `other` win.
    pub fn merge(&mut self, other: IndexOptions) {
        macro_rules! take {
            ($($field:ident),*) => {
                $(if other.$field.is_some() { self.$field = other.$field; })*
            };
        }
        take!(
            base_path,
            base_url,
            language,
            excerpt_length,
            highlight_param,
            index_weight,
            merge_filter,
            ranking
        );
        self.extra.extend(other.extra);
    }
}

/// Per-call search options.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SearchOptions {
    /// Stamp the results with the execution mode that served them.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub verbose: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filters: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sort: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl SearchOptions {
    pub fn verbose() -> Self {
        Self {
            verbose: true,
            ..Self::default()
        }
    }
}

// ============================================================================
// Results
// ============================================================================

/// Where a verbose search was actually served.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SearchEnvironment {
    #[serde(rename = "webworker")]
    Worker,
    #[serde(rename = "mainthread")]
    MainThread,
}

/// A single hit. `D` is whatever stands in for the lazy payload on this side
/// of the channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit<D> {
    pub id: String,
    #[serde(default)]
    pub score: f64,
    #[serde(default)]
    pub words: Vec<u32>,
    pub data: D,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl<D> SearchHit<D> {
    pub fn new(id: impl Into<String>, score: f64, data: D) -> Self {
        Self {
            id: id.into(),
            score,
            words: Vec::new(),
            data,
            extra: Map::new(),
        }
    }

    pub fn with_words(mut self, words: Vec<u32>) -> Self {
        self.words = words;
        self
    }
}

/// The outcome of a search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResults<D> {
    pub results: Vec<SearchHit<D>>,
    #[serde(default)]
    pub unfiltered_result_count: usize,
    #[serde(default)]
    pub filters: FilterCounts,
    #[serde(default)]
    pub total_filters: FilterCounts,
    #[serde(
        rename = "search_environment",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub search_environment: Option<SearchEnvironment>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl<D> SearchResults<D> {
    pub fn new(results: Vec<SearchHit<D>>) -> Self {
        Self {
            unfiltered_result_count: results.len(),
            results,
            filters: FilterCounts::new(),
            total_filters: FilterCounts::new(),
            search_environment: None,
            extra: Map::new(),
        }
    }

    /// Replace every hit's `data`, passing the hit's index alongside it.
    pub fn map_data<E>(self, mut f: impl FnMut(usize, D) -> E) -> SearchResults<E> {
        SearchResults {
            results: self
                .results
                .into_iter()
                .enumerate()
                .map(|(index, hit)| {
                    let SearchHit {
                        id,
                        score,
                        words,
                        data,
                        extra,
                    } = hit;
                    SearchHit {
                        id,
                        score,
                        words,
                        data: f(index, data),
                        extra,
                    }
                })
                .collect(),
            unfiltered_result_count: self.unfiltered_result_count,
            filters: self.filters,
            total_filters: self.total_filters,
            search_environment: self.search_environment,
            extra: self.extra,
        }
    }
}

// ============================================================================
// Lazy data
// ============================================================================

/// Loads the payload behind one hit.
#[async_trait]
pub trait DataLoader: Send + Sync {
    async fn load(&self) -> EngineResult<Value>;
}

struct FnLoader<F>(F);

#[async_trait]
impl<F, Fut> DataLoader for FnLoader<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = EngineResult<Value>> + Send,
{
    async fn load(&self) -> EngineResult<Value> {
        (self.0)().await
    }
}

/// Cloneable handle to a hit's [`DataLoader`].
#[derive(Clone)]
pub struct DataProvider(Arc<dyn DataLoader>);

impl DataProvider {
    pub fn new(loader: impl DataLoader + 'static) -> Self {
        Self(Arc::new(loader))
    }

    pub fn from_fn<F, Fut>(f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = EngineResult<Value>> + Send + 'static,
    {
        Self::new(FnLoader(f))
    }

    /// A provider that already holds its payload.
    pub fn ready(value: Value) -> Self {
        Self::from_fn(move || {
            let value = value.clone();
            async move { Ok(value) }
        })
    }

    pub async fn load(&self) -> EngineResult<Value> {
        self.0.load().await
    }
}

impl fmt::Debug for DataProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DataProvider(..)")
    }
}

// ============================================================================
// Engine traits
// ============================================================================

/// The operations a search engine offers.
#[async_trait]
pub trait SearchEngine: Send + Sync {
    async fn options(&self, options: IndexOptions) -> EngineResult<()>;

    async fn enter_playground_mode(&self) -> EngineResult<()>;

    async fn merge_index(&self, index_path: &str, options: IndexOptions) -> EngineResult<()>;

    async fn search(
        &self,
        term: &str,
        options: &SearchOptions,
    ) -> EngineResult<SearchResults<DataProvider>>;

    /// Like `search`, but waits out `debounce` first. Returns `None` when a
    /// newer debounced call arrived in the meantime.
    async fn debounced_search(
        &self,
        term: &str,
        options: &SearchOptions,
        debounce: Duration,
    ) -> EngineResult<Option<SearchResults<DataProvider>>>;

    async fn preload(&self, term: &str, options: &SearchOptions) -> EngineResult<()>;

    async fn filters(&self) -> EngineResult<FilterCounts>;
}

/// Builds engine instances.
#[async_trait]
pub trait EngineFactory: Send + Sync {
    async fn create(&self, options: IndexOptions) -> EngineResult<Arc<dyn SearchEngine>>;
}
