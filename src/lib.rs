//! # Pagefind Dispatch
//!
//! A dual-mode dispatcher for a static-site search engine.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                  Dispatcher (client API)                 │
//! │  (init, search, debounced search, filters, data, ...)    │
//! └─────────────────────────────────────────────────────────┘
//!               │                             │
//!               ▼ [worker mode]               ▼ [fallback]
//! ┌───────────────────────────┐ ┌───────────────────────────┐
//! │  Request/response channel │ │   In-process SearchEngine │
//! │  + data handle accessors  │ │   + direct data providers │
//! └───────────────────────────┘ └───────────────────────────┘
//!               │
//!               ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │           WorkerHost (engine + handle table)             │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! The engine itself is supplied by the caller through [`EngineFactory`].

pub mod config;
pub mod engine;
pub mod worker;

pub use config::{DispatcherConfig, Settings, SettingsError};
pub use engine::{
    DataLoader, DataProvider, EngineError, EngineFactory, EngineResult, FilterCounts,
    IndexOptions, SearchEngine, SearchEnvironment, SearchHit, SearchOptions, SearchResults,
};
pub use worker::{DataAccessor, DispatchError, DispatchResult, Dispatcher, DispatcherState};
