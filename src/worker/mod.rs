//! Worker dispatch module.
//!
//! A [`Dispatcher`] runs the search engine off the caller's thread when it can
//! and in-process when it can't. Both paths expose the same operations with the
//! same results, so callers never need to know which one served them.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                    Caller (tokio runtime)                       │
//! │  ┌───────────────────────────────────────────────────────────┐  │
//! │  │                     Dispatcher                            │  │
//! │  │  - Starts one worker through a WorkerLauncher             │  │
//! │  │  - Request ids correlate concurrent calls                 │  │
//! │  │  - Falls back to an in-process engine on any failure      │  │
//! │  └───────────────────────────────────────────────────────────┘  │
//! │            │ requests (JSON)              ▲ responses (JSON)    │
//! │            ▼                              │                     │
//! └─────────────────────────────────────────────────────────────────┘
//!              │                              │
//!              ▼                              │
//! ┌─────────────────────────────────────────────────────────────────┐
//! │        WorkerHost (dedicated thread or child process)           │
//! │  - Owns one engine instance                                     │
//! │  - Keeps data handles for hits it returned                      │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use pagefind_dispatch::worker::{Dispatcher, DispatcherState};
//!
//! let dispatcher = Dispatcher::threaded(config, factory);
//! assert_eq!(dispatcher.init().await, DispatcherState::ReadyWorker);
//!
//! let results = dispatcher.search("rust", SearchOptions::default()).await?;
//! let page = results.results[0].data.load().await?;
//!
//! // Releases every outstanding handle on the worker
//! dispatcher.destroy().await?;
//! ```

mod accessor;
mod channel;
mod dispatcher;
mod error;
mod host;
pub mod protocol;

pub use accessor::DataAccessor;
pub use channel::{
    ChannelEvent, NoWorkers, ProcessLauncher, ThreadLauncher, WorkerChannel, WorkerHandle,
    WorkerLauncher,
};
pub use dispatcher::{Dispatcher, DispatcherState};
pub use error::{DispatchError, DispatchResult, HandlerError, LaunchError};
pub use host::{handle_id, WorkerHost, DEFAULT_HANDLE_CAPACITY};
