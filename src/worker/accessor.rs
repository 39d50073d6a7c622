//! Lazy payload accessors attached to search hits.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use serde_json::Value;

use super::dispatcher::Shared;
use super::error::{DispatchError, DispatchResult};
use crate::engine::DataProvider;

/// Loads the payload behind one search hit.
///
/// Hits served in-process hold the engine's provider directly. Hits served by
/// a worker hold a handle id, and loading sends a `getData` request for it.
///
/// A worker keeps the provider alive until told otherwise. Call
/// [`release`](Self::release) when the hit is no longer needed; dropping the
/// last clone of an accessor releases it too. Neither is required for
/// correctness, since the worker's handle table is bounded and `destroy`
/// clears it.
#[derive(Clone)]
pub struct DataAccessor(Source);

#[derive(Clone)]
enum Source {
    Local(DataProvider),
    Remote(Arc<RemoteData>),
}

struct RemoteData {
    handle: String,
    shared: Weak<Shared>,
    released: AtomicBool,
}

impl RemoteData {
    fn release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(shared) = self.shared.upgrade() {
            shared.release_data(&self.handle);
        }
    }
}

impl Drop for RemoteData {
    fn drop(&mut self) {
        self.release();
    }
}

impl DataAccessor {
    pub(crate) fn local(provider: DataProvider) -> Self {
        Self(Source::Local(provider))
    }

    pub(crate) fn remote(handle: String, shared: Weak<Shared>) -> Self {
        Self(Source::Remote(Arc::new(RemoteData {
            handle,
            shared,
            released: AtomicBool::new(false),
        })))
    }

    /// Fetch the payload.
    pub async fn load(&self) -> DispatchResult<Value> {
        match &self.0 {
            Source::Local(provider) => Ok(provider.load().await?),
            Source::Remote(remote) => {
                let shared = remote.shared.upgrade().ok_or(DispatchError::Destroyed)?;
                shared.get_data(&remote.handle).await
            }
        }
    }

    /// Tell the worker it may drop this hit's provider. Fire-and-forget, and
    /// only the first call on any clone has an effect.
    pub fn release(&self) {
        if let Source::Remote(remote) = &self.0 {
            remote.release();
        }
    }

    /// The worker-side handle id, for hits served by a worker.
    pub fn handle_id(&self) -> Option<&str> {
        match &self.0 {
            Source::Local(_) => None,
            Source::Remote(remote) => Some(&remote.handle),
        }
    }

    pub fn is_remote(&self) -> bool {
        matches!(self.0, Source::Remote(_))
    }
}

impl fmt::Debug for DataAccessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            Source::Local(_) => f.write_str("DataAccessor::Local"),
            Source::Remote(remote) => f
                .debug_tuple("DataAccessor::Remote")
                .field(&remote.handle)
                .finish(),
        }
    }
}
