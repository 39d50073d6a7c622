//! Wire types shared by the dispatcher and the worker host.
//!
//! Messages travel as NDJSON: one JSON object per line, in both directions.
//!
//! ```text
//! -> {"id":"msg_3","method":"search","args":["hello",{"verbose":true}]}
//! <- {"id":"msg_3","result":{"results":[...],...}}
//! <- {"id":"msg_4","error":"Data function data_msg_1_0 not found"}
//! ```
//!
//! On the Rust side every request is a [`Call`], so a malformed method can only
//! come from a foreign peer.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::engine::{IndexOptions, SearchOptions};

// ============================================================================
// Request/Response Envelope
// ============================================================================

/// Request envelope sent to the worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    /// Correlation id, unique per dispatcher.
    pub id: String,
    /// Method name (e.g., "search").
    pub method: String,
    /// Positional, method-specific arguments.
    #[serde(default)]
    pub args: Vec<Value>,
}

/// Response envelope received from the worker.
///
/// Exactly one of `result` and `error` is set. A response with neither is a
/// success carrying `null`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    /// Id of the request this answers.
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ResponseEnvelope {
    pub fn success(id: impl Into<String>, result: Value) -> Self {
        Self {
            id: id.into(),
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            result: None,
            error: Some(error.into()),
        }
    }

    /// Split into the success payload or the error message.
    pub fn into_outcome(self) -> Result<Value, String> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

// ============================================================================
// Methods
// ============================================================================

/// Method names as they appear on the wire.
pub mod methods {
    pub const INIT: &str = "init";
    pub const OPTIONS: &str = "options";
    pub const ENTER_PLAYGROUND_MODE: &str = "enterPlaygroundMode";
    pub const MERGE_INDEX: &str = "mergeIndex";
    pub const SEARCH: &str = "search";
    pub const DEBOUNCED_SEARCH: &str = "debouncedSearch";
    pub const PRELOAD: &str = "preload";
    pub const FILTERS: &str = "filters";
    pub const GET_DATA: &str = "getData";
    pub const RELEASE_DATA: &str = "releaseData";
    pub const DESTROY: &str = "destroy";
}

/// Prefix of ordinary request ids.
pub const REQUEST_PREFIX: &str = "msg_";

/// Prefix of fire-and-forget notification ids. Their responses are ignored.
pub const NOTIFICATION_PREFIX: &str = "release_";

/// Errors decoding a request's method and arguments.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Unknown method: {0}")]
    UnknownMethod(String),

    #[error("missing argument {index} for {method}")]
    MissingArgument { method: &'static str, index: usize },

    #[error("invalid argument {index} for {method}: {source}")]
    InvalidArgument {
        method: &'static str,
        index: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to encode request: {0}")]
    Encode(#[source] serde_json::Error),
}

/// One request, with its arguments typed.
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Init(IndexOptions),
    Options(IndexOptions),
    EnterPlaygroundMode,
    MergeIndex {
        index_path: String,
        options: IndexOptions,
    },
    Search {
        term: String,
        options: SearchOptions,
    },
    DebouncedSearch {
        term: String,
        options: SearchOptions,
        debounce_ms: Option<u64>,
    },
    Preload {
        term: String,
        options: SearchOptions,
    },
    Filters,
    GetData {
        handle: String,
    },
    ReleaseData {
        handle: String,
    },
    Destroy,
}

impl Call {
    pub fn method(&self) -> &'static str {
        match self {
            Call::Init(_) => methods::INIT,
            Call::Options(_) => methods::OPTIONS,
            Call::EnterPlaygroundMode => methods::ENTER_PLAYGROUND_MODE,
            Call::MergeIndex { .. } => methods::MERGE_INDEX,
            Call::Search { .. } => methods::SEARCH,
            Call::DebouncedSearch { .. } => methods::DEBOUNCED_SEARCH,
            Call::Preload { .. } => methods::PRELOAD,
            Call::Filters => methods::FILTERS,
            Call::GetData { .. } => methods::GET_DATA,
            Call::ReleaseData { .. } => methods::RELEASE_DATA,
            Call::Destroy => methods::DESTROY,
        }
    }

    /// Whether the worker needs an engine instance to answer this call.
    pub fn needs_engine(&self) -> bool {
        !matches!(
            self,
            Call::Init(_) | Call::GetData { .. } | Call::ReleaseData { .. } | Call::Destroy
        )
    }

    /// Wrap this call in an envelope with the given id.
    pub fn into_envelope(self, id: impl Into<String>) -> Result<RequestEnvelope, ProtocolError> {
        let method = self.method().to_string();
        let args = match self {
            Call::Init(options) | Call::Options(options) => vec![encode(options)?],
            Call::EnterPlaygroundMode | Call::Filters | Call::Destroy => Vec::new(),
            Call::MergeIndex {
                index_path,
                options,
            } => vec![Value::String(index_path), encode(options)?],
            Call::Search { term, options } | Call::Preload { term, options } => {
                vec![Value::String(term), encode(options)?]
            }
            Call::DebouncedSearch {
                term,
                options,
                debounce_ms,
            } => vec![Value::String(term), encode(options)?, encode(debounce_ms)?],
            Call::GetData { handle } | Call::ReleaseData { handle } => {
                vec![Value::String(handle)]
            }
        };

        Ok(RequestEnvelope {
            id: id.into(),
            method,
            args,
        })
    }

    /// Decode a method name and its positional arguments.
    pub fn from_envelope(method: &str, args: Vec<Value>) -> Result<Self, ProtocolError> {
        let method = canonical_method(method)
            .ok_or_else(|| ProtocolError::UnknownMethod(method.to_string()))?;
        let mut args = Args::new(method, args);

        let call = match method {
            methods::INIT => Call::Init(args.optional()?),
            methods::OPTIONS => Call::Options(args.optional()?),
            methods::ENTER_PLAYGROUND_MODE => Call::EnterPlaygroundMode,
            methods::MERGE_INDEX => Call::MergeIndex {
                index_path: args.required()?,
                options: args.optional()?,
            },
            methods::SEARCH => Call::Search {
                term: args.optional()?,
                options: args.optional()?,
            },
            methods::DEBOUNCED_SEARCH => Call::DebouncedSearch {
                term: args.optional()?,
                options: args.optional()?,
                debounce_ms: args.optional()?,
            },
            methods::PRELOAD => Call::Preload {
                term: args.optional()?,
                options: args.optional()?,
            },
            methods::FILTERS => Call::Filters,
            methods::GET_DATA => Call::GetData {
                handle: args.required()?,
            },
            methods::RELEASE_DATA => Call::ReleaseData {
                handle: args.optional()?,
            },
            methods::DESTROY => Call::Destroy,
            other => return Err(ProtocolError::UnknownMethod(other.to_string())),
        };

        Ok(call)
    }
}

fn canonical_method(method: &str) -> Option<&'static str> {
    [
        methods::INIT,
        methods::OPTIONS,
        methods::ENTER_PLAYGROUND_MODE,
        methods::MERGE_INDEX,
        methods::SEARCH,
        methods::DEBOUNCED_SEARCH,
        methods::PRELOAD,
        methods::FILTERS,
        methods::GET_DATA,
        methods::RELEASE_DATA,
        methods::DESTROY,
    ]
    .into_iter()
    .find(|known| *known == method)
}

fn encode<T: Serialize>(value: T) -> Result<Value, ProtocolError> {
    serde_json::to_value(value).map_err(ProtocolError::Encode)
}

/// Cursor over positional arguments.
struct Args {
    method: &'static str,
    index: usize,
    values: std::vec::IntoIter<Value>,
}

impl Args {
    fn new(method: &'static str, values: Vec<Value>) -> Self {
        Self {
            method,
            index: 0,
            values: values.into_iter(),
        }
    }

    fn take(&mut self) -> (usize, Option<Value>) {
        let index = self.index;
        self.index += 1;
        (index, self.values.next().filter(|v| !v.is_null()))
    }

    fn decode<T: DeserializeOwned>(&self, index: usize, value: Value) -> Result<T, ProtocolError> {
        serde_json::from_value(value).map_err(|source| ProtocolError::InvalidArgument {
            method: self.method,
            index,
            source,
        })
    }

    /// Next argument; missing or `null` decodes as the default.
    fn optional<T: DeserializeOwned + Default>(&mut self) -> Result<T, ProtocolError> {
        match self.take() {
            (index, Some(value)) => self.decode(index, value),
            (_, None) => Ok(T::default()),
        }
    }

    fn required<T: DeserializeOwned>(&mut self) -> Result<T, ProtocolError> {
        match self.take() {
            (index, Some(value)) => self.decode(index, value),
            (index, None) => Err(ProtocolError::MissingArgument {
                method: self.method,
                index,
            }),
        }
    }
}
