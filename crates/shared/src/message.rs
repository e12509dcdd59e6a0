//! Bus message envelope and payload codec.
//!
//! Payloads are postcard-encoded serde types, opaque to the broker. Headers
//! are a flat string map carrying the tracing context and nothing the broker
//! needs to route.
use std::collections::HashMap;

/// Header carrying the originating trace id.
pub const HDR_TRACE_ID: &str = "trace-id";
/// Header carrying the parent span id.
pub const HDR_SPAN_ID: &str = "span-id";

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("Postcard error: {0}")]
    Postcard(#[from] postcard::Error),
}

/// A subject-addressed message.
#[derive(Debug, Clone, Default)]
pub struct Message {
    pub subject: String,
    /// Inbox subject the receiver replies on, if any.
    pub reply: Option<String>,
    pub headers: HashMap<String, String>,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn new(subject: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            subject: subject.into(),
            reply: None,
            headers: HashMap::new(),
            payload,
        }
    }

    /// Decode the payload into a typed value.
    pub fn decode<'a, T: serde::Deserialize<'a>>(&'a self) -> Result<T, CodecError> {
        Ok(postcard::from_bytes(&self.payload)?)
    }

    pub fn trace_context(&self) -> Option<TraceContext> {
        Some(TraceContext {
            trace_id: self.headers.get(HDR_TRACE_ID)?.clone(),
            span_id: self.headers.get(HDR_SPAN_ID).cloned().unwrap_or_default(),
        })
    }

    pub fn with_trace_context(mut self, ctx: &TraceContext) -> Self {
        self.headers.insert(HDR_TRACE_ID.into(), ctx.trace_id.clone());
        self.headers.insert(HDR_SPAN_ID.into(), ctx.span_id.clone());
        self
    }
}

/// Tracing context extracted from message headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceContext {
    pub trace_id: String,
    pub span_id: String,
}

/// Encode a typed value into a payload.
pub fn encode<T: serde::Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
    Ok(postcard::to_allocvec(value)?)
}

/// Error half of a request reply: the semantic kind plus a human message.
#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct ErrorReply {
    pub kind: String,
    pub message: String,
}

/// Reply envelope for request/response endpoints.
#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub enum Reply<T> {
    Ok(T),
    Err(ErrorReply),
}

impl<T> Reply<T> {
    pub fn into_result(self) -> Result<T, ErrorReply> {
        match self {
            Reply::Ok(v) => Ok(v),
            Reply::Err(e) => Err(e),
        }
    }
}
