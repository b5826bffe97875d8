//! The stage abstraction: named, typed input and output ports around an async run.

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use url::Url;

use webrag_shared::{ByteStream, Document, FetchFailure, RagError, ReplyMeta, Result};

// ---------------------------------------------------------------------------
// Values
// ---------------------------------------------------------------------------

/// Data carried along a pipeline edge.
#[derive(Debug, Clone)]
pub enum Value {
    Text(String),
    Count(usize),
    Urls(Vec<Url>),
    Streams(Vec<ByteStream>),
    Failures(Vec<FetchFailure>),
    Documents(Vec<Document>),
    Replies(Vec<String>),
    ReplyMeta(Vec<ReplyMeta>),
}

/// The type of a [`Value`], used to check connections before running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    Text,
    Count,
    Urls,
    Streams,
    Failures,
    Documents,
    Replies,
    ReplyMeta,
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Text => "text",
            Self::Count => "count",
            Self::Urls => "urls",
            Self::Streams => "streams",
            Self::Failures => "failures",
            Self::Documents => "documents",
            Self::Replies => "replies",
            Self::ReplyMeta => "reply metadata",
        };
        f.write_str(name)
    }
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Self::Text(_) => ValueKind::Text,
            Self::Count(_) => ValueKind::Count,
            Self::Urls(_) => ValueKind::Urls,
            Self::Streams(_) => ValueKind::Streams,
            Self::Failures(_) => ValueKind::Failures,
            Self::Documents(_) => ValueKind::Documents,
            Self::Replies(_) => ValueKind::Replies,
            Self::ReplyMeta(_) => ValueKind::ReplyMeta,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_documents(&self) -> Option<&[Document]> {
        match self {
            Self::Documents(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_failures(&self) -> Option<&[FetchFailure]> {
        match self {
            Self::Failures(f) => Some(f),
            _ => None,
        }
    }

    pub fn as_replies(&self) -> Option<&[String]> {
        match self {
            Self::Replies(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_reply_meta(&self) -> Option<&[ReplyMeta]> {
        match self {
            Self::ReplyMeta(m) => Some(m),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Ports
// ---------------------------------------------------------------------------

/// A named input or output slot on a component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Port {
    pub name: String,
    pub kind: ValueKind,
    /// Inputs only: the run cannot start unless this port is fed.
    pub required: bool,
}

impl Port {
    pub fn required(name: impl Into<String>, kind: ValueKind) -> Self {
        Self {
            name: name.into(),
            kind,
            required: true,
        }
    }

    pub fn optional(name: impl Into<String>, kind: ValueKind) -> Self {
        Self {
            name: name.into(),
            kind,
            required: false,
        }
    }
}

/// Values produced by a component, keyed by output port name.
pub type Outputs = BTreeMap<String, Value>;

/// Values handed to a component, keyed by input port name.
#[derive(Debug, Clone, Default)]
pub struct Inputs(BTreeMap<String, Value>);

macro_rules! take_as {
    ($(#[$doc:meta])* $name:ident, $opt:ident, $variant:ident, $ty:ty) => {
        $(#[$doc])*
        pub fn $name(&mut self, port: &str) -> Result<$ty> {
            self.$opt(port)?
                .ok_or_else(|| RagError::pipeline(format!("input '{port}' was not provided")))
        }

        pub fn $opt(&mut self, port: &str) -> Result<Option<$ty>> {
            match self.0.remove(port) {
                None => Ok(None),
                Some(Value::$variant(v)) => Ok(Some(v)),
                Some(other) => Err(RagError::pipeline(format!(
                    "input '{port}' expected {}, got {}",
                    ValueKind::$variant,
                    other.kind()
                ))),
            }
        }
    };
}

impl Inputs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, port: impl Into<String>, value: Value) {
        self.0.insert(port.into(), value);
    }

    take_as!(
        /// Take a text input, failing if it is absent.
        text, opt_text, Text, String
    );
    take_as!(count, opt_count, Count, usize);
    take_as!(urls, opt_urls, Urls, Vec<Url>);
    take_as!(streams, opt_streams, Streams, Vec<ByteStream>);
    take_as!(documents, opt_documents, Documents, Vec<Document>);
}

// ---------------------------------------------------------------------------
// Component
// ---------------------------------------------------------------------------

/// A pipeline stage.
///
/// The executor checks every connection and initial input against
/// [`inputs`](Component::inputs) and [`outputs`](Component::outputs) before
/// calling [`run`](Component::run), so `run` may rely on required inputs
/// being present with the declared kinds.
#[async_trait]
pub trait Component: Send + Sync {
    fn inputs(&self) -> Vec<Port>;

    fn outputs(&self) -> Vec<Port>;

    async fn run(&self, inputs: Inputs) -> Result<Outputs>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_take_checks_kind() {
        let mut inputs = Inputs::new();
        inputs.insert("query", Value::Text("hello".into()));
        inputs.insert("top_k", Value::Text("three".into()));

        assert_eq!(inputs.text("query").unwrap(), "hello");
        assert!(inputs.opt_count("missing").unwrap().is_none());

        let err = inputs.opt_count("top_k").unwrap_err();
        assert!(err.to_string().contains("expected count, got text"));
    }

    #[test]
    fn missing_required_input_is_reported() {
        let mut inputs = Inputs::new();
        let err = inputs.documents("documents").unwrap_err();
        assert!(matches!(err, RagError::Pipeline { .. }));
    }

    #[test]
    fn value_accessors() {
        let value = Value::Replies(vec!["a".into()]);
        assert_eq!(value.kind(), ValueKind::Replies);
        assert_eq!(value.as_replies(), Some(&["a".to_string()][..]));
        assert!(value.as_text().is_none());
    }
}
