//! Frame bodies and the inbound request surface.

use crate::{header::BodyType, Error};
use bytes::Bytes;
use futures::stream::BoxStream;
use serde::Deserialize;
use serde_json::Value;

/// A decoded frame body.
#[derive(Clone, Debug, PartialEq)]
pub enum Body {
    Binary(Bytes),
    Utf8(String),
    Json(Value),
}

impl Body {
    pub fn body_type(&self) -> BodyType {
        match self {
            Self::Binary(_) => BodyType::Binary,
            Self::Utf8(_) => BodyType::Utf8,
            Self::Json(_) => BodyType::Json,
        }
    }

    pub(crate) fn encode(self) -> Result<(BodyType, Bytes), Error> {
        Ok(match self {
            Self::Binary(bytes) => (BodyType::Binary, bytes),
            Self::Utf8(text) => (BodyType::Utf8, text.into_bytes().into()),
            Self::Json(value) => (
                BodyType::Json,
                serde_json::to_vec(&value).map_err(Error::EncodeJson)?.into(),
            ),
        })
    }

    pub(crate) fn decode(body_type: BodyType, bytes: Bytes) -> Result<Self, Error> {
        Ok(match body_type {
            BodyType::Binary => Self::Binary(bytes),
            BodyType::Utf8 => Self::Utf8(
                String::from_utf8(bytes.to_vec()).map_err(Error::InvalidUtf8)?,
            ),
            BodyType::Json => {
                Self::Json(serde_json::from_slice(&bytes).map_err(Error::InvalidJson)?)
            }
        })
    }
}

/// The lazy sequence of values a source handler produces.
pub type SourceValues = BoxStream<'static, Result<Body, Error>>;

/// Dispatch target for inbound requests.
///
/// Only `source` requests reach the handler; other request kinds from newer
/// peers are logged and ignored by the read loop rather than treated as
/// protocol errors.
pub trait RequestHandler: Send + Sync + 'static {
    /// Serve a streaming request. Every value produced is sent back as one
    /// response frame; the stream ending cleanly produces the terminal end
    /// marker, and an `Err` produces a terminal error frame carrying its
    /// text.
    fn handle_source(&self, name: &[String], args: &Value) -> SourceValues;
}

/// The JSON envelope carried by request frames.
#[derive(Debug, Deserialize)]
pub(crate) struct Envelope {
    pub name: Vec<String>,
    #[serde(default)]
    pub args: Value,
    #[serde(rename = "type", default)]
    pub kind: String,
}

/// The closed set of call kinds this protocol distinguishes.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum RequestKind {
    Async,
    Source,
    Unknown,
}

impl RequestKind {
    pub fn parse(kind: &str) -> Self {
        match kind {
            "async" => Self::Async,
            "source" => Self::Source,
            _ => Self::Unknown,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Async => "async",
            Self::Source => "source",
            Self::Unknown => "unknown",
        }
    }
}
