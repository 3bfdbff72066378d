use std::fmt;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{CodecError, Result};

/// Envelope key of the qualifier.
pub const QUALIFIER_FIELD: &str = "q";
/// Envelope key of the stream id.
pub const STREAM_ID_FIELD: &str = "sid";
/// Envelope key of the data.
pub const DATA_FIELD: &str = "d";

/// Qualifier of messages produced by [`PubSubMessage::error`].
pub const ERROR_QUALIFIER: &str = "/pubwire/error";

/// Payload of a [`PubSubMessage`].
#[derive(Debug, Clone, PartialEq)]
pub enum MessageData {
    /// Opaque bytes, spliced into the envelope verbatim.
    ///
    /// After decoding this is a zero-copy view into the received buffer.
    Binary(Bytes),
    /// A structured value, embedded as regular JSON.
    Value(serde_json::Value),
}

impl MessageData {
    /// True for a zero-length binary payload or a JSON `null`, both of which
    /// are encoded as "no data field".
    pub fn is_empty(&self) -> bool {
        match self {
            MessageData::Binary(bytes) => bytes.is_empty(),
            MessageData::Value(value) => value.is_null(),
        }
    }

    /// The binary payload, if this is binary data.
    pub fn as_binary(&self) -> Option<&Bytes> {
        match self {
            MessageData::Binary(bytes) => Some(bytes),
            MessageData::Value(_) => None,
        }
    }
}

/// An application-level pub/sub message.
///
/// Immutable once built; use [`PubSubMessage::builder`] or
/// [`PubSubMessage::to_builder`] to construct variations.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PubSubMessage {
    qualifier: Option<String>,
    stream_id: Option<i64>,
    data: Option<MessageData>,
}

impl PubSubMessage {
    pub fn new(
        qualifier: Option<String>,
        stream_id: Option<i64>,
        data: Option<MessageData>,
    ) -> Self {
        Self {
            qualifier,
            stream_id,
            data,
        }
    }

    /// Start building a message.
    pub fn builder() -> MessageBuilder {
        MessageBuilder::default()
    }

    /// A builder pre-populated with this message's fields.
    pub fn to_builder(&self) -> MessageBuilder {
        MessageBuilder {
            qualifier: self.qualifier.clone(),
            stream_id: self.stream_id,
            data: self.data.clone(),
        }
    }

    /// An error notification carrying the display text of `err`.
    pub fn error(err: &CodecError) -> Self {
        Self::builder()
            .qualifier(ERROR_QUALIFIER)
            .value(serde_json::json!({ "error": err.to_string() }))
            .build()
    }

    /// Routing/topic identifier.
    pub fn qualifier(&self) -> Option<&str> {
        self.qualifier.as_deref()
    }

    /// Stream identifier.
    pub fn stream_id(&self) -> Option<i64> {
        self.stream_id
    }

    /// Payload, if any.
    pub fn data(&self) -> Option<&MessageData> {
        self.data.as_ref()
    }

    /// True if this is an error notification from [`PubSubMessage::error`].
    pub fn is_error(&self) -> bool {
        self.qualifier.as_deref() == Some(ERROR_QUALIFIER)
    }

    /// Materialize the payload as `T`.
    ///
    /// Binary data is parsed as JSON text; this is how a decoded message's
    /// data (always a byte slice of the envelope) is turned back into a value.
    pub fn data_as<T: DeserializeOwned>(&self) -> Result<Option<T>> {
        let invalid = |source| CodecError::InvalidField {
            field: DATA_FIELD,
            source,
        };
        match &self.data {
            None => Ok(None),
            Some(MessageData::Binary(bytes)) => {
                serde_json::from_slice(bytes).map(Some).map_err(invalid)
            }
            Some(MessageData::Value(value)) => {
                T::deserialize(value).map(Some).map_err(invalid)
            }
        }
    }
}

impl fmt::Display for PubSubMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PubSubMessage{{qualifier=")?;
        match &self.qualifier {
            Some(qualifier) => write!(f, "'{qualifier}'")?,
            None => f.write_str("null")?,
        }
        write!(f, ", streamId=")?;
        match self.stream_id {
            Some(stream_id) => write!(f, "{stream_id}")?,
            None => f.write_str("null")?,
        }
        write!(f, ", data=")?;
        match &self.data {
            Some(MessageData::Binary(bytes)) => write!(f, "<{} bytes>", bytes.len())?,
            Some(MessageData::Value(value)) => write!(f, "{value}")?,
            None => f.write_str("null")?,
        }
        f.write_str("}")
    }
}

/// Builder for [`PubSubMessage`].
#[derive(Debug, Clone, Default)]
pub struct MessageBuilder {
    qualifier: Option<String>,
    stream_id: Option<i64>,
    data: Option<MessageData>,
}

impl MessageBuilder {
    /// Set the qualifier.
    pub fn qualifier(mut self, qualifier: impl Into<String>) -> Self {
        self.qualifier = Some(qualifier.into());
        self
    }

    /// Set the stream id.
    pub fn stream_id(mut self, stream_id: i64) -> Self {
        self.stream_id = Some(stream_id);
        self
    }

    /// Set opaque binary data.
    pub fn binary(mut self, data: impl Into<Bytes>) -> Self {
        self.data = Some(MessageData::Binary(data.into()));
        self
    }

    /// Set structured data.
    pub fn value(mut self, value: serde_json::Value) -> Self {
        self.data = Some(MessageData::Value(value));
        self
    }

    /// Set structured data from any serializable value.
    pub fn serialize<T: Serialize + ?Sized>(self, value: &T) -> Result<Self> {
        let value = serde_json::to_value(value).map_err(CodecError::Serialize)?;
        Ok(self.value(value))
    }

    /// Finish the message.
    pub fn build(self) -> PubSubMessage {
        PubSubMessage {
            qualifier: self.qualifier,
            stream_id: self.stream_id,
            data: self.data,
        }
    }
}
