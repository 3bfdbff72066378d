use bytes::{BufMut, Bytes, BytesMut};
use tracing::error;

use crate::error::{CodecError, Result};
use crate::message::{MessageData, PubSubMessage, DATA_FIELD, QUALIFIER_FIELD, STREAM_ID_FIELD};
use crate::scanner::{DataSpan, ScanError, Scanner};

const INITIAL_BUFFER_CAPACITY: usize = 256;
const LOG_PREVIEW_LEN: usize = 128;

/// Encodes/decodes [`PubSubMessage`] to/from envelope bytes.
///
/// Envelope layout (fields in this order, each only if present):
///
/// ```text
/// {"q":<string>,"sid":<integer>,"d":<json value | raw bytes>}
/// ```
///
/// Binary data is written as raw bytes right after `"d":` with no quoting or
/// escaping. A zero-length binary payload (or a JSON `null` value) emits no
/// `d` field at all.
#[derive(Debug, Clone, Copy, Default)]
pub struct MessageCodec;

impl MessageCodec {
    pub fn new() -> Self {
        Self
    }

    /// Encode `message` into a freshly allocated envelope.
    ///
    /// On failure the partially written buffer is released and the error
    /// carries the original message.
    pub fn encode(&self, message: &PubSubMessage) -> Result<Bytes> {
        let capacity = INITIAL_BUFFER_CAPACITY
            + match message.data() {
                Some(MessageData::Binary(bytes)) => bytes.len(),
                _ => 0,
            };
        let mut buf = BytesMut::with_capacity(capacity);

        match write_envelope(&mut buf, message) {
            Ok(()) => Ok(buf.freeze()),
            Err(source) => {
                error!(%message, error = %source, "failed to encode message");
                Err(CodecError::Encode {
                    message: Box::new(message.clone()),
                    source,
                })
            }
        }
    }

    /// Decode an envelope in a single forward pass.
    ///
    /// Unknown fields are skipped and any field whose value is `null` is
    /// treated as absent. The data of the result is always a zero-copy slice
    /// of `input` spanning exactly the `d` value.
    pub fn decode(&self, input: &Bytes) -> Result<PubSubMessage> {
        decode_envelope(input).inspect_err(|err| {
            let preview = &input[..input.len().min(LOG_PREVIEW_LEN)];
            error!(
                len = input.len(),
                preview = %String::from_utf8_lossy(preview),
                error = %err,
                "failed to decode message"
            );
        })
    }
}

fn write_envelope(buf: &mut BytesMut, message: &PubSubMessage) -> serde_json::Result<()> {
    buf.put_u8(b'{');
    let mut first = true;
    let mut field = |buf: &mut BytesMut, name: &str| {
        if !first {
            buf.put_u8(b',');
        }
        first = false;
        buf.put_u8(b'"');
        buf.put_slice(name.as_bytes());
        buf.put_slice(b"\":");
    };

    if let Some(qualifier) = message.qualifier() {
        field(buf, QUALIFIER_FIELD);
        serde_json::to_writer((&mut *buf).writer(), qualifier)?;
    }
    if let Some(stream_id) = message.stream_id() {
        field(buf, STREAM_ID_FIELD);
        serde_json::to_writer((&mut *buf).writer(), &stream_id)?;
    }
    match message.data() {
        Some(data) if data.is_empty() => {}
        Some(MessageData::Binary(bytes)) => {
            field(buf, DATA_FIELD);
            buf.put_slice(bytes);
        }
        Some(MessageData::Value(value)) => {
            field(buf, DATA_FIELD);
            serde_json::to_writer((&mut *buf).writer(), value)?;
        }
        None => {}
    }

    buf.put_u8(b'}');
    Ok(())
}

fn decode_envelope(input: &Bytes) -> Result<PubSubMessage> {
    let mut scanner = Scanner::new(input);
    if scanner.peek() != Some(b'{') {
        return Err(CodecError::RootNotObject);
    }
    scanner.bump();

    let mut builder = PubSubMessage::builder();
    let mut data = None;

    if scanner.peek() == Some(b'}') {
        return Ok(builder.build());
    }

    loop {
        let name = scanner.field_name()?;

        if name == DATA_FIELD {
            match scanner.data_span()? {
                DataSpan::Value(range) => {
                    data = (input[range.clone()].trim_ascii() != b"null").then_some(range);
                }
                DataSpan::Opaque(range) => {
                    data = Some(range);
                    break;
                }
            }
        } else if scanner.at_null() {
            scanner
                .skip_value()
                .map_err(|err| scanner.scan_failure(err))?;
        } else if name == QUALIFIER_FIELD {
            let qualifier: String = scanner.read().map_err(|err| invalid(&scanner, QUALIFIER_FIELD, err))?;
            builder = builder.qualifier(qualifier);
        } else if name == STREAM_ID_FIELD {
            let stream_id: i64 = scanner.read().map_err(|err| invalid(&scanner, STREAM_ID_FIELD, err))?;
            builder = builder.stream_id(stream_id);
        } else {
            scanner
                .skip_value()
                .map_err(|err| scanner.scan_failure(err))?;
        }

        match scanner.peek() {
            Some(b',') => scanner.bump(),
            Some(b'}') => break,
            Some(_) => {
                return Err(CodecError::Malformed {
                    offset: scanner.position(),
                    reason: "expected ',' or '}' after field value".to_string(),
                })
            }
            None => return Err(CodecError::UnexpectedEnd),
        }
    }

    if let Some(range) = data.filter(|range| !range.is_empty()) {
        builder = builder.binary(input.slice(range));
    }
    Ok(builder.build())
}

fn invalid(scanner: &Scanner<'_>, field: &'static str, err: ScanError) -> CodecError {
    match err {
        ScanError::Json(source) if source.is_data() => {
            CodecError::InvalidField { field, source }
        }
        other => scanner.scan_failure(other),
    }
}
