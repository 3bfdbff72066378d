//! Forward-only token scanner over an envelope buffer.
//!
//! Structural tokens (`{`, `:`, `,`, `}`) are matched here; individual values
//! are lexed by `serde_json`'s streaming deserializer so that a value of any
//! shape can be skipped while only its byte offsets are recorded.

use std::ops::Range;

use serde::de::{DeserializeOwned, IgnoredAny};

use crate::error::{CodecError, Result};

/// Where the `d` value ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum DataSpan {
    /// A complete JSON value; scanning continues after it.
    Value(Range<usize>),
    /// Opaque bytes running up to the envelope's final `}`; scanning is done.
    Opaque(Range<usize>),
}

pub(crate) struct Scanner<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Scanner<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub(crate) fn position(&self) -> usize {
        self.pos
    }

    /// Next non-whitespace byte without consuming it.
    pub(crate) fn peek(&mut self) -> Option<u8> {
        self.skip_whitespace();
        self.buf.get(self.pos).copied()
    }

    pub(crate) fn bump(&mut self) {
        self.pos += 1;
    }

    pub(crate) fn expect(&mut self, token: u8) -> Result<()> {
        match self.peek() {
            Some(byte) if byte == token => {
                self.bump();
                Ok(())
            }
            Some(byte) => Err(self.malformed(format!(
                "expected '{}', found '{}'",
                token as char,
                printable(byte)
            ))),
            None => Err(CodecError::UnexpectedEnd),
        }
    }

    /// True if the next value is the literal `null`.
    pub(crate) fn at_null(&mut self) -> bool {
        self.skip_whitespace();
        self.buf[self.pos..].starts_with(b"null")
    }

    /// Deserialize the next value as `T`.
    pub(crate) fn read<T: DeserializeOwned>(&mut self) -> std::result::Result<T, ScanError> {
        self.skip_whitespace();
        if self.pos >= self.buf.len() {
            return Err(ScanError::End);
        }

        let mut stream =
            serde_json::Deserializer::from_slice(&self.buf[self.pos..]).into_iter::<T>();
        match stream.next() {
            Some(Ok(value)) => {
                self.pos += stream.byte_offset();
                Ok(value)
            }
            Some(Err(err)) if err.is_eof() => Err(ScanError::End),
            Some(Err(err)) => Err(ScanError::Json(err)),
            None => Err(ScanError::End),
        }
    }

    /// Skip the next value without materializing it, returning its byte range.
    pub(crate) fn skip_value(&mut self) -> std::result::Result<Range<usize>, ScanError> {
        self.skip_whitespace();
        let start = self.pos;
        self.read::<IgnoredAny>()?;
        Ok(start..self.pos)
    }

    /// Field name followed by `:`.
    pub(crate) fn field_name(&mut self) -> Result<String> {
        match self.peek() {
            Some(b'"') => {}
            Some(byte) => {
                return Err(self.malformed(format!(
                    "expected field name, found '{}'",
                    printable(byte)
                )))
            }
            None => return Err(CodecError::UnexpectedEnd),
        }
        let name = self.read::<String>().map_err(|err| self.scan_failure(err))?;
        self.expect(b':')?;
        Ok(name)
    }

    /// Locate the `d` value.
    ///
    /// A well-formed JSON value is accepted when it is followed by the
    /// envelope's final `}`, or by `,` and a clean run of further fields up to
    /// that `}`. Anything else is opaque binary that was spliced in verbatim.
    /// Either way the span starts right after the `:` token and ends at the
    /// delimiter, so surrounding whitespace belongs to the data.
    pub(crate) fn data_span(&mut self) -> Result<DataSpan> {
        let raw_start = self.pos;
        let closing = self.buf.iter().rposition(|&b| b == b'}');

        if self.skip_value().is_ok() {
            match self.peek() {
                Some(b'}') if Some(self.pos) == closing => {
                    return Ok(DataSpan::Value(raw_start..self.pos))
                }
                Some(b',') if self.rest_is_fields(closing) => {
                    return Ok(DataSpan::Value(raw_start..self.pos))
                }
                _ => {}
            }
        }

        match closing {
            Some(end) if end >= raw_start => {
                self.pos = end;
                Ok(DataSpan::Opaque(raw_start..end))
            }
            _ => Err(CodecError::UnexpectedEnd),
        }
    }

    pub(crate) fn scan_failure(&self, err: ScanError) -> CodecError {
        match err {
            ScanError::End => CodecError::UnexpectedEnd,
            ScanError::Json(err) => self.malformed(err.to_string()),
        }
    }

    /// Whether everything from the current `,` up to `closing` parses as
    /// `,"name":value` pairs.
    fn rest_is_fields(&self, closing: Option<usize>) -> bool {
        let mut ahead = Scanner {
            buf: self.buf,
            pos: self.pos,
        };
        while ahead.peek() == Some(b',') {
            ahead.bump();
            if ahead.field_name().is_err() || ahead.skip_value().is_err() {
                return false;
            }
        }
        ahead.peek() == Some(b'}') && Some(ahead.pos) == closing
    }

    fn skip_whitespace(&mut self) {
        while let Some(byte) = self.buf.get(self.pos) {
            if !matches!(byte, b' ' | b'\n' | b'\r' | b'\t') {
                break;
            }
            self.pos += 1;
        }
    }

    fn malformed(&self, reason: String) -> CodecError {
        CodecError::Malformed {
            offset: self.pos,
            reason,
        }
    }
}

/// Failure while lexing one value.
#[derive(Debug)]
pub(crate) enum ScanError {
    End,
    Json(serde_json::Error),
}

fn printable(byte: u8) -> String {
    if byte.is_ascii_graphic() {
        (byte as char).to_string()
    } else {
        format!("0x{byte:02x}")
    }
}
