//! Minimal DER reader and writer for private key structures.
//!
//! The reader is a recursive-descent parser over tag-length-value triples.
//! Only the universal types that appear in PKCS#1 and PKCS#8 private keys are
//! decoded into dedicated variants; everything else is kept as
//! [`DerValue::Other`] so that optional context-tagged fields can be skipped.
//!
//! Only definite, minimally encoded lengths are accepted.

use thiserror::Error;

pub const TAG_INTEGER: u8 = 0x02;
pub const TAG_OCTET_STRING: u8 = 0x04;
pub const TAG_NULL: u8 = 0x05;
pub const TAG_OBJECT_IDENTIFIER: u8 = 0x06;
pub const TAG_SEQUENCE: u8 = 0x30;

/// Nesting limit; real keys never go deeper than 3.
const MAX_DEPTH: usize = 16;

/// Errors raised while decoding DER bytes
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DerError {
    #[error("unexpected end of data at offset {0}")]
    Truncated(usize),

    #[error("indefinite length at offset {0} is not allowed in DER")]
    IndefiniteLength(usize),

    #[error("length at offset {0} is not minimally encoded")]
    NonMinimalLength(usize),

    #[error("length at offset {0} does not fit in 4 bytes")]
    LengthTooLarge(usize),

    #[error("high-tag-number form at offset {0} is not supported")]
    UnsupportedTag(usize),

    #[error("integer at offset {0} is empty or not minimally encoded")]
    MalformedInteger(usize),

    #[error("NULL at offset {0} has content")]
    MalformedNull(usize),

    #[error("{0} trailing bytes after the top-level value")]
    TrailingData(usize),

    #[error("structure nested deeper than 16 levels")]
    TooDeep,
}

/// A decoded DER value borrowing from the input buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DerValue<'a> {
    /// Two's complement content bytes, big-endian
    Integer(&'a [u8]),
    OctetString(&'a [u8]),
    Null,
    ObjectIdentifier(&'a [u8]),
    Sequence(Vec<DerValue<'a>>),
    /// Any other tag, kept opaque
    Other { tag: u8, contents: &'a [u8] },
}

impl<'a> DerValue<'a> {
    /// Tag byte this value was decoded from
    pub fn tag(&self) -> u8 {
        match self {
            DerValue::Integer(_) => TAG_INTEGER,
            DerValue::OctetString(_) => TAG_OCTET_STRING,
            DerValue::Null => TAG_NULL,
            DerValue::ObjectIdentifier(_) => TAG_OBJECT_IDENTIFIER,
            DerValue::Sequence(_) => TAG_SEQUENCE,
            DerValue::Other { tag, .. } => *tag,
        }
    }
}

/// Parse exactly one DER value spanning the whole input.
pub fn parse(input: &[u8]) -> Result<DerValue<'_>, DerError> {
    let mut reader = Reader { data: input, pos: 0 };
    let value = reader.read_value(0)?;
    if reader.pos != input.len() {
        return Err(DerError::TrailingData(input.len() - reader.pos));
    }
    Ok(value)
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn read_byte(&mut self) -> Result<u8, DerError> {
        let byte = *self
            .data
            .get(self.pos)
            .ok_or(DerError::Truncated(self.pos))?;
        self.pos += 1;
        Ok(byte)
    }

    fn read_length(&mut self) -> Result<usize, DerError> {
        let offset = self.pos;
        let first = self.read_byte()?;
        if first < 0x80 {
            return Ok(first as usize);
        }
        if first == 0x80 {
            return Err(DerError::IndefiniteLength(offset));
        }

        let count = (first & 0x7f) as usize;
        if count > 4 {
            return Err(DerError::LengthTooLarge(offset));
        }

        let mut length = 0usize;
        for i in 0..count {
            let byte = self.read_byte()?;
            if i == 0 && byte == 0 {
                return Err(DerError::NonMinimalLength(offset));
            }
            length = (length << 8) | byte as usize;
        }
        if length < 0x80 {
            return Err(DerError::NonMinimalLength(offset));
        }
        Ok(length)
    }

    fn read_value(&mut self, depth: usize) -> Result<DerValue<'a>, DerError> {
        if depth > MAX_DEPTH {
            return Err(DerError::TooDeep);
        }

        let data = self.data;
        let offset = self.pos;
        let tag = self.read_byte()?;
        if tag & 0x1f == 0x1f {
            return Err(DerError::UnsupportedTag(offset));
        }

        let length = self.read_length()?;
        let start = self.pos;
        let end = start
            .checked_add(length)
            .filter(|end| *end <= data.len())
            .ok_or(DerError::Truncated(data.len()))?;
        let contents = &data[start..end];

        let value = match tag {
            TAG_INTEGER => {
                check_integer(contents, offset)?;
                self.pos = end;
                DerValue::Integer(contents)
            }
            TAG_OCTET_STRING => {
                self.pos = end;
                DerValue::OctetString(contents)
            }
            TAG_NULL => {
                if !contents.is_empty() {
                    return Err(DerError::MalformedNull(offset));
                }
                self.pos = end;
                DerValue::Null
            }
            TAG_OBJECT_IDENTIFIER => {
                self.pos = end;
                DerValue::ObjectIdentifier(contents)
            }
            TAG_SEQUENCE => {
                let mut inner = Reader {
                    data: &data[..end],
                    pos: start,
                };
                let mut items = Vec::new();
                while inner.pos < end {
                    items.push(inner.read_value(depth + 1)?);
                }
                self.pos = end;
                DerValue::Sequence(items)
            }
            _ => {
                self.pos = end;
                DerValue::Other { tag, contents }
            }
        };

        Ok(value)
    }
}

fn check_integer(contents: &[u8], offset: usize) -> Result<(), DerError> {
    match contents {
        [] => Err(DerError::MalformedInteger(offset)),
        [0x00, next, ..] if next & 0x80 == 0 => Err(DerError::MalformedInteger(offset)),
        [0xff, next, ..] if next & 0x80 != 0 => Err(DerError::MalformedInteger(offset)),
        _ => Ok(()),
    }
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

/// Append a tag-length-value triple to `out`.
pub fn write_tlv(out: &mut Vec<u8>, tag: u8, contents: &[u8]) {
    out.push(tag);
    write_length(out, contents.len());
    out.extend_from_slice(contents);
}

fn write_length(out: &mut Vec<u8>, length: usize) {
    if length < 0x80 {
        out.push(length as u8);
        return;
    }
    let bytes = length.to_be_bytes();
    let skip = bytes.iter().take_while(|b| **b == 0).count();
    out.push(0x80 | (bytes.len() - skip) as u8);
    out.extend_from_slice(&bytes[skip..]);
}

/// Wrap already-encoded elements in a SEQUENCE.
pub fn sequence(elements: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(elements.len() + 4);
    write_tlv(&mut out, TAG_SEQUENCE, elements);
    out
}

pub fn strip_leading_zeros(bytes: &[u8]) -> &[u8] {
    let skip = bytes.iter().take_while(|b| **b == 0).count();
    &bytes[skip..]
}
