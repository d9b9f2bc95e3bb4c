//! Allocation-free protobuf wire decoding.
//!
//! Everything above this module parses perfetto messages by walking
//! `(field id, wire type, payload)` triples with an explicit `match`, the same
//! way the trace reader skips over `Trace` fields. Nothing here allocates; all
//! payloads borrow from the input slice.

/// Longest encoding of a 64-bit varint.
pub const MAX_VARINT_LEN: usize = 10;

/// Protobuf wire types understood by the decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireType {
    VarInt,
    Fixed64,
    LengthDelimited,
    Fixed32,
}

impl WireType {
    pub(crate) fn from_tag(tag: u64) -> Option<Self> {
        match tag & 0x07 {
            0 => Some(WireType::VarInt),
            1 => Some(WireType::Fixed64),
            2 => Some(WireType::LengthDelimited),
            5 => Some(WireType::Fixed32),
            _ => None,
        }
    }
}

/// Single-byte tag of a varint field. Only valid for field ids below 16.
pub const fn make_tag_varint(field_id: u32) -> u8 {
    (field_id << 3) as u8
}

/// Decode a varint from the start of `buf`.
///
/// Returns the value and the number of bytes consumed, or `None` if `buf`
/// ends before the varint does or the varint is longer than 10 bytes. The
/// reader keeps no state, so a caller can restart it at any offset.
#[inline]
pub fn parse_varint(buf: &[u8]) -> Option<(u64, usize)> {
    let mut value: u64 = 0;
    for (i, &byte) in buf.iter().take(MAX_VARINT_LEN).enumerate() {
        value |= u64::from(byte & 0x7f) << (7 * i);
        if byte & 0x80 == 0 {
            return Some((value, i + 1));
        }
    }
    None
}

/// Payload of a decoded field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldValue<'a> {
    VarInt(u64),
    Fixed64(u64),
    Fixed32(u32),
    Bytes(&'a [u8]),
}

/// A decoded field. `offset` is where the payload starts in the buffer the
/// decoder was created over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Field<'a> {
    pub id: u32,
    pub offset: usize,
    pub value: FieldValue<'a>,
}

impl<'a> Field<'a> {
    pub fn wire_type(&self) -> WireType {
        match self.value {
            FieldValue::VarInt(_) => WireType::VarInt,
            FieldValue::Fixed64(_) => WireType::Fixed64,
            FieldValue::Fixed32(_) => WireType::Fixed32,
            FieldValue::Bytes(_) => WireType::LengthDelimited,
        }
    }

    /// Integer value of a varint or fixed-width field.
    pub fn as_u64(&self) -> Option<u64> {
        match self.value {
            FieldValue::VarInt(v) | FieldValue::Fixed64(v) => Some(v),
            FieldValue::Fixed32(v) => Some(u64::from(v)),
            FieldValue::Bytes(_) => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&'a [u8]> {
        match self.value {
            FieldValue::Bytes(data) => Some(data),
            _ => None,
        }
    }
}

/// Iterator over the top-level fields of one message.
///
/// Iteration stops at the end of the buffer or at the first malformed field;
/// [`ProtoDecoder::is_malformed`] tells the two apart.
#[derive(Debug, Clone)]
pub struct ProtoDecoder<'a> {
    buf: &'a [u8],
    pos: usize,
    malformed: bool,
}

impl<'a> ProtoDecoder<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self {
            buf,
            pos: 0,
            malformed: false,
        }
    }

    pub fn is_malformed(&self) -> bool {
        self.malformed
    }

    /// Scan forward for the first occurrence of `field_id`.
    pub fn find_field(mut self, field_id: u32) -> Option<Field<'a>> {
        self.find(|field| field.id == field_id)
    }

    fn read_varint(&mut self) -> Option<u64> {
        let (value, len) = parse_varint(&self.buf[self.pos..])?;
        self.pos += len;
        Some(value)
    }

    fn read_field(&mut self) -> Option<Field<'a>> {
        let tag = self.read_varint()?;
        let id = u32::try_from(tag >> 3).ok().filter(|id| *id != 0)?;
        let value = match WireType::from_tag(tag)? {
            WireType::VarInt => FieldValue::VarInt(self.read_varint()?),
            WireType::Fixed64 => {
                let bytes = self.buf.get(self.pos..self.pos.checked_add(8)?)?;
                self.pos += 8;
                FieldValue::Fixed64(u64::from_le_bytes(bytes.try_into().ok()?))
            }
            WireType::Fixed32 => {
                let bytes = self.buf.get(self.pos..self.pos.checked_add(4)?)?;
                self.pos += 4;
                FieldValue::Fixed32(u32::from_le_bytes(bytes.try_into().ok()?))
            }
            WireType::LengthDelimited => {
                let len = usize::try_from(self.read_varint()?).ok()?;
                let end = self.pos.checked_add(len)?;
                let data = self.buf.get(self.pos..end)?;
                let offset = self.pos;
                self.pos = end;
                return Some(Field {
                    id,
                    offset,
                    value: FieldValue::Bytes(data),
                });
            }
        };
        Some(Field {
            id,
            offset: self.pos,
            value,
        })
    }
}

impl<'a> Iterator for ProtoDecoder<'a> {
    type Item = Field<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.malformed || self.pos >= self.buf.len() {
            return None;
        }
        let field = self.read_field();
        if field.is_none() {
            self.malformed = true;
        }
        field
    }
}

/// Iterator over the values of a packed repeated varint field.
///
/// A column whose field is absent yields nothing. A field present with a
/// non length-delimited wire type, or a truncated varint, marks the column
/// malformed and ends it.
#[derive(Debug, Clone)]
pub struct PackedVarInt<'a> {
    buf: &'a [u8],
    pos: usize,
    malformed: bool,
}

impl<'a> PackedVarInt<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self {
            buf,
            pos: 0,
            malformed: false,
        }
    }

    pub fn from_field(field: Option<Field<'a>>) -> Self {
        match field {
            None => Self::new(&[]),
            Some(field) => match field.as_bytes() {
                Some(data) => Self::new(data),
                None => Self {
                    buf: &[],
                    pos: 0,
                    malformed: true,
                },
            },
        }
    }

    pub fn is_malformed(&self) -> bool {
        self.malformed
    }
}

impl Iterator for PackedVarInt<'_> {
    type Item = u64;

    fn next(&mut self) -> Option<u64> {
        if self.malformed || self.pos >= self.buf.len() {
            return None;
        }
        match parse_varint(&self.buf[self.pos..]) {
            Some((value, len)) => {
                self.pos += len;
                Some(value)
            }
            None => {
                self.malformed = true;
                None
            }
        }
    }
}
