//! Compact tagged binary encoding for [`Value`].
//!
//! The layout is MessagePack-compatible for the subset of types we use:
//!
//! | tag            | meaning                              |
//! |----------------|--------------------------------------|
//! | `0x00..=0x7f`  | positive fixint                      |
//! | `0x80..=0x8f`  | fixmap (len in low nibble)           |
//! | `0x90..=0x9f`  | fixarray (len in low nibble)         |
//! | `0xa0..=0xbf`  | fixstr (len in low 5 bits)           |
//! | `0xc0`         | nil                                  |
//! | `0xc2`/`0xc3`  | false / true                         |
//! | `0xca`/`0xcb`  | float32 (decode only) / float64      |
//! | `0xcc..=0xcf`  | uint 8/16/32/64                      |
//! | `0xd0..=0xd3`  | int 8/16/32/64                       |
//! | `0xd9..=0xdb`  | str 8/16/32                          |
//! | `0xdc`/`0xdd`  | array 16/32                          |
//! | `0xde`/`0xdf`  | map 16/32                            |
//! | `0xe0..=0xff`  | negative fixint (-32..=-1)           |
//!
//! All multi-byte fields are big-endian. The codec has no framing: `decode`
//! consumes exactly the slice it is handed.

use crate::error::{Result, RufletError};
use crate::value::{Value, ValueMap};

const NIL: u8 = 0xc0;
const FALSE: u8 = 0xc2;
const TRUE: u8 = 0xc3;
const FLOAT32: u8 = 0xca;
const FLOAT64: u8 = 0xcb;
const UINT8: u8 = 0xcc;
const UINT16: u8 = 0xcd;
const UINT32: u8 = 0xce;
const UINT64: u8 = 0xcf;
const INT8: u8 = 0xd0;
const INT16: u8 = 0xd1;
const INT32: u8 = 0xd2;
const INT64: u8 = 0xd3;
const STR8: u8 = 0xd9;
const STR16: u8 = 0xda;
const STR32: u8 = 0xdb;
const ARRAY16: u8 = 0xdc;
const ARRAY32: u8 = 0xdd;
const MAP16: u8 = 0xde;
const MAP32: u8 = 0xdf;

/// Containers nested deeper than this are rejected.
const MAX_DEPTH: usize = 256;

/// Encode a value into a fresh buffer.
pub fn encode(value: &Value) -> Vec<u8> {
    let mut out = Vec::with_capacity(64);
    encode_into(value, &mut out);
    out
}

/// Append the encoding of `value` to `out`.
pub fn encode_into(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Nil => out.push(NIL),
        Value::Bool(false) => out.push(FALSE),
        Value::Bool(true) => out.push(TRUE),
        Value::Int(i) if *i >= 0 => encode_unsigned(*i as u64, out),
        Value::Int(i) => encode_negative(*i, out),
        Value::UInt(u) => encode_unsigned(*u, out),
        Value::Float(f) => {
            out.push(FLOAT64);
            out.extend_from_slice(&f.to_be_bytes());
        }
        Value::Str(s) => encode_str(s, out),
        Value::List(items) => {
            encode_len(items.len(), 0x90, 15, ARRAY16, ARRAY32, out);
            for item in items {
                encode_into(item, out);
            }
        }
        Value::Map(map) => {
            encode_len(map.len(), 0x80, 15, MAP16, MAP32, out);
            for (key, val) in map {
                encode_str(key, out);
                encode_into(val, out);
            }
        }
    }
}

fn encode_unsigned(u: u64, out: &mut Vec<u8>) {
    if u <= 0x7f {
        out.push(u as u8);
    } else if u <= u8::MAX as u64 {
        out.extend_from_slice(&[UINT8, u as u8]);
    } else if u <= u16::MAX as u64 {
        out.push(UINT16);
        out.extend_from_slice(&(u as u16).to_be_bytes());
    } else if u <= u32::MAX as u64 {
        out.push(UINT32);
        out.extend_from_slice(&(u as u32).to_be_bytes());
    } else {
        out.push(UINT64);
        out.extend_from_slice(&u.to_be_bytes());
    }
}

fn encode_negative(i: i64, out: &mut Vec<u8>) {
    if i >= -32 {
        out.push(i as i8 as u8);
    } else if i >= i8::MIN as i64 {
        out.extend_from_slice(&[INT8, i as i8 as u8]);
    } else if i >= i16::MIN as i64 {
        out.push(INT16);
        out.extend_from_slice(&(i as i16).to_be_bytes());
    } else if i >= i32::MIN as i64 {
        out.push(INT32);
        out.extend_from_slice(&(i as i32).to_be_bytes());
    } else {
        out.push(INT64);
        out.extend_from_slice(&i.to_be_bytes());
    }
}

fn encode_str(s: &str, out: &mut Vec<u8>) {
    let len = s.len();
    if len <= 31 {
        out.push(0xa0 | len as u8);
    } else if len <= u8::MAX as usize {
        out.extend_from_slice(&[STR8, len as u8]);
    } else if len <= u16::MAX as usize {
        out.push(STR16);
        out.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        out.push(STR32);
        out.extend_from_slice(&(len as u32).to_be_bytes());
    }
    out.extend_from_slice(s.as_bytes());
}

fn encode_len(len: usize, fix_base: u8, fix_max: usize, tag16: u8, tag32: u8, out: &mut Vec<u8>) {
    if len <= fix_max {
        out.push(fix_base | len as u8);
    } else if len <= u16::MAX as usize {
        out.push(tag16);
        out.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        out.push(tag32);
        out.extend_from_slice(&(len as u32).to_be_bytes());
    }
}

/// Decode exactly one value occupying the whole of `bytes`.
pub fn decode(bytes: &[u8]) -> Result<Value> {
    let mut reader = ByteReader::new(bytes);
    let value = reader.read_value()?;
    match reader.remaining() {
        0 => Ok(value),
        n => Err(RufletError::TrailingBytes(n)),
    }
}

/// Bounds-checked cursor over an input slice.
struct ByteReader<'a> {
    data: &'a [u8],
    offset: usize,
    depth: usize,
}

impl<'a> ByteReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0, depth: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.offset
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(RufletError::TruncatedInput {
                needed: n,
                available: self.remaining(),
            });
        }
        let slice = &self.data[self.offset..self.offset + n];
        self.offset += n;
        Ok(slice)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut buf = [0u8; N];
        buf.copy_from_slice(self.take(N)?);
        Ok(buf)
    }

    fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn read_u16(&mut self) -> Result<u16> {
        Ok(u16::from_be_bytes(self.take_array()?))
    }

    fn read_u32(&mut self) -> Result<u32> {
        Ok(u32::from_be_bytes(self.take_array()?))
    }

    fn read_value(&mut self) -> Result<Value> {
        let tag = self.read_u8()?;
        match tag {
            0x00..=0x7f => Ok(Value::Int(tag as i64)),
            0xe0..=0xff => Ok(Value::Int(tag as i8 as i64)),
            0x80..=0x8f => self.read_map((tag & 0x0f) as usize),
            0x90..=0x9f => self.read_list((tag & 0x0f) as usize),
            0xa0..=0xbf => self.read_str((tag & 0x1f) as usize),
            NIL => Ok(Value::Nil),
            FALSE => Ok(Value::Bool(false)),
            TRUE => Ok(Value::Bool(true)),
            FLOAT32 => Ok(Value::Float(f32::from_be_bytes(self.take_array()?) as f64)),
            FLOAT64 => Ok(Value::Float(f64::from_be_bytes(self.take_array()?))),
            UINT8 => Ok(Value::Int(self.read_u8()? as i64)),
            UINT16 => Ok(Value::Int(self.read_u16()? as i64)),
            UINT32 => Ok(Value::Int(self.read_u32()? as i64)),
            UINT64 => Ok(Value::from(u64::from_be_bytes(self.take_array()?))),
            INT8 => Ok(Value::Int(i8::from_be_bytes(self.take_array()?) as i64)),
            INT16 => Ok(Value::Int(i16::from_be_bytes(self.take_array()?) as i64)),
            INT32 => Ok(Value::Int(i32::from_be_bytes(self.take_array()?) as i64)),
            INT64 => Ok(Value::Int(i64::from_be_bytes(self.take_array()?))),
            STR8 => {
                let len = self.read_u8()? as usize;
                self.read_str(len)
            }
            STR16 => {
                let len = self.read_u16()? as usize;
                self.read_str(len)
            }
            STR32 => {
                let len = self.read_u32()? as usize;
                self.read_str(len)
            }
            ARRAY16 => {
                let len = self.read_u16()? as usize;
                self.read_list(len)
            }
            ARRAY32 => {
                let len = self.read_u32()? as usize;
                self.read_list(len)
            }
            MAP16 => {
                let len = self.read_u16()? as usize;
                self.read_map(len)
            }
            MAP32 => {
                let len = self.read_u32()? as usize;
                self.read_map(len)
            }
            other => Err(RufletError::UnsupportedTag(other)),
        }
    }

    fn read_str(&mut self, len: usize) -> Result<Value> {
        let bytes = self.take(len)?;
        std::str::from_utf8(bytes)
            .map(|s| Value::Str(s.to_string()))
            .map_err(|_| RufletError::InvalidUtf8)
    }

    fn enter(&mut self) -> Result<()> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(RufletError::Protocol(format!("nesting deeper than {MAX_DEPTH}")));
        }
        Ok(())
    }

    fn read_list(&mut self, len: usize) -> Result<Value> {
        self.enter()?;
        // Every element needs at least one byte, so cap the reservation by what is left.
        let mut items = Vec::with_capacity(len.min(self.remaining()));
        for _ in 0..len {
            items.push(self.read_value()?);
        }
        self.depth -= 1;
        Ok(Value::List(items))
    }

    fn read_map(&mut self, len: usize) -> Result<Value> {
        self.enter()?;
        let mut map = ValueMap::new();
        for _ in 0..len {
            let key = self.read_value()?.to_key_string();
            let val = self.read_value()?;
            map.insert(key, val);
        }
        self.depth -= 1;
        Ok(Value::Map(map))
    }
}
