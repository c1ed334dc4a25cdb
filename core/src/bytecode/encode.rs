//! Stable binary serialization for [`Bytecode`].
//!
//! Layout (all integers little-endian):
//!
//! ```text
//! "UGOC" magic | u16 version
//! u32 module count
//! u32 file count | per file: name, u32 base, u32 size, u32 line count, lines
//! u32 constant count | per constant: u8 tag + payload
//! main function (same encoding as a function constant's payload)
//! ```
//!
//! Only scalar values, strings, bytes, and compiled functions can appear
//! in a constant pool; encoding anything else is an error, and decoding
//! rejects unknown tags and truncated input.

use std::rc::Rc;

use ecow::EcoString;
use smallvec::SmallVec;

use crate::bytecode::{Bytecode, CompiledFunction, SourceMap};
use crate::source::{FileSet, SourceFile};
use crate::value::Value;

const MAGIC: &[u8; 4] = b"UGOC";
const VERSION: u16 = 1;

const TAG_UNDEFINED: u8 = 0;
const TAG_BOOL: u8 = 1;
const TAG_INT: u8 = 2;
const TAG_UINT: u8 = 3;
const TAG_FLOAT: u8 = 4;
const TAG_CHAR: u8 = 5;
const TAG_STRING: u8 = 6;
const TAG_BYTES: u8 = 7;
const TAG_FUNCTION: u8 = 8;
const TAG_ARRAY: u8 = 9;
const TAG_MAP: u8 = 10;

#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("'{0}' values cannot appear in a constant pool")]
    UnsupportedConstant(&'static str),
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("not a uGO bytecode artifact")]
    BadMagic,
    #[error("unsupported bytecode version {0}")]
    UnsupportedVersion(u16),
    #[error("unknown constant tag 0x{0:02X}")]
    UnknownTag(u8),
    #[error("unexpected end of input")]
    UnexpectedEof,
    #[error("invalid UTF-8 in encoded string")]
    InvalidUtf8,
    #[error("invalid char scalar 0x{0:08X}")]
    InvalidChar(u32),
}

/// Serialize a bytecode artifact.
pub fn encode(bc: &Bytecode) -> Result<Vec<u8>, EncodeError> {
    let mut out = Vec::with_capacity(256);
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&VERSION.to_le_bytes());

    put_u32(&mut out, bc.num_modules as u32);

    put_u32(&mut out, bc.file_set.files().len() as u32);
    for file in bc.file_set.files() {
        put_str(&mut out, &file.name);
        put_u32(&mut out, file.base);
        put_u32(&mut out, file.size);
        put_u32(&mut out, file.line_offsets().len() as u32);
        for off in file.line_offsets() {
            put_u32(&mut out, *off);
        }
    }

    put_u32(&mut out, bc.constants.len() as u32);
    for c in &bc.constants {
        encode_constant(&mut out, c)?;
    }

    encode_function(&mut out, &bc.main);
    Ok(out)
}

/// Deserialize a bytecode artifact.
pub fn decode(bytes: &[u8]) -> Result<Bytecode, DecodeError> {
    let mut r = Reader { bytes, at: 0 };

    if r.take(4)? != MAGIC {
        return Err(DecodeError::BadMagic);
    }
    let version = r.u16()?;
    if version != VERSION {
        return Err(DecodeError::UnsupportedVersion(version));
    }

    let num_modules = r.u32()? as usize;

    let file_count = r.u32()?;
    let mut file_set = FileSet::new();
    for _ in 0..file_count {
        let name = r.str()?;
        let base = r.u32()?;
        let size = r.u32()?;
        let line_count = r.u32()?;
        let mut lines = Vec::with_capacity(line_count as usize);
        for _ in 0..line_count {
            lines.push(r.u32()?);
        }
        file_set.push_file(SourceFile::from_parts(name, base, size, lines));
    }

    let const_count = r.u32()?;
    let mut constants = Vec::with_capacity(const_count as usize);
    for _ in 0..const_count {
        constants.push(decode_constant(&mut r)?);
    }

    let main = decode_function(&mut r)?;
    Ok(Bytecode {
        main: Rc::new(main),
        constants,
        num_modules,
        file_set: Rc::new(file_set),
    })
}

fn encode_constant(out: &mut Vec<u8>, c: &Value) -> Result<(), EncodeError> {
    match c {
        Value::Undefined => out.push(TAG_UNDEFINED),
        Value::Bool(b) => {
            out.push(TAG_BOOL);
            out.push(*b as u8);
        }
        Value::Int(i) => {
            out.push(TAG_INT);
            out.extend_from_slice(&i.to_le_bytes());
        }
        Value::Uint(u) => {
            out.push(TAG_UINT);
            out.extend_from_slice(&u.to_le_bytes());
        }
        Value::Float(f) => {
            out.push(TAG_FLOAT);
            out.extend_from_slice(&f.to_bits().to_le_bytes());
        }
        Value::Char(ch) => {
            out.push(TAG_CHAR);
            put_u32(out, *ch as u32);
        }
        Value::String(s) => {
            out.push(TAG_STRING);
            put_str(out, s);
        }
        Value::Bytes(b) => {
            out.push(TAG_BYTES);
            let b = b.borrow();
            put_u32(out, b.len() as u32);
            out.extend_from_slice(&b);
        }
        Value::CompiledFunction(func) => {
            out.push(TAG_FUNCTION);
            encode_function(out, func);
        }
        // Containers appear as constants when a native module is a map of
        // exported values.
        Value::Array(items) => {
            out.push(TAG_ARRAY);
            let items = items.borrow();
            put_u32(out, items.len() as u32);
            for item in items.iter() {
                encode_constant(out, item)?;
            }
        }
        Value::Map(m) => {
            out.push(TAG_MAP);
            let m = m.borrow();
            // Sorted keys keep the encoding stable across runs.
            let mut entries: Vec<_> = m.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            put_u32(out, entries.len() as u32);
            for (k, v) in entries {
                put_str(out, k);
                encode_constant(out, v)?;
            }
        }
        other => return Err(EncodeError::UnsupportedConstant(other.type_name())),
    }
    Ok(())
}

fn decode_constant(r: &mut Reader<'_>) -> Result<Value, DecodeError> {
    let tag = r.u8()?;
    Ok(match tag {
        TAG_UNDEFINED => Value::Undefined,
        TAG_BOOL => Value::Bool(r.u8()? != 0),
        TAG_INT => Value::Int(i64::from_le_bytes(r.take(8)?.try_into().unwrap())),
        TAG_UINT => Value::Uint(u64::from_le_bytes(r.take(8)?.try_into().unwrap())),
        TAG_FLOAT => Value::Float(f64::from_bits(u64::from_le_bytes(
            r.take(8)?.try_into().unwrap(),
        ))),
        TAG_CHAR => {
            let scalar = r.u32()?;
            Value::Char(char::from_u32(scalar).ok_or(DecodeError::InvalidChar(scalar))?)
        }
        TAG_STRING => Value::String(r.str()?),
        TAG_BYTES => {
            let len = r.u32()? as usize;
            Value::bytes(r.take(len)?.to_vec())
        }
        TAG_FUNCTION => Value::CompiledFunction(Rc::new(decode_function(r)?)),
        TAG_ARRAY => {
            let len = r.u32()? as usize;
            let mut items = Vec::with_capacity(len);
            for _ in 0..len {
                items.push(decode_constant(r)?);
            }
            Value::array(items)
        }
        TAG_MAP => {
            let len = r.u32()? as usize;
            let mut m = crate::value::MapData::with_capacity(len);
            for _ in 0..len {
                let k = r.str()?;
                m.insert(k, decode_constant(r)?);
            }
            Value::map(m)
        }
        other => return Err(DecodeError::UnknownTag(other)),
    })
}

fn encode_function(out: &mut Vec<u8>, func: &CompiledFunction) {
    match &func.name {
        Some(name) => {
            out.push(1);
            put_str(out, name);
        }
        None => out.push(0),
    }
    put_u32(out, func.num_params as u32);
    put_u32(out, func.num_locals as u32);
    out.push(func.variadic as u8);

    put_u32(out, func.instructions.len() as u32);
    out.extend_from_slice(&func.instructions);

    // Source map entries sorted by offset so the encoding is stable.
    let mut entries: Vec<(u32, u32)> = func.source_map.iter().map(|(k, v)| (*k, *v)).collect();
    entries.sort_unstable();
    put_u32(out, entries.len() as u32);
    for (offset, pos) in entries {
        put_u32(out, offset);
        put_u32(out, pos);
    }
}

fn decode_function(r: &mut Reader<'_>) -> Result<CompiledFunction, DecodeError> {
    let name = if r.u8()? != 0 { Some(r.str()?) } else { None };
    let num_params = r.u32()? as usize;
    let num_locals = r.u32()? as usize;
    let variadic = r.u8()? != 0;

    let code_len = r.u32()? as usize;
    let instructions: Rc<[u8]> = r.take(code_len)?.to_vec().into();

    let map_len = r.u32()?;
    let mut source_map = SourceMap::with_capacity(map_len as usize);
    for _ in 0..map_len {
        let offset = r.u32()?;
        let pos = r.u32()?;
        source_map.insert(offset, pos);
    }

    Ok(CompiledFunction {
        instructions,
        num_params,
        num_locals,
        variadic,
        name,
        source_map: Rc::new(source_map),
        free: SmallVec::new(),
    })
}

fn put_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn put_str(out: &mut Vec<u8>, s: &str) {
    put_u32(out, s.len() as u32);
    out.extend_from_slice(s.as_bytes());
}

struct Reader<'a> {
    bytes: &'a [u8],
    at: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        if self.at + n > self.bytes.len() {
            return Err(DecodeError::UnexpectedEof);
        }
        let out = &self.bytes[self.at..self.at + n];
        self.at += n;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, DecodeError> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into().unwrap()))
    }

    fn u32(&mut self) -> Result<u32, DecodeError> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn str(&mut self) -> Result<EcoString, DecodeError> {
        let len = self.u32()? as usize;
        std::str::from_utf8(self.take(len)?)
            .map(EcoString::from)
            .map_err(|_| DecodeError::InvalidUtf8)
    }
}
