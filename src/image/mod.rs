use crate::vm::{Const, FuncDescriptor, Program};

pub mod vmp;

// ── Plain container ──────────────────────────────────────────────────
//
// Little-endian u32s throughout; doubles are stored as their 8-byte LE bit
// image; strings are u32-length-prefixed UTF-8. The whole image travels as
// lowercase hex.

const TAG_UNDEFINED: u8 = 0x00;
const TAG_NUMBER: u8 = 0x01;
const TAG_STRING: u8 = 0x02;

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("invalid hex image: {0}")]
    Hex(#[from] hex::FromHexError),
    #[error("unexpected end of image")]
    Truncated,
    #[error("trailing bytes after image")]
    Trailing,
    #[error("unknown constant tag {0}")]
    BadConstTag(u8),
    #[error("constant string is not valid UTF-8")]
    Utf8(#[from] std::string::FromUtf8Error),
    #[error("constant pool larger than 256 entries")]
    PoolTooLarge,
    #[error("function table larger than 256 entries")]
    FuncTableTooLarge,
    #[error("param name index {index} out of range for pool of {len}")]
    ParamIndexOutOfRange { index: u32, len: usize },
    #[error("function entry offset {entry} out of range for code of {len} bytes")]
    EntryOutOfRange { entry: u32, len: usize },
    #[error("code stream contains invalid opcode {0}")]
    InvalidOpcode(u8),
    #[error("Bad magic number")]
    BadMagic,
    #[error("Bad version - expected VMP protected format v3 (with immediate encryption)")]
    BadVersion,
    #[error("Integrity check failed - code may be tampered")]
    IntegrityCheckFailed,
    #[error("opcode permutation table is not a permutation of 1..={0}")]
    BadOpcodeMap(usize),
}

// ── Writers ──────────────────────────────────────────────────────────

pub(crate) fn write_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

pub(crate) fn write_pool(buf: &mut Vec<u8>, consts: &[Const]) {
    write_u32(buf, consts.len() as u32);
    for c in consts {
        match c {
            Const::Undefined => buf.push(TAG_UNDEFINED),
            Const::Number(n) => {
                buf.push(TAG_NUMBER);
                buf.extend_from_slice(&n.to_le_bytes());
            }
            Const::Str(s) => {
                buf.push(TAG_STRING);
                write_u32(buf, s.len() as u32);
                buf.extend_from_slice(s.as_bytes());
            }
        }
    }
}

pub(crate) fn write_funcs(buf: &mut Vec<u8>, funcs: &[FuncDescriptor]) {
    write_u32(buf, funcs.len() as u32);
    for f in funcs {
        write_u32(buf, f.entry);
        write_u32(buf, f.arity);
        write_u32(buf, f.params.len() as u32);
        for &p in &f.params {
            write_u32(buf, p as u32);
        }
    }
}

/// Serialize a program triple to the plain hex image.
pub fn pack_plain(program: &Program) -> String {
    let mut buf = Vec::new();
    write_pool(&mut buf, &program.consts);
    write_funcs(&mut buf, &program.funcs);
    write_u32(&mut buf, program.code.len() as u32);
    buf.extend_from_slice(&program.code);
    hex::encode(buf)
}

// ── Reader ───────────────────────────────────────────────────────────

pub(crate) struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        ByteReader { buf, pos: 0 }
    }

    pub(crate) fn read_u8(&mut self) -> Result<u8, DecodeError> {
        let b = *self.buf.get(self.pos).ok_or(DecodeError::Truncated)?;
        self.pos += 1;
        Ok(b)
    }

    pub(crate) fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        let end = self.pos.checked_add(n).ok_or(DecodeError::Truncated)?;
        if end > self.buf.len() {
            return Err(DecodeError::Truncated);
        }
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    pub(crate) fn read_u32(&mut self) -> Result<u32, DecodeError> {
        let bytes: [u8; 4] = self.take(4)?.try_into().unwrap_or_default();
        Ok(u32::from_le_bytes(bytes))
    }

    pub(crate) fn read_u32_be(&mut self) -> Result<u32, DecodeError> {
        let bytes: [u8; 4] = self.take(4)?.try_into().unwrap_or_default();
        Ok(u32::from_be_bytes(bytes))
    }

    pub(crate) fn finish(&self) -> Result<(), DecodeError> {
        if self.pos == self.buf.len() {
            Ok(())
        } else {
            Err(DecodeError::Trailing)
        }
    }
}

pub(crate) fn read_pool(r: &mut ByteReader) -> Result<Vec<Const>, DecodeError> {
    let count = r.read_u32()? as usize;
    if count > 256 {
        return Err(DecodeError::PoolTooLarge);
    }
    let mut consts = Vec::with_capacity(count);
    for _ in 0..count {
        let tag = r.read_u8()?;
        let c = match tag {
            TAG_UNDEFINED => Const::Undefined,
            TAG_NUMBER => {
                let bytes: [u8; 8] = r.take(8)?.try_into().unwrap_or_default();
                Const::Number(f64::from_le_bytes(bytes))
            }
            TAG_STRING => {
                let len = r.read_u32()? as usize;
                Const::Str(String::from_utf8(r.take(len)?.to_vec())?)
            }
            other => return Err(DecodeError::BadConstTag(other)),
        };
        consts.push(c);
    }
    Ok(consts)
}

pub(crate) fn read_funcs(
    r: &mut ByteReader,
    pool_len: usize,
) -> Result<Vec<FuncDescriptor>, DecodeError> {
    let count = r.read_u32()? as usize;
    if count > 256 {
        return Err(DecodeError::FuncTableTooLarge);
    }
    let mut funcs = Vec::with_capacity(count);
    for _ in 0..count {
        let entry = r.read_u32()?;
        let arity = r.read_u32()?;
        let param_count = r.read_u32()? as usize;
        let mut params = Vec::with_capacity(param_count.min(256));
        for _ in 0..param_count {
            let idx = r.read_u32()?;
            if idx as usize >= pool_len {
                return Err(DecodeError::ParamIndexOutOfRange {
                    index: idx,
                    len: pool_len,
                });
            }
            params.push(idx as u8);
        }
        funcs.push(FuncDescriptor {
            entry,
            arity,
            params,
        });
    }
    Ok(funcs)
}

/// Pool, function table, and code stream in container order, with entry
/// offsets validated against the code length.
pub(crate) fn read_program(r: &mut ByteReader) -> Result<Program, DecodeError> {
    let consts = read_pool(r)?;
    let funcs = read_funcs(r, consts.len())?;
    let code_len = r.read_u32()? as usize;
    let code = r.take(code_len)?.to_vec();
    for f in &funcs {
        if f.entry as usize >= code_len {
            return Err(DecodeError::EntryOutOfRange {
                entry: f.entry,
                len: code_len,
            });
        }
    }
    Ok(Program {
        code,
        consts,
        funcs,
    })
}

/// Inverse of `pack_plain`; validates structure and index ranges.
pub fn unpack_plain(image: &str) -> Result<Program, DecodeError> {
    let bytes = hex::decode(image)?;
    let mut r = ByteReader::new(&bytes);
    let program = read_program(&mut r)?;
    r.finish()?;
    Ok(program)
}
