use rand::seq::SliceRandom;
use rand::Rng;

use super::{
    read_funcs, read_pool, write_funcs, write_pool, write_u32, ByteReader, DecodeError,
};
use crate::vm::builtins::Builtins;
use crate::vm::value::Value;
use crate::vm::{has_imm, Program, Vm, OPCODE_COUNT};

// ── Protected container ──────────────────────────────────────────────
//
// 'V' 'M' version prefix, then the plain pool and function table, the
// opcode permutation, the big-endian keystream seed, the transformed code,
// and a trailing 4-byte integrity tag over everything after the prefix.

pub(crate) const MAGIC: [u8; 2] = *b"VM";
pub(crate) const VERSION: u8 = 0x03;

const GOLDEN: u32 = 0x9E37_79B1;
const MIX: u32 = 0x85EB_CA6B;

/// Keystream byte for the immediate at `off` within the code stream.
/// Opcode bytes are never masked.
pub(crate) fn mask(seed: u32, off: u32) -> u8 {
    let x = (seed ^ off).wrapping_add(GOLDEN);
    let x = (x ^ (x >> 16)).wrapping_mul(MIX);
    (x >> 24) as u8
}

/// Multiplicative XOR-fold over the covered region.
fn integrity_tag(payload: &[u8]) -> u32 {
    let mut h = GOLDEN;
    for &b in payload {
        h = (h ^ b as u32).wrapping_mul(GOLDEN);
    }
    h
}

/// A physical byte for every logical opcode index; bijective over
/// `1..=OPCODE_COUNT` with 0 never used.
fn validate_map(map: &[u8]) -> Result<(), DecodeError> {
    let mut seen = [false; 256];
    if map.len() != OPCODE_COUNT {
        return Err(DecodeError::BadOpcodeMap(OPCODE_COUNT));
    }
    for &phys in map {
        if phys == 0 || phys as usize > OPCODE_COUNT || seen[phys as usize] {
            return Err(DecodeError::BadOpcodeMap(OPCODE_COUNT));
        }
        seen[phys as usize] = true;
    }
    Ok(())
}

/// Rewrite opcodes through the permutation and XOR each immediate with its
/// offset-keyed mask. Instruction boundaries follow the logical stream, so
/// the output has the same length and offsets as the input.
fn transform_code(code: &[u8], map: &[u8], seed: u32) -> Result<Vec<u8>, DecodeError> {
    let mut out = Vec::with_capacity(code.len());
    let mut i = 0;
    while i < code.len() {
        let op = code[i];
        if op == 0 || op as usize > OPCODE_COUNT {
            return Err(DecodeError::InvalidOpcode(op));
        }
        out.push(map[(op - 1) as usize]);
        i += 1;
        if has_imm(op) {
            let imm = *code.get(i).ok_or(DecodeError::Truncated)?;
            out.push(imm ^ mask(seed, i as u32));
            i += 1;
        }
    }
    Ok(out)
}

/// A decoded protected image. The code stays permuted and encrypted; the
/// interpreter undoes both transforms per fetch.
#[derive(Debug)]
pub struct VmpImage {
    pub program: Program,
    pub map: Vec<u8>,
    pub seed: u32,
}

impl VmpImage {
    /// Physical byte → logical opcode, with 0 marking unmapped bytes.
    pub(crate) fn inverse_map(&self) -> [u8; 256] {
        let mut inv = [0u8; 256];
        for (i, &phys) in self.map.iter().enumerate() {
            inv[phys as usize] = (i + 1) as u8;
        }
        inv
    }
}

/// Serialize with a fresh uniform permutation and random seed.
pub fn pack_protected(program: &Program) -> Result<String, DecodeError> {
    let mut rng = rand::thread_rng();
    let mut map: Vec<u8> = (1..=OPCODE_COUNT as u8).collect();
    map.shuffle(&mut rng);
    let seed: u32 = rng.gen();
    pack_protected_with(program, seed, &map)
}

/// Serialize with a caller-pinned seed and permutation. Tests use this to
/// make protected images reproducible.
pub fn pack_protected_with(
    program: &Program,
    seed: u32,
    map: &[u8],
) -> Result<String, DecodeError> {
    validate_map(map)?;
    let mut payload = Vec::new();
    write_pool(&mut payload, &program.consts);
    write_funcs(&mut payload, &program.funcs);
    payload.push(map.len() as u8);
    payload.extend_from_slice(map);
    payload.extend_from_slice(&seed.to_be_bytes());
    write_u32(&mut payload, program.code.len() as u32);
    payload.extend(transform_code(&program.code, map, seed)?);

    let tag = integrity_tag(&payload);
    let mut image = Vec::with_capacity(3 + payload.len() + 4);
    image.extend_from_slice(&MAGIC);
    image.push(VERSION);
    image.extend(payload);
    image.extend_from_slice(&tag.to_be_bytes());
    Ok(hex::encode(image))
}

/// Validate magic, version, and the integrity tag, then parse. The tag is
/// checked before the covered region is interpreted, so any corruption of
/// the payload surfaces as the integrity error.
pub fn unpack_protected(image: &str) -> Result<VmpImage, DecodeError> {
    let bytes = hex::decode(image)?;
    if bytes.len() < 2 || bytes[0..2] != MAGIC {
        return Err(DecodeError::BadMagic);
    }
    if bytes.len() < 3 || bytes[2] != VERSION {
        return Err(DecodeError::BadVersion);
    }
    if bytes.len() < 3 + 4 {
        return Err(DecodeError::Truncated);
    }
    let payload = &bytes[3..bytes.len() - 4];
    let expected = u32::from_be_bytes(bytes[bytes.len() - 4..].try_into().unwrap_or_default());
    if integrity_tag(payload) != expected {
        return Err(DecodeError::IntegrityCheckFailed);
    }

    let mut r = ByteReader::new(payload);
    let consts = read_pool(&mut r)?;
    let funcs = read_funcs(&mut r, consts.len())?;
    let map_len = r.read_u8()? as usize;
    let map = r.take(map_len)?.to_vec();
    validate_map(&map)?;
    let seed = r.read_u32_be()?;
    let code_len = r.read_u32()? as usize;
    let code = r.take(code_len)?.to_vec();
    r.finish()?;
    for f in &funcs {
        if f.entry as usize >= code_len {
            return Err(DecodeError::EntryOutOfRange {
                entry: f.entry,
                len: code_len,
            });
        }
    }

    Ok(VmpImage {
        program: Program {
            code,
            consts,
            funcs,
        },
        map,
        seed,
    })
}

/// Unpack, validate, and execute in one step, with `print` on stdout.
pub fn run_protected(image: &str, builtins: &Builtins) -> Result<Value, crate::Error> {
    let decoded = unpack_protected(image)?;
    let value = Vm::protected(&decoded, builtins, std::io::stdout().lock()).run()?;
    Ok(value)
}
