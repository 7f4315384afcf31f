//! Delta payload application.
//!
//! A delta is two size varints (base size, result size) followed by an
//! opcode stream. Opcodes with the high bit set copy a range out of the
//! base; opcodes with the high bit clear insert the following literal
//! bytes. A zero opcode is reserved and treated as corruption.

use crate::error::OdbError;
use crate::varint::parse_le_varint;

/// Apply a delta to its base, returning the reconstructed object payload.
///
/// # Errors
/// Fails with [`OdbError::Corrupt`] when the declared base size does not
/// match `base`, when the opcode stream is malformed, or when the result
/// does not reach the declared size.
pub fn apply(base: &[u8], delta: &[u8]) -> Result<Vec<u8>, OdbError> {
    let (base_size, mut pos) = parse_le_varint(delta)?;
    let (result_size, used) = parse_le_varint(&delta[pos..])?;
    pos += used;

    if base_size != base.len() as u64 {
        return Err(OdbError::corrupt(
            "delta",
            format!("base size {base_size} declared but base is {} bytes", base.len()),
        ));
    }

    let mut out = Vec::with_capacity(usize::try_from(result_size).unwrap_or(0));
    while pos < delta.len() {
        let op = delta[pos];
        pos += 1;
        if op & 0x80 != 0 {
            let (offset, size, used) = parse_copy_args(op, &delta[pos..])?;
            pos += used;
            let end = offset
                .checked_add(size)
                .filter(|&e| e <= base.len())
                .ok_or_else(|| {
                    OdbError::corrupt("delta", format!("copy {offset}+{size} outside base"))
                })?;
            out.extend_from_slice(&base[offset..end]);
        } else if op != 0 {
            let len = usize::from(op);
            let literal = delta
                .get(pos..pos + len)
                .ok_or_else(|| OdbError::corrupt("delta", "truncated insert literal"))?;
            out.extend_from_slice(literal);
            pos += len;
        } else {
            return Err(OdbError::corrupt("delta", "reserved zero opcode"));
        }
    }

    if out.len() as u64 != result_size {
        return Err(OdbError::corrupt(
            "delta",
            format!("result size {result_size} declared but produced {} bytes", out.len()),
        ));
    }
    Ok(out)
}

/// Decode the offset/size operands of a copy opcode.
///
/// Each of the low seven opcode bits selects whether the corresponding
/// operand byte is present; absent bytes are zero. A zero size means
/// 0x10000.
fn parse_copy_args(op: u8, data: &[u8]) -> Result<(usize, usize, usize), OdbError> {
    let mut used = 0;
    let mut next = |bit: u8| -> Result<u64, OdbError> {
        if op & bit == 0 {
            return Ok(0);
        }
        let byte = *data
            .get(used)
            .ok_or_else(|| OdbError::corrupt("delta", "truncated copy operand"))?;
        used += 1;
        Ok(u64::from(byte))
    };

    let offset = next(0x01)? | next(0x02)? << 8 | next(0x04)? << 16 | next(0x08)? << 24;
    let mut size = next(0x10)? | next(0x20)? << 8 | next(0x40)? << 16;
    if size == 0 {
        size = 0x10000;
    }

    let offset = usize::try_from(offset)
        .map_err(|_| OdbError::corrupt("delta", "copy offset overflows usize"))?;
    let size = usize::try_from(size)
        .map_err(|_| OdbError::corrupt("delta", "copy size overflows usize"))?;
    Ok((offset, size, used))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::varint::encode_le_varint;

    fn delta_of(base_len: usize, result_len: usize, ops: &[u8]) -> Vec<u8> {
        let mut d = encode_le_varint(base_len as u64);
        d.extend(encode_le_varint(result_len as u64));
        d.extend_from_slice(ops);
        d
    }

    #[test]
    fn insert_only() {
        let delta = delta_of(0, 5, &[5, b'h', b'e', b'l', b'l', b'o']);
        assert_eq!(apply(b"", &delta).unwrap(), b"hello");
    }

    #[test]
    fn copy_with_offset_and_size() {
        // Copy 5 bytes from offset 6 of the base.
        let delta = delta_of(11, 5, &[0x80 | 0x01 | 0x10, 6, 5]);
        assert_eq!(apply(b"hello world", &delta).unwrap(), b"world");
    }

    #[test]
    fn copy_then_insert() {
        let delta = delta_of(5, 8, &[0x90, 5, 3, b'!', b'!', b'\n']);
        assert_eq!(apply(b"hello", &delta).unwrap(), b"hello!!\n");
    }

    #[test]
    fn base_size_mismatch_is_corrupt() {
        let delta = delta_of(99, 0, &[]);
        assert!(matches!(apply(b"short", &delta), Err(OdbError::Corrupt { .. })));
    }

    #[test]
    fn copy_past_end_of_base_is_corrupt() {
        let delta = delta_of(5, 10, &[0x91, 3, 10]);
        assert!(matches!(apply(b"hello", &delta), Err(OdbError::Corrupt { .. })));
    }

    #[test]
    fn zero_opcode_is_corrupt() {
        let delta = delta_of(0, 0, &[0]);
        assert!(matches!(apply(b"", &delta), Err(OdbError::Corrupt { .. })));
    }

    #[test]
    fn result_size_mismatch_is_corrupt() {
        let delta = delta_of(0, 4, &[1, b'x']);
        assert!(matches!(apply(b"", &delta), Err(OdbError::Corrupt { .. })));
    }
}
