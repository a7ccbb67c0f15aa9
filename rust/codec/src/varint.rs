use std::io::{Read, Write};

/// LEB128 variable-length integers: seven payload bits per byte, high bit set
/// while more bytes follow. Matches the layout of the on-disk term and
/// posting records.

const MAX_VLONG_BYTES: usize = 10;

pub fn write_vint<W: Write>(writer: &mut W, value: u32) -> std::io::Result<()> {
    write_vlong(writer, value as u64)
}

pub fn write_vlong<W: Write>(writer: &mut W, mut value: u64) -> std::io::Result<()> {
    let mut buffer = [0u8; MAX_VLONG_BYTES];
    let mut length = 0;
    loop {
        let byte = (value & 0x7F) as u8;
        value >>= 7;
        if value == 0 {
            buffer[length] = byte;
            length += 1;
            break;
        }
        buffer[length] = byte | 0x80;
        length += 1;
    }
    writer.write_all(&buffer[..length])
}

pub fn read_vlong<R: Read>(reader: &mut R) -> std::io::Result<u64> {
    let mut value = 0u64;
    let mut shift = 0u32;
    for _ in 0..MAX_VLONG_BYTES {
        let mut byte = [0u8; 1];
        reader.read_exact(&mut byte)?;
        value |= ((byte[0] & 0x7F) as u64) << shift;
        if byte[0] & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
    }
    Err(std::io::Error::new(
        std::io::ErrorKind::InvalidData,
        "varint longer than 10 bytes",
    ))
}

pub fn read_vint<R: Read>(reader: &mut R) -> std::io::Result<u32> {
    let value = read_vlong(reader)?;
    u32::try_from(value).map_err(|_| {
        std::io::Error::new(std::io::ErrorKind::InvalidData, "vint exceeds u32 range")
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn roundtrip(value: u64) -> u64 {
        let mut bytes = Vec::new();
        write_vlong(&mut bytes, value).unwrap();
        read_vlong(&mut bytes.as_slice()).unwrap()
    }

    #[test]
    fn test_single_byte_values() {
        for value in [0u64, 1, 42, 127] {
            let mut bytes = Vec::new();
            write_vlong(&mut bytes, value).unwrap();
            assert_eq!(bytes.len(), 1);
            assert_eq!(roundtrip(value), value);
        }
    }

    #[test]
    fn test_boundary_values() {
        for value in [128u64, 16_383, 16_384, u32::MAX as u64, u64::MAX] {
            assert_eq!(roundtrip(value), value);
        }
    }

    #[test]
    fn test_truncated_read_fails() {
        let mut bytes = Vec::new();
        write_vlong(&mut bytes, u64::MAX).unwrap();
        bytes.pop();
        assert!(read_vlong(&mut bytes.as_slice()).is_err());
    }

    #[test]
    fn test_vint_rejects_out_of_range() {
        let mut bytes = Vec::new();
        write_vlong(&mut bytes, u32::MAX as u64 + 1).unwrap();
        assert!(read_vint(&mut bytes.as_slice()).is_err());
    }

    proptest! {
        #[test]
        fn test_roundtrip_any(value: u64) {
            prop_assert_eq!(roundtrip(value), value);
        }
    }
}
