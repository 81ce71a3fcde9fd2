use std::io::{self, Read, Write};

pub const MAGIC: &[u8; 8] = b"RESONZ01";
pub const VERSION_V1: u32 = 1;
pub const VERSION_CURRENT: u32 = VERSION_V1;

/// Upper bound on element counts read from disk; anything larger is treated as corruption.
const MAX_ELEMENTS: usize = 1 << 26;

pub fn compress_lz4(input: &[u8]) -> Vec<u8> {
    lz4_flex::compress(input)
}

pub fn decompress_lz4(input: &[u8], expected_size: usize) -> io::Result<Vec<u8>> {
    // Strict format: raw LZ4 block with external expected size.
    lz4_flex::decompress(input, expected_size)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "lz4 decompression failed"))
}

fn invalid(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.to_string())
}

pub fn write_u32_le<W: Write>(w: &mut W, v: u32) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

pub fn write_u64_le<W: Write>(w: &mut W, v: u64) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

pub fn write_f32_le<W: Write>(w: &mut W, v: f32) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

pub fn write_len<W: Write>(w: &mut W, len: usize) -> io::Result<()> {
    let len = u32::try_from(len).map_err(|_| invalid("length does not fit u32"))?;
    write_u32_le(w, len)
}

pub fn write_f32_slice<W: Write>(w: &mut W, values: &[f32]) -> io::Result<()> {
    write_len(w, values.len())?;
    for &v in values {
        write_f32_le(w, v)?;
    }
    Ok(())
}

pub fn read_exact<const N: usize, R: Read>(r: &mut R) -> io::Result<[u8; N]> {
    let mut buf = [0u8; N];
    r.read_exact(&mut buf)?;
    Ok(buf)
}

pub fn read_u32_le<R: Read>(r: &mut R) -> io::Result<u32> {
    Ok(u32::from_le_bytes(read_exact::<4, _>(r)?))
}

pub fn read_u64_le<R: Read>(r: &mut R) -> io::Result<u64> {
    Ok(u64::from_le_bytes(read_exact::<8, _>(r)?))
}

pub fn read_f32_le<R: Read>(r: &mut R) -> io::Result<f32> {
    Ok(f32::from_le_bytes(read_exact::<4, _>(r)?))
}

pub fn read_len<R: Read>(r: &mut R) -> io::Result<usize> {
    let n = read_u32_le(r)? as usize;
    if n > MAX_ELEMENTS {
        return Err(invalid("length field out of range"));
    }
    Ok(n)
}

pub fn read_f32_vec<R: Read>(r: &mut R) -> io::Result<Vec<f32>> {
    let n = read_len(r)?;
    let mut out = Vec::with_capacity(n);
    for _ in 0..n {
        out.push(read_f32_le(r)?);
    }
    Ok(out)
}

/// Write a compressed chunk: payload is LZ4-compressed and preceded by the uncompressed length (u32).
///
/// Layout:
/// - tag: [u8;4]
/// - len: u32 (bytes following, including the 4-byte uncompressed length)
/// - uncompressed_len: u32
/// - compressed payload bytes
pub fn write_chunk_lz4<W: Write>(w: &mut W, tag: [u8; 4], payload: &[u8]) -> io::Result<()> {
    let compressed = compress_lz4(payload);
    let uncompressed_len =
        u32::try_from(payload.len()).map_err(|_| invalid("chunk too large"))?;
    let total_len = 4u32.saturating_add(
        u32::try_from(compressed.len()).map_err(|_| invalid("chunk too large"))?,
    );

    w.write_all(&tag)?;
    write_u32_le(w, total_len)?;
    write_u32_le(w, uncompressed_len)?;
    w.write_all(&compressed)
}

pub fn read_chunk_header<R: Read>(r: &mut R) -> io::Result<([u8; 4], u32)> {
    let tag = read_exact::<4, _>(r)?;
    let len = read_u32_le(r)?;
    Ok((tag, len))
}

/// Read the body of a chunk written by [`write_chunk_lz4`] whose header was already consumed.
pub fn read_chunk_lz4_body<R: Read>(r: &mut R, len: u32) -> io::Result<Vec<u8>> {
    if len < 4 || len as usize > MAX_ELEMENTS {
        return Err(invalid("bad chunk length"));
    }
    let uncompressed_len = read_u32_le(r)? as usize;
    if uncompressed_len > MAX_ELEMENTS {
        return Err(invalid("bad uncompressed length"));
    }
    let mut compressed = vec![0u8; len as usize - 4];
    r.read_exact(&mut compressed)?;
    decompress_lz4(&compressed, uncompressed_len)
}

pub fn write_header<W: Write>(w: &mut W) -> io::Result<()> {
    w.write_all(MAGIC)?;
    write_u32_le(w, VERSION_CURRENT)
}

pub fn read_header<R: Read>(r: &mut R) -> io::Result<u32> {
    let magic = read_exact::<8, _>(r)?;
    if &magic != MAGIC {
        return Err(invalid("bad blob magic"));
    }
    let version = read_u32_le(r)?;
    if version != VERSION_CURRENT {
        return Err(invalid("unsupported blob version"));
    }
    Ok(version)
}

/// Encode a single-chunk blob: header followed by one compressed chunk.
pub fn encode_blob(tag: [u8; 4], payload: &[u8]) -> io::Result<Vec<u8>> {
    let mut out = Vec::with_capacity(payload.len() / 2 + 32);
    write_header(&mut out)?;
    write_chunk_lz4(&mut out, tag, payload)?;
    Ok(out)
}

/// Decode a blob and return the payload of the first chunk tagged `tag`.
///
/// Chunks with other tags are skipped so newer writers can append sections.
pub fn decode_blob(bytes: &[u8], tag: [u8; 4]) -> io::Result<Vec<u8>> {
    let mut r = io::Cursor::new(bytes);
    read_header(&mut r)?;
    loop {
        let (found, len) = match read_chunk_header(&mut r) {
            Ok(v) => v,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e),
        };
        if found == tag {
            return read_chunk_lz4_body(&mut r, len);
        }
        let mut skip = (&mut r).take(len as u64);
        io::copy(&mut skip, &mut io::sink())?;
    }
    Err(invalid("missing chunk"))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Uncompressed chunk, as an unknown future section would appear.
    fn write_raw_chunk(w: &mut Vec<u8>, tag: [u8; 4], payload: &[u8]) -> io::Result<()> {
        w.write_all(&tag)?;
        write_len(w, payload.len())?;
        w.write_all(payload)
    }

    #[test]
    fn blob_skips_foreign_chunks() {
        let mut bytes = Vec::new();
        write_header(&mut bytes).unwrap();
        write_raw_chunk(&mut bytes, *b"XTRA", &[1, 2, 3]).unwrap();
        write_chunk_lz4(&mut bytes, *b"DSET", b"payload").unwrap();

        let payload = decode_blob(&bytes, *b"DSET").unwrap();
        assert_eq!(payload, b"payload");
    }

    #[test]
    fn missing_chunk_is_invalid_data() {
        let bytes = encode_blob(*b"MODL", &[9; 16]).unwrap();
        let err = decode_blob(&bytes, *b"DSET").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn garbage_is_rejected() {
        let err = decode_blob(b"not a blob at all", *b"MODL").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn oversized_length_is_corruption() {
        let mut bytes = Vec::new();
        write_u32_le(&mut bytes, u32::MAX).unwrap();
        let err = read_f32_vec(&mut io::Cursor::new(bytes)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn truncated_vector_fails_cleanly() {
        let mut bytes = Vec::new();
        write_f32_slice(&mut bytes, &[1.0, 2.0, 3.0]).unwrap();
        bytes.truncate(bytes.len() - 2);
        assert!(read_f32_vec(&mut io::Cursor::new(bytes)).is_err());
    }
}
