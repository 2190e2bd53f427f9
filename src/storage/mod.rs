/// Persisted profile file format and the inner blob layout it wraps.
///
/// The file itself is a thin envelope (`"CPR?"` magic, a version, and the
/// pointer width the session was captured at) around a gzip-compressed
/// blob. The blob layout is shared with the aggregator: this module owns
/// decoding it into `DecodedProfile` records, and the aggregator builds
/// flat/call-graph/file views on top of those records. Writing is provided
/// for round-trip testing even though in production only the frontend
/// persists a session.
use std::io::{Read, Write};

use thiserror::Error;

use crate::core::types::{CallStackEntry, PointerSize};

pub const MAGIC: &[u8; 4] = b"CPR?";
pub const CURRENT_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("truncated profile file: expected at least {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },
    #[error("bad magic number: expected {:?}, got {:?}", MAGIC, .0)]
    BadMagic([u8; 4]),
    #[error("unsupported profile format version {0}")]
    UnsupportedVersion(u32),
    #[error("invalid pointer size in profile header: {0}")]
    InvalidPointerSize(u32),
    #[error("gzip (de)compression failed")]
    Gzip(#[source] std::io::Error),
    #[error("failed to read profile file: {0}")]
    Io(#[source] std::io::Error),
}

/// One symbol record from the blob. Unlike the live `core::types::Symbol`
/// (whose `name` is a string-table id), the persisted form carries the
/// symbol's name as literal text; `file` and `module` still reference the
/// string table by id, matching the wire protocol's `NEW_SYMBOL` reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolRecord {
    pub id: u32,
    pub name: Vec<u8>,
    pub address: u64,
    pub size: u32,
    pub module: u32,
    pub file: u32,
    pub line: u32,
    pub line_last: u32,
}

/// The fully decoded contents of a profile blob: interned strings, symbol
/// records, and each thread's raw (un-filtered) entry stream exactly as
/// captured, sentinel entries included. ID 0 (empty string, "no symbol")
/// is never stored here; callers pre-seed it before consulting this table.
#[derive(Debug, Clone, Default)]
pub struct DecodedProfile {
    pub strings: Vec<(u32, Vec<u8>)>,
    pub symbols: Vec<SymbolRecord>,
    /// `threads[i]` is thread `i`'s entry stream; `symbol == 0` entries are
    /// the sentinels that delimit one completed stack from the next.
    pub threads: Vec<Vec<CallStackEntry>>,
}

fn read_u32(bytes: &[u8], offset: &mut usize) -> Result<u32, StorageError> {
    let end = *offset + 4;
    if bytes.len() < end {
        return Err(StorageError::Truncated {
            expected: end,
            actual: bytes.len(),
        });
    }
    let v = u32::from_le_bytes(bytes[*offset..end].try_into().unwrap());
    *offset = end;
    Ok(v)
}

fn read_u64(bytes: &[u8], offset: &mut usize) -> Result<u64, StorageError> {
    let end = *offset + 8;
    if bytes.len() < end {
        return Err(StorageError::Truncated {
            expected: end,
            actual: bytes.len(),
        });
    }
    let v = u64::from_le_bytes(bytes[*offset..end].try_into().unwrap());
    *offset = end;
    Ok(v)
}

fn read_lp_bytes(bytes: &[u8], offset: &mut usize) -> Result<Vec<u8>, StorageError> {
    let len = read_u32(bytes, offset)? as usize;
    let end = *offset + len;
    if bytes.len() < end {
        return Err(StorageError::Truncated {
            expected: end,
            actual: bytes.len(),
        });
    }
    let out = bytes[*offset..end].to_vec();
    *offset = end;
    Ok(out)
}

fn write_lp_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
    out.extend_from_slice(bytes);
}

/// Decode the inner blob: string table, symbol table, then one raw entry
/// stream per thread. `ptr_size` picks the symbol address width.
pub fn decode_blob(bytes: &[u8], ptr_size: PointerSize) -> Result<DecodedProfile, StorageError> {
    let mut offset = 0usize;
    let mut profile = DecodedProfile::default();

    let string_count = read_u32(bytes, &mut offset)?;
    for _ in 0..string_count {
        let id = read_u32(bytes, &mut offset)?;
        let value = read_lp_bytes(bytes, &mut offset)?;
        profile.strings.push((id, value));
    }

    let symbol_count = read_u32(bytes, &mut offset)?;
    for _ in 0..symbol_count {
        let id = read_u32(bytes, &mut offset)?;
        let name = read_lp_bytes(bytes, &mut offset)?;
        let address = match ptr_size {
            PointerSize::Bits32 => read_u32(bytes, &mut offset)? as u64,
            PointerSize::Bits64 => read_u64(bytes, &mut offset)?,
        };
        let size = read_u32(bytes, &mut offset)?;
        let module = read_u32(bytes, &mut offset)?;
        let file = read_u32(bytes, &mut offset)?;
        let line = read_u32(bytes, &mut offset)?;
        let line_last = read_u32(bytes, &mut offset)?;

        profile.symbols.push(SymbolRecord {
            id,
            name,
            address,
            size,
            module,
            file,
            line,
            line_last,
        });
    }

    let thread_count = read_u32(bytes, &mut offset)?;
    for _ in 0..thread_count {
        let entry_count = read_u32(bytes, &mut offset)?;
        let mut entries = Vec::with_capacity(entry_count as usize);
        for _ in 0..entry_count {
            let symbol = read_u32(bytes, &mut offset)?;
            let line = read_u32(bytes, &mut offset)?;
            let offset_field = read_u32(bytes, &mut offset)?;
            entries.push(CallStackEntry {
                symbol,
                line,
                offset: offset_field,
            });
        }
        profile.threads.push(entries);
    }

    Ok(profile)
}

/// Encode `profile` into the inner blob layout. The inverse of
/// `decode_blob`, used by tests exercising the serialization round trip.
pub fn encode_blob(profile: &DecodedProfile, ptr_size: PointerSize) -> Vec<u8> {
    let mut out = Vec::new();

    out.extend_from_slice(&(profile.strings.len() as u32).to_le_bytes());
    for (id, bytes) in &profile.strings {
        out.extend_from_slice(&id.to_le_bytes());
        write_lp_bytes(&mut out, bytes);
    }

    out.extend_from_slice(&(profile.symbols.len() as u32).to_le_bytes());
    for record in &profile.symbols {
        out.extend_from_slice(&record.id.to_le_bytes());
        write_lp_bytes(&mut out, &record.name);
        match ptr_size {
            PointerSize::Bits32 => out.extend_from_slice(&(record.address as u32).to_le_bytes()),
            PointerSize::Bits64 => out.extend_from_slice(&record.address.to_le_bytes()),
        }
        out.extend_from_slice(&record.size.to_le_bytes());
        out.extend_from_slice(&record.module.to_le_bytes());
        out.extend_from_slice(&record.file.to_le_bytes());
        out.extend_from_slice(&record.line.to_le_bytes());
        out.extend_from_slice(&record.line_last.to_le_bytes());
    }

    out.extend_from_slice(&(profile.threads.len() as u32).to_le_bytes());
    for entries in &profile.threads {
        out.extend_from_slice(&(entries.len() as u32).to_le_bytes());
        for entry in entries {
            out.extend_from_slice(&entry.symbol.to_le_bytes());
            out.extend_from_slice(&entry.line.to_le_bytes());
            out.extend_from_slice(&entry.offset.to_le_bytes());
        }
    }

    out
}

/// Write the full envelope: magic, version, pointer size, and the
/// gzip-compressed blob.
pub fn write_profile_file(blob: &[u8], ptr_size: PointerSize) -> Result<Vec<u8>, StorageError> {
    let mut compressed = Vec::new();
    {
        let mut encoder = flate2::write::GzEncoder::new(&mut compressed, flate2::Compression::default());
        encoder.write_all(blob).map_err(StorageError::Gzip)?;
        encoder.finish().map_err(StorageError::Gzip)?;
    }

    let mut out = Vec::with_capacity(4 + 4 + 4 + 4 + compressed.len());
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&CURRENT_VERSION.to_le_bytes());
    out.extend_from_slice(&ptr_size.bytes().to_le_bytes());
    out.extend_from_slice(&(compressed.len() as u32).to_le_bytes());
    out.extend_from_slice(&compressed);
    Ok(out)
}

/// Parse the envelope and inflate the blob, returning `(ptr_size, blob)`.
pub fn read_profile_file(bytes: &[u8]) -> Result<(PointerSize, Vec<u8>), StorageError> {
    if bytes.len() < 16 {
        return Err(StorageError::Truncated {
            expected: 16,
            actual: bytes.len(),
        });
    }
    if &bytes[0..4] != MAGIC {
        let mut got = [0u8; 4];
        got.copy_from_slice(&bytes[0..4]);
        return Err(StorageError::BadMagic(got));
    }
    let version = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
    if version != CURRENT_VERSION {
        return Err(StorageError::UnsupportedVersion(version));
    }
    let ptr_size_bytes = u32::from_le_bytes(bytes[8..12].try_into().unwrap());
    let ptr_size =
        PointerSize::from_bytes(ptr_size_bytes).map_err(|_| StorageError::InvalidPointerSize(ptr_size_bytes))?;
    let compressed_len = u32::from_le_bytes(bytes[12..16].try_into().unwrap()) as usize;
    let compressed = bytes.get(16..16 + compressed_len).ok_or(StorageError::Truncated {
        expected: 16 + compressed_len,
        actual: bytes.len(),
    })?;

    let mut blob = Vec::new();
    flate2::read::GzDecoder::new(compressed)
        .read_to_end(&mut blob)
        .map_err(StorageError::Gzip)?;

    Ok((ptr_size, blob))
}

/// Memory-map a persisted profile file and return its decoded envelope
/// (pointer size plus the inflated blob). Serialized profiles can reach
/// tens of megabytes for long sessions with many symbols; mapping avoids
/// reading the whole compressed file into a heap buffer before we've even
/// checked the magic number.
pub fn load_profile_file(path: &std::path::Path) -> Result<(PointerSize, Vec<u8>), StorageError> {
    let file = std::fs::File::open(path).map_err(StorageError::Io)?;
    let mmap = unsafe { memmap2::Mmap::map(&file) }.map_err(StorageError::Io)?;
    read_profile_file(&mmap)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sym(id: u32, name: &str, address: u64, size: u32, module: u32, file: u32, line: u32, line_last: u32) -> SymbolRecord {
        SymbolRecord {
            id,
            name: name.as_bytes().to_vec(),
            address,
            size,
            module,
            file,
            line,
            line_last,
        }
    }

    #[test]
    fn blob_round_trips_strings_symbols_threads() {
        let mut profile = DecodedProfile::default();
        profile.strings.push((1, b"main.c".to_vec()));
        profile.strings.push((2, b"app.exe".to_vec()));
        profile.symbols.push(sym(1, "main", 0x1000, 0x10, 2, 1, 5, 9));
        profile.threads.push(vec![
            CallStackEntry { symbol: 1, line: 5, offset: 0 },
            CallStackEntry::SENTINEL,
        ]);

        let blob = encode_blob(&profile, PointerSize::Bits64);
        let decoded = decode_blob(&blob, PointerSize::Bits64).unwrap();

        assert_eq!(decoded.strings, profile.strings);
        assert_eq!(decoded.symbols, profile.symbols);
        assert_eq!(decoded.threads, profile.threads);
    }

    #[test]
    fn blob_round_trips_with_32_bit_addresses() {
        let mut profile = DecodedProfile::default();
        profile.symbols.push(sym(1, "entry", 0x00401000, 0x40, 0, 0, 0, 0));

        let blob = encode_blob(&profile, PointerSize::Bits32);
        let decoded = decode_blob(&blob, PointerSize::Bits32).unwrap();

        assert_eq!(decoded.symbols[0].address, 0x00401000);
    }

    #[test]
    fn envelope_round_trips_through_gzip() {
        let blob = vec![0u8, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0];
        let file = write_profile_file(&blob, PointerSize::Bits64).unwrap();
        let (ptr_size, decoded_blob) = read_profile_file(&file).unwrap();
        assert_eq!(ptr_size, PointerSize::Bits64);
        assert_eq!(decoded_blob, blob);
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut file = write_profile_file(&[0u8; 4], PointerSize::Bits64).unwrap();
        file[0] = b'X';
        assert!(matches!(read_profile_file(&file), Err(StorageError::BadMagic(_))));
    }

    #[test]
    fn truncated_header_is_rejected() {
        assert!(matches!(
            read_profile_file(&[0u8; 4]),
            Err(StorageError::Truncated { .. })
        ));
    }

    #[test]
    fn unsupported_version_is_rejected() {
        let mut file = write_profile_file(&[0u8; 4], PointerSize::Bits64).unwrap();
        file[4..8].copy_from_slice(&99u32.to_le_bytes());
        assert!(matches!(
            read_profile_file(&file),
            Err(StorageError::UnsupportedVersion(99))
        ));
    }

    #[test]
    fn load_profile_file_round_trips_through_mmap() {
        let blob = vec![1u8, 2, 3, 4, 5, 6, 7, 8];
        let file_bytes = write_profile_file(&blob, PointerSize::Bits32).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.prof");
        std::fs::write(&path, &file_bytes).unwrap();

        let (ptr_size, decoded_blob) = load_profile_file(&path).unwrap();
        assert_eq!(ptr_size, PointerSize::Bits32);
        assert_eq!(decoded_blob, blob);
    }

    #[test]
    fn load_profile_file_reports_io_error_for_missing_path() {
        let path = std::path::Path::new("/nonexistent/does-not-exist.prof");
        assert!(matches!(load_profile_file(path), Err(StorageError::Io(_))));
    }
}
