//! Byte-oriented log I/O.
//!
//! Session logs are Latin-1 text of unbounded size, so everything here works
//! on raw bytes one line at a time. Gzip-compressed inputs (`*.gz`) are
//! decoded transparently.

use anyhow::{Context, Result};
use flate2::{Compression, GzBuilder, read::MultiGzDecoder, write::GzEncoder};
use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::Path;

const READ_BUFFER_BYTES: usize = 256 * 1024;

/// Open a log for streaming; `.gz` files are decompressed on the fly.
pub fn open_log<P: AsRef<Path>>(path: P) -> Result<Box<dyn BufRead + Send>> {
    let path = path.as_ref();
    let file =
        File::open(path).with_context(|| format!("Failed to open log {}", path.display()))?;

    let is_gz = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("gz"));

    if is_gz {
        let decoder = MultiGzDecoder::new(BufReader::with_capacity(READ_BUFFER_BYTES, file));
        Ok(Box::new(BufReader::with_capacity(READ_BUFFER_BYTES, decoder)))
    } else {
        Ok(Box::new(BufReader::with_capacity(READ_BUFFER_BYTES, file)))
    }
}

/// Read one line into `buf` without its terminator (`\n` or `\r\n`).
/// Returns `false` at end of input.
pub fn read_line_bytes<R: BufRead + ?Sized>(reader: &mut R, buf: &mut Vec<u8>) -> io::Result<bool> {
    buf.clear();
    let n = reader.read_until(b'\n', buf)?;
    if n == 0 {
        return Ok(false);
    }
    if buf.last() == Some(&b'\n') {
        buf.pop();
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }
    }
    Ok(true)
}

/// Decode Latin-1 bytes; every byte maps to the code point of the same value.
pub fn latin1_to_string(bytes: &[u8]) -> String {
    // Fast path for the overwhelmingly common ASCII case
    if bytes.is_ascii() {
        // ASCII is valid UTF-8
        return String::from_utf8_lossy(bytes).into_owned();
    }
    bytes.iter().map(|&b| b as char).collect()
}

/// Encode to Latin-1; code points above U+00FF become `?`.
pub fn string_to_latin1(s: &str) -> Vec<u8> {
    s.chars()
        .map(|c| u8::try_from(u32::from(c)).unwrap_or(b'?'))
        .collect()
}

/// Create a gzip writer with a zeroed header timestamp so identical input
/// always produces identical bytes.
pub fn create_gz_writer<P: AsRef<Path>>(path: P) -> Result<GzEncoder<BufWriter<File>>> {
    let path = path.as_ref();
    let file =
        File::create(path).with_context(|| format!("Failed to create {}", path.display()))?;
    Ok(GzBuilder::new()
        .mtime(0)
        .write(BufWriter::new(file), Compression::default()))
}

/// Finish a gzip stream and flush the underlying file.
pub fn finish_gz_writer(writer: GzEncoder<BufWriter<File>>) -> Result<()> {
    let mut inner = writer.finish().context("Failed to finish gzip stream")?;
    inner.flush().context("Failed to flush gzip stream")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_read_line_bytes_strips_terminators() {
        let mut cur = Cursor::new(b"one\r\ntwo\nthree".to_vec());
        let mut buf = Vec::new();

        assert!(read_line_bytes(&mut cur, &mut buf).unwrap());
        assert_eq!(buf, b"one");
        assert!(read_line_bytes(&mut cur, &mut buf).unwrap());
        assert_eq!(buf, b"two");
        assert!(read_line_bytes(&mut cur, &mut buf).unwrap());
        assert_eq!(buf, b"three");
        assert!(!read_line_bytes(&mut cur, &mut buf).unwrap());
    }

    #[test]
    fn test_latin1_round_trip() {
        let bytes = [b'A', 0xE9, b'z', 0xFF];
        let s = latin1_to_string(&bytes);
        assert_eq!(s, "Aézÿ");
        assert_eq!(string_to_latin1(&s), bytes.to_vec());
        assert_eq!(string_to_latin1("€"), b"?".to_vec());
    }

    #[test]
    fn test_gz_log_is_transparent() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("run.log.gz");
        let mut w = create_gz_writer(&path).unwrap();
        w.write_all(b"alpha\nbeta\n").unwrap();
        finish_gz_writer(w).unwrap();

        let mut reader = open_log(&path).unwrap();
        let mut buf = Vec::new();
        assert!(read_line_bytes(&mut reader, &mut buf).unwrap());
        assert_eq!(buf, b"alpha");
        assert!(read_line_bytes(&mut reader, &mut buf).unwrap());
        assert_eq!(buf, b"beta");
        assert!(!read_line_bytes(&mut reader, &mut buf).unwrap());
    }
}
