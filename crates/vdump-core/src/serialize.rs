//! Primitive wire codec shared by every archive stream.
//!
//! The on-disk framing is inherited from the original archive format and
//! must round-trip byte-exactly: integers and booleans are ASCII decimal
//! followed by a single NUL byte, strings are raw bytes followed by NUL,
//! byte arrays and string maps are length-prefixed (the length itself
//! NUL-decimal) followed by raw contents.

use std::collections::BTreeMap;
use std::io::{BufRead, Write};
use std::str::FromStr;

use vdump_types::error::{Result, VdumpError};

/// Ordered string-to-string map, serialized as `len (k v)*`.
pub type StringMap = BTreeMap<String, String>;

pub fn put_u64(w: &mut impl Write, v: u64) -> Result<()> {
    write!(w, "{v}\0")?;
    Ok(())
}

pub fn put_i64(w: &mut impl Write, v: i64) -> Result<()> {
    write!(w, "{v}\0")?;
    Ok(())
}

pub fn put_i32(w: &mut impl Write, v: i32) -> Result<()> {
    write!(w, "{v}\0")?;
    Ok(())
}

pub fn put_bool(w: &mut impl Write, v: bool) -> Result<()> {
    write!(w, "{}\0", if v { 1 } else { 0 })?;
    Ok(())
}

pub fn put_str(w: &mut impl Write, s: &str) -> Result<()> {
    w.write_all(s.as_bytes())?;
    w.write_all(b"\0")?;
    Ok(())
}

pub fn put_bytes(w: &mut impl Write, bytes: &[u8]) -> Result<()> {
    put_u64(w, bytes.len() as u64)?;
    w.write_all(bytes)?;
    Ok(())
}

pub fn put_map(w: &mut impl Write, map: &StringMap) -> Result<()> {
    put_u64(w, map.len() as u64)?;
    for (key, value) in map {
        put_str(w, key)?;
        put_str(w, value)?;
    }
    Ok(())
}

/// Read bytes up to the next NUL, excluding it. Errors on EOF before NUL.
fn read_field(r: &mut impl BufRead) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    r.read_until(0, &mut buf)?;
    match buf.pop() {
        Some(0) => Ok(buf),
        _ => Err(VdumpError::Format(
            "premature end of stream inside a field".into(),
        )),
    }
}

fn parse_field<T: FromStr>(buf: &[u8], what: &str) -> Result<T> {
    std::str::from_utf8(buf)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| {
            VdumpError::Format(format!(
                "invalid {what} field: {:?}",
                String::from_utf8_lossy(buf)
            ))
        })
}

pub fn get_u64(r: &mut impl BufRead) -> Result<u64> {
    let buf = read_field(r)?;
    parse_field(&buf, "u64")
}

pub fn get_i64(r: &mut impl BufRead) -> Result<i64> {
    let buf = read_field(r)?;
    parse_field(&buf, "i64")
}

pub fn get_i32(r: &mut impl BufRead) -> Result<i32> {
    let buf = read_field(r)?;
    parse_field(&buf, "i32")
}

pub fn get_bool(r: &mut impl BufRead) -> Result<bool> {
    let buf = read_field(r)?;
    match buf.as_slice() {
        b"1" => Ok(true),
        b"0" => Ok(false),
        other => Err(VdumpError::Format(format!(
            "invalid bool field: {:?}",
            String::from_utf8_lossy(other)
        ))),
    }
}

pub fn get_str(r: &mut impl BufRead) -> Result<String> {
    let buf = read_field(r)?;
    String::from_utf8(buf).map_err(|_| VdumpError::Format("non-UTF-8 string field".into()))
}

pub fn get_bytes(r: &mut impl BufRead) -> Result<Vec<u8>> {
    let len = get_u64(r)? as usize;
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf).map_err(|e| {
        VdumpError::Format(format!("byte array truncated (wanted {len} bytes): {e}"))
    })?;
    Ok(buf)
}

pub fn get_map(r: &mut impl BufRead) -> Result<StringMap> {
    let len = get_u64(r)?;
    let mut map = StringMap::new();
    for _ in 0..len {
        let key = get_str(r)?;
        let value = get_str(r)?;
        map.insert(key, value);
    }
    Ok(map)
}

/// True when the reader has no more data. Fills the underlying buffer,
/// so a gzip trailer is fully consumed before EOF is reported.
pub fn at_eof(r: &mut impl BufRead) -> Result<bool> {
    Ok(r.fill_buf()?.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn u64_roundtrip() {
        let mut buf = Vec::new();
        put_u64(&mut buf, 0).unwrap();
        put_u64(&mut buf, 18446744073709551615).unwrap();
        assert_eq!(buf, b"0\x0018446744073709551615\x00");

        let mut r = Cursor::new(buf);
        assert_eq!(get_u64(&mut r).unwrap(), 0);
        assert_eq!(get_u64(&mut r).unwrap(), u64::MAX);
        assert!(at_eof(&mut r).unwrap());
    }

    #[test]
    fn negative_integers() {
        let mut buf = Vec::new();
        put_i64(&mut buf, -42).unwrap();
        put_i32(&mut buf, -7).unwrap();
        let mut r = Cursor::new(buf);
        assert_eq!(get_i64(&mut r).unwrap(), -42);
        assert_eq!(get_i32(&mut r).unwrap(), -7);
    }

    #[test]
    fn bool_encoding_is_digit() {
        let mut buf = Vec::new();
        put_bool(&mut buf, true).unwrap();
        put_bool(&mut buf, false).unwrap();
        assert_eq!(buf, b"1\x000\x00");
        let mut r = Cursor::new(buf);
        assert!(get_bool(&mut r).unwrap());
        assert!(!get_bool(&mut r).unwrap());
    }

    #[test]
    fn bool_rejects_other_values() {
        let mut r = Cursor::new(b"2\x00".to_vec());
        assert!(matches!(get_bool(&mut r), Err(VdumpError::Format(_))));
    }

    #[test]
    fn string_roundtrip() {
        let mut buf = Vec::new();
        put_str(&mut buf, "hello world").unwrap();
        put_str(&mut buf, "").unwrap();
        let mut r = Cursor::new(buf);
        assert_eq!(get_str(&mut r).unwrap(), "hello world");
        assert_eq!(get_str(&mut r).unwrap(), "");
    }

    #[test]
    fn bytes_roundtrip_includes_nul() {
        // A byte array may contain NUL; only the length prefix frames it.
        let data = vec![0u8, 1, 2, 0, 255];
        let mut buf = Vec::new();
        put_bytes(&mut buf, &data).unwrap();
        assert_eq!(&buf[..2], b"5\x00");
        let mut r = Cursor::new(buf);
        assert_eq!(get_bytes(&mut r).unwrap(), data);
    }

    #[test]
    fn truncated_bytes_is_format_error() {
        let mut buf = Vec::new();
        put_u64(&mut buf, 100).unwrap();
        buf.extend_from_slice(&[1, 2, 3]);
        let mut r = Cursor::new(buf);
        assert!(matches!(get_bytes(&mut r), Err(VdumpError::Format(_))));
    }

    #[test]
    fn map_roundtrip_ordered() {
        let mut map = StringMap::new();
        map.insert("geometry".into(), "1024/255/63".into());
        map.insert("adapter".into(), "lsilogic".into());
        let mut buf = Vec::new();
        put_map(&mut buf, &map).unwrap();
        // BTreeMap iterates in key order: adapter before geometry.
        assert_eq!(
            buf,
            b"2\x00adapter\x00lsilogic\x00geometry\x001024/255/63\x00"
        );
        let mut r = Cursor::new(buf);
        assert_eq!(get_map(&mut r).unwrap(), map);
    }

    #[test]
    fn empty_map_roundtrip() {
        let map = StringMap::new();
        let mut buf = Vec::new();
        put_map(&mut buf, &map).unwrap();
        assert_eq!(buf, b"0\x00");
        let mut r = Cursor::new(buf);
        assert!(get_map(&mut r).unwrap().is_empty());
    }

    #[test]
    fn missing_nul_is_format_error() {
        let mut r = Cursor::new(b"123".to_vec());
        assert!(matches!(get_u64(&mut r), Err(VdumpError::Format(_))));
    }
}
