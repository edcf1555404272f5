//! Changed-block bitmap, the input of an incremental dump.
//!
//! Serialized as the bit count (NUL-decimal) followed by the raw packed
//! bytes. Bit `i` lives in byte `i / 8` and is addressed MSB-first.

use std::io::{BufRead, Write};

use crate::serialize;
use vdump_types::error::{Result, VdumpError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitmap {
    bit_count: u64,
    bytes: Vec<u8>,
}

fn byte_len(bit_count: u64) -> usize {
    ((bit_count + 7) / 8) as usize
}

impl Bitmap {
    /// All-clear bitmap of `bit_count` bits.
    pub fn new(bit_count: u64) -> Self {
        Bitmap {
            bit_count,
            bytes: vec![0u8; byte_len(bit_count)],
        }
    }

    pub fn len(&self) -> u64 {
        self.bit_count
    }

    pub fn is_empty(&self) -> bool {
        self.bit_count == 0
    }

    fn mask(idx: u64) -> u8 {
        0x80 >> (idx % 8)
    }

    /// Out-of-range reads are `false`, matching how a short bitmap treats
    /// trailing blocks as unchanged.
    pub fn get(&self, idx: u64) -> bool {
        if idx >= self.bit_count {
            return false;
        }
        self.bytes[(idx / 8) as usize] & Self::mask(idx) != 0
    }

    pub fn set(&mut self, idx: u64, value: bool) {
        assert!(idx < self.bit_count, "bit {idx} out of {}", self.bit_count);
        let byte = &mut self.bytes[(idx / 8) as usize];
        if value {
            *byte |= Self::mask(idx);
        } else {
            *byte &= !Self::mask(idx);
        }
    }

    pub fn count_set(&self) -> u64 {
        (0..self.bit_count).filter(|&i| self.get(i)).count() as u64
    }

    pub fn write_to(&self, w: &mut impl Write) -> Result<()> {
        serialize::put_u64(w, self.bit_count)?;
        w.write_all(&self.bytes)?;
        Ok(())
    }

    pub fn read_from(r: &mut impl BufRead) -> Result<Self> {
        let bit_count = serialize::get_u64(r)?;
        let mut bytes = vec![0u8; byte_len(bit_count)];
        r.read_exact(&mut bytes).map_err(|e| {
            VdumpError::Format(format!(
                "bitmap truncated (wanted {} bytes): {e}",
                byte_len(bit_count)
            ))
        })?;
        Ok(Bitmap { bit_count, bytes })
    }

    /// Human-readable layout: a size line, then rows of 32 bits with a space
    /// every 8.
    pub fn print(&self, w: &mut impl Write) -> Result<()> {
        writeln!(w, "size: {}", self.bit_count)?;
        for i in 0..self.bit_count {
            write!(w, "{}", if self.get(i) { '1' } else { '0' })?;
            if i % 32 == 31 {
                writeln!(w)?;
            } else if i % 8 == 7 {
                write!(w, " ")?;
            }
        }
        if self.bit_count % 32 != 0 {
            writeln!(w)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn set_get_roundtrip() {
        let mut bmp = Bitmap::new(19);
        bmp.set(0, true);
        bmp.set(8, true);
        bmp.set(18, true);
        assert!(bmp.get(0));
        assert!(!bmp.get(1));
        assert!(bmp.get(8));
        assert!(bmp.get(18));
        assert_eq!(bmp.count_set(), 3);

        bmp.set(8, false);
        assert!(!bmp.get(8));
        assert_eq!(bmp.count_set(), 2);
    }

    #[test]
    fn bit_zero_is_high_bit() {
        let mut bmp = Bitmap::new(8);
        bmp.set(0, true);
        let mut buf = Vec::new();
        bmp.write_to(&mut buf).unwrap();
        assert_eq!(buf, b"8\x00\x80");
    }

    #[test]
    fn serialize_roundtrip() {
        let mut bmp = Bitmap::new(100);
        for i in (0..100).step_by(7) {
            bmp.set(i, true);
        }
        let mut buf = Vec::new();
        bmp.write_to(&mut buf).unwrap();
        let back = Bitmap::read_from(&mut Cursor::new(buf)).unwrap();
        assert_eq!(bmp, back);
    }

    #[test]
    fn out_of_range_reads_false() {
        let bmp = Bitmap::new(4);
        assert!(!bmp.get(4));
        assert!(!bmp.get(1000));
    }

    #[test]
    fn truncated_input_rejected() {
        let mut buf = Vec::new();
        serialize::put_u64(&mut buf, 64).unwrap();
        buf.push(0xFF); // 1 of 8 payload bytes
        let err = Bitmap::read_from(&mut Cursor::new(buf)).unwrap_err();
        assert!(matches!(err, VdumpError::Format(_)));
    }

    #[test]
    fn print_layout() {
        let mut bmp = Bitmap::new(9);
        bmp.set(3, true);
        let mut out = Vec::new();
        bmp.print(&mut out).unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "size: 9\n00010000 0\n"
        );
    }
}
