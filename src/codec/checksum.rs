//! Length-prefixed record files with a CRC32 footer.
//!
//! Layout (little endian):
//!
//! ```text
//! magic:u32  count:u32  (len:u32 bytes[len]) * count  footer_magic:u32  crc32:u32
//! ```
//!
//! The checksum covers everything before it.

use std::io::{Cursor, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use crc32fast::Hasher;

use crate::error::{Result, SluiceError};

const MAGIC: u32 = 0x534c_4943;
const FOOTER_MAGIC: u32 = 0xc028_93e8;
const HEADER_LEN: usize = 8;
const FOOTER_LEN: usize = 8;

/// Writes through to `inner` while hashing.
struct HashingWriter<'a, W: Write + ?Sized> {
    inner: &'a mut W,
    hasher: Hasher,
    written: u64,
}

impl<W: Write + ?Sized> Write for HashingWriter<'_, W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

/// Write `records` and the footer; returns the number of bytes written.
pub fn write_records<'r, W, I>(out: &mut W, records: I) -> Result<u64>
where
    W: Write + ?Sized,
    I: IntoIterator<Item = &'r [u8]>,
{
    let records: Vec<&[u8]> = records.into_iter().collect();
    let count = u32::try_from(records.len())
        .map_err(|_| SluiceError::invalid_argument("too many records for one file"))?;

    let mut writer = HashingWriter {
        inner: out,
        hasher: Hasher::new(),
        written: 0,
    };
    writer.write_u32::<LittleEndian>(MAGIC)?;
    writer.write_u32::<LittleEndian>(count)?;
    for record in records {
        let len = u32::try_from(record.len())
            .map_err(|_| SluiceError::invalid_argument("record larger than 4 GiB"))?;
        writer.write_u32::<LittleEndian>(len)?;
        writer.write_all(record)?;
    }
    writer.write_u32::<LittleEndian>(FOOTER_MAGIC)?;

    let crc = writer.hasher.clone().finalize();
    let written = writer.written;
    out.write_u32::<LittleEndian>(crc)?;
    Ok(written + 4)
}

/// Verify the checksum and split `bytes` back into records.
///
/// `name` only appears in error messages.
pub fn read_records(bytes: &[u8], name: &str) -> Result<Vec<Vec<u8>>> {
    if bytes.len() < HEADER_LEN + FOOTER_LEN {
        return Err(SluiceError::corruption(format!(
            "{name}: truncated file ({} bytes)",
            bytes.len()
        )));
    }

    let (body, crc_bytes) = bytes.split_at(bytes.len() - 4);
    let expected = Cursor::new(crc_bytes).read_u32::<LittleEndian>()?;
    let actual = crc32fast::hash(body);
    if expected != actual {
        return Err(SluiceError::corruption(format!(
            "{name}: checksum mismatch (expected {expected:#010x}, actual {actual:#010x})"
        )));
    }

    let mut cursor = Cursor::new(body);
    if cursor.read_u32::<LittleEndian>()? != MAGIC {
        return Err(SluiceError::corruption(format!("{name}: bad magic")));
    }
    let count = cursor.read_u32::<LittleEndian>()? as usize;
    let mut records = Vec::with_capacity(count.min(1 << 16));
    for _ in 0..count {
        let len = cursor.read_u32::<LittleEndian>()? as usize;
        let remaining = body.len() - cursor.position() as usize;
        if len > remaining {
            return Err(SluiceError::corruption(format!(
                "{name}: record of {len} bytes overruns file"
            )));
        }
        let mut record = vec![0u8; len];
        cursor.read_exact(&mut record)?;
        records.push(record);
    }
    if cursor.read_u32::<LittleEndian>()? != FOOTER_MAGIC {
        return Err(SluiceError::corruption(format!("{name}: bad footer")));
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_records_survive_write_and_read() {
        let mut out = Vec::new();
        let written = write_records(&mut out, [b"one".as_slice(), b"".as_slice(), b"three"]).unwrap();
        assert_eq!(written, out.len() as u64);

        let records = read_records(&out, "t").unwrap();
        assert_eq!(records, vec![b"one".to_vec(), Vec::new(), b"three".to_vec()]);
    }

    #[test]
    fn test_flipped_bit_is_detected() {
        let mut out = Vec::new();
        write_records(&mut out, [b"payload".as_slice()]).unwrap();
        out[12] ^= 0x01;
        let err = read_records(&out, "t").unwrap_err();
        assert!(err.to_string().contains("checksum mismatch"));
    }

    #[test]
    fn test_truncated_file_is_detected() {
        assert!(matches!(
            read_records(&[1, 2, 3], "t"),
            Err(SluiceError::Corruption(_))
        ));
    }
}
