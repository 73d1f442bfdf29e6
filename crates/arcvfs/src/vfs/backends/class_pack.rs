//! Class pack container format.
//!
//! A flat, little-endian container of named class blobs:
//!
//! ```text
//! header   magic "CPK1" | version u16 | reserved u16 | count u32
//! table    count x ( name_len u16 | name utf-8 | offset u64 | length u32 | crc32 u32 )
//! data     class bytes, addressed by absolute offset
//! ```
//!
//! Names are fully-qualified, dot-separated class names. The table is
//! written in name order.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::io::Write;

use crate::vfs::error::{VfsError, VfsResult};

/// File magic.
pub const MAGIC: &[u8; 4] = b"CPK1";
/// Current format version.
pub const VERSION: u16 = 1;

const HEADER_LEN: usize = 12;
const RECORD_FIXED_LEN: usize = 2 + 8 + 4 + 4;

/// One class table record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassRecord {
    /// Fully-qualified class name.
    pub name: String,
    /// Absolute offset of the class bytes.
    pub offset: u64,
    /// Length of the class bytes.
    pub length: u32,
    /// CRC-32 of the class bytes.
    pub crc32: u32,
}

impl ClassRecord {
    /// Byte range of the class data inside the container.
    pub fn range(&self) -> VfsResult<std::ops::Range<usize>> {
        let start = usize::try_from(self.offset)
            .map_err(|_| VfsError::format(format!("class {} offset overflows", self.name)))?;
        let end = start
            .checked_add(self.length as usize)
            .ok_or_else(|| VfsError::format(format!("class {} length overflows", self.name)))?;
        Ok(start..end)
    }
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> VfsResult<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.bytes.len())
            .ok_or_else(|| VfsError::format("class pack table is truncated"))?;
        let out = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn u16(&mut self) -> VfsResult<u16> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> VfsResult<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> VfsResult<u64> {
        let b = self.take(8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(b);
        Ok(u64::from_le_bytes(buf))
    }
}

/// Parse the header and class table. Every record's data range is checked
/// against the container length.
pub fn read_table(bytes: &[u8]) -> VfsResult<Vec<ClassRecord>> {
    let mut cur = Cursor { bytes, pos: 0 };
    if cur.take(4)? != MAGIC {
        return Err(VfsError::format("bad class pack magic"));
    }
    let version = cur.u16()?;
    if version != VERSION {
        return Err(VfsError::format(format!(
            "unsupported class pack version {version}"
        )));
    }
    let _reserved = cur.u16()?;
    let count = cur.u32()? as usize;

    let mut records = Vec::with_capacity(count.min(bytes.len() / RECORD_FIXED_LEN));
    for _ in 0..count {
        let name_len = cur.u16()? as usize;
        let name = std::str::from_utf8(cur.take(name_len)?)
            .map_err(|e| VfsError::format(format!("class name is not utf-8: {e}")))?
            .to_string();
        let record = ClassRecord {
            name,
            offset: cur.u64()?,
            length: cur.u32()?,
            crc32: cur.u32()?,
        };
        if record.range()?.end > bytes.len() {
            return Err(VfsError::format(format!(
                "class {} points past the end of the container",
                record.name
            )));
        }
        records.push(record);
    }
    Ok(records)
}

/// A class to be written.
#[derive(Debug, Clone)]
pub struct ClassBlob<'a> {
    /// Fully-qualified class name.
    pub name: String,
    /// Class bytes.
    pub data: Cow<'a, [u8]>,
    /// Known CRC-32 of `data`, reused instead of recomputed.
    pub crc32: Option<u32>,
}

/// Serialize classes into a container. Classes are sorted by name; a later
/// duplicate name replaces an earlier one.
pub fn write_pack<W: Write>(out: &mut W, classes: Vec<ClassBlob<'_>>) -> VfsResult<()> {
    let mut sorted: BTreeMap<String, ClassBlob<'_>> = BTreeMap::new();
    for class in classes {
        sorted.insert(class.name.clone(), class);
    }

    let count = u32::try_from(sorted.len())
        .map_err(|_| VfsError::format("too many classes"))?;
    let table_len: usize = sorted
        .keys()
        .map(|name| RECORD_FIXED_LEN + name.len())
        .sum();
    let mut offset = (HEADER_LEN + table_len) as u64;

    out.write_all(MAGIC)?;
    out.write_all(&VERSION.to_le_bytes())?;
    out.write_all(&0u16.to_le_bytes())?;
    out.write_all(&count.to_le_bytes())?;

    for class in sorted.values() {
        let name_len = u16::try_from(class.name.len())
            .map_err(|_| VfsError::format(format!("class name too long: {}", class.name)))?;
        let length = u32::try_from(class.data.len())
            .map_err(|_| VfsError::format(format!("class too large: {}", class.name)))?;
        let crc = class.crc32.unwrap_or_else(|| crc32fast::hash(&class.data));
        out.write_all(&name_len.to_le_bytes())?;
        out.write_all(class.name.as_bytes())?;
        out.write_all(&offset.to_le_bytes())?;
        out.write_all(&length.to_le_bytes())?;
        out.write_all(&crc.to_le_bytes())?;
        offset += u64::from(length);
    }
    for class in sorted.values() {
        out.write_all(&class.data)?;
    }
    out.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blob(name: &str, data: &'static [u8]) -> ClassBlob<'static> {
        ClassBlob {
            name: name.to_string(),
            data: Cow::Borrowed(data),
            crc32: None,
        }
    }

    #[test]
    fn test_written_pack_parses() {
        let mut buf = Vec::new();
        write_pack(
            &mut buf,
            vec![blob("b.B", b"second"), blob("a.A", b"first")],
        )
        .unwrap();

        let table = read_table(&buf).unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table[0].name, "a.A");
        assert_eq!(&buf[table[0].range().unwrap()], b"first");
        assert_eq!(&buf[table[1].range().unwrap()], b"second");
        assert_eq!(table[1].crc32, crc32fast::hash(b"second"));
    }

    #[test]
    fn test_rejects_bad_magic() {
        let err = read_table(b"PK\x03\x04\x00\x00\x00\x00\x00\x00\x00\x00").unwrap_err();
        assert!(matches!(err, VfsError::Format(_)));
    }

    #[test]
    fn test_rejects_out_of_bounds_record() {
        let mut buf = Vec::new();
        write_pack(&mut buf, vec![blob("a.A", b"0123456789")]).unwrap();
        buf.truncate(buf.len() - 4);
        assert!(matches!(read_table(&buf), Err(VfsError::Format(_))));
    }

    #[test]
    fn test_known_crc_is_kept() {
        let mut buf = Vec::new();
        let mut class = blob("a.A", b"x");
        class.crc32 = Some(0xDEAD_BEEF);
        write_pack(&mut buf, vec![class]).unwrap();
        assert_eq!(read_table(&buf).unwrap()[0].crc32, 0xDEAD_BEEF);
    }
}
