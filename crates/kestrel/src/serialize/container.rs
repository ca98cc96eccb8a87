// Archive container: named binary records
//
// Layout (.kst):
//
//   Header:
//     magic:   [u8; 4]  = b"KSTR"
//     format:  u32 LE   = 1   (container layout, not the archive version)
//     count:   u32 LE   = number of records
//
//   For each record:
//     name_len: u32 LE
//     name:     [u8; name_len]  (UTF-8, e.g. "unit.json", "data/3", "extra/meta.txt")
//     data_len: u64 LE
//     data:     [u8; data_len]
//
// Record names are unique; they are written in sorted order so equal
// archives are byte-identical.

use std::collections::BTreeMap;
use std::io::{Read, Write};

use crate::error::{Error, Result};

const MAGIC: &[u8; 4] = b"KSTR";
const FORMAT: u32 = 1;

/// Records of one archive, by name.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub(crate) struct Container {
    records: BTreeMap<String, Vec<u8>>,
}

impl Container {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, name: impl Into<String>, data: Vec<u8>) {
        self.records.insert(name.into(), data);
    }

    pub fn get(&self, name: &str) -> Option<&[u8]> {
        self.records.get(name).map(Vec::as_slice)
    }

    /// Record `name`, or an error naming it.
    pub fn require(&self, name: &str) -> Result<&[u8]> {
        self.get(name)
            .ok_or_else(|| Error::runtime(format!("archive is missing record '{name}'")))
    }

    /// Records whose name starts with `prefix`, with the prefix stripped.
    pub fn with_prefix<'a>(&'a self, prefix: &'a str) -> impl Iterator<Item = (&'a str, &'a [u8])> + 'a {
        self.records
            .iter()
            .filter_map(move |(k, v)| k.strip_prefix(prefix).map(|rest| (rest, v.as_slice())))
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn write_to(&self, w: &mut impl Write) -> Result<()> {
        w.write_all(MAGIC)?;
        write_u32(w, FORMAT)?;
        write_u32(w, self.records.len() as u32)?;
        for (name, data) in &self.records {
            write_u32(w, name.len() as u32)?;
            w.write_all(name.as_bytes())?;
            write_u64(w, data.len() as u64)?;
            w.write_all(data)?;
        }
        Ok(())
    }

    pub fn read_from(r: &mut impl Read) -> Result<Self> {
        let mut magic = [0u8; 4];
        r.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(Error::runtime(format!(
                "not a kestrel archive: expected magic {MAGIC:?}, got {magic:?}"
            )));
        }
        let format = read_u32(r)?;
        if format != FORMAT {
            return Err(Error::runtime(format!(
                "unsupported archive container format {format} (expected {FORMAT})"
            )));
        }
        let count = read_u32(r)? as usize;
        let mut container = Container::new();
        for _ in 0..count {
            let name_len = read_u32(r)?;
            let name = String::from_utf8(read_bytes(r, u64::from(name_len))?)
                .map_err(|e| Error::runtime(format!("invalid UTF-8 record name: {e}")))?;
            let data_len = read_u64(r)?;
            let data = read_bytes(r, data_len)?;
            container.put(name, data);
        }
        Ok(container)
    }
}

// Low-level IO helpers

fn write_u32(w: &mut impl Write, v: u32) -> std::io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

fn write_u64(w: &mut impl Write, v: u64) -> std::io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

fn read_u32(r: &mut impl Read) -> std::io::Result<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64(r: &mut impl Read) -> std::io::Result<u64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

/// Exactly `len` bytes. The length comes from the archive, so the buffer
/// only grows as data actually arrives.
fn read_bytes(r: &mut impl Read, len: u64) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    let read = r.take(len).read_to_end(&mut buf)?;
    if read as u64 != len {
        return Err(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            format!("record truncated: expected {len} bytes, found {read}"),
        ));
    }
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_records_survive_a_write() {
        let mut c = Container::new();
        c.put("version", b"5".to_vec());
        c.put("extra/a.bin", vec![0, 255, 7]);
        c.put("extra/b.txt", Vec::new());
        let mut bytes = Vec::new();
        c.write_to(&mut bytes).unwrap();
        assert_eq!(&bytes[..4], b"KSTR");

        let back = Container::read_from(&mut bytes.as_slice()).unwrap();
        assert_eq!(back, c);
        let extras: Vec<&str> = back.with_prefix("extra/").map(|(k, _)| k).collect();
        assert_eq!(extras, ["a.bin", "b.txt"]);
    }

    #[test]
    fn test_bad_magic() {
        let err = Container::read_from(&mut &b"NOPE\x01\0\0\0\0\0\0\0"[..]).unwrap_err();
        assert!(err.to_string().contains("not a kestrel archive"));
    }

    #[test]
    fn test_truncated_is_io_error() {
        let mut c = Container::new();
        c.put("unit.json", b"{}".to_vec());
        let mut bytes = Vec::new();
        c.write_to(&mut bytes).unwrap();
        bytes.truncate(bytes.len() - 1);
        assert!(matches!(
            Container::read_from(&mut bytes.as_slice()),
            Err(Error::Io(_))
        ));
    }

    #[test]
    fn test_oversized_record_length_is_io_error() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(MAGIC);
        bytes.extend_from_slice(&FORMAT.to_le_bytes());
        bytes.extend_from_slice(&1u32.to_le_bytes());
        bytes.extend_from_slice(&7u32.to_le_bytes());
        bytes.extend_from_slice(b"version");
        bytes.extend_from_slice(&u64::MAX.to_le_bytes());
        bytes.extend_from_slice(b"5");
        let err = Container::read_from(&mut bytes.as_slice()).unwrap_err();
        assert!(matches!(err, Error::Io(_)), "{err:?}");
        assert!(err.to_string().contains("truncated"), "{err}");

        let mut bytes = Vec::new();
        bytes.extend_from_slice(MAGIC);
        bytes.extend_from_slice(&FORMAT.to_le_bytes());
        bytes.extend_from_slice(&1u32.to_le_bytes());
        bytes.extend_from_slice(&u32::MAX.to_le_bytes());
        assert!(matches!(
            Container::read_from(&mut bytes.as_slice()),
            Err(Error::Io(_))
        ));
    }
}
