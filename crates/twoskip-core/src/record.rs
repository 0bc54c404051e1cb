//! On-disk record codec.
//!
//! Frames and parses the variable-length, 8-byte-aligned records that make
//! up everything past the 64-byte header. Decode the fixed head first,
//! resolve length escapes, verify the head CRC before trusting anything it
//! claims, and only then look at the payload (whose tail CRC is checked
//! lazily, on demand).

use std::convert::TryInto;

use crate::config::MAXLEVEL;
use crate::error::{Error, Result};

/// One past the highest level a record may carry (`0..=MAXLEVEL`).
pub const MAX_NEXTLOC: usize = 32;

/// Largest possible fixed head: `(MAXLEVEL + 5) * 8` bytes — type/level/
/// lengths, both extended-length fields, every `nextloc` slot, and both
/// CRCs.
pub const MAX_RECORD_HEAD: usize = (MAXLEVEL as usize + 5) * 8;

/// Escape value for `keylen`/`vallen` signalling an 8-byte extension follows.
const KEYLEN_ESCAPE: u16 = 0xFFFF;
const VALLEN_ESCAPE: u32 = 0xFFFF_FFFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordType {
    Dummy,
    Record,
    Delete,
    Commit,
}

impl RecordType {
    fn to_byte(self) -> u8 {
        match self {
            RecordType::Dummy => b'=',
            RecordType::Record => b'+',
            RecordType::Delete => b'-',
            RecordType::Commit => b'$',
        }
    }

    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            b'=' => Some(RecordType::Dummy),
            b'+' => Some(RecordType::Record),
            b'-' => Some(RecordType::Delete),
            b'$' => Some(RecordType::Commit),
            _ => None,
        }
    }
}

/// A decoded record: fixed head plus (optionally loaded) payload.
#[derive(Debug, Clone)]
pub struct Record {
    pub rtype: RecordType,
    pub level: u8,
    pub keylen: u64,
    pub vallen: u64,
    /// Forward pointers, indexed `0..MAX_NEXTLOC`. Only `0..=level` are
    /// meaningful for non-DELETE/COMMIT types; slots beyond `level` are
    /// kept at zero on disk but the in-memory array is fixed-size so
    /// `stitch` can address any slot uniformly.
    pub nextloc: [u64; MAX_NEXTLOC],
    pub crc_head: u32,
    pub crc_tail: u32,
    /// Offset of this record's first byte.
    pub offset: u64,
    /// Total on-disk length, including padding, a multiple of 8.
    pub total_len: u64,
    /// Offset of the key bytes within the file (valid once decoded).
    pub key_offset: u64,
    /// Offset of the value bytes within the file.
    pub val_offset: u64,
}

impl Record {
    /// Offset of `nextloc[0]` for a DELETE/COMMIT record — both use exactly
    /// one forward pointer at level 0 carrying a different meaning.
    pub fn single_pointer(&self) -> u64 {
        self.nextloc[0]
    }

    /// Decodes a record's fixed head starting at `offset` within `buf`
    /// (the whole mapped file). Does not read or verify the payload.
    pub fn decode_head(buf: &[u8], offset: u64, path: &std::path::Path) -> Result<Self> {
        let start = offset as usize;
        if start + 8 > buf.len() {
            return Err(Error::corrupt_record(path, offset, "truncated record head"));
        }
        let rtype = RecordType::from_byte(buf[start])
            .ok_or_else(|| Error::corrupt_record(path, offset, "unknown record type"))?;
        let level = buf[start + 1];
        if level as usize >= MAX_NEXTLOC {
            return Err(Error::corrupt_record(path, offset, "level out of range"));
        }
        let mut cursor = start + 2;
        let raw_keylen = u16::from_be_bytes(buf[cursor..cursor + 2].try_into().unwrap());
        cursor += 2;
        let raw_vallen = u32::from_be_bytes(buf[cursor..cursor + 4].try_into().unwrap());
        cursor += 4;

        let mut keylen = u64::from(raw_keylen);
        if raw_keylen == KEYLEN_ESCAPE {
            if cursor + 8 > buf.len() {
                return Err(Error::corrupt_record(path, offset, "truncated extended keylen"));
            }
            keylen = u64::from_be_bytes(buf[cursor..cursor + 8].try_into().unwrap());
            cursor += 8;
        }

        let mut vallen = u64::from(raw_vallen);
        if raw_vallen == VALLEN_ESCAPE {
            if cursor + 8 > buf.len() {
                return Err(Error::corrupt_record(path, offset, "truncated extended vallen"));
            }
            vallen = u64::from_be_bytes(buf[cursor..cursor + 8].try_into().unwrap());
            cursor += 8;
        }

        let nptrs = level as usize + 1;
        let nextloc_bytes = nptrs * 8;
        if cursor + nextloc_bytes + 8 > buf.len() {
            return Err(Error::corrupt_record(path, offset, "truncated nextloc/crc"));
        }
        let mut nextloc = [0u64; MAX_NEXTLOC];
        for (i, slot) in nextloc.iter_mut().enumerate().take(nptrs) {
            let o = cursor + i * 8;
            *slot = u64::from_be_bytes(buf[o..o + 8].try_into().unwrap());
        }
        cursor += nextloc_bytes;

        let head_end = cursor + 4;
        let crc_head = u32::from_be_bytes(buf[cursor..head_end].try_into().unwrap());
        let computed = crc32fast::hash(&buf[start..cursor]);
        if computed != crc_head {
            return Err(Error::corrupt_record(path, offset, "head CRC mismatch"));
        }
        cursor = head_end;

        if cursor + 4 > buf.len() {
            return Err(Error::corrupt_record(path, offset, "truncated tail CRC"));
        }
        let crc_tail = u32::from_be_bytes(buf[cursor..cursor + 4].try_into().unwrap());
        cursor += 4;

        let key_offset = cursor as u64;
        let val_offset = key_offset + keylen;
        let payload_end = val_offset + vallen;
        let total_len = align8(payload_end - offset);
        if offset + total_len > buf.len() as u64 {
            return Err(Error::corrupt_record(path, offset, "record overruns file"));
        }

        Ok(Self {
            rtype,
            level,
            keylen,
            vallen,
            nextloc,
            crc_head,
            crc_tail,
            offset,
            total_len,
            key_offset,
            val_offset,
        })
    }

    /// Verifies the tail CRC (key + value + zero padding) against `buf`.
    /// Deferred until needed: only exact-match lookups and consistency
    /// checks pay for it.
    pub fn verify_tail(&self, buf: &[u8], path: &std::path::Path) -> Result<()> {
        let key_start = self.key_offset as usize;
        let pad_end = (self.offset + self.total_len) as usize;
        let computed = crc32fast::hash(&buf[key_start..pad_end]);
        if computed != self.crc_tail {
            return Err(Error::corrupt_record(path, self.offset, "tail CRC mismatch"));
        }
        Ok(())
    }

    pub fn key<'a>(&self, buf: &'a [u8]) -> &'a [u8] {
        let start = self.key_offset as usize;
        let end = start + self.keylen as usize;
        &buf[start..end]
    }

    pub fn value<'a>(&self, buf: &'a [u8]) -> &'a [u8] {
        let start = self.val_offset as usize;
        let end = start + self.vallen as usize;
        &buf[start..end]
    }
}

fn align8(len: u64) -> u64 {
    (len + 7) & !7
}

/// Builds the bytes of a brand-new record (head + payload + padding),
/// ready to append at the file tail.
pub fn encode_new(
    rtype: RecordType,
    level: u8,
    key: &[u8],
    value: &[u8],
    nextloc: &[u64],
) -> Vec<u8> {
    let mut out = Vec::with_capacity(MAX_RECORD_HEAD + key.len() + value.len() + 8);
    out.push(rtype.to_byte());
    out.push(level);

    if key.len() >= KEYLEN_ESCAPE as usize {
        out.extend_from_slice(&KEYLEN_ESCAPE.to_be_bytes());
    } else {
        out.extend_from_slice(&(key.len() as u16).to_be_bytes());
    }
    if value.len() >= VALLEN_ESCAPE as usize {
        out.extend_from_slice(&VALLEN_ESCAPE.to_be_bytes());
    } else {
        out.extend_from_slice(&(value.len() as u32).to_be_bytes());
    }
    if key.len() >= KEYLEN_ESCAPE as usize {
        out.extend_from_slice(&(key.len() as u64).to_be_bytes());
    }
    if value.len() >= VALLEN_ESCAPE as usize {
        out.extend_from_slice(&(value.len() as u64).to_be_bytes());
    }

    let nptrs = level as usize + 1;
    for i in 0..nptrs {
        let v = nextloc.get(i).copied().unwrap_or(0);
        out.extend_from_slice(&v.to_be_bytes());
    }

    let crc_head = crc32fast::hash(&out);
    out.extend_from_slice(&crc_head.to_be_bytes());

    let mut tail_input = Vec::with_capacity(key.len() + value.len());
    tail_input.extend_from_slice(key);
    tail_input.extend_from_slice(value);
    let unpadded_payload_len = out.len() + 4 + tail_input.len();
    let padded_total = align8(unpadded_payload_len as u64) as usize;
    let pad_len = padded_total - unpadded_payload_len;
    tail_input.resize(tail_input.len() + pad_len, 0);

    let crc_tail = crc32fast::hash(&tail_input);
    out.extend_from_slice(&crc_tail.to_be_bytes());
    out.extend_from_slice(&tail_input);

    debug_assert_eq!(out.len() % 8, 0);
    out
}

/// Re-encodes just the fixed head of an existing record (used by `stitch`
/// to rewrite predecessor pointers in place). The tail CRC is unchanged and
/// must be supplied by the caller since it is read off the existing record.
pub fn encode_head(
    rtype: RecordType,
    level: u8,
    keylen: u64,
    vallen: u64,
    nextloc: &[u64],
    crc_tail: u32,
) -> Vec<u8> {
    let mut out = Vec::with_capacity(MAX_RECORD_HEAD);
    out.push(rtype.to_byte());
    out.push(level);

    if keylen >= KEYLEN_ESCAPE as u64 {
        out.extend_from_slice(&KEYLEN_ESCAPE.to_be_bytes());
    } else {
        out.extend_from_slice(&(keylen as u16).to_be_bytes());
    }
    if vallen >= VALLEN_ESCAPE as u64 {
        out.extend_from_slice(&VALLEN_ESCAPE.to_be_bytes());
    } else {
        out.extend_from_slice(&(vallen as u32).to_be_bytes());
    }
    if keylen >= KEYLEN_ESCAPE as u64 {
        out.extend_from_slice(&keylen.to_be_bytes());
    }
    if vallen >= VALLEN_ESCAPE as u64 {
        out.extend_from_slice(&vallen.to_be_bytes());
    }

    let nptrs = level as usize + 1;
    for i in 0..nptrs {
        let v = nextloc.get(i).copied().unwrap_or(0);
        out.extend_from_slice(&v.to_be_bytes());
    }

    let crc_head = crc32fast::hash(&out);
    out.extend_from_slice(&crc_head.to_be_bytes());
    out.extend_from_slice(&crc_tail.to_be_bytes());
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn roundtrip(rtype: RecordType, level: u8, key: &[u8], val: &[u8], nextloc: &[u64]) -> Record {
        let mut file = vec![0u8; 64];
        file.extend_from_slice(&encode_new(rtype, level, key, val, nextloc));
        Record::decode_head(&file, 64, Path::new("db")).unwrap()
    }

    #[test]
    fn small_record_round_trips() {
        let rec = roundtrip(RecordType::Record, 2, b"hello", b"world", &[100, 200, 300]);
        assert_eq!(rec.keylen, 5);
        assert_eq!(rec.vallen, 5);
        assert_eq!(rec.level, 2);
        assert_eq!(rec.nextloc[0], 100);
        assert_eq!(rec.nextloc[1], 200);
        assert_eq!(rec.nextloc[2], 300);
        assert_eq!(rec.total_len % 8, 0);
    }

    #[test]
    fn extended_length_escape_round_trips() {
        let key = vec![b'k'; 70_000];
        let val = vec![b'v'; 10];
        let rec = roundtrip(RecordType::Record, 1, &key, &val, &[0, 0]);
        assert_eq!(rec.keylen, 70_000);
        let mut file = vec![0u8; 64];
        file.extend_from_slice(&encode_new(RecordType::Record, 1, &key, &val, &[0, 0]));
        assert_eq!(rec.key(&file), key.as_slice());
        assert_eq!(rec.value(&file), val.as_slice());
    }

    #[test]
    fn head_crc_mismatch_is_detected() {
        let mut file = vec![0u8; 64];
        file.extend_from_slice(&encode_new(RecordType::Record, 0, b"k", b"v", &[0]));
        // Flip a byte inside the fixed head (the nextloc[0] field), which is
        // covered by the head CRC but precedes it in the byte stream.
        let idx = 64 + 8;
        file[idx] ^= 0xFF;
        let err = Record::decode_head(&file, 64, Path::new("db")).unwrap_err();
        assert!(matches!(err, Error::CorruptRecord { .. }));
    }

    #[test]
    fn tail_crc_is_verified_on_demand() {
        let mut file = vec![0u8; 64];
        file.extend_from_slice(&encode_new(RecordType::Record, 0, b"k", b"v", &[0]));
        let rec = Record::decode_head(&file, 64, Path::new("db")).unwrap();
        rec.verify_tail(&file, Path::new("db")).unwrap();
        let vidx = rec.val_offset as usize;
        file[vidx] ^= 0xFF;
        assert!(rec.verify_tail(&file, Path::new("db")).is_err());
    }

    #[test]
    fn delete_and_commit_carry_single_pointer() {
        let rec = roundtrip(RecordType::Delete, 0, b"", b"", &[42]);
        assert_eq!(rec.single_pointer(), 42);
        let rec = roundtrip(RecordType::Commit, 0, b"", b"", &[7]);
        assert_eq!(rec.single_pointer(), 7);
    }
}
