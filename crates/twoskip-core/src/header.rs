//! Fixed 64-byte file header.
//!
//! Layout (all integers network byte order):
//!
//! ```text
//! offset  size  field
//!      0    20  magic
//!     20     4  version
//!     24     8  generation
//!     32     8  num_records
//!     40     8  repack_size
//!     48     8  current_size
//!     56     4  flags
//!     60     4  crc32 (covers bytes 0..59)
//! ```

use crate::config::{MAX_SUPPORTED_VERSION, VERSION};
use crate::error::{Error, Result};

/// Total on-disk header size.
pub const HEADER_SIZE: usize = 64;

/// The span covered by the trailing CRC32.
const CRC_SPAN: usize = 60;

/// 20-byte magic prefix: `0xA1 0x02 0x8B 0x0D` + `"twoskip file"` + 4 NULs.
pub const MAGIC: [u8; 20] = [
    0xA1, 0x02, 0x8B, 0x0D, b't', b'w', b'o', b's', b'k', b'i', b'p', b' ', b'f', b'i', b'l',
    b'e', 0x00, 0x00, 0x00, 0x00,
];

/// Bit 0 of `flags`: uncommitted writes may exist past `current_size`.
pub const FLAG_DIRTY: u32 = 0x01;

/// In-memory view of the 64-byte header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub version: u32,
    pub generation: u64,
    pub num_records: u64,
    pub repack_size: u64,
    pub current_size: u64,
    pub flags: u32,
}

impl Header {
    /// Header for a brand-new file: version 1, generation 0, `current_size`
    /// set to the offset immediately after the header (the DUMMY record is
    /// appended by the caller and `current_size` updated on first commit).
    pub fn new(current_size: u64) -> Self {
        Self {
            version: VERSION,
            generation: 0,
            num_records: 0,
            repack_size: current_size,
            current_size,
            flags: 0,
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.flags & FLAG_DIRTY != 0
    }

    pub fn set_dirty(&mut self, dirty: bool) {
        if dirty {
            self.flags |= FLAG_DIRTY;
        } else {
            self.flags &= !FLAG_DIRTY;
        }
    }

    /// Encodes the header into a fresh 64-byte buffer, including the CRC.
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..20].copy_from_slice(&MAGIC);
        buf[20..24].copy_from_slice(&self.version.to_be_bytes());
        buf[24..32].copy_from_slice(&self.generation.to_be_bytes());
        buf[32..40].copy_from_slice(&self.num_records.to_be_bytes());
        buf[40..48].copy_from_slice(&self.repack_size.to_be_bytes());
        buf[48..56].copy_from_slice(&self.current_size.to_be_bytes());
        buf[56..60].copy_from_slice(&self.flags.to_be_bytes());
        let crc = crc32fast::hash(&buf[0..CRC_SPAN]);
        buf[60..64].copy_from_slice(&crc.to_be_bytes());
        buf
    }

    /// Decodes and validates a 64-byte buffer read from `path`.
    pub fn decode(buf: &[u8; HEADER_SIZE], path: &std::path::Path) -> Result<Self> {
        if buf[0..20] != MAGIC {
            return Err(Error::InvalidMagic(path.to_path_buf()));
        }
        let stored_crc = u32::from_be_bytes(buf[60..64].try_into().unwrap());
        let computed_crc = crc32fast::hash(&buf[0..CRC_SPAN]);
        if stored_crc != computed_crc {
            return Err(Error::CorruptHeader(path.to_path_buf()));
        }
        let version = u32::from_be_bytes(buf[20..24].try_into().unwrap());
        if version > MAX_SUPPORTED_VERSION {
            return Err(Error::UnsupportedVersion {
                path: path.to_path_buf(),
                found: version,
                max: MAX_SUPPORTED_VERSION,
            });
        }
        Ok(Self {
            version,
            generation: u64::from_be_bytes(buf[24..32].try_into().unwrap()),
            num_records: u64::from_be_bytes(buf[32..40].try_into().unwrap()),
            repack_size: u64::from_be_bytes(buf[40..48].try_into().unwrap()),
            current_size: u64::from_be_bytes(buf[48..56].try_into().unwrap()),
            flags: u32::from_be_bytes(buf[56..60].try_into().unwrap()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn round_trip() {
        let mut h = Header::new(96);
        h.set_dirty(true);
        h.generation = 3;
        h.num_records = 42;
        let buf = h.encode();
        let decoded = Header::decode(&buf, Path::new("db")).unwrap();
        assert_eq!(h, decoded);
        assert!(decoded.is_dirty());
    }

    #[test]
    fn rejects_bad_magic() {
        let mut buf = Header::new(64).encode();
        buf[0] = 0x00;
        let err = Header::decode(&buf, Path::new("db")).unwrap_err();
        assert!(matches!(err, Error::InvalidMagic(_)));
    }

    #[test]
    fn rejects_corrupt_crc() {
        let mut buf = Header::new(64).encode();
        buf[32] ^= 0xFF;
        let err = Header::decode(&buf, Path::new("db")).unwrap_err();
        assert!(matches!(err, Error::CorruptHeader(_)));
    }

    #[test]
    fn rejects_future_version() {
        let mut h = Header::new(64);
        h.version = MAX_SUPPORTED_VERSION + 1;
        let buf = h.encode();
        let err = Header::decode(&buf, Path::new("db")).unwrap_err();
        assert!(matches!(err, Error::UnsupportedVersion { .. }));
    }
}
