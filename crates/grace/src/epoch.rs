use crate::{Error, Result};
use bytes::Bytes;

/// Exact size of the grace object's data: two little-endian u64 values.
pub const HEADER_LEN: usize = 16;

/// The epoch header of the shared grace object.
///
/// `cur` is the serial number of the current grace generation and is never
/// zero once the object exists. `rec` names the generation from which
/// reclaim is currently allowed; zero means the cluster is out of its grace
/// period and no reclaim is permitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Epochs {
    pub cur: u64,
    pub rec: u64,
}

impl Epochs {
    /// Header written when the object is first created.
    pub fn initial() -> Self {
        Self { cur: 1, rec: 0 }
    }

    /// True while a cluster-wide grace period is in force.
    pub fn in_grace(&self) -> bool {
        self.rec != 0
    }

    /// Begin a new grace generation: reclaim is allowed from what was the
    /// current epoch, and a fresh current epoch is opened.
    pub fn advanced(self) -> Self {
        Self {
            cur: self.cur + 1,
            rec: self.cur,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = [0u8; HEADER_LEN];
        buf[..8].copy_from_slice(&self.cur.to_le_bytes());
        buf[8..].copy_from_slice(&self.rec.to_le_bytes());
        Bytes::copy_from_slice(&buf)
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() != HEADER_LEN {
            return Err(Error::Corrupt("grace header is not 16 bytes"));
        }
        let cur = u64::from_le_bytes(buf[..8].try_into().expect("8-byte slice"));
        let rec = u64::from_le_bytes(buf[8..].try_into().expect("8-byte slice"));
        Ok(Self { cur, rec })
    }
}

impl std::fmt::Display for Epochs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "cur={} rec={}", self.cur, self.rec)
    }
}
