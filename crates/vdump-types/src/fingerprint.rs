use std::fmt;

use md5::{Digest, Md5};

/// Number of bytes in a block fingerprint.
pub const DIGEST_LEN: usize = 16;

/// A 16-byte MD5 fingerprint of one block's payload.
///
/// MD5 is the fingerprint the archive format has always used; it identifies
/// block content across generations and is not a security boundary.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockDigest(pub [u8; DIGEST_LEN]);

impl BlockDigest {
    pub fn compute(data: &[u8]) -> Self {
        let mut hasher = Md5::new();
        hasher.update(data);
        let out = hasher.finalize();
        BlockDigest(out.into())
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; DIGEST_LEN] = bytes.try_into().ok()?;
        Some(BlockDigest(arr))
    }

    pub fn as_bytes(&self) -> &[u8; DIGEST_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for BlockDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockDigest({})", self.to_hex())
    }
}

impl fmt::Display for BlockDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}
