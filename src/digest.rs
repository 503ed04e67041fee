//! SHA-256 content addressing.
//!
//! Blobs are identified by the digest of their stored (possibly compressed)
//! bytes; layer filesystem content is identified by the diff-id, the digest
//! of the uncompressed bytes. Both use the canonical `algorithm:hex` string
//! form, fixed to SHA-256 here.

use std::io::Read;

use oci_spec::image::Digest;
use sha2::{Digest as _, Sha256};

use crate::{Error, Result};

/// Parse an `algorithm:hex` string into a [`Digest`].
pub fn parse(s: &str) -> Result<Digest> {
    s.parse::<Digest>()
        .map_err(|e| Error::InvalidDigest(format!("{s}: {e}")))
}

fn from_hash(hash: [u8; 32]) -> Digest {
    let s = format!("sha256:{}", hex::encode(hash));
    // A freshly hex-encoded SHA-256 always parses.
    s.parse::<Digest>().expect("sha256 digest string is valid")
}

/// SHA-256 digest of a byte slice.
pub fn sha256(data: &[u8]) -> Digest {
    from_hash(Sha256::digest(data).into())
}

/// SHA-256 digest and length of a full stream.
pub fn sha256_reader(mut reader: impl Read) -> Result<(Digest, u64)> {
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    let mut count = 0u64;
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        count += n as u64;
    }
    Ok((from_hash(hasher.finalize().into()), count))
}

/// Raw SHA-256 bytes of a digest. Errors if the digest does not use the
/// SHA-256 algorithm.
pub(crate) fn raw_sha256(digest: &Digest) -> Result<[u8; 32]> {
    if digest.algorithm().to_string() != "sha256" {
        return Err(Error::InvalidDigest(format!(
            "expected sha256, got {digest}"
        )));
    }
    let mut raw = [0u8; 32];
    hex::decode_to_slice(digest.digest(), &mut raw)
        .map_err(|e| Error::InvalidDigest(format!("{digest}: {e}")))?;
    Ok(raw)
}

/// Digest for raw SHA-256 bytes.
pub(crate) fn from_raw_sha256(raw: &[u8; 32]) -> Digest {
    from_hash(*raw)
}
