/// Hashing helpers shared by the indexer and codec.
///
/// `hash160` (sha256 then ripemd160) is the function the chain uses to
/// derive a claim's identity from its originating outpoint, mirroring how
/// the teacher derives address hashes from scripts.
use ripemd160::{Digest as RipemdDigest, Ripemd160};
use sha2::{Digest, Sha256};

pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    let out = hasher.finalize();
    let mut buf = [0u8; 32];
    buf.copy_from_slice(&out);
    buf
}

pub fn hash160(data: &[u8]) -> [u8; 20] {
    let sha = sha256(data);
    let mut ripemd = Ripemd160::new();
    ripemd.update(sha);
    let out = ripemd.finalize();
    let mut buf = [0u8; 20];
    buf.copy_from_slice(&out);
    buf
}

/// `claim_hash = hash160(prev_tx_hash || u32be(nout))`, per spec.md §4.4.1.
pub fn claim_hash_from_outpoint(prev_tx_hash: &[u8; 32], nout: u32) -> [u8; 20] {
    let mut buf = Vec::with_capacity(36);
    buf.extend_from_slice(prev_tx_hash);
    buf.extend_from_slice(&nout.to_be_bytes());
    hash160(&buf)
}

/// `hashX`: the 11-byte truncated hash160 of a script, used as an address key.
pub fn hash_x(script: &[u8]) -> [u8; 11] {
    let full = hash160(script);
    let mut out = [0u8; 11];
    out.copy_from_slice(&full[0..11]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claim_hash_is_deterministic() {
        let tx = [1u8; 32];
        assert_eq!(claim_hash_from_outpoint(&tx, 0), claim_hash_from_outpoint(&tx, 0));
        assert_ne!(claim_hash_from_outpoint(&tx, 0), claim_hash_from_outpoint(&tx, 1));
    }
}
