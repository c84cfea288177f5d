/// Channel signature verification.
///
/// A claim signed by a channel carries `(signature, signature_digest,
/// signing_channel_hash)` in its decoded payload (spec.md §4.4.1). Verifying
/// that signature is the one piece of real cryptography in the indexer;
/// everything else is bookkeeping. Grounded on the teacher's
/// `script_validation.rs::verify_signature`, generalized from "verify a
/// transaction input's spend" to "verify a claim's channel signature" —
/// same secp256k1 verification-only context, same DER/Message parsing.
use secp256k1::ecdsa::Signature;
use secp256k1::{Message, PublicKey, Secp256k1};

/// `verify(pubkey, digest, signature)` named in spec.md §4.4.1. `digest` is
/// already the 32-byte hash the channel signed over (the claim schema
/// decoder, out of scope here, computes it); we only check the ECDSA
/// signature against the channel's public key.
pub fn verify_channel_signature(channel_public_key: &[u8], digest: &[u8; 32], signature: &[u8]) -> bool {
    let secp = Secp256k1::verification_only();
    let Ok(pk) = PublicKey::from_slice(channel_public_key) else {
        return false;
    };
    let Ok(sig) = Signature::from_der(signature) else {
        return false;
    };
    let Ok(msg) = Message::from_slice(digest) else {
        return false;
    };
    secp.verify_ecdsa(&msg, &sig, &pk).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use secp256k1::{Secp256k1 as SigningSecp, SecretKey};

    #[test]
    fn valid_signature_verifies() {
        let secp = SigningSecp::new();
        let sk = SecretKey::from_slice(&[7u8; 32]).unwrap();
        let pk = PublicKey::from_secret_key(&secp, &sk);
        let digest = [3u8; 32];
        let msg = Message::from_slice(&digest).unwrap();
        let sig = secp.sign_ecdsa(&msg, &sk);
        assert!(verify_channel_signature(&pk.serialize(), &digest, &sig.serialize_der()));
    }

    #[test]
    fn wrong_digest_fails() {
        let secp = SigningSecp::new();
        let sk = SecretKey::from_slice(&[7u8; 32]).unwrap();
        let pk = PublicKey::from_secret_key(&secp, &sk);
        let digest = [3u8; 32];
        let msg = Message::from_slice(&digest).unwrap();
        let sig = secp.sign_ecdsa(&msg, &sk);
        assert!(!verify_channel_signature(&pk.serialize(), &[9u8; 32], &sig.serialize_der()));
    }

    #[test]
    fn garbage_inputs_fail_closed() {
        assert!(!verify_channel_signature(&[1, 2, 3], &[0u8; 32], &[4, 5, 6]));
    }
}
