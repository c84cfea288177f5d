/// Output script decoding.
///
/// A transaction output's script is either a plain pay-to-address script or
/// one of the claim-trie script wrappers (claim / support / update) around
/// one. This module is the boundary between raw script bytes and the
/// indexer's view of "what kind of txo is this" — the equivalent of the
/// upstream node's script templates, re-expressed as a small tagged wire
/// format local to this crate (full legacy script-template parity is out of
/// scope per spec.md §1).
use crate::claim_meta::ClaimMeta;
use crate::hashes::hash_x;

const TAG_NONE: u8 = 0;
const TAG_CLAIM: u8 = 1;
const TAG_SUPPORT: u8 = 2;
const TAG_UPDATE: u8 = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOp {
    Claim { name: Vec<u8>, meta_bytes: Vec<u8> },
    Support { claim_hash: [u8; 20], name: Option<Vec<u8>> },
    Update { claim_hash: [u8; 20], name: Vec<u8>, meta_bytes: Vec<u8> },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecodedOutput {
    pub claim_op: Option<ClaimOp>,
    /// hashX of the pay-to-address script trailing the claim-trie wrapper
    /// (or of the whole script, for a plain output).
    pub hash_x: Option<[u8; 11]>,
}

/// Standard pay-to-address script: `OP_DUP OP_HASH160 <20> OP_EQUALVERIFY
/// OP_CHECKSIG`, i.e. `76 a9 14 <hash160> 88 ac`.
fn decode_p2pkh(script: &[u8]) -> Option<[u8; 11]> {
    if script.len() == 25 && script[0] == 0x76 && script[1] == 0xa9 && script[2] == 0x14 && script[23] == 0x88 && script[24] == 0xac {
        Some(hash_x(script))
    } else {
        None
    }
}

pub fn encode_p2pkh(address_hash160: &[u8; 20]) -> Vec<u8> {
    let mut out = Vec::with_capacity(25);
    out.push(0x76);
    out.push(0xa9);
    out.push(0x14);
    out.extend_from_slice(address_hash160);
    out.push(0x88);
    out.push(0xac);
    out
}

pub fn decode_output_script(script: &[u8]) -> DecodedOutput {
    if script.is_empty() {
        return DecodedOutput::default();
    }
    match script[0] {
        TAG_CLAIM => {
            let mut pos = 1;
            let (name, meta_bytes, rest) = match parse_name_and_blob(script, &mut pos) {
                Some(v) => v,
                None => return DecodedOutput::default(),
            };
            DecodedOutput { claim_op: Some(ClaimOp::Claim { name, meta_bytes }), hash_x: decode_p2pkh(rest) }
        }
        TAG_SUPPORT => {
            if script.len() < 22 {
                return DecodedOutput::default();
            }
            let mut claim_hash = [0u8; 20];
            claim_hash.copy_from_slice(&script[1..21]);
            let has_name = script[21] != 0;
            let mut pos = 22;
            let (name, rest) = if has_name {
                match parse_name(script, &mut pos) {
                    Some(v) => v,
                    None => return DecodedOutput::default(),
                }
            } else {
                (None, &script[pos..])
            };
            DecodedOutput { claim_op: Some(ClaimOp::Support { claim_hash, name }), hash_x: decode_p2pkh(rest) }
        }
        TAG_UPDATE => {
            if script.len() < 21 {
                return DecodedOutput::default();
            }
            let mut claim_hash = [0u8; 20];
            claim_hash.copy_from_slice(&script[1..21]);
            let mut pos = 21;
            let (name, meta_bytes, rest) = match parse_name_and_blob(script, &mut pos) {
                Some(v) => v,
                None => return DecodedOutput::default(),
            };
            DecodedOutput { claim_op: Some(ClaimOp::Update { claim_hash, name, meta_bytes }), hash_x: decode_p2pkh(rest) }
        }
        _ => DecodedOutput { claim_op: None, hash_x: decode_p2pkh(script) },
    }
}

fn parse_name<'a>(script: &'a [u8], pos: &mut usize) -> Option<(Option<Vec<u8>>, &'a [u8])> {
    if script.len() < *pos + 2 {
        return None;
    }
    let len = u16::from_be_bytes([script[*pos], script[*pos + 1]]) as usize;
    *pos += 2;
    if script.len() < *pos + len {
        return None;
    }
    let name = script[*pos..*pos + len].to_vec();
    *pos += len;
    Some((Some(name), &script[*pos..]))
}

fn parse_name_and_blob<'a>(script: &'a [u8], pos: &mut usize) -> Option<(Vec<u8>, Vec<u8>, &'a [u8])> {
    if script.len() < *pos + 2 {
        return None;
    }
    let name_len = u16::from_be_bytes([script[*pos], script[*pos + 1]]) as usize;
    *pos += 2;
    if script.len() < *pos + name_len {
        return None;
    }
    let name = script[*pos..*pos + name_len].to_vec();
    *pos += name_len;

    if script.len() < *pos + 4 {
        return None;
    }
    let meta_len = u32::from_be_bytes(script[*pos..*pos + 4].try_into().unwrap()) as usize;
    *pos += 4;
    if script.len() < *pos + meta_len {
        return None;
    }
    let meta = script[*pos..*pos + meta_len].to_vec();
    *pos += meta_len;
    Some((name, meta, &script[*pos..]))
}

pub fn encode_claim_script(name: &[u8], meta: &ClaimMeta, address_hash160: &[u8; 20]) -> Vec<u8> {
    let mut out = vec![TAG_CLAIM];
    out.extend_from_slice(&(name.len() as u16).to_be_bytes());
    out.extend_from_slice(name);
    let meta_bytes = meta.encode();
    out.extend_from_slice(&(meta_bytes.len() as u32).to_be_bytes());
    out.extend_from_slice(&meta_bytes);
    out.extend_from_slice(&encode_p2pkh(address_hash160));
    out
}

pub fn encode_update_script(claim_hash: &[u8; 20], name: &[u8], meta: &ClaimMeta, address_hash160: &[u8; 20]) -> Vec<u8> {
    let mut out = vec![TAG_UPDATE];
    out.extend_from_slice(claim_hash);
    out.extend_from_slice(&(name.len() as u16).to_be_bytes());
    out.extend_from_slice(name);
    let meta_bytes = meta.encode();
    out.extend_from_slice(&(meta_bytes.len() as u32).to_be_bytes());
    out.extend_from_slice(&meta_bytes);
    out.extend_from_slice(&encode_p2pkh(address_hash160));
    out
}

pub fn encode_support_script(claim_hash: &[u8; 20], name: Option<&[u8]>, address_hash160: &[u8; 20]) -> Vec<u8> {
    let mut out = vec![TAG_SUPPORT];
    out.extend_from_slice(claim_hash);
    match name {
        Some(n) => {
            out.push(1);
            out.extend_from_slice(&(n.len() as u16).to_be_bytes());
            out.extend_from_slice(n);
        }
        None => out.push(0),
    }
    out.extend_from_slice(&encode_p2pkh(address_hash160));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claim_script_roundtrip() {
        let meta = ClaimMeta { title: Some(b"cat".to_vec()), ..Default::default() };
        let addr = [3u8; 20];
        let script = encode_claim_script(b"cat", &meta, &addr);
        let decoded = decode_output_script(&script);
        match decoded.claim_op {
            Some(ClaimOp::Claim { name, meta_bytes }) => {
                assert_eq!(name, b"cat");
                assert_eq!(ClaimMeta::decode(&meta_bytes), meta);
            }
            _ => panic!("expected claim op"),
        }
        assert!(decoded.hash_x.is_some());
    }

    #[test]
    fn support_without_name_roundtrip() {
        let claim_hash = [9u8; 20];
        let addr = [1u8; 20];
        let script = encode_support_script(&claim_hash, None, &addr);
        let decoded = decode_output_script(&script);
        match decoded.claim_op {
            Some(ClaimOp::Support { claim_hash: ch, name }) => {
                assert_eq!(ch, claim_hash);
                assert_eq!(name, None);
            }
            _ => panic!("expected support op"),
        }
    }

    #[test]
    fn plain_p2pkh_has_no_claim_op() {
        let addr = [5u8; 20];
        let script = encode_p2pkh(&addr);
        let decoded = decode_output_script(&script);
        assert_eq!(decoded.claim_op, None);
        assert!(decoded.hash_x.is_some());
    }
}
