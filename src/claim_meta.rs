/// Claim payload metadata.
///
/// The upstream claim payload schema (a protobuf message covering stream
/// and channel types) is treated as an external collaborator: this module
/// is the pure-function boundary `bytes -> ClaimMeta` named in spec.md §1.
/// Unknown/unrecognized fields in the payload are dropped — the canonical
/// source of truth for a claim stays the raw transaction output, not this
/// decoded bag of fields (spec.md §9).
///
/// Fields are reified into the fixed set of columns spec.md §9 names rather
/// than kept as a dynamic bag: `title`, `author`, `duration`, `fee_amount`,
/// `fee_currency`, `release_time`, `stream_type`, `media_type`, `is_channel`,
/// `is_repost`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClaimMeta {
    pub title: Option<Vec<u8>>,
    pub author: Option<Vec<u8>>,
    pub duration: Option<u32>,
    pub fee_amount: Option<u64>,
    pub fee_currency: Option<Vec<u8>>,
    pub release_time: Option<u64>,
    pub stream_type: Option<Vec<u8>>,
    pub media_type: Option<Vec<u8>>,
    pub is_channel: bool,
    pub is_repost: bool,
    /// Present only when `is_channel`: the public key bytes used to verify
    /// signatures made by this claim over other claims.
    pub channel_public_key: Option<Vec<u8>>,
    /// Present only when a signature accompanies this claim.
    pub signature: Option<Vec<u8>>,
    pub signature_digest: Option<Vec<u8>>,
    pub signing_channel_hash: Option<[u8; 20]>,
    /// Present only when `is_repost`: the claim being reposted.
    pub reposted_claim_hash: Option<[u8; 20]>,
}

// Field tags for the length-prefixed TLV encoding used on the wire. Unknown
// tags are skipped rather than rejected, matching the "adversarial chain,
// drop unknown fields" rule.
mod tag {
    pub const TITLE: u8 = 1;
    pub const AUTHOR: u8 = 2;
    pub const DURATION: u8 = 3;
    pub const FEE_AMOUNT: u8 = 4;
    pub const FEE_CURRENCY: u8 = 5;
    pub const RELEASE_TIME: u8 = 6;
    pub const STREAM_TYPE: u8 = 7;
    pub const MEDIA_TYPE: u8 = 8;
    pub const IS_CHANNEL: u8 = 9;
    pub const IS_REPOST: u8 = 10;
    pub const CHANNEL_PUBLIC_KEY: u8 = 11;
    pub const SIGNATURE: u8 = 12;
    pub const SIGNATURE_DIGEST: u8 = 13;
    pub const SIGNING_CHANNEL_HASH: u8 = 14;
    pub const REPOSTED_CLAIM_HASH: u8 = 15;
}

fn push_field(out: &mut Vec<u8>, t: u8, bytes: &[u8]) {
    out.push(t);
    out.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    out.extend_from_slice(bytes);
}

impl ClaimMeta {
    /// Encodes this metadata back to the wire TLV format. Exists mainly so
    /// tests and the fake upstream RPC client can construct well-formed
    /// claim payloads without duplicating the tag table.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        if let Some(v) = &self.title {
            push_field(&mut out, tag::TITLE, v);
        }
        if let Some(v) = &self.author {
            push_field(&mut out, tag::AUTHOR, v);
        }
        if let Some(v) = self.duration {
            push_field(&mut out, tag::DURATION, &v.to_be_bytes());
        }
        if let Some(v) = self.fee_amount {
            push_field(&mut out, tag::FEE_AMOUNT, &v.to_be_bytes());
        }
        if let Some(v) = &self.fee_currency {
            push_field(&mut out, tag::FEE_CURRENCY, v);
        }
        if let Some(v) = self.release_time {
            push_field(&mut out, tag::RELEASE_TIME, &v.to_be_bytes());
        }
        if let Some(v) = &self.stream_type {
            push_field(&mut out, tag::STREAM_TYPE, v);
        }
        if let Some(v) = &self.media_type {
            push_field(&mut out, tag::MEDIA_TYPE, v);
        }
        if self.is_channel {
            push_field(&mut out, tag::IS_CHANNEL, &[1]);
        }
        if self.is_repost {
            push_field(&mut out, tag::IS_REPOST, &[1]);
        }
        if let Some(v) = &self.channel_public_key {
            push_field(&mut out, tag::CHANNEL_PUBLIC_KEY, v);
        }
        if let Some(v) = &self.signature {
            push_field(&mut out, tag::SIGNATURE, v);
        }
        if let Some(v) = &self.signature_digest {
            push_field(&mut out, tag::SIGNATURE_DIGEST, v);
        }
        if let Some(v) = &self.signing_channel_hash {
            push_field(&mut out, tag::SIGNING_CHANNEL_HASH, v);
        }
        if let Some(v) = &self.reposted_claim_hash {
            push_field(&mut out, tag::REPOSTED_CLAIM_HASH, v);
        }
        out
    }

    /// Decodes a claim payload. Malformed trailing bytes stop decoding
    /// early rather than erroring — a partially-decoded claim is preferred
    /// over rejecting the whole block, since payload validity is not a
    /// consensus concern here (spec.md §1 Non-goals).
    pub fn decode(bytes: &[u8]) -> ClaimMeta {
        let mut meta = ClaimMeta::default();
        let mut pos = 0usize;
        while pos + 5 <= bytes.len() {
            let t = bytes[pos];
            let len = u32::from_be_bytes(bytes[pos + 1..pos + 5].try_into().unwrap()) as usize;
            pos += 5;
            if pos + len > bytes.len() {
                break;
            }
            let field = &bytes[pos..pos + len];
            pos += len;
            match t {
                tag::TITLE => meta.title = Some(field.to_vec()),
                tag::AUTHOR => meta.author = Some(field.to_vec()),
                tag::DURATION if field.len() == 4 => {
                    meta.duration = Some(u32::from_be_bytes(field.try_into().unwrap()))
                }
                tag::FEE_AMOUNT if field.len() == 8 => {
                    meta.fee_amount = Some(u64::from_be_bytes(field.try_into().unwrap()))
                }
                tag::FEE_CURRENCY => meta.fee_currency = Some(field.to_vec()),
                tag::RELEASE_TIME if field.len() == 8 => {
                    meta.release_time = Some(u64::from_be_bytes(field.try_into().unwrap()))
                }
                tag::STREAM_TYPE => meta.stream_type = Some(field.to_vec()),
                tag::MEDIA_TYPE => meta.media_type = Some(field.to_vec()),
                tag::IS_CHANNEL => meta.is_channel = field.first() == Some(&1),
                tag::IS_REPOST => meta.is_repost = field.first() == Some(&1),
                tag::CHANNEL_PUBLIC_KEY => meta.channel_public_key = Some(field.to_vec()),
                tag::SIGNATURE => meta.signature = Some(field.to_vec()),
                tag::SIGNATURE_DIGEST => meta.signature_digest = Some(field.to_vec()),
                tag::SIGNING_CHANNEL_HASH if field.len() == 20 => {
                    let mut h = [0u8; 20];
                    h.copy_from_slice(field);
                    meta.signing_channel_hash = Some(h);
                }
                tag::REPOSTED_CLAIM_HASH if field.len() == 20 => {
                    let mut h = [0u8; 20];
                    h.copy_from_slice(field);
                    meta.reposted_claim_hash = Some(h);
                }
                // Unknown or malformed-length field: drop it and keep scanning.
                _ => {}
            }
        }
        meta
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_roundtrip() {
        let meta = ClaimMeta {
            title: Some(b"A Cat Video".to_vec()),
            stream_type: Some(b"video".to_vec()),
            is_channel: false,
            signing_channel_hash: Some([7u8; 20]),
            ..Default::default()
        };
        let bytes = meta.encode();
        let back = ClaimMeta::decode(&bytes);
        assert_eq!(back, meta);
    }

    #[test]
    fn unknown_tag_is_dropped_not_fatal() {
        let mut bytes = Vec::new();
        bytes.push(200u8);
        bytes.extend_from_slice(&3u32.to_be_bytes());
        bytes.extend_from_slice(b"abc");
        let meta = ClaimMeta::decode(&bytes);
        assert_eq!(meta, ClaimMeta::default());
    }
}
