/// Binary Codec
///
/// Deterministic, byte-stable packing/unpacking for every typed row in the
/// store, plus partial-key packers for every prefix length a caller iterates
/// by. All integer fields are fixed-width big-endian so lexicographic byte
/// order matches numeric order; this is what lets range scans double as
/// sorted queries.
use crate::error::CorruptRow;

/// One-byte discriminator tagging each row's type and column family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Prefix {
    BlockHeader = b'B',
    BlockHash = b'b',
    Tx = b'T',
    TxNum = b'n',
    TxHash = b'N',
    TxCount = b'c',
    Utxo = b'u',
    HashXUtxo = b'h',
    AddressHistory = b'H',
    ClaimToTxo = b'C',
    TxoToClaim = b'X',
    ClaimShortId = b'S',
    ChannelToClaim = b'K',
    ClaimToChannel = b'k',
    ClaimToSupport = b'Y',
    SupportToClaim = b'y',
    ClaimExpiration = b'E',
    ClaimTakeover = b'P',
    PendingActivation = b'A',
    Activated = b'a',
    ActiveAmount = b'm',
    EffectiveAmount = b'e',
    Repost = b'R',
    Reposted = b'r',
    TrendingSpike = b'g',
    TouchedOrDeleted = b'D',
    Undo = b'U',
    DbState = b's',
    /// Supplemental row (SPEC_FULL.md §3): the reified `ClaimMeta` fields
    /// persisted alongside the claim so a later block can still look up a
    /// channel's public key or a claim's signing channel hash without
    /// re-reading the original transaction.
    ClaimInfo = b'i',
}

impl Prefix {
    pub const ALL: &'static [Prefix] = &[
        Prefix::BlockHeader,
        Prefix::BlockHash,
        Prefix::Tx,
        Prefix::TxNum,
        Prefix::TxHash,
        Prefix::TxCount,
        Prefix::Utxo,
        Prefix::HashXUtxo,
        Prefix::AddressHistory,
        Prefix::ClaimToTxo,
        Prefix::TxoToClaim,
        Prefix::ClaimShortId,
        Prefix::ChannelToClaim,
        Prefix::ClaimToChannel,
        Prefix::ClaimToSupport,
        Prefix::SupportToClaim,
        Prefix::ClaimExpiration,
        Prefix::ClaimTakeover,
        Prefix::PendingActivation,
        Prefix::Activated,
        Prefix::ActiveAmount,
        Prefix::EffectiveAmount,
        Prefix::Repost,
        Prefix::Reposted,
        Prefix::TrendingSpike,
        Prefix::TouchedOrDeleted,
        Prefix::Undo,
        Prefix::DbState,
        Prefix::ClaimInfo,
    ];

    /// The column family name this prefix is stored under.
    pub fn cf_name(self) -> &'static str {
        match self {
            Prefix::BlockHeader => "block_header",
            Prefix::BlockHash => "block_hash",
            Prefix::Tx => "tx",
            Prefix::TxNum => "tx_num",
            Prefix::TxHash => "tx_hash",
            Prefix::TxCount => "tx_count",
            Prefix::Utxo => "utxo",
            Prefix::HashXUtxo => "hashx_utxo",
            Prefix::AddressHistory => "address_history",
            Prefix::ClaimToTxo => "claim_to_txo",
            Prefix::TxoToClaim => "txo_to_claim",
            Prefix::ClaimShortId => "claim_short_id",
            Prefix::ChannelToClaim => "channel_to_claim",
            Prefix::ClaimToChannel => "claim_to_channel",
            Prefix::ClaimToSupport => "claim_to_support",
            Prefix::SupportToClaim => "support_to_claim",
            Prefix::ClaimExpiration => "claim_expiration",
            Prefix::ClaimTakeover => "claim_takeover",
            Prefix::PendingActivation => "pending_activation",
            Prefix::Activated => "activated",
            Prefix::ActiveAmount => "active_amount",
            Prefix::EffectiveAmount => "effective_amount",
            Prefix::Repost => "repost",
            Prefix::Reposted => "reposted",
            Prefix::TrendingSpike => "trending_spike",
            Prefix::TouchedOrDeleted => "touched_or_deleted",
            Prefix::Undo => "undo",
            Prefix::DbState => "db_state",
            Prefix::ClaimInfo => "claim_info",
        }
    }

    pub fn from_byte(b: u8) -> Option<Prefix> {
        Prefix::ALL.iter().copied().find(|p| *p as u8 == b)
    }
}

/// `ones_complement(x)` inverts every bit of a u64 amount so that ascending
/// byte-order iteration over the encoded key yields descending amount order.
#[inline]
pub fn ones_complement(x: u64) -> u64 {
    0xffff_ffff_ffff_ffffu64 - x
}

/// The kind of pending/active txo an activation row refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TxoType {
    Claim = 1,
    Support = 2,
}

impl TxoType {
    pub fn from_byte(b: u8) -> Result<TxoType, CorruptRow> {
        match b {
            1 => Ok(TxoType::Claim),
            2 => Ok(TxoType::Support),
            other => Err(CorruptRow::new(format!("unknown txo_type byte {other}"))),
        }
    }
}

/// Length-prefixed name encoding: `u16 len || utf-8 bytes`. Invalid UTF-8 is
/// retained as raw bytes since names originate on an adversarial chain.
pub fn pack_name(name: &[u8], out: &mut Vec<u8>) {
    let len = name.len().min(u16::MAX as usize) as u16;
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(&name[..len as usize]);
}

pub fn unpack_name(buf: &[u8], pos: &mut usize) -> Result<Vec<u8>, CorruptRow> {
    if buf.len() < *pos + 2 {
        return Err(CorruptRow::new("truncated name length"));
    }
    let len = u16::from_be_bytes([buf[*pos], buf[*pos + 1]]) as usize;
    *pos += 2;
    if buf.len() < *pos + len {
        return Err(CorruptRow::new("truncated name body"));
    }
    let name = buf[*pos..*pos + len].to_vec();
    *pos += len;
    Ok(name)
}

/// "Partial claim id" framing: `u8 len || ascii-hex bytes`, so a shorter
/// prefix sorts before a longer one sharing the same head.
pub fn pack_partial_claim_id(hex_prefix: &[u8], out: &mut Vec<u8>) {
    let len = hex_prefix.len().min(u8::MAX as usize) as u8;
    out.push(len);
    out.extend_from_slice(&hex_prefix[..len as usize]);
}

pub fn unpack_partial_claim_id(buf: &[u8], pos: &mut usize) -> Result<Vec<u8>, CorruptRow> {
    if buf.len() <= *pos {
        return Err(CorruptRow::new("truncated partial claim id length"));
    }
    let len = buf[*pos] as usize;
    *pos += 1;
    if buf.len() < *pos + len {
        return Err(CorruptRow::new("truncated partial claim id body"));
    }
    let v = buf[*pos..*pos + len].to_vec();
    *pos += len;
    Ok(v)
}

fn need(buf: &[u8], pos: usize, n: usize, what: &str) -> Result<(), CorruptRow> {
    if buf.len() < pos + n {
        Err(CorruptRow::new(format!("truncated {what}: need {n} bytes at {pos}, have {}", buf.len())))
    } else {
        Ok(())
    }
}

// ---------------------------------------------------------------------
// Block header / block hash
// ---------------------------------------------------------------------

pub fn pack_height(height: u32) -> Vec<u8> {
    height.to_be_bytes().to_vec()
}

pub fn unpack_height(buf: &[u8]) -> Result<u32, CorruptRow> {
    if buf.len() != 4 {
        return Err(CorruptRow::new("height key must be 4 bytes"));
    }
    Ok(u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]))
}

/// The raw 112-byte header is stored verbatim as the value.
pub fn pack_block_header(header: &[u8; 112]) -> Vec<u8> {
    header.to_vec()
}

pub fn unpack_block_header(buf: &[u8]) -> Result<[u8; 112], CorruptRow> {
    if buf.len() != 112 {
        return Err(CorruptRow::new(format!("block header must be 112 bytes, got {}", buf.len())));
    }
    let mut out = [0u8; 112];
    out.copy_from_slice(buf);
    Ok(out)
}

pub fn pack_block_hash(hash: &[u8; 32]) -> Vec<u8> {
    hash.to_vec()
}

pub fn unpack_block_hash(buf: &[u8]) -> Result<[u8; 32], CorruptRow> {
    if buf.len() != 32 {
        return Err(CorruptRow::new(format!("block hash must be 32 bytes, got {}", buf.len())));
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(buf);
    Ok(out)
}

// ---------------------------------------------------------------------
// Tx <-> tx_num
// ---------------------------------------------------------------------

pub fn pack_tx_num_key(tx_hash: &[u8; 32]) -> Vec<u8> {
    tx_hash.to_vec()
}

pub fn pack_tx_num_value(tx_num: u32) -> Vec<u8> {
    tx_num.to_be_bytes().to_vec()
}

pub fn unpack_tx_num_value(buf: &[u8]) -> Result<u32, CorruptRow> {
    if buf.len() != 4 {
        return Err(CorruptRow::new("tx_num value must be 4 bytes"));
    }
    Ok(u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]))
}

pub fn pack_tx_hash_key(tx_num: u32) -> Vec<u8> {
    tx_num.to_be_bytes().to_vec()
}

pub fn pack_tx_hash_value(tx_hash: &[u8; 32]) -> Vec<u8> {
    tx_hash.to_vec()
}

pub fn unpack_tx_hash_value(buf: &[u8]) -> Result<[u8; 32], CorruptRow> {
    unpack_block_hash(buf)
}

pub fn pack_tx_count_value(cumulative_tx_num: u32) -> Vec<u8> {
    cumulative_tx_num.to_be_bytes().to_vec()
}

pub fn unpack_tx_count_value(buf: &[u8]) -> Result<u32, CorruptRow> {
    unpack_tx_num_value(buf)
}

// ---------------------------------------------------------------------
// UTXO / hashX-by-short-txid / address history
// ---------------------------------------------------------------------

/// `(hashX[11], tx_num, nout)`
pub fn pack_utxo_key(hash_x: &[u8; 11], tx_num: u32, nout: u16) -> Vec<u8> {
    let mut out = Vec::with_capacity(11 + 4 + 2);
    out.extend_from_slice(hash_x);
    out.extend_from_slice(&tx_num.to_be_bytes());
    out.extend_from_slice(&nout.to_be_bytes());
    out
}

pub fn unpack_utxo_key(buf: &[u8]) -> Result<([u8; 11], u32, u16), CorruptRow> {
    if buf.len() != 17 {
        return Err(CorruptRow::new("utxo key must be 17 bytes"));
    }
    let mut hash_x = [0u8; 11];
    hash_x.copy_from_slice(&buf[0..11]);
    let tx_num = u32::from_be_bytes([buf[11], buf[12], buf[13], buf[14]]);
    let nout = u16::from_be_bytes([buf[15], buf[16]]);
    Ok((hash_x, tx_num, nout))
}

pub fn pack_utxo_value(amount: u64) -> Vec<u8> {
    amount.to_be_bytes().to_vec()
}

pub fn unpack_utxo_value(buf: &[u8]) -> Result<u64, CorruptRow> {
    if buf.len() != 8 {
        return Err(CorruptRow::new("utxo value must be 8 bytes"));
    }
    Ok(u64::from_be_bytes(buf.try_into().unwrap()))
}

/// `(tx_hash[:4], tx_num, nout)`
pub fn pack_hashx_utxo_key(short_txid: &[u8; 4], tx_num: u32, nout: u16) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + 4 + 2);
    out.extend_from_slice(short_txid);
    out.extend_from_slice(&tx_num.to_be_bytes());
    out.extend_from_slice(&nout.to_be_bytes());
    out
}

pub fn pack_hashx_utxo_value(hash_x: &[u8; 11]) -> Vec<u8> {
    hash_x.to_vec()
}

pub fn unpack_hashx_utxo_value(buf: &[u8]) -> Result<[u8; 11], CorruptRow> {
    if buf.len() != 11 {
        return Err(CorruptRow::new("hashX value must be 11 bytes"));
    }
    let mut out = [0u8; 11];
    out.copy_from_slice(buf);
    Ok(out)
}

/// `(hashX, height)`
pub fn pack_address_history_key(hash_x: &[u8; 11], height: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(11 + 4);
    out.extend_from_slice(hash_x);
    out.extend_from_slice(&height.to_be_bytes());
    out
}

pub fn pack_address_history_partial_key(hash_x: &[u8; 11]) -> Vec<u8> {
    hash_x.to_vec()
}

/// Value is a packed array of tx_nums, each big-endian u32.
pub fn pack_address_history_value(tx_nums: &[u32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(tx_nums.len() * 4);
    for n in tx_nums {
        out.extend_from_slice(&n.to_be_bytes());
    }
    out
}

pub fn unpack_address_history_value(buf: &[u8]) -> Result<Vec<u32>, CorruptRow> {
    if buf.len() % 4 != 0 {
        return Err(CorruptRow::new("address history value not a multiple of 4 bytes"));
    }
    Ok(buf.chunks_exact(4).map(|c| u32::from_be_bytes(c.try_into().unwrap())).collect())
}

// ---------------------------------------------------------------------
// Claim <-> TXO
// ---------------------------------------------------------------------

pub fn pack_claim_to_txo_key(claim_hash: &[u8; 20]) -> Vec<u8> {
    claim_hash.to_vec()
}

pub fn unpack_claim_to_txo_key(buf: &[u8]) -> Result<[u8; 20], CorruptRow> {
    if buf.len() != 20 {
        return Err(CorruptRow::new("claim_hash key must be 20 bytes"));
    }
    let mut out = [0u8; 20];
    out.copy_from_slice(buf);
    Ok(out)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimToTxoValue {
    pub tx_num: u32,
    pub nout: u16,
    pub root_tx_num: u32,
    pub root_pos: u16,
    pub amount: u64,
    pub sig_valid: bool,
    pub name: Vec<u8>,
}

pub fn pack_claim_to_txo_value(v: &ClaimToTxoValue) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + 2 + 4 + 2 + 8 + 1 + 2 + v.name.len());
    out.extend_from_slice(&v.tx_num.to_be_bytes());
    out.extend_from_slice(&v.nout.to_be_bytes());
    out.extend_from_slice(&v.root_tx_num.to_be_bytes());
    out.extend_from_slice(&v.root_pos.to_be_bytes());
    out.extend_from_slice(&v.amount.to_be_bytes());
    out.push(v.sig_valid as u8);
    pack_name(&v.name, &mut out);
    out
}

pub fn unpack_claim_to_txo_value(buf: &[u8]) -> Result<ClaimToTxoValue, CorruptRow> {
    need(buf, 0, 4 + 2 + 4 + 2 + 8 + 1, "claim_to_txo value")?;
    let tx_num = u32::from_be_bytes(buf[0..4].try_into().unwrap());
    let nout = u16::from_be_bytes(buf[4..6].try_into().unwrap());
    let root_tx_num = u32::from_be_bytes(buf[6..10].try_into().unwrap());
    let root_pos = u16::from_be_bytes(buf[10..12].try_into().unwrap());
    let amount = u64::from_be_bytes(buf[12..20].try_into().unwrap());
    let sig_valid = buf[20] != 0;
    let mut pos = 21;
    let name = unpack_name(buf, &mut pos)?;
    Ok(ClaimToTxoValue { tx_num, nout, root_tx_num, root_pos, amount, sig_valid, name })
}

/// `(tx_num, nout)`
pub fn pack_txo_key(tx_num: u32, nout: u16) -> Vec<u8> {
    let mut out = Vec::with_capacity(6);
    out.extend_from_slice(&tx_num.to_be_bytes());
    out.extend_from_slice(&nout.to_be_bytes());
    out
}

pub fn unpack_txo_key(buf: &[u8]) -> Result<(u32, u16), CorruptRow> {
    if buf.len() != 6 {
        return Err(CorruptRow::new("txo key must be 6 bytes"));
    }
    Ok((u32::from_be_bytes(buf[0..4].try_into().unwrap()), u16::from_be_bytes(buf[4..6].try_into().unwrap())))
}

pub struct TxoToClaimValue {
    pub claim_hash: [u8; 20],
    pub name: Vec<u8>,
}

pub fn pack_txo_to_claim_value(v: &TxoToClaimValue) -> Vec<u8> {
    let mut out = Vec::with_capacity(20 + 2 + v.name.len());
    out.extend_from_slice(&v.claim_hash);
    pack_name(&v.name, &mut out);
    out
}

pub fn unpack_txo_to_claim_value(buf: &[u8]) -> Result<TxoToClaimValue, CorruptRow> {
    need(buf, 0, 20, "txo_to_claim value")?;
    let mut claim_hash = [0u8; 20];
    claim_hash.copy_from_slice(&buf[0..20]);
    let mut pos = 20;
    let name = unpack_name(buf, &mut pos)?;
    Ok(TxoToClaimValue { claim_hash, name })
}

// ---------------------------------------------------------------------
// Claim short id
// ---------------------------------------------------------------------

/// `(normalized_name, partial_claim_id, root_tx_num, root_pos)`. Supports
/// partial-key iteration by name alone or by name + claim-id prefix.
pub fn pack_claim_short_id_key(name: &[u8], partial_id_hex: &[u8], root_tx_num: u32, root_pos: u16) -> Vec<u8> {
    let mut out = Vec::new();
    pack_name(name, &mut out);
    pack_partial_claim_id(partial_id_hex, &mut out);
    out.extend_from_slice(&root_tx_num.to_be_bytes());
    out.extend_from_slice(&root_pos.to_be_bytes());
    out
}

pub fn pack_claim_short_id_partial_key_name(name: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    pack_name(name, &mut out);
    out
}

pub fn pack_claim_short_id_partial_key_name_id(name: &[u8], partial_id_hex: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    pack_name(name, &mut out);
    pack_partial_claim_id(partial_id_hex, &mut out);
    out
}

pub fn unpack_claim_short_id_key(buf: &[u8]) -> Result<(Vec<u8>, Vec<u8>, u32, u16), CorruptRow> {
    let mut pos = 0;
    let name = unpack_name(buf, &mut pos)?;
    let partial_id = unpack_partial_claim_id(buf, &mut pos)?;
    need(buf, pos, 6, "claim short id key tail")?;
    let root_tx_num = u32::from_be_bytes(buf[pos..pos + 4].try_into().unwrap());
    let root_pos = u16::from_be_bytes(buf[pos + 4..pos + 6].try_into().unwrap());
    Ok((name, partial_id, root_tx_num, root_pos))
}

pub fn pack_claim_short_id_value(tx_num: u32, nout: u16) -> Vec<u8> {
    pack_txo_key(tx_num, nout)
}

pub fn unpack_claim_short_id_value(buf: &[u8]) -> Result<(u32, u16), CorruptRow> {
    unpack_txo_key(buf)
}

// ---------------------------------------------------------------------
// Channel <-> Claim
// ---------------------------------------------------------------------

/// `(signing_channel_hash, name, tx_num, nout)`
pub fn pack_channel_to_claim_key(channel_hash: &[u8; 20], name: &[u8], tx_num: u32, nout: u16) -> Vec<u8> {
    let mut out = Vec::with_capacity(20 + 2 + name.len() + 6);
    out.extend_from_slice(channel_hash);
    pack_name(name, &mut out);
    out.extend_from_slice(&tx_num.to_be_bytes());
    out.extend_from_slice(&nout.to_be_bytes());
    out
}

pub fn pack_channel_to_claim_partial_key_channel(channel_hash: &[u8; 20]) -> Vec<u8> {
    channel_hash.to_vec()
}

pub fn pack_channel_to_claim_partial_key_channel_name(channel_hash: &[u8; 20], name: &[u8]) -> Vec<u8> {
    let mut out = channel_hash.to_vec();
    pack_name(name, &mut out);
    out
}

pub fn unpack_channel_to_claim_key(buf: &[u8]) -> Result<([u8; 20], Vec<u8>, u32, u16), CorruptRow> {
    need(buf, 0, 20, "channel_to_claim key")?;
    let mut channel_hash = [0u8; 20];
    channel_hash.copy_from_slice(&buf[0..20]);
    let mut pos = 20;
    let name = unpack_name(buf, &mut pos)?;
    need(buf, pos, 6, "channel_to_claim key tail")?;
    let tx_num = u32::from_be_bytes(buf[pos..pos + 4].try_into().unwrap());
    let nout = u16::from_be_bytes(buf[pos + 4..pos + 6].try_into().unwrap());
    Ok((channel_hash, name, tx_num, nout))
}

pub fn pack_channel_to_claim_value(claim_hash: &[u8; 20]) -> Vec<u8> {
    claim_hash.to_vec()
}

pub fn unpack_channel_to_claim_value(buf: &[u8]) -> Result<[u8; 20], CorruptRow> {
    unpack_claim_to_txo_key(buf)
}

/// `(claim_hash, tx_num, nout)`
pub fn pack_claim_to_channel_key(claim_hash: &[u8; 20], tx_num: u32, nout: u16) -> Vec<u8> {
    let mut out = claim_hash.to_vec();
    out.extend_from_slice(&tx_num.to_be_bytes());
    out.extend_from_slice(&nout.to_be_bytes());
    out
}

pub fn pack_claim_to_channel_partial_key(claim_hash: &[u8; 20]) -> Vec<u8> {
    claim_hash.to_vec()
}

pub fn unpack_claim_to_channel_key(buf: &[u8]) -> Result<([u8; 20], u32, u16), CorruptRow> {
    need(buf, 0, 26, "claim_to_channel key")?;
    let mut claim_hash = [0u8; 20];
    claim_hash.copy_from_slice(&buf[0..20]);
    let tx_num = u32::from_be_bytes(buf[20..24].try_into().unwrap());
    let nout = u16::from_be_bytes(buf[24..26].try_into().unwrap());
    Ok((claim_hash, tx_num, nout))
}

pub fn pack_claim_to_channel_value(channel_hash: &[u8; 20]) -> Vec<u8> {
    channel_hash.to_vec()
}

pub fn unpack_claim_to_channel_value(buf: &[u8]) -> Result<[u8; 20], CorruptRow> {
    unpack_claim_to_txo_key(buf)
}

// ---------------------------------------------------------------------
// Claim <-> Support
// ---------------------------------------------------------------------

pub fn pack_claim_to_support_key(claim_hash: &[u8; 20], tx_num: u32, nout: u16) -> Vec<u8> {
    pack_claim_to_channel_key(claim_hash, tx_num, nout)
}

pub fn pack_claim_to_support_partial_key(claim_hash: &[u8; 20]) -> Vec<u8> {
    claim_hash.to_vec()
}

pub fn unpack_claim_to_support_key(buf: &[u8]) -> Result<([u8; 20], u32, u16), CorruptRow> {
    unpack_claim_to_channel_key(buf)
}

pub fn pack_claim_to_support_value(amount: u64) -> Vec<u8> {
    amount.to_be_bytes().to_vec()
}

pub fn unpack_claim_to_support_value(buf: &[u8]) -> Result<u64, CorruptRow> {
    unpack_utxo_value(buf)
}

pub fn pack_support_to_claim_key(tx_num: u32, nout: u16) -> Vec<u8> {
    pack_txo_key(tx_num, nout)
}

pub fn unpack_support_to_claim_key(buf: &[u8]) -> Result<(u32, u16), CorruptRow> {
    unpack_txo_key(buf)
}

pub fn pack_support_to_claim_value(claim_hash: &[u8; 20]) -> Vec<u8> {
    claim_hash.to_vec()
}

pub fn unpack_support_to_claim_value(buf: &[u8]) -> Result<[u8; 20], CorruptRow> {
    unpack_claim_to_txo_key(buf)
}

// ---------------------------------------------------------------------
// Expiration / takeover / activation
// ---------------------------------------------------------------------

pub fn pack_claim_expiration_key(expiration_height: u32, tx_num: u32, nout: u16) -> Vec<u8> {
    let mut out = Vec::with_capacity(10);
    out.extend_from_slice(&expiration_height.to_be_bytes());
    out.extend_from_slice(&tx_num.to_be_bytes());
    out.extend_from_slice(&nout.to_be_bytes());
    out
}

pub fn pack_claim_expiration_partial_key(expiration_height: u32) -> Vec<u8> {
    expiration_height.to_be_bytes().to_vec()
}

pub fn unpack_claim_expiration_key(buf: &[u8]) -> Result<(u32, u32, u16), CorruptRow> {
    if buf.len() != 10 {
        return Err(CorruptRow::new("claim expiration key must be 10 bytes"));
    }
    let h = u32::from_be_bytes(buf[0..4].try_into().unwrap());
    let tx_num = u32::from_be_bytes(buf[4..8].try_into().unwrap());
    let nout = u16::from_be_bytes(buf[8..10].try_into().unwrap());
    Ok((h, tx_num, nout))
}

pub struct ExpirationValue {
    pub claim_hash: [u8; 20],
    pub name: Vec<u8>,
}

pub fn pack_claim_expiration_value(v: &ExpirationValue) -> Vec<u8> {
    let mut out = v.claim_hash.to_vec();
    pack_name(&v.name, &mut out);
    out
}

pub fn unpack_claim_expiration_value(buf: &[u8]) -> Result<ExpirationValue, CorruptRow> {
    need(buf, 0, 20, "claim expiration value")?;
    let mut claim_hash = [0u8; 20];
    claim_hash.copy_from_slice(&buf[0..20]);
    let mut pos = 20;
    let name = unpack_name(buf, &mut pos)?;
    Ok(ExpirationValue { claim_hash, name })
}

pub fn pack_claim_takeover_key(name: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    pack_name(name, &mut out);
    out
}

pub fn unpack_claim_takeover_key(buf: &[u8]) -> Result<Vec<u8>, CorruptRow> {
    let mut pos = 0;
    unpack_name(buf, &mut pos)
}

pub struct TakeoverValue {
    pub claim_hash: [u8; 20],
    pub takeover_height: u32,
}

pub fn pack_claim_takeover_value(v: &TakeoverValue) -> Vec<u8> {
    let mut out = v.claim_hash.to_vec();
    out.extend_from_slice(&v.takeover_height.to_be_bytes());
    out
}

pub fn unpack_claim_takeover_value(buf: &[u8]) -> Result<TakeoverValue, CorruptRow> {
    if buf.len() != 24 {
        return Err(CorruptRow::new("claim takeover value must be 24 bytes"));
    }
    let mut claim_hash = [0u8; 20];
    claim_hash.copy_from_slice(&buf[0..20]);
    let takeover_height = u32::from_be_bytes(buf[20..24].try_into().unwrap());
    Ok(TakeoverValue { claim_hash, takeover_height })
}

/// `(activation_height, txo_type, tx_num, nout)`
pub fn pack_pending_activation_key(activation_height: u32, txo_type: TxoType, tx_num: u32, nout: u16) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + 1 + 4 + 2);
    out.extend_from_slice(&activation_height.to_be_bytes());
    out.push(txo_type as u8);
    out.extend_from_slice(&tx_num.to_be_bytes());
    out.extend_from_slice(&nout.to_be_bytes());
    out
}

pub fn pack_pending_activation_partial_key_height(activation_height: u32) -> Vec<u8> {
    activation_height.to_be_bytes().to_vec()
}

pub fn unpack_pending_activation_key(buf: &[u8]) -> Result<(u32, TxoType, u32, u16), CorruptRow> {
    if buf.len() != 11 {
        return Err(CorruptRow::new("pending activation key must be 11 bytes"));
    }
    let h = u32::from_be_bytes(buf[0..4].try_into().unwrap());
    let txo_type = TxoType::from_byte(buf[4])?;
    let tx_num = u32::from_be_bytes(buf[5..9].try_into().unwrap());
    let nout = u16::from_be_bytes(buf[9..11].try_into().unwrap());
    Ok((h, txo_type, tx_num, nout))
}

pub struct ActivationValue {
    pub claim_hash: [u8; 20],
    pub name: Vec<u8>,
}

pub fn pack_pending_activation_value(v: &ActivationValue) -> Vec<u8> {
    pack_claim_expiration_value(&ExpirationValue { claim_hash: v.claim_hash, name: v.name.clone() })
}

pub fn unpack_pending_activation_value(buf: &[u8]) -> Result<ActivationValue, CorruptRow> {
    let ev = unpack_claim_expiration_value(buf)?;
    Ok(ActivationValue { claim_hash: ev.claim_hash, name: ev.name })
}

/// `(txo_type, tx_num, nout)` -> `(activation_height, claim_hash, name)`
pub fn pack_activated_key(txo_type: TxoType, tx_num: u32, nout: u16) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + 4 + 2);
    out.push(txo_type as u8);
    out.extend_from_slice(&tx_num.to_be_bytes());
    out.extend_from_slice(&nout.to_be_bytes());
    out
}

pub fn unpack_activated_key(buf: &[u8]) -> Result<(TxoType, u32, u16), CorruptRow> {
    if buf.len() != 7 {
        return Err(CorruptRow::new("activated key must be 7 bytes"));
    }
    let txo_type = TxoType::from_byte(buf[0])?;
    let tx_num = u32::from_be_bytes(buf[1..5].try_into().unwrap());
    let nout = u16::from_be_bytes(buf[5..7].try_into().unwrap());
    Ok((txo_type, tx_num, nout))
}

pub struct ActivatedValue {
    pub activation_height: u32,
    pub claim_hash: [u8; 20],
    pub name: Vec<u8>,
}

pub fn pack_activated_value(v: &ActivatedValue) -> Vec<u8> {
    let mut out = v.activation_height.to_be_bytes().to_vec();
    out.extend_from_slice(&v.claim_hash);
    pack_name(&v.name, &mut out);
    out
}

pub fn unpack_activated_value(buf: &[u8]) -> Result<ActivatedValue, CorruptRow> {
    need(buf, 0, 24, "activated value")?;
    let activation_height = u32::from_be_bytes(buf[0..4].try_into().unwrap());
    let mut claim_hash = [0u8; 20];
    claim_hash.copy_from_slice(&buf[4..24]);
    let mut pos = 24;
    let name = unpack_name(buf, &mut pos)?;
    Ok(ActivatedValue { activation_height, claim_hash, name })
}

/// `(claim_hash, txo_type, activation_height, tx_num, nout)`
pub fn pack_active_amount_key(claim_hash: &[u8; 20], txo_type: TxoType, activation_height: u32, tx_num: u32, nout: u16) -> Vec<u8> {
    let mut out = Vec::with_capacity(20 + 1 + 4 + 4 + 2);
    out.extend_from_slice(claim_hash);
    out.push(txo_type as u8);
    out.extend_from_slice(&activation_height.to_be_bytes());
    out.extend_from_slice(&tx_num.to_be_bytes());
    out.extend_from_slice(&nout.to_be_bytes());
    out
}

pub fn pack_active_amount_partial_key_claim(claim_hash: &[u8; 20]) -> Vec<u8> {
    claim_hash.to_vec()
}

pub fn pack_active_amount_partial_key_claim_type(claim_hash: &[u8; 20], txo_type: TxoType) -> Vec<u8> {
    let mut out = claim_hash.to_vec();
    out.push(txo_type as u8);
    out
}

pub fn unpack_active_amount_key(buf: &[u8]) -> Result<([u8; 20], TxoType, u32, u32, u16), CorruptRow> {
    if buf.len() != 31 {
        return Err(CorruptRow::new("active amount key must be 31 bytes"));
    }
    let mut claim_hash = [0u8; 20];
    claim_hash.copy_from_slice(&buf[0..20]);
    let txo_type = TxoType::from_byte(buf[20])?;
    let activation_height = u32::from_be_bytes(buf[21..25].try_into().unwrap());
    let tx_num = u32::from_be_bytes(buf[25..29].try_into().unwrap());
    let nout = u16::from_be_bytes(buf[29..31].try_into().unwrap());
    Ok((claim_hash, txo_type, activation_height, tx_num, nout))
}

pub fn pack_active_amount_value(amount: u64) -> Vec<u8> {
    amount.to_be_bytes().to_vec()
}

pub fn unpack_active_amount_value(buf: &[u8]) -> Result<u64, CorruptRow> {
    unpack_utxo_value(buf)
}

// ---------------------------------------------------------------------
// Effective amount leaderboard
// ---------------------------------------------------------------------

/// `(name, ones_complement(effective_amount), tx_num, nout)`. Ones-complement
/// encoding makes ascending byte order equal descending amount order.
pub fn pack_effective_amount_key(name: &[u8], effective_amount: u64, tx_num: u32, nout: u16) -> Vec<u8> {
    let mut out = Vec::new();
    pack_name(name, &mut out);
    out.extend_from_slice(&ones_complement(effective_amount).to_be_bytes());
    out.extend_from_slice(&tx_num.to_be_bytes());
    out.extend_from_slice(&nout.to_be_bytes());
    out
}

pub fn pack_effective_amount_partial_key_name(name: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    pack_name(name, &mut out);
    out
}

pub fn unpack_effective_amount_key(buf: &[u8]) -> Result<(Vec<u8>, u64, u32, u16), CorruptRow> {
    let mut pos = 0;
    let name = unpack_name(buf, &mut pos)?;
    need(buf, pos, 14, "effective amount key tail")?;
    let complemented = u64::from_be_bytes(buf[pos..pos + 8].try_into().unwrap());
    let tx_num = u32::from_be_bytes(buf[pos + 8..pos + 12].try_into().unwrap());
    let nout = u16::from_be_bytes(buf[pos + 12..pos + 14].try_into().unwrap());
    Ok((name, ones_complement(complemented), tx_num, nout))
}

pub fn pack_effective_amount_value(claim_hash: &[u8; 20]) -> Vec<u8> {
    claim_hash.to_vec()
}

pub fn unpack_effective_amount_value(buf: &[u8]) -> Result<[u8; 20], CorruptRow> {
    unpack_claim_to_txo_key(buf)
}

// ---------------------------------------------------------------------
// Repost / reposted
// ---------------------------------------------------------------------

pub fn pack_repost_key(claim_hash: &[u8; 20]) -> Vec<u8> {
    claim_hash.to_vec()
}

pub fn pack_repost_value(reposted_claim_hash: &[u8; 20]) -> Vec<u8> {
    reposted_claim_hash.to_vec()
}

pub fn unpack_repost_value(buf: &[u8]) -> Result<[u8; 20], CorruptRow> {
    unpack_claim_to_txo_key(buf)
}

pub fn pack_reposted_key(reposted_claim_hash: &[u8; 20], tx_num: u32, nout: u16) -> Vec<u8> {
    pack_claim_to_channel_key(reposted_claim_hash, tx_num, nout)
}

pub fn pack_reposted_partial_key(reposted_claim_hash: &[u8; 20]) -> Vec<u8> {
    reposted_claim_hash.to_vec()
}

pub fn unpack_reposted_key(buf: &[u8]) -> Result<([u8; 20], u32, u16), CorruptRow> {
    unpack_claim_to_channel_key(buf)
}

pub fn pack_reposted_value(claim_hash: &[u8; 20]) -> Vec<u8> {
    claim_hash.to_vec()
}

pub fn unpack_reposted_value(buf: &[u8]) -> Result<[u8; 20], CorruptRow> {
    unpack_claim_to_txo_key(buf)
}

// ---------------------------------------------------------------------
// Trending spike (schema-complete row, no scoring algorithm — see SPEC_FULL §3)
// ---------------------------------------------------------------------

pub fn pack_trending_spike_key(height: u32, claim_hash: &[u8; 20]) -> Vec<u8> {
    let mut out = height.to_be_bytes().to_vec();
    out.extend_from_slice(claim_hash);
    out
}

pub fn pack_trending_spike_value(spike_amount: i64) -> Vec<u8> {
    spike_amount.to_be_bytes().to_vec()
}

pub fn unpack_trending_spike_value(buf: &[u8]) -> Result<i64, CorruptRow> {
    if buf.len() != 8 {
        return Err(CorruptRow::new("trending spike value must be 8 bytes"));
    }
    Ok(i64::from_be_bytes(buf.try_into().unwrap()))
}

// ---------------------------------------------------------------------
// Touched-or-deleted
// ---------------------------------------------------------------------

pub struct TouchedOrDeletedValue {
    pub touched: Vec<[u8; 20]>,
    pub deleted: Vec<[u8; 20]>,
}

pub fn pack_touched_or_deleted_value(v: &TouchedOrDeletedValue) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + (v.touched.len() + v.deleted.len()) * 20);
    out.extend_from_slice(&(v.touched.len() as u32).to_be_bytes());
    for h in &v.touched {
        out.extend_from_slice(h);
    }
    out.extend_from_slice(&(v.deleted.len() as u32).to_be_bytes());
    for h in &v.deleted {
        out.extend_from_slice(h);
    }
    out
}

pub fn unpack_touched_or_deleted_value(buf: &[u8]) -> Result<TouchedOrDeletedValue, CorruptRow> {
    need(buf, 0, 4, "touched_or_deleted header")?;
    let n_touched = u32::from_be_bytes(buf[0..4].try_into().unwrap()) as usize;
    let mut pos = 4;
    need(buf, pos, n_touched * 20, "touched_or_deleted touched set")?;
    let mut touched = Vec::with_capacity(n_touched);
    for _ in 0..n_touched {
        let mut h = [0u8; 20];
        h.copy_from_slice(&buf[pos..pos + 20]);
        touched.push(h);
        pos += 20;
    }
    need(buf, pos, 4, "touched_or_deleted deleted count")?;
    let n_deleted = u32::from_be_bytes(buf[pos..pos + 4].try_into().unwrap()) as usize;
    pos += 4;
    need(buf, pos, n_deleted * 20, "touched_or_deleted deleted set")?;
    let mut deleted = Vec::with_capacity(n_deleted);
    for _ in 0..n_deleted {
        let mut h = [0u8; 20];
        h.copy_from_slice(&buf[pos..pos + 20]);
        deleted.push(h);
        pos += 20;
    }
    Ok(TouchedOrDeletedValue { touched, deleted })
}

// ---------------------------------------------------------------------
// Undo
// ---------------------------------------------------------------------

pub fn pack_undo_key(height: u32, block_hash: &[u8; 32]) -> Vec<u8> {
    let mut out = height.to_be_bytes().to_vec();
    out.extend_from_slice(block_hash);
    out
}

pub fn pack_undo_partial_key_height(height: u32) -> Vec<u8> {
    height.to_be_bytes().to_vec()
}

pub fn unpack_undo_key(buf: &[u8]) -> Result<(u32, [u8; 32]), CorruptRow> {
    if buf.len() != 36 {
        return Err(CorruptRow::new("undo key must be 36 bytes"));
    }
    let height = u32::from_be_bytes(buf[0..4].try_into().unwrap());
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&buf[4..36]);
    Ok((height, hash))
}

// ---------------------------------------------------------------------
// Claim info (supplemental row, SPEC_FULL.md §3): persists the fields a
// later block needs without re-reading the original transaction — a
// channel's public key, and (for convenience) whether a claim is a channel
// at all, so `abandon_claim` doesn't need to guess from the payload again.
// ---------------------------------------------------------------------

pub fn pack_claim_info_key(claim_hash: &[u8; 20]) -> Vec<u8> {
    claim_hash.to_vec()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimInfoValue {
    pub is_channel: bool,
    pub channel_public_key: Option<Vec<u8>>,
}

pub fn pack_claim_info_value(v: &ClaimInfoValue) -> Vec<u8> {
    let mut out = Vec::new();
    out.push(v.is_channel as u8);
    match &v.channel_public_key {
        Some(pk) => {
            out.push(1);
            out.extend_from_slice(&(pk.len() as u16).to_be_bytes());
            out.extend_from_slice(pk);
        }
        None => out.push(0),
    }
    out
}

pub fn unpack_claim_info_value(buf: &[u8]) -> Result<ClaimInfoValue, CorruptRow> {
    need(buf, 0, 2, "claim info value header")?;
    let is_channel = buf[0] != 0;
    let has_pk = buf[1] != 0;
    let channel_public_key = if has_pk {
        need(buf, 2, 2, "claim info pubkey length")?;
        let len = u16::from_be_bytes([buf[2], buf[3]]) as usize;
        need(buf, 4, len, "claim info pubkey body")?;
        Some(buf[4..4 + len].to_vec())
    } else {
        None
    };
    Ok(ClaimInfoValue { is_channel, channel_public_key })
}

// ---------------------------------------------------------------------
// DB state singleton
// ---------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbState {
    pub genesis_hash: [u8; 32],
    pub height: u32,
    pub tx_count: u32,
    pub tip_hash: [u8; 32],
    pub utxo_flush_count: u32,
    pub wall_time: u32,
    pub first_sync: bool,
    pub db_version: u32,
}

pub const DB_STATE_KEY: &[u8] = b"";

pub fn pack_db_state(v: &DbState) -> Vec<u8> {
    let mut out = Vec::with_capacity(32 + 4 + 4 + 32 + 4 + 4 + 1 + 4);
    out.extend_from_slice(&v.genesis_hash);
    out.extend_from_slice(&v.height.to_be_bytes());
    out.extend_from_slice(&v.tx_count.to_be_bytes());
    out.extend_from_slice(&v.tip_hash);
    out.extend_from_slice(&v.utxo_flush_count.to_be_bytes());
    out.extend_from_slice(&v.wall_time.to_be_bytes());
    out.push(v.first_sync as u8);
    out.extend_from_slice(&v.db_version.to_be_bytes());
    out
}

pub fn unpack_db_state(buf: &[u8]) -> Result<DbState, CorruptRow> {
    need(buf, 0, 85, "db_state value")?;
    let mut genesis_hash = [0u8; 32];
    genesis_hash.copy_from_slice(&buf[0..32]);
    let height = u32::from_be_bytes(buf[32..36].try_into().unwrap());
    let tx_count = u32::from_be_bytes(buf[36..40].try_into().unwrap());
    let mut tip_hash = [0u8; 32];
    tip_hash.copy_from_slice(&buf[40..72]);
    let utxo_flush_count = u32::from_be_bytes(buf[72..76].try_into().unwrap());
    let wall_time = u32::from_be_bytes(buf[76..80].try_into().unwrap());
    let first_sync = buf[80] != 0;
    let db_version = u32::from_be_bytes(buf[81..85].try_into().unwrap());
    Ok(DbState { genesis_hash, height, tx_count, tip_hash, utxo_flush_count, wall_time, first_sync, db_version })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ones_complement_inverts_sort_order() {
        let a = ones_complement(1);
        let b = ones_complement(100);
        assert!(b < a, "higher amount must sort first (ascending bytes)");
    }

    #[test]
    fn effective_amount_key_roundtrip_and_order() {
        let k1 = pack_effective_amount_key(b"cat", 100, 5, 0);
        let k2 = pack_effective_amount_key(b"cat", 10, 5, 0);
        assert!(k1 < k2, "higher effective amount must sort before lower");
        let (name, amount, tx_num, nout) = unpack_effective_amount_key(&k1).unwrap();
        assert_eq!(name, b"cat");
        assert_eq!(amount, 100);
        assert_eq!(tx_num, 5);
        assert_eq!(nout, 0);
    }

    #[test]
    fn claim_to_txo_value_roundtrip() {
        let v = ClaimToTxoValue {
            tx_num: 7,
            nout: 1,
            root_tx_num: 7,
            root_pos: 1,
            amount: 100_000_000,
            sig_valid: true,
            name: b"cat".to_vec(),
        };
        let packed = pack_claim_to_txo_value(&v);
        let unpacked = unpack_claim_to_txo_value(&packed).unwrap();
        assert_eq!(unpacked, v);
    }

    #[test]
    fn partial_claim_id_sorts_short_before_long_same_head() {
        let mut a = Vec::new();
        pack_partial_claim_id(b"ab", &mut a);
        let mut b = Vec::new();
        pack_partial_claim_id(b"abcd", &mut b);
        assert!(a < b);
    }

    #[test]
    fn unpack_rejects_truncated_row() {
        let bad = vec![1, 2, 3];
        assert!(unpack_claim_to_txo_value(&bad).is_err());
    }

    #[test]
    fn name_with_invalid_utf8_round_trips_as_raw_bytes() {
        let name: Vec<u8> = vec![0xff, 0xfe, b'x'];
        let mut out = Vec::new();
        pack_name(&name, &mut out);
        let mut pos = 0;
        let back = unpack_name(&out, &mut pos).unwrap();
        assert_eq!(back, name);
    }
}
