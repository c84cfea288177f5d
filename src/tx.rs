/// Raw block and transaction parsing.
///
/// Block bytes are the canonical chain serialization named in spec.md §6: a
/// 112-byte header (4B version, 32B prev-hash, 32B merkle-root, 32B
/// claim-trie-root, 4B timestamp, 4B bits, 4B nonce), a varint tx count,
/// then the transactions themselves in the classic (non-segwit) layout.
use crate::hashes::sha256;
use crate::error::CorruptRow;

pub const HEADER_LEN: usize = 112;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxIn {
    pub prev_tx_hash: [u8; 32],
    pub prev_index: u32,
    pub script_sig: Vec<u8>,
    pub sequence: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxOut {
    pub amount: u64,
    pub script_pubkey: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub version: u32,
    pub inputs: Vec<TxIn>,
    pub outputs: Vec<TxOut>,
    pub locktime: u32,
}

impl Transaction {
    /// True for the first transaction in a block (no real inputs).
    pub fn is_coinbase(&self) -> bool {
        self.inputs.len() == 1 && self.inputs[0].prev_tx_hash == [0u8; 32] && self.inputs[0].prev_index == 0xffff_ffff
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&self.version.to_le_bytes());
        write_varint(&mut out, self.inputs.len() as u64);
        for input in &self.inputs {
            out.extend_from_slice(&input.prev_tx_hash);
            out.extend_from_slice(&input.prev_index.to_le_bytes());
            write_varint(&mut out, input.script_sig.len() as u64);
            out.extend_from_slice(&input.script_sig);
            out.extend_from_slice(&input.sequence.to_le_bytes());
        }
        write_varint(&mut out, self.outputs.len() as u64);
        for output in &self.outputs {
            out.extend_from_slice(&output.amount.to_le_bytes());
            write_varint(&mut out, output.script_pubkey.len() as u64);
            out.extend_from_slice(&output.script_pubkey);
        }
        out.extend_from_slice(&self.locktime.to_le_bytes());
        out
    }

    /// Double-sha256 of the serialized transaction, kept in natural
    /// (non-reversed) byte order for use as the internal `tx_hash` key.
    pub fn txid(&self) -> [u8; 32] {
        sha256(&sha256(&self.serialize()))
    }

    pub fn deserialize(buf: &[u8]) -> Result<(Transaction, usize), CorruptRow> {
        let mut pos = 0usize;
        let version = read_u32(buf, &mut pos)?;
        let n_in = read_varint(buf, &mut pos)?;
        let mut inputs = Vec::with_capacity(n_in as usize);
        for _ in 0..n_in {
            let prev_tx_hash = read_bytes32(buf, &mut pos)?;
            let prev_index = read_u32(buf, &mut pos)?;
            let script_len = read_varint(buf, &mut pos)? as usize;
            let script_sig = read_bytes(buf, &mut pos, script_len)?;
            let sequence = read_u32(buf, &mut pos)?;
            inputs.push(TxIn { prev_tx_hash, prev_index, script_sig, sequence });
        }
        let n_out = read_varint(buf, &mut pos)?;
        let mut outputs = Vec::with_capacity(n_out as usize);
        for _ in 0..n_out {
            let amount = read_u64(buf, &mut pos)?;
            let script_len = read_varint(buf, &mut pos)? as usize;
            let script_pubkey = read_bytes(buf, &mut pos, script_len)?;
            outputs.push(TxOut { amount, script_pubkey });
        }
        let locktime = read_u32(buf, &mut pos)?;
        Ok((Transaction { version, inputs, outputs, locktime }, pos))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawBlock {
    pub header: [u8; HEADER_LEN],
    pub transactions: Vec<Transaction>,
}

impl RawBlock {
    pub fn block_hash(&self) -> [u8; 32] {
        sha256(&sha256(&self.header))
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut out = self.header.to_vec();
        write_varint(&mut out, self.transactions.len() as u64);
        for tx in &self.transactions {
            out.extend_from_slice(&tx.serialize());
        }
        out
    }

    pub fn deserialize(buf: &[u8]) -> Result<RawBlock, CorruptRow> {
        if buf.len() < HEADER_LEN {
            return Err(CorruptRow::new("block shorter than header"));
        }
        let mut header = [0u8; HEADER_LEN];
        header.copy_from_slice(&buf[0..HEADER_LEN]);
        let mut pos = HEADER_LEN;
        let n_tx = read_varint(buf, &mut pos)?;
        let mut transactions = Vec::with_capacity(n_tx as usize);
        for _ in 0..n_tx {
            let (tx, consumed) = Transaction::deserialize(&buf[pos..])?;
            pos += consumed;
            transactions.push(tx);
        }
        Ok(RawBlock { header, transactions })
    }

    pub fn prev_hash(&self) -> [u8; 32] {
        let mut h = [0u8; 32];
        h.copy_from_slice(&self.header[4..36]);
        h
    }

    pub fn timestamp(&self) -> u32 {
        u32::from_le_bytes(self.header[100..104].try_into().unwrap())
    }
}

pub fn build_header(version: u32, prev_hash: &[u8; 32], merkle_root: &[u8; 32], claim_trie_root: &[u8; 32], timestamp: u32, bits: u32, nonce: u32) -> [u8; HEADER_LEN] {
    let mut out = [0u8; HEADER_LEN];
    out[0..4].copy_from_slice(&version.to_le_bytes());
    out[4..36].copy_from_slice(prev_hash);
    out[36..68].copy_from_slice(merkle_root);
    out[68..100].copy_from_slice(claim_trie_root);
    out[100..104].copy_from_slice(&timestamp.to_le_bytes());
    out[104..108].copy_from_slice(&bits.to_le_bytes());
    out[108..112].copy_from_slice(&nonce.to_le_bytes());
    out
}

fn write_varint(out: &mut Vec<u8>, n: u64) {
    if n < 0xfd {
        out.push(n as u8);
    } else if n <= 0xffff {
        out.push(0xfd);
        out.extend_from_slice(&(n as u16).to_le_bytes());
    } else if n <= 0xffff_ffff {
        out.push(0xfe);
        out.extend_from_slice(&(n as u32).to_le_bytes());
    } else {
        out.push(0xff);
        out.extend_from_slice(&n.to_le_bytes());
    }
}

fn read_varint(buf: &[u8], pos: &mut usize) -> Result<u64, CorruptRow> {
    if buf.len() <= *pos {
        return Err(CorruptRow::new("truncated varint"));
    }
    let first = buf[*pos];
    *pos += 1;
    match first {
        0xfd => {
            let v = read_u16(buf, pos)?;
            Ok(v as u64)
        }
        0xfe => Ok(read_u32(buf, pos)? as u64),
        0xff => read_u64(buf, pos),
        n => Ok(n as u64),
    }
}

fn read_u16(buf: &[u8], pos: &mut usize) -> Result<u16, CorruptRow> {
    if buf.len() < *pos + 2 {
        return Err(CorruptRow::new("truncated u16"));
    }
    let v = u16::from_le_bytes(buf[*pos..*pos + 2].try_into().unwrap());
    *pos += 2;
    Ok(v)
}

fn read_u32(buf: &[u8], pos: &mut usize) -> Result<u32, CorruptRow> {
    if buf.len() < *pos + 4 {
        return Err(CorruptRow::new("truncated u32"));
    }
    let v = u32::from_le_bytes(buf[*pos..*pos + 4].try_into().unwrap());
    *pos += 4;
    Ok(v)
}

fn read_u64(buf: &[u8], pos: &mut usize) -> Result<u64, CorruptRow> {
    if buf.len() < *pos + 8 {
        return Err(CorruptRow::new("truncated u64"));
    }
    let v = u64::from_le_bytes(buf[*pos..*pos + 8].try_into().unwrap());
    *pos += 8;
    Ok(v)
}

fn read_bytes32(buf: &[u8], pos: &mut usize) -> Result<[u8; 32], CorruptRow> {
    if buf.len() < *pos + 32 {
        return Err(CorruptRow::new("truncated 32-byte field"));
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&buf[*pos..*pos + 32]);
    *pos += 32;
    Ok(out)
}

fn read_bytes(buf: &[u8], pos: &mut usize, len: usize) -> Result<Vec<u8>, CorruptRow> {
    if buf.len() < *pos + len {
        return Err(CorruptRow::new("truncated byte field"));
    }
    let out = buf[*pos..*pos + len].to_vec();
    *pos += len;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tx() -> Transaction {
        Transaction {
            version: 1,
            inputs: vec![TxIn { prev_tx_hash: [0u8; 32], prev_index: 0xffff_ffff, script_sig: vec![1, 2, 3], sequence: 0xffffffff }],
            outputs: vec![TxOut { amount: 100, script_pubkey: vec![0x76, 0xa9] }],
            locktime: 0,
        }
    }

    #[test]
    fn transaction_roundtrip() {
        let tx = sample_tx();
        let bytes = tx.serialize();
        let (back, consumed) = Transaction::deserialize(&bytes).unwrap();
        assert_eq!(consumed, bytes.len());
        assert_eq!(back, tx);
    }

    #[test]
    fn coinbase_detection() {
        assert!(sample_tx().is_coinbase());
    }

    #[test]
    fn block_roundtrip() {
        let header = build_header(1, &[1u8; 32], &[2u8; 32], &[3u8; 32], 1000, 0x1d00ffff, 7);
        let block = RawBlock { header, transactions: vec![sample_tx(), sample_tx()] };
        let bytes = block.serialize();
        let back = RawBlock::deserialize(&bytes).unwrap();
        assert_eq!(back, block);
        assert_eq!(back.prev_hash(), [1u8; 32]);
    }
}
