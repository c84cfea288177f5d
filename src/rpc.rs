/// Upstream node RPC client.
///
/// The indexer's only dependency on the outside world: a small `NodeRpc`
/// trait with one concrete JSON-RPC implementation over `reqwest`, mirroring
/// the teacher's use of a blocking RPC client wrapped in `spawn_blocking`
/// (`monitor.rs::get_rpc_chain_tip`/`index_block_from_rpc`), generalized
/// from PIVX Core's JSON-RPC surface to the methods spec.md §6 names. Tests
/// substitute an in-memory fake instead of this implementation.
use serde_json::Value;
use std::time::Duration;

use crate::error::TransientUpstream;
use crate::tx::RawBlock;

/// Methods the indexer needs from the upstream full node, per spec.md §6.
pub trait NodeRpc: Send + Sync {
    fn get_best_height(&self) -> Result<u32, TransientUpstream>;
    fn get_block_hex_hashes(&self, start: u32, count: u32) -> Result<Vec<[u8; 32]>, TransientUpstream>;
    fn get_raw_blocks(&self, hashes: &[[u8; 32]]) -> Result<Vec<RawBlock>, TransientUpstream>;
    fn get_raw_transaction(&self, txid: &[u8; 32]) -> Result<Vec<u8>, TransientUpstream>;
    fn get_mempool(&self) -> Result<Vec<[u8; 32]>, TransientUpstream>;
}

/// Blocking JSON-RPC client, invoked from async contexts via
/// `tokio::task::spawn_blocking` — `reqwest::blocking` is simpler to reason
/// about than juggling the async client's connection pool across the
/// prefetcher's retry loop, matching the teacher's own choice in `monitor.rs`.
pub struct JsonRpcClient {
    url: String,
    user: String,
    password: String,
    client: reqwest::blocking::Client,
}

impl JsonRpcClient {
    pub fn new(url: String, user: String, password: String) -> Self {
        let client = reqwest::blocking::Client::builder().timeout(Duration::from_secs(30)).build().unwrap_or_else(|_| reqwest::blocking::Client::new());
        Self { url, user, password, client }
    }

    fn call(&self, method: &str, params: Value) -> Result<Value, TransientUpstream> {
        let body = serde_json::json!({
            "jsonrpc": "1.0",
            "id": "claimhub",
            "method": method,
            "params": params,
        });
        let response = self
            .client
            .post(&self.url)
            .basic_auth(&self.user, Some(&self.password))
            .json(&body)
            .send()
            .map_err(|e| TransientUpstream::new(format!("{method}: {e}")))?;
        let json: Value = response.json().map_err(|e| TransientUpstream::new(format!("{method}: bad json response: {e}")))?;
        if let Some(err) = json.get("error") {
            if !err.is_null() {
                return Err(TransientUpstream::new(format!("{method}: rpc error {err}")));
            }
        }
        json.get("result").cloned().ok_or_else(|| TransientUpstream::new(format!("{method}: missing result field")))
    }
}

impl NodeRpc for JsonRpcClient {
    fn get_best_height(&self) -> Result<u32, TransientUpstream> {
        let v = self.call("getblockcount", serde_json::json!([]))?;
        v.as_u64().map(|h| h as u32).ok_or_else(|| TransientUpstream::new("getblockcount: not a number"))
    }

    fn get_block_hex_hashes(&self, start: u32, count: u32) -> Result<Vec<[u8; 32]>, TransientUpstream> {
        let mut out = Vec::with_capacity(count as usize);
        for height in start..start + count {
            let v = self.call("getblockhash", serde_json::json!([height]))?;
            let s = v.as_str().ok_or_else(|| TransientUpstream::new("getblockhash: not a string"))?;
            let bytes = hex::decode(s).map_err(|e| TransientUpstream::new(format!("getblockhash: {e}")))?;
            let arr: [u8; 32] = bytes.try_into().map_err(|_| TransientUpstream::new("getblockhash: wrong length"))?;
            out.push(arr);
        }
        Ok(out)
    }

    /// Fetches each block as verbosity=2 (full transaction objects) the way
    /// `monitor.rs::index_block_from_rpc` does, then re-serializes into our
    /// own `RawBlock` wire format rather than relying on the node's JSON
    /// shape downstream.
    fn get_raw_blocks(&self, hashes: &[[u8; 32]]) -> Result<Vec<RawBlock>, TransientUpstream> {
        let mut out = Vec::with_capacity(hashes.len());
        for hash in hashes {
            let hash_hex = hex::encode(hash);
            let result = self.call("getblock", serde_json::json!([hash_hex, 0]))?;
            let hex_str = result.as_str().ok_or_else(|| TransientUpstream::new("getblock: expected raw hex at verbosity 0"))?;
            let bytes = hex::decode(hex_str).map_err(|e| TransientUpstream::new(format!("getblock: {e}")))?;
            let block = RawBlock::deserialize(&bytes).map_err(|e| TransientUpstream::new(format!("getblock: {e}")))?;
            out.push(block);
        }
        Ok(out)
    }

    fn get_raw_transaction(&self, txid: &[u8; 32]) -> Result<Vec<u8>, TransientUpstream> {
        let v = self.call("getrawtransaction", serde_json::json!([hex::encode(txid), 0]))?;
        let s = v.as_str().ok_or_else(|| TransientUpstream::new("getrawtransaction: not a string"))?;
        hex::decode(s).map_err(|e| TransientUpstream::new(format!("getrawtransaction: {e}")))
    }

    fn get_mempool(&self) -> Result<Vec<[u8; 32]>, TransientUpstream> {
        let v = self.call("getrawmempool", serde_json::json!([]))?;
        let arr = v.as_array().ok_or_else(|| TransientUpstream::new("getrawmempool: not an array"))?;
        let mut out = Vec::with_capacity(arr.len());
        for item in arr {
            let s = item.as_str().ok_or_else(|| TransientUpstream::new("getrawmempool: entry not a string"))?;
            let bytes = hex::decode(s).map_err(|e| TransientUpstream::new(format!("getrawmempool: {e}")))?;
            let arr32: [u8; 32] = bytes.try_into().map_err(|_| TransientUpstream::new("getrawmempool: wrong length"))?;
            out.push(arr32);
        }
        Ok(out)
    }
}

#[cfg(test)]
pub mod fake {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// In-memory fake used by prefetcher/reorg tests so they don't need a
    /// live node, per SPEC_FULL.md §6 ("so tests can substitute an
    /// in-memory fake").
    #[derive(Default)]
    pub struct FakeNodeRpc {
        pub blocks: Mutex<Vec<RawBlock>>,
        pub mempool: Mutex<HashMap<[u8; 32], Vec<u8>>>,
    }

    impl NodeRpc for FakeNodeRpc {
        fn get_best_height(&self) -> Result<u32, TransientUpstream> {
            Ok(self.blocks.lock().unwrap().len() as u32)
        }

        fn get_block_hex_hashes(&self, start: u32, count: u32) -> Result<Vec<[u8; 32]>, TransientUpstream> {
            let blocks = self.blocks.lock().unwrap();
            let mut out = Vec::new();
            for h in start..start + count {
                if let Some(b) = blocks.get((h - 1) as usize) {
                    out.push(b.block_hash());
                } else {
                    return Err(TransientUpstream::new("height beyond fake chain"));
                }
            }
            Ok(out)
        }

        fn get_raw_blocks(&self, hashes: &[[u8; 32]]) -> Result<Vec<RawBlock>, TransientUpstream> {
            let blocks = self.blocks.lock().unwrap();
            hashes
                .iter()
                .map(|h| blocks.iter().find(|b| &b.block_hash() == h).cloned().ok_or_else(|| TransientUpstream::new("unknown hash")))
                .collect()
        }

        fn get_raw_transaction(&self, txid: &[u8; 32]) -> Result<Vec<u8>, TransientUpstream> {
            let blocks = self.blocks.lock().unwrap();
            for b in blocks.iter() {
                for tx in &b.transactions {
                    if &tx.txid() == txid {
                        return Ok(tx.serialize());
                    }
                }
            }
            Err(TransientUpstream::new("unknown txid"))
        }

        fn get_mempool(&self) -> Result<Vec<[u8; 32]>, TransientUpstream> {
            Ok(self.mempool.lock().unwrap().keys().copied().collect())
        }
    }
}
