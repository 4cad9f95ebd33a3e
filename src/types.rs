// This file is Copyright its original authors, visible in version control history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. You may not use this file except in
// accordance with one or both of these licenses.

use crate::rpc::RpcError;

use bitcoin::{Amount, BlockHash, FeeRate, Txid};

use serde_json::Value;

use std::str::FromStr;

/// A snapshot of the node's view of the block chain.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockchainInfo {
	/// The name of the chain the node is on, e.g., `main`.
	pub chain: String,
	/// The number of fully-validated blocks.
	pub blocks: u64,
	/// The number of headers the node has seen.
	pub headers: u64,
	/// The hash of the best fully-validated block.
	pub best_block_hash: BlockHash,
	/// The estimated share of the chain the node has verified, between 0 and 1.
	pub verification_progress: f64,
	/// Whether the node considers itself to be in initial block download.
	pub initial_block_download: bool,
	/// Whether the node runs with a pruned block store.
	pub pruned: bool,
	/// Details of the chain tip, if we managed to retrieve them this cycle.
	pub tip: Option<BlockSummary>,
}

impl BlockchainInfo {
	pub(crate) fn from_value(v: &Value) -> Result<Self, RpcError> {
		let obj =
			v.as_object().ok_or_else(|| RpcError::parse("getblockchaininfo"))?;
		let chain = obj
			.get("chain")
			.and_then(|c| c.as_str())
			.ok_or_else(|| RpcError::parse("getblockchaininfo"))?
			.to_string();
		let blocks = obj
			.get("blocks")
			.and_then(|b| b.as_u64())
			.ok_or_else(|| RpcError::parse("getblockchaininfo"))?;
		let headers = obj.get("headers").and_then(|h| h.as_u64()).unwrap_or(blocks);
		let best_block_hash = obj
			.get("bestblockhash")
			.and_then(|h| h.as_str())
			.and_then(|h| BlockHash::from_str(h).ok())
			.ok_or_else(|| RpcError::parse("getblockchaininfo"))?;
		let verification_progress =
			obj.get("verificationprogress").and_then(|p| p.as_f64()).unwrap_or(1.0);
		let initial_block_download =
			obj.get("initialblockdownload").and_then(|i| i.as_bool()).unwrap_or(false);
		let pruned = obj.get("pruned").and_then(|p| p.as_bool()).unwrap_or(false);
		Ok(Self {
			chain,
			blocks,
			headers,
			best_block_hash,
			verification_progress,
			initial_block_download,
			pruned,
			tip: None,
		})
	}

	/// Whether the node is still catching up with the chain.
	pub fn is_syncing(&self) -> bool {
		self.verification_progress < crate::config::VERIFICATION_PROGRESS_SYNCED
			|| self.headers > self.blocks
	}
}

/// Details of a single block, as surfaced with [`BlockchainInfo::tip`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockSummary {
	/// The block hash.
	pub hash: BlockHash,
	/// The height of the block.
	pub height: u64,
	/// The block timestamp, in seconds since the unix epoch.
	pub time: u64,
	/// The number of transactions in the block.
	pub tx_count: u64,
}

impl BlockSummary {
	pub(crate) fn from_value(v: &Value) -> Result<Self, RpcError> {
		let obj = v.as_object().ok_or_else(|| RpcError::parse("getblock"))?;
		let hash = obj
			.get("hash")
			.and_then(|h| h.as_str())
			.and_then(|h| BlockHash::from_str(h).ok())
			.ok_or_else(|| RpcError::parse("getblock"))?;
		let height =
			obj.get("height").and_then(|h| h.as_u64()).ok_or_else(|| RpcError::parse("getblock"))?;
		let time = obj.get("time").and_then(|t| t.as_u64()).unwrap_or(0);
		let tx_count = obj.get("nTx").and_then(|n| n.as_u64()).unwrap_or(0);
		Ok(Self { hash, height, time, tx_count })
	}
}

/// A snapshot of the node's view of the peer-to-peer network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkInfo {
	/// The node's version number.
	pub version: u64,
	/// The node's user agent string.
	pub subversion: String,
	/// The peer-to-peer protocol version the node speaks.
	pub protocol_version: u64,
	/// The number of connected peers.
	pub connections: u64,
	/// Whether peer-to-peer networking is enabled.
	pub network_active: bool,
}

impl NetworkInfo {
	pub(crate) fn from_value(v: &Value) -> Result<Self, RpcError> {
		let obj = v.as_object().ok_or_else(|| RpcError::parse("getnetworkinfo"))?;
		let version = obj
			.get("version")
			.and_then(|x| x.as_u64())
			.ok_or_else(|| RpcError::parse("getnetworkinfo"))?;
		let subversion =
			obj.get("subversion").and_then(|x| x.as_str()).unwrap_or_default().to_string();
		let protocol_version = obj.get("protocolversion").and_then(|x| x.as_u64()).unwrap_or(0);
		let connections = obj.get("connections").and_then(|x| x.as_u64()).unwrap_or(0);
		let network_active = obj.get("networkactive").and_then(|x| x.as_bool()).unwrap_or(true);
		Ok(Self { version, subversion, protocol_version, connections, network_active })
	}
}

/// A snapshot of the node's mempool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MempoolInfo {
	/// The number of transactions currently in the mempool.
	pub transaction_count: u64,
	/// The serialized size of all mempool transactions, in bytes.
	pub bytes: u64,
	/// The memory usage of the mempool, in bytes.
	pub usage: u64,
	/// The minimum fee rate the mempool currently accepts.
	pub min_fee_rate: FeeRate,
}

impl MempoolInfo {
	pub(crate) fn from_value(v: &Value) -> Result<Self, RpcError> {
		let obj = v.as_object().ok_or_else(|| RpcError::parse("getmempoolinfo"))?;
		let transaction_count = obj
			.get("size")
			.and_then(|x| x.as_u64())
			.ok_or_else(|| RpcError::parse("getmempoolinfo"))?;
		let bytes = obj.get("bytes").and_then(|x| x.as_u64()).unwrap_or(0);
		let usage = obj.get("usage").and_then(|x| x.as_u64()).unwrap_or(0);
		let min_fee_rate = obj
			.get("mempoolminfee")
			.and_then(|x| x.as_f64())
			.map(fee_rate_from_btc_per_kvb)
			.unwrap_or(FeeRate::ZERO);
		Ok(Self { transaction_count, bytes, usage, min_fee_rate })
	}
}

/// A single entry of the node's peer list.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerSummary {
	/// The node-local peer index.
	pub id: u64,
	/// The network address of the peer.
	pub addr: String,
	/// The peer's user agent string.
	pub subversion: String,
	/// Whether the peer connected to us.
	pub inbound: bool,
	/// The last measured round trip time to the peer, in seconds.
	pub ping_secs: Option<f64>,
}

impl PeerSummary {
	pub(crate) fn from_value(v: &Value) -> Result<Self, RpcError> {
		let obj = v.as_object().ok_or_else(|| RpcError::parse("getpeerinfo"))?;
		let id =
			obj.get("id").and_then(|x| x.as_u64()).ok_or_else(|| RpcError::parse("getpeerinfo"))?;
		let addr = obj.get("addr").and_then(|x| x.as_str()).unwrap_or_default().to_string();
		let subversion = obj.get("subver").and_then(|x| x.as_str()).unwrap_or_default().to_string();
		let inbound = obj.get("inbound").and_then(|x| x.as_bool()).unwrap_or(false);
		let ping_secs = obj.get("pingtime").and_then(|x| x.as_f64());
		Ok(Self { id, addr, subversion, inbound, ping_secs })
	}
}

/// A transaction touching a watched address, derived from the currently known coins.
///
/// This is opportunistic history: it covers whatever the balance queries surfaced, not a
/// complete ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressTransaction {
	/// The transaction id.
	pub txid: Txid,
	/// The value the transaction carries for the watched address.
	pub amount: Amount,
	/// The number of confirmations, with 0 denoting an unconfirmed transaction.
	pub confirmations: u64,
}

/// An unspent output as reported by the node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Unspent {
	pub txid: Txid,
	pub vout: u32,
	pub amount: Amount,
	pub confirmations: u64,
	pub address: Option<String>,
	pub spendable: bool,
}

impl Unspent {
	pub(crate) fn from_value(v: &Value) -> Result<Self, RpcError> {
		let obj = v.as_object().ok_or_else(|| RpcError::parse("listunspent"))?;
		let txid = obj
			.get("txid")
			.and_then(|t| t.as_str())
			.and_then(|t| Txid::from_str(t).ok())
			.ok_or_else(|| RpcError::parse("listunspent"))?;
		let vout = obj
			.get("vout")
			.and_then(|x| x.as_u64())
			.and_then(|x| u32::try_from(x).ok())
			.ok_or_else(|| RpcError::parse("listunspent"))?;
		let amount = obj
			.get("amount")
			.ok_or_else(|| RpcError::parse("listunspent"))
			.and_then(amount_from_btc_value)?;
		let confirmations = obj.get("confirmations").and_then(|x| x.as_u64()).unwrap_or(0);
		let address = obj.get("address").and_then(|x| x.as_str()).map(|s| s.to_string());
		let spendable = obj.get("spendable").and_then(|x| x.as_bool()).unwrap_or(true);
		Ok(Self { txid, vout, amount, confirmations, address, spendable })
	}
}

// Bitcoin Core reports amounts as BTC values. Every valid satoshi amount is exactly
// representable at the JSON layer, so the conversion below cannot drift.
pub(crate) fn amount_from_btc_value(v: &Value) -> Result<Amount, RpcError> {
	let btc = v.as_f64().ok_or_else(|| RpcError::parse("amount"))?;
	Amount::from_btc(btc).map_err(|_| RpcError::parse("amount"))
}

// Bitcoin Core gives us fee rates in BTC/kvB.
// Thus, we multiply by 25_000_000 (10^8 / 4) to get satoshis/kwu.
pub(crate) fn fee_rate_from_btc_per_kvb(btc_per_kvb: f64) -> FeeRate {
	let sat_per_kwu = (btc_per_kvb * 25_000_000.0).round() as u64;
	FeeRate::from_sat_per_kwu(sat_per_kwu)
}

// Fee estimation and coin selection work in whole sat/vB.
pub(crate) fn sat_per_vb_from_btc_per_kvb(btc_per_kvb: f64) -> u64 {
	(btc_per_kvb * 100_000.0).round() as u64
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	#[test]
	fn blockchain_info_parsing() {
		let value = json!({
			"chain": "main",
			"blocks": 820000u64,
			"headers": 820002u64,
			"bestblockhash": "000000000000000000024c2a0668d76b7ecda5507b9fdbd4d1af4cd9ba5200f0",
			"verificationprogress": 0.999999,
			"initialblockdownload": false,
			"pruned": false,
		});
		let info = BlockchainInfo::from_value(&value).unwrap();
		assert_eq!(info.chain, "main");
		assert_eq!(info.blocks, 820000);
		assert!(info.is_syncing());

		let synced = json!({
			"chain": "main",
			"blocks": 820002u64,
			"headers": 820002u64,
			"bestblockhash": "000000000000000000024c2a0668d76b7ecda5507b9fdbd4d1af4cd9ba5200f0",
			"verificationprogress": 1.0,
		});
		assert!(!BlockchainInfo::from_value(&synced).unwrap().is_syncing());

		assert!(BlockchainInfo::from_value(&json!("not an object")).is_err());
	}

	#[test]
	fn amount_parsing_is_exact() {
		let amount = amount_from_btc_value(&json!(0.00012345)).unwrap();
		assert_eq!(amount, Amount::from_sat(12345));

		// 1.1 BTC has no finite binary representation, but still rounds to the exact sat value.
		let amount = amount_from_btc_value(&json!(1.1)).unwrap();
		assert_eq!(amount, Amount::from_sat(110_000_000));

		assert!(amount_from_btc_value(&json!(-0.1)).is_err());
		assert!(amount_from_btc_value(&json!("nope")).is_err());
	}

	#[test]
	fn fee_rate_conversions() {
		// 0.00001 BTC/kvB is the 1 sat/vB floor.
		assert_eq!(sat_per_vb_from_btc_per_kvb(0.00001), 1);
		assert_eq!(sat_per_vb_from_btc_per_kvb(0.00025), 25);
		assert_eq!(fee_rate_from_btc_per_kvb(0.00001), FeeRate::from_sat_per_kwu(250));
	}
}
