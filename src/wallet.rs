// This file is Copyright its original authors, visible in version control history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. You may not use this file except in
// accordance with one or both of these licenses.

use crate::logger::{log_debug, DynLogger};
use crate::rpc::{RpcError, RpcGateway};
use crate::types::{amount_from_btc_value, AddressTransaction, Unspent};

use bitcoin::{Amount, Txid};

use serde_json::json;

use std::str::FromStr;
use std::sync::{Arc, RwLock};

/// The flavor of the node wallet we are talking to. Decides which balance-query strategy and
/// import path are valid.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum WalletKind {
	/// A descriptor-based wallet.
	Descriptor,
	/// A legacy wallet holding individually imported keys and addresses.
	Legacy,
}

/// Determines the kind of the connected wallet, caching the answer per connection generation.
pub(crate) struct WalletInspector {
	gateway: Arc<RpcGateway>,
	cached: RwLock<Option<(u64, WalletKind)>>,
	logger: Arc<DynLogger>,
}

impl WalletInspector {
	pub(crate) fn new(gateway: Arc<RpcGateway>, logger: Arc<DynLogger>) -> Self {
		let cached = RwLock::new(None);
		Self { gateway, cached, logger }
	}

	pub(crate) async fn wallet_kind(&self, generation: u64) -> WalletKind {
		if let Some((cached_generation, kind)) = *self.cached.read().unwrap() {
			if cached_generation == generation {
				return kind;
			}
		}

		let kind = self.detect().await;
		log_debug!(self.logger, "Detected wallet kind {:?}.", kind);
		*self.cached.write().unwrap() = Some((generation, kind));
		kind
	}

	async fn detect(&self) -> WalletKind {
		// Primary path: the wallet metadata declares descriptor support directly.
		let outcome = self.gateway.call("getwalletinfo", vec![]).await;
		if let Ok(value) = outcome.into_result() {
			if let Some(descriptors) = value.get("descriptors").and_then(|d| d.as_bool()) {
				return if descriptors { WalletKind::Descriptor } else { WalletKind::Legacy };
			}
		}

		// Older nodes omit the `descriptors` field; a descriptor listing is just as
		// conclusive either way it goes.
		let listing = self.gateway.call("listdescriptors", vec![]).await;
		match listing.into_result() {
			Ok(_) => return WalletKind::Descriptor,
			Err(e) if e.message.contains("non-descriptor") => return WalletKind::Legacy,
			Err(_) => {},
		}

		// Fallback path: probe with a no-op legacy import. Descriptor wallets reject the
		// command itself before looking at the argument.
		let probe =
			self.gateway.call("importaddress", vec![json!(""), json!(""), json!(false)]).await;
		match probe.into_result() {
			Err(e) if is_descriptor_rejection(&e.message) => WalletKind::Descriptor,
			_ => WalletKind::Legacy,
		}
	}
}

fn is_descriptor_rejection(message: &str) -> bool {
	message.contains("legacy wallets") || message.contains("descriptor wallet")
}

/// Imports the given address for watching. Importing an already-imported address is treated as
/// success.
pub(crate) async fn import_address_idempotent(
	gateway: &RpcGateway, address: &str,
) -> Result<(), RpcError> {
	// Rescan is disabled: a rescan can stall the node for minutes and the balance strategies
	// pick up current coins regardless.
	let outcome =
		gateway.call("importaddress", vec![json!(address), json!(""), json!(false)]).await;
	match outcome.into_result() {
		Ok(_) => Ok(()),
		Err(e) if e.message.contains("already") => Ok(()),
		Err(e) => Err(e),
	}
}

/// The data a single balance query yields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct BalanceQueryResult {
	pub confirmed: Amount,
	pub unconfirmed: Amount,
	pub utxo_count: u32,
	pub transactions: Vec<AddressTransaction>,
	/// Whether the gateway flagged the underlying query as slow.
	pub slow: bool,
}

/// The ordered balance-query strategies. Each is a pure function of the address and the node
/// state; the monitor walks the chain until one succeeds.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum BalanceStrategy {
	/// A full UTXO-set scan. Works for any address regardless of wallet membership, but is
	/// expensive on the node.
	UtxoScan,
	/// A wallet-indexed lookup. Cheap, but only valid for addresses the wallet already knows.
	WalletIndex,
}

impl BalanceStrategy {
	pub(crate) async fn query(
		&self, gateway: &RpcGateway, address: &str, tip_height: u64,
	) -> Result<BalanceQueryResult, RpcError> {
		match self {
			Self::UtxoScan => Self::query_utxo_scan(gateway, address, tip_height).await,
			Self::WalletIndex => Self::query_wallet_index(gateway, address).await,
		}
	}

	async fn query_utxo_scan(
		gateway: &RpcGateway, address: &str, tip_height: u64,
	) -> Result<BalanceQueryResult, RpcError> {
		let scan_objects = json!([format!("addr({})", address)]);
		let outcome = gateway.call("scantxoutset", vec![json!("start"), scan_objects]).await;
		let slow = outcome.slow;
		let value = outcome.into_result()?;

		if !value.get("success").and_then(|s| s.as_bool()).unwrap_or(false) {
			return Err(RpcError::transient("UTXO scan did not complete".to_string()));
		}

		let confirmed = value
			.get("total_amount")
			.map(amount_from_btc_value)
			.unwrap_or(Ok(Amount::ZERO))?;

		let unspents = value
			.get("unspents")
			.and_then(|u| u.as_array())
			.ok_or_else(|| RpcError::parse("scantxoutset"))?;

		let mut transactions = Vec::with_capacity(unspents.len());
		for unspent in unspents {
			let txid = unspent
				.get("txid")
				.and_then(|t| t.as_str())
				.and_then(|t| Txid::from_str(t).ok())
				.ok_or_else(|| RpcError::parse("scantxoutset"))?;
			let amount = unspent
				.get("amount")
				.ok_or_else(|| RpcError::parse("scantxoutset"))
				.and_then(amount_from_btc_value)?;
			let height = unspent.get("height").and_then(|h| h.as_u64()).unwrap_or(0);
			let confirmations = confirmations_at(tip_height, height);
			transactions.push(AddressTransaction { txid, amount, confirmations });
		}
		transactions.sort_by(|a, b| b.confirmations.cmp(&a.confirmations));

		let utxo_count = transactions.len() as u32;
		// The UTXO set only covers confirmed coins, so the scan never reports unconfirmed
		// value.
		Ok(BalanceQueryResult {
			confirmed,
			unconfirmed: Amount::ZERO,
			utxo_count,
			transactions,
			slow,
		})
	}

	async fn query_wallet_index(
		gateway: &RpcGateway, address: &str,
	) -> Result<BalanceQueryResult, RpcError> {
		let outcome = gateway
			.call("listunspent", vec![json!(0), json!(9999999), json!([address])])
			.await;
		let slow = outcome.slow;
		let value = outcome.into_result()?;
		let entries =
			value.as_array().ok_or_else(|| RpcError::parse("listunspent"))?;

		let mut confirmed = Amount::ZERO;
		let mut unconfirmed = Amount::ZERO;
		let mut transactions = Vec::with_capacity(entries.len());
		for entry in entries {
			let unspent = Unspent::from_value(entry)?;
			if unspent.confirmations > 0 {
				confirmed += unspent.amount;
			} else {
				unconfirmed += unspent.amount;
			}
			transactions.push(AddressTransaction {
				txid: unspent.txid,
				amount: unspent.amount,
				confirmations: unspent.confirmations,
			});
		}
		transactions.sort_by(|a, b| b.confirmations.cmp(&a.confirmations));

		let utxo_count = transactions.len() as u32;
		Ok(BalanceQueryResult { confirmed, unconfirmed, utxo_count, transactions, slow })
	}
}

pub(crate) fn confirmations_at(tip_height: u64, utxo_height: u64) -> u64 {
	if utxo_height == 0 || utxo_height > tip_height {
		return 0;
	}
	tip_height - utxo_height + 1
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn confirmation_arithmetic() {
		assert_eq!(confirmations_at(100, 100), 1);
		assert_eq!(confirmations_at(100, 95), 6);
		// An unconfirmed or unknown height never yields confirmations.
		assert_eq!(confirmations_at(100, 0), 0);
		// A height above the locally known tip can happen right after a reconnect; don't
		// underflow.
		assert_eq!(confirmations_at(100, 101), 0);
	}

	#[test]
	fn descriptor_rejection_matching() {
		assert!(is_descriptor_rejection("Only legacy wallets are supported by this command"));
		assert!(is_descriptor_rejection("Cannot import into a descriptor wallet"));
		assert!(!is_descriptor_rejection("Invalid Bitcoin address or script"));
	}
}
