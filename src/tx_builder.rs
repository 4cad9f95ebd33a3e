// This file is Copyright its original authors, visible in version control history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. You may not use this file except in
// accordance with one or both of these licenses.

use crate::config::Config;
use crate::event::{Event, EventQueue};
use crate::logger::{log_debug, log_error, log_info, log_trace, DynLogger};
use crate::rpc::{FeeRateEstimationMode, RpcGateway};
use crate::types::{sat_per_vb_from_btc_per_kvb, Unspent};
use crate::Error;

use bitcoin::address::NetworkUnchecked;
use bitcoin::{Address, Amount, Denomination, Txid};

use serde_json::{json, Map, Value};

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

// The lock key used for spends drawing on the whole wallet.
const WALLET_SOURCE: &str = "*wallet*";

// Estimated transaction weight in vbytes: overhead plus per-input and per-output cost.
const TX_OVERHEAD_VBYTES: u64 = 10;
const INPUT_VBYTES: u64 = 148;
const OUTPUT_VBYTES: u64 = 34;

/// The step of a spend that failed.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SpendStage {
	/// Collecting inputs and constructing the raw transaction.
	Build,
	/// Having the node sign the transaction.
	Sign,
	/// Handing the signed transaction to the node for broadcast.
	Broadcast,
}

/// The terminal outcome of a successful spend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionResult {
	/// The id of the broadcast transaction.
	pub txid: Txid,
	/// The amount sent to the destination.
	pub amount: Amount,
	/// The fee paid.
	pub fee: Amount,
	/// The change returned to the wallet. [`Amount::ZERO`] when the excess was below the dust
	/// threshold and absorbed into the fee.
	pub change: Amount,
	/// The serialized unsigned transaction.
	pub raw_hex: String,
	/// The serialized signed transaction.
	pub signed_hex: String,
}

struct InputSelection {
	inputs: Vec<Unspent>,
	fee: Amount,
	change: Amount,
}

/// Builds, signs, and broadcasts spends through the node, one step at a time so failures can
/// be attributed to the step that caused them.
pub(crate) struct TxBuilder {
	gateway: Arc<RpcGateway>,
	config: Arc<Config>,
	event_queue: Arc<EventQueue>,
	logger: Arc<DynLogger>,
	send_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl TxBuilder {
	pub(crate) fn new(
		gateway: Arc<RpcGateway>, config: Arc<Config>, event_queue: Arc<EventQueue>,
		logger: Arc<DynLogger>,
	) -> Self {
		let send_locks = Mutex::new(HashMap::new());
		Self { gateway, config, event_queue, logger, send_locks }
	}

	/// Sends the given amount to the given address, optionally drawing only on the coins of a
	/// specific source address.
	///
	/// Concurrent sends from the same source are serialized: a second send racing the first
	/// could otherwise double-spend the same inputs.
	pub(crate) async fn send(
		&self, to_address: &str, amount: Amount, fee_rate_sat_per_vb: Option<u64>,
		from_address: Option<&str>,
	) -> Result<TransactionResult, Error> {
		let parsed = to_address
			.parse::<Address<NetworkUnchecked>>()
			.map_err(|_| Error::InvalidAddress)?;
		if parsed.require_network(self.config.network).is_err() {
			return Err(Error::InvalidAddress);
		}
		if amount == Amount::ZERO {
			return Err(Error::InvalidAmount);
		}
		if fee_rate_sat_per_vb == Some(0) {
			return Err(Error::InvalidAmount);
		}

		let spend_lock = self.spend_lock(from_address.unwrap_or(WALLET_SOURCE));
		let _guard = spend_lock.lock().await;

		self.send_locked(to_address, amount, fee_rate_sat_per_vb, from_address).await
	}

	async fn send_locked(
		&self, to_address: &str, amount: Amount, fee_rate_sat_per_vb: Option<u64>,
		from_address: Option<&str>,
	) -> Result<TransactionResult, Error> {
		let utxos = self.collect_unspent(from_address).await?;

		let fee_rate = match fee_rate_sat_per_vb {
			Some(rate) => rate,
			None => self.estimate_fee_rate().await,
		};

		let selection = match select_inputs(
			&utxos,
			amount,
			fee_rate,
			self.config.dust_threshold_sats,
		) {
			Ok(selection) => selection,
			Err(e) => {
				debug_assert_eq!(e, Error::InsufficientFunds);
				log_error!(
					self.logger,
					"Insufficient funds: {} sats available, {} sats requested.",
					utxos.iter().map(|u| u.amount.to_sat()).sum::<u64>(),
					amount.to_sat()
				);
				self.event_queue.add_event(Event::TransactionFailed {
					stage: SpendStage::Build,
					detail: "Insufficient funds".to_string(),
				});
				return Err(e);
			},
		};

		let change_address = if selection.change > Amount::ZERO {
			Some(self.change_address().await?)
		} else {
			None
		};

		let raw_hex = self.create_raw(to_address, amount, &selection, change_address).await?;
		self.event_queue.add_event(Event::TransactionCreated { raw_hex: raw_hex.clone() });

		let signed_hex = self.sign(&raw_hex).await?;
		self.event_queue.add_event(Event::TransactionSigned { signed_hex: signed_hex.clone() });

		let txid = self.broadcast(&signed_hex).await?;
		self.event_queue.add_event(Event::TransactionBroadcast { txid });

		log_info!(
			self.logger,
			"Created new transaction {} sending {}sats on-chain to address {}.",
			txid,
			amount.to_sat(),
			to_address
		);

		Ok(TransactionResult {
			txid,
			amount,
			fee: selection.fee,
			change: selection.change,
			raw_hex,
			signed_hex,
		})
	}

	async fn collect_unspent(&self, from_address: Option<&str>) -> Result<Vec<Unspent>, Error> {
		let params = match from_address {
			Some(address) => vec![json!(1), json!(9999999), json!([address])],
			None => vec![json!(1), json!(9999999)],
		};

		let value = self
			.gateway
			.call("listunspent", params)
			.await
			.into_result()
			.map_err(|e| self.fail(SpendStage::Build, &e.message))?;
		let entries = value
			.as_array()
			.ok_or_else(|| self.fail(SpendStage::Build, "Failed to parse listunspent response"))?;

		entries
			.iter()
			.map(Unspent::from_value)
			.collect::<Result<Vec<_>, _>>()
			.map_err(|e| self.fail(SpendStage::Build, &e.message))
	}

	async fn estimate_fee_rate(&self) -> u64 {
		let mode = serde_json::to_value(FeeRateEstimationMode::Economical)
			.unwrap_or_else(|_| json!("ECONOMICAL"));
		let params = vec![json!(self.config.fee_target_blocks), mode];
		match self.gateway.call("estimatesmartfee", params).await.into_result() {
			Ok(value) => {
				if let Some(btc_per_kvb) = value.get("feerate").and_then(|f| f.as_f64()) {
					let rate = sat_per_vb_from_btc_per_kvb(btc_per_kvb).max(1);
					log_trace!(self.logger, "Fee rate estimation updated: {} sat/vB.", rate);
					return rate;
				}
			},
			Err(e) => {
				log_trace!(self.logger, "Fee rate estimation failed: {}", e);
			},
		}

		// We'll fall back on this, if we really don't have any other information.
		log_debug!(
			self.logger,
			"Falling back to the configured fee rate of {} sat/vB.",
			self.config.fallback_fee_rate_sat_per_vb
		);
		self.config.fallback_fee_rate_sat_per_vb.max(1)
	}

	async fn change_address(&self) -> Result<String, Error> {
		let value = self
			.gateway
			.call("getrawchangeaddress", vec![])
			.await
			.into_result()
			.map_err(|e| self.fail(SpendStage::Build, &e.message))?;
		value.as_str().map(|s| s.to_string()).ok_or_else(|| {
			self.fail(SpendStage::Build, "Failed to parse getrawchangeaddress response")
		})
	}

	async fn create_raw(
		&self, to_address: &str, amount: Amount, selection: &InputSelection,
		change_address: Option<String>,
	) -> Result<String, Error> {
		let inputs: Vec<Value> = selection
			.inputs
			.iter()
			.map(|unspent| json!({ "txid": unspent.txid.to_string(), "vout": unspent.vout }))
			.collect();

		// Amounts cross the RPC boundary as exact decimal strings, never floats.
		let mut outputs = Map::new();
		outputs.insert(to_address.to_string(), json!(btc_string(amount)));
		if let Some(change_address) = change_address {
			outputs.insert(change_address, json!(btc_string(selection.change)));
		}

		let value = self
			.gateway
			.call("createrawtransaction", vec![json!(inputs), Value::Object(outputs)])
			.await
			.into_result()
			.map_err(|e| self.fail(SpendStage::Build, &e.message))?;
		value.as_str().map(|s| s.to_string()).ok_or_else(|| {
			self.fail(SpendStage::Build, "Failed to parse createrawtransaction response")
		})
	}

	async fn sign(&self, raw_hex: &str) -> Result<String, Error> {
		let value = self
			.gateway
			.call("signrawtransactionwithwallet", vec![json!(raw_hex)])
			.await
			.into_result()
			.map_err(|e| self.fail(SpendStage::Sign, &e.message))?;

		let complete = value.get("complete").and_then(|c| c.as_bool()).unwrap_or(false);
		let hex = value.get("hex").and_then(|h| h.as_str());
		match (complete, hex) {
			(true, Some(hex)) => Ok(hex.to_string()),
			_ => Err(self.fail(SpendStage::Sign, "The node could not fully sign the transaction")),
		}
	}

	async fn broadcast(&self, signed_hex: &str) -> Result<Txid, Error> {
		let value = self
			.gateway
			.call("sendrawtransaction", vec![json!(signed_hex)])
			.await
			.into_result()
			.map_err(|e| self.fail(SpendStage::Broadcast, &e.message))?;
		value.as_str().and_then(|s| Txid::from_str(s).ok()).ok_or_else(|| {
			self.fail(SpendStage::Broadcast, "Failed to parse sendrawtransaction response")
		})
	}

	fn fail(&self, stage: SpendStage, detail: &str) -> Error {
		log_error!(self.logger, "Transaction {:?} step failed: {}", stage, detail);
		self.event_queue
			.add_event(Event::TransactionFailed { stage, detail: detail.to_string() });
		match stage {
			SpendStage::Build => Error::TxBuildFailed,
			SpendStage::Sign => Error::TxSignFailed,
			SpendStage::Broadcast => Error::TxBroadcastRejected,
		}
	}

	fn spend_lock(&self, source: &str) -> Arc<tokio::sync::Mutex<()>> {
		let mut locked_send_locks = self.send_locks.lock().unwrap();
		Arc::clone(
			locked_send_locks
				.entry(source.to_string())
				.or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
		)
	}
}

// Greedily accumulates inputs in listed order until they cover amount plus the fee, which is
// recomputed as the input count grows.
fn select_inputs(
	utxos: &[Unspent], amount: Amount, fee_rate_sat_per_vb: u64, dust_threshold_sats: u64,
) -> Result<InputSelection, Error> {
	let mut inputs = Vec::new();
	let mut total = Amount::ZERO;
	let mut fee = Amount::ZERO;
	let mut covered = false;

	for utxo in utxos {
		if !utxo.spendable {
			continue;
		}
		inputs.push(utxo.clone());
		total += utxo.amount;
		// Assume a destination and a change output while selecting; a sub-dust excess folds
		// the change back into the fee below.
		fee = estimate_fee(inputs.len(), 2, fee_rate_sat_per_vb);
		if total >= amount + fee {
			covered = true;
			break;
		}
	}

	if !covered {
		return Err(Error::InsufficientFunds);
	}

	let excess = total - amount - fee;
	if excess.to_sat() > dust_threshold_sats {
		Ok(InputSelection { inputs, fee, change: excess })
	} else {
		let fee = total - amount;
		Ok(InputSelection { inputs, fee, change: Amount::ZERO })
	}
}

fn estimate_fee(input_count: usize, output_count: usize, fee_rate_sat_per_vb: u64) -> Amount {
	let vbytes = TX_OVERHEAD_VBYTES
		+ INPUT_VBYTES * input_count as u64
		+ OUTPUT_VBYTES * output_count as u64;
	Amount::from_sat(fee_rate_sat_per_vb * vbytes)
}

fn btc_string(amount: Amount) -> String {
	amount.to_string_in(Denomination::Bitcoin)
}

#[cfg(test)]
mod tests {
	use super::*;

	fn utxo(sats: u64) -> Unspent {
		let txid = Txid::from_str(
			"0000000000000000000000000000000000000000000000000000000000000001",
		)
		.unwrap();
		Unspent {
			txid,
			vout: 0,
			amount: Amount::from_sat(sats),
			confirmations: 6,
			address: None,
			spendable: true,
		}
	}

	#[test]
	fn selection_conserves_amounts() {
		let utxos = vec![utxo(50_000), utxo(80_000), utxo(200_000)];
		let amount = Amount::from_sat(100_000);
		let selection = select_inputs(&utxos, amount, 5, 546).unwrap();

		let total: Amount = selection.inputs.iter().map(|u| u.amount).sum();
		assert_eq!(total, amount + selection.fee + selection.change);
		assert!(selection.fee > Amount::ZERO);
		assert!(selection.change > Amount::ZERO);
		// Inputs accumulate in listed order.
		assert_eq!(selection.inputs.len(), 3);
	}

	#[test]
	fn fee_grows_with_input_count() {
		assert_eq!(estimate_fee(1, 2, 5), Amount::from_sat(5 * (10 + 148 + 68)));
		assert!(estimate_fee(3, 2, 5) > estimate_fee(1, 2, 5));
	}

	#[test]
	fn sub_dust_excess_is_absorbed_into_fee() {
		// One input covering amount + fee with 100 sats to spare: below dust, so no change
		// output and the spare goes to the fee.
		let fee = estimate_fee(1, 2, 5);
		let amount = Amount::from_sat(50_000);
		let utxos = vec![utxo(50_000 + fee.to_sat() + 100)];
		let selection = select_inputs(&utxos, amount, 5, 546).unwrap();

		assert_eq!(selection.change, Amount::ZERO);
		assert_eq!(selection.fee, fee + Amount::from_sat(100));

		let total: Amount = selection.inputs.iter().map(|u| u.amount).sum();
		assert_eq!(total, amount + selection.fee);
	}

	#[test]
	fn insufficient_funds_is_detected() {
		let utxos = vec![utxo(1_000), utxo(1_000)];
		let amount = Amount::from_sat(10_000_000_000);
		assert!(matches!(select_inputs(&utxos, amount, 5, 546), Err(Error::InsufficientFunds)));

		// An empty UTXO set can cover nothing.
		assert!(matches!(
			select_inputs(&[], Amount::from_sat(1), 5, 546),
			Err(Error::InsufficientFunds)
		));
	}

	#[test]
	fn unspendable_outputs_are_skipped() {
		let mut frozen = utxo(1_000_000);
		frozen.spendable = false;
		let utxos = vec![frozen, utxo(1_000_000)];
		let selection = select_inputs(&utxos, Amount::from_sat(100_000), 5, 546).unwrap();
		assert_eq!(selection.inputs.len(), 1);
		assert!(selection.inputs[0].spendable);
	}

	#[test]
	fn amounts_serialize_as_exact_decimal_strings() {
		assert_eq!(btc_string(Amount::from_sat(12345)), "0.00012345");
		assert_eq!(btc_string(Amount::from_sat(110_000_000)), "1.1");
	}
}
