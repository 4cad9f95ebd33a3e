// This file is Copyright its original authors, visible in version control history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. You may not use this file except in
// accordance with one or both of these licenses.

use crate::config::{Config, ADDRESS_TX_HISTORY_LIMIT};
use crate::event::{Event, EventQueue};
use crate::logger::{log_debug, log_error, log_trace, DynLogger};
use crate::rpc::{RpcError, RpcGateway};
use crate::types::AddressTransaction;
use crate::wallet::{
	import_address_idempotent, BalanceQueryResult, BalanceStrategy, WalletInspector, WalletKind,
};
use crate::Error;

use bitcoin::address::NetworkUnchecked;
use bitcoin::{Address, Amount};

use serde_json::json;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// The last known balance of a watched address.
///
/// An immutable value replacing the previous snapshot on each refresh. A failed refresh yields
/// a zero-valued snapshot carrying the error, never stale data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BalanceSnapshot {
	/// The confirmed amount.
	pub confirmed: Amount,
	/// The amount still waiting for its first confirmation.
	pub unconfirmed: Amount,
	/// The number of unspent outputs backing the balance.
	pub utxo_count: u32,
	/// An estimate of the total balance in fiat cents, if a rate was configured.
	pub fiat_cents: Option<u64>,
	/// When the snapshot was taken, in seconds since the unix epoch. 0 until the first
	/// refresh.
	pub last_updated: u64,
	/// The error that failed the refresh, if it failed.
	pub error: Option<String>,
}

impl BalanceSnapshot {
	pub(crate) fn unknown() -> Self {
		Self {
			confirmed: Amount::ZERO,
			unconfirmed: Amount::ZERO,
			utxo_count: 0,
			fiat_cents: None,
			last_updated: 0,
			error: None,
		}
	}

	pub(crate) fn from_query(
		query: &BalanceQueryResult, fiat_rate_cents_per_btc: Option<u64>, now: u64,
	) -> Self {
		let total = query.confirmed + query.unconfirmed;
		let fiat_cents = fiat_rate_cents_per_btc.map(|rate| fiat_cents_for(total, rate));
		Self {
			confirmed: query.confirmed,
			unconfirmed: query.unconfirmed,
			utxo_count: query.utxo_count,
			fiat_cents,
			last_updated: now,
			error: None,
		}
	}

	pub(crate) fn failed(error: String, now: u64) -> Self {
		Self {
			confirmed: Amount::ZERO,
			unconfirmed: Amount::ZERO,
			utxo_count: 0,
			fiat_cents: None,
			last_updated: now,
			error: Some(error),
		}
	}

	/// The total of confirmed and unconfirmed amounts.
	pub fn total(&self) -> Amount {
		self.confirmed + self.unconfirmed
	}
}

// Integer arithmetic only: sats * cents-per-btc / sats-per-btc, widened to avoid overflow.
fn fiat_cents_for(amount: Amount, rate_cents_per_btc: u64) -> u64 {
	(amount.to_sat() as u128 * rate_cents_per_btc as u128 / 100_000_000u128) as u64
}

struct WatchedAddress {
	snapshot: BalanceSnapshot,
	last_scan_duration: Option<Duration>,
	slow_since: Option<Instant>,
}

impl WatchedAddress {
	fn new() -> Self {
		Self { snapshot: BalanceSnapshot::unknown(), last_scan_duration: None, slow_since: None }
	}

	fn is_throttled(&self, now: Instant, cooldown: Duration) -> bool {
		match self.slow_since {
			Some(marked) => now.saturating_duration_since(marked) < cooldown,
			None => false,
		}
	}
}

/// Owns the set of watched addresses: picks the balance strategy per address, throttles
/// addresses proven to be slow, and emits a snapshot for every refresh attempt.
pub(crate) struct AddressMonitor {
	addresses: RwLock<HashMap<String, WatchedAddress>>,
	imported: RwLock<(u64, HashSet<String>)>,
	tip_height: AtomicU64,
	gateway: Arc<RpcGateway>,
	inspector: Arc<WalletInspector>,
	config: Arc<Config>,
	event_queue: Arc<EventQueue>,
	logger: Arc<DynLogger>,
}

impl AddressMonitor {
	pub(crate) fn new(
		gateway: Arc<RpcGateway>, inspector: Arc<WalletInspector>, config: Arc<Config>,
		event_queue: Arc<EventQueue>, logger: Arc<DynLogger>,
	) -> Self {
		let addresses = RwLock::new(HashMap::new());
		let imported = RwLock::new((0, HashSet::new()));
		let tip_height = AtomicU64::new(0);
		Self { addresses, imported, tip_height, gateway, inspector, config, event_queue, logger }
	}

	/// Starts monitoring the given address. The next polling cycle picks it up.
	pub(crate) fn add_address(&self, address: &str) -> Result<(), Error> {
		let parsed = address
			.parse::<Address<NetworkUnchecked>>()
			.map_err(|_| Error::InvalidAddress)?;
		if parsed.require_network(self.config.network).is_err() {
			return Err(Error::InvalidAddress);
		}

		let mut locked_addresses = self.addresses.write().unwrap();
		locked_addresses.entry(address.to_string()).or_insert_with(WatchedAddress::new);
		Ok(())
	}

	/// Stops monitoring the given address.
	pub(crate) fn remove_address(&self, address: &str) {
		let mut locked_addresses = self.addresses.write().unwrap();
		locked_addresses.remove(address);
	}

	pub(crate) fn list_addresses(&self) -> Vec<String> {
		self.addresses.read().unwrap().keys().cloned().collect()
	}

	/// The last known snapshot for the given address, if it is being watched.
	pub(crate) fn balance(&self, address: &str) -> Option<BalanceSnapshot> {
		self.addresses.read().unwrap().get(address).map(|watched| watched.snapshot.clone())
	}

	pub(crate) fn set_tip_height(&self, height: u64) {
		self.tip_height.store(height, Ordering::Release);
	}

	/// Refreshes every watched address that is not currently throttled. Returns whether all
	/// refreshes succeeded.
	pub(crate) async fn refresh_all(&self, generation: u64) -> bool {
		let cooldown = Duration::from_secs(self.config.slow_address_cooldown_secs);
		let now = Instant::now();
		let targets: Vec<String> = {
			let locked_addresses = self.addresses.read().unwrap();
			locked_addresses
				.iter()
				.filter(|(_, watched)| !watched.is_throttled(now, cooldown))
				.map(|(address, _)| address.clone())
				.collect()
		};

		if targets.is_empty() {
			return true;
		}

		let kind = self.inspector.wallet_kind(generation).await;
		let mut all_succeeded = true;
		for address in targets {
			if !self.refresh_balance(&address, kind, generation).await {
				all_succeeded = false;
			}
		}
		all_succeeded
	}

	/// Refreshes a single address and emits the resulting snapshot, zero-valued and
	/// error-tagged if the refresh failed. Returns whether it succeeded.
	pub(crate) async fn refresh_balance(
		&self, address: &str, kind: WalletKind, generation: u64,
	) -> bool {
		let started = Instant::now();
		let result = self.query_with_fallback(address, kind, generation).await;
		let elapsed = started.elapsed();
		let now = unix_time_secs();

		match result {
			Ok(query) => {
				let slow = query.slow || elapsed >= self.gateway.slow_call_threshold();
				let snapshot = {
					let mut locked_addresses = self.addresses.write().unwrap();
					let watched = match locked_addresses.get_mut(address) {
						Some(watched) => watched,
						// Removed while the query was in flight.
						None => return true,
					};
					watched.last_scan_duration = Some(elapsed);
					if slow {
						if watched.slow_since.is_none() {
							log_debug!(
								self.logger,
								"Scan for {} took {}ms, throttling it for {}s.",
								address,
								elapsed.as_millis(),
								self.config.slow_address_cooldown_secs
							);
						}
						watched.slow_since = Some(Instant::now());
					} else {
						watched.slow_since = None;
					}
					watched.snapshot = BalanceSnapshot::from_query(
						&query,
						self.config.fiat_rate_cents_per_btc,
						now,
					);
					watched.snapshot.clone()
				};

				self.event_queue.add_event(Event::AddressBalanceUpdated {
					address: address.to_string(),
					snapshot,
				});
				self.emit_transactions(address, query.transactions).await;
				true
			},
			Err(e) => {
				let snapshot = BalanceSnapshot::failed(e.message.clone(), now);
				{
					let mut locked_addresses = self.addresses.write().unwrap();
					if let Some(watched) = locked_addresses.get_mut(address) {
						watched.last_scan_duration = Some(elapsed);
						watched.snapshot = snapshot.clone();
					} else {
						return true;
					}
				}
				log_error!(self.logger, "Failed to refresh balance for {}: {}", address, e);
				self.event_queue.add_event(Event::AddressBalanceUpdated {
					address: address.to_string(),
					snapshot,
				});
				false
			},
		}
	}

	async fn query_with_fallback(
		&self, address: &str, kind: WalletKind, generation: u64,
	) -> Result<BalanceQueryResult, RpcError> {
		let tip_height = self.tip_height.load(Ordering::Acquire);

		match BalanceStrategy::UtxoScan.query(&self.gateway, address, tip_height).await {
			Ok(query) => return Ok(query),
			Err(e) => {
				log_trace!(
					self.logger,
					"UTXO scan for {} failed ({}), falling back to wallet lookup.",
					address,
					e
				);
			},
		}

		if kind == WalletKind::Legacy {
			self.ensure_imported(address, generation).await?;
		}
		BalanceStrategy::WalletIndex.query(&self.gateway, address, tip_height).await
	}

	async fn ensure_imported(&self, address: &str, generation: u64) -> Result<(), RpcError> {
		{
			let locked_imported = self.imported.read().unwrap();
			if locked_imported.0 == generation && locked_imported.1.contains(address) {
				return Ok(());
			}
		}

		import_address_idempotent(&self.gateway, address).await?;

		let mut locked_imported = self.imported.write().unwrap();
		if locked_imported.0 != generation {
			// A reconnect happened; the node-side wallet may have changed.
			*locked_imported = (generation, HashSet::new());
		}
		locked_imported.1.insert(address.to_string());
		Ok(())
	}

	// Derived history is opportunistic: whatever coins the balance query surfaced, with
	// vanished unconfirmed entries pruned via the mempool.
	async fn emit_transactions(&self, address: &str, transactions: Vec<AddressTransaction>) {
		let mut kept = Vec::with_capacity(transactions.len().min(ADDRESS_TX_HISTORY_LIMIT));
		for transaction in transactions.into_iter().take(ADDRESS_TX_HISTORY_LIMIT) {
			if transaction.confirmations == 0
				&& !self.tx_still_known(&transaction.txid.to_string()).await
			{
				log_trace!(
					self.logger,
					"Dropping vanished unconfirmed transaction {} for {}.",
					transaction.txid,
					address
				);
				continue;
			}
			kept.push(transaction);
		}

		self.event_queue.add_event(Event::AddressTransactionsUpdated {
			address: address.to_string(),
			transactions: kept,
		});
	}

	async fn tx_still_known(&self, txid: &str) -> bool {
		let outcome = self.gateway.call("getrawtransaction", vec![json!(txid)]).await;
		match outcome.into_result() {
			Ok(_) => true,
			// The node's "not found" answer is definite; everything else we treat as "still
			// known" rather than dropping history on a hiccup.
			Err(e) => !e.message.contains("No such mempool"),
		}
	}
}

pub(crate) fn unix_time_secs() -> u64 {
	SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn throttle_window_arithmetic() {
		let mut watched = WatchedAddress::new();
		let cooldown = Duration::from_secs(300);
		let marked = Instant::now();

		assert!(!watched.is_throttled(marked, cooldown));

		watched.slow_since = Some(marked);
		assert!(watched.is_throttled(marked, cooldown));
		assert!(watched.is_throttled(marked + Duration::from_secs(299), cooldown));
		// At the cool-down boundary the next scan is allowed again.
		assert!(!watched.is_throttled(marked + Duration::from_secs(300), cooldown));
		assert!(!watched.is_throttled(marked + Duration::from_secs(301), cooldown));
	}

	#[test]
	fn failed_snapshot_is_zero_valued_and_tagged() {
		let snapshot = BalanceSnapshot::failed("scan failed".to_string(), 1700000000);
		assert_eq!(snapshot.confirmed, Amount::ZERO);
		assert_eq!(snapshot.unconfirmed, Amount::ZERO);
		assert_eq!(snapshot.utxo_count, 0);
		assert_eq!(snapshot.total(), Amount::ZERO);
		assert_eq!(snapshot.error.as_deref(), Some("scan failed"));
		assert_eq!(snapshot.last_updated, 1700000000);
	}

	#[test]
	fn fiat_estimate_uses_integer_arithmetic() {
		// 1 BTC at $100,000.00/BTC.
		assert_eq!(fiat_cents_for(Amount::from_btc(1.0).unwrap(), 10_000_000), 10_000_000);
		// 0.5 BTC at $60,000.00/BTC = $30,000.00.
		assert_eq!(fiat_cents_for(Amount::from_btc(0.5).unwrap(), 6_000_000), 3_000_000);
		// The full supply at a high rate must not overflow.
		let supply = Amount::from_sat(2_100_000_000_000_000);
		assert_eq!(fiat_cents_for(supply, 100_000_000), 2_100_000_000_000_000);
	}
}
