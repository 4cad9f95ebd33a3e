// This file is Copyright its original authors, visible in version control history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. You may not use this file except in
// accordance with one or both of these licenses.

//! A library providing a simplified API for monitoring and spending against a Bitcoin Core
//! node over JSON-RPC.
//!
//! The client is built to survive a node that is slow, syncing, rate-limited, or
//! intermittently unreachable, without flooding it with requests or freezing the caller:
//! - A single background polling loop drives all periodic RPC traffic, adapting its own period
//!   to the observed success or failure of each cycle.
//! - RPC failures are classified rather than raised: expected transient conditions only change
//!   scheduling behavior and are never surfaced as user-visible errors.
//! - Watched addresses that prove expensive to scan are throttled for a cool-down instead of
//!   stalling the polling loop over and over.
//! - While the node is still verifying the chain, only cheap sync-progress probes are issued.
//!
//! State changes are surfaced through an event queue the embedding application drains via
//! [`NodeClient::next_event`], [`NodeClient::wait_next_event`], or
//! [`NodeClient::next_event_async`], acknowledging each with [`NodeClient::event_handled`].

#![deny(rustdoc::broken_intra_doc_links)]
#![deny(rustdoc::private_intra_doc_links)]
#![deny(missing_docs)]

mod builder;
mod chain;
mod config;
mod connection;
mod error;
mod event;
mod logger;
mod monitor;
mod rpc;
#[cfg(test)]
mod test;
mod tx_builder;
mod types;
mod wallet;

pub use builder::Builder;
pub use config::{default_config, Config};
pub use connection::NodeStatus;
pub use error::Error;
pub use event::Event;
pub use logger::LogLevel;
pub use monitor::BalanceSnapshot;
pub use rpc::{RpcError, RpcErrorKind};
pub use tx_builder::{SpendStage, TransactionResult};
pub use types::{
	AddressTransaction, BlockSummary, BlockchainInfo, MempoolInfo, NetworkInfo, PeerSummary,
};

use crate::chain::ChainPoller;
use crate::connection::ConnectionManager;
use crate::event::EventQueue;
use crate::logger::{log_info, DynLogger};
use crate::monitor::AddressMonitor;
use crate::rpc::RpcGateway;
use crate::tx_builder::TxBuilder;

use bitcoin::Amount;

use std::sync::{Arc, RwLock};
use std::time::Duration;

/// The main interface object of the client.
///
/// Needs to be initialized and instantiated through [`Builder::build`]. All methods are safe
/// to call from an interactive thread: network traffic happens on a background runtime owned
/// by this object.
pub struct NodeClient {
	pub(crate) runtime: RwLock<Option<tokio::runtime::Runtime>>,
	pub(crate) stop_sender: RwLock<Option<tokio::sync::watch::Sender<()>>>,
	pub(crate) config: Arc<Config>,
	pub(crate) gateway: Arc<RpcGateway>,
	pub(crate) connection_manager: Arc<ConnectionManager>,
	pub(crate) address_monitor: Arc<AddressMonitor>,
	pub(crate) tx_builder: Arc<TxBuilder>,
	pub(crate) chain_poller: Arc<ChainPoller>,
	pub(crate) event_queue: Arc<EventQueue>,
	pub(crate) logger: Arc<DynLogger>,
}

impl NodeClient {
	/// Starts the background polling task. After this returns, the instance can be controlled
	/// via the provided API methods in a thread-safe manner.
	pub fn start(&self) -> Result<(), Error> {
		// Acquire a run lock and hold it until we're setup.
		let mut run_lock = self.runtime.write().unwrap();
		if run_lock.is_some() {
			return Err(Error::AlreadyRunning);
		}

		let runtime = tokio::runtime::Builder::new_multi_thread()
			.enable_all()
			.build()
			.expect("Failed to build tokio runtime");

		let (stop_sender, stop_receiver) = tokio::sync::watch::channel(());
		let chain_poller = Arc::clone(&self.chain_poller);
		runtime.spawn(async move {
			chain_poller.continuously_poll(stop_receiver).await;
		});

		*self.stop_sender.write().unwrap() = Some(stop_sender);
		*run_lock = Some(runtime);

		log_info!(
			self.logger,
			"Node client started, polling {}:{}.",
			self.config.rpc_host,
			self.config.rpc_port
		);
		Ok(())
	}

	/// Stops the background polling task and drops the connection.
	pub fn stop(&self) -> Result<(), Error> {
		let mut run_lock = self.runtime.write().unwrap();
		if run_lock.is_none() {
			return Err(Error::NotRunning);
		}

		if let Some(stop_sender) = self.stop_sender.write().unwrap().take() {
			let _ = stop_sender.send(());
		}

		// Drop the runtime, which stops any possibly remaining in-flight tasks.
		if let Some(runtime) = run_lock.take() {
			runtime.shutdown_timeout(Duration::from_secs(10));
		}

		self.connection_manager.disconnect();
		log_info!(self.logger, "Node client stopped.");
		Ok(())
	}

	/// Connects to the node, retrying transient failures with progressive backoff.
	///
	/// The background polling task reconnects on its own; this is for callers that want to
	/// establish the session eagerly and learn about the outcome.
	pub fn connect(&self) -> Result<(), Error> {
		let run_lock = self.runtime.read().unwrap();
		let runtime = run_lock.as_ref().ok_or(Error::NotRunning)?;
		runtime.block_on(self.connection_manager.connect())
	}

	/// Drops the connection to the node without stopping the background task.
	pub fn disconnect(&self) {
		self.connection_manager.disconnect();
	}

	/// The current lifecycle state of the connection to the node.
	pub fn status(&self) -> NodeStatus {
		self.connection_manager.status()
	}

	/// Starts monitoring the given address. Its balance is refreshed on every polling cycle
	/// and surfaced via [`Event::AddressBalanceUpdated`].
	pub fn add_address(&self, address: &str) -> Result<(), Error> {
		self.address_monitor.add_address(address)
	}

	/// Stops monitoring the given address.
	pub fn remove_address(&self, address: &str) {
		self.address_monitor.remove_address(address)
	}

	/// Returns the currently watched addresses.
	pub fn list_addresses(&self) -> Vec<String> {
		self.address_monitor.list_addresses()
	}

	/// Returns the last known balance snapshot for the given address, if it is being watched.
	pub fn balance(&self, address: &str) -> Option<BalanceSnapshot> {
		self.address_monitor.balance(address)
	}

	/// Sends the given amount of satoshis to the given address.
	///
	/// When `from_address` is set, only that address' coins are drawn on; otherwise the whole
	/// wallet is. When `fee_rate_sat_per_vb` is unset, a fee estimate is requested from the
	/// node, falling back to the configured default rate.
	///
	/// Blocks until the spend reached a terminal state. Concurrent sends from the same source
	/// are serialized.
	pub fn send(
		&self, to_address: &str, amount_sats: u64, fee_rate_sat_per_vb: Option<u64>,
		from_address: Option<&str>,
	) -> Result<TransactionResult, Error> {
		let run_lock = self.runtime.read().unwrap();
		let runtime = run_lock.as_ref().ok_or(Error::NotRunning)?;
		runtime.block_on(self.tx_builder.send(
			to_address,
			Amount::from_sat(amount_sats),
			fee_rate_sat_per_vb,
			from_address,
		))
	}

	/// Executes a raw RPC call against the node. An escape hatch for less common queries.
	pub fn raw_call(
		&self, method: &str, params: Vec<serde_json::Value>,
	) -> Result<serde_json::Value, Error> {
		let run_lock = self.runtime.read().unwrap();
		let runtime = run_lock.as_ref().ok_or(Error::NotRunning)?;
		runtime
			.block_on(async { self.gateway.call(method, params).await.into_result() })
			.map_err(|e| match e.kind {
				RpcErrorKind::Unauthorized => Error::Unauthorized,
				_ => Error::RpcFailed,
			})
	}

	/// Returns the next event in the event queue, if currently available.
	///
	/// **Note:** this will always return the same event until handling is confirmed via
	/// [`NodeClient::event_handled`].
	pub fn next_event(&self) -> Option<Event> {
		self.event_queue.next_event()
	}

	/// Returns the next event in the event queue, blocking until one is available.
	///
	/// **Note:** this will always return the same event until handling is confirmed via
	/// [`NodeClient::event_handled`].
	pub fn wait_next_event(&self) -> Event {
		self.event_queue.wait_next_event()
	}

	/// Returns the next event in the event queue, waiting asynchronously until one is
	/// available.
	///
	/// **Note:** this will always return the same event until handling is confirmed via
	/// [`NodeClient::event_handled`].
	pub async fn next_event_async(&self) -> Event {
		self.event_queue.next_event_async().await
	}

	/// Confirms the last retrieved event was handled, making the next one retrievable.
	pub fn event_handled(&self) {
		self.event_queue.event_handled()
	}
}

impl Drop for NodeClient {
	fn drop(&mut self) {
		let _ = self.stop();
	}
}
