// This file is Copyright its original authors, visible in version control history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. You may not use this file except in
// accordance with one or both of these licenses.

use crate::chain::{ChainPoller, SchedulerState};
use crate::config::Config;
use crate::connection::{AdaptiveTimeout, ConnectionManager, HostProfile};
use crate::event::EventQueue;
use crate::logger::{DynLogger, FilesystemLogger, LogLevel};
use crate::monitor::AddressMonitor;
use crate::rpc::{HttpRpcTransport, RpcGateway, RpcTransport};
use crate::tx_builder::TxBuilder;
use crate::wallet::WalletInspector;
use crate::NodeClient;

use bitcoin::Network;

use std::sync::{Arc, RwLock};
use std::time::Duration;

const DEFAULT_LOG_DIR_PATH: &str = "/tmp/bitcoind_client/logs";

/// A builder for a [`NodeClient`] instance, allowing to set some configuration from the getgo.
#[derive(Debug, Clone)]
pub struct Builder {
	config: Config,
}

impl Builder {
	/// Creates a new builder instance with the default configuration.
	pub fn new() -> Self {
		let config = Config::default();
		Self { config }
	}

	/// Creates a new builder instance from a [`Config`].
	pub fn from_config(config: Config) -> Self {
		Self { config }
	}

	/// Sets the host and port of the node's RPC interface.
	pub fn set_rpc_endpoint(&mut self, host: String, port: u16) -> &mut Self {
		self.config.rpc_host = host;
		self.config.rpc_port = port;
		self
	}

	/// Sets the RPC credentials.
	pub fn set_rpc_credentials(&mut self, user: String, password: String) -> &mut Self {
		self.config.rpc_user = user;
		self.config.rpc_password = password;
		self
	}

	/// Sets the node wallet RPC calls are routed to.
	pub fn set_wallet_name(&mut self, wallet_name: String) -> &mut Self {
		self.config.wallet_name = Some(wallet_name);
		self
	}

	/// Sets the Bitcoin network used.
	pub fn set_network(&mut self, network: Network) -> &mut Self {
		self.config.network = network;
		self
	}

	/// Sets the used log directory path.
	pub fn set_log_dir_path(&mut self, log_dir_path: String) -> &mut Self {
		self.config.log_dir_path = Some(log_dir_path);
		self
	}

	/// Sets the level at which we log messages.
	pub fn set_log_level(&mut self, log_level: LogLevel) -> &mut Self {
		self.config.log_level = log_level;
		self
	}

	/// Sets the bounds the adaptive polling interval moves between, in seconds.
	pub fn set_poll_interval_bounds(&mut self, min_secs: u64, max_secs: u64) -> &mut Self {
		self.config.poll_interval_min_secs = min_secs;
		self.config.poll_interval_max_secs = max_secs;
		self
	}

	/// Sets the cool-down applied to addresses whose scans proved slow, in seconds.
	pub fn set_slow_address_cooldown(&mut self, cooldown_secs: u64) -> &mut Self {
		self.config.slow_address_cooldown_secs = cooldown_secs;
		self
	}

	/// Sets the fiat rate used for balance estimates, in cents per whole bitcoin.
	pub fn set_fiat_rate_cents_per_btc(&mut self, rate: u64) -> &mut Self {
		self.config.fiat_rate_cents_per_btc = Some(rate);
		self
	}

	/// Builds a [`NodeClient`] instance according to the options previously configured.
	pub fn build(&self) -> NodeClient {
		let transport = Arc::new(HttpRpcTransport::new(
			self.config.rpc_host.clone(),
			self.config.rpc_port,
			self.config.rpc_user.clone(),
			self.config.rpc_password.clone(),
			self.config.wallet_name.clone(),
		));
		self.build_with_transport(transport)
	}

	pub(crate) fn build_with_transport(&self, transport: Arc<dyn RpcTransport>) -> NodeClient {
		let config = Arc::new(self.config.clone());

		let log_dir_path =
			config.log_dir_path.clone().unwrap_or_else(|| DEFAULT_LOG_DIR_PATH.to_string());
		let logger: Arc<DynLogger> =
			Arc::new(FilesystemLogger::new(log_dir_path, config.log_level));

		let host_profile = HostProfile::detect();
		let timeout = Arc::new(AdaptiveTimeout::new(
			host_profile.baseline_rpc_timeout(),
			Duration::from_secs(config.rpc_timeout_cap_secs),
		));
		let gateway = Arc::new(RpcGateway::new(
			transport,
			Arc::clone(&timeout),
			host_profile.slow_call_threshold(),
			Arc::clone(&logger),
		));

		let event_queue = Arc::new(EventQueue::new());
		let connection_manager = Arc::new(ConnectionManager::new(
			Arc::clone(&gateway),
			Arc::clone(&timeout),
			Arc::clone(&config),
			Arc::clone(&event_queue),
			Arc::clone(&logger),
		));
		let wallet_inspector =
			Arc::new(WalletInspector::new(Arc::clone(&gateway), Arc::clone(&logger)));
		let address_monitor = Arc::new(AddressMonitor::new(
			Arc::clone(&gateway),
			Arc::clone(&wallet_inspector),
			Arc::clone(&config),
			Arc::clone(&event_queue),
			Arc::clone(&logger),
		));
		let tx_builder = Arc::new(TxBuilder::new(
			Arc::clone(&gateway),
			Arc::clone(&config),
			Arc::clone(&event_queue),
			Arc::clone(&logger),
		));

		let scheduler = SchedulerState::new(
			config.poll_interval_min_secs.max(host_profile.poll_interval_floor_secs()),
			config.poll_interval_max_secs,
			config.poll_relax_step_secs,
		);
		let chain_poller = Arc::new(ChainPoller::new(
			Arc::clone(&gateway),
			Arc::clone(&connection_manager),
			Arc::clone(&address_monitor),
			scheduler,
			Arc::clone(&config),
			Arc::clone(&event_queue),
			Arc::clone(&logger),
		));

		NodeClient {
			runtime: RwLock::new(None),
			stop_sender: RwLock::new(None),
			config,
			gateway,
			connection_manager,
			address_monitor,
			tx_builder,
			chain_poller,
			event_queue,
			logger,
		}
	}
}

impl Default for Builder {
	fn default() -> Self {
		Self::new()
	}
}
