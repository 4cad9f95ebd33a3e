// This file is Copyright its original authors, visible in version control history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. You may not use this file except in
// accordance with one or both of these licenses.

use crate::logger::LogLevel;

use bitcoin::Network;

use std::time::Duration;

// Config defaults
const DEFAULT_RPC_HOST: &str = "127.0.0.1";
const DEFAULT_RPC_PORT: u16 = 8332;
const DEFAULT_NETWORK: Network = Network::Bitcoin;
const DEFAULT_LOG_LEVEL: LogLevel = LogLevel::Debug;
const DEFAULT_POLL_INTERVAL_MIN_SECS: u64 = 10;
const DEFAULT_POLL_INTERVAL_MAX_SECS: u64 = 300;
const DEFAULT_POLL_RELAX_STEP_SECS: u64 = 10;
const DEFAULT_SLOW_ADDRESS_COOLDOWN_SECS: u64 = 300;
const DEFAULT_MAX_CONNECT_RETRIES: u32 = 3;
const DEFAULT_CONNECT_RETRY_BASE_DELAY_SECS: u64 = 1;
const DEFAULT_CONNECT_RETRY_DELAY_INCREMENT_SECS: u64 = 2;
const DEFAULT_CONSECUTIVE_FAILURE_THRESHOLD: u32 = 5;
const DEFAULT_RPC_TIMEOUT_CAP_SECS: u64 = 120;
const DEFAULT_PEER_INFO_LIMIT: usize = 10;
const DEFAULT_DUST_THRESHOLD_SATS: u64 = 546;
const DEFAULT_FALLBACK_FEE_RATE_SAT_PER_VB: u64 = 10;
const DEFAULT_FEE_TARGET_BLOCKS: usize = 6;

// The lower limit which we apply to any configured polling intervals.
pub(crate) const POLL_INTERVAL_MINIMUM_SECS: u64 = 5;

// The timeout we apply to the TCP reachability probe preceding the RPC handshake.
pub(crate) const REACHABILITY_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

// The verification progress above which we consider the node fully synced.
pub(crate) const VERIFICATION_PROGRESS_SYNCED: f64 = 0.9999;

// The number of transaction history entries we derive per address and cycle.
pub(crate) const ADDRESS_TX_HISTORY_LIMIT: usize = 25;

#[derive(Debug, Clone)]
/// Represents the configuration of a [`NodeClient`] instance.
///
/// ### Defaults
///
/// | Parameter                             | Value       |
/// |---------------------------------------|-------------|
/// | `rpc_host`                            | 127.0.0.1   |
/// | `rpc_port`                            | 8332        |
/// | `rpc_user`                            | ""          |
/// | `rpc_password`                        | ""          |
/// | `wallet_name`                         | None        |
/// | `network`                             | Bitcoin     |
/// | `log_dir_path`                        | None        |
/// | `log_level`                           | Debug       |
/// | `poll_interval_min_secs`              | 10          |
/// | `poll_interval_max_secs`              | 300         |
/// | `poll_relax_step_secs`                | 10          |
/// | `slow_address_cooldown_secs`          | 300         |
/// | `max_connect_retries`                 | 3           |
/// | `connect_retry_base_delay_secs`       | 1           |
/// | `connect_retry_delay_increment_secs`  | 2           |
/// | `consecutive_failure_threshold`       | 5           |
/// | `rpc_timeout_cap_secs`                | 120         |
/// | `peer_info_limit`                     | 10          |
/// | `dust_threshold_sats`                 | 546         |
/// | `fallback_fee_rate_sat_per_vb`        | 10          |
/// | `fee_target_blocks`                   | 6           |
/// | `fiat_rate_cents_per_btc`             | None        |
///
/// [`NodeClient`]: crate::NodeClient
pub struct Config {
	/// The host the node's RPC interface listens on.
	pub rpc_host: String,
	/// The port the node's RPC interface listens on.
	pub rpc_port: u16,
	/// The RPC user name.
	pub rpc_user: String,
	/// The RPC password.
	pub rpc_password: String,
	/// The node wallet RPC calls are routed to.
	///
	/// If set to `None`, the node's default wallet is used.
	pub wallet_name: Option<String>,
	/// The used Bitcoin network.
	pub network: Network,
	/// The path where logs are stored.
	///
	/// If set to `None`, logs are written to `/tmp/bitcoind_client/logs`.
	pub log_dir_path: Option<String>,
	/// The level at which we log messages.
	///
	/// Any messages below this level will be excluded from the logs.
	pub log_level: LogLevel,
	/// The floor the polling interval relaxes towards on clean cycles, in seconds.
	///
	/// **Note:** A minimum of 5 seconds is always enforced, and constrained hosts enforce a
	/// higher floor.
	pub poll_interval_min_secs: u64,
	/// The ceiling the polling interval backs off towards on failed cycles, in seconds.
	pub poll_interval_max_secs: u64,
	/// The step by which the polling interval relaxes after a clean cycle, in seconds.
	pub poll_relax_step_secs: u64,
	/// The cool-down during which an address marked slow is skipped by the polling cycle, in
	/// seconds.
	pub slow_address_cooldown_secs: u64,
	/// The maximum number of attempts a single `connect()` makes before giving up.
	pub max_connect_retries: u32,
	/// The base delay between connect retries, in seconds.
	pub connect_retry_base_delay_secs: u64,
	/// The additional delay added per connect attempt, in seconds.
	pub connect_retry_delay_increment_secs: u64,
	/// The number of consecutive failed polling cycles after which we force a disconnect.
	pub consecutive_failure_threshold: u32,
	/// The ceiling of the adaptive RPC call timeout, in seconds.
	pub rpc_timeout_cap_secs: u64,
	/// The maximum number of entries surfaced from the node's peer list per cycle.
	pub peer_info_limit: usize,
	/// The output value below which change is absorbed into the fee, in satoshis.
	pub dust_threshold_sats: u64,
	/// The fee rate used when the node cannot provide an estimate, in sat/vB.
	pub fallback_fee_rate_sat_per_vb: u64,
	/// The confirmation target used when requesting fee estimates from the node.
	pub fee_target_blocks: usize,
	/// The fiat rate used for balance estimates, in cents per whole bitcoin.
	///
	/// If set to `None`, no fiat estimates are attached to balance snapshots.
	pub fiat_rate_cents_per_btc: Option<u64>,
}

impl Default for Config {
	fn default() -> Self {
		Self {
			rpc_host: DEFAULT_RPC_HOST.to_string(),
			rpc_port: DEFAULT_RPC_PORT,
			rpc_user: String::new(),
			rpc_password: String::new(),
			wallet_name: None,
			network: DEFAULT_NETWORK,
			log_dir_path: None,
			log_level: DEFAULT_LOG_LEVEL,
			poll_interval_min_secs: DEFAULT_POLL_INTERVAL_MIN_SECS,
			poll_interval_max_secs: DEFAULT_POLL_INTERVAL_MAX_SECS,
			poll_relax_step_secs: DEFAULT_POLL_RELAX_STEP_SECS,
			slow_address_cooldown_secs: DEFAULT_SLOW_ADDRESS_COOLDOWN_SECS,
			max_connect_retries: DEFAULT_MAX_CONNECT_RETRIES,
			connect_retry_base_delay_secs: DEFAULT_CONNECT_RETRY_BASE_DELAY_SECS,
			connect_retry_delay_increment_secs: DEFAULT_CONNECT_RETRY_DELAY_INCREMENT_SECS,
			consecutive_failure_threshold: DEFAULT_CONSECUTIVE_FAILURE_THRESHOLD,
			rpc_timeout_cap_secs: DEFAULT_RPC_TIMEOUT_CAP_SECS,
			peer_info_limit: DEFAULT_PEER_INFO_LIMIT,
			dust_threshold_sats: DEFAULT_DUST_THRESHOLD_SATS,
			fallback_fee_rate_sat_per_vb: DEFAULT_FALLBACK_FEE_RATE_SAT_PER_VB,
			fee_target_blocks: DEFAULT_FEE_TARGET_BLOCKS,
			fiat_rate_cents_per_btc: None,
		}
	}
}

/// Returns a [`Config`] object populated with default values.
///
/// See the documentation of [`Config`] for more information on the used defaults.
pub fn default_config() -> Config {
	Config::default()
}
