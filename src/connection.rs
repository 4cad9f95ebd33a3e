// This file is Copyright its original authors, visible in version control history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. You may not use this file except in
// accordance with one or both of these licenses.

use crate::chain::PollCycleResult;
use crate::config::{Config, REACHABILITY_PROBE_TIMEOUT};
use crate::event::{Event, EventQueue};
use crate::logger::{log_debug, log_error, log_info, log_trace, DynLogger};
use crate::rpc::{RpcErrorKind, RpcGateway};
use crate::types::BlockchainInfo;
use crate::Error;

use std::fs;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// The lifecycle state of the connection to the node.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum NodeStatus {
	/// No connection is held.
	Disconnected,
	/// A connection attempt is in flight.
	Connecting,
	/// The node is reachable and fully synced.
	Connected,
	/// The node is reachable but still verifying the chain. Expensive queries are deferred
	/// until it catches up.
	Busy,
}

/// The adaptive per-call timeout. Grows on observed slow calls, decays back towards its
/// baseline on clean cycles, and never drops below the baseline.
pub(crate) struct AdaptiveTimeout {
	baseline_secs: u64,
	cap_secs: u64,
	current_secs: AtomicU64,
}

impl AdaptiveTimeout {
	pub(crate) fn new(baseline: Duration, cap: Duration) -> Self {
		let baseline_secs = baseline.as_secs().max(1);
		let cap_secs = cap.as_secs().max(baseline_secs);
		let current_secs = AtomicU64::new(baseline_secs);
		Self { baseline_secs, cap_secs, current_secs }
	}

	pub(crate) fn current(&self) -> Duration {
		Duration::from_secs(self.current_secs.load(Ordering::Acquire))
	}

	pub(crate) fn grow(&self) {
		let _ = self.current_secs.fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
			Some((current + current / 2).min(self.cap_secs))
		});
	}

	pub(crate) fn decay(&self) {
		let _ = self.current_secs.fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
			if current <= self.baseline_secs {
				return None;
			}
			let step = ((current - self.baseline_secs) / 4).max(1);
			Some((current - step).max(self.baseline_secs))
		});
	}
}

/// The capability class of the host we are running on, probed once at startup. Constrained
/// hosts get longer timeouts and a slower polling floor.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum HostProfile {
	Standard,
	Constrained,
}

const CONSTRAINED_MEM_TOTAL_KB: u64 = 2 * 1024 * 1024;

impl HostProfile {
	pub(crate) fn detect() -> Self {
		let model = fs::read_to_string("/proc/device-tree/model").ok();
		let mem_total_kb = fs::read_to_string("/proc/meminfo").ok().and_then(|meminfo| {
			meminfo.lines().find(|line| line.starts_with("MemTotal:")).and_then(|line| {
				line.split_whitespace().nth(1).and_then(|value| value.parse::<u64>().ok())
			})
		});
		Self::from_host_facts(std::env::consts::ARCH, model.as_deref(), mem_total_kb)
	}

	fn from_host_facts(arch: &str, model: Option<&str>, mem_total_kb: Option<u64>) -> Self {
		if matches!(arch, "arm" | "aarch64") {
			return Self::Constrained;
		}
		if model.map_or(false, |m| m.contains("Raspberry Pi")) {
			return Self::Constrained;
		}
		if mem_total_kb.map_or(false, |kb| kb < CONSTRAINED_MEM_TOTAL_KB) {
			return Self::Constrained;
		}
		Self::Standard
	}

	pub(crate) fn slow_call_threshold(&self) -> Duration {
		match self {
			Self::Standard => Duration::from_secs(5),
			Self::Constrained => Duration::from_secs(10),
		}
	}

	pub(crate) fn baseline_rpc_timeout(&self) -> Duration {
		match self {
			Self::Standard => Duration::from_secs(30),
			Self::Constrained => Duration::from_secs(60),
		}
	}

	pub(crate) fn poll_interval_floor_secs(&self) -> u64 {
		match self {
			Self::Standard => 10,
			Self::Constrained => 30,
		}
	}
}

// All mutable retry state lives here, owned by the manager, so it is testable in isolation.
struct ConnectionState {
	status: NodeStatus,
	consecutive_failures: u32,
	generation: u64,
}

/// Owns the RPC session: performs connect/retry with progressive backoff, tracks liveness
/// and the node-busy state, and forces a disconnect after prolonged degradation.
pub(crate) struct ConnectionManager {
	gateway: Arc<RpcGateway>,
	state: RwLock<ConnectionState>,
	timeout: Arc<AdaptiveTimeout>,
	config: Arc<Config>,
	event_queue: Arc<EventQueue>,
	logger: Arc<DynLogger>,
}

impl ConnectionManager {
	pub(crate) fn new(
		gateway: Arc<RpcGateway>, timeout: Arc<AdaptiveTimeout>, config: Arc<Config>,
		event_queue: Arc<EventQueue>, logger: Arc<DynLogger>,
	) -> Self {
		let state = RwLock::new(ConnectionState {
			status: NodeStatus::Disconnected,
			consecutive_failures: 0,
			generation: 0,
		});
		Self { gateway, state, timeout, config, event_queue, logger }
	}

	pub(crate) fn status(&self) -> NodeStatus {
		self.state.read().unwrap().status
	}

	/// The connection generation, bumped on every successful handshake. Consumers use it to
	/// invalidate per-connection caches after a reconnect.
	pub(crate) fn generation(&self) -> u64 {
		self.state.read().unwrap().generation
	}

	/// Connects to the node, retrying transient failures with progressive backoff.
	///
	/// Bad credentials abort immediately and surface a fatal error event.
	pub(crate) async fn connect(&self) -> Result<(), Error> {
		{
			let mut locked_state = self.state.write().unwrap();
			if locked_state.status != NodeStatus::Disconnected {
				return Ok(());
			}
			locked_state.status = NodeStatus::Connecting;
		}

		self.event_queue.add_event(Event::StatusMessage {
			message: format!(
				"Connecting to node at {}:{}..",
				self.config.rpc_host, self.config.rpc_port
			),
		});

		let max_attempts = self.config.max_connect_retries.max(1);
		for attempt in 0..max_attempts {
			if attempt > 0 {
				let delay = self.retry_delay(attempt);
				log_debug!(
					self.logger,
					"Retrying connect in {}s (attempt {}/{}).",
					delay.as_secs(),
					attempt + 1,
					max_attempts
				);
				tokio::time::sleep(delay).await;
			}

			// Fail fast on "node not running" without burning a full RPC timeout.
			if !self.probe_reachable().await {
				log_debug!(
					self.logger,
					"Node at {}:{} is unreachable.",
					self.config.rpc_host,
					self.config.rpc_port
				);
				continue;
			}

			let outcome = self.gateway.call("getblockchaininfo", vec![]).await;
			let handshake_latency = outcome.latency;
			match outcome.into_result() {
				Ok(value) => match BlockchainInfo::from_value(&value) {
					Ok(info) => {
						log_trace!(
							self.logger,
							"Connect handshake completed in {}ms.",
							handshake_latency.as_millis()
						);
						self.complete_handshake(&info);
						return Ok(());
					},
					Err(e) => {
						log_error!(self.logger, "Connect handshake failed: {}", e);
					},
				},
				Err(e) if e.kind == RpcErrorKind::Unauthorized => {
					self.state.write().unwrap().status = NodeStatus::Disconnected;
					log_error!(self.logger, "Connect aborted: {}", e.message);
					self.event_queue.add_event(Event::Error {
						error: Error::Unauthorized,
						detail: e.message,
					});
					return Err(Error::Unauthorized);
				},
				Err(e) => {
					log_trace!(self.logger, "Connect attempt failed: {}", e);
				},
			}
		}

		self.state.write().unwrap().status = NodeStatus::Disconnected;
		self.event_queue.add_event(Event::StatusMessage {
			message: format!(
				"Failed to connect to node at {}:{}.",
				self.config.rpc_host, self.config.rpc_port
			),
		});
		Err(Error::ConnectionFailed)
	}

	/// Tears down the session. Only the manager creates or drops the connection.
	pub(crate) fn disconnect(&self) {
		let was_connected = {
			let mut locked_state = self.state.write().unwrap();
			let was_connected =
				matches!(locked_state.status, NodeStatus::Connected | NodeStatus::Busy);
			locked_state.status = NodeStatus::Disconnected;
			locked_state.consecutive_failures = 0;
			was_connected
		};

		if was_connected {
			self.event_queue.add_event(Event::ConnectionStateChanged { connected: false });
		}
		self.event_queue
			.add_event(Event::StatusMessage { message: "Disconnected from node.".to_string() });
		log_info!(self.logger, "Disconnected from node.");
	}

	/// Applies the latest chain state to the `Connected`/`Busy` transitions.
	pub(crate) fn update_sync_state(&self, info: &BlockchainInfo) {
		let busy = info.is_syncing();
		let transition = {
			let mut locked_state = self.state.write().unwrap();
			match (locked_state.status, busy) {
				(NodeStatus::Connected, true) => {
					locked_state.status = NodeStatus::Busy;
					Some(true)
				},
				(NodeStatus::Busy, false) => {
					locked_state.status = NodeStatus::Connected;
					Some(false)
				},
				_ => None,
			}
		};

		match transition {
			Some(true) => {
				log_info!(
					self.logger,
					"Node fell behind ({:.1}% verified), deferring expensive queries.",
					info.verification_progress * 100.0
				);
				self.event_queue.add_event(Event::StatusMessage {
					message: format!(
						"Node is syncing ({:.1}%).",
						info.verification_progress * 100.0
					),
				});
			},
			Some(false) => {
				log_info!(self.logger, "Node finished syncing at height {}.", info.blocks);
				self.event_queue.add_event(Event::StatusMessage {
					message: format!("Node finished syncing at height {}.", info.blocks),
				});
			},
			None => {},
		}
	}

	/// Feeds a polling-cycle outcome into the failure bookkeeping. Prolonged degradation
	/// eventually forces a disconnect rather than polling forever in a half-broken state.
	pub(crate) fn record_cycle(&self, result: &PollCycleResult) {
		if result.success {
			self.state.write().unwrap().consecutive_failures = 0;
			self.timeout.decay();
			return;
		}

		let (failures, force_disconnect) = {
			let mut locked_state = self.state.write().unwrap();
			locked_state.consecutive_failures += 1;
			let force = locked_state.consecutive_failures
				>= self.config.consecutive_failure_threshold
				&& matches!(locked_state.status, NodeStatus::Connected | NodeStatus::Busy);
			(locked_state.consecutive_failures, force)
		};
		log_debug!(
			self.logger,
			"Polling cycle failed after {}ms ({}/{} consecutive failures).",
			result.latency.as_millis(),
			failures,
			self.config.consecutive_failure_threshold
		);

		if force_disconnect {
			log_error!(
				self.logger,
				"Dropping node connection after {} consecutive failed cycles.",
				self.config.consecutive_failure_threshold
			);
			{
				let mut locked_state = self.state.write().unwrap();
				locked_state.status = NodeStatus::Disconnected;
				locked_state.consecutive_failures = 0;
			}
			self.event_queue.add_event(Event::ConnectionStateChanged { connected: false });
			self.event_queue.add_event(Event::StatusMessage {
				message: "Connection lost after repeated failures.".to_string(),
			});
		}
	}

	fn complete_handshake(&self, info: &BlockchainInfo) {
		let busy = info.is_syncing();
		{
			let mut locked_state = self.state.write().unwrap();
			locked_state.consecutive_failures = 0;
			locked_state.generation += 1;
			locked_state.status = if busy { NodeStatus::Busy } else { NodeStatus::Connected };
		}

		self.event_queue.add_event(Event::ConnectionStateChanged { connected: true });
		if busy {
			log_info!(
				self.logger,
				"Connected to a syncing node ({:.1}% verified).",
				info.verification_progress * 100.0
			);
			self.event_queue.add_event(Event::StatusMessage {
				message: format!(
					"Connected. Node is syncing ({:.1}%).",
					info.verification_progress * 100.0
				),
			});
		} else {
			log_info!(self.logger, "Connected to node at height {}.", info.blocks);
			self.event_queue.add_event(Event::StatusMessage {
				message: format!("Connected to node at height {}.", info.blocks),
			});
		}
	}

	fn retry_delay(&self, attempt: u32) -> Duration {
		let secs = self.config.connect_retry_base_delay_secs
			+ u64::from(attempt) * self.config.connect_retry_delay_increment_secs;
		Duration::from_secs(secs)
	}

	async fn probe_reachable(&self) -> bool {
		let addr = format!("{}:{}", self.config.rpc_host, self.config.rpc_port);
		matches!(
			tokio::time::timeout(
				REACHABILITY_PROBE_TIMEOUT,
				tokio::net::TcpStream::connect(addr.as_str())
			)
			.await,
			Ok(Ok(_))
		)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn adaptive_timeout_grows_and_caps() {
		let timeout = AdaptiveTimeout::new(Duration::from_secs(30), Duration::from_secs(120));
		assert_eq!(timeout.current(), Duration::from_secs(30));

		timeout.grow();
		assert_eq!(timeout.current(), Duration::from_secs(45));
		timeout.grow();
		assert_eq!(timeout.current(), Duration::from_secs(67));

		for _ in 0..10 {
			timeout.grow();
		}
		assert_eq!(timeout.current(), Duration::from_secs(120));
	}

	#[test]
	fn adaptive_timeout_decays_to_baseline_only() {
		let timeout = AdaptiveTimeout::new(Duration::from_secs(30), Duration::from_secs(120));
		for _ in 0..10 {
			timeout.grow();
		}
		assert_eq!(timeout.current(), Duration::from_secs(120));

		let mut previous = timeout.current();
		for _ in 0..200 {
			timeout.decay();
			let current = timeout.current();
			assert!(current <= previous);
			assert!(current >= Duration::from_secs(30));
			previous = current;
		}
		assert_eq!(timeout.current(), Duration::from_secs(30));

		// Decaying at the baseline is a no-op.
		timeout.decay();
		assert_eq!(timeout.current(), Duration::from_secs(30));
	}

	#[test]
	fn host_profile_detection() {
		assert_eq!(HostProfile::from_host_facts("x86_64", None, None), HostProfile::Standard);
		assert_eq!(HostProfile::from_host_facts("aarch64", None, None), HostProfile::Constrained);
		assert_eq!(
			HostProfile::from_host_facts("x86_64", Some("Raspberry Pi 4 Model B"), None),
			HostProfile::Constrained
		);
		assert_eq!(
			HostProfile::from_host_facts("x86_64", None, Some(1024 * 1024)),
			HostProfile::Constrained
		);
		assert_eq!(
			HostProfile::from_host_facts("x86_64", None, Some(16 * 1024 * 1024)),
			HostProfile::Standard
		);
	}
}
