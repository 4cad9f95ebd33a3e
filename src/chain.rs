// This file is Copyright its original authors, visible in version control history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. You may not use this file except in
// accordance with one or both of these licenses.

use crate::config::{Config, POLL_INTERVAL_MINIMUM_SECS};
use crate::connection::{ConnectionManager, NodeStatus};
use crate::event::{Event, EventQueue};
use crate::logger::{log_trace, DynLogger};
use crate::monitor::AddressMonitor;
use crate::rpc::{RpcErrorKind, RpcGateway};
use crate::types::{BlockSummary, BlockchainInfo, MempoolInfo, NetworkInfo, PeerSummary};

use serde_json::json;

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// The outcome of one scheduler tick, consumed immediately to adjust scheduling.
pub(crate) struct PollCycleResult {
	pub success: bool,
	pub latency: Duration,
	pub busy: bool,
}

/// The adaptive polling interval. Relaxes towards its floor in bounded steps on clean cycles
/// and backs off towards its ceiling on degraded ones, yielding a self-stabilizing poll rate.
pub(crate) struct SchedulerState {
	interval_secs: u64,
	min_secs: u64,
	max_secs: u64,
	relax_step_secs: u64,
}

impl SchedulerState {
	pub(crate) fn new(min_secs: u64, max_secs: u64, relax_step_secs: u64) -> Self {
		let min_secs = min_secs.max(POLL_INTERVAL_MINIMUM_SECS);
		let max_secs = max_secs.max(min_secs);
		let relax_step_secs = relax_step_secs.max(1);
		Self { interval_secs: min_secs, min_secs, max_secs, relax_step_secs }
	}

	pub(crate) fn current(&self) -> Duration {
		Duration::from_secs(self.interval_secs)
	}

	pub(crate) fn on_clean_cycle(&mut self) {
		self.interval_secs =
			self.interval_secs.saturating_sub(self.relax_step_secs).max(self.min_secs);
	}

	pub(crate) fn on_degraded_cycle(&mut self) {
		self.interval_secs = self.interval_secs.saturating_mul(2).min(self.max_secs);
	}
}

/// Drives periodic polling of global node state and of the address monitor.
pub(crate) struct ChainPoller {
	gateway: Arc<RpcGateway>,
	connection_manager: Arc<ConnectionManager>,
	address_monitor: Arc<AddressMonitor>,
	scheduler: Mutex<SchedulerState>,
	config: Arc<Config>,
	event_queue: Arc<EventQueue>,
	logger: Arc<DynLogger>,
}

impl ChainPoller {
	pub(crate) fn new(
		gateway: Arc<RpcGateway>, connection_manager: Arc<ConnectionManager>,
		address_monitor: Arc<AddressMonitor>, scheduler: SchedulerState, config: Arc<Config>,
		event_queue: Arc<EventQueue>, logger: Arc<DynLogger>,
	) -> Self {
		let scheduler = Mutex::new(scheduler);
		Self {
			gateway,
			connection_manager,
			address_monitor,
			scheduler,
			config,
			event_queue,
			logger,
		}
	}

	/// The background polling loop. One iteration is one polling cycle; the sleep in-between
	/// adapts to the observed cycle outcomes.
	pub(crate) async fn continuously_poll(
		&self, mut stop_poll_receiver: tokio::sync::watch::Receiver<()>,
	) {
		loop {
			let delay = self.scheduler.lock().unwrap().current();
			tokio::select! {
				_ = stop_poll_receiver.changed() => {
					log_trace!(self.logger, "Stopping polling for new node data.");
					return;
				}
				_ = tokio::time::sleep(delay) => {}
			}

			let result = self.poll_cycle().await;
			self.connection_manager.record_cycle(&result);

			let mut locked_scheduler = self.scheduler.lock().unwrap();
			if result.success && !result.busy {
				locked_scheduler.on_clean_cycle();
			} else {
				locked_scheduler.on_degraded_cycle();
			}
		}
	}

	pub(crate) async fn poll_cycle(&self) -> PollCycleResult {
		let start = Instant::now();

		if self.connection_manager.status() == NodeStatus::Disconnected {
			if self.connection_manager.connect().await.is_err() {
				return PollCycleResult { success: false, latency: start.elapsed(), busy: false };
			}
		}

		// Chain info is fetched in every state; while the node is busy it doubles as the sync
		// completion probe.
		let outcome = self.gateway.call("getblockchaininfo", vec![]).await;
		let mut info = match outcome.into_result().and_then(|v| BlockchainInfo::from_value(&v)) {
			Ok(info) => info,
			Err(e) => {
				log_trace!(self.logger, "Polling cycle failed: {}", e);
				return PollCycleResult { success: false, latency: start.elapsed(), busy: false };
			},
		};

		self.connection_manager.update_sync_state(&info);
		self.address_monitor.set_tip_height(info.blocks);

		if self.connection_manager.status() == NodeStatus::Busy {
			// Load shedding: while the node syncs we skip everything else.
			self.event_queue.add_event(Event::BlockchainInfoUpdated { info });
			return PollCycleResult { success: true, latency: start.elapsed(), busy: true };
		}

		info.tip = self.fetch_tip_summary().await;
		self.event_queue.add_event(Event::BlockchainInfoUpdated { info });

		let mut success = true;
		success &= self.fetch_network_info().await;
		success &= self.fetch_mempool_info().await;
		success &= self.fetch_peer_info().await;

		let generation = self.connection_manager.generation();
		success &= self.address_monitor.refresh_all(generation).await;

		PollCycleResult { success, latency: start.elapsed(), busy: false }
	}

	async fn fetch_tip_summary(&self) -> Option<BlockSummary> {
		let hash = self.gateway.call("getbestblockhash", vec![]).await.into_result().ok()?;
		let hash = hash.as_str()?.to_string();
		let value = self
			.gateway
			.call("getblock", vec![json!(hash), json!(1)])
			.await
			.into_result()
			.ok()?;
		BlockSummary::from_value(&value).ok()
	}

	async fn fetch_network_info(&self) -> bool {
		let outcome = self.gateway.call("getnetworkinfo", vec![]).await;
		match outcome.into_result().and_then(|v| NetworkInfo::from_value(&v)) {
			Ok(info) => {
				self.event_queue.add_event(Event::NetworkInfoUpdated { info });
				true
			},
			Err(e) if e.kind == RpcErrorKind::MethodUnsupported => true,
			Err(e) => {
				log_trace!(self.logger, "Failed to fetch network info: {}", e);
				false
			},
		}
	}

	async fn fetch_mempool_info(&self) -> bool {
		let outcome = self.gateway.call("getmempoolinfo", vec![]).await;
		match outcome.into_result().and_then(|v| MempoolInfo::from_value(&v)) {
			Ok(info) => {
				self.event_queue.add_event(Event::MempoolInfoUpdated { info });
				true
			},
			Err(e) if e.kind == RpcErrorKind::MethodUnsupported => true,
			Err(e) => {
				log_trace!(self.logger, "Failed to fetch mempool info: {}", e);
				false
			},
		}
	}

	async fn fetch_peer_info(&self) -> bool {
		let outcome = self.gateway.call("getpeerinfo", vec![]).await;
		let value = match outcome.into_result() {
			Ok(value) => value,
			Err(e) if e.kind == RpcErrorKind::MethodUnsupported => return true,
			Err(e) => {
				log_trace!(self.logger, "Failed to fetch peer info: {}", e);
				return false;
			},
		};

		let entries = match value.as_array() {
			Some(entries) => entries,
			None => {
				log_trace!(self.logger, "Failed to parse getpeerinfo response");
				return false;
			},
		};

		// Peer lists can run into the hundreds; a capped slice is plenty for a dashboard.
		let peers: Vec<PeerSummary> = entries
			.iter()
			.take(self.config.peer_info_limit)
			.filter_map(|entry| PeerSummary::from_value(entry).ok())
			.collect();

		self.event_queue.add_event(Event::PeersUpdated { peers });
		true
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn backoff_is_monotonic_up_to_ceiling() {
		let mut scheduler = SchedulerState::new(10, 300, 10);
		assert_eq!(scheduler.current(), Duration::from_secs(10));

		let mut previous = scheduler.current();
		for _ in 0..10 {
			scheduler.on_degraded_cycle();
			let current = scheduler.current();
			assert!(current >= previous);
			assert!(current <= Duration::from_secs(300));
			previous = current;
		}
		assert_eq!(scheduler.current(), Duration::from_secs(300));
	}

	#[test]
	fn relaxation_is_stepwise_not_instant() {
		let mut scheduler = SchedulerState::new(10, 300, 10);
		for _ in 0..10 {
			scheduler.on_degraded_cycle();
		}
		assert_eq!(scheduler.current(), Duration::from_secs(300));

		scheduler.on_clean_cycle();
		assert_eq!(scheduler.current(), Duration::from_secs(290));
		scheduler.on_clean_cycle();
		assert_eq!(scheduler.current(), Duration::from_secs(280));

		for _ in 0..50 {
			scheduler.on_clean_cycle();
		}
		assert_eq!(scheduler.current(), Duration::from_secs(10));
	}

	#[test]
	fn configured_floor_is_clamped() {
		let scheduler = SchedulerState::new(0, 300, 10);
		assert_eq!(scheduler.current(), Duration::from_secs(POLL_INTERVAL_MINIMUM_SECS));

		// A ceiling below the floor collapses to the floor instead of inverting the range.
		let mut scheduler = SchedulerState::new(60, 30, 10);
		scheduler.on_degraded_cycle();
		assert_eq!(scheduler.current(), Duration::from_secs(60));
	}
}
