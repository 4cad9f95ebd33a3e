// This file is Copyright its original authors, visible in version control history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. You may not use this file except in
// accordance with one or both of these licenses.

use crate::chain::{ChainPoller, SchedulerState};
use crate::config::Config;
use crate::connection::{AdaptiveTimeout, ConnectionManager};
use crate::event::{Event, EventQueue};
use crate::logger::{DynLogger, LogRecord, LogWriter};
use crate::monitor::AddressMonitor;
use crate::rpc::{AsyncRpcResult, RpcError, RpcErrorKind, RpcGateway, RpcTransport};
use crate::tx_builder::TxBuilder;
use crate::wallet::WalletInspector;

use serde_json::{json, Value};

use std::collections::{HashMap, VecDeque};
use std::net::TcpListener;
use std::sync::{Arc, Mutex};
use std::time::Duration;

// A valid mainnet P2PKH address (the genesis coinbase).
pub(crate) const TEST_ADDRESS: &str = "1A1zP1eP5QGefi2DMPTfTL5SLmv7DivfNa";
// A valid mainnet bech32 address (BIP-173 test vector).
pub(crate) const TEST_ADDRESS_BECH32: &str = "bc1qar0srrr7xfkvy5l643lydnw9re59gtzzwf5mdq";

pub(crate) const TEST_TXID: &str =
	"4a5e1e4baab89f3a32518a88c31bc87f618f76673e2cc77ab2127b7afdeda33b";
pub(crate) const TEST_BLOCK_HASH: &str =
	"000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f";

macro_rules! expect_event {
	($queue: expr, $event_type: ident) => {{
		match $queue.next_event() {
			Some(ref e @ crate::Event::$event_type { .. }) => {
				println!("Got event {:?}", e);
				$queue.event_handled();
			},
			ref e => {
				panic!("Got unexpected event!: {:?}", e);
			},
		}
	}};
}

pub(crate) use expect_event;

pub(crate) struct TestLogger {
	pub lines: Mutex<Vec<String>>,
}

impl TestLogger {
	pub(crate) fn new() -> Self {
		Self { lines: Mutex::new(Vec::new()) }
	}
}

impl LogWriter for TestLogger {
	fn log(&self, record: LogRecord) {
		let line = format!("{} {}", record.level, record.args);
		println!("{}", line);
		self.lines.lock().unwrap().push(line);
	}
}

/// An [`RpcTransport`] answering from scripted per-method responses. One-shot responses queued
/// via [`FakeRpcTransport::push_response`] are consumed before the repeating default set via
/// [`FakeRpcTransport::stub`]. Unscripted methods answer as unsupported.
pub(crate) struct FakeRpcTransport {
	defaults: Mutex<HashMap<String, Result<Value, RpcError>>>,
	queued: Mutex<HashMap<String, VecDeque<Result<Value, RpcError>>>>,
	latencies: Mutex<HashMap<String, Duration>>,
	calls: Mutex<Vec<String>>,
}

impl FakeRpcTransport {
	pub(crate) fn new() -> Self {
		Self {
			defaults: Mutex::new(HashMap::new()),
			queued: Mutex::new(HashMap::new()),
			latencies: Mutex::new(HashMap::new()),
			calls: Mutex::new(Vec::new()),
		}
	}

	pub(crate) fn stub(&self, method: &str, result: Result<Value, RpcError>) {
		self.defaults.lock().unwrap().insert(method.to_string(), result);
	}

	pub(crate) fn push_response(&self, method: &str, result: Result<Value, RpcError>) {
		self.queued.lock().unwrap().entry(method.to_string()).or_default().push_back(result);
	}

	pub(crate) fn set_latency(&self, method: &str, latency: Duration) {
		self.latencies.lock().unwrap().insert(method.to_string(), latency);
	}

	pub(crate) fn clear_latency(&self, method: &str) {
		self.latencies.lock().unwrap().remove(method);
	}

	pub(crate) fn call_count(&self, method: &str) -> usize {
		self.calls.lock().unwrap().iter().filter(|m| m.as_str() == method).count()
	}
}

impl RpcTransport for FakeRpcTransport {
	fn call_method<'a>(
		&'a self, method: &'a str, _params: Vec<Value>, _timeout: Duration,
	) -> AsyncRpcResult<'a> {
		Box::pin(async move {
			self.calls.lock().unwrap().push(method.to_string());

			let latency = self.latencies.lock().unwrap().get(method).copied();
			if let Some(latency) = latency {
				tokio::time::sleep(latency).await;
			}

			if let Some(queued) =
				self.queued.lock().unwrap().get_mut(method).and_then(|q| q.pop_front())
			{
				return queued;
			}
			if let Some(default) = self.defaults.lock().unwrap().get(method) {
				return default.clone();
			}
			Err(RpcError::new(
				RpcErrorKind::MethodUnsupported,
				format!("Method not found: {}", method),
			))
		})
	}
}

/// The fully wired component graph under test, backed by a [`FakeRpcTransport`].
///
/// The TCP listener keeps the connection manager's reachability probe honest without spinning
/// a real node.
pub(crate) struct TestNode {
	pub transport: Arc<FakeRpcTransport>,
	pub connection_manager: Arc<ConnectionManager>,
	pub address_monitor: Arc<AddressMonitor>,
	pub tx_builder: Arc<TxBuilder>,
	pub chain_poller: Arc<ChainPoller>,
	pub event_queue: Arc<EventQueue>,
	pub logger: Arc<TestLogger>,
	_probe_listener: TcpListener,
}

pub(crate) fn test_node(config: Config) -> TestNode {
	test_node_with_slow_threshold(config, Duration::from_secs(5))
}

pub(crate) fn test_node_with_slow_threshold(
	mut config: Config, slow_call_threshold: Duration,
) -> TestNode {
	let probe_listener = TcpListener::bind("127.0.0.1:0").unwrap();
	config.rpc_host = "127.0.0.1".to_string();
	config.rpc_port = probe_listener.local_addr().unwrap().port();
	let config = Arc::new(config);

	let transport = Arc::new(FakeRpcTransport::new());
	let test_logger = Arc::new(TestLogger::new());
	let logger: Arc<DynLogger> = Arc::clone(&test_logger) as Arc<DynLogger>;

	let timeout = Arc::new(AdaptiveTimeout::new(
		Duration::from_secs(30),
		Duration::from_secs(config.rpc_timeout_cap_secs),
	));
	let gateway = Arc::new(RpcGateway::new(
		Arc::clone(&transport) as Arc<dyn RpcTransport>,
		Arc::clone(&timeout),
		slow_call_threshold,
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
		config.poll_interval_min_secs,
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

	TestNode {
		transport,
		connection_manager,
		address_monitor,
		tx_builder,
		chain_poller,
		event_queue,
		logger: test_logger,
		_probe_listener: probe_listener,
	}
}

pub(crate) fn drain_events(event_queue: &EventQueue) -> Vec<Event> {
	let mut events = Vec::new();
	while let Some(event) = event_queue.next_event() {
		event_queue.event_handled();
		events.push(event);
	}
	events
}

pub(crate) fn healthy_chain_info() -> Value {
	json!({
		"chain": "main",
		"blocks": 820000u64,
		"headers": 820000u64,
		"bestblockhash": TEST_BLOCK_HASH,
		"verificationprogress": 1.0,
		"initialblockdownload": false,
		"pruned": false,
	})
}

pub(crate) fn syncing_chain_info(progress: f64, blocks: u64, headers: u64) -> Value {
	json!({
		"chain": "main",
		"blocks": blocks,
		"headers": headers,
		"bestblockhash": TEST_BLOCK_HASH,
		"verificationprogress": progress,
		"initialblockdownload": true,
		"pruned": false,
	})
}

pub(crate) fn network_info() -> Value {
	json!({
		"version": 270000u64,
		"subversion": "/Satoshi:27.0.0/",
		"protocolversion": 70016u64,
		"connections": 10u64,
		"networkactive": true,
	})
}

pub(crate) fn mempool_info() -> Value {
	json!({
		"size": 1234u64,
		"bytes": 5678u64,
		"usage": 91011u64,
		"mempoolminfee": 0.00001,
	})
}

pub(crate) fn peer_info() -> Value {
	json!([
		{ "id": 0u64, "addr": "203.0.113.7:8333", "subver": "/Satoshi:26.0.0/", "inbound": false, "pingtime": 0.034 },
		{ "id": 1u64, "addr": "198.51.100.4:8333", "subver": "/Satoshi:27.0.0/", "inbound": true, "pingtime": 0.110 },
	])
}

pub(crate) fn block_summary(height: u64) -> Value {
	json!({
		"hash": TEST_BLOCK_HASH,
		"height": height,
		"time": 1700000000u64,
		"nTx": 2000u64,
	})
}

pub(crate) fn unspent_entry(address: &str, amount_btc: f64, confirmations: u64) -> Value {
	json!({
		"txid": TEST_TXID,
		"vout": 0u32,
		"address": address,
		"amount": amount_btc,
		"confirmations": confirmations,
		"spendable": true,
	})
}

pub(crate) fn scan_result(amount_btc: f64, height: u64) -> Value {
	json!({
		"success": true,
		"total_amount": amount_btc,
		"unspents": [
			{ "txid": TEST_TXID, "vout": 0u32, "amount": amount_btc, "height": height },
		],
	})
}

/// Stubs the global-state calls a healthy, fully-synced node would answer.
pub(crate) fn stub_healthy_node(transport: &FakeRpcTransport) {
	transport.stub("getblockchaininfo", Ok(healthy_chain_info()));
	transport.stub("getnetworkinfo", Ok(network_info()));
	transport.stub("getmempoolinfo", Ok(mempool_info()));
	transport.stub("getpeerinfo", Ok(peer_info()));
	transport.stub("getbestblockhash", Ok(json!(TEST_BLOCK_HASH)));
	transport.stub("getblock", Ok(block_summary(820000)));
}
