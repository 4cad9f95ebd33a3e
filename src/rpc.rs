// This file is Copyright its original authors, visible in version control history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. You may not use this file except in
// accordance with one or both of these licenses.

use crate::connection::AdaptiveTimeout;
use crate::logger::{log_debug, log_error, log_trace, DynLogger};

use serde::Serialize;
use serde_json::Value;

use base64::prelude::{Engine, BASE64_STANDARD};

use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// The classification of a failed RPC call, driving how callers react to it.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum RpcErrorKind {
	/// The node rejected our credentials. Fatal, must not be retried.
	Unauthorized,
	/// An expected failure under load: timeout, congestion, or a node that is still warming up.
	Transient,
	/// The node or wallet does not implement the called method. Callers should fall back to an
	/// alternate strategy.
	MethodUnsupported,
	/// Anything we could not classify. Logged with full detail once, then treated like
	/// [`RpcErrorKind::Transient`] for retry purposes.
	Unknown,
}

/// An error returned by the RPC gateway.
///
/// Expected transient conditions are always returned as a value of this type. No panic crosses
/// the gateway boundary.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RpcError {
	/// The classification of the failure.
	pub kind: RpcErrorKind,
	/// A human-readable description of the failure.
	pub message: String,
}

impl RpcError {
	pub(crate) fn new(kind: RpcErrorKind, message: String) -> Self {
		Self { kind, message }
	}

	pub(crate) fn transient(message: String) -> Self {
		Self::new(RpcErrorKind::Transient, message)
	}

	pub(crate) fn parse(method: &str) -> Self {
		Self::new(RpcErrorKind::Unknown, format!("Failed to parse {} response", method))
	}

	/// Classifies a JSON-RPC error object returned by the node.
	pub(crate) fn from_code(code: i64, message: String) -> Self {
		let kind = match code {
			// RPC_METHOD_NOT_FOUND
			-32601 => RpcErrorKind::MethodUnsupported,
			// RPC_IN_WARMUP
			-28 => RpcErrorKind::Transient,
			_ if message.contains("Method not found") => RpcErrorKind::MethodUnsupported,
			_ if message.contains("Loading") => RpcErrorKind::Transient,
			_ => RpcErrorKind::Unknown,
		};
		Self::new(kind, message)
	}

	/// Whether retrying the call can reasonably succeed.
	pub fn is_retryable(&self) -> bool {
		matches!(self.kind, RpcErrorKind::Transient | RpcErrorKind::Unknown)
	}
}

impl fmt::Display for RpcError {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "{:?}: {}", self.kind, self.message)
	}
}

impl std::error::Error for RpcError {}

pub(crate) type AsyncRpcResult<'a> =
	Pin<Box<dyn Future<Output = Result<Value, RpcError>> + Send + 'a>>;

/// The transport seam the gateway drives. Only the connection manager constructs one; every
/// other component is handed the gateway.
pub(crate) trait RpcTransport: Send + Sync {
	fn call_method<'a>(
		&'a self, method: &'a str, params: Vec<Value>, timeout: Duration,
	) -> AsyncRpcResult<'a>;
}

/// A JSON-RPC-over-HTTP transport speaking to a Bitcoin Core node.
pub(crate) struct HttpRpcTransport {
	client: reqwest::Client,
	endpoint: String,
	credentials: String,
	next_id: AtomicU64,
}

impl HttpRpcTransport {
	pub(crate) fn new(
		host: String, port: u16, rpc_user: String, rpc_password: String,
		wallet_name: Option<String>,
	) -> Self {
		let endpoint = match wallet_name {
			Some(name) => format!("http://{}:{}/wallet/{}", host, port, name),
			None => format!("http://{}:{}", host, port),
		};
		let credentials = rpc_credentials(rpc_user, rpc_password);
		let client = reqwest::Client::new();
		let next_id = AtomicU64::new(0);
		Self { client, endpoint, credentials, next_id }
	}

	async fn dispatch(
		&self, method: &str, params: Vec<Value>, timeout: Duration,
	) -> Result<Value, RpcError> {
		let id = self.next_id.fetch_add(1, Ordering::AcqRel);
		let body = serde_json::json!({
			"jsonrpc": "1.0",
			"id": id,
			"method": method,
			"params": params,
		});

		let response = match self
			.client
			.post(self.endpoint.as_str())
			.header(reqwest::header::AUTHORIZATION, self.credentials.as_str())
			.timeout(timeout)
			.json(&body)
			.send()
			.await
		{
			Ok(response) => response,
			Err(e) if e.is_timeout() => {
				return Err(RpcError::transient(format!("{} timed out: {}", method, e)));
			},
			Err(e) if e.is_connect() => {
				return Err(RpcError::transient(format!("{} could not connect: {}", method, e)));
			},
			Err(e) => {
				return Err(RpcError::new(
					RpcErrorKind::Unknown,
					format!("{} failed: {}", method, e),
				));
			},
		};

		let status = response.status().as_u16();
		let text = response
			.text()
			.await
			.map_err(|e| RpcError::transient(format!("{} response truncated: {}", method, e)))?;

		if status == 401 || status == 403 {
			return Err(RpcError::new(
				RpcErrorKind::Unauthorized,
				"The node rejected our RPC credentials".to_string(),
			));
		}
		// Bitcoin Core sheds load by rejecting requests outright once its HTTP work queue is
		// full.
		if status == 503 || text.contains("Work queue depth exceeded") {
			return Err(RpcError::transient(format!("{} rejected: node work queue full", method)));
		}

		let parsed: Value = serde_json::from_str(&text).map_err(|_| RpcError::parse(method))?;
		if let Some(error) = parsed.get("error").filter(|e| !e.is_null()) {
			let code = error.get("code").and_then(|c| c.as_i64()).unwrap_or(0);
			let message =
				error.get("message").and_then(|m| m.as_str()).unwrap_or_default().to_string();
			return Err(RpcError::from_code(code, message));
		}

		parsed.get("result").cloned().ok_or_else(|| RpcError::parse(method))
	}
}

impl RpcTransport for HttpRpcTransport {
	fn call_method<'a>(
		&'a self, method: &'a str, params: Vec<Value>, timeout: Duration,
	) -> AsyncRpcResult<'a> {
		Box::pin(async move { self.dispatch(method, params, timeout).await })
	}
}

/// The outcome of a single gateway call: the classified result plus the latency observations
/// callers act on.
pub(crate) struct CallOutcome {
	pub result: Result<Value, RpcError>,
	pub latency: Duration,
	pub slow: bool,
}

impl CallOutcome {
	pub(crate) fn into_result(self) -> Result<Value, RpcError> {
		self.result
	}
}

/// Executes single remote calls with a bounded timeout and classifies the outcome.
pub(crate) struct RpcGateway {
	transport: Arc<dyn RpcTransport>,
	timeout: Arc<AdaptiveTimeout>,
	slow_call_threshold: Duration,
	unknown_logged: Mutex<HashSet<String>>,
	logger: Arc<DynLogger>,
}

impl RpcGateway {
	pub(crate) fn new(
		transport: Arc<dyn RpcTransport>, timeout: Arc<AdaptiveTimeout>,
		slow_call_threshold: Duration, logger: Arc<DynLogger>,
	) -> Self {
		let unknown_logged = Mutex::new(HashSet::new());
		Self { transport, timeout, slow_call_threshold, unknown_logged, logger }
	}

	pub(crate) fn slow_call_threshold(&self) -> Duration {
		self.slow_call_threshold
	}

	/// Executes the given call with the current adaptive timeout.
	pub(crate) async fn call(&self, method: &str, params: Vec<Value>) -> CallOutcome {
		let timeout = self.timeout.current();
		self.call_with_timeout(method, params, timeout).await
	}

	/// Executes the given call with a caller-specified timeout.
	pub(crate) async fn call_with_timeout(
		&self, method: &str, params: Vec<Value>, timeout: Duration,
	) -> CallOutcome {
		let start = Instant::now();
		let result = self.transport.call_method(method, params, timeout).await;
		let latency = start.elapsed();

		let slow = latency >= self.slow_call_threshold;
		if slow {
			log_debug!(
				self.logger,
				"RPC call {} took {}ms, flagging as slow.",
				method,
				latency.as_millis()
			);
			self.timeout.grow();
		}

		if let Err(ref e) = result {
			match e.kind {
				RpcErrorKind::Unknown => {
					let mut locked_logged = self.unknown_logged.lock().unwrap();
					if locked_logged.insert(method.to_string()) {
						log_error!(self.logger, "RPC call {} failed: {}", method, e.message);
					} else {
						log_trace!(self.logger, "RPC call {} failed again: {}", method, e.message);
					}
				},
				RpcErrorKind::Unauthorized => {
					log_error!(self.logger, "RPC call {} was rejected as unauthorized.", method);
				},
				RpcErrorKind::MethodUnsupported => {
					log_debug!(self.logger, "RPC method {} is unsupported by the node.", method);
				},
				RpcErrorKind::Transient => {
					log_trace!(
						self.logger,
						"RPC call {} failed transiently: {}",
						method,
						e.message
					);
				},
			}
		}

		CallOutcome { result, latency, slow }
	}
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub(crate) enum FeeRateEstimationMode {
	Economical,
	#[allow(dead_code)]
	Conservative,
}

pub(crate) fn rpc_credentials(rpc_user: String, rpc_password: String) -> String {
	format!("Basic {}", BASE64_STANDARD.encode(format!("{}:{}", rpc_user, rpc_password)))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn error_code_classification() {
		let err = RpcError::from_code(-32601, "Method not found".to_string());
		assert_eq!(err.kind, RpcErrorKind::MethodUnsupported);

		let err = RpcError::from_code(-28, "Verifying blocks...".to_string());
		assert_eq!(err.kind, RpcErrorKind::Transient);
		assert!(err.is_retryable());

		let err = RpcError::from_code(-18, "Requested wallet does not exist".to_string());
		assert_eq!(err.kind, RpcErrorKind::Unknown);
		assert!(err.is_retryable());

		let err = RpcError::new(RpcErrorKind::Unauthorized, "401".to_string());
		assert!(!err.is_retryable());
	}

	#[test]
	fn credentials_are_basic_auth() {
		let credentials = rpc_credentials("user".to_string(), "pass".to_string());
		assert_eq!(credentials, format!("Basic {}", BASE64_STANDARD.encode("user:pass")));
	}
}
