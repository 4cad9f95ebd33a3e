// This file is Copyright its original authors, visible in version control history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. You may not use this file except in
// accordance with one or both of these licenses.

use crate::monitor::BalanceSnapshot;
use crate::tx_builder::SpendStage;
use crate::types::{AddressTransaction, BlockchainInfo, MempoolInfo, NetworkInfo, PeerSummary};
use crate::Error;

use bitcoin::Txid;

use core::future::Future;
use core::task::{Context, Poll, Waker};
use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::{Arc, Condvar, Mutex};

/// An event emitted by [`NodeClient`], which should be handled by the user.
///
/// Events produced by a single polling cycle are emitted in the order that cycle produced them.
/// No ordering is guaranteed between independent categories emitted by the same cycle.
///
/// [`NodeClient`]: crate::NodeClient
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
	/// The connection to the node was established or lost.
	ConnectionStateChanged {
		/// Whether we currently hold a usable connection.
		connected: bool,
	},
	/// A human-readable description of what the client is currently doing.
	StatusMessage {
		/// The message.
		message: String,
	},
	/// A failure that needs to be surfaced to the user.
	///
	/// Expected transient conditions are absorbed by the client and never reported here.
	Error {
		/// The kind of failure.
		error: Error,
		/// A human-readable description of the failure.
		detail: String,
	},
	/// The node's view of the block chain was refreshed.
	BlockchainInfoUpdated {
		/// The refreshed chain state.
		info: BlockchainInfo,
	},
	/// The node's view of the peer-to-peer network was refreshed.
	NetworkInfoUpdated {
		/// The refreshed network state.
		info: NetworkInfo,
	},
	/// The node's mempool state was refreshed.
	MempoolInfoUpdated {
		/// The refreshed mempool state.
		info: MempoolInfo,
	},
	/// The node's peer list was refreshed.
	PeersUpdated {
		/// A capped slice of the node's peer list.
		peers: Vec<PeerSummary>,
	},
	/// A watched address was refreshed.
	///
	/// Also emitted when the refresh failed, in which case the snapshot is zero-valued and
	/// carries the error. Stale balances are never left in place silently.
	AddressBalanceUpdated {
		/// The watched address.
		address: String,
		/// The refreshed balance snapshot.
		snapshot: BalanceSnapshot,
	},
	/// The transactions known for a watched address were refreshed.
	AddressTransactionsUpdated {
		/// The watched address.
		address: String,
		/// The derived transaction history, most-confirmed first.
		transactions: Vec<AddressTransaction>,
	},
	/// A spend's raw transaction was constructed.
	TransactionCreated {
		/// The serialized unsigned transaction.
		raw_hex: String,
	},
	/// A spend's transaction was fully signed by the node.
	TransactionSigned {
		/// The serialized signed transaction.
		signed_hex: String,
	},
	/// A spend's transaction was accepted by the node for broadcast.
	TransactionBroadcast {
		/// The id of the broadcast transaction.
		txid: Txid,
	},
	/// A spend failed, with the failing step identified.
	TransactionFailed {
		/// The step that failed.
		stage: SpendStage,
		/// A human-readable description of the failure.
		detail: String,
	},
}

pub(crate) struct EventQueue {
	queue: Arc<Mutex<VecDeque<Event>>>,
	waker: Arc<Mutex<Option<Waker>>>,
	notifier: Condvar,
}

impl EventQueue {
	pub(crate) fn new() -> Self {
		let queue = Arc::new(Mutex::new(VecDeque::new()));
		let waker = Arc::new(Mutex::new(None));
		let notifier = Condvar::new();
		Self { queue, waker, notifier }
	}

	pub(crate) fn add_event(&self, event: Event) {
		{
			let mut locked_queue = self.queue.lock().unwrap();
			locked_queue.push_back(event);
		}

		self.notifier.notify_one();

		if let Some(waker) = self.waker.lock().unwrap().take() {
			waker.wake();
		}
	}

	pub(crate) fn next_event(&self) -> Option<Event> {
		let locked_queue = self.queue.lock().unwrap();
		locked_queue.front().cloned()
	}

	pub(crate) async fn next_event_async(&self) -> Event {
		EventFuture { event_queue: Arc::clone(&self.queue), waker: Arc::clone(&self.waker) }.await
	}

	pub(crate) fn wait_next_event(&self) -> Event {
		let locked_queue =
			self.notifier.wait_while(self.queue.lock().unwrap(), |queue| queue.is_empty()).unwrap();
		locked_queue.front().unwrap().clone()
	}

	pub(crate) fn event_handled(&self) {
		let mut locked_queue = self.queue.lock().unwrap();
		locked_queue.pop_front();
	}
}

struct EventFuture {
	event_queue: Arc<Mutex<VecDeque<Event>>>,
	waker: Arc<Mutex<Option<Waker>>>,
}

impl Future for EventFuture {
	type Output = Event;

	fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
		let locked_queue = self.event_queue.lock().unwrap();
		if let Some(event) = locked_queue.front() {
			Poll::Ready(event.clone())
		} else {
			*self.waker.lock().unwrap() = Some(cx.waker().clone());
			Poll::Pending
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn event_queue_fifo_and_handled() {
		let queue = EventQueue::new();
		assert_eq!(queue.next_event(), None);

		queue.add_event(Event::ConnectionStateChanged { connected: true });
		queue.add_event(Event::StatusMessage { message: "Connected".to_string() });

		// `next_event` peeks without consuming.
		assert_eq!(queue.next_event(), Some(Event::ConnectionStateChanged { connected: true }));
		assert_eq!(queue.next_event(), Some(Event::ConnectionStateChanged { connected: true }));

		queue.event_handled();
		assert_eq!(
			queue.next_event(),
			Some(Event::StatusMessage { message: "Connected".to_string() })
		);
		queue.event_handled();
		assert_eq!(queue.next_event(), None);
	}

	#[tokio::test]
	async fn event_queue_async_wakeup() {
		let queue = Arc::new(EventQueue::new());

		let waiter = Arc::clone(&queue);
		let handle = tokio::spawn(async move { waiter.next_event_async().await });

		tokio::task::yield_now().await;
		queue.add_event(Event::ConnectionStateChanged { connected: false });

		let event = handle.await.unwrap();
		assert_eq!(event, Event::ConnectionStateChanged { connected: false });
	}
}
