// This file is Copyright its original authors, visible in version control history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. You may not use this file except in
// accordance with one or both of these licenses.

use std::fmt;

/// An error that possibly needs to be handled by the user.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Error {
	/// Returned when trying to start [`crate::NodeClient`] while it is already running.
	AlreadyRunning,
	/// Returned when trying to stop [`crate::NodeClient`] while it is not running.
	NotRunning,
	/// The node could not be reached or the connection handshake failed.
	ConnectionFailed,
	/// The node rejected our RPC credentials. This is fatal and will not be retried.
	Unauthorized,
	/// The given address is invalid for the configured network.
	InvalidAddress,
	/// The given amount is invalid.
	InvalidAmount,
	/// The available funds do not cover the requested amount plus fees.
	InsufficientFunds,
	/// We failed to construct the raw transaction.
	TxBuildFailed,
	/// The node failed to fully sign the transaction.
	TxSignFailed,
	/// The node rejected the transaction on broadcast.
	TxBroadcastRejected,
	/// A wallet-level operation on the node failed.
	WalletOperationFailed,
	/// An RPC call returned an error we could not recover from.
	RpcFailed,
}

impl fmt::Display for Error {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		match *self {
			Self::AlreadyRunning => write!(f, "Node client is already running."),
			Self::NotRunning => write!(f, "Node client is not running."),
			Self::ConnectionFailed => write!(f, "Failed to connect to the node."),
			Self::Unauthorized => write!(f, "The node rejected our RPC credentials."),
			Self::InvalidAddress => write!(f, "The given address is invalid."),
			Self::InvalidAmount => write!(f, "The given amount is invalid."),
			Self::InsufficientFunds => {
				write!(f, "The available funds are insufficient to complete the given operation.")
			},
			Self::TxBuildFailed => write!(f, "Failed to build the transaction."),
			Self::TxSignFailed => write!(f, "Failed to sign the transaction."),
			Self::TxBroadcastRejected => write!(f, "The node rejected the broadcast transaction."),
			Self::WalletOperationFailed => write!(f, "A wallet operation on the node failed."),
			Self::RpcFailed => write!(f, "An RPC call to the node failed."),
		}
	}
}

impl std::error::Error for Error {}
