// This file is Copyright its original authors, visible in version control history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. You may not use this file except in
// accordance with one or both of these licenses.

use chrono::Utc;

use std::fmt;
use std::fs;
use std::io::Write;

/// The level at which we log messages.
///
/// Any messages below the configured level will be excluded from the logs.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
	/// Designates very low priority, often extremely verbose, information.
	Trace,
	/// Designates lower priority information.
	Debug,
	/// Designates useful information.
	Info,
	/// Designates hazardous situations.
	Warn,
	/// Designates very serious errors.
	Error,
}

impl fmt::Display for LogLevel {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		match *self {
			Self::Trace => write!(f, "TRACE"),
			Self::Debug => write!(f, "DEBUG"),
			Self::Info => write!(f, "INFO"),
			Self::Warn => write!(f, "WARN"),
			Self::Error => write!(f, "ERROR"),
		}
	}
}

pub(crate) struct LogRecord<'a> {
	pub level: LogLevel,
	pub args: fmt::Arguments<'a>,
	pub module_path: &'static str,
	pub line: u32,
}

pub(crate) trait LogWriter: Send + Sync {
	fn log(&self, record: LogRecord);
}

pub(crate) type DynLogger = dyn LogWriter;

pub(crate) struct FilesystemLogger {
	file_path: String,
	level: LogLevel,
}

impl FilesystemLogger {
	pub(crate) fn new(log_dir: String, level: LogLevel) -> Self {
		fs::create_dir_all(&log_dir).expect("Failed to create log directory");
		let file_path = format!("{}/bitcoind-client.log", log_dir);
		Self { file_path, level }
	}
}

impl LogWriter for FilesystemLogger {
	fn log(&self, record: LogRecord) {
		if record.level < self.level {
			return;
		}
		let log = format!(
			"{} {:<5} [{}:{}] {}\n",
			Utc::now().format("%Y-%m-%d %H:%M:%S"),
			record.level.to_string(),
			record.module_path,
			record.line,
			record.args
		);
		fs::OpenOptions::new()
			.create(true)
			.append(true)
			.open(&self.file_path)
			.expect("Failed to open log file")
			.write_all(log.as_bytes())
			.expect("Failed to write to log file");
	}
}

macro_rules! log_internal {
	($logger: expr, $level: expr, $($args: tt)+) => {
		$logger.log($crate::logger::LogRecord {
			level: $level,
			args: format_args!($($args)+),
			module_path: module_path!(),
			line: line!(),
		})
	};
}
pub(crate) use log_internal;

macro_rules! log_error {
	($logger: expr, $($args: tt)+) => {
		$crate::logger::log_internal!($logger, $crate::logger::LogLevel::Error, $($args)+)
	};
}
pub(crate) use log_error;

macro_rules! log_info {
	($logger: expr, $($args: tt)+) => {
		$crate::logger::log_internal!($logger, $crate::logger::LogLevel::Info, $($args)+)
	};
}
pub(crate) use log_info;

macro_rules! log_debug {
	($logger: expr, $($args: tt)+) => {
		$crate::logger::log_internal!($logger, $crate::logger::LogLevel::Debug, $($args)+)
	};
}
pub(crate) use log_debug;

macro_rules! log_trace {
	($logger: expr, $($args: tt)+) => {
		$crate::logger::log_internal!($logger, $crate::logger::LogLevel::Trace, $($args)+)
	};
}
pub(crate) use log_trace;
