#![deny(missing_docs)]

//! This crate finds communication ports and opens sessions with the devices behind them.
//!
//! Both jobs are delegated to helper tools which speak a line oriented JSON protocol
//! on their stdin/stdout:
//!
//! - Discovery tools report ports. See [`discovery::DiscoveryClient`].
//!   Many of them are run together by a [`discovery::DiscoveryManager`], which
//!   merges their events and hands them out to watchers.
//! - Monitor tools open a port and relay its data over TCP. See [`monitor::MonitorClient`].

/// Discovery tools, and the manager running many of them.
pub mod discovery;

/// Monitor tools.
pub mod monitor;

/// Ports, as reported by discoveries.
pub mod port;

/// Events discoveries emit.
pub mod events;

/// Starting tools.
pub mod process;

/// The line protocol both tool kinds speak.
pub(crate) mod protocol;

/// Mocked tools.
pub mod mock;

/// The command line interface.
pub mod cli;

/// Relates to config files.
pub mod config;

/// Possible errors in this library.
pub mod error;

/// Logging/tracing setup.
pub mod logging;
