#![allow(dead_code)]

use std::time::Duration;

use color_eyre::{eyre::eyre, Result};
use port_keel::{discovery::PortWatcher, events::Event, logging, mock::PipeTool};
use tokio::{sync::mpsc, time::timeout};
use tracing::Level;

#[macro_export]
macro_rules! assert_add {
    ($event:expr, $key:expr) => {
        let event = $event;
        assert_eq!(event.event_type(), "add", "{event}");
        assert_eq!(event.port().unwrap().key(), $key);
    };
}

#[macro_export]
macro_rules! assert_remove {
    ($event:expr, $key:expr) => {
        let event = $event;
        assert_eq!(event.event_type(), "remove", "{event}");
        assert_eq!(event.port().unwrap().key(), $key);
    };
}

#[macro_export]
macro_rules! assert_result_error {
    ($response:expr, $e:pat) => {
        assert!(matches!($response, Result::Err($e)));
    };
}

pub fn init_logging() {
    logging::init(Level::DEBUG, None);
}

/// The command line of the mock discovery binary, reporting `ports`.
pub fn mock_discovery(ports: &[&str]) -> Vec<String> {
    std::iter::once(env!("CARGO_BIN_EXE_mock-discovery"))
        .chain(ports.iter().copied())
        .map(String::from)
        .collect()
}

/// The command line of the mock monitor binary.
pub fn mock_monitor() -> Vec<String> {
    vec![env!("CARGO_BIN_EXE_mock-monitor").to_string()]
}

pub async fn next_event(watcher: &mut PortWatcher) -> Result<Event> {
    timeout(Duration::from_secs(5), watcher.next_event())
        .await?
        .ok_or_else(|| eyre!("Watcher closed"))
}

pub async fn next_tool(tools: &mut mpsc::UnboundedReceiver<PipeTool>) -> Result<PipeTool> {
    timeout(Duration::from_secs(5), tools.recv())
        .await?
        .ok_or_else(|| eyre!("Launcher dropped"))
}

/// Read `n` events, sorted by port key.
pub async fn next_events_sorted(watcher: &mut PortWatcher, n: usize) -> Result<Vec<Event>> {
    let mut events = Vec::with_capacity(n);
    for _ in 0..n {
        events.push(next_event(watcher).await?);
    }
    events.sort_by_key(|event| event.port().map(|port| port.key()));

    Ok(events)
}
