//! Pluggable discovery tools.
//!
//! A discovery tool reports which ports it can see.
//! It can be asked once ([`DiscoveryClient::list`]), or it can stream
//! `add` and `remove` events as ports come and go ([`DiscoveryClient::start_sync`]).

use std::{
    fmt::Display,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};

use futures::Stream;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, instrument};

use crate::{
    error::Error,
    events::Event,
    port::Port,
    process::{Launcher, ProcessLauncher},
    protocol::{LineClient, ProtocolMessage},
};

mod manager;
mod message;

pub use manager::{DiscoveryManager, PortWatcher, WATCHER_GRACE};
use message::DiscoveryMessage;

/// How long a discovery tool may take to reply to a command.
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

/// Where a discovery client is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryState {
    /// Not started, terminated, or the tool's output could not be understood.
    Dead,

    /// The tool runs, but START has not been sent.
    Alive,

    /// START succeeded, ports can be listed.
    Running,

    /// STOP succeeded.
    Idle,

    /// Ports are streamed as events.
    Syncing,
}

impl Display for DiscoveryState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match self {
            DiscoveryState::Dead => "dead",
            DiscoveryState::Alive => "alive",
            DiscoveryState::Running => "running",
            DiscoveryState::Idle => "idle",
            DiscoveryState::Syncing => "syncing",
        };
        write!(f, "{state}")
    }
}

/// Drives one discovery tool.
#[derive(Debug)]
pub struct DiscoveryClient {
    client: LineClient<DiscoveryMessage>,
    state: DiscoveryState,
}

impl DiscoveryClient {
    /// A client for the tool started by the command line `args`.
    /// Nothing is started until [`DiscoveryClient::start`].
    pub fn new(id: impl Into<String>, args: Vec<String>, launcher: Arc<dyn Launcher>) -> Self {
        Self {
            client: LineClient::new(id.into(), args, launcher),
            state: DiscoveryState::Dead,
        }
    }

    /// A client which starts its tool as a subprocess.
    pub fn new_process(id: impl Into<String>, args: Vec<String>) -> Self {
        Self::new(id, args, Arc::new(ProcessLauncher))
    }

    /// The discovery's ID.
    pub fn id(&self) -> &str {
        self.client.id()
    }

    /// The command line of the tool.
    pub fn command(&self) -> &[String] {
        self.client.args()
    }

    /// The current state.
    pub fn state(&self) -> DiscoveryState {
        if self.client.is_alive() {
            self.state
        } else {
            DiscoveryState::Dead
        }
    }

    /// Launch the tool.
    #[instrument(skip(self), fields(discovery = %self.id()))]
    pub fn start(&mut self) -> Result<(), Error> {
        self.client.start()?;
        self.state = DiscoveryState::Alive;
        Ok(())
    }

    /// Send START: the tool should begin looking for ports.
    #[instrument(skip(self), fields(discovery = %self.id()))]
    pub async fn run_start(&mut self) -> Result<(), Error> {
        self.client.send_command("START\n").await?;
        self.client.wait_message(COMMAND_TIMEOUT, "start").await?;

        self.state = DiscoveryState::Running;
        debug!("Discovery running");
        Ok(())
    }

    /// Send STOP: the tool should stop looking for ports.
    /// Ends sync mode, if active.
    #[instrument(skip(self), fields(discovery = %self.id()))]
    pub async fn run_stop(&mut self) -> Result<(), Error> {
        self.client.send_command("STOP\n").await?;
        self.client.wait_message(COMMAND_TIMEOUT, "stop").await?;

        self.client.stop_listening();
        self.state = DiscoveryState::Idle;
        debug!("Discovery stopped");
        Ok(())
    }

    /// Send QUIT, then terminate the tool.
    ///
    /// The tool is terminated even if QUIT fails,
    /// in which case the error is returned.
    #[instrument(skip(self), fields(discovery = %self.id()))]
    pub async fn quit(&mut self) -> Result<(), Error> {
        let result: Result<(), Error> = async {
            self.client.send_command("QUIT\n").await?;
            self.client.wait_message(COMMAND_TIMEOUT, "quit").await?;
            Ok(())
        }
        .await;

        self.client.terminate().await;
        self.state = DiscoveryState::Dead;
        info!(ok = result.is_ok(), "Discovery quit");

        result
    }

    /// Ask the tool which ports it sees right now.
    #[instrument(skip(self), fields(discovery = %self.id()))]
    pub async fn list(&mut self) -> Result<Vec<Port>, Error> {
        self.client.send_command("LIST\n").await?;

        match self.client.wait_message(COMMAND_TIMEOUT, "list").await? {
            DiscoveryMessage::List { ports, .. } => Ok(ports),
            other => Err(Error::OutOfSync {
                expected: "list".into(),
                received: other.event_type().into(),
            }),
        }
    }

    /// Send START_SYNC: the tool will report ports as events from now on.
    ///
    /// At most `buffer` events are queued if the reader falls behind,
    /// after that the tool's output is not read until there is room.
    #[instrument(skip(self), fields(discovery = %self.id()))]
    pub async fn start_sync(&mut self, buffer: usize) -> Result<EventReader, Error> {
        let events = self.client.listen(buffer)?;

        if let Err(e) = self.client.send_command("START_SYNC\n").await {
            self.client.stop_listening();
            return Err(e);
        }

        self.state = DiscoveryState::Syncing;
        debug!("Discovery syncing");

        Ok(EventReader {
            discovery_id: self.id().to_string(),
            events: ReceiverStream::new(events),
        })
    }

    /// True while events are streamed.
    pub fn is_syncing(&self) -> bool {
        self.client.is_listening()
    }
}

/// Events from a discovery in sync mode.
///
/// The last event is always a [`crate::events::EventKind::Stop`],
/// after which the reader is exhausted.
#[derive(Debug)]
pub struct EventReader {
    discovery_id: String,
    events: ReceiverStream<Event>,
}

impl EventReader {
    /// The discovery these events come from.
    pub fn discovery_id(&self) -> &str {
        &self.discovery_id
    }

    /// The next event, or [`None`] when the discovery is done.
    pub async fn next_event(&mut self) -> Option<Event> {
        futures::StreamExt::next(&mut self.events).await
    }
}

impl Stream for EventReader {
    type Item = Event;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.events).poll_next(cx)
    }
}
