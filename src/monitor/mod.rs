//! Pluggable monitor tools.
//!
//! A monitor tool opens a port and shuttles its data over a TCP connection
//! which the tool dials back to us. The handshake is:
//! HELLO, DESCRIBE, any number of CONFIGURE, OPEN, CLOSE, QUIT.

use std::{sync::Arc, time::Duration};

use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, instrument};

use crate::{
    error::Error,
    process::{Launcher, ProcessLauncher},
    protocol::LineClient,
};

mod message;
mod session;

pub use message::{PortDescriptor, PortParameterDescriptor};
use message::MonitorMessage;
pub use session::relay;

/// The newest monitor protocol version we speak.
pub const PROTOCOL_VERSION: u32 = 1;

/// How long a monitor tool may take to reply to most commands.
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

/// How long a monitor tool may take to reply to CLOSE.
pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// How long a monitor tool may take to reply to QUIT, before it is killed anyway.
pub const QUIT_TIMEOUT: Duration = Duration::from_millis(250);

/// Where a monitor client is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    /// Not started, terminated, or the tool's output could not be understood.
    Dead,

    /// The tool runs, but has not said HELLO.
    Alive,

    /// HELLO succeeded, a port may be opened.
    Ready,

    /// A port is open.
    Opened,
}

/// Drives one monitor tool.
#[derive(Debug)]
pub struct MonitorClient {
    client: LineClient<MonitorMessage>,
    user_agent: String,
    descriptor: Option<PortDescriptor>,
    state: MonitorState,
}

impl MonitorClient {
    /// A client for the tool started by the command line `args`.
    pub fn new(id: impl Into<String>, args: Vec<String>, launcher: Arc<dyn Launcher>) -> Self {
        Self {
            client: LineClient::new(id.into(), args, launcher),
            user_agent: format!("port-keel {}", env!("CARGO_PKG_VERSION")),
            descriptor: None,
            state: MonitorState::Dead,
        }
    }

    /// A client which starts its tool as a subprocess.
    pub fn new_process(id: impl Into<String>, args: Vec<String>) -> Self {
        Self::new(id, args, Arc::new(ProcessLauncher))
    }

    /// Introduce ourselves to the tool as `user_agent` during HELLO.
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    /// The monitor's ID.
    pub fn id(&self) -> &str {
        self.client.id()
    }

    /// The current state.
    pub fn state(&self) -> MonitorState {
        if self.client.is_alive() {
            self.state
        } else {
            MonitorState::Dead
        }
    }

    /// What DESCRIBE replied, if it has been run.
    pub fn port_descriptor(&self) -> Option<&PortDescriptor> {
        self.descriptor.as_ref()
    }

    /// Launch the tool and say HELLO.
    ///
    /// If the handshake fails the tool is terminated.
    #[instrument(skip(self), fields(monitor = %self.id()))]
    pub async fn run(&mut self) -> Result<(), Error> {
        self.client.start()?;
        self.state = MonitorState::Alive;

        if let Err(e) = self.hello().await {
            self.client.terminate().await;
            self.state = MonitorState::Dead;
            return Err(e);
        }

        self.state = MonitorState::Ready;
        info!("Monitor ready");
        Ok(())
    }

    async fn hello(&mut self) -> Result<(), Error> {
        let command = format!("HELLO {PROTOCOL_VERSION} \"{}\"\n", self.user_agent);
        self.client.send_command(&command).await?;

        let got = match self.client.wait_message(COMMAND_TIMEOUT, "hello").await? {
            MonitorMessage::Hello {
                protocol_version, ..
            } => protocol_version,
            _ => PROTOCOL_VERSION,
        };

        if got > PROTOCOL_VERSION {
            return Err(Error::UnsupportedProtocolVersion {
                requested: PROTOCOL_VERSION,
                got,
            });
        }

        debug!(version = got, "Protocol agreed");
        Ok(())
    }

    /// Ask the tool what it supports. The answer is kept for [`MonitorClient::open`].
    #[instrument(skip(self), fields(monitor = %self.id()))]
    pub async fn describe(&mut self) -> Result<PortDescriptor, Error> {
        self.client.send_command("DESCRIBE\n").await?;

        let descriptor = match self.client.wait_message(COMMAND_TIMEOUT, "describe").await? {
            MonitorMessage::Describe {
                descriptor: Some(descriptor),
                ..
            } => descriptor,
            _ => {
                return Err(Error::Protocol(
                    "`describe` reply without port_description".into(),
                ))
            }
        };

        debug!(protocol = %descriptor.protocol, "Described");
        self.descriptor = Some(descriptor.clone());

        Ok(descriptor)
    }

    /// Change a setting, e.g. `baudrate` to `115200`.
    #[instrument(skip(self), fields(monitor = %self.id()))]
    pub async fn configure(&mut self, parameter: &str, value: &str) -> Result<(), Error> {
        self.client
            .send_command(&format!("CONFIGURE {parameter} {value}\n"))
            .await?;
        self.client
            .wait_message(COMMAND_TIMEOUT, "configure")
            .await?;

        Ok(())
    }

    /// Open the port at `address`.
    ///
    /// `protocol` must be the one the tool described.
    /// The returned stream carries the port's data in both directions.
    #[instrument(skip(self), fields(monitor = %self.id()))]
    pub async fn open(&mut self, address: &str, protocol: &str) -> Result<TcpStream, Error> {
        let supported = self
            .descriptor
            .as_ref()
            .map(|descriptor| descriptor.protocol.as_str())
            .unwrap_or_default();

        if protocol != supported {
            return Err(Error::UnsupportedProtocol {
                requested: protocol.to_string(),
                supported: supported.to_string(),
            });
        }

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let local = listener.local_addr()?;

        self.client
            .send_command(&format!("OPEN {local} {address}\n"))
            .await?;
        self.client.wait_message(COMMAND_TIMEOUT, "open").await?;

        // TODO: Bound the accept with a timeout so a tool which replies
        // OK but never dials back can not hang us here.
        let (stream, peer) = listener.accept().await?;
        drop(listener);

        self.state = MonitorState::Opened;
        info!(%peer, %address, "Port opened");

        Ok(stream)
    }

    /// Close the opened port.
    #[instrument(skip(self), fields(monitor = %self.id()))]
    pub async fn close(&mut self) -> Result<(), Error> {
        self.client.send_command("CLOSE\n").await?;
        self.client.wait_message(CLOSE_TIMEOUT, "close").await?;

        self.state = MonitorState::Ready;
        debug!("Port closed");
        Ok(())
    }

    /// Send QUIT, then terminate the tool.
    ///
    /// The tool is terminated regardless of how QUIT went.
    #[instrument(skip(self), fields(monitor = %self.id()))]
    pub async fn quit(&mut self) -> Result<(), Error> {
        let result: Result<(), Error> = async {
            self.client.send_command("QUIT\n").await?;
            self.client.wait_message(QUIT_TIMEOUT, "quit").await?;
            Ok(())
        }
        .await;

        self.client.terminate().await;
        self.state = MonitorState::Dead;
        info!(ok = result.is_ok(), "Monitor quit");

        result
    }
}
