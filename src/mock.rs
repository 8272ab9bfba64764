//! Mock tools, useful to test discovery and monitor functionality without real hardware.
//!
//! [`MockDiscovery`] and [`MockMonitor`] speak the tool side of the protocols over any streams.
//! They back the `mock-discovery` and `mock-monitor` binaries, and [`MockLauncher`] runs
//! them in-process.
//!
//! [`PipeLauncher`] instead hands the tool side of the pipes to a test, which then
//! plays the tool by hand.

use std::{
    io,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use futures::{future::BoxFuture, StreamExt};
use serde_json::{json, Value};
use tokio::{
    io::{duplex, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream},
    net::TcpStream,
    sync::mpsc,
    task::JoinHandle,
};
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tracing::{debug, info, warn};

use crate::{
    error::Error,
    monitor::{PortDescriptor, PortParameterDescriptor},
    port::Port,
    process::{Launcher, ToolIo, ToolProcess},
    protocol::codec::MAX_MESSAGE_BYTES,
};

const PIPE_CAPACITY: usize = 64 * 1024;

fn lines<R: AsyncRead>(input: R) -> FramedRead<R, LinesCodec> {
    FramedRead::new(input, LinesCodec::new_with_max_length(MAX_MESSAGE_BYTES))
}

fn map_codec_error(e: LinesCodecError) -> Error {
    match e {
        LinesCodecError::Io(e) => Error::Io(e),
        LinesCodecError::MaxLineLengthExceeded => Error::Decode("command line too long".into()),
    }
}

async fn send<W: AsyncWrite + Unpin>(output: &mut W, value: Value) -> Result<(), Error> {
    let mut line = value.to_string();
    line.push('\n');

    output.write_all(line.as_bytes()).await?;
    output.flush().await?;

    Ok(())
}

fn ok(event_type: &str) -> Value {
    json!({ "eventType": event_type, "message": "OK" })
}

fn failed(event_type: &str, message: impl Into<String>) -> Value {
    json!({ "eventType": event_type, "error": true, "message": message.into() })
}

fn unsupported(command: &str) -> Value {
    failed("command_error", format!("Command {command} not supported"))
}

/// Parse a port given as `protocol:address`.
/// Without a `:`, the protocol is `serial`.
pub fn parse_port(arg: &str) -> Port {
    match arg.split_once(':') {
        Some((protocol, address)) => Port::new(address, protocol),
        None => Port::new(arg, "serial"),
    }
}

/// A discovery which always sees the same ports.
#[derive(Debug, Clone, Default)]
pub struct MockDiscovery {
    ports: Vec<Port>,
}

impl MockDiscovery {
    /// A discovery reporting these ports.
    pub fn new(ports: Vec<Port>) -> Self {
        Self { ports }
    }

    /// Serve commands from `input` until QUIT or until the input closes.
    pub async fn serve<R, W>(self, input: R, mut output: W) -> Result<(), Error>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut commands = lines(input);

        while let Some(command) = commands.next().await {
            let command = command.map_err(map_codec_error)?;
            debug!(%command, "Mock discovery got command");

            match command.trim() {
                "START" => send(&mut output, ok("start")).await?,
                "STOP" => send(&mut output, ok("stop")).await?,
                "LIST" => {
                    let ports = serde_json::to_value(&self.ports)?;
                    send(
                        &mut output,
                        json!({ "eventType": "list", "message": "OK", "ports": ports }),
                    )
                    .await?
                }
                "START_SYNC" => {
                    for port in &self.ports {
                        let port = serde_json::to_value(port)?;
                        send(&mut output, json!({ "eventType": "add", "port": port })).await?;
                    }
                }
                "QUIT" => {
                    send(&mut output, ok("quit")).await?;
                    break;
                }
                other => send(&mut output, unsupported(other)).await?,
            }
        }

        info!("Mock discovery done");
        Ok(())
    }
}

/// A serial monitor which echoes what it is sent.
///
/// On OPEN it dials back to the given TCP address, greets with
/// `Opened port: <address>`, then answers any data with `Received: ><data><`.
#[derive(Debug)]
pub struct MockMonitor {
    descriptor: PortDescriptor,
    session: Option<(String, JoinHandle<()>)>,
}

impl Default for MockMonitor {
    fn default() -> Self {
        Self::new()
    }
}

fn enumeration(label: &str, values: &[&str], selected: &str) -> PortParameterDescriptor {
    PortParameterDescriptor {
        label: label.into(),
        kind: "enum".into(),
        values: values.iter().map(|value| value.to_string()).collect(),
        selected: selected.into(),
    }
}

impl MockMonitor {
    /// A monitor for the `serial` protocol.
    pub fn new() -> Self {
        let configuration_parameters = [
            (
                "baudrate",
                enumeration(
                    "Baudrate",
                    &["300", "1200", "2400", "4800", "9600", "19200", "38400", "57600", "115200"],
                    "9600",
                ),
            ),
            (
                "parity",
                enumeration("Parity", &["none", "even", "odd", "mark", "space"], "none"),
            ),
            ("bits", enumeration("Data bits", &["5", "6", "7", "8", "9"], "8")),
            ("stop_bits", enumeration("Stop bits", &["1", "1.5", "2"], "1")),
            ("rts", enumeration("RTS", &["on", "off"], "on")),
            ("dtr", enumeration("DTR", &["on", "off"], "on")),
        ]
        .into_iter()
        .map(|(name, parameter)| (name.to_string(), parameter))
        .collect();

        Self {
            descriptor: PortDescriptor {
                protocol: "serial".into(),
                configuration_parameters,
            },
            session: None,
        }
    }

    /// Serve commands from `input` until QUIT or until the input closes.
    pub async fn serve<R, W>(mut self, input: R, mut output: W) -> Result<(), Error>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut commands = lines(input);

        while let Some(command) = commands.next().await {
            let command = command.map_err(map_codec_error)?;
            debug!(%command, "Mock monitor got command");

            let mut words = command.split_whitespace();
            let verb = words.next().unwrap_or_default();

            let reply = match verb {
                "HELLO" => json!({ "eventType": "hello", "message": "OK", "protocolVersion": 1 }),
                "DESCRIBE" => {
                    let descriptor = serde_json::to_value(&self.descriptor)?;
                    json!({ "eventType": "describe", "message": "OK", "port_description": descriptor })
                }
                "CONFIGURE" => {
                    let parameter = words.next().unwrap_or_default();
                    let value = words.next().unwrap_or_default();
                    self.configure(parameter, value)
                }
                "OPEN" => {
                    let target = words.next().unwrap_or_default();
                    let address = words.next().unwrap_or_default();
                    self.open(target, address).await
                }
                "CLOSE" => self.close(),
                "QUIT" => {
                    self.close();
                    send(&mut output, ok("quit")).await?;
                    break;
                }
                other => unsupported(other),
            };

            send(&mut output, reply).await?;
        }

        info!("Mock monitor done");
        Ok(())
    }

    fn configure(&mut self, parameter: &str, value: &str) -> Value {
        let Some(descriptor) = self.descriptor.configuration_parameters.get_mut(parameter) else {
            return failed(
                "configure",
                format!("could not find parameter named {parameter}"),
            );
        };

        if !descriptor.values.iter().any(|allowed| allowed == value) {
            return failed(
                "configure",
                format!("invalid value for parameter {parameter}: {value}"),
            );
        }

        descriptor.selected = value.to_string();
        ok("configure")
    }

    async fn open(&mut self, target: &str, address: &str) -> Value {
        if let Some((opened, _)) = &self.session {
            return failed("open", format!("port already opened: {opened}"));
        }

        let stream = match TcpStream::connect(target).await {
            Ok(stream) => stream,
            Err(e) => return failed("open", format!("can't connect to {target}: {e}")),
        };

        let session = tokio::spawn(echo(stream, address.to_string()));
        self.session = Some((address.to_string(), session));

        ok("open")
    }

    fn close(&mut self) -> Value {
        match self.session.take() {
            Some((address, session)) => {
                session.abort();
                debug!(%address, "Mock port closed");
                ok("close")
            }
            None => failed("close", "port already closed"),
        }
    }
}

async fn echo(mut stream: TcpStream, address: String) {
    let result: io::Result<()> = async {
        stream
            .write_all(format!("Opened port: {address}\n").as_bytes())
            .await?;

        let mut buf = vec![0; 1024];
        loop {
            let read = stream.read(&mut buf).await?;
            if read == 0 {
                return Ok(());
            }

            let mut reply = b"Received: >".to_vec();
            reply.extend_from_slice(&buf[..read]);
            reply.extend_from_slice(b"<\n");
            stream.write_all(&reply).await?;
        }
    }
    .await;

    if let Err(e) = result {
        warn!(%e, %address, "Mock session failed");
    }
}

#[derive(Debug)]
struct MockProcess(JoinHandle<()>);

impl ToolProcess for MockProcess {
    fn terminate(&mut self) -> BoxFuture<'_, io::Result<()>> {
        Box::pin(async move {
            self.0.abort();
            // Either it finished or it was cancelled, both are fine.
            let _ = (&mut self.0).await;
            Ok(())
        })
    }
}

/// Launches `mock-discovery` and `mock-monitor` as tasks instead of processes.
///
/// Arguments after `mock-discovery` are ports, see [`parse_port`].
#[derive(Debug, Default, Clone)]
pub struct MockLauncher;

impl Launcher for MockLauncher {
    fn launch(&self, args: &[String]) -> Result<ToolIo, Error> {
        let (program, rest) = args
            .split_first()
            .ok_or_else(|| Error::BadUsage("Empty command line".into()))?;

        let (client_stdin, tool_stdin) = duplex(PIPE_CAPACITY);
        let (tool_stdout, client_stdout) = duplex(PIPE_CAPACITY);

        let task = match program.as_str() {
            "mock-discovery" => {
                let tool = MockDiscovery::new(rest.iter().map(|arg| parse_port(arg)).collect());
                tokio::spawn(async move {
                    if let Err(e) = tool.serve(tool_stdin, tool_stdout).await {
                        warn!(%e, "Mock discovery failed");
                    }
                })
            }
            "mock-monitor" => tokio::spawn(async move {
                if let Err(e) = MockMonitor::new().serve(tool_stdin, tool_stdout).await {
                    warn!(%e, "Mock monitor failed");
                }
            }),
            _ => {
                return Err(Error::Spawn {
                    command: args.join(" "),
                    source: io::Error::new(io::ErrorKind::NotFound, "no such mock tool"),
                })
            }
        };

        Ok(ToolIo {
            stdin: Box::new(client_stdin),
            stdout: Box::new(client_stdout),
            process: Box::new(MockProcess(task)),
        })
    }
}

/// Hands every launched tool to the test as a [`PipeTool`].
#[derive(Debug)]
pub struct PipeLauncher {
    tools: mpsc::UnboundedSender<PipeTool>,
}

impl PipeLauncher {
    /// The launcher, and where its tools show up.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<PipeTool>) {
        let (tools, receiver) = mpsc::unbounded_channel();
        (Self { tools }, receiver)
    }
}

impl Launcher for PipeLauncher {
    fn launch(&self, args: &[String]) -> Result<ToolIo, Error> {
        let (client_stdin, tool_stdin) = duplex(PIPE_CAPACITY);
        let (tool_stdout, client_stdout) = duplex(PIPE_CAPACITY);
        let terminated = Arc::new(AtomicBool::new(false));

        let tool = PipeTool {
            args: args.to_vec(),
            commands: lines(tool_stdin),
            output: tool_stdout,
            terminated: terminated.clone(),
        };

        self.tools.send(tool).map_err(|_| Error::Spawn {
            command: args.join(" "),
            source: io::Error::new(io::ErrorKind::NotConnected, "nobody takes the tool"),
        })?;

        Ok(ToolIo {
            stdin: Box::new(client_stdin),
            stdout: Box::new(client_stdout),
            process: Box::new(PipeProcess(terminated)),
        })
    }
}

#[derive(Debug)]
struct PipeProcess(Arc<AtomicBool>);

impl ToolProcess for PipeProcess {
    fn terminate(&mut self) -> BoxFuture<'_, io::Result<()>> {
        self.0.store(true, Ordering::SeqCst);
        Box::pin(async { Ok(()) })
    }
}

/// The tool side of a tool launched by a [`PipeLauncher`].
///
/// Dropping it closes the tool's output.
#[derive(Debug)]
pub struct PipeTool {
    /// The command line the tool was launched with.
    pub args: Vec<String>,
    commands: FramedRead<DuplexStream, LinesCodec>,
    output: DuplexStream,
    terminated: Arc<AtomicBool>,
}

impl PipeTool {
    /// The next command line, without its newline.
    pub async fn next_command(&mut self) -> Option<String> {
        self.commands.next().await.and_then(Result::ok)
    }

    /// Write a JSON value followed by a newline.
    pub async fn reply(&mut self, json: &str) {
        self.write_raw(format!("{json}\n").as_bytes()).await;
    }

    /// Write bytes as they are.
    pub async fn write_raw(&mut self, bytes: &[u8]) {
        if let Err(e) = self.output.write_all(bytes).await {
            warn!(%e, "Client is not reading");
        }
    }

    /// Close the tool's output, as if it crashed.
    pub async fn close_output(&mut self) {
        if let Err(e) = self.output.shutdown().await {
            warn!(%e, "Could not close output");
        }
    }

    /// True once the client terminated the tool.
    pub fn was_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }
}
