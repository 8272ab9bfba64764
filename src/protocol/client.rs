use std::{
    fmt::Debug,
    sync::{Arc, Mutex},
    time::Duration,
};

use futures::StreamExt;
use serde::de::DeserializeOwned;
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt},
    sync::mpsc::{self, error::TrySendError},
    time,
};
use tokio_util::codec::FramedRead;
use tracing::{debug, debug_span, info, warn, Instrument};

use super::{codec::JsonCodec, lock};
use crate::{
    error::Error,
    process::{Launcher, ToolIo, ToolProcess},
};

/// Where a decoded message should go.
#[derive(Debug)]
pub(crate) enum Route<M, E> {
    /// To whoever is waiting for a reply.
    Reply(M),

    /// To the event listener.
    Event(E),

    /// Nowhere.
    Discard,
}

/// The messages of one protocol (discovery or monitor).
pub(crate) trait ProtocolMessage: Sized + Send + Debug + 'static {
    /// What is read off the wire before being turned into a message.
    type Envelope: DeserializeOwned + Send + 'static;

    /// Unsolicited messages are turned into these.
    type Event: Send + 'static;

    /// Classify a decoded envelope.
    /// Errors are fatal for the client.
    fn from_envelope(envelope: Self::Envelope) -> Result<Self, Error>;

    /// The wire `eventType`.
    fn event_type(&self) -> &str;

    /// If this is a reply reporting failure, the tool's explanation.
    fn failure(&self) -> Option<&str>;

    /// Decide where this message goes.
    /// `listening` is true while an event listener is installed.
    fn route(self, client_id: &str, listening: bool) -> Route<Self, Self::Event>;

    /// Sent to the listener when it is removed.
    fn closing_event(client_id: &str) -> Option<Self::Event>;
}

/// How many replies may wait for a reader before the tool's output is no longer read.
const REPLY_BUFFER: usize = 16;

struct Shared {
    alive: bool,
    listening: bool,
    error: Option<Error>,
}

/// Asks the decode task, which owns the event listener, to change it.
enum Control<E> {
    Listen(mpsc::Sender<E>),
    Close,
}

/// Talks to one tool: sends commands, and waits for correlated replies.
///
/// Replies are produced by a decode task reading the tool's output.
pub(crate) struct LineClient<M: ProtocolMessage> {
    id: String,
    args: Vec<String>,
    launcher: Arc<dyn Launcher>,
    started: bool,
    stdin: Option<Box<dyn AsyncWrite + Send + Unpin>>,
    process: Option<Box<dyn ToolProcess>>,
    replies: Option<mpsc::Receiver<M>>,
    control: Option<mpsc::UnboundedSender<Control<M::Event>>>,
    shared: Arc<Mutex<Shared>>,
}

impl<M: ProtocolMessage> Debug for LineClient<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LineClient")
            .field("id", &self.id)
            .field("args", &self.args)
            .field("started", &self.started)
            .field("alive", &self.is_alive())
            .finish()
    }
}

fn not_running(started: bool, id: &str) -> Error {
    if started {
        Error::Dead(id.to_string())
    } else {
        Error::NotStarted(id.to_string())
    }
}

impl<M: ProtocolMessage> LineClient<M> {
    pub(crate) fn new(id: String, args: Vec<String>, launcher: Arc<dyn Launcher>) -> Self {
        Self {
            id,
            args,
            launcher,
            started: false,
            stdin: None,
            process: None,
            replies: None,
            control: None,
            shared: Arc::new(Mutex::new(Shared {
                alive: false,
                listening: false,
                error: None,
            })),
        }
    }

    pub(crate) fn id(&self) -> &str {
        &self.id
    }

    pub(crate) fn args(&self) -> &[String] {
        &self.args
    }

    /// Launch the tool and start decoding its output.
    pub(crate) fn start(&mut self) -> Result<(), Error> {
        if self.started {
            return Err(Error::BadUsage(format!("`{}` was already started", self.id)));
        }

        let ToolIo {
            stdin,
            stdout,
            process,
        } = self.launcher.launch(&self.args)?;
        self.started = true;

        let (replies_tx, replies_rx) = mpsc::channel(REPLY_BUFFER);
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        lock(&self.shared).alive = true;

        tokio::spawn(
            decode_loop::<M>(
                self.id.clone(),
                stdout,
                replies_tx,
                control_rx,
                self.shared.clone(),
            )
            .instrument(debug_span!("decode", tool = %self.id)),
        );

        self.stdin = Some(stdin);
        self.process = Some(process);
        self.replies = Some(replies_rx);
        self.control = Some(control_tx);

        info!(tool = %self.id, command = %self.args.join(" "), "Started tool");
        Ok(())
    }

    /// False before start, after termination, and after the decode task stopped.
    pub(crate) fn is_alive(&self) -> bool {
        lock(&self.shared).alive
    }

    /// Write a command, which should include its trailing newline.
    pub(crate) async fn send_command(&mut self, command: &str) -> Result<(), Error> {
        let Some(stdin) = self.stdin.as_mut() else {
            return Err(not_running(self.started, &self.id));
        };

        debug!(tool = %self.id, command = command.trim_end(), "Sending command");

        let mut remaining = command.as_bytes();
        while !remaining.is_empty() {
            let written = stdin.write(remaining).await?;
            if written == 0 {
                return Err(Error::InputClosed);
            }
            remaining = &remaining[written..];
        }
        stdin.flush().await?;

        Ok(())
    }

    /// Wait for the next reply, which must be of the `expected` type and must not report failure.
    pub(crate) async fn wait_message(
        &mut self,
        timeout: Duration,
        expected: &str,
    ) -> Result<M, Error> {
        let Some(replies) = self.replies.as_mut() else {
            return Err(not_running(self.started, &self.id));
        };

        let message = match time::timeout(timeout, replies.recv()).await {
            Ok(Some(message)) => message,
            Ok(None) => return Err(self.take_error()),
            Err(_) => {
                warn!(tool = %self.id, expected, ?timeout, "Timed out waiting for reply");
                return Err(Error::Timeout {
                    expected: expected.to_string(),
                });
            }
        };

        if message.event_type() != expected {
            return Err(Error::OutOfSync {
                expected: expected.to_string(),
                received: message.event_type().to_string(),
            });
        }

        if let Some(problem) = message.failure() {
            return Err(Error::CommandFailed {
                command: expected.to_string(),
                message: problem.to_string(),
            });
        }

        Ok(message)
    }

    // The decode error is reported once, after that the client is simply dead.
    fn take_error(&self) -> Error {
        lock(&self.shared)
            .error
            .take()
            .unwrap_or_else(|| Error::Dead(self.id.clone()))
    }

    /// Route unsolicited messages to a new channel.
    pub(crate) fn listen(&self, buffer: usize) -> Result<mpsc::Receiver<M::Event>, Error> {
        let Some(control) = self.control.as_ref() else {
            return Err(not_running(self.started, &self.id));
        };

        let mut shared = lock(&self.shared);
        if shared.listening {
            return Err(Error::BadUsage(format!(
                "`{}` is already streaming events",
                self.id
            )));
        }

        let (tx, rx) = mpsc::channel(buffer.max(1));
        control
            .send(Control::Listen(tx))
            .map_err(|_| Error::Dead(self.id.clone()))?;
        shared.listening = true;

        Ok(rx)
    }

    pub(crate) fn is_listening(&self) -> bool {
        lock(&self.shared).listening
    }

    /// Remove the event listener, if any.
    /// It gets the closing event after any event already on its way.
    pub(crate) fn stop_listening(&self) {
        lock(&self.shared).listening = false;

        if let Some(control) = self.control.as_ref() {
            // A finished decode task has already closed the listener.
            let _ = control.send(Control::Close);
        }
    }

    /// Kill the tool and wait for it.
    /// The client can not be used afterwards.
    pub(crate) async fn terminate(&mut self) {
        self.stdin = None;
        self.replies = None;

        if let Some(mut process) = self.process.take() {
            match process.terminate().await {
                Ok(()) => debug!(tool = %self.id, "Tool terminated"),
                Err(e) => warn!(tool = %self.id, %e, "Could not terminate tool"),
            }
        }

        lock(&self.shared).alive = false;
        self.stop_listening();
    }
}

fn close_listener<M: ProtocolMessage>(id: &str, events: Option<mpsc::Sender<M::Event>>) {
    let (Some(events), Some(event)) = (events, M::closing_event(id)) else {
        return;
    };

    if let Err(TrySendError::Full(event)) = events.try_send(event) {
        tokio::spawn(async move {
            let _ = events.send(event).await;
        });
    }
}

async fn decode_loop<M: ProtocolMessage>(
    id: String,
    stdout: Box<dyn AsyncRead + Send + Unpin>,
    replies: mpsc::Sender<M>,
    mut control: mpsc::UnboundedReceiver<Control<M::Event>>,
    shared: Arc<Mutex<Shared>>,
) {
    let mut framed = FramedRead::new(stdout, JsonCodec::<M::Envelope>::new());

    // Only this task sends events, so nothing can follow the closing event.
    let mut events: Option<mpsc::Sender<M::Event>> = None;

    let error = loop {
        let next = tokio::select! {
            biased;

            Some(request) = control.recv() => {
                match request {
                    Control::Listen(listener) => {
                        close_listener::<M>(&id, events.replace(listener));
                    }
                    Control::Close => close_listener::<M>(&id, events.take()),
                }
                continue;
            }
            next = framed.next() => next,
        };

        let envelope = match next {
            Some(Ok(envelope)) => envelope,
            Some(Err(e)) => break e,
            None => break Error::OutputClosed,
        };

        let message = match M::from_envelope(envelope) {
            Ok(message) => message,
            Err(e) => break e,
        };
        debug!(event_type = message.event_type(), "Received message");

        match message.route(&id, events.is_some()) {
            Route::Reply(message) => {
                if replies.send(message).await.is_err() {
                    debug!("Client is gone");
                    break Error::Dead(id.clone());
                }
            }
            Route::Event(event) => {
                if let Some(listener) = events.as_ref() {
                    if listener.send(event).await.is_err() {
                        debug!("Event listener is gone");
                    }
                }
            }
            Route::Discard => {}
        }
    };

    info!(%error, "Decoding stopped");

    {
        let mut shared = lock(&shared);
        shared.alive = false;
        shared.listening = false;
        shared.error = Some(error);
    }

    drop(replies);
    close_listener::<M>(&id, events.take());

    // Listeners asked for while we were stopping still get their closing event.
    control.close();
    while let Ok(request) = control.try_recv() {
        if let Control::Listen(listener) = request {
            close_listener::<M>(&id, Some(listener));
        }
    }
}
