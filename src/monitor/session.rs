use std::io;

use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
};
use tracing::debug;

/// Shuttle data between an opened monitor session and local streams.
///
/// Whatever is read from `input` goes to the port, whatever the port
/// sends goes to `output`. Returns when either side closes.
pub async fn relay<R, W>(session: TcpStream, mut input: R, mut output: W) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let (mut from_port, mut to_port) = session.into_split();

    tokio::select! {
        sent = tokio::io::copy(&mut input, &mut to_port) => {
            debug!(bytes = sent?, "Input closed");
            to_port.shutdown().await?;
        }
        received = tokio::io::copy(&mut from_port, &mut output) => {
            debug!(bytes = received?, "Port closed");
        }
    }

    output.flush().await
}
