use clap::Parser;
use color_eyre::Result;
use port_keel::mock::{parse_port, MockDiscovery};

/// A discovery tool for testing purposes.
/// Speaks the discovery protocol on stdin/stdout and always reports the same ports.
#[derive(Parser, Debug)]
struct Args {
    /// Ports to report, as `protocol:address` (e.g. `serial:/dev/ttyACM0`).
    /// Without a protocol, `serial` is assumed.
    ports: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let args = Args::parse();

    let ports = args.ports.iter().map(|port| parse_port(port)).collect();

    MockDiscovery::new(ports)
        .serve(tokio::io::stdin(), tokio::io::stdout())
        .await?;

    Ok(())
}
