use color_eyre::Result;
use port_keel::mock::MockMonitor;

/// A serial monitor tool for testing purposes.
/// Speaks the monitor protocol on stdin/stdout, and echoes data sent over opened ports.
#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    MockMonitor::new()
        .serve(tokio::io::stdin(), tokio::io::stdout())
        .await?;

    Ok(())
}
