use color_eyre::Result;
use common::mock_monitor;
use port_keel::{
    error::Error,
    monitor::{MonitorClient, MonitorState},
};
use pretty_assertions::assert_eq;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

mod common;

async fn ready_monitor() -> Result<MonitorClient> {
    common::init_logging();

    let mut monitor = MonitorClient::new_process("serial", mock_monitor()).with_user_agent("tests");
    monitor.run().await?;
    monitor.describe().await?;

    Ok(monitor)
}

#[tokio::test]
async fn echo_session() -> Result<()> {
    let mut monitor = ready_monitor().await?;

    let baudrate = &monitor.port_descriptor().unwrap().configuration_parameters["baudrate"];
    assert_eq!(baudrate.selected, "9600");
    assert!(baudrate.values.contains(&"115200".to_string()));

    monitor.configure("baudrate", "115200").await?;
    let mut session = monitor.open("/dev/ttyACM0", "serial").await?;

    let expected = "Opened port: /dev/ttyACM0\n";
    let mut greeting = vec![0; expected.len()];
    session.read_exact(&mut greeting).await?;
    assert_eq!(String::from_utf8(greeting)?, expected);

    session.write_all(b"hello").await?;
    let expected = "Received: >hello<\n";
    let mut echo = vec![0; expected.len()];
    session.read_exact(&mut echo).await?;
    assert_eq!(String::from_utf8(echo)?, expected);

    monitor.close().await?;

    // The tool closed its side of the session.
    let mut rest = vec![];
    session.read_to_end(&mut rest).await?;
    assert!(rest.is_empty());

    monitor.quit().await?;
    assert_eq!(monitor.state(), MonitorState::Dead);

    Ok(())
}

#[tokio::test]
async fn open_twice_is_refused() -> Result<()> {
    let mut monitor = ready_monitor().await?;
    let _session = monitor.open("/dev/ttyACM0", "serial").await?;

    let problem = monitor
        .open("/dev/ttyACM1", "serial")
        .await
        .unwrap_err()
        .try_into_command_failed()?;
    assert_eq!(problem, "port already opened: /dev/ttyACM0");

    monitor.quit().await?;
    Ok(())
}

#[tokio::test]
async fn close_twice_fails_the_second_time() -> Result<()> {
    let mut monitor = ready_monitor().await?;
    let _session = monitor.open("/dev/ttyACM0", "serial").await?;

    monitor.close().await?;
    assert_eq!(monitor.state(), MonitorState::Ready);

    let err = monitor.close().await.unwrap_err();
    assert_eq!(err.to_string(), "command failed: port already closed");

    monitor.quit().await?;
    Ok(())
}

#[tokio::test]
async fn unknown_parameter_is_refused() -> Result<()> {
    let mut monitor = ready_monitor().await?;

    assert_result_error!(
        monitor.configure("speed", "fast").await,
        Error::CommandFailed { .. }
    );

    monitor.quit().await?;
    Ok(())
}

#[tokio::test]
async fn open_before_describe_is_refused() -> Result<()> {
    common::init_logging();

    let mut monitor = MonitorClient::new_process("serial", mock_monitor());
    monitor.run().await?;

    assert_result_error!(
        monitor.open("/dev/ttyACM0", "serial").await,
        Error::UnsupportedProtocol { .. }
    );

    monitor.quit().await?;
    Ok(())
}
