use std::{sync::Arc, time::Duration};

use color_eyre::Result;
use common::next_tool;
use port_keel::{
    discovery::{DiscoveryClient, DiscoveryState},
    error::Error,
    mock::{PipeLauncher, PipeTool},
};
use pretty_assertions::assert_eq;
use tokio::sync::mpsc;

mod common;

async fn started() -> Result<(DiscoveryClient, PipeTool, mpsc::UnboundedReceiver<PipeTool>)> {
    common::init_logging();

    let (launcher, mut tools) = PipeLauncher::new();
    let mut client = DiscoveryClient::new("scripted", vec!["tool".into()], Arc::new(launcher));
    client.start()?;
    let tool = next_tool(&mut tools).await?;

    Ok((client, tool, tools))
}

#[tokio::test]
async fn reply_split_across_writes() -> Result<()> {
    let (mut client, mut tool, _tools) = started().await?;

    let (result, _) = tokio::join!(client.run_start(), async {
        assert_eq!(tool.next_command().await.unwrap(), "START");
        tool.write_raw(br#"{"eventType":"st"#).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        tool.write_raw(br#"art","message":"OK"}"#).await;
    });

    result?;
    assert_eq!(client.state(), DiscoveryState::Running);

    Ok(())
}

#[tokio::test]
async fn back_to_back_replies() -> Result<()> {
    let (mut client, mut tool, _tools) = started().await?;

    let (result, _) = tokio::join!(client.run_start(), async {
        tool.next_command().await.unwrap();
        tool.write_raw(
            br#"{"eventType":"start","message":"OK"}{"eventType":"list","message":"OK","ports":[{"address":"COM9","protocol":"serial"}]}"#,
        )
        .await;
    });
    result?;

    let ports = client.list().await?;
    assert_eq!(ports.len(), 1);
    assert_eq!(ports[0].key(), "COM9|serial");

    assert_eq!(tool.next_command().await.unwrap(), "LIST");

    Ok(())
}

#[tokio::test]
async fn closed_output_kills_client() -> Result<()> {
    let (mut client, mut tool, _tools) = started().await?;
    tool.close_output().await;

    assert_result_error!(client.run_start().await, Error::OutputClosed);
    assert_eq!(client.state(), DiscoveryState::Dead);

    // The reason was already reported.
    assert_result_error!(client.run_start().await, Error::Dead(_));

    Ok(())
}

#[tokio::test]
async fn output_closing_wakes_a_waiting_command() -> Result<()> {
    let (mut client, mut tool, _tools) = started().await?;

    let (result, _) = tokio::join!(client.run_start(), async {
        assert_eq!(tool.next_command().await.unwrap(), "START");
        tokio::time::sleep(Duration::from_millis(50)).await;
        tool.close_output().await;
    });

    assert_result_error!(result, Error::OutputClosed);
    assert_eq!(client.state(), DiscoveryState::Dead);

    Ok(())
}

#[tokio::test]
async fn chatty_tool_is_not_read_ahead_of_the_client() -> Result<()> {
    let (mut client, mut tool, _tools) = started().await?;

    // Far more unsolicited replies than pipes and buffers can hold.
    let chatter = r#"{"eventType":"hello","message":"OK"}"#.repeat(16 * 1024);
    let flooded =
        tokio::time::timeout(Duration::from_millis(500), tool.write_raw(chatter.as_bytes())).await;
    assert!(flooded.is_err(), "the tool's output was read without limit");

    // The queued replies are still there, in order.
    let err = client.run_start().await.unwrap_err();
    assert_eq!(
        err.to_string(),
        "communication out of sync, expected 'start', received 'hello'"
    );

    Ok(())
}

#[tokio::test]
async fn garbage_output_kills_client() -> Result<()> {
    let (mut client, mut tool, _tools) = started().await?;

    let (result, _) = tokio::join!(client.run_start(), async {
        tool.next_command().await.unwrap();
        tool.write_raw(b"Segmentation fault\n").await;
    });

    assert_result_error!(result, Error::Decode(_));
    assert_eq!(client.state(), DiscoveryState::Dead);

    Ok(())
}

#[tokio::test]
async fn wrong_reply_is_out_of_sync() -> Result<()> {
    let (mut client, mut tool, _tools) = started().await?;

    let (result, _) = tokio::join!(client.run_start(), async {
        tool.next_command().await.unwrap();
        tool.reply(r#"{"eventType":"stop","message":"OK"}"#).await;
    });

    let err = result.unwrap_err();
    assert_eq!(
        err.to_string(),
        "communication out of sync, expected 'start', received 'stop'"
    );

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn silent_tool_times_out() -> Result<()> {
    let (mut client, mut tool, _tools) = started().await?;

    let (result, _) = tokio::join!(client.run_start(), tool.next_command());

    let err = result.unwrap_err();
    assert!(err.is_timeout(), "{err}");
    assert_eq!(err.to_string(), "timeout waiting for message");

    Ok(())
}
