use color_eyre::Result;
use common::{mock_discovery, next_event, next_events_sorted};
use port_keel::{
    discovery::{DiscoveryClient, DiscoveryManager},
    error::Error,
    port::Port,
};
use pretty_assertions::assert_eq;

mod common;

async fn manager_with_two_discoveries() -> Result<DiscoveryManager> {
    common::init_logging();

    let manager = DiscoveryManager::default();
    manager
        .add("serial", mock_discovery(&["serial:/dev/ttyACM0", "serial:/dev/ttyACM1"]))
        .await?;
    manager
        .add("network", mock_discovery(&["network:10.0.0.7"]))
        .await?;

    Ok(manager)
}

#[tokio::test]
async fn watcher_sees_every_port() -> Result<()> {
    let manager = manager_with_two_discoveries().await?;
    let mut watcher = manager.watch().await;

    let events = next_events_sorted(&mut watcher, 3).await?;

    assert_add!(&events[0], "/dev/ttyACM0|serial");
    assert_add!(&events[1], "/dev/ttyACM1|serial");
    assert_add!(&events[2], "10.0.0.7|network");
    assert_eq!(events[2].discovery_id, "network");

    manager.clear().await;
    Ok(())
}

#[tokio::test]
async fn late_watcher_is_replayed_the_cache() -> Result<()> {
    let manager = manager_with_two_discoveries().await?;
    let mut first = manager.watch().await;
    next_events_sorted(&mut first, 3).await?;

    let mut late = manager.watch().await;
    let replayed = next_events_sorted(&mut late, 3).await?;

    assert_add!(&replayed[0], "/dev/ttyACM0|serial");
    assert_add!(&replayed[2], "10.0.0.7|network");

    let mut listed = manager.list().await;
    listed.sort_by_key(Port::key);
    assert_eq!(
        listed.iter().map(Port::key).collect::<Vec<_>>(),
        vec!["/dev/ttyACM0|serial", "/dev/ttyACM1|serial", "10.0.0.7|network"]
    );

    manager.clear().await;
    Ok(())
}

#[tokio::test]
async fn clear_removes_every_port() -> Result<()> {
    let manager = manager_with_two_discoveries().await?;
    let mut watcher = manager.watch().await;
    next_events_sorted(&mut watcher, 3).await?;

    manager.clear().await;

    let removed = next_events_sorted(&mut watcher, 3).await?;
    assert_remove!(&removed[0], "/dev/ttyACM0|serial");
    assert_remove!(&removed[1], "/dev/ttyACM1|serial");
    assert_remove!(&removed[2], "10.0.0.7|network");

    assert!(manager.ids().is_empty());

    Ok(())
}

#[tokio::test]
async fn one_broken_discovery_does_not_stop_the_others() -> Result<()> {
    common::init_logging();

    let manager = DiscoveryManager::default();
    manager.add("good", mock_discovery(&["COM1"])).await?;
    manager
        .add("broken", vec!["/no/such/discovery".into()])
        .await?;

    let errors = manager.start().await;
    assert_eq!(errors.len(), 1);
    assert!(
        matches!(&errors[0], Error::DiscoveryStart { id, .. } if id == "broken"),
        "{}",
        errors[0]
    );

    let mut watcher = manager.watch().await;
    assert_add!(next_event(&mut watcher).await?, "COM1|serial");

    manager.clear().await;
    Ok(())
}

#[tokio::test]
async fn managers_can_share_discoveries() -> Result<()> {
    common::init_logging();

    let first = DiscoveryManager::default();
    first
        .add_client(DiscoveryClient::new_process("a", mock_discovery(&["COM1"])))
        .await?;
    first.add("b", mock_discovery(&["COM2"])).await?;

    let second = DiscoveryManager::default();
    second.add("b", mock_discovery(&["COM3"])).await?;
    second.add_all_discoveries_from(&first).await;

    // `b` was already there, so only `a` was added.
    assert_eq!(second.ids(), vec!["a", "b"]);

    assert_result_error!(
        second.add("a", mock_discovery(&[])).await,
        Error::DuplicateDiscovery(_)
    );

    Ok(())
}
