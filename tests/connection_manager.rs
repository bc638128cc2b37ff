mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use common::*;
use meshrelay::error::RelayError;
use meshrelay::meshtastic::{
    ConnectionConfig, ConnectionManager, ConnectionState, ConnectionTuning, TransportTarget,
};
use meshrelay::relay::MeshSender;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Instant};
use tokio_test::assert_ok;

fn manager(factory: Arc<MockFactory>, retry_limit: u32) -> Arc<ConnectionManager> {
    manager_with(factory, tcp_config(retry_limit))
}

fn manager_with(factory: Arc<MockFactory>, config: ConnectionConfig) -> Arc<ConnectionManager> {
    let (tx, _rx) = mpsc::channel(16);
    ConnectionManager::new(config, ConnectionTuning::default(), factory, tx)
}

async fn wait_for_state(manager: &ConnectionManager, wanted: ConnectionState) {
    let mut rx = manager.subscribe();
    timeout(Duration::from_secs(3600), rx.wait_for(|s| *s == wanted))
        .await
        .expect("state change timed out")
        .expect("state channel closed");
}

#[tokio::test(start_paused = true)]
async fn connect_gives_up_after_retry_limit() {
    let factory = MockFactory::new(vec![], OpenStep::Fail);
    let manager = manager(factory.clone(), 3);

    let start = Instant::now();
    let err = match manager.connect(false).await {
        Err(e) => e,
        Ok(_) => panic!("connect should fail"),
    };
    assert!(matches!(err, RelayError::ConnectExhausted { attempts: 3, .. }));
    assert_eq!(factory.opens(), 3);
    // Sleeps of 1s and 2s between the three attempts.
    assert_eq!(start.elapsed(), Duration::from_secs(3));
    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert!(manager.current().is_none());
}

#[tokio::test(start_paused = true)]
async fn connect_retries_until_success() {
    let factory = MockFactory::new(vec![OpenStep::Fail, OpenStep::Fail], OpenStep::Succeed);
    let manager = manager(factory.clone(), 3);

    let handle = manager.connect(false).await.expect("third attempt succeeds");
    assert_eq!(handle.describe(), "mock:0");
    assert_eq!(factory.opens(), 3);
    assert_eq!(manager.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn connect_is_idempotent_unless_forced() {
    let factory = MockFactory::new(vec![], OpenStep::Succeed);
    let manager = manager(factory.clone(), 3);

    let first = manager.connect(false).await.unwrap();
    let again = manager.connect(false).await.unwrap();
    assert!(Arc::ptr_eq(&first, &again));
    assert_eq!(factory.opens(), 1);

    let forced = manager.connect(true).await.unwrap();
    assert_eq!(forced.describe(), "mock:1");
    assert_eq!(factory.opens(), 2);
    assert!(factory.handle(0).closed.load(Ordering::SeqCst));
}

#[tokio::test]
async fn configuration_errors_are_not_retried() {
    let factory = MockFactory::new(vec![], OpenStep::ConfigError);
    let manager = manager(factory.clone(), 5);
    assert!(matches!(
        manager.connect(false).await,
        Err(RelayError::Config(_))
    ));
    assert_eq!(factory.opens(), 1);
    assert_eq!(manager.state(), ConnectionState::Disconnected);

    let factory = MockFactory::new(vec![], OpenStep::Succeed);
    let missing_target = ConnectionConfig {
        target: TransportTarget::Ble {
            address: String::new(),
        },
        retry_limit: 3,
        meshnet_name: MESHNET.into(),
    };
    let manager = manager_with(factory.clone(), missing_target);
    assert!(matches!(
        manager.connect(false).await,
        Err(RelayError::Config(_))
    ));
    assert_eq!(factory.opens(), 0);
}

#[tokio::test(start_paused = true)]
async fn lost_link_reconnects_with_doubling_backoff() {
    let factory = MockFactory::new(
        vec![
            OpenStep::Succeed,
            OpenStep::Fail,
            OpenStep::Fail,
            OpenStep::Succeed,
        ],
        OpenStep::Fail,
    );
    let manager = manager(factory.clone(), 1);
    manager.connect(false).await.unwrap();
    let _supervisor = manager.spawn_supervisor().unwrap();

    let start = Instant::now();
    factory.sink(0).lost();
    wait_for_state(&manager, ConnectionState::Reconnecting).await;
    assert!(manager.current().is_none());
    wait_for_state(&manager, ConnectionState::Connected).await;
    assert!(factory.handle(0).closed.load(Ordering::SeqCst));

    // 10s, then 20s, then 40s before the successful attempt.
    assert_eq!(start.elapsed(), Duration::from_secs(70));
    assert_eq!(factory.opens(), 4);
    assert_eq!(manager.current().unwrap().describe(), "mock:1");
    manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn failed_probe_triggers_a_single_reconnect() {
    let factory = MockFactory::new(vec![OpenStep::Succeed, OpenStep::Succeed], OpenStep::Fail);
    let manager = manager(factory.clone(), 1);
    manager.connect(false).await.unwrap();
    let _supervisor = manager.spawn_supervisor().unwrap();

    factory.handle(0).probe_fails.store(true, Ordering::SeqCst);
    wait_for_state(&manager, ConnectionState::Reconnecting).await;

    // Health ticks keep firing during the 10s backoff; none may start another loop.
    assert!(!manager.check_health().await);
    assert!(!manager.report_lost("again"));
    wait_for_state(&manager, ConnectionState::Connected).await;
    sleep(Duration::from_secs(30)).await;

    assert_eq!(factory.opens(), 2);
    assert_eq!(manager.state(), ConnectionState::Connected);
    manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn hung_probe_is_bounded_by_timeout() {
    let factory = MockFactory::new(vec![OpenStep::Succeed, OpenStep::Succeed], OpenStep::Fail);
    let manager = manager(factory.clone(), 1);
    manager.connect(false).await.unwrap();

    factory.handle(0).probe_hangs.store(true, Ordering::SeqCst);
    let start = Instant::now();
    assert!(!manager.check_health().await);
    assert_eq!(start.elapsed(), Duration::from_secs(3));
    assert_eq!(manager.state(), ConnectionState::Reconnecting);
    manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn stale_generation_loss_is_ignored() {
    let factory = MockFactory::new(vec![], OpenStep::Succeed);
    let manager = manager(factory.clone(), 1);
    manager.connect(false).await.unwrap();
    manager.connect(true).await.unwrap();
    let _supervisor = manager.spawn_supervisor().unwrap();

    // The first handle was replaced; its late loss report must not tear down the second.
    factory.sink(0).lost();
    sleep(Duration::from_millis(100)).await;
    assert_eq!(manager.state(), ConnectionState::Connected);
    assert_eq!(factory.opens(), 2);
    assert_eq!(manager.current().unwrap().describe(), "mock:1");
    manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn schedule_reconnect_recovers_from_failed_startup() {
    let factory = MockFactory::new(vec![OpenStep::Fail], OpenStep::Succeed);
    let manager = manager(factory.clone(), 1);
    assert!(manager.connect(false).await.is_err());

    assert!(manager.schedule_reconnect());
    assert!(!manager.schedule_reconnect());
    wait_for_state(&manager, ConnectionState::Connected).await;
    assert_eq!(factory.opens(), 2);
    manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn shutdown_stops_reconnecting() {
    let factory = MockFactory::new(vec![OpenStep::Succeed], OpenStep::Fail);
    let manager = manager(factory.clone(), 1);
    manager.connect(false).await.unwrap();
    assert!(manager.report_lost("test"));
    wait_for_state(&manager, ConnectionState::Reconnecting).await;

    manager.shutdown().await;
    sleep(Duration::from_secs(600)).await;
    assert_eq!(factory.opens(), 1);
    assert_eq!(manager.state(), ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn failed_connect_during_reconnect_keeps_the_running_loop() {
    let factory = MockFactory::new(vec![OpenStep::Succeed], OpenStep::Fail);
    let manager = manager(factory.clone(), 1);
    manager.connect(false).await.unwrap();
    assert!(manager.report_lost("cable pulled"));

    // A caller asking for the link while the loop waits out its first 10s backoff.
    assert!(manager.connect(false).await.is_err());
    assert_eq!(manager.state(), ConnectionState::Reconnecting);
    assert!(!manager.schedule_reconnect());
    assert_eq!(factory.opens(), 2);

    // One loop means one open at the 10s mark, not two.
    sleep(Duration::from_secs(11)).await;
    assert_eq!(factory.opens(), 3);
    assert_eq!(manager.state(), ConnectionState::Reconnecting);
    manager.shutdown().await;
}

#[tokio::test]
async fn connect_after_shutdown_opens_nothing() {
    let factory = MockFactory::new(vec![], OpenStep::Succeed);
    let manager = manager(factory.clone(), 3);
    manager.shutdown().await;

    assert!(matches!(
        manager.connect(true).await,
        Err(RelayError::NotConnected)
    ));
    assert_eq!(factory.opens(), 0);
    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert!(manager.current().is_none());
}

#[tokio::test]
async fn mesh_sender_uses_live_handle() {
    let factory = MockFactory::new(vec![], OpenStep::Succeed);
    let manager = manager(factory.clone(), 1);
    assert!(matches!(
        manager.send_text(0, "early").await,
        Err(RelayError::NotConnected)
    ));

    manager.connect(false).await.unwrap();
    assert_ok!(manager.send_text(2, "hello mesh").await);
    assert_eq!(
        factory.handle(0).sent.lock().unwrap().clone(),
        vec![(2, "hello mesh".to_string())]
    );
}
