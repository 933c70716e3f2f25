//! Integration tests for connectivity-triggered reconnection

mod common;

use common::{machine, server, wait_for, FakeDriver, ScriptedReachability};
use std::sync::Arc;
use std::time::Duration;
use tunwatch_core::signal::Broadcaster;
use tunwatch_core::types::Protocol;
use tunwatch_core::vpn::{AutoReconnectPolicy, AutoReconnectService, ConnectionState};

fn policy(max_attempts: u32) -> AutoReconnectPolicy {
    AutoReconnectPolicy {
        enabled: true,
        max_attempts,
        base_delay_secs: 2,
    }
}

fn single_protocol_server() -> tunwatch_core::types::ServerDescriptor {
    server().with_protocols([Protocol::Primary])
}

#[tokio::test(start_paused = true)]
async fn test_restoration_reconnects_with_linear_backoff() {
    let reachability = ScriptedReachability::unreachable();
    let engine = machine(FakeDriver::new(), reachability.clone());
    let online = Arc::new(Broadcaster::with_initial(false));
    let service = AutoReconnectService::new(engine.clone(), online.clone(), policy(3));

    service.start(single_protocol_server());
    online.publish(true);
    tokio::time::sleep(Duration::from_secs(60)).await;

    // One handshake per attempt: initial, then after 2s and 4s of backoff
    let times = reachability.call_times();
    assert_eq!(times.len(), 3);
    assert!(times[1] - times[0] >= Duration::from_secs(2));
    assert!(times[2] - times[1] >= Duration::from_secs(4));
    assert!(engine.current_state().is_error());
}

#[tokio::test(start_paused = true)]
async fn test_initial_online_emission_is_not_a_restoration() {
    let reachability = ScriptedReachability::new(Protocol::ALL);
    let engine = machine(FakeDriver::new(), reachability.clone());
    let online = Arc::new(Broadcaster::with_initial(true));
    let service = AutoReconnectService::new(engine.clone(), online, policy(3));

    service.start(server());
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert!(reachability.calls().is_empty());
    assert_eq!(engine.current_state(), ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_campaign_succeeds_after_failures() {
    let reachability = ScriptedReachability::new([Protocol::Primary]);
    reachability.fail_first(Protocol::Primary, 2);
    let driver = FakeDriver::new();
    let engine = machine(driver.clone(), reachability.clone());
    let mut transitions = engine.observe_transitions();
    let online = Arc::new(Broadcaster::with_initial(false));
    let service = AutoReconnectService::new(engine.clone(), online.clone(), policy(5));

    service.start(single_protocol_server());
    online.publish(true);

    wait_for(&mut transitions, ConnectionState::is_connected).await;
    assert_eq!(reachability.calls().len(), 3);
    assert_eq!(driver.open_count(), 1);

    // Restored while connected: nothing to do
    online.publish(false);
    online.publish(true);
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(reachability.calls().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_explicit_disconnect_suppresses_restoration() {
    let reachability = ScriptedReachability::new([Protocol::Primary]);
    let engine = machine(FakeDriver::new(), reachability.clone());
    let mut transitions = engine.observe_transitions();
    let online = Arc::new(Broadcaster::with_initial(false));
    let service = AutoReconnectService::new(engine.clone(), online.clone(), policy(5));

    service.start(single_protocol_server());
    online.publish(true);
    wait_for(&mut transitions, ConnectionState::is_connected).await;

    engine.disconnect().await;
    wait_for(&mut transitions, |s| *s == ConnectionState::Disconnected).await;

    online.publish(false);
    online.publish(true);
    tokio::time::sleep(Duration::from_secs(30)).await;

    assert_eq!(engine.current_state(), ConnectionState::Disconnected);
    assert_eq!(reachability.calls().len(), 1);
    assert!(service.is_running());
}

#[tokio::test(start_paused = true)]
async fn test_new_campaign_after_user_reconnects_starts_without_backoff() {
    let reachability = ScriptedReachability::new([Protocol::Primary]);
    let driver = FakeDriver::new();
    let engine = machine(driver.clone(), reachability.clone());
    let mut transitions = engine.observe_transitions();
    let online = Arc::new(Broadcaster::with_initial(true));
    let service = AutoReconnectService::new(engine.clone(), online.clone(), policy(5));
    service.start(single_protocol_server());

    engine.connect(single_protocol_server()).await;
    wait_for(&mut transitions, ConnectionState::is_connected).await;
    engine.disconnect().await;
    wait_for(&mut transitions, |s| *s == ConnectionState::Disconnected).await;

    // Connecting again by hand re-arms the service
    engine.connect(single_protocol_server()).await;
    wait_for(&mut transitions, ConnectionState::is_connected).await;

    // Network goes away long enough for mid-session recovery to give up
    reachability.set_reachable([]);
    online.publish(false);
    driver.drop_tunnel("network_lost");
    wait_for(&mut transitions, ConnectionState::is_error).await;
    let calls_before = reachability.calls().len();

    reachability.set_reachable([Protocol::Primary]);
    let restored_at = tokio::time::Instant::now();
    online.publish(true);
    wait_for(&mut transitions, ConnectionState::is_connected).await;

    let times = reachability.call_times();
    assert_eq!(times.len(), calls_before + 1);
    assert!(times[calls_before] - restored_at < Duration::from_secs(1));
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_during_campaign_clears_pending_retry() {
    let reachability = ScriptedReachability::unreachable();
    reachability.set_latency(Duration::from_secs(1));
    let engine = machine(FakeDriver::new(), reachability.clone());
    let mut transitions = engine.observe_transitions();
    let online = Arc::new(Broadcaster::with_initial(false));
    let service = AutoReconnectService::new(engine.clone(), online.clone(), policy(5));

    service.start(single_protocol_server());
    online.publish(true);

    // First attempt fails after 1s, the retry starts 2s later
    wait_for(&mut transitions, ConnectionState::is_error).await;
    wait_for(&mut transitions, |s| matches!(s, ConnectionState::Connecting { .. })).await;
    assert_eq!(reachability.calls().len(), 2);

    engine.disconnect().await;
    wait_for(&mut transitions, |s| *s == ConnectionState::Disconnected).await;

    tokio::time::sleep(Duration::from_secs(60)).await;
    online.publish(false);
    online.publish(true);
    tokio::time::sleep(Duration::from_secs(60)).await;

    assert_eq!(reachability.calls().len(), 2);
    assert_eq!(engine.current_state(), ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_budget_exhaustion_leaves_error() {
    let reachability = ScriptedReachability::unreachable();
    let engine = machine(FakeDriver::new(), reachability.clone());
    let online = Arc::new(Broadcaster::with_initial(false));
    let service = AutoReconnectService::new(engine.clone(), online.clone(), policy(2));

    service.start(single_protocol_server());
    online.publish(true);
    tokio::time::sleep(Duration::from_secs(120)).await;

    assert_eq!(reachability.calls().len(), 2);
    assert!(engine.current_state().is_error());
    // The service keeps watching for the next restoration
    assert!(service.is_running());
}

#[tokio::test(start_paused = true)]
async fn test_stop_does_not_disconnect() {
    let driver = FakeDriver::new();
    let engine = machine(driver.clone(), ScriptedReachability::new(Protocol::ALL));
    let mut transitions = engine.observe_transitions();
    let online = Arc::new(Broadcaster::with_initial(true));
    let service = AutoReconnectService::new(engine.clone(), online, policy(3));

    service.start(server());
    engine.connect(server()).await;
    wait_for(&mut transitions, ConnectionState::is_connected).await;

    service.stop();
    tokio::task::yield_now().await;

    assert!(!service.is_running());
    assert!(engine.current_state().is_connected());
    assert_eq!(driver.close_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_start_is_idempotent() {
    let reachability = ScriptedReachability::new(Protocol::ALL);
    let engine = machine(FakeDriver::new(), reachability.clone());
    let online = Arc::new(Broadcaster::with_initial(false));
    let service = AutoReconnectService::new(engine.clone(), online.clone(), policy(3));

    service.start(server());
    service.start(server());
    assert!(service.is_running());

    online.publish(true);
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(reachability.calls().len(), 1);
    assert_eq!(online.subscriber_count(), 1);
}
