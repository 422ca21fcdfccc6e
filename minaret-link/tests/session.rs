use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use minaret_core::{
    Command, DeviceId, DeviceIdentity, DeviceStatus, Report,
};
use minaret_link::{
    CancellationToken, CoordinatorLink, LinkConfig, LinkEvent, SessionReporter, read_frame,
    write_frame,
};
use tokio::net::TcpListener;

struct StubReporter {
    device_id: DeviceId,
}

#[async_trait]
impl SessionReporter for StubReporter {
    async fn registration(&self) -> Report {
        Report::DeviceRegister {
            device_id: self.device_id.clone(),
            device_info: identity(&self.device_id),
            status: DeviceStatus::Ready,
            timestamp: jiff::Timestamp::UNIX_EPOCH,
        }
    }

    async fn heartbeat(&self) -> Report {
        Report::StatusUpdate {
            device_id: self.device_id.clone(),
            status: DeviceStatus::Ready,
            system_info: None,
            timestamp: jiff::Timestamp::UNIX_EPOCH,
        }
    }
}

fn identity(device_id: &DeviceId) -> DeviceIdentity {
    DeviceIdentity {
        device_id: device_id.clone(),
        serial_number: "0000000012345678".into(),
        mac_address: "b8:27:eb:00:00:01".into(),
        model: "Raspberry Pi 4 Model B".into(),
        created_at: jiff::Timestamp::UNIX_EPOCH,
    }
}

fn config(addr: std::net::SocketAddr, reconnect: Duration, heartbeat: Duration) -> LinkConfig {
    LinkConfig {
        coordinator_addr: addr,
        connect_timeout: Duration::from_secs(1),
        reconnect_delay: reconnect,
        heartbeat_interval: heartbeat,
    }
}

async fn start_link(
    addr: std::net::SocketAddr,
    reconnect: Duration,
    heartbeat: Duration,
    cancel: CancellationToken,
) -> (minaret_link::LinkHandle, tokio::sync::mpsc::Receiver<LinkEvent>) {
    let reporter = Arc::new(StubReporter {
        device_id: DeviceId("MNRT-TEST0001".into()),
    });
    CoordinatorLink::new(config(addr, reconnect, heartbeat), reporter).start(cancel)
}

async fn expect_event(
    events: &mut tokio::sync::mpsc::Receiver<LinkEvent>,
    wanted: LinkEvent,
) {
    let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("timed out waiting for link event")
        .expect("event channel closed");
    assert_eq!(event, wanted);
}

#[tokio::test]
async fn registers_on_connect_and_carries_traffic_both_ways() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let cancel = CancellationToken::new();
    let (handle, mut events) = start_link(
        addr,
        Duration::from_millis(50),
        Duration::from_secs(60),
        cancel.clone(),
    )
    .await;

    let (mut coordinator, _) = listener.accept().await.unwrap();

    let registration: Report = read_frame(&mut coordinator).await.unwrap();
    assert!(matches!(registration, Report::DeviceRegister { .. }));
    expect_event(&mut events, LinkEvent::Connected).await;
    assert!(handle.is_connected());

    // Coordinator pushes a command; the agent side sees it as an event.
    write_frame(&mut coordinator, &Command::MuteUpdate { muted: true })
        .await
        .unwrap();
    expect_event(&mut events, LinkEvent::Command(Command::MuteUpdate { muted: true })).await;

    // Outbound report reaches the coordinator.
    handle.send(Report::StatusUpdate {
        device_id: DeviceId("MNRT-TEST0001".into()),
        status: DeviceStatus::Maintenance,
        system_info: None,
        timestamp: jiff::Timestamp::UNIX_EPOCH,
    });
    let report: Report = read_frame(&mut coordinator).await.unwrap();
    assert!(matches!(
        report,
        Report::StatusUpdate { status: DeviceStatus::Maintenance, .. }
    ));

    cancel.cancel();
}

#[tokio::test]
async fn reconnects_after_drop_and_resumes_heartbeats() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let reconnect_delay = Duration::from_millis(200);

    let cancel = CancellationToken::new();
    let (handle, mut events) = start_link(
        addr,
        reconnect_delay,
        Duration::from_millis(100),
        cancel.clone(),
    )
    .await;

    // First session: registration, then the coordinator drops it.
    let (mut coordinator, _) = listener.accept().await.unwrap();
    let _: Report = read_frame(&mut coordinator).await.unwrap();
    expect_event(&mut events, LinkEvent::Connected).await;

    let dropped_at = Instant::now();
    drop(coordinator);

    expect_event(&mut events, LinkEvent::Disconnected).await;
    assert!(!handle.is_connected());

    // One reconnect attempt after the flat backoff, registering anew.
    let (mut coordinator, _) = listener.accept().await.unwrap();
    let registration: Report = read_frame(&mut coordinator).await.unwrap();
    assert!(matches!(registration, Report::DeviceRegister { .. }));
    assert!(dropped_at.elapsed() >= reconnect_delay);
    expect_event(&mut events, LinkEvent::Connected).await;

    // Heartbeats run only on the live session.
    let heartbeat: Report = read_frame(&mut coordinator).await.unwrap();
    assert!(matches!(heartbeat, Report::StatusUpdate { .. }));

    cancel.cancel();
}

#[tokio::test]
async fn sends_while_down_are_dropped_not_queued() {
    // No listener: the link keeps retrying and never connects.
    let unused = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = unused.local_addr().unwrap();
    drop(unused);

    let cancel = CancellationToken::new();
    let (handle, mut events) = start_link(
        addr,
        Duration::from_millis(50),
        Duration::from_secs(60),
        cancel.clone(),
    )
    .await;

    assert!(!handle.is_connected());
    for _ in 0..100 {
        handle.send(Report::StatusUpdate {
            device_id: DeviceId("MNRT-TEST0001".into()),
            status: DeviceStatus::Ready,
            system_info: None,
            timestamp: jiff::Timestamp::UNIX_EPOCH,
        });
    }

    // Nothing connected, so no events surfaced either.
    tokio::time::sleep(Duration::from_millis(120)).await;
    assert!(events.try_recv().is_err());

    cancel.cancel();
}

#[tokio::test]
async fn undecodable_inbound_frame_does_not_kill_the_session() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let cancel = CancellationToken::new();
    let (_handle, mut events) = start_link(
        addr,
        Duration::from_millis(50),
        Duration::from_secs(60),
        cancel.clone(),
    )
    .await;

    let (mut coordinator, _) = listener.accept().await.unwrap();
    let _: Report = read_frame(&mut coordinator).await.unwrap();
    expect_event(&mut events, LinkEvent::Connected).await;

    write_frame(&mut coordinator, &serde_json::json!({"type": "firmware_flash"}))
        .await
        .unwrap();
    write_frame(&mut coordinator, &Command::AudioTest).await.unwrap();

    // The unknown frame is surfaced as malformed with its claimed type,
    // and the next command still arrives on the same session.
    let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("timed out waiting for link event")
        .expect("event channel closed");
    match event {
        LinkEvent::Malformed { command, .. } => {
            assert_eq!(command.as_deref(), Some("firmware_flash"));
        }
        other => panic!("expected malformed event, got {other:?}"),
    }
    expect_event(&mut events, LinkEvent::Command(Command::AudioTest)).await;

    cancel.cancel();
}
