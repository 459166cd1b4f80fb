mod common;

use std::sync::Arc;
use std::time::Duration;

use async_broadcast::Receiver;
use blescan::btuuid::{characteristics, services};
use blescan::error::ErrorKind;
use blescan::{
    CharacteristicDescriptor, CharacteristicProperties, ConnectOutcome, DeviceInfo, HeartRateSample, Peripheral,
    ReadOutcome, ServiceDescriptor, Session, SessionConfig, SessionEvent, StopReason, Value,
};
use common::{Call, MockAdapter};
use tokio::time::sleep;

const TARGET: &str = "Evolve3_4260";

fn evolve() -> Peripheral {
    Peripheral::new("B", Some(TARGET.to_string()))
}

fn session(adapter: &Arc<MockAdapter>, config: SessionConfig) -> (Session, Receiver<SessionEvent>) {
    common::init_tracing();
    let session = Session::new(adapter.clone(), config);
    let events = session.events();
    (session, events)
}

fn drain(rx: &mut Receiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn script_device(adapter: &MockAdapter) {
    let read = CharacteristicProperties {
        read: true,
        notify: false,
    };
    let notify = CharacteristicProperties {
        read: false,
        notify: true,
    };
    adapter.set_services(vec![
        ServiceDescriptor::new(
            services::DEVICE_INFORMATION,
            vec![
                CharacteristicDescriptor::new(characteristics::MANUFACTURER_NAME_STRING, read),
                CharacteristicDescriptor::new(characteristics::MODEL_NUMBER_STRING, read),
                CharacteristicDescriptor::new(characteristics::SERIAL_NUMBER_STRING, read),
            ],
        ),
        ServiceDescriptor::new(
            services::HEART_RATE,
            vec![CharacteristicDescriptor::new(characteristics::HEART_RATE_MEASUREMENT, notify)],
        ),
    ]);
    adapter.set_read(services::DEVICE_INFORMATION, characteristics::MANUFACTURER_NAME_STRING, b"Acme");
    adapter.fail_read(services::DEVICE_INFORMATION, characteristics::MODEL_NUMBER_STRING, "read not permitted");
    adapter.set_read(services::DEVICE_INFORMATION, characteristics::SERIAL_NUMBER_STRING, b"SN123");
}

fn acme() -> DeviceInfo {
    DeviceInfo {
        manufacturer: "Acme".to_string(),
        model: "[Read Failed]".to_string(),
        serial: "SN123".to_string(),
    }
}

#[tokio::test(start_paused = true)]
async fn scan_discovers_and_auto_connects_target() {
    let adapter = MockAdapter::new();
    script_device(&adapter);
    let (session, mut events) = session(&adapter, SessionConfig::default().with_target_name(TARGET));

    session.initialize().await.unwrap();
    session.scan().await.unwrap();
    assert!(session.devices().is_empty());
    assert!(session.is_scanning());

    adapter.advertise("A", Some("Foo"));
    adapter.advertise("B", Some(TARGET));
    sleep(Duration::from_millis(1)).await;

    let ids: Vec<_> = session.devices().into_iter().map(|p| p.id.to_string()).collect();
    assert_eq!(ids, vec!["A", "B"]);
    assert!(!session.is_scanning());
    assert_eq!(adapter.count(|c| *c == Call::StopScan), 1);
    assert_eq!(adapter.count(|c| matches!(c, Call::Connect(_))), 0);

    sleep(Duration::from_millis(500)).await;
    assert_eq!(adapter.count(|c| *c == Call::Connect("B".into())), 1);
    assert_eq!(session.connected(), vec![evolve()]);
    assert_eq!(session.pairing(), None);
    assert_eq!(session.device_info(&"B".into()), Some(acme()));

    assert_eq!(
        drain(&mut events),
        vec![
            SessionEvent::ScanStarted,
            SessionEvent::DeviceDiscovered(Peripheral::new("A", Some("Foo".to_string()))),
            SessionEvent::DeviceDiscovered(evolve()),
            SessionEvent::ScanStopped(StopReason::Matched),
            SessionEvent::Connected(evolve()),
            SessionEvent::DeviceInfo {
                peripheral: "B".into(),
                info: acme(),
            },
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn connected_peripheral_survives_rescan() {
    let adapter = MockAdapter::new();
    let (session, _events) = session(&adapter, SessionConfig::default().with_target_name(TARGET));

    session.scan().await.unwrap();
    adapter.advertise("B", Some(TARGET));
    sleep(Duration::from_secs(1)).await;
    assert_eq!(session.connected(), vec![evolve()]);

    session.scan().await.unwrap();
    assert!(session.devices().is_empty());
    adapter.advertise("B", Some(TARGET));
    sleep(Duration::from_secs(1)).await;

    assert!(session.is_scanning());
    assert_eq!(session.devices(), vec![evolve()]);
    assert_eq!(session.connected(), vec![evolve()]);
    assert_eq!(adapter.count(|c| matches!(c, Call::Connect(_) | Call::Disconnect(_))), 1);
}

#[tokio::test(start_paused = true)]
async fn scan_times_out() {
    let adapter = MockAdapter::new();
    let config = SessionConfig::default().with_scan_timeout(Duration::from_secs(3));
    let (session, mut events) = session(&adapter, config);

    session.scan().await.unwrap();
    sleep(Duration::from_secs(4)).await;

    assert!(!session.is_scanning());
    assert_eq!(
        drain(&mut events),
        vec![
            SessionEvent::ScanStarted,
            SessionEvent::ScanStopped(StopReason::Timeout)
        ]
    );
}

#[tokio::test]
async fn manual_connect_toggles() {
    let adapter = MockAdapter::new();
    script_device(&adapter);
    let (session, mut events) = session(&adapter, SessionConfig::default());

    assert_eq!(session.connect(&evolve()).await.unwrap(), ConnectOutcome::Connected);
    assert_eq!(session.device_info(&"B".into()), Some(acme()));
    assert_eq!(session.connect(&evolve()).await.unwrap(), ConnectOutcome::Disconnected);
    assert!(session.connected().is_empty());

    let events = drain(&mut events);
    assert!(events.contains(&SessionEvent::Disconnected("B".into())));
    assert_eq!(
        events.last(),
        Some(&SessionEvent::Notice("Disconnected from device: Evolve3_4260".to_string()))
    );
}

#[tokio::test]
async fn failed_connect_is_published() {
    let adapter = MockAdapter::new();
    adapter.fail_connect("B");
    let (session, mut events) = session(&adapter, SessionConfig::default());

    let err = session.connect(&evolve()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConnectFailed);
    assert_eq!(
        drain(&mut events),
        vec![SessionEvent::ConnectFailed {
            peripheral: evolve(),
            message: "Connection Unsuccessful. Make sure the \"Evolve3_4260\" is turned on and in range.".to_string(),
        }]
    );
    assert!(session.connection_state().is_idle());
}

#[tokio::test]
async fn read_requires_a_connection() {
    let adapter = MockAdapter::new();
    let (session, mut events) = session(&adapter, SessionConfig::default());

    let err = session.request_read().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotConnected);
    assert!(!session.is_reading());
    assert_eq!(
        drain(&mut events),
        vec![SessionEvent::Notice(
            "No devices connected. Please connect to a device first.".to_string()
        )]
    );
    assert!(adapter.calls().is_empty());
}

#[tokio::test]
async fn read_with_no_services_clears_reading_flag() {
    let adapter = MockAdapter::new();
    adapter.set_services(Vec::new());
    let (session, mut events) = session(&adapter, SessionConfig::default());
    session.connect(&evolve()).await.unwrap();
    drain(&mut events);

    let err = session.request_read().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert!(!session.is_reading());
    assert!(drain(&mut events)
        .contains(&SessionEvent::Notice("No services found on the connected device.".to_string())));
}

#[tokio::test]
async fn failed_service_enumeration_is_reported() {
    let adapter = MockAdapter::new();
    let (session, _events) = session(&adapter, SessionConfig::default());
    session.connect(&evolve()).await.unwrap();

    let err = session.request_read().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ServiceEnumeration);
    assert!(!session.is_reading());
}

#[tokio::test(start_paused = true)]
async fn read_collects_results_and_heart_rate() {
    let adapter = MockAdapter::new();
    script_device(&adapter);
    let (session, mut events) = session(&adapter, SessionConfig::default());
    session.connect(&evolve()).await.unwrap();
    drain(&mut events);

    let results = session.request_read().await.unwrap();
    assert!(!session.is_reading());
    assert_eq!(results.len(), 3);
    assert!(results[1].outcome.is_failed());
    assert_eq!(session.last_results(), results);

    assert!(adapter.notify(characteristics::HEART_RATE_MEASUREMENT, vec![0x00u8, 61]));
    sleep(Duration::from_millis(1)).await;

    let last = session.last_results();
    assert_eq!(last.len(), 4);
    assert_eq!(
        last[3].outcome,
        ReadOutcome::Value(Value::HeartRate(HeartRateSample { beats_per_minute: 61 }))
    );

    let events = drain(&mut events);
    assert_eq!(events.first(), Some(&SessionEvent::ReadStarted("B".into())));
    assert!(events.contains(&SessionEvent::ReadFinished { results: 3 }));
    assert_eq!(events.last(), Some(&SessionEvent::ReadResult(last[3].clone())));
}

#[tokio::test(start_paused = true)]
async fn rescan_clears_results_and_subscriptions() {
    let adapter = MockAdapter::new();
    script_device(&adapter);
    let (session, _events) = session(&adapter, SessionConfig::default());
    session.connect(&evolve()).await.unwrap();
    session.request_read().await.unwrap();
    assert_eq!(session.last_results().len(), 3);

    session.scan().await.unwrap();
    assert!(session.last_results().is_empty());

    adapter.notify(characteristics::HEART_RATE_MEASUREMENT, vec![0x00u8, 61]);
    sleep(Duration::from_millis(1)).await;
    assert!(session.last_results().is_empty());
}

#[tokio::test(start_paused = true)]
async fn link_loss_removes_peripheral() {
    let adapter = MockAdapter::new();
    let (session, mut events) = session(&adapter, SessionConfig::default());
    session.connect(&evolve()).await.unwrap();
    sleep(Duration::from_millis(1)).await;

    assert!(adapter.drop_link("B"));
    sleep(Duration::from_millis(1)).await;

    assert!(session.connected().is_empty());
    assert_eq!(drain(&mut events).last(), Some(&SessionEvent::Disconnected("B".into())));
    assert!(!adapter.calls().contains(&Call::Disconnect("B".into())));
}

#[tokio::test]
async fn start_fails_when_adapter_cannot_initialize() {
    common::init_tracing();
    let adapter = MockAdapter::new();
    adapter.fail_initialize();

    let err = Session::start(adapter.clone(), SessionConfig::default()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AdapterInit);
    assert_eq!(adapter.calls(), vec![Call::Initialize]);
}

#[tokio::test]
async fn start_survives_scan_failure() {
    common::init_tracing();
    let adapter = MockAdapter::new();
    adapter.fail_scan();

    let session = Session::start(adapter.clone(), SessionConfig::default()).await.unwrap();
    assert!(!session.is_scanning());
    assert_eq!(adapter.count(|c| matches!(c, Call::RequestScan(_))), 1);
}

#[tokio::test]
async fn shutdown_stops_scan() {
    let adapter = MockAdapter::new();
    let (session, mut events) = session(&adapter, SessionConfig::default());
    session.scan().await.unwrap();

    session.shutdown().await;
    assert!(!session.is_scanning());
    assert_eq!(adapter.count(|c| *c == Call::StopScan), 1);
    assert_eq!(
        drain(&mut events),
        vec![
            SessionEvent::ScanStarted,
            SessionEvent::ScanStopped(StopReason::Requested)
        ]
    );
}

#[tokio::test]
async fn shutdown_without_scan_still_stops_adapter_scan() {
    let adapter = MockAdapter::new();
    let (session, mut events) = session(&adapter, SessionConfig::default());

    session.shutdown().await;
    assert_eq!(adapter.calls(), vec![Call::StopScan]);
    assert!(drain(&mut events).is_empty());
}

#[tokio::test(start_paused = true)]
async fn shutdown_while_scan_is_starting_leaves_adapter_idle() {
    let adapter = MockAdapter::new();
    adapter.set_scan_delay(Duration::from_millis(100));
    let (session, _events) = session(&adapter, SessionConfig::default());

    let (handle, ()) = tokio::join!(session.scan(), async {
        sleep(Duration::from_millis(10)).await;
        session.shutdown().await;
    });
    assert!(!handle.unwrap().is_active());

    sleep(Duration::from_secs(30)).await;
    assert!(!session.is_scanning());
    assert!(!adapter.is_scanning());
}

#[tokio::test(start_paused = true)]
async fn cancelled_read_clears_reading_flag() {
    let adapter = MockAdapter::new();
    script_device(&adapter);
    let (session, _events) = session(&adapter, SessionConfig::default());
    session.connect(&evolve()).await.unwrap();

    adapter.set_services_delay(Duration::from_secs(5));
    let read = tokio::time::timeout(Duration::from_millis(100), session.request_read()).await;
    assert!(read.is_err());
    assert!(!session.is_reading());
}
