use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use vesta_local::{
    AlarmState, ArmMode, Coordinator, CoordinatorBuilder, ErrorKind, Event, SetupError,
    TriggerRules, UpdateStatus, VestaClient, VestaData,
};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

mod common;
use common::CapturedLogs;

fn panel_body(mode: &str) -> serde_json::Value {
    json!({"mode_a1": mode, "battery": "Normal", "sig_gsm": "80", "ac_fail": "0"})
}

fn devices_body() -> serde_json::Value {
    json!({"senrows": [{
        "area": "1", "zone": "1", "name": "Front Door", "type_f": "Door Contact",
        "status": "Door Close", "battery_ok": "1", "tamper_ok": "1", "rssi": "9", "id": "RF:01"
    }]})
}

fn quiet_log() -> serde_json::Value {
    json!({"events": [{"uid": "7", "time": "08:00", "new_event": "Restore", "cid_event": "130"}]})
}

fn client_for(server: &MockServer) -> VestaClient {
    VestaClient::builder(server.address().to_string())
        .credentials("user", "pass")
        .max_retries(0)
        .build()
        .expect("client should build")
}

fn coordinator_for(server: &MockServer) -> CoordinatorBuilder {
    Coordinator::builder(client_for(server)).update_interval(Duration::ZERO)
}

async fn mount_json(server: &MockServer, endpoint: &str, body: serde_json::Value) {
    Mock::given(method("GET"))
        .and(path(format!("/action/{endpoint}")))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .mount(server)
        .await;
}

async fn mount_panel(server: &MockServer, mode: &str) {
    mount_json(server, "panelCondGet", panel_body(mode)).await;
    mount_json(server, "deviceListGet", devices_body()).await;
    mount_json(server, "reportEventListGet", quiet_log()).await;
}

async fn requests_to(server: &MockServer, endpoint: &str) -> usize {
    let wanted = format!("/action/{endpoint}");
    server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .filter(|r| r.url.path() == wanted)
        .count()
}

fn event_sink() -> (Arc<Mutex<Vec<Event>>>, impl Fn(&Event) + Send + Sync + 'static) {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    (events, move |event: &Event| sink.lock().unwrap().push(event.clone()))
}

#[tokio::test]
async fn setup_performs_first_refresh() {
    let server = MockServer::start().await;
    mount_panel(&server, "Disarm").await;

    let coordinator = coordinator_for(&server).setup().await.expect("setup should succeed");
    let data = coordinator.data().expect("snapshot after setup");
    assert_eq!(data.panel.mode, "Disarm");
    assert_eq!(data.devices.len(), 1);
    assert_eq!(data.event_log.len(), 1);
    assert!(coordinator.last_update_success());
    assert_eq!(coordinator.alarm_state(), Some(AlarmState::Disarmed));
    assert!(!coordinator.is_triggered());
    coordinator.shutdown().await;
}

#[tokio::test]
async fn setup_reports_bad_credentials() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/action/panelCondGet"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    let err = coordinator_for(&server).setup().await.err().unwrap();
    assert!(matches!(err, SetupError::AuthFailed(_)), "{err}");
    assert_eq!(err.cause().kind(), ErrorKind::Authentication);
}

#[tokio::test]
async fn setup_reports_not_ready_when_first_refresh_fails() {
    let server = MockServer::start().await;
    mount_json(&server, "panelCondGet", panel_body("Disarm")).await;
    Mock::given(method("GET"))
        .and(path("/action/deviceListGet"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let err = coordinator_for(&server).setup().await.err().unwrap();
    assert!(matches!(err, SetupError::NotReady(_)), "{err}");
    assert_eq!(err.cause().kind(), ErrorKind::Api);
}

#[tokio::test]
async fn setup_reports_not_ready_when_unreachable() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let client = VestaClient::builder(addr.to_string())
        .max_retries(0)
        .build()
        .unwrap();
    let err = Coordinator::builder(client).setup().await.err().unwrap();
    assert!(matches!(err, SetupError::NotReady(_)), "{err}");
    assert_eq!(err.cause().kind(), ErrorKind::Connection);
}

#[tokio::test]
async fn failed_refresh_keeps_last_snapshot() {
    let server = MockServer::start().await;
    mount_panel(&server, "Disarm").await;
    let (events, sink) = event_sink();
    let coordinator = coordinator_for(&server).on_event(sink).build();

    coordinator.refresh().await.unwrap();
    assert!(matches!(coordinator.status(), UpdateStatus::Healthy));

    server.reset().await;
    Mock::given(method("GET"))
        .and(path("/action/panelCondGet"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;
    mount_json(&server, "deviceListGet", devices_body()).await;
    mount_json(&server, "reportEventListGet", quiet_log()).await;

    let failed = coordinator.refresh().await.unwrap_err();
    assert_eq!(failed.kind(), ErrorKind::Api);
    assert!(!coordinator.last_update_success());
    match coordinator.status() {
        UpdateStatus::Failing(f) => assert_eq!(f.kind(), ErrorKind::Api),
        other => panic!("expected failing status, got {other:?}"),
    }
    assert_eq!(coordinator.data().unwrap().panel.mode, "Disarm");

    server.reset().await;
    mount_panel(&server, "Full Arm").await;
    let data = coordinator.refresh().await.unwrap();
    assert_eq!(data.panel.mode, "Full Arm");
    assert!(coordinator.last_update_success());
    assert_eq!(coordinator.alarm_state(), Some(AlarmState::ArmedAway));

    let events = events.lock().unwrap();
    assert!(events.contains(&Event::ModeChanged {
        mode: "Full Arm".into(),
        state: AlarmState::ArmedAway,
    }));
}

#[tokio::test]
async fn set_alarm_mode_forces_refresh() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/action/panelCondGet"))
        .respond_with(ResponseTemplate::new(200).set_body_json(panel_body("Disarm")))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    mount_panel(&server, "Home").await;
    Mock::given(method("POST"))
        .and(path("/action/panelCondPost"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"result": 1})))
        .expect(1)
        .mount(&server)
        .await;

    let (events, sink) = event_sink();
    let coordinator = coordinator_for(&server).on_event(sink).build();
    coordinator.refresh().await.unwrap();
    assert_eq!(coordinator.alarm_state(), Some(AlarmState::Disarmed));

    assert!(coordinator.set_alarm_mode(ArmMode::ArmHome, 1).await);
    assert_eq!(coordinator.alarm_state(), Some(ArmMode::ArmHome.target_state()));
    assert_eq!(requests_to(&server, "panelCondGet").await, 2);
    assert!(events
        .lock()
        .unwrap()
        .iter()
        .any(|e| matches!(e, Event::ModeChanged { state: AlarmState::ArmedHome, .. })));
}

#[tokio::test]
async fn rejected_mode_change_skips_refresh() {
    let server = MockServer::start().await;
    mount_panel(&server, "Disarm").await;
    Mock::given(method("POST"))
        .and(path("/action/panelCondPost"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"result": 0})))
        .mount(&server)
        .await;

    let coordinator = coordinator_for(&server).build();
    coordinator.refresh().await.unwrap();
    assert!(!coordinator.set_alarm_mode(ArmMode::ArmAway, 1).await);
    assert_eq!(requests_to(&server, "panelCondGet").await, 1);
}

#[tokio::test]
async fn mode_change_transport_error_is_false() {
    let server = MockServer::start().await;
    mount_panel(&server, "Disarm").await;
    Mock::given(method("POST"))
        .and(path("/action/panelCondPost"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    let coordinator = coordinator_for(&server).build();
    assert!(!coordinator.set_alarm_mode(ArmMode::Disarm, 1).await);
}

#[tokio::test]
async fn scheduled_polling_stops_on_shutdown() {
    let server = MockServer::start().await;
    mount_panel(&server, "Disarm").await;

    let coordinator = Coordinator::builder(client_for(&server))
        .update_interval(Duration::from_millis(100))
        .setup()
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(450)).await;
    assert!(requests_to(&server, "panelCondGet").await >= 3);

    coordinator.shutdown().await;
    let after_shutdown = requests_to(&server, "panelCondGet").await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(requests_to(&server, "panelCondGet").await, after_shutdown);

    coordinator.start().await;
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(requests_to(&server, "panelCondGet").await, after_shutdown);
}

#[tokio::test]
async fn slow_refreshes_do_not_pile_up() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/action/panelCondGet"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(panel_body("Disarm"))
                .set_delay(Duration::from_millis(300)),
        )
        .mount(&server)
        .await;
    mount_json(&server, "deviceListGet", devices_body()).await;
    mount_json(&server, "reportEventListGet", quiet_log()).await;

    let coordinator = Coordinator::builder(client_for(&server))
        .update_interval(Duration::from_millis(50))
        .build();
    coordinator.start().await;
    tokio::time::sleep(Duration::from_millis(800)).await;
    coordinator.shutdown().await;

    let polls = requests_to(&server, "panelCondGet").await;
    assert!((1..=3).contains(&polls), "{polls} polls");
}

#[tokio::test]
async fn manual_refresh_waits_for_scheduled_cycle() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/action/panelCondGet"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(panel_body("Disarm"))
                .set_delay(Duration::from_millis(200)),
        )
        .mount(&server)
        .await;
    mount_json(&server, "deviceListGet", devices_body()).await;
    mount_json(&server, "reportEventListGet", quiet_log()).await;

    let coordinator = coordinator_for(&server).build();
    let (a, b) = tokio::join!(coordinator.refresh(), coordinator.refresh());
    a.unwrap();
    b.unwrap();
    assert_eq!(requests_to(&server, "panelCondGet").await, 2);
}

#[tokio::test]
async fn triggered_state_comes_from_event_log() {
    let server = MockServer::start().await;
    mount_json(&server, "panelCondGet", panel_body("Full Arm")).await;
    mount_json(&server, "deviceListGet", devices_body()).await;
    mount_json(
        &server,
        "reportEventListGet",
        json!({"events": [
            {"uid": "9", "time": "03:12", "new_event": "Trigger", "cid_event": "130", "source": "Zone 1"},
            {"uid": "8", "time": "03:00", "new_event": "Restore", "cid_event": "130"},
        ]}),
    )
    .await;

    let (events, sink) = event_sink();
    let coordinator = coordinator_for(&server).on_event(sink).build();
    coordinator.refresh().await.unwrap();

    assert!(coordinator.is_triggered());
    assert_eq!(coordinator.alarm_state(), Some(AlarmState::Triggered));
    let events = events.lock().unwrap();
    match events.as_slice() {
        [Event::AlarmTriggered { entry }] => assert_eq!(entry.zone(), Some(1)),
        other => panic!("unexpected events: {other:?}"),
    }
}

#[tokio::test]
async fn custom_trigger_rules_apply() {
    let server = MockServer::start().await;
    mount_json(&server, "panelCondGet", panel_body("Full Arm")).await;
    mount_json(&server, "deviceListGet", devices_body()).await;
    mount_json(
        &server,
        "reportEventListGet",
        json!({"events": [{"uid": "3", "new_event": "Trigger", "cid_event": "999"}]}),
    )
    .await;

    let coordinator = coordinator_for(&server)
        .trigger_rules(TriggerRules::default().with_trigger_code("999"))
        .build();
    coordinator.refresh().await.unwrap();
    assert!(coordinator.is_triggered());
    assert!(coordinator.trigger_rules().trigger_codes.contains("999"));
}

#[tokio::test]
async fn event_log_failure_keeps_previous_log() {
    let server = MockServer::start().await;
    mount_json(&server, "panelCondGet", panel_body("Disarm")).await;
    mount_json(&server, "deviceListGet", devices_body()).await;
    Mock::given(method("GET"))
        .and(path("/action/reportEventListGet"))
        .respond_with(ResponseTemplate::new(200).set_body_json(quiet_log()))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/action/reportEventListGet"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let coordinator = coordinator_for(&server).build();
    let first = coordinator.refresh().await.unwrap();
    let second = coordinator.refresh().await.unwrap();
    assert_eq!(first.event_log, second.event_log);
    assert_eq!(second.event_log[0].uid, Some(7));
    assert!(coordinator.last_update_success());
}

#[tokio::test]
async fn event_log_cadence() {
    let server = MockServer::start().await;
    mount_panel(&server, "Disarm").await;

    let coordinator = coordinator_for(&server).event_log_every(2).build();
    for _ in 0..4 {
        coordinator.refresh().await.unwrap();
    }
    assert_eq!(requests_to(&server, "reportEventListGet").await, 2);
    assert_eq!(coordinator.data().unwrap().event_log.len(), 1);

    let disabled = coordinator_for(&server).event_log_every(0).build();
    disabled.refresh().await.unwrap();
    assert_eq!(requests_to(&server, "reportEventListGet").await, 2);
    assert!(disabled.data().unwrap().event_log.is_empty());
}

#[tokio::test]
async fn snapshot_subscribers_see_updates() {
    let server = MockServer::start().await;
    mount_panel(&server, "Disarm").await;

    let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let coordinator = coordinator_for(&server)
        .on_snapshot(move |data: &VestaData| sink.lock().unwrap().push(data.panel.mode.clone()))
        .build();
    let mut rx = coordinator.subscribe();
    assert!(rx.borrow().is_none());

    coordinator.refresh().await.unwrap();
    rx.changed().await.unwrap();
    assert_eq!(rx.borrow().as_ref().unwrap().panel.mode, "Disarm");
    assert_eq!(*seen.lock().unwrap(), vec!["Disarm".to_string()]);

    let status = coordinator.subscribe_status();
    assert!(status.borrow().is_healthy());
}

#[tokio::test]
async fn unknown_mode_is_warned_once_from_first_snapshot() {
    let server = MockServer::start().await;
    mount_panel(&server, "Weird Mode").await;

    let (logs, _guard) = CapturedLogs::install();
    let coordinator = coordinator_for(&server).build();
    coordinator.refresh().await.unwrap();
    assert_eq!(coordinator.alarm_state(), Some(AlarmState::Unknown));
    assert_eq!(logs.count("unknown alarm mode"), 1);

    coordinator.refresh().await.unwrap();
    assert_eq!(logs.count("unknown alarm mode"), 1);
}

#[tokio::test]
async fn shutdown_mid_cycle_keeps_status_healthy() {
    let server = MockServer::start().await;
    mount_json(&server, "panelCondGet", panel_body("Disarm")).await;
    mount_json(&server, "reportEventListGet", quiet_log()).await;
    Mock::given(method("GET"))
        .and(path("/action/deviceListGet"))
        .respond_with(ResponseTemplate::new(200).set_body_json(devices_body()))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/action/deviceListGet"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(devices_body())
                .set_delay(Duration::from_secs(5)),
        )
        .mount(&server)
        .await;

    let coordinator = Coordinator::builder(client_for(&server))
        .update_interval(Duration::from_millis(100))
        .setup()
        .await
        .unwrap();
    // the first scheduled cycle is now stuck on the slow device list
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(requests_to(&server, "deviceListGet").await, 2);

    let started = std::time::Instant::now();
    coordinator.shutdown().await;
    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(matches!(coordinator.status(), UpdateStatus::Healthy), "{:?}", coordinator.status());
    assert_eq!(coordinator.data().unwrap().panel.mode, "Disarm");
}
