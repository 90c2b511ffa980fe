//! End-to-end scenarios: a daemon on loopback (unicast SD) with two
//! applications attached over IPC.

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

use someipyd::header::ServiceId;
use someipyd::ipc::{AppClient, AppEvent};
use someipyd::sd::{Endpoint, EventgroupId, InstanceId};
use someipyd::types::{MessageType, ReturnCode};
use someipyd::{Config, Daemon, MethodId, Service};

const LONG: Duration = Duration::from_secs(10);

struct TestDaemon {
    _dir: tempfile::TempDir,
    uds: PathBuf,
    task: JoinHandle<()>,
}

impl Drop for TestDaemon {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Start a daemon with unicast SD on loopback. Each test uses its own SD
/// port so tests can run in parallel.
async fn start_daemon(sd_port: u16) -> TestDaemon {
    let dir = tempfile::tempdir().unwrap();
    let uds = dir.path().join("someipyd.sock");
    let cfg = Config {
        sd_address: Ipv4Addr::LOCALHOST,
        sd_port,
        interface: Ipv4Addr::LOCALHOST,
        log_level: "warn".to_string(),
        log_path: None,
        uds_path: uds.clone(),
    };
    let mut daemon = Daemon::bind(cfg).await.unwrap();
    let task = tokio::spawn(async move {
        let _ = daemon.run().await;
    });
    TestDaemon {
        _dir: dir,
        uds,
        task,
    }
}

fn event_service() -> Service {
    Service::builder(ServiceId(0x1234))
        .major_version(1)
        .eventgroup(EventgroupId(0x0321), [0x0123])
        .build()
}

fn method_service() -> Service {
    Service::builder(ServiceId(0x1234))
        .major_version(1)
        .method(0x0001)
        .build()
}

async fn wait_available(app: &mut AppClient) {
    timeout(LONG, async {
        loop {
            match app.next_event().await.expect("daemon went away") {
                AppEvent::Availability {
                    available: true, ..
                } => break,
                _ => continue,
            }
        }
    })
    .await
    .expect("service never became available");
}

#[tokio::test]
async fn udp_event_roundtrip() {
    let daemon = start_daemon(35161).await;

    let mut server_app = AppClient::connect(&daemon.uds).await.unwrap();
    let server = server_app
        .register_server(
            event_service(),
            InstanceId(0x5678),
            Endpoint::udp("127.0.0.1:35162".parse().unwrap()),
            3,
            Duration::from_millis(500),
        )
        .await
        .unwrap();
    server_app.start_offer(server).await.unwrap();

    let mut client_app = AppClient::connect(&daemon.uds).await.unwrap();
    let client = client_app
        .register_client(
            event_service(),
            InstanceId(0x5678),
            "127.0.0.1:35163".parse().unwrap(),
        )
        .await
        .unwrap();
    client_app
        .subscribe(client, EventgroupId(0x0321), 3)
        .await
        .unwrap();

    // The next cyclic offer triggers the subscribe handshake; publish only
    // once the daemon reports the subscriber to the server app.
    timeout(LONG, async {
        loop {
            match server_app.next_event().await.expect("daemon went away") {
                AppEvent::SubscriptionChanged { added: true, .. } => break,
                _ => continue,
            }
        }
    })
    .await
    .expect("subscriber never showed up");

    server_app
        .send_event(server, EventgroupId(0x0321), 0x0123, vec![0x01, 0x02, 0x03])
        .await
        .unwrap();

    timeout(Duration::from_millis(500), async {
        loop {
            match client_app.next_event().await.expect("daemon went away") {
                AppEvent::Event {
                    handle,
                    event,
                    payload,
                } => {
                    assert_eq!(handle, client);
                    assert_eq!(event, MethodId::event(0x0123));
                    assert_eq!(payload.as_ref(), &[0x01, 0x02, 0x03]);
                    break;
                }
                _ => continue,
            }
        }
    })
    .await
    .expect("event not delivered in time");
}

#[tokio::test]
async fn tcp_method_call() {
    let daemon = start_daemon(35171).await;

    let mut server_app = AppClient::connect(&daemon.uds).await.unwrap();
    let server = server_app
        .register_server(
            method_service(),
            InstanceId(0x5678),
            Endpoint::tcp("127.0.0.1:35172".parse().unwrap()),
            3,
            Duration::from_millis(500),
        )
        .await
        .unwrap();
    server_app.start_offer(server).await.unwrap();

    tokio::spawn(async move {
        while let Some(event) = server_app.next_event().await {
            if let AppEvent::Call(call) = event {
                assert_eq!(call.payload.as_ref(), &[0x00, 0x02, 0x00, 0x03]);
                server_app
                    .reply(
                        &call,
                        MessageType::Response,
                        ReturnCode::OK,
                        vec![0x00, 0x00, 0x00, 0x05],
                    )
                    .await
                    .unwrap();
            }
        }
    });

    let mut client_app = AppClient::connect(&daemon.uds).await.unwrap();
    let client = client_app
        .register_client(
            method_service(),
            InstanceId(0x5678),
            "127.0.0.1:35173".parse().unwrap(),
        )
        .await
        .unwrap();
    wait_available(&mut client_app).await;

    // The daemon dials the TCP link when the offer lands; calls fail fast
    // with NOT_READY until the connector reports in.
    let result = timeout(LONG, async {
        loop {
            let result = client_app
                .call_method(client, 0x0001, vec![0x00, 0x02, 0x00, 0x03], Duration::from_secs(1))
                .await
                .unwrap();
            if result.return_code == ReturnCode::NOT_READY {
                sleep(Duration::from_millis(20)).await;
                continue;
            }
            break result;
        }
    })
    .await
    .expect("call never completed");

    assert_eq!(result.message_type, MessageType::Response);
    assert_eq!(result.return_code, ReturnCode::OK);
    assert_eq!(result.payload.as_ref(), &[0x00, 0x00, 0x00, 0x05]);
}

#[tokio::test]
async fn out_of_order_responses() {
    let daemon = start_daemon(35181).await;

    let mut server_app = AppClient::connect(&daemon.uds).await.unwrap();
    let server = server_app
        .register_server(
            method_service(),
            InstanceId(0x5678),
            Endpoint::udp("127.0.0.1:35182".parse().unwrap()),
            3,
            Duration::from_millis(500),
        )
        .await
        .unwrap();
    server_app.start_offer(server).await.unwrap();

    // Handler: payload = [delay-in-10ms-units, marker]; replies with the
    // marker after the delay, so slow calls finish last.
    let mut server_events = server_app.take_events().unwrap();
    let server_app = Arc::new(server_app);
    tokio::spawn({
        let app = Arc::clone(&server_app);
        async move {
            while let Some(event) = server_events.recv().await {
                if let AppEvent::Call(call) = event {
                    let app = Arc::clone(&app);
                    tokio::spawn(async move {
                        let delay = u64::from(call.payload[0]) * 10;
                        let marker = call.payload[1];
                        sleep(Duration::from_millis(delay)).await;
                        app.reply(&call, MessageType::Response, ReturnCode::OK, vec![marker])
                            .await
                            .unwrap();
                    });
                }
            }
        }
    });

    let mut client_app = AppClient::connect(&daemon.uds).await.unwrap();
    let client = client_app
        .register_client(
            method_service(),
            InstanceId(0x5678),
            "127.0.0.1:35183".parse().unwrap(),
        )
        .await
        .unwrap();
    wait_available(&mut client_app).await;

    let call = |payload: Vec<u8>| {
        let app = &client_app;
        async move {
            let result = app
                .call_method(client, 0x0001, payload, Duration::from_secs(5))
                .await
                .unwrap();
            (Instant::now(), result)
        }
    };

    // A is slow (400 ms), B and C are fast (50 ms).
    let ((done_a, a), (done_b, b), (done_c, c)) = timeout(
        LONG,
        async { tokio::join!(call(vec![40, 1]), call(vec![5, 2]), call(vec![5, 3])) },
    )
    .await
    .expect("calls never completed");

    // Every response is routed to its own caller...
    assert_eq!(a.payload.as_ref(), &[1]);
    assert_eq!(b.payload.as_ref(), &[2]);
    assert_eq!(c.payload.as_ref(), &[3]);
    assert_eq!(a.return_code, ReturnCode::OK);

    // ...and the fast calls completed while the slow one was in flight.
    assert!(done_b < done_a);
    assert!(done_c < done_a);
}

#[tokio::test]
async fn method_timeout_is_reported() {
    let daemon = start_daemon(35191).await;

    let mut server_app = AppClient::connect(&daemon.uds).await.unwrap();
    let server = server_app
        .register_server(
            method_service(),
            InstanceId(0x5678),
            Endpoint::udp("127.0.0.1:35192".parse().unwrap()),
            3,
            Duration::from_millis(500),
        )
        .await
        .unwrap();
    server_app.start_offer(server).await.unwrap();
    // No handler: requests are forwarded and never answered.

    let mut client_app = AppClient::connect(&daemon.uds).await.unwrap();
    let client = client_app
        .register_client(
            method_service(),
            InstanceId(0x5678),
            "127.0.0.1:35193".parse().unwrap(),
        )
        .await
        .unwrap();
    wait_available(&mut client_app).await;

    let started = Instant::now();
    let result = timeout(
        LONG,
        client_app.call_method(client, 0x0001, vec![], Duration::from_millis(300)),
    )
    .await
    .expect("timeout never fired")
    .unwrap();

    assert_eq!(result.message_type, MessageType::Error);
    assert_eq!(result.return_code, ReturnCode::TIMEOUT);
    assert!(started.elapsed() >= Duration::from_millis(300));
}

#[tokio::test]
async fn call_without_offer_is_unreachable() {
    let daemon = start_daemon(35201).await;

    let client_app = AppClient::connect(&daemon.uds).await.unwrap();
    let client = client_app
        .register_client(
            method_service(),
            InstanceId(0x5678),
            "127.0.0.1:35202".parse().unwrap(),
        )
        .await
        .unwrap();

    let result = client_app
        .call_method(client, 0x0001, vec![], Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(result.message_type, MessageType::Error);
    assert_eq!(result.return_code, ReturnCode::NOT_REACHABLE);
}
