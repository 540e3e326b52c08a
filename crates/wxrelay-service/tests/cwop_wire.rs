//! CWOP uploads against a local fake APRS-IS server.

use std::net::SocketAddr;
use std::sync::Arc;

use time::macros::datetime;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use wxrelay_core::{AggregationEngine, Tz};
use wxrelay_service::config::StationConfig;
use wxrelay_service::destinations::Cwop;
use wxrelay_service::{ManualClock, Mode, Outcome, UploadService, UploadSettings};
use wxrelay_store::{MemoryStatusStore, MemoryStore, ReadingStore, StatusStore};
use wxrelay_types::{Field, HardwareClass, Reading};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Accept one connection, greet it, acknowledge the login with `ack` and
/// collect every line the client sends until it hangs up.
async fn fake_aprs_server(ack: &'static str) -> (SocketAddr, JoinHandle<Vec<String>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut stream = BufReader::new(stream);
        stream
            .get_mut()
            .write_all(b"# aprsc 2.1.14-g5e3d4a1\r\n")
            .await
            .unwrap();

        let mut lines = Vec::new();
        let mut login = String::new();
        stream.read_line(&mut login).await.unwrap();
        lines.push(login);
        stream.get_mut().write_all(ack.as_bytes()).await.unwrap();

        loop {
            let mut line = String::new();
            if stream.read_line(&mut line).await.unwrap() == 0 {
                break;
            }
            lines.push(line);
        }
        lines
    });
    (addr, handle)
}

fn station() -> StationConfig {
    StationConfig {
        timezone: "UTC".to_string(),
        hardware: HardwareClass::Standard,
        latitude: Some(51.501),
        longitude: Some(-0.142),
        altitude: None,
        name: None,
    }
}

/// A service over two readings an hour apart, and the newer reading.
fn service(cwop: Cwop) -> (UploadService<Cwop>, Reading) {
    let store = Arc::new(MemoryStore::from_readings([
        Reading::new(datetime!(2024-03-05 06:09 UTC))
            .with(Field::Rain, 0.0)
            .with(Field::TempOut, 8.0),
        Reading::new(datetime!(2024-03-05 07:09 UTC))
            .with(Field::Rain, 2.54)
            .with(Field::TempOut, 10.0)
            .with(Field::HumOut, 87.0)
            .with(Field::WindAve, 2.0)
            .with(Field::WindGust, 4.5)
            .with(Field::WindDir, 4.0)
            .with(Field::RelPressure, 1013.2),
    ]));
    let latest = store.latest().unwrap().unwrap();
    let engine = Arc::new(AggregationEngine::new(store, Tz::UTC));
    let service = UploadService::new(
        "cwop",
        cwop,
        engine,
        Arc::new(MemoryStatusStore::new()),
        Arc::new(ManualClock::new(datetime!(2024-03-05 07:10 UTC))),
        UploadSettings {
            interval: time::Duration::seconds(290),
            catchup: 0,
            timeout: std::time::Duration::from_secs(5),
            live: true,
            logged: false,
        },
    );
    (service, latest)
}

#[tokio::test]
async fn test_login_and_packet_lines() {
    let (addr, server) =
        fake_aprs_server("# logresp EW9999 unverified, server T2TEST\r\n").await;
    let (service, reading) =
        service(Cwop::new("EW9999", "-1", &station()).with_server(addr.to_string()));

    let attempt = service.upload_live(&reading).await.unwrap();
    assert_eq!(attempt.outcome, Outcome::Success, "{}", attempt.message);
    assert_eq!(attempt.mode, Mode::Live);

    let lines = server.await.unwrap();
    assert_eq!(
        lines,
        vec![
            format!("user EW9999 pass -1 vers wxrelay {}\n", VERSION),
            format!(
                "EW9999>APRS,TCPIP*:@050709z5130.06N/00008.52W_090/004g010t050\
                 r010p010P010h87b10132.wxrelay-{}\n",
                VERSION
            ),
        ]
    );
}

#[tokio::test]
async fn test_unverified_ack_rejects_passcode() {
    let (addr, server) =
        fake_aprs_server("# logresp G4XYZ unverified, server T2TEST\r\n").await;
    let (service, reading) =
        service(Cwop::new("G4XYZ", "12345", &station()).with_server(addr.to_string()));

    let attempt = service.upload_live(&reading).await.unwrap();
    assert_eq!(attempt.outcome, Outcome::PermanentFailure);
    assert!(attempt.message.contains("unverified"), "{}", attempt.message);

    // Only the login reached the server
    let lines = server.await.unwrap();
    assert_eq!(lines.len(), 1);
    assert!(lines[0].starts_with("user G4XYZ pass 12345 "));
}

#[tokio::test]
async fn test_refused_connection_is_retryable() {
    // Bind then drop to get a port nobody listens on
    let addr = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };
    let (service, reading) =
        service(Cwop::new("EW9999", "-1", &station()).with_server(addr.to_string()));

    let attempt = service.upload_live(&reading).await.unwrap();
    assert_eq!(attempt.outcome, Outcome::RetryableFailure);
    assert!(attempt.message.starts_with("session-open:"), "{}", attempt.message);
}

#[tokio::test]
async fn test_watermark_follows_success() {
    let (addr, server) =
        fake_aprs_server("# logresp EW9999 unverified, server T2TEST\r\n").await;
    let status = Arc::new(MemoryStatusStore::new());
    let store = Arc::new(MemoryStore::from_readings([Reading::new(datetime!(2024-03-05 07:09 UTC))]));
    let reading = store.latest().unwrap().unwrap();
    let service = UploadService::new(
        "cwop",
        Cwop::new("EW9999", "-1", &station()).with_server(addr.to_string()),
        Arc::new(AggregationEngine::new(store, Tz::UTC)),
        status.clone(),
        Arc::new(ManualClock::new(datetime!(2024-03-05 07:10 UTC))),
        UploadSettings {
            interval: time::Duration::seconds(290),
            catchup: 0,
            timeout: std::time::Duration::from_secs(5),
            live: true,
            logged: false,
        },
    );

    let attempt = service.upload_live(&reading).await.unwrap();
    assert!(attempt.outcome.is_success(), "{}", attempt.message);
    server.await.unwrap();

    let recorded = status.upload_status("cwop").unwrap();
    assert_eq!(recorded.watermark, Some(reading.timestamp));
    assert_eq!(recorded.last_attempt_at, Some(datetime!(2024-03-05 07:10 UTC)));
}
