//! 记录层引擎经 `EngineDriver` 在 Tokio 内存管道上运行。

use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use spark_engine::{
    BlockingExecutor, DriverConfig, Engine, EngineDriver, ErrorKind, IncidentReport, InlineExecutor,
    RecvOutcome, SessionObserver,
};
use spark_engine_record::{RecordConfig, RecordEngine};
use tokio::io::duplex;

fn config() -> RecordConfig {
    RecordConfig::new("driver-psk").with_kdf_rounds(64)
}

#[derive(Default)]
struct IncidentCounter {
    incidents: AtomicUsize,
}

impl SessionObserver for IncidentCounter {
    fn on_incident(&self, _session: &str, report: &IncidentReport) {
        assert_eq!(report.code(), "spark.engine.incident.truncation");
        self.incidents.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn record_session_transfers_and_closes_gracefully() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let (left, right) = duplex(4096);

    let server = tokio::spawn(async move {
        let mut driver = EngineDriver::new(
            RecordEngine::server(config()),
            right,
            InlineExecutor,
            DriverConfig::default().with_session_label("record-server"),
        )
        .unwrap();
        driver.handshake().await.unwrap();
        let mut received = Vec::new();
        loop {
            match driver.recv().await.unwrap() {
                RecvOutcome::Data(chunk) => received.extend_from_slice(&chunk),
                RecvOutcome::Closed => break,
            }
        }
        assert!(driver.engine().is_outbound_done());
        received
    });

    let mut client = EngineDriver::new(
        RecordEngine::client(config()),
        left,
        BlockingExecutor::new(),
        DriverConfig::default().with_session_label("record-client"),
    )
    .unwrap();
    client.handshake().await.unwrap();
    assert!(client.engine().is_established());

    let payload: Vec<u8> = (0..40_000_u32).map(|i| (i % 251) as u8).collect();
    client.send(&payload).await.unwrap();
    client.shutdown().await.unwrap();
    assert_eq!(client.recv().await.unwrap(), RecvOutcome::Closed);
    assert!(client.engine().is_closed());

    assert_eq!(server.await.unwrap(), payload);
}

#[tokio::test]
async fn abrupt_eof_is_reported_as_incident() {
    let (left, right) = duplex(4096);
    let observer = Arc::new(IncidentCounter::default());

    let mut server = EngineDriver::new(
        RecordEngine::server(config()),
        right,
        InlineExecutor,
        DriverConfig::default(),
    )
    .unwrap()
    .with_observer(observer.clone());
    let mut client = EngineDriver::new(
        RecordEngine::client(config()),
        left,
        InlineExecutor,
        DriverConfig::default(),
    )
    .unwrap();

    let (client_done, server_done) = tokio::join!(client.handshake(), server.handshake());
    client_done.unwrap();
    server_done.unwrap();

    drop(client.close());
    let err = server.recv().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Incident);
    assert_eq!(observer.incidents.load(Ordering::SeqCst), 1);
}
