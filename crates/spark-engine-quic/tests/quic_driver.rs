//! QUIC 类引擎经 `EngineDriver` 在 Tokio 内存管道上运行：拥塞窗口随确认打开，钩子看到完整事件流。

use std::sync::Arc;

use spark_engine::{BlockingExecutor, DriverConfig, Engine, EngineDriver, InlineExecutor, RecvOutcome};
use spark_engine_quic::{
    CongestionEventKind, QuicConfig, QuicEngine, QuicMetrics, RecordingCongestionMetrics, Role,
};
use tokio::io::duplex;

fn config() -> QuicConfig {
    QuicConfig::new("driver-psk").with_kdf_rounds(64)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn quic_session_is_congestion_limited_and_closes_gracefully() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let (left, right) = duplex(64 * 1024);

    let server = tokio::spawn(async move {
        let mut driver = EngineDriver::new(
            QuicEngine::server(config()),
            right,
            InlineExecutor,
            DriverConfig::default().with_session_label("quic-server"),
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

    let recorder = Arc::new(RecordingCongestionMetrics::new());
    let metrics = QuicMetrics::builder().congestion(recorder.clone()).build();
    let mut client = EngineDriver::new(
        QuicEngine::new(Role::Client, config(), metrics),
        left,
        BlockingExecutor::new(),
        DriverConfig::default().with_session_label("quic-client"),
    )
    .unwrap();
    client.handshake().await.unwrap();
    assert!(client.engine().is_established());
    assert_eq!(recorder.count(CongestionEventKind::Discarded), 1);

    // 远超初始窗口，发送方必须等待确认才能继续。
    let payload: Vec<u8> = (0..60_000_u32).map(|i| (i % 249) as u8).collect();
    client.send(&payload).await.unwrap();
    client.shutdown().await.unwrap();
    assert_eq!(client.recv().await.unwrap(), RecvOutcome::Closed);
    assert!(client.engine().is_closed());

    assert_eq!(server.await.unwrap(), payload);
    let packets = payload.len().div_ceil(client.engine().buffer_sizing().max_application());
    assert_eq!(recorder.count(CongestionEventKind::Sent), 2 + packets);
    assert!(recorder.count(CongestionEventKind::Acked) >= 2);
}
