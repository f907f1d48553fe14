//! 驱动器在 Tokio 内存管道上的端到端行为。

use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use spark_engine::{
    BufferSizing, DelegatedTask, DriverConfig, Engine, EngineDriver, EngineError, EngineResult,
    HandshakeStatus, InlineExecutor, Lifecycle, PassthroughEngine, RecvOutcome, SessionObserver,
    Status, TimerKey, TimerValue,
};
use tokio::io::duplex;

#[derive(Default)]
struct CountingObserver {
    finished: AtomicUsize,
    closed: AtomicUsize,
}

impl SessionObserver for CountingObserver {
    fn on_handshake_finished(&self, _session: &str, protocol: &'static str) {
        assert!(!protocol.is_empty());
        self.finished.fetch_add(1, Ordering::SeqCst);
    }

    fn on_closed(&self, _session: &str) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

async fn recv_exact<E, T>(
    driver: &mut EngineDriver<E, T, InlineExecutor>,
    len: usize,
) -> Vec<u8>
where
    E: Engine,
    T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let mut received = Vec::new();
    while received.len() < len {
        match driver.recv().await.expect("recv") {
            RecvOutcome::Data(chunk) => received.extend_from_slice(&chunk),
            RecvOutcome::Closed => panic!("closed after {} bytes", received.len()),
        }
    }
    received
}

#[tokio::test]
async fn passthrough_session_delivers_data_and_closes() {
    let (left, right) = duplex(64);
    let observer = Arc::new(CountingObserver::default());
    let mut client = EngineDriver::new(
        PassthroughEngine::with_chunk_size(4),
        left,
        InlineExecutor,
        DriverConfig::default().with_session_label("client"),
    )
    .unwrap();
    let mut server = EngineDriver::new(
        PassthroughEngine::new(),
        right,
        InlineExecutor,
        DriverConfig::default().with_session_label("server"),
    )
    .unwrap()
    .with_observer(observer.clone());

    client.handshake().await.unwrap();
    server.handshake().await.unwrap();
    assert!(client.is_established());
    assert_eq!(observer.finished.load(Ordering::SeqCst), 1);

    client.send(b"hello engine driver").await.unwrap();
    let received = recv_exact(&mut server, 19).await;
    assert_eq!(received, b"hello engine driver");

    client.shutdown().await.unwrap();
    assert_eq!(server.recv().await.unwrap(), RecvOutcome::Closed);
    assert_eq!(observer.closed.load(Ordering::SeqCst), 1);
    assert!(server.engine().is_inbound_done());

    let err = client.send(b"late").await.unwrap_err();
    assert_eq!(err.code(), "spark.engine.driver.closed");
    let _transport = server.close();
}

/// 以 2 字节长度前缀封帧、每帧至少需要 `unit` 字节目标空间的测试引擎。
struct FramedStub {
    lifecycle: Lifecycle,
    unit: usize,
    max: usize,
    outbound_done: bool,
    inbound_done: bool,
    timer_calls: Arc<AtomicUsize>,
}

impl FramedStub {
    fn new(unit: usize, max: usize, timer_calls: Arc<AtomicUsize>) -> Self {
        Self {
            lifecycle: Lifecycle::new(),
            unit,
            max,
            outbound_done: false,
            inbound_done: false,
            timer_calls,
        }
    }
}

impl Engine for FramedStub {
    fn init(&mut self) -> Result<(), EngineError> {
        self.lifecycle.activate()
    }

    fn begin_handshake(&mut self) -> Result<(), EngineError> {
        self.lifecycle.ensure_active("begin_handshake")
    }

    fn wrap_vectored(
        &mut self,
        sources: &[&[u8]],
        destination: &mut [u8],
    ) -> Result<EngineResult, EngineError> {
        self.lifecycle.ensure_active("wrap")?;
        let hs = HandshakeStatus::NotHandshaking;
        if self.outbound_done {
            return Ok(EngineResult::new(Status::Closed, hs, 0, 0));
        }
        let pending = spark_engine::total_len(sources).min(self.unit - 2);
        if pending == 0 {
            return Ok(EngineResult::new(Status::Ok, hs, 0, 0));
        }
        if destination.len() < self.unit {
            return Ok(EngineResult::new(Status::BufferOverflow, hs, 0, 0));
        }
        destination[..2].copy_from_slice(&(pending as u16).to_be_bytes());
        let copied = spark_engine::gather(sources, &mut destination[2..2 + pending]);
        Ok(EngineResult::new(Status::Ok, hs, copied, copied + 2))
    }

    fn unwrap(
        &mut self,
        source: &[u8],
        destination: &mut [u8],
    ) -> Result<EngineResult, EngineError> {
        self.lifecycle.ensure_active("unwrap")?;
        let hs = HandshakeStatus::NotHandshaking;
        if source.len() < 2 {
            return Ok(EngineResult::new(Status::BufferUnderflow, hs, 0, 0));
        }
        let len = usize::from(u16::from_be_bytes([source[0], source[1]]));
        if source.len() < len + 2 {
            return Ok(EngineResult::new(Status::BufferUnderflow, hs, 0, 0));
        }
        if destination.len() < len {
            return Ok(EngineResult::new(Status::BufferOverflow, hs, 0, 0));
        }
        destination[..len].copy_from_slice(&source[2..2 + len]);
        Ok(EngineResult::new(Status::Ok, hs, len + 2, len))
    }

    fn handshake_status(&self) -> HandshakeStatus {
        HandshakeStatus::NotHandshaking
    }

    fn delegated_task(&mut self) -> Option<DelegatedTask> {
        None
    }

    fn is_outbound_done(&self) -> bool {
        self.outbound_done
    }

    fn is_inbound_done(&self) -> bool {
        self.inbound_done
    }

    fn close_outbound(&mut self) -> Result<(), EngineError> {
        self.outbound_done = true;
        Ok(())
    }

    fn close_inbound(&mut self) -> Result<(), EngineError> {
        self.inbound_done = true;
        Ok(())
    }

    fn buffer_sizing(&self) -> BufferSizing {
        BufferSizing::new(4, self.max, 4, self.max)
    }

    fn timer(&mut self, _key: Option<TimerKey>, _value: Option<TimerValue>) -> Result<(), EngineError> {
        self.timer_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn cleanup(&mut self) {
        self.lifecycle.retire();
    }
}

#[tokio::test]
async fn overflow_grows_buffers_up_to_engine_limit() {
    let (left, right) = duplex(1024);
    let timers = Arc::new(AtomicUsize::new(0));
    let mut sender = EngineDriver::new(
        FramedStub::new(32, 64, timers.clone()),
        left,
        InlineExecutor,
        DriverConfig::default(),
    )
    .unwrap();
    let mut receiver = EngineDriver::new(
        FramedStub::new(32, 64, timers.clone()),
        right,
        InlineExecutor,
        DriverConfig::default(),
    )
    .unwrap();
    assert_eq!(sender.network_capacity(), 4);

    let payload: Vec<u8> = (0..100_u8).collect();
    sender.send(&payload).await.unwrap();
    assert_eq!(sender.network_capacity(), 32);
    assert_eq!(recv_exact(&mut receiver, payload.len()).await, payload);

    sender.fire_timer(None, None).await.unwrap();
    assert_eq!(timers.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn buffer_limit_is_a_protocol_error() {
    let (left, _right) = duplex(1024);
    let timers = Arc::new(AtomicUsize::new(0));
    let mut sender = EngineDriver::new(
        FramedStub::new(200, 64, timers),
        left,
        InlineExecutor,
        DriverConfig::from_toml_str("buffer_growth_factor = 2").unwrap(),
    )
    .unwrap();
    // 单帧需要 200 字节，而引擎给出的上限只有 64。
    let err = sender.send(&[7_u8; 300]).await.unwrap_err();
    assert_eq!(err.code(), "spark.engine.driver.buffer_limit");
}
