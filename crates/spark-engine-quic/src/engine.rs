use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use spark_engine::{
    BufferSizing, DelegatedTask, Engine, EngineError, EngineResult, HandshakeStatus,
    IncidentClass, IncidentReport, Lifecycle, Status, TimerKey, TimerValue, gather, total_len,
};
use spark_engine_record::{
    Role,
    handshake::{HandshakeMachine, HandshakeMessage, MESSAGE_LEN},
    nonce,
    protect::{KEY_LEN, TAG_LEN, compute_tag, verify_tag},
};
use tracing::{debug, trace, warn};

use crate::{
    clock::{Clock, SystemClock},
    config::QuicConfig,
    congestion::{CongestionController, NewReno},
    error::{codes, integrity, unexpected},
    metrics::QuicMetrics,
    packet::{
        self, AckRanges, HEADER_LEN, PREFIX_LEN, PROTECTED_OVERHEAD, PacketHeader, PacketKind,
        ReceiveWindow,
    },
    recovery::{PacketSpace, SentPacket, SentPacketTracker, is_persistent_congestion},
    rtt::RttEstimator,
};

/// 握手包在线上的固定长度。
pub const HANDSHAKE_PACKET_LEN: usize = HEADER_LEN + MESSAGE_LEN;

static NEXT_CONNECTION: AtomicU64 = AtomicU64::new(1);

/// QUIC 类数据报引擎。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 展示拥塞受限引擎如何嵌入同一份引擎契约：驱动器照旧调用 `wrap`/`unwrap`，
///   引擎在内部驱动 [`CongestionController`]，控制器经 [`QuicMetrics`] 的钩子报告每次状态变化；
/// - 握手沿用记录层引擎的预共享密钥状态机（含委派派生任务），包保护沿用其标签函数。
///
/// ## 契约（What）
/// - 线格式见 [`crate::packet`]；每次 `wrap` 最多产出一个包，每次 `unwrap` 最多处理一个包；
/// - 应用数据按不可靠数据报语义发送：丢失的数据只报告给拥塞控制器，不重传；
///   握手消息在 `timer(Retransmit)` 或检测到握手包丢失后重发；
/// - 拥塞窗口已满时 `wrap` 不消费任何应用字节，但仍会写出待发的确认；
/// - 确认搭载在握手包与数据包上，没有数据可搭载时以单独的确认包发出（`wrap` 空输入即可触发）；
/// - 握手完成的一刻丢弃握手空间，其在途字节经钩子的 `on_in_flight_discarded` 报告；
/// - 重复或落在确认窗口之外的包被静默丢弃，仍计为已消费；
/// - 握手未完成时到达的受保护数据包或确认包同样静默丢弃，等待对端重传的 Finished 完成握手。
///
/// ## 定时器（How）
/// - [`next_timeout`](Self::next_timeout) 报告下一个截止时间及对应的 [`TimerKey`]，由驱动方在到期时调用 `timer`；
/// - `LossDetection`：按时间阈值检测丢包；没有可判定的丢包且应用空间的 PTO 已过时，下一次 `wrap` 发出探测包；
/// - `Retransmit`：握手进行中时重发最近一条握手消息；
/// - `AckDelay`：强制下一次 `wrap` 发出确认；
/// - `IdleTimeout`：开始优雅关闭；`HandshakeTimeout`：握手未完成时报错。
pub struct QuicEngine {
    lifecycle: Lifecycle,
    config: QuicConfig,
    connection: u64,
    machine: HandshakeMachine,
    clock: Arc<dyn Clock>,
    metrics: Arc<QuicMetrics>,
    controller: Box<dyn CongestionController>,
    rtt: RttEstimator,
    sent: SentPacketTracker,
    next_number: [u64; 2],
    received: [ReceiveWindow; 2],
    first_rtt_sample: Option<Instant>,
    peer_hello_seen: bool,
    handshake_discarded: bool,
    retransmit_pending: bool,
    probe_pending: bool,
    ack_pending: bool,
    outbound_closing: bool,
    outbound_done: bool,
    close_received: bool,
    inbound_done: bool,
}

impl QuicEngine {
    pub fn client(config: QuicConfig) -> Self {
        Self::new(Role::Client, config, QuicMetrics::shared_default())
    }

    pub fn server(config: QuicConfig) -> Self {
        Self::new(Role::Server, config, QuicMetrics::shared_default())
    }

    /// 以给定度量包构造引擎；拥塞控制默认为 [`NewReno`]，时钟默认为 [`SystemClock`]。
    pub fn new(role: Role, config: QuicConfig, metrics: Arc<QuicMetrics>) -> Self {
        let connection = NEXT_CONNECTION.fetch_add(1, Ordering::Relaxed);
        let machine = HandshakeMachine::new(
            role,
            config.psk.as_bytes(),
            config.kdf_rounds,
            [0; nonce::NONCE_LEN],
        );
        let controller = NewReno::new(
            config.max_datagram_size as u64,
            Arc::clone(&metrics),
            connection,
        );
        let rtt = RttEstimator::new(config.initial_rtt(), config.max_ack_delay());
        Self {
            lifecycle: Lifecycle::new(),
            config,
            connection,
            machine,
            clock: Arc::new(SystemClock),
            metrics,
            controller: Box::new(controller),
            rtt,
            sent: SentPacketTracker::new(),
            next_number: [0; 2],
            received: [ReceiveWindow::default(); 2],
            first_rtt_sample: None,
            peer_hello_seen: false,
            handshake_discarded: false,
            retransmit_pending: false,
            probe_pending: false,
            ack_pending: false,
            outbound_closing: false,
            outbound_done: false,
            close_received: false,
            inbound_done: false,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// 替换拥塞控制策略。
    ///
    /// `build` 收到与 [`NewReno::new`] 相同的参数（最大数据报尺寸、引擎持有的度量包、连接标签），
    /// 新控制器因此总是向本引擎的钩子报告，事件中的连接标签也与 [`connection`](Self::connection) 一致。
    pub fn with_controller<C, F>(mut self, build: F) -> Self
    where
        C: CongestionController + 'static,
        F: FnOnce(u64, Arc<QuicMetrics>, u64) -> C,
    {
        let controller = build(
            self.config.max_datagram_size as u64,
            Arc::clone(&self.metrics),
            self.connection,
        );
        debug!(
            connection = self.connection,
            controller = controller.name(),
            "congestion controller replaced"
        );
        self.controller = Box::new(controller);
        self
    }

    pub fn role(&self) -> Role {
        self.machine.role()
    }

    /// 进程内唯一的连接标签，与钩子收到的 `CongestionState::connection` 一致。
    pub fn connection(&self) -> u64 {
        self.connection
    }

    pub fn is_established(&self) -> bool {
        self.machine.is_complete()
    }

    pub fn metrics(&self) -> &Arc<QuicMetrics> {
        &self.metrics
    }

    pub fn controller(&self) -> &dyn CongestionController {
        self.controller.as_ref()
    }

    pub fn rtt(&self) -> &RttEstimator {
        &self.rtt
    }

    pub fn idle_timeout(&self) -> Duration {
        self.config.idle_timeout()
    }

    /// 下一个需要触发的定时器及其截止时间。
    pub fn next_timeout(&self) -> Option<(TimerKey, Instant)> {
        if let Some((_, at)) = self.sent.earliest_loss_time() {
            return Some((TimerKey::LossDetection, at));
        }
        if self.outbound_done {
            return None;
        }
        if self.machine.in_progress() {
            return self
                .sent
                .last_ack_eliciting_sent(PacketSpace::Handshake)
                .map(|at| (TimerKey::Retransmit, at + self.rtt.pto()));
        }
        if self.machine.is_complete() {
            return self
                .sent
                .last_ack_eliciting_sent(PacketSpace::Application)
                .map(|at| (TimerKey::LossDetection, at + self.rtt.pto()));
        }
        None
    }

    fn status(&self) -> HandshakeStatus {
        if !self.lifecycle.is_active() {
            return HandshakeStatus::NotHandshaking;
        }
        if self.machine.in_progress() && !self.outbound_done {
            if self.retransmit_pending {
                return HandshakeStatus::NeedWrap;
            }
            return self.machine.status();
        }
        let closing = self.close_received || self.outbound_closing;
        if self.machine.is_complete() && !self.outbound_done && closing {
            return HandshakeStatus::NeedWrap;
        }
        HandshakeStatus::NotHandshaking
    }

    fn result(&self, status: Status, consumed: usize, produced: usize) -> EngineResult {
        EngineResult::new(status, self.status(), consumed, produced)
    }

    fn write_key(&self) -> Option<[u8; KEY_LEN]> {
        self.machine
            .keys()
            .filter(|_| self.machine.is_complete())
            .map(|keys| *keys.write_key(self.role()))
    }

    fn read_key(&self) -> Option<[u8; KEY_LEN]> {
        self.machine
            .keys()
            .filter(|_| self.machine.is_complete())
            .map(|keys| *keys.read_key(self.role()))
    }

    fn take_number(&mut self, space: PacketSpace) -> u64 {
        let slot = &mut self.next_number[space.index()];
        let number = *slot;
        *slot += 1;
        number
    }

    fn ack_ranges(&self, space: PacketSpace) -> Option<AckRanges> {
        self.received[space.index()].ranges()
    }

    fn track(&mut self, space: PacketSpace, packet: SentPacket) {
        if packet.in_flight {
            self.controller.on_packet_sent(packet.size, packet.sent_at);
        }
        self.sent.on_sent(space, packet);
    }

    fn finish_outbound(&mut self) {
        if !self.outbound_done {
            self.outbound_done = true;
            debug!(connection = self.connection, role = self.role().as_str(), "outbound closed");
        }
    }

    fn on_handshake_complete(&mut self) {
        let discarded = self.sent.discard_space(PacketSpace::Handshake);
        self.controller.on_discarded(discarded);
        self.handshake_discarded = true;
        self.retransmit_pending = false;
        debug!(
            connection = self.connection,
            role = self.role().as_str(),
            discarded,
            "handshake complete, handshake space discarded"
        );
    }

    fn on_ack_received(&mut self, space: PacketSpace, ack: AckRanges, now: Instant) {
        if space == PacketSpace::Handshake && self.handshake_discarded {
            return;
        }
        let outcome = self.sent.on_ack(space, ack.numbers());
        if outcome.is_empty() {
            return;
        }
        if let Some(largest) = outcome.largest().copied() {
            if largest.ack_eliciting {
                let sample = now.saturating_duration_since(largest.sent_at);
                self.rtt.update(sample, Duration::ZERO, self.machine.is_complete());
                if self.first_rtt_sample.is_none() {
                    self.first_rtt_sample = Some(now);
                }
            }
        }
        for packet in outcome.newly_acked.iter().filter(|packet| packet.in_flight) {
            self.controller.on_packet_acked(packet.size, packet.sent_at, now);
        }
        self.detect_losses(space, now);
    }

    /// 返回是否判定了丢包。
    fn detect_losses(&mut self, space: PacketSpace, now: Instant) -> bool {
        let outcome = self.sent.detect_losses(space, now, self.rtt.loss_delay());
        if outcome.is_empty() {
            return false;
        }
        debug!(
            connection = self.connection,
            space = space.as_str(),
            lost = outcome.lost.len(),
            "packets declared lost"
        );
        if space == PacketSpace::Handshake && self.machine.in_progress() {
            self.retransmit_pending = self.machine.last_sent().is_some();
        }
        if let Some(largest_sent_at) = outcome.largest_sent_at() {
            self.controller
                .on_packets_lost(outcome.lost_bytes(), largest_sent_at, now);
            if is_persistent_congestion(
                &outcome.lost,
                self.rtt.persistent_congestion_threshold(),
                self.first_rtt_sample,
            ) {
                self.controller.on_persistent_congestion(now);
            }
        }
        true
    }

    fn on_loss_timer(&mut self) {
        let now = self.clock.now();
        let mut lost = false;
        for space in PacketSpace::ALL {
            if space == PacketSpace::Handshake && self.handshake_discarded {
                continue;
            }
            lost |= self.detect_losses(space, now);
        }
        if lost || !self.machine.is_complete() || self.outbound_done {
            return;
        }
        let expired = self
            .sent
            .last_ack_eliciting_sent(PacketSpace::Application)
            .is_some_and(|at| at + self.rtt.pto() <= now);
        if expired {
            trace!(connection = self.connection, "probe timeout, scheduling probe");
            self.probe_pending = true;
        }
    }

    fn wrap_handshake(&mut self, destination: &mut [u8], now: Instant) -> EngineResult {
        let (message, fresh) = match self.machine.pending_message() {
            Some(message) => (message, true),
            None if self.retransmit_pending => match self.machine.last_sent() {
                Some(message) => (message, false),
                None => {
                    self.retransmit_pending = false;
                    return self.result(Status::Ok, 0, 0);
                }
            },
            None => return self.result(Status::Ok, 0, 0),
        };
        if destination.len() < HANDSHAKE_PACKET_LEN {
            return self.result(Status::BufferOverflow, 0, 0);
        }
        let kind = match message {
            HandshakeMessage::Hello(_) => PacketKind::Hello,
            HandshakeMessage::Finished(_) => PacketKind::Finished,
        };
        let number = self.take_number(PacketSpace::Handshake);
        let ack = self.ack_ranges(PacketSpace::Handshake);
        packet::write_header(destination, kind, number, ack, HANDSHAKE_PACKET_LEN - PREFIX_LEN);
        destination[HEADER_LEN..HANDSHAKE_PACKET_LEN].copy_from_slice(message.body());
        self.retransmit_pending = false;
        if !self.handshake_discarded {
            self.track(
                PacketSpace::Handshake,
                SentPacket {
                    number,
                    sent_at: now,
                    size: HANDSHAKE_PACKET_LEN as u64,
                    ack_eliciting: true,
                    in_flight: true,
                },
            );
        }
        trace!(
            connection = self.connection,
            role = self.role().as_str(),
            kind = ?kind,
            number,
            retransmission = !fresh,
            "handshake packet written"
        );
        if fresh && self.machine.message_sent() {
            self.on_handshake_complete();
            return EngineResult::new(
                Status::Ok,
                HandshakeStatus::Finished,
                0,
                HANDSHAKE_PACKET_LEN,
            );
        }
        self.result(Status::Ok, 0, HANDSHAKE_PACKET_LEN)
    }

    /// 写出受保护包：包头、负载、标签。负载已由调用方放在 `HEADER_LEN` 之后。
    fn seal(
        &mut self,
        destination: &mut [u8],
        kind: PacketKind,
        key: &[u8; KEY_LEN],
        payload_len: usize,
    ) -> (u64, usize) {
        let packet_len = PROTECTED_OVERHEAD + payload_len;
        let payload_end = HEADER_LEN + payload_len;
        let number = self.take_number(PacketSpace::Application);
        let ack = self.ack_ranges(PacketSpace::Application);
        packet::write_header(destination, kind, number, ack, packet_len - PREFIX_LEN);
        let tag = compute_tag(key, number, kind.code(), &destination[PREFIX_LEN..payload_end]);
        destination[payload_end..packet_len].copy_from_slice(&tag);
        if ack.is_some() {
            self.ack_pending = false;
        }
        (number, packet_len)
    }

    fn wrap_ack(&mut self, destination: &mut [u8], now: Instant) -> EngineResult {
        let Some(key) = self.write_key() else {
            return self.result(Status::Ok, 0, 0);
        };
        if destination.len() < PROTECTED_OVERHEAD {
            return self.result(Status::BufferOverflow, 0, 0);
        }
        let (number, packet_len) = self.seal(destination, PacketKind::Ack, &key, 0);
        self.track(
            PacketSpace::Application,
            SentPacket {
                number,
                sent_at: now,
                size: packet_len as u64,
                ack_eliciting: false,
                in_flight: false,
            },
        );
        trace!(connection = self.connection, number, "ack packet written");
        self.result(Status::Ok, 0, packet_len)
    }

    fn wrap_close(&mut self, destination: &mut [u8]) -> EngineResult {
        let Some(key) = self.write_key() else {
            self.finish_outbound();
            return self.result(Status::Closed, 0, 0);
        };
        if destination.len() < PROTECTED_OVERHEAD {
            return self.result(Status::BufferOverflow, 0, 0);
        }
        let (_, packet_len) = self.seal(destination, PacketKind::Close, &key, 0);
        self.finish_outbound();
        self.result(Status::Closed, 0, packet_len)
    }

    fn wrap_data(
        &mut self,
        sources: &[&[u8]],
        destination: &mut [u8],
        now: Instant,
    ) -> Result<EngineResult, EngineError> {
        let pending = total_len(sources);
        if pending == 0 && !self.probe_pending {
            if self.ack_pending {
                return Ok(self.wrap_ack(destination, now));
            }
            return Ok(self.result(Status::Ok, 0, 0));
        }
        let Some(key) = self.write_key() else {
            return Err(EngineError::protocol(
                codes::NOT_ESTABLISHED,
                "application data cannot be sent before the handshake completes",
            ));
        };
        let take = pending.min(self.config.max_payload());
        let packet_len = PROTECTED_OVERHEAD + take;
        if destination.len() < packet_len {
            return Ok(self.result(Status::BufferOverflow, 0, 0));
        }
        // 探测包不受拥塞窗口限制。
        let probe = self.probe_pending;
        if !probe && !self.controller.can_send(packet_len as u64) {
            trace!(
                connection = self.connection,
                window = self.controller.window(),
                in_flight = self.controller.bytes_in_flight(),
                "congestion window full"
            );
            if self.ack_pending {
                return Ok(self.wrap_ack(destination, now));
            }
            return Ok(self.result(Status::Ok, 0, 0));
        }
        let copied = gather(sources, &mut destination[HEADER_LEN..HEADER_LEN + take]);
        debug_assert_eq!(copied, take);
        let (number, packet_len) = self.seal(destination, PacketKind::Data, &key, take);
        self.probe_pending = false;
        self.track(
            PacketSpace::Application,
            SentPacket {
                number,
                sent_at: now,
                size: packet_len as u64,
                ack_eliciting: true,
                in_flight: true,
            },
        );
        trace!(connection = self.connection, number, payload = take, probe, "data packet written");
        Ok(self.result(Status::Ok, take, packet_len))
    }

    fn unwrap_handshake(
        &mut self,
        header: PacketHeader,
        body: &[u8],
        now: Instant,
    ) -> Result<EngineResult, EngineError> {
        let packet_len = header.packet_len();
        if header.kind == PacketKind::Hello && self.outbound_done {
            return Err(EngineError::protocol(codes::CLOSED, "engine is closed"));
        }
        if !self.handshake_discarded {
            if !self.received[PacketSpace::Handshake.index()].insert(header.number) {
                trace!(
                    connection = self.connection,
                    number = header.number,
                    "duplicate handshake packet dropped"
                );
                return Ok(self.result(Status::Ok, packet_len, 0));
            }
            if let Some(ack) = header.ack {
                self.on_ack_received(PacketSpace::Handshake, ack, now);
            }
        }
        match header.kind {
            PacketKind::Hello => {
                let repeated = self.peer_hello_seen;
                self.machine.on_hello(body)?;
                self.peer_hello_seen = true;
                if repeated && self.machine.last_sent().is_some() {
                    // 对端没收到本端的回应，重发最近一条握手消息。
                    self.retransmit_pending = !self.machine.is_complete();
                }
                Ok(self.result(Status::Ok, packet_len, 0))
            }
            _ => {
                let was_complete = self.machine.is_complete();
                let completed = self.machine.on_finished(body)?;
                if completed {
                    self.on_handshake_complete();
                    return Ok(EngineResult::new(
                        Status::Ok,
                        HandshakeStatus::Finished,
                        packet_len,
                        0,
                    ));
                }
                if was_complete && self.role() == Role::Server {
                    trace!(connection = self.connection, "client repeated finished, echoing ours");
                    self.retransmit_pending = true;
                }
                Ok(self.result(Status::Ok, packet_len, 0))
            }
        }
    }

    fn unwrap_protected(
        &mut self,
        header: PacketHeader,
        packet: &[u8],
        payload_len: usize,
        destination: &mut [u8],
        now: Instant,
    ) -> Result<EngineResult, EngineError> {
        let packet_len = header.packet_len();
        let Some(key) = self.read_key() else {
            if header.kind == PacketKind::Close {
                self.inbound_done = true;
                return Err(EngineError::incident(
                    IncidentReport::new(
                        IncidentClass::UnexpectedCloseState,
                        "close packet arrived before the handshake completed",
                    )
                    .with_closure(self.outbound_done, true),
                ));
            }
            if self.machine.in_progress() {
                // 对端已完成握手而本端尚未收到其 Finished：数据报语义下直接丢弃。
                trace!(
                    connection = self.connection,
                    number = header.number,
                    kind = ?header.kind,
                    "protected packet dropped while awaiting handshake completion"
                );
                return Ok(self.result(Status::Ok, packet_len, 0));
            }
            return Err(unexpected("protected packet arrived before the handshake started"));
        };
        if header.kind != PacketKind::Data && payload_len != 0 {
            return Err(EngineError::protocol(
                codes::MALFORMED,
                "ack and close packets carry no payload",
            ));
        }
        if destination.len() < payload_len {
            return Ok(self.result(Status::BufferOverflow, 0, 0));
        }
        let tag_start = HEADER_LEN + payload_len;
        debug_assert_eq!(packet.len(), tag_start + TAG_LEN);
        if !verify_tag(
            &key,
            header.number,
            header.kind.code(),
            &packet[PREFIX_LEN..tag_start],
            &packet[tag_start..],
        ) {
            warn!(
                connection = self.connection,
                number = header.number,
                kind = ?header.kind,
                "packet failed integrity check"
            );
            return Err(integrity(codes::BAD_TAG, "packet tag mismatch"));
        }
        if !self.received[PacketSpace::Application.index()].insert(header.number) {
            trace!(connection = self.connection, number = header.number, "duplicate packet dropped");
            return Ok(self.result(Status::Ok, packet_len, 0));
        }
        if let Some(ack) = header.ack {
            self.on_ack_received(PacketSpace::Application, ack, now);
        }
        match header.kind {
            PacketKind::Data => {
                destination[..payload_len].copy_from_slice(&packet[HEADER_LEN..tag_start]);
                self.ack_pending = true;
                Ok(self.result(Status::Ok, packet_len, payload_len))
            }
            PacketKind::Close => {
                self.close_received = true;
                self.inbound_done = true;
                debug!(connection = self.connection, role = self.role().as_str(), "peer closed");
                Ok(self.result(Status::Closed, packet_len, 0))
            }
            _ => Ok(self.result(Status::Ok, packet_len, 0)),
        }
    }
}

impl Engine for QuicEngine {
    fn protocol(&self) -> &'static str {
        "quic"
    }

    fn init(&mut self) -> Result<(), EngineError> {
        self.config.validate().map_err(|err| {
            EngineError::protocol(
                spark_engine::error::codes::DRIVER_CONFIG,
                "invalid quic configuration",
            )
            .with_source(err)
        })?;
        self.lifecycle.activate()?;
        self.machine.set_local_nonce(nonce::fresh()?);
        debug!(
            connection = self.connection,
            role = self.role().as_str(),
            controller = self.controller.name(),
            default_metrics = self.metrics.is_default(),
            "quic engine initialised"
        );
        Ok(())
    }

    fn begin_handshake(&mut self) -> Result<(), EngineError> {
        self.lifecycle.ensure_active("begin_handshake")?;
        if self.outbound_closing || self.outbound_done {
            return Err(EngineError::protocol(
                codes::CLOSED,
                "cannot begin a handshake after close_outbound",
            ));
        }
        if self.machine.is_complete() {
            return Err(EngineError::protocol(
                codes::RENEGOTIATION,
                "renegotiation is not supported",
            ));
        }
        self.machine.start();
        Ok(())
    }

    fn wrap_vectored(
        &mut self,
        sources: &[&[u8]],
        destination: &mut [u8],
    ) -> Result<EngineResult, EngineError> {
        self.lifecycle.ensure_active("wrap")?;
        self.machine.refresh();
        if self.outbound_done {
            return Ok(self.result(Status::Closed, 0, 0));
        }
        let now = self.clock.now();
        if self.machine.in_progress() {
            if self.outbound_closing {
                self.finish_outbound();
                return Ok(self.result(Status::Closed, 0, 0));
            }
            return Ok(self.wrap_handshake(destination, now));
        }
        if self.outbound_closing || self.close_received {
            return Ok(self.wrap_close(destination));
        }
        if self.retransmit_pending && self.machine.is_complete() {
            return Ok(self.wrap_handshake(destination, now));
        }
        self.wrap_data(sources, destination, now)
    }

    fn unwrap(
        &mut self,
        source: &[u8],
        destination: &mut [u8],
    ) -> Result<EngineResult, EngineError> {
        self.lifecycle.ensure_active("unwrap")?;
        self.machine.refresh();
        if self.inbound_done {
            return Ok(self.result(Status::Closed, 0, 0));
        }
        if self.machine.status() == HandshakeStatus::NeedTask {
            return Ok(self.result(Status::Ok, 0, 0));
        }
        let Some(header) = packet::parse(source, self.config.max_datagram_size)? else {
            return Ok(self.result(Status::BufferUnderflow, 0, 0));
        };
        let Some(payload_len) = header.payload_len() else {
            return Err(EngineError::protocol(
                codes::MALFORMED,
                "protected packet is shorter than its tag",
            ));
        };
        let packet = &source[..header.packet_len()];
        let now = self.clock.now();
        if header.kind.is_protected() {
            return self.unwrap_protected(header, packet, payload_len, destination, now);
        }
        if payload_len != MESSAGE_LEN {
            return Err(EngineError::protocol(
                codes::MALFORMED,
                format!("handshake packet body must be {MESSAGE_LEN} bytes"),
            ));
        }
        self.unwrap_handshake(header, &packet[HEADER_LEN..], now)
    }

    fn handshake_status(&self) -> HandshakeStatus {
        self.status()
    }

    fn delegated_task(&mut self) -> Option<DelegatedTask> {
        if !self.lifecycle.is_active() {
            return None;
        }
        self.machine.delegated_task()
    }

    fn is_outbound_done(&self) -> bool {
        self.outbound_done
    }

    fn is_inbound_done(&self) -> bool {
        self.inbound_done
    }

    fn close_outbound(&mut self) -> Result<(), EngineError> {
        self.lifecycle.ensure_active("close_outbound")?;
        if self.outbound_closing {
            return Ok(());
        }
        self.outbound_closing = true;
        if !self.machine.is_started() {
            self.finish_outbound();
        }
        debug!(connection = self.connection, role = self.role().as_str(), "close_outbound requested");
        Ok(())
    }

    fn close_inbound(&mut self) -> Result<(), EngineError> {
        self.lifecycle.ensure_active("close_inbound")?;
        let was_done = self.inbound_done;
        self.inbound_done = true;
        if was_done || self.close_received || !self.machine.is_started() {
            return Ok(());
        }
        warn!(
            connection = self.connection,
            role = self.role().as_str(),
            "inbound ended without a close packet"
        );
        Err(EngineError::incident(
            IncidentReport::new(
                IncidentClass::Truncation,
                "inbound stream ended without an authenticated close packet",
            )
            .with_closure(self.outbound_done, true),
        ))
    }

    fn buffer_sizing(&self) -> BufferSizing {
        let payload = self.config.max_payload();
        let datagram = self.config.max_datagram_size;
        BufferSizing::new(payload, payload, datagram, datagram)
    }

    fn timer(
        &mut self,
        key: Option<TimerKey>,
        _value: Option<TimerValue>,
    ) -> Result<(), EngineError> {
        match key {
            Some(TimerKey::LossDetection) => {
                self.on_loss_timer();
                Ok(())
            }
            Some(TimerKey::Retransmit) => {
                if self.machine.in_progress() && self.machine.last_sent().is_some() {
                    debug!(
                        connection = self.connection,
                        role = self.role().as_str(),
                        "retransmitting handshake message"
                    );
                    self.retransmit_pending = true;
                }
                Ok(())
            }
            Some(TimerKey::AckDelay) => {
                if self.machine.is_complete() && self.ack_ranges(PacketSpace::Application).is_some() {
                    self.ack_pending = true;
                }
                Ok(())
            }
            Some(TimerKey::IdleTimeout) => {
                debug!(connection = self.connection, "idle timeout, closing");
                self.close_outbound()
            }
            Some(TimerKey::HandshakeTimeout) if self.machine.in_progress() => {
                Err(EngineError::protocol(
                    codes::HANDSHAKE_TIMEOUT,
                    "handshake did not complete before its deadline",
                ))
            }
            _ => Ok(()),
        }
    }

    fn cleanup(&mut self) {
        if self.lifecycle.retire() {
            self.machine.clear();
            let discarded = PacketSpace::ALL
                .into_iter()
                .map(|space| self.sent.discard_space(space))
                .sum::<u64>();
            if discarded > 0 {
                self.controller.on_discarded(discarded);
            }
            self.outbound_done = true;
            self.inbound_done = true;
            debug!(connection = self.connection, "quic engine cleaned up");
        }
    }
}

impl fmt::Debug for QuicEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QuicEngine")
            .field("connection", &self.connection)
            .field("role", &self.role())
            .field("lifecycle", &self.lifecycle)
            .field("established", &self.machine.is_complete())
            .field("controller", &self.controller)
            .field("outbound_done", &self.outbound_done)
            .field("inbound_done", &self.inbound_done)
            .finish_non_exhaustive()
    }
}
