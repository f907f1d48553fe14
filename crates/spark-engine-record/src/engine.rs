use spark_engine::{
    BufferSizing, DelegatedTask, Engine, EngineError, EngineResult, HandshakeStatus,
    IncidentClass, IncidentReport, Lifecycle, Status, TimerKey, TimerValue, gather, total_len,
};
use tracing::{debug, trace, warn};

use crate::{
    config::RecordConfig,
    error::{codes, integrity, unexpected},
    handshake::{HandshakeMachine, HandshakeMessage, MESSAGE_LEN, Role},
    nonce,
    protect::{TAG_LEN, compute_tag, verify_tag},
    wire::{HEADER_LEN, RecordType, parse_header, write_header},
};

/// 单条受保护记录除明文外的固定开销。
pub const RECORD_OVERHEAD: usize = HEADER_LEN + TAG_LEN;
const HANDSHAKE_RECORD_LEN: usize = HEADER_LEN + MESSAGE_LEN;

/// 预共享密钥记录层引擎。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 提供一个完整、可在内存中确定性验证的引擎实现：握手、委派任务、记录保护、认证关闭全部具备，
///   又不依赖任何外部密码库；
/// - 驱动器、会话层测试可以用它覆盖 `NeedTask`、`BufferOverflow`、截断事件等全部分支。
///
/// ## 契约（What）
/// - 线格式见 [`crate::wire`]；数据与关闭记录的主体末尾携带 16 字节标签，
///   标签绑定方向密钥、方向序号与记录类型；
/// - `wrap` 每次最多产出一条记录，目标放不下整条记录时返回 `BufferOverflow` 且不消费任何字节；
/// - 标签不符或记录超长返回 `SecurityClass::Integrity` 协议错误；
/// - `close_inbound` 在握手开始后却没有收到关闭记录时返回 `Incident(Truncation)`；
/// - 关闭记录出现在握手完成之前时返回 `Incident(UnexpectedCloseState)`。
///
/// ## 状态（How）
/// - `outbound_closing`：调用过 `close_outbound`，下一次 `wrap` 写出关闭记录；
/// - `outbound_done`：关闭记录已写出（或无需写出）；
/// - `close_received`：收到并校验了对端关闭记录；此时若本端尚未关闭，握手状态报告 `NeedWrap` 以回复关闭。
#[derive(Debug)]
pub struct RecordEngine {
    lifecycle: Lifecycle,
    config: RecordConfig,
    machine: HandshakeMachine,
    send_seq: u64,
    recv_seq: u64,
    outbound_closing: bool,
    outbound_done: bool,
    close_received: bool,
    inbound_done: bool,
}

impl RecordEngine {
    pub fn client(config: RecordConfig) -> Self {
        Self::new(Role::Client, config)
    }

    pub fn server(config: RecordConfig) -> Self {
        Self::new(Role::Server, config)
    }

    pub fn new(role: Role, config: RecordConfig) -> Self {
        let machine = HandshakeMachine::new(
            role,
            config.psk.as_bytes(),
            config.kdf_rounds,
            [0; nonce::NONCE_LEN],
        );
        Self {
            lifecycle: Lifecycle::new(),
            config,
            machine,
            send_seq: 0,
            recv_seq: 0,
            outbound_closing: false,
            outbound_done: false,
            close_received: false,
            inbound_done: false,
        }
    }

    pub fn role(&self) -> Role {
        self.machine.role()
    }

    pub fn is_established(&self) -> bool {
        self.machine.is_complete()
    }

    fn status(&self) -> HandshakeStatus {
        if self.machine.in_progress() && !self.outbound_done {
            return self.machine.status();
        }
        if self.machine.is_complete() && !self.outbound_done && (self.close_received || self.outbound_closing) {
            return HandshakeStatus::NeedWrap;
        }
        HandshakeStatus::NotHandshaking
    }

    fn result(&self, status: Status, consumed: usize, produced: usize) -> EngineResult {
        EngineResult::new(status, self.status(), consumed, produced)
    }

    fn finish_outbound(&mut self) {
        if !self.outbound_done {
            self.outbound_done = true;
            debug!(role = self.role().as_str(), "outbound closed");
        }
    }

    fn wrap_handshake(&mut self, destination: &mut [u8]) -> EngineResult {
        let Some(message) = self.machine.pending_message() else {
            return self.result(Status::Ok, 0, 0);
        };
        if destination.len() < HANDSHAKE_RECORD_LEN {
            return self.result(Status::BufferOverflow, 0, 0);
        }
        let kind = match message {
            HandshakeMessage::Hello(_) => RecordType::Hello,
            HandshakeMessage::Finished(_) => RecordType::Finished,
        };
        write_header(destination, kind, MESSAGE_LEN);
        destination[HEADER_LEN..HANDSHAKE_RECORD_LEN].copy_from_slice(message.body());
        let completed = self.machine.message_sent();
        trace!(role = self.role().as_str(), kind = ?kind, "handshake record written");
        let handshake = if completed {
            HandshakeStatus::Finished
        } else {
            self.status()
        };
        EngineResult::new(Status::Ok, handshake, 0, HANDSHAKE_RECORD_LEN)
    }

    fn wrap_close(&mut self, destination: &mut [u8]) -> EngineResult {
        let Some(keys) = self.machine.keys() else {
            self.finish_outbound();
            return self.result(Status::Closed, 0, 0);
        };
        if destination.len() < RECORD_OVERHEAD {
            return self.result(Status::BufferOverflow, 0, 0);
        }
        let tag = compute_tag(
            keys.write_key(self.role()),
            self.send_seq,
            RecordType::Close.code(),
            &[],
        );
        write_header(destination, RecordType::Close, TAG_LEN);
        destination[HEADER_LEN..RECORD_OVERHEAD].copy_from_slice(&tag);
        self.send_seq += 1;
        self.finish_outbound();
        self.result(Status::Closed, 0, RECORD_OVERHEAD)
    }

    fn wrap_data(
        &mut self,
        sources: &[&[u8]],
        destination: &mut [u8],
    ) -> Result<EngineResult, EngineError> {
        let pending = total_len(sources);
        if pending == 0 {
            return Ok(self.result(Status::Ok, 0, 0));
        }
        let Some(keys) = self.machine.keys() else {
            return Err(EngineError::protocol(
                codes::NOT_ESTABLISHED,
                "application data cannot be sent before the handshake completes",
            ));
        };
        let take = pending.min(self.config.max_fragment);
        let record_len = RECORD_OVERHEAD + take;
        if destination.len() < record_len {
            return Ok(self.result(Status::BufferOverflow, 0, 0));
        }
        let payload_end = HEADER_LEN + take;
        let copied = gather(sources, &mut destination[HEADER_LEN..payload_end]);
        debug_assert_eq!(copied, take);
        let tag = compute_tag(
            keys.write_key(self.role()),
            self.send_seq,
            RecordType::Data.code(),
            &destination[HEADER_LEN..payload_end],
        );
        write_header(destination, RecordType::Data, take + TAG_LEN);
        destination[payload_end..record_len].copy_from_slice(&tag);
        self.send_seq += 1;
        trace!(role = self.role().as_str(), payload = take, seq = self.send_seq, "data record written");
        Ok(self.result(Status::Ok, take, record_len))
    }

    fn unwrap_record(
        &mut self,
        kind: RecordType,
        body: &[u8],
        record_len: usize,
        destination: &mut [u8],
    ) -> Result<EngineResult, EngineError> {
        match kind {
            RecordType::Hello => {
                if self.outbound_done {
                    return Err(EngineError::protocol(codes::CLOSED, "engine is closed"));
                }
                self.machine.on_hello(body)?;
                Ok(self.result(Status::Ok, record_len, 0))
            }
            RecordType::Finished => {
                let completed = self.machine.on_finished(body)?;
                let handshake = if completed {
                    HandshakeStatus::Finished
                } else {
                    self.status()
                };
                Ok(EngineResult::new(Status::Ok, handshake, record_len, 0))
            }
            RecordType::Data => {
                let Some(keys) = self.machine.keys().filter(|_| self.machine.is_complete()) else {
                    return Err(unexpected("data record arrived before the handshake completed"));
                };
                let Some(payload_len) = body.len().checked_sub(TAG_LEN) else {
                    return Err(integrity(codes::MALFORMED, "data record is shorter than its tag"));
                };
                if destination.len() < payload_len {
                    return Ok(self.result(Status::BufferOverflow, 0, 0));
                }
                let (payload, tag) = body.split_at(payload_len);
                if !verify_tag(keys.read_key(self.role()), self.recv_seq, RecordType::Data.code(), payload, tag) {
                    warn!(role = self.role().as_str(), seq = self.recv_seq, "data record failed integrity check");
                    return Err(integrity(codes::BAD_TAG, "data record tag mismatch"));
                }
                destination[..payload_len].copy_from_slice(payload);
                self.recv_seq += 1;
                Ok(self.result(Status::Ok, record_len, payload_len))
            }
            RecordType::Close => {
                let Some(keys) = self.machine.keys().filter(|_| self.machine.is_complete()) else {
                    self.inbound_done = true;
                    return Err(EngineError::incident(
                        IncidentReport::new(
                            IncidentClass::UnexpectedCloseState,
                            "close record arrived before the handshake completed",
                        )
                        .with_closure(self.outbound_done, true),
                    ));
                };
                if !verify_tag(keys.read_key(self.role()), self.recv_seq, RecordType::Close.code(), &[], body) {
                    warn!(role = self.role().as_str(), "close record failed integrity check");
                    return Err(integrity(codes::BAD_TAG, "close record tag mismatch"));
                }
                self.recv_seq += 1;
                self.close_received = true;
                self.inbound_done = true;
                debug!(role = self.role().as_str(), "peer closed");
                Ok(self.result(Status::Closed, record_len, 0))
            }
        }
    }
}

impl Engine for RecordEngine {
    fn protocol(&self) -> &'static str {
        "record"
    }

    fn init(&mut self) -> Result<(), EngineError> {
        self.config.validate().map_err(|err| {
            EngineError::protocol(spark_engine::error::codes::DRIVER_CONFIG, "invalid record configuration")
                .with_source(err)
        })?;
        self.lifecycle.activate()?;
        self.machine.set_local_nonce(nonce::fresh()?);
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
        if self.machine.in_progress() {
            if self.outbound_closing {
                // 握手尚未完成时没有密钥可用于认证关闭记录，直接放弃出站方向。
                self.finish_outbound();
                return Ok(self.result(Status::Closed, 0, 0));
            }
            return Ok(self.wrap_handshake(destination));
        }
        if self.outbound_closing || self.close_received {
            return Ok(self.wrap_close(destination));
        }
        self.wrap_data(sources, destination)
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
        let max_body = self.config.max_fragment + TAG_LEN;
        let Some(header) = parse_header(source, max_body)? else {
            return Ok(self.result(Status::BufferUnderflow, 0, 0));
        };
        let record_len = header.record_len();
        let Some(body) = source.get(HEADER_LEN..record_len) else {
            return Ok(self.result(Status::BufferUnderflow, 0, 0));
        };
        if header.kind.is_handshake() && body.len() != MESSAGE_LEN {
            return Err(EngineError::protocol(
                codes::MALFORMED,
                format!("handshake record body must be {MESSAGE_LEN} bytes"),
            ));
        }
        self.unwrap_record(header.kind, body, record_len, destination)
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
        debug!(role = self.role().as_str(), "close_outbound requested");
        Ok(())
    }

    fn close_inbound(&mut self) -> Result<(), EngineError> {
        self.lifecycle.ensure_active("close_inbound")?;
        let was_done = self.inbound_done;
        self.inbound_done = true;
        if was_done || self.close_received || !self.machine.is_started() {
            return Ok(());
        }
        warn!(role = self.role().as_str(), "inbound ended without a close record");
        Err(EngineError::incident(
            IncidentReport::new(
                IncidentClass::Truncation,
                "inbound stream ended without an authenticated close record",
            )
            .with_closure(self.outbound_done, true),
        ))
    }

    fn buffer_sizing(&self) -> BufferSizing {
        let record = self.config.max_record_len();
        BufferSizing::new(self.config.max_fragment, self.config.max_fragment, record, record)
    }

    fn timer(
        &mut self,
        key: Option<TimerKey>,
        _value: Option<TimerValue>,
    ) -> Result<(), EngineError> {
        match key {
            Some(TimerKey::IdleTimeout) => {
                debug!(role = self.role().as_str(), "idle timeout, closing");
                self.close_outbound()
            }
            _ => Ok(()),
        }
    }

    fn cleanup(&mut self) {
        if self.lifecycle.retire() {
            self.machine.clear();
            self.outbound_done = true;
            self.inbound_done = true;
            debug!(role = self.role().as_str(), "record engine cleaned up");
        }
    }
}
