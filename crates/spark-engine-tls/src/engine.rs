use std::{
    fmt,
    io::{self, Read, Write},
    sync::Arc,
};

use rustls::{ClientConfig, ClientConnection, Connection, ServerConfig, ServerConnection};
use rustls_pki_types::ServerName;
use spark_engine::{
    BufferSizing, DelegatedTask, Engine, EngineError, EngineResult, HandshakeStatus,
    IncidentClass, IncidentReport, Lifecycle, Status, TimerKey, TimerValue, gather, total_len,
};
use tracing::{debug, trace, warn};

use crate::{
    error::{CONFIGURE, HANDSHAKE, READ, WRITE, codes, map_io_error, map_rustls_error},
    framing::{HEADER_LEN, MAX_CIPHERTEXT, MAX_FRAGMENT, WRITE_OVERHEAD, next_record},
};

/// 基于 `rustls::Connection` 的 TLS 引擎。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - `rustls` 本身就是无 I/O 的状态机：`read_tls`/`process_new_packets` 吃进密文，
///   `write_tls` 吐出密文，`reader`/`writer` 收发明文；本类型把它适配为 [`Engine`] 契约，
///   使驱动器能像对待其它引擎一样驱动 TLS 会话；
/// - 证书校验在 `rustls` 内同步完成，因此 TLS 引擎从不报告 `NeedTask`。
///
/// ## 契约（What）
/// - 握手中：`wants_write` 为真报告 `NeedWrap`，否则 `NeedUnwrap`；
/// - 握手已结束且最后一批握手输出（客户端 Finished、服务端会话票据）写完的那次调用报告一次
///   `Finished`；
/// - `wrap` 先写出挂起的密文，再在目标能容纳整条记录时加密至多 16 KiB 明文；
///   放不下时返回 `BufferOverflow` 且不消费明文，因此重试与一次性大缓冲的消费量一致；
/// - `unwrap` 每次只处理一条完整记录，目标不足以容纳该记录可能的明文时返回 `BufferOverflow`；
/// - 收到 close_notify 后 `unwrap` 报告 `Closed`，出站未关闭时要求 `NeedWrap` 回复 close_notify；
/// - 握手开始后未收到 close_notify 即 `close_inbound`，返回 `Incident(Truncation)`。
///
/// ## 风险与权衡（Trade-offs）
/// - 出站开销按 TLS 1.2 AES-GCM 的 29 字节估算，对 TLS 1.3 略显保守；
/// - 握手完成后再次 `begin_handshake` 视为无操作，`rustls` 不支持重协商。
pub struct TlsEngine {
    lifecycle: Lifecycle,
    conn: Connection,
    role: &'static str,
    handshake_started: bool,
    finished_reported: bool,
    outbound_closing: bool,
    close_notify_queued: bool,
    outbound_done: bool,
    close_received: bool,
    inbound_done: bool,
}

impl TlsEngine {
    /// 以客户端身份连接 `server_name`。
    pub fn client(
        config: Arc<ClientConfig>,
        server_name: ServerName<'static>,
    ) -> Result<Self, EngineError> {
        let conn = ClientConnection::new(config, server_name)
            .map_err(|err| map_rustls_error(CONFIGURE, err))?;
        Ok(Self::from_connection(Connection::Client(conn), "client"))
    }

    pub fn server(config: Arc<ServerConfig>) -> Result<Self, EngineError> {
        let conn = ServerConnection::new(config).map_err(|err| map_rustls_error(CONFIGURE, err))?;
        Ok(Self::from_connection(Connection::Server(conn), "server"))
    }

    fn from_connection(conn: Connection, role: &'static str) -> Self {
        Self {
            lifecycle: Lifecycle::new(),
            conn,
            role,
            handshake_started: false,
            finished_reported: false,
            outbound_closing: false,
            close_notify_queued: false,
            outbound_done: false,
            close_received: false,
            inbound_done: false,
        }
    }

    pub fn role(&self) -> &'static str {
        self.role
    }

    /// 握手是否已完成且 `Finished` 已报告。
    pub fn is_established(&self) -> bool {
        self.finished_reported
    }

    /// 协商出的 TLS 版本；握手完成前为 `None`。
    pub fn protocol_version(&self) -> Option<rustls::ProtocolVersion> {
        self.conn.protocol_version()
    }

    /// 协商出的 ALPN 协议。
    pub fn alpn_protocol(&self) -> Option<&[u8]> {
        self.conn.alpn_protocol()
    }

    fn status(&self) -> HandshakeStatus {
        if !self.lifecycle.is_active() || !self.handshake_started || self.outbound_done {
            return HandshakeStatus::NotHandshaking;
        }
        if self.conn.is_handshaking() {
            return if self.conn.wants_write() {
                HandshakeStatus::NeedWrap
            } else {
                HandshakeStatus::NeedUnwrap
            };
        }
        if self.conn.wants_write() || self.outbound_closing || self.close_received {
            return HandshakeStatus::NeedWrap;
        }
        HandshakeStatus::NotHandshaking
    }

    /// 计算本次调用结果中的握手状态；握手刚刚收敛时报告一次 `Finished`。
    fn settle(&mut self) -> HandshakeStatus {
        if self.handshake_started
            && !self.finished_reported
            && !self.conn.is_handshaking()
            && !self.conn.wants_write()
        {
            self.finished_reported = true;
            debug!(
                role = self.role,
                version = ?self.conn.protocol_version(),
                "tls handshake finished"
            );
            return HandshakeStatus::Finished;
        }
        self.status()
    }

    fn outcome(&mut self, status: Status, consumed: usize, produced: usize) -> EngineResult {
        let handshake = self.settle();
        EngineResult::new(status, handshake, consumed, produced)
    }

    fn idle(&self, status: Status) -> EngineResult {
        EngineResult::new(status, self.status(), 0, 0)
    }

    fn queue_close_notify(&mut self) {
        if !self.close_notify_queued {
            self.conn.send_close_notify();
            self.close_notify_queued = true;
            trace!(role = self.role, "close_notify queued");
        }
    }

    fn finish_outbound(&mut self) {
        if !self.outbound_done {
            self.outbound_done = true;
            debug!(role = self.role, "outbound closed");
        }
    }

    /// 把 `rustls` 挂起的密文写入目标，返回写入字节数。
    fn write_pending(&mut self, destination: &mut [u8]) -> Result<usize, EngineError> {
        let mut cursor = io::Cursor::new(destination);
        while self.conn.wants_write() {
            let room = cursor.get_ref().len() - cursor.position() as usize;
            if room == 0 {
                break;
            }
            let written = self
                .conn
                .write_tls(&mut cursor)
                .map_err(|err| map_io_error(WRITE, err))?;
            if written == 0 {
                break;
            }
        }
        Ok(cursor.position() as usize)
    }

    fn seal(
        &mut self,
        sources: &[&[u8]],
        destination: &mut [u8],
        take: usize,
    ) -> Result<usize, EngineError> {
        let mut plaintext = vec![0_u8; take];
        gather(sources, &mut plaintext);
        self.conn
            .writer()
            .write_all(&plaintext)
            .map_err(|err| map_io_error(WRITE, err))?;
        self.write_pending(destination)
    }
}

impl fmt::Debug for TlsEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsEngine")
            .field("role", &self.role)
            .field("lifecycle", &self.lifecycle.state())
            .field("handshaking", &self.conn.is_handshaking())
            .field("outbound_done", &self.outbound_done)
            .field("inbound_done", &self.inbound_done)
            .finish_non_exhaustive()
    }
}

impl Engine for TlsEngine {
    fn protocol(&self) -> &'static str {
        "tls"
    }

    fn init(&mut self) -> Result<(), EngineError> {
        self.lifecycle.activate()?;
        debug!(role = self.role, "tls engine initialised");
        Ok(())
    }

    fn begin_handshake(&mut self) -> Result<(), EngineError> {
        self.lifecycle.ensure_active("begin_handshake")?;
        if self.outbound_closing {
            return Err(EngineError::protocol(
                codes::CLOSED,
                "cannot begin a handshake after close_outbound",
            ));
        }
        if self.finished_reported {
            debug!(role = self.role, "renegotiation is not supported; begin_handshake ignored");
            return Ok(());
        }
        self.handshake_started = true;
        Ok(())
    }

    fn wrap_vectored(
        &mut self,
        sources: &[&[u8]],
        destination: &mut [u8],
    ) -> Result<EngineResult, EngineError> {
        self.lifecycle.ensure_active("wrap")?;
        if self.outbound_done {
            return Ok(self.idle(Status::Closed));
        }
        if self.close_received && !self.outbound_closing {
            self.outbound_closing = true;
            self.queue_close_notify();
        }
        if self.conn.is_handshaking() && self.conn.wants_write() {
            self.handshake_started = true;
        }

        let mut produced = 0;
        if self.conn.wants_write() {
            if destination.is_empty() {
                return Ok(self.idle(Status::BufferOverflow));
            }
            produced = self.write_pending(destination)?;
            if self.conn.wants_write() {
                return Ok(self.outcome(Status::Ok, 0, produced));
            }
        }
        if self.outbound_closing {
            self.finish_outbound();
            return Ok(self.outcome(Status::Closed, 0, produced));
        }

        let pending = total_len(sources);
        if pending == 0 || self.conn.is_handshaking() {
            return Ok(self.outcome(Status::Ok, 0, produced));
        }
        let take = pending.min(MAX_FRAGMENT);
        let room = destination.len() - produced;
        if room < take + WRITE_OVERHEAD {
            if produced > 0 {
                return Ok(self.outcome(Status::Ok, 0, produced));
            }
            return Ok(self.idle(Status::BufferOverflow));
        }
        produced += self.seal(sources, &mut destination[produced..], take)?;
        trace!(role = self.role, plaintext = take, produced, "application data sealed");
        Ok(self.outcome(Status::Ok, take, produced))
    }

    fn unwrap(
        &mut self,
        source: &[u8],
        destination: &mut [u8],
    ) -> Result<EngineResult, EngineError> {
        self.lifecycle.ensure_active("unwrap")?;
        if self.inbound_done {
            return Ok(self.idle(Status::Closed));
        }
        let Some(record) = next_record(source)? else {
            return Ok(self.idle(Status::BufferUnderflow));
        };
        if destination.len() < record.plaintext_bound() {
            return Ok(self.idle(Status::BufferOverflow));
        }
        // 服务端无需显式 begin_handshake 即可受理 ClientHello。
        self.handshake_started = true;

        let mut input = &source[..record.record_len()];
        let mut consumed = 0;
        while !input.is_empty() {
            let read = self
                .conn
                .read_tls(&mut input)
                .map_err(|err| map_io_error(READ, err))?;
            if read == 0 {
                break;
            }
            consumed += read;
        }

        let kind = if self.conn.is_handshaking() { HANDSHAKE } else { READ };
        let state = match self.conn.process_new_packets() {
            Ok(state) => state,
            Err(err) => {
                warn!(role = self.role, error = %err, "tls record rejected");
                return Err(map_rustls_error(kind, err));
            }
        };

        let available = state.plaintext_bytes_to_read();
        if available > destination.len() {
            return Err(EngineError::protocol(
                codes::READ_FAILED,
                format!("record decrypted to {available} bytes, more than its ciphertext bound"),
            ));
        }
        if available > 0 {
            self.conn
                .reader()
                .read_exact(&mut destination[..available])
                .map_err(|err| map_io_error(READ, err))?;
        }

        if state.peer_has_closed() && !self.close_received {
            self.close_received = true;
            self.inbound_done = true;
            debug!(role = self.role, "close_notify received");
            return Ok(self.outcome(Status::Closed, consumed, available));
        }
        trace!(role = self.role, consumed, produced = available, "tls record opened");
        Ok(self.outcome(Status::Ok, consumed, available))
    }

    fn handshake_status(&self) -> HandshakeStatus {
        self.status()
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
        self.lifecycle.ensure_active("close_outbound")?;
        if self.outbound_closing {
            return Ok(());
        }
        self.outbound_closing = true;
        if self.handshake_started {
            self.queue_close_notify();
        } else {
            self.finish_outbound();
        }
        debug!(role = self.role, "close_outbound requested");
        Ok(())
    }

    fn close_inbound(&mut self) -> Result<(), EngineError> {
        self.lifecycle.ensure_active("close_inbound")?;
        let was_done = self.inbound_done;
        self.inbound_done = true;
        if was_done || self.close_received || !self.handshake_started {
            return Ok(());
        }
        warn!(role = self.role, "inbound ended without close_notify");
        Err(EngineError::incident(
            IncidentReport::new(
                IncidentClass::Truncation,
                "tls stream ended without close_notify",
            )
            .with_closure(self.outbound_done, true),
        ))
    }

    fn buffer_sizing(&self) -> BufferSizing {
        BufferSizing::new(
            MAX_FRAGMENT,
            MAX_FRAGMENT,
            MAX_FRAGMENT + WRITE_OVERHEAD,
            HEADER_LEN + MAX_CIPHERTEXT,
        )
    }

    fn timer(
        &mut self,
        key: Option<TimerKey>,
        _value: Option<TimerValue>,
    ) -> Result<(), EngineError> {
        match key {
            Some(TimerKey::IdleTimeout) => {
                debug!(role = self.role, "idle timeout, closing");
                self.close_outbound()
            }
            Some(TimerKey::HandshakeTimeout)
                if self.handshake_started && !self.finished_reported =>
            {
                warn!(role = self.role, "tls handshake timed out");
                Err(EngineError::protocol(
                    codes::HANDSHAKE_TIMEOUT,
                    "tls handshake did not complete in time",
                ))
            }
            _ => Ok(()),
        }
    }

    fn cleanup(&mut self) {
        if self.lifecycle.retire() {
            self.outbound_done = true;
            self.inbound_done = true;
            debug!(role = self.role, "tls engine cleaned up");
        }
    }
}
