//! 预共享密钥握手状态机。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 握手逻辑与线格式分离：记录层引擎与 QUIC 类引擎各自负责封帧，共用同一个消息级状态机；
//! - 昂贵的密钥派生以 [`DelegatedTask`] 交出，状态机在任务完成前报告 `NeedTask`。
//!
//! ## 流程（How）
//! ```text
//! client: Idle → SendHello → AwaitHello → DeriveKeys → SendFinished → AwaitFinished → Complete
//! server: Idle → AwaitHello → SendHello → DeriveKeys → AwaitFinished → SendFinished → Complete
//! ```
//! - 客户端在收到服务端 Finished 的那次 `unwrap` 中完成；服务端在写出自己 Finished 的那次 `wrap` 中完成；
//! - 派生任务把密钥写入 `parking_lot::Mutex` 槽位；[`HandshakeMachine::status`] 只读地窥视槽位，
//!   下一次可变调用经 [`HandshakeMachine::refresh`] 把密钥取回并推进阶段。
//!
//! ## 契约（What）
//! - 重复收到与已处理消息完全相同的 Hello/Finished 会被忽略，便于承载层重传；
//! - Finished 校验失败返回 `SecurityClass::Authentication` 类协议错误。

use core::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use spark_engine::{DelegatedTask, EngineError, HandshakeStatus, SecurityClass};
use tracing::{debug, trace};

use crate::{
    error::{codes, unexpected},
    nonce::NONCE_LEN,
    protect::{KEY_LEN, constant_time_eq},
};

/// Hello 与 Finished 消息主体的固定长度。
pub const MESSAGE_LEN: usize = 32;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Role {
    Client,
    Server,
}

impl Role {
    pub const fn as_str(self) -> &'static str {
        match self {
            Role::Client => "client",
            Role::Server => "server",
        }
    }
}

/// 状态机要求承载层写出的消息。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandshakeMessage {
    Hello([u8; MESSAGE_LEN]),
    Finished([u8; MESSAGE_LEN]),
}

impl HandshakeMessage {
    pub fn body(&self) -> &[u8; MESSAGE_LEN] {
        match self {
            HandshakeMessage::Hello(body) | HandshakeMessage::Finished(body) => body,
        }
    }
}

/// 握手派生出的会话密钥。
#[derive(Clone, PartialEq, Eq)]
pub struct SessionKeys {
    client_write: [u8; KEY_LEN],
    server_write: [u8; KEY_LEN],
    client_finished: [u8; KEY_LEN],
    server_finished: [u8; KEY_LEN],
}

impl SessionKeys {
    /// 迭代 SHA-256 派生：`seed = H(psk ‖ client_nonce ‖ server_nonce)`，再做 `rounds` 次
    /// `seed = H(seed ‖ psk)`，最后按用途加标签展开。
    pub fn derive(
        psk: &[u8],
        client_nonce: &[u8; NONCE_LEN],
        server_nonce: &[u8; NONCE_LEN],
        rounds: u32,
    ) -> Self {
        let mut seed: [u8; KEY_LEN] = Sha256::new()
            .chain_update(psk)
            .chain_update(client_nonce)
            .chain_update(server_nonce)
            .finalize()
            .into();
        for _ in 0..rounds {
            seed = Sha256::new()
                .chain_update(seed)
                .chain_update(psk)
                .finalize()
                .into();
        }
        let expand = |label: &[u8]| -> [u8; KEY_LEN] {
            let mut key: [u8; KEY_LEN] = Sha256::new()
                .chain_update(seed)
                .chain_update(label)
                .finalize()
                .into();
            // 把两个随机数绑定进 Finished 密钥，使校验值覆盖整段握手记录。
            if label.ends_with(b"finished") {
                key = Sha256::new()
                    .chain_update(key)
                    .chain_update(client_nonce)
                    .chain_update(server_nonce)
                    .finalize()
                    .into();
            }
            key
        };
        Self {
            client_write: expand(b"client write"),
            server_write: expand(b"server write"),
            client_finished: expand(b"client finished"),
            server_finished: expand(b"server finished"),
        }
    }

    pub fn write_key(&self, role: Role) -> &[u8; KEY_LEN] {
        match role {
            Role::Client => &self.client_write,
            Role::Server => &self.server_write,
        }
    }

    pub fn read_key(&self, role: Role) -> &[u8; KEY_LEN] {
        match role {
            Role::Client => &self.server_write,
            Role::Server => &self.client_write,
        }
    }

    fn verify_data(&self, sender: Role) -> [u8; MESSAGE_LEN] {
        match sender {
            Role::Client => self.client_finished,
            Role::Server => self.server_finished,
        }
    }
}

impl fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionKeys").finish_non_exhaustive()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Stage {
    Idle,
    SendHello,
    AwaitHello,
    DeriveKeys,
    SendFinished,
    AwaitFinished,
    Complete,
}

type KeySlot = Arc<Mutex<Option<SessionKeys>>>;

pub struct HandshakeMachine {
    role: Role,
    psk: Arc<[u8]>,
    kdf_rounds: u32,
    stage: Stage,
    local_nonce: [u8; NONCE_LEN],
    peer_nonce: Option<[u8; NONCE_LEN]>,
    slot: KeySlot,
    task_issued: bool,
    keys: Option<SessionKeys>,
    peer_finished_seen: bool,
    last_sent: Option<HandshakeMessage>,
}

impl HandshakeMachine {
    pub fn new(role: Role, psk: &[u8], kdf_rounds: u32, local_nonce: [u8; NONCE_LEN]) -> Self {
        Self {
            role,
            psk: Arc::from(psk),
            kdf_rounds,
            stage: Stage::Idle,
            local_nonce,
            peer_nonce: None,
            slot: Arc::new(Mutex::new(None)),
            task_issued: false,
            keys: None,
            peer_finished_seen: false,
            last_sent: None,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// 替换本端随机数；只在握手开始之前有效。
    pub fn set_local_nonce(&mut self, nonce: [u8; NONCE_LEN]) {
        if self.stage == Stage::Idle {
            self.local_nonce = nonce;
        }
    }

    pub fn is_started(&self) -> bool {
        self.stage != Stage::Idle
    }

    pub fn is_complete(&self) -> bool {
        self.stage == Stage::Complete
    }

    pub fn in_progress(&self) -> bool {
        self.is_started() && !self.is_complete()
    }

    pub fn keys(&self) -> Option<&SessionKeys> {
        self.keys.as_ref()
    }

    /// 最近一次写出的握手消息，供承载层重传。
    pub fn last_sent(&self) -> Option<HandshakeMessage> {
        self.last_sent
    }

    /// 开始握手；已经开始时无效果。
    pub fn start(&mut self) {
        if self.stage != Stage::Idle {
            return;
        }
        self.stage = match self.role {
            Role::Client => Stage::SendHello,
            Role::Server => Stage::AwaitHello,
        };
        debug!(role = self.role.as_str(), "handshake started");
    }

    /// 当前握手状态；派生任务已完成但尚未被 `refresh` 吸收时，报告吸收之后的状态。
    pub fn status(&self) -> HandshakeStatus {
        match self.stage {
            Stage::Idle | Stage::Complete => HandshakeStatus::NotHandshaking,
            Stage::SendHello | Stage::SendFinished => HandshakeStatus::NeedWrap,
            Stage::AwaitHello | Stage::AwaitFinished => HandshakeStatus::NeedUnwrap,
            Stage::DeriveKeys => {
                if self.slot.lock().is_some() {
                    self.stage_after_derive_status()
                } else {
                    HandshakeStatus::NeedTask
                }
            }
        }
    }

    fn stage_after_derive(&self) -> Stage {
        match self.role {
            Role::Client => Stage::SendFinished,
            Role::Server => Stage::AwaitFinished,
        }
    }

    fn stage_after_derive_status(&self) -> HandshakeStatus {
        match self.stage_after_derive() {
            Stage::SendFinished => HandshakeStatus::NeedWrap,
            _ => HandshakeStatus::NeedUnwrap,
        }
    }

    /// 吸收已完成的派生结果。
    pub fn refresh(&mut self) {
        if self.stage != Stage::DeriveKeys {
            return;
        }
        if let Some(keys) = self.slot.lock().take() {
            self.keys = Some(keys);
            self.stage = self.stage_after_derive();
            trace!(role = self.role.as_str(), "session keys absorbed");
        }
    }

    /// 取出密钥派生任务；每次握手只会交出一次。
    pub fn delegated_task(&mut self) -> Option<DelegatedTask> {
        if self.stage != Stage::DeriveKeys || self.task_issued {
            return None;
        }
        let peer_nonce = self.peer_nonce?;
        let (client_nonce, server_nonce) = match self.role {
            Role::Client => (self.local_nonce, peer_nonce),
            Role::Server => (peer_nonce, self.local_nonce),
        };
        self.task_issued = true;
        let psk = Arc::clone(&self.psk);
        let rounds = self.kdf_rounds;
        let slot = Arc::clone(&self.slot);
        Some(DelegatedTask::new("record.derive_keys", move || {
            let keys = SessionKeys::derive(&psk, &client_nonce, &server_nonce, rounds);
            *slot.lock() = Some(keys);
        }))
    }

    /// 当前需要写出的消息；不改变状态，写出成功后调用 [`message_sent`](Self::message_sent)。
    pub fn pending_message(&self) -> Option<HandshakeMessage> {
        match self.stage {
            Stage::SendHello => Some(HandshakeMessage::Hello(self.local_nonce)),
            Stage::SendFinished => self
                .keys
                .as_ref()
                .map(|keys| HandshakeMessage::Finished(keys.verify_data(self.role))),
            _ => None,
        }
    }

    /// 确认待发消息已写出；返回握手是否因此完成。
    pub fn message_sent(&mut self) -> bool {
        self.last_sent = self.pending_message();
        match (self.stage, self.role) {
            (Stage::SendHello, Role::Client) => self.stage = Stage::AwaitHello,
            (Stage::SendHello, Role::Server) => self.stage = Stage::DeriveKeys,
            (Stage::SendFinished, Role::Client) => self.stage = Stage::AwaitFinished,
            (Stage::SendFinished, Role::Server) => {
                self.stage = Stage::Complete;
                debug!(role = self.role.as_str(), "handshake complete");
                return true;
            }
            _ => {}
        }
        false
    }

    /// 处理对端的 Hello；服务端在尚未开始时隐式开始。
    pub fn on_hello(&mut self, body: &[u8]) -> Result<(), EngineError> {
        let nonce: [u8; NONCE_LEN] = body.try_into().map_err(|_| {
            EngineError::protocol(codes::MALFORMED, format!("hello body must be {NONCE_LEN} bytes"))
        })?;
        if self.peer_nonce == Some(nonce) {
            trace!(role = self.role.as_str(), "duplicate hello ignored");
            return Ok(());
        }
        if self.stage == Stage::Idle && self.role == Role::Server {
            self.start();
        }
        if self.stage != Stage::AwaitHello {
            return Err(unexpected(format!(
                "hello is not expected while {} is in {:?}",
                self.role.as_str(),
                self.stage
            )));
        }
        self.peer_nonce = Some(nonce);
        self.stage = match self.role {
            Role::Client => Stage::DeriveKeys,
            Role::Server => Stage::SendHello,
        };
        Ok(())
    }

    /// 处理对端的 Finished；返回握手是否因此完成。
    pub fn on_finished(&mut self, body: &[u8]) -> Result<bool, EngineError> {
        if body.len() != MESSAGE_LEN {
            return Err(EngineError::protocol(
                codes::MALFORMED,
                format!("finished body must be {MESSAGE_LEN} bytes"),
            ));
        }
        if self.stage == Stage::DeriveKeys {
            self.refresh();
        }
        let peer = match self.role {
            Role::Client => Role::Server,
            Role::Server => Role::Client,
        };
        if self.peer_finished_seen {
            let expected = self.keys.as_ref().map(|keys| keys.verify_data(peer));
            if expected.is_some_and(|expected| constant_time_eq(&expected, body)) {
                trace!(role = self.role.as_str(), "duplicate finished ignored");
                return Ok(false);
            }
        }
        if self.stage != Stage::AwaitFinished {
            return Err(unexpected(format!(
                "finished is not expected while {} is in {:?}",
                self.role.as_str(),
                self.stage
            )));
        }
        let Some(keys) = self.keys.as_ref() else {
            return Err(unexpected("finished arrived before keys were derived"));
        };
        if !constant_time_eq(&keys.verify_data(peer), body) {
            return Err(EngineError::security(
                codes::BAD_FINISHED,
                SecurityClass::Authentication,
                "peer finished does not match; pre-shared keys differ",
            ));
        }
        self.peer_finished_seen = true;
        match self.role {
            Role::Client => {
                self.stage = Stage::Complete;
                debug!(role = self.role.as_str(), "handshake complete");
                Ok(true)
            }
            Role::Server => {
                self.stage = Stage::SendFinished;
                Ok(false)
            }
        }
    }

    /// 丢弃密钥与任务槽位。
    pub fn clear(&mut self) {
        self.keys = None;
        *self.slot.lock() = None;
    }
}

impl fmt::Debug for HandshakeMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandshakeMachine")
            .field("role", &self.role)
            .field("stage", &self.stage)
            .field("task_issued", &self.task_issued)
            .finish_non_exhaustive()
    }
}
