use core::fmt;
use std::time::Duration;

use serde::Deserialize;
use spark_engine::ConfigError;
use spark_engine_record::{DEFAULT_KDF_ROUNDS, handshake::MESSAGE_LEN};

use crate::packet::{HEADER_LEN, PROTECTED_OVERHEAD};

pub const DEFAULT_MAX_DATAGRAM_SIZE: usize = 1200;
pub const DEFAULT_INITIAL_RTT_MS: u64 = 333;
pub const DEFAULT_MAX_ACK_DELAY_MS: u64 = 25;
pub const DEFAULT_IDLE_TIMEOUT_MS: u64 = 30_000;

/// QUIC 类引擎配置。
///
/// # 契约（What）
/// - `psk`/`kdf_rounds`：握手口令与派生迭代次数，语义同记录层引擎；
/// - `max_datagram_size`：单个包在线上的最大字节数，必须能容纳握手包与至少 1 字节负载的数据包；
/// - `initial_rtt_ms`：尚无 RTT 样本时使用的估计值；
/// - `max_ack_delay_ms`：本端承诺的最大确认延迟，参与 PTO 计算；
/// - `idle_timeout_ms`：建议的空闲超时，引擎只报告，由驱动方决定何时触发 `IdleTimeout`。
///
/// `Debug` 输出不会包含口令。
#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct QuicConfig {
    pub psk: String,
    pub kdf_rounds: u32,
    pub max_datagram_size: usize,
    pub initial_rtt_ms: u64,
    pub max_ack_delay_ms: u64,
    pub idle_timeout_ms: u64,
}

impl Default for QuicConfig {
    fn default() -> Self {
        Self {
            psk: String::new(),
            kdf_rounds: DEFAULT_KDF_ROUNDS,
            max_datagram_size: DEFAULT_MAX_DATAGRAM_SIZE,
            initial_rtt_ms: DEFAULT_INITIAL_RTT_MS,
            max_ack_delay_ms: DEFAULT_MAX_ACK_DELAY_MS,
            idle_timeout_ms: DEFAULT_IDLE_TIMEOUT_MS,
        }
    }
}

impl fmt::Debug for QuicConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QuicConfig")
            .field("psk", &"<redacted>")
            .field("kdf_rounds", &self.kdf_rounds)
            .field("max_datagram_size", &self.max_datagram_size)
            .field("initial_rtt_ms", &self.initial_rtt_ms)
            .field("max_ack_delay_ms", &self.max_ack_delay_ms)
            .field("idle_timeout_ms", &self.idle_timeout_ms)
            .finish()
    }
}

impl QuicConfig {
    pub fn new(psk: impl Into<String>) -> Self {
        Self {
            psk: psk.into(),
            ..Self::default()
        }
    }

    pub fn with_kdf_rounds(mut self, rounds: u32) -> Self {
        self.kdf_rounds = rounds;
        self
    }

    pub fn with_max_datagram_size(mut self, size: usize) -> Self {
        self.max_datagram_size = size;
        self
    }

    pub fn with_initial_rtt(mut self, rtt: Duration) -> Self {
        self.initial_rtt_ms = rtt.as_millis().try_into().unwrap_or(u64::MAX);
        self
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: QuicConfig = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.psk.is_empty() {
            return Err(ConfigError::invalid("psk", "must not be empty"));
        }
        if self.kdf_rounds == 0 {
            return Err(ConfigError::invalid("kdf_rounds", "must be at least 1"));
        }
        let floor = (HEADER_LEN + MESSAGE_LEN).max(PROTECTED_OVERHEAD + 1);
        if self.max_datagram_size < floor || self.max_datagram_size > usize::from(u16::MAX) {
            return Err(ConfigError::invalid(
                "max_datagram_size",
                "must fit a handshake packet and stay within 65535 bytes",
            ));
        }
        if self.initial_rtt_ms == 0 {
            return Err(ConfigError::invalid("initial_rtt_ms", "must be at least 1"));
        }
        Ok(())
    }

    /// 单个数据包可承载的最大负载。
    pub fn max_payload(&self) -> usize {
        self.max_datagram_size.saturating_sub(PROTECTED_OVERHEAD)
    }

    pub fn initial_rtt(&self) -> Duration {
        Duration::from_millis(self.initial_rtt_ms)
    }

    pub fn max_ack_delay(&self) -> Duration {
        Duration::from_millis(self.max_ack_delay_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
}
