use core::fmt;
use std::time::{Duration, Instant};

/// 会话调度器投递给引擎的定时事件标识。
///
/// `timer(key, value)` 的两个参数都是可选的：通用定时器接线未必总能给出类型化载荷，
/// 引擎对缺失参数必须给出确定的默认行为（通常是什么都不做），而不能报错。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TimerKey {
    /// 握手消息重传。
    Retransmit,
    /// 基于时间阈值的丢包检测。
    LossDetection,
    /// 延迟确认到期，应立即发送 ACK。
    AckDelay,
    /// 空闲超时，引擎应开始优雅关闭。
    IdleTimeout,
    /// 握手整体超时。
    HandshakeTimeout,
    /// 具体引擎自定义的定时器。
    Custom(&'static str),
}

impl TimerKey {
    pub const fn as_str(&self) -> &'static str {
        match self {
            TimerKey::Retransmit => "retransmit",
            TimerKey::LossDetection => "loss_detection",
            TimerKey::AckDelay => "ack_delay",
            TimerKey::IdleTimeout => "idle_timeout",
            TimerKey::HandshakeTimeout => "handshake_timeout",
            TimerKey::Custom(name) => name,
        }
    }
}

impl fmt::Display for TimerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 定时事件附带的载荷。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TimerValue {
    /// 事件对应的绝对截止时间。
    Deadline(Instant),
    /// 自调度以来经过的时长。
    Elapsed(Duration),
    /// 调度代次，引擎可据此丢弃过期的定时器。
    Generation(u64),
}

impl TimerValue {
    /// 若载荷是截止时间则返回之。
    pub fn deadline(&self) -> Option<Instant> {
        match self {
            TimerValue::Deadline(at) => Some(*at),
            _ => None,
        }
    }
}
