use core::fmt;

use crate::{
    error::ValidationError,
    status::{HandshakeStatus, Status},
};

/// 单次数据变换调用的不可变结果。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 告诉驱动器本次调用移动了多少字节、下一步该做什么（执行任务、再次 wrap/unwrap、等待 I/O）；
/// - 值语义：字段相同的两个结果可以互换，`Copy` 让驱动器随手传递而不必担心所有权。
///
/// ## 契约（What）
/// - 两个枚举字段总是存在，字节计数总是非负；
/// - 引擎内部使用不会失败的 [`EngineResult::new`]；来自外部的原始参数走
///   [`EngineResult::try_from_parts`]，逐字段校验并返回对应的 [`ValidationError`]；
/// - 构造完成后没有任何修改入口，所有访问器都是纯读取。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct EngineResult {
    status: Status,
    handshake_status: HandshakeStatus,
    bytes_consumed: usize,
    bytes_produced: usize,
}

impl EngineResult {
    pub const fn new(
        status: Status,
        handshake_status: HandshakeStatus,
        bytes_consumed: usize,
        bytes_produced: usize,
    ) -> Self {
        Self {
            status,
            handshake_status,
            bytes_consumed,
            bytes_produced,
        }
    }

    /// 从可能缺失或为负的原始参数构造结果。
    ///
    /// # 契约（What）
    /// - 校验顺序固定：状态 → 握手状态 → 消费计数 → 产出计数，首个违规字段决定返回的错误；
    /// - 非负计数还需能放进 `usize`，否则返回 `*OutOfRange`（只会在 32 位平台出现）；
    /// - 任一字段非法时不会产生任何部分构造的对象。
    pub fn try_from_parts(
        status: Option<Status>,
        handshake_status: Option<HandshakeStatus>,
        bytes_consumed: i64,
        bytes_produced: i64,
    ) -> Result<Self, ValidationError> {
        let status = status.ok_or(ValidationError::StatusMissing)?;
        let handshake_status = handshake_status.ok_or(ValidationError::HandshakeStatusMissing)?;
        if bytes_consumed < 0 {
            return Err(ValidationError::NegativeBytesConsumed(bytes_consumed));
        }
        if bytes_produced < 0 {
            return Err(ValidationError::NegativeBytesProduced(bytes_produced));
        }
        let consumed = usize::try_from(bytes_consumed)
            .map_err(|_| ValidationError::BytesConsumedOutOfRange(bytes_consumed))?;
        let produced = usize::try_from(bytes_produced)
            .map_err(|_| ValidationError::BytesProducedOutOfRange(bytes_produced))?;
        Ok(Self::new(status, handshake_status, consumed, produced))
    }

    pub const fn status(&self) -> Status {
        self.status
    }

    pub const fn handshake_status(&self) -> HandshakeStatus {
        self.handshake_status
    }

    pub const fn bytes_consumed(&self) -> usize {
        self.bytes_consumed
    }

    pub const fn bytes_produced(&self) -> usize {
        self.bytes_produced
    }

    pub fn is_ok(&self) -> bool {
        self.status == Status::Ok
    }

    pub fn is_closed(&self) -> bool {
        self.status == Status::Closed
    }

    /// 本次调用是否恰好完成了握手。
    pub fn is_finished(&self) -> bool {
        self.handshake_status == HandshakeStatus::Finished
    }

    /// 本次调用是否既未消费也未产出任何字节。
    pub fn is_idle(&self) -> bool {
        self.bytes_consumed == 0 && self.bytes_produced == 0
    }
}

impl fmt::Display for EngineResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{} consumed={} produced={}",
            self.status, self.handshake_status, self.bytes_consumed, self.bytes_produced
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_is_checked_before_other_fields() {
        let err = EngineResult::try_from_parts(None, None, -1, -1).unwrap_err();
        assert_eq!(err, ValidationError::StatusMissing);

        let err =
            EngineResult::try_from_parts(Some(Status::Ok), None, -1, -1).unwrap_err();
        assert_eq!(err, ValidationError::HandshakeStatusMissing);

        let err = EngineResult::try_from_parts(
            Some(Status::Ok),
            Some(HandshakeStatus::NeedWrap),
            -1,
            -1,
        )
        .unwrap_err();
        assert_eq!(err, ValidationError::NegativeBytesConsumed(-1));
    }

    #[test]
    fn counts_convert_without_truncation() {
        let result = EngineResult::try_from_parts(
            Some(Status::Ok),
            Some(HandshakeStatus::NotHandshaking),
            i64::from(u32::MAX),
            0,
        )
        .unwrap();
        assert_eq!(result.bytes_consumed() as u64, u64::from(u32::MAX));
    }

    #[cfg(target_pointer_width = "32")]
    #[test]
    fn counts_beyond_usize_are_rejected() {
        let big = i64::from(u32::MAX) + 1;
        let parts = (Some(Status::Ok), Some(HandshakeStatus::NotHandshaking));
        let err = EngineResult::try_from_parts(parts.0, parts.1, big, 0).unwrap_err();
        assert_eq!(err, ValidationError::BytesConsumedOutOfRange(big));
        let err = EngineResult::try_from_parts(parts.0, parts.1, 0, big).unwrap_err();
        assert_eq!(err, ValidationError::BytesProducedOutOfRange(big));
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn largest_counts_fit_on_64_bit_targets() {
        let result = EngineResult::try_from_parts(
            Some(Status::Ok),
            Some(HandshakeStatus::NotHandshaking),
            i64::MAX,
            i64::MAX,
        )
        .unwrap();
        assert_eq!(result.bytes_produced() as u64, i64::MAX as u64);
    }

    #[test]
    fn display_is_compact() {
        let result = EngineResult::new(Status::BufferUnderflow, HandshakeStatus::NeedUnwrap, 0, 0);
        assert_eq!(result.to_string(), "buffer_underflow/need_unwrap consumed=0 produced=0");
        assert!(result.is_idle());
    }
}
