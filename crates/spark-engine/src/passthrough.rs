use tracing::trace;

use crate::{
    engine::{Engine, gather},
    error::EngineError,
    lifecycle::Lifecycle,
    result::EngineResult,
    sizing::BufferSizing,
    status::{HandshakeStatus, Status},
    task::DelegatedTask,
    timer::{TimerKey, TimerValue},
};

/// 单次变换默认处理的字节上限。
pub const DEFAULT_CHUNK_SIZE: usize = 16 * 1024;

/// 明文直通引擎。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 为不需要加密的传输（本地回环、已在外层加密的隧道）提供与其它引擎一致的接口，
///   会话层无需为“无引擎”单独开分支；
/// - 同时作为驱动器自身的最小测试替身。
///
/// ## 契约（What）
/// - 没有握手：`handshake_status` 恒为 `NotHandshaking`，`begin_handshake` 直接接受；
/// - 协议单元为单个字节，每次最多搬运 `chunk_size` 字节；
/// - 仅当目标缓冲区零容量时返回 `BufferOverflow`；`unwrap` 的源为空时返回 `BufferUnderflow`；
/// - `close_outbound` 之后 `wrap` 返回 `Closed`；`close_inbound` 总是成功，明文流没有关闭通知可校验。
#[derive(Debug)]
pub struct PassthroughEngine {
    lifecycle: Lifecycle,
    chunk_size: usize,
    outbound_done: bool,
    inbound_done: bool,
}

impl Default for PassthroughEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl PassthroughEngine {
    pub fn new() -> Self {
        Self::with_chunk_size(DEFAULT_CHUNK_SIZE)
    }

    pub fn with_chunk_size(chunk_size: usize) -> Self {
        Self {
            lifecycle: Lifecycle::new(),
            chunk_size: chunk_size.max(1),
            outbound_done: false,
            inbound_done: false,
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    fn status(&self) -> HandshakeStatus {
        HandshakeStatus::NotHandshaking
    }
}

impl Engine for PassthroughEngine {
    fn protocol(&self) -> &'static str {
        "passthrough"
    }

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
        if self.outbound_done {
            return Ok(EngineResult::new(Status::Closed, self.status(), 0, 0));
        }
        let pending = crate::engine::total_len(sources);
        if pending == 0 {
            return Ok(EngineResult::new(Status::Ok, self.status(), 0, 0));
        }
        let room = destination.len().min(self.chunk_size);
        if room == 0 {
            return Ok(EngineResult::new(Status::BufferOverflow, self.status(), 0, 0));
        }
        let moved = gather(sources, &mut destination[..room]);
        trace!(moved, pending, "passthrough wrap");
        Ok(EngineResult::new(Status::Ok, self.status(), moved, moved))
    }

    fn unwrap(
        &mut self,
        source: &[u8],
        destination: &mut [u8],
    ) -> Result<EngineResult, EngineError> {
        self.lifecycle.ensure_active("unwrap")?;
        if self.inbound_done {
            return Ok(EngineResult::new(Status::Closed, self.status(), 0, 0));
        }
        if source.is_empty() {
            return Ok(EngineResult::new(Status::BufferUnderflow, self.status(), 0, 0));
        }
        let moved = source.len().min(destination.len()).min(self.chunk_size);
        if moved == 0 {
            return Ok(EngineResult::new(Status::BufferOverflow, self.status(), 0, 0));
        }
        destination[..moved].copy_from_slice(&source[..moved]);
        trace!(moved, "passthrough unwrap");
        Ok(EngineResult::new(Status::Ok, self.status(), moved, moved))
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
        self.outbound_done = true;
        Ok(())
    }

    fn close_inbound(&mut self) -> Result<(), EngineError> {
        self.lifecycle.ensure_active("close_inbound")?;
        self.inbound_done = true;
        Ok(())
    }

    fn buffer_sizing(&self) -> BufferSizing {
        BufferSizing::new(
            self.chunk_size,
            self.chunk_size.saturating_mul(4),
            self.chunk_size,
            self.chunk_size.saturating_mul(4),
        )
    }

    fn timer(
        &mut self,
        key: Option<TimerKey>,
        _value: Option<TimerValue>,
    ) -> Result<(), EngineError> {
        match key {
            Some(TimerKey::IdleTimeout) => self.close_outbound(),
            _ => Ok(()),
        }
    }

    fn cleanup(&mut self) {
        self.lifecycle.retire();
        self.outbound_done = true;
        self.inbound_done = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorKind, codes};

    fn active(chunk: usize) -> PassthroughEngine {
        let mut engine = PassthroughEngine::with_chunk_size(chunk);
        engine.init().unwrap();
        engine
    }

    #[test]
    fn wrap_is_bounded_by_chunk_and_destination() {
        let mut engine = active(4);
        let mut out = [0_u8; 8];
        let result = engine.wrap_vectored(&[&b"ab"[..], &b"cdef"[..]], &mut out).unwrap();
        assert_eq!(result.bytes_consumed(), 4);
        assert_eq!(&out[..4], b"abcd");

        let result = engine.wrap(b"xyz", &mut []).unwrap();
        assert_eq!(result.status(), Status::BufferOverflow);
        assert_eq!(result.bytes_consumed(), 0);
    }

    #[test]
    fn unwrap_reports_underflow_on_empty_source() {
        let mut engine = active(16);
        let mut out = [0_u8; 4];
        let result = engine.unwrap(&[], &mut out).unwrap();
        assert_eq!(result.status(), Status::BufferUnderflow);
        assert!(result.is_idle());
    }

    #[test]
    fn closes_and_rejects_after_cleanup() {
        let mut engine = active(16);
        engine.timer(None, None).unwrap();
        engine.timer(Some(TimerKey::IdleTimeout), None).unwrap();
        assert!(engine.is_outbound_done());
        let result = engine.wrap(b"late", &mut [0_u8; 8]).unwrap();
        assert!(result.is_closed());

        engine.close_inbound().unwrap();
        assert!(engine.is_closed());

        engine.cleanup();
        let err = engine.wrap(b"x", &mut [0_u8; 8]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IllegalState);
        assert_eq!(err.code(), codes::ILLEGAL_AFTER_CLEANUP);
    }

    #[test]
    fn sizing_saturates_for_huge_chunks() {
        let engine = PassthroughEngine::with_chunk_size(usize::MAX);
        let sizing = engine.buffer_sizing();
        assert_eq!(sizing.min_application(), usize::MAX);
        assert_eq!(sizing.max_application(), usize::MAX);
        assert_eq!(sizing.max_network(), usize::MAX);
        assert_eq!(active(8).buffer_sizing().max_network(), 32);
    }

    #[test]
    fn rejects_use_before_init() {
        let mut engine = PassthroughEngine::new();
        let err = engine.unwrap(b"x", &mut [0_u8; 1]).unwrap_err();
        assert_eq!(err.code(), codes::ILLEGAL_BEFORE_INIT);
    }
}
