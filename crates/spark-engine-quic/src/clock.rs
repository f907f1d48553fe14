//! 可注入时钟。
//!
//! - **意图 (Why)**：丢包检测、RTT 采样与定时器截止时间都依赖“现在”；直接读系统时钟会让测试无法复现，
//!   因此引擎经 `Arc<dyn Clock>` 取时间；
//! - **契约 (What)**：`now` 单调不减；[`ManualClock`] 的克隆共享同一条时间线，推进任一克隆对全部可见。

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use parking_lot::Mutex;

pub trait Clock: Send + Sync + 'static {
    /// 当前的单调时间点。
    fn now(&self) -> Instant;
}

/// 直接委托 [`Instant::now`] 的系统时钟。
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// 只在显式推进时前进的手动时钟。
#[derive(Clone, Debug)]
pub struct ManualClock {
    origin: Instant,
    offset: Arc<Mutex<Duration>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::with_start(Instant::now())
    }

    pub fn with_start(origin: Instant) -> Self {
        Self {
            origin,
            offset: Arc::new(Mutex::new(Duration::ZERO)),
        }
    }

    pub fn advance(&self, delta: Duration) {
        let mut offset = self.offset.lock();
        *offset = offset.saturating_add(delta);
    }

    /// 自创建以来推进的总时长。
    pub fn elapsed(&self) -> Duration {
        *self.offset.lock()
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + *self.offset.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_one_timeline() {
        let clock = ManualClock::new();
        let start = clock.now();
        let other = clock.clone();
        other.advance(Duration::from_millis(40));
        assert_eq!(clock.now() - start, Duration::from_millis(40));
        assert_eq!(clock.elapsed(), Duration::from_millis(40));
    }
}
