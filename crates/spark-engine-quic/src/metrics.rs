//! 拥塞度量钩子与 QUIC 度量包。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 拥塞控制器在七个事件点（窗口变化、慢启动阈值变化、持续拥塞、发送、确认、丢包、丢弃在途统计）
//!   对外报告状态，运维侧据此绘制拥塞曲线，而控制器本身不依赖任何度量后端；
//! - 度量组件在引擎构造时经 [`QuicMetrics`] 注入；未配置时全进程共享同一个默认度量包。
//!
//! ## 契约（What）
//! - 钩子只观察、不修改：回调拿到的是 [`CongestionState`] 的只读快照，且在驱动控制器的同一执行上下文中
//!   同步调用，不得回调引擎；
//! - 钩子不返回错误；实现方内部失败属于调用方缺陷；
//! - [`QuicMetricsBuilder::build`] 在未配置任何组件时返回 [`QuicMetrics::shared_default`] 的同一实例；
//!   配置过组件时返回全新且不可变的度量包，之后再修改构建器不影响已构建的度量包。

use std::{
    fmt,
    sync::{Arc, OnceLock},
};

use parking_lot::Mutex;

/// 拥塞控制所处阶段。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CongestionPhase {
    SlowStart,
    CongestionAvoidance,
    Recovery,
}

impl CongestionPhase {
    pub const fn as_str(self) -> &'static str {
        match self {
            CongestionPhase::SlowStart => "slow_start",
            CongestionPhase::CongestionAvoidance => "congestion_avoidance",
            CongestionPhase::Recovery => "recovery",
        }
    }
}

impl fmt::Display for CongestionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 事件发生时控制器状态的只读快照。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CongestionState {
    /// 连接标签，同一进程内唯一。
    pub connection: u64,
    pub congestion_window: u64,
    pub slow_start_threshold: u64,
    pub bytes_in_flight: u64,
    pub phase: CongestionPhase,
}

/// 拥塞度量钩子。
///
/// 七个回调都有空的默认实现，度量后端只需覆盖关心的事件。第二个参数是事件的新值：
/// 窗口/阈值类事件为新的窗口或阈值，持续拥塞为收缩后的窗口，其余为新的在途字节数。
pub trait CongestionMetrics: Send + Sync + 'static {
    fn on_congestion_window_changed(&self, _state: &CongestionState, _window: u64) {}

    fn on_slow_start_threshold_changed(&self, _state: &CongestionState, _threshold: u64) {}

    fn on_persistent_congestion(&self, _state: &CongestionState, _window: u64) {}

    fn on_packet_sent(&self, _state: &CongestionState, _bytes_in_flight: u64) {}

    fn on_packet_acked(&self, _state: &CongestionState, _bytes_in_flight: u64) {}

    fn on_packets_lost(&self, _state: &CongestionState, _bytes_in_flight: u64) {}

    fn on_in_flight_discarded(&self, _state: &CongestionState, _bytes_in_flight: u64) {}
}

/// 不做任何事的度量组件，默认度量包使用它。
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopCongestionMetrics;

impl CongestionMetrics for NoopCongestionMetrics {}

/// 钩子事件类别。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CongestionEventKind {
    WindowChanged,
    ThresholdChanged,
    PersistentCongestion,
    Sent,
    Acked,
    Lost,
    Discarded,
}

/// 一次钩子回调的记录。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CongestionEvent {
    pub kind: CongestionEventKind,
    pub state: CongestionState,
    pub value: u64,
}

/// 把所有回调按顺序记录下来的测试桩。
#[derive(Debug, Default)]
pub struct RecordingCongestionMetrics {
    events: Mutex<Vec<CongestionEvent>>,
}

impl RecordingCongestionMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// 迄今记录的全部事件副本。
    pub fn events(&self) -> Vec<CongestionEvent> {
        self.events.lock().clone()
    }

    pub fn count(&self, kind: CongestionEventKind) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|event| event.kind == kind)
            .count()
    }

    pub fn last(&self, kind: CongestionEventKind) -> Option<CongestionEvent> {
        self.events
            .lock()
            .iter()
            .rev()
            .find(|event| event.kind == kind)
            .copied()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }

    fn record(&self, kind: CongestionEventKind, state: &CongestionState, value: u64) {
        self.events.lock().push(CongestionEvent {
            kind,
            state: *state,
            value,
        });
    }
}

impl CongestionMetrics for RecordingCongestionMetrics {
    fn on_congestion_window_changed(&self, state: &CongestionState, window: u64) {
        self.record(CongestionEventKind::WindowChanged, state, window);
    }

    fn on_slow_start_threshold_changed(&self, state: &CongestionState, threshold: u64) {
        self.record(CongestionEventKind::ThresholdChanged, state, threshold);
    }

    fn on_persistent_congestion(&self, state: &CongestionState, window: u64) {
        self.record(CongestionEventKind::PersistentCongestion, state, window);
    }

    fn on_packet_sent(&self, state: &CongestionState, bytes_in_flight: u64) {
        self.record(CongestionEventKind::Sent, state, bytes_in_flight);
    }

    fn on_packet_acked(&self, state: &CongestionState, bytes_in_flight: u64) {
        self.record(CongestionEventKind::Acked, state, bytes_in_flight);
    }

    fn on_packets_lost(&self, state: &CongestionState, bytes_in_flight: u64) {
        self.record(CongestionEventKind::Lost, state, bytes_in_flight);
    }

    fn on_in_flight_discarded(&self, state: &CongestionState, bytes_in_flight: u64) {
        self.record(CongestionEventKind::Discarded, state, bytes_in_flight);
    }
}

/// QUIC 引擎使用的度量组件集合。
///
/// 构造后不可变；引擎在构造时取得一份 `Arc<QuicMetrics>` 并在整个生命周期内使用。
#[derive(Clone)]
pub struct QuicMetrics {
    congestion: Arc<dyn CongestionMetrics>,
}

static SHARED_DEFAULT: OnceLock<Arc<QuicMetrics>> = OnceLock::new();

impl QuicMetrics {
    pub fn builder() -> QuicMetricsBuilder {
        QuicMetricsBuilder::default()
    }

    /// 全进程共享的默认度量包；首次访问时惰性构造，之后每次返回同一实例。
    pub fn shared_default() -> Arc<QuicMetrics> {
        SHARED_DEFAULT
            .get_or_init(|| {
                Arc::new(QuicMetrics {
                    congestion: Arc::new(NoopCongestionMetrics),
                })
            })
            .clone()
    }

    pub fn congestion(&self) -> &Arc<dyn CongestionMetrics> {
        &self.congestion
    }

    /// 是否就是共享默认度量包本身。
    pub fn is_default(&self) -> bool {
        SHARED_DEFAULT
            .get()
            .is_some_and(|shared| std::ptr::eq(Arc::as_ptr(shared), self))
    }
}

impl fmt::Debug for QuicMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QuicMetrics")
            .field("default", &self.is_default())
            .finish_non_exhaustive()
    }
}

/// [`QuicMetrics`] 构建器。
#[derive(Clone, Default)]
pub struct QuicMetricsBuilder {
    congestion: Option<Arc<dyn CongestionMetrics>>,
}

impl QuicMetricsBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注入拥塞度量组件；重复调用以最后一次为准。
    pub fn congestion(&mut self, metrics: Arc<dyn CongestionMetrics>) -> &mut Self {
        self.congestion = Some(metrics);
        self
    }

    pub fn is_configured(&self) -> bool {
        self.congestion.is_some()
    }

    pub fn build(&self) -> Arc<QuicMetrics> {
        match &self.congestion {
            None => QuicMetrics::shared_default(),
            Some(congestion) => Arc::new(QuicMetrics {
                congestion: Arc::clone(congestion),
            }),
        }
    }
}

impl fmt::Debug for QuicMetricsBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QuicMetricsBuilder")
            .field("congestion", &self.congestion.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> CongestionState {
        CongestionState {
            connection: 7,
            congestion_window: 12_000,
            slow_start_threshold: u64::MAX,
            bytes_in_flight: 0,
            phase: CongestionPhase::SlowStart,
        }
    }

    #[test]
    fn noop_hook_accepts_every_event() {
        let hook = NoopCongestionMetrics;
        let state = state();
        hook.on_congestion_window_changed(&state, 1);
        hook.on_slow_start_threshold_changed(&state, 1);
        hook.on_persistent_congestion(&state, 1);
        hook.on_packet_sent(&state, 1);
        hook.on_packet_acked(&state, 1);
        hook.on_packets_lost(&state, 1);
        hook.on_in_flight_discarded(&state, 1);
    }

    #[test]
    fn recording_hook_keeps_order() {
        let hook = RecordingCongestionMetrics::new();
        let state = state();
        hook.on_packet_sent(&state, 1200);
        hook.on_packet_acked(&state, 0);
        hook.on_packet_sent(&state, 1200);
        assert_eq!(hook.count(CongestionEventKind::Sent), 2);
        let kinds: Vec<_> = hook.events().iter().map(|event| event.kind).collect();
        assert_eq!(
            kinds,
            [
                CongestionEventKind::Sent,
                CongestionEventKind::Acked,
                CongestionEventKind::Sent
            ]
        );
        assert_eq!(hook.last(CongestionEventKind::Acked).unwrap().value, 0);
        hook.clear();
        assert!(hook.events().is_empty());
    }

    #[test]
    fn default_bundle_knows_it_is_default() {
        let shared = QuicMetrics::shared_default();
        assert!(shared.is_default());
        let custom = QuicMetrics::builder()
            .congestion(Arc::new(NoopCongestionMetrics))
            .build();
        assert!(!custom.is_default());
    }
}
