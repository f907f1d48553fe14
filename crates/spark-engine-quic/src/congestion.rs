use std::{fmt, sync::Arc, time::Instant};

use tracing::{debug, trace};

use crate::metrics::{CongestionPhase, CongestionState, QuicMetrics};

/// 初始窗口下限（字节），见 RFC 9002 §7.2。
pub const INITIAL_WINDOW_FLOOR: u64 = 14_720;

/// 可替换的拥塞控制策略。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 引擎只关心“还能不能发”与四类事件（发送、确认、丢包、丢弃），窗口算法可以替换；
/// - 每个会改变窗口、阈值或在途字节的事件都必须经 [`QuicMetrics`] 的拥塞钩子报告。
///
/// ## 契约（What）
/// - `on_packet_sent` 之后在途字节增加 `bytes`；确认、丢包、丢弃各自减少对应字节，不会低于零；
/// - `on_packets_lost` 每个丢包事件调用一次，`largest_sent_at` 为本批丢失包中最晚的发送时间；
/// - 实现只在引擎所在的执行上下文中被调用，无需内部同步。
pub trait CongestionController: Send + fmt::Debug {
    fn name(&self) -> &'static str;

    fn state(&self) -> CongestionState;

    fn window(&self) -> u64;

    fn bytes_in_flight(&self) -> u64;

    fn can_send(&self, bytes: u64) -> bool {
        self.bytes_in_flight().saturating_add(bytes) <= self.window()
    }

    fn on_packet_sent(&mut self, bytes: u64, now: Instant);

    fn on_packet_acked(&mut self, bytes: u64, sent_at: Instant, now: Instant);

    fn on_packets_lost(&mut self, bytes: u64, largest_sent_at: Instant, now: Instant);

    fn on_persistent_congestion(&mut self, now: Instant);

    /// 包号空间被丢弃时，把其中仍在途的字节移出统计。
    fn on_discarded(&mut self, bytes: u64);
}

/// RFC 9002 的 NewReno 窗口律。
///
/// - 初始窗口 `min(10·mds, max(14720, 2·mds))`，最小窗口 `2·mds`；
/// - 慢启动：每确认 N 字节窗口增加 N；
/// - 拥塞避免：确认字节累计满一个窗口时窗口增加一个 `mds`；
/// - 丢包：进入恢复期，阈值与窗口减半（不低于最小窗口）；恢复期开始前发送的包再次丢失不重复减窗，
///   恢复期内确认的旧包也不增窗；
/// - 持续拥塞：窗口退回最小窗口并退出恢复期。
pub struct NewReno {
    connection: u64,
    max_datagram_size: u64,
    minimum_window: u64,
    window: u64,
    threshold: u64,
    bytes_in_flight: u64,
    recovery_start: Option<Instant>,
    recovering: bool,
    acked_credit: u64,
    metrics: Arc<QuicMetrics>,
}

impl NewReno {
    pub fn new(max_datagram_size: u64, metrics: Arc<QuicMetrics>, connection: u64) -> Self {
        let minimum_window = 2 * max_datagram_size;
        let window = (10 * max_datagram_size).min(INITIAL_WINDOW_FLOOR.max(minimum_window));
        Self {
            connection,
            max_datagram_size,
            minimum_window,
            window,
            threshold: u64::MAX,
            bytes_in_flight: 0,
            recovery_start: None,
            recovering: false,
            acked_credit: 0,
            metrics,
        }
    }

    pub fn minimum_window(&self) -> u64 {
        self.minimum_window
    }

    pub fn slow_start_threshold(&self) -> u64 {
        self.threshold
    }

    pub fn phase(&self) -> CongestionPhase {
        if self.recovering {
            CongestionPhase::Recovery
        } else if self.window < self.threshold {
            CongestionPhase::SlowStart
        } else {
            CongestionPhase::CongestionAvoidance
        }
    }

    fn sent_before_recovery(&self, sent_at: Instant) -> bool {
        self.recovery_start.is_some_and(|start| sent_at <= start)
    }

    fn set_window(&mut self, window: u64) {
        if window == self.window {
            return;
        }
        self.window = window;
        let state = self.state();
        self.metrics.congestion().on_congestion_window_changed(&state, window);
    }

    fn set_threshold(&mut self, threshold: u64) {
        if threshold == self.threshold {
            return;
        }
        self.threshold = threshold;
        let state = self.state();
        self.metrics
            .congestion()
            .on_slow_start_threshold_changed(&state, threshold);
    }
}

impl CongestionController for NewReno {
    fn name(&self) -> &'static str {
        "new_reno"
    }

    fn state(&self) -> CongestionState {
        CongestionState {
            connection: self.connection,
            congestion_window: self.window,
            slow_start_threshold: self.threshold,
            bytes_in_flight: self.bytes_in_flight,
            phase: self.phase(),
        }
    }

    fn window(&self) -> u64 {
        self.window
    }

    fn bytes_in_flight(&self) -> u64 {
        self.bytes_in_flight
    }

    fn on_packet_sent(&mut self, bytes: u64, _now: Instant) {
        self.bytes_in_flight += bytes;
        let state = self.state();
        self.metrics
            .congestion()
            .on_packet_sent(&state, self.bytes_in_flight);
    }

    fn on_packet_acked(&mut self, bytes: u64, sent_at: Instant, _now: Instant) {
        self.bytes_in_flight = self.bytes_in_flight.saturating_sub(bytes);
        let state = self.state();
        self.metrics
            .congestion()
            .on_packet_acked(&state, self.bytes_in_flight);

        if self.sent_before_recovery(sent_at) {
            return;
        }
        if self.recovering {
            self.recovering = false;
            trace!(connection = self.connection, "recovery period ended");
        }
        if self.window < self.threshold {
            self.set_window(self.window + bytes);
            return;
        }
        self.acked_credit += bytes;
        if self.acked_credit >= self.window {
            self.acked_credit -= self.window;
            self.set_window(self.window + self.max_datagram_size);
        }
    }

    fn on_packets_lost(&mut self, bytes: u64, largest_sent_at: Instant, now: Instant) {
        self.bytes_in_flight = self.bytes_in_flight.saturating_sub(bytes);
        let state = self.state();
        self.metrics
            .congestion()
            .on_packets_lost(&state, self.bytes_in_flight);

        if self.sent_before_recovery(largest_sent_at) {
            return;
        }
        self.recovery_start = Some(now);
        self.recovering = true;
        self.acked_credit = 0;
        let reduced = (self.window / 2).max(self.minimum_window);
        debug!(
            connection = self.connection,
            window = reduced,
            "congestion event, entering recovery"
        );
        self.set_threshold(reduced);
        self.set_window(reduced);
    }

    fn on_persistent_congestion(&mut self, _now: Instant) {
        self.recovery_start = None;
        self.recovering = false;
        self.acked_credit = 0;
        debug!(connection = self.connection, "persistent congestion, collapsing window");
        self.window = self.minimum_window;
        let state = self.state();
        self.metrics
            .congestion()
            .on_persistent_congestion(&state, self.minimum_window);
        self.metrics
            .congestion()
            .on_congestion_window_changed(&state, self.minimum_window);
    }

    fn on_discarded(&mut self, bytes: u64) {
        self.bytes_in_flight = self.bytes_in_flight.saturating_sub(bytes);
        let state = self.state();
        self.metrics
            .congestion()
            .on_in_flight_discarded(&state, self.bytes_in_flight);
    }
}

impl fmt::Debug for NewReno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NewReno")
            .field("connection", &self.connection)
            .field("window", &self.window)
            .field("threshold", &self.threshold)
            .field("bytes_in_flight", &self.bytes_in_flight)
            .field("phase", &self.phase())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tracing_test::traced_test;

    use super::*;
    use crate::metrics::{CongestionEventKind, RecordingCongestionMetrics};

    const MDS: u64 = 1200;

    fn controller() -> (NewReno, Arc<RecordingCongestionMetrics>) {
        let recorder = Arc::new(RecordingCongestionMetrics::new());
        let metrics = QuicMetrics::builder().congestion(recorder.clone()).build();
        (NewReno::new(MDS, metrics, 1), recorder)
    }

    #[test]
    fn initial_window_follows_the_window_law() {
        let (cc, _) = controller();
        assert_eq!(cc.window(), 12_000);
        assert_eq!(cc.minimum_window(), 2_400);
        assert_eq!(cc.slow_start_threshold(), u64::MAX);
        assert_eq!(cc.phase(), CongestionPhase::SlowStart);

        let jumbo = NewReno::new(9000, QuicMetrics::shared_default(), 2);
        assert_eq!(jumbo.window(), 18_000);
    }

    #[test]
    fn sent_and_acked_report_in_flight() {
        let (mut cc, recorder) = controller();
        let t0 = Instant::now();
        cc.on_packet_sent(1200, t0);
        cc.on_packet_sent(1200, t0);
        assert!(cc.can_send(9_600));
        assert!(!cc.can_send(9_601));
        cc.on_packet_acked(1200, t0, t0 + Duration::from_millis(10));

        let sent = recorder.last(CongestionEventKind::Sent).unwrap();
        assert_eq!(sent.value, 2400);
        let acked = recorder.last(CongestionEventKind::Acked).unwrap();
        assert_eq!(acked.value, 1200);
        assert_eq!(acked.state.connection, 1);
        let window = recorder.last(CongestionEventKind::WindowChanged).unwrap();
        assert_eq!(window.value, 13_200);
        assert_eq!(cc.window(), 13_200);
    }

    #[test]
    fn loss_halves_once_per_recovery_period() {
        let (mut cc, recorder) = controller();
        let t0 = Instant::now();
        for _ in 0..4 {
            cc.on_packet_sent(1200, t0);
        }
        let loss_at = t0 + Duration::from_millis(50);
        cc.on_packets_lost(1200, t0, loss_at);
        assert_eq!(cc.window(), 6_000);
        assert_eq!(cc.slow_start_threshold(), 6_000);
        assert_eq!(cc.phase(), CongestionPhase::Recovery);
        assert_eq!(recorder.last(CongestionEventKind::ThresholdChanged).unwrap().value, 6_000);

        // 恢复期开始前发出的包再次丢失或被确认，都不改变窗口。
        cc.on_packets_lost(1200, t0, loss_at + Duration::from_millis(1));
        cc.on_packet_acked(1200, t0, loss_at + Duration::from_millis(2));
        assert_eq!(cc.window(), 6_000);
        assert_eq!(recorder.count(CongestionEventKind::ThresholdChanged), 1);
        assert_eq!(cc.bytes_in_flight(), 1200);

        // 恢复期开始后发出的包被确认：退出恢复期，进入拥塞避免。
        let later = loss_at + Duration::from_millis(5);
        cc.on_packet_sent(1200, later);
        cc.on_packet_acked(1200, later, later + Duration::from_millis(20));
        assert_eq!(cc.phase(), CongestionPhase::CongestionAvoidance);
        assert_eq!(cc.window(), 6_000);
    }

    #[test]
    fn congestion_avoidance_grows_one_datagram_per_window() {
        let (mut cc, _) = controller();
        let t0 = Instant::now();
        cc.on_packet_sent(1200, t0);
        cc.on_packets_lost(1200, t0, t0);
        assert_eq!(cc.window(), 6_000);
        let t1 = t0 + Duration::from_millis(1);
        for _ in 0..5 {
            cc.on_packet_sent(1200, t1);
        }
        for step in 0..5 {
            cc.on_packet_acked(1200, t1, t1 + Duration::from_millis(10));
            let expected = if step < 4 { 6_000 } else { 7_200 };
            assert_eq!(cc.window(), expected);
        }
    }

    #[test]
    #[traced_test]
    fn persistent_congestion_collapses_to_minimum() {
        let (mut cc, recorder) = controller();
        let t0 = Instant::now();
        cc.on_packet_sent(1200, t0);
        cc.on_packets_lost(1200, t0, t0 + Duration::from_millis(5));
        cc.on_persistent_congestion(t0 + Duration::from_millis(5));
        assert_eq!(cc.window(), 2_400);
        assert_ne!(cc.phase(), CongestionPhase::Recovery);
        let event = recorder.last(CongestionEventKind::PersistentCongestion).unwrap();
        assert_eq!(event.value, 2_400);
        assert_eq!(event.state.congestion_window, 2_400);
        assert!(logs_contain("persistent congestion, collapsing window"));
    }

    #[test]
    fn discard_removes_in_flight_and_reports() {
        let (mut cc, recorder) = controller();
        let t0 = Instant::now();
        cc.on_packet_sent(59, t0);
        cc.on_packet_sent(59, t0);
        cc.on_discarded(118);
        assert_eq!(cc.bytes_in_flight(), 0);
        assert_eq!(recorder.last(CongestionEventKind::Discarded).unwrap().value, 0);
        cc.on_discarded(10);
        assert_eq!(cc.bytes_in_flight(), 0);
    }
}
