use std::time::Duration;

/// 计时粒度：丢包与 PTO 计算中的最小时间量。
pub const GRANULARITY: Duration = Duration::from_millis(1);

/// 往返时延估计器。
///
/// # 教案级注释
///
/// ## 契约（What）
/// - 首个样本直接作为 `smoothed`，`rttvar` 取其一半；
/// - 之后按 `rttvar = 3/4·rttvar + 1/4·|smoothed - adjusted|`、`smoothed = 7/8·smoothed + 1/8·adjusted` 更新，
///   其中 `adjusted` 在握手完成后扣除不超过 `max_ack_delay` 的确认延迟，且不低于 `min_rtt`；
/// - 没有样本时以配置的初始 RTT 作为 `smoothed`，`rttvar = initial / 2`。
///
/// ## 风险（Trade-offs）
/// - 仅在最大新确认包是 ack-eliciting 时采样，调用方负责筛选。
#[derive(Clone, Copy, Debug)]
pub struct RttEstimator {
    latest: Duration,
    smoothed: Duration,
    variance: Duration,
    min: Duration,
    has_sample: bool,
    max_ack_delay: Duration,
}

impl RttEstimator {
    pub fn new(initial: Duration, max_ack_delay: Duration) -> Self {
        Self {
            latest: initial,
            smoothed: initial,
            variance: initial / 2,
            min: initial,
            has_sample: false,
            max_ack_delay,
        }
    }

    pub fn update(&mut self, sample: Duration, ack_delay: Duration, handshake_confirmed: bool) {
        self.latest = sample;
        if !self.has_sample {
            self.has_sample = true;
            self.min = sample;
            self.smoothed = sample;
            self.variance = sample / 2;
            return;
        }
        self.min = self.min.min(sample);
        let ack_delay = if handshake_confirmed {
            ack_delay.min(self.max_ack_delay)
        } else {
            ack_delay
        };
        let adjusted = if sample >= self.min + ack_delay {
            sample - ack_delay
        } else {
            sample
        };
        let deviation = self.smoothed.abs_diff(adjusted);
        self.variance = (self.variance * 3 + deviation) / 4;
        self.smoothed = (self.smoothed * 7 + adjusted) / 8;
    }

    pub fn has_sample(&self) -> bool {
        self.has_sample
    }

    pub fn latest(&self) -> Duration {
        self.latest
    }

    pub fn smoothed(&self) -> Duration {
        self.smoothed
    }

    pub fn variance(&self) -> Duration {
        self.variance
    }

    pub fn min(&self) -> Duration {
        self.min
    }

    pub fn max_ack_delay(&self) -> Duration {
        self.max_ack_delay
    }

    /// 时间阈值丢包判定的等待时长：`max(9/8 · max(smoothed, latest), 1ms)`。
    pub fn loss_delay(&self) -> Duration {
        let base = self.smoothed.max(self.latest);
        (base * 9 / 8).max(GRANULARITY)
    }

    /// 探测超时：`smoothed + max(4·rttvar, 1ms) + max_ack_delay`。
    pub fn pto(&self) -> Duration {
        self.smoothed + (self.variance * 4).max(GRANULARITY) + self.max_ack_delay
    }

    /// 判定持续拥塞所需的最短跨度：三个 PTO。
    pub fn persistent_congestion_threshold(&self) -> Duration {
        self.pto() * 3
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(value: u64) -> Duration {
        Duration::from_millis(value)
    }

    #[test]
    fn first_sample_seeds_estimate() {
        let mut rtt = RttEstimator::new(ms(333), ms(25));
        assert!(!rtt.has_sample());
        assert_eq!(rtt.smoothed(), ms(333));
        rtt.update(ms(100), Duration::ZERO, false);
        assert_eq!(rtt.smoothed(), ms(100));
        assert_eq!(rtt.variance(), ms(50));
        assert_eq!(rtt.min(), ms(100));
    }

    #[test]
    fn later_samples_are_smoothed() {
        let mut rtt = RttEstimator::new(ms(333), ms(25));
        rtt.update(ms(100), Duration::ZERO, false);
        rtt.update(ms(180), Duration::ZERO, true);
        // smoothed = (7·100 + 180) / 8 = 110; rttvar = (3·50 + 80) / 4 = 57.5
        assert_eq!(rtt.smoothed(), ms(110));
        assert_eq!(rtt.variance(), Duration::from_micros(57_500));
        assert_eq!(rtt.latest(), ms(180));
    }

    #[test]
    fn ack_delay_is_capped_after_confirmation() {
        let mut rtt = RttEstimator::new(ms(333), ms(25));
        rtt.update(ms(100), Duration::ZERO, true);
        rtt.update(ms(200), ms(80), true);
        // adjusted = 200 - min(80, 25) = 175
        assert_eq!(rtt.smoothed(), Duration::from_micros(109_375));
    }

    #[test]
    fn derived_timeouts() {
        let mut rtt = RttEstimator::new(ms(333), ms(25));
        rtt.update(ms(80), Duration::ZERO, false);
        assert_eq!(rtt.loss_delay(), ms(90));
        assert_eq!(rtt.pto(), ms(80 + 160 + 25));
        assert_eq!(rtt.persistent_congestion_threshold(), ms(3 * 265));

        let mut tiny = RttEstimator::new(ms(333), Duration::ZERO);
        tiny.update(Duration::from_micros(100), Duration::ZERO, false);
        assert_eq!(tiny.loss_delay(), GRANULARITY);
    }
}
