//! 已发送包登记与丢包检测。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 拥塞控制器只处理字节数与时间点；哪些包被确认、哪些包算丢失，由本模块按包号空间登记后判定；
//! - 握手空间与应用空间分开登记，握手完成后整个握手空间可以一次丢弃。
//!
//! ## 契约（What）
//! - 包号阈值：比最大已确认包号小 [`PACKET_THRESHOLD`] 及以上的未确认包判定为丢失；
//! - 时间阈值：发送时间早于 `now - loss_delay` 且包号不大于最大已确认包号的未确认包判定为丢失；
//!   尚未满足的包中最早的判定时间作为该空间的丢包定时器截止时间；
//! - 持续拥塞：同一批丢失中，包号连续的一段里首尾两个 ack-eliciting 包的发送间隔超过阈值，
//!   且两者都在首个 RTT 样本之后发送。

use std::{
    collections::BTreeMap,
    time::{Duration, Instant},
};

pub const PACKET_THRESHOLD: u64 = 3;

/// 包号空间。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PacketSpace {
    Handshake,
    Application,
}

impl PacketSpace {
    pub const ALL: [PacketSpace; 2] = [PacketSpace::Handshake, PacketSpace::Application];

    pub const fn index(self) -> usize {
        match self {
            PacketSpace::Handshake => 0,
            PacketSpace::Application => 1,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            PacketSpace::Handshake => "handshake",
            PacketSpace::Application => "application",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SentPacket {
    pub number: u64,
    pub sent_at: Instant,
    pub size: u64,
    pub ack_eliciting: bool,
    /// 是否计入拥塞控制的在途字节。
    pub in_flight: bool,
}

/// 一次确认处理的结果。
#[derive(Debug, Default)]
pub struct AckOutcome {
    pub newly_acked: Vec<SentPacket>,
}

impl AckOutcome {
    pub fn is_empty(&self) -> bool {
        self.newly_acked.is_empty()
    }

    /// 新确认包中包号最大者。
    pub fn largest(&self) -> Option<&SentPacket> {
        self.newly_acked.iter().max_by_key(|packet| packet.number)
    }
}

/// 一次丢包检测的结果。
#[derive(Debug, Default)]
pub struct LossOutcome {
    /// 按包号升序排列。
    pub lost: Vec<SentPacket>,
}

impl LossOutcome {
    pub fn is_empty(&self) -> bool {
        self.lost.is_empty()
    }

    /// 丢失包中计入在途统计的字节数。
    pub fn lost_bytes(&self) -> u64 {
        self.lost
            .iter()
            .filter(|packet| packet.in_flight)
            .map(|packet| packet.size)
            .sum()
    }

    /// 计入在途统计的丢失包中最晚的发送时间。
    pub fn largest_sent_at(&self) -> Option<Instant> {
        self.lost
            .iter()
            .filter(|packet| packet.in_flight)
            .map(|packet| packet.sent_at)
            .max()
    }
}

#[derive(Debug, Default)]
struct Ledger {
    sent: BTreeMap<u64, SentPacket>,
    largest_acked: Option<u64>,
    loss_time: Option<Instant>,
}

#[derive(Debug, Default)]
pub struct SentPacketTracker {
    spaces: [Ledger; 2],
}

impl SentPacketTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn ledger(&self, space: PacketSpace) -> &Ledger {
        &self.spaces[space.index()]
    }

    fn ledger_mut(&mut self, space: PacketSpace) -> &mut Ledger {
        &mut self.spaces[space.index()]
    }

    pub fn on_sent(&mut self, space: PacketSpace, packet: SentPacket) {
        self.ledger_mut(space).sent.insert(packet.number, packet);
    }

    /// 登记对端确认的包号；未登记或已处理过的包号被忽略。
    pub fn on_ack<I>(&mut self, space: PacketSpace, acked: I) -> AckOutcome
    where
        I: IntoIterator<Item = u64>,
    {
        let ledger = self.ledger_mut(space);
        let mut outcome = AckOutcome::default();
        for number in acked {
            if let Some(packet) = ledger.sent.remove(&number) {
                outcome.newly_acked.push(packet);
            }
        }
        if let Some(largest) = outcome.largest().map(|packet| packet.number) {
            ledger.largest_acked = Some(ledger.largest_acked.map_or(largest, |known| known.max(largest)));
        }
        outcome
    }

    pub fn largest_acked(&self, space: PacketSpace) -> Option<u64> {
        self.ledger(space).largest_acked
    }

    pub fn detect_losses(&mut self, space: PacketSpace, now: Instant, loss_delay: Duration) -> LossOutcome {
        let ledger = self.ledger_mut(space);
        ledger.loss_time = None;
        let Some(largest_acked) = ledger.largest_acked else {
            return LossOutcome::default();
        };
        let lost_send_time = now.checked_sub(loss_delay);
        let mut lost_numbers = Vec::new();
        let mut loss_time: Option<Instant> = None;
        for (number, packet) in ledger.sent.range(..=largest_acked) {
            let by_number = number + PACKET_THRESHOLD <= largest_acked;
            let by_time = lost_send_time.is_some_and(|limit| packet.sent_at <= limit);
            if by_number || by_time {
                lost_numbers.push(*number);
            } else {
                let deadline = packet.sent_at + loss_delay;
                loss_time = Some(loss_time.map_or(deadline, |current| current.min(deadline)));
            }
        }
        ledger.loss_time = loss_time;
        let lost = lost_numbers
            .into_iter()
            .filter_map(|number| ledger.sent.remove(&number))
            .collect();
        LossOutcome { lost }
    }

    pub fn loss_time(&self, space: PacketSpace) -> Option<Instant> {
        self.ledger(space).loss_time
    }

    /// 所有空间中最早的丢包定时器截止时间。
    pub fn earliest_loss_time(&self) -> Option<(PacketSpace, Instant)> {
        PacketSpace::ALL
            .into_iter()
            .filter_map(|space| self.loss_time(space).map(|at| (space, at)))
            .min_by_key(|(_, at)| *at)
    }

    pub fn last_ack_eliciting_sent(&self, space: PacketSpace) -> Option<Instant> {
        self.ledger(space)
            .sent
            .values()
            .filter(|packet| packet.ack_eliciting)
            .map(|packet| packet.sent_at)
            .max()
    }

    pub fn in_flight_bytes(&self, space: PacketSpace) -> u64 {
        self.ledger(space)
            .sent
            .values()
            .filter(|packet| packet.in_flight)
            .map(|packet| packet.size)
            .sum()
    }

    pub fn outstanding(&self, space: PacketSpace) -> usize {
        self.ledger(space).sent.len()
    }

    /// 丢弃整个空间的登记，返回其中仍计入在途统计的字节数。
    pub fn discard_space(&mut self, space: PacketSpace) -> u64 {
        let bytes = self.in_flight_bytes(space);
        let ledger = self.ledger_mut(space);
        ledger.sent.clear();
        ledger.loss_time = None;
        bytes
    }
}

/// 判定一批丢失包是否构成持续拥塞。
pub fn is_persistent_congestion(
    lost: &[SentPacket],
    threshold: Duration,
    first_rtt_sample: Option<Instant>,
) -> bool {
    let Some(sample) = first_rtt_sample else {
        return false;
    };
    let mut run_start: Option<Instant> = None;
    let mut previous: Option<u64> = None;
    for packet in lost {
        let contiguous = previous.is_some_and(|number| number + 1 == packet.number);
        previous = Some(packet.number);
        if !contiguous || packet.sent_at <= sample {
            run_start = None;
        }
        if packet.sent_at <= sample || !packet.ack_eliciting {
            continue;
        }
        match run_start {
            None => run_start = Some(packet.sent_at),
            Some(start) if packet.sent_at.duration_since(start) > threshold => return true,
            Some(_) => {}
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet(number: u64, sent_at: Instant) -> SentPacket {
        SentPacket {
            number,
            sent_at,
            size: 1200,
            ack_eliciting: true,
            in_flight: true,
        }
    }

    fn ms(value: u64) -> Duration {
        Duration::from_millis(value)
    }

    #[test]
    fn acks_remove_packets_once() {
        let t0 = Instant::now();
        let mut tracker = SentPacketTracker::new();
        for number in 0..3 {
            tracker.on_sent(PacketSpace::Application, packet(number, t0));
        }
        let outcome = tracker.on_ack(PacketSpace::Application, [0, 2]);
        assert_eq!(outcome.newly_acked.len(), 2);
        assert_eq!(outcome.largest().unwrap().number, 2);
        assert!(tracker.on_ack(PacketSpace::Application, [2]).is_empty());
        assert_eq!(tracker.largest_acked(PacketSpace::Application), Some(2));
        assert_eq!(tracker.outstanding(PacketSpace::Application), 1);
        assert_eq!(tracker.outstanding(PacketSpace::Handshake), 0);
    }

    #[test]
    fn packet_threshold_declares_loss() {
        let t0 = Instant::now();
        let mut tracker = SentPacketTracker::new();
        for number in 0..5 {
            tracker.on_sent(PacketSpace::Application, packet(number, t0));
        }
        tracker.on_ack(PacketSpace::Application, [3, 4]);
        let outcome = tracker.detect_losses(PacketSpace::Application, t0 + ms(1), ms(100));
        let lost: Vec<_> = outcome.lost.iter().map(|packet| packet.number).collect();
        assert_eq!(lost, [0, 1]);
        assert_eq!(outcome.lost_bytes(), 2400);
        // 2 号包尚未满足包号阈值，等待时间阈值。
        assert_eq!(tracker.loss_time(PacketSpace::Application), Some(t0 + ms(100)));
        assert_eq!(
            tracker.earliest_loss_time(),
            Some((PacketSpace::Application, t0 + ms(100)))
        );
    }

    #[test]
    fn time_threshold_declares_loss() {
        let t0 = Instant::now();
        let mut tracker = SentPacketTracker::new();
        tracker.on_sent(PacketSpace::Application, packet(0, t0));
        tracker.on_sent(PacketSpace::Application, packet(1, t0 + ms(10)));
        tracker.on_ack(PacketSpace::Application, [1]);
        assert!(tracker
            .detect_losses(PacketSpace::Application, t0 + ms(50), ms(90))
            .is_empty());
        let outcome = tracker.detect_losses(PacketSpace::Application, t0 + ms(90), ms(90));
        assert_eq!(outcome.lost.len(), 1);
        assert_eq!(outcome.largest_sent_at(), Some(t0));
        assert_eq!(tracker.loss_time(PacketSpace::Application), None);
    }

    #[test]
    fn packets_above_largest_acked_are_never_lost() {
        let t0 = Instant::now();
        let mut tracker = SentPacketTracker::new();
        tracker.on_sent(PacketSpace::Application, packet(0, t0));
        tracker.on_sent(PacketSpace::Application, packet(1, t0));
        assert!(tracker
            .detect_losses(PacketSpace::Application, t0 + ms(1_000), ms(10))
            .is_empty());
        tracker.on_ack(PacketSpace::Application, [0]);
        assert!(tracker
            .detect_losses(PacketSpace::Application, t0 + ms(1_000), ms(10))
            .is_empty());
    }

    #[test]
    fn discard_reports_in_flight_bytes() {
        let t0 = Instant::now();
        let mut tracker = SentPacketTracker::new();
        tracker.on_sent(PacketSpace::Handshake, packet(0, t0));
        tracker.on_sent(
            PacketSpace::Handshake,
            SentPacket {
                in_flight: false,
                ack_eliciting: false,
                ..packet(1, t0)
            },
        );
        assert_eq!(tracker.last_ack_eliciting_sent(PacketSpace::Handshake), Some(t0));
        assert_eq!(tracker.discard_space(PacketSpace::Handshake), 1200);
        assert_eq!(tracker.outstanding(PacketSpace::Handshake), 0);
        assert_eq!(tracker.last_ack_eliciting_sent(PacketSpace::Handshake), None);
    }

    #[test]
    fn persistent_congestion_needs_a_long_contiguous_span() {
        let t0 = Instant::now();
        let sample = Some(t0);
        let lost = [
            packet(1, t0 + ms(10)),
            packet(2, t0 + ms(200)),
            packet(3, t0 + ms(400)),
        ];
        assert!(is_persistent_congestion(&lost, ms(300), sample));
        assert!(!is_persistent_congestion(&lost, ms(400), sample));
        assert!(!is_persistent_congestion(&lost, ms(300), None));

        let gapped = [packet(1, t0 + ms(10)), packet(3, t0 + ms(400))];
        assert!(!is_persistent_congestion(&gapped, ms(300), sample));

        let before_sample = [packet(1, t0), packet(2, t0 + ms(400))];
        assert!(!is_persistent_congestion(&before_sample, ms(300), sample));
    }
}
