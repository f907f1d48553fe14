//! 包线格式：`kind u8 | length u16 BE | pn u64 | largest_acked u64 | ack_bits u64 | payload [| tag]`。
//!
//! - `length` 覆盖 `pn` 之后的全部字节（含标签）；
//! - `largest_acked == u64::MAX` 表示不携带确认；
//! - `ack_bits` 第 i 位置位表示包号 `largest_acked - 1 - i` 也已收到；
//! - 数据、确认、关闭三类包受保护，标签覆盖 `pn` 起至负载末尾的字节，并绑定包号与类型。

use spark_engine::EngineError;
use spark_engine_record::protect::TAG_LEN;

use crate::{
    error::{codes, integrity},
    recovery::PacketSpace,
};

pub const PREFIX_LEN: usize = 3;
pub const HEADER_LEN: usize = PREFIX_LEN + 24;
/// 受保护包除负载外的固定开销。
pub const PROTECTED_OVERHEAD: usize = HEADER_LEN + TAG_LEN;

const NO_ACK: u64 = u64::MAX;
const ACK_WINDOW: u64 = 64;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketKind {
    Hello = 0x01,
    Finished = 0x02,
    Data = 0x03,
    Ack = 0x04,
    Close = 0x05,
}

impl PacketKind {
    pub const fn code(self) -> u8 {
        self as u8
    }

    pub const fn from_code(code: u8) -> Option<Self> {
        match code {
            0x01 => Some(PacketKind::Hello),
            0x02 => Some(PacketKind::Finished),
            0x03 => Some(PacketKind::Data),
            0x04 => Some(PacketKind::Ack),
            0x05 => Some(PacketKind::Close),
            _ => None,
        }
    }

    pub const fn space(self) -> PacketSpace {
        match self {
            PacketKind::Hello | PacketKind::Finished => PacketSpace::Handshake,
            PacketKind::Data | PacketKind::Ack | PacketKind::Close => PacketSpace::Application,
        }
    }

    pub const fn is_protected(self) -> bool {
        matches!(self.space(), PacketSpace::Application)
    }

    /// 收到后需要回复确认的包；关闭包之后不再有确认。
    pub const fn is_ack_eliciting(self) -> bool {
        matches!(self, PacketKind::Hello | PacketKind::Finished | PacketKind::Data)
    }
}

/// 确认帧：最大包号加上其下 64 个包号的位图。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AckRanges {
    pub largest: u64,
    pub bits: u64,
}

impl AckRanges {
    /// 按包号降序列出被确认的全部包号。
    pub fn numbers(self) -> impl Iterator<Item = u64> {
        let below = (0..ACK_WINDOW).filter_map(move |bit| {
            if self.bits & (1 << bit) == 0 {
                return None;
            }
            self.largest.checked_sub(bit + 1)
        });
        std::iter::once(self.largest).chain(below)
    }
}

/// 某一包号空间的接收记录，用于去重与生成确认帧。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReceiveWindow {
    largest: Option<u64>,
    bits: u64,
}

impl ReceiveWindow {
    /// 登记收到的包号；重复或早于窗口的包号返回 `false`。
    pub fn insert(&mut self, number: u64) -> bool {
        let Some(largest) = self.largest else {
            self.largest = Some(number);
            self.bits = 0;
            return true;
        };
        if number > largest {
            let shift = number - largest;
            self.bits = match shift {
                s if s > ACK_WINDOW => 0,
                ACK_WINDOW => 1 << (ACK_WINDOW - 1),
                s => (self.bits << s) | (1 << (s - 1)),
            };
            self.largest = Some(number);
            return true;
        }
        if number == largest {
            return false;
        }
        let offset = largest - number - 1;
        if offset >= ACK_WINDOW || self.bits & (1 << offset) != 0 {
            return false;
        }
        self.bits |= 1 << offset;
        true
    }

    pub fn ranges(&self) -> Option<AckRanges> {
        self.largest.map(|largest| AckRanges {
            largest,
            bits: self.bits,
        })
    }

    pub fn contains(&self, number: u64) -> bool {
        match self.largest {
            None => false,
            Some(largest) if number == largest => true,
            Some(largest) if number > largest => false,
            Some(largest) => {
                let offset = largest - number - 1;
                offset < ACK_WINDOW && self.bits & (1 << offset) != 0
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PacketHeader {
    pub kind: PacketKind,
    pub number: u64,
    pub ack: Option<AckRanges>,
    /// `pn` 之后的字节数，含标签。
    pub length: usize,
}

impl PacketHeader {
    pub const fn packet_len(&self) -> usize {
        PREFIX_LEN + self.length
    }

    /// 负载长度；受保护包扣除标签。长度不足以容纳固定字段时返回 `None`。
    pub fn payload_len(&self) -> Option<usize> {
        let fixed = HEADER_LEN - PREFIX_LEN + if self.kind.is_protected() { TAG_LEN } else { 0 };
        self.length.checked_sub(fixed)
    }
}

/// 解析包头。
///
/// - 前缀不足或包未到齐时返回 `Ok(None)`；
/// - 类型未知或包长超过 `max_packet` 时返回完整性错误，不要求包已到齐。
pub fn parse(source: &[u8], max_packet: usize) -> Result<Option<PacketHeader>, EngineError> {
    let Some(prefix) = source.get(..PREFIX_LEN) else {
        return Ok(None);
    };
    let kind = PacketKind::from_code(prefix[0]).ok_or_else(|| {
        integrity(
            codes::UNKNOWN_KIND,
            format!("unknown packet kind 0x{:02x}", prefix[0]),
        )
    })?;
    let length = usize::from(u16::from_be_bytes([prefix[1], prefix[2]]));
    if PREFIX_LEN + length > max_packet {
        return Err(integrity(
            codes::OVERSIZED,
            format!(
                "packet of {} bytes exceeds datagram limit of {max_packet}",
                PREFIX_LEN + length
            ),
        ));
    }
    if length < HEADER_LEN - PREFIX_LEN {
        return Err(EngineError::protocol(
            codes::MALFORMED,
            "packet is shorter than its fixed header",
        ));
    }
    if source.len() < PREFIX_LEN + length {
        return Ok(None);
    }
    let fixed = &source[PREFIX_LEN..HEADER_LEN];
    let number = read_u64(&fixed[0..8]);
    let largest = read_u64(&fixed[8..16]);
    let bits = read_u64(&fixed[16..24]);
    let ack = (largest != NO_ACK).then_some(AckRanges { largest, bits });
    Ok(Some(PacketHeader {
        kind,
        number,
        ack,
        length,
    }))
}

/// 写入包头；`length` 为 `pn` 之后的总字节数，由调用方保证不超过 `u16::MAX`。
pub fn write_header(
    destination: &mut [u8],
    kind: PacketKind,
    number: u64,
    ack: Option<AckRanges>,
    length: usize,
) {
    debug_assert!(length <= usize::from(u16::MAX));
    destination[0] = kind.code();
    destination[1..PREFIX_LEN].copy_from_slice(&(length as u16).to_be_bytes());
    destination[3..11].copy_from_slice(&number.to_be_bytes());
    let (largest, bits) = ack.map_or((NO_ACK, 0), |ack| (ack.largest, ack.bits));
    destination[11..19].copy_from_slice(&largest.to_be_bytes());
    destination[19..HEADER_LEN].copy_from_slice(&bits.to_be_bytes());
}

fn read_u64(bytes: &[u8]) -> u64 {
    let mut raw = [0_u8; 8];
    raw.copy_from_slice(bytes);
    u64::from_be_bytes(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_fields_survive_the_wire() {
        let mut buf = [0_u8; HEADER_LEN + 4 + TAG_LEN];
        let ack = AckRanges {
            largest: 9,
            bits: 0b101,
        };
        write_header(&mut buf, PacketKind::Data, 42, Some(ack), 24 + 4 + TAG_LEN);
        let header = parse(&buf, 1200).unwrap().unwrap();
        assert_eq!(header.kind, PacketKind::Data);
        assert_eq!(header.number, 42);
        assert_eq!(header.ack, Some(ack));
        assert_eq!(header.payload_len(), Some(4));
        assert_eq!(header.packet_len(), buf.len());

        write_header(&mut buf, PacketKind::Hello, 0, None, 24);
        assert_eq!(parse(&buf, 1200).unwrap().unwrap().ack, None);
    }

    #[test]
    fn incomplete_and_invalid_packets() {
        let mut buf = [0_u8; HEADER_LEN];
        write_header(&mut buf, PacketKind::Ack, 1, None, 24 + TAG_LEN);
        assert_eq!(parse(&buf, 1200).unwrap(), None);
        assert_eq!(parse(&buf[..2], 1200).unwrap(), None);
        assert_eq!(parse(&buf, 30).unwrap_err().code(), codes::OVERSIZED);

        let unknown = [0x7f_u8, 0, 0];
        assert_eq!(parse(&unknown, 1200).unwrap_err().code(), codes::UNKNOWN_KIND);

        let short = [0x03_u8, 0, 2, 0, 0];
        assert_eq!(parse(&short, 1200).unwrap_err().code(), codes::MALFORMED);
    }

    #[test]
    fn ack_ranges_list_received_numbers() {
        let ack = AckRanges {
            largest: 10,
            bits: 0b1001,
        };
        let numbers: Vec<_> = ack.numbers().collect();
        assert_eq!(numbers, [10, 9, 6]);

        let low = AckRanges {
            largest: 1,
            bits: u64::MAX,
        };
        assert_eq!(low.numbers().collect::<Vec<_>>(), [1, 0]);
    }

    #[test]
    fn receive_window_deduplicates() {
        let mut window = ReceiveWindow::default();
        assert_eq!(window.ranges(), None);
        assert!(window.insert(0));
        assert!(window.insert(2));
        assert!(!window.insert(2));
        assert!(window.insert(1));
        assert!(!window.insert(0));
        assert_eq!(
            window.ranges(),
            Some(AckRanges {
                largest: 2,
                bits: 0b11
            })
        );
        assert!(window.contains(1));
        assert!(!window.contains(3));

        assert!(window.insert(66));
        // 2 号包正好滑到窗口最远端，0、1 号包滑出窗口。
        assert_eq!(window.ranges().unwrap().bits, 1 << 63);
        assert!(!window.insert(1));
        assert!(window.insert(200));
        assert_eq!(window.ranges().unwrap().bits, 0);
    }
}
