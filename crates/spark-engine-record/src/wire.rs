//! 记录线格式：`type u8 | length u16 BE | body`。

use spark_engine::EngineError;

use crate::error::{codes, integrity};

pub const HEADER_LEN: usize = 3;

/// 记录类型。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RecordType {
    Hello = 0x16,
    Finished = 0x14,
    Data = 0x17,
    Close = 0x15,
}

impl RecordType {
    pub const fn code(self) -> u8 {
        self as u8
    }

    pub const fn from_code(code: u8) -> Option<Self> {
        match code {
            0x16 => Some(RecordType::Hello),
            0x14 => Some(RecordType::Finished),
            0x17 => Some(RecordType::Data),
            0x15 => Some(RecordType::Close),
            _ => None,
        }
    }

    pub const fn is_handshake(self) -> bool {
        matches!(self, RecordType::Hello | RecordType::Finished)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RecordHeader {
    pub kind: RecordType,
    pub body_len: usize,
}

impl RecordHeader {
    pub const fn record_len(&self) -> usize {
        HEADER_LEN + self.body_len
    }
}

/// 解析记录头。
///
/// - 字节不足三字节时返回 `Ok(None)`，调用方应报告 `BufferUnderflow`；
/// - 类型未知或长度超过 `max_body` 时返回完整性错误，且不要求主体已经到齐。
pub fn parse_header(source: &[u8], max_body: usize) -> Result<Option<RecordHeader>, EngineError> {
    let Some(head) = source.get(..HEADER_LEN) else {
        return Ok(None);
    };
    let kind = RecordType::from_code(head[0]).ok_or_else(|| {
        integrity(
            codes::UNKNOWN_TYPE,
            format!("unknown record type 0x{:02x}", head[0]),
        )
    })?;
    let body_len = usize::from(u16::from_be_bytes([head[1], head[2]]));
    if body_len > max_body {
        return Err(integrity(
            codes::OVERSIZED,
            format!("record body of {body_len} bytes exceeds limit of {max_body}"),
        ));
    }
    Ok(Some(RecordHeader { kind, body_len }))
}

/// 写入记录头；`body_len` 由调用方保证不超过 `u16::MAX`。
pub fn write_header(destination: &mut [u8], kind: RecordType, body_len: usize) {
    debug_assert!(body_len <= usize::from(u16::MAX));
    destination[0] = kind.code();
    destination[1..HEADER_LEN].copy_from_slice(&(body_len as u16).to_be_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_input_is_underflow() {
        assert_eq!(parse_header(&[0x17, 0x00], 64).unwrap(), None);
    }

    #[test]
    fn header_round_trip_and_limits() {
        let mut buf = [0_u8; HEADER_LEN];
        write_header(&mut buf, RecordType::Data, 42);
        let header = parse_header(&buf, 64).unwrap().unwrap();
        assert_eq!(header.kind, RecordType::Data);
        assert_eq!(header.record_len(), 45);

        let err = parse_header(&buf, 16).unwrap_err();
        assert_eq!(err.code(), codes::OVERSIZED);
        let err = parse_header(&[0x99, 0, 0], 16).unwrap_err();
        assert_eq!(err.security_class(), Some(spark_engine::SecurityClass::Integrity));
    }
}
