//! TLS 记录头的最小解析，仅用于按记录边界切分入站字节。

use spark_engine::{EngineError, SecurityClass};

use crate::error::codes;

/// TLS 记录头长度：`content_type u8 | version u16 | length u16`。
pub const HEADER_LEN: usize = 5;
/// 单条记录可承载的最大明文。
pub const MAX_FRAGMENT: usize = 16 * 1024;
/// 协议允许的最大密文主体（TLS 1.2 上限，TLS 1.3 更严格）。
pub const MAX_CIPHERTEXT: usize = MAX_FRAGMENT + 2048;
/// 出站加密一条记录的最坏开销（TLS 1.2 AES-GCM：头部 + 显式 nonce + 标签）。
pub const WRITE_OVERHEAD: usize = HEADER_LEN + 8 + 16;

pub const APPLICATION_DATA: u8 = 23;

/// 源缓冲区开头的一条完整记录。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TlsRecord {
    pub content_type: u8,
    pub body_len: usize,
}

impl TlsRecord {
    pub fn record_len(&self) -> usize {
        HEADER_LEN + self.body_len
    }

    /// 该记录解密后可能产出的最大明文。
    pub fn plaintext_bound(&self) -> usize {
        if self.content_type == APPLICATION_DATA {
            self.body_len.min(MAX_FRAGMENT)
        } else {
            0
        }
    }
}

/// 返回源开头的完整记录；字节不足时返回 `None`。
pub fn next_record(source: &[u8]) -> Result<Option<TlsRecord>, EngineError> {
    let Some(header) = source.get(..HEADER_LEN) else {
        return Ok(None);
    };
    let body_len = usize::from(u16::from_be_bytes([header[3], header[4]]));
    if body_len > MAX_CIPHERTEXT {
        return Err(EngineError::security(
            codes::OVERSIZED_RECORD,
            SecurityClass::Integrity,
            format!("tls record body of {body_len} bytes exceeds {MAX_CIPHERTEXT}"),
        ));
    }
    let record = TlsRecord {
        content_type: header[0],
        body_len,
    };
    if source.len() < record.record_len() {
        return Ok(None);
    }
    Ok(Some(record))
}
