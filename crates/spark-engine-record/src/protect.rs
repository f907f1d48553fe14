//! 记录保护：基于 SHA-256 的截断摘要标签。
//!
//! 标签绑定密钥、方向序号与记录类型，重放、重排或跨类型拼接都会导致校验失败。

use sha2::{Digest, Sha256};

pub const KEY_LEN: usize = 32;
pub const TAG_LEN: usize = 16;

pub fn compute_tag(key: &[u8; KEY_LEN], seq: u64, kind: u8, payload: &[u8]) -> [u8; TAG_LEN] {
    let mut hasher = Sha256::new();
    hasher.update(key);
    hasher.update(seq.to_be_bytes());
    hasher.update([kind]);
    hasher.update(payload);
    let digest = hasher.finalize();
    let mut tag = [0_u8; TAG_LEN];
    tag.copy_from_slice(&digest[..TAG_LEN]);
    tag
}

pub fn verify_tag(key: &[u8; KEY_LEN], seq: u64, kind: u8, payload: &[u8], tag: &[u8]) -> bool {
    constant_time_eq(&compute_tag(key, seq, kind, payload), tag)
}

/// 与内容无关的等长比较；长度不同直接返回 `false`。
pub fn constant_time_eq(left: &[u8], right: &[u8]) -> bool {
    if left.len() != right.len() {
        return false;
    }
    left.iter()
        .zip(right)
        .fold(0_u8, |acc, (l, r)| acc | (l ^ r))
        == 0
}
