use core::fmt;

use serde::Deserialize;
use spark_engine::ConfigError;

use crate::{protect::TAG_LEN, wire::HEADER_LEN};

pub const DEFAULT_KDF_ROUNDS: u32 = 4096;
pub const DEFAULT_MAX_FRAGMENT: usize = 16 * 1024;

/// 记录层引擎配置。
///
/// # 契约（What）
/// - `psk`：双方预共享的口令，不可为空；
/// - `kdf_rounds`：密钥派生的 SHA-256 迭代次数，越大越昂贵，这也是派生被做成委派任务的原因；
/// - `max_fragment`：单条数据记录的最大明文长度，加上头部与标签后必须能放进 16 位长度字段。
///
/// `Debug` 输出不会包含口令。
#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RecordConfig {
    pub psk: String,
    pub kdf_rounds: u32,
    pub max_fragment: usize,
}

impl Default for RecordConfig {
    fn default() -> Self {
        Self {
            psk: String::new(),
            kdf_rounds: DEFAULT_KDF_ROUNDS,
            max_fragment: DEFAULT_MAX_FRAGMENT,
        }
    }
}

impl fmt::Debug for RecordConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordConfig")
            .field("psk", &"<redacted>")
            .field("kdf_rounds", &self.kdf_rounds)
            .field("max_fragment", &self.max_fragment)
            .finish()
    }
}

impl RecordConfig {
    pub fn new(psk: impl Into<String>) -> Self {
        Self {
            psk: psk.into(),
            ..Self::default()
        }
    }

    pub fn with_kdf_rounds(mut self, rounds: u32) -> Self {
        self.kdf_rounds = rounds;
        self
    }

    pub fn with_max_fragment(mut self, max_fragment: usize) -> Self {
        self.max_fragment = max_fragment;
        self
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: RecordConfig = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.psk.is_empty() {
            return Err(ConfigError::invalid("psk", "must not be empty"));
        }
        if self.kdf_rounds == 0 {
            return Err(ConfigError::invalid("kdf_rounds", "must be at least 1"));
        }
        if self.max_fragment == 0 || self.max_fragment + TAG_LEN > usize::from(u16::MAX) {
            return Err(ConfigError::invalid(
                "max_fragment",
                "must be between 1 and 65519 bytes",
            ));
        }
        Ok(())
    }

    /// 一条满载数据记录在线上的字节数。
    pub fn max_record_len(&self) -> usize {
        HEADER_LEN + self.max_fragment + TAG_LEN
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_and_redacts() {
        let config = RecordConfig::from_toml_str(
            "psk = \"correct horse\"\nkdf_rounds = 8\nmax_fragment = 1024",
        )
        .unwrap();
        assert_eq!(config.kdf_rounds, 8);
        assert_eq!(config.max_record_len(), 3 + 1024 + 16);
        assert!(!format!("{config:?}").contains("horse"));
    }

    #[test]
    fn rejects_empty_psk_and_huge_fragments() {
        assert!(matches!(
            RecordConfig::from_toml_str("kdf_rounds = 8"),
            Err(ConfigError::Invalid { field: "psk", .. })
        ));
        assert!(matches!(
            RecordConfig::new("k").with_max_fragment(65_520).validate(),
            Err(ConfigError::Invalid { field: "max_fragment", .. })
        ));
    }
}
