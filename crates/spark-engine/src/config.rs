use serde::Deserialize;
use thiserror::Error;

/// 驱动器配置的默认值。
pub mod defaults {
    pub const SESSION_LABEL: &str = "session";
    pub const MAX_TASKS_PER_ROUND: usize = 16;
    pub const MAX_HANDSHAKE_STEPS: usize = 256;
    pub const BUFFER_GROWTH_FACTOR: usize = 2;
}

/// 引擎驱动器的运行参数。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 把驱动循环中的所有“魔法数”集中为一份可从 TOML 加载的声明式配置，便于按部署环境调整；
/// - 上限类参数防止异常引擎或恶意对端把驱动器拖入无界循环。
///
/// ## 契约（What）
/// - `session_label`：日志中 `session` 字段的取值；
/// - `max_tasks_per_round`：单次 `NeedTask` 处理最多执行的委派任务数，超出视为引擎失控；
/// - `max_handshake_steps`：握手循环的最大迭代次数；
/// - `buffer_growth_factor`：`BufferOverflow` 时缓冲区的扩容倍数，必须至少为 2；
/// - 所有数值字段为零时 [`validate`](Self::validate) 返回 [`ConfigError::Invalid`]。
///
/// ## 示例
/// ```
/// use spark_engine::DriverConfig;
///
/// let config = DriverConfig::from_toml_str("session_label = \"edge-1\"\nmax_handshake_steps = 64").unwrap();
/// assert_eq!(config.session_label, "edge-1");
/// assert_eq!(config.max_handshake_steps, 64);
/// assert_eq!(config.max_tasks_per_round, 16);
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DriverConfig {
    pub session_label: String,
    pub max_tasks_per_round: usize,
    pub max_handshake_steps: usize,
    pub buffer_growth_factor: usize,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            session_label: defaults::SESSION_LABEL.to_owned(),
            max_tasks_per_round: defaults::MAX_TASKS_PER_ROUND,
            max_handshake_steps: defaults::MAX_HANDSHAKE_STEPS,
            buffer_growth_factor: defaults::BUFFER_GROWTH_FACTOR,
        }
    }
}

impl DriverConfig {
    pub fn with_session_label(mut self, label: impl Into<String>) -> Self {
        self.session_label = label.into();
        self
    }

    /// 解析 TOML 文本并校验。
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: DriverConfig = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_tasks_per_round == 0 {
            return Err(ConfigError::invalid("max_tasks_per_round", "must be at least 1"));
        }
        if self.max_handshake_steps == 0 {
            return Err(ConfigError::invalid("max_handshake_steps", "must be at least 1"));
        }
        if self.buffer_growth_factor < 2 {
            return Err(ConfigError::invalid("buffer_growth_factor", "must be at least 2"));
        }
        Ok(())
    }
}

/// 配置加载与校验错误。
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid config field `{field}`: {reason}")]
    Invalid {
        field: &'static str,
        reason: &'static str,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

impl ConfigError {
    pub fn invalid(field: &'static str, reason: &'static str) -> Self {
        ConfigError::Invalid { field, reason }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let config = DriverConfig::from_toml_str("").unwrap();
        assert_eq!(config, DriverConfig::default());
    }

    #[test]
    fn rejects_zero_and_unknown_fields() {
        let err = DriverConfig::from_toml_str("max_tasks_per_round = 0").unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                field: "max_tasks_per_round",
                ..
            }
        ));

        let err = DriverConfig::from_toml_str("buffer_growth_factor = 1").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "buffer_growth_factor", .. }));

        let err = DriverConfig::from_toml_str("retries = 3").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }
}
