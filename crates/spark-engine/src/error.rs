use std::{borrow::Cow, fmt};

use thiserror::Error;

use crate::lifecycle::LifecycleState;

/// 引擎错误的稳定错误码。
///
/// 命名遵循 `spark.engine.<域>.<语义>`，日志、指标与告警只依赖这些码值，不解析文案。
pub mod codes {
    pub const VALIDATION_STATUS_MISSING: &str = "spark.engine.validation.status_missing";
    pub const VALIDATION_HANDSHAKE_STATUS_MISSING: &str =
        "spark.engine.validation.handshake_status_missing";
    pub const VALIDATION_NEGATIVE_CONSUMED: &str = "spark.engine.validation.negative_consumed";
    pub const VALIDATION_NEGATIVE_PRODUCED: &str = "spark.engine.validation.negative_produced";
    pub const VALIDATION_CONSUMED_OUT_OF_RANGE: &str =
        "spark.engine.validation.consumed_out_of_range";
    pub const VALIDATION_PRODUCED_OUT_OF_RANGE: &str =
        "spark.engine.validation.produced_out_of_range";

    pub const ILLEGAL_BEFORE_INIT: &str = "spark.engine.illegal.before_init";
    pub const ILLEGAL_REINIT: &str = "spark.engine.illegal.reinit";
    pub const ILLEGAL_AFTER_CLEANUP: &str = "spark.engine.illegal.after_cleanup";

    pub const INCIDENT_TRUNCATION: &str = "spark.engine.incident.truncation";
    pub const INCIDENT_UNEXPECTED_CLOSE: &str = "spark.engine.incident.unexpected_close";

    pub const TASK_PANICKED: &str = "spark.engine.task.panicked";

    pub const DRIVER_CLOSED: &str = "spark.engine.driver.closed";
    pub const DRIVER_BUFFER_LIMIT: &str = "spark.engine.driver.buffer_limit";
    pub const DRIVER_STALLED: &str = "spark.engine.driver.stalled";
    pub const DRIVER_IO: &str = "spark.engine.driver.io";
    pub const DRIVER_CONFIG: &str = "spark.engine.driver.config";
}

/// 安全事件分类，用于细化由安全校验触发的协议错误。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum SecurityClass {
    /// 认证失败，例如证书不可信、Finished 校验不符。
    Authentication,
    /// 授权失败，例如对端拒绝访问。
    Authorization,
    /// 保密性威胁，例如协商出不可接受的参数。
    Confidentiality,
    /// 完整性校验失败，例如记录标签不符或记录超长。
    Integrity,
    /// 未归类的安全事件。
    Unknown,
}

impl SecurityClass {
    /// 返回分类对应的稳定代码，供日志与指标使用。
    pub const fn code(self) -> &'static str {
        match self {
            SecurityClass::Authentication => "security.authentication",
            SecurityClass::Authorization => "security.authorization",
            SecurityClass::Confidentiality => "security.confidentiality",
            SecurityClass::Integrity => "security.integrity",
            SecurityClass::Unknown => "security.unknown",
        }
    }
}

/// `EngineResult` 构造参数非法。
///
/// 每个字段对应独立的变体与错误码，便于精确诊断是哪一项违反了约束。
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("engine result status must be present")]
    StatusMissing,
    #[error("engine result handshake status must be present")]
    HandshakeStatusMissing,
    #[error("bytes consumed must be non-negative, got {0}")]
    NegativeBytesConsumed(i64),
    #[error("bytes produced must be non-negative, got {0}")]
    NegativeBytesProduced(i64),
    /// 计数为正但超出目标平台 `usize` 的表示范围（32 位平台）。
    #[error("bytes consumed {0} does not fit in usize")]
    BytesConsumedOutOfRange(i64),
    #[error("bytes produced {0} does not fit in usize")]
    BytesProducedOutOfRange(i64),
}

impl ValidationError {
    pub const fn code(&self) -> &'static str {
        match self {
            ValidationError::StatusMissing => codes::VALIDATION_STATUS_MISSING,
            ValidationError::HandshakeStatusMissing => codes::VALIDATION_HANDSHAKE_STATUS_MISSING,
            ValidationError::NegativeBytesConsumed(_) => codes::VALIDATION_NEGATIVE_CONSUMED,
            ValidationError::NegativeBytesProduced(_) => codes::VALIDATION_NEGATIVE_PRODUCED,
            ValidationError::BytesConsumedOutOfRange(_) => codes::VALIDATION_CONSUMED_OUT_OF_RANGE,
            ValidationError::BytesProducedOutOfRange(_) => codes::VALIDATION_PRODUCED_OUT_OF_RANGE,
        }
    }
}

/// 安全事件（Incident）的具体类别。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum IncidentClass {
    /// 对端流结束但从未发送关闭通知：可能遭遇截断攻击。
    Truncation,
    /// 关闭通知出现在协议不允许的阶段。
    UnexpectedCloseState,
}

impl IncidentClass {
    pub const fn code(self) -> &'static str {
        match self {
            IncidentClass::Truncation => codes::INCIDENT_TRUNCATION,
            IncidentClass::UnexpectedCloseState => codes::INCIDENT_UNEXPECTED_CLOSE,
        }
    }
}

/// 入站关闭校验发现的安全事件描述。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 截断属于安全相关异常而非普通 I/O 故障，调用方必须把它路由到独立的事件处理路径；
/// - 以结构化字段承载上下文，调用方模式匹配即可，无需依赖错误子类型身份。
///
/// ## 契约（What）
/// - `class`：事件类别，决定稳定错误码；
/// - `detail`：面向排障人员的描述，不含敏感数据；
/// - `outbound_done` / `inbound_done`：事件发生时引擎的方向性关闭状态快照。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IncidentReport {
    class: IncidentClass,
    detail: Cow<'static, str>,
    outbound_done: bool,
    inbound_done: bool,
}

impl IncidentReport {
    pub fn new(class: IncidentClass, detail: impl Into<Cow<'static, str>>) -> Self {
        Self {
            class,
            detail: detail.into(),
            outbound_done: false,
            inbound_done: false,
        }
    }

    /// 附带事件发生时的方向性关闭状态。
    pub fn with_closure(mut self, outbound_done: bool, inbound_done: bool) -> Self {
        self.outbound_done = outbound_done;
        self.inbound_done = inbound_done;
        self
    }

    pub fn class(&self) -> IncidentClass {
        self.class
    }

    pub fn code(&self) -> &'static str {
        self.class.code()
    }

    pub fn detail(&self) -> &str {
        &self.detail
    }

    pub fn outbound_done(&self) -> bool {
        self.outbound_done
    }

    pub fn inbound_done(&self) -> bool {
        self.inbound_done
    }
}

impl fmt::Display for IncidentReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code(), self.detail)
    }
}

/// 错误大类，对应四种不同的处置策略。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// 构造参数非法，立即抛出、从不重试。
    Validation,
    /// 握手或变换期间的通用协议失败，调用方应拆除会话。
    Protocol,
    /// 安全相关异常，必须进入独立的事件处理路径。
    Incident,
    /// 在禁止的生命周期阶段调用操作，属于驱动器缺陷。
    IllegalState,
}

/// 引擎契约跨越边界的统一错误类型。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 把“参数非法 / 协议失败 / 安全事件 / 非法调用”四类错误合流为一个可模式匹配的枚举，
///   驱动器与会话层据 [`ErrorKind`] 选择处置路径；
/// - 所有变体都暴露稳定错误码，日志与告警不必解析文案。
///
/// ## 契约（What）
/// - 引擎与驱动器内部从不重试，[`is_recoverable`](Self::is_recoverable) 恒为 `false`；
///   是否重连由会话层的失败处理器决定；
/// - `Protocol::security` 非空时表示该协议错误由安全校验触发（标签不符、证书不可信等）。
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("[{}] {}", .0.code(), .0)]
    Validation(#[from] ValidationError),

    #[error("[{code}] {message}")]
    Protocol {
        code: &'static str,
        message: Cow<'static, str>,
        security: Option<SecurityClass>,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
    },

    #[error("{0}")]
    Incident(IncidentReport),

    #[error("[{code}] `{operation}` is illegal while the engine is {state}")]
    IllegalState {
        code: &'static str,
        operation: &'static str,
        state: LifecycleState,
    },
}

impl EngineError {
    /// 构造通用协议错误。
    pub fn protocol(code: &'static str, message: impl Into<Cow<'static, str>>) -> Self {
        EngineError::Protocol {
            code,
            message: message.into(),
            security: None,
            source: None,
        }
    }

    /// 构造由安全校验触发的协议错误。
    pub fn security(
        code: &'static str,
        class: SecurityClass,
        message: impl Into<Cow<'static, str>>,
    ) -> Self {
        EngineError::Protocol {
            code,
            message: message.into(),
            security: Some(class),
            source: None,
        }
    }

    pub fn incident(report: IncidentReport) -> Self {
        EngineError::Incident(report)
    }

    /// 为协议错误附带底层原因；其余变体原样返回。
    pub fn with_source(self, cause: impl std::error::Error + Send + Sync + 'static) -> Self {
        match self {
            EngineError::Protocol {
                code,
                message,
                security,
                ..
            } => EngineError::Protocol {
                code,
                message,
                security,
                source: Some(Box::new(cause)),
            },
            other => other,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Validation(_) => ErrorKind::Validation,
            EngineError::Protocol { .. } => ErrorKind::Protocol,
            EngineError::Incident(_) => ErrorKind::Incident,
            EngineError::IllegalState { .. } => ErrorKind::IllegalState,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            EngineError::Validation(err) => err.code(),
            EngineError::Protocol { code, .. } => code,
            EngineError::Incident(report) => report.code(),
            EngineError::IllegalState { code, .. } => code,
        }
    }

    pub fn is_incident(&self) -> bool {
        matches!(self, EngineError::Incident(_))
    }

    pub fn incident_report(&self) -> Option<&IncidentReport> {
        match self {
            EngineError::Incident(report) => Some(report),
            _ => None,
        }
    }

    pub fn security_class(&self) -> Option<SecurityClass> {
        match self {
            EngineError::Protocol { security, .. } => *security,
            _ => None,
        }
    }

    /// 引擎与驱动器层面永不重试。
    pub fn is_recoverable(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn incident_is_distinguishable_from_protocol_errors() {
        let incident = EngineError::incident(
            IncidentReport::new(IncidentClass::Truncation, "peer stream ended")
                .with_closure(false, true),
        );
        let protocol = EngineError::protocol("spark.engine.test.protocol", "bad record");

        assert_eq!(incident.kind(), ErrorKind::Incident);
        assert!(incident.is_incident());
        assert_eq!(incident.code(), codes::INCIDENT_TRUNCATION);
        let report = incident.incident_report().expect("incident carries a report");
        assert!(report.inbound_done());
        assert!(!report.outbound_done());

        assert_eq!(protocol.kind(), ErrorKind::Protocol);
        assert!(!protocol.is_incident());
        assert!(protocol.incident_report().is_none());
    }

    #[test]
    fn display_carries_stable_code() {
        let err = EngineError::from(ValidationError::NegativeBytesProduced(-3));
        assert_eq!(
            err.to_string(),
            "[spark.engine.validation.negative_produced] bytes produced must be non-negative, got -3"
        );
    }

    #[test]
    fn source_is_attached_only_to_protocol_errors() {
        let io = std::io::Error::other("socket reset");
        let err = EngineError::protocol(codes::DRIVER_IO, "transport read").with_source(io);
        assert!(std::error::Error::source(&err).is_some());

        let incident = EngineError::incident(IncidentReport::new(
            IncidentClass::Truncation,
            "missing close",
        ))
        .with_source(std::io::Error::other("ignored"));
        assert!(std::error::Error::source(&incident).is_none());
        assert!(!incident.is_recoverable());
    }
}
