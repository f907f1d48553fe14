use spark_engine::{EngineError, SecurityClass};

/// 记录层引擎的稳定错误码。
pub mod codes {
    pub const UNKNOWN_TYPE: &str = "spark.engine.record.unknown_type";
    pub const OVERSIZED: &str = "spark.engine.record.oversized";
    pub const MALFORMED: &str = "spark.engine.record.malformed";
    pub const BAD_TAG: &str = "spark.engine.record.bad_tag";
    pub const BAD_FINISHED: &str = "spark.engine.record.bad_finished";
    pub const UNEXPECTED_MESSAGE: &str = "spark.engine.record.unexpected_message";
    pub const NOT_ESTABLISHED: &str = "spark.engine.record.not_established";
    pub const CLOSED: &str = "spark.engine.record.closed";
    pub const RENEGOTIATION: &str = "spark.engine.record.renegotiation";
    pub const ENTROPY: &str = "spark.engine.record.entropy";
}

/// 完整性类失败：标签不符、记录超长、类型未知。
pub(crate) fn integrity(code: &'static str, message: impl Into<std::borrow::Cow<'static, str>>) -> EngineError {
    EngineError::security(code, SecurityClass::Integrity, message)
}

pub(crate) fn unexpected(message: impl Into<std::borrow::Cow<'static, str>>) -> EngineError {
    EngineError::protocol(codes::UNEXPECTED_MESSAGE, message)
}
