use std::borrow::Cow;

use spark_engine::{EngineError, SecurityClass};

/// QUIC 类引擎的稳定错误码。
pub mod codes {
    pub const UNKNOWN_KIND: &str = "spark.engine.quic.unknown_kind";
    pub const OVERSIZED: &str = "spark.engine.quic.oversized";
    pub const MALFORMED: &str = "spark.engine.quic.malformed";
    pub const BAD_TAG: &str = "spark.engine.quic.bad_tag";
    pub const UNEXPECTED_PACKET: &str = "spark.engine.quic.unexpected_packet";
    pub const NOT_ESTABLISHED: &str = "spark.engine.quic.not_established";
    pub const CLOSED: &str = "spark.engine.quic.closed";
    pub const RENEGOTIATION: &str = "spark.engine.quic.renegotiation";
    pub const HANDSHAKE_TIMEOUT: &str = "spark.engine.quic.handshake_timeout";
}

pub(crate) fn integrity(code: &'static str, message: impl Into<Cow<'static, str>>) -> EngineError {
    EngineError::security(code, SecurityClass::Integrity, message)
}

pub(crate) fn unexpected(message: impl Into<Cow<'static, str>>) -> EngineError {
    EngineError::protocol(codes::UNEXPECTED_PACKET, message)
}
