use std::io;

use rustls::{AlertDescription, Error as RustlsError};
use spark_engine::{EngineError, SecurityClass};

/// TLS 引擎的稳定错误码。
pub mod codes {
    pub const HANDSHAKE_FAILED: &str = "spark.engine.tls.handshake_failed";
    pub const READ_FAILED: &str = "spark.engine.tls.read_failed";
    pub const WRITE_FAILED: &str = "spark.engine.tls.write_failed";
    pub const CONFIG: &str = "spark.engine.tls.config";
    pub const OVERSIZED_RECORD: &str = "spark.engine.tls.oversized_record";
    pub const CLOSED: &str = "spark.engine.tls.closed";
    pub const HANDSHAKE_TIMEOUT: &str = "spark.engine.tls.handshake_timeout";
    pub const FACTORY_UNCONFIGURED: &str = "spark.engine.tls.factory_unconfigured";
}

/// TLS 错误映射。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 把 `rustls` 的错误统一映射为 [`EngineError::Protocol`]，并按安全语义补充 [`SecurityClass`]，
///   会话层据此区分“证书不可信”“记录被篡改”与普通协议失败；
/// - 稳定错误码按操作阶段（握手/读/写/构造）区分，运维脚本无需解析底层文案。
///
/// ## 逻辑（How）
/// - `OperationKind` 描述一类操作的错误码与默认文案；
/// - [`classify`] 把具体 `rustls::Error` 细分为安全类别，`AlertReceived` 再交给
///   [`classify_alert`] 按告警描述细化；
/// - 无安全含义的错误（内部状态、对端不兼容以外的通用错误）不附带类别。
///
/// ## 风险与权衡（Trade-offs）
/// - `rustls::Error` 与 `AlertDescription` 均为非穷举枚举，未列出的变体按“无安全类别”处理，
///   后续若需更精确分类可在此集中扩展。
#[derive(Clone, Copy, Debug)]
pub(crate) struct OperationKind {
    pub code: &'static str,
    pub message: &'static str,
}

pub(crate) const HANDSHAKE: OperationKind = OperationKind {
    code: codes::HANDSHAKE_FAILED,
    message: "tls handshake",
};

pub(crate) const READ: OperationKind = OperationKind {
    code: codes::READ_FAILED,
    message: "tls read",
};

pub(crate) const WRITE: OperationKind = OperationKind {
    code: codes::WRITE_FAILED,
    message: "tls write",
};

pub(crate) const CONFIGURE: OperationKind = OperationKind {
    code: codes::CONFIG,
    message: "tls connection setup",
};

/// 将 `rustls` 错误映射为协议错误，并保留原始错误作为 source。
pub(crate) fn map_rustls_error(kind: OperationKind, error: RustlsError) -> EngineError {
    let message = format!("{}: {}", kind.message, error);
    let mapped = match classify(&error) {
        Some(class) => EngineError::security(kind.code, class, message),
        None => EngineError::protocol(kind.code, message),
    };
    mapped.with_source(error)
}

/// 将读写记录时的 `io::Error` 映射为协议错误；若内部嵌套了 `rustls::Error` 则沿用其分类。
pub(crate) fn map_io_error(kind: OperationKind, error: io::Error) -> EngineError {
    let class = error
        .get_ref()
        .and_then(|source| source.downcast_ref::<RustlsError>())
        .and_then(classify);
    let message = format!("{}: {}", kind.message, error);
    let mapped = match class {
        Some(class) => EngineError::security(kind.code, class, message),
        None => EngineError::protocol(kind.code, message),
    };
    mapped.with_source(error)
}

pub(crate) fn classify(error: &RustlsError) -> Option<SecurityClass> {
    use RustlsError::*;
    match error {
        InappropriateMessage { .. }
        | InappropriateHandshakeMessage { .. }
        | InvalidEncryptedClientHello(_)
        | InvalidMessage(_)
        | PeerMisbehaved(_)
        | DecryptError
        | EncryptError
        | PeerSentOversizedRecord => Some(SecurityClass::Integrity),
        NoCertificatesPresented
        | InvalidCertificate(_)
        | InvalidCertRevocationList(_)
        | UnsupportedNameType => Some(SecurityClass::Authentication),
        PeerIncompatible(_) => Some(SecurityClass::Confidentiality),
        AlertReceived(alert) => classify_alert(alert),
        NoApplicationProtocol => Some(SecurityClass::Unknown),
        _ => None,
    }
}

pub(crate) fn classify_alert(alert: &AlertDescription) -> Option<SecurityClass> {
    use AlertDescription::*;
    match alert {
        BadCertificate
        | UnsupportedCertificate
        | CertificateRevoked
        | CertificateExpired
        | CertificateUnknown
        | UnknownCA
        | NoCertificate
        | CertificateUnobtainable
        | CertificateRequired => Some(SecurityClass::Authentication),
        AccessDenied => Some(SecurityClass::Authorization),
        InsufficientSecurity | ProtocolVersion | InappropriateFallback => {
            Some(SecurityClass::Confidentiality)
        }
        DecodeError
        | DecryptError
        | DecryptionFailed
        | HandshakeFailure
        | IllegalParameter
        | RecordOverflow
        | BadRecordMac
        | UnexpectedMessage
        | MissingExtension
        | UnsupportedExtension
        | BadCertificateStatusResponse
        | BadCertificateHashValue
        | UnknownPSKIdentity => Some(SecurityClass::Integrity),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustls::CertificateError;
    use spark_engine::ErrorKind;

    #[test]
    fn certificate_failures_are_authentication() {
        let err = map_rustls_error(
            HANDSHAKE,
            RustlsError::InvalidCertificate(CertificateError::UnknownIssuer),
        );
        assert_eq!(err.kind(), ErrorKind::Protocol);
        assert_eq!(err.code(), codes::HANDSHAKE_FAILED);
        assert_eq!(err.security_class(), Some(SecurityClass::Authentication));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn alerts_are_refined() {
        assert_eq!(
            classify(&RustlsError::AlertReceived(AlertDescription::BadRecordMac)),
            Some(SecurityClass::Integrity)
        );
        assert_eq!(
            classify(&RustlsError::AlertReceived(AlertDescription::AccessDenied)),
            Some(SecurityClass::Authorization)
        );
        assert_eq!(
            classify(&RustlsError::AlertReceived(AlertDescription::CloseNotify)),
            None
        );
        assert_eq!(classify(&RustlsError::DecryptError), Some(SecurityClass::Integrity));
        assert_eq!(classify(&RustlsError::HandshakeNotComplete), None);
    }

    #[test]
    fn io_errors_keep_nested_rustls_class() {
        let nested = io::Error::new(io::ErrorKind::InvalidData, RustlsError::DecryptError);
        let err = map_io_error(READ, nested);
        assert_eq!(err.code(), codes::READ_FAILED);
        assert_eq!(err.security_class(), Some(SecurityClass::Integrity));

        let plain = map_io_error(WRITE, io::Error::other("sink full"));
        assert_eq!(plain.security_class(), None);
    }
}
