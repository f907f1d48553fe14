//! `EngineResult` 构造性质验证。
//!
//! - **Why**：结果值是驱动器决策的唯一依据，构造校验必须对任意合法四元组成功、
//!   对每一种违规给出各自独立的错误；
//! - **How**：用 proptest 枚举状态组合与计数，分别断言成功路径与四类失败路径。

use proptest::prelude::*;
use spark_engine::{EngineResult, ErrorKind, EngineError, HandshakeStatus, Status, ValidationError};

fn any_status() -> impl Strategy<Value = Status> {
    prop_oneof![
        Just(Status::Ok),
        Just(Status::Closed),
        Just(Status::BufferOverflow),
        Just(Status::BufferUnderflow),
    ]
}

fn any_handshake() -> impl Strategy<Value = HandshakeStatus> {
    prop_oneof![
        Just(HandshakeStatus::NotHandshaking),
        Just(HandshakeStatus::Finished),
        Just(HandshakeStatus::NeedWrap),
        Just(HandshakeStatus::NeedUnwrap),
        Just(HandshakeStatus::NeedTask),
    ]
}

proptest! {
    #[test]
    fn valid_parts_round_trip_through_accessors(
        status in any_status(),
        handshake in any_handshake(),
        consumed in 0_i64..=i64::from(u32::MAX),
        produced in 0_i64..=i64::from(u32::MAX),
    ) {
        let result = EngineResult::try_from_parts(Some(status), Some(handshake), consumed, produced)
            .expect("valid parts must construct");
        prop_assert_eq!(result.status(), status);
        prop_assert_eq!(result.handshake_status(), handshake);
        prop_assert_eq!(result.bytes_consumed() as i64, consumed);
        prop_assert_eq!(result.bytes_produced() as i64, produced);
        prop_assert_eq!(
            result,
            EngineResult::new(status, handshake, consumed as usize, produced as usize)
        );
    }

    #[test]
    fn negative_counts_are_reported_per_field(
        status in any_status(),
        handshake in any_handshake(),
        negative in i64::MIN..0_i64,
        positive in 0_i64..1024,
    ) {
        let err = EngineResult::try_from_parts(Some(status), Some(handshake), negative, positive)
            .unwrap_err();
        prop_assert_eq!(err, ValidationError::NegativeBytesConsumed(negative));

        let err = EngineResult::try_from_parts(Some(status), Some(handshake), positive, negative)
            .unwrap_err();
        prop_assert_eq!(err, ValidationError::NegativeBytesProduced(negative));
    }

    #[test]
    fn absent_enums_are_reported_per_field(
        status in any_status(),
        consumed in 0_i64..1024,
        produced in 0_i64..1024,
    ) {
        let err = EngineResult::try_from_parts(None, Some(HandshakeStatus::NeedWrap), consumed, produced)
            .unwrap_err();
        prop_assert_eq!(err, ValidationError::StatusMissing);

        let err = EngineResult::try_from_parts(Some(status), None, consumed, produced).unwrap_err();
        prop_assert_eq!(err, ValidationError::HandshakeStatusMissing);
    }
}

#[test]
fn every_violation_has_a_distinct_code() {
    let errors = [
        ValidationError::StatusMissing,
        ValidationError::HandshakeStatusMissing,
        ValidationError::NegativeBytesConsumed(-1),
        ValidationError::NegativeBytesProduced(-1),
        ValidationError::BytesConsumedOutOfRange(i64::MAX),
        ValidationError::BytesProducedOutOfRange(i64::MAX),
    ];
    let mut codes: Vec<_> = errors.iter().map(ValidationError::code).collect();
    codes.sort_unstable();
    codes.dedup();
    assert_eq!(codes.len(), errors.len());

    let wrapped = EngineError::from(ValidationError::StatusMissing);
    assert_eq!(wrapped.kind(), ErrorKind::Validation);
    assert!(!wrapped.is_recoverable());
}
