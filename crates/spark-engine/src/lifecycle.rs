use core::fmt;

use crate::error::{EngineError, codes};

/// 引擎生命周期阶段。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LifecycleState {
    /// 已构造、尚未调用 `init()`。
    Created,
    /// `init()` 已完成，可以握手与变换。
    Active,
    /// `cleanup()` 已调用，之后任何调用都非法。
    CleanedUp,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LifecycleState::Created => "created",
            LifecycleState::Active => "active",
            LifecycleState::CleanedUp => "cleaned_up",
        })
    }
}

/// 具体引擎共用的生命周期守卫。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - “`init()` 之前调用”“重复 `init()`”“`cleanup()` 之后调用”都是驱动器缺陷，
///   各引擎若自行判断容易遗漏分支；集中在守卫中统一生成 `IllegalState` 错误；
/// - 守卫只管阶段，不持有任何协议状态，因此可以嵌入任意引擎结构体。
///
/// ## 契约（What）
/// - [`activate`](Self::activate)：`Created → Active`，其余阶段返回错误；
/// - [`ensure_active`](Self::ensure_active)：仅 `Active` 放行，错误中记录触发的操作名；
/// - [`retire`](Self::retire)：幂等地进入 `CleanedUp`，返回此前是否处于 `Active`。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Lifecycle {
    state: LifecycleState,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub const fn new() -> Self {
        Self {
            state: LifecycleState::Created,
        }
    }

    pub const fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == LifecycleState::Active
    }

    pub fn activate(&mut self) -> Result<(), EngineError> {
        match self.state {
            LifecycleState::Created => {
                self.state = LifecycleState::Active;
                Ok(())
            }
            LifecycleState::Active => Err(illegal(codes::ILLEGAL_REINIT, "init", self.state)),
            LifecycleState::CleanedUp => {
                Err(illegal(codes::ILLEGAL_AFTER_CLEANUP, "init", self.state))
            }
        }
    }

    pub fn ensure_active(&self, operation: &'static str) -> Result<(), EngineError> {
        match self.state {
            LifecycleState::Active => Ok(()),
            LifecycleState::Created => Err(illegal(codes::ILLEGAL_BEFORE_INIT, operation, self.state)),
            LifecycleState::CleanedUp => {
                Err(illegal(codes::ILLEGAL_AFTER_CLEANUP, operation, self.state))
            }
        }
    }

    pub fn retire(&mut self) -> bool {
        let was_active = self.is_active();
        self.state = LifecycleState::CleanedUp;
        was_active
    }
}

fn illegal(code: &'static str, operation: &'static str, state: LifecycleState) -> EngineError {
    EngineError::IllegalState {
        code,
        operation,
        state,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn guards_every_phase() {
        let mut lifecycle = Lifecycle::new();
        let err = lifecycle.ensure_active("wrap").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IllegalState);
        assert_eq!(err.code(), codes::ILLEGAL_BEFORE_INIT);

        lifecycle.activate().unwrap();
        assert!(lifecycle.ensure_active("wrap").is_ok());
        assert_eq!(lifecycle.activate().unwrap_err().code(), codes::ILLEGAL_REINIT);

        assert!(lifecycle.retire());
        assert!(!lifecycle.retire());
        let err = lifecycle.ensure_active("unwrap").unwrap_err();
        assert_eq!(err.code(), codes::ILLEGAL_AFTER_CLEANUP);
        assert_eq!(
            err.to_string(),
            "[spark.engine.illegal.after_cleanup] `unwrap` is illegal while the engine is cleaned_up"
        );
    }
}
