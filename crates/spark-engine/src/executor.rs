use std::panic::{self, AssertUnwindSafe};

use futures::future::{self, BoxFuture, FutureExt};
use tracing::{debug, warn};

use crate::{
    error::{EngineError, codes},
    task::DelegatedTask,
};

/// 委派任务的执行器。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 驱动器只负责“拿到任务 → 交给执行器 → 等待完成”，至于在当前线程还是阻塞线程池上运行，
///   由部署方注入的执行器决定；
/// - 返回 `BoxFuture` 让 trait 保持对象安全，驱动器可以持有 `Arc<dyn TaskExecutor>`。
///
/// ## 契约（What）
/// - 返回的 future 完成时任务已经执行完毕，驱动器随后才会发起下一次变换；
/// - 任务 panic 映射为 `spark.engine.task.panicked` 协议错误，不会跨越执行器边界展开。
pub trait TaskExecutor: Send + Sync {
    fn execute(&self, task: DelegatedTask) -> BoxFuture<'static, Result<(), EngineError>>;
}

impl<X> TaskExecutor for std::sync::Arc<X>
where
    X: TaskExecutor + ?Sized,
{
    fn execute(&self, task: DelegatedTask) -> BoxFuture<'static, Result<(), EngineError>> {
        (**self).execute(task)
    }
}

/// 在调用上下文中同步执行任务。
///
/// 适用于任务本身很廉价、或测试中需要确定性顺序的场景。
#[derive(Clone, Copy, Debug, Default)]
pub struct InlineExecutor;

impl TaskExecutor for InlineExecutor {
    fn execute(&self, task: DelegatedTask) -> BoxFuture<'static, Result<(), EngineError>> {
        let label = task.label();
        debug!(task = label, "running delegated task inline");
        let outcome = panic::catch_unwind(AssertUnwindSafe(move || task.run()))
            .map_err(|_| panicked(label));
        future::ready(outcome).boxed()
    }
}

/// 把任务交给 Tokio 阻塞线程池执行。
#[cfg(feature = "runtime-tokio")]
#[derive(Clone, Debug, Default)]
pub struct BlockingExecutor {
    handle: Option<tokio::runtime::Handle>,
}

#[cfg(feature = "runtime-tokio")]
impl BlockingExecutor {
    /// 使用调用 `execute` 时所在的运行时。
    pub fn new() -> Self {
        Self { handle: None }
    }

    /// 固定使用给定运行时的阻塞线程池。
    pub fn with_handle(handle: tokio::runtime::Handle) -> Self {
        Self {
            handle: Some(handle),
        }
    }
}

#[cfg(feature = "runtime-tokio")]
impl TaskExecutor for BlockingExecutor {
    fn execute(&self, task: DelegatedTask) -> BoxFuture<'static, Result<(), EngineError>> {
        let handle = self.handle.clone();
        async move {
            let label = task.label();
            debug!(task = label, "dispatching delegated task to blocking pool");
            let joined = match handle {
                Some(handle) => handle.spawn_blocking(move || task.run()).await,
                None => tokio::task::spawn_blocking(move || task.run()).await,
            };
            joined.map_err(|err| {
                if err.is_panic() {
                    panicked(label)
                } else {
                    EngineError::protocol(codes::TASK_PANICKED, "delegated task was cancelled")
                        .with_source(err)
                }
            })
        }
        .boxed()
    }
}

fn panicked(label: &'static str) -> EngineError {
    warn!(task = label, "delegated task panicked");
    EngineError::protocol(
        codes::TASK_PANICKED,
        format!("delegated task `{label}` panicked"),
    )
}
