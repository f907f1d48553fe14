use core::fmt;

/// 引擎希望在 I/O 上下文之外执行的一次性工作单元。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 昂贵的密码学计算或证书校验不能在 `wrap`/`unwrap` 中阻塞 I/O 线程；
///   引擎把这类工作显式交给驱动器，由驱动器决定在哪个执行器上运行；
/// - 以“显式工作项”替代隐式阻塞，是整个引擎模型唯一的挂起点。
///
/// ## 契约（What）
/// - 闭包无参数、无返回值，结果通过引擎内部共享的槽位被吸收；驱动器不检查其产出；
/// - [`run`](Self::run) 消费 `self`，因此同一任务在类型层面只能执行一次；
/// - `label` 为静态字符串，仅用于日志与诊断。
///
/// ## 风险提示（Trade-offs）
/// - 任务内部 panic 会沿执行器传播；[`BlockingExecutor`](crate::BlockingExecutor) 会把它
///   映射为 `spark.engine.task.panicked` 协议错误。
pub struct DelegatedTask {
    label: &'static str,
    work: Box<dyn FnOnce() + Send + 'static>,
}

impl DelegatedTask {
    pub fn new<F>(label: &'static str, work: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            label,
            work: Box::new(work),
        }
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    pub fn run(self) {
        (self.work)()
    }
}

impl fmt::Debug for DelegatedTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DelegatedTask")
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    use super::*;

    #[test]
    fn runs_exactly_once() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let task = DelegatedTask::new("count", move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(task.label(), "count");
        assert!(format!("{task:?}").contains("count"));
        task.run();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
