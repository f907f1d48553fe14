#![deny(unsafe_code)]
#![doc = r#"
# spark-engine

## 设计动机（Why）
- **协议与 I/O 解耦**：会话的 I/O 循环把全部握手、记录保护、包保护交给可插拔的 [`Engine`]，
  自身从不阻塞，也不理解协议内部细节；
- **显式挂起点**：昂贵计算通过 [`DelegatedTask`] 交给驱动器选择的 [`TaskExecutor`]，
  定时事件通过 [`Engine::timer`] 投递，引擎内部没有隐藏的阻塞或异步调用；
- **可诊断的错误**：[`EngineError`] 把参数校验、协议失败、安全事件与非法调用分为四类，
  每个错误都带稳定错误码。

## 核心契约（What）
- [`EngineResult`]、[`Status`]、[`HandshakeStatus`]：单次变换的结果与握手状态机；
- [`Engine`]：`init → begin_handshake → wrap/unwrap/任务/定时 → close_* → cleanup` 的完整生命周期；
- [`EngineDriver`]（`runtime-tokio` 特性）：在 Tokio 传输上解释结果、执行任务、扩容缓冲区；
- [`PassthroughEngine`]：不做任何变换的明文引擎，也是驱动器的最小测试替身。

## 实现策略（How）
- 引擎只借用调用方的切片，结果中的消费/产出计数决定调用方如何推进游标；
- 生命周期守卫 [`Lifecycle`] 统一生成 `IllegalState` 错误，具体引擎只需嵌入；
- `tck` 特性提供内存回环泵，供各引擎 crate 的测试复用同一组契约断言。

## 风险与考量（Trade-offs）
- 驱动器在溢出时最多把缓冲区扩到引擎给出的上限，异常引擎会得到 `spark.engine.driver.buffer_limit`；
- 驱动器不做任何重试，重连等策略属于会话层。
"#]

mod config;
#[cfg(feature = "runtime-tokio")]
mod driver;
mod engine;
pub mod error;
mod executor;
mod lifecycle;
mod passthrough;
mod result;
mod sizing;
mod status;
mod task;
#[cfg(feature = "tck")]
pub mod tck;
mod timer;

pub use config::{ConfigError, DriverConfig, defaults};
#[cfg(feature = "runtime-tokio")]
pub use driver::{EngineDriver, NoopSessionObserver, RecvOutcome, SessionObserver};
pub use engine::{Engine, gather, total_len};
pub use error::{
    EngineError, ErrorKind, IncidentClass, IncidentReport, SecurityClass, ValidationError,
};
#[cfg(feature = "runtime-tokio")]
pub use executor::BlockingExecutor;
pub use executor::{InlineExecutor, TaskExecutor};
pub use lifecycle::{Lifecycle, LifecycleState};
pub use passthrough::{DEFAULT_CHUNK_SIZE, PassthroughEngine};
pub use result::EngineResult;
pub use sizing::BufferSizing;
pub use status::{HandshakeStatus, Status};
pub use task::DelegatedTask;
pub use timer::{TimerKey, TimerValue};
