#![deny(unsafe_code)]
#![doc = r#"
# spark-engine-quic

## 教案级概览

- **定位（Why）**：QUIC 类引擎在引擎契约之外多了一个内部协作者，即拥塞控制器；本 crate 给出控制器、
  观测它的度量钩子，以及驱动二者的数据报引擎；
- **结构（How）**：
  - [`metrics`]：七个回调的 [`CongestionMetrics`] 钩子、不可变的 [`QuicMetrics`] 度量包、构建器与全进程共享的默认实例；
  - [`congestion`]：[`CongestionController`] 策略接口与 [`NewReno`] 实现，每次状态变化都经钩子报告；
  - [`recovery`] / [`rtt`]：按包号空间登记已发送包，按包号阈值与时间阈值判定丢包，估计往返时延；
  - [`QuicEngine`]：复用记录层握手状态机与标签函数的数据报引擎，数据受拥塞窗口约束；
  - [`clock`]：可注入时钟，测试中以 [`ManualClock`] 驱动丢包定时器；
- **契约（What）**：钩子只观察不修改，同步调用；未配置任何度量组件时引擎共享同一个默认度量包。
"#]

pub mod clock;
mod config;
pub mod congestion;
mod engine;
pub mod error;
pub mod metrics;
pub mod packet;
pub mod recovery;
pub mod rtt;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    DEFAULT_IDLE_TIMEOUT_MS, DEFAULT_INITIAL_RTT_MS, DEFAULT_MAX_ACK_DELAY_MS,
    DEFAULT_MAX_DATAGRAM_SIZE, QuicConfig,
};
pub use congestion::{CongestionController, NewReno};
pub use engine::{HANDSHAKE_PACKET_LEN, QuicEngine};
pub use metrics::{
    CongestionEvent, CongestionEventKind, CongestionMetrics, CongestionPhase, CongestionState,
    NoopCongestionMetrics, QuicMetrics, QuicMetricsBuilder, RecordingCongestionMetrics,
};
pub use recovery::PacketSpace;
pub use rtt::RttEstimator;
pub use spark_engine_record::Role;
