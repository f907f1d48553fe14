#![deny(unsafe_code)]
#![doc = r#"
# spark-engine-record

## 设计动机（Why）
- **完整的参考引擎**：以预共享密钥完成握手、以摘要标签保护记录、以认证关闭记录结束会话，
  覆盖引擎契约的每一个分支（委派任务、溢出、欠载、截断事件）；
- **可复用积木**：[`handshake`] 状态机与 [`protect`] 标签函数不关心封帧，QUIC 类引擎直接复用。

## 核心契约（What）
- [`RecordEngine`]：客户端/服务端角色，实现 [`spark_engine::Engine`]；
- [`RecordConfig`]：口令、派生迭代次数与单记录上限，可从 TOML 加载；
- 线格式：`type u8 | length u16 BE | body`，类型为 hello(0x16)、finished(0x14)、data(0x17)、close(0x15)。

## 风险与考量（Trade-offs）
- 标签只提供完整性与认证，不提供保密性；需要保密性的部署应选用 TLS 引擎；
- 迭代派生的成本由 `kdf_rounds` 决定，默认值足以让驱动器的委派路径在测试中真实发生。
"#]

mod config;
mod engine;
pub mod error;
pub mod handshake;
pub mod nonce;
pub mod protect;
pub mod wire;

pub use config::{DEFAULT_KDF_ROUNDS, DEFAULT_MAX_FRAGMENT, RecordConfig};
pub use engine::{RECORD_OVERHEAD, RecordEngine};
pub use handshake::Role;
