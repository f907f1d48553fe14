#![deny(unsafe_code)]
#![doc = r#"
# spark-engine-tls

## 教案级概览

- **定位（Why）**：把 `rustls` 的无 I/O 连接状态机适配为 `spark-engine` 的 [`Engine`](spark_engine::Engine)
  契约，驱动器无需感知 TLS 细节即可完成握手、加解密与 close_notify 关闭；
- **结构（How）**：
  - [`TlsEngine`]：客户端或服务端引擎，按记录边界逐条吃进密文；
  - [`TlsEngineFactory`]：以 `ArcSwapOption` 保存客户端/服务端配置，证书轮换对新会话即时生效；
  - [`error`]：`rustls::Error` 与 TLS Alert 到 [`SecurityClass`](spark_engine::SecurityClass) 的映射；
- **契约（What）**：握手完成只报告一次 `Finished`；缺少 close_notify 的入站结束是截断事件；
  所有错误携带 `spark.engine.tls.*` 稳定错误码。
"#]

mod engine;
pub mod error;
mod factory;
pub mod framing;

pub use engine::TlsEngine;
pub use factory::TlsEngineFactory;
