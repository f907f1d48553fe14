use std::{fmt, sync::Arc};

use arc_swap::ArcSwapOption;
use rustls::{ClientConfig, ServerConfig};
use rustls_pki_types::ServerName;
use spark_engine::EngineError;
use tracing::debug;

use crate::{engine::TlsEngine, error::codes};

/// 支持证书热更的 TLS 引擎工厂。
///
/// # 设计动机（Why）
/// - **零中断目标**：证书轮换时不应暂停会话创建；把客户端与服务端配置各自放进 `ArcSwapOption`，
///   写入为常数时间，读取全程无锁；
/// - **架构角色**：位于会话构造路径与证书管理子系统之间，每次创建引擎都读取一次最新配置快照。
///
/// # 核心契约（What）
/// - 克隆共享同一组配置槽，任一克隆上的 `replace_*` 对所有克隆后续创建的引擎可见；
/// - 已创建的引擎持有旧配置的 `Arc`，轮换不影响进行中的会话；
/// - 未配置对应角色时，创建引擎返回 `spark.engine.tls.factory_unconfigured` 协议错误。
///
/// # 风险提示（Trade-offs & Gotchas）
/// - 高频轮换会暂存多个配置快照，内存峰值需结合并发会话数评估。
#[derive(Clone, Default)]
pub struct TlsEngineFactory {
    slots: Arc<ConfigSlots>,
}

#[derive(Default)]
struct ConfigSlots {
    client: ArcSwapOption<ClientConfig>,
    server: ArcSwapOption<ServerConfig>,
}

impl TlsEngineFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client_config(self, config: Arc<ClientConfig>) -> Self {
        self.slots.client.store(Some(config));
        self
    }

    pub fn with_server_config(self, config: Arc<ServerConfig>) -> Self {
        self.slots.server.store(Some(config));
        self
    }

    /// 当前客户端配置快照。
    pub fn client_config(&self) -> Option<Arc<ClientConfig>> {
        self.slots.client.load_full()
    }

    pub fn server_config(&self) -> Option<Arc<ServerConfig>> {
        self.slots.server.load_full()
    }

    /// 原子替换客户端配置，返回旧值以便调用方审计或回收。
    pub fn replace_client_config(&self, next: Arc<ClientConfig>) -> Option<Arc<ClientConfig>> {
        debug!("rotating tls client config");
        self.slots.client.swap(Some(next))
    }

    /// 原子替换服务端配置，返回旧值。
    pub fn replace_server_config(&self, next: Arc<ServerConfig>) -> Option<Arc<ServerConfig>> {
        debug!("rotating tls server config");
        self.slots.server.swap(Some(next))
    }

    /// 以最新客户端配置创建引擎。
    pub fn client_engine(&self, server_name: ServerName<'static>) -> Result<TlsEngine, EngineError> {
        let config = self.client_config().ok_or_else(|| unconfigured("client"))?;
        TlsEngine::client(config, server_name)
    }

    /// 以最新服务端配置创建引擎。
    pub fn server_engine(&self) -> Result<TlsEngine, EngineError> {
        let config = self.server_config().ok_or_else(|| unconfigured("server"))?;
        TlsEngine::server(config)
    }
}

impl fmt::Debug for TlsEngineFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsEngineFactory")
            .field("client", &self.slots.client.load().is_some())
            .field("server", &self.slots.server.load().is_some())
            .finish()
    }
}

fn unconfigured(role: &'static str) -> EngineError {
    EngineError::protocol(
        codes::FACTORY_UNCONFIGURED,
        format!("no tls {role} config has been installed"),
    )
}
