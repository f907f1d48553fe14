/// 引擎给出的缓冲区尺寸提示。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 驱动器在首次 `wrap`/`unwrap` 之前只依赖这四个值预分配应用侧与网络侧缓冲区；
/// - 上限用于约束 `BUFFER_OVERFLOW` 时的扩容，防止异常对端诱导无限增长。
///
/// ## 契约（What）
/// - 引擎生命周期内保持不变；
/// - 构造时归一化：若 `max < min`，则把 `max` 抬升到 `min`；`min` 至少为 1。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BufferSizing {
    min_application: usize,
    max_application: usize,
    min_network: usize,
    max_network: usize,
}

impl BufferSizing {
    pub fn new(
        min_application: usize,
        max_application: usize,
        min_network: usize,
        max_network: usize,
    ) -> Self {
        let min_application = min_application.max(1);
        let min_network = min_network.max(1);
        Self {
            min_application,
            max_application: max_application.max(min_application),
            min_network,
            max_network: max_network.max(min_network),
        }
    }

    pub const fn min_application(&self) -> usize {
        self.min_application
    }

    pub const fn max_application(&self) -> usize {
        self.max_application
    }

    pub const fn min_network(&self) -> usize {
        self.min_network
    }

    pub const fn max_network(&self) -> usize {
        self.max_network
    }
}
