use core::fmt;

/// 单次 `wrap`/`unwrap` 调用的变换结果。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 驱动器只依据该枚举决定“继续/扩容/等待更多字节/停止”，无需理解协议细节；
/// - 闭合集合：新增分支意味着所有驱动器都要同步处理，因此不标记 `non_exhaustive`。
///
/// ## 契约（What）
/// - `Ok`：变换成功，字节计数见 [`EngineResult`](crate::EngineResult)；
/// - `Closed`：出站或入站方向已永久关闭；
/// - `BufferOverflow`：目标缓冲区放不下下一个单元，源端不会多消费；
/// - `BufferUnderflow`：源缓冲区尚未包含完整单元，调用方需补足字节后用同一数据重试。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Status {
    Ok,
    Closed,
    BufferOverflow,
    BufferUnderflow,
}

impl Status {
    /// 返回稳定的小写标签，供日志字段使用。
    pub const fn as_str(self) -> &'static str {
        match self {
            Status::Ok => "ok",
            Status::Closed => "closed",
            Status::BufferOverflow => "buffer_overflow",
            Status::BufferUnderflow => "buffer_underflow",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 握手阶段指示，告诉驱动循环引擎下一步需要什么。
///
/// # 契约（What）
/// - `NotHandshaking`：当前没有握手；
/// - `Finished`：握手刚刚完成，只会出现在完成握手的那一次变换结果中，随后的查询返回 `NotHandshaking`；
/// - `NeedWrap` / `NeedUnwrap`：需要产出 / 读入握手数据；
/// - `NeedTask`：引擎排队了委派任务，必须在下一次变换前执行完毕。
///
/// # 状态机（How）
/// `NotHandshaking → NeedWrap | NeedUnwrap → … → NeedTask → NeedWrap | NeedUnwrap → Finished → NotHandshaking`。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HandshakeStatus {
    NotHandshaking,
    Finished,
    NeedWrap,
    NeedUnwrap,
    NeedTask,
}

impl HandshakeStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            HandshakeStatus::NotHandshaking => "not_handshaking",
            HandshakeStatus::Finished => "finished",
            HandshakeStatus::NeedWrap => "need_wrap",
            HandshakeStatus::NeedUnwrap => "need_unwrap",
            HandshakeStatus::NeedTask => "need_task",
        }
    }

    /// 是否仍处于握手进行中（需要驱动器继续推进）。
    pub const fn is_handshaking(self) -> bool {
        matches!(
            self,
            HandshakeStatus::NeedWrap | HandshakeStatus::NeedUnwrap | HandshakeStatus::NeedTask
        )
    }
}

impl fmt::Display for HandshakeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
