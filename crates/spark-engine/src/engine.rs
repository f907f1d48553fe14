use crate::{
    error::EngineError,
    result::EngineResult,
    sizing::BufferSizing,
    status::HandshakeStatus,
    task::DelegatedTask,
    timer::{TimerKey, TimerValue},
};

/// 可插拔的非阻塞协议引擎契约。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 会话 I/O 循环把全部密码学/协议处理（TLS 类握手、QUIC 包保护、记录变换）委托给引擎，
///   自身既不阻塞也不理解协议细节；
/// - 具体引擎（明文直通、记录层、TLS、QUIC）在会话构造时选定并可互换，驱动器只面向本 trait。
///
/// ## 架构定位（Where）
/// - 引擎不持有传输层引用，只变换调用方借给它的缓冲区；
/// - 借用切片的生命周期止于调用返回，引擎无法在返回后保留对缓冲区的引用；
///   调用方依据结果中的消费/产出计数推进自己的游标。
///
/// ## 契约（What）
/// - `init` 恰好调用一次，早于其余操作；`cleanup` 是终结调用，之后任何操作返回 `IllegalState`；
/// - `wrap_vectored` 按顺序把多个源视为拼接后的整体，要么产出一个完整协议单元，要么不消费任何字节；
///   目标放不下下一个单元时返回 `BufferOverflow`，调用方扩容或清空目标后以相同源重试；
/// - `unwrap` 在源不足一个完整单元时返回 `BufferUnderflow` 且不消费字节；
/// - `handshake_status` 为只读查询，不改变引擎状态；
/// - `delegated_task` 在没有待执行任务时返回 `None` 且无副作用；
/// - `close_outbound` 幂等；`close_inbound` 在对端未完成关闭握手时返回事件类错误
///   （[`EngineError::Incident`]），以便调用方走独立的安全事件路径；
/// - `timer` 的两个参数都可缺省，缺省调用必须成功；
/// - 四个尺寸提示在引擎生命周期内保持稳定。
///
/// ## 并发（Concurrency）
/// - 同一实例的公开操作从不并发调用；`Send` 约束允许驱动器在线程间迁移整个会话。
///
/// ## 状态机（How）
/// `NotHandshaking → (begin_handshake) → NeedWrap | NeedUnwrap → … → NeedTask → (任务执行)
/// → NeedWrap | NeedUnwrap → Finished → NotHandshaking`。`Finished` 只出现在完成握手的那次
/// 变换结果中。
pub trait Engine: Send {
    /// 日志中使用的协议名。
    fn protocol(&self) -> &'static str {
        "engine"
    }

    fn init(&mut self) -> Result<(), EngineError>;

    /// 启动（或重新启动）协商。
    fn begin_handshake(&mut self) -> Result<(), EngineError>;

    fn wrap_vectored(
        &mut self,
        sources: &[&[u8]],
        destination: &mut [u8],
    ) -> Result<EngineResult, EngineError>;

    fn wrap(&mut self, source: &[u8], destination: &mut [u8]) -> Result<EngineResult, EngineError> {
        self.wrap_vectored(&[source], destination)
    }

    fn unwrap(&mut self, source: &[u8], destination: &mut [u8])
    -> Result<EngineResult, EngineError>;

    fn handshake_status(&self) -> HandshakeStatus;

    fn delegated_task(&mut self) -> Option<DelegatedTask>;

    fn is_outbound_done(&self) -> bool;

    fn is_inbound_done(&self) -> bool;

    /// 两个方向都关闭即视为完全关闭。
    fn is_closed(&self) -> bool {
        self.is_outbound_done() && self.is_inbound_done()
    }

    fn close_outbound(&mut self) -> Result<(), EngineError>;

    fn close_inbound(&mut self) -> Result<(), EngineError>;

    fn buffer_sizing(&self) -> BufferSizing;

    fn min_application_buffer_size(&self) -> usize {
        self.buffer_sizing().min_application()
    }

    fn max_application_buffer_size(&self) -> usize {
        self.buffer_sizing().max_application()
    }

    fn min_network_buffer_size(&self) -> usize {
        self.buffer_sizing().min_network()
    }

    fn max_network_buffer_size(&self) -> usize {
        self.buffer_sizing().max_network()
    }

    fn timer(&mut self, key: Option<TimerKey>, value: Option<TimerValue>)
    -> Result<(), EngineError>;

    /// 释放全部资源；重复调用无效果。
    fn cleanup(&mut self);
}

impl<E> Engine for Box<E>
where
    E: Engine + ?Sized,
{
    fn protocol(&self) -> &'static str {
        (**self).protocol()
    }

    fn init(&mut self) -> Result<(), EngineError> {
        (**self).init()
    }

    fn begin_handshake(&mut self) -> Result<(), EngineError> {
        (**self).begin_handshake()
    }

    fn wrap_vectored(
        &mut self,
        sources: &[&[u8]],
        destination: &mut [u8],
    ) -> Result<EngineResult, EngineError> {
        (**self).wrap_vectored(sources, destination)
    }

    fn wrap(&mut self, source: &[u8], destination: &mut [u8]) -> Result<EngineResult, EngineError> {
        (**self).wrap(source, destination)
    }

    fn unwrap(
        &mut self,
        source: &[u8],
        destination: &mut [u8],
    ) -> Result<EngineResult, EngineError> {
        (**self).unwrap(source, destination)
    }

    fn handshake_status(&self) -> HandshakeStatus {
        (**self).handshake_status()
    }

    fn delegated_task(&mut self) -> Option<DelegatedTask> {
        (**self).delegated_task()
    }

    fn is_outbound_done(&self) -> bool {
        (**self).is_outbound_done()
    }

    fn is_inbound_done(&self) -> bool {
        (**self).is_inbound_done()
    }

    fn is_closed(&self) -> bool {
        (**self).is_closed()
    }

    fn close_outbound(&mut self) -> Result<(), EngineError> {
        (**self).close_outbound()
    }

    fn close_inbound(&mut self) -> Result<(), EngineError> {
        (**self).close_inbound()
    }

    fn buffer_sizing(&self) -> BufferSizing {
        (**self).buffer_sizing()
    }

    fn timer(
        &mut self,
        key: Option<TimerKey>,
        value: Option<TimerValue>,
    ) -> Result<(), EngineError> {
        (**self).timer(key, value)
    }

    fn cleanup(&mut self) {
        (**self).cleanup()
    }
}

/// 源缓冲区集合的总字节数。
pub fn total_len(sources: &[&[u8]]) -> usize {
    sources.iter().map(|source| source.len()).sum()
}

/// 把多个源缓冲区视为拼接整体，从头开始复制最多 `destination.len()` 字节。
///
/// 返回实际复制的字节数。引擎在 `wrap_vectored` 中用它把分散的应用数据收拢为一个单元。
pub fn gather(sources: &[&[u8]], destination: &mut [u8]) -> usize {
    let mut written = 0;
    for source in sources {
        if written == destination.len() {
            break;
        }
        let take = source.len().min(destination.len() - written);
        destination[written..written + take].copy_from_slice(&source[..take]);
        written += take;
    }
    written
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gather_spans_sources_in_order() {
        let mut out = [0_u8; 5];
        let copied = gather(&[&b"ab"[..], &b""[..], &b"cdef"[..]], &mut out);
        assert_eq!(copied, 5);
        assert_eq!(&out, b"abcde");
        assert_eq!(total_len(&[&b"ab"[..], &b"cdef"[..]]), 6);
    }
}
