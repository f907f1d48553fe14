use std::{io, sync::Arc};

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace, warn};

use crate::{
    config::DriverConfig,
    engine::Engine,
    error::{EngineError, IncidentReport, codes},
    executor::TaskExecutor,
    result::EngineResult,
    status::{HandshakeStatus, Status},
    timer::{TimerKey, TimerValue},
};

/// 会话层对驱动器事件的观察接口。
///
/// 所有回调默认空实现，并在驱动器所在的 I/O 上下文中同步调用，实现方不得阻塞。
pub trait SessionObserver: Send + Sync {
    /// 握手完成，应用数据可以开始流动。
    fn on_handshake_finished(&self, _session: &str, _protocol: &'static str) {}

    /// 入站方向已按协议关闭。
    fn on_closed(&self, _session: &str) {}

    /// 引擎报告了安全事件；返回给调用方的错误中携带同一份报告。
    fn on_incident(&self, _session: &str, _report: &IncidentReport) {}
}

/// 不做任何事的观察者。
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopSessionObserver;

impl SessionObserver for NoopSessionObserver {}

/// 一次 `recv` 的产出。
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RecvOutcome {
    Data(Bytes),
    Closed,
}

/// 把引擎与异步传输粘合在一起的驱动循环。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 引擎只会变换缓冲区，驱动器负责其余一切：读写传输、解释 `EngineResult`、执行委派任务、
///   投递定时事件、在溢出时排空或扩容缓冲区；
/// - 会话层面向 `handshake/send/recv/shutdown` 这组异步方法，不必了解任何握手细节。
///
/// ## 契约（What）
/// - 构造时调用一次 `engine.init()`，并按引擎的尺寸提示预分配网络/应用缓冲区；
/// - 委派任务完成之前绝不发起下一次 `wrap`/`unwrap`；
/// - `BufferOverflow`：若网络出站缓冲区仍有待写字节则先写出，否则按
///   `buffer_growth_factor` 扩容，超过引擎上限时返回 `spark.engine.driver.buffer_limit`；
/// - `BufferUnderflow`：先写出待发送字节，再从传输读取更多数据后重试同一批字节；
/// - 传输读到 EOF 时调用 `close_inbound()`，事件类错误先通知观察者再返回；
/// - 驱动器自身从不重试失败的引擎调用。
///
/// ## 缓冲区布局（How）
/// - `net_in`：已读入、尚未被 `unwrap` 消费的网络字节，消费多少就 `advance` 多少；
/// - `net_out`：`wrap` 产出、尚未写到传输的网络字节，容量上限为 `net_capacity`；
/// - `app_in`：`unwrap` 解出、尚未交给调用方的应用字节。
pub struct EngineDriver<E, T, X> {
    engine: E,
    transport: T,
    executor: X,
    observer: Arc<dyn SessionObserver>,
    config: DriverConfig,
    net_in: BytesMut,
    net_out: BytesMut,
    app_in: BytesMut,
    net_capacity: usize,
    app_capacity: usize,
    transport_eof: bool,
    established: bool,
    closed_notified: bool,
}

impl<E, T, X> EngineDriver<E, T, X>
where
    E: Engine,
    T: AsyncRead + AsyncWrite + Unpin,
    X: TaskExecutor,
{
    pub fn new(
        mut engine: E,
        transport: T,
        executor: X,
        config: DriverConfig,
    ) -> Result<Self, EngineError> {
        config.validate().map_err(|err| {
            EngineError::protocol(codes::DRIVER_CONFIG, "invalid driver configuration")
                .with_source(err)
        })?;
        engine.init()?;
        let sizing = engine.buffer_sizing();
        debug!(
            session = %config.session_label,
            protocol = engine.protocol(),
            min_network = sizing.min_network(),
            min_application = sizing.min_application(),
            "engine driver initialised"
        );
        Ok(Self {
            engine,
            transport,
            executor,
            observer: Arc::new(NoopSessionObserver),
            net_in: BytesMut::with_capacity(sizing.min_network()),
            net_out: BytesMut::with_capacity(sizing.min_network()),
            app_in: BytesMut::with_capacity(sizing.min_application()),
            net_capacity: sizing.min_network(),
            app_capacity: sizing.min_application(),
            config,
            transport_eof: false,
            established: false,
            closed_notified: false,
        })
    }

    pub fn with_observer(mut self, observer: Arc<dyn SessionObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut E {
        &mut self.engine
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    pub fn is_established(&self) -> bool {
        self.established
    }

    /// 当前网络出站缓冲区的容量上限，随溢出扩容而增长。
    pub fn network_capacity(&self) -> usize {
        self.net_capacity
    }

    /// 推进握手直到引擎报告 `Finished` 或 `NotHandshaking`。
    pub async fn handshake(&mut self) -> Result<(), EngineError> {
        self.engine.begin_handshake()?;
        let mut steps = 0;
        loop {
            steps += 1;
            if steps > self.config.max_handshake_steps {
                return Err(EngineError::protocol(
                    codes::DRIVER_STALLED,
                    format!(
                        "handshake did not settle within {} steps",
                        self.config.max_handshake_steps
                    ),
                ));
            }
            let status = self.engine.handshake_status();
            trace!(session = %self.config.session_label, step = steps, handshake = %status, "handshake step");
            match status {
                HandshakeStatus::NeedTask => self.run_tasks().await?,
                HandshakeStatus::NeedWrap => {
                    let result = self.wrap_once(&[]).await?;
                    self.flush().await?;
                    if result.is_finished() {
                        self.mark_established();
                        return Ok(());
                    }
                    if result.is_closed() && result.bytes_produced() == 0 {
                        return Err(closed_error("engine closed during handshake"));
                    }
                }
                HandshakeStatus::NeedUnwrap => {
                    let result = self.unwrap_once()?;
                    if result.is_finished() {
                        self.flush().await?;
                        self.mark_established();
                        return Ok(());
                    }
                    match result.status() {
                        Status::Closed => {
                            self.flush().await?;
                            return Err(closed_error("peer closed during handshake"));
                        }
                        Status::BufferUnderflow => {
                            self.flush().await?;
                            if !self.read_more().await? {
                                self.handle_eof()?;
                                return Err(closed_error("transport ended during handshake"));
                            }
                        }
                        Status::Ok if result.is_idle() => {
                            self.flush().await?;
                            if !self.read_more().await? {
                                self.handle_eof()?;
                                return Err(closed_error("transport ended during handshake"));
                            }
                        }
                        _ => {}
                    }
                }
                HandshakeStatus::NotHandshaking | HandshakeStatus::Finished => {
                    self.flush().await?;
                    self.mark_established();
                    return Ok(());
                }
            }
        }
    }

    /// 加密并写出全部应用数据。
    pub async fn send(&mut self, data: &[u8]) -> Result<(), EngineError> {
        let mut offset = 0;
        let mut idle_rounds = 0;
        while offset < data.len() {
            let result = self.wrap_once(&[&data[offset..]]).await?;
            if result.is_closed() {
                return Err(closed_error("outbound direction is closed"));
            }
            offset += result.bytes_consumed();
            self.follow_up(result).await?;
            if result.bytes_consumed() > 0 || result.bytes_produced() > 0 {
                idle_rounds = 0;
                continue;
            }
            // 引擎暂时不接收数据（例如拥塞窗口已满），先写出再读入对端反馈。
            idle_rounds += 1;
            if idle_rounds > self.config.max_handshake_steps {
                return Err(EngineError::protocol(
                    codes::DRIVER_STALLED,
                    "engine refused application data",
                ));
            }
            self.flush().await?;
            if !self.pump_inbound().await? {
                return Err(closed_error("transport ended while sending"));
            }
        }
        self.flush().await
    }

    /// 读取下一段应用数据；对端按协议关闭后返回 [`RecvOutcome::Closed`]。
    pub async fn recv(&mut self) -> Result<RecvOutcome, EngineError> {
        loop {
            if !self.app_in.is_empty() {
                return Ok(RecvOutcome::Data(self.app_in.split().freeze()));
            }
            if self.engine.is_inbound_done() {
                self.flush().await?;
                self.notify_closed();
                return Ok(RecvOutcome::Closed);
            }
            if !self.pump_inbound().await? {
                return Ok(RecvOutcome::Closed);
            }
        }
    }

    /// 向引擎投递定时事件，并写出引擎因此产生的数据。
    pub async fn fire_timer(
        &mut self,
        key: Option<TimerKey>,
        value: Option<TimerValue>,
    ) -> Result<(), EngineError> {
        debug!(session = %self.config.session_label, timer = ?key, "firing engine timer");
        self.engine.timer(key, value)?;
        self.drain_outbound().await?;
        self.flush().await
    }

    /// 优雅关闭出站方向：通知引擎、写出关闭消息，再关闭传输写端。
    pub async fn shutdown(&mut self) -> Result<(), EngineError> {
        self.engine.close_outbound()?;
        self.drain_outbound().await?;
        self.flush().await?;
        self.transport.shutdown().await.map_err(io_error)?;
        debug!(session = %self.config.session_label, "outbound shut down");
        Ok(())
    }

    /// 释放引擎并交还传输。
    pub fn close(mut self) -> T {
        self.engine.cleanup();
        debug!(session = %self.config.session_label, "engine driver closed");
        self.transport
    }

    async fn wrap_once(&mut self, sources: &[&[u8]]) -> Result<EngineResult, EngineError> {
        loop {
            let start = self.net_out.len();
            let room = self.net_capacity.saturating_sub(start);
            self.net_out.resize(start + room, 0);
            let outcome = self
                .engine
                .wrap_vectored(sources, &mut self.net_out[start..]);
            let produced = outcome.as_ref().map_or(0, EngineResult::bytes_produced);
            self.net_out.truncate(start + produced);
            let result = outcome?;
            trace!(session = %self.config.session_label, %result, "wrap");
            if result.status() != Status::BufferOverflow {
                return Ok(result);
            }
            if !self.net_out.is_empty() {
                self.flush().await?;
            } else {
                self.net_capacity = self.grow(self.net_capacity, self.engine.max_network_buffer_size())?;
            }
        }
    }

    fn unwrap_once(&mut self) -> Result<EngineResult, EngineError> {
        loop {
            let start = self.app_in.len();
            self.app_in.resize(start + self.app_capacity, 0);
            let outcome = self.engine.unwrap(&self.net_in, &mut self.app_in[start..]);
            let (consumed, produced) = outcome
                .as_ref()
                .map_or((0, 0), |result| (result.bytes_consumed(), result.bytes_produced()));
            self.app_in.truncate(start + produced);
            self.net_in.advance(consumed);
            let result = match outcome {
                Ok(result) => result,
                Err(err) => return Err(self.report(err)),
            };
            trace!(session = %self.config.session_label, %result, "unwrap");
            if result.status() != Status::BufferOverflow {
                return Ok(result);
            }
            self.app_capacity =
                self.grow(self.app_capacity, self.engine.max_application_buffer_size())?;
        }
    }

    fn grow(&self, current: usize, max: usize) -> Result<usize, EngineError> {
        let next = current
            .saturating_mul(self.config.buffer_growth_factor)
            .min(max);
        if next <= current {
            warn!(session = %self.config.session_label, current, max, "buffer limit reached");
            return Err(EngineError::protocol(
                codes::DRIVER_BUFFER_LIMIT,
                format!("engine requested more than {max} bytes of buffer space"),
            ));
        }
        debug!(session = %self.config.session_label, from = current, to = next, "growing buffer");
        Ok(next)
    }

    /// 处理一次变换之后引擎提出的后续要求：执行任务，再排空引擎主动产生的输出。
    async fn follow_up(&mut self, result: EngineResult) -> Result<(), EngineError> {
        if result.is_finished() {
            self.mark_established();
        }
        if self.engine.handshake_status() == HandshakeStatus::NeedTask {
            self.run_tasks().await?;
        }
        // 关闭回复、ACK 等由引擎主动产生的输出在这里一并写出。
        self.drain_outbound().await
    }

    /// 用空输入反复 `wrap`，直到引擎不再产出字节。
    async fn drain_outbound(&mut self) -> Result<(), EngineError> {
        for _ in 0..self.config.max_handshake_steps {
            let result = self.wrap_once(&[]).await?;
            if result.is_finished() {
                self.mark_established();
            }
            if result.bytes_produced() == 0 {
                return Ok(());
            }
        }
        Err(EngineError::protocol(
            codes::DRIVER_STALLED,
            "engine kept producing output without input",
        ))
    }

    /// 解出一个网络单元；缓冲字节不足时写出待发数据并读取传输。
    ///
    /// 返回 `false` 表示入站方向已经结束。
    async fn pump_inbound(&mut self) -> Result<bool, EngineError> {
        if !self.net_in.is_empty() {
            let result = self.unwrap_once()?;
            self.follow_up(result).await?;
            match result.status() {
                Status::Closed => {
                    self.flush().await?;
                    self.notify_closed();
                    return Ok(!self.app_in.is_empty());
                }
                Status::BufferUnderflow => {}
                _ if !result.is_idle() => return Ok(true),
                _ => {}
            }
        }
        self.flush().await?;
        if self.read_more().await? {
            return Ok(true);
        }
        self.handle_eof()?;
        Ok(false)
    }

    async fn run_tasks(&mut self) -> Result<(), EngineError> {
        let mut ran = 0;
        while let Some(task) = self.engine.delegated_task() {
            if ran == self.config.max_tasks_per_round {
                return Err(EngineError::protocol(
                    codes::DRIVER_STALLED,
                    format!(
                        "engine queued more than {} tasks in one round",
                        self.config.max_tasks_per_round
                    ),
                ));
            }
            debug!(session = %self.config.session_label, task = task.label(), "running delegated task");
            self.executor.execute(task).await?;
            ran += 1;
        }
        if ran == 0 && self.engine.handshake_status() == HandshakeStatus::NeedTask {
            return Err(EngineError::protocol(
                codes::DRIVER_STALLED,
                "engine reported need_task without a pending task",
            ));
        }
        Ok(())
    }

    async fn read_more(&mut self) -> Result<bool, EngineError> {
        if self.transport_eof {
            return Ok(false);
        }
        self.net_in.reserve(self.net_capacity);
        let read = self
            .transport
            .read_buf(&mut self.net_in)
            .await
            .map_err(io_error)?;
        trace!(session = %self.config.session_label, read, "transport read");
        if read == 0 {
            self.transport_eof = true;
            return Ok(false);
        }
        Ok(true)
    }

    async fn flush(&mut self) -> Result<(), EngineError> {
        if self.net_out.is_empty() {
            return Ok(());
        }
        self.transport
            .write_all(&self.net_out)
            .await
            .map_err(io_error)?;
        self.transport.flush().await.map_err(io_error)?;
        trace!(session = %self.config.session_label, written = self.net_out.len(), "transport write");
        self.net_out.clear();
        Ok(())
    }

    fn handle_eof(&mut self) -> Result<(), EngineError> {
        if self.engine.is_inbound_done() {
            self.notify_closed();
            return Ok(());
        }
        debug!(session = %self.config.session_label, "transport reached eof");
        if let Err(err) = self.engine.close_inbound() {
            return Err(self.report(err));
        }
        self.notify_closed();
        Ok(())
    }

    fn report(&self, err: EngineError) -> EngineError {
        if let Some(report) = err.incident_report() {
            warn!(session = %self.config.session_label, code = report.code(), "engine incident: {report}");
            self.observer.on_incident(&self.config.session_label, report);
        }
        err
    }

    fn mark_established(&mut self) {
        if self.established {
            return;
        }
        self.established = true;
        debug!(session = %self.config.session_label, protocol = self.engine.protocol(), "handshake finished");
        self.observer
            .on_handshake_finished(&self.config.session_label, self.engine.protocol());
    }

    fn notify_closed(&mut self) {
        if self.closed_notified {
            return;
        }
        self.closed_notified = true;
        debug!(session = %self.config.session_label, "inbound closed");
        self.observer.on_closed(&self.config.session_label);
    }
}

fn closed_error(message: &'static str) -> EngineError {
    EngineError::protocol(codes::DRIVER_CLOSED, message)
}

fn io_error(err: io::Error) -> EngineError {
    EngineError::protocol(codes::DRIVER_IO, "transport i/o failed").with_source(err)
}
