//! 引擎一致性套件。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 每个具体引擎都必须满足同一组契约：缺省参数的 `timer` 不报错、回环握手能收敛、
//!   wrap 产出的字节与对端 unwrap 消费的字节一一对应；
//! - 把这些断言集中在此，各引擎 crate 以 dev 依赖方式开启 `tck` 特性后直接复用，
//!   避免每个引擎各写一套内存泵。
//!
//! ## 逻辑（How）
//! - 内存泵只用 `Vec<u8>` 模拟双向链路，委派任务在当前线程同步执行；
//! - 每轮依次“客户端排空 → 服务端读入 → 服务端排空 → 客户端读入”，直到没有任何进展。

use crate::{
    engine::Engine,
    error::{EngineError, codes},
    status::{HandshakeStatus, Status},
};

const MAX_ROUNDS: usize = 256;
const SCRATCH: usize = 64 * 1024;

/// 回环握手过程的观测记录。
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HandshakeTrace {
    pub client_finished: usize,
    pub server_finished: usize,
    pub tasks_run: usize,
    pub rounds: usize,
}

/// 单向数据传输的统计结果。
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Transfer {
    /// 发送端 `wrap` 产出的总字节数。
    pub wrap_produced: usize,
    /// 接收端 `unwrap` 消费的总字节数。
    pub unwrap_consumed: usize,
    /// 接收端还原出的应用数据。
    pub received: Vec<u8>,
}

/// 断言缺省参数的定时事件被接受。
pub fn assert_timer_tolerates_absent_arguments<E: Engine + ?Sized>(engine: &mut E) {
    let before = engine.handshake_status();
    if let Err(err) = engine.timer(None, None) {
        panic!("timer(None, None) must not fail, got {err}");
    }
    assert_eq!(
        engine.handshake_status(),
        before,
        "timer(None, None) must not move the handshake"
    );
}

/// 在内存中把一对引擎的握手推进到完成。
pub fn complete_handshake<C, S>(client: &mut C, server: &mut S) -> Result<HandshakeTrace, EngineError>
where
    C: Engine + ?Sized,
    S: Engine + ?Sized,
{
    client.begin_handshake()?;
    server.begin_handshake()?;
    let mut trace = HandshakeTrace::default();
    let mut to_server = Vec::new();
    let mut to_client = Vec::new();
    let mut sink = Vec::new();
    for round in 1..=MAX_ROUNDS {
        trace.rounds = round;
        let mut progressed = false;
        progressed |= drain(client, &mut to_server, &mut trace.client_finished, &mut trace.tasks_run)?;
        progressed |= feed(server, &mut to_server, &mut sink, &mut trace.server_finished, &mut trace.tasks_run)?.0;
        progressed |= drain(server, &mut to_client, &mut trace.server_finished, &mut trace.tasks_run)?;
        progressed |= feed(client, &mut to_client, &mut sink, &mut trace.client_finished, &mut trace.tasks_run)?.0;
        if !progressed {
            break;
        }
    }
    if client.handshake_status().is_handshaking() || server.handshake_status().is_handshaking() {
        return Err(EngineError::protocol(
            codes::DRIVER_STALLED,
            format!(
                "loopback handshake stalled: client={} server={}",
                client.handshake_status(),
                server.handshake_status()
            ),
        ));
    }
    Ok(trace)
}

/// 把 `data` 从 `from` 经 wrap/unwrap 送到 `to`，对端产生的反馈（如 ACK）回送给发送端。
pub fn transfer<A, B>(from: &mut A, to: &mut B, data: &[u8]) -> Result<Transfer, EngineError>
where
    A: Engine + ?Sized,
    B: Engine + ?Sized,
{
    let mut stats = Transfer::default();
    let mut wire = Vec::new();
    let mut back = Vec::new();
    let mut sink = Vec::new();
    let mut finished = 0;
    let mut tasks = 0;
    let mut offset = 0;
    let mut scratch = vec![0_u8; SCRATCH.max(from.max_network_buffer_size())];
    for _ in 0..MAX_ROUNDS * 16 {
        if offset == data.len() && wire.is_empty() {
            return Ok(stats);
        }
        let mut progressed = false;
        if offset < data.len() {
            let result = from.wrap(&data[offset..], &mut scratch)?;
            if result.status() == Status::Closed {
                return Err(EngineError::protocol(codes::DRIVER_CLOSED, "sender closed mid-transfer"));
            }
            offset += result.bytes_consumed();
            stats.wrap_produced += result.bytes_produced();
            wire.extend_from_slice(&scratch[..result.bytes_produced()]);
            progressed |= !result.is_idle();
        }
        let (moved, consumed) = feed(to, &mut wire, &mut stats.received, &mut finished, &mut tasks)?;
        stats.unwrap_consumed += consumed;
        progressed |= moved;
        progressed |= drain(to, &mut back, &mut finished, &mut tasks)?;
        progressed |= feed(from, &mut back, &mut sink, &mut finished, &mut tasks)?.0;
        if !progressed {
            break;
        }
    }
    Err(EngineError::protocol(
        codes::DRIVER_STALLED,
        format!("loopback transfer stalled after {offset} of {} bytes", data.len()),
    ))
}

fn run_tasks<E: Engine + ?Sized>(engine: &mut E, tasks: &mut usize) {
    while let Some(task) = engine.delegated_task() {
        task.run();
        *tasks += 1;
    }
}

/// 以空输入反复 wrap，直到没有输出。
fn drain<E: Engine + ?Sized>(
    engine: &mut E,
    out: &mut Vec<u8>,
    finished: &mut usize,
    tasks: &mut usize,
) -> Result<bool, EngineError> {
    let mut progressed = false;
    let mut scratch = vec![0_u8; SCRATCH.max(engine.max_network_buffer_size())];
    for _ in 0..MAX_ROUNDS {
        run_tasks(engine, tasks);
        let result = engine.wrap(&[], &mut scratch)?;
        if result.handshake_status() == HandshakeStatus::Finished {
            *finished += 1;
        }
        out.extend_from_slice(&scratch[..result.bytes_produced()]);
        if result.bytes_produced() == 0 {
            break;
        }
        progressed = true;
    }
    run_tasks(engine, tasks);
    Ok(progressed)
}

/// 把 `input` 中的完整单元全部 unwrap，返回（是否有进展，消费字节数）。
fn feed<E: Engine + ?Sized>(
    engine: &mut E,
    input: &mut Vec<u8>,
    app: &mut Vec<u8>,
    finished: &mut usize,
    tasks: &mut usize,
) -> Result<(bool, usize), EngineError> {
    let mut consumed_total = 0;
    let mut scratch = vec![0_u8; SCRATCH.max(engine.max_application_buffer_size())];
    for _ in 0..MAX_ROUNDS {
        run_tasks(engine, tasks);
        if input.is_empty() {
            break;
        }
        let result = engine.unwrap(input, &mut scratch)?;
        if result.handshake_status() == HandshakeStatus::Finished {
            *finished += 1;
        }
        input.drain(..result.bytes_consumed());
        consumed_total += result.bytes_consumed();
        app.extend_from_slice(&scratch[..result.bytes_produced()]);
        if result.is_idle() || matches!(result.status(), Status::BufferUnderflow | Status::Closed) {
            break;
        }
    }
    run_tasks(engine, tasks);
    Ok((consumed_total > 0, consumed_total))
}
