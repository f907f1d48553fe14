use spark_engine::EngineError;

use crate::error::codes;

pub const NONCE_LEN: usize = 32;

/// 从操作系统熵源取一个握手随机数。
pub fn fresh() -> Result<[u8; NONCE_LEN], EngineError> {
    let mut nonce = [0_u8; NONCE_LEN];
    getrandom::getrandom(&mut nonce).map_err(|err| {
        EngineError::protocol(codes::ENTROPY, "failed to draw handshake nonce").with_source(err)
    })?;
    Ok(nonce)
}
