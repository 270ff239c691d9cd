//! Token-history persistence
//!
//! Wire format, little-endian: a `u64` count followed by that many signed
//! 32-bit token ids. Only the token side of a session is persisted; the
//! attention tensors are rebuilt by re-prefilling after a load.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use crate::error::{EngineError, Result};

/// Write `tokens` to `path`, replacing any existing file.
pub fn write_history(path: &Path, tokens: &[u32]) -> Result<()> {
    let mut file = BufWriter::new(File::create(path)?);

    file.write_all(&(tokens.len() as u64).to_le_bytes())?;
    for &token in tokens {
        file.write_all(&(token as i32).to_le_bytes())?;
    }
    file.flush()?;
    Ok(())
}

/// Read a token history from `path`. The file must contain exactly the
/// advertised number of ids; anything short or trailing is rejected so a
/// truncated file never produces a silently wrong history.
pub fn read_history(path: &Path) -> Result<Vec<u32>> {
    let mut file = BufReader::new(File::open(path)?);

    let mut len_bytes = [0u8; 8];
    file.read_exact(&mut len_bytes)?;
    let count = u64::from_le_bytes(len_bytes) as usize;

    let mut payload = Vec::new();
    file.read_to_end(&mut payload)?;
    if payload.len() != count * 4 {
        return Err(EngineError::SessionFormat(format!(
            "expected {} token ids, file holds {} bytes of payload",
            count,
            payload.len()
        )));
    }

    let tokens = payload
        .chunks_exact(4)
        .map(|chunk| i32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]) as u32)
        .collect();
    Ok(tokens)
}
