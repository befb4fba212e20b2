//! Purpose: Resolve where spool files live and how they are named.
//! Exports: `default_spool_dir`, `spool_file_name`, `random_token`.
//! Role: Keep library defaults and CLI flags aligned from one source.
//! Invariants: `SQLSPOOL_SPOOL_DIR` overrides the OS temp directory when set and non-empty.
//! Invariants: Every spool file name carries a fresh random token.

use std::path::PathBuf;

use getrandom::fill as fill_random;

use crate::core::error::{Error, ErrorKind};

pub const SPOOL_DIR_ENV: &str = "SQLSPOOL_SPOOL_DIR";

pub fn default_spool_dir() -> PathBuf {
    match std::env::var_os(SPOOL_DIR_ENV) {
        Some(dir) if !dir.is_empty() => PathBuf::from(dir),
        _ => std::env::temp_dir(),
    }
}

pub(crate) fn spool_file_name(token: &str) -> String {
    format!("sqlspool-{token}.spool")
}

/// 128 random bits as lowercase hex.
pub(crate) fn random_token() -> Result<String, Error> {
    let mut bytes = [0u8; 16];
    fill_random(&mut bytes).map_err(|err| {
        Error::new(ErrorKind::Internal)
            .with_message(format!("failed to generate random token: {err}"))
    })?;
    Ok(hex::encode(bytes))
}
