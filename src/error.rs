use std::io;

use thiserror::Error;

/// Error taxonomy shared by every component in the crate.
///
/// Names are a contract: callers across the crate boundary match on the
/// variant, not on its payload.
#[derive(Error, Debug)]
pub enum AittError {
  #[error("invalid argument: {0}")]
  InvalidArg(String),

  #[error("allocation failed")]
  NoMemory,

  #[error("operation failed: {0}")]
  OperationFailed(String),

  #[error("system error: {0}")]
  System(#[from] io::Error),

  #[error("bus client error: {0}")]
  Bus(String),

  #[error("no data: {0}")]
  NoData(String),

  #[error("resource busy: {0}")]
  ResourceBusy(String),

  #[error("not supported: {0}")]
  NotSupported(String),
}

pub type Result<T> = std::result::Result<T, AittError>;
