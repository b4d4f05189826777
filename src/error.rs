use thiserror::Error;

use crate::database::error::StoreError;
use crate::engine::control::ControlError;
use crate::engine::supervisor::ProcessError;
use crate::service::egress::ProbeError;
use crate::service::lines::LineError;

#[derive(Error, Debug)]
pub enum FleetError {
  #[error("validation failed: {0}")]
  Validation(String),
  #[error("insufficient {pool}: requested {requested}, available {available}")]
  InsufficientResources {
    pool: &'static str,
    requested: usize,
    available: usize,
  },
  #[error("conflict: {0}")]
  Conflict(String),
  #[error("{0} not found")]
  NotFound(String),
  #[error("control rpc failed. Err = {0}")]
  Rpc(#[from] ControlError),
  #[error("engine process error. Err = {0}")]
  Process(#[from] ProcessError),
  #[error("egress probe failed. Err = {0}")]
  Probe(#[from] ProbeError),
  #[error("datastore error. Err = {0}")]
  Store(StoreError),
  #[error("reconcile failed after commit (rpc: {rpc}, resync: {resync})")]
  Reconcile { rpc: String, resync: String },
}

impl From<StoreError> for FleetError {
  fn from(err: StoreError) -> Self {
    match err {
      StoreError::Conflict(what) => FleetError::Conflict(what),
      StoreError::Missing(what) => FleetError::NotFound(what),
      other => FleetError::Store(other),
    }
  }
}

impl From<LineError> for FleetError {
  fn from(err: LineError) -> Self {
    FleetError::Validation(err.to_string())
  }
}

pub type FleetResult<T> = Result<T, FleetError>;

pub fn invalid<T>(message: impl Into<String>) -> FleetResult<T> {
  Err(FleetError::Validation(message.into()))
}
