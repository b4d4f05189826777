use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
  #[error("datastore request failed. Err = {0}")]
  Driver(mongodb::error::Error),
  #[error("failed to encode document. Err = {0}")]
  Encode(#[from] mongodb::bson::ser::Error),
  #[error("unique constraint violated ({0})")]
  Conflict(String),
  #[error("{0} not found")]
  Missing(String),
}

const DUPLICATE_KEY: i32 = 11000;

impl From<mongodb::error::Error> for StoreError {
  fn from(err: mongodb::error::Error) -> Self {
    use mongodb::error::{ErrorKind, WriteFailure};

    let duplicate = match err.kind.as_ref() {
      ErrorKind::Write(WriteFailure::WriteError(e)) => e.code == DUPLICATE_KEY,
      ErrorKind::Command(e) => e.code == DUPLICATE_KEY,
      ErrorKind::BulkWrite(e) => e.write_errors.iter().flatten().any(|w| w.code == DUPLICATE_KEY),
      _ => false,
    };
    match duplicate {
      true => StoreError::Conflict(err.to_string()),
      false => StoreError::Driver(err),
    }
  }
}

#[cfg(test)]
mod tests {
  use mongodb::bson;

  use super::*;

  #[test]
  fn unencodable_values_map_to_encode() {
    let err: StoreError = bson::to_bson(&u64::MAX).unwrap_err().into();
    assert!(matches!(err, StoreError::Encode(_)));
  }
}
