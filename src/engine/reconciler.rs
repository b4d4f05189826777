use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;

use crate::database::Store;
use crate::error::{FleetError, FleetResult};
use crate::utils::config::EngineConfig;

use super::control::{ControlApi, ControlError};
use super::document::EngineDocument;
use super::supervisor::{EngineProcess, ProcessError};
use super::synth::Synthesizer;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
  /// Live edits went through.
  Incremental,
  /// Live edits failed and the engine was rebuilt from the datastore.
  Resynced,
}

/// Keeps the running engine converged on the active items in the datastore.
pub struct Reconciler {
  store: Arc<dyn Store>,
  control: Arc<dyn ControlApi>,
  process: Arc<dyn EngineProcess>,
  synth: Synthesizer,
  config_path: PathBuf,
  managed: bool,
  resync_lock: Mutex<()>,
}

impl Reconciler {
  pub fn new(config: &EngineConfig, store: Arc<dyn Store>, control: Arc<dyn ControlApi>, process: Arc<dyn EngineProcess>) -> Self {
    Self {
      store,
      control,
      process,
      synth: Synthesizer::new(config),
      config_path: config.config_path.clone(),
      managed: config.managed,
      resync_lock: Mutex::new(()),
    }
  }

  pub fn control(&self) -> &dyn ControlApi {
    self.control.as_ref()
  }

  pub fn synth(&self) -> &Synthesizer {
    &self.synth
  }

  /// Runs targeted live edits; any failure falls back to a full resync.
  pub async fn apply_incremental<F>(&self, edits: F) -> FleetResult<Outcome>
  where
    F: Future<Output = Result<(), ControlError>>,
  {
    debug!("reconcile: Applying");
    let rpc_err = match edits.await {
      Ok(()) => {
        debug!("reconcile: Idle");
        return Ok(Outcome::Incremental);
      }
      Err(e) => e,
    };

    self.fall_back(rpc_err.to_string()).await
  }

  /// Rebuilds the engine after live edits could not be made. Errors only when the rebuild fails too.
  pub async fn fall_back(&self, cause: String) -> FleetResult<Outcome> {
    warn!("live apply failed, falling back to full resync. Err = {}", cause);
    match self.full_resync().await {
      Ok(_) => Ok(Outcome::Resynced),
      Err(resync_err) => {
        error!("full resync after failed live apply also failed. Err = {}", resync_err);
        Err(FleetError::Reconcile {
          rpc: cause,
          resync: resync_err.to_string(),
        })
      }
    }
  }

  /// Synthesizes from the datastore, writes the config file and restarts the engine.
  pub async fn full_resync(&self) -> FleetResult<EngineDocument> {
    let _guard = self.resync_lock.lock().await;
    debug!("reconcile: Rebuilding");
    let document = self.write_config().await?;

    if self.managed {
      debug!("reconcile: Restarting");
      self.process.restart().await?;
    } else {
      debug!("engine is not managed, skipping restart");
    }
    debug!("reconcile: Idle");
    Ok(document)
  }

  pub async fn write_config(&self) -> FleetResult<EngineDocument> {
    let active = self.store.active_items(Utc::now()).await?;
    let document = self.synth.synthesize(&active);
    let bytes = document
      .to_bytes()
      .map_err(|e| ProcessError::ConfigWrite(self.config_path.clone(), std::io::Error::new(std::io::ErrorKind::InvalidData, e)))?;

    if let Some(dir) = self.config_path.parent() {
      tokio::fs::create_dir_all(dir).await.map_err(|e| ProcessError::Prepare(dir.to_path_buf(), e))?;
    }
    let staging = self.config_path.with_extension("json.tmp");
    tokio::fs::write(&staging, &bytes)
      .await
      .map_err(|e| ProcessError::ConfigWrite(staging.clone(), e))?;
    tokio::fs::rename(&staging, &self.config_path)
      .await
      .map_err(|e| ProcessError::ConfigWrite(self.config_path.clone(), e))?;

    info!(
      "wrote engine config {} ({} inbounds, {} outbounds, {} rules)",
      self.config_path.display(),
      document.inbounds.len(),
      document.outbounds.len(),
      document.routing.rules.len()
    );
    Ok(document)
  }

  pub async fn stop(&self) {
    if self.managed {
      self.process.stop().await;
    }
  }
}
