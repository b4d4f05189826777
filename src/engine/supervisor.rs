use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::utils::config::EngineConfig;

#[derive(Error, Debug)]
pub enum ProcessError {
  #[error("engine binary {0} not found")]
  BinaryMissing(PathBuf),
  #[error("failed to prepare {0}. Err = {1}")]
  Prepare(PathBuf, std::io::Error),
  #[error("failed to write engine config {0}. Err = {1}")]
  ConfigWrite(PathBuf, std::io::Error),
  #[error("failed to spawn engine. Err = {0}")]
  Spawn(std::io::Error),
}

/// Lifecycle of the single managed engine process.
#[async_trait]
pub trait EngineProcess: Send + Sync {
  /// Stops the current process, if any, then starts a fresh one.
  async fn restart(&self) -> Result<(), ProcessError>;
  async fn stop(&self);
}

struct RunningEngine {
  pid: Option<u32>,
  stop_tx: oneshot::Sender<()>,
  reaper: JoinHandle<()>,
}

pub struct Supervisor {
  config: EngineConfig,
  running: Mutex<Option<RunningEngine>>,
}

impl Supervisor {
  pub fn new(config: EngineConfig) -> Self {
    Self {
      config,
      running: Mutex::new(None),
    }
  }

  pub async fn is_running(&self) -> bool {
    match self.running.lock().await.as_ref() {
      Some(running) => !running.reaper.is_finished(),
      None => false,
    }
  }

  async fn shutdown(&self, running: RunningEngine) {
    debug!("stopping engine (pid {:?})", running.pid);
    // Fails only when the reaper already saw the process exit.
    let _ = running.stop_tx.send(());
    if timeout(self.config.stop_timeout, running.reaper).await.is_err() {
      warn!("engine (pid {:?}) did not stop within {:?}", running.pid, self.config.stop_timeout);
    }
  }

  async fn spawn(&self) -> Result<RunningEngine, ProcessError> {
    let config = &self.config;
    if tokio::fs::metadata(&config.binary).await.is_err() {
      return Err(ProcessError::BinaryMissing(config.binary.clone()));
    }
    for path in [&config.config_path, &config.log_file] {
      if let Some(dir) = path.parent() {
        tokio::fs::create_dir_all(dir).await.map_err(|e| ProcessError::Prepare(dir.to_path_buf(), e))?;
      }
    }
    tokio::fs::create_dir_all(&config.work_dir)
      .await
      .map_err(|e| ProcessError::Prepare(config.work_dir.clone(), e))?;

    let log_file = tokio::fs::OpenOptions::new()
      .create(true)
      .append(true)
      .open(&config.log_file)
      .await
      .map_err(|e| ProcessError::Prepare(config.log_file.clone(), e))?
      .into_std()
      .await;
    let stderr = log_file.try_clone().map_err(|e| ProcessError::Prepare(config.log_file.clone(), e))?;

    let mut child = Command::new(&config.binary)
      .arg("run")
      .arg("-c")
      .arg(&config.config_path)
      .current_dir(&config.work_dir)
      .stdin(Stdio::null())
      .stdout(Stdio::from(log_file))
      .stderr(Stdio::from(stderr))
      .kill_on_drop(true)
      .spawn()
      .map_err(ProcessError::Spawn)?;

    let pid = child.id();
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let reaper = tokio::spawn(async move {
      tokio::select! {
        status = child.wait() => match status {
          Ok(status) if status.success() => info!("engine (pid {:?}) exited", pid),
          Ok(status) => warn!("engine (pid {:?}) exited abnormally: {}", pid, status),
          Err(e) => warn!("failed to wait on engine (pid {:?}). Err = {}", pid, e),
        },
        _ = stop_rx => {
          if let Err(e) = child.kill().await {
            warn!("failed to kill engine (pid {:?}). Err = {}", pid, e);
          }
        }
      }
    });

    info!("started engine (pid {:?}) with {}", pid, config.config_path.display());
    Ok(RunningEngine { pid, stop_tx, reaper })
  }
}

#[async_trait]
impl EngineProcess for Supervisor {
  async fn restart(&self) -> Result<(), ProcessError> {
    let mut running = self.running.lock().await;
    if let Some(current) = running.take() {
      self.shutdown(current).await;
    }
    *running = Some(self.spawn().await?);
    Ok(())
  }

  async fn stop(&self) {
    let mut running = self.running.lock().await;
    if let Some(current) = running.take() {
      self.shutdown(current).await;
    }
  }
}


#[cfg(test)]
mod tests {
  use std::time::Duration;

  use super::*;
  use crate::utils::config::testing::engine_config;

  #[tokio::test]
  async fn restart_fails_without_binary() {
    let supervisor = Supervisor::new(engine_config());
    assert!(matches!(supervisor.restart().await, Err(ProcessError::BinaryMissing(_))));
    assert!(!supervisor.is_running().await);
  }

  #[cfg(unix)]
  #[tokio::test]
  async fn restart_replaces_the_running_process() {
    let mut config = engine_config();
    config.binary = PathBuf::from("/bin/sh");
    config.stop_timeout = Duration::from_secs(2);
    // `sh run -c <config>` executes ./run from the work dir.
    tokio::fs::create_dir_all(&config.work_dir).await.unwrap();
    tokio::fs::write(config.work_dir.join("run"), b"sleep 30\n").await.unwrap();

    let supervisor = Supervisor::new(config.clone());
    supervisor.restart().await.unwrap();
    assert!(supervisor.is_running().await);
    supervisor.restart().await.unwrap();
    assert!(supervisor.is_running().await);

    supervisor.stop().await;
    assert!(!supervisor.is_running().await);
    assert!(tokio::fs::metadata(&config.log_file).await.is_ok());
    let _ = tokio::fs::remove_dir_all(&config.work_dir).await;
  }

  #[cfg(unix)]
  #[tokio::test]
  async fn restart_creates_a_missing_log_directory() {
    let mut config = engine_config();
    config.binary = PathBuf::from("/bin/sh");
    config.log_file = config.work_dir.join("logs").join("engine").join("xray.log");
    tokio::fs::create_dir_all(&config.work_dir).await.unwrap();
    tokio::fs::write(config.work_dir.join("run"), b"sleep 30\n").await.unwrap();

    let supervisor = Supervisor::new(config.clone());
    supervisor.restart().await.unwrap();
    assert!(tokio::fs::metadata(&config.log_file).await.is_ok());

    supervisor.stop().await;
    let _ = tokio::fs::remove_dir_all(&config.work_dir).await;
  }
}
