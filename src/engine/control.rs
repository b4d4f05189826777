use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::process::Command;
use tokio::time::timeout;

use crate::database::models::{ActiveItem, Id};
use crate::utils::config::EngineConfig;
use crate::utils::random::random_string;

use super::document::{Inbound, InboundsPayload, Outbound, OutboundsPayload, Rule, RulesOnly, RulesPayload};
use super::protocol::{outbound_tag, rule_tag, Binding};
use super::synth::{bindings_of, outbound_for, rules_for, Synthesizer};

#[derive(Error, Debug)]
pub enum ControlError {
  #[error("{0} not found on the engine")]
  NotFound(String),
  #[error("{0} already exists on the engine")]
  AlreadyExists(String),
  #[error("control call timed out after {0:?}")]
  Timeout(Duration),
  #[error("failed to run control command. Err = {0}")]
  Io(#[from] std::io::Error),
  #[error("failed to encode control payload. Err = {0}")]
  Encode(#[from] serde_json::Error),
  #[error("control command {0} failed: {1}")]
  Command(String, String),
}

/// Live edits against the running engine.
#[async_trait]
pub trait ControlApi: Send + Sync {
  async fn add_inbound(&self, inbound: &Inbound) -> Result<(), ControlError>;
  async fn remove_inbound(&self, tag: &str) -> Result<(), ControlError>;
  async fn add_outbound(&self, outbound: &Outbound) -> Result<(), ControlError>;
  async fn remove_outbound(&self, tag: &str) -> Result<(), ControlError>;
  async fn add_rule(&self, rule: &Rule) -> Result<(), ControlError>;
  async fn remove_rule(&self, tag: &str) -> Result<(), ControlError>;
}

/// Drives the engine's own `api` sub-commands.
pub struct XrayCli {
  binary: PathBuf,
  server: String,
  payload_dir: PathBuf,
  timeout: Duration,
}

impl XrayCli {
  pub fn new(config: &EngineConfig) -> Self {
    Self {
      binary: config.binary.clone(),
      server: config.api_server.to_string(),
      payload_dir: config.work_dir.join("api"),
      timeout: config.rpc_timeout,
    }
  }

  async fn run(&self, subcommand: &str, args: &[String]) -> Result<(), ControlError> {
    let mut command = Command::new(&self.binary);
    command
      .arg("api")
      .arg(subcommand)
      .arg(format!("--server={}", self.server))
      .args(args)
      .stdin(Stdio::null())
      .stdout(Stdio::piped())
      .stderr(Stdio::piped())
      .kill_on_drop(true);

    let output = match timeout(self.timeout, command.output()).await {
      Ok(output) => output?,
      Err(_) => return Err(ControlError::Timeout(self.timeout)),
    };
    if output.status.success() {
      debug!("api {} {:?} ok", subcommand, args);
      return Ok(());
    }

    let mut message = String::from_utf8_lossy(&output.stderr).trim().to_string();
    if message.is_empty() {
      message = String::from_utf8_lossy(&output.stdout).trim().to_string();
    }
    Err(classify(subcommand, args.last().cloned().unwrap_or_default(), message))
  }

  async fn run_with_payload<T: Serialize>(&self, subcommand: &str, name: &str, payload: &T, flags: &[&str]) -> Result<(), ControlError> {
    tokio::fs::create_dir_all(&self.payload_dir).await?;
    let path = self.payload_dir.join(format!("{}-{}.json", name, random_string(8)));
    tokio::fs::write(&path, serde_json::to_vec(payload)?).await?;

    let mut args: Vec<String> = flags.iter().map(|f| f.to_string()).collect();
    args.push(path.to_string_lossy().to_string());
    let result = self.run(subcommand, &args).await;

    if let Err(e) = tokio::fs::remove_file(&path).await {
      debug!("failed to remove payload {}. Err = {}", path.display(), e);
    }
    result.map_err(|e| match e {
      ControlError::NotFound(_) => ControlError::NotFound(name.to_string()),
      ControlError::AlreadyExists(_) => ControlError::AlreadyExists(name.to_string()),
      other => other,
    })
  }
}

fn classify(subcommand: &str, target: String, message: String) -> ControlError {
  let lower = message.to_ascii_lowercase();
  if lower.contains("not found") || lower.contains("does not exist") || lower.contains("not exist") {
    return ControlError::NotFound(target);
  }
  if lower.contains("already exists") || lower.contains("existing tag") {
    return ControlError::AlreadyExists(target);
  }
  ControlError::Command(subcommand.to_string(), message)
}

#[async_trait]
impl ControlApi for XrayCli {
  async fn add_inbound(&self, inbound: &Inbound) -> Result<(), ControlError> {
    let payload = InboundsPayload {
      inbounds: std::slice::from_ref(inbound),
    };
    self.run_with_payload("adi", &inbound.tag, &payload, &[]).await
  }

  async fn remove_inbound(&self, tag: &str) -> Result<(), ControlError> {
    self.run("rmi", &[tag.to_string()]).await
  }

  async fn add_outbound(&self, outbound: &Outbound) -> Result<(), ControlError> {
    let payload = OutboundsPayload {
      outbounds: std::slice::from_ref(outbound),
    };
    self.run_with_payload("ado", &outbound.tag, &payload, &[]).await
  }

  async fn remove_outbound(&self, tag: &str) -> Result<(), ControlError> {
    self.run("rmo", &[tag.to_string()]).await
  }

  async fn add_rule(&self, rule: &Rule) -> Result<(), ControlError> {
    let payload = RulesPayload {
      routing: RulesOnly {
        rules: std::slice::from_ref(rule),
      },
    };
    self.run_with_payload("adrules", &rule.rule_tag, &payload, &["-append"]).await
  }

  async fn remove_rule(&self, tag: &str) -> Result<(), ControlError> {
    self.run("rmrules", &[tag.to_string()]).await
  }
}

fn absent_ok(result: Result<(), ControlError>) -> Result<(), ControlError> {
  match result {
    Err(ControlError::NotFound(what)) => {
      debug!("{} already absent", what);
      Ok(())
    }
    other => other,
  }
}

fn present_ok(result: Result<(), ControlError>) -> Result<(), ControlError> {
  match result {
    Err(ControlError::AlreadyExists(what)) => {
      debug!("{} already present", what);
      Ok(())
    }
    other => other,
  }
}

/// Removes an item's outbound and its first `rule_count` rules (at least one). Missing resources count as removed.
pub async fn remove_item(api: &dyn ControlApi, item_id: Id, rule_count: usize) -> Result<(), ControlError> {
  for idx in 0..rule_count.max(1) {
    absent_ok(api.remove_rule(&rule_tag(item_id, idx)).await)?;
  }
  absent_ok(api.remove_outbound(&outbound_tag(item_id)).await)
}

/// (Re)installs an item's outbound and routing rules.
pub async fn apply_item(api: &dyn ControlApi, active: &ActiveItem) -> Result<(), ControlError> {
  remove_item(api, active.item.id, bindings_of(active).len()).await?;
  present_ok(api.add_outbound(&outbound_for(&active.item)).await)?;
  for rule in rules_for(active) {
    present_ok(api.add_rule(&rule).await)?;
  }
  Ok(())
}

/// Replaces one inbound with what a full rebuild would produce; drops it when no accounts remain.
pub async fn rebuild_inbound(api: &dyn ControlApi, synth: &Synthesizer, binding: Binding, port: u16, active: &[ActiveItem]) -> Result<(), ControlError> {
  absent_ok(api.remove_inbound(&binding.tag(port)).await)?;
  match synth.inbound(binding, port, active) {
    Some(inbound) => api.add_inbound(&inbound).await,
    None => Ok(()),
  }
}

#[cfg(test)]
pub mod testing {
  use std::collections::BTreeMap;
  use std::sync::atomic::{AtomicBool, Ordering};
  use std::sync::Mutex;

  use super::*;

  /// Engine double that keeps live state in memory and can be told to fail every call.
  #[derive(Default)]
  pub struct FakeControl {
    pub fail: AtomicBool,
    pub inbounds: Mutex<BTreeMap<String, Inbound>>,
    pub outbounds: Mutex<BTreeMap<String, Outbound>>,
    pub rules: Mutex<BTreeMap<String, Rule>>,
    pub calls: Mutex<Vec<String>>,
  }

  impl FakeControl {
    pub fn failing() -> Self {
      let fake = Self::default();
      fake.fail.store(true, Ordering::SeqCst);
      fake
    }

    fn record(&self, call: String) -> Result<(), ControlError> {
      self.calls.lock().unwrap().push(call.clone());
      match self.fail.load(Ordering::SeqCst) {
        true => Err(ControlError::Command(call, "connection refused".to_string())),
        false => Ok(()),
      }
    }
  }

  fn add<T: Clone>(map: &Mutex<BTreeMap<String, T>>, tag: &str, value: &T) -> Result<(), ControlError> {
    let mut map = map.lock().unwrap();
    if map.contains_key(tag) {
      return Err(ControlError::AlreadyExists(tag.to_string()));
    }
    map.insert(tag.to_string(), value.clone());
    Ok(())
  }

  fn remove<T>(map: &Mutex<BTreeMap<String, T>>, tag: &str) -> Result<(), ControlError> {
    match map.lock().unwrap().remove(tag) {
      Some(_) => Ok(()),
      None => Err(ControlError::NotFound(tag.to_string())),
    }
  }

  #[async_trait]
  impl ControlApi for FakeControl {
    async fn add_inbound(&self, inbound: &Inbound) -> Result<(), ControlError> {
      self.record(format!("adi {}", inbound.tag))?;
      add(&self.inbounds, &inbound.tag, inbound)
    }

    async fn remove_inbound(&self, tag: &str) -> Result<(), ControlError> {
      self.record(format!("rmi {}", tag))?;
      remove(&self.inbounds, tag)
    }

    async fn add_outbound(&self, outbound: &Outbound) -> Result<(), ControlError> {
      self.record(format!("ado {}", outbound.tag))?;
      add(&self.outbounds, &outbound.tag, outbound)
    }

    async fn remove_outbound(&self, tag: &str) -> Result<(), ControlError> {
      self.record(format!("rmo {}", tag))?;
      remove(&self.outbounds, tag)
    }

    async fn add_rule(&self, rule: &Rule) -> Result<(), ControlError> {
      self.record(format!("adrules {}", rule.rule_tag))?;
      add(&self.rules, &rule.rule_tag, rule)
    }

    async fn remove_rule(&self, tag: &str) -> Result<(), ControlError> {
      self.record(format!("rmrules {}", tag))?;
      remove(&self.rules, tag)
    }
  }
}

#[cfg(test)]
mod tests {
  use chrono::Utc;

  use super::testing::FakeControl;
  use super::*;
  use crate::database::models::{fixtures, OrderMode};
  use crate::engine::protocol::Protocol;
  use crate::utils::config::testing::engine_config;

  fn active(id: Id, port: u16) -> ActiveItem {
    ActiveItem {
      item: fixtures::item(id, 1, &format!("45.0.0.{}", id), port, Utc::now()),
      customer_id: 1,
      mode: OrderMode::Auto,
      protocol: Protocol::Mixed,
    }
  }

  #[test]
  fn classifies_engine_messages() {
    assert!(matches!(classify("rmo", "fleet-out-1".into(), "handler not found: fleet-out-1".into()), ControlError::NotFound(t) if t == "fleet-out-1"));
    assert!(matches!(classify("ado", "x".into(), "existing tag found: x".into()), ControlError::AlreadyExists(_)));
    assert!(matches!(classify("adi", "x".into(), "failed to dial".into()), ControlError::Command(..)));
  }

  #[tokio::test]
  async fn apply_item_is_repeatable() {
    let api = FakeControl::default();
    let item = active(3, 23457);
    apply_item(&api, &item).await.unwrap();
    apply_item(&api, &item).await.unwrap();

    assert!(api.outbounds.lock().unwrap().contains_key("fleet-out-3"));
    assert!(api.rules.lock().unwrap().contains_key("fleet-rule-3"));
  }

  #[tokio::test]
  async fn removing_absent_item_is_not_an_error() {
    let api = FakeControl::default();
    remove_item(&api, 42, 0).await.unwrap();
    assert_eq!(api.calls.lock().unwrap().len(), 2);
  }

  #[tokio::test]
  async fn remove_item_clears_every_numbered_rule() {
    let api = FakeControl::default();
    let item = active(5, 23457);
    apply_item(&api, &item).await.unwrap();
    let mut extra = rules_for(&item).remove(0);
    extra.rule_tag = rule_tag(5, 1);
    api.add_rule(&extra).await.unwrap();

    remove_item(&api, 5, 2).await.unwrap();
    assert!(api.rules.lock().unwrap().is_empty());
    assert!(api.outbounds.lock().unwrap().is_empty());
    assert!(api.calls.lock().unwrap().iter().any(|c| c == "rmrules fleet-rule-5-2"));
  }

  #[tokio::test]
  async fn rebuild_inbound_drops_empty_ports() {
    let api = FakeControl::default();
    let synth = Synthesizer::new(&engine_config());
    let items = vec![active(1, 23457), active(2, 23457)];

    rebuild_inbound(&api, &synth, Binding::Generic, 23457, &items).await.unwrap();
    assert!(api.inbounds.lock().unwrap().contains_key("fleet-in-23457"));

    rebuild_inbound(&api, &synth, Binding::Generic, 23457, &[]).await.unwrap();
    assert!(api.inbounds.lock().unwrap().is_empty());
  }

  #[tokio::test]
  async fn cli_reports_missing_binary_as_io_error() {
    let cli = XrayCli::new(&engine_config());
    assert!(matches!(cli.remove_outbound("fleet-out-1").await, Err(ControlError::Io(_))));
  }
}
