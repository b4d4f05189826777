use std::sync::Arc;

use moka::future::Cache;

use crate::{
  database::{error::StoreError, Store},
  utils::{config::SettingsCacheConfig, constants::DEFAULT_PORT_SETTING},
};

/// Read-through cache of datastore settings. Missing keys are cached too.
#[derive(Clone)]
pub struct SettingsCache {
  inner: Cache<String, Option<Arc<String>>>,
}

impl SettingsCache {
  pub fn new(config: &SettingsCacheConfig) -> Self {
    Self {
      inner: Cache::builder().max_capacity(config.max_size).time_to_live(config.time_to_live).build(),
    }
  }

  pub async fn get_or_fetch(&self, store: &dyn Store, key: &str) -> Result<Option<Arc<String>>, StoreError> {
    if let Some(value) = self.inner.get(key) {
      return Ok(value);
    }
    let value = store.setting(key).await?.map(Arc::new);
    debug!("settings cache miss - {} = {:?}", key, value);
    self.inner.insert(key.to_string(), value.clone()).await;
    return Ok(value);
  }

  /// Inbound port for generic orders created without an explicit port.
  pub async fn default_port(&self, store: &dyn Store, fallback: u16) -> u16 {
    let value = match self.get_or_fetch(store, DEFAULT_PORT_SETTING).await {
      Ok(v) => v,
      Err(e) => {
        warn!("failed to read setting {}. Err = {}", DEFAULT_PORT_SETTING, e);
        return fallback;
      }
    };
    match value.as_deref().map(|v| v.trim().parse::<u16>()) {
      Some(Ok(port)) if port > 0 => port,
      Some(_) => {
        warn!("invalid {} setting, using {}", DEFAULT_PORT_SETTING, fallback);
        fallback
      }
      None => fallback,
    }
  }

  pub async fn invalidate(&self, key: &str) {
    self.inner.invalidate(key).await
  }
}
