use std::collections::BTreeSet;
use std::net::IpAddr;

use crate::database::models::{HostIp, Sequence};
use crate::database::{Change, ChangeSet, Store};
use crate::error::FleetResult;
use crate::utils::config::PoolConfig;
use crate::utils::socket::{is_public, is_reserved, make_subnet_vec};

/// Every address the pool section names, deduplicated and sorted.
pub fn configured_addrs(config: &PoolConfig) -> Vec<IpAddr> {
  let mut addrs: BTreeSet<IpAddr> = config.addrs.clone().unwrap_or_default().into_iter().collect();
  for subnet in config.subnets.clone().unwrap_or_default() {
    addrs.extend(make_subnet_vec(subnet).into_iter().map(IpAddr::V4));
  }
  addrs.into_iter().filter(|ip| !is_reserved(ip)).collect()
}

/// Upserts the configured local addresses into the host pool. Returns the number of new rows.
///
/// Rows that already exist keep their `enabled` flag and comment; their locality and
/// public classification are refreshed.
pub async fn seed_pool(store: &dyn Store, config: &PoolConfig) -> FleetResult<usize> {
  let addrs = configured_addrs(config);
  if addrs.is_empty() {
    debug!("no local pool addresses configured");
    return Ok(0);
  }

  let existing = store.host_ips().await?;
  let classify = |ip: &IpAddr| config.public || is_public(ip);

  let mut changes = ChangeSet::new();
  for row in existing.iter().filter(|h| addrs.contains(&h.ip)) {
    let public = classify(&row.ip);
    if row.is_local && row.is_public == public {
      continue;
    }
    let mut refreshed = row.clone();
    refreshed.is_local = true;
    refreshed.is_public = public;
    changes.push(Change::SaveHostIp(refreshed));
  }

  let fresh: Vec<IpAddr> = addrs.into_iter().filter(|ip| !existing.iter().any(|h| h.ip == *ip)).collect();
  let ids = store.next_ids(Sequence::HostIps, fresh.len()).await?;
  for (id, ip) in ids.into_iter().zip(fresh.iter()) {
    changes.push(Change::SaveHostIp(HostIp {
      id,
      ip: *ip,
      is_public: classify(ip),
      is_local: true,
      enabled: true,
      comment: String::new(),
    }));
  }

  if !changes.is_empty() {
    store.commit(changes).await?;
  }
  info!("local pool seeded ({} new, {} known)", fresh.len(), existing.len());
  Ok(fresh.len())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::database::memory::MemoryStore;
  use crate::database::models::fixtures;

  fn pool(public: bool, subnets: &[&str], addrs: &[&str]) -> PoolConfig {
    PoolConfig {
      public,
      subnets: Some(subnets.iter().map(|s| s.parse().unwrap()).collect()),
      addrs: Some(addrs.iter().map(|a| a.parse().unwrap()).collect()),
    }
  }

  #[test]
  fn configured_addrs_merge_subnets_and_skip_reserved() {
    let addrs = configured_addrs(&pool(false, &["10.0.0.0/30"], &["10.0.0.1", "127.0.0.1", "45.0.0.9"]));
    let expected: Vec<IpAddr> = ["10.0.0.0", "10.0.0.1", "10.0.0.2", "45.0.0.9"].iter().map(|a| a.parse().unwrap()).collect();
    assert_eq!(addrs, expected);
  }

  #[tokio::test]
  async fn seeding_adds_new_rows_and_keeps_operator_flags() {
    let store = MemoryStore::new();
    let mut disabled = fixtures::host_ip(1, "45.0.0.1");
    disabled.enabled = false;
    disabled.is_public = false;
    store.add_host_ip(disabled).await;

    let added = seed_pool(&store, &pool(false, &[], &["45.0.0.1", "45.0.0.2", "192.168.1.5"])).await.unwrap();
    assert_eq!(added, 2);

    let rows = store.host_ips().await.unwrap();
    assert_eq!(rows.len(), 3);
    let first = rows.iter().find(|h| h.id == 1).unwrap();
    assert!(!first.enabled);
    assert!(first.is_public);
    let private = rows.iter().find(|h| h.ip == "192.168.1.5".parse::<IpAddr>().unwrap()).unwrap();
    assert!(!private.is_public);
    assert!(rows.iter().all(|h| h.id <= 3));

    assert_eq!(seed_pool(&store, &pool(false, &[], &["45.0.0.2"])).await.unwrap(), 0);
  }

  #[tokio::test]
  async fn public_flag_overrides_classification() {
    let store = MemoryStore::new();
    seed_pool(&store, &pool(true, &["10.1.0.0/31"], &[])).await.unwrap();
    let rows = store.host_ips().await.unwrap();
    assert_eq!(rows.len(), 2);
    assert!(rows.iter().all(|h| h.is_public && h.is_local && h.enabled));
  }
}
