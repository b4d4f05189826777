use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::database::models::{ActiveItem, ForwardEgress, HostIp, Id};
use crate::database::Store;
use crate::error::{invalid, FleetError, FleetResult};
use crate::utils::socket::{ip_sort_key, is_reserved};

use self::dispersion::scattered_pick;

pub mod dispersion;

const HOST_POOL: &str = "host ips";
const EGRESS_POOL: &str = "forward egresses";

pub struct AllocationRequest<'a> {
  pub customer_id: Id,
  pub quantity: usize,
  /// Order whose own items do not count as "used by this customer".
  pub exclude_order: Option<Id>,
  /// Explicit member ids; disables fairness selection.
  pub pinned: Option<&'a [Id]>,
}

impl AllocationRequest<'_> {
  /// Dispersion seed over customer, excluded order and quantity. Customer ids are external, so it wraps.
  fn seed(&self, [customer, exclude, quantity]: [u64; 3]) -> u64 {
    self
      .customer_id
      .wrapping_mul(customer)
      .wrapping_add(self.exclude_order.unwrap_or(0).wrapping_mul(exclude))
      .wrapping_add((self.quantity as u64).wrapping_mul(quantity))
  }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PoolPreview {
  pub pool_size: usize,
  pub used_by_customer: usize,
  pub available: usize,
}

/// Read-only selection of shared pool members. Nothing is reserved until the caller commits items.
#[derive(Clone)]
pub struct Allocator {
  store: Arc<dyn Store>,
}

impl Allocator {
  pub fn new(store: Arc<dyn Store>) -> Self {
    Self { store }
  }

  /// Enabled local public addresses, or enabled local ones when no public address exists.
  pub async fn usable_hosts(&self) -> FleetResult<Vec<HostIp>> {
    let all = self.store.host_ips().await?;
    let local: Vec<HostIp> = all.into_iter().filter(|h| h.enabled && h.is_local && !is_reserved(&h.ip)).collect();
    let public: Vec<HostIp> = local.iter().filter(|h| h.is_public).cloned().collect();
    let mut pool = match public.is_empty() {
      true => local,
      false => public,
    };
    pool.sort_by_key(|h| ip_sort_key(&h.ip));
    Ok(pool)
  }

  pub async fn preview(&self, customer_id: Id, exclude_order: Option<Id>, now: DateTime<Utc>) -> FleetResult<PoolPreview> {
    let pool = self.usable_hosts().await?;
    let active = self.store.active_items(now).await?;
    let used = customer_ips(&active, customer_id, exclude_order);
    let used_in_pool = pool.iter().filter(|h| used.contains(&h.ip)).count();
    Ok(PoolPreview {
      pool_size: pool.len(),
      used_by_customer: used.len(),
      available: pool.len() - used_in_pool,
    })
  }

  pub async fn hosts(&self, request: &AllocationRequest<'_>, now: DateTime<Utc>) -> FleetResult<Vec<HostIp>> {
    if request.quantity == 0 {
      return invalid("quantity must be positive");
    }
    let active = self.store.active_items(now).await?;
    let used = customer_ips(&active, request.customer_id, request.exclude_order);

    if let Some(pinned) = request.pinned {
      let rows = self.store.host_ips().await?;
      let picked = pick_pinned(&rows, pinned, request.quantity, |h| h.id, |h| h.enabled, HOST_POOL)?;
      if let Some(taken) = picked.iter().find(|h| used.contains(&h.ip)) {
        return Err(FleetError::Conflict(format!("ip {} already used by customer {}", taken.ip, request.customer_id)));
      }
      return Ok(picked);
    }

    let candidates: Vec<HostIp> = self.usable_hosts().await?.into_iter().filter(|h| !used.contains(&h.ip)).collect();
    if candidates.len() < request.quantity {
      return Err(FleetError::InsufficientResources {
        pool: HOST_POOL,
        requested: request.quantity,
        available: candidates.len(),
      });
    }

    let mut usage: HashMap<IpAddr, u64> = HashMap::new();
    for active in active.iter() {
      if let Some(ip) = active.item.ip {
        *usage.entry(ip).or_default() += 1;
      }
    }

    let seed = request.seed([131, 17, 7]);
    let picked = pick_by_usage(candidates, request.quantity, |h| usage.get(&h.ip).copied().unwrap_or(0), seed, 11);
    debug!(
      "allocated hosts {:?} for customer {} (quantity {})",
      picked.iter().map(|h| h.ip).collect::<Vec<_>>(),
      request.customer_id,
      request.quantity
    );
    Ok(picked)
  }

  pub async fn egresses(&self, request: &AllocationRequest<'_>, now: DateTime<Utc>) -> FleetResult<Vec<ForwardEgress>> {
    if request.quantity == 0 {
      return invalid("quantity must be positive");
    }
    let active = self.store.active_items(now).await?;
    let used = customer_egresses(&active, request.customer_id, request.exclude_order);
    let rows = self.store.forward_egresses().await?;

    if let Some(pinned) = request.pinned {
      let picked = pick_pinned(&rows, pinned, request.quantity, |e| e.id, |e| e.enabled, EGRESS_POOL)?;
      if let Some(taken) = picked.iter().find(|e| used.contains(&e.id)) {
        return Err(FleetError::Conflict(format!("egress {} already used by customer {}", taken.name, request.customer_id)));
      }
      return Ok(picked);
    }

    let mut candidates: Vec<ForwardEgress> = rows.into_iter().filter(|e| e.enabled && !used.contains(&e.id)).collect();
    if candidates.len() < request.quantity {
      return Err(FleetError::InsufficientResources {
        pool: EGRESS_POOL,
        requested: request.quantity,
        available: candidates.len(),
      });
    }
    candidates.sort_by(|a, b| route_user_key(a).cmp(&route_user_key(b)).then(a.id.cmp(&b.id)));

    let mut usage: HashMap<Id, u64> = HashMap::new();
    for active in active.iter() {
      if let Some(id) = active.item.forward_egress_id {
        *usage.entry(id).or_default() += 1;
      }
    }

    let seed = request.seed([163, 13, 19]);
    Ok(pick_by_usage(candidates, request.quantity, |e| usage.get(&e.id).copied().unwrap_or(0), seed, 7))
  }
}

fn route_user_key(egress: &ForwardEgress) -> &str {
  egress.route_user.as_deref().map(str::trim).unwrap_or("")
}

fn customer_ips(active: &[ActiveItem], customer_id: Id, exclude_order: Option<Id>) -> HashSet<IpAddr> {
  active
    .iter()
    .filter(|a| a.customer_id == customer_id && Some(a.item.order_id) != exclude_order)
    .filter_map(|a| a.item.ip)
    .collect()
}

fn customer_egresses(active: &[ActiveItem], customer_id: Id, exclude_order: Option<Id>) -> HashSet<Id> {
  active
    .iter()
    .filter(|a| a.customer_id == customer_id && Some(a.item.order_id) != exclude_order)
    .filter_map(|a| a.item.forward_egress_id)
    .collect()
}

/// Walks usage levels from least to most used and disperses the pick inside each level.
fn pick_by_usage<T: Clone>(candidates: Vec<T>, quantity: usize, level_of: impl Fn(&T) -> u64, seed: u64, level_factor: u64) -> Vec<T> {
  let mut buckets: BTreeMap<u64, Vec<T>> = BTreeMap::new();
  for candidate in candidates {
    buckets.entry(level_of(&candidate)).or_default().push(candidate);
  }

  let mut picked = Vec::with_capacity(quantity);
  for (level, bucket) in buckets {
    let need = quantity - picked.len();
    if need == 0 {
      break;
    }
    picked.extend(scattered_pick(&bucket, need.min(bucket.len()), seed.wrapping_add(level.wrapping_mul(level_factor))));
  }
  picked
}

fn pick_pinned<T: Clone>(
  rows: &[T],
  pinned: &[Id],
  quantity: usize,
  id_of: impl Fn(&T) -> Id,
  enabled: impl Fn(&T) -> bool,
  pool: &'static str,
) -> FleetResult<Vec<T>> {
  if pinned.len() < quantity {
    return Err(FleetError::InsufficientResources {
      pool,
      requested: quantity,
      available: pinned.len(),
    });
  }
  let mut seen = HashSet::new();
  let mut picked = Vec::with_capacity(quantity);
  for id in pinned.iter().take(quantity) {
    if !seen.insert(*id) {
      return invalid(format!("{} member {} listed twice", pool, id));
    }
    match rows.iter().find(|r| id_of(r) == *id) {
      Some(row) if enabled(row) => picked.push(row.clone()),
      Some(_) => return invalid(format!("{} member {} is disabled", pool, id)),
      None => return Err(FleetError::NotFound(format!("{} member {}", pool, id))),
    }
  }
  Ok(picked)
}
