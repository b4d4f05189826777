use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use crate::allocator::{AllocationRequest, Allocator, PoolPreview};
use crate::cache::settings::SettingsCache;
use crate::database::models::{ActiveItem, ForwardEgress, HostIp, Id, Order, OrderItem, OrderMode, Sequence, Status};
use crate::database::{Change, ChangeSet, Store};
use crate::engine::control::{apply_item, rebuild_inbound, remove_item, ControlApi, ControlError};
use crate::engine::protocol::Binding;
use crate::engine::reconciler::{Outcome, Reconciler};
use crate::engine::synth::{bindings_of, Synthesizer};
use crate::error::{invalid, FleetError, FleetResult};
use crate::utils::config::OrdersConfig;
use crate::utils::constants::{PASSWORD_LEN, RENEW_DEFAULT_DAYS, USERNAME_LEN};
use crate::utils::random::random_string;
use crate::utils::socket::probe_port_free;

use super::egress::RouteUserClaims;
use super::lines::{parse_import_lines, ImportRow};

/// Live edits owed after a commit: items to reinstall or tear down, inbounds to rebuild.
#[derive(Default)]
pub(super) struct LivePlan {
  /// Item id to the most routing rules it held in any touched state.
  items: BTreeMap<Id, usize>,
  inbounds: BTreeSet<(Binding, u16)>,
}

impl LivePlan {
  /// Records an item as seen before or after the change. Call it for both states.
  pub(super) fn touch(&mut self, order: &Order, item: &OrderItem) {
    if !item.managed {
      return;
    }
    let bindings = bindings_of(&ActiveItem::new(order, item.clone()));
    let rules = self.items.entry(item.id).or_default();
    *rules = (*rules).max(bindings.len());
    for binding in bindings {
      self.inbounds.insert((binding, item.port));
    }
  }

  fn is_empty(&self) -> bool {
    self.items.is_empty() && self.inbounds.is_empty()
  }

  async fn execute(&self, api: &dyn ControlApi, synth: &Synthesizer, active: &[ActiveItem]) -> Result<(), ControlError> {
    for (id, rules) in self.items.iter() {
      match active.iter().find(|a| a.item.id == *id && a.item.managed) {
        Some(live) => {
          if *rules > bindings_of(live).len() {
            remove_item(api, *id, *rules).await?;
          }
          apply_item(api, live).await?
        }
        None => remove_item(api, *id, *rules).await?,
      }
    }
    for (binding, port) in self.inbounds.iter() {
      rebuild_inbound(api, synth, *binding, *port, active).await?;
    }
    Ok(())
  }
}

#[derive(Clone, Debug, Default)]
pub struct CreateOrder {
  pub customer_id: Id,
  pub name: Option<String>,
  /// Auto when absent.
  pub mode: Option<OrderMode>,
  pub quantity: usize,
  pub port: Option<u16>,
  pub duration_days: Option<u32>,
  pub expires_at: Option<DateTime<Utc>>,
  /// Pinned host pool members, manual mode.
  pub host_ids: Vec<Id>,
  /// Pinned forward egresses, forward mode. Empty allocates `quantity` from the pool.
  pub egress_ids: Vec<Id>,
}

#[derive(Clone, Debug, Default)]
pub struct UpdateOrder {
  pub name: Option<String>,
  pub port: Option<u16>,
  pub quantity: Option<usize>,
  pub expires_at: Option<DateTime<Utc>>,
  pub host_ids: Vec<Id>,
  pub egress_ids: Vec<Id>,
}

#[derive(Clone, Debug, Default)]
pub struct ImportOrder {
  pub customer_id: Id,
  pub name: Option<String>,
  pub expires_at: Option<DateTime<Utc>>,
  pub lines: String,
}

#[derive(Clone, Debug)]
pub struct ImportPreviewRow {
  pub row: ImportRow,
  /// The address belongs to the local pool, so the item will be managed.
  pub local: bool,
}

#[derive(Clone, Debug)]
pub struct OrderDetail {
  pub order: Order,
  pub items: Vec<OrderItem>,
  pub outcome: Outcome,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BatchResult {
  pub id: Id,
  pub error: Option<String>,
}

impl BatchResult {
  fn of<T>(id: Id, result: FleetResult<T>) -> Self {
    Self {
      id,
      error: result.err().map(|e| e.to_string()),
    }
  }

  pub fn success(&self) -> bool {
    self.error.is_none()
  }
}

pub(super) fn unique_ids(ids: &[Id]) -> Vec<Id> {
  let mut seen = HashSet::new();
  ids.iter().copied().filter(|id| *id != 0 && seen.insert(*id)).collect()
}

pub(super) fn default_name(prefix: &str, customer_id: Option<Id>, now: DateTime<Utc>) -> String {
  match customer_id {
    Some(customer_id) => format!("{}-{}-{}", prefix, customer_id, now.format("%Y%m%d%H%M%S")),
    None => format!("{}-{}", prefix, now.format("%Y%m%d%H%M%S")),
  }
}

/// Order/item lifecycle. Every transition commits first, then reconciles the engine.
#[derive(Clone)]
pub struct OrderService {
  pub(super) store: Arc<dyn Store>,
  pub(super) allocator: Allocator,
  pub(super) reconciler: Arc<Reconciler>,
  settings: SettingsCache,
  pub(super) config: OrdersConfig,
}

impl OrderService {
  pub fn new(store: Arc<dyn Store>, reconciler: Arc<Reconciler>, settings: SettingsCache, config: OrdersConfig) -> Self {
    Self {
      allocator: Allocator::new(store.clone()),
      store,
      reconciler,
      settings,
      config,
    }
  }

  pub async fn create_order(&self, input: CreateOrder) -> FleetResult<OrderDetail> {
    if input.customer_id == 0 {
      return invalid("customer_id is required");
    }
    let mode = input.mode.unwrap_or(OrderMode::Auto);
    let egress_ids = unique_ids(&input.egress_ids);
    let quantity = match mode {
      OrderMode::Forward if !egress_ids.is_empty() => egress_ids.len(),
      OrderMode::Auto | OrderMode::Manual | OrderMode::Forward => input.quantity,
      OrderMode::Import | OrderMode::Dedicated => return invalid("mode must be auto, manual or forward"),
    };
    if quantity == 0 {
      return invalid("quantity must be positive");
    }
    if mode == OrderMode::Manual && input.host_ids.is_empty() {
      return invalid("host_ids are required for manual mode");
    }

    let now = Utc::now();
    let port = match input.port {
      Some(port) if port > 0 => port,
      _ => self.settings.default_port(self.store.as_ref(), self.config.default_port).await,
    };
    self.ensure_port_ready(port, now).await?;
    let expires_at = self.expiry(now, input.duration_days, input.expires_at)?;

    let order = Order {
      id: self.next_id(Sequence::Orders).await?,
      customer_id: input.customer_id,
      name: input
        .name
        .map(|n| n.trim().to_string())
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| default_name("Order", Some(input.customer_id), now)),
      mode,
      status: Status::Active,
      quantity: quantity as u32,
      port,
      starts_at: now,
      expires_at,
      notify_one_day_sent: false,
      notify_expired_sent: false,
      group_id: None,
      parent_order_id: None,
      sequence_no: 0,
      is_group_head: false,
      dedicated_entry_id: None,
      dedicated_protocol: None,
      created_at: now,
      updated_at: now,
    };

    let mut changes = ChangeSet::new();
    changes.push(Change::InsertOrder(order.clone()));
    let request = AllocationRequest {
      customer_id: order.customer_id,
      quantity,
      exclude_order: None,
      pinned: None,
    };
    let items = match mode {
      OrderMode::Forward => {
        let pinned = AllocationRequest {
          pinned: (!egress_ids.is_empty()).then(|| egress_ids.as_slice()),
          ..request
        };
        let egresses = self.allocator.egresses(&pinned, now).await?;
        let mut claims = RouteUserClaims::new(self.store.as_ref());
        let mut items = Vec::with_capacity(egresses.len());
        for (id, egress) in self.next_ids(Sequence::Items, egresses.len()).await?.into_iter().zip(egresses.iter()) {
          items.push(self.forward_item(id, &order, egress, &mut claims, &mut changes, now).await?);
        }
        items
      }
      _ => {
        let pinned = AllocationRequest {
          pinned: (mode == OrderMode::Manual).then(|| input.host_ids.as_slice()),
          ..request
        };
        let hosts = self.allocator.hosts(&pinned, now).await?;
        let ids = self.next_ids(Sequence::Items, hosts.len()).await?;
        ids.into_iter().zip(hosts.iter()).map(|(id, host)| host_item(id, &order, host, now)).collect::<Vec<_>>()
      }
    };
    for item in items.iter() {
      changes.push(Change::InsertItem(item.clone()));
    }
    self.store.commit(changes).await?;
    info!("order {} created for customer {} ({} items on port {})", order.id, order.customer_id, items.len(), port);

    let mut plan = LivePlan::default();
    items.iter().for_each(|item| plan.touch(&order, item));
    let outcome = self.reconcile(plan).await?;
    self.detail(order.id, outcome).await
  }

  /// Rename, move port, change expiry, resize, or re-target a forward order.
  pub async fn update_order(&self, id: Id, input: UpdateOrder) -> FleetResult<OrderDetail> {
    let (order, items) = self.load(id).await?;
    if order.is_group_head || order.mode == OrderMode::Dedicated {
      return invalid(format!("order {} belongs to a bundle, update the group instead", id));
    }

    let now = Utc::now();
    let port = match input.port {
      Some(0) => return invalid("invalid port"),
      Some(port) => port,
      None => order.port,
    };
    let expires_at = input.expires_at.unwrap_or(order.expires_at);
    let live = expires_at > now;
    let egress_ids = match order.mode {
      OrderMode::Forward if input.egress_ids.is_empty() => unique_ids(&items.iter().filter_map(|i| i.forward_egress_id).collect::<Vec<_>>()),
      OrderMode::Forward => unique_ids(&input.egress_ids),
      _ => Vec::new(),
    };
    let quantity = match order.mode {
      OrderMode::Forward => egress_ids.len(),
      _ => input.quantity.unwrap_or(order.quantity as usize),
    };
    if quantity == 0 {
      return match order.mode {
        OrderMode::Forward => invalid("egress_ids are required for forward mode"),
        _ => invalid("quantity must be positive"),
      };
    }
    if order.mode == OrderMode::Import && quantity > items.len() {
      return invalid("import orders cannot grow");
    }
    if port != order.port {
      self.ensure_port_ready(port, now).await?;
    }

    let mut updated = order.clone();
    if let Some(name) = input.name.as_deref().map(str::trim).filter(|n| !n.is_empty()) {
      updated.name = name.to_string();
    }
    updated.quantity = quantity as u32;
    updated.port = port;
    updated.expires_at = expires_at;
    updated.status = if live { Status::Active } else { Status::Expired };
    updated.notify_one_day_sent = false;
    updated.notify_expired_sent = false;
    updated.updated_at = now;

    let mut plan = LivePlan::default();
    items.iter().for_each(|item| plan.touch(&order, item));
    let mut changes = ChangeSet::new();
    changes.push(Change::SaveOrder(updated.clone()));

    let (mut kept, mut fresh) = match order.mode {
      OrderMode::Forward => self.sync_forward_items(&updated, &items, &egress_ids, &mut changes, now).await?,
      _ => {
        let mut kept = items.clone();
        kept.sort_by_key(|i| i.id);
        if quantity < kept.len() {
          let removed: Vec<Id> = kept.split_off(quantity).iter().map(|i| i.id).collect();
          debug!("order {} shrinks by items {:?}", id, removed);
          changes.push(Change::DeleteItems(removed));
        }
        let mut fresh = Vec::new();
        if quantity > kept.len() {
          let diff = quantity - kept.len();
          let request = AllocationRequest {
            customer_id: order.customer_id,
            quantity: diff,
            exclude_order: None,
            pinned: (order.mode == OrderMode::Manual && input.host_ids.len() >= diff).then(|| input.host_ids.as_slice()),
          };
          let hosts = self.allocator.hosts(&request, now).await?;
          let ids = self.next_ids(Sequence::Items, hosts.len()).await?;
          fresh = ids.into_iter().zip(hosts.iter()).map(|(id, host)| host_item(id, &updated, host, now)).collect();
        }
        (kept, fresh)
      }
    };

    // Items only follow the order port when it moves; import items keep their own ports otherwise.
    let moved = port != order.port;
    let item_status = if live { Status::Active } else { Status::Expired };
    for item in kept.iter_mut() {
      if moved {
        item.port = port;
      }
      item.status = item_status;
      item.updated_at = now;
    }
    for item in fresh.iter_mut() {
      item.port = port;
      item.status = item_status;
      item.updated_at = now;
    }
    kept.iter().for_each(|item| {
      changes.push(Change::SaveItem(item.clone()));
    });
    fresh.iter().for_each(|item| {
      changes.push(Change::InsertItem(item.clone()));
    });
    self.store.commit(changes).await?;
    info!("order {} updated ({} items, port {}, expires {})", id, quantity, port, expires_at);

    kept.iter().chain(fresh.iter()).for_each(|item| plan.touch(&updated, item));
    let outcome = self.reconcile(plan).await?;
    self.detail(id, outcome).await
  }

  /// Keeps one item per still-targeted egress, drops the rest, adds items for new egresses.
  async fn sync_forward_items(
    &self,
    order: &Order,
    items: &[OrderItem],
    egress_ids: &[Id],
    changes: &mut ChangeSet,
    now: DateTime<Utc>,
  ) -> FleetResult<(Vec<OrderItem>, Vec<OrderItem>)> {
    let request = AllocationRequest {
      customer_id: order.customer_id,
      quantity: egress_ids.len(),
      exclude_order: Some(order.id),
      pinned: Some(egress_ids),
    };
    let egresses = self.allocator.egresses(&request, now).await?;
    let by_id: HashMap<Id, &ForwardEgress> = egresses.iter().map(|e| (e.id, e)).collect();

    let mut sorted = items.to_vec();
    sorted.sort_by_key(|i| i.id);
    let mut keep: BTreeMap<Id, OrderItem> = BTreeMap::new();
    let mut removed = Vec::new();
    for item in sorted {
      match item.forward_egress_id.filter(|e| by_id.contains_key(e)) {
        Some(egress_id) if !keep.contains_key(&egress_id) => {
          keep.insert(egress_id, item);
        }
        _ => removed.push(item.id),
      }
    }
    if !removed.is_empty() {
      changes.push(Change::DeleteItems(removed));
    }

    let mut claims = RouteUserClaims::new(self.store.as_ref());
    let mut kept = Vec::with_capacity(keep.len());
    for (egress_id, mut item) in keep {
      let egress = by_id[&egress_id];
      let (username, gained) = claims.claim(egress, Some(item.id)).await?;
      if let Some(gained) = gained {
        changes.push(Change::SetRouteUser {
          egress_id: gained.id,
          route_user: username.clone(),
        });
      }
      item.username = username;
      item.forward = Some(egress.target());
      item.managed = true;
      kept.push(item);
    }

    let kept_egresses: HashSet<Id> = kept.iter().filter_map(|i| i.forward_egress_id).collect();
    let added: Vec<&ForwardEgress> = egresses.iter().filter(|e| !kept_egresses.contains(&e.id)).collect();
    let mut fresh = Vec::with_capacity(added.len());
    for (id, egress) in self.next_ids(Sequence::Items, added.len()).await?.into_iter().zip(added) {
      fresh.push(self.forward_item(id, order, egress, &mut claims, changes, now).await?);
    }
    Ok((kept, fresh))
  }

  pub async fn deactivate_order(&self, id: Id, status: Status) -> FleetResult<OrderDetail> {
    if status == Status::Active {
      return invalid("deactivation needs a disabled or expired status");
    }
    let (order, items) = self.load(id).await?;
    if order.is_group_head {
      return self.deactivate_group(id, status).await;
    }

    let now = Utc::now();
    let mut updated = order.clone();
    updated.status = status;
    updated.updated_at = now;
    let mut plan = LivePlan::default();
    let mut changes = ChangeSet::new();
    changes.push(Change::SaveOrder(updated));
    for item in items.iter() {
      plan.touch(&order, item);
      let mut item = item.clone();
      item.status = status;
      item.updated_at = now;
      changes.push(Change::SaveItem(item));
    }
    self.store.commit(changes).await?;
    info!("order {} is now {:?}", id, status);

    let outcome = self.reconcile(plan).await?;
    self.detail(id, outcome).await
  }

  /// Extends from `max(now, expiry)`; `days <= 0` renews for the default period.
  pub async fn renew_order(&self, id: Id, days: i64) -> FleetResult<OrderDetail> {
    let (order, items) = self.load(id).await?;
    if order.is_group_head {
      return self.renew_group(id, days).await;
    }

    let now = Utc::now();
    let mut updated = order.clone();
    renew(&mut updated, days, now);
    let mut plan = LivePlan::default();
    let mut changes = ChangeSet::new();
    changes.push(Change::SaveOrder(updated.clone()));
    for item in items.iter() {
      let mut item = item.clone();
      item.status = Status::Active;
      item.updated_at = now;
      plan.touch(&updated, &item);
      changes.push(Change::SaveItem(item));
    }
    self.store.commit(changes).await?;
    info!("order {} renewed until {}", id, updated.expires_at);

    let outcome = self.reconcile(plan).await?;
    self.detail(id, outcome).await
  }

  /// Removes the order, its items, and for group heads every child order.
  pub async fn delete_order(&self, id: Id) -> FleetResult<Outcome> {
    let (order, items) = self.load(id).await?;
    let mut plan = LivePlan::default();
    let mut order_ids = vec![order.id];
    let mut item_ids: Vec<Id> = items.iter().map(|i| i.id).collect();
    items.iter().for_each(|item| plan.touch(&order, item));

    let mut changes = ChangeSet::new();
    if order.is_group_head {
      for child in self.store.children(order.id).await? {
        for item in self.store.items(child.id).await? {
          plan.touch(&child, &item);
          item_ids.push(item.id);
        }
        order_ids.push(child.id);
      }
    }
    if let Some(head_id) = order.parent_order_id {
      if let Some(mut head) = self.store.order(head_id).await? {
        head.quantity = head.quantity.saturating_sub(1);
        head.updated_at = Utc::now();
        changes.push(Change::SaveOrder(head));
      }
    }
    changes.push(Change::DeleteItems(item_ids)).push(Change::DeleteOrders(order_ids.clone()));
    self.store.commit(changes).await?;
    info!("deleted orders {:?}", order_ids);

    match order.is_group_head || order.is_group_child() {
      true => self.resync().await,
      false => self.reconcile(plan).await,
    }
  }

  /// Re-pushes every item of the order to the engine.
  pub async fn resync_order(&self, id: Id) -> FleetResult<Outcome> {
    let (order, items) = self.load(id).await?;
    let mut plan = LivePlan::default();
    items.iter().for_each(|item| plan.touch(&order, item));
    if order.is_group_head {
      for child in self.store.children(order.id).await? {
        for item in self.store.items(child.id).await? {
          plan.touch(&child, &item);
        }
      }
    }
    self.reconcile(plan).await
  }

  pub async fn batch_deactivate(&self, ids: &[Id], status: Status) -> Vec<BatchResult> {
    let mut results = Vec::with_capacity(ids.len());
    for id in ids {
      results.push(BatchResult::of(*id, self.deactivate_order(*id, status).await));
    }
    results
  }

  pub async fn batch_renew(&self, ids: &[Id], days: i64) -> Vec<BatchResult> {
    let mut results = Vec::with_capacity(ids.len());
    for id in ids {
      results.push(BatchResult::of(*id, self.renew_order(*id, days).await));
    }
    results
  }

  pub async fn batch_resync(&self, ids: &[Id]) -> Vec<BatchResult> {
    let mut results = Vec::with_capacity(ids.len());
    for id in ids {
      results.push(BatchResult::of(*id, self.resync_order(*id).await));
    }
    results
  }

  pub async fn preview_import(&self, lines: &str) -> FleetResult<Vec<ImportPreviewRow>> {
    let local = self.host_index().await?;
    Ok(
      parse_import_lines(lines)
        .into_iter()
        .map(|row| ImportPreviewRow {
          local: row.parsed.as_ref().map(|l| local.contains_key(&l.ip)).unwrap_or(false),
          row,
        })
        .collect(),
    )
  }

  /// Creates an order from `ip:port:user:pass` lines. Invalid rows are skipped.
  pub async fn import_order(&self, input: ImportOrder) -> FleetResult<OrderDetail> {
    if input.customer_id == 0 {
      return invalid("customer_id is required");
    }
    let rows = parse_import_lines(&input.lines);
    let total = rows.len();
    let valid: Vec<_> = rows.into_iter().filter_map(|r| r.parsed.ok()).collect();
    let first = match valid.first() {
      Some(first) => first.clone(),
      None => return invalid("no valid import rows"),
    };
    if valid.len() < total {
      warn!("import for customer {} skips {} invalid rows", input.customer_id, total - valid.len());
    }

    let now = Utc::now();
    let expires_at = match input.expires_at {
      Some(at) if at <= now => return invalid("expires_at must be in the future"),
      Some(at) => at,
      None => now + Duration::days(self.config.default_duration_days as i64),
    };
    let local = self.host_index().await?;
    let order = Order {
      id: self.next_id(Sequence::Orders).await?,
      customer_id: input.customer_id,
      name: input
        .name
        .map(|n| n.trim().to_string())
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| default_name("Imported", None, now)),
      mode: OrderMode::Import,
      status: Status::Active,
      quantity: valid.len() as u32,
      port: first.port,
      starts_at: now,
      expires_at,
      notify_one_day_sent: false,
      notify_expired_sent: false,
      group_id: None,
      parent_order_id: None,
      sequence_no: 0,
      is_group_head: false,
      dedicated_entry_id: None,
      dedicated_protocol: None,
      created_at: now,
      updated_at: now,
    };

    let mut changes = ChangeSet::new();
    changes.push(Change::InsertOrder(order.clone()));
    let ids = self.next_ids(Sequence::Items, valid.len()).await?;
    let mut items = Vec::with_capacity(valid.len());
    for (id, line) in ids.into_iter().zip(valid.into_iter()) {
      let mut item = new_item(id, &order, now);
      item.host_ip_id = local.get(&line.ip).copied();
      item.managed = item.host_ip_id.is_some();
      item.ip = Some(line.ip);
      item.port = line.port;
      item.username = line.username;
      item.password = line.password;
      changes.push(Change::InsertItem(item.clone()));
      items.push(item);
    }
    self.store.commit(changes).await?;
    info!(
      "imported order {} for customer {} ({} items, {} managed)",
      order.id,
      order.customer_id,
      items.len(),
      items.iter().filter(|i| i.managed).count()
    );

    let mut plan = LivePlan::default();
    items.iter().for_each(|item| plan.touch(&order, item));
    let outcome = self.reconcile(plan).await?;
    self.detail(order.id, outcome).await
  }

  pub async fn preview_allocation(&self, customer_id: Id, exclude_order: Option<Id>) -> FleetResult<PoolPreview> {
    self.allocator.preview(customer_id, exclude_order, Utc::now()).await
  }

  /// Expires every active order whose time is up. Heads and standalone orders go first so
  /// children already flipped with their head are not visited twice.
  pub async fn expire_due(&self, now: DateTime<Utc>) -> FleetResult<usize> {
    let (children, primary): (Vec<Order>, Vec<Order>) = self.store.due_orders(now).await?.into_iter().partition(|o| o.is_group_child());
    let mut handled = HashSet::new();
    for order in primary.iter() {
      match self.deactivate_order(order.id, Status::Expired).await {
        Ok(_) => {
          handled.insert(order.id);
        }
        Err(e) => warn!("failed to expire order {}. Err = {}", order.id, e),
      }
    }
    let mut expired = handled.len();
    for child in children.iter() {
      if child.parent_order_id.map(|head| handled.contains(&head)).unwrap_or(false) {
        continue;
      }
      match self.deactivate_order(child.id, Status::Expired).await {
        Ok(_) => expired += 1,
        Err(e) => warn!("failed to expire order {}. Err = {}", child.id, e),
      }
    }
    Ok(expired)
  }

  pub(super) async fn load(&self, id: Id) -> FleetResult<(Order, Vec<OrderItem>)> {
    let order = self.store.order(id).await?.ok_or_else(|| FleetError::NotFound(format!("order {}", id)))?;
    let items = self.store.items(id).await?;
    Ok((order, items))
  }

  pub(super) async fn detail(&self, id: Id, outcome: Outcome) -> FleetResult<OrderDetail> {
    let (order, items) = self.load(id).await?;
    Ok(OrderDetail { order, items, outcome })
  }

  pub(super) async fn next_id(&self, sequence: Sequence) -> FleetResult<Id> {
    self
      .store
      .next_ids(sequence, 1)
      .await?
      .into_iter()
      .next()
      .ok_or_else(|| FleetError::Conflict(format!("no id left in sequence {}", sequence.name())))
  }

  pub(super) async fn next_ids(&self, sequence: Sequence, count: usize) -> FleetResult<Vec<Id>> {
    if count == 0 {
      return Ok(Vec::new());
    }
    Ok(self.store.next_ids(sequence, count).await?)
  }

  pub(super) async fn forward_item(
    &self,
    id: Id,
    order: &Order,
    egress: &ForwardEgress,
    claims: &mut RouteUserClaims<'_>,
    changes: &mut ChangeSet,
    now: DateTime<Utc>,
  ) -> FleetResult<OrderItem> {
    let (username, gained) = claims.claim(egress, None).await?;
    if let Some(gained) = gained {
      changes.push(Change::SetRouteUser {
        egress_id: gained.id,
        route_user: username.clone(),
      });
    }
    let mut item = new_item(id, order, now);
    item.username = username;
    item.forward = Some(egress.target());
    item.forward_egress_id = Some(egress.id);
    Ok(item)
  }

  pub(super) fn expiry(&self, now: DateTime<Utc>, duration_days: Option<u32>, expires_at: Option<DateTime<Utc>>) -> FleetResult<DateTime<Utc>> {
    if let Some(at) = expires_at {
      if at <= now {
        return invalid("expires_at must be in the future");
      }
      return Ok(at);
    }
    let days = duration_days.filter(|d| *d > 0).unwrap_or(self.config.default_duration_days);
    Ok(now + Duration::days(days as i64))
  }

  /// A port nobody listens on yet must be bindable before the engine is asked to serve it.
  pub(super) async fn ensure_port_ready(&self, port: u16, now: DateTime<Utc>) -> FleetResult<()> {
    if !self.config.check_port_free {
      return Ok(());
    }
    let active = self.store.active_items(now).await?;
    if active.iter().any(|a| a.item.managed && a.item.port == port) {
      return Ok(());
    }
    probe_port_free(port)
      .await
      .map_err(|e| FleetError::Conflict(format!("target port {} already occupied ({})", port, e)))
  }

  async fn host_index(&self) -> FleetResult<HashMap<IpAddr, Id>> {
    Ok(self.store.host_ips().await?.into_iter().map(|h| (h.ip, h.id)).collect())
  }

  /// Incremental apply of `plan`, falling back to a full resync.
  pub(super) async fn reconcile(&self, plan: LivePlan) -> FleetResult<Outcome> {
    if plan.is_empty() {
      return Ok(Outcome::Incremental);
    }
    let reconciler = self.reconciler.as_ref();
    let active = match self.store.active_items(Utc::now()).await {
      Ok(active) => active,
      Err(e) => return reconciler.fall_back(format!("failed to read active items. Err = {}", e)).await,
    };
    reconciler.apply_incremental(plan.execute(reconciler.control(), reconciler.synth(), &active)).await
  }

  pub(super) async fn resync(&self) -> FleetResult<Outcome> {
    match self.reconciler.full_resync().await {
      Ok(_) => Ok(Outcome::Resynced),
      Err(e) => {
        error!("full resync after commit failed. Err = {}", e);
        Err(e)
      }
    }
  }
}

pub(super) fn new_item(id: Id, order: &Order, now: DateTime<Utc>) -> OrderItem {
  OrderItem {
    id,
    order_id: order.id,
    host_ip_id: None,
    ip: None,
    port: order.port,
    username: random_string(USERNAME_LEN),
    password: random_string(PASSWORD_LEN),
    uuid: None,
    managed: true,
    status: Status::Active,
    forward: None,
    forward_egress_id: None,
    created_at: now,
    updated_at: now,
  }
}

fn host_item(id: Id, order: &Order, host: &HostIp, now: DateTime<Utc>) -> OrderItem {
  let mut item = new_item(id, order, now);
  item.host_ip_id = Some(host.id);
  item.ip = Some(host.ip);
  item
}

/// Moves expiry to `max(now, expiry) + days`, reactivates, and re-arms notifications.
pub(super) fn renew(order: &mut Order, days: i64, now: DateTime<Utc>) {
  let days = if days <= 0 { RENEW_DEFAULT_DAYS } else { days };
  order.expires_at = order.expires_at.max(now) + Duration::days(days);
  order.status = Status::Active;
  order.notify_one_day_sent = false;
  order.notify_expired_sent = false;
  order.updated_at = now;
}
