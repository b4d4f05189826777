use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use super::error::StoreError;
use super::models::{ActiveItem, DedicatedEntry, ForwardEgress, HostIp, Id, Order, OrderItem, Sequence, Status};
use super::{Change, ChangeSet, Store};

#[derive(Clone, Default)]
struct Tables {
  sequences: HashMap<Sequence, Id>,
  orders: BTreeMap<Id, Order>,
  items: BTreeMap<Id, OrderItem>,
  host_ips: BTreeMap<Id, HostIp>,
  egresses: BTreeMap<Id, ForwardEgress>,
  entries: BTreeMap<Id, DedicatedEntry>,
  settings: HashMap<String, String>,
}

impl Tables {
  fn apply(&mut self, change: Change) -> Result<(), StoreError> {
    match change {
      Change::InsertOrder(order) => {
        if self.orders.contains_key(&order.id) {
          return Err(StoreError::Conflict(format!("order {}", order.id)));
        }
        self.orders.insert(order.id, order);
      }
      Change::SaveOrder(order) => {
        if !self.orders.contains_key(&order.id) {
          return Err(StoreError::Missing(format!("order {}", order.id)));
        }
        self.orders.insert(order.id, order);
      }
      Change::DeleteOrders(ids) => ids.iter().for_each(|id| {
        self.orders.remove(id);
      }),
      Change::InsertItem(item) => {
        if self.items.contains_key(&item.id) {
          return Err(StoreError::Conflict(format!("item {}", item.id)));
        }
        self.items.insert(item.id, item);
      }
      Change::SaveItem(item) => {
        if !self.items.contains_key(&item.id) {
          return Err(StoreError::Missing(format!("item {}", item.id)));
        }
        self.items.insert(item.id, item);
      }
      Change::DeleteItems(ids) => ids.iter().for_each(|id| {
        self.items.remove(id);
      }),
      Change::SaveHostIp(host) => {
        self.host_ips.insert(host.id, host);
      }
      Change::SetRouteUser { egress_id, route_user } => {
        let egress = self.egresses.get_mut(&egress_id).ok_or_else(|| StoreError::Missing(format!("forward egress {}", egress_id)))?;
        egress.route_user = Some(route_user);
      }
      Change::RecordProbe(record) => {
        let egress = self
          .egresses
          .get_mut(&record.egress_id)
          .ok_or_else(|| StoreError::Missing(format!("forward egress {}", record.egress_id)))?;
        record.apply_to(egress);
      }
    }
    Ok(())
  }

  fn check_unique(&self) -> Result<(), StoreError> {
    let mut usernames = HashSet::new();
    for item in self.items.values() {
      if !usernames.insert(item.username.as_str()) {
        return Err(StoreError::Conflict(format!("username {}", item.username)));
      }
    }
    let mut route_users = HashSet::new();
    for route_user in self.egresses.values().filter_map(|e| e.route_user.as_deref()) {
      if !route_users.insert(route_user) {
        return Err(StoreError::Conflict(format!("route user {}", route_user)));
      }
    }
    Ok(())
  }
}

/// In-process store with the same transactional contract as [`super::mongo::MongoStore`].
#[derive(Default)]
pub struct MemoryStore {
  tables: Mutex<Tables>,
  failing_active_reads: AtomicUsize,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }

  pub async fn add_host_ip(&self, host: HostIp) {
    let mut tables = self.tables.lock().await;
    bump(&mut tables, Sequence::HostIps, host.id);
    tables.host_ips.insert(host.id, host);
  }

  pub async fn add_egress(&self, egress: ForwardEgress) {
    let mut tables = self.tables.lock().await;
    bump(&mut tables, Sequence::Egresses, egress.id);
    tables.egresses.insert(egress.id, egress);
  }

  pub async fn add_entry(&self, entry: DedicatedEntry) {
    self.tables.lock().await.entries.insert(entry.id, entry);
  }

  pub async fn add_order(&self, order: Order, items: Vec<OrderItem>) {
    let mut tables = self.tables.lock().await;
    bump(&mut tables, Sequence::Orders, order.id);
    tables.orders.insert(order.id, order);
    for item in items {
      bump(&mut tables, Sequence::Items, item.id);
      tables.items.insert(item.id, item);
    }
  }

  pub async fn put_setting(&self, key: &str, value: &str) {
    self.tables.lock().await.settings.insert(key.to_string(), value.to_string());
  }

  /// Makes the next `count` active item reads fail.
  pub fn fail_active_reads(&self, count: usize) {
    self.failing_active_reads.store(count, Ordering::SeqCst);
  }

  pub async fn all_items(&self) -> Vec<OrderItem> {
    self.tables.lock().await.items.values().cloned().collect()
  }

  pub async fn all_orders(&self) -> Vec<Order> {
    self.tables.lock().await.orders.values().cloned().collect()
  }
}

fn bump(tables: &mut Tables, sequence: Sequence, id: Id) {
  let current = tables.sequences.entry(sequence).or_insert(0);
  *current = (*current).max(id);
}

#[async_trait]
impl Store for MemoryStore {
  async fn next_ids(&self, sequence: Sequence, count: usize) -> Result<Vec<Id>, StoreError> {
    let mut tables = self.tables.lock().await;
    let current = tables.sequences.entry(sequence).or_insert(0);
    let first = *current + 1;
    *current += count as Id;
    Ok((first..first + count as Id).collect())
  }

  async fn order(&self, id: Id) -> Result<Option<Order>, StoreError> {
    Ok(self.tables.lock().await.orders.get(&id).cloned())
  }

  async fn items(&self, order_id: Id) -> Result<Vec<OrderItem>, StoreError> {
    let tables = self.tables.lock().await;
    Ok(tables.items.values().filter(|i| i.order_id == order_id).cloned().collect())
  }

  async fn children(&self, head_id: Id) -> Result<Vec<Order>, StoreError> {
    let tables = self.tables.lock().await;
    let mut children: Vec<Order> = tables.orders.values().filter(|o| o.parent_order_id == Some(head_id)).cloned().collect();
    children.sort_by_key(|o| (o.sequence_no, o.id));
    Ok(children)
  }

  async fn due_orders(&self, now: DateTime<Utc>) -> Result<Vec<Order>, StoreError> {
    let tables = self.tables.lock().await;
    Ok(tables.orders.values().filter(|o| o.status == Status::Active && o.expires_at <= now).cloned().collect())
  }

  async fn active_items(&self, now: DateTime<Utc>) -> Result<Vec<ActiveItem>, StoreError> {
    let failing = self.failing_active_reads.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    if failing.is_ok() {
      return Err(StoreError::Missing("active items".to_string()));
    }
    let tables = self.tables.lock().await;
    let mut active = Vec::new();
    for item in tables.items.values().filter(|i| i.status == Status::Active) {
      let order = match tables.orders.get(&item.order_id) {
        Some(o) if o.is_live(now) => o,
        _ => continue,
      };
      active.push(ActiveItem::new(order, item.clone()));
    }
    Ok(active)
  }

  async fn host_ips(&self) -> Result<Vec<HostIp>, StoreError> {
    Ok(self.tables.lock().await.host_ips.values().cloned().collect())
  }

  async fn forward_egresses(&self) -> Result<Vec<ForwardEgress>, StoreError> {
    Ok(self.tables.lock().await.egresses.values().cloned().collect())
  }

  async fn dedicated_entry(&self, id: Id) -> Result<Option<DedicatedEntry>, StoreError> {
    Ok(self.tables.lock().await.entries.get(&id).cloned())
  }

  async fn username_taken(&self, username: &str, exclude_item: Option<Id>) -> Result<bool, StoreError> {
    let tables = self.tables.lock().await;
    Ok(tables.items.values().any(|i| i.username == username && Some(i.id) != exclude_item))
  }

  async fn route_user_taken(&self, route_user: &str, exclude_egress: Option<Id>) -> Result<bool, StoreError> {
    let tables = self.tables.lock().await;
    Ok(tables.egresses.values().any(|e| e.route_user.as_deref() == Some(route_user) && Some(e.id) != exclude_egress))
  }

  async fn setting(&self, key: &str) -> Result<Option<String>, StoreError> {
    Ok(self.tables.lock().await.settings.get(key).cloned())
  }

  async fn commit(&self, changes: ChangeSet) -> Result<(), StoreError> {
    let mut tables = self.tables.lock().await;
    let mut staged = tables.clone();
    for change in changes {
      staged.apply(change)?;
    }
    staged.check_unique()?;
    *tables = staged;
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::database::models::{fixtures, OrderMode};

  #[tokio::test]
  async fn commit_is_all_or_nothing() {
    let store = MemoryStore::new();
    let now = Utc::now();
    store.add_order(fixtures::order(1, 1, OrderMode::Auto, 23457, now), vec![fixtures::item(1, 1, "10.0.0.1", 23457, now)]).await;

    let mut duplicate = fixtures::item(2, 1, "10.0.0.2", 23457, now);
    duplicate.username = "user1".to_string();
    let mut changes = ChangeSet::new();
    changes.push(Change::InsertItem(fixtures::item(3, 1, "10.0.0.3", 23457, now))).push(Change::InsertItem(duplicate));

    assert!(matches!(store.commit(changes).await, Err(StoreError::Conflict(_))));
    assert_eq!(store.all_items().await.len(), 1);
  }

  #[tokio::test]
  async fn delete_before_insert_frees_username() {
    let store = MemoryStore::new();
    let now = Utc::now();
    store.add_order(fixtures::order(1, 1, OrderMode::Auto, 23457, now), vec![fixtures::item(1, 1, "10.0.0.1", 23457, now)]).await;

    let mut moved = fixtures::item(2, 1, "10.0.0.1", 23457, now);
    moved.username = "user1".to_string();
    let mut changes = ChangeSet::new();
    changes.push(Change::DeleteItems(vec![1])).push(Change::InsertItem(moved));
    store.commit(changes).await.unwrap();

    let items = store.all_items().await;
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].id, 2);
  }

  #[tokio::test]
  async fn next_ids_continue_after_seeded_rows() {
    let store = MemoryStore::new();
    store.add_host_ip(fixtures::host_ip(5, "10.0.0.5")).await;
    assert_eq!(store.next_ids(Sequence::HostIps, 2).await.unwrap(), vec![6, 7]);
    assert_eq!(store.next_ids(Sequence::Orders, 1).await.unwrap(), vec![1]);
  }

  #[tokio::test]
  async fn active_items_skip_expired_orders() {
    let store = MemoryStore::new();
    let now = Utc::now();
    let mut expired = fixtures::order(2, 1, OrderMode::Auto, 23457, now);
    expired.expires_at = now - chrono::Duration::minutes(1);
    store.add_order(fixtures::order(1, 1, OrderMode::Auto, 23457, now), vec![fixtures::item(1, 1, "10.0.0.1", 23457, now)]).await;
    store.add_order(expired, vec![fixtures::item(2, 2, "10.0.0.2", 23457, now)]).await;

    let active = store.active_items(now).await.unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].item.id, 1);
    assert_eq!(store.due_orders(now).await.unwrap().len(), 1);
  }
}
