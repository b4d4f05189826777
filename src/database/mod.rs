use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mongodb::{options::ClientOptions, Client};

use self::error::StoreError;
use self::models::{ActiveItem, DedicatedEntry, ForwardEgress, HostIp, Id, Order, OrderItem, ProbeRecord, Sequence};

pub mod error;
#[cfg(test)]
pub mod memory;
pub mod models;
pub mod mongo;

pub async fn initialize_client(uri: String) -> Result<Client, mongodb::error::Error> {
  let client_options = ClientOptions::parse_async(uri).await?;
  Client::with_options(client_options)
}

/// One row mutation inside a [`ChangeSet`].
#[derive(Clone, Debug)]
pub enum Change {
  InsertOrder(Order),
  SaveOrder(Order),
  DeleteOrders(Vec<Id>),
  InsertItem(OrderItem),
  SaveItem(OrderItem),
  DeleteItems(Vec<Id>),
  SaveHostIp(HostIp),
  /// Binds a route user to an egress, replacing any previous one.
  SetRouteUser { egress_id: Id, route_user: String },
  RecordProbe(ProbeRecord),
}

/// Mutations committed atomically, applied in the order they were pushed.
#[derive(Clone, Debug, Default)]
pub struct ChangeSet {
  changes: Vec<Change>,
}

impl ChangeSet {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn push(&mut self, change: Change) -> &mut Self {
    self.changes.push(change);
    self
  }

  pub fn is_empty(&self) -> bool {
    self.changes.is_empty()
  }

  pub fn len(&self) -> usize {
    self.changes.len()
  }

  pub fn changes(&self) -> &[Change] {
    &self.changes
  }
}

impl IntoIterator for ChangeSet {
  type Item = Change;
  type IntoIter = std::vec::IntoIter<Change>;

  fn into_iter(self) -> Self::IntoIter {
    self.changes.into_iter()
  }
}

/// Datastore boundary. Reads are fresh on every call, writes only go through `commit`.
#[async_trait]
pub trait Store: Send + Sync {
  async fn next_ids(&self, sequence: Sequence, count: usize) -> Result<Vec<Id>, StoreError>;

  async fn order(&self, id: Id) -> Result<Option<Order>, StoreError>;

  /// Items of an order, sorted by id.
  async fn items(&self, order_id: Id) -> Result<Vec<OrderItem>, StoreError>;

  /// Child orders of a group head, sorted by sequence number then id.
  async fn children(&self, head_id: Id) -> Result<Vec<Order>, StoreError>;

  /// Active orders whose expiry is at or before `now`.
  async fn due_orders(&self, now: DateTime<Utc>) -> Result<Vec<Order>, StoreError>;

  /// Active items of active, unexpired orders (managed or not), sorted by item id.
  async fn active_items(&self, now: DateTime<Utc>) -> Result<Vec<ActiveItem>, StoreError>;

  async fn host_ips(&self) -> Result<Vec<HostIp>, StoreError>;

  async fn forward_egresses(&self) -> Result<Vec<ForwardEgress>, StoreError>;

  async fn dedicated_entry(&self, id: Id) -> Result<Option<DedicatedEntry>, StoreError>;

  async fn username_taken(&self, username: &str, exclude_item: Option<Id>) -> Result<bool, StoreError>;

  async fn route_user_taken(&self, route_user: &str, exclude_egress: Option<Id>) -> Result<bool, StoreError>;

  async fn setting(&self, key: &str) -> Result<Option<String>, StoreError>;

  async fn commit(&self, changes: ChangeSet) -> Result<(), StoreError>;
}
