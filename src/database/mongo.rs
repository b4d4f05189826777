use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mongodb::{
  bson::{self, doc, Document},
  options::{FindOneAndUpdateOptions, FindOptions, IndexOptions, ReplaceOptions, ReturnDocument},
  ClientSession, Collection, IndexModel,
};
use serde::de::DeserializeOwned;
use tokio_stream::StreamExt;

use super::error::StoreError;
use super::models::{ActiveItem, DedicatedEntry, ForwardEgress, HostIp, Id, Order, OrderItem, Sequence, Setting};
use super::{Change, ChangeSet, Store};

#[derive(Clone)]
pub struct MongoStore {
  client: mongodb::Client,
  orders: Collection<Order>,
  items: Collection<OrderItem>,
  host_ips: Collection<HostIp>,
  egresses: Collection<ForwardEgress>,
  entries: Collection<DedicatedEntry>,
  settings: Collection<Setting>,
  counters: Collection<Document>,
}

impl MongoStore {
  pub async fn new(client: &mongodb::Client, database: &str) -> Result<Self, StoreError> {
    let db = client.database(database);
    let store = Self {
      client: client.clone(),
      orders: db.collection("orders"),
      items: db.collection("order_items"),
      host_ips: db.collection("host_ips"),
      egresses: db.collection("forward_egresses"),
      entries: db.collection("dedicated_entries"),
      settings: db.collection("settings"),
      counters: db.collection("counters"),
    };
    store.ensure_indexes().await?;
    Ok(store)
  }

  async fn ensure_indexes(&self) -> Result<(), StoreError> {
    let unique = IndexOptions::builder().unique(true).build();
    self
      .items
      .create_index(IndexModel::builder().keys(doc! { "username": 1 }).options(unique).build(), None)
      .await?;
    self.items.create_index(IndexModel::builder().keys(doc! { "order_id": 1 }).build(), None).await?;

    let partial = IndexOptions::builder()
      .unique(true)
      .partial_filter_expression(doc! { "route_user": { "$type": "string" } })
      .build();
    self
      .egresses
      .create_index(IndexModel::builder().keys(doc! { "route_user": 1 }).options(partial).build(), None)
      .await?;
    self
      .orders
      .create_index(IndexModel::builder().keys(doc! { "status": 1, "expires_at": 1 }).build(), None)
      .await?;
    debug!("MongoStore indexes ensured");
    Ok(())
  }

  async fn apply(&self, change: Change, session: &mut ClientSession) -> Result<(), StoreError> {
    let upsert = ReplaceOptions::builder().upsert(true).build();
    match change {
      Change::InsertOrder(order) => {
        self.orders.insert_one_with_session(order, None, session).await?;
      }
      Change::SaveOrder(order) => {
        let result = self.orders.replace_one_with_session(doc! { "_id": order.id as i64 }, &order, None, session).await?;
        if result.matched_count == 0 {
          return Err(StoreError::Missing(format!("order {}", order.id)));
        }
      }
      Change::DeleteOrders(ids) => {
        self.orders.delete_many_with_session(doc! { "_id": { "$in": as_bson_ids(&ids) } }, None, session).await?;
      }
      Change::InsertItem(item) => {
        self.items.insert_one_with_session(item, None, session).await?;
      }
      Change::SaveItem(item) => {
        let result = self.items.replace_one_with_session(doc! { "_id": item.id as i64 }, &item, None, session).await?;
        if result.matched_count == 0 {
          return Err(StoreError::Missing(format!("item {}", item.id)));
        }
      }
      Change::DeleteItems(ids) => {
        self.items.delete_many_with_session(doc! { "_id": { "$in": as_bson_ids(&ids) } }, None, session).await?;
      }
      Change::SaveHostIp(host) => {
        self.host_ips.replace_one_with_session(doc! { "_id": host.id as i64 }, &host, upsert, session).await?;
      }
      Change::SetRouteUser { egress_id, route_user } => {
        let update = doc! { "$set": { "route_user": route_user } };
        let result = self.egresses.update_one_with_session(doc! { "_id": egress_id as i64 }, update, None, session).await?;
        if result.matched_count == 0 {
          return Err(StoreError::Missing(format!("forward egress {}", egress_id)));
        }
      }
      Change::RecordProbe(record) => {
        let id = record.egress_id as i64;
        let mut fields = doc! {
          "probe_status": bson::to_bson(&record.status)?,
          "probe_error": record.error,
          "last_probed_at": bson::DateTime::from_chrono(record.probed_at),
        };
        if let Some(exit_ip) = record.exit_ip {
          fields.insert("exit_ip", exit_ip);
          fields.insert("country_code", record.country_code);
        }
        let result = self.egresses.update_one_with_session(doc! { "_id": id }, doc! { "$set": fields }, None, session).await?;
        if result.matched_count == 0 {
          return Err(StoreError::Missing(format!("forward egress {}", id)));
        }
        if let Some(route_user) = record.route_user {
          let unclaimed = doc! { "_id": id, "route_user": null };
          let update = doc! { "$set": { "route_user": route_user } };
          self.egresses.update_one_with_session(unclaimed, update, None, session).await?;
        }
      }
    }
    Ok(())
  }
}

fn as_bson_ids(ids: &[Id]) -> Vec<i64> {
  ids.iter().map(|&id| id as i64).collect()
}

async fn collect<T: DeserializeOwned + Unpin + Send + Sync>(
  collection: &Collection<T>,
  filter: Document,
  sort: Option<Document>,
) -> Result<Vec<T>, StoreError> {
  let options = FindOptions::builder().sort(sort).build();
  let mut cursor = collection.find(filter, options).await?;
  let mut rows = Vec::new();
  while let Some(result) = cursor.next().await {
    rows.push(result?);
  }
  return Ok(rows);
}

#[async_trait]
impl Store for MongoStore {
  async fn next_ids(&self, sequence: Sequence, count: usize) -> Result<Vec<Id>, StoreError> {
    if count == 0 {
      return Ok(Vec::new());
    }
    let options = FindOneAndUpdateOptions::builder().upsert(true).return_document(ReturnDocument::After).build();
    let counter = self
      .counters
      .find_one_and_update(doc! { "_id": sequence.name() }, doc! { "$inc": { "seq": count as i64 } }, options)
      .await?
      .ok_or_else(|| StoreError::Missing(format!("counter {}", sequence.name())))?;
    let last = counter.get_i64("seq").map_err(|_| StoreError::Missing(format!("counter {}", sequence.name())))? as Id;
    let first = last + 1 - count as Id;
    Ok((first..=last).collect())
  }

  async fn order(&self, id: Id) -> Result<Option<Order>, StoreError> {
    Ok(self.orders.find_one(doc! { "_id": id as i64 }, None).await?)
  }

  async fn items(&self, order_id: Id) -> Result<Vec<OrderItem>, StoreError> {
    collect(&self.items, doc! { "order_id": order_id as i64 }, Some(doc! { "_id": 1 })).await
  }

  async fn children(&self, head_id: Id) -> Result<Vec<Order>, StoreError> {
    collect(&self.orders, doc! { "parent_order_id": head_id as i64 }, Some(doc! { "sequence_no": 1, "_id": 1 })).await
  }

  async fn due_orders(&self, now: DateTime<Utc>) -> Result<Vec<Order>, StoreError> {
    let filter = doc! {
      "status": "active",
      "expires_at": { "$lte": bson::DateTime::from_chrono(now) },
    };
    collect(&self.orders, filter, Some(doc! { "_id": 1 })).await
  }

  async fn active_items(&self, now: DateTime<Utc>) -> Result<Vec<ActiveItem>, StoreError> {
    let filter = doc! {
      "status": "active",
      "expires_at": { "$gt": bson::DateTime::from_chrono(now) },
    };
    let orders: HashMap<Id, Order> = collect(&self.orders, filter, None).await?.into_iter().map(|o| (o.id, o)).collect();
    if orders.is_empty() {
      return Ok(Vec::new());
    }

    let order_ids: Vec<Id> = orders.keys().copied().collect();
    let filter = doc! {
      "status": "active",
      "order_id": { "$in": as_bson_ids(&order_ids) },
    };
    let items = collect(&self.items, filter, Some(doc! { "_id": 1 })).await?;
    Ok(
      items
        .into_iter()
        .filter_map(|item| {
          let order = orders.get(&item.order_id)?;
          Some(ActiveItem::new(order, item))
        })
        .collect(),
    )
  }

  async fn host_ips(&self) -> Result<Vec<HostIp>, StoreError> {
    collect(&self.host_ips, doc! {}, Some(doc! { "_id": 1 })).await
  }

  async fn forward_egresses(&self) -> Result<Vec<ForwardEgress>, StoreError> {
    collect(&self.egresses, doc! {}, Some(doc! { "_id": 1 })).await
  }

  async fn dedicated_entry(&self, id: Id) -> Result<Option<DedicatedEntry>, StoreError> {
    Ok(self.entries.find_one(doc! { "_id": id as i64 }, None).await?)
  }

  async fn username_taken(&self, username: &str, exclude_item: Option<Id>) -> Result<bool, StoreError> {
    let mut filter = doc! { "username": username };
    if let Some(id) = exclude_item {
      filter.insert("_id", doc! { "$ne": id as i64 });
    }
    Ok(self.items.count_documents(filter, None).await? > 0)
  }

  async fn route_user_taken(&self, route_user: &str, exclude_egress: Option<Id>) -> Result<bool, StoreError> {
    let mut filter = doc! { "route_user": route_user };
    if let Some(id) = exclude_egress {
      filter.insert("_id", doc! { "$ne": id as i64 });
    }
    Ok(self.egresses.count_documents(filter, None).await? > 0)
  }

  async fn setting(&self, key: &str) -> Result<Option<String>, StoreError> {
    Ok(self.settings.find_one(doc! { "_id": key }, None).await?.map(|s| s.value))
  }

  async fn commit(&self, changes: ChangeSet) -> Result<(), StoreError> {
    if changes.is_empty() {
      return Ok(());
    }
    let count = changes.len();
    let mut session = self.client.start_session(None).await?;
    session.start_transaction(None).await?;

    for change in changes {
      if let Err(e) = self.apply(change, &mut session).await {
        if let Err(abort) = session.abort_transaction().await {
          warn!("failed to abort transaction. Err = {}", abort);
        }
        return Err(e);
      }
    }

    session.commit_transaction().await?;
    debug!("committed {} changes", count);
    Ok(())
  }
}
