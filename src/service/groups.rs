use chrono::{DateTime, Utc};

use crate::database::models::{Id, Order, OrderItem, OrderMode, Sequence, Status};
use crate::database::{Change, ChangeSet};
use crate::engine::protocol::Protocol;
use crate::engine::reconciler::Outcome;
use crate::error::{invalid, FleetError, FleetResult};
use crate::utils::random::random_uuid;

use super::lines::{generate, parse_credential_lines, parse_egress_lines, Credential};
use super::orders::{default_name, new_item, renew, OrderDetail, OrderService};

#[derive(Clone, Debug)]
pub struct GroupMember {
  pub order: Order,
  pub items: Vec<OrderItem>,
}

#[derive(Clone, Debug)]
pub struct GroupDetail {
  pub head: Order,
  pub members: Vec<GroupMember>,
  pub outcome: Outcome,
}

#[derive(Clone, Debug, Default)]
pub struct CreateDedicated {
  pub customer_id: Id,
  pub entry_id: Id,
  pub protocol: Option<Protocol>,
  pub name: Option<String>,
  pub duration_days: Option<u32>,
  pub expires_at: Option<DateTime<Utc>>,
  /// One `addr:port:user:pass` egress per child.
  pub lines: String,
}

#[derive(Clone, Debug, Default)]
pub struct UpdateGroup {
  pub name: Option<String>,
  pub expires_at: Option<DateTime<Utc>>,
  pub port: Option<u16>,
}

fn child_name(base: &str, sequence_no: u32) -> String {
  format!("{}-{:03}", base, sequence_no)
}

fn child_of(head: &Order, id: Id, sequence_no: u32) -> Order {
  Order {
    id,
    name: child_name(&head.name, sequence_no),
    quantity: 1,
    group_id: Some(head.id),
    parent_order_id: Some(head.id),
    sequence_no,
    is_group_head: false,
    ..head.clone()
  }
}

fn apply_credential(item: &mut OrderItem, credential: Credential) {
  if let Some(username) = credential.username {
    item.username = username;
  }
  if let Some(password) = credential.password {
    item.password = password;
  }
  if let Some(uuid) = credential.uuid {
    item.uuid = Some(uuid);
  }
}

impl OrderService {
  /// Turns a multi-item order into a group head with one single-item child per item.
  pub async fn split_order(&self, id: Id) -> FleetResult<GroupDetail> {
    let (order, items) = self.load(id).await?;
    if order.is_group_child() {
      return invalid(format!("order {} is already a group member", id));
    }
    if order.is_group_head {
      return self.group_detail(id, Outcome::Incremental).await;
    }
    if items.len() < 2 {
      return invalid("only orders with at least two items can be split");
    }

    let now = Utc::now();
    let mut head = order.clone();
    head.is_group_head = true;
    head.group_id = Some(head.id);
    head.quantity = items.len() as u32;
    head.updated_at = now;

    let order_ids = self.next_ids(Sequence::Orders, items.len()).await?;
    let item_ids = self.next_ids(Sequence::Items, items.len()).await?;
    let mut changes = ChangeSet::new();
    changes
      .push(Change::SaveOrder(head.clone()))
      .push(Change::DeleteItems(items.iter().map(|i| i.id).collect()));
    for (seq, ((order_id, item_id), item)) in order_ids.into_iter().zip(item_ids).zip(items.iter()).enumerate() {
      let mut child = child_of(&head, order_id, seq as u32 + 1);
      child.created_at = now;
      child.updated_at = now;
      let moved = OrderItem {
        id: item_id,
        order_id: child.id,
        updated_at: now,
        ..item.clone()
      };
      changes.push(Change::InsertOrder(child)).push(Change::InsertItem(moved));
    }
    self.store.commit(changes).await?;
    info!("order {} split into {} child orders", id, items.len());

    let outcome = self.resync().await?;
    self.group_detail(id, outcome).await
  }

  /// Creates a dedicated bundle: a head and one single-item child per egress line, served on the entry's protocol port.
  pub async fn create_dedicated_order(&self, input: CreateDedicated) -> FleetResult<GroupDetail> {
    if input.customer_id == 0 {
      return invalid("customer_id is required");
    }
    let protocol = input.protocol.unwrap_or(Protocol::Mixed);
    let entry = self
      .store
      .dedicated_entry(input.entry_id)
      .await?
      .ok_or_else(|| FleetError::NotFound(format!("dedicated entry {}", input.entry_id)))?;
    if !entry.enabled {
      return invalid(format!("dedicated entry {} is disabled", entry.name));
    }
    let port = match entry.port_for(protocol) {
      Some(port) if port > 0 => port,
      _ => return invalid(format!("dedicated entry {} does not serve {}", entry.name, protocol)),
    };
    let targets = parse_egress_lines(&input.lines)?;

    let now = Utc::now();
    self.ensure_port_ready(port, now).await?;
    let expires_at = self.expiry(now, input.duration_days, input.expires_at)?;

    let head_id = self.next_id(Sequence::Orders).await?;
    let head = Order {
      id: head_id,
      customer_id: input.customer_id,
      name: input
        .name
        .map(|n| n.trim().to_string())
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| default_name("Dedicated", Some(input.customer_id), now)),
      mode: OrderMode::Dedicated,
      status: Status::Active,
      quantity: targets.len() as u32,
      port,
      starts_at: now,
      expires_at,
      notify_one_day_sent: false,
      notify_expired_sent: false,
      group_id: Some(head_id),
      parent_order_id: None,
      sequence_no: 0,
      is_group_head: true,
      dedicated_entry_id: Some(entry.id),
      dedicated_protocol: Some(protocol),
      created_at: now,
      updated_at: now,
    };

    let order_ids = self.next_ids(Sequence::Orders, targets.len()).await?;
    let item_ids = self.next_ids(Sequence::Items, targets.len()).await?;
    let mut changes = ChangeSet::new();
    changes.push(Change::InsertOrder(head.clone()));
    for (seq, ((order_id, item_id), target)) in order_ids.into_iter().zip(item_ids).zip(targets.into_iter()).enumerate() {
      let child = child_of(&head, order_id, seq as u32 + 1);
      let mut item = new_item(item_id, &child, now);
      item.uuid = Some(random_uuid());
      item.forward = Some(target);
      changes.push(Change::InsertOrder(child)).push(Change::InsertItem(item));
    }
    self.store.commit(changes).await?;
    info!(
      "dedicated bundle {} created for customer {} ({} x {} on port {})",
      head.id, head.customer_id, head.quantity, protocol, port
    );

    let outcome = self.resync().await?;
    self.group_detail(head.id, outcome).await
  }

  pub async fn update_group(&self, head_id: Id, input: UpdateGroup) -> FleetResult<GroupDetail> {
    let (head, children) = self.load_group(head_id).await?;
    let now = Utc::now();
    let port = match input.port {
      Some(0) => return invalid("invalid port"),
      Some(port) => port,
      None => head.port,
    };
    if port != head.port {
      self.ensure_port_ready(port, now).await?;
    }
    let expires_at = input.expires_at.unwrap_or(head.expires_at);
    let status = if expires_at > now { Status::Active } else { Status::Expired };

    let mut updated = head.clone();
    if let Some(name) = input.name.as_deref().map(str::trim).filter(|n| !n.is_empty()) {
      updated.name = name.to_string();
    }
    updated.port = port;
    updated.expires_at = expires_at;
    updated.status = status;
    updated.notify_one_day_sent = false;
    updated.notify_expired_sent = false;
    updated.updated_at = now;

    let mut changes = ChangeSet::new();
    changes.push(Change::SaveOrder(updated.clone()));
    for child in children.iter() {
      let renamed = Order {
        name: child_name(&updated.name, child.sequence_no),
        port,
        expires_at,
        status,
        notify_one_day_sent: false,
        notify_expired_sent: false,
        updated_at: now,
        ..child.clone()
      };
      changes.push(Change::SaveOrder(renamed));
      for item in self.store.items(child.id).await? {
        changes.push(Change::SaveItem(OrderItem {
          port,
          status,
          updated_at: now,
          ..item
        }));
      }
    }
    self.store.commit(changes).await?;
    info!("group {} updated (port {}, expires {})", head_id, port, expires_at);

    let outcome = self.resync().await?;
    self.group_detail(head_id, outcome).await
  }

  pub async fn deactivate_group(&self, head_id: Id, status: Status) -> FleetResult<OrderDetail> {
    if status == Status::Active {
      return invalid("deactivation needs a disabled or expired status");
    }
    let (head, children) = self.load_group(head_id).await?;
    let now = Utc::now();
    let mut changes = ChangeSet::new();
    for order in std::iter::once(&head).chain(children.iter()) {
      changes.push(Change::SaveOrder(Order {
        status,
        updated_at: now,
        ..order.clone()
      }));
      for item in self.store.items(order.id).await? {
        changes.push(Change::SaveItem(OrderItem {
          status,
          updated_at: now,
          ..item
        }));
      }
    }
    self.store.commit(changes).await?;
    info!("group {} and {} children are now {:?}", head_id, children.len(), status);

    let outcome = self.resync().await?;
    self.detail(head_id, outcome).await
  }

  pub async fn renew_group(&self, head_id: Id, days: i64) -> FleetResult<OrderDetail> {
    let (head, children) = self.load_group(head_id).await?;
    let now = Utc::now();
    let mut updated = head.clone();
    renew(&mut updated, days, now);

    let mut changes = ChangeSet::new();
    changes.push(Change::SaveOrder(updated.clone()));
    for order in std::iter::once(&head).chain(children.iter()) {
      if order.id != head.id {
        changes.push(Change::SaveOrder(Order {
          expires_at: updated.expires_at,
          status: Status::Active,
          notify_one_day_sent: false,
          notify_expired_sent: false,
          updated_at: now,
          ..order.clone()
        }));
      }
      for item in self.store.items(order.id).await? {
        changes.push(Change::SaveItem(OrderItem {
          status: Status::Active,
          updated_at: now,
          ..item
        }));
      }
    }
    self.store.commit(changes).await?;
    info!("group {} renewed until {}", head_id, updated.expires_at);

    let outcome = self.resync().await?;
    self.detail(head_id, outcome).await
  }

  /// Points every child at a new upstream, one `addr:port:user:pass` line per child in sequence order.
  pub async fn rewrite_group_egress(&self, head_id: Id, lines: &str) -> FleetResult<GroupDetail> {
    let (_, children) = self.load_group(head_id).await?;
    let targets = parse_egress_lines(lines)?;
    if targets.len() != children.len() {
      return invalid(format!("expected {} egress lines, got {}", children.len(), targets.len()));
    }

    let now = Utc::now();
    let mut changes = ChangeSet::new();
    for (child, target) in children.iter().zip(targets.into_iter()) {
      for item in self.store.items(child.id).await? {
        changes.push(Change::SaveItem(OrderItem {
          forward: Some(target.clone()),
          forward_egress_id: None,
          updated_at: now,
          ..item
        }));
      }
    }
    self.store.commit(changes).await?;
    info!("group {} egress rewritten for {} children", head_id, children.len());

    let outcome = self.resync().await?;
    self.group_detail(head_id, outcome).await
  }

  /// Replaces child credentials from `lines`, or regenerates them all when `lines` is `None`.
  pub async fn rewrite_group_credentials(&self, head_id: Id, lines: Option<&str>) -> FleetResult<GroupDetail> {
    let (head, children) = self.load_group(head_id).await?;
    let protocol = head.protocol();
    let credentials = match lines {
      Some(lines) => parse_credential_lines(protocol, lines)?,
      None => children.iter().map(|_| generate(protocol)).collect(),
    };
    if credentials.len() != children.len() {
      return invalid(format!("expected {} credential lines, got {}", children.len(), credentials.len()));
    }

    let now = Utc::now();
    let mut changes = ChangeSet::new();
    for (child, credential) in children.iter().zip(credentials.into_iter()) {
      for mut item in self.store.items(child.id).await? {
        apply_credential(&mut item, credential.clone());
        item.updated_at = now;
        changes.push(Change::SaveItem(item));
      }
    }
    self.store.commit(changes).await?;
    info!("group {} {} credentials rewritten", head_id, protocol);

    let outcome = self.resync().await?;
    self.group_detail(head_id, outcome).await
  }

  async fn load_group(&self, head_id: Id) -> FleetResult<(Order, Vec<Order>)> {
    let (head, _) = self.load(head_id).await?;
    if !head.is_group_head {
      return invalid(format!("order {} is not a group head", head_id));
    }
    let children = self.store.children(head_id).await?;
    Ok((head, children))
  }

  pub async fn group_detail(&self, head_id: Id, outcome: Outcome) -> FleetResult<GroupDetail> {
    let (head, children) = self.load_group(head_id).await?;
    let mut members = Vec::with_capacity(children.len());
    for order in children {
      let items = self.store.items(order.id).await?;
      members.push(GroupMember { order, items });
    }
    Ok(GroupDetail { head, members, outcome })
  }
}

#[cfg(test)]
mod tests {
  use std::collections::BTreeSet;
  use std::sync::atomic::Ordering;

  use chrono::Duration;

  use super::*;
  use crate::database::models::DedicatedEntry;
  use crate::database::Store;
  use crate::engine::control::testing::FakeControl;
  use crate::engine::document::{EngineDocument, InboundSettings};
  use crate::service::orders::CreateOrder;
  use crate::service::testing::{seed_hosts, service, Fixture};

  const VLESS_PORT: u16 = 8443;

  async fn add_entry(f: &Fixture) {
    f.h.store
      .add_entry(DedicatedEntry {
        id: 1,
        name: "edge".to_string(),
        domain: "edge.example.com".to_string(),
        mixed_port: Some(1090),
        vmess_port: None,
        vless_port: Some(VLESS_PORT),
        shadowsocks_port: None,
        features: vec![Protocol::Mixed, Protocol::Vless],
        enabled: true,
      })
      .await;
  }

  async fn bundle(f: &Fixture, lines: &str) -> GroupDetail {
    add_entry(f).await;
    f.orders
      .create_dedicated_order(CreateDedicated {
        customer_id: 9,
        entry_id: 1,
        protocol: Some(Protocol::Vless),
        lines: lines.to_string(),
        ..Default::default()
      })
      .await
      .unwrap()
  }

  fn vless_clients(document: &EngineDocument) -> BTreeSet<String> {
    let tag = format!("fleet-in-vless-{}", VLESS_PORT);
    match document.inbound(&tag).map(|i| &i.settings) {
      Some(InboundSettings::Vless(settings)) => settings.clients.iter().map(|c| c.id.clone()).collect(),
      _ => BTreeSet::new(),
    }
  }

  #[tokio::test]
  async fn split_moves_each_item_into_its_own_child() {
    let f = service(FakeControl::default());
    seed_hosts(&f, 3).await;
    let created = f
      .orders
      .create_order(CreateOrder {
        customer_id: 1,
        quantity: 3,
        ..Default::default()
      })
      .await
      .unwrap();

    let group = f.orders.split_order(created.order.id).await.unwrap();
    assert_eq!(group.outcome, Outcome::Resynced);
    assert!(group.head.is_group_head);
    assert_eq!(group.head.quantity, 3);
    assert!(f.h.store.items(group.head.id).await.unwrap().is_empty());
    assert_eq!(group.members.len(), 3);
    for (idx, member) in group.members.iter().enumerate() {
      assert_eq!(member.order.parent_order_id, Some(created.order.id));
      assert_eq!(member.order.name, format!("{}-{:03}", created.order.name, idx + 1));
      assert_eq!(member.items.len(), 1);
      assert_eq!(member.items[0].username, created.items[idx].username);
      assert_eq!(member.items[0].ip, created.items[idx].ip);
    }

    let document = f.h.reconciler.write_config().await.unwrap();
    assert!(document.outbound(&format!("fleet-out-{}", group.members[0].items[0].id)).is_some());
    assert!(document.outbound(&format!("fleet-out-{}", created.items[0].id)).is_none());

    let again = f.orders.split_order(created.order.id).await.unwrap();
    assert_eq!(again.members.len(), 3);
    assert_eq!(f.h.process.restarts.load(Ordering::SeqCst), 1);
    assert!(matches!(f.orders.split_order(group.members[0].order.id).await, Err(FleetError::Validation(_))));
  }

  #[tokio::test]
  async fn single_item_orders_cannot_split() {
    let f = service(FakeControl::default());
    seed_hosts(&f, 1).await;
    let created = f
      .orders
      .create_order(CreateOrder {
        customer_id: 1,
        quantity: 1,
        ..Default::default()
      })
      .await
      .unwrap();
    assert!(matches!(f.orders.split_order(created.order.id).await, Err(FleetError::Validation(_))));
  }

  #[tokio::test]
  async fn dedicated_bundle_serves_its_protocol_port() {
    let f = service(FakeControl::default());
    let group = bundle(&f, "203.0.113.1:1080:a:b\n203.0.113.2:1080:c:d\n").await;
    assert_eq!(group.head.mode, OrderMode::Dedicated);
    assert_eq!(group.head.port, VLESS_PORT);
    assert_eq!(group.head.quantity, 2);
    assert!(group.head.name.starts_with("Dedicated-9-"));
    assert_eq!(group.members[1].order.name, format!("{}-002", group.head.name));

    let item = &group.members[0].items[0];
    assert_eq!(item.username.len(), 8);
    assert_eq!(item.password.len(), 12);
    assert_eq!(item.forward.as_ref().unwrap().address, "203.0.113.1");

    let document = f.h.reconciler.write_config().await.unwrap();
    let expected: BTreeSet<String> = group.members.iter().filter_map(|m| m.items[0].uuid.clone()).collect();
    assert_eq!(vless_clients(&document), expected);
    assert_eq!(document.outbound(&format!("fleet-out-{}", item.id)).unwrap().protocol, "socks");
  }

  #[tokio::test]
  async fn dedicated_bundle_needs_a_served_protocol() {
    let f = service(FakeControl::default());
    add_entry(&f).await;
    let err = f
      .orders
      .create_dedicated_order(CreateDedicated {
        customer_id: 9,
        entry_id: 1,
        protocol: Some(Protocol::Vmess),
        lines: "203.0.113.1:1080:a:b".to_string(),
        ..Default::default()
      })
      .await;
    assert!(matches!(err, Err(FleetError::Validation(_))));
    let err = f
      .orders
      .create_dedicated_order(CreateDedicated {
        customer_id: 9,
        entry_id: 2,
        lines: "203.0.113.1:1080:a:b".to_string(),
        ..Default::default()
      })
      .await;
    assert!(matches!(err, Err(FleetError::NotFound(_))));
  }

  #[tokio::test]
  async fn egress_rewrite_must_match_child_count() {
    let f = service(FakeControl::default());
    let group = bundle(&f, "203.0.113.1:1080:a:b\n203.0.113.2:1080:c:d\n").await;

    let err = f.orders.rewrite_group_egress(group.head.id, "198.51.100.1:1080:x:y").await;
    assert!(matches!(err, Err(FleetError::Validation(_))));
    assert_eq!(f.h.process.restarts.load(Ordering::SeqCst), 1);

    let rewritten = f
      .orders
      .rewrite_group_egress(group.head.id, "198.51.100.1:1080:x:y\n198.51.100.2:1081:z:w")
      .await
      .unwrap();
    let second = rewritten.members[1].items[0].forward.as_ref().unwrap();
    assert_eq!((second.address.as_str(), second.port), ("198.51.100.2", 1081));
    assert_eq!(f.h.process.restarts.load(Ordering::SeqCst), 2);
  }

  #[tokio::test]
  async fn credential_rewrite_follows_protocol_shape() {
    let f = service(FakeControl::default());
    let group = bundle(&f, "203.0.113.1:1080:a:b\n203.0.113.2:1080:c:d\n").await;

    let regenerated = f.orders.rewrite_group_credentials(group.head.id, None).await.unwrap();
    for (before, after) in group.members.iter().zip(regenerated.members.iter()) {
      assert_ne!(before.items[0].uuid, after.items[0].uuid);
      assert_eq!(before.items[0].username, after.items[0].username);
    }

    let lines = "0b6ca2a8-5bd8-4e5b-b1cb-6f7b5d3e2c10\n1c7db3b9-6ce9-4f6c-82dc-7a8c6e4f3d21";
    let given = f.orders.rewrite_group_credentials(group.head.id, Some(lines)).await.unwrap();
    assert_eq!(given.members[1].items[0].uuid.as_deref(), Some("1c7db3b9-6ce9-4f6c-82dc-7a8c6e4f3d21"));
    let document = f.h.reconciler.write_config().await.unwrap();
    assert!(vless_clients(&document).contains("0b6ca2a8-5bd8-4e5b-b1cb-6f7b5d3e2c10"));

    let err = f.orders.rewrite_group_credentials(group.head.id, Some("0b6ca2a8-5bd8-4e5b-b1cb-6f7b5d3e2c10")).await;
    assert!(matches!(err, Err(FleetError::Validation(_))));
  }

  #[tokio::test]
  async fn group_lifecycle_runs_through_the_head() {
    let f = service(FakeControl::default());
    let group = bundle(&f, "203.0.113.1:1080:a:b\n203.0.113.2:1080:c:d\n").await;
    let head = group.head.id;

    f.orders.deactivate_order(head, Status::Disabled).await.unwrap();
    for member in f.orders.group_detail(head, Outcome::Incremental).await.unwrap().members {
      assert_eq!(member.order.status, Status::Disabled);
      assert!(member.items.iter().all(|i| i.status == Status::Disabled));
    }
    let document = f.h.reconciler.write_config().await.unwrap();
    assert!(vless_clients(&document).is_empty());

    let renewed = f.orders.renew_order(head, 7).await.unwrap();
    assert_eq!(renewed.order.status, Status::Active);
    let detail = f.orders.group_detail(head, Outcome::Incremental).await.unwrap();
    assert!(detail.members.iter().all(|m| m.order.expires_at == renewed.order.expires_at && m.order.status == Status::Active));

    let moved = f
      .orders
      .update_group(
        head,
        UpdateGroup {
          name: Some("Bundle".to_string()),
          port: Some(9443),
          ..Default::default()
        },
      )
      .await
      .unwrap();
    assert_eq!(moved.members[0].order.name, "Bundle-001");
    assert!(moved.members.iter().all(|m| m.items[0].port == 9443));
    let document = f.h.reconciler.write_config().await.unwrap();
    assert!(document.inbound("fleet-in-vless-9443").is_some());
    assert!(matches!(
      f.orders.update_order(head, Default::default()).await,
      Err(FleetError::Validation(_))
    ));
  }

  #[tokio::test]
  async fn deleting_children_keeps_head_quantity_in_step() {
    let f = service(FakeControl::default());
    let group = bundle(&f, "203.0.113.1:1080:a:b\n203.0.113.2:1080:c:d\n").await;

    f.orders.delete_order(group.members[0].order.id).await.unwrap();
    let head = f.h.store.order(group.head.id).await.unwrap().unwrap();
    assert_eq!(head.quantity, 1);

    f.orders.delete_order(group.head.id).await.unwrap();
    assert!(f.h.store.all_orders().await.is_empty());
    assert!(f.h.store.all_items().await.is_empty());
  }

  #[tokio::test]
  async fn sweep_expires_groups_once() {
    let f = service(FakeControl::default());
    let group = bundle(&f, "203.0.113.1:1080:a:b\n203.0.113.2:1080:c:d\n").await;
    let expired = f.orders.expire_due(group.head.expires_at + Duration::seconds(1)).await.unwrap();
    assert_eq!(expired, 1);
    let detail = f.orders.group_detail(group.head.id, Outcome::Incremental).await.unwrap();
    assert_eq!(detail.head.status, Status::Expired);
    assert!(detail.members.iter().all(|m| m.order.status == Status::Expired));
  }
}
