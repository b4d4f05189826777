use std::net::IpAddr;

use chrono::{DateTime, Utc};
use mongodb::bson::serde_helpers::chrono_datetime_as_bson_datetime;
use serde::{Deserialize, Serialize};

use crate::engine::protocol::Protocol;

pub type Id = u64;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
  Active,
  Expired,
  Disabled,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderMode {
  Auto,
  Manual,
  Forward,
  Import,
  Dedicated,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Order {
  #[serde(rename = "_id")]
  pub id: Id,
  pub customer_id: Id,
  pub name: String,
  pub mode: OrderMode,
  pub status: Status,
  pub quantity: u32,
  pub port: u16,
  #[serde(with = "chrono_datetime_as_bson_datetime")]
  pub starts_at: DateTime<Utc>,
  #[serde(with = "chrono_datetime_as_bson_datetime")]
  pub expires_at: DateTime<Utc>,
  pub notify_one_day_sent: bool,
  pub notify_expired_sent: bool,
  pub group_id: Option<Id>,
  pub parent_order_id: Option<Id>,
  pub sequence_no: u32,
  pub is_group_head: bool,
  pub dedicated_entry_id: Option<Id>,
  pub dedicated_protocol: Option<Protocol>,
  #[serde(with = "chrono_datetime_as_bson_datetime")]
  pub created_at: DateTime<Utc>,
  #[serde(with = "chrono_datetime_as_bson_datetime")]
  pub updated_at: DateTime<Utc>,
}

impl Order {
  pub fn is_live(&self, now: DateTime<Utc>) -> bool {
    self.status == Status::Active && self.expires_at > now
  }

  pub fn is_group_child(&self) -> bool {
    self.parent_order_id.is_some()
  }

  /// Inbound protocol every item of this order is served on.
  pub fn protocol(&self) -> Protocol {
    match self.mode {
      OrderMode::Dedicated => self.dedicated_protocol.unwrap_or(Protocol::Mixed),
      _ => Protocol::Mixed,
    }
  }
}

/// Upstream proxy an item tunnels through instead of a local IP.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardTarget {
  pub address: String,
  pub port: u16,
  pub username: String,
  pub password: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OrderItem {
  #[serde(rename = "_id")]
  pub id: Id,
  pub order_id: Id,
  pub host_ip_id: Option<Id>,
  pub ip: Option<IpAddr>,
  pub port: u16,
  pub username: String,
  pub password: String,
  pub uuid: Option<String>,
  pub managed: bool,
  pub status: Status,
  pub forward: Option<ForwardTarget>,
  pub forward_egress_id: Option<Id>,
  #[serde(with = "chrono_datetime_as_bson_datetime")]
  pub created_at: DateTime<Utc>,
  #[serde(with = "chrono_datetime_as_bson_datetime")]
  pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HostIp {
  #[serde(rename = "_id")]
  pub id: Id,
  pub ip: IpAddr,
  pub is_public: bool,
  pub is_local: bool,
  pub enabled: bool,
  pub comment: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeStatus {
  Unknown,
  Ok,
  Failed,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ForwardEgress {
  #[serde(rename = "_id")]
  pub id: Id,
  pub name: String,
  pub address: String,
  pub port: u16,
  pub username: String,
  pub password: String,
  pub route_user: Option<String>,
  pub exit_ip: Option<String>,
  pub country_code: Option<String>,
  pub enabled: bool,
  pub probe_status: ProbeStatus,
  pub probe_error: Option<String>,
  #[serde(with = "optional_bson_datetime")]
  pub last_probed_at: Option<DateTime<Utc>>,
}

/// Outcome of one egress probe, written field by field so a concurrent route-user claim survives it.
#[derive(Clone, Debug, PartialEq)]
pub struct ProbeRecord {
  pub egress_id: Id,
  pub status: ProbeStatus,
  /// Exit address seen through the egress. `country_code` is only written alongside it.
  pub exit_ip: Option<String>,
  pub country_code: Option<String>,
  pub error: Option<String>,
  pub probed_at: DateTime<Utc>,
  /// Written only while the egress has no route user.
  pub route_user: Option<String>,
}

impl ProbeRecord {
  pub fn apply_to(&self, egress: &mut ForwardEgress) {
    egress.probe_status = self.status;
    egress.probe_error = self.error.clone();
    egress.last_probed_at = Some(self.probed_at);
    if let Some(exit_ip) = &self.exit_ip {
      egress.exit_ip = Some(exit_ip.clone());
      egress.country_code = self.country_code.clone();
    }
    if egress.route_user.is_none() {
      egress.route_user = self.route_user.clone();
    }
  }
}

impl ForwardEgress {
  pub fn target(&self) -> ForwardTarget {
    ForwardTarget {
      address: self.address.clone(),
      port: self.port,
      username: self.username.clone(),
      password: self.password.clone(),
    }
  }
}

/// Ingress binding shared by the orders of a dedicated bundle.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DedicatedEntry {
  #[serde(rename = "_id")]
  pub id: Id,
  pub name: String,
  pub domain: String,
  pub mixed_port: Option<u16>,
  pub vmess_port: Option<u16>,
  pub vless_port: Option<u16>,
  pub shadowsocks_port: Option<u16>,
  pub features: Vec<Protocol>,
  pub enabled: bool,
}

impl DedicatedEntry {
  pub fn port_for(&self, protocol: Protocol) -> Option<u16> {
    if !self.features.contains(&protocol) {
      return None;
    }
    match protocol {
      Protocol::Mixed => self.mixed_port,
      Protocol::Vmess => self.vmess_port,
      Protocol::Vless => self.vless_port,
      Protocol::Shadowsocks => self.shadowsocks_port,
    }
  }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Setting {
  #[serde(rename = "_id")]
  pub key: String,
  pub value: String,
}

/// An active item joined with the parts of its order the engine cares about.
#[derive(Clone, Debug, PartialEq)]
pub struct ActiveItem {
  pub item: OrderItem,
  pub customer_id: Id,
  pub mode: OrderMode,
  pub protocol: Protocol,
}

impl ActiveItem {
  pub fn new(order: &Order, item: OrderItem) -> Self {
    Self {
      item,
      customer_id: order.customer_id,
      mode: order.mode,
      protocol: order.protocol(),
    }
  }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Sequence {
  Orders,
  Items,
  HostIps,
  Egresses,
}

impl Sequence {
  pub fn name(&self) -> &'static str {
    match self {
      Sequence::Orders => "orders",
      Sequence::Items => "order_items",
      Sequence::HostIps => "host_ips",
      Sequence::Egresses => "forward_egresses",
    }
  }
}

pub mod optional_bson_datetime {
  use chrono::{DateTime, Utc};
  use mongodb::bson;
  use serde::{Deserialize, Deserializer, Serialize, Serializer};

  pub fn serialize<S: Serializer>(value: &Option<DateTime<Utc>>, serializer: S) -> Result<S::Ok, S::Error> {
    value.map(bson::DateTime::from_chrono).serialize(serializer)
  }

  pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error> {
    Ok(Option::<bson::DateTime>::deserialize(deserializer)?.map(|dt| dt.to_chrono()))
  }
}


#[cfg(test)]
mod tests {
  use super::*;
  use mongodb::bson;

  #[test]
  fn order_round_trips_through_bson_with_lowercase_enums() {
    let now = Utc::now();
    let mut order = fixtures::order(7, 3, OrderMode::Dedicated, 443, now);
    order.dedicated_protocol = Some(Protocol::Vless);

    let doc = bson::to_document(&order).unwrap();
    assert_eq!(doc.get_str("mode").unwrap(), "dedicated");
    assert_eq!(doc.get_str("status").unwrap(), "active");
    assert_eq!(doc.get_str("dedicated_protocol").unwrap(), "vless");
    assert!(doc.get_datetime("expires_at").is_ok());
    assert_eq!(order.protocol(), Protocol::Vless);
  }

  #[test]
  fn egress_optional_probe_time_is_a_bson_date() {
    let mut egress = fixtures::egress(1, "203.0.113.5");
    egress.last_probed_at = Some(Utc::now());
    let doc = bson::to_document(&egress).unwrap();
    assert!(doc.get_datetime("last_probed_at").is_ok());

    egress.last_probed_at = None;
    let doc = bson::to_document(&egress).unwrap();
    let back: ForwardEgress = bson::from_document(doc).unwrap();
    assert!(back.last_probed_at.is_none());
  }

  #[test]
  fn dedicated_entry_port_requires_feature() {
    let entry = DedicatedEntry {
      id: 1,
      name: "edge".to_string(),
      domain: "edge.example.com".to_string(),
      mixed_port: Some(1080),
      vmess_port: Some(10086),
      vless_port: None,
      shadowsocks_port: Some(8388),
      features: vec![Protocol::Vmess, Protocol::Shadowsocks],
      enabled: true,
    };
    assert_eq!(entry.port_for(Protocol::Vmess), Some(10086));
    assert_eq!(entry.port_for(Protocol::Mixed), None);
    assert_eq!(entry.port_for(Protocol::Vless), None);
  }
}
