//! Typed engine configuration. Field order and map types are fixed so that a
//! document always serializes to the same bytes.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EngineDocument {
  pub log: LogSection,
  pub api: ApiSection,
  pub stats: Stats,
  pub policy: Policy,
  pub inbounds: Vec<Inbound>,
  pub outbounds: Vec<Outbound>,
  pub routing: Routing,
}

impl EngineDocument {
  pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
    let mut bytes = serde_json::to_vec_pretty(self)?;
    bytes.push(b'\n');
    Ok(bytes)
  }

  pub fn inbound(&self, tag: &str) -> Option<&Inbound> {
    self.inbounds.iter().find(|i| i.tag == tag)
  }

  pub fn outbound(&self, tag: &str) -> Option<&Outbound> {
    self.outbounds.iter().find(|o| o.tag == tag)
  }

  pub fn rule(&self, tag: &str) -> Option<&Rule> {
    self.routing.rules.iter().find(|r| r.rule_tag == tag)
  }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LogSection {
  pub loglevel: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ApiSection {
  pub tag: String,
  pub services: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Stats {}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Policy {
  pub levels: BTreeMap<String, LevelPolicy>,
  pub system: SystemPolicy,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LevelPolicy {
  pub stats_user_uplink: bool,
  pub stats_user_downlink: bool,
  pub stats_user_online: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemPolicy {
  pub stats_inbound_uplink: bool,
  pub stats_inbound_downlink: bool,
  pub stats_outbound_uplink: bool,
  pub stats_outbound_downlink: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Inbound {
  pub tag: String,
  pub listen: String,
  pub port: u16,
  pub protocol: String,
  pub settings: InboundSettings,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InboundSettings {
  Mixed(MixedSettings),
  Vless(VlessSettings),
  Vmess(VmessSettings),
  Shadowsocks(ShadowsocksSettings),
  Dokodemo(DokodemoSettings),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MixedSettings {
  pub auth: String,
  pub accounts: Vec<Account>,
  pub udp: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
  pub user: String,
  pub pass: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VmessSettings {
  pub clients: Vec<UuidClient>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VlessSettings {
  pub clients: Vec<UuidClient>,
  pub decryption: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UuidClient {
  pub id: String,
  pub level: u32,
  pub email: String,
  #[serde(skip_serializing_if = "Option::is_none", default)]
  pub decryption: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ShadowsocksSettings {
  pub network: String,
  pub clients: Vec<ShadowsocksClient>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShadowsocksClient {
  pub password: String,
  pub method: String,
  pub level: u32,
  pub email: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DokodemoSettings {
  pub address: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Outbound {
  pub tag: String,
  pub protocol: String,
  #[serde(skip_serializing_if = "Option::is_none", default)]
  pub send_through: Option<String>,
  pub settings: OutboundSettings,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OutboundSettings {
  Socks(SocksSettings),
  Freedom(FreedomSettings),
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FreedomSettings {}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SocksSettings {
  pub servers: Vec<SocksServer>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SocksServer {
  pub address: String,
  pub port: u16,
  #[serde(skip_serializing_if = "Vec::is_empty", default)]
  pub users: Vec<SocksUser>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SocksUser {
  pub user: String,
  pub pass: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Routing {
  pub domain_strategy: String,
  pub rules: Vec<Rule>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
  #[serde(rename = "type")]
  pub kind: String,
  #[serde(skip_serializing_if = "String::is_empty", default)]
  pub rule_tag: String,
  pub inbound_tag: Vec<String>,
  #[serde(skip_serializing_if = "Vec::is_empty", default)]
  pub user: Vec<String>,
  pub outbound_tag: String,
}

/// Payload for adding inbounds through the control API.
#[derive(Serialize)]
pub struct InboundsPayload<'a> {
  pub inbounds: &'a [Inbound],
}

/// Payload for adding outbounds through the control API.
#[derive(Serialize)]
pub struct OutboundsPayload<'a> {
  pub outbounds: &'a [Outbound],
}

#[derive(Serialize)]
pub struct RulesPayload<'a> {
  pub routing: RulesOnly<'a>,
}

#[derive(Serialize)]
pub struct RulesOnly<'a> {
  pub rules: &'a [Rule],
}
