use std::collections::BTreeMap;

use crate::database::models::{ActiveItem, OrderItem, OrderMode};
use crate::utils::config::EngineConfig;
use crate::utils::constants::{API_INBOUND_TAG, API_OUTBOUND_TAG, DIRECT_OUTBOUND_TAG, SHADOWSOCKS_METHOD};

use super::document::*;
use super::protocol::{outbound_tag, rule_tag, Binding, Protocol};

const ANY_ADDR: &str = "0.0.0.0";
const LOOPBACK_ADDR: &str = "127.0.0.1";

/// username -> password or uuid, per inbound.
type Credentials = BTreeMap<String, String>;

/// Builds the complete engine configuration from the active item set.
#[derive(Clone, Debug)]
pub struct Synthesizer {
  log_level: String,
  api_port: u16,
}

impl Synthesizer {
  pub fn new(config: &EngineConfig) -> Self {
    Self {
      log_level: config.log_level.clone(),
      api_port: config.api_server.port(),
    }
  }

  pub fn synthesize(&self, active: &[ActiveItem]) -> EngineDocument {
    let mut managed: Vec<&ActiveItem> = active.iter().filter(|a| a.item.managed).collect();
    managed.sort_by_key(|a| a.item.id);

    let mut inbounds = vec![self.api_inbound()];
    for ((binding, port), credentials) in group_credentials(&managed) {
      inbounds.push(build_inbound(binding, port, &credentials));
    }

    let mut outbounds = vec![freedom(API_OUTBOUND_TAG), freedom(DIRECT_OUTBOUND_TAG)];
    let mut rules = vec![Rule {
      kind: "field".to_string(),
      rule_tag: String::new(),
      inbound_tag: vec![API_INBOUND_TAG.to_string()],
      user: Vec::new(),
      outbound_tag: API_OUTBOUND_TAG.to_string(),
    }];
    for active in managed {
      outbounds.push(outbound_for(&active.item));
      rules.extend(rules_for(active));
    }

    EngineDocument {
      log: LogSection {
        loglevel: self.log_level.clone(),
      },
      api: ApiSection {
        tag: API_OUTBOUND_TAG.to_string(),
        services: vec!["HandlerService".to_string(), "RoutingService".to_string(), "StatsService".to_string()],
      },
      stats: Stats {},
      policy: Policy {
        levels: BTreeMap::from([(
          "0".to_string(),
          LevelPolicy {
            stats_user_uplink: true,
            stats_user_downlink: true,
            stats_user_online: true,
          },
        )]),
        system: SystemPolicy {
          stats_inbound_uplink: true,
          stats_inbound_downlink: true,
          stats_outbound_uplink: true,
          stats_outbound_downlink: true,
        },
      },
      inbounds,
      outbounds,
      routing: Routing {
        domain_strategy: "AsIs".to_string(),
        rules,
      },
    }
  }

  /// The inbound a full rebuild would emit for `binding` on `port`, or None when it has no accounts.
  pub fn inbound(&self, binding: Binding, port: u16, active: &[ActiveItem]) -> Option<Inbound> {
    let managed: Vec<&ActiveItem> = active.iter().filter(|a| a.item.managed).collect();
    let mut groups = group_credentials(&managed);
    let credentials = groups.remove(&(binding, port))?;
    Some(build_inbound(binding, port, &credentials))
  }

  fn api_inbound(&self) -> Inbound {
    Inbound {
      tag: API_INBOUND_TAG.to_string(),
      listen: LOOPBACK_ADDR.to_string(),
      port: self.api_port,
      protocol: "dokodemo-door".to_string(),
      settings: InboundSettings::Dokodemo(DokodemoSettings {
        address: LOOPBACK_ADDR.to_string(),
      }),
    }
  }
}

/// Inbounds an item's account belongs to. Dedicated uuid protocols without a uuid fall back to the generic port.
pub fn bindings_of(active: &ActiveItem) -> Vec<Binding> {
  let item = &active.item;
  if item.port == 0 {
    return Vec::new();
  }
  if active.mode == OrderMode::Dedicated {
    let has_uuid = item.uuid.as_deref().map(|u| !u.trim().is_empty()).unwrap_or(false);
    if !active.protocol.uses_uuid() || has_uuid {
      return vec![Binding::Dedicated(active.protocol)];
    }
  }
  vec![Binding::Generic]
}

pub fn outbound_for(item: &OrderItem) -> Outbound {
  if let Some(forward) = item.forward.as_ref().filter(|f| !f.address.trim().is_empty() && f.port > 0) {
    let mut users = Vec::new();
    if !forward.username.trim().is_empty() || !forward.password.trim().is_empty() {
      users.push(SocksUser {
        user: forward.username.clone(),
        pass: forward.password.clone(),
      });
    }
    return Outbound {
      tag: outbound_tag(item.id),
      protocol: "socks".to_string(),
      send_through: None,
      settings: OutboundSettings::Socks(SocksSettings {
        servers: vec![SocksServer {
          address: forward.address.clone(),
          port: forward.port,
          users,
        }],
      }),
    };
  }
  Outbound {
    tag: outbound_tag(item.id),
    protocol: "freedom".to_string(),
    send_through: item.ip.map(|ip| ip.to_string()),
    settings: OutboundSettings::Freedom(FreedomSettings {}),
  }
}

pub fn rules_for(active: &ActiveItem) -> Vec<Rule> {
  let item = &active.item;
  bindings_of(active)
    .into_iter()
    .enumerate()
    .map(|(idx, binding)| Rule {
      kind: "field".to_string(),
      rule_tag: rule_tag(item.id, idx),
      inbound_tag: vec![binding.tag(item.port)],
      user: vec![item.username.clone()],
      outbound_tag: outbound_tag(item.id),
    })
    .collect()
}

fn group_credentials(managed: &[&ActiveItem]) -> BTreeMap<(Binding, u16), Credentials> {
  let mut groups: BTreeMap<(Binding, u16), Credentials> = BTreeMap::new();
  for active in managed {
    let item = &active.item;
    for binding in bindings_of(active) {
      let secret = match binding.protocol() {
        Protocol::Vmess | Protocol::Vless => item.uuid.clone().unwrap_or_default().trim().to_string(),
        Protocol::Mixed | Protocol::Shadowsocks => item.password.clone(),
      };
      groups.entry((binding, item.port)).or_default().insert(item.username.clone(), secret);
    }
  }
  groups
}

fn build_inbound(binding: Binding, port: u16, credentials: &Credentials) -> Inbound {
  let protocol = binding.protocol();
  let settings = match protocol {
    Protocol::Mixed => InboundSettings::Mixed(MixedSettings {
      auth: "password".to_string(),
      accounts: credentials
        .iter()
        .map(|(user, pass)| Account {
          user: user.clone(),
          pass: pass.clone(),
        })
        .collect(),
      udp: false,
    }),
    Protocol::Vmess => InboundSettings::Vmess(VmessSettings {
      clients: uuid_clients(credentials, None),
    }),
    Protocol::Vless => InboundSettings::Vless(VlessSettings {
      clients: uuid_clients(credentials, Some("none")),
      decryption: "none".to_string(),
    }),
    Protocol::Shadowsocks => InboundSettings::Shadowsocks(ShadowsocksSettings {
      network: "tcp".to_string(),
      clients: credentials
        .iter()
        .map(|(user, password)| ShadowsocksClient {
          password: password.clone(),
          method: SHADOWSOCKS_METHOD.to_string(),
          level: 0,
          email: user.clone(),
        })
        .collect(),
    }),
  };
  Inbound {
    tag: binding.tag(port),
    listen: ANY_ADDR.to_string(),
    port,
    protocol: protocol.as_str().to_string(),
    settings,
  }
}

fn uuid_clients(credentials: &Credentials, decryption: Option<&str>) -> Vec<UuidClient> {
  credentials
    .iter()
    .map(|(user, id)| UuidClient {
      id: id.clone(),
      level: 0,
      email: user.clone(),
      decryption: decryption.map(str::to_string),
    })
    .collect()
}

fn freedom(tag: &str) -> Outbound {
  Outbound {
    tag: tag.to_string(),
    protocol: "freedom".to_string(),
    send_through: None,
    settings: OutboundSettings::Freedom(FreedomSettings {}),
  }
}
