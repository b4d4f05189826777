use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::database::models::Id;

/// Inbound protocols the engine serves customers on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
  Mixed,
  Vmess,
  Vless,
  Shadowsocks,
}

impl Protocol {
  pub const ALL: [Protocol; 4] = [Protocol::Mixed, Protocol::Vmess, Protocol::Vless, Protocol::Shadowsocks];

  pub fn as_str(&self) -> &'static str {
    match self {
      Protocol::Mixed => "mixed",
      Protocol::Vmess => "vmess",
      Protocol::Vless => "vless",
      Protocol::Shadowsocks => "shadowsocks",
    }
  }

  /// Whether accounts on this protocol authenticate with a UUID client id.
  pub fn uses_uuid(&self) -> bool {
    matches!(self, Protocol::Vmess | Protocol::Vless)
  }
}

impl fmt::Display for Protocol {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

#[derive(Debug, PartialEq, Eq)]
pub struct UnknownProtocol(pub String);

impl fmt::Display for UnknownProtocol {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "unknown protocol {}", self.0)
  }
}

impl FromStr for Protocol {
  type Err = UnknownProtocol;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.trim().to_ascii_lowercase().as_str() {
      "mixed" | "socks5" | "socks" | "http" => Ok(Protocol::Mixed),
      "vmess" => Ok(Protocol::Vmess),
      "vless" => Ok(Protocol::Vless),
      "shadowsocks" | "ss" => Ok(Protocol::Shadowsocks),
      other => Err(UnknownProtocol(other.to_string())),
    }
  }
}

/// Which inbound an item's account lives in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Binding {
  /// Shared mixed inbound used by auto, manual, forward and imported orders.
  Generic,
  /// Per-protocol inbound of a dedicated bundle.
  Dedicated(Protocol),
}

impl Binding {
  pub fn protocol(&self) -> Protocol {
    match self {
      Binding::Generic => Protocol::Mixed,
      Binding::Dedicated(protocol) => *protocol,
    }
  }

  pub fn tag(&self, port: u16) -> String {
    match self {
      Binding::Generic => inbound_tag(port),
      Binding::Dedicated(protocol) => format!("fleet-in-{}-{}", protocol, port),
    }
  }
}

pub fn inbound_tag(port: u16) -> String {
  format!("fleet-in-{}", port)
}

pub fn outbound_tag(item_id: Id) -> String {
  format!("fleet-out-{}", item_id)
}

/// Rule tag for the `index`-th inbound an item is bound to. Later tags are numbered from 2.
pub fn rule_tag(item_id: Id, index: usize) -> String {
  match index {
    0 => format!("fleet-rule-{}", item_id),
    n => format!("fleet-rule-{}-{}", item_id, n + 1),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parses_aliases() {
    assert_eq!("socks5".parse::<Protocol>().unwrap(), Protocol::Mixed);
    assert_eq!("VMess".parse::<Protocol>().unwrap(), Protocol::Vmess);
    assert_eq!("ss".parse::<Protocol>().unwrap(), Protocol::Shadowsocks);
    assert!("trojan".parse::<Protocol>().is_err());
  }

  #[test]
  fn bindings_order_generic_first() {
    let mut bindings = vec![Binding::Dedicated(Protocol::Shadowsocks), Binding::Dedicated(Protocol::Mixed), Binding::Generic];
    bindings.sort();
    assert_eq!(bindings, vec![Binding::Generic, Binding::Dedicated(Protocol::Mixed), Binding::Dedicated(Protocol::Shadowsocks)]);
  }

  #[test]
  fn tags_are_derived_from_ids() {
    assert_eq!(inbound_tag(23457), "fleet-in-23457");
    assert_eq!(Binding::Generic.tag(1080), "fleet-in-1080");
    assert_eq!(Binding::Dedicated(Protocol::Mixed).tag(1080), "fleet-in-mixed-1080");
    assert_eq!(Binding::Dedicated(Protocol::Vless).tag(443), "fleet-in-vless-443");
    assert_eq!(outbound_tag(12), "fleet-out-12");
    assert_eq!(rule_tag(12, 0), "fleet-rule-12");
    assert_eq!(rule_tag(12, 1), "fleet-rule-12-2");
  }
}
