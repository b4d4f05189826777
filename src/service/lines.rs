use std::net::IpAddr;

use thiserror::Error;

use crate::database::models::ForwardTarget;
use crate::engine::protocol::Protocol;
use crate::utils::constants::{PASSWORD_LEN, USERNAME_LEN};
use crate::utils::random::{random_string, random_uuid};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LineError {
  #[error("no lines given")]
  Empty,
  #[error("line {0}: format must be {1}")]
  Format(usize, &'static str),
  #[error("line {0}: invalid ip")]
  Ip(usize),
  #[error("line {0}: invalid port")]
  Port(usize),
  #[error("line {0}: {1} required")]
  Missing(usize, &'static str),
  #[error("line {0}: invalid uuid {1}")]
  Uuid(usize, String),
}

/// Non-blank lines with their 1-based line numbers.
fn numbered(input: &str) -> impl Iterator<Item = (usize, &str)> {
  input.lines().enumerate().map(|(i, l)| (i + 1, l.trim())).filter(|(_, l)| !l.is_empty())
}

fn parse_port(line: usize, raw: &str) -> Result<u16, LineError> {
  match raw.trim().parse::<u16>() {
    Ok(port) if port > 0 => Ok(port),
    _ => Err(LineError::Port(line)),
  }
}

fn required(line: usize, raw: &str, what: &'static str) -> Result<String, LineError> {
  let value = raw.trim();
  if value.is_empty() {
    return Err(LineError::Missing(line, what));
  }
  Ok(value.to_string())
}

fn parse_uuid(line: usize, raw: &str) -> Result<String, LineError> {
  let raw = raw.trim();
  match uuid::Uuid::parse_str(raw) {
    Ok(parsed) => Ok(parsed.hyphenated().to_string()),
    Err(_) => Err(LineError::Uuid(line, raw.to_string())),
  }
}

/// `addr:port:user:pass` per line, one forward target each. A leading `~` on the address is dropped.
pub fn parse_egress_lines(input: &str) -> Result<Vec<ForwardTarget>, LineError> {
  let mut targets = Vec::new();
  for (line, raw) in numbered(input) {
    let parts: Vec<&str> = raw.splitn(4, ':').collect();
    if parts.len() != 4 {
      return Err(LineError::Format(line, "addr:port:user:pass"));
    }
    targets.push(ForwardTarget {
      address: required(line, parts[0].trim().trim_start_matches('~'), "address")?,
      port: parse_port(line, parts[1])?,
      username: required(line, parts[2], "username")?,
      password: required(line, parts[3], "password")?,
    });
  }
  if targets.is_empty() {
    return Err(LineError::Empty);
  }
  Ok(targets)
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImportLine {
  pub ip: IpAddr,
  pub port: u16,
  pub username: String,
  pub password: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImportRow {
  pub line: usize,
  pub raw: String,
  pub parsed: Result<ImportLine, LineError>,
}

/// Every non-blank `ip:port:user:pass` line is reported, valid or not.
pub fn parse_import_lines(input: &str) -> Vec<ImportRow> {
  numbered(input)
    .map(|(line, raw)| ImportRow {
      line,
      raw: raw.to_string(),
      parsed: parse_import_line(line, raw),
    })
    .collect()
}

fn parse_import_line(line: usize, raw: &str) -> Result<ImportLine, LineError> {
  let parts: Vec<&str> = raw.split(':').collect();
  if parts.len() != 4 {
    return Err(LineError::Format(line, "ip:port:user:pass"));
  }
  let port = parse_port(line, parts[1])?;
  let ip = parts[0].trim().parse::<IpAddr>().map_err(|_| LineError::Ip(line))?;
  Ok(ImportLine {
    ip,
    port,
    username: required(line, parts[2], "username")?,
    password: required(line, parts[3], "password")?,
  })
}

/// Credential fields to write onto an item. `None` leaves the current value.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Credential {
  pub username: Option<String>,
  pub password: Option<String>,
  pub uuid: Option<String>,
}

/// One credential per line in the shape `protocol` authenticates with.
pub fn parse_credential_lines(protocol: Protocol, input: &str) -> Result<Vec<Credential>, LineError> {
  let mut credentials = Vec::new();
  for (line, raw) in numbered(input) {
    let credential = match protocol {
      Protocol::Mixed => {
        let parts: Vec<&str> = raw.split(':').collect();
        if parts.len() != 2 && parts.len() != 3 {
          return Err(LineError::Format(line, "user:pass[:uuid]"));
        }
        let uuid = match parts.get(2).map(|u| u.trim()).filter(|u| !u.is_empty()) {
          Some(u) => parse_uuid(line, u)?,
          None => random_uuid(),
        };
        Credential {
          username: Some(required(line, parts[0], "username")?),
          password: Some(required(line, parts[1], "password")?),
          uuid: Some(uuid),
        }
      }
      Protocol::Vmess | Protocol::Vless => Credential {
        uuid: Some(parse_uuid(line, raw)?),
        ..Default::default()
      },
      Protocol::Shadowsocks => Credential {
        password: Some(raw.to_string()),
        ..Default::default()
      },
    };
    credentials.push(credential);
  }
  if credentials.is_empty() {
    return Err(LineError::Empty);
  }
  Ok(credentials)
}

/// Fresh credential of the shape `protocol` authenticates with.
pub fn generate(protocol: Protocol) -> Credential {
  match protocol {
    Protocol::Mixed => Credential {
      username: Some(random_string(USERNAME_LEN)),
      password: Some(random_string(PASSWORD_LEN)),
      uuid: Some(random_uuid()),
    },
    Protocol::Vmess | Protocol::Vless => Credential {
      uuid: Some(random_uuid()),
      ..Default::default()
    },
    Protocol::Shadowsocks => Credential {
      password: Some(random_string(PASSWORD_LEN)),
      ..Default::default()
    },
  }
}
