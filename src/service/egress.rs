use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use chrono::Utc;
use serde::Deserialize;
use socks5_proto::{
  handshake::password::{Request as PasswordRequest, Response as PasswordResponse},
  handshake::{Method as HandshakeMethod, Request as HandshakeRequest, Response as HandshakeResponse},
  Address, Command, Reply, Request, Response,
};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use url::Url;

use crate::database::models::{ForwardEgress, Id, ProbeRecord, ProbeStatus};
use crate::database::{Change, ChangeSet, Store};
use crate::error::{FleetError, FleetResult};
use crate::utils::config::EgressConfig;
use crate::utils::constants::{ROUTE_USER_ATTEMPTS, ROUTE_USER_SUFFIX_LEN};
use crate::utils::random::{country_prefix, random_string};

/// Item usernames handed out for forward egresses while one change set is being built.
pub struct RouteUserClaims<'a> {
  store: &'a dyn Store,
  claimed: HashSet<String>,
}

impl<'a> RouteUserClaims<'a> {
  pub fn new(store: &'a dyn Store) -> Self {
    Self {
      store,
      claimed: HashSet::new(),
    }
  }

  /// Username for an item routed through `egress`.
  ///
  /// The egress's route user is reused unless another item already holds it. Otherwise a fresh
  /// `<cc>-<random>` name is generated, and when the egress had no route user yet the returned row
  /// carries it and must be saved with the item.
  pub async fn claim(&mut self, egress: &ForwardEgress, exclude_item: Option<Id>) -> FleetResult<(String, Option<ForwardEgress>)> {
    let current = egress.route_user.as_deref().map(str::trim).filter(|r| !r.is_empty());
    if let Some(route_user) = current {
      if !self.claimed.contains(route_user) && !self.store.username_taken(route_user, exclude_item).await? {
        self.claimed.insert(route_user.to_string());
        return Ok((route_user.to_string(), None));
      }
    }

    let generated = self.next_route_user(egress.country_code.as_deref()).await?;
    self.claimed.insert(generated.clone());
    if current.is_some() {
      return Ok((generated, None));
    }
    let mut updated = egress.clone();
    updated.route_user = Some(generated.clone());
    Ok((generated, Some(updated)))
  }

  pub async fn next_route_user(&self, country: Option<&str>) -> FleetResult<String> {
    let prefix = country_prefix(country);
    for _ in 0..ROUTE_USER_ATTEMPTS {
      let candidate = format!("{}-{}", prefix, random_string(ROUTE_USER_SUFFIX_LEN));
      if self.claimed.contains(&candidate) {
        continue;
      }
      if self.store.username_taken(&candidate, None).await? || self.store.route_user_taken(&candidate, None).await? {
        continue;
      }
      return Ok(candidate);
    }
    Err(FleetError::Conflict("failed to generate a unique route user".to_string()))
  }
}

#[derive(Error, Debug)]
pub enum ProbeError {
  #[error("invalid probe url {0}")]
  Url(String),
  #[error("failed to reach egress. Err = {0}")]
  Connect(std::io::Error),
  #[error("socks5 exchange failed. Err = {0}")]
  Socks5(std::io::Error),
  #[error("egress refused authentication")]
  AuthRejected,
  #[error("egress replied {0} to connect")]
  ConnectRejected(String),
  #[error("failed to parse probe response. Err = {0}")]
  Http(String),
  #[error("probe answered with status {0}")]
  Status(u16),
  #[error("probe answered without an exit ip")]
  EmptyExitIp,
  #[error("probe timed out after {0:?}")]
  Timeout(Duration),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProbeReport {
  pub exit_ip: String,
  pub country_code: Option<String>,
}

struct ProbeTarget {
  host: String,
  port: u16,
  path: String,
}

impl ProbeTarget {
  fn parse(raw: &str) -> Result<Self, ProbeError> {
    let url = Url::parse(raw).map_err(|e| ProbeError::Url(format!("{} ({})", raw, e)))?;
    if url.scheme() != "http" {
      return Err(ProbeError::Url(format!("{} (only http is supported)", raw)));
    }
    let host = url.host_str().ok_or_else(|| ProbeError::Url(raw.to_string()))?.to_string();
    let port = url.port_or_known_default().unwrap_or(80);
    let mut path = url.path().to_string();
    if path.is_empty() {
      path = String::from("/");
    }
    if let Some(query) = url.query() {
      path.push('?');
      path.push_str(query);
    }
    Ok(Self { host, port, path })
  }

  fn address(&self) -> Address {
    match self.host.parse() {
      Ok(ip) => Address::SocketAddress(std::net::SocketAddr::new(ip, self.port)),
      Err(_) => Address::DomainAddress(self.host.as_bytes().to_vec(), self.port),
    }
  }
}

const MAX_RESPONSE: usize = 16384;

/// Fetches the probe URL through the egress and reports the exit address it sees.
pub async fn probe_egress(egress: &ForwardEgress, config: &EgressConfig) -> Result<ProbeReport, ProbeError> {
  let target = ProbeTarget::parse(&config.probe_url)?;
  match timeout(config.probe_timeout, exchange(egress, &target)).await {
    Ok(result) => result,
    Err(_) => Err(ProbeError::Timeout(config.probe_timeout)),
  }
}

async fn exchange(egress: &ForwardEgress, target: &ProbeTarget) -> Result<ProbeReport, ProbeError> {
  let mut stream = TcpStream::connect((egress.address.trim(), egress.port)).await.map_err(ProbeError::Connect)?;
  socks5_connect(&mut stream, egress, target).await?;

  let request = format!(
    "GET {} HTTP/1.0\r\nHost: {}\r\nUser-Agent: proxyfleet\r\nAccept: */*\r\nConnection: close\r\n\r\n",
    target.path, target.host
  );
  stream.write_all(request.as_bytes()).await.map_err(ProbeError::Connect)?;

  let mut buffer = BytesMut::with_capacity(MAX_RESPONSE / 4);
  loop {
    let read = stream.read_buf(&mut buffer).await.map_err(ProbeError::Connect)?;
    if read == 0 || buffer.len() >= MAX_RESPONSE {
      break;
    }
  }
  parse_probe_response(&buffer)
}

async fn socks5_connect(stream: &mut TcpStream, egress: &ForwardEgress, target: &ProbeTarget) -> Result<(), ProbeError> {
  let with_password = !egress.username.trim().is_empty();
  let method = match with_password {
    true => HandshakeMethod::PASSWORD,
    false => HandshakeMethod::NONE,
  };
  HandshakeRequest::new(vec![method]).write_to(stream).await.map_err(ProbeError::Socks5)?;
  let chosen = HandshakeResponse::read_from(stream).await.map_err(|e| ProbeError::Socks5(e.into()))?;
  if chosen.method != method {
    return Err(ProbeError::AuthRejected);
  }

  if with_password {
    PasswordRequest::new(egress.username.trim().as_bytes().to_vec(), egress.password.trim().as_bytes().to_vec())
      .write_to(stream)
      .await
      .map_err(ProbeError::Socks5)?;
    let reply = PasswordResponse::read_from(stream).await.map_err(|e| ProbeError::Socks5(e.into()))?;
    if !reply.status {
      return Err(ProbeError::AuthRejected);
    }
  }

  Request::new(Command::Connect, target.address()).write_to(stream).await.map_err(ProbeError::Socks5)?;
  let response = Response::read_from(stream).await.map_err(|e| ProbeError::Socks5(e.into()))?;
  match response.reply {
    Reply::Succeeded => Ok(()),
    other => Err(ProbeError::ConnectRejected(format!("{:?}", other))),
  }
}

#[derive(Deserialize)]
struct JsonProbe {
  #[serde(alias = "query")]
  ip: String,
  #[serde(alias = "countryCode", alias = "country")]
  country_code: Option<String>,
}

/// Accepts a JSON object (`ip`/`query`, `country_code`/`countryCode`) or plain text lines (ip, then country).
fn parse_probe_response(raw: &[u8]) -> Result<ProbeReport, ProbeError> {
  let mut headers = [httparse::EMPTY_HEADER; 32];
  let mut response = httparse::Response::new(&mut headers);
  let offset = match response.parse(raw) {
    Ok(httparse::Status::Complete(offset)) => offset,
    Ok(httparse::Status::Partial) => return Err(ProbeError::Http("incomplete response".to_string())),
    Err(e) => return Err(ProbeError::Http(e.to_string())),
  };
  let code = response.code.unwrap_or(0);
  if !(200..300).contains(&code) {
    return Err(ProbeError::Status(code));
  }

  let body = String::from_utf8_lossy(&raw[offset..]);
  let body = body.trim();
  let (exit_ip, country_code) = match serde_json::from_str::<JsonProbe>(body) {
    Ok(parsed) => (parsed.ip.trim().to_string(), parsed.country_code),
    Err(_) => {
      let mut lines = body.lines().map(str::trim).filter(|l| !l.is_empty());
      let ip = lines.next().unwrap_or("").to_string();
      (ip, lines.next().map(str::to_string))
    }
  };
  if exit_ip.is_empty() {
    return Err(ProbeError::EmptyExitIp);
  }
  Ok(ProbeReport {
    exit_ip,
    country_code: country_code.map(|c| c.trim().to_ascii_lowercase()).filter(|c| !c.is_empty()),
  })
}

/// Forward-egress pool maintenance.
#[derive(Clone)]
pub struct EgressService {
  store: Arc<dyn Store>,
  config: EgressConfig,
}

impl EgressService {
  pub fn new(store: Arc<dyn Store>, config: EgressConfig) -> Self {
    Self { store, config }
  }

  /// Probes one egress and records the outcome. A failed probe is recorded before it is returned.
  pub async fn probe(&self, id: Id) -> FleetResult<ForwardEgress> {
    let (updated, outcome) = self.probe_row(self.egress(id).await?).await?;
    match outcome {
      Ok(()) => Ok(updated),
      Err(e) => Err(e.into()),
    }
  }

  /// Probes every egress (or only enabled ones) and returns the updated rows.
  pub async fn probe_all(&self, enabled_only: bool) -> FleetResult<Vec<ForwardEgress>> {
    let mut rows = self.store.forward_egresses().await?;
    rows.sort_by_key(|e| e.id);
    let mut updated = Vec::with_capacity(rows.len());
    for egress in rows.into_iter().filter(|e| e.enabled || !enabled_only) {
      let (row, outcome) = self.probe_row(egress).await?;
      if let Err(e) = outcome {
        debug!("egress {} probe failed. Err = {}", row.id, e);
      }
      updated.push(row);
    }
    Ok(updated)
  }

  async fn egress(&self, id: Id) -> FleetResult<ForwardEgress> {
    self
      .store
      .forward_egresses()
      .await?
      .into_iter()
      .find(|e| e.id == id)
      .ok_or_else(|| FleetError::NotFound(format!("forward egress {}", id)))
  }

  /// Records only the probe fields, then returns the row as stored. Route users claimed meanwhile are kept.
  async fn probe_row(&self, egress: ForwardEgress) -> FleetResult<(ForwardEgress, Result<(), ProbeError>)> {
    let result = probe_egress(&egress, &self.config).await;
    let mut record = ProbeRecord {
      egress_id: egress.id,
      status: ProbeStatus::Failed,
      exit_ip: None,
      country_code: None,
      error: None,
      probed_at: Utc::now(),
      route_user: None,
    };
    let outcome = match result {
      Ok(report) => {
        info!("egress {} exits via {} ({:?})", egress.id, report.exit_ip, report.country_code);
        if egress.route_user.as_deref().map(str::trim).unwrap_or("").is_empty() {
          let claims = RouteUserClaims::new(self.store.as_ref());
          record.route_user = Some(claims.next_route_user(report.country_code.as_deref()).await?);
        }
        record.status = ProbeStatus::Ok;
        record.exit_ip = Some(report.exit_ip);
        record.country_code = report.country_code;
        Ok(())
      }
      Err(e) => {
        warn!("egress {} ({}:{}) probe failed. Err = {}", egress.id, egress.address, egress.port, e);
        record.error = Some(e.to_string());
        Err(e)
      }
    };

    let mut changes = ChangeSet::new();
    changes.push(Change::RecordProbe(record));
    self.store.commit(changes).await?;
    Ok((self.egress(egress.id).await?, outcome))
  }
}
