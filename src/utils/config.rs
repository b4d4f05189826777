use config::{Config, ConfigError};
use serde::Deserialize;
use std::env;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

pub struct Args {
  pub config: String,
  pub resync_only: bool,
}

pub fn parse_args() -> Option<Args> {
  let args: Vec<String> = env::args().collect();

  let mut opts = getopts::Options::new();
  opts.optopt("c", "config", "config file source (basename only, ex: /etc/proxyfleet/config)", "CONFIG");
  opts.optflag("", "resync", "rewrite the engine configuration from the datastore and exit");

  let matches = match opts.parse(&args[1..]) {
    Ok(m) => m,
    Err(f) => {
      panic!("{}", f.to_string())
    }
  };
  Some(Args {
    config: matches.opt_str("c")?,
    resync_only: matches.opt_present("resync"),
  })
}

pub fn load_config(path: &str) -> Result<GlobalConfig, ConfigError> {
  let config = Config::builder().add_source(config::File::with_name(path)).build()?;
  config.try_deserialize::<GlobalConfig>()
}

#[derive(Clone, Deserialize)]
pub struct GlobalConfig {
  pub engine: EngineConfig,
  pub orders: OrdersConfig,
  pub pool: PoolConfig,
  pub egress: EgressConfig,
  pub scheduler: SchedulerConfig,
  pub cache: CacheConfigContainer,
  pub mongodb: MongoDBConfig,
  pub log4rs: Log4rsConfig,
}

#[derive(Clone, Deserialize)]
pub struct CacheConfigContainer {
  pub settings: SettingsCacheConfig,
}

#[derive(Clone, Deserialize)]
pub struct MongoDBConfig {
  pub uri: String,
  pub database: String,
}

/// Managed engine process and its control API.
#[derive(Clone, Debug, Deserialize)]
pub struct EngineConfig {
  pub managed: bool,
  pub binary: PathBuf,
  pub work_dir: PathBuf,
  pub config_path: PathBuf,
  pub log_file: PathBuf,
  pub api_server: SocketAddr,
  pub log_level: String,
  #[serde(with = "humantime_serde")]
  pub rpc_timeout: Duration,
  #[serde(with = "humantime_serde")]
  pub stop_timeout: Duration,
}

#[derive(Clone, Debug, Deserialize)]
pub struct OrdersConfig {
  pub default_port: u16,
  pub default_duration_days: u32,
  pub check_port_free: bool,
}

#[derive(Clone, Deserialize)]
pub struct PoolConfig {
  pub public: bool,
  pub subnets: Option<Vec<ipnet::Ipv4Net>>,
  pub addrs: Option<Vec<IpAddr>>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct EgressConfig {
  pub probe_url: String,
  #[serde(with = "humantime_serde")]
  pub probe_timeout: Duration,
}

#[derive(Clone, Deserialize)]
pub struct SchedulerConfig {
  #[serde(with = "humantime_serde")]
  pub interval: Duration,
}

#[derive(Clone, Deserialize)]
pub struct SettingsCacheConfig {
  pub max_size: u64,
  #[serde(with = "humantime_serde")]
  pub time_to_live: Duration,
}

#[derive(Clone, Deserialize)]
pub struct Log4rsConfig {
  pub location: String,
}

#[cfg(test)]
pub mod testing {
  use std::path::PathBuf;
  use std::time::Duration;

  use super::{EngineConfig, OrdersConfig};
  use crate::utils::random::random_string;

  pub fn engine_config() -> EngineConfig {
    let work_dir = std::env::temp_dir().join(format!("proxyfleet-test-{}", random_string(10)));
    EngineConfig {
      managed: true,
      binary: PathBuf::from("/nonexistent/engine"),
      config_path: work_dir.join("config.json"),
      log_file: work_dir.join("engine.log"),
      work_dir,
      api_server: "127.0.0.1:10085".parse().unwrap(),
      log_level: "warning".to_string(),
      rpc_timeout: Duration::from_secs(4),
      stop_timeout: Duration::from_secs(2),
    }
  }

  pub fn orders_config() -> OrdersConfig {
    OrdersConfig {
      default_port: 23457,
      default_duration_days: 30,
      check_port_free: false,
    }
  }
}
