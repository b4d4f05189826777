use std::net::{IpAddr, Ipv4Addr};

pub const ANY_HOST: IpAddr = IpAddr::V4(Ipv4Addr::UNSPECIFIED);

pub const API_INBOUND_TAG: &str = "api-in";
pub const API_OUTBOUND_TAG: &str = "api";
pub const DIRECT_OUTBOUND_TAG: &str = "direct";

pub const SHADOWSOCKS_METHOD: &str = "chacha20-ietf-poly1305";

pub const DEFAULT_PORT_SETTING: &str = "default_inbound_port";

pub const USERNAME_LEN: usize = 8;
pub const PASSWORD_LEN: usize = 12;
pub const ROUTE_USER_SUFFIX_LEN: usize = 10;
pub const ROUTE_USER_ATTEMPTS: usize = 16;
pub const RENEW_DEFAULT_DAYS: i64 = 30;
