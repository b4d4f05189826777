use rand::{distributions::Alphanumeric, Rng};

pub fn random_string(len: usize) -> String {
  rand::thread_rng().sample_iter(&Alphanumeric).take(len).map(char::from).collect()
}

pub fn random_uuid() -> String {
  uuid::Uuid::new_v4().to_string()
}

/// Two-letter lowercase prefix for generated route users, `xx` when unknown.
pub fn country_prefix(country: Option<&str>) -> String {
  match country.map(|c| c.trim().to_ascii_lowercase()) {
    Some(c) if c.len() == 2 => c,
    _ => "xx".to_string(),
  }
}
