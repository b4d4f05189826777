pub mod config;
pub mod constants;
pub mod random;
pub mod socket;
