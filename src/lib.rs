#[macro_use]
extern crate log;

pub mod allocator;
pub mod cache;
pub mod database;
pub mod engine;
pub mod error;
pub mod service;
pub mod utils;
