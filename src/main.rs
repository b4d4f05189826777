use std::sync::Arc;

use anyhow::Context;
use proxyfleet::{
  cache::settings::SettingsCache,
  database::{initialize_client, mongo::MongoStore, Store},
  engine::{control::XrayCli, reconciler::Reconciler, supervisor::Supervisor},
  service::{egress::EgressService, hosts::seed_pool, orders::OrderService, scheduler::Sweeper},
  utils::config::{load_config, parse_args},
};

#[macro_use]
extern crate log;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  let args = parse_args().context("missing required option c (config)")?;
  let config = load_config(&args.config).context("failed to parse config file")?;
  log4rs::init_file(&config.log4rs.location, Default::default()).context("failed to initialize log4rs")?;

  let client = initialize_client(config.mongodb.uri.clone()).await.context("failed to initialize MongoDB client")?;
  let store: Arc<dyn Store> = Arc::new(
    MongoStore::new(&client, &config.mongodb.database)
      .await
      .context("failed to open datastore")?,
  );

  let seeded = seed_pool(store.as_ref(), &config.pool).await.context("failed to seed local pool")?;
  debug!("{} local pool addresses added", seeded);

  let process = Arc::new(Supervisor::new(config.engine.clone()));
  let control = Arc::new(XrayCli::new(&config.engine));
  let reconciler = Arc::new(Reconciler::new(&config.engine, store.clone(), control, process));

  if args.resync_only {
    reconciler.write_config().await.context("failed to write engine config")?;
    return Ok(());
  }
  reconciler.full_resync().await.context("initial engine resync failed")?;

  let egress = EgressService::new(store.clone(), config.egress.clone());
  tokio::spawn(async move {
    match egress.probe_all(true).await {
      Ok(rows) => info!("probed {} forward egresses", rows.len()),
      Err(e) => warn!("failed to probe forward egresses. Err = {}", e),
    }
  });

  let orders = OrderService::new(store.clone(), reconciler.clone(), SettingsCache::new(&config.cache.settings), config.orders.clone());
  let (stop_sweep, sweep) = Sweeper::new(orders, &config.scheduler).spawn();

  tokio::signal::ctrl_c().await.context("failed to listen for shutdown signal")?;
  info!("shutting down");
  // The sweep may already be gone if its task panicked.
  let _ = stop_sweep.send(true);
  if let Err(e) = sweep.await {
    warn!("sweep task ended abnormally. Err = {}", e);
  }
  reconciler.stop().await;
  Ok(())
}
