use std::env;
use std::sync::Arc;

use points_core::csv::{read_requests, write_balances};
use points_core::store::MemoryStore;
use points_core::{Config, Engine};
use tokio_stream::wrappers::ReceiverStream;
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("warn".parse().unwrap()))
        .with_writer(std::io::stderr)
        .init();

    let mut args = env::args().skip(1);
    let path = args
        .next()
        .expect("usage: points-core <requests.csv> [config.yaml]");
    let config_path = args.next().or_else(|| env::var("POINTS_CORE_CONFIG").ok());

    if !path.ends_with(".csv") {
        warn!(path, "input file seems to not be a csv file");
    }

    let config = match config_path {
        Some(config_path) => Config::load(&config_path).expect("failed to load config"),
        None => Config::default(),
    };

    let engine = Engine::new(&config, Arc::new(MemoryStore::new())).expect("invalid config");
    engine
        .seed_coupons(config.coupons.clone())
        .await
        .expect("failed to seed coupons");

    let requests = read_requests(path).expect("failed to open csv file");
    let (request_sender, request_receiver) = tokio::sync::mpsc::channel(16);

    tokio::spawn(async move {
        for result in requests {
            match result {
                Ok(request) => {
                    if request_sender.send(request).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!("{e}");
                }
            }
        }
    });

    engine.run(ReceiverStream::new(request_receiver)).await;

    let balances = engine.balances().await.expect("failed to read balances");
    let mut rows = Vec::with_capacity(balances.len());
    for account in balances {
        let transactions = engine
            .ledger()
            .history(account.user)
            .await
            .expect("failed to read history")
            .len();
        rows.push((account.user, account.balance, transactions));
    }
    engine.shutdown();

    write_balances(std::io::stdout().lock(), rows).expect("failed to write balances");
}
