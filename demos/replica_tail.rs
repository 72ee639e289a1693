//! Tails a Redis primary's replication stream and prints every event to
//! stdout. A demonstration harness, not part of the library's contract.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use redis_replica_stream::{Configuration, Event, EventListener, Replicator};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(about = "Tail a Redis primary's replication stream")]
struct Args {
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    #[arg(long, default_value_t = 6379)]
    port: u16,

    #[arg(long)]
    password: Option<String>,

    #[arg(long, default_value_t = 1000)]
    heartbeat_ms: u64,

    #[arg(long, default_value_t = false)]
    discard_rdb: bool,

    #[arg(long, default_value_t = false)]
    verbose: bool,
}

struct PrintListener;

impl EventListener for PrintListener {
    fn on_event(&self, event: &Event) {
        println!("{event:?}");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut builder = Configuration::builder(args.host, args.port)
        .heartbeat_period(Duration::from_millis(args.heartbeat_ms))
        .discard_rdb(args.discard_rdb)
        .verbose(args.verbose);

    if let Some(password) = args.password {
        builder = builder.auth(None::<String>, password);
    }

    let config = builder.build()?;
    let replicator = Replicator::new(config);
    replicator.add_event_listener(Arc::new(PrintListener));
    replicator.open();

    tokio::signal::ctrl_c().await?;
    replicator.close().await;
    Ok(())
}
