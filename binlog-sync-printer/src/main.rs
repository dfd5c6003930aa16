pub mod printer;
pub mod replay;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use binlog_sync::canal::{Canal, CanalBuilder};
use binlog_sync::config::StartPosition;
use binlog_sync::registry::ALL_TABLES;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::printer::PrinterHandler;
use crate::replay::ReplaySource;

#[derive(Parser)]
struct Args {
    /// JSON lines file with decoded binlog events
    #[clap(short, long, action = clap::ArgAction::Set)]
    events: PathBuf,

    /// File the log position is saved to
    #[clap(short, long, default_value = "master.info.json", action = clap::ArgAction::Set)]
    position_file: PathBuf,

    /// Log file name reported as the current upstream position
    #[clap(long, default_value = "mysql-bin.000001", action = clap::ArgAction::Set)]
    start_name: String,

    /// Offset reported as the current upstream position
    #[clap(long, default_value_t = 4, action = clap::ArgAction::Set)]
    start_offset: u32,

    /// Continue from the position file instead of the upstream position
    #[clap(long)]
    resume: bool,

    /// Only print changes of this table
    #[clap(short, long, action = clap::ArgAction::Set)]
    table: Option<String>,

    /// Database name, informational only
    #[clap(long, action = clap::ArgAction::Set)]
    database: Option<String>,

    /// Regular expression of `schema.table` names to skip, may be repeated
    #[clap(long, action = clap::ArgAction::Append)]
    exclude: Vec<String>,

    /// Minimum time between two position saves, in milliseconds
    #[clap(long, default_value_t = 1000, action = clap::ArgAction::Set)]
    save_interval_ms: u64,
}

async fn build_canal(args: Args) -> anyhow::Result<Canal> {
    let start_position = if args.resume {
        StartPosition::Saved
    } else {
        StartPosition::Current
    };

    let mut builder = CanalBuilder::new()
        .source(Arc::new(ReplaySource::new(
            args.events,
            args.start_name,
            args.start_offset,
        )))
        .position_file(args.position_file)
        .save_interval(Duration::from_millis(args.save_interval_ms))
        .start_position(start_position)
        .handler(
            args.table.as_deref().unwrap_or(ALL_TABLES),
            Arc::new(PrinterHandler),
        );
    if let Some(database) = args.database {
        builder = builder.database(database);
    }
    for pattern in args.exclude {
        builder = builder.exclude_table(pattern);
    }

    Ok(builder.build().await?)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let canal = build_canal(Args::parse()).await?;
    let handle = canal.start();
    tokio::pin!(handle);

    tokio::select! {
        result = &mut handle => result?,
        signal = tokio::signal::ctrl_c() => {
            signal?;
            println!("Shutting down...");
            canal.stop();
            (&mut handle).await?;
        }
    }

    Ok(())
}
