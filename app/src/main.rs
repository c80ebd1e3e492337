use std::path::PathBuf;

use clap::{Parser, Subcommand};
use common::{bench::Bench, config::Config, record::CampaignInfo};
use eyre::Result;
use tokio::fs::{create_dir_all, read_dir};
use tracing::{debug, error};
use tracing_subscriber::{
    EnvFilter,
    fmt::{layer, time::ChronoLocal},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

mod bench;
mod plot;

const MODULES: &[&str] = &["common", "rados"];
const RESULTS_DIR: &str = "results";

#[derive(Parser)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
    #[arg(long, default_value_t = false)]
    no_progress: bool,
    #[arg(short, long)]
    log: Vec<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// List run campaigns
    Ls,
    /// Run a campaign
    Bench {
        #[arg(short, long, default_value = "config.yaml")]
        config_file: String,
        /// Do not summarise results after the campaign
        #[arg(long, default_value_t = false)]
        skip_plot: bool,
        /// Continue an interrupted campaign folder, skipping recorded trials
        #[arg(long)]
        resume: Option<String>,
    },
    /// Summarise a campaign folder or result CSV without running trials
    Plot {
        /// Campaign folder or results.csv
        #[arg(short, long)]
        folder: String,
    },
    /// Print the trial matrix with every reset and benchmark command
    Print {
        #[arg(short, long, default_value = "config.yaml")]
        config_file: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let log_level = std::env::var("RUST_LOG").unwrap_or("warn".to_owned());
    let args = Cli::parse();
    let file_appender = tracing_appender::rolling::never(".", "log.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    let mut env_filter = EnvFilter::new(format!("rados_campaign={log_level}"));

    if !args.log.is_empty() {
        for log in &args.log {
            env_filter = env_filter.add_directive(log.parse()?);
        }
    }

    for module in MODULES {
        if !args.log.iter().any(|x| x.starts_with(module)) {
            env_filter = env_filter.add_directive(format!("{module}={log_level}").parse()?);
        }
    }

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            layer()
                .with_timer(ChronoLocal::new("%v %k:%M:%S %z".to_owned()))
                .compact(),
        )
        .with(layer().with_writer(non_blocking))
        .init();

    init_benches();

    create_dir_all(RESULTS_DIR).await?;
    match args.command {
        Commands::Ls => list_campaigns().await?,
        Commands::Bench {
            config_file,
            skip_plot,
            resume,
        } => {
            if let Err(err) =
                bench::run_benchmark(config_file, resume, args.no_progress, skip_plot).await
            {
                error!("{err:#?}");
                return Err(err);
            }
        }
        Commands::Plot { folder } => plot::plot(&folder)?,
        Commands::Print { config_file } => print_commands(&config_file).await?,
    };

    Ok(())
}

/// Links the workload crates so their typetag registrations are kept
fn init_benches() {
    let benches: [Box<dyn Bench>; 1] = [Box::new(rados::Rados::default())];
    debug!(
        "Available workloads: {:?}",
        benches.iter().map(|b| b.name()).collect::<Vec<_>>()
    );
}

async fn list_campaigns() -> Result<()> {
    for (name, folder) in get_campaigns().await? {
        println!("{} -> {}", name, folder.display());
    }
    Ok(())
}

async fn get_campaigns() -> Result<Vec<(String, PathBuf)>> {
    let mut items = read_dir(RESULTS_DIR).await?;
    let mut results = Vec::new();
    while let Ok(Some(entry)) = items.next_entry().await {
        if entry.file_type().await?.is_dir() {
            if let Some(info) = CampaignInfo::read(&entry.path())? {
                results.push((info.name, entry.path()));
            }
        }
    }
    results.sort_by(|a, b| a.1.cmp(&b.1));
    Ok(results)
}

async fn print_commands(config_file: &str) -> Result<()> {
    let config = Config::load(config_file).await?;
    let env = config.settings.env();
    let matrix = config.matrix();
    println!("{} trials", matrix.len());
    for trial in matrix.iter() {
        println!("[{trial}]");
        println!("  reset: {}", config.settings.reset.cmd(trial.configuration, &env));
        println!("  bench: {}", config.bench.cmd(trial.block_size, &env));
    }
    Ok(())
}
