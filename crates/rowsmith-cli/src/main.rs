use anyhow::Result;
use clap::{Parser, Subcommand};
use rowsmith_build::{
    deploy_from_env, render_summary, run_build_from_env, status_from_env, BuildRequest,
    CancelFlag,
};
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "rowsmith")]
#[command(about = "Build a SQLite database from declared resources")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Build every enabled resource, or only the ones named.
    Build {
        resources: Vec<String>,
        /// Drop and recreate tables whose schema changed.
        #[arg(long)]
        force_schema_reset: bool,
        /// Replace the local database with the published copy first.
        #[arg(long)]
        sync_before_build: bool,
    },
    /// Upload the database to the configured remote.
    Deploy,
    /// Show schema versions and last build per table.
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    match cli.command.unwrap_or(Commands::Build {
        resources: Vec::new(),
        force_schema_reset: false,
        sync_before_build: false,
    }) {
        Commands::Build {
            resources,
            force_schema_reset,
            sync_before_build,
        } => {
            let cancel = CancelFlag::default();
            let on_interrupt = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("interrupt received; stopping after the current resource");
                    on_interrupt.cancel();
                }
            });

            let report = run_build_from_env(BuildRequest {
                force_schema_reset,
                sync_before_build,
                resources: (!resources.is_empty()).then_some(resources),
                cancel,
            })
            .await?;
            print!("{}", render_summary(&report));
            println!(
                "build complete: build_id={} resources={} failed={} success={}",
                report.build_id,
                report.outcomes.len(),
                report.failures().count(),
                report.success
            );
            if !report.success {
                std::process::exit(1);
            }
        }
        Commands::Deploy => {
            let path = deploy_from_env().await?;
            println!("deploy complete: remote_path={path}");
        }
        Commands::Status => {
            let status = status_from_env().await?;
            println!("database: {}", status.database.display());
            if status.is_empty() {
                println!("no tables built yet");
            }
            for schema in &status.schemas {
                let freshness = status
                    .freshness
                    .iter()
                    .find(|f| f.table_name == schema.table_name);
                match freshness {
                    Some(f) => println!(
                        "{} v{} {} rows, last built {} by {} ({} ms)",
                        schema.table_name,
                        schema.version,
                        f.record_count,
                        f.last_updated,
                        f.build_id,
                        f.duration_ms
                    ),
                    None => println!("{} v{} never built", schema.table_name, schema.version),
                }
            }
        }
    }

    Ok(())
}
