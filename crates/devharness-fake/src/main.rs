//! Stand-in for the dev server, for exercising the harness end to end.
//!
//! Accepts the dev server's command line, binds one listener per
//! component, and prints the same `Starting ...` banners on stderr.

mod server;

use std::net::IpAddr;
use std::path::PathBuf;

use clap::{ArgAction, Parser};

use server::ServerConfig;

#[derive(Debug, Parser)]
#[command(name = "devharness-fake", about = "Fake dev server for harness tests")]
struct Cli {
    /// Address every component listens on
    #[arg(long, default_value = "127.0.0.1")]
    host: IpAddr,

    /// Port for the first module (0 = OS-assigned)
    #[arg(long, default_value_t = 0)]
    port: u16,

    /// Port for the API server (0 = OS-assigned)
    #[arg(long = "api_port", default_value_t = 0)]
    api_port: u16,

    /// Port for the admin server (0 = OS-assigned)
    #[arg(long = "admin_port", default_value_t = 0)]
    admin_port: u16,

    /// Directory for datastore files
    #[arg(long = "storage_path")]
    storage_path: Option<PathBuf>,

    /// Empty the storage directory on start
    #[arg(long = "clear_datastore", action = ArgAction::Set, default_value_t = false)]
    clear_datastore: bool,

    /// Accepted for compatibility; always consistent
    #[arg(long = "datastore_consistency_policy", default_value = "consistent")]
    datastore_consistency_policy: String,

    #[arg(long = "skip_sdk_update_check", action = ArgAction::Set, default_value_t = false)]
    skip_sdk_update_check: bool,

    /// Application log level (accepted, not used)
    #[arg(long = "log_level", default_value = "info")]
    log_level: String,

    /// Server log level (accepted, not used)
    #[arg(long = "dev_appserver_log_level", default_value = "info")]
    dev_appserver_log_level: String,

    /// Module manifests, one component each
    #[arg(required = true)]
    manifests: Vec<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    tracing::debug!(
        consistency = %cli.datastore_consistency_policy,
        log_level = %cli.log_level,
        server_log_level = %cli.dev_appserver_log_level,
        "starting fake dev server"
    );

    server::run(ServerConfig {
        host: cli.host,
        port: cli.port,
        api_port: cli.api_port,
        admin_port: cli.admin_port,
        storage_path: cli.storage_path,
        clear_datastore: cli.clear_datastore,
        skip_sdk_update_check: cli.skip_sdk_update_check,
        manifests: cli.manifests,
    })
    .await
}
