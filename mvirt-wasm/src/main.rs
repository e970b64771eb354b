use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::debug;
use tracing_subscriber::EnvFilter;

use mvirt_wasm::config::DriverConfig;
use mvirt_wasm::executor;
use mvirt_wasm::fingerprint::build_fingerprint;
use mvirt_wasm::plugin::{Capabilities, PluginInfo};

#[derive(Parser)]
#[command(name = "mvirt-wasm")]
#[command(about = "mvirt task driver for WebAssembly workloads", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a workload and record its exit status (used by the driver)
    Executor {
        /// File the exit status is written to
        #[arg(long)]
        status_file: PathBuf,

        /// Workload command line
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },

    /// Print one driver fingerprint as JSON
    Fingerprint {
        /// Plugin configuration file (JSON)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Print plugin info and capabilities as JSON
    Info,
}

fn init_tracing(default_directive: &str) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(default_directive.parse()?))
        .with_writer(std::io::stderr)
        .init();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Executor {
            status_file,
            command,
        } => {
            // The executor's stderr is the task's stderr log.
            init_tracing("mvirt_wasm=warn")?;
            let code = executor::run(&status_file, &command)
                .await
                .with_context(|| format!("executor failed for {}", command.join(" ")))?;
            std::process::exit(code);
        }
        Commands::Fingerprint { config } => {
            init_tracing("mvirt_wasm=info")?;
            let config = match config {
                Some(path) => DriverConfig::load(&path)
                    .with_context(|| format!("failed to load config {}", path.display()))?,
                None => DriverConfig::default(),
            };
            debug!(runtime = %config.runtime_path.display(), "Fingerprinting");
            let fingerprint = build_fingerprint(&config.runtime_path).await;
            println!("{}", serde_json::to_string_pretty(&fingerprint)?);
        }
        Commands::Info => {
            init_tracing("mvirt_wasm=info")?;
            let info = serde_json::json!({
                "plugin": PluginInfo::wasmtime(),
                "capabilities": Capabilities::wasmtime(),
            });
            println!("{}", serde_json::to_string_pretty(&info)?);
        }
    }

    Ok(())
}
