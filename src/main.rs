// Copyright 2025 coScene
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use anyhow::{bail, Context as _, Result};
use build_metrics::config::load_config_with_env;
use build_metrics::storage::JsonStorageBackend;
use build_metrics::{builder_context, Captures, MetricValue, StatsService};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

/// Build Metrics - Fan build statistics out to storage backends
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/default.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Post a single value to every configured backend
    Post {
        /// Metric name
        #[arg(short, long)]
        name: String,

        /// Metric value (bool, integer, float or text)
        #[arg(short, long)]
        value: String,

        /// Builder the value belongs to
        #[arg(short, long)]
        builder: String,

        /// Explicit series name (default: <builder>-<name>)
        #[arg(short, long)]
        series: Option<String>,

        /// Extra context tags as key=value
        #[arg(short, long = "tag")]
        tags: Vec<String>,
    },

    /// Print the records of a series stored by a json backend
    Show {
        /// Series name
        #[arg(short, long)]
        series: String,

        /// Name of the json backend (default: the first one)
        #[arg(short, long)]
        backend: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let args = Args::parse();

    // Load configuration from file
    let config = load_config_with_env(&args.config)?;

    // Initialize tracing with configured level
    let log_level = match config.logging.level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("Loaded configuration from: {:?}", args.config);

    let service = StatsService::new(&config);
    service
        .reconfigure(&config)
        .await
        .context("Failed to configure stats backends")?;

    match args.command {
        Command::Post {
            name,
            value,
            builder,
            series,
            tags,
        } => {
            let mut context = builder_context(&builder);
            for tag in tags {
                let Some((key, value)) = tag.split_once('=') else {
                    bail!("Invalid tag '{}', expected key=value", tag);
                };
                context.insert(key.to_string(), value.to_string());
            }

            let value = MetricValue::parse(&value);
            let report = match series {
                Some(series) => service.post_to_series(&name, value, &series, context).await?,
                None => service.post(&name, value, context).await?,
            };

            for backend in &report.delivered {
                println!("delivered: {}", backend);
            }
            for (backend, error) in &report.failed {
                println!("failed: {}: {}", backend, error);
            }
        }

        Command::Show { series, backend } => {
            let Some(entry) = config.backends.iter().find(|entry| {
                entry.backend == "json"
                    && backend
                        .as_deref()
                        .map_or(true, |wanted| entry.display_name() == wanted)
            }) else {
                bail!("No matching json backend configured");
            };
            let Some(json_config) = entry.settings.as_json() else {
                bail!("json backend '{}' has no json config", entry.display_name());
            };

            let store = JsonStorageBackend::new(
                entry.display_name(),
                json_config.clone(),
                Captures::default(),
                service.offloader().await,
            );
            let records = store.read_series(&series).await?;
            println!("{}", serde_json::to_string_pretty(&records)?);
        }
    }

    // Wait for in-flight writes before exiting
    service.stop().await;
    info!("Build Metrics shut down successfully");

    Ok(())
}
