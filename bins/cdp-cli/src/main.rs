//! # CDP CLI - Corpus Data Pipeline Runner
//!
//! Loads a YAML pipeline configuration and executes it with structured
//! logging and graceful shutdown.
//!
//! ## Usage
//!
//! ```bash
//! # Run a pipeline from a YAML configuration file
//! cdp run --pipeline pipelines/web-corpus.yml
//!
//! # Override input/output paths from the configuration
//! cdp run -p pipelines/web-corpus.yml --input data/raw --output data/clean
//!
//! # Check a configuration without touching any data
//! cdp validate pipelines/web-corpus.yml
//!
//! # List registered components
//! cdp list --category tag
//!
//! # Enable debug logging
//! RUST_LOG=debug cdp run -p pipelines/web-corpus.yml
//! ```

use std::path::PathBuf;

use anyhow::Result;
use cdp_core::config::{PathArg, PipelineSpec};
use cdp_core::pipeline::DataPipeline;
use cdp_core::registry::Registry;
use clap::{Parser, Subcommand};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "cdp")]
#[command(about = "Corpus Data Pipeline Runner")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a processing pipeline from configuration
    Run {
        /// Pipeline YAML configuration file
        #[arg(short, long)]
        pipeline: PathBuf,

        /// Override the input path from the configuration
        #[arg(long)]
        input: Option<String>,

        /// Override the output path from the configuration
        #[arg(long)]
        output: Option<String>,

        /// Override the worker concurrency
        #[arg(long)]
        concurrency: Option<usize>,
    },

    /// List available components, optionally filtered by category
    List {
        #[arg(long)]
        category: Option<String>,
    },

    /// Validate a pipeline configuration without running it
    Validate {
        /// Pipeline YAML configuration file
        pipeline: PathBuf,
    },
}

fn builtin_registry() -> Registry {
    let mut registry = Registry::new();
    cdp_io::register(&mut registry);
    cdp_tx::register(&mut registry);
    registry
}

async fn run(
    pipeline_path: PathBuf,
    input: Option<String>,
    output: Option<String>,
    concurrency: Option<usize>,
) -> Result<()> {
    let mut spec = PipelineSpec::from_yaml_file(&pipeline_path)?;
    if let Some(input) = input {
        spec.input.path = PathArg::One(input);
    }
    if let Some(output) = output {
        if let Some(connector) = spec.output.as_mut() {
            connector.path = PathArg::One(output);
        }
    }
    if concurrency.is_some() {
        spec.runtime.concurrency = concurrency;
    }

    println!("Running pipeline: {}", spec.name);
    if let Some(description) = &spec.description {
        println!("Description: {description}");
    }

    let registry = builtin_registry();
    let aggregation_output = spec.aggregation_kwargs.output_path.clone();
    let pipeline = DataPipeline::new(spec);
    let cancel = CancellationToken::new();

    // Ctrl-C cancels cooperatively; the run drains in-flight partitions
    // and returns its report.
    let cancel_on_signal = cancel.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            println!("\nReceived Ctrl-C, shutting down...");
            cancel_on_signal.cancel();
        }
    });
    let report = pipeline.run(&registry, cancel.clone()).await?;

    info!(
        rows_in = report.rows_in,
        rows_out = report.rows_out,
        rows_dropped_by_stage = ?report.rows_dropped_by_stage,
        rows_written = report.rows_written,
        "pipeline summary"
    );

    if let Some(aggregations) = &report.aggregations {
        match &aggregation_output {
            Some(path) => {
                cdp_io::fs::write_json_pretty(path, aggregations).await?;
                println!("Aggregation results written to {path}");
            }
            None => {
                println!("\n=== Aggregation Results ===");
                println!("{}", serde_json::to_string_pretty(aggregations)?);
            }
        }
    }
    Ok(())
}

fn list(category: Option<String>) {
    let registry = builtin_registry();
    println!("=== Available Components ===");
    let categories = match category {
        Some(c) => vec![c],
        None => registry.categories(),
    };
    for category in categories {
        println!("\n{category}:");
        for (_, kind) in registry.list(Some(category.as_str())) {
            match registry.summary(&category, &kind) {
                Some(summary) if !summary.is_empty() => println!("  - {kind}: {summary}"),
                _ => println!("  - {kind}"),
            }
        }
    }
}

fn validate(pipeline_path: PathBuf) -> Result<()> {
    let spec = PipelineSpec::from_yaml_file(&pipeline_path)?;
    let registry = builtin_registry();
    match DataPipeline::new(spec).validate(&registry) {
        Ok(()) => {
            println!("Configuration is valid");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "configuration validation failed");
            Err(e.into())
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Run { pipeline, input, output, concurrency } => {
            run(pipeline, input, output, concurrency).await
        }
        Command::List { category } => {
            list(category);
            Ok(())
        }
        Command::Validate { pipeline } => validate(pipeline),
    }
}
