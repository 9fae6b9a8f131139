//! Zentinel Response Template - CLI Entry Point
//!
//! Renders one stub against a sample request and prints the resulting
//! response description.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;
use zentinel_response_template::{
    DirectorySource, Request, ResponseTemplateTransformer, ServeEvent, TemplatingConfig,
};

#[derive(Parser, Debug)]
#[command(
    name = "zentinel-response-template",
    about = "Response templating for the Zentinel mock server - render a stub against a request",
    version
)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "response-template.yaml")]
    config: PathBuf,

    /// Id of the stub to render
    #[arg(short, long, required_unless_present_any = ["print_config", "validate"])]
    stub: Option<String>,

    /// YAML file describing the request (defaults to GET /)
    #[arg(short, long)]
    request: Option<PathBuf>,

    /// Root directory for body files
    #[arg(short, long, default_value = ".")]
    files: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'L', long, default_value = "info")]
    log_level: Level,

    /// Print default configuration and exit
    #[arg(long)]
    print_config: bool,

    /// Validate configuration and exit
    #[arg(long)]
    validate: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let subscriber = FmtSubscriber::builder()
        .with_max_level(args.log_level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    // Print default config if requested
    if args.print_config {
        let default_config = include_str!("../demos/default-config.yaml");
        println!("{}", default_config);
        return Ok(());
    }

    info!(path = ?args.config, "Loading configuration");
    let config = TemplatingConfig::from_file(&args.config)
        .with_context(|| format!("Failed to load configuration from {:?}", args.config))?;

    if args.validate {
        println!(
            "Configuration is valid ({} stubs defined)",
            config.stubs.len()
        );
        return Ok(());
    }

    let stub_id = args
        .stub
        .as_deref()
        .context("A stub id is required")?;
    let stub = config
        .stub(stub_id)
        .with_context(|| format!("No stub with id '{}'", stub_id))?
        .clone();

    let request = match &args.request {
        Some(path) => {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read request file {:?}", path))?;
            serde_yaml::from_str::<Request>(&content)
                .with_context(|| format!("Invalid request file {:?}", path))?
        }
        None => Request::new("GET", "/"),
    };

    let transformer = ResponseTemplateTransformer::new(
        config.templating.clone(),
        Arc::new(DirectorySource::new(args.files.clone())),
    )?;

    let mut event = ServeEvent::new(request, stub);
    let response = if transformer.applies_to(&event.response) {
        transformer.transform(&mut event)?
    } else {
        info!(stub_id = %event.stub.id, "Stub does not opt into templating, returning it unchanged");
        event.response.clone()
    };

    print!("{}", serde_yaml::to_string(&response)?);
    if !event.sub_events().is_empty() {
        println!("---");
        print!("{}", serde_yaml::to_string(event.sub_events())?);
    }

    Ok(())
}
