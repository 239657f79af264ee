//! retext command line
//!
//! Replaces text in a PDF and prints the replacement report as JSON.

use anyhow::{Context, Result};
use clap::Parser;
use retext_core::{
    Artifact, EditError, EditRequest, EngineConfig, FailureKind, Instructions, OutputFormat,
    ParseError, ReplacementEngine,
};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "retext")]
#[command(version, about = "Replace text in PDF documents while keeping the layout")]
struct Args {
    /// Input PDF
    input: PathBuf,

    /// Output file; image formats write <stem>-page-<n>.<ext> next to it
    #[arg(short, long)]
    output: PathBuf,

    /// Replacement pair, repeatable
    #[arg(short, long = "replace", value_name = "OLD=NEW", value_parser = parse_pair)]
    replace: Vec<(String, String)>,

    /// Match replacement pairs case-sensitively
    #[arg(long)]
    case_sensitive: bool,

    /// Free-text instruction, translated into replacements
    #[arg(short, long, conflicts_with = "replace")]
    prompt: Option<String>,

    /// Output format: pdf, png or jpeg
    #[arg(short, long, default_value = "pdf")]
    format: OutputFormat,

    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Write the JSON report here instead of stdout
    #[arg(long)]
    report: Option<PathBuf>,
}

fn parse_pair(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((original, _)) if original.is_empty() => {
            Err("the text to replace must not be empty".to_string())
        }
        Some((original, replacement)) => Ok((original.to_string(), replacement.to_string())),
        None => Err(format!("expected OLD=NEW, got '{}'", s)),
    }
}

/// Exit code for a failed run: 2 when the instructions were unusable,
/// 1 for everything else.
fn exit_code(error: &anyhow::Error) -> u8 {
    match error.downcast_ref::<EditError>().map(EditError::failure_kind) {
        Some(FailureKind::Instructions) => 2,
        _ => 1,
    }
}

fn image_path(output: &Path, page_number: u32, format: OutputFormat) -> PathBuf {
    let stem = output
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "page".to_string());
    output.with_file_name(format!(
        "{}-page-{}.{}",
        stem,
        page_number,
        format.extension()
    ))
}

async fn run(args: Args) -> Result<()> {
    let config = match &args.config {
        Some(path) => EngineConfig::from_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => EngineConfig::default(),
    }
    .with_env_overrides()
    .context("applying environment overrides")?;

    let instructions = match args.prompt {
        Some(prompt) => Instructions::Prompt(prompt),
        None if args.replace.is_empty() => {
            return Err(EditError::from(ParseError::NoUsableDirectives(
                "no replacements given; use --replace OLD=NEW or --prompt".to_string(),
            ))
            .into());
        }
        None => Instructions::Manual {
            replacements: args.replace,
            case_sensitive: args.case_sensitive,
        },
    };

    let document = std::fs::read(&args.input)
        .with_context(|| format!("reading {}", args.input.display()))?;

    let engine = ReplacementEngine::from_config(config);
    let request = EditRequest::new(document, instructions).with_format(args.format);
    let outcome = engine
        .run(request)
        .await
        .with_context(|| format!("editing {}", args.input.display()))?;

    match &outcome.artifact {
        Artifact::Document(bytes) => {
            std::fs::write(&args.output, bytes)
                .with_context(|| format!("writing {}", args.output.display()))?;
            tracing::info!(path = %args.output.display(), "document written");
        }
        Artifact::Images(images) => {
            for image in images {
                let path = image_path(&args.output, image.page_number, image.format);
                std::fs::write(&path, &image.bytes)
                    .with_context(|| format!("writing {}", path.display()))?;
                tracing::info!(path = %path.display(), "page image written");
            }
        }
    }

    let json = outcome.report.to_json().context("serializing report")?;
    match &args.report {
        Some(path) => std::fs::write(path, json)
            .with_context(|| format!("writing report {}", path.display()))?,
        None => println!("{}", json),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    // Logs go to stderr; stdout carries the report
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::from(exit_code(&e))
        }
    }
}
