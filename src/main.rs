use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use markscan::detection::classifier;
use markscan::server::{self, AppState};
use markscan::{Config, Frame, LedgerStore, MarkScanner, Recognizer, SaveOutcome, ScanOutcome, SessionTally};

#[derive(Parser)]
#[command(name = "markscan")]
#[command(about = "Read handwritten marks tables and keep running totals")]
struct Cli {
    /// TOML configuration file
    #[arg(long, value_name = "FILE", env = "MARKSCAN_CONFIG")]
    config: Option<PathBuf>,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Save debug outputs to directory (must be empty)
    #[arg(long, value_name = "DIR")]
    debug_out: Option<PathBuf>,

    /// Directory holding ledger files (overrides the config)
    #[arg(long, value_name = "DIR")]
    ledger_root: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP service
    Serve {
        /// Address to bind (overrides the config)
        #[arg(long)]
        bind: Option<std::net::SocketAddr>,
    },
    /// Recognize one image without saving
    Scan {
        #[arg(value_name = "IMAGE")]
        image_path: PathBuf,
    },
    /// Recognize images and append each accepted row to a ledger
    Save {
        #[arg(long)]
        excel_path: Option<String>,

        #[arg(value_name = "IMAGE", required = true)]
        image_paths: Vec<PathBuf>,
    },
    /// Print the grand total of a ledger
    Total {
        #[arg(value_name = "EXCEL_PATH")]
        excel_path: Option<String>,
    },
    /// Print a ledger as CSV
    Export {
        #[arg(value_name = "EXCEL_PATH")]
        excel_path: Option<String>,
    },
}

fn init_tracing(log_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn build_scanner(config: &Config, debug_out: Option<&Path>) -> anyhow::Result<MarkScanner> {
    let classifier = classifier::from_config(&config.classifier)?;
    let mut recognizer = Recognizer::new(&config.recognition, classifier);
    if let Some(dir) = debug_out {
        recognizer = recognizer
            .with_debug(dir)
            .with_context(|| format!("Cannot use debug directory {:?}", dir))?;
    }
    info!(
        classifier = recognizer.classifier_name(),
        workers = config.server.workers,
        ledger_root = %config.ledger.root.display(),
        "Scanner ready"
    );
    let ledger = LedgerStore::new(config.ledger.root.clone());
    Ok(MarkScanner::new(recognizer, ledger, config.server.workers))
}

fn read_frame(path: &Path) -> anyhow::Result<Frame> {
    let bytes = std::fs::read(path).with_context(|| format!("Failed to read image {:?}", path))?;
    Ok(Frame::new(bytes))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Cli::parse();
    init_tracing(&args.log_level);

    let mut config = match &args.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("Failed to load config {:?}", path))?,
        None => Config::default(),
    };
    if let Some(root) = args.ledger_root {
        config.ledger.root = root;
    }
    if let Command::Serve { bind: Some(bind) } = &args.command {
        config.server.bind = *bind;
    }
    config.validate()?;

    let scanner = build_scanner(&config, args.debug_out.as_deref())?;
    let default_path = config.ledger.default_path.clone();

    match args.command {
        Command::Serve { .. } => {
            for warning in config.serve_warnings() {
                warn!("{warning}");
            }
            let state =
                AppState::new(scanner.clone(), default_path, &config.server.allow_origin)?;
            let app = server::router(state, config.server.max_body_bytes);
            server::serve(config.server.bind, app).await?;
        }
        Command::Scan { image_path } => {
            match scanner.scan(read_frame(&image_path)?).await? {
                ScanOutcome::Detected(recognized) => {
                    for p in &recognized.predictions {
                        println!(
                            "  ({}, {}) {} - confidence: {:.2}",
                            p.position.row, p.position.column, p.digit, p.confidence
                        );
                    }
                    println!("Marks: {:?}  Total: {}", recognized.row.marks, recognized.row.total);
                }
                ScanOutcome::NoDetection(none) => {
                    println!("{} ({})", none.message(), none.detail);
                }
            }
        }
        Command::Save {
            excel_path,
            image_paths,
        } => {
            let excel_path = excel_path.unwrap_or(default_path);
            let mut session = SessionTally::new();
            for image_path in &image_paths {
                match scanner.save(read_frame(image_path)?, &excel_path).await? {
                    SaveOutcome::Saved(saved) => {
                        let session_sum = session.record(saved.row().total);
                        println!(
                            "{}: marks {:?}  row total {}  session {}  grand total {}",
                            image_path.display(),
                            saved.row().marks,
                            saved.row().total,
                            session_sum,
                            saved.grand_total
                        );
                    }
                    SaveOutcome::NoDetection(none) => {
                        println!("{}: {} ({})", image_path.display(), none.message(), none.detail);
                    }
                }
            }
            println!("Saved {} of {} images", session.saves(), image_paths.len());
        }
        Command::Total { excel_path } => {
            let excel_path = excel_path.unwrap_or(default_path);
            println!("{}", scanner.grand_total(&excel_path).await?);
        }
        Command::Export { excel_path } => {
            let excel_path = excel_path.unwrap_or(default_path);
            print!("{}", scanner.export_csv(&excel_path).await?);
        }
    }

    scanner.ledger().close().await;
    Ok(())
}
