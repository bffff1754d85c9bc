// src/main.rs - command line host for one configured printer
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::broadcast;

use marlin_host::config::{self, Config};
use marlin_host::file_manager::FileManager;
use marlin_host::{Printer, PrinterEvent, PrinterRegistry};

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Drive a Marlin printer over its serial port.
#[derive(Parser, Debug)]
#[command(name = "printer-host", version, about = "Marlin printer host: stream prints, upload to SD, watch the line.")]
struct Cli {
    /// Path to the TOML config file
    #[arg(short, long, default_value = "printer.toml")]
    config: PathBuf,

    /// Printer to use (defaults to the first configured one)
    #[arg(short, long)]
    printer: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Stream a local G-code file line by line
    Print { file: PathBuf },
    /// Print a file already on the SD card
    SdPrint { name: String },
    /// Upload a local file to the SD card
    Upload {
        file: PathBuf,
        /// SD file name (defaults to the local file name)
        #[arg(long)]
        name: Option<String>,
    },
    /// List files on the SD card
    List,
    /// Send one raw command
    Send { line: String },
    /// Show printer status
    Status {
        #[arg(long)]
        json: bool,
    },
    /// Log printer traffic until interrupted
    Monitor,
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    let cli = Cli::parse();
    let config_path = cli.config.to_string_lossy().into_owned();
    let config = match config::load_config(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load config from '{}': {}", config_path, e);
            return Err(e.into());
        }
    };

    let level = config.logging.level.parse().unwrap_or(tracing::Level::INFO);
    tracing_subscriber::fmt().with_max_level(level).init();
    tracing::info!("printer-host {}", env!("CARGO_PKG_VERSION"));

    let mut registry = PrinterRegistry::new();
    let printer = connect(&mut registry, &config, cli.printer.as_deref()).await?;
    let result = run(&printer, cli.command).await;
    registry.shutdown().await;
    result
}

async fn connect(registry: &mut PrinterRegistry, config: &Config, wanted: Option<&str>) -> Result<Printer, BoxError> {
    let entry = match wanted {
        Some(name) => config.printer(name).ok_or_else(|| format!("No printer named '{}' in config", name))?,
        None => config.printers.first().ok_or("No printers configured")?,
    };
    tracing::info!("Using printer '{}' ({:?} {})", entry.name, entry.connection, entry.port);
    Ok(registry.try_add(entry, &config.protocol).await?)
}

async fn run(printer: &Printer, command: Command) -> Result<(), BoxError> {
    let mut events = printer.subscribe();
    match command {
        Command::Print { file } => {
            printer.start_print(&file).await?;
            wait_for_print(printer, &mut events).await;
        }
        Command::SdPrint { name } => {
            printer.start_sd_print(&name).await?;
            wait_for_print(printer, &mut events).await;
        }
        Command::Upload { file, name } => {
            let job = FileManager::new().read_upload_job(&file, name.as_deref()).await?;
            let file_name = job.file_name.clone();
            printer.submit_job(job);
            loop {
                match events.recv().await {
                    Ok(PrinterEvent::UploadComplete { file_name: done }) if done == file_name => break,
                    Ok(PrinterEvent::WriterFailed { reason }) => return Err(reason.into()),
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            println!("Uploaded {}", file_name);
        }
        Command::List => {
            printer.request_file_listing().await?;
            let listing = tokio::time::timeout(Duration::from_secs(10), async {
                loop {
                    match events.recv().await {
                        Ok(PrinterEvent::FileListReceived { files }) => return Some(files),
                        Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            })
            .await
            .ok()
            .flatten()
            .ok_or("Printer did not answer the file listing request")?;
            for file in listing {
                println!("{}", file);
            }
        }
        Command::Send { line } => {
            printer.send_command(&line).await?;
            let _ = tokio::time::timeout(Duration::from_secs(5), async {
                while let Ok(event) = events.recv().await {
                    if let PrinterEvent::LineReceived { line } = event {
                        println!("{}", line);
                        if line.starts_with("ok") {
                            break;
                        }
                    }
                }
            })
            .await;
        }
        Command::Status { json } => {
            let report = printer.status_report();
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("{}: {}", report.name, report.status);
                println!("{}", report);
            }
        }
        Command::Monitor => loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => break,
                event = events.recv() => match event {
                    Ok(event) => log_event(&event),
                    Err(broadcast::error::RecvError::Lagged(n)) => tracing::warn!("Missed {} events", n),
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        },
    }
    Ok(())
}

/// Report progress until the print ends; Ctrl-C cancels it.
async fn wait_for_print(printer: &Printer, events: &mut broadcast::Receiver<PrinterEvent>) {
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted, cancelling print");
                if let Err(e) = printer.cancel_print().await {
                    tracing::error!("Cancel failed: {}", e);
                }
                return;
            }
            event = events.recv() => match event {
                Ok(event @ (PrinterEvent::PrintComplete { .. } | PrinterEvent::PrintCancelled { .. } | PrinterEvent::ConnectionLost { .. })) => {
                    log_event(&event);
                    return;
                }
                Ok(PrinterEvent::Progress(progress)) => tracing::info!("{}", progress),
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return,
            },
        }
    }
}

fn log_event(event: &PrinterEvent) {
    match event {
        PrinterEvent::LineReceived { line } => tracing::info!("<< {}", line),
        PrinterEvent::LineSent { line } => tracing::info!(">> {}", line),
        PrinterEvent::ProtocolAnomaly { description } => tracing::warn!("Anomaly: {}", description),
        PrinterEvent::ConnectionLost { reason } | PrinterEvent::WriterFailed { reason } => {
            tracing::error!("{}", reason)
        }
        other => match serde_json::to_string(other) {
            Ok(json) => tracing::info!("{}", json),
            Err(_) => tracing::info!("{:?}", other),
        },
    }
}
