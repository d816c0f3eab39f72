use anyhow::Error;
use bridge_ota::messages::{MANUAL_DONE, MANUAL_UPLOADING};
use bridge_ota::prelude::*;
use bridge_ota::status::format_bytes;
use bridge_ota::upload::error_text;
use clap::{Parser, Subcommand};
use log::warn;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::watch;

#[derive(Parser)]
#[command(name = "bridge-ota", about = "OTA companion tool for bridge devices")]
struct Cli {
    /// Device base URL, overriding the config file
    #[arg(long)]
    device: Option<String>,

    /// Path to a RON config file
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show the device's OTA status
    Status {
        /// Keep polling and print every change
        #[arg(long)]
        watch: bool,
    },
    /// Ask the device to fetch and stage the latest release
    Fetch,
    /// Cancel the running update
    Cancel,
    /// Upload a firmware ZIP bundle manually
    Upload {
        /// Path to the firmware ZIP (manifest.json plus build parts)
        archive: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    env_logger::init();
    let cli = Cli::parse();

    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(device) = cli.device {
        config.device_url = device;
    }

    let channel = HttpDeviceChannel::new(&config.device_url);
    let messages = Messages::english();

    match cli.command {
        Command::Status { watch: false } => {
            let payload = channel.get_status().await?;
            print_snapshot(&OtaStatusSnapshot::from_payload(&payload, &messages));
        }

        Command::Status { watch: true } => {
            // Keep the poller active for the whole run; ctrl-c ends it
            let (_active_tx, active_rx) = watch::channel(true);
            let poller = StatusPoller::new(
                channel,
                messages,
                Duration::from_millis(config.poll_interval_ms),
                active_rx,
            );
            let mut snapshots = poller.snapshots();
            let handle = tokio::spawn(poller.run());

            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    changed = snapshots.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let snapshot = snapshots.borrow().clone();
                        print_snapshot(&snapshot);
                    }
                }
            }
            handle.abort();
        }

        Command::Fetch => {
            let controller = one_shot_controller(&channel, &messages).await?;
            match controller.trigger_fetch().await {
                Ok(()) => println!("Fetch requested; poll the status for progress."),
                Err(err) => println!("{err}"),
            }
        }

        Command::Cancel => {
            let controller = one_shot_controller(&channel, &messages).await?;
            match controller.cancel().await {
                Ok(()) => println!("Cancel requested."),
                Err(err) => println!("{err}"),
            }
        }

        Command::Upload { archive } => {
            let bytes = tokio::fs::read(&archive).await?;
            let mut reader = ZipArchiveReader::from_bytes(bytes)?;
            let service = UploadService::new(channel, config.chunk_size);

            let (cancel_tx, mut cancel_rx) = watch::channel(false);
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("cancelling upload after current step");
                    let _ = cancel_tx.send(true);
                }
            });

            let mut progress = service.progress();
            let printer_messages = messages.clone();
            let printer = tokio::spawn(async move {
                while progress.changed().await.is_ok() {
                    let progress = progress.borrow().clone();
                    match progress.state {
                        UploadState::PartBegun => println!(
                            "{}",
                            printer_messages
                                .translate(MANUAL_UPLOADING, &[("path", &progress.part_path)])
                        ),
                        UploadState::Transferring => println!(
                            "{}: {} / {}",
                            progress.part_path,
                            format_bytes(progress.bytes_sent),
                            format_bytes(progress.bytes_total)
                        ),
                        _ => {}
                    }
                }
            });

            let result = service.begin_upload(&mut reader, &mut cancel_rx).await;
            printer.abort();
            match result {
                Ok(UploadOutcome::Succeeded) => {
                    println!("{}", messages.translate(MANUAL_DONE, &[]))
                }
                Ok(UploadOutcome::Cancelled) => println!("Upload cancelled."),
                Err(err) => return Err(Error::msg(error_text(&err, &messages))),
            }
        }
    }

    Ok(())
}

/// Commands gate on the device's current busy state, so a one-shot
/// command takes a single status snapshot first.
async fn one_shot_controller(
    channel: &HttpDeviceChannel,
    messages: &Messages,
) -> Result<RemoteUpdateController<HttpDeviceChannel>, Error> {
    let payload = channel.get_status().await?;
    let snapshot = OtaStatusSnapshot::from_payload(&payload, messages);
    // The controller only reads the last value; the sender can drop here
    let (_tx, rx) = watch::channel(snapshot);
    Ok(RemoteUpdateController::new(channel.clone(), rx))
}

fn print_snapshot(snapshot: &OtaStatusSnapshot) {
    let current = snapshot.current_version.as_deref().unwrap_or("—");
    let latest = snapshot.latest_version.as_deref().unwrap_or("—");
    println!("installed {current}  latest {latest}");
    if let Some(err) = &snapshot.latest_error {
        println!("release check failed: {err}");
    }
    if let Some(err) = &snapshot.poll_error {
        println!("status fetch failed: {err}");
    }
    println!("{}", snapshot.status_line);
    if snapshot.bytes_total > 0 {
        println!(
            "{:>3}%  {} / {}",
            snapshot.progress_percent().unwrap_or(0),
            format_bytes(snapshot.bytes_written),
            format_bytes(snapshot.bytes_total)
        );
    }
}
