// Copyright (C) 2026 Michael Wilson <mike@mdwn.dev>
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free Software
// Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//
use std::error::Error;
use std::path::PathBuf;

use clap::{crate_version, Parser, Subcommand};
use tracing::info;

use sdsload::audio::capture;
use sdsload::config::Loader;
use sdsload::control::DeviceControlChannel;
use sdsload::midi::{self, DeviceConnection};
use sdsload::queue::{EntrySnapshot, TransferQueue, TransferRequest, TransferStatus};
use sdsload::version;

#[derive(Parser)]
#[clap(
    author = "Michael Wilson",
    version = crate_version!(),
    about = "Loads audio samples into hardware sample slots over MIDI Sample Dump."
)]
struct Cli {
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Lists the available MIDI input/output devices.
    MidiDevices {},
    /// Lists the available audio input devices.
    InputDevices {},
    /// Uploads an audio file into a slot.
    Upload {
        /// The MIDI device name to upload to.
        device_name: String,
        /// The slot to write.
        slot: u16,
        /// The audio file to upload.
        file: String,
        /// The configuration file to take the sample rate, duration and slots from.
        #[arg[short, long]]
        config_path: Option<String>,
    },
    /// Records from an audio input and uploads the recording into a slot.
    Record {
        /// The MIDI device name to upload to.
        device_name: String,
        /// The slot to write.
        slot: u16,
        /// The audio input to record from. Defaults to the system default input.
        #[arg[short, long]]
        input_device: Option<String>,
        /// The configuration file to take the sample rate, duration and slots from.
        #[arg[short, long]]
        config_path: Option<String>,
    },
    /// Uploads every file listed in a configuration file.
    Batch {
        /// The path to the configuration file.
        config_path: String,
    },
    /// Asks the device for its firmware version.
    Identify {
        /// The MIDI device name to ask.
        device_name: String,
        /// The latest available firmware version. Reports whether the device is behind it.
        #[arg[short, long]]
        latest: Option<String>,
    },
    /// Reboots the device into its bootloader.
    Reboot {
        /// The MIDI device name to reboot.
        device_name: String,
    },
}

/// Loads the configuration if a path was given, otherwise uses defaults for the device.
fn loader(device_name: &str, config_path: Option<&str>) -> Result<Loader, Box<dyn Error>> {
    Ok(match config_path {
        Some(path) => Loader::load(&PathBuf::from(path))?,
        None => Loader::new(device_name),
    })
}

fn connect(device_name: &str) -> Result<DeviceConnection, Box<dyn Error>> {
    let device = midi::get_device(device_name)?;
    Ok(DeviceConnection::bound(device)?)
}

fn print_progress(snapshot: &EntrySnapshot) {
    match snapshot.status {
        TransferStatus::Transferring if snapshot.progress_percent % 10 == 0 => println!(
            "Slot {}: {} {}%",
            snapshot.slot, snapshot.source_name, snapshot.progress_percent
        ),
        TransferStatus::Transferring | TransferStatus::Pending => {}
        TransferStatus::Processing => {
            println!("Slot {}: processing {}", snapshot.slot, snapshot.source_name)
        }
        TransferStatus::Completed => {
            println!("Slot {}: {} completed", snapshot.slot, snapshot.source_name)
        }
        TransferStatus::Failed => println!(
            "Slot {}: {} failed: {}",
            snapshot.slot,
            snapshot.source_name,
            snapshot.error_reason.as_deref().unwrap_or("unknown error")
        ),
    }
}

/// Runs the requests through a queue and fails if any of them failed.
async fn upload_all(
    loader: &Loader,
    connection: &mut DeviceConnection,
    requests: Vec<TransferRequest>,
) -> Result<(), Box<dyn Error>> {
    let queue = TransferQueue::new(loader.slots(), loader.normalizer()?);
    queue.set_listener(print_progress);

    for request in requests {
        queue.enqueue(request)?;
    }
    queue.run(connection).await?;

    let failed = queue
        .entries()
        .iter()
        .filter(|entry| entry.status == TransferStatus::Failed)
        .count();
    if failed > 0 {
        return Err(format!("{} transfer(s) failed", failed).into());
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    match cli.command {
        Commands::MidiDevices {} => {
            let devices = midi::list_devices()?;

            if devices.is_empty() {
                println!("No devices found.");
                return Ok(());
            }

            println!("Devices:");
            for device in devices {
                println!("- {}", device);
            }
        }
        Commands::InputDevices {} => {
            let devices = capture::list_input_devices()?;

            if devices.is_empty() {
                println!("No devices found.");
                return Ok(());
            }

            println!("Devices:");
            for device in devices {
                println!("- {}", device);
            }
        }
        Commands::Upload {
            device_name,
            slot,
            file,
            config_path,
        } => {
            let loader = loader(&device_name, config_path.as_deref())?;
            let mut connection = connect(&device_name)?;
            upload_all(
                &loader,
                &mut connection,
                vec![TransferRequest::file(file, slot)],
            )
            .await?;
        }
        Commands::Record {
            device_name,
            slot,
            input_device,
            config_path,
        } => {
            let loader = loader(&device_name, config_path.as_deref())?;
            let normalizer = loader.normalizer()?;
            let max_duration = normalizer.max_duration();

            println!("Recording for {:?}...", max_duration);
            let recording = tokio::task::spawn_blocking(move || {
                capture::record(input_device.as_deref(), max_duration)
            })
            .await??;
            let audio = normalizer.normalize(&recording, "recording")?;
            info!(samples = audio.sample_count(), "Recorded sample.");

            let mut connection = connect(&device_name)?;
            upload_all(
                &loader,
                &mut connection,
                vec![TransferRequest::ready(audio, slot)],
            )
            .await?;
        }
        Commands::Batch { config_path } => {
            let loader = Loader::load(&PathBuf::from(&config_path))?;
            let requests = loader.upload_requests();
            if requests.is_empty() {
                println!("No uploads listed in {}.", config_path);
                return Ok(());
            }

            let mut connection = connect(loader.device())?;
            upload_all(&loader, &mut connection, requests).await?;
        }
        Commands::Identify {
            device_name,
            latest,
        } => {
            let mut connection = connect(&device_name)?;
            let current = DeviceControlChannel::new(&mut connection)
                .request_version_with_retry()
                .await?;

            match &current {
                Some(current) => println!("Firmware version: {}", current),
                None => println!("The device did not report a firmware version."),
            }
            if let Some(latest) = latest {
                if version::is_newer(current.as_deref(), &latest) {
                    println!("Firmware {} is available.", latest);
                } else {
                    println!("Firmware is up to date.");
                }
            }
        }
        Commands::Reboot { device_name } => {
            let mut connection = connect(&device_name)?;
            DeviceControlChannel::new(&mut connection).reboot_to_bootloader()?;
            println!("Rebooted {} to its bootloader.", device_name);
        }
    }

    Ok(())
}
