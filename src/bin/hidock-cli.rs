//! Thin CLI demo over the device façade and operations manager. The library
//! crate never depends on `anyhow`; this binary is the one place allowed to
//! flatten `HiDockError` into a loosely-typed error for reporting to a
//! terminal.

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use hidock::commands::{DeviceSettings, DeviceTime};
use hidock::{Device, discover};

#[derive(Parser)]
#[command(author, version, about = "HiDock H1/H1E/P1 command-line driver")]
struct Cli {
    /// `vid:pid` in hex, e.g. 10d6:af0d. Defaults to the first device found.
    #[arg(long, global = true)]
    device: Option<String>,

    /// Directory the metadata cache is persisted under.
    #[arg(long, global = true, default_value = ".hidock-cache")]
    cache_dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List HiDock devices currently attached, without connecting to any.
    ListDevices,
    /// Connect and print the resulting device identity (every other
    /// subcommand connects implicitly; this one exists to check reachability
    /// on its own).
    Connect,
    /// Print the connected device's identity and firmware version.
    Info,
    /// List recordings known to the device, reconciled against the cache.
    ListFiles,
    /// Download one recording into a destination directory.
    Download { filename: String, dest_dir: PathBuf },
    /// Delete one recording from the device.
    Delete { filename: String },
    /// Format the storage card. Destructive; clears the local cache too.
    Format,
    /// Print the current device settings.
    GetSettings,
    /// Set all four device settings flags at once.
    SetSettings {
        auto_record: bool,
        auto_play: bool,
        bluetooth_tone: bool,
        notification_sound: bool,
    },
    /// Push the host's current time to the device.
    SyncTime,
}

fn parse_vid_pid(spec: &str) -> Result<(u16, u16)> {
    let (vid, pid) = spec
        .split_once(':')
        .with_context(|| format!("expected vid:pid, got {spec:?}"))?;
    Ok((
        u16::from_str_radix(vid, 16).with_context(|| format!("invalid vendor id {vid:?}"))?,
        u16::from_str_radix(pid, 16).with_context(|| format!("invalid product id {pid:?}"))?,
    ))
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    if let Command::ListDevices = cli.command {
        for info in discover()? {
            println!("{} {} ({})", info.id, info.name, info.serial_number);
        }
        return Ok(());
    }

    let vid_pid = cli.device.as_deref().map(parse_vid_pid).transpose()?;
    let mut device = Device::new(&cli.cache_dir);
    device.connect(vid_pid).context("connecting to device")?;

    match cli.command {
        Command::ListDevices => unreachable!("handled above"),
        Command::Connect => {
            let info = device.get_device_info().context("no device info available")?;
            println!("connected to {} ({})", info.name, info.id);
        }
        Command::Info => {
            let info = device.get_device_info().context("no device info available")?;
            println!(
                "{} ({} fw {}, serial {})",
                info.name, info.id, info.firmware_version, info.serial_number
            );
        }
        Command::ListFiles => {
            for entry in device.get_recordings()? {
                println!(
                    "{}\t{} bytes\t{:.1}s",
                    entry.filename, entry.size, entry.duration
                );
            }
        }
        Command::Download { filename, dest_dir } => {
            std::fs::create_dir_all(&dest_dir)?;
            let path = device.download_recording(&filename, &dest_dir, None, |received, total| {
                match total {
                    Some(total) => print!("\r{filename}: {received}/{total} bytes"),
                    None => print!("\r{filename}: {received} bytes"),
                }
                true
            })?;
            println!("\nsaved to {}", path.display());
        }
        Command::Delete { filename } => match device.delete_recording(&filename)? {
            hidock::commands::DeleteOutcome::Deleted => println!("deleted {filename}"),
            hidock::commands::DeleteOutcome::NotFound => bail!("{filename} not found on device"),
        },
        Command::Format => {
            device.format_storage()?;
            println!("storage formatted");
        }
        Command::GetSettings => {
            let settings = device.get_settings()?;
            println!(
                "auto_record={} auto_play={} bluetooth_tone={} notification_sound={}",
                settings.auto_record,
                settings.auto_play,
                settings.bluetooth_tone,
                settings.notification_sound
            );
        }
        Command::SetSettings {
            auto_record,
            auto_play,
            bluetooth_tone,
            notification_sound,
        } => {
            device.set_settings(DeviceSettings {
                auto_record,
                auto_play,
                bluetooth_tone,
                notification_sound,
            })?;
            println!("settings updated");
        }
        Command::SyncTime => {
            let now = local_time_now();
            device.sync_time(now)?;
            println!(
                "device clock synced to {:04}-{:02}-{:02} {:02}:{:02}:{:02}",
                now.year, now.month, now.day, now.hour, now.minute, now.second
            );
        }
    }

    Ok(())
}

fn local_time_now() -> DeviceTime {
    let now = chrono::Local::now().naive_local();
    use chrono::{Datelike, Timelike};
    DeviceTime {
        year: now.year() as u32,
        month: now.month() as u8,
        day: now.day() as u8,
        hour: now.hour() as u8,
        minute: now.minute() as u8,
        second: now.second() as u8,
    }
}
