use tandem_core::{Device, SyncSession};

use crate::cli::DeviceCommands;
use crate::commands::common::{
    device_info, format_relative_time, normalize_identifier, print_json,
};
use crate::error::CliError;

pub async fn run_device(session: &SyncSession, command: DeviceCommands) -> Result<(), CliError> {
    match command {
        DeviceCommands::Register => {
            let device = session
                .devices()
                .register_device(device_info(session.device_id()))
                .await?;
            println!("Registered {} ({})", device.device_id, device.platform);
            Ok(())
        }
        DeviceCommands::List { refresh, json } => {
            let devices = if refresh {
                session.devices().refresh_devices().await?
            } else {
                session.devices().list_devices(session.account_id())?
            };
            if json {
                return print_json(&devices);
            }
            if devices.is_empty() {
                println!("No devices registered.");
                return Ok(());
            }
            let now_ms = chrono::Utc::now().timestamp_millis();
            for line in format_device_lines(&devices, session.device_id(), now_ms) {
                println!("{line}");
            }
            Ok(())
        }
        DeviceCommands::Primary { device_id } => {
            let device_id = normalize_identifier(&device_id)?;
            session.devices().set_primary(&device_id).await?;
            println!("{device_id} is now the primary device");
            Ok(())
        }
        DeviceCommands::Deactivate { device_id } => {
            let device_id = normalize_identifier(&device_id)?;
            session.devices().mark_inactive(&device_id)?;
            println!("{device_id} marked inactive");
            Ok(())
        }
    }
}

pub fn format_device_lines(devices: &[Device], current: &str, now_ms: i64) -> Vec<String> {
    devices
        .iter()
        .map(|device| {
            let mut flags = Vec::new();
            if device.device_id == current {
                flags.push("this");
            }
            if device.is_primary {
                flags.push("primary");
            }
            if !device.is_active {
                flags.push("inactive");
            }
            format!(
                "{:<40}  {:<8}  {:<8}  seen {:<9}  {}",
                device.device_id,
                device.platform.as_str(),
                device.app_version,
                format_relative_time(device.last_seen_at, now_ms),
                flags.join(",")
            )
        })
        .collect()
}
