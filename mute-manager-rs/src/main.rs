//! Audio Endpoint Mute Manager - console front-end
//!
//! Prints the endpoint lists and reads line commands from stdin:
//!
//! ```text
//! list
//! select <flow> <device-id|all>
//! mute <flow> | unmute <flow> | toggle <flow>
//! volume <flow> <0..1>
//! status
//! quit
//! ```

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use mute_manager_rs::{AppState, Command, DataFlow, DeviceId, EngineConfig, FlowStatus};
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "mute-manager-rs", version)]
#[command(about = "Mute and volume control for audio endpoints", long_about = None)]
struct Cli {
    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log filter (e.g. "debug"), overrides the configuration file
    #[arg(short, long)]
    log_level: Option<String>,
}

enum Input {
    List,
    Status,
    Quit,
    Command(DataFlow, Command),
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => {
            let json = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            EngineConfig::from_json(&json)
                .with_context(|| format!("Invalid configuration in {}", path.display()))?
        }
        None => EngineConfig::default(),
    };
    if cli.log_level.is_some() {
        config.log_level = cli.log_level;
    }

    init_tracing(config.log_level.as_deref());

    let app = AppState::with_default_backend(config).context("Failed to start audio engine")?;
    print_devices(&app);

    let stdin = io::stdin();
    let mut stdout = io::stdout();
    for line in stdin.lock().lines() {
        let line = line.context("Failed to read stdin")?;
        if line.trim().is_empty() {
            continue;
        }

        match parse_input(&line) {
            Ok(Input::Quit) => break,
            Ok(Input::List) => print_devices(&app),
            Ok(Input::Status) => {
                for flow in DataFlow::ALL {
                    print_status(&app.status(flow));
                }
            }
            Ok(Input::Command(flow, command)) => print_status(&app.handle(flow, command)),
            Err(e) => eprintln!("error: {e:#}"),
        }
        stdout.flush()?;
    }

    app.shutdown();
    Ok(())
}

fn init_tracing(level: Option<&str>) {
    let filter = match level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn parse_input(line: &str) -> Result<Input> {
    let words: Vec<&str> = line.split_whitespace().collect();
    let flow = |index: usize| -> Result<DataFlow> {
        let name = words
            .get(index)
            .ok_or_else(|| anyhow!("missing flow (capture|render)"))?;
        DataFlow::parse(name).ok_or_else(|| anyhow!("unknown flow '{name}'"))
    };

    let input = match words.first().copied() {
        Some("list") => Input::List,
        Some("status") => Input::Status,
        Some("quit") | Some("exit") => Input::Quit,
        Some("mute") => Input::Command(flow(1)?, Command::Mute),
        Some("unmute") => Input::Command(flow(1)?, Command::Unmute),
        Some("toggle") => Input::Command(flow(1)?, Command::ToggleMute),
        Some("refresh") => Input::Command(flow(1)?, Command::Refresh),
        Some("volume") => {
            let value = words.get(2).ok_or_else(|| anyhow!("missing volume"))?;
            let volume: f32 = value
                .parse()
                .with_context(|| format!("invalid volume '{value}'"))?;
            Input::Command(flow(1)?, Command::SetVolume(volume))
        }
        Some("select") => {
            let id = words.get(2).ok_or_else(|| anyhow!("missing device id"))?;
            let id = if id.eq_ignore_ascii_case("all") {
                DeviceId::all()
            } else {
                DeviceId::new(*id)
            };
            Input::Command(flow(1)?, Command::Select(id))
        }
        Some(other) => bail!("unknown command '{other}'"),
        None => bail!("empty command"),
    };
    Ok(input)
}

fn print_devices(app: &AppState) {
    for flow in DataFlow::ALL {
        println!("[{flow}]");
        for device in app.devices(flow) {
            let marker = match (device.is_selected, device.is_active) {
                (true, true) => "*",
                (true, false) => "?",
                _ => " ",
            };
            println!(
                " {marker} {:<40} {:<8} {:>6}  {}",
                device.name,
                fmt_mute(device.is_muted),
                fmt_volume(device.volume),
                device.id,
            );
        }
    }
}

fn print_status(status: &FlowStatus) {
    println!(
        "{}: selected={} active={} connected={} mute={} volume={}",
        status.flow,
        status.selected_device,
        status.active_device,
        status.is_connected,
        fmt_mute(status.is_muted),
        fmt_volume(status.volume),
    );
}

fn fmt_mute(muted: Option<bool>) -> &'static str {
    match muted {
        Some(true) => "muted",
        Some(false) => "live",
        None => "-",
    }
}

fn fmt_volume(volume: Option<f32>) -> String {
    volume
        .map(|v| format!("{:.0}%", v * 100.0))
        .unwrap_or_else(|| "-".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_commands() {
        assert!(matches!(
            parse_input("mute mic").unwrap(),
            Input::Command(DataFlow::Capture, Command::Mute)
        ));
        assert!(matches!(
            parse_input("volume render 0.5").unwrap(),
            Input::Command(DataFlow::Render, Command::SetVolume(v)) if v == 0.5
        ));
        assert!(matches!(
            parse_input("select capture all").unwrap(),
            Input::Command(DataFlow::Capture, Command::Select(id)) if id.is_all()
        ));
        assert!(matches!(parse_input("quit").unwrap(), Input::Quit));
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse_input("mute").is_err());
        assert!(parse_input("volume capture loud").is_err());
        assert!(parse_input("dance capture").is_err());
    }
}
