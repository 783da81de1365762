use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Subcommand};

use crate::exit::{CliError, CliResult, USAGE};
use crate::output::OutputFormat;

pub mod flash;
pub mod hash;
pub mod serve;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Send a firmware image to a device.
    Flash(FlashArgs),
    /// Emulate a dual-slot device that accepts updates over TCP.
    Serve(ServeArgs),
    /// Print size and digests of a firmware image.
    Hash(HashArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Flash(args) => flash::run(args, format),
        Command::Serve(args) => serve::run(args, format),
        Command::Hash(args) => hash::run(args, format),
        Command::Version(args) => version::run(args),
    }
}

#[derive(Args, Debug)]
pub struct FlashArgs {
    /// Device address (host:port).
    #[arg(env = "OTALINK_DEVICE")]
    pub addr: String,
    /// Firmware image to send.
    pub firmware: PathBuf,
    /// Version string announced in Begin (at most 31 bytes).
    #[arg(long, default_value = "")]
    pub version: String,
    /// Fixed chunk size in bytes (capped at 1016).
    #[arg(long, conflicts_with = "mtu")]
    pub chunk_size: Option<usize>,
    /// Derive the chunk size from a packet MTU.
    #[arg(long)]
    pub mtu: Option<usize>,
    /// Wait for each Begin/Data acknowledgement (e.g. 5s, 500ms).
    #[arg(long, default_value = "5s", env = "OTALINK_TIMEOUT")]
    pub timeout: String,
    /// Wait for the End acknowledgement, which covers verification.
    #[arg(long, default_value = "30s")]
    pub end_timeout: String,
    /// Resends of one message before giving up.
    #[arg(long, default_value_t = 3, env = "OTALINK_RETRIES")]
    pub retries: u32,
    /// Print progress to stderr.
    #[arg(long)]
    pub progress: bool,
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Address to listen on (e.g. 127.0.0.1:7300).
    pub addr: String,
    /// Size of each emulated flash slot in bytes.
    #[arg(long, default_value_t = 1024 * 1024)]
    pub slot_size: usize,
    /// Reboot into each installed image and confirm it.
    #[arg(long)]
    pub auto_confirm: bool,
    /// Exit after N connections.
    #[arg(long)]
    pub count: Option<usize>,
    /// Abort a session with no traffic for this long.
    #[arg(long, default_value = "30s")]
    pub idle_timeout: String,
    /// Delay after each chunk write, emulating slow flash.
    #[arg(long)]
    pub chunk_pause: Option<String>,
    /// Version the emulated device is running; older updates are refused.
    #[arg(long)]
    pub current_version: Option<String>,
}

#[derive(Args, Debug)]
pub struct HashArgs {
    /// Firmware image.
    pub file: PathBuf,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

/// Parse `500ms`, `5s` or a bare number of seconds.
pub fn parse_duration(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::new(USAGE, "duration must not be empty"));
    }

    let (number, millis) = if let Some(num) = input.strip_suffix("ms") {
        (num, true)
    } else if let Some(num) = input.strip_suffix('s') {
        (num, false)
    } else {
        (input, false)
    };

    let value: u64 = number
        .parse()
        .map_err(|_| CliError::new(USAGE, format!("invalid duration value: {input}")))?;
    if value == 0 {
        return Err(CliError::new(USAGE, "duration must be greater than zero"));
    }

    Ok(if millis {
        Duration::from_millis(value)
    } else {
        Duration::from_secs(value)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_duration_seconds_and_millis() {
        assert_eq!(parse_duration("2s").unwrap(), Duration::from_secs(2));
        assert_eq!(parse_duration("150ms").unwrap(), Duration::from_millis(150));
        assert_eq!(parse_duration(" 3 ").unwrap(), Duration::from_secs(3));
    }

    #[test]
    fn parse_duration_rejects_invalid_values() {
        assert!(parse_duration("0s").is_err());
        assert!(parse_duration("bad").is_err());
        assert!(parse_duration("").is_err());
        assert_eq!(parse_duration("5m").unwrap_err().code, USAGE);
    }
}
