mod cmd;
mod exit;
mod logging;
mod output;

use clap::Parser;

use crate::cmd::Command;
use crate::logging::{init_logging, LogFormat, LogLevel};
use crate::output::OutputFormat;

#[derive(Parser, Debug)]
#[command(name = "otalink", version, about = "Over-the-air firmware transfer")]
struct Cli {
    /// Result output format (stdout).
    #[arg(long, value_name = "FORMAT", global = true)]
    format: Option<OutputFormat>,

    /// Log output format (stderr).
    #[arg(long, value_name = "FORMAT", default_value = "text", global = true)]
    log_format: LogFormat,

    /// Minimum log level (stderr).
    #[arg(
        long,
        value_name = "LEVEL",
        default_value = "info",
        env = "OTALINK_LOG_LEVEL",
        global = true
    )]
    log_level: LogLevel,

    #[command(subcommand)]
    command: Command,
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.log_format, cli.log_level);

    let format = cli.format.unwrap_or_else(OutputFormat::default_for_stdout);
    match cmd::run(cli.command, format) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(err.code);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_flash_subcommand() {
        let cli = Cli::try_parse_from([
            "otalink",
            "flash",
            "127.0.0.1:7300",
            "fw.bin",
            "--version",
            "v1.2.3",
            "--mtu",
            "247",
        ])
        .expect("flash args should parse");

        match cli.command {
            Command::Flash(args) => {
                assert_eq!(args.version, "v1.2.3");
                assert_eq!(args.mtu, Some(247));
                assert_eq!(args.retries, 3);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn rejects_chunk_size_with_mtu() {
        let err = Cli::try_parse_from([
            "otalink",
            "flash",
            "127.0.0.1:7300",
            "fw.bin",
            "--chunk-size",
            "512",
            "--mtu",
            "247",
        ])
        .expect_err("conflicting args should fail");

        assert_eq!(err.kind(), clap::error::ErrorKind::ArgumentConflict);
    }

    #[test]
    fn parses_serve_subcommand() {
        let cli = Cli::try_parse_from([
            "otalink",
            "--format",
            "json",
            "serve",
            "127.0.0.1:0",
            "--auto-confirm",
            "--count",
            "2",
        ])
        .expect("serve args should parse");
        assert!(matches!(
            cli.command,
            Command::Serve(cmd::ServeArgs {
                auto_confirm: true,
                count: Some(2),
                ..
            })
        ));
    }
}
