use std::io::IsTerminal;

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use otalink_ota::{SessionSnapshot, TransferOutcome};
use serde::Serialize;

#[derive(Clone, Debug, Copy, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Table
        } else {
            Self::Json
        }
    }
}

/// Something a command prints as its result.
pub trait Report: Serialize {
    /// Field/value pairs for the table view.
    fn rows(&self) -> Vec<(&'static str, String)>;

    /// Single-line summary.
    fn pretty(&self) -> String {
        self.rows()
            .into_iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

pub fn print_report<R: Report>(report: &R, format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::to_string(report).unwrap_or_else(|_| "{}".to_string())
            );
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["FIELD", "VALUE"]);
            for (key, value) in report.rows() {
                table.add_row(vec![key.to_string(), value]);
            }
            println!("{table}");
        }
        OutputFormat::Pretty => println!("{}", report.pretty()),
    }
}

pub fn outcome_label(outcome: Option<&TransferOutcome>) -> String {
    match outcome {
        None => "in-progress".to_string(),
        Some(TransferOutcome::Done) => "done".to_string(),
        Some(TransferOutcome::Rejected(status)) => format!("rejected ({status})"),
        Some(TransferOutcome::RemoteAbort(status)) => format!("remote-abort ({status})"),
        Some(TransferOutcome::TimedOut { retries }) => format!("timed-out after {retries} retries"),
        Some(TransferOutcome::LocallyAborted) => "cancelled".to_string(),
        Some(TransferOutcome::Transport) => "transport-error".to_string(),
    }
}

impl Report for SessionSnapshot {
    fn rows(&self) -> Vec<(&'static str, String)> {
        vec![
            ("outcome", outcome_label(self.outcome.as_ref())),
            ("version", self.version.clone()),
            ("size", self.firmware_size.to_string()),
            ("sha256", self.sha256.clone()),
            ("chunk_size", self.chunk_size.to_string()),
            ("acked", format!("{}/{}", self.acked_offset, self.firmware_size)),
            ("retries", self.total_retries.to_string()),
            ("resyncs", self.resyncs.to_string()),
            ("elapsed_ms", self.elapsed_ms.to_string()),
        ]
    }

    fn pretty(&self) -> String {
        format!(
            "{} {} bytes ({}) in {} ms, {} retries",
            outcome_label(self.outcome.as_ref()),
            self.acked_offset,
            self.version,
            self.elapsed_ms,
            self.total_retries
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use otalink_ota::TransferStatus;

    #[test]
    fn outcome_labels() {
        assert_eq!(outcome_label(None), "in-progress");
        assert_eq!(
            outcome_label(Some(&TransferOutcome::TimedOut { retries: 3 })),
            "timed-out after 3 retries"
        );
        assert!(outcome_label(Some(&TransferOutcome::Rejected(TransferStatus::Busy)))
            .starts_with("rejected"));
    }

    #[derive(Serialize)]
    struct Pair {
        a: u32,
        b: &'static str,
    }

    impl Report for Pair {
        fn rows(&self) -> Vec<(&'static str, String)> {
            vec![("a", self.a.to_string()), ("b", self.b.to_string())]
        }
    }

    #[test]
    fn default_pretty_joins_rows() {
        assert_eq!(Pair { a: 1, b: "x" }.pretty(), "a=1 b=x");
    }
}
