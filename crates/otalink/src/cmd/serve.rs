use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::time::Duration;

use otalink_ota::{
    AbortOrigin, FirmwareVersion, FlashError, FlashSlots, Installed, Installer, InstallerConfig,
    MemoryFlash, Receiver, ReceiverConfig, ReceiverEvent, SlotId, StopHandle, TransferStatus,
};
use otalink_transport::TcpServer;
use serde::Serialize;
use tracing::{info, warn};

use crate::cmd::{parse_duration, ServeArgs};
use crate::exit::{transport_error, CliError, CliResult, ABORTED, INTERNAL, SUCCESS, USAGE};
use crate::output::{print_report, OutputFormat, Report};

/// What happened on one accepted connection.
#[derive(Debug, Default, Serialize)]
struct ConnectionReport {
    connection: usize,
    peer: String,
    /// `installed`, `failed`, `aborted` or `no-session`.
    outcome: &'static str,
    sessions: u32,
    status: Option<TransferStatus>,
    abort_origin: Option<AbortOrigin>,
    installed: Option<Installed>,
    boot_slot: Option<SlotId>,
    confirmed: bool,
    frame_errors: u64,
    error: Option<String>,
}

impl ConnectionReport {
    fn new(connection: usize, peer: SocketAddr) -> Self {
        Self {
            connection,
            peer: peer.to_string(),
            outcome: "no-session",
            ..Self::default()
        }
    }

    fn record(&mut self, event: ReceiverEvent) {
        match event {
            ReceiverEvent::SessionStarted { .. } => self.sessions += 1,
            ReceiverEvent::RebootRequested(installed) => {
                self.outcome = "installed";
                self.status = Some(TransferStatus::Ok);
                self.installed = Some(installed);
            }
            ReceiverEvent::SessionFailed { status } => {
                self.outcome = "failed";
                self.status = Some(status);
            }
            ReceiverEvent::SessionAborted { reason, origin } => {
                self.outcome = "aborted";
                self.status = Some(reason);
                self.abort_origin = Some(origin);
            }
        }
    }
}

impl Report for ConnectionReport {
    fn rows(&self) -> Vec<(&'static str, String)> {
        let mut rows = vec![
            ("connection", self.connection.to_string()),
            ("peer", self.peer.clone()),
            ("outcome", self.outcome.to_string()),
            ("sessions", self.sessions.to_string()),
        ];
        if let Some(status) = self.status {
            rows.push(("status", status.to_string()));
        }
        if let Some(installed) = &self.installed {
            rows.push(("slot", installed.slot.to_string()));
            rows.push(("size", installed.firmware_size.to_string()));
            rows.push(("version", installed.version.clone()));
        }
        if let Some(slot) = self.boot_slot {
            rows.push(("boot_slot", slot.to_string()));
            rows.push(("confirmed", self.confirmed.to_string()));
        }
        rows.push(("frame_errors", self.frame_errors.to_string()));
        if let Some(error) = &self.error {
            rows.push(("error", error.clone()));
        }
        rows
    }
}

pub fn run(args: ServeArgs, format: OutputFormat) -> CliResult<i32> {
    let receiver_config = receiver_config(&args)?;
    let installer_config = installer_config(&args)?;

    let server = TcpServer::bind(&args.addr).map_err(|err| transport_error("bind failed", err))?;
    let stop = StopHandle::new();
    let in_session = Arc::new(AtomicBool::new(false));
    install_ctrlc_handler(stop.clone(), in_session.clone())?;

    let mut installer =
        Installer::with_config(MemoryFlash::new(args.slot_size), installer_config);
    let mut served = 0usize;

    while !stop.is_requested() {
        if args.count.is_some_and(|count| served >= count) {
            return Ok(SUCCESS);
        }
        let transport = server
            .accept()
            .map_err(|err| transport_error("accept failed", err))?;
        served += 1;
        in_session.store(true, Ordering::SeqCst);
        let mut report = ConnectionReport::new(served, transport.peer_addr());

        let (tx, events) = mpsc::channel();
        let mut receiver = Receiver::new(transport, installer)
            .with_config(receiver_config.clone())
            .with_events(tx)
            .with_stop(stop.clone());
        if let Err(err) = receiver.run() {
            warn!(%err, "connection ended with an error");
            report.error = Some(err.to_string());
        }
        report.frame_errors = receiver.frame_errors();
        installer = receiver.into_parts().1;
        in_session.store(false, Ordering::SeqCst);

        for event in events.try_iter() {
            report.record(event);
        }
        if args.auto_confirm && report.installed.is_some() {
            let boot = reboot_and_confirm(installer.flash_mut())?;
            report.boot_slot = Some(boot);
            report.confirmed = true;
        }
        print_report(&report, format);
    }

    Ok(ABORTED)
}

fn receiver_config(args: &ServeArgs) -> CliResult<ReceiverConfig> {
    let chunk_pause = match &args.chunk_pause {
        Some(pause) => parse_duration(pause)?,
        None => Duration::ZERO,
    };
    Ok(ReceiverConfig::default()
        .with_idle_timeout(parse_duration(&args.idle_timeout)?)
        .with_chunk_pause(chunk_pause))
}

fn installer_config(args: &ServeArgs) -> CliResult<InstallerConfig> {
    let mut config = InstallerConfig::default();
    if let Some(version) = &args.current_version {
        let version: FirmwareVersion = version
            .parse()
            .map_err(|err| CliError::new(USAGE, format!("--current-version: {err}")))?;
        config = config
            .with_current_version(version)
            .with_allow_downgrade(false);
    }
    Ok(config)
}

/// Boot the freshly installed image and accept it, as a passing self-test would.
fn reboot_and_confirm<F: FlashSlots>(flash: &mut F) -> CliResult<SlotId> {
    let flash_err =
        |err: FlashError| CliError::new(INTERNAL, format!("emulated boot failed: {err}"));
    let booted = flash.reboot().map_err(flash_err)?;
    let confirmed = flash.confirm().map_err(flash_err)?;
    info!(%booted, %confirmed, "trial boot confirmed");
    Ok(confirmed)
}

fn install_ctrlc_handler(stop: StopHandle, in_session: Arc<AtomicBool>) -> CliResult<()> {
    ctrlc::set_handler(move || {
        stop.request();
        // Blocked in accept; nothing to unwind.
        if !in_session.load(Ordering::SeqCst) {
            std::process::exit(ABORTED);
        }
    })
    .map_err(|err| CliError::new(INTERNAL, format!("signal handler setup failed: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use otalink_ota::BootState;

    fn args() -> ServeArgs {
        ServeArgs {
            addr: "127.0.0.1:0".into(),
            slot_size: 4096,
            auto_confirm: false,
            count: None,
            idle_timeout: "30s".into(),
            chunk_pause: None,
            current_version: None,
        }
    }

    #[test]
    fn report_tracks_last_outcome() {
        let mut report = ConnectionReport::new(1, "127.0.0.1:9".parse().unwrap());
        assert_eq!(report.outcome, "no-session");

        report.record(ReceiverEvent::SessionStarted {
            generation: 1,
            slot: SlotId::B,
            firmware_size: 10,
            version: "v1".into(),
        });
        report.record(ReceiverEvent::SessionAborted {
            reason: TransferStatus::Aborted,
            origin: AbortOrigin::Remote,
        });
        assert_eq!(report.outcome, "aborted");
        assert_eq!(report.abort_origin, Some(AbortOrigin::Remote));

        report.record(ReceiverEvent::RebootRequested(Installed {
            generation: 2,
            slot: SlotId::B,
            firmware_size: 10,
            version: "v1".into(),
        }));
        assert_eq!(report.outcome, "installed");
        assert_eq!(report.sessions, 1);
        assert!(report.rows().iter().any(|(key, value)| *key == "slot" && value == "B"));
    }

    #[test]
    fn reboot_and_confirm_promotes_installed_slot() {
        let mut flash = MemoryFlash::new(64);
        flash.begin_write(SlotId::B).unwrap();
        flash.write(SlotId::B, 0, b"image").unwrap();
        flash.mark_pending_verify(SlotId::B).unwrap();

        assert_eq!(reboot_and_confirm(&mut flash).unwrap(), SlotId::B);
        assert_eq!(flash.active_slot(), SlotId::B);
        assert_eq!(flash.slot_state(SlotId::B), BootState::Confirmed);
    }

    #[test]
    fn flag_parsing() {
        let config = receiver_config(&ServeArgs {
            chunk_pause: Some("5ms".into()),
            ..args()
        })
        .unwrap();
        assert_eq!(config.chunk_pause, Duration::from_millis(5));

        let err = installer_config(&ServeArgs {
            current_version: Some("not-a-version".into()),
            ..args()
        })
        .unwrap_err();
        assert_eq!(err.code, USAGE);
    }
}
