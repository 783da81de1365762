use std::sync::mpsc;
use std::thread;

use otalink_ota::{CancelHandle, ChunkPolicy, Orchestrator, TransferConfig, TransferEvent};
use otalink_transport::TcpTransport;
use tracing::info;

use crate::cmd::{parse_duration, FlashArgs};
use crate::exit::{io_error, ota_error, transport_error, CliError, CliResult, INTERNAL, SUCCESS};
use crate::output::{print_report, OutputFormat};

pub fn run(args: FlashArgs, format: OutputFormat) -> CliResult<i32> {
    let config = transfer_config(&args)?;
    let image = std::fs::read(&args.firmware).map_err(|err| {
        io_error(&format!("failed reading {}", args.firmware.display()), err)
    })?;

    let transport =
        TcpTransport::connect(&args.addr).map_err(|err| transport_error("connect failed", err))?;
    info!(device = %transport.peer_addr(), size = image.len(), "connected");

    let cancel = CancelHandle::new();
    install_ctrlc_handler(cancel.clone())?;

    let mut orch = Orchestrator::with_config(transport, config).with_cancel(cancel);
    let progress = if args.progress {
        let (tx, rx) = mpsc::channel();
        orch = orch.with_events(tx);
        Some(thread::spawn(move || report_progress(rx)))
    } else {
        None
    };

    let result = orch.run(&image, &args.version);
    let snapshot = orch.snapshot();
    // Closes the event channel so the progress thread ends.
    drop(orch);
    if let Some(handle) = progress {
        let _ = handle.join();
    }

    print_report(&snapshot, format);
    result
        .map(|_| SUCCESS)
        .map_err(|err| ota_error("transfer failed", err))
}

fn transfer_config(args: &FlashArgs) -> CliResult<TransferConfig> {
    let policy = match (args.chunk_size, args.mtu) {
        (_, Some(mtu)) => ChunkPolicy::mtu(mtu),
        (Some(size), None) => ChunkPolicy::Fixed(size),
        (None, None) => ChunkPolicy::default(),
    };
    Ok(TransferConfig::default()
        .with_chunk_policy(policy)
        .with_message_timeout(parse_duration(&args.timeout)?)
        .with_end_timeout(parse_duration(&args.end_timeout)?)
        .with_max_retries(args.retries))
}

fn report_progress(rx: mpsc::Receiver<TransferEvent>) {
    let mut last_pct = None;
    for event in rx {
        match event {
            TransferEvent::ChunkAcked {
                acked_offset,
                firmware_size,
            } => {
                let pct = u64::from(acked_offset) * 100 / u64::from(firmware_size.max(1));
                // One line per 10%.
                if last_pct.map_or(true, |last| pct / 10 > last / 10) {
                    eprintln!("progress: {pct}% ({acked_offset}/{firmware_size})");
                    last_pct = Some(pct);
                }
            }
            TransferEvent::Resynced { from, to } => eprintln!("progress: resync {from} -> {to}"),
            TransferEvent::Retrying { msg_type, attempt } => {
                eprintln!("progress: retry {attempt} of {msg_type}")
            }
            TransferEvent::Verifying => eprintln!("progress: verifying"),
            TransferEvent::Started { .. } | TransferEvent::Finished { .. } => {}
        }
    }
}

fn install_ctrlc_handler(cancel: CancelHandle) -> CliResult<()> {
    ctrlc::set_handler(move || cancel.cancel())
        .map_err(|err| CliError::new(INTERNAL, format!("signal handler setup failed: {err}")))
}
