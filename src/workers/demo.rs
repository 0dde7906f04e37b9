//! Demo worker: a host and N guests on the loopback network.
//!
//! Joins every guest to the host's room, broadcasts a text, fans a file out
//! and prints progress until the job settles. Failure isolation and
//! cancellation can be exercised with `--drop-peer` and `--cancel-after`.

use anyhow::{bail, Context};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

use peerdrop::core::config::Settings;
use peerdrop::core::connection::LoopbackNetwork;
use peerdrop::core::events::RoomEvent;
use peerdrop::core::room::RoomCoordinator;
use peerdrop::core::transfer::{OutgoingFile, TransferDirection, TransferStatus};
use peerdrop::utils::sos::SignalOfStop;

use crate::workers::args::DemoArgs;

pub async fn run(args: DemoArgs, settings: Settings, sos: SignalOfStop) -> anyhow::Result<()> {
    tokio::select! {
        result = run_demo(args, settings) => result,
        _ = sos.wait() => {
            warn!(event = "demo_interrupted", "Interrupted");
            Ok(())
        }
    }
}

async fn run_demo(args: DemoArgs, settings: Settings) -> anyhow::Result<()> {
    if args.peers == 0 {
        bail!("the demo needs at least one guest");
    }
    if let Some(i) = args.drop_peer {
        if i >= args.peers {
            bail!("--drop-peer {i} is out of range for {} guests", args.peers);
        }
    }

    let net = LoopbackNetwork::new();
    let (host, host_events) = RoomCoordinator::new(Arc::new(net.transport("host")), settings.clone());
    tokio::spawn(print_events("host".to_string(), host_events, None));

    let code = host.create_room().await?;
    println!("room {code} open");

    let mut guests = Vec::with_capacity(args.peers);
    for i in 0..args.peers {
        let name = format!("guest-{i}");
        let (guest, events) = RoomCoordinator::new(Arc::new(net.transport(&name)), settings.clone());
        guest
            .join_room(&code)
            .await
            .with_context(|| format!("{name} could not join"))?;
        let guest = Arc::new(guest);
        let dropper = (args.drop_peer == Some(i)).then(|| guest.clone());
        tokio::spawn(print_events(name, events, dropper));
        guests.push(guest);
    }

    host.send_text(args.text.clone()).await?;

    let file = match &args.file {
        Some(path) => OutgoingFile::from_path(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?,
        None => OutgoingFile::from_bytes(
            "demo.bin",
            (0..args.size).map(|i| (i % 251) as u8).collect::<Vec<u8>>(),
        ),
    };
    let job = host.send_file(file).await?;
    let item_id = job.item_id();
    info!(event = "demo_send", %item_id, peers = job.peers().len(), "File job started");

    let cancel = args.cancel_after.map(|ms| {
        let host = &host;
        async move {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            if let Err(e) = host.cancel_transfer(item_id).await {
                warn!(event = "demo_cancel_failed", error = %e, "Cancel failed");
            }
        }
    });

    let mut progress = job.progress();
    let watch_progress = async {
        while progress.changed().await.is_ok() {
            let record = progress.borrow_and_update().clone();
            let size = record.size().max(1);
            println!(
                "  {:>5.1}%  {:>9.1} KiB/s  eta {:?}  [{}]",
                record.transferred as f64 * 100.0 / size as f64,
                record.speed_bps / 1024.0,
                record.eta.unwrap_or_default(),
                record
                    .deliveries
                    .iter()
                    .map(|d| format!("{}:{:?}", d.peer_id, d.status))
                    .collect::<Vec<_>>()
                    .join(" ")
            );
        }
    };

    let outcome = match cancel {
        Some(cancel) => {
            let (outcome, _, _) = tokio::join!(job.wait(), watch_progress, cancel);
            outcome?
        }
        None => {
            let (outcome, _) = tokio::join!(job.wait(), watch_progress);
            outcome?
        }
    };

    println!("file job {item_id}: {:?}", outcome.status);
    for d in &outcome.deliveries {
        println!("  {:<10} {:?} at {} bytes", d.peer_id, d.status, d.offset);
    }

    // Let receivers publish their final records before the room goes away.
    tokio::time::sleep(Duration::from_millis(200)).await;
    host.leave_room().await?;
    tokio::time::sleep(Duration::from_millis(100)).await;
    Ok(())
}

async fn print_events(
    name: String,
    mut events: mpsc::UnboundedReceiver<RoomEvent>,
    drop_on_file: Option<Arc<RoomCoordinator>>,
) {
    let mut dropper = drop_on_file;
    while let Some(event) = events.recv().await {
        match event {
            RoomEvent::Status(status) => println!("[{name}] status: {status}"),
            RoomEvent::PeerJoined { peer_id } => println!("[{name}] peer ready: {peer_id}"),
            RoomEvent::PeerLeft { peer_id, error } => match error {
                Some(e) => println!("[{name}] peer lost: {peer_id} ({e})"),
                None => println!("[{name}] peer left: {peer_id}"),
            },
            RoomEvent::JoinAnnounced { via } => println!("[{name}] someone joined (via {via})"),
            RoomEvent::TextReceived { peer_id, text, .. } => {
                println!("[{name}] text from {peer_id}: {text}")
            }
            RoomEvent::Transfer(record) if record.direction == TransferDirection::Inbound => {
                if record.text().is_some() {
                    continue;
                }
                if let Some(room) = dropper.take() {
                    println!("[{name}] dropping out mid-transfer");
                    if let Err(e) = room.leave_room().await {
                        warn!(event = "demo_drop_failed", error = %e, "Could not leave");
                    }
                    continue;
                }
                if record.status == TransferStatus::Completed {
                    println!(
                        "[{name}] received {} bytes",
                        record.file_data().map_or(0, |d| d.len())
                    );
                } else if record.status.is_terminal() {
                    println!("[{name}] file {:?}", record.status);
                }
            }
            RoomEvent::Transfer(_) | RoomEvent::Quality(_) => {}
        }
    }
}
