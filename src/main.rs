use anyhow::Result;
use dotenv::dotenv;
use lanshare::networking::{
    DiscoveryEvent, FileTransferConfig, FileTransferManager, PathSource, PeerDiscovery, PeerRecord,
    StatusCallback, TransferStatus,
};
use lanshare::ShareConfig;
use log::{error, info, warn};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, BufReader};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if it exists
    dotenv().ok();

    // Initialize logging
    env_logger::init_from_env(env_logger::Env::default().default_filter_or("info"));

    let config = ShareConfig::from_env();
    info!(
        "Starting LAN share as '{}' on port {} (receiving into {})",
        config.device_name,
        config.port,
        config.receive_dir.display()
    );

    // Transfer server first, so the advertised port is live
    let status_callback: StatusCallback = Arc::new(report_transfer);
    let transfer_config = FileTransferConfig::from_share_config(&config, Some(status_callback));
    let mut file_manager = FileTransferManager::new(transfer_config);
    let server_addr = file_manager.start_server().await?;

    // Peers as the UI would show them
    let peers = Arc::new(Mutex::new(Vec::<PeerRecord>::new()));
    let peers_sink = peers.clone();
    let discovery = Arc::new(PeerDiscovery::new(
        &config,
        Arc::new(move |event: DiscoveryEvent| track_peer(&peers_sink, event)),
    )?);

    discovery.advertise(server_addr.port());
    discovery.start_browsing();

    let signal_discovery = discovery.clone();
    ctrlc::set_handler(move || {
        signal_discovery.tear_down();
        std::process::exit(0);
    })?;

    print_help();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let parts: Vec<&str> = line.split_whitespace().collect();
        let Some(command) = parts.first().map(|c| c.to_lowercase()) else {
            continue;
        };

        match command.as_str() {
            "help" | "h" => print_help(),
            "list" | "ls" => {
                let peers = peers.lock().unwrap_or_else(|e| e.into_inner());
                if peers.is_empty() {
                    info!("No peers discovered yet");
                } else {
                    info!("Discovered peers:");
                    for (i, peer) in peers.iter().enumerate() {
                        info!("  {}. {} ({})", i + 1, peer.name, peer.address());
                    }
                }
            }
            "send" => {
                if parts.len() < 3 {
                    error!("Usage: send <peer number> <file path>");
                    continue;
                }

                let target = parts[1]
                    .parse::<usize>()
                    .ok()
                    .and_then(|n| n.checked_sub(1))
                    .and_then(|idx| {
                        let peers = peers.lock().unwrap_or_else(|e| e.into_inner());
                        peers.get(idx).cloned()
                    });

                match target {
                    Some(peer) => {
                        let path = parts[2..].join(" ");
                        info!("Sending {} to {} ({})", path, peer.name, peer.address());
                        let task = file_manager.send_file(
                            peer.host.clone(),
                            peer.port,
                            PathSource::new(path),
                        );
                        info!("Transfer queued with ID: {}", task.transfer_id);
                    }
                    None => error!("No peer numbered {}; use 'list'", parts[1]),
                }
            }
            "status" => {
                match file_manager.server_address().await {
                    Some(addr) => info!("File transfer server is running on {}", addr),
                    None => warn!("File transfer server is not running"),
                }
                info!("Receive directory: {}", file_manager.receive_directory().display());
                info!("Advertised as: {}", discovery.advertised_names().join(", "));
            }
            "exit" | "quit" | "q" => break,
            _ => {
                error!("Unknown command: {}", command);
                print_help();
            }
        }
    }

    info!("Shutting down...");
    discovery.tear_down();
    file_manager.stop_server().await;
    Ok(())
}

fn print_help() {
    info!("Available commands:");
    info!("  help, h               - Show this help");
    info!("  list, ls              - List discovered peers");
    info!("  send <n> <file>       - Send a file to peer number n");
    info!("  status                - Show server and advertisement status");
    info!("  exit, quit, q         - Exit the application");
}

/// Keep the peer list the way a device list view would
fn track_peer(peers: &Mutex<Vec<PeerRecord>>, event: DiscoveryEvent) {
    let mut peers = peers.lock().unwrap_or_else(|e| e.into_inner());
    match event {
        DiscoveryEvent::PeerFound(peer) => {
            if !peers.contains(&peer) {
                peers.push(peer);
            }
        }
        DiscoveryEvent::PeerLost { name } => peers.retain(|p| p.name != name),
        DiscoveryEvent::RegistrationFailed { name, message } => {
            warn!("Could not advertise {}: {}", name, message);
        }
    }
}

fn report_transfer(status: TransferStatus) {
    match status {
        TransferStatus::Progress { direction, percent, .. } => {
            // Only log every 10% to avoid log spam
            if percent % 10 == 0 {
                info!("📊 {:?} progress: {}%", direction, percent);
            }
        }
        TransferStatus::Success { direction, file_name, bytes, .. } => {
            info!("✅ {:?} complete: {} ({} bytes)", direction, file_name, bytes);
        }
        TransferStatus::Error { direction, message, .. } => {
            error!("❌ {:?} failed: {}", direction, message);
        }
    }
}
