use anyhow::{anyhow, Result};
use dotenv::dotenv;
use lanshare::networking::{
    FileTransferConfig, FileTransferManager, PathSource, StatusCallback, TransferStatus,
};
use lanshare::ShareConfig;
use log::{error, info};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    env_logger::init_from_env(env_logger::Env::default().default_filter_or("info"));

    let args: Vec<String> = std::env::args().collect();
    if args.len() != 4 {
        return Err(anyhow!("Usage: {} <host> <port> <file>", args[0]));
    }
    let host = args[1].clone();
    let port: u16 = args[2]
        .parse()
        .map_err(|_| anyhow!("Invalid port: {}", args[2]))?;
    let path = args[3].clone();

    let succeeded = Arc::new(AtomicBool::new(false));
    let flag = succeeded.clone();
    let callback: StatusCallback = Arc::new(move |status: TransferStatus| match status {
        TransferStatus::Progress { percent, .. } => {
            if percent % 10 == 0 {
                info!("📊 {}%", percent);
            }
        }
        TransferStatus::Success { file_name, bytes, .. } => {
            info!("✅ Sent {} ({} bytes)", file_name, bytes);
            flag.store(true, Ordering::SeqCst);
        }
        TransferStatus::Error { message, .. } => error!("❌ {}", message),
    });

    let config = FileTransferConfig::from_share_config(&ShareConfig::from_env(), Some(callback));
    let manager = FileTransferManager::new(config);

    info!("Sending {} to {}:{}", path, host, port);
    manager.send_file(host, port, PathSource::new(path)).wait().await;

    if succeeded.load(Ordering::SeqCst) {
        Ok(())
    } else {
        Err(anyhow!("Transfer failed"))
    }
}
