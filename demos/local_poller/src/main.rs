use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use log::{info, warn};
use tokio_util::sync::CancellationToken;

use termlink::default_collections::{keys, linux};
use termlink::{CommandOutput, Manager, ManagerConfig, ManagerError, Result, Terminal};

/// Runs command strings on the local machine through `sh -c`.
struct LocalShell;

#[async_trait]
impl Terminal for LocalShell {
    async fn ping(&mut self) -> Result<()> {
        Ok(())
    }

    async fn connect(&mut self) -> Result<()> {
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        Ok(())
    }

    async fn execute(&mut self, string: &str, timeout: Duration) -> Result<CommandOutput> {
        let child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(string)
            .kill_on_drop(true)
            .output();

        let output = tokio::time::timeout(timeout, child)
            .await
            .map_err(|_| ManagerError::Timeout)?
            .map_err(|error| ManagerError::Execution(error.to_string()))?;

        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64();

        Ok(CommandOutput {
            command_string: string.to_string(),
            timestamp,
            stdout: String::from_utf8_lossy(&output.stdout)
                .lines()
                .map(str::to_string)
                .collect(),
            stderr: String::from_utf8_lossy(&output.stderr)
                .lines()
                .map(str::to_string)
                .collect(),
            code: output.status.code().unwrap_or(-1),
        })
    }
}

#[tokio::main]
async fn main() {
    env_logger::init_from_env(env_logger::Env::default().default_filter_or("info"));

    let config = ManagerConfig {
        name: "localhost".to_string(),
        ..ManagerConfig::default()
    };
    let manager = Manager::new(Box::new(LocalShell), config, Some(&linux()));

    if let Err(error) = manager.update().await {
        warn!("initial update failed: {}", error);
    }

    for key in [
        keys::sensor::HOSTNAME,
        keys::sensor::OS_NAME,
        keys::sensor::MACHINE_TYPE,
        keys::sensor::FREE_MEMORY,
        keys::sensor::CPU_LOAD,
    ] {
        match manager.sensor_value(key).await {
            Some(value) => info!("{} = {}", key, value),
            None => info!("{} = (no reading)", key),
        }
    }

    let cancel = CancellationToken::new();
    let monitor = {
        let manager = manager.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { manager.run(Duration::from_secs(30), cancel).await })
    };

    tokio::signal::ctrl_c().await.ok();
    info!("shutting down");
    cancel.cancel();

    match monitor.await {
        Ok(Ok(())) => {}
        Ok(Err(error)) => warn!("monitor loop failed: {}", error),
        Err(error) => warn!("monitor task panicked: {}", error),
    }
}
