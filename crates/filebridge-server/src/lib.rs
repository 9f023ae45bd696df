//! Filebridge server library
//!
//! Loads configuration, builds the backend set, and serves the bridge as
//! JSON lines over any async byte stream (stdio in the binary).

pub mod config;
pub mod rpc;

pub use config::ServerConfig;
pub use rpc::{Request, dispatch, handle_line, serve};

use anyhow::Result;
use filebridge_kernel::{BridgeHandle, spawn_bridge};

/// Build the backend, spawn the bridge, and register configured prefixes.
pub async fn start(config: &ServerConfig) -> Result<BridgeHandle> {
    let backend = config.build_backend()?;
    let bridge = spawn_bridge(backend, config.bridge.clone());
    for prefix in &config.prefix {
        bridge
            .register_prefix(&prefix.subdir, &prefix.target, prefix.read_only)
            .await?;
    }
    tracing::info!(
        prefixes = config.prefix.len(),
        volumes = config.volume.len(),
        mounts = config.mount.len(),
        "bridge started"
    );
    Ok(bridge)
}
