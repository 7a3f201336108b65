//! Form a circle of several devices over an in-memory relay.

use anyhow::{bail, Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use zerok_trust_core::{LocalIdentity, MachineList};
use zerok_trust_engine::{
    AccountEngine, EngineConfig, MemoryStore, MockTransport, SqliteStore, StateStore,
};
use zerok_trust_types::{AccountId, ViewName};

/// Fetch rounds after each step, enough for countersignatures and shares
/// to reach every device.
const SYNC_ROUNDS: usize = 3;

/// Options for the simulate command.
#[derive(Debug)]
pub struct Options {
    pub devices: usize,
    pub config: Option<PathBuf>,
    pub account: String,
    pub database: Option<PathBuf>,
    pub rotate: Option<String>,
}

/// Run the simulate command.
pub async fn run(options: Options) -> Result<()> {
    if options.devices == 0 {
        bail!("--devices must be at least 1");
    }
    let config = match &options.config {
        Some(path) => EngineConfig::from_file(path)
            .with_context(|| format!("Failed to load {}", path.display()))?,
        None => EngineConfig::default(),
    };
    let account = AccountId::new(options.account.as_str());
    let relay = MockTransport::new();

    println!("=== trust-cli simulate ===");
    println!();

    let mut engines = Vec::with_capacity(options.devices);
    for index in 0..options.devices {
        let store: Arc<dyn StateStore> = match (&options.database, index) {
            (Some(path), 0) => Arc::new(
                SqliteStore::new(path)
                    .await
                    .with_context(|| format!("Failed to open {}", path.display()))?,
            ),
            _ => Arc::new(MemoryStore::new()),
        };
        let mut device_config = config.clone();
        device_config.account.device_name = format!("device-{}", index);

        let engine = AccountEngine::spawn(
            account.clone(),
            device_config,
            LocalIdentity::generate()?,
            MachineList::unrestricted(),
            relay.clone(),
            store,
        )
        .await
        .with_context(|| format!("Failed to start device {}", index))?;
        engine.settle().await?;
        engines.push(engine);
    }

    let founder = &engines[0];
    founder.join().await?;
    let status = founder.settle().await?;
    println!("device-0 joined: {}", status.summary());

    for (index, engine) in engines.iter().enumerate().skip(1) {
        engine.join().await?;
        let status = engine.settle().await?;
        println!("device-{} joined: {}", index, status.summary());

        founder.fetch().await?;
        founder.settle().await?;
        founder.accept(engine.local_peer()).await?;
        founder.settle().await?;
        println!("device-0 accepted device-{}", index);
        sync(&engines).await?;
    }
    sync(&engines).await?;

    if let Some(view) = &options.rotate {
        founder.rotate(ViewName::new(view.as_str())).await?;
        founder.settle().await?;
        println!("device-0 rotated {}", view);
        sync(&engines).await?;
    }

    println!();
    let views = config.account.view_names();
    for (index, engine) in engines.iter().enumerate() {
        let status = engine.status();
        println!("device-{} ({})", index, engine.local_peer());
        println!("  Status: {}", status.summary());
        for view in &views {
            match engine.current_key_set(view) {
                Some(key_set) => println!(
                    "  {}: key set {} (epoch {})",
                    view,
                    key_set.uuid(),
                    key_set.epoch()
                ),
                None => println!("  {}: no key set", view),
            }
        }
    }
    println!();
    println!("Relay: {} blob(s)", relay.items().len());

    for engine in &engines {
        engine.shutdown().await?;
    }
    if let Some(path) = &options.database {
        println!("device-0 state saved to {}", path.display());
    }
    Ok(())
}

async fn sync(engines: &[AccountEngine]) -> Result<()> {
    for _ in 0..SYNC_ROUNDS {
        for engine in engines {
            engine.fetch().await?;
            engine.settle().await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn simulation_persists_founder() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trust.db");

        run(Options {
            devices: 3,
            config: None,
            account: "alice".into(),
            database: Some(path.clone()),
            rotate: Some("passwords".into()),
        })
        .await
        .unwrap();

        let store = SqliteStore::new(&path).await.unwrap();
        let state = store
            .load(&AccountId::new("alice"))
            .await
            .unwrap()
            .unwrap();
        let circle = state.circle.unwrap();
        assert_eq!(circle.peers().len(), 3);
        let passwords = state.keys.current_key_set(&ViewName::new("passwords")).unwrap();
        assert_eq!(passwords.epoch(), 2);

        crate::commands::status::run(&path, Some("alice"), false)
            .await
            .unwrap();
        crate::commands::status::run(&path, None, true).await.unwrap();
    }

    #[tokio::test]
    async fn zero_devices_is_refused() {
        let result = run(Options {
            devices: 0,
            config: None,
            account: "alice".into(),
            database: None,
            rotate: None,
        })
        .await;
        assert!(result.is_err());
    }
}
