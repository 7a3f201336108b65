//! Show the persisted state of an account.

use anyhow::{Context, Result};
use std::path::Path;
use zerok_trust_engine::{SqliteStore, StateStore};
use zerok_trust_types::AccountId;

/// Run the status command.
pub async fn run(database: &Path, account: Option<&str>, json: bool) -> Result<()> {
    if !database.exists() {
        anyhow::bail!("No database at {}", database.display());
    }
    let store = SqliteStore::new(database)
        .await
        .with_context(|| format!("Failed to open {}", database.display()))?;

    let Some(account) = account else {
        let accounts = store.list_accounts().await?;
        if accounts.is_empty() {
            println!("No accounts stored in {}", database.display());
        }
        for account in accounts {
            println!("{}", account);
        }
        return Ok(());
    };

    let account = AccountId::new(account);
    let state = store
        .load(&account)
        .await?
        .with_context(|| format!("No state stored for account {}", account))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&state.status)?);
        return Ok(());
    }

    println!("=== trust-cli status ===");
    println!();
    println!("Account: {}", account);
    println!("Device:  {}", state.local_peer.id());
    if let Some(name) = state.local_peer.description().get("name") {
        println!("Name:    {}", name);
    }
    println!("Status:  {}", state.status.summary());
    println!("State:   {:?}", state.machine.current);
    println!("Cursor:  {}", state.cursor);
    println!();

    match &state.circle {
        Some(circle) => {
            println!("Circle {} (generation {}):", circle.name(), circle.generation());
            for (id, info) in circle.peers() {
                let name = info.description().get("name").map_or("?", String::as_str);
                let marker = if *id == state.local_peer.id() { " (this device)" } else { "" };
                println!("  member    {} {}{}", id, name, marker);
            }
            for id in circle.applicants().keys() {
                println!("  applicant {}", id);
            }
            for id in circle.retired().keys() {
                println!("  retired   {}", id);
            }
        }
        None => println!("Circle: none"),
    }
    println!();

    println!("Key sets:");
    for view in state.keys.views() {
        for key_set in state.keys.key_sets(view) {
            let marker = if key_set.is_current() { " (current)" } else { "" };
            println!(
                "  {} epoch {} {}{}",
                view,
                key_set.epoch(),
                key_set.uuid(),
                marker
            );
        }
    }

    let history = store.circle_history(&account).await?;
    if !history.is_empty() {
        println!();
        println!("Circle history: {} snapshot(s)", history.len());
    }
    if !state.work.outbox.is_empty() {
        println!("Outbox: {} blob(s) waiting", state.work.outbox.len());
    }

    Ok(())
}
