//! CLI wrapper around the backup/restore engine.
//!
//! Wires the engine to its collaborators the way the host application
//! would: config.json plus environment for configuration, a Postgres-backed
//! record store when one is configured, an in-memory store otherwise.

use anyhow::{Context, Result};
use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use dbbackup::config::AppConfig;
use dbbackup::manager::BackupManager;
use dbbackup::persistence::{BackupRepo, MemoryRepo, OpKind, PgBackupRepo};
use dbbackup::records::{DumpOptions, OpStatus, RestoreOptions};

#[tokio::main]
async fn main() -> ExitCode {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    match run_app().await {
        Ok(()) => {
            println!("Operation completed successfully.");
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("Error: {err:?}");
            ExitCode::FAILURE
        }
    }
}

async fn run_app() -> Result<()> {
    let config_path = PathBuf::from("config.json");
    let app_config = AppConfig::load_from_json(&config_path).with_context(|| {
        format!(
            "Failed to load application configuration from {}",
            config_path.display()
        )
    })?;

    let metadata_url = app_config
        .metadata_database_url
        .clone()
        .or_else(|| env::var("DATABASE_URL").ok());

    let repo: Arc<dyn BackupRepo> = match metadata_url {
        Some(url) => Arc::new(
            PgBackupRepo::connect(&url, 5)
                .await
                .context("Failed to connect to the metadata database")?,
        ),
        None => {
            let memory = MemoryRepo::new();
            if let Some(con) = app_config.connection.clone() {
                memory.add_connection(con);
            }
            if let Some(cred) = app_config.credential.clone() {
                memory.add_credential(cred);
            }
            Arc::new(memory)
        }
    };

    let manager = Arc::new(BackupManager::new(repo, app_config.engine.clone()));
    let connection_id = app_config
        .connection
        .as_ref()
        .map(|c| c.id.clone())
        .unwrap_or_else(|| "default".to_string());
    let credential_id = app_config.credential.as_ref().map(|c| c.id.clone());

    let args: Vec<String> = env::args().collect();
    let choice = if args.len() > 1 {
        args[1].trim().to_string()
    } else {
        prompt_choice()?
    };

    match choice.as_str() {
        "1" | "backup" => {
            let backup_id = manager
                .pg_dump(
                    &connection_id,
                    credential_id.as_deref(),
                    DumpOptions::default(),
                    None,
                )
                .await
                .context("Backup preflight failed")?;
            println!("Backup started: {backup_id}");
            wait_for_outcome(&manager, &backup_id, OpKind::Dump).await?;
        }
        "2" | "restore" => {
            let backup_id = args
                .get(2)
                .cloned()
                .context("Usage: dbbackup restore <backup-id>")?;
            manager
                .pg_restore(&backup_id, None, RestoreOptions::default())
                .await
                .context("Restore preflight failed")?;
            println!("Restore started: {backup_id}");
            wait_for_outcome(&manager, &backup_id, OpKind::Restore).await?;
        }
        "3" | "delete" => {
            let backup_id = args
                .get(2)
                .cloned()
                .context("Usage: dbbackup delete <backup-id> [--force]")?;
            let force = args.iter().any(|a| a == "--force");
            manager.bkp_delete(&backup_id, force).await?;
            println!("Deleted {backup_id}");
        }
        "4" | "sweep" => {
            let report = manager.sweep().await?;
            println!(
                "Sweep done: {} streams evicted, {} orphans reconciled, {} backups pruned",
                report.evicted_streams, report.orphaned_records, report.pruned_backups
            );
        }
        _ => {
            println!("Invalid choice. Use backup, restore, delete or sweep.");
            anyhow::bail!("Invalid operation choice");
        }
    }
    Ok(())
}

/// Polls the record until the targeted side reaches a terminal status,
/// printing progress as it goes.
async fn wait_for_outcome(
    manager: &Arc<BackupManager>,
    backup_id: &str,
    op: OpKind,
) -> Result<()> {
    let repo = manager.repo();
    loop {
        tokio::time::sleep(Duration::from_millis(500)).await;
        let Some(rec) = repo.find_backup(backup_id).await? else {
            anyhow::bail!("record {backup_id} disappeared while waiting");
        };
        let status = match op {
            OpKind::Dump => Some(rec.status),
            OpKind::Restore => rec.restore_status,
        };
        match status {
            Some(OpStatus::Loading { loaded, total }) => {
                if total > 0 {
                    println!("  ... {loaded}/{total} bytes");
                } else {
                    println!("  ... {loaded} bytes");
                }
            }
            Some(OpStatus::Ok) => {
                if let Some(size) = rec.size_in_bytes {
                    println!("Done ({size} bytes).");
                } else {
                    println!("Done.");
                }
                return Ok(());
            }
            Some(OpStatus::Err(message)) => anyhow::bail!("operation failed: {message}"),
            None => {}
        }
    }
}

/// Prompts for the operation when none was given on the command line.
fn prompt_choice() -> Result<String> {
    use std::io::{stdin, stdout, Write};

    println!("Select an operation:");
    println!("1. Take Backup (or type 'backup')");
    println!("2. Restore Backup (or type 'restore')");
    println!("3. Delete Backup (or type 'delete')");
    println!("4. Run Cleanup Sweep (or type 'sweep')");
    print!("Enter your choice: ");
    stdout().flush().context("Failed to flush stdout")?;

    let mut input = String::new();
    stdin()
        .read_line(&mut input)
        .context("Failed to read user input")?;
    Ok(input.trim().to_string())
}
