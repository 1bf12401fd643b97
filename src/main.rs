use anyhow::Result;
use atelier::cli::{Cli, Commands};
use atelier::config::{AtelierConfig, default_recovery_dir};
use atelier::interpreter::{RemoteContext, ResultCode};
use atelier::process::ProcessManager;
use atelier::recovery::{RecoveryStorage, SqliteRecoveryStorage, create_recovery_storage};
use clap::Parser;
use std::collections::HashMap;
use std::sync::Arc;

fn main() -> Result<()> {
    // Logs go to stderr; stdout carries command output
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("atelier=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let runtime = tokio::runtime::Runtime::new()?;

    match cli.command {
        Commands::Interpreter {
            event_host,
            event_port,
            group_id,
            host,
            port,
        } => {
            let controller = match (event_host, event_port) {
                (Some(h), Some(p)) => Some((h, p)),
                (None, None) => None,
                _ => anyhow::bail!("--event-host and --event-port must be given together"),
            };
            runtime.block_on(atelier::server::run_interpreter_process(
                &group_id, &host, port, controller,
            ))?;
        }

        Commands::Run {
            script,
            group,
            class,
            note,
            keep,
        } => {
            let group_id = group.unwrap_or_else(|| {
                let suffix: String = (0..4)
                    .map(|_| format!("{:x}", rand::random::<u8>() % 16))
                    .collect();
                format!("{}-{}", class, suffix)
            });

            let code = runtime.block_on(async {
                let config = AtelierConfig::default();
                let storage = create_recovery_storage(&config)?;
                let manager = ProcessManager::new(config, storage, None);
                manager.start(0).await?;

                let restored = manager.restore().await;
                if !restored.is_empty() {
                    eprintln!("Restored: {}", restored.join(", "));
                }

                let paragraph = format!("paragraph-{}", chrono::Utc::now().timestamp_millis());
                let outcome = manager
                    .interpret(
                        &group_id,
                        &note,
                        &class,
                        HashMap::new(),
                        "anonymous",
                        &script,
                        RemoteContext::new(&note, &paragraph),
                    )
                    .await;

                manager.shutdown(!keep).await;
                let result = outcome?;
                print!("{}", result.text());
                if !result.text().ends_with('\n') {
                    println!();
                }
                if keep {
                    eprintln!("Process group '{}' left running", group_id);
                }
                anyhow::Ok(result.code)
            })?;

            if code == ResultCode::Error {
                std::process::exit(1);
            }
        }

        Commands::Registrations { dir } => {
            let dir = dir.unwrap_or_else(default_recovery_dir);
            let storage = SqliteRecoveryStorage::open(&dir)?;
            let registrations = storage.load_all()?;

            if registrations.is_empty() {
                println!("No recorded interpreter processes");
            } else {
                println!("Recorded interpreter processes ({}):", storage.db_path().display());
                for registration in &registrations {
                    println!(
                        "  {} → {} (last busy {})",
                        registration.group_id,
                        registration.endpoint(),
                        registration.last_busy_at.format("%Y-%m-%d %H:%M:%S")
                    );
                }
            }
        }

        Commands::Cleanup { dir } => {
            let mut config = AtelierConfig::default();
            if let Some(dir) = dir {
                config.recovery_dir = dir;
            }
            let storage: Arc<dyn RecoveryStorage> = Arc::new(SqliteRecoveryStorage::open(&config.recovery_dir)?);

            runtime.block_on(async {
                let manager = ProcessManager::new(config, storage, None);
                manager.start(0).await?;
                let restored = manager.restore().await;
                manager.shutdown(true).await;
                if restored.is_empty() {
                    println!("Nothing to clean up");
                } else {
                    println!("Stopped: {}", restored.join(", "));
                }
                anyhow::Ok(())
            })?;
        }
    }

    Ok(())
}
