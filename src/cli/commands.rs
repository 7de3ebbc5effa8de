// Keyfed — CLI Command Handlers
//
// Each function handles one CLI subcommand. Import commands build the full
// engine (store, HTTP fetcher, scheduler, coordinator); partner management
// commands only touch the registry.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{DateTime, Utc};
use ed25519_dalek::VerifyingKey;

use crate::clock::SystemClock;
use crate::config::Settings;
use crate::error::{KeyfedError, Result};
use crate::federation::{Coordinator, HttpBatchSource, PartnerResult, Scheduler};
use crate::store::{Database, KeyStore, NewPartner, PartnerKey, PartnerRegistry, SqliteStore};

use super::{Cli, Commands, PartnerCommands};

/// Execute the parsed CLI command.
pub async fn execute(cli: Cli) -> Result<()> {
    let settings = cli.settings;
    match cli.command {
        Commands::Serve { bind } => cmd_serve(&settings, bind).await,
        Commands::Schedule => cmd_schedule(&settings).await,
        Commands::Import { partner } => cmd_import(&settings, partner).await,
        Commands::Partner(command) => cmd_partner(&settings, command),
        Commands::Batches { partner } => cmd_batches(&settings, partner),
    }
}

// ─── Import ──────────────────────────────────────────────────────────────────

async fn cmd_serve(settings: &Settings, bind: SocketAddr) -> Result<()> {
    let coordinator = build_coordinator(settings)?;
    crate::server::serve(Arc::new(coordinator), bind).await
}

async fn cmd_schedule(settings: &Settings) -> Result<()> {
    let coordinator = build_coordinator(settings)?;
    let summary = coordinator.schedule(coordinator.trigger_deadline()).await?;
    print_json(&summary)?;

    if !summary.ok {
        return Err(KeyfedError::Other("one or more partners failed".to_string()));
    }
    Ok(())
}

async fn cmd_import(settings: &Settings, partner: String) -> Result<()> {
    let coordinator = build_coordinator(settings)?;
    let outcome = coordinator.import(&partner, coordinator.trigger_deadline()).await?;
    let failed = outcome.is_failure();
    print_json(&PartnerResult { partner, outcome })?;

    if failed {
        return Err(KeyfedError::Other("import failed".to_string()));
    }
    Ok(())
}

fn cmd_batches(settings: &Settings, partner: String) -> Result<()> {
    let store = open_store(settings)?;
    let batches = store.list_batches(&partner)?;

    if batches.is_empty() {
        println!("No batches merged for {} yet.", partner);
        return Ok(());
    }

    println!("Merged batches for {} ({}):\n", partner, batches.len());
    for b in &batches {
        println!(
            "  {:>8} │ {:>6} keys │ +{:<6} │ dup {:<6} │ {} │ {}",
            b.position,
            b.key_count,
            b.inserted,
            b.duplicates,
            b.imported_at.format("%Y-%m-%d %H:%M:%S UTC"),
            &b.digest[..b.digest.len().min(16)],
        );
    }
    println!("\nTotal keys held: {}", store.count_keys(&partner)?);
    Ok(())
}

// ─── Partner management ──────────────────────────────────────────────────────

fn cmd_partner(settings: &Settings, command: PartnerCommands) -> Result<()> {
    let store = open_store(settings)?;

    match command {
        PartnerCommands::Add {
            name,
            export_root,
            index_file,
            credential_env,
            region,
            cadence,
        } => {
            let cadence = to_chrono(cadence)?;
            store.upsert_partner(&NewPartner {
                name: name.clone(),
                export_root,
                index_file,
                credential_ref: credential_env,
                region,
                cadence,
            })?;
            println!("✓ Partner {} saved", name);
            if store.get_partner(&name)?.is_some_and(|p| p.keys.is_empty()) {
                println!("Next: trust its signing key with `keyfed partner add-key {} --key-id <id> --key-version <v> --public-key <base64>`", name);
            }
        }

        PartnerCommands::List => {
            let partners = store.list_partners()?;
            if partners.is_empty() {
                println!("No partners configured yet.");
                println!("Add one with: keyfed partner add <name> --export-root <url> --region <label>");
                return Ok(());
            }

            println!("Partners ({}):\n", partners.len());
            for p in &partners {
                let last = p
                    .last_success_at
                    .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
                    .unwrap_or_else(|| "never".to_string());
                println!(
                    "  {:12} │ cursor {:>8} │ every {:>6}s │ last {} │ keys {} │ streak {}{}",
                    p.name,
                    p.cursor,
                    p.cadence.num_seconds(),
                    last,
                    p.keys.len(),
                    p.failure_count,
                    if p.enabled { "" } else { " │ disabled" },
                );
            }
        }

        PartnerCommands::Remove { name } => {
            if store.remove_partner(&name)? {
                println!("✓ Partner {} removed", name);
            } else {
                println!("Partner not found: {}", name);
            }
        }

        PartnerCommands::AddKey {
            partner,
            key_id,
            key_version,
            public_key,
            valid_from,
            valid_until,
        } => {
            check_public_key(&public_key)?;
            let key = PartnerKey {
                key_id,
                key_version,
                public_key,
                valid_from: match valid_from {
                    Some(s) => parse_time(&s)?,
                    None => Utc::now(),
                },
                valid_until: valid_until.as_deref().map(parse_time).transpose()?,
            };
            store.add_partner_key(&partner, &key)?;
            println!("✓ Key {}/{} trusted for {}", key.key_id, key.key_version, partner);
        }

        PartnerCommands::Enable { name } => report_toggle(store.set_enabled(&name, true)?, &name, "enabled"),

        PartnerCommands::Disable { name } => report_toggle(store.set_enabled(&name, false)?, &name, "disabled"),
    }

    Ok(())
}

fn report_toggle(found: bool, name: &str, state: &str) {
    if found {
        println!("✓ Partner {} {}", name, state);
    } else {
        println!("Partner not found: {}", name);
    }
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

/// Open (creating if needed) the shared database.
fn open_store(settings: &Settings) -> Result<Arc<SqliteStore>> {
    let path = settings.database_path();
    ensure_parent_dir(&path)?;
    let db = Database::open(&path)?;
    tracing::debug!(path = %path.display(), "Database opened");
    Ok(Arc::new(SqliteStore::new(Arc::new(db))))
}

fn build_coordinator(settings: &Settings) -> Result<Coordinator<SqliteStore>> {
    let store = open_store(settings)?;
    let import_config = settings.import_config()?;
    tracing::info!(holder = %import_config.holder, "Import engine ready");

    let source = HttpBatchSource::new(settings.fetch_config())?;
    let scheduler = Scheduler::new(store.clone(), Arc::new(source), Arc::new(SystemClock), import_config);
    Ok(Coordinator::new(Arc::new(scheduler), store, settings.worker_pool_size))
}

fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    let text = serde_json::to_string_pretty(value)
        .map_err(|e| KeyfedError::Other(format!("Failed to render output: {}", e)))?;
    println!("{}", text);
    Ok(())
}

fn to_chrono(d: Duration) -> Result<chrono::Duration> {
    chrono::Duration::from_std(d).map_err(|_| KeyfedError::Config(format!("duration {:?} is out of range", d)))
}

fn parse_time(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| KeyfedError::Config(format!("invalid timestamp '{}': {}", s, e)))
}

/// A trusted key must decode to a valid Ed25519 point before it is stored.
fn check_public_key(b64: &str) -> Result<()> {
    let bytes: [u8; 32] = BASE64
        .decode(b64.trim())
        .map_err(|e| KeyfedError::Config(format!("public key is not base64: {}", e)))?
        .try_into()
        .map_err(|_| KeyfedError::Config("public key must be 32 bytes".to_string()))?;
    VerifyingKey::from_bytes(&bytes)
        .map_err(|e| KeyfedError::Config(format!("not an Ed25519 public key: {}", e)))?;
    Ok(())
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use clap::Parser;
    use ed25519_dalek::SigningKey;

    use super::*;

    fn settings_for(db: &Path) -> Settings {
        Cli::try_parse_from(["keyfed", "--database", db.to_str().unwrap(), "schedule"])
            .unwrap()
            .settings
    }

    #[test]
    fn test_check_public_key() {
        let key = SigningKey::from_bytes(&[3u8; 32]).verifying_key();
        assert!(check_public_key(&BASE64.encode(key.as_bytes())).is_ok());
        assert!(check_public_key("not base64!").is_err());
        assert!(check_public_key(&BASE64.encode([0u8; 16])).is_err());
    }

    #[test]
    fn test_parse_time() {
        let t = parse_time("2024-03-01T12:00:00Z").unwrap();
        assert_eq!(t.timestamp(), 1_709_294_400);
        assert!(parse_time("yesterday").is_err());
    }

    #[test]
    fn test_partner_commands_round_trip_through_store() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings_for(&dir.path().join("nested").join("keyfed.db"));

        cmd_partner(
            &settings,
            PartnerCommands::Add {
                name: "de".to_string(),
                export_root: "https://de.example.org/exports/".to_string(),
                index_file: "index.txt".to_string(),
                credential_env: Some("KEYFED_DE_TOKEN".to_string()),
                region: "DE".to_string(),
                cadence: Duration::from_secs(1800),
            },
        )
        .unwrap();

        let key = SigningKey::from_bytes(&[3u8; 32]).verifying_key();
        cmd_partner(
            &settings,
            PartnerCommands::AddKey {
                partner: "de".to_string(),
                key_id: "262".to_string(),
                key_version: "v1".to_string(),
                public_key: BASE64.encode(key.as_bytes()),
                valid_from: Some("2024-01-01T00:00:00Z".to_string()),
                valid_until: None,
            },
        )
        .unwrap();
        cmd_partner(&settings, PartnerCommands::Disable { name: "de".to_string() }).unwrap();

        let store = open_store(&settings).unwrap();
        let partner = store.get_partner("de").unwrap().unwrap();
        assert_eq!(partner.cadence, chrono::Duration::minutes(30));
        assert_eq!(partner.credential_ref.as_deref(), Some("KEYFED_DE_TOKEN"));
        assert_eq!(partner.keys.len(), 1);
        assert!(!partner.enabled);
    }

    #[test]
    fn test_add_key_rejects_invalid_key_material() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings_for(&dir.path().join("keyfed.db"));
        let result = cmd_partner(
            &settings,
            PartnerCommands::AddKey {
                partner: "de".to_string(),
                key_id: "1".to_string(),
                key_version: "v1".to_string(),
                public_key: "AAAA".to_string(),
                valid_from: None,
                valid_until: None,
            },
        );
        assert!(matches!(result, Err(KeyfedError::Config(_))));
    }
}
