use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use dualstore_core::{
    discard_artifact, discard_stores, ensure_key, load_settings, CipherStore, DecryptMode,
    DiscardOutcome, ReconReport, Reconciler, Record, StoreDiscard, StoreRef, SyncSettings,
};
use serde_json::json;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "dualstore")]
#[command(about = "Encrypt and reconcile spreadsheet and SQLite record stores", long_about = None)]
struct Cli {
    /// Settings file (overrides DUALSTORE_CONFIG and ./dualstore.json)
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a key file if none exists
    Keygen {
        /// Key file (default: the tabular store key)
        #[arg(long)]
        key: Option<PathBuf>,
    },

    /// Encrypt a store into `<STORE>.enc`
    Encrypt {
        store: PathBuf,

        /// Key file (default: the key configured for this store)
        #[arg(long)]
        key: Option<PathBuf>,

        /// Remove the plaintext once the ciphertext is written
        #[arg(long)]
        delete_original: bool,
    },

    /// Decrypt a `.enc` artifact back to its store
    Decrypt {
        cipher: PathBuf,

        /// Key file (default: the key configured for this store)
        #[arg(long)]
        key: Option<PathBuf>,

        /// Write the plaintext here instead of stripping the suffix
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Remove the ciphertext once the plaintext is written
        #[arg(long)]
        delete_ciphertext: bool,
    },

    /// Compare two plaintext stores
    Compare {
        /// Left store (default: the configured spreadsheet)
        #[arg(long)]
        left: Option<PathBuf>,

        /// Right store (default: the configured database)
        #[arg(long)]
        right: Option<PathBuf>,

        /// Database table to read
        #[arg(long)]
        table: Option<String>,
    },

    /// Decrypt two stores to temporary copies and compare them
    CompareEncrypted {
        #[arg(long)]
        left: Option<PathBuf>,

        #[arg(long)]
        right: Option<PathBuf>,

        /// Key used for both artifacts (default: the key configured for
        /// the stores, when both use the same one)
        #[arg(long)]
        key: Option<PathBuf>,

        #[arg(long)]
        table: Option<String>,
    },

    /// Delete the plaintext stores, reporting each one separately
    DeleteStores {
        /// Stores to delete (default: the configured spreadsheet and database)
        stores: Vec<PathBuf>,

        /// Confirm the deletion
        #[arg(long)]
        yes: bool,
    },
}

enum Outcome {
    Done,
    Differences,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(Outcome::Done) => ExitCode::SUCCESS,
        Ok(Outcome::Differences) => ExitCode::from(1),
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::from(2)
        }
    }
}

fn run(cli: Cli) -> Result<Outcome> {
    let mut settings = load_settings(cli.config.as_deref()).context("loading settings")?;

    match cli.command {
        Commands::Keygen { key } => {
            let path = key.unwrap_or_else(|| settings.tabular_key.clone());
            let ensured = ensure_key(&path)?;
            let fingerprint = ensured.key.fingerprint();
            if cli.json {
                print_json(&json!({
                    "key": path,
                    "fingerprint": fingerprint,
                    "created": ensured.created,
                }))?;
            } else {
                let state = if ensured.created { "created" } else { "existing" };
                println!("{} ({state}) fingerprint {fingerprint}", path.display());
            }
            Ok(Outcome::Done)
        }

        Commands::Encrypt {
            store,
            key,
            delete_original,
        } => {
            let cs = cipher_store(&settings, key, &store);
            let cipher = cs.encrypt(&store)?;
            if delete_original {
                discard_artifact(&store)?;
            }
            if cli.json {
                print_json(&json!({
                    "source": store,
                    "ciphertext": cipher,
                    "source_removed": delete_original,
                }))?;
            } else {
                println!("encrypted {} -> {}", store.display(), cipher.display());
                if delete_original {
                    println!("removed {}", store.display());
                }
            }
            Ok(Outcome::Done)
        }

        Commands::Decrypt {
            cipher,
            key,
            output,
            delete_ciphertext,
        } => {
            let cs = cipher_store(&settings, key, &cipher);
            let decrypted = cs.decrypt(&cipher, output.as_deref(), DecryptMode::Standard)?;
            let removed = delete_ciphertext && decrypted.may_discard_ciphertext();
            if removed {
                discard_artifact(&decrypted.ciphertext)?;
            }
            if cli.json {
                print_json(&json!({
                    "ciphertext": decrypted.ciphertext,
                    "output": decrypted.output,
                    "bytes": decrypted.bytes,
                    "ciphertext_removed": removed,
                }))?;
            } else {
                println!(
                    "decrypted {} -> {}",
                    decrypted.ciphertext.display(),
                    decrypted.output.display()
                );
                if removed {
                    println!("removed {}", decrypted.ciphertext.display());
                }
            }
            Ok(Outcome::Done)
        }

        Commands::Compare { left, right, table } => {
            if let Some(table) = table {
                settings.table = table;
            }
            let left = left.unwrap_or_else(|| settings.tabular_store.clone());
            let right = right.unwrap_or_else(|| settings.relational_store.clone());
            let a = StoreRef::infer(&left, &settings.table)?;
            let b = StoreRef::infer(&right, &settings.table)?;

            let report = Reconciler::from_settings(&settings).compare(&a, &b)?;
            emit_report(&report, cli.json)
        }

        Commands::CompareEncrypted {
            left,
            right,
            key,
            table,
        } => {
            if let Some(table) = table {
                settings.table = table;
            }
            let left = left.unwrap_or_else(|| settings.tabular_cipher());
            let right = right.unwrap_or_else(|| settings.relational_cipher());
            let key = match key {
                Some(key) => key,
                None => shared_key(&settings, &left, &right)?,
            };

            let report =
                Reconciler::from_settings(&settings).compare_encrypted(&left, &right, &key)?;
            emit_report(&report, cli.json)
        }

        Commands::DeleteStores { stores, yes } => {
            let stores = if stores.is_empty() {
                vec![
                    settings.tabular_store.clone(),
                    settings.relational_store.clone(),
                ]
            } else {
                stores
            };
            if !yes {
                bail!(
                    "refusing to delete {} without --yes",
                    stores
                        .iter()
                        .map(|p| p.display().to_string())
                        .collect::<Vec<_>>()
                        .join(", ")
                );
            }

            let outcomes = discard_stores(&stores);
            if cli.json {
                print_json(&outcomes)?;
            } else {
                print_discards(&outcomes);
            }
            let failed = outcomes.iter().filter(|o| o.outcome.is_failure()).count();
            if failed > 0 {
                bail!("{failed} store(s) could not be deleted");
            }
            Ok(Outcome::Done)
        }
    }
}

/// The key both artifacts were sealed with, when the settings agree on one.
fn shared_key(settings: &SyncSettings, left: &Path, right: &Path) -> Result<PathBuf> {
    let left_key = settings.key_for(left);
    let right_key = settings.key_for(right);
    if left_key != right_key {
        bail!(
            "{} uses key {} but {} uses key {}; encrypted comparison needs one key, \
             pass --key with the key both stores were encrypted with",
            left.display(),
            left_key.display(),
            right.display(),
            right_key.display()
        );
    }
    Ok(left_key.to_path_buf())
}

fn cipher_store(settings: &SyncSettings, key: Option<PathBuf>, target: &Path) -> CipherStore {
    let key = key.unwrap_or_else(|| settings.key_for(target).to_path_buf());
    info!(key = %key.display(), "using key file");
    CipherStore::new(key).with_suffix(settings.cipher_suffix.clone())
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn emit_report(report: &ReconReport, as_json: bool) -> Result<Outcome> {
    if as_json {
        print_json(report)?;
    } else {
        print_report(report);
    }
    Ok(if report.is_consistent() {
        Outcome::Done
    } else {
        Outcome::Differences
    })
}

fn print_report(report: &ReconReport) {
    println!("left:  {} ({} rows)", report.left, report.left_rows);
    println!("right: {} ({} rows)", report.right, report.right_rows);
    println!("compared fields: {}", report.compared_fields.join(", "));
    if !report.unmatched_left_fields.is_empty() {
        println!(
            "fields only in left: {}",
            report.unmatched_left_fields.join(", ")
        );
    }
    if !report.unmatched_right_fields.is_empty() {
        println!(
            "fields only in right: {}",
            report.unmatched_right_fields.join(", ")
        );
    }

    print_rows("only in left", &report.only_in_left);
    print_rows("only in right", &report.only_in_right);

    for warning in &report.warnings {
        println!("warning: {warning}");
    }

    if report.is_consistent() {
        println!("stores are consistent");
    } else {
        println!(
            "stores differ: {} row(s) only in left, {} row(s) only in right",
            report.only_in_left.len(),
            report.only_in_right.len()
        );
    }
}

fn print_discards(outcomes: &[StoreDiscard]) {
    for entry in outcomes {
        let path = entry.path.display();
        match &entry.outcome {
            DiscardOutcome::Removed => println!("removed {path}"),
            DiscardOutcome::NotFound => println!("not found {path}"),
            DiscardOutcome::InUse { reason } => println!("in use {path}: {reason}"),
            DiscardOutcome::Failed { reason } => println!("failed {path}: {reason}"),
        }
    }
}

fn print_rows(heading: &str, rows: &[Record]) {
    if rows.is_empty() {
        return;
    }
    println!("{heading} ({}):", rows.len());
    for row in rows {
        let cells: Vec<String> = row.iter().map(|(k, v)| format!("{k}={v}")).collect();
        println!("  {}", cells.join(", "));
    }
}
