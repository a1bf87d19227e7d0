/*!
keepsql CLI - command-line host for the keepsql embedded database.

Each invocation starts the database the way an application would (stored
snapshot, remote seed or fresh build), runs one command against it and shuts
down cleanly, saving whatever changed.
*/

use anyhow::Context;
use clap::{Parser, Subcommand};
use keepsql_core::{
    observability, DatabaseLifecycle, KeepError, LifecycleConfig, Row, StorageConfig, Value,
};
use std::path::PathBuf;
use tabled::{Table, Tabled};
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "keepsql")]
#[command(about = "Durable embedded SQLite with snapshot persistence")]
#[command(version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    /// JSON configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Directory holding the snapshot store
    #[arg(short, long, global = true, env = "KEEPSQL_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Keep everything in memory (nothing is saved)
    #[arg(long, global = true, conflicts_with = "data_dir")]
    memory: bool,

    /// Prebuilt database to download when no snapshot is usable
    #[arg(long, global = true, env = "KEEPSQL_SEED_URL")]
    seed_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show lifecycle state, capabilities and storage usage
    Status,
    /// Run one SQL statement and print any rows as JSON
    Exec {
        /// SQL statement
        sql: String,
        /// Positional parameters (integers, reals, `null`, otherwise text)
        #[arg(short, long = "param")]
        params: Vec<String>,
    },
    /// Save the current database now
    Save,
    /// Discard all data and rebuild from the bundled schema
    Reset {
        /// Skip confirmation
        #[arg(short, long)]
        force: bool,
    },
    /// Replace the database with a SQLite file
    Import {
        /// Database file to load
        file: PathBuf,
    },
    /// Write the database to a SQLite file
    Export {
        /// Destination file
        file: PathBuf,
    },
}

#[derive(Tabled)]
struct CapabilityRow {
    #[tabled(rename = "Feature")]
    feature: String,
    #[tabled(rename = "Supported")]
    supported: String,
    #[tabled(rename = "Error")]
    error: String,
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();

    observability::init_logging(cli.verbose, cli.json_logs)?;

    let config = build_config(&cli)?;
    let db = DatabaseLifecycle::builder(config).build()?;
    db.initialize().await.context("database startup failed")?;

    let watcher = db.watch_termination(async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    });

    let outcome = run_command(&db, cli.command).await;

    watcher.abort();
    db.shutdown().await.context("final save failed")?;

    #[cfg(feature = "metrics")]
    {
        if cli.verbose {
            eprintln!("{}", observability::gather_metrics()?);
        }
    }

    outcome
}

fn build_config(cli: &Cli) -> Result<LifecycleConfig, anyhow::Error> {
    let mut config = match &cli.config {
        Some(path) => LifecycleConfig::from_json_file(path)
            .with_context(|| format!("failed to read config {}", path.display()))?,
        None => LifecycleConfig::default(),
    };

    if cli.memory {
        config.storage = StorageConfig::memory();
    } else if let Some(dir) = &cli.data_dir {
        config.storage = StorageConfig {
            local_base_path: Some(dir.clone()),
            ..StorageConfig::default_local()
        };
    }
    if let Some(url) = &cli.seed_url {
        config.seed_url = Some(url.clone());
    }

    config.validate()?;
    Ok(config)
}

async fn run_command(db: &DatabaseLifecycle, command: Commands) -> Result<(), anyhow::Error> {
    match command {
        Commands::Status => show_status(db),
        Commands::Exec { sql, params } => exec(db, &sql, &params),
        Commands::Save => {
            db.save().await.map_err(explain_save_error)?;
            println!("Saved");
            Ok(())
        }
        Commands::Reset { force } => {
            if !force {
                println!("Reset discards all data. Re-run with --force to confirm.");
                return Ok(());
            }
            db.reset().await?;
            println!("Database reset (data version {})", db.data_version());
            Ok(())
        }
        Commands::Import { file } => {
            let image = tokio::fs::read(&file)
                .await
                .with_context(|| format!("failed to read {}", file.display()))?;
            db.load_from_external_image(&image).await?;
            info!("Imported {}", file.display());
            println!("Imported {} ({})", file.display(), format_size(image.len() as u64));
            Ok(())
        }
        Commands::Export { file } => {
            let image = db.export_image()?;
            tokio::fs::write(&file, &image)
                .await
                .with_context(|| format!("failed to write {}", file.display()))?;
            println!("Exported {} to {}", format_size(image.len() as u64), file.display());
            Ok(())
        }
    }
}

fn show_status(db: &DatabaseLifecycle) -> Result<(), anyhow::Error> {
    println!("State:        {}", db.state());
    if let Some(origin) = db.engine_origin() {
        println!("Loaded from:  {:?}", origin);
    }
    println!("Data version: {}", db.data_version());
    println!(
        "Persistence:  {}",
        if db.persistence_enabled() {
            "enabled"
        } else {
            "memory only"
        }
    );

    match db.storage_quota() {
        Some(quota) => {
            let limit = quota
                .quota_bytes
                .map(format_size)
                .unwrap_or_else(|| "unlimited".to_string());
            println!(
                "Storage:      {} of {} ({:.1}%){}",
                format_size(quota.used_bytes),
                limit,
                quota.percent_used,
                if quota.warning_flag { "  WARNING: nearly full" } else { "" }
            );
        }
        None => println!("Storage:      unknown"),
    }

    let stats = db.autosave_stats();
    if let Some(saved_at) = stats.last_saved_at {
        println!(
            "Last save:    {}",
            saved_at
                .with_timezone(&chrono::Local)
                .format("%Y-%m-%d %H:%M:%S")
        );
    }
    if let Some(err) = db.last_error() {
        println!("Last error:   {}", err);
    }

    if let Some(report) = db.capabilities() {
        let rows: Vec<CapabilityRow> = report
            .features
            .iter()
            .map(|(feature, support)| CapabilityRow {
                feature: feature.clone(),
                supported: if support.supported { "yes" } else { "no" }.to_string(),
                error: report
                    .telemetry
                    .iter()
                    .find(|entry| &entry.feature == feature)
                    .map(|entry| entry.error_message.clone())
                    .unwrap_or_default(),
            })
            .collect();
        println!();
        println!("{}", Table::new(rows));
    }
    Ok(())
}

fn exec(db: &DatabaseLifecycle, sql: &str, params: &[String]) -> Result<(), anyhow::Error> {
    let params: Vec<Value> = params.iter().map(|raw| parse_param(raw)).collect();
    let rows = db.execute(sql, &params)?;
    if rows.is_empty() {
        println!("OK (data version {})", db.data_version());
        return Ok(());
    }
    let json: Vec<serde_json::Value> = rows.iter().map(row_to_json).collect();
    println!("{}", serde_json::to_string_pretty(&json)?);
    Ok(())
}

fn parse_param(raw: &str) -> Value {
    if raw.eq_ignore_ascii_case("null") {
        Value::Null
    } else if let Ok(int) = raw.parse::<i64>() {
        Value::Integer(int)
    } else if let Ok(real) = raw.parse::<f64>() {
        Value::Real(real)
    } else {
        Value::Text(raw.to_string())
    }
}

fn row_to_json(row: &Row) -> serde_json::Value {
    let object = row
        .columns()
        .iter()
        .zip(row.values())
        .map(|(column, value)| {
            let value = match value {
                Value::Null => serde_json::Value::Null,
                Value::Integer(int) => serde_json::Value::from(*int),
                Value::Real(real) => serde_json::Value::from(*real),
                Value::Text(text) => serde_json::Value::from(text.as_str()),
                Value::Blob(blob) => serde_json::Value::from(
                    blob.iter().map(|byte| format!("{byte:02x}")).collect::<String>(),
                ),
            };
            (column.clone(), value)
        })
        .collect();
    serde_json::Value::Object(object)
}

fn explain_save_error(err: KeepError) -> anyhow::Error {
    if err.is_quota_exceeded() {
        anyhow::anyhow!("{err}. Free up space in the data directory; changes are kept in memory until the next successful save")
    } else {
        err.into()
    }
}

fn format_size(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    if unit_index == 0 {
        format!("{} {}", bytes, UNITS[unit_index])
    } else {
        format!("{:.1} {}", size, UNITS[unit_index])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_param() {
        assert_eq!(parse_param("42"), Value::Integer(42));
        assert_eq!(parse_param("2.5"), Value::Real(2.5));
        assert_eq!(parse_param("NULL"), Value::Null);
        assert_eq!(parse_param("hello"), Value::Text("hello".to_string()));
    }

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(2048), "2.0 KB");
        assert_eq!(format_size(5 * 1024 * 1024), "5.0 MB");
    }

    #[test]
    fn test_memory_flag_overrides_storage() {
        let cli = Cli::parse_from(["keepsql", "--memory", "status"]);
        let config = build_config(&cli).unwrap();
        assert_eq!(config.storage, StorageConfig::memory());
    }

    #[test]
    fn test_data_dir_selects_local_store() {
        let cli = Cli::parse_from(["keepsql", "--data-dir", "/tmp/keepsql-test", "save"]);
        let config = build_config(&cli).unwrap();
        assert_eq!(
            config.storage.local_base_path,
            Some(PathBuf::from("/tmp/keepsql-test"))
        );
    }
}
