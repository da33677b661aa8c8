//! keel CLI
//!
//! Command-line tool for inspecting databases and running ad-hoc statements.

use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::time::Instant;
use tracing::{debug, info, Level};
use tracing_subscriber::FmtSubscriber;

use keel_db::{AppConfig, Container, DbConfig, Driver, SchemaRegistry, SqlValue};

/// Transaction-aware data access from the command line.
#[derive(Parser, Debug)]
#[command(name = "keel")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file (JSON). Takes precedence over `--database`.
    #[arg(short, long, env = "KEEL_CONFIG")]
    config: Option<PathBuf>,

    /// SQLite database used when no configuration file is given.
    #[arg(short, long, env = "DATABASE_URL", default_value = "keel.sqlite3")]
    database: String,

    /// Logical database name.
    #[arg(long, default_value = "master")]
    db: String,

    /// Enable verbose output.
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List tables.
    Tables,

    /// Show the columns of a table.
    Describe {
        /// Table name.
        table: String,
    },

    /// Introspect every table into a schema registry document.
    Schema {
        /// Write the document here instead of stdout.
        #[arg(short, long)]
        out: Option<PathBuf>,
    },

    /// Run a query and print the rows as JSON.
    Query {
        /// SQL with `?` placeholders.
        sql: String,

        /// Positional bind value (`null`, integer, float, or text).
        #[arg(short, long = "bind")]
        binds: Vec<String>,

        /// Statement deadline in milliseconds.
        #[arg(long)]
        timeout_ms: Option<u64>,
    },

    /// Run a statement and print the number of affected rows.
    Exec {
        /// SQL with `?` placeholders.
        sql: String,

        /// Positional bind value (`null`, integer, float, or text).
        #[arg(short, long = "bind")]
        binds: Vec<String>,
    },
}

/// Interprets a command-line bind: `null`, then integer, then float, else text.
fn parse_bind(text: &str) -> SqlValue {
    if text.eq_ignore_ascii_case("null") {
        SqlValue::Null
    } else if let Ok(n) = text.parse::<i64>() {
        SqlValue::Int(n)
    } else if let Ok(f) = text.parse::<f64>() {
        SqlValue::Float(f)
    } else {
        SqlValue::Text(text.to_string())
    }
}

/// Accepts both plain paths and `sqlite:` URLs.
fn sqlite_path(url: &str) -> &str {
    url.strip_prefix("sqlite://")
        .or_else(|| url.strip_prefix("sqlite:"))
        .unwrap_or(url)
}

async fn container(cli: &Cli) -> anyhow::Result<Container> {
    if let Some(path) = &cli.config {
        return Ok(Container::load(path).await?);
    }
    let config = AppConfig::single(&cli.db, DbConfig::sqlite(sqlite_path(&cli.database)));
    Ok(Container::new(config, SchemaRegistry::new())?)
}

async fn run(cli: Cli, out: &mut impl Write) -> anyhow::Result<()> {
    let container = container(&cli).await?;
    let mut driver = container.driver(&cli.db)?;
    driver.connect().await?;
    let version = driver.version().await?;
    debug!(db = %cli.db, version = %version, "Connected");

    match cli.command {
        Commands::Tables => {
            for table in driver.tables().await? {
                writeln!(out, "{table}")?;
            }
        }

        Commands::Describe { table } => {
            let fields = driver.table_fields(&table).await?;
            writeln!(out, "{}", serde_json::to_string_pretty(&fields)?)?;
        }

        Commands::Schema { out: target } => {
            let registry = SchemaRegistry::introspect(&mut driver).await?;
            let document = registry.to_json()?;
            match target {
                Some(path) => {
                    tokio::fs::write(&path, document).await?;
                    info!(tables = registry.len(), path = %path.display(), "Schema written");
                }
                None => writeln!(out, "{document}")?,
            }
        }

        Commands::Query {
            sql,
            binds,
            timeout_ms,
        } => {
            let binds: Vec<SqlValue> = binds.iter().map(|b| parse_bind(b)).collect();
            if let Some(ms) = timeout_ms {
                driver.set_deadline(Instant::now() + Duration::from_millis(ms));
            }
            let rows = driver.rows(&sql, &binds).await?;
            writeln!(out, "{}", serde_json::to_string_pretty(&rows)?)?;
        }

        Commands::Exec { sql, binds } => {
            let binds: Vec<SqlValue> = binds.iter().map(|b| parse_bind(b)).collect();
            let affected = driver.execute(Some(&sql), &binds).await?;
            writeln!(out, "{affected}")?;
        }
    }

    driver.close().await?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let log_level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let mut stdout = std::io::stdout().lock();
    run(cli, &mut stdout).await
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_bind() {
        assert_eq!(parse_bind("NULL"), SqlValue::Null);
        assert_eq!(parse_bind("42"), SqlValue::Int(42));
        assert_eq!(parse_bind("-1.5"), SqlValue::Float(-1.5));
        assert_eq!(parse_bind("Tom"), SqlValue::Text(String::from("Tom")));
        assert_eq!(parse_bind(""), SqlValue::Text(String::new()));
    }

    #[test]
    fn test_sqlite_path() {
        assert_eq!(sqlite_path("sqlite:db.sqlite3"), "db.sqlite3");
        assert_eq!(sqlite_path("sqlite:///tmp/db"), "/tmp/db");
        assert_eq!(sqlite_path("app.sqlite3"), "app.sqlite3");
    }

    fn cli(database: &str, args: &[&str]) -> Cli {
        let mut argv = vec!["keel", "--database", database];
        argv.extend_from_slice(args);
        Cli::try_parse_from(argv).unwrap()
    }

    async fn output(database: &str, args: &[&str]) -> String {
        let mut out = Vec::new();
        run(cli(database, args), &mut out).await.unwrap();
        String::from_utf8(out).unwrap()
    }

    #[tokio::test]
    async fn test_exec_query_and_introspection() {
        let dir = tempfile::tempdir().unwrap();
        let database = dir.path().join("cli.sqlite3");
        let database = database.to_str().unwrap();

        output(
            database,
            &["exec", "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT, age INTEGER)"],
        )
        .await;
        let affected = output(
            database,
            &["exec", "INSERT INTO users (name, age) VALUES (?, ?)", "-b", "Tom", "-b", "31"],
        )
        .await;
        assert_eq!(affected.trim(), "1");

        let rows = output(
            database,
            &["query", "SELECT name, age FROM users WHERE age > ?", "--bind", "18"],
        )
        .await;
        let rows: serde_json::Value = serde_json::from_str(&rows).unwrap();
        assert_eq!(rows, serde_json::json!([{"name": "Tom", "age": 31}]));

        assert_eq!(output(database, &["tables"]).await.trim(), "users");

        let fields: serde_json::Value =
            serde_json::from_str(&output(database, &["describe", "users"]).await).unwrap();
        assert_eq!(fields[0]["name"], "id");
        assert_eq!(fields[0]["primary_key"], true);

        let schema_path = dir.path().join("schema.json");
        output(database, &["schema", "--out", schema_path.to_str().unwrap()]).await;
        let registry = SchemaRegistry::load(&schema_path).await.unwrap();
        assert_eq!(registry.get("users").unwrap().primary_key, "id");
    }

    #[tokio::test]
    async fn test_unknown_table_fails() {
        let dir = tempfile::tempdir().unwrap();
        let database = dir.path().join("empty.sqlite3");
        let mut out = Vec::new();
        let result = run(cli(database.to_str().unwrap(), &["describe", "nope"]), &mut out).await;
        assert!(result.is_err());
    }
}
