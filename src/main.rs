//! slicequery CLI
//!
//! Inspect a persistence unit configuration: list its slices, or prepare a
//! query through the cache and show the SQL, bound parameters,
//! cacheability and statistics.
//!
//! ```text
//! slicequery --config unit.yaml slices
//! slicequery --config unit.yaml explain "SELECT p FROM Person p WHERE p.id = :id" --param id=7 --repeat 3
//! ```

use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use slicequery::cache::QueryCounts;
use slicequery::query::{Args, Cacheability, ParamKey, PlanOrigin, Value};
use slicequery::{PersistenceUnit, UnitConfig};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Prepared-query cache and slice routing inspector
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Persistence unit configuration (YAML)
    #[arg(short, long, env = "SLICEQUERY_CONFIG")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "warn")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List configured slices and their status
    Slices,

    /// Prepare a query and print its plan as JSON
    Explain {
        /// Query text
        query: String,

        /// Argument as name=value (named) or n=value (positional); a,b,c is a collection
        #[arg(long = "param", value_name = "KEY=VALUE")]
        params: Vec<String>,

        /// Embed arguments as SQL literals instead of binding them
        #[arg(long)]
        inline: bool,

        /// Prepare this many times before printing
        #[arg(long, default_value = "1")]
        repeat: u32,
    },
}

// =============================================================================
// Main
// =============================================================================

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(&cli);

    let config = UnitConfig::from_file(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    let unit = PersistenceUnit::open(config).context("opening persistence unit")?;
    info!(unit = unit.name(), "Loaded persistence unit");

    match cli.command {
        Command::Slices => list_slices(&unit),
        Command::Explain {
            query,
            params,
            inline,
            repeat,
        } => explain(&unit, &query, &params, inline, repeat),
    }
}

fn list_slices(unit: &PersistenceUnit) -> anyhow::Result<()> {
    let snapshot = unit.registry().snapshot();
    println!("{:<16} {:<10} PROPERTIES", "SLICE", "STATUS");
    for slice in snapshot.slices() {
        let props = slice
            .properties
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(",");
        println!("{:<16} {:<10} {}", slice.name, slice.status.to_string(), props);
    }
    println!();
    println!("distribution: {}", unit.router().distribution_policy());
    println!("replication:  {}", unit.router().replication_policy());
    println!("query target: {}", unit.router().query_target_policy());
    Ok(())
}

#[derive(Serialize)]
struct StatementReport {
    sql: String,
    params: Vec<Value>,
    inline: String,
}

#[derive(Serialize)]
struct ExplainReport {
    query: String,
    candidate: String,
    origins: Vec<PlanOrigin>,
    cacheable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    not_cacheable_reason: Option<String>,
    tier: Option<String>,
    statements: Vec<StatementReport>,
    statistics: Option<QueryCounts>,
}

fn explain(
    unit: &PersistenceUnit,
    query: &str,
    params: &[String],
    inline: bool,
    repeat: u32,
) -> anyhow::Result<()> {
    if repeat == 0 {
        bail!("--repeat must be at least 1");
    }
    let args = parse_params(params)?;
    let preparer = unit.preparer();

    let mut origins = Vec::with_capacity(repeat as usize);
    let mut handle = None;
    for _ in 0..repeat {
        let h = if inline {
            preparer.prepare_inline(query, &args)?
        } else {
            preparer.prepare(query, &args)?
        };
        origins.push(h.origin());
        handle = Some(h);
    }
    let Some(handle) = handle else {
        bail!("query was not prepared");
    };

    let statements: Vec<StatementReport> = if inline {
        handle
            .plan()
            .statements()
            .iter()
            .map(|s| StatementReport {
                sql: s.sql.clone(),
                params: Vec::new(),
                inline: s.sql.clone(),
            })
            .collect()
    } else {
        handle
            .bind(&args)?
            .into_iter()
            .map(|b| {
                Ok(StatementReport {
                    sql: b.sql().to_string(),
                    params: b.params().to_vec(),
                    inline: b.render_inline()?,
                })
            })
            .collect::<slicequery::Result<Vec<_>>>()?
    };

    let plan = handle.plan();
    let report = ExplainReport {
        query: query.to_string(),
        candidate: plan.candidate().to_string(),
        origins,
        cacheable: plan.is_cacheable(),
        not_cacheable_reason: match plan.cacheability() {
            Cacheability::NotCacheable(reason) => Some(reason.clone()),
            Cacheability::Cacheable => None,
        },
        tier: unit.cache().tier_of(query).map(|t| t.to_string()),
        statements,
        statistics: unit.statistics().snapshot().query(query).cloned(),
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

/// `name=value` becomes a named argument, `3=value` a positional one
fn parse_params(raw: &[String]) -> anyhow::Result<Args> {
    let mut args = Args::new();
    for param in raw {
        let Some((key, value)) = param.split_once('=') else {
            bail!("parameter {:?} is not KEY=VALUE", param);
        };
        let key = key.trim().trim_start_matches([':', '?']);
        if key.is_empty() {
            bail!("parameter {:?} has an empty name", param);
        }
        let key = match key.parse::<u32>() {
            Ok(position) => ParamKey::Positional(position),
            Err(_) => ParamKey::Named(key.to_string()),
        };
        args.insert(key, Value::parse_arg(value));
    }
    Ok(args)
}

// =============================================================================
// Logging
// =============================================================================

fn init_logging(cli: &Cli) {
    let level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    if cli.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    }
}
