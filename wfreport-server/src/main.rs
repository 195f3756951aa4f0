use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, EnvFilter};
use wfreport_core::{AuditLog, EngineSettings, PgConnector, ReportConfig, ReportEngine, SchemaCatalog};
use wfreport_server::http::{self, HttpState};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "wfreport.toml")]
    config: String,

    #[arg(long)]
    health: bool,

    /// Introspect the allow-listed tables and write the schema JSON to PATH ("-" for stdout)
    #[arg(long, value_name = "PATH")]
    dump_schema: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present (dev convenience; production uses real env vars)
    dotenvy::dotenv().ok();

    let args = Args::parse();

    let config = match ReportConfig::load(&args.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config from {}: {}", args.config, e);
            std::process::exit(1);
        }
    };

    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.service.log_level));
    fmt().with_env_filter(filter).init();

    let pool = match wfreport_core::db::create_pool(&config.database).await {
        Ok(p) => p,
        Err(e) => {
            eprintln!("Failed to connect to database: {}", e);
            std::process::exit(1);
        }
    };

    if args.health {
        match wfreport_core::db::health_check(&pool).await {
            Ok(v) => println!("✅ PostgreSQL connected: {}", v),
            Err(e) => {
                println!("❌ PostgreSQL connection failed: {}", e);
                std::process::exit(1);
            }
        }

        match SchemaCatalog::load(&config.schema.path) {
            Ok(c) => println!(
                "✅ Schema catalog {} loaded: {} tables",
                c.version().unwrap_or("(unversioned)"),
                c.len()
            ),
            Err(e) => {
                println!("❌ Schema catalog {} failed to load: {}", config.schema.path, e);
                std::process::exit(1);
            }
        }

        println!("✅ wfreport health check passed");
        return Ok(());
    }

    if let Some(target) = args.dump_schema {
        if config.schema.allowlist.is_empty() {
            eprintln!("[schema].allowlist is empty; nothing to introspect");
            std::process::exit(1);
        }
        let definition = wfreport_core::catalog::introspect(
            &pool,
            &config.schema.introspection_schema,
            &config.schema.allowlist,
        )
        .await?;
        // Reject anything the loader would reject before writing it out.
        let catalog = SchemaCatalog::from_definition(definition.clone())?;
        let rendered = serde_json::to_string_pretty(&definition)?;
        if target == "-" {
            println!("{rendered}");
        } else {
            std::fs::write(&target, rendered)?;
            tracing::info!(path = %target, tables = catalog.len(), "Schema written");
        }
        return Ok(());
    }

    let catalog = match SchemaCatalog::load(&config.schema.path) {
        Ok(c) => Arc::new(c),
        Err(e) => {
            eprintln!("Failed to load schema catalog from {}: {}", config.schema.path, e);
            std::process::exit(1);
        }
    };
    tracing::info!(
        version = catalog.version().unwrap_or("(unversioned)"),
        tables = catalog.len(),
        "Schema catalog loaded"
    );

    let reasoner = match wfreport_server::reasoner_from_config(&config.reasoning, None) {
        Ok(r) => r,
        Err(e) => {
            eprintln!("Failed to create reasoning backend: {}", e);
            std::process::exit(1);
        }
    };

    let engine = Arc::new(ReportEngine::new(
        catalog,
        Arc::new(PgConnector::new(pool.clone())),
        reasoner,
        EngineSettings::from(&config),
    ));

    let audit = config.audit.enabled.then(|| AuditLog::new(&config.audit.path));
    if let Some(log) = &audit {
        tracing::info!(path = %log.path().display(), "Audit log enabled");
    }

    if !config.http.enabled {
        tracing::warn!("[http].enabled is false; nothing to serve");
        return Ok(());
    }

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            return;
        }
        tracing::info!("Shutdown signal received");
        signal.cancel();
    });

    let addr = format!("{}:{}", config.http.host, config.http.port);
    let state = HttpState {
        pool,
        engine,
        audit,
        shutdown,
    };
    http::start_http_server(state, &addr).await?;

    Ok(())
}
