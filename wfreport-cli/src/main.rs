//! wfreport-cli: command-line client for the wfreport HTTP API
//!
//! The caller supplies the parsed intent directly: an anchor table, the other
//! tables the question mentions, and filters written as `column:op:value`.
//!
//! # Subcommands
//! - `report <question> --anchor <table> [--mention <table>]... [--filter <f>]... [--json]`
//! - `status`: show server health

use clap::{Parser, Subcommand};
use serde::Deserialize;
use serde_json::{json, Value};

const DEFAULT_SERVER: &str = "http://127.0.0.1:7878";

// ============================================================================
// CLI Definition
// ============================================================================

#[derive(Debug, Parser)]
#[command(name = "wfreport-cli", version, about = "Grounded reports over workflow data")]
struct Cli {
    /// wfreport HTTP server URL (overrides WFREPORT_HTTP_URL env var)
    #[arg(long, env = "WFREPORT_HTTP_URL", default_value = DEFAULT_SERVER)]
    server: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Ask a question and print the report
    Report {
        /// The question, verbatim
        question: String,

        /// Table the question is about
        #[arg(short, long)]
        anchor: String,

        /// Other tables the question mentions (repeatable)
        #[arg(short, long = "mention")]
        mentioned: Vec<String>,

        /// Filter as `table.column:op:value`; `between` takes `a..b`, `in` takes `a,b,c`
        #[arg(short, long = "filter")]
        filters: Vec<String>,

        /// Row limit (server default when omitted)
        #[arg(short = 'n', long)]
        limit: Option<u32>,

        /// Temporal column the --since/--until window applies to
        #[arg(long)]
        time_column: Option<String>,

        /// RFC 3339 lower bound, inclusive
        #[arg(long, requires = "time_column")]
        since: Option<String>,

        /// RFC 3339 upper bound, exclusive
        #[arg(long, requires = "time_column")]
        until: Option<String>,

        /// Print the JSON rendering instead of Markdown
        #[arg(long)]
        json: bool,
    },

    /// Show wfreport server status
    Status,
}

// ============================================================================
// API Response Types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ReportResponse {
    pub report_id: String,
    pub markdown: String,
    pub json: Value,
    pub took_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub kind: Option<String>,
}

// ============================================================================
// Intent assembly
// ============================================================================

/// Parse `column:op:value`. The value keeps any further colons, so timestamps
/// pass through intact.
pub fn parse_filter(raw: &str) -> Result<Value, String> {
    let mut parts = raw.splitn(3, ':');
    let (column, op, value) = match (parts.next(), parts.next(), parts.next()) {
        (Some(c), Some(o), Some(v)) if !c.is_empty() && !o.is_empty() => (c, o.to_ascii_lowercase(), v),
        _ => return Err(format!("filter '{raw}' must look like column:op:value")),
    };

    let value = match op.as_str() {
        "between" => {
            let (from, to) = value
                .split_once("..")
                .ok_or_else(|| format!("between filter '{raw}' needs a value like a..b"))?;
            json!({ "from": scalar(from), "to": scalar(to) })
        }
        "in" => Value::Array(value.split(',').map(|v| scalar(v.trim())).collect()),
        _ => scalar(value),
    };

    Ok(json!({ "column": column, "op": op, "value": value }))
}

/// Booleans and numbers become JSON scalars; everything else stays a string.
pub fn scalar(raw: &str) -> Value {
    match raw {
        "true" => return Value::Bool(true),
        "false" => return Value::Bool(false),
        _ => {}
    }
    if let Ok(i) = raw.parse::<i64>() {
        return json!(i);
    }
    if let Ok(f) = raw.parse::<f64>() {
        if f.is_finite() {
            return json!(f);
        }
    }
    Value::String(raw.to_string())
}

#[allow(clippy::too_many_arguments)]
pub fn build_request(
    question: &str,
    anchor: &str,
    mentioned: &[String],
    filters: &[String],
    limit: Option<u32>,
    time_column: Option<&str>,
    since: Option<&str>,
    until: Option<&str>,
) -> Result<Value, String> {
    let filters = filters
        .iter()
        .map(|f| parse_filter(f))
        .collect::<Result<Vec<_>, _>>()?;

    let mut intent = json!({
        "anchor": anchor,
        "mentioned": mentioned,
        "filters": filters,
    });
    if let Some(limit) = limit {
        intent["limit"] = json!(limit);
    }
    if let Some(column) = time_column {
        intent["time_window"] = json!({ "column": column, "since": since, "until": until });
    }

    Ok(json!({ "question": question, "intent": intent }))
}

// ============================================================================
// HTTP Client Calls
// ============================================================================

fn do_report(server: &str, body: &Value, json_output: bool) -> anyhow::Result<()> {
    // Reasoning alone may take a minute.
    let client = reqwest::blocking::Client::builder()
        .timeout(std::time::Duration::from_secs(120))
        .build()?;

    let url = format!("{}/report", server);
    let resp = match client.post(&url).json(body).send() {
        Ok(r) => r,
        Err(e) => {
            eprintln!("wfreport-cli: connection failed to {}: {}", url, e);
            std::process::exit(1);
        }
    };

    if !resp.status().is_success() {
        let status = resp.status();
        let text = resp.text().unwrap_or_default();
        match serde_json::from_str::<ErrorBody>(&text) {
            Ok(err) => eprintln!(
                "wfreport-cli: {} ({}): {}",
                status,
                err.kind.as_deref().unwrap_or("error"),
                err.error
            ),
            Err(_) => eprintln!("wfreport-cli: server returned {}: {}", status, text),
        }
        std::process::exit(1);
    }

    let report: ReportResponse = match resp.json() {
        Ok(r) => r,
        Err(e) => {
            eprintln!("wfreport-cli: failed to parse report response: {}", e);
            std::process::exit(1);
        }
    };

    if json_output {
        println!("{}", serde_json::to_string_pretty(&report.json)?);
    } else {
        println!("{}", report.markdown);
        if let Some(ms) = report.took_ms {
            eprintln!("report {} in {} ms", report.report_id, ms);
        }
    }

    Ok(())
}

/// Show the server status by calling GET /health.
fn do_status(server: &str) -> anyhow::Result<()> {
    let client = reqwest::blocking::Client::builder()
        .timeout(std::time::Duration::from_secs(10))
        .build()?;

    let url = format!("{}/health", server);
    match client.get(&url).send() {
        Ok(r) if r.status().is_success() => {
            let body: Value = r.json().unwrap_or_default();
            println!("wfreport server: {}", body["status"].as_str().unwrap_or("unknown"));
            println!("Version:         {}", body["version"].as_str().unwrap_or("?"));
            println!("PostgreSQL:      {}", body["postgresql"].as_str().unwrap_or("?"));
            println!(
                "Catalog:         {} ({} tables)",
                body["catalog"]["version"].as_str().unwrap_or("unversioned"),
                body["catalog"]["tables"].as_u64().unwrap_or(0)
            );
        }
        Ok(r) => {
            eprintln!("wfreport-cli: server unhealthy (HTTP {})", r.status());
            std::process::exit(1);
        }
        Err(e) => {
            eprintln!("wfreport-cli: cannot reach {}: {}", url, e);
            std::process::exit(1);
        }
    }

    Ok(())
}

// ============================================================================
// Main
// ============================================================================

fn main() {
    let cli = Cli::parse();
    let server = cli.server.trim_end_matches('/').to_string();

    let result = match cli.command {
        Commands::Report {
            question,
            anchor,
            mentioned,
            filters,
            limit,
            time_column,
            since,
            until,
            json,
        } => match build_request(
            &question,
            &anchor,
            &mentioned,
            &filters,
            limit,
            time_column.as_deref(),
            since.as_deref(),
            until.as_deref(),
        ) {
            Ok(body) => do_report(&server, &body, json),
            Err(e) => Err(anyhow::anyhow!(e)),
        },
        Commands::Status => do_status(&server),
    };

    if let Err(e) = result {
        eprintln!("wfreport-cli: {}", e);
        std::process::exit(1);
    }
}

// ============================================================================
// Tests
// ============================================================================
