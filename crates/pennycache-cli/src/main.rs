//! pennycache - command-line access to PennyPilot data through the
//! offline-first cache.
//!
//! Reads are served from the persisted query cache when fresh and fetched
//! from the remote store otherwise; writes go straight to the remote store
//! and invalidate the affected cached queries.

use std::io;
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use pennycache_core::models::{is_valid_month, NewTransaction};
use pennycache_core::utils::{format_amount, format_date, truncate_string};
use pennycache_core::{
    ApiClient, Config, Session, SessionProvider, SyncContext, DEFAULT_TRANSACTION_LIMIT,
};

// ============================================================================
// Constants
// ============================================================================

/// Overrides `api_base_url` from the config file.
const API_URL_ENV: &str = "PENNYCACHE_API_URL";

/// Set to `1` to also log to a daily file in the cache directory.
const LOG_FILE_ENV: &str = "PENNYCACHE_LOG_FILE";

const LOG_FILE_PREFIX: &str = "pennycache.log";

/// Notes longer than this are cut in listings.
const NOTE_DISPLAY_WIDTH: usize = 40;

const USAGE: &str = "\
Usage: pennycache <command>

Commands:
  recent [limit]          Show the most recent transactions
  categories              List spending categories
  settings                Show income, budget and reminder settings
  budgets <YYYY-MM>       Show category budgets for a month
  add <amount> [note...]  Log a new transaction
  delete <id>             Delete a transaction
  refresh                 Mark all cached data stale
  sign-out                Forget the saved session and cached data
";

#[derive(Debug, PartialEq)]
enum Command {
    Recent(usize),
    Categories,
    Settings,
    Budgets(String),
    Add { amount: f64, note: Option<String> },
    Delete(String),
    Refresh,
    SignOut,
    Help,
}

fn parse_args(args: &[String]) -> Result<Command> {
    let Some(name) = args.first() else {
        return Ok(Command::Help);
    };
    let rest = &args[1..];
    let command = match name.as_str() {
        "recent" => match rest.first() {
            Some(limit) => Command::Recent(
                limit
                    .parse()
                    .with_context(|| format!("Invalid limit: {}", limit))?,
            ),
            None => Command::Recent(DEFAULT_TRANSACTION_LIMIT),
        },
        "categories" => Command::Categories,
        "settings" => Command::Settings,
        "budgets" => {
            let month = rest.first().context("budgets needs a month (YYYY-MM)")?;
            if !is_valid_month(month) {
                bail!("Invalid month {:?}, expected YYYY-MM", month);
            }
            Command::Budgets(month.clone())
        }
        "add" => {
            let amount = rest.first().context("add needs an amount")?;
            let amount: f64 = amount
                .parse()
                .with_context(|| format!("Invalid amount: {}", amount))?;
            let note = (rest.len() > 1).then(|| rest[1..].join(" "));
            Command::Add { amount, note }
        }
        "delete" => Command::Delete(rest.first().context("delete needs a transaction id")?.clone()),
        "refresh" => Command::Refresh,
        "sign-out" => Command::SignOut,
        "help" | "--help" | "-h" => Command::Help,
        other => bail!("Unknown command: {}\n\n{}", other, USAGE),
    };
    Ok(command)
}

/// Initialize the tracing subscriber for logging
fn init_tracing(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (Some(fmt::layer().with_ansi(false).with_writer(writer)), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .with(filter)
        .init();
    guard
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = parse_args(&args)?;
    if command == Command::Help {
        print!("{}", USAGE);
        return Ok(());
    }

    let mut config = Config::load()?;
    if let Ok(url) = std::env::var(API_URL_ENV) {
        config.api_base_url = url;
    }
    let cache_dir = config.cache_dir()?;
    let log_to_file = std::env::var(LOG_FILE_ENV).map(|v| v == "1").unwrap_or(false);
    let _guard = init_tracing(log_to_file.then_some(cache_dir.as_path()));
    info!("pennycache starting");

    let mut session = Session::new(cache_dir.clone());
    if !session.load()? {
        bail!("No saved session. Sign in with the PennyPilot app first.");
    }
    let data = session
        .data
        .clone()
        .context("No saved session. Sign in with the PennyPilot app first.")?;
    if data.needs_refresh() {
        warn!(
            minutes_left = data.minutes_until_expiry(),
            "Session token expires soon"
        );
    }

    let client = ApiClient::new(&config.api_base_url, config.request_timeout())?
        .with_token(data.id_token.clone());
    let provider = SessionProvider::signed_in(data.user_id.clone());
    let ctx = SyncContext::init(
        config.cache.to_cache_config(),
        Arc::new(client),
        provider,
        Some(cache_dir),
    )
    .await;

    let result = run(&ctx, command, &mut session).await;
    ctx.teardown().await;

    if config.last_user_id.as_deref() != Some(data.user_id.as_str()) {
        config.last_user_id = Some(data.user_id);
        if let Err(e) = config.save() {
            warn!(error = %e, "Failed to save config");
        }
    }

    info!("pennycache done");
    result
}

async fn run(ctx: &SyncContext<ApiClient>, command: Command, session: &mut Session) -> Result<()> {
    let queries = ctx.queries();
    let mutations = ctx.mutations();
    let now = Utc::now();

    match command {
        Command::Recent(limit) => {
            let transactions = queries.fetch_transactions(limit).await?;
            let age = queries.transactions(limit).age_display(now);
            if transactions.is_empty() {
                println!("No transactions yet.");
            }
            for tx in &transactions {
                let date = tx
                    .occurred_at()
                    .map(format_date)
                    .unwrap_or_else(|| "-".to_string());
                let note = tx.note.as_deref().unwrap_or("");
                println!(
                    "{:<12} {:>16}  {:<24} {}",
                    date,
                    format_amount(tx.amount, tx.currency()),
                    truncate_string(note, NOTE_DISPLAY_WIDTH),
                    tx.id
                );
            }
            println!("(updated {})", age);
        }
        Command::Categories => {
            for category in queries.fetch_categories().await? {
                println!("{} {}", category.icon, category.name);
            }
        }
        Command::Settings => match queries.fetch_settings().await? {
            Some(settings) => {
                println!(
                    "Monthly income:  {}",
                    format_amount(settings.monthly_income, &settings.currency)
                );
                println!(
                    "Monthly budget:  {}",
                    format_amount(settings.monthly_budget, &settings.currency)
                );
                println!("Daily reminder:  {}", settings.reminder_time);
            }
            None => println!("No settings saved yet."),
        },
        Command::Budgets(month) => {
            let budgets = queries.fetch_category_budgets(&month).await?;
            if budgets.is_empty() {
                println!("No budgets for {}.", month);
            }
            for budget in budgets {
                println!("{:<24} {:>12.2}", budget.category_id, budget.amount);
            }
        }
        Command::Add { amount, note } => {
            let mut payload = NewTransaction::new(amount);
            if let Some(note) = note {
                payload = payload.with_note(note);
            }
            let id = mutations.add_transaction(payload).await?;
            println!("Added transaction {}", id);
        }
        Command::Delete(id) => {
            mutations.delete_transaction(&id).await?;
            println!("Deleted transaction {}", id);
        }
        Command::Refresh => {
            let count = ctx.refresh_all();
            println!("Marked {} cached queries stale.", count);
        }
        Command::SignOut => {
            ctx.session().sign_out();
            session.clear()?;
            println!("Signed out. Cached data cleared.");
        }
        Command::Help => print!("{}", USAGE),
    }
    Ok(())
}
