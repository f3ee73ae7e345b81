//! outbox CLI — operator interface to the email outbox.

use clap::{Parser, Subcommand};
use email_outbox::config::{Config, OracleConfig, Store};
use email_outbox::db::Db;
use email_outbox::model::Email;
use email_outbox::outbox::{Outbox, ProbeOutbox, SkipLockedOutbox, Strategy};
use email_outbox::telemetry::{TelemetryConfig, init_telemetry};
use email_outbox::worker::{BoxError, Handler, Worker, WorkerConfig};
use secrecy::ExposeSecret;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;

#[derive(Parser)]
#[command(name = "outbox", about = "Email outbox with non-blocking concurrent claims")]
struct Cli {
    /// Claim strategy: skip-locked or probe (overrides OUTBOX_STRATEGY)
    #[arg(long, global = true)]
    strategy: Option<Strategy>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create the outbox table (and claim routines for the probe strategy)
    Migrate,
    /// Delete every email in the outbox
    Reset,
    /// Count emails in the outbox, claimed or not
    Count,
    /// Insert an email
    Enqueue {
        recipient: String,
        subject: String,
        body: String,
    },
    /// Show the email the next claim would lock, then release it
    Peek,
    /// Run workers until Ctrl-C
    Work {
        /// Number of concurrent workers
        #[arg(long, default_value_t = 4)]
        workers: usize,
    },
    /// Insert emails, hold many concurrent claims open, report claim latency
    Bench {
        /// Emails to insert first
        #[arg(long, default_value_t = 1000)]
        messages: usize,
        /// Concurrent transactions, each claiming once before any commits.
        /// The Postgres pool grows past DB_MAX_CONNECTIONS to fit them.
        #[arg(long, default_value_t = 100)]
        transactions: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;

    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "email-outbox".to_string(),
        default_filter: config.log_level.clone(),
    })?;

    let strategy = cli.strategy.unwrap_or(config.strategy);
    match &config.store {
        Store::Postgres { url } => {
            let pool_size = pool_size(&cli.command, config.max_connections)?;
            let db = Db::connect(url.expose_secret(), pool_size).await?;
            db.health_check().await?;

            let result = match strategy {
                Strategy::SkipLocked => {
                    let outbox = SkipLockedOutbox::new(db.clone()).fifo(config.fifo);
                    run(outbox, cli.command, &config).await
                }
                Strategy::Probe => run(ProbeOutbox::new(db.clone()), cli.command, &config).await,
            };

            db.close().await;
            result
        }
        Store::Oracle(oracle) => run_oracle(oracle, strategy, cli.command, &config).await,
    }
}

/// Pool size for a command. `bench` pins one connection per open
/// transaction, plus one spare for the final count and commits.
fn pool_size(command: &Command, configured: u32) -> anyhow::Result<u32> {
    match command {
        Command::Bench { transactions, .. } => {
            let needed = u32::try_from(*transactions)
                .ok()
                .and_then(|n| n.checked_add(1))
                .ok_or_else(|| anyhow::anyhow!("--transactions {transactions} is too large"))?;
            Ok(configured.max(needed))
        }
        _ => Ok(configured),
    }
}

#[cfg(feature = "oracle")]
async fn run_oracle(
    oracle: &OracleConfig,
    strategy: Strategy,
    command: Command,
    config: &Config,
) -> anyhow::Result<()> {
    if strategy != Strategy::Probe {
        anyhow::bail!("the oracle backend supports only the probe strategy, not {strategy}");
    }
    let outbox = email_outbox::outbox::OracleOutbox::new(oracle.clone());
    run(outbox, command, config).await
}

#[cfg(not(feature = "oracle"))]
async fn run_oracle(
    _oracle: &OracleConfig,
    _strategy: Strategy,
    _command: Command,
    _config: &Config,
) -> anyhow::Result<()> {
    anyhow::bail!("OUTBOX_BACKEND=oracle needs a build with the `oracle` feature")
}

async fn run<O>(outbox: O, command: Command, config: &Config) -> anyhow::Result<()>
where
    O: Outbox + 'static,
    O::Tx: 'static,
{
    outbox.provision_schema().await?;

    match command {
        Command::Migrate => {
            println!("Schema ready ({} strategy).", outbox.strategy());
            Ok(())
        }
        Command::Reset => {
            outbox.reset_all().await?;
            println!("Outbox emptied.");
            Ok(())
        }
        Command::Count => {
            println!("{}", outbox.count().await?);
            Ok(())
        }
        Command::Enqueue {
            recipient,
            subject,
            body,
        } => {
            let id = outbox.insert(&Email::new(recipient, subject, body)).await?;
            println!("Enqueued: {id}");
            Ok(())
        }
        Command::Peek => cmd_peek(&outbox).await,
        Command::Work { workers } => cmd_work(outbox, workers, config).await,
        Command::Bench {
            messages,
            transactions,
        } => cmd_bench(outbox, messages, transactions).await,
    }
}

async fn cmd_peek<O: Outbox>(outbox: &O) -> anyhow::Result<()> {
    let mut tx = outbox.begin().await?;
    let claimed = outbox.claim_one(&mut tx).await?;
    outbox.rollback(tx).await?;

    match claimed {
        Some(email) => println!("{}", serde_json::to_string_pretty(&email)?),
        None => println!("Nothing to claim: the outbox is empty or every email is locked."),
    }
    Ok(())
}

/// Stands in for an SMTP relay: logs the email and reports success.
struct LogHandler;

impl Handler for LogHandler {
    async fn handle(&self, email: &Email) -> Result<(), BoxError> {
        tracing::info!(
            email.id = ?email.id,
            bytes = email.body.len(),
            "sending email"
        );
        Ok(())
    }
}

async fn cmd_work<O>(outbox: O, workers: usize, config: &Config) -> anyhow::Result<()>
where
    O: Outbox + 'static,
{
    let worker = Worker::new(
        Arc::new(outbox),
        Arc::new(LogHandler),
        WorkerConfig {
            poll_interval: config.poll_interval,
        },
    );

    let mut tasks = JoinSet::new();
    for n in 0..workers {
        let w = worker.clone();
        tasks.spawn(async move { w.run(n).await });
    }

    let ctrl = worker.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        ctrl.shutdown();
    });

    let mut failed = 0;
    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined? {
            eprintln!("worker failed: {e}");
            failed += 1;
            // One fatal error means the store is unusable; stop the rest too.
            worker.shutdown();
        }
    }

    if failed > 0 {
        anyhow::bail!("{failed} worker(s) stopped on errors");
    }
    Ok(())
}

async fn cmd_bench<O>(outbox: O, messages: usize, transactions: usize) -> anyhow::Result<()>
where
    O: Outbox + 'static,
    O::Tx: 'static,
{
    for i in 0..messages {
        outbox
            .insert(&Email::new(format!("test_{i}"), "hello", "world"))
            .await?;
    }
    println!("Inserted {messages} emails ({} strategy).", outbox.strategy());

    let outbox = Arc::new(outbox);
    let mut claims = JoinSet::new();
    for _ in 0..transactions {
        let outbox = Arc::clone(&outbox);
        claims.spawn(async move {
            let mut tx = outbox.begin().await?;
            let start = Instant::now();
            let claimed = outbox.claim_one(&mut tx).await?;
            Ok::<_, email_outbox::error::Error>((tx, claimed, start.elapsed()))
        });
    }

    let mut open = Vec::with_capacity(transactions);
    let mut seen = HashSet::new();
    let mut empty = 0usize;
    let mut slowest = Duration::ZERO;
    let mut total = Duration::ZERO;
    while let Some(joined) = claims.join_next().await {
        let (tx, claimed, elapsed) = joined??;
        match claimed.and_then(|email| email.id) {
            Some(id) => {
                if !seen.insert(id) {
                    anyhow::bail!("email {id} was claimed by two open transactions");
                }
            }
            None => empty += 1,
        }
        slowest = slowest.max(elapsed);
        total += elapsed;
        open.push(tx);
    }

    for tx in open {
        outbox.commit(tx).await?;
    }

    println!(
        "{} claimed, {empty} empty, mean {:?}, slowest {slowest:?}",
        seen.len(),
        total / u32::try_from(transactions.max(1))?,
    );
    println!("Claimed emails were not removed; run `outbox reset` to clear.");
    Ok(())
}
