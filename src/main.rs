use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::info;
use tracing_subscriber::EnvFilter;

use throttle_guard::clock::{Clock, ManualClock};
use throttle_guard::config::GuardConfig;
use throttle_guard::throttle::{client_address, normalize_identifier};
use throttle_guard::Guard;

#[derive(Debug, Parser)]
#[command(name = "throttle-guard", version, about = "Inspect and exercise brute-force throttling policies")]
struct Cli {
    /// YAML configuration file (built-in policies when omitted)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print the effective policy and limiter tables
    Policies,

    /// Replay a sequence of attempts against one endpoint class on a simulated clock
    Simulate {
        /// Endpoint class to exercise
        #[arg(long)]
        class: String,

        /// Client address (resolved like an X-Forwarded-For header when omitted)
        #[arg(long)]
        address: Option<String>,

        /// Logical identifier, e.g. an email address
        #[arg(long)]
        identifier: Option<String>,

        /// Number of attempts
        #[arg(long, default_value_t = 8)]
        attempts: u32,

        /// Simulated seconds between attempts
        #[arg(long, default_value_t = 0)]
        interval_secs: u64,

        /// Wait out every throttle hint instead of retrying on schedule
        #[arg(long)]
        honor_retry: bool,

        /// Attempt number (1-based) that succeeds
        #[arg(long)]
        succeed_at: Option<u32>,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let config = match &cli.config {
        Some(path) => GuardConfig::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => GuardConfig::default(),
    };

    match cli.command {
        Command::Policies => print_policies(&config),
        Command::Simulate {
            class,
            address,
            identifier,
            attempts,
            interval_secs,
            honor_retry,
            succeed_at,
        } => {
            let address = address.unwrap_or_else(|| client_address(|_| None));
            let identifier = identifier.as_deref().and_then(normalize_identifier);
            let plan = SimulationPlan {
                class,
                address,
                identifier,
                attempts,
                interval: Duration::from_secs(interval_secs),
                honor_retry,
                succeed_at,
            };
            simulate(config, &plan)
        }
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn print_policies(config: &GuardConfig) -> anyhow::Result<()> {
    let output = json!({
        "policies": config.policies,
        "rate_limits": config.rate_limits,
        "rate_limits_enabled": config.rate_limits_enabled,
        "sweep": config.sweep,
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

struct SimulationPlan {
    class: String,
    address: String,
    identifier: Option<String>,
    attempts: u32,
    interval: Duration,
    honor_retry: bool,
    succeed_at: Option<u32>,
}

fn simulate(config: GuardConfig, plan: &SimulationPlan) -> anyhow::Result<()> {
    let clock = Arc::new(ManualClock::new(chrono::Utc::now()));
    let start = clock.now();
    let guard = Guard::with_clock(config, clock.clone())?;
    let engine = guard.engine();
    let identifier = plan.identifier.as_deref();

    info!(
        class = %plan.class,
        address = %plan.address,
        identifier = ?identifier,
        attempts = plan.attempts,
        "Starting simulation"
    );

    for attempt in 1..=plan.attempts {
        if attempt > 1 {
            clock.advance(plan.interval);
        }

        let mut decision = engine.check(&plan.class, &plan.address, identifier)?;
        if !decision.allowed && plan.honor_retry {
            clock.advance(decision.retry_after);
            decision = engine.check(&plan.class, &plan.address, identifier)?;
        }

        let success = decision.allowed && plan.succeed_at == Some(attempt);
        if decision.allowed {
            engine.record_attempt(&plan.class, &plan.address, identifier, success)?;
        }

        let outcome = if !decision.allowed {
            "denied"
        } else if success {
            "success"
        } else {
            "failure"
        };

        let line = json!({
            "attempt": attempt,
            "elapsed_secs": (clock.now() - start).num_seconds(),
            "allowed": decision.allowed,
            "reason": decision.reason,
            "retry_after_secs": decision.retry_after_secs(),
            "remaining_attempts": decision.remaining_attempts,
            "blocked_until": decision.blocked_until,
            "outcome": outcome,
        });
        println!("{}", serde_json::to_string(&line)?);
    }

    Ok(())
}
