use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::error;
use tracing_subscriber::EnvFilter;

use brief_core::Digest;
use brief_runner::{format_age, format_timestamp, Origin, RefreshError, RefreshOutcome, Runner};

/// Exit status when there is no digest to serve at all.
const EXIT_UNAVAILABLE: u8 = 2;

#[derive(Parser)]
#[command(name = "brief", version)]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create .brief/brief.toml and the cache directory
    Init,

    /// Serve the digest, refreshing it first if it is stale
    Refresh {
        /// Override the configured TTL for this run
        #[arg(long)]
        ttl_secs: Option<u64>,
    },

    /// Print the cached digest without refreshing
    Show,

    /// Show when the cache was last refreshed and when it goes stale
    Status,

    /// List every recorded refresh, oldest first
    History,
}

fn print_digest(d: &Digest) {
    println!("{}", d.summary);
    println!();
    println!("Overall sentiment is currently trending {}.", d.sentiment);
}

fn main() -> anyhow::Result<ExitCode> {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let cli = Cli::parse();
    let repo_root = std::env::current_dir()?;

    match cli.cmd {
        Command::Init => {
            Runner::init_repo(&repo_root)?;
            println!("Initialized brief in {}", repo_root.display());
        }
        Command::Refresh { ttl_secs } => {
            let mut cfg = Runner::load_config(&repo_root)?;
            if let Some(ttl) = ttl_secs {
                cfg.cache.ttl_secs = ttl;
            }
            let r = Runner::from_config(repo_root, cfg)?;
            match r.refresh() {
                Ok(report) => match report.outcome {
                    RefreshOutcome::Done { digest, origin } => {
                        print_digest(&digest);
                        if let Origin::Degraded(e) = origin {
                            eprintln!("(showing last good digest; refresh failed: {e})");
                        }
                    }
                    RefreshOutcome::Unavailable { missing, cause } => {
                        match cause {
                            Some(e) => eprintln!("No digest available yet ({missing} missing): {e}"),
                            None => eprintln!("No digest available yet ({missing} missing)"),
                        }
                        return Ok(ExitCode::from(EXIT_UNAVAILABLE));
                    }
                },
                Err(RefreshError::Persist { digest, source }) => {
                    error!("refresh succeeded but could not be saved: {source}");
                    print_digest(&digest);
                    return Ok(ExitCode::FAILURE);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Command::Show => {
            let r = Runner::open(repo_root)?;
            match r.show()? {
                Some(d) => print_digest(&d),
                None => {
                    eprintln!("No digest has been stored yet; run `brief refresh`.");
                    return Ok(ExitCode::from(EXIT_UNAVAILABLE));
                }
            }
        }
        Command::Status => {
            let r = Runner::open(repo_root)?;
            let st = r.status()?;
            match st.last_refresh_unix {
                Some(last) => {
                    let age = Duration::from_secs(st.now_unix.abs_diff(last));
                    println!("Last refresh: {} ago ({} refreshes recorded)", format_age(age), st.refresh_count);
                }
                None => println!("Last refresh: never"),
            }
            if st.freshness.should_refresh {
                println!("State: stale, next `brief refresh` will call the producer");
            } else {
                println!("State: fresh for another {}", format_age(st.next_due_in));
            }
            println!("TTL: {}", format_age(r.cfg.ttl()));
            if let Some(fp) = st.fingerprint {
                println!("Digest: {}", fp);
            }
        }
        Command::History => {
            let r = Runner::open(repo_root)?;
            let history = r.history()?;
            println!("Refreshes: {}", history.len());
            for rec in history {
                println!("- {}", format_timestamp(rec.timestamp_unix));
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}
