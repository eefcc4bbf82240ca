use std::{process::ExitCode, sync::Arc, time::Duration};

use clap::Parser;
use logspray::{
    pool::{Config, Pool},
    profile,
};
use tracing::{error, info, warn};
use tracing_subscriber::{util::SubscriberInitExt, EnvFilter};

#[derive(thiserror::Error, Debug)]
enum Error {
    #[error(transparent)]
    Profile(#[from] profile::Error),
    #[error(transparent)]
    Pool(#[from] logspray::pool::Error),
    #[error("--eps is only meaningful with --profile custom")]
    EpsWithoutCustom,
    #[error("--profile custom requires --eps")]
    CustomWithoutEps,
}

#[derive(Parser)]
#[clap(version, about = "UDP syslog load generator for SIEM ingest testing", long_about = None)]
struct Cli {
    /// Destination host; traffic goes to its standard syslog port 514
    #[clap(long)]
    target: String,
    /// Load tier: 100k|500k|1m|2m|4m|custom
    #[clap(long, default_value = "1m")]
    profile: String,
    /// Aggregate target EPS, with --profile custom only
    #[clap(long)]
    eps: Option<u64>,
    /// Run time in minutes, 0 means unlimited
    #[clap(long, default_value_t = 0)]
    duration: u64,
    /// One datagram per record instead of newline-joined batches
    #[clap(long)]
    datagram_per_event: bool,
    /// Run the 30s advisory auto-tuner
    #[clap(long)]
    auto_tune: bool,
}

impl Cli {
    fn resolve_profile(&self) -> Result<profile::Profile, Error> {
        match (self.profile.as_str(), self.eps) {
            ("custom", Some(eps)) => Ok(profile::custom(eps)?),
            ("custom", None) => Err(Error::CustomWithoutEps),
            (_, Some(_)) => Err(Error::EpsWithoutCustom),
            (name, None) => Ok(profile::get(name)?),
        }
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .finish()
        .init();

    let cli = Cli::parse();

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            error!("runtime construction failed: {err}");
            return ExitCode::from(1);
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(RunError::Init(err)) => {
            error!("initialisation failed: {err}");
            ExitCode::from(1)
        }
        Err(RunError::Runtime(err)) => {
            error!("fatal runtime error: {err}");
            ExitCode::from(2)
        }
    }
}

enum RunError {
    /// Failures before traffic started; exit code 1.
    Init(Error),
    /// Failures after a clean start; exit code 2.
    Runtime(Error),
}

async fn run(cli: Cli) -> Result<(), RunError> {
    let profile = cli.resolve_profile().map_err(RunError::Init)?;
    info!(
        profile = %profile.name,
        target_eps = profile.target_eps,
        workers = profile.worker_count,
        mode = ?profile.precision_mode,
        target = %cli.target,
        "logspray starting"
    );

    let mut pool = Pool::new(Config {
        target_host: cli.target,
        profile,
        seed: None,
        datagram_per_event: cli.datagram_per_event,
        auto_tune: cli.auto_tune,
    });

    pool.initialize()
        .map_err(|err| RunError::Init(err.into()))?;
    pool.start()
        .await
        .map_err(|err| RunError::Init(err.into()))?;

    let status = tokio::spawn(status_loop(pool.subscribe()));

    let deadline = if cli.duration > 0 {
        info!(minutes = cli.duration, "bounded run");
        Some(Duration::from_secs(cli.duration * 60))
    } else {
        None
    };

    wait_for_shutdown(deadline).await;

    let result = pool.stop().await;
    status.abort();
    result.map_err(|err| RunError::Runtime(err.into()))?;

    let last = pool.snapshot();
    info!(
        total_sent = last.total_sent,
        total_errors = last.total_errors,
        achievement_pct = format!("{:.1}", last.achievement_pct),
        consistency = format!("{:.0}", last.consistency_score),
        "logspray done"
    );
    Ok(())
}

async fn wait_for_shutdown(deadline: Option<Duration>) {
    let timer = async {
        match deadline {
            Some(limit) => tokio::time::sleep(limit).await,
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(err) = result {
                warn!("ctrl-c handler failed: {err}");
            }
            info!("interrupt received, shutting down");
        }
        () = timer => {
            info!("run duration elapsed, shutting down");
        }
    }
}

/// Log a one-line status summary every ten seconds from the snapshot
/// stream.
async fn status_loop(
    mut stream: tokio::sync::broadcast::Receiver<Arc<logspray::telemetry::PoolMetrics>>,
) {
    let mut seen = 0_u64;
    loop {
        match stream.recv().await {
            Ok(snapshot) => {
                seen += 1;
                if seen % 10 == 0 {
                    info!(
                        eps = snapshot.total_eps,
                        target = snapshot.target_eps,
                        achievement_pct = format!("{:.1}", snapshot.achievement_pct),
                        active_workers = snapshot.active_workers,
                        cpu_pct = format!("{:.1}", snapshot.system.cpu_pct),
                        memory_mb = snapshot.system.memory_bytes / (1024 * 1024),
                        tx_mbps = format!("{:.1}", snapshot.system.tx_mbps_current),
                        "status"
                    );
                }
            }
            Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
            Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
        }
    }
}
