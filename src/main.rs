use std::net::IpAddr;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Args as ClapArgs;
use clap::Parser;
use clap::Subcommand;
use meterflow::broker::Broker;
use meterflow::config::DispatcherConfig;
use meterflow::config::StandbyPolicy;
use meterflow::config::StoreBackend;
use meterflow::config::UnitConfig;
use meterflow::dispatcher::Dispatcher;
use meterflow::logging;
use meterflow::metrics::Metrics;
use meterflow::partition::SplitRatio;
use meterflow::record::Batch;
use meterflow::recovery::store;
use meterflow::recovery::BatchState;
use meterflow::unit::Unit;
use meterflow::webserver::start_server_runtime;
use meterflow::webserver::ServerHandle;
use meterflow::webserver::StatusBoard;

#[derive(Parser, Debug)]
#[command(name = "meterflow")]
#[command(version)]
#[command(about = "Fault-tolerant dispatch and checkpointed processing of meter readings", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    #[arg(short, long, global = true, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Split a CSV batch and push the shares to up to two units.
    Dispatch(DispatchArgs),
    /// Recover stalled batches, then take one share from the dispatcher and process it.
    Unit(UnitArgs),
    /// Take over every stalled batch in a checkpoint store.
    Recover(StoreArgs),
    /// List the batches in a checkpoint store and their state.
    Inspect(StoreArgs),
}

#[derive(ClapArgs, Debug)]
struct DispatchArgs {
    /// CSV file with one reading per row.
    #[arg(short, long)]
    input: PathBuf,

    /// JSON dispatcher config; flags override it.
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[arg(long)]
    listen: Option<SocketAddr>,

    #[arg(long)]
    active_peer: Option<IpAddr>,

    /// Seconds to wait for each unit to connect.
    #[arg(long)]
    accept_timeout: Option<f64>,

    /// Seconds a unit has to send the failure signal.
    #[arg(long)]
    receive_timeout: Option<f64>,

    /// Fraction of the batch in the minority share.
    #[arg(long)]
    split: Option<f64>,

    #[arg(long, value_enum)]
    standby: Option<StandbyPolicy>,

    #[arg(long)]
    shuffle_seed: Option<u64>,

    #[arg(long)]
    metrics_addr: Option<SocketAddr>,
}

#[derive(ClapArgs, Debug)]
struct UnitArgs {
    /// JSON unit config; flags override it.
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[arg(short, long)]
    dispatcher: Option<SocketAddr>,

    #[arg(long)]
    checkpoint_dir: Option<PathBuf>,

    #[arg(long, value_enum)]
    backend: Option<StoreBackend>,

    #[arg(long)]
    workers: Option<usize>,

    /// Send the failure signal instead of taking work.
    #[arg(long)]
    simulate_breakdown: bool,

    /// Also write the final output here.
    #[arg(long)]
    export: Option<PathBuf>,

    #[arg(long)]
    metrics_addr: Option<SocketAddr>,
}

#[derive(ClapArgs, Debug)]
struct StoreArgs {
    /// JSON unit config; flags override it.
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[arg(long)]
    checkpoint_dir: Option<PathBuf>,

    #[arg(long, value_enum)]
    backend: Option<StoreBackend>,
}

impl StoreArgs {
    fn unit_config(&self) -> anyhow::Result<UnitConfig> {
        let mut config = match &self.config {
            Some(path) => UnitConfig::load(path)
                .with_context(|| format!("loading unit config {path:?}"))?,
            None => UnitConfig::default(),
        };
        if let Some(dir) = &self.checkpoint_dir {
            config.checkpoint_dir = dir.clone();
        }
        if let Some(backend) = self.backend {
            config.backend = backend;
        }
        Ok(config)
    }
}

fn seconds(secs: f64, flag: &str) -> anyhow::Result<std::time::Duration> {
    std::time::Duration::try_from_secs_f64(secs).with_context(|| format!("--{flag} {secs}"))
}

fn serve_metrics(
    addr: Option<SocketAddr>,
    metrics: &Arc<Metrics>,
    status: &Arc<StatusBoard>,
) -> anyhow::Result<Option<ServerHandle>> {
    addr.map(|addr| {
        start_server_runtime(addr, metrics.clone(), status.clone())
            .with_context(|| format!("starting metrics server on {addr}"))
    })
    .transpose()
}

fn dispatch(args: DispatchArgs) -> anyhow::Result<()> {
    let mut config = match &args.config {
        Some(path) => DispatcherConfig::load(path)
            .with_context(|| format!("loading dispatcher config {path:?}"))?,
        None => DispatcherConfig::default(),
    };
    if let Some(listen) = args.listen {
        config.listen = listen;
    }
    if let Some(active_peer) = args.active_peer {
        config.active_peer = active_peer;
    }
    if let Some(secs) = args.accept_timeout {
        config.accept_timeout = seconds(secs, "accept-timeout")?;
    }
    if let Some(secs) = args.receive_timeout {
        config.receive_timeout = seconds(secs, "receive-timeout")?;
    }
    if let Some(split) = args.split {
        config.split = SplitRatio::new(split)?;
    }
    if let Some(standby) = args.standby {
        config.standby = standby;
    }
    if args.shuffle_seed.is_some() {
        config.shuffle_seed = args.shuffle_seed;
    }
    if args.metrics_addr.is_some() {
        config.metrics_addr = args.metrics_addr;
    }
    config.validate()?;

    let payload =
        std::fs::read(&args.input).with_context(|| format!("reading input {:?}", args.input))?;
    let batch = Batch::from_csv(&payload).with_context(|| format!("parsing input {:?}", args.input))?;

    let metrics = Metrics::new()?;
    let status = StatusBoard::new();
    let _server = serve_metrics(config.metrics_addr, &metrics, &status)?;

    let broker = Broker::bind(config.listen, config.accept_timeout, config.active_peer)
        .with_context(|| format!("listening on {}", config.listen))?;
    let dispatcher = Dispatcher::new(config, metrics);
    let report = dispatcher.serve(&broker, batch)?;
    status.publish(&report)?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn unit(args: UnitArgs) -> anyhow::Result<()> {
    let mut config = match &args.config {
        Some(path) => {
            UnitConfig::load(path).with_context(|| format!("loading unit config {path:?}"))?
        }
        None => UnitConfig::default(),
    };
    if let Some(dispatcher) = args.dispatcher {
        config.dispatcher = dispatcher;
    }
    if let Some(dir) = args.checkpoint_dir {
        config.checkpoint_dir = dir;
    }
    if let Some(backend) = args.backend {
        config.backend = backend;
    }
    if let Some(workers) = args.workers {
        config.workers = workers;
    }
    if args.simulate_breakdown {
        config.simulate_breakdown = true;
    }
    if args.export.is_some() {
        config.export = args.export;
    }

    let metrics = Metrics::new()?;
    let status = StatusBoard::new();
    let _server = serve_metrics(args.metrics_addr, &metrics, &status)?;

    let unit = Unit::new(config, metrics)?;
    let report = unit.run()?;
    status.publish(&report)?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn recover(args: StoreArgs) -> anyhow::Result<()> {
    let config = args.unit_config()?;
    let unit = Unit::new(config, Metrics::new()?)?;
    let outcomes = unit.recover_all().context("recovery stopped")?;
    println!("{}", serde_json::to_string_pretty(&outcomes)?);
    Ok(())
}

fn inspect(args: StoreArgs) -> anyhow::Result<()> {
    let config = args.unit_config()?;
    let store = store::open(config.backend, &config.checkpoint_dir)?;
    for batch in store.batches()? {
        let state = BatchState::inspect(store.as_ref(), batch)?;
        println!("{batch}\t{state}");
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let level = logging::parse_level(&args.log_level)?;
    let dispatch_logs = logging::dispatch(level);

    tracing::dispatcher::with_default(&dispatch_logs, || match args.command {
        Command::Dispatch(args) => dispatch(args),
        Command::Unit(args) => unit(args),
        Command::Recover(args) => recover(args),
        Command::Inspect(args) => inspect(args),
    })
}
