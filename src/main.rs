use anyhow::{Context, Result};
use chrono::Local;
use clap::Parser;
use energy_diverter::{
    api,
    cli::{BoostArgs, Cli, Command},
    config::Config,
    controller::{Collaborators, ControlLoop},
    domain::{BoostRequest, DeviceId},
    hardware::DeviceFactory,
    optimizer::BoostScheduler,
    prices::build_price_provider,
    repo::FileStateStore,
    telemetry,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    telemetry::init_tracing();

    let cli = Cli::parse();
    let cfg = Config::load(&cli.config)?;
    let store = Arc::new(FileStateStore::new(&cfg.state.path));
    let control = Arc::new(build_loop(&cfg, store)?);
    control.restore().await?;

    match cli.command {
        Command::Run => run(control, &cfg).await,
        Command::Once => {
            let report = control.run_once().await;
            let poll = report.poll.context("device poll failed")?;
            print_json(&poll)?;
            let boost = report.boost.context("boost pass failed")?;
            print_json(&boost)
        }
        Command::Boost(args) => boost(&control, &args).await,
        Command::Reset { device } => {
            let device = DeviceId::new(device);
            if !control.reset_device(&device).await {
                anyhow::bail!("unknown device {device}");
            }
            println!("{device} reset to UNKNOWN");
            Ok(())
        }
        Command::Status => print_json(&control.status().await),
    }
}

fn build_loop(cfg: &Config, store: Arc<FileStateStore>) -> Result<ControlLoop> {
    let devices = cfg.managed_devices()?;
    let mut factory = DeviceFactory::new(cfg.hardware.mode)
        .with_timeout(Duration::from_secs(cfg.controller.call_timeout_seconds));
    if let Some(url) = &cfg.hardware.gateway_url {
        factory = factory.with_gateway(url.clone(), cfg.hardware.gateway_token.clone());
    }
    let adapters = factory.create(&devices)?;

    let prices = build_price_provider(
        cfg.prices.provider,
        &cfg.prices.base_url,
        &cfg.prices.product_code,
        Duration::from_secs(cfg.prices.http_timeout_seconds),
        Duration::from_secs(cfg.prices.cache_ttl_seconds),
    )?;

    Ok(ControlLoop::new(
        Collaborators {
            states: adapters.states,
            commands: adapters.commands,
            prices,
        },
        cfg.engine(),
        BoostScheduler::new(cfg.scheduler_constraints()),
        cfg.loop_settings(),
        devices,
    )
    .with_store(store))
}

async fn run(control: Arc<ControlLoop>, cfg: &Config) -> Result<()> {
    let cancel = CancellationToken::new();
    let loop_task = tokio::spawn(control.clone().run_until(cancel.clone()));

    if cfg.server.enabled {
        let app = api::router(control, cfg)?;
        let addr = cfg.server.socket_addr()?;
        if cfg.server.host == "0.0.0.0" {
            warn!("API bound to 0.0.0.0, reachable from the network");
        }
        info!(%addr, "starting API server");
        let listener = tokio::net::TcpListener::bind(addr).await?;
        let shutdown = cancel.clone();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                telemetry::shutdown_signal().await;
                shutdown.cancel();
            })
            .await?;
    } else {
        telemetry::shutdown_signal().await;
    }

    cancel.cancel();
    loop_task.await.context("control loop task")?;
    warn!("shutdown complete");
    Ok(())
}

async fn boost(control: &ControlLoop, args: &BoostArgs) -> Result<()> {
    let device = DeviceId::new(args.device.clone());
    let now = Local::now().fixed_offset();

    let request = if args.reset {
        BoostRequest::clear()
    } else {
        if args.target_soc.is_some() {
            // SOC is only known after a poll
            if let Err(e) = control.state_tick().await {
                warn!(error = %e, "could not read the current vehicle SOC");
            }
        }
        control.resolve_order(&device, &args.order(), now).await?
    };

    if args.dry_run {
        let plan = control.plan(&device, &request, now).await?;
        return print_json(&plan);
    }

    if !control.set_request(&device, request).await {
        anyhow::bail!("unknown device {device}");
    }
    let report = control.reschedule_at(now).await?;
    control.persist().await?;
    if let Some(error) = report.errors.get(&device) {
        anyhow::bail!("boost for {device} failed: {error}");
    }
    print_json(&report)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
