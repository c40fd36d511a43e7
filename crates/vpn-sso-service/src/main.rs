//! # VPN SSO service
//!
//! Runs the connection orchestrator for one gateway: looks for a cached
//! session token, falls back to the browser SSO helper and keeps the tunnel
//! binary running until interrupted. The tunnel configuration is printed as
//! JSON once the tunnel is up.

mod args;

use anyhow::Context;
use args::Args;
use clap::Parser;
use console::style;
use crossbeam_channel::{bounded, select, Receiver};
use log::{error, info, warn};
use std::process::ExitCode;
use std::time::{Duration, Instant};
use vpn_sso::{
    init_logger, CancellationToken, ConnectionConfig, ConnectionState, ServiceEvent,
    ServiceSettings, VpnService,
};

const RECONNECT_DELAY: Duration = Duration::from_secs(5);

fn main() -> ExitCode {
    let args = Args::parse();
    init_logger(args.level.into());

    match run(args) {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> anyhow::Result<ExitCode> {
    let mut settings = ServiceSettings::load(&args.settings)
        .with_context(|| format!("failed to read settings from {}", args.settings.display()))?;
    if let Some(kind) = args.cache_backend {
        settings.cache_backend = kind.into();
    }

    let service = VpnService::builder(settings).build()?;

    if args.clear_cache {
        let target = args.gateway.as_deref().map(|gw| (gw, args.protocol));
        service.clear_cache(target)?;
        match target {
            Some((gw, proto)) => info!("Cached credentials for {} ({}) removed.", gw, proto),
            None => info!("All cached credentials removed ({}).", service.cache_backend()),
        }
        return Ok(ExitCode::SUCCESS);
    }

    let config = connection_config(&args)?;
    let interrupts = interrupt_channel()?;

    if args.authenticate_only {
        return authenticate_only(&service, &config, interrupts);
    }

    run_connection(&service, config, &interrupts, &args)
}

fn connection_config(args: &Args) -> anyhow::Result<ConnectionConfig> {
    let config = match (&args.config, &args.gateway) {
        (Some(path), _) => ConnectionConfig::load(path)
            .with_context(|| format!("failed to read connection config {}", path.display()))?,
        (None, Some(gateway)) => {
            let mut config = ConnectionConfig::new(gateway.clone(), args.protocol);
            config.username = args.user.clone();
            config.usergroup = args.usergroup.clone();
            config.extra_args = args.extra_args.clone();
            config.cache_hours = args.cache_hours;
            config.external_browser = args.external_browser;
            config
        }
        (None, None) => anyhow::bail!("either --config or --gateway is required"),
    };
    config.validate()?;
    Ok(config)
}

/// Ctrl-C and SIGTERM both arrive here.
fn interrupt_channel() -> anyhow::Result<Receiver<()>> {
    let (tx, rx) = bounded(4);
    ctrlc::set_handler(move || {
        let _ = tx.try_send(());
    })
    .context("failed to install the signal handler")?;
    Ok(rx)
}

fn authenticate_only(
    service: &VpnService,
    config: &ConnectionConfig,
    interrupts: Receiver<()>,
) -> anyhow::Result<ExitCode> {
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        std::thread::spawn(move || {
            if interrupts.recv().is_ok() {
                cancel.cancel();
            }
        });
    }

    match service.authenticate(config, &cancel) {
        Ok(credential) => {
            println!(
                "{} token of {} bytes{}",
                style("Authenticated:").green().bold(),
                credential.token.len(),
                if credential.fingerprint.is_some() {
                    ", server fingerprint received"
                } else {
                    ""
                }
            );
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            error!("{}", e.user_message());
            Ok(ExitCode::FAILURE)
        }
    }
}

fn run_connection(
    service: &VpnService,
    config: ConnectionConfig,
    interrupts: &Receiver<()>,
    args: &Args,
) -> anyhow::Result<ExitCode> {
    service.connect(config.clone())?;
    let mut failed = false;
    let mut reconnect_at = None;

    loop {
        let timeout = reconnect_at
            .map(|at: Instant| at.saturating_duration_since(Instant::now()))
            .unwrap_or(Duration::from_secs(3600));

        select! {
            recv(interrupts) -> _ => {
                info!("Interrupted, disconnecting...");
                service.disconnect();
                return Ok(ExitCode::SUCCESS);
            }
            recv(service.events()) -> event => {
                let Ok(event) = event else {
                    anyhow::bail!("connection service stopped unexpectedly");
                };
                if args.json {
                    print_json(&event);
                }
                match event {
                    ServiceEvent::StateChanged(state) => {
                        if !args.json {
                            eprintln!("{} {}", style("state:").dim(), style(state).bold());
                        }
                        if matches!(state, ConnectionState::Idle | ConnectionState::Failed) {
                            failed = state == ConnectionState::Failed;
                            if !args.persist {
                                break;
                            }
                            info!("Reconnecting in {} seconds", RECONNECT_DELAY.as_secs());
                            reconnect_at = Some(Instant::now() + RECONNECT_DELAY);
                        }
                    }
                    ServiceEvent::TunnelReady(tunnel) => {
                        if !args.json {
                            println!("{}", serde_json::to_string_pretty(&tunnel)?);
                        }
                    }
                    ServiceEvent::Failed(e) => warn!("{}", e.user_message()),
                    ServiceEvent::Log { .. } => {}
                }
            }
            default(timeout) => {
                if reconnect_at.take().is_some() {
                    if let Err(e) = service.connect(config.clone()) {
                        warn!("Reconnect failed: {}", e);
                        reconnect_at = Some(Instant::now() + RECONNECT_DELAY);
                    }
                }
            }
        }
    }

    Ok(if failed {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

fn print_json(event: &ServiceEvent) {
    let value = match event {
        ServiceEvent::StateChanged(state) => {
            serde_json::json!({ "event": "state", "state": state.as_str() })
        }
        ServiceEvent::TunnelReady(tunnel) => {
            serde_json::json!({ "event": "tunnel-ready", "config": tunnel })
        }
        ServiceEvent::Log { level, message } => {
            serde_json::json!({ "event": "log", "level": level.as_str(), "message": message })
        }
        ServiceEvent::Failed(e) => serde_json::json!({
            "event": "failed",
            "category": format!("{:?}", e.category()),
            "message": e.to_string(),
        }),
    };
    println!("{}", value);
}
