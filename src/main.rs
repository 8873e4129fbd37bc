// SPDX-License-Identifier: Apache-2.0 OR MIT
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;

use multicast_proxy::config::Config;
use multicast_proxy::logging::{Facility, LogRegistry, Severity, StderrSink};
use multicast_proxy::proxy::sender::SocketSender;
use multicast_proxy::proxy::timing::Timing;
use multicast_proxy::proxy::{InterfaceBinding, ProxyEvent, ProxyInstance};
use multicast_proxy::{log_error, log_notice};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to JSON5 configuration file
    #[arg(long, default_value = "/etc/mcproxyd.json5")]
    config: PathBuf,

    /// Validate the configuration and exit
    #[arg(long)]
    check: bool,
}

fn resolve(name: &str) -> Result<InterfaceBinding> {
    let index = nix::net::if_::if_nametoindex(name)
        .with_context(|| format!("interface '{name}' not found"))?;
    Ok(InterfaceBinding {
        name: name.to_string(),
        index,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = Config::load_from_file(&args.config)?;
    config.validate()?;
    if args.check {
        println!("configuration OK: {} instance(s)", config.instances.len());
        return Ok(());
    }

    let registry = LogRegistry::new(4096, config.log_level.unwrap_or(Severity::Info));
    let logger = registry.logger();
    tokio::spawn(registry.consumer(Box::new(StderrSink)).run());

    let (timing, timing_worker) = Timing::new(logger.clone());
    tokio::spawn(timing_worker.run());

    let mut shutdown_handles = Vec::new();
    let mut instance_tasks = Vec::new();
    for instance_config in &config.instances {
        let upstream = resolve(&instance_config.upstream)?;
        let downstream = instance_config
            .downstream
            .iter()
            .map(|name| resolve(name))
            .collect::<Result<Vec<_>>>()?;

        let sender = Arc::new(SocketSender::new(instance_config.protocol)?);
        let instance = ProxyInstance::new(
            instance_config.name.clone(),
            instance_config.protocol,
            upstream,
            downstream,
            instance_config.timers_values(),
            sender,
            timing.clone(),
            logger.clone(),
        )?;

        shutdown_handles.push(instance.event_sender());
        instance_tasks.push(tokio::spawn(instance.run()));
    }

    log_notice!(
        logger,
        Facility::Proxy,
        &format!("mcproxyd started with {} instance(s)", instance_tasks.len())
    );

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    log_notice!(logger, Facility::Proxy, "shutting down");

    for handle in shutdown_handles {
        if handle.send(ProxyEvent::Shutdown).await.is_err() {
            log_error!(logger, Facility::Proxy, "instance already stopped");
        }
    }
    for task in instance_tasks {
        let _ = task.await;
    }

    Ok(())
}
