use anyhow::{anyhow, Result};
use clap::{Arg, ArgAction, Command};
use std::{sync::Arc, thread, time::Duration};

use solarlink::{
    command::opcode,
    config::LinkConfig,
    connection::{status, ConnectionFactory},
    poller::{Poller, PollerSettings},
    WorkScheduler,
};

fn main() -> Result<()> {
    env_logger::init();
    let matches = Command::new("solarlink")
        .about("Poll photovoltaic inverters over serial and TCP links")
        .arg(
            Arg::new("config")
                .long("config")
                .short('c')
                .value_name("FILE")
                .help("Configuration file (TOML)")
                .required(true),
        )
        .arg(
            Arg::new("check")
                .long("check")
                .help("Validate the configuration and exit")
                .action(ArgAction::SetTrue),
        )
        .get_matches();

    let path = matches
        .get_one::<String>("config")
        .ok_or_else(|| anyhow!("--config is required"))?;
    let config = LinkConfig::load(path)?;
    if matches.get_flag("check") {
        println!(
            "{}: {} connections, {} pollers, configuration OK",
            path,
            config.connections.len(),
            config.pollers.len()
        );
        return Ok(());
    }

    let scheduler = WorkScheduler::new()?;
    let mut factory = ConnectionFactory::new(scheduler.clone());
    let connections = factory.build_all(&config)?;

    let (result_tx, result_rx) = flume::unbounded();
    let mut pollers = Vec::new();
    for poller in &config.pollers {
        let connection = connections
            .get(&poller.connection)
            .ok_or_else(|| anyhow!("Poller '{}': connection missing", poller.name))?;
        pollers.push(Poller::new(
            PollerSettings {
                name: poller.name.clone(),
                request: poller.request.clone().into_bytes().into(),
                interval: poller.interval(),
                timeout: poller.timeout(),
            },
            Arc::clone(connection),
            scheduler.clone(),
            result_tx.clone(),
        ));
    }
    drop(result_tx);

    thread::Builder::new()
        .name("results".to_string())
        .spawn(move || {
            for result in result_rx.iter() {
                match &result.data {
                    Some(data) if result.status == status::OK => {
                        println!("{}: {}", result.poller, String::from_utf8_lossy(data))
                    }
                    _ => println!("{}: {}", result.poller, status::describe(result.status)),
                }
            }
        })
        .map_err(|err| anyhow!("Failed to spawn result printer: {}", err))?;

    let handler_scheduler = scheduler.clone();
    ctrlc::set_handler(move || {
        log::info!("Interrupted, shutting down");
        let mut shutdown = solarlink::Command::broadcast(opcode::BRC_SHUTDOWN);
        while let Err(back) = handler_scheduler.try_schedule_now(shutdown) {
            shutdown = back;
            thread::sleep(Duration::from_millis(10));
        }
    })
    .map_err(|err| anyhow!("Failed to install Ctrl-C handler: {}", err))?;

    for poller in &pollers {
        poller.start();
    }
    log::info!(
        "Running {} pollers on {} connections",
        pollers.len(),
        connections.len()
    );
    scheduler.run();

    for connection in connections.values() {
        connection.abort_all();
    }
    while scheduler.dispatch_one(false) {}
    scheduler.stop_timers();
    log::info!("Stopped");
    Ok(())
}
