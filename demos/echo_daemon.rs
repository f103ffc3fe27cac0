//! A minimal daemon exercising the library end to end: one mediator
//! whose only worker operation echoes its argument back, called once
//! per tick from the daemon's `execute` body.

use std::time::Duration;

use forkdaemon::config::DaemonConfig;
use forkdaemon::mediator::{Mediator, MediatorConfig, OperationTable};
use forkdaemon::scheduler::Daemon;
use structopt::StructOpt;

#[derive(StructOpt)]
#[structopt(name = "echo_daemon", about = "Example daemon built on forkdaemon")]
struct Opt {
    /// Milliseconds between ticks.
    #[structopt(long, default_value = "200")]
    interval_ms: u64,

    /// Run detached from the controlling terminal.
    #[structopt(long)]
    daemonize: bool,
}

fn main() {
    env_logger::init();
    let opt = Opt::from_args();

    let mut config = DaemonConfig::default();
    config.loop_interval = Duration::from_millis(opt.interval_ms);
    config.daemonize = opt.daemonize;

    let mut daemon = Daemon::new(config).expect("invalid daemon configuration");

    let mut operations = OperationTable::new();
    operations
        .register("echo", |args| Ok(args.into_iter().next().unwrap_or(serde_json::Value::Null)))
        .expect("echo does not collide with a reserved name");

    let mediator_config = MediatorConfig::new("echo", Duration::from_millis(opt.interval_ms));
    let transport = forkdaemon::ipc::SysVTransport::new(&mediator_config.alias, forkdaemon::ipc::transport::DEFAULT_STORE_SIZE)
        .expect("failed to derive IPC transport for the echo worker");
    let mediator = Mediator::new(mediator_config, operations, Box::new(transport));

    let handle = daemon.register_mediator(mediator).expect("failed to set up the echo mediator");

    let mut tick: u64 = 0;
    daemon
        .run(move |d: &mut Daemon| {
            tick += 1;
            let promise = handle.borrow_mut().call(
                d.processes(),
                "echo",
                vec![serde_json::json!(format!("tick {}", tick))],
            );
            promise.subscribe(|outcome| match outcome {
                Ok(value) => log::info!("echo returned: {}", value),
                Err(e) => log::warn!("echo call failed: {}", e),
            });
        })
        .expect("daemon loop exited with an error");
}
