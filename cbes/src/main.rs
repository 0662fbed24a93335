//! Entry point: parse configuration, install logging, and run the
//! Supervisor to completion (`spec.md` §6, component C7).

mod config;
mod logging;
mod metrics_server;
mod replica_watcher;
mod supervisor;

use clap::Parser;

/// `spec.md` §6: on any non-zero exit, give buffered log writers a moment
/// to flush before the process actually terminates.
const EXIT_DRAIN: std::time::Duration = std::time::Duration::from_millis(500);

fn main() {
    let config = config::Config::parse();
    logging::init(&config.logging);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("building the tokio runtime");

    let result = runtime.block_on(supervisor::run(config));

    match result {
        Ok(()) => {}
        Err(err) => {
            observability_deps::tracing::error!(%err, "cbes exiting with an error");
            std::thread::sleep(EXIT_DRAIN);
            std::process::exit(1);
        }
    }
}
