#![doc = include_str!("../README.md")]
#![forbid(unsafe_code)]
#![warn(
    unused,
    clippy::correctness,
    missing_debug_implementations,
    missing_docs,
    clippy::all,
    clippy::wildcard_imports,
    clippy::needless_borrow,
    clippy::cast_lossless,
    clippy::unused_async,
    clippy::explicit_iter_loop,
    clippy::explicit_into_iter_loop,
    clippy::cloned_instead_of_copied
)]
#![cfg_attr(not(test), forbid(clippy::indexing_slicing))]
#![cfg_attr(not(test), forbid(clippy::string_slice))]
#![allow(
    clippy::match_bool,
    clippy::mixed_read_write_in_expression,
    clippy::bool_assert_comparison,
    clippy::manual_split_once,
    clippy::format_push_string,
    clippy::bool_to_int_with_if
)]
pub(crate) mod address;
pub(crate) mod backend;
pub(crate) mod channel;
mod config;
pub(crate) mod context;
pub(crate) mod dedup;
pub(crate) mod error;
pub(crate) mod listener;
pub(crate) mod mailbox;
pub(crate) mod message;
pub(crate) mod pipeline;
pub(crate) mod relay;

use config::{Config, StageKind};
use context::Context;
use env_logger::Env;
use error::Error;
use listener::Stage;
use pipeline::StageHandler;
use std::env;
use std::process;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::signal::unix::{Signal, SignalKind, signal};

#[cfg(feature = "mimalloc")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

fn main() {
    let args: Vec<String> = env::args().collect();
    if args.len() != 2 {
        eprintln!(
            "Usage: {} <config_file>",
            args.first().map_or("mail-archiver", String::as_str)
        );
        process::exit(1);
    }

    let Some(config_path) = args.get(1) else {
        unreachable!("args length checked above")
    };

    let config = match Config::from_file(config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to read config: {}", e);
            process::exit(1);
        }
    };

    let env = Env::new().filter_or("RUST_LOG", &config.global.loglevel);
    env_logger::Builder::from_env(env)
        // disable timestamps - automatically added by systemd
        .format_timestamp(None)
        .init();

    if let Err(e) = run(&config) {
        log::error!("{e}");
        process::exit(1);
    }
}

/// Starts the configured stages and blocks until a signal or a dead stage
/// asks for shutdown, then drains and joins everything.
fn run(config: &Config) -> Result<(), Error> {
    let context = Arc::new(Context::new(config.global.clone())?);

    let signals = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .thread_name("signals")
        .enable_all()
        .build()?;
    let (terminate, interrupt, hangup) = {
        let _runtime = signals.enter();
        (
            signal(SignalKind::terminate())?,
            signal(SignalKind::interrupt())?,
            signal(SignalKind::hangup())?,
        )
    };
    signals.spawn(wait_for_signals(context.clone(), terminate, interrupt, hangup));

    let mut stages = Vec::new();
    for kind in StageKind::ALL {
        let Some(stage_config) = config.stage(kind)? else {
            continue;
        };
        let backend = backend::create(&stage_config)?;
        let handler = StageHandler::new(
            &stage_config,
            context.clone(),
            backend.clone(),
            relay::create(&stage_config),
        )?;
        stages.push(Stage::start(&stage_config, Arc::new(handler), backend)?);
    }
    if stages.is_empty() {
        return Err(Error::MissingStage("archive or storage".to_string()));
    }

    let refresher = context.spawn_refresher()?;

    let poll = Duration::from_secs(config.global.granularity.max(1));
    log::info!("Archiver started with {} stage(s)", stages.len());
    while context.is_running() {
        let deadline = Instant::now() + poll;
        for stage in &stages {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if stage.join(remaining) {
                log::error!("{}: stage exited, shutting down", stage.kind());
                context.stop();
            }
            if !context.is_running() {
                break;
            }
        }
    }

    log::info!("Shutting down stages");
    for stage in &stages {
        stage.finish(false);
    }
    for stage in stages {
        stage.close();
    }

    if let Some(refresher) = refresher {
        refresher.thread().unpark();
        if refresher.join().is_err() {
            log::error!("Table refresher panicked");
        }
    }
    signals.shutdown_background();
    log::info!("Shutdown complete");
    Ok(())
}

/// Stops the coordinator on SIGINT or SIGTERM; SIGHUP is ignored.
async fn wait_for_signals(
    context: Arc<Context>,
    mut terminate: Signal,
    mut interrupt: Signal,
    mut hangup: Signal,
) {
    loop {
        tokio::select! {
            _ = terminate.recv() => {
                log::info!("Got SIGTERM, shutting down");
                break;
            }
            _ = interrupt.recv() => {
                log::info!("Got SIGINT, shutting down");
                break;
            }
            _ = hangup.recv() => log::info!("Got SIGHUP, ignored"),
        }
    }
    context.stop();
}
