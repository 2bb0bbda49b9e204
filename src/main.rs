extern crate structopt;
extern crate tracing;

use bytes::Bytes;
use futures::FutureExt;
use futures::future::{join, join3};
use rand::seq::SliceRandom;
use std::error::Error;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use structopt::StructOpt;
use tokio::select;
use tokio::time::{Instant, sleep};
use tracing::{Instrument, error, info, info_span};
use tracing_subscriber::EnvFilter;

use raftnode::harness::Harness;
use raftnode::raft::{FailureOptions, Options};

#[derive(Debug, StructOpt, Clone)]
struct Arguments {
    #[structopt(short = "n", long = "nodes", default_value = "5")]
    nodes: usize,

    #[structopt(long = "failure_probability", default_value = "0.01")]
    failure_probability: f64,

    #[structopt(long = "latency_probability", default_value = "0.05")]
    latency_probability: f64,

    #[structopt(long = "latency_ms", default_value = "50")]
    latency_ms: u32,

    // Persist to files under this directory instead of keeping state in memory.
    #[structopt(short = "d", long = "persistence_dir")]
    persistence_dir: Option<String>,

    #[structopt(short = "w", long = "wipe_persistence")]
    wipe_persistence: bool,

    #[structopt(short = "p", long = "disable_preempt")]
    disable_preempt: bool,

    #[structopt(short = "k", long = "disable_crash")]
    disable_crash: bool,

    #[structopt(short = "v", long = "disable_validate")]
    disable_validate: bool,

    #[structopt(short = "c", long = "disable_commit")]
    disable_commit: bool,
}

// Starts a loop which periodically takes down a cluster member (preferably the
// leader) and brings it back a little later. Every other round the leader is
// merely asked to step down.
async fn run_crash_loop(
    args: Arc<Arguments>,
    harness: Arc<Harness>,
    shutdown: impl Future<Output = ()> + Clone,
) {
    if args.disable_crash && args.disable_preempt {
        info!("running without the crash loop");
        return;
    }

    let mut round = 0;
    loop {
        let body = async {
            sleep(Duration::from_secs(4)).await;
            round += 1;

            if !args.disable_preempt && (args.disable_crash || round % 2 == 0) {
                let start = Instant::now();
                match harness.make_client().preempt_leader().await {
                    Ok(leader) => {
                        info!(leader = %leader, latency_ms = %start.elapsed().as_millis(), "preempted")
                    }
                    Err(message) => error!("preempt failed: {}", message),
                }
                return;
            }

            let leaders = harness.leaders().await;
            let victim = match leaders.iter().max_by_key(|(term, _)| *term) {
                Some((_, leader)) => leader.name.clone(),
                None => match harness.addresses().choose(&mut rand::thread_rng()) {
                    Some(server) => server.name.clone(),
                    None => return,
                },
            };
            harness.crash(&victim).await;
            sleep(Duration::from_secs(2)).await;
            if let Err(message) = harness.restart(&victim).await {
                error!(server = %victim, "restart failed: {}", message);
            }
        };

        select! {
          _ = shutdown.clone() => {break;}
          _ = body => {}
        }
    }
    info!("Finished")
}

// Starts a loop which periodically asks the diagnostics object to validate the
// execution history of the cluster. If this fails, this indicates a bug in the
// raft implementation.
async fn run_validate_loop(
    args: Arc<Arguments>,
    harness: Arc<Harness>,
    shutdown: impl Future<Output = ()> + Clone,
) {
    if args.disable_validate {
        info!("running without the validate loop");
        return;
    }

    loop {
        let body = async {
            match harness.validate().await {
                Ok(()) => info!("cluster history is valid"),
                Err(message) => error!("cluster history is invalid: {}", message),
            }
            sleep(Duration::from_secs(5)).await;
        };

        select! {
          _ = shutdown.clone() => {break;}
          _ = body => {}
        }
    }
    info!("Finished");
}

// Repeatedly commits a new command to the cluster.
async fn run_commit_loop(
    args: Arc<Arguments>,
    harness: Arc<Harness>,
    shutdown: impl Future<Output = ()> + Clone,
) {
    if args.disable_commit {
        info!("running without the commit loop");
        return;
    }

    let client = harness.make_client();
    let mut i = 0;
    loop {
        let body = async {
            let start = Instant::now();
            let payload = Bytes::from(format!("command-{}", i));
            match client.commit(payload).await {
                Ok(entry_id) => {
                    if i % 10 == 1 {
                        info!(i, entry = %entry_id, latency_ms=%start.elapsed().as_millis(), "success")
                    }
                }
                Err(msg) => info!(i, latency_ms=%start.elapsed().as_millis(), "failure: {}", msg),
            }
            i += 1;
            sleep(Duration::from_millis(200)).await;
        };

        select! {
          _ = shutdown.clone() => {break;}
          _ = body => {}
        }
    }
    info!("Finished")
}

fn names(n: usize) -> Vec<String> {
    (0..n)
        .map(|i| char::from(b'A' + (i % 26) as u8).to_string() + &"'".repeat(i / 26))
        .collect()
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    // This allows configuring the filters using the RUST_LOG env variable.
    // Example:
    // > RUST_LOG=info,raftnode::raft=debug cargo run
    let env_filter = EnvFilter::try_from_default_env().unwrap_or(EnvFilter::from("raftnode=info"));

    tracing_subscriber::FmtSubscriber::builder()
        .with_target(false)
        .with_env_filter(env_filter)
        .init();
    let arguments = Arc::new(Arguments::from_args());

    let failures = FailureOptions::fail_with_probability(arguments.failure_probability)
        .with_latency(arguments.latency_probability, arguments.latency_ms);
    let mut builder = Harness::builder(names(arguments.nodes))
        .with_options(Options::default())
        .with_failure(failures);
    if let Some(directory) = &arguments.persistence_dir {
        builder = builder.with_persistence_directory(directory, arguments.wipe_persistence);
    }
    let harness = Arc::new(builder.build().await?);

    harness.start().await;
    info!("Started {} servers", harness.addresses().len());

    // Set up a shutdown broadcast by turning the channel receiver into a shared future.
    let (shutdown, rx) = async_std::channel::unbounded::<()>();
    let sx = async move {
        let _ = rx.recv().await;
    }
    .shared();

    let args = arguments.clone();
    let clients = join3(
        run_commit_loop(args.clone(), harness.clone(), sx.clone()).instrument(info_span!("commit")),
        run_crash_loop(args.clone(), harness.clone(), sx.clone()).instrument(info_span!("crash")),
        run_validate_loop(args.clone(), harness.clone(), sx.clone()).instrument(info_span!("validate")),
    );

    // Set up a signal handler that stops the client loops.
    let signal_handler = async move {
        if let Err(message) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for SIGINT: {}", message);
        }
        info!("Got SIGINT, shutting down");
        if shutdown.send(()).await.is_err() {
            error!("Failed to broadcast shutdown");
        }
    };
    join(clients, signal_handler).await;

    // Now that the loops are done, shut down the servers.
    harness.stop().await;
    info!("All done, exiting");
    Ok(())
}
