use anyhow::Result;
use clap::Parser;
use quorumkv::net;
use quorumkv::{Config, LogAudit, MemStore, Member, Membership, Node, StaticMembership};
use rand::Rng;
use std::time::{Duration, Instant};
use tracing::{error, info};

// share of write traffic; everything else is a read
const CREATE_FREQUENCY: u64 = 30;
const UPDATE_FREQUENCY: u64 = 20;
const DELETE_FREQUENCY: u64 = 10;

// how often the membership source is re-polled, in ticks
const MEMBERSHIP_POLL_TICKS: u64 = 25;

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let config = Config::parse();

    let rt = tokio::runtime::Builder::new_multi_thread()
        .thread_name("quorumkv")
        .enable_all()
        .build()?;
    rt.block_on(run(config))
}

async fn run(config: Config) -> Result<()> {
    let me = Member::new(config.listen.clone());
    info!("I am {}", me);
    info!("meshing with {:?}", config.peers);

    let transport = net::connect_all(&me, &config.peers).await?;
    let membership = StaticMembership::new(
        config.peers.iter().map(|addr| Member::new(addr.as_str())).collect(),
    );

    let mut node = Node::new(me, transport, MemStore::new(), LogAudit::default());
    node.refresh_ring(&membership.current_members());

    let workload = generate_workload(config.num_ops, config.key_range);
    info!(
        "issuing {} operations over {} keys",
        workload.len(),
        config.key_range
    );

    let start = Instant::now();
    let mut interval = tokio::time::interval(Duration::from_millis(config.tick_ms));
    let mut issued = 0;
    let mut ticks: u64 = 0;

    while issued < workload.len() || node.pending_count() > 0 {
        interval.tick().await;
        ticks += 1;

        if ticks % MEMBERSHIP_POLL_TICKS == 0 {
            node.refresh_ring(&membership.current_members());
        }

        let batch_end = (issued + config.batch).min(workload.len());
        for op in &workload[issued..batch_end] {
            let outcome = match op {
                WorkloadOp::Create { key, value } => node.create(key, value),
                WorkloadOp::Read { key } => node.read(key),
                WorkloadOp::Update { key, value } => node.update(key, value),
                WorkloadOp::Delete { key } => node.delete(key),
            };
            if let Err(e) = outcome {
                error!("failed to issue {:?}: {e}", op);
            }
        }
        if batch_end > issued {
            print_progress(batch_end, workload.len());
        }
        issued = batch_end;

        // pending transactions drain through replies or time out
        node.tick();
    }

    let elapsed = start.elapsed();
    info!("completed {} operations in {:?}", workload.len(), elapsed);
    info!(
        "throughput: {:.2} ops/sec",
        workload.len() as f64 / elapsed.as_secs_f64()
    );
    info!(
        "coordinator outcomes: {} ok, {} failed",
        node.audit().successes,
        node.audit().failures
    );
    Ok(())
}

#[derive(Debug)]
enum WorkloadOp {
    Create { key: String, value: String },
    Read { key: String },
    Update { key: String, value: String },
    Delete { key: String },
}

fn generate_workload(num_ops: usize, key_range: u64) -> Vec<WorkloadOp> {
    let mut rng = rand::rng();

    (0..num_ops)
        .map(|i| {
            let key = format!("key-{}", rng.random_range(0..key_range));
            let roll = rng.random_range(0..100);
            if roll < CREATE_FREQUENCY {
                WorkloadOp::Create {
                    key,
                    value: format!("value-{i}"),
                }
            } else if roll < CREATE_FREQUENCY + UPDATE_FREQUENCY {
                WorkloadOp::Update {
                    key,
                    value: format!("value-{i}"),
                }
            } else if roll < CREATE_FREQUENCY + UPDATE_FREQUENCY + DELETE_FREQUENCY {
                WorkloadOp::Delete { key }
            } else {
                WorkloadOp::Read { key }
            }
        })
        .collect()
}

fn print_progress(done: usize, total: usize) {
    let step = total / 10;
    if step > 0 && done % step == 0 {
        info!("{}% issued", (done * 100) / total);
    }
}
