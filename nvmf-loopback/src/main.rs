use anyhow::{bail, Context, Result};
use log::{info, warn};
use nvmf_rdma::wire::opcode::NvmOpcode;
use nvmf_rdma::{
    CommandFuture, LoopbackTransport, NvmfError, PoolConfig, PoolRegistry, QueuePair,
    QueuePairConfig, ResponseFuture,
};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::Path;
use std::time::{Duration, Instant};

/// Loopback run configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct LoopbackConfig {
    queue: QueuePairConfig,
    pool: PoolConfig,
    /// Commands to issue in total
    commands: u32,
    /// Commands kept in flight at once; capped at the queue depth
    in_flight: u16,
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        Self {
            queue: QueuePairConfig {
                queue_id: 1,
                ..Default::default()
            },
            pool: PoolConfig::default(),
            commands: 10_000,
            in_flight: 16,
        }
    }
}

impl LoopbackConfig {
    fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("Failed to parse {}", path.display()))
    }
}

/// Submit-to-response latency summary
#[derive(Debug, Clone, PartialEq)]
struct LatencyStats {
    count: usize,
    min: Duration,
    median: Duration,
    p99: Duration,
    max: Duration,
}

impl LatencyStats {
    fn from_samples(mut samples: Vec<Duration>) -> Option<Self> {
        if samples.is_empty() {
            return None;
        }
        samples.sort_unstable();
        let percentile = |p: usize| samples[(samples.len() - 1) * p / 100];
        Some(Self {
            count: samples.len(),
            min: samples[0],
            median: percentile(50),
            p99: percentile(99),
            max: samples[samples.len() - 1],
        })
    }
}

struct Pending {
    submitted: Instant,
    command: CommandFuture,
    response: ResponseFuture,
}

fn submit_read(queue_pair: &mut QueuePair, lba: u64) -> nvmf_rdma::Result<Pending> {
    let mut capsule = queue_pair.allocate_command_capsule()?;
    {
        let mut entry = capsule.entry_mut()?;
        entry.set_opcode(NvmOpcode::Read)?;
        entry.set_namespace_id(1)?;
        entry.set_dword(10, lba as u32)?;
        entry.set_dword(11, (lba >> 32) as u32)?;
    }
    let submitted = Instant::now();
    let (command, response) = queue_pair.submit(capsule)?;
    Ok(Pending {
        submitted,
        command,
        response,
    })
}

/// Drive `config.commands` reads through a queue pair answered by the
/// loopback controller, keeping up to `in_flight` outstanding
fn run(config: &LoopbackConfig) -> Result<LatencyStats> {
    let (transport, controller) = LoopbackTransport::new();
    controller.set_auto_respond(true);

    let pools = PoolRegistry::new(config.pool.clone())?;
    let mut queue_pair = QueuePair::new(Box::new(transport), config.queue.clone(), &pools)?;
    let window = config
        .in_flight
        .clamp(1, queue_pair.submission_queue_size()) as usize;

    let mut pending = VecDeque::with_capacity(window);
    let mut samples = Vec::with_capacity(config.commands as usize);
    let mut issued = 0u32;

    while issued < config.commands || !pending.is_empty() {
        while issued < config.commands && pending.len() < window {
            match submit_read(&mut queue_pair, issued as u64) {
                Ok(p) => {
                    pending.push_back(p);
                    issued += 1;
                }
                // identifiers waiting on send completions; drain first
                Err(NvmfError::QueueFull) => break,
                Err(e) => return Err(e).context("Submit failed"),
            }
        }

        let Some(Pending {
            submitted,
            command,
            response,
        }) = pending.pop_front()
        else {
            bail!("Queue full with nothing in flight");
        };
        let entry = response.get(&mut queue_pair)?;
        samples.push(submitted.elapsed());
        if !entry.status.is_success() {
            warn!("Command {} failed: {}", entry.command_id, entry.status);
        }
        command.get(&mut queue_pair)?.release()?;
    }

    queue_pair.release()?;
    info!(
        "Controller saw {} sends, {} receive posts",
        controller.total_sends(),
        controller.total_receives()
    );
    LatencyStats::from_samples(samples).context("No commands issued")
}

fn main() -> Result<()> {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => LoopbackConfig::load(Path::new(&path))?,
        None => LoopbackConfig::default(),
    };
    info!(
        "NVMe-oF loopback starting: queue {}, depth {}, {} commands, {} in flight",
        config.queue.queue_id(),
        config.queue.submission_queue_size,
        config.commands,
        config.in_flight
    );

    let start = Instant::now();
    let stats = run(&config)?;
    let elapsed = start.elapsed();

    info!(
        "{} commands in {:?} ({:.0} IOPS)",
        stats.count,
        elapsed,
        stats.count as f64 / elapsed.as_secs_f64()
    );
    info!(
        "Latency: min={:?}, median={:?}, p99={:?}, max={:?}",
        stats.min, stats.median, stats.p99, stats.max
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = LoopbackConfig::default();
        assert_eq!(config.queue.queue_id, 1);
        assert_eq!(config.commands, 10_000);
        assert_eq!(config.in_flight, 16);
    }

    #[test]
    fn test_config_partial_json() {
        let config: LoopbackConfig =
            serde_json::from_str(r#"{"commands": 5, "queue": {"submission_queue_size": 4}}"#)
                .unwrap();
        assert_eq!(config.commands, 5);
        assert_eq!(config.queue.submission_queue_size, 4);
        assert_eq!(config.in_flight, 16);
    }

    #[test]
    fn test_latency_stats() {
        let samples = (1..=100).map(Duration::from_micros).rev().collect();
        let stats = LatencyStats::from_samples(samples).unwrap();
        assert_eq!(stats.count, 100);
        assert_eq!(stats.min, Duration::from_micros(1));
        assert_eq!(stats.median, Duration::from_micros(50));
        assert_eq!(stats.p99, Duration::from_micros(99));
        assert_eq!(stats.max, Duration::from_micros(100));
        assert!(LatencyStats::from_samples(Vec::new()).is_none());
    }

    #[test]
    fn test_run_small() {
        let config = LoopbackConfig {
            queue: QueuePairConfig {
                queue_id: 1,
                submission_queue_size: 4,
                ..Default::default()
            },
            commands: 100,
            in_flight: 8,
            ..Default::default()
        };
        let stats = run(&config).unwrap();
        assert_eq!(stats.count, 100);
        assert!(stats.min <= stats.max);
    }
}
