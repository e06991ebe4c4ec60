//! Running simulations to termination, alone or as a batch of replicates.

use crate::config::{Config, RunConfig};
use crate::engine::Engine;
use crate::network::ContactGraph;
use crate::sink::{MetricsSink, NullSink};
use crate::stats::{Accumulator, AccumulatorReport};
use anyhow::{Context, Result};
use rand::SeedableRng;
use rand_chacha::ChaCha12Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::{
    any::Any,
    panic::{self, AssertUnwindSafe},
    sync::atomic::{AtomicUsize, Ordering},
};

/// Terminal classification of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    /// No infected agents remain.
    Eradicated,
    /// The infected fraction reached the configured threshold.
    ThresholdReached,
    /// Neither happened within the step cap.
    Inconclusive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Termination {
    pub steps: usize,
    pub outcome: Outcome,
}

/// Step `engine` until the infection is eradicated, the infected fraction
/// reaches the threshold, or `max_steps` steps have run.
///
/// The sink receives the snapshot taken before every step and a final
/// snapshot of the terminal state.
pub fn run_until_termination<G, S>(
    engine: &mut Engine<G>,
    run: &RunConfig,
    sink: &mut S,
) -> Result<Termination>
where
    G: ContactGraph,
    S: MetricsSink + ?Sized,
{
    let mut steps = 0;
    while steps < run.max_steps
        && engine.infected_count() > 0
        && engine.infected_fraction() < run.infection_threshold
    {
        let summary = engine.step();
        log::debug!("{:?}", summary.counts);
        sink.record(&summary).context("failed to record summary")?;
        steps += 1;
    }

    sink.record(&engine.summarize())
        .context("failed to record final summary")?;

    let outcome = if engine.infected_count() == 0 {
        Outcome::Eradicated
    } else if engine.infected_fraction() >= run.infection_threshold {
        Outcome::ThresholdReached
    } else {
        Outcome::Inconclusive
    };

    Ok(Termination { steps, outcome })
}

/// Random number generator of replicate `index` under `master_seed`.
///
/// Each replicate draws from its own ChaCha stream, so streams never overlap
/// and are reproducible from the master seed alone.
pub fn replicate_rng(master_seed: u64, index: usize) -> ChaCha12Rng {
    let mut rng = ChaCha12Rng::seed_from_u64(master_seed);
    rng.set_stream(index as u64);
    rng
}

/// Build a fresh engine for replicate `index` and run it to termination.
pub fn run_replicate<S: MetricsSink + ?Sized>(
    cfg: &Config,
    master_seed: u64,
    index: usize,
    sink: &mut S,
) -> Result<Termination> {
    let mut engine = Engine::new(cfg, replicate_rng(master_seed, index))
        .context("failed to construct engine")?;
    run_until_termination(&mut engine, &cfg.run, sink)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ReplicateStatus {
    Completed(Termination),
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicateRecord {
    pub replicate: usize,
    pub status: ReplicateStatus,
}

/// Run `task` for every replicate index in `0..n_replicates` on the rayon pool.
///
/// Errors and panics are recorded as failed replicates; the others still run.
/// Records are returned in index order.
pub fn run_replicates<F>(n_replicates: usize, task: F) -> Vec<ReplicateRecord>
where
    F: Fn(usize) -> Result<Termination> + Sync,
{
    let n_done = AtomicUsize::new(0);

    (0..n_replicates)
        .into_par_iter()
        .map(|index| {
            let status = match panic::catch_unwind(AssertUnwindSafe(|| task(index))) {
                Ok(Ok(termination)) => ReplicateStatus::Completed(termination),
                Ok(Err(error)) => {
                    log::warn!("replicate {index} failed: {error:#}");
                    ReplicateStatus::Failed(format!("{error:#}"))
                }
                Err(payload) => {
                    let msg = panic_message(payload.as_ref());
                    log::warn!("replicate {index} panicked: {msg}");
                    ReplicateStatus::Failed(format!("panicked: {msg}"))
                }
            };

            let done = n_done.fetch_add(1, Ordering::Relaxed) + 1;
            let progress = 100.0 * done as f64 / n_replicates as f64;
            log::info!("completed {progress:06.2}%");

            ReplicateRecord {
                replicate: index,
                status,
            }
        })
        .collect()
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Aggregate outcome of a batch of replicates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchReport {
    pub master_seed: u64,
    pub n_replicates: usize,
    pub eradicated: usize,
    pub threshold_reached: usize,
    pub inconclusive: usize,
    pub failed: usize,
    /// Step counts of the replicates that reached the threshold.
    pub steps_to_threshold: AccumulatorReport,
    pub replicates: Vec<ReplicateRecord>,
}

impl BatchReport {
    pub fn from_records(master_seed: u64, replicates: Vec<ReplicateRecord>) -> Self {
        let mut eradicated = 0;
        let mut threshold_reached = 0;
        let mut inconclusive = 0;
        let mut failed = 0;
        let mut steps_acc = Accumulator::new();

        for record in &replicates {
            match &record.status {
                ReplicateStatus::Completed(termination) => match termination.outcome {
                    Outcome::Eradicated => eradicated += 1,
                    Outcome::ThresholdReached => {
                        threshold_reached += 1;
                        steps_acc.add(termination.steps as f64);
                    }
                    Outcome::Inconclusive => inconclusive += 1,
                },
                ReplicateStatus::Failed(_) => failed += 1,
            }
        }

        Self {
            master_seed,
            n_replicates: replicates.len(),
            eradicated,
            threshold_reached,
            inconclusive,
            failed,
            steps_to_threshold: steps_acc.report(),
            replicates,
        }
    }
}

/// Run `cfg.run.num_replicates` independent replicates in parallel and aggregate them.
pub fn run_batch(cfg: &Config, master_seed: u64) -> BatchReport {
    log::info!(
        "running {} replicates with master seed {master_seed}",
        cfg.run.num_replicates
    );
    let records = run_replicates(cfg.run.num_replicates, |index| {
        run_replicate(cfg, master_seed, index, &mut NullSink)
    });
    BatchReport::from_records(master_seed, records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelConfig;
    use crate::engine::StepSummary;
    use crate::network::ContactNetwork;
    use anyhow::bail;
    use rand::Rng;

    fn scenario_config() -> Config {
        let mut cfg = Config::default();
        cfg.network.num_nodes = 10;
        cfg.network.avg_degree = 9.0;
        cfg.model = ModelConfig {
            infection_prob: 1.0,
            recovery_prob: 1.0,
            death_prob: 0.0,
            gain_resistance_prob: 0.0,
            resistance_level: 1.0,
            resistance_decay: 0.0,
            mutation_prob: 0.0,
            genome_bits: 8,
        };
        cfg.run.infection_threshold = 1.0;
        cfg
    }

    fn small_config() -> Config {
        let mut cfg = Config::default();
        cfg.network.num_nodes = 80;
        cfg.network.avg_degree = 6.0;
        cfg.model.infection_prob = 0.3;
        cfg.model.recovery_prob = 0.1;
        cfg.model.death_prob = 0.01;
        cfg.model.mutation_prob = 0.02;
        cfg.run.max_steps = 200;
        cfg.run.infection_threshold = 0.5;
        cfg.run.num_replicates = 50;
        cfg
    }

    fn complete_graph(n_nodes: usize) -> ContactNetwork {
        let mut edges = Vec::new();
        for a in 0..n_nodes {
            for b in (a + 1)..n_nodes {
                edges.push((a, b));
            }
        }
        ContactNetwork::from_edges(n_nodes, &edges).unwrap()
    }

    #[test]
    fn test_immediate_recovery_eradicates() {
        let cfg = scenario_config();
        let mut summaries: Vec<StepSummary> = Vec::new();

        let termination = run_replicate(&cfg, 1, 0, &mut summaries).unwrap();

        assert_eq!(termination.outcome, Outcome::Eradicated);
        assert!(termination.steps <= 2);
        assert_eq!(summaries.len(), termination.steps + 1);
        assert_eq!(summaries[0].counts.infected, 1);
        assert_eq!(summaries.last().unwrap().counts.infected, 0);
    }

    #[test]
    fn test_threshold_reached_on_complete_graph() {
        let model = ModelConfig {
            infection_prob: 1.0,
            recovery_prob: 0.0,
            death_prob: 0.0,
            gain_resistance_prob: 0.0,
            mutation_prob: 0.0,
            ..ModelConfig::default()
        };
        let mut engine =
            Engine::with_graph(&model, complete_graph(5), false, ChaCha12Rng::seed_from_u64(2))
                .unwrap();
        let run = RunConfig {
            infection_threshold: 1.0,
            ..RunConfig::default()
        };

        let termination = run_until_termination(&mut engine, &run, &mut NullSink).unwrap();

        assert_eq!(
            termination,
            Termination {
                steps: 1,
                outcome: Outcome::ThresholdReached
            }
        );
    }

    #[test]
    fn test_threshold_met_before_first_step() {
        let mut cfg = scenario_config();
        cfg.run.infection_threshold = 0.1;
        let mut summaries: Vec<StepSummary> = Vec::new();

        let termination = run_replicate(&cfg, 3, 0, &mut summaries).unwrap();

        assert_eq!(termination.steps, 0);
        assert_eq!(termination.outcome, Outcome::ThresholdReached);
        assert_eq!(summaries.len(), 1);
    }

    #[test]
    fn test_step_cap_is_inconclusive() {
        let mut cfg = scenario_config();
        cfg.model.infection_prob = 0.0;
        cfg.model.recovery_prob = 0.0;
        cfg.run.max_steps = 25;

        let termination = run_replicate(&cfg, 4, 0, &mut NullSink).unwrap();

        assert_eq!(
            termination,
            Termination {
                steps: 25,
                outcome: Outcome::Inconclusive
            }
        );
    }

    #[test]
    fn test_replicate_streams_are_distinct_and_reproducible() {
        let mut a = replicate_rng(7, 0);
        let mut b = replicate_rng(7, 1);
        let mut a_again = replicate_rng(7, 0);

        let a_vals: Vec<u64> = (0..4).map(|_| a.random()).collect();
        let b_vals: Vec<u64> = (0..4).map(|_| b.random()).collect();
        let a_again_vals: Vec<u64> = (0..4).map(|_| a_again.random()).collect();

        assert_ne!(a_vals, b_vals);
        assert_eq!(a_vals, a_again_vals);
    }

    #[test]
    fn test_batch_is_reproducible() {
        let cfg = small_config();

        let first = run_batch(&cfg, 1234);
        let second = run_batch(&cfg, 1234);

        assert_eq!(first.n_replicates, 50);
        assert_eq!(first.replicates, second.replicates);
        for (index, record) in first.replicates.iter().enumerate() {
            assert_eq!(record.replicate, index);
        }
        assert_eq!(
            first.eradicated + first.threshold_reached + first.inconclusive + first.failed,
            50
        );
        assert_eq!(first.failed, 0);
    }

    #[test]
    fn test_failed_replicates_are_isolated() {
        let records = run_replicates(6, |index| match index {
            2 => bail!("broken replicate"),
            4 => panic!("replicate exploded"),
            _ => Ok(Termination {
                steps: index,
                outcome: Outcome::ThresholdReached,
            }),
        });

        assert_eq!(records.len(), 6);
        assert!(matches!(&records[2].status, ReplicateStatus::Failed(msg) if msg.contains("broken")));
        assert!(
            matches!(&records[4].status, ReplicateStatus::Failed(msg) if msg.contains("exploded"))
        );

        let report = BatchReport::from_records(0, records);
        assert_eq!(report.failed, 2);
        assert_eq!(report.threshold_reached, 4);
        // Mean of steps 0, 1, 3 and 5.
        let mean = report.steps_to_threshold.mean.unwrap();
        assert!((mean - 2.25).abs() < 1e-12);
    }

    #[test]
    fn test_report_counts_outcomes() {
        let completed = |steps, outcome| ReplicateStatus::Completed(Termination { steps, outcome });
        let records = vec![
            ReplicateRecord {
                replicate: 0,
                status: completed(10, Outcome::ThresholdReached),
            },
            ReplicateRecord {
                replicate: 1,
                status: completed(3, Outcome::Eradicated),
            },
            ReplicateRecord {
                replicate: 2,
                status: completed(100, Outcome::Inconclusive),
            },
            ReplicateRecord {
                replicate: 3,
                status: completed(20, Outcome::ThresholdReached),
            },
        ];

        let report = BatchReport::from_records(9, records);

        assert_eq!(report.master_seed, 9);
        assert_eq!(report.n_replicates, 4);
        assert_eq!(report.eradicated, 1);
        assert_eq!(report.inconclusive, 1);
        assert_eq!(report.threshold_reached, 2);
        assert_eq!(report.failed, 0);
        assert_eq!(report.steps_to_threshold.n_vals, 2);
        assert_eq!(report.steps_to_threshold.mean, Some(15.0));
    }

    #[test]
    fn test_batch_without_threshold_hits_has_no_mean() {
        let mut cfg = scenario_config();
        cfg.run.num_replicates = 8;

        let report = run_batch(&cfg, 5);

        assert_eq!(report.eradicated, 8);
        assert_eq!(report.steps_to_threshold.mean, None);
    }
}
