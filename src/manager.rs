use crate::analysis::Analyzer;
use crate::config::Config;
use crate::driver::{self, Termination};
use crate::sink::TrajectoryWriter;
use anyhow::{Context, Result};
use glob::glob;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::{
    fs::{self, File},
    io::{BufReader, BufWriter, Write},
    path::{Path, PathBuf},
};

const TRAJECTORY_FILE: &str = "trajectory.msgpack";
const OUTCOME_FILE: &str = "outcome.json";
const ANALYSIS_FILE: &str = "analysis.json";

/// Metadata of a single saved run.
#[derive(Debug, Serialize, Deserialize)]
pub struct RunRecord {
    pub master_seed: u64,
    pub replicate: usize,
    pub termination: Termination,
    /// Number of summaries in the trajectory file.
    pub n_records: usize,
}

pub struct Manager {
    sim_dir: PathBuf,
    cfg: Config,
}

impl Manager {
    pub fn new<P: AsRef<Path>>(sim_dir: P) -> Result<Self> {
        let sim_dir = sim_dir.as_ref().to_path_buf();

        let cfg =
            Config::from_file(sim_dir.join("config.toml")).context("failed to construct cfg")?;
        log::info!("{cfg:#?}");

        Ok(Self { sim_dir, cfg })
    }

    /// Run one replicate in a new run directory, saving its trajectory.
    ///
    /// The run is written to a staging directory that only becomes a run
    /// directory once its outcome is saved, so a failed run leaves nothing behind.
    pub fn create_run(&self) -> Result<()> {
        let run_idx = self.count_run_dirs().context("failed to count run dirs")?;

        let staging_dir = self.staging_dir(run_idx);
        fs::create_dir_all(&staging_dir)
            .with_context(|| format!("failed to create {staging_dir:?}"))?;

        let run_dir = self.run_dir(run_idx);
        let result = self
            .simulate_run(run_idx, &staging_dir)
            .and_then(|()| {
                fs::rename(&staging_dir, &run_dir)
                    .with_context(|| format!("failed to rename {staging_dir:?} to {run_dir:?}"))
            });
        if let Err(error) = result {
            if let Err(rm_error) = fs::remove_dir_all(&staging_dir) {
                log::warn!("failed to remove {staging_dir:?}: {rm_error}");
            }
            return Err(error);
        }
        log::info!("created {run_dir:?}");

        Ok(())
    }

    fn simulate_run(&self, run_idx: usize, dir: &Path) -> Result<()> {
        let master_seed = self.master_seed();
        let mut writer = TrajectoryWriter::create(dir.join(TRAJECTORY_FILE))
            .context("failed to create trajectory writer")?;
        let termination = driver::run_replicate(&self.cfg, master_seed, run_idx, &mut writer)
            .context("failed to run simulation")?;
        let n_records = writer.finish().context("failed to finish trajectory")?;
        log::info!("run {run_idx} terminated: {termination:?}");

        let record = RunRecord {
            master_seed,
            replicate: run_idx,
            termination,
            n_records,
        };
        write_json(dir.join(OUTCOME_FILE), &record).context("failed to save outcome")?;

        Ok(())
    }

    /// Run a batch of replicates in parallel and save the aggregate report.
    pub fn run_batch(&self) -> Result<()> {
        let master_seed = self.master_seed();
        let report = driver::run_batch(&self.cfg, master_seed);

        log::info!(
            "threshold reached: {} (mean steps: {:?}), eradicated: {}, inconclusive: {}, failed: {}",
            report.threshold_reached,
            report.steps_to_threshold.mean,
            report.eradicated,
            report.inconclusive,
            report.failed
        );

        let batch_file = self.batch_file();
        write_json(&batch_file, &report).context("failed to save batch report")?;
        log::info!("saved {batch_file:?}");

        Ok(())
    }

    /// Analyze the trajectory of every saved run.
    ///
    /// Run directories without an outcome are skipped.
    pub fn analyze_sim(&self) -> Result<()> {
        for run_dir in self.run_dirs().context("failed to list run dirs")? {
            let outcome_file = run_dir.join(OUTCOME_FILE);
            if !outcome_file.is_file() {
                log::warn!("skipping {run_dir:?}: no outcome");
                continue;
            }
            let record: RunRecord = read_json(&outcome_file).context("failed to load outcome")?;

            let mut analyzer = Analyzer::new();
            analyzer
                .add_file(run_dir.join(TRAJECTORY_FILE), record.n_records)
                .context("failed to add file")?;

            analyzer
                .save_results(run_dir.join(ANALYSIS_FILE))
                .context("failed to save results")?;
            log::info!("analyzed {run_dir:?}");
        }

        Ok(())
    }

    /// Remove every run directory, leftover staging directory and batch report.
    pub fn clean_sim(&self) -> Result<()> {
        let mut dirs = self.run_dirs().context("failed to list run dirs")?;
        dirs.extend(self.glob_dirs("tmp-run-*").context("failed to list staging dirs")?);
        for run_dir in dirs {
            fs::remove_dir_all(&run_dir)
                .with_context(|| format!("failed to remove {run_dir:?}"))?;
            log::info!("removed {run_dir:?}");
        }

        let batch_file = self.batch_file();
        if batch_file.exists() {
            fs::remove_file(&batch_file)
                .with_context(|| format!("failed to remove {batch_file:?}"))?;
            log::info!("removed {batch_file:?}");
        }

        Ok(())
    }

    fn master_seed(&self) -> u64 {
        match self.cfg.run.seed {
            Some(seed) => seed,
            None => {
                let seed: u64 = rand::rng().random();
                log::info!("drew master seed {seed}");
                seed
            }
        }
    }

    fn run_dirs(&self) -> Result<Vec<PathBuf>> {
        self.glob_dirs("run-*")
    }

    fn glob_dirs(&self, pattern: &str) -> Result<Vec<PathBuf>> {
        let pattern = self.sim_dir.join(pattern);
        let pattern = pattern.to_str().context("pattern is not valid UTF-8")?;
        let dirs = glob(pattern)
            .context("failed to glob dirs")?
            .filter_map(Result::ok)
            .filter(|p| p.is_dir())
            .collect();
        Ok(dirs)
    }

    fn count_run_dirs(&self) -> Result<usize> {
        Ok(self.run_dirs()?.len())
    }

    fn run_dir(&self, run_idx: usize) -> PathBuf {
        self.sim_dir.join(format!("run-{run_idx:04}"))
    }

    fn staging_dir(&self, run_idx: usize) -> PathBuf {
        self.sim_dir.join(format!("tmp-run-{run_idx:04}"))
    }

    fn batch_file(&self) -> PathBuf {
        self.sim_dir.join("batch.json")
    }
}

fn write_json<P: AsRef<Path>, T: Serialize>(file: P, value: &T) -> Result<()> {
    let file = file.as_ref();
    let file = File::create(file).with_context(|| format!("failed to create {file:?}"))?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, value).context("failed to serialize value")?;
    writer.flush().context("failed to flush writer stream")?;
    Ok(())
}

fn read_json<P: AsRef<Path>, T: for<'de> Deserialize<'de>>(file: P) -> Result<T> {
    let file = file.as_ref();
    let file = File::open(file).with_context(|| format!("failed to open {file:?}"))?;
    let reader = BufReader::new(file);
    serde_json::from_reader(reader).context("failed to deserialize value")
}
