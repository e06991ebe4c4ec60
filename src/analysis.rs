use crate::engine::StepSummary;
use crate::sink::read_trajectory;
use crate::stats::Accumulator;
use anyhow::{Context, Result};
use std::{
    collections::{HashMap, HashSet},
    fs::File,
    io::{BufWriter, Write},
    path::Path,
};

/// Observable computed over a trajectory of step summaries.
pub trait Obs {
    fn update(&mut self, summary: &StepSummary) -> Result<()>;
    fn report(&self) -> serde_json::Value;
}

/// Fraction of the population in each state.
pub struct StateFractions {
    susceptible: Accumulator,
    infected: Accumulator,
    resistant: Accumulator,
    dead: Accumulator,
}

impl StateFractions {
    pub fn new() -> Self {
        Self {
            susceptible: Accumulator::new(),
            infected: Accumulator::new(),
            resistant: Accumulator::new(),
            dead: Accumulator::new(),
        }
    }
}

impl Obs for StateFractions {
    fn update(&mut self, summary: &StepSummary) -> Result<()> {
        let counts = &summary.counts;
        let total = counts.total();
        if total == 0 {
            return Ok(());
        }
        let total = total as f64;
        self.susceptible.add(counts.susceptible as f64 / total);
        self.infected.add(counts.infected as f64 / total);
        self.resistant.add(counts.resistant as f64 / total);
        self.dead.add(counts.dead as f64 / total);
        Ok(())
    }

    fn report(&self) -> serde_json::Value {
        serde_json::json!({
            "state_fractions": {
                "susceptible": self.susceptible.report(),
                "infected": self.infected.report(),
                "resistant": self.resistant.report(),
                "dead": self.dead.report(),
            }
        })
    }
}

/// Largest number of simultaneous infections and when it first occurred.
pub struct PeakInfected {
    peak: usize,
    step: usize,
}

impl PeakInfected {
    pub fn new() -> Self {
        Self { peak: 0, step: 0 }
    }
}

impl Obs for PeakInfected {
    fn update(&mut self, summary: &StepSummary) -> Result<()> {
        if summary.counts.infected > self.peak {
            self.peak = summary.counts.infected;
            self.step = summary.step;
        }
        Ok(())
    }

    fn report(&self) -> serde_json::Value {
        serde_json::json!({ "peak_infected": { "count": self.peak, "step": self.step } })
    }
}

/// Diversity of circulating variants.
pub struct VariantDiversity {
    seen: HashSet<String>,
    max_circulating: usize,
    case_steps: HashMap<String, usize>,
}

impl VariantDiversity {
    pub fn new() -> Self {
        Self {
            seen: HashSet::new(),
            max_circulating: 0,
            case_steps: HashMap::new(),
        }
    }
}

impl Obs for VariantDiversity {
    fn update(&mut self, summary: &StepSummary) -> Result<()> {
        self.max_circulating = self.max_circulating.max(summary.variants.len());
        for variant in &summary.variants {
            self.seen.insert(variant.name.clone());
            *self.case_steps.entry(variant.name.clone()).or_default() += variant.cases;
        }
        Ok(())
    }

    fn report(&self) -> serde_json::Value {
        // Ties resolve to the lexicographically smallest name.
        let dominant = self
            .case_steps
            .iter()
            .max_by(|a, b| a.1.cmp(b.1).then_with(|| b.0.cmp(a.0)))
            .map(|(name, case_steps)| serde_json::json!({ "name": name, "case_steps": case_steps }));
        serde_json::json!({
            "variant_diversity": {
                "n_seen": self.seen.len(),
                "max_circulating": self.max_circulating,
                "dominant": dominant,
            }
        })
    }
}

pub struct Analyzer {
    obs_ptr_vec: Vec<Box<dyn Obs>>,
}

impl Analyzer {
    pub fn new() -> Self {
        let obs_ptr_vec: Vec<Box<dyn Obs>> = vec![
            Box::new(StateFractions::new()),
            Box::new(PeakInfected::new()),
            Box::new(VariantDiversity::new()),
        ];
        Self { obs_ptr_vec }
    }

    pub fn add_summary(&mut self, summary: &StepSummary) -> Result<()> {
        for obs in &mut self.obs_ptr_vec {
            obs.update(summary).context("failed to update observable")?;
        }
        Ok(())
    }

    /// Feed the first `n_records` summaries of a trajectory file.
    pub fn add_file<P: AsRef<Path>>(&mut self, file: P, n_records: usize) -> Result<()> {
        let summaries = read_trajectory(file, n_records).context("failed to read trajectory")?;
        for summary in &summaries {
            self.add_summary(summary)?;
        }
        Ok(())
    }

    pub fn reports(&self) -> Vec<serde_json::Value> {
        self.obs_ptr_vec.iter().map(|obs| obs.report()).collect()
    }

    pub fn save_results<P: AsRef<Path>>(&self, file: P) -> Result<()> {
        let file = file.as_ref();
        let file = File::create(file).with_context(|| format!("failed to create {file:?}"))?;
        let mut writer = BufWriter::new(file);

        serde_json::to_writer_pretty(&mut writer, &self.reports())
            .context("failed to serialize results")?;
        writer.flush().context("failed to flush writer stream")?;
        Ok(())
    }
}
