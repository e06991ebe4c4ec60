use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::{fmt::Debug, fs, ops::RangeBounds, path::Path};

/// Simulation configuration parameters.
///
/// Loaded from a TOML file and validated before use.
/// See [`Config::from_file`] for loading.
#[derive(Debug, Default, PartialEq, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Contact network parameters.
    pub network: NetworkConfig,
    /// Epidemic model parameters.
    pub model: ModelConfig,
    /// Run termination and batch parameters.
    pub run: RunConfig,
    /// Output parameters.
    pub output: OutputConfig,
}

/// Contact network parameters.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NetworkConfig {
    /// Population size.
    pub num_nodes: usize,
    /// Mean degree of the contact network.
    pub avg_degree: f64,
}

/// Epidemic model parameters.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ModelConfig {
    /// Base transmission probability of the seed variant.
    pub infection_prob: f64,
    /// Per-step recovery probability.
    pub recovery_prob: f64,
    /// Per-step death probability of the seed variant.
    pub death_prob: f64,
    /// Per-step probability that a susceptible agent gains resistance (vaccination).
    pub gain_resistance_prob: f64,
    /// Baseline resistance strength of resistant agents.
    pub resistance_level: f64,
    /// Quadratic waning coefficient of resistance (0 disables waning).
    pub resistance_decay: f64,
    /// Per-bit mutation probability on transmission.
    pub mutation_prob: f64,
    /// Genome length in bits.
    pub genome_bits: usize,
}

/// Run termination and batch parameters.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunConfig {
    /// Hard cap on steps per run.
    pub max_steps: usize,
    /// Infected fraction that ends a run as "threshold reached".
    pub infection_threshold: f64,
    /// Number of replicates in a batch.
    pub num_replicates: usize,
    /// Master seed. Drawn from the OS when absent.
    pub seed: Option<u64>,
}

/// Output parameters.
#[derive(Debug, Default, PartialEq, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OutputConfig {
    /// Compute the per-variant population immunity table every step.
    pub track_immunity: bool,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            num_nodes: 500,
            avg_degree: 10.0,
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            infection_prob: 0.1,
            recovery_prob: 0.05,
            death_prob: 0.001,
            gain_resistance_prob: 0.01,
            resistance_level: 1.0,
            resistance_decay: 0.0,
            mutation_prob: 0.01,
            genome_bits: 8,
        }
    }
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            max_steps: 1500,
            infection_threshold: 1.0,
            num_replicates: 15,
            seed: None,
        }
    }
}

impl Config {
    /// Load a [`Config`] from a file.
    ///
    /// The file must be TOML-encoded. Missing sections and fields take their defaults.
    /// Performs validation on all parameters before returning.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read, deserialized,
    /// or if the configuration values are invalid.
    pub fn from_file<P: AsRef<Path>>(file: P) -> Result<Self> {
        let file = file.as_ref();
        let contents =
            fs::read_to_string(file).with_context(|| format!("failed to read {file:?}"))?;

        let config: Config = toml::from_str(&contents).context("failed to deserialize config")?;

        config.validate().context("failed to validate config")?;

        Ok(config)
    }

    /// Check every parameter against its allowed range.
    pub fn validate(&self) -> Result<()> {
        self.network
            .validate()
            .context("invalid network parameters")?;
        self.model.validate().context("invalid model parameters")?;
        self.run.validate().context("invalid run parameters")?;
        Ok(())
    }
}

impl NetworkConfig {
    pub fn validate(&self) -> Result<()> {
        check_num(self.num_nodes, 1..).context("invalid number of nodes")?;
        let max_degree = self.num_nodes as f64;
        if !(self.avg_degree > 0.0 && self.avg_degree < max_degree) {
            bail!(
                "invalid average degree: must be in the range (0, {max_degree}), but is {}",
                self.avg_degree
            );
        }
        Ok(())
    }
}

impl ModelConfig {
    pub fn validate(&self) -> Result<()> {
        check_num(self.infection_prob, 0.0..=1.0).context("invalid infection probability")?;
        check_num(self.recovery_prob, 0.0..=1.0).context("invalid recovery probability")?;
        check_num(self.death_prob, 0.0..=1.0).context("invalid death probability")?;
        check_num(self.gain_resistance_prob, 0.0..=1.0)
            .context("invalid gain resistance probability")?;
        check_num(self.resistance_level, 0.0..=1.0).context("invalid resistance level")?;
        check_num(self.resistance_decay, 0.0..).context("invalid resistance decay")?;
        check_num(self.mutation_prob, 0.0..=1.0).context("invalid mutation probability")?;
        check_genome_bits(self.genome_bits).context("invalid genome length")?;
        Ok(())
    }
}

impl RunConfig {
    pub fn validate(&self) -> Result<()> {
        check_num(self.max_steps, 1..).context("invalid maximum number of steps")?;
        if !(self.infection_threshold > 0.0 && self.infection_threshold <= 1.0) {
            bail!(
                "invalid infection threshold: must be in the range (0, 1], but is {}",
                self.infection_threshold
            );
        }
        check_num(self.num_replicates, 1..).context("invalid number of replicates")?;
        Ok(())
    }
}

fn check_num<T, R>(num: T, range: R) -> Result<()>
where
    T: PartialOrd + Debug,
    R: RangeBounds<T> + Debug,
{
    // NaN fails every range check.
    if !range.contains(&num) {
        bail!("number must be in the range {range:?}, but is {num:?}");
    }
    Ok(())
}

fn check_genome_bits(bits: usize) -> Result<()> {
    check_num(bits, 4..=64)?;
    if bits % 4 != 0 {
        bail!("genome length must be a multiple of 4, but is {bits}");
    }
    Ok(())
}
