use crate::config::{Config, ModelConfig};
use crate::network::{AgentId, ContactGraph, ContactNetwork};
use crate::population::{AgentState, Population, TransitionRules};
use crate::variant::{VariantId, VariantRegistry};
use anyhow::{Context, Result, bail};
use rand::prelude::*;
use rand_chacha::ChaCha12Rng;
use serde::{Deserialize, Serialize};

/// Agent that carries the index variant at the start of a run.
pub const SEED_AGENT: AgentId = 0;

/// Number of agents in each state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateCounts {
    pub susceptible: usize,
    pub infected: usize,
    pub resistant: usize,
    pub dead: usize,
}

impl StateCounts {
    pub fn total(&self) -> usize {
        self.susceptible + self.infected + self.resistant + self.dead
    }
}

/// Case count of one circulating variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariantCases {
    pub id: VariantId,
    pub name: String,
    pub infection_prob: f64,
    pub death_prob: f64,
    pub cases: usize,
}

/// Relative population immunity against one variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariantImmunity {
    pub id: VariantId,
    pub name: String,
    pub level: f64,
}

/// Snapshot of the simulation taken before a step is applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepSummary {
    /// Number of steps completed when the snapshot was taken.
    pub step: usize,

    pub counts: StateCounts,

    /// Circulating variants sorted by descending case count.
    pub variants: Vec<VariantCases>,

    /// Immunity against every known variant, if tracked.
    pub immunity: Option<Vec<VariantImmunity>>,
}

/// Epidemic engine.
///
/// Owns the contact graph, the population, the variant registry and the random
/// number generator, and advances them one step at a time.
pub struct Engine<G = ContactNetwork> {
    graph: G,
    pop: Population,
    registry: VariantRegistry,
    rules: TransitionRules,
    track_immunity: bool,
    order: Vec<AgentId>,
    steps: usize,
    rng: ChaCha12Rng,
}

impl Engine<ContactNetwork> {
    /// Create an engine on a freshly generated random contact network.
    pub fn new(cfg: &Config, mut rng: ChaCha12Rng) -> Result<Self> {
        let graph = ContactNetwork::generate(&cfg.network, &mut rng)
            .context("failed to generate contact network")?;
        Self::with_graph(&cfg.model, graph, cfg.output.track_immunity, rng)
    }
}

impl<G: ContactGraph> Engine<G> {
    /// Create an engine on a caller-supplied contact graph.
    ///
    /// Agent [`SEED_AGENT`] starts infected with the all-zero index variant.
    pub fn with_graph(
        model: &ModelConfig,
        graph: G,
        track_immunity: bool,
        rng: ChaCha12Rng,
    ) -> Result<Self> {
        let rules = TransitionRules::new(model).context("failed to construct transition rules")?;

        let n_agents = graph.num_nodes();
        if n_agents == 0 {
            bail!("contact graph must have at least one node");
        }

        let registry = VariantRegistry::new(model.genome_bits, model.infection_prob, model.death_prob)
            .context("failed to construct variant registry")?;
        let pop = Population::new(n_agents, SEED_AGENT, registry.seed())
            .context("failed to construct population")?;

        Ok(Self {
            graph,
            pop,
            registry,
            rules,
            track_immunity,
            order: (0..n_agents).collect(),
            steps: 0,
            rng,
        })
    }

    /// Perform one step and return the snapshot taken before it.
    ///
    /// Every agent is advanced exactly once in a freshly shuffled order.
    /// State changes are visible immediately, so an agent infected earlier in
    /// the step is advanced as infected if its turn comes later.
    pub fn step(&mut self) -> StepSummary {
        let summary = self.summarize();

        self.order.shuffle(&mut self.rng);
        for &agent in &self.order {
            self.pop.advance(
                agent,
                &self.graph,
                &self.rules,
                &mut self.registry,
                &mut self.rng,
            );
        }
        self.steps += 1;

        summary
    }

    /// Snapshot the current state without advancing.
    pub fn summarize(&self) -> StepSummary {
        StepSummary {
            step: self.steps,
            counts: self.state_counts(),
            variants: self.variant_frequency(),
            immunity: self.track_immunity.then(|| self.variant_immunity()),
        }
    }

    pub fn state_counts(&self) -> StateCounts {
        let mut counts = StateCounts::default();
        for state in self.pop.states() {
            match state {
                AgentState::Susceptible => counts.susceptible += 1,
                AgentState::Infected => counts.infected += 1,
                AgentState::Resistant => counts.resistant += 1,
                AgentState::Dead => counts.dead += 1,
            }
        }
        counts
    }

    /// Case counts per infecting variant, sorted by descending count.
    ///
    /// Ties keep registry insertion order.
    pub fn variant_frequency(&self) -> Vec<VariantCases> {
        let mut cases = vec![0usize; self.registry.id_bound()];
        for agent in 0..self.pop.len() {
            if let Some(id) = self.pop.infecting_variant(agent) {
                cases[id.index()] += 1;
            }
        }

        let mut table: Vec<_> = self
            .registry
            .iter()
            .filter(|(id, _)| cases[id.index()] > 0)
            .map(|(id, variant)| VariantCases {
                id,
                name: variant.name(),
                infection_prob: variant.infection_prob(),
                death_prob: variant.death_prob(),
                cases: cases[id.index()],
            })
            .collect();
        table.sort_by(|a, b| b.cases.cmp(&a.cases));
        table
    }

    /// Population immunity against each known variant, relative to the mean over variants.
    ///
    /// The raw level of a variant is the mean over all agents of the highest
    /// similarity between it and the agent's immune memory. Levels are reported
    /// as 0 when the mean raw level is 0.
    pub fn variant_immunity(&self) -> Vec<VariantImmunity> {
        let n_agents = self.pop.len();
        let raw: Vec<_> = self
            .registry
            .iter()
            .map(|(id, _)| {
                let sum: f64 = (0..n_agents)
                    .map(|agent| {
                        self.registry
                            .max_similarity(id, self.pop.immune_memory(agent))
                    })
                    .sum();
                if n_agents == 0 { 0.0 } else { sum / n_agents as f64 }
            })
            .collect();

        let mean = if raw.is_empty() {
            0.0
        } else {
            raw.iter().sum::<f64>() / raw.len() as f64
        };

        self.registry
            .iter()
            .zip(raw)
            .map(|((id, variant), level)| VariantImmunity {
                id,
                name: variant.name(),
                level: if mean > 0.0 { level / mean } else { 0.0 },
            })
            .collect()
    }

    pub fn steps(&self) -> usize {
        self.steps
    }

    pub fn infected_count(&self) -> usize {
        self.pop.count(AgentState::Infected)
    }

    /// Infected agents as a fraction of the whole population, dead included.
    pub fn infected_fraction(&self) -> f64 {
        self.infected_count() as f64 / self.pop.len() as f64
    }

    pub fn population(&self) -> &Population {
        &self.pop
    }

    pub fn registry(&self) -> &VariantRegistry {
        &self.registry
    }

    pub fn graph(&self) -> &G {
        &self.graph
    }
}
