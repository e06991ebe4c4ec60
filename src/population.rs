//! Per-agent epidemic state and the per-step transition rules.

use crate::config::ModelConfig;
use crate::network::{AgentId, ContactGraph};
use crate::variant::{VariantId, VariantRegistry};
use anyhow::{Context, Result, bail};
use rand::Rng;
use rand_distr::{Bernoulli, Distribution};
use serde::{Deserialize, Serialize};

/// Disease state of an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AgentState {
    Susceptible,
    Infected,
    Resistant,
    Dead,
}

/// Validated transition probabilities and waning parameters.
#[derive(Debug, Clone)]
pub struct TransitionRules {
    recovery: Bernoulli,
    gain_resistance: Bernoulli,
    mutation: Bernoulli,
    resistance_level: f64,
    resistance_decay: f64,
}

impl TransitionRules {
    pub fn new(model: &ModelConfig) -> Result<Self> {
        model.validate()?;
        Ok(Self {
            recovery: Bernoulli::new(model.recovery_prob)
                .context("failed to construct recovery distribution")?,
            gain_resistance: Bernoulli::new(model.gain_resistance_prob)
                .context("failed to construct gain resistance distribution")?,
            mutation: Bernoulli::new(model.mutation_prob)
                .context("failed to construct mutation distribution")?,
            resistance_level: model.resistance_level,
            resistance_decay: model.resistance_decay,
        })
    }

    /// Resistance remaining after `age` steps: `level - decay * age^2`.
    ///
    /// Not clamped; it is only compared against zero.
    pub fn resistance_level(&self, age: u32) -> f64 {
        let age = age as f64;
        self.resistance_level - self.resistance_decay * age * age
    }

    fn wanes(&self) -> bool {
        self.resistance_decay > 0.0
    }
}

/// Struct-of-arrays store of every agent's mutable state.
///
/// Invariants: an agent has an infecting variant iff it is infected;
/// immune memory only grows; dead agents never change.
#[derive(Debug, Clone)]
pub struct Population {
    state: Vec<AgentState>,
    infecting: Vec<Option<VariantId>>,
    immune_memory: Vec<Vec<VariantId>>,
    resistance_age: Vec<u32>,
}

impl Population {
    /// All agents susceptible except `seed_agent`, infected with `seed_variant`.
    pub fn new(n_agents: usize, seed_agent: AgentId, seed_variant: VariantId) -> Result<Self> {
        if seed_agent >= n_agents {
            bail!("seed agent {seed_agent} is outside the population of {n_agents}");
        }
        let mut pop = Self {
            state: vec![AgentState::Susceptible; n_agents],
            infecting: vec![None; n_agents],
            immune_memory: vec![Vec::new(); n_agents],
            resistance_age: vec![0; n_agents],
        };
        pop.state[seed_agent] = AgentState::Infected;
        pop.infecting[seed_agent] = Some(seed_variant);
        Ok(pop)
    }

    pub fn len(&self) -> usize {
        self.state.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.is_empty()
    }

    pub fn state(&self, agent: AgentId) -> AgentState {
        self.state[agent]
    }

    pub fn states(&self) -> &[AgentState] {
        &self.state
    }

    pub fn infecting_variant(&self, agent: AgentId) -> Option<VariantId> {
        self.infecting[agent]
    }

    pub fn immune_memory(&self, agent: AgentId) -> &[VariantId] {
        &self.immune_memory[agent]
    }

    pub fn resistance_age(&self, agent: AgentId) -> u32 {
        self.resistance_age[agent]
    }

    /// Number of agents in `state`.
    pub fn count(&self, state: AgentState) -> usize {
        self.state.iter().filter(|&&s| s == state).count()
    }

    /// Advance one agent by one step.
    ///
    /// Changes to neighbors are written in place and are visible to agents
    /// advanced later in the same step.
    pub fn advance<G, R>(
        &mut self,
        agent: AgentId,
        graph: &G,
        rules: &TransitionRules,
        registry: &mut VariantRegistry,
        rng: &mut R,
    ) where
        G: ContactGraph + ?Sized,
        R: Rng + ?Sized,
    {
        match self.state[agent] {
            AgentState::Infected => self.advance_infected(agent, graph, rules, registry, rng),
            AgentState::Susceptible => {
                if rules.gain_resistance.sample(rng) {
                    self.become_resistant(agent, registry.vaccine());
                }
            }
            AgentState::Resistant => {
                self.resistance_age[agent] += 1;
                if rules.wanes() && rules.resistance_level(self.resistance_age[agent]) <= 0.0 {
                    self.state[agent] = AgentState::Susceptible;
                }
            }
            AgentState::Dead => {}
        }
    }

    fn advance_infected<G, R>(
        &mut self,
        agent: AgentId,
        graph: &G,
        rules: &TransitionRules,
        registry: &mut VariantRegistry,
        rng: &mut R,
    ) where
        G: ContactGraph + ?Sized,
        R: Rng + ?Sized,
    {
        let Some(variant) = self.infecting[agent] else {
            return;
        };

        // Recovery takes precedence over death, death over transmission.
        if rules.recovery.sample(rng) {
            self.become_resistant(agent, variant);
            return;
        }

        let death_prob = registry.get(variant).death_prob();
        if rng.random::<f64>() < death_prob {
            let death_resistance = registry.max_similarity(variant, &self.immune_memory[agent]);
            if rng.random::<f64>() > death_resistance {
                self.state[agent] = AgentState::Dead;
                self.infecting[agent] = None;
                return;
            }
        }

        for &neighbor in graph.neighbors(agent) {
            self.try_infect(neighbor, variant, rules, registry, rng);
        }
    }

    /// Attempt to infect `target` with `variant`.
    ///
    /// Only susceptible and resistant agents can be infected. Resistant agents
    /// additionally repel the attempt with probability equal to the highest
    /// similarity between `variant` and their immune memory. On success the
    /// target carries a freshly mutated descendant of `variant`.
    ///
    /// Returns whether the target became infected.
    pub fn try_infect<R: Rng + ?Sized>(
        &mut self,
        target: AgentId,
        variant: VariantId,
        rules: &TransitionRules,
        registry: &mut VariantRegistry,
        rng: &mut R,
    ) -> bool {
        let target_state = self.state[target];
        if !matches!(target_state, AgentState::Susceptible | AgentState::Resistant) {
            return false;
        }

        if rng.random::<f64>() >= registry.get(variant).infection_prob() {
            return false;
        }

        if target_state == AgentState::Resistant {
            let protection = registry.max_similarity(variant, &self.immune_memory[target]);
            if rng.random::<f64>() <= protection {
                return false;
            }
        }

        let child = registry.child_of(variant, &rules.mutation, rng);
        self.state[target] = AgentState::Infected;
        self.infecting[target] = Some(child);
        true
    }

    fn become_resistant(&mut self, agent: AgentId, remembered: VariantId) {
        self.state[agent] = AgentState::Resistant;
        self.infecting[agent] = None;
        self.immune_memory[agent].push(remembered);
        self.resistance_age[agent] = 0;
    }
}
