//! Pathogen genetics: genomes, variants and the canonical variant registry.

use anyhow::{Context, Result, bail};
use rand::Rng;
use rand_distr::{Bernoulli, Distribution};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Fixed-width bit sequence identifying a variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Genome {
    bits: u64,
    width: u32,
}

impl Genome {
    /// Maximum supported genome length in bits.
    pub const MAX_WIDTH: usize = 64;

    /// Create a genome of `width` bits; bits above `width` are discarded.
    ///
    /// # Errors
    /// Returns an error unless `width` is a multiple of 4 in `4..=64`.
    pub fn new(bits: u64, width: usize) -> Result<Self> {
        if width == 0 || width > Self::MAX_WIDTH || width % 4 != 0 {
            bail!("genome width must be a multiple of 4 in 4..={}, but is {width}", Self::MAX_WIDTH);
        }
        let width = width as u32;
        Ok(Self {
            bits: bits & mask(width),
            width,
        })
    }

    /// All-zero genome of the given width.
    pub fn zero(width: usize) -> Result<Self> {
        Self::new(0, width)
    }

    pub fn bits(&self) -> u64 {
        self.bits
    }

    pub fn width(&self) -> usize {
        self.width as usize
    }

    /// Uppercase hex encoding, zero-padded to `width / 4` digits.
    pub fn hex(&self) -> String {
        format!("{:0w$X}", self.bits, w = self.width() / 4)
    }

    /// Fraction of identical bits: `1 - popcount(a ^ b) / width`.
    ///
    /// Genomes of different widths are compared over the wider width.
    pub fn similarity(&self, other: &Genome) -> f64 {
        let width = self.width.max(other.width);
        let n_diff = (self.bits ^ other.bits).count_ones();
        1.0 - n_diff as f64 / width as f64
    }

    /// Flip every bit independently according to `flip_dist`.
    ///
    /// Returns the mutated genome and the number of flipped bits.
    fn mutate<R: Rng + ?Sized>(&self, flip_dist: &Bernoulli, rng: &mut R) -> (Genome, u32) {
        let mut flips = 0u64;
        for i_bit in 0..self.width {
            if flip_dist.sample(rng) {
                flips |= 1 << i_bit;
            }
        }
        let child = Genome {
            bits: self.bits ^ flips,
            width: self.width,
        };
        (child, flips.count_ones())
    }
}

fn mask(width: u32) -> u64 {
    if width >= 64 {
        u64::MAX
    } else {
        (1 << width) - 1
    }
}

/// Opaque handle to a canonical [`Variant`] in a [`VariantRegistry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VariantId(u32);

impl VariantId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Pathogen strain with its own transmission and lethality rates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Variant {
    genome: Genome,
    infection_prob: f64,
    death_prob: f64,
}

impl Variant {
    pub fn genome(&self) -> &Genome {
        &self.genome
    }

    pub fn infection_prob(&self) -> f64 {
        self.infection_prob
    }

    pub fn death_prob(&self) -> f64 {
        self.death_prob
    }

    pub fn name(&self) -> String {
        self.genome.hex()
    }

    pub fn similarity(&self, other: &Variant) -> f64 {
        self.genome.similarity(&other.genome)
    }
}

/// Arena interning every genome into a single canonical [`Variant`].
///
/// Entries are never removed, so a [`VariantId`] stays valid for the registry's lifetime.
/// The vaccine pseudo-variant occupies a reserved slot that is not reachable
/// through genome lookup.
#[derive(Debug, Clone)]
pub struct VariantRegistry {
    variants: Vec<Variant>,
    by_genome: HashMap<Genome, VariantId>,
    width: usize,
}

impl VariantRegistry {
    const VACCINE: VariantId = VariantId(0);
    const SEED: VariantId = VariantId(1);

    /// Create a registry holding the vaccine and the all-zero seed variant.
    pub fn new(genome_bits: usize, infection_prob: f64, death_prob: f64) -> Result<Self> {
        check_prob(infection_prob).context("invalid seed infection probability")?;
        check_prob(death_prob).context("invalid seed death probability")?;

        let zero = Genome::zero(genome_bits)?;
        let vaccine = Variant {
            genome: zero,
            infection_prob: 0.0,
            death_prob: 0.0,
        };
        let seed = Variant {
            genome: zero,
            infection_prob,
            death_prob,
        };

        let mut by_genome = HashMap::new();
        by_genome.insert(zero, Self::SEED);

        Ok(Self {
            variants: vec![vaccine, seed],
            by_genome,
            width: genome_bits,
        })
    }

    /// Non-contagious pseudo-variant recorded by vaccination.
    pub fn vaccine(&self) -> VariantId {
        Self::VACCINE
    }

    /// Index variant carried by the initially infected agent.
    pub fn seed(&self) -> VariantId {
        Self::SEED
    }

    pub fn get(&self, id: VariantId) -> &Variant {
        &self.variants[id.index()]
    }

    /// Look up a genome without inserting it.
    pub fn find(&self, genome: &Genome) -> Option<VariantId> {
        self.by_genome.get(genome).copied()
    }

    /// Return the canonical variant for `genome`, interning it with the given rates if new.
    ///
    /// Rates are ignored when the genome is already known.
    pub fn get_or_insert(
        &mut self,
        genome: Genome,
        infection_prob: f64,
        death_prob: f64,
    ) -> Result<VariantId> {
        if genome.width() != self.width {
            bail!(
                "genome width must be {}, but is {}",
                self.width,
                genome.width()
            );
        }
        if let Some(id) = self.find(&genome) {
            return Ok(id);
        }
        check_prob(infection_prob).context("invalid infection probability")?;
        check_prob(death_prob).context("invalid death probability")?;
        Ok(self.insert(genome, infection_prob, death_prob))
    }

    fn insert(&mut self, genome: Genome, infection_prob: f64, death_prob: f64) -> VariantId {
        let id = VariantId(self.variants.len() as u32);
        self.variants.push(Variant {
            genome,
            infection_prob,
            death_prob,
        });
        self.by_genome.insert(genome, id);
        log::trace!("new variant {} ({id:?})", genome.hex());
        id
    }

    /// Produce the canonical descendant of `parent` after per-bit mutation.
    ///
    /// Rates drift only when the mutated genome is seen for the first time:
    /// each rate moves by `(flips / width) * rate` in an independently drawn
    /// direction and is clamped into `[0, 1]`.
    pub fn child_of<R: Rng + ?Sized>(
        &mut self,
        parent: VariantId,
        flip_dist: &Bernoulli,
        rng: &mut R,
    ) -> VariantId {
        let parent = self.get(parent);
        let (genome, n_flips) = parent.genome.mutate(flip_dist, rng);
        if let Some(id) = self.find(&genome) {
            return id;
        }

        let drift = n_flips as f64 / genome.width() as f64;
        let infection_prob = drifted(parent.infection_prob, drift, rng);
        let death_prob = drifted(parent.death_prob, drift, rng);
        self.insert(genome, infection_prob, death_prob)
    }

    /// Genetic similarity between two registered variants.
    pub fn similarity(&self, a: VariantId, b: VariantId) -> f64 {
        self.get(a).similarity(self.get(b))
    }

    /// Highest similarity between `variant` and any entry of `memory`, or 0 if empty.
    pub fn max_similarity(&self, variant: VariantId, memory: &[VariantId]) -> f64 {
        memory
            .iter()
            .map(|&seen| self.similarity(variant, seen))
            .fold(0.0, f64::max)
    }

    /// Number of interned variants, excluding the vaccine.
    pub fn len(&self) -> usize {
        self.variants.len() - 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Interned variants in insertion order, excluding the vaccine.
    pub fn iter(&self) -> impl Iterator<Item = (VariantId, &Variant)> {
        self.variants
            .iter()
            .enumerate()
            .skip(1)
            .map(|(i, variant)| (VariantId(i as u32), variant))
    }

    /// Upper bound (exclusive) on variant indices, for dense per-variant tables.
    pub fn id_bound(&self) -> usize {
        self.variants.len()
    }
}

fn drifted<R: Rng + ?Sized>(rate: f64, drift: f64, rng: &mut R) -> f64 {
    let sign = if rng.random::<bool>() { 1.0 } else { -1.0 };
    (rate + drift * rate * sign).clamp(0.0, 1.0)
}

fn check_prob(prob: f64) -> Result<()> {
    if !(0.0..=1.0).contains(&prob) {
        bail!("probability must be in the range 0.0..=1.0, but is {prob}");
    }
    Ok(())
}
