//! Contact network over which infection propagates.

use crate::config::NetworkConfig;
use anyhow::{Context, Result, bail};
use rand::Rng;
use rand_distr::{Bernoulli, Distribution};

/// Stable agent identity, equal to the agent's node index.
pub type AgentId = usize;

/// Neighbor lookup over a fixed set of agents `0..num_nodes()`.
pub trait ContactGraph {
    /// Number of nodes in the graph.
    fn num_nodes(&self) -> usize;

    /// Agents adjacent to `agent`.
    fn neighbors(&self, agent: AgentId) -> &[AgentId];
}

/// Immutable undirected graph stored as adjacency lists.
#[derive(Debug, Clone)]
pub struct ContactNetwork {
    adj: Vec<Vec<AgentId>>,
}

impl ContactNetwork {
    /// Generate an Erdős–Rényi random graph.
    ///
    /// Every unordered pair of distinct nodes is joined with probability
    /// `avg_degree / num_nodes`.
    pub fn generate<R: Rng + ?Sized>(cfg: &NetworkConfig, rng: &mut R) -> Result<Self> {
        cfg.validate()?;

        let n_nodes = cfg.num_nodes;
        let edge_dist = Bernoulli::new(cfg.avg_degree / n_nodes as f64)
            .context("failed to construct edge distribution")?;

        let mut adj = vec![Vec::new(); n_nodes];
        for i in 0..n_nodes {
            for j in (i + 1)..n_nodes {
                if edge_dist.sample(rng) {
                    adj[i].push(j);
                    adj[j].push(i);
                }
            }
        }

        let n_edges = adj.iter().map(Vec::len).sum::<usize>() / 2;
        log::debug!("generated contact network with {n_nodes} nodes and {n_edges} edges");

        Ok(Self { adj })
    }

    /// Build a graph from an explicit edge list.
    ///
    /// Duplicate edges are merged. Self-loops and out-of-range endpoints are rejected.
    pub fn from_edges(n_nodes: usize, edges: &[(AgentId, AgentId)]) -> Result<Self> {
        if n_nodes == 0 {
            bail!("graph must have at least one node");
        }
        let mut adj = vec![Vec::new(); n_nodes];
        for &(a, b) in edges {
            if a >= n_nodes || b >= n_nodes {
                bail!("edge ({a}, {b}) has an endpoint outside 0..{n_nodes}");
            }
            if a == b {
                bail!("self-loop at node {a}");
            }
            adj[a].push(b);
            adj[b].push(a);
        }
        for list in &mut adj {
            list.sort_unstable();
            list.dedup();
        }
        Ok(Self { adj })
    }

    /// Number of undirected edges.
    pub fn num_edges(&self) -> usize {
        self.adj.iter().map(Vec::len).sum::<usize>() / 2
    }
}

impl ContactGraph for ContactNetwork {
    fn num_nodes(&self) -> usize {
        self.adj.len()
    }

    fn neighbors(&self, agent: AgentId) -> &[AgentId] {
        &self.adj[agent]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha12Rng;

    fn network_cfg(num_nodes: usize, avg_degree: f64) -> NetworkConfig {
        NetworkConfig {
            num_nodes,
            avg_degree,
        }
    }

    #[test]
    fn test_generated_graph_is_symmetric_without_self_loops() {
        let mut rng = ChaCha12Rng::seed_from_u64(1);
        let net = ContactNetwork::generate(&network_cfg(200, 8.0), &mut rng).unwrap();

        assert_eq!(net.num_nodes(), 200);
        for a in 0..net.num_nodes() {
            for &b in net.neighbors(a) {
                assert_ne!(a, b);
                assert!(net.neighbors(b).contains(&a));
            }
        }
    }

    #[test]
    fn test_generated_graph_mean_degree() {
        let mut rng = ChaCha12Rng::seed_from_u64(2);
        let net = ContactNetwork::generate(&network_cfg(1000, 10.0), &mut rng).unwrap();

        let mean_degree = 2.0 * net.num_edges() as f64 / net.num_nodes() as f64;
        assert!((mean_degree - 10.0).abs() < 1.0, "mean degree {mean_degree}");
    }

    #[test]
    fn test_generation_is_reproducible() {
        let cfg = network_cfg(50, 5.0);
        let a = ContactNetwork::generate(&cfg, &mut ChaCha12Rng::seed_from_u64(3)).unwrap();
        let b = ContactNetwork::generate(&cfg, &mut ChaCha12Rng::seed_from_u64(3)).unwrap();
        for agent in 0..50 {
            assert_eq!(a.neighbors(agent), b.neighbors(agent));
        }
    }

    #[test]
    fn test_generation_rejects_invalid_degree() {
        let mut rng = ChaCha12Rng::seed_from_u64(4);
        assert!(ContactNetwork::generate(&network_cfg(10, 10.0), &mut rng).is_err());
    }

    #[test]
    fn test_from_edges() {
        let net = ContactNetwork::from_edges(4, &[(0, 1), (1, 2), (2, 1)]).unwrap();
        assert_eq!(net.neighbors(1), &[0, 2]);
        assert_eq!(net.neighbors(3), &[] as &[AgentId]);
        assert_eq!(net.num_edges(), 2);

        assert!(ContactNetwork::from_edges(3, &[(0, 0)]).is_err());
        assert!(ContactNetwork::from_edges(3, &[(0, 3)]).is_err());
        assert!(ContactNetwork::from_edges(0, &[]).is_err());
    }
}
