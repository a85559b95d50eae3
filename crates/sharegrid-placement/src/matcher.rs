//! Maximum bipartite matching between shares and servers.
//!
//! Kuhn's augmenting-path algorithm. Shares are tried in ascending
//! order and each share's servers in rank order, so identical graphs
//! always produce identical matchings. The depth-first search keeps its
//! own frame stack and visited arena instead of recursing, so path
//! length is bounded by memory rather than by the call stack.

use serde::Serialize;

use sharegrid_storage::{ServerId, ShareIndex};

use crate::graph::PlacementGraph;

/// A set of (share, server) edges with no share and no server repeated.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Matching {
    /// Matched pairs, ascending by share.
    pairs: Vec<(ShareIndex, ServerId)>,
}

impl Matching {
    /// The happiness value: how many servers provably hold distinct
    /// shares at the same time.
    pub fn happiness(&self) -> usize {
        self.pairs.len()
    }

    pub fn pairs(&self) -> &[(ShareIndex, ServerId)] {
        &self.pairs
    }

    pub fn server_for(&self, share: ShareIndex) -> Option<&ServerId> {
        self.pairs
            .binary_search_by_key(&share, |(s, _)| *s)
            .ok()
            .map(|i| &self.pairs[i].1)
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}

/// One level of the augmenting-path search.
struct Frame {
    share: usize,
    /// Index of the next neighbor of `share` to try.
    next: usize,
}

/// Compute a maximum matching of `graph`.
pub fn maximum_matching(graph: &PlacementGraph) -> Matching {
    let share_count = graph.total_shares() as usize;
    let adjacency: Vec<Vec<usize>> = (0..share_count)
        .map(|share| graph.neighbors(share as ShareIndex).collect())
        .collect();

    let mut share_to_server: Vec<Option<usize>> = vec![None; share_count];
    let mut server_to_share: Vec<Option<usize>> = vec![None; graph.servers().len()];
    let mut visited = vec![false; graph.servers().len()];
    let mut stack: Vec<Frame> = Vec::new();

    for root in 0..share_count {
        if adjacency[root].is_empty() {
            continue;
        }
        visited.fill(false);
        stack.clear();
        stack.push(Frame { share: root, next: 0 });

        while let Some(frame) = stack.last_mut() {
            let Some(&server) = adjacency[frame.share].get(frame.next) else {
                stack.pop();
                continue;
            };
            frame.next += 1;
            if visited[server] {
                continue;
            }
            visited[server] = true;

            match server_to_share[server] {
                Some(owner) => stack.push(Frame { share: owner, next: 0 }),
                None => {
                    augment(&stack, server, &mut share_to_server, &mut server_to_share);
                    break;
                }
            }
        }
    }

    let pairs = share_to_server
        .iter()
        .enumerate()
        .filter_map(|(share, server)| {
            server.map(|position| (share as ShareIndex, graph.servers()[position].clone()))
        })
        .collect();
    Matching { pairs }
}

/// Flip the path on `stack`: the top share takes `free_server`, and
/// every share below takes the server its successor gave up.
fn augment(
    stack: &[Frame],
    free_server: usize,
    share_to_server: &mut [Option<usize>],
    server_to_share: &mut [Option<usize>],
) {
    let mut target = free_server;
    for frame in stack.iter().rev() {
        let previous = share_to_server[frame.share].replace(target);
        server_to_share[target] = Some(frame.share);
        match previous {
            Some(released) => target = released,
            None => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    use super::*;
    use crate::graph::EdgeKind;

    fn graph(shares: u32, servers: usize, edges: &[(ShareIndex, usize)]) -> PlacementGraph {
        let ids = (0..servers).map(|i| format!("s{i}")).collect();
        let mut graph = PlacementGraph::new(shares, ids);
        for &(share, server) in edges {
            graph.add_edge(share, server, EdgeKind::Existing);
        }
        graph
    }

    fn assert_valid(graph: &PlacementGraph, matching: &Matching) {
        let mut shares = HashSet::new();
        let mut servers = HashSet::new();
        for (share, server) in matching.pairs() {
            assert!(shares.insert(*share), "share {share} matched twice");
            assert!(servers.insert(server.clone()), "server {server} matched twice");
            let position = graph.position(server).unwrap();
            assert!(graph.edge(*share, position).is_some(), "pair is not an edge");
        }
    }

    /// Exhaustive maximum over all share-to-server assignments.
    fn brute_force(adjacency: &[Vec<usize>], share: usize, used: u32) -> usize {
        if share == adjacency.len() {
            return 0;
        }
        let mut best = brute_force(adjacency, share + 1, used);
        for &server in &adjacency[share] {
            if used & (1 << server) == 0 {
                best = best.max(1 + brute_force(adjacency, share + 1, used | (1 << server)));
            }
        }
        best
    }

    #[test]
    fn empty_graph_has_zero_happiness() {
        let matching = maximum_matching(&graph(3, 2, &[]));
        assert_eq!(matching.happiness(), 0);
        assert!(matching.is_empty());
    }

    #[test]
    fn all_shares_on_one_server_count_once() {
        let matching = maximum_matching(&graph(4, 1, &[(0, 0), (1, 0), (2, 0), (3, 0)]));
        assert_eq!(matching.happiness(), 1);
        assert_eq!(matching.pairs(), &[(0, "s0".to_string())]);
    }

    #[test]
    fn augmenting_path_reassigns_earlier_share() {
        // Share 0 first grabs s0; share 1 can only use s0, so share 0
        // must move over to s1.
        let g = graph(2, 2, &[(0, 0), (0, 1), (1, 0)]);
        let matching = maximum_matching(&g);
        assert_eq!(matching.happiness(), 2);
        assert_eq!(matching.server_for(0), Some(&"s1".to_string()));
        assert_eq!(matching.server_for(1), Some(&"s0".to_string()));
        assert_valid(&g, &matching);
    }

    #[test]
    fn long_augmenting_chain() {
        // Share i reaches servers i and i+1; share n-1 only reaches
        // server 0 after every other share has taken its first choice.
        let n = 200;
        let mut edges: Vec<(ShareIndex, usize)> = (0..n - 1)
            .flat_map(|i| [(i as ShareIndex, i), (i as ShareIndex, i + 1)])
            .collect();
        edges.push(((n - 1) as ShareIndex, 0));
        let g = graph(n as u32, n, &edges);
        let matching = maximum_matching(&g);
        assert_eq!(matching.happiness(), n);
        assert_valid(&g, &matching);
    }

    #[test]
    fn matches_brute_force_on_small_graphs() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        for _ in 0..500 {
            let shares = rng.gen_range(1..=8usize);
            let servers = rng.gen_range(1..=8usize);
            let density = rng.gen_range(0.0..1.0);

            let mut adjacency = vec![Vec::new(); shares];
            let mut edges = Vec::new();
            for (share, neighbors) in adjacency.iter_mut().enumerate() {
                for server in 0..servers {
                    if rng.gen_bool(density) {
                        neighbors.push(server);
                        edges.push((share as ShareIndex, server));
                    }
                }
            }

            let g = graph(shares as u32, servers, &edges);
            let matching = maximum_matching(&g);
            assert_valid(&g, &matching);
            assert_eq!(
                matching.happiness(),
                brute_force(&adjacency, 0, 0),
                "graph: {edges:?}"
            );
        }
    }

    #[test]
    fn identical_graphs_give_identical_pairs() {
        let mut rng = StdRng::seed_from_u64(7);
        let edges: Vec<(ShareIndex, usize)> = (0..60)
            .map(|_| (rng.gen_range(0..20), rng.gen_range(0..15)))
            .collect();

        let first = maximum_matching(&graph(20, 15, &edges));
        for _ in 0..10 {
            assert_eq!(maximum_matching(&graph(20, 15, &edges)), first);
        }

        // Insertion order of edges does not matter either.
        let reversed: Vec<_> = edges.iter().rev().copied().collect();
        assert_eq!(maximum_matching(&graph(20, 15, &reversed)), first);
    }

    #[test]
    fn ties_prefer_lower_share_and_higher_rank() {
        let g = graph(3, 3, &[(0, 0), (0, 1), (1, 0), (1, 1), (2, 2)]);
        let matching = maximum_matching(&g);
        assert_eq!(
            matching.pairs(),
            &[
                (0, "s0".to_string()),
                (1, "s1".to_string()),
                (2, "s2".to_string()),
            ]
        );
    }
}
