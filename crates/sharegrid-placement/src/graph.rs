//! PlacementGraph: shares on one side, servers on the other.
//!
//! Servers are stored in rank order and addressed by their position, so
//! iterating a share's neighbors yields servers from most to least
//! preferred. Edges are tagged `Existing` (the server holds the share)
//! or `Tentative` (the share is proposed for the server in this pass).

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

use sharegrid_storage::{ServerId, ShareIndex};

use crate::types::ServerRecord;

/// Why an edge is in the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    Existing,
    Tentative,
}

/// Bipartite share/server graph for one planning iteration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlacementGraph {
    servers: Vec<ServerId>,
    /// Per share: server position → edge kind.
    adjacency: Vec<BTreeMap<usize, EdgeKind>>,
}

impl PlacementGraph {
    /// An edgeless graph. `servers` must already be in rank order.
    pub fn new(total_shares: u32, servers: Vec<ServerId>) -> Self {
        Self {
            servers,
            adjacency: vec![BTreeMap::new(); total_shares as usize],
        }
    }

    /// Build a graph with an `Existing` edge for every share held by a
    /// reachable server. `records` must already be in rank order.
    pub fn from_records(total_shares: u32, records: &[ServerRecord]) -> Self {
        let servers = records.iter().map(|r| r.id.clone()).collect();
        let mut graph = Self::new(total_shares, servers);
        for (position, record) in records.iter().enumerate() {
            if !record.state.is_reachable() {
                continue;
            }
            for &share in &record.held {
                graph.add_edge(share, position, EdgeKind::Existing);
            }
        }
        graph
    }

    pub fn total_shares(&self) -> u32 {
        self.adjacency.len() as u32
    }

    /// Servers in rank order.
    pub fn servers(&self) -> &[ServerId] {
        &self.servers
    }

    pub fn server(&self, position: usize) -> Option<&ServerId> {
        self.servers.get(position)
    }

    pub fn position(&self, server: &str) -> Option<usize> {
        self.servers.iter().position(|s| s == server)
    }

    /// Add an edge. An `Existing` edge is never downgraded to `Tentative`.
    /// Returns false if the share or server is out of range.
    pub fn add_edge(&mut self, share: ShareIndex, position: usize, kind: EdgeKind) -> bool {
        if position >= self.servers.len() {
            return false;
        }
        let Some(edges) = self.adjacency.get_mut(share as usize) else {
            return false;
        };
        edges
            .entry(position)
            .and_modify(|k| *k = (*k).min(kind))
            .or_insert(kind);
        true
    }

    pub fn edge(&self, share: ShareIndex, position: usize) -> Option<EdgeKind> {
        self.adjacency.get(share as usize)?.get(&position).copied()
    }

    /// Server positions adjacent to `share`, in rank order.
    pub fn neighbors(&self, share: ShareIndex) -> impl Iterator<Item = usize> + '_ {
        self.adjacency
            .get(share as usize)
            .into_iter()
            .flat_map(|edges| edges.keys().copied())
    }

    /// All edges as (share, server position, kind), share-major.
    pub fn edges(&self) -> impl Iterator<Item = (ShareIndex, usize, EdgeKind)> + '_ {
        self.adjacency.iter().enumerate().flat_map(|(share, edges)| {
            edges
                .iter()
                .map(move |(&position, &kind)| (share as ShareIndex, position, kind))
        })
    }

    pub fn edge_count(&self) -> usize {
        self.adjacency.iter().map(BTreeMap::len).sum()
    }

    /// Tentative edges grouped by server position.
    pub fn tentative_by_server(&self) -> BTreeMap<usize, BTreeSet<ShareIndex>> {
        let mut grouped: BTreeMap<usize, BTreeSet<ShareIndex>> = BTreeMap::new();
        for (share, position, kind) in self.edges() {
            if kind == EdgeKind::Tentative {
                grouped.entry(position).or_default().insert(share);
            }
        }
        grouped
    }

    /// Shares with no edge at all, ascending.
    pub fn unplaced_shares(&self) -> Vec<ShareIndex> {
        self.adjacency
            .iter()
            .enumerate()
            .filter(|(_, edges)| edges.is_empty())
            .map(|(share, _)| share as ShareIndex)
            .collect()
    }
}
