//! Results of one upload attempt: a committed plan, or diagnostics
//! explaining why happiness could not be reached.
//!
//! All failure text is assembled by `Diagnostics`' `Display`. Operators
//! and tooling match on the phrase "shares could be placed on only", so
//! that wording is fixed.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::Serialize;

use sharegrid_storage::{ServerId, ShareIndex, StorageIndex};

use crate::error::PlacementResult;
use crate::graph::PlacementGraph;
use crate::matcher::Matching;
use crate::types::{EncodingParams, ServerRecord, ServerState};

/// What an upload attempt produces.
pub type Outcome = PlacementResult<PlacementPlan>;

/// Servers per state at the end of an attempt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ServerCounts {
    pub writable: usize,
    pub read_only: usize,
    pub full: usize,
    pub unreachable: usize,
}

impl ServerCounts {
    pub fn tally(records: &[ServerRecord]) -> Self {
        let mut counts = Self::default();
        for record in records {
            match record.state {
                ServerState::Writable => counts.writable += 1,
                ServerState::ReadOnly => counts.read_only += 1,
                ServerState::Full => counts.full += 1,
                ServerState::Unreachable => counts.unreachable += 1,
            }
        }
        counts
    }

    /// Servers that can hold or take shares: writable plus read-only.
    pub fn usable(&self) -> usize {
        self.writable + self.read_only
    }
}

/// Why an attempt fell short.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Diagnostics {
    pub storage_index: StorageIndex,
    /// Happiness the best plan reached.
    pub achieved: usize,
    pub encoding: EncodingParams,
    pub servers: ServerCounts,
    /// Shares left out of the best matching: on no server, or only on
    /// servers already matched to another share.
    pub unplaced: Vec<ShareIndex>,
}

impl Diagnostics {
    pub fn new(
        storage_index: StorageIndex,
        encoding: EncodingParams,
        records: &[ServerRecord],
        matching: &Matching,
    ) -> Self {
        Self {
            storage_index,
            achieved: matching.happiness(),
            encoding,
            servers: ServerCounts::tally(records),
            unplaced: (0..encoding.total)
                .filter(|share| matching.server_for(*share).is_none())
                .collect(),
        }
    }

    /// Diagnostics for an attempt that never reached a server.
    pub fn without_servers(storage_index: StorageIndex, encoding: EncodingParams) -> Self {
        Self {
            storage_index,
            achieved: 0,
            encoding,
            servers: ServerCounts::default(),
            unplaced: (0..encoding.total).collect(),
        }
    }

    /// Servers still missing to reach the threshold.
    pub fn shortfall(&self) -> usize {
        (self.encoding.happy as usize).saturating_sub(self.achieved)
    }
}

impl fmt::Display for Diagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "shares could be placed on only {} server(s) such that any {} of them have \
             enough shares to recover the file, but we were asked to place shares on at \
             least {} such servers",
            self.achieved, self.encoding.needed, self.encoding.happy
        )?;
        let s = &self.servers;
        write!(
            f,
            " (servers: {} writable, {} read-only, {} full, {} unreachable; ",
            s.writable, s.read_only, s.full, s.unreachable
        )?;
        if self.unplaced.is_empty() {
            f.write_str("every share placed)")
        } else {
            let list: Vec<String> = self.unplaced.iter().map(ToString::to_string).collect();
            write!(f, "unplaced shares: {})", list.join(","))
        }
    }
}

/// A committed placement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlacementPlan {
    pub storage_index: StorageIndex,
    /// Share → server. A server may appear for several shares.
    pub assignments: BTreeMap<ShareIndex, ServerId>,
    /// Maximum-matching size over the final graph.
    pub happiness: usize,
    pub encoding: EncodingParams,
    /// Shares written during this attempt.
    pub shares_written: usize,
    /// Planning iterations that issued negotiation calls.
    pub iterations: usize,
}

impl PlacementPlan {
    /// Assign every share that has an edge in `graph`: to its matched
    /// server when it has one, otherwise to its best-ranked holder.
    pub fn from_graph(
        storage_index: StorageIndex,
        encoding: EncodingParams,
        graph: &PlacementGraph,
        matching: &Matching,
    ) -> Self {
        let mut assignments = BTreeMap::new();
        for share in 0..graph.total_shares() {
            let server = match matching.server_for(share) {
                Some(server) => Some(server.clone()),
                None => graph
                    .neighbors(share)
                    .next()
                    .and_then(|position| graph.server(position).cloned()),
            };
            if let Some(server) = server {
                assignments.insert(share, server);
            }
        }
        Self {
            storage_index,
            assignments,
            happiness: matching.happiness(),
            encoding,
            shares_written: 0,
            iterations: 0,
        }
    }

    /// Distinct servers that received at least one share.
    pub fn servers(&self) -> BTreeSet<&ServerId> {
        self.assignments.values().collect()
    }

    pub fn shares_on(&self, server: &str) -> Vec<ShareIndex> {
        self.assignments
            .iter()
            .filter(|(_, s)| s.as_str() == server)
            .map(|(share, _)| *share)
            .collect()
    }
}

impl fmt::Display for PlacementPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "storage index {}: happiness {} (required {}), {} of {} shares placed on {} server(s)",
            self.storage_index,
            self.happiness,
            self.encoding.happy,
            self.assignments.len(),
            self.encoding.total,
            self.servers().len()
        )?;
        for server in self.servers() {
            let shares: Vec<String> = self.shares_on(server).iter().map(ToString::to_string).collect();
            writeln!(f, "  {server}: {}", shares.join(","))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::EdgeKind;
    use crate::matcher::maximum_matching;

    fn si() -> StorageIndex {
        StorageIndex::new([3; 16])
    }

    #[test]
    fn message_carries_stable_phrase() {
        let diag = Diagnostics {
            storage_index: si(),
            achieved: 1,
            encoding: EncodingParams::new(3, 7, 10),
            servers: ServerCounts {
                writable: 1,
                ..Default::default()
            },
            unplaced: vec![],
        };
        let text = diag.to_string();
        assert!(text.contains("shares could be placed on only 1 server(s)"), "{text}");
        assert!(text.contains("any 3 of them"));
        assert!(text.contains("at least 7 such servers"));
        assert!(text.contains("1 writable, 0 read-only, 0 full, 0 unreachable"));
        assert!(text.contains("every share placed"));
        assert_eq!(diag.shortfall(), 6);
    }

    #[test]
    fn message_lists_unplaced_shares() {
        let diag = Diagnostics {
            unplaced: vec![4, 7],
            ..Diagnostics::without_servers(si(), EncodingParams::new(2, 3, 8))
        };
        assert!(diag.to_string().contains("unplaced shares: 4,7)"));
    }

    #[test]
    fn without_servers_leaves_every_share_unplaced() {
        let diag = Diagnostics::without_servers(si(), EncodingParams::new(1, 2, 3));
        assert_eq!(diag.achieved, 0);
        assert_eq!(diag.unplaced, vec![0, 1, 2]);
        assert_eq!(diag.servers, ServerCounts::default());
    }

    #[test]
    fn counts_tally_each_state() {
        let records = vec![
            ServerRecord::new("a", ServerState::Writable, &si()),
            ServerRecord::new("b", ServerState::ReadOnly, &si()),
            ServerRecord::new("c", ServerState::Full, &si()),
            ServerRecord::new("d", ServerState::Unreachable, &si()),
            ServerRecord::new("e", ServerState::Writable, &si()),
        ];
        let counts = ServerCounts::tally(&records);
        assert_eq!(
            counts,
            ServerCounts {
                writable: 2,
                read_only: 1,
                full: 1,
                unreachable: 1
            }
        );
        assert_eq!(counts.usable(), 3);
    }

    #[test]
    fn plan_prefers_matched_server_then_best_holder() {
        let mut graph = PlacementGraph::new(3, vec!["a".into(), "b".into()]);
        graph.add_edge(0, 0, EdgeKind::Existing);
        graph.add_edge(0, 1, EdgeKind::Existing);
        graph.add_edge(1, 0, EdgeKind::Existing);
        let matching = maximum_matching(&graph);

        let plan = PlacementPlan::from_graph(si(), EncodingParams::new(1, 2, 3), &graph, &matching);
        assert_eq!(plan.happiness, 2);
        assert_eq!(plan.assignments.get(&0), Some(&"b".to_string()));
        assert_eq!(plan.assignments.get(&1), Some(&"a".to_string()));
        assert!(!plan.assignments.contains_key(&2));
        assert_eq!(plan.shares_on("a"), vec![1]);
        assert_eq!(plan.servers().len(), 2);
    }

    #[test]
    fn shares_stuck_on_a_matched_server_are_unplaced() {
        let records = vec![
            ServerRecord::new("a", ServerState::Writable, &si()).with_held([0, 1, 2]),
            ServerRecord::new("b", ServerState::Writable, &si()),
        ];
        let graph = PlacementGraph::from_records(3, &records);
        let matching = maximum_matching(&graph);
        let diag = Diagnostics::new(si(), EncodingParams::new(1, 2, 3), &records, &matching);

        assert_eq!(diag.achieved, 1);
        assert_eq!(diag.unplaced, vec![1, 2]);
        assert_eq!(diag.shortfall(), 1);
        assert!(diag.to_string().contains("unplaced shares: 1,2)"));
    }

    #[test]
    fn plan_renders_per_server_lines() {
        let mut graph = PlacementGraph::new(2, vec!["a".into()]);
        graph.add_edge(0, 0, EdgeKind::Existing);
        graph.add_edge(1, 0, EdgeKind::Existing);
        let matching = maximum_matching(&graph);
        let plan = PlacementPlan::from_graph(si(), EncodingParams::new(1, 1, 2), &graph, &matching);

        let text = plan.to_string();
        assert!(text.contains("happiness 1 (required 1)"), "{text}");
        assert!(text.contains("  a: 0,1"));
    }

    #[test]
    fn diagnostics_serialize_to_json() {
        let diag = Diagnostics::without_servers(si(), EncodingParams::new(1, 1, 1));
        let json = serde_json::to_value(&diag).unwrap();
        assert_eq!(json["achieved"], 0);
        assert_eq!(json["storage_index"], "03".repeat(16));
        assert_eq!(json["encoding"]["happy"], 1);
    }
}
