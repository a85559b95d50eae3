//! ServerSelector: plans, negotiates and verifies one upload.
//!
//! Queries every candidate, builds the share/server graph from what the
//! grid already holds, extends it greedily with tentative edges, and
//! commits those through per-server negotiators. Rejections demote the
//! server and trigger a re-plan, up to one iteration per candidate.
//!
//! Each pass runs three barriers over all servers at once: reserve,
//! write, close. Nothing is closed until every reservation is in and
//! every write has landed with the plan still happy, so a failed or
//! cancelled attempt can abort every bucket it opened.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::future::join_all;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use sharegrid_storage::{ShareIndex, StorageIndex, StorageServer};

use crate::config::SelectorConfig;
use crate::error::PlacementError;
use crate::graph::{EdgeKind, PlacementGraph};
use crate::matcher::{Matching, maximum_matching};
use crate::negotiator::{AllocationNegotiator, ReserveOutcome, ServerFault, with_timeout};
use crate::outcome::{Diagnostics, Outcome, PlacementPlan, ServerCounts};
use crate::types::{
    Candidate, EncodingParams, ServerRecord, ServerState, UploadParams, rank_order,
};

/// Orchestrates share placement for uploads.
#[derive(Debug, Clone, Default)]
pub struct ServerSelector {
    config: SelectorConfig,
}

impl ServerSelector {
    pub fn new(config: SelectorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SelectorConfig {
        &self.config
    }

    /// Place `shares` (one buffer per share index) on `candidates`.
    pub async fn select_and_place<S: StorageServer>(
        &self,
        params: &UploadParams,
        candidates: &[Candidate<S>],
        shares: &[Bytes],
    ) -> Outcome {
        self.place(params, candidates, shares, None).await
    }

    /// Like [`select_and_place`](Self::select_and_place), but gives up
    /// with [`PlacementError::Cancelled`] once `cancel` turns true. Any
    /// reservation made before that point is aborted first. Once shares
    /// start closing the attempt runs to completion.
    pub async fn select_and_place_with_cancel<S: StorageServer>(
        &self,
        params: &UploadParams,
        candidates: &[Candidate<S>],
        shares: &[Bytes],
        cancel: watch::Receiver<bool>,
    ) -> Outcome {
        self.place(params, candidates, shares, Some(cancel)).await
    }

    async fn place<S: StorageServer>(
        &self,
        params: &UploadParams,
        candidates: &[Candidate<S>],
        shares: &[Bytes],
        cancel: Option<watch::Receiver<bool>>,
    ) -> Outcome {
        let storage_index = params.storage_index;
        let encoding = params.encoding;
        encoding.validate()?;
        if shares.len() != encoding.total as usize {
            return Err(PlacementError::ShareCount {
                expected: encoding.total as usize,
                actual: shares.len(),
            });
        }

        let candidates = distinct(candidates);
        if candidates.is_empty() {
            warn!(%storage_index, "no candidate servers");
            return Err(PlacementError::NoServers(Box::new(
                Diagnostics::without_servers(storage_index, encoding),
            )));
        }

        let cancelled = wait_for_cancel(cancel);
        tokio::pin!(cancelled);

        let query = self.query_all(&storage_index, encoding.total, &candidates);
        let Some(snapshot) = unless_cancelled(&mut cancelled, query).await else {
            return Err(PlacementError::Cancelled(storage_index));
        };
        let mut attempt = Attempt::new(&self.config, storage_index, encoding, snapshot, shares);

        let graph = attempt.graph();
        let baseline = maximum_matching(&graph);
        if baseline.happiness() >= encoding.happy as usize {
            info!(
                %storage_index,
                happiness = baseline.happiness(),
                "already happy, nothing to write"
            );
            return Ok(PlacementPlan::from_graph(storage_index, encoding, &graph, &baseline));
        }

        let counts = ServerCounts::tally(&attempt.records);
        if counts.usable() < encoding.happy as usize {
            let mut hypothetical = graph;
            attempt.extend(&mut hypothetical);
            let diagnostics = attempt.diagnostics(&maximum_matching(&hypothetical));
            warn!(
                %storage_index,
                usable = counts.usable(),
                happy = encoding.happy,
                shortfall = diagnostics.shortfall(),
                "too few usable servers"
            );
            return Err(PlacementError::NoServers(Box::new(diagnostics)));
        }

        let budget = self.config.iteration_budget(candidates.len());
        for iteration in 1..=budget {
            let last = iteration == budget;
            let mut graph = attempt.graph();
            attempt.extend(&mut graph);
            let matching = maximum_matching(&graph);
            debug!(
                %storage_index,
                iteration,
                happiness = matching.happiness(),
                edges = graph.edge_count(),
                "planned"
            );

            if matching.happiness() < encoding.happy as usize {
                return Err(attempt.fail(&matching).await);
            }

            let wanted = attempt.unreserved(&graph);
            if !wanted.is_empty() {
                attempt.iterations = iteration;
                attempt.reserved.extend(wanted.keys().copied());
                let reserve = attempt.reserve_all(&wanted);
                let Some(replies) = unless_cancelled(&mut cancelled, reserve).await else {
                    return Err(attempt.cancel(iteration).await);
                };
                // On the last pass a happy remainder is written as is.
                if !attempt.apply_reservations(replies) && !(last && attempt.is_happy()) {
                    continue;
                }
            }

            let pending = attempt.unwritten();
            if !pending.is_empty() {
                attempt.iterations = iteration;
                let write = attempt.run_stage(Stage::Write, &pending);
                let Some(reports) = unless_cancelled(&mut cancelled, write).await else {
                    return Err(attempt.cancel(iteration).await);
                };
                if !attempt.apply_writes(reports) && !(last && attempt.is_happy()) {
                    continue;
                }
            }

            return attempt.commit().await;
        }

        let matching = maximum_matching(&attempt.graph());
        warn!(%storage_index, budget, "re-planning budget exhausted");
        Err(attempt.fail(&matching).await)
    }

    /// Query every candidate concurrently. Records come back in
    /// candidate order, paired with their servers.
    async fn query_all<S: StorageServer>(
        &self,
        storage_index: &StorageIndex,
        total: u32,
        candidates: &[&Candidate<S>],
    ) -> Vec<(ServerRecord, Arc<S>)> {
        let queries = candidates
            .iter()
            .map(|candidate| self.query_one(storage_index, total, candidate));
        join_all(queries)
            .await
            .into_iter()
            .zip(candidates)
            .map(|(record, candidate)| (record, Arc::clone(&candidate.server)))
            .collect()
    }

    async fn query_one<S: StorageServer>(
        &self,
        storage_index: &StorageIndex,
        total: u32,
        candidate: &Candidate<S>,
    ) -> ServerRecord {
        let queried = with_timeout(
            self.config.query_timeout,
            candidate.server.query_held_shares(storage_index),
        )
        .await;

        let mut record = match queried {
            Ok(held) => {
                let (valid, stray): (BTreeSet<ShareIndex>, BTreeSet<ShareIndex>) =
                    held.shares.into_iter().partition(|share| *share < total);
                if !stray.is_empty() {
                    warn!(server = %candidate.id, shares = ?stray, "ignoring out-of-range shares");
                }
                ServerRecord::new(candidate.id.clone(), held.writability.into(), storage_index)
                    .with_held(valid)
            }
            Err(err) => {
                warn!(server = %candidate.id, error = %err, "query failed, server unreachable");
                ServerRecord::new(candidate.id.clone(), ServerState::Unreachable, storage_index)
            }
        };
        if let Some(hint) = candidate.hint {
            record.state.demote(hint);
        }
        debug!(
            server = %record.id,
            state = %record.state,
            held = record.held.len(),
            "server queried"
        );
        record
    }
}

/// Candidates with duplicate ids removed, first occurrence kept.
fn distinct<S>(candidates: &[Candidate<S>]) -> Vec<&Candidate<S>> {
    let mut seen = HashSet::new();
    candidates
        .iter()
        .filter(|candidate| {
            let fresh = seen.insert(candidate.id.as_str());
            if !fresh {
                warn!(server = %candidate.id, "duplicate candidate ignored");
            }
            fresh
        })
        .collect()
}

/// Resolves once the flag turns true. Without a receiver, or once its
/// sender is dropped, it never resolves.
async fn wait_for_cancel(cancel: Option<watch::Receiver<bool>>) {
    let Some(mut cancel) = cancel else {
        return std::future::pending().await;
    };
    loop {
        if *cancel.borrow_and_update() {
            return;
        }
        if cancel.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Run `work` unless `cancelled` resolves first.
async fn unless_cancelled<T>(
    cancelled: &mut Pin<&mut impl Future<Output = ()>>,
    work: impl Future<Output = T>,
) -> Option<T> {
    tokio::select! {
        biased;
        _ = cancelled.as_mut() => None,
        done = work => Some(done),
    }
}

/// Per-share step applied to reserved buckets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Write,
    Close,
}

/// What one server did with its shares in one stage.
#[derive(Debug, Default)]
struct ServerReport {
    done: BTreeSet<ShareIndex>,
    /// The share that failed and every share queued after it.
    refused: BTreeSet<ShareIndex>,
    fault: Option<ServerFault>,
}

/// Planning state private to one upload attempt.
struct Attempt<'a, S> {
    config: &'a SelectorConfig,
    storage_index: StorageIndex,
    encoding: EncodingParams,
    /// Rank order; `servers[i]` belongs to `records[i]`.
    records: Vec<ServerRecord>,
    servers: Vec<Arc<S>>,
    shares: &'a [Bytes],
    allocated_size: u64,
    /// (share, server position) pairs a server refused.
    rejected: BTreeSet<(ShareIndex, usize)>,
    /// Positions that were sent a reservation.
    reserved: BTreeSet<usize>,
    /// Open buckets this attempt holds, per position.
    accepted: BTreeMap<usize, BTreeSet<ShareIndex>>,
    /// Accepted buckets whose data is written but not yet closed.
    staged: BTreeMap<usize, BTreeSet<ShareIndex>>,
    shares_written: usize,
    iterations: usize,
}

impl<'a, S: StorageServer> Attempt<'a, S> {
    fn new(
        config: &'a SelectorConfig,
        storage_index: StorageIndex,
        encoding: EncodingParams,
        mut snapshot: Vec<(ServerRecord, Arc<S>)>,
        shares: &'a [Bytes],
    ) -> Self {
        snapshot.sort_by(|(a, _), (b, _)| rank_order(a, b));
        let (records, servers): (Vec<ServerRecord>, Vec<Arc<S>>) = snapshot.into_iter().unzip();
        Self {
            config,
            storage_index,
            encoding,
            records,
            servers,
            shares,
            allocated_size: shares.iter().map(|s| s.len() as u64).max().unwrap_or(0),
            rejected: BTreeSet::new(),
            reserved: BTreeSet::new(),
            accepted: BTreeMap::new(),
            staged: BTreeMap::new(),
            shares_written: 0,
            iterations: 0,
        }
    }

    /// Held shares as existing edges, open reservations as tentative
    /// ones.
    fn graph(&self) -> PlacementGraph {
        let mut graph = PlacementGraph::from_records(self.encoding.total, &self.records);
        for (&position, shares) in &self.accepted {
            for &share in shares {
                graph.add_edge(share, position, EdgeKind::Tentative);
            }
        }
        graph
    }

    fn is_happy(&self) -> bool {
        maximum_matching(&self.graph()).happiness() >= self.encoding.happy as usize
    }

    /// Add tentative edges to `graph`.
    ///
    /// Every share without an edge goes to the least-loaded writable
    /// server, ties going to the better rank. If the matching is still
    /// short of the threshold, shares it leaves out are then offered to
    /// writable servers it does not use yet; each such edge raises
    /// happiness by one.
    fn extend(&self, graph: &mut PlacementGraph) {
        let mut load = vec![0usize; self.records.len()];
        for (_, position, _) in graph.edges() {
            load[position] += 1;
        }

        for share in graph.unplaced_shares() {
            if let Some(position) = self.least_loaded(graph, share, &load, |_| true) {
                graph.add_edge(share, position, EdgeKind::Tentative);
                load[position] += 1;
            }
        }

        let matching = maximum_matching(graph);
        let mut missing = (self.encoding.happy as usize).saturating_sub(matching.happiness());
        let mut busy: BTreeSet<usize> = matching
            .pairs()
            .iter()
            .filter_map(|(_, server)| graph.position(server))
            .collect();
        for share in 0..self.encoding.total {
            if missing == 0 {
                break;
            }
            if matching.server_for(share).is_some() {
                continue;
            }
            let idle = self.least_loaded(graph, share, &load, |position| !busy.contains(&position));
            if let Some(position) = idle {
                graph.add_edge(share, position, EdgeKind::Tentative);
                load[position] += 1;
                busy.insert(position);
                missing -= 1;
            }
        }
    }

    /// Best writable server for `share` among those `allowed`, skipping
    /// servers that already have an edge to it or refused it.
    fn least_loaded(
        &self,
        graph: &PlacementGraph,
        share: ShareIndex,
        load: &[usize],
        allowed: impl Fn(usize) -> bool,
    ) -> Option<usize> {
        self.records
            .iter()
            .enumerate()
            .filter(|(position, record)| {
                record.state.is_writable()
                    && allowed(*position)
                    && graph.edge(share, *position).is_none()
                    && !self.rejected.contains(&(share, *position))
            })
            .min_by_key(|(position, _)| (load[*position], *position))
            .map(|(position, _)| position)
    }

    /// Tentative edges of `graph` not yet backed by a reservation.
    fn unreserved(&self, graph: &PlacementGraph) -> BTreeMap<usize, BTreeSet<ShareIndex>> {
        let mut wanted = graph.tentative_by_server();
        for (position, shares) in &mut wanted {
            if let Some(accepted) = self.accepted.get(position) {
                shares.retain(|share| !accepted.contains(share));
            }
        }
        wanted.retain(|_, shares| !shares.is_empty());
        wanted
    }

    /// Accepted buckets still waiting for their data.
    fn unwritten(&self) -> BTreeMap<usize, BTreeSet<ShareIndex>> {
        self.accepted
            .iter()
            .filter_map(|(&position, shares)| {
                let staged = self.staged.get(&position);
                let pending: BTreeSet<ShareIndex> = shares
                    .iter()
                    .copied()
                    .filter(|share| staged.is_none_or(|done| !done.contains(share)))
                    .collect();
                (!pending.is_empty()).then_some((position, pending))
            })
            .collect()
    }

    fn diagnostics(&self, matching: &Matching) -> Diagnostics {
        Diagnostics::new(self.storage_index, self.encoding, &self.records, matching)
    }

    fn negotiator(&self, position: usize) -> AllocationNegotiator<S> {
        AllocationNegotiator::new(
            self.records[position].id.clone(),
            Arc::clone(&self.servers[position]),
            self.allocated_size,
        )
        .with_timeout(self.config.negotiate_timeout)
        .with_secrets(self.config.secrets.clone())
    }

    /// Reserve each server's wanted shares, all servers at once.
    async fn reserve_all(
        &self,
        wanted: &BTreeMap<usize, BTreeSet<ShareIndex>>,
    ) -> Vec<(usize, ReserveOutcome, Option<ServerFault>)> {
        let calls = wanted.iter().map(|(&position, shares)| async move {
            let negotiator = self.negotiator(position);
            match negotiator.reserve(&self.storage_index, shares).await {
                Ok(outcome) => {
                    let fault = outcome.reason.map(ServerFault::Rejected);
                    (position, outcome, fault)
                }
                Err(fault) => {
                    let outcome = ReserveOutcome {
                        rejected: shares.clone(),
                        ..Default::default()
                    };
                    (position, outcome, Some(fault))
                }
            }
        });
        join_all(calls).await
    }

    /// Fold reservation replies into the attempt. Returns true when every
    /// requested share was accepted or already held.
    fn apply_reservations(
        &mut self,
        replies: Vec<(usize, ReserveOutcome, Option<ServerFault>)>,
    ) -> bool {
        let mut clean = true;
        for (position, outcome, fault) in replies {
            self.records[position].held.extend(&outcome.already_held);
            if !outcome.accepted.is_empty() {
                self.accepted
                    .entry(position)
                    .or_default()
                    .extend(&outcome.accepted);
            }
            clean &= self.refuse(position, &outcome.rejected, fault);
        }
        clean
    }

    /// Run `stage` over each server's shares, all servers at once. A
    /// server stops at its first failure and has its open buckets
    /// aborted.
    async fn run_stage(
        &self,
        stage: Stage,
        work: &BTreeMap<usize, BTreeSet<ShareIndex>>,
    ) -> Vec<(usize, ServerReport)> {
        let calls = work.iter().map(|(&position, shares)| async move {
            let negotiator = self.negotiator(position);
            let mut report = ServerReport::default();
            let mut queue = shares.iter().copied();
            while let Some(share) = queue.next() {
                let result = match stage {
                    Stage::Write => {
                        let data = self.shares[share as usize].clone();
                        negotiator.write(&self.storage_index, share, data).await
                    }
                    Stage::Close => negotiator.close(&self.storage_index, share).await,
                };
                if let Err(fault) = result {
                    report.refused.insert(share);
                    report.refused.extend(queue.by_ref());
                    report.fault = Some(fault);
                    if let Err(fault) = negotiator.abort(&self.storage_index).await {
                        warn!(server = %negotiator.server_id(), reason = %fault, "abort failed");
                    }
                    break;
                }
                report.done.insert(share);
            }
            (position, report)
        });
        join_all(calls).await
    }

    /// Fold write reports into the attempt. Returns true when every write
    /// landed.
    fn apply_writes(&mut self, reports: Vec<(usize, ServerReport)>) -> bool {
        let mut clean = true;
        for (position, report) in reports {
            if report.fault.is_some() {
                // Its buckets were aborted, written ones included.
                self.accepted.remove(&position);
                self.staged.remove(&position);
            } else {
                self.staged.entry(position).or_default().extend(&report.done);
            }
            clean &= self.refuse(position, &report.refused, report.fault);
        }
        clean
    }

    /// Remember refused edges and demote the server. Returns true when
    /// nothing was refused.
    fn refuse(
        &mut self,
        position: usize,
        shares: &BTreeSet<ShareIndex>,
        fault: Option<ServerFault>,
    ) -> bool {
        self.rejected.extend(shares.iter().map(|&share| (share, position)));
        let Some(fault) = fault else {
            return shares.is_empty();
        };
        let record = &mut self.records[position];
        if record.state.demote(fault.demoted_state()) {
            warn!(
                server = %record.id,
                state = %record.state,
                refused = shares.len(),
                reason = %fault,
                "server demoted"
            );
        }
        false
    }

    /// Close every written share and build the plan. A close that fails
    /// leaves that server's remaining shares out; if that costs the
    /// threshold, the attempt fails.
    async fn commit(&mut self) -> Outcome {
        let staged = std::mem::take(&mut self.staged);
        self.accepted.clear();
        let reports = self.run_stage(Stage::Close, &staged).await;
        for (position, report) in reports {
            self.shares_written += report.done.len();
            self.records[position].held.extend(&report.done);
            self.refuse(position, &report.refused, report.fault);
        }

        let graph = self.graph();
        let matching = maximum_matching(&graph);
        if matching.happiness() < self.encoding.happy as usize {
            return Err(self.fail(&matching).await);
        }

        let mut plan =
            PlacementPlan::from_graph(self.storage_index, self.encoding, &graph, &matching);
        plan.shares_written = self.shares_written;
        plan.iterations = self.iterations;
        info!(
            storage_index = %self.storage_index,
            happiness = plan.happiness,
            servers = plan.servers().len(),
            written = plan.shares_written,
            iterations = plan.iterations,
            "upload placed"
        );
        Ok(plan)
    }

    /// Abort everything and explain why `matching` is not enough.
    async fn fail(&self, matching: &Matching) -> PlacementError {
        let diagnostics = self.diagnostics(matching);
        self.release().await;
        warn!(
            storage_index = %self.storage_index,
            shortfall = diagnostics.shortfall(),
            %diagnostics,
            "upload is not happy"
        );
        PlacementError::UploadUnhappiness(Box::new(diagnostics))
    }

    async fn cancel(&self, iteration: usize) -> PlacementError {
        warn!(storage_index = %self.storage_index, iteration, "upload cancelled");
        self.release().await;
        PlacementError::Cancelled(self.storage_index)
    }

    /// Abort every reservation made during this attempt.
    async fn release(&self) {
        let aborts = self.reserved.iter().map(|&position| async move {
            let negotiator = self.negotiator(position);
            if let Err(fault) = negotiator.abort(&self.storage_index).await {
                warn!(server = %negotiator.server_id(), reason = %fault, "abort failed");
            }
        });
        join_all(aborts).await;
    }
}
