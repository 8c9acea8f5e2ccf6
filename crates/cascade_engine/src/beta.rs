//! Beta network: per-rule join nodes over alpha buckets.
//!
//! A [`RuleNetwork`] is an arena of [`BetaNode`]s addressed by [`NodeId`].
//! The first nodes are plain nodes, one per fact variable, each reading
//! that variable's alpha bucket. Condition nodes follow in dependency
//! order: a node only reads nodes with smaller ids.
//!
//! Every source is read through three cursor modes ([`KeyMode`]) that
//! partition its rows. During a commit cycle a condition node enumerates
//! the mode assignments of its sources, skips the all-`Main` assignment
//! (already joined in an earlier cycle) and any assignment with an empty
//! cursor, and joins the rest with a nested loop. Each assignment names a
//! disjoint slice of the cross product, so no row combination is visited
//! twice in one cycle.

use std::ops::Range;
use std::sync::Arc;

use cascade_foundation::{
    Error, Fact, FactHandle, Result, TypeId, Value, ValueInterner, ValueResolver,
};
use cascade_memory::{
    AlphaBucket, JoinTuple, KeyFacts, KeyMode, KeysStore, MemoryKey, TypeMemory,
};
use tracing::trace;

use crate::rule::{JoinTest, PlanSource, Rhs, RuleDescriptor};

/// Index of a node within its rule network.
pub type NodeId = usize;

static NIL: Value = Value::Nil;

/// Widest join a network accepts, in sources per node or terminals per
/// rule. Every cursor-mode assignment of a join must fit in a `u64`.
pub const MAX_JOIN_ARITY: usize = 40;

/// Number of cursor-mode assignments over `arity` sources.
fn mode_assignments(arity: usize) -> Option<u64> {
    u32::try_from(arity).ok().and_then(|n| 3u64.checked_pow(n))
}

/// Mode of the source at `code`'s lowest base-3 digit.
fn mode_digit(code: u64) -> KeyMode {
    match code % 3 {
        0 => KeyMode::Main,
        1 => KeyMode::KnownDelta,
        _ => KeyMode::NewDelta,
    }
}

/// The alpha bucket a fact variable reads.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FactSlot {
    /// The fact type.
    pub type_id: TypeId,
    /// Bucket index within the type memory.
    pub bucket: usize,
}

/// A node of a rule network.
#[derive(Debug)]
pub enum BetaNode {
    /// Reads one fact variable's alpha bucket.
    Plain {
        /// The fact variable.
        fact: usize,
    },
    /// Joins one or more sources under a test.
    Condition(ConditionNode),
}

impl BetaNode {
    /// Returns the fact variables this node's rows cover, in row order.
    #[must_use]
    pub fn facts(&self) -> &[usize] {
        match self {
            Self::Plain { fact } => std::slice::from_ref(fact),
            Self::Condition(node) => &node.facts,
        }
    }
}

/// Where a source row feeds one argument value.
#[derive(Copy, Clone, Debug)]
struct Binding {
    slot: usize,
    offset: usize,
    position: usize,
}

#[derive(Clone)]
struct NodeCondition {
    args: Range<usize>,
    ready: usize,
    test: JoinTest,
}

/// A join node and its tuple store.
pub struct ConditionNode {
    sources: Vec<NodeId>,
    spans: Vec<Range<usize>>,
    facts: Vec<usize>,
    bindings: Vec<Vec<Binding>>,
    conditions: Vec<NodeCondition>,
    arg_count: usize,
    store: KeysStore,
}

impl ConditionNode {
    /// Returns the node's sources in join order.
    #[must_use]
    pub fn sources(&self) -> &[NodeId] {
        &self.sources
    }

    /// Returns the node's tuple store.
    #[must_use]
    pub fn store(&self) -> &KeysStore {
        &self.store
    }

    /// Returns the number of conditions the node tests.
    #[must_use]
    pub fn condition_count(&self) -> usize {
        self.conditions.len()
    }
}

impl std::fmt::Debug for ConditionNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConditionNode")
            .field("sources", &self.sources)
            .field("facts", &self.facts)
            .field("conditions", &self.conditions.len())
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Source views
// =============================================================================

/// Read-only view of a node's input.
enum SourceView<'a> {
    Bucket(&'a AlphaBucket),
    Store(&'a KeysStore),
}

impl<'a> SourceView<'a> {
    fn rows(&self, mode: KeyMode) -> Vec<&'a [MemoryKey]> {
        match *self {
            Self::Bucket(bucket) => bucket.rows(mode).map(std::slice::from_ref).collect(),
            Self::Store(store) => store.rows(mode).map(JoinTuple::keys).collect(),
        }
    }

    fn all_rows(&self) -> Vec<&'a [MemoryKey]> {
        match *self {
            Self::Bucket(bucket) => bucket.keys().map(std::slice::from_ref).collect(),
            Self::Store(store) => store.iter().map(JoinTuple::keys).collect(),
        }
    }

    fn was_deleted(&self, keys: &[MemoryKey]) -> bool {
        match *self {
            Self::Bucket(bucket) => keys.first().is_some_and(|k| bucket.is_deleted(k)),
            Self::Store(store) => store.was_removed(keys),
        }
    }
}

fn bucket<'a>(slot: FactSlot, memories: &'a [TypeMemory]) -> Result<&'a AlphaBucket> {
    memories
        .get(slot.type_id.index())
        .and_then(|m| m.bucket(slot.bucket))
        .ok_or_else(|| Error::internal(format!("missing bucket {slot:?}")))
}

fn view<'a>(
    nodes: &'a [BetaNode],
    id: NodeId,
    slots: &[FactSlot],
    memories: &'a [TypeMemory],
) -> Result<SourceView<'a>> {
    match nodes.get(id) {
        Some(BetaNode::Plain { fact }) => Ok(SourceView::Bucket(bucket(slots[*fact], memories)?)),
        Some(BetaNode::Condition(node)) => Ok(SourceView::Store(&node.store)),
        None => Err(Error::internal(format!("node {id} is not upstream"))),
    }
}

// =============================================================================
// Join pass
// =============================================================================

/// Per-pass state of a node's nested-loop join.
struct JoinPass<'a, 'n> {
    rule: &'n str,
    bindings: &'n [Vec<Binding>],
    conditions: &'n [NodeCondition],
    interner: &'a ValueInterner,
    values: Vec<&'a Value>,
    chosen: Vec<&'a [MemoryKey]>,
}

impl<'a> JoinPass<'a, '_> {
    fn bind(&mut self, depth: usize, row: &'a [MemoryKey]) -> Result<()> {
        for binding in &self.bindings[depth] {
            let value = row
                .get(binding.offset)
                .and_then(|key| key.handles().get(binding.position))
                .and_then(|&h| self.interner.value(h))
                .ok_or_else(|| Error::internal("join row does not cover its bindings"))?;
            self.values[binding.slot] = value;
        }
        self.chosen[depth] = row;
        Ok(())
    }

    fn passes(&self, depth: usize) -> Result<bool> {
        for condition in self.conditions.iter().filter(|c| c.ready == depth) {
            let passed = (condition.test)(&self.values[condition.args.clone()])
                .map_err(|e| Error::predicate(self.rule, e.to_string()))?;
            if !passed {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn descend(
        &mut self,
        depth: usize,
        cursors: &[&Vec<&'a [MemoryKey]>],
        store: &mut KeysStore,
    ) -> Result<usize> {
        if depth == cursors.len() {
            let keys: Vec<MemoryKey> = self.chosen.iter().flat_map(|r| r.iter().cloned()).collect();
            store.insert(JoinTuple::new(keys));
            return Ok(1);
        }
        let mut produced = 0;
        for &row in cursors[depth] {
            self.bind(depth, row)?;
            if self.passes(depth)? {
                produced += self.descend(depth + 1, cursors, store)?;
            }
        }
        Ok(produced)
    }
}

impl ConditionNode {
    fn compute(
        &mut self,
        rule: &str,
        delta_only: bool,
        upstream: &[BetaNode],
        slots: &[FactSlot],
        memories: &[TypeMemory],
        interner: &ValueInterner,
    ) -> Result<usize> {
        let views = self
            .sources
            .iter()
            .map(|&id| view(upstream, id, slots, memories))
            .collect::<Result<Vec<_>>>()?;

        let mut rows: Vec<[Vec<&[MemoryKey]>; 3]> = views
            .iter()
            .map(|v| {
                [
                    Vec::new(),
                    v.rows(KeyMode::KnownDelta),
                    v.rows(KeyMode::NewDelta),
                ]
            })
            .collect();
        let no_delta = rows.iter().all(|r| r[1].is_empty() && r[2].is_empty());
        if delta_only && no_delta {
            return Ok(0);
        }
        for (r, v) in rows.iter_mut().zip(&views) {
            r[0] = v.rows(KeyMode::Main);
        }

        let arity = self.sources.len();
        let Self {
            bindings,
            conditions,
            arg_count,
            store,
            ..
        } = self;
        let mut pass = JoinPass {
            rule,
            bindings,
            conditions,
            interner,
            values: vec![&NIL; *arg_count],
            chosen: vec![<&[MemoryKey]>::default(); arity],
        };

        let assignments = mode_assignments(arity)
            .ok_or_else(|| Error::internal(format!("rule {rule}: join over {arity} sources")))?;
        let mut produced = 0;
        let mut cursors = Vec::with_capacity(arity);
        for assignment in 0..assignments {
            let mut code = assignment;
            let mut has_delta = false;
            cursors.clear();
            for r in &rows {
                let mode = mode_digit(code);
                code /= 3;
                has_delta |= mode.is_delta();
                cursors.push(&r[mode.index()]);
            }
            if delta_only && !has_delta {
                continue;
            }
            if cursors.iter().any(|c| c.is_empty()) {
                continue;
            }
            produced += pass.descend(0, &cursors, store)?;
        }
        Ok(produced)
    }
}

// =============================================================================
// Match counting
// =============================================================================

/// Which fact count of a key a row count reads.
#[derive(Copy, Clone, Debug)]
enum Tally {
    /// Every fact under the key now.
    Current,
    /// Facts confirmed before this cycle's inserts.
    Confirmed,
    /// Facts under the key before this cycle's removals.
    BeforeDeletes,
}

/// Number of fact combinations a terminal row stands for.
fn row_count(buckets: &[&AlphaBucket], facts: &[usize], row: &[MemoryKey], tally: Tally) -> u64 {
    row.iter().zip(facts).fold(1, |product: u64, (key, &fact)| {
        let bucket = buckets[fact];
        let count = match tally {
            Tally::Current => bucket.facts(key).map_or(0, KeyFacts::len),
            Tally::Confirmed => bucket.facts(key).map_or(0, |f| f.confirmed().len()),
            Tally::BeforeDeletes => bucket.len_before_deletes(key),
        };
        product.saturating_mul(count as u64)
    })
}

// =============================================================================
// Rule Network
// =============================================================================

/// One fact of a match: its handle and instance.
pub type MatchFact = (FactHandle, Arc<Fact>);

/// The beta network of one rule in one session.
pub struct RuleNetwork {
    name: Arc<str>,
    salience: i32,
    vars: Arc<[Arc<str>]>,
    slots: Vec<FactSlot>,
    nodes: Vec<BetaNode>,
    terminals: Vec<NodeId>,
    rhs: Option<Rhs>,
    sums: Vec<u64>,
    match_count: u64,
}

impl RuleNetwork {
    /// Rejects a rule whose condition nodes or terminal set are wider
    /// than [`MAX_JOIN_ARITY`].
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` naming the rule.
    pub fn check_width(descriptor: &RuleDescriptor) -> Result<()> {
        if descriptor.terminals.len() > MAX_JOIN_ARITY {
            return Err(Error::invalid_argument(format!(
                "rule {} has {} independent fact groups (maximum {MAX_JOIN_ARITY})",
                descriptor.name,
                descriptor.terminals.len()
            )));
        }
        if let Some(plan) = descriptor.nodes.iter().find(|p| p.sources.len() > MAX_JOIN_ARITY) {
            return Err(Error::invalid_argument(format!(
                "rule {} joins {} sources in one node (maximum {MAX_JOIN_ARITY})",
                descriptor.name,
                plan.sources.len()
            )));
        }
        Ok(())
    }

    /// Builds a rule's nodes over resolved buckets.
    ///
    /// `slots[i]` is the bucket of the descriptor's fact `i`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if `slots` does not match the rule's facts,
    /// or if the rule fails [`check_width`](Self::check_width).
    pub fn instantiate(
        descriptor: &RuleDescriptor,
        slots: Vec<FactSlot>,
        min_capacity: usize,
    ) -> Result<Self> {
        let fact_count = descriptor.facts.len();
        if slots.len() != fact_count {
            return Err(Error::invalid_argument(format!(
                "rule {} has {fact_count} facts but {} buckets",
                descriptor.name,
                slots.len()
            )));
        }

        let mut nodes: Vec<BetaNode> = (0..fact_count)
            .map(|fact| BetaNode::Plain { fact })
            .collect();
        let id_of = |source: PlanSource| match source {
            PlanSource::Fact(f) => f,
            PlanSource::Node(n) => fact_count + n,
        };

        Self::check_width(descriptor)?;

        for plan in &descriptor.nodes {
            let sources: Vec<NodeId> = plan.sources.iter().map(|&s| id_of(s)).collect();
            let mut spans = Vec::with_capacity(sources.len());
            let mut facts = Vec::new();
            for &id in &sources {
                let upstream = nodes.get(id).ok_or_else(|| {
                    Error::internal(format!("rule {}: node {id} planned out of order", descriptor.name))
                })?;
                let start = facts.len();
                facts.extend_from_slice(upstream.facts());
                spans.push(start..facts.len());
            }

            let mut bindings: Vec<Vec<Binding>> = vec![Vec::new(); sources.len()];
            let mut conditions = Vec::with_capacity(plan.conditions.len());
            let mut slot = 0;
            for condition in &plan.conditions {
                let start = slot;
                let mut ready = 0;
                for &(fact, position) in &condition.args {
                    let at = facts.iter().position(|&f| f == fact).ok_or_else(|| {
                        Error::internal(format!(
                            "rule {}: condition reads a fact outside its node",
                            descriptor.name
                        ))
                    })?;
                    let source = spans.iter().position(|s| s.contains(&at)).unwrap_or(0);
                    bindings[source].push(Binding {
                        slot,
                        offset: at - spans[source].start,
                        position,
                    });
                    ready = ready.max(source);
                    slot += 1;
                }
                conditions.push(NodeCondition {
                    args: start..slot,
                    ready,
                    test: condition.test.clone(),
                });
            }

            nodes.push(BetaNode::Condition(ConditionNode {
                sources,
                spans,
                facts,
                bindings,
                conditions,
                arg_count: slot,
                store: KeysStore::new(min_capacity),
            }));
        }

        Ok(Self {
            name: descriptor.name.clone(),
            salience: descriptor.salience,
            vars: descriptor.facts.iter().map(|f| f.var.clone()).collect(),
            slots,
            nodes,
            terminals: descriptor.terminals.iter().map(|&t| id_of(t)).collect(),
            rhs: descriptor.rhs.clone(),
            sums: vec![0; descriptor.terminals.len()],
            match_count: 0,
        })
    }

    /// Returns the rule name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the rule salience.
    #[must_use]
    pub fn salience(&self) -> i32 {
        self.salience
    }

    /// Returns the fact variable names in declaration order.
    #[must_use]
    pub fn vars(&self) -> &Arc<[Arc<str>]> {
        &self.vars
    }

    /// Returns the rule's action.
    #[must_use]
    pub fn rhs(&self) -> Option<&Rhs> {
        self.rhs.as_ref()
    }

    /// Returns the bucket of every fact variable.
    #[must_use]
    pub fn slots(&self) -> &[FactSlot] {
        &self.slots
    }

    /// Returns a node.
    #[must_use]
    pub fn node(&self, id: NodeId) -> Option<&BetaNode> {
        self.nodes.get(id)
    }

    /// Returns every node in dependency order.
    #[must_use]
    pub fn nodes(&self) -> &[BetaNode] {
        &self.nodes
    }

    /// Returns the terminal nodes.
    #[must_use]
    pub fn terminals(&self) -> &[NodeId] {
        &self.terminals
    }

    /// Returns the number of fact combinations matching the rule, as of
    /// the last commit.
    #[must_use]
    pub fn match_count(&self) -> u64 {
        self.match_count
    }

    /// Returns true if a bucket this rule reads gained facts this cycle.
    #[must_use]
    pub fn has_insert_delta(&self, memories: &[TypeMemory]) -> bool {
        self.slots
            .iter()
            .any(|&s| bucket(s, memories).is_ok_and(AlphaBucket::has_insert_delta))
    }

    /// Returns true if a bucket this rule reads lost facts this cycle.
    #[must_use]
    pub fn has_delete_delta(&self, memories: &[TypeMemory]) -> bool {
        self.slots
            .iter()
            .any(|&s| bucket(s, memories).is_ok_and(AlphaBucket::has_delete_delta))
    }

    // =========================================================================
    // Propagation
    // =========================================================================

    /// Computes every condition node's new tuples, in dependency order.
    ///
    /// With `delta_only`, combinations drawn entirely from confirmed rows
    /// are skipped; without it (hot deployment) every combination is
    /// joined. Returns the number of tuples produced.
    ///
    /// # Errors
    ///
    /// Returns a `Predicate` error naming this rule if a join test fails.
    pub fn compute_delta(
        &mut self,
        delta_only: bool,
        memories: &[TypeMemory],
        interner: &ValueInterner,
    ) -> Result<usize> {
        let mut produced = 0;
        for id in 0..self.nodes.len() {
            let (upstream, rest) = self.nodes.split_at_mut(id);
            let BetaNode::Condition(node) = &mut rest[0] else {
                continue;
            };
            let count = node.compute(&self.name, delta_only, upstream, &self.slots, memories, interner)?;
            trace!(rule = %self.name, node = id, produced = count, "computed node delta");
            produced += count;
        }
        Ok(produced)
    }

    /// Purges tuples that depend on keys dropped this cycle, in dependency
    /// order. Returns the number of tuples removed.
    ///
    /// # Errors
    ///
    /// Returns `Internal` if a bucket this rule reads is missing.
    pub fn purge_deleted(&mut self, memories: &[TypeMemory]) -> Result<usize> {
        let mut removed = 0;
        for id in 0..self.nodes.len() {
            let (upstream, rest) = self.nodes.split_at_mut(id);
            let BetaNode::Condition(node) = &mut rest[0] else {
                continue;
            };
            let views = node
                .sources
                .iter()
                .map(|&s| view(upstream, s, &self.slots, memories))
                .collect::<Result<Vec<_>>>()?;
            let spans = &node.spans;
            let count = node.store.purge(|tuple| {
                views
                    .iter()
                    .zip(spans)
                    .any(|(v, span)| v.was_deleted(&tuple.keys()[span.clone()]))
            });
            trace!(rule = %self.name, node = id, removed = count, "purged node");
            removed += count;
        }
        self.count_deletes(memories)?;
        Ok(removed)
    }

    /// Ends every node's delete delta.
    pub fn clear_removed(&mut self) {
        for node in &mut self.nodes {
            if let BetaNode::Condition(node) = node {
                node.store.clear_removed();
            }
        }
    }

    /// Confirms every node's delta. Returns the number of tuples moved.
    pub fn merge(&mut self) -> usize {
        self.nodes
            .iter_mut()
            .map(|node| match node {
                BetaNode::Condition(node) => node.store.merge(),
                BetaNode::Plain { .. } => 0,
            })
            .sum()
    }

    /// Drops every tuple.
    pub fn clear(&mut self) {
        for node in &mut self.nodes {
            if let BetaNode::Condition(node) = node {
                node.store.clear();
            }
        }
        self.sums.fill(0);
        self.match_count = 0;
    }

    // =========================================================================
    // Matches
    // =========================================================================

    fn terminal_views<'a>(&'a self, memories: &'a [TypeMemory]) -> Result<Vec<SourceView<'a>>> {
        self.terminals
            .iter()
            .map(|&t| view(&self.nodes, t, &self.slots, memories))
            .collect()
    }

    fn buckets<'a>(&self, memories: &'a [TypeMemory]) -> Result<Vec<&'a AlphaBucket>> {
        self.slots.iter().map(|&s| bucket(s, memories)).collect()
    }

    fn settle_match_count(&mut self) -> u64 {
        self.match_count = self.sums.iter().fold(1, |total: u64, &sum| total.saturating_mul(sum));
        self.match_count
    }

    /// Recounts the derived match count from every terminal row.
    ///
    /// Hot deployment starts its count here; commits keep it current with
    /// [`count_inserts`](Self::count_inserts) and the removals counted by
    /// [`purge_deleted`](Self::purge_deleted).
    ///
    /// # Errors
    ///
    /// Returns `Internal` if a bucket this rule reads is missing.
    pub fn refresh_match_count(&mut self, memories: &[TypeMemory]) -> Result<u64> {
        let buckets = self.buckets(memories)?;
        let mut sums = Vec::with_capacity(self.terminals.len());
        for (view, &terminal) in self.terminal_views(memories)?.iter().zip(&self.terminals) {
            let facts = self.nodes[terminal].facts();
            let sum = view.all_rows().into_iter().fold(0, |sum: u64, row| {
                sum.saturating_add(row_count(&buckets, facts, row, Tally::Current))
            });
            sums.push(sum);
        }
        self.sums = sums;
        Ok(self.settle_match_count())
    }

    /// Adds this cycle's new combinations to the match count: fresh facts
    /// under known rows, and new rows.
    ///
    /// Runs after [`compute_delta`](Self::compute_delta) and before
    /// [`merge`](Self::merge). Only rows of the cycle's delta are read.
    ///
    /// # Errors
    ///
    /// Returns `Internal` if a bucket this rule reads is missing.
    pub fn count_inserts(&mut self, memories: &[TypeMemory]) -> Result<u64> {
        let buckets = self.buckets(memories)?;
        for (sum, &terminal) in self.sums.iter_mut().zip(&self.terminals) {
            let mut gained: u64 = 0;
            match &self.nodes[terminal] {
                BetaNode::Plain { fact } => {
                    let bucket = buckets[*fact];
                    for key in bucket
                        .rows(KeyMode::KnownDelta)
                        .chain(bucket.rows(KeyMode::NewDelta))
                    {
                        let fresh = bucket.facts(key).map_or(0, |f| f.fresh().len());
                        gained = gained.saturating_add(fresh as u64);
                    }
                }
                BetaNode::Condition(node) => {
                    for tuple in node.store.rows(KeyMode::NewDelta) {
                        let now = row_count(&buckets, &node.facts, tuple.keys(), Tally::Current);
                        gained = gained.saturating_add(now);
                    }
                    for tuple in node.store.rows(KeyMode::KnownDelta) {
                        let now = row_count(&buckets, &node.facts, tuple.keys(), Tally::Current);
                        let before =
                            row_count(&buckets, &node.facts, tuple.keys(), Tally::Confirmed);
                        gained = gained.saturating_add(now.saturating_sub(before));
                    }
                }
            }
            *sum = sum.saturating_add(gained);
        }
        Ok(self.settle_match_count())
    }

    /// Takes this cycle's removals out of the match count: facts gone from
    /// surviving rows, and purged rows.
    fn count_deletes(&mut self, memories: &[TypeMemory]) -> Result<u64> {
        let buckets = self.buckets(memories)?;
        for (sum, &terminal) in self.sums.iter_mut().zip(&self.terminals) {
            let mut lost: u64 = 0;
            let mut kept: u64 = 0;
            match &self.nodes[terminal] {
                BetaNode::Plain { fact } => {
                    let bucket = buckets[*fact];
                    for (key, before) in bucket.shrunk_keys() {
                        let now = bucket.facts(key).map_or(0, KeyFacts::len);
                        lost = lost.saturating_add(before as u64);
                        kept = kept.saturating_add(now as u64);
                    }
                }
                BetaNode::Condition(node) => {
                    for tuple in node.store.removed() {
                        let before =
                            row_count(&buckets, &node.facts, tuple.keys(), Tally::BeforeDeletes);
                        lost = lost.saturating_add(before);
                    }
                    for tuple in node.store.iter() {
                        let keys = tuple.keys();
                        let shrunk = keys
                            .iter()
                            .zip(&node.facts)
                            .any(|(key, &fact)| buckets[fact].was_shrunk(key));
                        if shrunk {
                            let before = row_count(&buckets, &node.facts, keys, Tally::BeforeDeletes);
                            let now = row_count(&buckets, &node.facts, keys, Tally::Current);
                            lost = lost.saturating_add(before);
                            kept = kept.saturating_add(now);
                        }
                    }
                }
            }
            *sum = sum.saturating_sub(lost).saturating_add(kept);
        }
        Ok(self.settle_match_count())
    }

    /// Visits fact combinations matching the rule, in fact declaration
    /// order.
    ///
    /// With `fresh_only`, only combinations holding at least one fact
    /// inserted this cycle are visited; otherwise every match is.
    ///
    /// # Errors
    ///
    /// Returns `Internal` if a tuple names a key or fact that is missing.
    pub fn for_each_match(
        &self,
        memories: &[TypeMemory],
        fresh_only: bool,
        mut visit: impl FnMut(Vec<MatchFact>),
    ) -> Result<()> {
        let views = self.terminal_views(memories)?;
        let layout: Vec<usize> = self
            .terminals
            .iter()
            .flat_map(|&t| self.nodes[t].facts().iter().copied())
            .collect();
        let buckets = self
            .slots
            .iter()
            .map(|&s| bucket(s, memories))
            .collect::<Result<Vec<_>>>()?;
        let mut expander = Expander {
            layout: &layout,
            slots: &self.slots,
            buckets: &buckets,
            memories,
            fresh_only,
            keys: Vec::with_capacity(layout.len()),
            picked: vec![(0, false); layout.len()],
        };

        if fresh_only {
            let modes: Vec<[Vec<&[MemoryKey]>; 3]> = views
                .iter()
                .map(|v| KeyMode::ALL.map(|m| v.rows(m)))
                .collect();
            let count = mode_assignments(views.len()).ok_or_else(|| {
                Error::internal(format!("rule {}: too many terminals", self.name))
            })?;
            for assignment in 1..count {
                let mut code = assignment;
                let cursors: Vec<&Vec<&[MemoryKey]>> = modes
                    .iter()
                    .map(|m| {
                        let mode = mode_digit(code);
                        code /= 3;
                        &m[mode.index()]
                    })
                    .collect();
                expander.rows(0, &cursors, &mut visit)?;
            }
        } else {
            let all: Vec<Vec<&[MemoryKey]>> = views.iter().map(SourceView::all_rows).collect();
            let cursors: Vec<&Vec<&[MemoryKey]>> = all.iter().collect();
            expander.rows(0, &cursors, &mut visit)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for RuleNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuleNetwork")
            .field("name", &self.name)
            .field("salience", &self.salience)
            .field("nodes", &self.nodes)
            .field("terminals", &self.terminals)
            .field("match_count", &self.match_count)
            .finish_non_exhaustive()
    }
}

/// Expands terminal row combinations into fact combinations.
struct Expander<'a, 'r> {
    layout: &'r [usize],
    slots: &'r [FactSlot],
    buckets: &'r [&'a AlphaBucket],
    memories: &'a [TypeMemory],
    fresh_only: bool,
    keys: Vec<&'a MemoryKey>,
    picked: Vec<(u64, bool)>,
}

impl<'a> Expander<'a, '_> {
    fn rows(
        &mut self,
        terminal: usize,
        cursors: &[&Vec<&'a [MemoryKey]>],
        visit: &mut impl FnMut(Vec<MatchFact>),
    ) -> Result<()> {
        if terminal == cursors.len() {
            return self.facts(0, false, visit);
        }
        let mark = self.keys.len();
        for &row in cursors[terminal] {
            self.keys.truncate(mark);
            self.keys.extend(row);
            self.rows(terminal + 1, cursors, visit)?;
        }
        self.keys.truncate(mark);
        Ok(())
    }

    fn facts(
        &mut self,
        position: usize,
        any_fresh: bool,
        visit: &mut impl FnMut(Vec<MatchFact>),
    ) -> Result<()> {
        if position == self.layout.len() {
            if self.fresh_only && !any_fresh {
                return Ok(());
            }
            return self.emit(visit);
        }
        let fact = self.layout[position];
        let key = self.keys[position];
        let facts = self.buckets[fact]
            .facts(key)
            .ok_or_else(|| Error::internal(format!("tuple names unknown key {key:?}")))?;
        for (id, fresh) in facts
            .confirmed()
            .map(|id| (id, false))
            .chain(facts.fresh().map(|id| (id, true)))
        {
            self.picked[position] = (id, fresh);
            self.facts(position + 1, any_fresh || fresh, visit)?;
        }
        Ok(())
    }

    fn emit(&self, visit: &mut impl FnMut(Vec<MatchFact>)) -> Result<()> {
        let mut out: Vec<Option<MatchFact>> = vec![None; self.layout.len()];
        for (&fact, &(id, _)) in self.layout.iter().zip(&self.picked) {
            let type_id = self.slots[fact].type_id;
            let instance = self.memories[type_id.index()]
                .fact(id)
                .ok_or_else(|| Error::internal(format!("fact {id} missing from memory")))?;
            out[fact] = Some((FactHandle::new(type_id, id), instance.clone()));
        }
        visit(out.into_iter().flatten().collect());
        Ok(())
    }
}
