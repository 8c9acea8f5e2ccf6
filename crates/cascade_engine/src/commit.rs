//! The commit orchestrator.
//!
//! A commit drains the action buffer and runs strictly ordered phases:
//!
//! 1. **Deleting**: per type, retract facts from every bucket and drop
//!    them (parallel units), then per rule purge the tuples that depended
//!    on dropped keys (parallel units). Delete deltas end here.
//! 2. **Inserting**: bring every type memory up to the registry's schema,
//!    then per type route new records into buckets and store them
//!    (parallel units), then per rule compute new tuples (parallel units),
//!    then refresh each touched rule's match count and collect activations.
//! 3. **Merged**: confirm every tuple and fact produced this cycle.
//!
//! An update is the delete of the old record followed by the insert of
//! the new one under the same handle, so insert-side joins only ever see
//! the post-delete state.
//!
//! A predicate failure aborts the commit mid-phase. The session's
//! buffered actions are gone and its stores may hold a partial delta;
//! `Session::clear` restores a consistent empty state.

use std::sync::atomic::{AtomicUsize, Ordering};

use cascade_foundation::{Error, FactHandle, FactRecord, Result, TypeRegistry, ValueInterner};
use cascade_memory::TypeMemory;
use tracing::{debug, debug_span};

use crate::beta::{MatchFact, RuleNetwork};
use crate::buffer::Action;
use crate::scheduler::{TaskScheduler, WorkUnit};

/// Phases of a commit cycle.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum CommitPhase {
    /// Actions are buffered; nothing has been applied.
    #[default]
    Buffered,
    /// Deletes are being applied.
    Deleting,
    /// Inserts are being applied.
    Inserting,
    /// Every delta of the cycle has been merged.
    Merged,
}

/// Counters for one commit cycle.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommitStats {
    /// The session's cycle number.
    pub cycle: u64,
    /// Last phase reached.
    pub phase: CommitPhase,
    /// Facts stored, updates included.
    pub facts_inserted: usize,
    /// Facts dropped, updates included.
    pub facts_deleted: usize,
    /// Tuples produced by condition nodes.
    pub tuples_produced: usize,
    /// Tuples purged from condition nodes.
    pub tuples_removed: usize,
    /// Activations queued.
    pub activations: usize,
}

/// Mutable session state a commit works on.
pub(crate) struct CommitContext<'s> {
    pub(crate) registry: &'s TypeRegistry,
    pub(crate) memories: &'s mut [TypeMemory],
    pub(crate) rules: &'s mut [RuleNetwork],
    pub(crate) interner: &'s mut ValueInterner,
    pub(crate) scheduler: &'s dyn TaskScheduler,
}

/// A match found by a commit, for the rule at the given index.
pub(crate) type Found = (usize, Vec<MatchFact>);

impl CommitContext<'_> {
    /// Runs one commit cycle over drained actions.
    pub(crate) fn run(
        self,
        cycle: u64,
        actions: Vec<(FactHandle, Action)>,
    ) -> Result<(CommitStats, Vec<Found>)> {
        let span = debug_span!("commit", cycle);
        let _enter = span.enter();

        let mut stats = CommitStats {
            cycle,
            ..CommitStats::default()
        };
        if actions.is_empty() {
            stats.phase = CommitPhase::Merged;
            return Ok((stats, Vec::new()));
        }

        let CommitContext {
            registry,
            memories,
            rules,
            interner,
            scheduler,
        } = self;

        // Group by type. An update deletes the old record and inserts the
        // new one under the same id.
        let mut deletes: Vec<Vec<u64>> = vec![Vec::new(); memories.len()];
        let mut inserts: Vec<Vec<(u64, FactRecord)>> =
            (0..memories.len()).map(|_| Vec::new()).collect();
        for (handle, action) in actions {
            let t = handle.type_id.index();
            if t >= memories.len() {
                return Err(Error::internal(format!("no memory for handle {handle}")));
            }
            match action {
                Action::Insert(record) => inserts[t].push((handle.id, record)),
                Action::Update(record) => {
                    deletes[t].push(handle.id);
                    inserts[t].push((handle.id, record));
                }
                Action::Delete => deletes[t].push(handle.id),
            }
        }

        // =====================================================================
        // Delete phase
        // =====================================================================
        stats.phase = CommitPhase::Deleting;
        let deleted = AtomicUsize::new(0);
        let units: Vec<WorkUnit<'_>> = memories
            .iter_mut()
            .zip(&deletes)
            .filter(|(_, ids)| !ids.is_empty())
            .map(|(memory, ids)| {
                let deleted = &deleted;
                Box::new(move || {
                    memory.retract_batch(ids)?;
                    let removed = memory.commit_delete(ids);
                    deleted.fetch_add(removed.len(), Ordering::Relaxed);
                    Ok(())
                }) as WorkUnit<'_>
            })
            .collect();
        scheduler.run_all(units)?;
        stats.facts_deleted = deleted.into_inner();

        let dirty: Vec<bool> = rules
            .iter()
            .map(|r| r.has_delete_delta(&*memories))
            .collect();
        let purged = AtomicUsize::new(0);
        {
            let memories: &[TypeMemory] = &*memories;
            let units: Vec<WorkUnit<'_>> = rules
                .iter_mut()
                .zip(&dirty)
                .filter(|(_, dirty)| **dirty)
                .map(|(rule, _)| {
                    let purged = &purged;
                    Box::new(move || {
                        let removed = rule.purge_deleted(memories)?;
                        purged.fetch_add(removed, Ordering::Relaxed);
                        Ok(())
                    }) as WorkUnit<'_>
                })
                .collect();
            scheduler.run_all(units)?;
        }
        stats.tuples_removed = purged.into_inner();

        for memory in memories.iter_mut() {
            memory.merge_delete_deltas();
        }
        for rule in rules.iter_mut() {
            rule.clear_removed();
        }
        debug!(
            facts = stats.facts_deleted,
            tuples = stats.tuples_removed,
            "delete phase complete"
        );

        // =====================================================================
        // Insert phase
        // =====================================================================
        stats.phase = CommitPhase::Inserting;

        // Pick up fields and conditions registered since the last commit,
        // by this session or any other sharing the registry.
        for memory in memories.iter_mut() {
            let ty = memory.type_id();
            memory.sync_schema(
                registry.active_fields(ty),
                registry.alpha_conditions(ty),
                &mut *interner,
            )?;
        }
        for (memory, batch) in memories.iter().zip(inserts.iter_mut()) {
            for (_, record) in batch.iter_mut() {
                *record = memory.refresh(record.clone(), &mut *interner)?;
            }
        }

        let inserted = AtomicUsize::new(0);
        let units: Vec<WorkUnit<'_>> = memories
            .iter_mut()
            .zip(inserts)
            .filter(|(_, batch)| !batch.is_empty())
            .map(|(memory, batch)| {
                let inserted = &inserted;
                Box::new(move || {
                    memory.insert_batch(&batch)?;
                    inserted.fetch_add(batch.len(), Ordering::Relaxed);
                    memory.commit_insert(batch);
                    Ok(())
                }) as WorkUnit<'_>
            })
            .collect();
        scheduler.run_all(units)?;
        stats.facts_inserted = inserted.into_inner();

        let memories_view: &[TypeMemory] = &*memories;
        let interner_view: &ValueInterner = &*interner;
        let grown: Vec<bool> = rules
            .iter()
            .map(|r| r.has_insert_delta(memories_view))
            .collect();
        let produced = AtomicUsize::new(0);
        let units: Vec<WorkUnit<'_>> = rules
            .iter_mut()
            .zip(&grown)
            .filter(|(_, grown)| **grown)
            .map(|(rule, _)| {
                let produced = &produced;
                Box::new(move || {
                    let count = rule.compute_delta(true, memories_view, interner_view)?;
                    produced.fetch_add(count, Ordering::Relaxed);
                    Ok(())
                }) as WorkUnit<'_>
            })
            .collect();
        scheduler.run_all(units)?;
        stats.tuples_produced = produced.into_inner();

        // Match counts and activations, while fresh facts are still
        // distinguishable. Removals were counted by the purge.
        let mut found = Vec::new();
        for (index, rule) in rules.iter_mut().enumerate() {
            if !grown[index] {
                continue;
            }
            rule.count_inserts(memories_view)?;
            if rule.rhs().is_some() {
                rule.for_each_match(memories_view, true, |facts| found.push((index, facts)))?;
            }
        }
        stats.activations = found.len();
        debug!(
            facts = stats.facts_inserted,
            tuples = stats.tuples_produced,
            activations = stats.activations,
            "insert phase complete"
        );

        // =====================================================================
        // Merge
        // =====================================================================
        for (rule, grown) in rules.iter_mut().zip(&grown) {
            if *grown {
                rule.merge();
            }
        }
        for memory in memories.iter_mut() {
            memory.merge_insert_deltas();
        }
        stats.phase = CommitPhase::Merged;
        debug!("merged");

        Ok((stats, found))
    }
}
