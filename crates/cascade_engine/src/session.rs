//! Shared rule bases and working-memory sessions.
//!
//! A [`Knowledge`] owns the type registry and the compiled rules; every
//! [`Session`] created from it instantiates those rules over its own
//! working memory. Sessions buffer mutations and apply them in commit
//! cycles; [`Session::fire`] alternates commits and rule actions until no
//! activation is left.

use std::sync::{Arc, PoisonError, RwLock};

use cascade_foundation::{
    Error, Fact, FactHandle, FactRecord, FieldType, Result, SemanticLimit, TypeId, TypeRegistry,
    TypeResolver, ValueInterner,
};
use cascade_memory::TypeMemory;
use tracing::{debug, info, trace, warn};

use crate::agenda::{Activation, ActivationManager, RhsContext, SalienceOrder};
use crate::beta::{FactSlot, MatchFact, RuleNetwork};
use crate::buffer::{Action, ActionBuffer, Coalesced};
use crate::commit::{CommitContext, CommitStats};
use crate::config::SessionConfig;
use crate::rule::{RuleBuilder, RuleCompiler, RuleDescriptor};
use crate::scheduler::{TaskScheduler, scheduler_for};

// =============================================================================
// Knowledge
// =============================================================================

/// A shared rule base.
///
/// Cloning yields another handle to the same types and rules. Sessions
/// created from it share the registry, so fields activated by one
/// session's hot deployment reach the others at their next commit.
#[derive(Clone, Default)]
pub struct Knowledge {
    registry: TypeRegistry,
    rules: Arc<RwLock<Vec<Arc<RuleDescriptor>>>>,
}

impl Knowledge {
    /// Creates an empty rule base.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the type registry.
    #[must_use]
    pub fn registry(&self) -> &TypeRegistry {
        &self.registry
    }

    /// Declares a fact type.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if the type exists or repeats a field.
    pub fn declare_type(&self, name: &str, fields: &[(&str, FieldType)]) -> Result<TypeId> {
        self.registry.declare_type(name, fields)
    }

    /// Compiles a rule and adds it to the rule base.
    ///
    /// Sessions created afterwards include the rule; existing sessions
    /// are unaffected (see [`Session::deploy`]).
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if a rule with the same name exists, or
    /// any compilation error.
    pub fn add_rule(&self, rule: RuleBuilder) -> Result<()> {
        let mut rules = self.rules.write().unwrap_or_else(PoisonError::into_inner);
        if rules.iter().any(|r| *r.name == *rule.name) {
            return Err(Error::invalid_argument(format!(
                "rule {} is already defined",
                rule.name
            )));
        }
        let descriptor = RuleCompiler::compile(&rule, &self.registry)?;
        RuleNetwork::check_width(&descriptor)?;
        rules.push(Arc::new(descriptor));
        Ok(())
    }

    /// Returns the rule names in definition order.
    #[must_use]
    pub fn rule_names(&self) -> Vec<Arc<str>> {
        self.rules
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|r| r.name.clone())
            .collect()
    }

    /// Creates a session with the default configuration.
    ///
    /// # Errors
    ///
    /// See [`Knowledge::new_session_with`].
    pub fn new_session(&self) -> Result<Session> {
        self.new_session_with(SessionConfig::default())
    }

    /// Creates a session with every rule of the base deployed.
    ///
    /// # Errors
    ///
    /// Returns `Internal` if a rule cannot be instantiated.
    pub fn new_session_with(&self, config: SessionConfig) -> Result<Session> {
        let rules: Vec<Arc<RuleDescriptor>> = self
            .rules
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let mut session = Session::new(self.registry.clone(), config);
        for rule in &rules {
            session.install(rule)?;
        }
        Ok(session)
    }
}

impl std::fmt::Debug for Knowledge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Knowledge")
            .field("registry", &self.registry)
            .field("rules", &self.rule_names())
            .finish()
    }
}

// =============================================================================
// Session
// =============================================================================

/// A working memory with its rule networks.
///
/// Mutations are buffered and take effect at the next [`commit`](Self::commit).
/// A session is driven from one thread at a time; commits parallelize
/// internally according to [`SessionConfig::parallelism`].
pub struct Session {
    registry: TypeRegistry,
    config: SessionConfig,
    interner: ValueInterner,
    memories: Vec<TypeMemory>,
    rules: Vec<RuleNetwork>,
    buffer: ActionBuffer,
    agenda: Vec<Activation>,
    activations: Box<dyn ActivationManager>,
    scheduler: Box<dyn TaskScheduler>,
    active: bool,
    cycle: u64,
    sequence: u64,
}

impl Session {
    /// Creates an empty session over a registry, with no rules.
    #[must_use]
    pub fn new(registry: TypeRegistry, config: SessionConfig) -> Self {
        let mut session = Self {
            registry,
            interner: ValueInterner::new(),
            memories: Vec::new(),
            rules: Vec::new(),
            buffer: ActionBuffer::new(config.action_buffer_capacity),
            agenda: Vec::new(),
            activations: Box::new(SalienceOrder),
            scheduler: scheduler_for(config.parallelism),
            active: true,
            cycle: 0,
            sequence: 0,
            config,
        };
        session.sync_types();
        session
    }

    /// Returns the session configuration.
    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Returns the type registry.
    #[must_use]
    pub fn registry(&self) -> &TypeRegistry {
        &self.registry
    }

    /// Returns true until the session is closed.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Returns the number of commit cycles run.
    #[must_use]
    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    /// Returns the deployed rule names in deployment order.
    #[must_use]
    pub fn rule_names(&self) -> Vec<&str> {
        self.rules.iter().map(RuleNetwork::name).collect()
    }

    /// Returns the number of committed facts.
    #[must_use]
    pub fn fact_count(&self) -> usize {
        self.memories.iter().map(TypeMemory::len).sum()
    }

    /// Returns the number of handles with a buffered action.
    #[must_use]
    pub fn pending_actions(&self) -> usize {
        self.buffer.len()
    }

    /// Returns the activations waiting to fire.
    #[must_use]
    pub fn agenda(&self) -> &[Activation] {
        &self.agenda
    }

    /// Returns the manager that orders each round of [`fire`](Self::fire).
    #[must_use]
    pub fn activation_manager(&self) -> &dyn ActivationManager {
        &*self.activations
    }

    /// Replaces the activation manager and returns the previous one.
    ///
    /// The default is [`SalienceOrder`].
    pub fn set_activation_manager(
        &mut self,
        manager: impl ActivationManager + 'static,
    ) -> Box<dyn ActivationManager> {
        std::mem::replace(&mut self.activations, Box::new(manager))
    }

    fn ensure_open(&self) -> Result<()> {
        if self.active {
            Ok(())
        } else {
            Err(Error::session_closed())
        }
    }

    /// Creates memories for types declared since the last call.
    fn sync_types(&mut self) {
        for descriptor in self.registry.descriptors_from(self.memories.len()) {
            self.memories
                .push(TypeMemory::new(&descriptor, self.config.table_min_capacity));
        }
    }

    fn skipped(&self, what: &str, reason: &str) {
        if self.config.warn_unknown_types {
            warn!(what, reason, "skipped action");
        }
    }

    // =========================================================================
    // Mutations
    // =========================================================================

    /// Buffers the insert of a fact, typed by its own type name.
    ///
    /// Returns `None`, with a warning, if the type is not declared or the
    /// instance is already in the session.
    ///
    /// # Errors
    ///
    /// Returns `SessionClosed` if the session was closed.
    pub fn insert(&mut self, fact: Arc<Fact>) -> Result<Option<FactHandle>> {
        self.ensure_open()?;
        match self.registry.resolve(&fact) {
            Some(type_id) => self.buffer_insert(type_id, fact),
            None => {
                self.skipped(fact.type_name(), "undeclared type");
                Ok(None)
            }
        }
    }

    /// Buffers the insert of a fact under an explicit type.
    ///
    /// # Errors
    ///
    /// Returns `SessionClosed` if the session was closed.
    pub fn insert_typed(&mut self, type_name: &str, fact: Arc<Fact>) -> Result<Option<FactHandle>> {
        self.ensure_open()?;
        match self.registry.type_id(type_name) {
            Some(type_id) => self.buffer_insert(type_id, fact),
            None => {
                self.skipped(type_name, "undeclared type");
                Ok(None)
            }
        }
    }

    fn buffer_insert(&mut self, type_id: TypeId, fact: Arc<Fact>) -> Result<Option<FactHandle>> {
        self.sync_types();
        let memory = self
            .memories
            .get_mut(type_id.index())
            .ok_or_else(|| Error::internal(format!("no memory for type {type_id:?}")))?;
        let Some(id) = memory.register_new_fact(&fact) else {
            self.skipped(fact.type_name(), "instance already inserted");
            return Ok(None);
        };
        let record = FactRecord::new(fact).append_values(memory.fields(), &mut self.interner);
        let handle = FactHandle::new(type_id, id);
        self.buffer.insert(handle, record);
        trace!(%handle, "buffered insert");
        Ok(Some(handle))
    }

    /// Buffers a replacement instance for a fact.
    ///
    /// Unknown handles, handles pending deletion, and instances already
    /// tracked under another handle are skipped with a warning. The
    /// replacement is tracked under `handle` at once, so inserting it again
    /// before the commit is rejected.
    ///
    /// # Errors
    ///
    /// Returns `SessionClosed` if the session was closed.
    pub fn update(&mut self, handle: FactHandle, fact: Arc<Fact>) -> Result<()> {
        self.ensure_open()?;
        let pending = match self.buffer.get(&handle) {
            Some(Action::Delete) => {
                self.skipped(&handle.to_string(), "pending deletion");
                return Ok(());
            }
            other => other.is_some(),
        };
        let Some(memory) = self.memories.get_mut(handle.type_id.index()) else {
            self.skipped(&handle.to_string(), "unknown handle");
            return Ok(());
        };
        if !pending && !memory.contains(handle.id) {
            self.skipped(&handle.to_string(), "unknown handle");
            return Ok(());
        }
        if !memory.track(&fact, handle.id) {
            self.skipped(&handle.to_string(), "instance belongs to another fact");
            return Ok(());
        }

        let instance = Arc::clone(&fact);
        let record = FactRecord::new(fact).append_values(memory.fields(), &mut self.interner);
        match self.buffer.update(handle, record) {
            Coalesced::Replaced(previous) => {
                self.release_superseded(handle, &previous.fact, Some(&instance));
            }
            Coalesced::Ignored => {
                self.release_superseded(handle, &instance, None);
                self.skipped(&handle.to_string(), "pending deletion");
                return Ok(());
            }
            Coalesced::Buffered | Coalesced::Released(_) => {}
        }
        trace!(%handle, "buffered update");
        Ok(())
    }

    /// Buffers the removal of a fact.
    ///
    /// Deleting a fact inserted since the last commit cancels the insert.
    ///
    /// # Errors
    ///
    /// Returns `SessionClosed` if the session was closed.
    pub fn delete(&mut self, handle: FactHandle) -> Result<()> {
        self.ensure_open()?;
        let t = handle.type_id.index();
        let known = self.buffer.get(&handle).is_some()
            || self.memories.get(t).is_some_and(|m| m.contains(handle.id));
        if !known {
            self.skipped(&handle.to_string(), "unknown handle");
            return Ok(());
        }
        match self.buffer.delete(handle) {
            Coalesced::Released(record) => {
                if let Some(memory) = self.memories.get_mut(t) {
                    memory.forget_pending(&record.fact, handle.id);
                }
            }
            Coalesced::Replaced(previous) => self.release_superseded(handle, &previous.fact, None),
            Coalesced::Buffered | Coalesced::Ignored => {}
        }
        trace!(%handle, "buffered delete");
        Ok(())
    }

    /// Releases the identity of a buffered instance that will never commit,
    /// unless `handle` still holds it, committed or as `current`.
    fn release_superseded(
        &mut self,
        handle: FactHandle,
        superseded: &Arc<Fact>,
        current: Option<&Arc<Fact>>,
    ) {
        let Some(memory) = self.memories.get_mut(handle.type_id.index()) else {
            return;
        };
        let held = current.is_some_and(|f| Arc::ptr_eq(f, superseded))
            || memory.fact(handle.id).is_some_and(|f| Arc::ptr_eq(f, superseded));
        if !held {
            memory.forget_pending(superseded, handle.id);
        }
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Returns the current instance of a fact, buffered changes included.
    ///
    /// # Errors
    ///
    /// Returns `SessionClosed` if the session was closed.
    pub fn get_fact(&self, handle: FactHandle) -> Result<Option<Arc<Fact>>> {
        self.ensure_open()?;
        if let Some(action) = self.buffer.get(&handle) {
            return Ok(action.record().map(|r| r.fact.clone()));
        }
        Ok(self
            .memories
            .get(handle.type_id.index())
            .and_then(|m| m.fact(handle.id))
            .cloned())
    }

    /// Visits every fact as the next commit will leave it: committed facts
    /// with buffered updates applied and buffered deletes skipped, then
    /// buffered inserts.
    ///
    /// # Errors
    ///
    /// Returns `SessionClosed` if the session was closed.
    pub fn for_each_fact(&self, mut visit: impl FnMut(FactHandle, &Arc<Fact>)) -> Result<()> {
        self.ensure_open()?;
        for memory in &self.memories {
            for (id, record) in memory.iter() {
                let handle = FactHandle::new(memory.type_id(), id);
                match self.buffer.get(&handle) {
                    None => visit(handle, &record.fact),
                    Some(action) => {
                        if let Some(pending) = action.record() {
                            visit(handle, &pending.fact);
                        }
                    }
                }
            }
        }
        for (handle, action) in self.buffer.iter() {
            let committed = self
                .memories
                .get(handle.type_id.index())
                .is_some_and(|m| m.contains(handle.id));
            if committed {
                continue;
            }
            if let Some(record) = action.record() {
                visit(*handle, &record.fact);
            }
        }
        Ok(())
    }

    fn rule(&self, name: &str) -> Result<&RuleNetwork> {
        self.rules
            .iter()
            .find(|r| r.name() == name)
            .ok_or_else(|| Error::invalid_argument(format!("no rule named {name}")))
    }

    /// Returns the committed fact combinations matching a rule, in the
    /// rule's fact declaration order.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if no rule has that name.
    pub fn rule_matches(&self, name: &str) -> Result<Vec<Vec<Arc<Fact>>>> {
        let rule = self.rule(name)?;
        let mut matches = Vec::new();
        rule.for_each_match(&self.memories, false, |facts| {
            matches.push(facts.into_iter().map(|(_, fact)| fact).collect());
        })?;
        Ok(matches)
    }

    /// Returns the number of committed fact combinations matching a rule.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if no rule has that name.
    pub fn match_count(&self, name: &str) -> Result<u64> {
        Ok(self.rule(name)?.match_count())
    }

    /// Returns a rule's network.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if no rule has that name.
    pub fn network(&self, name: &str) -> Result<&RuleNetwork> {
        self.rule(name)
    }

    // =========================================================================
    // Commit and fire
    // =========================================================================

    /// Applies every buffered action and queues the activations it creates.
    ///
    /// # Errors
    ///
    /// Returns `SessionClosed` if the session was closed, or the first
    /// failure of the cycle. After a failure the session should be
    /// [`clear`](Self::clear)ed.
    pub fn commit(&mut self) -> Result<CommitStats> {
        self.ensure_open()?;
        self.sync_types();
        let actions = self.buffer.drain();
        self.cycle += 1;
        let (stats, found) = CommitContext {
            registry: &self.registry,
            memories: &mut self.memories,
            rules: &mut self.rules,
            interner: &mut self.interner,
            scheduler: self.scheduler.as_ref(),
        }
        .run(self.cycle, actions)?;
        for (rule, facts) in found {
            self.queue(rule, facts);
        }
        debug!(
            cycle = stats.cycle,
            inserted = stats.facts_inserted,
            deleted = stats.facts_deleted,
            activations = stats.activations,
            "committed"
        );
        Ok(stats)
    }

    fn queue(&mut self, rule: usize, facts: Vec<MatchFact>) {
        self.sequence += 1;
        self.agenda.push(Activation {
            rule,
            salience: self.rules[rule].salience(),
            sequence: self.sequence,
            facts,
        });
    }

    /// An activation is stale once one of its facts changed or left.
    fn is_stale(&self, activation: &Activation) -> bool {
        activation.facts.iter().any(|(handle, fact)| {
            self.buffer.get(handle).is_some()
                || self
                    .memories
                    .get(handle.type_id.index())
                    .and_then(|m| m.fact(handle.id))
                    .is_none_or(|current| !Arc::ptr_eq(current, fact))
        })
    }

    /// Commits and runs rule actions until no activation is left.
    ///
    /// Each round commits the buffer, then runs the queued activations in
    /// the order the [`ActivationManager`] picks (by default descending
    /// salience, then deployment order, then queue order). Activations
    /// whose facts changed earlier in the round are skipped.
    /// Returns the number of actions run.
    ///
    /// # Errors
    ///
    /// Returns `LimitExceeded` after `max_fire_cycles` rounds, or the
    /// first commit or action failure.
    pub fn fire(&mut self) -> Result<usize> {
        let mut fired = 0;
        let mut rounds = 0;
        loop {
            self.commit()?;
            if self.agenda.is_empty() {
                return Ok(fired);
            }
            rounds += 1;
            if rounds > self.config.max_fire_cycles {
                return Err(Error::limit_exceeded(SemanticLimit::MaxFireCycles {
                    limit: self.config.max_fire_cycles,
                }));
            }

            let mut agenda = std::mem::take(&mut self.agenda);
            self.activations.order(&mut agenda);
            for activation in agenda {
                if self.is_stale(&activation) {
                    trace!(sequence = activation.sequence, "skipped stale activation");
                    continue;
                }
                let rule = &self.rules[activation.rule];
                let Some(rhs) = rule.rhs().cloned() else {
                    continue;
                };
                let name: Arc<str> = rule.name().into();
                let vars = rule.vars().clone();
                let mut ctx = RhsContext::new(self, name, vars, &activation.facts);
                rhs(&mut ctx)?;
                fired += 1;
            }
        }
    }

    // =========================================================================
    // Deployment
    // =========================================================================

    /// Compiles a rule and deploys it into this session only.
    ///
    /// The rule is evaluated against every committed fact, and activations
    /// for all of its matches are queued. Buffered actions stay pending.
    ///
    /// # Errors
    ///
    /// Returns `SessionClosed`, `InvalidArgument` for a duplicate name, any
    /// compilation error, or a predicate failure while backfilling.
    pub fn deploy(&mut self, rule: RuleBuilder) -> Result<()> {
        self.ensure_open()?;
        if self.rules.iter().any(|r| r.name() == rule.name()) {
            return Err(Error::invalid_argument(format!(
                "rule {} is already deployed",
                rule.name()
            )));
        }
        let descriptor = RuleCompiler::compile(&rule, &self.registry)?;
        self.install(&descriptor)
    }

    fn install(&mut self, descriptor: &RuleDescriptor) -> Result<()> {
        RuleNetwork::check_width(descriptor)?;
        self.sync_types();
        for memory in &mut self.memories {
            let ty = memory.type_id();
            memory.sync_schema(
                self.registry.active_fields(ty),
                self.registry.alpha_conditions(ty),
                &mut self.interner,
            )?;
        }

        let mut slots = Vec::with_capacity(descriptor.facts.len());
        for decl in &descriptor.facts {
            let memory = self.memories.get_mut(decl.type_id.index()).ok_or_else(|| {
                Error::internal(format!("no memory for type {:?}", decl.type_id))
            })?;
            let (bucket, _) = memory.touch_bucket(decl.fields.clone(), decl.mask.clone())?;
            slots.push(FactSlot {
                type_id: decl.type_id,
                bucket,
            });
        }

        let mut network =
            RuleNetwork::instantiate(descriptor, slots, self.config.table_min_capacity)?;
        let produced = network.compute_delta(false, &self.memories, &self.interner)?;
        let matches = network.refresh_match_count(&self.memories)?;
        let mut found = Vec::new();
        if network.rhs().is_some() {
            network.for_each_match(&self.memories, false, |facts| found.push(facts))?;
        }
        network.merge();
        for memory in &mut self.memories {
            memory.merge_insert_deltas();
        }

        let index = self.rules.len();
        self.rules.push(network);
        for facts in found {
            self.queue(index, facts);
        }
        info!(rule = %descriptor.name, produced, matches, "deployed rule");
        Ok(())
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Drops every fact, tuple, buffered action, and activation. Rules
    /// stay deployed.
    ///
    /// # Errors
    ///
    /// Returns `SessionClosed` if the session was closed.
    pub fn clear(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.buffer.clear();
        self.agenda.clear();
        for memory in &mut self.memories {
            memory.clear();
        }
        for rule in &mut self.rules {
            rule.clear();
        }
        debug!("cleared session");
        Ok(())
    }

    /// Closes the session. Every later mutation fails with `SessionClosed`.
    pub fn close(&mut self) {
        if self.active {
            self.active = false;
            self.buffer.clear();
            self.agenda.clear();
            debug!(cycle = self.cycle, "closed session");
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("active", &self.active)
            .field("cycle", &self.cycle)
            .field("memories", &self.memories)
            .field("rules", &self.rule_names())
            .field("pending", &self.buffer.len())
            .field("agenda", &self.agenda.len())
            .finish_non_exhaustive()
    }
}
