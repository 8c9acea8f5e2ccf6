//! Activations and the context rule actions run in.

use std::sync::Arc;

use cascade_foundation::{Fact, FactHandle, Result, Value};

use crate::beta::MatchFact;
use crate::session::Session;

// =============================================================================
// Activation
// =============================================================================

/// A rule match waiting to fire.
#[derive(Clone, Debug)]
pub struct Activation {
    /// Index of the rule in its session, in deployment order.
    pub rule: usize,
    /// Rule salience.
    pub salience: i32,
    /// Queue order within the session.
    pub sequence: u64,
    /// The matched facts, in the rule's fact declaration order.
    pub facts: Vec<MatchFact>,
}

impl Activation {
    /// Sort key: salience descending, then deployment order, then queue order.
    #[must_use]
    pub fn priority(&self) -> (std::cmp::Reverse<i32>, usize, u64) {
        (std::cmp::Reverse(self.salience), self.rule, self.sequence)
    }
}

// =============================================================================
// Activation Manager
// =============================================================================

/// Decides which queued activations fire, and in what order.
///
/// Each round of [`Session::fire`] hands the manager the round's
/// activations; those left in the vector run front to back. Activations
/// whose facts changed earlier in the round are still skipped.
pub trait ActivationManager: Send {
    /// Orders, and may drop, one round's activations.
    fn order(&mut self, activations: &mut Vec<Activation>);
}

impl<M: ActivationManager + ?Sized> ActivationManager for Box<M> {
    fn order(&mut self, activations: &mut Vec<Activation>) {
        (**self).order(activations);
    }
}

/// The default manager: salience descending, then deployment order, then
/// queue order.
#[derive(Clone, Copy, Debug, Default)]
pub struct SalienceOrder;

impl ActivationManager for SalienceOrder {
    fn order(&mut self, activations: &mut Vec<Activation>) {
        activations.sort_by_key(Activation::priority);
    }
}

// =============================================================================
// RHS Context
// =============================================================================

/// What a rule action sees while it runs.
///
/// Mutations made through the context are buffered like any other session
/// mutation and take effect at the next commit.
pub struct RhsContext<'s> {
    session: &'s mut Session,
    rule: Arc<str>,
    vars: Arc<[Arc<str>]>,
    facts: &'s [MatchFact],
}

impl<'s> RhsContext<'s> {
    pub(crate) fn new(
        session: &'s mut Session,
        rule: Arc<str>,
        vars: Arc<[Arc<str>]>,
        facts: &'s [MatchFact],
    ) -> Self {
        Self {
            session,
            rule,
            vars,
            facts,
        }
    }

    /// Returns the name of the firing rule.
    #[must_use]
    pub fn rule_name(&self) -> &str {
        &self.rule
    }

    fn position(&self, var: &str) -> Option<usize> {
        self.vars.iter().position(|v| &**v == var)
    }

    /// Returns the fact matched by a variable.
    #[must_use]
    pub fn fact(&self, var: &str) -> Option<&Arc<Fact>> {
        self.position(var).and_then(|i| self.facts.get(i)).map(|(_, f)| f)
    }

    /// Returns the handle of the fact matched by a variable.
    #[must_use]
    pub fn handle(&self, var: &str) -> Option<FactHandle> {
        self.position(var).and_then(|i| self.facts.get(i)).map(|(h, _)| *h)
    }

    /// Reads a field of the fact matched by a variable.
    ///
    /// Unknown variables and missing fields read as nil.
    #[must_use]
    pub fn value(&self, var: &str, field: &str) -> &Value {
        static NIL: Value = Value::Nil;
        self.fact(var).map_or(&NIL, |f| f.get(field))
    }

    /// Buffers the insert of a new fact.
    ///
    /// # Errors
    ///
    /// Returns `SessionClosed` if the session was closed.
    pub fn insert(&mut self, fact: Arc<Fact>) -> Result<Option<FactHandle>> {
        self.session.insert(fact)
    }

    /// Buffers the insert of a new fact under an explicit type name.
    ///
    /// # Errors
    ///
    /// Returns `SessionClosed` if the session was closed.
    pub fn insert_typed(&mut self, type_name: &str, fact: Arc<Fact>) -> Result<Option<FactHandle>> {
        self.session.insert_typed(type_name, fact)
    }

    /// Buffers a replacement for a fact.
    ///
    /// # Errors
    ///
    /// Returns `SessionClosed` if the session was closed.
    pub fn update(&mut self, handle: FactHandle, fact: Arc<Fact>) -> Result<()> {
        self.session.update(handle, fact)
    }

    /// Buffers the removal of a fact.
    ///
    /// # Errors
    ///
    /// Returns `SessionClosed` if the session was closed.
    pub fn delete(&mut self, handle: FactHandle) -> Result<()> {
        self.session.delete(handle)
    }

    /// Returns the current state of a fact, buffered changes included.
    ///
    /// # Errors
    ///
    /// Returns `SessionClosed` if the session was closed.
    pub fn get_fact(&self, handle: FactHandle) -> Result<Option<Arc<Fact>>> {
        self.session.get_fact(handle)
    }
}

impl std::fmt::Debug for RhsContext<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RhsContext")
            .field("rule", &self.rule)
            .field("facts", &self.facts)
            .finish_non_exhaustive()
    }
}
