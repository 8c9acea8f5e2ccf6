//! Rule declarations.
//!
//! A [`RuleBuilder`] names the facts a rule matches, the single-fact
//! filters and multi-fact joins over them, a salience, and the action to
//! run for each match. The [`RuleCompiler`] turns it into a
//! [`RuleDescriptor`] that sessions instantiate as a beta network.

pub mod compiler;

pub use compiler::{
    FactDecl, PlanCondition, PlanNode, PlanSource, RuleCompiler, RuleDescriptor,
};

use std::fmt;
use std::sync::Arc;

use cascade_foundation::{AlphaTest, Result, Value, alpha_test};

use crate::agenda::RhsContext;

/// Predicate over the values a join reads, in reference order.
pub type JoinTest = Arc<dyn Fn(&[&Value]) -> Result<bool> + Send + Sync>;

/// Wraps a closure as a [`JoinTest`].
pub fn join_test(test: impl Fn(&[&Value]) -> Result<bool> + Send + Sync + 'static) -> JoinTest {
    Arc::new(test)
}

/// Action run once per activation.
pub type Rhs = Arc<dyn Fn(&mut RhsContext<'_>) -> Result<()> + Send + Sync>;

// =============================================================================
// Builder
// =============================================================================

#[derive(Clone)]
pub(crate) struct FilterSpec {
    pub(crate) var: String,
    pub(crate) field: String,
    pub(crate) test: AlphaTest,
}

#[derive(Clone)]
pub(crate) struct JoinSpec {
    pub(crate) refs: Vec<String>,
    pub(crate) test: JoinTest,
}

/// Declares a rule.
///
/// ```
/// use cascade_engine::RuleBuilder;
///
/// let rule = RuleBuilder::new("big-spender")
///     .fact("$c", "Customer")
///     .fact("$o", "Order")
///     .filter("$o", "total", |v| v.as_int().is_some_and(|t| t > 100))
///     .join(&["$c.id", "$o.customer"], |args| args[0] == args[1])
///     .salience(10);
/// assert_eq!(rule.name(), "big-spender");
/// ```
#[derive(Clone)]
pub struct RuleBuilder {
    pub(crate) name: Arc<str>,
    pub(crate) facts: Vec<(String, String)>,
    pub(crate) filters: Vec<FilterSpec>,
    pub(crate) joins: Vec<JoinSpec>,
    pub(crate) salience: i32,
    pub(crate) rhs: Option<Rhs>,
}

impl RuleBuilder {
    /// Starts a rule with the given name.
    #[must_use]
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Self {
            name: name.into(),
            facts: Vec::new(),
            filters: Vec::new(),
            joins: Vec::new(),
            salience: 0,
            rhs: None,
        }
    }

    /// Returns the rule name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declares a fact variable of a type.
    #[must_use]
    pub fn fact(mut self, var: &str, type_name: &str) -> Self {
        self.facts.push((var.to_string(), type_name.to_string()));
        self
    }

    /// Adds a single-field filter on a fact variable.
    #[must_use]
    pub fn filter(
        self,
        var: &str,
        field: &str,
        test: impl Fn(&Value) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.try_filter(var, field, move |v| Ok(test(v)))
    }

    /// Adds a fallible single-field filter on a fact variable.
    #[must_use]
    pub fn try_filter(
        mut self,
        var: &str,
        field: &str,
        test: impl Fn(&Value) -> Result<bool> + Send + Sync + 'static,
    ) -> Self {
        self.filters.push(FilterSpec {
            var: var.to_string(),
            field: field.to_string(),
            test: alpha_test(test),
        });
        self
    }

    /// Adds a condition over fields of one or more fact variables.
    ///
    /// References are written `"$var.field"`; the test receives the
    /// referenced values in the same order.
    #[must_use]
    pub fn join(
        self,
        refs: &[&str],
        test: impl Fn(&[&Value]) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.try_join(refs, move |args| Ok(test(args)))
    }

    /// Adds a fallible condition over fields of one or more fact variables.
    #[must_use]
    pub fn try_join(
        mut self,
        refs: &[&str],
        test: impl Fn(&[&Value]) -> Result<bool> + Send + Sync + 'static,
    ) -> Self {
        self.joins.push(JoinSpec {
            refs: refs.iter().map(ToString::to_string).collect(),
            test: join_test(test),
        });
        self
    }

    /// Sets the salience (higher fires first).
    #[must_use]
    pub fn salience(mut self, salience: i32) -> Self {
        self.salience = salience;
        self
    }

    /// Sets the action run for each activation.
    #[must_use]
    pub fn rhs(
        mut self,
        rhs: impl Fn(&mut RhsContext<'_>) -> Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.rhs = Some(Arc::new(rhs));
        self
    }
}

impl fmt::Debug for RuleBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuleBuilder")
            .field("name", &self.name)
            .field("facts", &self.facts)
            .field("filters", &self.filters.len())
            .field("joins", &self.joins.len())
            .field("salience", &self.salience)
            .finish_non_exhaustive()
    }
}
