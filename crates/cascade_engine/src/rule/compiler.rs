//! Rule compiler - resolves a [`RuleBuilder`] and plans its join network.
//!
//! Compilation registers the rule's active fields and alpha conditions in
//! the shared registry, then plans the beta network:
//!
//! 1. Every fact variable starts as its own component, backed by a plain
//!    node over its alpha bucket.
//! 2. Joins over the same set of facts are grouped into one node test.
//! 3. Groups are processed by ascending fact count. A group inside one
//!    component adds a single-source condition node over it; a group
//!    spanning several components adds a node that merges them.
//! 4. Whatever components remain are the rule's terminals. The rule's
//!    matches are the cross product of its terminals.

use std::fmt;
use std::sync::Arc;

use cascade_foundation::{Error, Result, TypeDescriptor, TypeId, TypeRegistry};
use cascade_memory::{AlphaMask, FieldsKey};
use tracing::debug;

use super::{JoinTest, Rhs, RuleBuilder};

// =============================================================================
// Descriptor
// =============================================================================

/// One fact variable of a compiled rule.
#[derive(Clone, Debug)]
pub struct FactDecl {
    /// The variable name.
    pub var: Arc<str>,
    /// The fact type.
    pub type_id: TypeId,
    /// Join key shape of the variable's bucket.
    pub fields: FieldsKey,
    /// Filters the variable's facts must pass.
    pub mask: AlphaMask,
}

/// An input of a planned node or a terminal.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PlanSource {
    /// The plain node of a fact variable.
    Fact(usize),
    /// A planned condition node.
    Node(usize),
}

/// One join condition of a planned node.
#[derive(Clone)]
pub struct PlanCondition {
    /// Arguments as `(fact variable, position in its join key)`.
    pub args: Vec<(usize, usize)>,
    /// The predicate.
    pub test: JoinTest,
}

impl fmt::Debug for PlanCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlanCondition")
            .field("args", &self.args)
            .finish_non_exhaustive()
    }
}

/// A planned condition node.
#[derive(Clone, Debug)]
pub struct PlanNode {
    /// Inputs in join order.
    pub sources: Vec<PlanSource>,
    /// Conditions every produced tuple satisfies.
    pub conditions: Vec<PlanCondition>,
}

/// A compiled rule, ready to be instantiated by any session sharing the
/// registry it was compiled against.
#[derive(Clone)]
pub struct RuleDescriptor {
    /// Rule name.
    pub name: Arc<str>,
    /// Priority (higher fires first).
    pub salience: i32,
    /// Fact variables in declaration order.
    pub facts: Vec<FactDecl>,
    /// Condition nodes in dependency order.
    pub nodes: Vec<PlanNode>,
    /// Independent components whose cross product is the rule's matches.
    pub terminals: Vec<PlanSource>,
    /// Action run for each activation.
    pub rhs: Option<Rhs>,
}

impl fmt::Debug for RuleDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuleDescriptor")
            .field("name", &self.name)
            .field("salience", &self.salience)
            .field("facts", &self.facts)
            .field("nodes", &self.nodes)
            .field("terminals", &self.terminals)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Rule Compiler
// =============================================================================

/// A field reference resolved against a fact variable.
struct FieldRef {
    fact: usize,
    field: String,
}

/// Compiles rule declarations against a type registry.
pub struct RuleCompiler;

impl RuleCompiler {
    /// Compiles a rule.
    ///
    /// Nothing is registered unless every name resolves.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for a rule without facts, a repeated
    /// variable, a malformed reference, or a join without references;
    /// `UnknownType`, `UnknownField`, or `UnknownFactReference` for names
    /// that do not resolve.
    pub fn compile(rule: &RuleBuilder, registry: &TypeRegistry) -> Result<RuleDescriptor> {
        let descriptors = Self::resolve_facts(rule, registry)?;

        let filters = rule
            .filters
            .iter()
            .map(|f| Self::resolve_ref(rule, &descriptors, &f.var, &f.field))
            .collect::<Result<Vec<_>>>()?;

        let joins = rule
            .joins
            .iter()
            .map(|join| {
                if join.refs.is_empty() {
                    return Err(Error::invalid_argument(format!(
                        "rule {}: join without field references",
                        rule.name
                    )));
                }
                join.refs
                    .iter()
                    .map(|r| {
                        let (var, field) = r.split_once('.').ok_or_else(|| {
                            Error::invalid_argument(format!(
                                "rule {}: reference {r} is not of the form $var.field",
                                rule.name
                            ))
                        })?;
                        Self::resolve_ref(rule, &descriptors, var, field)
                    })
                    .collect::<Result<Vec<_>>>()
            })
            .collect::<Result<Vec<_>>>()?;

        // Every name resolved; register fields and conditions.
        let mut key_fields: Vec<Vec<usize>> = vec![Vec::new(); descriptors.len()];
        let mut join_args: Vec<Vec<(usize, usize)>> = Vec::with_capacity(joins.len());
        for refs in &joins {
            let mut args = Vec::with_capacity(refs.len());
            for r in refs {
                let active = registry.register_field(descriptors[r.fact].id, &r.field)?;
                key_fields[r.fact].push(active.index);
                args.push((r.fact, active.index));
            }
            join_args.push(args);
        }
        for fields in &mut key_fields {
            fields.sort_unstable();
            fields.dedup();
        }

        let mut masks: Vec<Vec<usize>> = vec![Vec::new(); descriptors.len()];
        for (spec, r) in rule.filters.iter().zip(&filters) {
            let type_id = descriptors[r.fact].id;
            let active = registry.register_field(type_id, &r.field)?;
            let condition =
                registry.register_alpha(type_id, active.index, &rule.name, spec.test.clone())?;
            masks[r.fact].push(condition.id);
        }

        let facts: Vec<FactDecl> = rule
            .facts
            .iter()
            .zip(&descriptors)
            .zip(key_fields.into_iter().zip(masks))
            .map(|(((var, _), descriptor), (fields, mask))| FactDecl {
                var: var.as_str().into(),
                type_id: descriptor.id,
                fields: FieldsKey::new(descriptor.id, fields),
                mask: AlphaMask::new(mask),
            })
            .collect();

        // Translate field indices into key positions.
        let conditions: Vec<(Vec<usize>, PlanCondition)> = join_args
            .into_iter()
            .zip(&rule.joins)
            .map(|(args, spec)| {
                let args: Vec<(usize, usize)> = args
                    .into_iter()
                    .map(|(fact, index)| {
                        facts[fact]
                            .fields
                            .position(index)
                            .map(|pos| (fact, pos))
                            .ok_or_else(|| Error::internal("join field missing from key"))
                    })
                    .collect::<Result<_>>()?;
                let mut touched: Vec<usize> = args.iter().map(|&(fact, _)| fact).collect();
                touched.sort_unstable();
                touched.dedup();
                Ok((
                    touched,
                    PlanCondition {
                        args,
                        test: spec.test.clone(),
                    },
                ))
            })
            .collect::<Result<_>>()?;

        let (nodes, terminals) = Self::plan(facts.len(), conditions);
        debug!(
            rule = %rule.name,
            facts = facts.len(),
            nodes = nodes.len(),
            terminals = terminals.len(),
            "compiled rule"
        );

        Ok(RuleDescriptor {
            name: rule.name.clone(),
            salience: rule.salience,
            facts,
            nodes,
            terminals,
            rhs: rule.rhs.clone(),
        })
    }

    fn resolve_facts(rule: &RuleBuilder, registry: &TypeRegistry) -> Result<Vec<TypeDescriptor>> {
        if rule.facts.is_empty() {
            return Err(Error::invalid_argument(format!(
                "rule {} declares no facts",
                rule.name
            )));
        }
        rule.facts
            .iter()
            .enumerate()
            .map(|(i, (var, type_name))| {
                if rule.facts[..i].iter().any(|(other, _)| other == var) {
                    return Err(Error::invalid_argument(format!(
                        "rule {}: fact variable {var} declared twice",
                        rule.name
                    )));
                }
                registry
                    .type_id(type_name)
                    .and_then(|id| registry.descriptor(id))
                    .ok_or_else(|| Error::unknown_type(type_name.as_str()))
            })
            .collect()
    }

    fn resolve_ref(
        rule: &RuleBuilder,
        descriptors: &[TypeDescriptor],
        var: &str,
        field: &str,
    ) -> Result<FieldRef> {
        let fact = rule
            .facts
            .iter()
            .position(|(v, _)| v == var)
            .ok_or_else(|| Error::unknown_fact_reference(var))?;
        let descriptor = &descriptors[fact];
        if descriptor.field_type(field).is_none() {
            return Err(Error::unknown_field(&*descriptor.name, field));
        }
        Ok(FieldRef {
            fact,
            field: field.to_string(),
        })
    }

    /// Plans condition nodes from conditions tagged with the sorted set of
    /// facts they touch.
    fn plan(
        fact_count: usize,
        conditions: Vec<(Vec<usize>, PlanCondition)>,
    ) -> (Vec<PlanNode>, Vec<PlanSource>) {
        // Group conditions with identical fact sets, keeping first-seen order.
        let mut groups: Vec<(Vec<usize>, Vec<PlanCondition>)> = Vec::new();
        for (touched, condition) in conditions {
            match groups.iter_mut().find(|(facts, _)| *facts == touched) {
                Some((_, group)) => group.push(condition),
                None => groups.push((touched, vec![condition])),
            }
        }
        groups.sort_by_key(|(facts, _)| facts.len());

        // component[c] = (current output, member facts); None once merged away.
        let mut components: Vec<Option<(PlanSource, Vec<usize>)>> = (0..fact_count)
            .map(|f| Some((PlanSource::Fact(f), vec![f])))
            .collect();
        let mut owner: Vec<usize> = (0..fact_count).collect();
        let mut nodes = Vec::with_capacity(groups.len());

        for (facts, conditions) in groups {
            let mut touched: Vec<usize> = facts.iter().map(|&f| owner[f]).collect();
            touched.sort_unstable();
            touched.dedup();

            let mut sources = Vec::with_capacity(touched.len());
            let mut members = Vec::new();
            for &c in &touched {
                if let Some((source, facts)) = components[c].take() {
                    sources.push(source);
                    members.extend(facts);
                }
            }
            nodes.push(PlanNode {
                sources,
                conditions,
            });

            let merged = touched[0];
            for &f in &members {
                owner[f] = merged;
            }
            components[merged] = Some((PlanSource::Node(nodes.len() - 1), members));
        }

        let terminals = components
            .into_iter()
            .flatten()
            .map(|(source, _)| source)
            .collect();
        (nodes, terminals)
    }
}
