//! Command compiler.
//!
//! Concepts describe their attributes with small commands:
//!
//! ```text
//! A.visual.delta:R += {{B.visual.delta:R}} * {{value}}
//! symbol.text = {{A.symbol}} + '<mo>+</mo>' + {{B.symbol}}
//! symbol.subscript add {{C[index].value}}
//! ```
//!
//! Compiling a command for an entity resolves the selector chains against
//! the relation and creates one [`DepKind::Command`] dependency per reached
//! target. The command's root waits on every referenced key; the target key
//! waits on the command's root. When the root resolves, the expression is
//! evaluated with the propagated values substituted and the result is
//! written to the target.
//!
//! Malformed commands are dropped with a `debug!` record. A reference that
//! reaches no entity leaves its command pending.

pub mod arith;
pub mod expression;
pub mod reference;

pub use arith::{evaluate, evaluate_str, EvalError, Part};
pub use expression::{Block, BoundBlock, ExpressionError, ExpressionTemplate};
pub use reference::{Base, ConceptFilter, Reference, ReferenceError, Selector, Step};

use crate::arena::DepId;
use crate::catalog::Catalog;
use crate::core::{EntityId, Relation};
use crate::data::EntityDeps;
use crate::dependency::{Callback, DepKind, Dependency, DependencyGraph, KeyPath, KeyRef};
use crate::symbol::{fence, SYMBOL_KEY};
use crate::value::Datum;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use thiserror::Error;
use tracing::{debug, trace};

/// Command operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandOp {
    /// `=`
    Assign,
    /// `+=`
    AddAssign,
    /// `-=`
    SubAssign,
    /// `*=`
    MulAssign,
    /// `add`: append as the next indexed child.
    Add,
    /// `addval`: append to the list value.
    AddVal,
    /// `clear`: drop the value and every sub-key.
    Clear,
}

impl CommandOp {
    fn parse(token: &str) -> Option<Self> {
        Some(match token {
            "=" => CommandOp::Assign,
            "+=" => CommandOp::AddAssign,
            "-=" => CommandOp::SubAssign,
            "*=" => CommandOp::MulAssign,
            "add" => CommandOp::Add,
            "addval" => CommandOp::AddVal,
            "clear" => CommandOp::Clear,
            _ => return None,
        })
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CommandOp::Assign => "=",
            CommandOp::AddAssign => "+=",
            CommandOp::SubAssign => "-=",
            CommandOp::MulAssign => "*=",
            CommandOp::Add => "add",
            CommandOp::AddVal => "addval",
            CommandOp::Clear => "clear",
        }
    }
}

impl fmt::Display for CommandOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("missing operator")]
    MissingOperator,
    #[error("unknown operator `{0}`")]
    UnknownOperator(String),
    #[error("malformed target: {0}")]
    Target(#[source] ReferenceError),
    #[error(transparent)]
    Expression(#[from] ExpressionError),
    #[error("`{0}` needs an expression")]
    MissingExpression(CommandOp),
    #[error("`clear` takes no expression")]
    UnexpectedExpression,
}

/// A parsed command, independent of the entity it is compiled for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTemplate {
    pub source: String,
    pub target: Reference,
    pub op: CommandOp,
    pub expression: ExpressionTemplate,
}

impl CommandTemplate {
    /// Parses `target op [expression]`.
    pub fn parse(src: &str) -> Result<Self, CommandError> {
        let source = src.trim();
        let (target_src, rest) = source
            .split_once(char::is_whitespace)
            .ok_or(CommandError::MissingOperator)?;
        let target = Reference::parse(target_src).map_err(CommandError::Target)?;
        let rest = rest.trim_start();
        let (op_src, expr_src) = match rest.split_once(char::is_whitespace) {
            Some((op, expr)) => (op, expr.trim()),
            None => (rest, ""),
        };
        if op_src.is_empty() {
            return Err(CommandError::MissingOperator);
        }
        let op = CommandOp::parse(op_src)
            .ok_or_else(|| CommandError::UnknownOperator(op_src.to_string()))?;
        let expression = ExpressionTemplate::parse(expr_src)?;
        match (op, expression.is_empty()) {
            (CommandOp::Clear, false) => return Err(CommandError::UnexpectedExpression),
            (CommandOp::Clear, true) => {}
            (op, true) => return Err(CommandError::MissingExpression(op)),
            _ => {}
        }
        Ok(Self {
            source: source.to_string(),
            target,
            op,
            expression,
        })
    }
}

/// State of one compiled command instance.
#[derive(Debug, Clone)]
pub struct CommandState {
    source: String,
    owner: EntityId,
    variables: DepId,
    op: CommandOp,
    target: Option<KeyRef>,
    /// Appended to a `$variable` target binding.
    target_suffix: KeyPath,
    recursive_target: bool,
    blocks: Vec<BoundBlock>,
    bind: Option<String>,
    precedence: Option<usize>,
    executed: bool,
}

impl CommandState {
    #[inline]
    pub fn source(&self) -> &str {
        &self.source
    }

    #[inline]
    pub fn owner(&self) -> EntityId {
        self.owner
    }

    #[inline]
    pub fn target(&self) -> Option<&KeyRef> {
        self.target.as_ref()
    }

    #[inline]
    pub fn is_executed(&self) -> bool {
        self.executed
    }
}

/// What compilation reads.
#[derive(Debug, Clone, Copy)]
pub struct CompileContext<'a> {
    pub relation: &'a Relation,
    pub catalog: &'a Catalog,
    pub entities: &'a BTreeMap<EntityId, EntityDeps>,
}

enum Target {
    Key(KeyRef),
    Variable(String),
}

fn variable_key(variables: DepId, name: &str) -> KeyRef {
    KeyRef::new(variables, KeyPath::from_segments([name]))
}

impl DependencyGraph {
    /// Parses and compiles `source` for `owner`; symmetric concepts compile
    /// a second, head/reference swapped instance. Returns the number of
    /// command instances created.
    pub fn compile_source(&mut self, ctx: &CompileContext<'_>, owner: EntityId, source: &str) -> usize {
        let template = match CommandTemplate::parse(source) {
            Ok(template) => template,
            Err(error) => {
                debug!(entity = %owner, command = source, %error, "dropping malformed command");
                return 0;
            }
        };
        let symmetric = ctx
            .relation
            .get(owner)
            .and_then(|e| ctx.catalog.concept(e.concept))
            .map_or(false, |c| c.symmetric);
        let mut count = self.compile_command(ctx, owner, &template, false);
        if symmetric {
            count += self.compile_command(ctx, owner, &template, true);
        }
        count
    }

    /// Compiles one template for `owner`, once per target entity reached.
    pub fn compile_command(
        &mut self,
        ctx: &CompileContext<'_>,
        owner: EntityId,
        template: &CommandTemplate,
        swapped: bool,
    ) -> usize {
        let Some(owner_deps) = ctx.entities.get(&owner).copied() else {
            return 0;
        };
        let targets: Vec<Target> = match &template.target.base {
            Base::Variable(name) => vec![Target::Variable(name.clone())],
            Base::Nodes(_) => template
                .target
                .resolve_nodes(ctx.relation, ctx.catalog, owner, swapped)
                .into_iter()
                .filter_map(|id| ctx.entities.get(&id))
                .map(|deps| Target::Key(deps.data_key(template.target.key.clone())))
                .collect(),
        };
        if targets.is_empty() {
            debug!(entity = %owner, command = %template.source, "target reaches no entity");
            return 0;
        }
        let count = targets.len();
        for target in targets {
            self.instantiate(ctx, owner, owner_deps, template, target, swapped);
        }
        count
    }

    fn instantiate(
        &mut self,
        ctx: &CompileContext<'_>,
        owner: EntityId,
        owner_deps: EntityDeps,
        template: &CommandTemplate,
        target: Target,
        swapped: bool,
    ) {
        if let Target::Key(key) = &target {
            let known = key.key.ancestry().any(|p| {
                self.key(&KeyRef::new(key.dep, p))
                    .map_or(false, |m| m.is_known())
            });
            if known {
                trace!(entity = %owner, target = %key, "target holds primary data; command skipped");
                return;
            }
        }

        let mut blocks = Vec::with_capacity(template.expression.blocks().len());
        let mut waits: Vec<(KeyRef, Option<Callback>)> = Vec::new();
        let mut unresolvable = false;
        for (i, block) in template.expression.blocks().iter().enumerate() {
            match block {
                Block::Text(text) => blocks.push(BoundBlock::Text(text.clone())),
                Block::Ref(r) => match &r.base {
                    Base::Variable(name) => {
                        waits.push((
                            variable_key(owner_deps.variables, name),
                            Some(Callback::BindBlock(i)),
                        ));
                        blocks.push(BoundBlock::Ref {
                            sources: Vec::new(),
                            recursive: r.recursive,
                            suffix: r.key.clone(),
                        });
                    }
                    Base::Nodes(_) => {
                        let sources: Vec<KeyRef> = r
                            .resolve_nodes(ctx.relation, ctx.catalog, owner, swapped)
                            .into_iter()
                            .filter_map(|id| ctx.entities.get(&id))
                            .map(|deps| deps.data_key(r.key.clone()))
                            .collect();
                        if sources.is_empty() {
                            unresolvable = true;
                        }
                        if let (Some(name), Some(first)) = (&r.bind, sources.first()) {
                            self.bind_variable(owner_deps.variables, name, first.clone());
                        }
                        waits.extend(sources.iter().cloned().map(|s| (s, None)));
                        blocks.push(BoundBlock::Ref {
                            sources,
                            recursive: r.recursive,
                            suffix: KeyPath::root(),
                        });
                    }
                },
            }
        }

        let (target_key, target_suffix) = match &target {
            Target::Key(key) => (Some(key.clone()), KeyPath::root()),
            Target::Variable(_) => (None, template.target.key.clone()),
        };
        let constant = template.expression.is_constant() && target_key.is_some();
        let state = CommandState {
            source: template.source.clone(),
            owner,
            variables: owner_deps.variables,
            op: template.op,
            target: target_key.clone(),
            target_suffix,
            recursive_target: template.target.recursive,
            blocks,
            bind: template.target.bind.clone(),
            precedence: self.data_state(owner_deps.data).and_then(|s| s.precedence),
            executed: false,
        };
        let cmd = self.create(DepKind::Command(Box::new(state)));

        // Nothing to wait for: run now, in declaration order.
        if constant {
            self.execute_command(cmd);
            self.remove(cmd);
            return;
        }

        let root = KeyRef::new(cmd, KeyPath::root());
        if unresolvable {
            debug!(entity = %owner, command = %template.source, "reference reaches no entity; command stays pending");
            self.block(&root);
        }
        for (source, callback) in waits {
            self.wait_inner(&root, &source, callback);
        }
        match (target_key, target) {
            (Some(key), _) => {
                self.wait_inner(&key, &root, None);
            }
            (None, Target::Variable(name)) => {
                let var = variable_key(owner_deps.variables, &name);
                self.wait_inner(&root, &var, Some(Callback::BindTarget));
            }
            (None, Target::Key(_)) => {}
        }
        trace!(entity = %owner, command = %template.source, cmd = %cmd, "compiled command");
    }

    /// Compiled command states, in dependency order.
    pub fn commands(&self) -> impl Iterator<Item = (DepId, &CommandState)> {
        self.ids().into_iter().filter_map(move |id| match self.get(id)?.kind() {
            DepKind::Command(state) => Some((id, &**state)),
            _ => None,
        })
    }

    /// Resolution hook of a command root: evaluate and write. Runs once.
    pub(crate) fn execute_command(&mut self, cmd: DepId) {
        let state = match self.get_mut(cmd).map(Dependency::kind_mut) {
            Some(DepKind::Command(state)) if !state.executed => {
                state.executed = true;
                (**state).clone()
            }
            _ => return,
        };
        let Some(target) = state.target.clone() else {
            debug!(command = %state.source, "variable target never bound; nothing written");
            return;
        };
        self.count_command_executed();
        if state.op == CommandOp::Clear {
            self.clear_key(&target);
        } else {
            for (suffix, result) in self.evaluate_command(&state) {
                let key = KeyRef::new(target.dep, target.key.join(&suffix));
                match result {
                    Ok(value) => self.apply(&state, &key, value),
                    Err(error) => {
                        trace!(command = %state.source, key = %key, %error, "evaluation failed; no write")
                    }
                }
            }
        }
        if let Some(name) = &state.bind {
            self.bind_variable(state.variables, name, target);
        }
    }

    /// Evaluates the expression once per sub-key of the recursive sources
    /// (or once at the root when there are none).
    fn evaluate_command(&self, state: &CommandState) -> Vec<(KeyPath, Result<Datum, EvalError>)> {
        let mut suffixes: BTreeSet<KeyPath> = BTreeSet::new();
        let mut recursive_sources: Vec<&KeyRef> = state
            .blocks
            .iter()
            .filter_map(|b| match b {
                BoundBlock::Ref {
                    sources,
                    recursive: true,
                    ..
                } => Some(sources.iter()),
                _ => None,
            })
            .flatten()
            .collect();
        if recursive_sources.is_empty() && state.recursive_target {
            recursive_sources.extend(state.target.as_ref());
        }
        for source in recursive_sources {
            let Some(dep) = self.get(source.dep) else {
                continue;
            };
            for (path, meta) in dep.descendants(&source.key) {
                if meta.value().is_some() {
                    suffixes.extend(path.strip_prefix(&source.key));
                }
            }
        }
        if suffixes.is_empty() {
            return vec![(KeyPath::root(), self.evaluate_at(state, &KeyPath::root()))];
        }
        suffixes
            .into_iter()
            .map(|suffix| {
                let result = self.evaluate_at(state, &suffix);
                (suffix, result)
            })
            .collect()
    }

    fn evaluate_at(&self, state: &CommandState, suffix: &KeyPath) -> Result<Datum, EvalError> {
        let parts: Vec<Part<'_>> = state
            .blocks
            .iter()
            .map(|block| match block {
                BoundBlock::Text(text) => Part::Source(text.as_str()),
                BoundBlock::Ref {
                    sources, recursive, ..
                } => {
                    let mut values: Vec<Datum> = sources
                        .iter()
                        .filter_map(|s| self.operand(state, s, suffix, *recursive))
                        .collect();
                    Part::Operand(match (sources.len(), values.len()) {
                        (_, 0) => None,
                        (1, _) => values.pop(),
                        _ => Some(Datum::List(values)),
                    })
                }
            })
            .collect();
        evaluate(&parts)
    }

    /// Value substituted for `source`. Recursive blocks fall back to the
    /// closest ancestor holding a value.
    fn operand(
        &self,
        state: &CommandState,
        source: &KeyRef,
        suffix: &KeyPath,
        recursive: bool,
    ) -> Option<Datum> {
        let value = if recursive && !suffix.is_root() {
            let full = source.key.join(suffix);
            let nearest = full
                .ancestry()
                .take_while(|p| p.starts_with(&source.key))
                .find_map(|p| self.value(&KeyRef::new(source.dep, p)).cloned());
            nearest
        } else {
            self.value(source).cloned()
        }?;
        let is_symbol = source.key.len() == 1 && source.key.first() == Some(SYMBOL_KEY);
        if !is_symbol {
            return Some(value);
        }
        let theirs = self.data_state(source.dep).and_then(|s| s.precedence);
        match (state.precedence, theirs) {
            (Some(own), Some(theirs)) if own < theirs => Some(Datum::Text(fence(&value.to_string()))),
            _ => Some(value),
        }
    }

    fn apply(&mut self, state: &CommandState, key: &KeyRef, value: Datum) {
        let written = match state.op {
            CommandOp::Assign => self.write_value(key, value),
            CommandOp::AddAssign | CommandOp::SubAssign | CommandOp::MulAssign => {
                let op = match state.op {
                    CommandOp::AddAssign => '+',
                    CommandOp::SubAssign => '-',
                    _ => '*',
                };
                let combined = match self.value(key).cloned() {
                    None => Ok(value),
                    Some(current) => arith::combine(op, current, value),
                };
                match combined {
                    Ok(v) => self.write_value(key, v),
                    Err(error) => {
                        trace!(command = %state.source, key = %key, %error, "accumulation failed");
                        false
                    }
                }
            }
            CommandOp::Add => self.append_child(key, value).is_some(),
            CommandOp::AddVal => self.append_value(key, value),
            CommandOp::Clear => {
                self.clear_key(key);
                true
            }
        };
        trace!(command = %state.source, key = %key, written, "applied command");
    }

    /// Callback run when a `$variable` a command reads or writes is bound.
    pub(crate) fn bind_command_variable(&mut self, cmd: DepId, source: &KeyRef, callback: Callback) {
        let Some(name) = source.key.first().map(str::to_string) else {
            return;
        };
        let Some(binding) = self.variable(source.dep, &name).cloned() else {
            trace!(variable = %name, "variable resolved without a binding");
            return;
        };
        let root = KeyRef::new(cmd, KeyPath::root());
        let edge = {
            let Some(DepKind::Command(state)) = self.get_mut(cmd).map(Dependency::kind_mut) else {
                return;
            };
            match callback {
                Callback::BindTarget => {
                    let target = KeyRef::new(binding.dep, binding.key.join(&state.target_suffix));
                    state.target = Some(target.clone());
                    Some((target, root))
                }
                Callback::BindBlock(i) => match state.blocks.get_mut(i) {
                    Some(BoundBlock::Ref {
                        sources, suffix, ..
                    }) => {
                        let key = KeyRef::new(binding.dep, binding.key.join(suffix));
                        if !sources.contains(&key) {
                            sources.push(key.clone());
                        }
                        Some((root, key))
                    }
                    _ => None,
                },
            }
        };
        if let Some((waiter, source)) = edge {
            self.wait_inner(&waiter, &source, None);
        }
    }
}
