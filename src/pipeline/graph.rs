//! Pipeline Graph - Computational dependency graph
//!
//! Collects the distinct terms reachable from a pipeline's outputs and screen,
//! validates their wiring and computes the execution order.

use crate::error::{PipelineError, Result};
use crate::pipeline::engine::Pipeline;
use crate::pipeline::term::{DType, InputType, Term, TermId, TermKind};
use hashbrown::{HashMap, HashSet};
use std::collections::VecDeque;

/// Validated, topologically sorted term graph
#[derive(Debug, Clone)]
pub struct TermGraph {
    /// All terms in the graph
    terms: HashMap<TermId, Term>,
    /// Dependencies: term_id -> [dependency_ids], deduplicated
    dependencies: HashMap<TermId, Vec<TermId>>,
    /// Reverse dependencies: term_id -> [dependent_ids]
    dependents: HashMap<TermId, Vec<TermId>>,
    /// Terms in the order they were first reached
    discovery: Vec<TermId>,
    /// Execution order (dependencies first)
    execution_order: Vec<TermId>,
    /// Longest path from a leaf
    depths: HashMap<TermId, usize>,
}

impl TermGraph {
    /// Build the graph for a pipeline's output columns and screen
    pub fn build(pipeline: &Pipeline) -> Result<Self> {
        if let Some(screen) = pipeline.screen() {
            if screen.dtype() != DType::Bool {
                return Err(PipelineError::TypeMismatch {
                    term: format!("screen {}", screen.name()),
                    expected: DType::Bool.to_string(),
                    found: screen.dtype().to_string(),
                });
            }
        }

        let roots = pipeline
            .columns()
            .iter()
            .map(|(_, term)| term)
            .chain(pipeline.screen());
        Self::from_roots(roots)
    }

    /// Build the graph reachable from `roots`
    pub fn from_roots<'a>(roots: impl IntoIterator<Item = &'a Term>) -> Result<Self> {
        let mut graph = Self {
            terms: HashMap::new(),
            dependencies: HashMap::new(),
            dependents: HashMap::new(),
            discovery: Vec::new(),
            execution_order: Vec::new(),
            depths: HashMap::new(),
        };

        let mut visiting = HashSet::new();
        for root in roots {
            graph.visit(root, &mut visiting)?;
        }

        graph.topological_sort()?;
        graph.compute_depths();

        log::debug!(
            "Built term graph with {} terms, max depth {}",
            graph.len(),
            graph.max_depth()
        );
        Ok(graph)
    }

    fn visit(&mut self, term: &Term, visiting: &mut HashSet<TermId>) -> Result<()> {
        let term_id = term.id();
        if self.terms.contains_key(&term_id) {
            return Ok(());
        }
        if !visiting.insert(term_id) {
            return Err(PipelineError::CyclicGraph {
                term: term.name().to_string(),
            });
        }

        check_term(term)?;

        let mut deps = Vec::new();
        for dep in term.dependencies() {
            self.visit(&dep, visiting)?;
            if !deps.contains(&dep.id()) {
                deps.push(dep.id());
            }
        }

        visiting.remove(&term_id);
        self.add_node(term.clone(), deps);
        Ok(())
    }

    fn add_node(&mut self, term: Term, deps: Vec<TermId>) {
        let term_id = term.id();
        for dep_id in &deps {
            self.dependents
                .entry(*dep_id)
                .or_insert_with(Vec::new)
                .push(term_id);
        }
        self.dependencies.insert(term_id, deps);
        self.terms.insert(term_id, term);
        self.discovery.push(term_id);
    }

    /// Kahn's algorithm; fails if any term is left unresolved
    fn topological_sort(&mut self) -> Result<()> {
        let mut in_degree: HashMap<TermId, usize> = self
            .discovery
            .iter()
            .map(|id| (*id, self.dependencies.get(id).map_or(0, Vec::len)))
            .collect();

        let mut queue: VecDeque<TermId> = self
            .discovery
            .iter()
            .copied()
            .filter(|id| in_degree[id] == 0)
            .collect();
        let mut order = Vec::with_capacity(self.discovery.len());

        while let Some(term_id) = queue.pop_front() {
            order.push(term_id);

            if let Some(dependents) = self.dependents.get(&term_id) {
                for dependent in dependents {
                    if let Some(degree) = in_degree.get_mut(dependent) {
                        *degree -= 1;
                        if *degree == 0 {
                            queue.push_back(*dependent);
                        }
                    }
                }
            }
        }

        if order.len() != self.discovery.len() {
            let stuck = self
                .discovery
                .iter()
                .find(|id| !order.contains(id))
                .and_then(|id| self.terms.get(id))
                .map(|t| t.name().to_string())
                .unwrap_or_default();
            return Err(PipelineError::CyclicGraph { term: stuck });
        }

        self.execution_order = order;
        Ok(())
    }

    fn compute_depths(&mut self) {
        let mut depths: HashMap<TermId, usize> = HashMap::new();
        for term_id in &self.execution_order {
            let depth = self.dependencies[term_id]
                .iter()
                .map(|dep| depths[dep] + 1)
                .max()
                .unwrap_or(0);
            depths.insert(*term_id, depth);
        }
        self.depths = depths;
    }

    /// Get a term by ID
    pub fn get_term(&self, id: TermId) -> Option<&Term> {
        self.terms.get(&id)
    }

    /// Get dependencies of a term
    pub fn dependencies_of(&self, id: TermId) -> &[TermId] {
        self.dependencies.get(&id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Get dependents (consumers) of a term
    pub fn dependents_of(&self, id: TermId) -> &[TermId] {
        self.dependents.get(&id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Execution order, dependencies first
    pub fn execution_order(&self) -> &[TermId] {
        &self.execution_order
    }

    /// Execution order as terms
    pub fn ordered_terms(&self) -> impl Iterator<Item = &Term> {
        self.execution_order.iter().map(|id| &self.terms[id])
    }

    pub fn depth(&self, id: TermId) -> usize {
        self.depths.get(&id).copied().unwrap_or(0)
    }

    pub fn max_depth(&self) -> usize {
        self.depths.values().copied().max().unwrap_or(0)
    }

    /// Terms grouped by depth; a level only depends on earlier levels
    pub fn levels(&self) -> Vec<Vec<TermId>> {
        let mut levels = vec![Vec::new(); self.max_depth() + 1];
        for term_id in &self.execution_order {
            levels[self.depth(*term_id)].push(*term_id);
        }
        if self.is_empty() {
            levels.clear();
        }
        levels
    }

    /// Get the maximum window length required
    pub fn max_window_length(&self) -> usize {
        self.terms
            .values()
            .map(|t| t.window_length())
            .max()
            .unwrap_or(1)
    }

    /// Terms with no dependencies (data columns and constants)
    pub fn root_terms(&self) -> Vec<TermId> {
        self.execution_order
            .iter()
            .filter(|id| self.dependencies_of(**id).is_empty())
            .copied()
            .collect()
    }

    /// Number of terms in the graph
    pub fn len(&self) -> usize {
        self.terms.len()
    }

    /// Check if graph is empty
    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }
}

/// Type, window and parameter checks for a single term
fn check_term(term: &Term) -> Result<()> {
    let kind = term.kind();

    let min_window = kind.min_window();
    if term.window_length() < min_window {
        return Err(PipelineError::InvalidWindowLength {
            term: term.name().to_string(),
            window_length: term.window_length(),
            minimum: min_window,
        });
    }
    if !matches!(kind, TermKind::Windowed(_) | TermKind::Custom(_)) && term.window_length() != 1 {
        return Err(PipelineError::InvalidTerm {
            term: term.name().to_string(),
            reason: "only windowed and custom terms accept window_length > 1".to_string(),
        });
    }

    kind.validate().map_err(|reason| PipelineError::InvalidTerm {
        term: term.name().to_string(),
        reason,
    })?;

    let expected = kind.input_types();
    if expected.len() != term.inputs().len() {
        return Err(PipelineError::TypeMismatch {
            term: term.name().to_string(),
            expected: format!("{} input(s)", expected.len()),
            found: format!("{} input(s)", term.inputs().len()),
        });
    }

    for (slot, input) in expected.iter().zip(term.inputs()) {
        if let InputType::Exact(dtype) = slot {
            if input.dtype() != *dtype {
                return Err(PipelineError::TypeMismatch {
                    term: term.name().to_string(),
                    expected: dtype.to_string(),
                    found: format!("{} ({})", input.dtype(), input.name()),
                });
            }
        }
    }

    if let Some(mask) = term.mask() {
        if mask.dtype() != DType::Bool {
            return Err(PipelineError::TypeMismatch {
                term: format!("mask of {}", term.name()),
                expected: DType::Bool.to_string(),
                found: mask.dtype().to_string(),
            });
        }
    }

    Ok(())
}
