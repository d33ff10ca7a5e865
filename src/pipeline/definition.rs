//! TOML pipeline definitions
//!
//! A definition names terms in `[[terms]]` tables, lists the output
//! `columns` and optionally a `screen`. Inputs refer to other named terms or
//! directly to catalog columns.
//!
//! ```toml
//! columns = ["sentiment", "close"]
//! screen = "liquid"
//!
//! [[terms]]
//! name = "close"
//! op = "column"
//! column = "USEquityPricing.close"
//!
//! [[terms]]
//! name = "sentiment"
//! op = "sma"
//! inputs = ["stocktwits.bull_minus_bear"]
//! window_length = 2
//!
//! [[terms]]
//! name = "liquid"
//! op = "gt"
//! inputs = ["close"]
//! value = 10.0
//! ```

use crate::error::{PipelineError, Result};
use crate::pipeline::catalog::Catalog;
use crate::pipeline::engine::{EngineConfig, EngineOverrides, Pipeline};
use crate::pipeline::factors::{
    ExponentialWeightedMovingAverage, Returns, SimpleMovingAverage, StdDev,
};
use crate::pipeline::term::Term;
use hashbrown::{HashMap, HashSet};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// One named term
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TermSpec {
    pub name: String,
    pub op: String,
    /// Catalog column, for `op = "column"`
    pub column: Option<String>,
    pub inputs: Vec<String>,
    pub window_length: Option<usize>,
    /// Constant right-hand operand for arithmetic and comparisons
    pub value: Option<f64>,
    pub n: Option<usize>,
    pub lo: Option<f64>,
    pub hi: Option<f64>,
    pub bins: Option<usize>,
    pub label: Option<i64>,
    /// Name of a filter restricting where the term is computed
    pub mask: Option<String>,
}

/// A complete pipeline definition document
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineDefinition {
    /// Output columns in order; every defined term when empty
    pub columns: Vec<String>,
    pub screen: Option<String>,
    pub terms: Vec<TermSpec>,
    /// Engine settings carried with the definition
    pub engine: Option<EngineOverrides>,
}

impl PipelineDefinition {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// `base` with this definition's `[engine]` settings layered on top
    pub fn engine_config(&self, base: &EngineConfig) -> Result<EngineConfig> {
        let config = match &self.engine {
            Some(engine) => engine.apply(base),
            None => base.clone(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Resolve every name and build the pipeline
    pub fn compile(&self, catalog: &Catalog) -> Result<Pipeline> {
        let mut specs: HashMap<&str, &TermSpec> = HashMap::new();
        for spec in &self.terms {
            if spec.name.is_empty() {
                return Err(PipelineError::Definition("term without a name".to_string()));
            }
            if specs.insert(spec.name.as_str(), spec).is_some() {
                return Err(PipelineError::Definition(format!(
                    "term '{}' is defined more than once",
                    spec.name
                )));
            }
        }

        let mut compiler = Compiler {
            catalog,
            specs,
            resolved: HashMap::new(),
            visiting: HashSet::new(),
        };

        let names: Vec<&str> = if self.columns.is_empty() {
            self.terms.iter().map(|t| t.name.as_str()).collect()
        } else {
            self.columns.iter().map(String::as_str).collect()
        };
        if names.is_empty() {
            return Err(PipelineError::Definition("no output columns".to_string()));
        }

        let mut builder = Pipeline::builder();
        for name in names {
            builder = builder.add(name, compiler.resolve(name)?);
        }
        if let Some(screen) = &self.screen {
            builder = builder.screen(compiler.resolve(screen)?);
        }
        builder.build()
    }
}

struct Compiler<'a> {
    catalog: &'a Catalog,
    specs: HashMap<&'a str, &'a TermSpec>,
    resolved: HashMap<String, Term>,
    visiting: HashSet<String>,
}

impl<'a> Compiler<'a> {
    fn resolve(&mut self, name: &str) -> Result<Term> {
        if let Some(term) = self.resolved.get(name) {
            return Ok(term.clone());
        }

        let Some(spec) = self.specs.get(name).copied() else {
            return self.catalog.column(name).map_err(|_| PipelineError::UnknownTerm(name.to_string()));
        };

        if !self.visiting.insert(name.to_string()) {
            return Err(PipelineError::CyclicGraph {
                term: name.to_string(),
            });
        }
        let term = self.build(spec)?;
        self.visiting.remove(name);

        self.resolved.insert(name.to_string(), term.clone());
        Ok(term)
    }

    fn build(&mut self, spec: &TermSpec) -> Result<Term> {
        let inputs = spec
            .inputs
            .iter()
            .map(|input| self.resolve(input))
            .collect::<Result<Vec<Term>>>()?;

        let term = match spec.op.as_str() {
            "column" => {
                let column = spec.column.as_deref().unwrap_or(&spec.name);
                self.catalog.column(column)?
            }
            "constant" => Term::constant(require(spec, "value", spec.value)?),
            "latest" => unary(spec, &inputs)?.latest(),
            "sma" => SimpleMovingAverage::new(unary(spec, &inputs)?, window(spec)?),
            "ewma" => ExponentialWeightedMovingAverage::from_span(unary(spec, &inputs)?, window(spec)?),
            "returns" => Returns::new(unary(spec, &inputs)?, window(spec)?),
            "stddev" => StdDev::new(unary(spec, &inputs)?, window(spec)?),
            "add" => {
                let (l, r) = operands(spec, &inputs)?;
                l + r
            }
            "sub" => {
                let (l, r) = operands(spec, &inputs)?;
                l - r
            }
            "mul" => {
                let (l, r) = operands(spec, &inputs)?;
                l * r
            }
            "div" => {
                let (l, r) = operands(spec, &inputs)?;
                l / r
            }
            "gt" => operands(spec, &inputs).map(|(l, r)| l.gt(r))?,
            "ge" => operands(spec, &inputs).map(|(l, r)| l.ge(r))?,
            "lt" => operands(spec, &inputs).map(|(l, r)| l.lt(r))?,
            "le" => operands(spec, &inputs).map(|(l, r)| l.le(r))?,
            "eq" => operands(spec, &inputs).map(|(l, r)| l.equals(r))?,
            "and" | "or" => {
                let (l, r) = binary(spec, &inputs)?;
                if spec.op == "and" {
                    l.and(r)
                } else {
                    l.or(r)
                }
            }
            "not" => unary(spec, &inputs)?.invert(),
            "isnull" => unary(spec, &inputs)?.isnull(),
            "notnull" => unary(spec, &inputs)?.notnull(),
            "rank" => unary(spec, &inputs)?.rank(),
            "zscore" => unary(spec, &inputs)?.zscore(),
            "demean" => unary(spec, &inputs)?.demean(),
            "top" => unary(spec, &inputs)?.top(require(spec, "n", spec.n)?),
            "bottom" => unary(spec, &inputs)?.bottom(require(spec, "n", spec.n)?),
            "percentile_between" => unary(spec, &inputs)?
                .percentile_between(require(spec, "lo", spec.lo)?, require(spec, "hi", spec.hi)?),
            "quantiles" => unary(spec, &inputs)?.quantiles(require(spec, "bins", spec.bins)?),
            "label_eq" => unary(spec, &inputs)?.eq_label(require(spec, "label", spec.label)?),
            other => {
                return Err(PipelineError::Definition(format!(
                    "term '{}' has unknown op '{}'",
                    spec.name, other
                )))
            }
        };

        match &spec.mask {
            Some(mask) => {
                let mask = self.resolve(mask)?;
                Ok(term.with_mask(&mask))
            }
            None => Ok(term),
        }
    }
}

fn require<T>(spec: &TermSpec, field: &str, value: Option<T>) -> Result<T> {
    value.ok_or_else(|| {
        PipelineError::Definition(format!(
            "term '{}' ({}) requires '{}'",
            spec.name, spec.op, field
        ))
    })
}

fn window(spec: &TermSpec) -> Result<usize> {
    require(spec, "window_length", spec.window_length)
}

fn arity_error(spec: &TermSpec, expected: &str, found: usize) -> PipelineError {
    PipelineError::Definition(format!(
        "term '{}' ({}) takes {}, got {} input(s)",
        spec.name, spec.op, expected, found
    ))
}

fn unary<'t>(spec: &TermSpec, inputs: &'t [Term]) -> Result<&'t Term> {
    match inputs {
        [input] => Ok(input),
        _ => Err(arity_error(spec, "one input", inputs.len())),
    }
}

fn binary<'t>(spec: &TermSpec, inputs: &'t [Term]) -> Result<(&'t Term, &'t Term)> {
    match inputs {
        [left, right] => Ok((left, right)),
        _ => Err(arity_error(spec, "two inputs", inputs.len())),
    }
}

/// Two inputs, or one input and a constant `value`
fn operands(spec: &TermSpec, inputs: &[Term]) -> Result<(Term, Term)> {
    match (inputs, spec.value) {
        ([left, right], None) => Ok((left.clone(), right.clone())),
        ([left], Some(value)) => Ok((left.clone(), Term::constant(value))),
        _ => Err(arity_error(spec, "two inputs or one input and a value", inputs.len())),
    }
}
