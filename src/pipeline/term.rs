//! Pipeline Term - Core computational expression system
//!
//! Terms represent computational nodes in the pipeline dependency graph.
//! A term is immutable and reference-counted; since a term can only be built
//! from terms that already exist, every graph of terms is acyclic by
//! construction. Two structurally identical terms share one [`TermId`] and
//! are evaluated once.

use crate::types::{Cell, ColumnId};
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Structural identifier for a term in the computational graph
pub type TermId = u64;

/// Data types that can be computed by terms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    /// Numeric values (factors)
    Float64,
    /// Boolean values (filters)
    Bool,
    /// Integer category labels (classifiers)
    Category,
}

impl DType {
    /// Whether this dtype supports arithmetic and ordering
    pub fn is_numeric(&self) -> bool {
        matches!(self, DType::Float64)
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DType::Float64 => write!(f, "float64"),
            DType::Bool => write!(f, "bool"),
            DType::Category => write!(f, "category"),
        }
    }
}

/// Trailing-window numeric aggregations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WindowedFactor {
    SimpleMovingAverage,
    /// Exponentially weighted mean with `span = window_length`
    ExponentialWeightedMovingAverage,
    /// Percent change from the first to the last value of the window
    Returns,
    /// Sample standard deviation
    StdDev,
}

impl WindowedFactor {
    /// Smallest window this aggregation is defined for
    pub fn min_window(&self) -> usize {
        match self {
            WindowedFactor::SimpleMovingAverage
            | WindowedFactor::ExponentialWeightedMovingAverage => 1,
            WindowedFactor::Returns | WindowedFactor::StdDev => 2,
        }
    }
}

/// Elementwise arithmetic between two factors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArithOp {
    Add,
    Subtract,
    Multiply,
    Divide,
}

impl ArithOp {
    fn symbol(&self) -> &'static str {
        match self {
            ArithOp::Add => "+",
            ArithOp::Subtract => "-",
            ArithOp::Multiply => "*",
            ArithOp::Divide => "/",
        }
    }
}

/// Comparison producing a filter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CmpOp {
    Greater,
    GreaterEqual,
    Less,
    LessEqual,
    Equal,
}

impl CmpOp {
    fn symbol(&self) -> &'static str {
        match self {
            CmpOp::Greater => ">",
            CmpOp::GreaterEqual => ">=",
            CmpOp::Less => "<",
            CmpOp::LessEqual => "<=",
            CmpOp::Equal => "==",
        }
    }
}

/// Boolean composition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogicOp {
    And,
    Or,
    Not,
}

/// Operations whose value for one asset depends on the whole cross-section
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CrossOp {
    /// Ascending rank, ties averaged, starting at 1
    Rank,
    ZScore,
    Demean,
    Top(usize),
    Bottom(usize),
    /// Inclusive percentile bounds in `[0, 100]`
    PercentileBetween { lo: f64, hi: f64 },
    Quantiles(usize),
}

impl CrossOp {
    pub fn result_dtype(&self) -> DType {
        match self {
            CrossOp::Rank | CrossOp::ZScore | CrossOp::Demean => DType::Float64,
            CrossOp::Top(_) | CrossOp::Bottom(_) | CrossOp::PercentileBetween { .. } => DType::Bool,
            CrossOp::Quantiles(_) => DType::Category,
        }
    }
}

/// User-supplied per-asset computation
///
/// `compute` receives, for one asset, one window per input (oldest first,
/// `window_length` cells each) and returns that asset's output cell.
pub trait CustomTerm: Send + Sync {
    /// Name used for identity and debugging; equal names mean equal terms
    fn name(&self) -> &str;

    /// Output type
    fn dtype(&self) -> DType;

    /// Declared type of each input, in order
    fn input_dtypes(&self) -> Vec<DType>;

    fn window_length(&self) -> usize {
        1
    }

    fn compute(&self, windows: &[&[Cell]]) -> Cell;
}

/// Shared handle to a [`CustomTerm`]
#[derive(Clone)]
pub struct CustomHandle(pub Arc<dyn CustomTerm>);

impl fmt::Debug for CustomHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "CustomTerm({})", self.0.name())
    }
}

/// How the evaluator produces a term's cross-section
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Evaluation {
    /// Pulled from the data source or a constant
    Leaf,
    /// Each asset depends only on its own input windows
    PerAsset,
    /// Each asset depends on the whole cross-section of the input
    CrossSectional,
}

/// Expected type of one input slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputType {
    Exact(DType),
    Any,
}

/// The computation a term performs
#[derive(Debug, Clone)]
pub enum TermKind {
    /// Raw dataset column value at the evaluation date
    Column { id: ColumnId, dtype: DType },
    /// Same numeric value for every asset
    Constant(f64),
    Windowed(WindowedFactor),
    Arithmetic(ArithOp),
    Compare(CmpOp),
    Logical(LogicOp),
    /// `isnull` when `negate` is false, `notnull` otherwise
    NullCheck { negate: bool },
    CrossSectional(CrossOp),
    /// Classifier label equality
    LabelEq(i64),
    Custom(CustomHandle),
}

impl TermKind {
    pub fn output_dtype(&self) -> DType {
        match self {
            TermKind::Column { dtype, .. } => *dtype,
            TermKind::Constant(_) | TermKind::Windowed(_) | TermKind::Arithmetic(_) => {
                DType::Float64
            }
            TermKind::Compare(_)
            | TermKind::Logical(_)
            | TermKind::NullCheck { .. }
            | TermKind::LabelEq(_) => DType::Bool,
            TermKind::CrossSectional(op) => op.result_dtype(),
            TermKind::Custom(custom) => custom.0.dtype(),
        }
    }

    /// Expected input types, one per input slot
    pub fn input_types(&self) -> Vec<InputType> {
        use InputType::Exact;
        match self {
            TermKind::Column { .. } | TermKind::Constant(_) => Vec::new(),
            TermKind::Windowed(_) => vec![Exact(DType::Float64)],
            TermKind::Arithmetic(_) | TermKind::Compare(_) => {
                vec![Exact(DType::Float64), Exact(DType::Float64)]
            }
            TermKind::Logical(LogicOp::Not) => vec![Exact(DType::Bool)],
            TermKind::Logical(_) => vec![Exact(DType::Bool), Exact(DType::Bool)],
            TermKind::NullCheck { .. } => vec![InputType::Any],
            TermKind::CrossSectional(_) => vec![Exact(DType::Float64)],
            TermKind::LabelEq(_) => vec![Exact(DType::Category)],
            TermKind::Custom(custom) => custom.0.input_dtypes().into_iter().map(Exact).collect(),
        }
    }

    pub fn evaluation(&self) -> Evaluation {
        match self {
            TermKind::Column { .. } | TermKind::Constant(_) => Evaluation::Leaf,
            TermKind::CrossSectional(_) => Evaluation::CrossSectional,
            _ => Evaluation::PerAsset,
        }
    }

    /// Smallest window length this kind accepts
    pub fn min_window(&self) -> usize {
        match self {
            TermKind::Windowed(op) => op.min_window(),
            _ => 1,
        }
    }

    /// Parameter checks beyond typing and windows
    pub fn validate(&self) -> std::result::Result<(), String> {
        match self {
            TermKind::CrossSectional(CrossOp::Top(0)) | TermKind::CrossSectional(CrossOp::Bottom(0)) => {
                Err("n must be at least 1".to_string())
            }
            TermKind::CrossSectional(CrossOp::Quantiles(bins)) if *bins < 2 => {
                Err("bins must be at least 2".to_string())
            }
            TermKind::CrossSectional(CrossOp::PercentileBetween { lo, hi }) => {
                if !(0.0..=100.0).contains(lo) || !(0.0..=100.0).contains(hi) || lo > hi {
                    Err(format!("invalid percentile bounds [{}, {}]", lo, hi))
                } else {
                    Ok(())
                }
            }
            TermKind::Constant(v) if !v.is_finite() => Err("constant must be finite".to_string()),
            _ => Ok(()),
        }
    }

    fn signature(&self) -> String {
        match self {
            TermKind::Column { id, dtype } => format!("column:{}:{}", id, dtype),
            TermKind::Constant(v) => format!("constant:{}", v.to_bits()),
            TermKind::Custom(custom) => format!("custom:{}", custom.0.name()),
            other => format!("{:?}", other),
        }
    }
}

#[derive(Debug)]
struct TermNode {
    id: TermId,
    name: String,
    kind: TermKind,
    dtype: DType,
    inputs: Vec<Term>,
    window_length: usize,
    mask: Option<Term>,
}

/// A node of the pipeline expression graph
///
/// Factors, filters and classifiers are all terms; they differ only in
/// [`DType`]. Wiring errors (say, a factor used as a screen) are reported when
/// the graph is built.
#[derive(Clone)]
pub struct Term(Arc<TermNode>);

impl Term {
    /// Build a term from its parts
    pub fn new(kind: TermKind, inputs: Vec<Term>, window_length: usize, mask: Option<Term>) -> Self {
        let mut hasher = DefaultHasher::new();
        kind.signature().hash(&mut hasher);
        window_length.hash(&mut hasher);
        for input in &inputs {
            input.id().hash(&mut hasher);
        }
        mask.as_ref().map(Term::id).hash(&mut hasher);

        let name = describe(&kind, &inputs, window_length, mask.as_ref());
        let dtype = kind.output_dtype();

        Term(Arc::new(TermNode {
            id: hasher.finish(),
            name,
            kind,
            dtype,
            inputs,
            window_length,
            mask,
        }))
    }

    /// Leaf term reading a dataset column
    pub fn column(id: impl Into<ColumnId>, dtype: DType) -> Self {
        Self::new(TermKind::Column { id: id.into(), dtype }, Vec::new(), 1, None)
    }

    /// Numeric constant broadcast to every asset
    pub fn constant(value: f64) -> Self {
        Self::new(TermKind::Constant(value), Vec::new(), 1, None)
    }

    /// User-defined per-asset term
    pub fn custom(custom: Arc<dyn CustomTerm>, inputs: Vec<Term>) -> Self {
        let window_length = custom.window_length();
        Self::new(TermKind::Custom(CustomHandle(custom)), inputs, window_length, None)
    }

    /// The latest value of a term; columns are already window-1 terms
    pub fn latest(&self) -> Term {
        self.clone()
    }

    /// Same computation restricted to assets where `mask` is true
    pub fn with_mask(&self, mask: &Term) -> Term {
        Term::new(
            self.0.kind.clone(),
            self.0.inputs.clone(),
            self.0.window_length,
            Some(mask.clone()),
        )
    }

    pub fn id(&self) -> TermId {
        self.0.id
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn kind(&self) -> &TermKind {
        &self.0.kind
    }

    pub fn dtype(&self) -> DType {
        self.0.dtype
    }

    pub fn inputs(&self) -> &[Term] {
        &self.0.inputs
    }

    pub fn window_length(&self) -> usize {
        self.0.window_length
    }

    pub fn mask(&self) -> Option<&Term> {
        self.0.mask.as_ref()
    }

    /// Inputs followed by the mask, if any
    pub fn dependencies(&self) -> Vec<Term> {
        let mut deps = self.0.inputs.clone();
        if let Some(mask) = &self.0.mask {
            deps.push(mask.clone());
        }
        deps
    }

    pub fn is_factor(&self) -> bool {
        self.dtype() == DType::Float64
    }

    pub fn is_filter(&self) -> bool {
        self.dtype() == DType::Bool
    }

    pub fn is_classifier(&self) -> bool {
        self.dtype() == DType::Category
    }
}

impl fmt::Debug for Term {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Term({} [{}], id={:x})", self.name(), self.dtype(), self.id())
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl PartialEq for Term {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for Term {}

impl Hash for Term {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id().hash(state);
    }
}

impl From<f64> for Term {
    fn from(value: f64) -> Self {
        Term::constant(value)
    }
}

impl From<&Term> for Term {
    fn from(term: &Term) -> Self {
        term.clone()
    }
}

fn describe(kind: &TermKind, inputs: &[Term], window_length: usize, mask: Option<&Term>) -> String {
    let arg = |i: usize| inputs.get(i).map(Term::name).unwrap_or("?");
    let base = match kind {
        TermKind::Column { id, .. } => id.clone(),
        TermKind::Constant(v) => format!("{}", v),
        TermKind::Windowed(op) => format!("{:?}({}, window_length={})", op, arg(0), window_length),
        TermKind::Arithmetic(op) => format!("({} {} {})", arg(0), op.symbol(), arg(1)),
        TermKind::Compare(op) => format!("({} {} {})", arg(0), op.symbol(), arg(1)),
        TermKind::Logical(LogicOp::And) => format!("({} & {})", arg(0), arg(1)),
        TermKind::Logical(LogicOp::Or) => format!("({} | {})", arg(0), arg(1)),
        TermKind::Logical(LogicOp::Not) => format!("~{}", arg(0)),
        TermKind::NullCheck { negate: false } => format!("{}.isnull()", arg(0)),
        TermKind::NullCheck { negate: true } => format!("{}.notnull()", arg(0)),
        TermKind::CrossSectional(op) => match op {
            CrossOp::Rank => format!("{}.rank()", arg(0)),
            CrossOp::ZScore => format!("{}.zscore()", arg(0)),
            CrossOp::Demean => format!("{}.demean()", arg(0)),
            CrossOp::Top(n) => format!("{}.top({})", arg(0), n),
            CrossOp::Bottom(n) => format!("{}.bottom({})", arg(0), n),
            CrossOp::PercentileBetween { lo, hi } => {
                format!("{}.percentile_between({}, {})", arg(0), lo, hi)
            }
            CrossOp::Quantiles(bins) => format!("{}.quantiles({})", arg(0), bins),
        },
        TermKind::LabelEq(label) => format!("{}.eq({})", arg(0), label),
        TermKind::Custom(custom) => {
            let args: Vec<&str> = inputs.iter().map(Term::name).collect();
            format!("{}({})", custom.0.name(), args.join(", "))
        }
    };

    match mask {
        Some(mask) => format!("{}[mask={}]", base, mask.name()),
        None => base,
    }
}
