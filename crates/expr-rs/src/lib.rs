//! # NetSpec Expr
//!
//! Formula compiler for declarative network specifications.
//!
//! Connection and stimulus declarations carry small arithmetic formulas such
//! as `0.4*exp(-dist_3D/probLengthConst)` or `max(1, normal(5,2))`. They are
//! evaluated once per candidate cell pair, so they are parsed a single time
//! into a flat [`ExprArena`] and evaluated from there.
//!
//! ## Pipeline
//!
//! 1. **Parse**: pest grammar + Pratt parser into a transient syntax tree
//! 2. **Lower**: identifiers resolved to [`Slot`]s through a [`SymbolTable`],
//!    functions checked for arity, pure constant subtrees folded
//! 3. **Evaluate**: variables read from a [`Scope`], random draws taken from
//!    a caller-supplied generator in left-to-right order
//!
//! Malformed formulas and unknown names are compile-time errors; division by
//! zero and non-finite results are evaluation errors. Neither is ever
//! coerced to a default value.

use pest::iterators::Pairs;
use pest::pratt_parser::{Assoc, Op, PrattParser};
use pest::Parser;
use pest_derive::Parser;
use rand::Rng;
use rand_distr::{Distribution, Exp, LogNormal, Normal};
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExprError {
    #[error("syntax error: {message}")]
    Syntax { expr: String, message: String },
    #[error("unknown identifier '{name}'")]
    UnknownIdentifier { expr: String, name: String },
    #[error("unknown function '{name}'")]
    UnknownFunction { expr: String, name: String },
    #[error("function '{name}' expects {expected} argument(s), got {got}")]
    Arity {
        expr: String,
        name: String,
        expected: String,
        got: usize,
    },
    #[error("division by zero")]
    DivisionByZero { expr: String },
    #[error("non-finite result")]
    NonFinite { expr: String },
    #[error("invalid distribution parameters: {message}")]
    Distribution { expr: String, message: String },
}

impl ExprError {
    /// The formula text that failed
    pub fn expr(&self) -> &str {
        match self {
            ExprError::Syntax { expr, .. }
            | ExprError::UnknownIdentifier { expr, .. }
            | ExprError::UnknownFunction { expr, .. }
            | ExprError::Arity { expr, .. }
            | ExprError::DivisionByZero { expr }
            | ExprError::NonFinite { expr }
            | ExprError::Distribution { expr, .. } => expr,
        }
    }
}

pub type Result<T> = std::result::Result<T, ExprError>;

// =============================================================================
// FORMULA GRAMMAR
// =============================================================================

#[derive(Parser)]
#[grammar_inline = r#"
WHITESPACE = _{ " " | "\t" | "\r" | "\n" }

number = @{
    (ASCII_DIGIT+ ~ ("." ~ ASCII_DIGIT*)? | "." ~ ASCII_DIGIT+)
    ~ (^"e" ~ ("+" | "-")? ~ ASCII_DIGIT+)?
}
ident = @{ (ASCII_ALPHA | "_") ~ (ASCII_ALPHANUMERIC | "_")* }

// Operators
add = { "+" }
sub = { "-" }
pow = { "**" | "^" }
mul = { "*" }
div = { "/" }
neg = { "-" }

infix = _{ add | sub | pow | mul | div }
call = { ident ~ "(" ~ (expr ~ ("," ~ expr)*)? ~ ")" }
primary = _{ number | call | ident | "(" ~ expr ~ ")" }
expr = { neg* ~ primary ~ (infix ~ neg* ~ primary)* }

formula = _{ SOI ~ expr ~ EOI }
"#]
struct FormulaParser;

fn pratt() -> &'static PrattParser<Rule> {
    static PRATT: OnceLock<PrattParser<Rule>> = OnceLock::new();
    PRATT.get_or_init(|| {
        PrattParser::new()
            .op(Op::infix(Rule::add, Assoc::Left) | Op::infix(Rule::sub, Assoc::Left))
            .op(Op::infix(Rule::mul, Assoc::Left) | Op::infix(Rule::div, Assoc::Left))
            .op(Op::prefix(Rule::neg))
            .op(Op::infix(Rule::pow, Assoc::Right))
    })
}

/// Transient syntax tree, lowered into the arena right after parsing
#[derive(Debug, Clone, PartialEq)]
enum Ast {
    Number(f64),
    Ident(String),
    Neg(Box<Ast>),
    Binary(BinaryOp, Box<Ast>, Box<Ast>),
    Call(String, Vec<Ast>),
}

fn parse(source: &str) -> Result<Ast> {
    let syntax = |message: String| ExprError::Syntax {
        expr: source.to_string(),
        message,
    };

    let mut pairs = FormulaParser::parse(Rule::formula, source).map_err(|e| {
        let column = match e.line_col {
            pest::error::LineColLocation::Pos((_, col)) => col,
            pest::error::LineColLocation::Span((_, col), _) => col,
        };
        syntax(format!("{} at column {}", e.variant.message(), column))
    })?;

    let expr = pairs
        .next()
        .ok_or_else(|| syntax("empty formula".into()))?;
    parse_expr(expr.into_inner(), pratt()).map_err(syntax)
}

fn parse_expr(pairs: Pairs<'_, Rule>, pratt: &PrattParser<Rule>) -> std::result::Result<Ast, String> {
    pratt
        .map_primary(|primary| -> std::result::Result<Ast, String> {
            match primary.as_rule() {
                Rule::number => primary
                    .as_str()
                    .parse::<f64>()
                    .map(Ast::Number)
                    .map_err(|e| format!("invalid number '{}': {}", primary.as_str(), e)),
                Rule::ident => Ok(Ast::Ident(primary.as_str().to_string())),
                Rule::expr => parse_expr(primary.into_inner(), pratt),
                Rule::call => {
                    let mut inner = primary.into_inner();
                    let name = inner
                        .next()
                        .map(|p| p.as_str().to_string())
                        .ok_or_else(|| "call without a name".to_string())?;
                    let args = inner
                        .map(|arg| parse_expr(arg.into_inner(), pratt))
                        .collect::<std::result::Result<Vec<_>, _>>()?;
                    Ok(Ast::Call(name, args))
                }
                rule => Err(format!("unexpected {:?}", rule)),
            }
        })
        .map_prefix(|op, rhs| -> std::result::Result<Ast, String> {
            match op.as_rule() {
                Rule::neg => Ok(Ast::Neg(Box::new(rhs?))),
                rule => Err(format!("unexpected prefix {:?}", rule)),
            }
        })
        .map_infix(|lhs, op, rhs| -> std::result::Result<Ast, String> {
            let op = match op.as_rule() {
                Rule::add => BinaryOp::Add,
                Rule::sub => BinaryOp::Sub,
                Rule::mul => BinaryOp::Mul,
                Rule::div => BinaryOp::Div,
                Rule::pow => BinaryOp::Pow,
                rule => return Err(format!("unexpected operator {:?}", rule)),
            };
            Ok(Ast::Binary(op, Box::new(lhs?), Box::new(rhs?)))
        })
        .parse(pairs)
}

// =============================================================================
// OPERATORS AND FUNCTIONS
// =============================================================================

/// Failure inside evaluation, turned into an [`ExprError`] once the formula
/// text is at hand
#[derive(Debug, Clone, PartialEq)]
enum Fault {
    DivisionByZero,
    Distribution(String),
}

impl Fault {
    fn into_error(self, expr: &str) -> ExprError {
        let expr = expr.to_string();
        match self {
            Fault::DivisionByZero => ExprError::DivisionByZero { expr },
            Fault::Distribution(message) => ExprError::Distribution { expr, message },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
}

impl BinaryOp {
    fn apply(self, a: f64, b: f64) -> std::result::Result<f64, Fault> {
        match self {
            BinaryOp::Add => Ok(a + b),
            BinaryOp::Sub => Ok(a - b),
            BinaryOp::Mul => Ok(a * b),
            BinaryOp::Div if b == 0.0 => Err(Fault::DivisionByZero),
            BinaryOp::Div => Ok(a / b),
            BinaryOp::Pow => Ok(a.powf(b)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Arity {
    Exact(usize),
    AtLeast(usize),
}

impl Arity {
    fn accepts(self, n: usize) -> bool {
        match self {
            Arity::Exact(k) => n == k,
            Arity::AtLeast(k) => n >= k,
        }
    }

    fn describe(self) -> String {
        match self {
            Arity::Exact(k) => k.to_string(),
            Arity::AtLeast(k) => format!("at least {}", k),
        }
    }
}

/// Built-in functions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Function {
    Exp,
    Log,
    Log10,
    Sqrt,
    Abs,
    Sin,
    Cos,
    Tan,
    Floor,
    Ceil,
    Pow,
    Max,
    Min,
    /// Uniform draw in `[low, high)`
    Uniform,
    /// Gaussian draw
    Normal,
    /// Log-normal draw (parameters of the underlying normal)
    LogNormal,
    /// Exponential draw with the given rate
    Exponential,
}

impl Function {
    pub const ALL: [Function; 17] = [
        Function::Exp,
        Function::Log,
        Function::Log10,
        Function::Sqrt,
        Function::Abs,
        Function::Sin,
        Function::Cos,
        Function::Tan,
        Function::Floor,
        Function::Ceil,
        Function::Pow,
        Function::Max,
        Function::Min,
        Function::Uniform,
        Function::Normal,
        Function::LogNormal,
        Function::Exponential,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Function::Exp => "exp",
            Function::Log => "log",
            Function::Log10 => "log10",
            Function::Sqrt => "sqrt",
            Function::Abs => "abs",
            Function::Sin => "sin",
            Function::Cos => "cos",
            Function::Tan => "tan",
            Function::Floor => "floor",
            Function::Ceil => "ceil",
            Function::Pow => "pow",
            Function::Max => "max",
            Function::Min => "min",
            Function::Uniform => "uniform",
            Function::Normal => "normal",
            Function::LogNormal => "lognormal",
            Function::Exponential => "exponential",
        }
    }

    /// Call signature as written in formulas
    pub fn signature(self) -> &'static str {
        match self {
            Function::Pow => "pow(base, exponent)",
            Function::Max => "max(a, b, ...)",
            Function::Min => "min(a, b, ...)",
            Function::Uniform => "uniform(low, high)",
            Function::Normal => "normal(mean, sd)",
            Function::LogNormal => "lognormal(mu, sigma)",
            Function::Exponential => "exponential(rate)",
            Function::Exp => "exp(x)",
            Function::Log => "log(x)",
            Function::Log10 => "log10(x)",
            Function::Sqrt => "sqrt(x)",
            Function::Abs => "abs(x)",
            Function::Sin => "sin(x)",
            Function::Cos => "cos(x)",
            Function::Tan => "tan(x)",
            Function::Floor => "floor(x)",
            Function::Ceil => "ceil(x)",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|f| f.name() == name)
    }

    pub fn is_stochastic(self) -> bool {
        matches!(
            self,
            Function::Uniform | Function::Normal | Function::LogNormal | Function::Exponential
        )
    }

    fn arity(self) -> Arity {
        match self {
            Function::Max | Function::Min => Arity::AtLeast(2),
            Function::Pow | Function::Uniform | Function::Normal | Function::LogNormal => Arity::Exact(2),
            _ => Arity::Exact(1),
        }
    }

    /// Deterministic functions; `args` already has the right length
    fn apply(self, args: &[f64]) -> f64 {
        match self {
            Function::Exp => args[0].exp(),
            Function::Log => args[0].ln(),
            Function::Log10 => args[0].log10(),
            Function::Sqrt => args[0].sqrt(),
            Function::Abs => args[0].abs(),
            Function::Sin => args[0].sin(),
            Function::Cos => args[0].cos(),
            Function::Tan => args[0].tan(),
            Function::Floor => args[0].floor(),
            Function::Ceil => args[0].ceil(),
            Function::Pow => args[0].powf(args[1]),
            Function::Max => args.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            Function::Min => args.iter().copied().fold(f64::INFINITY, f64::min),
            // Stochastic functions never reach the pure path
            _ => f64::NAN,
        }
    }

    fn sample<R: Rng + ?Sized>(self, args: &[f64], rng: &mut R) -> std::result::Result<f64, Fault> {
        match self {
            Function::Uniform => {
                let (low, high) = (args[0], args[1]);
                if !(high - low).is_finite() || low > high {
                    return Err(Fault::Distribution(format!("uniform({}, {})", low, high)));
                }
                if low == high {
                    Ok(low)
                } else {
                    Ok(rng.gen_range(low..high))
                }
            }
            Function::Normal | Function::LogNormal if !(args[1] >= 0.0) => Err(Fault::Distribution(format!(
                "{}({}, {}): spread must be non-negative",
                self.name(),
                args[0],
                args[1]
            ))),
            Function::Normal => Normal::new(args[0], args[1])
                .map(|d| d.sample(rng))
                .map_err(|e| Fault::Distribution(format!("normal({}, {}): {}", args[0], args[1], e))),
            Function::LogNormal => LogNormal::new(args[0], args[1])
                .map(|d| d.sample(rng))
                .map_err(|e| Fault::Distribution(format!("lognormal({}, {}): {}", args[0], args[1], e))),
            Function::Exponential => {
                if !(args[0] > 0.0) {
                    return Err(Fault::Distribution(format!("exponential({}): rate must be positive", args[0])));
                }
                Exp::new(args[0])
                    .map(|d| d.sample(rng))
                    .map_err(|e| Fault::Distribution(format!("exponential({}): {}", args[0], e)))
            }
            _ => Ok(self.apply(args)),
        }
    }
}

// =============================================================================
// NAME RESOLUTION
// =============================================================================

/// Index of a bound variable
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Slot(pub u16);

/// Maps formula identifiers to slots at compile time
pub trait SymbolTable {
    fn resolve(&self, name: &str) -> Option<Slot>;

    /// Name for diagnostics
    fn name_of(&self, slot: Slot) -> Option<String>;
}

/// Supplies slot values at evaluation time
pub trait Scope {
    fn value(&self, slot: Slot) -> f64;
}

impl Scope for [f64] {
    fn value(&self, slot: Slot) -> f64 {
        self.get(slot.0 as usize).copied().unwrap_or(f64::NAN)
    }
}

// =============================================================================
// DECLARED VALUES
// =============================================================================

/// A declared parameter: a plain number or a formula string
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Number(f64),
    Formula(String),
}

impl From<f64> for ParamValue {
    fn from(value: f64) -> Self {
        ParamValue::Number(value)
    }
}

impl From<&str> for ParamValue {
    fn from(source: &str) -> Self {
        ParamValue::Formula(source.to_string())
    }
}

/// A compiled parameter
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Compiled {
    Const(f64),
    Formula(FormulaId),
}

impl Compiled {
    pub fn as_const(self) -> Option<f64> {
        match self {
            Compiled::Const(v) => Some(v),
            Compiled::Formula(_) => None,
        }
    }
}

// =============================================================================
// EXPRESSION ARENA
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FormulaId(u32);

impl FormulaId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct NodeId(u32);

#[derive(Debug, Clone, Copy, PartialEq)]
enum Node {
    Const(f64),
    Var(Slot),
    Neg(NodeId),
    Binary(BinaryOp, NodeId, NodeId),
    /// Arguments live in `ExprArena::args[start..start + len]`
    Call { func: Function, start: u32, len: u32 },
}

#[derive(Debug, Clone)]
struct Formula {
    source: String,
    root: NodeId,
    /// Referenced slots, sorted and deduplicated
    slots: Vec<Slot>,
    stochastic: bool,
}

/// Flat storage for every formula of a build
#[derive(Debug, Clone, Default)]
pub struct ExprArena {
    nodes: Vec<Node>,
    args: Vec<NodeId>,
    formulas: Vec<Formula>,
}

impl ExprArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of compiled formulas
    pub fn len(&self) -> usize {
        self.formulas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.formulas.is_empty()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Parse and lower a formula
    pub fn compile(&mut self, source: &str, symbols: &dyn SymbolTable) -> Result<FormulaId> {
        let ast = parse(source)?;
        let node_mark = self.nodes.len();
        let arg_mark = self.args.len();

        let mut lowering = Lowering {
            arena: self,
            source,
            symbols,
            slots: Vec::new(),
            stochastic: false,
        };
        let lowered = lowering.lower(&ast);
        let Lowering {
            mut slots, stochastic, ..
        } = lowering;

        let folded_non_finite = |root: NodeId, nodes: &[Node]| match nodes[root.0 as usize] {
            Node::Const(v) if !v.is_finite() => Err(ExprError::NonFinite {
                expr: source.to_string(),
            }),
            _ => Ok(root),
        };
        let root = match lowered.and_then(|root| folded_non_finite(root, &self.nodes)) {
            Ok(root) => root,
            Err(e) => {
                self.nodes.truncate(node_mark);
                self.args.truncate(arg_mark);
                return Err(e);
            }
        };
        slots.sort();
        slots.dedup();

        let id = FormulaId(self.formulas.len() as u32);
        self.formulas.push(Formula {
            source: source.to_string(),
            root,
            slots,
            stochastic,
        });
        Ok(id)
    }

    /// Compile a declared value; plain numbers bypass the parser
    pub fn compile_value(&mut self, value: &ParamValue, symbols: &dyn SymbolTable) -> Result<Compiled> {
        match value {
            ParamValue::Number(v) => Ok(Compiled::Const(*v)),
            ParamValue::Formula(source) => {
                let id = self.compile(source, symbols)?;
                Ok(match self.constant(id) {
                    Some(v) => Compiled::Const(v),
                    None => Compiled::Formula(id),
                })
            }
        }
    }

    /// Value of a formula that folded to a constant
    pub fn constant(&self, id: FormulaId) -> Option<f64> {
        match self.nodes[self.formulas[id.index()].root.0 as usize] {
            Node::Const(v) => Some(v),
            _ => None,
        }
    }

    pub fn source(&self, id: FormulaId) -> &str {
        &self.formulas[id.index()].source
    }

    pub fn slots(&self, id: FormulaId) -> &[Slot] {
        &self.formulas[id.index()].slots
    }

    pub fn is_stochastic(&self, id: FormulaId) -> bool {
        self.formulas[id.index()].stochastic
    }

    /// Evaluate a formula, drawing from `rng` left to right
    pub fn eval<S, R>(&self, id: FormulaId, scope: &S, rng: &mut R) -> Result<f64>
    where
        S: Scope + ?Sized,
        R: Rng + ?Sized,
    {
        let formula = &self.formulas[id.index()];
        let value = self
            .eval_node(formula.root, scope, rng)
            .map_err(|fault| fault.into_error(&formula.source))?;
        if value.is_finite() {
            Ok(value)
        } else {
            Err(ExprError::NonFinite {
                expr: formula.source.clone(),
            })
        }
    }

    pub fn evaluate<S, R>(&self, value: Compiled, scope: &S, rng: &mut R) -> Result<f64>
    where
        S: Scope + ?Sized,
        R: Rng + ?Sized,
    {
        match value {
            Compiled::Const(v) => Ok(v),
            Compiled::Formula(id) => self.eval(id, scope, rng),
        }
    }

    /// `name=value` pairs for every slot a formula references
    pub fn describe_bindings<S>(&self, id: FormulaId, scope: &S, symbols: &dyn SymbolTable) -> String
    where
        S: Scope + ?Sized,
    {
        self.slots(id)
            .iter()
            .map(|&slot| {
                let name = symbols.name_of(slot).unwrap_or_else(|| format!("#{}", slot.0));
                format!("{}={}", name, scope.value(slot))
            })
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn eval_node<S, R>(&self, id: NodeId, scope: &S, rng: &mut R) -> std::result::Result<f64, Fault>
    where
        S: Scope + ?Sized,
        R: Rng + ?Sized,
    {
        match self.nodes[id.0 as usize] {
            Node::Const(v) => Ok(v),
            Node::Var(slot) => Ok(scope.value(slot)),
            Node::Neg(inner) => Ok(-self.eval_node(inner, scope, rng)?),
            Node::Binary(op, lhs, rhs) => {
                let a = self.eval_node(lhs, scope, rng)?;
                let b = self.eval_node(rhs, scope, rng)?;
                op.apply(a, b)
            }
            Node::Call { func, start, len } => {
                let args = &self.args[start as usize..(start + len) as usize];
                match func {
                    Function::Max | Function::Min => {
                        let mut acc = self.eval_node(args[0], scope, rng)?;
                        for &arg in &args[1..] {
                            let v = self.eval_node(arg, scope, rng)?;
                            acc = if func == Function::Max { acc.max(v) } else { acc.min(v) };
                        }
                        Ok(acc)
                    }
                    _ => {
                        let mut values = [0.0; 2];
                        for (slot, &arg) in values.iter_mut().zip(args) {
                            *slot = self.eval_node(arg, scope, rng)?;
                        }
                        func.sample(&values[..args.len()], rng)
                    }
                }
            }
        }
    }
}

struct Lowering<'a> {
    arena: &'a mut ExprArena,
    source: &'a str,
    symbols: &'a dyn SymbolTable,
    slots: Vec<Slot>,
    stochastic: bool,
}

impl Lowering<'_> {
    fn push(&mut self, node: Node) -> NodeId {
        let id = NodeId(self.arena.nodes.len() as u32);
        self.arena.nodes.push(node);
        id
    }

    fn constant(&self, id: NodeId) -> Option<f64> {
        match self.arena.nodes[id.0 as usize] {
            Node::Const(v) => Some(v),
            _ => None,
        }
    }

    /// Replace everything pushed since `mark` with one constant
    fn fold(&mut self, mark: usize, value: f64) -> NodeId {
        self.arena.nodes.truncate(mark);
        self.push(Node::Const(value))
    }

    fn lower(&mut self, ast: &Ast) -> Result<NodeId> {
        let mark = self.arena.nodes.len();
        match ast {
            Ast::Number(v) => Ok(self.push(Node::Const(*v))),
            Ast::Ident(name) => match self.symbols.resolve(name) {
                Some(slot) => {
                    self.slots.push(slot);
                    Ok(self.push(Node::Var(slot)))
                }
                None if name == "pi" => Ok(self.push(Node::Const(std::f64::consts::PI))),
                None => Err(ExprError::UnknownIdentifier {
                    expr: self.source.to_string(),
                    name: name.clone(),
                }),
            },
            Ast::Neg(inner) => {
                let inner = self.lower(inner)?;
                match self.constant(inner) {
                    Some(v) => Ok(self.fold(mark, -v)),
                    None => Ok(self.push(Node::Neg(inner))),
                }
            }
            Ast::Binary(op, lhs, rhs) => {
                let lhs = self.lower(lhs)?;
                let rhs = self.lower(rhs)?;
                match (self.constant(lhs), self.constant(rhs)) {
                    (Some(a), Some(b)) => {
                        let v = op.apply(a, b).map_err(|fault| fault.into_error(self.source))?;
                        Ok(self.fold(mark, v))
                    }
                    _ => Ok(self.push(Node::Binary(*op, lhs, rhs))),
                }
            }
            Ast::Call(name, args) => {
                let func = Function::from_name(name).ok_or_else(|| ExprError::UnknownFunction {
                    expr: self.source.to_string(),
                    name: name.clone(),
                })?;
                if !func.arity().accepts(args.len()) {
                    return Err(ExprError::Arity {
                        expr: self.source.to_string(),
                        name: name.clone(),
                        expected: func.arity().describe(),
                        got: args.len(),
                    });
                }

                let lowered = args
                    .iter()
                    .map(|arg| self.lower(arg))
                    .collect::<Result<Vec<_>>>()?;
                let constants: Option<Vec<f64>> = lowered.iter().map(|&id| self.constant(id)).collect();

                match constants {
                    Some(values) if !func.is_stochastic() => Ok(self.fold(mark, func.apply(&values))),
                    _ => {
                        self.stochastic |= func.is_stochastic();
                        let start = self.arena.args.len() as u32;
                        self.arena.args.extend(lowered.iter().copied());
                        Ok(self.push(Node::Call {
                            func,
                            start,
                            len: lowered.len() as u32,
                        }))
                    }
                }
            }
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha12Rng;

    struct Names(Vec<&'static str>);

    impl SymbolTable for Names {
        fn resolve(&self, name: &str) -> Option<Slot> {
            self.0.iter().position(|n| *n == name).map(|i| Slot(i as u16))
        }

        fn name_of(&self, slot: Slot) -> Option<String> {
            self.0.get(slot.0 as usize).map(|n| n.to_string())
        }
    }

    fn names() -> Names {
        Names(vec!["dist_3D", "propVelocity", "post_ynorm"])
    }

    const NO_VARS: &[f64] = &[];

    fn rng() -> ChaCha12Rng {
        ChaCha12Rng::seed_from_u64(42)
    }

    fn eval_with(source: &str, values: &[f64]) -> Result<f64> {
        let mut arena = ExprArena::new();
        let id = arena.compile(source, &names())?;
        arena.eval(id, values, &mut rng())
    }

    #[test]
    fn test_precedence() {
        assert_eq!(eval_with("1 + 2 * 3", &[]).unwrap(), 7.0);
        assert_eq!(eval_with("(1 + 2) * 3", &[]).unwrap(), 9.0);
        assert_eq!(eval_with("10 / 4", &[]).unwrap(), 2.5);
        assert_eq!(eval_with("2 ^ 3 ^ 2", &[]).unwrap(), 512.0);
        assert_eq!(eval_with("2 ** 3", &[]).unwrap(), 8.0);
        assert_eq!(eval_with("-2 ^ 2", &[]).unwrap(), -4.0);
        assert_eq!(eval_with("3 - -1", &[]).unwrap(), 4.0);
        assert_eq!(eval_with("1.5e2 + .5", &[]).unwrap(), 150.5);
    }

    #[test]
    fn test_distance_formulas() {
        let p = eval_with("0.4*exp(-dist_3D/150.0)", &[150.0]).unwrap();
        assert!((p - 0.4 * (-1.0f64).exp()).abs() < 1e-12);

        let near = eval_with("max(1.0, dist_3D/propVelocity)", &[50.0, 100.0]).unwrap();
        let far = eval_with("max(1.0, dist_3D/propVelocity)", &[300.0, 100.0]).unwrap();
        assert_eq!(near, 1.0);
        assert_eq!(far, 3.0);

        let w = eval_with("5.0*post_ynorm", &[0.0, 0.0, 0.25]).unwrap();
        assert_eq!(w, 1.25);
    }

    #[test]
    fn test_variadic_min_max() {
        assert_eq!(eval_with("max(1, 7, 3)", &[]).unwrap(), 7.0);
        assert_eq!(eval_with("min(4, dist_3D, 9)", &[2.0]).unwrap(), 2.0);
    }

    #[test]
    fn test_compile_errors() {
        let mut arena = ExprArena::new();
        let symbols = names();

        assert!(matches!(
            arena.compile("dist_3D + unknown_var", &symbols),
            Err(ExprError::UnknownIdentifier { ref name, .. }) if name == "unknown_var"
        ));
        assert!(matches!(
            arena.compile("gauss(1, 2)", &symbols),
            Err(ExprError::UnknownFunction { .. })
        ));
        assert!(matches!(arena.compile("exp(1, 2)", &symbols), Err(ExprError::Arity { .. })));
        assert!(matches!(arena.compile("max(1)", &symbols), Err(ExprError::Arity { .. })));
        assert!(matches!(arena.compile("1 +", &symbols), Err(ExprError::Syntax { .. })));
        assert!(matches!(arena.compile("", &symbols), Err(ExprError::Syntax { .. })));
        assert!(matches!(arena.compile("1 / 0", &symbols), Err(ExprError::DivisionByZero { .. })));

        // Failed compiles leave nothing behind
        assert!(arena.is_empty());
        assert_eq!(arena.node_count(), 0);
    }

    #[test]
    fn test_error_keeps_source() {
        let mut arena = ExprArena::new();
        let err = arena.compile("2 * nope", &names()).unwrap_err();
        assert_eq!(err.expr(), "2 * nope");
    }

    #[test]
    fn test_runtime_division_by_zero() {
        let err = eval_with("1 / dist_3D", &[0.0]).unwrap_err();
        assert_eq!(err, ExprError::DivisionByZero { expr: "1 / dist_3D".into() });
    }

    #[test]
    fn test_non_finite() {
        assert!(matches!(eval_with("sqrt(dist_3D)", &[-1.0]), Err(ExprError::NonFinite { .. })));
        assert!(matches!(eval_with("log(dist_3D)", &[0.0]), Err(ExprError::NonFinite { .. })));
    }

    #[test]
    fn test_folded_non_finite_rejected() {
        let mut arena = ExprArena::new();
        let symbols = names();
        for source in ["log(0)", "sqrt(0 - 1)", "1e308 * 10", "-log(0)"] {
            let err = arena.compile_value(&ParamValue::from(source), &symbols).unwrap_err();
            assert_eq!(err, ExprError::NonFinite { expr: source.into() });
        }
        assert!(arena.is_empty());
        assert_eq!(arena.node_count(), 0);

        // A non-finite intermediate that folds to a finite value is fine
        let value = arena.compile_value(&ParamValue::from("max(1, log(0))"), &symbols).unwrap();
        assert_eq!(value, Compiled::Const(1.0));
    }

    #[test]
    fn test_constant_folding() {
        let mut arena = ExprArena::new();
        let symbols = names();

        let value = arena.compile_value(&ParamValue::from("2 * 3 + max(1, 0.5)"), &symbols).unwrap();
        assert_eq!(value, Compiled::Const(7.0));
        assert_eq!(arena.node_count(), 1);

        let value = arena.compile_value(&ParamValue::from(0.1), &symbols).unwrap();
        assert_eq!(value.as_const(), Some(0.1));

        let value = arena.compile_value(&ParamValue::from("pi * dist_3D"), &symbols).unwrap();
        assert!(matches!(value, Compiled::Formula(_)));
    }

    #[test]
    fn test_stochastic_not_folded() {
        let mut arena = ExprArena::new();
        let id = arena.compile("max(1, normal(5, 2))", &names()).unwrap();
        assert!(arena.is_stochastic(id));
        assert_eq!(arena.constant(id), None);

        let a = arena.eval(id, NO_VARS, &mut rng()).unwrap();
        let b = arena.eval(id, NO_VARS, &mut rng()).unwrap();
        assert_eq!(a, b);
        assert!(a >= 1.0);
    }

    #[test]
    fn test_uniform_range() {
        let mut arena = ExprArena::new();
        let id = arena.compile("uniform(2, 4)", &names()).unwrap();
        let mut r = rng();
        for _ in 0..100 {
            let v = arena.eval(id, NO_VARS, &mut r).unwrap();
            assert!((2.0..4.0).contains(&v));
        }
    }

    #[test]
    fn test_distribution_errors() {
        assert!(matches!(eval_with("normal(5, -2)", &[]), Err(ExprError::Distribution { .. })));
        assert!(matches!(eval_with("lognormal(0, -1)", &[]), Err(ExprError::Distribution { .. })));
        assert!(matches!(eval_with("max(1, normal(5, -2))", &[]), Err(ExprError::Distribution { .. })));
        assert!(matches!(eval_with("uniform(-1e308, 1e308)", &[]), Err(ExprError::Distribution { .. })));
        assert_eq!(eval_with("normal(5, 0)", &[]).unwrap(), 5.0);
        assert!(matches!(eval_with("uniform(4, 2)", &[]), Err(ExprError::Distribution { .. })));
        assert!(matches!(eval_with("exponential(0)", &[]), Err(ExprError::Distribution { .. })));
    }

    #[test]
    fn test_slots_and_bindings() {
        let mut arena = ExprArena::new();
        let symbols = names();
        let id = arena
            .compile("max(1.0, dist_3D/propVelocity) + dist_3D * 0", &symbols)
            .unwrap();
        assert_eq!(arena.slots(id), &[Slot(0), Slot(1)]);

        let values = [12.5, 100.0, 0.0];
        assert_eq!(
            arena.describe_bindings(id, &values[..], &symbols),
            "dist_3D=12.5, propVelocity=100"
        );
    }

    #[test]
    fn test_param_value_untagged() {
        let values: Vec<ParamValue> = serde_json::from_str(r#"[0.1, "5.0*post_ynorm", 1]"#).unwrap();
        assert_eq!(values[0], ParamValue::Number(0.1));
        assert_eq!(values[1], ParamValue::Formula("5.0*post_ynorm".into()));
        assert_eq!(values[2], ParamValue::Number(1.0));
    }

    #[test]
    fn test_function_lookup() {
        for func in Function::ALL {
            assert_eq!(Function::from_name(func.name()), Some(func));
            assert!(func.signature().starts_with(func.name()));
        }
        assert_eq!(Function::from_name("gauss"), None);
    }
}
