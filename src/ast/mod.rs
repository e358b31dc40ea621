//! Typed parse tree for tax specifications.
//!
//! The lexer/parser lives outside this crate; it produces this tree and the
//! engine only consumes it. Every node kind is a tagged enum matched
//! exhaustively downstream, so a grammar extension fails to compile instead of
//! silently evaluating to zero.

use std::rc::Rc;

/// A whole specification document: one block per country.
#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    pub countries: Vec<CountryBlock>,
}

/// `Name (currency-metadata)? { componentDef* }`
#[derive(Debug, Clone, PartialEq)]
pub struct CountryBlock {
    pub name: String,
    pub currency: Option<CurrencyDecl>,
    pub components: Vec<ComponentDef>,
}

/// Currency metadata clause, pre-tokenized by the parser.
///
/// Two declaration grammars exist: `CUR (= rate * BASE)?` and
/// `amount CUR = BASE`. The reverse form is inverted on load.
#[derive(Debug, Clone, PartialEq)]
pub enum CurrencyDecl {
    /// `(CUR)` — currency named, rate resolved from the external table.
    Bare(String),
    /// `(CUR = 0.60 * EUR)`
    Direct { code: String, rate: f64, base: String },
    /// `(11.25 CUR = EUR)`
    Reverse { amount: f64, code: String, base: String },
}

/// `name (: kind)? = { body }`
#[derive(Debug, Clone, PartialEq)]
pub struct ComponentDef {
    pub name: String,
    /// Defaults to `_` (internal helper) when absent.
    pub kind: Option<String>,
    pub wrapper: Wrapper,
    pub body: ComponentBody,
}

/// Wrapper semantics of a component body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wrapper {
    /// `{ ... }` — the final expression is the total tax at income `x`;
    /// marginal rate is its derivative.
    Total,
    /// A literal total/flow with zero marginal contribution.
    Literal,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ComponentBody {
    Number(f64),
    Expr(Rc<Expr>),
    Block(Rc<Block>),
}

/// Statements followed by the result expression.
#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    pub stmts: Vec<Stmt>,
    pub result: Expr,
}

/// `name = expr;` — a block-local binding, shadowing outer scope.
#[derive(Debug, Clone, PartialEq)]
pub struct Stmt {
    pub name: String,
    pub value: Expr,
}

/// A component reference path: `Name`, `Kind.Name`, `Country.Name`, or
/// `Country.Kind.Name` (one to three segments).
#[derive(Debug, Clone, PartialEq)]
pub struct RefPath(pub Vec<String>);

impl RefPath {
    pub fn joined(&self) -> String {
        self.0.join(".")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

/// Fixed numeric primitives of the DSL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Func {
    Min,
    Max,
    Abs,
    Pow,
    Sqrt,
    Log,
    Exp,
    Floor,
    Ceil,
    Round,
    Sum,
    If,
    Pos,
}

/// A band `[lower..upper]: rate;` inside `brackets`/`bracketsTaxable`.
#[derive(Debug, Clone, PartialEq)]
pub struct RangeArm {
    pub lower: Bound,
    pub upper: Bound,
    pub rate: Expr,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Bound {
    Finite(Expr),
    /// `inf` — an open-ended top band.
    Unbounded,
}

/// `cond: value;` inside `piece { ... }`.
#[derive(Debug, Clone, PartialEq)]
pub struct PieceArm {
    pub condition: Expr,
    pub value: Expr,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    Infinity,
    Bool(bool),
    Str(String),
    Ident(String),
    Neg(Box<Expr>),
    Binary {
        op: BinOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Compare {
        op: CmpOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    And(Vec<Expr>),
    Or(Vec<Expr>),
    Not(Box<Expr>),
    /// `T(path)` — total tax of another component at the current income.
    Ref(RefPath),
    /// `eval(path, incomeExpr)` — another component's total at an explicit income.
    Eval {
        target: RefPath,
        income: Box<Expr>,
    },
    /// `fix(init, update)` — single-variable fixed point, binding `k` in `update`.
    Fix {
        init: Box<Expr>,
        update: Box<Expr>,
    },
    Call {
        func: Func,
        args: Vec<Expr>,
    },
    /// First-match conditional; `default` covers the optional `else:` arm.
    Piece {
        arms: Vec<PieceArm>,
        default: Option<Box<Expr>>,
    },
    /// Total-tax integral of a banded rate function from 0 to the selector.
    Brackets {
        selector: Box<Expr>,
        arms: Vec<RangeArm>,
    },
    /// Brackets over income reduced by an allowance capped at `allowance_base`,
    /// with each band boundary reduced by the allowance at that gross income.
    BracketsTaxable {
        income: Box<Expr>,
        allowance: Box<Expr>,
        allowance_base: Box<Expr>,
        arms: Vec<RangeArm>,
    },
}

impl Expr {
    pub fn number(value: f64) -> Expr {
        Expr::Number(value)
    }

    pub fn ident(name: &str) -> Expr {
        Expr::Ident(name.to_string())
    }

    pub fn binary(op: BinOp, lhs: Expr, rhs: Expr) -> Expr {
        Expr::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        }
    }

    pub fn compare(op: CmpOp, lhs: Expr, rhs: Expr) -> Expr {
        Expr::Compare {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        }
    }

    pub fn reference(path: &[&str]) -> Expr {
        Expr::Ref(RefPath(path.iter().map(|s| s.to_string()).collect()))
    }

    pub fn call(func: Func, args: Vec<Expr>) -> Expr {
        Expr::Call { func, args }
    }
}

impl RangeArm {
    /// Literal-bound arm, the common case in authored schedules.
    pub fn literal(lower: f64, upper: Option<f64>, rate: Expr) -> RangeArm {
        RangeArm {
            lower: Bound::Finite(Expr::Number(lower)),
            upper: match upper {
                Some(v) => Bound::Finite(Expr::Number(v)),
                None => Bound::Unbounded,
            },
            rate,
        }
    }
}
