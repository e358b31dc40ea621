//! The specialized program: typed IR nodes in a flat arena, interpreted by a
//! dispatch loop.
//!
//! Node payloads reference the arena by index, so a whole program is a few
//! contiguous vectors. Per-component functions (value / marginal / total) are
//! statement lists plus a result node; component calls route through a
//! one-slot cache per (component, mode) and, only when the dependency graph
//! could not prove acyclicity, through in-progress cycle guards.

use std::cell::RefCell;

use smallvec::SmallVec;

use crate::ast::CmpOp;
use crate::eval::EvalError;
use crate::numeric::{
    ceil_to_step, clamp_fix, floor_to_step, maybe_finite, nan_or, round_to_step,
    DEFAULT_INTEGRATION_STEP, FIX_ABSOLUTE_TOLERANCE, FIX_MAX_ITERATIONS, FIX_NEWTON_MIN_DENOM,
    FIX_RELATIVE_TOLERANCE, MAX_INTEGRATION_SEGMENTS, MIN_DERIVATIVE_STEP,
    MIN_INTEGRATION_SEGMENTS,
};
use crate::plan::{BracketPlan, PieceValuePlan};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IrRef(pub u32);

impl IrRef {
    #[inline(always)]
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FnMode {
    Value,
    Marginal,
    Total,
}

#[derive(Debug, Clone)]
pub enum Ir {
    Const(f64),
    /// The current function's income argument (or the integration point
    /// inside a band rate body).
    X,
    Local(u16),
    Neg(IrRef),
    Add(IrRef, IrRef),
    Sub(IrRef, IrRef),
    Mul(IrRef, IrRef),
    Div(IrRef, IrRef),
    Pow(IrRef, IrRef),
    Abs(IrRef),
    Sqrt(IrRef),
    Log(IrRef),
    Exp(IrRef),
    Min(IrRef, IrRef),
    Max(IrRef, IrRef),
    FloorStep(IrRef, IrRef),
    CeilStep(IrRef, IrRef),
    RoundStep(IrRef, IrRef),
    Cmp(CmpOp, IrRef, IrRef),
    And(IrRef, IrRef),
    Or(IrRef, IrRef),
    Not(IrRef),
    Select {
        cond: IrRef,
        then: IrRef,
        other: IrRef,
    },
    /// Call into another component function at an income.
    Call {
        comp: u32,
        mode: FnMode,
        income: IrRef,
    },
    /// Numeric left-hand derivative of a component's value function; the
    /// last-resort marginal when no closed form or symbolic derivative holds.
    DerivativeOfValue {
        comp: u32,
        income: IrRef,
    },
    /// Closed-form bracket total over a computed selector.
    BracketTotal {
        plan: u32,
        selector: IrRef,
    },
    /// Closed-form bracket marginal over the plain income argument.
    BracketMarginal {
        plan: u32,
        income: IrRef,
    },
    PieceValue {
        plan: u32,
        income: IrRef,
    },
    PieceMarginal {
        plan: u32,
        income: IrRef,
    },
    /// Numeric banded integral from 0 to the selector (generic schedule
    /// fallback when arms are not literal).
    Bands {
        spec: u32,
        selector: IrRef,
    },
    /// Bounded fixed-point loop with optional one-step Newton acceleration.
    /// Assigns the converged iterate to its local slot and yields it.
    Fix {
        spec: u32,
    },
    /// d(fix)/dx via the implicit-function rule, read after the Fix node has
    /// run in the same function body (the slot holds the converged iterate).
    FixDerivative {
        spec: u32,
    },
}

#[derive(Debug, Clone)]
pub struct BandSpecArm {
    pub lower: IrRef,
    pub upper: IrRef,
    /// Rate as a function of the integration point (bound to `X`).
    pub rate: IrRef,
}

#[derive(Debug, Clone)]
pub struct BandSpec {
    pub arms: Vec<BandSpecArm>,
}

#[derive(Debug, Clone)]
pub struct FixSpec {
    pub k_slot: u16,
    pub init: IrRef,
    pub update: IrRef,
    /// d(update)/dk at the current iterate; enables the Newton step.
    pub k_deriv: Option<IrRef>,
    /// d(update)/dx at the converged iterate; enables FixDerivative.
    pub x_deriv: Option<IrRef>,
    pub warm: u32,
}

#[derive(Debug, Clone)]
pub struct FnBody {
    pub stmts: Vec<(u16, IrRef)>,
    pub ret: IrRef,
    pub locals: u16,
}

#[derive(Debug, Clone)]
pub struct ComponentFns {
    pub value: FnBody,
    pub marginal: FnBody,
    pub total: FnBody,
    /// Proven safe to skip the one-slot cache (leaf or unreferenced in an
    /// acyclic graph).
    pub bypass_memo: bool,
    pub label: String,
}

/// Per-program mutable state: one-slot caches per (component, mode), cycle
/// guard bits, and the fixed-point warm-start slots. Persists across income
/// queries; the caches key on the exact income so staleness is impossible.
#[derive(Debug, Clone, Default)]
pub struct CacheState {
    vx: Vec<f64>,
    vv: Vec<f64>,
    vh: Vec<bool>,
    mx: Vec<f64>,
    mv: Vec<f64>,
    mh: Vec<bool>,
    tx: Vec<f64>,
    tv: Vec<f64>,
    th: Vec<bool>,
    in_progress: Vec<[bool; 3]>,
    warm: Vec<f64>,
}

impl CacheState {
    pub fn new(component_count: usize, warm_count: usize) -> CacheState {
        CacheState {
            vx: vec![0.0; component_count],
            vv: vec![0.0; component_count],
            vh: vec![false; component_count],
            mx: vec![0.0; component_count],
            mv: vec![0.0; component_count],
            mh: vec![false; component_count],
            tx: vec![0.0; component_count],
            tv: vec![0.0; component_count],
            th: vec![false; component_count],
            in_progress: vec![[false; 3]; component_count],
            // Warm slots start at 0 and are reused whenever finite; the
            // converged answer is init-independent by the fix contract.
            warm: vec![0.0; warm_count],
        }
    }
}

/// A specialized evaluator for one prepared (country, schedules, currency)
/// context: reachable components only, closed forms and symbolic derivatives
/// baked in.
#[derive(Debug)]
pub struct SpecializedProgram {
    pub(super) arena: Vec<Ir>,
    pub(super) plans: Vec<BracketPlan>,
    pub(super) piece_plans: Vec<PieceValuePlan>,
    pub(super) bands: Vec<BandSpec>,
    pub(super) fixes: Vec<FixSpec>,
    pub(super) fns: Vec<ComponentFns>,
    pub(super) active: Vec<u32>,
    pub(super) source_to_country: f64,
    pub(super) use_cycle_guards: bool,
    pub(super) needs_cache: bool,
    pub(super) cache: RefCell<CacheState>,
}

impl SpecializedProgram {
    /// Number of components that survived reachability pruning.
    pub fn component_count(&self) -> usize {
        self.fns.len()
    }

    pub fn marginal_rate(&self, gross_income: f64) -> Result<f64, EvalError> {
        if !gross_income.is_finite() {
            return Err(EvalError::NonFiniteIncome);
        }
        let local = gross_income * self.source_to_country;
        if local < 0.0 {
            return Ok(0.0);
        }

        let cache = &mut *self.cache.borrow_mut();
        let mut total = 0.0;
        for &comp in &self.active {
            total += self.call_fn(comp, FnMode::Marginal, local, cache)?;
        }
        Ok(maybe_finite(total))
    }

    pub fn overall_rate(&self, gross_income: f64) -> Result<f64, EvalError> {
        if !gross_income.is_finite() {
            return Err(EvalError::NonFiniteIncome);
        }
        let local = gross_income * self.source_to_country;
        if local <= 0.0 {
            return Ok(0.0);
        }

        let cache = &mut *self.cache.borrow_mut();
        let mut total = 0.0;
        for &comp in &self.active {
            total += self.call_fn(comp, FnMode::Total, local, cache)?;
        }
        Ok(maybe_finite(total / local))
    }

    fn call_fn(
        &self,
        comp: u32,
        mode: FnMode,
        x: f64,
        cache: &mut CacheState,
    ) -> Result<f64, EvalError> {
        let index = comp as usize;
        let fns = &self.fns[index];
        let use_cache = self.needs_cache && !fns.bypass_memo;

        if use_cache {
            let hit = match mode {
                FnMode::Value => cache.vh[index] && cache.vx[index] == x,
                FnMode::Marginal => cache.mh[index] && cache.mx[index] == x,
                FnMode::Total => cache.th[index] && cache.tx[index] == x,
            };
            if hit {
                return Ok(match mode {
                    FnMode::Value => cache.vv[index],
                    FnMode::Marginal => cache.mv[index],
                    FnMode::Total => cache.tv[index],
                });
            }
        }

        let mode_slot = match mode {
            FnMode::Value => 0,
            FnMode::Marginal => 1,
            FnMode::Total => 2,
        };
        if self.use_cycle_guards {
            if cache.in_progress[index][mode_slot] {
                return Err(EvalError::CircularReference(fns.label.clone()));
            }
            cache.in_progress[index][mode_slot] = true;
        }

        let body = match mode {
            FnMode::Value => &fns.value,
            FnMode::Marginal => &fns.marginal,
            FnMode::Total => &fns.total,
        };
        let result = self.run_body(body, x, cache);

        if self.use_cycle_guards {
            cache.in_progress[index][mode_slot] = false;
        }
        let value = result?;

        if use_cache {
            match mode {
                FnMode::Value => {
                    cache.vh[index] = true;
                    cache.vx[index] = x;
                    cache.vv[index] = value;
                }
                FnMode::Marginal => {
                    cache.mh[index] = true;
                    cache.mx[index] = x;
                    cache.mv[index] = value;
                }
                FnMode::Total => {
                    cache.th[index] = true;
                    cache.tx[index] = x;
                    cache.tv[index] = value;
                }
            }
        }
        Ok(value)
    }

    fn run_body(&self, body: &FnBody, x: f64, cache: &mut CacheState) -> Result<f64, EvalError> {
        let mut locals: SmallVec<[f64; 8]> = SmallVec::from_elem(0.0, body.locals as usize);
        for &(slot, ir) in &body.stmts {
            let value = self.eval(ir, x, &mut locals, cache)?;
            locals[slot as usize] = value;
        }
        self.eval(body.ret, x, &mut locals, cache)
    }

    fn eval(
        &self,
        ir: IrRef,
        x: f64,
        locals: &mut SmallVec<[f64; 8]>,
        cache: &mut CacheState,
    ) -> Result<f64, EvalError> {
        let node = self.arena[ir.index()].clone();
        Ok(match node {
            Ir::Const(value) => value,
            Ir::X => x,
            Ir::Local(slot) => locals[slot as usize],
            Ir::Neg(a) => -self.eval(a, x, locals, cache)?,
            Ir::Add(a, b) => self.eval(a, x, locals, cache)? + self.eval(b, x, locals, cache)?,
            Ir::Sub(a, b) => self.eval(a, x, locals, cache)? - self.eval(b, x, locals, cache)?,
            Ir::Mul(a, b) => self.eval(a, x, locals, cache)? * self.eval(b, x, locals, cache)?,
            Ir::Div(a, b) => self.eval(a, x, locals, cache)? / self.eval(b, x, locals, cache)?,
            Ir::Pow(a, b) => {
                let base = self.eval(a, x, locals, cache)?;
                base.powf(self.eval(b, x, locals, cache)?)
            }
            Ir::Abs(a) => self.eval(a, x, locals, cache)?.abs(),
            Ir::Sqrt(a) => self.eval(a, x, locals, cache)?.sqrt(),
            Ir::Log(a) => self.eval(a, x, locals, cache)?.ln(),
            Ir::Exp(a) => self.eval(a, x, locals, cache)?.exp(),
            Ir::Min(a, b) => {
                let left = self.eval(a, x, locals, cache)?;
                left.min(self.eval(b, x, locals, cache)?)
            }
            Ir::Max(a, b) => {
                let left = self.eval(a, x, locals, cache)?;
                left.max(self.eval(b, x, locals, cache)?)
            }
            Ir::FloorStep(a, step) => {
                let value = self.eval(a, x, locals, cache)?;
                floor_to_step(value, self.eval(step, x, locals, cache)?)
            }
            Ir::CeilStep(a, step) => {
                let value = self.eval(a, x, locals, cache)?;
                ceil_to_step(value, self.eval(step, x, locals, cache)?)
            }
            Ir::RoundStep(a, step) => {
                let value = self.eval(a, x, locals, cache)?;
                round_to_step(value, self.eval(step, x, locals, cache)?)
            }
            Ir::Cmp(op, a, b) => {
                let left = self.eval(a, x, locals, cache)?;
                let right = self.eval(b, x, locals, cache)?;
                let result = match op {
                    CmpOp::Lt => left < right,
                    CmpOp::Le => left <= right,
                    CmpOp::Gt => left > right,
                    CmpOp::Ge => left >= right,
                    CmpOp::Eq => left == right,
                    CmpOp::Ne => left != right,
                };
                bool_num(result)
            }
            Ir::And(a, b) => {
                bool_num(truthy(self.eval(a, x, locals, cache)?) && truthy(self.eval(b, x, locals, cache)?))
            }
            Ir::Or(a, b) => {
                bool_num(truthy(self.eval(a, x, locals, cache)?) || truthy(self.eval(b, x, locals, cache)?))
            }
            Ir::Not(a) => bool_num(!truthy(self.eval(a, x, locals, cache)?)),
            Ir::Select { cond, then, other } => {
                if truthy(self.eval(cond, x, locals, cache)?) {
                    self.eval(then, x, locals, cache)?
                } else {
                    self.eval(other, x, locals, cache)?
                }
            }
            Ir::Call { comp, mode, income } => {
                let income = self.eval(income, x, locals, cache)?;
                self.call_fn(comp, mode, income, cache)?
            }
            Ir::DerivativeOfValue { comp, income } => {
                let income = self.eval(income, x, locals, cache)?;
                self.value_derivative(comp, income, cache)?
            }
            Ir::BracketTotal { plan, selector } => {
                let selector = self.eval(selector, x, locals, cache)?;
                self.plans[plan as usize].total(nan_or(selector, 0.0))
            }
            Ir::BracketMarginal { plan, income } => {
                let income = self.eval(income, x, locals, cache)?;
                self.plans[plan as usize].marginal(nan_or(income, 0.0))
            }
            Ir::PieceValue { plan, income } => {
                let income = self.eval(income, x, locals, cache)?;
                self.piece_plans[plan as usize].value(nan_or(income, 0.0))
            }
            Ir::PieceMarginal { plan, income } => {
                let income = self.eval(income, x, locals, cache)?;
                self.piece_plans[plan as usize].marginal(nan_or(income, 0.0))
            }
            Ir::Bands { spec, selector } => {
                let selector = self.eval(selector, x, locals, cache)?;
                self.eval_bands(spec, selector, x, locals, cache)?
            }
            Ir::Fix { spec } => self.eval_fix(spec, x, locals, cache)?,
            Ir::FixDerivative { spec } => self.eval_fix_derivative(spec, x, locals, cache)?,
        })
    }

    fn eval_bands(
        &self,
        spec: u32,
        selector: f64,
        x: f64,
        locals: &mut SmallVec<[f64; 8]>,
        cache: &mut CacheState,
    ) -> Result<f64, EvalError> {
        if !selector.is_finite() || selector <= 0.0 {
            return Ok(0.0);
        }

        // Indexed loop: `self.bands` stays free for the recursive evals.
        let arm_count = self.bands[spec as usize].arms.len();
        let mut total = 0.0;
        for arm_index in 0..arm_count {
            let arm = self.bands[spec as usize].arms[arm_index].clone();
            let lower = self.eval(arm.lower, x, locals, cache)?;
            let upper = self.eval(arm.upper, x, locals, cache)?;

            if !lower.is_finite() || upper.is_nan() {
                continue;
            }
            if selector <= lower {
                continue;
            }
            let segment_upper = selector.min(upper);
            if segment_upper <= lower {
                continue;
            }

            // Midpoint rule with the shared segment-count policy; the rate
            // body sees the integration point as its `X`.
            let span = segment_upper - lower;
            let segments = ((span / DEFAULT_INTEGRATION_STEP).ceil() as usize)
                .clamp(MIN_INTEGRATION_SEGMENTS, MAX_INTEGRATION_SEGMENTS);
            let step = span / segments as f64;
            for segment in 0..segments {
                let midpoint = lower + (segment as f64 + 0.5) * step;
                let rate = self.eval(arm.rate, midpoint, locals, cache)?;
                total += nan_or(rate, 0.0) * step;
            }

            if selector <= upper {
                break;
            }
        }
        Ok(total)
    }

    fn eval_fix(
        &self,
        spec: u32,
        x: f64,
        locals: &mut SmallVec<[f64; 8]>,
        cache: &mut CacheState,
    ) -> Result<f64, EvalError> {
        let spec = self.fixes[spec as usize].clone();
        let slot = spec.k_slot as usize;

        let warm = cache.warm[spec.warm as usize];
        let start = if warm.is_finite() {
            warm
        } else {
            self.eval(spec.init, x, locals, cache)?
        };
        let mut current = clamp_fix(start);
        locals[slot] = current;

        // One Newton step when the update's k-derivative is available: keep
        // the candidate only if it does not worsen the residual.
        if let Some(k_deriv) = spec.k_deriv {
            let value0 = clamp_fix(nan_or(self.eval(spec.update, x, locals, cache)?, current));
            let slope0 = self.eval(k_deriv, x, locals, cache)?;
            let denom0 = 1.0 - slope0;
            if denom0.is_finite() && denom0.abs() >= FIX_NEWTON_MIN_DENOM {
                let candidate = clamp_fix(current - (current - value0) / denom0);
                if candidate.is_finite() {
                    let baseline_residual = (current - value0).abs();
                    locals[slot] = candidate;
                    let candidate_value =
                        clamp_fix(nan_or(self.eval(spec.update, x, locals, cache)?, candidate));
                    let candidate_residual = (candidate - candidate_value).abs();
                    if !candidate_residual.is_finite()
                        || candidate_residual > baseline_residual + FIX_ABSOLUTE_TOLERANCE
                    {
                        current = value0;
                    } else {
                        current = candidate;
                    }
                } else {
                    current = value0;
                }
                locals[slot] = current;
            }
        }

        for _ in 0..FIX_MAX_ITERATIONS {
            locals[slot] = current;
            let next = clamp_fix(nan_or(self.eval(spec.update, x, locals, cache)?, current));
            let delta = (next - current).abs();
            let scale = current.abs().max(next.abs()).max(1.0);
            current = next;
            if delta <= FIX_ABSOLUTE_TOLERANCE + FIX_RELATIVE_TOLERANCE * scale {
                break;
            }
        }

        cache.warm[spec.warm as usize] = current;
        locals[slot] = current;
        Ok(current)
    }

    /// dk/dx = f_x / (1 - f_k), both partials taken at the converged iterate.
    fn eval_fix_derivative(
        &self,
        spec: u32,
        x: f64,
        locals: &mut SmallVec<[f64; 8]>,
        cache: &mut CacheState,
    ) -> Result<f64, EvalError> {
        let spec = self.fixes[spec as usize].clone();
        let (Some(k_deriv), Some(x_deriv)) = (spec.k_deriv, spec.x_deriv) else {
            return Ok(0.0);
        };
        let fk = self.eval(k_deriv, x, locals, cache)?;
        let fx = self.eval(x_deriv, x, locals, cache)?;
        let denom = 1.0 - fk;
        if fx.is_finite() && denom.is_finite() && denom.abs() >= FIX_NEWTON_MIN_DENOM {
            Ok(fx / denom)
        } else {
            Ok(0.0)
        }
    }

    /// Left-hand finite difference of a component's value function.
    fn value_derivative(&self, comp: u32, x: f64, cache: &mut CacheState) -> Result<f64, EvalError> {
        if !x.is_finite() || x < 0.0 {
            return Ok(0.0);
        }
        let h = MIN_DERIVATIVE_STEP;
        let value_at_x = self.call_fn(comp, FnMode::Value, x, cache)?;

        if x > 0.0 {
            let lower = (x - h).max(0.0);
            if x <= lower {
                return Ok(0.0);
            }
            let value_at_lower = self.call_fn(comp, FnMode::Value, lower, cache)?;
            return Ok((value_at_x - value_at_lower) / (x - lower));
        }

        let upper = x + h;
        let value_at_upper = self.call_fn(comp, FnMode::Value, upper, cache)?;
        Ok((value_at_upper - value_at_x) / (upper - x))
    }
}

#[inline(always)]
fn truthy(value: f64) -> bool {
    value != 0.0 && !value.is_nan()
}

#[inline(always)]
fn bool_num(value: bool) -> f64 {
    if value {
        1.0
    } else {
        0.0
    }
}
