//! Lowering: parse tree → specialized IR.
//!
//! Derivatives are produced symbolically with forward-mode dual numbers: each
//! lowering step carries a (value, derivative) pair of IR nodes, with constant
//! folding and zero/one elimination so the derivative trees stay small.
//! Shapes the symbolic pass cannot differentiate degrade to numeric-derivative
//! nodes; shapes the value pass cannot express at all abort the whole build,
//! and the caller falls back to the compiled-closures evaluator.

use std::collections::HashMap;

use crate::ast::{BinOp, Bound, CmpOp, Expr, Func, RangeArm, Wrapper};
use crate::currency::CurrencyTable;
use crate::eval::{BlockStmts, Evaluator, Shared};
use crate::graph::DependencyGraph;
use crate::model::{Component, ComponentBody, ComponentId, Country, TaxModel};
use crate::plan::{self, BracketPlan};

use super::ir::{
    BandSpec, BandSpecArm, ComponentFns, FixSpec, FnBody, FnMode, Ir, IrRef, SpecializedProgram,
};

/// Any unsupported shape aborts the build; the prepared evaluator silently
/// falls back to the compiled-closures backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodegenError(pub &'static str);

type Lowered<T> = Result<T, CodegenError>;

#[derive(Clone, Copy)]
struct LocalEntry {
    value: IrRef,
    deriv: IrRef,
}

#[derive(Clone)]
struct Env {
    /// The income expression in the current context (usually `X`).
    x: IrRef,
    /// d(x)/d(differentiation variable): 1 for marginal lowering, 0 inside
    /// k-partials.
    dx: IrRef,
    locals: HashMap<String, LocalEntry>,
}

/// Per-function state: local slot allocation.
struct FnCtx {
    next_local: u16,
}

impl FnCtx {
    fn new() -> FnCtx {
        FnCtx { next_local: 0 }
    }
    fn alloc(&mut self) -> u16 {
        let slot = self.next_local;
        self.next_local += 1;
        slot
    }
}

#[derive(Clone, Copy)]
struct Dual {
    v: IrRef,
    d: IrRef,
}

pub(super) struct Builder<'m> {
    model: &'m TaxModel,
    currencies: &'m CurrencyTable,
    country: &'m Country,
    graph: DependencyGraph,
    comp_index: HashMap<ComponentId, u32>,
    arena: Vec<Ir>,
    x_ref: Option<IrRef>,
    plans: Vec<BracketPlan>,
    piece_plans: Vec<crate::plan::PieceValuePlan>,
    bands: Vec<BandSpec>,
    fixes: Vec<FixSpec>,
    bracket_plan_cache: HashMap<u32, Option<u32>>,
    piece_plan_cache: HashMap<u32, Option<u32>>,
}

impl<'m> Builder<'m> {
    pub(super) fn build(
        model: &'m TaxModel,
        currencies: &'m CurrencyTable,
        country: &'m Country,
        active: &[ComponentId],
        source_to_country: f64,
    ) -> Result<SpecializedProgram, CodegenError> {
        // Reachability pruning is only sound when every dependency resolved.
        let full_graph = DependencyGraph::for_country(model, country);
        let members: Vec<ComponentId> = if full_graph.fully_resolved {
            let reachable = full_graph.reachable_from(active);
            country
                .component_ids
                .iter()
                .enumerate()
                .filter(|(local, _)| reachable[*local])
                .map(|(_, &id)| id)
                .collect()
        } else {
            country.component_ids.clone()
        };
        if members.is_empty() {
            return Err(CodegenError("no components to specialize"));
        }

        let graph = DependencyGraph::build(model, country, &members);
        let comp_index: HashMap<ComponentId, u32> = members
            .iter()
            .enumerate()
            .map(|(index, &id)| (id, index as u32))
            .collect();

        let mut builder = Builder {
            model,
            currencies,
            country,
            graph,
            comp_index,
            arena: Vec::new(),
            x_ref: None,
            plans: Vec::new(),
            piece_plans: Vec::new(),
            bands: Vec::new(),
            fixes: Vec::new(),
            bracket_plan_cache: HashMap::new(),
            piece_plan_cache: HashMap::new(),
        };

        let mut fns = Vec::with_capacity(members.len());
        for (local, &id) in members.iter().enumerate() {
            fns.push(builder.emit_component(local as u32, id)?);
        }

        let mut active_indices = Vec::with_capacity(active.len());
        for id in active {
            let index = builder
                .comp_index
                .get(id)
                .copied()
                .ok_or(CodegenError("active component missing from program"))?;
            active_indices.push(index);
        }

        let needs_cache = (0..members.len()).any(|local| !builder.graph.can_bypass_memo(local));
        let use_cycle_guards = !builder.graph.acyclic;
        let warm_count = builder.fixes.len();

        Ok(SpecializedProgram {
            arena: builder.arena,
            plans: builder.plans,
            piece_plans: builder.piece_plans,
            bands: builder.bands,
            fixes: builder.fixes,
            fns,
            active: active_indices,
            source_to_country,
            use_cycle_guards,
            needs_cache,
            cache: std::cell::RefCell::new(super::ir::CacheState::new(members.len(), warm_count)),
        })
    }

    // --- Arena helpers with constant folding ---

    fn push(&mut self, node: Ir) -> IrRef {
        self.arena.push(node);
        IrRef((self.arena.len() - 1) as u32)
    }

    fn c(&mut self, value: f64) -> IrRef {
        self.push(Ir::Const(value))
    }

    fn x(&mut self) -> IrRef {
        if let Some(x) = self.x_ref {
            return x;
        }
        let x = self.push(Ir::X);
        self.x_ref = Some(x);
        x
    }

    fn const_of(&self, node: IrRef) -> Option<f64> {
        match self.arena[node.index()] {
            Ir::Const(value) => Some(value),
            _ => None,
        }
    }

    fn is_zero(&self, node: IrRef) -> bool {
        matches!(self.const_of(node), Some(value) if value == 0.0)
    }

    fn is_one(&self, node: IrRef) -> bool {
        matches!(self.const_of(node), Some(value) if value == 1.0)
    }

    fn add(&mut self, a: IrRef, b: IrRef) -> IrRef {
        if self.is_zero(a) {
            return b;
        }
        if self.is_zero(b) {
            return a;
        }
        if let (Some(x), Some(y)) = (self.const_of(a), self.const_of(b)) {
            return self.c(x + y);
        }
        self.push(Ir::Add(a, b))
    }

    fn sub(&mut self, a: IrRef, b: IrRef) -> IrRef {
        if self.is_zero(b) {
            return a;
        }
        if self.is_zero(a) {
            return self.neg(b);
        }
        if let (Some(x), Some(y)) = (self.const_of(a), self.const_of(b)) {
            return self.c(x - y);
        }
        self.push(Ir::Sub(a, b))
    }

    fn mul(&mut self, a: IrRef, b: IrRef) -> IrRef {
        if self.is_zero(a) || self.is_zero(b) {
            return self.c(0.0);
        }
        if self.is_one(a) {
            return b;
        }
        if self.is_one(b) {
            return a;
        }
        if let (Some(x), Some(y)) = (self.const_of(a), self.const_of(b)) {
            return self.c(x * y);
        }
        self.push(Ir::Mul(a, b))
    }

    fn div(&mut self, a: IrRef, b: IrRef) -> IrRef {
        if self.is_zero(a) {
            return self.c(0.0);
        }
        if self.is_one(b) {
            return a;
        }
        if let (Some(x), Some(y)) = (self.const_of(a), self.const_of(b)) {
            return self.c(x / y);
        }
        self.push(Ir::Div(a, b))
    }

    fn neg(&mut self, a: IrRef) -> IrRef {
        if let Some(value) = self.const_of(a) {
            return self.c(-value);
        }
        self.push(Ir::Neg(a))
    }

    fn pow(&mut self, a: IrRef, b: IrRef) -> IrRef {
        if let Some(exp) = self.const_of(b) {
            if exp == 0.0 {
                return self.c(1.0);
            }
            if exp == 1.0 {
                return a;
            }
        }
        if let (Some(base), Some(exp)) = (self.const_of(a), self.const_of(b)) {
            return self.c(base.powf(exp));
        }
        self.push(Ir::Pow(a, b))
    }

    fn select(&mut self, cond: IrRef, then: IrRef, other: IrRef) -> IrRef {
        if let Some(value) = self.const_of(cond) {
            return if value != 0.0 { then } else { other };
        }
        self.push(Ir::Select { cond, then, other })
    }

    // --- Program plan tables ---

    fn bracket_plan_index(&mut self, local: u32, id: ComponentId) -> Option<u32> {
        if let Some(&cached) = self.bracket_plan_cache.get(&local) {
            return cached;
        }
        let entry = self.model.plans(id).bracket.as_ref().map(|plan| {
            self.plans.push(plan.clone());
            (self.plans.len() - 1) as u32
        });
        self.bracket_plan_cache.insert(local, entry);
        entry
    }

    fn piece_plan_index(&mut self, local: u32, id: ComponentId) -> Option<u32> {
        if let Some(&cached) = self.piece_plan_cache.get(&local) {
            return cached;
        }
        let entry = self.model.plans(id).piece.as_ref().map(|plan| {
            self.piece_plans.push(plan.clone());
            (self.piece_plans.len() - 1) as u32
        });
        self.piece_plan_cache.insert(local, entry);
        entry
    }

    // --- Component function emission ---

    fn emit_component(&mut self, local: u32, id: ComponentId) -> Lowered<ComponentFns> {
        let component = self.model.component(id);
        let label = self.model.component_label(id);

        let value = self.emit_value_fn(local, id, component)?;
        let marginal = self.emit_marginal_fn(local, id, component)?;
        let total = self.emit_total_fn(local, component);
        let bypass_memo = self.graph.can_bypass_memo(local as usize);

        Ok(ComponentFns {
            value,
            marginal,
            total,
            bypass_memo,
            label,
        })
    }

    fn emit_value_fn(
        &mut self,
        local: u32,
        id: ComponentId,
        component: &Component,
    ) -> Lowered<FnBody> {
        match &component.body {
            ComponentBody::Number(value) => {
                let ret = self.c(*value);
                Ok(FnBody {
                    stmts: vec![],
                    ret,
                    locals: 0,
                })
            }
            ComponentBody::Expr(expr) => {
                let mut ctx = FnCtx::new();
                let x = self.x();
                let one = self.c(1.0);
                let env = Env {
                    x,
                    dx: one,
                    locals: HashMap::new(),
                };
                let ret = self.lower_value(expr, &env, &mut ctx)?;
                Ok(FnBody {
                    stmts: vec![],
                    ret,
                    locals: ctx.next_local,
                })
            }
            ComponentBody::Block(block) => {
                if let Some(body) = self.closed_bracket_body(component)? {
                    return Ok(body);
                }
                if let Some(plan) = self.piece_plan_index(local, id) {
                    let x = self.x();
                    let ret = self.push(Ir::PieceValue { plan, income: x });
                    return Ok(FnBody {
                        stmts: vec![],
                        ret,
                        locals: 0,
                    });
                }

                let mut ctx = FnCtx::new();
                let x = self.x();
                let one = self.c(1.0);
                let mut env = Env {
                    x,
                    dx: one,
                    locals: HashMap::new(),
                };
                let mut stmts = Vec::with_capacity(block.stmts.len());

                for stmt in &block.stmts {
                    let zero = self.c(0.0);
                    if let Expr::Fix { init, update } = &stmt.value {
                        let (spec, k_slot) =
                            self.lower_fix(init, update, &env, &mut ctx, false)?;
                        stmts.push((k_slot, self.push(Ir::Fix { spec })));
                        env.locals.insert(
                            stmt.name.clone(),
                            LocalEntry {
                                value: self.push(Ir::Local(k_slot)),
                                deriv: zero,
                            },
                        );
                        continue;
                    }
                    let value = self.lower_value(&stmt.value, &env, &mut ctx)?;
                    let slot = ctx.alloc();
                    stmts.push((slot, value));
                    env.locals.insert(
                        stmt.name.clone(),
                        LocalEntry {
                            value: self.push(Ir::Local(slot)),
                            deriv: zero,
                        },
                    );
                }

                let ret = self.lower_value(&block.result, &env, &mut ctx)?;
                Ok(FnBody {
                    stmts,
                    ret,
                    locals: ctx.next_local,
                })
            }
        }
    }

    fn emit_marginal_fn(
        &mut self,
        local: u32,
        id: ComponentId,
        component: &Component,
    ) -> Lowered<FnBody> {
        if component.wrapper == Wrapper::Literal {
            let ret = self.c(0.0);
            return Ok(FnBody {
                stmts: vec![],
                ret,
                locals: 0,
            });
        }

        if let Some(plan) = self.bracket_plan_index(local, id) {
            let x = self.x();
            let ret = self.push(Ir::BracketMarginal { plan, income: x });
            return Ok(FnBody {
                stmts: vec![],
                ret,
                locals: 0,
            });
        }
        if let Some(plan) = self.piece_plan_index(local, id) {
            let x = self.x();
            let ret = self.push(Ir::PieceMarginal { plan, income: x });
            return Ok(FnBody {
                stmts: vec![],
                ret,
                locals: 0,
            });
        }
        if matches!(component.body, ComponentBody::Number(_)) {
            let ret = self.c(0.0);
            return Ok(FnBody {
                stmts: vec![],
                ret,
                locals: 0,
            });
        }

        if let Some(body) = self.emit_symbolic_marginal(component) {
            return Ok(body);
        }

        // Last resort: finite difference against the value function.
        let x = self.x();
        let ret = self.push(Ir::DerivativeOfValue {
            comp: local,
            income: x,
        });
        Ok(FnBody {
            stmts: vec![],
            ret,
            locals: 0,
        })
    }

    fn emit_total_fn(&mut self, local: u32, component: &Component) -> FnBody {
        // Total is the value function behind the non-positive-income guard;
        // the call picks up the value cache for free.
        let _ = component;
        let x = self.x();
        let zero = self.c(0.0);
        let cond = self.push(Ir::Cmp(CmpOp::Le, x, zero));
        let call = self.push(Ir::Call {
            comp: local,
            mode: FnMode::Value,
            income: x,
        });
        let ret = self.select(cond, zero, call);
        FnBody {
            stmts: vec![],
            ret,
            locals: 0,
        }
    }

    /// Symbolic marginal of a `Total` wrapper body. `None` means some shape
    /// (a schedule, an expression-position fix) resists differentiation.
    fn emit_symbolic_marginal(&mut self, component: &Component) -> Option<FnBody> {
        let mut ctx = FnCtx::new();
        let x = self.x();
        let one = self.c(1.0);
        let zero = self.c(0.0);
        let mut env = Env {
            x,
            dx: one,
            locals: HashMap::new(),
        };

        match &component.body {
            ComponentBody::Number(_) => Some(FnBody {
                stmts: vec![],
                ret: zero,
                locals: 0,
            }),
            ComponentBody::Expr(expr) => {
                let dual = self.lower_dual(expr, &env, &mut ctx)?;
                Some(FnBody {
                    stmts: vec![],
                    ret: dual.d,
                    locals: ctx.next_local,
                })
            }
            ComponentBody::Block(block) => {
                let mut stmts = Vec::new();

                for stmt in &block.stmts {
                    if let Expr::Fix { init, update } = &stmt.value {
                        let (spec, k_slot) =
                            self.lower_fix(init, update, &env, &mut ctx, true).ok()?;
                        // Both partials are required for the implicit rule.
                        let fix = &self.fixes[spec as usize];
                        if fix.k_deriv.is_none() || fix.x_deriv.is_none() {
                            return None;
                        }
                        stmts.push((k_slot, self.push(Ir::Fix { spec })));
                        let d_slot = ctx.alloc();
                        stmts.push((d_slot, self.push(Ir::FixDerivative { spec })));
                        env.locals.insert(
                            stmt.name.clone(),
                            LocalEntry {
                                value: self.push(Ir::Local(k_slot)),
                                deriv: self.push(Ir::Local(d_slot)),
                            },
                        );
                        continue;
                    }

                    let dual = self.lower_dual(&stmt.value, &env, &mut ctx)?;
                    let v_slot = ctx.alloc();
                    stmts.push((v_slot, dual.v));
                    let deriv = if self.is_zero(dual.d) {
                        zero
                    } else {
                        let d_slot = ctx.alloc();
                        stmts.push((d_slot, dual.d));
                        self.push(Ir::Local(d_slot))
                    };
                    env.locals.insert(
                        stmt.name.clone(),
                        LocalEntry {
                            value: self.push(Ir::Local(v_slot)),
                            deriv,
                        },
                    );
                }

                let dual = self.lower_dual(&block.result, &env, &mut ctx)?;
                Some(FnBody {
                    stmts,
                    ret: dual.d,
                    locals: ctx.next_local,
                })
            }
        }
    }

    /// Closed-form body: block statements followed by a bracket schedule with
    /// literal arms. `bracketsTaxable` qualifies when the allowance can be
    /// evaluated at each literal bound by the reference evaluator.
    fn closed_bracket_body(&mut self, component: &Component) -> Lowered<Option<FnBody>> {
        let ComponentBody::Block(block) = &component.body else {
            return Ok(None);
        };

        let mut ctx = FnCtx::new();
        let x = self.x();
        let one = self.c(1.0);
        let mut env = Env {
            x,
            dx: one,
            locals: HashMap::new(),
        };
        let mut stmts = Vec::with_capacity(block.stmts.len());

        for stmt in &block.stmts {
            if matches!(stmt.value, Expr::Fix { .. }) {
                return Ok(None);
            }
            let Ok(value) = self.lower_value(&stmt.value, &env, &mut ctx) else {
                return Ok(None);
            };
            let slot = ctx.alloc();
            stmts.push((slot, value));
            let zero = self.c(0.0);
            env.locals.insert(
                stmt.name.clone(),
                LocalEntry {
                    value: self.push(Ir::Local(slot)),
                    deriv: zero,
                },
            );
        }

        let (selector, literal_arms) = match &block.result {
            Expr::Brackets { selector, arms } => {
                let Some(literal) = literal_arm_list(arms) else {
                    return Ok(None);
                };
                let Ok(selector) = self.lower_value(selector, &env, &mut ctx) else {
                    return Ok(None);
                };
                (selector, literal)
            }
            Expr::BracketsTaxable {
                income,
                allowance,
                allowance_base,
                arms,
            } => {
                let Some(base) = plan::literal_number(allowance_base) else {
                    return Ok(None);
                };
                let cap = base.max(0.0);
                let Some(raw) = literal_arm_list(arms) else {
                    return Ok(None);
                };

                // Shift every literal bound down by the allowance evaluated
                // at that bound's gross income, using the tree-walk oracle.
                let mut adjusted = Vec::with_capacity(raw.len());
                for (lower, upper, rate) in raw {
                    let Some(lower_allowance) =
                        self.allowance_at_bound(component, allowance, block, lower, cap)
                    else {
                        return Ok(None);
                    };
                    let upper_adjusted = if upper == f64::INFINITY {
                        f64::INFINITY
                    } else {
                        let Some(upper_allowance) =
                            self.allowance_at_bound(component, allowance, block, upper, cap)
                        else {
                            return Ok(None);
                        };
                        upper - upper_allowance
                    };
                    adjusted.push((lower - lower_allowance, upper_adjusted, rate));
                }

                let Ok(income_ir) = self.lower_value(income, &env, &mut ctx) else {
                    return Ok(None);
                };
                let Ok(allowance_ir) = self.lower_value(allowance, &env, &mut ctx) else {
                    return Ok(None);
                };
                let zero = self.c(0.0);
                let taxable = self.sub(income_ir, allowance_ir);
                let selector = self.push(Ir::Max(zero, taxable));
                (selector, adjusted)
            }
            _ => return Ok(None),
        };

        let Some(plan) = plan::finalize_bracket_arms(&literal_arms) else {
            return Ok(None);
        };
        self.plans.push(plan);
        let plan_index = (self.plans.len() - 1) as u32;
        let ret = self.push(Ir::BracketTotal {
            plan: plan_index,
            selector,
        });

        Ok(Some(FnBody {
            stmts,
            ret,
            locals: ctx.next_local,
        }))
    }

    /// Evaluates a tapering allowance at a literal band bound through the
    /// reference evaluator, with the component's block locals recomputed at
    /// that income. `None` when evaluation fails, which disqualifies the
    /// closed form.
    fn allowance_at_bound(
        &self,
        component: &Component,
        allowance: &Expr,
        block: &std::rc::Rc<crate::ast::Block>,
        gross: f64,
        cap: f64,
    ) -> Option<f64> {
        if !gross.is_finite() {
            return None;
        }
        let evaluator = Evaluator::new(self.model, self.currencies);
        let mut shared = Shared::new();
        let mut frame = evaluator.frame_for(component.country, gross);
        frame.block_stmts = Some(BlockStmts::Ast(std::rc::Rc::clone(block)));
        let bound_frame = evaluator
            .frame_with_recomputed_locals(&frame, gross, &mut shared)
            .ok()?;
        let raw = evaluator
            .eval_expr(allowance, &bound_frame, &mut shared)
            .ok()?
            .to_number(0.0);
        if !raw.is_finite() {
            return None;
        }
        Some(raw.max(0.0).min(cap))
    }

    // --- Fixed points ---

    /// Lowers `fix(init, update)` to a loop spec. `with_x_deriv` additionally
    /// requests the partial in x for the implicit-function derivative.
    fn lower_fix(
        &mut self,
        init: &Expr,
        update: &Expr,
        env: &Env,
        ctx: &mut FnCtx,
        with_x_deriv: bool,
    ) -> Lowered<(u32, u16)> {
        let init_ir = self.lower_value(init, env, ctx)?;
        let k_slot = ctx.alloc();
        let k_value = self.push(Ir::Local(k_slot));
        let zero = self.c(0.0);
        let one = self.c(1.0);

        let mut update_env = env.clone();
        update_env.locals.insert(
            "k".to_string(),
            LocalEntry {
                value: k_value,
                deriv: zero,
            },
        );
        let update_ir = self.lower_value(update, &update_env, ctx)?;

        // Partial in k (for Newton): k has derivative 1, x is held constant.
        let k_deriv = {
            let mut k_env = env.clone();
            k_env.dx = zero;
            k_env.locals.insert(
                "k".to_string(),
                LocalEntry {
                    value: k_value,
                    deriv: one,
                },
            );
            self.lower_dual(update, &k_env, ctx).map(|dual| dual.d)
        };

        let x_deriv = if with_x_deriv {
            let mut x_env = env.clone();
            x_env.locals.insert(
                "k".to_string(),
                LocalEntry {
                    value: k_value,
                    deriv: zero,
                },
            );
            self.lower_dual(update, &x_env, ctx).map(|dual| dual.d)
        } else {
            None
        };

        let warm = self.fixes.len() as u32;
        self.fixes.push(FixSpec {
            k_slot,
            init: init_ir,
            update: update_ir,
            k_deriv,
            x_deriv,
            warm,
        });
        Ok(((self.fixes.len() - 1) as u32, k_slot))
    }

    // --- Value lowering ---

    fn lower_value(&mut self, expr: &Expr, env: &Env, ctx: &mut FnCtx) -> Lowered<IrRef> {
        match expr {
            Expr::Number(value) => Ok(self.c(*value)),
            Expr::Infinity => Ok(self.c(f64::INFINITY)),
            Expr::Bool(value) => Ok(self.c(if *value { 1.0 } else { 0.0 })),
            Expr::Str(_) => Err(CodegenError("string literal in numeric context")),
            Expr::Ident(name) => {
                if let Some(entry) = env.locals.get(name) {
                    return Ok(entry.value);
                }
                if name == "x" {
                    return Ok(env.x);
                }
                Err(CodegenError("unknown identifier"))
            }
            Expr::Neg(inner) => {
                let value = self.lower_value(inner, env, ctx)?;
                Ok(self.neg(value))
            }
            Expr::Binary { op, lhs, rhs } => {
                let left = self.lower_value(lhs, env, ctx)?;
                let right = self.lower_value(rhs, env, ctx)?;
                Ok(match op {
                    BinOp::Add => self.add(left, right),
                    BinOp::Sub => self.sub(left, right),
                    BinOp::Mul => self.mul(left, right),
                    BinOp::Div => self.div(left, right),
                    BinOp::Pow => self.pow(left, right),
                })
            }
            Expr::Compare { op, lhs, rhs } => {
                let left = self.lower_value(lhs, env, ctx)?;
                let right = self.lower_value(rhs, env, ctx)?;
                Ok(self.push(Ir::Cmp(*op, left, right)))
            }
            Expr::And(terms) => {
                let mut result: Option<IrRef> = None;
                for term in terms {
                    let lowered = self.lower_value(term, env, ctx)?;
                    result = Some(match result {
                        Some(acc) => self.push(Ir::And(acc, lowered)),
                        None => lowered,
                    });
                }
                Ok(result.unwrap_or_else(|| self.c(1.0)))
            }
            Expr::Or(terms) => {
                let mut result: Option<IrRef> = None;
                for term in terms {
                    let lowered = self.lower_value(term, env, ctx)?;
                    result = Some(match result {
                        Some(acc) => self.push(Ir::Or(acc, lowered)),
                        None => lowered,
                    });
                }
                Ok(result.unwrap_or_else(|| self.c(0.0)))
            }
            Expr::Not(inner) => {
                let value = self.lower_value(inner, env, ctx)?;
                Ok(self.push(Ir::Not(value)))
            }
            Expr::Ref(path) => {
                let (local, id) = self.resolve_member(path)?;
                Ok(self.total_call(local, id, env.x))
            }
            Expr::Eval { target, income } => {
                let (local, id) = self.resolve_member(target)?;
                let income_ir = self.lower_value(income, env, ctx)?;
                Ok(self.value_call(local, id, income_ir))
            }
            Expr::Fix { init, update } => {
                let (spec, _) = self.lower_fix(init, update, env, ctx, false)?;
                Ok(self.push(Ir::Fix { spec }))
            }
            Expr::Call { func, args } => self.lower_call(*func, args, env, ctx),
            Expr::Piece { arms, default } => {
                let mut result = match default {
                    Some(expr) => self.lower_value(expr, env, ctx)?,
                    None => self.c(0.0),
                };
                for arm in arms.iter().rev() {
                    let cond = self.lower_value(&arm.condition, env, ctx)?;
                    let value = self.lower_value(&arm.value, env, ctx)?;
                    result = self.select(cond, value, result);
                }
                Ok(result)
            }
            Expr::Brackets { selector, arms } => {
                let selector_ir = self.lower_value(selector, env, ctx)?;
                if let Some(literal) = literal_arm_list(arms) {
                    if let Some(plan) = plan::finalize_bracket_arms(&literal) {
                        self.plans.push(plan);
                        let plan_index = (self.plans.len() - 1) as u32;
                        return Ok(self.push(Ir::BracketTotal {
                            plan: plan_index,
                            selector: selector_ir,
                        }));
                    }
                }
                let spec = self.lower_band_spec(arms, env, ctx, None)?;
                Ok(self.push(Ir::Bands {
                    spec,
                    selector: selector_ir,
                }))
            }
            Expr::BracketsTaxable {
                income,
                allowance,
                allowance_base,
                arms,
            } => {
                // Generic fallback: the selector nets out the allowance and
                // every bound shifts down by the allowance base.
                let income_ir = self.lower_value(income, env, ctx)?;
                let allowance_ir = self.lower_value(allowance, env, ctx)?;
                let base_ir = self.lower_value(allowance_base, env, ctx)?;
                let zero = self.c(0.0);
                let taxable = self.sub(income_ir, allowance_ir);
                let selector = self.push(Ir::Max(zero, taxable));
                let spec = self.lower_band_spec(arms, env, ctx, Some(base_ir))?;
                Ok(self.push(Ir::Bands { spec, selector }))
            }
        }
    }

    fn lower_band_spec(
        &mut self,
        arms: &[RangeArm],
        env: &Env,
        ctx: &mut FnCtx,
        bound_shift: Option<IrRef>,
    ) -> Lowered<u32> {
        let x = self.x();
        let rate_env = Env {
            x,
            dx: self.c(0.0),
            locals: env.locals.clone(),
        };

        let mut spec_arms = Vec::with_capacity(arms.len());
        for arm in arms {
            let mut lower = self.lower_bound(&arm.lower, env, ctx)?;
            let mut upper = self.lower_bound(&arm.upper, env, ctx)?;
            if let Some(shift) = bound_shift {
                lower = self.sub(lower, shift);
                upper = self.sub(upper, shift);
            }
            let rate = self.lower_value(&arm.rate, &rate_env, ctx)?;
            spec_arms.push(BandSpecArm { lower, upper, rate });
        }
        self.bands.push(BandSpec { arms: spec_arms });
        Ok((self.bands.len() - 1) as u32)
    }

    fn lower_bound(&mut self, bound: &Bound, env: &Env, ctx: &mut FnCtx) -> Lowered<IrRef> {
        match bound {
            Bound::Unbounded => Ok(self.c(f64::INFINITY)),
            Bound::Finite(expr) => self.lower_value(expr, env, ctx),
        }
    }

    fn lower_call(
        &mut self,
        func: Func,
        args: &[Expr],
        env: &Env,
        ctx: &mut FnCtx,
    ) -> Lowered<IrRef> {
        let mut lowered = Vec::with_capacity(args.len());
        for arg in args {
            lowered.push(self.lower_value(arg, env, ctx)?);
        }

        Ok(match func {
            Func::Min => {
                if lowered.is_empty() {
                    self.c(f64::INFINITY)
                } else {
                    let mut current = lowered[0];
                    for &next in &lowered[1..] {
                        current = self.push(Ir::Min(current, next));
                    }
                    current
                }
            }
            Func::Max => {
                if lowered.is_empty() {
                    self.c(f64::NEG_INFINITY)
                } else {
                    let mut current = lowered[0];
                    for &next in &lowered[1..] {
                        current = self.push(Ir::Max(current, next));
                    }
                    current
                }
            }
            Func::Abs => {
                let arg = self.arg_at(&lowered, 0);
                self.push(Ir::Abs(arg))
            }
            Func::Pow => {
                let base = self.arg_at(&lowered, 0);
                let exp = self.arg_at(&lowered, 1);
                self.pow(base, exp)
            }
            Func::Sqrt => {
                let arg = self.arg_at(&lowered, 0);
                self.push(Ir::Sqrt(arg))
            }
            Func::Log => {
                let arg = self.arg_at(&lowered, 0);
                self.push(Ir::Log(arg))
            }
            Func::Exp => {
                let arg = self.arg_at(&lowered, 0);
                self.push(Ir::Exp(arg))
            }
            Func::Floor | Func::Ceil | Func::Round => {
                let value = self.arg_at(&lowered, 0);
                let step = match lowered.get(1).copied() {
                    Some(step) => step,
                    None => self.c(1.0),
                };
                match func {
                    Func::Floor => self.push(Ir::FloorStep(value, step)),
                    Func::Ceil => self.push(Ir::CeilStep(value, step)),
                    _ => self.push(Ir::RoundStep(value, step)),
                }
            }
            Func::Sum => {
                let mut result = self.c(0.0);
                for index in 0..lowered.len() {
                    let term = lowered[index];
                    result = self.add(result, term);
                }
                result
            }
            Func::If => {
                if lowered.len() < 2 {
                    return Ok(self.c(0.0));
                }
                let cond = lowered[0];
                let then = lowered[1];
                let other = match lowered.get(2).copied() {
                    Some(other) => other,
                    None => self.c(0.0),
                };
                self.select(cond, then, other)
            }
            Func::Pos => {
                let zero = self.c(0.0);
                let arg = self.arg_at(&lowered, 0);
                self.push(Ir::Max(zero, arg))
            }
        })
    }

    fn arg_at(&mut self, lowered: &[IrRef], index: usize) -> IrRef {
        match lowered.get(index).copied() {
            Some(ir) => ir,
            None => self.c(0.0),
        }
    }

    fn zero_dual(&mut self) -> Dual {
        let v = self.c(0.0);
        let d = self.c(0.0);
        Dual { v, d }
    }

    // --- Component calls and inlining ---

    fn resolve_member(&mut self, path: &crate::ast::RefPath) -> Lowered<(u32, ComponentId)> {
        let id = self
            .model
            .resolve_reference(self.country.id, path)
            .map_err(|_| CodegenError("unresolved reference"))?;
        let component = self.model.component(id);
        if component.country != self.country.id {
            // The program spans one country; a cross-border call reverts the
            // whole context to the closure backend.
            return Err(CodegenError("cross-country reference"));
        }
        let local = self
            .comp_index
            .get(&id)
            .copied()
            .ok_or(CodegenError("reference outside program"))?;
        Ok((local, id))
    }

    /// Total of a referenced component: leaves inline to their closed form
    /// (behind the non-positive-income guard), everything else calls.
    fn total_call(&mut self, local: u32, id: ComponentId, income: IrRef) -> IrRef {
        if let Some(plan) = self.bracket_plan_index(local, id) {
            return self.push(Ir::BracketTotal {
                plan,
                selector: income,
            });
        }
        if let Some(plan) = self.piece_plan_index(local, id) {
            let zero = self.c(0.0);
            let cond = self.push(Ir::Cmp(CmpOp::Le, income, zero));
            let value = self.push(Ir::PieceValue { plan, income });
            return self.select(cond, zero, value);
        }
        if let ComponentBody::Number(value) = &self.model.component(id).body {
            let value = *value;
            let zero = self.c(0.0);
            let cond = self.push(Ir::Cmp(CmpOp::Le, income, zero));
            let constant = self.c(value);
            return self.select(cond, zero, constant);
        }
        self.push(Ir::Call {
            comp: local,
            mode: FnMode::Total,
            income,
        })
    }

    fn value_call(&mut self, local: u32, id: ComponentId, income: IrRef) -> IrRef {
        if let Some(plan) = self.bracket_plan_index(local, id) {
            return self.push(Ir::BracketTotal {
                plan,
                selector: income,
            });
        }
        if let Some(plan) = self.piece_plan_index(local, id) {
            return self.push(Ir::PieceValue { plan, income });
        }
        if let ComponentBody::Number(value) = &self.model.component(id).body {
            let value = *value;
            return self.c(value);
        }
        self.push(Ir::Call {
            comp: local,
            mode: FnMode::Value,
            income,
        })
    }

    fn marginal_call(&mut self, local: u32, id: ComponentId, income: IrRef) -> IrRef {
        let component = self.model.component(id);
        if component.wrapper == Wrapper::Literal {
            return self.c(0.0);
        }
        if let Some(plan) = self.bracket_plan_index(local, id) {
            return self.push(Ir::BracketMarginal { plan, income });
        }
        if let Some(plan) = self.piece_plan_index(local, id) {
            return self.push(Ir::PieceMarginal { plan, income });
        }
        if matches!(component.body, ComponentBody::Number(_)) {
            return self.c(0.0);
        }
        self.push(Ir::Call {
            comp: local,
            mode: FnMode::Marginal,
            income,
        })
    }

    // --- Dual lowering (forward-mode symbolic differentiation) ---

    fn lower_dual(&mut self, expr: &Expr, env: &Env, ctx: &mut FnCtx) -> Option<Dual> {
        match expr {
            Expr::Number(value) => {
                let v = self.c(*value);
                let d = self.c(0.0);
                Some(Dual { v, d })
            }
            Expr::Infinity => {
                let v = self.c(f64::INFINITY);
                let d = self.c(0.0);
                Some(Dual { v, d })
            }
            Expr::Bool(value) => {
                let v = self.c(if *value { 1.0 } else { 0.0 });
                let d = self.c(0.0);
                Some(Dual { v, d })
            }
            Expr::Str(_) => None,
            Expr::Ident(name) => {
                if let Some(entry) = env.locals.get(name) {
                    return Some(Dual {
                        v: entry.value,
                        d: entry.deriv,
                    });
                }
                if name == "x" {
                    return Some(Dual { v: env.x, d: env.dx });
                }
                None
            }
            Expr::Neg(inner) => {
                let nested = self.lower_dual(inner, env, ctx)?;
                Some(Dual {
                    v: self.neg(nested.v),
                    d: self.neg(nested.d),
                })
            }
            Expr::Binary { op, lhs, rhs } => {
                let left = self.lower_dual(lhs, env, ctx)?;
                let right = self.lower_dual(rhs, env, ctx)?;
                Some(match op {
                    BinOp::Add => Dual {
                        v: self.add(left.v, right.v),
                        d: self.add(left.d, right.d),
                    },
                    BinOp::Sub => Dual {
                        v: self.sub(left.v, right.v),
                        d: self.sub(left.d, right.d),
                    },
                    BinOp::Mul => self.dual_mul(left, right),
                    BinOp::Div => self.dual_div(left, right),
                    BinOp::Pow => self.dual_pow(left, right),
                })
            }
            // Comparisons and boolean operators carry no derivative.
            Expr::Compare { .. } | Expr::And(_) | Expr::Or(_) | Expr::Not(_) => {
                let v = self.lower_value(expr, env, ctx).ok()?;
                let d = self.c(0.0);
                Some(Dual { v, d })
            }
            Expr::Ref(path) => {
                let (local, id) = self.resolve_member(path).ok()?;
                let v = self.total_call(local, id, env.x);
                let marginal = self.marginal_call(local, id, env.x);
                // Chain rule through the income binding.
                let d = self.mul(marginal, env.dx);
                Some(Dual { v, d })
            }
            Expr::Eval { target, income } => {
                let (local, id) = self.resolve_member(target).ok()?;
                let income_dual = self.lower_dual(income, env, ctx)?;
                let v = self.value_call(local, id, income_dual.v);
                let marginal = self.marginal_call(local, id, income_dual.v);
                let d = self.mul(marginal, income_dual.d);
                Some(Dual { v, d })
            }
            // Only statement-position fixed points differentiate (via the
            // implicit-function rule); an inline one falls back.
            Expr::Fix { .. } => None,
            Expr::Call { func, args } => self.lower_dual_call(*func, args, env, ctx),
            Expr::Piece { arms, default } => {
                let mut value;
                let mut deriv;
                match default {
                    Some(expr) => {
                        let dual = self.lower_dual(expr, env, ctx)?;
                        value = dual.v;
                        deriv = dual.d;
                    }
                    None => {
                        value = self.c(0.0);
                        deriv = self.c(0.0);
                    }
                }
                for arm in arms.iter().rev() {
                    let cond = self.lower_value(&arm.condition, env, ctx).ok()?;
                    let arm_dual = self.lower_dual(&arm.value, env, ctx)?;
                    value = self.select(cond, arm_dual.v, value);
                    deriv = self.select(cond, arm_dual.d, deriv);
                }
                Some(Dual { v: value, d: deriv })
            }
            Expr::Brackets { .. } | Expr::BracketsTaxable { .. } => None,
        }
    }

    fn lower_dual_call(
        &mut self,
        func: Func,
        args: &[Expr],
        env: &Env,
        ctx: &mut FnCtx,
    ) -> Option<Dual> {
        let mut duals = Vec::with_capacity(args.len());
        for arg in args {
            duals.push(self.lower_dual(arg, env, ctx)?);
        }

        Some(match func {
            Func::Min | Func::Max => {
                let mut iter = duals.into_iter();
                let mut current = match iter.next() {
                    Some(first) => first,
                    None => self.zero_dual(),
                };
                for right in iter {
                    let (cmp, value) = if func == Func::Min {
                        (
                            self.push(Ir::Cmp(CmpOp::Le, current.v, right.v)),
                            self.push(Ir::Min(current.v, right.v)),
                        )
                    } else {
                        (
                            self.push(Ir::Cmp(CmpOp::Ge, current.v, right.v)),
                            self.push(Ir::Max(current.v, right.v)),
                        )
                    };
                    let deriv = self.select(cmp, current.d, right.d);
                    current = Dual { v: value, d: deriv };
                }
                current
            }
            Func::Abs => {
                let arg = duals.first().copied().unwrap_or_else(|| self.zero_dual());
                let zero = self.c(0.0);
                let cond = self.push(Ir::Cmp(CmpOp::Ge, arg.v, zero));
                let neg_d = self.neg(arg.d);
                let v = self.push(Ir::Abs(arg.v));
                let d = self.select(cond, arg.d, neg_d);
                Dual { v, d }
            }
            Func::Pow => {
                let base = duals.first().copied().unwrap_or_else(|| self.zero_dual());
                let exp = duals.get(1).copied().unwrap_or_else(|| self.zero_dual());
                self.dual_pow(base, exp)
            }
            Func::Sqrt => {
                let arg = duals.first().copied().unwrap_or_else(|| self.zero_dual());
                let v = self.push(Ir::Sqrt(arg.v));
                let two = self.c(2.0);
                let denom = self.mul(two, v);
                let d = self.div(arg.d, denom);
                Dual { v, d }
            }
            Func::Log => {
                let arg = duals.first().copied().unwrap_or_else(|| self.zero_dual());
                let v = self.push(Ir::Log(arg.v));
                let d = self.div(arg.d, arg.v);
                Dual { v, d }
            }
            Func::Exp => {
                let arg = duals.first().copied().unwrap_or_else(|| self.zero_dual());
                let v = self.push(Ir::Exp(arg.v));
                let d = self.mul(v, arg.d);
                Dual { v, d }
            }
            Func::Floor | Func::Ceil | Func::Round => {
                // Step functions: zero derivative almost everywhere.
                let v = self.lower_call(func, args, env, ctx).ok()?;
                let d = self.c(0.0);
                Dual { v, d }
            }
            Func::Sum => {
                let mut current = self.zero_dual();
                for dual in duals {
                    current = Dual {
                        v: self.add(current.v, dual.v),
                        d: self.add(current.d, dual.d),
                    };
                }
                current
            }
            Func::If => {
                if args.len() < 2 {
                    return Some(self.zero_dual());
                }
                let cond = self.lower_value(&args[0], env, ctx).ok()?;
                let then = duals[1];
                let other = duals.get(2).copied().unwrap_or_else(|| self.zero_dual());
                Dual {
                    v: self.select(cond, then.v, other.v),
                    d: self.select(cond, then.d, other.d),
                }
            }
            Func::Pos => {
                let arg = duals.first().copied().unwrap_or_else(|| self.zero_dual());
                let zero = self.c(0.0);
                let cond = self.push(Ir::Cmp(CmpOp::Gt, arg.v, zero));
                let v = self.push(Ir::Max(zero, arg.v));
                let d = self.select(cond, arg.d, zero);
                Dual { v, d }
            }
        })
    }

    fn dual_mul(&mut self, left: Dual, right: Dual) -> Dual {
        let v = self.mul(left.v, right.v);
        let term_a = self.mul(left.d, right.v);
        let term_b = self.mul(left.v, right.d);
        let d = self.add(term_a, term_b);
        Dual { v, d }
    }

    fn dual_div(&mut self, left: Dual, right: Dual) -> Dual {
        let v = self.div(left.v, right.v);
        if self.is_zero(right.d) {
            let d = self.div(left.d, right.v);
            return Dual { v, d };
        }
        let num_a = self.mul(left.d, right.v);
        let num_b = self.mul(left.v, right.d);
        let numerator = self.sub(num_a, num_b);
        let denominator = self.mul(right.v, right.v);
        let d = self.div(numerator, denominator);
        Dual { v, d }
    }

    fn dual_pow(&mut self, left: Dual, right: Dual) -> Dual {
        let v = self.pow(left.v, right.v);
        if self.is_zero(left.d) && self.is_zero(right.d) {
            let d = self.c(0.0);
            return Dual { v, d };
        }
        // d(l^r) = l^r · (r'·ln l + r·l'/l)
        let log_term = if self.is_zero(right.d) {
            self.c(0.0)
        } else {
            let ln = self.push(Ir::Log(left.v));
            self.mul(right.d, ln)
        };
        let power_term = if self.is_zero(left.d) {
            self.c(0.0)
        } else {
            let scaled = self.mul(right.v, left.d);
            self.div(scaled, left.v)
        };
        let sum = self.add(log_term, power_term);
        let d = self.mul(v, sum);
        Dual { v, d }
    }
}

/// Extracts `(lower, upper, rate)` for arms that are all literal; the shape
/// required for a closed-form plan.
fn literal_arm_list(arms: &[RangeArm]) -> Option<Vec<(f64, f64, f64)>> {
    let mut literal = Vec::with_capacity(arms.len());
    for arm in arms {
        let lower = plan::literal_bound(&arm.lower)?;
        let upper = plan::literal_bound(&arm.upper)?;
        let rate = plan::literal_number(&arm.rate)?;
        if !lower.is_finite() {
            return None;
        }
        if upper.is_finite() && upper <= lower {
            return None;
        }
        literal.push((lower, upper, rate));
    }
    Some(literal)
}

