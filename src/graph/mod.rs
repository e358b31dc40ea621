//! Per-country component dependency graph.
//!
//! Collects each component's direct references statically, without evaluating
//! anything, and classifies the graph. The result drives three optimizations
//! downstream: which components need memoization cells at all, whether
//! runtime cycle guards can be elided, and which components are reachable
//! from the active set (dead-component pruning in the specialized program).

use std::collections::{HashMap, HashSet};

use petgraph::algo::is_cyclic_directed;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Dfs;
use smallvec::SmallVec;

use crate::ast::{Bound, Expr, RangeArm};
use crate::model::{Component, ComponentBody, ComponentId, Country, TaxModel};

#[derive(Debug, Clone)]
pub struct DependencyGraph {
    /// Members in dense local order; all other vectors are parallel to this.
    pub members: Vec<ComponentId>,
    index_of: HashMap<ComponentId, usize>,
    graph: DiGraph<ComponentId, ()>,
    nodes: Vec<NodeIndex>,
    /// Deduplicated direct dependencies, as local indices.
    pub deps: Vec<SmallVec<[u32; 4]>>,
    /// Inbound reference counts, as seen from other members.
    pub inbound: Vec<u32>,
    /// False when any dependency could not be statically resolved
    /// (cross-country target, unknown reference, free identifier).
    pub fully_resolved: bool,
    /// Proven acyclic. Requires full resolution; otherwise downstream code
    /// must keep the safe cycle-guarded path.
    pub acyclic: bool,
}

impl DependencyGraph {
    pub fn for_country(model: &TaxModel, country: &Country) -> DependencyGraph {
        Self::build(model, country, &country.component_ids)
    }

    pub fn build(model: &TaxModel, country: &Country, members: &[ComponentId]) -> DependencyGraph {
        let member_set: HashSet<ComponentId> = members.iter().copied().collect();
        let index_of: HashMap<ComponentId, usize> = members
            .iter()
            .enumerate()
            .map(|(index, &id)| (id, index))
            .collect();

        let mut graph = DiGraph::with_capacity(members.len(), members.len());
        let nodes: Vec<NodeIndex> = members.iter().map(|&id| graph.add_node(id)).collect();

        let mut deps: Vec<SmallVec<[u32; 4]>> = vec![SmallVec::new(); members.len()];
        let mut inbound = vec![0u32; members.len()];
        let mut fully_resolved = true;

        for (local, &id) in members.iter().enumerate() {
            let component = model.component(id);
            let mut collected = Vec::new();
            if !collect_component_deps(model, component, &mut collected) {
                fully_resolved = false;
                continue;
            }

            let mut edge_set: SmallVec<[u32; 4]> = SmallVec::new();
            for dep in collected {
                let target = model.component(dep);
                if target.country != country.id {
                    // A cross-country edge leaves this graph's universe.
                    fully_resolved = false;
                    continue;
                }
                if !member_set.contains(&dep) {
                    continue;
                }
                let dep_local = index_of[&dep] as u32;
                if !edge_set.contains(&dep_local) {
                    edge_set.push(dep_local);
                    inbound[dep_local as usize] += 1;
                    graph.add_edge(nodes[local], nodes[dep_local as usize], ());
                }
            }
            deps[local] = edge_set;
        }

        let has_cycle = is_cyclic_directed(&graph);
        if !fully_resolved {
            tracing::debug!(
                country = %country.name,
                "dependency graph not fully resolved; cycle guards stay on"
            );
        }

        DependencyGraph {
            members: members.to_vec(),
            index_of,
            graph,
            nodes,
            deps,
            inbound,
            fully_resolved,
            acyclic: fully_resolved && !has_cycle,
        }
    }

    #[inline(always)]
    pub fn local_index(&self, id: ComponentId) -> Option<usize> {
        self.index_of.get(&id).copied()
    }

    /// Marks every member reachable from the roots through dependency edges.
    pub fn reachable_from(&self, roots: &[ComponentId]) -> Vec<bool> {
        let mut reachable = vec![false; self.members.len()];
        for root in roots {
            let Some(local) = self.local_index(*root) else {
                continue;
            };
            if reachable[local] {
                continue;
            }
            let mut dfs = Dfs::new(&self.graph, self.nodes[local]);
            while let Some(node) = dfs.next(&self.graph) {
                let id = self.graph[node];
                reachable[self.index_of[&id]] = true;
            }
        }
        reachable
    }

    /// Leaf components never need a cache cell; with a proven-acyclic graph,
    /// components nobody references can skip it too.
    pub fn can_bypass_memo(&self, local: usize) -> bool {
        if self.deps[local].is_empty() && self.inbound[local] == 0 {
            return true;
        }
        self.acyclic && self.inbound[local] == 0
    }
}

/// Walks a component body and collects every statically resolvable component
/// reference. Returns false when the body contains something the static pass
/// cannot account for.
fn collect_component_deps(
    model: &TaxModel,
    component: &Component,
    out: &mut Vec<ComponentId>,
) -> bool {
    let mut locals: HashSet<String> = HashSet::new();
    match &component.body {
        ComponentBody::Number(_) => true,
        ComponentBody::Expr(expr) => collect_expr(model, component, expr, &mut locals, out),
        ComponentBody::Block(block) => {
            for stmt in &block.stmts {
                if !collect_expr(model, component, &stmt.value, &mut locals, out) {
                    return false;
                }
                locals.insert(stmt.name.clone());
            }
            collect_expr(model, component, &block.result, &mut locals, out)
        }
    }
}

fn collect_expr(
    model: &TaxModel,
    component: &Component,
    expr: &Expr,
    locals: &mut HashSet<String>,
    out: &mut Vec<ComponentId>,
) -> bool {
    match expr {
        Expr::Number(_) | Expr::Infinity | Expr::Bool(_) | Expr::Str(_) => true,
        Expr::Ident(name) => locals.contains(name) || name == "x",
        Expr::Neg(inner) | Expr::Not(inner) => collect_expr(model, component, inner, locals, out),
        Expr::Binary { lhs, rhs, .. } | Expr::Compare { lhs, rhs, .. } => {
            collect_expr(model, component, lhs, locals, out)
                && collect_expr(model, component, rhs, locals, out)
        }
        Expr::And(terms) | Expr::Or(terms) => terms
            .iter()
            .all(|term| collect_expr(model, component, term, locals, out)),
        Expr::Ref(path) => match model.resolve_reference(component.country, path) {
            Ok(id) => {
                out.push(id);
                true
            }
            Err(_) => false,
        },
        Expr::Eval { target, income } => match model.resolve_reference(component.country, target) {
            Ok(id) => {
                out.push(id);
                collect_expr(model, component, income, locals, out)
            }
            Err(_) => false,
        },
        Expr::Fix { init, update } => {
            if !collect_expr(model, component, init, locals, out) {
                return false;
            }
            let mut fix_locals = locals.clone();
            fix_locals.insert("k".to_string());
            collect_expr(model, component, update, &mut fix_locals, out)
        }
        Expr::Call { args, .. } => args
            .iter()
            .all(|arg| collect_expr(model, component, arg, locals, out)),
        Expr::Piece { arms, default } => {
            for arm in arms {
                if !collect_expr(model, component, &arm.condition, locals, out)
                    || !collect_expr(model, component, &arm.value, locals, out)
                {
                    return false;
                }
            }
            match default {
                Some(expr) => collect_expr(model, component, expr, locals, out),
                None => true,
            }
        }
        Expr::Brackets { selector, arms } => {
            collect_expr(model, component, selector, locals, out)
                && collect_arms(model, component, arms, locals, out)
        }
        Expr::BracketsTaxable {
            income,
            allowance,
            allowance_base,
            arms,
        } => {
            collect_expr(model, component, income, locals, out)
                && collect_expr(model, component, allowance, locals, out)
                && collect_expr(model, component, allowance_base, locals, out)
                && collect_arms(model, component, arms, locals, out)
        }
    }
}

fn collect_arms(
    model: &TaxModel,
    component: &Component,
    arms: &[RangeArm],
    locals: &mut HashSet<String>,
    out: &mut Vec<ComponentId>,
) -> bool {
    for arm in arms {
        for bound in [&arm.lower, &arm.upper] {
            if let Bound::Finite(expr) = bound {
                if !collect_expr(model, component, expr, locals, out) {
                    return false;
                }
            }
        }
        if !collect_expr(model, component, &arm.rate, locals, out) {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{
        BinOp, Block, ComponentBody as AstBody, ComponentDef, CountryBlock, CurrencyDecl, Program,
        Wrapper,
    };
    use std::rc::Rc;

    fn country_with(bodies: Vec<(&str, Expr)>) -> TaxModel {
        let components = bodies
            .into_iter()
            .map(|(name, result)| ComponentDef {
                name: name.to_string(),
                kind: Some("income_tax".to_string()),
                wrapper: Wrapper::Total,
                body: AstBody::Block(Rc::new(Block {
                    stmts: vec![],
                    result,
                })),
            })
            .collect();
        let program = Program {
            countries: vec![CountryBlock {
                name: "Testland".to_string(),
                currency: Some(CurrencyDecl::Bare("EUR".to_string())),
                components,
            }],
        };
        TaxModel::build(&program).unwrap()
    }

    #[test]
    fn test_acyclic_chain_classifies() {
        let model = country_with(vec![
            (
                "Base",
                Expr::binary(BinOp::Mul, Expr::number(0.1), Expr::ident("x")),
            ),
            ("Surtax", Expr::reference(&["Base"])),
        ]);
        let country = model.country_by_key("testland").unwrap();
        let graph = DependencyGraph::for_country(&model, country);
        assert!(graph.fully_resolved);
        assert!(graph.acyclic);
        assert_eq!(graph.deps[1].as_slice(), &[0]);
        assert_eq!(graph.inbound[0], 1);
    }

    #[test]
    fn test_mutual_references_flag_cycle() {
        let model = country_with(vec![
            ("A", Expr::reference(&["B"])),
            ("B", Expr::reference(&["A"])),
        ]);
        let country = model.country_by_key("testland").unwrap();
        let graph = DependencyGraph::for_country(&model, country);
        assert!(graph.fully_resolved);
        assert!(!graph.acyclic);
    }

    #[test]
    fn test_unknown_reference_marks_unresolved() {
        let model = country_with(vec![("A", Expr::reference(&["Nowhere"]))]);
        let country = model.country_by_key("testland").unwrap();
        let graph = DependencyGraph::for_country(&model, country);
        assert!(!graph.fully_resolved);
        assert!(!graph.acyclic);
    }

    #[test]
    fn test_reachability_prunes_dead_components() {
        let model = country_with(vec![
            ("Base", Expr::number(0.0)),
            ("Surtax", Expr::reference(&["Base"])),
            ("Dead", Expr::number(0.0)),
        ]);
        let country = model.country_by_key("testland").unwrap();
        let graph = DependencyGraph::for_country(&model, country);
        let reachable = graph.reachable_from(&[ComponentId(1)]);
        assert_eq!(reachable, vec![true, true, false]);
    }

    #[test]
    fn test_memo_bypass_for_leaves() {
        let model = country_with(vec![
            ("Base", Expr::number(0.0)),
            ("Surtax", Expr::reference(&["Base"])),
        ]);
        let country = model.country_by_key("testland").unwrap();
        let graph = DependencyGraph::for_country(&model, country);
        // Surtax: has deps but nobody references it; acyclic, so bypass.
        assert!(graph.can_bypass_memo(1));
        // Base is referenced, so it keeps its cache cell.
        assert!(!graph.can_bypass_memo(0));
    }
}
