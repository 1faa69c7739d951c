//! Incremental match network.
//!
//! [`Rete`] keeps, for every loaded production, the exact set of complete
//! matches against the current working memory. WME additions and removals
//! propagate incrementally through shared alpha memories and beta nodes; the
//! resulting changes to the match sets are buffered as [`MatchChange`]s for
//! the decision procedure to collect with [`Rete::take_changes`].
//!
//! Compilation reorders each production's conditions so positive ones come
//! first (a semantics-preserving move), then builds or shares one beta node
//! per condition. Join and negative nodes with the same parent, alpha memory
//! and tests are shared between productions.

pub mod alpha;
pub mod arena;
pub mod beta;

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use tracing::trace;

use crate::error::{CogentResult, ProductionError, WmeError};
use crate::production::{Condition, Pattern, Production, ProductionId, Term, Test};
use crate::symbol::{Symbol, SymbolTable};
use crate::wme::{Field, Timetag, Wme};

use alpha::{AlphaKey, AlphaMemory, JoinTest, Operand, TestOp};
use arena::Arena;
use beta::{BetaNode, NodeHandle, NodeKind, Token, TokenHandle};

/// One change to a production's match set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MatchChange {
    Assert {
        production: ProductionId,
        token: TokenHandle,
    },
    Retract {
        production: ProductionId,
        token: TokenHandle,
    },
}

impl MatchChange {
    pub fn production(&self) -> ProductionId {
        match self {
            MatchChange::Assert { production, .. } | MatchChange::Retract { production, .. } => {
                *production
            }
        }
    }

    pub fn token(&self) -> TokenHandle {
        match self {
            MatchChange::Assert { token, .. } | MatchChange::Retract { token, .. } => *token,
        }
    }
}

#[derive(Debug)]
struct CompiledProduction {
    node: NodeHandle,
    /// Nodes acquired for this production, in build order.
    nodes: Vec<NodeHandle>,
    /// Where each top-level positive variable is first bound.
    bindings: HashMap<String, (usize, Field)>,
}

/// The match network of one agent.
pub struct Rete {
    pub(crate) symbols: Arc<SymbolTable>,
    pub(crate) nodes: Arena<BetaNode>,
    pub(crate) tokens: Arena<Token>,
    root: NodeHandle,
    root_token: TokenHandle,
    pub(crate) alphas: HashMap<AlphaKey, AlphaMemory>,
    /// Every WME in the network and the alpha memories holding it.
    wmes: HashMap<Timetag, (Wme, Vec<AlphaKey>)>,
    pub(crate) wme_tokens: HashMap<Timetag, Vec<TokenHandle>>,
    pub(crate) negative_refs: HashMap<Timetag, BTreeSet<TokenHandle>>,
    /// NCC token blocked by each (partner node, subnetwork result). A shared
    /// subnetwork bottom reports the same result to every partner.
    pub(crate) ncc_owner: HashMap<(NodeHandle, TokenHandle), TokenHandle>,
    goals: HashSet<Symbol>,
    productions: HashMap<ProductionId, CompiledProduction>,
    changes: Vec<MatchChange>,
    asserted: HashSet<(ProductionId, TokenHandle)>,
}

impl Rete {
    pub fn new(symbols: Arc<SymbolTable>) -> Self {
        let mut nodes = Arena::new();
        let mut tokens = Arena::new();
        let root = nodes.insert(BetaNode {
            kind: NodeKind::Root,
            parent: None,
            children: Vec::new(),
            tokens: BTreeSet::new(),
            depth: 0,
            refs: 1,
        });
        let root_token = tokens.insert(Token {
            node: root,
            parent: None,
            wme: None,
            depth: 0,
            children: Vec::new(),
            join_results: BTreeSet::new(),
            ncc_results: BTreeSet::new(),
            dying: false,
        });
        if let Some(r) = nodes.get_mut(root) {
            r.tokens.insert(root_token);
        }
        Self {
            symbols,
            nodes,
            tokens,
            root,
            root_token,
            alphas: HashMap::new(),
            wmes: HashMap::new(),
            wme_tokens: HashMap::new(),
            negative_refs: HashMap::new(),
            ncc_owner: HashMap::new(),
            goals: HashSet::new(),
            productions: HashMap::new(),
            changes: Vec::new(),
            asserted: HashSet::new(),
        }
    }

    pub(crate) fn emit(&mut self, change: MatchChange) {
        match change {
            MatchChange::Assert { production, token } => {
                self.asserted.insert((production, token));
                self.changes.push(change);
            }
            MatchChange::Retract { production, token } => {
                // An assertion still in the buffer cancels out.
                if !self.asserted.remove(&(production, token)) {
                    self.changes.push(change);
                }
            }
        }
    }

    /// Drain buffered match-set changes in the order they occurred.
    pub fn take_changes(&mut self) -> Vec<MatchChange> {
        let live = std::mem::take(&mut self.asserted);
        std::mem::take(&mut self.changes)
            .into_iter()
            .filter(|c| match c {
                MatchChange::Assert { production, token } => live.contains(&(*production, *token)),
                MatchChange::Retract { .. } => true,
            })
            .collect()
    }

    // -----------------------------------------------------------------------
    // Goals
    // -----------------------------------------------------------------------

    /// Flag an identifier as a goal state for `state` tests.
    ///
    /// Must be called while no WME has `id` as its identifier.
    pub fn set_goal(&mut self, id: Symbol, is_goal: bool) {
        debug_assert!(
            !self.wmes.values().any(|(w, _)| w.id == id),
            "goal flag changed while elements on the identifier are in the network"
        );
        if is_goal {
            self.goals.insert(id);
        } else {
            self.goals.remove(&id);
        }
    }

    pub fn is_goal(&self, id: Symbol) -> bool {
        self.goals.contains(&id)
    }

    // -----------------------------------------------------------------------
    // Working memory deltas
    // -----------------------------------------------------------------------

    /// Propagate a new WME. Alpha memories are filled one at a time and
    /// their successors activated deepest first, so no match is produced twice.
    pub fn add_wme(&mut self, wme: Wme) {
        if self.wmes.contains_key(&wme.timetag) {
            return;
        }
        let is_goal = self.goals.contains(&wme.id);
        let keys: Vec<AlphaKey> = AlphaKey::candidates(&wme, is_goal)
            .into_iter()
            .filter(|k| self.alphas.contains_key(k))
            .collect();
        self.wmes.insert(wme.timetag, (wme, keys.clone()));
        for key in keys {
            let mut successors = match self.alphas.get_mut(&key) {
                Some(alpha) => {
                    alpha.wmes.insert(wme.timetag, wme);
                    alpha.successors.clone()
                }
                None => continue,
            };
            successors.sort_by_key(|n| std::cmp::Reverse(self.nodes.get(*n).map_or(0, |n| n.depth)));
            for node in successors {
                self.right_activate(node, wme);
            }
        }
    }

    /// Retract a WME and everything matched through it.
    pub fn remove_wme(&mut self, timetag: Timetag) -> CogentResult<()> {
        let (_, keys) = self
            .wmes
            .remove(&timetag)
            .ok_or(WmeError::NotInNetwork { timetag })?;
        for key in &keys {
            if let Some(alpha) = self.alphas.get_mut(key) {
                alpha.wmes.remove(&timetag);
            }
        }
        for token in self.wme_tokens.remove(&timetag).unwrap_or_default() {
            self.delete_token(token);
        }
        for token in self.negative_refs.remove(&timetag).unwrap_or_default() {
            self.unblock(token, timetag);
        }
        Ok(())
    }

    pub fn contains_wme(&self, timetag: Timetag) -> bool {
        self.wmes.contains_key(&timetag)
    }

    /// Remove every WME, leaving productions loaded.
    pub fn clear_wmes(&mut self) {
        let mut timetags: Vec<Timetag> = self.wmes.keys().copied().collect();
        timetags.sort_unstable();
        for tt in timetags.into_iter().rev() {
            let _ = self.remove_wme(tt);
        }
    }

    // -----------------------------------------------------------------------
    // Productions
    // -----------------------------------------------------------------------

    /// Whether the network can represent `production`, without building it.
    pub fn check_production(production: &Production) -> CogentResult<()> {
        validate(production)
    }

    /// Compile a production into the network. Existing matches are asserted.
    pub fn add_production(&mut self, id: ProductionId, production: &Production) -> CogentResult<()> {
        validate(production)?;
        let ordered = reorder(&production.conditions);
        let mut env = HashMap::new();
        let mut acquired = Vec::new();
        let mut current = self.root;
        for cond in ordered {
            current = self.build_condition(cond, current, &mut env, &mut acquired);
        }
        let depth = self.nodes.get(current).map_or(0, |n| n.depth);
        let node = self.nodes.insert(BetaNode {
            kind: NodeKind::Production {
                id,
                matches: BTreeSet::new(),
            },
            parent: Some(current),
            children: Vec::new(),
            tokens: BTreeSet::new(),
            depth,
            refs: 1,
        });
        if let Some(parent) = self.nodes.get_mut(current) {
            parent.children.push(node);
        }
        acquired.push(node);
        for token in self.active_tokens(current) {
            self.left_activate(node, token);
        }
        trace!(production = %production.name, nodes = acquired.len(), "compiled production");
        self.productions.insert(
            id,
            CompiledProduction {
                node,
                nodes: acquired,
                bindings: env,
            },
        );
        Ok(())
    }

    /// Remove a production, retracting its matches and freeing nodes no
    /// other production uses.
    pub fn excise(&mut self, id: ProductionId) -> bool {
        let Some(compiled) = self.productions.remove(&id) else {
            return false;
        };
        for node in compiled.nodes.into_iter().rev() {
            self.release_node(node);
        }
        true
    }

    fn build_condition(
        &mut self,
        cond: &Condition,
        parent: NodeHandle,
        env: &mut HashMap<String, (usize, Field)>,
        acquired: &mut Vec<NodeHandle>,
    ) -> NodeHandle {
        let depth = self.nodes.get(parent).map_or(0, |n| n.depth) + 1;
        match cond {
            Condition::Positive(pattern) => {
                let (key, tests, bound) = compile_pattern(pattern, env);
                let node = self.shared_node(parent, NodeKind::Join { alpha: key, tests }, acquired);
                for (var, field) in bound {
                    env.entry(var).or_insert((depth, field));
                }
                node
            }
            Condition::Negative(pattern) => {
                let (key, tests, _) = compile_pattern(pattern, env);
                self.shared_node(parent, NodeKind::Negative { alpha: key, tests }, acquired)
            }
            Condition::Conjunctive(conds) => {
                let mut inner_env = env.clone();
                let mut bottom = parent;
                for c in reorder(conds) {
                    bottom = self.build_condition(c, bottom, &mut inner_env, acquired);
                }
                let owner_depth = depth - 1;
                let ncc = self.nodes.insert(BetaNode {
                    kind: NodeKind::Ncc {
                        partner: None,
                        by_parent: HashMap::new(),
                    },
                    parent: Some(parent),
                    children: Vec::new(),
                    tokens: BTreeSet::new(),
                    depth,
                    refs: 1,
                });
                let bottom_depth = self.nodes.get(bottom).map_or(depth, |n| n.depth);
                let partner = self.nodes.insert(BetaNode {
                    kind: NodeKind::NccPartner { ncc, owner_depth },
                    parent: Some(bottom),
                    children: Vec::new(),
                    tokens: BTreeSet::new(),
                    depth: bottom_depth,
                    refs: 1,
                });
                if let Some(NodeKind::Ncc { partner: slot, .. }) =
                    self.nodes.get_mut(ncc).map(|n| &mut n.kind)
                {
                    *slot = Some(partner);
                }
                // The NCC node sits after the subnetwork among its parent's
                // children, so the subnetwork sees each new token first.
                if let Some(p) = self.nodes.get_mut(parent) {
                    p.children.push(ncc);
                }
                if let Some(b) = self.nodes.get_mut(bottom) {
                    b.children.push(partner);
                }
                acquired.push(ncc);
                acquired.push(partner);
                for token in self.active_tokens(parent) {
                    self.left_activate(ncc, token);
                }
                ncc
            }
        }
    }

    /// Reuse an identical join/negative child of `parent` or build a new one.
    fn shared_node(&mut self, parent: NodeHandle, kind: NodeKind, acquired: &mut Vec<NodeHandle>) -> NodeHandle {
        let existing = self.nodes.get(parent).and_then(|p| {
            p.children.iter().copied().find(|c| {
                self.nodes.get(*c).is_some_and(|n| match (&n.kind, &kind) {
                    (
                        NodeKind::Join { alpha: a, tests: t },
                        NodeKind::Join { alpha: b, tests: u },
                    )
                    | (
                        NodeKind::Negative { alpha: a, tests: t },
                        NodeKind::Negative { alpha: b, tests: u },
                    ) => a == b && t == u,
                    _ => false,
                })
            })
        });
        if let Some(node) = existing {
            if let Some(n) = self.nodes.get_mut(node) {
                n.refs += 1;
            }
            acquired.push(node);
            return node;
        }

        let key = match &kind {
            NodeKind::Join { alpha, .. } | NodeKind::Negative { alpha, .. } => *alpha,
            _ => unreachable!("only join and negative nodes are shared"),
        };
        let depth = self.nodes.get(parent).map_or(0, |n| n.depth) + 1;
        let node = self.nodes.insert(BetaNode {
            kind,
            parent: Some(parent),
            children: Vec::new(),
            tokens: BTreeSet::new(),
            depth,
            refs: 1,
        });
        if let Some(p) = self.nodes.get_mut(parent) {
            p.children.push(node);
        }
        self.alpha_memory(key).successors.push(node);
        acquired.push(node);
        for token in self.active_tokens(parent) {
            self.left_activate(node, token);
        }
        node
    }

    /// Get or create the alpha memory for `key`, filling a new one from the
    /// WMEs already in the network.
    fn alpha_memory(&mut self, key: AlphaKey) -> &mut AlphaMemory {
        if !self.alphas.contains_key(&key) {
            let mut memory = AlphaMemory::default();
            for (tt, (wme, keys)) in self.wmes.iter_mut() {
                if key.matches(wme, self.goals.contains(&wme.id)) {
                    memory.wmes.insert(*tt, *wme);
                    keys.push(key);
                }
            }
            self.alphas.insert(key, memory);
        }
        self.alphas.entry(key).or_default()
    }

    fn release_node(&mut self, node: NodeHandle) {
        let remaining = match self.nodes.get_mut(node) {
            Some(n) => {
                n.refs -= 1;
                n.refs
            }
            None => return,
        };
        if remaining > 0 {
            return;
        }
        let Some(n) = self.nodes.get(node) else {
            return;
        };
        let parent = n.parent;
        let tokens: Vec<TokenHandle> = n.tokens.iter().copied().collect();
        let (alpha, production) = match &n.kind {
            NodeKind::Join { alpha, .. } | NodeKind::Negative { alpha, .. } => (Some(*alpha), None),
            NodeKind::Production { id, matches } => (None, Some((*id, matches.clone()))),
            _ => (None, None),
        };
        if let Some((id, matches)) = production {
            for token in matches {
                self.emit(MatchChange::Retract {
                    production: id,
                    token,
                });
            }
        }
        // Detach first so token deletion does not report to this node.
        if let Some(p) = parent.and_then(|p| self.nodes.get_mut(p)) {
            p.children.retain(|c| *c != node);
        }
        for token in tokens.into_iter().rev() {
            self.delete_token(token);
        }
        if let Some(key) = alpha {
            let now_empty = match self.alphas.get_mut(&key) {
                Some(a) => {
                    a.successors.retain(|s| *s != node);
                    a.successors.is_empty()
                }
                None => false,
            };
            if now_empty {
                if let Some(memory) = self.alphas.remove(&key) {
                    for tt in memory.wmes.keys() {
                        if let Some((_, keys)) = self.wmes.get_mut(tt) {
                            keys.retain(|k| *k != key);
                        }
                    }
                }
            }
        }
        self.nodes.remove(node);
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub fn has_production(&self, id: ProductionId) -> bool {
        self.productions.contains_key(&id)
    }

    /// Current complete matches of a production.
    pub fn matches(&self, id: ProductionId) -> Vec<TokenHandle> {
        self.productions
            .get(&id)
            .and_then(|c| self.nodes.get(c.node))
            .map(|n| match &n.kind {
                NodeKind::Production { matches, .. } => matches.iter().copied().collect(),
                _ => Vec::new(),
            })
            .unwrap_or_default()
    }

    pub fn is_live(&self, token: TokenHandle) -> bool {
        self.tokens.contains(token)
    }

    /// WMEs matched by the positive conditions of a match, in condition order.
    pub fn token_wmes(&self, token: TokenHandle) -> Vec<Wme> {
        let mut out = Vec::new();
        let mut cursor = Some(token);
        while let Some(t) = cursor.and_then(|h| self.tokens.get(h)) {
            if let Some(w) = t.wme {
                out.push(w);
            }
            cursor = t.parent;
        }
        out.reverse();
        out
    }

    /// Values of the production's positively bound variables for a match.
    pub fn bindings(&self, id: ProductionId, token: TokenHandle) -> HashMap<String, Symbol> {
        let Some(compiled) = self.productions.get(&id) else {
            return HashMap::new();
        };
        compiled
            .bindings
            .iter()
            .filter_map(|(var, (depth, field))| {
                let t = self.ancestor_at(token, *depth)?;
                let wme = self.tokens.get(t)?.wme?;
                Some((var.clone(), wme.field(*field)))
            })
            .collect()
    }

    pub fn production_count(&self) -> usize {
        self.productions.len()
    }

    /// Beta nodes excluding the root.
    pub fn node_count(&self) -> usize {
        self.nodes.len() - 1
    }

    pub fn alpha_count(&self) -> usize {
        self.alphas.len()
    }

    /// Live tokens excluding the root token.
    pub fn token_count(&self) -> usize {
        self.tokens.len() - 1
    }

    pub fn root_token(&self) -> TokenHandle {
        self.root_token
    }
}

impl std::fmt::Debug for Rete {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rete")
            .field("productions", &self.productions.len())
            .field("nodes", &self.node_count())
            .field("alphas", &self.alphas.len())
            .field("tokens", &self.token_count())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Compilation helpers
// ---------------------------------------------------------------------------

/// Positive conditions first, each group in its original order.
fn reorder(conditions: &[Condition]) -> Vec<&Condition> {
    let (positive, other): (Vec<_>, Vec<_>) = conditions.iter().partition(|c| c.is_positive());
    positive.into_iter().chain(other).collect()
}

/// Reject productions the network cannot represent.
fn validate(production: &Production) -> CogentResult<()> {
    if production.positive_count() == 0 {
        return Err(ProductionError::NoPositiveCondition {
            name: production.name.clone(),
        }
        .into());
    }
    let mut bound: HashSet<String> = HashSet::new();
    check_bound(&production.name, &reorder(&production.conditions), &mut bound)
}

fn check_bound(name: &str, conds: &[&Condition], bound: &mut HashSet<String>) -> CogentResult<()> {
    for cond in conds {
        match cond {
            Condition::Positive(p) => {
                let local = pattern_bindings(p);
                check_pattern(name, p, bound, &local)?;
                bound.extend(local);
            }
            Condition::Negative(p) => {
                let local = pattern_bindings(p);
                check_pattern(name, p, bound, &local)?;
            }
            Condition::Conjunctive(inner) => {
                let mut inner_bound = bound.clone();
                check_bound(name, &reorder(inner), &mut inner_bound)?;
            }
        }
    }
    Ok(())
}

fn check_pattern(name: &str, p: &Pattern, bound: &HashSet<String>, local: &HashSet<String>) -> CogentResult<()> {
    let mut rel_vars = Vec::new();
    for test in p.tests() {
        relational_variables(test, &mut rel_vars);
    }
    for var in rel_vars {
        if !bound.contains(var) && !local.contains(var) {
            return Err(ProductionError::UnboundRelationalVariable {
                name: name.to_string(),
                variable: format!("<{var}>"),
            }
            .into());
        }
    }
    Ok(())
}

fn relational_variables<'a>(test: &'a Test, out: &mut Vec<&'a str>) {
    match test {
        Test::Relation(_, Term::Variable(v)) => out.push(v),
        Test::Conjunction(tests) => tests.iter().for_each(|t| relational_variables(t, out)),
        _ => {}
    }
}

fn pattern_bindings(p: &Pattern) -> HashSet<String> {
    fn equality_vars(test: &Test, out: &mut HashSet<String>) {
        match test {
            Test::Variable(v) => {
                out.insert(v.clone());
            }
            Test::Conjunction(tests) => tests.iter().for_each(|t| equality_vars(t, out)),
            _ => {}
        }
    }
    let mut out = HashSet::new();
    for test in p.tests() {
        equality_vars(test, &mut out);
    }
    out
}

/// Split a pattern into an alpha key and join tests.
///
/// Returns the variables this pattern binds for the first time together with
/// the field binding them.
fn compile_pattern(
    pattern: &Pattern,
    env: &HashMap<String, (usize, Field)>,
) -> (AlphaKey, Vec<JoinTest>, Vec<(String, Field)>) {
    let mut key = AlphaKey {
        id: None,
        attr: None,
        value: None,
        acceptable: pattern.acceptable,
        goal: pattern.goal,
    };
    let mut tests = Vec::new();
    let mut local: HashMap<String, Field> = HashMap::new();
    let mut bound = Vec::new();
    let fields = [
        (Field::Id, &pattern.id),
        (Field::Attr, &pattern.attr),
        (Field::Value, &pattern.value),
    ];

    // Equality tests first so relations can refer to same-element bindings.
    for (field, test) in fields {
        for t in flatten(test) {
            match t {
                Test::Constant(s) => {
                    let slot = match field {
                        Field::Id => &mut key.id,
                        Field::Attr => &mut key.attr,
                        Field::Value => &mut key.value,
                    };
                    match slot {
                        None => *slot = Some(*s),
                        Some(existing) if existing == s => {}
                        Some(_) => tests.push(JoinTest::Compare {
                            field,
                            op: TestOp::Equal,
                            operand: Operand::Constant(*s),
                        }),
                    }
                }
                Test::Variable(v) => {
                    if let Some(&(d, f)) = env.get(v) {
                        tests.push(JoinTest::Compare {
                            field,
                            op: TestOp::Equal,
                            operand: Operand::Earlier { depth: d, field: f },
                        });
                    } else if let Some(&f) = local.get(v) {
                        tests.push(JoinTest::Compare {
                            field,
                            op: TestOp::Equal,
                            operand: Operand::SameWme(f),
                        });
                    } else {
                        local.insert(v.clone(), field);
                        bound.push((v.clone(), field));
                    }
                }
                _ => {}
            }
        }
    }
    for (field, test) in fields {
        for t in flatten(test) {
            match t {
                Test::Relation(op, term) => {
                    let operand = match term {
                        Term::Constant(s) => Operand::Constant(*s),
                        Term::Variable(v) => match (env.get(v), local.get(v)) {
                            (Some(&(d, f)), _) => Operand::Earlier { depth: d, field: f },
                            (None, Some(&f)) => Operand::SameWme(f),
                            // Rejected by `validate`.
                            (None, None) => continue,
                        },
                    };
                    tests.push(JoinTest::Compare {
                        field,
                        op: TestOp::Rel(*op),
                        operand,
                    });
                }
                Test::Disjunction(values) => tests.push(JoinTest::OneOf {
                    field,
                    values: values.clone(),
                }),
                _ => {}
            }
        }
    }
    (key, tests, bound)
}

fn flatten(test: &Test) -> Vec<&Test> {
    match test {
        Test::Conjunction(tests) => tests.iter().flat_map(flatten).collect(),
        other => vec![other],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::production::parse_production;
    use crate::wme::WorkingMemory;
    use crate::wme::WmeOrigin;

    struct Fixture {
        symbols: Arc<SymbolTable>,
        wm: WorkingMemory,
        rete: Rete,
        s1: Symbol,
    }

    impl Fixture {
        fn new() -> Self {
            let symbols = Arc::new(SymbolTable::new());
            let s1 = symbols.new_identifier('S');
            let mut rete = Rete::new(Arc::clone(&symbols));
            rete.set_goal(s1, true);
            Self {
                wm: WorkingMemory::new(Arc::clone(&symbols)),
                symbols,
                rete,
                s1,
            }
        }

        fn load(&mut self, id: u64, src: &str) -> ProductionId {
            let p = parse_production(src, &self.symbols).unwrap();
            let pid = ProductionId(id);
            self.rete.add_production(pid, &p).unwrap();
            pid
        }

        fn add(&mut self, id: Symbol, attr: &str, value: Symbol) -> Timetag {
            let attr = self.symbols.intern_str(attr);
            let (w, _) = self.wm.add(id, attr, value, false, WmeOrigin::Input);
            self.rete.add_wme(w);
            w.timetag
        }

        fn add_str(&mut self, id: Symbol, attr: &str, value: &str) -> Timetag {
            let v = self.symbols.intern_literal(value);
            self.add(id, attr, v)
        }

        fn remove(&mut self, tt: Timetag) {
            self.wm.remove(tt).unwrap();
            self.rete.remove_wme(tt).unwrap();
        }
    }

    fn asserts(changes: &[MatchChange]) -> usize {
        changes.iter().filter(|c| matches!(c, MatchChange::Assert { .. })).count()
    }

    fn retracts(changes: &[MatchChange]) -> usize {
        changes.iter().filter(|c| matches!(c, MatchChange::Retract { .. })).count()
    }

    #[test]
    fn single_condition_assert_and_retract() {
        let mut fx = Fixture::new();
        let p = fx.load(1, "sp {p1 (state <s> ^type state) --> (<s> ^done true)}");
        let s1 = fx.s1;
        let tt = fx.add_str(s1, "type", "state");
        let changes = fx.rete.take_changes();
        assert_eq!(changes.len(), 1);
        assert!(matches!(changes[0], MatchChange::Assert { production, .. } if production == p));
        let token = changes[0].token();
        assert_eq!(fx.rete.token_wmes(token)[0].timetag, tt);
        assert_eq!(fx.rete.bindings(p, token).get("s"), Some(&s1));

        fx.remove(tt);
        let changes = fx.rete.take_changes();
        assert_eq!(changes, vec![MatchChange::Retract { production: p, token }]);
        assert_eq!(fx.rete.token_count(), 0);
    }

    #[test]
    fn join_on_shared_variable() {
        let mut fx = Fixture::new();
        let p = fx.load(1, "sp {j (state <s> ^item <i>) (<i> ^color red) --> (<s> ^found <i>)}");
        let s1 = fx.s1;
        let b1 = fx.symbols.new_identifier('B');
        let b2 = fx.symbols.new_identifier('B');
        fx.add(s1, "item", b1);
        fx.add(s1, "item", b2);
        fx.add_str(b1, "color", "red");
        fx.add_str(b2, "color", "blue");
        assert_eq!(asserts(&fx.rete.take_changes()), 1);
        let m = fx.rete.matches(p);
        assert_eq!(fx.rete.bindings(p, m[0]).get("i"), Some(&b1));
    }

    #[test]
    fn same_wme_in_two_conditions_matches_once() {
        let mut fx = Fixture::new();
        let p = fx.load(1, "sp {twice (<a> ^next <b>) (<b> ^next <c>) --> (<a> ^two <c>)}");
        let x = fx.symbols.new_identifier('X');
        // (X1 ^next X1) joins with itself exactly once.
        fx.add(x, "next", x);
        assert_eq!(fx.rete.matches(p).len(), 1);
        assert_eq!(asserts(&fx.rete.take_changes()), 1);
    }

    #[test]
    fn negative_condition_blocks_and_unblocks() {
        let mut fx = Fixture::new();
        let p = fx.load(1, "sp {neg (state <s> ^type state) -(<s> ^done true) --> (<s> ^done true)}");
        let s1 = fx.s1;
        fx.add_str(s1, "type", "state");
        assert_eq!(fx.rete.matches(p).len(), 1);
        let done = fx.add_str(s1, "done", "true");
        assert!(fx.rete.matches(p).is_empty());
        let changes = fx.rete.take_changes();
        // Assert and retract of the same match cancel out.
        assert!(changes.is_empty());
        fx.remove(done);
        assert_eq!(fx.rete.matches(p).len(), 1);
        assert_eq!(asserts(&fx.rete.take_changes()), 1);
    }

    #[test]
    fn conjunctive_negation() {
        let mut fx = Fixture::new();
        let p = fx.load(
            1,
            "sp {ncc (state <s> ^type state) -{(<s> ^block <b>) (<b> ^color red)} --> (<s> ^clear yes)}",
        );
        let s1 = fx.s1;
        fx.add_str(s1, "type", "state");
        assert_eq!(fx.rete.matches(p).len(), 1);
        let b = fx.symbols.new_identifier('B');
        fx.add(s1, "block", b);
        assert_eq!(fx.rete.matches(p).len(), 1, "an uncolored block does not block");
        let red = fx.add_str(b, "color", "red");
        assert!(fx.rete.matches(p).is_empty());
        fx.rete.take_changes();
        fx.remove(red);
        assert_eq!(fx.rete.matches(p).len(), 1);
        assert_eq!(asserts(&fx.rete.take_changes()), 1);
    }

    #[test]
    fn shared_conjunctive_negation_unblocks_every_owner() {
        let mut fx = Fixture::new();
        let ncc = "(state <s> ^a <x>) -{(<x> ^b <y>) (<y> ^c 1)}";
        let n1 = fx.load(1, &format!("sp {{n1 {ncc} --> (<s> ^r 1)}}"));
        let n2 = fx.load(2, &format!("sp {{n2 {ncc} --> (<s> ^r 2)}}"));
        let s1 = fx.s1;
        let x = fx.symbols.new_identifier('X');
        let y = fx.symbols.new_identifier('Y');
        fx.add(s1, "a", x);
        fx.add(x, "b", y);
        let c = fx.add_str(y, "c", "1");
        assert!(fx.rete.matches(n1).is_empty());
        assert!(fx.rete.matches(n2).is_empty());

        fx.remove(c);
        assert_eq!(fx.rete.matches(n1).len(), 1);
        assert_eq!(fx.rete.matches(n2).len(), 1);

        fx.add_str(y, "c", "1");
        assert!(fx.rete.matches(n1).is_empty());
        assert!(fx.rete.excise(n2));
        assert!(fx.rete.matches(n1).is_empty());
    }

    #[test]
    fn relational_and_disjunction_tests() {
        let mut fx = Fixture::new();
        let p = fx.load(
            1,
            "sp {rel (state <s> ^min <m> ^count {<c> > <m>} ^color << red green >>) --> (<s> ^ok yes)}",
        );
        let s1 = fx.s1;
        let min = fx.add_str(s1, "min", "3");
        fx.add_str(s1, "count", "2");
        fx.add_str(s1, "color", "green");
        assert!(fx.rete.matches(p).is_empty());
        fx.add_str(s1, "count", "5");
        assert_eq!(fx.rete.matches(p).len(), 1);
        fx.remove(min);
        assert!(fx.rete.matches(p).is_empty());
    }

    #[test]
    fn new_production_sees_existing_memory() {
        let mut fx = Fixture::new();
        let s1 = fx.s1;
        fx.add_str(s1, "type", "state");
        let p = fx.load(1, "sp {late (state <s> ^type state) --> (<s> ^x y)}");
        assert_eq!(fx.rete.matches(p).len(), 1);
        assert_eq!(asserts(&fx.rete.take_changes()), 1);
    }

    #[test]
    fn nodes_are_shared_and_excise_frees_them() {
        let mut fx = Fixture::new();
        let a = fx.load(1, "sp {a (state <s> ^type state) (<s> ^x <x>) --> (<s> ^y <x>)}");
        let nodes_one = fx.rete.node_count();
        let b = fx.load(2, "sp {b (state <s> ^type state) (<s> ^x <x>) --> (<s> ^z <x>)}");
        // Only a second production node is added.
        assert_eq!(fx.rete.node_count(), nodes_one + 1);
        let s1 = fx.s1;
        fx.add_str(s1, "type", "state");
        fx.add_str(s1, "x", "1");
        fx.rete.take_changes();

        assert!(fx.rete.excise(a));
        let changes = fx.rete.take_changes();
        assert_eq!(retracts(&changes), 1);
        assert!(changes.iter().all(|c| c.production() == a));
        assert_eq!(fx.rete.matches(b).len(), 1);

        assert!(fx.rete.excise(b));
        assert_eq!(fx.rete.node_count(), 0);
        assert_eq!(fx.rete.alpha_count(), 0);
        assert_eq!(fx.rete.token_count(), 0);
        assert!(!fx.rete.excise(b));
    }

    #[test]
    fn goal_test_only_matches_goals() {
        let mut fx = Fixture::new();
        let p = fx.load(1, "sp {g (state <s> ^type state) --> (<s> ^x y)}");
        let other = fx.symbols.new_identifier('X');
        fx.add_str(other, "type", "state");
        assert!(fx.rete.matches(p).is_empty());
        let s1 = fx.s1;
        fx.add_str(s1, "type", "state");
        assert_eq!(fx.rete.matches(p).len(), 1);
    }

    #[test]
    fn rejects_unrepresentable_productions() {
        let mut fx = Fixture::new();
        let symbols = Arc::clone(&fx.symbols);
        let only_negative = parse_production("sp {n -(<s> ^a b) --> (write x)}", &symbols).unwrap();
        assert!(fx.rete.add_production(ProductionId(1), &only_negative).is_err());
        let unbound = parse_production("sp {u (<s> ^a < <y>) (<s> ^b <y>) --> (write x)}", &symbols).unwrap();
        assert!(fx.rete.add_production(ProductionId(2), &unbound).is_err());
        assert_eq!(fx.rete.production_count(), 0);
    }

    #[test]
    fn unknown_wme_removal_is_error() {
        let mut fx = Fixture::new();
        assert!(fx.rete.remove_wme(99).is_err());
    }
}
