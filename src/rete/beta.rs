//! Beta network: join, negative and conjunctive-negation nodes.
//!
//! Every node owns the tokens it creates. A join node extends each parent
//! token with each matching WME; a negative node creates one token per parent
//! token and records the WMEs that block it; an NCC node does the same with
//! the result tokens of its subnetwork, reported through a partner node that
//! hangs off the subnetwork's bottom. A negative or NCC token with any
//! blocker is inactive: it has no children and is invisible to descendants.
//!
//! Production nodes keep the set of active parent tokens that form complete
//! matches and report changes to that set.

use std::collections::{BTreeSet, HashMap};

use crate::production::ProductionId;
use crate::wme::{Timetag, Wme};

use super::alpha::{AlphaKey, JoinTest, Operand, compare};
use super::arena::Handle;
use super::{MatchChange, Rete};

pub type NodeHandle = Handle<BetaNode>;
pub type TokenHandle = Handle<Token>;

#[derive(Debug)]
pub enum NodeKind {
    Root,
    Join {
        alpha: AlphaKey,
        tests: Vec<JoinTest>,
    },
    Negative {
        alpha: AlphaKey,
        tests: Vec<JoinTest>,
    },
    Ncc {
        partner: Option<NodeHandle>,
        by_parent: HashMap<TokenHandle, TokenHandle>,
    },
    NccPartner {
        ncc: NodeHandle,
        /// Depth of the NCC node's parent tokens.
        owner_depth: usize,
    },
    Production {
        id: ProductionId,
        matches: BTreeSet<TokenHandle>,
    },
}

#[derive(Debug)]
pub struct BetaNode {
    pub kind: NodeKind,
    pub parent: Option<NodeHandle>,
    pub children: Vec<NodeHandle>,
    pub tokens: BTreeSet<TokenHandle>,
    /// Depth of the tokens this node creates (root = 0).
    pub depth: usize,
    /// Productions using this node.
    pub refs: usize,
}

#[derive(Debug)]
pub struct Token {
    pub node: NodeHandle,
    pub parent: Option<TokenHandle>,
    pub wme: Option<Wme>,
    pub depth: usize,
    pub children: Vec<TokenHandle>,
    /// Blocking WMEs (negative node tokens).
    pub join_results: BTreeSet<Timetag>,
    /// Blocking subnetwork results (NCC tokens).
    pub ncc_results: BTreeSet<TokenHandle>,
    pub dying: bool,
}

impl Token {
    pub fn is_active(&self) -> bool {
        self.join_results.is_empty() && self.ncc_results.is_empty()
    }
}

/// What a left activation needs from a node, copied out of the arena.
enum Activation {
    Join(AlphaKey, Vec<JoinTest>),
    Negative(AlphaKey, Vec<JoinTest>),
    Ncc(Option<NodeHandle>),
    Partner(NodeHandle, usize),
    Production(ProductionId),
    Root,
}

impl Rete {
    // -----------------------------------------------------------------------
    // Token access
    // -----------------------------------------------------------------------

    pub(crate) fn ancestor_at(&self, mut token: TokenHandle, depth: usize) -> Option<TokenHandle> {
        loop {
            let t = self.tokens.get(token)?;
            if t.depth == depth {
                return Some(token);
            }
            if t.depth < depth {
                return None;
            }
            token = t.parent?;
        }
    }

    fn operand_value(&self, operand: &Operand, parent: TokenHandle, wme: &Wme) -> Option<crate::symbol::Symbol> {
        match operand {
            Operand::Constant(s) => Some(*s),
            Operand::SameWme(field) => Some(wme.field(*field)),
            Operand::Earlier { depth, field } => {
                let t = self.ancestor_at(parent, *depth)?;
                self.tokens.get(t)?.wme.map(|w| w.field(*field))
            }
        }
    }

    pub(crate) fn passes(&self, tests: &[JoinTest], parent: TokenHandle, wme: &Wme) -> bool {
        tests.iter().all(|test| match test {
            JoinTest::Compare { field, op, operand } => self
                .operand_value(operand, parent, wme)
                .is_some_and(|right| compare(&self.symbols, *op, wme.field(*field), right)),
            JoinTest::OneOf { field, values } => values.contains(&wme.field(*field)),
        })
    }

    /// Active tokens of `node`, in handle order.
    pub(crate) fn active_tokens(&self, node: NodeHandle) -> Vec<TokenHandle> {
        self.nodes
            .get(node)
            .map(|n| {
                n.tokens
                    .iter()
                    .copied()
                    .filter(|t| self.tokens.get(*t).is_some_and(Token::is_active))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn token_alive(&self, token: TokenHandle) -> bool {
        self.tokens.contains(token)
    }

    // -----------------------------------------------------------------------
    // Token creation and left activation
    // -----------------------------------------------------------------------

    fn make_token(&mut self, node: NodeHandle, parent: TokenHandle, wme: Option<Wme>) -> TokenHandle {
        let depth = self.tokens.get(parent).map_or(0, |p| p.depth + 1);
        let token = self.tokens.insert(Token {
            node,
            parent: Some(parent),
            wme,
            depth,
            children: Vec::new(),
            join_results: BTreeSet::new(),
            ncc_results: BTreeSet::new(),
            dying: false,
        });
        if let Some(p) = self.tokens.get_mut(parent) {
            p.children.push(token);
        }
        if let Some(n) = self.nodes.get_mut(node) {
            n.tokens.insert(token);
        }
        if let Some(w) = wme {
            self.wme_tokens.entry(w.timetag).or_default().push(token);
        }
        token
    }

    /// Pass an active token of `node` to every child.
    pub(crate) fn propagate(&mut self, node: NodeHandle, token: TokenHandle) {
        let children = match self.nodes.get(node) {
            Some(n) => n.children.clone(),
            None => return,
        };
        for child in children {
            if !self.token_alive(token) {
                break;
            }
            self.left_activate(child, token);
        }
    }

    fn activation(&self, node: NodeHandle) -> Option<Activation> {
        Some(match &self.nodes.get(node)?.kind {
            NodeKind::Root => Activation::Root,
            NodeKind::Join { alpha, tests } => Activation::Join(*alpha, tests.clone()),
            NodeKind::Negative { alpha, tests } => Activation::Negative(*alpha, tests.clone()),
            NodeKind::Ncc { partner, .. } => Activation::Ncc(*partner),
            NodeKind::NccPartner { ncc, owner_depth } => Activation::Partner(*ncc, *owner_depth),
            NodeKind::Production { id, .. } => Activation::Production(*id),
        })
    }

    pub(crate) fn left_activate(&mut self, node: NodeHandle, parent: TokenHandle) {
        let Some(activation) = self.activation(node) else {
            return;
        };
        match activation {
            Activation::Root => {}
            Activation::Join(alpha, tests) => {
                let candidates: Vec<Wme> = self
                    .alphas
                    .get(&alpha)
                    .map(|a| a.wmes.values().copied().collect())
                    .unwrap_or_default();
                for wme in candidates {
                    if !self.token_alive(parent) {
                        break;
                    }
                    if self.passes(&tests, parent, &wme) {
                        let token = self.make_token(node, parent, Some(wme));
                        self.propagate(node, token);
                    }
                }
            }
            Activation::Negative(alpha, tests) => {
                let blockers: BTreeSet<Timetag> = self
                    .alphas
                    .get(&alpha)
                    .map(|a| {
                        a.wmes
                            .values()
                            .filter(|w| self.passes(&tests, parent, w))
                            .map(|w| w.timetag)
                            .collect()
                    })
                    .unwrap_or_default();
                let token = self.make_token(node, parent, None);
                for tt in &blockers {
                    self.negative_refs.entry(*tt).or_default().insert(token);
                }
                let active = blockers.is_empty();
                if let Some(t) = self.tokens.get_mut(token) {
                    t.join_results = blockers;
                }
                if active {
                    self.propagate(node, token);
                }
            }
            Activation::Ncc(partner) => {
                let token = self.make_token(node, parent, None);
                if let Some(NodeKind::Ncc { by_parent, .. }) = self.nodes.get_mut(node).map(|n| &mut n.kind) {
                    by_parent.insert(parent, token);
                }
                let results = self.ncc_results_for(partner, parent);
                if let Some(partner) = partner {
                    for r in &results {
                        self.ncc_owner.insert((partner, *r), token);
                    }
                }
                let active = results.is_empty();
                if let Some(t) = self.tokens.get_mut(token) {
                    t.ncc_results = results;
                }
                if active {
                    self.propagate(node, token);
                }
            }
            Activation::Partner(ncc, owner_depth) => self.partner_add(node, ncc, owner_depth, parent),
            Activation::Production(id) => {
                if let Some(NodeKind::Production { matches, .. }) =
                    self.nodes.get_mut(node).map(|n| &mut n.kind)
                {
                    matches.insert(parent);
                }
                self.emit(MatchChange::Assert {
                    production: id,
                    token: parent,
                });
            }
        }
    }

    /// Active subnetwork results whose owner is `parent`.
    fn ncc_results_for(&self, partner: Option<NodeHandle>, parent: TokenHandle) -> BTreeSet<TokenHandle> {
        let Some(partner) = partner else {
            return BTreeSet::new();
        };
        let Some(p) = self.nodes.get(partner) else {
            return BTreeSet::new();
        };
        let (Some(bottom), NodeKind::NccPartner { owner_depth, .. }) = (p.parent, &p.kind) else {
            return BTreeSet::new();
        };
        self.active_tokens(bottom)
            .into_iter()
            .filter(|r| self.ancestor_at(*r, *owner_depth) == Some(parent))
            .collect()
    }

    fn partner_add(&mut self, partner: NodeHandle, ncc: NodeHandle, owner_depth: usize, result: TokenHandle) {
        let Some(owner_parent) = self.ancestor_at(result, owner_depth) else {
            return;
        };
        let owner = match self.nodes.get(ncc).map(|n| &n.kind) {
            Some(NodeKind::Ncc { by_parent, .. }) => by_parent.get(&owner_parent).copied(),
            _ => None,
        };
        // No owner yet: the NCC node will count this result when it is
        // activated for `owner_parent`.
        let Some(owner) = owner else {
            return;
        };
        let Some(t) = self.tokens.get_mut(owner) else {
            return;
        };
        let was_active = t.is_active();
        t.ncc_results.insert(result);
        self.ncc_owner.insert((partner, result), owner);
        if was_active {
            self.deactivate(owner);
        }
    }

    fn partner_remove(&mut self, partner: NodeHandle, result: TokenHandle) {
        let Some(owner) = self.ncc_owner.remove(&(partner, result)) else {
            return;
        };
        let Some(t) = self.tokens.get_mut(owner) else {
            return;
        };
        t.ncc_results.remove(&result);
        let reactivated = t.is_active() && !t.dying;
        let (node, parent) = (t.node, t.parent);
        let parent_dying = parent
            .and_then(|p| self.tokens.get(p))
            .is_some_and(|p| p.dying);
        if reactivated && !parent_dying {
            self.propagate(node, owner);
        }
    }

    /// A token just gained its first blocker: drop everything below it.
    fn deactivate(&mut self, token: TokenHandle) {
        let (children, node) = match self.tokens.get(token) {
            Some(t) => (t.children.clone(), t.node),
            None => return,
        };
        for child in children.into_iter().rev() {
            self.delete_token(child);
        }
        self.detach_from_consumers(node, token);
    }

    /// Remove `token` from production and partner children of its node.
    fn detach_from_consumers(&mut self, node: NodeHandle, token: TokenHandle) {
        let children = match self.nodes.get(node) {
            Some(n) => n.children.clone(),
            None => return,
        };
        for child in children {
            let mut retracted = None;
            let mut partner = None;
            match self.nodes.get_mut(child).map(|n| &mut n.kind) {
                Some(NodeKind::Production { id, matches }) => {
                    if matches.remove(&token) {
                        retracted = Some(*id);
                    }
                }
                Some(NodeKind::NccPartner { .. }) => partner = Some(child),
                _ => {}
            }
            if let Some(production) = retracted {
                self.emit(MatchChange::Retract { production, token });
            }
            if let Some(partner) = partner {
                self.partner_remove(partner, token);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Token deletion
    // -----------------------------------------------------------------------

    /// Delete a token and, newest first, all of its descendants.
    pub(crate) fn delete_token(&mut self, token: TokenHandle) {
        let children = match self.tokens.get_mut(token) {
            Some(t) => {
                t.dying = true;
                t.children.clone()
            }
            None => return,
        };
        for child in children.into_iter().rev() {
            self.delete_token(child);
        }
        let Some(t) = self.tokens.get(token) else {
            return;
        };
        let node = t.node;
        let parent = t.parent;
        self.detach_from_consumers(node, token);
        let partner = match self.nodes.get(node).map(|n| &n.kind) {
            Some(NodeKind::Ncc { partner, .. }) => *partner,
            _ => None,
        };

        let Some(t) = self.tokens.remove(token) else {
            return;
        };
        for tt in &t.join_results {
            if let Some(refs) = self.negative_refs.get_mut(tt) {
                refs.remove(&token);
                if refs.is_empty() {
                    self.negative_refs.remove(tt);
                }
            }
        }
        if let Some(partner) = partner {
            for r in &t.ncc_results {
                self.ncc_owner.remove(&(partner, *r));
            }
        }
        if let Some(w) = t.wme {
            if let Some(list) = self.wme_tokens.get_mut(&w.timetag) {
                list.retain(|x| *x != token);
                if list.is_empty() {
                    self.wme_tokens.remove(&w.timetag);
                }
            }
        }
        if let Some(p) = parent.and_then(|p| self.tokens.get_mut(p)) {
            p.children.retain(|x| *x != token);
        }
        if let Some(n) = self.nodes.get_mut(node) {
            n.tokens.remove(&token);
            if let NodeKind::Ncc { by_parent, .. } = &mut n.kind {
                if let Some(p) = parent {
                    by_parent.remove(&p);
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Right activation
    // -----------------------------------------------------------------------

    pub(crate) fn right_activate(&mut self, node: NodeHandle, wme: Wme) {
        let Some(activation) = self.activation(node) else {
            return;
        };
        let parent_node = self.nodes.get(node).and_then(|n| n.parent);
        match activation {
            Activation::Join(_, tests) => {
                let Some(parent_node) = parent_node else {
                    return;
                };
                for parent in self.active_tokens(parent_node) {
                    if !self.token_alive(parent) {
                        continue;
                    }
                    if self.passes(&tests, parent, &wme) {
                        let token = self.make_token(node, parent, Some(wme));
                        self.propagate(node, token);
                    }
                }
            }
            Activation::Negative(_, tests) => {
                let tokens: Vec<TokenHandle> = self
                    .nodes
                    .get(node)
                    .map(|n| n.tokens.iter().copied().collect())
                    .unwrap_or_default();
                for token in tokens {
                    let Some(parent) = self.tokens.get(token).and_then(|t| t.parent) else {
                        continue;
                    };
                    if !self.passes(&tests, parent, &wme) {
                        continue;
                    }
                    let Some(t) = self.tokens.get_mut(token) else {
                        continue;
                    };
                    let was_active = t.is_active();
                    t.join_results.insert(wme.timetag);
                    self.negative_refs.entry(wme.timetag).or_default().insert(token);
                    if was_active {
                        self.deactivate(token);
                    }
                }
            }
            _ => {}
        }
    }

    /// A blocking WME went away from a negative token.
    pub(crate) fn unblock(&mut self, token: TokenHandle, timetag: Timetag) {
        let Some(t) = self.tokens.get_mut(token) else {
            return;
        };
        t.join_results.remove(&timetag);
        if t.is_active() && !t.dying {
            let node = t.node;
            self.propagate(node, token);
        }
    }
}
