//! Preference semantics and slot resolution.
//!
//! Resolution is a pure function of a slot's preferences, the configuration
//! and the selection RNG. Context slots (`^operator`) hold at most one value
//! and may end in an impasse; attribute slots are multi-valued.

use std::collections::{HashMap, HashSet};

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::config::{AgentConfig, ExplorationPolicy, NumericIndifferentMode};
use crate::symbol::{Symbol, SymbolTable};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PreferenceType {
    Acceptable,
    Reject,
    Better,
    Worse,
    Best,
    Worst,
    UnaryIndifferent,
    BinaryIndifferent,
    Require,
    Prohibit,
}

impl PreferenceType {
    /// Character used in production text.
    pub fn symbol(self) -> &'static str {
        match self {
            PreferenceType::Acceptable => "+",
            PreferenceType::Reject => "-",
            PreferenceType::Better | PreferenceType::Best => ">",
            PreferenceType::Worse | PreferenceType::Worst => "<",
            PreferenceType::UnaryIndifferent | PreferenceType::BinaryIndifferent => "=",
            PreferenceType::Require => "!",
            PreferenceType::Prohibit => "~",
        }
    }

    /// Whether the preference carries a referent.
    pub fn is_binary(self) -> bool {
        matches!(
            self,
            PreferenceType::Better | PreferenceType::Worse | PreferenceType::BinaryIndifferent
        )
    }
}

/// One preference as seen by resolution.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Preference {
    pub id: Symbol,
    pub attr: Symbol,
    pub value: Symbol,
    pub kind: PreferenceType,
    pub referent: Option<Symbol>,
    pub o_supported: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ImpasseKind {
    Tie,
    Conflict,
    ConstraintFailure,
    StateNoChange,
    OperatorNoChange,
}

impl ImpasseKind {
    /// Value of the impasse state's `^impasse` attribute.
    pub fn name(self) -> &'static str {
        match self {
            ImpasseKind::Tie => "tie",
            ImpasseKind::Conflict => "conflict",
            ImpasseKind::ConstraintFailure => "constraint-failure",
            ImpasseKind::StateNoChange | ImpasseKind::OperatorNoChange => "no-change",
        }
    }

    /// Value of `^choices`.
    pub fn choices(self) -> &'static str {
        match self {
            ImpasseKind::Tie | ImpasseKind::Conflict => "multiple",
            ImpasseKind::ConstraintFailure => "constraint-failure",
            ImpasseKind::StateNoChange | ImpasseKind::OperatorNoChange => "none",
        }
    }

    /// Value of `^attribute`.
    pub fn attribute(self) -> &'static str {
        match self {
            ImpasseKind::StateNoChange => "state",
            _ => "operator",
        }
    }
}

impl std::fmt::Display for ImpasseKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ImpasseKind::StateNoChange => write!(f, "state no-change"),
            ImpasseKind::OperatorNoChange => write!(f, "operator no-change"),
            other => write!(f, "{}", other.name()),
        }
    }
}

/// Outcome of resolving a context slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// No acceptable or require preference exists.
    NoCandidates,
    Winner(Symbol),
    Impasse { kind: ImpasseKind, items: Vec<Symbol> },
}

/// Resolve a context slot. Candidates keep the order of their first
/// acceptable or require preference in `prefs`.
pub fn resolve_context<R: Rng>(
    prefs: &[Preference],
    config: &AgentConfig,
    rng: &mut R,
    symbols: &SymbolTable,
) -> Decision {
    let mut candidates: Vec<Symbol> = Vec::new();
    for p in prefs {
        if matches!(p.kind, PreferenceType::Acceptable | PreferenceType::Require)
            && !candidates.contains(&p.value)
        {
            candidates.push(p.value);
        }
    }
    if candidates.is_empty() {
        return Decision::NoCandidates;
    }

    let of_kind = |kind: PreferenceType| -> HashSet<Symbol> {
        prefs.iter().filter(|p| p.kind == kind).map(|p| p.value).collect()
    };

    let required: Vec<Symbol> = candidates
        .iter()
        .copied()
        .filter(|c| prefs.iter().any(|p| p.kind == PreferenceType::Require && p.value == *c))
        .collect();
    if !required.is_empty() {
        let prohibited = of_kind(PreferenceType::Prohibit);
        if required.len() > 1 || prohibited.contains(&required[0]) {
            return Decision::Impasse {
                kind: ImpasseKind::Conflict,
                items: required,
            };
        }
        return Decision::Winner(required[0]);
    }

    let rejected = of_kind(PreferenceType::Reject);
    let prohibited = of_kind(PreferenceType::Prohibit);
    let mut remaining: Vec<Symbol> = candidates
        .iter()
        .copied()
        .filter(|c| !rejected.contains(c) && !prohibited.contains(c))
        .collect();
    if remaining.is_empty() {
        return Decision::Impasse {
            kind: ImpasseKind::ConstraintFailure,
            items: candidates,
        };
    }

    // Dominance edges (better, worse) restricted to remaining candidates.
    let live: HashSet<Symbol> = remaining.iter().copied().collect();
    let mut dominates: HashMap<Symbol, HashSet<Symbol>> = HashMap::new();
    for p in prefs {
        let Some(referent) = p.referent else { continue };
        let (hi, lo) = match p.kind {
            PreferenceType::Better => (p.value, referent),
            PreferenceType::Worse => (referent, p.value),
            _ => continue,
        };
        if hi != lo && live.contains(&hi) && live.contains(&lo) {
            dominates.entry(hi).or_default().insert(lo);
        }
    }
    let cyclic: Vec<Symbol> = remaining
        .iter()
        .copied()
        .filter(|c| reaches(&dominates, *c, *c))
        .collect();
    if !cyclic.is_empty() {
        return Decision::Impasse {
            kind: ImpasseKind::Conflict,
            items: cyclic,
        };
    }
    remaining.retain(|c| !dominates.values().any(|lows| lows.contains(c)));

    let best = of_kind(PreferenceType::Best);
    if remaining.iter().any(|c| best.contains(c)) {
        remaining.retain(|c| best.contains(c));
    }
    let worst = of_kind(PreferenceType::Worst);
    if remaining.iter().any(|c| !worst.contains(c)) {
        remaining.retain(|c| !worst.contains(c));
    }

    if remaining.len() == 1 {
        return Decision::Winner(remaining[0]);
    }
    if !mutually_indifferent(prefs, &remaining, symbols) {
        return Decision::Impasse {
            kind: ImpasseKind::Tie,
            items: remaining,
        };
    }
    Decision::Winner(select(prefs, &remaining, config, rng, symbols))
}

fn reaches(edges: &HashMap<Symbol, HashSet<Symbol>>, from: Symbol, target: Symbol) -> bool {
    let mut seen = HashSet::new();
    let mut stack: Vec<Symbol> = edges.get(&from).map(|s| s.iter().copied().collect()).unwrap_or_default();
    while let Some(next) = stack.pop() {
        if next == target {
            return true;
        }
        if seen.insert(next) {
            if let Some(more) = edges.get(&next) {
                stack.extend(more.iter().copied());
            }
        }
    }
    false
}

/// Numeric value attached through `= number` preferences, if any.
pub fn numeric_value(
    prefs: &[Preference],
    candidate: Symbol,
    mode: NumericIndifferentMode,
    symbols: &SymbolTable,
) -> Option<f64> {
    let values: Vec<f64> = prefs
        .iter()
        .filter(|p| p.kind == PreferenceType::BinaryIndifferent && p.value == candidate)
        .filter_map(|p| p.referent.and_then(|r| symbols.number(r)))
        .collect();
    if values.is_empty() {
        return None;
    }
    let sum: f64 = values.iter().sum();
    Some(match mode {
        NumericIndifferentMode::Sum => sum,
        NumericIndifferentMode::Avg => sum / values.len() as f64,
    })
}

fn mutually_indifferent(prefs: &[Preference], candidates: &[Symbol], symbols: &SymbolTable) -> bool {
    let unary_or_numeric = |c: Symbol| {
        prefs.iter().any(|p| {
            p.value == c
                && (p.kind == PreferenceType::UnaryIndifferent
                    || (p.kind == PreferenceType::BinaryIndifferent
                        && p.referent.is_some_and(|r| symbols.number(r).is_some())))
        })
    };
    let binary = |a: Symbol, b: Symbol| {
        prefs.iter().any(|p| {
            p.kind == PreferenceType::BinaryIndifferent
                && ((p.value == a && p.referent == Some(b)) || (p.value == b && p.referent == Some(a)))
        })
    };
    candidates.iter().enumerate().all(|(i, &a)| {
        candidates[i + 1..]
            .iter()
            .all(|&b| (unary_or_numeric(a) && unary_or_numeric(b)) || binary(a, b))
    })
}

fn select<R: Rng>(
    prefs: &[Preference],
    candidates: &[Symbol],
    config: &AgentConfig,
    rng: &mut R,
    symbols: &SymbolTable,
) -> Symbol {
    match config.exploration {
        ExplorationPolicy::First => candidates[0],
        ExplorationPolicy::Softmax => {
            let values: Vec<f64> = candidates
                .iter()
                .map(|c| numeric_value(prefs, *c, config.numeric_indifferent_mode, symbols).unwrap_or(0.0))
                .map(|v| if v.is_nan() { 0.0 } else { v.clamp(f64::MIN, f64::MAX) })
                .collect();
            let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            let weights: Vec<f64> = values
                .iter()
                .map(|v| ((v - max) / config.temperature).exp())
                .collect();
            let total: f64 = weights.iter().sum();
            let mut point = rng.gen_range(0.0..total);
            for (candidate, weight) in candidates.iter().zip(&weights) {
                if point < *weight {
                    return *candidate;
                }
                point -= weight;
            }
            candidates[candidates.len() - 1]
        }
    }
}

/// Values of a multi-valued slot with their acceptable-preference counts,
/// in order of first appearance.
pub fn resolve_attribute(prefs: &[Preference]) -> Vec<(Symbol, u32)> {
    let mut out: Vec<(Symbol, u32)> = Vec::new();
    let blocked: HashSet<Symbol> = prefs
        .iter()
        .filter(|p| matches!(p.kind, PreferenceType::Reject | PreferenceType::Prohibit))
        .map(|p| p.value)
        .collect();
    for p in prefs {
        if p.kind != PreferenceType::Acceptable || blocked.contains(&p.value) {
            continue;
        }
        match out.iter_mut().find(|(v, _)| *v == p.value) {
            Some((_, count)) => *count += 1,
            None => out.push((p.value, 1)),
        }
    }
    out
}
