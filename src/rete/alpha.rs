//! Alpha memories and intra/inter-element tests.
//!
//! An alpha memory holds every WME that passes a fixed set of constant
//! equality tests (identifier, attribute, value), the acceptable flag and the
//! "identifier is a goal" flag. All remaining tests run at the beta level as
//! [`JoinTest`]s.

use std::collections::BTreeMap;

use crate::production::RelOp;
use crate::symbol::{Symbol, SymbolKind, SymbolTable};
use crate::wme::{Field, Timetag, Wme};

use super::beta::NodeHandle;

/// Constant tests selecting an alpha memory. `None` means "any".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AlphaKey {
    pub id: Option<Symbol>,
    pub attr: Option<Symbol>,
    pub value: Option<Symbol>,
    pub acceptable: bool,
    pub goal: bool,
}

impl AlphaKey {
    pub fn matches(&self, wme: &Wme, id_is_goal: bool) -> bool {
        self.id.is_none_or(|s| s == wme.id)
            && self.attr.is_none_or(|s| s == wme.attr)
            && self.value.is_none_or(|s| s == wme.value)
            && self.acceptable == wme.acceptable
            && (!self.goal || id_is_goal)
    }

    /// Every key a WME can satisfy: 8 wildcard combinations, doubled when
    /// its identifier is a goal.
    pub fn candidates(wme: &Wme, id_is_goal: bool) -> Vec<AlphaKey> {
        let mut out = Vec::with_capacity(16);
        let goal_flags: &[bool] = if id_is_goal { &[false, true] } else { &[false] };
        for &goal in goal_flags {
            for mask in 0u8..8 {
                out.push(AlphaKey {
                    id: (mask & 1 != 0).then_some(wme.id),
                    attr: (mask & 2 != 0).then_some(wme.attr),
                    value: (mask & 4 != 0).then_some(wme.value),
                    acceptable: wme.acceptable,
                    goal,
                });
            }
        }
        out
    }
}

#[derive(Debug, Default)]
pub struct AlphaMemory {
    pub wmes: BTreeMap<Timetag, Wme>,
    pub successors: Vec<NodeHandle>,
}

/// Right-hand operand of a relational join test.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operand {
    Constant(Symbol),
    /// Another field of the same WME.
    SameWme(Field),
    /// A field of the WME matched at an earlier token depth.
    Earlier { depth: usize, field: Field },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestOp {
    Equal,
    Rel(RelOp),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinTest {
    Compare {
        field: Field,
        op: TestOp,
        operand: Operand,
    },
    OneOf {
        field: Field,
        values: Vec<Symbol>,
    },
}

/// Apply `op` to two symbols. Numbers compare numerically, strings
/// lexically; ordering tests across kinds fail.
pub fn compare(symbols: &SymbolTable, op: TestOp, left: Symbol, right: Symbol) -> bool {
    let rel = match op {
        TestOp::Equal => return left == right,
        TestOp::Rel(RelOp::NotEqual) => return left != right,
        TestOp::Rel(rel) => rel,
    };
    let (Some(lv), Some(rv)) = (symbols.value(left), symbols.value(right)) else {
        return false;
    };
    if rel == RelOp::SameType {
        return same_kind(lv.kind(), rv.kind());
    }
    let ordering = match (lv.as_f64(), rv.as_f64()) {
        (Some(a), Some(b)) => a.partial_cmp(&b),
        _ => match (&lv, &rv) {
            (
                crate::symbol::SymbolValue::String(a),
                crate::symbol::SymbolValue::String(b),
            ) => Some(a.cmp(b)),
            _ => None,
        },
    };
    let Some(ordering) = ordering else {
        return false;
    };
    match rel {
        RelOp::Less => ordering.is_lt(),
        RelOp::Greater => ordering.is_gt(),
        RelOp::LessEqual => ordering.is_le(),
        RelOp::GreaterEqual => ordering.is_ge(),
        RelOp::NotEqual | RelOp::SameType => unreachable!("handled above"),
    }
}

/// Integers and floats count as one kind for `<=>`.
fn same_kind(a: SymbolKind, b: SymbolKind) -> bool {
    let numeric = |k| matches!(k, SymbolKind::Integer | SymbolKind::Float);
    a == b || (numeric(a) && numeric(b))
}
