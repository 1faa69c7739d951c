//! Context stack entries.

use crate::preference::ImpasseKind;
use crate::rete::arena::Handle;
use crate::symbol::Symbol;
use crate::wme::Timetag;

use super::{Instantiation, PrefId};

pub(crate) type InstHandle = Handle<Instantiation>;

/// Why a subgoal exists.
#[derive(Debug, Clone)]
pub(crate) struct Impasse {
    pub kind: ImpasseKind,
    pub items: Vec<Symbol>,
}

impl Impasse {
    /// Same impasse as an existing subgoal: kind and item set agree.
    pub fn same_as(&self, kind: ImpasseKind, items: &[Symbol]) -> bool {
        self.kind == kind
            && self.items.len() == items.len()
            && items.iter().all(|i| self.items.contains(i))
    }
}

/// One level of the context stack. Level 1 is the top state.
#[derive(Debug)]
pub(crate) struct Goal {
    pub level: usize,
    pub state: Symbol,
    pub operator: Option<Symbol>,
    /// Timetag of the `(state ^operator op)` element.
    pub operator_wme: Option<Timetag>,
    /// `None` for the top state.
    pub impasse: Option<Impasse>,
    /// Preferences created at this level for higher-level identifiers.
    pub results: Vec<PrefId>,
    /// Decision count when the goal was created.
    pub created_at: u64,
}

impl Goal {
    pub fn top(state: Symbol) -> Self {
        Self {
            level: 1,
            state,
            operator: None,
            operator_wme: None,
            impasse: None,
            results: Vec::new(),
            created_at: 0,
        }
    }
}

/// Where an agent is in its decision cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Input,
    Elaborate,
    Decide,
    Output,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Phase::Input => "input",
            Phase::Elaborate => "elaborate",
            Phase::Decide => "decide",
            Phase::Output => "output",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symbol::SymbolTable;

    #[test]
    fn impasse_identity_ignores_item_order() {
        let symbols = SymbolTable::new();
        let (a, b) = (symbols.new_identifier('O'), symbols.new_identifier('O'));
        let imp = Impasse {
            kind: ImpasseKind::Tie,
            items: vec![a, b],
        };
        assert!(imp.same_as(ImpasseKind::Tie, &[b, a]));
        assert!(!imp.same_as(ImpasseKind::Conflict, &[a, b]));
        assert!(!imp.same_as(ImpasseKind::Tie, &[a]));
    }
}
