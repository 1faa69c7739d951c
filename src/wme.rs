//! Working memory: the set of (identifier, attribute, value) elements.
//!
//! Elements are deduplicated on the full triple plus the acceptable flag and
//! stamped with a monotonically increasing timetag. The store retains the
//! symbols of every element it holds and releases them on removal.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{CogentResult, WmeError};
use crate::symbol::{Symbol, SymbolTable};

/// Creation stamp of a working memory element. Never reused.
pub type Timetag = u64;

/// One working memory element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Wme {
    pub timetag: Timetag,
    pub id: Symbol,
    pub attr: Symbol,
    pub value: Symbol,
    /// Acceptable-preference element, printed with a trailing `+`.
    pub acceptable: bool,
}

/// Field of a WME addressed by tests and bindings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Field {
    Id,
    Attr,
    Value,
}

impl Wme {
    pub fn field(&self, field: Field) -> Symbol {
        match field {
            Field::Id => self.id,
            Field::Attr => self.attr,
            Field::Value => self.value,
        }
    }

    /// `(S1 ^type state)` style rendering.
    pub fn render(&self, symbols: &SymbolTable) -> String {
        format!(
            "({}: {} ^{} {}{})",
            self.timetag,
            symbols.render(self.id),
            symbols.render(self.attr),
            symbols.render(self.value),
            if self.acceptable { " +" } else { "" }
        )
    }
}

/// Who put an element into working memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WmeOrigin {
    /// Added by an external `add-wme` or a completed query.
    Input,
    /// Goal-stack structure maintained by the decision procedure.
    Architecture,
    /// Derived from acceptable preferences.
    Preference,
}

#[derive(Debug, Clone)]
pub struct WmeEntry {
    pub wme: Wme,
    pub origin: WmeOrigin,
    /// Number of acceptable preferences supporting a preference-derived element.
    pub support: u32,
}

type WmeKey = (Symbol, Symbol, Symbol, bool);

/// Timetag-ordered element store with triple and identifier indexes.
pub struct WorkingMemory {
    symbols: Arc<SymbolTable>,
    wmes: BTreeMap<Timetag, WmeEntry>,
    index: HashMap<WmeKey, Timetag>,
    by_id: HashMap<Symbol, BTreeSet<Timetag>>,
    next_timetag: Timetag,
}

impl WorkingMemory {
    pub fn new(symbols: Arc<SymbolTable>) -> Self {
        Self {
            symbols,
            wmes: BTreeMap::new(),
            index: HashMap::new(),
            by_id: HashMap::new(),
            next_timetag: 1,
        }
    }

    /// Add an element. Returns the element and whether it is new; adding an
    /// identical element again is a no-op that returns the existing one.
    pub fn add(
        &mut self,
        id: Symbol,
        attr: Symbol,
        value: Symbol,
        acceptable: bool,
        origin: WmeOrigin,
    ) -> (Wme, bool) {
        let key = (id, attr, value, acceptable);
        if let Some(tt) = self.index.get(&key) {
            if let Some(entry) = self.wmes.get(tt) {
                return (entry.wme, false);
            }
        }
        let timetag = self.next_timetag;
        self.next_timetag += 1;
        let wme = Wme {
            timetag,
            id,
            attr,
            value,
            acceptable,
        };
        self.symbols.retain(id);
        self.symbols.retain(attr);
        self.symbols.retain(value);
        self.index.insert(key, timetag);
        self.by_id.entry(id).or_default().insert(timetag);
        self.wmes.insert(
            timetag,
            WmeEntry {
                wme,
                origin,
                support: 0,
            },
        );
        (wme, true)
    }

    /// Remove an element by timetag.
    pub fn remove(&mut self, timetag: Timetag) -> CogentResult<WmeEntry> {
        let entry = self
            .wmes
            .remove(&timetag)
            .ok_or(WmeError::UnknownTimetag { timetag })?;
        let wme = entry.wme;
        self.index
            .remove(&(wme.id, wme.attr, wme.value, wme.acceptable));
        if let Some(set) = self.by_id.get_mut(&wme.id) {
            set.remove(&timetag);
            if set.is_empty() {
                self.by_id.remove(&wme.id);
            }
        }
        self.symbols.release(wme.id);
        self.symbols.release(wme.attr);
        self.symbols.release(wme.value);
        Ok(entry)
    }

    pub fn find(&self, id: Symbol, attr: Symbol, value: Symbol, acceptable: bool) -> Option<Timetag> {
        self.index.get(&(id, attr, value, acceptable)).copied()
    }

    pub fn get(&self, timetag: Timetag) -> Option<&WmeEntry> {
        self.wmes.get(&timetag)
    }

    pub fn set_support(&mut self, timetag: Timetag, support: u32) {
        if let Some(entry) = self.wmes.get_mut(&timetag) {
            entry.support = support;
        }
    }

    /// Elements whose identifier is `id`, in timetag order.
    pub fn with_id(&self, id: Symbol) -> impl Iterator<Item = &WmeEntry> + '_ {
        self.by_id
            .get(&id)
            .into_iter()
            .flat_map(|set| set.iter())
            .filter_map(|tt| self.wmes.get(tt))
    }

    /// Whether any element has `id` as its identifier.
    pub fn has_id(&self, id: Symbol) -> bool {
        self.by_id.contains_key(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &WmeEntry> + '_ {
        self.wmes.values()
    }

    pub fn len(&self) -> usize {
        self.wmes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.wmes.is_empty()
    }

    /// Remove every element, returning them in timetag order.
    pub fn clear(&mut self) -> Vec<WmeEntry> {
        let timetags: Vec<Timetag> = self.wmes.keys().copied().collect();
        timetags
            .into_iter()
            .filter_map(|tt| self.remove(tt).ok())
            .collect()
    }

    pub fn symbols(&self) -> &Arc<SymbolTable> {
        &self.symbols
    }
}

impl std::fmt::Debug for WorkingMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkingMemory")
            .field("len", &self.wmes.len())
            .field("next_timetag", &self.next_timetag)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (Arc<SymbolTable>, WorkingMemory, Symbol, Symbol, Symbol) {
        let symbols = Arc::new(SymbolTable::new());
        let wm = WorkingMemory::new(Arc::clone(&symbols));
        let s1 = symbols.new_identifier('S');
        let ty = symbols.intern_str("type");
        let state = symbols.intern_str("state");
        (symbols, wm, s1, ty, state)
    }

    #[test]
    fn duplicate_add_is_noop() {
        let (_, mut wm, s1, ty, state) = setup();
        let (a, new_a) = wm.add(s1, ty, state, false, WmeOrigin::Input);
        let (b, new_b) = wm.add(s1, ty, state, false, WmeOrigin::Input);
        assert!(new_a);
        assert!(!new_b);
        assert_eq!(a, b);
        assert_eq!(wm.len(), 1);
    }

    #[test]
    fn acceptable_flag_distinguishes_elements() {
        let (_, mut wm, s1, ty, state) = setup();
        let (a, _) = wm.add(s1, ty, state, false, WmeOrigin::Input);
        let (b, _) = wm.add(s1, ty, state, true, WmeOrigin::Preference);
        assert_ne!(a.timetag, b.timetag);
        assert_eq!(wm.with_id(s1).count(), 2);
    }

    #[test]
    fn timetags_increase_and_are_not_reused() {
        let (_, mut wm, s1, ty, state) = setup();
        let (a, _) = wm.add(s1, ty, state, false, WmeOrigin::Input);
        wm.remove(a.timetag).unwrap();
        let (b, _) = wm.add(s1, ty, state, false, WmeOrigin::Input);
        assert!(b.timetag > a.timetag);
    }

    #[test]
    fn removal_releases_symbols() {
        let (symbols, mut wm, s1, ty, state) = setup();
        let (a, _) = wm.add(s1, ty, state, false, WmeOrigin::Input);
        assert_eq!(symbols.refcount(state), 1);
        wm.remove(a.timetag).unwrap();
        assert_eq!(symbols.refcount(state), 0);
        assert!(!wm.has_id(s1));
        assert!(wm.remove(a.timetag).is_err());
    }

    #[test]
    fn render_marks_acceptable() {
        let (symbols, mut wm, s1, _, _) = setup();
        let op = symbols.intern_str("operator");
        let o1 = symbols.new_identifier('O');
        let (w, _) = wm.add(s1, op, o1, true, WmeOrigin::Preference);
        assert_eq!(w.render(&symbols), "(1: S1 ^operator O1 +)");
    }
}
