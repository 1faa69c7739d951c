//! Interned symbols for the cogent engine.
//!
//! Every identifier, attribute and constant in working memory and in
//! productions is a [`Symbol`]: a copyable, niche-optimized handle into the
//! agent's [`SymbolTable`]. Two symbols are equal exactly when they name the
//! same interned value, so matching never compares strings.
//!
//! The table is agent-local but internally sharded (`DashMap`), so it can be
//! shared with the background query workers through an `Arc`. Lifetimes are
//! reference counted: owners (WMEs, preferences, productions, goals) call
//! [`SymbolTable::retain`] / [`SymbolTable::release`], and entries whose count
//! has dropped to zero are reclaimed in bulk by [`SymbolTable::sweep`].

use std::num::NonZeroU64;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::error::{CogentResult, SymbolError};

/// Handle to an interned symbol.
///
/// Uses `NonZeroU64` so that `Option<Symbol>` is the same size as `Symbol`.
/// Handles are allocated monotonically and never reused, so a stale handle
/// can never alias a newer symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(transparent)]
pub struct Symbol(NonZeroU64);

impl Symbol {
    /// Create a `Symbol` from a raw `u64`. Returns `None` if `raw` is zero.
    pub fn new(raw: u64) -> Option<Self> {
        NonZeroU64::new(raw).map(Symbol)
    }

    /// The underlying handle value.
    pub fn get(self) -> u64 {
        self.0.get()
    }
}

impl std::fmt::Display for Symbol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sym:{}", self.0)
    }
}

/// Classification of a symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SymbolKind {
    Identifier,
    String,
    Integer,
    Float,
}

impl std::fmt::Display for SymbolKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SymbolKind::Identifier => write!(f, "identifier"),
            SymbolKind::String => write!(f, "string"),
            SymbolKind::Integer => write!(f, "integer"),
            SymbolKind::Float => write!(f, "float"),
        }
    }
}

/// The value a symbol stands for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SymbolValue {
    /// A working-memory identifier such as `S1` or `O12`.
    Identifier { letter: char, number: u64 },
    /// A symbolic (string) constant.
    String(String),
    Integer(i64),
    Float(f64),
}

impl SymbolValue {
    pub fn kind(&self) -> SymbolKind {
        match self {
            SymbolValue::Identifier { .. } => SymbolKind::Identifier,
            SymbolValue::String(_) => SymbolKind::String,
            SymbolValue::Integer(_) => SymbolKind::Integer,
            SymbolValue::Float(_) => SymbolKind::Float,
        }
    }

    /// Numeric view used by relational tests and RHS arithmetic.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            SymbolValue::Integer(i) => Some(*i as f64),
            SymbolValue::Float(x) => Some(*x),
            _ => None,
        }
    }

    fn key(&self) -> SymbolKey {
        match self {
            SymbolValue::Identifier { letter, number } => SymbolKey::Identifier(*letter, *number),
            SymbolValue::String(s) => SymbolKey::String(s.clone()),
            SymbolValue::Integer(i) => SymbolKey::Integer(*i),
            SymbolValue::Float(x) => SymbolKey::Float(x.to_bits()),
        }
    }
}

impl std::fmt::Display for SymbolValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SymbolValue::Identifier { letter, number } => write!(f, "{letter}{number}"),
            SymbolValue::String(s) => {
                if needs_quoting(s) {
                    write!(f, "|{}|", s.replace('|', "\\|"))
                } else {
                    write!(f, "{s}")
                }
            }
            SymbolValue::Integer(i) => write!(f, "{i}"),
            SymbolValue::Float(x) => write!(f, "{x:?}"),
        }
    }
}

/// Whether a string constant must be printed between `|` bars to read back
/// as the same constant.
fn needs_quoting(s: &str) -> bool {
    let Some(first) = s.chars().next() else {
        return true;
    };
    if !(first.is_alphanumeric() || matches!(first, '_' | '*' | '$' | '%' | '&' | '/' | '?')) {
        return true;
    }
    if s.parse::<i64>().is_ok() || s.parse::<f64>().is_ok() || looks_like_identifier(s) {
        return true;
    }
    !s.chars().all(is_constituent)
}

/// Characters allowed in an unquoted symbolic constant.
pub fn is_constituent(c: char) -> bool {
    c.is_alphanumeric()
        || matches!(c, '-' | '_' | '*' | '$' | '%' | '&' | '/' | ':' | '?' | '@')
}

/// `S12`, `O3`: one uppercase letter followed by digits.
pub(crate) fn looks_like_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_uppercase())
        && s.len() > 1
        && chars.all(|c| c.is_ascii_digit())
}

/// Hashable interning key (floats by bit pattern).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum SymbolKey {
    Identifier(char, u64),
    String(String),
    Integer(i64),
    Float(u64),
}

#[derive(Debug)]
struct SymbolEntry {
    value: SymbolValue,
    refs: u32,
}

/// Agent-local, internally synchronized symbol interner.
pub struct SymbolTable {
    by_key: DashMap<SymbolKey, Symbol>,
    entries: DashMap<Symbol, SymbolEntry>,
    next: AtomicU64,
    id_counters: DashMap<char, u64>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self {
            by_key: DashMap::new(),
            entries: DashMap::new(),
            next: AtomicU64::new(1),
            id_counters: DashMap::new(),
        }
    }

    fn allocate(&self) -> CogentResult<Symbol> {
        let raw = self.next.fetch_add(1, Ordering::Relaxed);
        Symbol::new(raw).ok_or_else(|| SymbolError::AllocatorExhausted.into())
    }

    fn intern(&self, value: SymbolValue) -> Symbol {
        let key = value.key();
        if let Some(existing) = self.by_key.get(&key) {
            return *existing.value();
        }
        match self.by_key.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(e) => *e.get(),
            dashmap::mapref::entry::Entry::Vacant(e) => {
                // 2^64 interned symbols cannot happen within one process.
                let sym = self
                    .allocate()
                    .unwrap_or_else(|e| panic!("symbol table invariant violated: {e}"));
                self.entries.insert(sym, SymbolEntry { value, refs: 0 });
                e.insert(sym);
                sym
            }
        }
    }

    /// Intern a symbolic constant.
    pub fn intern_str(&self, s: &str) -> Symbol {
        self.intern(SymbolValue::String(s.to_string()))
    }

    pub fn intern_int(&self, i: i64) -> Symbol {
        self.intern(SymbolValue::Integer(i))
    }

    pub fn intern_float(&self, x: f64) -> Symbol {
        self.intern(SymbolValue::Float(x))
    }

    /// Generate a fresh identifier with the given letter (`S`, `O`, `I`, ...).
    pub fn new_identifier(&self, letter: char) -> Symbol {
        let letter = if letter.is_ascii_alphabetic() {
            letter.to_ascii_uppercase()
        } else {
            'I'
        };
        let number = {
            let mut counter = self.id_counters.entry(letter).or_insert(0);
            *counter += 1;
            *counter
        };
        self.intern(SymbolValue::Identifier { letter, number })
    }

    /// Look up an existing identifier by its printed name (`"S1"`).
    pub fn find_identifier(&self, name: &str) -> Option<Symbol> {
        let mut chars = name.chars();
        let letter = chars.next()?.to_ascii_uppercase();
        let number: u64 = chars.as_str().parse().ok()?;
        self.by_key
            .get(&SymbolKey::Identifier(letter, number))
            .map(|r| *r.value())
    }

    /// Intern a literal as it appears in text: integers and floats become
    /// numeric symbols, everything else a string constant.
    pub fn intern_literal(&self, text: &str) -> Symbol {
        if let Ok(i) = text.parse::<i64>() {
            self.intern_int(i)
        } else if let Some(x) = parse_float_literal(text) {
            self.intern_float(x)
        } else {
            self.intern_str(text)
        }
    }

    pub fn value(&self, sym: Symbol) -> Option<SymbolValue> {
        self.entries.get(&sym).map(|e| e.value.clone())
    }

    pub fn kind(&self, sym: Symbol) -> Option<SymbolKind> {
        self.entries.get(&sym).map(|e| e.value.kind())
    }

    pub fn is_identifier(&self, sym: Symbol) -> bool {
        self.kind(sym) == Some(SymbolKind::Identifier)
    }

    pub fn contains(&self, sym: Symbol) -> bool {
        self.entries.contains_key(&sym)
    }

    /// Numeric value of an integer or float symbol.
    pub fn number(&self, sym: Symbol) -> Option<f64> {
        self.entries.get(&sym).and_then(|e| e.value.as_f64())
    }

    /// Printed form of a symbol, falling back to `sym:{n}` for reclaimed handles.
    pub fn render(&self, sym: Symbol) -> String {
        self.entries
            .get(&sym)
            .map(|e| e.value.to_string())
            .unwrap_or_else(|| sym.to_string())
    }

    /// Add one reference.
    ///
    /// # Panics
    /// Retaining a reclaimed symbol means some owner kept a handle past its
    /// lifetime; that is an unrecoverable bookkeeping bug.
    pub fn retain(&self, sym: Symbol) {
        match self.entries.get_mut(&sym) {
            Some(mut entry) => entry.refs += 1,
            None => panic!("symbol table invariant violated: retain of reclaimed {sym}"),
        }
    }

    /// Drop one reference. The entry is reclaimed by the next [`sweep`](Self::sweep).
    ///
    /// # Panics
    /// On reference-count underflow or release of a reclaimed symbol.
    pub fn release(&self, sym: Symbol) {
        match self.entries.get_mut(&sym) {
            Some(mut entry) => {
                if entry.refs == 0 {
                    panic!(
                        "symbol table invariant violated: refcount underflow on {}",
                        entry.value
                    );
                }
                entry.refs -= 1;
            }
            None => panic!("symbol table invariant violated: release of reclaimed {sym}"),
        }
    }

    pub fn refcount(&self, sym: Symbol) -> u32 {
        self.entries.get(&sym).map(|e| e.refs).unwrap_or(0)
    }

    /// Reclaim every symbol whose reference count is zero.
    ///
    /// Returns the reclaimed handles so owners of side tables (identifier
    /// levels, for instance) can drop their entries too.
    pub fn sweep(&self) -> Vec<Symbol> {
        let dead: Vec<Symbol> = self
            .entries
            .iter()
            .filter(|e| e.value().refs == 0)
            .map(|e| *e.key())
            .collect();
        for sym in &dead {
            if let Some((_, entry)) = self.entries.remove_if(sym, |_, e| e.refs == 0) {
                self.by_key.remove(&entry.value.key());
            }
        }
        dead
    }

    /// Restart identifier numbering. Only honoured when no identifier is live,
    /// so a reset can never produce a duplicate name.
    pub fn reset_identifier_counters(&self) -> bool {
        let any_live = self
            .entries
            .iter()
            .any(|e| e.value().value.kind() == SymbolKind::Identifier);
        if !any_live {
            self.id_counters.clear();
        }
        !any_live
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Float literals must contain a `.` or exponent so `5` stays an integer.
fn parse_float_literal(text: &str) -> Option<f64> {
    if !text.contains(['.', 'e', 'E']) {
        return None;
    }
    let first = text.chars().next()?;
    if !(first.is_ascii_digit() || first == '-' || first == '+' || first == '.') {
        return None;
    }
    text.parse::<f64>().ok().filter(|x| x.is_finite())
}

impl Default for SymbolTable {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SymbolTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SymbolTable").field("count", &self.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn symbol_niche_optimization() {
        assert_eq!(
            std::mem::size_of::<Option<Symbol>>(),
            std::mem::size_of::<Symbol>()
        );
    }

    #[test]
    fn interning_is_handle_equality() {
        let table = SymbolTable::new();
        let a = table.intern_str("red");
        let b = table.intern_str("red");
        let c = table.intern_str("blue");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(table.intern_int(1), table.intern_float(1.0));
    }

    #[test]
    fn identifiers_count_per_letter() {
        let table = SymbolTable::new();
        let s1 = table.new_identifier('S');
        let s2 = table.new_identifier('s');
        let o1 = table.new_identifier('O');
        assert_eq!(table.render(s1), "S1");
        assert_eq!(table.render(s2), "S2");
        assert_eq!(table.render(o1), "O1");
        assert_eq!(table.find_identifier("S2"), Some(s2));
        assert_eq!(table.find_identifier("S9"), None);
    }

    #[test]
    fn literal_classification() {
        let table = SymbolTable::new();
        assert_eq!(table.kind(table.intern_literal("42")), Some(SymbolKind::Integer));
        assert_eq!(table.kind(table.intern_literal("-3.5")), Some(SymbolKind::Float));
        assert_eq!(table.kind(table.intern_literal("state")), Some(SymbolKind::String));
        assert_eq!(table.kind(table.intern_literal("inf")), Some(SymbolKind::String));
    }

    #[test]
    fn sweep_reclaims_unreferenced() {
        let table = SymbolTable::new();
        let kept = table.intern_str("kept");
        let temp = table.intern_str("temp");
        table.retain(kept);
        let dead = table.sweep();
        assert_eq!(dead, vec![temp]);
        assert!(table.contains(kept));
        assert!(!table.contains(temp));

        // Re-interning a reclaimed value yields a fresh handle.
        let again = table.intern_str("temp");
        assert_ne!(again, temp);

        table.release(kept);
        table.sweep();
        assert!(!table.contains(kept));
    }

    #[test]
    #[should_panic(expected = "refcount underflow")]
    fn release_underflow_is_fatal() {
        let table = SymbolTable::new();
        let s = table.intern_str("x");
        table.release(s);
    }

    #[test]
    fn rendering_quotes_ambiguous_strings() {
        let table = SymbolTable::new();
        assert_eq!(table.render(table.intern_str("hello world")), "|hello world|");
        assert_eq!(table.render(table.intern_str("12")), "|12|");
        assert_eq!(table.render(table.intern_str("S1")), "|S1|");
        assert_eq!(table.render(table.intern_str("input-link")), "input-link");
        assert_eq!(table.render(table.intern_float(2.0)), "2.0");
    }

    #[test]
    fn counters_reset_only_without_live_identifiers() {
        let table = SymbolTable::new();
        let s = table.new_identifier('S');
        table.retain(s);
        assert!(!table.reset_identifier_counters());
        table.release(s);
        table.sweep();
        assert!(table.reset_identifier_counters());
        let again = table.new_identifier('S');
        assert_eq!(table.render(again), "S1");
    }

    #[test]
    fn concurrent_interning_agrees() {
        use std::sync::Arc;
        let table = Arc::new(SymbolTable::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let table = Arc::clone(&table);
                std::thread::spawn(move || table.intern_str("shared"))
            })
            .collect();
        let syms: Vec<Symbol> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(syms.windows(2).all(|w| w[0] == w[1]));
    }
}
