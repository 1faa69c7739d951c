//! Productions: the rule language.
//!
//! A production is a named list of conditions matched against working memory
//! and a list of actions that create preferences or call functions when it
//! fires. Text in the `sp {...}` syntax is parsed by [`parser`] and printed
//! back by [`Production::display`]; printing then parsing yields an equal
//! production.

pub mod lexer;
pub mod parser;

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::preference::PreferenceType;
use crate::symbol::{Symbol, SymbolTable};

pub use parser::{parse_production, parse_productions};

/// Load-order key of a production inside one agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProductionId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProductionKind {
    User,
    Default,
    Chunk,
    Justification,
}

/// Declared persistence of the preferences a production creates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SupportMode {
    O,
    I,
}

/// Relational operators other than equality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RelOp {
    NotEqual,
    Less,
    Greater,
    LessEqual,
    GreaterEqual,
    /// Same symbol kind (`<=>`).
    SameType,
}

impl RelOp {
    pub fn as_str(self) -> &'static str {
        match self {
            RelOp::NotEqual => "<>",
            RelOp::Less => "<",
            RelOp::Greater => ">",
            RelOp::LessEqual => "<=",
            RelOp::GreaterEqual => ">=",
            RelOp::SameType => "<=>",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Term {
    Constant(Symbol),
    Variable(String),
}

/// A test on one field of a condition.
#[derive(Debug, Clone, PartialEq)]
pub enum Test {
    /// Matches anything (only produced for the value of `-^attr`).
    Blank,
    Constant(Symbol),
    Variable(String),
    Relation(RelOp, Term),
    Disjunction(Vec<Symbol>),
    Conjunction(Vec<Test>),
}

impl Test {
    /// First equality variable in this test, if any.
    pub fn variable(&self) -> Option<&str> {
        match self {
            Test::Variable(v) => Some(v),
            Test::Conjunction(tests) => tests.iter().find_map(|t| t.variable()),
            _ => None,
        }
    }

    fn collect_symbols(&self, out: &mut Vec<Symbol>) {
        match self {
            Test::Constant(s) | Test::Relation(_, Term::Constant(s)) => out.push(*s),
            Test::Disjunction(syms) => out.extend(syms.iter().copied()),
            Test::Conjunction(tests) => tests.iter().for_each(|t| t.collect_symbols(out)),
            _ => {}
        }
    }

    fn collect_variables<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Test::Variable(v) | Test::Relation(_, Term::Variable(v)) => out.push(v),
            Test::Conjunction(tests) => tests.iter().for_each(|t| t.collect_variables(out)),
            _ => {}
        }
    }
}

/// One `(id ^attr value)` condition element.
#[derive(Debug, Clone, PartialEq)]
pub struct Pattern {
    pub id: Test,
    pub attr: Test,
    pub value: Test,
    /// Matches only acceptable-preference elements (`+`).
    pub acceptable: bool,
    /// Identifier must be a goal state (`state` keyword).
    pub goal: bool,
}

impl Pattern {
    pub fn tests(&self) -> [&Test; 3] {
        [&self.id, &self.attr, &self.value]
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Positive(Pattern),
    Negative(Pattern),
    /// Conjunctive negation `-{ ... }`.
    Conjunctive(Vec<Condition>),
}

impl Condition {
    pub fn is_positive(&self) -> bool {
        matches!(self, Condition::Positive(_))
    }

    /// Every pattern in this condition, depth first.
    pub fn patterns(&self) -> Vec<&Pattern> {
        match self {
            Condition::Positive(p) | Condition::Negative(p) => vec![p],
            Condition::Conjunctive(conds) => conds.iter().flat_map(|c| c.patterns()).collect(),
        }
    }
}

/// Functions callable from a right-hand side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RhsFunction {
    Write,
    Crlf,
    Halt,
    Interrupt,
    Add,
    Subtract,
    Multiply,
    Divide,
    IntDiv,
    Mod,
    Abs,
    Concat,
    MakeConstantSymbol,
    Retrieve,
}

impl RhsFunction {
    pub fn name(self) -> &'static str {
        match self {
            RhsFunction::Write => "write",
            RhsFunction::Crlf => "crlf",
            RhsFunction::Halt => "halt",
            RhsFunction::Interrupt => "interrupt",
            RhsFunction::Add => "+",
            RhsFunction::Subtract => "-",
            RhsFunction::Multiply => "*",
            RhsFunction::Divide => "/",
            RhsFunction::IntDiv => "div",
            RhsFunction::Mod => "mod",
            RhsFunction::Abs => "abs",
            RhsFunction::Concat => "concat",
            RhsFunction::MakeConstantSymbol => "make-constant-symbol",
            RhsFunction::Retrieve => "retrieve",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "write" => RhsFunction::Write,
            "crlf" => RhsFunction::Crlf,
            "halt" => RhsFunction::Halt,
            "interrupt" => RhsFunction::Interrupt,
            "+" => RhsFunction::Add,
            "-" => RhsFunction::Subtract,
            "*" => RhsFunction::Multiply,
            "/" => RhsFunction::Divide,
            "div" => RhsFunction::IntDiv,
            "mod" => RhsFunction::Mod,
            "abs" => RhsFunction::Abs,
            "concat" => RhsFunction::Concat,
            "make-constant-symbol" => RhsFunction::MakeConstantSymbol,
            "retrieve" => RhsFunction::Retrieve,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FunctionCall {
    pub function: RhsFunction,
    pub args: Vec<RhsValue>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RhsValue {
    Constant(Symbol),
    /// Bound by the conditions, or a new identifier when unbound.
    Variable(String),
    Call(FunctionCall),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Make {
        id: RhsValue,
        attr: RhsValue,
        value: RhsValue,
        preference: PreferenceType,
        /// Second value of binary preferences (`>`, `<`, `=`).
        referent: Option<RhsValue>,
    },
    Call(FunctionCall),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Production {
    pub name: String,
    pub doc: Option<String>,
    pub kind: ProductionKind,
    pub support: Option<SupportMode>,
    pub conditions: Vec<Condition>,
    pub actions: Vec<Action>,
}

impl Production {
    /// Every constant symbol the production refers to, with repeats.
    pub fn symbols(&self) -> Vec<Symbol> {
        let mut out = Vec::new();
        for cond in &self.conditions {
            for pattern in cond.patterns() {
                pattern.tests().iter().for_each(|t| t.collect_symbols(&mut out));
            }
        }
        for action in &self.actions {
            match action {
                Action::Make {
                    id,
                    attr,
                    value,
                    referent,
                    ..
                } => {
                    for v in [Some(id), Some(attr), Some(value), referent.as_ref()]
                        .into_iter()
                        .flatten()
                    {
                        collect_rhs_symbols(v, &mut out);
                    }
                }
                Action::Call(call) => {
                    call.args.iter().for_each(|a| collect_rhs_symbols(a, &mut out))
                }
            }
        }
        out
    }

    pub fn retain_symbols(&self, table: &SymbolTable) {
        self.symbols().into_iter().for_each(|s| table.retain(s));
    }

    pub fn release_symbols(&self, table: &SymbolTable) {
        self.symbols().into_iter().for_each(|s| table.release(s));
    }

    /// Variables equality-tested in positive top-level conditions.
    pub fn bound_variables(&self) -> Vec<&str> {
        let mut out = Vec::new();
        for cond in &self.conditions {
            if let Condition::Positive(p) = cond {
                p.tests().iter().for_each(|t| t.collect_variables(&mut out));
            }
        }
        out.sort_unstable();
        out.dedup();
        out
    }

    pub fn positive_count(&self) -> usize {
        self.conditions.iter().filter(|c| c.is_positive()).count()
    }

    /// Printable view; constants are rendered through `symbols`.
    pub fn display<'a>(&'a self, symbols: &'a SymbolTable) -> ProductionDisplay<'a> {
        ProductionDisplay {
            production: self,
            symbols,
        }
    }
}

fn collect_rhs_symbols(value: &RhsValue, out: &mut Vec<Symbol>) {
    match value {
        RhsValue::Constant(s) => out.push(*s),
        RhsValue::Variable(_) => {}
        RhsValue::Call(call) => call.args.iter().for_each(|a| collect_rhs_symbols(a, out)),
    }
}

// ---------------------------------------------------------------------------
// Printing
// ---------------------------------------------------------------------------

pub struct ProductionDisplay<'a> {
    production: &'a Production,
    symbols: &'a SymbolTable,
}

impl ProductionDisplay<'_> {
    fn test(&self, f: &mut fmt::Formatter<'_>, test: &Test) -> fmt::Result {
        match test {
            Test::Blank => Ok(()),
            Test::Constant(s) => write!(f, "{}", self.symbols.render(*s)),
            Test::Variable(v) => write!(f, "<{v}>"),
            Test::Relation(op, term) => {
                write!(f, "{} ", op.as_str())?;
                match term {
                    Term::Constant(s) => write!(f, "{}", self.symbols.render(*s)),
                    Term::Variable(v) => write!(f, "<{v}>"),
                }
            }
            Test::Disjunction(syms) => {
                write!(f, "<<")?;
                for s in syms {
                    write!(f, " {}", self.symbols.render(*s))?;
                }
                write!(f, " >>")
            }
            Test::Conjunction(tests) => {
                write!(f, "{{")?;
                for (i, t) in tests.iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    self.test(f, t)?;
                }
                write!(f, "}}")
            }
        }
    }

    fn pattern(&self, f: &mut fmt::Formatter<'_>, p: &Pattern) -> fmt::Result {
        write!(f, "(")?;
        if p.goal {
            write!(f, "state ")?;
        }
        self.test(f, &p.id)?;
        write!(f, " ^")?;
        self.test(f, &p.attr)?;
        if p.value != Test::Blank {
            write!(f, " ")?;
            self.test(f, &p.value)?;
        }
        if p.acceptable {
            write!(f, " +")?;
        }
        write!(f, ")")
    }

    fn condition(&self, f: &mut fmt::Formatter<'_>, cond: &Condition) -> fmt::Result {
        match cond {
            Condition::Positive(p) => self.pattern(f, p),
            Condition::Negative(p) => {
                write!(f, "-")?;
                self.pattern(f, p)
            }
            Condition::Conjunctive(conds) => {
                write!(f, "-{{")?;
                for (i, c) in conds.iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    self.condition(f, c)?;
                }
                write!(f, "}}")
            }
        }
    }

    fn rhs_value(&self, f: &mut fmt::Formatter<'_>, value: &RhsValue) -> fmt::Result {
        match value {
            RhsValue::Constant(s) => write!(f, "{}", self.symbols.render(*s)),
            RhsValue::Variable(v) => write!(f, "<{v}>"),
            RhsValue::Call(call) => self.call(f, call),
        }
    }

    fn call(&self, f: &mut fmt::Formatter<'_>, call: &FunctionCall) -> fmt::Result {
        write!(f, "({}", call.function.name())?;
        for arg in &call.args {
            write!(f, " ")?;
            self.rhs_value(f, arg)?;
        }
        write!(f, ")")
    }
}

impl fmt::Display for ProductionDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let p = self.production;
        writeln!(f, "sp {{{}", p.name)?;
        if let Some(doc) = &p.doc {
            writeln!(f, "    \"{}\"", doc.replace('"', "\\\""))?;
        }
        match p.kind {
            ProductionKind::Default => writeln!(f, "    :default")?,
            ProductionKind::Chunk => writeln!(f, "    :chunk")?,
            ProductionKind::Justification => writeln!(f, "    :justification")?,
            ProductionKind::User => {}
        }
        match p.support {
            Some(SupportMode::O) => writeln!(f, "    :o-support")?,
            Some(SupportMode::I) => writeln!(f, "    :i-support")?,
            None => {}
        }
        for cond in &p.conditions {
            write!(f, "    ")?;
            self.condition(f, cond)?;
            writeln!(f)?;
        }
        writeln!(f, "    -->")?;
        for action in &p.actions {
            write!(f, "    ")?;
            match action {
                Action::Make {
                    id,
                    attr,
                    value,
                    preference,
                    referent,
                } => {
                    write!(f, "(")?;
                    self.rhs_value(f, id)?;
                    write!(f, " ^")?;
                    self.rhs_value(f, attr)?;
                    write!(f, " ")?;
                    self.rhs_value(f, value)?;
                    write!(f, " {}", preference.symbol())?;
                    if let Some(r) = referent {
                        write!(f, " ")?;
                        self.rhs_value(f, r)?;
                    }
                    write!(f, ")")?;
                }
                Action::Call(call) => self.call(f, call)?,
            }
            writeln!(f)?;
        }
        write!(f, "}}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(src: &str) -> (Production, Production, String) {
        let symbols = SymbolTable::new();
        let first = parse_production(src, &symbols).unwrap();
        let text = first.display(&symbols).to_string();
        let second = parse_production(&text, &symbols).unwrap();
        (first, second, text)
    }

    #[test]
    fn printer_output_parses_to_equal_production() {
        let (a, b, _) = roundtrip(
            "sp {test*rich \"doc \\\"quoted\\\"\" :o-support
                (state <s> ^io.input-link <in> ^count {<c> > 2 <> 10})
                (<in> ^color << red |light blue| >> ^weight <w>)
                -(<s> ^done true)
                -{(<s> ^blocked <b>) (<b> ^by <in>)}
                (<s> ^operator <o> +)
                -->
                (<s> ^total (+ <c> (* <w> 2.5)) ^done true ^operator <o> > <o2>)
                (<s> ^operator <o> = 0.5)
                (write |hello| (crlf))}",
        );
        assert_eq!(a, b);
    }

    #[test]
    fn display_shape() {
        let (_, _, text) = roundtrip("sp {p1 (state <s> ^type state) --> (<s> ^done true)}");
        assert_eq!(
            text,
            "sp {p1\n    (state <s> ^type state)\n    -->\n    (<s> ^done true +)\n}"
        );
    }

    #[test]
    fn symbols_and_bound_variables() {
        let symbols = SymbolTable::new();
        let p = parse_production(
            "sp {p (state <s> ^a <x>) -(<x> ^b c) --> (<s> ^d <x>)}",
            &symbols,
        )
        .unwrap();
        assert_eq!(p.bound_variables(), vec!["s", "x"]);
        let rendered: Vec<String> = p.symbols().into_iter().map(|s| symbols.render(s)).collect();
        assert_eq!(rendered, vec!["a", "b", "c", "d"]);
        assert_eq!(p.positive_count(), 1);
    }

    #[test]
    fn function_names_roundtrip() {
        for f in [
            RhsFunction::Write,
            RhsFunction::Add,
            RhsFunction::IntDiv,
            RhsFunction::MakeConstantSymbol,
            RhsFunction::Retrieve,
        ] {
            assert_eq!(RhsFunction::from_name(f.name()), Some(f));
        }
        assert_eq!(RhsFunction::from_name("launch"), None);
    }
}
