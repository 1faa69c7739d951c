//! Recursive-descent parser for `sp {...}` production text.
//!
//! Surface conveniences are expanded while parsing so the resulting
//! [`Production`] holds only one-attribute conditions and one-preference
//! actions:
//!
//! - `(<s> ^a 1 ^b 2)` becomes two conditions on `<s>`.
//! - `^a.b.c v` walks a path through generated variables `<a*1>`, `<b*2>`.
//! - `-^a v` inside a condition becomes a separate negative condition.
//! - `(<s> ^a v + =)` becomes one action per preference.

use crate::error::ParseError;
use crate::preference::PreferenceType;
use crate::symbol::{Symbol, SymbolTable};

use super::lexer::{Token, TokenKind, tokenize};
use super::{
    Action, Condition, FunctionCall, Pattern, Production, ProductionKind, RelOp, RhsFunction,
    RhsValue, SupportMode, Term, Test,
};

/// Parse exactly one production. The leading `sp` is optional.
pub fn parse_production(src: &str, symbols: &SymbolTable) -> Result<Production, ParseError> {
    let mut parser = Parser::new(src, symbols)?;
    let production = parser.production()?;
    if let Some(tok) = parser.peek() {
        return Err(ParseError::unexpected(
            tok.kind.describe(),
            "end of input",
            tok.span.start,
            tok.span.len(),
        ));
    }
    Ok(production)
}

/// Parse any number of productions from one text.
pub fn parse_productions(src: &str, symbols: &SymbolTable) -> Result<Vec<Production>, ParseError> {
    let mut parser = Parser::new(src, symbols)?;
    let mut out = Vec::new();
    while parser.peek().is_some() {
        out.push(parser.production()?);
    }
    Ok(out)
}

struct Parser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    src_len: usize,
    symbols: &'a SymbolTable,
    gensym: u32,
}

impl<'a> Parser<'a> {
    fn new(src: &str, symbols: &'a SymbolTable) -> Result<Self, ParseError> {
        Ok(Self {
            tokens: tokenize(src)?,
            pos: 0,
            src_len: src.len(),
            symbols,
            gensym: 0,
        })
    }

    // -----------------------------------------------------------------------
    // Token plumbing
    // -----------------------------------------------------------------------

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn peek_kind(&self) -> Option<&TokenKind> {
        self.peek().map(|t| &t.kind)
    }

    fn peek_kind_at(&self, offset: usize) -> Option<&TokenKind> {
        self.tokens.get(self.pos + offset).map(|t| &t.kind)
    }

    fn next(&mut self, expected: &str) -> Result<Token, ParseError> {
        match self.tokens.get(self.pos) {
            Some(tok) => {
                self.pos += 1;
                Ok(tok.clone())
            }
            None => Err(ParseError::eof(expected, self.src_len)),
        }
    }

    fn eat(&mut self, kind: &TokenKind) -> bool {
        if self.peek_kind() == Some(kind) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: TokenKind) -> Result<Token, ParseError> {
        let tok = self.next(&kind.describe())?;
        if tok.kind == kind {
            Ok(tok)
        } else {
            Err(unexpected(&tok, &kind.describe()))
        }
    }

    fn fresh_variable(&mut self, stem: &str) -> String {
        self.gensym += 1;
        let stem: String = stem
            .chars()
            .filter(|c| crate::symbol::is_constituent(*c) && *c != '*')
            .collect();
        let stem = if stem.is_empty() { "v".to_string() } else { stem };
        format!("{stem}*{}", self.gensym)
    }

    fn constant(&self, kind: &TokenKind) -> Option<Symbol> {
        match kind {
            TokenKind::Symbol(text) => Some(self.symbols.intern_literal(text)),
            TokenKind::Quoted(text) => Some(self.symbols.intern_str(text)),
            _ => None,
        }
    }

    // -----------------------------------------------------------------------
    // Production header
    // -----------------------------------------------------------------------

    fn production(&mut self) -> Result<Production, ParseError> {
        self.gensym = 0;
        if matches!(self.peek_kind(), Some(TokenKind::Symbol(s)) if s == "sp") {
            self.pos += 1;
        }
        self.expect(TokenKind::LBrace)?;
        let name_tok = self.next("production name")?;
        let name = match &name_tok.kind {
            TokenKind::Symbol(s) | TokenKind::Quoted(s) => s.clone(),
            _ => return Err(unexpected(&name_tok, "production name")),
        };

        let mut doc = None;
        let mut kind = ProductionKind::User;
        let mut support = None;
        loop {
            match self.peek_kind() {
                Some(TokenKind::Doc(text)) => {
                    doc = Some(text.clone());
                    self.pos += 1;
                }
                Some(TokenKind::Flag(_)) => {
                    let tok = self.next("flag")?;
                    let TokenKind::Flag(flag) = &tok.kind else {
                        unreachable!("peeked a flag");
                    };
                    match flag.as_str() {
                        "o-support" => support = Some(SupportMode::O),
                        "i-support" => support = Some(SupportMode::I),
                        "default" => kind = ProductionKind::Default,
                        "chunk" => kind = ProductionKind::Chunk,
                        "justification" => kind = ProductionKind::Justification,
                        _ => {
                            return Err(unexpected(
                                &tok,
                                ":o-support, :i-support, :default, :chunk or :justification",
                            ));
                        }
                    }
                }
                _ => break,
            }
        }

        let mut conditions = Vec::new();
        while !self.eat(&TokenKind::Arrow) {
            self.condition(&mut conditions)?;
        }
        let mut actions = Vec::new();
        while !self.eat(&TokenKind::RBrace) {
            self.action(&mut actions)?;
        }

        Ok(Production {
            name,
            doc,
            kind,
            support,
            conditions,
            actions,
        })
    }

    // -----------------------------------------------------------------------
    // Conditions
    // -----------------------------------------------------------------------

    fn condition(&mut self, out: &mut Vec<Condition>) -> Result<(), ParseError> {
        let tok = self.next("condition or `-->`")?;
        match tok.kind {
            TokenKind::Minus => {
                let inner = self.next("`(` or `{` after `-`")?;
                let mut conds = Vec::new();
                match inner.kind {
                    TokenKind::LParen => self.pattern(&mut conds)?,
                    TokenKind::LBrace => {
                        while !self.eat(&TokenKind::RBrace) {
                            self.condition(&mut conds)?;
                        }
                    }
                    _ => return Err(unexpected(&inner, "`(` or `{` after `-`")),
                }
                out.push(negate(conds));
                Ok(())
            }
            TokenKind::LParen => self.pattern(out),
            TokenKind::LBrace => {
                while !self.eat(&TokenKind::RBrace) {
                    self.condition(out)?;
                }
                Ok(())
            }
            _ => Err(unexpected(&tok, "condition or `-->`")),
        }
    }

    /// Parse the body of `( ... )`, the opening paren already consumed.
    fn pattern(&mut self, out: &mut Vec<Condition>) -> Result<(), ParseError> {
        let mut goal = false;
        if matches!(self.peek_kind(), Some(TokenKind::Symbol(s)) if s == "state" || s == "impasse")
            && !matches!(self.peek_kind_at(1), Some(TokenKind::Caret) | Some(TokenKind::RParen))
        {
            goal = true;
            self.pos += 1;
        }
        let id_start = self.peek().map(|t| (t.span.start, t.span.len()));
        let id_test = self.test()?;
        let Some(id_var) = id_test.variable().map(str::to_string) else {
            let (offset, len) = id_start.unwrap_or((self.src_len, 0));
            return Err(ParseError::unexpected(
                "identifier test without a variable",
                "identifier variable such as <s>",
                offset,
                len,
            ));
        };

        let mut first = Some(id_test);
        let mut any = false;
        while !self.eat(&TokenKind::RParen) {
            let negated = self.eat(&TokenKind::Minus);
            self.expect(TokenKind::Caret)?;
            let mut path = vec![self.test()?];
            while self.eat(&TokenKind::Dot) {
                path.push(self.test()?);
            }
            let value = match self.peek_kind() {
                Some(TokenKind::Caret) | Some(TokenKind::RParen) | None => Test::Blank,
                Some(TokenKind::Minus) if matches!(self.peek_kind_at(1), Some(TokenKind::Caret)) => {
                    Test::Blank
                }
                _ => self.test()?,
            };
            let acceptable = self.eat(&TokenKind::Plus);

            let id = first.take().unwrap_or_else(|| Test::Variable(id_var.clone()));
            let is_goal = goal && !any;
            any = true;

            let mut conds = Vec::new();
            let mut current = id;
            let last = path.len() - 1;
            for (i, attr) in path.into_iter().enumerate() {
                if i < last {
                    let stem = match &attr {
                        Test::Constant(s) => self.symbols.render(*s),
                        _ => "v".to_string(),
                    };
                    let next_var = self.fresh_variable(&stem);
                    conds.push(Condition::Positive(Pattern {
                        id: current,
                        attr,
                        value: Test::Variable(next_var.clone()),
                        acceptable: false,
                        goal: is_goal && i == 0,
                    }));
                    current = Test::Variable(next_var);
                } else {
                    conds.push(Condition::Positive(Pattern {
                        id: current.clone(),
                        attr,
                        value: value.clone(),
                        acceptable,
                        goal: is_goal && i == 0,
                    }));
                }
            }
            if negated {
                out.push(negate(conds));
            } else {
                out.extend(conds);
            }
        }
        if !any {
            let (offset, len) = self
                .tokens
                .get(self.pos.saturating_sub(1))
                .map(|t| (t.span.start, t.span.len()))
                .unwrap_or((self.src_len, 0));
            return Err(ParseError::unexpected("`)`", "attribute test `^attr`", offset, len));
        }
        Ok(())
    }

    fn test(&mut self) -> Result<Test, ParseError> {
        let tok = self.next("test")?;
        match &tok.kind {
            TokenKind::LBrace => {
                let mut tests = Vec::new();
                while !self.eat(&TokenKind::RBrace) {
                    match self.test()? {
                        Test::Conjunction(inner) => tests.extend(inner),
                        t => tests.push(t),
                    }
                }
                match tests.len() {
                    0 => Err(unexpected(&tok, "at least one test inside `{ }`")),
                    1 => Ok(tests.remove(0)),
                    _ => Ok(Test::Conjunction(tests)),
                }
            }
            TokenKind::DisjOpen => {
                let mut values = Vec::new();
                while !self.eat(&TokenKind::DisjClose) {
                    let t = self.next("constant or `>>`")?;
                    match self.constant(&t.kind) {
                        Some(s) => values.push(s),
                        None => return Err(unexpected(&t, "constant or `>>`")),
                    }
                }
                Ok(Test::Disjunction(values))
            }
            TokenKind::Equal => match self.term()? {
                Term::Constant(s) => Ok(Test::Constant(s)),
                Term::Variable(v) => Ok(Test::Variable(v)),
            },
            TokenKind::NotEqual => Ok(Test::Relation(RelOp::NotEqual, self.term()?)),
            TokenKind::Less => Ok(Test::Relation(RelOp::Less, self.term()?)),
            TokenKind::Greater => Ok(Test::Relation(RelOp::Greater, self.term()?)),
            TokenKind::LessEqual => Ok(Test::Relation(RelOp::LessEqual, self.term()?)),
            TokenKind::GreaterEqual => Ok(Test::Relation(RelOp::GreaterEqual, self.term()?)),
            TokenKind::SameType => Ok(Test::Relation(RelOp::SameType, self.term()?)),
            TokenKind::Variable(v) => Ok(Test::Variable(v.clone())),
            kind => match self.constant(kind) {
                Some(s) => Ok(Test::Constant(s)),
                None => Err(unexpected(&tok, "test")),
            },
        }
    }

    fn term(&mut self) -> Result<Term, ParseError> {
        let tok = self.next("variable or constant")?;
        match &tok.kind {
            TokenKind::Variable(v) => Ok(Term::Variable(v.clone())),
            kind => self
                .constant(kind)
                .map(Term::Constant)
                .ok_or_else(|| unexpected(&tok, "variable or constant")),
        }
    }

    // -----------------------------------------------------------------------
    // Actions
    // -----------------------------------------------------------------------

    fn action(&mut self, out: &mut Vec<Action>) -> Result<(), ParseError> {
        self.expect(TokenKind::LParen)?;
        let head = self.next("action")?;
        let id = match &head.kind {
            TokenKind::Variable(v) => v.clone(),
            _ => {
                let call = self.call_after_paren(head)?;
                out.push(Action::Call(call));
                return Ok(());
            }
        };

        let mut any = false;
        while !self.eat(&TokenKind::RParen) {
            self.expect(TokenKind::Caret)?;
            any = true;
            let mut path = vec![self.rhs_value()?];
            while self.eat(&TokenKind::Dot) {
                path.push(self.rhs_value()?);
            }

            // Intermediate path elements get fresh (unbound) variables, which
            // the agent turns into new identifiers.
            let mut current = RhsValue::Variable(id.clone());
            let last = path.len() - 1;
            let mut attr = None;
            for (i, element) in path.into_iter().enumerate() {
                if i < last {
                    let stem = match &element {
                        RhsValue::Constant(s) => self.symbols.render(*s),
                        _ => "v".to_string(),
                    };
                    let next_var = RhsValue::Variable(self.fresh_variable(&stem));
                    out.push(Action::Make {
                        id: current,
                        attr: element,
                        value: next_var.clone(),
                        preference: PreferenceType::Acceptable,
                        referent: None,
                    });
                    current = next_var;
                } else {
                    attr = Some(element);
                }
            }
            let attr = attr.unwrap_or(RhsValue::Variable(id.clone()));

            let mut values = 0;
            while !matches!(self.peek_kind(), Some(TokenKind::Caret) | Some(TokenKind::RParen)) {
                let value = self.rhs_value()?;
                values += 1;
                let prefs = self.preferences()?;
                if prefs.is_empty() {
                    out.push(Action::Make {
                        id: current.clone(),
                        attr: attr.clone(),
                        value,
                        preference: PreferenceType::Acceptable,
                        referent: None,
                    });
                } else {
                    for (preference, referent) in prefs {
                        out.push(Action::Make {
                            id: current.clone(),
                            attr: attr.clone(),
                            value: value.clone(),
                            preference,
                            referent,
                        });
                    }
                }
            }
            if values == 0 {
                let tok = self.next("value")?;
                return Err(unexpected(&tok, "value"));
            }
        }
        if !any {
            let tok = &self.tokens[self.pos - 1];
            return Err(unexpected(tok, "`^attr value`"));
        }
        Ok(())
    }

    fn starts_value(&self) -> bool {
        matches!(
            self.peek_kind(),
            Some(TokenKind::Variable(_))
                | Some(TokenKind::Symbol(_))
                | Some(TokenKind::Quoted(_))
                | Some(TokenKind::LParen)
        )
    }

    fn preferences(&mut self) -> Result<Vec<(PreferenceType, Option<RhsValue>)>, ParseError> {
        let mut prefs = Vec::new();
        loop {
            let pref = match self.peek_kind() {
                Some(TokenKind::Plus) => (PreferenceType::Acceptable, false),
                Some(TokenKind::Minus) => (PreferenceType::Reject, false),
                Some(TokenKind::Bang) => (PreferenceType::Require, false),
                Some(TokenKind::Tilde) => (PreferenceType::Prohibit, false),
                Some(TokenKind::Greater) => (PreferenceType::Best, true),
                Some(TokenKind::Less) => (PreferenceType::Worst, true),
                Some(TokenKind::Equal) => (PreferenceType::UnaryIndifferent, true),
                _ => break,
            };
            self.pos += 1;
            let (unary, can_be_binary) = pref;
            if can_be_binary && self.starts_value() {
                let referent = self.rhs_value()?;
                let binary = match unary {
                    PreferenceType::Best => PreferenceType::Better,
                    PreferenceType::Worst => PreferenceType::Worse,
                    _ => PreferenceType::BinaryIndifferent,
                };
                prefs.push((binary, Some(referent)));
            } else {
                prefs.push((unary, None));
            }
        }
        Ok(prefs)
    }

    fn rhs_value(&mut self) -> Result<RhsValue, ParseError> {
        let tok = self.next("value")?;
        match &tok.kind {
            TokenKind::Variable(v) => Ok(RhsValue::Variable(v.clone())),
            TokenKind::LParen => {
                let head = self.next("function name")?;
                Ok(RhsValue::Call(self.call_after_paren(head)?))
            }
            kind => self
                .constant(kind)
                .map(RhsValue::Constant)
                .ok_or_else(|| unexpected(&tok, "value")),
        }
    }

    /// Parse a function call whose `(` and name token are already consumed.
    fn call_after_paren(&mut self, head: Token) -> Result<FunctionCall, ParseError> {
        let name = match &head.kind {
            TokenKind::Symbol(s) => s.clone(),
            TokenKind::Plus => "+".to_string(),
            TokenKind::Minus => "-".to_string(),
            _ => return Err(unexpected(&head, "action variable or function name")),
        };
        let function = RhsFunction::from_name(&name).ok_or_else(|| ParseError::UnknownFunction {
            name: name.clone(),
            offset: head.span.start,
            span: (head.span.start, head.span.len()).into(),
        })?;
        let mut args = Vec::new();
        while !self.eat(&TokenKind::RParen) {
            args.push(self.rhs_value()?);
        }
        Ok(FunctionCall { function, args })
    }
}

fn negate(mut conds: Vec<Condition>) -> Condition {
    if conds.len() == 1 {
        if let Condition::Positive(p) = &conds[0] {
            return Condition::Negative(p.clone());
        }
        if let Condition::Negative(_) | Condition::Conjunctive(_) = &conds[0] {
            return Condition::Conjunctive(vec![conds.remove(0)]);
        }
    }
    Condition::Conjunctive(conds)
}

fn unexpected(tok: &Token, expected: &str) -> ParseError {
    ParseError::unexpected(tok.kind.describe(), expected, tok.span.start, tok.span.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(src: &str) -> (SymbolTable, Production) {
        let symbols = SymbolTable::new();
        let p = parse_production(src, &symbols).unwrap();
        (symbols, p)
    }

    #[test]
    fn multi_attribute_pattern_expands() {
        let (_, p) = parse("sp {p (state <s> ^a 1 ^b <x>) --> (<s> ^c <x>)}");
        assert_eq!(p.conditions.len(), 2);
        let Condition::Positive(first) = &p.conditions[0] else {
            panic!("expected positive");
        };
        let Condition::Positive(second) = &p.conditions[1] else {
            panic!("expected positive");
        };
        assert!(first.goal);
        assert!(!second.goal);
        assert_eq!(second.id, Test::Variable("s".into()));
    }

    #[test]
    fn path_expands_through_generated_variables() {
        let (symbols, p) = parse("sp {p (state <s> ^io.input-link <in>) --> (<s> ^x y)}");
        assert_eq!(p.conditions.len(), 2);
        let Condition::Positive(first) = &p.conditions[0] else {
            panic!();
        };
        assert_eq!(first.attr, Test::Constant(symbols.intern_str("io")));
        assert_eq!(first.value, Test::Variable("io*1".into()));
    }

    #[test]
    fn negated_attribute_becomes_negative_condition() {
        let (_, p) = parse("sp {p (state <s> ^type state -^done) --> (<s> ^done true)}");
        assert!(matches!(&p.conditions[1], Condition::Negative(n) if n.value == Test::Blank));
    }

    #[test]
    fn conjunctive_negation() {
        let (_, p) = parse("sp {p (state <s>^a <x>) -{(<x> ^b <y>) (<y> ^c d)} --> (<s> ^e f)}");
        assert!(matches!(&p.conditions[1], Condition::Conjunctive(c) if c.len() == 2));
    }

    #[test]
    fn preferences_and_referents() {
        let (_, p) = parse(
            "sp {p (state <s> ^operator <a> + ^operator <b> +) --> (<s> ^operator <a> > <b> = ) (<s> ^operator <b> ! ~ -)}",
        );
        let kinds: Vec<PreferenceType> = p
            .actions
            .iter()
            .map(|a| match a {
                Action::Make { preference, .. } => *preference,
                Action::Call(_) => panic!(),
            })
            .collect();
        assert_eq!(
            kinds,
            vec![
                PreferenceType::Better,
                PreferenceType::UnaryIndifferent,
                PreferenceType::Require,
                PreferenceType::Prohibit,
                PreferenceType::Reject,
            ]
        );
    }

    #[test]
    fn nested_function_calls() {
        let (_, p) = parse("sp {p (state <s> ^n <n>) --> (<s> ^m (+ <n> (* 2 3))) (write (crlf) |done|)}");
        assert!(matches!(
            &p.actions[0],
            Action::Make { value: RhsValue::Call(FunctionCall { function: RhsFunction::Add, args }), .. }
                if args.len() == 2
        ));
        assert!(matches!(&p.actions[1], Action::Call(c) if c.function == RhsFunction::Write));
    }

    #[test]
    fn flags_and_doc() {
        let (_, p) = parse("sp {p \"docs\" :o-support :default (state <s> ^a b) --> (<s> ^c d)}");
        assert_eq!(p.doc.as_deref(), Some("docs"));
        assert_eq!(p.support, Some(SupportMode::O));
        assert_eq!(p.kind, ProductionKind::Default);
    }

    #[test]
    fn error_offsets_point_at_problem() {
        let symbols = SymbolTable::new();
        let src = "sp {p (state <s> ^a b) --> (<s> ^c d) (launch 1)}";
        let err = parse_production(src, &symbols).unwrap_err();
        assert_eq!(err.offset(), src.find("launch").unwrap());

        let src = "sp {p (state <s> ^a) (^b c) --> }";
        let err = parse_production(src, &symbols).unwrap_err();
        assert_eq!(err.offset(), src.find("^b").unwrap());

        let err = parse_production("sp {p (state <s> ^a b)", &symbols).unwrap_err();
        assert!(matches!(err, ParseError::UnexpectedEof { .. }));
    }

    #[test]
    fn several_productions() {
        let symbols = SymbolTable::new();
        let ps = parse_productions(
            "sp {a (state <s> ^x 1) --> (<s> ^y 2)}\n# comment\nsp {b (state <s> ^y 2) --> (<s> ^z 3)}",
            &symbols,
        )
        .unwrap();
        assert_eq!(ps.len(), 2);
        assert_eq!(ps[1].name, "b");
    }
}
