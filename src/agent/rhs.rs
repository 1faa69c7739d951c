//! Right-hand-side evaluation.
//!
//! Turns a production's actions plus one match's variable bindings into
//! preference requests and side effects. Variables the conditions leave
//! unbound become fresh identifiers, one per variable per firing.

use std::collections::HashMap;

use tracing::warn;

use crate::preference::PreferenceType;
use crate::production::{Action, FunctionCall, RhsFunction, RhsValue};
use crate::symbol::{Symbol, SymbolTable, SymbolValue};

/// A preference an action asks for.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct PrefRequest {
    pub id: Symbol,
    pub attr: Symbol,
    pub value: Symbol,
    pub kind: PreferenceType,
    pub referent: Option<Symbol>,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Effect {
    Print(String),
    Halt,
    Interrupt,
    Retrieve { target: Symbol, cue: Symbol },
}

#[derive(Debug, Default)]
pub(crate) struct Outcome {
    pub prefs: Vec<PrefRequest>,
    pub effects: Vec<Effect>,
    /// Identifiers created for unbound variables.
    pub new_ids: Vec<Symbol>,
}

pub(crate) struct RhsEvaluator<'a> {
    symbols: &'a SymbolTable,
    bindings: HashMap<String, Symbol>,
    production: &'a str,
    gensym: &'a mut u64,
    outcome: Outcome,
}

impl<'a> RhsEvaluator<'a> {
    pub fn new(
        symbols: &'a SymbolTable,
        bindings: HashMap<String, Symbol>,
        production: &'a str,
        gensym: &'a mut u64,
    ) -> Self {
        Self {
            symbols,
            bindings,
            production,
            gensym,
            outcome: Outcome::default(),
        }
    }

    /// Evaluate every action in order. Actions whose values cannot be
    /// computed are skipped with a warning.
    pub fn run(mut self, actions: &[Action]) -> Outcome {
        for action in actions {
            match action {
                Action::Make {
                    id,
                    attr,
                    value,
                    preference,
                    referent,
                } => {
                    let Some(id_sym) = self.value(id) else { continue };
                    if !self.symbols.is_identifier(id_sym) {
                        warn!(
                            production = self.production,
                            value = %self.symbols.render(id_sym),
                            "action identifier is not an identifier; skipped"
                        );
                        continue;
                    }
                    let (Some(attr), Some(value)) = (self.value(attr), self.value(value)) else {
                        continue;
                    };
                    let referent = match referent {
                        Some(r) => match self.value(r) {
                            Some(s) => Some(s),
                            None => continue,
                        },
                        None => None,
                    };
                    self.outcome.prefs.push(PrefRequest {
                        id: id_sym,
                        attr,
                        value,
                        kind: *preference,
                        referent,
                    });
                }
                Action::Call(call) => {
                    self.call(call);
                }
            }
        }
        self.outcome
    }

    fn value(&mut self, value: &RhsValue) -> Option<Symbol> {
        match value {
            RhsValue::Constant(s) => Some(*s),
            RhsValue::Variable(name) => Some(self.variable(name)),
            RhsValue::Call(call) => self.call(call),
        }
    }

    fn variable(&mut self, name: &str) -> Symbol {
        if let Some(s) = self.bindings.get(name) {
            return *s;
        }
        let letter = name.chars().next().unwrap_or('I');
        let id = self.symbols.new_identifier(letter);
        self.bindings.insert(name.to_string(), id);
        self.outcome.new_ids.push(id);
        id
    }

    fn args(&mut self, call: &FunctionCall) -> Option<Vec<Symbol>> {
        call.args.iter().map(|a| self.value(a)).collect()
    }

    fn numbers(&self, args: &[Symbol], function: RhsFunction) -> Option<Vec<SymbolValue>> {
        args.iter()
            .map(|a| match self.symbols.value(*a) {
                Some(v @ (SymbolValue::Integer(_) | SymbolValue::Float(_))) => Some(v),
                _ => {
                    warn!(
                        production = self.production,
                        function = function.name(),
                        arg = %self.symbols.render(*a),
                        "non-numeric argument"
                    );
                    None
                }
            })
            .collect()
    }

    fn call(&mut self, call: &FunctionCall) -> Option<Symbol> {
        let args = self.args(call)?;
        let f = call.function;
        match f {
            RhsFunction::Write => {
                let text: String = args.iter().map(|a| self.plain_text(*a)).collect();
                self.outcome.effects.push(Effect::Print(text));
                None
            }
            RhsFunction::Crlf => Some(self.symbols.intern_str("\n")),
            RhsFunction::Halt => {
                self.outcome.effects.push(Effect::Halt);
                None
            }
            RhsFunction::Interrupt => {
                self.outcome.effects.push(Effect::Interrupt);
                None
            }
            RhsFunction::Concat => {
                let text: String = args.iter().map(|a| self.plain_text(*a)).collect();
                Some(self.symbols.intern_str(&text))
            }
            RhsFunction::MakeConstantSymbol => {
                let prefix = args
                    .first()
                    .map(|a| self.plain_text(*a))
                    .unwrap_or_else(|| "constant".to_string());
                loop {
                    *self.gensym += 1;
                    let candidate = format!("{prefix}{}", self.gensym);
                    let sym = self.symbols.intern_str(&candidate);
                    if self.symbols.refcount(sym) == 0 {
                        return Some(sym);
                    }
                }
            }
            RhsFunction::Retrieve => {
                let [target, cue] = args[..] else {
                    warn!(production = self.production, "retrieve takes an identifier and a cue");
                    return None;
                };
                if !self.symbols.is_identifier(target) {
                    warn!(production = self.production, "retrieve target is not an identifier");
                    return None;
                }
                self.outcome.effects.push(Effect::Retrieve { target, cue });
                None
            }
            RhsFunction::Abs => {
                let nums = self.numbers(&args, f)?;
                match nums.as_slice() {
                    [SymbolValue::Integer(i)] => Some(self.symbols.intern_int(i.wrapping_abs())),
                    [SymbolValue::Float(x)] => Some(self.symbols.intern_float(x.abs())),
                    _ => None,
                }
            }
            RhsFunction::Add | RhsFunction::Subtract | RhsFunction::Multiply | RhsFunction::Divide => {
                let nums = self.numbers(&args, f)?;
                self.arithmetic(f, &nums)
            }
            RhsFunction::IntDiv | RhsFunction::Mod => {
                let nums = self.numbers(&args, f)?;
                let [SymbolValue::Integer(a), SymbolValue::Integer(b)] = nums[..] else {
                    warn!(production = self.production, function = f.name(), "expects two integers");
                    return None;
                };
                if b == 0 {
                    warn!(production = self.production, function = f.name(), "division by zero");
                    return None;
                }
                let r = if f == RhsFunction::IntDiv {
                    a.wrapping_div(b)
                } else {
                    a.wrapping_rem(b)
                };
                Some(self.symbols.intern_int(r))
            }
        }
    }

    fn arithmetic(&mut self, f: RhsFunction, nums: &[SymbolValue]) -> Option<Symbol> {
        let all_int = nums.iter().all(|n| matches!(n, SymbolValue::Integer(_)));
        if all_int && f != RhsFunction::Divide {
            let ints: Vec<i64> = nums
                .iter()
                .filter_map(|n| match n {
                    SymbolValue::Integer(i) => Some(*i),
                    _ => None,
                })
                .collect();
            let (first, rest) = ints.split_first()?;
            let r = match f {
                RhsFunction::Add => ints.iter().fold(0i64, |a, b| a.wrapping_add(*b)),
                RhsFunction::Multiply => ints.iter().fold(1i64, |a, b| a.wrapping_mul(*b)),
                RhsFunction::Subtract if rest.is_empty() => first.wrapping_neg(),
                _ => rest.iter().fold(*first, |a, b| a.wrapping_sub(*b)),
            };
            return Some(self.symbols.intern_int(r));
        }
        let floats: Vec<f64> = nums.iter().filter_map(SymbolValue::as_f64).collect();
        let (first, rest) = floats.split_first()?;
        let r = match f {
            RhsFunction::Add => floats.iter().sum(),
            RhsFunction::Multiply => floats.iter().product(),
            RhsFunction::Subtract if rest.is_empty() => -first,
            RhsFunction::Subtract => rest.iter().fold(*first, |a, b| a - b),
            RhsFunction::Divide if rest.is_empty() => 1.0 / first,
            _ => rest.iter().fold(*first, |a, b| a / b),
        };
        if !r.is_finite() {
            warn!(production = self.production, function = f.name(), "non-finite result");
            return None;
        }
        Some(self.symbols.intern_float(r))
    }

    /// Text without the quoting used for printing productions.
    fn plain_text(&self, sym: Symbol) -> String {
        match self.symbols.value(sym) {
            Some(SymbolValue::String(s)) => s,
            _ => self.symbols.render(sym),
        }
    }
}
