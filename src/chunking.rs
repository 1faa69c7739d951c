//! Chunking: compiling a subgoal's results into a production.
//!
//! When a goal is removed, the instantiations that created its results are
//! traced back to the superstate elements they ultimately tested (the
//! grounds). The grounds become the conditions, the results the actions,
//! and identifiers are replaced with variables. A rule that would not be
//! safe to match on its own is kept as a justification instead.

use std::collections::{HashMap, HashSet};

use tracing::{debug, info, warn};

use crate::agent::{Agent, PrefId};
use crate::event::AgentEvent;
use crate::preference::Preference;
use crate::production::{
    Action, Condition, Pattern, Production, ProductionKind, RhsValue, SupportMode, Term, Test,
};
use crate::symbol::{Symbol, SymbolTable, SymbolValue};
use crate::wme::{Wme, WmeOrigin};

/// What a goal's results rest on.
#[derive(Debug, Default)]
pub(crate) struct Trace {
    /// Superstate elements reached by backtracing, in timetag order.
    pub grounds: Vec<Wme>,
    /// Negated conditions that only test superstate identifiers, with
    /// bound variables replaced by the identifiers they matched.
    pub negations: Vec<Condition>,
    /// Some instantiation on the way had already been freed.
    pub stale: bool,
}

/// Trace the results of the goal at `level` back to their grounds.
pub(crate) fn backtrace(agent: &Agent, level: usize, results: &[PrefId]) -> Trace {
    let mut trace = Trace::default();
    let mut seen_insts = HashSet::new();
    let mut seen_wmes = HashSet::new();
    let mut queue: Vec<_> = results
        .iter()
        .filter_map(|pid| agent.prefs.get(pid).and_then(|r| r.inst))
        .collect();

    while let Some(h) = queue.pop() {
        if !seen_insts.insert(h) {
            continue;
        }
        let Some(inst) = agent.instantiations.get(h) else {
            warn!(level, "backtrace reached a freed instantiation");
            trace.stale = true;
            continue;
        };
        for m in &inst.wmes {
            if !seen_wmes.insert(m.wme.timetag) {
                continue;
            }
            if agent.level_of(m.wme.id) < level {
                trace.grounds.push(m.wme);
                continue;
            }
            if let Some(proposal) = item_proposal(agent, &m.wme) {
                if seen_wmes.insert(proposal.timetag) {
                    trace.grounds.push(proposal);
                }
                continue;
            }
            for p in &m.producers {
                if agent.instantiations.contains(*p) {
                    queue.push(*p);
                } else {
                    warn!(level, "backtrace reached a freed instantiation");
                    trace.stale = true;
                }
            }
        }

        let Some(loaded) = inst.production.and_then(|id| agent.productions.get(&id)) else {
            continue;
        };
        let suffix = h.index().to_string();
        for cond in loaded.production.conditions.iter().filter(|c| !c.is_positive()) {
            let grounded = instantiate_condition(cond, &inst.bindings, &suffix);
            let mut ids = Vec::new();
            condition_identifiers(&grounded, &agent.symbols, &mut ids);
            if ids.iter().all(|id| agent.level_of(*id) < level)
                && !trace.negations.contains(&grounded)
            {
                trace.negations.push(grounded);
            }
        }
    }

    trace.grounds.sort_by_key(|w| w.timetag);
    trace
}

/// For an impasse's `^item` element, the acceptable-preference element in
/// the superstate that proposed that item.
fn item_proposal(agent: &Agent, wme: &Wme) -> Option<Wme> {
    if wme.attr != agent.vocab.item
        || agent.wm.get(wme.timetag)?.origin != WmeOrigin::Architecture
    {
        return None;
    }
    let idx = agent.goals.iter().position(|g| g.state == wme.id)?;
    let superstate = agent.goals.get(idx.checked_sub(1)?)?.state;
    let tt = agent
        .wm
        .find(superstate, agent.vocab.operator, wme.value, true)?;
    agent.wm.get(tt).map(|e| e.wme)
}

fn instantiate_condition(
    cond: &Condition,
    bindings: &HashMap<String, Symbol>,
    suffix: &str,
) -> Condition {
    let pattern = |p: &Pattern| Pattern {
        id: instantiate_test(&p.id, bindings, suffix),
        attr: instantiate_test(&p.attr, bindings, suffix),
        value: instantiate_test(&p.value, bindings, suffix),
        acceptable: p.acceptable,
        goal: false,
    };
    match cond {
        Condition::Positive(p) => Condition::Positive(pattern(p)),
        Condition::Negative(p) => Condition::Negative(pattern(p)),
        Condition::Conjunctive(conds) => Condition::Conjunctive(
            conds
                .iter()
                .map(|c| instantiate_condition(c, bindings, suffix))
                .collect(),
        ),
    }
}

fn instantiate_test(test: &Test, bindings: &HashMap<String, Symbol>, suffix: &str) -> Test {
    match test {
        Test::Variable(v) => match bindings.get(v) {
            Some(s) => Test::Constant(*s),
            None => Test::Variable(format!("{v}*{suffix}")),
        },
        Test::Relation(op, Term::Variable(v)) => match bindings.get(v) {
            Some(s) => Test::Relation(*op, Term::Constant(*s)),
            None => Test::Relation(*op, Term::Variable(format!("{v}*{suffix}"))),
        },
        Test::Conjunction(tests) => Test::Conjunction(
            tests
                .iter()
                .map(|t| instantiate_test(t, bindings, suffix))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn condition_identifiers(cond: &Condition, symbols: &SymbolTable, out: &mut Vec<Symbol>) {
    for p in cond.patterns() {
        for t in p.tests() {
            test_identifiers(t, symbols, out);
        }
    }
}

fn test_identifiers(test: &Test, symbols: &SymbolTable, out: &mut Vec<Symbol>) {
    match test {
        Test::Constant(s) | Test::Relation(_, Term::Constant(s)) if symbols.is_identifier(*s) => {
            out.push(*s)
        }
        Test::Conjunction(tests) => tests.iter().for_each(|t| test_identifiers(t, symbols, out)),
        _ => {}
    }
}

// ---------------------------------------------------------------------------
// Variablization
// ---------------------------------------------------------------------------

/// Identifier-to-variable map. The n-th distinct identifier with letter
/// `S` becomes `<sn>`.
#[derive(Default)]
struct Variablizer {
    names: HashMap<Symbol, String>,
    counters: HashMap<char, u32>,
}

impl Variablizer {
    fn bind(&mut self, sym: Symbol, symbols: &SymbolTable) -> String {
        if let Some(name) = self.names.get(&sym) {
            return name.clone();
        }
        let letter = match symbols.value(sym) {
            Some(SymbolValue::Identifier { letter, .. }) => letter.to_ascii_lowercase(),
            _ => 'x',
        };
        let n = self.counters.entry(letter).or_default();
        *n += 1;
        let name = format!("{letter}{n}");
        self.names.insert(sym, name.clone());
        name
    }

    fn test(&mut self, sym: Symbol, symbols: &SymbolTable) -> Test {
        if symbols.is_identifier(sym) {
            Test::Variable(self.bind(sym, symbols))
        } else {
            Test::Constant(sym)
        }
    }

    fn rhs(&mut self, sym: Symbol, symbols: &SymbolTable) -> RhsValue {
        if symbols.is_identifier(sym) {
            RhsValue::Variable(self.bind(sym, symbols))
        } else {
            RhsValue::Constant(sym)
        }
    }

    /// Variablize a grounded negation. `None` if it mentions an identifier
    /// the positive conditions do not bind.
    fn negation(&self, cond: &Condition, symbols: &SymbolTable) -> Option<Condition> {
        let pattern = |p: &Pattern| -> Option<Pattern> {
            Some(Pattern {
                id: self.existing(&p.id, symbols)?,
                attr: self.existing(&p.attr, symbols)?,
                value: self.existing(&p.value, symbols)?,
                acceptable: p.acceptable,
                goal: false,
            })
        };
        Some(match cond {
            Condition::Positive(p) => Condition::Positive(pattern(p)?),
            Condition::Negative(p) => Condition::Negative(pattern(p)?),
            Condition::Conjunctive(conds) => Condition::Conjunctive(
                conds
                    .iter()
                    .map(|c| self.negation(c, symbols))
                    .collect::<Option<Vec<_>>>()?,
            ),
        })
    }

    fn existing(&self, test: &Test, symbols: &SymbolTable) -> Option<Test> {
        let var = |s: &Symbol| self.names.get(s).cloned();
        Some(match test {
            Test::Constant(s) if symbols.is_identifier(*s) => Test::Variable(var(s)?),
            Test::Relation(op, Term::Constant(s)) if symbols.is_identifier(*s) => {
                Test::Relation(*op, Term::Variable(var(s)?))
            }
            Test::Conjunction(tests) => Test::Conjunction(
                tests
                    .iter()
                    .map(|t| self.existing(t, symbols))
                    .collect::<Option<Vec<_>>>()?,
            ),
            other => other.clone(),
        })
    }

    fn contains(&self, sym: Symbol) -> bool {
        self.names.contains_key(&sym)
    }
}

// ---------------------------------------------------------------------------
// Building
// ---------------------------------------------------------------------------

/// Compile the results of the goal at `level` and load the rule, or keep it
/// as a justification.
pub(crate) fn learn(agent: &mut Agent, level: usize, results: &[PrefId], trace: &Trace) {
    let Some(goal) = agent.goals.get(level - 1) else {
        return;
    };
    let impasse = goal.impasse.as_ref().map_or("none", |i| i.kind.name());
    let prefs: Vec<Preference> = results
        .iter()
        .filter_map(|pid| agent.prefs.get(pid).map(|r| r.pref))
        .collect();
    if prefs.is_empty() {
        return;
    }
    let symbols = &agent.symbols;

    let mut vars = Variablizer::default();
    let mut goal_ids = HashSet::new();
    let mut conditions = Vec::with_capacity(trace.grounds.len());
    for w in &trace.grounds {
        let goal = agent.rete.is_goal(w.id) && goal_ids.insert(w.id);
        conditions.push(Condition::Positive(Pattern {
            id: vars.test(w.id, symbols),
            attr: vars.test(w.attr, symbols),
            value: vars.test(w.value, symbols),
            acceptable: w.acceptable,
            goal,
        }));
    }
    let lhs_ids: HashSet<Symbol> = vars.names.keys().copied().collect();
    for neg in &trace.negations {
        match vars.negation(neg, symbols) {
            Some(c) => conditions.push(c),
            None => debug!(level, "negation tests an unbound identifier; dropped"),
        }
    }

    let disconnected = !connected(&trace.grounds, &goal_ids);
    let unlinked = !results_linked(&prefs, &lhs_ids, symbols);

    let mut actions = Vec::with_capacity(prefs.len());
    for p in &prefs {
        actions.push(Action::Make {
            id: vars.rhs(p.id, symbols),
            attr: vars.rhs(p.attr, symbols),
            value: vars.rhs(p.value, symbols),
            preference: p.kind,
            referent: p.referent.map(|r| vars.rhs(r, symbols)),
        });
    }

    let justification = trace.stale
        || trace.grounds.is_empty()
        || goal_ids.is_empty()
        || disconnected
        || unlinked;
    let support = if prefs.iter().any(|p| p.o_supported) {
        SupportMode::O
    } else {
        SupportMode::I
    };
    let mut production = Production {
        name: String::new(),
        doc: None,
        kind: if justification {
            ProductionKind::Justification
        } else {
            ProductionKind::Chunk
        },
        support: Some(support),
        conditions,
        actions,
    };
    let signature = production.display(symbols).to_string();
    if agent.chunk_signatures.contains_key(&signature) {
        debug!(level, "identical rule already learned");
        return;
    }

    agent.chunk_counter += 1;
    let prefix = if justification { "justify" } else { "chunk" };
    production.name = format!(
        "{prefix}-{}*d{}*{impasse}*{level}",
        agent.chunk_counter, agent.stats.decisions
    );
    let name = production.name.clone();
    let text = production.display(&agent.symbols).to_string();
    agent.chunk_signatures.insert(signature, name.clone());

    let mut kept_as_justification = justification;
    if !justification {
        if let Err(e) = agent.add_production(production.clone()) {
            warn!(chunk = %name, error = %e, "chunk rejected; kept as justification");
            production.kind = ProductionKind::Justification;
            kept_as_justification = true;
        }
    }
    if kept_as_justification {
        production.retain_symbols(&agent.symbols);
        agent.justifications.push(production);
        agent.stats.justifications += 1;
    } else {
        agent.stats.chunks += 1;
    }
    info!(rule = %name, justification = kept_as_justification, "learned");
    agent.publish(|_| AgentEvent::ChunkLearned {
        name,
        justification: kept_as_justification,
        text,
    });
}

/// Every condition's identifier is a goal or reachable from one through
/// the values of other conditions.
fn connected(grounds: &[Wme], goal_ids: &HashSet<Symbol>) -> bool {
    let mut reached: HashSet<Symbol> = goal_ids.clone();
    loop {
        let before = reached.len();
        for w in grounds {
            if reached.contains(&w.id) {
                reached.insert(w.value);
            }
        }
        if reached.len() == before {
            break;
        }
    }
    grounds.iter().all(|w| reached.contains(&w.id))
}

/// Every result's identifier is tested on the left or hangs off another
/// result that is.
fn results_linked(prefs: &[Preference], lhs_ids: &HashSet<Symbol>, symbols: &SymbolTable) -> bool {
    let mut linked = lhs_ids.clone();
    loop {
        let before = linked.len();
        for p in prefs {
            if linked.contains(&p.id) {
                for s in [Some(p.value), p.referent].into_iter().flatten() {
                    if symbols.is_identifier(s) {
                        linked.insert(s);
                    }
                }
            }
        }
        if linked.len() == before {
            break;
        }
    }
    prefs.iter().all(|p| linked.contains(&p.id))
}

#[cfg(test)]
mod tests {
    use crate::agent::{Agent, RunUnit};
    use crate::config::{AgentConfig, ExplorationPolicy};
    use crate::production::ProductionKind;

    const TIE: &str = r#"
        sp {propose*a (state <s> ^superstate nil -^done) --> (<s> ^operator <o> +) (<o> ^name a)}
        sp {propose*b (state <s> ^superstate nil -^done) --> (<s> ^operator <o> +) (<o> ^name b)}
        sp {tie*prefer-a
            (state <s> ^impasse tie ^superstate <ss> ^item <o>)
            (<o> ^name a)
            -->
            (<ss> ^operator <o> >)}
    "#;

    fn learner(learning: bool) -> Agent {
        let config = AgentConfig {
            learning,
            worker_threads: 0,
            exploration: ExplorationPolicy::First,
            ..AgentConfig::default()
        };
        let mut agent = Agent::new(config).unwrap();
        agent.load_productions(TIE).unwrap();
        agent
    }

    #[test]
    fn tie_resolution_becomes_a_chunk() {
        let mut a = learner(true);
        a.run(2, RunUnit::Decision).unwrap();
        let chunks = a.productions_of_kind(ProductionKind::Chunk);
        assert_eq!(chunks.len(), 1, "justifications: {:?}", a.justifications());
        assert!(chunks[0].starts_with("chunk-1*d2*tie*2"));

        let text = a.production_text(&chunks[0]).unwrap();
        // The proposal is a superstate element, so its own conditions are
        // not traced further.
        assert!(text.contains("(state <s1> ^operator <o1> +)"), "{text}");
        assert!(text.contains("(<o1> ^name a)"), "{text}");
        assert!(text.contains("(<s1> ^operator <o1> >)"), "{text}");
        assert!(!text.contains("^done"), "{text}");
        assert!(text.contains(":i-support"), "{text}");
        assert_eq!(a.stats().chunks, 1);
        assert_eq!(a.goal_stack().len(), 1);
        assert_eq!(a.goal_stack()[0].operator.as_deref(), Some("O1"));
    }

    #[test]
    fn learning_off_learns_nothing() {
        let mut a = learner(false);
        a.run(2, RunUnit::Decision).unwrap();
        assert!(a.productions_of_kind(ProductionKind::Chunk).is_empty());
        assert!(a.justifications().is_empty());
        assert_eq!(a.goal_stack()[0].operator.as_deref(), Some("O1"));
    }

    #[test]
    fn excised_chunk_can_be_learned_again() {
        let mut a = learner(true);
        a.run(2, RunUnit::Decision).unwrap();
        let first = a.productions_of_kind(ProductionKind::Chunk);
        assert_eq!(first.len(), 1);
        a.excise(&first[0]).unwrap();

        a.init().unwrap();
        a.run(2, RunUnit::Decision).unwrap();
        let again = a.productions_of_kind(ProductionKind::Chunk);
        assert_eq!(again.len(), 1);
        assert_ne!(again[0], first[0]);
        assert_eq!(a.stats().chunks, 1);
    }

    #[test]
    fn learned_chunk_preempts_the_impasse_after_init() {
        let mut a = learner(true);
        a.run(2, RunUnit::Decision).unwrap();
        a.init().unwrap();
        a.run(1, RunUnit::Decision).unwrap();
        assert_eq!(a.goal_stack().len(), 1);
        assert_eq!(a.goal_stack()[0].operator.as_deref(), Some("O1"));
        assert_eq!(a.stats().max_goal_depth, 0);
    }
}
