//! The decision cycle: input, elaborate to quiescence, decide, output.
//!
//! Phases are free functions over the [`Agent`] context, one call per phase
//! (or per elaboration wave), so `run` can check its stop conditions between
//! them.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::Ordering;

use tracing::{debug, info, warn};

use crate::chunking;
use crate::event::{AgentEvent, WmeView};
use crate::preference::{
    Decision, ImpasseKind, Preference, PreferenceType, resolve_attribute, resolve_context,
};
use crate::production::{ProductionId, SupportMode};
use crate::rete::MatchChange;
use crate::rete::beta::TokenHandle;
use crate::symbol::{Symbol, SymbolValue};
use crate::wme::{Timetag, Wme, WmeOrigin};

use super::agent::{
    Agent, Completion, Instantiation, MatchedWme, PrefId, TopIds, release_matched, retain_matched,
};
use super::goal::{Goal, Impasse, InstHandle, Phase};
use super::rhs::{Effect, RhsEvaluator};

// ---------------------------------------------------------------------------
// Stepping
// ---------------------------------------------------------------------------

/// Run the current phase (or one elaboration wave) and advance. Returns
/// whether an elaboration wave ran.
pub(crate) fn step(agent: &mut Agent) -> bool {
    match agent.phase {
        Phase::Input => {
            input_phase(agent);
            agent.phase = Phase::Elaborate;
            agent.waves_this_phase = 0;
            false
        }
        Phase::Elaborate => {
            if agent.waves_this_phase >= agent.config.max_elaborations {
                warn!(
                    limit = agent.config.max_elaborations,
                    "elaboration limit reached before quiescence"
                );
                agent.phase = Phase::Decide;
                return false;
            }
            if elaboration_wave(agent) {
                agent.waves_this_phase += 1;
                true
            } else {
                agent.phase = Phase::Decide;
                false
            }
        }
        Phase::Decide => {
            decide(agent);
            agent.phase = Phase::Output;
            false
        }
        Phase::Output => {
            output_phase(agent);
            agent.sweep();
            agent.phase = Phase::Input;
            false
        }
    }
}

/// Build `S1` with its `io` structure.
pub(crate) fn create_top_state(agent: &mut Agent) {
    let state = agent.symbols.new_identifier('S');
    agent.symbols.retain(state);
    agent.id_levels.insert(state, 1);
    agent.rete.set_goal(state, true);
    agent.goals.push(Goal::top(state));

    let io = agent.symbols.new_identifier('I');
    let input_link = agent.symbols.new_identifier('I');
    let output_link = agent.symbols.new_identifier('I');
    for id in [io, input_link, output_link] {
        agent.symbols.retain(id);
        agent.id_levels.insert(id, 1);
    }

    let v = agent.vocab;
    let arch = WmeOrigin::Architecture;
    agent.wm_add(state, v.type_, v.state, false, arch);
    agent.wm_add(state, v.superstate, v.nil, false, arch);
    agent.wm_add(state, v.io, io, false, arch);
    agent.wm_add(io, v.input_link, input_link, false, arch);
    agent.wm_add(io, v.output_link, output_link, false, arch);
    agent.top = Some(TopIds {
        state,
        io,
        input_link,
        output_link,
    });
}

// ---------------------------------------------------------------------------
// Input
// ---------------------------------------------------------------------------

/// Turn finished background retrievals into working memory.
pub(crate) fn input_phase(agent: &mut Agent) {
    while let Some(completion) = agent.try_recv_completion() {
        agent.in_flight = agent.in_flight.saturating_sub(1);
        let Completion { target, cue, result } = completion;
        if agent.wm.has_id(target) {
            let v = agent.vocab;
            match result {
                Ok(Some(record)) => {
                    let found = agent.symbols.new_identifier('R');
                    agent.wm_add(target, v.retrieved, found, false, WmeOrigin::Input);
                    for (attr, value) in record {
                        let attr = agent.symbols.intern_str(&attr);
                        let value = agent.symbols.intern_literal(&value);
                        agent.wm_add(found, attr, value, false, WmeOrigin::Input);
                    }
                    debug!(target = %agent.symbols.render(target), "retrieval delivered");
                }
                Ok(None) => {
                    agent.wm_add(target, v.retrieval_failure, cue, false, WmeOrigin::Input);
                }
                Err(message) => {
                    warn!(%message, "retrieval failed");
                    agent.wm_add(target, v.retrieval_failure, cue, false, WmeOrigin::Input);
                }
            }
        } else {
            warn!(
                target = %agent.symbols.render(target),
                "retrieval target no longer in memory; result discarded"
            );
        }
        agent.symbols.release(target);
        agent.symbols.release(cue);
    }
}

fn submit_retrieval(agent: &mut Agent, target: Symbol, cue: Symbol) {
    let cue_text = match agent.symbols.value(cue) {
        Some(SymbolValue::String(s)) => s,
        _ => agent.symbols.render(cue),
    };
    agent.symbols.retain(target);
    agent.symbols.retain(cue);
    agent.in_flight += 1;
    let store = Arc::clone(&agent.store);
    let tx = agent.completions_tx.clone();
    let submitted = agent.workers.submit(
        cue_text,
        move |cue_text: String| store.retrieve(&cue_text),
        move |result| {
            // The agent may already be gone; nothing to deliver to then.
            let _ = tx.send(Completion {
                target,
                cue,
                result,
            });
        },
    );
    if let Err(e) = submitted {
        warn!(error = %e, "retrieval not submitted");
        agent.in_flight -= 1;
        agent.symbols.release(target);
        agent.symbols.release(cue);
    }
}

// ---------------------------------------------------------------------------
// Elaboration
// ---------------------------------------------------------------------------

/// Fire and retract everything that changed since the last wave, in
/// parallel semantics. Returns `false` at quiescence.
pub(crate) fn elaboration_wave(agent: &mut Agent) -> bool {
    absorb_changes(agent);
    if agent.pending_asserts.is_empty() && agent.pending_retracts.is_empty() {
        return false;
    }

    let mut retracts: Vec<((ProductionId, Vec<Timetag>), InstHandle)> =
        std::mem::take(&mut agent.pending_retracts)
            .into_iter()
            .filter_map(|h| {
                let inst = agent.instantiations.get(h)?;
                let key = (
                    inst.production.unwrap_or(ProductionId(0)),
                    inst.wmes.iter().map(|m| m.wme.timetag).collect(),
                );
                Some((key, h))
            })
            .collect();
    retracts.sort();
    for (_, h) in retracts {
        retract_instantiation(agent, h);
    }

    let mut fires: Vec<(ProductionId, Vec<Timetag>, TokenHandle)> =
        std::mem::take(&mut agent.pending_asserts)
            .into_iter()
            .filter(|(_, token)| agent.rete.is_live(*token))
            .map(|(p, token)| {
                let tags = agent.rete.token_wmes(token).iter().map(|w| w.timetag).collect();
                (p, tags, token)
            })
            .collect();
    fires.sort();
    for (production, _, token) in fires {
        fire(agent, production, token);
    }

    update_slots(agent);
    agent.stats.elaborations += 1;
    true
}

/// Move match-set changes from the network into the pending sets. A
/// retraction of a match that never fired just cancels it.
fn absorb_changes(agent: &mut Agent) {
    for change in agent.rete.take_changes() {
        match change {
            MatchChange::Assert { production, token } => {
                agent.pending_asserts.insert((production, token));
            }
            MatchChange::Retract { production, token } => {
                if agent.pending_asserts.remove(&(production, token)) {
                    continue;
                }
                if let Some(h) = agent.fired.get(&(production, token)).copied() {
                    if !agent.pending_retracts.contains(&h) {
                        agent.pending_retracts.push(h);
                    }
                }
            }
        }
    }
}

fn fire(agent: &mut Agent, production: ProductionId, token: TokenHandle) {
    let Some(loaded) = agent.productions.get(&production) else {
        return;
    };
    let name = loaded.production.name.clone();
    let actions = loaded.production.actions.clone();
    let declared = loaded.production.support;

    let wmes = agent.rete.token_wmes(token);
    let bindings = agent.rete.bindings(production, token);
    let level = wmes
        .iter()
        .map(|w| agent.level_of(w.id))
        .max()
        .unwrap_or(1);
    let v = agent.vocab;
    let tests_operator = wmes
        .iter()
        .any(|w| w.attr == v.operator && !w.acceptable && agent.rete.is_goal(w.id));
    let matched: Vec<MatchedWme> = wmes
        .iter()
        .map(|w| MatchedWme {
            wme: *w,
            producers: producers_of(agent, w),
        })
        .collect();
    retain_matched(&agent.symbols, &matched);

    let handle = agent.instantiations.insert(Instantiation {
        production: Some(production),
        name: name.clone(),
        token: Some(token),
        wmes: matched,
        bindings: bindings.clone(),
        level,
        prefs: Vec::new(),
        retracted: false,
    });
    agent.fired.insert((production, token), handle);

    let outcome = RhsEvaluator::new(&agent.symbols, bindings, &name, &mut agent.gensym).run(&actions);
    for id in &outcome.new_ids {
        agent.id_levels.insert(*id, level);
    }

    for req in outcome.prefs {
        let operator_slot = req.attr == v.operator && agent.rete.is_goal(req.id);
        let o_supported = match declared {
            Some(SupportMode::O) => true,
            Some(SupportMode::I) => false,
            None => tests_operator && !operator_slot,
        };
        let pref = Preference {
            id: req.id,
            attr: req.attr,
            value: req.value,
            kind: req.kind,
            referent: req.referent,
            o_supported,
        };
        let Some(pid) = agent.add_pref(pref, Some(handle)) else {
            continue;
        };
        if let Some(inst) = agent.instantiations.get_mut(handle) {
            inst.prefs.push(pid);
        }
        let id_level = agent.level_of(req.id);
        if level > 1 && id_level < level {
            record_result(agent, level, pid);
            promote(agent, req.value, id_level, level);
            if let Some(r) = req.referent {
                promote(agent, r, id_level, level);
            }
        }
    }

    for effect in outcome.effects {
        match effect {
            Effect::Print(text) => agent.publish(|_| AgentEvent::Print { text }),
            Effect::Halt => {
                let reason = format!("halt in {name}");
                info!(production = %name, "halted");
                halt(agent, reason);
            }
            Effect::Interrupt => {
                info!(production = %name, "interrupted");
                agent.stop.store(true, Ordering::SeqCst);
            }
            Effect::Retrieve { target, cue } => submit_retrieval(agent, target, cue),
        }
    }

    agent.stats.firings += 1;
    if let Some(loaded) = agent.productions.get_mut(&production) {
        loaded.firings += 1;
    }
    debug!(production = %name, level, "fired");
    let decision = agent.stats.decisions;
    agent.publish(|_| AgentEvent::ProductionFired {
        production: name,
        decision,
    });
}

/// Withdraw an instantiation's i-supported preferences. O-supported ones
/// stay until rejected or their goal goes away.
pub(crate) fn retract_instantiation(agent: &mut Agent, handle: InstHandle) {
    let Some(inst) = agent.instantiations.get_mut(handle) else {
        return;
    };
    if inst.retracted {
        return;
    }
    inst.retracted = true;
    let prefs = inst.prefs.clone();
    let key = inst.production.zip(inst.token);
    let name = inst.name.clone();
    if let Some(key) = key {
        agent.fired.remove(&key);
    }
    for pid in prefs {
        if agent.prefs.get(&pid).is_some_and(|r| !r.pref.o_supported) {
            agent.remove_pref(pid);
        }
    }
    debug!(production = %name, "retracted");
    if key.is_some() {
        agent.publish(|_| AgentEvent::ProductionRetracted { production: name });
    }
    free_if_done(agent, handle);
}

/// Drop a retracted instantiation once no preference refers to it.
pub(crate) fn free_if_done(agent: &mut Agent, handle: InstHandle) {
    let done = agent
        .instantiations
        .get(handle)
        .is_some_and(|i| i.retracted && i.prefs.is_empty());
    if done {
        if let Some(inst) = agent.instantiations.remove(handle) {
            release_matched(&agent.symbols, &inst);
        }
    }
}

fn record_result(agent: &mut Agent, level: usize, pid: PrefId) {
    if let Some(goal) = agent.goals.get_mut(level - 1) {
        if !goal.results.contains(&pid) {
            goal.results.push(pid);
        }
    }
}

/// Lower `sym` and everything reachable from it to `to_level`. Preferences
/// on newly promoted identifiers become results of the goal at
/// `goal_level`.
fn promote(agent: &mut Agent, sym: Symbol, to_level: usize, goal_level: usize) {
    let mut queue = vec![sym];
    while let Some(s) = queue.pop() {
        if !agent.symbols.is_identifier(s) || agent.level_of(s) <= to_level {
            continue;
        }
        agent.id_levels.insert(s, to_level);
        let mut owned: Vec<PrefId> = agent
            .slots
            .iter()
            .filter(|((id, _), _)| *id == s)
            .flat_map(|(_, list)| list.iter().copied())
            .collect();
        owned.sort();
        for pid in owned {
            record_result(agent, goal_level, pid);
            if let Some(r) = agent.prefs.get(&pid) {
                queue.push(r.pref.value);
                queue.extend(r.pref.referent);
            }
        }
        queue.extend(agent.wm.with_id(s).map(|e| e.wme.value));
    }
}

/// Instantiations whose preferences put `wme` into memory.
fn producers_of(agent: &Agent, wme: &Wme) -> Vec<InstHandle> {
    let Some(entry) = agent.wm.get(wme.timetag) else {
        return Vec::new();
    };
    match entry.origin {
        WmeOrigin::Preference => agent
            .slots
            .get(&(wme.id, wme.attr))
            .into_iter()
            .flatten()
            .filter_map(|pid| agent.prefs.get(pid))
            .filter(|r| {
                r.pref.value == wme.value
                    && matches!(r.pref.kind, PreferenceType::Acceptable | PreferenceType::Require)
            })
            .filter_map(|r| r.inst)
            .collect(),
        WmeOrigin::Input | WmeOrigin::Architecture => Vec::new(),
    }
}

/// Bring preference-derived elements of every dirty slot in line with its
/// preferences.
pub(crate) fn update_slots(agent: &mut Agent) {
    while !agent.dirty.is_empty() {
        for (id, attr) in std::mem::take(&mut agent.dirty) {
            let context = attr == agent.vocab.operator && agent.rete.is_goal(id);
            let prefs = agent.slot_prefs(id, attr);
            let desired: Vec<(Symbol, u32)> = if context {
                let mut counts: Vec<(Symbol, u32)> = Vec::new();
                for p in prefs.iter().filter(|p| {
                    matches!(p.kind, PreferenceType::Acceptable | PreferenceType::Require)
                }) {
                    match counts.iter_mut().find(|(v, _)| *v == p.value) {
                        Some((_, n)) => *n += 1,
                        None => counts.push((p.value, 1)),
                    }
                }
                counts
            } else {
                resolve_attribute(&prefs)
            };

            let existing: Vec<(Timetag, Symbol)> = agent
                .wm
                .with_id(id)
                .filter(|e| {
                    e.wme.attr == attr
                        && e.origin == WmeOrigin::Preference
                        && e.wme.acceptable == context
                })
                .map(|e| (e.wme.timetag, e.wme.value))
                .collect();
            for (tt, value) in existing {
                if !desired.iter().any(|(v, _)| *v == value) {
                    if let Err(e) = agent.wm_remove(tt) {
                        warn!(timetag = tt, error = %e, "slot element already gone");
                    }
                }
            }
            for (value, support) in desired {
                let wme = agent.wm_add(id, attr, value, context, WmeOrigin::Preference);
                agent.wm.set_support(wme.timetag, support);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Decision
// ---------------------------------------------------------------------------

fn still_acceptable(prefs: &[Preference], op: Symbol) -> bool {
    let offered = prefs.iter().any(|p| {
        p.value == op && matches!(p.kind, PreferenceType::Acceptable | PreferenceType::Require)
    });
    let withdrawn = prefs.iter().any(|p| {
        p.value == op && matches!(p.kind, PreferenceType::Reject | PreferenceType::Prohibit)
    });
    offered && !withdrawn
}

/// Walk the goal stack top-down and make the first change found: a new
/// operator, a cleared one, or a new impasse.
pub(crate) fn decide(agent: &mut Agent) {
    agent.stats.decisions += 1;
    let operator = agent.vocab.operator;
    let mut idx = 0;
    while idx < agent.goals.len() {
        let level = idx + 1;
        let state = agent.goals[idx].state;
        if let Some(op) = agent.goals[idx].operator {
            let prefs = agent.slot_prefs(state, operator);
            if still_acceptable(&prefs, op) {
                if ensure_subgoal(agent, idx, ImpasseKind::OperatorNoChange, vec![op]) {
                    return;
                }
                idx += 1;
                continue;
            }
            pop_below(agent, level);
            clear_operator(agent, idx);
        }

        let prefs = agent.slot_prefs(state, operator);
        let decision = resolve_context(&prefs, &agent.config, &mut agent.rng, &agent.symbols);
        let changed = match decision {
            Decision::Winner(op) => {
                pop_below(agent, level);
                select_operator(agent, idx, op);
                true
            }
            Decision::NoCandidates => {
                ensure_subgoal(agent, idx, ImpasseKind::StateNoChange, Vec::new())
            }
            Decision::Impasse { kind, items } => ensure_subgoal(agent, idx, kind, items),
        };
        if changed {
            return;
        }
        idx += 1;
    }
}

fn halt(agent: &mut Agent, reason: String) {
    agent.halted = Some(reason.clone());
    agent.publish(|_| AgentEvent::Halted { reason });
}

/// Make sure the goal below `idx` is exactly this impasse. Returns whether
/// the stack changed.
fn ensure_subgoal(agent: &mut Agent, idx: usize, kind: ImpasseKind, items: Vec<Symbol>) -> bool {
    if let Some(sub) = agent.goals.get(idx + 1) {
        if sub.impasse.as_ref().is_some_and(|i| i.same_as(kind, &items)) {
            return false;
        }
        pop_below(agent, idx + 1);
    }
    if agent.goals.len() >= agent.config.max_goal_depth {
        let reason = format!("goal stack reached depth {}", agent.config.max_goal_depth);
        warn!(depth = agent.goals.len(), "goal depth limit reached");
        halt(agent, reason);
        return true;
    }
    create_subgoal(agent, kind, items);
    true
}

fn create_subgoal(agent: &mut Agent, kind: ImpasseKind, items: Vec<Symbol>) {
    let Some(parent) = agent.goals.last() else {
        return;
    };
    let superstate = parent.state;
    let level = agent.goals.len() + 1;
    let v = agent.vocab;

    let state = agent.symbols.new_identifier('S');
    agent.symbols.retain(state);
    agent.id_levels.insert(state, level);
    agent.rete.set_goal(state, true);
    agent.goals.push(Goal {
        level,
        state,
        operator: None,
        operator_wme: None,
        impasse: Some(Impasse {
            kind,
            items: items.clone(),
        }),
        results: Vec::new(),
        created_at: agent.stats.decisions,
    });

    let arch = WmeOrigin::Architecture;
    let impasse = agent.symbols.intern_str(kind.name());
    let attribute = agent.symbols.intern_str(kind.attribute());
    let choices = agent.symbols.intern_str(kind.choices());
    agent.wm_add(state, v.type_, v.state, false, arch);
    agent.wm_add(state, v.superstate, superstate, false, arch);
    agent.wm_add(state, v.impasse, impasse, false, arch);
    agent.wm_add(state, v.attribute, attribute, false, arch);
    agent.wm_add(state, v.choices, choices, false, arch);
    agent.wm_add(state, v.quiescence, v.t, false, arch);
    for item in &items {
        agent.wm_add(state, v.item, *item, false, arch);
    }

    agent.stats.max_goal_depth = agent.stats.max_goal_depth.max(level);
    debug!(level, %kind, state = %agent.symbols.render(state), "impasse");
    agent.publish(|s| AgentEvent::ImpasseCreated {
        level,
        kind,
        state: s.render(state),
        items: items.iter().map(|i| s.render(*i)).collect(),
    });
}

fn select_operator(agent: &mut Agent, idx: usize, op: Symbol) {
    let state = agent.goals[idx].state;
    let wme = agent.wm_add(state, agent.vocab.operator, op, false, WmeOrigin::Architecture);
    let goal = &mut agent.goals[idx];
    goal.operator = Some(op);
    goal.operator_wme = Some(wme.timetag);
    debug!(
        level = idx + 1,
        operator = %agent.symbols.render(op),
        "operator selected"
    );
}

fn clear_operator(agent: &mut Agent, idx: usize) {
    let goal = &mut agent.goals[idx];
    goal.operator = None;
    if let Some(tt) = goal.operator_wme.take() {
        if let Err(e) = agent.wm_remove(tt) {
            warn!(timetag = tt, error = %e, "operator element already gone");
        }
    }
}

/// Pop goals until `level` is the deepest.
fn pop_below(agent: &mut Agent, level: usize) {
    while agent.goals.len() > level {
        pop_goal(agent);
    }
}

/// Remove the deepest goal: learn from its results, keep what they rest
/// on, then drop everything local to it.
fn pop_goal(agent: &mut Agent) {
    let Some(goal) = agent.goals.last() else {
        return;
    };
    if goal.level == 1 {
        return;
    }
    let level = goal.level;
    let state = goal.state;
    let results: Vec<PrefId> = goal
        .results
        .iter()
        .copied()
        .filter(|p| agent.prefs.contains_key(p))
        .collect();
    debug!(level, state = %agent.symbols.render(state), "goal removed");
    agent.publish(|s| AgentEvent::ImpasseResolved {
        level,
        state: s.render(state),
    });

    if !results.is_empty() {
        let trace = chunking::backtrace(agent, level, &results);
        if agent.config.learning {
            chunking::learn(agent, level, &results, &trace);
        }
        support_results(agent, level, &results, &trace.grounds);
    }

    let doomed: Vec<InstHandle> = agent
        .instantiations
        .iter()
        .filter(|(_, inst)| inst.level >= level)
        .map(|(h, _)| h)
        .collect();
    for h in doomed {
        let Some(inst) = agent.instantiations.get(h) else {
            continue;
        };
        let prefs = inst.prefs.clone();
        if let Some(key) = inst.production.zip(inst.token) {
            agent.fired.remove(&key);
        }
        for pid in prefs {
            if results.contains(&pid) {
                if let Some(record) = agent.prefs.get_mut(&pid) {
                    record.inst = None;
                }
            } else {
                agent.remove_pref(pid);
            }
        }
        if let Some(inst) = agent.instantiations.remove(h) {
            release_matched(&agent.symbols, &inst);
        }
    }
    agent.pending_retracts.retain(|h| agent.instantiations.contains(*h));

    let local: Vec<PrefId> = agent
        .prefs
        .iter()
        .filter(|(_, r)| agent.level_of(r.pref.id) >= level)
        .map(|(pid, _)| *pid)
        .collect();
    for pid in local {
        agent.remove_pref(pid);
    }
    update_slots(agent);

    let local_wmes: Vec<Timetag> = agent
        .wm
        .iter()
        .filter(|e| agent.level_of(e.wme.id) >= level)
        .map(|e| e.wme.timetag)
        .collect();
    for tt in local_wmes.into_iter().rev() {
        if let Err(e) = agent.wm_remove(tt) {
            warn!(timetag = tt, error = %e, "local element already gone");
        }
    }
    update_slots(agent);

    agent.rete.set_goal(state, false);
    agent.symbols.release(state);
    agent.id_levels.retain(|_, l| *l < level);
    agent.goals.pop();
}

/// Give the i-supported results of a popped goal a support record resting
/// on their backtraced grounds, so they stay exactly as long as those do.
fn support_results(agent: &mut Agent, level: usize, results: &[PrefId], grounds: &[Wme]) {
    let mut moved: Vec<(PrefId, InstHandle)> = Vec::new();
    for pid in results {
        let Some(record) = agent.prefs.get(pid) else {
            continue;
        };
        let Some(h) = record.inst else {
            continue;
        };
        let local = agent.instantiations.get(h).is_some_and(|i| i.level >= level);
        if !record.pref.o_supported && local {
            moved.push((*pid, h));
        }
    }
    if moved.is_empty() {
        return;
    }
    if grounds.iter().any(|g| agent.wm.get(g.timetag).is_none()) {
        // A ground is already gone; the results go with their goal.
        return;
    }

    let matched: Vec<MatchedWme> = grounds
        .iter()
        .map(|g| MatchedWme {
            wme: *g,
            producers: Vec::new(),
        })
        .collect();
    retain_matched(&agent.symbols, &matched);
    let support_level = grounds
        .iter()
        .map(|g| agent.level_of(g.id))
        .max()
        .unwrap_or(1)
        .min(level - 1);
    let handle = agent.instantiations.insert(Instantiation {
        production: None,
        name: format!("result-support*{level}"),
        token: None,
        wmes: matched,
        bindings: HashMap::new(),
        level: support_level,
        prefs: moved.iter().map(|(pid, _)| *pid).collect(),
        retracted: false,
    });
    for (pid, old) in moved {
        if let Some(inst) = agent.instantiations.get_mut(old) {
            inst.prefs.retain(|p| *p != pid);
        }
        if let Some(record) = agent.prefs.get_mut(&pid) {
            record.inst = Some(handle);
        }
    }
    for g in grounds {
        agent.ground_watch.entry(g.timetag).or_default().push(handle);
    }
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

/// Report changes to the structure under the output link since the last
/// output phase.
pub(crate) fn output_phase(agent: &mut Agent) {
    let Some(top) = agent.top else {
        return;
    };
    let mut current: BTreeMap<Timetag, WmeView> = BTreeMap::new();
    let mut seen: HashSet<Symbol> = HashSet::from([top.output_link]);
    let mut queue = vec![top.output_link];
    while let Some(id) = queue.pop() {
        for e in agent.wm.with_id(id) {
            current.insert(e.wme.timetag, WmeView::new(&e.wme, &agent.symbols));
            if agent.symbols.is_identifier(e.wme.value) && seen.insert(e.wme.value) {
                queue.push(e.wme.value);
            }
        }
    }
    let added: Vec<WmeView> = current
        .iter()
        .filter(|(tt, _)| !agent.output_snapshot.contains_key(tt))
        .map(|(_, w)| w.clone())
        .collect();
    let removed: Vec<WmeView> = agent
        .output_snapshot
        .iter()
        .filter(|(tt, _)| !current.contains_key(tt))
        .map(|(_, w)| w.clone())
        .collect();
    if !added.is_empty() || !removed.is_empty() {
        debug!(added = added.len(), removed = removed.len(), "output link changed");
        agent.publish(|_| AgentEvent::OutputLinkChanged { added, removed });
    }
    agent.output_snapshot = current;
}

#[cfg(test)]
mod tests {
    use crate::agent::{Agent, RunUnit};
    use crate::config::AgentConfig;

    fn agent() -> Agent {
        let config = AgentConfig {
            worker_threads: 0,
            ..AgentConfig::default()
        };
        Agent::new(config).unwrap()
    }

    #[test]
    fn top_state_structure() {
        let a = agent();
        let rendered: Vec<String> = a.wmes().iter().map(|w| w.to_string()).collect();
        assert_eq!(
            rendered,
            vec![
                "(1: S1 ^type state)",
                "(2: S1 ^superstate nil)",
                "(3: S1 ^io I1)",
                "(4: I1 ^input-link I2)",
                "(5: I1 ^output-link I3)",
            ]
        );
    }

    #[test]
    fn failed_network_removal_keeps_the_element() {
        let mut a = agent();
        let input = a.input_link().unwrap();
        let attr = a.symbols().intern_str("x");
        let value = a.symbols().intern_int(1);
        let wme = a.add_wme(input, attr, value).unwrap();
        a.rete.remove_wme(wme.timetag).unwrap();

        assert!(a.wm_remove(wme.timetag).is_err());
        assert_eq!(a.find_wme(input, attr, value), Some(wme.timetag));
    }

    #[test]
    fn empty_agent_stacks_state_no_changes() {
        let mut a = agent();
        a.run(3, RunUnit::Decision).unwrap();
        let stack = a.goal_stack();
        assert_eq!(stack.len(), 4);
        assert_eq!(stack[1].state, "S2");
        assert!(stack[1..]
            .iter()
            .all(|g| g.impasse == Some(crate::preference::ImpasseKind::StateNoChange)));
    }

    #[test]
    fn operator_selection_and_o_support() {
        let mut a = agent();
        a.load_productions(
            r#"
            sp {propose (state <s> ^superstate nil -^done) --> (<s> ^operator <o> +) (<o> ^name go)}
            sp {apply (state <s> ^operator <o>) (<o> ^name go) --> (<s> ^done yes)}
            "#,
        )
        .unwrap();
        a.run(1, RunUnit::Decision).unwrap();
        let s1 = a.top_state().unwrap();
        assert_eq!(a.goal_stack()[0].operator.as_deref(), Some("O1"));
        a.run(1, RunUnit::Decision).unwrap();
        // The proposal retracted but the applied result persists.
        assert_eq!(a.values_of(s1, "done").len(), 1);
        assert_eq!(a.goal_stack()[0].operator, None);
    }

    #[test]
    fn i_supported_elements_track_their_match() {
        let mut a = agent();
        let rx = a.subscribe();
        a.load_productions("sp {mirror (state <s> ^io.input-link.seen <x>) --> (<s> ^copy <x>)}")
            .unwrap();
        let input = a.input_link().unwrap();
        let seen = a.symbols().intern_str("seen");
        let red = a.symbols().intern_str("red");
        let w = a.add_wme(input, seen, red).unwrap();
        a.run(1, RunUnit::Elaboration).unwrap();
        a.run(1, RunUnit::Elaboration).unwrap();
        let s1 = a.top_state().unwrap();
        assert_eq!(a.values_of(s1, "copy"), vec![red]);
        a.remove_wme(w.timetag).unwrap();
        a.run(2, RunUnit::Elaboration).unwrap();
        assert!(a.values_of(s1, "copy").is_empty());
        let kinds: Vec<&str> = rx.try_iter().map(|e| e.name()).collect();
        assert!(kinds.contains(&"production-fired"));
        assert!(kinds.contains(&"production-retracted"));
    }
}
