//! The agent: one working memory, one match network, one goal stack.
//!
//! Everything an agent owns lives in this context object; independent agents
//! share nothing and may run on separate threads. Phases take `&mut self`, so
//! the decision cycle is never re-entered.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, mpsc};

use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::AgentConfig;
use crate::error::{AgentError, CogentResult, ProductionError, SymbolError, WmeError};
use crate::event::{AgentEvent, EventBus, WmeView};
use crate::memory::{AssociativeStore, LongTermStore, Record};
use crate::preference::{ImpasseKind, Preference, PreferenceType};
use crate::production::{Production, ProductionId, ProductionKind, parse_productions};
use crate::rete::Rete;
use crate::rete::arena::Arena;
use crate::rete::beta::TokenHandle;
use crate::symbol::{Symbol, SymbolTable};
use crate::wme::{Timetag, Wme, WmeEntry, WmeOrigin, WorkingMemory};
use crate::worker::WorkerPool;

use super::cycle;
use super::goal::{Goal, InstHandle, Phase};

// ---------------------------------------------------------------------------
// Bookkeeping types
// ---------------------------------------------------------------------------

/// Creation order of a preference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PrefId(pub u64);

#[derive(Debug, Clone)]
pub(crate) struct PrefRecord {
    pub pref: Preference,
    /// `None` once an o-supported preference outlives its instantiation.
    pub inst: Option<InstHandle>,
}

/// A WME as matched by an instantiation.
#[derive(Debug, Clone)]
pub(crate) struct MatchedWme {
    pub wme: Wme,
    /// Instantiations that produced it, for backtracing.
    pub producers: Vec<InstHandle>,
}

/// One firing of one production for one match.
///
/// Also used, with no production, to support the i-supported results of a
/// popped subgoal for as long as their backtraced grounds stay in memory.
#[derive(Debug)]
pub struct Instantiation {
    pub(crate) production: Option<ProductionId>,
    pub(crate) name: String,
    pub(crate) token: Option<TokenHandle>,
    pub(crate) wmes: Vec<MatchedWme>,
    pub(crate) bindings: HashMap<String, Symbol>,
    /// Deepest goal level among the matched identifiers.
    pub(crate) level: usize,
    pub(crate) prefs: Vec<PrefId>,
    pub(crate) retracted: bool,
}

#[derive(Debug)]
pub(crate) struct LoadedProduction {
    pub production: Production,
    pub firings: u64,
}

/// A finished background retrieval waiting for the input phase.
#[derive(Debug)]
pub(crate) struct Completion {
    pub target: Symbol,
    pub cue: Symbol,
    pub result: Result<Option<Record>, String>,
}

/// Symbols the architecture itself reads and writes. Held for the agent's
/// lifetime so their handles stay stable across sweeps.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Vocab {
    pub operator: Symbol,
    pub type_: Symbol,
    pub state: Symbol,
    pub superstate: Symbol,
    pub nil: Symbol,
    pub io: Symbol,
    pub input_link: Symbol,
    pub output_link: Symbol,
    pub impasse: Symbol,
    pub attribute: Symbol,
    pub choices: Symbol,
    pub quiescence: Symbol,
    pub t: Symbol,
    pub item: Symbol,
    pub retrieved: Symbol,
    pub retrieval_failure: Symbol,
}

impl Vocab {
    fn new(symbols: &SymbolTable) -> Self {
        let v = Self {
            operator: symbols.intern_str("operator"),
            type_: symbols.intern_str("type"),
            state: symbols.intern_str("state"),
            superstate: symbols.intern_str("superstate"),
            nil: symbols.intern_str("nil"),
            io: symbols.intern_str("io"),
            input_link: symbols.intern_str("input-link"),
            output_link: symbols.intern_str("output-link"),
            impasse: symbols.intern_str("impasse"),
            attribute: symbols.intern_str("attribute"),
            choices: symbols.intern_str("choices"),
            quiescence: symbols.intern_str("quiescence"),
            t: symbols.intern_str("t"),
            item: symbols.intern_str("item"),
            retrieved: symbols.intern_str("retrieved"),
            retrieval_failure: symbols.intern_str("retrieval-failure"),
        };
        v.all().into_iter().for_each(|s| symbols.retain(s));
        v
    }

    fn all(&self) -> [Symbol; 16] {
        [
            self.operator,
            self.type_,
            self.state,
            self.superstate,
            self.nil,
            self.io,
            self.input_link,
            self.output_link,
            self.impasse,
            self.attribute,
            self.choices,
            self.quiescence,
            self.t,
            self.item,
            self.retrieved,
            self.retrieval_failure,
        ]
    }
}

/// Identifiers of the top state's I/O structure.
#[derive(Debug, Clone, Copy)]
pub(crate) struct TopIds {
    pub state: Symbol,
    pub io: Symbol,
    pub input_link: Symbol,
    pub output_link: Symbol,
}

// ---------------------------------------------------------------------------
// Public views
// ---------------------------------------------------------------------------

/// Granularity of [`Agent::run`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunUnit {
    /// Full decision cycles.
    Decision,
    /// Elaboration waves; a decide phase also counts as one.
    Elaboration,
    /// Until halted, stopped or interrupted.
    Forever,
}

impl std::str::FromStr for RunUnit {
    type Err = AgentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "d" | "decision" | "decisions" => Ok(RunUnit::Decision),
            "e" | "elaboration" | "elaborations" => Ok(RunUnit::Elaboration),
            "forever" => Ok(RunUnit::Forever),
            other => Err(AgentError::InvalidCommand {
                message: format!("unknown run unit `{other}`"),
            }),
        }
    }
}

/// Counters since the last `init`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentStats {
    pub decisions: u64,
    pub elaborations: u64,
    pub firings: u64,
    pub chunks: u64,
    pub justifications: u64,
    pub max_goal_depth: usize,
}

/// What one [`Agent::run`] call did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub decisions: u64,
    pub elaborations: u64,
    pub firings: u64,
    pub halted: bool,
    pub stopped: bool,
}

/// One goal stack level, rendered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GoalView {
    pub level: usize,
    pub state: String,
    pub operator: Option<String>,
    pub impasse: Option<ImpasseKind>,
}

// ---------------------------------------------------------------------------
// Agent
// ---------------------------------------------------------------------------

pub struct Agent {
    pub(crate) config: AgentConfig,
    pub(crate) symbols: Arc<SymbolTable>,
    pub(crate) wm: WorkingMemory,
    pub(crate) rete: Rete,
    pub(crate) vocab: Vocab,
    pub(crate) top: Option<TopIds>,

    pub(crate) productions: BTreeMap<ProductionId, LoadedProduction>,
    pub(crate) by_name: HashMap<String, ProductionId>,
    next_production: u64,
    /// Learned rules that could not become chunks, kept until `init`.
    pub(crate) justifications: Vec<Production>,
    /// Printed text of every learned chunk with its name blanked.
    /// Printed form of each learned rule without its name, mapped to the name.
    pub(crate) chunk_signatures: HashMap<String, String>,
    pub(crate) chunk_counter: u64,

    pub(crate) instantiations: Arena<Instantiation>,
    pub(crate) fired: HashMap<(ProductionId, TokenHandle), InstHandle>,
    pub(crate) pending_asserts: BTreeSet<(ProductionId, TokenHandle)>,
    pub(crate) pending_retracts: Vec<InstHandle>,
    /// Result-support records keyed by the ground elements they rest on.
    pub(crate) ground_watch: HashMap<Timetag, Vec<InstHandle>>,

    pub(crate) prefs: BTreeMap<PrefId, PrefRecord>,
    pub(crate) slots: HashMap<(Symbol, Symbol), Vec<PrefId>>,
    pub(crate) dirty: Vec<(Symbol, Symbol)>,
    next_pref: u64,

    pub(crate) goals: Vec<Goal>,
    pub(crate) id_levels: HashMap<Symbol, usize>,

    pub(crate) events: EventBus,
    pub(crate) rng: StdRng,
    pub(crate) gensym: u64,

    pub(crate) workers: WorkerPool,
    pub(crate) store: Arc<dyn LongTermStore>,
    pub(crate) completions_tx: mpsc::Sender<Completion>,
    completions_rx: mpsc::Receiver<Completion>,
    pub(crate) in_flight: usize,

    pub(crate) stop: Arc<AtomicBool>,
    pub(crate) halted: Option<String>,
    shut_down: bool,
    pub(crate) phase: Phase,
    pub(crate) waves_this_phase: u32,
    pub(crate) stats: AgentStats,
    pub(crate) output_snapshot: BTreeMap<Timetag, WmeView>,
}

impl Agent {
    /// Create an agent with a fresh top state.
    pub fn new(config: AgentConfig) -> CogentResult<Self> {
        config.validate()?;
        let symbols = Arc::new(SymbolTable::new());
        let vocab = Vocab::new(&symbols);
        let workers = WorkerPool::new(config.worker_threads)?;
        let (completions_tx, completions_rx) = mpsc::channel();
        let mut agent = Self {
            rng: StdRng::seed_from_u64(config.seed),
            wm: WorkingMemory::new(Arc::clone(&symbols)),
            rete: Rete::new(Arc::clone(&symbols)),
            vocab,
            top: None,
            productions: BTreeMap::new(),
            by_name: HashMap::new(),
            next_production: 1,
            justifications: Vec::new(),
            chunk_signatures: HashMap::new(),
            chunk_counter: 0,
            instantiations: Arena::new(),
            fired: HashMap::new(),
            pending_asserts: BTreeSet::new(),
            pending_retracts: Vec::new(),
            ground_watch: HashMap::new(),
            prefs: BTreeMap::new(),
            slots: HashMap::new(),
            dirty: Vec::new(),
            next_pref: 1,
            goals: Vec::new(),
            id_levels: HashMap::new(),
            events: EventBus::new(),
            gensym: 0,
            workers,
            store: Arc::new(AssociativeStore::new()),
            completions_tx,
            completions_rx,
            in_flight: 0,
            stop: Arc::new(AtomicBool::new(false)),
            halted: None,
            shut_down: false,
            phase: Phase::Input,
            waves_this_phase: 0,
            stats: AgentStats::default(),
            output_snapshot: BTreeMap::new(),
            symbols,
            config,
        };
        cycle::create_top_state(&mut agent);
        info!(
            seed = agent.config.seed,
            workers = agent.config.worker_threads,
            "agent created"
        );
        Ok(agent)
    }

    fn ensure_running(&self) -> CogentResult<()> {
        if self.shut_down {
            return Err(AgentError::ShutDown.into());
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn symbols(&self) -> &Arc<SymbolTable> {
        &self.symbols
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn stats(&self) -> &AgentStats {
        &self.stats
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn is_halted(&self) -> bool {
        self.halted.is_some()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down
    }

    /// Receive every event published from now on.
    pub fn subscribe(&mut self) -> mpsc::Receiver<AgentEvent> {
        self.events.subscribe()
    }

    /// Flag another thread can set to stop a run between phases.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    /// Ask the current run, or the next one if none is in progress, to stop
    /// at the next phase boundary. The run that stops consumes the request.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn top_state(&self) -> Option<Symbol> {
        self.top.map(|t| t.state)
    }

    pub fn input_link(&self) -> Option<Symbol> {
        self.top.map(|t| t.input_link)
    }

    pub fn output_link(&self) -> Option<Symbol> {
        self.top.map(|t| t.output_link)
    }

    pub fn goal_stack(&self) -> Vec<GoalView> {
        self.goals
            .iter()
            .map(|g| GoalView {
                level: g.level,
                state: self.symbols.render(g.state),
                operator: g.operator.map(|o| self.symbols.render(o)),
                impasse: g.impasse.as_ref().map(|i| i.kind),
            })
            .collect()
    }

    /// Every element in working memory, in timetag order.
    pub fn wmes(&self) -> Vec<WmeView> {
        self.wm.iter().map(|e| WmeView::new(&e.wme, &self.symbols)).collect()
    }

    pub fn wme_count(&self) -> usize {
        self.wm.len()
    }

    pub fn find_wme(&self, id: Symbol, attr: Symbol, value: Symbol) -> Option<Timetag> {
        self.wm.find(id, attr, value, false)
    }

    /// Acceptable preferences behind a preference-derived element.
    pub fn wme_support(&self, timetag: Timetag) -> Option<u32> {
        self.wm.get(timetag).map(|e| e.support)
    }

    /// Values of `(id ^attr *)` in timetag order.
    pub fn values_of(&self, id: Symbol, attr: &str) -> Vec<Symbol> {
        let attr = self.symbols.intern_str(attr);
        self.wm
            .with_id(id)
            .filter(|e| e.wme.attr == attr && !e.wme.acceptable)
            .map(|e| e.wme.value)
            .collect()
    }

    pub fn set_long_term_store(&mut self, store: Arc<dyn LongTermStore>) {
        self.store = store;
    }

    pub fn long_term_store(&self) -> &Arc<dyn LongTermStore> {
        &self.store
    }

    pub fn get_setting(&self, name: &str) -> CogentResult<String> {
        self.config.get(name)
    }

    pub fn set_setting(&mut self, name: &str, value: &str) -> CogentResult<()> {
        self.config.set(name, value)?;
        if name == "seed" {
            self.rng = StdRng::seed_from_u64(self.config.seed);
        }
        debug!(setting = name, value, "setting changed");
        Ok(())
    }

    pub fn set_seed(&mut self, seed: u64) {
        self.config.seed = seed;
        self.rng = StdRng::seed_from_u64(seed);
    }

    // -----------------------------------------------------------------------
    // Productions
    // -----------------------------------------------------------------------

    /// Parse and load every production in `src`. Returns their names.
    /// Nothing is loaded unless every production is accepted.
    pub fn load_productions(&mut self, src: &str) -> CogentResult<Vec<String>> {
        self.ensure_running()?;
        let parsed = parse_productions(src, &self.symbols)?;
        for p in &parsed {
            Rete::check_production(p)?;
        }
        let mut names = Vec::with_capacity(parsed.len());
        for p in parsed {
            names.push(p.name.clone());
            self.add_production(p)?;
        }
        Ok(names)
    }

    /// Load a parsed production. A production with the same name is replaced.
    pub fn add_production(&mut self, production: Production) -> CogentResult<ProductionId> {
        self.ensure_running()?;
        let id = ProductionId(self.next_production);
        self.rete.add_production(id, &production)?;
        self.next_production += 1;
        if let Some(old) = self.by_name.get(&production.name).copied() {
            info!(production = %production.name, "replacing production");
            self.excise_id(old);
        }
        production.retain_symbols(&self.symbols);
        debug!(production = %production.name, id = id.0, "production loaded");
        self.by_name.insert(production.name.clone(), id);
        self.productions.insert(
            id,
            LoadedProduction {
                production,
                firings: 0,
            },
        );
        Ok(id)
    }

    pub fn excise(&mut self, name: &str) -> CogentResult<()> {
        self.ensure_running()?;
        let id = self
            .by_name
            .get(name)
            .copied()
            .ok_or_else(|| ProductionError::NotFound {
                name: name.to_string(),
            })?;
        self.excise_id(id);
        info!(production = name, "excised");
        Ok(())
    }

    pub(crate) fn excise_id(&mut self, id: ProductionId) {
        self.rete.excise(id);
        if let Some(loaded) = self.productions.remove(&id) {
            let name = &loaded.production.name;
            self.by_name.remove(name);
            self.chunk_signatures.retain(|_, learned| *learned != *name);
            loaded.production.release_symbols(&self.symbols);
        }
    }

    pub fn production_names(&self) -> Vec<String> {
        self.productions.values().map(|p| p.production.name.clone()).collect()
    }

    /// Names of loaded productions of one kind, in load order.
    pub fn productions_of_kind(&self, kind: ProductionKind) -> Vec<String> {
        self.productions
            .values()
            .filter(|p| p.production.kind == kind)
            .map(|p| p.production.name.clone())
            .collect()
    }

    pub fn production(&self, name: &str) -> Option<&Production> {
        let id = self.by_name.get(name)?;
        self.productions.get(id).map(|p| &p.production)
    }

    /// Printed form of a loaded production.
    pub fn production_text(&self, name: &str) -> Option<String> {
        self.production(name)
            .map(|p| p.display(&self.symbols).to_string())
    }

    pub fn firing_count(&self, name: &str) -> Option<u64> {
        let id = self.by_name.get(name)?;
        self.productions.get(id).map(|p| p.firings)
    }

    pub fn justifications(&self) -> &[Production] {
        &self.justifications
    }

    /// Current complete matches of a production.
    pub fn match_count(&self, name: &str) -> Option<usize> {
        let id = self.by_name.get(name)?;
        Some(self.rete.matches(*id).len())
    }

    // -----------------------------------------------------------------------
    // External working memory changes
    // -----------------------------------------------------------------------

    /// Add an input element. `id` must be an identifier.
    ///
    /// Handles interned by the caller and not yet used in working memory are
    /// reclaimed at the end of the next decision; passing one afterwards is
    /// an error.
    pub fn add_wme(&mut self, id: Symbol, attr: Symbol, value: Symbol) -> CogentResult<Wme> {
        self.ensure_running()?;
        self.ensure_live([id, attr, value])?;
        if !self.symbols.is_identifier(id) {
            return Err(WmeError::UnknownWme {
                description: format!("identifier position holds `{}`", self.symbols.render(id)),
            }
            .into());
        }
        if self.wm.find(id, attr, value, false).is_none() {
            debug!(
                id = %self.symbols.render(id),
                attr = %self.symbols.render(attr),
                value = %self.symbols.render(value),
                "input element"
            );
        }
        Ok(self.wm_add(id, attr, value, false, WmeOrigin::Input))
    }

    /// Remove an input element by timetag. Rule- and architecture-supported
    /// elements cannot be removed this way.
    pub fn remove_wme(&mut self, timetag: Timetag) -> CogentResult<()> {
        self.ensure_running()?;
        let entry = self
            .wm
            .get(timetag)
            .ok_or(WmeError::UnknownTimetag { timetag })?;
        if entry.origin != WmeOrigin::Input {
            return Err(WmeError::RuleSupported { timetag }.into());
        }
        self.wm_remove(timetag)?;
        Ok(())
    }

    /// Remove an input element by content.
    pub fn remove_wme_matching(&mut self, id: Symbol, attr: Symbol, value: Symbol) -> CogentResult<()> {
        self.ensure_live([id, attr, value])?;
        let timetag = self.wm.find(id, attr, value, false).ok_or_else(|| WmeError::UnknownWme {
            description: format!(
                "({} ^{} {})",
                self.symbols.render(id),
                self.symbols.render(attr),
                self.symbols.render(value)
            ),
        })?;
        self.remove_wme(timetag)
    }

    // -----------------------------------------------------------------------
    // Running
    // -----------------------------------------------------------------------

    /// Run `count` units. The stop flag and halting are checked between
    /// phases; `count` is ignored for [`RunUnit::Forever`].
    pub fn run(&mut self, count: u64, unit: RunUnit) -> CogentResult<RunSummary> {
        self.ensure_running()?;
        let start = self.stats.clone();
        let mut done = 0u64;
        let mut stopped = false;
        loop {
            if self.stop.swap(false, Ordering::SeqCst) {
                stopped = true;
                break;
            }
            if unit != RunUnit::Forever && done >= count {
                break;
            }
            if self.halted.is_some() {
                break;
            }
            let phase = self.phase;
            let waved = cycle::step(self);
            done += match unit {
                RunUnit::Decision => u64::from(phase == Phase::Output),
                RunUnit::Elaboration => u64::from(waved || phase == Phase::Decide),
                RunUnit::Forever => 0,
            };
        }
        let summary = RunSummary {
            decisions: self.stats.decisions - start.decisions,
            elaborations: self.stats.elaborations - start.elaborations,
            firings: self.stats.firings - start.firings,
            halted: self.halted.is_some(),
            stopped,
        };
        debug!(?summary, "run finished");
        Ok(summary)
    }

    /// Clear working memory, preferences and the goal stack, keeping
    /// loaded productions.
    pub fn init(&mut self) -> CogentResult<()> {
        self.ensure_running()?;
        self.clear_runtime_state();
        for j in self.justifications.drain(..) {
            j.release_symbols(&self.symbols);
        }
        let by_name = &self.by_name;
        self.chunk_signatures.retain(|_, learned| by_name.contains_key(learned));
        self.output_snapshot.clear();
        self.halted = None;
        self.phase = Phase::Input;
        self.waves_this_phase = 0;
        self.stats = AgentStats::default();
        self.rng = StdRng::seed_from_u64(self.config.seed);
        self.sweep();
        if !self.symbols.reset_identifier_counters() {
            warn!("identifiers still referenced after init; numbering continues");
        }
        cycle::create_top_state(self);
        info!("agent initialized");
        Ok(())
    }

    /// Remove instantiations, preferences, elements and goals.
    fn clear_runtime_state(&mut self) {
        self.pending_asserts.clear();
        self.pending_retracts.clear();
        self.ground_watch.clear();
        self.fired.clear();
        for handle in self.instantiations.handles() {
            if let Some(inst) = self.instantiations.remove(handle) {
                release_matched(&self.symbols, &inst);
            }
        }
        for (_, record) in std::mem::take(&mut self.prefs) {
            release_pref(&self.symbols, &record.pref);
        }
        self.slots.clear();
        self.dirty.clear();
        let timetags: Vec<Timetag> = self.wm.iter().map(|e| e.wme.timetag).collect();
        for tt in timetags.into_iter().rev() {
            if let Err(e) = self.wm_remove(tt) {
                warn!(timetag = tt, error = %e, "element removal failed during reset");
            }
        }
        for goal in std::mem::take(&mut self.goals) {
            self.rete.set_goal(goal.state, false);
            self.symbols.release(goal.state);
        }
        if let Some(top) = self.top.take() {
            for s in [top.io, top.input_link, top.output_link] {
                self.symbols.release(s);
            }
        }
        self.rete.take_changes();
        self.id_levels.clear();
        while let Ok(c) = self.completions_rx.try_recv() {
            self.in_flight = self.in_flight.saturating_sub(1);
            self.symbols.release(c.target);
            self.symbols.release(c.cue);
        }
    }

    /// Orderly teardown: refuse further commands, drain and join workers,
    /// flush output, then release runtime state, productions and symbols.
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;
        self.workers.shutdown();
        cycle::output_phase(self);
        self.clear_runtime_state();
        for j in self.justifications.drain(..) {
            j.release_symbols(&self.symbols);
        }
        let ids: Vec<ProductionId> = self.productions.keys().copied().collect();
        for id in ids {
            self.excise_id(id);
        }
        self.vocab.all().into_iter().for_each(|s| self.symbols.release(s));
        self.sweep();
        self.events.close();
        info!(remaining_symbols = self.symbols.len(), "agent shut down");
    }

    // -----------------------------------------------------------------------
    // Internal working memory primitives
    // -----------------------------------------------------------------------

    pub(crate) fn level_of(&self, id: Symbol) -> usize {
        self.id_levels.get(&id).copied().unwrap_or(1)
    }

    pub(crate) fn publish(&mut self, build: impl FnOnce(&SymbolTable) -> AgentEvent) {
        if self.events.is_active() {
            let event = build(&self.symbols);
            self.events.publish(event);
        }
    }

    /// Add an element to memory and the network; duplicates are no-ops.
    pub(crate) fn wm_add(
        &mut self,
        id: Symbol,
        attr: Symbol,
        value: Symbol,
        acceptable: bool,
        origin: WmeOrigin,
    ) -> Wme {
        let (wme, new) = self.wm.add(id, attr, value, acceptable, origin);
        if new {
            if self.symbols.is_identifier(value) && !self.id_levels.contains_key(&value) {
                let level = self.level_of(id);
                self.id_levels.insert(value, level);
            }
            self.rete.add_wme(wme);
            self.publish(|s| AgentEvent::WmeAdded {
                wme: WmeView::new(&wme, s),
            });
        }
        wme
    }

    pub(crate) fn wm_remove(&mut self, timetag: Timetag) -> CogentResult<WmeEntry> {
        if self.wm.get(timetag).is_none() {
            return Err(WmeError::UnknownTimetag { timetag }.into());
        }
        self.rete.remove_wme(timetag)?;
        let entry = self.wm.remove(timetag)?;
        let wme = entry.wme;
        self.publish(|s| AgentEvent::WmeRemoved {
            wme: WmeView::new(&wme, s),
        });
        if let Some(records) = self.ground_watch.remove(&timetag) {
            for r in records {
                cycle::retract_instantiation(self, r);
            }
        }
        Ok(entry)
    }

    // -----------------------------------------------------------------------
    // Preference memory primitives
    // -----------------------------------------------------------------------

    /// Store a preference. An o-supported reject instead removes the
    /// o-supported preferences for its value and is not stored.
    pub(crate) fn add_pref(&mut self, pref: Preference, inst: Option<InstHandle>) -> Option<PrefId> {
        let slot = (pref.id, pref.attr);
        if pref.kind == PreferenceType::Reject && pref.o_supported {
            let victims: Vec<PrefId> = self
                .slots
                .get(&slot)
                .into_iter()
                .flatten()
                .copied()
                .filter(|pid| {
                    self.prefs
                        .get(pid)
                        .is_some_and(|r| r.pref.o_supported && r.pref.value == pref.value)
                })
                .collect();
            for pid in victims {
                self.remove_pref(pid);
            }
            return None;
        }
        let pid = PrefId(self.next_pref);
        self.next_pref += 1;
        retain_pref(&self.symbols, &pref);
        self.prefs.insert(pid, PrefRecord { pref, inst });
        self.slots.entry(slot).or_default().push(pid);
        self.mark_dirty(slot);
        Some(pid)
    }

    pub(crate) fn remove_pref(&mut self, pid: PrefId) {
        let Some(record) = self.prefs.remove(&pid) else {
            return;
        };
        let slot = (record.pref.id, record.pref.attr);
        if let Some(list) = self.slots.get_mut(&slot) {
            list.retain(|p| *p != pid);
            if list.is_empty() {
                self.slots.remove(&slot);
            }
        }
        self.mark_dirty(slot);
        release_pref(&self.symbols, &record.pref);
        if let Some(h) = record.inst {
            if let Some(inst) = self.instantiations.get_mut(h) {
                inst.prefs.retain(|p| *p != pid);
            }
            cycle::free_if_done(self, h);
        }
    }

    pub(crate) fn mark_dirty(&mut self, slot: (Symbol, Symbol)) {
        if !self.dirty.contains(&slot) {
            self.dirty.push(slot);
        }
    }

    /// Preferences of one slot in creation order.
    pub(crate) fn slot_prefs(&self, id: Symbol, attr: Symbol) -> Vec<Preference> {
        self.slots
            .get(&(id, attr))
            .into_iter()
            .flatten()
            .filter_map(|pid| self.prefs.get(pid).map(|r| r.pref))
            .collect()
    }

    /// Reclaim unreferenced symbols and forget their goal levels.
    fn ensure_live(&self, symbols: [Symbol; 3]) -> CogentResult<()> {
        match symbols.into_iter().find(|s| !self.symbols.contains(*s)) {
            Some(stale) => Err(SymbolError::Reclaimed {
                handle: stale.to_string(),
            }
            .into()),
            None => Ok(()),
        }
    }

    pub(crate) fn sweep(&mut self) {
        for sym in self.symbols.sweep() {
            self.id_levels.remove(&sym);
        }
    }

    pub(crate) fn try_recv_completion(&mut self) -> Option<Completion> {
        self.completions_rx.try_recv().ok()
    }
}

impl Drop for Agent {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("phase", &self.phase)
            .field("wmes", &self.wm.len())
            .field("productions", &self.productions.len())
            .field("goals", &self.goals.len())
            .field("stats", &self.stats)
            .finish()
    }
}

pub(crate) fn retain_pref(symbols: &SymbolTable, p: &Preference) {
    for s in [Some(p.id), Some(p.attr), Some(p.value), p.referent].into_iter().flatten() {
        symbols.retain(s);
    }
}

pub(crate) fn release_pref(symbols: &SymbolTable, p: &Preference) {
    for s in [Some(p.id), Some(p.attr), Some(p.value), p.referent].into_iter().flatten() {
        symbols.release(s);
    }
}

pub(crate) fn retain_matched(symbols: &SymbolTable, wmes: &[MatchedWme]) {
    for m in wmes {
        for s in [m.wme.id, m.wme.attr, m.wme.value] {
            symbols.retain(s);
        }
    }
}

pub(crate) fn release_matched(symbols: &SymbolTable, inst: &Instantiation) {
    for m in &inst.wmes {
        for s in [m.wme.id, m.wme.attr, m.wme.value] {
            symbols.release(s);
        }
    }
}
