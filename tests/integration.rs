//! End-to-end tests for the cogent engine.
//!
//! These drive whole agents through their decision cycle: rule support and
//! retraction, decisions and impasses, learning, background retrievals and
//! command scripts.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::Receiver;
use std::thread;
use std::time::Duration;

use cogent::agent::{Agent, RunUnit};
use cogent::command::CommandOutcome;
use cogent::config::{AgentConfig, ExplorationPolicy};
use cogent::event::AgentEvent;
use cogent::memory::{AssociativeStore, LongTermStore, Record};
use cogent::preference::ImpasseKind;
use cogent::production::ProductionKind;

fn inline_agent() -> Agent {
    Agent::new(AgentConfig {
        worker_threads: 0,
        ..AgentConfig::default()
    })
    .unwrap()
}

fn printed(events: &Receiver<AgentEvent>) -> Vec<String> {
    events
        .try_iter()
        .filter_map(|e| match e {
            AgentEvent::Print { text } => Some(text),
            _ => None,
        })
        .collect()
}

#[test]
fn rule_support_follows_its_match() {
    let mut agent = inline_agent();
    agent
        .load_productions("sp {p1 (<x> ^type state) --> (<x> ^done true)}")
        .unwrap();
    let s1 = agent.top_state().unwrap();
    let input = agent.input_link().unwrap();
    let type_ = agent.symbols().intern_str("type");
    let state = agent.symbols().intern_str("state");
    let input_type = agent.add_wme(input, type_, state).unwrap();

    agent.run(1, RunUnit::Elaboration).unwrap();

    let done = agent.symbols().intern_str("done");
    let truth = agent.symbols().intern_str("true");
    let on_state = agent.find_wme(s1, done, truth).expect("(S1 ^done true)");
    assert_eq!(agent.wme_support(on_state), Some(1));
    assert!(agent.find_wme(input, done, truth).is_some());

    // The top state's own structure belongs to the architecture.
    let arch = agent.find_wme(s1, type_, state).unwrap();
    assert!(agent.remove_wme(arch).is_err());

    agent.remove_wme(input_type.timetag).unwrap();
    agent.run(2, RunUnit::Elaboration).unwrap();
    assert!(agent.find_wme(input, done, truth).is_none());
    assert!(agent.find_wme(s1, done, truth).is_some());
}

#[test]
fn retraction_cascades_through_dependent_rules() {
    let mut agent = inline_agent();
    agent
        .load_productions(
            r#"
            sp {r1 (state <s> ^io.input-link.a <v>) --> (<s> ^b <v>)}
            sp {r2 (state <s> ^b <v>) --> (<s> ^c <v>)}
            sp {r3 (state <s> ^c <v>) --> (<s> ^d <v>)}
            "#,
        )
        .unwrap();
    let s1 = agent.top_state().unwrap();
    let input = agent.input_link().unwrap();
    let a = agent.symbols().intern_str("a");
    let one = agent.symbols().intern_int(1);
    let w = agent.add_wme(input, a, one).unwrap();

    agent.run(1, RunUnit::Decision).unwrap();
    for attr in ["b", "c", "d"] {
        assert_eq!(agent.values_of(s1, attr), vec![one], "^{attr}");
    }

    agent.remove_wme(w.timetag).unwrap();
    agent.run(1, RunUnit::Decision).unwrap();
    for attr in ["b", "c", "d"] {
        assert!(agent.values_of(s1, attr).is_empty(), "^{attr} survived");
    }
    assert_eq!(agent.firing_count("r3"), Some(1));
}

#[test]
fn unchanged_match_fires_once() {
    let mut agent = inline_agent();
    let events = agent.subscribe();
    agent
        .load_productions("sp {once (state <s> ^superstate nil) --> (<s> ^seen yes) (write |fired|)}")
        .unwrap();
    agent.run(5, RunUnit::Decision).unwrap();
    assert_eq!(agent.firing_count("once"), Some(1));
    assert_eq!(printed(&events), vec!["fired".to_string()]);
}

#[test]
fn mutual_better_preferences_conflict() {
    let mut agent = inline_agent();
    let events = agent.subscribe();
    agent
        .load_productions(
            r#"
            sp {propose*a (state <s> ^superstate nil) --> (<s> ^operator <o> +) (<o> ^name a)}
            sp {propose*b (state <s> ^superstate nil) --> (<s> ^operator <o> +) (<o> ^name b)}
            sp {a*better
                (state <s> ^operator <a> + ^operator <b> +)
                (<a> ^name a)
                (<b> ^name b)
                -->
                (<s> ^operator <a> > <b>)}
            sp {b*better
                (state <s> ^operator <a> + ^operator <b> +)
                (<a> ^name a)
                (<b> ^name b)
                -->
                (<s> ^operator <b> > <a>)}
            "#,
        )
        .unwrap();
    agent.run(1, RunUnit::Decision).unwrap();

    let stack = agent.goal_stack();
    assert_eq!(stack.len(), 2);
    assert_eq!(stack[0].operator, None);
    assert_eq!(stack[1].impasse, Some(ImpasseKind::Conflict));

    let created: Vec<(ImpasseKind, usize)> = events
        .try_iter()
        .filter_map(|e| match e {
            AgentEvent::ImpasseCreated { kind, items, .. } => Some((kind, items.len())),
            _ => None,
        })
        .collect();
    assert_eq!(created, vec![(ImpasseKind::Conflict, 2)]);
}

const COUNTER: &str = r#"
    sp {count*init :o-support (state <s> ^superstate nil -^count) --> (<s> ^count 0)}
    sp {propose*a (state <s> ^superstate nil ^count <c>) --> (<s> ^operator <o> + =) (<o> ^name a) (<o> ^for <c>)}
    sp {propose*b (state <s> ^superstate nil ^count <c>) --> (<s> ^operator <o> + =) (<o> ^name b) (<o> ^for <c>)}
    sp {propose*c (state <s> ^superstate nil ^count <c>) --> (<s> ^operator <o> + =) (<o> ^name c) (<o> ^for <c>)}
    sp {apply
        (state <s> ^operator <o> ^count <c>)
        (<o> ^name <n> ^for <c>)
        -->
        (<s> ^count <c> -)
        (<s> ^count (+ <c> 1))
        (write <n>)}
"#;

fn counter_run(seed: u64) -> Vec<String> {
    let mut agent = Agent::new(AgentConfig {
        seed,
        worker_threads: 0,
        ..AgentConfig::default()
    })
    .unwrap();
    let events = agent.subscribe();
    agent.load_productions(COUNTER).unwrap();
    agent.run(12, RunUnit::Decision).unwrap();
    printed(&events)
}

#[test]
fn indifferent_selection_is_reproducible_per_seed() {
    let first = counter_run(7);
    assert!(first.len() >= 10, "{first:?}");
    assert!(first.iter().all(|n| ["a", "b", "c"].contains(&n.as_str())));
    assert_eq!(first, counter_run(7));
}

/// Reinitialise, apply the seed command, then run twelve decisions.
fn choices_after(agent: &mut Agent, events: &Receiver<AgentEvent>, seed_command: &str) -> Vec<String> {
    agent
        .execute_script(&format!("init\n{seed_command}\nrun 12"))
        .unwrap();
    printed(events)
}

#[test]
fn reseeding_replays_the_same_choices() {
    let mut agent = inline_agent();
    let events = agent.subscribe();
    agent.load_productions(COUNTER).unwrap();

    let seven = choices_after(&mut agent, &events, "set-seed 7");
    assert!(seven.len() >= 10, "{seven:?}");
    assert_eq!(choices_after(&mut agent, &events, "set-seed 7"), seven);
    assert_eq!(choices_after(&mut agent, &events, "set seed 7"), seven);
    assert_eq!(agent.get_setting("seed").unwrap(), "7");

    let others: Vec<Vec<String>> = (8..16)
        .map(|seed| choices_after(&mut agent, &events, &format!("set-seed {seed}")))
        .collect();
    assert!(others.iter().any(|o| *o != seven));
}

#[test]
fn reinitialised_agent_replays_the_same_choices() {
    let mut agent = Agent::new(AgentConfig {
        seed: 42,
        worker_threads: 0,
        ..AgentConfig::default()
    })
    .unwrap();
    let events = agent.subscribe();
    agent.load_productions(COUNTER).unwrap();
    agent.run(8, RunUnit::Decision).unwrap();
    let before = printed(&events);

    agent.init().unwrap();
    agent.run(8, RunUnit::Decision).unwrap();
    assert_eq!(printed(&events), before);
}

#[test]
fn learned_chunk_survives_print_and_reload() {
    let script = r#"
        # prefer `a` when the two proposals tie
        set learning on
        set exploration first
        sp {propose*a (state <s> ^superstate nil -^done) --> (<s> ^operator <o> +) (<o> ^name a)}
        sp {propose*b (state <s> ^superstate nil -^done) --> (<s> ^operator <o> +) (<o> ^name b)}
        sp {tie*prefer-a
            (state <s> ^impasse tie ^superstate <ss> ^item <o>)
            (<o> ^name a)
            -->
            (<ss> ^operator <o> >)}
        run 2
    "#;
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("tie.cmd");
    std::fs::write(&path, script).unwrap();

    let mut learner = inline_agent();
    let text = std::fs::read_to_string(&path).unwrap();
    let outcomes = learner.execute_script(&text).unwrap();
    assert!(matches!(outcomes.last(), Some(CommandOutcome::Run { .. })));

    let chunks = learner.productions_of_kind(ProductionKind::Chunk);
    assert_eq!(chunks.len(), 1);
    let printed = learner
        .execute(format!("print {}", chunks[0]).parse().unwrap())
        .unwrap()
        .to_string();
    assert!(printed.starts_with("sp {chunk-1"), "{printed}");

    // The printed chunk replaces the subgoal in a fresh agent.
    let mut fresh = inline_agent();
    fresh
        .load_productions(
            r#"
            sp {propose*a (state <s> ^superstate nil -^done) --> (<s> ^operator <o> +) (<o> ^name a)}
            sp {propose*b (state <s> ^superstate nil -^done) --> (<s> ^operator <o> +) (<o> ^name b)}
            "#,
        )
        .unwrap();
    let loaded = fresh.load_productions(&printed).unwrap();
    assert_eq!(loaded, chunks);
    fresh.run(1, RunUnit::Decision).unwrap();
    assert_eq!(fresh.goal_stack().len(), 1);
    assert_eq!(fresh.goal_stack()[0].operator.as_deref(), Some("O1"));
}

#[test]
fn config_file_round_trip() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("agent.toml");
    let config = AgentConfig {
        learning: true,
        seed: 99,
        exploration: ExplorationPolicy::First,
        worker_threads: 0,
        max_goal_depth: 3,
        ..AgentConfig::default()
    };
    config.save(&path).unwrap();

    let loaded = AgentConfig::load(&path).unwrap();
    assert_eq!(loaded, config);

    let mut agent = Agent::new(loaded).unwrap();
    assert_eq!(agent.get_setting("learning").unwrap(), "on");
    let summary = agent.run(0, RunUnit::Forever).unwrap();
    assert!(summary.halted);
    assert_eq!(agent.goal_stack().len(), 3);
}

#[test]
fn partial_config_files_take_defaults() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("agent.toml");
    std::fs::write(&path, "seed = 5\nlearning = true\n").unwrap();
    let config = AgentConfig::load(&path).unwrap();
    assert_eq!(config.seed, 5);
    assert!(config.learning);
    assert_eq!(config.max_elaborations, AgentConfig::default().max_elaborations);

    std::fs::write(&path, "temperature = -1.0\n").unwrap();
    assert!(AgentConfig::load(&path).is_err());
    let bad = AgentConfig {
        temperature: 0.0,
        ..AgentConfig::default()
    };
    assert!(Agent::new(bad).is_err());
}

#[test]
fn output_link_changes_are_reported() {
    let mut agent = inline_agent();
    let events = agent.subscribe();
    agent
        .load_productions("sp {move (state <s> ^io.output-link <out>) --> (<out> ^move north)}")
        .unwrap();
    agent.run(1, RunUnit::Decision).unwrap();
    let added: Vec<String> = events
        .try_iter()
        .filter_map(|e| match e {
            AgentEvent::OutputLinkChanged { added, .. } => Some(added),
            _ => None,
        })
        .flatten()
        .map(|w| format!("{} {}", w.attr, w.value))
        .collect();
    assert_eq!(added, vec!["move north".to_string()]);
}

const ASK: &str = r#"
    sp {ask :o-support (state <s> ^superstate nil -^asked) --> (retrieve <s> apple) (<s> ^asked yes)}
    sp {wait (state <s> ^superstate nil ^asked yes) --> (<s> ^operator <o> +) (<o> ^name wait)}
"#;

#[test]
fn inline_retrieval_lands_on_the_next_input_phase() {
    let mut agent = inline_agent();
    agent.execute("remember apple color red".parse().unwrap()).unwrap();
    agent.load_productions(ASK).unwrap();
    let s1 = agent.top_state().unwrap();

    agent.run(1, RunUnit::Decision).unwrap();
    assert!(agent.values_of(s1, "retrieved").is_empty());
    agent.run(1, RunUnit::Decision).unwrap();

    let retrieved = agent.values_of(s1, "retrieved");
    assert_eq!(retrieved.len(), 1);
    let red = agent.symbols().intern_str("red");
    assert_eq!(agent.values_of(retrieved[0], "color"), vec![red]);
}

#[test]
fn missing_record_reports_a_failure() {
    let mut agent = inline_agent();
    agent.load_productions(ASK).unwrap();
    let s1 = agent.top_state().unwrap();
    agent.run(2, RunUnit::Decision).unwrap();
    let apple = agent.symbols().intern_str("apple");
    assert_eq!(agent.values_of(s1, "retrieval-failure"), vec![apple]);
}

#[test]
fn threaded_retrieval_arrives() {
    let mut agent = Agent::new(AgentConfig {
        worker_threads: 2,
        ..AgentConfig::default()
    })
    .unwrap();
    agent.long_term_store().store("apple", "color", "red");
    agent.load_productions(ASK).unwrap();
    let s1 = agent.top_state().unwrap();

    let mut arrived = false;
    for _ in 0..200 {
        agent.run(1, RunUnit::Decision).unwrap();
        if !agent.values_of(s1, "retrieved").is_empty() {
            arrived = true;
            break;
        }
        thread::sleep(Duration::from_millis(10));
    }
    assert!(arrived);
    // The wait operator holds one no-change subgoal, never more.
    assert_eq!(agent.goal_stack().len(), 2);
}

/// Store that takes a while to answer and counts finished retrievals.
#[derive(Default)]
struct SlowStore {
    inner: AssociativeStore,
    finished: AtomicUsize,
}

impl LongTermStore for SlowStore {
    fn retrieve(&self, cue: &str) -> Option<Record> {
        thread::sleep(Duration::from_millis(100));
        let found = self.inner.retrieve(cue);
        self.finished.fetch_add(1, Ordering::SeqCst);
        found
    }

    fn store(&self, key: &str, attr: &str, value: &str) {
        self.inner.store(key, attr, value);
    }

    fn len(&self) -> usize {
        self.inner.len()
    }
}

#[test]
fn shutdown_drains_in_flight_retrievals() {
    let mut agent = Agent::new(AgentConfig {
        worker_threads: 1,
        ..AgentConfig::default()
    })
    .unwrap();
    let store = Arc::new(SlowStore::default());
    store.store("apple", "color", "red");
    agent.set_long_term_store(Arc::clone(&store) as Arc<dyn LongTermStore>);
    agent.load_productions(ASK).unwrap();
    agent.run(1, RunUnit::Decision).unwrap();

    agent.shutdown();
    assert_eq!(store.finished.load(Ordering::SeqCst), 1);
    assert!(agent.is_shut_down());
    assert!(agent.run(1, RunUnit::Decision).is_err());
    assert!(agent.load_productions(ASK).is_err());
}

#[test]
fn invariant_panic_stays_in_its_agent() {
    let healthy = thread::spawn(|| {
        let mut agent = inline_agent();
        agent
            .load_productions("sp {p1 (state <s> ^type state) --> (<s> ^done true)}")
            .unwrap();
        agent.run(1, RunUnit::Elaboration).unwrap();
        let s1 = agent.top_state().unwrap();
        agent.values_of(s1, "done").len()
    });

    let broken = thread::spawn(|| {
        let agent = inline_agent();
        let orphan = agent.symbols().intern_str("orphan");
        // Nothing holds a reference, so this underflows.
        agent.symbols().release(orphan);
    });

    assert!(broken.join().is_err());
    assert_eq!(healthy.join().unwrap(), 1);

    // A new agent on this thread is unaffected.
    let mut agent = inline_agent();
    assert!(agent.run(1, RunUnit::Decision).is_ok());
}

#[test]
fn failed_commands_do_not_stop_the_agent() {
    let mut agent = inline_agent();
    assert!(agent.execute_script("add-wme S9 color red").is_err());
    assert!(agent.execute_script("sp {broken (state <s> ^a b) -->").is_err());
    assert!(agent.execute_script("excise nothing").is_err());
    assert!(agent.execute_script("set temperature 0").is_err());

    let outcomes = agent
        .execute_script("add-wme I2 color red\nrun 1\nget temperature")
        .unwrap();
    assert_eq!(outcomes.len(), 3);
    assert_eq!(outcomes[2].to_string(), "1");
}

#[test]
fn rejected_production_text_loads_nothing() {
    let mut agent = inline_agent();
    agent
        .load_productions("sp {good (state <s> ^a b) --> (<s> ^c d)}")
        .unwrap();
    let before = agent.production_text("good").unwrap();

    let text = r#"
        sp {good (state <s> ^x y) --> (<s> ^z w)}
        sp {extra (state <s> ^x y) --> (<s> ^v w)}
        sp {bad -(<s> ^a b) --> (write x)}
    "#;
    assert!(agent.load_productions(text).is_err());
    assert_eq!(agent.production_names(), vec!["good".to_string()]);
    assert_eq!(agent.production_text("good").unwrap(), before);
}

#[test]
fn reclaimed_handles_are_rejected() {
    let mut agent = inline_agent();
    let input = agent.input_link().unwrap();
    let color = agent.symbols().intern_str("color");
    let red = agent.symbols().intern_str("red");
    // Nothing references either value, so the decision's sweep reclaims them.
    agent.run(1, RunUnit::Decision).unwrap();

    let err = agent.add_wme(input, color, red).unwrap_err();
    assert!(err.to_string().contains("reclaimed"), "{err}");
    assert!(agent.remove_wme_matching(input, color, red).is_err());

    let color = agent.symbols().intern_str("color");
    let red = agent.symbols().intern_str("red");
    let wme = agent.add_wme(input, color, red).unwrap();
    agent.run(1, RunUnit::Decision).unwrap();
    assert_eq!(agent.find_wme(input, color, red), Some(wme.timetag));
}

#[test]
fn stop_before_a_run_is_honoured_once() {
    let mut agent = inline_agent();
    agent.stop();
    let summary = agent.run(3, RunUnit::Decision).unwrap();
    assert!(summary.stopped);
    assert_eq!(summary.decisions, 0);

    let summary = agent.run(3, RunUnit::Decision).unwrap();
    assert!(!summary.stopped);
    assert_eq!(summary.decisions, 3);
}
