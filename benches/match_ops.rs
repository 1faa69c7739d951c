//! Benchmarks for the match network and the decision cycle.

use std::sync::Arc;

use criterion::{Criterion, black_box, criterion_group, criterion_main};

use cogent::agent::{Agent, RunUnit};
use cogent::config::AgentConfig;
use cogent::production::{ProductionId, parse_production};
use cogent::rete::Rete;
use cogent::symbol::SymbolTable;
use cogent::wme::{WmeOrigin, WorkingMemory};

const RULES: [&str; 4] = [
    "sp {join (state <s> ^item <x>) (<x> ^color <c>) (<x> ^size <n>) --> (<s> ^seen <x>)}",
    "sp {neg (state <s> ^item <x>) -(<x> ^color red) --> (<s> ^plain <x>)}",
    "sp {pair (state <s> ^item <x> ^item { <y> <> <x> }) (<x> ^color <c>) (<y> ^color <c>) --> (<s> ^pair <x>)}",
    "sp {ncc (state <s> ^item <x>) -{(<x> ^part <p>) (<p> ^broken yes)} --> (<s> ^whole <x>)}",
];

fn bench_add_remove(c: &mut Criterion) {
    let symbols = Arc::new(SymbolTable::new());
    let goal = symbols.new_identifier('S');
    let mut rete = Rete::new(Arc::clone(&symbols));
    rete.set_goal(goal, true);
    for (i, src) in RULES.iter().enumerate() {
        let p = parse_production(src, &symbols).unwrap();
        rete.add_production(ProductionId(i as u64 + 1), &p).unwrap();
    }
    let mut wm = WorkingMemory::new(Arc::clone(&symbols));
    let item = symbols.intern_str("item");
    let color = symbols.intern_str("color");
    let size = symbols.intern_str("size");
    let colors = [symbols.intern_str("red"), symbols.intern_str("blue")];
    let items: Vec<_> = (0..50).map(|_| symbols.new_identifier('X')).collect();

    c.bench_function("add_remove_50_items", |bench| {
        bench.iter(|| {
            let mut added = Vec::new();
            for (i, &x) in items.iter().enumerate() {
                let n = symbols.intern_int(i as i64);
                for (id, attr, value) in [(goal, item, x), (x, color, colors[i % 2]), (x, size, n)] {
                    let (w, _) = wm.add(id, attr, value, false, WmeOrigin::Input);
                    rete.add_wme(w);
                    added.push(w.timetag);
                }
            }
            black_box(rete.take_changes().len());
            for tt in added.into_iter().rev() {
                wm.remove(tt).unwrap();
                rete.remove_wme(tt).unwrap();
            }
            black_box(rete.take_changes().len())
        })
    });
}

fn bench_decisions(c: &mut Criterion) {
    const COUNTER: &str = r#"
        sp {init :o-support (state <s> ^superstate nil -^count) --> (<s> ^count 0)}
        sp {propose (state <s> ^superstate nil ^count <c>) --> (<s> ^operator <o> + =) (<o> ^for <c>)}
        sp {apply (state <s> ^operator <o> ^count <c>) (<o> ^for <c>) --> (<s> ^count <c> -) (<s> ^count (+ <c> 1))}
    "#;
    let mut agent = Agent::new(AgentConfig {
        worker_threads: 0,
        ..AgentConfig::default()
    })
    .unwrap();
    agent.load_productions(COUNTER).unwrap();

    c.bench_function("decision_cycle_counter", |bench| {
        bench.iter(|| black_box(agent.run(10, RunUnit::Decision).unwrap()))
    });
}

criterion_group!(benches, bench_add_remove, bench_decisions);
criterion_main!(benches);
