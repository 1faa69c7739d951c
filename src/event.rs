//! Typed events emitted by an agent.
//!
//! Every observable change is published as an [`AgentEvent`] to each channel
//! obtained from [`EventBus::subscribe`]. Events carry rendered strings rather
//! than symbol handles, so they stay meaningful after the symbols are swept.

use std::fmt;
use std::sync::mpsc;

use serde::{Deserialize, Serialize};

use crate::preference::ImpasseKind;
use crate::symbol::SymbolTable;
use crate::wme::{Timetag, Wme};

/// A rendered working-memory element.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WmeView {
    pub timetag: Timetag,
    pub id: String,
    pub attr: String,
    pub value: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub acceptable: bool,
}

impl WmeView {
    pub fn new(wme: &Wme, symbols: &SymbolTable) -> Self {
        Self {
            timetag: wme.timetag,
            id: symbols.render(wme.id),
            attr: symbols.render(wme.attr),
            value: symbols.render(wme.value),
            acceptable: wme.acceptable,
        }
    }
}

impl fmt::Display for WmeView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}: {} ^{} {}", self.timetag, self.id, self.attr, self.value)?;
        if self.acceptable {
            write!(f, " +")?;
        }
        write!(f, ")")
    }
}

/// Something observable that happened inside an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum AgentEvent {
    WmeAdded {
        wme: WmeView,
    },
    WmeRemoved {
        wme: WmeView,
    },
    ProductionFired {
        production: String,
        decision: u64,
    },
    ProductionRetracted {
        production: String,
    },
    ImpasseCreated {
        level: usize,
        kind: ImpasseKind,
        state: String,
        items: Vec<String>,
    },
    ImpasseResolved {
        level: usize,
        state: String,
    },
    OutputLinkChanged {
        added: Vec<WmeView>,
        removed: Vec<WmeView>,
    },
    ChunkLearned {
        name: String,
        justification: bool,
        text: String,
    },
    /// Text from the `write` and `crlf` functions.
    Print {
        text: String,
    },
    /// The agent stopped running on its own.
    Halted {
        reason: String,
    },
}

impl AgentEvent {
    /// Kebab-case name matching the serialized `type` tag.
    pub fn name(&self) -> &'static str {
        match self {
            AgentEvent::WmeAdded { .. } => "wme-added",
            AgentEvent::WmeRemoved { .. } => "wme-removed",
            AgentEvent::ProductionFired { .. } => "production-fired",
            AgentEvent::ProductionRetracted { .. } => "production-retracted",
            AgentEvent::ImpasseCreated { .. } => "impasse-created",
            AgentEvent::ImpasseResolved { .. } => "impasse-resolved",
            AgentEvent::OutputLinkChanged { .. } => "output-link-changed",
            AgentEvent::ChunkLearned { .. } => "chunk-learned",
            AgentEvent::Print { .. } => "print",
            AgentEvent::Halted { .. } => "halted",
        }
    }
}

impl fmt::Display for AgentEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentEvent::WmeAdded { wme } => write!(f, "=>WM: {wme}"),
            AgentEvent::WmeRemoved { wme } => write!(f, "<=WM: {wme}"),
            AgentEvent::ProductionFired { production, decision } => {
                write!(f, "[{decision}] fire {production}")
            }
            AgentEvent::ProductionRetracted { production } => write!(f, "retract {production}"),
            AgentEvent::ImpasseCreated {
                level,
                kind,
                state,
                items,
            } => {
                write!(f, "impasse {state} ({kind}) at level {level}")?;
                if !items.is_empty() {
                    write!(f, " over {}", items.join(" "))?;
                }
                Ok(())
            }
            AgentEvent::ImpasseResolved { level, state } => {
                write!(f, "resolved {state} at level {level}")
            }
            AgentEvent::OutputLinkChanged { added, removed } => {
                write!(f, "output: +{} -{}", added.len(), removed.len())
            }
            AgentEvent::ChunkLearned {
                name,
                justification,
                ..
            } => {
                let what = if *justification { "justification" } else { "chunk" };
                write!(f, "learned {what} {name}")
            }
            AgentEvent::Print { text } => write!(f, "{text}"),
            AgentEvent::Halted { reason } => write!(f, "halted: {reason}"),
        }
    }
}

/// Fan-out of events to any number of channel receivers.
#[derive(Debug, Default)]
pub struct EventBus {
    subscribers: Vec<mpsc::Sender<AgentEvent>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new receiving end. Dropped receivers are pruned on publish.
    pub fn subscribe(&mut self) -> mpsc::Receiver<AgentEvent> {
        let (tx, rx) = mpsc::channel();
        self.subscribers.push(tx);
        rx
    }

    /// Whether anyone is listening; callers skip building events otherwise.
    pub fn is_active(&self) -> bool {
        !self.subscribers.is_empty()
    }

    pub fn publish(&mut self, event: AgentEvent) {
        if let Some((last, rest)) = self.subscribers.split_last() {
            let mut dead = Vec::new();
            for (i, tx) in rest.iter().enumerate() {
                if tx.send(event.clone()).is_err() {
                    dead.push(i);
                }
            }
            if last.send(event).is_err() {
                dead.push(rest.len());
            }
            for i in dead.into_iter().rev() {
                self.subscribers.remove(i);
            }
        }
    }

    /// Drop every subscriber, closing their channels.
    pub fn close(&mut self) {
        self.subscribers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn view() -> WmeView {
        WmeView {
            timetag: 4,
            id: "S1".into(),
            attr: "operator".into(),
            value: "O1".into(),
            acceptable: true,
        }
    }

    #[test]
    fn serializes_with_type_tag() {
        let event = AgentEvent::WmeAdded { wme: view() };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"wme-added\""));
        let back: AgentEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
        assert_eq!(back.name(), "wme-added");
    }

    #[test]
    fn impasse_kind_serializes_kebab_case() {
        let event = AgentEvent::ImpasseCreated {
            level: 2,
            kind: ImpasseKind::StateNoChange,
            state: "S2".into(),
            items: vec![],
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"kind\":\"state-no-change\""));
    }

    #[test]
    fn display_forms() {
        assert_eq!(view().to_string(), "(4: S1 ^operator O1 +)");
        let fired = AgentEvent::ProductionFired {
            production: "p1".into(),
            decision: 3,
        };
        assert_eq!(fired.to_string(), "[3] fire p1");
    }

    #[test]
    fn bus_fans_out_and_prunes_dropped_receivers() {
        let mut bus = EventBus::new();
        assert!(!bus.is_active());
        let a = bus.subscribe();
        let b = bus.subscribe();
        bus.publish(AgentEvent::Print { text: "hi".into() });
        assert_eq!(a.try_recv().unwrap(), AgentEvent::Print { text: "hi".into() });
        assert!(b.try_recv().is_ok());
        drop(b);
        bus.publish(AgentEvent::Print { text: "again".into() });
        assert!(a.try_recv().is_ok());
        assert_eq!(bus.subscribers.len(), 1);
    }
}
