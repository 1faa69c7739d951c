//! The command boundary: one-line text commands and command scripts.
//!
//! Every external interaction with an agent goes through [`Command`]. Text
//! forms parse with [`str::parse`]; [`split_script`] cuts a script into
//! command texts, keeping multi-line `sp {...}` bodies together.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::Serialize;
use tracing::{debug, info};

use crate::agent::{Agent, RunSummary, RunUnit};
use crate::error::{AgentError, CogentError, CogentResult, ProductionError, SymbolError};
use crate::symbol::{Symbol, looks_like_identifier};
use crate::wme::Timetag;

/// Which element `remove-wme` names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WmeSelector {
    Timetag(Timetag),
    Content {
        id: String,
        attr: String,
        value: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `add-wme S1 color red`; a value of `*` makes a new identifier.
    AddWme {
        id: String,
        attr: String,
        value: String,
    },
    RemoveWme(WmeSelector),
    /// `run` alone runs until halted or stopped.
    Run { count: u64, unit: RunUnit },
    Stop,
    Init,
    /// Full `sp {...}` text, possibly several productions.
    Production(String),
    /// `load-production <path>`.
    LoadFile(PathBuf),
    Excise(String),
    SetSeed(u32),
    Get(String),
    Set { name: String, value: String },
    /// `print` shows working memory; `print <name>` one production, or the
    /// elements of one identifier.
    Print(Option<String>),
    /// `remember key attr value` adds to the long-term store.
    Remember {
        key: String,
        attr: String,
        value: String,
    },
}

fn invalid(message: impl Into<String>) -> CogentError {
    AgentError::InvalidCommand {
        message: message.into(),
    }
    .into()
}

impl FromStr for Command {
    type Err = CogentError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let line = line.trim();
        if line.starts_with("sp") && line[2..].trim_start().starts_with('{') {
            return Ok(Command::Production(line.to_string()));
        }
        let words: Vec<&str> = line.split_whitespace().collect();
        let Some((&name, args)) = words.split_first() else {
            return Err(invalid("empty command"));
        };
        let arity = |n: usize| -> CogentResult<()> {
            if args.len() == n {
                Ok(())
            } else {
                Err(invalid(format!("`{name}` takes {n} argument(s), got {}", args.len())))
            }
        };
        match name {
            "add-wme" => {
                arity(3)?;
                Ok(Command::AddWme {
                    id: args[0].to_string(),
                    attr: strip_caret(args[1]).to_string(),
                    value: args[2].to_string(),
                })
            }
            "remove-wme" => match args {
                [tt] => tt
                    .parse()
                    .map(|t| Command::RemoveWme(WmeSelector::Timetag(t)))
                    .map_err(|_| invalid(format!("`{tt}` is not a timetag"))),
                [id, attr, value] => Ok(Command::RemoveWme(WmeSelector::Content {
                    id: id.to_string(),
                    attr: strip_caret(attr).to_string(),
                    value: value.to_string(),
                })),
                _ => Err(invalid("`remove-wme` takes a timetag or `id attr value`")),
            },
            "run" => parse_run(args),
            "stop" => arity(0).map(|_| Command::Stop),
            "init" => arity(0).map(|_| Command::Init),
            "load-production" => {
                arity(1)?;
                Ok(Command::LoadFile(PathBuf::from(args[0])))
            }
            "excise" => {
                arity(1)?;
                Ok(Command::Excise(args[0].to_string()))
            }
            "set-seed" => {
                arity(1)?;
                args[0]
                    .parse()
                    .map(Command::SetSeed)
                    .map_err(|_| invalid(format!("`{}` is not a seed", args[0])))
            }
            "get" => {
                arity(1)?;
                Ok(Command::Get(args[0].to_string()))
            }
            "set" => {
                arity(2)?;
                Ok(Command::Set {
                    name: args[0].to_string(),
                    value: args[1].to_string(),
                })
            }
            "print" => match args {
                [] => Ok(Command::Print(None)),
                [what] => Ok(Command::Print(Some(what.to_string()))),
                _ => Err(invalid("`print` takes at most one argument")),
            },
            "remember" => {
                arity(3)?;
                Ok(Command::Remember {
                    key: args[0].to_string(),
                    attr: strip_caret(args[1]).to_string(),
                    value: args[2].to_string(),
                })
            }
            other => Err(invalid(format!("unknown command `{other}`"))),
        }
    }
}

fn strip_caret(attr: &str) -> &str {
    attr.strip_prefix('^').unwrap_or(attr)
}

fn parse_run(args: &[&str]) -> CogentResult<Command> {
    let run = |count, unit| Ok(Command::Run { count, unit });
    match args {
        [] => run(0, RunUnit::Forever),
        [n] => match n.parse::<u64>() {
            Ok(count) => run(count, RunUnit::Decision),
            Err(_) => run(1, n.parse()?),
        },
        [n, unit] => {
            let count = n
                .parse()
                .map_err(|_| invalid(format!("`{n}` is not a count")))?;
            run(count, unit.parse()?)
        }
        _ => Err(invalid("`run` takes at most a count and a unit")),
    }
}

/// Split a script into command texts. Blank lines and `#` comment lines
/// are skipped; an `sp {` runs until its braces balance.
pub fn split_script(src: &str) -> CogentResult<Vec<String>> {
    let mut commands = Vec::new();
    let mut pending: Option<(String, i64, usize)> = None;
    for (n, line) in src.lines().enumerate() {
        if let Some((text, depth, _)) = pending.as_mut() {
            text.push('\n');
            text.push_str(line);
            *depth += brace_delta(line);
            if *depth <= 0 {
                if let Some((text, _, _)) = pending.take() {
                    commands.push(text);
                }
            }
            continue;
        }
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        if trimmed.starts_with("sp") {
            let depth = brace_delta(trimmed);
            if depth > 0 {
                pending = Some((trimmed.to_string(), depth, n + 1));
                continue;
            }
        }
        commands.push(trimmed.to_string());
    }
    if let Some((_, _, start)) = pending {
        return Err(invalid(format!("production starting on line {start} is never closed")));
    }
    Ok(commands)
}

/// Net brace depth of a line, ignoring braces inside `"..."` and `|...|`.
fn brace_delta(line: &str) -> i64 {
    let mut depth = 0;
    let mut quote: Option<char> = None;
    for c in line.chars() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '"' | '|') => quote = Some(c),
            (None, '{') => depth += 1,
            (None, '}') => depth -= 1,
            _ => {}
        }
    }
    depth
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

/// What a command returned.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "kebab-case")]
pub enum CommandOutcome {
    Ok,
    Timetag { timetag: Timetag },
    Run { summary: RunSummary },
    Loaded { productions: Vec<String> },
    Value { value: String },
    Text { text: String },
}

impl fmt::Display for CommandOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandOutcome::Ok => write!(f, "ok"),
            CommandOutcome::Timetag { timetag } => write!(f, "{timetag}"),
            CommandOutcome::Run { summary } => write!(
                f,
                "{} decisions, {} elaborations, {} firings{}",
                summary.decisions,
                summary.elaborations,
                summary.firings,
                if summary.halted {
                    " (halted)"
                } else if summary.stopped {
                    " (stopped)"
                } else {
                    ""
                }
            ),
            CommandOutcome::Loaded { productions } => write!(f, "loaded {}", productions.join(" ")),
            CommandOutcome::Value { value } => write!(f, "{value}"),
            CommandOutcome::Text { text } => write!(f, "{text}"),
        }
    }
}

impl Agent {
    /// Run one command. Failed commands leave the agent unchanged.
    pub fn execute(&mut self, command: Command) -> CogentResult<CommandOutcome> {
        debug!(?command, "command");
        match command {
            Command::AddWme { id, attr, value } => {
                let id = self.resolve_identifier(&id)?;
                let attr_sym = self.symbols.intern_literal(&attr);
                let value = if value == "*" {
                    let letter = attr.chars().next().unwrap_or('I');
                    self.symbols.new_identifier(letter)
                } else {
                    self.resolve_value(&value)?
                };
                let wme = self.add_wme(id, attr_sym, value)?;
                Ok(CommandOutcome::Timetag {
                    timetag: wme.timetag,
                })
            }
            Command::RemoveWme(WmeSelector::Timetag(tt)) => {
                self.remove_wme(tt)?;
                Ok(CommandOutcome::Ok)
            }
            Command::RemoveWme(WmeSelector::Content { id, attr, value }) => {
                let id = self.resolve_identifier(&id)?;
                let attr = self.symbols.intern_literal(&attr);
                let value = self.resolve_value(&value)?;
                self.remove_wme_matching(id, attr, value)?;
                Ok(CommandOutcome::Ok)
            }
            Command::Run { count, unit } => {
                let summary = self.run(count, unit)?;
                Ok(CommandOutcome::Run { summary })
            }
            Command::Stop => {
                self.stop();
                Ok(CommandOutcome::Ok)
            }
            Command::Init => {
                self.init()?;
                Ok(CommandOutcome::Ok)
            }
            Command::Production(text) => {
                let productions = self.load_productions(&text)?;
                Ok(CommandOutcome::Loaded { productions })
            }
            Command::LoadFile(path) => {
                let text = std::fs::read_to_string(&path).map_err(|e| {
                    invalid(format!("cannot read {}: {e}", path.display()))
                })?;
                let productions = self.load_productions(&text)?;
                info!(path = %path.display(), count = productions.len(), "productions loaded");
                Ok(CommandOutcome::Loaded { productions })
            }
            Command::Excise(name) => {
                self.excise(&name)?;
                Ok(CommandOutcome::Ok)
            }
            Command::SetSeed(seed) => {
                self.set_seed(u64::from(seed));
                Ok(CommandOutcome::Ok)
            }
            Command::Get(name) => Ok(CommandOutcome::Value {
                value: self.get_setting(&name)?,
            }),
            Command::Set { name, value } => {
                self.set_setting(&name, &value)?;
                Ok(CommandOutcome::Ok)
            }
            Command::Print(what) => Ok(CommandOutcome::Text {
                text: self.print(what.as_deref())?,
            }),
            Command::Remember { key, attr, value } => {
                self.long_term_store().store(&key, &attr, &value);
                Ok(CommandOutcome::Ok)
            }
        }
    }

    /// Parse and run every command of a script, stopping at the first
    /// failure.
    pub fn execute_script(&mut self, src: &str) -> CogentResult<Vec<CommandOutcome>> {
        let mut outcomes = Vec::new();
        for text in split_script(src)? {
            let command: Command = text.parse()?;
            outcomes.push(self.execute(command)?);
        }
        Ok(outcomes)
    }

    fn resolve_identifier(&self, name: &str) -> CogentResult<Symbol> {
        self.symbols.find_identifier(name).ok_or_else(|| {
            SymbolError::UnknownIdentifier {
                name: name.to_string(),
            }
            .into()
        })
    }

    fn resolve_value(&self, text: &str) -> CogentResult<Symbol> {
        if looks_like_identifier(text) {
            self.resolve_identifier(text)
        } else {
            Ok(self.symbols.intern_literal(text))
        }
    }

    fn print(&self, what: Option<&str>) -> CogentResult<String> {
        let lines: Vec<String> = match what {
            None => self.wmes().iter().map(|w| w.to_string()).collect(),
            Some(name) if looks_like_identifier(name) => {
                let id = self.resolve_identifier(name)?;
                self.wm
                    .with_id(id)
                    .map(|e| e.wme.render(&self.symbols))
                    .collect()
            }
            Some(name) => vec![self.production_text(name).ok_or_else(|| {
                CogentError::from(ProductionError::NotFound {
                    name: name.to_string(),
                })
            })?],
        };
        Ok(lines.join("\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AgentConfig;

    fn agent() -> Agent {
        Agent::new(AgentConfig {
            worker_threads: 0,
            ..AgentConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn parses_one_line_forms() {
        assert_eq!(
            "add-wme I2 ^color red".parse::<Command>().unwrap(),
            Command::AddWme {
                id: "I2".into(),
                attr: "color".into(),
                value: "red".into()
            }
        );
        assert_eq!(
            "remove-wme 7".parse::<Command>().unwrap(),
            Command::RemoveWme(WmeSelector::Timetag(7))
        );
        assert_eq!(
            "run".parse::<Command>().unwrap(),
            Command::Run {
                count: 0,
                unit: RunUnit::Forever
            }
        );
        assert_eq!(
            "run 3 e".parse::<Command>().unwrap(),
            Command::Run {
                count: 3,
                unit: RunUnit::Elaboration
            }
        );
        assert_eq!(
            "run 2".parse::<Command>().unwrap(),
            Command::Run {
                count: 2,
                unit: RunUnit::Decision
            }
        );
        assert!("run fast".parse::<Command>().is_err());
        assert!("frobnicate".parse::<Command>().is_err());
        assert!("set-seed -1".parse::<Command>().is_err());
        assert!("excise".parse::<Command>().is_err());
    }

    #[test]
    fn script_keeps_productions_whole() {
        let script = "# setup\nset learning on\n\nsp {a\n  (state <s> ^superstate nil)\n  -->\n  (<s> ^x \"}\")}\nrun 1\n";
        let commands = split_script(script).unwrap();
        assert_eq!(commands.len(), 3);
        assert!(commands[1].starts_with("sp {a"));
        assert!(commands[1].ends_with("\"}\")}"));
        assert_eq!(commands[2], "run 1");
        assert!(split_script("sp {a (state <s> ^x y)\n-->").is_err());
    }

    #[test]
    fn add_and_remove_by_content() {
        let mut a = agent();
        let tt = match a.execute("add-wme I2 color red".parse().unwrap()).unwrap() {
            CommandOutcome::Timetag { timetag } => timetag,
            other => panic!("unexpected {other:?}"),
        };
        assert!(a.wm.get(tt).is_some());
        a.execute("remove-wme I2 color red".parse().unwrap()).unwrap();
        assert!(a.wm.get(tt).is_none());
    }

    #[test]
    fn star_value_makes_an_identifier() {
        let mut a = agent();
        a.execute("add-wme I2 block *".parse().unwrap()).unwrap();
        assert!(a.symbols().find_identifier("B1").is_some());
        a.execute("add-wme B1 size 3".parse().unwrap()).unwrap();
        let b1 = a.symbols().find_identifier("B1").unwrap();
        assert_eq!(a.values_of(b1, "size"), vec![a.symbols().intern_int(3)]);
    }

    #[test]
    fn failures_leave_state_unchanged() {
        let mut a = agent();
        let before = a.wme_count();
        assert!(a.execute("add-wme Q9 color red".parse().unwrap()).is_err());
        assert!(a.execute("remove-wme 1".parse().unwrap()).is_err());
        assert!(a.execute("excise nothing".parse().unwrap()).is_err());
        assert!(a.execute("sp {broken (state <s> ^x".parse().unwrap()).is_err());
        assert_eq!(a.wme_count(), before);
        assert!(a.production_names().is_empty());
    }

    #[test]
    fn settings_round_trip() {
        let mut a = agent();
        a.execute("set max-elaborations 7".parse().unwrap()).unwrap();
        assert_eq!(
            a.execute("get max-elaborations".parse().unwrap()).unwrap(),
            CommandOutcome::Value { value: "7".into() }
        );
        assert!(a.execute("set max-elaborations zero".parse().unwrap()).is_err());
        assert!(a.execute("get colour".parse().unwrap()).is_err());
    }
}
