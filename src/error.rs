//! Rich diagnostic error types for the cogent engine.
//!
//! Each subsystem defines its own error type with miette `#[diagnostic]` derives,
//! providing error codes and help text so callers know exactly what went wrong
//! and how to fix it. Recoverable errors leave the agent state unchanged;
//! internal invariant violations panic instead of returning here.

use miette::{Diagnostic, SourceSpan};
use thiserror::Error;

/// Top-level error type for the cogent engine.
///
/// Each variant wraps a subsystem-specific error, preserving the full diagnostic
/// chain (error codes, help text, source spans) through to the user.
#[derive(Debug, Error, Diagnostic)]
pub enum CogentError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Symbol(#[from] SymbolError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Wme(#[from] WmeError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Production(#[from] ProductionError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Agent(#[from] AgentError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Worker(#[from] WorkerError),
}

// ---------------------------------------------------------------------------
// Symbol errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum SymbolError {
    #[error("symbol allocator exhausted: cannot allocate more than u64::MAX symbols")]
    #[diagnostic(
        code(cogent::symbol::exhausted),
        help(
            "The symbol handle space is exhausted. This requires 2^64 interned \
             values and indicates an allocation loop."
        )
    )]
    AllocatorExhausted,

    #[error("unknown identifier: {name}")]
    #[diagnostic(
        code(cogent::symbol::unknown_identifier),
        help(
            "No live identifier has this name. Identifiers are created by the \
             architecture or by rules; inspect working memory to find valid ones."
        )
    )]
    UnknownIdentifier { name: String },

    #[error("not an identifier: {value}")]
    #[diagnostic(
        code(cogent::symbol::not_identifier),
        help("Only identifiers (a letter followed by a number, like S1) can own attributes.")
    )]
    NotAnIdentifier { value: String },

    #[error("symbol {handle} has been reclaimed")]
    #[diagnostic(
        code(cogent::symbol::reclaimed),
        help(
            "Unreferenced symbols are reclaimed at the end of every decision. \
             Intern the value again before passing it to the agent."
        )
    )]
    Reclaimed { handle: String },
}

// ---------------------------------------------------------------------------
// Working memory errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum WmeError {
    #[error("no such working memory element: {description}")]
    #[diagnostic(
        code(cogent::wme::unknown),
        help("The element is not in working memory. It may already have been removed.")
    )]
    UnknownWme { description: String },

    #[error("no working memory element with timetag {timetag}")]
    #[diagnostic(
        code(cogent::wme::unknown_timetag),
        help("Timetags are never reused; the element with this timetag has been removed.")
    )]
    UnknownTimetag { timetag: u64 },

    #[error("working memory element {timetag} is supported by rules")]
    #[diagnostic(
        code(cogent::wme::rule_supported),
        help(
            "Elements created from preferences are maintained by the architecture. \
             Only elements added with `add-wme` can be removed directly."
        )
    )]
    RuleSupported { timetag: u64 },

    #[error("working memory element {timetag} is unknown to the match network")]
    #[diagnostic(
        code(cogent::wme::not_in_network),
        help(
            "The match network and working memory disagree about this element. \
             Remove elements through the agent, not the network directly."
        )
    )]
    NotInNetwork { timetag: u64 },
}

// ---------------------------------------------------------------------------
// Parse errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum ParseError {
    #[error("unexpected {found} at byte {offset}: expected {expected}")]
    #[diagnostic(
        code(cogent::parse::unexpected),
        help("Productions have the form `sp {{name (<s> ^attr value) --> (<s> ^attr value)}}`.")
    )]
    Unexpected {
        found: String,
        expected: String,
        offset: usize,
        #[label("here")]
        span: SourceSpan,
    },

    #[error("unexpected end of input at byte {offset}: expected {expected}")]
    #[diagnostic(
        code(cogent::parse::eof),
        help("The production text is truncated. Check for a missing `}}` or `)`.")
    )]
    UnexpectedEof {
        expected: String,
        offset: usize,
        #[label("input ends here")]
        span: SourceSpan,
    },

    #[error("unterminated {what} starting at byte {offset}")]
    #[diagnostic(
        code(cogent::parse::unterminated),
        help("Close quoted constants with `|` and documentation strings with `\"`.")
    )]
    Unterminated {
        what: String,
        offset: usize,
        #[label("starts here")]
        span: SourceSpan,
    },

    #[error("unknown right-hand-side function `{name}` at byte {offset}")]
    #[diagnostic(
        code(cogent::parse::unknown_function),
        help(
            "Known functions: write, crlf, halt, interrupt, +, -, *, /, div, mod, \
             abs, concat, make-constant-symbol, retrieve."
        )
    )]
    UnknownFunction {
        name: String,
        offset: usize,
        #[label("called here")]
        span: SourceSpan,
    },
}

impl ParseError {
    /// Byte offset into the parsed text where the error was detected.
    pub fn offset(&self) -> usize {
        match self {
            ParseError::Unexpected { offset, .. }
            | ParseError::UnexpectedEof { offset, .. }
            | ParseError::Unterminated { offset, .. }
            | ParseError::UnknownFunction { offset, .. } => *offset,
        }
    }

    pub(crate) fn unexpected(found: impl Into<String>, expected: impl Into<String>, offset: usize, len: usize) -> Self {
        ParseError::Unexpected {
            found: found.into(),
            expected: expected.into(),
            offset,
            span: (offset, len.max(1)).into(),
        }
    }

    pub(crate) fn eof(expected: impl Into<String>, offset: usize) -> Self {
        ParseError::UnexpectedEof {
            expected: expected.into(),
            offset,
            span: (offset, 0).into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Production errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum ProductionError {
    #[error("production `{name}` has no positive condition")]
    #[diagnostic(
        code(cogent::production::no_positive),
        help("Every production needs at least one positive condition to anchor its match.")
    )]
    NoPositiveCondition { name: String },

    #[error("production `{name}`: variable {variable} is tested relationally before it is bound")]
    #[diagnostic(
        code(cogent::production::unbound_relational),
        help(
            "Relational tests such as `< <x>` compare against an earlier binding. \
             Bind {variable} with an equality test in a positive condition first."
        )
    )]
    UnboundRelationalVariable { name: String, variable: String },

    #[error("production `{name}`: action identifier {value} is not an identifier")]
    #[diagnostic(
        code(cogent::production::bad_action_id),
        help("Actions must target a variable bound to an identifier, such as `(<s> ^attr value)`.")
    )]
    InvalidActionIdentifier { name: String, value: String },

    #[error("no production named `{name}`")]
    #[diagnostic(
        code(cogent::production::not_found),
        help("Use `print` or the loaded production list to see valid names.")
    )]
    NotFound { name: String },
}

// ---------------------------------------------------------------------------
// Agent errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum AgentError {
    #[error("invalid configuration: {message}")]
    #[diagnostic(
        code(cogent::agent::invalid_config),
        help("Check the AgentConfig fields. {message}")
    )]
    InvalidConfig { message: String },

    #[error("cannot read configuration file {path}: {message}")]
    #[diagnostic(
        code(cogent::agent::config_file),
        help("The file must exist and contain valid TOML with AgentConfig keys.")
    )]
    ConfigFile { path: String, message: String },

    #[error("agent has been shut down")]
    #[diagnostic(
        code(cogent::agent::shut_down),
        help("A shut-down agent accepts no further commands. Create a new Agent.")
    )]
    ShutDown,

    #[error("invalid command: {message}")]
    #[diagnostic(
        code(cogent::agent::invalid_command),
        help(
            "Commands: add-wme, remove-wme, run, stop, init, sp, load-production, \
             excise, set-seed, get, set, print, remember."
        )
    )]
    InvalidCommand { message: String },

    #[error("unknown setting `{name}`")]
    #[diagnostic(
        code(cogent::agent::unknown_setting),
        help(
            "Settings: max-elaborations, learning, numeric-indifferent-mode, seed, \
             max-goal-depth, exploration, temperature."
        )
    )]
    UnknownSetting { name: String },

    #[error("invalid value `{value}` for setting `{name}`")]
    #[diagnostic(
        code(cogent::agent::invalid_setting),
        help("Check the expected type of the setting (number, on/off, avg/sum, softmax/first).")
    )]
    InvalidSetting { name: String, value: String },
}

// ---------------------------------------------------------------------------
// Worker errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum WorkerError {
    #[error("worker pool is shut down")]
    #[diagnostic(
        code(cogent::worker::shut_down),
        help("Items can only be submitted before `WorkerPool::shutdown` is called.")
    )]
    ShutDown,

    #[error("failed to spawn worker thread: {message}")]
    #[diagnostic(
        code(cogent::worker::spawn),
        help("The operating system refused to create a thread. Lower `worker_threads`.")
    )]
    Spawn { message: String },
}

/// Convenience result type for cogent operations.
pub type CogentResult<T> = std::result::Result<T, CogentError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transparent_wrapping_keeps_code() {
        let err: CogentError = ProductionError::NotFound {
            name: "p1".into(),
        }
        .into();
        let code = err.code().map(|c| c.to_string());
        assert_eq!(code.as_deref(), Some("cogent::production::not_found"));
        assert_eq!(err.to_string(), "no production named `p1`");
    }

    #[test]
    fn parse_error_reports_offset() {
        let err = ParseError::unexpected("`)`", "attribute", 17, 1);
        assert_eq!(err.offset(), 17);
        assert!(err.labels().is_some());
    }
}
