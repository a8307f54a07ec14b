//! Coarse interaction-state detection for assistant output.
//!
//! Everything here is pure: a chunk of raw PTY output goes in, an optional
//! state label and an optional cost amount come out. Terminal escape
//! sequences are stripped before any matching so colors and cursor movement
//! never change the result.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// What a session appears to need from the user right now.
///
/// `Idle` is never produced by [`classify`]; it exists so clients share one
/// vocabulary with anything that declares idleness from elapsed time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InteractionState {
    ApprovalNeeded,
    Executing,
    Thinking,
    WaitingInput,
    Idle,
}

/// CSI (`ESC [ params letter`) and OSC (`ESC ] ... BEL`) sequences.
static CSI: Lazy<Regex> = Lazy::new(|| Regex::new(r"\x1b\[[0-9;]*[A-Za-z]").unwrap());
static OSC: Lazy<Regex> = Lazy::new(|| Regex::new(r"\x1b\][^\x07]*\x07").unwrap());

static COST: Lazy<Regex> = Lazy::new(|| Regex::new(r"\$(\d+\.?\d*)").unwrap());

/// Ordered rule table. Earlier entries win when several match.
static RULES: Lazy<Vec<(InteractionState, Vec<Regex>)>> = Lazy::new(|| {
    let compile = |patterns: &[&str]| -> Vec<Regex> {
        patterns.iter().map(|p| Regex::new(p).unwrap()).collect()
    };
    vec![
        (
            InteractionState::ApprovalNeeded,
            compile(&[
                r"(?i)do you want to (proceed|continue)",
                r"(?i)\(y/n\)",
                r"(?i)\[Y/n\]",
                r"(?i)allow this",
                r"(?i)approve\?",
                r"(?i)press enter to approve",
            ]),
        ),
        (
            InteractionState::Executing,
            compile(&[
                r"(?i)running:",
                r"(?i)executing:",
                r"\$ .+",
                r"(?i)writing to ",
                r"(?i)reading ",
            ]),
        ),
        (
            InteractionState::Thinking,
            compile(&[
                r"[⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏]",
                r"(?i)thinking\.\.\.",
                r"(?i)processing\.\.\.",
            ]),
        ),
        (
            InteractionState::WaitingInput,
            compile(&[
                r"(?m)^>\s*$",
                r"(?m)\?\s*$",
                r"(?i)enter your (message|response)",
                r"(?i)what would you like",
                r"(?i)how can i help",
            ]),
        ),
    ]
});

/// Remove terminal control sequences that would confuse pattern matching.
pub fn strip_ansi(raw: &str) -> String {
    let without_csi = CSI.replace_all(raw, "");
    OSC.replace_all(&without_csi, "").into_owned()
}

/// Classify a chunk of output. `None` means "no signal", not "idle".
pub fn classify(chunk: &str) -> Option<InteractionState> {
    let text = strip_ansi(chunk);
    RULES
        .iter()
        .find(|(_, patterns)| patterns.iter().any(|p| p.is_match(&text)))
        .map(|(state, _)| *state)
}

/// First `$<amount>` in the chunk, if any.
///
/// Tools may reprint a running total, so successive values are not
/// guaranteed to be monotonic.
pub fn extract_cost(chunk: &str) -> Option<f64> {
    let text = strip_ansi(chunk);
    COST.captures(&text)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}
