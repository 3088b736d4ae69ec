//! Heuristic detection of sessions blocked on human input.
//!
//! Classification looks only at the tail of the most recent output chunks, so it is
//! a pure function of the text it is given and can be exercised against recorded
//! transcripts.

use regex::Regex;
use serde::Serialize;
use std::sync::OnceLock;

/// Which interactive-prompt signal matched. Cues are tried in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttentionCue {
    ChoiceMarker,
    ExplicitPhrase,
    TrailingPrompt,
}

fn ansi_escape() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\x1b\[[0-?]*[ -/]*[@-~]|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)|\x1b[@-_]")
            .expect("static ANSI pattern")
    })
}

fn cue_patterns() -> &'static [(AttentionCue, Regex)] {
    static PATTERNS: OnceLock<Vec<(AttentionCue, Regex)>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            (AttentionCue::ChoiceMarker, r"(?i)[\[(]\s*(?:y|yes)\s*/\s*(?:n|no)\s*[\])]"),
            (
                AttentionCue::ExplicitPhrase,
                r"(?i)enter your choice|waiting for input|continue\s*\?|proceed\s*\?",
            ),
        ]
        .into_iter()
        .map(|(cue, pattern)| (cue, Regex::new(pattern).expect("static attention pattern")))
        .collect()
    })
}

/// Removes terminal control sequences so that coloured prompts match like plain ones.
pub fn strip_ansi(text: &str) -> String {
    ansi_escape().replace_all(text, "").into_owned()
}

/// Last line that still shows on screen: text after the final carriage return of the
/// last non-blank line.
fn last_visible_line(text: &str) -> Option<&str> {
    text.split('\n')
        .map(|line| line.rsplit('\r').find(|seg| !seg.trim().is_empty()).unwrap_or(""))
        .filter(|line| !line.trim().is_empty())
        .last()
}

/// Returns the first cue matched by the concatenation of `chunks`, if any.
pub fn detect<S: AsRef<str>>(chunks: &[S]) -> Option<AttentionCue> {
    let joined: String = chunks.iter().map(AsRef::as_ref).collect();
    let text = strip_ansi(&joined);

    if let Some(line) = last_visible_line(&text) {
        for (cue, pattern) in cue_patterns() {
            if pattern.is_match(line) {
                return Some(*cue);
            }
        }
    }

    // A bare `?` or `:` only counts while the cursor is still on that line.
    if !text.ends_with('\n') && !text.ends_with('\r') {
        let trimmed = text.trim_end_matches([' ', '\t']);
        if trimmed.ends_with('?') || trimmed.ends_with(':') {
            return Some(AttentionCue::TrailingPrompt);
        }
    }

    None
}

/// `true` when the recent output looks like a process waiting for input.
pub fn classify<S: AsRef<str>>(chunks: &[S]) -> bool {
    detect(chunks).is_some()
}
