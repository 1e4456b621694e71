//! Text formatter — strips role-play stage directions from persona replies.
//!
//! DESIGN
//! ======
//! Detection is table-driven: `ACTION_VERBS` lists verb stems with their
//! inflections and `BRACKET_STYLES` lists the four ways a model wraps a stage
//! direction. Every (style, vocabulary) pair becomes one compiled pattern,
//! plus a catch-all for any single-line `*...*` span. Extending the
//! vocabulary never touches control flow.
//!
//! A candidate that is nothing but bracketed spans and whitespace is
//! reported as [`Formatted::Absent`] so callers drop it instead of emitting
//! an empty bubble. That check runs twice: on the raw text with any content
//! inside the brackets, and again after the vocabulary spans are stripped.

use std::sync::OnceLock;

use regex::Regex;
use tracing::debug;

// =============================================================================
// VOCABULARY
// =============================================================================

/// Physical and emotive verbs that mark a bracketed span as a stage direction.
pub const ACTION_VERBS: &[&str] = &[
    r"laugh(?:s|ed|ing)?",
    r"chuckl(?:e|es|ed|ing)",
    r"giggl(?:e|es|ed|ing)",
    r"smil(?:e|es|ed|ing)",
    r"grin(?:s|ned|ning)?",
    r"smirk(?:s|ed|ing)?",
    r"nod(?:s|ded|ding)?",
    r"sigh(?:s|ed|ing)?",
    r"shrug(?:s|ged|ging)?",
    r"wink(?:s|ed|ing)?",
    r"wav(?:e|es|ed|ing)",
    r"blush(?:es|ed|ing)?",
    r"gasp(?:s|ed|ing)?",
    r"pause(?:s|d)?|pausing",
    r"shak(?:e|es|ing)|shook",
    r"rolls?|rolled|rolling",
    r"glanc(?:e|es|ed|ing)",
    r"scratch(?:es|ed|ing)?",
    r"stretch(?:es|ed|ing)?",
    r"yawn(?:s|ed|ing)?",
    r"hug(?:s|ged|ging)?",
    r"snort(?:s|ed|ing)?",
    r"hum(?:s|med|ming)?",
    r"grumbl(?:e|es|ed|ing)",
];

/// Verbs that are just as common in ordinary asides ("look at this").
/// Inside parentheses or square brackets they only count when alone or
/// followed by one of `ACTION_TARGETS`.
pub const AMBIGUOUS_VERBS: &[&str] = &[
    r"lean(?:s|ed|ing)?",
    r"tilt(?:s|ed|ing)?",
    r"giv(?:e|es|ing)|gave",
    r"look(?:s|ed|ing)?",
    r"clear(?:s|ed|ing)?",
    r"rais(?:e|es|ed|ing)",
];

/// Body parts and directions that follow an ambiguous verb in a stage direction.
pub const ACTION_TARGETS: &[&str] = &[
    r"head",
    r"eyes?",
    r"eyebrows?",
    r"brows?",
    r"throat",
    r"hands?",
    r"shoulders?",
    r"thumbs?",
    r"chin",
    r"back",
    r"forward",
    r"in",
    r"away",
    r"around",
    r"over",
    r"closer",
];

/// One way of wrapping a stage direction: opening and closing delimiter
/// (already regex-escaped), the character class allowed inside, and whether
/// ambiguous verbs need a target.
#[derive(Debug, Clone, Copy)]
pub struct BracketStyle {
    pub open: &'static str,
    pub close: &'static str,
    pub inner: &'static str,
    pub strict: bool,
}

pub const BRACKET_STYLES: &[BracketStyle] = &[
    BracketStyle { open: r"\*", close: r"\*", inner: r"[^*\n]", strict: false },
    BracketStyle { open: r"\(", close: r"\)", inner: r"[^()\n]", strict: true },
    BracketStyle { open: r"\[", close: r"\]", inner: r"[^\[\]\n]", strict: true },
    BracketStyle { open: r"\b_", close: r"_\b", inner: r"[^_\n]", strict: false },
];

const CATCH_ALL_ASTERISK: &str = r"\*[^*\n]+\*";

// =============================================================================
// RESULT
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Formatted {
    /// Cleaned text, ready to emit.
    Text(String),
    /// Nothing but stage directions. Drop the candidate.
    Absent,
    /// Input that is not text at all, handed back untouched.
    PassThrough,
}

impl Formatted {
    /// The emit-ready text, if any.
    #[must_use]
    pub fn into_text(self) -> Option<String> {
        match self {
            Self::Text(text) => Some(text),
            Self::Absent | Self::PassThrough => None,
        }
    }
}

// =============================================================================
// PATTERNS
// =============================================================================

/// Spacing fixes applied in order after stripping: collapse runs of
/// whitespace, pull punctuation onto the preceding word, and separate a
/// sentence end from the next capitalized word.
const NORMALIZERS: &[(&str, &str)] = &[(r"\s+", " "), (r"\s+([.,!?;:])", "$1"), (r"([.!?])([A-Z])", "$1 $2")];

struct Patterns {
    /// Matches a candidate made of nothing but bracketed spans.
    whole: Option<Regex>,
    actions: Vec<Regex>,
    normalizers: Vec<(Regex, &'static str)>,
}

fn compile(source: &str) -> Option<Regex> {
    match Regex::new(source) {
        Ok(re) => Some(re),
        Err(e) => {
            tracing::error!(pattern = source, error = %e, "formatter: pattern failed to compile");
            None
        }
    }
}

fn action_source(style: &BracketStyle) -> String {
    let verbs = ACTION_VERBS.join("|");
    let ambiguous = AMBIGUOUS_VERBS.join("|");
    let inner = style.inner;
    let body = if style.strict {
        let targets = ACTION_TARGETS.join("|");
        format!(
            r"(?:(?:{verbs})\b{inner}*|(?:{ambiguous})\b(?:\s+(?:(?:a|an|the|his|her|their|my|one)\s+)?(?:{targets})\b{inner}*)?\s*)"
        )
    } else {
        format!(r"(?:{verbs}|{ambiguous})\b{inner}*")
    };
    format!(r"(?i){open}\s*(?:\w+\s+)?{body}{close}", open = style.open, close = style.close)
}

fn action_sources() -> Vec<String> {
    let mut sources: Vec<String> = BRACKET_STYLES.iter().map(action_source).collect();
    sources.push(CATCH_ALL_ASTERISK.to_string());
    sources
}

/// Any bracketed span in any style, repeated, with only whitespace around.
fn whole_source() -> String {
    let spans = BRACKET_STYLES
        .iter()
        .map(|style| format!("{}{}+{}", style.open, style.inner, style.close))
        .collect::<Vec<_>>()
        .join("|");
    format!(r"^\s*(?:(?:{spans})\s*)+$")
}

fn patterns() -> &'static Patterns {
    static PATTERNS: OnceLock<Patterns> = OnceLock::new();
    PATTERNS.get_or_init(|| Patterns {
        whole: compile(&whole_source()),
        actions: action_sources().iter().filter_map(|s| compile(s)).collect(),
        normalizers: NORMALIZERS
            .iter()
            .filter_map(|(source, replacement)| compile(source).map(|re| (re, *replacement)))
            .collect(),
    })
}

// =============================================================================
// FORMAT
// =============================================================================

/// Strip stage directions and normalize spacing for one chat bubble.
///
/// `None` (non-text input) is a pass-through, and so is the empty string,
/// which comes back as `Text("")` rather than `Absent`.
#[must_use]
pub fn format_message(text: Option<&str>) -> Formatted {
    let Some(text) = text else {
        return Formatted::PassThrough;
    };
    if text.is_empty() {
        return Formatted::Text(String::new());
    }

    let p = patterns();
    if p.whole.as_ref().is_some_and(|re| re.is_match(text)) {
        debug!("formatter: bracketed-only candidate dropped");
        return Formatted::Absent;
    }

    let mut stripped = text.to_string();
    let mut removed = 0usize;
    for re in &p.actions {
        let count = re.find_iter(&stripped).count();
        if count > 0 {
            removed += count;
            stripped = re.replace_all(&stripped, " ").into_owned();
        }
    }

    if removed > 0 && stripped.trim().is_empty() {
        debug!(spans = removed, "formatter: action-only candidate dropped");
        return Formatted::Absent;
    }

    for (re, replacement) in &p.normalizers {
        stripped = re.replace_all(&stripped, *replacement).into_owned();
    }
    let cleaned = stripped.trim().to_string();

    if removed > 0 {
        debug!(spans = removed, "formatter: stage directions stripped");
    }
    Formatted::Text(cleaned)
}

#[cfg(test)]
#[path = "formatter_test.rs"]
mod tests;
