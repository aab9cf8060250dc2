//! Page creation with repair of rejected directives.
//!
//! Confluence refuses wiki markup that uses a macro it does not know. The
//! rejection names the macro, so the body is patched to escape it and the
//! page is submitted again until it is accepted, a non-directive rejection
//! arrives, or the attempt budget runs out.

use std::sync::LazyLock;

use regex::{Captures, Regex};
use tracing::{info, warn};

use crate::confluence::{DestinationApi, PageHandle};
use crate::error::{PublishError, Rejection};

static UNKNOWN_MACRO_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)unknown macro:?\s*(.*)").expect("valid unknown macro regex"));
static MACRO_IS_UNKNOWN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)the macro\s+['"]?([^'"\s]+)['"]?\s+is unknown"#)
        .expect("valid macro is unknown regex")
});
static UNKNOWN_MACRO_EXCEPTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"UnknownMacroMigrationException:?\s*['"]?([^'"\s]+)"#)
        .expect("valid unknown macro exception regex")
});

/// Parsed "unknown directive" rejection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectiveError {
    /// Directive name as reported, e.g. `fnlist`.
    pub directive: String,
    /// First line of the reported directive text, e.g. `{fnlist}`.
    pub directive_text: String,
    pub message: String,
}

impl DirectiveError {
    /// `None` when the rejection is not about an unknown directive.
    pub fn from_rejection(rejection: &Rejection) -> Option<Self> {
        let message = rejection.message.as_str();
        let reported = [
            &*MACRO_IS_UNKNOWN_RE,
            &*UNKNOWN_MACRO_RE,
            &*UNKNOWN_MACRO_EXCEPTION_RE,
        ]
        .into_iter()
        .find_map(|re| re.captures(message).and_then(|captures| captures.get(1)))?;
        let directive_text = reported
            .as_str()
            .lines()
            .next()
            .unwrap_or_default()
            .trim()
            .trim_matches(|ch| ch == '\'' || ch == '"')
            .to_string();
        let directive: String = directive_text
            .trim_start_matches('{')
            .chars()
            .take_while(|ch| !matches!(ch, '}' | ':' | '|' | '\'' | '"') && !ch.is_whitespace())
            .collect();
        if directive.is_empty() {
            return None;
        }
        Some(Self {
            directive,
            directive_text,
            message: rejection.message.clone(),
        })
    }
}

/// Ways to escape a rejected directive, tried in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EscapeStrategy {
    /// Every `{name` (any case) gets exactly one backslash.
    EscapeOpenings,
    /// `\{name}` still rejected: escape the closing brace too.
    EscapeClosedForm,
    /// `{ name` with whitespace after the brace.
    EscapeSpacedOpenings,
    /// Escape the nearest unescaped `{` before the reported text.
    EscapeNearestBrace,
}

impl EscapeStrategy {
    pub const ORDER: [Self; 4] = [
        Self::EscapeOpenings,
        Self::EscapeClosedForm,
        Self::EscapeSpacedOpenings,
        Self::EscapeNearestBrace,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::EscapeOpenings => "escape_openings",
            Self::EscapeClosedForm => "escape_closed_form",
            Self::EscapeSpacedOpenings => "escape_spaced_openings",
            Self::EscapeNearestBrace => "escape_nearest_brace",
        }
    }

    /// The repaired body, or `None` when this strategy changes nothing.
    pub fn apply(self, body: &str, error: &DirectiveError) -> Option<String> {
        let repaired = match self {
            Self::EscapeOpenings => escape_openings(body, &error.directive, false)?,
            Self::EscapeClosedForm => escape_closed_form(body, &error.directive)?,
            Self::EscapeSpacedOpenings => escape_openings(body, &error.directive, true)?,
            Self::EscapeNearestBrace => escape_nearest_brace(body, &error.directive_text)?,
        };
        (repaired != body).then_some(repaired)
    }
}

/// First strategy that changes `body`.
pub fn repair_body(body: &str, error: &DirectiveError) -> Option<(EscapeStrategy, String)> {
    EscapeStrategy::ORDER
        .into_iter()
        .find_map(|strategy| strategy.apply(body, error).map(|repaired| (strategy, repaired)))
}

fn escape_openings(body: &str, directive: &str, spaced: bool) -> Option<String> {
    let pattern = if spaced {
        format!(r"(\\*)\{{(\s+)((?i:{}))", regex::escape(directive))
    } else {
        format!(r"(\\*)\{{()((?i:{}))", regex::escape(directive))
    };
    let re = Regex::new(&pattern).ok()?;
    let repaired = re.replace_all(body, |caps: &Captures<'_>| {
        if caps[1].len() == 1 {
            caps[0].to_string()
        } else {
            format!("\\{{{}{}", &caps[2], &caps[3])
        }
    });
    Some(repaired.into_owned())
}

fn escape_closed_form(body: &str, directive: &str) -> Option<String> {
    let escaped_open = format!("\\{{{directive}}}");
    if !body.contains(&escaped_open) {
        return None;
    }
    Some(body.replace(&escaped_open, &format!("\\{{{directive}\\}}")))
}

fn escape_nearest_brace(body: &str, directive_text: &str) -> Option<String> {
    if directive_text.is_empty() {
        return None;
    }
    let position = body.find(directive_text)?;
    let end = if directive_text.starts_with('{') {
        position + 1
    } else {
        position
    };
    let head = &body[..end];
    let brace = head
        .char_indices()
        .rev()
        .filter(|(_, ch)| *ch == '{')
        .map(|(index, _)| index)
        .find(|index| !head[..*index].ends_with('\\'))?;
    let mut repaired = String::with_capacity(body.len() + 1);
    repaired.push_str(&body[..brace]);
    repaired.push('\\');
    repaired.push_str(&body[brace..]);
    Some(repaired)
}

/// What to create on the destination.
#[derive(Debug, Clone, Copy)]
pub struct PublishRequest<'a> {
    pub space: &'a str,
    pub parent_id: Option<&'a str>,
    pub title: &'a str,
    pub body: &'a str,
}

/// Accepted attempt.
#[derive(Debug, Clone)]
pub struct Published {
    pub handle: PageHandle,
    pub attempts: usize,
    /// Body as finally accepted.
    pub body: String,
    pub escapes: Vec<AppliedEscape>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedEscape {
    pub directive: String,
    pub strategy: EscapeStrategy,
}

/// Create the page, repairing unknown-directive rejections between
/// attempts. At most `max_attempts` submissions are made.
pub fn publish_page<D: DestinationApi + ?Sized>(
    api: &mut D,
    request: &PublishRequest<'_>,
    max_attempts: usize,
) -> Result<Published, PublishError> {
    let mut body = request.body.to_string();
    let mut escapes = Vec::new();
    let mut last_directive = String::new();

    for attempt in 1..=max_attempts.max(1) {
        let rejection =
            match api.create_page(request.space, request.parent_id, request.title, &body) {
                Ok(handle) => {
                    info!(
                        "published \"{}\" as page {} after {attempt} attempt(s)",
                        request.title, handle.id
                    );
                    return Ok(Published {
                        handle,
                        attempts: attempt,
                        body,
                        escapes,
                    });
                }
                Err(rejection) => rejection,
            };

        let Some(directive) = DirectiveError::from_rejection(&rejection) else {
            return Err(PublishError::Fatal {
                title: request.title.to_string(),
                rejection,
            });
        };
        warn!(
            "destination rejected directive \"{}\" in \"{}\" (attempt {attempt}): {}",
            directive.directive, request.title, directive.message
        );
        last_directive = directive.directive.clone();

        let Some((strategy, repaired)) = repair_body(&body, &directive) else {
            return Err(PublishError::UnrecoverableDirective {
                title: request.title.to_string(),
                directive: directive.directive,
                attempts: attempt,
            });
        };
        info!(
            strategy = strategy.name(),
            "escaped directive \"{}\" in \"{}\"", directive.directive, request.title
        );
        escapes.push(AppliedEscape {
            directive: directive.directive,
            strategy,
        });
        body = repaired;
    }

    Err(PublishError::UnrecoverableDirective {
        title: request.title.to_string(),
        directive: last_directive,
        attempts: max_attempts.max(1),
    })
}
