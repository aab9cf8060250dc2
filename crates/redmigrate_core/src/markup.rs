//! Textile to Confluence/Jira wiki markup translation.
//!
//! Translation is an ordered table of [`Rule`]s. Each rule sees the output of
//! the previous one, so the order in [`RULES`] is part of the contract: code
//! blocks are normalised before anything looks at braces, issue references are
//! linked before inline code is rewritten, and page links run last so that
//! they can skip the code blocks produced earlier.

use std::collections::HashMap;
use std::ops::Range;
use std::sync::LazyLock;

use regex::{Captures, Regex};
use tracing::{debug, warn};

use crate::links::{LinkResolver, LinkTarget, MigrationMode, PageDirectory, RenderedLink};

/// Sentinel some teams put on issues that were ready to move.
pub const READY_FOR_MIGRATION_FLAG: &str = "*READY FOR MIGRATION TO JIRA*";

/// Where the translated text ends up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetMode {
    /// Jira issue description or comment.
    IssueDescription,
    /// Confluence page body.
    WikiPage,
}

/// Everything a rule may consult besides the text itself.
#[derive(Debug, Clone, Copy)]
pub struct TranslateContext<'a> {
    pub target: TargetMode,
    pub mode: MigrationMode,
    pub source_server: &'a str,
    pub project: &'a str,
    /// Source title of the page being translated.
    pub current_page: &'a str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleScope {
    Always,
    WikiOnly,
}

pub type RuleFn = fn(&str, &TranslateContext<'_>, &mut dyn PageDirectory) -> String;

pub struct Rule {
    pub name: &'static str,
    pub scope: RuleScope,
    pub apply: RuleFn,
}

impl Rule {
    pub fn applies_to(&self, target: TargetMode) -> bool {
        match self.scope {
            RuleScope::Always => true,
            RuleScope::WikiOnly => target == TargetMode::WikiPage,
        }
    }
}

pub static RULES: &[Rule] = &[
    Rule {
        name: "code_blocks",
        scope: RuleScope::Always,
        apply: unwrap_code_blocks,
    },
    Rule {
        name: "ready_flag",
        scope: RuleScope::Always,
        apply: strip_ready_flag,
    },
    Rule {
        name: "issue_references",
        scope: RuleScope::Always,
        apply: link_issue_references,
    },
    Rule {
        name: "inline_code",
        scope: RuleScope::Always,
        apply: rewrite_inline_code,
    },
    Rule {
        name: "toc_macro",
        scope: RuleScope::WikiOnly,
        apply: rename_toc_macro,
    },
    Rule {
        name: "table_cells",
        scope: RuleScope::WikiOnly,
        apply: normalize_table_cells,
    },
    Rule {
        name: "notextile",
        scope: RuleScope::WikiOnly,
        apply: strip_notextile,
    },
    Rule {
        name: "code_tags",
        scope: RuleScope::WikiOnly,
        apply: rename_code_tags,
    },
    Rule {
        name: "child_pages",
        scope: RuleScope::WikiOnly,
        apply: rename_child_pages_macro,
    },
    Rule {
        name: "percent_spans",
        scope: RuleScope::WikiOnly,
        apply: rewrite_percent_spans,
    },
    Rule {
        name: "background_spans",
        scope: RuleScope::WikiOnly,
        apply: strip_background_spans,
    },
    Rule {
        name: "page_links",
        scope: RuleScope::WikiOnly,
        apply: resolve_page_links,
    },
];

/// Run every applicable rule over `text`, in table order.
pub fn translate(
    text: &str,
    context: &TranslateContext<'_>,
    directory: &mut dyn PageDirectory,
) -> String {
    let mut buffer = text.to_string();
    for rule in RULES.iter().filter(|rule| rule.applies_to(context.target)) {
        let next = (rule.apply)(&buffer, context, directory);
        if next != buffer {
            debug!(rule = rule.name, page = context.current_page, "rule rewrote text");
        }
        buffer = next;
    }
    buffer
}

static ISSUE_REF_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(^|[^&\w])#(\d+)\b").expect("valid issue reference regex"));
static INLINE_CODE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"@([^@\n]+?)@").expect("valid inline code regex"));
static CELL_MODIFIER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\|(_?)((?:[<>=~^]|\\\d+|/\d+|\{[^}\n]*\})*)\.(\s)").expect("valid cell regex")
});
static CODE_CLASS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"<code class="([^"]*)">"#).expect("valid code class regex"));
static CHILD_PAGES_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{child_pages(?:\(([^)]*)\))?\}\}").expect("valid child pages regex")
});
static PERCENT_SPAN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"%([^%\s][^%\n]*?)%").expect("valid percent span regex"));
static BACKGROUND_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{background:[^}]*\}").expect("valid background regex"));
static BRACKET_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\[\[([^\[\]\n]+)\]\]|\[([^\[\]\n]+)\]").expect("valid bracket regex")
});
static BLOCK_OPEN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{code(?::[^}]*)?\}|\{noformat\}").expect("valid block opening regex")
});

fn unwrap_code_blocks(text: &str, _: &TranslateContext<'_>, _: &mut dyn PageDirectory) -> String {
    text.replace("<pre><code class", "<code class")
        .replace("</code></pre>", "</code>")
        .replace("<pre>", "{noformat}")
        .replace("</pre>", "{noformat}")
}

fn strip_ready_flag(text: &str, _: &TranslateContext<'_>, _: &mut dyn PageDirectory) -> String {
    text.replace(READY_FOR_MIGRATION_FLAG, "")
}

/// `#123` becomes a link to issue 123 on the source tracker. A single pass
/// over the text, so `#1` never rewrites the prefix of `#12`.
fn link_issue_references(
    text: &str,
    context: &TranslateContext<'_>,
    _: &mut dyn PageDirectory,
) -> String {
    ISSUE_REF_RE
        .replace_all(text, |caps: &Captures<'_>| {
            let number = &caps[2];
            format!(
                "{}[#{number}|{}/issues/{number}]",
                &caps[1], context.source_server
            )
        })
        .into_owned()
}

/// `@code@` becomes `{{code}}` when the at-signs are not part of a word,
/// which leaves e-mail addresses alone.
fn rewrite_inline_code(text: &str, _: &TranslateContext<'_>, _: &mut dyn PageDirectory) -> String {
    rewrite_matches(text, &INLINE_CODE_RE, |caps, whole| {
        let span = caps.get(0)?;
        let inner = caps.get(1)?.as_str();
        if inner.starts_with(char::is_whitespace) || inner.ends_with(char::is_whitespace) {
            return None;
        }
        if char_before(whole, span.start()).is_some_and(char::is_alphanumeric)
            || char_after(whole, span.end()).is_some_and(char::is_alphanumeric)
        {
            return None;
        }
        Some(format!("{{{{{inner}}}}}"))
    })
}

fn rename_toc_macro(text: &str, _: &TranslateContext<'_>, _: &mut dyn PageDirectory) -> String {
    text.replace("{{>toc}}", "{toc}")
        .replace("{{<toc}}", "{toc}")
        .replace("{{toc}}", "{toc}")
}

/// Only lines that start a table row are touched.
fn normalize_table_cells(text: &str, _: &TranslateContext<'_>, _: &mut dyn PageDirectory) -> String {
    text.split_inclusive('\n')
        .map(|line| {
            if line.trim_start().starts_with('|') {
                normalize_table_row(line)
            } else {
                line.to_string()
            }
        })
        .collect()
}

fn normalize_table_row(line: &str) -> String {
    // An empty `||` cell would read as a header marker on the destination.
    let expanded = line.replace("||", "| | ");
    CELL_MODIFIER_RE
        .replace_all(&expanded, |caps: &Captures<'_>| {
            let header = !caps[1].is_empty();
            if !header && caps[2].is_empty() {
                return caps[0].to_string();
            }
            let marker = if header { "||" } else { "|" };
            format!("{marker}{}", &caps[3])
        })
        .into_owned()
}

fn strip_notextile(text: &str, _: &TranslateContext<'_>, _: &mut dyn PageDirectory) -> String {
    text.replace("<notextile>", "").replace("</notextile>", "")
}

fn rename_code_tags(text: &str, _: &TranslateContext<'_>, _: &mut dyn PageDirectory) -> String {
    let plain = text.replace("<code>", "{code}").replace("</code>", "{code}");
    CODE_CLASS_RE
        .replace_all(&plain, "{code:language=$1}")
        .into_owned()
}

fn rename_child_pages_macro(
    text: &str,
    _: &TranslateContext<'_>,
    _: &mut dyn PageDirectory,
) -> String {
    CHILD_PAGES_RE
        .replace_all(text, |caps: &Captures<'_>| {
            let depth = caps.get(1).and_then(|args| {
                args.as_str()
                    .split(',')
                    .filter_map(|arg| arg.trim().strip_prefix("depth="))
                    .map(str::trim)
                    .find(|value| !value.is_empty())
            });
            match depth {
                Some(depth) => format!("{{children:sort=creation|depth={depth}}}"),
                None => "{children:sort=creation}".to_string(),
            }
        })
        .into_owned()
}

/// `%span%` becomes `*span*`. An opening `%` glued to a word (`50%`, `%20`)
/// does not start a span.
fn rewrite_percent_spans(text: &str, _: &TranslateContext<'_>, _: &mut dyn PageDirectory) -> String {
    rewrite_matches(text, &PERCENT_SPAN_RE, |caps, whole| {
        let span = caps.get(0)?;
        let inner = caps.get(1)?.as_str();
        if char_before(whole, span.start()).is_some_and(char::is_alphanumeric)
            || inner.ends_with(char::is_whitespace)
        {
            return None;
        }
        Some(format!("*{inner}*"))
    })
}

fn strip_background_spans(text: &str, _: &TranslateContext<'_>, _: &mut dyn PageDirectory) -> String {
    BACKGROUND_RE.replace_all(text, "").into_owned()
}

fn resolve_page_links(
    text: &str,
    context: &TranslateContext<'_>,
    directory: &mut dyn PageDirectory,
) -> String {
    let mut resolver = LinkResolver::new(
        directory,
        context.source_server,
        context.project,
        context.current_page,
        context.mode,
    );
    let mut cache: HashMap<String, RenderedLink> = HashMap::new();
    let mut output = String::with_capacity(text.len());
    let mut last = 0;
    for block in protected_blocks(text) {
        output.push_str(&rewrite_brackets(
            &text[last..block.start],
            &mut resolver,
            &mut cache,
        ));
        output.push_str(&text[block.clone()]);
        last = block.end;
    }
    output.push_str(&rewrite_brackets(&text[last..], &mut resolver, &mut cache));
    output
}

fn rewrite_brackets(
    text: &str,
    resolver: &mut LinkResolver<'_>,
    cache: &mut HashMap<String, RenderedLink>,
) -> String {
    rewrite_matches(text, &BRACKET_RE, |caps, _| {
        let original = caps.get(0)?.as_str();
        let inner = match (caps.get(1), caps.get(2)) {
            (Some(double), _) => double.as_str(),
            (None, Some(single)) if is_link_candidate(single.as_str()) => single.as_str(),
            _ => return None,
        };
        let rendered = cache
            .entry(inner.to_string())
            .or_insert_with(|| {
                let rendered = resolver.resolve(inner);
                if rendered == RenderedLink::Unresolved {
                    warn!(
                        "could not find a Redmine wiki page with title - {}",
                        LinkTarget::parse(inner).link
                    );
                }
                rendered
            })
            .clone();
        Some(rendered.render_or(original))
    })
}

/// Byte ranges of closed `{code}` and `{noformat}` blocks. A tag wrapped in
/// another pair of braces (`{{code}}`, inline monospace) is not a block tag.
fn protected_blocks(text: &str) -> Vec<Range<usize>> {
    let is_tag = |start: usize, end: usize| {
        char_before(text, start) != Some('{') && char_after(text, end) != Some('}')
    };
    let mut blocks = Vec::new();
    let mut pos = 0;
    while let Some(open) = BLOCK_OPEN_RE.find_at(text, pos) {
        if !is_tag(open.start(), open.end()) {
            pos = next_char_boundary(text, open.start());
            continue;
        }
        let close = if open.as_str().starts_with("{code") {
            "{code}"
        } else {
            "{noformat}"
        };
        let closing = text[open.end()..]
            .match_indices(close)
            .map(|(offset, _)| open.end() + offset)
            .find(|&start| is_tag(start, start + close.len()));
        match closing {
            Some(start) => {
                let end = start + close.len();
                blocks.push(open.start()..end);
                pos = end;
            }
            None => pos = next_char_boundary(text, open.start()),
        }
    }
    blocks
}

/// Single-bracket spans that are clearly not page names are left alone:
/// existing external links, issue links, footnote numbers.
fn is_link_candidate(inner: &str) -> bool {
    let trimmed = inner.trim();
    !(trimmed.is_empty()
        || trimmed.starts_with('#')
        || trimmed.contains("://")
        || trimmed.chars().all(|ch| ch.is_ascii_digit()))
}

/// Replace the regex matches for which `rewrite` returns `Some`.
fn rewrite_matches<F>(text: &str, re: &Regex, mut rewrite: F) -> String
where
    F: FnMut(&Captures<'_>, &str) -> Option<String>,
{
    let mut output = String::with_capacity(text.len());
    let mut last = 0;
    let mut pos = 0;
    while pos <= text.len() {
        let Some(caps) = re.captures_at(text, pos) else {
            break;
        };
        let Some(whole) = caps.get(0) else {
            break;
        };
        match rewrite(&caps, text) {
            Some(replacement) if !whole.is_empty() => {
                output.push_str(&text[last..whole.start()]);
                output.push_str(&replacement);
                last = whole.end();
                pos = whole.end();
            }
            // A rejected match may end on the delimiter that opens the next
            // span, so scanning resumes just past its start.
            _ => pos = next_char_boundary(text, whole.start()),
        }
    }
    output.push_str(&text[last..]);
    output
}

fn next_char_boundary(text: &str, index: usize) -> usize {
    index + char_after(text, index).map_or(1, char::len_utf8)
}

fn char_before(text: &str, index: usize) -> Option<char> {
    text[..index].chars().next_back()
}

fn char_after(text: &str, index: usize) -> Option<char> {
    text[index..].chars().next()
}
