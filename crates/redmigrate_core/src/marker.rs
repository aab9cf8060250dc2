//! Migration marker, source back-references and page composition.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;

use crate::redmine::WikiPage;

/// Sentinel that marks a source page as already migrated.
pub const MIGRATION_MARKER: &str = "*Migrated to Confluence \"";

/// Footnote listing macro; everything from here on is dropped on publish.
pub const FOOTNOTE_LIST_MACRO: &str = "{{fnlist}}";

static MARKER_TITLE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"\*Migrated to Confluence "(.*?)""#).expect("valid marker regex"));

/// Whether a source body already carries the migration marker.
pub fn is_migrated(body: &str) -> bool {
    body.contains(MIGRATION_MARKER)
}

/// Destination titles named by migration markers in `body`, in order.
pub fn migrated_titles(body: &str) -> Vec<String> {
    MARKER_TITLE_RE
        .captures_iter(body)
        .filter_map(|captures| captures.get(1))
        .map(|title| title.as_str().to_string())
        .filter(|title| !title.is_empty())
        .collect()
}

/// Sentence written back into the source page after publishing.
pub fn back_reference(destination_title: &str, destination_url: &str) -> String {
    format!("{MIGRATION_MARKER}{destination_title}\"* - \"{destination_title}\":{destination_url}")
}

/// New source body after publishing: either the original body followed by
/// the back-reference, or the back-reference alone.
pub fn source_body_after_migration(original: &str, back_reference: &str, replace: bool) -> String {
    if replace {
        back_reference.to_string()
    } else {
        format!("{}\n\n{back_reference}", original.trim_end())
    }
}

/// Redmine titles use `_` where the destination uses spaces.
pub fn destination_title(source_title: &str) -> String {
    source_title.replace('_', " ")
}

/// Deep link to a source wiki page.
pub fn source_page_url(server: &str, project: &str, title: &str) -> String {
    format!("{server}/projects/{project}/wiki/{title}")
}

/// Final destination body: the translated text up to `{{fnlist}}` plus a
/// provenance footer.
pub fn compose_destination_body(translated: &str, page: &WikiPage, source_url: &str) -> String {
    let kept = match translated.find(FOOTNOTE_LIST_MACRO) {
        Some(index) => &translated[..index],
        None => translated,
    };
    let mut body = kept.trim_end().to_string();
    body.push_str("\n\n----\n");
    body.push_str(&format!(
        "*Redmine source:* [{}|{}]",
        destination_title(&page.title),
        source_url
    ));
    let mut details = Vec::new();
    if !page.author.is_empty() {
        details.push(format!("author: {}", page.author));
    }
    if !page.created_on.is_empty() {
        details.push(format!("created: {}", page.created_on));
    }
    if !page.updated_on.is_empty() {
        details.push(format!("updated: {}", page.updated_on));
    }
    if !details.is_empty() {
        body.push_str(&format!(" ({})", details.join(", ")));
    }
    body
}

/// Titles visited during one run.
///
/// A title is inserted at most once; [`MigratedSet::insert`] reports whether
/// it was new.
#[derive(Debug, Clone, Default)]
pub struct MigratedSet {
    titles: BTreeSet<String>,
    order: Vec<String>,
}

impl MigratedSet {
    pub fn contains(&self, title: &str) -> bool {
        self.titles.contains(title)
    }

    pub fn insert(&mut self, title: &str) -> bool {
        if self.titles.insert(title.to_string()) {
            self.order.push(title.to_string());
            true
        } else {
            false
        }
    }

    /// Titles in insertion order.
    pub fn titles(&self) -> &[String] {
        &self.order
    }

    /// Skip check combining both idempotency sources: a marker left by an
    /// earlier run, or a visit in this one.
    pub fn should_skip(&self, title: &str, body: &str) -> bool {
        self.contains(title) || is_migrated(body)
    }
}
