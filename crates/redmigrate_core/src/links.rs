//! Resolution of bracketed cross-page references.

use crate::marker::{destination_title, source_page_url};

/// How much of the wiki a run migrates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationMode {
    SinglePage,
    Subtree,
    AllPages,
}

impl MigrationMode {
    /// Bulk runs can assume every same-project page ends up on the destination.
    pub fn is_bulk(self) -> bool {
        matches!(self, Self::Subtree | Self::AllPages)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::SinglePage => "single",
            Self::Subtree => "subtree",
            Self::AllPages => "all",
        }
    }
}

/// Read-only existence lookups the resolver needs. Implementations must not
/// create anything.
pub trait PageDirectory {
    /// Canonical source title of `title` in `project`, if that page exists.
    fn source_title(&mut self, project: &str, title: &str) -> Option<String>;
    /// Whether a page with this destination title exists.
    fn destination_has(&mut self, title: &str) -> bool;
}

/// Pieces of the text between the brackets of a page reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkTarget {
    /// Everything before `|`, fragment included.
    pub target: String,
    /// Target with fragment and label removed.
    pub link: String,
    pub label: Option<String>,
    pub fragment: Option<String>,
    /// Explicit `project:` qualifier.
    pub project: Option<String>,
    /// Title to look up on the source.
    pub candidate: String,
}

impl LinkTarget {
    pub fn parse(inner: &str) -> Self {
        let (target, label) = match inner.split_once('|') {
            Some((target, label)) => (target, Some(label.to_string())),
            None => (inner, None),
        };
        let (link, fragment) = match target.split_once('#') {
            Some((link, fragment)) => (link, Some(fragment.to_string())),
            None => (target, None),
        };
        let normalized = link.replace(' ', "_").replace('.', "");
        let (project, candidate) = match normalized.split_once(':') {
            Some((project, title)) => (Some(project.to_string()), title.to_string()),
            None => (None, normalized),
        };
        Self {
            target: target.to_string(),
            link: link.to_string(),
            label: label.filter(|label| !label.is_empty()),
            fragment: fragment.filter(|fragment| !fragment.is_empty()),
            project: project.filter(|project| !project.is_empty()),
            candidate,
        }
    }

    fn fragment_suffix(&self) -> String {
        self.fragment
            .as_ref()
            .map(|fragment| format!("#{fragment}"))
            .unwrap_or_default()
    }
}

/// Outcome of resolving one reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenderedLink {
    /// Reference to a destination page by title.
    Destination(String),
    /// Link back to the source wiki.
    SourceDeepLink(String),
    /// Reference to the page being translated.
    SelfReference(String),
    /// The source page does not exist; keep the original markup.
    Unresolved,
}

impl RenderedLink {
    pub fn render_or(self, original: &str) -> String {
        match self {
            Self::Destination(text) | Self::SourceDeepLink(text) | Self::SelfReference(text) => text,
            Self::Unresolved => original.to_string(),
        }
    }
}

pub struct LinkResolver<'a> {
    directory: &'a mut dyn PageDirectory,
    source_server: &'a str,
    project: &'a str,
    current_page: &'a str,
    mode: MigrationMode,
}

impl<'a> LinkResolver<'a> {
    pub fn new(
        directory: &'a mut dyn PageDirectory,
        source_server: &'a str,
        project: &'a str,
        current_page: &'a str,
        mode: MigrationMode,
    ) -> Self {
        Self {
            directory,
            source_server,
            project,
            current_page,
            mode,
        }
    }

    /// Resolve the text between the brackets of `[[...]]`.
    pub fn resolve(&mut self, inner: &str) -> RenderedLink {
        let target = LinkTarget::parse(inner);
        if target.candidate.is_empty() {
            return RenderedLink::Unresolved;
        }
        let namespace = target.project.as_deref().unwrap_or(self.project);
        let Some(source_title) = self.directory.source_title(namespace, &target.candidate) else {
            return RenderedLink::Unresolved;
        };
        let title = destination_title(&source_title);
        let same_namespace = namespace == self.project;

        if self.mode.is_bulk() {
            if same_namespace {
                return RenderedLink::Destination(destination_reference(&target, &title));
            }
            return RenderedLink::SourceDeepLink(self.deep_link(&target, namespace, &source_title));
        }

        if self.directory.destination_has(&title) {
            RenderedLink::Destination(destination_reference(&target, &title))
        } else if same_namespace && source_title == self.current_page {
            let text = target.target.replace('_', " ");
            RenderedLink::SelfReference(match &target.label {
                Some(label) => format!("[{label}|{text}]"),
                None => format!("[{text}]"),
            })
        } else {
            RenderedLink::SourceDeepLink(self.deep_link(&target, namespace, &source_title))
        }
    }

    fn deep_link(&self, target: &LinkTarget, namespace: &str, source_title: &str) -> String {
        let text = target.label.as_deref().unwrap_or(&target.link);
        format!(
            "[{text}|{}{}]",
            source_page_url(self.source_server, namespace, source_title),
            target.fragment_suffix()
        )
    }
}

fn destination_reference(target: &LinkTarget, title: &str) -> String {
    match &target.label {
        Some(label) => format!("[{label}|{title}{}]", target.fragment_suffix()),
        None => format!("[{title}{}]", target.fragment_suffix()),
    }
}
