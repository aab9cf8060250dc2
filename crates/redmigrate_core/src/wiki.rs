//! Wiki tree migration from Redmine to Confluence.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::confluence::DestinationApi;
use crate::error::{MigrationError, PublishError};
use crate::links::{MigrationMode, PageDirectory};
use crate::marker::{
    MigratedSet, back_reference, compose_destination_body, destination_title, migrated_titles,
    source_body_after_migration, source_page_url,
};
use crate::markup::{TargetMode, TranslateContext, translate};
use crate::publish::{PublishRequest, publish_page};
use crate::redmine::{SourceApi, WikiPage, WikiPageSummary};

const WRITE_BACK_COMMENT: &str = "Migrated to Confluence";

#[derive(Debug, Clone)]
pub struct WikiMigrationOptions {
    pub project: String,
    pub space: String,
    pub source_server: String,
    pub mode: MigrationMode,
    pub leave_link: bool,
    pub replace_source: bool,
    pub dry_run: bool,
    pub fail_fast: bool,
    pub transfer_attachments: bool,
    pub max_publish_attempts: usize,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PageOutcome {
    Published,
    AlreadyMigrated,
    WouldPublish,
    Failed,
    SkippedParentFailed,
}

impl PageOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Published => "published",
            Self::AlreadyMigrated => "already_migrated",
            Self::WouldPublish => "would_publish",
            Self::Failed => "failed",
            Self::SkippedParentFailed => "skipped_parent_failed",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WikiPageResult {
    pub title: String,
    pub outcome: PageOutcome,
    pub destination_title: Option<String>,
    pub destination_url: Option<String>,
    pub attempts: Option<usize>,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WikiMigrationReport {
    pub success: bool,
    pub dry_run: bool,
    pub mode: String,
    pub root: String,
    pub published: usize,
    pub already_migrated: usize,
    pub would_publish: usize,
    pub failed: usize,
    pub skipped: usize,
    pub pages: Vec<WikiPageResult>,
    pub errors: Vec<String>,
    pub unreachable: Vec<String>,
    pub source_request_count: usize,
    pub destination_request_count: usize,
}

/// Parent to children index built from a flat page listing.
///
/// Every listed title has an entry, leaves included. Titles without a parent,
/// or whose parent is not listed, are forest roots.
#[derive(Debug, Clone, Default)]
pub struct RelationMap {
    children: BTreeMap<String, Vec<String>>,
    roots: Vec<String>,
}

impl RelationMap {
    pub fn from_listing(listing: &[WikiPageSummary]) -> Self {
        let listed: BTreeSet<&str> = listing.iter().map(|page| page.title.as_str()).collect();
        let mut map = Self::default();
        for page in listing {
            map.children.entry(page.title.clone()).or_default();
            match page.parent.as_deref() {
                Some(parent) if listed.contains(parent) => {
                    map.children
                        .entry(parent.to_string())
                        .or_default()
                        .push(page.title.clone());
                }
                _ => {
                    if !map.roots.contains(&page.title) {
                        map.roots.push(page.title.clone());
                    }
                }
            }
        }
        map
    }

    pub fn children(&self, title: &str) -> &[String] {
        self.children.get(title).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn roots(&self) -> &[String] {
        &self.roots
    }

    pub fn titles(&self) -> impl Iterator<Item = &String> {
        self.children.keys()
    }
}

/// Mutable state of one run, owned by the caller and threaded through the walk.
#[derive(Debug, Default)]
pub struct MigrationContext {
    pub migrated: MigratedSet,
    pub relations: RelationMap,
    /// Source title to destination page id, for parent placement.
    pub destination_ids: BTreeMap<String, String>,
    /// Pages that failed, or were skipped because an ancestor failed.
    pub failed: BTreeSet<String>,
}

/// [`PageDirectory`] over the live services. Lookup errors count as misses.
pub struct ServiceDirectory<'a, S: SourceApi + ?Sized, D: DestinationApi + ?Sized> {
    source: &'a mut S,
    destination: &'a mut D,
    space: &'a str,
}

impl<'a, S: SourceApi + ?Sized, D: DestinationApi + ?Sized> ServiceDirectory<'a, S, D> {
    pub fn new(source: &'a mut S, destination: &'a mut D, space: &'a str) -> Self {
        Self {
            source,
            destination,
            space,
        }
    }
}

impl<S: SourceApi + ?Sized, D: DestinationApi + ?Sized> PageDirectory for ServiceDirectory<'_, S, D> {
    fn source_title(&mut self, project: &str, title: &str) -> Option<String> {
        match self.source.get_wiki_page(project, title, None) {
            Ok(page) => page.map(|page| page.title),
            Err(error) => {
                warn!("source lookup of {project}:{title} failed: {error:#}");
                None
            }
        }
    }

    fn destination_has(&mut self, title: &str) -> bool {
        match self.destination.page_exists(self.space, title) {
            Ok(exists) => exists,
            Err(error) => {
                warn!("destination lookup of {}/{title} failed: {error:#}", self.space);
                false
            }
        }
    }
}

pub fn migrate_wiki<S: SourceApi + ?Sized, D: DestinationApi + ?Sized>(
    source: &mut S,
    destination: &mut D,
    root_title: &str,
    options: &WikiMigrationOptions,
) -> Result<WikiMigrationReport, MigrationError> {
    let mut context = MigrationContext::default();
    migrate_wiki_with_context(source, destination, root_title, options, &mut context)
}

/// Walk the page tree from `root_title` depth-first, publishing every page
/// that was not migrated before.
pub fn migrate_wiki_with_context<S: SourceApi + ?Sized, D: DestinationApi + ?Sized>(
    source: &mut S,
    destination: &mut D,
    root_title: &str,
    options: &WikiMigrationOptions,
    context: &mut MigrationContext,
) -> Result<WikiMigrationReport, MigrationError> {
    if options.mode.is_bulk() {
        let listing = source.list_wiki_pages(&options.project)?;
        info!(
            "listed {} wiki pages in Redmine project {}",
            listing.len(),
            options.project
        );
        context.relations = RelationMap::from_listing(&listing);
    }

    let mut walker = Walker {
        source,
        destination,
        options,
        context,
        pages: Vec::new(),
        errors: Vec::new(),
    };

    walker.walk(root_title, true)?;
    if options.mode == MigrationMode::AllPages {
        let roots = walker.context.relations.roots().to_vec();
        for root in roots {
            walker.walk(&root, false)?;
        }
    }

    let unreachable: Vec<String> = if options.mode == MigrationMode::AllPages {
        walker
            .context
            .relations
            .titles()
            .filter(|title| !walker.context.migrated.contains(title))
            .cloned()
            .collect()
    } else {
        Vec::new()
    };
    for title in &unreachable {
        warn!("wiki page {title} is not reachable from any root page");
    }

    let count = |outcome: PageOutcome| {
        walker
            .pages
            .iter()
            .filter(|page| page.outcome == outcome)
            .count()
    };
    let report = WikiMigrationReport {
        success: walker.errors.is_empty(),
        dry_run: options.dry_run,
        mode: options.mode.as_str().to_string(),
        root: root_title.to_string(),
        published: count(PageOutcome::Published),
        already_migrated: count(PageOutcome::AlreadyMigrated),
        would_publish: count(PageOutcome::WouldPublish),
        failed: count(PageOutcome::Failed),
        skipped: count(PageOutcome::SkippedParentFailed),
        pages: walker.pages,
        errors: walker.errors,
        unreachable,
        source_request_count: walker.source.request_count(),
        destination_request_count: walker.destination.request_count(),
    };
    Ok(report)
}

enum Step {
    Enter { title: String, parent: Option<String> },
    Exit,
}

struct Walker<'a, S: SourceApi + ?Sized, D: DestinationApi + ?Sized> {
    source: &'a mut S,
    destination: &'a mut D,
    options: &'a WikiMigrationOptions,
    context: &'a mut MigrationContext,
    pages: Vec<WikiPageResult>,
    errors: Vec<String>,
}

impl<S: SourceApi + ?Sized, D: DestinationApi + ?Sized> Walker<'_, S, D> {
    fn walk(&mut self, root: &str, required: bool) -> Result<(), MigrationError> {
        let mut stack = vec![Step::Enter {
            title: root.to_string(),
            parent: None,
        }];
        let mut path: Vec<String> = Vec::new();

        while let Some(step) = stack.pop() {
            let (title, parent) = match step {
                Step::Exit => {
                    path.pop();
                    continue;
                }
                Step::Enter { title, parent } => (title, parent),
            };
            if path.contains(&title) {
                let mut cycle = path.clone();
                cycle.push(title);
                return Err(MigrationError::Cycle { path: cycle });
            }
            if self.context.migrated.contains(&title) {
                debug!("{title} already visited in this run");
                continue;
            }

            let parent_failed = parent
                .as_deref()
                .is_some_and(|parent| self.context.failed.contains(parent));
            self.visit(&title, parent_failed, required && path.is_empty())?;
            self.context.migrated.insert(&title);

            if self.options.mode == MigrationMode::SinglePage {
                continue;
            }
            stack.push(Step::Exit);
            for child in self.context.relations.children(&title).iter().rev() {
                stack.push(Step::Enter {
                    title: child.clone(),
                    parent: Some(title.clone()),
                });
            }
            path.push(title);
        }
        Ok(())
    }

    fn visit(&mut self, title: &str, parent_failed: bool, required: bool) -> Result<(), MigrationError> {
        if parent_failed {
            info!("skipping {title}: an ancestor failed to migrate");
            self.context.failed.insert(title.to_string());
            self.record(title, PageOutcome::SkippedParentFailed, None, None, None);
            return Ok(());
        }

        let Some(page) = self
            .source
            .get_wiki_page(&self.options.project, title, None)?
        else {
            if required {
                return Err(MigrationError::PageNotFound(title.to_string()));
            }
            let message = format!("source wiki page not found: {title}");
            warn!("{message}");
            return self.fail(title, message, None);
        };

        if self.context.migrated.should_skip(title, &page.text) {
            self.remember_existing(title, &page.text);
            info!("{title} already carries a migration marker, skipping");
            self.record(title, PageOutcome::AlreadyMigrated, None, None, None);
            return Ok(());
        }

        let source_url = source_page_url(&self.options.source_server, &self.options.project, title);
        let translated = {
            let context = TranslateContext {
                target: TargetMode::WikiPage,
                mode: self.options.mode,
                source_server: &self.options.source_server,
                project: &self.options.project,
                current_page: title,
            };
            let mut directory =
                ServiceDirectory::new(&mut *self.source, &mut *self.destination, &self.options.space);
            translate(&page.text, &context, &mut directory)
        };
        let body = compose_destination_body(&translated, &page, &source_url);
        let target_title = destination_title(title);
        let parent_id = self.parent_id(&page);

        if self.options.dry_run {
            let detail = match &parent_id {
                Some(id) => format!("would create under page {id}"),
                None => "would create at space root".to_string(),
            };
            self.record(
                title,
                PageOutcome::WouldPublish,
                Some(target_title),
                None,
                Some(detail),
            );
            return Ok(());
        }

        let request = PublishRequest {
            space: &self.options.space,
            parent_id: parent_id.as_deref(),
            title: &target_title,
            body: &body,
        };
        let published = match publish_page(
            &mut *self.destination,
            &request,
            self.options.max_publish_attempts,
        ) {
            Ok(published) => published,
            Err(error) => {
                warn!("failed to publish {title}: {error}");
                let attempts = match &error {
                    PublishError::UnrecoverableDirective { attempts, .. } => Some(*attempts),
                    PublishError::Fatal { .. } => None,
                };
                if self.options.fail_fast {
                    return Err(error.into());
                }
                return self.fail(title, error.to_string(), attempts);
            }
        };

        let handle = published.handle;
        self.context
            .destination_ids
            .insert(title.to_string(), handle.id.clone());

        let mut notes = Vec::new();
        if self.options.leave_link || self.options.replace_source {
            let sentence = back_reference(&handle.title, &handle.url);
            let text = source_body_after_migration(&page.text, &sentence, self.options.replace_source);
            if let Err(error) =
                self.source
                    .update_wiki_page(&self.options.project, title, &text, WRITE_BACK_COMMENT)
            {
                warn!("could not write back-reference into {title}: {error:#}");
                notes.push(format!("back-reference not written: {error:#}"));
            }
        }
        notes.extend(self.transfer_side_items(&page, &handle.id));

        self.pages.push(WikiPageResult {
            title: title.to_string(),
            outcome: PageOutcome::Published,
            destination_title: Some(handle.title),
            destination_url: Some(handle.url),
            attempts: Some(published.attempts),
            detail: (!notes.is_empty()).then(|| notes.join("; ")),
        });
        Ok(())
    }

    /// Attachments and the edit note. Failures are logged and returned as notes.
    fn transfer_side_items(&mut self, page: &WikiPage, page_id: &str) -> Vec<String> {
        let mut notes = Vec::new();
        if self.options.transfer_attachments {
            for attachment in &page.attachments {
                let result = self
                    .source
                    .download_attachment(&attachment.content_url)
                    .and_then(|content| {
                        self.destination
                            .attach_file(page_id, &attachment.filename, content)
                    });
                match result {
                    Ok(()) => debug!("attached {} to page {page_id}", attachment.filename),
                    Err(error) => {
                        warn!("attachment {} of {} not transferred: {error:#}", attachment.filename, page.title);
                        notes.push(format!("attachment {} not transferred", attachment.filename));
                    }
                }
            }
        }
        if !page.comments.trim().is_empty() {
            let note = format!(
                "Redmine edit note (version {}): {}",
                page.version,
                page.comments.trim()
            );
            if let Err(error) = self.destination.add_comment(page_id, &note) {
                warn!("edit note of {} not added: {error:#}", page.title);
                notes.push("edit note not added".to_string());
            }
        }
        notes
    }

    fn parent_id(&mut self, page: &WikiPage) -> Option<String> {
        let parent = page.parent.as_deref()?;
        if let Some(id) = self.context.destination_ids.get(parent) {
            return Some(id.clone());
        }
        let parent_title = destination_title(parent);
        match self.destination.get_page_id(&self.options.space, &parent_title) {
            Ok(id) => id,
            Err(error) => {
                warn!("could not look up destination parent {parent_title}: {error:#}");
                None
            }
        }
    }

    /// Record where a page migrated by an earlier run lives, so its children
    /// can be placed under it.
    fn remember_existing(&mut self, title: &str, body: &str) {
        let Some(existing) = migrated_titles(body).into_iter().next() else {
            return;
        };
        match self.destination.get_page_id(&self.options.space, &existing) {
            Ok(Some(id)) => {
                self.context.destination_ids.insert(title.to_string(), id);
            }
            Ok(None) => debug!("marker of {title} names {existing}, which does not exist"),
            Err(error) => warn!("could not look up {existing}: {error:#}"),
        }
    }

    fn fail(&mut self, title: &str, message: String, attempts: Option<usize>) -> Result<(), MigrationError> {
        self.context.failed.insert(title.to_string());
        self.errors.push(format!("{title}: {message}"));
        self.record(title, PageOutcome::Failed, None, attempts, Some(message));
        Ok(())
    }

    fn record(
        &mut self,
        title: &str,
        outcome: PageOutcome,
        destination_title: Option<String>,
        attempts: Option<usize>,
        detail: Option<String>,
    ) {
        self.pages.push(WikiPageResult {
            title: title.to_string(),
            outcome,
            destination_title,
            destination_url: None,
            attempts,
            detail,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::confluence::PageHandle;
    use crate::error::Rejection;
    use crate::redmine::WikiAttachment;

    const SERVER: &str = "https://redmine.example.org";

    #[derive(Default)]
    struct MockSource {
        pages: BTreeMap<String, WikiPage>,
        listing: Vec<WikiPageSummary>,
        updates: Vec<(String, String)>,
        request_count: usize,
    }

    impl MockSource {
        fn with_page(mut self, title: &str, parent: Option<&str>, text: &str) -> Self {
            self.pages.insert(
                title.to_string(),
                WikiPage {
                    title: title.to_string(),
                    text: text.to_string(),
                    version: 1,
                    author: "Dana Admin".to_string(),
                    comments: String::new(),
                    created_on: "2019-04-01T10:00:00Z".to_string(),
                    updated_on: "2020-01-02T11:00:00Z".to_string(),
                    parent: parent.map(ToString::to_string),
                    attachments: Vec::new(),
                },
            );
            self.listing.push(WikiPageSummary {
                title: title.to_string(),
                parent: parent.map(ToString::to_string),
            });
            self
        }
    }

    impl SourceApi for MockSource {
        fn get_wiki_page(
            &mut self,
            _project: &str,
            title: &str,
            _version: Option<u32>,
        ) -> anyhow::Result<Option<WikiPage>> {
            self.request_count += 1;
            Ok(self.pages.get(title).cloned())
        }

        fn list_wiki_pages(&mut self, _project: &str) -> anyhow::Result<Vec<WikiPageSummary>> {
            self.request_count += 1;
            Ok(self.listing.clone())
        }

        fn update_wiki_page(
            &mut self,
            _project: &str,
            title: &str,
            text: &str,
            _comment: &str,
        ) -> anyhow::Result<()> {
            self.request_count += 1;
            self.updates.push((title.to_string(), text.to_string()));
            Ok(())
        }

        fn download_attachment(&mut self, content_url: &str) -> anyhow::Result<Vec<u8>> {
            self.request_count += 1;
            if content_url.contains("broken") {
                anyhow::bail!("HTTP 500");
            }
            Ok(content_url.as_bytes().to_vec())
        }

        fn request_count(&self) -> usize {
            self.request_count
        }
    }

    #[derive(Debug, Clone)]
    struct Created {
        parent_id: Option<String>,
        title: String,
        body: String,
    }

    #[derive(Default)]
    struct MockDestination {
        existing: BTreeMap<String, String>,
        created: Vec<Created>,
        rejected: BTreeMap<String, Rejection>,
        attachments: Vec<(String, String)>,
        comments: Vec<(String, String)>,
        request_count: usize,
    }

    impl MockDestination {
        fn created_titles(&self) -> Vec<&str> {
            self.created.iter().map(|page| page.title.as_str()).collect()
        }

        fn created(&self, title: &str) -> &Created {
            self.created
                .iter()
                .find(|page| page.title == title)
                .expect("page created")
        }
    }

    impl DestinationApi for MockDestination {
        fn page_exists(&mut self, _space: &str, title: &str) -> anyhow::Result<bool> {
            self.request_count += 1;
            Ok(self.existing.contains_key(title))
        }

        fn get_page_id(&mut self, _space: &str, title: &str) -> anyhow::Result<Option<String>> {
            self.request_count += 1;
            Ok(self.existing.get(title).cloned())
        }

        fn create_page(
            &mut self,
            _space: &str,
            parent_id: Option<&str>,
            title: &str,
            body: &str,
        ) -> Result<PageHandle, Rejection> {
            self.request_count += 1;
            if let Some(rejection) = self.rejected.get(title) {
                return Err(rejection.clone());
            }
            let id = (100 + self.created.len()).to_string();
            self.existing.insert(title.to_string(), id.clone());
            self.created.push(Created {
                parent_id: parent_id.map(ToString::to_string),
                title: title.to_string(),
                body: body.to_string(),
            });
            Ok(PageHandle {
                url: format!("https://wiki.example.org/pages/{id}"),
                id,
                title: title.to_string(),
            })
        }

        fn attach_file(&mut self, page_id: &str, filename: &str, _content: Vec<u8>) -> anyhow::Result<()> {
            self.request_count += 1;
            self.attachments
                .push((page_id.to_string(), filename.to_string()));
            Ok(())
        }

        fn add_comment(&mut self, page_id: &str, body: &str) -> anyhow::Result<()> {
            self.request_count += 1;
            self.comments.push((page_id.to_string(), body.to_string()));
            Ok(())
        }

        fn request_count(&self) -> usize {
            self.request_count
        }
    }

    fn options(mode: MigrationMode) -> WikiMigrationOptions {
        WikiMigrationOptions {
            project: "docs".to_string(),
            space: "DOC".to_string(),
            source_server: SERVER.to_string(),
            mode,
            leave_link: false,
            replace_source: false,
            dry_run: false,
            fail_fast: false,
            transfer_attachments: true,
            max_publish_attempts: 25,
        }
    }

    fn tree() -> MockSource {
        MockSource::default()
            .with_page("A", None, "root")
            .with_page("B", Some("A"), "b")
            .with_page("C", Some("A"), "c")
            .with_page("D", Some("B"), "d")
    }

    fn outcomes(report: &WikiMigrationReport) -> Vec<(&str, PageOutcome)> {
        report
            .pages
            .iter()
            .map(|page| (page.title.as_str(), page.outcome))
            .collect()
    }

    #[test]
    fn relation_map_groups_children_and_finds_roots() {
        let listing = vec![
            WikiPageSummary {
                title: "Wiki".to_string(),
                parent: None,
            },
            WikiPageSummary {
                title: "Orphan".to_string(),
                parent: Some("Deleted".to_string()),
            },
            WikiPageSummary {
                title: "Child".to_string(),
                parent: Some("Wiki".to_string()),
            },
        ];
        let map = RelationMap::from_listing(&listing);
        assert_eq!(map.roots(), &["Wiki".to_string(), "Orphan".to_string()]);
        assert_eq!(map.children("Wiki"), &["Child".to_string()]);
        assert!(map.children("Child").is_empty());
        assert!(map.children("Unknown").is_empty());
    }

    #[test]
    fn subtree_walk_is_depth_first_and_places_children() {
        let mut source = tree();
        let mut destination = MockDestination::default();
        let report = migrate_wiki(&mut source, &mut destination, "A", &options(MigrationMode::Subtree))
            .expect("migrate");

        assert_eq!(destination.created_titles(), vec!["A", "B", "D", "C"]);
        assert_eq!(report.published, 4);
        assert!(report.success);
        let a_id = destination.created("A").parent_id.clone();
        assert_eq!(a_id, None);
        assert_eq!(destination.created("B").parent_id.as_deref(), Some("100"));
        assert_eq!(destination.created("D").parent_id.as_deref(), Some("101"));
        assert_eq!(destination.created("C").parent_id.as_deref(), Some("100"));
    }

    #[test]
    fn visits_each_listed_page_exactly_once() {
        let mut source = tree();
        source.listing.push(WikiPageSummary {
            title: "D".to_string(),
            parent: Some("B".to_string()),
        });
        let mut destination = MockDestination::default();
        let mut context = MigrationContext::default();
        migrate_wiki_with_context(
            &mut source,
            &mut destination,
            "A",
            &options(MigrationMode::Subtree),
            &mut context,
        )
        .expect("migrate");

        assert_eq!(context.relations.children("B"), &["D".to_string(), "D".to_string()]);
        assert_eq!(
            context.migrated.titles(),
            &["A".to_string(), "B".to_string(), "D".to_string(), "C".to_string()]
        );
        assert_eq!(destination.created.len(), 4);
    }

    #[test]
    fn cyclic_parent_data_is_a_structural_error() {
        let mut source = MockSource::default()
            .with_page("A", Some("B"), "a")
            .with_page("B", Some("A"), "b");
        let mut destination = MockDestination::default();
        let error = migrate_wiki(&mut source, &mut destination, "A", &options(MigrationMode::Subtree))
            .expect_err("cycle");
        match error {
            MigrationError::Cycle { path } => assert_eq!(path, vec!["A", "B", "A"]),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn marked_page_is_skipped_but_still_parents_its_children() {
        let mut source = MockSource::default()
            .with_page("A", None, "root")
            .with_page(
                "B",
                Some("A"),
                "old\n\n*Migrated to Confluence \"B\"* - \"B\":https://wiki.example.org/pages/9",
            )
            .with_page("D", Some("B"), "d");
        let mut destination = MockDestination::default();
        destination.existing.insert("B".to_string(), "9".to_string());

        let report = migrate_wiki(&mut source, &mut destination, "A", &options(MigrationMode::Subtree))
            .expect("migrate");

        assert_eq!(
            outcomes(&report),
            vec![
                ("A", PageOutcome::Published),
                ("B", PageOutcome::AlreadyMigrated),
                ("D", PageOutcome::Published),
            ]
        );
        assert_eq!(destination.created_titles(), vec!["A", "D"]);
        assert_eq!(destination.created("D").parent_id.as_deref(), Some("9"));
    }

    #[test]
    fn fatal_page_fails_alone_and_skips_its_descendants() {
        let mut source = tree();
        let mut destination = MockDestination::default();
        destination.rejected.insert(
            "B".to_string(),
            Rejection::new(403, "Not permitted to create page", "Forbidden"),
        );

        let report = migrate_wiki(&mut source, &mut destination, "A", &options(MigrationMode::Subtree))
            .expect("migrate");

        assert_eq!(
            outcomes(&report),
            vec![
                ("A", PageOutcome::Published),
                ("B", PageOutcome::Failed),
                ("D", PageOutcome::SkippedParentFailed),
                ("C", PageOutcome::Published),
            ]
        );
        assert!(!report.success);
        assert_eq!(report.failed, 1);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].starts_with("B: destination rejected page \"B\""));
    }

    #[test]
    fn listed_child_missing_from_source_fails_and_siblings_continue() {
        let mut source = tree();
        source.pages.remove("B");
        let mut destination = MockDestination::default();

        let report = migrate_wiki(&mut source, &mut destination, "A", &options(MigrationMode::Subtree))
            .expect("migrate");

        assert_eq!(
            outcomes(&report),
            vec![
                ("A", PageOutcome::Published),
                ("B", PageOutcome::Failed),
                ("D", PageOutcome::SkippedParentFailed),
                ("C", PageOutcome::Published),
            ]
        );
        assert_eq!(report.pages[1].detail.as_deref(), Some("source wiki page not found: B"));
        assert!(!report.success);
        assert_eq!(destination.created_titles(), vec!["A", "C"]);
    }

    #[test]
    fn fail_fast_aborts_on_first_fatal_page() {
        let mut source = tree();
        let mut destination = MockDestination::default();
        destination.rejected.insert(
            "B".to_string(),
            Rejection::new(403, "Not permitted to create page", "Forbidden"),
        );
        let mut opts = options(MigrationMode::Subtree);
        opts.fail_fast = true;

        let error = migrate_wiki(&mut source, &mut destination, "A", &opts).expect_err("abort");
        assert!(matches!(
            error,
            MigrationError::Publish(PublishError::Fatal { ref title, .. }) if title == "B"
        ));
        assert_eq!(destination.created_titles(), vec!["A"]);
    }

    #[test]
    fn single_page_scenario_links_back_and_drops_footnotes() {
        let mut source = MockSource::default()
            .with_page("Setup_Guide", None, "See [[Old Page]] for details. {{fnlist}}")
            .with_page("Old_Page", None, "old");
        let mut destination = MockDestination::default();

        let report = migrate_wiki(
            &mut source,
            &mut destination,
            "Setup_Guide",
            &options(MigrationMode::SinglePage),
        )
        .expect("migrate");

        assert_eq!(destination.created_titles(), vec!["Setup Guide"]);
        let body = &destination.created("Setup Guide").body;
        assert!(body.starts_with(
            "See [Old Page|https://redmine.example.org/projects/docs/wiki/Old_Page] for details.\n\n----\n"
        ));
        assert!(!body.contains("fnlist"));
        assert!(body.contains(
            "*Redmine source:* [Setup Guide|https://redmine.example.org/projects/docs/wiki/Setup_Guide]"
        ));
        assert_eq!(outcomes(&report), vec![("Setup_Guide", PageOutcome::Published)]);
    }

    #[test]
    fn single_page_mode_does_not_descend() {
        let mut source = tree();
        let mut destination = MockDestination::default();
        migrate_wiki(&mut source, &mut destination, "A", &options(MigrationMode::SinglePage))
            .expect("migrate");
        assert_eq!(destination.created_titles(), vec!["A"]);
    }

    #[test]
    fn leave_link_appends_marker_and_second_run_skips() {
        let mut source = MockSource::default().with_page("Setup_Guide", None, "Body text");
        let mut destination = MockDestination::default();
        let mut opts = options(MigrationMode::SinglePage);
        opts.leave_link = true;

        migrate_wiki(&mut source, &mut destination, "Setup_Guide", &opts).expect("first run");
        let (title, text) = source.updates[0].clone();
        assert_eq!(title, "Setup_Guide");
        assert_eq!(
            text,
            "Body text\n\n*Migrated to Confluence \"Setup Guide\"* - \"Setup Guide\":https://wiki.example.org/pages/100"
        );

        if let Some(page) = source.pages.get_mut("Setup_Guide") {
            page.text = text;
        }
        let report =
            migrate_wiki(&mut source, &mut destination, "Setup_Guide", &opts).expect("second run");
        assert_eq!(report.already_migrated, 1);
        assert_eq!(destination.created.len(), 1);
    }

    #[test]
    fn replace_source_keeps_only_the_back_reference() {
        let mut source = MockSource::default().with_page("Setup_Guide", None, "Body text");
        let mut destination = MockDestination::default();
        let mut opts = options(MigrationMode::SinglePage);
        opts.replace_source = true;

        migrate_wiki(&mut source, &mut destination, "Setup_Guide", &opts).expect("migrate");
        assert_eq!(
            source.updates[0].1,
            "*Migrated to Confluence \"Setup Guide\"* - \"Setup Guide\":https://wiki.example.org/pages/100"
        );
    }

    #[test]
    fn dry_run_publishes_nothing() {
        let mut source = tree();
        let mut destination = MockDestination::default();
        let mut opts = options(MigrationMode::Subtree);
        opts.dry_run = true;
        opts.leave_link = true;

        let report = migrate_wiki(&mut source, &mut destination, "A", &opts).expect("migrate");
        assert!(destination.created.is_empty());
        assert!(source.updates.is_empty());
        assert_eq!(report.would_publish, 4);
        assert!(report.dry_run);
    }

    #[test]
    fn side_item_failures_do_not_fail_the_page() {
        let mut source = MockSource::default().with_page("A", None, "root");
        if let Some(page) = source.pages.get_mut("A") {
            page.comments = "fixed typos".to_string();
            page.version = 4;
            page.attachments = vec![
                WikiAttachment {
                    filename: "diagram.png".to_string(),
                    content_url: "https://redmine.example.org/attachments/download/1/diagram.png"
                        .to_string(),
                },
                WikiAttachment {
                    filename: "broken.pdf".to_string(),
                    content_url: "https://redmine.example.org/attachments/download/2/broken.pdf"
                        .to_string(),
                },
            ];
        }
        let mut destination = MockDestination::default();

        let report = migrate_wiki(&mut source, &mut destination, "A", &options(MigrationMode::SinglePage))
            .expect("migrate");

        assert_eq!(report.pages[0].outcome, PageOutcome::Published);
        assert_eq!(
            destination.attachments,
            vec![("100".to_string(), "diagram.png".to_string())]
        );
        assert_eq!(
            destination.comments,
            vec![(
                "100".to_string(),
                "Redmine edit note (version 4): fixed typos".to_string()
            )]
        );
        assert_eq!(
            report.pages[0].detail.as_deref(),
            Some("attachment broken.pdf not transferred")
        );
    }

    #[test]
    fn missing_root_page_is_an_error() {
        let mut source = MockSource::default();
        let mut destination = MockDestination::default();
        let error = migrate_wiki(&mut source, &mut destination, "Nope", &options(MigrationMode::SinglePage))
            .expect_err("not found");
        assert!(matches!(error, MigrationError::PageNotFound(ref title) if title == "Nope"));
    }

    #[test]
    fn all_pages_walks_every_root_and_lists_unreachable_pages() {
        let mut source = MockSource::default()
            .with_page("A", None, "a")
            .with_page("E", None, "e")
            .with_page("X", Some("Y"), "x")
            .with_page("Y", Some("X"), "y");
        let mut destination = MockDestination::default();

        let report = migrate_wiki(&mut source, &mut destination, "A", &options(MigrationMode::AllPages))
            .expect("migrate");

        assert_eq!(destination.created_titles(), vec!["A", "E"]);
        assert_eq!(report.unreachable, vec!["X".to_string(), "Y".to_string()]);
        assert_eq!(report.mode, "all");
    }

    #[test]
    fn bulk_mode_links_same_project_pages_by_title() {
        let mut source = MockSource::default()
            .with_page("A", None, "see [[B]]")
            .with_page("B", Some("A"), "b");
        let mut destination = MockDestination::default();
        migrate_wiki(&mut source, &mut destination, "A", &options(MigrationMode::Subtree))
            .expect("migrate");
        assert!(destination.created("A").body.starts_with("see [B]\n\n----\n"));
    }

    #[test]
    fn report_serializes_outcomes_in_snake_case() {
        let mut source = MockSource::default().with_page("A", None, "root");
        let mut destination = MockDestination::default();
        let report = migrate_wiki(&mut source, &mut destination, "A", &options(MigrationMode::SinglePage))
            .expect("migrate");
        let json = serde_json::to_value(&report).expect("serialize");
        assert_eq!(json["pages"][0]["outcome"], "published");
        assert_eq!(json["published"], 1);
    }
}
