use std::collections::BTreeSet;

use anyhow::{Context, Result};
use similar::TextDiff;

use crate::existence::{ExistenceResolver, LiveExistence};
use crate::mediawiki::{
    EditOutcome, EditRequest, MediaWikiClientConfig, NS_MAIN, NS_TEMPLATE, WikiReadApi,
    WikiWriteApi,
};
use crate::redlink::{FilterOutcome, RedlinkFilter, Removal};
use crate::settings::{BotSettings, Credentials};
use crate::wikitext::BraceParser;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageAction {
    Unchanged,
    MissingContent,
    WouldEdit,
    Edited,
    NoChange,
    EditRejected,
}

impl PageAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unchanged => "unchanged",
            Self::MissingContent => "missing_content",
            Self::WouldEdit => "would_edit",
            Self::Edited => "edited",
            Self::NoChange => "no_change",
            Self::EditRejected => "edit_rejected",
        }
    }
}

#[derive(Debug, Clone)]
pub struct PageResult {
    pub title: String,
    pub action: PageAction,
    pub removals: Vec<Removal>,
    pub detail: Option<String>,
    pub diff: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CleanupReport {
    pub dry_run: bool,
    pub logged_in_as: String,
    pub template_names: usize,
    pub candidates: usize,
    pub pages_processed: usize,
    pub edits_made: usize,
    pub would_edit: usize,
    pub rejected: usize,
    pub pages: Vec<PageResult>,
    pub existence_queries: usize,
    pub cached_titles: usize,
    pub request_count: usize,
}

impl CleanupReport {
    /// Pages with nothing to save.
    pub fn skipped(&self) -> usize {
        self.pages
            .iter()
            .filter(|page| {
                matches!(
                    page.action,
                    PageAction::Unchanged | PageAction::MissingContent | PageAction::NoChange
                )
            })
            .count()
    }
}

/// Emitted while a run is in progress, so callers can report pages as soon
/// as they are handled instead of waiting for the final report.
#[derive(Debug, Clone, Copy)]
pub enum Progress<'a> {
    Started {
        logged_in_as: &'a str,
        template_names: usize,
        candidates: usize,
    },
    Page(&'a PageResult),
}

#[derive(Debug, Clone)]
pub struct PageInspection {
    pub title: String,
    pub template_names: usize,
    pub found: bool,
    pub outcome: Option<FilterOutcome>,
    pub diff: Option<String>,
    pub existence_queries: usize,
    pub request_count: usize,
}

/// Requires credentials before `connect` is called, so a missing credential
/// fails the run without touching the network.
pub fn run_with_connector<A, F, P>(
    settings: &BotSettings,
    connect: F,
    progress: &mut P,
) -> Result<CleanupReport>
where
    A: WikiWriteApi,
    F: FnOnce(&MediaWikiClientConfig) -> Result<A>,
    P: FnMut(Progress<'_>),
{
    let credentials = settings.require_credentials()?;
    let mut api = connect(&settings.client)?;
    run_cleanup(&mut api, settings, credentials, progress)
}

/// Runs the whole cleanup. Every page outcome goes to `progress` before the
/// next page is fetched; if the run fails part way, everything already
/// reported has happened on the wiki.
pub fn run_cleanup<A, P>(
    api: &mut A,
    settings: &BotSettings,
    credentials: &Credentials,
    progress: &mut P,
) -> Result<CleanupReport>
where
    A: WikiWriteApi,
    P: FnMut(Progress<'_>),
{
    let logged_in_as = api
        .login(&credentials.username, &credentials.password)
        .context("login failed")?;

    let filter = RedlinkFilter::new(
        BraceParser,
        load_hatnote_names(api, &settings.template_category)?,
    );
    let articles = api
        .category_members(
            &settings.article_category,
            NS_MAIN,
            Some(settings.max_articles),
        )
        .with_context(|| format!("failed to list {}", settings.article_category))?;

    let mut report = CleanupReport {
        dry_run: settings.dry_run,
        logged_in_as,
        template_names: filter.names().len(),
        candidates: articles.len(),
        pages_processed: 0,
        edits_made: 0,
        would_edit: 0,
        rejected: 0,
        pages: Vec::new(),
        existence_queries: 0,
        cached_titles: 0,
        request_count: 0,
    };
    progress(Progress::Started {
        logged_in_as: &report.logged_in_as,
        template_names: report.template_names,
        candidates: report.candidates,
    });
    let mut resolver = ExistenceResolver::new();

    for title in articles {
        let Some(revision) = api
            .page_content(&title)
            .with_context(|| format!("failed to fetch {title}"))?
        else {
            record(&mut report, progress, PageResult {
                title,
                action: PageAction::MissingContent,
                removals: Vec::new(),
                detail: None,
                diff: None,
            });
            continue;
        };
        report.pages_processed += 1;

        let outcome = filter
            .apply(
                &revision.content,
                &mut LiveExistence::new(&mut *api, &mut resolver),
            )
            .with_context(|| format!("failed to check hatnotes on {title}"))?;
        if !outcome.modified {
            record(&mut report, progress, PageResult {
                title,
                action: PageAction::Unchanged,
                removals: Vec::new(),
                detail: None,
                diff: None,
            });
            continue;
        }

        let diff = settings
            .show_diff
            .then(|| render_diff(&title, &revision.content, &outcome.text));

        if settings.dry_run {
            report.would_edit += 1;
            record(&mut report, progress, PageResult {
                title,
                action: PageAction::WouldEdit,
                removals: outcome.removals,
                detail: None,
                diff,
            });
            continue;
        }

        let edit = api.edit_page(&EditRequest {
            title: &title,
            text: &outcome.text,
            summary: &settings.edit_summary,
            base_timestamp: Some(&revision.timestamp),
        })?;
        let (action, detail) = match edit {
            EditOutcome::Saved { new_revision_id } => {
                report.edits_made += 1;
                (
                    PageAction::Edited,
                    new_revision_id.map(|id| format!("revision {id}")),
                )
            }
            EditOutcome::NoChange => (PageAction::NoChange, None),
            EditOutcome::Rejected { code, info } => {
                report.rejected += 1;
                (PageAction::EditRejected, Some(format!("[{code}] {info}")))
            }
        };
        record(&mut report, progress, PageResult {
            title,
            action,
            removals: outcome.removals,
            detail,
            diff,
        });
    }

    report.existence_queries = resolver.queries_issued();
    report.cached_titles = resolver.cached_titles();
    report.request_count = api.request_count();
    Ok(report)
}

/// Runs the filter on one page without logging in or editing.
pub fn inspect_page<A: WikiReadApi>(
    api: &mut A,
    settings: &BotSettings,
    title: &str,
) -> Result<PageInspection> {
    let filter = RedlinkFilter::new(
        BraceParser,
        load_hatnote_names(api, &settings.template_category)?,
    );
    let mut resolver = ExistenceResolver::new();

    let mut inspection = PageInspection {
        title: title.to_string(),
        template_names: filter.names().len(),
        found: false,
        outcome: None,
        diff: None,
        existence_queries: 0,
        request_count: 0,
    };

    if let Some(revision) = api
        .page_content(title)
        .with_context(|| format!("failed to fetch {title}"))?
    {
        let outcome = filter.apply(
            &revision.content,
            &mut LiveExistence::new(&mut *api, &mut resolver),
        )?;
        if outcome.modified && settings.show_diff {
            inspection.diff = Some(render_diff(
                &revision.title,
                &revision.content,
                &outcome.text,
            ));
        }
        inspection.title = revision.title;
        inspection.found = true;
        inspection.outcome = Some(outcome);
    }

    inspection.existence_queries = resolver.queries_issued();
    inspection.request_count = api.request_count();
    Ok(inspection)
}

fn record<P>(report: &mut CleanupReport, progress: &mut P, page: PageResult)
where
    P: FnMut(Progress<'_>),
{
    progress(Progress::Page(&page));
    report.pages.push(page);
}

/// Template names from the hatnote-template category, without the
/// `Template:` prefix.
pub fn load_hatnote_names<A: WikiReadApi + ?Sized>(
    api: &mut A,
    category: &str,
) -> Result<BTreeSet<String>> {
    let titles = api
        .category_members(category, NS_TEMPLATE, None)
        .with_context(|| format!("failed to list {category}"))?;
    Ok(titles
        .iter()
        .map(|title| {
            title
                .strip_prefix("Template:")
                .unwrap_or(title)
                .trim()
                .to_string()
        })
        .filter(|name| !name.is_empty())
        .collect())
}

pub fn render_diff(title: &str, before: &str, after: &str) -> String {
    TextDiff::from_lines(before, after)
        .unified_diff()
        .context_radius(2)
        .header(title, title)
        .to_string()
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::collections::{BTreeMap, BTreeSet};
    use std::path::Path;

    use anyhow::Result;

    use super::{
        PageAction, Progress, inspect_page, load_hatnote_names, render_diff, run_cleanup,
        run_with_connector,
    };
    use crate::mediawiki::{
        EditOutcome, EditRequest, ExistenceBatch, NS_TEMPLATE, PageRevision, WikiReadApi,
        WikiWriteApi,
    };
    use crate::settings::{BotSettings, SettingsOverrides};

    #[derive(Default)]
    struct MockApi {
        templates: Vec<String>,
        articles: Vec<String>,
        contents: BTreeMap<String, String>,
        existing: BTreeSet<String>,
        reject_edits: BTreeMap<String, (String, String)>,
        edits: Vec<(String, String, String)>,
        existence_calls: usize,
        logged_in: bool,
        login_fails: bool,
        unreachable: BTreeSet<String>,
        request_count: usize,
    }

    impl WikiReadApi for MockApi {
        fn category_members(
            &mut self,
            _category: &str,
            namespace: i32,
            limit: Option<usize>,
        ) -> Result<Vec<String>> {
            self.request_count += 1;
            let mut titles = if namespace == NS_TEMPLATE {
                self.templates.clone()
            } else {
                self.articles.clone()
            };
            if let Some(limit) = limit {
                titles.truncate(limit);
            }
            Ok(titles)
        }

        fn page_content(&mut self, title: &str) -> Result<Option<PageRevision>> {
            self.request_count += 1;
            if self.unreachable.contains(title) {
                anyhow::bail!("MediaWiki API request failed with HTTP 503 Service Unavailable");
            }
            Ok(self.contents.get(title).map(|content| PageRevision {
                title: title.to_string(),
                content: content.clone(),
                revision_id: 1,
                timestamp: "2026-10-01T00:00:00Z".to_string(),
            }))
        }

        fn page_existence(&mut self, titles: &[String]) -> Result<ExistenceBatch> {
            self.request_count += 1;
            self.existence_calls += 1;
            let mut batch = ExistenceBatch::default();
            for title in titles {
                batch
                    .pages
                    .insert(title.clone(), self.existing.contains(title));
            }
            Ok(batch)
        }

        fn request_count(&self) -> usize {
            self.request_count
        }
    }

    impl WikiWriteApi for MockApi {
        fn login(&mut self, username: &str, _password: &str) -> Result<String> {
            self.request_count += 1;
            if self.login_fails {
                anyhow::bail!("MediaWiki login failed: Incorrect username or password");
            }
            self.logged_in = true;
            Ok(username.to_string())
        }

        fn edit_page(&mut self, request: &EditRequest<'_>) -> Result<EditOutcome> {
            self.request_count += 1;
            assert!(self.logged_in, "edit before login");
            if let Some((code, info)) = self.reject_edits.get(request.title) {
                return Ok(EditOutcome::Rejected {
                    code: code.clone(),
                    info: info.clone(),
                });
            }
            self.edits.push((
                request.title.to_string(),
                request.text.to_string(),
                request.summary.to_string(),
            ));
            Ok(EditOutcome::Saved {
                new_revision_id: Some(100),
            })
        }
    }

    fn settings(vars: &[(&str, &str)]) -> BotSettings {
        let vars = vars
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect::<BTreeMap<_, _>>();
        BotSettings::resolve(
            |key| vars.get(key).cloned(),
            Path::new("/nonexistent-hatnotebot-cwd"),
            &SettingsOverrides::default(),
        )
        .expect("settings")
    }

    fn live_settings() -> BotSettings {
        settings(&[
            ("BOT_USER", "CleanupBot"),
            ("BOT_PASSWORD", "pw"),
            ("DRY_RUN", "false"),
        ])
    }

    fn sample_api() -> MockApi {
        let mut api = MockApi {
            templates: vec![
                "Template:Hatnote".to_string(),
                "Template:About".to_string(),
            ],
            articles: vec![
                "Broken".to_string(),
                "Fine".to_string(),
                "Deleted meanwhile".to_string(),
            ],
            ..MockApi::default()
        };
        api.contents.insert(
            "Broken".to_string(),
            "{{Hatnote|See also [[Nonexistent Page]]}}\n'''Broken''' is an article.".to_string(),
        );
        api.contents.insert(
            "Fine".to_string(),
            "{{About|the band|[[Real Page]]}}\n'''Fine''' is an article.".to_string(),
        );
        api.existing.insert("Real Page".to_string());
        api
    }

    #[test]
    fn live_run_edits_only_pages_with_redlinked_hatnotes() {
        let mut api = sample_api();
        let settings = live_settings();
        let credentials = settings.require_credentials().expect("credentials").clone();

        let report = run_cleanup(&mut api, &settings, &credentials, &mut |_| {}).expect("run");

        assert_eq!(report.logged_in_as, "CleanupBot");
        assert_eq!(report.template_names, 2);
        assert_eq!(report.candidates, 3);
        assert_eq!(report.pages_processed, 2);
        assert_eq!(report.edits_made, 1);
        assert_eq!(api.edits.len(), 1);
        assert_eq!(api.edits[0].0, "Broken");
        assert_eq!(api.edits[0].1, "'''Broken''' is an article.");
        assert_eq!(api.edits[0].2, settings.edit_summary);

        let actions = report
            .pages
            .iter()
            .map(|page| (page.title.as_str(), page.action))
            .collect::<Vec<_>>();
        assert_eq!(
            actions,
            vec![
                ("Broken", PageAction::Edited),
                ("Fine", PageAction::Unchanged),
                ("Deleted meanwhile", PageAction::MissingContent),
            ]
        );
        assert_eq!(report.existence_queries, 2);
        assert_eq!(report.skipped(), 2);
    }

    #[test]
    fn dry_run_never_calls_edit() {
        let mut api = sample_api();
        let settings = settings(&[("BOT_USER", "CleanupBot"), ("BOT_PASSWORD", "pw")]);
        assert!(settings.dry_run);
        let credentials = settings.require_credentials().expect("credentials").clone();

        let report = run_cleanup(&mut api, &settings, &credentials, &mut |_| {}).expect("run");

        assert!(api.edits.is_empty());
        assert_eq!(report.edits_made, 0);
        assert_eq!(report.would_edit, 1);
        assert_eq!(report.pages[0].action, PageAction::WouldEdit);
        assert_eq!(report.pages[0].removals[0].missing_target, "Nonexistent Page");
    }

    #[test]
    fn rejected_edit_is_recorded_and_the_run_continues() {
        let mut api = sample_api();
        api.articles.push("Also broken".to_string());
        api.contents.insert(
            "Also broken".to_string(),
            "{{Hatnote|[[Gone elsewhere]]}}".to_string(),
        );
        api.reject_edits.insert(
            "Broken".to_string(),
            ("protectedpage".to_string(), "This page has been protected.".to_string()),
        );
        let settings = live_settings();
        let credentials = settings.require_credentials().expect("credentials").clone();

        let report = run_cleanup(&mut api, &settings, &credentials, &mut |_| {}).expect("run");

        assert_eq!(report.rejected, 1);
        assert_eq!(report.edits_made, 1);
        assert_eq!(report.pages[0].action, PageAction::EditRejected);
        assert_eq!(
            report.pages[0].detail.as_deref(),
            Some("[protectedpage] This page has been protected.")
        );
        assert_eq!(api.edits[0].0, "Also broken");
        assert_eq!(api.edits[0].1, "");
    }

    #[test]
    fn saved_edits_are_reported_before_a_later_failure() {
        let mut api = sample_api();
        api.articles = vec!["Broken".to_string(), "Timeout".to_string()];
        api.unreachable.insert("Timeout".to_string());
        let settings = live_settings();
        let credentials = settings.require_credentials().expect("credentials").clone();

        let mut started = None;
        let mut seen = Vec::new();
        let error = run_cleanup(&mut api, &settings, &credentials, &mut |event| match event {
            Progress::Started {
                logged_in_as,
                candidates,
                ..
            } => started = Some((logged_in_as.to_string(), candidates)),
            Progress::Page(page) => seen.push((page.title.clone(), page.action)),
        })
        .expect_err("must fail");

        assert!(format!("{error:#}").contains("failed to fetch Timeout"));
        assert_eq!(started, Some(("CleanupBot".to_string(), 2)));
        assert_eq!(seen, vec![("Broken".to_string(), PageAction::Edited)]);
        assert_eq!(api.edits.len(), 1);
    }

    #[test]
    fn progress_sees_every_page_in_order() {
        let mut api = sample_api();
        let settings = settings(&[("BOT_USER", "CleanupBot"), ("BOT_PASSWORD", "pw")]);
        let credentials = settings.require_credentials().expect("credentials").clone();

        let mut seen = Vec::new();
        let report = run_cleanup(&mut api, &settings, &credentials, &mut |event| {
            if let Progress::Page(page) = event {
                seen.push(page.title.clone());
            }
        })
        .expect("run");

        let reported = report
            .pages
            .iter()
            .map(|page| page.title.clone())
            .collect::<Vec<_>>();
        assert_eq!(seen, reported);
    }

    #[test]
    fn failed_login_aborts_before_any_page_is_read() {
        let mut api = sample_api();
        api.login_fails = true;
        let settings = live_settings();
        let credentials = settings.require_credentials().expect("credentials").clone();

        let error =
            run_cleanup(&mut api, &settings, &credentials, &mut |_| {}).expect_err("must fail");
        assert!(format!("{error:#}").contains("login failed"));
        assert_eq!(api.request_count, 1);
    }

    #[test]
    fn missing_credentials_abort_before_connecting() {
        let settings = settings(&[("DRY_RUN", "false")]);
        let connected = Cell::new(false);

        let error = run_with_connector(
            &settings,
            |_config| {
                connected.set(true);
                Ok(MockApi::default())
            },
            &mut |_| {},
        )
        .expect_err("must fail");

        assert!(error.to_string().contains("BOT_USER and BOT_PASSWORD"));
        assert!(!connected.get());
    }

    #[test]
    fn connector_receives_resolved_client_config() {
        let settings = settings(&[
            ("BOT_USER", "CleanupBot"),
            ("BOT_PASSWORD", "pw"),
            ("WIKI_API_URL", "https://wiki.example.org/w/api.php"),
        ]);
        let report = run_with_connector(
            &settings,
            |config| {
                assert_eq!(config.api_url, "https://wiki.example.org/w/api.php");
                Ok(sample_api())
            },
            &mut |_| {},
        )
        .expect("run");
        assert_eq!(report.would_edit, 1);
    }

    #[test]
    fn max_articles_caps_candidates() {
        let mut api = sample_api();
        let settings = settings(&[
            ("BOT_USER", "CleanupBot"),
            ("BOT_PASSWORD", "pw"),
            ("MAX_ARTICLES", "1"),
        ]);
        let credentials = settings.require_credentials().expect("credentials").clone();

        let report = run_cleanup(&mut api, &settings, &credentials, &mut |_| {}).expect("run");
        assert_eq!(report.candidates, 1);
        assert_eq!(report.pages.len(), 1);
    }

    #[test]
    fn inspect_reports_without_logging_in() {
        let mut api = sample_api();
        let mut settings = settings(&[]);
        settings.show_diff = true;

        let inspection = inspect_page(&mut api, &settings, "Broken").expect("inspect");

        assert!(!api.logged_in);
        assert!(inspection.found);
        let outcome = inspection.outcome.expect("outcome");
        assert!(outcome.modified);
        let diff = inspection.diff.expect("diff");
        assert!(diff.contains("-{{Hatnote|See also [[Nonexistent Page]]}}"));

        let missing = inspect_page(&mut api, &settings, "Nowhere").expect("inspect");
        assert!(!missing.found);
        assert!(missing.outcome.is_none());
    }

    #[test]
    fn hatnote_names_drop_namespace_prefix() {
        let mut api = MockApi {
            templates: vec![
                "Template:Hatnote".to_string(),
                "Template:For".to_string(),
                "Template:".to_string(),
            ],
            ..MockApi::default()
        };
        let names = load_hatnote_names(&mut api, "Category:Hatnote templates").expect("names");
        assert_eq!(
            names.into_iter().collect::<Vec<_>>(),
            vec!["For".to_string(), "Hatnote".to_string()]
        );
    }

    #[test]
    fn render_diff_shows_removed_line() {
        let diff = render_diff("Page", "{{Hatnote|[[X]]}}\nBody\n", "Body\n");
        assert!(diff.contains("--- Page"));
        assert!(diff.contains("-{{Hatnote|[[X]]}}"));
        assert!(diff.contains(" Body"));
    }
}
