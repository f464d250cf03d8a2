use std::collections::BTreeMap;
use std::thread::sleep;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use reqwest::Url;
use reqwest::blocking::Client;
use serde::Deserialize;
use serde_json::Value;

pub const NS_MAIN: i32 = 0;
pub const NS_TEMPLATE: i32 = 10;

const CATEGORY_PAGE_LIMIT: usize = 500;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRevision {
    pub title: String,
    pub content: String,
    pub revision_id: i64,
    pub timestamp: String,
}

/// Result of one existence query. `normalized` maps a title as sent to the
/// title the wiki answered for; `pages` is keyed by the answered title.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExistenceBatch {
    pub normalized: BTreeMap<String, String>,
    pub pages: BTreeMap<String, bool>,
}

impl ExistenceBatch {
    /// Existence of a title as it was sent. Titles the wiki did not answer
    /// for count as missing.
    pub fn exists(&self, requested: &str) -> bool {
        let answered = self
            .normalized
            .get(requested)
            .map(String::as_str)
            .unwrap_or(requested);
        self.pages.get(answered).copied().unwrap_or(false)
    }
}

#[derive(Debug, Clone)]
pub struct EditRequest<'a> {
    pub title: &'a str,
    pub text: &'a str,
    pub summary: &'a str,
    pub base_timestamp: Option<&'a str>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EditOutcome {
    Saved { new_revision_id: Option<i64> },
    NoChange,
    Rejected { code: String, info: String },
}

pub trait WikiReadApi {
    fn category_members(
        &mut self,
        category: &str,
        namespace: i32,
        limit: Option<usize>,
    ) -> Result<Vec<String>>;
    fn page_content(&mut self, title: &str) -> Result<Option<PageRevision>>;
    fn page_existence(&mut self, titles: &[String]) -> Result<ExistenceBatch>;
    fn request_count(&self) -> usize;
}

pub trait WikiWriteApi: WikiReadApi {
    /// Logs in and returns the account name the wiki reports for the session.
    fn login(&mut self, username: &str, password: &str) -> Result<String>;
    fn edit_page(&mut self, request: &EditRequest<'_>) -> Result<EditOutcome>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaWikiClientConfig {
    pub api_url: String,
    pub user_agent: String,
    pub timeout_ms: u64,
    pub rate_limit_read_ms: u64,
    pub rate_limit_write_ms: u64,
}

pub struct MediaWikiClient {
    client: Client,
    config: MediaWikiClientConfig,
    last_request_at: Option<Instant>,
    request_count: usize,
    csrf_token: Option<String>,
}

impl MediaWikiClient {
    pub fn new(config: MediaWikiClientConfig) -> Result<Self> {
        Url::parse(&config.api_url)
            .with_context(|| format!("invalid WIKI_API_URL: {}", config.api_url))?;
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .cookie_store(true)
            .build()
            .context("failed to build MediaWiki HTTP client")?;

        Ok(Self {
            client,
            config,
            last_request_at: None,
            request_count: 0,
            csrf_token: None,
        })
    }

    fn request_json_get(&mut self, params: &[(&str, String)]) -> Result<Value> {
        let pairs = with_format_params(params);
        self.apply_rate_limit(false);
        let response = self
            .client
            .get(&self.config.api_url)
            .header("User-Agent", self.config.user_agent.clone())
            .query(&pairs)
            .send()
            .context("failed to call MediaWiki API")?;
        let payload = decode_response(response)?;
        ensure_no_api_error(&payload)?;
        Ok(payload)
    }

    fn request_json_post(&mut self, params: &[(&str, String)], is_write: bool) -> Result<Value> {
        let payload = self.send_post(params, is_write)?;
        ensure_no_api_error(&payload)?;
        Ok(payload)
    }

    /// POST without interpreting an API-level `error` object, so callers can
    /// treat it as an outcome rather than a failure.
    fn send_post(&mut self, params: &[(&str, String)], is_write: bool) -> Result<Value> {
        let pairs = with_format_params(params);
        self.apply_rate_limit(is_write);
        let response = self
            .client
            .post(&self.config.api_url)
            .header("User-Agent", self.config.user_agent.clone())
            .form(&pairs)
            .send()
            .context("failed to call MediaWiki API")?;
        decode_response(response)
    }

    fn apply_rate_limit(&mut self, is_write: bool) {
        let delay = if is_write {
            Duration::from_millis(self.config.rate_limit_write_ms)
        } else {
            Duration::from_millis(self.config.rate_limit_read_ms)
        };
        if let Some(last) = self.last_request_at {
            let elapsed = last.elapsed();
            if elapsed < delay {
                sleep(delay - elapsed);
            }
        }
        self.last_request_at = Some(Instant::now());
        self.request_count += 1;
    }

    fn ensure_csrf_token(&mut self) -> Result<String> {
        if let Some(token) = &self.csrf_token {
            return Ok(token.clone());
        }
        let response = self.request_json_get(&[
            ("action", "query".to_string()),
            ("meta", "tokens".to_string()),
        ])?;
        let parsed: TokenQueryResponse =
            serde_json::from_value(response).context("failed to decode csrf token response")?;
        let token = parsed
            .query
            .tokens
            .and_then(|tokens| tokens.csrftoken)
            .ok_or_else(|| anyhow::anyhow!("failed to get MediaWiki csrf token"))?;
        self.csrf_token = Some(token.clone());
        Ok(token)
    }

    fn current_user_name(&mut self) -> Result<String> {
        let response = self.request_json_get(&[
            ("action", "query".to_string()),
            ("meta", "userinfo".to_string()),
        ])?;
        let parsed: UserInfoResponse =
            serde_json::from_value(response).context("failed to decode userinfo response")?;
        parsed
            .query
            .userinfo
            .map(|info| info.name)
            .ok_or_else(|| anyhow::anyhow!("userinfo missing from API response"))
    }
}

impl WikiReadApi for MediaWikiClient {
    fn category_members(
        &mut self,
        category: &str,
        namespace: i32,
        limit: Option<usize>,
    ) -> Result<Vec<String>> {
        let mut listing = CategoryListing::new(category, namespace, limit);
        while let Some(params) = listing.next_params() {
            let response = self.request_json_get(&params)?;
            listing.absorb(response)?;
        }
        Ok(listing.into_titles())
    }

    fn page_content(&mut self, title: &str) -> Result<Option<PageRevision>> {
        let response = self.request_json_get(&[
            ("action", "query".to_string()),
            ("titles", title.to_string()),
            ("prop", "revisions".to_string()),
            ("rvprop", "content|timestamp|ids".to_string()),
            ("rvslots", "main".to_string()),
        ])?;
        let parsed: PageQueryResponse = serde_json::from_value(response)
            .context("failed to decode page content API response")?;

        let Some(page) = parsed.query.pages.into_iter().next() else {
            return Ok(None);
        };
        if page.missing || page.invalid {
            return Ok(None);
        }
        let Some(revision) = page.revisions.into_iter().next() else {
            return Ok(None);
        };
        let Some(slot) = revision.slots.and_then(|slots| slots.main) else {
            return Ok(None);
        };

        Ok(Some(PageRevision {
            title: page.title,
            content: slot.content,
            revision_id: revision.revid,
            timestamp: revision.timestamp,
        }))
    }

    fn page_existence(&mut self, titles: &[String]) -> Result<ExistenceBatch> {
        if titles.is_empty() {
            return Ok(ExistenceBatch::default());
        }
        let response = self.request_json_get(&[
            ("action", "query".to_string()),
            ("titles", titles.join("|")),
        ])?;
        let parsed: PageQueryResponse = serde_json::from_value(response)
            .context("failed to decode page existence API response")?;
        Ok(existence_batch_from_query(parsed.query))
    }

    fn request_count(&self) -> usize {
        self.request_count
    }
}

impl WikiWriteApi for MediaWikiClient {
    fn login(&mut self, username: &str, password: &str) -> Result<String> {
        let token_response = self.request_json_get(&[
            ("action", "query".to_string()),
            ("meta", "tokens".to_string()),
            ("type", "login".to_string()),
        ])?;
        let token_payload: TokenQueryResponse = serde_json::from_value(token_response)
            .context("failed to decode login token response")?;
        let login_token = token_payload
            .query
            .tokens
            .and_then(|tokens| tokens.logintoken)
            .ok_or_else(|| anyhow::anyhow!("failed to get MediaWiki login token"))?;

        let login_response = self.request_json_post(
            &[
                ("action", "login".to_string()),
                ("lgname", username.to_string()),
                ("lgpassword", password.to_string()),
                ("lgtoken", login_token),
            ],
            true,
        )?;
        login_result(login_response)?;
        self.csrf_token = None;

        self.current_user_name()
    }

    fn edit_page(&mut self, request: &EditRequest<'_>) -> Result<EditOutcome> {
        let token = self.ensure_csrf_token()?;
        let mut params = vec![
            ("action", "edit".to_string()),
            ("title", request.title.to_string()),
            ("text", request.text.to_string()),
            ("summary", request.summary.to_string()),
            ("bot", "1".to_string()),
            ("nocreate", "1".to_string()),
        ];
        if let Some(timestamp) = request.base_timestamp {
            params.push(("basetimestamp", timestamp.to_string()));
        }
        params.push(("token", token));

        let response = self.send_post(&params, true)?;
        Ok(edit_outcome_from_payload(&response))
    }
}

/// Paging state of one `list=categorymembers` enumeration.
#[derive(Debug)]
struct CategoryListing {
    title: String,
    namespace: i32,
    limit: Option<usize>,
    titles: Vec<String>,
    continuation: Option<String>,
    exhausted: bool,
}

impl CategoryListing {
    fn new(category: &str, namespace: i32, limit: Option<usize>) -> Self {
        Self {
            title: category_title(category),
            namespace,
            limit,
            titles: Vec::new(),
            continuation: None,
            exhausted: false,
        }
    }

    /// Query for the next page, or `None` once the listing is complete or
    /// the limit is reached.
    fn next_params(&self) -> Option<Vec<(&'static str, String)>> {
        if self.exhausted {
            return None;
        }
        let batch_limit = match self.limit {
            Some(limit) => limit
                .saturating_sub(self.titles.len())
                .min(CATEGORY_PAGE_LIMIT),
            None => CATEGORY_PAGE_LIMIT,
        };
        if batch_limit == 0 {
            return None;
        }

        let mut params = vec![
            ("action", "query".to_string()),
            ("list", "categorymembers".to_string()),
            ("cmtitle", self.title.clone()),
            ("cmnamespace", self.namespace.to_string()),
            ("cmtype", "page".to_string()),
            ("cmlimit", batch_limit.to_string()),
        ];
        if let Some(token) = &self.continuation {
            params.push(("cmcontinue", token.clone()));
        }
        Some(params)
    }

    fn absorb(&mut self, payload: Value) -> Result<()> {
        let parsed: CategoryMembersResponse = serde_json::from_value(payload)
            .context("failed to decode categorymembers API response")?;
        self.titles
            .extend(parsed.query.categorymembers.into_iter().map(|item| item.title));
        self.continuation = parsed.continuation.and_then(|cont| cont.cmcontinue);
        self.exhausted = self.continuation.is_none();
        Ok(())
    }

    fn into_titles(mut self) -> Vec<String> {
        if let Some(limit) = self.limit {
            self.titles.truncate(limit);
        }
        self.titles
    }
}

/// Any login result other than `Success` is an error carrying the wiki's
/// reason.
fn login_result(payload: Value) -> Result<()> {
    let parsed: LoginResponse =
        serde_json::from_value(payload).context("failed to decode login response")?;
    match parsed.login.result.as_deref() {
        Some("Success") => Ok(()),
        other => bail!(
            "MediaWiki login failed: {}",
            parsed
                .login
                .reason
                .or_else(|| other.map(ToString::to_string))
                .unwrap_or_else(|| "unknown error".to_string())
        ),
    }
}

fn with_format_params(params: &[(&str, String)]) -> Vec<(String, String)> {
    let mut pairs = Vec::with_capacity(params.len() + 2);
    pairs.push(("format".to_string(), "json".to_string()));
    pairs.push(("formatversion".to_string(), "2".to_string()));
    for (key, value) in params {
        pairs.push(((*key).to_string(), value.clone()));
    }
    pairs
}

fn decode_response(response: reqwest::blocking::Response) -> Result<Value> {
    let status = response.status();
    if !status.is_success() {
        bail!("MediaWiki API request failed with HTTP {status}");
    }
    response
        .json()
        .context("failed to decode MediaWiki API JSON response")
}

fn ensure_no_api_error(payload: &Value) -> Result<()> {
    if let Some((code, info)) = api_error(payload) {
        bail!("MediaWiki API error [{code}]: {info}");
    }
    Ok(())
}

fn api_error(payload: &Value) -> Option<(String, String)> {
    let error = payload.get("error")?;
    let code = error
        .get("code")
        .and_then(Value::as_str)
        .unwrap_or("unknown_error");
    let info = error
        .get("info")
        .and_then(Value::as_str)
        .unwrap_or("unknown info");
    Some((code.to_string(), info.to_string()))
}

fn edit_outcome_from_payload(payload: &Value) -> EditOutcome {
    if let Some((code, info)) = api_error(payload) {
        return EditOutcome::Rejected { code, info };
    }
    let parsed: EditResponse = match serde_json::from_value(payload.clone()) {
        Ok(parsed) => parsed,
        Err(error) => {
            return EditOutcome::Rejected {
                code: "malformed_response".to_string(),
                info: error.to_string(),
            };
        }
    };
    let Some(edit) = parsed.edit else {
        return EditOutcome::Rejected {
            code: "missing_edit".to_string(),
            info: "missing edit payload in API response".to_string(),
        };
    };
    match edit.result.as_deref() {
        Some("Success") if edit.nochange => EditOutcome::NoChange,
        Some("Success") => EditOutcome::Saved {
            new_revision_id: edit.newrevid,
        },
        other => EditOutcome::Rejected {
            code: other.unwrap_or("unknown").to_string(),
            info: edit
                .info
                .unwrap_or_else(|| "edit was not accepted".to_string()),
        },
    }
}

fn existence_batch_from_query(query: PageQueryPayload) -> ExistenceBatch {
    let mut batch = ExistenceBatch::default();
    for pair in query.normalized {
        batch.normalized.insert(pair.from, pair.to);
    }
    for page in query.pages {
        batch
            .pages
            .insert(page.title, !(page.missing || page.invalid));
    }
    // Interwiki targets live on another wiki and cannot be disproved here.
    for item in query.interwiki {
        batch.pages.insert(item.title, true);
    }
    batch
}

fn category_title(category: &str) -> String {
    let trimmed = category.trim();
    if trimmed.starts_with("Category:") {
        trimmed.to_string()
    } else {
        format!("Category:{trimmed}")
    }
}

#[derive(Debug, Deserialize, Default)]
struct CategoryMembersResponse {
    #[serde(default)]
    query: CategoryMembersPayload,
    #[serde(default, rename = "continue")]
    continuation: Option<ContinuationPayload>,
}

#[derive(Debug, Deserialize, Default)]
struct CategoryMembersPayload {
    #[serde(default)]
    categorymembers: Vec<TitleQueryItem>,
}

#[derive(Debug, Deserialize, Default)]
struct ContinuationPayload {
    cmcontinue: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TitleQueryItem {
    title: String,
}

#[derive(Debug, Deserialize, Default)]
struct PageQueryResponse {
    #[serde(default)]
    query: PageQueryPayload,
}

#[derive(Debug, Deserialize, Default)]
struct PageQueryPayload {
    #[serde(default)]
    normalized: Vec<NormalizedPair>,
    #[serde(default)]
    pages: Vec<PageQueryItem>,
    #[serde(default)]
    interwiki: Vec<TitleQueryItem>,
}

#[derive(Debug, Deserialize)]
struct NormalizedPair {
    from: String,
    to: String,
}

#[derive(Debug, Deserialize)]
struct PageQueryItem {
    title: String,
    #[serde(default)]
    missing: bool,
    #[serde(default)]
    invalid: bool,
    #[serde(default)]
    revisions: Vec<RevisionQueryItem>,
}

#[derive(Debug, Deserialize)]
struct RevisionQueryItem {
    revid: i64,
    timestamp: String,
    slots: Option<RevisionSlotContainer>,
}

#[derive(Debug, Deserialize)]
struct RevisionSlotContainer {
    main: Option<RevisionMainSlot>,
}

#[derive(Debug, Deserialize)]
struct RevisionMainSlot {
    content: String,
}

#[derive(Debug, Deserialize, Default)]
struct TokenQueryResponse {
    #[serde(default)]
    query: TokenQueryPayload,
}

#[derive(Debug, Deserialize, Default)]
struct TokenQueryPayload {
    tokens: Option<TokenPayload>,
}

#[derive(Debug, Deserialize, Default)]
struct TokenPayload {
    logintoken: Option<String>,
    csrftoken: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct UserInfoResponse {
    #[serde(default)]
    query: UserInfoPayload,
}

#[derive(Debug, Deserialize, Default)]
struct UserInfoPayload {
    userinfo: Option<UserInfo>,
}

#[derive(Debug, Deserialize)]
struct UserInfo {
    name: String,
}

#[derive(Debug, Deserialize, Default)]
struct LoginResponse {
    #[serde(default)]
    login: LoginPayload,
}

#[derive(Debug, Deserialize, Default)]
struct LoginPayload {
    result: Option<String>,
    reason: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct EditResponse {
    edit: Option<EditPayload>,
}

#[derive(Debug, Deserialize, Default)]
struct EditPayload {
    result: Option<String>,
    info: Option<String>,
    newrevid: Option<i64>,
    #[serde(default)]
    nochange: bool,
}
