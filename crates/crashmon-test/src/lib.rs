//! Helpers for testing the crash monitor.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - When using [`tempdir`], make sure that the handle to the temp directory is held for the
//!    entire lifetime of the test. When dropped too early, the monitor may recreate the
//!    directory lazily after it has been deleted.
//!
//!  - The mock servers stop serving when dropped. Hold them in a variable until all requests to
//!    them have been made, e.g. `let jira = JiraMock::new();`.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io::Write;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use axum::extract::{Multipart, Path as UrlPath, Query, State};
use axum::http::{HeaderMap, StatusCode, Uri, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use chrono::{DateTime, Duration, FixedOffset, TimeZone};
use reqwest::Url;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;
use zip::write::{SimpleFileOptions, ZipWriter};

pub use tempfile::TempDir;

/// User name accepted by the mock servers.
pub const LOGIN: &str = "crashmon";

/// Password accepted by the mock servers.
pub const PASSWORD: &str = "secret";

/// Timestamp format of the Jira REST API.
const JIRA_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3f%z";

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the monitor crates and mutes all
///    other logs (such as hyper or reqwest).
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("crashmon_service=trace,crashmon=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Creates a temporary directory.
///
/// The directory is deleted when the [`TempDir`] instance is dropped, unless
/// [`keep`](TempDir::keep) is called. Use it as a guard to automatically clean up after
/// tests.
pub fn tempdir() -> TempDir {
    TempDir::new().unwrap()
}

/// Returns the absolute path to the given fixture.
///
/// Fixtures are located in the `tests/fixtures` directory, located from the workspace root.
///
/// # Panics
///
/// Panics if the fixture path does not exist on the file system.
pub fn fixture(path: impl AsRef<Path>) -> PathBuf {
    let path = path.as_ref();

    let mut full_path = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    full_path.pop(); // to /crates/
    full_path.pop(); // to /
    full_path.push("./tests/fixtures/");
    full_path.push(path);

    assert!(full_path.exists(), "'{}' does not exist", path.display());

    full_path
}

/// Returns the contents of a fixture.
///
/// # Panics
///
/// Panics if the fixture does not exist or cannot be read.
pub fn read_fixture(path: impl AsRef<Path>) -> Vec<u8> {
    std::fs::read(fixture(path)).unwrap()
}

/// Builds a zip archive containing `files`.
pub fn zip_archive(files: &[(&str, &[u8])]) -> Vec<u8> {
    let mut writer = ZipWriter::new(std::io::Cursor::new(Vec::new()));
    for (name, content) in files {
        writer
            .start_file(*name, SimpleFileOptions::default())
            .unwrap();
        writer.write_all(content).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

/// The `Authorization` header value the HTTP client sends for [`LOGIN`] and [`PASSWORD`].
fn expected_authorization() -> String {
    let request = reqwest::Client::new()
        .get("http://localhost/")
        .basic_auth(LOGIN, Some(PASSWORD))
        .build()
        .unwrap();
    request.headers()[reqwest::header::AUTHORIZATION]
        .to_str()
        .unwrap()
        .to_owned()
}

fn is_authorized(headers: &HeaderMap, expected: &str) -> bool {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        == Some(expected)
}

/// A test server that binds to a random port and serves a web app.
///
/// This server requires a `tokio` runtime and is supposed to be run in a `tokio::test`. It
/// automatically stops serving when dropped.
#[derive(Debug)]
pub struct Server {
    pub handle: tokio::task::JoinHandle<()>,
    pub socket: SocketAddr,
}

impl Server {
    pub fn with_router(router: Router) -> Self {
        let listener = std::net::TcpListener::bind(("127.0.0.1", 0)).unwrap();
        listener.set_nonblocking(true).unwrap();
        let socket = listener.local_addr().unwrap();
        let listener = tokio::net::TcpListener::from_std(listener).unwrap();

        let handle = tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        Self { handle, socket }
    }

    /// Returns the socket address that this server listens on.
    pub fn addr(&self) -> SocketAddr {
        self.socket
    }

    /// Returns the port that this server listens on.
    pub fn port(&self) -> u16 {
        self.addr().port()
    }

    /// Returns a full URL pointing to the given path.
    ///
    /// This URL uses `localhost` as hostname.
    pub fn url(&self, path: &str) -> Url {
        let path = path.trim_start_matches('/');
        format!("http://localhost:{}/{}", self.port(), path)
            .parse()
            .unwrap()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Server path of the report `name`, e.g. `/server/3.1.0.1-a-default/1.gdb-bt`.
pub fn report_path(name: &str) -> String {
    format!("/{}", name.replace("--", "/"))
}

#[derive(Debug, Default)]
struct CrashServerState {
    /// Report contents by server path. Reports without content fail to download.
    reports: BTreeMap<String, Option<Vec<u8>>>,
    hits: BTreeMap<&'static str, usize>,
}

#[derive(Clone, Debug)]
struct CrashServerApp {
    state: Arc<Mutex<CrashServerState>>,
    authorization: Arc<str>,
}

/// An in-process crash server listing and serving reports.
///
/// The API lives at [`url`](Self::url) and requires [`LOGIN`] and [`PASSWORD`].
#[derive(Debug)]
pub struct CrashServerMock {
    server: Server,
    state: Arc<Mutex<CrashServerState>>,
}

impl CrashServerMock {
    pub fn new() -> Self {
        let state = Arc::new(Mutex::new(CrashServerState::default()));
        let app = CrashServerApp {
            state: state.clone(),
            authorization: expected_authorization().into(),
        };

        let router = Router::new()
            .route("/crashserver/api/list", get(crash_server_list))
            .route("/crashserver/api/get", get(crash_server_get))
            .with_state(app);

        Self {
            server: Server::with_router(router),
            state,
        }
    }

    /// The API base URL.
    pub fn url(&self) -> Url {
        self.server.url("crashserver/api/")
    }

    /// Publishes the report `name` with `content`.
    pub fn add(&self, name: &str, content: impl Into<Vec<u8>>) {
        self.add_path(&report_path(name), content);
    }

    /// Publishes `content` under a raw server path.
    pub fn add_path(&self, path: &str, content: impl Into<Vec<u8>>) {
        let mut state = self.state.lock().unwrap();
        state.reports.insert(path.to_owned(), Some(content.into()));
    }

    /// Lists the report `name` but fails all of its downloads.
    pub fn add_broken(&self, name: &str) {
        let mut state = self.state.lock().unwrap();
        state.reports.insert(report_path(name), None);
    }

    /// Number of list requests served.
    pub fn list_hits(&self) -> usize {
        self.hits("list")
    }

    /// Number of download requests served.
    pub fn get_hits(&self) -> usize {
        self.hits("get")
    }

    fn hits(&self, route: &str) -> usize {
        let state = self.state.lock().unwrap();
        state.hits.get(route).copied().unwrap_or_default()
    }
}

impl Default for CrashServerMock {
    fn default() -> Self {
        Self::new()
    }
}

async fn crash_server_list(
    State(app): State<CrashServerApp>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    if !is_authorized(&headers, &app.authorization) {
        return StatusCode::UNAUTHORIZED.into_response();
    }

    let mut state = app.state.lock().unwrap();
    *state.hits.entry("list").or_default() += 1;

    let extension = query.get("extension").map_or("*", String::as_str);
    let suffix = format!(".{extension}");
    let dumps: Vec<Value> = state
        .reports
        .keys()
        .filter(|path| extension == "*" || path.ends_with(&suffix))
        .map(|path| json!({ "path": path }))
        .collect();
    Json(dumps).into_response()
}

async fn crash_server_get(
    State(app): State<CrashServerApp>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    if !is_authorized(&headers, &app.authorization) {
        return StatusCode::UNAUTHORIZED.into_response();
    }

    let mut state = app.state.lock().unwrap();
    *state.hits.entry("get").or_default() += 1;

    let path = query.get("path").map_or("", String::as_str);
    match state.reports.get(path) {
        Some(Some(content)) => content.clone().into_response(),
        Some(None) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// An attachment of a [`MockIssue`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MockAttachment {
    pub id: String,
    pub filename: String,
    pub created: DateTime<FixedOffset>,
}

/// An issue stored by the [`JiraMock`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MockIssue {
    pub key: String,
    pub status: String,
    pub summary: String,
    pub description: String,
    pub components: Vec<String>,
    pub versions: Vec<String>,
    pub fix_versions: Vec<String>,
    pub team: Option<String>,
    pub epic: Option<String>,
    pub attachments: Vec<MockAttachment>,
}

impl MockIssue {
    /// File names of all attachments.
    pub fn attachment_names(&self) -> BTreeSet<String> {
        self.attachments
            .iter()
            .map(|attachment| attachment.filename.clone())
            .collect()
    }

    fn to_json(&self) -> Value {
        let named = |names: &[String]| -> Vec<Value> {
            names.iter().map(|name| json!({ "name": name })).collect()
        };
        let attachments: Vec<Value> = self
            .attachments
            .iter()
            .map(|attachment| {
                json!({
                    "id": attachment.id,
                    "filename": attachment.filename,
                    "created": attachment.created.format(JIRA_TIME_FORMAT).to_string(),
                })
            })
            .collect();

        json!({
            "key": self.key,
            "fields": {
                "status": { "name": self.status },
                "summary": self.summary,
                "description": self.description,
                "components": named(&self.components),
                "versions": named(&self.versions),
                "fixVersions": named(&self.fix_versions),
                "attachment": attachments,
            }
        })
    }
}

fn names(value: &Value) -> Option<Vec<String>> {
    let names = value
        .as_array()?
        .iter()
        .filter_map(|named| named["name"].as_str().map(str::to_owned))
        .collect();
    Some(names)
}

#[derive(Debug, Default)]
struct JiraState {
    issues: BTreeMap<String, MockIssue>,
    issue_count: usize,
    attachment_count: usize,
    created: usize,
    requests: usize,
    queries: Vec<String>,
    broken_reads: bool,
}

impl JiraState {
    /// Attachments are created one second apart, so their order is unambiguous.
    fn next_attachment(&mut self, filename: String) -> MockAttachment {
        self.attachment_count += 1;
        let base = FixedOffset::east_opt(3 * 3600)
            .unwrap()
            .with_ymd_and_hms(2019, 1, 10, 11, 31, 53)
            .unwrap();
        MockAttachment {
            id: (10000 + self.attachment_count).to_string(),
            filename,
            created: base + Duration::seconds(self.attachment_count as i64),
        }
    }

    fn sorted_issues(&self) -> Vec<&MockIssue> {
        let mut issues: Vec<_> = self.issues.values().collect();
        issues.sort_by_key(|issue| issue_number(&issue.key));
        issues
    }
}

fn issue_number(key: &str) -> (usize, String) {
    let (project, number) = key.rsplit_once('-').unwrap_or((key, ""));
    (number.parse().unwrap_or_default(), project.to_owned())
}

#[derive(Clone, Debug)]
struct JiraApp {
    state: Arc<Mutex<JiraState>>,
    authorization: Arc<str>,
}

impl JiraApp {
    fn check(&self, headers: &HeaderMap) -> Result<MutexGuard<'_, JiraState>, Response> {
        if !is_authorized(headers, &self.authorization) {
            return Err(StatusCode::UNAUTHORIZED.into_response());
        }
        let mut state = self.state.lock().unwrap();
        state.requests += 1;
        Ok(state)
    }
}

/// An in-process Jira REST API keeping issues in memory.
///
/// New issues are `Open` and offer the `Feedback` and `Close` transitions, closed issues offer
/// `Reopen Issue`. The API requires [`LOGIN`] and [`PASSWORD`].
#[derive(Debug)]
pub struct JiraMock {
    server: Server,
    state: Arc<Mutex<JiraState>>,
}

impl JiraMock {
    pub fn new() -> Self {
        let state = Arc::new(Mutex::new(JiraState::default()));
        let app = JiraApp {
            state: state.clone(),
            authorization: expected_authorization().into(),
        };

        let router = Router::new()
            .route("/rest/api/2/issue", post(jira_create_issue))
            .route(
                "/rest/api/2/issue/:key",
                get(jira_get_issue).put(jira_update_issue),
            )
            .route("/rest/api/2/issue/:key/attachments", post(jira_add_attachment))
            .route(
                "/rest/api/2/issue/:key/transitions",
                get(jira_transitions).post(jira_transition_issue),
            )
            .route("/rest/api/2/attachment/:id", delete(jira_delete_attachment))
            .route("/rest/api/2/search", get(jira_search))
            .with_state(app);

        Self {
            server: Server::with_router(router),
            state,
        }
    }

    /// The base URL of the Jira instance.
    pub fn url(&self) -> Url {
        self.server.url("")
    }

    /// Returns a copy of the issue `key`.
    ///
    /// # Panics
    ///
    /// Panics if the issue does not exist.
    pub fn issue(&self, key: &str) -> MockIssue {
        let state = self.state.lock().unwrap();
        match state.issues.get(key) {
            Some(issue) => issue.clone(),
            None => panic!("issue {key} does not exist"),
        }
    }

    /// All issues ordered by key.
    pub fn issues(&self) -> Vec<MockIssue> {
        let state = self.state.lock().unwrap();
        state.sorted_issues().into_iter().cloned().collect()
    }

    /// Stores `issue` as if it was created before, with `attachments` added in order.
    pub fn insert(&self, mut issue: MockIssue, attachments: &[&str]) -> String {
        let mut state = self.state.lock().unwrap();
        if issue.key.is_empty() {
            state.issue_count += 1;
            issue.key = format!("VMS-{}", state.issue_count);
        }
        if issue.status.is_empty() {
            issue.status = "Open".into();
        }
        for filename in attachments {
            let attachment = state.next_attachment((*filename).to_owned());
            issue.attachments.push(attachment);
        }

        let key = issue.key.clone();
        state.issues.insert(key.clone(), issue);
        key
    }

    /// Closes the issue `key` as a developer would after fixing it.
    pub fn close(&self, key: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(issue) = state.issues.get_mut(key) {
            issue.status = "Closed".into();
        }
    }

    /// Number of issues created through the API.
    pub fn created(&self) -> usize {
        self.state.lock().unwrap().created
    }

    /// Number of authorized API requests served.
    pub fn requests(&self) -> usize {
        self.state.lock().unwrap().requests
    }

    /// Makes reading issues fail with `500 Internal Server Error` while `broken` is set.
    pub fn break_issue_reads(&self, broken: bool) {
        self.state.lock().unwrap().broken_reads = broken;
    }

    /// All search queries received.
    pub fn queries(&self) -> Vec<String> {
        self.state.lock().unwrap().queries.clone()
    }
}

impl Default for JiraMock {
    fn default() -> Self {
        Self::new()
    }
}

async fn jira_create_issue(
    State(app): State<JiraApp>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    let mut state = match app.check(&headers) {
        Ok(state) => state,
        Err(response) => return response,
    };

    let fields = &body["fields"];
    if fields["project"]["key"] != "VMS" || fields["issuetype"]["name"] != "Bug" {
        return StatusCode::BAD_REQUEST.into_response();
    }

    state.issue_count += 1;
    state.created += 1;
    let key = format!("VMS-{}", state.issue_count);
    let issue = MockIssue {
        key: key.clone(),
        status: "Open".into(),
        summary: fields["summary"].as_str().unwrap_or_default().to_owned(),
        description: fields["description"].as_str().unwrap_or_default().to_owned(),
        components: names(&fields["components"]).unwrap_or_default(),
        versions: names(&fields["versions"]).unwrap_or_default(),
        fix_versions: names(&fields["fixVersions"]).unwrap_or_default(),
        team: fields["customfield_10200"]["value"].as_str().map(str::to_owned),
        epic: fields["customfield_10009"].as_str().map(str::to_owned),
        attachments: Vec::new(),
    };
    state.issues.insert(key.clone(), issue);

    let created = json!({ "id": state.issue_count.to_string(), "key": key });
    (StatusCode::CREATED, Json(created)).into_response()
}

async fn jira_get_issue(
    State(app): State<JiraApp>,
    headers: HeaderMap,
    UrlPath(key): UrlPath<String>,
) -> Response {
    let state = match app.check(&headers) {
        Ok(state) => state,
        Err(response) => return response,
    };
    if state.broken_reads {
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    match state.issues.get(&key) {
        Some(issue) => Json(issue.to_json()).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn jira_update_issue(
    State(app): State<JiraApp>,
    headers: HeaderMap,
    UrlPath(key): UrlPath<String>,
    Json(body): Json<Value>,
) -> Response {
    let mut state = match app.check(&headers) {
        Ok(state) => state,
        Err(response) => return response,
    };
    let Some(issue) = state.issues.get_mut(&key) else {
        return StatusCode::NOT_FOUND.into_response();
    };

    let fields = &body["fields"];
    if let Some(versions) = names(&fields["versions"]) {
        issue.versions = versions;
    }
    if let Some(fix_versions) = names(&fields["fixVersions"]) {
        issue.fix_versions = fix_versions;
    }
    StatusCode::NO_CONTENT.into_response()
}

async fn jira_add_attachment(
    State(app): State<JiraApp>,
    headers: HeaderMap,
    UrlPath(key): UrlPath<String>,
    mut multipart: Multipart,
) -> Response {
    let token = headers
        .get("X-Atlassian-Token")
        .and_then(|value| value.to_str().ok());
    if token != Some("no-check") {
        return StatusCode::FORBIDDEN.into_response();
    }

    let mut filenames = Vec::new();
    while let Ok(Some(field)) = multipart.next_field().await {
        if field.name() != Some("file") {
            continue;
        }
        let Some(filename) = field.file_name().map(str::to_owned) else {
            return StatusCode::BAD_REQUEST.into_response();
        };
        if field.bytes().await.is_err() {
            return StatusCode::BAD_REQUEST.into_response();
        }
        filenames.push(filename);
    }

    let mut state = match app.check(&headers) {
        Ok(state) => state,
        Err(response) => return response,
    };
    if !state.issues.contains_key(&key) {
        return StatusCode::NOT_FOUND.into_response();
    }

    let mut added = Vec::new();
    for filename in filenames {
        let attachment = state.next_attachment(filename);
        added.push(json!({ "id": attachment.id, "filename": attachment.filename }));
        if let Some(issue) = state.issues.get_mut(&key) {
            issue.attachments.push(attachment);
        }
    }
    Json(added).into_response()
}

async fn jira_delete_attachment(
    State(app): State<JiraApp>,
    headers: HeaderMap,
    UrlPath(id): UrlPath<String>,
) -> Response {
    let mut state = match app.check(&headers) {
        Ok(state) => state,
        Err(response) => return response,
    };
    for issue in state.issues.values_mut() {
        let count = issue.attachments.len();
        issue.attachments.retain(|attachment| attachment.id != id);
        if issue.attachments.len() < count {
            return StatusCode::NO_CONTENT.into_response();
        }
    }
    StatusCode::NOT_FOUND.into_response()
}

/// Transitions available in `status` as `(id, name, target status)`.
fn transitions(status: &str) -> &'static [(&'static str, &'static str, &'static str)] {
    match status {
        "Closed" => &[("3", "Reopen Issue", "Open")],
        _ => &[("1", "Feedback", "Waiting for Feedback"), ("2", "Close", "Closed")],
    }
}

async fn jira_transitions(
    State(app): State<JiraApp>,
    headers: HeaderMap,
    UrlPath(key): UrlPath<String>,
) -> Response {
    let state = match app.check(&headers) {
        Ok(state) => state,
        Err(response) => return response,
    };
    let Some(issue) = state.issues.get(&key) else {
        return StatusCode::NOT_FOUND.into_response();
    };

    let available: Vec<Value> = transitions(&issue.status)
        .iter()
        .map(|(id, name, _)| json!({ "id": id, "name": name }))
        .collect();
    Json(json!({ "transitions": available })).into_response()
}

#[derive(Debug, Deserialize)]
struct TransitionRequest {
    transition: TransitionId,
}

#[derive(Debug, Deserialize)]
struct TransitionId {
    id: String,
}

async fn jira_transition_issue(
    State(app): State<JiraApp>,
    headers: HeaderMap,
    UrlPath(key): UrlPath<String>,
    Json(request): Json<TransitionRequest>,
) -> Response {
    let mut state = match app.check(&headers) {
        Ok(state) => state,
        Err(response) => return response,
    };
    let Some(issue) = state.issues.get_mut(&key) else {
        return StatusCode::NOT_FOUND.into_response();
    };

    let target = transitions(&issue.status)
        .iter()
        .find(|(id, _, _)| *id == request.transition.id)
        .map(|(_, _, target)| *target);
    match target {
        Some(target) => {
            issue.status = target.to_owned();
            StatusCode::NO_CONTENT.into_response()
        }
        None => StatusCode::BAD_REQUEST.into_response(),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchQuery {
    jql: String,
    #[serde(default)]
    start_at: usize,
    #[serde(default = "default_max_results")]
    max_results: usize,
}

fn default_max_results() -> usize {
    50
}

async fn jira_search(
    State(app): State<JiraApp>,
    headers: HeaderMap,
    Query(query): Query<SearchQuery>,
) -> Response {
    let mut state = match app.check(&headers) {
        Ok(state) => state,
        Err(response) => return response,
    };
    state.queries.push(query.jql);

    let issues = state.sorted_issues();
    let page: Vec<Value> = issues
        .iter()
        .skip(query.start_at)
        .take(query.max_results)
        .map(|issue| issue.to_json())
        .collect();
    let result = json!({
        "startAt": query.start_at,
        "maxResults": query.max_results,
        "total": issues.len(),
        "issues": page,
    });
    Json(result).into_response()
}

#[derive(Debug, Default)]
struct FileServerState {
    files: BTreeMap<String, Vec<u8>>,
    hits: BTreeMap<String, usize>,
}

/// A static file server, used for build distribution indexes.
#[derive(Debug)]
pub struct FileServer {
    server: Server,
    state: Arc<Mutex<FileServerState>>,
}

impl FileServer {
    pub fn new() -> Self {
        let state = Arc::new(Mutex::new(FileServerState::default()));
        let router = Router::new()
            .fallback(serve_file)
            .with_state(state.clone());

        Self {
            server: Server::with_router(router),
            state,
        }
    }

    /// Serves `content` at `path`. Directory pages end with a `/`.
    pub fn add(&self, path: &str, content: impl Into<Vec<u8>>) {
        let path = format!("/{}", path.trim_start_matches('/'));
        let mut state = self.state.lock().unwrap();
        state.files.insert(path, content.into());
    }

    /// Serves an index page linking all `entries`.
    pub fn add_index(&self, path: &str, entries: &[&str]) {
        let mut page = String::from("<html><body><pre>\n");
        for entry in entries {
            page.push_str(&format!("<a href=\"{entry}\">{entry}</a>\n"));
        }
        page.push_str("</pre></body></html>\n");
        self.add(path, page);
    }

    pub fn url(&self, path: &str) -> Url {
        self.server.url(path)
    }

    /// Number of requests to `path`.
    pub fn hits(&self, path: &str) -> usize {
        let path = format!("/{}", path.trim_start_matches('/'));
        let state = self.state.lock().unwrap();
        state.hits.get(&path).copied().unwrap_or_default()
    }
}

impl Default for FileServer {
    fn default() -> Self {
        Self::new()
    }
}

async fn serve_file(State(state): State<Arc<Mutex<FileServerState>>>, uri: Uri) -> Response {
    let mut state = state.lock().unwrap();
    let path = uri.path().to_owned();
    *state.hits.entry(path.clone()).or_default() += 1;
    match state.files.get(&path) {
        Some(content) => content.clone().into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}
