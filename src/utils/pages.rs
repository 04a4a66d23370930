use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Client;
use scraper::{Html, Selector};
use url::Url;

use crate::errors::{AuthError, FetchError, NavigationError};
use crate::models::{AcademicYear, CourseScore, Credentials, GradeSet, Session, Term, TermQuery};
use crate::utils::portal::PortalClient;

/// Hard cap on previous/next clicks before navigation gives up.
pub const MAX_NAVIGATION_STEPS: usize = 20;

const LOGIN_PATH: &str = "/login";
const LOGOUT_PATH: &str = "/logout";
const GRADES_PATH: &str = "/grades";
const REQUEST_TIMEOUT_SECS: u64 = 20;

static LOGIN_FORM: Lazy<Selector> = Lazy::new(|| Selector::parse("form#login").unwrap());
static LOGIN_ERROR: Lazy<Selector> = Lazy::new(|| Selector::parse(".login-error").unwrap());
static TERM_LABEL: Lazy<Selector> = Lazy::new(|| Selector::parse(".term-label").unwrap());
static PREV_LINK: Lazy<Selector> = Lazy::new(|| Selector::parse("a.term-prev").unwrap());
static NEXT_LINK: Lazy<Selector> = Lazy::new(|| Selector::parse("a.term-next").unwrap());
static GRADE_ROWS: Lazy<Selector> = Lazy::new(|| Selector::parse("table.grades tbody tr").unwrap());
static CELL: Lazy<Selector> = Lazy::new(|| Selector::parse("td").unwrap());
static TERM_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d{4})\s*-\s*(\d{4})\s*(?:Term|term|第)\s*([123])").unwrap());

/// Loads a rendered page. Split out so navigation can run against canned pages.
#[async_trait]
pub trait PageSource: Send {
    async fn load(&mut self, url: &Url) -> Result<String, FetchError>;
}

struct HttpPages {
    client: Client,
}

#[async_trait]
impl PageSource for HttpPages {
    async fn load(&mut self, url: &Url) -> Result<String, FetchError> {
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| FetchError::Transport(e.to_string()))?;
        if !response.status().is_success() {
            return Err(FetchError::Transport(format!("GET {url} returned {}", response.status())));
        }
        response.text().await.map_err(|e| FetchError::Transport(e.to_string()))
    }
}

fn build_client() -> reqwest::Result<Client> {
    Client::builder()
        .cookie_store(true)
        .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
        .build()
}

/// Portal that renders grades as an HTML table, one term per page, with previous/next controls.
///
/// The session lives in the client's cookie jar; [`PortalClient::close`] logs out and drops it.
pub struct PagedPortalClient {
    pages: HttpPages,
    base_url: Url,
}

impl PagedPortalClient {
    pub fn new(base_url: Url) -> reqwest::Result<Self> {
        Ok(Self { pages: HttpPages { client: build_client()? }, base_url })
    }

    fn endpoint(&self, path: &str) -> Result<Url, String> {
        self.base_url.join(path).map_err(|e| format!("bad portal url: {e}"))
    }

    /// Moves the grade page to `target` and returns its body.
    pub async fn navigate_to_term(&mut self, target: &TermQuery) -> Result<String, FetchError> {
        let start = self.endpoint(GRADES_PATH).map_err(FetchError::Transport)?;
        navigate(&mut self.pages, start, target).await
    }
}

#[async_trait]
impl PortalClient for PagedPortalClient {
    async fn authenticate(&mut self, credentials: &Credentials) -> Result<Session, AuthError> {
        let url = self.endpoint(LOGIN_PATH).map_err(AuthError::Transport)?;
        let form = [("username", credentials.username.as_str()), ("password", credentials.password.as_str())];

        let response = self
            .pages
            .client
            .post(url)
            .form(&form)
            .send()
            .await
            .map_err(|e| AuthError::Transport(e.to_string()))?;
        if response.status().is_server_error() {
            return Err(AuthError::Transport(format!("login returned {}", response.status())));
        }

        let body = response.text().await.map_err(|e| AuthError::Transport(e.to_string()))?;
        if let Some(reason) = login_rejection(&body) {
            return Err(AuthError::Rejected(reason));
        }

        info!("Portal login accepted for {}", credentials.username);
        Ok(Session::cookie_jar())
    }

    async fn fetch_grades(&mut self, _session: &Session, query: &TermQuery) -> Result<GradeSet, FetchError> {
        let body = self.navigate_to_term(query).await?;
        Ok(parse_grade_rows(&body))
    }

    async fn close(&mut self) {
        if let Ok(url) = self.endpoint(LOGOUT_PATH) {
            if let Err(e) = self.pages.client.get(url).send().await {
                debug!("Logout request failed: {e}");
            }
        }
        match build_client() {
            Ok(client) => self.pages.client = client,
            Err(e) => warn!("Could not reset portal cookie jar: {e}"),
        }
    }
}

// What the page says about where we are and where we can go.
struct TermPage {
    term: TermQuery,
    previous: Option<Url>,
    next: Option<Url>,
}

fn parse_term_page(body: &str, base: &Url) -> Result<TermPage, NavigationError> {
    let document = Html::parse_document(body);
    let label: String = document
        .select(&TERM_LABEL)
        .next()
        .map(|e| e.text().collect::<Vec<_>>().join(" "))
        .ok_or_else(|| NavigationError::Malformed(String::new()))?;
    let term = parse_term_label(&label)?;

    let link = |selector: &Selector| {
        document
            .select(selector)
            .next()
            .and_then(|a| a.value().attr("href"))
            .and_then(|href| base.join(href).ok())
    };

    Ok(TermPage { term, previous: link(&PREV_LINK), next: link(&NEXT_LINK) })
}

fn parse_term_label(label: &str) -> Result<TermQuery, NavigationError> {
    let malformed = || NavigationError::Malformed(label.trim().to_string());
    let caps = TERM_PATTERN.captures(label).ok_or_else(malformed)?;
    let start: u16 = caps[1].parse().map_err(|_| malformed())?;
    let end: u16 = caps[2].parse().map_err(|_| malformed())?;
    if end != start + 1 {
        return Err(malformed());
    }
    let term = caps[3].parse::<u8>().ok().and_then(Term::from_code).ok_or_else(malformed)?;
    Ok(TermQuery::new(AcademicYear { start }, term))
}

/// Follows previous/next links from `start` until the page shows `target`.
///
/// Each step must move strictly toward the target; a step that stays put, walks backwards or
/// jumps past the target fails with `Stalled` rather than looping.
pub async fn navigate<S: PageSource + ?Sized>(
    source: &mut S,
    start: Url,
    target: &TermQuery,
) -> Result<String, FetchError> {
    let mut url = start;
    let mut last: Option<TermQuery> = None;

    for step in 0..=MAX_NAVIGATION_STEPS {
        let body = source.load(&url).await?;
        if login_rejection(&body).is_some() {
            return Err(FetchError::SessionExpired);
        }
        let page = parse_term_page(&body, &url)?;

        if let Some(previous) = last {
            let progressed = if previous < *target {
                previous < page.term && page.term <= *target
            } else {
                *target <= page.term && page.term < previous
            };
            if !progressed {
                return Err(NavigationError::Stalled(page.term.to_string()).into());
            }
        }

        if page.term == *target {
            debug!("Reached {target} after {step} navigation steps");
            return Ok(body);
        }
        if step == MAX_NAVIGATION_STEPS {
            break;
        }

        url = if page.term < *target {
            page.next.ok_or(NavigationError::Unreachable("next"))?
        } else {
            page.previous.ok_or(NavigationError::Unreachable("previous"))?
        };
        last = Some(page.term);
    }

    Err(NavigationError::StepLimit(MAX_NAVIGATION_STEPS).into())
}

// `Some(reason)` when the body is the login form instead of the page that was asked for.
fn login_rejection(body: &str) -> Option<String> {
    let document = Html::parse_document(body);
    document.select(&LOGIN_FORM).next()?;
    let reason = document
        .select(&LOGIN_ERROR)
        .next()
        .map(|e| e.text().collect::<String>().trim().to_string())
        .filter(|text| !text.is_empty())
        .unwrap_or_else(|| "portal returned the login form".to_string());
    Some(reason)
}

// Rows are name, score, credit. Blank or `-` scores are not published yet.
fn parse_grade_rows(body: &str) -> GradeSet {
    let document = Html::parse_document(body);
    document
        .select(&GRADE_ROWS)
        .filter_map(|row| {
            let cells: Vec<String> = row
                .select(&CELL)
                .map(|td| td.text().collect::<String>().split_whitespace().collect::<Vec<_>>().join(" "))
                .collect();
            if cells.len() < 3 {
                return None;
            }
            let score = cells[1].as_str();
            if score.is_empty() || score == "-" {
                return None;
            }
            Some(CourseScore::new(cells[0].clone(), score, cells[2].clone()))
        })
        .collect()
}
