use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, COOKIE, LOCATION, ORIGIN};
use reqwest::redirect::Policy;
use reqwest::Client;
use serde_json::Value;
use url::Url;

use crate::errors::{AuthError, FetchError};
use crate::models::{CourseScore, Credentials, GradeSet, Session, TermQuery};

const SESSION_COOKIE: &str = "eai-sess";
const LOGIN_PATH: &str = "/uc/wap/login/check";
const GRADES_PATH: &str = "/buaascore/wap/default/index";
const USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/102.0.0.0 Safari/537.36";
const REQUEST_TIMEOUT_SECS: u64 = 20;

/// Everything the monitor needs from a grade portal.
///
/// Implementations keep their own transport state; the monitor owns the [`Session`] and hands it
/// back on every fetch. `SessionExpired` must be reported as such so the caller logs in again
/// instead of reading an empty grade list.
#[async_trait]
pub trait PortalClient: Send {
    async fn authenticate(&mut self, credentials: &Credentials) -> Result<Session, AuthError>;

    async fn fetch_grades(&mut self, session: &Session, query: &TermQuery) -> Result<GradeSet, FetchError>;

    /// Releases whatever the client holds open. Called on shutdown and after session failures.
    async fn close(&mut self) {}
}

/// Portal that logs in with a form POST and serves grades as JSON.
pub struct HttpPortalClient {
    client: Client,
    base_url: Url,
}

impl HttpPortalClient {
    pub fn new(base_url: Url) -> reqwest::Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json, text/javascript, */*; q=0.01"));
        headers.insert("x-requested-with", HeaderValue::from_static("XMLHttpRequest"));
        if let Ok(origin) = HeaderValue::from_str(base_url.origin().ascii_serialization().as_str()) {
            headers.insert(ORIGIN, origin);
        }

        // Redirects stay visible: a bounce to the login page is how an expired session shows up.
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .default_headers(headers)
            .redirect(Policy::none())
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;

        Ok(Self { client, base_url })
    }

    fn endpoint(&self, path: &str) -> Result<Url, String> {
        self.base_url.join(path).map_err(|e| format!("bad portal url: {e}"))
    }
}

#[async_trait]
impl PortalClient for HttpPortalClient {
    async fn authenticate(&mut self, credentials: &Credentials) -> Result<Session, AuthError> {
        let url = self.endpoint(LOGIN_PATH).map_err(AuthError::Transport)?;
        let form = [("username", credentials.username.as_str()), ("password", credentials.password.as_str())];

        let response = self
            .client
            .post(url)
            .form(&form)
            .send()
            .await
            .map_err(|e| AuthError::Transport(e.to_string()))?;

        let cookie = response.cookies().find(|c| c.name() == SESSION_COOKIE).map(|c| c.value().to_string());
        let body = response.text().await.map_err(|e| AuthError::Transport(e.to_string()))?;

        let session = parse_login_response(&body, cookie)?;
        info!("Portal login accepted for {}", credentials.username);
        Ok(session)
    }

    async fn fetch_grades(&mut self, session: &Session, query: &TermQuery) -> Result<GradeSet, FetchError> {
        let url = self.endpoint(GRADES_PATH).map_err(FetchError::Transport)?;
        let year = query.year.to_string();
        let term = query.term.code().to_string();
        let form = [("year", year.as_str()), ("xq", term.as_str())];

        let cookie = HeaderValue::from_str(&format!("{SESSION_COOKIE}={}", session.token()))
            .map_err(|_| FetchError::SessionExpired)?;

        let response = self
            .client
            .post(url)
            .header(COOKIE, cookie)
            .form(&form)
            .send()
            .await
            .map_err(|e| FetchError::Transport(e.to_string()))?;

        if response.status().is_redirection() {
            let target = response.headers().get(LOCATION).and_then(|v| v.to_str().ok()).unwrap_or("");
            debug!("Grade request redirected to {target:?}");
            return Err(FetchError::SessionExpired);
        }
        if !response.status().is_success() {
            return Err(FetchError::Transport(format!("grade request returned {}", response.status())));
        }

        let body = response.text().await.map_err(|e| FetchError::Transport(e.to_string()))?;
        parse_grade_response(&body)
    }
}

// `{"e": 0, "m": "..."}` plus the session cookie means success.
fn parse_login_response(body: &str, cookie: Option<String>) -> Result<Session, AuthError> {
    let json: Value = serde_json::from_str(body)
        .map_err(|e| AuthError::Transport(format!("login response is not JSON: {e}")))?;

    let code = json.get("e").and_then(Value::as_i64).unwrap_or(-1);
    let message = json.get("m").and_then(Value::as_str).unwrap_or("").to_string();
    if code != 0 {
        return Err(AuthError::Rejected(if message.is_empty() { format!("error code {code}") } else { message }));
    }

    match cookie {
        Some(token) if !token.is_empty() => Ok(Session::new(token)),
        _ => Err(AuthError::Rejected(format!("login succeeded without a {SESSION_COOKIE} cookie"))),
    }
}

// Records live under `d`, keyed by an id. Unscored records are not published yet and are skipped.
fn parse_grade_response(body: &str) -> Result<GradeSet, FetchError> {
    let json: Value = match serde_json::from_str(body) {
        Ok(json) => json,
        Err(_) if looks_like_login_page(body) => return Err(FetchError::SessionExpired),
        Err(e) => return Err(FetchError::Malformed(format!("grade response is not JSON: {e}"))),
    };

    if json.get("e").and_then(Value::as_i64).unwrap_or(0) != 0 {
        return Err(FetchError::SessionExpired);
    }

    let records: Vec<&Value> = match json.get("d") {
        Some(Value::Object(map)) => map.values().collect(),
        Some(Value::Array(items)) => items.iter().collect(),
        Some(Value::Null) | None => Vec::new(),
        Some(other) => return Err(FetchError::Malformed(format!("unexpected `d` payload: {other}"))),
    };

    let mut grades = GradeSet::new();
    for record in records {
        let name = record
            .get("kcmc")
            .and_then(scalar_text)
            .ok_or_else(|| FetchError::Malformed(format!("record without course name: {record}")))?;
        let Some(score) = record.get("kccj").and_then(scalar_text) else {
            continue;
        };
        let credit = record.get("xf").and_then(scalar_text).unwrap_or_default();
        grades.push(CourseScore::new(name, score, credit));
    }
    Ok(grades)
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn looks_like_login_page(body: &str) -> bool {
    let lower = body.to_ascii_lowercase();
    lower.contains("<html") && (lower.contains("login") || body.contains("登录"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn login_success_keeps_cookie_as_token() {
        let session = parse_login_response(r#"{"e":0,"m":"操作成功","d":{}}"#, Some("abc123".into())).unwrap();
        assert_eq!(session.token(), "abc123");
    }

    #[test]
    fn login_failure_reports_portal_message() {
        let err = parse_login_response(r#"{"e":1,"m":"账号或密码错误"}"#, None).unwrap_err();
        match err {
            AuthError::Rejected(reason) => assert_eq!(reason, "账号或密码错误"),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn login_without_cookie_is_rejected() {
        let err = parse_login_response(r#"{"e":0,"m":"ok"}"#, None).unwrap_err();
        assert!(matches!(err, AuthError::Rejected(_)));
    }

    #[test]
    fn login_garbage_is_a_transport_error() {
        let err = parse_login_response("<html>502 Bad Gateway</html>", None).unwrap_err();
        assert!(matches!(err, AuthError::Transport(_)));
    }

    #[test]
    fn grades_keep_portal_order_and_skip_unscored() {
        let body = r#"{"e":0,"m":"","d":{
            "k2":{"kcmc":"Physics","kccj":"85","xf":"4"},
            "k1":{"kcmc":"Math","kccj":90,"xf":3.5},
            "k3":{"kcmc":"History","kccj":null,"xf":"2"}
        }}"#;
        let grades = parse_grade_response(body).unwrap();
        assert_eq!(
            grades,
            vec![CourseScore::new("Physics", "85", "4"), CourseScore::new("Math", "90", "3.5")]
        );
    }

    #[test]
    fn empty_list_payload_is_an_empty_set() {
        assert!(parse_grade_response(r#"{"e":0,"m":"","d":[]}"#).unwrap().is_empty());
    }

    #[test]
    fn login_page_body_means_session_expired() {
        let body = "<html><head><title>统一身份认证</title></head><body><form id=\"login\"></form></body></html>";
        assert!(matches!(parse_grade_response(body), Err(FetchError::SessionExpired)));
        assert!(matches!(parse_grade_response(r#"{"e":10013,"m":"请先登录"}"#), Err(FetchError::SessionExpired)));
    }

    // Serves one canned HTTP response to the first connection, after reading the whole request.
    async fn serve_once(response: &'static str) -> Url {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        use tokio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            loop {
                let n = stream.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&request);
                if let Some(end) = text.find("\r\n\r\n") {
                    let length = text[..end]
                        .lines()
                        .filter_map(|l| l.split_once(':'))
                        .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
                        .and_then(|(_, v)| v.trim().parse::<usize>().ok())
                        .unwrap_or(0);
                    if request.len() >= end + 4 + length {
                        break;
                    }
                }
            }
            stream.write_all(response.as_bytes()).await.unwrap();
            stream.shutdown().await.unwrap();
        });
        Url::parse(&format!("http://{addr}/")).unwrap()
    }

    fn spring_2022() -> TermQuery {
        use crate::models::{AcademicYear, Term};
        TermQuery::new(AcademicYear { start: 2022 }, Term::Spring)
    }

    #[tokio::test]
    async fn redirect_to_login_means_session_expired() {
        let base = serve_once(
            "HTTP/1.1 302 Found\r\nLocation: /uc/wap/login\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        )
        .await;
        let mut client = HttpPortalClient::new(base).unwrap();
        let outcome = client.fetch_grades(&Session::new("stale"), &spring_2022()).await;
        assert!(matches!(outcome, Err(FetchError::SessionExpired)));
    }

    #[tokio::test]
    async fn grade_endpoint_json_is_parsed() {
        let base = serve_once(concat!(
            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: 52\r\nConnection: close\r\n\r\n",
            r#"{"e":0,"d":{"k":{"kcmc":"Math","kccj":"90","xf":3}}}"#,
        ))
        .await;
        let mut client = HttpPortalClient::new(base).unwrap();
        let grades = client.fetch_grades(&Session::new("fresh"), &spring_2022()).await.unwrap();
        assert_eq!(grades, vec![CourseScore::new("Math", "90", "3")]);
    }

    #[test]
    fn record_without_name_is_malformed() {
        let body = r#"{"e":0,"d":{"k":{"kccj":"90","xf":"3"}}}"#;
        assert!(matches!(parse_grade_response(body), Err(FetchError::Malformed(_))));
    }
}
