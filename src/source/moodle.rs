// src/source/moodle.rs
//! Moodle web-service client: token login, session caching, popup notifications.

use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::session::{Session, SessionCache};
use super::{Notification, NotificationSource};
use crate::config::{MoodleSettings, NotificationSettings};
use crate::error::SourceError;

const LOGIN_PATH: &str = "/login/token.php";
const REST_PATH: &str = "/webservice/rest/server.php";
const MOBILE_SERVICE: &str = "moodle_mobile_app";

/// Moodle error codes that mean "your token is no longer good".
const SESSION_ERROR_CODES: &[&str] = &[
    "invalidtoken",
    "accessexception",
    "servicerequireslogin",
    "requireloginerror",
];

pub struct MoodleClient {
    base_url: String,
    username: String,
    password: String,
    http: reqwest::Client,
    cache: SessionCache,
    session: Mutex<Option<Session>>,
    fetch_limit: u32,
    retry_total: u32,
    retry_backoff: Duration,
    session_max_age_hours: i64,
}

impl MoodleClient {
    pub fn new(moodle: &MoodleSettings, net: &NotificationSettings) -> Result<Self, SourceError> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("moodle-courier/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(net.connect_timeout_secs))
            .timeout(Duration::from_secs(net.read_timeout_secs))
            .build()
            .map_err(|e| SourceError::Connection(format!("building http client: {e}")))?;
        let cache = SessionCache::new(
            moodle.session_file.clone(),
            moodle.session_encryption_key.as_deref(),
        );
        if !cache.is_enabled() {
            info!("no session encryption key configured; session cache disabled");
        }
        Ok(Self {
            base_url: moodle.url.trim_end_matches('/').to_string(),
            username: moodle.username.clone(),
            password: moodle.password.clone(),
            http,
            cache,
            session: Mutex::new(None),
            fetch_limit: net.fetch_limit,
            retry_total: net.retry_total,
            retry_backoff: Duration::from_millis(net.retry_backoff_ms),
            session_max_age_hours: i64::try_from(moodle.session_refresh_hours).unwrap_or(i64::MAX),
        })
    }

    /// Replace the session cache (tests, or callers that manage their own file).
    pub fn with_session_cache(mut self, cache: SessionCache) -> Self {
        self.cache = cache;
        self
    }

    /// Exchange credentials for a token and resolve the account id.
    pub async fn login(&self) -> Result<Session, SourceError> {
        #[derive(Deserialize)]
        struct LoginResp {
            token: Option<String>,
            error: Option<String>,
            errorcode: Option<String>,
        }

        let url = format!("{}{}", self.base_url, LOGIN_PATH);
        let form = [
            ("username", self.username.as_str()),
            ("password", self.password.as_str()),
            ("service", MOBILE_SERVICE),
        ];
        let resp = self
            .send_with_retry(|| self.http.post(&url).form(&form))
            .await?;
        let body: LoginResp = resp.json().await?;

        let Some(token) = body.token.filter(|t| !t.is_empty()) else {
            let reason = body
                .error
                .or(body.errorcode)
                .unwrap_or_else(|| "no token in login response".to_string());
            return Err(SourceError::Authentication(reason));
        };

        let user_id = match self.site_user_id(&token).await {
            Ok(id) => id,
            Err(SourceError::SessionExpired(code)) => {
                return Err(SourceError::Authentication(format!(
                    "fresh token rejected ({code})"
                )))
            }
            Err(e) => return Err(e),
        };

        let session = Session {
            token,
            user_id,
            created_at: Utc::now(),
        };
        info!(user_id, "logged in to Moodle");
        self.cache.store(&session);
        Ok(session)
    }

    /// Drop any cached session and log in again.
    pub async fn refresh_session(&self) -> Result<Session, SourceError> {
        let mut guard = self.session.lock().await;
        *guard = None;
        self.cache.clear();
        let session = self.login().await?;
        *guard = Some(session.clone());
        Ok(session)
    }

    /// Popup notifications addressed to the session's account, newest first.
    pub async fn fetch_for(&self, session: &Session) -> Result<Vec<Notification>, SourceError> {
        #[derive(Deserialize)]
        struct PopupResp {
            #[serde(default)]
            notifications: Vec<RawNotification>,
        }

        let value = self
            .call(
                &session.token,
                "message_popup_get_popup_notifications",
                &[
                    ("useridto", session.user_id.to_string()),
                    ("limit", self.fetch_limit.to_string()),
                ],
            )
            .await?;
        let resp: PopupResp = serde_json::from_value(value)
            .map_err(|e| SourceError::Unavailable(format!("unexpected notification payload: {e}")))?;

        let now = Utc::now();
        let items: Vec<Notification> = resp
            .notifications
            .into_iter()
            .map(|raw| raw.into_notification(now))
            .collect();
        debug!(count = items.len(), "fetched notifications");
        Ok(items)
    }

    async fn current_session(&self) -> Result<Session, SourceError> {
        let mut guard = self.session.lock().await;
        if guard.is_none() {
            *guard = self.cache.load();
        }
        if let Some(s) = guard.as_ref() {
            if s.age_hours(Utc::now()) < self.session_max_age_hours {
                return Ok(s.clone());
            }
            info!(age_hours = s.age_hours(Utc::now()), "session is old; refreshing");
            self.cache.clear();
        }
        let fresh = self.login().await?;
        *guard = Some(fresh.clone());
        Ok(fresh)
    }

    async fn site_user_id(&self, token: &str) -> Result<i64, SourceError> {
        let value = self
            .call(token, "core_webservice_get_site_info", &[])
            .await?;
        value
            .get("userid")
            .and_then(Value::as_i64)
            .ok_or_else(|| SourceError::Unavailable("site info without userid".to_string()))
    }

    async fn call(
        &self,
        token: &str,
        wsfunction: &str,
        params: &[(&str, String)],
    ) -> Result<Value, SourceError> {
        let url = format!("{}{}", self.base_url, REST_PATH);
        let mut query: Vec<(&str, &str)> = vec![
            ("wstoken", token),
            ("wsfunction", wsfunction),
            ("moodlewsrestformat", "json"),
        ];
        query.extend(params.iter().map(|(k, v)| (*k, v.as_str())));

        let resp = self
            .send_with_retry(|| self.http.post(&url).query(&query))
            .await?;
        let status = resp.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(SourceError::SessionExpired(format!("http {status}")));
        }
        if !status.is_success() {
            return Err(SourceError::Unavailable(format!("{wsfunction}: http {status}")));
        }
        let value: Value = resp.json().await?;
        check_exception(wsfunction, value)
    }

    /// Retry transport errors and 5xx with exponential backoff; 4xx pass through.
    async fn send_with_retry<F>(&self, build: F) -> Result<reqwest::Response, SourceError>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        let mut attempt: u32 = 0;
        loop {
            let outcome = build().send().await;
            let retryable = match &outcome {
                Ok(rsp) => rsp.status().is_server_error(),
                Err(e) => !e.is_builder(),
            };
            if !retryable || attempt >= self.retry_total {
                return match outcome {
                    Ok(rsp) if rsp.status().is_server_error() => Err(SourceError::Unavailable(
                        format!("http {}", rsp.status()),
                    )),
                    Ok(rsp) => Ok(rsp),
                    Err(e) => Err(SourceError::from(e)),
                };
            }
            let delay = self.retry_backoff.saturating_mul(1u32 << attempt.min(10));
            attempt += 1;
            warn!(attempt, max = self.retry_total, delay_ms = delay.as_millis() as u64, "moodle request failed; retrying");
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait::async_trait]
impl NotificationSource for MoodleClient {
    async fn fetch_notifications(&self) -> Result<Vec<Notification>, SourceError> {
        let session = self.current_session().await?;
        match self.fetch_for(&session).await {
            Err(SourceError::SessionExpired(code)) => {
                info!(%code, "Moodle session expired; re-authenticating");
                let session = self.refresh_session().await?;
                match self.fetch_for(&session).await {
                    Err(SourceError::SessionExpired(code)) => Err(SourceError::Authentication(
                        format!("refreshed session rejected ({code})"),
                    )),
                    other => other,
                }
            }
            other => other,
        }
    }

    fn name(&self) -> &'static str {
        "moodle"
    }
}

/// Map Moodle's `{"exception","errorcode","message"}` envelope onto errors.
fn check_exception(wsfunction: &str, value: Value) -> Result<Value, SourceError> {
    let Some(obj) = value.as_object() else {
        return Ok(value);
    };
    if !obj.contains_key("exception") && !obj.contains_key("errorcode") {
        return Ok(value);
    }
    let code = obj
        .get("errorcode")
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .to_string();
    let message = obj
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    if SESSION_ERROR_CODES.contains(&code.as_str()) {
        Err(SourceError::SessionExpired(code))
    } else {
        Err(SourceError::Unavailable(format!(
            "{wsfunction} failed ({code}): {message}"
        )))
    }
}

#[derive(Debug, Deserialize)]
struct RawNotification {
    id: i64,
    #[serde(default)]
    subject: Option<String>,
    #[serde(default)]
    fullmessagehtml: Option<String>,
    #[serde(default)]
    fullmessage: Option<String>,
    #[serde(default)]
    smallmessage: Option<String>,
    #[serde(default)]
    timecreated: Option<i64>,
    #[serde(default)]
    contexturl: Option<String>,
    #[serde(default)]
    component: Option<String>,
    #[serde(default)]
    eventtype: Option<String>,
    #[serde(default)]
    courseid: Option<Value>,
    #[serde(default)]
    customdata: Option<String>,
    #[serde(default)]
    useridfrom: Option<i64>,
}

impl RawNotification {
    fn into_notification(self, now: DateTime<Utc>) -> Notification {
        let raw_body = [&self.fullmessagehtml, &self.fullmessage, &self.smallmessage]
            .into_iter()
            .flatten()
            .find(|s| !s.trim().is_empty())
            .cloned()
            .unwrap_or_default();

        let course_id = self
            .courseid
            .as_ref()
            .and_then(value_as_i64)
            .or_else(|| course_from_customdata(self.customdata.as_deref()));

        Notification {
            id: self.id,
            subject: self.subject.unwrap_or_default().trim().to_string(),
            raw_body,
            normalized_body: None,
            summary: None,
            course_id,
            received_at: now,
            created_at: self.timecreated.and_then(epoch_to_datetime),
            context_url: self.contexturl.filter(|s| !s.is_empty()),
            component: self.component,
            event_type: self.eventtype,
            sender_id: self.useridfrom,
        }
    }
}

fn value_as_i64(v: &Value) -> Option<i64> {
    match v {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn course_from_customdata(raw: Option<&str>) -> Option<i64> {
    let parsed: Value = serde_json::from_str(raw?).ok()?;
    parsed.get("courseid").and_then(value_as_i64)
}

/// Moodle reports seconds; some proxies report milliseconds.
fn epoch_to_datetime(ts: i64) -> Option<DateTime<Utc>> {
    let secs = if ts > 1_000_000_000_000 { ts / 1000 } else { ts };
    Utc.timestamp_opt(secs, 0).single()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn session_error_codes_map_to_expiry() {
        let err = check_exception(
            "f",
            json!({"exception": "moodle_exception", "errorcode": "invalidtoken", "message": "Invalid token"}),
        )
        .unwrap_err();
        assert!(matches!(err, SourceError::SessionExpired(ref c) if c == "invalidtoken"));
    }

    #[test]
    fn other_error_codes_are_unavailable() {
        let err = check_exception(
            "f",
            json!({"exception": "dml_exception", "errorcode": "dmlreadexception", "message": "db"}),
        )
        .unwrap_err();
        assert!(matches!(err, SourceError::Unavailable(_)));
        assert!(check_exception("f", json!({"notifications": []})).is_ok());
        assert!(check_exception("f", json!([1, 2])).is_ok());
    }

    #[test]
    fn raw_notification_prefers_html_and_reads_course_from_customdata() {
        let raw: RawNotification = serde_json::from_value(json!({
            "id": 12,
            "subject": "  New grade ",
            "fullmessagehtml": "",
            "fullmessage": "plain text",
            "timecreated": 1_700_000_000_000i64,
            "customdata": "{\"courseid\":\"31\"}"
        }))
        .unwrap();
        let n = raw.into_notification(Utc::now());
        assert_eq!(n.subject, "New grade");
        assert_eq!(n.raw_body, "plain text");
        assert_eq!(n.course_id, Some(31));
        assert_eq!(n.created_at.unwrap().timestamp(), 1_700_000_000);
    }

    #[test]
    fn explicit_courseid_wins() {
        let raw: RawNotification = serde_json::from_value(json!({
            "id": 1,
            "courseid": 5,
            "customdata": "{\"courseid\":9}"
        }))
        .unwrap();
        assert_eq!(raw.into_notification(Utc::now()).course_id, Some(5));
    }
}
