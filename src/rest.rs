//! reqwest-backed [`Site`] speaking the LMS webservice REST protocol.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;

use crate::error::WsError;
use crate::models::CourseRecord;
use crate::site::{CourseDirectory, EmergencyCache, ReadOptions, Site, SiteRegistry};

const REST_ENDPOINT: &str = "webservice/rest/server.php";
const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(300);

/// Connection details and handshake metadata for one site. The enclosing
/// application performs the site-info handshake and seeds this from it.
#[derive(Debug, Clone)]
pub struct SiteDescriptor {
    pub site_id: String,
    pub base_url: String,
    pub token: String,
    pub user_id: u64,
    /// Webservice functions the site advertises.
    pub functions: Vec<String>,
}

struct CacheEntry {
    value: Value,
    stored_at: Instant,
    stale: bool,
}

/// In-memory request cache. A fresh entry satisfies a normal read; an
/// expired or invalidated one still satisfies `omit_expires` reads and
/// serves as the emergency copy when a live request fails.
struct ResponseCache {
    ttl: Duration,
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl ResponseCache {
    fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn lookup(&self, key: &str, omit_expires: bool) -> Option<Value> {
        let entries = self.entries.lock().ok()?;
        let entry = entries.get(key)?;
        let expired = entry.stale || entry.stored_at.elapsed() >= self.ttl;
        if expired && !omit_expires {
            return None;
        }
        Some(entry.value.clone())
    }

    /// Last-resort copy, served regardless of age or staleness.
    fn emergency(&self, key: &str) -> Option<Value> {
        let entries = self.entries.lock().ok()?;
        entries.get(key).map(|entry| entry.value.clone())
    }

    fn store(&self, key: &str, value: Value) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(
                key.to_string(),
                CacheEntry {
                    value,
                    stored_at: Instant::now(),
                    stale: false,
                },
            );
        }
    }

    /// Invalidation marks the entry stale rather than removing it, so the
    /// next read goes to the network while the emergency copy survives.
    fn invalidate(&self, key: &str) {
        if let Ok(mut entries) = self.entries.lock() {
            if let Some(entry) = entries.get_mut(key) {
                entry.stale = true;
            }
        }
    }
}

/// One authenticated REST connection to an LMS site.
pub struct RestSite {
    http: reqwest::Client,
    site_id: String,
    base_url: String,
    token: String,
    user_id: u64,
    functions: HashSet<String>,
    cache: ResponseCache,
}

impl RestSite {
    pub fn new(descriptor: SiteDescriptor) -> Self {
        Self::with_cache_ttl(descriptor, DEFAULT_CACHE_TTL)
    }

    pub fn with_cache_ttl(descriptor: SiteDescriptor, ttl: Duration) -> Self {
        Self {
            http: reqwest::Client::new(),
            site_id: descriptor.site_id,
            base_url: descriptor.base_url.trim_end_matches('/').to_string(),
            token: descriptor.token,
            user_id: descriptor.user_id,
            functions: descriptor.functions.into_iter().collect(),
            cache: ResponseCache::new(ttl),
        }
    }

    async fn call(&self, function: &str, payload: &Value) -> Result<Value, WsError> {
        let mut form: Vec<(String, String)> = vec![
            ("wstoken".into(), self.token.clone()),
            ("wsfunction".into(), function.to_string()),
            ("moodlewsrestformat".into(), "json".into()),
        ];
        form.extend(form_fields(payload));

        let url = format!("{}/{REST_ENDPOINT}", self.base_url);
        let response = self
            .http
            .post(&url)
            .form(&form)
            .send()
            .await
            .map_err(|e| WsError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(WsError::Http(status.as_u16()));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| WsError::Decode(e.to_string()))?;
        if let Some(rejection) = decode_exception(&body) {
            return Err(rejection);
        }
        Ok(body)
    }
}

/// Flatten a JSON payload object into REST form fields.
fn form_fields(payload: &Value) -> Vec<(String, String)> {
    let Some(object) = payload.as_object() else {
        return Vec::new();
    };
    object
        .iter()
        .map(|(key, value)| {
            let rendered = match value {
                Value::String(s) => s.clone(),
                Value::Bool(b) => if *b { "1" } else { "0" }.to_string(),
                other => other.to_string(),
            };
            (key.clone(), rendered)
        })
        .collect()
}

/// A webservice exception body is a 200 response shaped like
/// `{exception, errorcode, message}`; map it to a confirmed rejection.
fn decode_exception(body: &Value) -> Option<WsError> {
    let object = body.as_object()?;
    if !object.contains_key("exception") {
        return None;
    }
    let field = |name: &str| {
        object
            .get(name)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };
    Some(WsError::Rejected {
        errorcode: field("errorcode"),
        message: field("message"),
    })
}

#[async_trait]
impl Site for RestSite {
    fn id(&self) -> &str {
        &self.site_id
    }

    fn current_user_id(&self) -> u64 {
        self.user_id
    }

    fn is_logged_in(&self) -> bool {
        !self.token.is_empty()
    }

    fn is_operation_available(&self, function: &str) -> bool {
        self.functions.contains(function)
    }

    async fn read(
        &self,
        function: &str,
        payload: Value,
        options: ReadOptions,
    ) -> Result<Value, WsError> {
        if let Some(key) = options.cache_key.as_deref() {
            if let Some(cached) = self.cache.lookup(key, options.omit_expires) {
                tracing::debug!(function, key, "serving webservice read from cache");
                return Ok(cached);
            }
        }

        match self.call(function, &payload).await {
            Ok(value) => {
                if let Some(key) = options.cache_key.as_deref() {
                    self.cache.store(key, value.clone());
                }
                Ok(value)
            }
            Err(error) => {
                if options.emergency_cache == EmergencyCache::Allowed {
                    if let Some(key) = options.cache_key.as_deref() {
                        if let Some(copy) = self.cache.emergency(key) {
                            tracing::warn!(function, key, error = %error, "live request failed, serving emergency copy");
                            return Ok(copy);
                        }
                    }
                }
                Err(error)
            }
        }
    }

    async fn write(&self, function: &str, payload: Value) -> Result<Value, WsError> {
        self.call(function, &payload).await
    }

    async fn invalidate_cache_entry(&self, key: &str) -> Result<(), WsError> {
        self.cache.invalidate(key);
        Ok(())
    }
}

/// Single-active-site registry over a [`RestSite`].
pub struct RestRegistry {
    active: Arc<RestSite>,
}

impl RestRegistry {
    pub fn new(active: Arc<RestSite>) -> Self {
        Self { active }
    }
}

#[async_trait]
impl SiteRegistry for RestRegistry {
    async fn resolve_site(&self, site_id: Option<&str>) -> Result<Arc<dyn Site>, WsError> {
        match site_id {
            None => Ok(self.active.clone()),
            Some(id) if id == self.active.id() => Ok(self.active.clone()),
            Some(other) => Err(WsError::UnknownSite(other.to_string())),
        }
    }
}

/// Course directory backed by `core_course_get_courses_by_field`.
pub struct RestCourseDirectory {
    site: Arc<RestSite>,
}

impl RestCourseDirectory {
    pub fn new(site: Arc<RestSite>) -> Self {
        Self { site }
    }
}

#[derive(serde::Deserialize)]
struct CoursesByFieldResponse {
    #[serde(default)]
    courses: Vec<CourseRecord>,
}

#[async_trait]
impl CourseDirectory for RestCourseDirectory {
    async fn user_course(
        &self,
        course_id: u64,
        prefer_cache: bool,
    ) -> Result<CourseRecord, WsError> {
        let payload = serde_json::json!({ "field": "id", "value": course_id });
        let options = ReadOptions {
            cache_key: Some(format!("Courses:course:{course_id}")),
            omit_expires: prefer_cache,
            ..ReadOptions::default()
        };
        let raw = self
            .site
            .read("core_course_get_courses_by_field", payload, options)
            .await?;
        let response: CoursesByFieldResponse =
            serde_json::from_value(raw).map_err(|e| WsError::Decode(e.to_string()))?;
        response
            .courses
            .into_iter()
            .next()
            .ok_or_else(|| WsError::NotFound(format!("course {course_id}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn exception_bodies_become_rejections() {
        let body = json!({
            "exception": "moodle_exception",
            "errorcode": "nopermissions",
            "message": "Sorry, you do not have permission"
        });
        match decode_exception(&body) {
            Some(WsError::Rejected { errorcode, .. }) => assert_eq!(errorcode, "nopermissions"),
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[test]
    fn plain_results_are_not_rejections() {
        assert!(decode_exception(&json!({ "completed": true })).is_none());
        assert!(decode_exception(&json!([1, 2, 3])).is_none());
    }

    #[test]
    fn form_fields_render_scalars() {
        let fields = form_fields(&json!({ "courseid": 5, "userid": 42 }));
        assert!(fields.contains(&("courseid".into(), "5".into())));
        assert!(fields.contains(&("userid".into(), "42".into())));
    }

    #[test]
    fn fresh_entries_satisfy_normal_reads() {
        let cache = ResponseCache::new(Duration::from_secs(60));
        cache.store("k", json!(1));
        assert_eq!(cache.lookup("k", false), Some(json!(1)));
    }

    #[test]
    fn expired_entries_need_omit_expires() {
        let cache = ResponseCache::new(Duration::ZERO);
        cache.store("k", json!(1));
        assert_eq!(cache.lookup("k", false), None);
        assert_eq!(cache.lookup("k", true), Some(json!(1)));
    }

    #[test]
    fn invalidation_keeps_the_emergency_copy() {
        let cache = ResponseCache::new(Duration::from_secs(60));
        cache.store("k", json!(1));
        cache.invalidate("k");
        assert_eq!(cache.lookup("k", false), None);
        assert_eq!(cache.lookup("k", true), Some(json!(1)));
        assert_eq!(cache.emergency("k"), Some(json!(1)));
    }

    #[test]
    fn missing_keys_miss_everywhere() {
        let cache = ResponseCache::new(Duration::from_secs(60));
        assert_eq!(cache.lookup("k", true), None);
        assert_eq!(cache.emergency("k"), None);
    }
}
