use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::WsError;
use crate::models::CourseRecord;

/// Whether a read may fall back to a last-resort cached copy when the live
/// request fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EmergencyCache {
    #[default]
    Allowed,
    Disabled,
}

/// Options attached to a single webservice read.
#[derive(Debug, Clone, Default)]
pub struct ReadOptions {
    /// Key under which the response may be cached and later invalidated.
    /// Fetch and invalidate callers must agree on the derivation.
    pub cache_key: Option<String>,
    pub emergency_cache: EmergencyCache,
    /// Accept an expired cache entry instead of requiring a fresh one.
    pub omit_expires: bool,
}

/// One authenticated connection to an LMS site.
///
/// Object-safe on purpose: callers hold an `Arc<dyn Site>` without
/// depending on a concrete transport.
#[async_trait]
pub trait Site: Send + Sync {
    fn id(&self) -> &str;

    fn current_user_id(&self) -> u64;

    fn is_logged_in(&self) -> bool;

    /// Whether the site advertises the given webservice function.
    fn is_operation_available(&self, function: &str) -> bool;

    /// Execute a read-only webservice function. Caching policy is the
    /// site's own; this crate only supplies the key via [`ReadOptions`].
    async fn read(
        &self,
        function: &str,
        payload: Value,
        options: ReadOptions,
    ) -> Result<Value, WsError>;

    /// Execute a state-changing webservice function. Never cached.
    async fn write(&self, function: &str, payload: Value) -> Result<Value, WsError>;

    async fn invalidate_cache_entry(&self, key: &str) -> Result<(), WsError>;
}

#[async_trait]
pub trait SiteRegistry: Send + Sync {
    /// Resolve a site handle; `None` resolves the active site.
    async fn resolve_site(&self, site_id: Option<&str>) -> Result<Arc<dyn Site>, WsError>;
}

#[async_trait]
pub trait CourseDirectory: Send + Sync {
    async fn user_course(&self, course_id: u64, prefer_cache: bool)
        -> Result<CourseRecord, WsError>;
}
