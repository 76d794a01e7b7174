use std::sync::Arc;

use serde_json::json;

use crate::error::{CompletionError, WsError};
use crate::models::{
    CompletionStatus, CompletionStatusResponse, CourseCompletion, SelfCompletionResponse,
    CRITERIA_TYPE_SELF,
};
use crate::site::{CourseDirectory, EmergencyCache, ReadOptions, Site, SiteRegistry};

/// Webservice function names. Part of the wire contract; do not rename.
pub const READ_COMPLETION_STATUS: &str = "core_completion_get_course_completion_status";
pub const MARK_SELF_COMPLETED: &str = "core_completion_mark_course_self_completed";

const ROOT_CACHE_KEY: &str = "CourseCompletion:";

/// Request-cache key for one (course, user) completion view. Used both to
/// populate and to invalidate entries, so both paths go through here.
pub fn completion_cache_key(course_id: u64, user_id: u64) -> String {
    format!("{ROOT_CACHE_KEY}view:{course_id}:{user_id}")
}

/// Whether the acting user may mark their own completion in this course.
///
/// Only the target user themselves may self-mark, and only while a
/// self-completion criterion exists that is not yet satisfied.
pub fn can_mark_self_completed(
    current_user_id: u64,
    target_user_id: u64,
    completion: &CourseCompletion,
) -> bool {
    if current_user_id != target_user_id {
        return false;
    }

    let mut self_completion_active = false;
    let mut already_marked = false;
    for criterion in &completion.completions {
        if criterion.kind == CRITERIA_TYPE_SELF {
            // At most one of these should exist per course/user; if the
            // server ever sends several, the last one wins.
            self_completion_active = true;
            already_marked = criterion.complete;
        }
    }

    self_completion_active && !already_marked
}

/// Derive the three-state course status from raw completion data.
pub fn classify_status(completion: &CourseCompletion) -> CompletionStatus {
    if completion.completed {
        return CompletionStatus::Completed;
    }
    if completion.completions.iter().any(|c| c.has_progress()) {
        CompletionStatus::InProgress
    } else {
        CompletionStatus::NotYetStarted
    }
}

/// Whether the completion view is usable on this site at all. O(1) over
/// local session state, safe to call per render; never touches the network.
pub fn is_view_enabled(site: &dyn Site) -> bool {
    site.is_logged_in() && site.is_operation_available(READ_COMPLETION_STATUS)
}

/// Whether the site advertises the self-completion write function.
pub fn is_self_completion_available(site: &dyn Site) -> bool {
    site.is_operation_available(MARK_SELF_COMPLETED)
}

/// Per-call knobs for [`CompletionResolver::fetch_completion`].
#[derive(Debug, Clone, Default)]
pub struct FetchOptions {
    /// Target site; `None` uses the active site.
    pub site_id: Option<String>,
    pub emergency_cache: EmergencyCache,
    /// Accept an expired cached value instead of requiring a fresh one.
    pub omit_expires: bool,
}

/// Client-side accessor for the course-completion webservice functions.
///
/// Owns no state of its own; session, cache store and course list all live
/// in the injected collaborators.
pub struct CompletionResolver {
    sites: Arc<dyn SiteRegistry>,
    courses: Arc<dyn CourseDirectory>,
}

impl CompletionResolver {
    pub fn new(sites: Arc<dyn SiteRegistry>, courses: Arc<dyn CourseDirectory>) -> Self {
        Self { sites, courses }
    }

    /// Fetch raw completion data for a course, defaulting the user to the
    /// site's current user.
    pub async fn fetch_completion(
        &self,
        course_id: u64,
        user_id: Option<u64>,
        options: FetchOptions,
    ) -> Result<CourseCompletion, CompletionError> {
        let site = self.sites.resolve_site(options.site_id.as_deref()).await?;
        let user_id = user_id.unwrap_or_else(|| site.current_user_id());

        let payload = json!({ "courseid": course_id, "userid": user_id });
        let read = ReadOptions {
            cache_key: Some(completion_cache_key(course_id, user_id)),
            emergency_cache: options.emergency_cache,
            omit_expires: options.omit_expires,
        };

        let raw = site.read(READ_COMPLETION_STATUS, payload, read).await?;
        let response: CompletionStatusResponse =
            serde_json::from_value(raw).map_err(|e| WsError::Decode(e.to_string()))?;

        response
            .completionstatus
            .ok_or(CompletionError::NoStatusAvailable)
    }

    /// Drop the cached completion entry for a course/user. Callers should
    /// do this after a successful submit so the next fetch is live.
    pub async fn invalidate_completion(
        &self,
        course_id: u64,
        user_id: Option<u64>,
    ) -> Result<(), CompletionError> {
        let site = self.sites.resolve_site(None).await?;
        let user_id = user_id.unwrap_or_else(|| site.current_user_id());
        site.invalidate_cache_entry(&completion_cache_key(course_id, user_id))
            .await?;
        Ok(())
    }

    /// Whether the completion view applies to this course. Fails before any
    /// I/O when no course id is supplied.
    pub async fn is_view_enabled_for_course(
        &self,
        course_id: Option<u64>,
        prefer_cache: bool,
    ) -> Result<bool, CompletionError> {
        let Some(course_id) = course_id else {
            return Err(CompletionError::InvalidArgument);
        };
        let course = self.courses.user_course(course_id, prefer_cache).await?;
        Ok(course.enablecompletion != Some(0))
    }

    /// Whether completion data is actually retrievable for this user.
    ///
    /// Two-phase probe: a live fetch with the emergency cache disabled, then
    /// on an ambiguous failure one retry that accepts any cached value. A
    /// confirmed server rejection is authoritative and skips the retry; an
    /// offline failure must not be mistaken for "feature disabled".
    pub async fn is_view_enabled_for_user(&self, course_id: u64, user_id: u64) -> bool {
        let live = FetchOptions {
            emergency_cache: EmergencyCache::Disabled,
            ..FetchOptions::default()
        };
        let error = match self.fetch_completion(course_id, Some(user_id), live).await {
            Ok(_) => return true,
            Err(error) => error,
        };

        if error.is_server_rejection() {
            return false;
        }

        tracing::debug!(course_id, user_id, error = %error, "completion probe failed, retrying against cache");
        let cached = FetchOptions {
            omit_expires: true,
            ..FetchOptions::default()
        };
        self.fetch_completion(course_id, Some(user_id), cached)
            .await
            .is_ok()
    }

    /// Mark the current user's self completion for a course. Does not
    /// invalidate the completion cache entry; that is the caller's move.
    pub async fn submit_self_completion(&self, course_id: u64) -> Result<(), CompletionError> {
        let site = self.sites.resolve_site(None).await?;
        let raw = site
            .write(MARK_SELF_COMPLETED, json!({ "courseid": course_id }))
            .await?;
        let response: SelfCompletionResponse =
            serde_json::from_value(raw).map_err(|e| WsError::Decode(e.to_string()))?;

        if response.status {
            Ok(())
        } else {
            Err(CompletionError::SubmissionRejected)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CompletionCriterion;
    use chrono::{TimeZone, Utc};

    fn criterion(kind: u32, complete: bool) -> CompletionCriterion {
        CompletionCriterion {
            kind,
            complete,
            time_completed: None,
            title: None,
        }
    }

    fn completion(completed: bool, completions: Vec<CompletionCriterion>) -> CourseCompletion {
        CourseCompletion {
            completed,
            completions,
            aggregation: None,
        }
    }

    #[test]
    fn self_mark_requires_matching_user() {
        let data = completion(false, vec![criterion(CRITERIA_TYPE_SELF, false)]);
        assert!(can_mark_self_completed(7, 7, &data));
        assert!(!can_mark_self_completed(7, 8, &data));
    }

    #[test]
    fn self_mark_requires_a_self_criterion() {
        let data = completion(false, vec![criterion(2, false), criterion(6, false)]);
        assert!(!can_mark_self_completed(7, 7, &data));
        let empty = completion(false, vec![]);
        assert!(!can_mark_self_completed(7, 7, &empty));
    }

    #[test]
    fn self_mark_unavailable_once_marked() {
        let data = completion(false, vec![criterion(CRITERIA_TYPE_SELF, true)]);
        assert!(!can_mark_self_completed(7, 7, &data));
    }

    #[test]
    fn duplicate_self_criteria_last_wins() {
        let data = completion(
            false,
            vec![
                criterion(CRITERIA_TYPE_SELF, false),
                criterion(CRITERIA_TYPE_SELF, true),
            ],
        );
        assert!(!can_mark_self_completed(7, 7, &data));

        let data = completion(
            false,
            vec![
                criterion(CRITERIA_TYPE_SELF, true),
                criterion(CRITERIA_TYPE_SELF, false),
            ],
        );
        assert!(can_mark_self_completed(7, 7, &data));
    }

    #[test]
    fn completed_flag_wins_over_criteria() {
        let data = completion(true, vec![]);
        assert_eq!(classify_status(&data), CompletionStatus::Completed);
    }

    #[test]
    fn untouched_criteria_mean_not_yet_started() {
        let data = completion(false, vec![criterion(2, false)]);
        assert_eq!(classify_status(&data), CompletionStatus::NotYetStarted);
    }

    #[test]
    fn any_satisfied_criterion_means_in_progress() {
        let data = completion(false, vec![criterion(2, false), criterion(4, true)]);
        assert_eq!(classify_status(&data), CompletionStatus::InProgress);
    }

    #[test]
    fn a_timestamp_alone_means_in_progress() {
        let mut touched = criterion(2, false);
        touched.time_completed = Some(Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap());
        let data = completion(false, vec![touched]);
        assert_eq!(classify_status(&data), CompletionStatus::InProgress);
    }

    #[test]
    fn cache_key_is_stable_and_collision_free() {
        assert_eq!(completion_cache_key(5, 42), "CourseCompletion:view:5:42");
        assert_eq!(completion_cache_key(5, 42), completion_cache_key(5, 42));
        assert_ne!(completion_cache_key(5, 42), completion_cache_key(42, 5));
    }
}
