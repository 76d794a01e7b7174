//! Client-side accessor for an LMS course-completion webservice.

pub mod completion;
pub mod error;
pub mod models;
pub mod rest;
pub mod site;

pub use completion::{
    can_mark_self_completed, classify_status, completion_cache_key, is_self_completion_available,
    is_view_enabled, CompletionResolver, FetchOptions, MARK_SELF_COMPLETED,
    READ_COMPLETION_STATUS,
};
pub use error::{CompletionError, WsError};
pub use models::{
    CompletionCriterion, CompletionStatus, CourseCompletion, CourseRecord, CRITERIA_TYPE_SELF,
};
pub use site::{CourseDirectory, EmergencyCache, ReadOptions, Site, SiteRegistry};
