use std::env;
use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rustilms_completion::completion::{
    can_mark_self_completed, classify_status, is_self_completion_available, is_view_enabled,
    CompletionResolver, FetchOptions, MARK_SELF_COMPLETED, READ_COMPLETION_STATUS,
};
use rustilms_completion::models::CompletionStatus;
use rustilms_completion::rest::{RestCourseDirectory, RestRegistry, RestSite, SiteDescriptor};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            env::var("RUST_LOG").unwrap_or_else(|_| "rustilms_completion=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let base_url = env::var("LMS_BASE_URL").context("LMS_BASE_URL not set")?;
    let token = env::var("LMS_TOKEN").context("LMS_TOKEN not set")?;
    let site_user: u64 = env::var("LMS_USER_ID")
        .context("LMS_USER_ID not set")?
        .parse()
        .context("LMS_USER_ID must be a numeric id")?;
    let site_id = env::var("LMS_SITE_ID").unwrap_or_else(|_| "1".into());

    let mut args = env::args().skip(1);
    let course_id: u64 = args
        .next()
        .context("usage: rustilms-completion <courseid> [userid]")?
        .parse()
        .context("courseid must be numeric")?;
    let user_id: Option<u64> = args
        .next()
        .map(|raw| raw.parse().context("userid must be numeric"))
        .transpose()?;

    let site = Arc::new(RestSite::new(SiteDescriptor {
        site_id,
        base_url,
        token,
        user_id: site_user,
        // The site-info handshake belongs to the enclosing app; assume the
        // completion functions are deployed.
        functions: vec![
            READ_COMPLETION_STATUS.to_string(),
            MARK_SELF_COMPLETED.to_string(),
        ],
    }));

    if !is_view_enabled(site.as_ref()) {
        anyhow::bail!("completion view is not available on this site");
    }

    let resolver = CompletionResolver::new(
        Arc::new(RestRegistry::new(site.clone())),
        Arc::new(RestCourseDirectory::new(site.clone())),
    );

    let target_user = user_id.unwrap_or(site_user);
    let completion = resolver
        .fetch_completion(course_id, Some(target_user), FetchOptions::default())
        .await?;

    let label = match classify_status(&completion) {
        CompletionStatus::Completed => "completed",
        CompletionStatus::InProgress => "in progress",
        CompletionStatus::NotYetStarted => "not yet started",
    };
    println!("course {course_id}, user {target_user}: {label}");

    if can_mark_self_completed(site_user, target_user, &completion)
        && is_self_completion_available(site.as_ref())
    {
        println!("self completion can be marked for this course");
    }

    Ok(())
}
