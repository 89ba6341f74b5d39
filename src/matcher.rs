//! The per-user job filter.
//!
//! Shared by the bootstrap reconciler and the ingestion-time matcher so the
//! two paths can never disagree about what a user should receive.

use crate::models::{Filter, Job, UserPreferences};

/// Returns true when `job` passes every filter in `prefs`.
///
/// Country and source use plain empty-means-all membership. Region,
/// municipality and employment type additionally let jobs through when the
/// attribute could not be determined for the job.
pub fn matches(job: &Job, prefs: &UserPreferences) -> bool {
    let title = job.title.to_lowercase();

    prefs.countries.permits(&job.country_code().to_string())
        && prefs.sources.permits(&job.source)
        && includes_keyword(&prefs.keywords_include, &title)
        && !excludes_keyword(&prefs.keywords_exclude, &title)
        && prefs.regions.permits_unknown(job.region_code.as_ref())
        && prefs.municipalities.permits_unknown(job.municipality_code.as_ref())
        && prefs.employment_types.permits_unknown(job.employment_type.as_ref())
}

fn includes_keyword(filter: &Filter<String>, title: &str) -> bool {
    match filter {
        Filter::Unrestricted => true,
        Filter::RestrictedTo(keywords) => contains_any(keywords, title),
    }
}

fn excludes_keyword(filter: &Filter<String>, title: &str) -> bool {
    match filter {
        Filter::Unrestricted => false,
        Filter::RestrictedTo(keywords) => contains_any(keywords, title),
    }
}

// `title` is already lowercased.
fn contains_any<'a, I>(keywords: I, title: &str) -> bool
where
    I: IntoIterator<Item = &'a String>,
{
    keywords
        .into_iter()
        .any(|kw| title.contains(&kw.to_lowercase()))
}
