use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use tracing::{debug, info};

use crate::db::Database;
use crate::enrich::{classify_employment_type, country_for_source, fingerprint, LocationIndex};
use crate::models::Job;
use crate::reconcile::{Clock, QueueReconciler};

/// One posting as produced by a scraper run.
#[derive(Debug, Clone, Deserialize)]
pub struct ScrapedPosting {
    pub title: String,
    #[serde(default)]
    pub company: String,
    pub url: String,
    pub source: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
    /// Structured employment type, when the source API has one.
    #[serde(default)]
    pub employment_type: Option<String>,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct ImportStats {
    pub postings: usize,
    pub skipped: usize,
    pub already_seen: usize,
    pub jobs_added: usize,
    pub queued: usize,
}

pub fn read_postings(path: &Path) -> Result<Vec<ScrapedPosting>> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("Failed to read postings file: {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("Failed to parse postings in {}", path.display()))
}

/// Stores postings not seen before and queues them for matching users.
pub fn import_postings<C: Clock>(
    db: &Database,
    locations: &LocationIndex,
    postings: &[ScrapedPosting],
    clock: C,
) -> Result<ImportStats> {
    let now = clock.now();
    let mut stats = ImportStats {
        postings: postings.len(),
        ..Default::default()
    };
    let mut new_jobs: Vec<Job> = Vec::new();
    let mut batch_ids = HashSet::new();

    for posting in postings {
        let title = posting.title.trim();
        let url = posting.url.trim();
        if title.is_empty() || url.is_empty() {
            stats.skipped += 1;
            continue;
        }

        let id = fingerprint(url);
        // Same URL twice within one batch counts as seen too.
        if batch_ids.contains(&id) || db.is_seen(&id)? {
            stats.already_seen += 1;
            continue;
        }

        let job = build_job(id, posting, title, url, locations, now);
        debug!(job_id = %job.id, source = %job.source, "new job");
        batch_ids.insert(job.id.clone());
        new_jobs.push(job);
    }

    let batch = QueueReconciler::new(db, clock).queue_new_jobs(&new_jobs)?;
    stats.jobs_added = batch.jobs_added;
    stats.queued = batch.queued;
    info!(
        postings = stats.postings,
        added = stats.jobs_added,
        queued = stats.queued,
        "import finished"
    );
    Ok(stats)
}

fn build_job(
    id: String,
    posting: &ScrapedPosting,
    title: &str,
    url: &str,
    locations: &LocationIndex,
    now: chrono::DateTime<chrono::Utc>,
) -> Job {
    let description = posting.description.as_deref();
    let location = locations.parse(title, description);
    let country = posting
        .country
        .as_deref()
        .map(|c| c.trim().to_uppercase())
        .filter(|c| !c.is_empty())
        .or_else(|| country_for_source(&posting.source).map(str::to_string));

    Job {
        id,
        title: title.to_string(),
        company: posting.company.trim().to_string(),
        url: url.to_string(),
        source: posting.source.trim().to_lowercase(),
        country,
        municipality_code: location.municipality_code,
        region_code: location.region_code,
        location_raw: location.location_raw,
        employment_type: classify_employment_type(
            title,
            description,
            posting.employment_type.as_deref(),
        ),
        first_seen_at: now,
    }
}
