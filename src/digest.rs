use anyhow::Result;
use chrono::{DateTime, Datelike, Utc};
use std::collections::BTreeMap;
use std::io::Write;
use tracing::{info, warn};

use crate::db::{Database, Recipient};
use crate::models::Job;

const SOURCE_LABELS: &[(&str, &str)] = &[
    ("capa", "CAPA"),
    ("interimsearch", "Interim Search"),
    ("wise", "Wise"),
    ("headagent", "Head Agent"),
    ("michaelberglund", "Michael Berglund"),
    ("mason", "Mason"),
    ("hammerhanborg", "Hammer & Hanborg"),
    ("novare", "Novare"),
    ("platsbanken", "Platsbanken (Arbetsförmedlingen)"),
];

pub fn source_label(source: &str) -> String {
    SOURCE_LABELS
        .iter()
        .find(|(s, _)| *s == source)
        .map(|(_, label)| label.to_string())
        .unwrap_or_else(|| title_case(source))
}

fn title_case(s: &str) -> String {
    s.split(|c: char| c == '_' || c == ' ')
        .filter(|w| !w.is_empty())
        .map(|w| {
            let mut chars = w.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Plain-text digest, one section per source.
pub fn render_digest(jobs: &[Job], date: DateTime<Utc>) -> String {
    let mut by_source: BTreeMap<&str, Vec<&Job>> = BTreeMap::new();
    for job in jobs {
        by_source.entry(job.source.as_str()).or_default().push(job);
    }

    let mut out = format!(
        "Job Digest - {} ({} new)\n",
        date.format("%d %b %Y"),
        jobs.len()
    );

    for (source, source_jobs) in by_source {
        let label = source_label(source);
        out.push_str(&format!("\n{}\n{}\n", label, "-".repeat(label.chars().count())));
        for job in source_jobs {
            // The agency itself is often listed as the company.
            if !job.company.is_empty() && job.company != label {
                out.push_str(&format!("* {} ({})\n", job.title, job.company));
            } else {
                out.push_str(&format!("* {}\n", job.title));
            }
            out.push_str(&format!("  {}\n", job.url));
        }
    }
    out
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct DigestStats {
    pub recipients: usize,
    pub delivered: usize,
    pub jobs_sent: usize,
}

/// Writes today's digests to `out` and marks the delivered entries sent.
///
/// `weekday` defaults to the weekday of `now`. A dry run leaves the queue
/// untouched.
pub fn deliver_digests<W: Write>(
    db: &Database,
    weekday: Option<u8>,
    now: DateTime<Utc>,
    dry_run: bool,
    out: &mut W,
) -> Result<DigestStats> {
    let weekday = weekday.unwrap_or_else(|| now.weekday().number_from_monday() as u8);
    let recipients = db.digest_recipients(weekday)?;
    let mut stats = DigestStats {
        recipients: recipients.len(),
        ..Default::default()
    };

    for Recipient { user_id, email } in recipients {
        let jobs = db.unsent_jobs_for_user(user_id)?;
        if jobs.is_empty() {
            continue;
        }

        writeln!(out, "To: {}", email)?;
        writeln!(out, "{}", render_digest(&jobs, now))?;

        if !dry_run {
            let ids: Vec<String> = jobs.iter().map(|j| j.id.clone()).collect();
            let marked = db.mark_queue_sent(user_id, &ids, now)?;
            if marked != ids.len() {
                warn!(user_id, expected = ids.len(), marked, "some entries were already sent");
            }
        }
        stats.delivered += 1;
        stats.jobs_sent += jobs.len();
    }

    info!(
        weekday,
        recipients = stats.recipients,
        delivered = stats.delivered,
        jobs = stats.jobs_sent,
        dry_run,
        "digests written"
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SubscriptionStatus;
    use chrono::TimeZone;

    fn monday() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 10, 7, 0, 0).unwrap()
    }

    fn job(id: &str, title: &str, company: &str, source: &str) -> Job {
        Job {
            id: id.to_string(),
            title: title.to_string(),
            company: company.to_string(),
            url: format!("https://example.com/{}", id),
            source: source.to_string(),
            country: None,
            municipality_code: None,
            region_code: None,
            location_raw: None,
            employment_type: None,
            first_seen_at: monday(),
        }
    }

    #[test]
    fn test_source_labels() {
        assert_eq!(source_label("hammerhanborg"), "Hammer & Hanborg");
        assert_eq!(source_label("nigel_wright"), "Nigel Wright");
    }

    #[test]
    fn test_render_groups_by_source() {
        let jobs = vec![
            job("a", "CEO", "Acme", "wise"),
            job("b", "CFO", "CAPA", "capa"),
            job("c", "VP Sales", "", "wise"),
        ];
        let text = render_digest(&jobs, monday());

        assert!(text.starts_with("Job Digest - 10 Mar 2025 (3 new)"));
        let capa = text.find("CAPA\n").unwrap();
        let wise = text.find("Wise\n").unwrap();
        assert!(capa < wise);
        assert!(text.contains("* CEO (Acme)\n"));
        assert!(text.contains("* CFO\n"));
        assert!(text.contains("* VP Sales\n  https://example.com/c\n"));
    }

    #[test]
    fn test_deliver_marks_sent_unless_dry_run() {
        let db = Database::open_in_memory().unwrap();
        db.init().unwrap();
        let anna = db
            .create_user("anna@example.com", SubscriptionStatus::Trialing, monday())
            .unwrap();
        let bo = db
            .create_user("bo@example.com", SubscriptionStatus::Active, monday())
            .unwrap();
        db.insert_job(&job("a", "CEO", "Acme", "wise")).unwrap();
        db.insert_queue_entries(&[(anna, "a".to_string())], monday()).unwrap();

        let mut out = Vec::new();
        let stats = deliver_digests(&db, None, monday(), true, &mut out).unwrap();
        assert_eq!(stats, DigestStats { recipients: 2, delivered: 1, jobs_sent: 1 });
        assert_eq!(db.unsent_jobs_for_user(anna).unwrap().len(), 1);

        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("To: anna@example.com"));
        assert!(!text.contains("bo@example.com"));

        let mut out = Vec::new();
        deliver_digests(&db, Some(1), monday(), false, &mut out).unwrap();
        assert!(db.unsent_jobs_for_user(anna).unwrap().is_empty());
        assert!(db.unsent_jobs_for_user(bo).unwrap().is_empty());

        // Sunday is not a default delivery day.
        let stats = deliver_digests(&db, Some(7), monday(), false, &mut Vec::new()).unwrap();
        assert_eq!(stats.recipients, 0);
    }
}
