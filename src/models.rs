use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Country assumed for jobs whose source did not tag one.
pub const DEFAULT_COUNTRY: &str = "SE";

pub const DEFAULT_KEYWORDS_INCLUDE: &[&str] = &[
    // English
    "CEO", "Country Manager", "General Manager", "Managing Director",
    "Business Unit Director", "BU Director", "Vice President", "VP",
    "Senior Vice President", "SVP", "CMO", "CCO", "CSO", "CBDO",
    "Commercial Director", "Marketing Director", "Commercial Lead",
    "Head of Commercial", "Head of Marketing",
    // Swedish
    "VD", "Landschef", "Affärsområdesdirektör", "Affärsområdeschef",
    "Marknadsdirektör", "Kommersiell direktör", "Affärsutvecklingsdirektör",
    "Försäljningsdirektör",
];

pub const DEFAULT_KEYWORDS_EXCLUDE: &[&str] = &[
    "junior", "assistant", "coordinator", "assisterande", "assistent",
];

/// One filter dimension of a user's preferences.
///
/// An empty collection never becomes `RestrictedTo`; it is `Unrestricted`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<T>", into = "Vec<T>")]
pub enum Filter<T: Ord + Clone> {
    Unrestricted,
    RestrictedTo(BTreeSet<T>),
}

impl<T: Ord + Clone> Filter<T> {
    pub fn from_values<I: IntoIterator<Item = T>>(values: I) -> Self {
        let set: BTreeSet<T> = values.into_iter().collect();
        if set.is_empty() {
            Filter::Unrestricted
        } else {
            Filter::RestrictedTo(set)
        }
    }

    /// Plain empty-means-all membership.
    pub fn permits(&self, value: &T) -> bool {
        match self {
            Filter::Unrestricted => true,
            Filter::RestrictedTo(set) => set.contains(value),
        }
    }

    /// Membership where an unknown value bypasses the filter.
    pub fn permits_unknown(&self, value: Option<&T>) -> bool {
        match value {
            None => true,
            Some(v) => self.permits(v),
        }
    }

    pub fn values(&self) -> Vec<T> {
        match self {
            Filter::Unrestricted => Vec::new(),
            Filter::RestrictedTo(set) => set.iter().cloned().collect(),
        }
    }

    pub fn is_unrestricted(&self) -> bool {
        matches!(self, Filter::Unrestricted)
    }
}

impl<T: Ord + Clone> Default for Filter<T> {
    fn default() -> Self {
        Filter::Unrestricted
    }
}

impl<T: Ord + Clone> From<Vec<T>> for Filter<T> {
    fn from(values: Vec<T>) -> Self {
        Filter::from_values(values)
    }
}

impl<T: Ord + Clone> From<Filter<T>> for Vec<T> {
    fn from(filter: Filter<T>) -> Self {
        filter.values()
    }
}

impl<T: Ord + Clone + fmt::Display> fmt::Display for Filter<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Filter::Unrestricted => write!(f, "(all)"),
            Filter::RestrictedTo(set) => {
                let parts: Vec<String> = set.iter().map(|v| v.to_string()).collect();
                write!(f, "{}", parts.join(", "))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmploymentType {
    Permanent,
    Interim,
}

impl EmploymentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EmploymentType::Permanent => "permanent",
            EmploymentType::Interim => "interim",
        }
    }
}

impl fmt::Display for EmploymentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EmploymentType {
    type Err = PreferencesError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "permanent" => Ok(EmploymentType::Permanent),
            "interim" => Ok(EmploymentType::Interim),
            other => Err(PreferencesError::UnknownEmploymentType(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Trialing,
    Active,
    PastDue,
    Canceled,
    Inactive,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Trialing => "trialing",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::Canceled => "canceled",
            SubscriptionStatus::Inactive => "inactive",
        }
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubscriptionStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "trialing" => Ok(SubscriptionStatus::Trialing),
            "active" => Ok(SubscriptionStatus::Active),
            "past_due" => Ok(SubscriptionStatus::PastDue),
            "canceled" => Ok(SubscriptionStatus::Canceled),
            "inactive" => Ok(SubscriptionStatus::Inactive),
            other => Err(anyhow::anyhow!("Unknown subscription status: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub email: String,
    pub subscription: SubscriptionStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub title: String,
    pub company: String,
    pub url: String,
    pub source: String,
    pub country: Option<String>,
    pub municipality_code: Option<String>,
    pub region_code: Option<String>,
    pub location_raw: Option<String>,
    pub employment_type: Option<EmploymentType>,
    pub first_seen_at: DateTime<Utc>,
}

impl Job {
    pub fn country_code(&self) -> &str {
        self.country.as_deref().unwrap_or(DEFAULT_COUNTRY)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserPreferences {
    pub user_id: i64,
    /// ISO weekdays, 1 = Monday.
    pub delivery_days: BTreeSet<u8>,
    pub keywords_include: Filter<String>,
    pub keywords_exclude: Filter<String>,
    pub sources: Filter<String>,
    pub countries: Filter<String>,
    pub regions: Filter<String>,
    pub municipalities: Filter<String>,
    pub employment_types: Filter<EmploymentType>,
}

impl UserPreferences {
    /// Preferences with every filter unrestricted. Matches every job.
    #[cfg(test)]
    pub fn unrestricted(user_id: i64) -> Self {
        Self {
            user_id,
            delivery_days: (1..=7).collect(),
            keywords_include: Filter::Unrestricted,
            keywords_exclude: Filter::Unrestricted,
            sources: Filter::Unrestricted,
            countries: Filter::Unrestricted,
            regions: Filter::Unrestricted,
            municipalities: Filter::Unrestricted,
            employment_types: Filter::Unrestricted,
        }
    }

    /// What a new account starts with.
    pub fn signup_defaults(user_id: i64) -> Self {
        Self {
            user_id,
            delivery_days: (1..=5).collect(),
            keywords_include: Filter::from_values(
                DEFAULT_KEYWORDS_INCLUDE.iter().map(|k| k.to_string()),
            ),
            keywords_exclude: Filter::from_values(
                DEFAULT_KEYWORDS_EXCLUDE.iter().map(|k| k.to_string()),
            ),
            sources: Filter::Unrestricted,
            countries: Filter::Unrestricted,
            regions: Filter::Unrestricted,
            municipalities: Filter::Unrestricted,
            employment_types: Filter::from_values([
                EmploymentType::Permanent,
                EmploymentType::Interim,
            ]),
        }
    }

    /// Checks and normalizes values before they are persisted.
    ///
    /// Keywords and sources are trimmed, country codes upper-cased.
    pub fn validated(mut self) -> Result<Self, PreferencesError> {
        if let Some(day) = self.delivery_days.iter().find(|d| !(1..=7).contains(*d)) {
            return Err(PreferencesError::InvalidWeekday(*day));
        }

        self.keywords_include = normalize_keywords(&self.keywords_include)?;
        self.keywords_exclude = normalize_keywords(&self.keywords_exclude)?;

        let mut sources = Vec::new();
        for source in self.sources.values() {
            let source = source.trim().to_lowercase();
            if source.is_empty() {
                return Err(PreferencesError::BlankSource);
            }
            sources.push(source);
        }
        self.sources = Filter::from_values(sources);

        let mut countries = Vec::new();
        for code in self.countries.values() {
            let code = code.trim().to_uppercase();
            if code.len() != 2 || !code.chars().all(|c| c.is_ascii_uppercase()) {
                return Err(PreferencesError::InvalidCode { kind: "country", code });
            }
            countries.push(code);
        }
        self.countries = Filter::from_values(countries);

        self.regions = normalize_digit_codes(&self.regions, 2, "region")?;
        self.municipalities = normalize_digit_codes(&self.municipalities, 4, "municipality")?;

        Ok(self)
    }
}

fn normalize_keywords(filter: &Filter<String>) -> Result<Filter<String>, PreferencesError> {
    let mut out = Vec::new();
    for kw in filter.values() {
        let kw = kw.trim().to_string();
        if kw.is_empty() {
            return Err(PreferencesError::BlankKeyword);
        }
        out.push(kw);
    }
    Ok(Filter::from_values(out))
}

fn normalize_digit_codes(
    filter: &Filter<String>,
    width: usize,
    kind: &'static str,
) -> Result<Filter<String>, PreferencesError> {
    let mut out = Vec::new();
    for code in filter.values() {
        let code = code.trim().to_string();
        if code.len() != width || !code.chars().all(|c| c.is_ascii_digit()) {
            return Err(PreferencesError::InvalidCode { kind, code });
        }
        out.push(code);
    }
    Ok(Filter::from_values(out))
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PreferencesError {
    #[error("keywords must not be blank")]
    BlankKeyword,
    #[error("source identifiers must not be blank")]
    BlankSource,
    #[error("invalid {kind} code: {code:?}")]
    InvalidCode { kind: &'static str, code: String },
    #[error("unknown employment type: {0:?}")]
    UnknownEmploymentType(String),
    #[error("delivery day {0} is not an ISO weekday (1-7)")]
    InvalidWeekday(u8),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEntry {
    pub user_id: i64,
    pub job_id: String,
    pub queued_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwedishLocation {
    pub municipality_code: String,
    pub municipality_name: String,
    pub lan_code: String,
    pub lan_name: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_values_are_unrestricted() {
        let filter: Filter<String> = Filter::from_values(Vec::new());
        assert!(filter.is_unrestricted());
        assert!(filter.permits(&"anything".to_string()));
    }

    #[test]
    fn test_restricted_filter_membership() {
        let filter = Filter::from_values(["01".to_string(), "14".to_string()]);
        assert!(filter.permits(&"01".to_string()));
        assert!(!filter.permits(&"12".to_string()));
        assert!(filter.permits_unknown(None));
        assert!(!filter.permits_unknown(Some(&"12".to_string())));
    }

    #[test]
    fn test_filter_serializes_as_plain_array() {
        let filter = Filter::from_values([EmploymentType::Interim]);
        assert_eq!(serde_json::to_string(&filter).unwrap(), r#"["interim"]"#);

        let back: Filter<EmploymentType> = serde_json::from_str("[]").unwrap();
        assert_eq!(back, Filter::Unrestricted);
    }

    #[test]
    fn test_signup_defaults() {
        let prefs = UserPreferences::signup_defaults(7);
        assert!(prefs.sources.is_unrestricted());
        assert!(prefs.regions.is_unrestricted());
        assert!(prefs.municipalities.is_unrestricted());
        assert!(prefs.countries.is_unrestricted());
        assert_eq!(
            prefs.employment_types.values(),
            vec![EmploymentType::Permanent, EmploymentType::Interim]
        );
        assert_eq!(prefs.delivery_days, BTreeSet::from([1, 2, 3, 4, 5]));
    }

    #[test]
    fn test_validated_normalizes_values() {
        let mut prefs = UserPreferences::unrestricted(1);
        prefs.keywords_include = Filter::from_values(["  VP ".to_string()]);
        prefs.countries = Filter::from_values(["se".to_string()]);
        prefs.sources = Filter::from_values(["Wise".to_string()]);

        let prefs = prefs.validated().unwrap();
        assert_eq!(prefs.keywords_include.values(), vec!["VP".to_string()]);
        assert_eq!(prefs.countries.values(), vec!["SE".to_string()]);
        assert_eq!(prefs.sources.values(), vec!["wise".to_string()]);
    }

    #[test]
    fn test_validated_rejects_malformed_values() {
        let mut prefs = UserPreferences::unrestricted(1);
        prefs.keywords_exclude = Filter::from_values(["   ".to_string()]);
        assert_eq!(prefs.validated(), Err(PreferencesError::BlankKeyword));

        let mut prefs = UserPreferences::unrestricted(1);
        prefs.regions = Filter::from_values(["1".to_string()]);
        assert!(matches!(
            prefs.validated(),
            Err(PreferencesError::InvalidCode { kind: "region", .. })
        ));

        let mut prefs = UserPreferences::unrestricted(1);
        prefs.municipalities = Filter::from_values(["01a0".to_string()]);
        assert!(prefs.validated().is_err());

        let mut prefs = UserPreferences::unrestricted(1);
        prefs.delivery_days = BTreeSet::from([0]);
        assert_eq!(prefs.validated(), Err(PreferencesError::InvalidWeekday(0)));
    }

    #[test]
    fn test_employment_type_parsing() {
        assert_eq!("Interim".parse::<EmploymentType>(), Ok(EmploymentType::Interim));
        assert!("freelance".parse::<EmploymentType>().is_err());
    }

    #[test]
    fn test_job_country_defaults_to_sweden() {
        let job = Job {
            id: "x".to_string(),
            title: "CEO".to_string(),
            company: String::new(),
            url: "https://example.com".to_string(),
            source: "wise".to_string(),
            country: None,
            municipality_code: None,
            region_code: None,
            location_raw: None,
            employment_type: None,
            first_seen_at: Utc::now(),
        };
        assert_eq!(job.country_code(), "SE");
    }
}
