//! Derives the structured fields of a job from its scraped text.

use regex::Regex;
use std::collections::HashMap;
use std::sync::LazyLock;

use crate::models::{EmploymentType, SwedishLocation};

/// Letters that may not touch a keyword for it to count as a whole word.
const WORD_CHARS: &str = "a-zåäöA-ZÅÄÖ";

const INTERIM_KEYWORDS: &[&str] = &[
    "interim",
    "fractional",
    "konsult",
    "uppdrag",
    "deltid",
    "konsultuppdrag",
    "interimschef",
];

const PERMANENT_KEYWORDS: &[&str] = &[
    "tillsvidare",
    "fast tjänst",
    "permanent",
    "heltid",
    "tillsvidareanställning",
    "fast anställning",
];

/// English and ASCII spellings mapped to official municipality names.
const LOCATION_ALIASES: &[(&str, &str)] = &[
    ("gothenburg", "göteborg"),
    ("goeteborg", "göteborg"),
    ("malmo", "malmö"),
    ("umea", "umeå"),
    ("ostersund", "östersund"),
    ("gavle", "gävle"),
    ("vasteras", "västerås"),
    ("norrkoping", "norrköping"),
    ("linkoping", "linköping"),
    ("jonkoping", "jönköping"),
    ("sodertalje", "södertälje"),
    ("angelholm", "ängelholm"),
    ("hassleholm", "hässleholm"),
    ("ornskoldsvik", "örnsköldsvik"),
    ("lulea", "luleå"),
    ("boras", "borås"),
];

/// Sources whose postings are not Swedish.
const SOURCE_COUNTRY: &[(&str, &str)] = &[
    ("nigel_wright", "DK"),
    ("bonesvirik", "NO"),
    ("visindi", "NO"),
];

static INTERIM_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| compile_words(INTERIM_KEYWORDS));
static PERMANENT_PATTERNS: LazyLock<Vec<Regex>> =
    LazyLock::new(|| compile_words(PERMANENT_KEYWORDS));

/// Stable job id: hex MD5 of the posting URL.
pub fn fingerprint(url: &str) -> String {
    format!("{:x}", md5::compute(url.as_bytes()))
}

pub fn country_for_source(source: &str) -> Option<&'static str> {
    SOURCE_COUNTRY
        .iter()
        .find(|(s, _)| *s == source)
        .map(|(_, country)| *country)
}

/// Classifies a posting as interim or permanent, or `None` when unclear.
///
/// A structured value from the source API wins if it is recognised. Otherwise
/// the title and description are scanned for whole-word signals; when both
/// kinds appear, the title decides.
pub fn classify_employment_type(
    title: &str,
    description: Option<&str>,
    api_value: Option<&str>,
) -> Option<EmploymentType> {
    if let Some(value) = api_value {
        match value.trim().to_lowercase().as_str() {
            "interim" | "konsult" | "consultant" | "temporary" | "visstid" => {
                return Some(EmploymentType::Interim);
            }
            "permanent" | "tillsvidare" | "full-time" | "heltid" => {
                return Some(EmploymentType::Permanent);
            }
            _ => {}
        }
    }

    let text = format!("{} {}", title, description.unwrap_or("")).to_lowercase();
    let interim = any_word(&INTERIM_PATTERNS, &text);
    let permanent = any_word(&PERMANENT_PATTERNS, &text);

    match (interim, permanent) {
        (true, true) => {
            let title = title.to_lowercase();
            if any_word(&INTERIM_PATTERNS, &title) {
                Some(EmploymentType::Interim)
            } else if any_word(&PERMANENT_PATTERNS, &title) {
                Some(EmploymentType::Permanent)
            } else {
                None
            }
        }
        (true, false) => Some(EmploymentType::Interim),
        (false, true) => Some(EmploymentType::Permanent),
        (false, false) => None,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ParsedLocation {
    pub municipality_code: Option<String>,
    pub region_code: Option<String>,
    pub location_raw: Option<String>,
}

struct LocationPattern {
    pattern: Regex,
    municipality_code: String,
    lan_code: String,
}

/// Municipality name lookup, longest names first so "Upplands Väsby"
/// wins over "Väsby".
pub struct LocationIndex {
    patterns: Vec<LocationPattern>,
}

impl LocationIndex {
    pub fn new(locations: &[SwedishLocation]) -> Self {
        let mut by_name: HashMap<String, &SwedishLocation> = locations
            .iter()
            .map(|loc| (loc.municipality_name.to_lowercase(), loc))
            .collect();

        for (alias, official) in LOCATION_ALIASES {
            if let Some(loc) = by_name.get(*official).copied() {
                by_name.entry(alias.to_string()).or_insert(loc);
            }
        }

        let mut names: Vec<(String, &SwedishLocation)> = by_name.into_iter().collect();
        names.sort_by(|a, b| {
            b.0.chars()
                .count()
                .cmp(&a.0.chars().count())
                .then_with(|| a.0.cmp(&b.0))
        });

        let patterns = names
            .into_iter()
            .filter_map(|(name, loc)| {
                whole_word(&name, true).map(|pattern| LocationPattern {
                    pattern,
                    municipality_code: loc.municipality_code.clone(),
                    lan_code: loc.lan_code.clone(),
                })
            })
            .collect();

        Self { patterns }
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Finds the first known municipality mentioned in the posting.
    pub fn parse(&self, title: &str, description: Option<&str>) -> ParsedLocation {
        let text = format!("{} {}", title, description.unwrap_or(""));
        if text.trim().is_empty() {
            return ParsedLocation::default();
        }

        for loc in &self.patterns {
            if let Some(caps) = loc.pattern.captures(&text) {
                if let Some(m) = caps.get(1) {
                    return ParsedLocation {
                        municipality_code: Some(loc.municipality_code.clone()),
                        region_code: Some(loc.lan_code.clone()),
                        location_raw: Some(m.as_str().to_string()),
                    };
                }
            }
        }
        ParsedLocation::default()
    }
}

fn compile_words(words: &[&str]) -> Vec<Regex> {
    words.iter().filter_map(|w| whole_word(w, false)).collect()
}

// Group 1 holds the matched word.
fn whole_word(word: &str, case_insensitive: bool) -> Option<Regex> {
    let flags = if case_insensitive { "(?i)" } else { "" };
    let pattern = format!(
        "{flags}(?:^|[^{WORD_CHARS}])({})(?:[^{WORD_CHARS}]|$)",
        regex::escape(word)
    );
    Regex::new(&pattern).ok()
}

fn any_word(patterns: &[Regex], text: &str) -> bool {
    patterns.iter().any(|p| p.is_match(text))
}
