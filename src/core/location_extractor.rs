//! Location mentions in transcribed call text.
//!
//! Dispatch audio mentions places in a handful of stock shapes: street
//! addresses, cross streets, highways, businesses, landmarks and mile
//! markers. Each shape is one case-insensitive pattern with a base
//! confidence; matches are cleaned, de-duplicated and scored, then handed to
//! the geocode cache as queries.

use std::fmt;

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::adapters::Geocoder;
use crate::core::geocode_cache::{BiasContext, CachedGeocoder, Resolved};

const STREET_SUFFIXES: &str = r"(?:street|st|avenue|ave|boulevard|blvd|road|rd|drive|dr|lane|ln|court|ct|way|circle|cir|place|pl|highway|hwy|freeway|fwy|parkway|pkwy|terrace|ter|trail|trl)";

const DIRECTIONS: &str = r"(?:north|south|east|west|n|s|e|w|ne|nw|se|sw)";

const INTERSECTION_WORDS: &str = r"(?:and|&|at|near|by|corner\s+of|intersection\s+of)";

const BUSINESS_INDICATORS: &str =
    r"(?:at\s+the|behind|in\s+front\s+of|next\s+to|across\s+from|parking\s+lot\s+of)";

/// Kept upper case when cleaning a match
const ABBREVIATIONS: &[&str] = &[
    "i", "us", "sh", "fm", "cr", "hwy", "ne", "nw", "se", "sw", "n", "s", "e", "w",
];

/// Characters of surrounding text shown with a mention
pub const DEFAULT_CONTEXT_WINDOW: usize = 50;

/// Shape of a location mention
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocationKind {
    Address,
    Intersection,
    Street,
    Business,
    Landmark,
}

impl LocationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Address => "address",
            Self::Intersection => "intersection",
            Self::Street => "street",
            Self::Business => "business",
            Self::Landmark => "landmark",
        }
    }
}

impl fmt::Display for LocationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One place mentioned in a transcript
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedLocation {
    /// Cleaned mention text, used as the geocode query
    pub raw_text: String,
    pub kind: LocationKind,
    /// 0.1 to 1.0
    pub confidence: f64,
}

/// A mention plus the transcript text around it
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LocationMention {
    pub location: ExtractedLocation,
    /// Empty when the cleaned text no longer appears verbatim
    pub context: String,
}

/// A mention after a trip through the geocode cache
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GeocodedLocation {
    pub location: ExtractedLocation,
    pub resolved: Option<Resolved>,
    pub error: Option<String>,
}

struct LocationPattern {
    regex: Regex,
    kind: LocationKind,
    base_confidence: f64,
}

/// Pattern-based extractor; build once and share
pub struct LocationExtractor {
    patterns: Vec<LocationPattern>,
}

impl LocationExtractor {
    pub fn new() -> Result<Self, regex::Error> {
        let sources = [
            // "123 Main Street", "123 N Main St"
            (
                format!(r"\b(\d{{1,5}}\s+{DIRECTIONS}?\s*[\w\s]{{2,30}}\s+{STREET_SUFFIXES})\b"),
                LocationKind::Address,
                0.9,
            ),
            // "Main St and 1st Ave"
            (
                format!(
                    r"\b([\w\s]{{2,25}}\s+{STREET_SUFFIXES}\s+{INTERSECTION_WORDS}\s+[\w\s]{{2,25}}\s+{STREET_SUFFIXES})\b"
                ),
                LocationKind::Intersection,
                0.85,
            ),
            // "on Main Street", "heading down Highway 75"
            (
                format!(
                    r"\b(?:on|heading|traveling|turning\s+onto)\s+([\w\s]{{2,25}}\s+{STREET_SUFFIXES})\b"
                ),
                LocationKind::Street,
                0.7,
            ),
            // "I-35", "Highway 380", "US 75"
            (
                r"\b((?:I|Interstate|Highway|Hwy|US|State\s+Highway|SH|FM|CR)\s*-?\s*\d{1,4})\b"
                    .to_string(),
                LocationKind::Street,
                0.8,
            ),
            // "at the Walmart", "behind the gas station"
            (
                format!(r"{BUSINESS_INDICATORS}\s+([\w\s']{{2,30}})"),
                LocationKind::Business,
                0.6,
            ),
            // "at Prosper Town Center", "near the school"
            (
                r"\b(?:at|near)\s+(?:the\s+)?([\w\s]{3,30}(?:center|mall|plaza|park|school|church|hospital|station|building|complex|apartments?))\b"
                    .to_string(),
                LocationKind::Landmark,
                0.65,
            ),
            // "mile marker 42", "MM 156"
            (
                r"\b((?:mile\s+marker|mm)\s*\d{1,3})\b".to_string(),
                LocationKind::Landmark,
                0.75,
            ),
            // "at 5th and Main"
            (
                format!(r"\bat\s+(\d{{1,3}}(?:st|nd|rd|th)?\s+{INTERSECTION_WORDS}\s+\w+)\b"),
                LocationKind::Intersection,
                0.7,
            ),
        ];

        let mut patterns = Vec::with_capacity(sources.len());
        for (source, kind, base_confidence) in sources {
            // ASCII classes keep the bounded repeats small
            let regex = RegexBuilder::new(&source)
                .case_insensitive(true)
                .unicode(false)
                .build()?;
            patterns.push(LocationPattern {
                regex,
                kind,
                base_confidence,
            });
        }
        Ok(Self { patterns })
    }

    /// Distinct mentions, most confident first
    pub fn extract(&self, text: &str) -> Vec<ExtractedLocation> {
        let mut locations: Vec<ExtractedLocation> = Vec::new();
        let mut seen = std::collections::HashSet::new();

        for pattern in &self.patterns {
            for captures in pattern.regex.captures_iter(text) {
                let Some(matched) = captures.get(1) else {
                    continue;
                };
                let cleaned = clean_location_text(matched.as_str());
                if cleaned.chars().count() < 3 || !seen.insert(cleaned.to_lowercase()) {
                    continue;
                }

                let confidence = adjust_confidence(&cleaned, pattern.base_confidence);
                locations.push(ExtractedLocation {
                    raw_text: cleaned,
                    kind: pattern.kind,
                    confidence,
                });
            }
        }

        // Stable, so equal scores keep pattern order
        locations.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
        debug!(count = locations.len(), "Extracted locations");
        locations
    }

    /// Like [`extract`](Self::extract), with up to `window` characters of
    /// transcript on either side of each mention
    pub fn extract_with_context(&self, text: &str, window: usize) -> Vec<LocationMention> {
        let haystack: Vec<char> = text.chars().collect();

        self.extract(text)
            .into_iter()
            .map(|location| {
                let context = context_around(&haystack, &location.raw_text, window);
                LocationMention { location, context }
            })
            .collect()
    }

    /// Extract mentions and resolve each through the cache. One failed
    /// lookup is recorded on its mention and does not stop the others.
    pub async fn geocode<G: Geocoder>(
        &self,
        text: &str,
        bias: &BiasContext,
        geocoder: &CachedGeocoder<G>,
    ) -> Vec<GeocodedLocation> {
        let mut geocoded = Vec::new();
        for location in self.extract(text) {
            match geocoder.resolve(&location.raw_text, bias).await {
                Ok(resolved) => geocoded.push(GeocodedLocation {
                    location,
                    resolved: Some(resolved),
                    error: None,
                }),
                Err(err) => {
                    warn!(query = %location.raw_text, error = %err, "Geocoding mention failed");
                    geocoded.push(GeocodedLocation {
                        location,
                        resolved: None,
                        error: Some(format!("{:#}", err)),
                    });
                }
            }
        }
        geocoded
    }
}

fn clean_location_text(text: &str) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    let trimmed = collapsed.trim_end_matches(['.', ',', ';', ':']);

    trimmed
        .split(' ')
        .filter(|w| !w.is_empty())
        .map(title_case_word)
        .collect::<Vec<_>>()
        .join(" ")
}

fn title_case_word(word: &str) -> String {
    let lower = word.to_lowercase();
    if ABBREVIATIONS.contains(&lower.as_str()) {
        return word.to_uppercase();
    }
    if is_ordinal(&lower) {
        return lower;
    }

    let mut chars = lower.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// "5th", "21st", "102nd"
fn is_ordinal(word: &str) -> bool {
    let digits = word.chars().take_while(char::is_ascii_digit).count();
    digits > 0 && matches!(&word[digits..], "st" | "nd" | "rd" | "th")
}

/// Longer and numbered mentions are more specific
fn adjust_confidence(text: &str, base: f64) -> f64 {
    let mut confidence = base;

    let words = text.split_whitespace().count();
    if words >= 4 {
        confidence += 0.05;
    } else if words <= 2 {
        confidence -= 0.1;
    }
    if text.chars().any(|c| c.is_ascii_digit()) {
        confidence += 0.05;
    }
    if text.chars().count() < 10 {
        confidence -= 0.1;
    }

    confidence.clamp(0.1, 1.0)
}

fn context_around(haystack: &[char], needle: &str, window: usize) -> String {
    let needle: Vec<char> = needle.chars().collect();
    if needle.is_empty() || needle.len() > haystack.len() {
        return String::new();
    }

    let Some(idx) = haystack
        .windows(needle.len())
        .position(|w| w.iter().zip(&needle).all(|(a, b)| a.eq_ignore_ascii_case(b)))
    else {
        return String::new();
    };

    let start = idx.saturating_sub(window);
    let end = (idx + needle.len() + window).min(haystack.len());

    let mut context = String::new();
    if start > 0 {
        context.push_str("...");
    }
    context.extend(&haystack[start..end]);
    if end < haystack.len() {
        context.push_str("...");
    }
    context
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extractor() -> LocationExtractor {
        LocationExtractor::new().unwrap()
    }

    fn texts(locations: &[ExtractedLocation]) -> Vec<&str> {
        locations.iter().map(|l| l.raw_text.as_str()).collect()
    }

    #[test]
    fn test_full_address() {
        let found = extractor().extract("Unit responding to 123 Main Street for a disturbance.");
        assert!(texts(&found).contains(&"123 Main Street"));
        assert!(found.iter().any(|l| l.kind == LocationKind::Address));
    }

    #[test]
    fn test_address_with_direction() {
        let found = extractor().extract("Car accident at 456 North Oak Avenue.");
        assert!(found.iter().any(|l| l.raw_text.contains("North Oak Avenue")));
    }

    #[test]
    fn test_intersection() {
        let found = extractor().extract("Traffic light out at Main Street and 5th Avenue.");
        assert!(found.iter().any(|l| l.kind == LocationKind::Intersection));
    }

    #[test]
    fn test_highways_and_mile_markers() {
        let found = extractor().extract("Vehicle stopped on I-35 northbound.");
        assert!(texts(&found).contains(&"I-35"));

        let found = extractor().extract("Accident on Highway 380 near mile marker 42.");
        let found = texts(&found);
        assert!(found.contains(&"Highway 380"));
        assert!(found.contains(&"Mile Marker 42"));
    }

    #[test]
    fn test_business_and_street() {
        let found = extractor().extract("Shoplifter at the Walmart on Preston Road.");
        assert!(found
            .iter()
            .any(|l| l.kind == LocationKind::Street && l.raw_text == "Preston Road"));
        assert!(found.iter().any(|l| l.kind == LocationKind::Business));
    }

    #[test]
    fn test_landmark() {
        let found = extractor().extract("Meeting at Prosper Town Center parking lot.");
        assert!(found
            .iter()
            .any(|l| l.kind == LocationKind::Landmark && l.raw_text == "Prosper Town Center"));
    }

    #[test]
    fn test_empty_text() {
        assert!(extractor().extract("").is_empty());
        assert!(extractor().extract("copy that, en route").is_empty());
    }

    #[test]
    fn test_no_duplicates() {
        let found = extractor().extract("Go to 123 Main Street. Repeat, 123 Main Street.");
        let mut lowered: Vec<String> = found.iter().map(|l| l.raw_text.to_lowercase()).collect();
        let total = lowered.len();
        lowered.sort();
        lowered.dedup();
        assert_eq!(lowered.len(), total);
    }

    #[test]
    fn test_confidence_range_and_order() {
        let found = extractor().extract(
            "Accident at 123 Main St and Oak Avenue, suspect heading toward the school.",
        );
        assert!(!found.is_empty());
        assert!(found.iter().all(|l| (0.1..=1.0).contains(&l.confidence)));
        assert!(found.windows(2).all(|w| w[0].confidence >= w[1].confidence));

        let address = extractor().extract("Fire at 100 Elm Street.");
        assert_eq!(address[0].raw_text, "100 Elm Street");
        // 0.9 base, numbered
        assert!((address[0].confidence - 0.95).abs() < 1e-9);
    }

    #[test]
    fn test_cleaning() {
        assert_eq!(clean_location_text("  ne  5TH   hwy, "), "NE 5th HWY");
        assert_eq!(clean_location_text("prosper TOWN center."), "Prosper Town Center");
        assert!(is_ordinal("21st"));
        assert!(!is_ordinal("st"));
    }

    #[test]
    fn test_context_window() {
        let mentions = extractor()
            .extract_with_context("Unit responding to 123 Main Street for a disturbance.", 10);
        let address = mentions
            .iter()
            .find(|m| m.location.raw_text == "123 Main Street")
            .unwrap();
        assert_eq!(address.context, "...onding to 123 Main Street for a dis...");

        let whole = extractor().extract_with_context("Fire at 100 Elm Street.", 50);
        assert_eq!(whole[0].context, "Fire at 100 Elm Street.");
    }
}
