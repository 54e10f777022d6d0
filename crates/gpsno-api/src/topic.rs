//! Topic address space.
//!
//! Maps bus addresses to entity identifiers and back. A template is a
//! format string with a `{base}` placeholder and exactly one single-level
//! wildcard segment (`+`), e.g. `{base}/v1/stations/+`. Compiled matchers
//! are cached per template.

use std::sync::Arc;

use dashmap::DashMap;
use regex::Regex;

use crate::error::Error;

// ── Templates ────────────────────────────────────────────────────────

/// Placeholder substituted with the configured base topic.
pub const BASE_PLACEHOLDER: &str = "{base}";

pub const STATIONS: &str = "{base}/v1/stations/+";
pub const CLUSTERS: &str = "{base}/v1/clusters/+";
pub const MEASUREMENTS: &str = "{base}/v1/measurements/+";

const SEPARATOR: char = '/';
const SINGLE_LEVEL: &str = "+";
const MULTI_LEVEL: &str = "#";

// ── TopicMatcher ─────────────────────────────────────────────────────

/// A compiled template: the concrete subscription filter plus an anchored
/// regex whose single capture group is the wildcard segment.
#[derive(Debug)]
pub struct TopicMatcher {
    template: String,
    filter: String,
    regex: Regex,
}

impl TopicMatcher {
    fn compile(template: &str, base: &str) -> Result<Self, Error> {
        let filter = template.replace(BASE_PLACEHOLDER, base);
        let malformed = |reason: &str| Error::MalformedTemplate {
            template: template.to_owned(),
            reason: reason.to_owned(),
        };

        let mut wildcards = 0usize;
        let mut parts = Vec::new();
        for segment in filter.split(SEPARATOR) {
            if segment == SINGLE_LEVEL {
                wildcards += 1;
                parts.push("([^/]+)".to_owned());
            } else if segment.contains(MULTI_LEVEL) {
                return Err(malformed("multi-level wildcard '#' is not allowed"));
            } else if segment.contains(SINGLE_LEVEL) {
                return Err(malformed("'+' must occupy a whole segment"));
            } else {
                parts.push(regex::escape(segment));
            }
        }

        if wildcards != 1 {
            return Err(malformed(&format!(
                "expected exactly one '+' wildcard, found {wildcards}"
            )));
        }

        let regex = Regex::new(&format!("^{}$", parts.join("/")))
            .map_err(|e| malformed(&e.to_string()))?;

        Ok(Self {
            template: template.to_owned(),
            filter,
            regex,
        })
    }

    /// The unexpanded template this matcher was built from.
    pub fn template(&self) -> &str {
        &self.template
    }

    /// The concrete subscription filter (base substituted, wildcard kept).
    pub fn filter(&self) -> &str {
        &self.filter
    }

    /// Extract the wildcard segment from a concrete topic.
    pub fn extract(&self, topic: &str) -> Result<String, Error> {
        self.regex
            .captures(topic)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().to_owned())
            .ok_or_else(|| Error::NoMatch {
                topic: topic.to_owned(),
                template: self.template.clone(),
            })
    }

    /// Render a concrete topic by substituting `id` for the wildcard.
    pub fn render(&self, id: &str) -> Result<String, Error> {
        validate_segment(id)?;
        let rendered = self
            .filter
            .split(SEPARATOR)
            .map(|segment| if segment == SINGLE_LEVEL { id } else { segment })
            .collect::<Vec<_>>()
            .join("/");
        Ok(rendered)
    }

    pub fn matches(&self, topic: &str) -> bool {
        self.regex.is_match(topic)
    }
}

fn validate_segment(id: &str) -> Result<(), Error> {
    let reason = if id.is_empty() {
        "segment is empty"
    } else if id.contains(SEPARATOR) {
        "segment contains the '/' separator"
    } else if id.contains(SINGLE_LEVEL) || id.contains(MULTI_LEVEL) {
        "segment contains a wildcard character"
    } else {
        return Ok(());
    };
    Err(Error::InvalidSegment {
        segment: id.to_owned(),
        reason,
    })
}

// ── TopicSpace ───────────────────────────────────────────────────────

/// Address space rooted at a base topic.
///
/// Trailing separators on the base are trimmed once here, so rendering is
/// idempotent no matter how the base was configured.
#[derive(Debug)]
pub struct TopicSpace {
    base: String,
    cache: DashMap<String, Arc<TopicMatcher>>,
}

impl TopicSpace {
    pub fn new(base: impl Into<String>) -> Self {
        let base: String = base.into();
        Self {
            base: base.trim_end_matches(SEPARATOR).to_owned(),
            cache: DashMap::new(),
        }
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    /// Compile (or fetch from cache) the matcher for `template`.
    pub fn compile(&self, template: &str) -> Result<Arc<TopicMatcher>, Error> {
        if let Some(matcher) = self.cache.get(template) {
            return Ok(Arc::clone(matcher.value()));
        }
        let matcher = Arc::new(TopicMatcher::compile(template, &self.base)?);
        self.cache.insert(template.to_owned(), Arc::clone(&matcher));
        Ok(matcher)
    }

    pub fn extract_id(&self, topic: &str, template: &str) -> Result<String, Error> {
        self.compile(template)?.extract(topic)
    }

    pub fn render(&self, template: &str, id: &str) -> Result<String, Error> {
        self.compile(template)?.render(id)
    }

    // ── Entity shortcuts ─────────────────────────────────────────────

    pub fn station_topic(&self, id: &str) -> Result<String, Error> {
        self.render(STATIONS, id)
    }

    pub fn cluster_topic(&self, id: &str) -> Result<String, Error> {
        self.render(CLUSTERS, id)
    }

    pub fn stations_filter(&self) -> Result<String, Error> {
        Ok(self.compile(STATIONS)?.filter().to_owned())
    }

    pub fn clusters_filter(&self) -> Result<String, Error> {
        Ok(self.compile(CLUSTERS)?.filter().to_owned())
    }

    pub fn measurements_filter(&self) -> Result<String, Error> {
        Ok(self.compile(MEASUREMENTS)?.filter().to_owned())
    }
}

// ── Subscription filters ─────────────────────────────────────────────

/// Translate an MQTT subscription filter into an anchored regex.
///
/// `+` matches exactly one segment. `#` must be the final segment and
/// matches the parent level and everything below it.
pub(crate) fn filter_regex(filter: &str) -> Result<Regex, Error> {
    let malformed = |reason: &str| Error::MalformedTemplate {
        template: filter.to_owned(),
        reason: reason.to_owned(),
    };

    let segments: Vec<&str> = filter.split(SEPARATOR).collect();
    let last = segments.len().saturating_sub(1);
    let mut pattern = String::from("^");

    for (idx, segment) in segments.iter().enumerate() {
        match *segment {
            MULTI_LEVEL if idx != last => {
                return Err(malformed("'#' must be the last segment"));
            }
            MULTI_LEVEL if idx == 0 => pattern.push_str(".*"),
            MULTI_LEVEL => pattern.push_str("(?:/.*)?"),
            _ => {
                let partial_wildcard =
                    segment.contains(SINGLE_LEVEL) && *segment != SINGLE_LEVEL;
                if segment.contains(MULTI_LEVEL) || partial_wildcard {
                    return Err(malformed("wildcards must occupy a whole segment"));
                }
                if idx > 0 {
                    pattern.push('/');
                }
                if *segment == SINGLE_LEVEL {
                    pattern.push_str("[^/]+");
                } else {
                    pattern.push_str(&regex::escape(segment));
                }
            }
        }
    }
    pattern.push('$');

    Regex::new(&pattern).map_err(|e| malformed(&e.to_string()))
}

// ── Tests ────────────────────────────────────────────────────────────
