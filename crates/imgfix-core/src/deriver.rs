//! Read-time URL derivation from a raw `primary_image` cell.
//!
//! Derivation is total: every input yields at least one URL. When a cell is
//! truncated mid-array the structured parse fails and the deriver falls back
//! to scanning for complete `"fileUrl":"..."` tokens, which survive in order
//! ahead of the cut.

use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;
use tracing::debug;

use crate::descriptor::parse_descriptors;
use crate::rules::UrlRules;

/// How the URLs of a [`DerivedUrls`] were obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DerivationSource {
    Empty,
    DirectUrl,
    Structured,
    RegexFallback,
    Unrecognized,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DerivedUrls {
    pub urls: Vec<String>,
    pub source: DerivationSource,
    pub placeholder: bool,
}

impl DerivedUrls {
    /// First derived URL; the placeholder when nothing was derivable.
    pub fn primary(&self) -> &str {
        // `urls` is never empty: `finish` substitutes the placeholder.
        self.urls.first().map(String::as_str).unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default)]
pub struct UrlDeriver {
    rules: UrlRules,
}

impl UrlDeriver {
    pub fn new(rules: UrlRules) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &UrlRules {
        &self.rules
    }

    pub fn derive(&self, cell: Option<&str>) -> DerivedUrls {
        let cell = match cell {
            Some(c) if !c.is_empty() => c,
            _ => return self.finish(Vec::new(), DerivationSource::Empty),
        };

        if cell.starts_with("http") {
            return DerivedUrls {
                urls: vec![cell.to_string()],
                source: DerivationSource::DirectUrl,
                placeholder: false,
            };
        }

        if !cell.starts_with('[') {
            debug!(len = cell.len(), "primary_image is neither url nor array");
            return self.finish(Vec::new(), DerivationSource::Unrecognized);
        }

        match parse_descriptors(cell) {
            Ok(descriptors) => {
                let urls = descriptors
                    .iter()
                    .filter_map(|d| d.preferred_url())
                    .map(|u| self.rules.rewrite(u))
                    .collect();
                self.finish(urls, DerivationSource::Structured)
            }
            Err(err) => {
                debug!(%err, "structured parse failed; using fileUrl fallback");
                let urls = file_url_tokens(cell)
                    .map(|u| self.rules.rewrite(u))
                    .collect();
                self.finish(urls, DerivationSource::RegexFallback)
            }
        }
    }

    pub fn get_image_url(&self, cell: Option<&str>) -> String {
        self.derive(cell).primary().to_string()
    }

    pub fn get_all_image_urls(&self, cell: Option<&str>) -> Vec<String> {
        self.derive(cell).urls
    }

    fn finish(&self, urls: Vec<String>, source: DerivationSource) -> DerivedUrls {
        if urls.is_empty() {
            DerivedUrls {
                urls: vec![self.rules.placeholder_url.clone()],
                source,
                placeholder: true,
            }
        } else {
            DerivedUrls {
                urls,
                source,
                placeholder: false,
            }
        }
    }
}

/// Primary URL using the built-in rewrite table.
pub fn get_image_url(cell: Option<&str>) -> String {
    UrlDeriver::default().get_image_url(cell)
}

/// All URLs using the built-in rewrite table.
pub fn get_all_image_urls(cell: Option<&str>) -> Vec<String> {
    UrlDeriver::default().get_all_image_urls(cell)
}

/// Complete `"fileUrl":"..."` values in textual order. `originalUrl` is
/// deliberately not matched: it follows `fileUrl` in each descriptor and is the
/// token a width cut usually lands in.
pub(crate) fn file_url_tokens(cell: &str) -> impl Iterator<Item = &str> {
    static FILE_URL: OnceLock<Regex> = OnceLock::new();
    FILE_URL
        .get_or_init(|| Regex::new(r#""fileUrl"\s*:\s*"([^"]+)""#).expect("fileUrl pattern is valid"))
        .captures_iter(cell)
        .filter_map(|caps| caps.get(1).map(|m| m.as_str()))
}
