//! URL rewrite table and placeholder sentinel.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub const DEFAULT_PLACEHOLDER_URL: &str = "/static/images/property-placeholder.svg";

/// Prefix rewrite. Matches are anchored at the start of the path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewriteRule {
    pub from: String,
    pub to: String,
}

impl RewriteRule {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UrlRules {
    #[serde(default = "default_placeholder")]
    pub placeholder_url: String,
    #[serde(default = "default_rewrites")]
    pub rewrites: Vec<RewriteRule>,
}

impl Default for UrlRules {
    fn default() -> Self {
        Self {
            placeholder_url: default_placeholder(),
            rewrites: default_rewrites(),
        }
    }
}

impl UrlRules {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("parsing url rules yaml")
    }

    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    /// Load the rules file when it exists, otherwise fall back to the built-in table.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::from_yaml_file(path)
        } else {
            tracing::debug!(path = %path.display(), "url rules file absent; using built-in table");
            Ok(Self::default())
        }
    }

    /// Apply the first matching prefix rule. Absolute URLs and unmatched paths
    /// pass through verbatim.
    pub fn rewrite(&self, url: &str) -> String {
        if url.starts_with("http") {
            return url.to_string();
        }
        self.rewrites
            .iter()
            .find_map(|rule| {
                url.strip_prefix(rule.from.as_str())
                    .map(|rest| format!("{}{}", rule.to, rest))
            })
            .unwrap_or_else(|| url.to_string())
    }
}

fn default_placeholder() -> String {
    DEFAULT_PLACEHOLDER_URL.to_string()
}

fn default_rewrites() -> Vec<RewriteRule> {
    vec![
        RewriteRule::new("/property-images/", "/public/properties/images/"),
        RewriteRule::new("/properties/", "/public/properties/"),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn builtin_table_rewrites_by_first_matching_prefix() {
        let rules = UrlRules::default();
        assert_eq!(
            rules.rewrite("/property-images/a.jpg"),
            "/public/properties/images/a.jpg"
        );
        assert_eq!(rules.rewrite("/properties/b.jpg"), "/public/properties/b.jpg");
        assert_eq!(
            rules.rewrite("https://cdn.example/x.jpg"),
            "https://cdn.example/x.jpg"
        );
        assert_eq!(rules.rewrite("/media/c.jpg"), "/media/c.jpg");
    }

    #[test]
    fn rewrite_is_anchored_at_start() {
        let rules = UrlRules::default();
        assert_eq!(
            rules.rewrite("/cache/properties/x.jpg"),
            "/cache/properties/x.jpg"
        );
    }

    #[test]
    fn yaml_overrides_table_and_keeps_default_placeholder() {
        let rules = UrlRules::from_yaml_str(
            "rewrites:\n  - from: /uploads/\n    to: /cdn/uploads/\n",
        )
        .expect("yaml");
        assert_eq!(rules.placeholder_url, DEFAULT_PLACEHOLDER_URL);
        assert_eq!(rules.rewrite("/uploads/a.jpg"), "/cdn/uploads/a.jpg");
        assert_eq!(rules.rewrite("/properties/a.jpg"), "/properties/a.jpg");
    }

    #[test]
    fn missing_file_falls_back_to_builtin() {
        let dir = tempdir().expect("tempdir");
        let rules = UrlRules::load_or_default(&dir.path().join("absent.yaml")).expect("rules");
        assert_eq!(rules, UrlRules::default());

        let path = dir.path().join("image_urls.yaml");
        std::fs::write(&path, "placeholder_url: /img/none.svg\n").expect("write");
        let rules = UrlRules::load_or_default(&path).expect("rules");
        assert_eq!(rules.placeholder_url, "/img/none.svg");
        assert_eq!(rules.rewrites, UrlRules::default().rewrites);
    }

    #[test]
    fn shipped_rules_file_matches_builtin_table() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../rules/image_urls.yaml");
        assert_eq!(UrlRules::from_yaml_file(&path).expect("rules"), UrlRules::default());
    }
}
