//! Core model for property image cells: descriptors, URL derivation and
//! truncation classification.

pub mod classify;
pub mod deriver;
pub mod descriptor;
pub mod rules;

pub use classify::{char_len, classify_cell, descriptor_count, CellClass};
pub use deriver::{get_all_image_urls, get_image_url, DerivationSource, DerivedUrls, UrlDeriver};
pub use descriptor::{parse_descriptors, DescriptorError, ImageDescriptor};
pub use rules::{RewriteRule, UrlRules, DEFAULT_PLACEHOLDER_URL};

pub const CRATE_NAME: &str = "imgfix-core";

/// Legacy variable-width column size the target store silently truncated to.
pub const DEFAULT_NARROW_WIDTH: usize = 191;
