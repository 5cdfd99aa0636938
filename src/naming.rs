//! Deterministic virtual-table names for compiled steps

use once_cell::sync::Lazy;
use regex::Regex;

static NON_IDENT: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^a-z0-9_]+").unwrap());

/// Lowercase `name` and collapse every run of characters outside `[a-z0-9_]` into `_`
pub fn slug(name: &str) -> String {
    NON_IDENT
        .replace_all(&name.to_lowercase(), "_")
        .into_owned()
}

/// Virtual table for fragment `fragment` of the step at 1-based position `index`
///
/// The numeric prefix is terminated by the first `_`, so names of steps at
/// different positions never collide.
pub fn fragment_table(index: usize, step: &str, fragment: &str) -> String {
    format!("s{}_{}__{}", index, slug(step), slug(fragment))
}
