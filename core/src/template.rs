//! Environment placeholder rendering for image label values
//!
//! Label values may reference environment variables as `${KEY}` or `$KEY`.
//! Placeholders with no matching key are passed through verbatim.

use std::collections::BTreeMap;

use lazy_regex::regex_replace_all;

/// Substitute placeholders in `template` from `env`.
pub fn render_env(template: &str, env: &BTreeMap<String, String>) -> String {
    if !template.contains('$') {
        return template.to_string();
    }
    regex_replace_all!(
        r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}|\$([A-Za-z_][A-Za-z0-9_]*)",
        template,
        |whole: &str, braced: &str, bare: &str| {
            let key = if braced.is_empty() { bare } else { braced };
            env.get(key).cloned().unwrap_or_else(|| whole.to_string())
        }
    )
    .into_owned()
}
