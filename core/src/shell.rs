//! POSIX shell quoting for commands sent to remote hosts

use lazy_regex::regex_is_match;

/// Quote `s` for a POSIX shell when it contains anything outside a safe set
pub(crate) fn escape(s: &str) -> String {
    if !s.is_empty() && !regex_is_match!(r"[^\w@%+=:,./-]", s) {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', "'\"'\"'"))
    }
}
