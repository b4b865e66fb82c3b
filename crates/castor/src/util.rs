use std::fmt::Write as _;

use chrono::Local;

/// Expands strftime-style date specifiers in a file template, e.g.
/// `backlog-%Y-%m-%d.log`. Invalid specifiers leave the template
/// untouched.
pub(crate) fn filedate(template: &str) -> String {
    let mut out = String::new();
    if write!(out, "{}", Local::now().format(template)).is_err() {
        return template.to_string();
    }
    out
}
