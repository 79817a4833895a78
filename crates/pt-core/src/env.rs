//! Environment scrubbing for processes that host user shells.

/// Case-insensitive name fragments that mark a variable as credential-like.
pub const SENSITIVE_FRAGMENTS: &[&str] = &[
    "TOKEN",
    "SECRET",
    "PASSWORD",
    "PASSWD",
    "API_KEY",
    "APIKEY",
    "ACCESS_KEY",
    "PRIVATE_KEY",
    "CREDENTIAL",
    "AUTH",
];

/// Variables that would make tmux refuse to attach from inside a tmux pane.
pub const NESTING_VARS: &[&str] = &["TMUX", "TMUX_PANE"];

/// Whether `name` matches the deny-list.
pub fn is_sensitive(name: &str) -> bool {
    let upper = name.to_ascii_uppercase();
    SENSITIVE_FRAGMENTS
        .iter()
        .any(|fragment| upper.contains(fragment))
}

/// Filter an environment, dropping deny-listed and nesting variables.
pub fn sanitize_env<I, K, V>(vars: I) -> Vec<(String, String)>
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<String>,
{
    vars.into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .filter(|(k, _)| !is_sensitive(k) && !NESTING_VARS.contains(&k.as_str()))
        .collect()
}

/// The current process environment, sanitized.
pub fn sanitized_host_env() -> Vec<(String, String)> {
    sanitize_env(std::env::vars_os().filter_map(|(k, v)| {
        Some((k.into_string().ok()?, v.into_string().ok()?))
    }))
}
