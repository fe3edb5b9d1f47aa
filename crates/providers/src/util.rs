use quill_domain::Error;

/// Map a reqwest error into the shared error type.
pub(crate) fn from_reqwest(e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::Provider { provider: "http".into(), message: format!("timeout: {e}") }
    } else {
        Error::Provider { provider: "http".into(), message: e.to_string() }
    }
}

/// Resolve an API key from the configured environment variable.
pub(crate) fn resolve_api_key(env_var: &str) -> quill_domain::Result<String> {
    std::env::var(env_var)
        .map_err(|_| Error::Config(format!("API key environment variable {env_var} is not set")))
}
