//! Environment filtering for spawned tool servers.
//!
//! A child gets the host environment minus the denied names, then the
//! caller's explicit overrides on top. Overrides are applied last, so a
//! credential the caller passes on purpose still reaches the child.

use std::collections::{BTreeSet, HashMap};

/// Credentials and tokens withheld from tool servers unless passed explicitly
pub const DEFAULT_DENIED_VARS: &[&str] = &[
    "AWS_ACCESS_KEY_ID",
    "AWS_SECRET_ACCESS_KEY",
    "AWS_SESSION_TOKEN",
    "AZURE_CLIENT_SECRET",
    "AZURE_OPENAI_API_KEY",
    "GOOGLE_APPLICATION_CREDENTIALS",
    "GOOGLE_API_KEY",
    "GEMINI_API_KEY",
    "ANTHROPIC_API_KEY",
    "OPENAI_API_KEY",
    "GITHUB_TOKEN",
    "GH_TOKEN",
    "GITLAB_TOKEN",
    "HF_TOKEN",
    "NPM_TOKEN",
    "DOCKER_PASSWORD",
    "SLACK_BOT_TOKEN",
    "STRIPE_SECRET_KEY",
];

/// Deny-list policy applied when building a child environment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvPolicy {
    denied: BTreeSet<String>,
}

impl Default for EnvPolicy {
    fn default() -> Self {
        Self {
            denied: DEFAULT_DENIED_VARS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl EnvPolicy {
    /// A policy that passes the whole host environment through
    pub fn permissive() -> Self {
        Self {
            denied: BTreeSet::new(),
        }
    }

    /// Add names to the deny-list
    pub fn with_denied<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.denied.extend(names.into_iter().map(Into::into));
        self
    }

    /// Remove names from the deny-list
    pub fn with_allowed<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for name in names {
            self.denied.remove(&name.into());
        }
        self
    }

    pub fn is_denied(&self, name: &str) -> bool {
        self.denied.contains(name)
    }

    pub fn denied(&self) -> impl Iterator<Item = &str> {
        self.denied.iter().map(String::as_str)
    }

    /// `host - denied + overrides`
    pub fn build_env<I, K, V>(&self, host: I, overrides: &HashMap<String, String>) -> HashMap<String, String>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut env: HashMap<String, String> = host
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .filter(|(k, _)| !self.is_denied(k))
            .collect();
        env.extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));
        env
    }

    /// Filter the current process environment
    pub fn build_from_process(&self, overrides: &HashMap<String, String>) -> HashMap<String, String> {
        self.build_env(std::env::vars_os().filter_map(utf8_pair), overrides)
    }
}

fn utf8_pair((k, v): (std::ffi::OsString, std::ffi::OsString)) -> Option<(String, String)> {
    match (k.into_string(), v.into_string()) {
        (Ok(k), Ok(v)) => Some((k, v)),
        (Ok(k), Err(_)) => {
            log::debug!("skipping non-UTF-8 value of {}", k);
            None
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host() -> Vec<(&'static str, &'static str)> {
        vec![
            ("PATH", "/usr/bin"),
            ("HOME", "/home/dev"),
            ("AWS_SECRET_ACCESS_KEY", "hunter2"),
            ("GITHUB_TOKEN", "ghp_x"),
        ]
    }

    #[test]
    fn test_denied_vars_are_removed() {
        let env = EnvPolicy::default().build_env(host(), &HashMap::new());
        assert_eq!(env.get("PATH").map(String::as_str), Some("/usr/bin"));
        assert!(!env.contains_key("AWS_SECRET_ACCESS_KEY"));
        assert!(!env.contains_key("GITHUB_TOKEN"));
    }

    #[test]
    fn test_override_reinstates_denied_var() {
        let overrides = HashMap::from([("GITHUB_TOKEN".to_string(), "explicit".to_string())]);
        let env = EnvPolicy::default().build_env(host(), &overrides);
        assert_eq!(env.get("GITHUB_TOKEN").map(String::as_str), Some("explicit"));
        assert!(!env.contains_key("AWS_SECRET_ACCESS_KEY"));
    }

    #[test]
    fn test_override_replaces_host_value() {
        let overrides = HashMap::from([("PATH".to_string(), "/opt/bin".to_string())]);
        let env = EnvPolicy::default().build_env(host(), &overrides);
        assert_eq!(env.get("PATH").map(String::as_str), Some("/opt/bin"));
    }

    #[test]
    fn test_extend_and_relax_policy() {
        let policy = EnvPolicy::default()
            .with_denied(["HOME"])
            .with_allowed(["GITHUB_TOKEN"]);
        let env = policy.build_env(host(), &HashMap::new());
        assert!(!env.contains_key("HOME"));
        assert_eq!(env.get("GITHUB_TOKEN").map(String::as_str), Some("ghp_x"));
        assert!(policy.is_denied("AWS_ACCESS_KEY_ID"));
    }

    #[test]
    fn test_matching_is_exact() {
        let env = EnvPolicy::default().build_env(vec![("github_token", "lower"), ("GITHUB_TOKEN_X", "y")], &HashMap::new());
        assert!(env.contains_key("github_token"));
        assert!(env.contains_key("GITHUB_TOKEN_X"));
    }

    #[test]
    fn test_permissive_policy_keeps_everything() {
        let env = EnvPolicy::permissive().build_env(host(), &HashMap::new());
        assert_eq!(env.len(), 4);
    }

    #[test]
    fn test_default_list_is_sorted_into_policy() {
        let policy = EnvPolicy::default();
        let denied: Vec<&str> = policy.denied().collect();
        assert_eq!(denied.len(), DEFAULT_DENIED_VARS.len());
        assert!(denied.windows(2).all(|w| w[0] < w[1]));
    }
}
