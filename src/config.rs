use crate::api::GenerationOptions;
use anyhow::{Context, Result};
use std::path::PathBuf;

pub const DEFAULT_API_BASE_URL: &str = "http://localhost:8000";
pub const DEFAULT_DATA_DIR: &str = ".streamchat";
pub const DEFAULT_SYSTEM_PROMPT: &str =
    "You are a helpful assistant. Reply in GitHub-flavored markdown when useful.";

// Checked in order; the first one set wins
const API_BASE_URL_VARS: [&str; 3] = ["CHAT_API_BASE_URL", "API_BASE_URL", "API_BASE"];

/// Runtime settings, read from the environment.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub api_base_url: String,
    pub data_dir: PathBuf,
    /// Seeded as the system message of every new conversation.
    pub system_prompt: String,
    pub generation: GenerationOptions,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            generation: GenerationOptions::default(),
        }
    }
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds settings from an arbitrary variable lookup. Empty values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();

        let api_base_url = API_BASE_URL_VARS
            .iter()
            .find_map(|&name| {
                var(name).inspect(|_| log::debug!("Using API base URL from {}", name))
            })
            .unwrap_or(defaults.api_base_url)
            .trim_end_matches('/')
            .to_string();

        let data_dir = var("CHAT_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.data_dir);

        let system_prompt = var("CHAT_SYSTEM_PROMPT").unwrap_or(defaults.system_prompt);

        let generation = GenerationOptions {
            temperature: parse_float(var("CHAT_TEMPERATURE"), "CHAT_TEMPERATURE")?,
            top_p: parse_float(var("CHAT_TOP_P"), "CHAT_TOP_P")?,
        };

        Ok(Self {
            api_base_url,
            data_dir,
            system_prompt,
            generation,
        })
    }
}

fn parse_float(value: Option<String>, name: &str) -> Result<Option<f64>> {
    value
        .map(|v| {
            v.trim().parse::<f64>().context(format!(
                "Failed to parse environment variable '{}' as a number",
                name
            ))
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn settings(vars: &[(&str, &str)]) -> Result<Settings> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Settings::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn defaults_when_nothing_is_set() {
        assert_eq!(settings(&[]).unwrap(), Settings::default());
    }

    #[test]
    fn base_url_falls_back_through_variables() {
        let s = settings(&[("API_BASE", "http://b:1/"), ("API_BASE_URL", "http://a:1")]).unwrap();
        assert_eq!(s.api_base_url, "http://a:1");

        let s = settings(&[("API_BASE", "http://b:1/")]).unwrap();
        assert_eq!(s.api_base_url, "http://b:1");

        let s = settings(&[("CHAT_API_BASE_URL", "http://c:1"), ("API_BASE", "http://b:1")])
            .unwrap();
        assert_eq!(s.api_base_url, "http://c:1");
    }

    #[test]
    fn empty_values_count_as_unset() {
        let s = settings(&[("CHAT_API_BASE_URL", " "), ("CHAT_SYSTEM_PROMPT", "")]).unwrap();
        assert_eq!(s.api_base_url, DEFAULT_API_BASE_URL);
        assert_eq!(s.system_prompt, DEFAULT_SYSTEM_PROMPT);
    }

    #[test]
    fn generation_options_are_parsed() {
        let s = settings(&[("CHAT_TEMPERATURE", "0.2"), ("CHAT_TOP_P", " 0.9 ")]).unwrap();
        assert_eq!(s.generation.temperature, Some(0.2));
        assert_eq!(s.generation.top_p, Some(0.9));
    }

    #[test]
    fn bad_number_names_the_variable() {
        let err = settings(&[("CHAT_TOP_P", "high")]).unwrap_err();
        assert!(err.to_string().contains("CHAT_TOP_P"));
    }
}
