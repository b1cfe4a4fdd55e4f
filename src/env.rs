//! `PDF_METER_*` settings layered from a `.env` file over the process
//! environment.

use std::collections::BTreeMap;
use std::str::FromStr;

use crate::error::ConfigError;

pub const ENV_PREFIX: &str = "PDF_METER_";

/// Values accepted for a tier limit meaning "no limit".
const UNLIMITED: &[&str] = &["none", "unlimited", "off"];

/// Meter settings from the environment, addressed by their name without the
/// `PDF_METER_` prefix. Entries from a `.env` file shadow the process
/// environment; blank values count as unset.
#[derive(Clone, Default)]
pub struct Env {
    file: BTreeMap<String, String>,
}

impl std::fmt::Debug for Env {
    // Values may hold the system key.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Env")
            .field("file_settings", &self.file.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Env {
    pub fn from_process() -> Self {
        Self::default()
    }

    /// Reads the `PDF_METER_*` lines of a `.env` file and ignores the rest.
    pub fn from_dotenv(contents: &str) -> Self {
        let file = contents
            .lines()
            .filter_map(dotenv_setting)
            .map(|(name, value)| (name.to_string(), value))
            .collect();
        Self { file }
    }

    /// Sets a value that shadows the process environment. `name` may carry
    /// the prefix or not.
    pub fn with_var(mut self, name: &str, value: impl Into<String>) -> Self {
        let name = name.strip_prefix(ENV_PREFIX).unwrap_or(name);
        self.file.insert(name.to_string(), value.into());
        self
    }

    /// Full variable name for a setting, for error messages.
    pub fn var_name(setting: &str) -> String {
        format!("{ENV_PREFIX}{setting}")
    }

    pub fn get(&self, setting: &str) -> Option<String> {
        if let Some(value) = self.file.get(setting) {
            return Some(value.clone());
        }
        std::env::var(Self::var_name(setting))
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }

    /// Parsed value of `setting`, `None` when unset.
    pub fn parse<T>(&self, setting: &str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        self.get(setting)
            .map(|raw| parse_setting(setting, &raw))
            .transpose()
    }

    /// Like [`parse`](Self::parse) for limits, where `none`, `unlimited` or
    /// `off` lift the limit: `Some(None)`.
    pub fn limit<T>(&self, setting: &str) -> Result<Option<Option<T>>, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        let Some(raw) = self.get(setting) else {
            return Ok(None);
        };
        if UNLIMITED.contains(&raw.to_ascii_lowercase().as_str()) {
            return Ok(Some(None));
        }
        parse_setting(setting, &raw).map(|value| Some(Some(value)))
    }
}

fn parse_setting<T>(setting: &str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim().parse::<T>().map_err(|err| ConfigError::Invalid {
        field: Env::var_name(setting),
        reason: err.to_string(),
    })
}

/// `[export ]PDF_METER_NAME=value`, with optional matching quotes around the
/// value or a trailing ` # comment` after an unquoted one.
fn dotenv_setting(line: &str) -> Option<(&str, String)> {
    let line = line.trim();
    let line = line.strip_prefix("export ").map_or(line, str::trim_start);
    let (name, value) = line.split_once('=')?;
    let setting = name.trim().strip_prefix(ENV_PREFIX)?;
    if setting.is_empty() {
        return None;
    }

    let value = value.trim();
    let value = match value.chars().next() {
        Some(quote @ ('"' | '\'')) => value[1..].strip_suffix(quote)?,
        _ => value.split(" #").next().unwrap_or(value).trim_end(),
    };
    (!value.trim().is_empty()).then(|| (setting, value.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dotenv_keeps_only_meter_settings() {
        let env = Env::from_dotenv(
            "# pricing\n\
             export PDF_METER_UNIT_COST=\"0.004\"\n\
             PDF_METER_FREE_MONTHLY_QUOTA='250'\n\
             PDF_METER_CHARGE_TIMEOUT_MS=750 # ms\n\
             PDF_METER_SYSTEM_KEY=\n\
             DATABASE_URL=postgres://elsewhere\n\
             broken line\n",
        );
        assert_eq!(env.get("UNIT_COST").as_deref(), Some("0.004"));
        assert_eq!(env.get("FREE_MONTHLY_QUOTA").as_deref(), Some("250"));
        assert_eq!(env.parse::<u64>("CHARGE_TIMEOUT_MS").unwrap(), Some(750));
        assert_eq!(env.file.len(), 3);
    }

    #[test]
    fn unterminated_quote_is_skipped() {
        let env = Env::from_dotenv("PDF_METER_UNIT_COST=\"0.004\n");
        assert!(env.file.is_empty());
    }

    #[test]
    fn limits_accept_unlimited_keywords() {
        let env = Env::default()
            .with_var("PRO_REQUESTS_PER_HOUR", "Unlimited")
            .with_var("PDF_METER_FREE_REQUESTS_PER_HOUR", "60")
            .with_var("BASIC_REQUESTS_PER_HOUR", "lots");
        assert_eq!(env.limit::<u32>("PRO_REQUESTS_PER_HOUR").unwrap(), Some(None));
        assert_eq!(
            env.limit::<u32>("FREE_REQUESTS_PER_HOUR").unwrap(),
            Some(Some(60))
        );
        match env.limit::<u32>("BASIC_REQUESTS_PER_HOUR") {
            Err(ConfigError::Invalid { field, .. }) => {
                assert_eq!(field, "PDF_METER_BASIC_REQUESTS_PER_HOUR")
            }
            other => panic!("unexpected: {other:?}"),
        }
    }
}
