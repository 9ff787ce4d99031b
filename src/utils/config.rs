use std::collections::HashMap;
use std::path::Path;

use anyhow::Result;
use tracing::{debug, warn};

pub type ConfigSection = HashMap<String, String>;

/// INI-style configuration: `[section]` headers, `key = value` pairs,
/// `#`/`;` comments, optional single or double quotes around values.
#[derive(Debug, Clone, Default)]
pub struct Config {
    sections: HashMap<String, ConfigSection>,
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_value(&mut self, section: &str, key: &str, value: &str) -> Result<()> {
        if section.is_empty() || key.is_empty() {
            return Err(anyhow::anyhow!("section or key cannot be empty"));
        }
        debug!("Setting config: [{}] {} = {}", section, key, value);
        self.sections
            .entry(section.to_string())
            .or_default()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    pub fn get_value(&self, section: &str, key: &str) -> Option<&str> {
        self.sections
            .get(section)
            .and_then(|map| map.get(key))
            .map(|v| v.as_str())
    }

    pub fn get_int(&self, section: &str, key: &str, default: i64) -> i64 {
        match self.get_value(section, key) {
            Some(val) => match val.parse::<i64>() {
                Ok(num) => num,
                Err(_) => {
                    warn!(
                        "Invalid integer value '{}' for {}.{}, using default {}",
                        val, section, key, default
                    );
                    default
                }
            },
            None => default,
        }
    }

    pub fn get_bool(&self, section: &str, key: &str, default: bool) -> bool {
        match self.get_value(section, key) {
            Some(val) => match val.to_lowercase().as_str() {
                "1" | "true" | "yes" | "on" | "enabled" => true,
                "0" | "false" | "no" | "off" | "disabled" => false,
                _ => {
                    warn!(
                        "Invalid boolean value '{}' for {}.{}, using default {}",
                        val, section, key, default
                    );
                    default
                }
            },
            None => default,
        }
    }

    pub fn is_section_exists(&self, section: &str) -> bool {
        self.sections.contains_key(section)
    }
}

pub struct ConfigLoader {
    config: Config,
    path: String,
}

impl ConfigLoader {
    pub fn new(path: String) -> Self {
        Self {
            config: Config::new(),
            path,
        }
    }

    pub async fn load(mut self) -> Result<Self> {
        let filepath = self.path.trim().to_string();
        let config_path = Path::new(&filepath);
        if !config_path.is_file() {
            return Err(anyhow::anyhow!("Config file does not exist: {}", filepath));
        }

        let contents = tokio::fs::read_to_string(config_path).await?;
        self.parse_config(&contents);
        Ok(self)
    }

    fn parse_config(&mut self, contents: &str) {
        let mut current_section = String::new();

        for (line_number, line) in contents.lines().enumerate() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') || trimmed.starts_with(';') {
                continue;
            }

            if trimmed.starts_with('[') && trimmed.ends_with(']') {
                current_section = trimmed[1..trimmed.len() - 1].trim().to_string();
                if current_section.is_empty() {
                    warn!("Empty section name at line {}", line_number + 1);
                }
                continue;
            }

            if let Some(equals_pos) = trimmed.find('=') {
                let key = trimmed[..equals_pos].trim();
                let value = Self::unquote_value(&trimmed[equals_pos + 1..]);

                if key.is_empty() || current_section.is_empty() {
                    warn!("Malformed config entry at line {}: {}", line_number + 1, trimmed);
                    continue;
                }
                let _ = self.config.set_value(&current_section, key, &value);
            } else {
                warn!(
                    "Invalid config line (no '=' found) at line {}: {}",
                    line_number + 1,
                    trimmed
                );
            }
        }
    }

    fn unquote_value(value: &str) -> String {
        let trimmed = value.trim();
        if trimmed.len() >= 2 {
            let bytes = trimmed.as_bytes();
            let (first, last) = (bytes[0], bytes[trimmed.len() - 1]);
            if (first == b'"' && last == b'"') || (first == b'\'' && last == b'\'') {
                return trimmed[1..trimmed.len() - 1].to_string();
            }
        }
        trimmed.to_string()
    }

    pub fn get_config(&self) -> &Config {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(contents: &str) -> Config {
        let mut loader = ConfigLoader::new("unused".into());
        loader.parse_config(contents);
        loader.config
    }

    #[test]
    fn parses_sections_and_values() {
        let cfg = parse("[system]\ndomain = example.com\n# comment\n[smtp]\nport = 2525\n");
        assert_eq!(cfg.get_value("system", "domain"), Some("example.com"));
        assert_eq!(cfg.get_int("smtp", "port", 25), 2525);
        assert!(cfg.is_section_exists("smtp"));
        assert!(!cfg.is_section_exists("pop3"));
    }

    #[test]
    fn unquotes_and_defaults() {
        let cfg = parse("[relay]\nusername = \"postmaster\"\n");
        assert_eq!(cfg.get_value("relay", "username"), Some("postmaster"));
        assert_eq!(cfg.get_int("relay", "timeout_secs", 30), 30);
        assert!(!cfg.get_bool("logging", "json", false));
    }

    #[test]
    fn get_bool_accepts_common_spellings() {
        let mut cfg = Config::new();
        cfg.set_value("logging", "json", "yes").unwrap();
        assert!(cfg.get_bool("logging", "json", false));
        cfg.set_value("logging", "json", "off").unwrap();
        assert!(!cfg.get_bool("logging", "json", true));
    }
}
