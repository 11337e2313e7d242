//! Configuration loading: the YAML rule file that drives the selector and
//! the optional web config file carrying TLS material.
//!
//! All validation happens at load time. A rule with no selector kinds, an
//! invalid regex or an unknown template variable refuses to start the
//! exporter; runtime matching never fails.

use std::fs;
use std::path::{Path, PathBuf};

use ahash::{AHashMap, AHashSet};
use regex::Regex;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::selector::{
    FirstMatcher, MatchNamer, Matcher, NameTemplate, TemplateError, DEFAULT_NAME_TEMPLATE,
};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("error reading config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("bad YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("bad cmdline regex {pattern:?}: {source}")]
    BadRegex {
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error(transparent)]
    Template(#[from] TemplateError),
    #[error("no selectors provided in rule {index}")]
    EmptyRule { index: usize },
}

/// On-disk schema of the rule file.
#[derive(Debug, Deserialize)]
struct RawRules {
    process_names: Vec<RawRule>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawRule {
    name: Option<String>,
    #[serde(default)]
    comm: Vec<String>,
    #[serde(default)]
    exe: Vec<String>,
    #[serde(default)]
    cmdline: Vec<String>,
}

/// Reads and compiles the selector rule file.
pub fn read_rules_file(path: &Path, log_contents: bool) -> Result<FirstMatcher, ConfigError> {
    let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    if log_contents {
        debug!("config file {} contents:\n{}", path.display(), content);
    }
    parse_rules(&content)
}

/// Compiles YAML rule content into the first-match-wins matcher. Rule order
/// is preserved.
pub fn parse_rules(content: &str) -> Result<FirstMatcher, ConfigError> {
    let raw: RawRules = serde_yaml::from_str(content)?;
    let mut rules = Vec::with_capacity(raw.process_names.len());
    for (index, rule) in raw.process_names.iter().enumerate() {
        let mut matchers = Vec::new();

        if !rule.comm.is_empty() {
            let comms: AHashSet<String> = rule.comm.iter().cloned().collect();
            matchers.push(Matcher::Comm(comms));
        }
        if !rule.exe.is_empty() {
            let mut exes = AHashMap::new();
            for exe in &rule.exe {
                if exe.contains('/') {
                    let base = Path::new(exe)
                        .file_name()
                        .and_then(|name| name.to_str())
                        .unwrap_or(exe);
                    exes.insert(base.to_string(), exe.clone());
                } else {
                    exes.insert(exe.clone(), String::new());
                }
            }
            matchers.push(Matcher::Exe(exes));
        }
        if !rule.cmdline.is_empty() {
            let mut regexes = Vec::with_capacity(rule.cmdline.len());
            for pattern in &rule.cmdline {
                let regex = Regex::new(pattern).map_err(|source| ConfigError::BadRegex {
                    pattern: pattern.clone(),
                    source,
                })?;
                regexes.push(regex);
            }
            matchers.push(Matcher::Cmdline(regexes));
        }

        if matchers.is_empty() {
            return Err(ConfigError::EmptyRule { index });
        }

        let template =
            NameTemplate::parse(rule.name.as_deref().unwrap_or(DEFAULT_NAME_TEMPLATE))?;
        rules.push(MatchNamer { matchers, template });
    }
    Ok(FirstMatcher { rules })
}

/// Schema of the `--web.config.file` YAML. Only TLS material is carried;
/// authentication is left to a fronting proxy.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WebConfig {
    #[serde(default)]
    pub tls_server_config: Option<TlsServerConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TlsServerConfig {
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
}

pub fn read_web_config_file(path: &Path) -> Result<WebConfig, ConfigError> {
    let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(serde_yaml::from_str(&content)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rule_without_selectors_is_rejected() {
        let err = parse_rules(
            r#"
process_names:
  - name: "empty"
"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::EmptyRule { index: 0 }));
    }

    #[test]
    fn invalid_regex_is_rejected() {
        let err = parse_rules(
            r#"
process_names:
  - cmdline:
    - "(unclosed"
"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::BadRegex { .. }));
    }

    #[test]
    fn unknown_template_variable_is_rejected() {
        let err = parse_rules(
            r#"
process_names:
  - comm:
    - bash
    name: "{nope}"
"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Template(_)));
    }

    #[test]
    fn unknown_yaml_keys_are_rejected() {
        assert!(parse_rules(
            r#"
process_names:
  - comm:
    - bash
    exes:
    - bash
"#,
        )
        .is_err());
    }

    #[test]
    fn web_config_parses_tls_block() {
        let cfg: WebConfig = serde_yaml::from_str(
            r#"
tls_server_config:
  cert_file: /etc/exporter/tls.crt
  key_file: /etc/exporter/tls.key
"#,
        )
        .expect("web config should parse");
        let tls = cfg.tls_server_config.expect("tls block");
        assert_eq!(tls.cert_file, PathBuf::from("/etc/exporter/tls.crt"));
        assert_eq!(tls.key_file, PathBuf::from("/etc/exporter/tls.key"));

        let empty: WebConfig = serde_yaml::from_str("{}").expect("empty web config");
        assert!(empty.tls_server_config.is_none());
    }
}
