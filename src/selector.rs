//! The rule engine deciding which processes to track and under which group
//! name.
//!
//! A configuration compiles into an ordered list of rule groups. Within a
//! rule group every declared matcher kind must match (AND); across rule
//! groups the first match wins, so each process belongs to at most one
//! group. All regexes and name templates are compiled at configuration load
//! time; runtime matching never fails.

use std::path::Path;

use ahash::{AHashMap, AHashSet};
use chrono::{DateTime, Utc};
use regex::Regex;
use thiserror::Error;

/// Attributes a process is matched and named on. Resolvers may enrich the
/// record (e.g. fill `username`) before matching. `effective_uid` is
/// absent when the owner could not be determined.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProcAttributes {
    pub pid: u32,
    pub comm: String,
    pub cmdline: Vec<String>,
    pub username: Option<String>,
    pub effective_uid: Option<u32>,
    pub start_time: Option<DateTime<Utc>>,
}

/// A name template rejected at configuration load time.
#[derive(Debug, Error)]
#[error("bad name template {template:?}: {reason}")]
pub struct TemplateError {
    pub template: String,
    pub reason: String,
}

/// A `--namemapping` value rejected at configuration load time.
#[derive(Debug, Error)]
pub enum NameMappingError {
    #[error("bad namemapping: {0}")]
    Malformed(String),
    #[error("bad namemapping regex {pattern:?}: {source}")]
    BadRegex {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

/// One matcher kind inside a rule group. The set of kinds is closed and
/// known at configuration load time.
#[derive(Debug)]
pub enum Matcher {
    /// Exact, case-sensitive match against comm (OR over the set).
    Comm(AHashSet<String>),
    /// Match against argv[0]: keyed by basename, with an optional required
    /// full path (empty string = any path).
    Exe(AHashMap<String, String>),
    /// Regexes applied to argv joined by single spaces; all must match.
    Cmdline(Vec<Regex>),
}

impl Matcher {
    /// Named captures from cmdline regexes are written into `captures` in
    /// pattern order; a name captured twice keeps the last value.
    fn matches(&self, attrs: &ProcAttributes, captures: &mut AHashMap<String, String>) -> bool {
        match self {
            Matcher::Comm(comms) => comms.contains(&attrs.comm),
            Matcher::Exe(exes) => {
                let Some(argv0) = attrs.cmdline.first() else {
                    return false;
                };
                match exes.get(basename(argv0)) {
                    Some(required) => required.is_empty() || required == argv0,
                    None => false,
                }
            }
            Matcher::Cmdline(regexes) => {
                let joined = attrs.cmdline.join(" ");
                for regex in regexes {
                    let Some(caps) = regex.captures(&joined) else {
                        return false;
                    };
                    for name in regex.capture_names().flatten() {
                        let value = caps.name(name).map(|m| m.as_str()).unwrap_or("");
                        captures.insert(name.to_string(), value.to_string());
                    }
                }
                true
            }
        }
    }
}

/// A compiled rule group: matchers ANDed together plus the name template.
#[derive(Debug)]
pub struct MatchNamer {
    pub(crate) matchers: Vec<Matcher>,
    pub(crate) template: NameTemplate,
}

impl MatchNamer {
    pub fn match_and_name(&self, attrs: &ProcAttributes) -> Option<String> {
        let mut captures = AHashMap::new();
        for matcher in &self.matchers {
            if !matcher.matches(attrs, &mut captures) {
                return None;
            }
        }
        Some(self.template.render(attrs, &captures))
    }
}

/// Ordered rule groups; the first match decides.
#[derive(Debug, Default)]
pub struct FirstMatcher {
    pub(crate) rules: Vec<MatchNamer>,
}

impl FirstMatcher {
    pub fn match_and_name(&self, attrs: &ProcAttributes) -> Option<String> {
        self.rules.iter().find_map(|rule| rule.match_and_name(attrs))
    }
}

/// Default template when a rule declares no name.
pub const DEFAULT_NAME_TEMPLATE: &str = "{exe_base}";

#[derive(Debug)]
enum Segment {
    Literal(String),
    Comm,
    ExeBase,
    ExeFull,
    Username,
    Pid,
    StartTime,
    Match(String),
}

/// A group-name template, parsed once at configuration load.
///
/// Variables: `{comm}`, `{exe_base}`, `{exe_full}`, `{username}`, `{pid}`,
/// `{start_time}` and `{matches.<capture>}`.
#[derive(Debug)]
pub struct NameTemplate {
    segments: Vec<Segment>,
}

impl NameTemplate {
    pub fn parse(template: &str) -> Result<NameTemplate, TemplateError> {
        let bad = |reason: &str| TemplateError {
            template: template.to_string(),
            reason: reason.to_string(),
        };
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut chars = template.chars();
        while let Some(c) = chars.next() {
            if c != '{' {
                literal.push(c);
                continue;
            }
            if !literal.is_empty() {
                segments.push(Segment::Literal(std::mem::take(&mut literal)));
            }
            let mut var = String::new();
            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(c) => var.push(c),
                    None => return Err(bad("unterminated variable")),
                }
            }
            let segment = match var.as_str() {
                "comm" => Segment::Comm,
                "exe_base" => Segment::ExeBase,
                "exe_full" => Segment::ExeFull,
                "username" => Segment::Username,
                "pid" => Segment::Pid,
                "start_time" => Segment::StartTime,
                other => match other.strip_prefix("matches.") {
                    Some(name) if !name.is_empty() => Segment::Match(name.to_string()),
                    _ => return Err(bad(&format!("unknown variable {{{other}}}"))),
                },
            };
            segments.push(segment);
        }
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }
        Ok(NameTemplate { segments })
    }

    fn render(&self, attrs: &ProcAttributes, captures: &AHashMap<String, String>) -> String {
        let exe_full = attrs.cmdline.first().map(String::as_str).unwrap_or(&attrs.comm);
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Comm => out.push_str(&attrs.comm),
                Segment::ExeBase => out.push_str(basename(exe_full)),
                Segment::ExeFull => out.push_str(exe_full),
                Segment::Username => out.push_str(attrs.username.as_deref().unwrap_or("")),
                Segment::Pid => out.push_str(&attrs.pid.to_string()),
                Segment::StartTime => {
                    if let Some(start) = attrs.start_time {
                        out.push_str(&start.to_rfc3339());
                    }
                }
                Segment::Match(name) => {
                    if let Some(value) = captures.get(name) {
                        out.push_str(value);
                    }
                }
            }
        }
        out
    }
}

fn basename(path: &str) -> &str {
    Path::new(path)
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or(path)
}

/// Back-compat selector for `--procnames`/`--namemapping`: a flat list of
/// comm names, optionally paired with a capturing regex over the joined
/// cmdline. With a matching capture the group name becomes
/// `<name>:<first non-empty capture>`; without a regex it is the name
/// itself.
#[derive(Debug, Default)]
pub struct NameMapper {
    mapping: AHashMap<String, Option<PrefixRegex>>,
}

#[derive(Debug)]
struct PrefixRegex {
    prefix: String,
    regex: Regex,
}

impl NameMapper {
    /// Parses the alternating `name,regex,...` list. An odd token count or
    /// an empty token is a configuration error.
    pub fn parse(namemapping: &str) -> Result<NameMapper, NameMappingError> {
        let mut mapper = NameMapper::default();
        if namemapping.is_empty() {
            return Ok(mapper);
        }
        let tokens: Vec<&str> = namemapping.split(',').collect();
        if tokens.len() % 2 == 1 {
            return Err(NameMappingError::Malformed(
                "odd number of tokens".to_string(),
            ));
        }
        for (i, token) in tokens.iter().enumerate() {
            if token.is_empty() {
                return Err(NameMappingError::Malformed(format!("token {i} is empty")));
            }
            if i % 2 == 1 {
                let name = tokens[i - 1];
                let regex = Regex::new(token).map_err(|source| NameMappingError::BadRegex {
                    pattern: token.to_string(),
                    source,
                })?;
                mapper.mapping.insert(
                    name.to_string(),
                    Some(PrefixRegex {
                        prefix: format!("{name}:"),
                        regex,
                    }),
                );
            }
        }
        Ok(mapper)
    }

    /// Registers a plain `--procnames` entry unless a mapping for the name
    /// already exists.
    pub fn ensure_name(&mut self, name: &str) {
        self.mapping.entry(name.to_string()).or_insert(None);
    }

    pub fn match_and_name(&self, attrs: &ProcAttributes) -> Option<String> {
        match self.mapping.get(&attrs.comm)? {
            None => Some(attrs.comm.clone()),
            Some(prefix_regex) => {
                let joined = attrs.cmdline.join(" ");
                let caps = prefix_regex.regex.captures(&joined)?;
                caps.iter()
                    .skip(1)
                    .flatten()
                    .map(|m| m.as_str())
                    .find(|s| !s.is_empty())
                    .map(|capture| format!("{}{}", prefix_regex.prefix, capture))
            }
        }
    }
}

/// Either selection mode, fixed at startup.
#[derive(Debug)]
pub enum RuleSet {
    Config(FirstMatcher),
    NameList(NameMapper),
}

impl RuleSet {
    fn match_and_name(&self, attrs: &ProcAttributes) -> Option<String> {
        match self {
            RuleSet::Config(matcher) => matcher.match_and_name(attrs),
            RuleSet::NameList(mapper) => mapper.match_and_name(attrs),
        }
    }
}

/// Attribute enrichers running before matching, in registration order.
#[derive(Debug)]
pub enum Resolver {
    Username(UsernameResolver),
}

impl Resolver {
    fn resolve(&mut self, attrs: &mut ProcAttributes) {
        match self {
            Resolver::Username(resolver) => resolver.resolve(attrs),
        }
    }
}

/// Fills `username` from the effective uid, caching passwd lookups.
#[derive(Debug, Default)]
pub struct UsernameResolver {
    cache: AHashMap<u32, Option<String>>,
}

impl UsernameResolver {
    fn resolve(&mut self, attrs: &mut ProcAttributes) {
        if attrs.username.is_some() {
            return;
        }
        let Some(uid) = attrs.effective_uid else {
            return;
        };
        let name = self.cache.entry(uid).or_insert_with(|| {
            nix::unistd::User::from_uid(nix::unistd::Uid::from_raw(uid))
                .ok()
                .flatten()
                .map(|user| user.name)
        });
        attrs.username = name.clone();
    }
}

/// The full selector: a rule set plus its resolver chain. Verdicts are a
/// pure function of the (enriched) attributes.
#[derive(Debug)]
pub struct Selector {
    rules: RuleSet,
    resolvers: Vec<Resolver>,
}

impl Selector {
    pub fn new(rules: RuleSet) -> Selector {
        Selector {
            rules,
            resolvers: Vec::new(),
        }
    }

    pub fn register_resolver(&mut self, resolver: Resolver) {
        self.resolvers.push(resolver);
    }

    /// Returns the group name for a tracked process, or `None` for one that
    /// should be ignored.
    pub fn match_and_name(&mut self, attrs: &mut ProcAttributes) -> Option<String> {
        for resolver in &mut self.resolvers {
            resolver.resolve(attrs);
        }
        self.rules.match_and_name(attrs)
    }
}
