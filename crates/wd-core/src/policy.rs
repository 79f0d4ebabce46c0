//! Policy engine: classifies captured operations against a profile.
//!
//! Classification is a pure function of (operation, profile). `always_deny`
//! is always consulted first and wins on overlap; anything not explicitly
//! allowed goes to review. Deny patterns may over-match (they also match by
//! substring), allow patterns never do.

use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use wd_protocol::{display_argv, normalize_path, Operation, OperationKind, Target};

/// Per-operation verdict, ordered from least to most restrictive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Allow,
    Review,
    Deny,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Allow => "allow",
            Decision::Review => "review",
            Decision::Deny => "deny",
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Session-level verdict, ordered from least to most restrictive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Aggregate {
    /// Every operation allowed: runs without human review.
    Fast,
    /// At least one operation needs review, none denied.
    Review,
    /// At least one operation denied: rejected without execution.
    Blocked,
}

impl Aggregate {
    /// Fold per-operation decisions. No operations at all is `Fast`.
    pub fn from_decisions(decisions: impl IntoIterator<Item = Decision>) -> Self {
        match decisions.into_iter().max() {
            None | Some(Decision::Allow) => Aggregate::Fast,
            Some(Decision::Review) => Aggregate::Review,
            Some(Decision::Deny) => Aggregate::Blocked,
        }
    }

    /// The more restrictive of two verdicts.
    pub fn worst(self, other: Aggregate) -> Aggregate {
        self.max(other)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Aggregate::Fast => "fast",
            Aggregate::Review => "review",
            Aggregate::Blocked => "blocked",
        }
    }
}

impl fmt::Display for Aggregate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A decision plus the pattern that produced it, if any.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    pub decision: Decision,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
}

impl Classification {
    fn allow(pattern: &str) -> Self {
        Self {
            decision: Decision::Allow,
            pattern: Some(pattern.to_string()),
        }
    }

    fn deny(pattern: &str) -> Self {
        Self {
            decision: Decision::Deny,
            pattern: Some(pattern.to_string()),
        }
    }

    fn review() -> Self {
        Self {
            decision: Decision::Review,
            pattern: None,
        }
    }

    fn unconditional(decision: Decision) -> Self {
        Self {
            decision,
            pattern: None,
        }
    }
}

/// Named set of auto-approve / always-deny patterns.
///
/// Pattern forms:
/// - `name`: any invocation of the command `name`
/// - `name tok...`: flags must match exactly and in order; tokens starting
///   with `/` match by path prefix
/// - `/abs/path`: write targets at or beneath the path
///
/// `approved` holds exact command lines an operator approved earlier; a
/// match lifts Review to Allow and never overrides a denial.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub name: String,
    #[serde(default)]
    pub auto_approve: Vec<String>,
    #[serde(default)]
    pub always_deny: Vec<String>,
    #[serde(default)]
    pub approved: BTreeSet<String>,
}

/// Deny patterns every built-in profile carries.
const BUILTIN_DENY: &[&str] = &[
    "rm -rf /",
    "rm -rf ~",
    "dd if=/dev/zero",
    "mkfs",
    "wipefs",
    ":(){ :|:& };:",
    "> /dev/sda",
    "chmod -R 777 /",
    "/dev/tcp/",
    "nc -e",
    "history -c",
    "crontab -r",
    "> /etc/passwd",
    "> /etc/shadow",
];

const MINIMAL_ALLOW: &[&str] = &[
    "cat", "head", "tail", "ls", "stat", "file", "wc", "pwd", "uname", "hostname", "whoami",
    "id", "date",
];

const READONLY_ALLOW: &[&str] = &[
    "less", "find", "du", "df", "free", "uptime", "ps", "pgrep", "env", "printenv", "cal",
    "grep",
];

const DIAGNOSTICS_ALLOW: &[&str] = &[
    "top",
    "htop",
    "systemctl status",
    "journalctl",
    "ip",
    "ss",
    "netstat",
];

impl Profile {
    pub fn new(
        name: impl Into<String>,
        auto_approve: impl IntoIterator<Item = impl Into<String>>,
        always_deny: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            name: name.into(),
            auto_approve: auto_approve.into_iter().map(Into::into).collect(),
            always_deny: always_deny.into_iter().map(Into::into).collect(),
            approved: BTreeSet::new(),
        }
    }

    /// Add previously approved command lines.
    pub fn with_approved(mut self, commands: impl IntoIterator<Item = String>) -> Self {
        self.approved.extend(commands);
        self
    }

    /// Built-in profiles. By convention each is a superset of the previous
    /// one (`minimal` ⊆ `readonly` ⊆ `diagnostics`), but each is a flat set.
    pub fn builtin(name: &str) -> Option<Self> {
        let tiers: &[&[&str]] = match name {
            "minimal" => &[MINIMAL_ALLOW],
            "readonly" => &[MINIMAL_ALLOW, READONLY_ALLOW],
            "diagnostics" => &[MINIMAL_ALLOW, READONLY_ALLOW, DIAGNOSTICS_ALLOW],
            _ => return None,
        };
        let allow = tiers.iter().flat_map(|t| t.iter().copied());
        Some(Self::new(name, allow, BUILTIN_DENY.iter().copied()))
    }

    pub fn builtin_names() -> &'static [&'static str] {
        &["minimal", "readonly", "diagnostics"]
    }
}

/// Classify one operation against a profile.
pub fn classify(op: &Operation, profile: &Profile) -> Classification {
    match (op.kind(), op.target()) {
        (OperationKind::Exec, Target::Argv(argv)) => classify_argv(argv, profile),
        (OperationKind::Write, Target::Path(path)) => classify_write(path, profile),
        (OperationKind::Read | OperationKind::Stat, _) => {
            Classification::unconditional(Decision::Allow)
        }
        // Network is disabled outright; anything mismatched fails closed.
        _ => Classification::unconditional(Decision::Deny),
    }
}

/// Classify a subprocess invocation.
///
/// `sh -c "<line>"` style invocations are unwrapped and every segment of the
/// command chain is classified; the most restrictive segment wins.
pub fn classify_argv(argv: &[String], profile: &Profile) -> Classification {
    let Some(parsed) = parse_argv(argv) else {
        return Classification::review();
    };

    let line = display_argv(argv);
    let verdict = if let Some(script) = shell_script(&parsed) {
        classify_shell_line(script, profile)
    } else if let Some(pattern) = denied_by_substring(&line, profile) {
        Classification::deny(pattern)
    } else {
        classify_parsed(&parsed, profile)
    };

    if verdict.decision == Decision::Review && profile.approved.contains(&line) {
        return Classification::allow(&line);
    }
    verdict
}

/// Classify a shell command line (as passed to `system(3)`).
pub fn classify_shell_line(line: &str, profile: &Profile) -> Classification {
    // Substring denials run on the whole line: some patterns (fork bombs,
    // redirections) span chain separators.
    if let Some(pattern) = denied_by_substring(line, profile) {
        return Classification::deny(pattern);
    }

    let segments = split_chain(line);
    if segments.is_empty() {
        return Classification::review();
    }

    let mut worst = Classification::unconditional(Decision::Allow);
    for segment in segments {
        let tokens = tokenize(segment);
        let classification = match parse_argv(&tokens) {
            Some(parsed) => {
                let verdict = classify_parsed(&parsed, profile);
                // Expansions and redirections make the real argv unknowable;
                // they may still be denied but never allowed.
                if verdict.decision == Decision::Allow && has_shell_expansion(segment) {
                    Classification::review()
                } else if let Some(inner) = shell_script(&parsed) {
                    classify_shell_line(inner, profile)
                } else {
                    verdict
                }
            }
            None => Classification::review(),
        };
        if classification.decision > worst.decision {
            worst = classification;
        }
    }
    worst
}

/// Classify a write to an absolute, normalized path.
pub fn classify_write(path: &Path, profile: &Profile) -> Classification {
    for pattern in &profile.always_deny {
        if let Some(prefix) = path_pattern(pattern) {
            if path.starts_with(prefix) {
                return Classification::deny(pattern);
            }
        }
    }
    for pattern in &profile.auto_approve {
        if let Some(prefix) = path_pattern(pattern) {
            if path.starts_with(prefix) {
                return Classification::allow(pattern);
            }
        }
    }
    Classification::review()
}

// --- Private helpers ---

/// Parsed command: binary basename and its arguments (binary excluded).
#[derive(Debug)]
struct ParsedCommand {
    binary: String,
    args: Vec<String>,
}

const SHELLS: &[&str] = &["sh", "bash", "dash", "zsh", "ksh"];

/// Skip `VAR=value` assignments and wrapper prefixes (env, nice, time,
/// command, builtin), then split into basename + args.
fn parse_argv(argv: &[String]) -> Option<ParsedCommand> {
    let skip_prefixes = ["env", "nice", "time", "command", "builtin"];
    let mut rest = argv;
    loop {
        let (first, tail) = rest.split_first()?;
        let base = basename(first);
        if is_assignment(first) || skip_prefixes.contains(&base) {
            rest = tail;
        } else {
            break;
        }
    }
    let (first, tail) = rest.split_first()?;
    Some(ParsedCommand {
        binary: basename(first).to_string(),
        args: tail.to_vec(),
    })
}

fn is_assignment(token: &str) -> bool {
    match token.split_once('=') {
        Some((name, _)) => {
            !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        None => false,
    }
}

/// `sh -c <script>` → the script.
fn shell_script(parsed: &ParsedCommand) -> Option<&str> {
    if !SHELLS.contains(&parsed.binary.as_str()) {
        return None;
    }
    match parsed.args.as_slice() {
        [flag, script, ..] if flag == "-c" => Some(script.as_str()),
        _ => None,
    }
}

fn classify_parsed(parsed: &ParsedCommand, profile: &Profile) -> Classification {
    if parsed.binary.is_empty() {
        return Classification::review();
    }
    for pattern in &profile.always_deny {
        if command_pattern_matches(pattern, parsed, false) {
            return Classification::deny(pattern);
        }
    }
    // A bare shell or interpreter is opaque: it is never auto-approved.
    if !SHELLS.contains(&parsed.binary.as_str()) {
        for pattern in &profile.auto_approve {
            if command_pattern_matches(pattern, parsed, true) {
                return Classification::allow(pattern);
            }
        }
    }
    Classification::review()
}

/// Match a command pattern against a parsed command.
///
/// With `strict`, a pattern ending in a path token also confines every
/// later path-like argument to that prefix, so `cat /var/log` does not allow
/// `cat /var/log/syslog /etc/shadow`.
fn command_pattern_matches(pattern: &str, parsed: &ParsedCommand, strict: bool) -> bool {
    let tokens = tokenize(pattern);
    let Some((name, pattern_args)) = tokens.split_first() else {
        return false;
    };
    if path_pattern(pattern).is_some() || basename(name) != parsed.binary {
        return false;
    }
    if pattern_args.len() > parsed.args.len() {
        return false;
    }

    for (want, got) in pattern_args.iter().zip(&parsed.args) {
        let ok = if want.starts_with('/') {
            path_under(got, want)
        } else {
            want == got
        };
        if !ok {
            return false;
        }
    }

    if strict {
        if let Some(last) = pattern_args.last().filter(|t| t.starts_with('/')) {
            return parsed.args[pattern_args.len()..]
                .iter()
                .filter(|a| looks_like_path(a))
                .all(|a| path_under(a, last));
        }
    }
    true
}

/// Single-token absolute patterns are write-path patterns.
fn path_pattern(pattern: &str) -> Option<PathBuf> {
    let trimmed = pattern.trim();
    if trimmed.starts_with('/') && !trimmed.contains(char::is_whitespace) {
        normalize_path(Path::new("/"), Path::new(trimmed))
    } else {
        None
    }
}

/// Component-wise prefix check on lexically normalized absolute paths.
fn path_under(candidate: &str, prefix: &str) -> bool {
    if !candidate.starts_with('/') {
        return false;
    }
    let root = Path::new("/");
    match (
        normalize_path(root, Path::new(candidate)),
        normalize_path(root, Path::new(prefix)),
    ) {
        (Some(c), Some(p)) => c.starts_with(p),
        _ => false,
    }
}

fn looks_like_path(arg: &str) -> bool {
    arg.starts_with('/') || arg.split('/').any(|part| part == "..")
}

fn denied_by_substring<'p>(line: &str, profile: &'p Profile) -> Option<&'p str> {
    let haystack = squash(line);
    profile
        .always_deny
        .iter()
        .find(|pattern| {
            let needle = squash(pattern);
            !needle.is_empty() && haystack.contains(&needle)
        })
        .map(String::as_str)
}

/// Lowercase and collapse whitespace runs to single spaces.
fn squash(s: &str) -> String {
    s.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

fn has_shell_expansion(segment: &str) -> bool {
    segment
        .chars()
        .any(|c| matches!(c, '$' | '`' | '>' | '<' | '(' | ')' | '&' | '\n'))
}

/// Basic tokenizer that respects single and double quotes.
fn tokenize(cmd: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_single = false;
    let mut in_double = false;
    let mut escape_next = false;
    let mut quoted = false;

    for ch in cmd.chars() {
        if escape_next {
            current.push(ch);
            escape_next = false;
            continue;
        }

        if ch == '\\' && !in_single {
            escape_next = true;
            continue;
        }

        if ch == '\'' && !in_double {
            in_single = !in_single;
            quoted = true;
            continue;
        }

        if ch == '"' && !in_single {
            in_double = !in_double;
            quoted = true;
            continue;
        }

        if ch.is_whitespace() && !in_single && !in_double {
            if !current.is_empty() || quoted {
                tokens.push(std::mem::take(&mut current));
                quoted = false;
            }
            continue;
        }

        current.push(ch);
    }

    if !current.is_empty() || quoted {
        tokens.push(current);
    }

    tokens
}

/// Extract the basename from a path (e.g., "/usr/bin/ls" -> "ls").
fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Split a compound command on `|`, `&&`, `||`, `;` outside quotes.
fn split_chain(cmd: &str) -> Vec<&str> {
    let mut segments = Vec::new();
    let mut start = 0;
    let mut in_single = false;
    let mut in_double = false;
    let mut chars = cmd.char_indices().peekable();

    while let Some((i, ch)) = chars.next() {
        if ch == '\'' && !in_double {
            in_single = !in_single;
        } else if ch == '"' && !in_single {
            in_double = !in_double;
        } else if !in_single && !in_double {
            let split = match ch {
                '|' => {
                    if chars.peek().map(|(_, c)| *c) == Some('|') {
                        chars.next();
                    }
                    true
                }
                '&' if chars.peek().map(|(_, c)| *c) == Some('&') => {
                    chars.next();
                    true
                }
                ';' | '\n' => true,
                _ => false,
            };
            if split {
                segments.push(&cmd[start..i]);
                start = chars.peek().map(|(i, _)| *i).unwrap_or(cmd.len());
            }
        }
    }

    segments.push(&cmd[start..]);
    segments.retain(|s| !s.trim().is_empty());
    segments
}
