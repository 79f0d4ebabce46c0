//! Best-effort static prediction of the subprocesses a script will spawn.
//!
//! Prediction only ever makes a run more restrictive: the final aggregate
//! of a run is the worse of the predicted and the runtime verdict, and a
//! script the predictor cannot read fully predicts `Review`.

use serde::{Deserialize, Serialize};

use crate::policy::{classify_argv, Aggregate, Profile};

/// A subprocess call whose arguments are all literals.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiteralCommand {
    pub argv: Vec<String>,
    /// 1-based source line of the call.
    pub line: usize,
}

pub trait StaticPredictor: Send + Sync {
    /// Literal subprocess invocations in `source`, or `None` if any call
    /// site has dynamic arguments or cannot be read.
    fn predict(&self, source: &str) -> Option<Vec<LiteralCommand>>;
}

/// Aggregate verdict for a prediction. No prediction is `Review`, never
/// `Fast`.
pub fn classify_prediction(prediction: Option<&[LiteralCommand]>, profile: &Profile) -> Aggregate {
    match prediction {
        None => Aggregate::Review,
        Some(commands) => Aggregate::from_decisions(
            commands
                .iter()
                .map(|c| classify_argv(&c.argv, profile).decision),
        ),
    }
}

/// Predicts `os.system(...)` and `subprocess.{run,call,check_call,
/// check_output,Popen}(...)` calls in Python source.
#[derive(Debug, Clone, Copy, Default)]
pub struct PythonLiteralPredictor;

/// Calls whose first argument is a command.
const CALL_SITES: &[&str] = &[
    "os.system",
    "subprocess.run",
    "subprocess.call",
    "subprocess.check_call",
    "subprocess.check_output",
    "subprocess.Popen",
];

/// Constructs that reach a subprocess without going through a visible
/// call site.
const OPAQUE: &[&str] = &[
    "import subprocess as",
    "import os as",
    "from subprocess import",
    "from os import",
    "os.popen",
    "os.exec",
    "os.spawn",
    "os.posix_spawn",
    "pty.spawn",
    "__import__",
    "importlib",
    "eval(",
    "exec(",
];

impl StaticPredictor for PythonLiteralPredictor {
    fn predict(&self, source: &str) -> Option<Vec<LiteralCommand>> {
        if OPAQUE.iter().any(|p| source.contains(p)) {
            return None;
        }

        let mut commands = Vec::new();
        for site in CALL_SITES {
            let mut from = 0;
            while let Some(found) = source[from..].find(site) {
                let start = from + found;
                from = start + site.len();
                if !at_identifier_boundary(source, start) {
                    continue;
                }
                let args = skip_ws(source, from);
                if !source[args..].starts_with('(') {
                    // Referenced, not called: the callable may escape.
                    return None;
                }
                let argv = parse_command_arg(source, args + 1)?;
                commands.push(LiteralCommand {
                    argv,
                    line: source[..start].matches('\n').count() + 1,
                });
            }
        }
        commands.sort_by_key(|c| c.line);
        Some(commands)
    }
}

fn at_identifier_boundary(source: &str, start: usize) -> bool {
    match source[..start].chars().next_back() {
        Some(c) => !(c.is_alphanumeric() || c == '_' || c == '.'),
        None => true,
    }
}

fn skip_ws(source: &str, mut i: usize) -> usize {
    let bytes = source.as_bytes();
    while i < bytes.len() && bytes[i].is_ascii_whitespace() {
        i += 1;
    }
    i
}

/// First call argument as an argv. A string is a shell line; a list of
/// strings is an argv. Anything else is dynamic.
fn parse_command_arg(source: &str, i: usize) -> Option<Vec<String>> {
    let i = skip_ws(source, i);
    let rest = &source[i..];

    let (argv, end) = if rest.starts_with('[') {
        parse_string_list(source, i + 1)?
    } else {
        let (s, end) = parse_string_literal(source, i)?;
        (vec!["/bin/sh".to_string(), "-c".to_string(), s], end)
    };

    // The literal must be the whole argument: `"ls " + path` is dynamic.
    let end = skip_ws(source, end);
    match source[end..].chars().next() {
        Some(',') | Some(')') => Some(argv),
        _ => None,
    }
}

fn parse_string_list(source: &str, mut i: usize) -> Option<(Vec<String>, usize)> {
    let mut items = Vec::new();
    loop {
        i = skip_ws(source, i);
        if source[i..].starts_with(']') {
            return (!items.is_empty()).then_some((items, i + 1));
        }
        let (s, end) = parse_string_literal(source, i)?;
        items.push(s);
        i = skip_ws(source, end);
        match source[i..].chars().next()? {
            ',' => i += 1,
            ']' => return Some((items, i + 1)),
            _ => return None,
        }
    }
}

/// Parse a Python string literal starting at `i`. f-strings and byte
/// strings are dynamic for our purposes.
fn parse_string_literal(source: &str, i: usize) -> Option<(String, usize)> {
    let rest = &source[i..];
    let prefix_len = rest
        .chars()
        .take_while(|c| c.is_ascii_alphabetic())
        .count();
    let prefix = rest[..prefix_len].to_ascii_lowercase();
    let raw = match prefix.as_str() {
        "" | "u" => false,
        "r" => true,
        _ => return None,
    };

    let body = &rest[prefix_len..];
    let quote = body.chars().next().filter(|c| *c == '\'' || *c == '"')?;
    let triple: String = std::iter::repeat(quote).take(3).collect();
    let (delim, open) = if body.starts_with(&triple) {
        (triple.as_str(), 3)
    } else {
        (&body[..1], 1)
    };

    let mut out = String::new();
    let mut chars = body[open..].char_indices();
    while let Some((j, c)) = chars.next() {
        if body[open + j..].starts_with(delim) {
            return Some((out, i + prefix_len + open + j + delim.len()));
        }
        match c {
            '\\' if !raw => match chars.next()?.1 {
                'n' => out.push('\n'),
                't' => out.push('\t'),
                '\n' => {}
                other @ ('\\' | '\'' | '"') => out.push(other),
                other => {
                    out.push('\\');
                    out.push(other);
                }
            },
            '\n' if delim.len() == 1 => return None,
            c => out.push(c),
        }
    }
    None
}
