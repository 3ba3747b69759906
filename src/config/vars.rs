//! `${VAR}` interpolation for pipeline config files.
//!
//! Deployments keep namenode addresses and database credentials out of the
//! YAML by referencing the environment:
//!
//! ```yaml
//! storage:
//!   url: "hdfs://${NAMENODE:-namenode:9000}/"
//! relational:
//!   password: ${DB_PASSWORD}
//! ```
//!
//! `$VAR` and `${VAR}` must be set; `${VAR:-default}` falls back when unset or
//! empty, `${VAR-default}` only when unset; `$$` is a literal `$`. Comment lines
//! are copied through untouched so commented-out settings never demand a variable.

use regex::{Captures, Regex};
use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::sync::LazyLock;

static REFERENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"\$\$|\$\{(?P<braced>[A-Za-z_][A-Za-z0-9_]*)(?:(?P<op>:?-)(?P<default>[^}]*))?\}|\$(?P<bare>[A-Za-z_][A-Za-z0-9_]*)",
    )
    .expect("constant interpolation pattern")
});

/// Why a variable reference could not be substituted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Problem {
    Unset,
    /// Value spans lines and would restructure the YAML document.
    Multiline,
}

/// A variable reference left in place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unresolved {
    pub name: String,
    pub problem: Problem,
    /// 1-based line of the first reference.
    pub line: usize,
}

impl fmt::Display for Unresolved {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.problem {
            Problem::Unset => write!(f, "line {}: ${{{}}} is not set", self.line, self.name),
            Problem::Multiline => write!(
                f,
                "line {}: ${{{}}} contains a line break",
                self.line, self.name
            ),
        }
    }
}

/// Interpolated text plus every reference that could not be resolved.
#[derive(Debug)]
pub struct Interpolated {
    pub text: String,
    /// One entry per variable name, ordered by name.
    pub unresolved: Vec<Unresolved>,
}

impl Interpolated {
    pub fn is_ok(&self) -> bool {
        self.unresolved.is_empty()
    }

    /// One line per unresolved variable.
    pub fn report(&self) -> String {
        self.unresolved
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Interpolate against the process environment.
pub fn interpolate(input: &str) -> Interpolated {
    interpolate_with(input, |name| env::var(name).ok())
}

/// Interpolate against an arbitrary variable source.
pub fn interpolate_with<F>(input: &str, lookup: F) -> Interpolated
where
    F: Fn(&str) -> Option<String>,
{
    let mut unresolved: BTreeMap<String, Unresolved> = BTreeMap::new();
    let mut text = String::with_capacity(input.len());

    for (idx, line) in input.split_inclusive('\n').enumerate() {
        if line.trim_start().starts_with('#') {
            text.push_str(line);
            continue;
        }
        let replaced = REFERENCE.replace_all(line, |caps: &Captures| {
            match resolve(caps, &lookup) {
                Ok(value) => value,
                Err((name, problem)) => {
                    unresolved.entry(name.clone()).or_insert(Unresolved {
                        name,
                        problem,
                        line: idx + 1,
                    });
                    caps[0].to_string()
                }
            }
        });
        text.push_str(&replaced);
    }

    Interpolated {
        text,
        unresolved: unresolved.into_values().collect(),
    }
}

fn resolve<F>(caps: &Captures, lookup: &F) -> Result<String, (String, Problem)>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(name) = caps.name("braced").or_else(|| caps.name("bare")) else {
        return Ok("$".to_string());
    };
    let name = name.as_str();
    let default = caps.name("default").map(|m| m.as_str());
    let empty_falls_back = caps.name("op").is_some_and(|op| op.as_str() == ":-");

    match (lookup(name), default) {
        (Some(value), _) if value.contains(['\n', '\r']) => {
            Err((name.to_string(), Problem::Multiline))
        }
        (Some(value), Some(default)) if value.is_empty() && empty_falls_back => {
            Ok(default.to_string())
        }
        (Some(value), _) => Ok(value),
        (None, Some(default)) => Ok(default.to_string()),
        (None, None) => Err((name.to_string(), Problem::Unset)),
    }
}
