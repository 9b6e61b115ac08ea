//! Tolerant semantic version parsing and version ranges.
//!
//! Recorded versions come from user-visible status and from environment variables, so
//! parsing accepts the loose forms people actually write: surrounding whitespace, a
//! leading "v", missing minor/patch components and zero-padded numbers.
//!
//! Ranges use a small comparator grammar:
//! - `=`, `==`, `!=`, `>`, `>=`, `<`, `<=` followed by a version (a bare version means `=`)
//! - whitespace-separated comparators are ANDed
//! - `||` separates alternatives

use std::fmt;
use std::str::FromStr;

use semver::Version;

use crate::controller::error::{Error, Result};

/// Parse a version string tolerantly.
pub fn parse_tolerant(input: &str) -> Result<Version> {
    let trimmed = input.trim();
    let trimmed = trimmed.strip_prefix('v').unwrap_or(trimmed);
    if trimmed.is_empty() {
        return Err(Error::Version(format!("empty version string: {input:?}")));
    }

    let mut parts: Vec<String> = trimmed.splitn(3, '.').map(str::to_string).collect();
    if parts.len() < 3 {
        if parts
            .last()
            .is_some_and(|last| last.contains(['+', '-']))
        {
            return Err(Error::Version(format!(
                "short version cannot carry pre-release or build metadata: {input:?}"
            )));
        }
        while parts.len() < 3 {
            parts.push("0".to_string());
        }
    }

    // Only the numeric prefix of each core component may be zero-padded.
    for part in parts.iter_mut() {
        let digits = part.chars().take_while(char::is_ascii_digit).count();
        if digits > 1 && part.starts_with('0') {
            let (number, rest) = part.split_at(digits);
            let number = number.trim_start_matches('0');
            let number = if number.is_empty() { "0" } else { number };
            *part = format!("{number}{rest}");
        }
    }

    let normalized = parts.join(".");
    Version::parse(&normalized)
        .map_err(|e| Error::Version(format!("invalid version {input:?}: {e}")))
}

/// Comparison operator of a range comparator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Op {
    Eq,
    NotEq,
    Gt,
    GtEq,
    Lt,
    LtEq,
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Op::Eq => write!(f, "="),
            Op::NotEq => write!(f, "!="),
            Op::Gt => write!(f, ">"),
            Op::GtEq => write!(f, ">="),
            Op::Lt => write!(f, "<"),
            Op::LtEq => write!(f, "<="),
        }
    }
}

/// A single `<op><version>` constraint.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Comparator {
    pub op: Op,
    pub version: Version,
}

impl Comparator {
    pub fn matches(&self, version: &Version) -> bool {
        let ord = compare(version, &self.version);
        match self.op {
            Op::Eq => ord.is_eq(),
            Op::NotEq => !ord.is_eq(),
            Op::Gt => ord.is_gt(),
            Op::GtEq => ord.is_ge(),
            Op::Lt => ord.is_lt(),
            Op::LtEq => ord.is_le(),
        }
    }
}

impl FromStr for Comparator {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let (op, rest) = split_op(s);
        if rest.trim().is_empty() {
            return Err(Error::Version(format!("comparator {s:?} has no version")));
        }
        Ok(Self {
            op,
            version: parse_tolerant(rest)?,
        })
    }
}

/// Precedence ignores build metadata.
fn compare(a: &Version, b: &Version) -> std::cmp::Ordering {
    a.major
        .cmp(&b.major)
        .then(a.minor.cmp(&b.minor))
        .then(a.patch.cmp(&b.patch))
        .then_with(|| match (a.pre.is_empty(), b.pre.is_empty()) {
            (true, true) => std::cmp::Ordering::Equal,
            (true, false) => std::cmp::Ordering::Greater,
            (false, true) => std::cmp::Ordering::Less,
            (false, false) => a.pre.cmp(&b.pre),
        })
}

fn split_op(s: &str) -> (Op, &str) {
    // Two-character operators first.
    for (prefix, op) in [
        (">=", Op::GtEq),
        ("<=", Op::LtEq),
        ("!=", Op::NotEq),
        ("==", Op::Eq),
        (">", Op::Gt),
        ("<", Op::Lt),
        ("=", Op::Eq),
    ] {
        if let Some(rest) = s.strip_prefix(prefix) {
            return (op, rest);
        }
    }
    (Op::Eq, s)
}

fn is_operator_only(token: &str) -> bool {
    matches!(token, "=" | "==" | "!=" | ">" | ">=" | "<" | "<=")
}

/// A parsed version range: a disjunction of comparator conjunctions.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VersionRange {
    alternatives: Vec<Vec<Comparator>>,
}

impl VersionRange {
    pub fn parse(input: &str) -> Result<Self> {
        input.parse()
    }

    /// Whether `version` satisfies any alternative of the range.
    pub fn matches(&self, version: &Version) -> bool {
        self.alternatives
            .iter()
            .any(|all| all.iter().all(|c| c.matches(version)))
    }
}

impl FromStr for VersionRange {
    type Err = Error;

    fn from_str(input: &str) -> Result<Self> {
        let mut alternatives = Vec::new();
        for alternative in input.split("||") {
            let tokens: Vec<&str> = alternative.split_whitespace().collect();
            if tokens.is_empty() {
                return Err(Error::Version(format!(
                    "empty alternative in range {input:?}"
                )));
            }

            let mut comparators = Vec::with_capacity(tokens.len());
            let mut iter = tokens.into_iter();
            while let Some(token) = iter.next() {
                // Accept "> 1.0.0" as well as ">1.0.0".
                let comparator = if is_operator_only(token) {
                    let version = iter.next().ok_or_else(|| {
                        Error::Version(format!("dangling operator {token:?} in range {input:?}"))
                    })?;
                    format!("{token}{version}").parse::<Comparator>()?
                } else {
                    token.parse::<Comparator>()?
                };
                comparators.push(comparator);
            }
            alternatives.push(comparators);
        }
        Ok(Self { alternatives })
    }
}

impl fmt::Display for VersionRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered: Vec<String> = self
            .alternatives
            .iter()
            .map(|all| {
                all.iter()
                    .map(|c| format!("{}{}", c.op, c.version))
                    .collect::<Vec<_>>()
                    .join(" ")
            })
            .collect();
        write!(f, "{}", rendered.join(" || "))
    }
}
