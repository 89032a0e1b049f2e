//! Version comparison used by the built-in matchers.
//!
//! Two grammars are supported:
//!
//! - [`LooseVersion`] + [`Requirements`]: Maven-style ordering with both
//!   interval ranges (`[1.0,2.0)`, `(,1.5],[2.0,)`) and operator
//!   constraints (`<2.0`, `>=1.0 <1.5`, `>=1.0, <1.5`). Used for Maven
//!   and Python feeds, whose range notation is close enough to share.
//! - [`SemverRequirements`]: semantic versioning through the `semver`
//!   crate, with lenient parsing of `v` prefixes and short versions.
//!
//! In both grammars `||` separates alternatives. Within one alternative,
//! operator constraints are intersected; Maven intervals are unioned.

use std::cmp::Ordering;
use std::fmt;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum VersionError {
    #[error("empty version")]
    Empty,
    #[error("invalid version '{0}'")]
    InvalidVersion(String),
    #[error("invalid requirement '{0}'")]
    InvalidRequirement(String),
    #[error("unsupported operator '{0}'")]
    UnsupportedOperator(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Item {
    Number(u64),
    Qualifier(String),
}

fn qualifier_rank(q: &str) -> u8 {
    match q {
        "alpha" | "a" => 0,
        "beta" | "b" => 1,
        "milestone" | "m" => 2,
        "rc" | "cr" | "c" | "pre" | "preview" => 3,
        "snapshot" | "dev" => 4,
        "" | "ga" | "final" | "release" => 5,
        "sp" | "post" => 6,
        _ => 7,
    }
}

fn is_release_marker(item: &Item) -> bool {
    match item {
        Item::Number(n) => *n == 0,
        Item::Qualifier(q) => qualifier_rank(q) == 5,
    }
}

impl Item {
    fn padding(&self) -> Item {
        match self {
            Item::Number(_) => Item::Number(0),
            Item::Qualifier(_) => Item::Qualifier(String::new()),
        }
    }
}

impl Ord for Item {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Item::Number(a), Item::Number(b)) => a.cmp(b),
            (Item::Number(_), Item::Qualifier(_)) => Ordering::Greater,
            (Item::Qualifier(_), Item::Number(_)) => Ordering::Less,
            (Item::Qualifier(a), Item::Qualifier(b)) => {
                let (ra, rb) = (qualifier_rank(a), qualifier_rank(b));
                if ra == 7 && rb == 7 {
                    a.cmp(b)
                } else {
                    ra.cmp(&rb)
                }
            }
        }
    }
}

impl PartialOrd for Item {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// A Maven-style version: numeric segments and qualifiers.
///
/// Trailing zeros and release markers are insignificant, so `1`, `1.0`
/// and `1.0.0-final` compare equal.
#[derive(Debug, Clone)]
pub struct LooseVersion {
    raw: String,
    items: Vec<Item>,
}

impl LooseVersion {
    pub fn parse(input: &str) -> Result<Self, VersionError> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(VersionError::Empty);
        }
        let lowered = trimmed.to_ascii_lowercase();
        let body = lowered
            .strip_prefix('v')
            .filter(|rest| rest.starts_with(|c: char| c.is_ascii_digit()))
            .unwrap_or(&lowered);

        let mut items = Vec::new();
        let mut current = String::new();
        let mut current_is_digit = false;

        let mut flush = |current: &mut String, is_digit: bool| -> Result<(), VersionError> {
            if current.is_empty() {
                return Ok(());
            }
            let item = if is_digit {
                let n = current
                    .parse::<u64>()
                    .map_err(|_| VersionError::InvalidVersion(input.to_string()))?;
                Item::Number(n)
            } else {
                Item::Qualifier(std::mem::take(current))
            };
            current.clear();
            items.push(item);
            Ok(())
        };

        for c in body.chars() {
            match c {
                '.' | '-' | '_' | '+' => {
                    flush(&mut current, current_is_digit)?;
                }
                c if c.is_ascii_alphanumeric() => {
                    let digit = c.is_ascii_digit();
                    if !current.is_empty() && digit != current_is_digit {
                        flush(&mut current, current_is_digit)?;
                    }
                    current_is_digit = digit;
                    current.push(c);
                }
                _ => return Err(VersionError::InvalidVersion(input.to_string())),
            }
        }
        flush(&mut current, current_is_digit)?;

        if !matches!(items.first(), Some(Item::Number(_))) {
            return Err(VersionError::InvalidVersion(input.to_string()));
        }
        while items.len() > 1 && items.last().is_some_and(is_release_marker) {
            items.pop();
        }

        Ok(Self {
            raw: trimmed.to_string(),
            items,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl fmt::Display for LooseVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl Ord for LooseVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        let len = self.items.len().max(other.items.len());
        for i in 0..len {
            let ord = match (self.items.get(i), other.items.get(i)) {
                (Some(a), Some(b)) => a.cmp(b),
                (Some(a), None) => a.cmp(&a.padding()),
                (None, Some(b)) => b.padding().cmp(b),
                (None, None) => Ordering::Equal,
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    }
}

impl PartialOrd for LooseVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for LooseVersion {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for LooseVersion {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

impl Op {
    fn parse(op: &str) -> Result<Self, VersionError> {
        match op {
            "<" => Ok(Op::Lt),
            "<=" => Ok(Op::Le),
            ">" => Ok(Op::Gt),
            ">=" => Ok(Op::Ge),
            "" | "=" | "==" => Ok(Op::Eq),
            "!=" => Ok(Op::Ne),
            other => Err(VersionError::UnsupportedOperator(other.to_string())),
        }
    }

    fn holds(self, ord: Ordering) -> bool {
        match self {
            Op::Lt => ord == Ordering::Less,
            Op::Le => ord != Ordering::Greater,
            Op::Gt => ord == Ordering::Greater,
            Op::Ge => ord != Ordering::Less,
            Op::Eq => ord == Ordering::Equal,
            Op::Ne => ord != Ordering::Equal,
        }
    }

    fn symbol(self) -> &'static str {
        match self {
            Op::Lt => "<",
            Op::Le => "<=",
            Op::Gt => ">",
            Op::Ge => ">=",
            Op::Eq => "=",
            Op::Ne => "!=",
        }
    }
}

/// Split an operator-constraint group into `(operator, version)` pairs.
///
/// Constraints may be separated by commas or whitespace, and whitespace
/// between an operator and its version is allowed.
fn operator_constraints(group: &str) -> Result<Vec<(String, String)>, VersionError> {
    let mut out = Vec::new();
    let mut chars = group.chars().peekable();
    loop {
        while chars.peek().is_some_and(|c| c.is_whitespace() || *c == ',') {
            chars.next();
        }
        if chars.peek().is_none() {
            break;
        }
        let mut op = String::new();
        while let Some(c) = chars.peek().copied().filter(|c| "<>=!~^".contains(*c)) {
            op.push(c);
            chars.next();
        }
        while chars.peek().is_some_and(|c| c.is_whitespace()) {
            chars.next();
        }
        let mut version = String::new();
        while let Some(c) = chars
            .peek()
            .copied()
            .filter(|c| !c.is_whitespace() && *c != ',')
        {
            version.push(c);
            chars.next();
        }
        if version.is_empty() {
            return Err(VersionError::InvalidRequirement(group.to_string()));
        }
        out.push((op, version));
    }
    if out.is_empty() {
        return Err(VersionError::InvalidRequirement(group.to_string()));
    }
    Ok(out)
}

/// Parse Maven interval notation into alternatives of constraints.
fn maven_intervals(group: &str) -> Result<Vec<Vec<(Op, LooseVersion)>>, VersionError> {
    let invalid = || VersionError::InvalidRequirement(group.to_string());
    let mut alternatives = Vec::new();
    let mut rest = group.trim();
    while !rest.is_empty() {
        let open = rest.chars().next().ok_or_else(invalid)?;
        if open != '[' && open != '(' {
            return Err(invalid());
        }
        let close_at = rest.find(&[']', ')'][..]).ok_or_else(invalid)?;
        let close = rest[close_at..].chars().next().ok_or_else(invalid)?;
        let inner = &rest[1..close_at];

        let mut constraints = Vec::new();
        match inner.split_once(',') {
            None => {
                if open != '[' || close != ']' {
                    return Err(invalid());
                }
                constraints.push((Op::Eq, LooseVersion::parse(inner)?));
            }
            Some((lower, upper)) => {
                if !lower.trim().is_empty() {
                    let op = if open == '[' { Op::Ge } else { Op::Gt };
                    constraints.push((op, LooseVersion::parse(lower)?));
                }
                if !upper.trim().is_empty() {
                    let op = if close == ']' { Op::Le } else { Op::Lt };
                    constraints.push((op, LooseVersion::parse(upper)?));
                }
            }
        }
        alternatives.push(constraints);
        rest = rest[close_at + 1..].trim_start_matches(|c: char| c == ',' || c.is_whitespace());
    }
    if alternatives.is_empty() {
        return Err(invalid());
    }
    Ok(alternatives)
}

/// A set of version ranges over [`LooseVersion`].
#[derive(Debug, Clone)]
pub struct Requirements {
    alternatives: Vec<Vec<(Op, LooseVersion)>>,
}

impl Requirements {
    pub fn parse(input: &str) -> Result<Self, VersionError> {
        if input.trim().is_empty() {
            return Err(VersionError::Empty);
        }
        let mut alternatives = Vec::new();
        for group in input.split("||") {
            let group = group.trim();
            if group.starts_with('[') || group.starts_with('(') {
                alternatives.extend(maven_intervals(group)?);
            } else if group == "*" {
                alternatives.push(Vec::new());
            } else {
                let mut constraints = Vec::new();
                for (op, version) in operator_constraints(group)? {
                    constraints.push((Op::parse(&op)?, LooseVersion::parse(&version)?));
                }
                alternatives.push(constraints);
            }
        }
        Ok(Self { alternatives })
    }

    /// Whether `version` falls in any of the ranges.
    pub fn check(&self, version: &LooseVersion) -> bool {
        self.alternatives.iter().any(|constraints| {
            constraints
                .iter()
                .all(|(op, bound)| op.holds(version.cmp(bound)))
        })
    }
}

impl fmt::Display for Requirements {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let groups: Vec<String> = self
            .alternatives
            .iter()
            .map(|c| {
                if c.is_empty() {
                    return "*".to_string();
                }
                c.iter()
                    .map(|(op, v)| format!("{}{}", op.symbol(), v))
                    .collect::<Vec<_>>()
                    .join(", ")
            })
            .collect();
        f.write_str(&groups.join(" || "))
    }
}

/// Parse a semantic version, tolerating a `v` prefix and missing
/// minor/patch components (`1.5` becomes `1.5.0`).
pub fn parse_semver(input: &str) -> Result<semver::Version, VersionError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(VersionError::Empty);
    }
    let body = trimmed.strip_prefix('v').unwrap_or(trimmed);
    let split_at = body.find(&['-', '+'][..]).unwrap_or(body.len());
    let (core, suffix) = body.split_at(split_at);
    let mut padded = core.to_string();
    for _ in core.matches('.').count()..2 {
        padded.push_str(".0");
    }
    padded.push_str(suffix);
    semver::Version::parse(&padded).map_err(|_| VersionError::InvalidVersion(input.to_string()))
}

/// Semantic-versioning requirements, `||`-separated alternatives of
/// operator constraints.
#[derive(Debug, Clone)]
pub struct SemverRequirements {
    alternatives: Vec<semver::VersionReq>,
}

impl SemverRequirements {
    pub fn parse(input: &str) -> Result<Self, VersionError> {
        if input.trim().is_empty() {
            return Err(VersionError::Empty);
        }
        let mut alternatives = Vec::new();
        for group in input.split("||") {
            let group = group.trim();
            if group == "*" {
                alternatives.push(semver::VersionReq::STAR);
                continue;
            }
            let mut comparators = Vec::new();
            for (op, version) in operator_constraints(group)? {
                let op = match op.as_str() {
                    "" | "==" => "=".to_string(),
                    "!=" => return Err(VersionError::UnsupportedOperator(op)),
                    _ => op,
                };
                let version = parse_semver(&version)?;
                comparators.push(format!("{}{}", op, version));
            }
            let req = semver::VersionReq::parse(&comparators.join(", "))
                .map_err(|_| VersionError::InvalidRequirement(group.to_string()))?;
            alternatives.push(req);
        }
        Ok(Self { alternatives })
    }

    pub fn check(&self, version: &semver::Version) -> bool {
        self.alternatives.iter().any(|req| req.matches(version))
    }
}
