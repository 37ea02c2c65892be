//! Constraint signatures: the structured intent of a decision.
//!
//! A decision block may carry any number of signatures. Each one constrains a
//! single dotted axis (`database.engine`, `api.auth.scheme`, ...) to a scalar
//! or list object under a relation and an enforcement level. Contradiction
//! detection operates purely on these records: two signatures contradict iff
//! they share an axis, disagree on the object, and both are `hard`.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::errors::MemError;

/// Relation between the axis and the constrained object.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Relation {
    MustBe,
    MustNotBe,
    ShouldBe,
    ShouldNotBe,
    Prefers,
    Requires,
    Excludes,
    Replaces,
}

impl fmt::Display for Relation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Relation::MustBe => "must_be",
            Relation::MustNotBe => "must_not_be",
            Relation::ShouldBe => "should_be",
            Relation::ShouldNotBe => "should_not_be",
            Relation::Prefers => "prefers",
            Relation::Requires => "requires",
            Relation::Excludes => "excludes",
            Relation::Replaces => "replaces",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for Relation {
    type Err = MemError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "must_be" => Ok(Relation::MustBe),
            "must_not_be" => Ok(Relation::MustNotBe),
            "should_be" => Ok(Relation::ShouldBe),
            "should_not_be" => Ok(Relation::ShouldNotBe),
            "prefers" => Ok(Relation::Prefers),
            "requires" => Ok(Relation::Requires),
            "excludes" => Ok(Relation::Excludes),
            "replaces" => Ok(Relation::Replaces),
            _ => Err(MemError::InvalidSignature(format!(
                "unknown relation `{s}`"
            ))),
        }
    }
}

/// How strongly the constraint binds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Enforcement {
    Hard,
    Soft,
    Advisory,
}

impl fmt::Display for Enforcement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Enforcement::Hard => "hard",
            Enforcement::Soft => "soft",
            Enforcement::Advisory => "advisory",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for Enforcement {
    type Err = MemError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "hard" => Ok(Enforcement::Hard),
            "soft" => Ok(Enforcement::Soft),
            "advisory" => Ok(Enforcement::Advisory),
            _ => Err(MemError::InvalidSignature(format!(
                "unknown enforcement `{s}`"
            ))),
        }
    }
}

/// Blast radius of the constraint. Narrower scopes are more specific and win
/// contradiction tie-breaks.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    Module,
    Project,
    Workspace,
    Org,
}

impl Scope {
    /// Specificity rank: module > project > workspace > org.
    pub fn specificity(&self) -> u8 {
        match self {
            Scope::Module => 4,
            Scope::Project => 3,
            Scope::Workspace => 2,
            Scope::Org => 1,
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Scope::Module => "module",
            Scope::Project => "project",
            Scope::Workspace => "workspace",
            Scope::Org => "org",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for Scope {
    type Err = MemError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "module" => Ok(Scope::Module),
            "project" => Ok(Scope::Project),
            "workspace" => Ok(Scope::Workspace),
            "org" => Ok(Scope::Org),
            _ => Err(MemError::InvalidSignature(format!("unknown scope `{s}`"))),
        }
    }
}

/// Deontic modality of the constraint.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Modality {
    Must,
    Should,
    May,
}

impl fmt::Display for Modality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Modality::Must => "must",
            Modality::Should => "should",
            Modality::May => "may",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for Modality {
    type Err = MemError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "must" => Ok(Modality::Must),
            "should" => Ok(Modality::Should),
            "may" => Ok(Modality::May),
            _ => Err(MemError::InvalidSignature(format!(
                "unknown modality `{s}`"
            ))),
        }
    }
}

/// The constrained value: a single scalar or a list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum SignatureObject {
    Scalar(String),
    List(Vec<String>),
}

impl SignatureObject {
    /// Parse the markdown value form: `[a, b, c]` is a list, anything else a
    /// scalar.
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        if let Some(inner) = trimmed
            .strip_prefix('[')
            .and_then(|rest| rest.strip_suffix(']'))
        {
            let items = inner
                .split(',')
                .map(|item| item.trim().to_string())
                .filter(|item| !item.is_empty())
                .collect();
            SignatureObject::List(items)
        } else {
            SignatureObject::Scalar(trimmed.to_string())
        }
    }
}

impl fmt::Display for SignatureObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignatureObject::Scalar(s) => write!(f, "{}", s),
            SignatureObject::List(items) => write!(f, "[{}]", items.join(", ")),
        }
    }
}

/// A structured constraint attached to a decision block.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConstraintSignature {
    /// Dotted constraint dimension, e.g. `database.engine`.
    axis_key: String,
    relation: Relation,
    object: SignatureObject,
    enforcement: Enforcement,
    domain: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    subject: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    predicate: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    scope: Option<Scope>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    modality: Option<Modality>,
    /// 1 (lowest) to 10 (highest). Higher priority wins tie-breaks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    priority: Option<u8>,
}

impl ConstraintSignature {
    pub fn new(
        axis_key: impl Into<String>,
        relation: Relation,
        object: SignatureObject,
        enforcement: Enforcement,
        domain: impl Into<String>,
    ) -> Result<Self, MemError> {
        let axis_key = axis_key.into();
        if axis_key.trim().is_empty() {
            return Err(MemError::InvalidSignature(
                "axis.key cannot be empty".to_string(),
            ));
        }
        Ok(Self {
            axis_key,
            relation,
            object,
            enforcement,
            domain: domain.into(),
            subject: None,
            predicate: None,
            scope: None,
            modality: None,
            priority: None,
        })
    }

    /// Assemble a signature from the parser's `key: value` pairs. The order
    /// of keys is free; `axis.key`, `relation`, `object`, `enforcement` and
    /// `domain` are required.
    pub fn from_pairs(pairs: &[(String, String)]) -> Result<Self, MemError> {
        let lookup = |key: &str| {
            pairs
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.as_str())
        };
        let required = |key: &str| {
            lookup(key).ok_or_else(|| {
                MemError::InvalidSignature(format!("missing required key `{key}`"))
            })
        };

        let mut signature = Self::new(
            required("axis.key")?,
            required("relation")?.parse()?,
            SignatureObject::parse(required("object")?),
            required("enforcement")?.parse()?,
            required("domain")?,
        )?;
        signature.subject = lookup("subject").map(str::to_string);
        signature.predicate = lookup("predicate").map(str::to_string);
        signature.scope = lookup("scope").map(str::parse).transpose()?;
        signature.modality = lookup("modality").map(str::parse).transpose()?;
        if let Some(raw) = lookup("priority") {
            let priority: u8 = raw.parse().map_err(|_| {
                MemError::InvalidSignature(format!("priority `{raw}` is not an integer"))
            })?;
            if !(1..=10).contains(&priority) {
                return Err(MemError::InvalidSignature(format!(
                    "priority {priority} outside 1..=10"
                )));
            }
            signature.priority = Some(priority);
        }
        Ok(signature)
    }

    pub fn axis_key(&self) -> &str {
        &self.axis_key
    }

    pub fn relation(&self) -> Relation {
        self.relation
    }

    pub fn object(&self) -> &SignatureObject {
        &self.object
    }

    pub fn enforcement(&self) -> Enforcement {
        self.enforcement
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn subject(&self) -> Option<&str> {
        self.subject.as_deref()
    }

    pub fn predicate(&self) -> Option<&str> {
        self.predicate.as_deref()
    }

    pub fn scope(&self) -> Option<Scope> {
        self.scope
    }

    pub fn modality(&self) -> Option<Modality> {
        self.modality
    }

    pub fn priority(&self) -> Option<u8> {
        self.priority
    }

    pub fn set_scope(&mut self, scope: Option<Scope>) {
        self.scope = scope;
    }

    pub fn set_priority(&mut self, priority: Option<u8>) {
        self.priority = priority;
    }

    pub fn set_subject(&mut self, subject: Option<String>) {
        self.subject = subject;
    }

    pub fn set_predicate(&mut self, predicate: Option<String>) {
        self.predicate = predicate;
    }

    pub fn set_modality(&mut self, modality: Option<Modality>) {
        self.modality = modality;
    }

    /// Two signatures contradict iff the axis matches, the objects differ and
    /// both sides are hard constraints.
    pub fn contradicts(&self, other: &Self) -> bool {
        self.axis_key == other.axis_key
            && self.object != other.object
            && self.enforcement == Enforcement::Hard
            && other.enforcement == Enforcement::Hard
    }

    /// Emit the 2-space-indented list-record form used inside a block.
    pub fn to_markdown(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("  - axis.key: {}\n", self.axis_key));
        out.push_str(&format!("    relation: {}\n", self.relation));
        out.push_str(&format!("    object: {}\n", self.object));
        out.push_str(&format!("    enforcement: {}\n", self.enforcement));
        out.push_str(&format!("    domain: {}\n", self.domain));
        if let Some(subject) = &self.subject {
            out.push_str(&format!("    subject: {}\n", subject));
        }
        if let Some(predicate) = &self.predicate {
            out.push_str(&format!("    predicate: {}\n", predicate));
        }
        if let Some(scope) = self.scope {
            out.push_str(&format!("    scope: {}\n", scope));
        }
        if let Some(modality) = self.modality {
            out.push_str(&format!("    modality: {}\n", modality));
        }
        if let Some(priority) = self.priority {
            out.push_str(&format!("    priority: {}\n", priority));
        }
        out
    }
}
