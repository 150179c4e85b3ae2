//! Parsed model formula: outcome, fixed-effect terms and random-effect groupings.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use ps_core::{Error, Result};

/// Outcome name used when the formula is a bare predictor list.
pub const DEFAULT_OUTCOME: &str = "y";

/// A fixed-effect term: a main effect (one component) or an interaction.
///
/// Components reference predictor names, so the term graph is a DAG of
/// interaction -> main-effect edges by construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Term {
    components: Vec<String>,
}

impl Term {
    /// Main effect of a single predictor.
    pub fn main(name: impl Into<String>) -> Self {
        Self { components: vec![name.into()] }
    }

    /// Interaction of the given predictors (duplicates collapse).
    pub fn interaction<I, S>(components: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut out: Vec<String> = Vec::new();
        for c in components {
            let c = c.into();
            if !out.contains(&c) {
                out.push(c);
            }
        }
        Self { components: out }
    }

    /// Combine two terms into their interaction.
    pub(crate) fn cross(&self, other: &Term) -> Term {
        Term::interaction(self.components.iter().chain(other.components.iter()).cloned())
    }

    /// Predictors participating in this term, in formula order.
    pub fn components(&self) -> &[String] {
        &self.components
    }

    /// Number of components (1 for a main effect).
    pub fn order(&self) -> usize {
        self.components.len()
    }

    /// `true` for interactions.
    pub fn is_interaction(&self) -> bool {
        self.components.len() > 1
    }

    /// Canonical name, components joined by `:`.
    pub fn name(&self) -> String {
        self.components.join(":")
    }

    /// Identity ignores component order (`a:b` is the same term as `b:a`).
    pub fn same_as(&self, other: &Term) -> bool {
        self.components.len() == other.components.len()
            && self.components.iter().all(|c| other.components.contains(c))
    }
}

impl PartialEq for Term {
    fn eq(&self, other: &Self) -> bool {
        self.same_as(other)
    }
}

impl Eq for Term {}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

/// A random-effect grouping, e.g. `(1 + x|school)` or the child level of `(1|school/class)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RandomEffect {
    /// Grouping variable.
    pub grouping: String,
    /// Parent grouping when this level is nested (`school` for `school/class`).
    pub nested_in: Option<String>,
    /// Predictors with a random slope across `grouping`.
    pub slopes: Vec<String>,
}

impl RandomEffect {
    /// Random intercept only.
    pub fn intercept(grouping: impl Into<String>) -> Self {
        Self { grouping: grouping.into(), nested_in: None, slopes: Vec::new() }
    }
}

/// A parsed model formula.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Formula {
    pub(crate) outcome: String,
    pub(crate) terms: Vec<Term>,
    pub(crate) random: Vec<RandomEffect>,
}

impl Formula {
    /// Parse a formula such as `y ~ x1*x2 + (1|school)`.
    pub fn parse(spec: &str) -> Result<Self> {
        crate::parser::parse_formula(spec)
    }

    pub(crate) fn new(outcome: String, terms: Vec<Term>, random: Vec<RandomEffect>) -> Result<Self> {
        if terms.is_empty() {
            return Err(Error::Formula("formula has no fixed-effect terms".to_string()));
        }
        let formula = Self { outcome, terms, random };
        formula.validate_random()?;
        Ok(formula)
    }

    fn validate_random(&self) -> Result<()> {
        let predictors = self.predictor_names();
        for (i, re) in self.random.iter().enumerate() {
            if self.random[..i].iter().any(|o| o.grouping == re.grouping) {
                return Err(Error::Formula(format!(
                    "duplicate random effect for grouping '{}'",
                    re.grouping
                )));
            }
            if predictors.contains(&re.grouping) {
                return Err(Error::Formula(format!(
                    "grouping variable '{}' is also used as a fixed predictor",
                    re.grouping
                )));
            }
            for s in &re.slopes {
                if !predictors.contains(s) {
                    return Err(Error::Formula(format!(
                        "random slope '{}' must also appear as a fixed effect",
                        s
                    )));
                }
            }
        }
        Ok(())
    }

    /// Outcome variable name.
    pub fn outcome(&self) -> &str {
        &self.outcome
    }

    /// Fixed-effect terms ordered by interaction order, then formula order.
    pub fn fixed_terms(&self) -> &[Term] {
        &self.terms
    }

    /// Random-effect groupings (parents before nested children).
    pub fn random_effects(&self) -> &[RandomEffect] {
        &self.random
    }

    /// `true` when the formula carries any random-effect grouping.
    pub fn is_mixed(&self) -> bool {
        !self.random.is_empty()
    }

    /// Distinct predictors referenced by fixed terms, in order of first appearance.
    pub fn predictor_names(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for t in &self.terms {
            for c in t.components() {
                if !out.contains(c) {
                    out.push(c.clone());
                }
            }
        }
        out
    }

    /// Canonical string form that re-parses to the same formula.
    pub fn to_formula_string(&self) -> String {
        let mut parts: Vec<String> = self.terms.iter().map(Term::name).collect();
        for re in &self.random {
            if re.nested_in.is_some() {
                continue;
            }
            let child = self.random.iter().find(|c| c.nested_in.as_deref() == Some(&re.grouping));
            let mut lhs = String::from("1");
            for s in &re.slopes {
                lhs.push_str(" + ");
                lhs.push_str(s);
            }
            match child {
                Some(c) => parts.push(format!("({}|{}/{})", lhs, re.grouping, c.grouping)),
                None => parts.push(format!("({}|{})", lhs, re.grouping)),
            }
        }
        format!("{} ~ {}", self.outcome, parts.join(" + "))
    }
}

impl fmt::Display for Formula {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_formula_string())
    }
}

impl FromStr for Formula {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Formula::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_term_identity_ignores_order() {
        let a = Term::interaction(["x1", "x2"]);
        let b = Term::interaction(["x2", "x1"]);
        assert_eq!(a, b);
        assert_eq!(a.name(), "x1:x2");
        assert_ne!(a, Term::main("x1"));
    }

    #[test]
    fn test_cross_collapses_repeats() {
        let t = Term::main("a").cross(&Term::interaction(["a", "b"]));
        assert_eq!(t.components(), &["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_display_round_trips() {
        let f = Formula::parse("score = x1*x2 + (1 + x1|school)").unwrap();
        let s = f.to_string();
        assert_eq!(s, "score ~ x1 + x2 + x1:x2 + (1 + x1|school)");
        assert_eq!(Formula::parse(&s).unwrap(), f);
    }

    #[test]
    fn test_slope_must_be_fixed_effect() {
        let err = Formula::parse("y ~ x1 + (1 + z|g)").unwrap_err();
        assert!(matches!(err, Error::Formula(_)));
    }
}
