//! Target-test selector strings.
//!
//! Comma-separated items, resolved left to right:
//! - `all`: the overall test and every non-intercept design column
//! - `overall`
//! - a design column (`x1`, `cyl[2]`, `x1:x2` in any component order) or a
//!   factor name, which selects all of its dummy columns
//! - `cyl[1] vs cyl[3]`: pairwise contrast between two factor levels
//! - `posthoc`: every pairwise contrast of every factor main effect
//! - `-item`: drop what `item` selects; a selector made only of exclusions
//!   starts from `all`
//!
//! Selecting the same test twice is an error.

use std::collections::HashMap;

use ps_core::{Error, Result};
use ps_formula::{DesignLayout, FactorLevels, INTERCEPT};
use ps_inference::{PlannedTest, TestId, TestKind};

fn sorted_parts(name: &str) -> Vec<&str> {
    let mut parts: Vec<&str> = name.split(':').map(str::trim).collect();
    parts.sort_unstable();
    parts
}

/// Design column by name; interaction components may come in any order.
pub fn find_column(layout: &DesignLayout, name: &str) -> Option<usize> {
    let name = name.trim();
    if let Some(i) = layout.index_of(name) {
        return Some(i);
    }
    let wanted = sorted_parts(name);
    layout.columns().iter().position(|c| sorted_parts(&c.name) == wanted)
}

/// Split `cyl[2]` into `("cyl", "2")`.
fn parse_level(s: &str) -> Option<(&str, &str)> {
    let s = s.trim();
    let open = s.find('[')?;
    let inner = s[open + 1..].strip_suffix(']')?;
    Some((s[..open].trim(), inner.trim()))
}

/// Resolves selector strings against one design.
#[derive(Debug, Clone, Copy)]
pub struct TestSelector<'a> {
    layout: &'a DesignLayout,
    factors: &'a HashMap<String, FactorLevels>,
}

impl<'a> TestSelector<'a> {
    /// Selector over `layout` with the given factor levels.
    pub fn new(layout: &'a DesignLayout, factors: &'a HashMap<String, FactorLevels>) -> Self {
        Self { layout, factors }
    }

    fn coefficient(&self, column: usize) -> PlannedTest {
        PlannedTest {
            id: TestId::Coefficient(self.layout.columns()[column].name.clone()),
            kind: TestKind::Coefficient { column },
        }
    }

    fn all(&self) -> Vec<PlannedTest> {
        let mut out = vec![PlannedTest { id: TestId::Overall, kind: TestKind::Overall }];
        out.extend(
            self.layout
                .columns()
                .iter()
                .enumerate()
                .filter(|(_, c)| c.name != INTERCEPT)
                .map(|(i, _)| self.coefficient(i)),
        );
        out
    }

    /// Factors that enter the formula as main effects, in column order.
    fn main_factors(&self) -> Vec<&'a str> {
        let mut out: Vec<&str> = Vec::new();
        for c in self.layout.columns() {
            if let [part] = c.parts.as_slice() {
                if part.level.is_some() && !out.contains(&part.variable.as_str()) {
                    out.push(part.variable.as_str());
                }
            }
        }
        out
    }

    fn contrast(&self, factor: &str, a: &str, b: &str) -> Result<PlannedTest> {
        let levels = self.factors.get(factor).ok_or_else(|| {
            Error::Config(format!("'{}' is not a factor; contrasts need factor levels", factor))
        })?;
        if !self.main_factors().contains(&factor) {
            return Err(Error::Config(format!(
                "factor '{}' is not a main effect in the formula",
                factor
            )));
        }
        for level in [a, b] {
            if !levels.contains(level) {
                return Err(Error::Config(format!("factor '{}' has no level '{}'", factor, level)));
            }
        }
        if a == b {
            return Err(Error::Config(format!("contrast compares level '{}' with itself", a)));
        }
        let column = |level: &str| {
            levels.dummy_index(level).and_then(|_| self.layout.index_of(&format!("{}[{}]", factor, level)))
        };
        Ok(PlannedTest {
            id: TestId::Contrast { factor: factor.to_string(), a: a.to_string(), b: b.to_string() },
            kind: TestKind::Contrast { a: column(a), b: column(b), n_levels: levels.n_levels() },
        })
    }

    fn posthoc(&self) -> Result<Vec<PlannedTest>> {
        let mut out = Vec::new();
        for factor in self.main_factors() {
            if let Some(levels) = self.factors.get(factor) {
                let names = levels.names();
                for i in 0..names.len() {
                    for j in (i + 1)..names.len() {
                        out.push(self.contrast(factor, &names[i], &names[j])?);
                    }
                }
            }
        }
        Ok(out)
    }

    fn item(&self, item: &str) -> Result<Vec<PlannedTest>> {
        let lower = item.to_ascii_lowercase();
        match lower.as_str() {
            "all" => return Ok(self.all()),
            "overall" => return Ok(vec![PlannedTest { id: TestId::Overall, kind: TestKind::Overall }]),
            "posthoc" | "all-posthoc" => return self.posthoc(),
            _ => {}
        }
        if let Some((left, right)) = item.split_once(" vs ") {
            let (fa, la) = parse_level(left)
                .ok_or_else(|| Error::Config(format!("contrast side '{}' must look like factor[level]", left.trim())))?;
            let (fb, lb) = parse_level(right)
                .ok_or_else(|| Error::Config(format!("contrast side '{}' must look like factor[level]", right.trim())))?;
            if fa != fb {
                return Err(Error::Config(format!(
                    "contrast '{}' compares levels of different factors",
                    item
                )));
            }
            return Ok(vec![self.contrast(fa, la, lb)?]);
        }
        if let Some(column) = find_column(self.layout, item).filter(|&c| c != 0) {
            return Ok(vec![self.coefficient(column)]);
        }
        let term: Vec<usize> = self.layout.term_columns(item).collect();
        if !term.is_empty() && self.factors.contains_key(item) {
            return Ok(term.into_iter().map(|c| self.coefficient(c)).collect());
        }
        Err(Error::Config(format!(
            "unknown test '{}' (available: overall, {})",
            item,
            self.layout.names()[1..].join(", ")
        )))
    }

    /// Resolve a selector string into planned tests, in selection order.
    pub fn resolve(&self, selector: &str) -> Result<Vec<PlannedTest>> {
        let items: Vec<&str> = selector.split(',').map(str::trim).filter(|s| !s.is_empty()).collect();
        let only_exclusions = items.iter().all(|s| s.starts_with('-'));
        let mut selected: Vec<PlannedTest> = if only_exclusions { self.all() } else { Vec::new() };

        for item in items {
            if let Some(rest) = item.strip_prefix('-') {
                for t in self.item(rest.trim())? {
                    let before = selected.len();
                    selected.retain(|s| s.id != t.id);
                    if selected.len() == before {
                        return Err(Error::Config(format!("cannot exclude '{}': it is not selected", t.id)));
                    }
                }
            } else {
                for t in self.item(item)? {
                    if selected.iter().any(|s| s.id == t.id) {
                        return Err(Error::Config(format!("test '{}' is requested more than once", t.id)));
                    }
                    selected.push(t);
                }
            }
        }
        if selected.is_empty() {
            return Err(Error::Config(format!("selector '{}' selects no tests", selector)));
        }
        Ok(selected)
    }
}
