//! Dummy coding and design-matrix layout.
//!
//! A factor with `k` levels contributes `k − 1` reference-coded columns. An
//! interaction touching factors expands to the Cartesian product of the
//! non-reference dummies of each factor component.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::OnceLock;

use ps_core::{Error, Result};

use crate::formula::{Formula, Term};

/// Name of the intercept column.
pub const INTERCEPT: &str = "(Intercept)";

/// Ordered levels of a categorical predictor with one reference level.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FactorLevels {
    names: Vec<String>,
    reference: usize,
    #[serde(skip)]
    index: OnceLock<HashMap<String, usize>>,
}

impl FactorLevels {
    /// Default levels `"1".."k"` with reference `"1"`.
    pub fn from_count(k: usize) -> Result<Self> {
        Self::with_names((1..=k).map(|i| i.to_string()).collect(), None)
    }

    /// Named levels; the reference defaults to the first name.
    pub fn with_names(names: Vec<String>, reference: Option<&str>) -> Result<Self> {
        if names.len() < 2 {
            return Err(Error::Config(format!(
                "a factor needs at least 2 levels, got {}",
                names.len()
            )));
        }
        for (i, n) in names.iter().enumerate() {
            if names[..i].contains(n) {
                return Err(Error::Config(format!("duplicate factor level '{}'", n)));
            }
        }
        let reference = match reference {
            None => 0,
            Some(r) => names.iter().position(|n| n == r).ok_or_else(|| {
                Error::Config(format!("reference level '{}' is not among the levels", r))
            })?,
        };
        Ok(Self { names, reference, index: OnceLock::new() })
    }

    /// Number of levels.
    pub fn n_levels(&self) -> usize {
        self.names.len()
    }

    /// Level names in declaration order.
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Position of the reference level.
    pub fn reference(&self) -> usize {
        self.reference
    }

    /// Name of the reference level.
    pub fn reference_name(&self) -> &str {
        &self.names[self.reference]
    }

    /// Level positions (excluding the reference) in dummy-column order.
    pub fn dummy_levels(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.names.len()).filter(move |&i| i != self.reference)
    }

    fn map(&self) -> &HashMap<String, usize> {
        self.index.get_or_init(|| {
            self.dummy_levels()
                .enumerate()
                .map(|(d, lvl)| (self.names[lvl].clone(), d))
                .collect()
        })
    }

    /// Dummy-column index of `level`, or `None` for the reference (and unknown levels).
    pub fn dummy_index(&self, level: &str) -> Option<usize> {
        self.map().get(level).copied()
    }

    /// `true` if `level` names a level of this factor.
    pub fn contains(&self, level: &str) -> bool {
        self.names.iter().any(|n| n == level)
    }
}

/// One factor of a design column: a continuous value, or an indicator of `level`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnPart {
    /// Predictor name.
    pub variable: String,
    /// Level position for factor indicators; `None` for numeric predictors.
    pub level: Option<usize>,
}

/// A single column of the expanded design matrix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesignColumn {
    /// Column name, e.g. `x1`, `cyl[2]`, `x1:cyl[2]`.
    pub name: String,
    /// Name of the formula term this column belongs to.
    pub term: String,
    /// Product components: the column value is the product of all parts.
    pub parts: Vec<ColumnPart>,
}

/// Ordered design columns after dummy expansion; column 0 is the intercept.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesignLayout {
    columns: Vec<DesignColumn>,
}

impl DesignLayout {
    /// All columns, intercept first.
    pub fn columns(&self) -> &[DesignColumn] {
        &self.columns
    }

    /// Number of columns including the intercept.
    pub fn n_columns(&self) -> usize {
        self.columns.len()
    }

    /// Position of a column by name.
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    /// Column names, intercept first.
    pub fn names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    /// Columns belonging to the named term.
    pub fn term_columns<'a>(&'a self, term: &'a str) -> impl Iterator<Item = usize> + 'a {
        self.columns.iter().enumerate().filter(move |(_, c)| c.term == term).map(|(i, _)| i)
    }
}

fn expand_term(term: &Term, levels: &HashMap<String, FactorLevels>) -> Vec<DesignColumn> {
    // Each component contributes one or more (label, part) choices.
    let mut acc: Vec<(Vec<String>, Vec<ColumnPart>)> = vec![(Vec::new(), Vec::new())];
    for var in term.components() {
        let choices: Vec<(String, ColumnPart)> = match levels.get(var) {
            Some(fl) => fl
                .dummy_levels()
                .map(|lvl| {
                    (
                        format!("{}[{}]", var, fl.names()[lvl]),
                        ColumnPart { variable: var.clone(), level: Some(lvl) },
                    )
                })
                .collect(),
            None => vec![(var.clone(), ColumnPart { variable: var.clone(), level: None })],
        };
        let mut next = Vec::with_capacity(acc.len() * choices.len());
        for (labels, parts) in &acc {
            for (label, part) in &choices {
                let mut l = labels.clone();
                l.push(label.clone());
                let mut p = parts.clone();
                p.push(part.clone());
                next.push((l, p));
            }
        }
        acc = next;
    }
    let term_name = term.name();
    acc.into_iter()
        .map(|(labels, parts)| DesignColumn { name: labels.join(":"), term: term_name.clone(), parts })
        .collect()
}

impl Formula {
    /// Expand fixed terms into design columns.
    ///
    /// `levels` maps every factor predictor to its levels; predictors absent
    /// from the map are numeric.
    pub fn expand_design(&self, levels: &HashMap<String, FactorLevels>) -> DesignLayout {
        let mut columns = vec![DesignColumn {
            name: INTERCEPT.to_string(),
            term: INTERCEPT.to_string(),
            parts: Vec::new(),
        }];
        for t in self.fixed_terms() {
            columns.extend(expand_term(t, levels));
        }
        DesignLayout { columns }
    }
}
