//! Cluster specifications and their resolution into group memberships.
//!
//! Observations are assigned to clusters in balanced contiguous blocks, so
//! cluster sizes differ by at most one. A nested child with `Count(k)` gets
//! `k` children inside every parent.

use serde::{Deserialize, Serialize};

use ps_core::{Error, Grouping, Result};

/// Hard floor on observations per leaf cluster.
pub const MIN_CLUSTER_SIZE: usize = 5;
/// Leaf clusters smaller than this trigger a warning.
pub const WARN_CLUSTER_SIZE: usize = 10;

/// How the number of clusters follows from the sample size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterSizing {
    /// Fixed number of clusters (per parent for nested levels).
    Count(usize),
    /// Fixed observations per cluster; the count is derived from the sample size.
    Size(usize),
}

/// One grouping variable of a clustered design.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterSpec {
    /// Grouping variable (must appear in a random-effect term).
    pub grouping: String,
    /// Intraclass correlation, `0` or within `[0.1, 0.9]`.
    pub icc: f64,
    /// Cluster count or size.
    pub sizing: ClusterSizing,
    /// Parent grouping for a nested level.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    /// Predictors with random slopes; empty means "as in the formula".
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub random_slopes: Vec<String>,
    /// Variance of each random slope.
    #[serde(default)]
    pub slope_variance: f64,
    /// Correlation between the random intercept and each slope.
    #[serde(default)]
    pub slope_intercept_corr: f64,
}

impl ClusterSpec {
    /// Random-intercept cluster.
    pub fn new(grouping: impl Into<String>, icc: f64, sizing: ClusterSizing) -> Self {
        Self {
            grouping: grouping.into(),
            icc,
            sizing,
            parent: None,
            random_slopes: Vec::new(),
            slope_variance: 0.0,
            slope_intercept_corr: 0.0,
        }
    }

    /// Nest this level inside `parent`.
    pub fn nested_in(mut self, parent: impl Into<String>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    /// Add random slopes with a common variance and intercept correlation.
    pub fn with_random_slopes<I, S>(mut self, slopes: I, variance: f64, corr: f64) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.random_slopes = slopes.into_iter().map(Into::into).collect();
        self.slope_variance = variance;
        self.slope_intercept_corr = corr;
        self
    }

    /// Check parameters that do not depend on the sample size.
    pub fn validate(&self) -> Result<()> {
        validate_icc(&self.grouping, self.icc)?;
        match self.sizing {
            ClusterSizing::Count(0) => {
                return Err(Error::Config(format!(
                    "cluster '{}' needs at least one cluster",
                    self.grouping
                )));
            }
            ClusterSizing::Size(m) if m < MIN_CLUSTER_SIZE => {
                return Err(Error::Config(format!(
                    "cluster '{}' size {} is below the minimum of {}",
                    self.grouping, m, MIN_CLUSTER_SIZE
                )));
            }
            _ => {}
        }
        if !(self.slope_variance >= 0.0 && self.slope_variance.is_finite()) {
            return Err(Error::Config(format!(
                "cluster '{}' slope variance must be >= 0",
                self.grouping
            )));
        }
        if !(self.slope_intercept_corr.abs() <= 1.0) {
            return Err(Error::Config(format!(
                "cluster '{}' slope-intercept correlation must be in [-1, 1]",
                self.grouping
            )));
        }
        if self.parent.as_deref() == Some(self.grouping.as_str()) {
            return Err(Error::Config(format!("cluster '{}' cannot nest in itself", self.grouping)));
        }
        Ok(())
    }
}

/// ICC must be 0 or lie in `[0.1, 0.9]`.
pub fn validate_icc(grouping: &str, icc: f64) -> Result<()> {
    if icc == 0.0 || (0.1..=0.9).contains(&icc) {
        Ok(())
    } else {
        Err(Error::Config(format!(
            "ICC for '{}' must be 0 or within [0.1, 0.9], got {}",
            grouping, icc
        )))
    }
}

/// Group memberships for one sample size.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterLayout {
    /// Top-level clusters.
    pub primary: Grouping,
    /// Nested clusters, numbered globally.
    pub nested: Option<Grouping>,
    /// Smallest leaf cluster.
    pub min_cluster_size: usize,
    /// Variance inflation of the clustered design.
    pub design_effect: f64,
}

/// Cluster ids `0..k` over `n` observations in balanced contiguous blocks.
pub fn balanced_ids(n: usize, k: usize) -> Vec<usize> {
    (0..n).map(|i| i * k / n).collect()
}

fn group_sizes(ids: &[usize], k: usize) -> Vec<usize> {
    let mut sizes = vec![0usize; k];
    for &g in ids {
        sizes[g] += 1;
    }
    sizes
}

fn n_clusters(spec: &ClusterSpec, n: usize) -> usize {
    match spec.sizing {
        ClusterSizing::Count(k) => k,
        ClusterSizing::Size(m) => (n / m).max(1),
    }
}

impl ClusterLayout {
    /// Resolve a primary spec and an optional nested child for `n` observations.
    pub fn resolve(primary: &ClusterSpec, child: Option<&ClusterSpec>, n: usize) -> Result<Self> {
        let k = n_clusters(primary, n);
        if k == 0 || n < k {
            return Err(Error::Config(format!(
                "insufficient observations per cluster: {} observations for {} '{}' clusters",
                n, k, primary.grouping
            )));
        }
        let primary_ids = balanced_ids(n, k);
        let primary_sizes = group_sizes(&primary_ids, k);
        let mean_primary = n as f64 / k as f64;

        let (nested, leaf_sizes, design_effect) = match child {
            None => {
                let de = 1.0 + (mean_primary - 1.0) * primary.icc;
                (None, primary_sizes, de)
            }
            Some(c) => {
                let per_parent = match c.sizing {
                    ClusterSizing::Count(k) => k,
                    ClusterSizing::Size(m) => (n / k / m).max(1),
                };
                let mut ids = Vec::with_capacity(n);
                for (parent, &size) in primary_sizes.iter().enumerate() {
                    ids.extend(balanced_ids(size, per_parent).into_iter().map(|l| parent * per_parent + l));
                }
                let total = k * per_parent;
                let sizes = group_sizes(&ids, total);
                let mean_child = n as f64 / total as f64;
                let de = 1.0 + (mean_child - 1.0) * c.icc + (mean_primary - 1.0) * primary.icc;
                (Some(Grouping { ids, n_groups: total }), sizes, de)
            }
        };

        let min_cluster_size = leaf_sizes.iter().copied().min().unwrap_or(0);
        let leaf_name = child.map(|c| c.grouping.as_str()).unwrap_or(&primary.grouping);
        if min_cluster_size < MIN_CLUSTER_SIZE {
            return Err(Error::Config(format!(
                "insufficient observations per cluster: '{}' clusters get {} observations at n = {} (minimum {})",
                leaf_name, min_cluster_size, n, MIN_CLUSTER_SIZE
            )));
        }
        if min_cluster_size < WARN_CLUSTER_SIZE {
            log::warn!(
                "'{}' clusters have only {} observations at n = {}; variance components may be unstable",
                leaf_name,
                min_cluster_size,
                n
            );
        }

        Ok(Self {
            primary: Grouping { ids: primary_ids, n_groups: k },
            nested,
            min_cluster_size,
            design_effect,
        })
    }
}
