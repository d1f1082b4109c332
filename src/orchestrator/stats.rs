//! Statistics collaborator
//!
//! Significance testing lives outside this crate. The orchestrator only needs
//! something that turns canonical rows into per-variation results, so it
//! talks to a [`StatsEngine`]. [`SummaryStatistics`] is the built-in engine:
//! means, standard deviations and relative uplift, with CUPED adjustment when
//! covariate moments are present. It never fills in intervals or p-values.

use crate::model::{
    AnalysisSettings, DimensionResult, MetricDefinition, MetricResult, MetricValueRow, Variation,
    VariationResult,
};
use crate::{Error, Result};
use std::collections::BTreeMap;

/// Rows and context for one analysis
pub struct AnalysisInput<'a> {
    pub settings: &'a AnalysisSettings,
    pub variations: &'a [Variation],
    pub metrics: &'a [MetricDefinition],
    pub rows: &'a [MetricValueRow],
}

pub trait StatsEngine: Send + Sync {
    fn analyze(&self, input: &AnalysisInput<'_>) -> Result<Vec<MetricResult>>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SummaryStatistics;

#[derive(Debug, Default, Clone, Copy)]
struct Moments {
    n: f64,
    sum: f64,
    sum_squares: f64,
    cov_sum: f64,
    cov_sum_squares: f64,
    product: f64,
    has_covariate: bool,
}

impl Moments {
    fn add(&mut self, row: &MetricValueRow) {
        self.n += row.users as f64;
        self.sum += row.main_sum;
        self.sum_squares += row.main_sum_squares;
        if let (Some(cs), Some(css), Some(p)) = (
            row.covariate_sum,
            row.covariate_sum_squares,
            row.main_covariate_sum_product,
        ) {
            self.cov_sum += cs;
            self.cov_sum_squares += css;
            self.product += p;
            self.has_covariate = true;
        }
    }

    fn mean(&self) -> f64 {
        if self.n > 0.0 {
            self.sum / self.n
        } else {
            0.0
        }
    }

    fn variance(&self) -> f64 {
        if self.n > 1.0 {
            ((self.sum_squares - self.sum * self.sum / self.n) / (self.n - 1.0)).max(0.0)
        } else {
            0.0
        }
    }

    fn cov_mean(&self) -> f64 {
        if self.n > 0.0 {
            self.cov_sum / self.n
        } else {
            0.0
        }
    }
}

/// CUPED coefficient from moments pooled across variations
fn theta(pooled: &Moments) -> Option<f64> {
    if !pooled.has_covariate || pooled.n < 2.0 {
        return None;
    }
    let cov = (pooled.product - pooled.sum * pooled.cov_sum / pooled.n) / (pooled.n - 1.0);
    let var = (pooled.cov_sum_squares - pooled.cov_sum * pooled.cov_sum / pooled.n) / (pooled.n - 1.0);
    (var > 0.0).then(|| cov / var)
}

impl SummaryStatistics {
    fn selected<'v>(
        settings: &AnalysisSettings,
        variations: &'v [Variation],
    ) -> Result<Vec<(usize, &'v Variation)>> {
        if settings.baseline_variation_index >= variations.len() {
            return Err(Error::InvalidRequest(format!(
                "baseline variation {} does not exist",
                settings.baseline_variation_index
            )));
        }
        Ok(variations
            .iter()
            .enumerate()
            .filter(|(i, _)| {
                *i == settings.baseline_variation_index
                    || settings
                        .variation_filter
                        .as_ref()
                        .map_or(true, |keep| keep.contains(i))
            })
            .collect())
    }

    fn dimension_result(
        &self,
        input: &AnalysisInput<'_>,
        name: &str,
        by_variation: &BTreeMap<&str, Moments>,
    ) -> Result<DimensionResult> {
        let selected = Self::selected(input.settings, input.variations)?;

        let mut pooled = Moments::default();
        for (_, variation) in &selected {
            if let Some(m) = by_variation.get(variation.key.as_str()) {
                pooled.n += m.n;
                pooled.sum += m.sum;
                pooled.cov_sum += m.cov_sum;
                pooled.cov_sum_squares += m.cov_sum_squares;
                pooled.product += m.product;
                pooled.has_covariate |= m.has_covariate;
            }
        }
        let theta = if input.settings.regression_adjusted {
            theta(&pooled)
        } else {
            None
        };
        let pooled_cov_mean = pooled.cov_mean();

        let adjusted_mean = |m: &Moments| match theta {
            Some(theta) => m.mean() - theta * (m.cov_mean() - pooled_cov_mean),
            None => m.mean(),
        };

        let baseline_key = input.variations[input.settings.baseline_variation_index]
            .key
            .as_str();
        let baseline_mean = by_variation
            .get(baseline_key)
            .map(adjusted_mean)
            .unwrap_or(0.0);

        let variations = selected
            .iter()
            .map(|(index, variation)| {
                let m = by_variation
                    .get(variation.key.as_str())
                    .copied()
                    .unwrap_or_default();
                let mean = adjusted_mean(&m);
                let uplift = (*index != input.settings.baseline_variation_index
                    && baseline_mean != 0.0)
                    .then(|| (mean - baseline_mean) / baseline_mean.abs());
                VariationResult {
                    variation: variation.key.clone(),
                    users: m.n as u64,
                    sum: m.sum,
                    mean,
                    stddev: m.variance().sqrt(),
                    uplift,
                    ci: None,
                    p_value: None,
                    chance_to_win: None,
                }
            })
            .collect();

        Ok(DimensionResult {
            name: name.to_string(),
            variations,
        })
    }
}

impl StatsEngine for SummaryStatistics {
    fn analyze(&self, input: &AnalysisInput<'_>) -> Result<Vec<MetricResult>> {
        let mut results = Vec::with_capacity(input.metrics.len());
        for metric in input.metrics {
            // dimension -> variation -> moments
            let mut grouped: BTreeMap<&str, BTreeMap<&str, Moments>> = BTreeMap::new();
            for row in input.rows.iter().filter(|r| r.metric_id == metric.id) {
                grouped
                    .entry(row.dimension.as_str())
                    .or_default()
                    .entry(row.variation.as_str())
                    .or_default()
                    .add(row);
            }

            let dimensions = grouped
                .iter()
                .map(|(name, by_variation)| self.dimension_result(input, name, by_variation))
                .collect::<Result<Vec<_>>>()?;

            results.push(MetricResult {
                metric_id: metric.id.clone(),
                dimensions,
            });
        }
        Ok(results)
    }
}
