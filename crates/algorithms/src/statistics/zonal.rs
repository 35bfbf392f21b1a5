//! Zonal statistics
//!
//! Aggregates a derived raster over plot polygons. A cell belongs to a plot
//! when its centre lies strictly inside the polygon; no-data cells are
//! ignored. Plots are independent and may be processed in parallel.

use crate::imagery::{DerivedRaster, VegetationIndex};
use chrono::{DateTime, FixedOffset};
use geo::{BoundingRect, Contains};
use geo_types::Point;
use raster2sensor_core::{Error, PlotCollection, PlotGeometry, Raster, Result};
use raster2sensor_parallel::{ParallelStrategy, ProcessingMode};
use serde::Serialize;

/// Statistic values for one plot. Every value is NaN when `count == 0`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ZonalStats {
    pub count: usize,
    pub mean: f64,
    pub min: f64,
    pub max: f64,
    /// Population standard deviation
    pub std_dev: f64,
    pub median: f64,
}

impl ZonalStats {
    /// The "no data" sentinel for plots without valid pixels
    pub fn empty() -> Self {
        Self {
            count: 0,
            mean: f64::NAN,
            min: f64::NAN,
            max: f64::NAN,
            std_dev: f64::NAN,
            median: f64::NAN,
        }
    }

    pub fn has_data(&self) -> bool {
        self.count > 0
    }

    fn from_values(mut vals: Vec<f64>) -> Self {
        if vals.is_empty() {
            return Self::empty();
        }

        let count = vals.len();
        let mean = vals.iter().sum::<f64>() / count as f64;
        let var = vals.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / count as f64;

        vals.sort_by(f64::total_cmp);
        let median = if count % 2 == 0 {
            (vals[count / 2 - 1] + vals[count / 2]) / 2.0
        } else {
            vals[count / 2]
        };

        Self {
            count,
            mean,
            min: vals[0],
            max: vals[count - 1],
            std_dev: var.sqrt(),
            median,
        }
    }
}

/// Statistics of one index over one plot at one image timestamp
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ZonalStatisticResult {
    pub plot_id: String,
    pub index: VegetationIndex,
    pub timestamp: DateTime<FixedOffset>,
    pub stats: ZonalStats,
}

/// Compute statistics of `values` over a single plot.
///
/// A plot outside the raster, or covering only no-data cells, yields
/// [`ZonalStats::empty`]. Invalid geometry fails with
/// [`Error::InvalidGeometry`].
pub fn zonal_statistics(values: &Raster, plot: &PlotGeometry) -> Result<ZonalStats> {
    let geometry = plot.validated()?;
    let Some(bbox) = geometry.bounding_rect() else {
        return Err(Error::InvalidGeometry {
            plot_id: plot.plot_id.clone(),
            reason: "no bounding box".into(),
        });
    };

    let (rows, cols) = values.shape();
    let transform = values.transform();
    let bbox = (bbox.min().x, bbox.min().y, bbox.max().x, bbox.max().y);

    let Some(window) = transform.window_for_bbox(bbox, cols, rows) else {
        return Ok(ZonalStats::empty());
    };

    let mut selected = Vec::with_capacity(window.len());
    for row in window.rows.clone() {
        for col in window.cols.clone() {
            let (x, y) = transform.cell_center(col, row);
            if !geometry.contains(&Point::new(x, y)) {
                continue;
            }
            let v = values.data()[(row, col)];
            if !values.is_nodata(v) {
                selected.push(v);
            }
        }
    }

    Ok(ZonalStats::from_values(selected))
}

/// Aggregate a derived raster over every plot.
///
/// The outer error is a CRS mismatch between plots and raster, which fails
/// the whole (image, index) pair. Inner errors are per plot.
pub fn aggregate(
    derived: &DerivedRaster,
    plots: &PlotCollection,
    mode: ProcessingMode,
) -> Result<Vec<Result<ZonalStatisticResult>>> {
    if let (Some(plot_crs), Some(raster_crs)) = (plots.crs.as_ref(), derived.raster.crs()) {
        if !plot_crs.is_equivalent(raster_crs) {
            return Err(Error::CrsMismatch(
                plot_crs.identifier(),
                raster_crs.identifier(),
            ));
        }
    }

    let results = mode.par_map(0..plots.len(), |i| {
        let plot = &plots.plots[i];
        zonal_statistics(&derived.raster, plot).map(|stats| ZonalStatisticResult {
            plot_id: plot.plot_id.clone(),
            index: derived.index,
            timestamp: derived.timestamp,
            stats,
        })
    });

    tracing::debug!(
        index = %derived.index,
        plots = results.len(),
        with_data = results
            .iter()
            .filter(|r| matches!(r, Ok(z) if z.stats.has_data()))
            .count(),
        "aggregated zonal statistics"
    );

    Ok(results)
}
