//! Tunnel level ↔ volume conversion
//!
//! The calibration table is interpolated linearly between samples and
//! extrapolated with the slope of the outermost segment, so both directions are
//! total and strictly monotonic. When no table is available the tunnel is
//! approximated as a prism (`volume = slope * level + offset`), which is
//! flagged as reduced fidelity.

use serde::{Deserialize, Serialize};
use std::{io, path::Path};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum GeometryError {
    #[error("calibration table needs at least 2 points, got {0}")]
    TooFewPoints(usize),

    #[error("calibration {column} must be strictly increasing (row {row})")]
    NotStrictlyIncreasing { column: &'static str, row: usize },

    #[error("calibration row {0} contains a non-finite value")]
    NonFinite(usize),

    #[error("calibration CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("calibration file error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibrationPoint {
    pub level_m: f64,
    pub volume_m3: f64,
}

/// Level/volume samples, both columns strictly increasing
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CalibrationTable {
    points: Vec<CalibrationPoint>,
}

impl CalibrationTable {
    pub fn new(points: Vec<CalibrationPoint>) -> Result<Self, GeometryError> {
        if points.len() < 2 {
            return Err(GeometryError::TooFewPoints(points.len()));
        }
        for (row, p) in points.iter().enumerate() {
            if !p.level_m.is_finite() || !p.volume_m3.is_finite() {
                return Err(GeometryError::NonFinite(row));
            }
        }
        for (row, w) in points.windows(2).enumerate() {
            if w[1].level_m <= w[0].level_m {
                return Err(GeometryError::NotStrictlyIncreasing {
                    column: "level",
                    row: row + 1,
                });
            }
            if w[1].volume_m3 <= w[0].volume_m3 {
                return Err(GeometryError::NotStrictlyIncreasing {
                    column: "volume",
                    row: row + 1,
                });
            }
        }
        Ok(Self { points })
    }

    /// Reads a headed CSV whose first column is level (m) and second volume (m³).
    pub fn from_csv_reader<R: io::Read>(reader: R) -> Result<Self, GeometryError> {
        let mut rdr = csv::ReaderBuilder::new()
            .has_headers(true)
            .trim(csv::Trim::All)
            .from_reader(reader);
        let mut points = Vec::new();
        for record in rdr.records() {
            let record = record?;
            let level = record.get(0).and_then(|s| s.parse::<f64>().ok());
            let volume = record.get(1).and_then(|s| s.parse::<f64>().ok());
            match (level, volume) {
                (Some(level_m), Some(volume_m3)) => points.push(CalibrationPoint { level_m, volume_m3 }),
                _ => return Err(GeometryError::NonFinite(points.len())),
            }
        }
        Self::new(points)
    }

    pub fn from_csv_path(path: impl AsRef<Path>) -> Result<Self, GeometryError> {
        let file = std::fs::File::open(path)?;
        Self::from_csv_reader(file)
    }

    pub fn points(&self) -> &[CalibrationPoint] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

/// Whether conversions come from a measured table or the prism approximation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GeometryFidelity {
    Calibrated,
    AffineFallback,
}

#[derive(Debug, Clone)]
enum Shape {
    Interpolated { levels: Vec<f64>, volumes: Vec<f64> },
    Affine { slope_m2: f64, offset_m3: f64 },
}

#[derive(Debug, Clone)]
pub struct TankGeometry {
    shape: Shape,
}

impl TankGeometry {
    pub fn from_table(table: &CalibrationTable) -> Self {
        Self {
            shape: Shape::Interpolated {
                levels: table.points.iter().map(|p| p.level_m).collect(),
                volumes: table.points.iter().map(|p| p.volume_m3).collect(),
            },
        }
    }

    /// Prism approximation; `slope_m2` is the effective plan area and must be positive.
    pub fn affine(slope_m2: f64, offset_m3: f64) -> Self {
        Self {
            shape: Shape::Affine { slope_m2, offset_m3 },
        }
    }

    /// Load the calibration table if one is configured, otherwise fall back to the
    /// affine approximation. The fallback is never silent.
    pub fn load_or_fallback(path: Option<&Path>, slope_m2: f64, offset_m3: f64) -> Self {
        let Some(path) = path else {
            warn!(
                slope_m2,
                offset_m3,
                "no calibration table configured, using affine level/volume approximation (reduced fidelity)"
            );
            return Self::affine(slope_m2, offset_m3);
        };
        match CalibrationTable::from_csv_path(path) {
            Ok(table) => {
                info!(path = %path.display(), points = table.len(), "loaded tunnel calibration table");
                Self::from_table(&table)
            }
            Err(e) => {
                warn!(
                    path = %path.display(),
                    error = %e,
                    "calibration table unavailable, using affine level/volume approximation (reduced fidelity)"
                );
                Self::affine(slope_m2, offset_m3)
            }
        }
    }

    pub fn fidelity(&self) -> GeometryFidelity {
        match self.shape {
            Shape::Interpolated { .. } => GeometryFidelity::Calibrated,
            Shape::Affine { .. } => GeometryFidelity::AffineFallback,
        }
    }

    pub fn volume_of(&self, level_m: f64) -> f64 {
        match &self.shape {
            Shape::Interpolated { levels, volumes } => interpolate(levels, volumes, level_m),
            Shape::Affine { slope_m2, offset_m3 } => slope_m2 * level_m + offset_m3,
        }
    }

    pub fn level_of(&self, volume_m3: f64) -> f64 {
        match &self.shape {
            Shape::Interpolated { levels, volumes } => interpolate(volumes, levels, volume_m3),
            Shape::Affine { slope_m2, offset_m3 } => (volume_m3 - offset_m3) / slope_m2,
        }
    }

    /// Local slope of `level_of`, right-continuous at table knots.
    pub fn dlevel_dvolume(&self, volume_m3: f64) -> f64 {
        match &self.shape {
            Shape::Interpolated { levels, volumes } => {
                let i = segment(volumes, volume_m3);
                (levels[i + 1] - levels[i]) / (volumes[i + 1] - volumes[i])
            }
            Shape::Affine { slope_m2, .. } => 1.0 / slope_m2,
        }
    }

    /// Continuously differentiable variant of `level_of` for gradient-based
    /// solvers. Around each interior knot the slope is blended linearly over a
    /// band of `band_fraction` times the shorter adjacent segment (capped at
    /// one half); outside the bands it equals the exact interpolant.
    pub fn smoothed_level(&self, band_fraction: f64) -> SmoothedLevel {
        let fraction = band_fraction.clamp(0.0, 0.5);
        match &self.shape {
            Shape::Interpolated { levels, volumes } => SmoothedLevel::new(volumes.clone(), levels.clone(), fraction),
            Shape::Affine { slope_m2, offset_m3 } => {
                SmoothedLevel::new(vec![*offset_m3, offset_m3 + slope_m2], vec![0.0, 1.0], fraction)
            }
        }
    }
}

/// Volume → level map with C¹ quadratic blends across the table knots.
#[derive(Debug, Clone)]
pub struct SmoothedLevel {
    volumes: Vec<f64>,
    levels: Vec<f64>,
    /// One per segment
    slopes: Vec<f64>,
    /// Half-width per knot; zero at both ends
    bands: Vec<f64>,
}

impl SmoothedLevel {
    fn new(volumes: Vec<f64>, levels: Vec<f64>, fraction: f64) -> Self {
        let slopes: Vec<f64> = volumes
            .windows(2)
            .zip(levels.windows(2))
            .map(|(v, l)| (l[1] - l[0]) / (v[1] - v[0]))
            .collect();
        let n = volumes.len();
        let bands = (0..n)
            .map(|k| {
                if k == 0 || k + 1 == n {
                    0.0
                } else {
                    fraction * (volumes[k] - volumes[k - 1]).min(volumes[k + 1] - volumes[k])
                }
            })
            .collect();
        Self {
            volumes,
            levels,
            slopes,
            bands,
        }
    }

    /// Knot whose band contains `volume_m3`, with the offset from the band start.
    fn blend(&self, volume_m3: f64) -> Option<(usize, f64)> {
        let i = segment(&self.volumes, volume_m3);
        [i, i + 1].into_iter().find_map(|k| {
            let band = *self.bands.get(k)?;
            let t = volume_m3 - (self.volumes[k] - band);
            (band > 0.0 && (0.0..=2.0 * band).contains(&t)).then_some((k, t))
        })
    }

    pub fn level_of(&self, volume_m3: f64) -> f64 {
        if let Some((k, t)) = self.blend(volume_m3) {
            let (before, after, band) = (self.slopes[k - 1], self.slopes[k], self.bands[k]);
            return self.levels[k] - band * before + before * t + (after - before) * t * t / (4.0 * band);
        }
        let i = segment(&self.volumes, volume_m3);
        self.levels[i] + (volume_m3 - self.volumes[i]) * self.slopes[i]
    }

    pub fn dlevel_dvolume(&self, volume_m3: f64) -> f64 {
        if let Some((k, t)) = self.blend(volume_m3) {
            let (before, after, band) = (self.slopes[k - 1], self.slopes[k], self.bands[k]);
            return before + (after - before) * t / (2.0 * band);
        }
        self.slopes[segment(&self.volumes, volume_m3)]
    }
}

/// Index of the segment used for `x`; outer segments extend to infinity.
fn segment(xs: &[f64], x: f64) -> usize {
    let above = xs.partition_point(|&v| v <= x);
    above.saturating_sub(1).min(xs.len() - 2)
}

fn interpolate(xs: &[f64], ys: &[f64], x: f64) -> f64 {
    let i = segment(xs, x);
    ys[i] + (x - xs[i]) * (ys[i + 1] - ys[i]) / (xs[i + 1] - xs[i])
}
