//! Generation dimension policy: clamp to a range or snap to presets.

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::types::Dimensions;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum DimensionPolicy {
    /// Clamp each side into `[min, max]`.
    Clamp {
        min: u32,
        max: u32,
        default_width: u32,
        default_height: u32,
    },
    /// Snap to the preset with the closest aspect ratio, then the closest area.
    Presets { sizes: Vec<Dimensions> },
}

impl Default for DimensionPolicy {
    fn default() -> Self {
        DimensionPolicy::Clamp {
            min: 100,
            max: 512,
            default_width: 512,
            default_height: 512,
        }
    }
}

impl DimensionPolicy {
    pub fn validate(&self) -> Result<()> {
        match self {
            DimensionPolicy::Clamp {
                min,
                max,
                default_width,
                default_height,
            } => {
                if *min == 0 || min > max {
                    return Err(anyhow!("dimensions: require 0 < min <= max (got {min}..{max})"));
                }
                for side in [default_width, default_height] {
                    if side < min || side > max {
                        return Err(anyhow!(
                            "dimensions: default size {default_width}x{default_height} outside {min}..{max}"
                        ));
                    }
                }
            }
            DimensionPolicy::Presets { sizes } => {
                if sizes.is_empty() {
                    return Err(anyhow!("dimensions: presets must list at least one size"));
                }
                if let Some(bad) = sizes.iter().find(|d| d.width == 0 || d.height == 0) {
                    return Err(anyhow!("dimensions: preset {bad} has a zero side"));
                }
            }
        }
        Ok(())
    }

    /// Resolve a drafted request (if any) into the dimensions sent to the backend.
    pub fn resolve(&self, requested: Option<Dimensions>) -> Dimensions {
        match self {
            DimensionPolicy::Clamp {
                min,
                max,
                default_width,
                default_height,
            } => match requested {
                Some(req) => Dimensions::new(req.width.clamp(*min, *max), req.height.clamp(*min, *max)),
                None => Dimensions::new(*default_width, *default_height),
            },
            DimensionPolicy::Presets { sizes } => {
                let fallback = sizes.first().copied().unwrap_or(Dimensions::new(512, 512));
                match requested {
                    Some(req) if req.width > 0 && req.height > 0 => {
                        snap(sizes, req).unwrap_or(fallback)
                    }
                    _ => fallback,
                }
            }
        }
    }
}

fn snap(sizes: &[Dimensions], req: Dimensions) -> Option<Dimensions> {
    let aspect = |d: Dimensions| f64::from(d.width) / f64::from(d.height);
    let area = |d: Dimensions| u64::from(d.width) * u64::from(d.height);
    let target_aspect = aspect(req);
    let target_area = area(req);

    sizes.iter().copied().min_by(|a, b| {
        let da = (aspect(*a) / target_aspect).ln().abs();
        let db = (aspect(*b) / target_aspect).ln().abs();
        da.total_cmp(&db)
            .then_with(|| area(*a).abs_diff(target_area).cmp(&area(*b).abs_diff(target_area)))
    })
}
