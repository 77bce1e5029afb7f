//! Sample rasters and ocean masks.
//!
//! Rasters travel through the NetCDF command-line tools: samples are read from
//! `ncks --json` output and masks are written as CDL for `ncgen`.
use crate::error::{PipelineError, Result};
use serde_json::Value;
use std::fmt::Write as _;

/// A single 2-D field sampled from a forcing product, row-major (y, x).
#[derive(Debug, Clone, PartialEq)]
pub struct SampleGrid {
    pub y_name: String,
    pub x_name: String,
    pub y: Vec<f64>,
    pub x: Vec<f64>,
    /// `None` marks a missing value.
    pub values: Vec<Option<f64>>,
}

/// Boolean ocean mask on the sample grid; `true` is ocean.
#[derive(Debug, Clone, PartialEq)]
pub struct OceanMask {
    pub y_name: String,
    pub x_name: String,
    pub y: Vec<f64>,
    pub x: Vec<f64>,
    pub ocean: Vec<bool>,
}

impl SampleGrid {
    /// Decode `field` from the JSON printed by `ncks --json`.
    ///
    /// Leading dimensions (time, ensemble) must have length one and are
    /// squeezed away; the last two dimensions are the horizontal axes.
    pub fn from_ncks_json(json: &str, field: &str) -> Result<Self> {
        let doc: Value = serde_json::from_str(json)
            .map_err(|err| PipelineError::config(format!("parse ncks JSON: {err}")))?;
        let variables = doc
            .get("variables")
            .and_then(Value::as_object)
            .ok_or_else(|| PipelineError::config("ncks JSON has no variables"))?;
        let var = variables.get(field).ok_or_else(|| {
            PipelineError::config(format!("sample has no variable {field:?}"))
        })?;

        let shape: Vec<&str> = var
            .get("shape")
            .and_then(Value::as_array)
            .map(|dims| dims.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();
        let [leading @ .., y_name, x_name] = shape.as_slice() else {
            return Err(PipelineError::config(format!(
                "variable {field:?} is not two-dimensional"
            )));
        };

        let coordinate = |name: &str| -> Result<Vec<f64>> {
            let data = variables
                .get(name)
                .and_then(|coord| coord.get("data"))
                .ok_or_else(|| {
                    PipelineError::config(format!("sample has no coordinate {name:?}"))
                })?;
            let mut values = Vec::new();
            flatten(data, &mut values);
            values
                .into_iter()
                .map(|value| {
                    value.ok_or_else(|| {
                        PipelineError::config(format!("coordinate {name:?} has missing values"))
                    })
                })
                .collect()
        };
        let y = coordinate(*y_name)?;
        let x = coordinate(*x_name)?;

        let mut raw = Vec::new();
        flatten(
            var.get("data").ok_or_else(|| {
                PipelineError::config(format!("variable {field:?} has no data"))
            })?,
            &mut raw,
        );
        let expected = y.len() * x.len();
        if raw.len() != expected {
            return Err(PipelineError::config(format!(
                "variable {field:?} over {leading:?} has {} values, expected one {}x{} slice",
                raw.len(),
                y.len(),
                x.len()
            )));
        }

        let fills: Vec<f64> = ["_FillValue", "missing_value"]
            .iter()
            .filter_map(|attr| var.get("attributes").and_then(|attrs| attrs.get(*attr)))
            .filter_map(attribute_number)
            .collect();
        let values = raw
            .into_iter()
            .map(|value| value.filter(|v| !fills.contains(v)))
            .collect();

        Ok(SampleGrid {
            y_name: y_name.to_string(),
            x_name: x_name.to_string(),
            y,
            x,
            values,
        })
    }
}

impl OceanMask {
    /// Classify every cell with `is_ocean` and optionally round both
    /// coordinate axes to `decimals` places.
    pub fn derive(
        sample: &SampleGrid,
        is_ocean: impl Fn(Option<f64>) -> bool,
        decimals: Option<i32>,
    ) -> Self {
        let round = |axis: &[f64]| -> Vec<f64> {
            match decimals {
                Some(places) => {
                    let scale = 10f64.powi(places);
                    axis.iter().map(|v| (v * scale).round() / scale).collect()
                }
                None => axis.to_vec(),
            }
        };
        OceanMask {
            y_name: sample.y_name.clone(),
            x_name: sample.x_name.clone(),
            y: round(&sample.y),
            x: round(&sample.x),
            ocean: sample.values.iter().map(|v| is_ocean(*v)).collect(),
        }
    }

    pub fn ocean_cells(&self) -> usize {
        self.ocean.iter().filter(|cell| **cell).count()
    }

    /// Render as CDL with an `ocean_mask` byte variable flagged `dtype = "bool"`.
    pub fn to_cdl(&self) -> String {
        let mut cdl = String::new();
        let (y, x) = (&self.y_name, &self.x_name);
        let _ = writeln!(cdl, "netcdf ocean_mask {{");
        let _ = writeln!(cdl, "dimensions:");
        let _ = writeln!(cdl, "\t{y} = {} ;", self.y.len());
        let _ = writeln!(cdl, "\t{x} = {} ;", self.x.len());
        let _ = writeln!(cdl, "variables:");
        for (name, units) in [(y, axis_units(y)), (x, axis_units(x))] {
            let _ = writeln!(cdl, "\tdouble {name}({name}) ;");
            if let Some(units) = units {
                let _ = writeln!(cdl, "\t\t{name}:units = \"{units}\" ;");
            }
        }
        let _ = writeln!(cdl, "\tbyte ocean_mask({y}, {x}) ;");
        let _ = writeln!(cdl, "\t\tocean_mask:dtype = \"bool\" ;");
        let _ = writeln!(cdl, "data:");
        let _ = writeln!(cdl, "\n {y} = {} ;", join_numbers(&self.y));
        let _ = writeln!(cdl, "\n {x} = {} ;", join_numbers(&self.x));
        let cells: Vec<&str> = self
            .ocean
            .iter()
            .map(|ocean| if *ocean { "1" } else { "0" })
            .collect();
        let rows: Vec<String> = cells
            .chunks(self.x.len().max(1))
            .map(|row| format!("  {}", row.join(", ")))
            .collect();
        let _ = writeln!(cdl, "\n ocean_mask =\n{} ;", rows.join(",\n"));
        let _ = writeln!(cdl, "}}");
        cdl
    }
}

fn axis_units(name: &str) -> Option<&'static str> {
    match name {
        "latitude" | "lat" => Some("degrees_north"),
        "longitude" | "lon" => Some("degrees_east"),
        _ => None,
    }
}

fn join_numbers(values: &[f64]) -> String {
    values
        .iter()
        .map(f64::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

fn flatten(value: &Value, out: &mut Vec<Option<f64>>) {
    match value {
        Value::Array(items) => items.iter().for_each(|item| flatten(item, out)),
        Value::Null => out.push(None),
        other => out.push(other.as_f64()),
    }
}

/// Attribute values appear either bare or as `{"type": .., "data": ..}`.
fn attribute_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64(),
        Value::Array(items) => items.first().and_then(attribute_number),
        Value::Object(map) => map.get("data").and_then(attribute_number),
        _ => None,
    }
}
