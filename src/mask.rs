//! Ocean/land mask providers for the supported forcing products.
//!
//! Each forcing product knows how to request a small sample covering the
//! bounding box and which rule turns a sampled value into ocean or land. The
//! shared driver caches the sample, decodes it with `ncks`, derives the mask
//! and writes it with `ncgen`.
mod fetch;
mod raster;

pub use fetch::{HttpFetcher, SampleFetcher, SampleRequest};
use raster::{OceanMask, SampleGrid};

use crate::config::BoundingBox;
use crate::error::{PipelineError, Result};
use crate::exec::{CommandExecutor, ExternalCommand};
use crate::stage::StageKind;
use serde_json::json;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

/// Forcing products a mask can be derived from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForcingKind {
    /// ECMWF ERA5-Land reanalysis, served by the Copernicus CDS.
    Era5Land,
    /// MET Norway's Nordic gridded analysis, served by thredds.met.no.
    MetNordic,
}

impl ForcingKind {
    pub fn parse(raw: &str) -> Result<Self> {
        match raw.trim() {
            "ERA5-Land" => Ok(ForcingKind::Era5Land),
            "MET_Nordic" => Ok(ForcingKind::MetNordic),
            other => Err(PipelineError::config(format!(
                "unsupported forcing {other:?} (expected ERA5-Land or MET_Nordic)"
            ))),
        }
    }

    /// Name used for the product in settings files.
    pub fn label(&self) -> &'static str {
        match self {
            ForcingKind::Era5Land => "ERA5-Land",
            ForcingKind::MetNordic => "MET_Nordic",
        }
    }

    pub fn provider(&self) -> Box<dyn MaskProvider> {
        match self {
            ForcingKind::Era5Land => Box::new(Era5LandMask),
            ForcingKind::MetNordic => Box::new(MetNordicMask),
        }
    }
}

impl fmt::Display for ForcingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A forcing-specific recipe for deriving an ocean mask.
pub trait MaskProvider {
    /// Short tag used to name the cached sample file.
    fn tag(&self) -> &'static str;

    fn sample_request(&self, bbox: &BoundingBox) -> SampleRequest;

    /// Variable in the sample whose values decide ocean vs land.
    fn field(&self) -> &'static str;

    fn is_ocean(&self, value: Option<f64>) -> bool;

    /// Decimal places for the coordinate axes, if they must be rounded.
    fn coordinate_decimals(&self) -> Option<i32>;
}

/// Precipitation is undefined over the sea in ERA5-Land.
#[derive(Debug, Clone, Copy)]
pub struct Era5LandMask;

impl MaskProvider for Era5LandMask {
    fn tag(&self) -> &'static str {
        "era5land"
    }

    fn sample_request(&self, bbox: &BoundingBox) -> SampleRequest {
        SampleRequest::Cds {
            dataset: "reanalysis-era5-land".to_string(),
            inputs: json!({
                "variable": ["total_precipitation"],
                "year": "1981",
                "month": "01",
                "day": "01",
                "time": "06:00",
                "area": bbox.as_area(),
                "data_format": "netcdf",
                "download_format": "unarchived",
            }),
        }
    }

    fn field(&self) -> &'static str {
        "tp"
    }

    fn is_ocean(&self, value: Option<f64>) -> bool {
        value.is_none()
    }

    // ERA5-Land axes carry float32 noise; one decimal keeps them aligned with
    // the 0.1 degree SCRIP grids.
    fn coordinate_decimals(&self) -> Option<i32> {
        Some(1)
    }
}

/// MET Nordic analyses ship a land-area fraction on their native grid.
#[derive(Debug, Clone, Copy)]
pub struct MetNordicMask;

const MET_NORDIC_SAMPLE: &str = "https://thredds.met.no/thredds/ncss/metpparchive/2020/01/01/met_analysis_1_0km_nordic_20200101T06Z.nc";

impl MaskProvider for MetNordicMask {
    fn tag(&self) -> &'static str {
        "metnordic"
    }

    fn sample_request(&self, bbox: &BoundingBox) -> SampleRequest {
        SampleRequest::Url(format!(
            "{MET_NORDIC_SAMPLE}?var=land_area_fraction&north={}&west={}&south={}&east={}&horizStride=1&accept=netcdf",
            bbox.north, bbox.west, bbox.south, bbox.east
        ))
    }

    fn field(&self) -> &'static str {
        "land_area_fraction"
    }

    fn is_ocean(&self, value: Option<f64>) -> bool {
        !matches!(value, Some(fraction) if fraction >= 0.5)
    }

    fn coordinate_decimals(&self) -> Option<i32> {
        None
    }
}

/// Produce the ocean mask at `mask_path`, fetching the sample into
/// `cache_path` first when it is not already there.
pub fn produce_mask(
    provider: &dyn MaskProvider,
    bbox: &BoundingBox,
    cache_path: &Path,
    mask_path: &Path,
    fetcher: &dyn SampleFetcher,
    executor: &mut dyn CommandExecutor,
) -> Result<PathBuf> {
    let work_dir = mask_path.parent().unwrap_or_else(|| Path::new("."));
    if cache_path.exists() {
        tracing::info!(sample = %cache_path.display(), "using cached forcing sample");
    } else {
        fetcher.fetch(&provider.sample_request(bbox), cache_path)?;
    }

    let dump = ExternalCommand::new(StageKind::Mask, "ncks", work_dir)
        .args(["--json", "-v", provider.field()])
        .path_arg(cache_path);
    let json = executor.run(&dump)?;
    let sample = SampleGrid::from_ncks_json(&json, provider.field())?;
    let mask = OceanMask::derive(
        &sample,
        |value| provider.is_ocean(value),
        provider.coordinate_decimals(),
    );

    let cdl_path = mask_path.with_extension("cdl");
    fs::write(&cdl_path, mask.to_cdl())
        .map_err(|err| PipelineError::io_at("write", &cdl_path, err))?;
    let generate = ExternalCommand::new(StageKind::Mask, "ncgen", work_dir)
        .arg("-o")
        .path_arg(mask_path)
        .path_arg(&cdl_path);
    executor.run(&generate)?;
    fs::remove_file(&cdl_path).map_err(|err| PipelineError::io_at("remove", &cdl_path, err))?;

    tracing::info!(
        mask = %mask_path.display(),
        ocean = mask.ocean_cells(),
        cells = mask.ocean.len(),
        "ocean mask saved"
    );
    Ok(mask_path.to_path_buf())
}
