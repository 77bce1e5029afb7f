//! Configuration resolver: settings document → immutable `RunConfig`.
//!
//! Resolution is the only place that inspects the output directory to decide
//! between a fresh weight-generation run and a surfdata-only resume.
use crate::error::{PipelineError, Result};
use crate::mask::ForcingKind;
use crate::paths::ArtifactPaths;
use crate::settings::Settings;
use crate::stage::{EnvOverlays, StageKind, DEFAULT_ESMF_ROOT};
use crate::util::files_matching;
use regex::Regex;
use std::path::{Path, PathBuf};

/// Single year for which the high-resolution PFT raw data is available.
///
/// This is a product exception of the surface-data toolchain, not a rule
/// derived from the year value.
pub const HIRES_PFT_YEAR: i32 = 2005;

const DEFAULT_SCRIP_SCRIPT: &str = "scrips_rectilinear.ncl";

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub north: f64,
    pub west: f64,
    pub south: f64,
    pub east: f64,
}

impl BoundingBox {
    /// Order expected by the Copernicus area keyword.
    pub fn as_area(&self) -> [f64; 4] {
        [self.north, self.west, self.south, self.east]
    }
}

/// Which years to process and how the year spec was written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum YearSpec {
    Single(i32),
    Range { start: i32, end: i32 },
}

impl YearSpec {
    pub fn parse(raw: &str) -> Result<Self> {
        let bad = || PipelineError::config(format!("malformed years spec {raw:?}"));
        let parts: Vec<&str> = raw
            .split(|ch: char| ch == '-' || ch.is_whitespace())
            .filter(|part| !part.is_empty())
            .collect();
        let parse_year = |part: &str| part.parse::<i32>().map_err(|_| bad());
        if raw.contains('-') {
            let [start, end] = parts.as_slice() else {
                return Err(bad());
            };
            let (start, end) = (parse_year(start)?, parse_year(end)?);
            if start > end {
                return Err(bad());
            }
            Ok(YearSpec::Range { start, end })
        } else {
            let [year] = parts.as_slice() else {
                return Err(bad());
            };
            Ok(YearSpec::Single(parse_year(year)?))
        }
    }

    pub fn years(&self) -> Vec<i32> {
        match self {
            YearSpec::Single(year) => vec![*year],
            YearSpec::Range { start, end } => (*start..=*end).collect(),
        }
    }

    pub fn hires_pft(&self) -> bool {
        matches!(self, YearSpec::Single(HIRES_PFT_YEAR))
    }
}

/// Fully resolved, immutable run parameters.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub name: String,
    pub bbox: BoundingBox,
    pub forcing: ForcingKind,
    pub dir_ctsm: PathBuf,
    pub dir_inp: PathBuf,
    pub dir_out: PathBuf,
    pub years: Vec<i32>,
    pub hires_pft: bool,
    pub compute_weights: bool,
    /// Six-digit `yymmdd` tag shared by every artifact of a weight run.
    pub stamp: String,
    pub scrip_script: PathBuf,
    pub env_overlays: EnvOverlays,
}

impl RunConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let settings = Settings::load(path)?;
        let today = chrono::Local::now().format("%y%m%d").to_string();
        Self::resolve(&settings, &today)
    }

    /// Resolve `settings`; `today` becomes the stamp of a weight-generating run.
    pub fn resolve(settings: &Settings, today: &str) -> Result<Self> {
        let name = settings.require("space", "name")?;
        if name.trim().is_empty() || name.contains(['/', '\\']) {
            return Err(PipelineError::config(format!(
                "invalid region name {name:?}"
            )));
        }
        let forcing = ForcingKind::parse(&settings.require("space", "forcing")?)?;
        let bbox = BoundingBox {
            north: coordinate(settings, "north")?,
            west: coordinate(settings, "west")?,
            south: coordinate(settings, "south")?,
            east: coordinate(settings, "east")?,
        };
        if bbox.north < bbox.south {
            return Err(PipelineError::config(format!(
                "north ({}) is below south ({})",
                bbox.north, bbox.south
            )));
        }

        let dir_ctsm = PathBuf::from(settings.require("path", "dir_ctsm")?);
        let dir_inp = PathBuf::from(settings.require("path", "dir_inp")?);
        let dir_out = PathBuf::from(settings.require("path", "dir_out")?);
        let scrip_script = settings
            .get("path", "scrip_script")?
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_SCRIP_SCRIPT));
        let esmf_root = settings
            .get("path", "esmf_root")?
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_ESMF_ROOT));

        let year_spec = YearSpec::parse(&settings.require("time", "years")?)?;
        let compute_weights = parse_bool(&settings.require("switch", "compute_weights")?)?;

        let stamp = if compute_weights {
            if dir_out.exists() {
                return Err(PipelineError::config(format!(
                    "output already exists: {}; change dir_out or move the previous run",
                    dir_out.display()
                )));
            }
            today.to_string()
        } else {
            recover_stamp(&dir_out, &name)?
        };

        let mut env_overlays = EnvOverlays::defaults(&esmf_root, &dir_inp);
        apply_env_sections(settings, &mut env_overlays)?;

        Ok(RunConfig {
            name,
            bbox,
            forcing,
            dir_ctsm,
            dir_inp,
            dir_out,
            years: year_spec.years(),
            hires_pft: year_spec.hires_pft(),
            compute_weights,
            stamp,
            scrip_script,
            env_overlays,
        })
    }

    pub fn paths(&self) -> ArtifactPaths {
        ArtifactPaths::new(&self.dir_out, &self.name, &self.stamp)
    }
}

/// Recover the stamp of the weight run that produced `dir_out`.
///
/// Exactly one `domain.lnd*<region>*.nc` file must be present.
pub fn recover_stamp(dir_out: &Path, name: &str) -> Result<String> {
    let pattern = ArtifactPaths::land_domain_glob(name);
    let matches = files_matching(dir_out, &pattern).map_err(|err| {
        PipelineError::config(format!(
            "cannot scan {} for domain files: {err}",
            dir_out.display()
        ))
    })?;
    let path = match matches.as_slice() {
        [single] => single,
        [] => {
            return Err(PipelineError::config(format!(
                "no domain file matching {pattern} in {}; run with compute_weights = True first",
                dir_out.display()
            )))
        }
        many => {
            return Err(PipelineError::config(format!(
                "{} domain files match {pattern} in {}; cannot pick a stamp",
                many.len(),
                dir_out.display()
            )))
        }
    };
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or_default();
    let stamp_re = Regex::new(r"(\d{6})\.nc$").expect("valid stamp regex");
    stamp_re
        .captures(file_name)
        .map(|caps| caps[1].to_string())
        .ok_or_else(|| {
            PipelineError::config(format!("no 6-digit stamp in domain file {file_name}"))
        })
}

fn coordinate(settings: &Settings, key: &str) -> Result<f64> {
    let raw = settings.require("space", key)?;
    raw.trim()
        .parse::<f64>()
        .map_err(|_| PipelineError::config(format!("[space] {key} is not a number: {raw:?}")))
}

fn parse_bool(raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Ok(true),
        "false" | "no" | "off" | "0" => Ok(false),
        _ => Err(PipelineError::config(format!(
            "compute_weights must be a boolean, got {raw:?}"
        ))),
    }
}

/// Merge `[env.<stage>]` sections over the built-in overlay table.
fn apply_env_sections(settings: &Settings, overlays: &mut EnvOverlays) -> Result<()> {
    let env_sections: Vec<String> = settings
        .sections()
        .filter(|name| name.starts_with("env."))
        .map(str::to_string)
        .collect();
    for section in env_sections {
        let stage_id = &section["env.".len()..];
        let stage = StageKind::from_id(stage_id).ok_or_else(|| {
            PipelineError::config(format!("unknown stage in section [{section}]"))
        })?;
        for key in settings.keys(&section) {
            let value = settings.require(&section, &key)?;
            overlays.insert(stage, key.to_uppercase(), value);
        }
    }
    Ok(())
}
