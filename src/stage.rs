//! Stage identifiers and the per-stage environment overlay table.
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

/// The six kinds of work the controller sequences.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StageKind {
    /// Ocean/land mask derived from a forcing sample.
    Mask,
    /// Unmasked and masked SCRIP grids from the mask.
    ScripGrid,
    /// Ocean-to-land mapping file between the two SCRIP grids.
    RegridWeights,
    /// Domain files generated from the mapping file.
    Domain,
    /// Raw-data-to-grid mapping files consumed by surfdata generation.
    MappingWeights,
    /// Surface-data generation for a single year.
    Surfdata,
}

impl StageKind {
    pub const ALL: [StageKind; 6] = [
        StageKind::Mask,
        StageKind::ScripGrid,
        StageKind::RegridWeights,
        StageKind::Domain,
        StageKind::MappingWeights,
        StageKind::Surfdata,
    ];

    /// Stable identifier, also used for `[env.<id>]` settings sections.
    pub fn id(&self) -> &'static str {
        match self {
            StageKind::Mask => "mask",
            StageKind::ScripGrid => "scrip-grid",
            StageKind::RegridWeights => "regrid-weights",
            StageKind::Domain => "domain",
            StageKind::MappingWeights => "mapping-weights",
            StageKind::Surfdata => "surfdata",
        }
    }

    pub fn from_id(id: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.id() == id)
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

/// A concrete step in a run; surfdata stages carry their year.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Mask,
    ScripGrid,
    RegridWeights,
    Domain,
    MappingWeights,
    Surfdata(i32),
}

impl Stage {
    /// The weight stages, in execution order.
    pub const WEIGHTS: [Stage; 5] = [
        Stage::Mask,
        Stage::ScripGrid,
        Stage::RegridWeights,
        Stage::Domain,
        Stage::MappingWeights,
    ];

    pub fn kind(&self) -> StageKind {
        match self {
            Stage::Mask => StageKind::Mask,
            Stage::ScripGrid => StageKind::ScripGrid,
            Stage::RegridWeights => StageKind::RegridWeights,
            Stage::Domain => StageKind::Domain,
            Stage::MappingWeights => StageKind::MappingWeights,
            Stage::Surfdata(_) => StageKind::Surfdata,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Surfdata(year) => write!(f, "surfdata({year})"),
            other => write!(f, "{}", other.kind()),
        }
    }
}

pub const DEFAULT_ESMF_ROOT: &str = "/cluster/software/ESMF/8.0.0-intel-2019b";

/// Environment variables added on top of the inherited environment, keyed by
/// stage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvOverlays {
    table: BTreeMap<StageKind, BTreeMap<String, String>>,
}

impl EnvOverlays {
    /// Built-in overlays: `mkmapdata.sh` needs the ESMF toolchain description
    /// and the raw input-data root.
    pub fn defaults(esmf_root: &Path, dir_inp: &Path) -> Self {
        let mut overlays = Self::default();
        let esmf = |sub: &str| esmf_root.join(sub).display().to_string();
        for (key, value) in [
            ("ESMF_NETCDF_LIBS", "-lnetcdff -lnetcdf -lnetcdf_c++".to_string()),
            ("ESMF_COMPILER", "intel".to_string()),
            ("ESMF_COMM", "openmpi".to_string()),
            ("ESMF_NETCDF_LIBPATH", esmf("lib")),
            ("ESMF_NETCDF_INCLUDE", esmf("include")),
            ("ESMFBIN_PATH", esmf("bin")),
            ("CSMDATA", dir_inp.display().to_string()),
            ("MPIEXEC", "mpirun".to_string()),
            ("REGRID_PROC", "1".to_string()),
        ] {
            overlays.insert(StageKind::MappingWeights, key, value);
        }
        overlays
    }

    pub fn insert(&mut self, stage: StageKind, key: impl Into<String>, value: impl Into<String>) {
        self.table
            .entry(stage)
            .or_default()
            .insert(key.into(), value.into());
    }

    /// Overlay for `stage`; empty when the stage needs nothing extra.
    pub fn for_stage(&self, stage: StageKind) -> impl Iterator<Item = (&str, &str)> {
        self.table
            .get(&stage)
            .into_iter()
            .flat_map(|vars| vars.iter().map(|(k, v)| (k.as_str(), v.as_str())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn stage_ids_round_trip() {
        for kind in StageKind::ALL {
            assert_eq!(StageKind::from_id(kind.id()), Some(kind));
        }
        assert_eq!(StageKind::from_id("bogus"), None);
    }

    #[test]
    fn weight_stages_cover_every_kind_but_surfdata() {
        let kinds: Vec<StageKind> = Stage::WEIGHTS.iter().map(Stage::kind).collect();
        assert_eq!(kinds, StageKind::ALL[..5].to_vec());
        assert_eq!(Stage::RegridWeights.to_string(), "regrid-weights");
        assert_eq!(Stage::Surfdata(2005).to_string(), "surfdata(2005)");
        assert_eq!(Stage::Surfdata(2005).kind(), StageKind::Surfdata);
    }

    #[test]
    fn default_overlay_only_targets_mapping_weights() {
        let overlays = EnvOverlays::defaults(
            &PathBuf::from("/opt/esmf"),
            &PathBuf::from("/data/inputdata"),
        );
        let vars: BTreeMap<_, _> = overlays.for_stage(StageKind::MappingWeights).collect();
        assert_eq!(vars.get("CSMDATA"), Some(&"/data/inputdata"));
        assert_eq!(vars.get("ESMFBIN_PATH"), Some(&"/opt/esmf/bin"));
        assert_eq!(vars.get("REGRID_PROC"), Some(&"1"));
        assert_eq!(overlays.for_stage(StageKind::Surfdata).count(), 0);
    }
}
