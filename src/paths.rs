//! Typed paths for the artifacts a run produces.
//!
//! Every name is a pure function of the output directory, region name, and
//! stamp, so a resumed run reconstructs exactly the names of the run that
//! computed the weights.
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactPaths {
    dir_out: PathBuf,
    name: String,
    stamp: String,
}

impl ArtifactPaths {
    pub fn new(dir_out: &Path, name: &str, stamp: &str) -> Self {
        Self {
            dir_out: dir_out.to_path_buf(),
            name: name.to_string(),
            stamp: stamp.to_string(),
        }
    }

    pub fn dir_out(&self) -> &Path {
        &self.dir_out
    }

    /// Return the `weight_maps/` directory holding mapping-weight files.
    pub fn weight_dir(&self) -> PathBuf {
        self.dir_out.join("weight_maps")
    }

    /// Return the `mask_ocean_<region>.nc` path.
    pub fn ocean_mask(&self) -> PathBuf {
        self.dir_out.join(format!("mask_ocean_{}.nc", self.name))
    }

    /// Return the unmasked SCRIP grid path.
    pub fn scrip_nomask(&self) -> PathBuf {
        self.dir_out
            .join(format!("SCRIPgrid_{}_nomask_c{}.nc", self.name, self.stamp))
    }

    /// Return the ocean-masked SCRIP grid path.
    pub fn scrip_ocean_mask(&self) -> PathBuf {
        self.dir_out
            .join(format!("SCRIPgrid_{}_ocean_mask_c{}.nc", self.name, self.stamp))
    }

    /// Return the ocean-to-land mapping file path.
    pub fn ocean_to_land_map(&self) -> PathBuf {
        self.dir_out.join(format!(
            "map_{}_ocean_to_land_nomask_aave_da_c{}.nc",
            self.name, self.stamp
        ))
    }

    /// Return the cache path for a downloaded forcing sample.
    pub fn forcing_sample(&self, forcing_tag: &str) -> PathBuf {
        self.dir_out.join(format!("tmp_{forcing_tag}.nc"))
    }

    /// Glob for domain files written by the domain generator.
    pub fn domain_glob(&self) -> String {
        format!("domain.*.{}*.nc", self.name)
    }

    /// Glob for the land domain file that carries a run's stamp.
    pub fn land_domain_glob(name: &str) -> String {
        format!("domain.lnd*{name}*.nc")
    }

    /// Glob for mapping-weight files written by `mkmapdata.sh`.
    pub fn mapping_weights_glob(&self) -> String {
        format!("map*{}*.nc", self.name)
    }

    /// Glob for every file a surfdata run writes.
    pub fn surfdata_glob(&self) -> String {
        format!("surfdata_{}_*", self.name)
    }
}
