//! Stage sequencer for a regional surface-data run.
//!
//! A run walks a fixed state machine:
//!
//! ```text
//! Init -> WeightsPending -> WeightsDone -> Surfdata(y1) -> .. -> Surfdata(yN) -> Complete
//!      \_________(compute_weights = false)_________/
//! ```
//!
//! Stages run strictly one after another in the working directory; each
//! stage's products are moved into the output directory before the next one
//! starts. The first failure aborts the run and leaves whatever was produced
//! so far on disk.
use crate::config::RunConfig;
use crate::discovery::{NamelistQuery, OutputDiscovery, StdoutPatternDiscovery};
use crate::error::{PipelineError, Result};
use crate::exec::{CommandExecutor, ExternalCommand};
use crate::mask::{self, HttpFetcher, SampleFetcher};
use crate::namelist;
use crate::paths::ArtifactPaths;
use crate::stage::{Stage, StageKind};
use crate::util::relocate_matching;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

const NAMELIST_GROUP: &str = "clmexp";
const GRIDTYPE_FIELD: &str = "mksrf_gridtype";
const REGIONAL_GRIDTYPE: &str = "regional";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Init,
    WeightsPending,
    WeightsDone,
    Surfdata(i32),
    Complete,
}

/// What a completed run executed and produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineReport {
    pub stages: Vec<String>,
    /// Surface-data NetCDF products per year.
    pub surfdata: BTreeMap<i32, Vec<PathBuf>>,
}

pub struct Pipeline<'a, E: CommandExecutor> {
    config: &'a RunConfig,
    paths: ArtifactPaths,
    work_dir: PathBuf,
    executor: E,
    fetcher: Box<dyn SampleFetcher>,
    discovery: Box<dyn OutputDiscovery>,
    state: PipelineState,
}

impl<'a, E: CommandExecutor> Pipeline<'a, E> {
    /// Build a pipeline that runs tools in `work_dir`.
    pub fn new(config: &'a RunConfig, executor: E, work_dir: &Path) -> Self {
        Self {
            config,
            paths: config.paths(),
            work_dir: work_dir.to_path_buf(),
            executor,
            fetcher: Box::new(HttpFetcher::default()),
            discovery: Box::new(StdoutPatternDiscovery),
            state: PipelineState::Init,
        }
    }

    pub fn with_fetcher(mut self, fetcher: Box<dyn SampleFetcher>) -> Self {
        self.fetcher = fetcher;
        self
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    #[cfg(test)]
    pub fn executor(&self) -> &E {
        &self.executor
    }

    /// Stages a run with this configuration executes, in order.
    pub fn plan(config: &RunConfig) -> Vec<Stage> {
        let weights = if config.compute_weights {
            Stage::WEIGHTS.to_vec()
        } else {
            Vec::new()
        };
        weights
            .into_iter()
            .chain(config.years.iter().map(|year| Stage::Surfdata(*year)))
            .collect()
    }

    pub fn run(&mut self) -> Result<PipelineReport> {
        let config = self.config;
        let mut report = PipelineReport::default();
        if config.compute_weights {
            self.transition(PipelineState::WeightsPending);
            let weight_dir = self.paths.weight_dir();
            fs::create_dir_all(&weight_dir)
                .map_err(|err| PipelineError::io_at("create", &weight_dir, err))?;
            for stage in Stage::WEIGHTS {
                self.execute(stage, &mut report)?;
            }
        } else {
            tracing::info!(
                stamp = %config.stamp,
                "reusing weights from {}",
                self.paths.dir_out().display()
            );
        }
        self.transition(PipelineState::WeightsDone);

        for &year in &config.years {
            self.execute(Stage::Surfdata(year), &mut report)?;
            self.transition(PipelineState::Surfdata(year));
        }
        self.transition(PipelineState::Complete);
        Ok(report)
    }

    fn transition(&mut self, next: PipelineState) {
        tracing::debug!(from = ?self.state, to = ?next, "pipeline state");
        self.state = next;
    }

    fn execute(&mut self, stage: Stage, report: &mut PipelineReport) -> Result<()> {
        tracing::info!(%stage, "starting stage");
        match stage {
            Stage::Mask => self.ocean_mask()?,
            Stage::ScripGrid => self.scrip_grids()?,
            Stage::RegridWeights => self.ocean_to_land_map()?,
            Stage::Domain => self.domains()?,
            Stage::MappingWeights => self.mapping_weights()?,
            Stage::Surfdata(year) => {
                let products = self.surfdata(year)?;
                report.surfdata.insert(year, products);
            }
        }
        report.stages.push(stage.to_string());
        Ok(())
    }

    fn command(&self, stage: StageKind, program: impl Into<PathBuf>) -> ExternalCommand {
        ExternalCommand::new(stage, program, &self.work_dir)
    }

    fn ocean_mask(&mut self) -> Result<()> {
        let provider = self.config.forcing.provider();
        let cache = self.paths.forcing_sample(provider.tag());
        mask::produce_mask(
            provider.as_ref(),
            &self.config.bbox,
            &cache,
            &self.paths.ocean_mask(),
            self.fetcher.as_ref(),
            &mut self.executor,
        )?;
        Ok(())
    }

    fn scrip_grids(&mut self) -> Result<()> {
        let quoted = |key: &str, path: &Path| format!("{key}=\"{}\"", path.display());
        let command = self
            .command(StageKind::ScripGrid, "ncl")
            .arg(quoted("path_in", &self.paths.ocean_mask()))
            .arg(quoted("path_no", &self.paths.scrip_nomask()))
            .arg(quoted("path_ma", &self.paths.scrip_ocean_mask()))
            .path_arg(&self.config.scrip_script);
        self.executor.run(&command)?;
        tracing::info!(
            nomask = %self.paths.scrip_nomask().display(),
            ocean_mask = %self.paths.scrip_ocean_mask().display(),
            "SCRIP grid files written"
        );
        Ok(())
    }

    fn ocean_to_land_map(&mut self) -> Result<()> {
        let command = self
            .command(StageKind::RegridWeights, "ESMF_RegridWeightGen")
            .arg("--ignore_unmapped")
            .arg("-s")
            .path_arg(&self.paths.scrip_ocean_mask())
            .arg("-d")
            .path_arg(&self.paths.scrip_nomask())
            .args(["-m", "conserve", "-w"])
            .path_arg(&self.paths.ocean_to_land_map())
            .args([
                "--dst_regional",
                "--src_regional",
                "--src_type",
                "SCRIP",
                "--dst_type",
                "SCRIP",
            ]);
        self.executor.run(&command)?;
        tracing::info!(map = %self.paths.ocean_to_land_map().display(), "mapping file written");
        Ok(())
    }

    fn domains(&mut self) -> Result<()> {
        let name = self.config.name.as_str();
        let program = self
            .config
            .dir_ctsm
            .join("cime/tools/mapping/gen_domain_files/gen_domain");
        let command = self
            .command(StageKind::Domain, program)
            .arg("-m")
            .path_arg(&self.paths.ocean_to_land_map())
            .args(["-o", name, "-l", name]);
        self.executor.run(&command)?;
        let moved = relocate_matching(
            &self.work_dir,
            &self.paths.domain_glob(),
            self.paths.dir_out(),
        )?;
        for path in &moved {
            tracing::info!(domain = %path.display(), "domain file");
        }
        Ok(())
    }

    fn mapping_weights(&mut self) -> Result<()> {
        let program = self.config.dir_ctsm.join("tools/mkmapdata/mkmapdata.sh");
        let command = self
            .command(StageKind::MappingWeights, program)
            .arg("-f")
            .path_arg(&self.paths.scrip_nomask())
            .args(["-r", self.config.name.as_str(), "-t", "regional"]);
        self.executor.run(&command)?;
        let moved = relocate_matching(
            &self.work_dir,
            &self.paths.mapping_weights_glob(),
            &self.paths.weight_dir(),
        )?;
        tracing::info!(
            count = moved.len(),
            dir = %self.paths.weight_dir().display(),
            "mapping weights stored"
        );
        Ok(())
    }

    /// Generate surface data for `year` and return its NetCDF products.
    fn surfdata(&mut self, year: i32) -> Result<Vec<PathBuf>> {
        tracing::info!(year, "interpolating surface parameters");
        let config = self.config;
        let tools = config.dir_ctsm.join("tools/mksurfdata_map");

        // Dry run: the wrapper only writes the namelist and prints how it
        // would call the generator.
        let mut dry_run = self
            .command(StageKind::Surfdata, tools.join("mksurfdata.pl"))
            .args(["-debug", "-no-crop", "-res", "usrspec", "-usr_gname"])
            .arg(config.name.as_str())
            .arg("-usr_gdate")
            .arg(config.stamp.as_str())
            .arg("-usr_mapdir")
            .path_arg(&self.paths.weight_dir())
            .arg("-dinlc")
            .path_arg(&config.dir_inp);
        if config.hires_pft {
            dry_run = dry_run.arg("-hirespft");
        }
        let dry_run = dry_run.arg("-years").arg(year.to_string());
        let stdout = self.executor.run(&dry_run)?;

        let query = NamelistQuery {
            name: &config.name,
            year,
        };
        let namelist_path = self
            .discovery
            .namelist_path(&stdout, query, &self.work_dir)?;
        namelist::patch(
            &namelist_path,
            NAMELIST_GROUP,
            GRIDTYPE_FIELD,
            REGIONAL_GRIDTYPE,
        )?;

        let generate = self
            .command(StageKind::Surfdata, tools.join("mksurfdata_map"))
            .stdin_from(&namelist_path);
        self.executor.run(&generate)?;

        let moved = relocate_matching(
            &self.work_dir,
            &self.paths.surfdata_glob(),
            self.paths.dir_out(),
        )?;
        let products: Vec<PathBuf> = moved
            .into_iter()
            .filter(|path| path.extension().is_some_and(|ext| ext == "nc"))
            .collect();
        if products.is_empty() {
            tracing::warn!(year, "surface-data generator produced no .nc file");
        }
        for product in &products {
            tracing::info!(year, product = %product.display(), "surface parameters");
        }
        Ok(products)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BoundingBox;
    use crate::error::StageExecutionError;
    use crate::mask::{ForcingKind, SampleRequest};
    use crate::stage::EnvOverlays;

    /// Imitates the external toolchain: writes the files each tool would
    /// write into its working directory and records every invocation.
    #[derive(Default)]
    struct FakeToolchain {
        name: String,
        commands: Vec<ExternalCommand>,
        fail_on: Option<StageKind>,
        dry_run_stdout: Option<String>,
    }

    impl FakeToolchain {
        fn new(name: &str) -> Self {
            Self {
                name: name.to_string(),
                ..Self::default()
            }
        }

        fn program_names(&self) -> Vec<String> {
            self.commands
                .iter()
                .map(|c| {
                    c.program
                        .file_name()
                        .unwrap()
                        .to_string_lossy()
                        .into_owned()
                })
                .collect()
        }

        fn year_arg(command: &ExternalCommand) -> String {
            let idx = command.args.iter().position(|a| a == "-years").unwrap();
            command.args[idx + 1].clone()
        }
    }

    impl CommandExecutor for FakeToolchain {
        fn run(&mut self, command: &ExternalCommand) -> Result<String> {
            self.commands.push(command.clone());
            if self.fail_on == Some(command.stage) {
                return Err(StageExecutionError::NonZeroExit {
                    stage: command.stage,
                    command: command.command_line(),
                    code: Some(1),
                    stderr: "simulated failure".to_string(),
                }
                .into());
            }
            let cwd = &command.current_dir;
            let program = command.program.file_name().unwrap().to_string_lossy();
            let name = &self.name;
            match program.as_ref() {
                "ncks" => Ok(r#"{"variables": {
                    "latitude": {"shape": ["latitude"], "data": [60.0]},
                    "longitude": {"shape": ["longitude"], "data": [10.0, 10.1]},
                    "tp": {"shape": ["time", "latitude", "longitude"], "data": [[[null, 1.0]]]}
                }}"#
                .to_string()),
                "ncgen" => {
                    fs::write(&command.args[1], b"CDF").unwrap();
                    Ok(String::new())
                }
                "gen_domain" => {
                    let land = format!("domain.lnd.{name}_{name}.240101.nc");
                    fs::write(cwd.join(land), b"").unwrap();
                    fs::write(cwd.join(format!("domain.ocn.{name}.240101.nc")), b"").unwrap();
                    Ok(String::new())
                }
                "mkmapdata.sh" => {
                    let map = format!("map_0.5x0.5_AVHRR_to_{name}_nomask_aave_da_c240101.nc");
                    fs::write(cwd.join(map), b"").unwrap();
                    Ok(String::new())
                }
                "mksurfdata.pl" => {
                    if let Some(stdout) = &self.dry_run_stdout {
                        return Ok(stdout.clone());
                    }
                    let year = Self::year_arg(command);
                    let namelist =
                        format!("surfdata_{name}_hist_16pfts_simyr{year}_c240101.namelist");
                    fs::write(
                        cwd.join(&namelist),
                        "&clmexp\n mksrf_fgrid = 'x.nc'\n mksrf_gridtype = 'global'\n/\n",
                    )
                    .unwrap();
                    Ok(format!("run: /ctsm/mksurfdata_map < {namelist}\n"))
                }
                "mksurfdata_map" => {
                    let namelist = command.stdin.as_ref().unwrap();
                    let text = fs::read_to_string(namelist).unwrap();
                    assert!(text.contains("mksrf_gridtype = 'regional'"));
                    let stem = namelist.file_stem().unwrap().to_string_lossy().into_owned();
                    fs::write(cwd.join(format!("{stem}.nc")), b"").unwrap();
                    fs::write(cwd.join(format!("{stem}.log")), b"").unwrap();
                    Ok(String::new())
                }
                other => Ok(format!("{other} ok\n")),
            }
        }
    }

    struct StaticFetcher;

    impl SampleFetcher for StaticFetcher {
        fn fetch(&self, _request: &SampleRequest, dest: &Path) -> Result<()> {
            fs::write(dest, b"CDF").map_err(|err| PipelineError::io_at("write", dest, err))
        }
    }

    fn config(dir_out: &Path, years: Vec<i32>, compute_weights: bool, stamp: &str) -> RunConfig {
        RunConfig {
            name: "testregion".to_string(),
            bbox: BoundingBox {
                north: 60.0,
                west: 10.0,
                south: 59.0,
                east: 11.0,
            },
            forcing: ForcingKind::Era5Land,
            dir_ctsm: PathBuf::from("/ctsm"),
            dir_inp: PathBuf::from("/inputdata"),
            dir_out: dir_out.to_path_buf(),
            years,
            hires_pft: false,
            compute_weights,
            stamp: stamp.to_string(),
            scrip_script: PathBuf::from("scrips_rectilinear.ncl"),
            env_overlays: EnvOverlays::default(),
        }
    }

    #[test]
    fn resumed_run_only_executes_surfdata_years() {
        let temp = tempfile::tempdir().unwrap();
        let (work, out) = (temp.path().join("work"), temp.path().join("out"));
        fs::create_dir_all(&work).unwrap();
        fs::create_dir_all(&out).unwrap();
        let config = config(&out, vec![2000, 2001, 2002], false, "230101");
        assert_eq!(
            Pipeline::<FakeToolchain>::plan(&config),
            vec![Stage::Surfdata(2000), Stage::Surfdata(2001), Stage::Surfdata(2002)]
        );

        let mut pipeline = Pipeline::new(&config, FakeToolchain::new("testregion"), &work);
        let report = pipeline.run().unwrap();

        assert_eq!(pipeline.state(), PipelineState::Complete);
        assert_eq!(
            pipeline.executor().program_names(),
            vec![
                "mksurfdata.pl",
                "mksurfdata_map",
                "mksurfdata.pl",
                "mksurfdata_map",
                "mksurfdata.pl",
                "mksurfdata_map",
            ]
        );
        assert_eq!(
            report.stages,
            vec!["surfdata(2000)", "surfdata(2001)", "surfdata(2002)"]
        );
        let dry_run = &pipeline.executor().commands[0];
        let gdate = dry_run.args.iter().position(|a| a == "-usr_gdate").unwrap();
        assert_eq!(dry_run.args[gdate + 1], "230101");
        assert!(!dry_run.args.contains(&"-hirespft".to_string()));

        for year in [2000, 2001, 2002] {
            let products = &report.surfdata[&year];
            let stem = format!("surfdata_testregion_hist_16pfts_simyr{year}_c240101");
            assert_eq!(products, &vec![out.join(format!("{stem}.nc"))]);
            assert!(products[0].exists());
            assert!(out.join(format!("{stem}.namelist")).exists());
        }
        assert_eq!(fs::read_dir(&work).unwrap().count(), 0);
    }

    #[test]
    fn weight_run_executes_all_stages_in_order() {
        let temp = tempfile::tempdir().unwrap();
        let (work, out) = (temp.path().join("work"), temp.path().join("out"));
        fs::create_dir_all(&work).unwrap();
        let mut config = config(&out, vec![2005], true, "240101");
        config.hires_pft = true;

        let mut pipeline = Pipeline::new(&config, FakeToolchain::new("testregion"), &work)
            .with_fetcher(Box::new(StaticFetcher));
        let report = pipeline.run().unwrap();

        assert_eq!(
            pipeline.executor().program_names(),
            vec![
                "ncks",
                "ncgen",
                "ncl",
                "ESMF_RegridWeightGen",
                "gen_domain",
                "mkmapdata.sh",
                "mksurfdata.pl",
                "mksurfdata_map",
            ]
        );
        assert_eq!(
            report.stages,
            vec![
                "mask",
                "scrip-grid",
                "regrid-weights",
                "domain",
                "mapping-weights",
                "surfdata(2005)"
            ]
        );
        assert!(out.join("mask_ocean_testregion.nc").exists());
        assert!(out.join("tmp_era5land.nc").exists());
        assert!(out.join("domain.lnd.testregion_testregion.240101.nc").exists());
        assert!(out.join("domain.ocn.testregion.240101.nc").exists());
        assert!(out
            .join("weight_maps/map_0.5x0.5_AVHRR_to_testregion_nomask_aave_da_c240101.nc")
            .exists());

        let commands = &pipeline.executor().commands;
        let nomask = out.join("SCRIPgrid_testregion_nomask_c240101.nc");
        assert_eq!(commands[2].args[1], format!("path_no=\"{}\"", nomask.display()));
        let regrid = commands[3].command_line();
        assert!(regrid.contains("-m conserve -w"));
        assert!(regrid.contains("map_testregion_ocean_to_land_nomask_aave_da_c240101.nc"));
        assert!(commands[6].args.contains(&"-hirespft".to_string()));

        // A resumed run rebuilds the same artifact names from the stamp.
        let resumed = RunConfig {
            compute_weights: false,
            ..config.clone()
        };
        assert_eq!(resumed.paths(), config.paths());
    }

    #[test]
    fn tool_failure_aborts_before_later_stages() {
        let temp = tempfile::tempdir().unwrap();
        let (work, out) = (temp.path().join("work"), temp.path().join("out"));
        fs::create_dir_all(&work).unwrap();
        let config = config(&out, vec![2000, 2001], true, "240101");
        let mut toolchain = FakeToolchain::new("testregion");
        toolchain.fail_on = Some(StageKind::RegridWeights);

        let mut pipeline =
            Pipeline::new(&config, toolchain, &work).with_fetcher(Box::new(StaticFetcher));
        let err = pipeline.run().unwrap_err();

        assert!(matches!(
            err,
            PipelineError::StageExecution(StageExecutionError::NonZeroExit {
                stage: StageKind::RegridWeights,
                ..
            })
        ));
        assert_eq!(pipeline.state(), PipelineState::WeightsPending);
        assert_eq!(
            pipeline.executor().program_names().last().map(String::as_str),
            Some("ESMF_RegridWeightGen")
        );
        // Earlier products stay for inspection.
        assert!(out.join("mask_ocean_testregion.nc").exists());
    }

    #[test]
    fn surfdata_failure_stops_remaining_years() {
        let temp = tempfile::tempdir().unwrap();
        let (work, out) = (temp.path().join("work"), temp.path().join("out"));
        fs::create_dir_all(&work).unwrap();
        fs::create_dir_all(&out).unwrap();
        let config = config(&out, vec![2000, 2001], false, "230101");
        let mut toolchain = FakeToolchain::new("testregion");
        toolchain.fail_on = Some(StageKind::Surfdata);

        let mut pipeline = Pipeline::new(&config, toolchain, &work);
        assert!(pipeline.run().is_err());
        assert_eq!(pipeline.executor().commands.len(), 1);
        assert_eq!(pipeline.state(), PipelineState::WeightsDone);
    }

    #[test]
    fn missing_namelist_in_dry_run_output_is_fatal() {
        let temp = tempfile::tempdir().unwrap();
        let (work, out) = (temp.path().join("work"), temp.path().join("out"));
        fs::create_dir_all(&work).unwrap();
        fs::create_dir_all(&out).unwrap();
        let config = config(&out, vec![2000], false, "230101");
        let mut toolchain = FakeToolchain::new("testregion");
        toolchain.dry_run_stdout = Some("Successfully created input namelist file\n".to_string());

        let mut pipeline = Pipeline::new(&config, toolchain, &work);
        let err = pipeline.run().unwrap_err();
        assert!(matches!(
            err,
            PipelineError::StageExecution(StageExecutionError::OutputNotFound { .. })
        ));
        assert_eq!(pipeline.executor().program_names(), vec!["mksurfdata.pl"]);
    }
}
