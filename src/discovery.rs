//! Discovery of intermediate files chosen by opaque external generators.
//!
//! `mksurfdata.pl` picks the namelist name itself and only reveals it in the
//! command line it prints in debug mode. The controller asks an
//! `OutputDiscovery` for that name so the scraping strategy can change without
//! touching the stage sequencing.
use crate::error::{Result, StageExecutionError};
use crate::stage::StageKind;
use regex::Regex;
use std::path::{Path, PathBuf};

/// What the controller is looking for in a generator's output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NamelistQuery<'a> {
    pub name: &'a str,
    pub year: i32,
}

pub trait OutputDiscovery {
    /// Locate the namelist a dry run generated, relative to `work_dir`.
    fn namelist_path(&self, stdout: &str, query: NamelistQuery<'_>, work_dir: &Path)
        -> Result<PathBuf>;
}

/// Finds the namelist in the `mksurfdata_map < <namelist>` line printed by the
/// debug wrapper.
#[derive(Debug, Clone, Copy, Default)]
pub struct StdoutPatternDiscovery;

impl StdoutPatternDiscovery {
    fn pattern(query: NamelistQuery<'_>) -> Regex {
        let pattern = format!(
            r"mksurfdata_map < (surfdata_{}_\S+_simyr{}_c\d{{6}}\.namelist)",
            regex::escape(query.name),
            query.year
        );
        Regex::new(&pattern).expect("escaped namelist pattern is a valid regex")
    }
}

impl OutputDiscovery for StdoutPatternDiscovery {
    fn namelist_path(
        &self,
        stdout: &str,
        query: NamelistQuery<'_>,
        work_dir: &Path,
    ) -> Result<PathBuf> {
        let caps = Self::pattern(query).captures(stdout).ok_or_else(|| {
            StageExecutionError::OutputNotFound {
                stage: StageKind::Surfdata,
                what: format!("namelist path for {} year {}", query.name, query.year),
            }
        })?;
        Ok(work_dir.join(&caps[1]))
    }
}
