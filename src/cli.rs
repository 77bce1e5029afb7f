//! CLI argument parsing for the surface-data controller.
//!
//! The controller takes exactly one input: the settings file. Everything else
//! (region, forcing, years, directories) lives in that file.
use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "surfdata",
    version,
    about = "Generate CTSM regional surface data for a bounding box",
    after_help = "Examples:\n  surfdata settings.ini\n  RUST_LOG=debug surfdata settings.ini"
)]
pub struct RootArgs {
    /// INI settings file with [space], [path], [time] and [switch] sections,
    /// plus optional [env.<stage>] overlays
    #[arg(value_name = "SETTINGS")]
    pub settings: PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn requires_exactly_one_settings_path() {
        let args = RootArgs::try_parse_from(["surfdata", "run.ini"]).unwrap();
        assert_eq!(args.settings, PathBuf::from("run.ini"));
        assert!(RootArgs::try_parse_from(["surfdata"]).is_err());
        assert!(RootArgs::try_parse_from(["surfdata", "a.ini", "b.ini"]).is_err());
    }

    #[test]
    fn help_names_the_settings_sections() {
        let help = RootArgs::command().render_long_help().to_string();
        for section in ["[space]", "[path]", "[time]", "[switch]", "[env.<stage>]"] {
            assert!(help.contains(section), "help lacks {section}: {help}");
        }
        assert!(!help.contains("[domain]"));
    }
}
