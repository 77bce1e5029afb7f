use crate::error::{PipelineError, Result};
use regex::Regex;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Translate a shell glob (`*`, `?`) into an anchored regex over file names.
pub fn glob_regex(glob: &str) -> Regex {
    let mut pattern = String::from("^");
    for ch in glob.chars() {
        match ch {
            '*' => pattern.push_str(".*"),
            '?' => pattern.push('.'),
            other => pattern.push_str(&regex::escape(&other.to_string())),
        }
    }
    pattern.push('$');
    Regex::new(&pattern).expect("escaped glob is a valid regex")
}

/// Regular files directly inside `dir` whose names match `glob`, sorted.
pub fn files_matching(dir: &Path, glob: &str) -> io::Result<Vec<PathBuf>> {
    let re = glob_regex(glob);
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let matches = path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| re.is_match(name));
        if matches && path.is_file() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Move every file in `from` matching `glob` into `to`, replacing files of the
/// same name. Returns the destination paths.
pub fn relocate_matching(from: &Path, glob: &str, to: &Path) -> Result<Vec<PathBuf>> {
    let sources =
        files_matching(from, glob).map_err(|err| PipelineError::io_at("scan", from, err))?;
    if !sources.is_empty() {
        fs::create_dir_all(to).map_err(|err| PipelineError::io_at("create", to, err))?;
    }
    let mut moved = Vec::with_capacity(sources.len());
    for source in sources {
        let Some(file_name) = source.file_name() else {
            continue;
        };
        let dest = to.join(file_name);
        move_file(&source, &dest)?;
        moved.push(dest);
    }
    Ok(moved)
}

fn move_file(source: &Path, dest: &Path) -> Result<()> {
    if fs::rename(source, dest).is_ok() {
        return Ok(());
    }
    // Cross-device moves cannot rename.
    fs::copy(source, dest).map_err(|err| PipelineError::io_at("copy", source, err))?;
    fs::remove_file(source).map_err(|err| PipelineError::io_at("remove", source, err))?;
    Ok(())
}

/// Render a program and its arguments as a shell-quoted command line.
pub fn format_command_line(program: &Path, args: &[String]) -> String {
    let program = program.display().to_string();
    let mut parts = Vec::with_capacity(args.len() + 1);
    parts.push(program.as_str());
    parts.extend(args.iter().map(String::as_str));
    shell_words::join(parts)
}
