//! Fortran namelist patching.
//!
//! The parser records where each `key = value` sits in the original text, so
//! a patch rewrites exactly one value and leaves every other byte, comment and
//! group of the file as it was.
use crate::error::{PipelineError, Result};
use std::fs;
use std::ops::Range;
use std::path::Path;

/// A parsed namelist file that remembers the byte span of every value.
#[derive(Debug, Clone)]
pub struct Namelist {
    text: String,
    groups: Vec<Group>,
}

#[derive(Debug, Clone)]
struct Group {
    name: String,
    /// Offset of the group terminator (`/` or `&end`).
    close: usize,
    entries: Vec<Entry>,
}

#[derive(Debug, Clone)]
struct Entry {
    key: String,
    value: Range<usize>,
}

impl Namelist {
    pub fn parse(text: &str) -> Result<Self> {
        let groups = Parser::new(text).groups()?;
        Ok(Self {
            text: text.to_string(),
            groups,
        })
    }

    pub fn read(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .map_err(|err| PipelineError::io_at("read namelist", path, err))?;
        Self::parse(&text).map_err(|err| match err {
            PipelineError::Config(msg) => {
                PipelineError::config(format!("{}: {msg}", path.display()))
            }
            other => other,
        })
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        fs::write(path, self.as_str())
            .map_err(|err| PipelineError::io_at("write namelist", path, err))
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// Raw value text of the last assignment to `group.key`.
    pub fn get(&self, group: &str, key: &str) -> Option<&str> {
        let (group, key) = (group.to_lowercase(), key.to_lowercase());
        self.groups
            .iter()
            .filter(|g| g.name == group)
            .flat_map(|g| g.entries.iter())
            .rev()
            .find(|entry| entry.key == key)
            .map(|entry| &self.text[entry.value.clone()])
    }

    /// Value of `group.key` as a string, with quotes removed.
    pub fn get_string(&self, group: &str, key: &str) -> Option<String> {
        self.get(group, key).map(unquote)
    }

    /// Set `group.key` to the literal Fortran text `literal`.
    ///
    /// Existing assignments are rewritten in place; a missing key is appended
    /// before the group terminator. A missing group is a config error.
    pub fn set(&mut self, group: &str, key: &str, literal: &str) -> Result<()> {
        let (group_lc, key_lc) = (group.to_lowercase(), key.to_lowercase());
        let matching: Vec<&Group> = self.groups.iter().filter(|g| g.name == group_lc).collect();
        if matching.is_empty() {
            return Err(PipelineError::config(format!(
                "namelist has no group &{group}"
            )));
        }

        // Edits applied back to front so earlier offsets stay valid.
        let mut edits: Vec<(Range<usize>, String)> = Vec::new();
        for g in matching {
            let spans: Vec<Range<usize>> = g
                .entries
                .iter()
                .filter(|entry| entry.key == key_lc)
                .map(|entry| entry.value.clone())
                .collect();
            if spans.is_empty() {
                edits.push((g.close..g.close, self.appended_entry(g.close, key, literal)));
            } else {
                edits.extend(spans.into_iter().map(|span| (span, literal.to_string())));
            }
        }
        edits.sort_by_key(|(span, _)| std::cmp::Reverse(span.start));

        let mut text = self.text.clone();
        for (span, replacement) in edits {
            text.replace_range(span, &replacement);
        }
        *self = Self::parse(&text)?;
        Ok(())
    }

    /// Set `group.key` to a quoted character value.
    pub fn set_string(&mut self, group: &str, key: &str, value: &str) -> Result<()> {
        self.set(group, key, &quote(value))
    }

    fn appended_entry(&self, close: usize, key: &str, literal: &str) -> String {
        let line_start = self.text[..close].rfind('\n').map_or(0, |idx| idx + 1);
        let before = &self.text[line_start..close];
        if before.trim().is_empty() {
            format!("    {key} = {literal}\n{before}")
        } else {
            format!("\n    {key} = {literal}\n")
        }
    }
}

/// Load `path`, set `group.field` to the string `value`, and overwrite the file.
pub fn patch(path: &Path, group: &str, field: &str, value: &str) -> Result<()> {
    let mut namelist = Namelist::read(path)?;
    let previous = namelist.get_string(group, field);
    namelist.set_string(group, field, value)?;
    namelist.write(path)?;
    tracing::info!(
        path = %path.display(),
        previous = ?previous,
        "set &{group} {field} = {value:?}"
    );
    Ok(())
}

fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

fn unquote(raw: &str) -> String {
    let raw = raw.trim();
    for delim in ['\'', '"'] {
        if raw.len() >= 2 && raw.starts_with(delim) && raw.ends_with(delim) {
            let doubled = format!("{delim}{delim}");
            return raw[1..raw.len() - 1].replace(&doubled, &delim.to_string());
        }
    }
    raw.to_string()
}

struct Parser<'a> {
    text: &'a str,
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            text,
            bytes: text.as_bytes(),
            pos: 0,
        }
    }

    fn error(&self, message: &str) -> PipelineError {
        let line = self.text[..self.pos.min(self.text.len())]
            .matches('\n')
            .count()
            + 1;
        PipelineError::config(format!("namelist line {line}: {message}"))
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn groups(mut self) -> Result<Vec<Group>> {
        let mut groups = Vec::new();
        loop {
            self.skip_blank();
            match self.peek() {
                None => return Ok(groups),
                Some(b'&') | Some(b'$') => {
                    self.pos += 1;
                    let name = self.identifier();
                    if name.is_empty() {
                        return Err(self.error("group marker without a name"));
                    }
                    groups.push(self.group_body(name.to_lowercase())?);
                }
                // Text between groups is ignored by Fortran readers.
                Some(_) => self.skip_line(),
            }
        }
    }

    fn group_body(&mut self, name: String) -> Result<Group> {
        let mut entries = Vec::new();
        loop {
            self.skip_blank();
            let Some(ch) = self.peek() else {
                return Err(self.error(&format!("group &{name} is not terminated")));
            };
            match ch {
                b'/' => {
                    let close = self.pos;
                    self.pos += 1;
                    return Ok(Group {
                        name,
                        close,
                        entries,
                    });
                }
                b'&' | b'$' => {
                    let close = self.pos;
                    self.pos += 1;
                    if self.identifier().eq_ignore_ascii_case("end") {
                        return Ok(Group {
                            name,
                            close,
                            entries,
                        });
                    }
                    return Err(self.error(&format!("group &{name} is not terminated")));
                }
                b',' => self.pos += 1,
                _ => {
                    let key = self.key()?;
                    let value = self.value()?;
                    entries.push(Entry { key, value });
                }
            }
        }
    }

    fn key(&mut self) -> Result<String> {
        let start = self.pos;
        let name = self.identifier();
        if name.is_empty() {
            return Err(self.error("expected a variable name"));
        }
        self.subscript()?;
        let key = self.text[start..self.pos].trim().to_lowercase();
        self.skip_spaces();
        if self.peek() != Some(b'=') {
            return Err(self.error(&format!("expected `=` after {key}")));
        }
        self.pos += 1;
        Ok(key)
    }

    /// Consume the tokens of one value and return their span.
    fn value(&mut self) -> Result<Range<usize>> {
        self.skip_spaces();
        let start = self.pos;
        let mut end = self.pos;
        loop {
            self.skip_blank();
            match self.peek() {
                None | Some(b'/') | Some(b'&') | Some(b'$') => break,
                Some(b',') => self.pos += 1,
                Some(b'\'') | Some(b'"') => {
                    self.string()?;
                    end = self.pos;
                }
                Some(b'(') => {
                    self.parenthesized()?;
                    end = self.pos;
                }
                Some(_) => {
                    if self.at_next_key() {
                        break;
                    }
                    self.bare_token();
                    end = self.pos;
                }
            }
        }
        Ok(start..end)
    }

    fn at_next_key(&mut self) -> bool {
        let save = self.pos;
        let name = self.identifier();
        let is_key = !name.is_empty()
            && self.subscript().is_ok()
            && {
                self.skip_spaces();
                self.peek() == Some(b'=')
            };
        self.pos = save;
        is_key
    }

    fn identifier(&mut self) -> &'a str {
        let start = self.pos;
        while let Some(ch) = self.peek() {
            if ch.is_ascii_alphanumeric() || ch == b'_' || ch == b'%' {
                self.pos += 1;
            } else {
                break;
            }
        }
        &self.text[start..self.pos]
    }

    /// Optional `(i)` / `(i:j)` index after a variable name.
    fn subscript(&mut self) -> Result<()> {
        let save = self.pos;
        self.skip_spaces();
        if self.peek() == Some(b'(') {
            self.parenthesized()
        } else {
            self.pos = save;
            Ok(())
        }
    }

    fn parenthesized(&mut self) -> Result<()> {
        let mut depth = 0usize;
        while let Some(ch) = self.peek() {
            match ch {
                b'(' => depth += 1,
                b')' => {
                    depth -= 1;
                    if depth == 0 {
                        self.pos += 1;
                        return Ok(());
                    }
                }
                b'\'' | b'"' => {
                    self.string()?;
                    continue;
                }
                b'\n' | b'/' => break,
                _ => {}
            }
            self.pos += 1;
        }
        Err(self.error("unbalanced parenthesis"))
    }

    fn string(&mut self) -> Result<()> {
        let Some(delim) = self.peek() else {
            return Ok(());
        };
        self.pos += 1;
        while let Some(ch) = self.peek() {
            self.pos += 1;
            if ch == delim {
                if self.peek() == Some(delim) {
                    self.pos += 1;
                    continue;
                }
                return Ok(());
            }
        }
        Err(self.error("unterminated string"))
    }

    fn bare_token(&mut self) {
        while let Some(ch) = self.peek() {
            if ch.is_ascii_whitespace() || matches!(ch, b',' | b'/' | b'!' | b'&' | b'$') {
                break;
            }
            self.pos += 1;
        }
    }

    fn skip_spaces(&mut self) {
        while matches!(self.peek(), Some(b' ') | Some(b'\t')) {
            self.pos += 1;
        }
    }

    /// Skip whitespace, newlines and `!` comments.
    fn skip_blank(&mut self) {
        while let Some(ch) = self.peek() {
            if ch.is_ascii_whitespace() {
                self.pos += 1;
            } else if ch == b'!' {
                self.skip_line();
            } else {
                break;
            }
        }
    }

    fn skip_line(&mut self) {
        while let Some(ch) = self.peek() {
            self.pos += 1;
            if ch == b'\n' {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GENERATED: &str = "\
&clmexp
 nglcec         = 10
 mksrf_fgrid    = '/out/weight_maps/map_0.5x0.5_AVHRR_to_scandi_nomask_aave_da_c230101.nc'
 map_fpft       = '/out/weight_maps/map_0.5x0.5_to_scandi.nc' ! pft map
 mksrf_gridtype = 'global'
 outnc_large_files = .false.
 numpft         = 16
 pft_idx = 0, 1, 2,
           3
/
&extra
 mksrf_gridtype = 'global'
/
";

    #[test]
    fn reads_values_and_groups() {
        let nml = Namelist::parse(GENERATED).unwrap();
        assert_eq!(nml.get("extra", "mksrf_gridtype"), Some("'global'"));
        assert_eq!(nml.get("clmexp", "nglcec"), Some("10"));
        assert_eq!(nml.get("CLMEXP", "MKSRF_GRIDTYPE"), Some("'global'"));
        assert_eq!(nml.get("clmexp", "pft_idx"), Some("0, 1, 2,\n           3"));
        assert_eq!(
            nml.get_string("clmexp", "map_fpft").as_deref(),
            Some("/out/weight_maps/map_0.5x0.5_to_scandi.nc")
        );
    }

    #[test]
    fn patch_touches_only_the_target_field() {
        let mut nml = Namelist::parse(GENERATED).unwrap();
        nml.set_string("clmexp", "mksrf_gridtype", "regional").unwrap();

        let expected = GENERATED.replacen(
            "mksrf_gridtype = 'global'",
            "mksrf_gridtype = 'regional'",
            1,
        );
        assert_eq!(nml.as_str(), expected);

        let before = Namelist::parse(GENERATED).unwrap();
        let after = Namelist::parse(nml.as_str()).unwrap();
        for key in [
            "nglcec",
            "mksrf_fgrid",
            "map_fpft",
            "outnc_large_files",
            "numpft",
            "pft_idx",
        ] {
            assert_eq!(before.get("clmexp", key), after.get("clmexp", key), "{key}");
        }
        assert_eq!(after.get_string("clmexp", "mksrf_gridtype").as_deref(), Some("regional"));
        assert_eq!(after.get("extra", "mksrf_gridtype"), Some("'global'"));
    }

    #[test]
    fn missing_field_is_appended_before_terminator() {
        let mut nml = Namelist::parse("&clmexp\n numpft = 16\n/\n").unwrap();
        nml.set_string("clmexp", "mksrf_gridtype", "regional").unwrap();
        assert_eq!(
            nml.as_str(),
            "&clmexp\n numpft = 16\n    mksrf_gridtype = 'regional'\n/\n"
        );
        assert_eq!(nml.get("clmexp", "numpft"), Some("16"));
    }

    #[test]
    fn handles_multiple_assignments_per_line_and_end_terminator() {
        let nml = Namelist::parse("$clmexp a = 1, b = 'x, y' c=.true. $end\n").unwrap();
        assert_eq!(nml.get("clmexp", "a"), Some("1"));
        assert_eq!(nml.get("clmexp", "b"), Some("'x, y'"));
        assert_eq!(nml.get("clmexp", "c"), Some(".true."));
    }

    #[test]
    fn quotes_are_escaped_when_setting_strings() {
        let mut nml = Namelist::parse("&g\n s = 'a'\n/\n").unwrap();
        nml.set_string("g", "s", "it's").unwrap();
        assert_eq!(nml.get("g", "s"), Some("'it''s'"));
        assert_eq!(nml.get_string("g", "s").as_deref(), Some("it's"));
    }

    #[test]
    fn malformed_namelists_are_config_errors() {
        for text in [
            "&clmexp\n a = 1\n",
            "&clmexp\n a = 'open\n/\n",
            "&clmexp\n = 1\n/\n",
            "&clmexp\n a 1\n/\n",
        ] {
            assert!(
                matches!(Namelist::parse(text), Err(PipelineError::Config(_))),
                "{text:?}"
            );
        }
        let mut nml = Namelist::parse("&other\n/\n").unwrap();
        assert!(nml.set_string("clmexp", "mksrf_gridtype", "regional").is_err());
    }

    #[test]
    fn patch_rewrites_the_file_in_place() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("surfdata_r_simyr2000_c230101.namelist");
        fs::write(&path, GENERATED).unwrap();
        patch(&path, "clmexp", "mksrf_gridtype", "regional").unwrap();
        let nml = Namelist::read(&path).unwrap();
        assert_eq!(nml.get("clmexp", "mksrf_gridtype"), Some("'regional'"));
    }
}
