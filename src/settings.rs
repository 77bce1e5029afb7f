//! INI-style settings documents with extended interpolation.
//!
//! Values may reference `${key}` in the same section (or `[DEFAULT]`) and
//! `${section:key}` anywhere in the document. Keys are case-insensitive.
use crate::error::{PipelineError, Result};
use regex::Regex;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::OnceLock;

const DEFAULT_SECTION: &str = "DEFAULT";
const MAX_INTERPOLATION_DEPTH: usize = 10;

/// Raw (uninterpolated) settings, section → key → value.
#[derive(Debug, Clone, Default)]
pub struct Settings {
    sections: BTreeMap<String, BTreeMap<String, String>>,
    order: Vec<String>,
}

impl Settings {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|err| {
            PipelineError::config(format!("read settings {}: {err}", path.display()))
        })?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self> {
        let mut settings = Settings::default();
        let mut section: Option<String> = None;
        let mut last_key: Option<String> = None;
        let mut key_indent = 0usize;

        for (idx, raw_line) in text.lines().enumerate() {
            let line_no = idx + 1;
            let trimmed = raw_line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') || trimmed.starts_with(';') {
                continue;
            }
            let indent = raw_line.len() - raw_line.trim_start().len();

            // Only lines indented deeper than their key continue its value.
            if indent > key_indent {
                if let (Some(name), Some(key)) = (section.as_ref(), last_key.as_ref()) {
                    let value = strip_inline_comment(trimmed);
                    if let Some(existing) = settings
                        .sections
                        .get_mut(name)
                        .and_then(|entries| entries.get_mut(key))
                    {
                        if !existing.is_empty() {
                            existing.push('\n');
                        }
                        existing.push_str(value);
                        continue;
                    }
                }
            }

            if let Some(header) = trimmed.strip_prefix('[') {
                let name = header
                    .strip_suffix(']')
                    .map(str::trim)
                    .filter(|name| !name.is_empty())
                    .ok_or_else(|| {
                        PipelineError::config(format!("line {line_no}: malformed section header"))
                    })?;
                if !settings.sections.contains_key(name) {
                    settings.order.push(name.to_string());
                }
                settings.sections.entry(name.to_string()).or_default();
                section = Some(name.to_string());
                last_key = None;
                continue;
            }

            let Some(name) = section.as_ref() else {
                return Err(PipelineError::config(format!(
                    "line {line_no}: key outside of any section"
                )));
            };
            let split_at = trimmed.find(['=', ':']).ok_or_else(|| {
                PipelineError::config(format!("line {line_no}: expected `key = value`"))
            })?;
            let key = trimmed[..split_at].trim().to_lowercase();
            if key.is_empty() {
                return Err(PipelineError::config(format!("line {line_no}: empty key")));
            }
            let value = strip_inline_comment(trimmed[split_at + 1..].trim());
            settings
                .sections
                .entry(name.clone())
                .or_default()
                .insert(key.clone(), value.to_string());
            last_key = Some(key);
            key_indent = indent;
        }
        Ok(settings)
    }

    /// Section names in document order, excluding `[DEFAULT]`.
    pub fn sections(&self) -> impl Iterator<Item = &str> {
        self.order
            .iter()
            .map(String::as_str)
            .filter(|name| *name != DEFAULT_SECTION)
    }

    /// Keys of `section`, including those inherited from `[DEFAULT]`.
    pub fn keys(&self, section: &str) -> Vec<String> {
        let mut keys: Vec<String> = self
            .sections
            .get(section)
            .map(|entries| entries.keys().cloned().collect())
            .unwrap_or_default();
        if let Some(defaults) = self.sections.get(DEFAULT_SECTION) {
            for key in defaults.keys() {
                if !keys.contains(key) {
                    keys.push(key.clone());
                }
            }
        }
        keys
    }

    /// Interpolated value of `section.key`, or `None` when absent.
    pub fn get(&self, section: &str, key: &str) -> Result<Option<String>> {
        match self.raw(section, key) {
            Some(raw) => self.interpolate(section, raw, 1).map(Some),
            None => Ok(None),
        }
    }

    /// Interpolated value of `section.key`; absence is a config error.
    pub fn require(&self, section: &str, key: &str) -> Result<String> {
        self.get(section, key)?.ok_or_else(|| {
            PipelineError::config(format!("missing setting [{section}] {key}"))
        })
    }

    fn raw(&self, section: &str, key: &str) -> Option<&str> {
        let key = key.to_lowercase();
        self.sections
            .get(section)
            .and_then(|entries| entries.get(&key))
            .or_else(|| {
                self.sections
                    .get(DEFAULT_SECTION)
                    .and_then(|entries| entries.get(&key))
            })
            .map(String::as_str)
    }

    fn interpolate(&self, section: &str, value: &str, depth: usize) -> Result<String> {
        if depth > MAX_INTERPOLATION_DEPTH {
            return Err(PipelineError::config(format!(
                "interpolation too deep in [{section}]: {value}"
            )));
        }
        let mut out = String::with_capacity(value.len());
        let mut rest = value;
        while let Some(pos) = rest.find('$') {
            out.push_str(&rest[..pos]);
            let tail = &rest[pos..];
            if let Some(after) = tail.strip_prefix("$$") {
                out.push('$');
                rest = after;
                continue;
            }
            let caps = reference_regex().captures(tail).ok_or_else(|| {
                PipelineError::config(format!(
                    "bad interpolation syntax in [{section}]: {value}"
                ))
            })?;
            let ref_key = caps.get(2).map_or("", |key| key.as_str());
            let ref_section = caps.get(1).map_or(section, |sec| sec.as_str());
            let raw = self.raw(ref_section, ref_key).ok_or_else(|| {
                PipelineError::config(format!(
                    "[{section}] references undefined ${{{ref_section}:{ref_key}}}"
                ))
            })?;
            out.push_str(&self.interpolate(ref_section, raw, depth + 1)?);
            rest = &tail[caps[0].len()..];
        }
        out.push_str(rest);
        Ok(out)
    }
}

fn reference_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\$\{(?:([^:{}]+):)?([^:{}]+)\}").expect("valid reference regex")
    })
}

/// Drop a trailing `# comment` preceded by whitespace.
fn strip_inline_comment(value: &str) -> &str {
    let bytes = value.as_bytes();
    for (idx, byte) in bytes.iter().enumerate() {
        if *byte == b'#' && idx > 0 && bytes[idx - 1].is_ascii_whitespace() {
            return value[..idx].trim_end();
        }
    }
    value
}
