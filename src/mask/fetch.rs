//! Remote download of forcing samples.
//!
//! Every request is a single attempt: failures surface as network errors and
//! nothing is retried. Downloads land in a temporary sibling file that is
//! renamed into place, so an interrupted transfer never poisons the cache.
use crate::error::{PipelineError, Result};
use serde::Deserialize;
use serde_json::{json, Value};
use std::env;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

/// Where a forcing sample comes from.
#[derive(Debug, Clone, PartialEq)]
pub enum SampleRequest {
    /// Copernicus Climate Data Store retrieval.
    Cds { dataset: String, inputs: Value },
    /// Plain HTTP GET, e.g. a THREDDS subset URL.
    Url(String),
}

pub trait SampleFetcher {
    fn fetch(&self, request: &SampleRequest, dest: &Path) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CdsCredentials {
    pub url: String,
    pub key: String,
}

impl CdsCredentials {
    /// `CDSAPI_URL`/`CDSAPI_KEY`, falling back to `~/.cdsapirc`.
    pub fn discover() -> Result<Self> {
        let rc = dirs::home_dir().map(|home| home.join(".cdsapirc"));
        Self::from_sources(
            env::var("CDSAPI_URL").ok(),
            env::var("CDSAPI_KEY").ok(),
            rc.as_deref(),
        )
    }

    /// Missing credentials mean the sample cannot be fetched, so every
    /// failure here is a network error.
    fn from_sources(url: Option<String>, key: Option<String>, rc: Option<&Path>) -> Result<Self> {
        if let (Some(url), Some(key)) = (url, key) {
            return Ok(Self {
                url: url.trim_end_matches('/').to_string(),
                key,
            });
        }
        let rc = rc.ok_or_else(|| {
            PipelineError::Network("no CDS credentials: cannot locate ~/.cdsapirc".to_string())
        })?;
        let text = fs::read_to_string(rc).map_err(|err| {
            PipelineError::Network(format!("read CDS credentials {}: {err}", rc.display()))
        })?;
        Self::parse_rc(&text).ok_or_else(|| {
            PipelineError::Network(format!("{} must define url and key", rc.display()))
        })
    }

    fn parse_rc(text: &str) -> Option<Self> {
        let mut url = None;
        let mut key = None;
        for line in text.lines() {
            if let Some((name, value)) = line.split_once(':') {
                match name.trim() {
                    "url" => url = Some(value.trim().to_string()),
                    "key" => key = Some(value.trim().to_string()),
                    _ => {}
                }
            }
        }
        Some(Self {
            url: url?.trim_end_matches('/').to_string(),
            key: key?,
        })
    }
}

#[derive(Debug, Deserialize)]
struct JobStatus {
    #[serde(rename = "jobID")]
    job_id: String,
    status: String,
}

/// Blocking HTTP fetcher for CDS jobs and plain URLs.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    poll_interval: Duration,
}

impl Default for HttpFetcher {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
        }
    }
}

impl HttpFetcher {
    fn retrieve_cds(&self, dataset: &str, inputs: &Value, dest: &Path) -> Result<()> {
        let creds = CdsCredentials::discover()?;
        let api = format!("{}/retrieve/v1", creds.url);
        let key = creds.key.as_str();

        tracing::info!(dataset, "submitting CDS request");
        let mut job: JobStatus = ureq::post(format!("{api}/processes/{dataset}/execution"))
            .header("PRIVATE-TOKEN", key)
            .send_json(json!({ "inputs": inputs }))?
            .body_mut()
            .read_json()?;

        loop {
            match job.status.as_str() {
                "successful" => break,
                "failed" | "rejected" | "dismissed" => {
                    return Err(PipelineError::Network(format!(
                        "CDS job {} ended with status {}",
                        job.job_id, job.status
                    )))
                }
                status => {
                    tracing::debug!(job = %job.job_id, status, "waiting for CDS job");
                    thread::sleep(self.poll_interval);
                    job = ureq::get(format!("{api}/jobs/{}", job.job_id))
                        .header("PRIVATE-TOKEN", key)
                        .call()?
                        .body_mut()
                        .read_json()?;
                }
            }
        }

        let results: Value = ureq::get(format!("{api}/jobs/{}/results", job.job_id))
            .header("PRIVATE-TOKEN", key)
            .call()?
            .body_mut()
            .read_json()?;
        let href = results
            .pointer("/asset/value/href")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                PipelineError::Network(format!("CDS job {} returned no asset", job.job_id))
            })?;
        self.download(href, dest)
    }

    fn download(&self, url: &str, dest: &Path) -> Result<()> {
        tracing::info!(url, dest = %dest.display(), "downloading sample");
        let mut response = ureq::get(url).call()?;
        let partial = partial_path(dest);
        let mut file =
            File::create(&partial).map_err(|err| PipelineError::io_at("create", &partial, err))?;
        io::copy(&mut response.body_mut().as_reader(), &mut file).map_err(|err| {
            let _ = fs::remove_file(&partial);
            PipelineError::Network(format!("download {url}: {err}"))
        })?;
        fs::rename(&partial, dest).map_err(|err| PipelineError::io_at("rename", &partial, err))
    }
}

impl SampleFetcher for HttpFetcher {
    fn fetch(&self, request: &SampleRequest, dest: &Path) -> Result<()> {
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).map_err(|err| PipelineError::io_at("create", parent, err))?;
        }
        match request {
            SampleRequest::Cds { dataset, inputs } => self.retrieve_cds(dataset, inputs, dest),
            SampleRequest::Url(url) => self.download(url, dest),
        }
    }
}

fn partial_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().unwrap_or_default().to_os_string();
    name.push(".part");
    dest.with_file_name(name)
}
