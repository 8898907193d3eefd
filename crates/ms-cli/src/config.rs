//! Run configuration file: pipeline settings plus the event sample to feed.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use ms_core::{EventRecord, KinematicBinner};
use ms_inference::{DimuonEvent, EventFeed, PipelineConfig, RecordFeed, ToyFeed, ToySmearer};
use serde::Deserialize;
use sha2::{Digest, Sha256};

/// Where the events come from.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SampleConfig {
    /// Number of generated toy events when no input file is given.
    pub n_events: usize,
    /// Seed of the toy generator.
    pub events_seed: u64,
    /// JSON array of dimuon events, smeared at every stage.
    pub events: Option<PathBuf>,
    /// JSON array of already smeared per-event records.
    pub records: Option<PathBuf>,
}

impl Default for SampleConfig {
    fn default() -> Self {
        Self { n_events: 200_000, events_seed: 17, events: None, records: None }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RunConfig {
    #[serde(flatten)]
    pub pipeline: PipelineConfig,

    #[serde(default)]
    pub sample: SampleConfig,

    /// Root of the run store.
    #[serde(default = "default_out_dir")]
    pub out_dir: PathBuf,

    /// Threads (0 = auto).
    #[serde(default)]
    pub threads: usize,
}

fn default_out_dir() -> PathBuf {
    PathBuf::from("massscales_out")
}

/// Configuration and the SHA-256 of its file content.
pub fn read_run_config(path: &Path) -> Result<(RunConfig, String)> {
    let bytes =
        std::fs::read(path).with_context(|| format!("reading config {}", path.display()))?;
    let ext = path.extension().and_then(|s| s.to_str()).unwrap_or("").to_ascii_lowercase();
    let cfg: RunConfig = if ext == "json" {
        serde_json::from_slice(&bytes)?
    } else {
        // Default: YAML (serde_yaml_ng).
        serde_yaml_ng::from_slice(&bytes)?
    };
    Ok((cfg, sha256_hex(&bytes)))
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut h = Sha256::new();
    h.update(bytes);
    let digest = h.finalize();
    let mut s = String::with_capacity(digest.len() * 2);
    for b in digest {
        s.push_str(&format!("{:02x}", b));
    }
    s
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Build the event feed described by `sample`.
pub fn build_feed(
    sample: &SampleConfig,
    pipeline: &PipelineConfig,
    binner: &KinematicBinner,
) -> Result<Box<dyn EventFeed>> {
    if let Some(path) = &sample.records {
        let records: Vec<EventRecord> = read_json(path)?;
        tracing::info!(path = %path.display(), records = records.len(), "records loaded");
        return Ok(Box::new(RecordFeed::new(records)));
    }
    let events: Vec<DimuonEvent> = match &sample.events {
        Some(path) => {
            let events: Vec<DimuonEvent> = read_json(path)?;
            tracing::info!(path = %path.display(), events = events.len(), "events loaded");
            events
        }
        None => {
            tracing::info!(n = sample.n_events, seed = sample.events_seed, "generating toy events");
            ms_inference::generate_dimuons(binner, sample.n_events, sample.events_seed)?
        }
    };
    let smearer = ToySmearer::new(binner.clone(), pipeline.resolution_model()?)
        .with_mc_as_data(pipeline.injection.use_mc_as_data);
    Ok(Box::new(ToyFeed::new(smearer, events, pipeline.seed, pipeline.n_slots)))
}
