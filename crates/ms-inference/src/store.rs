//! Persisted state keyed by run identifiers.
//!
//! Layout: `<root>/massscales_<tag>_<run>/` holding one JSON file per stage plus
//! CSV exports and the run report. Files are written to a temporary name and
//! renamed, so a stage that fails midway leaves the previous output intact.

use std::fs;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use ms_core::{BiasCoefficient, BiasVector, BinSchema, Error, Result};

use crate::artifacts::{ArtifactHeader, Stage2Artifact, StageArtifact};

/// Directory-backed artifact store.
#[derive(Debug, Clone)]
pub struct RunStore {
    root: PathBuf,
}

impl RunStore {
    /// Store rooted at `root` (created on first write).
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory of run `tag`/`run`.
    pub fn run_dir(&self, tag: &str, run: &str) -> PathBuf {
        self.root.join(format!("massscales_{tag}_{run}"))
    }

    /// Whether the artifact of type `A` exists for `tag`/`run`.
    pub fn exists<A: StageArtifact>(&self, tag: &str, run: &str) -> bool {
        self.run_dir(tag, run).join(A::FILE_NAME).is_file()
    }

    /// Write `artifact` as pretty JSON, replacing any previous version.
    pub fn save<A: StageArtifact>(&self, artifact: &A) -> Result<PathBuf> {
        let header = artifact.header();
        let dir = self.run_dir(&header.tag, &header.run);
        fs::create_dir_all(&dir)?;
        let path = dir.join(A::FILE_NAME);
        let tmp = dir.join(format!("{}.tmp", A::FILE_NAME));
        {
            let mut w = BufWriter::new(fs::File::create(&tmp)?);
            serde_json::to_writer_pretty(&mut w, artifact)?;
            w.flush()?;
        }
        fs::rename(&tmp, &path)?;
        tracing::debug!(path = %path.display(), stage = A::STAGE, "artifact written");
        Ok(path)
    }

    /// Load the artifact of type `A` and check it against `expected`.
    ///
    /// A missing file is [`Error::MissingState`]; a different binning, axis or
    /// schema version is [`Error::SchemaMismatch`].
    pub fn load<A: StageArtifact>(&self, expected: &ArtifactHeader) -> Result<A> {
        let path = self.run_dir(&expected.tag, &expected.run).join(A::FILE_NAME);
        let artifact: A = read_json(&path)?;
        artifact.header().check(A::STAGE, expected)?;
        Ok(artifact)
    }

    /// Write a text file (CSV export, report) into the run directory.
    pub fn write_text(&self, tag: &str, run: &str, name: &str, content: &str) -> Result<PathBuf> {
        let dir = self.run_dir(tag, run);
        fs::create_dir_all(&dir)?;
        let path = dir.join(name);
        fs::write(&path, content)?;
        Ok(path)
    }

    /// Cumulative bias of a previous run, restricted to `keep`.
    ///
    /// Falls back to zeros with a warning when the previous run has no fit artifact.
    /// A previous run with a different binning is an error.
    pub fn previous_cumulative(
        &self,
        tag: &str,
        run: &str,
        binning: &BinSchema,
        keep: &[BiasCoefficient],
    ) -> Result<BiasVector> {
        let n_slots = binning.eta_edges.len().saturating_sub(1);
        let path = self.run_dir(tag, run).join(Stage2Artifact::FILE_NAME);
        let artifact: Stage2Artifact = match read_json(&path) {
            Ok(a) => a,
            Err(Error::MissingState(msg)) => {
                tracing::warn!(tag, run, "{msg}; previous bias taken as zero");
                return Ok(BiasVector::zeros(n_slots));
            }
            Err(e) => return Err(e),
        };
        binning.ensure_matches(&artifact.header.binning)?;
        artifact.snapshot.cumulative.validate(n_slots)?;
        tracing::info!(tag, run, "previous cumulative bias loaded");
        Ok(artifact.snapshot.cumulative.restricted_to(keep))
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let file = match fs::File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(Error::MissingState(format!("{} not found", path.display())));
        }
        Err(e) => return Err(e.into()),
    };
    Ok(serde_json::from_reader(BufReader::new(file))?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::{Stage1Artifact, Stage2Artifact};
    use crate::wls::{FitterConfig, SummaryTables};
    use ms_core::{Axis, BiasSnapshot, KinematicBinner};

    fn temp_root(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("ms-store-{}-{name}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        dir
    }

    fn binner() -> KinematicBinner {
        KinematicBinner::new(vec![-1.0, 0.0, 1.0], vec![25.0, 40.0, 55.0]).unwrap()
    }

    fn header(stage: u8, run: &str) -> ArtifactHeader {
        ArtifactHeader::new(stage, "closure", run, &binner(), Axis::mass(), Axis::residual())
    }

    fn stage2(run: &str, cumulative: BiasVector) -> Stage2Artifact {
        Stage2Artifact {
            header: header(2, run),
            fit_config: FitterConfig::default(),
            rows: Vec::new(),
            summary: SummaryTables::from_rows(16, &[]),
            fitted: BiasVector::zeros(2),
            snapshot: BiasSnapshot::zeros(2).with_cumulative(cumulative).unwrap(),
            mass_fits: Vec::new(),
        }
    }

    #[test]
    fn test_save_load_roundtrip_and_checks() {
        let store = RunStore::new(temp_root("roundtrip"));
        let art = Stage1Artifact { header: header(1, "0"), histograms: Vec::new() };
        assert!(!store.exists::<Stage1Artifact>("closure", "0"));
        let path = store.save(&art).unwrap();
        assert!(path.ends_with("massscales_closure_0/stage1.json"));
        assert!(store.exists::<Stage1Artifact>("closure", "0"));

        let back: Stage1Artifact = store.load(&header(1, "0")).unwrap();
        assert_eq!(back, art);

        let missing = store.load::<Stage1Artifact>(&header(1, "1"));
        assert!(matches!(missing, Err(Error::MissingState(_))));

        let other = KinematicBinner::new(vec![-1.0, 1.0], vec![25.0, 55.0]).unwrap();
        let mut expected = header(1, "0");
        expected.binning = other.schema();
        assert!(matches!(store.load::<Stage1Artifact>(&expected), Err(Error::SchemaMismatch(_))));
        let _ = fs::remove_dir_all(store.root());
    }

    #[test]
    fn test_previous_cumulative_fallback_and_restriction() {
        let store = RunStore::new(temp_root("previous"));
        let schema = binner().schema();
        let scale = [BiasCoefficient::A, BiasCoefficient::E, BiasCoefficient::M];

        let zeros = store.previous_cumulative("closure", "9", &schema, &scale).unwrap();
        assert_eq!(zeros, BiasVector::zeros(2));

        let mut cumulative = BiasVector::zeros(2);
        cumulative.a = vec![1e-3, 2e-3];
        cumulative.c = vec![0.1, 0.2];
        store.save(&stage2("0", cumulative)).unwrap();
        let prev = store.previous_cumulative("closure", "0", &schema, &scale).unwrap();
        assert_eq!(prev.a, vec![1e-3, 2e-3]);
        assert_eq!(prev.c, vec![0.0, 0.0]);
        let prev = store
            .previous_cumulative("closure", "0", &schema, &[BiasCoefficient::C, BiasCoefficient::D])
            .unwrap();
        assert_eq!(prev.a, vec![0.0, 0.0]);
        assert_eq!(prev.c, vec![0.1, 0.2]);
        let _ = fs::remove_dir_all(store.root());
    }
}
