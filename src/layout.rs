//! Files of a run, all below `<output_dir>/<tas folder>/`.

use crate::api::Submission;
use crate::data::{AwardId, Error};
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};
use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use tracing::debug;

const MARKER: &str = ".downloaded_at";

/// Replace every character that is not ASCII alphanumeric, `-` or `_`.
pub fn safe_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct Layout {
    root: PathBuf,
    summary: String,
}

impl Layout {
    pub fn new(output_dir: &Path, tas: &str, summary_name: Option<&str>) -> Self {
        let folder = safe_name(tas);
        Self {
            root: output_dir.join(&folder),
            summary: summary_name.map(safe_name).unwrap_or(folder),
        }
    }

    pub fn create(&self) -> Result<(), Error> {
        fs::create_dir_all(self.downloads())?;
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn program_activity(&self) -> PathBuf {
        self.root.join("program_activity.json")
    }

    /// Partial-result warnings of the last run of each stage.
    pub fn warnings(&self) -> PathBuf {
        self.root.join("warnings.json")
    }

    pub fn award_search(&self) -> PathBuf {
        self.root.join("award_search.json")
    }

    /// Award id filter the saved search was run with.
    pub fn award_search_filter(&self) -> PathBuf {
        self.root.join("award_search_filter.json")
    }

    pub fn download_status(&self) -> PathBuf {
        self.root.join("download_status.json")
    }

    pub fn downloads(&self) -> PathBuf {
        self.root.join("downloads")
    }

    pub fn award_dir(&self, award_id: &str) -> PathBuf {
        self.downloads().join(safe_name(award_id))
    }

    pub fn pending_file(&self, award_id: &str) -> PathBuf {
        self.downloads()
            .join(format!("pending_{}.json", safe_name(award_id)))
    }

    /// One of the combined outputs: `FederalAccountFunding`, `Sub-Awards`, `TransactionHistory`.
    pub fn combined_table(&self, tag: &str) -> PathBuf {
        self.root.join(format!("{}_{tag}.csv", self.summary))
    }

    pub fn report_text(&self) -> PathBuf {
        self.root.join(format!("{}_reconciliation.txt", self.summary))
    }

    pub fn report_json(&self) -> PathBuf {
        self.root.join(format!("{}_reconciliation.json", self.summary))
    }

    /// When the award was last extracted, if ever.
    pub fn read_marker(&self, award_id: &str) -> Result<Option<DateTime<Utc>>, Error> {
        let path = self.award_dir(award_id).join(MARKER);
        if !path.exists() {
            return Ok(None);
        }
        let text = fs::read_to_string(&path)?;
        DateTime::parse_from_rfc3339(text.trim())
            .map(|at| Some(at.with_timezone(&Utc)))
            .map_err(|e| Error::Format(format!("{}: {e}", path.display())))
    }

    pub fn write_marker(&self, award_id: &str, at: DateTime<Utc>) -> Result<(), Error> {
        fs::write(self.award_dir(award_id).join(MARKER), at.to_rfc3339())?;
        Ok(())
    }

    pub fn read_pending(&self, award_id: &str) -> Result<Option<Submission>, Error> {
        load_json(&self.pending_file(award_id))
    }

    pub fn write_pending(&self, award_id: &str, submission: &Submission) -> Result<(), Error> {
        save_json(&self.pending_file(award_id), submission)
    }

    pub fn clear_pending(&self, award_id: &str) -> Result<(), Error> {
        match fs::remove_file(self.pending_file(award_id)) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    /// Unpack an award archive into its own directory, replacing whatever
    /// an earlier download left there. Nothing is kept if the archive is
    /// corrupt, so the award is retried on the next run.
    pub fn extract_archive(&self, award_id: &str, bytes: &[u8]) -> Result<PathBuf, Error> {
        let dir = self.award_dir(award_id);
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
        }
        fs::create_dir_all(&dir)?;
        let unpacked = zip::ZipArchive::new(Cursor::new(bytes))
            .and_then(|mut archive| archive.extract(&dir));
        if let Err(e) = unpacked {
            fs::remove_dir_all(&dir)?;
            return Err(e.into());
        }
        debug!(award_id = %award_id, dir = %dir.display(), "Archive extracted");
        Ok(dir)
    }

    /// Awards whose extraction completed (the marker is written last).
    pub fn extracted_awards(&self) -> Result<Vec<AwardId>, Error> {
        let mut ids = Vec::new();
        let downloads = self.downloads();
        if !downloads.exists() {
            return Ok(ids);
        }
        for entry in fs::read_dir(downloads)? {
            let entry = entry?;
            if entry.path().join(MARKER).exists() {
                ids.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        ids.sort();
        Ok(ids)
    }
}

pub fn load_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, Error> {
    if !path.exists() {
        return Ok(None);
    }
    let text = fs::read(path)?;
    Ok(Some(serde_json::from_slice(&text)?))
}

/// Write through a temporary sibling so an interrupted run never leaves a
/// truncated document behind.
pub fn save_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), Error> {
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, serde_json::to_vec_pretty(value)?)?;
    fs::rename(&tmp, path)?;
    Ok(())
}
