use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use common::{join_relpath, relpath_from, Song};
use glob::{MatchOptions, Pattern};
use metadata::{read_song, TagDecoder};
use time::OffsetDateTime;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::config::{ScanConfig, ScanPolicy};
use crate::gains::GainBatcher;
use crate::pool::{Dispatch, WorkerPool};
use crate::state::ScanState;
use crate::ScanError;

const PROGRESS_INTERVAL: usize = 100;

// `*` and `?` stop at '/'.
const GLOB_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// Inputs that replace the timestamp comparison.
#[derive(Clone, Debug, Default)]
pub struct ScanOverrides {
    /// Reprocess every file whose relative path matches.
    pub force_glob: Option<String>,
    /// Process exactly these relative paths without walking the tree.
    pub paths: Option<Vec<String>>,
}

impl ScanOverrides {
    pub fn is_full_scan(&self) -> bool {
        self.force_glob.is_none() && self.paths.is_none()
    }

    /// Reads relative paths, one per line, skipping blank lines.
    pub fn paths_from_file(path: &Path) -> Result<Vec<String>, ScanError> {
        let contents = fs::read_to_string(path)?;
        Ok(contents
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingFile {
    pub path: PathBuf,
    pub relpath: String,
}

#[derive(Debug)]
pub struct ScanPlan {
    pub files: Vec<PendingFile>,
    /// Directories holding songs, sorted; only filled by full scans.
    pub seen_dirs: Option<Vec<String>>,
    pub examined: usize,
}

#[derive(Debug)]
pub struct FileFailure {
    pub path: PathBuf,
    pub error: ScanError,
}

#[derive(Debug)]
pub struct ScanOutcome {
    pub started: OffsetDateTime,
    pub songs: Vec<Song>,
    pub failures: Vec<FileFailure>,
    pub seen_dirs: Option<Vec<String>>,
}

impl ScanOutcome {
    /// State to persist, present only for a full scan with no failures.
    pub fn next_state(&self) -> Option<ScanState> {
        if !self.failures.is_empty() {
            return None;
        }
        self.seen_dirs.as_ref().map(|dirs| ScanState {
            time: self.started,
            dirs: dirs.clone(),
        })
    }
}

pub struct Scanner {
    config: ScanConfig,
    decoder: Arc<dyn TagDecoder>,
    gains: Option<Arc<GainBatcher>>,
}

impl Scanner {
    pub fn new(
        config: ScanConfig,
        decoder: Arc<dyn TagDecoder>,
        gains: Option<Arc<GainBatcher>>,
    ) -> Self {
        Self {
            config,
            decoder,
            gains,
        }
    }

    pub fn config(&self) -> &ScanConfig {
        &self.config
    }

    pub fn plan(
        &self,
        prior: Option<&ScanState>,
        overrides: &ScanOverrides,
    ) -> Result<ScanPlan, ScanError> {
        let root = &self.config.music_dir;
        if let Some(paths) = &overrides.paths {
            let files = paths
                .iter()
                .map(|relpath| PendingFile {
                    path: join_relpath(root, relpath),
                    relpath: relpath.clone(),
                })
                .collect::<Vec<_>>();
            return Ok(ScanPlan {
                examined: files.len(),
                files,
                seen_dirs: None,
            });
        }

        let force = overrides
            .force_glob
            .as_deref()
            .map(Pattern::new)
            .transpose()?;
        let cutoff: Option<SystemTime> = prior.map(|state| state.time.into());

        let mut files = Vec::new();
        let mut seen_dirs = BTreeSet::new();
        let mut examined = 0usize;
        for entry in WalkDir::new(root).follow_links(false) {
            let entry = entry?;
            if !entry.file_type().is_file() || !is_mp3(entry.path()) {
                continue;
            }
            let relpath = match relpath_from(root, entry.path()) {
                Some(relpath) => relpath,
                None => continue,
            };
            let reldir = match relpath.rfind('/') {
                Some(index) => relpath[..index].to_string(),
                None => ".".to_string(),
            };

            examined += 1;
            if examined % PROGRESS_INTERVAL == 0 {
                info!("Examined {} files", examined);
            }

            let include = match (&force, prior) {
                (Some(pattern), _) => pattern.matches_with(&relpath, GLOB_OPTIONS),
                (None, None) => true,
                (None, Some(state)) => {
                    let moved_into_new_dir = !state.dirs.is_empty() && !state.has_dir(&reldir);
                    moved_into_new_dir || changed_since(&entry.metadata()?, cutoff)
                }
            };
            seen_dirs.insert(reldir);
            if include {
                files.push(PendingFile {
                    path: entry.path().to_path_buf(),
                    relpath,
                });
            }
        }

        Ok(ScanPlan {
            files,
            seen_dirs: if overrides.is_full_scan() {
                Some(seen_dirs.into_iter().collect())
            } else {
                None
            },
            examined,
        })
    }

    /// Parses `files` on the worker pool. Exactly `count` results will arrive.
    pub fn dispatch(
        &self,
        files: Vec<PendingFile>,
    ) -> Result<Dispatch<Result<Song, FileFailure>>, ScanError> {
        let job = FileJob {
            decoder: Arc::clone(&self.decoder),
            gains: self.gains.clone(),
            config: self.config.clone(),
        };
        let pool = WorkerPool::new(self.config.workers, self.config.queue_depth);
        Ok(pool.dispatch(files, move |file| job.run(file))?)
    }

    pub fn collect(
        &self,
        dispatch: Dispatch<Result<Song, FileFailure>>,
    ) -> Result<(Vec<Song>, Vec<FileFailure>), ScanError> {
        let mut songs = Vec::with_capacity(dispatch.count);
        let mut failures = Vec::new();
        for received in 0..dispatch.count {
            let result = dispatch.recv().ok_or(ScanError::Interrupted {
                received,
                expected: dispatch.count,
            })?;
            match result {
                Ok(song) => songs.push(song),
                // Songs must not be sent without gains, whatever the policy.
                Err(failure) if matches!(failure.error, ScanError::Gain(_)) => {
                    return Err(ScanError::File {
                        path: failure.path,
                        source: Box::new(failure.error),
                    })
                }
                Err(failure) => match self.config.policy {
                    ScanPolicy::Abort => {
                        return Err(ScanError::File {
                            path: failure.path,
                            source: Box::new(failure.error),
                        })
                    }
                    ScanPolicy::Continue => {
                        warn!("Skipping {:?}: {}", failure.path, failure.error);
                        failures.push(failure);
                    }
                },
            }
            if (received + 1) % PROGRESS_INTERVAL == 0 {
                info!("Processed {} of {} files", received + 1, dispatch.count);
            }
        }
        Ok((songs, failures))
    }

    pub fn scan(
        &self,
        prior: Option<&ScanState>,
        overrides: &ScanOverrides,
    ) -> Result<ScanOutcome, ScanError> {
        let started = OffsetDateTime::now_utc();
        let plan = self.plan(prior, overrides)?;
        info!(
            "Found {} of {} file(s) to process",
            plan.files.len(),
            plan.examined
        );
        let dispatch = self.dispatch(plan.files)?;
        let (songs, failures) = self.collect(dispatch)?;
        Ok(ScanOutcome {
            started,
            songs,
            failures,
            seen_dirs: plan.seen_dirs,
        })
    }
}

struct FileJob {
    decoder: Arc<dyn TagDecoder>,
    gains: Option<Arc<GainBatcher>>,
    config: ScanConfig,
}

impl FileJob {
    fn run(&self, file: PendingFile) -> Result<Song, FileFailure> {
        self.read(&file).map_err(|error| FileFailure {
            path: file.path.clone(),
            error,
        })
    }

    fn read(&self, file: &PendingFile) -> Result<Song, ScanError> {
        let mut song = read_song(&file.path, &file.relpath, self.decoder.as_ref())?;
        if let Some(artist) = self.config.artist_rewrites.get(&song.artist) {
            song.artist = artist.clone();
        }
        if let Some(gains) = &self.gains {
            let info = gains.gains_for(&file.path, &song.album_id)?;
            song.apply_gains(&info);
        }
        if let Some(cover_dir) = &self.config.cover_dir {
            if let Some(cover) = find_cover(cover_dir, &song) {
                song.cover_filename = cover;
            }
        }
        debug!("Read {:?} ({})", file.relpath, song.sha1);
        Ok(song)
    }
}

fn changed_since(meta: &fs::Metadata, cutoff: Option<SystemTime>) -> bool {
    let cutoff = match cutoff {
        Some(cutoff) => cutoff,
        None => return true,
    };
    let modified = meta.modified().map(|t| t >= cutoff).unwrap_or(true);
    modified || status_changed_since(meta, cutoff)
}

#[cfg(unix)]
fn status_changed_since(meta: &fs::Metadata, cutoff: SystemTime) -> bool {
    use std::os::unix::fs::MetadataExt;
    use std::time::{Duration, UNIX_EPOCH};

    let ctime = if meta.ctime() >= 0 {
        UNIX_EPOCH + Duration::new(meta.ctime() as u64, meta.ctime_nsec() as u32)
    } else {
        UNIX_EPOCH
    };
    ctime >= cutoff
}

#[cfg(not(unix))]
fn status_changed_since(meta: &fs::Metadata, cutoff: SystemTime) -> bool {
    meta.created().map(|t| t >= cutoff).unwrap_or(false)
}

fn find_cover(cover_dir: &Path, song: &Song) -> Option<String> {
    [&song.cover_id, &song.album_id, &song.recording_id]
        .into_iter()
        .filter(|id| !id.is_empty())
        .map(|id| format!("{}.jpg", id))
        .find(|name| cover_dir.join(name).is_file())
}

pub(crate) fn is_mp3(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.to_string_lossy().eq_ignore_ascii_case("mp3"))
        .unwrap_or(false)
}
