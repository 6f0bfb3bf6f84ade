use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus};
use std::sync::Arc;

use common::{join_relpath, GainInfo, Song};
use metadata::{read_album_id, TagDecoder};
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::scan::is_mp3;
use crate::ScanError;

/// Computes gain adjustments for files that belong to one album.
pub trait LoudnessAnalyzer: Send + Sync {
    fn analyze(&self, paths: &[PathBuf]) -> Result<HashMap<PathBuf, GainInfo>, GainError>;
}

#[derive(Debug)]
pub enum GainError {
    Io(std::io::Error),
    Command { status: ExitStatus, stderr: String },
    Output(String),
    Missing(PathBuf),
}

impl std::fmt::Display for GainError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GainError::Io(err) => write!(f, "io error: {}", err),
            GainError::Command { status, stderr } => {
                write!(f, "mp3gain failed ({}): {}", status, stderr.trim())
            }
            GainError::Output(message) => write!(f, "bad mp3gain output: {}", message),
            GainError::Missing(path) => write!(f, "no gain info for {}", path.display()),
        }
    }
}

impl std::error::Error for GainError {}

impl From<std::io::Error> for GainError {
    fn from(err: std::io::Error) -> Self {
        GainError::Io(err)
    }
}

/// Runs the `mp3gain` program.
#[derive(Clone, Debug)]
pub struct Mp3Gain {
    program: PathBuf,
}

impl Mp3Gain {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl LoudnessAnalyzer for Mp3Gain {
    fn analyze(&self, paths: &[PathBuf]) -> Result<HashMap<PathBuf, GainInfo>, GainError> {
        // Tab-delimited output, quiet, never touch stored tags.
        let output = Command::new(&self.program)
            .args(["-o", "-q", "-s", "s"])
            .args(paths)
            .output()?;
        if !output.status.success() {
            return Err(GainError::Command {
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            });
        }
        parse_mp3gain_output(&String::from_utf8_lossy(&output.stdout))
    }
}

pub fn parse_mp3gain_output(out: &str) -> Result<HashMap<PathBuf, GainInfo>, GainError> {
    let lines: Vec<&str> = out.trim().lines().collect();
    if lines.len() < 3 {
        return Err(GainError::Output(format!(
            "expected at least 3 lines, got {}",
            lines.len()
        )));
    }

    let summary = lines[lines.len() - 1];
    let (name, album_gain, _) = parse_mp3gain_line(summary)?;
    if name != "\"Album\"" {
        return Err(GainError::Output(format!(
            "expected album summary, got {:?}",
            summary
        )));
    }

    let mut out = HashMap::new();
    for line in &lines[1..lines.len() - 1] {
        let (path, track_gain, peak_amp) = parse_mp3gain_line(line)?;
        out.insert(
            PathBuf::from(path),
            GainInfo {
                track_gain,
                album_gain,
                peak_amp,
            },
        );
    }
    Ok(out)
}

// Fields: path, MP3 gain, dB gain, max amplitude, max global_gain, min global_gain.
fn parse_mp3gain_line(line: &str) -> Result<(&str, f64, f64), GainError> {
    let fields: Vec<&str> = line.split('\t').collect();
    if fields.len() != 6 {
        return Err(GainError::Output(format!(
            "{} field(s) in {:?}; want 6",
            fields.len(),
            line
        )));
    }
    let parse = |value: &str| {
        value
            .trim()
            .parse::<f64>()
            .map_err(|err| GainError::Output(format!("{:?} in {:?}: {}", value, line, err)))
    };
    let gain = parse(fields[2])?;
    // Amplitude is reported on a 16-bit scale.
    let peak = (parse(fields[3])? / 32767.0 * 100000.0).round() / 100000.0;
    Ok((fields[0], gain, peak))
}

/// Remembers computed gains per path and analyzes whole albums on first request.
pub struct GainBatcher {
    analyzer: Arc<dyn LoudnessAnalyzer>,
    decoder: Arc<dyn TagDecoder>,
    known: Mutex<HashMap<PathBuf, GainInfo>>,
}

impl GainBatcher {
    pub fn new(analyzer: Arc<dyn LoudnessAnalyzer>, decoder: Arc<dyn TagDecoder>) -> Self {
        Self {
            analyzer,
            decoder,
            known: Mutex::new(HashMap::new()),
        }
    }

    /// Reuses gains from an earlier export instead of recomputing them.
    pub fn seed(&self, music_dir: &Path, songs: &[Song]) -> usize {
        let mut known = self.known.lock();
        let mut seeded = 0;
        for song in songs {
            if song.track_gain == 0.0 && song.album_gain == 0.0 && song.peak_amp == 0.0 {
                continue;
            }
            known.insert(
                join_relpath(music_dir, &song.filename),
                GainInfo {
                    track_gain: song.track_gain,
                    album_gain: song.album_gain,
                    peak_amp: song.peak_amp,
                },
            );
            seeded += 1;
        }
        seeded
    }

    /// Analysis runs under the lock, one album group at a time.
    pub fn gains_for(&self, path: &Path, album_id: &str) -> Result<GainInfo, ScanError> {
        let mut known = self.known.lock();
        if let Some(info) = known.get(path) {
            return Ok(*info);
        }

        let group = self.album_group(path, album_id)?;
        if group.len() == 1 {
            info!("Computing gain adjustments for {:?}", path);
        } else {
            info!(
                "Computing gain adjustments for {} songs in {:?}",
                group.len(),
                path.parent().unwrap_or(path)
            );
        }
        let computed = self.analyzer.analyze(&group)?;
        known.extend(computed);
        known
            .get(path)
            .copied()
            .ok_or_else(|| GainError::Missing(path.to_path_buf()).into())
    }

    /// Files in `path`'s directory sharing its album ID. Without an ID the
    /// file is analyzed alone.
    fn album_group(&self, path: &Path, album_id: &str) -> Result<Vec<PathBuf>, ScanError> {
        let mut group = vec![path.to_path_buf()];
        if album_id.is_empty() {
            return Ok(group);
        }
        let dir = match path.parent() {
            Some(dir) => dir,
            None => return Ok(group),
        };
        let mut siblings: Vec<PathBuf> = fs::read_dir(dir)?
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|p| p != path && p.is_file() && is_mp3(p))
            .collect();
        siblings.sort();
        for sibling in siblings {
            match read_album_id(&sibling, self.decoder.as_ref()) {
                Ok(id) if id == album_id => group.push(sibling),
                Ok(_) => {}
                Err(err) => warn!("Skipping {:?} for album gain: {}", sibling, err),
            }
        }
        Ok(group)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use metadata::{DecodedTags, MetadataError};
    use std::fs::File;
    use std::io::Read;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Reads "album|album_id|artist|title" from the start of the file.
    pub struct TextDecoder;

    impl TagDecoder for TextDecoder {
        fn decode(&self, file: &mut File, _size: u64) -> Result<DecodedTags, MetadataError> {
            use std::io::{Seek, SeekFrom};
            let mut text = String::new();
            file.seek(SeekFrom::Start(0))?;
            file.take(64).read_to_string(&mut text).map_err(MetadataError::Io)?;
            let line = text.lines().next().unwrap_or_default();
            let parts: Vec<&str> = line.split('|').collect();
            if parts.len() != 4 {
                return Err(MetadataError::NoTag);
            }
            Ok(DecodedTags {
                album: Some(parts[0].to_string()),
                album_id: Some(parts[1].to_string()),
                artist: Some(parts[2].to_string()),
                title: Some(parts[3].to_string()),
                header_len: line.len() as u64 + 1,
                ..DecodedTags::default()
            })
        }
    }

    pub struct CountingAnalyzer {
        pub calls: AtomicUsize,
        pub batches: Mutex<Vec<Vec<PathBuf>>>,
    }

    impl CountingAnalyzer {
        pub fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                batches: Mutex::new(Vec::new()),
            }
        }
    }

    impl LoudnessAnalyzer for CountingAnalyzer {
        fn analyze(&self, paths: &[PathBuf]) -> Result<HashMap<PathBuf, GainInfo>, GainError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.batches.lock().push(paths.to_vec());
            Ok(paths
                .iter()
                .enumerate()
                .map(|(i, p)| {
                    let info = GainInfo {
                        track_gain: -(i as f64),
                        album_gain: -6.5,
                        peak_amp: 0.9,
                    };
                    (p.clone(), info)
                })
                .collect())
        }
    }

    pub struct FailingAnalyzer;

    impl LoudnessAnalyzer for FailingAnalyzer {
        fn analyze(&self, _paths: &[PathBuf]) -> Result<HashMap<PathBuf, GainInfo>, GainError> {
            Err(GainError::Output("boom".into()))
        }
    }

    #[test]
    fn parses_mp3gain_table() {
        let out = "File\tMP3 gain\tdB gain\tMax Amplitude\tMax global_gain\tMin global_gain\n\
                   /m/a.mp3\t-2\t-3.05\t32767.000000\t210\t114\n\
                   /m/b.mp3\t1\t1.5\t16383.500000\t200\t100\n\
                   \"Album\"\t-1\t-1.93\t32767.000000\t210\t100\n";
        let gains = parse_mp3gain_output(out).unwrap();
        assert_eq!(gains.len(), 2);
        let a = gains[Path::new("/m/a.mp3")];
        assert_eq!(a.track_gain, -3.05);
        assert_eq!(a.album_gain, -1.93);
        assert_eq!(a.peak_amp, 1.0);
        assert_eq!(gains[Path::new("/m/b.mp3")].peak_amp, 0.5);
    }

    #[test]
    fn rejects_output_without_summary() {
        let out = "File\tMP3 gain\tdB gain\tMax Amplitude\tMax global_gain\tMin global_gain\n\
                   /m/a.mp3\t-2\t-3.05\t32767\t210\t114\n\
                   /m/b.mp3\t1\t1.5\t16383.5\t200\t100\n";
        assert!(matches!(parse_mp3gain_output(out), Err(GainError::Output(_))));
    }

    #[test]
    fn analyzes_whole_album_once() {
        let dir = tempfile::tempdir().unwrap();
        for (name, tag) in [
            ("01.mp3", "LP|id-1|A|One"),
            ("02.mp3", "LP|id-1|A|Two"),
            ("03.MP3", "LP|id-1|A|Three"),
            ("bonus.mp3", "Other|id-2|A|Bonus"),
            ("notes.txt", "LP|id-1|A|Notes"),
        ] {
            fs::write(dir.path().join(name), format!("{}\n", tag)).unwrap();
        }
        let analyzer = Arc::new(CountingAnalyzer::new());
        let batcher = GainBatcher::new(analyzer.clone(), Arc::new(TextDecoder));

        let first = batcher
            .gains_for(&dir.path().join("02.mp3"), "id-1")
            .unwrap();
        assert_eq!(first.album_gain, -6.5);
        batcher
            .gains_for(&dir.path().join("01.mp3"), "id-1")
            .unwrap();
        assert_eq!(analyzer.calls.load(Ordering::SeqCst), 1);
        assert_eq!(analyzer.batches.lock()[0].len(), 3);

        batcher
            .gains_for(&dir.path().join("bonus.mp3"), "id-2")
            .unwrap();
        assert_eq!(analyzer.calls.load(Ordering::SeqCst), 2);
        assert_eq!(analyzer.batches.lock()[1].len(), 1);
    }

    #[test]
    fn files_without_album_id_stand_alone() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("01.mp3"), "LP||A|One\n").unwrap();
        fs::write(dir.path().join("02.mp3"), "LP||A|Two\n").unwrap();
        let analyzer = Arc::new(CountingAnalyzer::new());
        let batcher = GainBatcher::new(analyzer.clone(), Arc::new(TextDecoder));
        batcher.gains_for(&dir.path().join("01.mp3"), "").unwrap();
        assert_eq!(analyzer.batches.lock()[0], vec![dir.path().join("01.mp3")]);
    }

    #[test]
    fn album_id_groups_across_album_spellings() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("01.mp3"), "LP|id-7|A|One\n").unwrap();
        fs::write(dir.path().join("02.mp3"), "L.P.|id-7|A|Two\n").unwrap();
        fs::write(dir.path().join("03.mp3"), "LP|id-8|A|Three\n").unwrap();
        let analyzer = Arc::new(CountingAnalyzer::new());
        let batcher = GainBatcher::new(analyzer.clone(), Arc::new(TextDecoder));
        batcher.gains_for(&dir.path().join("01.mp3"), "id-7").unwrap();
        assert_eq!(
            analyzer.batches.lock()[0],
            vec![dir.path().join("01.mp3"), dir.path().join("02.mp3")]
        );
    }

    #[test]
    fn seeded_gains_skip_analysis() {
        let analyzer = Arc::new(CountingAnalyzer::new());
        let batcher = GainBatcher::new(analyzer.clone(), Arc::new(TextDecoder));
        let song = Song {
            filename: "x/y.mp3".into(),
            track_gain: -1.0,
            album_gain: -2.0,
            peak_amp: 0.8,
            ..Song::default()
        };
        assert_eq!(batcher.seed(Path::new("/music"), &[song]), 1);
        let info = batcher
            .gains_for(Path::new("/music/x/y.mp3"), "")
            .unwrap();
        assert_eq!(info.album_gain, -2.0);
        assert_eq!(analyzer.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn analyzer_failure_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.mp3"), "x\n").unwrap();
        let batcher = GainBatcher::new(Arc::new(FailingAnalyzer), Arc::new(TextDecoder));
        let err = batcher
            .gains_for(&dir.path().join("a.mp3"), "")
            .unwrap_err();
        assert!(matches!(err, ScanError::Gain(_)));
    }
}
