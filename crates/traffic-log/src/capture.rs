use std::path::{Path, PathBuf};

use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};

use crate::record::TrafficLine;

#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("failed to create capture directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to open capture file {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode traffic line: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("failed to write capture file: {0}")]
    Io(#[source] std::io::Error),
}

/// Buffered JSON-lines file. Lines reach the disk on [`flush`](Self::flush).
pub struct CaptureFile {
    out: BufWriter<File>,
    lines: u64,
}

impl CaptureFile {
    /// Open `path` for appending, creating missing parent directories.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, CaptureError> {
        let path = path.as_ref();
        if let Some(dir) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|source| CaptureError::CreateDir {
                    path: dir.to_path_buf(),
                    source,
                })?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(|source| CaptureError::Open {
                path: path.to_path_buf(),
                source,
            })?;

        Ok(Self {
            out: BufWriter::new(file),
            lines: 0,
        })
    }

    pub async fn append(&mut self, line: &TrafficLine) -> Result<(), CaptureError> {
        let mut encoded = serde_json::to_vec(line)?;
        encoded.push(b'\n');
        self.out.write_all(&encoded).await.map_err(CaptureError::Io)?;
        self.lines += 1;
        Ok(())
    }

    pub async fn flush(&mut self) -> Result<(), CaptureError> {
        self.out.flush().await.map_err(CaptureError::Io)
    }

    /// Lines appended through this handle.
    pub fn lines(&self) -> u64 {
        self.lines
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::record::{Direction, TrafficRecord};

    fn line(seq: u64) -> TrafficLine {
        TrafficLine {
            seq,
            at: Utc::now(),
            record: TrafficRecord::closed(Direction::Client, None),
        }
    }

    #[tokio::test]
    async fn nothing_reaches_disk_before_flush() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("capture.jsonl");

        let mut file = CaptureFile::open(&path).await.unwrap();
        file.append(&line(0)).await.unwrap();
        file.append(&line(1)).await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "");

        file.flush().await.unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        let seqs: Vec<u64> = contents
            .lines()
            .map(|l| serde_json::from_str::<TrafficLine>(l).unwrap().seq)
            .collect();
        assert_eq!(seqs, vec![0, 1]);
        assert_eq!(file.lines(), 2);
    }

    #[tokio::test]
    async fn reopening_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capture.jsonl");

        for seq in 0..2 {
            let mut file = CaptureFile::open(&path).await.unwrap();
            file.append(&line(seq)).await.unwrap();
            file.flush().await.unwrap();
        }

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 2);
    }

    #[tokio::test]
    async fn open_failure_names_the_path() {
        let dir = tempfile::tempdir().unwrap();
        // A directory cannot be opened as the capture file.
        let err = CaptureFile::open(dir.path()).await.err().unwrap();
        assert!(matches!(err, CaptureError::Open { .. }));
        assert!(err.to_string().contains(&dir.path().display().to_string()));
    }
}
