// Completion handoff: merge downloaded segments into the final output.

use crate::hls::HlsDownloaderError;
use crate::hls::config::MergeStrategy;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

/// Merge segment files into `dest`, in the order given.
///
/// Inputs must already be in admission order; completion order plays no
/// role here. On failure the inputs are left untouched so the caller can
/// preserve them.
pub async fn merge_segments(
    inputs: &[PathBuf],
    dest: &Path,
    strategy: MergeStrategy,
) -> Result<(), HlsDownloaderError> {
    if inputs.is_empty() {
        return Err(HlsDownloaderError::MergeError(
            "No segments to merge".to_string(),
        ));
    }
    match strategy {
        MergeStrategy::Concat => concat_segments(inputs, dest).await,
        MergeStrategy::Remux => remux_segments(inputs, dest).await,
    }
}

async fn concat_segments(inputs: &[PathBuf], dest: &Path) -> Result<(), HlsDownloaderError> {
    let mut out = File::create(dest).await?;
    for input in inputs {
        let mut f = File::open(input).await?;
        tokio::io::copy(&mut f, &mut out).await?;
    }
    out.flush().await?;
    info!(segments = inputs.len(), dest = %dest.display(), "Concatenated segments");
    Ok(())
}

/// Remux through ffmpeg's concat demuxer with stream copy.
async fn remux_segments(inputs: &[PathBuf], dest: &Path) -> Result<(), HlsDownloaderError> {
    let list_path = dest.with_extension("concat.txt");
    let mut list = String::new();
    for input in inputs {
        let absolute = tokio::fs::canonicalize(input).await?;
        // ffmpeg concat list entries use single-quoted paths
        list.push_str(&format!(
            "file '{}'\n",
            absolute.display().to_string().replace('\'', "'\\''")
        ));
    }
    tokio::fs::write(&list_path, &list).await?;

    debug!(list = %list_path.display(), "Invoking ffmpeg for remux");
    let output = tokio::process::Command::new("ffmpeg")
        .arg("-y")
        .arg("-f")
        .arg("concat")
        .arg("-safe")
        .arg("0")
        .arg("-i")
        .arg(&list_path)
        .arg("-c")
        .arg("copy")
        .arg(dest)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| HlsDownloaderError::MergeError(format!("Failed to run ffmpeg: {e}")))?;

    let _ = tokio::fs::remove_file(&list_path).await;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(HlsDownloaderError::MergeError(format!(
            "ffmpeg exited with {}: {}",
            output.status,
            stderr.lines().last().unwrap_or("")
        )));
    }
    info!(segments = inputs.len(), dest = %dest.display(), "Remuxed segments");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn concat_preserves_input_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut inputs = Vec::new();
        for (i, content) in [b"first-", b"secnd-", b"third-"].iter().enumerate() {
            let path = dir.path().join(format!("{i:05}_seg.ts"));
            tokio::fs::write(&path, content).await.unwrap();
            inputs.push(path);
        }

        let dest = dir.path().join("out.ts");
        merge_segments(&inputs, &dest, MergeStrategy::Concat)
            .await
            .unwrap();

        let merged = tokio::fs::read(&dest).await.unwrap();
        assert_eq!(merged, b"first-secnd-third-");
    }

    #[tokio::test]
    async fn empty_input_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out.ts");
        assert!(matches!(
            merge_segments(&[], &dest, MergeStrategy::Concat).await,
            Err(HlsDownloaderError::MergeError(_))
        ));
    }

    #[tokio::test]
    async fn missing_segment_file_fails_and_keeps_inputs() {
        let dir = tempfile::tempdir().unwrap();
        let present = dir.path().join("00000_seg.ts");
        tokio::fs::write(&present, b"data").await.unwrap();
        let missing = dir.path().join("00001_seg.ts");

        let dest = dir.path().join("out.ts");
        let result = merge_segments(
            &[present.clone(), missing],
            &dest,
            MergeStrategy::Concat,
        )
        .await;

        assert!(result.is_err());
        assert!(present.exists());
    }
}
