use std::path::PathBuf;
use std::time::Duration;

/// Progress events a session emits for UI consumption.
#[derive(Debug, Clone)]
pub enum DownloadEvent {
    /// New segments were admitted after a playlist refresh (or the initial
    /// load; for archives this fires once with the full plan).
    SegmentsAdmitted {
        new_segments: usize,
        total_admitted: u64,
    },
    SegmentCompleted {
        index: u64,
        bytes: u64,
        completed: usize,
        /// Known only for archive sessions
        total: Option<usize>,
        eta: Option<Duration>,
    },
    SegmentFailed {
        index: u64,
        url: String,
    },
    /// The live playlist carried EXT-X-ENDLIST
    StreamEnded,
    Merging {
        segments: usize,
    },
    Merged {
        path: PathBuf,
    },
}
