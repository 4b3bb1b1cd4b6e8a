//! Error-drain worker.
//!
//! One long-lived task owns the error streams of every live external
//! command and moves whatever they produce into the owning job's error
//! buffers. The foreground shows the buffered output on its next sweep.
//!
//! ```text
//!   spawn ──(job, stderr)──▶ hand-off channel ──▶ drain worker ──▶ job errors
//!   check / wait_errors ──────── wake ──────────────┘
//! ```
//!
//! The worker holds one `use_count` reference per stream, taken by the
//! foreground before the hand-off. It never touches the registry: once a
//! stream reaches EOF the worker releases its hold and the foreground reaps
//! the job. Hand-off and wake are deliberately separate channels; collapsing
//! them risks missing new work while streams are quiet.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::FuturesUnordered;
use futures::StreamExt;
use tokio::io::AsyncReadExt;
use tokio::process::ChildStderr;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::Notify;

use skua_types::JobKind;

use crate::job::BgJob;

/// Upper bound on a single error-stream read.
pub(crate) const ERR_CHUNK: usize = 1024;

/// How long the worker waits on live streams before refreshing its list.
const SELECT_TIMEOUT: Duration = Duration::from_millis(250);

/// A command whose error stream the worker still owns.
pub(crate) struct DrainEntry {
    job: Arc<BgJob>,
    stream: ChildStderr,
    /// The stream reached EOF; the next refresh releases the hold.
    drained: bool,
}

impl DrainEntry {
    pub(crate) fn new(job: Arc<BgJob>, stream: ChildStderr) -> Self {
        Self {
            job,
            stream,
            drained: false,
        }
    }
}

/// One outcome of racing the streams against the wake paths.
enum Step {
    Chunk(usize, std::io::Result<usize>, [u8; ERR_CHUNK]),
    Handoff(Option<DrainEntry>),
    Wake,
    Timeout,
}

/// Worker loop. Runs until the hand-off channel closes, which happens when
/// the engine itself is dropped.
pub(crate) async fn drain_error_streams(
    mut handoff: UnboundedReceiver<DrainEntry>,
    wake: Arc<Notify>,
) {
    let mut entries: Vec<DrainEntry> = Vec::new();

    loop {
        // Refresh: let go of exhausted streams, then pick up new work,
        // blocking only when there is nothing left to watch.
        release_drained(&mut entries);
        while let Ok(entry) = handoff.try_recv() {
            import(&mut entries, entry);
        }
        if entries.is_empty() {
            match handoff.recv().await {
                Some(entry) => import(&mut entries, entry),
                None => return,
            }
            continue;
        }

        // Shuffle bytes until something forces a list refresh.
        loop {
            let step = {
                let mut reads: FuturesUnordered<_> = entries
                    .iter_mut()
                    .enumerate()
                    .filter(|(_, entry)| !entry.drained)
                    .map(|(idx, entry)| async move {
                        let mut buf = [0u8; ERR_CHUNK];
                        let res = entry.stream.read(&mut buf).await;
                        (idx, res, buf)
                    })
                    .collect();

                tokio::select! {
                    Some((idx, res, buf)) = reads.next() => Step::Chunk(idx, res, buf),
                    entry = handoff.recv() => Step::Handoff(entry),
                    _ = wake.notified() => Step::Wake,
                    _ = tokio::time::sleep(SELECT_TIMEOUT) => Step::Timeout,
                }
            };

            match step {
                Step::Chunk(idx, Ok(n), buf) if n > 0 => {
                    entries[idx].job.append_error(&buf[..n]);
                }
                Step::Chunk(idx, _, _) => {
                    // EOF or read error; either way the stream is done.
                    entries[idx].drained = true;
                    break;
                }
                Step::Handoff(Some(entry)) => {
                    import(&mut entries, entry);
                    break;
                }
                Step::Handoff(None) => return,
                Step::Wake | Step::Timeout => break,
            }
        }
    }
}

/// Releases the hold on every entry whose stream is exhausted. Dropping the
/// entry closes the stream.
fn release_drained(entries: &mut Vec<DrainEntry>) {
    entries.retain(|entry| {
        if entry.drained {
            entry.job.release_drain_hold();
            false
        } else {
            true
        }
    });
}

fn import(entries: &mut Vec<DrainEntry>, entry: DrainEntry) {
    debug_assert_eq!(
        entry.job.kind(),
        JobKind::Command,
        "only external commands carry error streams"
    );
    entries.push(entry);
}
