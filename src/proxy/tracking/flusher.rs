use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::proxy::tracking::RequestRecord;

// Single consumer of the flush queue. Drains finished records into the
// durable store in batches; on shutdown the queue is drained before the
// task exits so no accepted record is lost.
pub fn spawn_flusher(
    mut flush_rx: mpsc::Receiver<RequestRecord>,
    batch_size: usize,
    cancel_token: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    let batch_size = batch_size.max(1);
    tokio::spawn(async move {
        let mut batch: Vec<RequestRecord> = Vec::with_capacity(batch_size);
        loop {
            tokio::select! {
                _ = cancel_token.cancelled() => {
                    // Drain whatever is still queued, then stop.
                    while let Ok(record) = flush_rx.try_recv() {
                        batch.push(record);
                        if batch.len() >= batch_size {
                            write_batch(std::mem::take(&mut batch)).await;
                        }
                    }
                    if !batch.is_empty() {
                        write_batch(std::mem::take(&mut batch)).await;
                    }
                    info!("[Flusher] Shutdown drain complete");
                    break;
                }
                received = flush_rx.recv() => {
                    match received {
                        Some(record) => {
                            batch.push(record);
                            // Opportunistically take what is already queued.
                            while batch.len() < batch_size {
                                match flush_rx.try_recv() {
                                    Ok(record) => batch.push(record),
                                    Err(_) => break,
                                }
                            }
                            write_batch(std::mem::take(&mut batch)).await;
                        }
                        None => {
                            info!("[Flusher] Flush queue closed, exiting");
                            break;
                        }
                    }
                }
            }
        }
    })
}

async fn write_batch(batch: Vec<RequestRecord>) {
    if batch.is_empty() {
        return;
    }
    let count = batch.len();
    let result = tokio::task::spawn_blocking(move || {
        crate::modules::persistence::tracker_db::write_batch(&batch)
    })
    .await;

    match result {
        Ok(Ok(())) => debug!("[Flusher] Persisted {} record(s)", count),
        Ok(Err(e)) => error!("[Flusher] Failed to persist {} record(s): {}", count, e),
        Err(e) => error!("[Flusher] Persist task join failed: {}", e),
    }
}
