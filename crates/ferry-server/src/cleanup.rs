use std::time::Duration;

use ferry_transfer::{Backend, TransferService};
use tracing::debug;

/// Background task that forgets finished transfers.
///
/// Status records of completed or failed uploads are dropped once they are
/// older than `retention`; in-flight uploads are never touched.
pub async fn run_cleanup_loop(
    service: TransferService<Backend>,
    every: Duration,
    retention: Duration,
) {
    let mut interval = tokio::time::interval(every);

    loop {
        interval.tick().await;
        let pruned = service.prune_finished(retention);
        if pruned > 0 {
            debug!("Cleanup: forgot {} finished transfers", pruned);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use ferry_transfer::{MemoryStore, TransferConfig, TransferState};

    use super::*;

    async fn wait_for<F: Fn() -> bool>(done: F) -> bool {
        for _ in 0..200 {
            if done() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test]
    async fn finished_transfers_are_forgotten() {
        let service = TransferService::new(
            Arc::new(Backend::Memory(MemoryStore::new())),
            TransferConfig::default(),
        );
        let dir = tempfile::tempdir().unwrap();
        let spool = dir.path().join("never-written");
        let id = service.begin_upload(spool, "lost.bin");
        assert!(
            wait_for(|| service
                .status(&id)
                .is_some_and(|r| r.state == TransferState::Failed))
            .await
        );

        let task = tokio::spawn(run_cleanup_loop(
            service.clone(),
            Duration::from_millis(10),
            Duration::ZERO,
        ));
        assert!(wait_for(|| service.status(&id).is_none()).await);
        task.abort();
    }
}
