use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::engine::Engine;

/// Compact the journal once it has grown by `threshold` appends.
/// Returns whether a compaction ran.
pub async fn compact_if_needed(engine: &Engine, threshold: u64) -> bool {
    let appends = engine.journal_appends_since_compact().await;
    if appends < threshold {
        return false;
    }
    match engine.compact_wal().await {
        Ok(()) => {
            metrics::counter!(crate::observability::WAL_COMPACTIONS_TOTAL).increment(1);
            info!("compacted journal after {appends} appends");
            true
        }
        Err(e) => {
            tracing::warn!("journal compaction failed: {e}");
            false
        }
    }
}

/// Background task that keeps the journal from growing without bound.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        compact_if_needed(&engine, threshold).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use std::path::PathBuf;
    use ulid::Ulid;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("roomledger_test_compactor");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    #[tokio::test]
    async fn compacts_only_past_threshold() {
        let path = test_wal_path("threshold.wal");
        let engine = Engine::open(&path).unwrap();

        let room = Ulid::new();
        engine.create_room(Room::new(room, "Orion")).await.unwrap();
        engine.update_room(room, RoomPatch { chairs: Some(4), ..Default::default() })
            .await
            .unwrap();
        assert!(!compact_if_needed(&engine, 5).await);
        assert_eq!(engine.journal_appends_since_compact().await, 2);

        for i in 0..4 {
            engine
                .update_room(room, RoomPatch { chairs: Some(i), ..Default::default() })
                .await
                .unwrap();
        }
        assert!(compact_if_needed(&engine, 5).await);
        assert_eq!(engine.journal_appends_since_compact().await, 0);
        drop(engine);

        let engine = Engine::open(&path).unwrap();
        assert_eq!(engine.get_room(&room).unwrap().chairs, 3);
        let _ = std::fs::remove_file(&path);
    }
}
