use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::engine::{Engine, EngineError};

const CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Compact once `threshold` or more events have been appended since the
/// last rewrite. Returns whether a compaction ran.
pub async fn compact_if_due(engine: &Engine, threshold: u64) -> Result<bool, EngineError> {
    let appended = engine.wal_appends_since_compact().await;
    if appended == 0 || appended < threshold {
        return Ok(false);
    }
    engine.compact_wal().await?;
    info!(appended, "compacted ledger WAL");
    Ok(true)
}

/// Background task that keeps the WAL from growing without bound.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(CHECK_INTERVAL);
    loop {
        interval.tick().await;
        if let Err(e) = compact_if_due(&engine, threshold).await {
            warn!("compaction failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use rust_decimal::Decimal;
    use std::path::PathBuf;
    use ulid::Ulid;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("lotledger_test_compactor");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    #[tokio::test]
    async fn compacts_only_past_threshold() {
        let path = test_wal_path("threshold.wal");
        let engine = Engine::new(path).unwrap();
        let admin = Caller::admin();

        let lot = Ulid::new();
        engine
            .create_lot(
                &admin,
                LotSpec {
                    id: lot,
                    name: "Depot".into(),
                    address: "14 Rail Yard Road".into(),
                    pin_code: "110001".into(),
                    hourly_rate: Decimal::from(10),
                    capacity: 2,
                },
            )
            .await
            .unwrap();
        for n in 3..=5 {
            let patch = LotPatch {
                capacity: Some(n),
                ..Default::default()
            };
            engine.update_lot(&admin, lot, patch).await.unwrap();
        }

        assert!(!compact_if_due(&engine, 10).await.unwrap());
        assert_eq!(engine.wal_appends_since_compact().await, 4);

        assert!(compact_if_due(&engine, 4).await.unwrap());
        assert_eq!(engine.wal_appends_since_compact().await, 0);
        assert_eq!(engine.get_lot(&admin, lot).await.unwrap().capacity, 5);
    }
}
