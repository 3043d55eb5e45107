use std::future::Future;
use std::sync::LazyLock;

use tokio::sync::Mutex;

static MACHINE_LOCK: LazyLock<Mutex<()>> = LazyLock::new(|| Mutex::new(()));

/// Serializes sections that must not run concurrently on one machine, such
/// as package-manager invocations inside the agent.
pub async fn machine_exclusive<F, T>(operation: F) -> T
where
    F: Future<Output = T>,
{
    let _guard = MACHINE_LOCK.lock().await;
    operation.await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn sections_never_overlap() {
        let active = Arc::new(AtomicU32::new(0));
        let mut tasks = Vec::new();
        for _ in 0..8 {
            let active = Arc::clone(&active);
            tasks.push(tokio::spawn(async move {
                machine_exclusive(async {
                    let now = active.fetch_add(1, Ordering::SeqCst);
                    assert_eq!(now, 0, "another section was active");
                    tokio::time::sleep(std::time::Duration::from_millis(2)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                })
                .await;
            }));
        }
        for task in tasks {
            task.await.expect("join");
        }
    }
}
