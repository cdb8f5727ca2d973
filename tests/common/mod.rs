use duraflow::Event;
use duraflow::providers::HistoryStore;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Poll the store until the instance history satisfies `pred` or the timeout elapses.
#[allow(dead_code)]
pub async fn wait_for_history(
    store: &Arc<dyn HistoryStore>,
    instance: &str,
    pred: impl Fn(&[Event]) -> bool,
    timeout: Duration,
) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        let hist = store.read(instance).await;
        if pred(&hist) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Wait until a subscription for `name` is persisted for the instance.
#[allow(dead_code)]
pub async fn wait_for_subscription(
    store: &Arc<dyn HistoryStore>,
    instance: &str,
    name: &str,
    timeout: Duration,
) -> bool {
    wait_for_history(
        store,
        instance,
        |hist| {
            hist.iter()
                .any(|e| matches!(e, Event::ExternalSubscribed { name: n, .. } if n == name))
        },
        timeout,
    )
    .await
}
