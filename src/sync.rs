/// Sync query path (pull) and event stream source (push).
///
/// Pull answers "everything in namespace N after version V". If there is
/// nothing new and the caller asked to wait, the request parks on a
/// broadcaster subscription until a notification arrives or the timeout
/// elapses, then re-reads the changelog once. This is a single round: the
/// client immediately re-issues the call with the returned cursor.
///
/// Client disconnects are handled by cancellation. When the HTTP layer drops
/// the request future, the [`Subscription`] it holds is dropped with it and
/// deregisters itself.
///
/// Push forwards every version notification of a namespace as a stream item.
/// It carries no entries and does not replay missed versions; clients
/// reconcile through the pull path.
use crate::error::SyncResult;
use crate::storage::SyncStore;
use crate::subscriptions::{Broadcaster, Subscription};
use crate::types::SyncResponse;
use futures::stream::{self, Stream};
use std::sync::Arc;
use std::time::Duration;

/// Pull changes for `namespace` newer than `since`, waiting up to `wait`
/// for new data if there is none yet.
pub async fn pull(
    store: &Arc<SyncStore>,
    broadcaster: &Arc<Broadcaster>,
    namespace: &str,
    since: i64,
    wait: Duration,
) -> SyncResult<SyncResponse> {
    let first = read(store, namespace, since).await?;
    if !first.changes.is_empty() || wait.is_zero() {
        return Ok(first);
    }

    let mut subscription = broadcaster.subscribe(namespace);

    // A batch may have committed between the first read and registration;
    // its notification went to nobody, so look once more before parking.
    let recheck = read(store, namespace, since).await?;
    if !recheck.changes.is_empty() {
        return Ok(recheck);
    }

    let woke = tokio::select! {
        version = subscription.recv() => version.is_some(),
        _ = tokio::time::sleep(wait) => false,
    };
    drop(subscription);

    if woke {
        read(store, namespace, since).await
    } else {
        tracing::trace!("Long-poll on {} timed out at cursor {}", namespace, recheck.version);
        Ok(recheck)
    }
}

async fn read(store: &Arc<SyncStore>, namespace: &str, since: i64) -> SyncResult<SyncResponse> {
    let ns = namespace.to_string();
    let (changes, version) = store.run(move |s| s.changes_since(&ns, since)).await?;
    Ok(SyncResponse { version, changes })
}

/// Turn a subscription into a stream of version numbers.
///
/// The stream ends only if the subscription is deregistered elsewhere;
/// dropping the stream deregisters it.
pub fn version_stream(subscription: Subscription) -> impl Stream<Item = i64> + Send + 'static + use<> {
    stream::unfold(subscription, |mut subscription| async move {
        subscription
            .recv()
            .await
            .map(|version| (version, subscription))
    })
}
