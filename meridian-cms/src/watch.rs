//! Async stream of committed metadata snapshots.
//!
//! Wraps the service's state cell so consumers that think in streams (cache
//! refreshers, system-table updaters, tests) can observe committed snapshots
//! without polling. Snapshots coalesce under load: a slow consumer sees the
//! latest state, always in epoch order, not necessarily every intermediate
//! epoch.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures::stream::Stream;
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;

use meridian_core::ClusterMetadata;

pub struct MetadataStream {
    inner: Pin<Box<dyn Stream<Item = ClusterMetadata> + Send>>,
}

impl Stream for MetadataStream {
    type Item = ClusterMetadata;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

impl MetadataStream {
    pub fn new(stream: impl Stream<Item = ClusterMetadata> + Send + 'static) -> Self {
        Self {
            inner: Box::pin(stream),
        }
    }

    /// The first item is the snapshot current at subscription time; every
    /// later item is a newer committed snapshot.
    pub(crate) fn from_watch(rx: watch::Receiver<ClusterMetadata>) -> Self {
        Self {
            inner: Box::pin(WatchStream::new(rx)),
        }
    }
}
