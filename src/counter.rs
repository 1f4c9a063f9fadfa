//! Connection statistics, broken down by where a peer endpoint came from.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::PeerSource;

/// Counts live connections per peer source.
#[derive(Debug, Default)]
pub struct PeerCounters {
    tracker: AtomicUsize,
    pex: AtomicUsize,
    incoming: AtomicUsize,
}

/// A point-in-time copy of the counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PeerCounts {
    pub tracker: usize,
    pub pex: usize,
    pub incoming: usize,
}

impl PeerCounts {
    pub fn total(&self) -> usize {
        self.tracker + self.pex + self.incoming
    }
}

impl PeerCounters {
    pub(crate) fn register(&self, source: PeerSource) {
        self.cell(source).fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn deregister(&self, source: PeerSource) {
        self.cell(source).fetch_sub(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> PeerCounts {
        PeerCounts {
            tracker: self.tracker.load(Ordering::Relaxed),
            pex: self.pex.load(Ordering::Relaxed),
            incoming: self.incoming.load(Ordering::Relaxed),
        }
    }

    fn cell(&self, source: PeerSource) -> &AtomicUsize {
        match source {
            PeerSource::Tracker => &self.tracker,
            PeerSource::Pex => &self.pex,
            PeerSource::Incoming => &self.incoming,
        }
    }
}
