//! Live views: local state seeded once and then kept current by events.

use crate::error::Result;

/// A view over remote data that is initialized from one snapshot and then
/// reconciled against a stream of events.
///
/// The feed engine and the unread counter both have this shape; the counter is
/// the degenerate case whose whole state is one integer.
pub trait LiveView {
    /// Result of the one-shot bulk query.
    type Snapshot;
    /// A resolved live event.
    type Event;

    /// Seed the view. A failed snapshot leaves the view empty but live.
    fn initialize(&mut self, snapshot: Result<Self::Snapshot>);

    /// Apply one live event.
    fn apply(&mut self, event: &Self::Event);

    /// Stop accepting events.
    fn teardown(&mut self);
}

/// Seed `view` with `snapshot`, then apply `events` in order.
pub fn replay<V, I>(view: &mut V, snapshot: Result<V::Snapshot>, events: I)
where
    V: LiveView,
    I: IntoIterator<Item = V::Event>,
{
    view.initialize(snapshot);
    for event in events {
        view.apply(&event);
    }
}
