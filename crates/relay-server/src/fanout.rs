//! Per-frame distribution to a session's subscribers.
//!
//! Delivery is best-effort per subscriber: a subscriber that cannot take a
//! frame is skipped or evicted according to [`OverflowPolicy`], and the
//! remaining subscribers still get the frame. Nothing here blocks.

use std::collections::HashMap;
use std::sync::Arc;

use metrics::counter;
use relay_core::{Frame, SubscriberId};
use tracing::{debug, warn};

use crate::config::OverflowPolicy;
use crate::metrics::{FRAMES_DISPATCHED_TOTAL, FRAMES_DROPPED_TOTAL, SUBSCRIBERS_EVICTED_TOTAL};
use crate::subscriber::{DeliveryError, Subscriber};

/// Outcome of dispatching one frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Subscribers the frame was queued to.
    pub delivered: usize,
    /// Subscribers that skipped this frame but stay attached.
    pub dropped: usize,
    /// Subscribers removed while dispatching this frame.
    pub evicted: usize,
}

/// Applies one [`OverflowPolicy`] to every dispatch.
#[derive(Debug, Clone, Copy, Default)]
pub struct FanoutEngine {
    policy: OverflowPolicy,
}

enum Verdict {
    Delivered,
    Dropped,
    Evict(&'static str),
}

impl FanoutEngine {
    /// Engine enforcing `policy`.
    pub fn new(policy: OverflowPolicy) -> Self {
        Self { policy }
    }

    /// Queue `frame` to every subscriber in `subscribers`.
    ///
    /// Evicted subscribers are removed from the map and returned so the
    /// caller can cancel them once it has released the session lock.
    pub fn fan_out(
        &self,
        subscribers: &mut HashMap<SubscriberId, Arc<Subscriber>>,
        frame: &Frame,
    ) -> (DispatchReport, Vec<Arc<Subscriber>>) {
        let mut report = DispatchReport::default();
        let mut evicted = Vec::new();

        subscribers.retain(|id, sub| match self.offer(sub, frame) {
            Verdict::Delivered => {
                report.delivered += 1;
                true
            }
            Verdict::Dropped => {
                report.dropped += 1;
                true
            }
            Verdict::Evict(reason) => {
                warn!(subscriber_id = %id, reason, "evicting subscriber");
                counter!(SUBSCRIBERS_EVICTED_TOTAL, "reason" => reason).increment(1);
                report.evicted += 1;
                evicted.push(Arc::clone(sub));
                false
            }
        });

        counter!(FRAMES_DISPATCHED_TOTAL).increment(report.delivered as u64);
        if report.dropped > 0 {
            counter!(FRAMES_DROPPED_TOTAL).increment(report.dropped as u64);
        }
        (report, evicted)
    }

    fn offer(&self, sub: &Subscriber, frame: &Frame) -> Verdict {
        match sub.try_deliver(frame.clone()) {
            Ok(()) => Verdict::Delivered,
            Err(DeliveryError::Closed) => Verdict::Evict("closed"),
            Err(DeliveryError::Full) => match self.policy {
                OverflowPolicy::Disconnect => Verdict::Evict("queue_full"),
                OverflowPolicy::DropFrames { max_drops } if sub.drop_count() >= max_drops => {
                    Verdict::Evict("too_many_drops")
                }
                OverflowPolicy::DropFrames { .. } => {
                    debug!(subscriber_id = %sub.id, drops = sub.drop_count(), "frame dropped");
                    Verdict::Dropped
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subscriber::Outbound;
    use tokio::sync::mpsc;

    struct Fixture {
        subs: HashMap<SubscriberId, Arc<Subscriber>>,
        queues: Vec<(SubscriberId, mpsc::Receiver<Outbound>)>,
    }

    fn fixture(capacities: &[usize]) -> Fixture {
        let mut subs = HashMap::new();
        let mut queues = Vec::new();
        for &cap in capacities {
            let (sub, rx) = Subscriber::new(cap);
            queues.push((sub.id.clone(), rx));
            let _ = subs.insert(sub.id.clone(), sub);
        }
        Fixture { subs, queues }
    }

    fn queued_text(rx: &mut mpsc::Receiver<Outbound>) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(Outbound::Frame(Frame::Text(t))) = rx.try_recv() {
            out.push(t.to_string());
        }
        out
    }

    #[test]
    fn every_subscriber_gets_the_frame_in_order() {
        let mut fx = fixture(&[8, 8, 8]);
        let engine = FanoutEngine::default();
        for msg in ["one", "two", "three"] {
            let (report, evicted) = engine.fan_out(&mut fx.subs, &Frame::text(msg));
            assert_eq!(report.delivered, 3);
            assert!(evicted.is_empty());
        }
        for (_, rx) in &mut fx.queues {
            assert_eq!(queued_text(rx), ["one", "two", "three"]);
        }
    }

    #[test]
    fn payload_is_shared_not_copied() {
        let mut fx = fixture(&[4, 4]);
        let frame = Frame::text("shared");
        let _ = FanoutEngine::default().fan_out(&mut fx.subs, &frame);
        for (_, rx) in &mut fx.queues {
            match rx.try_recv() {
                Ok(Outbound::Frame(queued)) => {
                    assert_eq!(queued.payload().as_ptr(), frame.payload().as_ptr());
                }
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[test]
    fn disconnect_policy_evicts_full_subscriber_only() {
        let mut fx = fixture(&[8, 1, 8]);
        let engine = FanoutEngine::new(OverflowPolicy::Disconnect);
        let slow = fx.queues[1].0.clone();

        let _ = engine.fan_out(&mut fx.subs, &Frame::text("a"));
        let (report, evicted) = engine.fan_out(&mut fx.subs, &Frame::text("b"));

        assert_eq!(report.delivered, 2);
        assert_eq!(report.evicted, 1);
        assert_eq!(evicted[0].id, slow);
        assert!(!fx.subs.contains_key(&slow));

        let (report, _) = engine.fan_out(&mut fx.subs, &Frame::text("c"));
        assert_eq!(report.delivered, 2);
        assert_eq!(queued_text(&mut fx.queues[0].1), ["a", "b", "c"]);
        assert_eq!(queued_text(&mut fx.queues[2].1), ["a", "b", "c"]);
    }

    #[test]
    fn drop_policy_skips_until_limit() {
        let mut fx = fixture(&[1]);
        let engine = FanoutEngine::new(OverflowPolicy::DropFrames { max_drops: 2 });
        let (r, _) = engine.fan_out(&mut fx.subs, &Frame::text("kept"));
        assert_eq!(r.delivered, 1);

        let (r, _) = engine.fan_out(&mut fx.subs, &Frame::text("x"));
        assert_eq!((r.dropped, r.evicted), (1, 0));

        let (r, evicted) = engine.fan_out(&mut fx.subs, &Frame::text("y"));
        assert_eq!(r.evicted, 1);
        assert_eq!(evicted.len(), 1);
        assert!(fx.subs.is_empty());
        assert_eq!(queued_text(&mut fx.queues[0].1), ["kept"]);
    }

    #[test]
    fn drained_queue_stops_dropping() {
        let mut fx = fixture(&[1]);
        let engine = FanoutEngine::new(OverflowPolicy::DropFrames { max_drops: 10 });
        let _ = engine.fan_out(&mut fx.subs, &Frame::text("1"));
        let (r, _) = engine.fan_out(&mut fx.subs, &Frame::text("2"));
        assert_eq!(r.dropped, 1);

        assert_eq!(queued_text(&mut fx.queues[0].1), ["1"]);
        let (r, _) = engine.fan_out(&mut fx.subs, &Frame::text("3"));
        assert_eq!(r.delivered, 1);
        assert_eq!(queued_text(&mut fx.queues[0].1), ["3"]);
    }

    #[test]
    fn closed_queue_is_evicted() {
        let mut fx = fixture(&[4, 4]);
        let (gone_id, gone_rx) = fx.queues.remove(0);
        drop(gone_rx);

        let (report, evicted) = FanoutEngine::default().fan_out(&mut fx.subs, &Frame::text("m"));
        assert_eq!(report.delivered, 1);
        assert_eq!(report.evicted, 1);
        assert_eq!(evicted[0].id, gone_id);
    }

    #[test]
    fn empty_session_is_a_no_op() {
        let mut subs = HashMap::new();
        let (report, evicted) = FanoutEngine::default().fan_out(&mut subs, &Frame::binary(vec![1u8]));
        assert_eq!(report, DispatchReport::default());
        assert!(evicted.is_empty());
    }
}
