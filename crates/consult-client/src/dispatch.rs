//! Routes decoded frames to interested handlers by their `type`
//! discriminator. Adding a frame kind means adding a subscription, not
//! editing a branch chain.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use consult_proto::{Frame, FrameKind};

use crate::channel::FrameReceiver;

/// Registration table from frame kind to subscriber queues. Dispatch is
/// synchronous and preserves arrival order per subscriber; kinds with no
/// route are dropped with a trace log.
#[derive(Default)]
pub struct FrameDispatcher {
    routes: RwLock<HashMap<FrameKind, Vec<mpsc::UnboundedSender<Frame>>>>,
}

impl FrameDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers interest in a set of frame kinds. Each matching frame
    /// is delivered to the returned receiver in arrival order.
    pub fn subscribe(&self, kinds: &[FrameKind]) -> FrameReceiver {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut routes = self.routes.write();
        for kind in kinds {
            routes.entry(*kind).or_default().push(tx.clone());
        }
        rx
    }

    pub fn dispatch(&self, frame: Frame) {
        let kind = frame.kind();
        let mut dead_route = false;
        {
            let routes = self.routes.read();
            match routes.get(&kind) {
                Some(senders) if !senders.is_empty() => {
                    for sender in senders {
                        if sender.send(frame.clone()).is_err() {
                            dead_route = true;
                        }
                    }
                }
                _ => {
                    tracing::trace!(target = "relay", kind = kind.as_str(), "no route for frame");
                }
            }
        }
        if dead_route {
            self.routes
                .write()
                .entry(kind)
                .or_default()
                .retain(|sender| !sender.is_closed());
        }
    }

    /// Pumps a channel's inbound frames through the table until the
    /// channel closes.
    pub fn run(self: Arc<Self>, mut frames: FrameReceiver) -> JoinHandle<()> {
        let dispatcher = self;
        tokio::spawn(async move {
            while let Some(frame) = frames.recv().await {
                dispatcher.dispatch(frame);
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use consult_proto::{PresenceStatus, SenderRole};

    fn typing(sender: &str, consultation: i64) -> Frame {
        Frame::Typing {
            sender_id: sender.into(),
            consultation_id: consultation,
            is_typing: true,
        }
    }

    #[tokio::test]
    async fn routes_by_kind() {
        let dispatcher = FrameDispatcher::new();
        let mut typing_rx = dispatcher.subscribe(&[FrameKind::Typing]);
        let mut status_rx = dispatcher.subscribe(&[FrameKind::Status]);

        dispatcher.dispatch(typing("u-1", 42));
        dispatcher.dispatch(Frame::Status {
            user_id: "u-2".into(),
            status: PresenceStatus::Online,
        });

        assert!(matches!(
            typing_rx.try_recv().expect("typing routed"),
            Frame::Typing { .. }
        ));
        assert!(matches!(
            status_rx.try_recv().expect("status routed"),
            Frame::Status { .. }
        ));
        assert!(typing_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn unrouted_kind_is_dropped_quietly() {
        let dispatcher = FrameDispatcher::new();
        let mut typing_rx = dispatcher.subscribe(&[FrameKind::Typing]);

        dispatcher.dispatch(Frame::Join {
            sender_id: "u-1".into(),
            sender_type: SenderRole::User,
            consultation_id: 42,
        });
        assert!(typing_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn preserves_arrival_order() {
        let dispatcher = FrameDispatcher::new();
        let mut rx = dispatcher.subscribe(&[FrameKind::Typing]);

        for consultation in 1..=5 {
            dispatcher.dispatch(typing("u-1", consultation));
        }
        for expected in 1..=5 {
            match rx.try_recv().expect("frame") {
                Frame::Typing {
                    consultation_id, ..
                } => assert_eq!(consultation_id, expected),
                other => panic!("unexpected frame {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn survives_dropped_subscriber() {
        let dispatcher = FrameDispatcher::new();
        let rx = dispatcher.subscribe(&[FrameKind::Typing]);
        drop(rx);
        let mut live_rx = dispatcher.subscribe(&[FrameKind::Typing]);

        dispatcher.dispatch(typing("u-1", 42));
        assert!(live_rx.try_recv().is_ok());
    }
}
