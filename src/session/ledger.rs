use std::cell::{Cell, RefCell};
use std::num::NonZeroU16;

use ntex_util::HashMap;

use crate::codec::{Packet, Publish};

/// Acknowledgement the peer owes us for an in-flight packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Stage {
    /// Outbound publish awaiting PubAck (QoS 1) or PubRec (QoS 2).
    /// Carries the exact packet for verbatim resend.
    Publish(Publish),
    /// Inbound QoS 2 publish answered with PubRec, awaiting PubRel
    Receive,
    /// PubRel sent, awaiting PubComp
    Release,
}

impl Stage {
    fn resend_packet(&self, packet_id: NonZeroU16) -> Packet {
        match self {
            Stage::Publish(publish) => Packet::Publish(publish.clone()),
            Stage::Receive => Packet::PublishReceived { packet_id },
            Stage::Release => Packet::PublishRelease { packet_id },
        }
    }
}

#[derive(Debug)]
struct Entry {
    stage: Stage,
    count: u16,
    epoch: u64,
}

/// In-flight entries awaiting acknowledgement, keyed by packet id.
///
/// Each armed entry has one retry task sleeping on it. The task carries the
/// epoch its entry was installed with; replacing or removing the entry makes
/// the task exit on its next wake, so cancellation never touches the task
/// itself.
#[derive(Debug, Default)]
pub(crate) struct Ledger {
    entries: RefCell<HashMap<NonZeroU16, Entry>>,
    epoch: Cell<u64>,
}

impl Ledger {
    /// Create or replace the entry for `packet_id`.
    ///
    /// Arming with the stage already recorded is a no-op and keeps the
    /// running retry schedule. Returns the epoch of a freshly installed
    /// entry, `None` when the existing one was kept.
    pub(crate) fn arm(&self, packet_id: NonZeroU16, stage: Stage) -> Option<u64> {
        let mut entries = self.entries.borrow_mut();
        if let Some(entry) = entries.get(&packet_id) {
            if entry.stage == stage {
                return None;
            }
        }
        let epoch = self.epoch.get().wrapping_add(1);
        self.epoch.set(epoch);
        entries.insert(packet_id, Entry { stage, count: 0, epoch });
        Some(epoch)
    }

    /// Check the recorded stage for `packet_id`; false if no entry exists
    pub(crate) fn at_stage(
        &self,
        packet_id: NonZeroU16,
        f: impl FnOnce(&Stage) -> bool,
    ) -> bool {
        self.entries.borrow().get(&packet_id).map_or(false, |entry| f(&entry.stage))
    }

    /// Remove the entry for `packet_id`, a no-op if absent
    pub(crate) fn disarm(&self, packet_id: NonZeroU16) {
        self.entries.borrow_mut().remove(&packet_id);
    }

    /// Remove every entry, called on session teardown
    pub(crate) fn clear(&self) {
        self.entries.borrow_mut().clear();
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    /// Next packet to resend for the retry task armed at `epoch`.
    ///
    /// `None` once the entry is gone, superseded or its retry budget is
    /// spent. An exhausted entry stays in place as a stale marker and never
    /// resends again.
    pub(crate) fn next_resend(
        &self,
        packet_id: NonZeroU16,
        epoch: u64,
        limit: u16,
    ) -> Option<Packet> {
        let mut entries = self.entries.borrow_mut();
        let entry = entries.get_mut(&packet_id)?;
        if entry.epoch != epoch {
            return None;
        }
        if entry.count >= limit {
            log::debug!("Retry budget spent for packet id {}, giving up", packet_id);
            return None;
        }
        entry.count += 1;
        Some(entry.stage.resend_packet(packet_id))
    }
}

#[cfg(test)]
mod tests {
    use ntex_bytes::{ByteString, Bytes};

    use super::*;
    use crate::codec::QoS;

    fn packet_id(v: u16) -> NonZeroU16 {
        NonZeroU16::new(v).unwrap()
    }

    fn publish(id: u16, payload: &'static [u8]) -> Publish {
        Publish {
            dup: false,
            retain: false,
            qos: QoS::ExactlyOnce,
            topic: ByteString::from_static("dev/rpc"),
            packet_id: Some(packet_id(id)),
            payload: Bytes::from_static(payload),
        }
    }

    #[test]
    fn test_arm_is_idempotent() {
        let ledger = Ledger::default();
        let id = packet_id(1);

        let epoch = ledger.arm(id, Stage::Publish(publish(1, b"{}"))).unwrap();
        // burn part of the retry budget
        assert!(ledger.next_resend(id, epoch, 10).is_some());
        assert!(ledger.next_resend(id, epoch, 10).is_some());

        // same stage and payload, entry untouched
        assert_eq!(ledger.arm(id, Stage::Publish(publish(1, b"{}"))), None);
        assert!(ledger.next_resend(id, epoch, 3).is_some());
        assert_eq!(ledger.next_resend(id, epoch, 3), None);
    }

    #[test]
    fn test_arm_replacement_resets_counter() {
        let ledger = Ledger::default();
        let id = packet_id(1);

        let epoch = ledger.arm(id, Stage::Publish(publish(1, b"{}"))).unwrap();
        assert!(ledger.next_resend(id, epoch, 10).is_some());

        // stage change replaces the entry and invalidates the old epoch
        let next = ledger.arm(id, Stage::Release).unwrap();
        assert_ne!(epoch, next);
        assert_eq!(ledger.next_resend(id, epoch, 10), None);
        assert_eq!(
            ledger.next_resend(id, next, 10),
            Some(Packet::PublishRelease { packet_id: id })
        );
    }

    #[test]
    fn test_retry_ceiling() {
        let ledger = Ledger::default();
        let id = packet_id(7);
        let epoch = ledger.arm(id, Stage::Receive).unwrap();

        for _ in 0..10 {
            assert_eq!(
                ledger.next_resend(id, epoch, 10),
                Some(Packet::PublishReceived { packet_id: id })
            );
        }
        // budget spent, entry stays as a stale marker
        assert_eq!(ledger.next_resend(id, epoch, 10), None);
        assert_eq!(ledger.len(), 1);
        assert!(ledger.at_stage(id, |s| *s == Stage::Receive));
    }

    #[test]
    fn test_disarm_and_clear() {
        let ledger = Ledger::default();
        let one = packet_id(1);
        let two = packet_id(2);

        let epoch = ledger.arm(one, Stage::Receive).unwrap();
        ledger.arm(two, Stage::Release).unwrap();

        ledger.disarm(one);
        assert_eq!(ledger.next_resend(one, epoch, 10), None);
        assert!(!ledger.at_stage(one, |_| true));
        // absent id is a no-op
        ledger.disarm(one);

        ledger.clear();
        assert_eq!(ledger.len(), 0);
    }

    #[test]
    fn test_resend_packet_is_verbatim() {
        let ledger = Ledger::default();
        let id = packet_id(3);
        let pkt = publish(3, b"{\"id\":\"Shelly.GetStatus\"}");
        let epoch = ledger.arm(id, Stage::Publish(pkt.clone())).unwrap();
        assert_eq!(ledger.next_resend(id, epoch, 10), Some(Packet::Publish(pkt)));
    }
}
