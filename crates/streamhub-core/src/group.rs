//! Broadcast groups.
//!
//! A group is a named set of connections that receive the same push frames.
//! The frame is encoded once per delivery and the same buffer is handed to
//! every target; each member's delivery is independent, so one slow or dead
//! member never holds back (or fails) delivery to the others.
//!
//! Membership is copy-on-write: writers swap in a new member slice under a
//! short lock, deliveries iterate whatever snapshot they grabbed. Groups do
//! not own connection lifetime; a disconnecting connection must be removed
//! by its owner ([`GroupRegistry::leave_all`]).

use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Serialize;
use streamhub_proto::{ConnectionId, Frame, MethodId, ProtocolError, Serializer};

use crate::error::DeliveryError;

/// A connection as seen by a group.
pub trait GroupMember: Send + Sync + 'static {
    /// Identity of the member
    fn connection_id(&self) -> ConnectionId;

    /// Queue an encoded frame without blocking
    fn deliver(&self, message: Bytes) -> Result<(), DeliveryError>;
}

type Member = Arc<dyn GroupMember>;

/// Who receives a group delivery
#[derive(Debug, Clone, Copy)]
pub enum Target<'a> {
    /// Every member
    All,
    /// Every member except one (usually the sender)
    Except(ConnectionId),
    /// Every member except these
    ExceptMany(&'a [ConnectionId]),
    /// Only these members (ids that are not members are ignored)
    Only(&'a [ConnectionId]),
}

impl Target<'_> {
    fn includes(&self, id: ConnectionId) -> bool {
        match self {
            Self::All => true,
            Self::Except(excluded) => *excluded != id,
            Self::ExceptMany(excluded) => !excluded.contains(&id),
            Self::Only(included) => included.contains(&id),
        }
    }
}

/// Outcome of one group delivery
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    /// Members the frame was queued for
    pub delivered: usize,
    /// Members that could not take the frame
    pub failed: Vec<(ConnectionId, DeliveryError)>,
}

/// Named set of connections receiving the same broadcasts.
pub struct BroadcastGroup {
    name: String,
    members: RwLock<Arc<[Member]>>,
}

impl std::fmt::Debug for BroadcastGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BroadcastGroup")
            .field("name", &self.name)
            .field("members", &self.len())
            .finish()
    }
}

impl BroadcastGroup {
    /// Empty group
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), members: RwLock::new(Arc::from(Vec::new())) }
    }

    /// Group name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Add a member, replacing any member with the same id.
    ///
    /// Returns `true` if the id was not a member before.
    pub fn add(&self, member: Member) -> bool {
        let id = member.connection_id();
        let mut members = self.members.write();
        let mut next: Vec<Member> =
            members.iter().filter(|m| m.connection_id() != id).cloned().collect();
        let added = next.len() == members.len();
        next.push(member);
        *members = Arc::from(next);
        added
    }

    /// Remove a member; returns `true` if it was present
    pub fn remove(&self, id: ConnectionId) -> bool {
        let mut members = self.members.write();
        if !members.iter().any(|m| m.connection_id() == id) {
            return false;
        }
        let next: Vec<Member> = members.iter().filter(|m| m.connection_id() != id).cloned().collect();
        *members = Arc::from(next);
        true
    }

    /// Whether `id` is a member
    pub fn contains(&self, id: ConnectionId) -> bool {
        self.snapshot().iter().any(|m| m.connection_id() == id)
    }

    /// Number of members
    pub fn len(&self) -> usize {
        self.members.read().len()
    }

    /// Whether the group has no members
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Member ids in join order
    pub fn member_ids(&self) -> Vec<ConnectionId> {
        self.snapshot().iter().map(|m| m.connection_id()).collect()
    }

    fn snapshot(&self) -> Arc<[Member]> {
        Arc::clone(&self.members.read())
    }

    /// Hand an already encoded frame to every targeted member.
    pub fn deliver_bytes(&self, message: &Bytes, target: Target<'_>) -> DeliveryReport {
        let mut report = DeliveryReport::default();
        for member in self.snapshot().iter() {
            let id = member.connection_id();
            if !target.includes(id) {
                continue;
            }
            match member.deliver(message.clone()) {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    tracing::warn!(group = %self.name, connection_id = %id, error = %e, "broadcast delivery failed");
                    report.failed.push((id, e));
                },
            }
        }
        report
    }

    /// Encode `frame` once and deliver it to every targeted member.
    pub fn deliver(&self, frame: &Frame, target: Target<'_>) -> Result<DeliveryReport, ProtocolError> {
        let message = frame.to_bytes()?;
        Ok(self.deliver_bytes(&message, target))
    }

    /// Deliver to every member
    pub fn deliver_to_all(&self, frame: &Frame) -> Result<DeliveryReport, ProtocolError> {
        self.deliver(frame, Target::All)
    }

    /// Deliver to every member except `id`
    pub fn deliver_except(&self, id: ConnectionId, frame: &Frame) -> Result<DeliveryReport, ProtocolError> {
        self.deliver(frame, Target::Except(id))
    }

    /// Deliver to every member except `ids`
    pub fn deliver_except_many(
        &self,
        ids: &[ConnectionId],
        frame: &Frame,
    ) -> Result<DeliveryReport, ProtocolError> {
        self.deliver(frame, Target::ExceptMany(ids))
    }

    /// Deliver only to `ids`
    pub fn deliver_to(&self, ids: &[ConnectionId], frame: &Frame) -> Result<DeliveryReport, ProtocolError> {
        self.deliver(frame, Target::Only(ids))
    }

    /// Serialize `value` once and push it to `method_id` on every targeted member.
    pub fn broadcast<S, T>(
        &self,
        serializer: &S,
        method_id: MethodId,
        value: &T,
        target: Target<'_>,
    ) -> Result<DeliveryReport, ProtocolError>
    where
        S: Serializer,
        T: Serialize + ?Sized,
    {
        let args = Bytes::from(serializer.to_vec(value)?);
        self.deliver(&Frame::Broadcast { method_id, args }, target)
    }
}

/// Name → group map shared by a hub.
///
/// Groups are created on first join and dropped when their last member leaves.
#[derive(Debug, Default)]
pub struct GroupRegistry {
    groups: DashMap<String, Arc<BroadcastGroup>>,
}

impl GroupRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Existing group by name
    pub fn get(&self, name: &str) -> Option<Arc<BroadcastGroup>> {
        self.groups.get(name).map(|group| Arc::clone(group.value()))
    }

    /// Add `member` to `name`, creating the group if needed.
    pub fn join(&self, name: &str, member: Member) -> Arc<BroadcastGroup> {
        // Membership changes under the map entry so a concurrent leave cannot
        // drop the group between creation and the add.
        let entry = self
            .groups
            .entry(name.to_owned())
            .or_insert_with(|| Arc::new(BroadcastGroup::new(name)));
        entry.add(member);
        Arc::clone(entry.value())
    }

    /// Remove `id` from `name`; drops the group if it became empty.
    pub fn leave(&self, name: &str, id: ConnectionId) -> bool {
        let Some(group) = self.get(name) else { return false };
        let removed = group.remove(id);
        self.groups.remove_if(name, |_, group| group.is_empty());
        removed
    }

    /// Remove `id` from every group; returns the number of groups left.
    pub fn leave_all(&self, id: ConnectionId) -> usize {
        let names: Vec<String> = self
            .groups
            .iter()
            .filter(|entry| entry.value().contains(id))
            .map(|entry| entry.key().clone())
            .collect();
        names.iter().filter(|name| self.leave(name, id)).count()
    }

    /// Names of the groups `id` belongs to
    pub fn groups_of(&self, id: ConnectionId) -> Vec<String> {
        self.groups
            .iter()
            .filter(|entry| entry.value().contains(id))
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Number of live groups
    pub fn len(&self) -> usize {
        self.groups.len()
    }

    /// Whether there are no groups
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;
    use streamhub_proto::CborSerializer;

    use super::*;

    struct Recorder {
        id: ConnectionId,
        received: Mutex<Vec<Bytes>>,
        broken: bool,
    }

    impl Recorder {
        fn new(n: u8) -> Arc<Self> {
            Self::with_state(n, false)
        }

        fn broken(n: u8) -> Arc<Self> {
            Self::with_state(n, true)
        }

        fn with_state(n: u8, broken: bool) -> Arc<Self> {
            Arc::new(Self { id: id(n), received: Mutex::new(Vec::new()), broken })
        }

        fn count(&self) -> usize {
            self.received.lock().len()
        }
    }

    impl GroupMember for Recorder {
        fn connection_id(&self) -> ConnectionId {
            self.id
        }

        fn deliver(&self, message: Bytes) -> Result<(), DeliveryError> {
            if self.broken {
                return Err(DeliveryError::Closed(self.id));
            }
            self.received.lock().push(message);
            Ok(())
        }
    }

    fn id(n: u8) -> ConnectionId {
        ConnectionId::from_random_bytes([n; 16])
    }

    fn frame() -> Frame {
        Frame::Broadcast { method_id: MethodId::from_name("OnMessage"), args: Bytes::from_static(&[0x01]) }
    }

    #[test]
    fn one_broken_member_does_not_affect_the_rest() {
        let group = BroadcastGroup::new("room");
        let healthy: Vec<_> = (1..=4).map(Recorder::new).collect();
        for member in &healthy {
            group.add(member.clone());
        }
        group.add(Recorder::broken(9));

        let report = group.deliver_to_all(&frame()).unwrap();
        assert_eq!(report.delivered, 4);
        assert_eq!(report.failed, vec![(id(9), DeliveryError::Closed(id(9)))]);
        assert!(healthy.iter().all(|m| m.count() == 1));
    }

    #[test]
    fn payload_is_shared_not_copied() {
        let group = BroadcastGroup::new("room");
        let a = Recorder::new(1);
        let b = Recorder::new(2);
        group.add(a.clone());
        group.add(b.clone());
        group.deliver_to_all(&frame()).unwrap();

        let first = a.received.lock()[0].clone();
        let second = b.received.lock()[0].clone();
        assert_eq!(first.as_ptr(), second.as_ptr());
    }

    #[test]
    fn targets_select_members() {
        let group = BroadcastGroup::new("room");
        let members: Vec<_> = (1..=4).map(Recorder::new).collect();
        for member in &members {
            group.add(member.clone());
        }

        assert_eq!(group.deliver_except(id(1), &frame()).unwrap().delivered, 3);
        assert_eq!(group.deliver_except_many(&[id(1), id(2)], &frame()).unwrap().delivered, 2);
        assert_eq!(group.deliver_to(&[id(4), id(77)], &frame()).unwrap().delivered, 1);

        let counts: Vec<_> = members.iter().map(|m| m.count()).collect();
        assert_eq!(counts, vec![0, 1, 2, 3]);
    }

    #[test]
    fn add_replaces_same_id_and_remove_reports_presence() {
        let group = BroadcastGroup::new("room");
        assert!(group.add(Recorder::new(1)));
        assert!(!group.add(Recorder::new(1)));
        assert_eq!(group.len(), 1);
        assert!(group.remove(id(1)));
        assert!(!group.remove(id(1)));
        assert!(group.is_empty());
    }

    #[test]
    fn typed_broadcast_serializes_once() {
        let group = BroadcastGroup::new("room");
        let member = Recorder::new(1);
        group.add(member.clone());

        let report = group
            .broadcast(&CborSerializer, MethodId::from_name("OnChat"), "hello", Target::All)
            .unwrap();
        assert_eq!(report.delivered, 1);

        let received = member.received.lock()[0].clone();
        let decoded = Frame::decode(&received, streamhub_proto::Direction::ToClient).unwrap();
        let Frame::Broadcast { args, .. } = decoded else { panic!("expected broadcast") };
        let text: String = CborSerializer.deserialize(&args).unwrap();
        assert_eq!(text, "hello");
    }

    #[test]
    fn registry_drops_empty_groups() {
        let registry = GroupRegistry::new();
        registry.join("a", Recorder::new(1));
        registry.join("a", Recorder::new(2));
        registry.join("b", Recorder::new(1));
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.groups_of(id(1)).len(), 2);

        assert_eq!(registry.leave_all(id(1)), 2);
        assert!(registry.get("b").is_none());
        assert_eq!(registry.get("a").unwrap().member_ids(), vec![id(2)]);

        assert!(registry.leave("a", id(2)));
        assert!(registry.is_empty());
        assert!(!registry.leave("a", id(2)));
    }
}
