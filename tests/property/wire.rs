//! Property-based tests for the wire protocol.
//!
//! Uses proptest to verify:
//! 1. Random bytes never panic any decoder (they return `Err` gracefully).
//! 2. Any relay envelope survives encode → decode.
//! 3. Envelope validation rejects exactly the frames with empty routing
//!    fields.
//! 4. Length-prefixed framing finds the payload inside arbitrary trailing
//!    data.

use proptest::prelude::*;
use tasksync_proto::codec;
use tasksync_proto::relay::{self, EnvelopeError, Negotiation, RelayMessage};
use tasksync_proto::task::{self, Priority, Task, TaskId, TaskMutation};

// --- Strategies ---

fn arb_priority() -> impl Strategy<Value = Priority> {
    prop_oneof![
        Just(Priority::Low),
        Just(Priority::Medium),
        Just(Priority::High),
    ]
}

fn arb_task() -> impl Strategy<Value = Task> {
    (
        "[a-z0-9-]{0,36}",
        "[^\x00]{1,64}",
        proptest::option::of("[^\x00]{0,64}"),
        arb_priority(),
        any::<bool>(),
        any::<u64>(),
        any::<u64>(),
    )
        .prop_map(
            |(id, title, description, priority, completed, created_at, updated_at)| Task {
                id: TaskId::from_string(id),
                title,
                description,
                priority,
                completed,
                created_at,
                updated_at,
            },
        )
}

fn arb_mutation() -> impl Strategy<Value = TaskMutation> {
    prop_oneof![
        arb_task().prop_map(TaskMutation::Added),
        arb_task().prop_map(TaskMutation::Updated),
        arb_task().prop_map(TaskMutation::Toggled),
        "[a-z0-9-]{0,36}".prop_map(|id| TaskMutation::Deleted(TaskId::from_string(id))),
    ]
}

fn arb_negotiation() -> impl Strategy<Value = Negotiation> {
    (
        "[a-z0-9-]{0,36}",
        "[a-z0-9-]{0,36}",
        prop::collection::vec(any::<u8>(), 0..256),
    )
        .prop_map(|(from, to, payload)| Negotiation { from, to, payload })
}

/// Client-to-relay envelopes only.
fn arb_client_message() -> impl Strategy<Value = RelayMessage> {
    prop_oneof![
        "[a-z0-9]{0,8}".prop_map(|room_id| RelayMessage::JoinRoom { room_id }),
        "[a-z0-9]{0,8}".prop_map(|room_id| RelayMessage::LeaveRoom { room_id }),
        arb_negotiation().prop_map(RelayMessage::Offer),
        arb_negotiation().prop_map(RelayMessage::Answer),
        arb_negotiation().prop_map(RelayMessage::IceCandidate),
        ("[a-z0-9]{0,8}", arb_mutation()).prop_map(|(room_id, mutation)| {
            RelayMessage::Mutation {
                room_id,
                from: String::new(),
                mutation,
            }
        }),
    ]
}

/// The empty routing field a client envelope is missing, if any.
fn missing_field(msg: &RelayMessage) -> Option<&'static str> {
    match msg {
        RelayMessage::JoinRoom { room_id } | RelayMessage::LeaveRoom { room_id }
            if room_id.is_empty() =>
        {
            Some("room_id")
        }
        RelayMessage::Offer(n) | RelayMessage::Answer(n) | RelayMessage::IceCandidate(n)
            if n.to.is_empty() =>
        {
            Some("to")
        }
        RelayMessage::Mutation { room_id, .. } if room_id.is_empty() => Some("room_id"),
        RelayMessage::Mutation { mutation, .. } if mutation.task_id().as_str().is_empty() => {
            Some("task_id")
        }
        _ => None,
    }
}

// --- Property tests ---

proptest! {
    /// Random bytes never cause a panic in the relay decoder.
    #[test]
    fn random_bytes_relay_decode_no_panic(bytes in prop::collection::vec(any::<u8>(), 0..512)) {
        let _ = relay::decode(&bytes);
    }

    /// Random bytes never cause a panic in the peer frame decoder.
    #[test]
    fn random_bytes_peer_frame_decode_no_panic(bytes in prop::collection::vec(any::<u8>(), 0..512)) {
        let _ = task::decode_frame(&bytes);
    }

    /// Random bytes never cause a panic when unframed, and a reported frame
    /// never reaches past the input.
    #[test]
    fn random_bytes_unframe_no_panic(bytes in prop::collection::vec(any::<u8>(), 0..512)) {
        if let Ok((payload, used)) = codec::unframe(&bytes) {
            prop_assert!(used <= bytes.len());
            prop_assert_eq!(payload.len() + codec::FRAME_HEADER_LEN, used);
        }
    }

    /// Any client envelope survives an encode → decode round-trip.
    #[test]
    fn client_envelope_round_trip(msg in arb_client_message()) {
        let bytes = relay::encode(&msg).expect("encode should succeed");
        let decoded = relay::decode(&bytes).expect("decode should succeed");
        prop_assert_eq!(msg, decoded);
    }

    /// Validation fails exactly when a routing field is empty.
    #[test]
    fn validation_matches_routing_fields(msg in arb_client_message()) {
        match missing_field(&msg) {
            Some(field) => prop_assert_eq!(msg.validate(), Err(EnvelopeError::MissingField(field))),
            None => prop_assert_eq!(msg.validate(), Ok(())),
        }
    }

    /// A frame is found intact even with more bytes queued behind it.
    #[test]
    fn frame_survives_trailing_bytes(
        payload in prop::collection::vec(any::<u8>(), 0..512),
        trailing in prop::collection::vec(any::<u8>(), 0..64),
    ) {
        let mut buf = codec::frame(&payload).expect("frame should succeed");
        let framed_len = buf.len();
        buf.extend_from_slice(&trailing);
        let (found, used) = codec::unframe(&buf).expect("unframe should succeed");
        prop_assert_eq!(found, payload.as_slice());
        prop_assert_eq!(used, framed_len);
    }
}
