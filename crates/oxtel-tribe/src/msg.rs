use crate::agreement::{Agreement, Delta};
use crate::member::Member;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Datagrams exchanged between tribe nodes. JSON-encoded; one message
/// per datagram.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "msg", rename_all = "kebab-case")]
pub enum TribeMessage {
    /// A new node contacting a seed.
    Join { member: Member },
    /// Seed's reply: the membership list and the full agreement state.
    JoinAck {
        members: Vec<Member>,
        agreements: BTreeMap<String, Agreement>,
    },
    /// Periodic membership dissemination.
    Heartbeat { from: String, members: Vec<Member> },
    /// Failure-detector probe and its reply.
    Ping { from: String, seq: u64 },
    Ack { seq: u64 },
    /// A replicated agreement change.
    Event { delta: Delta },
    /// Agreement-level create/remove, which are not per-key registers.
    AgreementAdded { name: String },
    AgreementRemoved { name: String },
    /// Anti-entropy pull.
    DigestRequest { from: String },
    DigestResponse {
        agreements: BTreeMap<String, Agreement>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::member::{Member, MemberStatus};

    #[test]
    fn messages_round_trip_as_json() {
        let member = Member::alive("n1", "127.0.0.1:7001".parse().unwrap(), None);
        let msg = TribeMessage::Join { member };
        let bytes = serde_json::to_vec(&msg).unwrap();
        let back: TribeMessage = serde_json::from_slice(&bytes).unwrap();
        match back {
            TribeMessage::Join { member } => {
                assert_eq!(member.name, "n1");
                assert_eq!(member.status, MemberStatus::Alive);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }
}
