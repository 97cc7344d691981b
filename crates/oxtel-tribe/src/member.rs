use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberStatus {
    Alive,
    Suspect,
    Failed,
    Left,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Member {
    pub name: String,
    pub addr: SocketAddr,
    /// The member's control-plane address, used by peers to fetch plugin
    /// artifacts.
    pub rest_addr: Option<String>,
    pub status: MemberStatus,
    pub status_since: DateTime<Utc>,
}

impl Member {
    pub fn alive(name: &str, addr: SocketAddr, rest_addr: Option<String>) -> Self {
        Self {
            name: name.to_string(),
            addr,
            rest_addr,
            status: MemberStatus::Alive,
            status_since: Utc::now(),
        }
    }
}

/// The local membership view. Merging is biased toward life: a peer that
/// reports a member alive more recently than our local status change wins.
#[derive(Default)]
pub struct MemberTable {
    members: HashMap<String, Member>,
}

impl MemberTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&mut self, member: Member) {
        self.members.insert(member.name.clone(), member);
    }

    pub fn get(&self, name: &str) -> Option<&Member> {
        self.members.get(name)
    }

    pub fn remove(&mut self, name: &str) -> Option<Member> {
        self.members.remove(name)
    }

    pub fn list(&self) -> Vec<Member> {
        let mut out: Vec<Member> = self.members.values().cloned().collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    pub fn alive_peers(&self, exclude: &str) -> Vec<Member> {
        self.members
            .values()
            .filter(|m| m.status == MemberStatus::Alive && m.name != exclude)
            .cloned()
            .collect()
    }

    pub fn set_status(&mut self, name: &str, status: MemberStatus) -> bool {
        match self.members.get_mut(name) {
            Some(member) if member.status != status => {
                member.status = status;
                member.status_since = Utc::now();
                true
            }
            _ => false,
        }
    }

    /// Merge a gossiped member list. Unknown members are adopted; known
    /// ones take the more recent status change.
    pub fn merge(&mut self, peers: Vec<Member>) {
        use std::collections::hash_map::Entry;
        for peer in peers {
            match self.members.entry(peer.name.clone()) {
                Entry::Vacant(slot) => {
                    slot.insert(peer);
                }
                Entry::Occupied(mut slot) => {
                    if peer.status_since > slot.get().status_since {
                        *slot.get_mut() = peer;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    #[test]
    fn merge_adopts_unknown_and_prefers_recent_status() {
        let mut table = MemberTable::new();
        table.upsert(Member::alive("n1", addr(7001), None));

        let mut stale = Member::alive("n1", addr(7001), None);
        stale.status = MemberStatus::Failed;
        stale.status_since = Utc::now() - chrono::Duration::seconds(60);
        let fresh = Member::alive("n2", addr(7002), None);

        table.merge(vec![stale, fresh]);
        assert_eq!(table.get("n1").unwrap().status, MemberStatus::Alive);
        assert_eq!(table.get("n2").unwrap().status, MemberStatus::Alive);
        assert_eq!(table.list().len(), 2);
    }

    #[test]
    fn alive_peers_excludes_self_and_non_alive() {
        let mut table = MemberTable::new();
        table.upsert(Member::alive("me", addr(1), None));
        table.upsert(Member::alive("peer", addr(2), None));
        table.upsert(Member::alive("down", addr(3), None));
        table.set_status("down", MemberStatus::Failed);

        let peers = table.alive_peers("me");
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].name, "peer");
    }
}
