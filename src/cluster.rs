//! Static cluster membership table.

use crate::utils::SubastaError;

use lazy_static::lazy_static;

/// Replica ID type.
pub type ReplicaId = u8;

/// One member of the static replica ensemble.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterMember {
    /// Totally ordered replica id; the election rule depends on it.
    pub id: ReplicaId,
    /// Hostname bidders and peers dial.
    pub host: String,
    /// Port accepting bidder connections.
    pub client_port: u16,
}

impl ClusterMember {
    /// Ring (peer) port paired with the client port.
    pub fn peer_port(&self) -> u16 {
        self.client_port + 1000
    }

    /// Dialable `(host, port)` of the bidder-facing listener.
    pub fn client_addr(&self) -> (String, u16) {
        (self.host.clone(), self.client_port)
    }

    /// Dialable `(host, port)` of the ring listener.
    pub fn peer_addr(&self) -> (String, u16) {
        (self.host.clone(), self.peer_port())
    }
}

lazy_static! {
    /// Built-in 3-replica membership: ids 1..=3 on localhost, bidder ports
    /// 9090..=9092, ring ports 1000 above.
    pub static ref DEFAULT_MEMBERS: Vec<ClusterMember> = (1..=3)
        .map(|id| ClusterMember {
            id,
            host: "localhost".into(),
            client_port: 9089 + id as u16,
        })
        .collect();
}

/// Looks up a member entry by replica id.
pub fn member_of(
    members: &[ClusterMember],
    id: ReplicaId,
) -> Result<&ClusterMember, SubastaError> {
    members
        .iter()
        .find(|m| m.id == id)
        .ok_or_else(|| {
            SubastaError::msg(format!("replica id {} not in membership", id))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_membership() {
        assert_eq!(DEFAULT_MEMBERS.len(), 3);
        let second = member_of(&DEFAULT_MEMBERS, 2).unwrap();
        assert_eq!(second.client_port, 9091);
        assert_eq!(second.peer_port(), 10091);
        assert_eq!(second.host, "localhost");
    }

    #[test]
    fn unknown_member_rejected() {
        assert!(member_of(&DEFAULT_MEMBERS, 9).is_err());
    }
}
