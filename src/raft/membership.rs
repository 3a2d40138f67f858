use super::NodeID;
use crate::encoding;
use crate::errinput;
use crate::error::Result;

use itertools::Itertools as _;
use serde::{Deserialize, Serialize};

/// The role of a cluster member.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MemberRole {
    /// A full member, which votes in elections and counts towards quorum.
    Voter,
    /// A non-voting member, which only replicates the log.
    Learner,
}

/// A cluster member.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Member {
    pub id: NodeID,
    pub role: MemberRole,
}

impl Member {
    pub fn voter(id: NodeID) -> Self {
        Self { id, role: MemberRole::Voter }
    }

    pub fn learner(id: NodeID) -> Self {
        Self { id, role: MemberRole::Learner }
    }
}

/// A cluster configuration: the set of members and their roles, along with a
/// version that increases with every change.
///
/// Configurations are stored in the Raft log as regular entries, and take
/// effect once committed. Until then, quorums are computed from the previous
/// (active) configuration. Only a single member may change at a time, which
/// ensures the old and new voter quorums always overlap.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Configuration {
    /// The configuration version. 0 is the empty, unbootstrapped configuration.
    pub version: u64,
    /// The cluster members, ordered by ID.
    pub members: Vec<Member>,
}

impl encoding::Value for Configuration {}

impl Configuration {
    /// Creates a new configuration. Members are sorted by ID.
    pub fn new(version: u64, mut members: Vec<Member>) -> Self {
        members.sort_by_key(|m| m.id);
        Self { version, members }
    }

    /// Returns true if the configuration has no members.
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Returns the role of the given node, if it is a member.
    pub fn role(&self, id: NodeID) -> Option<MemberRole> {
        self.members.iter().find(|m| m.id == id).map(|m| m.role)
    }

    /// Returns true if the given node is a member.
    pub fn contains(&self, id: NodeID) -> bool {
        self.role(id).is_some()
    }

    /// Returns true if the given node is a voter.
    pub fn is_voter(&self, id: NodeID) -> bool {
        self.role(id) == Some(MemberRole::Voter)
    }

    /// Returns the voter IDs, in order.
    pub fn voters(&self) -> Vec<NodeID> {
        self.members.iter().filter(|m| m.role == MemberRole::Voter).map(|m| m.id).collect()
    }

    /// Returns all member IDs except the given one, in order.
    pub fn peers(&self, id: NodeID) -> Vec<NodeID> {
        self.members.iter().map(|m| m.id).filter(|m| *m != id).collect()
    }

    /// Returns the number of votes needed for a quorum.
    pub fn quorum_size(&self) -> usize {
        quorum_size(self.voters().len())
    }

    /// Returns true if the given members are the same as this configuration's,
    /// regardless of order.
    pub fn has_members(&self, members: &[Member]) -> bool {
        let mut members = members.to_vec();
        members.sort_by_key(|m| m.id);
        members == self.members
    }

    /// Validates that the given members are a single-change successor of this
    /// configuration: exactly one member was added, removed, promoted or
    /// demoted. There must be at least one voter, and no duplicate members.
    pub fn validate_change(&self, members: &[Member]) -> Result<()> {
        if let Some(id) = members.iter().map(|m| m.id).duplicates().next() {
            return errinput!("duplicate member {id}");
        }
        if !members.iter().any(|m| m.role == MemberRole::Voter) {
            return errinput!("configuration must have at least one voter");
        }
        let removed = self.members.iter().filter(|m| !members.iter().any(|n| n.id == m.id));
        let changed = members.iter().filter(|m| self.role(m.id) != Some(m.role));
        match removed.count() + changed.count() {
            0 => errinput!("configuration is unchanged"),
            1 => Ok(()),
            n => errinput!("can only change one member at a time, got {n} changes"),
        }
    }
}

/// Returns the size of a quorum (strict majority), given a total size.
pub fn quorum_size(size: usize) -> usize {
    size / 2 + 1
}

/// Returns the quorum (median) value of the given unsorted slice, in descending
/// order. The slice cannot be empty.
pub fn quorum_value<T: Ord + Copy>(mut values: Vec<T>) -> T {
    assert!(!values.is_empty(), "no values provided");
    let index = quorum_size(values.len()) - 1;
    *values.select_nth_unstable_by(index, |a, b: &T| a.cmp(b).reverse()).1
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use pretty_assertions::assert_eq;

    #[test]
    fn quorum_size() {
        for (size, quorum) in [(1, 1), (2, 2), (3, 2), (4, 3), (5, 3), (6, 4), (7, 4), (8, 5)] {
            assert_eq!(super::quorum_size(size), quorum);
        }
    }

    #[test]
    fn quorum_value() {
        assert_eq!(super::quorum_value(vec![1]), 1);
        assert_eq!(super::quorum_value(vec![1, 3, 2]), 2);
        assert_eq!(super::quorum_value(vec![4, 1, 3, 2]), 2);
        assert_eq!(super::quorum_value(vec![1, 1, 1, 2, 2]), 1);
        assert_eq!(super::quorum_value(vec![1, 1, 2, 2, 2]), 2);
    }

    #[test]
    fn learners_do_not_count() {
        let config = Configuration::new(
            1,
            vec![Member::voter(3), Member::learner(2), Member::voter(1), Member::learner(4)],
        );
        assert_eq!(config.voters(), vec![1, 3]);
        assert_eq!(config.quorum_size(), 2);
        assert_eq!(config.peers(1), vec![2, 3, 4]);
        assert!(config.is_voter(3));
        assert!(!config.is_voter(2));
        assert!(config.contains(2));
        assert!(!config.contains(5));
    }

    fn three() -> Configuration {
        Configuration::new(1, vec![Member::voter(1), Member::voter(2), Member::voter(3)])
    }

    #[test]
    fn validate_change() {
        use Member as M;
        let valid = [
            vec![M::voter(1), M::voter(2)],
            vec![M::voter(1), M::voter(2), M::voter(3), M::voter(4)],
            vec![M::voter(1), M::voter(2), M::voter(3), M::learner(4)],
            vec![M::voter(1), M::voter(2), M::learner(3)],
        ];
        for members in valid {
            assert_eq!(three().validate_change(&members), Ok(()), "{members:?}");
        }

        // Removing two, replacing one, no change, duplicates, and no voters.
        let invalid = [
            vec![M::voter(1)],
            vec![M::voter(1), M::voter(2), M::voter(4)],
            vec![M::voter(3), M::voter(2), M::voter(1)],
            vec![M::voter(1), M::voter(1), M::voter(2)],
            vec![M::learner(1)],
        ];
        for members in invalid {
            let result = three().validate_change(&members);
            assert!(matches!(result, Err(Error::InvalidInput(_))), "{members:?}");
        }
    }

    #[test]
    fn has_members_ignores_order() {
        let config = three();
        assert!(config.has_members(&[Member::voter(2), Member::voter(3), Member::voter(1)]));
        assert!(!config.has_members(&[Member::voter(2), Member::voter(1)]));
    }
}
