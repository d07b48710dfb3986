use tokio::sync::RwLock;
use tracing::info;

use urd_types::{NodeId, Term, UrdError};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LeaderState {
    pub term: Term,
    pub leader: Option<NodeId>,
    /// Replication address of `leader`, used as the redirect hint.
    pub leader_addr: Option<String>,
}

/// Who leads the metadata log, as far as this node knows.
///
/// How a leader gets chosen is not decided here: the node is told its role
/// through [`Leadership::become_leader`] and [`Leadership::follow`], or
/// learns it from an incoming append. Terms never decrease.
pub struct Leadership {
    node_id: NodeId,
    addr: String,
    state: RwLock<LeaderState>,
}

impl Leadership {
    pub fn new(node_id: NodeId, addr: impl Into<String>) -> Self {
        Leadership { node_id, addr: addr.into(), state: RwLock::new(LeaderState::default()) }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// This node's replication address.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub async fn state(&self) -> LeaderState {
        self.state.read().await.clone()
    }

    pub async fn term(&self) -> Term {
        self.state.read().await.term
    }

    pub async fn is_leader(&self) -> bool {
        self.state.read().await.leader == Some(self.node_id)
    }

    /// Takes leadership for `term`, which must be newer than the current one.
    pub async fn become_leader(&self, term: Term) -> Result<(), UrdError> {
        let mut g = self.state.write().await;
        if term <= g.term {
            return Err(UrdError::InvalidArgument(format!(
                "term {term} is not newer than current term {}",
                g.term
            )));
        }
        *g = LeaderState { term, leader: Some(self.node_id), leader_addr: Some(self.addr.clone()) };
        info!(node = self.node_id, term, "became leader");
        Ok(())
    }

    /// Records `leader` as the leader of `term`. Older terms are ignored and
    /// `false` is returned.
    pub async fn follow(&self, term: Term, leader: Option<NodeId>, addr: Option<String>) -> bool {
        let mut g = self.state.write().await;
        if term < g.term {
            return false;
        }
        if term == g.term && g.leader == leader {
            return true;
        }
        if g.leader == Some(self.node_id) && leader != Some(self.node_id) {
            info!(node = self.node_id, term, ?leader, "stepping down");
        }
        *g = LeaderState { term, leader, leader_addr: addr };
        true
    }

    /// Moves a leader to the next term without giving up leadership. Used
    /// after an abandoned append so replicas can tell its entry apart from
    /// the next one written at the same index.
    pub async fn advance_term(&self) -> Term {
        let mut g = self.state.write().await;
        g.term += 1;
        g.term
    }

    /// The current term if this node leads, otherwise a `NotLeader` error
    /// carrying the known leader's address.
    pub async fn check_leader(&self) -> Result<Term, UrdError> {
        let g = self.state.read().await;
        if g.leader == Some(self.node_id) {
            Ok(g.term)
        } else {
            Err(UrdError::NotLeader { leader: g.leader_addr.clone() })
        }
    }

    pub async fn leader_hint(&self) -> Option<String> {
        self.state.read().await.leader_addr.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn terms_never_go_back() {
        let l = Leadership::new(1, "n1:8099");
        l.become_leader(3).await.unwrap();
        assert!(l.become_leader(3).await.is_err());
        assert!(!l.follow(2, Some(2), Some("n2:8099".into())).await);
        assert!(l.is_leader().await);
        assert_eq!(l.check_leader().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn follower_reports_leader_hint() {
        let l = Leadership::new(1, "n1:8099");
        assert_eq!(l.check_leader().await.unwrap_err(), UrdError::NotLeader { leader: None });

        l.follow(1, Some(2), Some("n2:8099".into())).await;
        assert_eq!(
            l.check_leader().await.unwrap_err(),
            UrdError::NotLeader { leader: Some("n2:8099".into()) }
        );
    }

    #[tokio::test]
    async fn newer_term_demotes_leader() {
        let l = Leadership::new(1, "n1:8099");
        l.become_leader(1).await.unwrap();
        assert!(l.follow(2, Some(3), None).await);
        assert!(!l.is_leader().await);
        assert_eq!(l.term().await, 2);
    }

    #[tokio::test]
    async fn advance_term_keeps_leadership() {
        let l = Leadership::new(1, "n1:8099");
        l.become_leader(1).await.unwrap();
        assert_eq!(l.advance_term().await, 2);
        assert!(l.is_leader().await);
    }
}
