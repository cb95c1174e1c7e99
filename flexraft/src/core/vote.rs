//! Vote request handling and candidate-side vote tallying.

use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio::time::Duration;
use tokio::time::Instant;
use tracing_futures::Instrument;

use crate::core::CandidateState;
use crate::core::RaftCore;
use crate::core::State;
use crate::core::UpdateCurrentLeader;
use crate::error::RaftResult;
use crate::membership::Group;
use crate::raft::TimeoutNowRequest;
use crate::raft::VoteRequest;
use crate::raft::VoteResponse;
use crate::AppData;
use crate::AppDataResponse;
use crate::MessageSummary;
use crate::NodeId;
use crate::RaftNetwork;
use crate::RaftStorage;
use crate::Update;

impl<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> RaftCore<D, R, N, S> {
    /// Whether a candidate's log is at least as up-to-date as ours (§5.4).
    fn is_candidate_log_up_to_date(&self, last_log_term: u64, last_log_index: u64) -> bool {
        (last_log_term, last_log_index) >= (self.log.last_term(), self.log.last_index())
    }

    /// Whether this node currently has a live leader.
    ///
    /// A voter which heard a valid heartbeat within the election timeout ignores vote
    /// requests, so that removed or partitioned servers cannot disrupt a stable leader
    /// (§4.2.3). Transferees override this protection with the `disrupt_leader` flag.
    fn has_live_leader(&self) -> bool {
        match self.target_state {
            State::Leader => true,
            State::Follower => {
                self.current_leader.is_some()
                    && match self.last_heartbeat {
                        Some(t) => {
                            Instant::now().saturating_duration_since(t)
                                <= Duration::from_millis(self.config.election_timeout_min)
                        }
                        None => false,
                    }
            }
            _ => false,
        }
    }

    /// An invoked Raft RPC to request a vote, or a pre-vote probe.
    #[tracing::instrument(level = "debug", skip(self, req), fields(req=%req.summary()))]
    pub(super) async fn handle_vote_request(&mut self, req: VoteRequest) -> RaftResult<VoteResponse> {
        if self.has_live_leader() && !req.disrupt_leader {
            tracing::debug!(id = self.id, candidate = req.candidate_id, "has a live leader, rejecting vote request");
            return Ok(VoteResponse {
                term: self.current_term,
                vote_granted: false,
                pre_vote: req.pre_vote,
            });
        }

        if req.pre_vote {
            // Pre-vote: grant without persisting or bumping anything. The probing term
            // is the candidate's term + 1.
            let granted = req.term >= self.current_term
                && self.is_candidate_log_up_to_date(req.last_log_term, req.last_log_index);
            return Ok(VoteResponse {
                term: self.current_term,
                vote_granted: granted,
                pre_vote: true,
            });
        }

        // Reply false if the term is out of date (§5.1).
        if req.term < self.current_term {
            tracing::debug!(id = self.id, candidate = req.candidate_id, "local term is higher, rejecting vote request");
            return Ok(VoteResponse {
                term: self.current_term,
                vote_granted: false,
                pre_vote: false,
            });
        }

        let original = (self.current_term, self.voted_for);

        if req.term > self.current_term {
            self.update_current_term(req.term, None);
            self.update_next_election_timeout(false);
            if !self.target_state.is_follower() {
                self.set_target_state(State::Follower);
                self.update_current_leader(UpdateCurrentLeader::Unknown);
            }
        }

        let up_to_date = self.is_candidate_log_up_to_date(req.last_log_term, req.last_log_index);
        let granted = up_to_date
            && match self.voted_for {
                None => true,
                Some(candidate) => candidate == req.candidate_id,
            };

        if granted {
            self.voted_for = Some(req.candidate_id);
            self.update_next_election_timeout(false);
        }

        // The (term, vote) pair must be durable before the response leaves this node.
        if (self.current_term, self.voted_for) != original {
            self.save_hard_state().await?;
            self.report_metrics(Update::Ignore);
        }

        tracing::debug!(id = self.id, candidate = req.candidate_id, granted, "voted");
        Ok(VoteResponse {
            term: self.current_term,
            vote_granted: granted,
            pre_vote: false,
        })
    }

    /// An invoked Raft RPC from the leader asking this node to start an election
    /// immediately, as part of a leadership transfer.
    #[tracing::instrument(level = "debug", skip(self, req), fields(req=%req.summary()))]
    pub(super) async fn handle_timeout_now_request(&mut self, req: TimeoutNowRequest) -> RaftResult<()> {
        if req.term < self.current_term {
            return Ok(());
        }
        if !self.is_voter(self.id) {
            tracing::warn!(id = self.id, "received TimeoutNow but is not a voter, ignoring");
            return Ok(());
        }
        if req.term > self.current_term {
            self.update_current_term(req.term, Some(req.leader_id));
            self.save_hard_state().await?;
        }

        tracing::info!(id = self.id, from = req.leader_id, "received TimeoutNow, starting election");
        // Skip pre-vote and carry the disruption override: the leader told us to.
        self.disrupt_next_election = true;
        self.set_target_state(State::Candidate);
        Ok(())
    }
}

impl<'a, D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> CandidateState<'a, D, R, N, S> {
    /// Build a new vote request for the given election term and spawn parallel requests
    /// to all voters of the current configuration (both groups during joint consensus).
    #[tracing::instrument(level = "trace", skip(self))]
    pub(super) fn spawn_parallel_vote_requests(
        &self,
        term: u64,
        pre_vote: bool,
    ) -> mpsc::Receiver<(VoteResponse, NodeId)> {
        let targets: Vec<NodeId> = self
            .core
            .configuration
            .servers
            .iter()
            .filter(|s| s.id != self.core.id && self.core.configuration.is_voter(s, Group::ANY))
            .map(|s| s.id)
            .collect();

        let (tx, rx) = mpsc::channel(targets.len().max(1));
        let rpc = VoteRequest {
            term,
            candidate_id: self.core.id,
            last_log_index: self.core.log.last_index(),
            last_log_term: self.core.log.last_term(),
            pre_vote,
            disrupt_leader: self.disrupt_leader,
        };
        let ttl = Duration::from_millis(self.core.config.election_timeout_max);

        for target in targets {
            let rpc = rpc.clone();
            let tx = tx.clone();
            let network = self.core.network.clone();
            let _ = tokio::spawn(
                async move {
                    match timeout(ttl, network.send_vote(target, rpc)).await {
                        Ok(Ok(res)) => {
                            let _ = tx.send((res, target)).await;
                        }
                        Ok(Err(err)) => tracing::warn!({error=%err, target}, "error while requesting vote from peer"),
                        Err(_) => tracing::warn!({target}, "timeout while requesting vote from peer"),
                    }
                }
                .instrument(tracing::debug_span!("send-vote")),
            );
        }
        rx
    }

    /// Whether the granted votes form a majority of voters in every active group.
    fn tally(&self) -> bool {
        for group in self.core.configuration.active_groups() {
            let granted = self
                .core
                .configuration
                .servers
                .iter()
                .filter(|s| self.core.configuration.is_voter(s, *group) && self.granted.contains(&s.id))
                .count();
            if granted < self.core.configuration.quorum(*group) {
                return false;
            }
        }
        true
    }

    /// Handle a single vote response.
    ///
    /// Returns true when a pre-vote round just succeeded and the caller should start the
    /// real election.
    #[tracing::instrument(level = "debug", skip(self, res), fields(res=?res, peer=target))]
    pub(super) async fn handle_vote_response(&mut self, res: VoteResponse, target: NodeId) -> RaftResult<bool> {
        // Votes from servers which do not vote in the current configuration are ignored:
        // the configuration may have changed since the requests went out.
        if self.core.configuration.index_of_voter(target).is_none() {
            tracing::debug!(id = self.core.id, target, "vote response from a non-voter, ignoring");
            return Ok(false);
        }

        if self.in_pre_vote {
            // A peer more than one term ahead means this probe is hopeless; adopt the
            // term and step down.
            if res.term > self.core.current_term + 1 {
                self.core.update_current_term(res.term, None);
                self.core.save_hard_state().await?;
                self.core.update_current_leader(UpdateCurrentLeader::Unknown);
                self.core.set_target_state(State::Follower);
                return Ok(false);
            }
        } else {
            // Stale grants from the pre-vote round must not be counted as real votes.
            if res.pre_vote {
                tracing::debug!(id = self.core.id, target, "stale pre-vote response during real election, ignoring");
                return Ok(false);
            }
            if res.term > self.core.current_term {
                self.core.update_current_term(res.term, None);
                self.core.save_hard_state().await?;
                self.core.update_current_leader(UpdateCurrentLeader::Unknown);
                self.core.set_target_state(State::Follower);
                return Ok(false);
            }
            if res.term < self.core.current_term {
                // An old message from a choppy network; the voter would have adopted our
                // term.
                return Ok(false);
            }
        }

        if !res.vote_granted {
            return Ok(false);
        }

        self.granted.insert(target);
        if !self.tally() {
            return Ok(false);
        }

        if self.in_pre_vote {
            tracing::debug!(id = self.core.id, "pre-vote quorum reached, starting election");
            return Ok(true);
        }

        tracing::debug!(id = self.core.id, term = self.core.current_term, "votes quorum reached, becoming leader");
        self.core.set_target_state(State::Leader);
        Ok(false)
    }
}
