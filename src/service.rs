use std::sync::Arc;

use log::{error, info, warn};
use rocket::{
    fairing::{Fairing, Info, Kind},
    Build, Rocket,
};

use crate::{
    clock::{Clock, SystemClock},
    config::Config,
    error::{Error, Result},
    model::{
        api::{
            candidate::CandidateView,
            session::{SessionCredentials, SignInRequest, SignInResponse},
            vote::{CompletionReceipt, VoteReceipt, VoteRequest},
        },
        ballot::{BallotTransaction, RateLimit},
        completion::CompletionGuard,
        db::{Voter, VoterCore, VoterStatus},
        fingerprint::{Fingerprint, SignalKeyer},
        guard::{Decision, DuplicateGuard, Screening},
        identity::{Identity, IdentityValidator},
        roster::Roster,
        session::SessionManager,
        store::DynStore,
        tally::{Tally, TallyAggregator},
        transaction::retry_on_conflict,
    },
};

/// The voting core, assembled from configuration. Every endpoint goes
/// through this.
pub struct VotingService {
    validator: IdentityValidator,
    guard: Arc<DuplicateGuard>,
    sessions: SessionManager,
    ballots: BallotTransaction,
    completion: CompletionGuard,
    tally: TallyAggregator,
    roster: Arc<Roster>,
    store: DynStore,
    retries: usize,
}

impl VotingService {
    pub fn new(config: &Config, store: DynStore, roster: Roster, clock: Arc<dyn Clock>) -> Self {
        let roster = Arc::new(roster);
        let retries = config.transaction_retries();
        let validator = IdentityValidator::new(
            config.institution_domain(),
            config.enrollment_years(),
            config.departments(),
        );
        let guard = Arc::new(DuplicateGuard::new(
            store.clone(),
            SignalKeyer::new(config.hmac_secret()),
            config.detection_strategy().strategy(),
        ));
        let rate_limit = (config.vote_rate_limit() > 0 && guard.strategy().limits_network_rate())
            .then(|| RateLimit {
                max_votes: config.vote_rate_limit().into(),
                window: config.vote_rate_window(),
            });

        Self {
            validator,
            sessions: SessionManager::new(store.clone(), clock.clone(), config.session_ttl()),
            ballots: BallotTransaction::new(
                store.clone(),
                roster.clone(),
                clock.clone(),
                rate_limit,
                retries,
            ),
            completion: CompletionGuard::new(
                store.clone(),
                guard.clone(),
                roster.clone(),
                clock,
                retries,
            ),
            tally: TallyAggregator::new(store.clone(), roster.clone()),
            guard,
            roster,
            store,
            retries,
        }
    }

    /// Validate the credentials, admit the voter past the duplicate check,
    /// and start a session. First sign-in creates the voter record.
    pub async fn sign_in(
        &self,
        request: &SignInRequest,
        fingerprint: &Fingerprint,
    ) -> Result<SignInResponse> {
        let identity = self.validator.validate(
            &request.institutional_email,
            &request.personal_email,
            &request.matric_number,
            &request.full_name,
        )?;
        let screening = self.guard.screen(fingerprint);
        let voter = retry_on_conflict(self.retries, || self.admit(&identity, &screening)).await?;
        let session = self.sessions.issue(voter.id).await?;
        info!("Voter {} signed in", voter.id);

        Ok(SignInResponse {
            session_token: session.token,
            expires_at: session.expires_at,
            remaining_positions: voter.remaining_positions(self.roster.positions()),
        })
    }

    async fn admit(&self, identity: &Identity, screening: &Screening) -> Result<Voter> {
        let existing = self
            .store
            .voter_by_institutional_email(&identity.institutional_email)
            .await?;
        if let Some(voter) = &existing {
            if voter.status == VoterStatus::Completed {
                return Err(Error::AlreadyVoted("every position".to_string()));
            }
        }
        if let Decision::Block(block) = self
            .guard
            .check(identity, existing.as_ref(), screening)
            .await?
        {
            return Err(block.into());
        }

        match existing {
            Some(voter) => {
                let claims = self.guard.claims(voter.id, screening);
                self.store.bind_signals(voter.id, &claims).await?;
                Ok(voter)
            }
            None => {
                let voter = Voter::new(VoterCore::new(identity.clone(), screening.keys()));
                let claims = self.guard.claims(voter.id, screening);
                self.store.register_voter(&voter, &claims).await?;
                info!("Registered new voter {}", voter.id);
                Ok(voter)
            }
        }
    }

    pub async fn cast_vote(
        &self,
        request: &VoteRequest,
        fingerprint: &Fingerprint,
    ) -> Result<VoteReceipt> {
        let voter = self.verify(&request.session).await?;
        let screening = self.guard.screen(fingerprint);
        let ballot = self
            .ballots
            .cast(voter.id, &request.candidate_id, &request.position, &screening)
            .await?;
        info!("Voter {} voted for {}", voter.id, ballot.position);
        Ok(VoteReceipt {
            position: ballot.position.clone(),
        })
    }

    pub async fn complete_voting(
        &self,
        credentials: &SessionCredentials,
        fingerprint: &Fingerprint,
    ) -> Result<CompletionReceipt> {
        let voter = self.verify(credentials).await?;
        let screening = self.guard.screen(fingerprint);
        self.completion.complete(voter.id, &screening).await?;
        Ok(CompletionReceipt { completed: true })
    }

    pub async fn sign_out(&self, credentials: &SessionCredentials) -> Result<()> {
        let voter = self.verify(credentials).await?;
        self.sessions.revoke(voter.id).await?;
        info!("Voter {} signed out", voter.id);
        Ok(())
    }

    pub fn positions(&self) -> &[String] {
        self.roster.positions()
    }

    pub fn candidates(&self, position: &str) -> Result<Vec<CandidateView>> {
        if !self.roster.has_position(position) {
            return Err(Error::not_found(format!("Position '{position}'")));
        }
        Ok(self.roster.candidates(position).map(Into::into).collect())
    }

    pub async fn tally(&self) -> Result<Tally> {
        self.tally.tally().await
    }

    async fn verify(&self, credentials: &SessionCredentials) -> Result<Voter> {
        self.sessions
            .verify(&credentials.institutional_email, &credentials.session_token)
            .await
    }
}

/// A fairing that assembles the `VotingService` from the managed config and
/// store, loading the roster on the way. Must be attached after
/// `ConfigFairing` and `DatabaseFairing`.
pub struct VotingFairing;

#[rocket::async_trait]
impl Fairing for VotingFairing {
    fn info(&self) -> Info {
        Info {
            name: "Voting",
            kind: Kind::Ignite,
        }
    }

    async fn on_ignite(&self, rocket: Rocket<Build>) -> rocket::fairing::Result {
        let (Some(config), Some(store)) = (rocket.state::<Config>(), rocket.state::<DynStore>())
        else {
            error!("Config and store must be set up before the voting service");
            return Err(rocket);
        };
        let roster = match Roster::load(config.roster(), store).await {
            Ok(roster) => roster,
            Err(e) => {
                error!("Failed to load the candidate roster: {e}");
                return Err(rocket);
            }
        };
        if roster.positions().is_empty() {
            warn!("The candidate roster is empty");
        }
        info!(
            "Loaded roster with positions {:?}, detecting duplicates by {}",
            roster.positions(),
            config.detection_strategy().strategy().name()
        );

        let service = VotingService::new(config, store.clone(), roster, Arc::new(SystemClock));
        Ok(rocket.manage(service))
    }
}

/// Example data for tests.
#[cfg(test)]
mod examples {
    use crate::model::store::MemoryStore;

    use super::*;

    impl VotingService {
        /// The example config and roster over the given store.
        pub fn example(store: MemoryStore) -> Self {
            Self::with_config(&Config::example(), store)
        }

        pub fn with_config(config: &Config, store: MemoryStore) -> Self {
            Self::new(config, Arc::new(store), Roster::example(), Arc::new(SystemClock))
        }
    }
}
