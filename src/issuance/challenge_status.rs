use log::debug;
use thiserror::Error;

use crate::core::{
    context::Context,
    errors::{Classify, ErrorClass},
    types::Challenge,
};
use crate::issuance::client::{AuthorityClient, AuthorityError};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("challenge URL is blank - challenge has not been created yet")]
    NotYetCreated,
    #[error("challenge {url} was not present in authorization")]
    ChallengeNotInAuthorization { url: String },
    #[error(transparent)]
    Authority(#[from] AuthorityError),
}

impl Classify for SyncError {
    fn class(&self) -> ErrorClass {
        match self {
            SyncError::NotYetCreated => ErrorClass::NotYetCreated,
            SyncError::ChallengeNotInAuthorization { .. } => ErrorClass::DivergedState,
            SyncError::Authority(err) => err.class(),
        }
    }
}

/// Refreshes `challenge.status.state` and `challenge.status.reason` from the authority.
///
/// The state is read through the parent authorization rather than the
/// challenge URL: some authorities treat a POST to the challenge itself as an
/// accept. Nothing is retried here and nothing is persisted; on any error the
/// challenge is left exactly as it was.
pub fn sync_challenge_status(
    ctx: &Context,
    client: &dyn AuthorityClient,
    challenge: &mut Challenge,
) -> Result<(), SyncError> {
    if challenge.spec.url.is_empty() {
        return Err(SyncError::NotYetCreated);
    }
    ctx.check().map_err(AuthorityError::from)?;

    let authorization = client.get_authorization(ctx, &challenge.spec.authorization_url)?;
    let Some(remote) = authorization.challenge_by_url(&challenge.spec.url) else {
        debug!(
            "[challenge-sync] {} not listed in authorization {} ({} challenges)",
            challenge.spec.url,
            challenge.spec.authorization_url,
            authorization.challenges.len()
        );
        return Err(SyncError::ChallengeNotInAuthorization {
            url: challenge.spec.url.clone(),
        });
    };

    let reason = remote
        .error
        .as_ref()
        .map(|error| error.reason())
        .unwrap_or_default();
    debug!(
        "[challenge-sync] {} state {} -> {}",
        challenge.key(),
        challenge.status.state,
        remote.status
    );
    challenge.status.state = remote.status.clone();
    challenge.status.reason = reason;
    Ok(())
}
