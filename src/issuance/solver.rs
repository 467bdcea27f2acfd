use std::{collections::BTreeMap, sync::Arc};

use anyhow::Result;

use crate::core::{
    config::ReconcilerConfig,
    context::Context,
    types::{Challenge, ChallengeOffer},
};

/// Provisions and removes the proof material for one challenge type.
///
/// Implementations must be safe to call repeatedly for the same challenge:
/// `present` may run again after a restart and `clean_up` may run for a
/// challenge that was never presented.
pub trait Solver: Send + Sync {
    fn present(&self, ctx: &Context, challenge: &Challenge) -> Result<()>;
    fn check_presented(&self, ctx: &Context, challenge: &Challenge) -> Result<bool>;
    fn clean_up(&self, ctx: &Context, challenge: &Challenge) -> Result<()>;
}

#[derive(Default, Clone)]
pub struct SolverRegistry {
    solvers: BTreeMap<String, Arc<dyn Solver>>,
}

impl SolverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, challenge_type: impl Into<String>, solver: Arc<dyn Solver>) {
        self.solvers.insert(challenge_type.into(), solver);
    }

    pub fn with(mut self, challenge_type: impl Into<String>, solver: Arc<dyn Solver>) -> Self {
        self.register(challenge_type, solver);
        self
    }

    pub fn get(&self, challenge_type: &str) -> Option<&Arc<dyn Solver>> {
        self.solvers.get(challenge_type)
    }

    pub fn supported_types(&self) -> impl Iterator<Item = &str> {
        self.solvers.keys().map(String::as_str)
    }

    /// Best-ranked offer that has a solver and has not been tried yet.
    pub fn select<'a>(
        &self,
        offers: &'a [ChallengeOffer],
        attempted: &[String],
        config: &ReconcilerConfig,
    ) -> Option<&'a ChallengeOffer> {
        offers
            .iter()
            .filter(|offer| self.solvers.contains_key(&offer.challenge_type))
            .filter(|offer| !attempted.contains(&offer.challenge_type))
            .filter_map(|offer| config.rank(&offer.challenge_type).map(|rank| (rank, offer)))
            .min_by_key(|(rank, _)| *rank)
            .map(|(_, offer)| offer)
    }
}

impl std::fmt::Debug for SolverRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SolverRegistry")
            .field("types", &self.solvers.keys().collect::<Vec<_>>())
            .finish()
    }
}
