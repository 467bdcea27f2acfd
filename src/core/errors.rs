/// Retry classification shared by every error crossing a module boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// A precondition is unmet; nothing to do until upstream state changes.
    NotYetCreated,
    /// Network or TLS failure.
    Transport,
    /// The authority rejected the request with a structured reason.
    AuthorityProtocol { transient: bool },
    /// Local record no longer matches the authority or the store; re-read before retrying.
    DivergedState,
    /// Caller-initiated abort or deadline.
    Cancelled,
    /// Needs operator intervention.
    Configuration,
}

impl ErrorClass {
    pub fn is_retryable(self) -> bool {
        match self {
            ErrorClass::Transport | ErrorClass::DivergedState | ErrorClass::Cancelled => true,
            ErrorClass::AuthorityProtocol { transient } => transient,
            ErrorClass::NotYetCreated | ErrorClass::Configuration => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorClass::NotYetCreated => "not_yet_created",
            ErrorClass::Transport => "transport",
            ErrorClass::AuthorityProtocol { transient: true } => "authority_transient",
            ErrorClass::AuthorityProtocol { transient: false } => "authority_terminal",
            ErrorClass::DivergedState => "diverged_state",
            ErrorClass::Cancelled => "cancelled",
            ErrorClass::Configuration => "configuration",
        }
    }
}

pub trait Classify {
    fn class(&self) -> ErrorClass;

    fn is_retryable(&self) -> bool {
        self.class().is_retryable()
    }
}

#[cfg(test)]
mod tests {
    use super::ErrorClass;

    #[test]
    fn retryability_matches_taxonomy() {
        assert!(ErrorClass::Transport.is_retryable());
        assert!(ErrorClass::Cancelled.is_retryable());
        assert!(ErrorClass::DivergedState.is_retryable());
        assert!(ErrorClass::AuthorityProtocol { transient: true }.is_retryable());
        assert!(!ErrorClass::AuthorityProtocol { transient: false }.is_retryable());
        assert!(!ErrorClass::NotYetCreated.is_retryable());
        assert!(!ErrorClass::Configuration.is_retryable());
    }
}
