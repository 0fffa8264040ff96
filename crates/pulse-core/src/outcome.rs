//! Classification of backend responses.

use std::fmt;

/// HTTP-equivalent status used when no response arrived (timeout, abort, DNS...).
pub const STATUS_TRANSPORT: u16 = 0;

/// What happened to one delivery or identity call.
///
/// Never raised as an error: callers observe it, the coordinator reacts to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeliveryOutcome {
    /// 2xx.
    Success,
    /// Precondition not met: no signed identity, nothing was sent.
    NoSignedIdentity,
    /// No response at all (status 0).
    Transport,
    /// 401 or 403.
    AuthRejected,
    /// 429 or 5xx.
    Overloaded,
    /// Any other status; counts as a failed attempt but is not a distress signal.
    Rejected(u16),
    /// `track_event` queued the event without attempting a send
    /// (backend offline or auth-pause active).
    Deferred,
}

impl DeliveryOutcome {
    /// Classify a response status.
    #[must_use]
    pub const fn from_status(status: u16) -> Self {
        match status {
            STATUS_TRANSPORT => Self::Transport,
            200..=299 => Self::Success,
            401 | 403 => Self::AuthRejected,
            429 | 500..=599 => Self::Overloaded,
            other => Self::Rejected(other),
        }
    }

    /// True for `Success`.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }

    /// True when the backend asked the client to back off (auth or overload).
    #[must_use]
    pub const fn is_distress(&self) -> bool {
        matches!(self, Self::AuthRejected | Self::Overloaded)
    }

    /// True when a flush round must stop at this event.
    #[must_use]
    pub const fn stops_round(&self) -> bool {
        matches!(
            self,
            Self::Transport | Self::AuthRejected | Self::Overloaded | Self::NoSignedIdentity
        )
    }

    /// Short label for logs and monitor causes.
    #[must_use]
    pub fn label(&self) -> String {
        match self {
            Self::Success => "success".to_string(),
            Self::NoSignedIdentity => "no_signed_identity".to_string(),
            Self::Transport => "transport".to_string(),
            Self::AuthRejected => "auth_rejected".to_string(),
            Self::Overloaded => "overloaded".to_string(),
            Self::Rejected(status) => format!("rejected:{status}"),
            Self::Deferred => "deferred".to_string(),
        }
    }
}

impl fmt::Display for DeliveryOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        assert_eq!(DeliveryOutcome::from_status(0), DeliveryOutcome::Transport);
        assert_eq!(DeliveryOutcome::from_status(200), DeliveryOutcome::Success);
        assert_eq!(DeliveryOutcome::from_status(204), DeliveryOutcome::Success);
        assert_eq!(DeliveryOutcome::from_status(401), DeliveryOutcome::AuthRejected);
        assert_eq!(DeliveryOutcome::from_status(403), DeliveryOutcome::AuthRejected);
        assert_eq!(DeliveryOutcome::from_status(429), DeliveryOutcome::Overloaded);
        assert_eq!(DeliveryOutcome::from_status(503), DeliveryOutcome::Overloaded);
        assert_eq!(DeliveryOutcome::from_status(400), DeliveryOutcome::Rejected(400));
        assert_eq!(DeliveryOutcome::from_status(302), DeliveryOutcome::Rejected(302));
    }

    #[test]
    fn round_stopping_outcomes() {
        assert!(DeliveryOutcome::Transport.stops_round());
        assert!(DeliveryOutcome::Overloaded.stops_round());
        assert!(!DeliveryOutcome::Rejected(400).stops_round());
        assert!(!DeliveryOutcome::Success.stops_round());
        assert!(DeliveryOutcome::AuthRejected.is_distress());
    }

    #[test]
    fn display_labels() {
        assert_eq!(DeliveryOutcome::Rejected(422).to_string(), "rejected:422");
        assert_eq!(DeliveryOutcome::Overloaded.to_string(), "overloaded");
    }
}
