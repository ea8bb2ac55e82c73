use std::sync::LazyLock;

use regex::Regex;

use crate::channel::ChannelKind;
use crate::errors::RelayError;
use crate::router::RoutingRequest;

const ORGANIZATION_DISABLED: &str = "This organization has been disabled";

static CREDENTIAL_DEAD_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(concat!(
        r"(?i)invalid[ _-]?api[ _-]?key|incorrect api key|api key not valid",
        r"|account (?:has been )?deactivated|organization has been disabled",
        r"|insufficient[ _-](?:quota|balance)|credit balance is too low",
        r"|permission denied|your api key has expired",
    ))
    .expect("valid credential pattern")
});

/// Whether the request was pinned to a channel, and whether the pin may be
/// bypassed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PinState {
    pub pinned: bool,
    pub ignorable: bool,
}

impl PinState {
    pub fn is_binding(&self) -> bool {
        self.pinned && !self.ignorable
    }
}

impl From<&RoutingRequest> for PinState {
    fn from(request: &RoutingRequest) -> Self {
        Self {
            pinned: request.pinned.is_some(),
            ignorable: request.ignore_pin,
        }
    }
}

/// Decides whether a failed attempt may move on to another channel.
pub fn should_retry(err: &RelayError, kind: ChannelKind, pin: PinState) -> bool {
    if pin.is_binding() {
        return false;
    }
    if err.is_local() {
        return false;
    }
    match err.status {
        429 | 307 => true,
        504 | 524 => false,
        500..=599 => true,
        400 => kind == ChannelKind::Anthropic && err.message.contains(ORGANIZATION_DISABLED),
        _ => false,
    }
}

/// Provider heuristics for taking a channel out of rotation.
pub trait DisablePolicy: Send + Sync {
    /// A reason when the channel behind `err` should be disabled.
    fn should_disable(&self, kind: ChannelKind, err: &RelayError) -> Option<String>;
}

/// Disables on rejected credentials and on dead-account vocabulary.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultDisablePolicy;

impl DisablePolicy for DefaultDisablePolicy {
    fn should_disable(&self, _kind: ChannelKind, err: &RelayError) -> Option<String> {
        if err.is_local() {
            return None;
        }
        if matches!(err.status, 401 | 403) {
            return Some(format!("status {}: {}", err.status, err.message));
        }
        CREDENTIAL_DEAD_RE
            .is_match(&err.message)
            .then(|| format!("upstream reported: {}", err.message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upstream(status: u16) -> RelayError {
        RelayError::upstream(status, "upstream failure")
    }

    const FREE: PinState = PinState {
        pinned: false,
        ignorable: false,
    };

    #[test]
    fn retry_table() {
        let rows: &[(u16, bool)] = &[
            (429, true),
            (307, true),
            (500, true),
            (502, true),
            (503, true),
            (599, true),
            (504, false),
            (524, false),
            (400, false),
            (401, false),
            (403, false),
            (404, false),
            (408, false),
            (200, false),
            (204, false),
            (302, false),
        ];
        for (status, expected) in rows {
            assert_eq!(
                should_retry(&upstream(*status), ChannelKind::OpenAI, FREE),
                *expected,
                "status {status}"
            );
        }
    }

    #[test]
    fn anthropic_disabled_organization_is_retried() {
        let err = RelayError::upstream(400, "This organization has been disabled.");
        assert!(should_retry(&err, ChannelKind::Anthropic, FREE));
        assert!(!should_retry(&err, ChannelKind::OpenAI, FREE));
        assert!(!should_retry(
            &RelayError::upstream(400, "prompt too long"),
            ChannelKind::Anthropic,
            FREE
        ));
    }

    #[test]
    fn binding_pins_and_local_errors_never_retry() {
        let pinned = PinState {
            pinned: true,
            ignorable: false,
        };
        assert!(!should_retry(&upstream(429), ChannelKind::OpenAI, pinned));
        let ignorable = PinState {
            pinned: true,
            ignorable: true,
        };
        assert!(should_retry(&upstream(429), ChannelKind::OpenAI, ignorable));
        assert!(!should_retry(
            &RelayError::local(500, "serialize failed"),
            ChannelKind::OpenAI,
            FREE
        ));
        assert!(!should_retry(
            &RelayError::consistency("broken"),
            ChannelKind::OpenAI,
            FREE
        ));
    }

    #[test]
    fn default_policy_disables_dead_credentials() {
        let policy = DefaultDisablePolicy;
        assert!(policy.should_disable(ChannelKind::OpenAI, &upstream(401)).is_some());
        assert!(policy.should_disable(ChannelKind::OpenAI, &upstream(403)).is_some());
        assert!(
            policy
                .should_disable(
                    ChannelKind::OpenAI,
                    &RelayError::upstream(429, "You exceeded your current quota: insufficient_quota")
                )
                .is_some()
        );
        assert!(policy.should_disable(ChannelKind::OpenAI, &upstream(500)).is_none());
        assert!(
            policy
                .should_disable(ChannelKind::OpenAI, &RelayError::local(401, "no key"))
                .is_none()
        );
    }
}
