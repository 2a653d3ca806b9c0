use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tracing::debug;

use super::Tenant;

/// How long a browser has to come back from the provider.
const STATE_TTL: Duration = Duration::from_secs(600);

/// Outstanding OAuth `state` values, each bound to the tenant that asked for
/// authorisation.  A state is single-use.
#[derive(Clone, Default)]
pub struct PendingLogins {
    inner: Arc<Mutex<HashMap<String, (Tenant, Instant)>>>,
}

impl PendingLogins {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mint a fresh state for `tenant`.
    pub fn begin(&self, tenant: Tenant) -> String {
        let state = uuid::Uuid::new_v4().simple().to_string();
        let mut map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        map.retain(|_, (_, issued)| now.duration_since(*issued) < STATE_TTL);
        map.insert(state.clone(), (tenant, now));
        debug!(pending = map.len(), "oauth state issued");
        state
    }

    /// Consume `state`, returning its tenant if it was issued and has not
    /// expired.
    pub fn complete(&self, state: &str) -> Option<Tenant> {
        let mut map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let (tenant, issued) = map.remove(state)?;
        (issued.elapsed() < STATE_TTL).then_some(tenant)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_is_single_use() {
        let pending = PendingLogins::new();
        let state = pending.begin(Tenant::Org("acme".into()));
        assert_eq!(pending.complete(&state), Some(Tenant::Org("acme".into())));
        assert_eq!(pending.complete(&state), None);
    }

    #[test]
    fn unknown_state_is_rejected() {
        let pending = PendingLogins::new();
        pending.begin(Tenant::Global);
        assert_eq!(pending.complete("forged"), None);
    }

    #[test]
    fn states_are_distinct() {
        let pending = PendingLogins::new();
        assert_ne!(pending.begin(Tenant::Global), pending.begin(Tenant::Global));
    }
}
