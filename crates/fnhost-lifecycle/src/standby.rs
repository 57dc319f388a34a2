//! Standby mode and specialization.
//!
//! A pre-warmed host starts under a placeholder configuration. When it is
//! assigned to a tenant ("specialized") the platform rewrites several
//! environment values. Collaborators that cache those values subscribe to
//! the standby channel and recompute once, on their next read after the
//! flip. Nothing recomputes behind the caller's back.

use std::sync::{Arc, Mutex, PoisonError, RwLock};

use tokio::sync::watch;
use tracing::info;

use fnhost_core::{Environment, names};

/// Owner of the "in standby" flag.
pub struct StandbyState {
    env: Arc<dyn Environment>,
    tx: watch::Sender<bool>,
}

impl StandbyState {
    /// Start in standby if the environment says the host is a placeholder.
    pub fn from_env(env: Arc<dyn Environment>) -> Self {
        let in_standby = env.is_placeholder_mode();
        if in_standby {
            info!("host is in standby mode");
        }
        Self::new(env, in_standby)
    }

    pub fn new(env: Arc<dyn Environment>, in_standby: bool) -> Self {
        let (tx, _rx) = watch::channel(in_standby);
        Self { env, tx }
    }

    pub fn in_standby(&self) -> bool {
        *self.tx.borrow()
    }

    /// Change notifications; the value is `true` while in standby.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    /// Leave standby. The environment cache is dropped before subscribers
    /// are notified. Returns false if the host was already specialized.
    pub fn specialize(&self) -> bool {
        let env = &self.env;
        self.tx.send_if_modified(|in_standby| {
            if !*in_standby {
                return false;
            }
            env.reset();
            *in_standby = false;
            true
        })
    }
}

/// Tenant identity derived from environment settings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppIdentity {
    pub subscription_id: Option<String>,
    pub site_name: Option<String>,
    pub slot_name: Option<String>,
}

impl AppIdentity {
    pub fn from_env(env: &dyn Environment) -> Self {
        let subscription_id = env
            .get(names::OWNER_NAME)
            .and_then(|owner| owner.split('+').next().map(str::to_string))
            .filter(|s| !s.is_empty());
        Self {
            subscription_id,
            site_name: env.get(names::SITE_NAME),
            slot_name: env.get(names::SLOT_NAME),
        }
    }
}

/// `AppIdentity` cached until the host specializes.
pub struct AppIdentityCache {
    env: Arc<dyn Environment>,
    standby: Mutex<watch::Receiver<bool>>,
    identity: RwLock<AppIdentity>,
}

impl AppIdentityCache {
    pub fn new(env: Arc<dyn Environment>, standby: watch::Receiver<bool>) -> Self {
        let identity = AppIdentity::from_env(env.as_ref());
        Self {
            env,
            standby: Mutex::new(standby),
            identity: RwLock::new(identity),
        }
    }

    /// The cached identity, recomputed first if specialization happened
    /// since the last read.
    pub fn get(&self) -> AppIdentity {
        {
            let mut standby = self.standby.lock().unwrap_or_else(PoisonError::into_inner);
            if standby.has_changed().unwrap_or(false) {
                standby.borrow_and_update();
                let fresh = AppIdentity::from_env(self.env.as_ref());
                *self.identity.write().unwrap_or_else(PoisonError::into_inner) = fresh;
            }
        }
        self.identity
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use fnhost_core::StaticEnvironment;

    use super::*;

    fn placeholder_env() -> Arc<StaticEnvironment> {
        Arc::new(
            StaticEnvironment::new()
                .with(names::PLACEHOLDER_MODE, "1")
                .with(names::SITE_NAME, "placeholder")
                .with(names::OWNER_NAME, "sub-0000+pool-westwebspace"),
        )
    }

    #[test]
    fn identity_parses_subscription_prefix() {
        let env = placeholder_env();
        let identity = AppIdentity::from_env(env.as_ref());
        assert_eq!(identity.subscription_id.as_deref(), Some("sub-0000"));
        assert_eq!(identity.site_name.as_deref(), Some("placeholder"));
        assert_eq!(identity.slot_name, None);
    }

    #[test]
    fn standby_detected_from_env() {
        let state = StandbyState::from_env(placeholder_env());
        assert!(state.in_standby());

        let state = StandbyState::from_env(Arc::new(StaticEnvironment::new()));
        assert!(!state.in_standby());
    }

    #[test]
    fn specialize_only_once() {
        let state = StandbyState::from_env(placeholder_env());
        assert!(state.specialize());
        assert!(!state.in_standby());
        assert!(!state.specialize());
    }

    #[test]
    fn identity_recomputed_exactly_once_on_specialization() {
        let env = placeholder_env();
        let state = StandbyState::from_env(env.clone());
        let cache = AppIdentityCache::new(env.clone(), state.subscribe());

        assert_eq!(cache.get().site_name.as_deref(), Some("placeholder"));

        // Platform rewrites the environment; the cache does not notice yet.
        env.set(names::SITE_NAME, "orders-api");
        env.set(names::SLOT_NAME, "production");
        assert_eq!(cache.get().site_name.as_deref(), Some("placeholder"));

        state.specialize();
        let identity = cache.get();
        assert_eq!(identity.site_name.as_deref(), Some("orders-api"));
        assert_eq!(identity.slot_name.as_deref(), Some("production"));

        // Later changes are not picked up; recomputation happened once.
        env.set(names::SITE_NAME, "renamed");
        assert_eq!(cache.get().site_name.as_deref(), Some("orders-api"));
    }

    #[test]
    fn subscribers_see_the_flip() {
        let state = StandbyState::from_env(placeholder_env());
        let mut rx = state.subscribe();
        assert!(*rx.borrow_and_update());

        state.specialize();
        assert!(rx.has_changed().unwrap());
        assert!(!*rx.borrow_and_update());
    }
}
