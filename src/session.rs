//! Session binder.
//!
//! Follows the authentication state of the application and drives the
//! realtime client accordingly: connect when an eligible identity logs in,
//! tear down when it logs out, and always tear down before connecting a
//! different identity.

use crate::client::{RealtimeClient, SubscriptionHandle};
use crate::config::ClientConfig;
use crate::identity::{notification_topic, Identity, IdentityKey, Role};
use crate::events::DomainEvent;
use crate::registry::Callback;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Authentication state published by the auth collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum AuthState {
    #[default]
    Unauthenticated,
    Authenticated(Identity),
}

/// Transport action required by a state transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BinderAction {
    /// Close the connection and release everything bound to the old identity.
    Disconnect,
    Connect(Identity),
}

#[derive(Debug, Clone, Copy)]
struct Bound {
    key: IdentityKey,
    connected: bool,
}

/// Binds the realtime connection to the authenticated identity.
pub struct SessionBinder {
    realtime_roles: Vec<Role>,
    bound: Option<Bound>,
    notifications: Option<SubscriptionHandle>,
    on_notification: Option<Callback>,
}

impl SessionBinder {
    pub fn new(config: &ClientConfig) -> Self {
        SessionBinder {
            realtime_roles: config.realtime_roles.clone(),
            bound: None,
            notifications: None,
            on_notification: None,
        }
    }

    /// Callback for events on the per-user notification channel.
    pub fn with_notification_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(&str, &DomainEvent) + Send + Sync + 'static,
    {
        self.on_notification = Some(Arc::new(callback));
        self
    }

    /// Key of the identity currently bound, eligible or not.
    pub fn bound_key(&self) -> Option<IdentityKey> {
        self.bound.map(|b| b.key)
    }

    /// Computes the actions for a new auth state. Unchanged keys yield none.
    pub fn transition(&mut self, state: &AuthState) -> Vec<BinderAction> {
        let next = match state {
            AuthState::Unauthenticated => None,
            AuthState::Authenticated(identity) => Some(identity),
        };

        match (self.bound, next) {
            (None, None) => Vec::new(),
            (Some(bound), Some(identity)) if bound.key == identity.key() => Vec::new(),
            (previous, next) => {
                let mut actions = Vec::new();
                if previous.is_some_and(|b| b.connected) {
                    actions.push(BinderAction::Disconnect);
                }
                self.bound = next.map(|identity| {
                    let eligible = self.realtime_roles.contains(&identity.role);
                    if eligible {
                        actions.push(BinderAction::Connect(identity.clone()));
                    } else {
                        debug!("Role {} is not eligible for realtime", identity.role);
                    }
                    Bound {
                        key: identity.key(),
                        connected: eligible,
                    }
                });
                actions
            }
        }
    }

    /// Applies a new auth state to `client`.
    pub fn apply(&mut self, client: &RealtimeClient, state: &AuthState) {
        for action in self.transition(state) {
            match action {
                BinderAction::Disconnect => {
                    info!("Session ended, tearing down realtime connection");
                    if let Some(handle) = self.notifications.take() {
                        handle.unsubscribe();
                    }
                    client.end_session();
                }
                BinderAction::Connect(identity) => {
                    info!("Session started for {}", identity.key());
                    let topic = notification_topic(&identity.user_id);
                    client.connect(identity);
                    let callback = self.on_notification.clone();
                    self.notifications = Some(client.subscribe(topic, move |topic, event| {
                        if let Some(callback) = &callback {
                            callback(topic, event);
                        }
                    }));
                }
            }
        }
    }

    /// Follows `auth` until its sender is dropped, then tears the session down.
    ///
    /// `on_auth_expired` is invoked when the broker rejects the credential of
    /// the bound identity, so the auth collaborator can force a new login.
    pub async fn run<F>(
        mut self,
        client: RealtimeClient,
        mut auth: watch::Receiver<AuthState>,
        on_auth_expired: F,
    ) where
        F: Fn(IdentityKey) + Send + Sync + 'static,
    {
        let mut expired = client.auth_expired();
        let initial = auth.borrow_and_update().clone();
        self.apply(&client, &initial);

        loop {
            tokio::select! {
                changed = auth.changed() => {
                    if changed.is_err() {
                        debug!("Auth state source closed");
                        break;
                    }
                    let state = auth.borrow_and_update().clone();
                    self.apply(&client, &state);
                }
                changed = expired.changed() => {
                    if changed.is_err() {
                        debug!("Realtime client closed");
                        break;
                    }
                    let key = *expired.borrow_and_update();
                    if let Some(key) = key.filter(|k| self.bound_key() == Some(*k)) {
                        warn!("Credential for {} expired", key);
                        on_auth_expired(key);
                    }
                }
            }
        }
        self.apply(&client, &AuthState::Unauthenticated);
    }

    /// Spawns [`SessionBinder::run`] on the current runtime.
    pub fn spawn<F>(
        self,
        client: RealtimeClient,
        auth: watch::Receiver<AuthState>,
        on_auth_expired: F,
    ) -> JoinHandle<()>
    where
        F: Fn(IdentityKey) + Send + Sync + 'static,
    {
        tokio::spawn(self.run(client, auth, on_auth_expired))
    }
}
