//! Shared application state for the HTTP layer.

use crate::identity::ClientIdentifier;
use crate::lifecycle::LifecycleManager;
use crate::verify::Verifier;
use serde::Serialize;
use std::sync::Arc;

/// Details the frontend needs to render the challenge page.
#[derive(Debug, Clone, Serialize)]
pub struct ChallengeInfo {
    pub title: String,
    /// Host clients connect to once their instance is ready.
    pub host: String,
    pub turnstile_site_key: Option<String>,
}

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub manager: LifecycleManager,
    pub identifier: ClientIdentifier,
    pub verifier: Arc<dyn Verifier>,
    pub challenge: Arc<ChallengeInfo>,
}

impl AppState {
    pub fn new(
        manager: LifecycleManager,
        identifier: ClientIdentifier,
        verifier: Arc<dyn Verifier>,
        challenge: ChallengeInfo,
    ) -> Self {
        Self {
            manager,
            identifier,
            verifier,
            challenge: Arc::new(challenge),
        }
    }
}
