use std::sync::Arc;

use zlh_provision::{Decommissioner, Orchestrator};

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub decommissioner: Arc<Decommissioner>,
}
