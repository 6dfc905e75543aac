//! Execution context passed into every primitive call.

use std::sync::Arc;
use std::time::{Duration, Instant};

use flowmill_core_types::{NodeId, SessionHandle};
use tokio_util::sync::CancellationToken;

use crate::drivers::{BrowserDriver, ReasoningService};

/// Everything a primitive needs to run one step: the session's driver
/// handles, a deadline, and a cancellation token. Session ownership is
/// explicit here so concurrent runs cannot cross-contaminate.
#[derive(Clone)]
pub struct StepCtx {
    pub session: SessionHandle,
    pub browser: Arc<dyn BrowserDriver>,
    pub reasoner: Arc<dyn ReasoningService>,
    pub node_id: NodeId,
    pub deadline: Instant,
    pub cancel: CancellationToken,
}

impl StepCtx {
    pub fn new(
        session: SessionHandle,
        browser: Arc<dyn BrowserDriver>,
        reasoner: Arc<dyn ReasoningService>,
        node_id: NodeId,
        deadline: Instant,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            session,
            browser,
            reasoner,
            node_id,
            deadline,
            cancel,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn remaining_time(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }
}
