//! A scripted runtime for tests.

use std::collections::{HashMap, VecDeque};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

use super::{ContainerRuntime, ContainerStatus, MergeRequest, StartAgentRequest};
use crate::types::ReviewOutcome;

#[derive(Debug, Default)]
struct State {
    start_results: VecDeque<bool>,
    default_start: Option<bool>,
    statuses: HashMap<String, ContainerStatus>,
    merge_results: VecDeque<ReviewOutcome>,
    message_results: VecDeque<bool>,
    starts: Vec<StartAgentRequest>,
    stops: Vec<String>,
    messages: Vec<(String, String)>,
    merges: Vec<MergeRequest>,
}

/// Records every call and answers from queued results.
///
/// Starts and merges succeed unless told otherwise. A successful start marks
/// the agent `Running`; agents never started report `Gone`. While held,
/// starts, status lookups and messages block until released.
#[derive(Debug, Default)]
pub struct FakeRuntime {
    state: Mutex<State>,
    held: Mutex<bool>,
    released: Condvar,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn hold(&self) {
        *self.held.lock().unwrap_or_else(PoisonError::into_inner) = true;
    }

    pub fn release(&self) {
        *self.held.lock().unwrap_or_else(PoisonError::into_inner) = false;
        self.released.notify_all();
    }

    fn wait_while_held(&self) {
        let held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        drop(
            self.released
                .wait_while(held, |held| *held)
                .unwrap_or_else(PoisonError::into_inner),
        );
    }

    /// Every later start fails unless a queued result says otherwise.
    pub fn fail_starts(&self) {
        self.lock().default_start = Some(false);
    }

    pub fn push_start(&self, ok: bool) {
        self.lock().start_results.push_back(ok);
    }

    pub fn set_status(&self, agent_id: &str, status: ContainerStatus) {
        self.lock().statuses.insert(agent_id.to_string(), status);
    }

    pub fn push_merge(&self, outcome: ReviewOutcome) {
        self.lock().merge_results.push_back(outcome);
    }

    pub fn push_message_result(&self, delivered: bool) {
        self.lock().message_results.push_back(delivered);
    }

    pub fn starts(&self) -> Vec<StartAgentRequest> {
        self.lock().starts.clone()
    }

    pub fn stops(&self) -> Vec<String> {
        self.lock().stops.clone()
    }

    pub fn messages(&self) -> Vec<(String, String)> {
        self.lock().messages.clone()
    }

    pub fn merges(&self) -> Vec<MergeRequest> {
        self.lock().merges.clone()
    }
}

impl ContainerRuntime for FakeRuntime {
    fn start_agent(&self, request: &StartAgentRequest) -> bool {
        self.wait_while_held();
        let mut state = self.lock();
        state.starts.push(request.clone());
        let ok = state
            .start_results
            .pop_front()
            .or(state.default_start)
            .unwrap_or(true);
        if ok {
            state
                .statuses
                .insert(request.agent_id.clone(), ContainerStatus::Running);
        }
        ok
    }

    fn agent_status(&self, agent_id: &str) -> ContainerStatus {
        self.wait_while_held();
        self.lock()
            .statuses
            .get(agent_id)
            .cloned()
            .unwrap_or(ContainerStatus::Gone { reason: None })
    }

    fn stop_agent(&self, agent_id: &str) {
        let mut state = self.lock();
        state.stops.push(agent_id.to_string());
        state.statuses.insert(
            agent_id.to_string(),
            ContainerStatus::Gone {
                reason: Some("stopped".into()),
            },
        );
    }

    fn send_message(&self, agent_id: &str, message: &str) -> bool {
        self.wait_while_held();
        let mut state = self.lock();
        state
            .messages
            .push((agent_id.to_string(), message.to_string()));
        state.message_results.pop_front().unwrap_or(true)
    }

    fn merge(&self, request: &MergeRequest) -> ReviewOutcome {
        let mut state = self.lock();
        state.merges.push(request.clone());
        state
            .merge_results
            .pop_front()
            .unwrap_or_else(|| ReviewOutcome::Merged {
                commit_sha: Some("0000000".into()),
            })
    }

    fn health(&self) -> bool {
        true
    }
}
