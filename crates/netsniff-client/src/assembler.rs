//! Per-exchange log assembly
//!
//! The request half and the response half of an exchange are captured by
//! independent tasks. The assembler collects both and writes exactly one
//! [`NetworkLog`](crate::NetworkLog) once both are terminal.

use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tracing::debug;

use crate::error::StoreError;
use crate::model::{self, RequestEntry, ResponseEntry};
use crate::store::LogStore;

/// Assembly progress of one exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Pending,
    RequestSaved,
    ResponseSaved,
    BothSaved,
    Finished,
}

struct State {
    request: RequestEntry,
    response: Option<ResponseEntry>,
    request_done: bool,
    response_done: bool,
    error: Option<String>,
    finishing: bool,
    finished: bool,
}

/// Rendezvous point for the two halves of an exchange
pub struct LogAssembler {
    state: Mutex<State>,
    request_signal: watch::Sender<bool>,
    response_signal: watch::Sender<bool>,
    store: Arc<dyn LogStore>,
}

impl LogAssembler {
    /// Start assembling an exchange.
    ///
    /// `request` is the request as known before any body capture; it is what
    /// gets written if the request half is given up.
    pub fn new(request: RequestEntry, store: Arc<dyn LogStore>) -> Self {
        let (request_signal, _) = watch::channel(false);
        let (response_signal, _) = watch::channel(false);

        Self {
            state: Mutex::new(State {
                request,
                response: None,
                request_done: false,
                response_done: false,
                error: None,
                finishing: false,
                finished: false,
            }),
            request_signal,
            response_signal,
            store,
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Save the request half. Returns `false` if it was already terminal.
    pub fn save_request(&self, entry: RequestEntry) -> bool {
        {
            let mut state = self.lock();
            if state.request_done {
                return false;
            }
            state.request = entry;
            state.request_done = true;
        }
        self.request_signal.send_replace(true);
        true
    }

    /// Save the response half. Returns `false` if it was already terminal.
    pub fn save_response(&self, entry: ResponseEntry) -> bool {
        {
            let mut state = self.lock();
            if state.response_done {
                return false;
            }
            state.response = Some(entry);
            state.response_done = true;
        }
        self.response_signal.send_replace(true);
        true
    }

    /// Mark the request half terminal, keeping the request as first known
    pub fn give_up_request(&self) -> bool {
        {
            let mut state = self.lock();
            if state.request_done {
                return false;
            }
            state.request_done = true;
        }
        self.request_signal.send_replace(true);
        true
    }

    /// Mark the response half terminal without a response
    pub fn give_up_response(&self) -> bool {
        {
            let mut state = self.lock();
            if state.response_done {
                return false;
            }
            state.response_done = true;
        }
        self.response_signal.send_replace(true);
        true
    }

    /// Record the error that terminated the exchange. The first error wins.
    pub fn record_error(&self, message: impl Into<String>) {
        let mut state = self.lock();
        if state.finished || state.error.is_some() {
            return;
        }
        state.error = Some(message.into());
    }

    pub fn phase(&self) -> Phase {
        let state = self.lock();
        match (state.finished, state.request_done, state.response_done) {
            (true, _, _) => Phase::Finished,
            (false, true, true) => Phase::BothSaved,
            (false, true, false) => Phase::RequestSaved,
            (false, false, true) => Phase::ResponseSaved,
            (false, false, false) => Phase::Pending,
        }
    }

    /// Wait for both halves and write the log.
    ///
    /// Only the first call writes; it returns `Ok(true)` once the row is
    /// inserted. Later calls return `Ok(false)` immediately.
    pub async fn finish(&self, id: &str) -> Result<bool, StoreError> {
        {
            let mut state = self.lock();
            if state.finishing {
                return Ok(false);
            }
            state.finishing = true;
        }

        let mut request_done = self.request_signal.subscribe();
        let mut response_done = self.response_signal.subscribe();
        // The senders live in `self`, so the channels cannot close here
        let _ = request_done.wait_for(|done| *done).await;
        let _ = response_done.wait_for(|done| *done).await;

        let log = {
            let mut state = self.lock();
            state.finished = true;
            model::assemble(
                id,
                state.request.clone(),
                state.response.take(),
                state.error.take(),
            )
        };

        self.store.insert(log).await?;
        debug!("Log {} inserted", id);
        Ok(true)
    }
}
