// Copyright 2024 Delta Vision Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{
    collections::HashMap,
    net,
    net::TcpStream,
    sync::{Arc, Condvar, Mutex},
    time,
};

use tracing::{info, warn};

use crate::server::session::PtySession;

/// The lifecycle of one session. Transitions only move forward and
/// repeated requests for the same transition are no-ops, so duplicate
/// close paths are harmless.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionState {
    Starting,
    Active,
    Closing,
    Closed,
}

/// A forward-only state slot that waiters can block on.
#[derive(Debug)]
pub struct StateCell {
    state: Mutex<SessionState>,
    cond: Condvar,
}

impl StateCell {
    pub fn new() -> Self {
        StateCell { state: Mutex::new(SessionState::Starting), cond: Condvar::new() }
    }

    pub fn get(&self) -> SessionState {
        *self.state.lock().unwrap()
    }

    /// Advance to the given state. Requests to move backwards are
    /// ignored, which is what makes duplicate teardown idempotent.
    pub fn advance(&self, to: SessionState) {
        let mut state = self.state.lock().unwrap();
        if *state < to {
            *state = to;
            self.cond.notify_all();
        }
    }

    /// Wait until the session reaches Closed, or the timeout fires.
    /// Returns true if the session closed in time.
    pub fn wait_closed(&self, timeout: time::Duration) -> bool {
        let state = self.state.lock().unwrap();
        let (state, wait_res) = self
            .cond
            .wait_timeout_while(state, timeout, |state| *state != SessionState::Closed)
            .unwrap();
        !wait_res.timed_out() || *state == SessionState::Closed
    }
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}

/// The registry's view of one live session: just enough to enumerate
/// it and to reach in and shut it down. The per byte data flow never
/// goes through here.
pub struct SessionHandle {
    pub id: u64,
    pub peer: net::SocketAddr,
    pub pty: Arc<PtySession>,
    /// A clone of the connection used only for shutdown, never for
    /// relay traffic.
    pub stream: TcpStream,
    pub state: StateCell,
}

impl SessionHandle {
    /// Kick off teardown from outside the relay: terminate the viewer
    /// and shut the socket down so both pumps unblock. Safe to call
    /// any number of times.
    pub fn begin_shutdown(&self) {
        self.state.advance(SessionState::Closing);
        self.pty.terminate();
        if let Err(e) = self.stream.shutdown(net::Shutdown::Both) {
            if e.kind() != std::io::ErrorKind::NotConnected {
                warn!("session {}: shutting down stream: {}", self.id, e);
            }
        }
    }
}

/// Process-wide table of active sessions, used only for inventory and
/// broadcast shutdown. The lock is held for O(1) map operations only,
/// never across I/O.
pub struct Registry {
    sessions: Mutex<HashMap<u64, Arc<SessionHandle>>>,
}

impl Registry {
    pub fn new() -> Self {
        Registry { sessions: Mutex::new(HashMap::new()) }
    }

    pub fn insert(&self, handle: Arc<SessionHandle>) {
        let mut sessions = self.sessions.lock().unwrap();
        sessions.insert(handle.id, handle);
    }

    pub fn remove(&self, id: u64) {
        let mut sessions = self.sessions.lock().unwrap();
        sessions.remove(&id);
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot the live handles so callers can do slow work without
    /// holding the table lock.
    pub fn handles(&self) -> Vec<Arc<SessionHandle>> {
        let sessions = self.sessions.lock().unwrap();
        sessions.values().map(Arc::clone).collect()
    }

    /// Broadcast terminate to every session and wait, bounded, for
    /// each to finish closing. A session that fails to close within
    /// the bound is logged and skipped so one wedged viewer cannot
    /// block overall shutdown.
    pub fn shutdown(&self, per_session_wait: time::Duration) {
        let handles = self.handles();
        info!("shutting down {} active sessions", handles.len());

        for handle in handles.iter() {
            handle.begin_shutdown();
        }

        for handle in handles.iter() {
            if !handle.state.wait_closed(per_session_wait) {
                warn!("session {} did not close within shutdown bound, moving on", handle.id);
            }
        }
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
