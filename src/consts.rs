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

use std::time;

pub const BUF_SIZE: usize = 1024 * 16;

pub const JOIN_POLL_DURATION: time::Duration = time::Duration::from_millis(100);
pub const JOIN_HANGUP_DURATION: time::Duration = time::Duration::from_millis(300);

// How long the pty->conn pump parks in poll(2) before rechecking
// the stop flag.
pub const PTY_POLL_MS: u16 = 100;

// Grace between SIGTERM and SIGKILL when tearing a session down.
pub const DEFAULT_GRACE_PERIOD: time::Duration = time::Duration::from_secs(3);

// How long listener shutdown waits for any one session to finish
// closing before moving on. A single wedged viewer must not block
// overall shutdown.
pub const SHUTDOWN_SESSION_WAIT: time::Duration = time::Duration::from_secs(2);

pub const DEFAULT_HOST: &str = "127.0.0.1";

// The viewer binary we spawn when no command is configured.
pub const DEFAULT_COMMAND: &str = "delta-vision";

pub const STDIN_FD: i32 = 0;
pub const STDERR_FD: i32 = 2;

// Set in every spawned viewer so it knows it is running as a server
// child rather than a directly launched instance.
pub const SERVER_CHILD_VAR: &str = "DELTA_SERVER_CHILD";

// Mode selection variables that must never leak into a spawned viewer,
// otherwise the child would try to re-enter client or server mode
// instead of presenting the review UI.
pub const MODE_VARS: [&str; 3] = ["DELTA_MODE", "DELTA_SERVER", "DELTA_CLIENT"];
