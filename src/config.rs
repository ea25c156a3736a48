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

use std::{collections::HashMap, fs, time};

use anyhow::Context;
use serde_derive::Deserialize;

use crate::consts;

#[derive(Deserialize, Default, Debug, Clone)]
pub struct Config {
    /// The command to run for each session. This is the external
    /// collaborator contract: whatever we spawn is expected to behave
    /// as an interactive terminal application. `delta-vision` by
    /// default, split with shell-words so arguments can be given
    /// inline.
    pub command: Option<String>,

    /// a table of environment variables to inject into the
    /// spawned viewer, on top of the server's own environment.
    /// This is how DELTA_NEW, DELTA_OLD and DELTA_KEYWORDS
    /// reach the child.
    pub env: Option<HashMap<String, String>>,

    /// How long, in milliseconds, to wait after a SIGTERM before
    /// resorting to SIGKILL when tearing a session down.
    pub grace_period_ms: Option<u64>,
}

impl Config {
    pub fn command_line(&self) -> anyhow::Result<Vec<String>> {
        let raw = self.command.as_deref().unwrap_or(consts::DEFAULT_COMMAND);
        let parts = shell_words::split(raw).context("parsing session command")?;
        if parts.is_empty() {
            return Err(anyhow::anyhow!("session command is empty"));
        }
        Ok(parts)
    }

    pub fn grace_period(&self) -> time::Duration {
        self.grace_period_ms
            .map(time::Duration::from_millis)
            .unwrap_or(consts::DEFAULT_GRACE_PERIOD)
    }
}

pub fn read_config(config_file: &Option<String>) -> anyhow::Result<Config> {
    match config_file {
        Some(path) => {
            let config_str = fs::read_to_string(path).context("reading config toml")?;
            toml::from_str(&config_str).context("parsing config file")
        }
        None => Ok(Config::default()),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults_when_unset() {
        let config = Config::default();
        assert_eq!(config.command_line().unwrap(), vec![String::from("delta-vision")]);
        assert_eq!(config.grace_period(), consts::DEFAULT_GRACE_PERIOD);
    }

    #[test]
    fn parses_full_config() {
        let config: Config = toml::from_str(
            r#"
            command = "sh -c 'echo hi'"
            grace_period_ms = 1500

            [env]
            DELTA_NEW = "/tmp/new"
            DELTA_OLD = "/tmp/old"
            "#,
        )
        .expect("config to parse");

        assert_eq!(
            config.command_line().unwrap(),
            vec![String::from("sh"), String::from("-c"), String::from("echo hi")]
        );
        assert_eq!(config.grace_period(), time::Duration::from_millis(1500));
        let env = config.env.expect("env table");
        assert_eq!(env.get("DELTA_NEW").map(String::as_str), Some("/tmp/new"));
    }

    #[test]
    fn empty_command_is_an_error() {
        let config = Config { command: Some(String::from("   ")), ..Config::default() };
        assert!(config.command_line().is_err());
    }
}
