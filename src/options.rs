// Copyright 2025 STARGA Inc.
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at:
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

// Part of the MIND project (Machine Intelligence Native Design).

//! Engine tunables, loaded from the embedding server's TOML config with
//! environment-variable overrides for deploy-time tweaks.

use serde::Deserialize;
use thiserror::Error;
use tracing::warn;

pub const DEFAULT_MAX_FAILURES: u32 = 4;
pub const DEFAULT_GPU_MAX_STREAMS: usize = 128;
pub const DEFAULT_STREAMS_PER_TASK: usize = 1;

#[derive(Debug, Error)]
pub enum OptionsError {
    #[error("invalid engine options: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Tunables for the operator-execution engine.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineOptions {
    /// OOM retries after which the empirical estimate stops shrinking.
    pub max_failures: u32,
    /// Size of each GPU's logical compute-stream pool.
    pub gpu_max_streams: usize,
    /// Streams a per-task GPU view pins at creation.
    pub streams_per_task: usize,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            max_failures: DEFAULT_MAX_FAILURES,
            gpu_max_streams: DEFAULT_GPU_MAX_STREAMS,
            streams_per_task: DEFAULT_STREAMS_PER_TASK,
        }
    }
}

impl EngineOptions {
    pub fn from_toml(text: &str) -> Result<Self, OptionsError> {
        Ok(toml::from_str(text)?)
    }

    /// Applies `MIND_EXEC_*` environment overrides on top of `self`.
    /// Unparsable values are ignored with a warning.
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(v) = env_parse::<u32>("MIND_EXEC_MAX_FAILURES") {
            self.max_failures = v;
        }
        if let Some(v) = env_parse::<usize>("MIND_EXEC_GPU_MAX_STREAMS") {
            self.gpu_max_streams = v;
        }
        if let Some(v) = env_parse::<usize>("MIND_EXEC_STREAMS_PER_TASK") {
            self.streams_per_task = v;
        }
        self
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(key, value = %raw, "ignoring unparsable engine option override");
            None
        }
    }
}
