//! Canned command runner for tests in this workspace

use crate::cmd::{CmdOutput, CommandRunner};
use crate::error::Result;
use async_trait::async_trait;
use std::sync::Mutex;

/// Runner that records every command and answers from a table of canned
/// responses
#[derive(Debug, Default)]
pub struct RecordingRunner {
    responses: Vec<(String, CmdOutput)>,
    history: Mutex<Vec<String>>,
}

impl RecordingRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer any command containing `needle` with `output`.
    /// The first matching entry wins.
    pub fn respond(mut self, needle: impl Into<String>, output: CmdOutput) -> Self {
        self.responses.push((needle.into(), output));
        self
    }

    /// Every command run so far, in order
    pub fn history(&self) -> Vec<String> {
        self.history
            .lock()
            .map(|h| h.clone())
            .unwrap_or_default()
    }

    /// Commands containing `needle`
    pub fn matching(&self, needle: &str) -> Vec<String> {
        self.history()
            .into_iter()
            .filter(|c| c.contains(needle))
            .collect()
    }
}

#[async_trait]
impl CommandRunner for RecordingRunner {
    async fn run_with(&self, command: &str, capture: bool) -> Result<CmdOutput> {
        if let Ok(mut history) = self.history.lock() {
            history.push(command.to_string());
        }
        let output = self
            .responses
            .iter()
            .find(|(needle, _)| command.contains(needle.as_str()))
            .map(|(_, output)| output.clone())
            .unwrap_or_default();

        if capture {
            Ok(output)
        } else {
            Ok(CmdOutput {
                code: output.code,
                ..Default::default()
            })
        }
    }
}
