//! Scripted in-memory provider for queue and dispatcher tests.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use crate::ai_queue::error::ProviderError;
use crate::ai_queue::provider::{ProviderClient, ProviderReply};
use crate::ai_queue::types::Usage;

#[derive(Debug, Clone)]
pub enum Step {
    Reply(String),
    Fail(ProviderError),
    /// Sleep, then reply.
    Delay(Duration, String),
}

/// Plays back `steps` in order; once they run out `fallback` repeats.
pub struct ScriptedProvider {
    name: String,
    steps: Mutex<VecDeque<Step>>,
    fallback: Step,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedProvider {
    pub fn new(name: &str, steps: Vec<Step>) -> Self {
        Self {
            name: name.to_string(),
            steps: Mutex::new(steps.into()),
            fallback: Step::Reply(format!("{name} default reply")),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn always(name: &str, step: Step) -> Self {
        Self {
            fallback: step,
            ..Self::new(name, Vec::new())
        }
    }

    pub fn calls(&self) -> usize {
        self.prompts.lock().len()
    }

    /// Prompts in the order calls started.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().clone()
    }
}

#[async_trait]
impl ProviderClient for ScriptedProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn call(
        &self,
        prompt: &str,
        _context: &Value,
        _timeout: Duration,
    ) -> Result<ProviderReply, ProviderError> {
        self.prompts.lock().push(prompt.to_string());
        let step = self
            .steps
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());

        let content = match step {
            Step::Reply(content) => content,
            Step::Fail(err) => return Err(err),
            Step::Delay(wait, content) => {
                tokio::time::sleep(wait).await;
                content
            }
        };
        Ok(ProviderReply {
            content,
            model: format!("{}-model", self.name),
            usage: Usage {
                input_tokens: prompt.len() as u32,
                output_tokens: 16,
                cost_usd: 0.0,
            },
        })
    }
}
