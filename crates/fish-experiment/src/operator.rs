//! Non-interactive operator ports.
//!
//! [`ScriptedOperator`] answers prompts from a queue and records everything
//! it was shown. Unattended runs use it with an empty queue, where every
//! confirmation passes and every question gets the default answer.

use anyhow::Result;
use async_trait::async_trait;
use fish_core::operator::OperatorPort;
use parking_lot::Mutex;
use std::collections::VecDeque;
use tracing::info;

/// Operator answering from a script.
#[derive(Debug, Default)]
pub struct ScriptedOperator {
    answers: Mutex<VecDeque<String>>,
    default_answer: String,
    prompts: Mutex<Vec<String>>,
    notices: Mutex<Vec<String>>,
}

impl ScriptedOperator {
    /// Operator that confirms everything and answers questions with `""`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Operator answering questions with `answers` in order, then `""`.
    pub fn with_answers<I, S>(answers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            answers: Mutex::new(answers.into_iter().map(Into::into).collect()),
            ..Self::default()
        }
    }

    /// Answer used once the script is exhausted.
    pub fn with_default_answer(mut self, answer: impl Into<String>) -> Self {
        self.default_answer = answer.into();
        self
    }

    /// Every prompt shown through `confirm` or `ask`.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().clone()
    }

    /// Every notification.
    pub fn notices(&self) -> Vec<String> {
        self.notices.lock().clone()
    }
}

#[async_trait]
impl OperatorPort for ScriptedOperator {
    async fn confirm(&self, prompt: &str) -> Result<()> {
        info!(prompt, "Confirmed without operator");
        self.prompts.lock().push(prompt.to_string());
        Ok(())
    }

    async fn ask(&self, prompt: &str) -> Result<String> {
        self.prompts.lock().push(prompt.to_string());
        let answer = self
            .answers
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.default_answer.clone());
        info!(prompt, answer, "Answered without operator");
        Ok(answer)
    }

    fn notify(&self, message: &str) {
        info!(message, "Operator notice");
        self.notices.lock().push(message.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn answers_in_order_then_default() {
        let operator = ScriptedOperator::with_answers(["again", "no"]).with_default_answer("skip");
        assert_eq!(operator.ask("retry?").await.unwrap(), "again");
        assert_eq!(operator.ask("retry?").await.unwrap(), "no");
        assert_eq!(operator.ask("retry?").await.unwrap(), "skip");
        operator.confirm("ok?").await.unwrap();
        operator.notify("done");
        assert_eq!(operator.prompts().len(), 4);
        assert_eq!(operator.notices(), vec!["done"]);
    }
}
