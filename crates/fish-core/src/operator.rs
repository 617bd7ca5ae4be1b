//! Operator acknowledgment port.
//!
//! The engine blocks on the operator in three places: a flow tolerance
//! breach, a manual `wait` step, and the retry prompt after a failed
//! acquisition. None of these prompts has a timeout. Whatever front-end is
//! attached implements this trait. The engine never talks to a terminal
//! directly.

use anyhow::Result;
use async_trait::async_trait;

/// Blocking prompts and short notifications addressed to the operator.
#[async_trait]
pub trait OperatorPort: Send + Sync {
    /// Show `prompt` and wait until the operator acknowledges it.
    async fn confirm(&self, prompt: &str) -> Result<()>;

    /// Show `prompt` and return the operator's free-text answer.
    async fn ask(&self, prompt: &str) -> Result<String>;

    /// Short status or error line for the operator view.
    fn notify(&self, message: &str);
}
