//! Operator port on the terminal.

use anyhow::{Context, Result};
use async_trait::async_trait;
use fish_core::operator::OperatorPort;
use tokio::io::{AsyncBufReadExt, BufReader, Stdin};
use tokio::sync::Mutex;

/// Prompts on stdout, answers from stdin.
pub struct ConsoleOperator {
    input: Mutex<BufReader<Stdin>>,
}

impl ConsoleOperator {
    /// Operator reading from the process stdin.
    pub fn new() -> Self {
        Self {
            input: Mutex::new(BufReader::new(tokio::io::stdin())),
        }
    }

    async fn read_line(&self) -> Result<String> {
        let mut line = String::new();
        let read = self
            .input
            .lock()
            .await
            .read_line(&mut line)
            .await
            .context("Failed to read operator input")?;
        if read == 0 {
            anyhow::bail!("Operator input closed");
        }
        Ok(line.trim_end_matches(['\r', '\n']).to_string())
    }
}

#[async_trait]
impl OperatorPort for ConsoleOperator {
    async fn confirm(&self, prompt: &str) -> Result<()> {
        println!("{}", prompt);
        println!("Press Enter to continue...");
        self.read_line().await?;
        Ok(())
    }

    async fn ask(&self, prompt: &str) -> Result<String> {
        println!("{}", prompt);
        self.read_line().await
    }

    fn notify(&self, message: &str) {
        println!(">> {}", message);
    }
}

impl Default for ConsoleOperator {
    fn default() -> Self {
        Self::new()
    }
}
