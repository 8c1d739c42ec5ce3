//! User prompts needed by remediation steps
//!
//! Prompts may wait indefinitely. `None` / `false` always means the user
//! explicitly declined, which the chain treats as cancellation, not failure.

use async_trait::async_trait;

#[async_trait]
pub trait Prompter: Send + Sync {
    /// Yes/no question
    async fn confirm(&self, message: &str) -> bool;

    /// Free text input
    async fn input(&self, prompt: &str, default: Option<&str>) -> Option<String>;

    /// Hidden input (passwords)
    async fn secret(&self, prompt: &str) -> Option<String>;

    /// Choose one of `items`; returns its index
    async fn pick(&self, title: &str, items: &[String]) -> Option<usize>;
}
