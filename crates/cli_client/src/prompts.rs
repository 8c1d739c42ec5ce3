//! Interactive terminal prompts

use async_trait::async_trait;
use dialoguer::{theme::ColorfulTheme, Confirm, Input, Password, Select};
use impcloud_core::Prompter;

/// Prompter backed by dialoguer on the controlling terminal
///
/// Each prompt blocks a worker thread, never the runtime. Escape, a closed
/// terminal or an empty answer all count as the user declining.
#[derive(Debug, Default, Clone, Copy)]
pub struct TerminalPrompter;

impl TerminalPrompter {
    pub fn new() -> Self {
        Self
    }
}

async fn blocking<T, F>(prompt: F) -> Option<T>
where
    F: FnOnce() -> dialoguer::Result<Option<T>> + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(prompt).await {
        Ok(Ok(answer)) => answer,
        Ok(Err(e)) => {
            tracing::debug!("Prompt aborted: {}", e);
            None
        }
        Err(e) => {
            tracing::warn!("Prompt task failed: {}", e);
            None
        }
    }
}

#[async_trait]
impl Prompter for TerminalPrompter {
    async fn confirm(&self, message: &str) -> bool {
        let message = message.to_string();
        blocking(move || {
            Confirm::with_theme(&ColorfulTheme::default())
                .with_prompt(message)
                .default(true)
                .interact_opt()
        })
        .await
        .unwrap_or(false)
    }

    async fn input(&self, prompt: &str, default: Option<&str>) -> Option<String> {
        let prompt = prompt.to_string();
        let default = default.map(str::to_string);
        blocking(move || {
            let theme = ColorfulTheme::default();
            let mut input = Input::<String>::with_theme(&theme)
                .with_prompt(prompt)
                .allow_empty(true);
            if let Some(default) = default {
                input = input.default(default);
            }
            let value = input.interact_text()?;
            let value = value.trim().to_string();
            Ok((!value.is_empty()).then_some(value))
        })
        .await
    }

    async fn secret(&self, prompt: &str) -> Option<String> {
        let prompt = prompt.to_string();
        blocking(move || {
            let value = Password::with_theme(&ColorfulTheme::default())
                .with_prompt(prompt)
                .allow_empty_password(true)
                .interact()?;
            Ok((!value.is_empty()).then_some(value))
        })
        .await
    }

    async fn pick(&self, title: &str, items: &[String]) -> Option<usize> {
        if items.is_empty() {
            return None;
        }
        let title = title.to_string();
        let items = items.to_vec();
        blocking(move || {
            Select::with_theme(&ColorfulTheme::default())
                .with_prompt(title)
                .items(&items)
                .default(0)
                .interact_opt()
        })
        .await
    }
}
