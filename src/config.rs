use clap::{Parser, ValueEnum};
use std::path::PathBuf;

use crate::conversation::ErrorDisplay;

pub const DEFAULT_MODEL: &str = "gemini-2.5-flash";
pub const DEFAULT_TEMPERATURE: f32 = 0.7;
pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";
pub const DEFAULT_PREVIEW_LISTEN: &str = "127.0.0.1:3000";

/// Shown on an assistant turn whose stream failed.
pub const CONNECTION_ERROR_TEXT: &str = "ошибка соединения...";

pub const SYSTEM_INSTRUCTION: &str = r#"You are "кодъ" (Code), a minimalist, aesthetic coding companion.
Your goal is to help the user write code while maintaining a calm, focused "vibe".

Guidelines:
- Keep responses concise and clean.
- Use lowercase where appropriate for aesthetic, but maintain proper code syntax.
- Focus on modern best practices (React, TS, Tailwind).
- If the user asks to create a UI, website, or component, provide a SINGLE HTML file code block.
- Include Tailwind CSS via CDN in the HTML: <script src="https://cdn.tailwindcss.com"></script>
- If React is needed, use the unpkg/CDN links with Babel standalone within the single HTML file.
- Tone: Zen, helpful, slightly mysterious but practical.
- Language: Russian (unless user speaks English)."#;

#[derive(Debug, Parser)]
#[command(name = "kod", version, about = "A calm terminal companion for vibe coding")]
pub struct Cli {
    /// API key for the Gemini API. Falls back to API_KEY when unset.
    #[arg(long, env = "GEMINI_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    #[arg(long, env = "KOD_MODEL", default_value = DEFAULT_MODEL)]
    pub model: String,

    #[arg(long, env = "KOD_TEMPERATURE", default_value_t = DEFAULT_TEMPERATURE)]
    pub temperature: f32,

    /// Replace the built-in system instruction with the contents of this file.
    #[arg(long)]
    pub system_instruction: Option<PathBuf>,

    #[arg(long, env = "KOD_BASE_URL", default_value = DEFAULT_BASE_URL)]
    pub base_url: String,

    /// Address for the local preview server.
    #[arg(long, env = "KOD_PREVIEW_LISTEN", default_value = DEFAULT_PREVIEW_LISTEN)]
    pub preview_listen: String,

    #[arg(long)]
    pub no_preview: bool,

    /// What a failed reply shows.
    #[arg(long, value_enum, default_value_t = OnError::Keep)]
    pub on_error: OnError,

    /// Where tracing output goes. Defaults to kod.log in the temp directory.
    #[arg(long, env = "KOD_LOG_FILE")]
    pub log_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OnError {
    /// Keep the partial reply and append an error marker.
    Keep,
    /// Replace the reply with the error marker.
    Replace,
}

impl OnError {
    pub fn display(self) -> ErrorDisplay {
        match self {
            OnError::Keep => ErrorDisplay::KeepPartial {
                marker: CONNECTION_ERROR_TEXT.to_string(),
            },
            OnError::Replace => ErrorDisplay::Replace {
                text: CONNECTION_ERROR_TEXT.to_string(),
            },
        }
    }
}

impl Cli {
    pub fn resolve_api_key(&self) -> String {
        self.api_key
            .clone()
            .or_else(|| std::env::var("API_KEY").ok())
            .unwrap_or_default()
    }

    pub fn log_path(&self) -> PathBuf {
        self.log_file
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("kod.log"))
    }

    pub fn chat_config(&self) -> std::io::Result<ChatConfig> {
        let system_instruction = match &self.system_instruction {
            Some(path) => std::fs::read_to_string(path)?,
            None => SYSTEM_INSTRUCTION.to_string(),
        };

        Ok(ChatConfig {
            model: self.model.clone(),
            system_instruction,
            temperature: self.temperature,
        })
    }
}

/// Static configuration every session is created with.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatConfig {
    pub model: String,
    pub system_instruction: String,
    pub temperature: f32,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            system_instruction: SYSTEM_INSTRUCTION.to_string(),
            temperature: DEFAULT_TEMPERATURE,
        }
    }
}
