//! Engine backend that drives a bundled `llama-cli` binary.
//!
//! Each prompt runs one `llama-cli` process over the full rendered
//! conversation, so the "context" here is the model path plus limits and the
//! session history lives in Rust.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info};

use super::engine::{ChatSession, ExecutionContext, InferenceEngine, LoadedModel, SamplingParams};
use crate::error::EngineError;

const CONTEXT_SIZE: u32 = 4096;
const GPU_LAYERS: u32 = 99;

pub struct LlamaCliEngine {
    binary: PathBuf,
}

impl LlamaCliEngine {
    pub fn new(binary: PathBuf) -> Self {
        Self { binary }
    }

    /// Find `llama-cli`, preferring `explicit`, then the app bundle and dev layouts.
    pub fn locate(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            if path.exists() {
                return Ok(Self::new(path.to_path_buf()));
            }
            anyhow::bail!("llama-cli binary not found at {:?}", path);
        }

        let exe_dir = std::env::current_exe()?
            .parent()
            .ok_or_else(|| anyhow::anyhow!("Failed to get parent directory"))?
            .to_path_buf();

        let possible_paths = vec![
            // macOS app bundle
            exe_dir.join("../Resources/llama-cli"),
            // Next to the executable (Windows/Linux installs)
            exe_dir.join("llama-cli"),
            // Dev: target/<profile>/ -> resources/
            exe_dir.join("../../resources/llama-cli"),
        ];

        let binary = possible_paths
            .iter()
            .find(|path| path.exists())
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "llama-cli binary not found. Tried:\n{}",
                    possible_paths
                        .iter()
                        .map(|p| format!("  - {:?}", p))
                        .collect::<Vec<_>>()
                        .join("\n")
                )
            })?
            .clone();

        info!("Found llama-cli at: {:?}", binary);
        Ok(Self::new(binary))
    }
}

#[async_trait]
impl InferenceEngine for LlamaCliEngine {
    async fn load_model(&self, path: &Path) -> Result<Box<dyn LoadedModel>, EngineError> {
        let metadata = tokio::fs::metadata(path)
            .await
            .with_context(|| format!("Cannot read model file {:?}", path))?;
        if !metadata.is_file() || metadata.len() == 0 {
            return Err(EngineError(format!("{:?} is not a model file", path)));
        }

        Ok(Box::new(LlamaCliModel {
            binary: self.binary.clone(),
            model_path: path.to_path_buf(),
            template: PromptTemplate::for_model(path),
        }))
    }
}

struct LlamaCliModel {
    binary: PathBuf,
    model_path: PathBuf,
    template: PromptTemplate,
}

#[async_trait]
impl LoadedModel for LlamaCliModel {
    async fn create_context(&self) -> Result<Box<dyn ExecutionContext>, EngineError> {
        Ok(Box::new(LlamaCliContext {
            binary: self.binary.clone(),
            model_path: self.model_path.clone(),
            template: self.template,
            context_size: CONTEXT_SIZE,
        }))
    }
}

struct LlamaCliContext {
    binary: PathBuf,
    model_path: PathBuf,
    template: PromptTemplate,
    context_size: u32,
}

impl ExecutionContext for LlamaCliContext {
    fn create_session(&self) -> Result<Box<dyn ChatSession>, EngineError> {
        Ok(Box::new(LlamaCliSession {
            binary: self.binary.clone(),
            model_path: self.model_path.clone(),
            template: self.template,
            context_size: self.context_size,
            history: Vec::new(),
        }))
    }
}

struct Turn {
    user: String,
    assistant: String,
}

struct LlamaCliSession {
    binary: PathBuf,
    model_path: PathBuf,
    template: PromptTemplate,
    context_size: u32,
    history: Vec<Turn>,
}

#[async_trait]
impl ChatSession for LlamaCliSession {
    async fn prompt(
        &mut self,
        system_prompt: &str,
        text: &str,
        params: &SamplingParams,
    ) -> Result<String, EngineError> {
        let prompt = self.template.render(system_prompt, &self.history, text);
        let reply = self.generate(&prompt, params).await?;
        self.history.push(Turn {
            user: text.to_string(),
            assistant: reply.clone(),
        });
        Ok(reply)
    }
}

impl LlamaCliSession {
    async fn generate(&self, prompt: &str, params: &SamplingParams) -> Result<String> {
        debug!("Running llama.cpp with model: {:?}", self.model_path);

        let output = Command::new(&self.binary)
            .arg("-m")
            .arg(&self.model_path)
            .arg("-p")
            .arg(prompt)
            .arg("-n")
            .arg(params.max_tokens.to_string())
            .arg("--temp")
            .arg(params.temperature.to_string())
            .arg("--top-p")
            .arg(params.top_p.to_string())
            .arg("-c")
            .arg(self.context_size.to_string())
            .arg("-ngl")
            .arg(GPU_LAYERS.to_string())
            .arg("--no-display-prompt")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .context("Failed to execute llama-cli")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("llama-cli failed: {}", stderr);
        }

        let cleaned = clean_output(&String::from_utf8_lossy(&output.stdout), self.template);
        debug!("Generated {} characters", cleaned.len());
        Ok(cleaned)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PromptTemplate {
    ChatMl,
    /// Gemma has no system role; the system prompt is folded into the first user turn.
    Gemma,
}

impl PromptTemplate {
    fn for_model(path: &Path) -> Self {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        if name.contains("gemma") {
            PromptTemplate::Gemma
        } else {
            PromptTemplate::ChatMl
        }
    }

    fn render(&self, system_prompt: &str, history: &[Turn], text: &str) -> String {
        let mut out = String::new();
        match self {
            PromptTemplate::ChatMl => {
                if !system_prompt.is_empty() {
                    out.push_str(&format!("<|im_start|>system\n{}<|im_end|>\n", system_prompt));
                }
                for turn in history {
                    out.push_str(&format!("<|im_start|>user\n{}<|im_end|>\n", turn.user));
                    out.push_str(&format!(
                        "<|im_start|>assistant\n{}<|im_end|>\n",
                        turn.assistant
                    ));
                }
                out.push_str(&format!("<|im_start|>user\n{}<|im_end|>\n", text));
                out.push_str("<|im_start|>assistant\n");
            }
            PromptTemplate::Gemma => {
                let mut first = true;
                let mut user_turn = |out: &mut String, content: &str| {
                    if first && !system_prompt.is_empty() {
                        out.push_str(&format!(
                            "<start_of_turn>user\n{}\n\n{}<end_of_turn>\n",
                            system_prompt, content
                        ));
                    } else {
                        out.push_str(&format!("<start_of_turn>user\n{}<end_of_turn>\n", content));
                    }
                    first = false;
                };
                for turn in history {
                    user_turn(&mut out, &turn.user);
                    out.push_str(&format!(
                        "<start_of_turn>model\n{}<end_of_turn>\n",
                        turn.assistant
                    ));
                }
                user_turn(&mut out, text);
                out.push_str("<start_of_turn>model\n");
            }
        }
        out
    }

    fn stop_markers(&self) -> &'static [&'static str] {
        match self {
            PromptTemplate::ChatMl => &["<|im_end|>", "[end of text]"],
            PromptTemplate::Gemma => &["<end_of_turn>", "[end of text]"],
        }
    }
}

/// Drop llama.cpp log lines and anything after the end-of-turn marker.
fn clean_output(raw: &str, template: PromptTemplate) -> String {
    let mut text = raw
        .trim()
        .lines()
        .filter(|line| !line.starts_with("llama") && !line.starts_with("ggml"))
        .collect::<Vec<_>>()
        .join("\n");

    for marker in template.stop_markers() {
        if let Some(idx) = text.find(marker) {
            text.truncate(idx);
        }
    }

    text.trim().to_string()
}
