use std::path::{Path, PathBuf};

use serde_json::Value;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PromptInvocation<'a> {
    pub chat_id: &'a str,
    pub prompt: &'a str,
    pub model: Option<&'a str>,
    pub trust: bool,
    pub force: bool,
}

impl PromptInvocation<'_> {
    pub fn args(&self) -> Vec<String> {
        let mut args: Vec<String> = [
            "--print",
            "--output-format",
            "stream-json",
            "--stream-partial-output",
            "--resume",
        ]
        .into_iter()
        .map(str::to_string)
        .collect();
        args.push(self.chat_id.to_string());
        if let Some(model) = self.model.filter(|model| !model.is_empty()) {
            args.push("--model".to_string());
            args.push(model.to_string());
        }
        if self.trust {
            args.push("--trust".to_string());
        }
        if self.force {
            args.push("--force".to_string());
        }
        args.push("--".to_string());
        args.push(self.prompt.to_string());
        args
    }
}

/// Interprets the output of `<bin> status`. `Err` carries the text to surface.
pub fn check_status_output(success: bool, stdout: &str, stderr: &str) -> Result<(), String> {
    let combined = format!("{stdout}\n{stderr}");
    if !success || combined.to_lowercase().contains("not logged in") {
        let message = combined.trim();
        return Err(if message.is_empty() {
            "status check failed".to_string()
        } else {
            message.to_string()
        });
    }
    Ok(())
}

/// The chat id is the last non-empty line `<bin> create-chat` prints.
pub fn parse_chat_id(stdout: &str) -> Option<String> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .last()
        .map(str::to_string)
}

pub fn default_cli_config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".cursor").join("cli-config.json"))
}

/// Model currently selected in the CLI config, if readable.
pub fn read_cli_model(path: &Path) -> Option<String> {
    let content = std::fs::read_to_string(path).ok()?;
    let config: Value = serde_json::from_str(&content).ok()?;
    let model = match config.get("model")? {
        Value::String(model) => model.clone(),
        Value::Object(fields) => fields.get("modelId")?.as_str()?.to_string(),
        _ => return None,
    };
    (!model.is_empty()).then_some(model)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_args_follow_flag_order() {
        let invocation = PromptInvocation {
            chat_id: "chat-9",
            prompt: "fix the build",
            model: Some("sonnet-4"),
            trust: true,
            force: true,
        };
        assert_eq!(
            invocation.args(),
            vec![
                "--print",
                "--output-format",
                "stream-json",
                "--stream-partial-output",
                "--resume",
                "chat-9",
                "--model",
                "sonnet-4",
                "--trust",
                "--force",
                "--",
                "fix the build",
            ]
        );

        let bare = PromptInvocation {
            chat_id: "chat-9",
            prompt: "hi",
            ..PromptInvocation::default()
        };
        assert_eq!(bare.args().last().map(String::as_str), Some("hi"));
        assert!(!bare.args().contains(&"--model".to_string()));
    }

    #[test]
    fn dash_prompt_stays_positional() {
        let invocation = PromptInvocation {
            chat_id: "chat-9",
            prompt: "--help",
            ..PromptInvocation::default()
        };
        let args = invocation.args();
        assert_eq!(args[args.len() - 2..].to_vec(), vec!["--", "--help"]);
        assert_eq!(args.iter().filter(|arg| *arg == "--help").count(), 1);
    }

    #[test]
    fn status_output_detects_logged_out_state() {
        assert!(check_status_output(true, "Logged in as dev@example.com", "").is_ok());
        assert_eq!(
            check_status_output(true, "Not logged in", ""),
            Err("Not logged in".to_string())
        );
        assert!(check_status_output(false, "", "").is_err());
    }

    #[test]
    fn chat_id_is_last_non_empty_line() {
        assert_eq!(
            parse_chat_id("Creating chat...\n3f2a-chat\n\n"),
            Some("3f2a-chat".to_string())
        );
        assert_eq!(parse_chat_id("  \n"), None);
    }

    #[test]
    fn cli_model_accepts_object_or_string() {
        let temp_dir = tempfile::tempdir().expect("create tempdir");
        let path = temp_dir.path().join("cli-config.json");

        std::fs::write(&path, r#"{"model":{"modelId":"sonnet-4","displayName":"Sonnet"}}"#)
            .expect("write config");
        assert_eq!(read_cli_model(&path), Some("sonnet-4".to_string()));

        std::fs::write(&path, r#"{"model":"gpt-5"}"#).expect("write config");
        assert_eq!(read_cli_model(&path), Some("gpt-5".to_string()));

        std::fs::write(&path, r#"{"editor":{}}"#).expect("write config");
        assert_eq!(read_cli_model(&path), None);
        assert_eq!(read_cli_model(&temp_dir.path().join("absent.json")), None);
    }
}
