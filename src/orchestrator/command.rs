//! Agent command line and launch script construction.
//!
//! Scripts are plain text with every path baked in as a quoted literal, so a
//! script never changes after it is built and two scripts share nothing.

use crate::types::TaskFlags;

/// Flag -> command tokens, in emission order.
fn flag_tokens(flags: &TaskFlags) -> Vec<&'static str> {
    let table: [(bool, &[&'static str]); 5] = [
        (flags.skip_permissions, &["--dangerously-skip-permissions"]),
        (flags.plan_only, &["--permission-mode", "plan"]),
        (flags.remote_session, &["--remote-session"]),
        (flags.spawn_team, &["--spawn-team"]),
        (flags.use_tool_bus, &["--tool-bus"]),
    ];
    table
        .into_iter()
        .filter(|(enabled, _)| *enabled)
        .flat_map(|(_, tokens)| tokens.iter().copied())
        .collect()
}

const HEADLESS_TOKENS: &[&str] = &["-p", "--output-format", "stream-json", "--verbose"];

/// Shell dialect of a launch script.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptFlavor {
    Bash,
    PowerShell,
}

impl ScriptFlavor {
    /// Dialect of the host platform.
    pub fn native() -> Self {
        if cfg!(windows) {
            ScriptFlavor::PowerShell
        } else {
            ScriptFlavor::Bash
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            ScriptFlavor::Bash => "sh",
            ScriptFlavor::PowerShell => "ps1",
        }
    }

    /// Quote `value` as a literal that expands to nothing else.
    pub fn quote(&self, value: &str) -> String {
        match self {
            ScriptFlavor::Bash => format!("'{}'", value.replace('\'', r#"'\''"#)),
            ScriptFlavor::PowerShell => format!("'{}'", value.replace('\'', "''")),
        }
    }
}

/// Build the agent command line for a task's flags.
pub fn build_invocation_command(command: &str, model: Option<&str>, flags: &TaskFlags) -> String {
    let mut tokens: Vec<String> = vec![command.trim().to_string()];

    if flags.headless {
        tokens.extend(HEADLESS_TOKENS.iter().map(|t| t.to_string()));
    }

    if let Some(model) = model.map(str::trim).filter(|m| !m.is_empty()) {
        tokens.push("--model".to_string());
        tokens.push(quote_if_needed(model));
    }

    tokens.extend(flag_tokens(flags).into_iter().map(String::from));

    tokens.join(" ")
}

fn quote_if_needed(value: &str) -> String {
    let plain = value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':' | '/' | '[' | ']'));
    if plain {
        value.to_string()
    } else {
        // Single quotes are literal in both dialects
        format!("'{}'", value.replace('\'', ""))
    }
}

/// Launch script for the host platform.
pub fn build_process_launch_script(
    project_path: &str,
    prompt_file_path: &str,
    invocation_command: &str,
) -> String {
    build_process_launch_script_for(
        ScriptFlavor::native(),
        project_path,
        prompt_file_path,
        invocation_command,
    )
}

/// Script that enters the project directory and pipes the prompt file into
/// the agent command. The exit status of the agent is the script's status.
pub fn build_process_launch_script_for(
    flavor: ScriptFlavor,
    project_path: &str,
    prompt_file_path: &str,
    invocation_command: &str,
) -> String {
    let prompt = flavor.quote(prompt_file_path);
    let mut script = String::new();

    match flavor {
        ScriptFlavor::Bash => {
            script.push_str("#!/usr/bin/env bash\n");
            if !project_path.is_empty() {
                script.push_str(&format!("cd {} || exit 1\n", flavor.quote(project_path)));
            }
            script.push_str(&format!("cat {} | {}\n", prompt, invocation_command));
        }
        ScriptFlavor::PowerShell => {
            script.push_str("$ErrorActionPreference = 'Stop'\n");
            if !project_path.is_empty() {
                script.push_str(&format!(
                    "Set-Location -LiteralPath {}\n",
                    flavor.quote(project_path)
                ));
            }
            script.push_str(&format!(
                "Get-Content -Raw -LiteralPath {} | {}\n",
                prompt, invocation_command
            ));
            script.push_str("exit $LASTEXITCODE\n");
        }
    }

    script
}
