//! `forgeline run`: one pipeline in the terminal

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use clap::Args;
use futures::StreamExt;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use forgeline_core::pipeline::{EventType, RepoSource};
use forgeline_core::{
    ConfirmationMessage, ConfirmationMode, ForgelineConfig, PipelineInput, PipelineState,
    ProgressEvent, SessionRegistry, Status,
};

#[derive(Args, Debug)]
pub struct RunArgs {
    /// What to refactor, in plain language
    #[arg(short, long)]
    prompt: String,

    /// Existing checkout to refactor in place
    #[arg(long, conflicts_with = "repo_url")]
    repo_path: Option<PathBuf>,

    /// Repository to clone into the workspace root
    #[arg(long)]
    repo_url: Option<String>,

    /// Access token for cloning and pushing --repo-url
    #[arg(long, env = "FORGELINE_GIT_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Base branch to clone
    #[arg(long)]
    branch: Option<String>,

    /// Branch to push to (default: forgeline/<session>)
    #[arg(long)]
    target_branch: Option<String>,

    /// autonomous, checkpoint-on-plan-and-push or checkpoint-on-every-stage
    #[arg(short, long, default_value = "checkpoint-on-plan-and-push")]
    mode: ConfirmationMode,

    /// Build/test command (default: detected from the checkout)
    #[arg(long)]
    build_command: Option<String>,

    /// Validation retries before giving up
    #[arg(long)]
    max_retries: Option<u32>,
}

impl RunArgs {
    fn into_input(self) -> Result<PipelineInput> {
        let repo = match (self.repo_path, self.repo_url) {
            (Some(path), None) => RepoSource::Local { path },
            (None, Some(url)) => RepoSource::Remote {
                url,
                token: self.token,
                branch: self.branch,
            },
            (None, None) => match std::env::current_dir() {
                Ok(path) => RepoSource::Local { path },
                Err(e) => bail!("no --repo-path given and the current directory is unusable: {}", e),
            },
            (Some(_), Some(_)) => bail!("--repo-path and --repo-url are mutually exclusive"),
        };

        Ok(PipelineInput {
            prompt: self.prompt,
            mode: self.mode,
            repo,
            target_branch: self.target_branch,
            build_command: self.build_command,
            max_retries: self.max_retries,
        })
    }
}

/// Run the pipeline to a terminal state. Exit code 0 only on completion.
pub async fn run(config: ForgelineConfig, args: RunArgs) -> Result<ExitCode> {
    let input = args.into_input()?;
    let registry = SessionRegistry::from_config(&config)?;
    let handle = registry.start(input).context("Failed to start session")?;

    println!("  \x1b[1;36mforgeline\x1b[0m session {}", handle.session_id);
    println!("  ─────────────────────────────────────");

    let mut events = handle.subscribe().into_stream();
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut awaiting = false;

    loop {
        tokio::select! {
            event = events.next() => {
                let Some(event) = event else { break };
                print_event(&event);
                if event.event_type == EventType::CheckpointRequired {
                    awaiting = true;
                    prompt().await;
                }
                if event.event_type == EventType::CheckpointResolved || event.is_terminal() {
                    awaiting = false;
                }
            }
            line = stdin.next_line(), if awaiting => {
                match line {
                    Ok(Some(text)) if text.trim().is_empty() => prompt().await,
                    Ok(Some(text)) => {
                        awaiting = false;
                        let message = ConfirmationMessage::freeform(&handle.session_id, text);
                        if let Err(e) = handle.confirm(message) {
                            eprintln!("  {}", e);
                        }
                    }
                    // stdin closed: nobody left to answer
                    _ => {
                        awaiting = false;
                        handle.cancel();
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                eprintln!("\n  Cancelling...");
                handle.cancel();
            }
        }
    }

    let state = handle.wait_terminal().await;
    print_summary(&state);
    Ok(if state.status == Status::Completed {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

async fn prompt() {
    let mut stdout = tokio::io::stdout();
    let _ = stdout.write_all(b"  > ").await;
    let _ = stdout.flush().await;
}

fn print_event(event: &ProgressEvent) {
    let pct = (event.progress * 100.0).round() as u32;
    match event.event_type {
        EventType::BuildOutput => println!("        | {}", event.message),
        EventType::FileChanged => println!("        + {}", event.message),
        EventType::CheckpointRequired => {
            println!("\n  [{:>3}%] \x1b[1;33m{}\x1b[0m", pct, event.message);
            if let Some(data) = &event.data {
                if let Ok(pretty) = serde_json::to_string_pretty(data) {
                    for line in pretty.lines() {
                        println!("        {}", line);
                    }
                }
            }
        }
        EventType::Failed => println!("  [{:>3}%] \x1b[1;31m{}\x1b[0m", pct, event.message),
        EventType::Completed => println!("  [{:>3}%] \x1b[1;32m{}\x1b[0m", pct, event.message),
        _ => println!("  [{:>3}%] {:<26} {}", pct, event.stage.as_str(), event.message),
    }
}

fn print_summary(state: &PipelineState) {
    println!();
    match state.status {
        Status::Completed => {
            if let Some(push) = &state.artifacts.push {
                println!(
                    "  Pushed {} to {}/{}",
                    push.commit, push.remote, push.branch
                );
            }
            if let Some(pr) = &state.artifacts.narration {
                println!("  PR title: {}", pr.title);
            }
        }
        _ => {
            let reason = state
                .error
                .as_ref()
                .map(|e| format!("{} ({})", e.message, e.kind))
                .unwrap_or_else(|| format!("{:?}", state.status));
            println!("  Session ended: {}", reason);
            if !state.applied_files.is_empty() {
                println!("  Files left as written:");
                for file in &state.applied_files {
                    println!("    {}", file);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct Harness {
        #[command(flatten)]
        args: RunArgs,
    }

    #[test]
    fn parses_remote_run() {
        let h = Harness::try_parse_from([
            "forgeline",
            "--prompt",
            "Rename UserService",
            "--repo-url",
            "https://github.com/acme/app.git",
            "--mode",
            "autonomous",
        ])
        .unwrap();
        let input = h.args.into_input().unwrap();
        assert_eq!(input.mode, ConfirmationMode::Autonomous);
        assert!(matches!(input.repo, RepoSource::Remote { .. }));
    }

    #[test]
    fn rejects_both_repo_sources_and_bad_mode() {
        assert!(Harness::try_parse_from([
            "forgeline", "--prompt", "x", "--repo-path", "/tmp", "--repo-url", "https://e.com/r.git",
        ])
        .is_err());
        assert!(Harness::try_parse_from(["forgeline", "--prompt", "x", "--mode", "yolo"]).is_err());
    }
}
