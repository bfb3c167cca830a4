//! `forgeline serve`: HTTP/SSE server

use anyhow::Result;

use forgeline_core::ForgelineConfig;

/// Run the serve command.
pub async fn run(mut config: ForgelineConfig, port: Option<u16>) -> Result<()> {
    if let Some(port) = port {
        config.server.port = port;
    }

    print_banner(&config);
    forgeline_server::start_server(config).await?;
    println!("\n  Shutting down...");
    Ok(())
}

fn print_banner(config: &ForgelineConfig) {
    let settings = config.pipeline_settings();
    println!();
    println!("  \x1b[1;36mforgeline\x1b[0m server starting");
    println!("  ─────────────────────────────────────");
    println!("  Local:      http://localhost:{}", config.server.port);
    println!("  Workspaces: {}", settings.workspace_root.display());
    if config.ai.api_key.is_none() {
        println!("  Warning:    no API key (set FORGELINE_API_KEY); AI stages will fail");
    }
    println!();
}
