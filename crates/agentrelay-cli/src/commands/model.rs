use anyhow::Result;

use agentrelay_core::BackendKind;

use crate::cli::ModelArgs;
use crate::commands::utils::parse_context;
use crate::output::{OutputFormat, json::print_json};
use crate::setup::Relay;

pub async fn run(relay: Relay, args: ModelArgs, format: OutputFormat) -> Result<()> {
    let model = args
        .model
        .map(|m| m.trim().to_string())
        .filter(|m| !m.is_empty());

    let scope = if args.global {
        relay.orchestrator.set_global_model(model.clone()).await?;
        "global".to_string()
    } else {
        let context = parse_context(&args.context.context)?;
        relay.orchestrator.set_model(&context, model.clone()).await?;
        context.key()
    };

    if format.is_json() {
        return print_json(&serde_json::json!({
            "scope": scope,
            "model": model,
            "backend": model.as_deref().map(|m| BackendKind::for_model(m).as_str()),
        }));
    }

    match model {
        Some(model) => println!(
            "Model for {scope} set to {model} ({} backend)",
            BackendKind::for_model(&model)
        ),
        None => println!("Model override for {scope} cleared"),
    }
    Ok(())
}
