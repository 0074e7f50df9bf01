use anyhow::Result;

use crate::cli::ContextArgs;
use crate::commands::utils::parse_context;
use crate::output::{OutputFormat, json::print_json};
use crate::setup::Relay;

pub async fn run(relay: Relay, args: ContextArgs, format: OutputFormat) -> Result<()> {
    let context = parse_context(&args.context)?;
    let existed = relay.orchestrator.reset_context(&context).await?;

    if format.is_json() {
        return print_json(&serde_json::json!({
            "context": context.key(),
            "reset": existed,
        }));
    }

    if existed {
        println!("Context {context} reset. The next run starts a new session.");
    } else {
        println!("Context {context} had no stored state.");
    }
    Ok(())
}
