use anyhow::Result;
use comfy_table::Cell;

use crate::commands::utils::format_timestamp;
use crate::output::{OutputFormat, json::print_json, table};
use crate::setup::Relay;

pub async fn run(relay: Relay, format: OutputFormat) -> Result<()> {
    let contexts = relay.orchestrator.store().list().await?;

    if format.is_json() {
        let map: serde_json::Map<String, serde_json::Value> = contexts
            .into_iter()
            .map(|(key, record)| Ok((key, serde_json::to_value(record)?)))
            .collect::<Result<_>>()?;
        return print_json(&map);
    }

    if contexts.is_empty() {
        println!("No contexts yet.");
        return Ok(());
    }

    let mut table = table::new_table(&[
        "Context", "Messages", "Model", "Cost", "Tokens", "Heartbeat", "Updated",
    ]);
    for (key, record) in contexts {
        let heartbeat = match &record.heartbeat {
            Some(hb) if hb.enabled => format!("every {}m", hb.interval_ms / 60_000),
            Some(_) => "off".to_string(),
            None => "-".to_string(),
        };
        table.add_row(vec![
            Cell::new(key),
            Cell::new(record.message_count),
            Cell::new(record.model.as_deref().unwrap_or("(default)")),
            Cell::new(format!("${:.4}", record.total_cost_usd)),
            Cell::new(format!(
                "{} / {}",
                record.total_input_tokens, record.total_output_tokens
            )),
            Cell::new(heartbeat),
            Cell::new(format_timestamp(record.updated_at)),
        ]);
    }

    table::print_table(table)
}
