//! Output formatting for run reports.
//!
//! Supports both human-readable and JSON output formats for
//! integration with scripts and other tools.

use vault_handler::unseal::NodeOutcome;
use vault_handler::unseal::NodeReport;
use vault_handler::unseal::RunReport;

/// Trait for types that can be output in multiple formats.
pub trait Outputable {
    /// Convert to JSON value for structured output.
    fn to_json(&self) -> serde_json::Value;

    /// Convert to human-readable string.
    fn to_human(&self) -> String;
}

/// Print a value in the appropriate format.
pub fn print_output<T: Outputable>(value: &T, json: bool) {
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&value.to_json())
                .unwrap_or_else(|e| { format!("{{\"error\": \"failed to serialize: {}\"}}", e) })
        );
    } else {
        println!("{}", value.to_human());
    }
}

impl Outputable for RunReport {
    fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_else(|e| serde_json::json!({ "error": e.to_string() }))
    }

    fn to_human(&self) -> String {
        if self.nodes.is_empty() {
            return "No nodes processed".to_string();
        }

        let mut output = String::from("Node       State                               Outcome\n");
        output.push_str("---------- ----------------------------------- ------------------------------\n");
        for node in &self.nodes {
            output.push_str(&format!(
                "{:<10} {:<35} {}\n",
                node.node,
                format!("{:?}", node.initial_state),
                describe(node)
            ));
        }
        output.push_str(&format!("\n{} node(s) processed", self.nodes.len()));
        output
    }
}

fn describe(node: &NodeReport) -> String {
    let mut text = match &node.outcome {
        NodeOutcome::AlreadyUnsealed => "already unsealed".to_string(),
        NodeOutcome::AlreadyInitialized => "already initialized".to_string(),
        NodeOutcome::Initialized => "initialized".to_string(),
        NodeOutcome::Bootstrapped { .. } => "initialized and unsealed".to_string(),
        NodeOutcome::Recovered { .. } => "unsealed from persisted record".to_string(),
        NodeOutcome::Unsealed { .. } => "unsealed".to_string(),
        NodeOutcome::Joined { unseal: Some(_) } => "joined and unsealed".to_string(),
        NodeOutcome::Joined { unseal: None } => "joined".to_string(),
    };
    if let Some(progress) = node.outcome.unseal_progress() {
        if progress.shares_submitted > 0 {
            text.push_str(&format!(" ({} shares)", progress.shares_submitted));
        }
        if !progress.unconfirmed_shares.is_empty() {
            text.push_str(&format!(", unconfirmed: {:?}", progress.unconfirmed_shares));
        }
    }
    text
}
