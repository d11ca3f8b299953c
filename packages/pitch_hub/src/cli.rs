//! Client-side subcommands that talk to a running hub.

use anyhow::{Context, Result};

use crate::config::{FileConfig, ServerFileConfig};
use crate::hub::state::HubStats;

/// Base URL of the hub described by `server`. Wildcard binds are reached over loopback.
pub fn hub_base_url(server: &ServerFileConfig) -> String {
    let host = match server.host.as_str() {
        "0.0.0.0" | "::" | "" => "127.0.0.1",
        host => host,
    };
    format!("http://{}:{}", host, server.port)
}

/// Fetch `GET /stats` and print it.
pub async fn stats_command(base_url: &str, json: bool) -> Result<()> {
    let url = format!("{}/stats", base_url.trim_end_matches('/'));
    let resp = reqwest::get(&url)
        .await
        .with_context(|| format!("Failed to reach hub at {}", base_url))?
        .error_for_status()
        .context("Hub returned an error")?;

    let stats: HubStats = resp.json().await.context("Malformed stats response")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
    } else {
        print!("{}", format_stats(&stats));
    }

    Ok(())
}

fn format_stats(stats: &HubStats) -> String {
    let mut out = String::new();
    out.push_str(&format!("{:<20} {}\n", "connections", stats.total_connections));
    out.push_str(&format!("{:<20} {}\n", "unique users", stats.unique_users));
    out.push_str(&format!("{:<20} {}\n", "queued messages", stats.queued_messages));
    out.push_str(&format!(
        "{:<20} {} online, {} away\n",
        "presence", stats.presence.online, stats.presence.away
    ));
    out.push_str(&format!(
        "{:<20} {} creator, {} investor, {} production\n",
        "portals", stats.portals.creator, stats.portals.investor, stats.portals.production
    ));
    out
}

/// Print the effective configuration (defaults, config.toml and env merged) as TOML.
pub fn config_command(config: &FileConfig) -> Result<()> {
    let rendered = toml::to_string_pretty(config).context("Failed to render config")?;
    print!("{}", rendered);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::presence::PresenceCounts;
    use crate::hub::registry::PortalCounts;

    #[test]
    fn test_hub_base_url() {
        let mut server = ServerFileConfig::default();
        assert_eq!(hub_base_url(&server), "http://127.0.0.1:8787");

        server.host = "0.0.0.0".into();
        server.port = 9000;
        assert_eq!(hub_base_url(&server), "http://127.0.0.1:9000");

        server.host = "hub.internal".into();
        assert_eq!(hub_base_url(&server), "http://hub.internal:9000");
    }

    #[test]
    fn test_format_stats() {
        let stats = HubStats {
            total_connections: 3,
            unique_users: 2,
            queued_messages: 5,
            presence: PresenceCounts { online: 1, away: 1 },
            portals: PortalCounts {
                creator: 2,
                investor: 1,
                production: 0,
            },
        };
        let text = format_stats(&stats);
        assert!(text.contains("connections          3"));
        assert!(text.contains("1 online, 1 away"));
        assert!(text.contains("2 creator, 1 investor, 0 production"));
    }

    #[test]
    fn test_default_config_renders_as_toml() {
        let rendered = toml::to_string_pretty(&FileConfig::default()).unwrap();
        assert!(rendered.contains("[server]"));
        assert!(rendered.contains("[hub]"));
        assert!(rendered.contains("queue_capacity = 100"));
    }
}
