use std::time::{SystemTime, UNIX_EPOCH};

use crate::config::RelayConfig;

/// Per-call client identity consumed opaquely by the upstream header set.
#[derive(Debug, Clone)]
pub struct Fingerprint {
    pub user_agent: String,
    pub source_ip: String,
}

impl Fingerprint {
    pub fn random(config: &RelayConfig) -> Self {
        let mut bytes = [0u8; 5];
        if getrandom::fill(&mut bytes).is_err() {
            // clock-derived fallback when the OS RNG is unavailable
            let nanos = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|duration| duration.subsec_nanos())
                .unwrap_or(0);
            for (idx, slot) in bytes.iter_mut().enumerate() {
                *slot = (nanos >> (idx * 6)) as u8;
            }
        }

        let source_ip = format!("{}.{}.{}.{}", bytes[0], bytes[1], bytes[2], bytes[3]);
        let user_agent = if config.user_agents.is_empty() {
            String::new()
        } else {
            config.user_agents[bytes[4] as usize % config.user_agents.len()].clone()
        };

        Self {
            user_agent,
            source_ip,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_ip_is_a_valid_ipv4_literal() {
        let fingerprint = Fingerprint::random(&RelayConfig::default());
        assert!(fingerprint.source_ip.parse::<std::net::Ipv4Addr>().is_ok());
    }

    #[test]
    fn user_agent_comes_from_the_configured_pool() {
        let config = RelayConfig::default();
        let fingerprint = Fingerprint::random(&config);
        assert!(config.user_agents.contains(&fingerprint.user_agent));
    }

    #[test]
    fn empty_pool_yields_empty_user_agent() {
        let config = RelayConfig {
            user_agents: Vec::new(),
            ..RelayConfig::default()
        };
        let fingerprint = Fingerprint::random(&config);
        assert!(fingerprint.user_agent.is_empty());
    }
}
