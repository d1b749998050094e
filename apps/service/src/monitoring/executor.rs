use std::sync::Arc;

use chrono::Utc;

use super::checker::PingProvider;
use super::types::{ArpOutcome, PingType, ProbeKind, ProbeResult};

/// Probe executor - runs the probes one tick of a device calls for
pub struct ProbeExecutor {
    provider: Arc<dyn PingProvider>,
}

impl ProbeExecutor {
    /// Create a new probe executor
    pub fn new(provider: Arc<dyn PingProvider>) -> Self {
        Self { provider }
    }

    /// Probe `ip` according to `ping_type`.
    ///
    /// ICMP always yields a result. ARP yields nothing when the host cannot
    /// send ARP requests.
    pub async fn execute(
        &self,
        device_id: i64,
        ip: &str,
        ping_type: PingType,
        packet_size: u16,
    ) -> Vec<ProbeResult> {
        let mut results = Vec::with_capacity(2);

        if ping_type.uses_icmp() {
            let probe = self.provider.probe_icmp(ip, packet_size).await;
            results.push(ProbeResult::new(device_id, ProbeKind::Icmp, probe, Utc::now()));
        }

        if ping_type.uses_arp() {
            if let ArpOutcome::Probed(probe) = self.provider.probe_arp(ip).await {
                results.push(ProbeResult::new(device_id, ProbeKind::Arp, probe, Utc::now()));
            }
        }

        results
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{ScriptedProvider, Step};
    use super::*;
    use crate::monitoring::types::Probe;

    #[tokio::test]
    async fn test_icmp_only_device() {
        let executor = ProbeExecutor::new(Arc::new(ScriptedProvider::new(Step::Lost)));

        let results = executor.execute(7, "10.0.0.1", PingType::Icmp, 64).await;

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].device_id, 7);
        assert_eq!(results[0].ping_type, ProbeKind::Icmp);
        assert!(results[0].packet_lost);
        assert!(results[0].latency_ms.is_none());
    }

    #[tokio::test]
    async fn test_unavailable_arp_is_skipped() {
        let provider = Arc::new(ScriptedProvider::new(Step::Reply));
        let executor = ProbeExecutor::new(provider.clone());

        assert!(executor.execute(1, "10.0.0.1", PingType::Arp, 64).await.is_empty());

        let both = executor.execute(1, "10.0.0.1", PingType::Both, 64).await;
        assert_eq!(both.len(), 1);
        assert_eq!(both[0].ping_type, ProbeKind::Icmp);
    }

    #[tokio::test]
    async fn test_both_probes_when_arp_works() {
        let provider = Arc::new(ScriptedProvider::new(Step::Lost));
        provider.set_arp(ArpOutcome::Probed(Probe::reply(0.3)));
        let executor = ProbeExecutor::new(provider);

        let results = executor.execute(2, "10.0.0.2", PingType::Both, 64).await;

        assert_eq!(results.len(), 2);
        assert!(results[0].packet_lost);
        assert_eq!(results[1].ping_type, ProbeKind::Arp);
        assert!(results[1].succeeded());
    }
}
