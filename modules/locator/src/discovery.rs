//! One discovery run: same-origin shortcut, cached endpoint, then two-phase probing.

use discovery_cache::DiscoveryCache;
use probe::HealthProbe;
use signance_core::{
    Candidate, CandidateConfig, EndpointSource, LocatorError, NetworkConfig, PageContext, ResolvedEndpoint,
};
use std::sync::Arc;
use tracing::{info, warn};

pub(crate) struct DiscoveryRun {
    pub(crate) context: PageContext,
    pub(crate) network: NetworkConfig,
    pub(crate) candidates: CandidateConfig,
    pub(crate) probe: Arc<dyn HealthProbe>,
    pub(crate) cache: DiscoveryCache,
}

impl DiscoveryRun {
    pub(crate) async fn execute(self) -> Result<ResolvedEndpoint, LocatorError> {
        if self.context.same_origin {
            let ep = ResolvedEndpoint::same_origin(&self.context);
            info!(base_url = %ep.base_url, "served from the backend; using page origin");
            return Ok(ep);
        }

        let mut already_tried: Option<Candidate> = None;
        if let Some(cached) = self.cache.read() {
            if self.probe.probe(&cached.host, cached.port).await {
                return Ok(self.confirm(&cached.host, cached.port, EndpointSource::Cache));
            }
            info!(base_url = %cached.base_url, "cached backend does not answer; rediscovering");
            self.cache.clear();
            already_tried = Some(Candidate::new(cached.host, cached.port));
        }

        let hosts = candidates::generate(&self.context, &self.candidates);
        let plan = candidates::plan(hosts, self.network.preferred_port, self.network.port_range);
        if plan.len() > self.network.max_probes {
            warn!(planned = plan.len(), limit = self.network.max_probes, "too many candidates; aborting discovery");
            return Err(LocatorError::TooManyProbes { planned: plan.len(), limit: self.network.max_probes });
        }

        info!(hosts = plan.hosts().len(), port = plan.preferred_port(), "probing preferred port");
        for c in plan.phase_one() {
            if already_tried.as_ref() == Some(&c) {
                continue;
            }
            if self.probe.probe(&c.host, c.port).await {
                return Ok(self.confirm(&c.host, c.port, EndpointSource::Discovered));
            }
        }

        info!(hosts = plan.hosts().len(), range = %self.network.port_range, "preferred port silent; probing port range");
        for c in plan.phase_two() {
            if already_tried.as_ref() == Some(&c) {
                continue;
            }
            if self.probe.probe(&c.host, c.port).await {
                return Ok(self.confirm(&c.host, c.port, EndpointSource::Discovered));
            }
        }

        let err = LocatorError::DiscoveryExhausted {
            hosts: plan.hosts().to_vec(),
            preferred_port: self.network.preferred_port,
            port_range: self.network.port_range,
            probes: plan.len(),
        };
        warn!(error = %err, "discovery exhausted");
        Err(err)
    }

    fn confirm(&self, host: &str, port: u16, source: EndpointSource) -> ResolvedEndpoint {
        if let Err(e) = self.cache.write(host, port) {
            warn!(error = %e, "could not persist discovered backend");
        }
        let ep = ResolvedEndpoint::probed(host, port, source);
        info!(base_url = %ep.base_url, source = %source, "backend resolved");
        ep
    }
}
