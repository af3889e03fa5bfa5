//! Resolver registry: one resolver per [`Service`], dispatched by an
//! exhaustive match.

use std::time::Instant;

use tracing::{debug, warn};

use super::request::{CacheKey, SourceRequest};
use super::resolver::{ResolvedStream, StreamResolver};
use super::resolvers::{
    DlhdResolver, GenericResolver, MixdropResolver, SportsonlineResolver, StreamtapeResolver,
    VavooResolver, VixSrcResolver, VoeResolver,
};
use super::Service;
use crate::config::CachePolicy;
use crate::error::Result;
use crate::http_client::UpstreamClient;

pub struct ResolverRegistry {
    generic: GenericResolver,
    vavoo: VavooResolver,
    dlhd: DlhdResolver,
    sportsonline: SportsonlineResolver,
    vixsrc: VixSrcResolver,
    voe: VoeResolver,
    streamtape: StreamtapeResolver,
    mixdrop: MixdropResolver,
}

impl ResolverRegistry {
    /// DLHD sessions live as long as DLHD cache entries.
    pub fn new(cache: &CachePolicy) -> Self {
        Self {
            generic: GenericResolver::new(),
            vavoo: VavooResolver::default(),
            dlhd: DlhdResolver::new(cache.ttl_for(Service::Dlhd)),
            sportsonline: SportsonlineResolver::new(),
            vixsrc: VixSrcResolver::new(),
            voe: VoeResolver::new(),
            streamtape: StreamtapeResolver::new(),
            mixdrop: MixdropResolver::new(),
        }
    }

    #[must_use]
    pub fn with_dlhd(mut self, dlhd: DlhdResolver) -> Self {
        self.dlhd = dlhd;
        self
    }

    #[must_use]
    pub fn with_vavoo(mut self, vavoo: VavooResolver) -> Self {
        self.vavoo = vavoo;
        self
    }

    pub fn resolver(&self, service: Service) -> &dyn StreamResolver {
        match service {
            Service::Generic => &self.generic,
            Service::Vavoo => &self.vavoo,
            Service::Dlhd => &self.dlhd,
            Service::Sportsonline => &self.sportsonline,
            Service::VixSrc => &self.vixsrc,
            Service::Voe => &self.voe,
            Service::Streamtape => &self.streamtape,
            Service::Mixdrop => &self.mixdrop,
        }
    }

    pub fn dlhd(&self) -> &DlhdResolver {
        &self.dlhd
    }

    /// Resolve with the request's service. Step failures become
    /// `ExtractionFailed`; nothing partial is returned.
    pub async fn resolve(&self, request: &SourceRequest, client: &UpstreamClient) -> Result<ResolvedStream> {
        let service = request.service;
        let started = Instant::now();
        debug!(service = %service, url = %request.url, "resolving source");

        match self.resolver(service).resolve(request, client).await {
            Ok(stream) => {
                debug!(
                    service = %service,
                    kind = stream.kind.as_str(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "source resolved"
                );
                Ok(stream)
            }
            Err(step) => {
                warn!(service = %service, stage = step.stage, cause = %step.cause, "extraction failed");
                Err(step.into_proxy_error(service))
            }
        }
    }

    /// Drop resolver-held state for a source (DLHD sessions).
    pub fn invalidate(&self, key: &CacheKey) {
        self.resolver(key.service()).invalidate(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_service_has_its_resolver() {
        let registry = ResolverRegistry::new(&CachePolicy::default());
        for service in Service::ALL {
            assert_eq!(registry.resolver(service).service(), service);
        }
    }

    #[test]
    fn test_dispatch_follows_detection() {
        let registry = ResolverRegistry::new(&CachePolicy::default());
        let cases = [
            ("https://vavoo.to/play/1/index.m3u8", Service::Vavoo),
            ("https://dlhd.dad/watch.php?id=51", Service::Dlhd),
            ("https://vixsrc.to/movie/550", Service::VixSrc),
            ("https://sportzonline.si/channels/hd/hd1.php", Service::Sportsonline),
            ("https://mixdrop.ag/f/abc", Service::Mixdrop),
            ("https://voe.sx/e/abc", Service::Voe),
            ("https://streamtape.com/e/abc", Service::Streamtape),
            ("https://cdn.example/live.m3u8", Service::Generic),
        ];
        for (url, expected) in cases {
            let request = SourceRequest::new(url);
            assert_eq!(registry.resolver(request.service).service(), expected, "{url}");
        }
    }

    #[tokio::test]
    async fn test_step_failure_becomes_extraction_failed() {
        let registry = ResolverRegistry::new(&CachePolicy::default());
        let client = UpstreamClient::new(&crate::config::ProxyConfig::default()).unwrap();
        // Port 9 on loopback refuses connections.
        let request = SourceRequest::new("http://127.0.0.1:9/e/abc").with_service(Service::Mixdrop);
        let err = registry.resolve(&request, &client).await.unwrap_err();
        match err {
            crate::ProxyError::ExtractionFailed { service, stage, .. } => {
                assert_eq!(service, Service::Mixdrop);
                assert_eq!(stage, "fetch embed page");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
