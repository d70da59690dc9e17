//! Proxy request pipeline and request fingerprints

mod fingerprint;
mod pipeline;

pub use fingerprint::fingerprint;
pub use pipeline::{
    FeatureFlags, PipelineConfig, ProxyPipeline, ProxyRequest, ProxyResponse,
};
