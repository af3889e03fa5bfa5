//! Per-service resolvers.

pub mod dlhd;
pub mod generic;
pub mod mixdrop;
pub mod sportsonline;
pub mod streamtape;
pub mod vavoo;
pub mod vixsrc;
pub mod voe;

pub use dlhd::DlhdResolver;
pub use generic::GenericResolver;
pub use mixdrop::MixdropResolver;
pub use sportsonline::SportsonlineResolver;
pub use streamtape::StreamtapeResolver;
pub use vavoo::VavooResolver;
pub use vixsrc::VixSrcResolver;
pub use voe::VoeResolver;
