//! The MD dataflow units layered on the graph runtime.

pub mod compute;
pub mod control;
pub mod motion;
pub mod mux;
pub mod position_read;
pub mod velocity;

pub use compute::{ComputePipeline, ForcePipeline, PairQueue, ParticleFilter, PipelineReader};
pub use control::{ControlUnit, Phase};
pub use motion::{PositionUpdateController, PositionUpdater};
pub use mux::CacheMux;
pub use position_read::{PositionReadController, PositionReader};
pub use velocity::{
    VelocityIntegrateController, VelocityIntegrator, VelocityUpdateController, VelocityUpdater,
};
