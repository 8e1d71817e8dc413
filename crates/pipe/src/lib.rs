//! Vulkan-style graphics and compute pipelines translated onto Metal,
//! with a shared, serializable cache of converted shader libraries.
//!
//! Native compilation and shader conversion are reached through the
//! [`NativeCompiler`] and [`ShaderConverter`] traits. [`NagaConverter`]
//! covers stages that need no emulation.

mod binding;
mod cache;
mod compiler;
mod compute;
mod config;
mod converter;
mod desc;
mod device;
mod encode;
mod format;
mod from;
mod graphics;
mod layout;
mod msl;
pub mod native;
mod pipeline;
mod stage;

#[cfg(test)]
mod mock;

pub use self::{
    binding::*, cache::*, compiler::*, compute::*, config::*, converter::*, desc::*, device::*,
    encode::*, format::*, from::*, graphics::*, layout::*, msl::*, pipeline::*, stage::*,
};
