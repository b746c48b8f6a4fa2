//! Transparent managed-memory interposer for the HIP runtime.
//!
//! On platforms where the runtime's managed allocator is unreliable or
//! absent, this library emulates managed memory: host-side allocations are
//! paired with explicit device allocations, kernel launch arguments are
//! rewritten so the GPU only ever sees the device side, and host accesses to
//! stale ranges are trapped through page protection and satisfied with a
//! device-to-host write-back.
//!
//! Built as a cdylib and injected ahead of the runtime:
//!
//! ```text
//! UTPX_MODE=MIRROR LD_PRELOAD=libutpx.so <application>
//! ```
//!
//! `UTPX_MODE` selects the coherence strategy (`ADVISE`, `DEVICE` or the
//! default `MIRROR`); `UTPX_LOG` takes a tracing filter directive. The
//! interposer never exits the process: operations either propagate the
//! underlying runtime's status unchanged or abort on unrecoverable state.

pub mod error;
pub mod fault;
pub mod hip;
pub mod hsa;
pub mod hsaco;
pub mod intercept;
pub mod mirror;
pub mod runtime;
