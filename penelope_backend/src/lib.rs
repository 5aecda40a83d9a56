//! Penelope: a generation supervisor that lets a language model hesitate,
//! ponder, and think before it speaks.
//!
//! The model writes the answer token by token on a *speaking* transcript.
//! Low-confidence tokens are rejected and replaced by in-band markers that
//! ask for a cooler resample; when the temperature runs out, a reflection
//! episode on a separate *reflecting* transcript produces private thoughts
//! that are spliced back in before the answer resumes.

pub mod compute;
pub mod config;
pub mod cycle;
pub mod delivery;
pub mod engine;
pub mod error;
pub mod http_client;
pub mod policy;
pub mod reflection;
pub mod supervisor;
pub mod transcript;

pub use config::PenelopeConfig;
pub use error::{PenelopeError, PenelopeResult};
pub use supervisor::{ResponseStream, StreamToken, Supervisor, TurnReport};
