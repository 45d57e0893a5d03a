//! Vision-driven automation of legacy Windows applications over a remote
//! desktop session, scripted in the MBL task language.
//!
//! The pipeline: MBL text -> [`mbl::lexer`] -> [`mbl::parser`] ->
//! [`mbl::validator`] -> [`engine::TaskEngine`], which at each action
//! captures a screenshot, asks the vision model about it using the
//! [`protocol`] prompt/reply mini-language, and drives the remote desktop
//! through a [`remote::RemoteDesktopController`].

pub mod config;
pub mod engine;
pub mod errors;
pub mod logging;
pub mod mbl;
pub mod protocol;
pub mod remote;
pub mod server;
pub mod vision;
