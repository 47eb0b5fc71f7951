//! # keyward-cli
//!
//! Command-line front end for `keyward-security`.
//!
//! This crate provides the `keyward` binary with the following commands:
//!
//! | Command | Description |
//! |---------|-------------|
//! | `keyward verify [TOKEN]` | Verify an ID token and print its claims |
//! | `keyward keys` | List the signing keys the provider publishes |
//!
//! Both commands read provider settings from `--config` (or `keyward.yaml`
//! in the working directory), `.env`, and `KEYWARD_*` variables;
//! `--jwks-uri` overrides all of them.

pub mod commands;
