//! # Get Started
//!
//! Every subcommand talks to the TPM named by `--tpm-path`, a device file or
//! a TCTI string. Against a simulator:
//! ```bash
//! tpm-tools -T mssim:host=localhost,port=2321 create-srk
//! ```
//!
//! Sealing needs the resident storage key printed above:
//! ```bash
//! tpm-tools seal --parent-handle 80000000 --object-password sesame \
//!     --data 68656c6c6f --pcr 7 --private-path s.priv --public-path s.pub
//! tpm-tools load --parent-handle 80000000 --private-path s.priv --public-path s.pub
//! tpm-tools unseal --object-handle 80000001 --object-password sesame \
//!     --pcr 7 --output-path secret
//! ```
//!
//! The library builds without the native TSS stack; enable the `esapi` feature
//! for the device backend and the binary.

pub mod blob;
pub mod cli;
pub mod command;
pub mod config;
pub mod error;
pub mod tpm;
