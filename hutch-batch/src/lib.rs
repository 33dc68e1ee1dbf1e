//! Workflows for the institutional AWS Batch environment.
//!
//! Below are the main areas of the crate.
//!
//! ## Configuration
//! * [`config::Config`], the yaml configuration file.
//! * [`config::Settings`], the configuration resolved against the active AWS account. Every workflow takes one.
//!
//! ## Provisioning
//! * [`lifecycle`], fixed-interval polling of a resource until it reaches a target state.
//! * [`remote`], running a fixed provisioning script on a freshly created instance over ssh.
//! * [`ami`], building the scratch-enabled AMI.
//! * [`batch::environment`], bootstrapping and tearing down a compute environment, queue and job definition.
//!
//! ## Jobs
//! * [`batch::template`] and [`batch::strategy`], constructing job templates.
//! * [`batch::submit`], submitting groups of jobs.
//! * [`batch::jobs`], listing jobs.
//! * [`logs`], reading a job's log output.
//!
//! ## Users
//! * [`onboarding`], adding a user to the IAM groups, roles and policies of their PI.

// Results are printed by the binaries, logs must not be interleaved with them.
#![deny(clippy::print_stdout)]
#![deny(clippy::print_stderr)]

pub mod ami;
pub mod aws;
pub mod batch;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod logs;
pub mod onboarding;
pub mod remote;
pub mod runner;
