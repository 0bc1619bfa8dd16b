//! # awskit-aws – AWS capabilities for the awskit dispatcher
//!
//! Implements [`awskit_core::ServiceCapability`] for each supported service by
//! building a signed HTTPS request, sending it once and normalizing the
//! response into snake_case JSON. Retries, pagination and credential refresh
//! stay in the core dispatcher.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────┐
//! │  AwsCapability  (capability.rs)                  │
//! │  └── per-service build / parse:                  │
//! │       ec2 · s3 · lambda · rds · iam              │
//! │       cloudwatch · sts                           │
//! ├──────────────────────────────────────────────────┤
//! │  AwsClient  (client.rs)                          │
//! │  └── single signed attempt, error parsing        │
//! ├──────────────────────────────────────────────────┤
//! │  SigV4Signer  (signing.rs, over aws-sigv4)       │
//! └──────────────────────────────────────────────────┘
//! ```
//!
//! ## API Protocols
//!
//! | Protocol    | Services                          |
//! |-------------|-----------------------------------|
//! | Query + XML | EC2, IAM, STS, CloudWatch, RDS    |
//! | REST + JSON | Lambda                            |
//! | REST + XML  | S3                                |

pub mod capability;
pub mod client;
pub mod error;
pub mod signing;
pub mod xml;

// Service request builders and response parsers
pub mod cloudwatch;
pub mod ec2;
pub mod iam;
pub mod lambda;
pub mod rds;
pub mod s3;
pub mod sts;

pub use capability::{capabilities, AwsCapability};
pub use client::{AwsClient, HttpRequest, HttpResponse};
pub use sts::StsTokenIssuer;
