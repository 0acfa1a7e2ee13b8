// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod consumer;

pub mod backend;
pub mod config;
pub mod dispatcher;
pub mod envelope;
pub mod errors;
pub mod executor;
pub mod listener;
pub mod memory;
pub mod metrics;
pub mod otel;
pub mod publisher;
pub mod queue;
pub mod registry;
pub mod serialization;
#[cfg(feature = "sns-sqs")]
pub mod sns_sqs;
pub mod subscription;
pub mod topology;
