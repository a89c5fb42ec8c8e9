// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod otel;

pub mod breaker;
pub mod channel;
pub mod config;
pub mod connection;
pub mod delay;
pub mod dispatcher;
pub mod errors;
pub mod exchange;
pub mod forwarder;
pub mod handler;
pub mod message;
pub mod pump;
pub mod queue;
pub mod setup;
pub mod subscription;
pub mod topology;
