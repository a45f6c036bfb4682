//! Capture, fan-out, delivery and retry for hookwire.
//!
//! A mutation is captured as a message. Processing resolves the listeners
//! interested in the subject's current state, serializes the subject once
//! and fans the payload out into one task per listener, each with its own
//! attempt counter. The first attempt happens during fan-out; later ones
//! are made by the retry sweeper until the registration's attempt ceiling
//! is reached, after which the task is given up.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use hookwire_core::{
//!     InMemorySubjects, NoOpEventHandler, RealClock, WebhookConfig, WebhookRegistry,
//! };
//! use hookwire_delivery::{storage::memory::InMemoryDeliveryStorage, DeliveryConfig, DeliveryEngine};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut builder = WebhookRegistry::builder();
//! builder.register(["article"], WebhookConfig::new(["title", "status"]).max_attempts(3))?;
//!
//! let engine = DeliveryEngine::new(
//!     Arc::new(InMemoryDeliveryStorage::new()),
//!     Arc::new(InMemorySubjects::new()),
//!     Arc::new(builder.build()),
//!     Arc::new(NoOpEventHandler),
//!     Arc::new(RealClock),
//!     DeliveryConfig::default(),
//! )?;
//!
//! let report = engine.run_once().await?;
//! println!("fanned out {} messages", report.processing.fanned_out());
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod capture;
pub mod client;
pub mod engine;
pub mod error;
pub mod processor;
pub mod resolver;
pub mod storage;
pub mod sweeper;
pub mod worker;

pub use capture::EventCapture;
pub use client::{ClientConfig, DeliveryClient};
pub use engine::{BatchReport, DeliveryConfig, DeliveryEngine};
pub use error::{DeliveryError, Result};
pub use processor::{DiscardReason, MessageProcessor, ProcessOutcome, ProcessReport};
pub use resolver::{select_listeners, ListenerResolver};
pub use storage::{DeliveryStorage, PostgresDeliveryStorage};
pub use sweeper::{RetrySweeper, SweepReport};
pub use worker::DeliveryWorker;
