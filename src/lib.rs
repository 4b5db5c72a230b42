//! # a3s-inbox
//!
//! Multi-channel inbound message normalization for the A3S ecosystem.
//!
//! ## Overview
//!
//! `a3s-inbox` receives webhooks from email, Slack and Twilio (SMS and
//! WhatsApp), verifies them, and normalizes every payload into one
//! Contact / Conversation / Message model. Messages are deduplicated on
//! their platform id and threaded per contact. Third-party credentials
//! are encrypted at rest and refreshed on demand, and analytics from
//! connected ad platforms are merged into a single audience context.
//!
//! ## Quick Start
//!
//! ```rust
//! use a3s_inbox::{Aes256GcmCipher, InboxService, MemoryStore};
//! use std::sync::Arc;
//!
//! # fn example() -> a3s_inbox::Result<()> {
//! let service = InboxService::builder(Arc::new(Aes256GcmCipher::new("k1", &[7u8; 32])))
//!     .store(Arc::new(MemoryStore::new()))
//!     .build()?;
//! let app = a3s_inbox::http::build_app(Arc::new(service));
//! # let _ = app;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - **ChannelProvider** trait: verify, parse, send and probe one channel
//! - **Ingestor**: resolve contact and conversation, dedup, append, classify
//! - **CredentialVault**: AEAD-sealed credentials with single-flight refresh
//! - **AudienceContextAggregator**: parallel analytics fetch and merge
//! - **Store** traits: storage contracts with an in-memory implementation

pub mod audience;
pub mod channels;
pub mod classify;
pub mod config;
pub mod credential;
pub mod crypto;
pub mod error;
pub mod events;
pub mod http;
pub mod ingest;
pub mod oauth;
pub mod resolver;
pub mod service;
pub mod store;
pub mod telemetry;
pub mod types;
pub mod vault;

// Re-export core types
pub use audience::{AnalyticsSource, AudienceContext, AudienceContextAggregator};
pub use channels::{
    ChannelConfig, ChannelProvider, ChannelRegistry, ConnectionTest, Integration,
    OutboundMessage, SendResult, WebhookEvent, WebhookRequest, WebhookResponse,
};
pub use config::InboxConfig;
pub use credential::{Credential, CredentialPayload, DecryptedCredential, ProviderType};
pub use crypto::{Aes256GcmCipher, CredentialCipher};
pub use error::{ErrorKind, InboxError, Result};
pub use events::{BroadcastSink, EventSink, InboxEvent};
pub use ingest::{IngestOutcome, Ingestor};
pub use resolver::ContactConversationResolver;
pub use service::{InboxService, InboxServiceBuilder};
pub use store::{MemoryStore, Store};
pub use types::{
    Contact, Conversation, Direction, Message, MessageStatus, ParsedMessage, Platform, Priority,
    Provider,
};
pub use vault::CredentialVault;
