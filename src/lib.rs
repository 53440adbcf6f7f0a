mod account;
mod authorization;
mod bootstrap;
mod cache;
mod client;
mod csr;
mod directory;
mod eab;
mod error;
mod helpers;
mod http;
mod input;
mod jws;
mod order;
mod order_manager;
mod policy;
mod protect;
mod session;
mod settings;
mod signer;

pub use account::*;
pub use authorization::*;
pub use bootstrap::normalize_contacts;
pub use bootstrap::Bootstrapper;
pub use cache::fingerprint;
pub use cache::CachedOrder;
pub use cache::OrderCache;
pub use client::*;
pub use csr::*;
pub use directory::*;
pub use eab::*;
pub use error::*;
pub use helpers::gen_ec_p256_private_key;
pub use helpers::gen_ec_p384_private_key;
pub use helpers::gen_rsa_private_key;
pub use helpers::Identifier;
pub use helpers::IdentifierType;
pub use http::HttpClientFactory;
pub use input::*;
pub use jws::FlattenedJws;
pub use jws::Jwk;
pub use jws::JwsTool;
pub use order::*;
pub use order_manager::*;
pub use protect::Protector;
pub use session::Session;
pub use settings::*;
pub use signer::*;
