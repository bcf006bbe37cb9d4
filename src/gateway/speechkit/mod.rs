pub mod client;
pub mod types;

pub use client::SpeechKitClient;
