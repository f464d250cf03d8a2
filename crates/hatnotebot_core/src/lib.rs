//! Core library for the hatnote redlink cleanup bot.

pub mod cleanup;
pub mod config;
pub mod existence;
pub mod mediawiki;
pub mod redlink;
pub mod settings;
pub mod wikitext;
