//! dank: content acquisition for X timelines and RSS/Atom feeds.
//!
//! Crawlers in [`scrapers`] turn browser network traffic and feed documents
//! into batches of posts and asset discoveries; [`services`] buffers those
//! batches, downloads assets, and writes rows through [`storage`].

pub mod browser;
pub mod config;
pub mod logging;
pub mod models;
pub mod otp;
pub mod scrapers;
pub mod services;
pub mod storage;
