#![recursion_limit = "256"]

pub mod boxes;
pub mod cascade;
pub mod class_decoder;
pub mod config;
pub mod debug;
pub mod error;
pub mod inference;
pub mod labels;
pub mod layers;
pub mod models;
pub mod nms;
pub mod pooling;
