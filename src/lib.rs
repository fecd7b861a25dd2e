// src/lib.rs

pub mod config;
pub mod error;

pub mod entities {
    pub mod prelude;
    pub mod asset;
    pub mod tx;
    pub mod price;
    pub mod candle_weekly;
    pub mod candle_daily;
    pub mod candle_hourly;
    pub mod candle_fifteen;
}

pub mod models {
    pub mod chain;
    pub mod swap;
    pub mod candle;
    pub mod event;
}

pub mod services {
    pub mod slot_time;
    pub mod datum;
    pub mod classifier;
    pub mod chain_db;
    pub mod token_metadata;
    pub mod storage;
    pub mod swap_processor;
    pub mod price_processor;
    pub mod candle_service;
    pub mod latest_prices;
    pub mod outlier;
    pub mod pipeline;
    pub mod node_client;
    pub mod ogmios;
    pub mod chain_sync;
    pub mod publisher;
    pub mod monitoring;
}

pub mod jobs;
