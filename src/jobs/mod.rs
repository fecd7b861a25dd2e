pub mod latest_price_batcher;
pub mod outlier_detection_job;
pub mod view_refresh_job;
