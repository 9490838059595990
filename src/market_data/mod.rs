pub mod kline_stream;
pub mod listener;

pub use listener::KlineListener;
