use anyhow::{Context, Result};
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::binance::client::parse_str_f64;
use crate::types::{normalize_symbol, Candle, KlineInterval, PartialCandle};

// ---------------------------------------------------------------------------
// Data types
// ---------------------------------------------------------------------------

/// A decoded continuous-kline frame.
#[derive(Debug, Clone, PartialEq)]
pub enum KlineEvent {
    /// The interval has closed; this is a candidate finalized candle.
    Closed(Candle),
    /// The interval is still forming.
    Forming(PartialCandle),
}

impl KlineEvent {
    pub fn symbol(&self) -> &str {
        match self {
            Self::Closed(c) => &c.symbol,
            Self::Forming(p) => &p.symbol,
        }
    }
}

/// Why a single connection's receive loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEnd {
    /// The server closed the socket, the stream ended or a read failed.
    Disconnected { frames: u64 },
    Cancelled,
}

// ---------------------------------------------------------------------------
// Kline WebSocket stream
// ---------------------------------------------------------------------------

/// Single-stream URL for the perpetual continuous-kline channel.
pub fn stream_url(ws_base_url: &str, symbol: &str, interval: KlineInterval) -> String {
    format!(
        "{}/ws/{}_perpetual@continuousKline_{}",
        ws_base_url.trim_end_matches('/'),
        symbol.to_lowercase(),
        interval
    )
}

/// Connect to `url` and forward every text frame to `frames`.
///
/// Runs until the socket closes or fails or `cancel` fires, then returns so
/// that the caller can reconnect. Only a failed connect or a closed frame
/// queue is an `Err`. Decoding happens on the consumer side so
/// that this loop only ever waits on the socket (or a full queue).
pub async fn run_kline_stream(
    url: &str,
    frames: &mpsc::Sender<String>,
    cancel: &CancellationToken,
) -> Result<StreamEnd> {
    info!(url = %url, "connecting to kline WebSocket");

    let (ws_stream, _response) = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Ok(StreamEnd::Cancelled),
        res = connect_async(url) => res.context("failed to connect to kline WebSocket")?,
    };

    info!(url = %url, "kline WebSocket connected");
    let (_write, mut read) = ws_stream.split();
    let mut received: u64 = 0;

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(StreamEnd::Cancelled),
            next = read.next() => next,
        };

        match next {
            Some(Ok(Message::Text(text))) => {
                received += 1;
                if frames.send(text).await.is_err() {
                    anyhow::bail!("kline frame queue closed");
                }
            }
            Some(Ok(Message::Close(frame))) => {
                warn!(url = %url, frame = ?frame, "kline WebSocket closed by server");
                return Ok(StreamEnd::Disconnected { frames: received });
            }
            // Ping / Pong / Binary frames -- tungstenite answers pings itself.
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                error!(url = %url, error = %e, frames = received, "kline WebSocket read error");
                return Ok(StreamEnd::Disconnected { frames: received });
            }
            None => {
                warn!(url = %url, "kline WebSocket stream ended");
                return Ok(StreamEnd::Disconnected { frames: received });
            }
        }
    }
}

/// Parse a continuous-kline message.
///
/// Expected shape (single stream; a combined-stream `data` wrapper is also
/// accepted):
/// ```json
/// { "e": "continuous_kline", "E": 1607443058651, "ps": "BTCUSDT",
///   "ct": "PERPETUAL", "k": { "t": 1607443020000, "i": "1m", "o": "18787.00",
///   "h": "18804.04", "l": "18786.54", "c": "18804.04", "v": "197.664",
///   "x": false } }
/// ```
pub fn parse_kline_event(text: &str) -> Result<KlineEvent> {
    let root: serde_json::Value =
        serde_json::from_str(text).context("failed to parse kline JSON")?;

    let data = if root.get("data").is_some() {
        &root["data"]
    } else {
        &root
    };

    let symbol = data["ps"]
        .as_str()
        .or_else(|| data["s"].as_str())
        .context("missing field ps")?;
    let symbol = normalize_symbol(symbol);

    let event_time = data["E"].as_i64().context("missing field E")?;

    let k = &data["k"];
    let open_time = k["t"].as_i64().context("missing field k.t")?;
    let open = parse_str_f64(&k["o"]).context("bad field k.o")?;
    let high = parse_str_f64(&k["h"]).context("bad field k.h")?;
    let low = parse_str_f64(&k["l"]).context("bad field k.l")?;
    let close = parse_str_f64(&k["c"]).context("bad field k.c")?;
    let volume = parse_str_f64(&k["v"]).context("bad field k.v")?;
    let is_closed = k["x"].as_bool().context("missing field k.x")?;

    debug!(symbol = %symbol, open_time, closed = is_closed, "kline event decoded");

    Ok(if is_closed {
        KlineEvent::Closed(Candle {
            symbol,
            open_time,
            open,
            high,
            low,
            close,
            volume,
        })
    } else {
        KlineEvent::Forming(PartialCandle {
            symbol,
            open_time,
            open,
            high,
            low,
            close,
            volume,
            event_time,
        })
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Continuous-kline frame as the exchange sends it.
    pub(crate) fn frame(symbol: &str, open_time: i64, event_time: i64, close: f64, closed: bool) -> String {
        serde_json::json!({
            "e": "continuous_kline",
            "E": event_time,
            "ps": symbol,
            "ct": "PERPETUAL",
            "k": {
                "t": open_time,
                "T": open_time + 59_999,
                "i": "1m",
                "f": 1, "L": 2,
                "o": "100.00",
                "h": format!("{:.2}", close.max(100.0)),
                "l": format!("{:.2}", close.min(100.0)),
                "c": format!("{close:.2}"),
                "v": "12.5",
                "n": 3,
                "x": closed,
                "q": "0", "V": "0", "Q": "0", "B": "0"
            }
        })
        .to_string()
    }

    #[test]
    fn url_uses_lowercase_pair_and_interval() {
        assert_eq!(
            stream_url("wss://fstream.binance.com/", "BTCUSDT", KlineInterval::Min1),
            "wss://fstream.binance.com/ws/btcusdt_perpetual@continuousKline_1m"
        );
    }

    #[test]
    fn forming_frame_becomes_partial() {
        let ev = parse_kline_event(&frame("BTCUSDT", 1_700_000_040_000, 1_700_000_050_123, 101.5, false)).unwrap();
        match ev {
            KlineEvent::Forming(p) => {
                assert_eq!(p.symbol, "BTCUSDT");
                assert_eq!(p.open_time, 1_700_000_040_000);
                assert_eq!(p.event_time, 1_700_000_050_123);
                assert!((p.close - 101.5).abs() < 1e-9);
            }
            other => panic!("expected forming event, got {other:?}"),
        }
    }

    #[test]
    fn closed_frame_becomes_candle() {
        let ev = parse_kline_event(&frame("BTCUSDT", 1_700_000_040_000, 1_700_000_100_000, 99.0, true)).unwrap();
        match ev {
            KlineEvent::Closed(c) => {
                assert_eq!(c.open_time, 1_700_000_040_000);
                assert!((c.low - 99.0).abs() < 1e-9);
                assert!((c.volume - 12.5).abs() < 1e-9);
            }
            other => panic!("expected closed event, got {other:?}"),
        }
    }

    #[test]
    fn combined_envelope_is_accepted() {
        let inner: serde_json::Value =
            serde_json::from_str(&frame("ETHUSDT", 60_000, 61_000, 100.0, false)).unwrap();
        let wrapped = serde_json::json!({ "stream": "ethusdt_perpetual@continuousKline_1m", "data": inner });
        let ev = parse_kline_event(&wrapped.to_string()).unwrap();
        assert_eq!(ev.symbol(), "ETHUSDT");
    }

    #[test]
    fn malformed_frames_are_errors() {
        assert!(parse_kline_event("not json").is_err());
        assert!(parse_kline_event(r#"{"result":null,"id":1}"#).is_err());
        let mut v: serde_json::Value =
            serde_json::from_str(&frame("BTCUSDT", 60_000, 61_000, 100.0, false)).unwrap();
        v["k"]["c"] = serde_json::json!("abc");
        assert!(parse_kline_event(&v.to_string()).is_err());
    }
}
